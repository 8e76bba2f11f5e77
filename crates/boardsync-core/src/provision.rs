use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::SyncResult;
use crate::gateway::RemoteGateway;
use crate::model::Board;

#[derive(Debug, Clone)]
struct CachedBoard {
    user_id: Uuid,
    board: Board,
}

/// Board new tasks land on when none is given. Cached per session; callers
/// queue on `gate` so one session never creates two default boards.
pub struct BoardProvisioner {
    gateway: Arc<dyn RemoteGateway>,
    current: Mutex<Option<CachedBoard>>,
    gate: tokio::sync::Mutex<()>,
}

impl BoardProvisioner {
    pub fn new(gateway: Arc<dyn RemoteGateway>) -> Self {
        Self {
            gateway,
            current: Mutex::new(None),
            gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn current(&self) -> Option<Board> {
        self.current.lock().as_ref().map(|c| c.board.clone())
    }

    pub fn select_board(&self, user_id: Uuid, board: Board) {
        debug!(board_id = %board.id, "selected board");
        *self.current.lock() = Some(CachedBoard { user_id, board });
    }

    pub fn clear(&self) {
        *self.current.lock() = None;
    }

    fn cached_for(&self, user_id: Uuid) -> Option<Board> {
        self.current
            .lock()
            .as_ref()
            .filter(|c| c.user_id == user_id)
            .map(|c| c.board.clone())
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_or_create_default_board(&self, user_id: Uuid) -> SyncResult<Board> {
        if let Some(board) = self.cached_for(user_id) {
            return Ok(board);
        }

        let _gate = self.gate.lock().await;

        // Whoever held the gate before us may have resolved it already.
        if let Some(board) = self.cached_for(user_id) {
            debug!(board_id = %board.id, "reusing board resolved by concurrent caller");
            return Ok(board);
        }

        let board = self.gateway.get_or_create_default_board(user_id).await?;
        info!(board_id = %board.id, name = %board.name, "default board resolved");

        *self.current.lock() = Some(CachedBoard {
            user_id,
            board: board.clone(),
        });
        Ok(board)
    }
}
