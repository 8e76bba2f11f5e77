pub mod memory;
pub mod rest;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::SyncResult;
use crate::model::{Board, NewBoard, NewTask, SubscriptionPlan, Task, TaskPatch};

pub use memory::MemoryGateway;
pub use rest::{RemoteConfig, RestGateway};

#[async_trait]
pub trait RemoteGateway: Send + Sync {
    /// Tasks owned by or shared with `user_id`, newest first.
    async fn list_tasks_for_user(&self, user_id: Uuid) -> SyncResult<Vec<Task>>;

    /// `board_id` is already resolved by the caller; `task.board_id` is ignored.
    async fn create_task(&self, user_id: Uuid, task: NewTask, board_id: Uuid) -> SyncResult<Task>;

    async fn update_task(&self, id: Uuid, patch: TaskPatch) -> SyncResult<Task>;

    async fn delete_task(&self, id: Uuid) -> SyncResult<()>;

    async fn list_boards_for_user(&self, user_id: Uuid) -> SyncResult<Vec<Board>>;

    async fn create_board(&self, user_id: Uuid, board: NewBoard) -> SyncResult<Board>;

    async fn get_or_create_default_board(&self, user_id: Uuid) -> SyncResult<Board> {
        let boards = self.list_boards_for_user(user_id).await?;
        if let Some(board) = pick_default_board(boards) {
            return Ok(board);
        }
        self.create_board(user_id, NewBoard::default_board()).await
    }

    async fn fetch_subscription(&self, user_id: Uuid) -> SyncResult<Option<SubscriptionPlan>>;

    async fn check_subscription(&self) -> SyncResult<Option<SubscriptionPlan>>;

    async fn create_billing_portal_session(&self, return_url: &str) -> SyncResult<String>;

    async fn add_collaborator(&self, task_id: Uuid, user_id: Uuid) -> SyncResult<()>;

    async fn remove_collaborator(&self, task_id: Uuid, user_id: Uuid) -> SyncResult<()>;

    async fn ensure_bucket(&self, bucket: &str) -> SyncResult<()>;

    async fn resolve_public_url(&self, bucket: &str, path: &str) -> SyncResult<String>;
}

/// Most recently created non-archived board; ties go to the larger id so the
/// choice is stable across calls.
pub fn pick_default_board(boards: Vec<Board>) -> Option<Board> {
    boards
        .into_iter()
        .filter(|board| !board.is_archived)
        .max_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)))
}

pub fn order_task_listing(mut tasks: Vec<Task>) -> Vec<Task> {
    tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
    let mut seen = std::collections::HashSet::new();
    tasks.retain(|task| seen.insert(task.id));
    tasks
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;

    fn board(age_minutes: i64, archived: bool) -> Board {
        let created = Utc::now() - Duration::minutes(age_minutes);
        Board {
            id: Uuid::new_v4(),
            name: format!("board-{age_minutes}"),
            description: None,
            user_id: Uuid::nil(),
            created_at: created,
            updated_at: created,
            is_archived: archived,
        }
    }

    #[test]
    fn default_board_is_newest_unarchived() {
        let old = board(60, false);
        let newest_archived = board(1, true);
        let recent = board(5, false);
        let picked = pick_default_board(vec![old, newest_archived, recent.clone()])
            .expect("a board should be picked");
        assert_eq!(picked.id, recent.id);
    }

    #[test]
    fn only_archived_boards_means_none() {
        assert!(pick_default_board(vec![board(3, true)]).is_none());
        assert!(pick_default_board(vec![]).is_none());
    }
}
