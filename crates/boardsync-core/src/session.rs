use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::info;
use uuid::Uuid;

use crate::counter::CounterReconciler;
use crate::error::{SyncError, SyncResult};
use crate::events::{EventBus, SyncEvent};
use crate::gateway::RemoteGateway;
use crate::model::{Board, NewTask, PlanLimits, SubscriptionPlan, Task, TaskCounterState, TaskPatch};
use crate::provision::BoardProvisioner;
use crate::store::{LocalTaskStore, UpdateOutcome};
use crate::subscription::{PlanStatusView, SubscriptionCache};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionOptions {
    pub limits: PlanLimits,
    /// Ask the billing function instead of reading the subscriptions table.
    pub verify_with_billing: bool,
}

pub struct Session {
    events: EventBus,
    provisioner: Arc<BoardProvisioner>,
    store: Arc<LocalTaskStore>,
    subscription: Arc<SubscriptionCache>,
    counter: CounterReconciler,
    user: Mutex<Option<Uuid>>,
}

impl Session {
    pub fn new(gateway: Arc<dyn RemoteGateway>, options: SessionOptions) -> Self {
        let events = EventBus::new();
        let provisioner = Arc::new(BoardProvisioner::new(gateway.clone()));
        let store = Arc::new(LocalTaskStore::new(
            gateway.clone(),
            provisioner.clone(),
            events.clone(),
        ));
        let subscription = Arc::new(SubscriptionCache::new(
            gateway,
            options.verify_with_billing,
            events.clone(),
        ));
        let counter = CounterReconciler::new(
            store.clone(),
            subscription.clone(),
            options.limits,
            events.clone(),
        );

        Self {
            events,
            provisioner,
            store,
            subscription,
            counter,
            user: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn user(&self) -> Option<Uuid> {
        *self.user.lock()
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.store.tasks()
    }

    pub fn task(&self, id: Uuid) -> Option<Task> {
        self.store.get(id)
    }

    pub fn current_board(&self) -> Option<Board> {
        self.provisioner.current()
    }

    pub fn counter(&self) -> TaskCounterState {
        self.counter.state()
    }

    pub fn plan(&self) -> Option<SubscriptionPlan> {
        self.subscription.plan()
    }

    fn require_user(&self) -> SyncResult<Uuid> {
        self.user()
            .ok_or_else(|| SyncError::validation("no authenticated user"))
    }

    fn recount(&self) -> TaskCounterState {
        let board = self.provisioner.current().map(|b| b.id);
        self.counter.sync_completed_tasks_count(board)
    }

    #[tracing::instrument(skip(self))]
    pub async fn login(&self, user_id: Uuid) -> TaskCounterState {
        let previous = self.user.lock().replace(user_id);
        if previous != Some(user_id) {
            self.provisioner.clear();
            self.store.clear();
            self.subscription.clear();
            info!(%user_id, "session user changed");
            self.events.publish(SyncEvent::LoginChanged {
                user_id: Some(user_id),
            });
        }

        self.store.refresh(user_id).await;
        self.subscription.check_status(user_id).await;
        self.recount()
    }

    #[tracing::instrument(skip(self))]
    pub fn logout(&self) {
        if self.user.lock().take().is_none() {
            return;
        }
        self.provisioner.clear();
        self.store.clear();
        self.subscription.clear();
        self.events
            .publish(SyncEvent::LoginChanged { user_id: None });
        self.recount();
    }

    /// Switches the current board (or back to "all boards" with `None`),
    /// reloads from remote and recounts.
    #[tracing::instrument(skip(self, board), fields(board_id = ?board.as_ref().map(|b| b.id)))]
    pub async fn select_board(&self, board: Option<Board>) -> SyncResult<TaskCounterState> {
        let user_id = self.require_user()?;
        let board_id = board.as_ref().map(|b| b.id);
        match board {
            Some(board) => self.provisioner.select_board(user_id, board),
            None => self.provisioner.clear(),
        }
        self.events.publish(SyncEvent::BoardChanged { board_id });
        self.store.refresh(user_id).await;
        Ok(self.recount())
    }

    #[tracing::instrument(skip(self, input))]
    pub async fn create_task(&self, input: NewTask) -> SyncResult<Task> {
        let user_id = self.require_user()?;
        let board_before = self.provisioner.current().map(|b| b.id);

        let task = self.store.create(user_id, input).await?;

        let board_after = self.provisioner.current().map(|b| b.id);
        if board_after != board_before {
            self.events.publish(SyncEvent::BoardChanged {
                board_id: board_after,
            });
        }
        self.recount();
        Ok(task)
    }

    #[tracing::instrument(skip(self, patch))]
    pub async fn update_task(&self, id: Uuid, patch: TaskPatch) -> SyncResult<UpdateOutcome> {
        self.require_user()?;
        let moves_board = patch.board_id.is_some();
        let outcome = self.store.update(id, patch).await;
        if moves_board && outcome != UpdateOutcome::Unknown {
            self.recount();
        }
        Ok(outcome)
    }

    pub async fn delete_task(&self, id: Uuid) -> SyncResult<bool> {
        self.require_user()?;
        let removed = self.store.delete(id).await;
        if removed {
            self.recount();
        }
        Ok(removed)
    }

    pub async fn share_task(&self, task_id: Uuid, user_id: Uuid) -> SyncResult<bool> {
        self.require_user()?;
        Ok(self.store.add_collaborator(task_id, user_id).await)
    }

    pub async fn unshare_task(&self, task_id: Uuid, user_id: Uuid) -> SyncResult<bool> {
        self.require_user()?;
        Ok(self.store.remove_collaborator(task_id, user_id).await)
    }

    pub async fn default_board(&self) -> SyncResult<Board> {
        let user_id = self.require_user()?;
        self.provisioner.get_or_create_default_board(user_id).await
    }

    pub async fn refresh_tasks(&self) -> SyncResult<TaskCounterState> {
        let user_id = self.require_user()?;
        self.store.refresh(user_id).await;
        Ok(self.recount())
    }

    pub async fn refresh_subscription(&self) -> SyncResult<PlanStatusView> {
        let user_id = self.require_user()?;
        let view = self.subscription.check_status(user_id).await;
        self.recount();
        Ok(view)
    }

    pub async fn open_billing_portal(&self, return_url: &str) -> SyncResult<Option<String>> {
        self.require_user()?;
        Ok(self.subscription.create_portal_session(return_url).await)
    }

    pub async fn return_from_portal(&self) -> SyncResult<PlanStatusView> {
        self.refresh_subscription().await
    }
}
