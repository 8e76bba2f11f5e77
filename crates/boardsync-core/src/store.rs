use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use crate::events::{EventBus, NoticeLevel, SyncEvent};
use crate::gateway::RemoteGateway;
use crate::model::{NewTask, Task, TaskPatch};
use crate::provision::BoardProvisioner;

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    Confirmed(Task),
    /// Remote accepted, but a newer local edit of the same task is pending.
    ConfirmedSuperseded,
    KeptLocal(SyncError),
    Unknown,
}

#[derive(Debug, Default)]
struct StoreState {
    tasks: Vec<Task>,
    // Latest local edit per task, drawn from a counter that never resets.
    revisions: HashMap<Uuid, u64>,
    next_revision: u64,
}

impl StoreState {
    fn position(&self, id: Uuid) -> Option<usize> {
        self.tasks.iter().position(|t| t.id == id)
    }

    fn bump(&mut self, id: Uuid) -> u64 {
        self.next_revision += 1;
        self.revisions.insert(id, self.next_revision);
        self.next_revision
    }
}

/// In-memory, newest-first view of the user's tasks.
///
/// `create` waits for the remote id before inserting. `update` applies locally
/// first and keeps the local value if the remote write fails; the next
/// `refresh` reconciles. Remote failures are logged and published as notices;
/// only `create` also hands the error back.
pub struct LocalTaskStore {
    gateway: Arc<dyn RemoteGateway>,
    provisioner: Arc<BoardProvisioner>,
    events: EventBus,
    state: Mutex<StoreState>,
}

impl LocalTaskStore {
    pub fn new(
        gateway: Arc<dyn RemoteGateway>,
        provisioner: Arc<BoardProvisioner>,
        events: EventBus,
    ) -> Self {
        Self {
            gateway,
            provisioner,
            events,
            state: Mutex::new(StoreState::default()),
        }
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.state.lock().tasks.clone()
    }

    pub fn get(&self, id: Uuid) -> Option<Task> {
        let state = self.state.lock();
        state.position(id).map(|idx| state.tasks[idx].clone())
    }

    pub fn len(&self) -> usize {
        self.state.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().tasks.is_empty()
    }

    pub fn count_on_board(&self, board: Option<Uuid>) -> usize {
        let state = self.state.lock();
        match board {
            Some(board_id) => state.tasks.iter().filter(|t| t.board_id == board_id).count(),
            None => state.tasks.len(),
        }
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.tasks.clear();
        state.revisions.clear();
    }

    #[tracing::instrument(skip(self, input), fields(title_len = input.title.len()))]
    pub async fn create(&self, user_id: Uuid, input: NewTask) -> SyncResult<Task> {
        if input.title.trim().is_empty() {
            return Err(SyncError::validation("task title is required"));
        }

        let board_id = match input.board_id {
            Some(board_id) => board_id,
            None => self.provisioner.get_or_create_default_board(user_id).await?.id,
        };

        let task = match self.gateway.create_task(user_id, input, board_id).await {
            Ok(task) => task,
            Err(err) => {
                error!(error = %err, %board_id, "task create failed");
                self.events
                    .notify(NoticeLevel::Error, format!("Could not create task: {err}"));
                return Err(err);
            }
        };

        let count = {
            let mut state = self.state.lock();
            if let Some(idx) = state.position(task.id) {
                // A refresh may already have brought this row in.
                state.tasks.remove(idx);
            }
            state.tasks.insert(0, task.clone());
            state.tasks.len()
        };

        info!(task_id = %task.id, %board_id, "task created");
        self.events.publish(SyncEvent::TasksChanged { count });
        Ok(task)
    }

    #[tracing::instrument(skip(self, patch))]
    pub async fn update(&self, id: Uuid, patch: TaskPatch) -> UpdateOutcome {
        let revision = {
            let mut state = self.state.lock();
            let Some(idx) = state.position(id) else {
                warn!(task_id = %id, "update for unknown task");
                return UpdateOutcome::Unknown;
            };
            state.tasks[idx].apply_patch(&patch);
            state.bump(id)
        };
        let count = self.len();
        self.events.publish(SyncEvent::TasksChanged { count });

        match self.gateway.update_task(id, patch).await {
            Ok(remote) => {
                let mut state = self.state.lock();
                if state.revisions.get(&id).copied() != Some(revision) {
                    debug!(task_id = %id, revision, "newer local edit pending; keeping local copy");
                    return UpdateOutcome::ConfirmedSuperseded;
                }
                match state.position(id) {
                    Some(idx) => {
                        state.tasks[idx] = remote.clone();
                        UpdateOutcome::Confirmed(remote)
                    }
                    // Deleted locally while the update was in flight.
                    None => UpdateOutcome::ConfirmedSuperseded,
                }
            }
            Err(err) => {
                error!(task_id = %id, error = %err, "task update failed; keeping local value");
                self.events
                    .notify(NoticeLevel::Error, format!("Could not save task changes: {err}"));
                UpdateOutcome::KeptLocal(err)
            }
        }
    }

    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, id: Uuid) -> bool {
        if let Err(err) = self.gateway.delete_task(id).await {
            if !err.is_not_found() {
                error!(task_id = %id, error = %err, "task delete failed");
                self.events
                    .notify(NoticeLevel::Error, format!("Could not delete task: {err}"));
                return false;
            }
            debug!(task_id = %id, "task already gone remotely");
        }

        let count = {
            let mut state = self.state.lock();
            state.tasks.retain(|t| t.id != id);
            state.revisions.remove(&id);
            state.tasks.len()
        };
        self.events.publish(SyncEvent::TasksChanged { count });
        true
    }

    #[tracing::instrument(skip(self))]
    pub async fn add_collaborator(&self, task_id: Uuid, user_id: Uuid) -> bool {
        if let Err(err) = self.gateway.add_collaborator(task_id, user_id).await {
            error!(%task_id, error = %err, "sharing task failed");
            self.events
                .notify(NoticeLevel::Error, format!("Could not share task: {err}"));
            return false;
        }
        let mut state = self.state.lock();
        if let Some(idx) = state.position(task_id) {
            state.tasks[idx].collaborators.insert(user_id);
        }
        true
    }

    #[tracing::instrument(skip(self))]
    pub async fn remove_collaborator(&self, task_id: Uuid, user_id: Uuid) -> bool {
        if let Err(err) = self.gateway.remove_collaborator(task_id, user_id).await {
            error!(%task_id, error = %err, "unsharing task failed");
            self.events
                .notify(NoticeLevel::Error, format!("Could not unshare task: {err}"));
            return false;
        }
        let mut state = self.state.lock();
        if let Some(idx) = state.position(task_id) {
            state.tasks[idx].collaborators.remove(&user_id);
        }
        true
    }

    #[tracing::instrument(skip(self))]
    pub async fn refresh(&self, user_id: Uuid) -> bool {
        let listing = match self.gateway.list_tasks_for_user(user_id).await {
            Ok(listing) => listing,
            Err(err) => {
                error!(error = %err, "task refresh failed; keeping current view");
                self.events
                    .notify(NoticeLevel::Warning, format!("Could not refresh tasks: {err}"));
                return false;
            }
        };

        let mut seen = HashSet::with_capacity(listing.len());
        let tasks: Vec<Task> = listing.into_iter().filter(|t| seen.insert(t.id)).collect();

        let count = {
            let mut state = self.state.lock();
            let StoreState {
                tasks: current,
                revisions,
                ..
            } = &mut *state;
            *current = tasks;
            // Edits still in flight keep their revision.
            revisions.retain(|id, _| current.iter().any(|t| t.id == *id));
            current.len()
        };
        debug!(count, "task view replaced from remote");
        self.events.publish(SyncEvent::TasksChanged { count });
        true
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::events::drain;
    use crate::gateway::MemoryGateway;
    use crate::gateway::memory::{OP_CREATE_TASK, OP_LIST_TASKS, OP_UPDATE_TASK};
    use crate::model::TaskStatus;

    fn fixture() -> (Arc<MemoryGateway>, LocalTaskStore, EventBus) {
        let gateway = Arc::new(MemoryGateway::new());
        let provisioner = Arc::new(BoardProvisioner::new(gateway.clone()));
        let events = EventBus::new();
        let store = LocalTaskStore::new(gateway.clone(), provisioner, events.clone());
        (gateway, store, events)
    }

    #[tokio::test]
    async fn blank_title_is_rejected_before_remote() {
        let (gateway, store, _) = fixture();
        let err = store
            .create(Uuid::new_v4(), NewTask::titled("   "))
            .await
            .expect_err("blank title");
        assert!(matches!(err, SyncError::Validation(_)));
        assert_eq!(gateway.calls(OP_CREATE_TASK), 0);
    }

    #[tokio::test]
    async fn failed_create_inserts_nothing() {
        let (gateway, store, events) = fixture();
        let mut rx = events.subscribe();
        gateway.fail_next(OP_CREATE_TASK, 1);

        assert!(store.create(Uuid::new_v4(), NewTask::titled("A")).await.is_err());
        assert!(store.is_empty());
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, SyncEvent::Notice(n) if n.level == NoticeLevel::Error)));
    }

    #[tokio::test]
    async fn refresh_failure_keeps_view() {
        let (gateway, store, _) = fixture();
        let user = Uuid::new_v4();
        store.create(user, NewTask::titled("A")).await.expect("create");

        gateway.fail_next(OP_LIST_TASKS, 1);
        assert!(!store.refresh(user).await);
        assert_eq!(store.len(), 1);

        assert!(store.refresh(user).await);
        assert!(store.refresh(user).await);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn update_confirms_with_remote_copy() {
        let (_, store, _) = fixture();
        let user = Uuid::new_v4();
        let task = store.create(user, NewTask::titled("A")).await.expect("create");

        let outcome = store
            .update(task.id, TaskPatch::status(TaskStatus::Done))
            .await;

        match outcome {
            UpdateOutcome::Confirmed(remote) => assert_eq!(remote.status, TaskStatus::Done),
            other => panic!("expected confirmation, got {other:?}"),
        }
        assert_eq!(store.get(task.id).map(|t| t.status), Some(TaskStatus::Done));
    }

    #[tokio::test]
    async fn unknown_task_update_is_a_noop() {
        let (gateway, store, _) = fixture();
        let outcome = store.update(Uuid::new_v4(), TaskPatch::title("x")).await;
        assert_eq!(outcome, UpdateOutcome::Unknown);
        assert_eq!(gateway.calls(OP_UPDATE_TASK), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn same_task_edits_keep_issue_order() {
        let (gateway, store, _) = fixture();
        let user = Uuid::new_v4();
        let task = store.create(user, NewTask::titled("A")).await.expect("create");
        gateway.set_latency(Duration::from_millis(20));

        let (first, second) = tokio::join!(
            store.update(task.id, TaskPatch::title("first")),
            store.update(task.id, TaskPatch::title("second"))
        );

        assert_eq!(first, UpdateOutcome::ConfirmedSuperseded);
        assert!(matches!(second, UpdateOutcome::Confirmed(_)));
        assert_eq!(store.get(task.id).map(|t| t.title), Some("second".to_string()));
    }

    #[tokio::test]
    async fn delete_removes_after_confirmation() {
        let (gateway, store, _) = fixture();
        let user = Uuid::new_v4();
        let task = store.create(user, NewTask::titled("A")).await.expect("create");

        gateway.fail_next(crate::gateway::memory::OP_DELETE_TASK, 1);
        assert!(!store.delete(task.id).await);
        assert_eq!(store.len(), 1);

        assert!(store.delete(task.id).await);
        assert!(store.is_empty());
        assert!(gateway.task(task.id).is_none());
    }

    #[tokio::test]
    async fn sharing_is_mirrored_locally() {
        let (_, store, _) = fixture();
        let user = Uuid::new_v4();
        let friend = Uuid::new_v4();
        let task = store.create(user, NewTask::titled("A")).await.expect("create");

        assert!(store.add_collaborator(task.id, friend).await);
        assert!(store
            .get(task.id)
            .is_some_and(|t| t.collaborators.contains(&friend)));

        assert!(store.remove_collaborator(task.id, friend).await);
        assert!(store
            .get(task.id)
            .is_some_and(|t| t.collaborators.is_empty()));
    }

    #[tokio::test(start_paused = true)]
    async fn late_reply_after_refresh_does_not_undo_newer_edit() {
        let (gateway, store, _) = fixture();
        let user = Uuid::new_v4();
        let task = store.create(user, NewTask::titled("A")).await.expect("create");
        gateway.hold_replies(OP_UPDATE_TASK, Duration::from_millis(100), 1);

        let (first, (refreshed, second)) = tokio::join!(
            store.update(task.id, TaskPatch::title("first")),
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                let refreshed = store.refresh(user).await;
                (refreshed, store.update(task.id, TaskPatch::title("second")).await)
            }
        );

        assert!(refreshed);
        assert!(matches!(second, UpdateOutcome::Confirmed(_)));
        assert_eq!(first, UpdateOutcome::ConfirmedSuperseded);
        assert_eq!(store.get(task.id).map(|t| t.title), Some("second".to_string()));
        assert_eq!(gateway.task(task.id).map(|t| t.title), Some("second".to_string()));
    }

    #[tokio::test]
    async fn denied_delete_keeps_task_and_notifies() {
        let (gateway, store, events) = fixture();
        let owner = Uuid::new_v4();
        let friend = Uuid::new_v4();
        let task = store.create(owner, NewTask::titled("A")).await.expect("create");
        let mut rx = events.subscribe();

        gateway.sign_in(friend);
        assert!(!store.delete(task.id).await);
        assert_eq!(store.len(), 1);
        assert!(gateway.task(task.id).is_some());
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, SyncEvent::Notice(n) if n.level == NoticeLevel::Error)));
    }
}
