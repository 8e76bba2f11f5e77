use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::{RemoteGateway, order_task_listing};
use crate::error::{SyncError, SyncResult};
use crate::model::{Board, NewBoard, NewTask, SubscriptionPlan, Task, TaskPatch};

pub const OP_LIST_TASKS: &str = "list_tasks_for_user";
pub const OP_CREATE_TASK: &str = "create_task";
pub const OP_UPDATE_TASK: &str = "update_task";
pub const OP_DELETE_TASK: &str = "delete_task";
pub const OP_LIST_BOARDS: &str = "list_boards_for_user";
pub const OP_CREATE_BOARD: &str = "create_board";
pub const OP_FETCH_SUBSCRIPTION: &str = "fetch_subscription";
pub const OP_CHECK_SUBSCRIPTION: &str = "check_subscription";
pub const OP_PORTAL: &str = "create_billing_portal_session";
pub const OP_ADD_COLLABORATOR: &str = "add_collaborator";
pub const OP_REMOVE_COLLABORATOR: &str = "remove_collaborator";
pub const OP_ENSURE_BUCKET: &str = "ensure_bucket";
pub const OP_RESOLVE_URL: &str = "resolve_public_url";

#[derive(Debug, Default)]
struct MemoryState {
    tasks: Vec<Task>,
    boards: Vec<Board>,
    subscriptions: HashMap<Uuid, SubscriptionPlan>,
    collaborators: BTreeSet<(Uuid, Uuid)>,
    buckets: HashSet<String>,
    objects: HashSet<(String, String)>,
    signed_in: Option<Uuid>,
    last_stamp: Option<DateTime<Utc>>,
    failures: HashMap<&'static str, u32>,
    held_replies: HashMap<&'static str, (Duration, u32)>,
    calls: HashMap<&'static str, u32>,
    latency: Option<Duration>,
}

impl MemoryState {
    /// Strictly increasing timestamps keep "newest first" deterministic.
    fn stamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let next = match self.last_stamp {
            Some(last) if now <= last => last + chrono::Duration::milliseconds(1),
            _ => now,
        };
        self.last_stamp = Some(next);
        next
    }

    fn with_collaborators(&self, mut task: Task) -> Task {
        task.collaborators = self
            .collaborators
            .iter()
            .filter(|(task_id, _)| *task_id == task.id)
            .map(|(_, user_id)| *user_id)
            .collect();
        task
    }
}

#[derive(Debug)]
pub struct MemoryGateway {
    state: Mutex<MemoryState>,
    public_base: String,
}

impl Default for MemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            public_base: "memory://storage".to_string(),
        }
    }

    pub fn sign_in(&self, user_id: Uuid) {
        self.state.lock().signed_in = Some(user_id);
    }

    /// Makes the next `times` calls of `op` fail with a remote error.
    pub fn fail_next(&self, op: &'static str, times: u32) {
        self.state.lock().failures.insert(op, times);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = Some(latency);
    }

    /// Delays the reply of the next `times` calls of `op` after their write
    /// has landed.
    pub fn hold_replies(&self, op: &'static str, delay: Duration, times: u32) {
        self.state.lock().held_replies.insert(op, (delay, times));
    }

    pub fn calls(&self, op: &'static str) -> u32 {
        self.state.lock().calls.get(op).copied().unwrap_or(0)
    }

    pub fn board_count(&self, user_id: Uuid) -> usize {
        self.state
            .lock()
            .boards
            .iter()
            .filter(|b| b.user_id == user_id)
            .count()
    }

    pub fn task(&self, id: Uuid) -> Option<Task> {
        let state = self.state.lock();
        state
            .tasks
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .map(|t| state.with_collaborators(t))
    }

    pub fn put_subscription(&self, plan: SubscriptionPlan) {
        self.state.lock().subscriptions.insert(plan.user_id, plan);
    }

    pub fn put_object(&self, bucket: &str, path: &str) {
        self.state
            .lock()
            .objects
            .insert((bucket.to_string(), path.trim_start_matches('/').to_string()));
    }

    pub fn has_bucket(&self, bucket: &str) -> bool {
        self.state.lock().buckets.contains(bucket)
    }

    pub fn seed_board(&self, user_id: Uuid, name: &str) -> Board {
        let mut state = self.state.lock();
        let now = state.stamp();
        let board = Board {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: None,
            user_id,
            created_at: now,
            updated_at: now,
            is_archived: false,
        };
        state.boards.push(board.clone());
        board
    }

    async fn enter(&self, op: &'static str) -> SyncResult<()> {
        let latency = {
            let mut state = self.state.lock();
            *state.calls.entry(op).or_insert(0) += 1;
            state.latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock();
        if let Some(remaining) = state.failures.get_mut(op)
            && *remaining > 0
        {
            *remaining -= 1;
            debug!(op, remaining = *remaining, "injected failure");
            return Err(SyncError::remote(format!("injected failure in {op}")));
        }
        Ok(())
    }

    async fn leave(&self, op: &'static str) {
        let delay = {
            let mut state = self.state.lock();
            match state.held_replies.get_mut(op) {
                Some((delay, remaining)) if *remaining > 0 => {
                    *remaining -= 1;
                    Some(*delay)
                }
                _ => None,
            }
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl RemoteGateway for MemoryGateway {
    async fn list_tasks_for_user(&self, user_id: Uuid) -> SyncResult<Vec<Task>> {
        self.enter(OP_LIST_TASKS).await?;
        let state = self.state.lock();
        let tasks = state
            .tasks
            .iter()
            .cloned()
            .map(|t| state.with_collaborators(t))
            .filter(|t| t.is_visible_to(user_id))
            .collect();
        Ok(order_task_listing(tasks))
    }

    async fn create_task(&self, user_id: Uuid, task: NewTask, board_id: Uuid) -> SyncResult<Task> {
        self.enter(OP_CREATE_TASK).await?;
        let mut state = self.state.lock();
        if !state.boards.iter().any(|b| b.id == board_id) {
            return Err(SyncError::not_found(format!("board {board_id}")));
        }
        let created_at = state.stamp();
        let task = Task {
            id: Uuid::new_v4(),
            title: task.title,
            description: task.description,
            status: task.status,
            created_at,
            due_date: task.due_date,
            user_id,
            board_id,
            collaborators: BTreeSet::new(),
        };
        state.tasks.push(task.clone());
        Ok(task)
    }

    async fn update_task(&self, id: Uuid, patch: TaskPatch) -> SyncResult<Task> {
        self.enter(OP_UPDATE_TASK).await?;
        let task = {
            let mut state = self.state.lock();
            let task = state
                .tasks
                .iter_mut()
                .find(|t| t.id == id)
                .ok_or_else(|| SyncError::not_found(format!("task {id}")))?;
            task.apply_patch(&patch);
            let task = task.clone();
            state.with_collaborators(task)
        };
        self.leave(OP_UPDATE_TASK).await;
        Ok(task)
    }

    async fn delete_task(&self, id: Uuid) -> SyncResult<()> {
        self.enter(OP_DELETE_TASK).await?;
        {
            let mut state = self.state.lock();
            let owner = state
                .tasks
                .iter()
                .find(|t| t.id == id)
                .map(|t| t.user_id)
                .ok_or_else(|| SyncError::not_found(format!("task {id}")))?;
            // Only the owner may delete once someone is signed in.
            if state.signed_in.is_some_and(|user| user != owner) {
                return Err(SyncError::validation(format!(
                    "task {id} was not deleted; only its owner can delete it"
                )));
            }
            state.tasks.retain(|t| t.id != id);
            state.collaborators.retain(|(task_id, _)| *task_id != id);
        }
        self.leave(OP_DELETE_TASK).await;
        Ok(())
    }

    async fn list_boards_for_user(&self, user_id: Uuid) -> SyncResult<Vec<Board>> {
        self.enter(OP_LIST_BOARDS).await?;
        let state = self.state.lock();
        let mut boards: Vec<Board> = state
            .boards
            .iter()
            .filter(|b| b.user_id == user_id)
            .cloned()
            .collect();
        boards.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(boards)
    }

    async fn create_board(&self, user_id: Uuid, board: NewBoard) -> SyncResult<Board> {
        self.enter(OP_CREATE_BOARD).await?;
        let mut state = self.state.lock();
        let now = state.stamp();
        let board = Board {
            id: Uuid::new_v4(),
            name: board.name,
            description: board.description,
            user_id,
            created_at: now,
            updated_at: now,
            is_archived: false,
        };
        state.boards.push(board.clone());
        Ok(board)
    }

    async fn fetch_subscription(&self, user_id: Uuid) -> SyncResult<Option<SubscriptionPlan>> {
        self.enter(OP_FETCH_SUBSCRIPTION).await?;
        Ok(self.state.lock().subscriptions.get(&user_id).cloned())
    }

    async fn check_subscription(&self) -> SyncResult<Option<SubscriptionPlan>> {
        self.enter(OP_CHECK_SUBSCRIPTION).await?;
        let state = self.state.lock();
        let user_id = state
            .signed_in
            .ok_or_else(|| SyncError::validation("no authenticated user"))?;
        Ok(state.subscriptions.get(&user_id).cloned())
    }

    async fn create_billing_portal_session(&self, return_url: &str) -> SyncResult<String> {
        self.enter(OP_PORTAL).await?;
        if return_url.trim().is_empty() {
            return Err(SyncError::validation("return url is empty"));
        }
        let session = Uuid::new_v4().simple();
        Ok(format!("memory://billing/portal/{session}?return={return_url}"))
    }

    async fn add_collaborator(&self, task_id: Uuid, user_id: Uuid) -> SyncResult<()> {
        self.enter(OP_ADD_COLLABORATOR).await?;
        let mut state = self.state.lock();
        if !state.tasks.iter().any(|t| t.id == task_id) {
            return Err(SyncError::not_found(format!("task {task_id}")));
        }
        state.collaborators.insert((task_id, user_id));
        Ok(())
    }

    async fn remove_collaborator(&self, task_id: Uuid, user_id: Uuid) -> SyncResult<()> {
        self.enter(OP_REMOVE_COLLABORATOR).await?;
        self.state.lock().collaborators.remove(&(task_id, user_id));
        Ok(())
    }

    async fn ensure_bucket(&self, bucket: &str) -> SyncResult<()> {
        self.enter(OP_ENSURE_BUCKET).await?;
        self.state.lock().buckets.insert(bucket.to_string());
        Ok(())
    }

    async fn resolve_public_url(&self, bucket: &str, path: &str) -> SyncResult<String> {
        self.enter(OP_RESOLVE_URL).await?;
        let path = path.trim_start_matches('/');
        let state = self.state.lock();
        if !state.buckets.contains(bucket) {
            return Err(SyncError::not_found(format!("bucket {bucket}")));
        }
        if !state.objects.contains(&(bucket.to_string(), path.to_string())) {
            return Err(SyncError::not_found(format!("{bucket}/{path}")));
        }
        Ok(format!("{}/{bucket}/{path}", self.public_base))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn listing_includes_shared_tasks_newest_first() {
        let gateway = MemoryGateway::new();
        let owner = Uuid::new_v4();
        let friend = Uuid::new_v4();
        let board = gateway.seed_board(owner, "Main");

        let first = gateway
            .create_task(owner, NewTask::titled("first"), board.id)
            .await
            .expect("create first");
        let second = gateway
            .create_task(owner, NewTask::titled("second"), board.id)
            .await
            .expect("create second");
        gateway
            .add_collaborator(first.id, friend)
            .await
            .expect("share first");

        let owned = gateway.list_tasks_for_user(owner).await.expect("list owner");
        let ids: Vec<Uuid> = owned.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![second.id, first.id]);

        let shared = gateway.list_tasks_for_user(friend).await.expect("list friend");
        assert_eq!(shared.len(), 1);
        assert!(shared[0].collaborators.contains(&friend));
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let gateway = MemoryGateway::new();
        let user = Uuid::new_v4();
        gateway.fail_next(OP_LIST_BOARDS, 1);

        assert!(gateway.list_boards_for_user(user).await.is_err());
        assert!(gateway.list_boards_for_user(user).await.is_ok());
        assert_eq!(gateway.calls(OP_LIST_BOARDS), 2);
    }

    #[tokio::test]
    async fn public_url_requires_object() {
        let gateway = MemoryGateway::new();
        gateway.ensure_bucket("avatars").await.expect("bucket");
        let missing = gateway.resolve_public_url("avatars", "u/1.png").await;
        assert!(matches!(missing, Err(SyncError::NotFound(_))));

        gateway.put_object("avatars", "u/1.png");
        let url = gateway
            .resolve_public_url("avatars", "/u/1.png")
            .await
            .expect("resolves");
        assert_eq!(url, "memory://storage/avatars/u/1.png");
    }
}
