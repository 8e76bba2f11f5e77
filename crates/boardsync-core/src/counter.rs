use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::events::{EventBus, SyncEvent};
use crate::model::{PlanLimits, TaskCounterState};
use crate::store::LocalTaskStore;
use crate::subscription::SubscriptionCache;

/// Task count versus plan limit. Always a full recount of the local store;
/// nothing is added or subtracted incrementally.
pub struct CounterReconciler {
    store: Arc<LocalTaskStore>,
    subscription: Arc<SubscriptionCache>,
    limits: PlanLimits,
    events: EventBus,
    state: Mutex<TaskCounterState>,
}

impl CounterReconciler {
    pub fn new(
        store: Arc<LocalTaskStore>,
        subscription: Arc<SubscriptionCache>,
        limits: PlanLimits,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            subscription,
            limits,
            events,
            state: Mutex::new(TaskCounterState::default()),
        }
    }

    pub fn state(&self) -> TaskCounterState {
        self.state.lock().clone()
    }

    pub fn remaining(&self) -> Option<usize> {
        self.state.lock().remaining()
    }

    pub fn is_at_limit(&self) -> bool {
        self.state.lock().is_at_limit()
    }

    #[tracing::instrument(skip(self))]
    pub fn sync_completed_tasks_count(&self, board: Option<Uuid>) -> TaskCounterState {
        let next = TaskCounterState {
            total_tasks: self.store.count_on_board(board),
            total_limit: self.subscription.task_limit(&self.limits),
            last_synced_at: Some(Utc::now()),
        };
        debug!(
            total_tasks = next.total_tasks,
            total_limit = ?next.total_limit,
            "task counter recomputed"
        );
        *self.state.lock() = next.clone();
        self.events.publish(SyncEvent::CounterChanged(next.clone()));
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MemoryGateway;
    use crate::model::NewTask;
    use crate::provision::BoardProvisioner;

    #[tokio::test]
    async fn recount_scopes_to_board() {
        let gateway = Arc::new(MemoryGateway::new());
        let events = EventBus::new();
        let provisioner = Arc::new(BoardProvisioner::new(gateway.clone()));
        let store = Arc::new(LocalTaskStore::new(
            gateway.clone(),
            provisioner,
            events.clone(),
        ));
        let subscription = Arc::new(SubscriptionCache::new(gateway.clone(), false, events.clone()));
        let counter = CounterReconciler::new(
            store.clone(),
            subscription,
            PlanLimits::default(),
            events,
        );
        let user = Uuid::new_v4();
        let main = gateway.seed_board(user, "Main");
        let side = gateway.seed_board(user, "Side");

        for title in ["a", "b", "c"] {
            store
                .create(user, NewTask::titled(title).on_board(main.id))
                .await
                .expect("create on main");
        }
        store
            .create(user, NewTask::titled("d").on_board(side.id))
            .await
            .expect("create on side");

        assert_eq!(counter.sync_completed_tasks_count(Some(main.id)).total_tasks, 3);
        assert_eq!(counter.sync_completed_tasks_count(Some(side.id)).total_tasks, 1);
        let all = counter.sync_completed_tasks_count(None);
        assert_eq!(all.total_tasks, 4);
        assert_eq!(all.total_limit, Some(10));
        assert_eq!(counter.remaining(), Some(6));
        assert!(all.last_synced_at.is_some());
    }
}
