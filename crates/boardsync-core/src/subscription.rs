use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::events::{EventBus, NoticeLevel, SyncEvent};
use crate::gateway::RemoteGateway;
use crate::model::{PlanLimits, SubscriptionPlan};

#[derive(Debug, Clone, PartialEq)]
pub struct PlanStatusView {
    pub plan: Option<SubscriptionPlan>,
    /// The last check failed and `plan` is what was cached before it.
    pub stale: bool,
}

#[derive(Debug, Default)]
struct CacheState {
    plan: Option<SubscriptionPlan>,
    checked_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

pub struct SubscriptionCache {
    gateway: Arc<dyn RemoteGateway>,
    verify_with_billing: bool,
    events: EventBus,
    state: Mutex<CacheState>,
}

impl SubscriptionCache {
    pub fn new(gateway: Arc<dyn RemoteGateway>, verify_with_billing: bool, events: EventBus) -> Self {
        Self {
            gateway,
            verify_with_billing,
            events,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn plan(&self) -> Option<SubscriptionPlan> {
        self.state.lock().plan.clone()
    }

    pub fn last_checked_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().checked_at
    }

    pub fn last_error(&self) -> Option<String> {
        self.state.lock().last_error.clone()
    }

    pub fn task_limit(&self, limits: &PlanLimits) -> Option<u32> {
        limits.limit_for(self.state.lock().plan.as_ref())
    }

    pub fn clear(&self) {
        *self.state.lock() = CacheState::default();
    }

    #[tracing::instrument(skip(self))]
    pub async fn check_status(&self, user_id: Uuid) -> PlanStatusView {
        let result = if self.verify_with_billing {
            self.gateway.check_subscription().await
        } else {
            self.gateway.fetch_subscription(user_id).await
        };

        match result {
            Ok(plan) => {
                info!(
                    plan_type = ?plan.as_ref().map(|p| p.plan_type),
                    status = ?plan.as_ref().map(|p| p.status),
                    "subscription refreshed"
                );
                {
                    let mut state = self.state.lock();
                    state.plan = plan.clone();
                    state.checked_at = Some(Utc::now());
                    state.last_error = None;
                }
                self.events.publish(SyncEvent::SubscriptionChanged);
                PlanStatusView { plan, stale: false }
            }
            Err(err) => {
                warn!(error = %err, "subscription check failed; keeping cached plan");
                let plan = {
                    let mut state = self.state.lock();
                    state.last_error = Some(err.to_string());
                    state.plan.clone()
                };
                self.events.notify(
                    NoticeLevel::Warning,
                    format!("Could not verify subscription: {err}"),
                );
                PlanStatusView { plan, stale: true }
            }
        }
    }

    #[tracing::instrument(skip(self))]
    pub async fn create_portal_session(&self, return_url: &str) -> Option<String> {
        match self.gateway.create_billing_portal_session(return_url).await {
            Ok(url) => Some(url),
            Err(err) => {
                warn!(error = %err, "billing portal session failed");
                self.events.notify(
                    NoticeLevel::Error,
                    format!("Could not open billing portal: {err}"),
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MemoryGateway;
    use crate::gateway::memory::{OP_CHECK_SUBSCRIPTION, OP_FETCH_SUBSCRIPTION, OP_PORTAL};
    use crate::model::{PlanStatus, PlanType};

    fn pro_plan(user_id: Uuid) -> SubscriptionPlan {
        let now = Utc::now();
        SubscriptionPlan {
            id: Uuid::new_v4(),
            user_id,
            plan_type: PlanType::Pro,
            status: PlanStatus::Active,
            start_date: now,
            end_date: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn failed_refresh_keeps_pro_plan() {
        let gateway = Arc::new(MemoryGateway::new());
        let user = Uuid::new_v4();
        gateway.put_subscription(pro_plan(user));
        let cache = SubscriptionCache::new(gateway.clone(), false, EventBus::new());
        assert!(cache.last_checked_at().is_none());

        let fresh = cache.check_status(user).await;
        assert!(!fresh.stale);
        assert_eq!(fresh.plan.as_ref().map(|p| p.plan_type), Some(PlanType::Pro));
        let checked = cache.last_checked_at();
        assert!(checked.is_some());

        gateway.fail_next(OP_FETCH_SUBSCRIPTION, 1);
        let stale = cache.check_status(user).await;
        assert!(stale.stale);
        assert_eq!(cache.plan().map(|p| p.plan_type), Some(PlanType::Pro));
        assert!(cache.last_error().is_some());
        assert_eq!(cache.last_checked_at(), checked);
        assert_eq!(cache.task_limit(&PlanLimits::default()), None);
    }

    #[tokio::test]
    async fn billing_verification_uses_function() {
        let gateway = Arc::new(MemoryGateway::new());
        let user = Uuid::new_v4();
        gateway.sign_in(user);
        gateway.put_subscription(pro_plan(user));
        let cache = SubscriptionCache::new(gateway.clone(), true, EventBus::new());

        let view = cache.check_status(user).await;
        assert!(view.plan.is_some());
        assert_eq!(gateway.calls(OP_CHECK_SUBSCRIPTION), 1);
        assert_eq!(gateway.calls(OP_FETCH_SUBSCRIPTION), 0);
    }

    #[tokio::test]
    async fn portal_failure_yields_none() {
        let gateway = Arc::new(MemoryGateway::new());
        let cache = SubscriptionCache::new(gateway.clone(), false, EventBus::new());

        let url = cache
            .create_portal_session("https://app.example/settings")
            .await;
        assert!(url.is_some_and(|u| u.contains("return=https://app.example/settings")));

        gateway.fail_next(OP_PORTAL, 1);
        assert!(cache.create_portal_session("https://app.example").await.is_none());
    }
}
