use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum TaskStatus {
    #[default]
    Todo,
    InProgress,
    Done,
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "todo" => Ok(Self::Todo),
            "inprogress" | "in_progress" | "in-progress" => Ok(Self::InProgress),
            "done" => Ok(Self::Done),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Todo => "todo",
            Self::InProgress => "inProgress",
            Self::Done => "done",
        };
        f.pad(label)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: Uuid,

    pub title: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub status: TaskStatus,

    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub due_date: Option<DateTime<Utc>>,

    pub user_id: Uuid,

    pub board_id: Uuid,

    /// Filled from `task_collaborators`; never written back on the task row.
    #[serde(default, skip_serializing)]
    pub collaborators: BTreeSet<Uuid>,
}

impl Task {
    pub fn is_visible_to(&self, user_id: Uuid) -> bool {
        self.user_id == user_id || self.collaborators.contains(&user_id)
    }

    pub fn apply_patch(&mut self, patch: &TaskPatch) {
        if let Some(title) = patch.title.as_ref() {
            self.title = title.clone();
        }
        if let Some(description) = patch.description.as_ref() {
            self.description = description.clone();
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(due_date) = patch.due_date {
            self.due_date = due_date;
        }
        if let Some(board_id) = patch.board_id {
            self.board_id = board_id;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Board {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub user_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub is_archived: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlanType {
    Free,
    Pro,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Active,
    Canceled,
    PastDue,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscriptionPlan {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan_type: PlanType,
    pub status: PlanStatus,
    pub start_date: DateTime<Utc>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SubscriptionPlan {
    /// Plan tier that actually applies: a lapsed pro plan counts as free.
    pub fn effective_type(&self) -> PlanType {
        match (self.plan_type, self.status) {
            (PlanType::Pro, PlanStatus::Active) => PlanType::Pro,
            _ => PlanType::Free,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanLimits {
    pub free: u32,
    /// `None` means unlimited.
    pub pro: Option<u32>,
}

impl Default for PlanLimits {
    fn default() -> Self {
        Self { free: 10, pro: None }
    }
}

impl PlanLimits {
    pub fn limit_for(&self, plan: Option<&SubscriptionPlan>) -> Option<u32> {
        match plan.map(SubscriptionPlan::effective_type) {
            Some(PlanType::Pro) => self.pro,
            Some(PlanType::Free) | None => Some(self.free),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TaskCounterState {
    pub total_tasks: usize,
    pub total_limit: Option<u32>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl TaskCounterState {
    pub fn remaining(&self) -> Option<usize> {
        self.total_limit
            .map(|limit| (limit as usize).saturating_sub(self.total_tasks))
    }

    pub fn is_at_limit(&self) -> bool {
        self.remaining() == Some(0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct NewTask {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub board_id: Option<Uuid>,
}

impl NewTask {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    pub fn on_board(mut self, board_id: Uuid) -> Self {
        self.board_id = Some(board_id);
        self
    }
}

/// Partial task update. Outer `None` leaves a field untouched; for clearable
/// fields the inner `None` clears it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TaskPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<Option<DateTime<Utc>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub board_id: Option<Uuid>,
}

impl TaskPatch {
    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Self::default()
        }
    }

    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.status.is_none()
            && self.due_date.is_none()
            && self.board_id.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewBoard {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl NewBoard {
    pub fn default_board() -> Self {
        Self {
            name: "My Board".to_string(),
            description: Some("Default board".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(plan_type: PlanType, status: PlanStatus) -> SubscriptionPlan {
        let now = Utc::now();
        SubscriptionPlan {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            plan_type,
            status,
            start_date: now,
            end_date: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn status_serializes_as_wire_names() {
        let json = serde_json::to_string(&TaskStatus::InProgress).expect("serialize");
        assert_eq!(json, "\"inProgress\"");
        assert_eq!("in_progress".parse::<TaskStatus>(), Ok(TaskStatus::InProgress));
        assert!("blocked".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn lapsed_pro_plan_gets_free_limit() {
        let limits = PlanLimits {
            free: 10,
            pro: Some(500),
        };
        assert_eq!(limits.limit_for(None), Some(10));
        assert_eq!(
            limits.limit_for(Some(&plan(PlanType::Pro, PlanStatus::Active))),
            Some(500)
        );
        assert_eq!(
            limits.limit_for(Some(&plan(PlanType::Pro, PlanStatus::PastDue))),
            Some(10)
        );
    }

    #[test]
    fn patch_touches_only_present_fields() {
        let now = Utc::now();
        let mut task = Task {
            id: Uuid::new_v4(),
            title: "A".to_string(),
            description: Some("keep".to_string()),
            status: TaskStatus::Todo,
            created_at: now,
            due_date: Some(now),
            user_id: Uuid::new_v4(),
            board_id: Uuid::new_v4(),
            collaborators: BTreeSet::new(),
        };

        task.apply_patch(&TaskPatch {
            title: Some("A2".to_string()),
            due_date: Some(None),
            ..TaskPatch::default()
        });

        assert_eq!(task.title, "A2");
        assert_eq!(task.description.as_deref(), Some("keep"));
        assert_eq!(task.due_date, None);
        assert_eq!(task.status, TaskStatus::Todo);
    }

    #[test]
    fn counter_remaining_saturates() {
        let state = TaskCounterState {
            total_tasks: 12,
            total_limit: Some(10),
            last_synced_at: None,
        };
        assert_eq!(state.remaining(), Some(0));
        assert!(state.is_at_limit());

        let unlimited = TaskCounterState {
            total_tasks: 12,
            ..TaskCounterState::default()
        };
        assert!(!unlimited.is_at_limit());
    }
}
