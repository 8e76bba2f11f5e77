use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{RemoteGateway, order_task_listing};
use crate::error::{SyncError, SyncResult};
use crate::model::{
    Board, NewBoard, NewTask, SubscriptionPlan, Task, TaskPatch, TaskStatus,
};

const TASK_SELECT: &str = "*,task_collaborators(user_id)";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteConfig {
    pub url: String,
    pub api_key: String,
    pub access_token: Option<String>,
}

pub struct RestGateway {
    client: reqwest::Client,
    base_url: String,
    known_buckets: Mutex<HashSet<String>>,
}

#[derive(Debug, Deserialize)]
struct CollaboratorRef {
    user_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct TaskRow {
    id: Uuid,
    title: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    status: TaskStatus,
    created_at: DateTime<Utc>,
    #[serde(default)]
    due_date: Option<DateTime<Utc>>,
    user_id: Uuid,
    board_id: Uuid,
    #[serde(default)]
    task_collaborators: Vec<CollaboratorRef>,
}

impl From<TaskRow> for Task {
    fn from(row: TaskRow) -> Self {
        Task {
            id: row.id,
            title: row.title,
            description: row.description,
            status: row.status,
            created_at: row.created_at,
            due_date: row.due_date,
            user_id: row.user_id,
            board_id: row.board_id,
            collaborators: row
                .task_collaborators
                .into_iter()
                .map(|c| c.user_id)
                .collect(),
        }
    }
}

#[derive(Debug, Serialize)]
struct TaskInsert<'a> {
    title: &'a str,
    description: Option<&'a str>,
    status: TaskStatus,
    due_date: Option<DateTime<Utc>>,
    user_id: Uuid,
    board_id: Uuid,
}

#[derive(Debug, Serialize)]
struct BoardInsert<'a> {
    name: &'a str,
    description: Option<&'a str>,
    user_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct SharedTaskRef {
    task_id: Uuid,
}

impl RestGateway {
    pub fn new(config: RemoteConfig) -> SyncResult<Self> {
        let base_url = config.url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(SyncError::validation("remote url is not configured"));
        }
        if config.api_key.trim().is_empty() {
            return Err(SyncError::validation("remote api key is not configured"));
        }

        let bearer = config
            .access_token
            .as_deref()
            .filter(|token| !token.trim().is_empty())
            .unwrap_or(config.api_key.as_str());

        let mut headers = HeaderMap::new();
        headers.insert(
            "apikey",
            HeaderValue::from_str(config.api_key.trim())
                .map_err(|e| SyncError::validation(format!("invalid api key header: {e}")))?,
        );
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", bearer.trim()))
                .map_err(|e| SyncError::validation(format!("invalid access token header: {e}")))?,
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| SyncError::remote(format!("failed building HTTP client: {e}")))?;

        info!(base_url = %base_url, authenticated = config.access_token.is_some(), "remote gateway ready");

        Ok(Self {
            client,
            base_url,
            known_buckets: Mutex::new(HashSet::new()),
        })
    }

    fn rest(&self, table: &str) -> String {
        format!("{}/rest/v1/{table}", self.base_url)
    }

    fn function(&self, name: &str) -> String {
        format!("{}/functions/v1/{name}", self.base_url)
    }

    fn storage(&self, path: &str) -> String {
        format!("{}/storage/v1/{path}", self.base_url)
    }

    async fn select_tasks(&self, filter: (&str, String)) -> SyncResult<Vec<Task>> {
        let rows: Vec<TaskRow> = send_json(
            self.client
                .get(self.rest("tasks"))
                .query(&[("select", TASK_SELECT.to_string()), (filter.0, filter.1)]),
        )
        .await?;
        Ok(rows.into_iter().map(Task::from).collect())
    }

    async fn single_task(&self, request: RequestBuilder, id: Uuid) -> SyncResult<Task> {
        let rows: Vec<TaskRow> = send_json(
            request
                .query(&[("select", TASK_SELECT)])
                .header("Prefer", "return=representation"),
        )
        .await?;
        rows.into_iter()
            .next()
            .map(Task::from)
            .ok_or_else(|| SyncError::not_found(format!("task {id}")))
    }

    async fn invoke_function(&self, name: &str, body: Value) -> SyncResult<Value> {
        let reply: Value = send_json(self.client.post(self.function(name)).json(&body)).await?;
        if reply.get("success").and_then(Value::as_bool) == Some(false) {
            let message = reply
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown billing error");
            warn!(function = name, error = %message, "billing function reported failure");
            return Err(SyncError::remote(message));
        }
        Ok(reply)
    }
}

#[async_trait]
impl RemoteGateway for RestGateway {
    #[tracing::instrument(skip(self))]
    async fn list_tasks_for_user(&self, user_id: Uuid) -> SyncResult<Vec<Task>> {
        let mut tasks = self
            .select_tasks(("user_id", format!("eq.{user_id}")))
            .await?;

        let shared: Vec<SharedTaskRef> = send_json(self.client.get(self.rest("task_collaborators")).query(&[
            ("select", "task_id".to_string()),
            ("user_id", format!("eq.{user_id}")),
        ]))
        .await?;

        if !shared.is_empty() {
            let ids = shared
                .iter()
                .map(|r| r.task_id.to_string())
                .collect::<Vec<_>>()
                .join(",");
            tasks.extend(self.select_tasks(("id", format!("in.({ids})"))).await?);
        }

        let tasks = order_task_listing(tasks);
        debug!(count = tasks.len(), shared = shared.len(), "listed tasks");
        Ok(tasks)
    }

    #[tracing::instrument(skip(self, task), fields(title_len = task.title.len()))]
    async fn create_task(&self, user_id: Uuid, task: NewTask, board_id: Uuid) -> SyncResult<Task> {
        let insert = TaskInsert {
            title: task.title.as_str(),
            description: task.description.as_deref(),
            status: task.status,
            due_date: task.due_date,
            user_id,
            board_id,
        };
        let request = self.client.post(self.rest("tasks")).json(&insert);
        // The id is assigned remotely, so a missing row here means the insert was filtered.
        self.single_task(request, Uuid::nil()).await
    }

    #[tracing::instrument(skip(self, patch))]
    async fn update_task(&self, id: Uuid, patch: TaskPatch) -> SyncResult<Task> {
        let request = self
            .client
            .patch(self.rest("tasks"))
            .query(&[("id", format!("eq.{id}"))])
            .json(&patch);
        self.single_task(request, id).await
    }

    #[tracing::instrument(skip(self))]
    async fn delete_task(&self, id: Uuid) -> SyncResult<()> {
        let id_filter = ("id", format!("eq.{id}"));
        let deleted: Vec<Value> = send_json(
            self.client
                .delete(self.rest("tasks"))
                .query(&[("select", "id".to_string()), id_filter.clone()])
                .header("Prefer", "return=representation"),
        )
        .await?;
        if !deleted.is_empty() {
            return Ok(());
        }

        // Row-level security answers a refused delete with an empty list too.
        let visible: Vec<Value> = send_json(
            self.client
                .get(self.rest("tasks"))
                .query(&[("select", "id".to_string()), id_filter]),
        )
        .await?;
        Err(empty_delete_error(id, !visible.is_empty()))
    }

    #[tracing::instrument(skip(self))]
    async fn list_boards_for_user(&self, user_id: Uuid) -> SyncResult<Vec<Board>> {
        send_json(self.client.get(self.rest("boards")).query(&[
            ("user_id", format!("eq.{user_id}")),
            ("order", "created_at.desc".to_string()),
        ]))
        .await
    }

    #[tracing::instrument(skip(self, board), fields(name = %board.name))]
    async fn create_board(&self, user_id: Uuid, board: NewBoard) -> SyncResult<Board> {
        let insert = BoardInsert {
            name: board.name.as_str(),
            description: board.description.as_deref(),
            user_id,
        };
        let rows: Vec<Board> = send_json(
            self.client
                .post(self.rest("boards"))
                .header("Prefer", "return=representation")
                .json(&insert),
        )
        .await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| SyncError::remote("board insert returned no row"))
    }

    #[tracing::instrument(skip(self))]
    async fn fetch_subscription(&self, user_id: Uuid) -> SyncResult<Option<SubscriptionPlan>> {
        let rows: Vec<SubscriptionPlan> = send_json(self.client.get(self.rest("subscriptions")).query(&[
            ("user_id", format!("eq.{user_id}")),
            ("order", "updated_at.desc".to_string()),
            ("limit", "1".to_string()),
        ]))
        .await?;
        Ok(rows.into_iter().next())
    }

    #[tracing::instrument(skip(self))]
    async fn check_subscription(&self) -> SyncResult<Option<SubscriptionPlan>> {
        let reply = self.invoke_function("check-subscription", json!({})).await?;
        parse_plan_reply(reply)
    }

    #[tracing::instrument(skip(self))]
    async fn create_billing_portal_session(&self, return_url: &str) -> SyncResult<String> {
        let reply = self
            .invoke_function("customer-portal", json!({ "returnUrl": return_url }))
            .await?;
        reply
            .get("url")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| SyncError::remote("customer portal reply had no url"))
    }

    #[tracing::instrument(skip(self))]
    async fn add_collaborator(&self, task_id: Uuid, user_id: Uuid) -> SyncResult<()> {
        expect_success(
            self.client
                .post(self.rest("task_collaborators"))
                .json(&json!({ "task_id": task_id, "user_id": user_id })),
        )
        .await
    }

    #[tracing::instrument(skip(self))]
    async fn remove_collaborator(&self, task_id: Uuid, user_id: Uuid) -> SyncResult<()> {
        expect_success(self.client.delete(self.rest("task_collaborators")).query(&[
            ("task_id", format!("eq.{task_id}")),
            ("user_id", format!("eq.{user_id}")),
        ]))
        .await
    }

    #[tracing::instrument(skip(self))]
    async fn ensure_bucket(&self, bucket: &str) -> SyncResult<()> {
        if self.known_buckets.lock().contains(bucket) {
            return Ok(());
        }

        let response = self
            .client
            .get(self.storage(&format!("bucket/{bucket}")))
            .send()
            .await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            // Storage answers a missing bucket with 400 + "not found" as well as 404.
            let missing = status == StatusCode::NOT_FOUND
                || (status == StatusCode::BAD_REQUEST && body.to_ascii_lowercase().contains("not found"));
            if !missing {
                return Err(SyncError::from_status(status.as_u16(), &body));
            }

            info!(bucket, "creating storage bucket");
            expect_success(
                self.client
                    .post(self.storage("bucket"))
                    .json(&json!({ "id": bucket, "name": bucket, "public": true })),
            )
            .await?;
        }

        self.known_buckets.lock().insert(bucket.to_string());
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn resolve_public_url(&self, bucket: &str, path: &str) -> SyncResult<String> {
        let path = path.trim_start_matches('/');
        if path.is_empty() {
            return Err(SyncError::validation("object path is empty"));
        }
        let url = self.storage(&format!("object/public/{bucket}/{path}"));
        let response = self.client.head(url.as_str()).send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::BAD_REQUEST {
            return Err(SyncError::not_found(format!("{bucket}/{path}")));
        }
        if !status.is_success() {
            return Err(SyncError::from_status(status.as_u16(), ""));
        }
        Ok(url)
    }
}

async fn send_json<T: DeserializeOwned>(request: RequestBuilder) -> SyncResult<T> {
    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(SyncError::from_status(status.as_u16(), &body));
    }
    let is_json = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_none_or(|v| v.contains("json"));
    if !is_json {
        warn!(status = %status, "remote reply is not labelled as json");
    }
    response
        .json::<T>()
        .await
        .map_err(|e| SyncError::remote(format!("failed decoding remote reply: {e}")))
}

async fn expect_success(request: RequestBuilder) -> SyncResult<()> {
    let response = request.send().await?;
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(SyncError::from_status(status.as_u16(), &body))
}

fn empty_delete_error(id: Uuid, still_visible: bool) -> SyncError {
    if still_visible {
        warn!(task_id = %id, "delete matched no rows but the task is still visible");
        SyncError::validation(format!(
            "task {id} was not deleted; only its owner can delete it"
        ))
    } else {
        SyncError::not_found(format!("task {id}"))
    }
}

/// `check-subscription` answers either `{subscription: plan|null}` or the
/// plan fields at top level; anything without plan fields means no plan.
fn parse_plan_reply(reply: Value) -> SyncResult<Option<SubscriptionPlan>> {
    let candidate = match reply.get("subscription") {
        Some(Value::Null) => return Ok(None),
        Some(inner) => inner.clone(),
        None => reply,
    };
    if candidate.get("plan_type").is_none() {
        return Ok(None);
    }
    serde_json::from_value(candidate)
        .map(Some)
        .map_err(|e| SyncError::remote(format!("malformed subscription reply: {e}")))
}
