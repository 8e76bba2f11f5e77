use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, anyhow, bail};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cli::{BoardCommand, Command, PlanCommand, TaskCommand};
use crate::config::Config;
use crate::events::{NoticeLevel, SyncEvent, drain};
use crate::gateway::{MemoryGateway, RemoteGateway, RestGateway};
use crate::loader::{AvatarImage, AvatarResolver, HttpFetcher};
use crate::model::{NewTask, Task, TaskCounterState, TaskPatch};
use crate::session::Session;
use crate::store::UpdateOutcome;

#[tracing::instrument(skip(cfg, command, out))]
pub async fn dispatch<W: Write>(
    cfg: &Config,
    offline: bool,
    command: Command,
    out: &mut W,
) -> anyhow::Result<()> {
    let (gateway, user_id) = connect(cfg, offline)?;
    let session = Session::new(gateway.clone(), cfg.session_options());
    let mut events = session.subscribe();

    session.login(user_id).await;

    let result = run_command(cfg, &session, gateway, user_id, command, out).await;

    for event in drain(&mut events) {
        if let SyncEvent::Notice(notice) = event {
            let label = match notice.level {
                NoticeLevel::Info => "note",
                NoticeLevel::Warning => "warning",
                NoticeLevel::Error => "error",
            };
            eprintln!("{label}: {}", notice.message);
        }
    }

    result
}

fn connect(cfg: &Config, offline: bool) -> anyhow::Result<(Arc<dyn RemoteGateway>, Uuid)> {
    if offline {
        let user_id = cfg.user_id().unwrap_or_else(|_| Uuid::new_v4());
        let gateway = MemoryGateway::new();
        gateway.sign_in(user_id);
        info!(%user_id, "using in-process store");
        return Ok((Arc::new(gateway), user_id));
    }

    let user_id = cfg.user_id()?;
    let gateway = RestGateway::new(cfg.remote_config()).context("failed to set up remote gateway")?;
    Ok((Arc::new(gateway), user_id))
}

async fn run_command<W: Write>(
    cfg: &Config,
    session: &Session,
    gateway: Arc<dyn RemoteGateway>,
    user_id: Uuid,
    command: Command,
    out: &mut W,
) -> anyhow::Result<()> {
    match command {
        Command::Tasks(TaskCommand::List { board }) => {
            if let Some(board_id) = board {
                let boards = gateway.list_boards_for_user(user_id).await?;
                let board = boards
                    .into_iter()
                    .find(|b| b.id == board_id)
                    .ok_or_else(|| anyhow!("no board {board_id} for this user"))?;
                session.select_board(Some(board)).await?;
            }
            let scope = session.current_board().map(|b| b.id);
            let tasks: Vec<Task> = session
                .tasks()
                .into_iter()
                .filter(|t| scope.is_none_or(|id| t.board_id == id))
                .collect();
            for task in &tasks {
                writeln!(out, "{}", format_task(task))?;
            }
            writeln!(out, "{}", format_counter(&session.counter()))?;
        }
        Command::Tasks(TaskCommand::Add {
            title,
            description,
            board,
        }) => {
            let task = session
                .create_task(NewTask {
                    title,
                    description,
                    board_id: board,
                    ..NewTask::default()
                })
                .await?;
            writeln!(out, "created {}", format_task(&task))?;
            writeln!(out, "{}", format_counter(&session.counter()))?;
        }
        Command::Tasks(TaskCommand::Update {
            id,
            title,
            status,
            description,
        }) => {
            let patch = TaskPatch {
                title,
                status,
                description: description.map(Some),
                ..TaskPatch::default()
            };
            if patch.is_empty() {
                bail!("nothing to update; pass --title, --status or --description");
            }
            match session.update_task(id, patch).await? {
                UpdateOutcome::Confirmed(task) => writeln!(out, "updated {}", format_task(&task))?,
                UpdateOutcome::ConfirmedSuperseded => writeln!(out, "updated {id}")?,
                UpdateOutcome::KeptLocal(err) => return Err(anyhow!(err).context("update not saved")),
                UpdateOutcome::Unknown => bail!("no task {id} visible to this user"),
            }
        }
        Command::Tasks(TaskCommand::Delete { id }) => {
            if !session.delete_task(id).await? {
                bail!("task {id} was not deleted");
            }
            writeln!(out, "deleted {id}")?;
            writeln!(out, "{}", format_counter(&session.counter()))?;
        }
        Command::Tasks(TaskCommand::Share { id, user }) => {
            if !session.share_task(id, user).await? {
                bail!("task {id} was not shared");
            }
            writeln!(out, "shared {id} with {user}")?;
        }
        Command::Board(BoardCommand::Default) => {
            let board = session.default_board().await?;
            writeln!(out, "{}  {}", board.id, board.name)?;
        }
        Command::Plan(PlanCommand::Status) => {
            match session.plan() {
                Some(plan) => writeln!(
                    out,
                    "plan {:?} ({:?}) effective {:?}",
                    plan.plan_type,
                    plan.status,
                    plan.effective_type()
                )?,
                None => writeln!(out, "no subscription; free plan applies")?,
            }
            writeln!(out, "{}", format_counter(&session.counter()))?;
        }
        Command::Plan(PlanCommand::Portal { return_url }) => {
            let return_url = return_url.unwrap_or_else(|| cfg.billing.return_url.clone());
            let url = session
                .open_billing_portal(&return_url)
                .await?
                .ok_or_else(|| anyhow!("billing portal is unavailable"))?;
            writeln!(out, "{url}")?;
        }
        Command::Avatar { path } => {
            let fetcher = Arc::new(HttpFetcher::new()?);
            let resolver = AvatarResolver::new(
                gateway,
                fetcher,
                cfg.storage.avatar_bucket.clone(),
                cfg.load_options(),
            );
            match resolver.load(Some(path.as_str())).await {
                AvatarImage::Image { url, bytes } => {
                    debug!(url = %url, size = bytes.len(), "avatar fetched");
                    writeln!(out, "{url} ({} bytes)", bytes.len())?;
                }
                AvatarImage::Fallback => {
                    warn!(path = %path, state = ?resolver.state(), "avatar unavailable");
                    writeln!(out, "avatar unavailable; using fallback")?;
                }
            }
        }
    }

    Ok(())
}

fn format_task(task: &Task) -> String {
    let due = task
        .due_date
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "-".to_string());
    let shared = if task.collaborators.is_empty() {
        String::new()
    } else {
        format!("  +{} shared", task.collaborators.len())
    };
    format!(
        "{}  {:<10}  {:<10}  {}{}",
        task.id, task.status, due, task.title, shared
    )
}

fn format_counter(counter: &TaskCounterState) -> String {
    match counter.total_limit {
        Some(limit) => format!("{} of {} tasks used", counter.total_tasks, limit),
        None => format!("{} tasks (unlimited plan)", counter.total_tasks),
    }
}
