use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::gateway::RemoteGateway;

#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> SyncResult<Vec<u8>>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| SyncError::remote(format!("failed building HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ResourceFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> SyncResult<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .header(reqwest::header::CACHE_CONTROL, "no-cache")
            .header(reqwest::header::PRAGMA, "no-cache")
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::from_status(status.as_u16(), "resource request failed"));
        }
        Ok(response.bytes().await?.to_vec())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn none() -> Self {
        Self {
            base: Duration::ZERO,
            max: Duration::ZERO,
        }
    }

    /// Delay after the failed attempt number `attempt` (0-based): `base * 2^attempt`, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.base.saturating_mul(factor).min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(250),
            max: Duration::from_secs(4),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOptions {
    pub max_retries: u32,
    pub timeout: Duration,
    pub backoff: Backoff,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            timeout: Duration::from_secs(10),
            backoff: Backoff::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoadState {
    Idle,
    Loading { url: String, attempt: u32 },
    Loaded { url: String, bytes: Arc<Vec<u8>> },
    Failed { url: String, attempts: u32, error: SyncError },
}

impl LoadState {
    pub fn url(&self) -> Option<&str> {
        match self {
            Self::Idle => None,
            Self::Loading { url, .. } | Self::Loaded { url, .. } | Self::Failed { url, .. } => {
                Some(url.as_str())
            }
        }
    }

    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Loaded { .. } | Self::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    Settled(LoadState),
    /// A newer `load` took over the slot; this call's result was dropped.
    Superseded,
}

#[derive(Debug)]
struct Slot {
    generation: u64,
    state: LoadState,
}

/// One image slot. A result that arrives after a newer `load` started on the
/// slot is dropped; `load` never errors and settles on `Loaded` or `Failed`.
pub struct ResourceLoader {
    fetcher: Arc<dyn ResourceFetcher>,
    slot: Mutex<Slot>,
}

impl ResourceLoader {
    pub fn new(fetcher: Arc<dyn ResourceFetcher>) -> Self {
        Self {
            fetcher,
            slot: Mutex::new(Slot {
                generation: 0,
                state: LoadState::Idle,
            }),
        }
    }

    pub fn state(&self) -> LoadState {
        self.slot.lock().state.clone()
    }

    pub fn reset(&self) {
        let mut slot = self.slot.lock();
        slot.generation += 1;
        slot.state = LoadState::Idle;
    }

    #[tracing::instrument(skip(self, options), fields(max_retries = options.max_retries))]
    pub async fn load(&self, url: &str, options: LoadOptions) -> LoadOutcome {
        let url = url.trim().to_string();
        let ticket = {
            let mut slot = self.slot.lock();
            if let LoadState::Loaded { url: loaded, .. } = &slot.state
                && *loaded == url
            {
                debug!(url = %url, "resource already loaded for slot");
                return LoadOutcome::Settled(slot.state.clone());
            }
            slot.generation += 1;
            slot.state = LoadState::Loading {
                url: url.clone(),
                attempt: 1,
            };
            slot.generation
        };

        if url.is_empty() {
            return self.settle(
                ticket,
                LoadState::Failed {
                    url,
                    attempts: 0,
                    error: SyncError::validation("resource url is empty"),
                },
            );
        }

        let timeout_ms = u64::try_from(options.timeout.as_millis()).unwrap_or(u64::MAX);
        let total_attempts = options.max_retries.saturating_add(1);
        let mut last_error = SyncError::remote("no attempt made");

        for attempt in 0..total_attempts {
            if !self.mark_attempt(ticket, &url, attempt + 1) {
                debug!(url = %url, "load superseded before attempt");
                return LoadOutcome::Superseded;
            }

            let busted = cache_busted_url(&url, Utc::now().timestamp_millis(), attempt + 1);
            let result = tokio::time::timeout(options.timeout, self.fetcher.fetch(&busted)).await;

            match result {
                Ok(Ok(bytes)) => {
                    debug!(url = %url, attempt = attempt + 1, size = bytes.len(), "resource loaded");
                    return self.settle(
                        ticket,
                        LoadState::Loaded {
                            url,
                            bytes: Arc::new(bytes),
                        },
                    );
                }
                Ok(Err(err)) => {
                    warn!(url = %url, attempt = attempt + 1, error = %err, "resource attempt failed");
                    last_error = err;
                }
                Err(_) => {
                    warn!(url = %url, attempt = attempt + 1, timeout_ms, "resource attempt timed out");
                    last_error = SyncError::Timeout(timeout_ms);
                }
            }

            if attempt + 1 < total_attempts {
                tokio::time::sleep(options.backoff.delay_for(attempt)).await;
            }
        }

        info!(url = %url, attempts = total_attempts, "resource unavailable, falling back");
        self.settle(
            ticket,
            LoadState::Failed {
                url,
                attempts: total_attempts,
                error: last_error,
            },
        )
    }

    fn mark_attempt(&self, ticket: u64, url: &str, attempt: u32) -> bool {
        let mut slot = self.slot.lock();
        if slot.generation != ticket {
            return false;
        }
        slot.state = LoadState::Loading {
            url: url.to_string(),
            attempt,
        };
        true
    }

    fn settle(&self, ticket: u64, state: LoadState) -> LoadOutcome {
        let mut slot = self.slot.lock();
        if slot.generation != ticket {
            debug!(url = ?state.url(), "dropping stale resource result");
            return LoadOutcome::Superseded;
        }
        slot.state = state.clone();
        LoadOutcome::Settled(state)
    }
}

/// Appends `t=<millis>-<attempt>` ahead of any fragment.
pub fn cache_busted_url(url: &str, now_millis: i64, attempt: u32) -> String {
    let (base, fragment) = match url.split_once('#') {
        Some((base, fragment)) => (base, Some(fragment)),
        None => (url, None),
    };
    let separator = if base.contains('?') { '&' } else { '?' };
    let mut out = format!("{base}{separator}t={now_millis}-{attempt}");
    if let Some(fragment) = fragment {
        out.push('#');
        out.push_str(fragment);
    }
    out
}

#[derive(Debug, Clone, PartialEq)]
pub enum AvatarImage {
    Image { url: String, bytes: Arc<Vec<u8>> },
    Fallback,
}

pub struct AvatarResolver {
    gateway: Arc<dyn RemoteGateway>,
    loader: ResourceLoader,
    bucket: String,
    options: LoadOptions,
}

impl AvatarResolver {
    pub fn new(
        gateway: Arc<dyn RemoteGateway>,
        fetcher: Arc<dyn ResourceFetcher>,
        bucket: impl Into<String>,
        options: LoadOptions,
    ) -> Self {
        Self {
            gateway,
            loader: ResourceLoader::new(fetcher),
            bucket: bucket.into(),
            options,
        }
    }

    pub fn state(&self) -> LoadState {
        self.loader.state()
    }

    #[tracing::instrument(skip(self), fields(bucket = %self.bucket))]
    pub async fn load(&self, path: Option<&str>) -> AvatarImage {
        let Some(path) = path.map(str::trim).filter(|p| !p.is_empty()) else {
            self.loader.reset();
            return AvatarImage::Fallback;
        };

        if let Err(err) = self.gateway.ensure_bucket(&self.bucket).await {
            warn!(error = %err, "avatar bucket unavailable");
            self.loader.reset();
            return AvatarImage::Fallback;
        }

        let url = match self.gateway.resolve_public_url(&self.bucket, path).await {
            Ok(url) => url,
            Err(err) => {
                if err.is_not_found() {
                    debug!(path, "avatar object missing");
                } else {
                    warn!(path, error = %err, "failed resolving avatar url");
                }
                self.loader.reset();
                return AvatarImage::Fallback;
            }
        };

        match self.loader.load(&url, self.options).await {
            LoadOutcome::Settled(LoadState::Loaded { url, bytes }) => AvatarImage::Image { url, bytes },
            _ => AvatarImage::Fallback,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::gateway::MemoryGateway;
    use crate::gateway::memory::{OP_ENSURE_BUCKET, OP_RESOLVE_URL};

    #[derive(Default)]
    struct ScriptedFetcher {
        replies: Mutex<VecDeque<SyncResult<Vec<u8>>>>,
        seen: Mutex<Vec<String>>,
    }

    impl ScriptedFetcher {
        fn with(replies: Vec<SyncResult<Vec<u8>>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ResourceFetcher for ScriptedFetcher {
        async fn fetch(&self, url: &str) -> SyncResult<Vec<u8>> {
            self.seen.lock().push(url.to_string());
            let reply = self.replies.lock().pop_front();
            reply.unwrap_or_else(|| Err(SyncError::remote("connection refused")))
        }
    }

    fn quick(max_retries: u32) -> LoadOptions {
        LoadOptions {
            max_retries,
            timeout: Duration::from_millis(200),
            backoff: Backoff::default(),
        }
    }

    #[test]
    fn cache_bust_respects_query_and_fragment() {
        assert_eq!(cache_busted_url("https://x/a.png", 42, 1), "https://x/a.png?t=42-1");
        assert_eq!(
            cache_busted_url("https://x/a.png?size=64#top", 42, 2),
            "https://x/a.png?size=64&t=42-2#top"
        );
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let backoff = Backoff {
            base: Duration::from_millis(100),
            max: Duration::from_millis(500),
        };
        assert_eq!(backoff.delay_for(0), Duration::from_millis(100));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(400));
        assert_eq!(backoff.delay_for(3), Duration::from_millis(500));
        assert_eq!(backoff.delay_for(40), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_takes_retries_plus_one_attempts() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        let loader = ResourceLoader::new(fetcher.clone());

        let outcome = loader.load("https://cdn/avatar.png", quick(3)).await;

        assert!(matches!(
            outcome,
            LoadOutcome::Settled(LoadState::Failed { attempts: 4, .. })
        ));
        let seen = fetcher.seen.lock().clone();
        assert_eq!(seen.len(), 4);
        assert!(seen.iter().all(|u| u.starts_with("https://cdn/avatar.png?t=")));
        let unique: std::collections::HashSet<_> = seen.iter().collect();
        assert_eq!(unique.len(), 4);

        // Nothing re-enters loading on its own.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(matches!(loader.state(), LoadState::Failed { .. }));
        assert_eq!(fetcher.seen.lock().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failure() {
        let fetcher = Arc::new(ScriptedFetcher::with(vec![
            Err(SyncError::remote("502")),
            Ok(vec![1, 2, 3]),
        ]));
        let loader = ResourceLoader::new(fetcher.clone());

        let outcome = loader.load("https://cdn/a.png", quick(2)).await;
        match outcome {
            LoadOutcome::Settled(LoadState::Loaded { bytes, .. }) => assert_eq!(*bytes, vec![1, 2, 3]),
            other => panic!("expected loaded, got {other:?}"),
        }
        assert_eq!(fetcher.seen.lock().len(), 2);
    }

    struct StallingFetcher;

    #[async_trait]
    impl ResourceFetcher for StallingFetcher {
        async fn fetch(&self, _url: &str) -> SyncResult<Vec<u8>> {
            std::future::pending::<()>().await;
            Ok(vec![])
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_requests_time_out() {
        let loader = ResourceLoader::new(Arc::new(StallingFetcher));
        let outcome = loader.load("https://cdn/slow.png", quick(1)).await;
        assert!(matches!(
            outcome,
            LoadOutcome::Settled(LoadState::Failed {
                attempts: 2,
                error: SyncError::Timeout(200),
                ..
            })
        ));
    }

    struct SlowThenFast;

    #[async_trait]
    impl ResourceFetcher for SlowThenFast {
        async fn fetch(&self, url: &str) -> SyncResult<Vec<u8>> {
            if url.contains("old") {
                tokio::time::sleep(Duration::from_millis(100)).await;
                return Ok(b"old".to_vec());
            }
            Ok(b"new".to_vec())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stale_result_is_discarded() {
        let loader = Arc::new(ResourceLoader::new(Arc::new(SlowThenFast)));

        let slow = {
            let loader = loader.clone();
            tokio::spawn(async move { loader.load("https://cdn/old.png", quick(0)).await })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;
        let fresh = loader.load("https://cdn/new.png", quick(0)).await;
        let stale = slow.await.expect("join");

        assert_eq!(stale, LoadOutcome::Superseded);
        assert!(matches!(fresh, LoadOutcome::Settled(LoadState::Loaded { .. })));
        assert_eq!(loader.state().url(), Some("https://cdn/new.png"));
    }

    #[tokio::test]
    async fn empty_url_fails_without_fetching() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        let loader = ResourceLoader::new(fetcher.clone());
        let outcome = loader.load("   ", quick(5)).await;
        assert!(matches!(
            outcome,
            LoadOutcome::Settled(LoadState::Failed { attempts: 0, .. })
        ));
        assert!(fetcher.seen.lock().is_empty());
    }

    fn avatar_resolver(gateway: Arc<MemoryGateway>, fetcher: Arc<ScriptedFetcher>) -> AvatarResolver {
        AvatarResolver::new(
            gateway,
            fetcher,
            "avatars",
            LoadOptions {
                max_retries: 1,
                timeout: Duration::from_millis(200),
                backoff: Backoff::none(),
            },
        )
    }

    #[tokio::test]
    async fn missing_avatar_creates_bucket_and_falls_back() {
        let gateway = Arc::new(MemoryGateway::new());
        let fetcher = Arc::new(ScriptedFetcher::default());
        let resolver = avatar_resolver(gateway.clone(), fetcher.clone());
        assert!(!gateway.has_bucket("avatars"));

        let image = resolver.load(Some("u/1.png")).await;

        assert_eq!(image, AvatarImage::Fallback);
        assert!(gateway.has_bucket("avatars"));
        assert_eq!(gateway.calls(OP_ENSURE_BUCKET), 1);
        assert_eq!(gateway.calls(OP_RESOLVE_URL), 1);
        assert!(fetcher.seen.lock().is_empty());
        assert_eq!(resolver.state(), LoadState::Idle);
    }

    #[tokio::test]
    async fn stored_avatar_loads_then_resets_on_missing_one() {
        let gateway = Arc::new(MemoryGateway::new());
        gateway.put_object("avatars", "u/1.png");
        let fetcher = Arc::new(ScriptedFetcher::with(vec![Ok(vec![7, 7, 7])]));
        let resolver = avatar_resolver(gateway.clone(), fetcher.clone());

        match resolver.load(Some("/u/1.png")).await {
            AvatarImage::Image { url, bytes } => {
                assert_eq!(url, "memory://storage/avatars/u/1.png");
                assert_eq!(*bytes, vec![7, 7, 7]);
            }
            AvatarImage::Fallback => panic!("expected stored avatar to load"),
        }
        assert!(resolver.state().is_settled());
        assert!(fetcher.seen.lock()[0].starts_with("memory://storage/avatars/u/1.png?t="));

        assert_eq!(resolver.load(Some("u/2.png")).await, AvatarImage::Fallback);
        assert_eq!(resolver.state(), LoadState::Idle);
        assert!(!resolver.state().is_settled());
    }

    #[tokio::test]
    async fn blank_path_or_bucket_failure_falls_back_early() {
        let gateway = Arc::new(MemoryGateway::new());
        let resolver = avatar_resolver(gateway.clone(), Arc::new(ScriptedFetcher::default()));

        assert_eq!(resolver.load(None).await, AvatarImage::Fallback);
        assert_eq!(resolver.load(Some("  ")).await, AvatarImage::Fallback);
        assert_eq!(gateway.calls(OP_ENSURE_BUCKET), 0);

        gateway.fail_next(OP_ENSURE_BUCKET, 1);
        assert_eq!(resolver.load(Some("u/1.png")).await, AvatarImage::Fallback);
        assert_eq!(gateway.calls(OP_RESOLVE_URL), 0);
    }
}
