//! Refresh orchestration: configuration, the TTL cache with single-flight
//! refreshes, and the HR analytics computed from cleaned sheets.

pub mod analytics;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use pgd_adapters::clean_sheet;
use pgd_core::{CachedTable, SheetId};
use pgd_storage::{FetchError, HttpClientConfig, HttpSheetFetcher, SheetSource};
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pgd-sync";

pub const DEFAULT_TTL: Duration = Duration::from_secs(2 * 60 * 60);

pub const DEFAULT_USERS_FILE: &str = "./users.yaml";

/// Identity file named by `PGD_USERS_FILE`, or [`DEFAULT_USERS_FILE`].
pub fn users_file_from(var: impl Fn(&str) -> Option<String>) -> PathBuf {
    var("PGD_USERS_FILE")
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_USERS_FILE))
}

#[derive(Clone)]
pub struct DashboardConfig {
    pub sheets_url: String,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub cache_policy: CachePolicy,
    pub users_file: PathBuf,
    pub web_port: u16,
}

impl fmt::Debug for DashboardConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DashboardConfig")
            .field("sheets_url", &"<redacted>")
            .field("http_timeout_secs", &self.http_timeout_secs)
            .field("user_agent", &self.user_agent)
            .field("cache_policy", &self.cache_policy)
            .field("users_file", &self.users_file)
            .field("web_port", &self.web_port)
            .finish()
    }
}

impl DashboardConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Builds the config from any variable lookup; unparsable numbers fall back to defaults.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let secs = |key: &str| var(key).and_then(|v| v.trim().parse::<u64>().ok());

        let sheets_url = var("PGD_SHEETS_URL")
            .filter(|v| !v.trim().is_empty())
            .context("PGD_SHEETS_URL must point at the spreadsheet endpoint")?;

        let mut cache_policy =
            CachePolicy::uniform(secs("PGD_TTL_SECS").map(Duration::from_secs).unwrap_or(DEFAULT_TTL));
        for sheet in SheetId::ALL {
            let key = format!("PGD_TTL_{}_SECS", sheet.as_str().to_ascii_uppercase());
            if let Some(ttl) = secs(&key) {
                cache_policy = cache_policy.with_ttl(sheet, Duration::from_secs(ttl));
            }
        }

        Ok(Self {
            sheets_url: sheets_url.trim().to_string(),
            http_timeout_secs: secs("PGD_HTTP_TIMEOUT_SECS").unwrap_or(15),
            user_agent: var("PGD_USER_AGENT").unwrap_or_else(|| "pgd-dashboard/0.1".to_string()),
            cache_policy,
            users_file: users_file_from(&var),
            web_port: var("PGD_WEB_PORT")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(8000),
        })
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs.max(1)),
            user_agent: Some(self.user_agent.clone()),
        }
    }
}

/// Freshness bound per sheet kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePolicy {
    default_ttl: Duration,
    overrides: BTreeMap<SheetId, Duration>,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self::uniform(DEFAULT_TTL)
    }
}

impl CachePolicy {
    pub fn uniform(ttl: Duration) -> Self {
        Self {
            default_ttl: ttl,
            overrides: BTreeMap::new(),
        }
    }

    pub fn with_ttl(mut self, sheet: SheetId, ttl: Duration) -> Self {
        self.overrides.insert(sheet, ttl);
        self
    }

    pub fn ttl(&self, sheet: SheetId) -> Duration {
        self.overrides.get(&sheet).copied().unwrap_or(self.default_ttl)
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// True when nothing was fetched yet or at least `ttl` has elapsed since `last_fetched_at`.
pub fn is_stale_at(last_fetched_at: Option<DateTime<Utc>>, ttl: Duration, now: DateTime<Utc>) -> bool {
    let Some(last) = last_fetched_at else {
        return true;
    };
    let ttl = TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX);
    now.signed_duration_since(last) >= ttl
}

pub fn is_stale(last_fetched_at: Option<DateTime<Utc>>, ttl: Duration) -> bool {
    is_stale_at(last_fetched_at, ttl, Utc::now())
}

/// What a caller gets back for one sheet.
#[derive(Debug, Clone)]
pub enum SheetLookup {
    /// Served from cache without contacting the endpoint.
    Fresh(Arc<CachedTable>),
    /// Fetched and cleaned during this call (or a call it joined).
    Refreshed(Arc<CachedTable>),
    /// Refresh failed; the previous table is still served.
    Stale {
        cached: Arc<CachedTable>,
        error: FetchError,
    },
    /// Refresh failed and nothing was cached.
    Unavailable(FetchError),
}

impl SheetLookup {
    pub fn table(&self) -> Option<&Arc<CachedTable>> {
        match self {
            SheetLookup::Fresh(t) | SheetLookup::Refreshed(t) => Some(t),
            SheetLookup::Stale { cached, .. } => Some(cached),
            SheetLookup::Unavailable(_) => None,
        }
    }

    pub fn error(&self) -> Option<&FetchError> {
        match self {
            SheetLookup::Stale { error, .. } | SheetLookup::Unavailable(error) => Some(error),
            _ => None,
        }
    }

    pub fn status(&self) -> &'static str {
        match self {
            SheetLookup::Fresh(_) => "fresh",
            SheetLookup::Refreshed(_) => "refreshed",
            SheetLookup::Stale { .. } => "stale",
            SheetLookup::Unavailable(_) => "unavailable",
        }
    }
}

#[derive(Debug, Clone)]
enum RefreshOutcome {
    Fetched(Arc<CachedTable>),
    AlreadyFresh(Arc<CachedTable>),
    Failed(FetchError),
}

type InflightMap = HashMap<SheetId, watch::Receiver<Option<RefreshOutcome>>>;

struct CacheInner {
    source: Arc<dyn SheetSource>,
    clock: Arc<dyn Clock>,
    policy: CachePolicy,
    entries: RwLock<HashMap<SheetId, Arc<CachedTable>>>,
    inflight: Mutex<InflightMap>,
}

/// Organization-wide cache of cleaned sheets, shared by every session.
///
/// At most one refresh per sheet runs at a time. The refresh runs on its own
/// task, so a caller that gives up waiting does not cancel it for the others.
#[derive(Clone)]
pub struct SheetCache {
    inner: Arc<CacheInner>,
}

/// Clears the in-flight slot even if the refresh task panics.
struct InflightSlot {
    inner: Arc<CacheInner>,
    sheet: SheetId,
}

impl Drop for InflightSlot {
    fn drop(&mut self) {
        self.inner
            .inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.sheet);
    }
}

impl SheetCache {
    pub fn new(source: Arc<dyn SheetSource>, policy: CachePolicy) -> Self {
        Self::with_clock(source, policy, Arc::new(SystemClock))
    }

    pub fn with_clock(source: Arc<dyn SheetSource>, policy: CachePolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                source,
                clock,
                policy,
                entries: RwLock::new(HashMap::new()),
                inflight: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn from_config(config: &DashboardConfig) -> Result<Self> {
        let fetcher = HttpSheetFetcher::new(&config.sheets_url, config.http_client_config())?;
        Ok(Self::new(Arc::new(fetcher), config.cache_policy.clone()))
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.inner.policy
    }

    /// Current entry without triggering a refresh.
    pub async fn cached(&self, sheet: SheetId) -> Option<Arc<CachedTable>> {
        self.inner.entries.read().await.get(&sheet).cloned()
    }

    pub async fn last_updated(&self, sheet: SheetId) -> Option<DateTime<Utc>> {
        self.cached(sheet).await.map(|c| c.fetched_at)
    }

    pub async fn get_or_refresh(&self, sheet: SheetId) -> SheetLookup {
        self.get_with_max_age(sheet, self.inner.policy.ttl(sheet)).await
    }

    pub async fn get_with_max_age(&self, sheet: SheetId, max_age: Duration) -> SheetLookup {
        if let Some(cached) = self.cached(sheet).await {
            if !is_stale_at(Some(cached.fetched_at), max_age, self.inner.clock.now()) {
                debug!(sheet = %sheet, fetched_at = %cached.fetched_at, "sheet served from cache");
                return SheetLookup::Fresh(cached);
            }
        }
        let outcome = self.refresh_shared(sheet, Some(max_age)).await;
        self.resolve(sheet, outcome).await
    }

    /// Fetches again regardless of age (the manual reload action).
    ///
    /// The current entry stays in place, so a failed reload serves it as `Stale`.
    pub async fn reload(&self, sheet: SheetId) -> SheetLookup {
        let outcome = self.refresh_shared(sheet, None).await;
        self.resolve(sheet, outcome).await
    }

    pub async fn invalidate(&self, sheet: SheetId) {
        if self.inner.entries.write().await.remove(&sheet).is_some() {
            info!(sheet = %sheet, "sheet cache invalidated");
        }
    }

    pub async fn invalidate_all(&self) {
        let mut entries = self.inner.entries.write().await;
        let dropped = entries.len();
        entries.clear();
        info!(dropped, "sheet cache cleared");
    }

    /// Refreshes every listed sheet that is stale; fresh ones are returned as-is.
    pub async fn ensure_fresh(&self, sheets: &[SheetId]) -> Vec<(SheetId, SheetLookup)> {
        let mut out = Vec::with_capacity(sheets.len());
        for &sheet in sheets {
            out.push((sheet, self.get_or_refresh(sheet).await));
        }
        out
    }

    pub async fn auto_update_check(&self) -> Vec<(SheetId, SheetLookup)> {
        self.ensure_fresh(&SheetId::ALL).await
    }

    async fn resolve(&self, sheet: SheetId, outcome: RefreshOutcome) -> SheetLookup {
        match outcome {
            RefreshOutcome::Fetched(table) => SheetLookup::Refreshed(table),
            RefreshOutcome::AlreadyFresh(table) => SheetLookup::Fresh(table),
            RefreshOutcome::Failed(error) => match self.cached(sheet).await {
                Some(cached) => SheetLookup::Stale { cached, error },
                None => SheetLookup::Unavailable(error),
            },
        }
    }

    /// Joins the in-flight refresh for `sheet`, starting one if none is running.
    ///
    /// With `max_age`, a newly started refresh first re-reads the entry and skips
    /// the fetch when an earlier refresh already made it fresh.
    async fn refresh_shared(&self, sheet: SheetId, max_age: Option<Duration>) -> RefreshOutcome {
        let mut rx = {
            let mut inflight = self
                .inner
                .inflight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match inflight.get(&sheet) {
                Some(rx) => {
                    debug!(sheet = %sheet, "joining in-flight refresh");
                    rx.clone()
                }
                None => {
                    let (tx, rx) = watch::channel(None);
                    inflight.insert(sheet, rx.clone());
                    let slot = InflightSlot {
                        inner: Arc::clone(&self.inner),
                        sheet,
                    };
                    tokio::spawn(async move {
                        let outcome = slot.inner.refresh_unless_fresh(sheet, max_age).await;
                        // Publish before the slot is released so late joiners see the result.
                        let _ = tx.send(Some(outcome));
                        drop(slot);
                    });
                    rx
                }
            }
        };

        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(value) => (*value).clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| {
            RefreshOutcome::Failed(FetchError::Aborted(format!(
                "refresh of {sheet} ended without a result"
            )))
        })
    }
}

impl CacheInner {
    async fn refresh_unless_fresh(&self, sheet: SheetId, max_age: Option<Duration>) -> RefreshOutcome {
        if let Some(max_age) = max_age {
            let current = self.entries.read().await.get(&sheet).cloned();
            if let Some(cached) = current {
                if !is_stale_at(Some(cached.fetched_at), max_age, self.clock.now()) {
                    debug!(sheet = %sheet, fetched_at = %cached.fetched_at, "sheet already refreshed");
                    return RefreshOutcome::AlreadyFresh(cached);
                }
            }
        }
        self.run_refresh(sheet).await
    }

    async fn run_refresh(&self, sheet: SheetId) -> RefreshOutcome {
        let refresh_id = Uuid::new_v4();
        let span = info_span!("sheet_refresh", %refresh_id, sheet = %sheet);
        async {
            let started = Instant::now();
            match self.source.fetch(sheet).await {
                Ok(raw) => {
                    let table = clean_sheet(sheet, &raw);
                    let rows = table.len();
                    let cached = self.store(sheet, table).await;
                    info!(
                        rows,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        fetched_at = %cached.fetched_at,
                        "sheet refreshed"
                    );
                    RefreshOutcome::Fetched(cached)
                }
                Err(error) => {
                    warn!(
                        %error,
                        disposition = ?error.disposition(),
                        "sheet refresh failed; previous data kept"
                    );
                    RefreshOutcome::Failed(error)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn store(&self, sheet: SheetId, table: pgd_core::CleanedTable) -> Arc<CachedTable> {
        let mut entries = self.entries.write().await;
        let now = self.clock.now();
        // Timestamps never move backwards for a sheet, even if the clock does.
        let fetched_at = entries
            .get(&sheet)
            .map(|prev| prev.fetched_at.max(now))
            .unwrap_or(now);
        let cached = Arc::new(CachedTable { table, fetched_at });
        entries.insert(sheet, Arc::clone(&cached));
        cached
    }
}
