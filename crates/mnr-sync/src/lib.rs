//! Region sync orchestration: fetch, extract, normalize, persist, reconcile history.

mod history;
mod notify;
mod subscriptions;

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use mnr_adapters::{extractor_for, normalize_for_region, ExtractionError};
use mnr_core::{
    builtin_regions, RegionCode, RegionConfig, RegionSnapshot, RewardHistory,
    REWARDS_COLLECTION, REWARDS_HISTORY_COLLECTION,
};
use mnr_storage::{
    load_document, save_document, DocumentStore, FetchError, FsDocumentStore, HttpClientConfig,
    HttpFetcher, PageArchive, PageSource, PgDocumentStore, StoreError,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use history::{first_new_reward, new_reward_ids, reconcile_history};
pub use notify::{
    DispatchReport, FcmNotifier, NewRewardWatcher, NotificationDispatcher, NotifyConfig,
    NotifyError, Notifier, PushMessage, SpontitNotifier,
};
pub use subscriptions::{
    update_topic_subscription, validate_subscription, IidTopicManager, SubscriptionError,
    SubscriptionRequest, TopicAction, TopicManager, TopicMembershipResult, ValidatedSubscription,
    ALLOWED_TOPICS,
};

pub const CRATE_NAME: &str = "mnr-sync";

pub const DEFAULT_REWARDS_URL: &str = "https://my.nintendo.com/reward_categories";
pub const DEFAULT_SITE_URL: &str = "https://my-nintendo-rewards.web.app";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub data_dir: PathBuf,
    pub archive_dir: Option<PathBuf>,
    pub regions_file: PathBuf,
    pub rewards_url: String,
    pub site_url: String,
    pub sync_interval_minutes: u32,
    pub http_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub sync_disabled_regions: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            data_dir: PathBuf::from("./data"),
            archive_dir: None,
            regions_file: PathBuf::from("./regions.yaml"),
            rewards_url: DEFAULT_REWARDS_URL.to_string(),
            site_url: DEFAULT_SITE_URL.to_string(),
            sync_interval_minutes: 10,
            http_timeout_secs: 15,
            scheduler_enabled: false,
            sync_disabled_regions: false,
        }
    }
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false)
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: env_nonempty("DATABASE_URL"),
            data_dir: env_nonempty("MNR_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            archive_dir: env_nonempty("MNR_ARCHIVE_DIR").map(PathBuf::from),
            regions_file: env_nonempty("MNR_REGIONS_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.regions_file),
            rewards_url: env_nonempty("MNR_REWARDS_URL").unwrap_or(defaults.rewards_url),
            site_url: env_nonempty("MNR_SITE_URL").unwrap_or(defaults.site_url),
            sync_interval_minutes: env_nonempty("MNR_SYNC_INTERVAL_MINUTES")
                .and_then(|v| v.parse().ok())
                .filter(|m| *m > 0)
                .unwrap_or(defaults.sync_interval_minutes),
            http_timeout_secs: env_nonempty("MNR_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            scheduler_enabled: env_flag("MNR_SCHEDULER_ENABLED"),
            sync_disabled_regions: env_flag("MNR_SYNC_DISABLED_REGIONS"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RegionsFile {
    regions: Vec<RegionConfig>,
}

/// Static region table, loaded from `regions.yaml` or the built-in defaults.
#[derive(Debug, Clone)]
pub struct RegionRegistry {
    regions: Vec<RegionConfig>,
}

impl RegionRegistry {
    pub fn new(regions: Vec<RegionConfig>) -> Result<Self> {
        let mut seen = HashSet::new();
        for region in &regions {
            if !seen.insert(region.code.clone()) {
                bail!("region {} is configured more than once", region.code);
            }
        }
        Ok(Self { regions })
    }

    pub fn builtin() -> Self {
        Self {
            regions: builtin_regions(),
        }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let file: RegionsFile = serde_yaml::from_str(text).context("parsing regions file")?;
        Self::new(file.regions)
    }

    /// A missing file falls back to [`RegionRegistry::builtin`]; an unreadable
    /// or malformed one is an error.
    pub async fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path).await {
            Ok(text) => Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no regions file; using built-in regions");
                Ok(Self::builtin())
            }
            Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
        }
    }

    pub fn all(&self) -> &[RegionConfig] {
        &self.regions
    }

    pub fn get(&self, code: &RegionCode) -> Option<&RegionConfig> {
        self.regions.iter().find(|r| &r.code == code)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &RegionConfig> {
        self.regions.iter().filter(|r| r.enabled)
    }

    pub fn syncable(&self, include_disabled: bool) -> Vec<&RegionConfig> {
        self.regions
            .iter()
            .filter(|r| include_disabled || r.enabled)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncStage {
    Idle,
    Fetching,
    Extracting,
    Normalizing,
    Persisting,
}

impl fmt::Display for SyncStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncStage::Idle => "idle",
            SyncStage::Fetching => "fetching",
            SyncStage::Extracting => "extracting",
            SyncStage::Normalizing => "normalizing",
            SyncStage::Persisting => "persisting",
        };
        f.write_str(name)
    }
}

/// Why a region run was aborted. None of these leave a partial snapshot write.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("extraction failed: {0}")]
    Extraction(#[from] ExtractionError),
    #[error("no {category} rewards found for {region}; keeping the stored snapshot")]
    EmptyResult { region: RegionCode, category: String },
    #[error("store failed: {0}")]
    Store(#[from] StoreError),
}

impl SyncError {
    pub fn stage(&self) -> SyncStage {
        match self {
            SyncError::Fetch(_) => SyncStage::Fetching,
            SyncError::Extraction(_) => SyncStage::Extracting,
            SyncError::EmptyResult { .. } => SyncStage::Normalizing,
            SyncError::Store(_) => SyncStage::Persisting,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RegionSyncOutcome {
    pub region: RegionCode,
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub items: usize,
    /// Ids absent from the previous snapshot. Informational; notification is
    /// driven by the store change feed.
    pub new_ids: Vec<String>,
    pub history_changed: bool,
    pub archived_page: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegionFailure {
    pub region: RegionCode,
    pub stage: SyncStage,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub succeeded: Vec<RegionSyncOutcome>,
    pub failed: Vec<RegionFailure>,
}

pub struct SyncPipeline {
    config: SyncConfig,
    registry: RegionRegistry,
    pages: Arc<dyn PageSource>,
    store: Arc<dyn DocumentStore>,
    archive: Option<PageArchive>,
}

impl SyncPipeline {
    pub fn new(
        config: SyncConfig,
        registry: RegionRegistry,
        store: Arc<dyn DocumentStore>,
    ) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            ..Default::default()
        })?;
        let archive = config.archive_dir.clone().map(PageArchive::new);
        Ok(Self {
            config,
            registry,
            pages: Arc::new(http),
            store,
            archive,
        })
    }

    pub fn with_page_source(mut self, pages: Arc<dyn PageSource>) -> Self {
        self.pages = pages;
        self
    }

    pub fn with_archive(mut self, archive: Option<PageArchive>) -> Self {
        self.archive = archive;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn registry(&self) -> &RegionRegistry {
        &self.registry
    }

    pub fn store(&self) -> Arc<dyn DocumentStore> {
        Arc::clone(&self.store)
    }

    /// One run for one region. Any failure leaves the stored snapshot untouched.
    pub async fn run_region(&self, region: &RegionConfig) -> Result<RegionSyncOutcome, SyncError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("region_sync", region = %region.code, %run_id);
        async move {
            match self.sync_region(region, run_id).await {
                Ok(outcome) => {
                    info!(
                        items = outcome.items,
                        new = outcome.new_ids.len(),
                        history_changed = outcome.history_changed,
                        "region synced"
                    );
                    Ok(outcome)
                }
                Err(err) => {
                    warn!(stage = %err.stage(), error = %err, "region sync aborted");
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn sync_region(
        &self,
        region: &RegionConfig,
        run_id: Uuid,
    ) -> Result<RegionSyncOutcome, SyncError> {
        let started_at = Utc::now();
        let code = region.code.as_str();

        debug!(stage = %SyncStage::Fetching, url = %self.config.rewards_url);
        let page = self
            .pages
            .fetch_page(&self.config.rewards_url, region.proxy.as_deref())
            .await?;

        let archived_page = match &self.archive {
            Some(archive) => match archive.store_page(&region.code, started_at, &page).await {
                Ok(stored) => Some(stored.absolute_path),
                Err(err) => {
                    warn!(error = %format!("{err:#}"), "archiving fetched page failed");
                    None
                }
            },
            None => None,
        };

        debug!(stage = %SyncStage::Extracting, bytes = page.len());
        let raw_items = extractor_for(region.extractor).extract(&page)?;

        debug!(stage = %SyncStage::Normalizing, raw_items = raw_items.len());
        let rewards = normalize_for_region(&raw_items, region);
        if rewards.is_empty() {
            return Err(SyncError::EmptyResult {
                region: region.code.clone(),
                category: region.category_name.clone(),
            });
        }

        debug!(stage = %SyncStage::Persisting, items = rewards.len());
        let store = self.store.as_ref();
        let snapshot = RegionSnapshot::new(rewards, Utc::now());
        let previous: Option<RegionSnapshot> =
            load_or_discard(store, REWARDS_COLLECTION, code).await?;
        let new_ids = match &previous {
            Some(before) => new_reward_ids(before, &snapshot)
                .into_iter()
                .map(str::to_string)
                .collect(),
            None => Vec::new(),
        };
        save_document(store, REWARDS_COLLECTION, code, &snapshot).await?;

        let history_before: RewardHistory =
            load_or_discard(store, REWARDS_HISTORY_COLLECTION, code)
                .await?
                .unwrap_or_default();
        let history = reconcile_history(&history_before, &snapshot.rewards, snapshot.last_updated_at);
        let history_changed = history != history_before;
        if history_changed {
            save_document(store, REWARDS_HISTORY_COLLECTION, code, &history).await?;
        }

        Ok(RegionSyncOutcome {
            region: region.code.clone(),
            run_id,
            started_at,
            finished_at: Utc::now(),
            items: snapshot.rewards.len(),
            new_ids,
            history_changed,
            archived_page,
        })
    }

    /// Sync every eligible region concurrently. `only` restricts the run to
    /// one region and ignores its `enabled` flag.
    pub async fn run_once(&self, only: Option<&RegionCode>) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let regions: Vec<&RegionConfig> = match only {
            Some(code) => vec![self
                .registry
                .get(code)
                .with_context(|| format!("unknown region {code}"))?],
            None => self.registry.syncable(self.config.sync_disabled_regions),
        };
        if regions.is_empty() {
            warn!("no regions eligible for sync");
        }

        let results = join_all(regions.iter().map(|region| self.run_region(region))).await;

        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        for (region, result) in regions.into_iter().zip(results) {
            match result {
                Ok(outcome) => succeeded.push(outcome),
                Err(err) => failed.push(RegionFailure {
                    region: region.code.clone(),
                    stage: err.stage(),
                    error: err.to_string(),
                }),
            }
        }

        Ok(SyncRunSummary {
            started_at,
            finished_at: Utc::now(),
            succeeded,
            failed,
        })
    }

    /// [`run_once`](Self::run_once), then announce the new rewards this run
    /// wrote before returning, for processes that exit without a watcher.
    pub async fn run_once_notifying(
        &self,
        only: Option<&RegionCode>,
        watcher: &NewRewardWatcher,
    ) -> Result<(SyncRunSummary, Vec<PushMessage>)> {
        let mut changes = self.store.changes();
        let summary = self.run_once(only).await?;
        let sent = watcher.drain(&mut changes).await;
        Ok((summary, sent))
    }

    /// One repeating job per eligible region, each running independently.
    pub async fn build_scheduler(self: Arc<Self>) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let every = sync_interval(self.config.sync_interval_minutes);
        let codes: Vec<RegionCode> = self
            .registry
            .syncable(self.config.sync_disabled_regions)
            .into_iter()
            .map(|r| r.code.clone())
            .collect();

        for code in codes {
            let pipeline = Arc::clone(&self);
            let job_code = code.clone();
            let job = Job::new_repeated_async(every, move |_uuid, _l| {
                let pipeline = Arc::clone(&pipeline);
                let code = job_code.clone();
                Box::pin(async move {
                    let Some(region) = pipeline.registry.get(&code) else {
                        return;
                    };
                    // Errors are already logged inside the region span.
                    let _ = pipeline.run_region(region).await;
                })
            })
            .with_context(|| format!("creating scheduler job for {code}"))?;
            sched.add(job).await.context("adding scheduler job")?;
            info!(region = %code, every_secs = every.as_secs(), "scheduled region sync");
        }
        Ok(sched)
    }

    pub async fn maybe_build_scheduler(self: Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }
        self.build_scheduler().await.map(Some)
    }
}

/// A stored document that no longer decodes is treated as absent so that one
/// bad write cannot wedge a region forever.
async fn load_or_discard<T: DeserializeOwned>(
    store: &dyn DocumentStore,
    collection: &str,
    id: &str,
) -> Result<Option<T>, StoreError> {
    match load_document(store, collection, id).await {
        Err(err @ StoreError::Decode { .. }) => {
            warn!(collection, id, error = %err, "discarding undecodable document");
            Ok(None)
        }
        other => other,
    }
}

/// Fixed gap between region syncs; zero is raised to one minute.
pub fn sync_interval(minutes: u32) -> Duration {
    Duration::from_secs(u64::from(minutes.max(1)) * 60)
}

/// Postgres when `DATABASE_URL` is set, otherwise JSON files under the data dir.
pub async fn open_store(config: &SyncConfig) -> Result<Arc<dyn DocumentStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PgDocumentStore::connect(url)
                .await
                .context("connecting to DATABASE_URL")?;
            store.migrate().await.context("running migrations")?;
            Ok(Arc::new(store))
        }
        None => {
            fs::create_dir_all(&config.data_dir)
                .await
                .with_context(|| format!("creating {}", config.data_dir.display()))?;
            Ok(Arc::new(FsDocumentStore::new(config.data_dir.clone())))
        }
    }
}

pub async fn pipeline_from_env() -> Result<SyncPipeline> {
    let config = SyncConfig::from_env();
    let registry = RegionRegistry::load(&config.regions_file).await?;
    let store = open_store(&config).await?;
    SyncPipeline::new(config, registry, store)
}

pub async fn run_sync_once_from_env(only: Option<&RegionCode>) -> Result<SyncRunSummary> {
    pipeline_from_env().await?.run_once(only).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mnr_core::{ExtractorKind, Stock};
    use mnr_storage::MemoryDocumentStore;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Pages keyed by proxy reference, `direct` for no proxy.
    #[derive(Default)]
    struct StubPages {
        pages: Mutex<HashMap<String, String>>,
    }

    impl StubPages {
        fn with(self, proxy: &str, page: String) -> Self {
            self.pages.lock().unwrap().insert(proxy.to_string(), page);
            self
        }
    }

    #[async_trait]
    impl PageSource for StubPages {
        async fn fetch_page(&self, url: &str, proxy: Option<&str>) -> Result<String, FetchError> {
            self.pages
                .lock()
                .unwrap()
                .get(proxy.unwrap_or("direct"))
                .cloned()
                .ok_or_else(|| FetchError::HttpStatus {
                    status: 503,
                    url: url.to_string(),
                })
        }
    }

    fn fixture_page(layout: &str) -> String {
        let path = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures")
            .join(layout)
            .join("reward_categories.html");
        std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
    }

    fn pipeline(
        registry: RegionRegistry,
        pages: StubPages,
    ) -> (SyncPipeline, Arc<MemoryDocumentStore>) {
        let store = Arc::new(MemoryDocumentStore::new());
        let pipeline = SyncPipeline::new(SyncConfig::default(), registry, store.clone())
            .unwrap()
            .with_page_source(Arc::new(pages));
        (pipeline, store)
    }

    fn region(registry: &RegionRegistry, code: &str) -> RegionConfig {
        registry.get(&RegionCode::new(code)).unwrap().clone()
    }

    #[tokio::test]
    async fn successful_run_writes_snapshot_and_history() {
        let registry = RegionRegistry::builtin();
        let us = region(&registry, "US");
        let (pipeline, store) =
            pipeline(registry, StubPages::default().with("direct", fixture_page("embedded-script")));

        let outcome = pipeline.run_region(&us).await.unwrap();
        assert_eq!(outcome.items, 3);
        assert!(outcome.history_changed);
        assert!(outcome.new_ids.is_empty());

        let snapshot: RegionSnapshot = load_document(store.as_ref(), REWARDS_COLLECTION, "US")
            .await
            .unwrap()
            .unwrap();
        let ids: Vec<_> = snapshot.rewards.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["1001", "1002", "1003"]);
        assert_eq!(snapshot.rewards[1].stock, Stock::Availability { available: false });

        let history: RewardHistory = load_document(store.as_ref(), REWARDS_HISTORY_COLLECTION, "US")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(history.series.len(), 3);
        assert_eq!(history.series["1001"][0].timestamp, snapshot.last_updated_at);
    }

    #[tokio::test]
    async fn repeated_run_leaves_history_untouched() {
        let registry = RegionRegistry::builtin();
        let us = region(&registry, "US");
        let (pipeline, store) =
            pipeline(registry, StubPages::default().with("direct", fixture_page("markup-node")));

        pipeline.run_region(&us).await.unwrap();
        let first = store.get(REWARDS_HISTORY_COLLECTION, "US").await.unwrap();
        let second = pipeline.run_region(&us).await.unwrap();
        assert!(!second.history_changed);
        assert_eq!(store.get(REWARDS_HISTORY_COLLECTION, "US").await.unwrap(), first);
    }

    #[tokio::test]
    async fn empty_result_keeps_previous_snapshot() {
        let registry = RegionRegistry::from_yaml_str(
            "regions:\n  - code: JP\n    name: Japan\n    category_name: jp_store\n",
        )
        .unwrap();
        let jp = region(&registry, "JP");
        let (pipeline, store) =
            pipeline(registry, StubPages::default().with("direct", fixture_page("markup-node")));

        let prior = json!({"lastUpdatedAt": 5, "rewards": []});
        store.set(REWARDS_COLLECTION, "JP", prior.clone()).await.unwrap();

        let err = pipeline.run_region(&jp).await.unwrap_err();
        assert!(matches!(err, SyncError::EmptyResult { .. }));
        assert_eq!(err.stage(), SyncStage::Normalizing);
        assert_eq!(store.get(REWARDS_COLLECTION, "JP").await.unwrap(), Some(prior));
        assert_eq!(store.get(REWARDS_HISTORY_COLLECTION, "JP").await.unwrap(), None);
    }

    #[tokio::test]
    async fn missing_marker_aborts_without_writes() {
        let mut us = region(&RegionRegistry::builtin(), "US");
        us.extractor = ExtractorKind::EmbeddedScript;
        let (pipeline, store) = pipeline(
            RegionRegistry::builtin(),
            StubPages::default().with("direct", "<html><body>maintenance</body></html>".into()),
        );

        let err = pipeline.run_region(&us).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::Extraction(ExtractionError::MarkerMissing(_))
        ));
        assert_eq!(err.stage(), SyncStage::Extracting);
        assert_eq!(store.get(REWARDS_COLLECTION, "US").await.unwrap(), None);
        assert_eq!(store.get(REWARDS_HISTORY_COLLECTION, "US").await.unwrap(), None);
    }

    #[tokio::test]
    async fn one_region_failing_does_not_affect_the_others() {
        let (pipeline, store) = pipeline(
            RegionRegistry::builtin(),
            StubPages::default()
                .with("direct", fixture_page("embedded-script"))
                .with("proxy-london", fixture_page("embedded-script")),
        );

        let summary = pipeline.run_once(None).await.unwrap();
        let ok: Vec<_> = summary.succeeded.iter().map(|o| o.region.as_str()).collect();
        assert_eq!(ok, ["US", "GB"]);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].region.as_str(), "CA");
        assert_eq!(summary.failed[0].stage, SyncStage::Fetching);
        assert_eq!(store.get(REWARDS_COLLECTION, "CA").await.unwrap(), None);
    }

    #[tokio::test]
    async fn new_ids_are_reported_against_the_previous_snapshot() {
        let registry = RegionRegistry::builtin();
        let us = region(&registry, "US");
        let (pipeline, store) =
            pipeline(registry, StubPages::default().with("direct", fixture_page("embedded-script")));
        store
            .set(
                REWARDS_COLLECTION,
                "US",
                json!({"lastUpdatedAt": 1, "rewards": [
                    {"id": "1001", "title": "Pins", "category": "nintendo_store", "type": "stocked_code"}
                ]}),
            )
            .await
            .unwrap();

        let outcome = pipeline.run_region(&us).await.unwrap();
        assert_eq!(outcome.new_ids, ["1002", "1003"]);
    }

    #[tokio::test]
    async fn disabled_regions_are_skipped_unless_requested() {
        let registry = RegionRegistry::from_yaml_str(
            "regions:\n  - code: US\n    name: United States\n    category_name: nintendo_store\n  - code: GB\n    name: United Kingdom\n    category_name: my_nintendo_store\n    enabled: false\n",
        )
        .unwrap();
        let (pipeline, _store) =
            pipeline(registry, StubPages::default().with("direct", fixture_page("embedded-script")));

        let summary = pipeline.run_once(None).await.unwrap();
        assert_eq!(summary.succeeded.len(), 1);
        assert!(summary.failed.is_empty());

        let only_gb = pipeline.run_once(Some(&RegionCode::new("gb"))).await.unwrap();
        assert_eq!(only_gb.succeeded[0].region.as_str(), "GB");
        assert!(pipeline.run_once(Some(&RegionCode::new("JP"))).await.is_err());
    }

    #[test]
    fn registry_rejects_duplicate_codes() {
        let err = RegionRegistry::from_yaml_str(
            "regions:\n  - code: us\n    name: A\n    category_name: x\n  - code: US\n    name: B\n    category_name: y\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[tokio::test]
    async fn missing_regions_file_falls_back_to_builtin() {
        let dir = tempfile::tempdir().unwrap();
        let registry = RegionRegistry::load(&dir.path().join("regions.yaml")).await.unwrap();
        assert_eq!(registry.all().len(), 3);
        assert_eq!(
            registry.get(&RegionCode::new("CA")).and_then(|r| r.proxy.as_deref()),
            Some("proxy-canada")
        );
    }

    #[test]
    fn workspace_regions_file_parses() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../regions.yaml");
        let registry = RegionRegistry::from_yaml_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        let codes: Vec<_> = registry.enabled().map(|r| r.code.as_str()).collect();
        assert_eq!(codes, ["US", "CA", "GB"]);
    }

    #[test]
    fn sync_interval_keeps_minutes_that_do_not_divide_an_hour() {
        assert_eq!(sync_interval(10), Duration::from_secs(600));
        assert_eq!(sync_interval(45), Duration::from_secs(45 * 60));
        assert_eq!(sync_interval(90), Duration::from_secs(90 * 60));
        assert_eq!(sync_interval(100), Duration::from_secs(100 * 60));
        assert_eq!(sync_interval(0), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn scheduler_accepts_interval_longer_than_an_hour() {
        let config = SyncConfig {
            sync_interval_minutes: 90,
            ..SyncConfig::default()
        };
        let pipeline = SyncPipeline::new(
            config,
            RegionRegistry::builtin(),
            Arc::new(MemoryDocumentStore::new()),
        )
        .unwrap();
        Arc::new(pipeline).build_scheduler().await.unwrap();
    }

    #[tokio::test]
    async fn one_shot_run_announces_rewards_missing_from_the_previous_snapshot() {
        use crate::notify::tests::RecordingNotifier;

        let registry = RegionRegistry::builtin();
        let (pipeline, store) =
            pipeline(registry, StubPages::default().with("direct", fixture_page("embedded-script")));
        store
            .set(
                REWARDS_COLLECTION,
                "US",
                json!({"lastUpdatedAt": 1, "rewards": [{
                    "id": "1001", "title": "Old", "category": "nintendo_store",
                    "type": "physical_goods", "stock": {"available": true}
                }]}),
            )
            .await
            .unwrap();

        let recorder = Arc::new(RecordingNotifier::default());
        let watcher = NewRewardWatcher::new(
            NotificationDispatcher::new(vec![recorder.clone()]),
            "https://site.test",
        );
        let (summary, sent) = pipeline
            .run_once_notifying(Some(&RegionCode::new("US")), &watcher)
            .await
            .unwrap();

        assert_eq!(summary.succeeded.len(), 1);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].topic, "new-rewards-US");
        assert_eq!(recorder.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn archive_keeps_fetched_pages() {
        let dir = tempfile::tempdir().unwrap();
        let registry = RegionRegistry::builtin();
        let us = region(&registry, "US");
        let (pipeline, _store) =
            pipeline(registry, StubPages::default().with("direct", fixture_page("markup-node")));
        let pipeline = pipeline.with_archive(Some(PageArchive::new(dir.path())));

        let outcome = pipeline.run_region(&us).await.unwrap();
        let archived = outcome.archived_page.expect("archived page");
        assert!(archived.starts_with(dir.path().join("US")));
        assert!(archived.exists());
    }
}
