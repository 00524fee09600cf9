//! Extraction run orchestration: configuration, single-flight coordinator,
//! outcome notification and scheduled triggers.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use pscx_core::unwind_page;
use pscx_source::{FetchError, HttpClientConfig, HttpPageSource, PageSource, PaginatedFetcher};
use pscx_storage::{
    parse_filename_timestamp, ArchiveWriter, CleanupReport, ExtractListing, ExtractNaming,
    ExtractStore, StagingFile,
};
use serde::Serialize;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pscx-sync";

#[derive(Debug, Clone)]
pub struct ExtractConfig {
    pub api_base_url: String,
    pub page_size: u32,
    pub working_dir: PathBuf,
    pub files_dir: PathBuf,
    pub extract_name: String,
    /// File name of the pinned demo artifact, never removed by cleanup.
    pub extract_test_name: String,
    pub platform: String,
    pub timezone: Tz,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub scheduler_enabled: bool,
    pub extract_cron: String,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8080/api".to_string(),
            page_size: 50_000,
            working_dir: PathBuf::from("./work"),
            files_dir: PathBuf::from("./files"),
            extract_name: "Extraction_ProSanteConnect".to_string(),
            extract_test_name: "Extraction_ProSanteConnect_test.zip".to_string(),
            platform: "local".to_string(),
            timezone: chrono_tz::Europe::Paris,
            http_timeout_secs: 120,
            user_agent: "pscx/0.1".to_string(),
            scheduler_enabled: false,
            extract_cron: "0 0 3 * * *".to_string(),
        }
    }
}

impl ExtractConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_base_url: std::env::var("PSCX_API_BASE_URL").unwrap_or(defaults.api_base_url),
            page_size: std::env::var("PSCX_PAGE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|size| *size > 0)
                .unwrap_or(defaults.page_size),
            working_dir: std::env::var("PSCX_WORKING_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.working_dir),
            files_dir: std::env::var("PSCX_FILES_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.files_dir),
            extract_name: std::env::var("PSCX_EXTRACT_NAME").unwrap_or(defaults.extract_name),
            extract_test_name: std::env::var("PSCX_EXTRACT_TEST_NAME")
                .unwrap_or(defaults.extract_test_name),
            platform: std::env::var("PSCX_PLATFORM").unwrap_or(defaults.platform),
            timezone: std::env::var("PSCX_TIMEZONE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.timezone),
            http_timeout_secs: std::env::var("PSCX_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            user_agent: std::env::var("PSCX_USER_AGENT").unwrap_or(defaults.user_agent),
            scheduler_enabled: std::env::var("PSCX_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.scheduler_enabled),
            extract_cron: std::env::var("PSCX_EXTRACT_CRON").unwrap_or(defaults.extract_cron),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub page_size: u32,
    pub pages: u32,
    pub rows: u64,
    pub artifact: PathBuf,
    pub archive_name: String,
    pub sha256: String,
    pub removed_artifacts: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunFailure {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub reason: String,
    /// The registry answered with an impossible shape (e.g. an empty first page).
    pub consistency_fault: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded(RunSummary),
    Failed(RunFailure),
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded(_))
    }

    pub fn artifact(&self) -> Option<&PathBuf> {
        match self {
            Self::Succeeded(summary) => Some(&summary.artifact),
            Self::Failed(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerOutcome {
    Accepted,
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("an extraction is already in progress")]
pub struct AlreadyRunning;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub subject: String,
    pub body: String,
}

pub fn render_notification(platform: &str, outcome: &RunOutcome) -> Notification {
    match outcome {
        RunOutcome::Succeeded(summary) => {
            let (date, hour) = parse_filename_timestamp(&summary.archive_name)
                .map(|ts| (ts.format("%d/%m/%Y").to_string(), ts.format("%H:%M").to_string()))
                .unwrap_or_default();
            Notification {
                subject: format!("{platform} - PSCEXTRACT - sécurisation effectuée"),
                body: format!(
                    "Le fichier {} a été généré par pscextract le {date} à {hour} et est disponible au téléchargement.",
                    summary.archive_name
                ),
            }
        }
        RunOutcome::Failed(_) => Notification {
            subject: format!("{platform} - PSCEXTRACT - sécurisation échouée"),
            body: "Échec lors de la génération du fichier par PSCEXTRACT.".to_string(),
        },
    }
}

/// Receives the outcome of every finished run.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, outcome: &RunOutcome);
}

/// Emits rendered notifications through `tracing`.
#[derive(Debug, Clone)]
pub struct LogNotifier {
    platform: String,
}

impl LogNotifier {
    pub fn new(platform: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
        }
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, outcome: &RunOutcome) {
        let message = render_notification(&self.platform, outcome);
        if outcome.is_success() {
            info!(subject = %message.subject, body = %message.body, "extraction notification");
        } else {
            error!(subject = %message.subject, body = %message.body, "extraction notification");
        }
    }
}

struct Inner {
    config: ExtractConfig,
    source: Arc<dyn PageSource>,
    notifier: Arc<dyn Notifier>,
    store: ExtractStore,
    archive_writer: ArchiveWriter,
    busy: AtomicBool,
}

/// Clears the busy flag when the run ends, however it ends.
struct BusyGuard {
    inner: Arc<Inner>,
}

impl BusyGuard {
    fn acquire(inner: &Arc<Inner>) -> Option<Self> {
        inner
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self {
                inner: inner.clone(),
            })
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.inner.busy.store(false, Ordering::Release);
    }
}

/// Runs at most one extraction at a time and reports each outcome.
#[derive(Clone)]
pub struct ExtractionCoordinator {
    inner: Arc<Inner>,
}

impl ExtractionCoordinator {
    pub fn new(
        config: ExtractConfig,
        source: Arc<dyn PageSource>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let store = ExtractStore::new(config.files_dir.clone());
        let archive_writer = ArchiveWriter::new(config.working_dir.clone());
        Self {
            inner: Arc::new(Inner {
                config,
                source,
                notifier,
                store,
                archive_writer,
                busy: AtomicBool::new(false),
            }),
        }
    }

    /// Registry over HTTP, notifications to the log.
    pub fn from_config(config: ExtractConfig) -> Result<Self> {
        let source = HttpPageSource::new(
            config.api_base_url.clone(),
            HttpClientConfig {
                timeout: Duration::from_secs(config.http_timeout_secs),
                user_agent: Some(config.user_agent.clone()),
            },
        )?;
        let notifier = LogNotifier::new(config.platform.clone());
        Ok(Self::new(config, Arc::new(source), Arc::new(notifier)))
    }

    pub fn config(&self) -> &ExtractConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &ExtractStore {
        &self.inner.store
    }

    pub fn is_busy(&self) -> bool {
        self.inner.busy.load(Ordering::Acquire)
    }

    /// Dispatch a run in the background and return immediately.
    pub fn start(&self, page_size: Option<u32>) -> TriggerOutcome {
        let Some(guard) = BusyGuard::acquire(&self.inner) else {
            warn!("extraction trigger rejected, a run is already in progress");
            return TriggerOutcome::AlreadyRunning;
        };
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let outcome = {
                let _guard = guard;
                inner.execute(page_size).await
            };
            inner.notifier.notify(&outcome).await;
        });
        TriggerOutcome::Accepted
    }

    /// Run inline under the same single-flight guard as [`Self::start`].
    pub async fn run_now(&self, page_size: Option<u32>) -> Result<RunOutcome, AlreadyRunning> {
        let guard = BusyGuard::acquire(&self.inner).ok_or(AlreadyRunning)?;
        let outcome = self.inner.execute(page_size).await;
        drop(guard);
        self.inner.notifier.notify(&outcome).await;
        Ok(outcome)
    }

    pub fn latest_artifact(&self) -> Result<Option<PathBuf>> {
        let config = &self.inner.config;
        Ok(self
            .inner
            .store
            .latest_extract(&config.extract_name, &config.extract_test_name)?
            .map(|listing| listing.path))
    }

    pub fn pinned_artifact(&self) -> Option<PathBuf> {
        self.inner
            .store
            .pinned_artifact(&self.inner.config.extract_test_name)
    }

    pub fn list_files(&self) -> Result<Vec<ExtractListing>> {
        self.inner.store.files()
    }

    pub fn cleanup(&self) -> Result<CleanupReport> {
        self.inner.store.cleanup(&self.inner.config.extract_test_name)
    }

    pub fn clean_all(&self) -> Result<usize> {
        self.inner.store.clean_all()
    }
}

impl Inner {
    /// Run the pipeline on its own task so a panic becomes a failed outcome.
    async fn execute(self: &Arc<Self>, page_size: Option<u32>) -> RunOutcome {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let inner = self.clone();
        let result = tokio::spawn(async move { inner.run_pipeline(run_id, started_at, page_size).await })
            .await;

        let failure = |reason: String, consistency_fault: bool| {
            RunOutcome::Failed(RunFailure {
                run_id,
                started_at,
                finished_at: Utc::now(),
                reason,
                consistency_fault,
            })
        };

        match result {
            Ok(Ok(summary)) => {
                info!(
                    %run_id,
                    rows = summary.rows,
                    pages = summary.pages,
                    artifact = %summary.artifact.display(),
                    "extraction succeeded"
                );
                RunOutcome::Succeeded(summary)
            }
            Ok(Err(err)) => {
                let consistency_fault = err
                    .downcast_ref::<FetchError>()
                    .is_some_and(FetchError::is_consistency_fault);
                error!(%run_id, consistency_fault, "extraction failed, previous extract left in place: {err:#}");
                failure(format!("{err:#}"), consistency_fault)
            }
            Err(join_err) => {
                error!(%run_id, %join_err, "extraction task aborted");
                failure(format!("extraction task aborted: {join_err}"), false)
            }
        }
    }

    async fn run_pipeline(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        page_size: Option<u32>,
    ) -> Result<RunSummary> {
        let page_size = page_size.unwrap_or(self.config.page_size);
        let local_start = started_at.with_timezone(&self.config.timezone).naive_local();
        let naming = ExtractNaming::new(self.config.extract_name.clone(), local_start);
        info!(
            %run_id,
            source = %self.source.describe(),
            page_size,
            extract = %naming.stem(),
            "starting extraction"
        );

        let mut staging = StagingFile::create(&self.config.working_dir)?;
        let mut fetcher = PaginatedFetcher::new(self.source.as_ref(), page_size)?;
        while let Some(page) = fetcher.next_page().await? {
            for flat in unwind_page(&page.records) {
                for row in flat.rows() {
                    staging.write_row(&row)?;
                }
            }
            debug!(page = page.number, rows = staging.rows(), "page written to staging file");
        }
        let pages = fetcher.pages_fetched();
        let staged = staging.finish()?;

        let writer = self.archive_writer.clone();
        let store = self.store.clone();
        let pinned = self.config.extract_test_name.clone();
        let (published, cleanup) = tokio::task::spawn_blocking(move || -> Result<_> {
            let built = writer.write(staged, &naming)?;
            let published = store.publish(built)?;
            let cleanup = store
                .cleanup_protecting(&pinned, Some(&published.archive_name))
                .unwrap_or_else(|err| {
                    warn!("cleanup skipped: {err:#}");
                    CleanupReport::default()
                });
            if let Some(kept) = cleanup.kept.as_deref().filter(|k| *k != published.archive_name) {
                warn!(
                    kept,
                    published = %published.archive_name,
                    "an existing extract carries a later timestamp than this run, both kept"
                );
            }
            Ok((published, cleanup))
        })
        .await
        .context("archive task aborted")??;

        Ok(RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            page_size,
            pages,
            rows: published.rows,
            artifact: published.path,
            archive_name: published.archive_name,
            sha256: published.sha256,
            removed_artifacts: cleanup.deleted,
        })
    }
}

/// Cron-driven trigger, when enabled in the configuration.
pub async fn maybe_build_scheduler(
    coordinator: &ExtractionCoordinator,
) -> Result<Option<JobScheduler>> {
    let config = coordinator.config();
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.extract_cron.clone();
    let trigger = coordinator.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let trigger = trigger.clone();
        Box::pin(async move {
            match trigger.start(None) {
                TriggerOutcome::Accepted => info!("scheduled extraction started"),
                TriggerOutcome::AlreadyRunning => {
                    warn!("scheduled extraction skipped, a run is already in progress")
                }
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
