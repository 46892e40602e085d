//! Incremental harvest orchestration for HKB.
//!
//! One run searches the configured queries, dedups candidates by URL,
//! consults the tracking record, fetches and extracts only what is needed,
//! writes accepted documents to the object store and persists the updated
//! tracker. At most one run may execute against a bucket at a time; the
//! triggering scheduler is expected to serialize runs, and a concurrent run
//! would lose updates last-write-wins.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use hkb_core::{Candidate, RunSummary, ScrapedDocument};
use hkb_scrape::{extract, Fetch, SiteClient, SiteProfile};
use hkb_storage::{
    hash_content, hash_url, load_tracker, save_tracker, BackoffPolicy, HttpClientConfig,
    HttpFetcher, LocalObjectStore, ObjectStore,
};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "hkb-sync";

/// Informational interval reported as `next_run_scheduled`; actual
/// scheduling is external.
const NEXT_RUN_INTERVAL_DAYS: i64 = 7;

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

fn default_search_queries() -> Vec<String> {
    [
        "diabetes symptoms",
        "diabetes treatment",
        "diabetes diet",
        "type 1 diabetes",
        "type 2 diabetes",
        "diabetes medication",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

fn default_max_results() -> usize {
    5
}

fn default_prefix() -> String {
    "diabetes-webmd-weekly".to_string()
}

#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub data_dir: PathBuf,
    pub bucket: Option<String>,
    pub user_agent: String,
    pub scheduler_enabled: bool,
    pub harvest_cron: String,
    pub search_timeout_secs: u64,
    pub fetch_timeout_secs: u64,
    pub query_delay_ms: u64,
    pub document_delay_ms: u64,
    pub workspace_root: PathBuf,
}

impl HarvestConfig {
    pub fn from_env() -> Self {
        Self {
            data_dir: std::env::var("HKB_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            bucket: std::env::var("HKB_BUCKET").ok().filter(|v| !v.is_empty()),
            user_agent: std::env::var("HKB_USER_AGENT")
                .unwrap_or_else(|_| DEFAULT_USER_AGENT.to_string()),
            scheduler_enabled: std::env::var("HKB_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            harvest_cron: std::env::var("HARVEST_CRON")
                .unwrap_or_else(|_| "0 0 6 * * Mon".to_string()),
            search_timeout_secs: std::env::var("HKB_SEARCH_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            fetch_timeout_secs: std::env::var("HKB_FETCH_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(15),
            query_delay_ms: std::env::var("HKB_QUERY_DELAY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1_000),
            document_delay_ms: std::env::var("HKB_DOCUMENT_DELAY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2_000),
            workspace_root: PathBuf::from("."),
        }
    }
}

/// Operator-editable run parameters, loaded from `harvest.yaml` when present.
#[derive(Debug, Clone, Deserialize)]
pub struct HarvestPlan {
    #[serde(default = "default_search_queries")]
    pub queries: Vec<String>,
    #[serde(default = "default_max_results")]
    pub max_results_per_query: usize,
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

impl Default for HarvestPlan {
    fn default() -> Self {
        Self {
            queries: default_search_queries(),
            max_results_per_query: default_max_results(),
            prefix: default_prefix(),
        }
    }
}

/// Load `harvest.yaml` from the workspace root, defaulting when the file is
/// absent. A present-but-invalid plan is an operator error and does fail.
pub async fn load_plan_or_default(workspace_root: &Path) -> Result<HarvestPlan> {
    let path = workspace_root.join("harvest.yaml");
    match tokio::fs::read_to_string(&path).await {
        Ok(text) => serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(HarvestPlan::default()),
        Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
    }
}

/// Post-fetch classification of one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acceptance {
    New,
    Updated,
    Unchanged,
}

/// Novel content (or a forced run) is accepted; the URL history decides
/// whether the write counts as new or updated.
pub fn acceptance(url_known: bool, content_known: bool, force_update: bool) -> Acceptance {
    if !content_known || force_update {
        if url_known {
            Acceptance::Updated
        } else {
            Acceptance::New
        }
    } else {
        Acceptance::Unchanged
    }
}

fn object_key(prefix: &str, url_hash: &str) -> String {
    let stamp = Utc::now().format("%Y%m%d_%H%M%S");
    format!("{prefix}/{stamp}_{}.json", &url_hash[..8])
}

#[derive(Debug, Clone)]
pub struct HarvestRequest {
    pub queries: Vec<String>,
    pub max_results_per_query: usize,
    pub prefix: String,
    pub force_update: bool,
}

pub struct HarvestPipeline {
    store: Arc<dyn ObjectStore>,
    fetch: Arc<dyn Fetch>,
    profile: SiteProfile,
    query_delay: Duration,
    document_delay: Duration,
}

impl HarvestPipeline {
    pub fn new(store: Arc<dyn ObjectStore>, fetch: Arc<dyn Fetch>, profile: SiteProfile) -> Self {
        Self {
            store,
            fetch,
            profile,
            query_delay: Duration::from_secs(1),
            document_delay: Duration::from_secs(2),
        }
    }

    pub fn with_delays(mut self, query_delay: Duration, document_delay: Duration) -> Self {
        self.query_delay = query_delay;
        self.document_delay = document_delay;
        self
    }

    /// Drive one run end to end. This never fails: per-candidate and
    /// persistence problems land in the summary's error list, and the
    /// tracker is persisted even after a partial run.
    pub async fn run_once(&self, request: &HarvestRequest) -> RunSummary {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let mut summary = RunSummary::started(
            run_id,
            started_at,
            started_at + ChronoDuration::days(NEXT_RUN_INTERVAL_DAYS),
        );
        info!(
            %run_id,
            queries = request.queries.len(),
            force = request.force_update,
            "starting harvest run"
        );

        let mut tracker = load_tracker(self.store.as_ref()).await;

        if let Err(err) = self.harvest(request, &mut tracker, &mut summary).await {
            summary.errors.push(format!("harvest run failed: {err:#}"));
        }

        tracker.last_run = Some(Utc::now().to_rfc3339());
        if let Err(err) = save_tracker(self.store.as_ref(), &tracker).await {
            warn!(error = %err, "tracker save failed; next run may redo work");
        }

        summary.finished_at = Utc::now();
        info!(
            candidates = summary.candidates_found,
            new = summary.accepted_new,
            updated = summary.accepted_updated,
            skipped = summary.skipped_existing,
            errors = summary.errors.len(),
            "harvest run complete"
        );
        summary
    }

    async fn harvest(
        &self,
        request: &HarvestRequest,
        tracker: &mut hkb_core::TrackingRecord,
        summary: &mut RunSummary,
    ) -> Result<()> {
        // Dedup by URL, last write wins, first-seen order preserved.
        let mut order: Vec<String> = Vec::new();
        let mut by_url: HashMap<String, Candidate> = HashMap::new();
        for (index, query) in request.queries.iter().enumerate() {
            if index > 0 {
                sleep(self.query_delay).await;
            }
            debug!(query = %query, "searching");
            for candidate in self.fetch.search(query, request.max_results_per_query).await {
                if !by_url.contains_key(&candidate.url) {
                    order.push(candidate.url.clone());
                }
                by_url.insert(candidate.url.clone(), candidate);
            }
        }
        summary.candidates_found = order.len();

        for url in &order {
            let url_hash = hash_url(url);
            if tracker.url_hashes.contains(&url_hash) && !request.force_update {
                // Known URL: no fetch at all.
                summary.skipped_existing += 1;
                continue;
            }

            debug!(url = %url, "fetching document");
            let document = match self.fetch.fetch_document(url).await {
                Ok(html) => match extract(&html, url, &self.profile) {
                    Ok(document) => document,
                    Err(err) => ScrapedDocument::failure(url, &self.profile.source, err.to_string()),
                },
                Err(err) => ScrapedDocument::failure(url, &self.profile.source, err.to_string()),
            };

            if let Some(reason) = &document.error {
                summary.errors.push(format!("failed to scrape {url}: {reason}"));
                continue;
            }

            let content_hash = hash_content(&document.body_text);
            let url_known = tracker.url_hashes.contains(&url_hash);
            let content_known = tracker.content_hashes.contains(&content_hash);

            let outcome = acceptance(url_known, content_known, request.force_update);
            if outcome != Acceptance::Unchanged {
                let key = object_key(&request.prefix, &url_hash);
                let bytes = match serde_json::to_vec_pretty(&document) {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        summary.errors.push(format!("failed to serialize {url}: {err}"));
                        continue;
                    }
                };
                match self.store.put(&key, &bytes).await {
                    Ok(()) => {
                        if outcome == Acceptance::New {
                            summary.accepted_new += 1;
                            summary.objects_created.push(key.clone());
                        } else {
                            summary.accepted_updated += 1;
                            summary.objects_updated.push(key.clone());
                        }
                        tracker.url_hashes.insert(url_hash);
                        tracker.content_hashes.insert(content_hash);
                        tracker.total_documents += 1;
                        info!(url = %url, key = %key, "stored document");
                    }
                    Err(err) => {
                        summary.errors.push(format!("failed to store {url}: {err}"));
                    }
                }
            }

            sleep(self.document_delay).await;
        }

        Ok(())
    }
}

/// Invocation payload for one harvest run. Field names match the external
/// trigger contract.
#[derive(Debug, Clone, Deserialize)]
pub struct TriggerRequest {
    #[serde(default)]
    pub bucket_name: Option<String>,
    #[serde(default = "default_search_queries")]
    pub search_queries: Vec<String>,
    #[serde(default = "default_max_results")]
    pub max_results_per_query: usize,
    #[serde(default = "default_prefix")]
    pub s3_prefix: String,
    #[serde(default)]
    pub force_update: bool,
}

impl Default for TriggerRequest {
    fn default() -> Self {
        Self {
            bucket_name: None,
            search_queries: default_search_queries(),
            max_results_per_query: default_max_results(),
            s3_prefix: default_prefix(),
            force_update: false,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TriggerResults {
    /// Distinct candidates surfaced this run, not only never-seen ones; the
    /// name is kept for downstream consumers of the original contract.
    pub new_documents_found: usize,
    pub new_documents_scraped: usize,
    pub updated_documents: usize,
    pub skipped_existing: usize,
    pub total_s3_objects: usize,
    pub errors_count: usize,
    pub next_run_scheduled: String,
}

#[derive(Debug, Serialize)]
pub struct TriggerDetails {
    pub s3_objects_created: Vec<String>,
    pub s3_objects_updated: Vec<String>,
    pub errors: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum TriggerResponse {
    Completed {
        success: bool,
        results: TriggerResults,
        details: TriggerDetails,
    },
    Failed {
        #[serde(rename = "statusCode")]
        status_code: u16,
        success: bool,
        error: String,
    },
}

pub fn completed_response(summary: &RunSummary) -> TriggerResponse {
    TriggerResponse::Completed {
        success: true,
        results: TriggerResults {
            new_documents_found: summary.candidates_found,
            new_documents_scraped: summary.accepted_new,
            updated_documents: summary.accepted_updated,
            skipped_existing: summary.skipped_existing,
            total_s3_objects: summary.objects_created.len() + summary.objects_updated.len(),
            errors_count: summary.errors.len(),
            next_run_scheduled: summary.next_run_scheduled.to_rfc3339(),
        },
        details: TriggerDetails {
            s3_objects_created: summary.objects_created.iter().take(10).cloned().collect(),
            s3_objects_updated: summary.objects_updated.iter().take(10).cloned().collect(),
            errors: summary.errors.iter().take(5).cloned().collect(),
        },
    }
}

pub fn failed_response(status_code: u16, error: impl Into<String>) -> TriggerResponse {
    TriggerResponse::Failed {
        status_code,
        success: false,
        error: error.into(),
    }
}

fn build_pipeline(config: &HarvestConfig, bucket: &str) -> Result<HarvestPipeline> {
    let store = Arc::new(LocalObjectStore::new(config.data_dir.join(bucket)));
    let http = HttpFetcher::new(HttpClientConfig {
        user_agent: config.user_agent.clone(),
        backoff: BackoffPolicy::default(),
    })?;
    let profile = SiteProfile::webmd_diabetes();
    let client = SiteClient::new(http, profile.clone()).with_timeouts(
        Duration::from_secs(config.search_timeout_secs),
        Duration::from_secs(config.fetch_timeout_secs),
    );
    Ok(HarvestPipeline::new(store, Arc::new(client), profile).with_delays(
        Duration::from_millis(config.query_delay_ms),
        Duration::from_millis(config.document_delay_ms),
    ))
}

/// Run one harvest for a trigger payload. Invocation faults (no bucket,
/// setup failure) produce a structured failure response; everything else is
/// reported as a completed run with its partial counts and errors.
pub async fn execute_trigger(config: &HarvestConfig, request: TriggerRequest) -> TriggerResponse {
    let bucket = request
        .bucket_name
        .clone()
        .or_else(|| config.bucket.clone())
        .filter(|bucket| !bucket.is_empty());
    let Some(bucket) = bucket else {
        return failed_response(400, "bucket_name not provided in request or environment");
    };

    match build_pipeline(config, &bucket) {
        Ok(pipeline) => {
            let harvest = HarvestRequest {
                queries: request.search_queries,
                max_results_per_query: request.max_results_per_query,
                prefix: request.s3_prefix,
                force_update: request.force_update,
            };
            let summary = pipeline.run_once(&harvest).await;
            completed_response(&summary)
        }
        Err(err) => failed_response(500, format!("harvest setup failed: {err:#}")),
    }
}

/// Env-driven run used by the CLI and the scheduler job.
pub async fn run_harvest_once_from_env() -> Result<TriggerResponse> {
    let config = HarvestConfig::from_env();
    let plan = load_plan_or_default(&config.workspace_root).await?;
    let request = TriggerRequest {
        bucket_name: None,
        search_queries: plan.queries,
        max_results_per_query: plan.max_results_per_query,
        s3_prefix: plan.prefix,
        force_update: false,
    };
    Ok(execute_trigger(&config, request).await)
}

pub async fn maybe_build_scheduler(config: &HarvestConfig) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(config.harvest_cron.as_str(), |_uuid, _lock| {
        Box::pin(async move {
            match run_harvest_once_from_env().await {
                Ok(TriggerResponse::Completed { results, .. }) => info!(
                    new = results.new_documents_scraped,
                    updated = results.updated_documents,
                    skipped = results.skipped_existing,
                    errors = results.errors_count,
                    "scheduled harvest finished"
                ),
                Ok(TriggerResponse::Failed { error, .. }) => {
                    warn!(error = %error, "scheduled harvest returned failure");
                }
                Err(err) => warn!(error = %err, "scheduled harvest failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {}", config.harvest_cron))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
