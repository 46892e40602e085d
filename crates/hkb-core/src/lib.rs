//! Core domain model for the HKB harvester.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "hkb-core";

/// Search-result reference not yet fetched. Unique key is `url`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub title: String,
    pub url: String,
    pub source: String,
    pub search_query: String,
}

/// Fully fetched and extracted content for one URL.
///
/// When `error` is set the value is a failure record, not content: it is
/// never persisted to the object store and never updates fingerprints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapedDocument {
    pub title: String,
    pub body_text: String,
    pub url: String,
    pub published_date: Option<String>,
    pub scraped_at: DateTime<Utc>,
    pub source: String,
    pub content_length: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ScrapedDocument {
    pub fn failure(url: impl Into<String>, source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            title: "Error".to_string(),
            body_text: String::new(),
            url: url.into(),
            published_date: None,
            scraped_at: Utc::now(),
            source: source.into(),
            content_length: 0,
            error: Some(message.into()),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }
}

/// Durable dedup state for one bucket.
///
/// Both hash sets only ever grow, `total_documents` only ever increments,
/// and the record is overwritten in full at the end of every run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingRecord {
    #[serde(default)]
    pub url_hashes: BTreeSet<String>,
    #[serde(default)]
    pub content_hashes: BTreeSet<String>,
    #[serde(default)]
    pub last_run: Option<String>,
    #[serde(default)]
    pub total_documents: u64,
}

impl TrackingRecord {
    /// First-run record: empty sets, `last_run` stamped now.
    pub fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            last_run: Some(now.to_rfc3339()),
            ..Self::default()
        }
    }
}

/// Outcome of one harvest run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Distinct candidates surfaced this run, including ones later skipped.
    pub candidates_found: usize,
    pub accepted_new: usize,
    pub accepted_updated: usize,
    pub skipped_existing: usize,
    pub objects_created: Vec<String>,
    pub objects_updated: Vec<String>,
    pub errors: Vec<String>,
    pub next_run_scheduled: DateTime<Utc>,
}

impl RunSummary {
    pub fn started(run_id: Uuid, started_at: DateTime<Utc>, next_run_scheduled: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: started_at,
            candidates_found: 0,
            accepted_new: 0,
            accepted_updated: 0,
            skipped_existing: 0,
            objects_created: Vec::new(),
            objects_updated: Vec::new(),
            errors: Vec::new(),
            next_run_scheduled,
        }
    }
}
