//! Site search and article extraction for the HKB harvester.
//!
//! The heuristics here are tuned to a single consumer-health site layout;
//! the selectors live in [`SiteProfile`] so they stay data, not code.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use hkb_core::{Candidate, ScrapedDocument};
use hkb_storage::{FetchError, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use url::Url;

pub const CRATE_NAME: &str = "hkb-scrape";

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("invalid selector {0}")]
    Selector(String),
    #[error("invalid url {url}: {message}")]
    Url { url: String, message: String },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{0}")]
    Message(String),
}

/// Search endpoint and extraction selectors for one target site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteProfile {
    /// Source tag stamped on every candidate and document.
    pub source: String,
    pub origin: Url,
    pub search_path: String,
    /// Fixed query-string parameters the search endpoint expects.
    pub static_params: Vec<(String, String)>,
    /// Topical suffix appended to every search query.
    pub query_suffix: String,
    /// Accepted link hosts must end with this fragment.
    pub host_fragment: String,
    /// Accepted link paths must contain this segment (case-insensitive).
    pub topic_segment: String,
    pub result_selector: String,
    pub content_selectors: Vec<String>,
    pub date_selectors: Vec<String>,
}

impl SiteProfile {
    pub fn webmd_diabetes() -> Self {
        Self {
            source: "WebMD".to_string(),
            origin: Url::parse("https://www.webmd.com").expect("static origin"),
            search_path: "/search/search_results/default.aspx".to_string(),
            static_params: vec![("sourceType".to_string(), "undefined".to_string())],
            query_suffix: " diabetes".to_string(),
            host_fragment: "webmd.com".to_string(),
            topic_segment: "/diabetes".to_string(),
            result_selector: "a.search-result-link".to_string(),
            content_selectors: vec![
                ".article-content".to_string(),
                ".content-body".to_string(),
                ".main-content".to_string(),
                "article".to_string(),
                ".article-body".to_string(),
            ],
            date_selectors: vec![
                r#"meta[name="publish-date"]"#.to_string(),
                r#"meta[property="article:published_time"]"#.to_string(),
                ".publish-date".to_string(),
                ".date".to_string(),
            ],
        }
    }
}

pub fn build_search_url(profile: &SiteProfile, query: &str) -> Result<Url, ScrapeError> {
    let mut url = profile
        .origin
        .join(&profile.search_path)
        .map_err(|err| ScrapeError::Url {
            url: profile.search_path.clone(),
            message: err.to_string(),
        })?;
    {
        let mut pairs = url.query_pairs_mut();
        pairs.append_pair("query", &format!("{query}{}", profile.query_suffix));
        for (name, value) in &profile.static_params {
            pairs.append_pair(name, value);
        }
    }
    Ok(url)
}

fn sel(selector: &str) -> Result<Selector, ScrapeError> {
    Selector::parse(selector).map_err(|err| ScrapeError::Selector(format!("{selector}: {err}")))
}

fn select_first<'a>(doc: &'a Html, selector: &str) -> Result<Option<ElementRef<'a>>, ScrapeError> {
    let sel = sel(selector)?;
    Ok(doc.select(&sel).next())
}

fn collect_text(element: &ElementRef<'_>, parts: &mut Vec<String>) {
    if matches!(element.value().name(), "script" | "style") {
        return;
    }
    for child in element.children() {
        if let Some(text) = child.value().as_text() {
            for token in text.split_whitespace() {
                parts.push(token.to_string());
            }
        } else if let Some(child_element) = ElementRef::wrap(child) {
            collect_text(&child_element, parts);
        }
    }
}

/// Whitespace-normalized text content, with script/style subtrees excluded.
fn clean_text(element: ElementRef<'_>) -> String {
    let mut parts = Vec::new();
    collect_text(&element, &mut parts);
    parts.join(" ")
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Parse a search-results page into candidates.
///
/// Anchors from the profile's result selector are used when present, all
/// anchors otherwise. Links are resolved against the site origin, filtered
/// by host and topic segment, then truncated to `max_results`.
pub fn parse_search_results(
    body: &str,
    query: &str,
    profile: &SiteProfile,
    max_results: usize,
) -> Result<Vec<Candidate>, ScrapeError> {
    let doc = Html::parse_document(body);

    let primary = sel(&profile.result_selector)?;
    let mut anchors: Vec<ElementRef<'_>> = doc.select(&primary).collect();
    if anchors.is_empty() {
        let fallback = sel("a[href]")?;
        anchors = doc.select(&fallback).collect();
    }

    let mut candidates = Vec::new();
    for anchor in anchors {
        if candidates.len() >= max_results {
            break;
        }
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let Ok(resolved) = profile.origin.join(href) else {
            continue;
        };
        let host_ok = resolved
            .host_str()
            .is_some_and(|host| host.ends_with(&profile.host_fragment));
        let topic_ok = resolved
            .path()
            .to_ascii_lowercase()
            .contains(&profile.topic_segment);
        if !host_ok || !topic_ok {
            continue;
        }

        let title = non_empty(clean_text(anchor)).unwrap_or_else(|| "No title".to_string());
        candidates.push(Candidate {
            title,
            url: resolved.to_string(),
            source: profile.source.clone(),
            search_query: query.to_string(),
        });
    }

    Ok(candidates)
}

/// Extract a document from raw markup.
///
/// Structurally missing content degrades to sentinels ("No title", empty
/// body, absent date); the only error here is a malformed profile selector.
pub fn extract(html: &str, url: &str, profile: &SiteProfile) -> Result<ScrapedDocument, ScrapeError> {
    let doc = Html::parse_document(html);

    let title = match select_first(&doc, "h1")?.map(clean_text).and_then(non_empty) {
        Some(title) => title,
        None => select_first(&doc, "title")?
            .map(clean_text)
            .and_then(non_empty)
            .unwrap_or_else(|| "No title".to_string()),
    };

    let mut body_text = String::new();
    for selector in &profile.content_selectors {
        if let Some(element) = select_first(&doc, selector)? {
            body_text = clean_text(element);
            break;
        }
    }
    if body_text.is_empty() {
        let paragraph = sel("p")?;
        body_text = doc
            .select(&paragraph)
            .map(clean_text)
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
    }

    let mut published_date = None;
    for selector in &profile.date_selectors {
        if let Some(element) = select_first(&doc, selector)? {
            let value = element
                .value()
                .attr("content")
                .map(|attr| attr.trim().to_string())
                .and_then(non_empty)
                .or_else(|| non_empty(clean_text(element)));
            if value.is_some() {
                published_date = value;
                break;
            }
        }
    }

    let content_length = body_text.chars().count();
    Ok(ScrapedDocument {
        title,
        body_text,
        url: url.to_string(),
        published_date,
        scraped_at: Utc::now(),
        source: profile.source.clone(),
        content_length,
        error: None,
    })
}

/// Network surface the orchestrator depends on. Kept as a trait so runs can
/// be driven against canned corpora in tests.
#[async_trait]
pub trait Fetch: Send + Sync {
    /// Best-effort search; failures are logged and yield an empty list.
    async fn search(&self, query: &str, max_results: usize) -> Vec<Candidate>;
    /// Raw markup for one document; non-2xx statuses are errors.
    async fn fetch_document(&self, url: &str) -> Result<String, ScrapeError>;
}

/// HTTP-backed [`Fetch`] for one site profile.
pub struct SiteClient {
    http: HttpFetcher,
    profile: SiteProfile,
    search_timeout: Duration,
    fetch_timeout: Duration,
}

impl SiteClient {
    pub fn new(http: HttpFetcher, profile: SiteProfile) -> Self {
        Self {
            http,
            profile,
            search_timeout: Duration::from_secs(10),
            fetch_timeout: Duration::from_secs(15),
        }
    }

    pub fn with_timeouts(mut self, search: Duration, fetch: Duration) -> Self {
        self.search_timeout = search;
        self.fetch_timeout = fetch;
        self
    }

    pub fn profile(&self) -> &SiteProfile {
        &self.profile
    }
}

#[async_trait]
impl Fetch for SiteClient {
    async fn search(&self, query: &str, max_results: usize) -> Vec<Candidate> {
        let url = match build_search_url(&self.profile, query) {
            Ok(url) => url,
            Err(err) => {
                warn!(query, error = %err, "search url construction failed");
                return Vec::new();
            }
        };

        match self.http.fetch_text(url.as_str(), self.search_timeout).await {
            Ok(response) => {
                match parse_search_results(&response.body, query, &self.profile, max_results) {
                    Ok(candidates) => candidates,
                    Err(err) => {
                        warn!(query, error = %err, "search result parsing failed");
                        Vec::new()
                    }
                }
            }
            Err(err) => {
                warn!(query, error = %err, "search request failed");
                Vec::new()
            }
        }
    }

    async fn fetch_document(&self, url: &str) -> Result<String, ScrapeError> {
        let response = self.http.fetch_text(url, self.fetch_timeout).await?;
        Ok(response.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> SiteProfile {
        SiteProfile::webmd_diabetes()
    }

    #[test]
    fn search_url_carries_query_suffix_and_static_params() {
        let url = build_search_url(&profile(), "insulin basics").expect("url");
        let query = url.query().expect("query string");
        assert!(query.contains("query=insulin+basics+diabetes"));
        assert!(query.contains("sourceType=undefined"));
        assert!(url.path().ends_with("/search/search_results/default.aspx"));
    }

    #[test]
    fn primary_result_selector_wins_and_relative_links_are_rewritten() {
        let body = r#"
            <html><body>
              <a class="search-result-link" href="/diabetes/type-2-overview">Type 2 Overview</a>
              <a class="search-result-link" href="https://www.webmd.com/diabetes/diet">Diet</a>
              <a href="/diabetes/ignored-because-primary-matched">Ignored</a>
            </body></html>"#;
        let candidates = parse_search_results(body, "diet", &profile(), 10).expect("parse");
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].url, "https://www.webmd.com/diabetes/type-2-overview");
        assert_eq!(candidates[0].title, "Type 2 Overview");
        assert_eq!(candidates[0].source, "WebMD");
        assert_eq!(candidates[0].search_query, "diet");
    }

    #[test]
    fn falls_back_to_all_anchors_when_primary_selector_matches_nothing() {
        let body = r#"
            <html><body>
              <a href="/diabetes/symptoms">Symptoms</a>
              <a href="https://elsewhere.example.com/diabetes/offsite">Offsite</a>
              <a href="https://www.webmd.com/heart/unrelated">Wrong topic</a>
              <a href="/Diabetes/Case-Insensitive">Mixed case</a>
            </body></html>"#;
        let candidates = parse_search_results(body, "symptoms", &profile(), 10).expect("parse");
        let urls: Vec<_> = candidates.iter().map(|c| c.url.as_str()).collect();
        assert_eq!(
            urls,
            [
                "https://www.webmd.com/diabetes/symptoms",
                "https://www.webmd.com/Diabetes/Case-Insensitive",
            ]
        );
    }

    #[test]
    fn filtering_happens_before_truncation() {
        let body = r#"
            <html><body>
              <a href="https://elsewhere.example.com/diabetes/a">off-site</a>
              <a href="https://elsewhere.example.com/diabetes/b">off-site</a>
              <a href="/diabetes/kept-one">Kept One</a>
              <a href="/diabetes/kept-two">Kept Two</a>
            </body></html>"#;
        let candidates = parse_search_results(body, "q", &profile(), 2).expect("parse");
        assert_eq!(candidates.len(), 2);
        assert!(candidates.iter().all(|c| c.url.contains("kept")));
    }

    #[test]
    fn anchor_without_text_gets_title_sentinel() {
        let body = r#"<html><body><a href="/diabetes/no-text"></a></body></html>"#;
        let candidates = parse_search_results(body, "q", &profile(), 5).expect("parse");
        assert_eq!(candidates[0].title, "No title");
    }

    #[test]
    fn extract_prefers_article_content_and_strips_scripts() {
        let html = r#"
            <html><head><title>Page Title</title></head><body>
              <h1>Managing Blood Sugar</h1>
              <div class="article-content">
                Keep levels steady.
                <script>var tracker = "noise";</script>
                <style>.x { color: red }</style>
                <p>Eat regularly.</p>
              </div>
              <article>Should not be chosen.</article>
            </body></html>"#;
        let doc = extract(html, "https://www.webmd.com/diabetes/a", &profile()).expect("extract");
        assert_eq!(doc.title, "Managing Blood Sugar");
        assert_eq!(doc.body_text, "Keep levels steady. Eat regularly.");
        assert!(!doc.body_text.contains("noise"));
        assert_eq!(doc.content_length, doc.body_text.chars().count());
        assert!(doc.error.is_none());
    }

    #[test]
    fn extract_falls_back_to_paragraphs_and_title_sentinel() {
        let html = r#"
            <html><body>
              <p>First paragraph.</p>
              <p>   </p>
              <p>Second paragraph.</p>
            </body></html>"#;
        let doc = extract(html, "https://www.webmd.com/diabetes/b", &profile()).expect("extract");
        assert_eq!(doc.title, "No title");
        assert_eq!(doc.body_text, "First paragraph. Second paragraph.");
    }

    #[test]
    fn extract_title_falls_back_to_title_element() {
        let html = r#"<html><head><title>Fallback Title</title></head><body><p>x</p></body></html>"#;
        let doc = extract(html, "https://www.webmd.com/diabetes/c", &profile()).expect("extract");
        assert_eq!(doc.title, "Fallback Title");
    }

    #[test]
    fn published_date_prefers_meta_content_in_order() {
        let html = r#"
            <html><head>
              <meta name="publish-date" content="2026-01-05">
              <meta property="article:published_time" content="2026-01-06T00:00:00Z">
            </head><body>
              <div class="date">January 7, 2026</div>
              <p>body</p>
            </body></html>"#;
        let doc = extract(html, "https://www.webmd.com/diabetes/d", &profile()).expect("extract");
        assert_eq!(doc.published_date.as_deref(), Some("2026-01-05"));
    }

    #[test]
    fn published_date_uses_element_text_and_stays_absent_when_unmatched() {
        let dated = r#"<html><body><div class="publish-date">May 2, 2026</div><p>x</p></body></html>"#;
        let doc = extract(dated, "https://www.webmd.com/diabetes/e", &profile()).expect("extract");
        assert_eq!(doc.published_date.as_deref(), Some("May 2, 2026"));

        let undated = r#"<html><body><p>x</p></body></html>"#;
        let doc = extract(undated, "https://www.webmd.com/diabetes/f", &profile()).expect("extract");
        assert!(doc.published_date.is_none());
    }
}
