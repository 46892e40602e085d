use std::path::PathBuf;

use hkb_scrape::{extract, parse_search_results, SiteProfile};

fn fixture(name: &str) -> String {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name);
    std::fs::read_to_string(&path).expect("read fixture")
}

#[test]
fn search_fixture_yields_on_topic_candidates_only() {
    let profile = SiteProfile::webmd_diabetes();
    let body = fixture("search_results.html");
    let candidates = parse_search_results(&body, "diabetes symptoms", &profile, 5).expect("parse");

    let urls: Vec<_> = candidates.iter().map(|c| c.url.as_str()).collect();
    assert_eq!(
        urls,
        [
            "https://www.webmd.com/diabetes/type-1-diabetes-basics",
            "https://www.webmd.com/diabetes/type-2-diabetes-symptoms",
            "https://www.webmd.com/diabetes/diabetic-diet-overview",
        ]
    );
    assert!(candidates.iter().all(|c| c.search_query == "diabetes symptoms"));
}

#[test]
fn article_fixture_extracts_title_body_and_date() {
    let profile = SiteProfile::webmd_diabetes();
    let html = fixture("article.html");
    let doc = extract(
        &html,
        "https://www.webmd.com/diabetes/diabetes-symptoms",
        &profile,
    )
    .expect("extract");

    assert_eq!(doc.title, "Early Signs and Symptoms of Diabetes");
    assert_eq!(
        doc.body_text,
        "Frequent urination and increased thirst are common early signs. Unexplained weight loss can also occur."
    );
    assert!(!doc.body_text.contains("__ads"));
    assert!(!doc.body_text.contains("Duplicate container"));
    assert_eq!(doc.published_date.as_deref(), Some("2026-03-14"));
    assert_eq!(doc.content_length, doc.body_text.chars().count());
    assert_eq!(doc.source, "WebMD");
}
