//! End-to-end runs against a mock HTTP server: real robots fetching, real
//! adapters, production wiring.

use std::sync::Arc;

use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use browser_research::browser::http::HttpBrowser;
use browser_research::http_client::HttpClient;
use browser_research::sources::generic_page::GenericPageAdapter;
use browser_research::sources::OriginGate;
use browser_research::*;

const ARTICLE: &str = r#"<html><head><title>Borrow checking</title></head><body>
<nav class="menu">Home | About</nav>
<article><p>The borrow checker enforces that references never outlive the data they point to,
and that mutable access is exclusive. This paragraph is long enough to count as main content
for the extractor and carries the text the test looks for.</p></article>
<footer>copyright</footer></body></html>"#;

fn page_orchestrator(cfg: OrchestratorConfig) -> Orchestrator {
    let http = HttpClient::new(&cfg.robots.user_agent, 5000);
    let robots = Arc::new(RobotsGate::new(Arc::new(http.clone()), cfg.robots.clone()));
    let limiter = Arc::new(RateLimiter::new(&cfg.rate_limit));
    let adapter = GenericPageAdapter::new(
        Arc::new(HttpBrowser::new(http)),
        &cfg.sources.generic_page,
    )
    .with_redirect_gate(OriginGate::new(robots.clone(), limiter.clone()));
    Orchestrator::builder(cfg)
        .robots(robots)
        .rate_limiter(limiter)
        .adapter(Arc::new(adapter))
        .build()
}

fn html_page() -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "text/html")
        .set_body_string(ARTICLE)
}

fn redirect_to(location: String) -> ResponseTemplate {
    ResponseTemplate::new(302).insert_header("location", location.as_str())
}

#[tokio::test]
async fn test_generic_pages_honour_robots() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string("User-agent: *\nDisallow: /private\n"),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/guide"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/html")
                .set_body_string(ARTICLE),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/private/notes"))
        .respond_with(ResponseTemplate::new(200).set_body_string("secret"))
        .expect(0)
        .mount(&server)
        .await;

    let orch = page_orchestrator(OrchestratorConfig::default());
    let plan = ResearchPlan::new(
        "borrow checker",
        vec![
            Task::new("guide", SourceKind::GenericPage, format!("{}/guide", server.uri())),
            Task::new(
                "notes",
                SourceKind::GenericPage,
                format!("{}/private/notes", server.uri()),
            ),
        ],
        vec![],
    );

    let result = orch.execute(&plan).await.unwrap();

    let page = result.result_for("guide").unwrap();
    assert_eq!(page.status, TaskStatus::Succeeded);
    assert_eq!(page.documents[0].title, "Borrow checking");
    assert!(page.documents[0].text.contains("mutable access is exclusive"));
    assert!(!page.documents[0].text.contains("copyright"));

    assert_eq!(result.manifest_entry("notes").unwrap().status, TaskStatus::Denied);
    assert_eq!(orch.rate_limiter().grants(), 1);
}

#[tokio::test]
async fn test_unreachable_robots_falls_back_to_policy() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/guide"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/html")
                .set_body_string(ARTICLE),
        )
        .mount(&server)
        .await;

    let orch = page_orchestrator(OrchestratorConfig::default());
    let plan = ResearchPlan::new(
        "q",
        vec![Task::new("guide", SourceKind::GenericPage, format!("{}/guide", server.uri()))],
        vec![],
    );

    let result = orch.execute(&plan).await.unwrap();
    assert_eq!(result.results[0].status, TaskStatus::Succeeded);
    assert_eq!(result.degraded_origins.len(), 1);
    assert_eq!(result.degraded_origins[0].origin, server.uri());
}

#[tokio::test]
async fn test_page_not_found_is_permanent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/gone"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let orch = page_orchestrator(OrchestratorConfig::default());
    let plan = ResearchPlan::new(
        "q",
        vec![Task::new("gone", SourceKind::GenericPage, format!("{}/gone", server.uri()))],
        vec![],
    );

    let result = orch.execute(&plan).await.unwrap();
    let entry = result.manifest_entry("gone").unwrap();
    assert_eq!(entry.status, TaskStatus::Failed);
    assert_eq!(entry.attempts, 1);
}

#[tokio::test]
async fn test_non_http_page_fails_without_attempts() {
    let mut cfg = OrchestratorConfig::default();
    cfg.retry.max_attempts = 3;
    let orch = page_orchestrator(cfg);
    let plan = ResearchPlan::new(
        "q",
        vec![Task::new("paper", SourceKind::GenericPage, "ftp://example.com/paper.pdf")],
        vec![],
    );

    let result = orch.execute(&plan).await.unwrap();
    let entry = result.manifest_entry("paper").unwrap();
    assert_eq!(entry.status, TaskStatus::Failed);
    assert_eq!(entry.attempts, 0);
    assert!(entry.reason.contains("unsupported url scheme"));
    assert_eq!(orch.robots().fetch_count(), 0);
    assert!(result.degraded_origins.is_empty());
    assert_eq!(orch.rate_limiter().grants(), 0);
}

#[tokio::test]
async fn test_redirect_to_disallowed_origin_is_not_followed() {
    let home = MockServer::start().await;
    let away = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/moved"))
        .respond_with(redirect_to(format!("{}/landing", away.uri())))
        .expect(1)
        .mount(&home)
        .await;
    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_string("User-agent: *\nDisallow: /landing\n"))
        .mount(&away)
        .await;
    Mock::given(method("GET"))
        .and(path("/landing"))
        .respond_with(html_page())
        .expect(0)
        .mount(&away)
        .await;

    let orch = page_orchestrator(OrchestratorConfig::default());
    let plan = ResearchPlan::new(
        "q",
        vec![Task::new("moved", SourceKind::GenericPage, format!("{}/moved", home.uri()))],
        vec![],
    );

    let result = orch.execute(&plan).await.unwrap();
    let entry = result.manifest_entry("moved").unwrap();
    assert_eq!(entry.status, TaskStatus::Failed);
    assert_eq!(entry.attempts, 1);
    assert!(entry.reason.contains("refused"));
    assert_eq!(orch.rate_limiter().grants(), 1);
}

#[tokio::test]
async fn test_redirect_to_allowed_origin_is_gated_and_followed() {
    let home = MockServer::start().await;
    let away = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/moved"))
        .respond_with(redirect_to(format!("{}/landing", away.uri())))
        .mount(&home)
        .await;
    Mock::given(method("GET"))
        .and(path("/landing"))
        .respond_with(html_page())
        .expect(1)
        .mount(&away)
        .await;

    let orch = page_orchestrator(OrchestratorConfig::default());
    let plan = ResearchPlan::new(
        "q",
        vec![Task::new("moved", SourceKind::GenericPage, format!("{}/moved", home.uri()))],
        vec![],
    );

    let result = orch.execute(&plan).await.unwrap();
    let page = result.result_for("moved").unwrap();
    assert_eq!(page.status, TaskStatus::Succeeded);
    assert_eq!(page.documents[0].url, format!("{}/landing", away.uri()));
    // One token for each origin, and both robots files were consulted.
    assert_eq!(orch.rate_limiter().grants(), 2);
    assert_eq!(orch.robots().fetch_count(), 2);
}

fn wiki_search(server: &MockServer, query: &str, title: &str) -> Mock {
    Mock::given(method("GET"))
        .and(path("/w/api.php"))
        .and(query_param("gsrsearch", query))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "query": { "pages": [
                {
                    "pageid": 7,
                    "title": title,
                    "index": 1,
                    "extract": "Ownership is a set of rules.",
                    "fullurl": format!("{}/wiki/{}", server.uri(), title.replace(' ', "_"))
                }
            ]}
        })))
}

#[tokio::test]
async fn test_production_wiring_encyclopedia() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_string("User-agent: *\nDisallow: /w/\n"))
        .expect(0)
        .mount(&server)
        .await;
    wiki_search(&server, "ownership", "Ownership (Rust)")
        .expect(1)
        .mount(&server)
        .await;

    let mut cfg = OrchestratorConfig::default();
    cfg.sources.encyclopedia.api_url = format!("{}/w/api.php", server.uri());
    let orch = Orchestrator::from_config(cfg).unwrap();
    let plan = ResearchPlan::new(
        "rust ownership",
        vec![Task::new("e1", SourceKind::Encyclopedia, "ownership")],
        vec![SourceKind::Encyclopedia],
    );

    let result = orch.execute(&plan).await.unwrap();

    let found = result.result_for("e1").unwrap();
    assert_eq!(found.documents[0].title, "Ownership (Rust)");
    assert_eq!(
        found.documents[0].metadata.get("source").map(String::as_str),
        Some("wikipedia")
    );
    // The API endpoint is exempt from robots checks, and the result says so.
    assert_eq!(result.robots_exempt_origins, vec![server.uri()]);

    let refs = result.references_markdown();
    assert!(refs.contains("1. Ownership (Rust). Wikipedia. Retrieved from"));
}

#[tokio::test]
async fn test_encyclopedia_api_is_robots_checked_when_not_exempt() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("User-agent: *\nDisallow: /w/api.php?*gsrsearch=Secret\n"),
        )
        .expect(1)
        .mount(&server)
        .await;
    wiki_search(&server, "ownership", "Ownership (Rust)")
        .expect(1)
        .mount(&server)
        .await;
    wiki_search(&server, "Secret plans", "Secret")
        .expect(0)
        .mount(&server)
        .await;

    let mut cfg = OrchestratorConfig::default();
    cfg.sources.encyclopedia.api_url = format!("{}/w/api.php", server.uri());
    cfg.robots.api_exempt = false;
    let orch = Orchestrator::from_config(cfg).unwrap();
    let plan = ResearchPlan::new(
        "rust ownership",
        vec![
            Task::new("e1", SourceKind::Encyclopedia, "ownership"),
            Task::new("e2", SourceKind::Encyclopedia, "Secret plans"),
        ],
        vec![SourceKind::Encyclopedia],
    );

    let result = orch.execute(&plan).await.unwrap();

    assert_eq!(result.result_for("e1").unwrap().status, TaskStatus::Succeeded);
    assert_eq!(result.manifest_entry("e2").unwrap().status, TaskStatus::Denied);
    assert!(result.robots_exempt_origins.is_empty());
}
