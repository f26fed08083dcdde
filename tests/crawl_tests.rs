//! End-to-end crawl scenarios over mock HTTP servers
//!
//! These tests run the full runner (HTTP engine, content fetcher, image
//! saver, sheets writer, progress store) against wiremock sites and an
//! in-memory spreadsheet fake.

mod common;

use common::{test_global_config, test_site_yaml, FakeSheets};
use linkharvest::config::{GlobalConfig, SiteConfig};
use linkharvest::crawler::Runner;
use linkharvest::runtime::RunContext;
use linkharvest::sheets::SheetsWriter;
use linkharvest::state::StateStore;
use linkharvest::url::{canonicalize_url, fingerprint};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TAB: &str = "shop.test";
/// 0-based sheet columns under the header contract
const COL_PRODUCT_URL: usize = 3;
const COL_HASH: usize = 7;
const COL_PAGE: usize = 8;

struct Harness {
    _tmp: tempfile::TempDir,
    config: Arc<GlobalConfig>,
    state: Arc<StateStore>,
    fake: Arc<FakeSheets>,
    writer: Arc<SheetsWriter>,
    image_dir: std::path::PathBuf,
}

fn harness() -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let config = Arc::new(test_global_config(
        tmp.path().join("state/runtime.db"),
        tmp.path().join("logs/bad_proxies.log"),
    ));
    let state = Arc::new(StateStore::open(&config.state.database).unwrap());
    let fake = Arc::new(FakeSheets::new());
    let writer = Arc::new(
        SheetsWriter::new(
            fake.clone(),
            "_state".to_string(),
            "_runs".to_string(),
            config.sheet.flush_product_interval,
        )
        .with_retry_waits([Duration::from_millis(10), Duration::from_millis(20)]),
    );
    let image_dir = tmp.path().join("images");
    Harness {
        config,
        state,
        fake,
        writer,
        image_dir,
        _tmp: tmp,
    }
}

fn site(base_url: &str, extra: &str) -> Vec<Arc<SiteConfig>> {
    let parsed: SiteConfig = serde_yaml::from_str(&test_site_yaml(base_url, extra)).unwrap();
    vec![Arc::new(parsed)]
}

fn runner(h: &Harness, sites: Vec<Arc<SiteConfig>>, resume: bool) -> Runner {
    let context = RunContext::new(
        "run-1".to_string(),
        resume,
        false,
        h.config.runtime.global_stop,
    );
    Runner::new(
        context,
        h.config.clone(),
        sites,
        h.state.clone(),
        Some(h.writer.clone()),
        h.image_dir.clone(),
    )
}

fn listing(hrefs: &[&str]) -> String {
    let links: String = hrefs
        .iter()
        .map(|href| format!(r#"<a class="product" href="{}">item</a>"#, href))
        .collect();
    format!(
        r#"<html><body><div class="pagination"></div>{}</body></html>"#,
        links
    )
}

async fn mount_product(server: &MockServer, route: &str, name: &str) {
    let html = format!(
        r#"<html><head><title>{name}</title>
           <meta property="og:image" content="/img{route}.jpg"></head>
           <body><h1>{name}</h1><p>Details of {name}</p></body></html>"#,
    );
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_string(html))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/img{}.jpg", route)))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(vec![0xFFu8, 0xD8, 0xFF])
                .insert_header("content-type", "image/jpeg"),
        )
        .mount(server)
        .await;
}

/// Two pages with [P1, P2] and [P3]: three appends in extraction order,
/// final progress {last_page: 2, last_product_count: 3}
#[tokio::test]
async fn test_numbered_pagination_commits_in_order() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/items/tea"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_string(listing(&["/p/3"])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/items/tea"))
        .and(query_param("page", "3"))
        .respond_with(ResponseTemplate::new(200).set_body_string(listing(&[])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/items/tea"))
        .respond_with(ResponseTemplate::new(200).set_body_string(listing(&["/p/1", "/p/2"])))
        .mount(&server)
        .await;
    for route in ["/p/1", "/p/2", "/p/3"] {
        mount_product(&server, route, route).await;
    }

    let h = harness();
    let results = runner(&h, site(&server.uri(), ""), true).run().await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].products_new(), 3);

    let urls = h.fake.column(TAB, COL_PRODUCT_URL);
    assert_eq!(
        urls,
        vec![
            format!("{}/p/1", server.uri()),
            format!("{}/p/2", server.uri()),
            format!("{}/p/3", server.uri()),
        ]
    );
    let pages = h.fake.column(TAB, COL_PAGE);
    assert_eq!(pages, vec!["1", "1", "2"]);

    let state = h
        .state
        .get("shop", &format!("{}/items/tea", server.uri()))
        .unwrap()
        .unwrap();
    assert_eq!(state.last_page, Some(2));
    assert_eq!(state.last_product_count, Some(3));

    // Images were saved for each committed product
    let saved: Vec<_> = std::fs::read_dir(&h.image_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .collect();
    assert_eq!(saved.len(), 3);

    // End-of-run bookkeeping: one _runs row, _state rewritten from the store
    assert_eq!(h.fake.row_count("_runs"), 1);
    let state_rows = h.fake.column("_state", 0);
    assert_eq!(state_rows, vec!["shop"]);
}

/// The same product behind a utm-tagged link appears once, keyed by the
/// fingerprint of the canonical URL
#[tokio::test]
async fn test_dedupe_via_param_blacklist() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/items/tea"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_string(listing(&[])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/items/tea"))
        .respond_with(ResponseTemplate::new(200).set_body_string(listing(&[
            "/p/1?utm_source=fb",
            "/p/1",
        ])))
        .mount(&server)
        .await;
    mount_product(&server, "/p/1", "one").await;

    let h = harness();
    runner(&h, site(&server.uri(), ""), true).run().await.unwrap();

    let canonical = canonicalize_url(
        &format!("{}/p/1?utm_source=fb", server.uri()),
        None,
        &["utm_*".to_string()],
    )
    .unwrap();
    assert_eq!(canonical, format!("{}/p/1", server.uri()));

    assert_eq!(h.fake.row_count(TAB), 1);
    let hashes = h.fake.column(TAB, COL_HASH);
    assert_eq!(hashes, vec![fingerprint(&canonical)]);
}

/// Resume: progress says page 2 / 2 committed, the first two products are
/// already on the tab. The crawler starts at page 2, never refetches the
/// committed products, and appends only the new one.
#[tokio::test]
async fn test_resume_starts_after_last_commit() {
    let server = MockServer::start().await;
    let base = server.uri();
    let category = format!("{}/items/tea", base);

    // Page 1 must not be requested on resume
    Mock::given(method("GET"))
        .and(path("/items/tea"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_string(listing(&["/p/2", "/p/3"])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/items/tea"))
        .and(query_param("page", "3"))
        .respond_with(ResponseTemplate::new(200).set_body_string(listing(&[])))
        .mount(&server)
        .await;
    // The already-committed product page must not be fetched again
    Mock::given(method("GET"))
        .and(path("/p/2"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;
    mount_product(&server, "/p/3", "three").await;

    let h = harness();
    use linkharvest::sheets::PRODUCT_HEADER;
    for route in ["/p/1", "/p/2"] {
        let url = format!("{}{}", base, route);
        let mut row = vec![String::new(); PRODUCT_HEADER.len()];
        row[COL_PRODUCT_URL] = url.clone();
        row[COL_HASH] = fingerprint(&url);
        h.fake.seed_row(TAB, &PRODUCT_HEADER, row);
    }
    h.state
        .upsert(&linkharvest::state::CategoryState {
            site_name: "shop".to_string(),
            category_url: category.clone(),
            last_page: Some(2),
            last_product_count: Some(2),
            last_run_ts: None,
        })
        .unwrap();

    runner(&h, site(&base, ""), true).run().await.unwrap();

    assert_eq!(h.fake.row_count(TAB), 3);
    let urls = h.fake.column(TAB, COL_PRODUCT_URL);
    assert_eq!(urls.last().unwrap(), &format!("{}/p/3", base));

    let state = h.state.get("shop", &category).unwrap().unwrap();
    assert_eq!(state.last_page, Some(2));
    assert_eq!(state.last_product_count, Some(3));
}

/// Running twice over an unchanged site adds zero rows the second time
#[tokio::test]
async fn test_second_run_is_idempotent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/items/tea"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_string(listing(&[])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/items/tea"))
        .respond_with(ResponseTemplate::new(200).set_body_string(listing(&["/p/1", "/p/2"])))
        .mount(&server)
        .await;
    mount_product(&server, "/p/1", "one").await;
    mount_product(&server, "/p/2", "two").await;

    let h = harness();
    runner(&h, site(&server.uri(), ""), true).run().await.unwrap();
    assert_eq!(h.fake.row_count(TAB), 2);

    // A fresh writer for the second run, so its seen cache must be seeded
    // from the sheet rather than inherited in memory
    let second_writer = Arc::new(SheetsWriter::new(
        h.fake.clone(),
        "_state".to_string(),
        "_runs".to_string(),
        1,
    ));
    // resume off: the crawler revisits page 1 and must drop every product
    // through the seeded seen cache
    let context = RunContext::new(
        "run-2".to_string(),
        false,
        false,
        h.config.runtime.global_stop,
    );
    Runner::new(
        context,
        h.config.clone(),
        site(&server.uri(), ""),
        h.state.clone(),
        Some(second_writer),
        h.image_dir.clone(),
    )
    .run()
    .await
    .unwrap();
    assert_eq!(h.fake.row_count(TAB), 2, "second run must add no rows");
}

/// start_page == end_page == 10 processes exactly that one page
#[tokio::test]
async fn test_single_page_window() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/items/tea"))
        .and(query_param("page", "10"))
        .respond_with(ResponseTemplate::new(200).set_body_string(listing(&["/p/10"])))
        .expect(1)
        .mount(&server)
        .await;
    mount_product(&server, "/p/10", "ten").await;

    let h = harness();
    let extra = "limits: {}\n";
    let mut sites = site(&server.uri(), extra);
    {
        let site = Arc::get_mut(&mut sites[0]).unwrap();
        site.pagination.start_page = Some(10);
        site.pagination.end_page = Some(10);
    }
    runner(&h, sites, false).run().await.unwrap();

    assert_eq!(h.fake.row_count(TAB), 1);
    let pages = h.fake.column(TAB, COL_PAGE);
    assert_eq!(pages, vec!["10"]);
}

/// A missing-selector stop condition on page 1 ends the category with zero
/// products and last_page 1
#[tokio::test]
async fn test_missing_selector_stops_on_page_one() {
    let server = MockServer::start().await;
    // No .pagination element on the page
    Mock::given(method("GET"))
        .and(path("/items/tea"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"<html><body><a class="product" href="/p/1">x</a></body></html>"#,
        ))
        .mount(&server)
        .await;

    let h = harness();
    let extra = "stop_conditions:\n  - {type: missing_selector, value: \".pagination\"}\n";
    let results = runner(&h, site(&server.uri(), extra), true).run().await.unwrap();

    assert_eq!(h.fake.row_count(TAB), 0);
    assert_eq!(results[0].products_new(), 0);
    let state = h
        .state
        .get("shop", &format!("{}/items/tea", server.uri()))
        .unwrap()
        .unwrap();
    assert_eq!(state.last_page, Some(1));
}

/// max_products caps committed rows per category
#[tokio::test]
async fn test_max_products_limit() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/items/tea"))
        .respond_with(ResponseTemplate::new(200).set_body_string(listing(&[
            "/p/1", "/p/2", "/p/3", "/p/4", "/p/5",
        ])))
        .mount(&server)
        .await;
    for route in ["/p/1", "/p/2", "/p/3", "/p/4", "/p/5"] {
        mount_product(&server, route, route).await;
    }

    let h = harness();
    let extra = "limits:\n  max_products: 2\n";
    let results = runner(&h, site(&server.uri(), extra), false).run().await.unwrap();

    assert_eq!(h.fake.row_count(TAB), 2);
    assert_eq!(results[0].products_new(), 2);
}

/// A product page that fails to fetch is skipped and logged; the crawler
/// continues with the next product
#[tokio::test]
async fn test_failed_product_is_skipped_and_logged() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/items/tea"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_string(listing(&[])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/items/tea"))
        .respond_with(ResponseTemplate::new(200).set_body_string(listing(&["/p/bad", "/p/ok"])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/p/bad"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    mount_product(&server, "/p/ok", "ok").await;

    let h = harness();
    let results = runner(&h, site(&server.uri(), ""), true).run().await.unwrap();

    assert_eq!(h.fake.row_count(TAB), 1);
    assert_eq!(results[0].metrics[0].total_failed, 1);

    let log = std::fs::read_to_string(
        h.config
            .state
            .database
            .parent()
            .unwrap()
            .join("skipped_products.log"),
    )
    .unwrap();
    let lines: Vec<&str> = log.lines().collect();
    assert_eq!(lines.len(), 1);
    let fields: Vec<&str> = lines[0].split('\t').collect();
    assert_eq!(fields[1], format!("{}/p/bad", server.uri()));
    assert!(chrono::DateTime::parse_from_rfc3339(fields[0]).is_ok());
}
