//! Scheduler tick scenarios: eviction, discovery top-up, and the
//! country-restricted working set.

use async_trait::async_trait;
use proxyring::config::SelectionMode;
use proxyring::database::Database;
use proxyring::discovery::{CandidateSource, DiscoveryProvider};
use proxyring::error::{PoolError, Result};
use proxyring::models::GeoInfo;
use proxyring::pool::{PoolManager, ProbeTransport, Prober};
use proxyring::proxy::Rotator;
use proxyring::repository::ProxyRepository;
use proxyring::scheduler::Scheduler;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

struct AlwaysUp;

#[async_trait]
impl ProbeTransport for AlwaysUp {
    async fn probe(&self, _upstream: &str, _target: &str) -> Result<()> {
        Ok(())
    }
}

struct AlwaysDown;

#[async_trait]
impl ProbeTransport for AlwaysDown {
    async fn probe(&self, _upstream: &str, _target: &str) -> Result<()> {
        Err(PoolError::Dial("scripted failure".into()))
    }
}

struct StubProvider {
    listing_url: String,
}

#[async_trait]
impl DiscoveryProvider for StubProvider {
    fn name(&self) -> &'static str {
        "stub"
    }

    async fn fetch_candidates(&self, _client: &reqwest::Client) -> Result<Vec<CandidateSource>> {
        Ok(vec![CandidateSource {
            listing_url: self.listing_url.clone(),
            geo: None,
        }])
    }
}

/// Minimal HTTP server answering every request with the given JSON body
async fn serve_json(body: String) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let body = body.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    });
    format!("http://{}", addr)
}

async fn setup_store(down_delta: i64) -> (Database, ProxyRepository) {
    let db = Database::open_in_memory().await.unwrap();
    db.run_migrations().await.unwrap();
    let repo = ProxyRepository::new(db.pool().clone(), 1, down_delta);
    (db, repo)
}

fn build_scheduler(
    repo: ProxyRepository,
    transport: Arc<dyn ProbeTransport>,
    providers: Vec<Arc<dyn DiscoveryProvider>>,
    rotator: Arc<Rotator>,
    min_pool_size: i64,
) -> Scheduler {
    let prober = Arc::new(Prober::with_transport(
        transport,
        vec!["http://probe-target/0".to_string()],
    ));
    let manager = Arc::new(PoolManager::new(
        repo.clone(),
        prober.clone(),
        providers,
        None,
    ));
    Scheduler::new(
        repo,
        prober,
        manager,
        rotator,
        Duration::from_secs(3600),
        min_pool_size,
    )
}

#[tokio::test]
async fn eviction_tick_removes_negative_rows_and_rescores_the_rest() {
    let (db, repo) = setup_store(10).await;

    for (ip, priority) in [
        ("10.0.0.1", 5i64),
        ("10.0.0.2", 0),
        ("10.0.0.3", -1),
        ("10.0.0.4", -7),
    ] {
        repo.insert(ip, 8080, "http", &GeoInfo::default())
            .await
            .unwrap();
        sqlx::query("UPDATE proxies SET priority = ? WHERE ip = ?")
            .bind(priority)
            .bind(ip)
            .execute(db.pool())
            .await
            .unwrap();
    }

    let (rotator, _topup_rx) = Rotator::new(SelectionMode::Priority, false, 10);
    let scheduler = build_scheduler(repo.clone(), Arc::new(AlwaysDown), Vec::new(), rotator, 0);

    scheduler.run_tick().await;

    // The originally negative rows are gone before probing ever sees
    // them; the surviving rows were decremented below zero by the failed
    // probes and no longer appear in active listings.
    assert_eq!(repo.count().await.unwrap(), 2);
    assert!(repo.list_active_by_priority().await.unwrap().is_empty());

    let priorities: Vec<(String, i64)> = sqlx::query_as("SELECT ip, priority FROM proxies ORDER BY ip")
        .fetch_all(db.pool())
        .await
        .unwrap();
    assert_eq!(
        priorities,
        vec![
            ("10.0.0.1".to_string(), -5),
            ("10.0.0.2".to_string(), -10)
        ]
    );

    // The next tick evicts them.
    scheduler.run_tick().await;
    assert_eq!(repo.count().await.unwrap(), 0);
}

#[tokio::test]
async fn tick_tops_up_a_pool_below_minimum() {
    let (_db, repo) = setup_store(10).await;

    repo.insert("10.1.0.1", 8080, "http", &GeoInfo::default())
        .await
        .unwrap();
    repo.insert("10.1.0.2", 8080, "http", &GeoInfo::default())
        .await
        .unwrap();

    let listing = serde_json::json!([
        {"proxy": "10.9.0.1:8080"},
        {"proxy": "10.9.0.2:8080"},
        {"proxy": "10.9.0.3:8080"},
        {"proxy": "10.9.0.4:8080"},
        {"proxy": "10.9.0.5:8080"},
        {"proxy": "10.9.0.6:8080"},
        {"proxy": "10.9.0.7:8080"},
        {"proxy": "10.9.0.8:8080"},
    ])
    .to_string();
    let listing_url = serve_json(listing).await;
    let provider: Arc<dyn DiscoveryProvider> = Arc::new(StubProvider { listing_url });

    let (rotator, _topup_rx) = Rotator::new(SelectionMode::Priority, false, 10);
    let scheduler = build_scheduler(
        repo.clone(),
        Arc::new(AlwaysUp),
        vec![provider],
        rotator.clone(),
        5,
    );

    scheduler.run_tick().await;

    assert!(repo.count().await.unwrap() >= 5);
    // The refreshed working set picks up the new upstreams.
    assert!(rotator.len() >= 5);
}

#[tokio::test]
async fn tick_does_not_discover_when_pool_is_large_enough() {
    let (_db, repo) = setup_store(10).await;

    repo.insert("10.2.0.1", 8080, "http", &GeoInfo::default())
        .await
        .unwrap();

    // A provider pointing at a dead address: reaching it would mark the
    // run with a warning but, more importantly, storing anything would
    // change the count.
    let provider: Arc<dyn DiscoveryProvider> = Arc::new(StubProvider {
        listing_url: "http://127.0.0.1:1".to_string(),
    });

    let (rotator, _topup_rx) = Rotator::new(SelectionMode::Priority, false, 10);
    let scheduler = build_scheduler(
        repo.clone(),
        Arc::new(AlwaysUp),
        vec![provider],
        rotator,
        1,
    );

    scheduler.run_tick().await;
    assert_eq!(repo.count().await.unwrap(), 1);
}

#[tokio::test]
async fn country_restricted_refresh_only_lists_chinese_upstreams() {
    let (_db, repo) = setup_store(10).await;

    let china = GeoInfo {
        country: Some("中国".to_string()),
        province: Some("广东省".to_string()),
        city: Some("深圳市".to_string()),
    };
    let abroad = GeoInfo {
        country: Some("美国".to_string()),
        ..Default::default()
    };

    for i in 1..=3u16 {
        repo.insert(&format!("10.3.1.{}", i), 8080, "http", &china)
            .await
            .unwrap();
    }
    for i in 1..=7u16 {
        repo.insert(&format!("10.3.2.{}", i), 8080, "http", &abroad)
            .await
            .unwrap();
    }

    let (rotator, _topup_rx) = Rotator::new(SelectionMode::Priority, true, 10);
    let scheduler = build_scheduler(
        repo.clone(),
        Arc::new(AlwaysUp),
        Vec::new(),
        rotator.clone(),
        0,
    );

    scheduler.run_tick().await;

    assert_eq!(rotator.len(), 3);
    for _ in 0..6 {
        let url = rotator.next().unwrap();
        assert!(url.starts_with("http://10.3.1."), "unexpected url {url}");
    }

    let (china_count, other_count) = repo.country_stats().await.unwrap();
    assert_eq!((china_count, other_count), (3, 7));
}
