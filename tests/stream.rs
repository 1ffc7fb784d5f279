use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use cdcrelay::cdcrelay::handler::EventHandler;
use cdcrelay::cdcrelay::hub::StreamHub;
use cdcrelay::cdcrelay::lifecycle::LifecycleManager;
use cdcrelay::cdcrelay::net::server::run_stream_server;
use cdcrelay::cdcrelay::record::ChangeRecord;
use cdcrelay::cdcrelay::router::{ChannelRouter, RouteConfig, RouteTable, RoutingStrategy};
use cdcrelay::cdcrelay::store::{MemorySetStore, SetStore};
use cdcrelay::client;
use cdcrelay::client::backoff::{delay_for, Backoff};
use cdcrelay::client::config::ClientConfig;
use cdcrelay::client::protocol::SurfaceMessage;

const WAIT: Duration = Duration::from_secs(5);

fn handler(hub: Arc<StreamHub>) -> EventHandler {
    let store = Arc::new(MemorySetStore::new());
    store.add_member("finance:AAPL", "u1").unwrap();
    let routes = RouteTable::from_config(
        &[RouteConfig {
            table: "trades".to_string(),
            strategy: RoutingStrategy::Precomputed {
                field: "symbol".to_string(),
                namespace: "finance".to_string(),
            },
        }],
        &["trades".to_string()],
    )
    .unwrap();
    EventHandler::new(
        ChannelRouter::new(routes, store.clone()),
        Arc::new(LifecycleManager::new(store)),
        hub,
    )
}

fn client_config(addr: String) -> ClientConfig {
    let mut config = ClientConfig::new(addr, "u1");
    config.base_delay_ms = 20;
    config.max_delay_ms = 200;
    config.natural_keys.insert("trades".to_string(), "symbol".to_string());
    config
}

async fn wait_online(hub: &StreamHub, user: &str) {
    timeout(WAIT, async {
        while !hub.is_online(user) {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("stream session never opened");
}

#[tokio::test]
async fn change_reaches_subscribed_surface_over_the_stream() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hub = Arc::new(StreamHub::new(16));
    let shutdown = CancellationToken::new();
    let server = tokio::spawn(run_stream_server(listener, hub.clone(), Duration::from_secs(5), shutdown.clone()));
    let handler = handler(hub.clone());

    let installation = client::start(client_config(addr.to_string()));
    let mut surface = installation.connect_surface().unwrap();
    surface.subscribe(["trades"]).unwrap();
    wait_online(&hub, "u1").await;

    let record = ChangeRecord::from_value(json!({
        "action": "insert",
        "table_name": "trades",
        "record": {"symbol": "AAPL", "price": 189.5}
    }))
    .unwrap();
    let report = handler.ingest(vec![record]);
    assert_eq!(report.delivered, 1);

    let batch = timeout(WAIT, async {
        loop {
            match surface.recv().await {
                Some(SurfaceMessage::CdcBatch { table, records }) => return (table, records),
                Some(_) => continue,
                None => panic!("router stopped"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(batch.0, "trades");
    assert_eq!(batch.1[0].field_str("symbol"), Some("AAPL"));

    drop(surface);
    installation.shutdown().await;
    shutdown.cancel();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn wake_cuts_a_long_backoff_short() {
    // Reserve a port with nothing listening on it yet
    let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = reserved.local_addr().unwrap();
    drop(reserved);

    let mut config = client_config(addr.to_string());
    config.base_delay_ms = 60_000;
    config.max_delay_ms = 600_000;
    let installation = client::start(config);
    sleep(Duration::from_millis(100)).await;

    let listener = TcpListener::bind(addr).await.unwrap();
    let hub = Arc::new(StreamHub::new(16));
    let shutdown = CancellationToken::new();
    let server = tokio::spawn(run_stream_server(listener, hub.clone(), Duration::from_secs(5), shutdown.clone()));

    installation.wake();
    wait_online(&hub, "u1").await;

    installation.shutdown().await;
    shutdown.cancel();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn silent_server_times_out_and_retries() {
    // Accepts connections but never answers StreamOpen
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();
    let acceptor = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            held.push(socket);
        }
    });

    let mut config = client_config(addr.to_string());
    config.connect_timeout_ms = 100;
    config.base_delay_ms = 10;
    config.max_delay_ms = 50;
    let installation = client::start(config);

    timeout(WAIT, async {
        while accepted.load(Ordering::SeqCst) < 3 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("client stopped retrying after handshake timeouts");

    installation.shutdown().await;
    acceptor.abort();
}

#[test]
fn consecutive_failures_double_the_wait() {
    let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(10));
    let waits: Vec<u64> = (0..6).map(|_| backoff.record_failure().as_millis() as u64).collect();
    assert_eq!(waits, vec![1_000, 2_000, 4_000, 8_000, 10_000, 10_000]);
}

proptest! {
    #[test]
    fn wait_after_k_failures_matches_formula(
        base_ms in 1u64..5_000,
        max_ms in 1u64..600_000,
        k in 0u32..80,
    ) {
        let mut backoff = Backoff::new(Duration::from_millis(base_ms), Duration::from_millis(max_ms));
        for _ in 0..k {
            backoff.record_failure();
        }
        let expected = (u128::from(base_ms) << k.min(64)).min(u128::from(max_ms));
        prop_assert_eq!(backoff.delay().as_millis(), expected);
        prop_assert_eq!(
            backoff.delay(),
            delay_for(Duration::from_millis(base_ms), Duration::from_millis(max_ms), k)
        );
    }
}
