//! End-to-end runs against a fake cluster node on a loopback socket.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use dxcluster_backend::config::BackendConfig;
use dxcluster_backend::error::{ClusterError, EnrichmentError, ServiceError};
use dxcluster_backend::module::enrichment::LookupClient;
use dxcluster_backend::service::DxClusterService;
use dxcluster_common::{Band, ConnectionState, EnrichmentResult};

enum NodeCommand {
    Line(String),
    Drop,
}

/// Prompts for a login on every connection, records what the client writes
/// and sends whatever the test tells it to.
struct FakeNode {
    port: u16,
    commands: mpsc::UnboundedSender<NodeCommand>,
    received: Arc<Mutex<Vec<String>>>,
}

impl FakeNode {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (commands, mut rx) = mpsc::unbounded_channel();
        let received = Arc::new(Mutex::new(Vec::new()));

        let log = received.clone();
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                let (read, mut write) = socket.into_split();

                let log = log.clone();
                let mut reader = tokio::spawn(async move {
                    let mut lines = BufReader::new(read).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        log.lock().unwrap().push(line.trim().to_string());
                    }
                });

                if write.write_all(b"Welcome to the test node\r\nlogin: ").await.is_err() {
                    continue;
                }
                // Serve until the test drops us or the client hangs up
                loop {
                    tokio::select! {
                        _ = &mut reader => break,
                        command = rx.recv() => match command {
                            Some(NodeCommand::Line(line)) => {
                                if write.write_all(format!("{}\r\n", line).as_bytes()).await.is_err() {
                                    break;
                                }
                            }
                            Some(NodeCommand::Drop) => break,
                            None => return,
                        },
                    }
                }
            }
        });

        Self { port, commands, received }
    }

    fn send(&self, line: &str) {
        self.commands.send(NodeCommand::Line(line.to_string())).unwrap();
    }

    fn drop_connection(&self) {
        self.commands.send(NodeCommand::Drop).unwrap();
    }

    fn received_count(&self, line: &str) -> usize {
        self.received.lock().unwrap().iter().filter(|l| *l == line).count()
    }

    async fn wait_for_received(&self, line: &str, times: usize) {
        eventually(|| async move { self.received_count(line) >= times }).await;
    }
}

#[derive(Default)]
struct CountingLookup {
    calls: Mutex<HashMap<String, usize>>,
}

impl CountingLookup {
    fn calls_for(&self, callsign: &str) -> usize {
        self.calls.lock().unwrap().get(callsign).copied().unwrap_or(0)
    }
}

#[async_trait]
impl LookupClient for CountingLookup {
    async fn lookup(&self, callsign: &str) -> Result<EnrichmentResult, EnrichmentError> {
        *self.calls.lock().unwrap().entry(callsign.to_string()).or_default() += 1;
        tokio::time::sleep(Duration::from_millis(20)).await;
        if callsign == "JA1ABC" {
            return Err(EnrichmentError::Status(500));
        }
        Ok(EnrichmentResult {
            entity: Some("Federal Republic Of Germany".to_string()),
            dxcc_id: Some("230".to_string()),
            continent: Some("EU".to_string()),
            flag: None,
            cq_zone: Some(14),
            lotw_user: Some(true),
            latitude: None,
            longitude: None,
            resolved_at: Utc::now(),
        })
    }
}

fn config(port: u16) -> BackendConfig {
    let mut config = BackendConfig::default();
    config.cluster.host = "127.0.0.1".to_string();
    config.cluster.port = port;
    config.cluster.callsign = "CS8ABG".to_string();
    config.cluster.login_timeout_secs = 5;
    config.cluster.login_grace_secs = 1;
    config.cluster.initial_commands = vec!["sh/dx/5".to_string()];
    config.backoff.min_delay_ms = 50;
    config.backoff.max_delay_ms = 200;
    config.cache.max_size = 10;
    config
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition met in time");
}

async fn wait_for_state(service: &DxClusterService, state: ConnectionState) {
    let mut rx = service.subscribe_state();
    tokio::time::timeout(Duration::from_secs(10), rx.wait_for(|s| *s == state))
        .await
        .expect("state reached in time")
        .unwrap();
}

#[tokio::test]
async fn test_ingest_enrich_and_recover() {
    let node = FakeNode::start().await;
    let lookups = Arc::new(CountingLookup::default());
    let client: Arc<dyn LookupClient> = lookups.clone();
    let service = DxClusterService::with_lookup_client(&config(node.port), Some(client));
    let service = &service;

    service.start();
    wait_for_state(service, ConnectionState::Connected).await;
    node.wait_for_received("CS8ABG", 1).await;
    node.wait_for_received("sh/dx/5", 1).await;

    node.send("DX de K1ABC:     14074.0  DL1XYZ       FT8 -12 dB             1234Z");
    node.send("10125.0  JA1ABC      19-Oct-2026 1230Z  CW 599                   <W3LPL>");
    node.send("not a spot at all");
    eventually(|| async move { service.stats().await.total_parse_failures == 1 }).await;

    let stats = service.stats().await;
    assert!(stats.connected);
    assert_eq!(stats.total_spots_received, 2);
    assert_eq!(stats.cache_size, 2);
    assert_eq!(service.spots_by_band(Band::M20).await.len(), 1);
    assert_eq!(service.spots_by_band(Band::M30).await.len(), 1);
    assert!(service.spots_by_band(Band::M40).await.is_empty());

    // DL1XYZ resolves; JA1ABC fails and stays unenriched
    eventually(|| async move {
        service
            .latest_spot(14074.0)
            .await
            .is_some_and(|spot| spot.enrichment.is_some())
    })
    .await;
    eventually(|| async move { service.stats().await.enrichment_failures == 1 }).await;
    assert!(service.latest_spot(10125.0).await.unwrap().enrichment.is_none());

    // Second DL1XYZ spot is enriched from cache without another lookup
    node.send("DX de W1AW: 14075.0 DL1XYZ CW 1240Z");
    eventually(|| async move { service.stats().await.total_spots_received == 3 }).await;
    assert!(service.latest_spot(14075.0).await.unwrap().enrichment.is_some());
    assert_eq!(lookups.calls_for("DL1XYZ"), 1);

    service.send_raw_command("sh/wwv").await.unwrap();
    service.send_spot("14074", "DL1XYZ", "tnx FT8").await.unwrap();
    node.wait_for_received("sh/wwv", 1).await;
    node.wait_for_received("dx 14074 DL1XYZ tnx FT8", 1).await;

    // Node drops us: Reconnecting, then back to Connected on its own
    node.drop_connection();
    wait_for_state(service, ConnectionState::Reconnecting).await;
    wait_for_state(service, ConnectionState::Connected).await;
    node.wait_for_received("CS8ABG", 2).await;
    assert_eq!(service.stats().await.reconnect_count, 1);

    // Cache survives the reconnect
    assert_eq!(service.all_spots().await.len(), 3);

    // Administrative restart goes through Reconnecting as well
    service.restart();
    wait_for_state(service, ConnectionState::Reconnecting).await;
    wait_for_state(service, ConnectionState::Connected).await;
    node.wait_for_received("CS8ABG", 3).await;
    assert_eq!(service.stats().await.reconnect_count, 2);

    service.shutdown().await;
    assert_eq!(service.connection_state(), ConnectionState::Disconnected);
    assert!(matches!(
        service.send_raw_command("sh/dx").await,
        Err(ServiceError::Cluster(ClusterError::NotConnected))
    ));
}

#[tokio::test]
async fn test_synthetic_spots_without_a_node() {
    // Nothing listens on this port
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let service = DxClusterService::with_lookup_client(&config(port), None);
    let service = &service;
    service.start();

    let spot = service.submit_synthetic("7074", "EA8XYZ", "FT8 -05").await.unwrap();
    assert_eq!(service.all_spots().await, vec![spot.clone()]);
    assert_eq!(service.spots_by_band(Band::M40).await, vec![spot]);

    eventually(|| async move { service.stats().await.reconnect_count >= 1 }).await;
    assert!(!service.stats().await.connected);
    assert!(matches!(
        service.send_raw_command("sh/dx").await,
        Err(ServiceError::Cluster(ClusterError::NotConnected))
    ));
    assert_eq!(service.stats().await.synthetic_spots, 1);

    service.shutdown().await;
}
