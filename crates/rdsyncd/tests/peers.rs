//! Two daemons on ephemeral ports synchronizing over real HTTP.

use std::time::Duration;

use rdsync_core::config::RdsyncConfig;
use rdsync_core::{ConflictItem, Metadata, SynchronizationReport, SynchronizationType};
use rdsyncd::{build_state, router, AppState};
use reqwest::{Client, StatusCode};
use tokio::net::TcpListener;

struct Daemon {
    url: String,
    state: AppState,
}

async fn spawn_daemon(id: &str) -> Daemon {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());

    let mut config = RdsyncConfig::default();
    config.server.url = url.clone();
    config.server.server_id = Some(id.to_string());
    config.server.metrics_addr = None;
    let state = build_state(&config).await.unwrap();

    let app = router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    Daemon { url, state }
}

fn lines(count: usize, seed: u64) -> Vec<u8> {
    let mut state = seed | 1;
    let mut out = Vec::new();
    for i in 0..count {
        out.extend_from_slice(format!("{i:05} ").as_bytes());
        for _ in 0..80 {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            out.push(b'a' + (state % 26) as u8);
        }
        out.push(b'\n');
    }
    out
}

async fn upload(client: &Client, daemon: &Daemon, name: &str, content: &[u8], owner: &str) {
    let response = client
        .put(format!("{}/files/{name}", daemon.url))
        .header("owner", owner)
        .body(content.to_vec())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
}

async fn start(client: &Client, from: &Daemon, name: &str, to: &Daemon) -> SynchronizationReport {
    client
        .post(format!("{}/synchronization/start", from.url))
        .query(&[("fileName", name), ("destination", to.url.as_str())])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

async fn download(client: &Client, daemon: &Daemon, name: &str) -> reqwest::Response {
    client
        .get(format!("{}/files/{name}", daemon.url))
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn new_file_reaches_peer_with_metadata() {
    let client = Client::new();
    let a = spawn_daemon("peer-a").await;
    let b = spawn_daemon("peer-b").await;
    let content = lines(300, 7);
    upload(&client, &a, "test.bin", &content, "alice").await;

    let report = start(&client, &a, "test.bin", &b).await;

    assert!(report.is_success(), "{:?}", report.exception);
    assert_eq!(report.bytes_transferred, content.len() as u64);
    let response = download(&client, &b, "test.bin").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("owner").unwrap(), "alice");
    assert_eq!(response.headers().get("sync-source").unwrap(), "peer-a");
    assert_eq!(response.bytes().await.unwrap().as_ref(), content.as_slice());
}

#[tokio::test]
async fn edited_file_reuses_peer_blocks() {
    let client = Client::new();
    let a = spawn_daemon("peer-a").await;
    let b = spawn_daemon("peer-b").await;
    let content = lines(2000, 11);
    upload(&client, &a, "big.txt", &content, "alice").await;
    assert!(start(&client, &a, "big.txt", &b).await.is_success());

    let mut edited = b"new header line\n".to_vec();
    edited.extend_from_slice(&content);
    upload(&client, &a, "big.txt", &edited, "alice").await;
    let report = start(&client, &a, "big.txt", &b).await;

    assert!(report.is_success(), "{:?}", report.exception);
    assert_eq!(report.bytes_copied + report.bytes_transferred, edited.len() as u64);
    assert!(report.bytes_transferred < edited.len() as u64 / 4);
    let body = download(&client, &b, "big.txt").await.bytes().await.unwrap();
    assert_eq!(body.as_ref(), edited.as_slice());

    let again = start(&client, &a, "big.txt", &b).await;
    assert!(again.is_success());
    assert_eq!(again.bytes_transferred, 0);
    assert_eq!(again.bytes_copied, edited.len() as u64);
}

#[tokio::test]
async fn conflict_is_resolved_with_theirs_over_http() {
    let client = Client::new();
    let a = spawn_daemon("peer-a").await;
    let b = spawn_daemon("peer-b").await;
    upload(&client, &a, "test.txt", &lines(50, 3), "some-value").await;
    upload(&client, &b, "test.txt", b"independent copy\n", "should-be-overwritten").await;

    let report = start(&client, &a, "test.txt", &b).await;
    assert!(report.is_conflicted());

    let conflicts: Vec<ConflictItem> = client
        .get(format!("{}/synchronization/conflicts", b.url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].theirs.server_id, "peer-a");

    let resolved = client
        .post(format!("{}/synchronization/ResolveConflict", b.url))
        .query(&[
            ("fileName", "test.txt"),
            ("strategy", "theirs"),
            ("remoteServerUrl", a.url.as_str()),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(resolved.status(), StatusCode::OK);

    let report = start(&client, &a, "test.txt", &b).await;
    assert!(report.is_success(), "{:?}", report.exception);
    let response = download(&client, &b, "test.txt").await;
    assert_eq!(response.headers().get("owner").unwrap(), "some-value");
    assert_eq!(response.bytes().await.unwrap().as_ref(), lines(50, 3).as_slice());
}

#[tokio::test]
async fn rename_and_delete_reach_peer() {
    let client = Client::new();
    let a = spawn_daemon("peer-a").await;
    let b = spawn_daemon("peer-b").await;
    upload(&client, &a, "old.bin", b"payload", "alice").await;
    assert!(start(&client, &a, "old.bin", &b).await.is_success());

    let renamed = client
        .post(format!("{}/files/old.bin/rename", a.url))
        .query(&[("to", "new.bin")])
        .send()
        .await
        .unwrap();
    assert_eq!(renamed.status(), StatusCode::OK);
    let report = start(&client, &a, "old.bin", &b).await;
    assert!(report.is_success(), "{:?}", report.exception);
    assert_eq!(report.sync_type, SynchronizationType::Rename);
    assert_eq!(download(&client, &b, "old.bin").await.status(), StatusCode::NOT_FOUND);
    assert_eq!(download(&client, &b, "new.bin").await.bytes().await.unwrap().as_ref(), b"payload");

    let deleted = client
        .delete(format!("{}/files/new.bin", a.url))
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status(), StatusCode::NO_CONTENT);
    let report = start(&client, &a, "new.bin", &b).await;
    assert!(report.is_success(), "{:?}", report.exception);
    assert_eq!(report.sync_type, SynchronizationType::Delete);

    let tombstone: Metadata = client
        .get(format!("{}/synchronization/metadata", b.url))
        .query(&[("fileName", "new.bin")])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(tombstone.is_deleted());
    let listed: Vec<String> = client
        .get(format!("{}/files", b.url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(listed.is_empty());
}

#[tokio::test]
async fn destination_streams_notifications() {
    let client = Client::new();
    let a = spawn_daemon("peer-a").await;
    let b = spawn_daemon("peer-b").await;
    let mut events = client
        .get(format!("{}/notifications", b.url))
        .send()
        .await
        .unwrap();
    assert_eq!(events.status(), StatusCode::OK);

    upload(&client, &a, "test.bin", b"payload", "alice").await;
    assert!(start(&client, &a, "test.bin", &b).await.is_success());

    let mut seen = String::new();
    let read = tokio::time::timeout(Duration::from_secs(10), async {
        while !seen.contains("\"action\":\"finish\"") {
            match events.chunk().await.unwrap() {
                Some(chunk) => seen.push_str(&String::from_utf8_lossy(&chunk)),
                None => break,
            }
        }
    })
    .await;
    assert!(read.is_ok(), "no finish event in {seen}");
    let start_at = seen.find("\"action\":\"start\"").unwrap();
    let finish_at = seen.find("\"action\":\"finish\"").unwrap();
    assert!(start_at < finish_at);
    assert!(seen.contains(rdsyncd::notifications::EVENT_NAME));
    assert!(seen.contains("\"direction\":\"incoming\""));
}

#[tokio::test]
async fn reports_and_metrics_are_exposed() {
    let client = Client::new();
    let a = spawn_daemon("peer-a").await;
    let b = spawn_daemon("peer-b").await;
    upload(&client, &a, "test.bin", b"payload", "alice").await;
    assert!(start(&client, &a, "test.bin", &b).await.is_success());

    let finished: Vec<SynchronizationReport> = client
        .get(format!("{}/synchronization/finished", b.url))
        .query(&[("skip", "0"), ("take", "10")])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].file_name, "test.bin");

    let stored = client
        .get(format!("{}/config", b.url))
        .query(&[("name", "syncResult-test.bin")])
        .send()
        .await
        .unwrap();
    assert_eq!(stored.status(), StatusCode::OK);

    let metrics = client
        .get(format!("{}/metrics", a.url))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(metrics.contains("rdsync_sync_completed_total{direction=\"outgoing\"} 1"), "{metrics}");
    let metrics = client
        .get(format!("{}/metrics", b.url))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(metrics.contains("rdsync_sync_completed_total{direction=\"incoming\"} 1"), "{metrics}");

    for path in ["/healthz", "/readyz"] {
        let status = client.get(format!("{}{path}", a.url)).send().await.unwrap().status();
        assert_eq!(status, StatusCode::OK, "{path}");
    }
    assert!(a.state.engine.active().is_empty());
}

#[tokio::test]
async fn failures_come_back_as_reports_or_errors() {
    let client = Client::new();
    let a = spawn_daemon("peer-a").await;
    let b = spawn_daemon("peer-b").await;

    let report = start(&client, &a, "missing.bin", &b).await;
    assert!(!report.is_success());
    assert!(report.exception.unwrap().contains("file not found"));

    let bad_strategy = client
        .post(format!("{}/synchronization/ResolveConflict", b.url))
        .query(&[("fileName", "x"), ("strategy", "mine")])
        .send()
        .await
        .unwrap();
    assert_eq!(bad_strategy.status(), StatusCode::BAD_REQUEST);

    let not_conflicted = {
        upload(&client, &b, "plain.bin", b"x", "bob").await;
        client
            .post(format!("{}/synchronization/ResolveConflict", b.url))
            .query(&[("fileName", "plain.bin"), ("strategy", "ours")])
            .send()
            .await
            .unwrap()
    };
    assert_eq!(not_conflicted.status(), StatusCode::BAD_REQUEST);

    let push_without_identity = client
        .post(format!("{}/synchronization/UpdateMetadata", b.url))
        .header("filename", "plain.bin")
        .send()
        .await
        .unwrap();
    assert_eq!(push_without_identity.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn apply_conflict_blocks_outgoing_push() {
    let client = Client::new();
    let a = spawn_daemon("peer-a").await;
    let b = spawn_daemon("peer-b").await;
    upload(&client, &a, "test.bin", b"payload", "alice").await;

    let applied: ConflictItem = client
        .post(format!("{}/synchronization/ApplyConflict", a.url))
        .query(&[("fileName", "test.bin"), ("remoteVersion", "8"), ("remoteServerId", "guid-1")])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(applied.theirs.version, 8);

    let report = start(&client, &a, "test.bin", &b).await;
    assert!(!report.is_success());
    assert_eq!(download(&client, &b, "test.bin").await.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn dropped_push_connection_still_finishes_on_destination() {
    use bytes::Bytes;
    use rdsync_core::{ServerInfo, SynchronizationAction};
    use rdsync_sync::multipart::{
        content_type, metadata_to_headers, server_info_header, FILE_NAME_HEADER,
        SOURCE_SERVER_INFO_HEADER,
    };
    use tokio_stream::wrappers::ReceiverStream;

    let b = spawn_daemon("peer-b").await;
    let mut updates = b.state.events.subscribe();

    let source = ServerInfo {
        url: "http://peer-a.test:9090".into(),
        id: "peer-a".into(),
    };
    let metadata: Metadata = [("sync-version", "1"), ("sync-source", "peer-a")].into_iter().collect();
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(2);
    tokio::spawn(async move {
        let head = "--syncing\r\nContent-Disposition: form-data; name=\"source\"\r\n\
                    Sync-Need-Type: source\r\nSync-Offset: 0\r\nSync-Length: 4096\r\n\r\n";
        let _ = tx.send(Ok(Bytes::from(format!("{head}{}", "x".repeat(100))))).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        let _ = tx.send(Err(std::io::Error::other("connection cut"))).await;
    });

    // The body errors out partway, which aborts the request.
    let _ = Client::new()
        .post(format!("{}/synchronization/MultipartProceed", b.url))
        .headers(metadata_to_headers(&metadata).unwrap())
        .header(SOURCE_SERVER_INFO_HEADER, server_info_header(&source).unwrap())
        .header(FILE_NAME_HEADER, "cut.bin")
        .header(reqwest::header::CONTENT_TYPE, content_type())
        .body(reqwest::Body::wrap_stream(ReceiverStream::new(rx)))
        .send()
        .await;

    for expected in [SynchronizationAction::Start, SynchronizationAction::Finish] {
        let update = tokio::time::timeout(Duration::from_secs(5), updates.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(update.action, expected);
    }

    assert!(b.state.engine.metadata("cut.bin").await.unwrap().is_none());
    let stored = b.state.engine.finished(0, 10).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert!(!stored[0].is_success());
}
