//! The HTTP replica over real sockets, against a minimal local server.

use docsync_core::{Document, Revision};
use docsync_sync_engine::{
    HttpConnector, RemoteConfig, Replica, ReplicaConnector, ReqwestClient, SyncError,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

#[derive(Debug, Clone)]
struct Received {
    method: String,
    path: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Received {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

type Log = Arc<Mutex<Vec<Received>>>;

/// Answers the replica routes of a `notes` database.
fn couch(request: &Received) -> (u16, Value) {
    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/notes") => (
            200,
            json!({"instance_id": "srv-1", "update_seq": 2, "doc_count": 1}),
        ),
        ("GET", path) if path.starts_with("/notes/_changes?") => {
            let doc = Document::new("n1", "note", json!("remote"))
                .at_revision(Revision::from("1-a"));
            let change = json!({"seq": 2, "id": "n1", "changes": [{"rev": "1-a"}], "doc": doc});
            (200, json!({"results": [change], "last_seq": 2, "pending": 0}))
        }
        ("GET", "/notes/missing") => (404, json!({"error": "not_found", "reason": "missing"})),
        ("GET", "/notes/locked") => (
            401,
            json!({"error": "unauthorized", "reason": "session expired"}),
        ),
        ("GET", "/notes/busy") => (503, json!({"error": "unavailable"})),
        ("PUT", "/notes/taken") => (409, json!({"error": "conflict"})),
        ("PUT", "/notes/n2") => (201, json!({"ok": true, "id": "n2", "rev": "2-b"})),
        _ => (400, json!({"error": "bad_request"})),
    }
}

async fn serve() -> (SocketAddr, Log) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let log: Log = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&log);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let sink = Arc::clone(&sink);
            tokio::spawn(async move {
                let _ = answer(stream, &sink).await;
            });
        }
    });
    (addr, log)
}

async fn answer(stream: TcpStream, log: &Log) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream);

    let mut line = String::new();
    reader.read_line(&mut line).await?;
    let mut parts = line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();

    let mut headers = Vec::new();
    loop {
        let mut header = String::new();
        reader.read_line(&mut header).await?;
        let header = header.trim_end();
        if header.is_empty() {
            break;
        }
        if let Some((name, value)) = header.split_once(':') {
            headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
        }
    }

    let length = headers
        .iter()
        .find(|(n, _)| n == "content-length")
        .and_then(|(_, v)| v.parse().ok())
        .unwrap_or(0);
    let mut body = vec![0; length];
    reader.read_exact(&mut body).await?;

    let received = Received {
        method,
        path,
        headers,
        body,
    };
    let (status, reply) = couch(&received);
    log.lock().push(received);

    let reply = reply.to_string();
    let head = format!(
        "HTTP/1.1 {status} Status\r\nContent-Type: application/json\r\n\
         Content-Length: {}\r\nConnection: close\r\n\r\n",
        reply.len()
    );
    let mut stream = reader.into_inner();
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(reply.as_bytes()).await?;
    stream.shutdown().await
}

fn config(addr: SocketAddr) -> RemoteConfig {
    RemoteConfig::new(&format!("http://{addr}"), "notes")
        .unwrap()
        .with_credentials("alice", "secret")
}

fn connector() -> HttpConnector<ReqwestClient> {
    HttpConnector::new(ReqwestClient::new().unwrap())
}

#[tokio::test]
async fn requests_carry_basic_auth_over_the_wire() {
    let (addr, log) = serve().await;

    let replica = connector().connect(&config(addr)).await.unwrap();
    let info = replica.info().await.unwrap();

    assert_eq!(info.id, "srv-1");
    assert_eq!(info.update_seq, 2);
    let log = log.lock();
    assert!(log.len() >= 2);
    for request in log.iter() {
        assert_eq!(request.path, "/notes");
        assert_eq!(request.header("authorization"), Some("Basic YWxpY2U6c2VjcmV0"));
        assert_eq!(request.header("accept"), Some("application/json"));
    }
}

#[tokio::test]
async fn change_pages_and_writes_round_the_server() {
    let (addr, log) = serve().await;
    let replica = connector().connect(&config(addr)).await.unwrap();

    let page = replica.changes(0, 10).await.unwrap();
    assert_eq!(page.results.len(), 1);
    assert_eq!(page.results[0].id, "n1");
    assert_eq!(page.results[0].document.as_ref().unwrap().content, json!("remote"));
    assert_eq!(page.last_seq, 2);
    assert!(!page.pending);

    let rev = replica
        .put(Document::new("n2", "note", json!({"title": "sent"})))
        .await
        .unwrap();
    assert_eq!(rev, Revision::from("2-b"));

    let log = log.lock();
    let changes = log.iter().find(|r| r.path.starts_with("/notes/_changes")).unwrap();
    assert_eq!(changes.path, "/notes/_changes?since=0&limit=10&include_docs=true");
    let put = log.iter().find(|r| r.method == "PUT").unwrap();
    assert_eq!(put.header("content-type"), Some("application/json"));
    let sent: Document = serde_json::from_slice(&put.body).unwrap();
    assert_eq!(sent.id, "n2");
    assert_eq!(sent.content["title"], "sent");
}

#[tokio::test]
async fn server_statuses_map_to_errors() {
    let (addr, _log) = serve().await;
    let replica = connector().connect(&config(addr)).await.unwrap();

    assert_eq!(replica.get("missing").await.unwrap(), None);
    assert_eq!(
        replica.get("locked").await.unwrap_err(),
        SyncError::Auth("session expired".into())
    );

    let busy = replica.get("busy").await.unwrap_err();
    assert!(matches!(busy, SyncError::Network { retryable: true, .. }));

    let conflict = replica
        .put(Document::new("taken", "note", json!(1)))
        .await
        .unwrap_err();
    assert!(conflict.is_conflict());
}

#[tokio::test]
async fn refused_connections_are_retryable() {
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };

    let Err(err) = connector().connect(&config(addr)).await else {
        panic!("connected to a closed port");
    };

    assert!(matches!(err, SyncError::Network { retryable: true, .. }));
}
