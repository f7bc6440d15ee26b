//! Drives a real server over TCP.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use keylock_client::Connection;
use keylock_common::{Error, KeyId, Result, SensitiveBytes};
use keylock_crypto::KdfParams;
use keylock_proto::{
    ErrorKind, Metadata, MessageStream, Request, RequestFrame, Response, ResponseFrame,
    DEFAULT_MAX_FRAME_LEN,
};
use keylock_server::{Dumper, Server, ServerConfig, UNAUTHENTICATED_MAX_FRAME_LEN};
use keylock_vault::KeyVault;

const PASSWORD: &str = "helloworld";

fn fast() -> KdfParams {
    KdfParams {
        memory_cost: 1024,
        time_cost: 1,
        parallelism: 1,
    }
}

fn config(dir: &Path) -> ServerConfig {
    ServerConfig::new("127.0.0.1:0", PASSWORD, dir.join("vault.dump"), "dump-secret")
}

struct Running {
    addr: SocketAddr,
    stop: oneshot::Sender<()>,
    task: JoinHandle<Result<()>>,
}

impl Running {
    async fn shutdown(self) -> Result<()> {
        let _ = self.stop.send(());
        self.task.await.unwrap()
    }
}

/// Restore from the configured dump (if any) and start serving.
async fn start(config: ServerConfig) -> Running {
    let dumper = Arc::new(Dumper::new(
        config.dump_path.clone(),
        config.dump_password.clone(),
        fast(),
    ));
    let snapshot = dumper.restore().await.unwrap();
    let vault = Arc::new(KeyVault::open(config.password.as_bytes(), fast(), snapshot).unwrap());

    let server = Server::bind(&config, vault, dumper).await.unwrap();
    let addr = server.local_addr().unwrap();
    let (stop, stopped) = oneshot::channel::<()>();
    let task = tokio::spawn(server.run_until(async move {
        let _ = stopped.await;
    }));
    Running { addr, stop, task }
}

async fn raw(addr: SocketAddr) -> MessageStream<TcpStream> {
    MessageStream::new(TcpStream::connect(addr).await.unwrap(), DEFAULT_MAX_FRAME_LEN)
}

async fn roundtrip(stream: &mut MessageStream<TcpStream>, id: u64, request: Request) -> ResponseFrame {
    stream.send(&RequestFrame { id, request }).await.unwrap();
    stream.recv().await.unwrap().unwrap()
}

fn auth(password: &str) -> Request {
    Request::Auth {
        password: password.to_string(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_full_lifecycle_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let key: Vec<u8> = (0u8..16).collect();

    let running = start(config(dir.path())).await;

    // A wrong password is answered with AuthFailure and the connection is dropped.
    let mut stream = raw(running.addr).await;
    let reply = roundtrip(&mut stream, 1, auth("wrongpass")).await;
    assert!(matches!(
        reply.response,
        Response::Error { kind: ErrorKind::AuthFailure, .. }
    ));
    assert!(matches!(stream.recv::<ResponseFrame>().await, Ok(None) | Err(_)));

    assert!(matches!(
        Connection::connect(running.addr, "wrongpass").await,
        Err(Error::AuthFailure)
    ));

    let mut conn = Connection::connect(running.addr, PASSWORD).await.unwrap();
    assert!(!conn.put("k1", &key, Metadata::new()).await.unwrap());
    assert_eq!(conn.get("k1").await.unwrap().as_slice(), key.as_slice());
    assert_eq!(conn.dump().await.unwrap(), 1);
    conn.close().await.unwrap();

    running.shutdown().await.unwrap();

    let running = start(config(dir.path())).await;
    let mut conn = Connection::connect(running.addr, PASSWORD).await.unwrap();
    assert_eq!(conn.get("k1").await.unwrap().as_slice(), key.as_slice());
    assert_eq!(conn.count().await.unwrap(), 1);
    conn.close().await.unwrap();
    running.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_requests_before_auth_are_unauthorized() {
    let dir = tempfile::tempdir().unwrap();
    let running = start(config(dir.path())).await;
    let mut stream = raw(running.addr).await;

    let put = Request::Put {
        id: KeyId::new("k").unwrap(),
        key: vec![1, 2, 3],
        metadata: Metadata::new(),
    };
    for (id, request) in [(1, put), (2, Request::Ping), (3, Request::List)] {
        let reply = roundtrip(&mut stream, id, request).await;
        assert_eq!(reply.id, id);
        assert!(matches!(
            reply.response,
            Response::Error { kind: ErrorKind::Unauthorized, .. }
        ));
    }

    // The connection is still open and the vault untouched.
    let reply = roundtrip(&mut stream, 4, auth(PASSWORD)).await;
    assert!(matches!(reply.response, Response::Authenticated { .. }));
    let reply = roundtrip(&mut stream, 5, Request::Count).await;
    assert!(matches!(reply.response, Response::Count { count: 0 }));

    running.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_second_auth_keeps_session() {
    let dir = tempfile::tempdir().unwrap();
    let running = start(config(dir.path())).await;
    let mut stream = raw(running.addr).await;

    roundtrip(&mut stream, 1, auth(PASSWORD)).await;
    let reply = roundtrip(&mut stream, 2, auth(PASSWORD)).await;
    assert!(matches!(
        reply.response,
        Response::Error { kind: ErrorKind::InvalidRequest, .. }
    ));
    let reply = roundtrip(&mut stream, 3, Request::Ping).await;
    assert!(matches!(reply.response, Response::Pong));

    running.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_malformed_json_gets_error_with_id_zero() {
    let dir = tempfile::tempdir().unwrap();
    let running = start(config(dir.path())).await;

    let mut socket = TcpStream::connect(running.addr).await.unwrap();
    let garbage = b"{not json";
    socket.write_all(&(garbage.len() as u32).to_be_bytes()).await.unwrap();
    socket.write_all(garbage).await.unwrap();

    let mut stream = MessageStream::new(socket, DEFAULT_MAX_FRAME_LEN);
    let reply: ResponseFrame = stream.recv().await.unwrap().unwrap();
    assert_eq!(reply.id, 0);
    assert!(matches!(
        reply.response,
        Response::Error { kind: ErrorKind::InvalidRequest, .. }
    ));

    let reply = roundtrip(&mut stream, 1, auth(PASSWORD)).await;
    assert!(matches!(reply.response, Response::Authenticated { .. }));

    running.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_puts_leave_one_value() {
    let dir = tempfile::tempdir().unwrap();
    let running = start(config(dir.path())).await;
    let a = vec![0xAAu8; 1024];
    let b = vec![0xBBu8; 1024];

    for _ in 0..10 {
        let (addr, ka, kb) = (running.addr, a.clone(), b.clone());
        let first = tokio::spawn(async move {
            let mut conn = Connection::connect(addr, PASSWORD).await.unwrap();
            conn.put("race", &ka, Metadata::new()).await.unwrap();
        });
        let second = tokio::spawn(async move {
            let mut conn = Connection::connect(addr, PASSWORD).await.unwrap();
            conn.put("race", &kb, Metadata::new()).await.unwrap();
        });
        first.await.unwrap();
        second.await.unwrap();

        let mut conn = Connection::connect(running.addr, PASSWORD).await.unwrap();
        let value = conn.get("race").await.unwrap();
        assert!(value.as_slice() == a.as_slice() || value.as_slice() == b.as_slice());
    }

    running.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_all_verbs() {
    let dir = tempfile::tempdir().unwrap();
    let running = start(config(dir.path())).await;
    let mut conn = Connection::connect(running.addr, PASSWORD).await.unwrap();
    let labels = Metadata::from([("alg".to_string(), "aes-256".to_string())]);

    conn.ping().await.unwrap();
    conn.put("b", b"bravo", Metadata::new()).await.unwrap();
    conn.put("a", b"alpha", labels.clone()).await.unwrap();
    assert!(conn.put("a", b"alpha-2", labels.clone()).await.unwrap());

    let keys = conn.list().await.unwrap();
    assert_eq!(keys.len(), 2);
    assert_eq!(keys[0].id.as_str(), "a");
    assert_eq!(keys[0].metadata, labels);

    assert!(conn.exists("b").await.unwrap());
    assert!(conn.delete("b").await.unwrap());
    assert!(!conn.delete("b").await.unwrap());
    assert!(!conn.exists("b").await.unwrap());
    assert!(matches!(conn.get("b").await, Err(Error::NotFound(_))));

    assert_eq!(conn.clear().await.unwrap(), 1);
    assert_eq!(conn.count().await.unwrap(), 0);

    conn.close().await.unwrap();
    running.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_oversized_frame_closes_connection() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.max_frame_len = 1024;
    let running = start(config).await;

    let mut conn = Connection::connect(running.addr, PASSWORD).await.unwrap();
    let result = conn.put("big", &[7u8; 4096], Metadata::new()).await;
    assert!(matches!(result, Err(Error::Io(_))));

    // Other connections are unaffected.
    let mut conn = Connection::connect(running.addr, PASSWORD).await.unwrap();
    assert_eq!(conn.count().await.unwrap(), 0);

    running.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_large_frames_only_after_auth() {
    let dir = tempfile::tempdir().unwrap();
    let running = start(config(dir.path())).await;

    // Announce a frame just over the pre-auth limit; the server hangs up
    // without buffering it.
    let mut socket = TcpStream::connect(running.addr).await.unwrap();
    let announced = (UNAUTHENTICATED_MAX_FRAME_LEN + 1) as u32;
    socket.write_all(&announced.to_be_bytes()).await.unwrap();
    let mut stream = MessageStream::new(socket, DEFAULT_MAX_FRAME_LEN);
    let closed = tokio::time::timeout(Duration::from_secs(10), stream.recv::<ResponseFrame>())
        .await
        .expect("server should close the connection");
    assert!(matches!(closed, Ok(None) | Err(_)));

    // Once authenticated, the configured limit applies.
    let key = vec![0x42u8; UNAUTHENTICATED_MAX_FRAME_LEN * 2];
    let mut conn = Connection::connect(running.addr, PASSWORD).await.unwrap();
    conn.put("big", &key, Metadata::new()).await.unwrap();
    assert_eq!(conn.get("big").await.unwrap().as_slice(), key.as_slice());

    running.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_idle_connection_is_closed() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.idle_timeout_secs = Some(1);
    let running = start(config).await;

    let mut stream = raw(running.addr).await;
    let closed = tokio::time::timeout(Duration::from_secs(10), stream.recv::<ResponseFrame>())
        .await
        .expect("server should close the idle connection");
    assert!(matches!(closed, Ok(None) | Err(_)));

    running.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_writes_final_dump() {
    let dir = tempfile::tempdir().unwrap();
    let running = start(config(dir.path())).await;

    let mut conn = Connection::connect(running.addr, PASSWORD).await.unwrap();
    conn.put("k", b"kept", Metadata::new()).await.unwrap();
    // Leave the connection open; shutdown must still complete.
    running.shutdown().await.unwrap();

    assert!(dir.path().join("vault.dump").exists());
    let running = start(config(dir.path())).await;
    let mut conn = Connection::connect(running.addr, PASSWORD).await.unwrap();
    assert_eq!(conn.get("k").await.unwrap().as_slice(), b"kept");
    running.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_restart_with_wrong_dump_password_fails_closed() {
    let dir = tempfile::tempdir().unwrap();
    let running = start(config(dir.path())).await;
    running.shutdown().await.unwrap();

    let dumper = Dumper::new(
        dir.path().join("vault.dump"),
        SensitiveBytes::from("not-the-dump-secret".to_string()),
        fast(),
    );
    assert!(matches!(dumper.restore().await, Err(Error::AuthFailure)));
}
