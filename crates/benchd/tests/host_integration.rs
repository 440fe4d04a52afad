//! End-to-end tests for a host process over a real Unix socket.
//!
//! Each test stands up a nameserver and a host inside the test runtime,
//! connects one or more clients, and exercises the call pipeline:
//! lifecycle instancing, the lock guard, and disconnect cleanup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;

use bench_core::{Config, ServiceFactory};
use bench_protocol::{HostRequest, HostResponse, WireErrorKind};
use benchd::host::HostProcess;
use benchd::nameserver::{NameserverProcess, NsClient};

struct Deployment {
    config: Config,
    cancel: CancellationToken,
    _dir: tempfile::TempDir,
}

impl Deployment {
    /// Starts a nameserver plus one host and waits for their sockets.
    async fn start() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let toml = format!(
            r#"
            socket_dir = "{}"
            poll_interval_ms = 100

            [[nameserver]]
            name = "ns-main"

            [[host]]
            name = "optics"
            nameservers = ["ns-main"]

            [[host.service]]
            name = "laser-1"
            implementation = "sim-instrument"
            lifecycle = "single"
            lockable = true
            params = {{ wavelength_nm = 780 }}

            [[host.service]]
            name = "stage-1"
            implementation = "echo"
            lifecycle = "session"

            [[host.service]]
            name = "camera-1"
            implementation = "echo"
            lifecycle = "per_call"
            "#,
            dir.path().display()
        );
        let config = Config::from_str(&toml).expect("config");
        let cancel = CancellationToken::new();

        let ns = NameserverProcess::new(&config, "ns-main", cancel.clone());
        tokio::spawn(async move { ns.run().await });
        wait_for_socket(&config.nameserver_socket("ns-main")).await;

        let host = HostProcess::new(
            config.clone(),
            "optics",
            ServiceFactory::with_builtins(),
            cancel.clone(),
        )
        .expect("host bootstrap");
        tokio::spawn(async move { host.run().await });
        wait_for_socket(&config.host_socket("optics")).await;

        Self {
            config,
            cancel,
            _dir: dir,
        }
    }

    async fn client(&self) -> TestClient {
        TestClient::connect(&self.config.host_socket("optics")).await
    }
}

impl Drop for Deployment {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn wait_for_socket(path: &Path) {
    for _ in 0..100 {
        if path.exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("socket {} never appeared", path.display());
}

struct TestClient {
    reader: BufReader<tokio::net::unix::OwnedReadHalf>,
    writer: BufWriter<tokio::net::unix::OwnedWriteHalf>,
}

impl TestClient {
    async fn connect(socket: &PathBuf) -> Self {
        let stream = UnixStream::connect(socket).await.expect("connect");
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
        }
    }

    async fn request(&mut self, request: &HostRequest) -> HostResponse {
        let json = serde_json::to_string(request).expect("serialize");
        self.writer.write_all(json.as_bytes()).await.expect("write");
        self.writer.write_all(b"\n").await.expect("write");
        self.writer.flush().await.expect("flush");

        let mut line = String::new();
        let bytes = self.reader.read_line(&mut line).await.expect("read");
        assert!(bytes > 0, "host closed the connection");
        serde_json::from_str(&line).expect("parse response")
    }

    async fn call(&mut self, object: &str, method: &str, args: serde_json::Value) -> HostResponse {
        self.request(&HostRequest::Call {
            object: object.to_string(),
            method: method.to_string(),
            args,
        })
        .await
    }

    /// Calls `whoami` and extracts the serving instance id.
    async fn whoami(&mut self, object: &str) -> u64 {
        match self.call(object, "whoami", json!({})).await {
            HostResponse::Result { value } => value["instance_id"]
                .as_u64()
                .expect("instance_id in whoami result"),
            other => panic!("unexpected whoami response: {other:?}"),
        }
    }

    async fn lock(&mut self, object: &str, user: &str) -> HostResponse {
        self.request(&HostRequest::Lock {
            object: object.to_string(),
            user: user.to_string(),
        })
        .await
    }

    async fn release(&mut self, object: &str) -> HostResponse {
        self.request(&HostRequest::Release {
            object: object.to_string(),
        })
        .await
    }
}

#[tokio::test]
async fn test_single_lifecycle_shared_across_connections() {
    let deployment = Deployment::start().await;
    let mut a = deployment.client().await;
    let mut b = deployment.client().await;

    let id_a = a.whoami("laser-1").await;
    let id_b = b.whoami("laser-1").await;
    assert_eq!(id_a, id_b);

    // State set through one connection is visible through the other.
    a.call("laser-1", "set", json!({"key": "power_mw", "value": 5}))
        .await;
    match b.call("laser-1", "get", json!({"key": "power_mw"})).await {
        HostResponse::Result { value } => assert_eq!(value, json!(5)),
        other => panic!("unexpected response: {other:?}"),
    }
}

#[tokio::test]
async fn test_session_lifecycle_per_connection() {
    let deployment = Deployment::start().await;
    let mut a = deployment.client().await;
    let mut b = deployment.client().await;

    let id_a1 = a.whoami("stage-1").await;
    let id_a2 = a.whoami("stage-1").await;
    let id_b = b.whoami("stage-1").await;

    assert_eq!(id_a1, id_a2);
    assert_ne!(id_a1, id_b);

    // A fresh connection gets a fresh session instance.
    drop(a);
    let mut a_again = deployment.client().await;
    let id_a3 = a_again.whoami("stage-1").await;
    assert_ne!(id_a1, id_a3);
}

#[tokio::test]
async fn test_percall_lifecycle_fresh_every_call() {
    let deployment = Deployment::start().await;
    let mut client = deployment.client().await;

    let first = client.whoami("camera-1").await;
    let second = client.whoami("camera-1").await;
    assert_ne!(first, second);
}

#[tokio::test]
async fn test_lock_guards_calls_and_release_is_owner_only() {
    let deployment = Deployment::start().await;
    let mut alice = deployment.client().await;
    let mut bob = deployment.client().await;

    assert!(matches!(
        alice.lock("laser-1", "alice").await,
        HostResponse::Locked { acquired: true }
    ));

    // Holder may call; the guard rejects everyone else and names the
    // holder in the error.
    alice.whoami("laser-1").await;
    match bob.call("laser-1", "get", json!({"key": "wavelength_nm"})).await {
        HostResponse::Error { kind, holder, .. } => {
            assert_eq!(kind, WireErrorKind::LockConflict);
            assert_eq!(holder.as_deref(), Some("alice"));
        }
        other => panic!("expected lock conflict, got {other:?}"),
    }

    // Locking again from the other connection is a no-op that does not
    // transfer ownership.
    assert!(matches!(
        bob.lock("laser-1", "bob").await,
        HostResponse::Locked { acquired: true }
    ));
    assert!(matches!(
        bob.call("laser-1", "whoami", json!({})).await,
        HostResponse::Error { .. }
    ));

    // Only the holder may release.
    match bob.release("laser-1").await {
        HostResponse::Error { kind, .. } => assert_eq!(kind, WireErrorKind::NotHolder),
        other => panic!("expected not-holder error, got {other:?}"),
    }
    assert!(matches!(
        alice.release("laser-1").await,
        HostResponse::Released
    ));

    // Unlocked again: anyone may call.
    match bob.call("laser-1", "get", json!({"key": "wavelength_nm"})).await {
        HostResponse::Result { value } => assert_eq!(value, json!(780)),
        other => panic!("unexpected response: {other:?}"),
    }
}

#[tokio::test]
async fn test_disconnect_releases_held_locks() {
    let deployment = Deployment::start().await;
    let mut alice = deployment.client().await;
    let mut bob = deployment.client().await;

    alice.lock("laser-1", "alice").await;
    match bob
        .request(&HostRequest::IsLocked {
            object: "laser-1".to_string(),
        })
        .await
    {
        HostResponse::LockStatus { locked, holder } => {
            assert!(locked);
            assert_eq!(holder.as_deref(), Some("alice"));
        }
        other => panic!("unexpected response: {other:?}"),
    }

    drop(alice);

    // The disconnect sweep is asynchronous to bob's next request.
    let mut unlocked = false;
    for _ in 0..50 {
        match bob
            .request(&HostRequest::IsLocked {
                object: "laser-1".to_string(),
            })
            .await
        {
            HostResponse::LockStatus { locked: false, .. } => {
                unlocked = true;
                break;
            }
            _ => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    }
    assert!(unlocked, "lock survived the owner's disconnect");

    assert!(matches!(
        bob.lock("laser-1", "bob").await,
        HostResponse::Locked { acquired: true }
    ));
}

#[tokio::test]
async fn test_force_release_bypasses_ownership() {
    let deployment = Deployment::start().await;
    let mut alice = deployment.client().await;
    let mut bob = deployment.client().await;

    alice.lock("laser-1", "alice").await;

    assert!(matches!(
        bob.request(&HostRequest::ForceRelease {
            object: "laser-1".to_string(),
        })
        .await,
        HostResponse::Released
    ));
    match bob.call("laser-1", "get", json!({"key": "wavelength_nm"})).await {
        HostResponse::Result { .. } => {}
        other => panic!("unexpected response: {other:?}"),
    }
}

#[tokio::test]
async fn test_lock_on_unlockable_or_unknown_object() {
    let deployment = Deployment::start().await;
    let mut client = deployment.client().await;

    match client.lock("stage-1", "alice").await {
        HostResponse::Error { kind, .. } => assert_eq!(kind, WireErrorKind::BadRequest),
        other => panic!("unexpected response: {other:?}"),
    }
    match client.lock("ghost", "alice").await {
        HostResponse::Error { kind, .. } => assert_eq!(kind, WireErrorKind::NoSuchObject),
        other => panic!("unexpected response: {other:?}"),
    }
}

#[tokio::test]
async fn test_driver_errors_reach_only_the_caller() {
    let deployment = Deployment::start().await;
    let mut client = deployment.client().await;

    match client.call("laser-1", "self-destruct", json!({})).await {
        HostResponse::Error { kind, .. } => assert_eq!(kind, WireErrorKind::NoSuchMethod),
        other => panic!("unexpected response: {other:?}"),
    }

    // The host survives and keeps serving the same connection.
    match client.call("laser-1", "get", json!({"key": "wavelength_nm"})).await {
        HostResponse::Result { value } => assert_eq!(value, json!(780)),
        other => panic!("unexpected response: {other:?}"),
    }
}

#[tokio::test]
async fn test_bindings_published_and_resolvable() {
    let deployment = Deployment::start().await;
    let ns_socket = deployment.config.nameserver_socket("ns-main");

    let mut ns = NsClient::connect(&ns_socket).await.expect("ns connect");

    // The host binds its socket before it publishes, so give the
    // registrations a moment to land.
    let mut address = None;
    for _ in 0..50 {
        if let Ok(found) = ns.lookup("laser-1").await {
            address = Some(found);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(
        address.as_deref(),
        Some(deployment.config.service_address("optics", "laser-1").as_str())
    );

    let entries = ns.list().await.expect("list");
    let names: Vec<&str> = entries.iter().map(|(n, _)| n.as_str()).collect();
    assert!(names.contains(&"laser-1"));
    assert!(names.contains(&"stage-1"));
    assert!(names.contains(&"camera-1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_waits_for_in_flight_call() {
    use bench_core::service::next_instance_id;
    use bench_core::{Service, ServiceError};
    use std::sync::Arc;

    // A driver call slow enough for the shutdown to arrive mid-call.
    struct SlowGate {
        id: u64,
    }

    impl Service for SlowGate {
        fn instance_id(&self) -> u64 {
            self.id
        }

        fn call(
            &self,
            _method: &str,
            _args: &serde_json::Value,
        ) -> Result<serde_json::Value, ServiceError> {
            std::thread::sleep(Duration::from_millis(300));
            Ok(json!("done"))
        }
    }

    let dir = tempfile::tempdir().expect("tempdir");
    let toml = format!(
        r#"
        socket_dir = "{}"

        [[host]]
        name = "optics"

        [[host.service]]
        name = "gate-1"
        implementation = "slow-gate"
        "#,
        dir.path().display()
    );
    let config = Config::from_str(&toml).expect("config");
    let cancel = CancellationToken::new();

    let mut factory = ServiceFactory::with_builtins();
    factory.register("slow-gate", |_| {
        Ok(Arc::new(SlowGate {
            id: next_instance_id(),
        }) as Arc<dyn Service>)
    });

    let host =
        HostProcess::new(config.clone(), "optics", factory, cancel.clone()).expect("host bootstrap");
    let host_task = tokio::spawn(async move { host.run().await });
    wait_for_socket(&config.host_socket("optics")).await;

    let mut client = TestClient::connect(&config.host_socket("optics")).await;

    // Send the call, then cancel the host while the driver is running.
    let request = HostRequest::Call {
        object: "gate-1".to_string(),
        method: "open".to_string(),
        args: json!({}),
    };
    let line = serde_json::to_string(&request).unwrap();
    client.writer.write_all(line.as_bytes()).await.unwrap();
    client.writer.write_all(b"\n").await.unwrap();
    client.writer.flush().await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();

    // The in-flight call completes and is answered before the host
    // tears the connection down.
    let mut response_line = String::new();
    let bytes = client
        .reader
        .read_line(&mut response_line)
        .await
        .expect("read");
    assert!(bytes > 0, "connection cut before the in-flight call finished");
    match serde_json::from_str::<HostResponse>(&response_line).expect("parse") {
        HostResponse::Result { value } => assert_eq!(value, json!("done")),
        other => panic!("unexpected response: {other:?}"),
    }

    // The host drained its handlers and finished teardown cleanly.
    host_task.await.expect("join").expect("host run");
    assert!(!config.host_socket("optics").exists());
}

#[tokio::test]
async fn test_malformed_request_answered_and_connection_survives() {
    let deployment = Deployment::start().await;
    let mut client = deployment.client().await;

    client.writer.write_all(b"not json\n").await.expect("write");
    client.writer.flush().await.expect("flush");
    let mut line = String::new();
    client.reader.read_line(&mut line).await.expect("read");
    let response: HostResponse = serde_json::from_str(&line).expect("parse");
    assert!(matches!(
        response,
        HostResponse::Error {
            kind: WireErrorKind::BadRequest,
            ..
        }
    ));

    // Still serving.
    assert!(matches!(
        client.request(&HostRequest::Ping { seq: 1 }).await,
        HostResponse::Pong { seq: 1 }
    ));
}
