//! End-to-end worker-session tests: a real axum server on an ephemeral port,
//! driven by a hand-rolled WebSocket client standing in for a worker.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use gridx::db;
use gridx::ledger::{Credits, Ledger};
use gridx::protocol::{Capabilities, Frame, JobLimits, ProgressPhase, WorkerStatus};
use gridx::registry::WorkerRegistry;
use gridx::scheduler::Scheduler;
use gridx::session::{self, SessionState};
use gridx::store::{Job, JobState, JobStore};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

struct TestCoordinator {
    url: String,
    ledger: Ledger,
    store: JobStore,
    registry: Arc<WorkerRegistry>,
    scheduler: Arc<Scheduler>,
    _shutdown: CancellationToken,
}

async fn start_coordinator() -> TestCoordinator {
    let pool = db::connect_memory().await.unwrap();
    let ledger = Ledger::new(pool.clone(), 100.0);
    let store = JobStore::new(pool.clone());
    let registry = Arc::new(WorkerRegistry::new());
    let (scheduler, signal_rx) = Scheduler::new(
        store.clone(),
        ledger.clone(),
        Arc::clone(&registry),
        0.8,
        3,
        Duration::from_secs(1),
        64 * 1024,
    );
    let shutdown = CancellationToken::new();
    tokio::spawn(Arc::clone(&scheduler).run(signal_rx, shutdown.clone()));

    let router = session::router(SessionState {
        registry: Arc::clone(&registry),
        scheduler: Arc::clone(&scheduler),
        ledger: ledger.clone(),
        pool,
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    TestCoordinator {
        url: format!("ws://{addr}/ws/worker"),
        ledger,
        store,
        registry,
        scheduler,
        _shutdown: shutdown,
    }
}

async fn connect(url: &str) -> (WsSink, WsStream) {
    let (ws, _) = connect_async(url).await.unwrap();
    ws.split()
}

async fn send_frame(sink: &mut WsSink, frame: Frame) {
    sink.send(Message::Text(frame.to_text().unwrap().into()))
        .await
        .unwrap();
}

async fn recv_frame(stream: &mut WsStream) -> Frame {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("transport error");
        match message {
            Message::Text(text) => return Frame::from_text(text.as_str()).unwrap(),
            Message::Close(_) => panic!("connection closed while expecting a frame"),
            _ => continue,
        }
    }
}

async fn authenticate(url: &str, account: &str, secret: &str) -> (WsSink, WsStream, Uuid) {
    let (mut sink, mut stream) = connect(url).await;
    send_frame(
        &mut sink,
        Frame::Auth {
            account_id: account.to_string(),
            secret: secret.to_string(),
            capabilities: Capabilities {
                cpu_cores: 4,
                memory_mb: 4096,
                accelerators: 0,
                concurrency: 1,
            },
            worker_id: None,
        },
    )
    .await;
    match recv_frame(&mut stream).await {
        Frame::AuthOk { worker_id } => (sink, stream, worker_id),
        other => panic!("expected auth_ok, got {other:?}"),
    }
}

#[tokio::test]
async fn auth_creates_account_and_registers_idle_session() {
    let coordinator = start_coordinator().await;
    let (_sink, _stream, worker_id) = authenticate(&coordinator.url, "bob", "hunter2").await;

    let snapshot = coordinator.registry.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].id, worker_id);
    assert_eq!(snapshot[0].owner, "bob");
    assert_eq!(snapshot[0].status, WorkerStatus::Idle);

    // First authenticated contact created the account with the starting
    // balance.
    assert_eq!(
        coordinator.ledger.balance("bob").await.unwrap().unwrap(),
        Credits::from_f64(100.0)
    );
}

#[tokio::test]
async fn wrong_secret_is_rejected() {
    let coordinator = start_coordinator().await;
    // Install the secret on first contact.
    let _session = authenticate(&coordinator.url, "bob", "hunter2").await;

    let (mut sink, mut stream) = connect(&coordinator.url).await;
    send_frame(
        &mut sink,
        Frame::Auth {
            account_id: "bob".to_string(),
            secret: "wrong".to_string(),
            capabilities: Capabilities::default(),
            worker_id: None,
        },
    )
    .await;
    match recv_frame(&mut stream).await {
        Frame::AuthFail { .. } => {}
        other => panic!("expected auth_fail, got {other:?}"),
    }
}

#[tokio::test]
async fn first_frame_other_than_auth_closes_the_connection() {
    let coordinator = start_coordinator().await;
    let (mut sink, mut stream) = connect(&coordinator.url).await;
    send_frame(
        &mut sink,
        Frame::Heartbeat {
            timestamp: chrono::Utc::now(),
            status: WorkerStatus::Idle,
        },
    )
    .await;

    // The coordinator hangs up without answering.
    let end = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match stream.next().await {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(_)) => break,
            }
        }
    })
    .await;
    assert!(end.is_ok(), "connection was not closed");
    assert!(coordinator.registry.is_empty());
}

#[tokio::test]
async fn reconnect_with_same_worker_id_resumes_identity() {
    let coordinator = start_coordinator().await;
    let (sink, stream, worker_id) = authenticate(&coordinator.url, "bob", "hunter2").await;
    drop(sink);
    drop(stream);

    // Give the close a moment to land; the session goes offline, not away.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        coordinator.registry.get(worker_id).unwrap().status,
        WorkerStatus::Offline
    );

    let (mut sink, mut stream) = connect(&coordinator.url).await;
    send_frame(
        &mut sink,
        Frame::Auth {
            account_id: "bob".to_string(),
            secret: "hunter2".to_string(),
            capabilities: Capabilities::default(),
            worker_id: Some(worker_id),
        },
    )
    .await;
    match recv_frame(&mut stream).await {
        Frame::AuthOk { worker_id: resumed } => assert_eq!(resumed, worker_id),
        other => panic!("expected auth_ok, got {other:?}"),
    }
    // Still a single session entry.
    assert_eq!(coordinator.registry.snapshot().len(), 1);
}

#[tokio::test]
async fn happy_path_job_flow_settles_credits() {
    let coordinator = start_coordinator().await;
    let (mut sink, mut stream, worker_id) = authenticate(&coordinator.url, "bob", "hunter2").await;

    // alice submits a job (the API path: debit, create, enqueue).
    let job = Job::new(
        "alice".to_string(),
        "python".to_string(),
        "print(2+2)".to_string(),
        JobLimits::with_timeout(30),
    );
    coordinator.ledger.ensure_account("alice").await.unwrap();
    assert!(coordinator
        .ledger
        .debit("alice", Credits::from_f64(1.0), Some(job.id))
        .await
        .unwrap());
    coordinator.store.create(&job).await.unwrap();
    coordinator.scheduler.enqueue(job.id).unwrap();

    // The worker receives the assignment over the socket.
    let (job_id, code) = match recv_frame(&mut stream).await {
        Frame::Assign { job_id, code, .. } => (job_id, code),
        other => panic!("expected assign, got {other:?}"),
    };
    assert_eq!(job_id, job.id);
    assert_eq!(code, "print(2+2)");

    send_frame(
        &mut sink,
        Frame::Ack {
            job_id,
            accepted: true,
            reason: None,
        },
    )
    .await;
    send_frame(
        &mut sink,
        Frame::Progress {
            job_id,
            phase: ProgressPhase::Running,
        },
    )
    .await;
    send_frame(
        &mut sink,
        Frame::Result {
            job_id,
            exit_code: 0,
            stdout: "4\n".to_string(),
            stderr: String::new(),
        },
    )
    .await;

    // Coordinator lands the terminal state and settles balances atomically.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let fetched = coordinator.store.get(job_id).await.unwrap().unwrap();
        if fetched.state == JobState::Completed {
            assert_eq!(fetched.stdout.as_deref(), Some("4\n"));
            assert_eq!(fetched.exit_code, Some(0));
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job never completed, state {}",
            fetched.state
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(
        coordinator.ledger.balance("alice").await.unwrap().unwrap(),
        Credits::from_f64(99.0)
    );
    assert_eq!(
        coordinator.ledger.balance("bob").await.unwrap().unwrap(),
        Credits::from_f64(100.8)
    );

    // The session is idle again.
    assert_eq!(
        coordinator.registry.get(worker_id).unwrap().status,
        WorkerStatus::Idle
    );
}

#[tokio::test]
async fn transport_drop_mid_job_requeues_it() {
    let coordinator = start_coordinator().await;
    let (mut sink, mut stream, _worker_id) =
        authenticate(&coordinator.url, "carol", "secret").await;

    let job = Job::new(
        "alice".to_string(),
        "python".to_string(),
        "print(2+2)".to_string(),
        JobLimits::with_timeout(30),
    );
    coordinator.ledger.ensure_account("alice").await.unwrap();
    coordinator
        .ledger
        .debit("alice", Credits::from_f64(1.0), Some(job.id))
        .await
        .unwrap();
    coordinator.store.create(&job).await.unwrap();
    coordinator.scheduler.enqueue(job.id).unwrap();

    match recv_frame(&mut stream).await {
        Frame::Assign { .. } => {}
        other => panic!("expected assign, got {other:?}"),
    }
    send_frame(
        &mut sink,
        Frame::Progress {
            job_id: job.id,
            phase: ProgressPhase::Running,
        },
    )
    .await;

    // Kill the transport before any result.
    drop(sink);
    drop(stream);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let fetched = coordinator.store.get(job.id).await.unwrap().unwrap();
        if fetched.state == JobState::Queued {
            assert!(fetched.assigned_worker.is_none());
            assert_eq!(fetched.requeues, 1);
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job was not re-queued, state {}",
            fetched.state
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    // No credit went to carol.
    assert_eq!(
        coordinator.ledger.balance("carol").await.unwrap().unwrap(),
        Credits::from_f64(100.0)
    );
}
