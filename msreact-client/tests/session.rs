//! End-to-end sessions against a scripted instrument server.

use std::{
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use assert_matches::assert_matches;
use futures_util::{SinkExt, StreamExt};
use msreact_client::{
    algorithms::{builtin_registry, monitor},
    client::{MsReactClient, RunRequest},
    config::{ClientConfig, WorkerMode},
    executor::{AcquisitionExecutor, ThreadExecutor},
    instrument::{InstrumentClient, InstrumentEvent},
    instruments::InstrumentModel,
    protocol::{
        codec,
        id::{CommandId, EventId, MessageId, ResponseId},
    },
    transfer_register::TransferRegister,
    transport::{TransportConfig, WebSocketTransport},
};
use rmpv::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};

type Commands = Arc<Mutex<Vec<CommandId>>>;

/// What the server sends once the acquisition is configured.
#[derive(Clone, Copy)]
struct Script {
    scans: i64,
    last: EventId,
}

fn scan(number: i64) -> Value {
    Value::Map(vec![
        (Value::from("ScanNumber"), Value::from(number)),
        (Value::from("CentroidCount"), Value::from(120)),
        (Value::from("MSOrder"), Value::from(1)),
    ])
}

async fn send(
    ws: &mut WebSocketStream<TcpStream>,
    id: impl Into<MessageId>,
    payload: Option<&Value>,
) {
    let frame = codec::encode(id.into(), payload).expect("should encode");
    ws.send(Message::Binary(frame)).await.expect("client should be connected");
}

/// Answer every command of one connection until the client goes away.
async fn serve(mut ws: WebSocketStream<TcpStream>, script: Script, commands: Commands) {
    while let Some(Ok(message)) = ws.next().await {
        let Message::Binary(frame) = message else {
            continue;
        };
        let Ok((MessageId::Command(command), _)) = codec::decode(&frame) else {
            panic!("client sent something other than a command");
        };
        commands.lock().expect("not poisoned").push(command);
        match command {
            CommandId::GetPossibleParams => {
                send(&mut ws, ResponseId::PossibleParams, Some(&Value::Array(Vec::new()))).await;
            }
            CommandId::ConfigAcq => {
                send(&mut ws, ResponseId::Ok, None).await;
                for n in 1..=script.scans {
                    send(&mut ws, EventId::Scan, Some(&scan(n))).await;
                }
                let reason = Value::from("instrument fault");
                let payload = (script.last == EventId::Error).then_some(&reason);
                send(&mut ws, script.last, payload).await;
            }
            _ => send(&mut ws, ResponseId::Ok, None).await,
        }
    }
}

async fn server(script: Script) -> (u16, Commands) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("should bind");
    let port = listener.local_addr().expect("should have an address").port();
    let commands = Commands::default();
    let recorded = Arc::clone(&commands);
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("client should connect");
        let ws = accept_async(stream).await.expect("should upgrade");
        serve(ws, script, recorded).await;
    });
    (port, commands)
}

fn config(port: u16, dir: &Path) -> ClientConfig {
    ClientConfig {
        port,
        reconnect_backoff_ms: 50,
        response_timeout_ms: Some(5_000),
        intra_join_timeout_ms: 2_000,
        worker_mode: WorkerMode::Thread,
        transfer_register: dir.join("register.json"),
        download_dir: dir.to_path_buf(),
        ..ClientConfig::default()
    }
}

async fn run_monitor(script: Script, dir: &Path) -> (bool, Vec<CommandId>) {
    let (port, commands) = server(script).await;
    let registry = Arc::new(builtin_registry());
    let executor: Arc<dyn AcquisitionExecutor> =
        Arc::new(ThreadExecutor::new(Arc::clone(&registry)));
    let client = MsReactClient::new(config(port, dir), registry, executor);

    let mut request = RunRequest::new(Some("127.0.0.1".to_string()), monitor::ALGORITHM_NAME);
    request.model = InstrumentModel::Mock;

    let completed = tokio::time::timeout(
        Duration::from_secs(20),
        client.run(&request, std::future::pending()),
    )
    .await
    .expect("session should finish")
    .expect("session should run");
    let commands = commands.lock().expect("not poisoned").clone();
    (completed, commands)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn monitor_sees_every_scan_and_ends_normally() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let (completed, commands) = run_monitor(
        Script {
            scans: 5,
            last: EventId::FinishedAcq,
        },
        dir.path(),
    )
    .await;

    assert!(completed);
    assert!(commands.contains(&CommandId::SelectInstr));
    assert!(commands.contains(&CommandId::ConfigAcq));
    assert!(
        !commands.contains(&CommandId::StartAcq),
        "a listening acquisition must not start the instrument"
    );

    let register = TransferRegister::load(&dir.path().join("register.json"))
        .expect("register should remain");
    assert_eq!(register.get(monitor::SCAN_COUNT_KEY), Some(&serde_json::json!(5)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn instrument_error_aborts_the_algorithm() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let (completed, commands) = run_monitor(
        Script {
            scans: 2,
            last: EventId::Error,
        },
        dir.path(),
    )
    .await;

    assert!(!completed);
    assert!(!commands.contains(&CommandId::StartAcq));
    assert!(
        !dir.path().join("register.json").exists(),
        "an aborted run removes its transfer register"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn listener_survives_a_dropped_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("should bind");
    let port = listener.local_addr().expect("should have an address").port();
    tokio::spawn(async move {
        // first connection: one scan, then the server goes away
        let (stream, _) = listener.accept().await.expect("client should connect");
        let mut ws = accept_async(stream).await.expect("should upgrade");
        send(&mut ws, EventId::Scan, Some(&scan(1))).await;
        ws.close(None).await.expect("should close");
        drop(ws);

        let (stream, _) = listener.accept().await.expect("client should reconnect");
        let mut ws = accept_async(stream).await.expect("should upgrade");
        send(&mut ws, EventId::Scan, Some(&scan(2))).await;
        send(&mut ws, EventId::FinishedAcq, None).await;
        serve(
            ws,
            Script {
                scans: 0,
                last: EventId::FinishedAcq,
            },
            Commands::default(),
        )
        .await;
    });

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let transport = WebSocketTransport::new(TransportConfig {
        port,
        reconnect_backoff: Duration::from_millis(50),
        ..TransportConfig::default()
    });
    let client = Arc::new(InstrumentClient::new(transport, move |e: InstrumentEvent| {
        let name = match e {
            InstrumentEvent::Scan(_) => "scan",
            InstrumentEvent::FinishedAcquisition => "finished",
            InstrumentEvent::Error(_) => "error",
        };
        sink.lock().expect("not poisoned").push(name);
    }));

    assert!(client
        .connect(Some("127.0.0.1".to_string()))
        .await
        .expect("should connect"));
    let listener = client.spawn_listener();

    tokio::time::timeout(Duration::from_secs(10), async {
        while events.lock().expect("not poisoned").len() < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("events should arrive over the new connection");

    assert!(client.is_listening());
    assert_eq!(*events.lock().expect("not poisoned"), ["scan", "scan", "finished"]);

    client.instrument_clean_up().await;
    listener.await.expect("listener should stop cleanly");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_lets_the_pending_receive_finish() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("should bind");
    let port = listener.local_addr().expect("should have an address").port();
    let (release, released) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("client should connect");
        let mut ws = accept_async(stream).await.expect("should upgrade");
        released.await.expect("the scan should be released");
        send(&mut ws, EventId::Scan, Some(&scan(1))).await;
        while let Some(Ok(_)) = ws.next().await {}
    });

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let transport = WebSocketTransport::new(TransportConfig {
        port,
        ..TransportConfig::default()
    });
    let client = Arc::new(InstrumentClient::new(transport, move |e: InstrumentEvent| {
        sink.lock().expect("not poisoned").push(e);
    }));
    assert!(client
        .connect(Some("127.0.0.1".to_string()))
        .await
        .expect("should connect"));
    let listener = client.spawn_listener();
    while !client.is_listening() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    client.stop_listening();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(
        client.is_listening(),
        "the receive in progress should not be abandoned"
    );

    release.send(()).expect("server should wait for the release");
    tokio::time::timeout(Duration::from_secs(5), listener)
        .await
        .expect("listener should stop once the receive returns")
        .expect("listener should not panic");

    assert!(!client.is_listening());
    assert_matches!(
        events.lock().expect("not poisoned").as_slice(),
        [InstrumentEvent::Scan(s)] if s.scan_number() == Some(1)
    );
    client.disconnect().await.expect("should disconnect");
}
