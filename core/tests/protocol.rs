//! End-to-end tests over real TCP sockets: one task runs the accept loop,
//! the test plays the Tray or GUI side of the connection.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use marshal_core::catalog::ApplicationCatalog;
use marshal_core::dispatcher::Dispatcher;
use marshal_core::process::{LaunchSpec, ProcessError, ProcessManager};
use marshal_core::registry::{InstanceState, ProcessRegistry};
use marshal_core::server;
use marshal_ipc::framing::{self, FrameReader, FramingMode, DEFAULT_MAX_FRAME_SIZE};
use marshal_ipc::messages::{self, Message};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

/// Accepts every launch and stop without touching the OS.
struct AcceptingManager;

#[async_trait]
impl ProcessManager for AcceptingManager {
    async fn launch(&self, _identifier: &str, _spec: &LaunchSpec) -> Result<(), ProcessError> {
        Ok(())
    }

    async fn kill(&self, _identifier: &str) -> Result<(), ProcessError> {
        Ok(())
    }

    async fn terminate(&self, _identifier: &str) -> Result<(), ProcessError> {
        Ok(())
    }

    async fn is_alive(&self, _identifier: &str) -> bool {
        true
    }
}

fn dispatcher() -> (Arc<Dispatcher>, Arc<ProcessRegistry>) {
    let registry = Arc::new(ProcessRegistry::new());
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&registry),
        Arc::new(AcceptingManager),
        ApplicationCatalog {
            clusters: vec!["mock".into()],
            applications: Vec::new(),
        },
    ));
    (dispatcher, registry)
}

async fn spawn_tray_server(
    dispatcher: Arc<Dispatcher>,
    mode: FramingMode,
    max_frame_size: usize,
) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    tokio::spawn(server::serve_tray(listener, dispatcher, mode, max_frame_size));
    address
}

async fn spawn_gui_server(dispatcher: Arc<Dispatcher>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    tokio::spawn(server::serve_gui(listener, dispatcher, DEFAULT_MAX_FRAME_SIZE));
    address
}

async fn read_message(stream: &mut TcpStream) -> Message {
    let mut reader = FrameReader::new(stream, FramingMode::Framed);
    let payload = timeout(Duration::from_secs(5), reader.next_frame())
        .await
        .expect("timed out waiting for a frame")
        .unwrap()
        .expect("connection closed before a frame arrived");
    messages::parse(&payload).unwrap()
}

/// Polls until the condition holds or the deadline passes.
async fn wait_for(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition did not become true in time");
}

fn tray_json(identifier: &str, command: &str, executable: &str) -> Vec<u8> {
    format!(
        r#"{{"type": "TrayCommand", "payload": {{"identifier": "{identifier}", "command": "{command}", "executable": "{executable}", "baseDirectory": "", "currentWorkingDirectory": "", "commandlineArguments": ""}}}}"#
    )
    .into_bytes()
}

#[tokio::test]
async fn framed_start_and_exit_drive_the_registry() {
    let (dispatcher, registry) = dispatcher();
    let address = spawn_tray_server(dispatcher, FramingMode::Auto, DEFAULT_MAX_FRAME_SIZE).await;

    let mut stream = TcpStream::connect(&address).await.unwrap();
    framing::write_frame(&mut stream, &tray_json("12345", "start", "/bin/app"))
        .await
        .unwrap();
    wait_for(|| registry.state_of("12345") == Some(InstanceState::Running)).await;

    framing::write_frame(&mut stream, &tray_json("12345", "exit", ""))
        .await
        .unwrap();
    wait_for(|| registry.is_empty()).await;
}

#[tokio::test]
async fn legacy_unframed_kill_of_unknown_instance_gets_error_reply() {
    let (dispatcher, registry) = dispatcher();
    let address = spawn_tray_server(dispatcher, FramingMode::Auto, DEFAULT_MAX_FRAME_SIZE).await;

    let mut stream = TcpStream::connect(&address).await.unwrap();
    // No frame prefix: a legacy sender ships the raw document and closes
    // its write side.
    stream
        .write_all(&tray_json("ghost", "kill", ""))
        .await
        .unwrap();
    stream.shutdown().await.unwrap();

    match read_message(&mut stream).await {
        Message::ErrorOccurred(reply) => assert!(reply.error.contains("ghost")),
        other => panic!("expected ErrorOccurred, got {other:?}"),
    }
    assert!(registry.is_empty());
}

#[tokio::test]
async fn oversized_frame_closes_only_its_own_connection() {
    let (dispatcher, registry) = dispatcher();
    let address = spawn_tray_server(dispatcher, FramingMode::Framed, 512).await;

    let mut bad = TcpStream::connect(&address).await.unwrap();
    bad.write_all(b"999999#").await.unwrap();
    bad.flush().await.unwrap();

    // A well-behaved connection keeps working.
    let mut good = TcpStream::connect(&address).await.unwrap();
    framing::write_frame(&mut good, &tray_json("ok", "start", "/bin/app"))
        .await
        .unwrap();
    wait_for(|| registry.state_of("ok") == Some(InstanceState::Running)).await;
}

#[tokio::test]
async fn malformed_command_gets_error_reply_and_connection_stays_open() {
    let (dispatcher, registry) = dispatcher();
    let address = spawn_tray_server(dispatcher, FramingMode::Framed, DEFAULT_MAX_FRAME_SIZE).await;

    let mut stream = TcpStream::connect(&address).await.unwrap();
    framing::write_frame(&mut stream, &tray_json("nope", "start", ""))
        .await
        .unwrap();
    match read_message(&mut stream).await {
        Message::ErrorOccurred(reply) => assert!(reply.error.contains("executable")),
        other => panic!("expected ErrorOccurred, got {other:?}"),
    }

    // Same connection, valid command.
    framing::write_frame(&mut stream, &tray_json("ok", "start", "/bin/app"))
        .await
        .unwrap();
    wait_for(|| registry.state_of("ok") == Some(InstanceState::Running)).await;
}

#[tokio::test]
async fn gui_handshake_arrives_before_any_request() {
    let (dispatcher, registry) = dispatcher();
    // Pre-populate the registry so the snapshot has content.
    dispatcher
        .dispatch(messages::parse(&tray_json("12345", "start", "/bin/app")).unwrap())
        .await
        .unwrap();
    let address = spawn_gui_server(dispatcher).await;

    // The snapshot must arrive without the client sending a single byte.
    let mut stream = TcpStream::connect(&address).await.unwrap();
    match read_message(&mut stream).await {
        Message::GuiInit(init) => {
            assert_eq!(init.clusters, vec!["mock"]);
            assert_eq!(init.processes.len(), 1);
            assert_eq!(init.processes[0].identifier, "12345");
            assert_eq!(init.processes[0].status, "Running");
        }
        other => panic!("expected GuiInit, got {other:?}"),
    }
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn gui_command_survives_interleaved_status_broadcasts() {
    let (dispatcher, registry) = dispatcher();
    let address = spawn_gui_server(Arc::clone(&dispatcher)).await;

    let mut stream = TcpStream::connect(&address).await.unwrap();
    match read_message(&mut stream).await {
        Message::GuiInit(init) => assert!(init.processes.is_empty()),
        other => panic!("expected GuiInit, got {other:?}"),
    }

    // Send only the first byte of a framed command, then force status
    // broadcasts while the rest of the frame is still in flight.
    let frame = framing::encode_frame(&tray_json("late", "start", "/bin/app"));
    stream.write_all(&frame[..1]).await.unwrap();
    stream.flush().await.unwrap();

    dispatcher
        .dispatch(messages::parse(&tray_json("racer", "start", "/bin/app")).unwrap())
        .await
        .unwrap();
    // Both broadcasts arriving proves the connection's outbound branch ran
    // while the inbound frame was partial.
    for _ in 0..2 {
        match read_message(&mut stream).await {
            Message::ProcessStatus(status) => assert_eq!(status.identifier, "racer"),
            other => panic!("expected ProcessStatus, got {other:?}"),
        }
    }

    // The rest of the frame must still dispatch as one command.
    stream.write_all(&frame[1..]).await.unwrap();
    wait_for(|| registry.state_of("late") == Some(InstanceState::Running)).await;
}

#[tokio::test]
async fn gui_receives_status_broadcasts() {
    let (dispatcher, registry) = dispatcher();
    let address = spawn_gui_server(Arc::clone(&dispatcher)).await;

    let mut stream = TcpStream::connect(&address).await.unwrap();
    match read_message(&mut stream).await {
        Message::GuiInit(init) => assert!(init.processes.is_empty()),
        other => panic!("expected GuiInit, got {other:?}"),
    }

    // A Tray-side start shows up as Starting then Running on the GUI side.
    dispatcher
        .dispatch(messages::parse(&tray_json("12345", "start", "/bin/app")).unwrap())
        .await
        .unwrap();
    wait_for(|| registry.state_of("12345") == Some(InstanceState::Running)).await;

    let mut statuses = Vec::new();
    for _ in 0..2 {
        match read_message(&mut stream).await {
            Message::ProcessStatus(status) => {
                assert_eq!(status.identifier, "12345");
                statuses.push(status.status);
            }
            other => panic!("expected ProcessStatus, got {other:?}"),
        }
    }
    assert_eq!(statuses, vec!["Starting", "Running"]);
}
