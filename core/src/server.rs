//! The Core's two TCP listeners and their per-connection handlers.
//!
//! Both listeners accept in a loop and spawn one task per connection; a
//! connection failure is logged and never affects other connections or the
//! listeners themselves. Tray connections are command-only. GUI connections
//! get the `GuiInit` snapshot written before anything is read from them and
//! then receive every `ProcessStatus` transition for as long as they stay
//! connected.

use std::sync::Arc;
use std::time::Duration;

use marshal_ipc::framing::{self, FrameError, FrameReader, FramingMode};
use marshal_ipc::messages::{self, ErrorOccurred, Message, MessageError};
use tokio::io::{AsyncWrite, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::dispatcher::Dispatcher;

#[derive(Debug, thiserror::Error)]
enum ConnectionError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub async fn run_tray_listener(
    address: &str,
    dispatcher: Arc<Dispatcher>,
    mode: FramingMode,
    max_frame_size: usize,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(address).await?;
    info!(address, "tray listener started");
    serve_tray(listener, dispatcher, mode, max_frame_size).await
}

/// Accept loop for Tray connections. Takes a bound listener so tests can
/// bind port 0 themselves.
pub async fn serve_tray(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    mode: FramingMode,
    max_frame_size: usize,
) -> anyhow::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        debug!(%peer, "tray connection accepted");
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            if let Err(e) = handle_tray_connection(stream, dispatcher, mode, max_frame_size).await
            {
                warn!(%peer, error = %e, "tray connection closed with error");
            } else {
                debug!(%peer, "tray connection closed");
            }
        });
    }
}

pub async fn run_gui_listener(
    address: &str,
    dispatcher: Arc<Dispatcher>,
    max_frame_size: usize,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(address).await?;
    info!(address, "gui listener started");
    serve_gui(listener, dispatcher, max_frame_size).await
}

pub async fn serve_gui(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    max_frame_size: usize,
) -> anyhow::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        debug!(%peer, "gui connection accepted");
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            if let Err(e) = handle_gui_connection(stream, dispatcher, max_frame_size).await {
                warn!(%peer, error = %e, "gui connection closed with error");
            } else {
                debug!(%peer, "gui connection closed");
            }
        });
    }
}

async fn handle_tray_connection(
    stream: TcpStream,
    dispatcher: Arc<Dispatcher>,
    mode: FramingMode,
    max_frame_size: usize,
) -> Result<(), ConnectionError> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader =
        FrameReader::with_max_frame_size(BufReader::new(read_half), mode, max_frame_size);
    loop {
        let payload = match reader.next_frame().await {
            Ok(Some(payload)) => payload,
            Ok(None) => return Ok(()),
            // A peer vanishing mid-frame is a disconnect, not a protocol
            // violation worth a warning.
            Err(FrameError::Incomplete) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let message = match messages::parse(&payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    error = %e,
                    payload = %String::from_utf8_lossy(&payload),
                    "undecodable tray message"
                );
                return Err(e.into());
            }
        };
        if let Err(e) = dispatcher.dispatch(message).await {
            warn!(error = %e, "tray command failed");
            send_error_reply(&mut write_half, &e.to_string()).await?;
        }
    }
}

async fn handle_gui_connection(
    stream: TcpStream,
    dispatcher: Arc<Dispatcher>,
    max_frame_size: usize,
) -> Result<(), ConnectionError> {
    let (read_half, mut write_half) = stream.into_split();

    // Handshake first: the snapshot goes out before any read.
    let init = messages::serialize(&Message::GuiInit(dispatcher.gui_init()))?;
    framing::write_frame(&mut write_half, &init).await?;

    let mut status = dispatcher.subscribe_status();
    let mut reader = FrameReader::with_max_frame_size(
        BufReader::new(read_half),
        FramingMode::Framed,
        max_frame_size,
    );
    loop {
        tokio::select! {
            frame = reader.next_frame() => {
                let payload = match frame {
                    Ok(Some(payload)) => payload,
                    Ok(None) => return Ok(()),
                    Err(FrameError::Incomplete) => return Ok(()),
                    Err(e) => return Err(e.into()),
                };
                let message = match messages::parse(&payload) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(
                            error = %e,
                            payload = %String::from_utf8_lossy(&payload),
                            "undecodable gui message"
                        );
                        return Err(e.into());
                    }
                };
                if let Err(e) = dispatcher.dispatch(message).await {
                    warn!(error = %e, "gui command failed");
                    send_error_reply(&mut write_half, &e.to_string()).await?;
                }
            }
            event = status.recv() => {
                match event {
                    Ok(event) => {
                        let bytes = messages::serialize(&Message::ProcessStatus(event))?;
                        framing::write_frame(&mut write_half, &bytes).await?;
                    }
                    Err(RecvError::Lagged(missed)) => {
                        // The snapshot is handshake-only, so a lagging GUI
                        // simply misses transitions.
                        warn!(missed, "gui connection lagged behind status events");
                    }
                    Err(RecvError::Closed) => return Ok(()),
                }
            }
        }
    }
}

async fn send_error_reply<W: AsyncWrite + Unpin>(
    writer: &mut W,
    error: &str,
) -> Result<(), ConnectionError> {
    let reply = messages::serialize(&Message::ErrorOccurred(ErrorOccurred {
        error: error.to_string(),
    }))?;
    framing::write_frame(writer, &reply).await?;
    Ok(())
}

/// Periodically reaps registry entries whose process has disappeared.
pub async fn run_liveness_sweep(dispatcher: Arc<Dispatcher>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        dispatcher.reap_dead_instances().await;
    }
}
