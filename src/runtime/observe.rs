//! Observation of runtime state transitions over the sync socket.
//!
//! The OCI runtime reports every state change of an instance by connecting
//! to the instance's sync socket and writing a single JSON object, one
//! connection per transition. The observer turns those into an ordered,
//! buffered sequence of [`State`] values.

use crate::{
    error::RuntimeError,
    runtime::state::State,
    sync::Cancel,
};
use anyhow::{Context, Result};
use log::{debug, warn};
use serde::Deserialize;
use std::path::Path;
use tokio::{
    io::AsyncReadExt,
    net::{UnixListener, UnixStream},
    sync::mpsc,
};

/// Transitions during create arrive in a burst of up to three; the buffer
/// keeps the observer from ever blocking on a consumer.
const CHANNEL_CAPACITY: usize = 4;

#[derive(Debug, Deserialize)]
struct SyncMessage {
    status: String,
}

/// Listen on `socket_path` and stream every reported state transition.
///
/// The returned channel closes exactly once: on cancellation, on an accept
/// or decode error, or after `Exited` was published. An unknown status is
/// published as `Unknown` and terminates observation.
pub fn observe_state<P: AsRef<Path>>(
    socket_path: P,
) -> Result<(mpsc::Receiver<State>, Cancel)> {
    let socket_path = socket_path.as_ref();
    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("bind sync socket {}", socket_path.display()))?;

    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let cancel = Cancel::new();
    let canceled = cancel.clone();

    tokio::spawn(async move {
        loop {
            let stream = tokio::select! {
                _ = canceled.canceled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        warn!("Sync socket accept failed: {}", e);
                        break;
                    }
                },
            };

            let state = match read_transition(stream).await {
                Ok(state) => state,
                Err(e) => {
                    warn!("Sync socket message not decodable: {:#}", e);
                    break;
                }
            };

            debug!("Observed state transition to {}", state);
            if tx.send(state).await.is_err() {
                break;
            }
            if state == State::Unknown || state == State::Exited {
                break;
            }
        }
        // Dropping the listener and sender here closes the sequence.
    });

    Ok((rx, cancel))
}

/// One connection carries exactly one JSON encoded transition.
async fn read_transition(mut stream: UnixStream) -> Result<State> {
    let mut payload = Vec::new();
    stream
        .read_to_end(&mut payload)
        .await
        .context("read sync socket connection")?;
    let msg: SyncMessage =
        serde_json::from_slice(&payload).context("decode sync socket message")?;
    Ok(State::from_wire(&msg.status))
}

/// Receive the next transition and require it to be `expected`.
///
/// A closed channel surfaces as an unexpected `Unknown`.
pub async fn expect_state(
    rx: &mut mpsc::Receiver<State>,
    expected: State,
) -> std::result::Result<(), RuntimeError> {
    let got = rx.recv().await.unwrap_or(State::Unknown);
    if got == expected {
        Ok(())
    } else {
        Err(RuntimeError::UnexpectedState { expected, got })
    }
}
