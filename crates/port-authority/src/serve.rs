//! JSON-lines host loop.
//!
//! Each input line is one message from the browser side:
//!
//! ```text
//! {"kind":"request","id":1,"url":"http://127.0.0.1:631/","originUrl":"https://a.example/","tabId":3}
//! {"kind":"abort","id":1}
//! {"kind":"command","id":2,"sender":"moz-extension://…/popup/popup.html","type":"popupInit"}
//! {"kind":"tab","event":"removed","tabId":3}
//! ```
//!
//! Requests run concurrently and answer `{"id":1,"allow":false}` when done.
//! Commands and tab events are handled in arrival order. Aborted requests
//! and commands from untrusted senders get no answer.

use anyhow::Result;
use pa_guard::{ControlError, Envelope, Guard, Response};
use pa_network::{RequestContext, Verdict};
use pa_tabs::TabEvent;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Inbound message
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
enum Inbound {
    Request {
        id: u64,
        #[serde(flatten)]
        ctx: RequestContext,
    },
    Abort {
        id: u64,
    },
    Command {
        id: u64,
        #[serde(flatten)]
        envelope: Envelope,
    },
    Tab {
        #[serde(flatten)]
        event: TabEvent,
    },
}

/// Outbound message
#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Outbound {
    Verdict {
        id: u64,
        #[serde(flatten)]
        verdict: Verdict,
    },
    Response {
        id: u64,
        response: Response,
    },
    Error {
        id: u64,
        error: String,
    },
}

type PendingAborts = Arc<Mutex<HashMap<u64, oneshot::Sender<()>>>>;

/// Run the loop until `input` ends, then drain in-flight requests and stop
/// the guard. Returns the writer once everything is written.
pub async fn serve<R, W>(guard: Guard, input: R, output: W) -> Result<W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let guard = Arc::new(guard);
    let (out_tx, out_rx) = mpsc::unbounded_channel::<Outbound>();
    let writer = tokio::spawn(write_lines(out_rx, output));

    let pending: PendingAborts = Arc::default();
    let mut in_flight = JoinSet::new();
    let mut lines = input.lines();

    info!("Serving JSON lines");
    loop {
        let line = tokio::select! {
            // Reap finished requests so the set stays at the in-flight count
            Some(_) = in_flight.join_next(), if !in_flight.is_empty() => continue,
            line = lines.next_line() => match line? {
                Some(line) => line,
                None => break,
            },
        };
        if line.trim().is_empty() {
            continue;
        }

        let message = match serde_json::from_str::<Inbound>(&line) {
            Ok(message) => message,
            Err(e) => {
                warn!("Ignoring malformed message: {}", e);
                // A request is still owed a verdict
                if let Some(id) = request_id(&line) {
                    let _ = out_tx.send(Outbound::Verdict {
                        id,
                        verdict: Verdict::ALLOW,
                    });
                }
                continue;
            }
        };

        match message {
            Inbound::Request { id, ctx } => {
                let (abort_tx, abort_rx) = oneshot::channel();
                lock(&pending).insert(id, abort_tx);

                let guard = guard.clone();
                let pending = pending.clone();
                let out_tx = out_tx.clone();
                in_flight.spawn(async move {
                    let verdict = guard.on_before_request_abortable(&ctx, abort_rx).await;
                    lock(&pending).remove(&id);
                    match verdict {
                        Some(verdict) => {
                            let _ = out_tx.send(Outbound::Verdict { id, verdict });
                        }
                        None => debug!("Request {} aborted", id),
                    }
                });
            }
            Inbound::Abort { id } => {
                if let Some(abort) = lock(&pending).remove(&id) {
                    let _ = abort.send(());
                }
            }
            Inbound::Command { id, envelope } => match guard.command(envelope).await {
                Ok(response) => {
                    let _ = out_tx.send(Outbound::Response { id, response });
                }
                Err(ControlError::UntrustedSender(_)) => {}
                Err(e) => {
                    let _ = out_tx.send(Outbound::Error {
                        id,
                        error: e.to_string(),
                    });
                }
            },
            Inbound::Tab { event } => guard.tab_event(event).await,
        }
    }

    while in_flight.join_next().await.is_some() {}
    drop(out_tx);
    let output = writer.await??;

    match Arc::try_unwrap(guard) {
        Ok(guard) => guard.shutdown().await,
        Err(guard) => guard.flush().await,
    }
    info!("Input closed, stopped serving");
    Ok(output)
}

async fn write_lines<W>(mut rx: mpsc::UnboundedReceiver<Outbound>, mut output: W) -> std::io::Result<W>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        let mut line = match serde_json::to_vec(&message) {
            Ok(line) => line,
            Err(e) => {
                warn!("Could not encode reply: {}", e);
                continue;
            }
        };
        line.push(b'\n');
        output.write_all(&line).await?;
        output.flush().await?;
    }
    Ok(output)
}

/// `id` of a line that claims to be a request but did not decode.
fn request_id(line: &str) -> Option<u64> {
    let raw: Value = serde_json::from_str(line).ok()?;
    if raw.get("kind")?.as_str()? != "request" {
        return None;
    }
    raw.get("id")?.as_u64()
}

fn lock(pending: &PendingAborts) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<()>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}
