//! IPC bridge: stdin command reader and stdout line writer.
//!
//! A blocking reader thread turns stdin JSON lines into [`HostCommand`]s on
//! an mpsc channel; a writer task drains [`HostLine`]s to stdout, one JSON
//! object per line, flushing after each. Pushes get their `STATUS ` /
//! `EVENT ` prefix here.

use std::io::{self, BufRead, Write};

use tokio::sync::mpsc;
use tracing::{debug, error};

use super::{HostCommand, HostEvent, HostLine};

/// Serialize one outbound line, prefix included.
pub fn render_line(line: &HostLine) -> Option<String> {
    match line {
        HostLine::Reply(value) => serde_json::to_string(value).ok(),
        HostLine::Status { status, ts } => {
            let body = serde_json::json!({
                "type": "status_update",
                "status": status,
                "ts": ts,
            });
            serde_json::to_string(&body).ok().map(|s| format!("STATUS {s}"))
        }
        HostLine::Event(event) => {
            let mut value = serde_json::to_value(event).ok()?;
            if let Some(obj) = value.as_object_mut() {
                // Events that carry their own timestamp keep it.
                obj.entry("ts")
                    .or_insert(serde_json::json!(chrono::Utc::now().timestamp_millis()));
            }
            serde_json::to_string(&value).ok().map(|s| format!("EVENT {s}"))
        }
    }
}

/// Write one line to stdout and flush. Write errors are ignored — the pipe
/// may already be closed during shutdown.
fn emit(text: &str) {
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    let _ = writeln!(handle, "{text}");
    let _ = handle.flush();
}

/// Emit a single event line directly (startup, before the writer task).
pub fn emit_event(event: &HostEvent) {
    if let Some(text) = render_line(&HostLine::Event(event.clone())) {
        emit(&text);
    }
}

/// Spawn the writer task draining outbound lines to stdout.
pub fn spawn_stdout_writer(mut rx: mpsc::UnboundedReceiver<HostLine>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if let Some(text) = render_line(&line) {
                emit(&text);
            }
        }
        debug!("stdout writer exiting");
    })
}

/// Spawn a blocking thread that reads JSON lines from stdin, deserializes
/// them into [`HostCommand`], and forwards them through the returned
/// channel. The thread exits when stdin closes (host process gone).
pub fn spawn_stdin_reader(
    outbound: mpsc::UnboundedSender<HostLine>,
) -> mpsc::UnboundedReceiver<HostCommand> {
    let (tx, rx) = mpsc::unbounded_channel();

    std::thread::spawn(move || {
        let stdin = io::stdin();
        let reader = stdin.lock();
        for line in reader.lines() {
            match line {
                Ok(text) => {
                    let trimmed = text.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<HostCommand>(trimmed) {
                        Ok(cmd) => {
                            debug!(?cmd, "Received host command");
                            if tx.send(cmd).is_err() {
                                break; // Receiver dropped — main task is gone.
                            }
                        }
                        Err(e) => {
                            error!("Invalid JSON command: {} — input: {}", e, trimmed);
                            let _ = outbound.send(HostLine::Event(HostEvent::Error {
                                kind: "InvalidCommand".to_string(),
                                message: e.to_string(),
                            }));
                        }
                    }
                }
                Err(e) => {
                    error!("stdin read error: {}", e);
                    break; // stdin closed
                }
            }
        }
        debug!("stdin reader thread exiting");
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::Status;

    #[test]
    fn status_lines_carry_the_prefix() {
        let text = render_line(&HostLine::Status {
            status: Status::Listening,
            ts: 1234,
        })
        .unwrap();
        assert!(text.starts_with("STATUS {"));
        let json: serde_json::Value =
            serde_json::from_str(text.strip_prefix("STATUS ").unwrap()).unwrap();
        assert_eq!(json["type"], "status_update");
        assert_eq!(json["status"], "listening");
        assert_eq!(json["ts"], 1234);
    }

    #[test]
    fn event_lines_carry_the_prefix_and_timestamp() {
        let text = render_line(&HostLine::Event(HostEvent::WakeWordDetected { ts: 7 })).unwrap();
        assert!(text.starts_with("EVENT {"));
        let json: serde_json::Value =
            serde_json::from_str(text.strip_prefix("EVENT ").unwrap()).unwrap();
        assert_eq!(json["type"], "wake_word_detected");
    }

    #[test]
    fn reply_lines_have_no_prefix() {
        let line = crate::ipc::reply("ping", true, serde_json::json!({}));
        let text = render_line(&line).unwrap();
        assert!(text.starts_with('{'));
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["response"], "ping");
        assert_eq!(json["ok"], true);
    }
}
