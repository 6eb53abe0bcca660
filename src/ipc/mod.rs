//! Host protocol types.
//!
//! The UI host drives the core over stdin/stdout with one JSON object per
//! line. Inbound: `{"command": "<name>", ...}`. Outbound is one of three
//! line shapes:
//!   - command replies: `{"response": "<cmd>", "ok": bool, ...payload}`
//!   - status pushes:   `STATUS {"type":"status_update",...}`
//!   - event pushes:    `EVENT  {"type":...}`
//! The `STATUS ` / `EVENT ` prefixes disambiguate pushes from replies.

pub mod bridge;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Commands: host -> core (stdin)
// ---------------------------------------------------------------------------

/// All commands accepted from the host.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "command")]
#[serde(rename_all = "snake_case")]
pub enum HostCommand {
    Start {},
    Stop {},
    Interrupt {},
    ClearConversation {},
    GetStatus {},
    GetMetrics {},
    TriggerHotkey {},
    Reset {},
    Ping {},
    ListAudioDevices {},
    Speak { text: String },
}

impl HostCommand {
    /// The wire name echoed back in the reply's `response` field.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start {} => "start",
            Self::Stop {} => "stop",
            Self::Interrupt {} => "interrupt",
            Self::ClearConversation {} => "clear_conversation",
            Self::GetStatus {} => "get_status",
            Self::GetMetrics {} => "get_metrics",
            Self::TriggerHotkey {} => "trigger_hotkey",
            Self::Reset {} => "reset",
            Self::Ping {} => "ping",
            Self::ListAudioDevices {} => "list_audio_devices",
            Self::Speak { .. } => "speak",
        }
    }
}

// ---------------------------------------------------------------------------
// Outbound lines: core -> host (stdout)
// ---------------------------------------------------------------------------

/// Orchestrator status as shown to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Initializing,
    Idle,
    Listening,
    Processing,
    Speaking,
    Error,
    Stopped,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Initializing => "initializing",
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Processing => "processing",
            Self::Speaking => "speaking",
            Self::Error => "error",
            Self::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

/// Asynchronous events pushed to the host (`EVENT ` lines).
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum HostEvent {
    WakeWordDetected {
        ts: i64,
    },
    HotkeyTriggered {
        ts: i64,
    },
    ProcessingComplete {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        transcription: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        response: Option<String>,
        duration_ms: u64,
    },
    Error {
        kind: String,
        message: String,
    },
    SessionExpired {},
}

/// One outbound line, ready for the bridge to serialize.
#[derive(Debug, Clone, PartialEq)]
pub enum HostLine {
    Reply(Value),
    Status { status: Status, ts: i64 },
    Event(HostEvent),
}

/// Build a command reply with extra payload fields merged in.
pub fn reply(command: &str, ok: bool, payload: Value) -> HostLine {
    let mut obj = serde_json::Map::new();
    obj.insert("response".to_string(), Value::String(command.to_string()));
    obj.insert("ok".to_string(), Value::Bool(ok));
    if let Value::Object(extra) = payload {
        obj.extend(extra);
    }
    HostLine::Reply(Value::Object(obj))
}
