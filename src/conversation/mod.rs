//! Conversation state: the bounded, append-only turn log fed to the LLM.
//!
//! Invariants held after every mutation:
//! - the system prompt, when set, is always index 0 and never pruned;
//! - tool results stay glued to the assistant message that requested them —
//!   pruning removes both sides or neither;
//! - at most `max_turns` user turns and `max_context_tokens` approximate
//!   tokens remain.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::tools::ToolCall;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One message in the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Set on tool-result messages: which call this answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Tool name on tool-result messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Set on assistant messages that request tool invocations.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool_call_id: None,
            name: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            ..Self::system(content)
        }
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            tool_calls,
            ..Self::system(content)
        }
    }

    pub fn tool_result(call_id: &str, content: impl Into<String>, name: Option<&str>) -> Self {
        Self {
            role: Role::Tool,
            tool_call_id: Some(call_id.to_string()),
            name: name.map(|s| s.to_string()),
            ..Self::system(content)
        }
    }
}

/// Rough token estimate: words × 1.3, rounded up.
pub fn approx_tokens(text: &str) -> usize {
    (text.split_whitespace().count() as f64 * 1.3).ceil() as usize
}

/// The session's turn log with pruning and expiry.
pub struct ConversationState {
    system_prompt: Option<String>,
    /// Non-system messages in order.
    messages: Vec<Message>,
    max_turns: usize,
    max_context_tokens: usize,
    session_timeout: Duration,
    session_started: Instant,
    last_activity: Instant,
}

impl ConversationState {
    pub fn new(
        system_prompt: Option<String>,
        max_turns: usize,
        max_context_tokens: usize,
        session_timeout: Duration,
    ) -> Self {
        let now = Instant::now();
        Self {
            system_prompt,
            messages: Vec::new(),
            max_turns,
            max_context_tokens,
            session_timeout,
            session_started: now,
            last_activity: now,
        }
    }

    pub fn add_user(&mut self, text: impl Into<String>) {
        self.messages.push(Message::user(text));
        self.after_mutation();
    }

    pub fn add_assistant(&mut self, text: impl Into<String>, tool_calls: Vec<ToolCall>) {
        self.messages.push(Message::assistant(text, tool_calls));
        self.after_mutation();
    }

    pub fn add_tool_result(&mut self, call_id: &str, text: impl Into<String>, name: Option<&str>) {
        self.messages.push(Message::tool_result(call_id, text, name));
        self.after_mutation();
    }

    /// Snapshot for the LLM: system prompt (if set) at index 0.
    pub fn messages(&self) -> Vec<Message> {
        let mut out = Vec::with_capacity(self.messages.len() + 1);
        if let Some(prompt) = &self.system_prompt {
            out.push(Message::system(prompt.clone()));
        }
        out.extend(self.messages.iter().cloned());
        out
    }

    /// Drop all non-system messages and restart the session clock.
    pub fn clear(&mut self) {
        self.messages.clear();
        let now = Instant::now();
        self.session_started = now;
        self.last_activity = now;
    }

    /// Replacing the system prompt resets the conversation.
    pub fn set_system_prompt(&mut self, prompt: Option<String>) {
        self.clear();
        self.system_prompt = prompt;
    }

    /// Expire the session if it has been idle too long. Returns true when
    /// the conversation was cleared.
    pub fn tick(&mut self, now: Instant) -> bool {
        if !self.messages.is_empty()
            && now.duration_since(self.last_activity) > self.session_timeout
        {
            debug!("Session timed out — clearing conversation");
            self.clear();
            true
        } else {
            false
        }
    }

    /// Number of user turns currently held.
    pub fn turns(&self) -> usize {
        self.messages.iter().filter(|m| m.role == Role::User).count()
    }

    /// Approximate token count across all messages, system prompt included.
    pub fn token_estimate(&self) -> usize {
        let system = self
            .system_prompt
            .as_deref()
            .map(approx_tokens)
            .unwrap_or(0);
        system
            + self
                .messages
                .iter()
                .map(|m| approx_tokens(&m.content))
                .sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Seconds since last activity; the host sees this in `get_status`.
    pub fn idle_seconds(&self) -> u64 {
        self.last_activity.elapsed().as_secs()
    }

    fn after_mutation(&mut self) {
        self.last_activity = Instant::now();
        self.prune();
    }

    /// Enforce the turn and token budgets, oldest-first, keeping tool
    /// results glued to their assistant message.
    fn prune(&mut self) {
        while self.turns() > self.max_turns && self.drop_oldest_turn() {}
        while self.token_estimate() > self.max_context_tokens && self.drop_oldest_turn() {}
    }

    /// Remove the oldest user turn together with every assistant and tool
    /// message that belongs to it. Returns false when nothing can go.
    fn drop_oldest_turn(&mut self) -> bool {
        let Some(first_user) = self.messages.iter().position(|m| m.role == Role::User) else {
            return false;
        };
        // Everything up to (not including) the next user message belongs to
        // this turn: the assistant reply, its tool calls' results, and any
        // interleaved rounds.
        let next_user = self.messages[first_user + 1..]
            .iter()
            .position(|m| m.role == Role::User)
            .map(|i| first_user + 1 + i)
            .unwrap_or(self.messages.len());
        self.messages.drain(..next_user);
        true
    }
}
