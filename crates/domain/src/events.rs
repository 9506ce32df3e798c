//! The gateway event enumeration — a closed set.
//!
//! Every cross-component notification travels over the bus as an
//! [`Event`]: a typed payload plus emission timestamp and an optional
//! correlation id tying it to the request that produced it.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::chat::ToolCallStatus;

/// Discriminant for subscription filtering. One variant per wire name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ChannelMessage,
    ConversationStart,
    ConversationStreamText,
    ConversationStreamToolDetected,
    ConversationStreamToolStart,
    ConversationStreamToolResult,
    ConversationStreamToolError,
    ConversationComplete,
    ConversationError,
    ToolCallStart,
    ToolCallResult,
    ToolCallError,
    MemorySaved,
    MemoryRecalled,
    MemoryClusterDone,
    MemorySummaryDone,
    ConfigChanged,
    ConnectionBound,
    ConnectionClosed,
}

impl EventKind {
    /// The dotted wire name, used in logs and diagnostics.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ChannelMessage => "channel.message",
            EventKind::ConversationStart => "conversation.start",
            EventKind::ConversationStreamText => "conversation.stream.text",
            EventKind::ConversationStreamToolDetected => "conversation.stream.tool_detected",
            EventKind::ConversationStreamToolStart => "conversation.stream.tool_start",
            EventKind::ConversationStreamToolResult => "conversation.stream.tool_result",
            EventKind::ConversationStreamToolError => "conversation.stream.tool_error",
            EventKind::ConversationComplete => "conversation.complete",
            EventKind::ConversationError => "conversation.error",
            EventKind::ToolCallStart => "tool.call.start",
            EventKind::ToolCallResult => "tool.call.result",
            EventKind::ToolCallError => "tool.call.error",
            EventKind::MemorySaved => "memory.saved",
            EventKind::MemoryRecalled => "memory.recalled",
            EventKind::MemoryClusterDone => "memory.cluster.done",
            EventKind::MemorySummaryDone => "memory.summary.done",
            EventKind::ConfigChanged => "config.changed",
            EventKind::ConnectionBound => "connection.bound",
            EventKind::ConnectionClosed => "connection.closed",
        }
    }
}

/// Typed event payloads. Adding a variant here is an API change for every
/// subscriber, which is the point: the set is closed.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum EventPayload {
    #[serde(rename = "channel.message")]
    ChannelMessage {
        user_id: String,
        session_id: String,
        content: String,
    },

    #[serde(rename = "conversation.start")]
    ConversationStart { user_id: String, session_id: String },

    #[serde(rename = "conversation.stream.text")]
    ConversationStreamText { session_id: String, content: String },

    #[serde(rename = "conversation.stream.tool_detected")]
    ConversationStreamToolDetected {
        session_id: String,
        tool_name: String,
    },

    #[serde(rename = "conversation.stream.tool_start")]
    ConversationStreamToolStart {
        session_id: String,
        call_id: String,
        tool_name: String,
        status: ToolCallStatus,
    },

    #[serde(rename = "conversation.stream.tool_result")]
    ConversationStreamToolResult {
        session_id: String,
        call_id: String,
        tool_name: String,
    },

    #[serde(rename = "conversation.stream.tool_error")]
    ConversationStreamToolError {
        session_id: String,
        call_id: String,
        error: String,
    },

    #[serde(rename = "conversation.complete")]
    ConversationComplete {
        user_id: String,
        session_id: String,
        turn_index: u64,
    },

    #[serde(rename = "conversation.error")]
    ConversationError {
        user_id: String,
        session_id: String,
        error_kind: String,
        message: String,
    },

    #[serde(rename = "tool.call.start")]
    ToolCallStart {
        user_id: String,
        call_id: String,
        tool_name: String,
    },

    #[serde(rename = "tool.call.result")]
    ToolCallResult {
        user_id: String,
        call_id: String,
        tool_name: String,
        duration_ms: u64,
    },

    #[serde(rename = "tool.call.error")]
    ToolCallError {
        user_id: String,
        call_id: String,
        tool_name: String,
        error_kind: String,
    },

    #[serde(rename = "memory.saved")]
    MemorySaved { user_id: String, fact_count: usize },

    #[serde(rename = "memory.recalled")]
    MemoryRecalled {
        user_id: String,
        session_id: String,
        snippet_count: usize,
    },

    #[serde(rename = "memory.cluster.done")]
    MemoryClusterDone { user_id: String, clusters: usize },

    #[serde(rename = "memory.summary.done")]
    MemorySummaryDone { user_id: String, summaries: usize },

    #[serde(rename = "config.changed")]
    ConfigChanged {
        user_id: Option<String>,
        changed_paths: Vec<String>,
    },

    #[serde(rename = "connection.bound")]
    ConnectionBound {
        connection_id: String,
        user_id: String,
        transport: String,
    },

    #[serde(rename = "connection.closed")]
    ConnectionClosed { connection_id: String },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::ChannelMessage { .. } => EventKind::ChannelMessage,
            EventPayload::ConversationStart { .. } => EventKind::ConversationStart,
            EventPayload::ConversationStreamText { .. } => EventKind::ConversationStreamText,
            EventPayload::ConversationStreamToolDetected { .. } => {
                EventKind::ConversationStreamToolDetected
            }
            EventPayload::ConversationStreamToolStart { .. } => {
                EventKind::ConversationStreamToolStart
            }
            EventPayload::ConversationStreamToolResult { .. } => {
                EventKind::ConversationStreamToolResult
            }
            EventPayload::ConversationStreamToolError { .. } => {
                EventKind::ConversationStreamToolError
            }
            EventPayload::ConversationComplete { .. } => EventKind::ConversationComplete,
            EventPayload::ConversationError { .. } => EventKind::ConversationError,
            EventPayload::ToolCallStart { .. } => EventKind::ToolCallStart,
            EventPayload::ToolCallResult { .. } => EventKind::ToolCallResult,
            EventPayload::ToolCallError { .. } => EventKind::ToolCallError,
            EventPayload::MemorySaved { .. } => EventKind::MemorySaved,
            EventPayload::MemoryRecalled { .. } => EventKind::MemoryRecalled,
            EventPayload::MemoryClusterDone { .. } => EventKind::MemoryClusterDone,
            EventPayload::MemorySummaryDone { .. } => EventKind::MemorySummaryDone,
            EventPayload::ConfigChanged { .. } => EventKind::ConfigChanged,
            EventPayload::ConnectionBound { .. } => EventKind::ConnectionBound,
            EventPayload::ConnectionClosed { .. } => EventKind::ConnectionClosed,
        }
    }
}

/// An event as delivered to subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    #[serde(flatten)]
    pub payload: EventPayload,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl Event {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            payload,
            timestamp: Utc::now(),
            correlation_id: None,
        }
    }

    pub fn with_correlation(payload: EventPayload, correlation_id: impl Into<String>) -> Self {
        Self {
            payload,
            timestamp: Utc::now(),
            correlation_id: Some(correlation_id.into()),
        }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_match_serde_tags() {
        let payload = EventPayload::MemoryClusterDone {
            user_id: "u1".into(),
            clusters: 3,
        };
        let json = serde_json::to_value(Event::new(payload)).unwrap();
        assert_eq!(json["type"], "memory.cluster.done");
    }

    #[test]
    fn kind_roundtrip_for_every_variant_name() {
        // Spot-check the dotted names stay aligned with the enumeration.
        assert_eq!(EventKind::ConversationStreamText.as_str(), "conversation.stream.text");
        assert_eq!(EventKind::ToolCallError.as_str(), "tool.call.error");
        assert_eq!(EventKind::ConnectionBound.as_str(), "connection.bound");
    }

    #[test]
    fn correlation_id_is_optional_on_the_wire() {
        let e = Event::new(EventPayload::ConnectionClosed {
            connection_id: "c1".into(),
        });
        let json = serde_json::to_value(&e).unwrap();
        assert!(json.get("correlation_id").is_none());

        let e = Event::with_correlation(
            EventPayload::ConnectionClosed {
                connection_id: "c1".into(),
            },
            "req-42",
        );
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["correlation_id"], "req-42");
    }
}
