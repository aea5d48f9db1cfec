use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Whatsapp,
    Messenger,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Whatsapp => "whatsapp",
            Channel::Messenger => "messenger",
        }
    }

    pub fn parse(value: &str) -> Option<Channel> {
        match value {
            "whatsapp" => Some(Channel::Whatsapp),
            "messenger" => Some(Channel::Messenger),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    Unassigned,
    AutomatedAssistant,
    PendingTeam,
    AssignedAgent,
    Archived,
}

impl ConversationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationState::Unassigned => "unassigned",
            ConversationState::AutomatedAssistant => "automated_assistant",
            ConversationState::PendingTeam => "pending_team",
            ConversationState::AssignedAgent => "assigned_agent",
            ConversationState::Archived => "archived",
        }
    }

    pub fn parse(value: &str) -> Option<ConversationState> {
        match value {
            "unassigned" => Some(ConversationState::Unassigned),
            "automated_assistant" => Some(ConversationState::AutomatedAssistant),
            "pending_team" => Some(ConversationState::PendingTeam),
            "assigned_agent" => Some(ConversationState::AssignedAgent),
            "archived" => Some(ConversationState::Archived),
            _ => None,
        }
    }

    // States in which an inbound message still triggers a routing decision.
    pub fn is_claimable(&self) -> bool {
        matches!(
            self,
            ConversationState::Unassigned | ConversationState::AutomatedAssistant
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }

    pub fn parse(value: &str) -> Option<Direction> {
        match value {
            "inbound" => Some(Direction::Inbound),
            "outbound" => Some(Direction::Outbound),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Received,
    SentToProvider,
    Delivered,
    Read,
    Error,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Received => "received",
            DeliveryStatus::SentToProvider => "sent_to_provider",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Read => "read",
            DeliveryStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<DeliveryStatus> {
        match value {
            "pending" => Some(DeliveryStatus::Pending),
            "received" => Some(DeliveryStatus::Received),
            "sent_to_provider" => Some(DeliveryStatus::SentToProvider),
            "delivered" => Some(DeliveryStatus::Delivered),
            "read" => Some(DeliveryStatus::Read),
            "error" => Some(DeliveryStatus::Error),
            _ => None,
        }
    }

    // Position in the per-message status lattice. `error` absorbs from any
    // state and is checked before rank comparison.
    pub fn rank(&self) -> u8 {
        match self {
            DeliveryStatus::Pending => 0,
            DeliveryStatus::Received | DeliveryStatus::SentToProvider => 1,
            DeliveryStatus::Delivered => 2,
            DeliveryStatus::Read => 3,
            DeliveryStatus::Error => 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub company_id: String,
    pub external_sender_id: String,
    pub sender_display_name: String,
    pub channel: Channel,
    pub state: ConversationState,
    pub assigned_agent_id: Option<String>,
    pub assigned_team_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub id: String,
    pub conversation_id: String,
    pub direction: Direction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_message_id: Option<String>,
    pub text: String,
    pub sender_id: String,
    pub sender_display_name: String,
    pub sent_at: String,
    pub delivery_status: DeliveryStatus,
    pub status_changed_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub id: String,
    pub company_id: String,
    pub external_sender_id: String,
    pub sender_display_name: String,
    pub channel: Channel,
    pub state: ConversationState,
    pub assigned_agent_id: Option<String>,
    pub assigned_team_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub last_message: Option<StoredMessage>,
    pub message_count: usize,
}

// Canonical inbound event, produced by a channel adapter from a raw webhook
// payload. `provider_message_id` is the dedup key for at-least-once delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundEvent {
    pub company_id: String,
    pub external_sender_id: String,
    pub sender_display_name: String,
    pub text: String,
    pub provider_message_id: String,
    pub channel: Channel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub channel: Channel,
    pub provider_message_id: String,
    pub new_status: DeliveryStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvisorOutcome {
    Answered {
        response_text: String,
        suggestions: Vec<String>,
    },
    Redirected {
        team_id: String,
        team_name: String,
    },
    Unresolved,
}

// Where a broadcast for a conversation should land, derived from its
// current assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    Company(String),
    Team(String),
    Agent(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundDisposition {
    Processed,
    Duplicate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentProfile {
    pub id: String,
    pub name: String,
    pub email: String,
    pub company_id: String,
    pub team_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamSummary {
    pub id: String,
    pub company_id: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct EventEnvelopeIn {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageBody {
    pub text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignBody {
    #[serde(default)]
    pub agent_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignTeamBody {
    pub team_id: String,
}

// Per-channel credentials resolved from the environment at startup.
#[derive(Debug, Clone, Default)]
pub struct ChannelConfig {
    pub access_token: String,
    pub phone_number_id: String,
    pub page_id: String,
    pub app_secret: String,
    pub verify_token: String,
    pub company_id: String,
}

pub type ChannelConfigs = HashMap<Channel, ChannelConfig>;
