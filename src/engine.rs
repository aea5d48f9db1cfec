use std::{collections::HashMap, sync::Arc, time::Duration};

use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::advisor::AutomatedAnswerAdvisor;
use crate::broadcast::RealtimeBroadcaster;
use crate::channel::ChannelAdapter;
use crate::error::{EngineError, EngineResult};
use crate::store::{now_iso, ConversationStore};
use crate::types::{
    AdvisorOutcome, Audience, Channel, Conversation, ConversationState, DeliveryStatus, Direction,
    InboundDisposition, InboundEvent, StoredMessage,
};

/// How many prior messages the advisor sees, oldest first.
const ADVISOR_HISTORY_LIMIT: usize = 14;

pub const ASSISTANT_SENDER_ID: &str = "assistant";
pub const SYSTEM_SENDER_ID: &str = "system";

/// Orchestrates inbound routing, outbound dispatch, and status reconciliation.
///
/// Concurrency: one async mutex per conversation serializes all state
/// mutations and message appends within it; work on different conversations
/// never contends. The advisor call and the provider send are the only
/// awaits that block on external I/O, both bounded by timeouts.
pub struct RoutingEngine {
    store: Arc<dyn ConversationStore>,
    advisor: Arc<dyn AutomatedAnswerAdvisor>,
    broadcaster: Arc<dyn RealtimeBroadcaster>,
    adapters: HashMap<Channel, Arc<dyn ChannelAdapter>>,
    conversation_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    send_timeout: Duration,
}

impl RoutingEngine {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        advisor: Arc<dyn AutomatedAnswerAdvisor>,
        broadcaster: Arc<dyn RealtimeBroadcaster>,
        adapters: HashMap<Channel, Arc<dyn ChannelAdapter>>,
        send_timeout: Duration,
    ) -> Self {
        Self {
            store,
            advisor,
            broadcaster,
            adapters,
            conversation_locks: Mutex::new(HashMap::new()),
            send_timeout,
        }
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    async fn lock_for(&self, conversation_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.conversation_locks.lock().await;
        // Entries nobody holds anymore (strong count 1: the map's own Arc)
        // are dead weight; sweep them so the map tracks live conversations,
        // not every conversation ever touched.
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn adapter_for(&self, channel: Channel) -> EngineResult<Arc<dyn ChannelAdapter>> {
        self.adapters
            .get(&channel)
            .cloned()
            .ok_or(EngineError::ChannelNotConfigured {
                channel: channel.as_str(),
            })
    }

    fn audience_for(conversation: &Conversation) -> Audience {
        match (
            conversation.state,
            &conversation.assigned_agent_id,
            &conversation.assigned_team_id,
        ) {
            (ConversationState::AssignedAgent, Some(agent_id), _) => {
                Audience::Agent(agent_id.clone())
            }
            (ConversationState::PendingTeam, _, Some(team_id)) => Audience::Team(team_id.clone()),
            _ => Audience::Company(conversation.company_id.clone()),
        }
    }

    async fn push(&self, audience: &Audience, event: &str, data: serde_json::Value) {
        match audience {
            Audience::Company(company_id) => {
                self.broadcaster.push_to_company(company_id, event, data).await
            }
            Audience::Team(team_id) => self.broadcaster.push_to_team(team_id, event, data).await,
            Audience::Agent(agent_id) => {
                self.broadcaster.push_to_agent(agent_id, event, data).await
            }
        }
    }

    async fn push_message(&self, conversation: &Conversation, message: &StoredMessage) {
        let audience = Self::audience_for(conversation);
        self.push(
            &audience,
            "message:new",
            json!({ "message": message, "conversation": conversation }),
        )
        .await;
    }

    async fn push_conversation_update(&self, conversation: &Conversation) {
        // Assignment and lifecycle changes go company-wide so every inbox
        // view stays consistent, not just the new owner's.
        self.broadcaster
            .push_to_company(
                &conversation.company_id,
                "conversation:update",
                json!({ "conversation": conversation }),
            )
            .await;
    }

    fn new_message(
        conversation_id: &str,
        direction: Direction,
        provider_message_id: Option<String>,
        text: &str,
        sender_id: &str,
        sender_display_name: &str,
        delivery_status: DeliveryStatus,
    ) -> StoredMessage {
        let now = now_iso();
        StoredMessage {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            direction,
            provider_message_id,
            text: text.to_string(),
            sender_id: sender_id.to_string(),
            sender_display_name: sender_display_name.to_string(),
            sent_at: now.clone(),
            delivery_status,
            status_changed_at: now,
        }
    }

    /// Inbound path. Webhooks deliver at least once, so the provider-id
    /// dedup check is mandatory; a duplicate returns success with no side
    /// effects at all.
    pub async fn process_inbound(
        &self,
        event: InboundEvent,
    ) -> EngineResult<InboundDisposition> {
        // Fast dedup before touching the conversation at all. A redelivery
        // after archive must not conjure a fresh empty conversation just to
        // discover the message was already stored. Racing first deliveries
        // can both pass this check; the re-check under the lock below is the
        // one that decides.
        if self
            .store
            .find_message_by_provider_id(event.channel, &event.provider_message_id)
            .await?
            .is_some()
        {
            debug!(
                provider_message_id = %event.provider_message_id,
                channel = event.channel.as_str(),
                "duplicate inbound event ignored"
            );
            return Ok(InboundDisposition::Duplicate);
        }

        // Re-reading under the lock matters twice over: assignment may have
        // changed since the find-or-create, and an archive racing in means
        // the sender needs a fresh conversation (and its lock) after all.
        let (mut conversation, _guard) = loop {
            let candidate = self
                .store
                .find_or_create_conversation(
                    &event.company_id,
                    &event.external_sender_id,
                    &event.sender_display_name,
                    event.channel,
                )
                .await?;
            let lock = self.lock_for(&candidate.id).await;
            let guard = lock.lock_owned().await;
            let current = self.store.get_conversation(&candidate.id).await?;
            if current.state != ConversationState::Archived {
                break (current, guard);
            }
        };

        if self
            .store
            .find_message_by_provider_id(event.channel, &event.provider_message_id)
            .await?
            .is_some()
        {
            debug!(
                provider_message_id = %event.provider_message_id,
                channel = event.channel.as_str(),
                "duplicate inbound event ignored"
            );
            return Ok(InboundDisposition::Duplicate);
        }

        let inbound = self
            .store
            .append_message(Self::new_message(
                &conversation.id,
                Direction::Inbound,
                Some(event.provider_message_id.clone()),
                &event.text,
                &event.external_sender_id,
                &event.sender_display_name,
                DeliveryStatus::Received,
            ))
            .await?;

        if conversation.state.is_claimable() {
            conversation = self.route_unassigned(conversation, &event).await?;
        }

        self.push_message(&conversation, &inbound).await;
        Ok(InboundDisposition::Processed)
    }

    /// Routing decision for a conversation no human owns yet. Advisor
    /// failures degrade to "leave unassigned"; they never fail ingestion.
    async fn route_unassigned(
        &self,
        conversation: Conversation,
        event: &InboundEvent,
    ) -> EngineResult<Conversation> {
        let history = self
            .store
            .get_recent_messages(&conversation.id, ADVISOR_HISTORY_LIMIT)
            .await?;
        let outcome = self
            .advisor
            .ask(
                &conversation.company_id,
                &conversation.id,
                &event.text,
                &history,
            )
            .await;

        match outcome {
            AdvisorOutcome::Redirected { team_id, team_name } => {
                info!(
                    conversation_id = %conversation.id,
                    team_id = %team_id,
                    "advisor redirected conversation to team"
                );
                let updated = self
                    .store
                    .update_conversation_state(
                        &conversation.id,
                        ConversationState::PendingTeam,
                        None,
                        Some(&team_id),
                    )
                    .await?;
                let label = if team_name.is_empty() {
                    team_id.clone()
                } else {
                    team_name
                };
                let notice = self
                    .store
                    .append_message(Self::new_message(
                        &updated.id,
                        Direction::Outbound,
                        None,
                        &format!("Conversation redirected to the {label} team"),
                        SYSTEM_SENDER_ID,
                        "System",
                        DeliveryStatus::Received,
                    ))
                    .await?;
                self.broadcaster
                    .push_to_team(
                        &team_id,
                        "message:new",
                        json!({ "message": notice, "conversation": updated }),
                    )
                    .await;
                self.push_conversation_update(&updated).await;
                Ok(updated)
            }
            AdvisorOutcome::Answered {
                response_text,
                suggestions: _,
            } => {
                info!(conversation_id = %conversation.id, "advisor answered");
                let updated = self
                    .store
                    .update_conversation_state(
                        &conversation.id,
                        ConversationState::AutomatedAssistant,
                        None,
                        None,
                    )
                    .await?;
                // The reply rides the normal outbound path; a send failure
                // leaves the message in error for the inbox to surface, but
                // never fails the webhook.
                if let Err(err) = self
                    .dispatch_outbound(&updated, &response_text, ASSISTANT_SENDER_ID, "Assistant")
                    .await
                {
                    warn!(
                        conversation_id = %updated.id,
                        error = %err,
                        "automated reply dispatch failed"
                    );
                }
                self.push_conversation_update(&updated).await;
                Ok(updated)
            }
            AdvisorOutcome::Unresolved => {
                debug!(
                    conversation_id = %conversation.id,
                    "advisor declined; conversation left unassigned"
                );
                Ok(conversation)
            }
        }
    }

    /// Outbound path shared by agent sends and automated replies: persist
    /// first with `Pending`, then hand to the provider. A timed-out send
    /// stays `Pending` for status reconciliation; a rejected one goes to
    /// `Error`. No auto-retry either way, since the provider may have
    /// received the first attempt.
    async fn dispatch_outbound(
        &self,
        conversation: &Conversation,
        text: &str,
        sender_id: &str,
        sender_display_name: &str,
    ) -> EngineResult<StoredMessage> {
        let adapter = self.adapter_for(conversation.channel)?;
        let pending = self
            .store
            .append_message(Self::new_message(
                &conversation.id,
                Direction::Outbound,
                None,
                text,
                sender_id,
                sender_display_name,
                DeliveryStatus::Pending,
            ))
            .await?;

        let send = adapter.send(&conversation.external_sender_id, text);
        let message = match tokio::time::timeout(self.send_timeout, send).await {
            Ok(Ok(provider_message_id)) => {
                self.store
                    .update_message_delivery(
                        &pending.id,
                        Some(&provider_message_id),
                        DeliveryStatus::SentToProvider,
                    )
                    .await?
            }
            Ok(Err(err)) => {
                let failed = self
                    .store
                    .update_message_delivery(&pending.id, None, DeliveryStatus::Error)
                    .await?;
                self.push_message(conversation, &failed).await;
                return Err(err);
            }
            Err(_) => {
                // Provider may have received it; leave Pending and let a
                // later status webhook settle the question.
                self.push_message(conversation, &pending).await;
                return Err(EngineError::ChannelSendFailed {
                    status_code: 0,
                    detail: "send timed out; delivery left pending".to_string(),
                });
            }
        };

        self.push_message(conversation, &message).await;
        Ok(message)
    }

    pub async fn send_message(
        &self,
        conversation_id: &str,
        text: &str,
        sender_agent_id: &str,
        sender_display_name: &str,
    ) -> EngineResult<StoredMessage> {
        let lock = self.lock_for(conversation_id).await;
        let _guard = lock.lock().await;

        let conversation = self.store.get_conversation(conversation_id).await?;
        if conversation.state == ConversationState::Archived {
            return Err(EngineError::ConversationClosed {
                conversation_id: conversation_id.to_string(),
            });
        }

        self.dispatch_outbound(&conversation, text, sender_agent_id, sender_display_name)
            .await
    }

    /// Status updates arrive out of order and for messages we never tracked;
    /// unknown ids are dropped, and a regressed status never overwrites a
    /// later one. `Error` absorbs from any state.
    pub async fn process_status_update(
        &self,
        channel: Channel,
        provider_message_id: &str,
        new_status: DeliveryStatus,
    ) -> EngineResult<()> {
        let Some(message) = self
            .store
            .find_message_by_provider_id(channel, provider_message_id)
            .await?
        else {
            debug!(
                provider_message_id,
                channel = channel.as_str(),
                "status update for unknown message ignored"
            );
            return Ok(());
        };

        let lock = self.lock_for(&message.conversation_id).await;
        let _guard = lock.lock().await;

        // Re-read under the lock; another status event may have advanced it.
        let Some(message) = self
            .store
            .find_message_by_provider_id(channel, provider_message_id)
            .await?
        else {
            return Ok(());
        };

        let current = message.delivery_status;
        let applies = new_status == DeliveryStatus::Error
            || (current != DeliveryStatus::Error && new_status.rank() > current.rank());
        if !applies {
            debug!(
                provider_message_id,
                current = current.as_str(),
                incoming = new_status.as_str(),
                "stale status update ignored"
            );
            return Ok(());
        }

        let updated = self
            .store
            .update_message_delivery(&message.id, None, new_status)
            .await?;
        let conversation = self.store.get_conversation(&updated.conversation_id).await?;
        let audience = Self::audience_for(&conversation);
        self.push(
            &audience,
            "message:status",
            json!({
                "conversationId": updated.conversation_id,
                "messageId": updated.id,
                "deliveryStatus": updated.delivery_status,
                "statusChangedAt": updated.status_changed_at,
            }),
        )
        .await;
        Ok(())
    }

    /// First writer wins; the losing claim surfaces
    /// `ConversationAlreadyAssigned` to its caller.
    pub async fn assign_conversation(
        &self,
        conversation_id: &str,
        agent_id: &str,
    ) -> EngineResult<Conversation> {
        let lock = self.lock_for(conversation_id).await;
        let _guard = lock.lock().await;

        let conversation = self.store.try_claim_for_agent(conversation_id, agent_id).await?;
        info!(conversation_id, agent_id, "conversation assigned to agent");
        self.push_conversation_update(&conversation).await;
        Ok(conversation)
    }

    pub async fn assign_team(
        &self,
        conversation_id: &str,
        team_id: &str,
    ) -> EngineResult<Conversation> {
        let lock = self.lock_for(conversation_id).await;
        let _guard = lock.lock().await;

        let current = self.store.get_conversation(conversation_id).await?;
        if current.state == ConversationState::Archived {
            return Err(EngineError::ConversationClosed {
                conversation_id: conversation_id.to_string(),
            });
        }
        let conversation = self
            .store
            .update_conversation_state(
                conversation_id,
                ConversationState::PendingTeam,
                None,
                Some(team_id),
            )
            .await?;
        info!(conversation_id, team_id, "conversation assigned to team");
        self.broadcaster
            .push_to_team(
                team_id,
                "conversation:update",
                json!({ "conversation": conversation }),
            )
            .await;
        self.push_conversation_update(&conversation).await;
        Ok(conversation)
    }

    pub async fn unassign_conversation(
        &self,
        conversation_id: &str,
    ) -> EngineResult<Conversation> {
        let lock = self.lock_for(conversation_id).await;
        let _guard = lock.lock().await;

        let current = self.store.get_conversation(conversation_id).await?;
        if current.state == ConversationState::Archived {
            return Err(EngineError::ConversationClosed {
                conversation_id: conversation_id.to_string(),
            });
        }
        let conversation = self
            .store
            .update_conversation_state(conversation_id, ConversationState::Unassigned, None, None)
            .await?;
        self.push_conversation_update(&conversation).await;
        Ok(conversation)
    }

    /// Terminal transition. The next inbound from this sender opens a fresh
    /// conversation; archived ones are never reopened.
    pub async fn archive_conversation(
        &self,
        conversation_id: &str,
    ) -> EngineResult<Conversation> {
        let lock = self.lock_for(conversation_id).await;
        let _guard = lock.lock().await;

        let current = self.store.get_conversation(conversation_id).await?;
        if current.state == ConversationState::Archived {
            return Ok(current);
        }
        let conversation = self
            .store
            .update_conversation_state(conversation_id, ConversationState::Archived, None, None)
            .await?;
        info!(conversation_id, "conversation archived");
        self.push_conversation_update(&conversation).await;
        Ok(conversation)
    }
}
