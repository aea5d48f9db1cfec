use std::collections::HashMap;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;

use crate::error::{EngineError, EngineResult};
use crate::types::{Channel, ChannelConfig, DeliveryStatus, InboundEvent, StatusEvent};

const GRAPH_API_BASE: &str = "https://graph.facebook.com/v21.0";

/// One adapter per external channel. Normalizes that channel's webhook
/// payloads into canonical events and sends outbound text back through the
/// provider's API, returning the provider message id on success.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn channel(&self) -> Channel;

    /// Company that owns this channel's webhook endpoint.
    fn company_id(&self) -> &str;

    fn verify_signature(&self, signature_header: Option<&str>, body: &[u8]) -> bool;

    /// Meta-style GET handshake: echoes the challenge when mode and token
    /// match. Returns the challenge to echo, or None to reject.
    fn verify_handshake(&self, mode: &str, token: &str, challenge: &str) -> Option<String>;

    /// One webhook delivery can batch inbound messages and status updates;
    /// both come back in arrival order.
    fn parse_events(&self, payload: &Value) -> (Vec<InboundEvent>, Vec<StatusEvent>);

    async fn send(&self, recipient_external_id: &str, text: &str) -> EngineResult<String>;
}

pub fn normalize_phone(raw: &str) -> Option<String> {
    let digits = raw
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect::<String>();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}

fn verify_meta_signature(app_secret: &str, signature_header: Option<&str>, body: &[u8]) -> bool {
    if app_secret.is_empty() {
        return true;
    }
    let signature = signature_header.unwrap_or("").trim();
    let Some(signature) = signature.strip_prefix("sha256=") else {
        return false;
    };
    let signature = signature.trim();
    if signature.is_empty() {
        return false;
    }
    let Ok(signature_bytes) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(app_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature_bytes).is_ok()
}

fn meta_handshake(
    expected_token: &str,
    mode: &str,
    token: &str,
    challenge: &str,
) -> Option<String> {
    if mode == "subscribe"
        && !challenge.is_empty()
        && !expected_token.is_empty()
        && token == expected_token
    {
        Some(challenge.to_string())
    } else {
        None
    }
}

fn provider_status(raw: &str) -> Option<DeliveryStatus> {
    match raw {
        "sent" => Some(DeliveryStatus::SentToProvider),
        "delivered" => Some(DeliveryStatus::Delivered),
        "read" => Some(DeliveryStatus::Read),
        "failed" => Some(DeliveryStatus::Error),
        _ => None,
    }
}

async fn graph_send(
    client: &reqwest::Client,
    url: String,
    access_token: &str,
    payload: Value,
    extract_id: fn(&Value) -> Option<&str>,
) -> EngineResult<String> {
    let response = client
        .post(url)
        .bearer_auth(access_token)
        .json(&payload)
        .send()
        .await
        .map_err(|err| EngineError::ChannelSendFailed {
            status_code: 0,
            detail: err.to_string(),
        })?;

    let status = response.status();
    let body = response
        .json::<Value>()
        .await
        .unwrap_or_else(|_| json!({}));
    if !status.is_success() {
        return Err(EngineError::ChannelSendFailed {
            status_code: status.as_u16(),
            detail: body
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("provider rejected the message")
                .to_string(),
        });
    }

    let provider_id = extract_id(&body).unwrap_or("").to_string();
    if provider_id.is_empty() {
        return Err(EngineError::ChannelSendFailed {
            status_code: status.as_u16(),
            detail: "provider response had no message id".to_string(),
        });
    }
    Ok(provider_id)
}

pub struct WhatsAppAdapter {
    client: reqwest::Client,
    config: ChannelConfig,
}

impl WhatsAppAdapter {
    pub fn new(client: reqwest::Client, config: ChannelConfig) -> Self {
        Self { client, config }
    }

    fn contact_profile_names(value: &Value) -> HashMap<String, String> {
        let contacts = value
            .get("contacts")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let mut map = HashMap::new();
        for contact in contacts {
            let wa_id = contact
                .get("wa_id")
                .and_then(Value::as_str)
                .or_else(|| contact.get("input").and_then(Value::as_str))
                .unwrap_or("");
            let Some(digits) = normalize_phone(wa_id) else {
                continue;
            };
            let name = contact
                .get("profile")
                .and_then(|p| p.get("name"))
                .and_then(Value::as_str)
                .unwrap_or("")
                .trim()
                .to_string();
            map.insert(digits, name);
        }
        map
    }

    fn inbound_text(message: &Value) -> Option<String> {
        let msg_type = message
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_ascii_lowercase();
        let text = match msg_type.as_str() {
            "text" => message
                .get("text")
                .and_then(|v| v.get("body"))
                .and_then(Value::as_str),
            "button" => message
                .get("button")
                .and_then(|v| v.get("text"))
                .and_then(Value::as_str),
            "interactive" => message.get("interactive").and_then(|v| {
                v.get("button_reply")
                    .and_then(|r| r.get("title"))
                    .and_then(Value::as_str)
                    .or_else(|| {
                        v.get("list_reply")
                            .and_then(|r| r.get("title"))
                            .and_then(Value::as_str)
                    })
            }),
            _ => None,
        };
        let text = text.unwrap_or("").trim().to_string();
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }
}

#[async_trait]
impl ChannelAdapter for WhatsAppAdapter {
    fn channel(&self) -> Channel {
        Channel::Whatsapp
    }

    fn company_id(&self) -> &str {
        &self.config.company_id
    }

    fn verify_signature(&self, signature_header: Option<&str>, body: &[u8]) -> bool {
        verify_meta_signature(&self.config.app_secret, signature_header, body)
    }

    fn verify_handshake(&self, mode: &str, token: &str, challenge: &str) -> Option<String> {
        meta_handshake(&self.config.verify_token, mode, token, challenge)
    }

    fn parse_events(&self, payload: &Value) -> (Vec<InboundEvent>, Vec<StatusEvent>) {
        let mut inbound = Vec::new();
        let mut statuses = Vec::new();

        let entries = payload
            .get("entry")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for entry in entries {
            let changes = entry
                .get("changes")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for change in changes {
                let value = change.get("value").cloned().unwrap_or_else(|| json!({}));
                let metadata_phone_id = value
                    .get("metadata")
                    .and_then(|m| m.get("phone_number_id"))
                    .and_then(Value::as_str)
                    .unwrap_or("");
                if !self.config.phone_number_id.is_empty()
                    && !metadata_phone_id.is_empty()
                    && self.config.phone_number_id != metadata_phone_id
                {
                    continue;
                }

                let profile_names = Self::contact_profile_names(&value);

                let messages = value
                    .get("messages")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                for message in messages {
                    let from = message.get("from").and_then(Value::as_str).unwrap_or("");
                    let Some(phone) = normalize_phone(from) else {
                        continue;
                    };
                    let provider_message_id = message
                        .get("id")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string();
                    if provider_message_id.is_empty() {
                        continue;
                    }
                    let Some(text) = Self::inbound_text(&message) else {
                        continue;
                    };
                    let display_name = profile_names
                        .get(&phone)
                        .filter(|name| !name.is_empty())
                        .cloned()
                        .unwrap_or_else(|| phone.clone());
                    inbound.push(InboundEvent {
                        company_id: self.config.company_id.clone(),
                        external_sender_id: phone,
                        sender_display_name: display_name,
                        text,
                        provider_message_id,
                        channel: Channel::Whatsapp,
                    });
                }

                let status_items = value
                    .get("statuses")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                for item in status_items {
                    let provider_message_id = item
                        .get("id")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string();
                    let raw_status = item.get("status").and_then(Value::as_str).unwrap_or("");
                    let Some(new_status) = provider_status(raw_status) else {
                        continue;
                    };
                    if provider_message_id.is_empty() {
                        continue;
                    }
                    statuses.push(StatusEvent {
                        channel: Channel::Whatsapp,
                        provider_message_id,
                        new_status,
                    });
                }
            }
        }

        (inbound, statuses)
    }

    async fn send(&self, recipient_external_id: &str, text: &str) -> EngineResult<String> {
        if self.config.access_token.is_empty() || self.config.phone_number_id.is_empty() {
            return Err(EngineError::ChannelSendFailed {
                status_code: 0,
                detail: "missing whatsapp accessToken or phoneNumberId".to_string(),
            });
        }
        let payload = json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": recipient_external_id,
            "type": "text",
            "text": { "preview_url": false, "body": text },
        });
        graph_send(
            &self.client,
            format!("{GRAPH_API_BASE}/{}/messages", self.config.phone_number_id),
            &self.config.access_token,
            payload,
            |body| {
                body.get("messages")
                    .and_then(Value::as_array)
                    .and_then(|messages| messages.first())
                    .and_then(|message| message.get("id"))
                    .and_then(Value::as_str)
            },
        )
        .await
    }
}

pub struct MessengerAdapter {
    client: reqwest::Client,
    config: ChannelConfig,
}

impl MessengerAdapter {
    pub fn new(client: reqwest::Client, config: ChannelConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl ChannelAdapter for MessengerAdapter {
    fn channel(&self) -> Channel {
        Channel::Messenger
    }

    fn company_id(&self) -> &str {
        &self.config.company_id
    }

    fn verify_signature(&self, signature_header: Option<&str>, body: &[u8]) -> bool {
        verify_meta_signature(&self.config.app_secret, signature_header, body)
    }

    fn verify_handshake(&self, mode: &str, token: &str, challenge: &str) -> Option<String> {
        meta_handshake(&self.config.verify_token, mode, token, challenge)
    }

    fn parse_events(&self, payload: &Value) -> (Vec<InboundEvent>, Vec<StatusEvent>) {
        let mut inbound = Vec::new();
        let mut statuses = Vec::new();

        let entries = payload
            .get("entry")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for entry in entries {
            let messaging = entry
                .get("messaging")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for item in messaging {
                let sender_id = item
                    .get("sender")
                    .and_then(|s| s.get("id"))
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();

                if let Some(message) = item.get("message") {
                    // Echoes are our own outbound messages reflected back.
                    if message
                        .get("is_echo")
                        .and_then(Value::as_bool)
                        .unwrap_or(false)
                    {
                        continue;
                    }
                    let provider_message_id = message
                        .get("mid")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string();
                    let text = message
                        .get("text")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .trim()
                        .to_string();
                    if sender_id.is_empty() || provider_message_id.is_empty() || text.is_empty() {
                        continue;
                    }
                    inbound.push(InboundEvent {
                        company_id: self.config.company_id.clone(),
                        external_sender_id: sender_id.clone(),
                        sender_display_name: sender_id.clone(),
                        text,
                        provider_message_id,
                        channel: Channel::Messenger,
                    });
                }

                if let Some(delivery) = item.get("delivery") {
                    let mids = delivery
                        .get("mids")
                        .and_then(Value::as_array)
                        .cloned()
                        .unwrap_or_default();
                    for mid in mids {
                        let Some(mid) = mid.as_str().filter(|m| !m.is_empty()) else {
                            continue;
                        };
                        statuses.push(StatusEvent {
                            channel: Channel::Messenger,
                            provider_message_id: mid.to_string(),
                            new_status: DeliveryStatus::Delivered,
                        });
                    }
                }
            }
        }

        (inbound, statuses)
    }

    async fn send(&self, recipient_external_id: &str, text: &str) -> EngineResult<String> {
        if self.config.access_token.is_empty() {
            return Err(EngineError::ChannelSendFailed {
                status_code: 0,
                detail: "missing messenger accessToken".to_string(),
            });
        }
        let payload = json!({
            "recipient": { "id": recipient_external_id },
            "messaging_type": "RESPONSE",
            "message": { "text": text },
        });
        let page = if self.config.page_id.is_empty() {
            "me"
        } else {
            &self.config.page_id
        };
        graph_send(
            &self.client,
            format!("{GRAPH_API_BASE}/{page}/messages"),
            &self.config.access_token,
            payload,
            |body| body.get("message_id").and_then(Value::as_str),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn whatsapp_adapter() -> WhatsAppAdapter {
        WhatsAppAdapter::new(
            reqwest::Client::new(),
            ChannelConfig {
                app_secret: "secret".to_string(),
                verify_token: "tok".to_string(),
                phone_number_id: "pn1".to_string(),
                company_id: "c1".to_string(),
                ..Default::default()
            },
        )
    }

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn signature_round_trip() {
        let adapter = whatsapp_adapter();
        let body = br#"{"entry":[]}"#;
        let header = sign("secret", body);
        assert!(adapter.verify_signature(Some(&header), body));
        assert!(!adapter.verify_signature(Some("sha256=deadbeef"), body));
        assert!(!adapter.verify_signature(None, body));
        assert!(!adapter.verify_signature(Some("not-prefixed"), body));
    }

    #[test]
    fn handshake_echoes_challenge_on_match() {
        let adapter = whatsapp_adapter();
        assert_eq!(
            adapter.verify_handshake("subscribe", "tok", "challenge-123"),
            Some("challenge-123".to_string())
        );
        assert_eq!(adapter.verify_handshake("subscribe", "wrong", "c"), None);
        assert_eq!(adapter.verify_handshake("unsubscribe", "tok", "c"), None);
    }

    #[test]
    fn whatsapp_payload_parses_messages_and_statuses() {
        let adapter = whatsapp_adapter();
        let payload = serde_json::json!({
            "entry": [{
                "changes": [{
                    "value": {
                        "metadata": { "phone_number_id": "pn1" },
                        "contacts": [{ "wa_id": "15551234567", "profile": { "name": "U One" } }],
                        "messages": [{
                            "from": "+1 555 123 4567",
                            "id": "wamid.m1",
                            "type": "text",
                            "text": { "body": "hello" }
                        }],
                        "statuses": [{ "id": "wamid.out1", "status": "delivered" }]
                    }
                }]
            }]
        });
        let (inbound, statuses) = adapter.parse_events(&payload);
        assert_eq!(inbound.len(), 1);
        assert_eq!(inbound[0].external_sender_id, "15551234567");
        assert_eq!(inbound[0].sender_display_name, "U One");
        assert_eq!(inbound[0].provider_message_id, "wamid.m1");
        assert_eq!(inbound[0].text, "hello");
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].new_status, DeliveryStatus::Delivered);
    }

    #[test]
    fn whatsapp_skips_other_phone_numbers_and_non_text() {
        let adapter = whatsapp_adapter();
        let payload = serde_json::json!({
            "entry": [{
                "changes": [
                    {
                        "value": {
                            "metadata": { "phone_number_id": "other" },
                            "messages": [{ "from": "1", "id": "m", "type": "text", "text": { "body": "x" } }]
                        }
                    },
                    {
                        "value": {
                            "metadata": { "phone_number_id": "pn1" },
                            "messages": [{ "from": "1555", "id": "m2", "type": "image" }]
                        }
                    }
                ]
            }]
        });
        let (inbound, statuses) = adapter.parse_events(&payload);
        assert!(inbound.is_empty());
        assert!(statuses.is_empty());
    }

    #[test]
    fn whatsapp_interactive_reply_uses_title() {
        let adapter = whatsapp_adapter();
        let payload = serde_json::json!({
            "entry": [{ "changes": [{ "value": {
                "metadata": { "phone_number_id": "pn1" },
                "messages": [{
                    "from": "1555",
                    "id": "m3",
                    "type": "interactive",
                    "interactive": { "button_reply": { "id": "b1", "title": "Track order" } }
                }]
            }}]}]
        });
        let (inbound, _) = adapter.parse_events(&payload);
        assert_eq!(inbound.len(), 1);
        assert_eq!(inbound[0].text, "Track order");
    }

    #[test]
    fn messenger_payload_parses_messages_and_delivery() {
        let adapter = MessengerAdapter::new(
            reqwest::Client::new(),
            ChannelConfig {
                company_id: "c1".to_string(),
                ..Default::default()
            },
        );
        let payload = serde_json::json!({
            "entry": [{
                "messaging": [
                    {
                        "sender": { "id": "psid-1" },
                        "message": { "mid": "mid.1", "text": "hi there" }
                    },
                    {
                        "sender": { "id": "psid-1" },
                        "message": { "mid": "mid.echo", "text": "echo", "is_echo": true }
                    },
                    {
                        "sender": { "id": "psid-1" },
                        "delivery": { "mids": ["mid.out1", "mid.out2"] }
                    }
                ]
            }]
        });
        let (inbound, statuses) = adapter.parse_events(&payload);
        assert_eq!(inbound.len(), 1);
        assert_eq!(inbound[0].channel, Channel::Messenger);
        assert_eq!(inbound[0].provider_message_id, "mid.1");
        assert_eq!(statuses.len(), 2);
        assert!(statuses
            .iter()
            .all(|s| s.new_status == DeliveryStatus::Delivered));
    }

    #[test]
    fn unknown_status_values_are_dropped() {
        assert_eq!(provider_status("sent"), Some(DeliveryStatus::SentToProvider));
        assert_eq!(provider_status("read"), Some(DeliveryStatus::Read));
        assert_eq!(provider_status("failed"), Some(DeliveryStatus::Error));
        assert_eq!(provider_status("warmup"), None);
    }
}
