use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::warn;

use crate::prompting::{render_system_prompt, SystemPromptContext};
use crate::store::AgentDirectory;
use crate::types::{AdvisorOutcome, Direction, StoredMessage};

/// Opaque, possibly-slow, possibly-failing oracle consulted for unassigned
/// conversations. Failures and timeouts collapse to `Unresolved`; routing
/// then degrades to "leave unassigned" rather than retrying.
#[async_trait]
pub trait AutomatedAnswerAdvisor: Send + Sync {
    async fn ask(
        &self,
        company_id: &str,
        conversation_id: &str,
        question: &str,
        history: &[StoredMessage],
    ) -> AdvisorOutcome;
}

pub struct OpenAiAdvisor {
    client: reqwest::Client,
    directory: Arc<dyn AgentDirectory>,
    api_key: String,
    model: String,
    bot_name: String,
    timeout: Duration,
}

impl OpenAiAdvisor {
    pub fn new(
        client: reqwest::Client,
        directory: Arc<dyn AgentDirectory>,
        api_key: String,
        model: String,
        bot_name: String,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            directory,
            api_key,
            model,
            bot_name,
            timeout,
        }
    }

    async fn chat_completion_text(&self, system: &str, user: &str) -> Result<String, String> {
        if self.api_key.trim().is_empty() {
            return Err("OPENAI_API_KEY not configured".to_string());
        }
        let response = self
            .client
            .post("https://api.openai.com/v1/chat/completions")
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "messages": [
                    { "role": "system", "content": system },
                    { "role": "user", "content": user }
                ],
                "temperature": 0.1
            }))
            .send()
            .await
            .map_err(|err| format!("openai request failed: {err}"))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(format!("openai returned {status}: {body}"));
        }
        let payload = response
            .json::<Value>()
            .await
            .map_err(|err| format!("openai parse failed: {err}"))?;
        let text = payload
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|msg| msg.get("content"))
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or("")
            .to_string();
        if text.is_empty() {
            return Err("openai response had empty content".to_string());
        }
        Ok(text)
    }
}

pub fn transcript_block(history: &[StoredMessage]) -> String {
    let mut lines = Vec::with_capacity(history.len());
    for message in history {
        let speaker = match message.direction {
            Direction::Inbound => "Customer",
            Direction::Outbound => "Agent",
        };
        lines.push(format!("{speaker}: {}", message.text));
    }
    lines.join("\n")
}

/// Models emit the decision JSON bare, fenced, or buried in prose. Try each
/// shape in order; the first candidate that parses and carries a usable
/// decision wins. Redirect beats answer when one payload holds both.
pub fn parse_advisor_outcome(raw: &str) -> Option<AdvisorOutcome> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let mut candidates = Vec::<String>::new();
    candidates.push(trimmed.to_string());

    if trimmed.starts_with("```") {
        let stripped = trimmed
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim()
            .to_string();
        if !stripped.is_empty() {
            candidates.push(stripped);
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if end > start {
            candidates.push(trimmed[start..=end].to_string());
        }
    }

    for candidate in candidates {
        let Ok(parsed) = serde_json::from_str::<Value>(&candidate) else {
            continue;
        };

        let team_id = parsed
            .get("redirectTeamId")
            .or_else(|| parsed.get("redirect_team_id"))
            .and_then(Value::as_str)
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty());
        if let Some(team_id) = team_id {
            let team_name = parsed
                .get("redirectTeamName")
                .or_else(|| parsed.get("redirect_team_name"))
                .and_then(Value::as_str)
                .map(|text| text.trim().to_string())
                .unwrap_or_default();
            return Some(AdvisorOutcome::Redirected { team_id, team_name });
        }

        let answered = parsed
            .get("answered")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        let reply = parsed
            .get("reply")
            .and_then(Value::as_str)
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty());
        if let (true, Some(reply)) = (answered, reply) {
            let suggestions = parsed
                .get("suggestions")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(|text| text.trim().to_string())
                        .filter(|text| !text.is_empty())
                        .take(6)
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            return Some(AdvisorOutcome::Answered {
                response_text: reply,
                suggestions,
            });
        }

        return Some(AdvisorOutcome::Unresolved);
    }

    None
}

#[async_trait]
impl AutomatedAnswerAdvisor for OpenAiAdvisor {
    async fn ask(
        &self,
        company_id: &str,
        conversation_id: &str,
        question: &str,
        history: &[StoredMessage],
    ) -> AdvisorOutcome {
        let teams = match self.directory.list_teams(company_id).await {
            Ok(teams) => teams,
            Err(err) => {
                warn!(company_id, error = %err, "team lookup for advisor failed");
                Vec::new()
            }
        };
        let teams_block = teams
            .iter()
            .map(|team| format!("- {} (id: {})", team.name, team.id))
            .collect::<Vec<_>>()
            .join("\n");

        let system = render_system_prompt(&SystemPromptContext {
            company_name: company_id,
            bot_name: &self.bot_name,
            teams_block: &teams_block,
        });
        let user = format!(
            "Conversation so far:\n{}\n\nCustomer question:\n{}",
            transcript_block(history),
            question
        );

        let request = self.chat_completion_text(&system, &user);
        let raw = match tokio::time::timeout(self.timeout, request).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(err)) => {
                warn!(conversation_id, error = %err, "advisor call failed");
                return AdvisorOutcome::Unresolved;
            }
            Err(_) => {
                warn!(conversation_id, "advisor call timed out");
                return AdvisorOutcome::Unresolved;
            }
        };

        match parse_advisor_outcome(&raw) {
            Some(outcome) => outcome,
            None => {
                warn!(conversation_id, "advisor output was not parseable");
                AdvisorOutcome::Unresolved
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_json_answer() {
        let outcome = parse_advisor_outcome(
            r#"{"answered": true, "reply": "You're welcome", "suggestions": ["Anything else?"]}"#,
        )
        .unwrap();
        assert_eq!(
            outcome,
            AdvisorOutcome::Answered {
                response_text: "You're welcome".to_string(),
                suggestions: vec!["Anything else?".to_string()],
            }
        );
    }

    #[test]
    fn parses_fenced_json() {
        let raw = "```json\n{\"answered\": true, \"reply\": \"hi\"}\n```";
        let outcome = parse_advisor_outcome(raw).unwrap();
        assert!(matches!(outcome, AdvisorOutcome::Answered { .. }));
    }

    #[test]
    fn parses_json_embedded_in_prose() {
        let raw = "Here is my decision: {\"answered\": false, \"reply\": \"\"} hope that helps";
        let outcome = parse_advisor_outcome(raw).unwrap();
        assert_eq!(outcome, AdvisorOutcome::Unresolved);
    }

    #[test]
    fn redirect_beats_answer_in_one_payload() {
        let raw = r#"{"answered": true, "reply": "Billing handles this", "redirectTeamId": "t1", "redirectTeamName": "Billing"}"#;
        let outcome = parse_advisor_outcome(raw).unwrap();
        assert_eq!(
            outcome,
            AdvisorOutcome::Redirected {
                team_id: "t1".to_string(),
                team_name: "Billing".to_string(),
            }
        );
    }

    #[test]
    fn declined_answer_is_unresolved() {
        let outcome = parse_advisor_outcome(r#"{"answered": false, "reply": ""}"#).unwrap();
        assert_eq!(outcome, AdvisorOutcome::Unresolved);
    }

    #[test]
    fn garbage_is_none() {
        assert!(parse_advisor_outcome("").is_none());
        assert!(parse_advisor_outcome("no json here").is_none());
    }

    #[test]
    fn transcript_labels_directions() {
        use crate::store::now_iso;
        let history = vec![
            StoredMessage {
                id: "1".to_string(),
                conversation_id: "c".to_string(),
                direction: Direction::Inbound,
                provider_message_id: None,
                text: "hello".to_string(),
                sender_id: "u1".to_string(),
                sender_display_name: "U".to_string(),
                sent_at: now_iso(),
                delivery_status: crate::types::DeliveryStatus::Received,
                status_changed_at: now_iso(),
            },
            StoredMessage {
                id: "2".to_string(),
                conversation_id: "c".to_string(),
                direction: Direction::Outbound,
                provider_message_id: None,
                text: "hi there".to_string(),
                sender_id: "bot".to_string(),
                sender_display_name: "Bot".to_string(),
                sent_at: now_iso(),
                delivery_status: crate::types::DeliveryStatus::SentToProvider,
                status_changed_at: now_iso(),
            },
        ];
        assert_eq!(transcript_block(&history), "Customer: hello\nAgent: hi there");
    }
}
