use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use serde_json::json;
use tracing::{info, instrument, warn};
use trustroute_core::{
    classify_intent_rules, compose_chat_reply, describe_rules, detect_locale, needs_clarification,
    normalize_text, AssistantContext, AssistantReply, BookingContextItem, BookingDetails,
    ChatInput, ChatMessage, ChatRole, ConversationSession, ConversationTurn, Intent, Locale, User,
};
use trustroute_observability::AppMetrics;
use trustroute_storage::{BookingRepository, ConversationRepository};
use uuid::Uuid;

pub const FALLBACK_POLICY_TEXT: &str = "Refund Policy: 95% refund if >24hrs, 75% if 12-24hrs, 50% if 3-12hrs, 0% if <3hrs. Timeline: 1-2 days processing, 3-5 days credit.";

const MAX_TURNS: usize = 40;
const MAX_HISTORY_MESSAGES: usize = 20;
const CONVERSATION_TTL_HOURS: i64 = 24;

/// A chat model that may answer instead of the rule-based reply.
///
/// `Ok(None)` means "not configured"; errors are logged and treated the same way.
///
/// The returned future must be `Send`; axum handlers await it on worker threads.
pub trait CompletionBackend: Send + Sync {
    fn complete(
        &self,
        system_prompt: &str,
        messages: &[ChatMessage],
    ) -> impl Future<Output = Result<Option<String>>> + Send;
}

/// Always defers to the deterministic reply.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCompletion;

impl CompletionBackend for NoCompletion {
    async fn complete(&self, _: &str, _: &[ChatMessage]) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Reads the refund policy document, falling back to the built-in summary
/// when no path is configured or the file cannot be read.
pub fn load_policy_document(path: Option<&Path>) -> String {
    let Some(path) = path else {
        return FALLBACK_POLICY_TEXT.to_string();
    };
    match std::fs::read_to_string(path) {
        Ok(content) if !content.trim().is_empty() => content,
        Ok(_) => FALLBACK_POLICY_TEXT.to_string(),
        Err(error) => {
            warn!(path = %path.display(), %error, "policy document unreadable, using summary");
            FALLBACK_POLICY_TEXT.to_string()
        }
    }
}

#[derive(Clone)]
pub struct RefundAssistant<S>
where
    S: BookingRepository + ConversationRepository,
{
    store: Arc<S>,
    metrics: Arc<AppMetrics>,
    policy_text: Arc<str>,
}

impl<S> RefundAssistant<S>
where
    S: BookingRepository + ConversationRepository,
{
    pub fn new(store: Arc<S>, metrics: Arc<AppMetrics>, policy_text: impl Into<Arc<str>>) -> Self {
        Self {
            store,
            metrics,
            policy_text: policy_text.into(),
        }
    }

    pub fn policy_text(&self) -> &str {
        &self.policy_text
    }

    pub async fn build_context(&self, user: &User) -> Result<AssistantContext> {
        let bookings = self
            .store
            .list_bookings_for_user(&user.user_id)
            .await
            .context("failed loading bookings for chat context")?;

        Ok(AssistantContext {
            user_name: user
                .name
                .clone()
                .filter(|name| !name.trim().is_empty())
                .unwrap_or_else(|| "User".to_string()),
            bookings: bookings.iter().map(context_item).collect(),
            policy_text: self.policy_text.to_string(),
        })
    }

    #[instrument(skip(self, input, user, completion), fields(user_id = %user.user_id))]
    pub async fn handle_chat<C: CompletionBackend>(
        &self,
        input: ChatInput,
        user: &User,
        completion: &C,
    ) -> Result<AssistantReply> {
        let started = Instant::now();

        let latest = input
            .latest_user_text()
            .context("chat needs at least one user message")?;
        let normalized = normalize_text(latest);
        let explicit_locale = Locale::from_optional_str(input.locale.as_deref());
        let locale = detect_locale(Some(explicit_locale), &normalized);
        let intent = classify_intent_rules(&normalized);

        let context = self.build_context(user).await?;
        let clarifying_questions =
            if needs_clarification(intent, &normalized, context.bookings.len()) {
                clarifying_questions_for(intent, locale, &context)
            } else {
                Vec::new()
            };

        let mut reply = compose_chat_reply(intent, locale, &context, clarifying_questions);

        let history = recent_history(&input.messages);
        let prompt = system_prompt(&context);
        let source = match completion.complete(&prompt, &history).await {
            Ok(Some(text)) if !text.trim().is_empty() => {
                self.metrics.inc_llm_call();
                reply.reply_text = text;
                "model"
            }
            Ok(_) => {
                self.metrics.inc_chat_fallback();
                "rules"
            }
            Err(error) => {
                self.metrics.inc_llm_call();
                self.metrics.inc_chat_fallback();
                warn!(%error, "chat completion failed, using rule-based reply");
                "rules"
            }
        };

        let session_id = self
            .persist_turn(
                input.session_id.as_deref(),
                &input.user_id,
                locale,
                &normalized,
                &reply.reply_text,
                intent,
            )
            .await?;

        if let Some(payload) = reply.json_payload.as_object_mut() {
            payload.insert("session_id".to_string(), json!(session_id));
            payload.insert("source".to_string(), json!(source));
        }

        info!(
            session_id = %session_id,
            locale = %locale.as_code(),
            intent = ?intent,
            source,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "chat handled"
        );

        Ok(reply)
    }

    pub async fn purge_expired_conversations(&self) -> Result<u64> {
        Ok(self.store.purge_expired_conversations(Utc::now()).await?)
    }

    /// Appends the turn and returns the id it was stored under. A session id
    /// owned by another user starts a fresh conversation instead.
    async fn persist_turn(
        &self,
        session_id: Option<&str>,
        user_id: &str,
        locale: Locale,
        user_text: &str,
        assistant_text: &str,
        intent: Intent,
    ) -> Result<String> {
        let existing = match session_id {
            Some(session_id) => self.store.load_conversation(session_id).await?,
            None => None,
        };
        let mut session = match existing {
            Some(session) if session.user_id.as_deref() == Some(user_id) => session,
            Some(_) => new_conversation(Uuid::new_v4().to_string(), user_id, locale),
            None => new_conversation(
                session_id
                    .map(ToString::to_string)
                    .unwrap_or_else(|| Uuid::new_v4().to_string()),
                user_id,
                locale,
            ),
        };

        session.locale = locale;
        session.expires_at = Utc::now() + Duration::hours(CONVERSATION_TTL_HOURS);
        session.turns.push(ConversationTurn {
            at: Utc::now(),
            user_text: user_text.to_string(),
            assistant_text: assistant_text.to_string(),
            intent,
        });

        if session.turns.len() > MAX_TURNS {
            let keep_from = session.turns.len() - MAX_TURNS;
            session.turns = session.turns.split_off(keep_from);
        }

        self.store
            .upsert_conversation(&session)
            .await
            .context("failed saving conversation")?;
        Ok(session.session_id)
    }
}

fn new_conversation(session_id: String, user_id: &str, locale: Locale) -> ConversationSession {
    ConversationSession {
        session_id,
        user_id: Some(user_id.to_string()),
        locale,
        expires_at: Utc::now(),
        turns: Vec::new(),
    }
}

fn context_item(details: &BookingDetails) -> BookingContextItem {
    BookingContextItem {
        booking_id: details.booking.booking_id.clone(),
        operator_name: details.operator_name.clone(),
        route: details.booking.route.clone(),
        travel_date: details
            .booking
            .departure_at
            .map(|at| at.format("%Y-%m-%d").to_string()),
        departure_time: details.booking.departure_label.clone(),
        amount: details.booking.amount,
        status: details.booking.status,
        refund_status: details.refund.as_ref().map(|refund| refund.status),
        refund_amount: details.refund.as_ref().map(|refund| refund.refund_amount),
        policy_lines: describe_rules(&details.rules),
    }
}

fn recent_history(messages: &[ChatMessage]) -> Vec<ChatMessage> {
    let conversational = messages
        .iter()
        .filter(|message| message.role != ChatRole::System)
        .cloned()
        .collect::<Vec<_>>();
    let skip = conversational.len().saturating_sub(MAX_HISTORY_MESSAGES);
    conversational.into_iter().skip(skip).collect()
}

/// Instructions for the chat model, grounded in the caller's own bookings.
pub fn system_prompt(context: &AssistantContext) -> String {
    let bookings = serde_json::to_string_pretty(&context.bookings).unwrap_or_else(|_| "[]".into());
    format!(
        "You are TrustRoute AI, the assistant for TrustRoute bus bookings. You help with refund policy questions, booking details and refund status.\n\
\n\
Rules:\n\
1. Follow the refund policy below exactly. Explain slabs, the convenience and cancellation deductions, and the timeline (1-2 days processing, 3-5 days credit) in simple words.\n\
2. Use only the booking data below when talking about the user's trips. Address the user as {name}.\n\
3. Report refund states as they appear in the data (INITIATED, PROCESSING, COMPLETED as credited, FAILED).\n\
4. If the user writes in Tamil or asks for Tamil, answer only in simple conversational Tamil.\n\
5. Be friendly and brief. Ask a follow-up question only when the booking is ambiguous.\n\
6. You are read-only: you cannot book or cancel tickets. Never invent bookings, amounts or statuses; if data is missing, say so.\n\
\n\
User bookings:\n{bookings}\n\
\n\
Refund policy:\n{policy}\n\
\n\
Format the answer in Markdown without long paragraphs.",
        name = context.user_name,
        policy = context.policy_text,
    )
}

fn clarifying_questions_for(
    intent: Intent,
    locale: Locale,
    context: &AssistantContext,
) -> Vec<String> {
    let routes = context
        .bookings
        .iter()
        .map(|booking| {
            booking
                .route
                .clone()
                .unwrap_or_else(|| booking.operator_name.clone())
        })
        .collect::<Vec<_>>()
        .join(", ");

    match (intent, locale) {
        (Intent::Unknown, Locale::Ta) => {
            vec!["ரீஃபண்ட், ரத்து அல்லது முன்பதிவு பற்றி எதை அறிய விரும்புகிறீர்கள்?".to_string()]
        }
        (Intent::Unknown, _) => {
            vec!["Is this about a refund, a cancellation or one of your bookings?".to_string()]
        }
        (_, Locale::Ta) => vec![format!("எந்த முன்பதிவு பற்றி கேட்கிறீர்கள்? ({routes})")],
        _ => vec![format!("Which booking do you mean? ({routes})")],
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use trustroute_core::{Booking, BookingStatus};
    use trustroute_storage::{seed_default_operators, OperatorRepository, Store, UserRepository};

    use super::*;

    struct FixedCompletion(&'static str);

    impl CompletionBackend for FixedCompletion {
        async fn complete(&self, system_prompt: &str, _: &[ChatMessage]) -> Result<Option<String>> {
            assert!(system_prompt.contains("read-only"));
            Ok(Some(self.0.to_string()))
        }
    }

    struct FailingCompletion;

    impl CompletionBackend for FailingCompletion {
        async fn complete(&self, _: &str, _: &[ChatMessage]) -> Result<Option<String>> {
            anyhow::bail!("upstream returned 502")
        }
    }

    fn assert_send<T: Send>(_: &T) {}

    fn completion_future_is_send<C: CompletionBackend>(backend: &C) {
        assert_send(&backend.complete("", &[]));
    }

    #[test]
    fn completion_futures_are_send_for_any_backend() {
        completion_future_is_send(&NoCompletion);
        completion_future_is_send(&FixedCompletion("ok"));
        completion_future_is_send(&FailingCompletion);
    }

    async fn setup() -> (RefundAssistant<Store>, Arc<Store>, Arc<AppMetrics>, User) {
        let store = Arc::new(Store::memory());
        seed_default_operators(store.as_ref()).await.unwrap();
        let now = Utc::now();
        let user = User {
            user_id: "user-1".to_string(),
            email: "priya@example.com".to_string(),
            name: Some("Priya".to_string()),
            phone_number: None,
            password_hash: String::new(),
            created_at: now,
            updated_at: now,
        };
        store.create_user(&user).await.unwrap();

        let operator = store.list_operators().await.unwrap().remove(0);
        store
            .create_booking(&Booking {
                booking_id: "b-1".to_string(),
                user_id: user.user_id.clone(),
                operator_id: operator.operator.operator_id,
                policy_id: operator.policy.policy_id,
                amount: 900.0,
                status: BookingStatus::Confirmed,
                seat_number: "3C".to_string(),
                passenger_name: "Priya".to_string(),
                route: Some("Chennai → Madurai".to_string()),
                departure_label: Some("9:00 AM".to_string()),
                departure_at: Some(now + Duration::days(3)),
                created_at: now,
                cancelled_at: None,
            })
            .await
            .unwrap();

        let metrics = AppMetrics::shared();
        let agent = RefundAssistant::new(store.clone(), metrics.clone(), FALLBACK_POLICY_TEXT);
        (agent, store, metrics, user)
    }

    fn input(text: &str, session_id: Option<&str>) -> ChatInput {
        ChatInput {
            session_id: session_id.map(ToString::to_string),
            user_id: "user-1".to_string(),
            messages: vec![ChatMessage {
                role: ChatRole::User,
                content: text.to_string(),
            }],
            locale: None,
        }
    }

    #[tokio::test]
    async fn falls_back_to_rules_without_a_model() {
        let (agent, store, metrics, user) = setup().await;
        let reply = agent
            .handle_chat(input("show my bookings", Some("s-1")), &user, &NoCompletion)
            .await
            .unwrap();

        assert_eq!(reply.intent, Intent::BookingDetails);
        assert!(reply.reply_text.contains("Chennai → Madurai"));
        assert_eq!(reply.json_payload["source"], "rules");
        assert_eq!(metrics.snapshot().chat_fallback_total, 1);

        let session = store.load_conversation("s-1").await.unwrap().unwrap();
        assert_eq!(session.turns.len(), 1);
        assert_eq!(session.user_id.as_deref(), Some("user-1"));
    }

    #[tokio::test]
    async fn model_text_replaces_the_rule_reply() {
        let (agent, _, metrics, user) = setup().await;
        let reply = agent
            .handle_chat(
                input("what is the refund policy", None),
                &user,
                &FixedCompletion("**95%** before 24h"),
            )
            .await
            .unwrap();
        assert_eq!(reply.reply_text, "**95%** before 24h");
        assert_eq!(reply.json_payload["source"], "model");
        assert_eq!(metrics.snapshot().llm_calls_total, 1);
    }

    #[tokio::test]
    async fn model_errors_degrade_gracefully() {
        let (agent, _, metrics, user) = setup().await;
        let reply = agent
            .handle_chat(input("where is my refund", None), &user, &FailingCompletion)
            .await
            .unwrap();
        assert_eq!(reply.intent, Intent::RefundStatus);
        assert!(reply.reply_text.contains("no refunds in progress"));
        assert_eq!(metrics.snapshot().chat_fallback_total, 1);
    }

    #[tokio::test]
    async fn context_carries_policy_lines() {
        let (agent, _, _, user) = setup().await;
        let context = agent.build_context(&user).await.unwrap();
        assert_eq!(context.user_name, "Priya");
        assert_eq!(context.bookings.len(), 1);
        assert!(!context.bookings[0].policy_lines.is_empty());

        let prompt = system_prompt(&context);
        assert!(prompt.contains("Address the user as Priya"));
        assert!(prompt.contains(FALLBACK_POLICY_TEXT));
    }

    #[tokio::test]
    async fn rejects_input_without_user_messages() {
        let (agent, _, _, user) = setup().await;
        let mut empty = input("hi", None);
        empty.messages.clear();
        assert!(agent.handle_chat(empty, &user, &NoCompletion).await.is_err());
    }

    #[test]
    fn missing_policy_file_uses_the_summary() {
        assert_eq!(load_policy_document(None), FALLBACK_POLICY_TEXT);
        assert_eq!(
            load_policy_document(Some(Path::new("/nonexistent/REFUND_POLICY.md"))),
            FALLBACK_POLICY_TEXT
        );
    }
}
