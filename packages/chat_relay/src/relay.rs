//! Session Relay
//!
//! Drives one WebSocket connection through its lifecycle: validate inbound
//! payloads, append the user message, stream the assistant reply fragment by
//! fragment, then commit the accumulated reply. One turn at a time per
//! connection; a failed turn reports a structured error and ends the
//! connection.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::StreamExt;
use futures::SinkExt;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::models::{ChatSession, MessageRecord, Role};
use crate::provider::{CompletionParams, CompletionProvider, ProviderError};
use crate::registry::{ConnectionHandle, Conversation, Outbound, POLICY_VIOLATION};
use crate::repository::ChatRepository;
use crate::title;

const MISSING_MESSAGE_ERROR: &str = "Message is required";
const OUTBOUND_BUFFER: usize = 32;

#[derive(Debug, Error)]
pub enum TurnError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// The client went away mid-turn; nothing left to deliver.
    #[error("connection closed")]
    ConnectionClosed,

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

/// Durable backing for a relay running against a persistent session.
#[derive(Clone)]
pub struct PersistCtx {
    pub repository: Arc<ChatRepository>,
    pub session: ChatSession,
}

/// Everything a connection needs beyond the conversation itself.
#[derive(Clone)]
pub struct RelayDeps {
    pub provider: Arc<dyn CompletionProvider>,
    pub chat_params: CompletionParams,
    pub title_params: CompletionParams,
    pub persist: Option<PersistCtx>,
}

#[derive(Deserialize)]
struct InboundPayload {
    message: Option<String>,
}

/// Extract the user text from an inbound frame. Anything but a non-empty
/// `message` field is invalid.
fn parse_user_message(text: &str) -> Option<String> {
    match serde_json::from_str::<InboundPayload>(text) {
        Ok(InboundPayload { message: Some(m) }) if !m.is_empty() => Some(m),
        _ => None,
    }
}

/// Process one inbound frame. Invalid payloads get a structured error and
/// leave history and the provider untouched; valid ones run a full turn.
/// Returns whether a turn was committed.
async fn handle_inbound(
    conversation: &Conversation,
    provider: &dyn CompletionProvider,
    params: &CompletionParams,
    tx: &mpsc::Sender<Outbound>,
    persist: Option<&PersistCtx>,
    text: &str,
) -> Result<bool, TurnError> {
    let Some(user_text) = parse_user_message(text) else {
        if tx
            .send(Outbound::Error(MISSING_MESSAGE_ERROR.to_string()))
            .await
            .is_err()
        {
            return Err(TurnError::ConnectionClosed);
        }
        return Ok(false);
    };

    if !conversation.is_active().await {
        return Err(TurnError::ConnectionClosed);
    }

    run_turn(conversation, provider, params, tx, persist, &user_text).await?;
    Ok(true)
}

/// Run one full turn: append the user message, stream the reply to the
/// client's outbound channel while accumulating it, then commit the assistant
/// message. The partial reply is discarded on any error; the user message
/// stays (it was accepted before the provider was involved).
pub async fn run_turn(
    conversation: &Conversation,
    provider: &dyn CompletionProvider,
    params: &CompletionParams,
    tx: &mpsc::Sender<Outbound>,
    persist: Option<&PersistCtx>,
    user_text: &str,
) -> Result<(), TurnError> {
    let user_message = conversation.append(Role::User, user_text).await;
    if let Some(ctx) = persist {
        ctx.repository
            .insert_message(&record_for(ctx, &user_message.role, &user_message.content))
            .await?;
    }

    let history = conversation.history().await;
    let mut stream = provider.stream_completion(&history, params).await?;

    let mut reply = String::new();
    while let Some(item) = stream.next().await {
        let fragment = item?;
        if tx.send(Outbound::Fragment(fragment.clone())).await.is_err() {
            // Receiver dropped: client is gone, abandon the provider stream.
            return Err(TurnError::ConnectionClosed);
        }
        reply.push_str(&fragment);
    }

    let assistant = conversation.append(Role::Assistant, reply).await;
    if let Some(ctx) = persist {
        ctx.repository
            .insert_message(&record_for(ctx, &assistant.role, &assistant.content))
            .await?;
    }

    Ok(())
}

fn record_for(ctx: &PersistCtx, role: &Role, content: &str) -> MessageRecord {
    MessageRecord {
        id: None,
        session_id: ctx.session.id.clone(),
        user_id: ctx.session.user_id.clone(),
        role: *role,
        content: content.to_string(),
        created_at: chrono::Utc::now(),
    }
}

/// Serve one WebSocket connection against a conversation until the client
/// disconnects, a turn fails, or the conversation is closed underneath us.
pub async fn handle_socket(mut socket: WebSocket, conversation: Arc<Conversation>, deps: RelayDeps) {
    // Reject before attaching; a closed conversation never gains connections.
    if !conversation.is_active().await {
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: POLICY_VIOLATION,
                reason: "conversation closed".into(),
            })))
            .await;
        return;
    }

    let connection_id = uuid::Uuid::new_v4().to_string();
    let (tx, mut rx) = mpsc::channel::<Outbound>(OUTBOUND_BUFFER);
    let cancel = CancellationToken::new();
    conversation
        .attach(
            &connection_id,
            ConnectionHandle {
                tx: tx.clone(),
                cancel: cancel.clone(),
            },
        )
        .await;

    info!(
        conversation_id = conversation.id(),
        connection_id = %connection_id,
        "connection attached"
    );

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Sender task: drains the outbound channel onto the socket. Cancellation
    // (conversation close) wins the race and sends the close frame itself.
    let sender_cancel = cancel.clone();
    let mut sender_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sender_cancel.cancelled() => {
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code: POLICY_VIOLATION,
                            reason: "conversation closed".into(),
                        })))
                        .await;
                    break;
                }
                outbound = rx.recv() => {
                    let message = match outbound {
                        Some(Outbound::Fragment(text)) => Message::Text(text.into()),
                        Some(Outbound::Error(text)) => {
                            Message::Text(json!({ "error": text }).to_string().into())
                        }
                        None => break,
                    };
                    if ws_tx.send(message).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Input task: one turn at a time, in receipt order.
    let input_conversation = conversation.clone();
    let input_deps = deps.clone();
    let mut input_task = tokio::spawn(async move {
        while let Some(Ok(message)) = ws_rx.next().await {
            let text = match message {
                Message::Text(text) => text,
                Message::Close(_) => break,
                _ => continue,
            };

            let result = handle_inbound(
                &input_conversation,
                input_deps.provider.as_ref(),
                &input_deps.chat_params,
                &tx,
                input_deps.persist.as_ref(),
                &text,
            )
            .await;

            match result {
                Ok(true) => {
                    if let Some(ctx) = &input_deps.persist {
                        title::spawn_title_refresh(
                            input_deps.provider.clone(),
                            ctx.repository.clone(),
                            ctx.session.clone(),
                            input_deps.title_params.clone(),
                        );
                    }
                }
                Ok(false) => {}
                Err(TurnError::ConnectionClosed) => break,
                Err(e) => {
                    warn!(
                        conversation_id = input_conversation.id(),
                        error = %e,
                        "turn failed"
                    );
                    let _ = tx.send(Outbound::Error(e.to_string())).await;
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut sender_task => input_task.abort(),
        _ = &mut input_task => {
            // Detach drops the attachment's tx clone; once the input task's
            // copy is gone too, the sender drains queued fragments and exits
            // on channel close.
            conversation.detach(&connection_id).await;
            let _ = sender_task.await;
        }
    }

    conversation.detach(&connection_id).await;
    debug!(
        conversation_id = conversation.id(),
        connection_id = %connection_id,
        "connection detached"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChatMessage, SYSTEM_PROMPT};
    use crate::provider::FragmentStream;
    use crate::registry::ConversationRegistry;
    use async_trait::async_trait;

    /// Scripted provider: replays a fixed fragment sequence per call and
    /// counts how often it was asked to stream.
    struct ScriptedProvider {
        script: Vec<Result<String, String>>,
        title: String,
        stream_calls: std::sync::atomic::AtomicUsize,
    }

    impl ScriptedProvider {
        fn new(fragments: &[&str]) -> Self {
            Self {
                script: fragments.iter().map(|f| Ok(f.to_string())).collect(),
                title: "Scripted Title".to_string(),
                stream_calls: std::sync::atomic::AtomicUsize::new(0),
            }
        }

        fn failing_after(fragments: &[&str]) -> Self {
            let mut provider = Self::new(fragments);
            provider.script.push(Err("provider exploded".to_string()));
            provider
        }

        fn stream_calls(&self) -> usize {
            self.stream_calls.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CompletionProvider for ScriptedProvider {
        async fn stream_completion(
            &self,
            _history: &[ChatMessage],
            _params: &CompletionParams,
        ) -> Result<FragmentStream, ProviderError> {
            self.stream_calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let items: Vec<Result<String, ProviderError>> = self
                .script
                .iter()
                .map(|r| r.clone().map_err(ProviderError::Malformed))
                .collect();
            Ok(Box::pin(futures::stream::iter(items)))
        }

        async fn complete(
            &self,
            _messages: &[ChatMessage],
            _params: &CompletionParams,
        ) -> Result<String, ProviderError> {
            Ok(self.title.clone())
        }
    }

    fn params() -> CompletionParams {
        CompletionParams {
            temperature: 1.0,
            top_p: 1.0,
            max_tokens: 1024,
        }
    }

    #[tokio::test]
    async fn turn_streams_fragments_and_commits_reply() {
        let registry = ConversationRegistry::new();
        let convo = registry.get_or_create("c1").await;
        let provider = ScriptedProvider::new(&["Hi", " there", "!"]);
        let (tx, mut rx) = mpsc::channel(32);

        run_turn(&convo, &provider, &params(), &tx, None, "hello")
            .await
            .unwrap();

        let mut fragments = Vec::new();
        while let Ok(out) = rx.try_recv() {
            fragments.push(out);
        }
        assert_eq!(
            fragments,
            vec![
                Outbound::Fragment("Hi".to_string()),
                Outbound::Fragment(" there".to_string()),
                Outbound::Fragment("!".to_string()),
            ]
        );

        let history = convo.history().await;
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].content, SYSTEM_PROMPT);
        assert_eq!(history[1].role, Role::User);
        assert_eq!(history[1].content, "hello");
        assert_eq!(history[2].role, Role::Assistant);
        assert_eq!(history[2].content, "Hi there!");
    }

    #[tokio::test]
    async fn dropped_client_abandons_turn_without_commit() {
        let registry = ConversationRegistry::new();
        let convo = registry.get_or_create("c1").await;
        let provider = ScriptedProvider::new(&["Hi", " there"]);
        let (tx, rx) = mpsc::channel(32);
        drop(rx);

        let err = run_turn(&convo, &provider, &params(), &tx, None, "hello")
            .await
            .unwrap_err();
        assert!(matches!(err, TurnError::ConnectionClosed));

        // User message stays; no assistant message was committed.
        let history = convo.history().await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].role, Role::User);
    }

    #[tokio::test]
    async fn provider_error_discards_partial_reply() {
        let registry = ConversationRegistry::new();
        let convo = registry.get_or_create("c1").await;
        let provider = ScriptedProvider::failing_after(&["partial"]);
        let (tx, mut rx) = mpsc::channel(32);

        let err = run_turn(&convo, &provider, &params(), &tx, None, "hello")
            .await
            .unwrap_err();
        assert!(matches!(err, TurnError::Provider(_)));

        // The partial fragment was forwarded before the failure
        assert_eq!(
            rx.try_recv().unwrap(),
            Outbound::Fragment("partial".to_string())
        );

        let history = convo.history().await;
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|m| m.role != Role::Assistant));
    }

    #[tokio::test]
    async fn persistent_turn_writes_both_messages() {
        let repo = Arc::new(crate::repository::test_helpers::test_repository().await);
        repo.create_user(&crate::models::User {
            id: "u-1".to_string(),
            username: "alice".to_string(),
            email: "alice@example.com".to_string(),
            password_hash: "hashed".to_string(),
            created_at: chrono::Utc::now().timestamp(),
        })
        .await
        .unwrap();
        let session = repo.create_session("u-1").await.unwrap();

        let registry = ConversationRegistry::new();
        let convo = registry.get_or_create(&session.id).await;
        let provider = ScriptedProvider::new(&["stored ", "reply"]);
        let (tx, _rx) = mpsc::channel(32);
        let ctx = PersistCtx {
            repository: repo.clone(),
            session: session.clone(),
        };

        run_turn(&convo, &provider, &params(), &tx, Some(&ctx), "persist me")
            .await
            .unwrap();

        let stored = repo
            .get_session_messages(&session.id, "u-1")
            .await
            .unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].role, Role::User);
        assert_eq!(stored[0].content, "persist me");
        assert_eq!(stored[1].role, Role::Assistant);
        assert_eq!(stored[1].content, "stored reply");
    }

    #[test]
    fn inbound_payload_validation() {
        assert_eq!(
            parse_user_message(r#"{"message":"hi"}"#).as_deref(),
            Some("hi")
        );
        assert!(parse_user_message(r#"{}"#).is_none());
        assert!(parse_user_message(r#"{"message":""}"#).is_none());
        assert!(parse_user_message(r#"{"message":null}"#).is_none());
        assert!(parse_user_message("not json").is_none());
    }

    #[tokio::test]
    async fn invalid_payloads_never_start_a_turn() {
        let registry = ConversationRegistry::new();
        let convo = registry.get_or_create("c1").await;
        let provider = ScriptedProvider::new(&["Hi", " there"]);
        let (tx, mut rx) = mpsc::channel(32);

        for raw in [r#"{}"#, r#"{"message":""}"#, "not json"] {
            let committed = handle_inbound(&convo, &provider, &params(), &tx, None, raw)
                .await
                .unwrap();
            assert!(!committed);
            assert_eq!(
                rx.try_recv().unwrap(),
                Outbound::Error("Message is required".to_string())
            );
        }

        // Nothing reached the provider or the history
        assert_eq!(provider.stream_calls(), 0);
        assert_eq!(convo.history().await.len(), 1);

        // The connection stays usable: the next valid message runs a full turn
        let committed = handle_inbound(
            &convo,
            &provider,
            &params(),
            &tx,
            None,
            r#"{"message":"hello"}"#,
        )
        .await
        .unwrap();
        assert!(committed);
        assert_eq!(provider.stream_calls(), 1);

        let history = convo.history().await;
        assert_eq!(history.len(), 3);
        assert_eq!(history[1].content, "hello");
        assert_eq!(history[2].content, "Hi there");
    }

    #[tokio::test]
    async fn closed_conversation_ends_the_input_loop() {
        let registry = ConversationRegistry::new();
        let convo = registry.get_or_create("c1").await;
        convo.close().await;

        let provider = ScriptedProvider::new(&["Hi"]);
        let (tx, _rx) = mpsc::channel(32);

        let err = handle_inbound(
            &convo,
            &provider,
            &params(),
            &tx,
            None,
            r#"{"message":"hello"}"#,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TurnError::ConnectionClosed));
        assert_eq!(provider.stream_calls(), 0);
    }
}
