//! Title Summarizer
//!
//! After each committed turn on a persistent session the relay kicks off a
//! fire-and-forget refresh: summarize the last few messages into a short title
//! and overwrite the session's stored one. Failures are logged and swallowed;
//! the turn that triggered the refresh already succeeded.

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, warn};

use crate::models::{ChatMessage, ChatSession, Role};
use crate::provider::{CompletionParams, CompletionProvider};
use crate::repository::ChatRepository;

/// How many trailing messages feed the summary.
const TITLE_WINDOW: i64 = 5;

pub fn title_prompt(contents: &[String]) -> String {
    format!(
        "Create a short title (max 5 words) for this conversation. \
         Return only the title. Conversation:\n{}",
        contents.join("\n")
    )
}

/// Summarize the session's recent messages and store the result as its title.
/// A session with no messages is left untouched.
pub async fn refresh_title(
    provider: &dyn CompletionProvider,
    repository: &ChatRepository,
    session: &ChatSession,
    params: &CompletionParams,
) -> Result<()> {
    let recent = repository
        .get_last_messages(&session.id, &session.user_id, TITLE_WINDOW)
        .await?;
    if recent.is_empty() {
        return Ok(());
    }

    let contents: Vec<String> = recent.into_iter().map(|m| m.content).collect();
    let prompt = vec![ChatMessage::new(Role::System, title_prompt(&contents))];
    let title = provider.complete(&prompt, params).await?;
    let title = title.trim();

    repository.set_session_title(&session.id, title).await?;
    debug!(session_id = %session.id, title, "session title refreshed");
    Ok(())
}

/// Fire-and-forget wrapper around [`refresh_title`]. The relay never waits on
/// the result; a failed refresh leaves the previous title in place.
pub fn spawn_title_refresh(
    provider: Arc<dyn CompletionProvider>,
    repository: Arc<ChatRepository>,
    session: ChatSession,
    params: CompletionParams,
) {
    tokio::spawn(async move {
        if let Err(e) = refresh_title(provider.as_ref(), &repository, &session, &params).await {
            warn!(session_id = %session.id, error = %e, "title refresh failed");
        }
    });
}
