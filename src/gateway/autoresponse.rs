use chrono::Utc;
use log::{ debug, info, warn };
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::registry::ConversationState;
use crate::models::chat::{ ChatMessage, MessageKind, MessageStatus, Participant };
use crate::models::websocket::{ MessageDelivery, ServerEvent, StatusUpdate, TypingPayload };
use crate::responder::ReplyPlan;
use crate::store::MessageStore;

pub struct AutoResponseJob {
    pub conversation_id: String,
    pub peer: Participant,
    pub human_id: String,
    pub plan: ReplyPlan,
    pub read_sync_delay: Duration,
}

/// Replaces whatever auto-response is in flight for the conversation with `job`.
///
/// Must be called with the conversation lock held (`state` is the guarded
/// value). The previous lifecycle is cancelled and superseded before the new
/// one is registered, so two send steps can never both fire.
pub fn schedule(
    state: &mut ConversationState,
    conversation: Arc<Mutex<ConversationState>>,
    store: Arc<dyn MessageStore>,
    job: AutoResponseJob
) {
    let token = CancellationToken::new();
    let generation = state.replace_pending(token.clone());

    state.broadcast(&typing_event(&job, true), None);

    tokio::spawn(async move {
        run(conversation, store, job, generation, token).await;
    });
}

fn typing_event(job: &AutoResponseJob, is_typing: bool) -> ServerEvent {
    ServerEvent::Typing(TypingPayload {
        conversation_id: job.conversation_id.clone(),
        user_id: job.peer.user_id.clone(),
        display_name: job.peer.display_name.clone(),
        is_typing,
    })
}

/// Sleeps for `duration` unless the lifecycle is cancelled first.
async fn wait(token: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

async fn run(
    conversation: Arc<Mutex<ConversationState>>,
    store: Arc<dyn MessageStore>,
    job: AutoResponseJob,
    generation: u64,
    token: CancellationToken
) {
    let ReplyPlan { typing_duration, send_delay, .. } = job.plan;
    let mut typing_stopped = false;

    if typing_duration < send_delay {
        if !wait(&token, typing_duration).await {
            return;
        }
        let state = conversation.lock().await;
        if !state.is_current(generation) {
            return;
        }
        state.broadcast(&typing_event(&job, false), None);
        typing_stopped = true;
    }

    if !wait(&token, send_delay.saturating_sub(typing_duration.min(send_delay))).await {
        return;
    }

    let unread = {
        let mut state = conversation.lock().await;
        if !state.is_current(generation) {
            return;
        }
        if !typing_stopped {
            state.broadcast(&typing_event(&job, false), None);
        }

        let created_at = state.next_created_at();
        let reply = ChatMessage::sent_by(
            &job.conversation_id,
            &job.peer,
            job.plan.body.clone(),
            MessageKind::Text,
            None,
            created_at
        );
        if let Err(e) = store.append_message(&job.conversation_id, reply.clone()).await {
            warn!("Auto-response append failed in '{}': {}", job.conversation_id, e);
            state.clear_pending(generation);
            return;
        }
        info!("Auto-response {} delivered in '{}' as {}", reply.id, job.conversation_id, job.peer.user_id);
        state.broadcast(
            &ServerEvent::Message(MessageDelivery {
                conversation_id: job.conversation_id.clone(),
                message: reply,
                temp_id: None,
            }),
            None
        );

        match store.list_messages(&job.conversation_id).await {
            Ok(messages) =>
                messages
                    .into_iter()
                    .filter(|m| m.sender_id == job.human_id && m.status != MessageStatus::Read)
                    .map(|m| m.id)
                    .collect::<Vec<_>>(),
            Err(e) => {
                warn!("Could not load messages for read sync: {}", e);
                Vec::new()
            }
        }
    };

    if !wait(&token, job.read_sync_delay).await {
        return;
    }

    let mut state = conversation.lock().await;
    if !state.is_current(generation) {
        return;
    }
    for message_id in unread {
        match store.update_message_status(&job.conversation_id, &message_id, MessageStatus::Read, Utc::now()).await {
            Ok(Some(updated)) => {
                state.broadcast(
                    &ServerEvent::MessageStatus(StatusUpdate {
                        conversation_id: job.conversation_id.clone(),
                        message_id: updated.id,
                        status: updated.status,
                        at: updated.read_at.unwrap_or_else(Utc::now),
                        actor_id: job.peer.user_id.clone(),
                    }),
                    None
                );
            }
            Ok(None) => {}
            Err(e) => warn!("Read sync failed for {}: {}", message_id, e),
        }
    }
    state.clear_pending(generation);
    debug!("Auto-response generation {} finished in '{}'", generation, job.conversation_id);
}
