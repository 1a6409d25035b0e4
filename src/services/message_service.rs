//! Message service - citizen messages to institutions and the replies on them
//!
//! Caps are enforced inside the same IMMEDIATE transaction as the write they
//! guard, so concurrent sends from one sender cannot overshoot them.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::access::{self, Action, ResourceScope};
use crate::attachments::StoredAttachment;
use crate::config::Config;
use crate::db::messages::{self, MessageQuery, MESSAGE_STATUSES};
use crate::db::models::{current_timestamp, new_id, start_of_today, Message, NewMessage, NewReply, Reply};
use crate::db::{institutions, Store};
use crate::error::CivicError;
use crate::identity::Principal;

use super::events::{CivicEvent, EventBus};
use super::notifier::{Audience, Notice, NotificationDispatcher, NotificationKind};
use super::{optional_text, require_admin, required_text};

/// Replies per page
pub const REPLY_PAGE_SIZE: i64 = 20;

const MAX_CONTENT_CHARS: usize = 1000;

#[derive(Debug, Clone, Deserialize)]
pub struct SendMessageInput {
    pub institution_id: String,
    #[serde(default)]
    pub department_id: Option<String>,
    #[serde(default)]
    pub problem_type: Option<String>,
    #[serde(default)]
    pub other_problem: Option<String>,
    pub content: String,
    pub ward: String,
    pub street: String,
    #[serde(default)]
    pub sub_street: Option<String>,
    #[serde(default)]
    pub phone_number: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplyInput {
    pub content: String,
}

/// One page of replies
#[derive(Debug, Clone, Serialize)]
pub struct ReplyPage {
    pub page: i64,
    pub page_size: i64,
    pub results: Vec<Reply>,
}

/// A stored file and the name to present it under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentRef {
    pub path: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageStatusInput {
    pub status: String,
}

#[derive(Debug, Clone)]
pub struct RemovedMessage {
    pub message: Message,
    /// Attachment paths relative to the attachment root
    pub files: Vec<String>,
}

pub struct MessageService {
    store: Arc<Store>,
    config: Arc<Config>,
    events: Arc<EventBus>,
    notifier: Arc<dyn NotificationDispatcher>,
}

impl MessageService {
    pub fn new(
        store: Arc<Store>,
        config: Arc<Config>,
        events: Arc<EventBus>,
        notifier: Arc<dyn NotificationDispatcher>,
    ) -> Self {
        Self {
            store,
            config,
            events,
            notifier,
        }
    }

    // =========================================================================
    // Messages
    // =========================================================================

    pub fn send(
        &self,
        principal: &Principal,
        input: &SendMessageInput,
        attachment: Option<&StoredAttachment>,
    ) -> Result<Message, CivicError> {
        let institution_id = required_text("institution_id", &input.institution_id, 64)?;
        let department_id = optional_text("department_id", input.department_id.as_deref(), 64)?;
        let problem_type = optional_text("problem_type", input.problem_type.as_deref(), 100)?;
        let other_problem = optional_text("other_problem", input.other_problem.as_deref(), 200)?;
        if problem_type.is_none() && other_problem.is_none() {
            return Err(CivicError::InvalidInput(
                "Select a problem type or describe the problem".into(),
            ));
        }
        let content = required_text("content", &input.content, MAX_CONTENT_CHARS)?;
        let ward = required_text("ward", &input.ward, 100)?;
        let street = required_text("street", &input.street, 100)?;
        let sub_street = optional_text("sub_street", input.sub_street.as_deref(), 100)?;
        let phone_number = optional_text("phone_number", input.phone_number.as_deref(), 15)?;

        let cap = self.config.max_messages_per_day;
        let message = self.store.with_conn(|conn| {
            conn.immediate_transaction::<_, CivicError, _>(|conn| {
                if institutions::get_institution(conn, institution_id)?.is_none() {
                    return Err(CivicError::NotFound(format!("Institution {}", institution_id)));
                }
                if let Some(dept) = department_id {
                    institutions::ensure_department_in_institution(conn, institution_id, dept)?;
                }

                let today = messages::count_messages_since(conn, &principal.id, &start_of_today())?;
                if today >= cap {
                    return Err(CivicError::LimitReached(format!(
                        "At most {} messages may be sent per day",
                        cap
                    )));
                }

                let id = new_id();
                let now = current_timestamp();
                messages::insert_message(
                    conn,
                    &NewMessage {
                        id: &id,
                        sender_id: &principal.id,
                        device_id: principal.device_id(),
                        institution_id,
                        department_id,
                        problem_type,
                        other_problem,
                        content,
                        ward: Some(ward),
                        street: Some(street),
                        sub_street,
                        phone_number,
                        attachment_path: attachment.map(|a| a.path.as_str()),
                        attachment_name: attachment.map(|a| a.name.as_str()),
                        status: "pending",
                        created_at: &now,
                        updated_at: &now,
                    },
                )
            })
        })?;

        info!(message = %message.id, sender = %principal.id, institution = %message.institution_id, "Message sent");
        self.events.emit(CivicEvent::MessageCreated {
            id: message.id.clone(),
            institution_id: message.institution_id.clone(),
        });
        Ok(message)
    }

    /// Messages visible to the principal. No principal sees nothing.
    pub fn list(&self, principal: Option<&Principal>, query: &MessageQuery) -> Result<Vec<Message>, CivicError> {
        let Some(principal) = principal else {
            return Ok(Vec::new());
        };
        let scope = access::visible_scope(principal);
        self.store.with_conn(|conn| messages::list_messages(conn, &scope, query))
    }

    /// Messages ever sent by the principal
    pub fn count(&self, principal: Option<&Principal>) -> Result<i64, CivicError> {
        let principal =
            principal.ok_or_else(|| CivicError::NotFound("No principal for this device".into()))?;
        self.store
            .with_conn(|conn| messages::count_messages_by_sender(conn, &principal.id))
    }

    pub fn get(&self, principal: &Principal, message_id: &str) -> Result<Message, CivicError> {
        let message = self.load(message_id)?;
        access::authorize(
            principal,
            &ResourceScope::of_message(&message),
            Action::Read,
            &format!("Message {}", message_id),
        )?;
        Ok(message)
    }

    pub fn update_status(&self, principal: &Principal, message_id: &str, status: &str) -> Result<Message, CivicError> {
        let status = status.trim();
        if !MESSAGE_STATUSES.contains(&status) {
            return Err(CivicError::InvalidInput(format!(
                "Invalid status '{}', expected one of {}",
                status,
                MESSAGE_STATUSES.join(", ")
            )));
        }

        let message = self.store.with_conn(|conn| {
            conn.immediate_transaction::<_, CivicError, _>(|conn| {
                let message = messages::get_message(conn, message_id)?
                    .ok_or_else(|| CivicError::NotFound(format!("Message {}", message_id)))?;
                access::authorize(
                    principal,
                    &ResourceScope::of_message(&message),
                    Action::WriteStatus,
                    &format!("Message {}", message_id),
                )?;
                messages::update_message_status(conn, message_id, status)?
                    .ok_or_else(|| CivicError::NotFound(format!("Message {}", message_id)))
            })
        })?;

        info!(message = %message_id, status = %status, by = %principal.id, "Message status updated");
        self.events.emit(CivicEvent::MessageStatusChanged {
            id: message.id.clone(),
            status: message.status.clone(),
        });
        Ok(message)
    }

    /// Admin delete. Returns the removed message with the stored files of
    /// the message and its replies, which the caller cleans up.
    pub fn delete(&self, principal: &Principal, message_id: &str) -> Result<RemovedMessage, CivicError> {
        require_admin(principal)?;
        let removed = self.store.with_conn(|conn| {
            conn.immediate_transaction::<_, CivicError, _>(|conn| {
                let message = messages::get_message(conn, message_id)?
                    .ok_or_else(|| CivicError::NotFound(format!("Message {}", message_id)))?;
                let mut files = messages::reply_attachment_paths(conn, message_id)?;
                files.extend(message.attachment_path.clone());
                messages::delete_message(conn, message_id)?;
                Ok(RemovedMessage { message, files })
            })
        })?;

        info!(message = %message_id, by = %principal.id, files = removed.files.len(), "Message deleted");
        self.events.emit(CivicEvent::MessageDeleted { id: message_id.to_string() });
        Ok(removed)
    }

    fn load(&self, message_id: &str) -> Result<Message, CivicError> {
        self.store
            .with_conn(|conn| messages::get_message(conn, message_id))?
            .ok_or_else(|| CivicError::NotFound(format!("Message {}", message_id)))
    }

    // =========================================================================
    // Replies
    // =========================================================================

    /// Reply to a message. Staff replies move a pending message to answered;
    /// the sender is notified of replies written by someone else.
    pub fn reply(
        &self,
        principal: &Principal,
        message_id: &str,
        input: &ReplyInput,
        attachment: Option<&StoredAttachment>,
    ) -> Result<Reply, CivicError> {
        let content = required_text("content", &input.content, MAX_CONTENT_CHARS)?;
        let cap = self.config.max_replies_per_message;

        let (message, reply) = self.store.with_conn(|conn| {
            conn.immediate_transaction::<_, CivicError, _>(|conn| {
                let message = messages::get_message(conn, message_id)?
                    .ok_or_else(|| CivicError::NotFound(format!("Message {}", message_id)))?;
                let scope = ResourceScope::of_message(&message);
                access::authorize(principal, &scope, Action::Reply, &format!("Message {}", message_id))?;

                if !messages::reserve_reply_slot(conn, message_id, cap)? {
                    return Err(CivicError::LimitReached(format!(
                        "Message already has {} replies",
                        cap
                    )));
                }

                let id = new_id();
                let now = current_timestamp();
                let reply = messages::insert_reply(
                    conn,
                    &NewReply {
                        id: &id,
                        message_id,
                        sender_id: &principal.id,
                        sender_role: principal.role.as_str(),
                        content,
                        attachment_path: attachment.map(|a| a.path.as_str()),
                        attachment_name: attachment.map(|a| a.name.as_str()),
                        created_at: &now,
                    },
                )?;

                if principal.role.is_staff() {
                    messages::mark_answered_if_pending(conn, message_id)?;
                }
                Ok((message, reply))
            })
        })?;

        info!(reply = %reply.id, message = %message_id, sender = %principal.id, "Reply created");
        self.events.emit(CivicEvent::ReplyCreated {
            id: reply.id.clone(),
            message_id: message_id.to_string(),
            sender_role: reply.sender_role.clone(),
        });

        if message.sender_id != principal.id {
            self.notifier.dispatch(Notice::new(
                Audience::Principal(message.sender_id.clone()),
                NotificationKind::MessageReply,
                "Your message has a reply",
                &reply.content,
                "reply",
                reply.id.clone(),
            ));
        }
        Ok(reply)
    }

    /// Replies the principal may see, oldest first, `REPLY_PAGE_SIZE` per page
    pub fn list_replies(&self, principal: &Principal, message_id: &str, page: i64) -> Result<ReplyPage, CivicError> {
        let page = page.max(1);
        let message = self.load(message_id)?;
        let visibility = access::reply_visibility(principal, &ResourceScope::of_message(&message))?;

        let results = self.store.with_conn(|conn| {
            messages::list_replies(
                conn,
                message_id,
                visibility,
                &principal.id,
                REPLY_PAGE_SIZE,
                (page - 1) * REPLY_PAGE_SIZE,
            )
        })?;

        Ok(ReplyPage {
            page,
            page_size: REPLY_PAGE_SIZE,
            results,
        })
    }

    // =========================================================================
    // Attachments
    // =========================================================================

    pub fn message_attachment(&self, principal: &Principal, message_id: &str) -> Result<AttachmentRef, CivicError> {
        let message = self.get(principal, message_id)?;
        match (message.attachment_path, message.attachment_name) {
            (Some(path), name) => Ok(AttachmentRef {
                name: name.unwrap_or_else(|| "attachment".into()),
                path,
            }),
            (None, _) => Err(CivicError::NotFound("No file attached".into())),
        }
    }

    /// Reply files are gated by the parent message's scope
    pub fn reply_attachment(&self, principal: &Principal, reply_id: &str) -> Result<AttachmentRef, CivicError> {
        let reply = self
            .store
            .with_conn(|conn| messages::get_reply(conn, reply_id))?
            .ok_or_else(|| CivicError::NotFound(format!("Reply {}", reply_id)))?;
        self.get(principal, &reply.message_id)?;

        match (reply.attachment_path, reply.attachment_name) {
            (Some(path), name) => Ok(AttachmentRef {
                name: name.unwrap_or_else(|| "attachment".into()),
                path,
            }),
            (None, _) => Err(CivicError::NotFound("No file attached".into())),
        }
    }
}
