//! HTTP API for civic-intake
//!
//! JSON over HTTP/1.1. Identity travels with each request: an optional
//! `Authorization: Bearer <jwt>` header and a device identifier taken from
//! the `Device-Id`, `X-Device-Id` or `DEVICE_ID` header, the `device_id`
//! body field or the `device_id` query parameter, in that order.
//!
//! ## Routes
//!
//! - `GET /health` - Liveness and row counts
//! - `POST /api/users/register`, `POST /api/users/login`, `GET /api/users/me`
//! - `POST /api/users/staff`, `POST /api/users/{id}/active` - Admin account management
//! - `GET|POST /api/institutions`, `GET|POST /api/departments`
//! - `GET|POST /api/reports`, `GET /api/reports/{id}`, `POST /api/reports/{id}/status`
//! - `GET|POST /api/messages`, `GET /api/messages/count`
//! - `PATCH /api/messages/{id}/status`, `DELETE /api/messages/{id}`
//! - `GET|POST /api/messages/{id}/replies`
//! - `GET /api/messages/{id}/file`, `GET /api/replies/{id}/file` - Attachment downloads
//! - `GET|POST /api/polls`, `GET|PUT|DELETE /api/polls/{id}`, `POST /api/polls/{id}/vote`
//! - `GET|POST /api/feeds`, `DELETE /api/feeds/{id}`
//! - `POST /api/feeds/{id}/react`, `POST /api/feeds/{id}/share`
//! - `GET /api/feeds/{id}/image`, `GET /api/feeds/{id}/video`
//! - `GET /api/notifications`, `POST /api/notifications/{id}/read`
//! - `POST /api/notifications/read-all`, `POST /api/notifications/devices`
//! - `GET|POST /api/announcements`, `GET|PATCH|PUT|DELETE /api/announcements/{id}`
//! - `GET /api/analytics/admin-stats` - Admin report
//!
//! ## Example Usage
//!
//! ```bash
//! # File a report from an unregistered phone
//! curl -X POST -H "Device-Id: 3f9c-android" -H "Content-Type: application/json" \
//!      -d '{"title":"Broken streetlight","description":"Dark since Monday","latitude":-6.8,"longitude":39.28}' \
//!      http://localhost:8000/api/reports
//!
//! # The same phone lists what it filed
//! curl -H "Device-Id: 3f9c-android" http://localhost:8000/api/reports
//! ```

pub mod request;
pub mod response;

use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::{BodyExt, Limited};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::access::Disposition;
use crate::attachments::{content_type_for, AttachmentStore, AttachmentUpload, StoredAttachment};
use crate::db::messages::MessageQuery;
use crate::db::reports::ReportQuery;
use crate::error::CivicError;
use crate::identity::Principal;
use crate::services::analytics_service::AnalyticsQuery;
use crate::services::announcement_service::{AnnouncementInput, AnnouncementPatch};
use crate::services::feed_service::{FeedInput, FeedMedia, FeedQuery, ReactInput, ShareInput};
use crate::services::message_service::{AttachmentRef, MessageStatusInput, ReplyInput, SendMessageInput};
use crate::services::notification_service::{InboxQuery, PushDeviceInput};
use crate::services::poll_service::{PollInput, VoteInput};
use crate::services::report_service::{CreateReportInput, ReportStatusInput};
use crate::services::user_service::{
    ActiveInput, DepartmentInput, LoginInput, NameInput, RegisterInput, StaffInput,
};
use crate::services::{Caller, Services};

pub use request::RequestContext;
use response::{
    binary_response, created, error_response, no_content, ok, route_not_found, HandlerResult, HttpResponse,
};

/// Non-upload overhead allowed on top of base64 payloads
const BODY_SLACK_BYTES: usize = 1024 * 1024;

#[derive(Debug, Deserialize)]
struct PageQuery {
    #[serde(default = "default_page_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

fn default_page_limit() -> i64 {
    50
}

#[derive(Debug, Deserialize)]
struct ReplyPageQuery {
    #[serde(default)]
    page: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct DepartmentQuery {
    #[serde(default)]
    institution: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DownloadQuery {
    #[serde(default)]
    preview: Option<String>,
}

/// HTTP server state
pub struct HttpServer {
    services: Arc<Services>,
    attachments: Arc<AttachmentStore>,
    bind_addr: SocketAddr,
}

impl HttpServer {
    pub fn new(services: Arc<Services>, attachments: Arc<AttachmentStore>, bind_addr: SocketAddr) -> Self {
        Self {
            services,
            attachments,
            bind_addr,
        }
    }

    /// Run the HTTP server
    pub async fn run(self: Arc<Self>) -> Result<(), CivicError> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "HTTP server listening");

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let server = self.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let server = server.clone();
                    async move { server.handle_request(req).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    warn!(addr = %remote_addr, error = %err, "Connection error");
                }
            });
        }
    }

    /// Largest accepted request body: two base64 uploads plus slack
    fn body_limit(&self) -> usize {
        self.attachments.max_bytes() / 3 * 8 + BODY_SLACK_BYTES
    }

    /// Read the body, build the request context and route
    pub async fn handle_request(
        &self,
        req: Request<Incoming>,
    ) -> Result<HttpResponse, hyper::Error> {
        let (parts, body) = req.into_parts();
        let path = parts.uri.path().to_string();
        debug!(method = %parts.method, path = %path, "Incoming request");

        let result = match Limited::new(body, self.body_limit()).collect().await {
            Ok(collected) => {
                let ctx = RequestContext::new(
                    parts.method,
                    path,
                    parts.uri.query(),
                    parts.headers,
                    collected.to_bytes(),
                );
                self.route(Arc::new(ctx)).await
            }
            Err(e) => Err(CivicError::InvalidInput(format!("Failed to read request body: {}", e))),
        };

        Ok(result.unwrap_or_else(error_response))
    }

    async fn route(&self, ctx: Arc<RequestContext>) -> HandlerResult {
        let method = ctx.method.clone();
        let segments: Vec<&str> = ctx.path.trim_matches('/').split('/').collect();

        match (method, segments.as_slice()) {
            (Method::GET, ["health"]) => self.handle_health(&ctx).await,

            // Users
            (Method::POST, ["api", "users", "register"]) => self.handle_register(&ctx).await,
            (Method::POST, ["api", "users", "login"]) => self.handle_login(&ctx).await,
            (Method::GET, ["api", "users", "me"]) => {
                let profile = self
                    .blocking(&ctx, |s, ctx| s.users.me(&resolve(s, ctx)?))
                    .await?;
                Ok(ok(&profile))
            }
            (Method::POST, ["api", "users", "staff"]) => {
                let input: StaffInput = ctx.json()?;
                let profile = self
                    .blocking(&ctx, move |s, ctx| s.users.create_staff(&resolve(s, ctx)?, &input))
                    .await?;
                Ok(created(&profile))
            }
            (Method::POST, ["api", "users", id, "active"]) => {
                let id = id.to_string();
                let input: ActiveInput = ctx.json()?;
                let profile = self
                    .blocking(&ctx, move |s, ctx| {
                        s.users.set_active(&resolve(s, ctx)?, &id, input.is_active)
                    })
                    .await?;
                Ok(ok(&profile))
            }

            // Institutions and departments
            (Method::GET, ["api", "institutions"]) => {
                let institutions = self.blocking(&ctx, |s, _| s.users.list_institutions()).await?;
                Ok(ok(&institutions))
            }
            (Method::POST, ["api", "institutions"]) => {
                let input: NameInput = ctx.json()?;
                let institution = self
                    .blocking(&ctx, move |s, ctx| s.users.create_institution(&resolve(s, ctx)?, &input))
                    .await?;
                Ok(created(&institution))
            }
            (Method::GET, ["api", "departments"]) => {
                let query: DepartmentQuery = ctx.query()?;
                let departments = self
                    .blocking(&ctx, move |s, _| s.users.list_departments(query.institution.as_deref()))
                    .await?;
                Ok(ok(&departments))
            }
            (Method::POST, ["api", "departments"]) => {
                let input: DepartmentInput = ctx.json()?;
                let department = self
                    .blocking(&ctx, move |s, ctx| s.users.create_department(&resolve(s, ctx)?, &input))
                    .await?;
                Ok(created(&department))
            }

            // Reports
            (Method::POST, ["api", "reports"]) => {
                let input: CreateReportInput = ctx.json()?;
                let report = self
                    .blocking(&ctx, move |s, ctx| s.reports.create(&resolve(s, ctx)?, &input))
                    .await?;
                Ok(created(&report))
            }
            (Method::GET, ["api", "reports"]) => {
                let query: ReportQuery = ctx.query()?;
                let reports = self
                    .blocking(&ctx, move |s, ctx| s.reports.list(lookup(s, ctx)?.as_ref(), &query))
                    .await?;
                Ok(ok(&reports))
            }
            (Method::GET, ["api", "reports", id]) => {
                let id = id.to_string();
                let report = self
                    .blocking(&ctx, move |s, ctx| {
                        let label = format!("Report {}", id);
                        s.reports.get(&viewer(s, ctx, &label)?, &id)
                    })
                    .await?;
                Ok(ok(&report))
            }
            (Method::POST, ["api", "reports", id, "status"]) => {
                let id = id.to_string();
                let input: ReportStatusInput = ctx.json()?;
                let report = self
                    .blocking(&ctx, move |s, ctx| s.reports.update_status(&resolve(s, ctx)?, &id, &input))
                    .await?;
                Ok(ok(&report))
            }

            // Messages
            (Method::POST, ["api", "messages"]) => self.handle_send_message(&ctx).await,
            (Method::GET, ["api", "messages"]) => {
                let query: MessageQuery = ctx.query()?;
                let messages = self
                    .blocking(&ctx, move |s, ctx| s.messages.list(lookup(s, ctx)?.as_ref(), &query))
                    .await?;
                Ok(ok(&messages))
            }
            (Method::GET, ["api", "messages", "count"]) => {
                let count = self
                    .blocking(&ctx, |s, ctx| s.messages.count(lookup(s, ctx)?.as_ref()))
                    .await?;
                Ok(ok(&serde_json::json!({ "count": count })))
            }
            (Method::GET, ["api", "messages", id]) => {
                let id = id.to_string();
                let message = self
                    .blocking(&ctx, move |s, ctx| {
                        let label = format!("Message {}", id);
                        s.messages.get(&viewer(s, ctx, &label)?, &id)
                    })
                    .await?;
                Ok(ok(&message))
            }
            (Method::PATCH, ["api", "messages", id, "status"]) => {
                let id = id.to_string();
                let input: MessageStatusInput = ctx.json()?;
                let message = self
                    .blocking(&ctx, move |s, ctx| {
                        s.messages.update_status(&resolve(s, ctx)?, &id, &input.status)
                    })
                    .await?;
                Ok(ok(&message))
            }
            (Method::DELETE, ["api", "messages", id]) => {
                let id = id.to_string();
                let removed = self
                    .blocking(&ctx, move |s, ctx| s.messages.delete(&resolve(s, ctx)?, &id))
                    .await?;
                for file in &removed.files {
                    self.attachments.remove(file).await;
                }
                Ok(no_content())
            }
            (Method::POST, ["api", "messages", id, "replies"]) => {
                self.handle_reply(&ctx, id.to_string()).await
            }
            (Method::GET, ["api", "messages", id, "replies"]) => {
                let id = id.to_string();
                let query: ReplyPageQuery = ctx.query()?;
                let page = self
                    .blocking(&ctx, move |s, ctx| {
                        let label = format!("Message {}", id);
                        s.messages.list_replies(&viewer(s, ctx, &label)?, &id, query.page.unwrap_or(1))
                    })
                    .await?;
                Ok(ok(&page))
            }
            (Method::GET, ["api", "messages", id, "file"]) => {
                let id = id.to_string();
                let file = self
                    .blocking(&ctx, move |s, ctx| {
                        let label = format!("Message {}", id);
                        s.messages.message_attachment(&viewer(s, ctx, &label)?, &id)
                    })
                    .await?;
                self.download(&ctx, file).await
            }
            (Method::GET, ["api", "replies", id, "file"]) => {
                let id = id.to_string();
                let file = self
                    .blocking(&ctx, move |s, ctx| {
                        let label = format!("Reply {}", id);
                        s.messages.reply_attachment(&viewer(s, ctx, &label)?, &id)
                    })
                    .await?;
                self.download(&ctx, file).await
            }

            // Polls
            (Method::GET, ["api", "polls"]) => {
                let query: PageQuery = ctx.query()?;
                let polls = self
                    .blocking(&ctx, move |s, ctx| {
                        let principal = lookup(s, ctx)?;
                        s.polls
                            .list(principal.as_ref(), ctx.device_id.as_deref(), query.limit, query.offset)
                    })
                    .await?;
                Ok(ok(&polls))
            }
            (Method::POST, ["api", "polls"]) => {
                let input: PollInput = ctx.json()?;
                let poll = self
                    .blocking(&ctx, move |s, ctx| s.polls.create(&resolve(s, ctx)?, &input))
                    .await?;
                Ok(created(&poll))
            }
            (Method::GET, ["api", "polls", id]) => {
                let id = id.to_string();
                let poll = self
                    .blocking(&ctx, move |s, ctx| {
                        let principal = lookup(s, ctx)?;
                        s.polls.get(principal.as_ref(), ctx.device_id.as_deref(), &id)
                    })
                    .await?;
                Ok(ok(&poll))
            }
            (Method::PUT, ["api", "polls", id]) => {
                let id = id.to_string();
                let input: PollInput = ctx.json()?;
                let poll = self
                    .blocking(&ctx, move |s, ctx| s.polls.replace(&resolve(s, ctx)?, &id, &input))
                    .await?;
                Ok(ok(&poll))
            }
            (Method::DELETE, ["api", "polls", id]) => {
                let id = id.to_string();
                self.blocking(&ctx, move |s, ctx| s.polls.delete(&resolve(s, ctx)?, &id))
                    .await?;
                Ok(no_content())
            }
            (Method::POST, ["api", "polls", id, "vote"]) => {
                let id = id.to_string();
                let input: VoteInput = ctx.json()?;
                let result = self
                    .blocking(&ctx, move |s, ctx| s.polls.vote(&resolve(s, ctx)?, &id, &input))
                    .await?;
                Ok(created(&result))
            }

            // Feeds
            (Method::GET, ["api", "feeds"]) => {
                let query: FeedQuery = ctx.query()?;
                let feeds = self
                    .blocking(&ctx, move |s, ctx| {
                        let principal = lookup(s, ctx)?;
                        s.feeds.list(principal.as_ref(), ctx.device_id.as_deref(), &query)
                    })
                    .await?;
                Ok(ok(&feeds))
            }
            (Method::POST, ["api", "feeds"]) => self.handle_create_feed(&ctx).await,
            (Method::DELETE, ["api", "feeds", id]) => {
                let id = id.to_string();
                let feed = self
                    .blocking(&ctx, move |s, ctx| s.feeds.delete(&resolve(s, ctx)?, &id))
                    .await?;
                for file in feed.image_path.iter().chain(feed.video_path.iter()) {
                    self.attachments.remove(file).await;
                }
                Ok(no_content())
            }
            (Method::POST, ["api", "feeds", id, "react"]) => {
                let id = id.to_string();
                let input: ReactInput = ctx.json()?;
                let record = self
                    .blocking(&ctx, move |s, ctx| s.feeds.react(&resolve(s, ctx)?, &id, &input))
                    .await?;
                Ok(ok(&record))
            }
            (Method::POST, ["api", "feeds", id, "share"]) => {
                let id = id.to_string();
                let input: ShareInput = ctx.json()?;
                let record = self
                    .blocking(&ctx, move |s, ctx| s.feeds.share(&resolve(s, ctx)?, &id, &input))
                    .await?;
                Ok(created(&record))
            }
            (Method::GET, ["api", "feeds", id, media @ ("image" | "video")]) => {
                let id = id.to_string();
                let which = if *media == "image" { FeedMedia::Image } else { FeedMedia::Video };
                let file = self.blocking(&ctx, move |s, _| s.feeds.media(&id, which)).await?;
                self.download(&ctx, file).await
            }

            // Notifications
            (Method::GET, ["api", "notifications"]) => {
                let query: InboxQuery = ctx.query()?;
                let inbox = self
                    .blocking(&ctx, move |s, ctx| s.notifications.list(&resolve(s, ctx)?, &query))
                    .await?;
                Ok(ok(&inbox))
            }
            (Method::POST, ["api", "notifications", "read-all"]) => {
                let marked = self
                    .blocking(&ctx, |s, ctx| s.notifications.mark_all_read(&resolve(s, ctx)?))
                    .await?;
                Ok(ok(&serde_json::json!({ "marked": marked })))
            }
            (Method::POST, ["api", "notifications", "devices"]) => {
                let input: PushDeviceInput = ctx.json()?;
                let device = self
                    .blocking(&ctx, move |s, ctx| {
                        s.notifications.register_device(&resolve(s, ctx)?, &input)
                    })
                    .await?;
                Ok(created(&device))
            }
            (Method::POST, ["api", "notifications", id, "read"]) => {
                let id = id.to_string();
                let notification = self
                    .blocking(&ctx, move |s, ctx| s.notifications.mark_read(&resolve(s, ctx)?, &id))
                    .await?;
                Ok(ok(&notification))
            }

            // Announcements
            (Method::GET, ["api", "announcements"]) => {
                let query: PageQuery = ctx.query()?;
                let listed = self
                    .blocking(&ctx, move |s, _| s.announcements.list(query.limit, query.offset))
                    .await?;
                Ok(ok(&listed))
            }
            (Method::POST, ["api", "announcements"]) => {
                let input: AnnouncementInput = ctx.json()?;
                let announcement = self
                    .blocking(&ctx, move |s, ctx| s.announcements.create(&resolve(s, ctx)?, &input))
                    .await?;
                Ok(created(&announcement))
            }
            (Method::GET, ["api", "announcements", id]) => {
                let id = id.to_string();
                let announcement = self.blocking(&ctx, move |s, _| s.announcements.get(&id)).await?;
                Ok(ok(&announcement))
            }
            (Method::PATCH | Method::PUT, ["api", "announcements", id]) => {
                let id = id.to_string();
                let patch: AnnouncementPatch = ctx.json()?;
                let announcement = self
                    .blocking(&ctx, move |s, ctx| s.announcements.update(&resolve(s, ctx)?, &id, &patch))
                    .await?;
                Ok(ok(&announcement))
            }
            (Method::DELETE, ["api", "announcements", id]) => {
                let id = id.to_string();
                self.blocking(&ctx, move |s, ctx| s.announcements.delete(&resolve(s, ctx)?, &id))
                    .await?;
                Ok(no_content())
            }

            // Analytics
            (Method::GET, ["api", "analytics", "admin-stats"]) => {
                let query: AnalyticsQuery = ctx.query()?;
                let stats = self
                    .blocking(&ctx, move |s, ctx| s.analytics.admin_stats(&resolve(s, ctx)?, &query))
                    .await?;
                Ok(ok(&stats))
            }

            (method, _) => Ok(route_not_found(&method, &ctx.path)),
        }
    }

    // =========================================================================
    // Handlers with more than one step
    // =========================================================================

    /// GET /health
    async fn handle_health(&self, ctx: &Arc<RequestContext>) -> HandlerResult {
        let stats = self.blocking(ctx, |s, _| s.store.stats()).await?;
        Ok(ok(&serde_json::json!({
            "status": "ok",
            "principals": stats.principals,
            "reports": stats.reports,
            "messages": stats.messages,
            "polls": stats.polls,
            "feeds": stats.feeds,
            "event_subscribers": self.services.events.subscriber_count(),
        })))
    }

    /// POST /api/users/register. An admin token may register staff.
    async fn handle_register(&self, ctx: &Arc<RequestContext>) -> HandlerResult {
        let input: RegisterInput = ctx.json()?;
        let response = self
            .blocking(ctx, move |s, ctx| {
                let caller = token_holder(s, ctx)?;
                s.users.register(caller.as_ref(), ctx.device_id.as_deref(), &input)
            })
            .await?;
        Ok(created(&response))
    }

    /// POST /api/users/login
    async fn handle_login(&self, ctx: &Arc<RequestContext>) -> HandlerResult {
        let input: LoginInput = ctx.json()?;
        let response = self
            .blocking(ctx, move |s, ctx| s.users.login(ctx.device_id.as_deref(), &input))
            .await?;
        Ok(ok(&response))
    }

    /// POST /api/messages
    async fn handle_send_message(&self, ctx: &Arc<RequestContext>) -> HandlerResult {
        let input: SendMessageInput = ctx.json()?;
        let uploads = ctx.uploads()?;
        let stored = self.save_upload(uploads.attachment.as_ref()).await?;

        let attachment = stored.clone();
        let result = self
            .blocking(ctx, move |s, ctx| {
                s.messages.send(&resolve(s, ctx)?, &input, attachment.as_ref())
            })
            .await;
        let message = self.keep_or_discard(result, [stored]).await?;
        Ok(created(&message))
    }

    /// POST /api/messages/{id}/replies
    async fn handle_reply(&self, ctx: &Arc<RequestContext>, message_id: String) -> HandlerResult {
        let input: ReplyInput = ctx.json()?;
        let uploads = ctx.uploads()?;
        let stored = self.save_upload(uploads.attachment.as_ref()).await?;

        let attachment = stored.clone();
        let result = self
            .blocking(ctx, move |s, ctx| {
                s.messages
                    .reply(&resolve(s, ctx)?, &message_id, &input, attachment.as_ref())
            })
            .await;
        let reply = self.keep_or_discard(result, [stored]).await?;
        Ok(created(&reply))
    }

    /// POST /api/feeds
    async fn handle_create_feed(&self, ctx: &Arc<RequestContext>) -> HandlerResult {
        let input: FeedInput = ctx.json()?;
        let uploads = ctx.uploads()?;
        let image = self.save_upload(uploads.image.as_ref()).await?;
        let video = match self.save_upload(uploads.video.as_ref()).await {
            Ok(video) => video,
            Err(e) => {
                self.discard([image]).await;
                return Err(e);
            }
        };

        let (img, vid) = (image.clone(), video.clone());
        let result = self
            .blocking(ctx, move |s, ctx| {
                s.feeds.create(&resolve(s, ctx)?, &input, img.as_ref(), vid.as_ref())
            })
            .await;
        let feed = self.keep_or_discard(result, [image, video]).await?;
        Ok(created(&feed))
    }

    /// Serve a stored file. `?preview=1` renders inline.
    async fn download(&self, ctx: &RequestContext, file: AttachmentRef) -> HandlerResult {
        let query: DownloadQuery = ctx.query()?;
        let bytes = self.attachments.read(&file.path).await?;
        let disposition = Disposition::from_preview(query.preview.as_deref()).header_value(&file.name);
        debug!(path = %file.path, size = bytes.len(), "Serving attachment");
        Ok(binary_response(content_type_for(&file.name), &disposition, bytes))
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Run synchronous service code on the blocking pool
    async fn blocking<T, F>(&self, ctx: &Arc<RequestContext>, f: F) -> Result<T, CivicError>
    where
        F: FnOnce(&Services, &RequestContext) -> Result<T, CivicError> + Send + 'static,
        T: Send + 'static,
    {
        let services = self.services.clone();
        let ctx = ctx.clone();
        tokio::task::spawn_blocking(move || f(&services, &ctx))
            .await
            .map_err(|e| CivicError::Internal(format!("Blocking task failed: {}", e)))?
    }

    async fn save_upload(&self, upload: Option<&AttachmentUpload>) -> Result<Option<StoredAttachment>, CivicError> {
        match upload {
            Some(upload) => Ok(Some(self.attachments.save(upload).await?)),
            None => Ok(None),
        }
    }

    /// Files written for a request whose row was never stored are removed
    async fn keep_or_discard<T, const N: usize>(
        &self,
        result: Result<T, CivicError>,
        stored: [Option<StoredAttachment>; N],
    ) -> Result<T, CivicError> {
        if result.is_err() {
            self.discard(stored).await;
        }
        result
    }

    async fn discard<const N: usize>(&self, stored: [Option<StoredAttachment>; N]) {
        for attachment in stored.into_iter().flatten() {
            self.attachments.remove(&attachment.path).await;
        }
    }
}

// ============================================================================
// Identity for handlers
// ============================================================================

/// Resolve the caller, creating an anonymous principal for a new device.
/// Authenticated callers may announce a push device through headers.
fn resolve(services: &Services, ctx: &RequestContext) -> Result<Principal, CivicError> {
    let principal = services.resolve(ctx.caller())?;
    if ctx.credentials.is_some() {
        if let Some(device) = ctx.push_registration() {
            if let Err(e) = services.notifications.register_device(&principal, &device) {
                warn!(principal = %principal.id, error = %e, "Ignoring push device header");
            }
        }
    }
    Ok(principal)
}

/// Resolve the caller without side effects
fn lookup(services: &Services, ctx: &RequestContext) -> Result<Option<Principal>, CivicError> {
    services.lookup(ctx.caller())
}

/// The caller named by the session token, ignoring the device
fn token_holder(services: &Services, ctx: &RequestContext) -> Result<Option<Principal>, CivicError> {
    services.lookup(Caller {
        credentials: ctx.credentials.as_ref(),
        device_id: None,
    })
}

/// A known caller for a single-resource read. A device the store has never
/// seen cannot own anything, so the resource reads as missing.
fn viewer(services: &Services, ctx: &RequestContext, resource: &str) -> Result<Principal, CivicError> {
    match lookup(services, ctx)? {
        Some(principal) => Ok(principal),
        None if ctx.credentials.is_none() && ctx.device_id.is_none() => Err(CivicError::MissingIdentity),
        None => Err(CivicError::NotFound(resource.to_string())),
    }
}
