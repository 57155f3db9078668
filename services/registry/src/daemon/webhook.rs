//! Webhook delivery.
//!
//! Events are queued on [`Topic::Webhook`] and fanned out by [`Deliverer`]
//! to every enabled webhook of the event's namespace plus the global ones.
//! Each POST is signed with the webhook's secret, retried `retry_times`
//! times `retry_duration` seconds apart, and every attempt is stored in
//! `webhook_logs` so it can be inspected and resent.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use eyre::WrapErr;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use secret::Secret;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::app::App;
use crate::dal::webhooks::{self, NewWebhookLog, Webhook};
use crate::dal::{Tx, now_ms};
use crate::workq::{Consumer, ConsumerOption, Topic, TopicRegistry, WorkQueueError};

/// HMAC of the body, `sha256=<hex>`.
pub const SIGNATURE: HeaderName = HeaderName::from_static("x-signature");
/// Event class of the delivery.
pub const EVENT: HeaderName = HeaderName::from_static("x-registry-event");
/// Id shared by every attempt of one delivery.
pub const DELIVERY: HeaderName = HeaderName::from_static("x-registry-delivery");

/// Event classes.
pub mod events {
    /// A manifest was pushed or deleted.
    pub const ARTIFACT: &str = "artifact";
    /// A tag was pushed or deleted.
    pub const TAG: &str = "tag";
    /// A garbage collection phase finished.
    pub const DAEMON_GC: &str = "daemon_gc";
}

/// The body POSTed to a webhook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event class, one of [`events`].
    pub event: String,
    /// What happened: `create`, `update`, `delete`, `finish`.
    pub action: String,
    /// Namespace the event belongs to; `None` only reaches global webhooks.
    pub namespace_id: Option<i64>,
    /// Epoch milliseconds.
    pub occurred_at: i64,
    /// Event specific fields.
    pub payload: serde_json::Value,
}

impl Event {
    /// An event happening now.
    pub fn new(
        event: &str,
        action: &str,
        namespace_id: Option<i64>,
        payload: impl Serialize,
    ) -> Self {
        Self {
            event: event.to_owned(),
            action: action.to_owned(),
            namespace_id,
            occurred_at: now_ms(),
            payload: serde_json::to_value(payload).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Job {
    Deliver { event: Event },
    Resend { log_id: i64 },
}

/// Queue `event` for delivery, inside `tx` when given.
pub async fn emit(app: &App, event: Event, tx: Option<&mut Tx>) -> Result<(), WorkQueueError> {
    app.producer()
        .produce(Topic::Webhook, &Job::Deliver { event }, tx)
        .await
}

/// Queue a stored delivery log to be sent again with its original body.
pub async fn resend(app: &App, log_id: i64) -> eyre::Result<()> {
    {
        let mut conn = app.dal().acquire().await?;
        let log = webhooks::get_log(&mut conn, log_id).await?;
        if log.webhook_id.is_none() {
            eyre::bail!("webhook of log {log_id} was deleted");
        }
    }
    app.producer()
        .produce(Topic::Webhook, &Job::Resend { log_id }, None)
        .await?;
    Ok(())
}

pub(super) fn register(registry: &mut TopicRegistry, app: &App) {
    registry.register(
        Topic::Webhook,
        Arc::new(Deliverer { app: app.clone() }),
        ConsumerOption {
            concurrency: 4,
            max_retry: 3,
            timeout: Duration::from_secs(15 * 60),
        },
    );
}

/// Consumes [`Topic::Webhook`].
#[derive(Debug)]
pub struct Deliverer {
    app: App,
}

#[async_trait::async_trait]
impl Consumer for Deliverer {
    async fn handle(&self, ctx: CancellationToken, payload: Bytes) -> eyre::Result<()> {
        let job: Job = serde_json::from_slice(&payload).wrap_err("decode webhook job")?;
        match job {
            Job::Deliver { event } => {
                let hooks = {
                    let mut conn = self.app.dal().acquire().await?;
                    webhooks::subscribers(&mut conn, event.namespace_id, &event.event).await?
                };
                let body = Bytes::from(serde_json::to_vec(&event)?);
                for hook in hooks {
                    let span = tracing::info_span!("webhook", webhook_id = hook.id);
                    deliver(&self.app, &hook, &event.event, &event.action, body.clone(), &ctx)
                        .instrument(span)
                        .await?;
                }
            }
            Job::Resend { log_id } => {
                let (hook, log) = {
                    let mut conn = self.app.dal().acquire().await?;
                    let log = webhooks::get_log(&mut conn, log_id).await?;
                    let Some(webhook_id) = log.webhook_id else {
                        tracing::warn!(log_id, "webhook was deleted, nothing to resend");
                        return Ok(());
                    };
                    (webhooks::get(&mut conn, webhook_id).await?, log)
                };
                let span = tracing::info_span!("webhook", webhook_id = hook.id, log_id);
                deliver(
                    &self.app,
                    &hook,
                    &log.event,
                    &log.event_action,
                    Bytes::from(log.req_body),
                    &ctx,
                )
                .instrument(span)
                .await?;
            }
        }
        Ok(())
    }
}

fn request_headers(hook: &Webhook, event: &str, delivery: &str, body: &[u8]) -> eyre::Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(EVENT, HeaderValue::from_str(event)?);
    headers.insert(DELIVERY, HeaderValue::from_str(delivery)?);
    if let Some(secret) = hook.secret.as_deref().filter(|s| !s.is_empty()) {
        let signature = Secret::from(secret.to_owned()).sign_sha256(body);
        headers.insert(SIGNATURE, HeaderValue::from_str(&format!("sha256={signature}"))?);
    }
    Ok(headers)
}

fn headers_json(headers: &HeaderMap) -> Vec<u8> {
    let map: BTreeMap<&str, String> = headers
        .iter()
        .map(|(name, value)| (name.as_str(), String::from_utf8_lossy(value.as_bytes()).into_owned()))
        .collect();
    serde_json::to_vec(&map).unwrap_or_default()
}

/// POST `body` to `hook` until it answers 2xx or the attempts run out.
/// Returns whether it was delivered. Only database failures are errors;
/// an unreachable webhook is logged and given up on.
async fn deliver(
    app: &App,
    hook: &Webhook,
    event: &str,
    action: &str,
    body: Bytes,
    ctx: &CancellationToken,
) -> eyre::Result<bool> {
    let delivery = uuid::Uuid::new_v4().to_string();
    let headers = request_headers(hook, event, &delivery, &body)?;
    let client = app.http_client(hook.ssl_verify != 0);
    let attempts = hook.retry_times.max(0) + 1;
    let spacing = Duration::from_secs(hook.retry_duration.max(0) as u64);

    for attempt in 1..=attempts {
        let started = Instant::now();
        let mut log = NewWebhookLog {
            webhook_id: Some(hook.id),
            event: event.to_owned(),
            event_action: action.to_owned(),
            req_header: headers_json(&headers),
            req_body: body.to_vec(),
            ..Default::default()
        };
        let sent = client
            .post(&hook.url)
            .headers(headers.clone())
            .body(body.clone())
            .send()
            .await;
        match sent {
            Ok(response) => {
                log.status_code = i64::from(response.status().as_u16());
                log.resp_header = headers_json(response.headers());
                log.resp_body = response.bytes().await.map(|b| b.to_vec()).unwrap_or_default();
            }
            Err(error) => {
                log.resp_body = error.to_string().into_bytes();
            }
        }
        log.duration_ms = started.elapsed().as_millis() as i64;

        let ok = (200..300).contains(&log.status_code);
        {
            let mut conn = app.dal().acquire().await?;
            webhooks::insert_log(&mut conn, &log).await?;
        }
        if ok {
            tracing::debug!(attempt, status = log.status_code, "webhook delivered");
            return Ok(true);
        }
        tracing::warn!(attempt, attempts, status = log.status_code, "webhook delivery failed");
        if attempt < attempts {
            tokio::select! {
                _ = ctx.cancelled() => return Ok(false),
                _ = tokio::time::sleep(spacing) => {}
            }
        }
    }
    tracing::error!(url = %hook.url, "giving up on webhook");
    Ok(false)
}

#[cfg(test)]
mod tests {
    use axum::Router;
    use axum::extract::State;
    use axum::http::{HeaderMap as AxumHeaders, StatusCode};
    use axum::routing::post;
    use parking_lot::Mutex;

    use super::*;
    use crate::app::testing;
    use crate::dal::webhooks::NewWebhook;

    #[derive(Debug, Default)]
    struct Received {
        requests: Mutex<Vec<(AxumHeaders, Bytes)>>,
    }

    /// A webhook receiver on a random port answering with `status`.
    async fn receiver(status: StatusCode) -> (String, Arc<Received>) {
        let received = Arc::new(Received::default());
        let router = Router::new()
            .route(
                "/hook",
                post(
                    move |State(received): State<Arc<Received>>, headers: AxumHeaders, body: Bytes| async move {
                        received.requests.lock().push((headers, body));
                        status
                    },
                ),
            )
            .with_state(Arc::clone(&received));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
        (format!("http://{addr}/hook"), received)
    }

    async fn register_hook(app: &App, url: &str, retry_times: i64) -> Webhook {
        let mut conn = app.dal().acquire().await.unwrap();
        webhooks::create(
            &mut conn,
            &NewWebhook {
                namespace_id: None,
                url,
                secret: Some("s3cret"),
                ssl_verify: true,
                retry_times,
                retry_duration: 0,
                events: &[events::ARTIFACT],
            },
        )
        .await
        .unwrap()
    }

    fn deliver_job(event: &Event) -> Bytes {
        Bytes::from(serde_json::to_vec(&Job::Deliver { event: event.clone() }).unwrap())
    }

    #[tokio::test]
    async fn delivers_signed_events() {
        let (app, _dir) = testing::app().await;
        let (url, received) = receiver(StatusCode::OK).await;
        let hook = register_hook(&app, &url, 2).await;

        let event = Event::new(events::ARTIFACT, "create", Some(7), serde_json::json!({"digest": "sha256:00"}));
        let deliverer = Deliverer { app: app.clone() };
        deliverer
            .handle(CancellationToken::new(), deliver_job(&event))
            .await
            .unwrap();

        let requests = received.requests.lock().clone();
        assert_eq!(requests.len(), 1);
        let (headers, body) = &requests[0];
        assert_eq!(headers["x-registry-event"], "artifact");
        let signature = headers["x-signature"].to_str().unwrap();
        let hex = signature.strip_prefix("sha256=").unwrap();
        assert!(Secret::from("s3cret").verify_sha256(body, hex));
        let sent: Event = serde_json::from_slice(body).unwrap();
        assert_eq!(sent, event);

        let mut conn = app.dal().acquire().await.unwrap();
        let logs = webhooks::list_logs(&mut conn, hook.id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status_code, 200);
    }

    #[tokio::test]
    async fn failed_deliveries_are_retried_and_logged() {
        let (app, _dir) = testing::app().await;
        let (url, received) = receiver(StatusCode::INTERNAL_SERVER_ERROR).await;
        let hook = register_hook(&app, &url, 2).await;

        let event = Event::new(events::ARTIFACT, "delete", None, serde_json::json!({}));
        Deliverer { app: app.clone() }
            .handle(CancellationToken::new(), deliver_job(&event))
            .await
            .unwrap();

        assert_eq!(received.requests.lock().len(), 3);
        let mut conn = app.dal().acquire().await.unwrap();
        let logs = webhooks::list_logs(&mut conn, hook.id).await.unwrap();
        assert_eq!(logs.len(), 3);
        assert!(logs.iter().all(|log| log.status_code == 500));
    }

    #[tokio::test]
    async fn unsubscribed_events_are_not_sent() {
        let (app, _dir) = testing::app().await;
        let (url, received) = receiver(StatusCode::OK).await;
        register_hook(&app, &url, 0).await;

        let event = Event::new(events::TAG, "create", None, serde_json::json!({}));
        Deliverer { app: app.clone() }
            .handle(CancellationToken::new(), deliver_job(&event))
            .await
            .unwrap();
        assert!(received.requests.lock().is_empty());
    }

    #[tokio::test]
    async fn resend_replays_the_stored_body() {
        let (app, _dir) = testing::app().await;
        let (url, received) = receiver(StatusCode::OK).await;
        let hook = register_hook(&app, &url, 0).await;

        let event = Event::new(events::ARTIFACT, "create", None, serde_json::json!({"n": 1}));
        let deliverer = Deliverer { app: app.clone() };
        deliverer
            .handle(CancellationToken::new(), deliver_job(&event))
            .await
            .unwrap();
        let log_id = {
            let mut conn = app.dal().acquire().await.unwrap();
            webhooks::list_logs(&mut conn, hook.id).await.unwrap()[0].id
        };

        assert!(resend(&app, log_id + 100).await.is_err());
        let job = Bytes::from(serde_json::to_vec(&Job::Resend { log_id }).unwrap());
        deliverer.handle(CancellationToken::new(), job).await.unwrap();

        let requests = received.requests.lock().clone();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].1, requests[1].1);
        assert_ne!(requests[0].0["x-registry-delivery"], requests[1].0["x-registry-delivery"]);
    }
}
