//! Webhook registrations and delivery logs.

use serde::Serialize;
use sqlx::AnyConnection;

use super::{DalError, DalResult, now_ms};

/// Webhooks allowed per namespace (and globally).
pub const MAX_PER_NAMESPACE: i64 = 5;

/// A webhook row. `events` is a comma separated list of event names.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Webhook {
    pub id: i64,
    pub namespace_id: Option<i64>,
    pub url: String,
    #[serde(skip)]
    pub secret: Option<String>,
    pub ssl_verify: i64,
    pub retry_times: i64,
    /// Seconds between attempts.
    pub retry_duration: i64,
    pub enabled: i64,
    pub events: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Webhook {
    /// Whether the webhook wants `event`.
    pub fn subscribes(&self, event: &str) -> bool {
        self.enabled != 0 && self.events.split(',').any(|e| e.trim() == event)
    }
}

/// Fields of a new webhook.
#[derive(Debug, Clone)]
pub struct NewWebhook<'a> {
    pub namespace_id: Option<i64>,
    pub url: &'a str,
    pub secret: Option<&'a str>,
    pub ssl_verify: bool,
    pub retry_times: i64,
    pub retry_duration: i64,
    pub events: &'a [&'a str],
}

/// A delivery attempt.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct WebhookLog {
    pub id: i64,
    pub webhook_id: Option<i64>,
    pub event: String,
    pub event_action: String,
    pub status_code: i64,
    pub req_header: Vec<u8>,
    pub req_body: Vec<u8>,
    pub resp_header: Vec<u8>,
    pub resp_body: Vec<u8>,
    pub duration_ms: i64,
    pub created_at: i64,
}

/// Fields of a delivery log.
#[derive(Debug, Clone, Default)]
pub struct NewWebhookLog {
    pub webhook_id: Option<i64>,
    pub event: String,
    pub event_action: String,
    pub status_code: i64,
    pub req_header: Vec<u8>,
    pub req_body: Vec<u8>,
    pub resp_header: Vec<u8>,
    pub resp_body: Vec<u8>,
    pub duration_ms: i64,
}

const COLUMNS: &str = "id, namespace_id, url, secret, ssl_verify, retry_times, retry_duration, \
                       enabled, events, created_at, updated_at";

const LOG_COLUMNS: &str = "id, webhook_id, event, event_action, status_code, req_header, \
                           req_body, resp_header, resp_body, duration_ms, created_at";

/// Number of webhooks registered for a namespace, or globally for `None`.
pub async fn count(conn: &mut AnyConnection, namespace_id: Option<i64>) -> DalResult<i64> {
    let count = match namespace_id {
        Some(namespace_id) => {
            sqlx::query_scalar("SELECT COUNT(*) FROM webhooks WHERE namespace_id = $1")
                .bind(namespace_id)
                .fetch_one(conn)
                .await?
        }
        None => {
            sqlx::query_scalar("SELECT COUNT(*) FROM webhooks WHERE namespace_id IS NULL")
                .fetch_one(conn)
                .await?
        }
    };
    Ok(count)
}

/// Register a webhook, enforcing [`MAX_PER_NAMESPACE`].
pub async fn create(conn: &mut AnyConnection, new: &NewWebhook<'_>) -> DalResult<Webhook> {
    if count(&mut *conn, new.namespace_id).await? >= MAX_PER_NAMESPACE {
        return Err(DalError::Conflict(format!(
            "more than {MAX_PER_NAMESPACE} webhooks for this namespace"
        )));
    }
    let now = now_ms();
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO webhooks (namespace_id, url, secret, ssl_verify, retry_times, \
         retry_duration, enabled, events, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, 1, $7, $8, $8) RETURNING id",
    )
    .bind(new.namespace_id)
    .bind(new.url)
    .bind(new.secret)
    .bind(i64::from(new.ssl_verify))
    .bind(new.retry_times)
    .bind(new.retry_duration)
    .bind(new.events.join(","))
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;
    get(conn, id).await
}

/// Look a webhook up by id.
pub async fn get(conn: &mut AnyConnection, id: i64) -> DalResult<Webhook> {
    sqlx::query_as(&format!("SELECT {COLUMNS} FROM webhooks WHERE id = $1"))
        .bind(id)
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| DalError::NotFound(format!("webhook {id}")))
}

/// Enabled webhooks that should see `event` for a namespace: the
/// namespace's own plus the global ones.
pub async fn subscribers(
    conn: &mut AnyConnection,
    namespace_id: Option<i64>,
    event: &str,
) -> DalResult<Vec<Webhook>> {
    let hooks: Vec<Webhook> = match namespace_id {
        Some(namespace_id) => {
            sqlx::query_as(&format!(
                "SELECT {COLUMNS} FROM webhooks \
                 WHERE namespace_id = $1 OR namespace_id IS NULL ORDER BY id"
            ))
            .bind(namespace_id)
            .fetch_all(conn)
            .await?
        }
        None => {
            sqlx::query_as(&format!(
                "SELECT {COLUMNS} FROM webhooks WHERE namespace_id IS NULL ORDER BY id"
            ))
            .fetch_all(conn)
            .await?
        }
    };
    Ok(hooks.into_iter().filter(|h| h.subscribes(event)).collect())
}

/// Remove a webhook and its logs.
pub async fn delete(conn: &mut AnyConnection, id: i64) -> DalResult<()> {
    sqlx::query("DELETE FROM webhooks WHERE id = $1")
        .bind(id)
        .execute(conn)
        .await?;
    Ok(())
}

/// Store a delivery attempt.
pub async fn insert_log(conn: &mut AnyConnection, log: &NewWebhookLog) -> DalResult<i64> {
    Ok(sqlx::query_scalar(
        "INSERT INTO webhook_logs (webhook_id, event, event_action, status_code, req_header, \
         req_body, resp_header, resp_body, duration_ms, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) RETURNING id",
    )
    .bind(log.webhook_id)
    .bind(&log.event)
    .bind(&log.event_action)
    .bind(log.status_code)
    .bind(&log.req_header)
    .bind(&log.req_body)
    .bind(&log.resp_header)
    .bind(&log.resp_body)
    .bind(log.duration_ms)
    .bind(now_ms())
    .fetch_one(conn)
    .await?)
}

/// Look a delivery log up by id.
pub async fn get_log(conn: &mut AnyConnection, id: i64) -> DalResult<WebhookLog> {
    sqlx::query_as(&format!("SELECT {LOG_COLUMNS} FROM webhook_logs WHERE id = $1"))
        .bind(id)
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| DalError::NotFound(format!("webhook log {id}")))
}

/// Delivery logs of a webhook, newest first.
pub async fn list_logs(conn: &mut AnyConnection, webhook_id: i64) -> DalResult<Vec<WebhookLog>> {
    Ok(sqlx::query_as(&format!(
        "SELECT {LOG_COLUMNS} FROM webhook_logs WHERE webhook_id = $1 ORDER BY id DESC"
    ))
    .bind(webhook_id)
    .fetch_all(conn)
    .await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Visibility;
    use crate::dal::{namespaces, testing};

    fn hook(namespace_id: Option<i64>, events: &'static [&'static str]) -> NewWebhook<'static> {
        NewWebhook {
            namespace_id,
            url: "http://127.0.0.1:1/hook",
            secret: Some("s3cret"),
            ssl_verify: true,
            retry_times: 1,
            retry_duration: 0,
            events,
        }
    }

    #[tokio::test]
    async fn namespace_limit_and_subscribers() {
        let dal = testing::dal().await;
        let mut conn = dal.acquire().await.unwrap();
        let ns = namespaces::get_or_create(&mut conn, "library", Visibility::Private)
            .await
            .unwrap();

        for _ in 0..MAX_PER_NAMESPACE {
            create(&mut conn, &hook(Some(ns.id), &["artifact"])).await.unwrap();
        }
        assert!(matches!(
            create(&mut conn, &hook(Some(ns.id), &["artifact"])).await,
            Err(DalError::Conflict(_))
        ));

        let global = create(&mut conn, &hook(None, &["daemon_gc", "tag"])).await.unwrap();
        assert!(global.subscribes("tag"));
        assert!(!global.subscribes("artifact"));

        assert_eq!(
            subscribers(&mut conn, Some(ns.id), "artifact").await.unwrap().len(),
            5
        );
        assert_eq!(subscribers(&mut conn, Some(ns.id), "tag").await.unwrap().len(), 1);
        assert_eq!(subscribers(&mut conn, None, "daemon_gc").await.unwrap().len(), 1);

        let log = insert_log(
            &mut conn,
            &NewWebhookLog {
                webhook_id: Some(global.id),
                event: "tag".into(),
                event_action: "create".into(),
                status_code: 200,
                req_body: b"{}".to_vec(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(get_log(&mut conn, log).await.unwrap().status_code, 200);
        assert_eq!(list_logs(&mut conn, global.id).await.unwrap().len(), 1);
    }
}
