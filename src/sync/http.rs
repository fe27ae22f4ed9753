//! HTTP remote adapter
//!
//! Talks to the hosted service over JSON/HTTPS:
//!
//! - `POST {endpoint}/sync` with `{"sync_token": ..}` returns the changed
//!   objects grouped per kind (`projects`, `sections`, `labels`, `filters`,
//!   `items`, `notes`) plus the next `sync_token`
//! - `POST {endpoint}/commands` with one `{type, uuid, temp_id, args}` command
//!   returns `sync_status` keyed by uuid and a `temp_id_mapping`
//!
//! The command `uuid` is the mutation token, which is what lets the service
//! drop duplicate submissions.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, StatusCode};
use serde_json::{json, Map, Value};
use tracing::debug;

use super::api::{ApiError, RemoteApi};
use crate::domain::{
    Ack, Change, Delta, Entity, EntityId, EntityKind, Mutation, MutationOp, Payload, SyncCursor,
};

/// Response collections in the order they are applied (parents first)
const COLLECTIONS: [(&str, EntityKind); 6] = [
    ("projects", EntityKind::Project),
    ("sections", EntityKind::Section),
    ("labels", EntityKind::Label),
    ("filters", EntityKind::Filter),
    ("items", EntityKind::Item),
    ("notes", EntityKind::Note),
];

/// Fields carried outside the payload
const RESERVED_FIELDS: [&str; 4] = ["id", "revision", "updated_at", "is_deleted"];

/// Remote service over HTTPS
pub struct HttpRemote {
    client: Client,
    endpoint: String,
    token: String,
}

impl HttpRemote {
    /// Per-request timeout
    const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new(endpoint: &str, token: &str) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Self::REQUEST_TIMEOUT)
            .user_agent(concat!("tandem/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ApiError::Network(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value, ApiError> {
        let url = format!("{}/{}", self.endpoint, path);
        debug!(url = %url, "POST");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.token))
            .json(body)
            .send()
            .await
            .map_err(|e| ApiError::Network(format!("request to {} failed: {}", url, e)))?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);

        if let Some(error) = classify_status(status, retry_after) {
            return Err(error);
        }

        response
            .json()
            .await
            .map_err(|e| ApiError::Malformed(format!("invalid response body: {}", e)))
    }
}

#[async_trait]
impl RemoteApi for HttpRemote {
    async fn pull(&self, cursor: &SyncCursor) -> Result<Delta, ApiError> {
        let body = self
            .post("sync", &json!({ "sync_token": cursor.token }))
            .await?;
        decode_sync_response(&body)
    }

    async fn push(&self, mutation: &Mutation) -> Result<Ack, ApiError> {
        let body = self.post("commands", &encode_command(mutation)).await?;
        decode_command_response(mutation, &body)
    }
}

/// Maps a non-success HTTP status to an API error
pub fn classify_status(status: StatusCode, retry_after: Option<Duration>) -> Option<ApiError> {
    if status.is_success() {
        return None;
    }

    let error = match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ApiError::Unauthorized(format!("HTTP {}", status))
        }
        StatusCode::TOO_MANY_REQUESTS => ApiError::RateLimited { retry_after },
        s if s.is_server_error() => ApiError::Network(format!("HTTP {}", status)),
        _ => ApiError::Rejected(format!("HTTP {}", status)),
    };

    Some(error)
}

/// Command type, e.g. `item_add`, `project_update`
fn command_type(kind: EntityKind, op: MutationOp) -> String {
    let verb = match op {
        MutationOp::Create => "add",
        MutationOp::Update => "update",
        MutationOp::Delete => "delete",
    };
    format!("{}_{}", kind, verb)
}

/// Encodes a mutation as a service command
pub fn encode_command(mutation: &Mutation) -> Value {
    let mut args: Map<String, Value> = mutation.fields.clone().into_iter().collect();
    let mut command = Map::new();

    command.insert(
        "type".to_string(),
        Value::String(command_type(mutation.kind, mutation.op)),
    );
    command.insert(
        "uuid".to_string(),
        Value::String(mutation.token.to_string()),
    );

    match mutation.op {
        MutationOp::Create => {
            command.insert(
                "temp_id".to_string(),
                Value::String(mutation.entity_id.to_string()),
            );
        }
        MutationOp::Update | MutationOp::Delete => {
            args.insert(
                "id".to_string(),
                Value::String(mutation.entity_id.to_string()),
            );
        }
    }

    command.insert("args".to_string(), Value::Object(args));
    Value::Object(command)
}

/// Decodes the `/commands` response for one pushed mutation
pub fn decode_command_response(mutation: &Mutation, body: &Value) -> Result<Ack, ApiError> {
    let status = body
        .get("sync_status")
        .and_then(|s| s.get(mutation.token.as_str()))
        .ok_or_else(|| {
            ApiError::Malformed(format!("no sync_status for command {}", mutation.token))
        })?;

    if status.as_str() != Some("ok") {
        let message = status
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("command failed");
        return Err(ApiError::CommandRejected(message.to_string()));
    }

    let assigned_id = match mutation.op {
        MutationOp::Create => body
            .get("temp_id_mapping")
            .and_then(|m| m.get(mutation.entity_id.as_str()))
            .map(id_from_value)
            .transpose()?,
        _ => None,
    };

    let revision = body.get("revision").and_then(Value::as_u64).unwrap_or(0);

    Ok(Ack {
        token: mutation.token.clone(),
        assigned_id,
        revision,
    })
}

/// Decodes the `/sync` response into a delta
pub fn decode_sync_response(body: &Value) -> Result<Delta, ApiError> {
    let token = body
        .get("sync_token")
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::Malformed("missing sync_token".to_string()))?;

    let mut changes = Vec::new();
    for (collection, kind) in COLLECTIONS {
        let Some(objects) = body.get(collection) else {
            continue;
        };
        let objects = objects
            .as_array()
            .ok_or_else(|| ApiError::Malformed(format!("'{}' is not an array", collection)))?;

        for object in objects {
            changes.push(decode_object(kind, object)?);
        }
    }

    let mut delta = Delta::new(changes, token);
    delta.full_sync = body
        .get("full_sync")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    Ok(delta)
}

fn decode_object(kind: EntityKind, object: &Value) -> Result<Change, ApiError> {
    let map = object
        .as_object()
        .ok_or_else(|| ApiError::Malformed(format!("{} entry is not an object", kind)))?;

    let id = map
        .get("id")
        .ok_or_else(|| ApiError::Malformed(format!("{} entry without id", kind)))
        .and_then(id_from_value)?;

    let revision = map
        .get("revision")
        .and_then(Value::as_u64)
        .ok_or_else(|| ApiError::Malformed(format!("{} {} without revision", kind, id)))?;

    if map.get("is_deleted").and_then(Value::as_bool).unwrap_or(false) {
        return Ok(Change::Remove { id, kind, revision });
    }

    let updated_at = match map.get("updated_at").and_then(Value::as_str) {
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| ApiError::Malformed(format!("bad updated_at '{}': {}", raw, e)))?,
        // Filled in from the stored version at merge time
        None => Entity::unknown_update_time(),
    };

    let payload: Payload = map
        .iter()
        .filter(|(k, _)| !RESERVED_FIELDS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let mut entity = Entity::new(id, kind, revision, updated_at);
    entity.payload = payload;

    Ok(Change::Upsert(entity))
}

/// Accepts both string and numeric IDs
fn id_from_value(value: &Value) -> Result<EntityId, ApiError> {
    let raw = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => return Err(ApiError::Malformed(format!("invalid id {}", other))),
    };
    raw.parse()
        .map_err(|e| ApiError::Malformed(format!("invalid id: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MutationToken;

    fn mutation(id: &str, op: MutationOp) -> Mutation {
        let entity_id: EntityId = id.parse().unwrap();
        let now = Utc::now();
        let mut fields = Payload::new();
        fields.insert("content".to_string(), json!("Buy milk"));
        Mutation {
            seq: 3,
            token: MutationToken::new(&entity_id, op.as_str(), 3, now),
            entity_id,
            kind: EntityKind::Item,
            op,
            fields,
            queued_at: now,
        }
    }

    #[test]
    fn status_mapping() {
        assert!(classify_status(StatusCode::OK, None).is_none());
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, None),
            Some(ApiError::Unauthorized(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, None),
            Some(ApiError::Unauthorized(_))
        ));
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(3))),
            Some(ApiError::RateLimited {
                retry_after: Some(Duration::from_secs(3))
            })
        );
        assert!(classify_status(StatusCode::BAD_GATEWAY, None)
            .unwrap()
            .is_retryable());
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, None),
            Some(ApiError::Rejected(_))
        ));
    }

    #[test]
    fn create_command_carries_temp_id_and_uuid() {
        let m = mutation("tmp-1a2b3c4", MutationOp::Create);
        let command = encode_command(&m);

        assert_eq!(command["type"], "item_add");
        assert_eq!(command["uuid"], m.token.as_str());
        assert_eq!(command["temp_id"], "tmp-1a2b3c4");
        assert_eq!(command["args"]["content"], "Buy milk");
        assert!(command["args"].get("id").is_none());
    }

    #[test]
    fn update_command_targets_id() {
        let m = mutation("2995104339", MutationOp::Update);
        let command = encode_command(&m);

        assert_eq!(command["type"], "item_update");
        assert_eq!(command["args"]["id"], "2995104339");
        assert!(command.get("temp_id").is_none());
    }

    #[test]
    fn command_response_maps_temp_id() {
        let m = mutation("tmp-1a2b3c4", MutationOp::Create);
        let body = json!({
            "sync_status": { m.token.as_str(): "ok" },
            "temp_id_mapping": { "tmp-1a2b3c4": 6523 },
            "revision": 12
        });

        let ack = decode_command_response(&m, &body).unwrap();
        assert_eq!(ack.token, m.token);
        assert_eq!(ack.assigned_id, Some("6523".parse().unwrap()));
        assert_eq!(ack.revision, 12);
    }

    #[test]
    fn command_error_is_rejected() {
        let m = mutation("42", MutationOp::Delete);
        let body = json!({
            "sync_status": { m.token.as_str(): { "error_code": 22, "error": "Item not found" } }
        });

        assert_eq!(
            decode_command_response(&m, &body),
            Err(ApiError::CommandRejected("Item not found".to_string()))
        );
    }

    #[test]
    fn missing_status_is_malformed() {
        let m = mutation("42", MutationOp::Delete);
        let err = decode_command_response(&m, &json!({})).unwrap_err();
        assert!(matches!(err, ApiError::Malformed(_)));
    }

    #[test]
    fn sync_response_orders_parents_first() {
        let body = json!({
            "sync_token": "tok-2",
            "full_sync": true,
            "items": [
                { "id": "10", "revision": 4, "updated_at": "2024-03-01T10:00:00Z",
                  "content": "Write report", "project_id": "1", "priority": 4 }
            ],
            "projects": [
                { "id": 1, "revision": 2, "name": "Work" },
                { "id": "2", "revision": 3, "is_deleted": true }
            ]
        });

        let delta = decode_sync_response(&body).unwrap();
        assert!(delta.full_sync);
        assert_eq!(delta.next_cursor.token, "tok-2");
        assert_eq!(delta.changes.len(), 3);

        assert_eq!(delta.changes[0].id().as_str(), "1");
        assert!(matches!(delta.changes[1], Change::Remove { .. }));

        match &delta.changes[2] {
            Change::Upsert(item) => {
                assert_eq!(item.kind, EntityKind::Item);
                assert_eq!(item.revision, 4);
                assert_eq!(item.title(), "Write report");
                assert!(item.field("revision").is_none());
                assert!(item.field("id").is_none());
            }
            other => panic!("expected upsert, got {:?}", other),
        }
    }

    #[test]
    fn missing_updated_at_is_left_unknown() {
        let body = json!({
            "sync_token": "tok-3",
            "labels": [{ "id": "5", "revision": 9, "name": "errand" }]
        });

        let delta = decode_sync_response(&body).unwrap();
        match &delta.changes[0] {
            Change::Upsert(label) => assert!(!label.has_known_update_time()),
            other => panic!("expected upsert, got {:?}", other),
        }
    }

    #[test]
    fn sync_response_without_token_is_malformed() {
        let err = decode_sync_response(&json!({ "items": [] })).unwrap_err();
        assert!(matches!(err, ApiError::Malformed(_)));
    }

    #[test]
    fn object_without_revision_is_malformed() {
        let body = json!({ "sync_token": "t", "labels": [ { "id": "5", "name": "home" } ] });
        assert!(decode_sync_response(&body).is_err());
    }
}
