//! Inbound tracker events, validated into a tagged type at the boundary.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::errors::RouteError;

#[derive(Debug, Clone, PartialEq)]
pub struct IssueEvent {
    pub item_id: String,
    pub identifier: String,
    pub status: String,
    pub parent_id: Option<String>,
    pub team_id: Option<String>,
    pub actor_id: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommentEvent {
    pub comment_id: String,
    pub item_id: String,
    pub parent_comment_id: Option<String>,
    pub body: String,
    pub author_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TrackerEvent {
    IssueCreated(IssueEvent),
    IssueUpdated(IssueEvent),
    CommentCreated(CommentEvent),
    CommentUpdated(CommentEvent),
}

impl TrackerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            TrackerEvent::IssueCreated(_) => "issue-created",
            TrackerEvent::IssueUpdated(_) => "issue-updated",
            TrackerEvent::CommentCreated(_) => "comment-created",
            TrackerEvent::CommentUpdated(_) => "comment-updated",
        }
    }

    pub fn item_id(&self) -> &str {
        match self {
            TrackerEvent::IssueCreated(e) | TrackerEvent::IssueUpdated(e) => &e.item_id,
            TrackerEvent::CommentCreated(e) | TrackerEvent::CommentUpdated(e) => &e.item_id,
        }
    }
}

/// A validated event plus the key used to drop redeliveries.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub delivery_key: Option<String>,
    pub event: TrackerEvent,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEvent {
    event_type: Option<String>,
    action: Option<String>,
    delivery_id: Option<String>,
    item_id: Option<String>,
    identifier: Option<String>,
    status: Option<String>,
    parent_id: Option<String>,
    team_id: Option<String>,
    actor_id: Option<String>,
    title: Option<String>,
    description: Option<String>,
    comment_id: Option<String>,
    parent_comment_id: Option<String>,
    body: Option<String>,
    author_id: Option<String>,
    created_at: Option<String>,
}

fn required(value: Option<String>, field: &str) -> Result<String, RouteError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| RouteError::Malformed(format!("missing field '{}'", field)))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Parse and validate a raw webhook body.
///
/// Issue events are keyed by `deliveryId` when present; without one the
/// stored-status comparison already drops repeats. Comment events fall back
/// to a hash of the raw body, since a replayed reply must never be counted
/// twice.
pub fn parse_event(raw: &[u8]) -> Result<Envelope, RouteError> {
    let parsed: RawEvent =
        serde_json::from_slice(raw).map_err(|e| RouteError::Malformed(format!("invalid JSON: {}", e)))?;

    let event_type = required(parsed.event_type, "eventType")?.to_lowercase();
    let action = required(parsed.action, "action")?.to_lowercase();
    let delivery_id = non_empty(parsed.delivery_id).map(|id| format!("delivery:{}", id));

    match event_type.as_str() {
        "issue" => {
            let item_id = required(parsed.item_id, "itemId")?;
            let issue = IssueEvent {
                identifier: non_empty(parsed.identifier).unwrap_or_else(|| item_id.clone()),
                item_id,
                status: required(parsed.status, "status")?.trim().to_string(),
                parent_id: non_empty(parsed.parent_id),
                team_id: non_empty(parsed.team_id),
                actor_id: non_empty(parsed.actor_id),
                title: parsed.title,
                description: parsed.description,
            };
            let event = match action.as_str() {
                "create" => TrackerEvent::IssueCreated(issue),
                "update" => TrackerEvent::IssueUpdated(issue),
                other => return Err(RouteError::Malformed(format!("unknown issue action '{}'", other))),
            };
            Ok(Envelope {
                delivery_key: delivery_id,
                event,
            })
        }
        "comment" => {
            let created_at = required(parsed.created_at, "createdAt")?;
            let created_at = DateTime::parse_from_rfc3339(&created_at)
                .map_err(|e| RouteError::Malformed(format!("invalid createdAt '{}': {}", created_at, e)))?
                .with_timezone(&Utc);
            let comment = CommentEvent {
                comment_id: required(parsed.comment_id, "commentId")?,
                item_id: required(parsed.item_id, "itemId")?,
                parent_comment_id: non_empty(parsed.parent_comment_id),
                body: parsed
                    .body
                    .ok_or_else(|| RouteError::Malformed("missing field 'body'".to_string()))?,
                author_id: required(parsed.author_id, "authorId")?,
                created_at,
            };
            let event = match action.as_str() {
                "create" => TrackerEvent::CommentCreated(comment),
                "update" => TrackerEvent::CommentUpdated(comment),
                other => return Err(RouteError::Malformed(format!("unknown comment action '{}'", other))),
            };
            Ok(Envelope {
                delivery_key: delivery_id.or_else(|| Some(format!("body:{}", hex::encode(Sha256::digest(raw))))),
                event,
            })
        }
        other => Err(RouteError::Malformed(format!("unknown eventType '{}'", other))),
    }
}
