//! RIS Live wire types
//!
//! Outbound `ris_subscribe` request and decoding of inbound `ris_message`
//! frames into [`RouteUpdate`] records (one per affected prefix).

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{RouteUpdate, SubscriptionSpec, UpdateKind};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RisSubscribeMessage {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub data: RisSubscribeData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RisSubscribeData {
    #[serde(rename = "type")]
    pub message_type: String,
    pub prefix: Vec<String>,
    #[serde(rename = "moreSpecific")]
    pub more_specific: bool,
}

impl RisSubscribeMessage {
    pub fn for_spec(spec: &SubscriptionSpec) -> Self {
        Self {
            msg_type: "ris_subscribe".to_string(),
            data: RisSubscribeData {
                message_type: "UPDATE".to_string(),
                prefix: spec.prefixes.clone(),
                more_specific: spec.more_specific,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct RisEnvelope {
    #[serde(rename = "type")]
    msg_type: String,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RisUpdateData {
    #[serde(default)]
    timestamp: Option<f64>,
    #[serde(default)]
    peer: Option<String>,
    #[serde(default)]
    host: Option<String>,
    #[serde(default)]
    path: Vec<PathSegment>,
    #[serde(default)]
    announcements: Vec<RisAnnouncement>,
    #[serde(default)]
    withdrawals: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RisAnnouncement {
    #[serde(default)]
    prefixes: Vec<String>,
}

/// Path hop: a single network or an unordered set of them
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PathSegment {
    Number(u64),
    Text(String),
    Set(Vec<serde_json::Value>),
}

impl PathSegment {
    fn render(&self) -> Option<String> {
        match self {
            PathSegment::Number(n) => Some(n.to_string()),
            PathSegment::Text(s) if !s.is_empty() => Some(s.clone()),
            PathSegment::Text(_) => None,
            // Sets have no order; the first member stands in for the hop
            PathSegment::Set(members) => members.first().map(|m| match m {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            }),
        }
    }
}

/// One decoded inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum RisFrame {
    Updates(Vec<RouteUpdate>),
    /// Subscription acks, pongs and other non-update frames
    Control(String),
    /// Server-reported error (`ris_error`)
    ServerError(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    Json(String),
    MissingData,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Json(e) => write!(f, "malformed frame: {}", e),
            DecodeError::MissingData => write!(f, "ris_message without data"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// `peer@host` when both are known, otherwise whichever is present
pub fn vantage_point_id(peer: Option<&str>, host: Option<&str>) -> String {
    let peer = peer.filter(|s| !s.is_empty());
    let host = host.filter(|s| !s.is_empty());
    match (peer, host) {
        (Some(p), Some(h)) => format!("{}@{}", p, h),
        (Some(p), None) => p.to_string(),
        (None, Some(h)) => h.to_string(),
        (None, None) => String::new(),
    }
}

fn observed_at(timestamp: Option<f64>) -> DateTime<Utc> {
    timestamp
        .and_then(|ts| Utc.timestamp_millis_opt((ts * 1000.0) as i64).single())
        .unwrap_or_else(Utc::now)
}

pub fn decode_frame(text: &str) -> Result<RisFrame, DecodeError> {
    let envelope: RisEnvelope =
        serde_json::from_str(text).map_err(|e| DecodeError::Json(e.to_string()))?;

    match envelope.msg_type.as_str() {
        "ris_message" => {
            let data = envelope.data.ok_or(DecodeError::MissingData)?;
            let data: RisUpdateData =
                serde_json::from_value(data).map_err(|e| DecodeError::Json(e.to_string()))?;
            Ok(RisFrame::Updates(updates_from(data)))
        }
        "ris_error" => {
            let message = envelope
                .data
                .as_ref()
                .and_then(|d| d.get("message"))
                .and_then(|m| m.as_str())
                .unwrap_or("unspecified")
                .to_string();
            Ok(RisFrame::ServerError(message))
        }
        other => Ok(RisFrame::Control(other.to_string())),
    }
}

fn updates_from(data: RisUpdateData) -> Vec<RouteUpdate> {
    let vantage_point = vantage_point_id(data.peer.as_deref(), data.host.as_deref());
    let observed_at = observed_at(data.timestamp);
    let path: Vec<String> = data.path.iter().filter_map(PathSegment::render).collect();
    let origin_id = path.last().cloned();

    let mut updates = Vec::with_capacity(
        data.withdrawals.len()
            + data
                .announcements
                .iter()
                .map(|a| a.prefixes.len())
                .sum::<usize>(),
    );

    // Withdrawn routes precede reachability info within one BGP UPDATE
    for prefix in data.withdrawals {
        updates.push(RouteUpdate {
            prefix,
            vantage_point: vantage_point.clone(),
            kind: UpdateKind::Withdraw,
            origin_id: None,
            path: Vec::new(),
            observed_at,
        });
    }

    for announcement in data.announcements {
        for prefix in announcement.prefixes {
            updates.push(RouteUpdate {
                prefix,
                vantage_point: vantage_point.clone(),
                kind: UpdateKind::Announce,
                origin_id: origin_id.clone(),
                path: path.clone(),
                observed_at,
            });
        }
    }

    updates
}
