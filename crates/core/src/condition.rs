//! Sync conditions written to the local object's `status.conditions`.
//!
//! The agent owns exactly one condition type (`AgentSynced`). Writing it replaces
//! any previous entry of that type; conditions of other types (for example ones
//! mirrored from the remote status) pass through untouched.

use chrono::{DateTime, Utc};
use kube::api::DynamicObject;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

pub const TYPE_AGENT_SYNCED: &str = "AgentSynced";
pub const REASON_SYNC_SUCCESS: &str = "AgentSyncSuccess";
pub const REASON_SYNC_ERROR: &str = "AgentSyncError";

/// Condition status following Kubernetes conventions
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    /// The last pass synchronized the object successfully.
    pub fn agent_sync_success() -> Self {
        Self::new(TYPE_AGENT_SYNCED, ConditionStatus::True, REASON_SYNC_SUCCESS, "")
    }

    /// The last pass failed; the message carries the full error chain text.
    pub fn agent_sync_error(err: &dyn std::error::Error) -> Self {
        Self::new(TYPE_AGENT_SYNCED, ConditionStatus::False, REASON_SYNC_ERROR, err.to_string())
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Equality ignoring `last_transition_time`.
    pub fn equal(&self, other: &Condition) -> bool {
        self.type_ == other.type_
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
    }

    fn to_json(&self) -> Json {
        let mut v = serde_json::json!({
            "type": self.type_,
            "status": match self.status {
                ConditionStatus::True => "True",
                ConditionStatus::False => "False",
                ConditionStatus::Unknown => "Unknown",
            },
            "reason": self.reason,
            "lastTransitionTime": self.last_transition_time.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        });
        if !self.message.is_empty() {
            v["message"] = Json::String(self.message.clone());
        }
        v
    }
}

/// Replace-by-type: returns `existing` with the entry of `new.type_` swapped for
/// `new`, or `new` appended when absent. Duplicate entries of the same type are
/// collapsed. An entry equal to `new` (ignoring the timestamp) is kept as-is so
/// its transition time survives repeated passes.
pub fn upsert_conditions(existing: Vec<Json>, new: &Condition) -> Vec<Json> {
    let mut out = Vec::with_capacity(existing.len() + 1);
    let mut placed = false;
    for entry in existing {
        if entry.get("type").and_then(Json::as_str) != Some(new.type_.as_str()) {
            out.push(entry);
            continue;
        }
        if placed {
            continue;
        }
        let unchanged = serde_json::from_value::<Condition>(entry.clone())
            .map(|old| old.equal(new))
            .unwrap_or(false);
        out.push(if unchanged { entry } else { new.to_json() });
        placed = true;
    }
    if !placed {
        out.push(new.to_json());
    }
    out
}

/// Parsed conditions of a dynamic object; malformed entries are skipped.
pub fn conditions(obj: &DynamicObject) -> Vec<Condition> {
    obj.data
        .get("status")
        .and_then(|s| s.get("conditions"))
        .and_then(Json::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|c| serde_json::from_value::<Condition>(c.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

/// Condition of the given type, if present and well-formed.
pub fn condition(obj: &DynamicObject, type_: &str) -> Option<Condition> {
    conditions(obj).into_iter().find(|c| c.type_ == type_)
}

/// Set `c` on the object's `status.conditions`, creating `status` when needed.
pub fn set_condition(obj: &mut DynamicObject, c: Condition) {
    if !obj.data.is_object() {
        obj.data = Json::Object(serde_json::Map::new());
    }
    let data = match obj.data.as_object_mut() {
        Some(d) => d,
        None => return,
    };
    let status = data.entry("status").or_insert_with(|| Json::Object(serde_json::Map::new()));
    if !status.is_object() {
        *status = Json::Object(serde_json::Map::new());
    }
    let Some(status) = status.as_object_mut() else { return };
    let existing = status
        .get("conditions")
        .and_then(Json::as_array)
        .cloned()
        .unwrap_or_default();
    status.insert("conditions".into(), Json::Array(upsert_conditions(existing, &c)));
}
