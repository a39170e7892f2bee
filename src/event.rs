//! Lifecycle notification parsing
//!
//! The autoscaler reaches the controller in several envelopes: a lifecycle
//! hook notification relayed through SNS, the same notification delivered
//! through EventBridge, or a bare `{instanceId, lifecycleTransition}` record
//! from a test harness. All of them are validated here into one
//! [`LifecycleEvent`] so coordinators never see an untyped payload.

use std::fmt;

use serde::Deserialize;
use serde_json::Value;

use crate::Error;

/// Substring marking a scale-out transition
pub const LAUNCHING_MARKER: &str = "LAUNCHING";

/// Substring marking a scale-in transition
pub const TERMINATING_MARKER: &str = "TERMINATING";

/// Instance id reported for notifications that carry none (test notifications)
pub const UNKNOWN_INSTANCE_ID: &str = "unknown";

/// Classified lifecycle transition
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    /// Instance is being added to the fleet
    Launching,
    /// Instance is being removed from the fleet
    Terminating,
    /// Anything else; ignored
    Unknown,
}

impl Transition {
    /// Classify a provider transition label by substring match
    pub fn classify(label: &str) -> Self {
        let upper = label.to_ascii_uppercase();
        if upper.contains(LAUNCHING_MARKER) {
            Self::Launching
        } else if upper.contains(TERMINATING_MARKER) {
            Self::Terminating
        } else {
            Self::Unknown
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Launching => "launching",
            Self::Terminating => "terminating",
            Self::Unknown => "unknown",
        })
    }
}

/// Coordinates of the lifecycle hook that produced a notification
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LifecycleHookRef {
    /// Auto Scaling group name
    pub auto_scaling_group: String,
    /// Lifecycle hook name
    pub hook_name: String,
    /// Token identifying this lifecycle action
    pub action_token: Option<String>,
}

/// One validated lifecycle notification
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LifecycleEvent {
    /// Instance the transition applies to
    pub instance_id: String,
    /// Classified transition
    pub transition: Transition,
    /// Transition label as received
    pub raw_transition: String,
    /// Hook coordinates, when the notification came from a lifecycle hook
    pub hook: Option<LifecycleHookRef>,
}

/// Bare record: `{"instanceId": "...", "lifecycleTransition": "..."}`
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DirectRecord {
    instance_id: Option<String>,
    lifecycle_transition: Option<String>,
}

/// Auto Scaling lifecycle hook notification body
#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HookNotification {
    #[serde(rename = "EC2InstanceId")]
    ec2_instance_id: Option<String>,
    lifecycle_transition: Option<String>,
    lifecycle_hook_name: Option<String>,
    auto_scaling_group_name: Option<String>,
    lifecycle_action_token: Option<String>,
    /// Present on `autoscaling:TEST_NOTIFICATION`
    event: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SnsEnvelope {
    records: Vec<SnsRecord>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SnsRecord {
    sns: SnsMessage,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SnsMessage {
    message: String,
}

impl LifecycleEvent {
    /// Parse a raw JSON payload
    pub fn from_json(payload: &str) -> Result<Self, Error> {
        let value: Value = serde_json::from_str(payload)
            .map_err(|e| Error::malformed(format!("payload is not JSON: {e}")))?;
        Self::from_value(value)
    }

    /// Parse an already-decoded payload
    pub fn from_value(value: Value) -> Result<Self, Error> {
        let Some(object) = value.as_object() else {
            return Err(Error::malformed("payload is not a JSON object"));
        };

        if object.contains_key("Records") {
            let envelope: SnsEnvelope = serde_json::from_value(value)
                .map_err(|e| Error::malformed(format!("invalid SNS envelope: {e}")))?;
            let record = envelope
                .records
                .into_iter()
                .next()
                .ok_or_else(|| Error::malformed("SNS envelope has no records"))?;
            let inner: Value = serde_json::from_str(&record.sns.message)
                .map_err(|e| Error::malformed(format!("SNS message is not JSON: {e}")))?;
            return Self::from_value(inner);
        }

        if let Some(detail) = object.get("detail").filter(|d| d.is_object()) {
            return Self::from_hook_notification(detail.clone());
        }

        if object.contains_key("instanceId") || object.contains_key("lifecycleTransition") {
            let record: DirectRecord = serde_json::from_value(value)
                .map_err(|e| Error::malformed(format!("invalid lifecycle record: {e}")))?;
            let raw_transition = record.lifecycle_transition.unwrap_or_default();
            return Self::build(record.instance_id, raw_transition, None);
        }

        if ["EC2InstanceId", "LifecycleTransition", "LifecycleHookName", "Event"]
            .iter()
            .any(|k| object.contains_key(*k))
        {
            return Self::from_hook_notification(value);
        }

        Err(Error::malformed(
            "payload carries no instance id or lifecycle transition",
        ))
    }

    fn from_hook_notification(value: Value) -> Result<Self, Error> {
        let n: HookNotification = serde_json::from_value(value)
            .map_err(|e| Error::malformed(format!("invalid lifecycle notification: {e}")))?;

        // The hook name is the fallback label for notifications that omit the
        // transition, matching how hooks are conventionally named.
        let raw_transition = n
            .lifecycle_transition
            .clone()
            .or_else(|| n.lifecycle_hook_name.clone())
            .or(n.event)
            .unwrap_or_default();

        let hook = match (n.auto_scaling_group_name, n.lifecycle_hook_name) {
            (Some(group), Some(hook_name)) => Some(LifecycleHookRef {
                auto_scaling_group: group,
                hook_name,
                action_token: n.lifecycle_action_token,
            }),
            _ => None,
        };

        Self::build(n.ec2_instance_id, raw_transition, hook)
    }

    fn build(
        instance_id: Option<String>,
        raw_transition: String,
        hook: Option<LifecycleHookRef>,
    ) -> Result<Self, Error> {
        let transition = Transition::classify(&raw_transition);
        let instance_id = instance_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty());

        let instance_id = match (transition, instance_id) {
            (_, Some(id)) if id.chars().any(char::is_whitespace) => {
                return Err(Error::malformed(format!("invalid instance id '{id}'")));
            }
            (_, Some(id)) => id,
            (Transition::Unknown, None) => UNKNOWN_INSTANCE_ID.to_string(),
            (t, None) => {
                return Err(Error::malformed(format!(
                    "{t} notification carries no instance id"
                )));
            }
        };

        Ok(Self {
            instance_id,
            transition,
            raw_transition,
            hook,
        })
    }
}
