//! Condition machinery: the `Succeeded` / `Notified` state machines that
//! drive a task's lifecycle and the at-most-once callback lease.

use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::TaskStatus;

/// The condition's type. Keyed: a task carries at most one condition per
/// type in `status.conditions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub enum ConditionType {
    /// Primary lifecycle condition.
    Succeeded,
    /// Terminal-callback dispatch lease.
    Notified,
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Succeeded => "Succeeded",
            Self::Notified => "Notified",
        };
        f.write_str(s)
    }
}

impl FromStr for ConditionType {
    type Err = ConditionTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Succeeded" => Ok(Self::Succeeded),
            "Notified" => Ok(Self::Notified),
            other => Err(ConditionTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ConditionType`] string.
#[derive(Debug, Clone)]
pub struct ConditionTypeParseError(pub String);

impl fmt::Display for ConditionTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid condition type: {:?}", self.0)
    }
}

impl std::error::Error for ConditionTypeParseError {}

/// Tri-state condition status, mirroring the Kubernetes condition convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::True => "True",
            Self::False => "False",
            Self::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// The four terminal reasons a task's `Succeeded` condition can carry when
/// its status is `False`. Produced by a single classification function
/// rather than scattered string literals (§9, "Dynamic dispatch → tagged
/// variants").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailedReason {
    Failed,
    TimedOut,
    Oom,
    Cancelled,
}

impl fmt::Display for FailedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Failed => "Failed",
            Self::TimedOut => "TimedOut",
            Self::Oom => "OOM",
            Self::Cancelled => "Cancelled",
        };
        f.write_str(s)
    }
}

/// Reasons for the `Notified` condition forming the at-most-once callback
/// lease (§4.3.3, §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifiedReason {
    CallbackPending,
    CallbackSent,
    CallbackFailed,
}

impl fmt::Display for NotifiedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::CallbackPending => "CallbackPending",
            Self::CallbackSent => "CallbackSent",
            Self::CallbackFailed => "CallbackFailed",
        };
        f.write_str(s)
    }
}

/// A single condition entry in `status.conditions`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: ConditionType,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    pub last_transition_time: Time,
    pub observed_generation: i64,
}

impl TaskStatus {
    /// `SetCondition`: keyed by `type_`. A second call with the same type
    /// mutates in place; `last_transition_time` only advances when `status`
    /// actually changes.
    pub fn set_condition(
        &mut self,
        type_: ConditionType,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
        observed_generation: i64,
    ) {
        let reason = reason.into();
        let message = message.into();

        if let Some(existing) = self.conditions.iter_mut().find(|c| c.type_ == type_) {
            if existing.status != status {
                existing.last_transition_time = Time(Utc::now());
            }
            existing.status = status;
            existing.reason = reason;
            existing.message = message;
            existing.observed_generation = observed_generation;
            return;
        }

        self.conditions.push(Condition {
            type_,
            status,
            reason,
            message,
            last_transition_time: Time(Utc::now()),
            observed_generation,
        });
    }

    /// `FindCondition`.
    pub fn find_condition(&self, type_: ConditionType) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// `IsTerminal(task)` ≡ `Succeeded` exists and its status ≠ `Unknown`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.find_condition(ConditionType::Succeeded),
            Some(c) if c.status != ConditionStatus::Unknown
        )
    }

    /// `status.phase` as surfaced to API clients: the `Succeeded` reason,
    /// or `"Pending"` if no condition has been set yet.
    pub fn phase(&self) -> &str {
        self.find_condition(ConditionType::Succeeded)
            .map(|c| c.reason.as_str())
            .unwrap_or("Pending")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn condition_type_roundtrip() {
        for v in [ConditionType::Succeeded, ConditionType::Notified] {
            let s = v.to_string();
            let parsed: ConditionType = s.parse().expect("should parse");
            assert_eq!(v, parsed);
        }
    }

    #[test]
    fn condition_type_invalid() {
        assert!("Bogus".parse::<ConditionType>().is_err());
    }

    #[test]
    fn fresh_status_is_not_terminal() {
        let status = TaskStatus::default();
        assert!(!status.is_terminal());
        assert_eq!(status.phase(), "Pending");
    }

    #[test]
    fn unknown_succeeded_is_not_terminal() {
        let mut status = TaskStatus::default();
        status.set_condition(
            ConditionType::Succeeded,
            ConditionStatus::Unknown,
            "Pending",
            "waiting for workload to start",
            1,
        );
        assert!(!status.is_terminal());
        assert_eq!(status.phase(), "Pending");
    }

    #[test]
    fn true_succeeded_is_terminal() {
        let mut status = TaskStatus::default();
        status.set_condition(
            ConditionType::Succeeded,
            ConditionStatus::True,
            "Succeeded",
            "workload completed",
            2,
        );
        assert!(status.is_terminal());
        assert_eq!(status.phase(), "Succeeded");
    }

    #[test]
    fn false_succeeded_with_failed_reason_is_terminal() {
        let mut status = TaskStatus::default();
        status.set_condition(
            ConditionType::Succeeded,
            ConditionStatus::False,
            FailedReason::TimedOut.to_string(),
            "Job exceeded timeout",
            3,
        );
        assert!(status.is_terminal());
        assert_eq!(status.phase(), "TimedOut");
    }

    #[test]
    fn second_set_condition_mutates_in_place() {
        let mut status = TaskStatus::default();
        status.set_condition(
            ConditionType::Succeeded,
            ConditionStatus::Unknown,
            "Pending",
            "waiting",
            1,
        );
        let first_time = status.conditions[0].last_transition_time.clone();

        status.set_condition(
            ConditionType::Succeeded,
            ConditionStatus::Unknown,
            "Running",
            "workload created",
            1,
        );
        assert_eq!(status.conditions.len(), 1);
        assert_eq!(status.conditions[0].reason, "Running");
        // Status didn't change (still Unknown) so the transition time is untouched.
        assert_eq!(status.conditions[0].last_transition_time, first_time);
    }

    #[test]
    fn status_change_advances_transition_time() {
        let mut status = TaskStatus::default();
        status.set_condition(
            ConditionType::Succeeded,
            ConditionStatus::Unknown,
            "Running",
            "workload created",
            1,
        );
        status.set_condition(
            ConditionType::Succeeded,
            ConditionStatus::True,
            "Succeeded",
            "done",
            1,
        );
        assert_eq!(status.conditions.len(), 1);
        assert_eq!(status.conditions[0].status, ConditionStatus::True);
    }

    #[test]
    fn notified_reasons_display() {
        assert_eq!(NotifiedReason::CallbackPending.to_string(), "CallbackPending");
        assert_eq!(NotifiedReason::CallbackSent.to_string(), "CallbackSent");
        assert_eq!(NotifiedReason::CallbackFailed.to_string(), "CallbackFailed");
    }
}
