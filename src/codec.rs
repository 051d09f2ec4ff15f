//! Wire codec for cross-process messages.
//!
//! Everything that crosses the broker boundary is one of the [`Message`]
//! variants, wrapped in a versioned envelope. Both ends must agree on the
//! DTO shapes for a given [`WIRE_VERSION`]; a mismatched or malformed
//! payload decodes to [`CodecError`], never to a partially-populated value.
//!
//! Worker-side failures travel as an explicit [`ErrorReport`] DTO (code +
//! message + optional structured context); there is deliberately no way to
//! ship language-native exception state across the wire.
//!
//! Durable delivery is not a payload concern: the broker layer marks every
//! published message persistent (see [`crate::broker`]).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::environment::Environment;
use crate::monitor::MonitorEvent;
use crate::task::{Task, TaskCondition};

/// Version both ends of the wire must agree on.
pub const WIRE_VERSION: u32 = 1;

/// Errors raised while decoding a wire payload.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The payload was not a well-formed envelope (truncated, not JSON,
    /// unknown message kind, missing fields).
    #[error("malformed wire payload: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The envelope was well-formed but produced by an incompatible peer.
    #[error("wire version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Version this process speaks.
        expected: u32,
        /// Version found in the envelope.
        found: u32,
    },
}

/// A task dispatch, published by the distributor to a worker queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchMessage {
    /// The testrun the task belongs to.
    pub testrun_id: String,
    /// The task itself, including its package list and priority.
    pub task: Task,
    /// Queue the worker must publish state changes and results to.
    pub response_queue: String,
}

/// A task lifecycle transition, published by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChangeMessage {
    /// The task the transition applies to.
    pub task_id: String,
    /// The transition condition.
    pub condition: TaskCondition,
}

/// A raw results document for one (package, environment) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultsMessage {
    /// Test package the document covers.
    pub package: String,
    /// Environment the package ran in.
    pub environment: Environment,
    /// The XML document body.
    pub document: String,
}

/// A worker-side failure, shipped as data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    /// Numeric error code, stable across versions.
    pub code: u32,
    /// Human-readable message.
    pub message: String,
    /// Optional structured context (free-form JSON).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

/// Every message kind that crosses the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    /// Distributor → worker: execute a task.
    Dispatch(DispatchMessage),
    /// Worker → distributor: a task changed state.
    StateChange(StateChangeMessage),
    /// Worker → distributor: a results document.
    Results(ResultsMessage),
    /// Any component → distributor: telemetry.
    Monitor(MonitorEvent),
    /// Worker → distributor: a failure report.
    Error(ErrorReport),
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    version: u32,
    message: Value,
}

/// Encodes a message for transmission.
pub fn encode(message: &Message) -> Result<Vec<u8>, CodecError> {
    let envelope = Envelope {
        version: WIRE_VERSION,
        message: serde_json::to_value(message)?,
    };
    Ok(serde_json::to_vec(&envelope)?)
}

/// Decodes a wire payload back into a [`Message`].
///
/// The envelope version is checked before the body is interpreted, so a
/// version-mismatched payload fails without ever constructing a DTO.
///
/// # Errors
///
/// [`CodecError`] on truncated or malformed payloads and on version
/// mismatches.
pub fn decode(payload: &[u8]) -> Result<Message, CodecError> {
    let envelope: Envelope = serde_json::from_slice(payload)?;
    if envelope.version != WIRE_VERSION {
        return Err(CodecError::VersionMismatch {
            expected: WIRE_VERSION,
            found: envelope.version,
        });
    }
    Ok(serde_json::from_value(envelope.message)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::MonitorKind;

    #[test]
    fn test_task_round_trip() {
        let message = Message::Dispatch(DispatchMessage {
            testrun_id: "42".into(),
            task: Task::new("t1", vec!["sanity-tests".into()], "hardware".into(), 3),
            response_queue: "r42".into(),
        });

        let decoded = decode(&encode(&message).unwrap()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_monitor_round_trip() {
        let message = Message::Monitor(MonitorEvent::new(
            MonitorKind::TaskStarted,
            "worker-1",
            "claimed t1",
        ));

        let decoded = decode(&encode(&message).unwrap()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_error_report_round_trip() {
        let message = Message::Error(ErrorReport {
            code: 6002,
            message: "flashing failed".into(),
            context: Some(serde_json::json!({"image": "rootfs.bin"})),
        });

        let decoded = decode(&encode(&message).unwrap()).unwrap();
        match &decoded {
            Message::Error(report) => {
                assert_eq!(report.code, 6002);
                assert_eq!(report.message, "flashing failed");
            }
            other => panic!("unexpected message: {other:?}"),
        }
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let payload = encode(&Message::StateChange(StateChangeMessage {
            task_id: "t1".into(),
            condition: TaskCondition::Start,
        }))
        .unwrap();

        let truncated = &payload[..payload.len() / 2];
        assert!(matches!(decode(truncated), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let payload = serde_json::to_vec(&serde_json::json!({
            "version": WIRE_VERSION + 1,
            "message": {"kind": "state_change", "task_id": "t1", "condition": "start"},
        }))
        .unwrap();

        match decode(&payload) {
            Err(CodecError::VersionMismatch { expected, found }) => {
                assert_eq!(expected, WIRE_VERSION);
                assert_eq!(found, WIRE_VERSION + 1);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let payload = serde_json::to_vec(&serde_json::json!({
            "version": WIRE_VERSION,
            "message": {"kind": "teleport", "task_id": "t1"},
        }))
        .unwrap();

        assert!(matches!(decode(&payload), Err(CodecError::Malformed(_))));
    }
}
