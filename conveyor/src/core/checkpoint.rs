//! Checkpoint payloads recorded per completed stage.

use crate::errors::ConveyorError;
use crate::utils::Timestamp;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// The durably recorded output of a completed pipeline stage.
///
/// A checkpoint is a tagged, opaque payload: the engine never inspects it,
/// but each stage executor can declare its own strongly typed success
/// payload and decode it back with [`CheckpointValue::decode`]. Once a
/// checkpoint is written the stage is never re-executed for that job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointValue {
    /// The stage that produced this payload.
    pub stage: String,

    /// The opaque structured success payload.
    pub payload: serde_json::Value,

    /// When the checkpoint was recorded (UTC).
    pub recorded_at: Timestamp,
}

impl CheckpointValue {
    /// Creates a checkpoint for a stage from its raw payload.
    #[must_use]
    pub fn new(stage: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            stage: stage.into(),
            payload,
            recorded_at: Utc::now(),
        }
    }

    /// Creates a checkpoint from any serializable success payload.
    pub fn encode<T: Serialize>(stage: impl Into<String>, payload: &T) -> Result<Self, ConveyorError> {
        Ok(Self::new(stage, serde_json::to_value(payload)?))
    }

    /// Decodes the payload into the stage's typed output.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ConveyorError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}
