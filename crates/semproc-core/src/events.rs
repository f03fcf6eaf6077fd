//! Built-in semantic types emitted by the bus itself.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::semantic::SemanticType;
use crate::types::MembraneId;

/// Published synchronously into [`MembraneId::LOGGER`] whenever a receptor
/// returns an error or panics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExceptionMessage {
    /// Type name of the failing receptor.
    pub receptor: String,
    /// Membrane the failing call was dispatched in.
    pub membrane: MembraneId,
    /// Concrete type of the payload being processed.
    pub payload_type: String,
    /// Id of the published message, for correlation with trace output.
    pub message_id: Uuid,
    /// Rendered error chain or panic message.
    pub error: String,
    pub timestamp: String,
}

impl ExceptionMessage {
    pub fn new(
        receptor: &str,
        membrane: &MembraneId,
        payload_type: &str,
        message_id: Uuid,
        error: String,
    ) -> Self {
        Self {
            receptor: receptor.to_string(),
            membrane: membrane.clone(),
            payload_type: payload_type.to_string(),
            message_id,
            error,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// `{"receptor": ..., "membrane": ..., ...}`
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

impl SemanticType for ExceptionMessage {}
