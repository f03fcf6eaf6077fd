//! Bus errors.
//!
//! Only registration and construction can fail. Dispatch never returns an
//! error: handler failures become [`ProcState::EXCEPTION`](crate::ProcState)
//! plus an [`ExceptionMessage`](crate::events::ExceptionMessage) in the
//! Logger membrane.
//!
//! | Variant | Code |
//! |---------|------|
//! | [`BusError::NoHandlers`] | `BUS_NO_HANDLERS` |
//! | [`BusError::DuplicateHandler`] | `BUS_DUPLICATE_HANDLER` |
//! | [`BusError::AlreadyRegistered`] | `BUS_ALREADY_REGISTERED` |
//! | [`BusError::WorkerSpawn`] | `BUS_WORKER_SPAWN` |
//! | [`BusError::InvalidConfig`] | `BUS_INVALID_CONFIG` |

use thiserror::Error;

use crate::types::MembraneId;

#[derive(Debug, Error)]
pub enum BusError {
    /// The receptor's `subscribe` declared no payload types.
    #[error("receptor {receptor} declares no handlers")]
    NoHandlers { receptor: &'static str },

    /// The same payload type was declared twice, so the handler is ambiguous.
    #[error("receptor {receptor} declares more than one handler for {payload}")]
    DuplicateHandler {
        receptor: &'static str,
        payload: &'static str,
    },

    /// The receptor instance is already registered in the membrane.
    #[error("receptor {receptor} is already registered in membrane {membrane}")]
    AlreadyRegistered {
        receptor: &'static str,
        membrane: MembraneId,
    },

    /// The configuration cannot start a bus.
    #[error("invalid bus config: {0}")]
    InvalidConfig(String),

    /// A worker thread could not be started.
    #[error("failed to spawn worker {index}: {source}")]
    WorkerSpawn {
        index: usize,
        #[source]
        source: std::io::Error,
    },
}

impl BusError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoHandlers { .. } => "BUS_NO_HANDLERS",
            Self::DuplicateHandler { .. } => "BUS_DUPLICATE_HANDLER",
            Self::AlreadyRegistered { .. } => "BUS_ALREADY_REGISTERED",
            Self::WorkerSpawn { .. } => "BUS_WORKER_SPAWN",
            Self::InvalidConfig(_) => "BUS_INVALID_CONFIG",
        }
    }
}
