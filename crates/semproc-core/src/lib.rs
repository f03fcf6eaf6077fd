//! semproc-core — typed in-process semantic processor bus.
//!
//! Publishers put payloads into named membranes; receptors registered in a
//! membrane for a payload's concrete type, or for an interface it exposes,
//! process it either inline or on a fixed worker pool. Membranes form a tree
//! through which payloads permeate according to per-type rules. Receptor
//! failures never reach the publisher; they are reported as
//! [`ExceptionMessage`]s in the Logger membrane.

pub mod bus;
pub mod config;
pub mod error;
pub mod events;
pub mod logger;
pub mod membrane;
mod pool;
pub mod qualifier;
pub mod receptor;
pub mod semantic;
pub mod types;

pub use bus::Bus;
pub use config::BusConfig;
pub use error::BusError;
pub use events::ExceptionMessage;
pub use logger::ExceptionTracer;
pub use membrane::Membrane;
pub use receptor::{Handlers, Process, Receptor, ReceptorId};
pub use semantic::{Facets, Message, SemanticType};
pub use types::{MembraneId, ProcState, TypeKey};
