//! Built-in Logger membrane receptor.

use tracing::error;

use crate::bus::Bus;
use crate::events::ExceptionMessage;
use crate::receptor::{Handlers, Process, Receptor};
use crate::types::MembraneId;

/// Forwards every [`ExceptionMessage`] reaching the Logger membrane to
/// `tracing` at error level. Registered by [`Bus::new`] unless
/// `trace_exceptions` is off.
pub struct ExceptionTracer;

impl Process<ExceptionMessage> for ExceptionTracer {
    fn process(
        &self,
        _bus: &Bus,
        _membrane: &MembraneId,
        exception: &ExceptionMessage,
    ) -> anyhow::Result<()> {
        error!(
            receptor = %exception.receptor,
            membrane = %exception.membrane,
            payload = %exception.payload_type,
            message_id = %exception.message_id,
            at = %exception.timestamp,
            "receptor exception: {}",
            exception.error
        );
        Ok(())
    }
}

impl Receptor for ExceptionTracer {
    fn subscribe(handlers: &mut Handlers<Self>) {
        handlers.on::<ExceptionMessage>();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BusConfig;
    use crate::types::ProcState;
    use uuid::Uuid;

    #[test]
    fn test_tracer_accepts_exceptions() {
        let bus = Bus::new(BusConfig {
            worker_count: 1,
            ..BusConfig::default()
        })
        .unwrap();
        let exception = ExceptionMessage::new(
            "tests::Faulty",
            &MembraneId::SURFACE,
            "tests::Ping",
            Uuid::new_v4(),
            "boom".into(),
        );
        assert_eq!(bus.publish_sync(&MembraneId::LOGGER, exception), ProcState::OK);
    }
}
