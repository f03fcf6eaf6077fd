//! semproc-demo — walks a small membrane tree through the bus.
//!
//! Reads `config.yaml` from the working directory when present. Set
//! `RUST_LOG=semproc_core=trace` to watch dispatch decisions.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use serde::Serialize;
use tracing::info;

use semproc_core::{
    Bus, BusConfig, ExceptionMessage, Facets, Handlers, MembraneId, Message, Process, Receptor,
    SemanticType,
};

/// Anything that can be rendered as one line of text.
trait Describe: Send + Sync {
    fn describe(&self) -> String;
}

#[derive(Debug, Clone, Serialize)]
struct Greeting {
    from: String,
    text: String,
}

impl Describe for Greeting {
    fn describe(&self) -> String {
        format!("{} says {:?}", self.from, self.text)
    }
}

impl SemanticType for Greeting {
    fn facets(self: Arc<Self>, facets: &mut Facets) {
        facets.add::<dyn Describe>(self);
    }
}

/// Several greetings published as one payload.
struct Mailbag(Vec<Greeting>);

impl SemanticType for Mailbag {
    fn nested(&self) -> Vec<Message> {
        self.0.iter().cloned().map(Message::new).collect()
    }
}

/// Stateless: prints anything describable.
#[derive(Default)]
struct Printer;

impl Process<dyn Describe> for Printer {
    fn process(&self, _bus: &Bus, membrane: &MembraneId, payload: &dyn Describe) -> Result<()> {
        println!("[{membrane}] {}", payload.describe());
        Ok(())
    }
}

impl Receptor for Printer {
    fn subscribe(handlers: &mut Handlers<Self>) {
        handlers.on::<dyn Describe>();
    }
}

/// Stateful: counts the greetings it is qualified for.
#[derive(Default)]
struct Tally {
    seen: AtomicUsize,
}

impl Process<Greeting> for Tally {
    fn process(&self, _bus: &Bus, _membrane: &MembraneId, _greeting: &Greeting) -> Result<()> {
        self.seen.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Receptor for Tally {
    fn subscribe(handlers: &mut Handlers<Self>) {
        handlers.on::<Greeting>();
    }
}

/// Stateless: rejects rude greetings.
#[derive(Default)]
struct Moderator;

impl Process<Greeting> for Moderator {
    fn process(&self, _bus: &Bus, _membrane: &MembraneId, greeting: &Greeting) -> Result<()> {
        if greeting.text.contains("rude") {
            bail!("greeting from {} rejected", greeting.from);
        }
        Ok(())
    }
}

impl Receptor for Moderator {
    fn subscribe(handlers: &mut Handlers<Self>) {
        handlers.on::<Greeting>();
    }
}

/// Logger membrane: prints echoed greetings and exceptions as JSON.
struct Console;

impl Process<Greeting> for Console {
    fn process(&self, _bus: &Bus, membrane: &MembraneId, greeting: &Greeting) -> Result<()> {
        println!("[{membrane}] {}", serde_json::to_string(greeting)?);
        Ok(())
    }
}

impl Process<ExceptionMessage> for Console {
    fn process(
        &self,
        _bus: &Bus,
        _membrane: &MembraneId,
        exception: &ExceptionMessage,
    ) -> Result<()> {
        println!("exception: {}", exception.to_json());
        Ok(())
    }
}

impl Receptor for Console {
    fn subscribe(handlers: &mut Handlers<Self>) {
        handlers.on::<Greeting>().on::<ExceptionMessage>();
    }
}

fn greeting(from: &str, text: &str) -> Greeting {
    Greeting {
        from: from.into(),
        text: text.into(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .try_init();

    let project_root = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let config = BusConfig::load_from_dir(&project_root).unwrap_or_default();
    let bus = Bus::new(config)?;

    let session = MembraneId::new("session");
    bus.add_child_membrane(&MembraneId::SURFACE, &session);
    bus.set_outbound_permeable::<Greeting>(&session);
    bus.set_inbound_permeable::<Greeting>(&MembraneId::SURFACE);

    bus.register_receptor_type::<Printer>(&MembraneId::SURFACE)?;
    bus.register_receptor_type::<Moderator>(&session)?;
    bus.register_receptor_instance(&MembraneId::LOGGER, Arc::new(Console))?;

    let tally = Arc::new(Tally::default());
    bus.register_receptor_instance(&session, Arc::clone(&tally))?;
    bus.register_qualifier::<Greeting, _, _>(&tally, |g| g.from != "anonymous");

    info!(membranes = ?bus.membranes(), "bus ready");

    let state = bus.publish_sync(&session, greeting("ada", "hello from the session"));
    info!(%state, "sync publish");

    bus.publish(&session, greeting("anonymous", "hi"));
    bus.publish(&session, greeting("grace", "something rude"));
    bus.publish(
        &session,
        Mailbag(vec![greeting("alan", "first letter"), greeting("alan", "second letter")]),
    );
    if !bus.wait_idle(Duration::from_secs(5)) {
        bail!("bus did not go idle");
    }
    info!(seen = tally.seen.load(Ordering::SeqCst), "tally after fire-and-forget");

    let state = bus
        .publish_timeout_async(
            &MembraneId::SURFACE,
            greeting("edsger", "timed"),
            Duration::from_secs(1),
        )
        .await;
    info!(%state, "timeout publish");

    Ok(())
}
