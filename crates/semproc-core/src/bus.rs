//! Dispatch engine and the public `Bus` handle.
//!
//! ```text
//! publish(membrane, payload)
//!     │
//!     ├─► echo into Logger          (unless already there / exception payload)
//!     ├─► stateless receptors       (fresh instance per call, disposed after)
//!     ├─► stateful receptors        (gated by qualifiers)
//!     ├─► nested payloads           (same membrane, recursively)
//!     └─► permeation                (neighbour membranes, never back to the caller)
//! ```
//!
//! Calls run inline on the publishing thread (`publish_sync`, or any entry
//! point while single-threaded) or on the worker pool. Every call is guarded:
//! an error or panic is reported as an [`ExceptionMessage`] published
//! synchronously into the Logger membrane and never reaches the publisher.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::config::BusConfig;
use crate::error::BusError;
use crate::events::ExceptionMessage;
use crate::logger::ExceptionTracer;
use crate::membrane::{Membrane, MembraneRegistry};
use crate::pool::{ProcessCall, Target, WorkerPool};
use crate::qualifier::QualifierRegistry;
use crate::receptor::{Receptor, ReceptorId, ReceptorRegistry};
use crate::semantic::{Message, SemanticType};
use crate::types::{MembraneId, ProcState, TypeKey};

/// How the calls of one publish are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Queue on the pool, do not wait.
    FireAndForget,
    /// Run inline on the publishing thread.
    Inline,
    /// Queue on the pool and report completion to the publisher.
    Tracked,
}

/// Accumulated result of one publish.
struct Outcome {
    state: ProcState,
    tracked: usize,
    done_tx: std_mpsc::Sender<ProcState>,
    done_rx: std_mpsc::Receiver<ProcState>,
}

impl Outcome {
    fn new() -> Self {
        let (done_tx, done_rx) = std_mpsc::channel();
        Self {
            state: ProcState::NOT_PROCESSED,
            tracked: 0,
            done_tx,
            done_rx,
        }
    }

    /// Waits for tracked calls until `deadline`; unfinished calls add `TIMEOUT`.
    fn wait(mut self, deadline: Instant) -> ProcState {
        drop(self.done_tx);
        let mut finished = 0;
        while finished < self.tracked {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.done_rx.recv_timeout(remaining) {
                Ok(state) => {
                    self.state |= state;
                    finished += 1;
                }
                Err(std_mpsc::RecvTimeoutError::Timeout) => {
                    self.state |= ProcState::TIMEOUT;
                    break;
                }
                Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
        self.state
    }
}

struct BusInner {
    config: BusConfig,
    membranes: MembraneRegistry,
    receptors: ReceptorRegistry,
    qualifiers: QualifierRegistry,
    pool: WorkerPool,
    single_threaded: AtomicBool,
}

/// Handle to the semantic processor. Cheap to clone; every clone talks to the
/// same registries and worker pool. Workers shut down when the last handle
/// (including the ones held by queued calls) is dropped.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    pub fn new(config: BusConfig) -> Result<Self, BusError> {
        config.validate()?;
        let pool = WorkerPool::new(config.worker_count, &config.thread_name)?;
        let bus = Self {
            inner: Arc::new(BusInner {
                single_threaded: AtomicBool::new(config.single_threaded),
                membranes: MembraneRegistry::new(),
                receptors: ReceptorRegistry::new(),
                qualifiers: QualifierRegistry::new(),
                pool,
                config,
            }),
        };

        if bus.inner.config.trace_exceptions {
            bus.register_receptor_instance(&MembraneId::LOGGER, Arc::new(ExceptionTracer))?;
        }
        debug!(
            workers = bus.inner.pool.size(),
            single_threaded = bus.is_single_threaded(),
            "bus started"
        );
        Ok(bus)
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    // ── Membranes ──

    /// Returns the membrane, creating it on first reference.
    pub fn register_membrane(&self, membrane: &MembraneId) -> Arc<Membrane> {
        self.inner.membranes.get_or_create(membrane)
    }

    pub fn membrane(&self, membrane: &MembraneId) -> Option<Arc<Membrane>> {
        self.inner.membranes.get(membrane)
    }

    pub fn membranes(&self) -> Vec<MembraneId> {
        self.inner.membranes.ids()
    }

    pub fn add_child_membrane(&self, outer: &MembraneId, inner: &MembraneId) {
        self.inner.membranes.add_child(outer, inner);
    }

    /// Payloads viewable as `T` published in `membrane` may leave it.
    pub fn set_outbound_permeable<T: ?Sized + 'static>(&self, membrane: &MembraneId) {
        self.inner
            .membranes
            .mark_outbound_permeable(membrane, TypeKey::of::<T>());
    }

    /// Payloads viewable as `T` may enter `membrane` from a neighbour.
    pub fn set_inbound_permeable<T: ?Sized + 'static>(&self, membrane: &MembraneId) {
        self.inner
            .membranes
            .mark_inbound_permeable(membrane, TypeKey::of::<T>());
    }

    // ── Receptors ──

    /// Registers a stateless receptor type built with `Default` for every message.
    pub fn register_receptor_type<R: Receptor + Default>(
        &self,
        membrane: &MembraneId,
    ) -> Result<(), BusError> {
        self.register_receptor_factory(membrane, R::default)
    }

    /// Registers a stateless receptor type; `init` runs on each fresh instance.
    pub fn register_receptor_type_with<R, F>(
        &self,
        membrane: &MembraneId,
        init: F,
    ) -> Result<(), BusError>
    where
        R: Receptor + Default,
        F: Fn(&mut R) + Send + Sync + 'static,
    {
        self.register_receptor_factory(membrane, move || {
            let mut receptor = R::default();
            init(&mut receptor);
            receptor
        })
    }

    /// Registers a stateless receptor built by `factory` for every message.
    pub fn register_receptor_factory<R, F>(
        &self,
        membrane: &MembraneId,
        factory: F,
    ) -> Result<(), BusError>
    where
        R: Receptor,
        F: Fn() -> R + Send + Sync + 'static,
    {
        self.inner.membranes.get_or_create(membrane);
        self.inner.receptors.register_type(membrane, factory)
    }

    /// Registers a stateful receptor; it stays until unregistered.
    pub fn register_receptor_instance<R: Receptor>(
        &self,
        membrane: &MembraneId,
        receptor: Arc<R>,
    ) -> Result<ReceptorId, BusError> {
        self.inner.membranes.get_or_create(membrane);
        self.inner.receptors.register_instance(membrane, receptor)
    }

    /// Returns false if the instance was not registered in `membrane`.
    pub fn unregister_receptor_instance<R: Receptor>(
        &self,
        membrane: &MembraneId,
        receptor: &Arc<R>,
    ) -> bool {
        self.inner
            .receptors
            .unregister_instance(membrane, ReceptorId::of(receptor))
    }

    /// Number of receptor registrations in a membrane.
    pub fn receptor_count(&self, membrane: &MembraneId) -> usize {
        self.inner.receptors.count(membrane)
    }

    // ── Qualifiers ──

    /// Gates `receptor` for payloads of exact type `T`: with one or more
    /// qualifiers it is dispatched only when at least one returns true.
    pub fn register_qualifier<T, R, F>(&self, receptor: &Arc<R>, predicate: F)
    where
        T: SemanticType,
        R: Receptor,
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.inner.qualifiers.register::<T, R, F>(receptor, predicate);
    }

    pub fn unregister_qualifiers<R: Receptor>(&self, receptor: &Arc<R>) -> usize {
        self.inner.qualifiers.unregister(ReceptorId::of(receptor))
    }

    // ── Publishing ──

    /// Fire-and-forget publish.
    pub fn publish<T: SemanticType>(&self, membrane: &MembraneId, payload: T) {
        self.publish_message(membrane, Message::new(payload));
    }

    pub fn publish_message(&self, membrane: &MembraneId, message: Message) {
        let mut outcome = Outcome::new();
        self.dispatch(membrane, &message, None, Mode::FireAndForget, &mut outcome);
    }

    /// Runs every matching receptor on this thread before returning.
    pub fn publish_sync<T: SemanticType>(&self, membrane: &MembraneId, payload: T) -> ProcState {
        self.publish_message_sync(membrane, Message::new(payload))
    }

    pub fn publish_message_sync(&self, membrane: &MembraneId, message: Message) -> ProcState {
        let mut outcome = Outcome::new();
        self.dispatch(membrane, &message, None, Mode::Inline, &mut outcome);
        outcome.state
    }

    /// Runs every matching receptor on the pool and blocks up to `timeout`.
    /// Calls still queued or running at the deadline add `TIMEOUT`; they are
    /// not cancelled.
    pub fn publish_timeout<T: SemanticType>(
        &self,
        membrane: &MembraneId,
        payload: T,
        timeout: Duration,
    ) -> ProcState {
        self.publish_message_timeout(membrane, Message::new(payload), timeout)
    }

    pub fn publish_message_timeout(
        &self,
        membrane: &MembraneId,
        message: Message,
        timeout: Duration,
    ) -> ProcState {
        let deadline = Instant::now() + timeout;
        let mut outcome = Outcome::new();
        self.dispatch(membrane, &message, None, Mode::Tracked, &mut outcome);
        outcome.wait(deadline)
    }

    /// [`Bus::publish_timeout`] for async callers.
    pub async fn publish_timeout_async<T: SemanticType>(
        &self,
        membrane: &MembraneId,
        payload: T,
        timeout: Duration,
    ) -> ProcState {
        let bus = self.clone();
        let membrane = membrane.clone();
        let message = Message::new(payload);
        tokio::task::spawn_blocking(move || {
            bus.publish_message_timeout(&membrane, message, timeout)
        })
        .await
        .unwrap_or_else(|e| {
            warn!("timeout publish task failed: {}", e);
            ProcState::EXCEPTION
        })
    }

    /// Forces every dispatch inline, regardless of entry point.
    pub fn set_single_threaded(&self, enabled: bool) {
        self.inner.single_threaded.store(enabled, Ordering::SeqCst);
    }

    pub fn is_single_threaded(&self) -> bool {
        self.inner.single_threaded.load(Ordering::SeqCst)
    }

    /// Blocks until every queued call (and the work it queued) has finished.
    /// Returns false on timeout. Must not be called from a receptor.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.inner.pool.wait_idle(timeout)
    }

    pub fn worker_depths(&self) -> Vec<usize> {
        self.inner.pool.depths()
    }

    pub fn pending_calls(&self) -> usize {
        self.inner.pool.pending()
    }

    // ── Dispatch engine ──

    fn dispatch(
        &self,
        membrane: &MembraneId,
        message: &Message,
        caller: Option<&MembraneId>,
        mode: Mode,
        outcome: &mut Outcome,
    ) {
        let resolved = self.inner.receptors.resolve(membrane, message);
        trace!(
            membrane = %membrane,
            payload = %message.payload_type(),
            message_id = %message.id(),
            stateless = resolved.types.len(),
            stateful = resolved.instances.len(),
            "dispatch"
        );

        if self.inner.config.echo_to_logger
            && *membrane != MembraneId::LOGGER
            && !message.is::<ExceptionMessage>()
        {
            self.dispatch(&MembraneId::LOGGER, message, Some(membrane), mode, outcome);
        }

        for (registration, key) in resolved.types {
            self.invoke(Target::Fresh(registration), membrane, key, message, mode, outcome);
        }

        for (registration, key) in resolved.instances {
            if !self.inner.qualifiers.is_qualified(registration.id(), message) {
                trace!(receptor = registration.name(), message_id = %message.id(), "not qualified");
                continue;
            }
            self.invoke(Target::Shared(registration), membrane, key, message, mode, outcome);
        }

        for nested in message.nested() {
            self.dispatch(membrane, &nested, caller, mode, outcome);
        }

        self.permeate(membrane, message, caller, mode, outcome);
    }

    fn permeate(
        &self,
        membrane: &MembraneId,
        message: &Message,
        caller: Option<&MembraneId>,
        mode: Mode,
        outcome: &mut Outcome,
    ) {
        let Some(source) = self.inner.membranes.get(membrane) else {
            return;
        };
        let outbound: Vec<TypeKey> = message
            .type_keys()
            .filter(|key| source.is_outbound_permeable(key))
            .collect();
        if outbound.is_empty() {
            return;
        }

        for neighbour in source.neighbours() {
            if Some(&neighbour) == caller {
                continue;
            }
            let Some(target) = self.inner.membranes.get(&neighbour) else {
                continue;
            };
            // Both sides must admit the same type key.
            if outbound.iter().any(|key| target.is_inbound_permeable(key)) {
                trace!(from = %membrane, to = %neighbour, message_id = %message.id(), "permeate");
                self.dispatch(&neighbour, message, Some(membrane), mode, outcome);
            }
        }
    }

    fn invoke(
        &self,
        target: Target,
        membrane: &MembraneId,
        key: TypeKey,
        message: &Message,
        mode: Mode,
        outcome: &mut Outcome,
    ) {
        let mut call = ProcessCall {
            bus: self.clone(),
            target,
            membrane: membrane.clone(),
            key,
            message: message.clone(),
            done: None,
        };

        if mode == Mode::Inline || self.is_single_threaded() {
            outcome.state |= call.run();
            return;
        }

        if mode == Mode::Tracked {
            call.done = Some(outcome.done_tx.clone());
            outcome.tracked += 1;
        }
        if let Err(call) = self.inner.pool.enqueue(call) {
            warn!(receptor = call.target.name(), "worker pool unavailable, running inline");
            outcome.state |= call.run();
            if mode == Mode::Tracked {
                outcome.tracked -= 1;
            }
        }
    }

    /// Guarded execution of one call.
    pub(crate) fn execute(
        &self,
        target: &Target,
        membrane: &MembraneId,
        key: TypeKey,
        message: &Message,
    ) -> ProcState {
        let result = panic::catch_unwind(AssertUnwindSafe(|| match target {
            Target::Fresh(registration) => {
                let receptor = registration.build();
                let _dispose = DisposeOnDrop(receptor.as_ref());
                receptor.call(self, membrane, key, message)
            }
            Target::Shared(registration) => {
                registration.binding().call(self, membrane, key, message)
            }
        }));

        let error = match result {
            Ok(Ok(())) => return ProcState::OK,
            Ok(Err(e)) => format!("{:#}", e),
            Err(panic) => panic_message(panic.as_ref()),
        };
        self.report_exception(target.name(), membrane, message, error);
        ProcState::EXCEPTION
    }

    fn report_exception(
        &self,
        receptor: &str,
        membrane: &MembraneId,
        message: &Message,
        error: String,
    ) {
        warn!(
            receptor,
            membrane = %membrane,
            payload = %message.payload_type(),
            message_id = %message.id(),
            "receptor failed: {}",
            error
        );
        if message.is::<ExceptionMessage>() {
            return;
        }

        let exception = Message::new(ExceptionMessage::new(
            receptor,
            membrane,
            message.payload_type().name(),
            message.id(),
            error,
        ));
        let logged = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut outcome = Outcome::new();
            self.dispatch(
                &MembraneId::LOGGER,
                &exception,
                Some(membrane),
                Mode::Inline,
                &mut outcome,
            );
        }));
        if logged.is_err() {
            debug!(message_id = %message.id(), "exception logging failed");
        }
    }
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("workers", &self.inner.pool.size())
            .field("single_threaded", &self.is_single_threaded())
            .field("membranes", &self.inner.membranes.len())
            .finish()
    }
}

struct DisposeOnDrop<'a>(&'a dyn crate::receptor::Invoke);

impl Drop for DisposeOnDrop<'_> {
    fn drop(&mut self) {
        self.0.dispose();
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panic: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panic: {}", s)
    } else {
        "panic: <non-string payload>".to_string()
    }
}
