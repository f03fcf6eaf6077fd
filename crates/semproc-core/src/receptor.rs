//! Receptors and the receptor registry.
//!
//! A receptor declares the payload types it handles once, in
//! [`Receptor::subscribe`], and implements [`Process<T>`] for each of them:
//!
//! ```
//! use semproc_core::{Bus, Handlers, MembraneId, Process, Receptor, SemanticType};
//!
//! struct Greeting {
//!     text: String,
//! }
//!
//! impl SemanticType for Greeting {}
//!
//! #[derive(Default)]
//! struct Echo;
//!
//! impl Process<Greeting> for Echo {
//!     fn process(
//!         &self,
//!         _bus: &Bus,
//!         _membrane: &MembraneId,
//!         greeting: &Greeting,
//!     ) -> anyhow::Result<()> {
//!         println!("{}", greeting.text);
//!         Ok(())
//!     }
//! }
//!
//! impl Receptor for Echo {
//!     fn subscribe(handlers: &mut Handlers<Self>) {
//!         handlers.on::<Greeting>();
//!     }
//! }
//! ```
//!
//! Two lifecycles exist:
//!
//! - **Stateless** (type registration): a fresh receptor is built for every
//!   dispatched message and disposed afterwards.
//! - **Stateful** (instance registration): one living `Arc<R>` owned by the
//!   registrant, shared by every dispatch until it is unregistered. It must
//!   guard its own state; calls may arrive concurrently from several workers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::bus::Bus;
use crate::error::BusError;
use crate::semantic::Message;
use crate::types::{MembraneId, TypeKey};

/// Handler for payloads viewed as `T` (a concrete type or a `dyn Trait`).
pub trait Process<T: ?Sized>: Send + Sync {
    fn process(&self, bus: &Bus, membrane: &MembraneId, payload: &T) -> anyhow::Result<()>;
}

pub trait Receptor: Send + Sync + Sized + 'static {
    /// Declares every payload type this receptor handles.
    fn subscribe(handlers: &mut Handlers<Self>);

    /// Called after each call on a freshly built stateless receptor.
    /// Never called for registered instances.
    fn dispose(&self) {}
}

type HandlerFn<R> = fn(&R, &Bus, &MembraneId, &Message) -> anyhow::Result<()>;
type HandlerTable<R> = Arc<[(TypeKey, HandlerFn<R>)]>;

/// Collects the handlers a receptor declares in [`Receptor::subscribe`].
pub struct Handlers<R> {
    entries: Vec<(TypeKey, HandlerFn<R>)>,
    duplicate: Option<TypeKey>,
}

impl<R: Receptor> Handlers<R> {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            duplicate: None,
        }
    }

    /// Subscribes the receptor to payloads viewable as `T`.
    pub fn on<T>(&mut self) -> &mut Self
    where
        T: ?Sized + Send + Sync + 'static,
        R: Process<T>,
    {
        let key = TypeKey::of::<T>();
        if self.entries.iter().any(|(existing, _)| *existing == key) {
            self.duplicate.get_or_insert(key);
        } else {
            let handler: HandlerFn<R> = invoke::<R, T>;
            self.entries.push((key, handler));
        }
        self
    }

    /// Builds the handler table once, failing fast on ambiguous declarations.
    fn collect() -> Result<HandlerTable<R>, BusError> {
        let mut handlers = Self::new();
        R::subscribe(&mut handlers);

        let receptor = std::any::type_name::<R>();
        if let Some(payload) = handlers.duplicate {
            return Err(BusError::DuplicateHandler {
                receptor,
                payload: payload.name(),
            });
        }
        if handlers.entries.is_empty() {
            return Err(BusError::NoHandlers { receptor });
        }
        Ok(handlers.entries.into())
    }
}

fn invoke<R, T>(
    receptor: &R,
    bus: &Bus,
    membrane: &MembraneId,
    message: &Message,
) -> anyhow::Result<()>
where
    T: ?Sized + Send + Sync + 'static,
    R: Process<T>,
{
    let payload = message.view::<T>().ok_or_else(|| {
        anyhow!(
            "payload {} has no {} view",
            message.payload_type(),
            std::any::type_name::<T>()
        )
    })?;
    receptor.process(bus, membrane, &**payload)
}

// ── Type-erased receptors ──

pub(crate) trait Invoke: Send + Sync {
    fn call(
        &self,
        bus: &Bus,
        membrane: &MembraneId,
        key: TypeKey,
        message: &Message,
    ) -> anyhow::Result<()>;

    fn dispose(&self);
}

struct Binding<R> {
    receptor: Arc<R>,
    table: HandlerTable<R>,
}

impl<R: Receptor> Invoke for Binding<R> {
    fn call(
        &self,
        bus: &Bus,
        membrane: &MembraneId,
        key: TypeKey,
        message: &Message,
    ) -> anyhow::Result<()> {
        let handler = self
            .table
            .iter()
            .find(|(handled, _)| *handled == key)
            .map(|(_, handler)| *handler)
            .ok_or_else(|| anyhow!("{} has no handler for {}", std::any::type_name::<R>(), key))?;
        handler(self.receptor.as_ref(), bus, membrane, message)
    }

    fn dispose(&self) {
        self.receptor.dispose();
    }
}

/// Identity of a registered receptor instance (its `Arc` allocation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReceptorId(usize);

impl ReceptorId {
    pub fn of<R>(receptor: &Arc<R>) -> Self {
        Self(Arc::as_ptr(receptor) as *const () as usize)
    }
}

type Factory = Box<dyn Fn() -> Box<dyn Invoke> + Send + Sync>;

/// A stateless registration: builds a fresh receptor per dispatch.
pub(crate) struct TypeRegistration {
    seq: u64,
    name: &'static str,
    factory: Factory,
}

impl TypeRegistration {
    pub(crate) fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn build(&self) -> Box<dyn Invoke> {
        (self.factory)()
    }
}

/// A stateful registration: one shared receptor.
pub(crate) struct InstanceRegistration {
    seq: u64,
    id: ReceptorId,
    name: &'static str,
    binding: Box<dyn Invoke>,
}

impl InstanceRegistration {
    pub(crate) fn id(&self) -> ReceptorId {
        self.id
    }

    pub(crate) fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn binding(&self) -> &dyn Invoke {
        self.binding.as_ref()
    }
}

/// Receptors matched for one message, each paired with the type key whose
/// handler will run. Registration order within each list.
#[derive(Default)]
pub(crate) struct Resolved {
    pub types: Vec<(Arc<TypeRegistration>, TypeKey)>,
    pub instances: Vec<(Arc<InstanceRegistration>, TypeKey)>,
}

#[cfg(test)]
impl Resolved {
    pub fn is_empty(&self) -> bool {
        self.types.is_empty() && self.instances.is_empty()
    }
}

type Slot = (MembraneId, TypeKey);

/// Maps (membrane, payload type) to stateless receptor types and stateful
/// receptor instances.
pub struct ReceptorRegistry {
    seq: AtomicU64,
    types: DashMap<Slot, Vec<Arc<TypeRegistration>>>,
    instances: DashMap<Slot, Vec<Arc<InstanceRegistration>>>,
    /// Serialises instance registration so the duplicate check and the
    /// inserts act as one step.
    instance_edits: Mutex<()>,
}

impl ReceptorRegistry {
    pub fn new() -> Self {
        Self {
            seq: AtomicU64::new(0),
            types: DashMap::new(),
            instances: DashMap::new(),
            instance_edits: Mutex::new(()),
        }
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers a receptor type; `factory` builds a fresh instance per dispatch.
    pub fn register_type<R, F>(&self, membrane: &MembraneId, factory: F) -> Result<(), BusError>
    where
        R: Receptor,
        F: Fn() -> R + Send + Sync + 'static,
    {
        let table = Handlers::<R>::collect()?;
        let keys: Vec<TypeKey> = table.iter().map(|(key, _)| *key).collect();
        let build_table = Arc::clone(&table);
        let registration = Arc::new(TypeRegistration {
            seq: self.next_seq(),
            name: std::any::type_name::<R>(),
            factory: Box::new(move || {
                Box::new(Binding {
                    receptor: Arc::new(factory()),
                    table: Arc::clone(&build_table),
                }) as Box<dyn Invoke>
            }),
        });

        for key in &keys {
            self.types
                .entry((membrane.clone(), *key))
                .or_default()
                .push(Arc::clone(&registration));
        }
        debug!(
            membrane = %membrane,
            receptor = registration.name,
            handlers = keys.len(),
            "receptor type registered"
        );
        Ok(())
    }

    /// Registers a living receptor instance.
    pub fn register_instance<R: Receptor>(
        &self,
        membrane: &MembraneId,
        receptor: Arc<R>,
    ) -> Result<ReceptorId, BusError> {
        let id = ReceptorId::of(&receptor);
        let name = std::any::type_name::<R>();
        let _edits = self.instance_edits.lock();
        if self.contains_instance(membrane, id) {
            return Err(BusError::AlreadyRegistered {
                receptor: name,
                membrane: membrane.clone(),
            });
        }

        let table = Handlers::<R>::collect()?;
        let keys: Vec<TypeKey> = table.iter().map(|(key, _)| *key).collect();
        let registration = Arc::new(InstanceRegistration {
            seq: self.next_seq(),
            id,
            name,
            binding: Box::new(Binding { receptor, table }),
        });

        for key in &keys {
            self.instances
                .entry((membrane.clone(), *key))
                .or_default()
                .push(Arc::clone(&registration));
        }
        debug!(
            membrane = %membrane,
            receptor = name,
            handlers = keys.len(),
            "receptor instance registered"
        );
        Ok(id)
    }

    /// Removes an instance from one membrane. Returns false if it was not registered there.
    pub fn unregister_instance(&self, membrane: &MembraneId, id: ReceptorId) -> bool {
        let _edits = self.instance_edits.lock();
        let mut removed = false;
        for mut entry in self.instances.iter_mut() {
            if &entry.key().0 != membrane {
                continue;
            }
            let before = entry.value().len();
            entry.value_mut().retain(|registration| registration.id != id);
            removed |= entry.value().len() < before;
        }
        self.instances.retain(|_, registrations| !registrations.is_empty());
        if removed {
            debug!(membrane = %membrane, "receptor instance unregistered");
        }
        removed
    }

    fn contains_instance(&self, membrane: &MembraneId, id: ReceptorId) -> bool {
        self.instances
            .iter()
            .any(|entry| &entry.key().0 == membrane && entry.value().iter().any(|r| r.id == id))
    }

    /// Receptors registered in `membrane` for any of the message's type keys.
    ///
    /// A receptor matched through several keys appears once, paired with the
    /// first key in the message's order (concrete type before facets).
    /// An unknown membrane resolves to nothing.
    pub(crate) fn resolve(&self, membrane: &MembraneId, message: &Message) -> Resolved {
        let mut types: HashMap<u64, (Arc<TypeRegistration>, TypeKey)> = HashMap::new();
        let mut instances: HashMap<u64, (Arc<InstanceRegistration>, TypeKey)> = HashMap::new();

        for key in message.type_keys() {
            let slot = (membrane.clone(), key);
            if let Some(registrations) = self.types.get(&slot) {
                for registration in registrations.iter() {
                    types
                        .entry(registration.seq)
                        .or_insert_with(|| (Arc::clone(registration), key));
                }
            }
            if let Some(registrations) = self.instances.get(&slot) {
                for registration in registrations.iter() {
                    instances
                        .entry(registration.seq)
                        .or_insert_with(|| (Arc::clone(registration), key));
                }
            }
        }

        let mut resolved = Resolved {
            types: types.into_values().collect(),
            instances: instances.into_values().collect(),
        };
        resolved.types.sort_by_key(|(registration, _)| registration.seq);
        resolved.instances.sort_by_key(|(registration, _)| registration.seq);
        resolved
    }

    /// Number of distinct registrations in a membrane.
    pub fn count(&self, membrane: &MembraneId) -> usize {
        let mut seqs: Vec<u64> = self
            .types
            .iter()
            .filter(|entry| &entry.key().0 == membrane)
            .flat_map(|entry| entry.value().iter().map(|r| r.seq).collect::<Vec<_>>())
            .chain(
                self.instances
                    .iter()
                    .filter(|entry| &entry.key().0 == membrane)
                    .flat_map(|entry| entry.value().iter().map(|r| r.seq).collect::<Vec<_>>()),
            )
            .collect();
        seqs.sort_unstable();
        seqs.dedup();
        seqs.len()
    }
}

impl Default for ReceptorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
