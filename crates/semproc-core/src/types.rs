//! Core types — TypeKey, MembraneId, ProcState.

use std::any::TypeId;
use std::borrow::Cow;
use std::fmt;
use std::hash::{Hash, Hasher};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

// ── Payload type identity ──

/// Runtime identity of a payload type or of an interface (`dyn Trait`).
///
/// Equality and hashing use the `TypeId` only; the name is carried for logs.
#[derive(Clone, Copy)]
pub struct TypeKey {
    id: TypeId,
    name: &'static str,
}

impl TypeKey {
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    pub fn id(&self) -> TypeId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for TypeKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeKey {}

impl Hash for TypeKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeKey({})", self.name)
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

// ── Membranes ──

/// Name of a membrane. Two membranes always exist: [`MembraneId::SURFACE`]
/// and [`MembraneId::LOGGER`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MembraneId(Cow<'static, str>);

impl MembraneId {
    /// Entry point for externally originated messages.
    pub const SURFACE: MembraneId = MembraneId(Cow::Borrowed("surface"));
    /// Sink for diagnostic and exception payloads.
    pub const LOGGER: MembraneId = MembraneId(Cow::Borrowed("logger"));

    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&'static str> for MembraneId {
    fn from(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }
}

impl From<String> for MembraneId {
    fn from(name: String) -> Self {
        Self(Cow::Owned(name))
    }
}

impl fmt::Display for MembraneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Dispatch result ──

bitflags! {
    /// Result of one dispatch attempt. Flags combine with `|` when several
    /// receptors fire for one publish call; no flag set means nothing ran.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ProcState: u8 {
        const OK        = 0b0001;
        const EXCEPTION = 0b0010;
        const TIMEOUT   = 0b0100;
    }
}

impl ProcState {
    pub const NOT_PROCESSED: ProcState = ProcState::empty();

    pub fn is_not_processed(self) -> bool {
        self.is_empty()
    }

    /// At least one receptor ran and none failed or timed out.
    pub fn is_success(self) -> bool {
        self == ProcState::OK
    }
}

impl fmt::Display for ProcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_not_processed() {
            return f.write_str("NotProcessed");
        }
        let names: Vec<&str> = [
            (ProcState::OK, "OK"),
            (ProcState::EXCEPTION, "Exception"),
            (ProcState::TIMEOUT, "Timeout"),
        ]
        .iter()
        .filter(|(flag, _)| self.contains(*flag))
        .map(|(_, name)| *name)
        .collect();
        f.write_str(&names.join(" | "))
    }
}
