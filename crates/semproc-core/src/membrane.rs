//! Membrane registry — named isolation scopes arranged as a tree.
//!
//! A membrane is created lazily on first reference and lives as long as the
//! bus. Permeability sets only grow. A payload crosses from a membrane into a
//! neighbour (its parent or one of its children) when the source is
//! outbound-permeable and the neighbour inbound-permeable for one of the
//! payload's type keys.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::types::{MembraneId, TypeKey};

#[derive(Debug)]
pub struct Membrane {
    id: MembraneId,
    parent: RwLock<Option<MembraneId>>,
    children: RwLock<Vec<MembraneId>>,
    inbound: RwLock<HashSet<TypeKey>>,
    outbound: RwLock<HashSet<TypeKey>>,
}

impl Membrane {
    fn new(id: MembraneId) -> Self {
        Self {
            id,
            parent: RwLock::new(None),
            children: RwLock::new(Vec::new()),
            inbound: RwLock::new(HashSet::new()),
            outbound: RwLock::new(HashSet::new()),
        }
    }

    pub fn id(&self) -> &MembraneId {
        &self.id
    }

    pub fn parent(&self) -> Option<MembraneId> {
        self.parent.read().clone()
    }

    pub fn children(&self) -> Vec<MembraneId> {
        self.children.read().clone()
    }

    pub fn is_inbound_permeable(&self, key: &TypeKey) -> bool {
        self.inbound.read().contains(key)
    }

    pub fn is_outbound_permeable(&self, key: &TypeKey) -> bool {
        self.outbound.read().contains(key)
    }

    /// Neighbours in the tree: children first, then the parent.
    pub fn neighbours(&self) -> Vec<MembraneId> {
        let mut neighbours = self.children();
        neighbours.extend(self.parent());
        neighbours
    }
}

/// Thread-safe map of every membrane the bus knows about.
pub struct MembraneRegistry {
    membranes: DashMap<MembraneId, Arc<Membrane>>,
    /// Serialises parent/child edits so cycle checks see a stable tree.
    topology: Mutex<()>,
}

impl MembraneRegistry {
    /// Creates a registry holding the Surface and Logger membranes.
    pub fn new() -> Self {
        let registry = Self {
            membranes: DashMap::new(),
            topology: Mutex::new(()),
        };
        registry.get_or_create(&MembraneId::SURFACE);
        registry.get_or_create(&MembraneId::LOGGER);
        registry
    }

    /// Idempotent: returns the existing membrane when there is one.
    pub fn get_or_create(&self, id: &MembraneId) -> Arc<Membrane> {
        if let Some(existing) = self.membranes.get(id) {
            return Arc::clone(existing.value());
        }
        let entry = self.membranes.entry(id.clone()).or_insert_with(|| {
            debug!(membrane = %id, "membrane created");
            Arc::new(Membrane::new(id.clone()))
        });
        Arc::clone(entry.value())
    }

    pub fn get(&self, id: &MembraneId) -> Option<Arc<Membrane>> {
        self.membranes.get(id).map(|m| Arc::clone(m.value()))
    }

    pub fn ids(&self) -> Vec<MembraneId> {
        let mut ids: Vec<MembraneId> = self.membranes.iter().map(|m| m.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.membranes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.membranes.is_empty()
    }

    /// Makes `inner` a child of `outer`, moving it away from any previous parent.
    /// Requests that would close a cycle are ignored.
    pub fn add_child(&self, outer: &MembraneId, inner: &MembraneId) {
        let outer_membrane = self.get_or_create(outer);
        let inner_membrane = self.get_or_create(inner);
        let _topology = self.topology.lock();

        if self.is_ancestor_or_self(inner, outer) {
            warn!(
                outer = %outer,
                inner = %inner,
                "ignoring child membrane that would create a cycle"
            );
            return;
        }

        let previous = inner_membrane.parent.write().replace(outer.clone());
        if let Some(previous) = previous.filter(|p| p != outer) {
            if let Some(old_parent) = self.get(&previous) {
                old_parent.children.write().retain(|c| c != inner);
            }
        }

        let mut children = outer_membrane.children.write();
        if !children.contains(inner) {
            children.push(inner.clone());
            debug!(outer = %outer, inner = %inner, "child membrane added");
        }
    }

    /// True when `candidate` is `id` or one of its ancestors.
    fn is_ancestor_or_self(&self, candidate: &MembraneId, id: &MembraneId) -> bool {
        let mut current = Some(id.clone());
        while let Some(cur) = current {
            if &cur == candidate {
                return true;
            }
            current = self.get(&cur).and_then(|m| m.parent());
        }
        false
    }

    pub fn mark_outbound_permeable(&self, id: &MembraneId, key: TypeKey) {
        if self.get_or_create(id).outbound.write().insert(key) {
            debug!(membrane = %id, payload = %key, "outbound permeable");
        }
    }

    pub fn mark_inbound_permeable(&self, id: &MembraneId, key: TypeKey) {
        if self.get_or_create(id).inbound.write().insert(key) {
            debug!(membrane = %id, payload = %key, "inbound permeable");
        }
    }
}

impl Default for MembraneRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Order;

    fn id(name: &'static str) -> MembraneId {
        MembraneId::from(name)
    }

    #[test]
    fn test_distinguished_membranes_exist() {
        let registry = MembraneRegistry::new();
        assert!(registry.get(&MembraneId::SURFACE).is_some());
        assert!(registry.get(&MembraneId::LOGGER).is_some());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let registry = MembraneRegistry::new();
        let first = registry.get_or_create(&id("session"));
        let second = registry.get_or_create(&id("session"));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_add_child_links_both_ways() {
        let registry = MembraneRegistry::new();
        registry.add_child(&MembraneId::SURFACE, &id("session"));
        registry.add_child(&MembraneId::SURFACE, &id("session"));

        let surface = registry.get(&MembraneId::SURFACE).unwrap();
        assert_eq!(surface.children(), vec![id("session")]);
        let session = registry.get(&id("session")).unwrap();
        assert_eq!(session.parent(), Some(MembraneId::SURFACE));
        assert_eq!(session.neighbours(), vec![MembraneId::SURFACE]);
    }

    #[test]
    fn test_add_child_reparents() {
        let registry = MembraneRegistry::new();
        registry.add_child(&id("a"), &id("c"));
        registry.add_child(&id("b"), &id("c"));

        assert!(registry.get(&id("a")).unwrap().children().is_empty());
        assert_eq!(registry.get(&id("b")).unwrap().children(), vec![id("c")]);
        assert_eq!(registry.get(&id("c")).unwrap().parent(), Some(id("b")));
    }

    #[test]
    fn test_cycle_is_ignored() {
        let registry = MembraneRegistry::new();
        registry.add_child(&id("a"), &id("b"));
        registry.add_child(&id("b"), &id("c"));
        registry.add_child(&id("c"), &id("a"));
        registry.add_child(&id("a"), &id("a"));

        assert_eq!(registry.get(&id("a")).unwrap().parent(), None);
        assert!(registry.get(&id("c")).unwrap().children().is_empty());
    }

    #[test]
    fn test_permeability_grows() {
        let registry = MembraneRegistry::new();
        let key = TypeKey::of::<Order>();
        registry.mark_outbound_permeable(&id("a"), key);
        registry.mark_inbound_permeable(&id("b"), key);

        let a = registry.get(&id("a")).unwrap();
        let b = registry.get(&id("b")).unwrap();
        assert!(a.is_outbound_permeable(&key));
        assert!(!a.is_inbound_permeable(&key));
        assert!(b.is_inbound_permeable(&key));
        assert!(!b.is_outbound_permeable(&TypeKey::of::<String>()));
    }
}
