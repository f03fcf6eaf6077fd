//! Predicates gating stateful receptors per payload.
//!
//! Keyed by (receptor instance, exact payload type). A receptor with no
//! qualifiers for the payload's type is always qualified; otherwise it is
//! qualified when at least one predicate returns true.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::receptor::ReceptorId;
use crate::semantic::{Message, SemanticType};
use crate::types::TypeKey;

type Predicate = Box<dyn Fn(&Message) -> bool + Send + Sync>;

struct Qualifier {
    /// Keeps the receptor allocation alive so its id cannot be reused.
    _receptor: Arc<dyn Any + Send + Sync>,
    predicate: Predicate,
}

#[derive(Default)]
pub struct QualifierRegistry {
    qualifiers: DashMap<(ReceptorId, TypeKey), Vec<Arc<Qualifier>>>,
}

impl QualifierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T, R, F>(&self, receptor: &Arc<R>, predicate: F)
    where
        T: SemanticType,
        R: Send + Sync + 'static,
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let id = ReceptorId::of(receptor);
        let key = TypeKey::of::<T>();
        let qualifier = Qualifier {
            _receptor: Arc::clone(receptor) as Arc<dyn Any + Send + Sync>,
            predicate: Box::new(move |message: &Message| {
                message.downcast::<T>().is_some_and(|payload| predicate(payload))
            }),
        };
        self.qualifiers
            .entry((id, key))
            .or_default()
            .push(Arc::new(qualifier));
        debug!(receptor = std::any::type_name::<R>(), payload = %key, "qualifier registered");
    }

    /// Removes every qualifier of a receptor. Returns how many were removed.
    pub fn unregister(&self, id: ReceptorId) -> usize {
        let mut removed = 0;
        self.qualifiers.retain(|(receptor, _), qualifiers| {
            if *receptor == id {
                removed += qualifiers.len();
                false
            } else {
                true
            }
        });
        removed
    }

    /// Whether the receptor may be dispatched for this message.
    pub fn is_qualified(&self, id: ReceptorId, message: &Message) -> bool {
        let key = (id, message.payload_type());
        let qualifiers: Vec<Arc<Qualifier>> = match self.qualifiers.get(&key) {
            Some(list) if !list.is_empty() => list.clone(),
            _ => return true,
        };

        qualifiers.iter().any(|qualifier| {
            panic::catch_unwind(AssertUnwindSafe(|| (qualifier.predicate)(message)))
                .unwrap_or_else(|_| {
                    warn!(
                        payload = %message.payload_type(),
                        message_id = %message.id(),
                        "qualifier panicked"
                    );
                    false
                })
        })
    }

    /// Filters `candidates` down to the qualified ones, preserving order.
    pub fn evaluate<I>(&self, candidates: I, message: &Message) -> Vec<ReceptorId>
    where
        I: IntoIterator<Item = ReceptorId>,
    {
        candidates
            .into_iter()
            .filter(|id| self.is_qualified(*id, message))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.qualifiers.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Reading {
        celsius: i32,
    }
    impl SemanticType for Reading {}

    struct Alarm;
    impl SemanticType for Alarm {}

    struct Thermostat;

    #[test]
    fn test_unqualified_receptor_always_passes() {
        let registry = QualifierRegistry::new();
        let receptor = Arc::new(Thermostat);
        let message = Message::new(Reading { celsius: 0 });
        assert!(registry.is_qualified(ReceptorId::of(&receptor), &message));
    }

    #[test]
    fn test_any_true_predicate_qualifies() {
        let registry = QualifierRegistry::new();
        let receptor = Arc::new(Thermostat);
        registry.register::<Reading, _, _>(&receptor, |r| r.celsius > 100);
        registry.register::<Reading, _, _>(&receptor, |r| r.celsius < 0);

        let id = ReceptorId::of(&receptor);
        assert!(registry.is_qualified(id, &Message::new(Reading { celsius: 120 })));
        assert!(registry.is_qualified(id, &Message::new(Reading { celsius: -5 })));
        assert!(!registry.is_qualified(id, &Message::new(Reading { celsius: 20 })));
    }

    #[test]
    fn test_qualifier_scoped_to_exact_type() {
        let registry = QualifierRegistry::new();
        let receptor = Arc::new(Thermostat);
        registry.register::<Reading, _, _>(&receptor, |_| false);

        assert!(registry.is_qualified(ReceptorId::of(&receptor), &Message::new(Alarm)));
    }

    #[test]
    fn test_qualifier_scoped_to_receptor() {
        let registry = QualifierRegistry::new();
        let gated = Arc::new(Thermostat);
        let open = Arc::new(Thermostat);
        registry.register::<Reading, _, _>(&gated, |_| false);

        let message = Message::new(Reading { celsius: 1 });
        let candidates = [ReceptorId::of(&gated), ReceptorId::of(&open)];
        let qualified = registry.evaluate(candidates, &message);
        assert_eq!(qualified, vec![ReceptorId::of(&open)]);
    }

    #[test]
    fn test_panicking_predicate_counts_as_false() {
        let registry = QualifierRegistry::new();
        let receptor = Arc::new(Thermostat);
        registry.register::<Reading, _, _>(&receptor, |_| panic!("bad predicate"));
        let message = Message::new(Reading { celsius: 1 });
        assert!(!registry.is_qualified(ReceptorId::of(&receptor), &message));

        registry.register::<Reading, _, _>(&receptor, |_| true);
        assert!(registry.is_qualified(ReceptorId::of(&receptor), &message));
    }

    #[test]
    fn test_unregister_removes_all() {
        let registry = QualifierRegistry::new();
        let receptor = Arc::new(Thermostat);
        registry.register::<Reading, _, _>(&receptor, |_| false);
        registry.register::<Alarm, _, _>(&receptor, |_| false);
        assert_eq!(registry.len(), 2);

        assert_eq!(registry.unregister(ReceptorId::of(&receptor)), 2);
        assert!(registry.is_empty());
        let message = Message::new(Reading { celsius: 1 });
        assert!(registry.is_qualified(ReceptorId::of(&receptor), &message));
    }
}
