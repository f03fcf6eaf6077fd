//! Semantic types — the payload contract published on the bus.
//!
//! A payload is any `Send + Sync + 'static` value implementing [`SemanticType`].
//! Identity is its concrete Rust type. Two provided methods stand in for
//! runtime reflection:
//!
//! - [`SemanticType::facets`] declares the interfaces (`dyn Trait` views) the
//!   payload implements, so a receptor subscribed to an interface receives
//!   every implementing payload.
//! - [`SemanticType::nested`] returns the nested semantic-typed values carried
//!   by the payload; the bus re-publishes each of them into the same membrane.
//!
//! ```
//! use std::sync::Arc;
//! use semproc_core::semantic::{Facets, Message, SemanticType};
//!
//! trait Notification: Send + Sync {
//!     fn text(&self) -> &str;
//! }
//!
//! struct Greeting {
//!     text: String,
//! }
//!
//! impl Notification for Greeting {
//!     fn text(&self) -> &str {
//!         &self.text
//!     }
//! }
//!
//! impl SemanticType for Greeting {
//!     fn facets(self: Arc<Self>, facets: &mut Facets) {
//!         facets.add::<dyn Notification>(self);
//!     }
//! }
//!
//! let message = Message::new(Greeting { text: "hi".into() });
//! assert_eq!(message.view::<dyn Notification>().map(|n| n.text()), Some("hi"));
//! ```

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::types::TypeKey;

/// Marker for anything that can be published on the bus.
///
/// Immutable by convention: receptors only ever see `&T`.
pub trait SemanticType: Any + Send + Sync {
    /// Adds a view for every interface this payload implements.
    fn facets(self: Arc<Self>, facets: &mut Facets) {
        let _ = facets;
    }

    /// Nested semantic-typed values (only the ones that are present).
    fn nested(&self) -> Vec<Message> {
        Vec::new()
    }
}

type View = Box<dyn Any + Send + Sync>;

/// Typed views of one payload, keyed by the viewed type.
#[derive(Default)]
pub struct Facets {
    views: Vec<(TypeKey, View)>,
}

impl Facets {
    /// Registers `view` under the type `I`. The first view for a type wins.
    pub fn add<I: ?Sized + Send + Sync + 'static>(&mut self, view: Arc<I>) -> &mut Self {
        let key = TypeKey::of::<I>();
        if !self.views.iter().any(|(existing, _)| *existing == key) {
            self.views.push((key, Box::new(view)));
        }
        self
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }
}

/// One published payload together with its views.
///
/// Cheap to clone; the payload itself is shared, never copied.
#[derive(Clone)]
pub struct Message {
    inner: Arc<MessageInner>,
}

struct MessageInner {
    id: Uuid,
    payload_type: TypeKey,
    payload: Arc<dyn SemanticType>,
    views: Vec<(TypeKey, View)>,
}

impl Message {
    pub fn new<T: SemanticType>(payload: T) -> Self {
        Self::from_arc(Arc::new(payload))
    }

    pub fn from_arc<T: SemanticType>(payload: Arc<T>) -> Self {
        let mut facets = Facets::default();
        facets.add::<T>(Arc::clone(&payload));
        Arc::clone(&payload).facets(&mut facets);

        Self {
            inner: Arc::new(MessageInner {
                id: Uuid::new_v4(),
                payload_type: TypeKey::of::<T>(),
                payload,
                views: facets.views,
            }),
        }
    }

    /// Unique id of this publish, used to correlate log lines.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// The concrete runtime type of the payload.
    pub fn payload_type(&self) -> TypeKey {
        self.inner.payload_type
    }

    /// Every type this message can be delivered as: the concrete type first,
    /// then its facets in declaration order.
    pub fn type_keys(&self) -> impl Iterator<Item = TypeKey> + '_ {
        self.inner.views.iter().map(|(key, _)| *key)
    }

    pub fn is<T: ?Sized + 'static>(&self) -> bool {
        self.inner.payload_type == TypeKey::of::<T>()
    }

    /// The payload viewed as `T` (its concrete type or a declared facet).
    pub fn view<T: ?Sized + 'static>(&self) -> Option<&Arc<T>> {
        let key = TypeKey::of::<T>();
        self.inner
            .views
            .iter()
            .find(|(existing, _)| *existing == key)
            .and_then(|(_, view)| (**view).downcast_ref::<Arc<T>>())
    }

    pub fn downcast<T: SemanticType>(&self) -> Option<&T> {
        self.view::<T>().map(|payload| &**payload)
    }

    pub(crate) fn nested(&self) -> Vec<Message> {
        self.inner.payload.nested()
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.inner.id)
            .field("payload_type", &self.inner.payload_type)
            .field("views", &self.inner.views.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Labelled: Send + Sync {
        fn label(&self) -> String;
    }

    #[derive(Debug)]
    struct Ping {
        seq: u32,
    }

    impl Labelled for Ping {
        fn label(&self) -> String {
            format!("ping-{}", self.seq)
        }
    }

    impl SemanticType for Ping {
        fn facets(self: Arc<Self>, facets: &mut Facets) {
            facets.add::<dyn Labelled>(self);
        }
    }

    struct Batch {
        first: Arc<Ping>,
        second: Option<Arc<Ping>>,
    }

    impl SemanticType for Batch {
        fn nested(&self) -> Vec<Message> {
            let mut nested = vec![Message::from_arc(Arc::clone(&self.first))];
            nested.extend(self.second.clone().map(Message::from_arc));
            nested
        }
    }

    #[test]
    fn test_concrete_view() {
        let message = Message::new(Ping { seq: 7 });
        assert!(message.is::<Ping>());
        assert_eq!(message.payload_type(), TypeKey::of::<Ping>());
        assert_eq!(message.downcast::<Ping>().map(|p| p.seq), Some(7));
        assert!(message.downcast::<Batch>().is_none());
    }

    #[test]
    fn test_interface_view() {
        let message = Message::new(Ping { seq: 3 });
        let keys: Vec<TypeKey> = message.type_keys().collect();
        assert_eq!(keys, vec![TypeKey::of::<Ping>(), TypeKey::of::<dyn Labelled>()]);
        assert_eq!(
            message.view::<dyn Labelled>().map(|l| l.label()),
            Some("ping-3".to_string())
        );
    }

    #[test]
    fn test_nested_skips_absent_values() {
        let batch = Batch {
            first: Arc::new(Ping { seq: 1 }),
            second: None,
        };
        let message = Message::new(batch);
        let nested = message.nested();
        assert_eq!(nested.len(), 1);
        assert_eq!(nested[0].downcast::<Ping>().map(|p| p.seq), Some(1));
    }

    #[test]
    fn test_facets_first_view_wins() {
        let mut facets = Facets::default();
        facets
            .add::<dyn Labelled>(Arc::new(Ping { seq: 1 }))
            .add::<dyn Labelled>(Arc::new(Ping { seq: 2 }));
        assert_eq!(facets.len(), 1);
    }

    #[test]
    fn test_clone_shares_identity() {
        let message = Message::new(Ping { seq: 9 });
        let copy = message.clone();
        assert_eq!(message.id(), copy.id());
        assert_ne!(message.id(), Message::new(Ping { seq: 9 }).id());
    }
}
