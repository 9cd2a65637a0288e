//! Service registry: name-keyed capability lookup between modules.
//!
//! A module publishes `Arc<dyn SomeApi>` under a name; another module fetches it
//! by name and type without a compile-time dependency on the publisher.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use dashmap::{mapref::entry::Entry, DashMap};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("service '{name}' is already registered (by {owner})")]
    DuplicateService { name: String, owner: String },
    #[error("service '{name}' is not registered")]
    NotFound { name: String },
    #[error("service '{name}' is a {actual}, not a {expected}")]
    TypeMismatch {
        name: String,
        expected: &'static str,
        actual: &'static str,
    },
}

/// Type-erased `Arc<T>`; `T` may be unsized (`dyn Trait`).
#[derive(Clone)]
pub struct ServiceHandle {
    type_name: &'static str,
    value: Arc<dyn Any + Send + Sync>,
}

impl ServiceHandle {
    pub fn new<T>(service: Arc<T>) -> Self
    where
        T: ?Sized + Send + Sync + 'static,
    {
        Self {
            type_name: std::any::type_name::<T>(),
            value: Arc::new(service),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn downcast<T>(&self) -> Option<Arc<T>>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.value.downcast_ref::<Arc<T>>().cloned()
    }
}

impl fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("type", &self.type_name)
            .finish()
    }
}

struct ServiceEntry {
    owner: Option<String>,
    handle: ServiceHandle,
}

#[derive(Default)]
pub struct ServiceRegistry {
    services: DashMap<String, ServiceEntry>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, handle: ServiceHandle) -> Result<(), ServiceError> {
        self.insert(name, None, handle)
    }

    /// Same as [`register`](Self::register), remembering which module published it.
    pub fn register_owned(
        &self,
        name: &str,
        owner: &str,
        handle: ServiceHandle,
    ) -> Result<(), ServiceError> {
        self.insert(name, Some(owner.to_string()), handle)
    }

    fn insert(
        &self,
        name: &str,
        owner: Option<String>,
        handle: ServiceHandle,
    ) -> Result<(), ServiceError> {
        match self.services.entry(name.to_string()) {
            Entry::Occupied(existing) => Err(ServiceError::DuplicateService {
                name: name.to_string(),
                owner: existing
                    .get()
                    .owner
                    .clone()
                    .unwrap_or_else(|| "the application".to_string()),
            }),
            Entry::Vacant(slot) => {
                tracing::debug!(
                    service = name,
                    owner = owner.as_deref().unwrap_or("-"),
                    r#type = handle.type_name(),
                    "Service registered"
                );
                slot.insert(ServiceEntry { owner, handle });
                Ok(())
            }
        }
    }

    /// Typed lookup. Fails with `NotFound` or `TypeMismatch`.
    pub fn get<T>(&self, name: &str) -> Result<Arc<T>, ServiceError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let entry = self.services.get(name).ok_or_else(|| ServiceError::NotFound {
            name: name.to_string(),
        })?;
        entry
            .handle
            .downcast::<T>()
            .ok_or_else(|| ServiceError::TypeMismatch {
                name: name.to_string(),
                expected: std::any::type_name::<T>(),
                actual: entry.handle.type_name(),
            })
    }

    /// Optional capability lookup: `None` when absent or of another type.
    pub fn try_get<T>(&self, name: &str) -> Option<Arc<T>>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.get::<T>(name).ok()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    pub fn owner_of(&self, name: &str) -> Option<String> {
        self.services.get(name).and_then(|e| e.owner.clone())
    }

    /// Sorted service names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Greeter: Send + Sync {
        fn greet(&self) -> String;
    }

    struct English;
    impl Greeter for English {
        fn greet(&self) -> String {
            "hello".into()
        }
    }

    trait Copier: Send + Sync {
        fn copy(&self, id: u32) -> u32;
    }

    impl std::fmt::Debug for dyn Copier {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("dyn Copier")
        }
    }

    #[test]
    fn register_and_get_trait_object() {
        let reg = ServiceRegistry::new();
        let svc: Arc<dyn Greeter> = Arc::new(English);
        reg.register_owned("greeter", "lang", ServiceHandle::new(svc))
            .unwrap();

        let got = reg.get::<dyn Greeter>("greeter").unwrap();
        assert_eq!(got.greet(), "hello");
        assert_eq!(reg.owner_of("greeter").as_deref(), Some("lang"));
        assert!(reg.contains("greeter"));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn duplicate_name_is_rejected_and_first_wins() {
        let reg = ServiceRegistry::new();
        reg.register("n", ServiceHandle::new(Arc::new(1u32))).unwrap();

        let err = reg
            .register_owned("n", "other", ServiceHandle::new(Arc::new(2u32)))
            .unwrap_err();
        assert!(matches!(err, ServiceError::DuplicateService { ref name, .. } if name == "n"));
        assert_eq!(*reg.get::<u32>("n").unwrap(), 1);
    }

    #[test]
    fn missing_capability_degrades_gracefully() {
        let reg = ServiceRegistry::new();
        let svc: Arc<dyn Greeter> = Arc::new(English);
        reg.register("templates", ServiceHandle::new(svc)).unwrap();

        // present under the name, but not the capability we ask for
        assert!(reg.try_get::<dyn Copier>("templates").is_none());
        match reg.get::<dyn Copier>("templates").unwrap_err() {
            ServiceError::TypeMismatch { expected, actual, .. } => {
                assert!(expected.contains("Copier"));
                assert!(actual.contains("Greeter"));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        assert_eq!(
            reg.get::<dyn Copier>("copier").unwrap_err(),
            ServiceError::NotFound {
                name: "copier".into()
            }
        );
    }

    #[test]
    fn names_are_sorted() {
        let reg = ServiceRegistry::new();
        reg.register("b", ServiceHandle::new(Arc::new(()))).unwrap();
        reg.register("a", ServiceHandle::new(Arc::new(()))).unwrap();
        assert_eq!(reg.names(), vec!["a".to_string(), "b".to_string()]);
    }
}
