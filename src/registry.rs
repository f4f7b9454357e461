//! Named implementations of interfaces
//!
//! Components are registered explicitly at startup against an interface
//! type (usually a `dyn Trait`), then the builder is frozen into a read-only
//! [`Registry`] that is passed to whoever needs to look them up.
//!
//! ```
//! use std::rc::Rc;
//! use webloop::registry::RegistryBuilder;
//!
//! trait Greeter {
//!     fn greet(&self) -> String;
//! }
//!
//! struct English;
//! impl Greeter for English {
//!     fn greet(&self) -> String {
//!         "hello".to_string()
//!     }
//! }
//!
//! let registry = RegistryBuilder::new()
//!     .register::<dyn Greeter>("en", || -> Rc<dyn Greeter> { Rc::new(English) })
//!     .unwrap()
//!     .freeze();
//! assert_eq!(registry.lookup::<dyn Greeter>("en").unwrap().greet(), "hello");
//! ```

use crate::{Error, Result};
use std::any::{type_name, Any, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::rc::Rc;

type Factory<I> = Rc<dyn Fn() -> Rc<I>>;

/// Factories keyed by interface, then by name
type Table = HashMap<TypeId, BTreeMap<String, Box<dyn Any>>>;

/// Registry under construction
#[derive(Default)]
pub struct RegistryBuilder {
    table: Table,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        RegistryBuilder::default()
    }

    /// Register `factory` as the implementation of `I` called `name`
    pub fn register<I: ?Sized + 'static>(
        mut self,
        name: &str,
        factory: impl Fn() -> Rc<I> + 'static,
    ) -> Result<Self> {
        let implementations = self.table.entry(TypeId::of::<I>()).or_default();
        if implementations.contains_key(name) {
            return Err(Error::Registry(format!(
                "{:?} is already registered for {}",
                name,
                type_name::<I>()
            )));
        }

        let factory: Factory<I> = Rc::new(factory);
        implementations.insert(name.to_string(), Box::new(factory));
        Ok(self)
    }

    /// Stop accepting registrations
    pub fn freeze(self) -> Registry {
        Registry { table: self.table }
    }
}

/// Read-only set of registered implementations
pub struct Registry {
    table: Table,
}

impl Registry {
    /// Build a fresh instance of the implementation of `I` called `name`
    pub fn lookup<I: ?Sized + 'static>(&self, name: &str) -> Result<Rc<I>> {
        let factory = self
            .table
            .get(&TypeId::of::<I>())
            .and_then(|implementations| implementations.get(name))
            .and_then(|factory| factory.downcast_ref::<Factory<I>>())
            .ok_or_else(|| {
                Error::Registry(format!(
                    "no implementation of {} named {:?} (known: {})",
                    type_name::<I>(),
                    name,
                    self.implementers::<I>().join(", ")
                ))
            })?;
        Ok(factory())
    }

    /// Names registered for `I`, sorted
    pub fn implementers<I: ?Sized + 'static>(&self) -> Vec<&str> {
        self.table
            .get(&TypeId::of::<I>())
            .map(|implementations| implementations.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count: usize = self.table.values().map(BTreeMap::len).sum();
        f.debug_struct("Registry")
            .field("interfaces", &self.table.len())
            .field("implementations", &count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Shape {
        fn sides(&self) -> u32;
    }

    trait Colour {
        fn name(&self) -> &'static str;
    }

    struct Square;
    impl Shape for Square {
        fn sides(&self) -> u32 {
            4
        }
    }

    struct Triangle;
    impl Shape for Triangle {
        fn sides(&self) -> u32 {
            3
        }
    }

    struct Red;
    impl Colour for Red {
        fn name(&self) -> &'static str {
            "red"
        }
    }

    fn registry() -> Registry {
        RegistryBuilder::new()
            .register::<dyn Shape>("square", || -> Rc<dyn Shape> { Rc::new(Square) })
            .unwrap()
            .register::<dyn Shape>("triangle", || -> Rc<dyn Shape> { Rc::new(Triangle) })
            .unwrap()
            .register::<dyn Colour>("square", || -> Rc<dyn Colour> { Rc::new(Red) })
            .unwrap()
            .freeze()
    }

    #[test]
    fn test_lookup_by_interface_and_name() {
        let registry = registry();
        assert_eq!(registry.lookup::<dyn Shape>("triangle").unwrap().sides(), 3);
        assert_eq!(registry.lookup::<dyn Shape>("square").unwrap().sides(), 4);
        // Same name, different interface
        assert_eq!(registry.lookup::<dyn Colour>("square").unwrap().name(), "red");
    }

    #[test]
    fn test_unknown_name() {
        let err = match registry().lookup::<dyn Shape>("circle") {
            Err(e) => e,
            Ok(_) => panic!("circle should not resolve"),
        };
        let message = err.to_string();
        assert!(message.contains("circle"));
        assert!(message.contains("square, triangle"));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let result = RegistryBuilder::new()
            .register::<dyn Shape>("square", || -> Rc<dyn Shape> { Rc::new(Square) })
            .unwrap()
            .register::<dyn Shape>("square", || -> Rc<dyn Shape> { Rc::new(Triangle) });
        assert!(matches!(result, Err(Error::Registry(_))));
    }

    #[test]
    fn test_implementers_sorted() {
        let registry = registry();
        assert_eq!(registry.implementers::<dyn Shape>(), vec!["square", "triangle"]);
        assert!(registry.implementers::<str>().is_empty());
    }

    #[test]
    fn test_each_lookup_builds_a_new_instance() {
        let registry = registry();
        let a = registry.lookup::<dyn Shape>("square").unwrap();
        let b = registry.lookup::<dyn Shape>("square").unwrap();
        assert!(!Rc::ptr_eq(&a, &b));
    }
}
