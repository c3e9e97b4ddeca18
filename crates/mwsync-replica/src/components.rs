//! Startup-populated constructors for component kinds.
//!
//! A component manifest replicates kind tags; consumers materialise the
//! tags they do not have yet through this table.

use mwsync_core::SetDiff;
use std::collections::BTreeMap;
use std::fmt;

type Constructor<C> = Box<dyn Fn(&str) -> C>;

/// Map from kind tag to constructor taking the owning object id.
pub struct ComponentFactories<C> {
    constructors: BTreeMap<String, Constructor<C>>,
}

impl<C> Default for ComponentFactories<C> {
    fn default() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }
}

/// Outcome of [`ComponentFactories::materialise`].
pub struct Materialised<C> {
    /// Components built for newly listed kinds
    pub created: Vec<(String, C)>,
    /// Listed kinds with no registered constructor
    pub unknown: Vec<String>,
    /// Kinds no longer listed
    pub removed: Vec<String>,
}

impl<C> ComponentFactories<C> {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor. Returns `true` if it replaced one.
    pub fn register(&mut self, kind: impl Into<String>, constructor: impl Fn(&str) -> C + 'static) -> bool {
        self.constructors
            .insert(kind.into(), Box::new(constructor))
            .is_some()
    }

    /// Whether `kind` can be built.
    #[must_use]
    pub fn contains(&self, kind: &str) -> bool {
        self.constructors.contains_key(kind)
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    /// Build a component of `kind` for `object`.
    #[must_use]
    pub fn create(&self, kind: &str, object: &str) -> Option<C> {
        self.constructors.get(kind).map(|constructor| constructor(object))
    }

    /// Build everything `diff` adds.
    #[must_use]
    pub fn materialise(&self, diff: &SetDiff, object: &str) -> Materialised<C> {
        let mut created = Vec::new();
        let mut unknown = Vec::new();
        for kind in &diff.added {
            match self.create(kind, object) {
                Some(component) => created.push((kind.clone(), component)),
                None => {
                    tracing::warn!(kind, object, "No constructor registered for component kind");
                    unknown.push(kind.clone());
                }
            }
        }
        Materialised {
            created,
            unknown,
            removed: diff.removed.clone(),
        }
    }
}

impl<C> fmt::Debug for ComponentFactories<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.constructors.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[derive(Debug, PartialEq)]
    enum Component {
        Renderer(String),
        Collider(String),
    }

    fn factories() -> ComponentFactories<Component> {
        let mut factories = ComponentFactories::new();
        factories.register("Renderer", |object| Component::Renderer(object.to_string()));
        factories.register("Collider", |object| Component::Collider(object.to_string()));
        factories
    }

    #[test]
    fn creates_registered_kinds() {
        let factories = factories();
        assert_eq!(
            factories.create("Renderer", "cube"),
            Some(Component::Renderer("cube".to_string()))
        );
        assert!(factories.create("Light", "cube").is_none());
        assert_eq!(factories.kinds().collect::<Vec<_>>(), vec!["Collider", "Renderer"]);
    }

    #[test]
    fn register_reports_replacement() {
        let mut factories = factories();
        assert!(factories.register("Renderer", |object| Component::Renderer(format!("{object}!"))));
        assert!(!factories.register("Light", |object| Component::Renderer(object.to_string())));
        assert!(factories.contains("Light"));
    }

    #[test]
    fn materialises_diff() {
        let factories = factories();
        let desired: BTreeSet<String> = ["Collider", "Light"].iter().map(|s| (*s).to_string()).collect();
        let present: BTreeSet<String> = ["Renderer"].iter().map(|s| (*s).to_string()).collect();
        let diff = SetDiff::between(&desired, &present);

        let result = factories.materialise(&diff, "cube");
        assert_eq!(
            result.created,
            vec![("Collider".to_string(), Component::Collider("cube".to_string()))]
        );
        assert_eq!(result.unknown, vec!["Light".to_string()]);
        assert_eq!(result.removed, vec!["Renderer".to_string()]);
    }
}
