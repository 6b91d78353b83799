//! Namespace registry for caches and deduplicators.
//!
//! Each namespace holds one component of one concrete type. The registry
//! keeps two views of it: a typed handle for callers and an
//! `Arc<dyn Maintained>` for the sweeper, `clear()` and health checks.

use std::any::{type_name, Any};
use std::fmt;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use kb_cache::Maintained;
use kb_core::{ComponentHealth, KbError, KbResult};

/// What kind of component lives in a namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentKind {
    Cache,
    Deduplicator,
}

impl ComponentKind {
    fn prefix(self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::Deduplicator => "dedup",
        }
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

struct Registered {
    maintained: Arc<dyn Maintained>,
    typed: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

#[derive(Default)]
pub(crate) struct Registry {
    entries: DashMap<String, Registered>,
}

impl Registry {
    fn component_name(kind: ComponentKind, namespace: &str) -> String {
        format!("{}:{}", kind.prefix(), namespace)
    }

    /// Return the component registered under `namespace`, creating it with
    /// `make` on first use.
    pub fn get_or_insert<C, F>(&self, kind: ComponentKind, namespace: &str, make: F) -> KbResult<C>
    where
        C: Maintained + Clone + 'static,
        F: FnOnce() -> C,
    {
        let name = Self::component_name(kind, namespace);
        match self.entries.entry(name) {
            Entry::Occupied(occupied) => {
                let registered = occupied.get();
                Arc::clone(&registered.typed)
                    .downcast::<C>()
                    .map(|component| (*component).clone())
                    .map_err(|_| KbError::NamespaceConflict {
                        namespace: namespace.to_string(),
                        registered: registered.type_name,
                    })
            }
            Entry::Vacant(vacant) => {
                let component = Arc::new(make());
                tracing::info!(
                    component = %vacant.key(),
                    type_name = type_name::<C>(),
                    "Registered component"
                );
                vacant.insert(Registered {
                    maintained: component.clone(),
                    typed: component.clone(),
                    type_name: type_name::<C>(),
                });
                Ok((*component).clone())
            }
        }
    }

    /// Registered component names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    // Collected first so no registry shard lock is held while components run.
    fn components(&self) -> Vec<(String, Arc<dyn Maintained>)> {
        self.entries
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(&e.value().maintained)))
            .collect()
    }

    /// Sweep every component. Returns the total number of entries removed.
    pub fn sweep_all(&self) -> usize {
        self.components()
            .into_iter()
            .map(|(_, component)| component.sweep())
            .sum()
    }

    pub fn clear_all(&self) {
        for (_, component) in self.components() {
            component.clear();
        }
    }

    pub fn health(&self) -> Vec<ComponentHealth> {
        let mut components = self.components();
        components.sort_by(|a, b| a.0.cmp(&b.0));
        components
            .into_iter()
            .map(|(name, component)| component.health(&name))
            .collect()
    }
}
