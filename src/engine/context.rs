//! Downstream contexts
//!
//! A context is an external subscriber that consumes the published
//! flattened table after each processed batch. The engine stores
//! kind-tagged trait objects and dispatches through the `Context`
//! trait; notification fans out in parallel, with no inter-context
//! ordering promise.

use super::expression::Expression;
use crate::data::DataTable;
use rayon::prelude::*;
use std::collections::HashMap;

/// The five context shapes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextKind {
    Unit,
    Zero,
    One,
    Two,
    GroupedPkey,
}

/// A downstream subscriber
pub trait Context: Send {
    /// Drop accumulated view state.
    fn reset(&mut self);

    /// Whether the last update produced deltas for this context.
    fn has_deltas(&self) -> bool;

    /// Consume the published flattened table for one batch.
    fn notify(&mut self, flattened: &DataTable);

    /// Rebuild from a full master snapshot (registration, reset).
    fn update_from_state(&mut self, table: &DataTable);

    /// Expressions this context contributes. Unit contexts have none.
    fn expressions(&self) -> Vec<Expression> {
        Vec::new()
    }
}

/// Kind-tagged context handle
pub struct ContextHandle {
    pub kind: ContextKind,
    pub ctx: Box<dyn Context>,
}

/// Named collection of registered contexts
#[derive(Default)]
pub struct ContextRegistry {
    contexts: HashMap<String, ContextHandle>,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.contexts.contains_key(name)
    }

    pub fn insert(&mut self, name: &str, handle: ContextHandle) {
        self.contexts.insert(name.to_string(), handle);
    }

    pub fn remove(&mut self, name: &str) -> Option<ContextHandle> {
        self.contexts.remove(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ContextHandle> {
        self.contexts.get_mut(name)
    }

    /// Registered names, sorted for deterministic output.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.contexts.keys().cloned().collect();
        names.sort();
        names
    }

    /// Fan the published table out to every context in parallel.
    pub fn notify_all(&mut self, flattened: &DataTable) {
        self.contexts
            .par_iter_mut()
            .for_each(|(_, handle)| handle.ctx.notify(flattened));
    }

    /// Reset every context and rebuild it from a master snapshot.
    pub fn update_all_from_state(&mut self, table: &DataTable) {
        for handle in self.contexts.values_mut() {
            handle.ctx.reset();
            handle.ctx.update_from_state(table);
        }
    }

    /// Reset every context, keeping registrations.
    pub fn reset_all(&mut self) {
        for handle in self.contexts.values_mut() {
            handle.ctx.reset();
        }
    }

    /// Names of contexts whose last update produced deltas, sorted.
    pub fn last_updated(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .contexts
            .iter()
            .filter(|(_, h)| h.ctx.has_deltas())
            .map(|(n, _)| n.clone())
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{DataType, Schema, PKEY_COLUMN};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Minimal counting subscriber
    struct CountingContext {
        notified: Arc<AtomicUsize>,
        rows_seen: Arc<AtomicUsize>,
        deltas: bool,
    }

    impl Context for CountingContext {
        fn reset(&mut self) {
            self.deltas = false;
        }

        fn has_deltas(&self) -> bool {
            self.deltas
        }

        fn notify(&mut self, flattened: &DataTable) {
            self.notified.fetch_add(1, Ordering::SeqCst);
            self.rows_seen.store(flattened.num_rows(), Ordering::SeqCst);
            self.deltas = flattened.num_rows() > 0;
        }

        fn update_from_state(&mut self, table: &DataTable) {
            self.rows_seen.store(table.num_rows(), Ordering::SeqCst);
        }
    }

    fn registry_with(names: &[&str]) -> (ContextRegistry, Arc<AtomicUsize>) {
        let notified = Arc::new(AtomicUsize::new(0));
        let mut reg = ContextRegistry::new();
        for name in names {
            reg.insert(
                name,
                ContextHandle {
                    kind: ContextKind::Zero,
                    ctx: Box::new(CountingContext {
                        notified: Arc::clone(&notified),
                        rows_seen: Arc::new(AtomicUsize::new(0)),
                        deltas: false,
                    }),
                },
            );
        }
        (reg, notified)
    }

    #[test]
    fn test_notify_all_reaches_every_context() {
        let (mut reg, notified) = registry_with(&["a", "b", "c"]);
        let schema = Schema::from_columns([(PKEY_COLUMN, DataType::Int64)]);
        let mut table = DataTable::from_schema(&schema);
        table.set_num_rows(2);

        reg.notify_all(&table);
        assert_eq!(notified.load(Ordering::SeqCst), 3);
        assert_eq!(reg.last_updated(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_last_updated_filters_and_sorts() {
        let (mut reg, _) = registry_with(&["zeta", "alpha"]);
        let schema = Schema::from_columns([(PKEY_COLUMN, DataType::Int64)]);
        let empty = DataTable::from_schema(&schema);

        // Zero-row notify leaves has_deltas false
        reg.notify_all(&empty);
        assert!(reg.last_updated().is_empty());

        let mut table = DataTable::from_schema(&schema);
        table.set_num_rows(1);
        reg.notify_all(&table);
        assert_eq!(reg.last_updated(), vec!["alpha", "zeta"]);
    }

    #[test]
    fn test_remove_unknown_is_none() {
        let (mut reg, _) = registry_with(&["only"]);
        assert!(reg.remove("missing").is_none());
        assert!(reg.remove("only").is_some());
        assert!(reg.is_empty());
    }
}
