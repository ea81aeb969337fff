//! Derived expression columns
//!
//! An expression is a named derived column computed row-by-row from the
//! other columns of a table. The evaluator/parser lives outside the
//! engine; here an expression is an opaque compute function plus its
//! output alias and dtype. All string expression output shares one
//! engine-wide vocabulary.

use super::state::RowLookup;
use crate::data::{DataTable, DataType, SharedVocab, Value, Vocabulary};
use ahash::AHashMap;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

/// Row-level compute function of an expression
pub type ExprFn = Arc<dyn Fn(&DataTable, usize) -> Value + Send + Sync>;

/// A named derived column
#[derive(Clone)]
pub struct Expression {
    alias: String,
    dtype: DataType,
    func: ExprFn,
}

impl fmt::Debug for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Expression")
            .field("alias", &self.alias)
            .field("dtype", &self.dtype)
            .finish()
    }
}

impl Expression {
    pub fn new(
        alias: impl Into<String>,
        dtype: DataType,
        func: impl Fn(&DataTable, usize) -> Value + Send + Sync + 'static,
    ) -> Self {
        Self {
            alias: alias.into(),
            dtype,
            func: Arc::new(func),
        }
    }

    #[inline]
    pub fn alias(&self) -> &str {
        &self.alias
    }

    #[inline]
    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    /// Make sure `table` has this expression's output column, wired to
    /// the shared vocabulary for string output.
    fn ensure_column(&self, table: &mut DataTable, vocab: &SharedVocab) {
        if !table.schema().has_column(&self.alias) {
            table.add_column(&self.alias, self.dtype, true);
            if self.dtype == DataType::Str {
                table.column_mut(&self.alias).adopt_vocabulary(Arc::clone(vocab));
            }
        }
    }

    /// Evaluate into the alias column across all rows of `table`.
    pub fn compute(&self, table: &mut DataTable, vocab: &SharedVocab) {
        self.ensure_column(table, vocab);
        let values: Vec<Value> = (0..table.num_rows())
            .map(|row| (self.func)(table, row))
            .collect();
        let col = table.column_mut(&self.alias);
        for (row, value) in values.iter().enumerate() {
            col.set_value(row, value);
        }
    }

    /// Refresh both sides of an update: every flattened row, plus the
    /// master row for keys that resolved to a live index. Keeps pre and
    /// post reads consistent while transitional tables are written.
    pub fn recompute(
        &self,
        master: &mut DataTable,
        flattened: &mut DataTable,
        changed_rows: &[RowLookup],
        vocab: &SharedVocab,
    ) {
        self.ensure_column(master, vocab);
        self.ensure_column(flattened, vocab);

        let flat_values: Vec<Value> = (0..flattened.num_rows())
            .map(|row| (self.func)(flattened, row))
            .collect();
        let master_values: Vec<(usize, Value)> = changed_rows
            .iter()
            .filter(|lk| lk.exists)
            .map(|lk| (lk.idx, (self.func)(master, lk.idx)))
            .collect();

        let col = flattened.column_mut(&self.alias);
        for (row, value) in flat_values.iter().enumerate() {
            col.set_value(row, value);
        }
        let col = master.column_mut(&self.alias);
        for (idx, value) in &master_values {
            col.set_value(*idx, value);
        }
    }
}

/// Alias -> expression registry with a shared string vocabulary
pub struct ExpressionRegistry {
    exprs: Vec<Expression>,
    by_alias: AHashMap<String, usize>,
    vocab: SharedVocab,
}

impl fmt::Debug for ExpressionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpressionRegistry")
            .field("exprs", &self.exprs)
            .finish()
    }
}

impl ExpressionRegistry {
    pub fn new() -> Self {
        let mut vocab = Vocabulary::new();
        // Sentinel intern: string expression output read slot 0 before
        // any write in the original engine; keeping slot 0 occupied
        // preserves that behavior.
        vocab.intern("__FLUX_SENTINEL__");
        Self {
            exprs: Vec::new(),
            by_alias: AHashMap::new(),
            vocab: Arc::new(RwLock::new(vocab)),
        }
    }

    /// The shared expression vocabulary.
    pub fn vocab(&self) -> SharedVocab {
        Arc::clone(&self.vocab)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.exprs.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.exprs.len()
    }

    /// Registration order iteration.
    pub fn iter(&self) -> impl Iterator<Item = &Expression> {
        self.exprs.iter()
    }

    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        self.exprs.iter().map(|e| e.alias())
    }

    /// Add or replace expressions by alias.
    pub fn register(&mut self, expressions: &[Expression]) {
        for expr in expressions {
            match self.by_alias.get(expr.alias()) {
                Some(&idx) => self.exprs[idx] = expr.clone(),
                None => {
                    self.by_alias.insert(expr.alias().to_string(), self.exprs.len());
                    self.exprs.push(expr.clone());
                }
            }
        }
    }

    /// Drop expressions by alias; unknown aliases are ignored.
    pub fn unregister(&mut self, aliases: &[String]) {
        for alias in aliases {
            if let Some(idx) = self.by_alias.remove(alias) {
                self.exprs.remove(idx);
                // Reindex the tail
                for (i, e) in self.exprs.iter().enumerate().skip(idx) {
                    self.by_alias.insert(e.alias().to_string(), i);
                }
            }
        }
    }

    /// Evaluate every expression on each table in sequence.
    pub fn compute(&self, tables: &mut [&mut DataTable]) {
        for table in tables {
            for expr in &self.exprs {
                expr.compute(table, &self.vocab);
            }
        }
    }

    /// Refresh master and flattened values ahead of transitional writes.
    pub fn recompute(
        &self,
        master: &mut DataTable,
        flattened: &mut DataTable,
        changed_rows: &[RowLookup],
    ) {
        for expr in &self.exprs {
            expr.recompute(master, flattened, changed_rows, &self.vocab);
        }
    }
}

impl Default for ExpressionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Schema, PKEY_COLUMN};

    fn table(rows: &[(i64, f64)]) -> DataTable {
        let schema = Schema::from_columns([
            (PKEY_COLUMN, DataType::Int64),
            ("v", DataType::Float64),
        ]);
        let mut t = DataTable::from_schema(&schema);
        t.set_num_rows(rows.len());
        for (i, (pkey, v)) in rows.iter().enumerate() {
            t.column_mut(PKEY_COLUMN).set_nth::<i64>(i, *pkey);
            t.column_mut("v").set_nth::<f64>(i, *v);
        }
        t
    }

    fn doubled() -> Expression {
        Expression::new("doubled", DataType::Float64, |t, row| {
            match t.value_at("v", row) {
                Value::Float64(v) => Value::Float64(v * 2.0),
                _ => Value::Null,
            }
        })
    }

    #[test]
    fn test_compute_fills_alias_column() {
        let registry = {
            let mut r = ExpressionRegistry::new();
            r.register(&[doubled()]);
            r
        };
        let mut t = table(&[(1, 1.5), (2, 4.0)]);
        registry.compute(&mut [&mut t]);

        assert_eq!(t.value_at("doubled", 0), Value::Float64(3.0));
        assert_eq!(t.value_at("doubled", 1), Value::Float64(8.0));
    }

    #[test]
    fn test_recompute_refreshes_both_sides() {
        let mut registry = ExpressionRegistry::new();
        registry.register(&[doubled()]);

        let mut master = table(&[(1, 1.0), (2, 2.0)]);
        registry.compute(&mut [&mut master]);

        let mut flattened = table(&[(2, 9.0)]);
        let lookups = vec![RowLookup { exists: true, idx: 1 }];
        registry.recompute(&mut master, &mut flattened, &lookups);

        assert_eq!(flattened.value_at("doubled", 0), Value::Float64(18.0));
        // Master side recomputed from its (pre-update) value
        assert_eq!(master.value_at("doubled", 1), Value::Float64(4.0));
    }

    #[test]
    fn test_register_replaces_by_alias() {
        let mut registry = ExpressionRegistry::new();
        registry.register(&[doubled()]);
        registry.register(&[Expression::new("doubled", DataType::Float64, |_, _| {
            Value::Float64(0.0)
        })]);
        assert_eq!(registry.len(), 1);

        let mut t = table(&[(1, 5.0)]);
        registry.compute(&mut [&mut t]);
        assert_eq!(t.value_at("doubled", 0), Value::Float64(0.0));
    }

    #[test]
    fn test_unregister_keeps_order() {
        let mut registry = ExpressionRegistry::new();
        registry.register(&[
            Expression::new("a", DataType::Int64, |_, _| Value::Int64(1)),
            Expression::new("b", DataType::Int64, |_, _| Value::Int64(2)),
            Expression::new("c", DataType::Int64, |_, _| Value::Int64(3)),
        ]);
        registry.unregister(&["b".to_string()]);
        let aliases: Vec<&str> = registry.aliases().collect();
        assert_eq!(aliases, vec!["a", "c"]);
    }

    #[test]
    fn test_vocab_sentinel_occupies_slot_zero() {
        let registry = ExpressionRegistry::new();
        let vocab = registry.vocab();
        assert_eq!(vocab.read().len(), 1);
        assert_eq!(vocab.read().lookup(0), "__FLUX_SENTINEL__");
    }

    #[test]
    fn test_string_expression_uses_shared_vocab() {
        let mut registry = ExpressionRegistry::new();
        registry.register(&[Expression::new("tag", DataType::Str, |t, row| {
            match t.value_at("v", row) {
                Value::Float64(v) if v > 1.0 => Value::Str("big".into()),
                _ => Value::Str("small".into()),
            }
        })]);

        let mut t = table(&[(1, 0.5), (2, 2.5)]);
        registry.compute(&mut [&mut t]);
        assert_eq!(t.value_at("tag", 0), Value::Str("small".into()));
        assert_eq!(t.value_at("tag", 1), Value::Str("big".into()));

        // Interned into the registry vocabulary, after the sentinel
        let vocab = registry.vocab();
        assert!(vocab.read().get("big").unwrap() > 0);
    }
}
