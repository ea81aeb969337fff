//! Table schema
//!
//! Ordered `(name, dtype)` pairs with O(1) name lookup. The two reserved
//! input columns are `psp_pkey` (any scalar dtype) and `psp_op` (UInt8).

use super::types::DataType;
use ahash::AHashMap;
use serde::{Deserialize, Serialize};

/// Reserved primary-key column name
pub const PKEY_COLUMN: &str = "psp_pkey";
/// Reserved operation column name (UInt8: 0 = insert, 1 = delete)
pub const OP_COLUMN: &str = "psp_op";
/// Column name of the `existed` output table
pub const EXISTED_COLUMN: &str = "psp_existed";

/// Row operation codes carried in `psp_op`
pub const OP_INSERT: u8 = 0;
pub const OP_DELETE: u8 = 1;

/// Ordered column schema with fast name lookup
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Schema {
    columns: Vec<(String, DataType)>,
    #[serde(skip)]
    name_to_index: AHashMap<String, usize>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(name, dtype)` pairs; duplicate names are a
    /// programmer error.
    pub fn from_columns<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = (S, DataType)>,
        S: Into<String>,
    {
        let mut schema = Self::new();
        for (name, dtype) in columns {
            let name = name.into();
            assert!(
                schema.add_column(&name, dtype),
                "duplicate column `{name}` in schema"
            );
        }
        schema
    }

    /// Append a column; returns false if the name already exists.
    pub fn add_column(&mut self, name: &str, dtype: DataType) -> bool {
        if self.name_to_index.contains_key(name) {
            return false;
        }
        self.name_to_index.insert(name.to_string(), self.columns.len());
        self.columns.push((name.to_string(), dtype));
        true
    }

    #[inline]
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.name_to_index.get(name).copied()
    }

    #[inline]
    pub fn has_column(&self, name: &str) -> bool {
        self.name_to_index.contains_key(name)
    }

    pub fn dtype_of(&self, name: &str) -> Option<DataType> {
        self.index_of(name).map(|i| self.columns[i].1)
    }

    /// Change the dtype of an existing column (promotion bookkeeping).
    pub fn retype_column(&mut self, name: &str, dtype: DataType) {
        let idx = self
            .index_of(name)
            .unwrap_or_else(|| panic!("retype of unknown column `{name}`"));
        self.columns[idx].1 = dtype;
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, DataType)> {
        self.columns.iter().map(|(n, t)| (n.as_str(), *t))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Copy of this schema without the reserved op column; the shape of
    /// master and transitional tables.
    pub fn without_op(&self) -> Schema {
        Schema::from_columns(self.iter().filter(|(n, _)| *n != OP_COLUMN))
    }

    /// Same column names, every dtype UInt8; the shape of the
    /// transitions output table.
    pub fn as_transitions(&self) -> Schema {
        Schema::from_columns(self.iter().map(|(n, _)| (n, DataType::UInt8)))
    }

    /// Rebuild the name index (after deserialization).
    pub fn ensure_index(&mut self) {
        if self.name_to_index.len() != self.columns.len() {
            self.name_to_index = self
                .columns
                .iter()
                .enumerate()
                .map(|(i, (n, _))| (n.clone(), i))
                .collect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_lookup() {
        let mut s = Schema::new();
        assert!(s.add_column(PKEY_COLUMN, DataType::Int64));
        assert!(s.add_column("v", DataType::Float64));
        assert!(!s.add_column("v", DataType::Int32));

        assert_eq!(s.index_of(PKEY_COLUMN), Some(0));
        assert_eq!(s.dtype_of("v"), Some(DataType::Float64));
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn test_without_op_drops_reserved() {
        let s = Schema::from_columns([
            (PKEY_COLUMN, DataType::Int64),
            (OP_COLUMN, DataType::UInt8),
            ("v", DataType::Float64),
        ]);
        let out = s.without_op();
        assert!(!out.has_column(OP_COLUMN));
        assert_eq!(out.len(), 2);
        assert_eq!(out.index_of("v"), Some(1));
    }

    #[test]
    fn test_as_transitions_is_all_u8() {
        let s = Schema::from_columns([(PKEY_COLUMN, DataType::Int64), ("v", DataType::Float64)]);
        let t = s.as_transitions();
        assert_eq!(t.dtype_of(PKEY_COLUMN), Some(DataType::UInt8));
        assert_eq!(t.dtype_of("v"), Some(DataType::UInt8));
    }

    #[test]
    fn test_retype() {
        let mut s = Schema::from_columns([("n", DataType::Int32)]);
        s.retype_column("n", DataType::Int64);
        assert_eq!(s.dtype_of("n"), Some(DataType::Int64));
    }
}
