//! Data table
//!
//! An ordered set of named columns sharing one row count. The batch
//! entry points live here: `flatten_batch` collapses a primary-keyed
//! fragment buffer to one net row per key, `clone_masked` filters rows,
//! `append_rows` aligns an incoming fragment to the table schema.

use super::bitvec::BitVec;
use super::column::Column;
use super::schema::{Schema, OP_COLUMN, OP_DELETE, OP_INSERT, PKEY_COLUMN};
use super::types::{DataType, Value};
use crate::{FluxError, Result};
use ahash::AHashMap;

/// A flattened batch: the collapsed table plus a per-row marker for net
/// inserts whose key saw a delete earlier in the same batch.
#[derive(Debug, Clone)]
pub struct FlattenedBatch {
    pub table: DataTable,
    pub reinserted: Vec<bool>,
}

/// Named, ordered columns sharing a row count
#[derive(Debug, Clone)]
pub struct DataTable {
    schema: Schema,
    columns: Vec<Column>,
    num_rows: usize,
}

impl DataTable {
    /// Empty table with no columns.
    pub fn new() -> Self {
        Self {
            schema: Schema::new(),
            columns: Vec::new(),
            num_rows: 0,
        }
    }

    /// Table shaped by `schema`, zero rows. The reserved op column is
    /// created without validity tracking (an op is always present).
    pub fn from_schema(schema: &Schema) -> Self {
        let mut table = Self::new();
        for (name, dtype) in schema.iter() {
            table.add_column(name, dtype, name != OP_COLUMN);
        }
        table
    }

    /// Add a column sized to the current row count. Idempotent for an
    /// existing column of the same dtype; a dtype conflict is fatal.
    pub fn add_column(&mut self, name: &str, dtype: DataType, with_validity: bool) {
        if let Some(existing) = self.schema.dtype_of(name) {
            assert_eq!(
                existing, dtype,
                "column `{name}` already exists as {existing:?}"
            );
            return;
        }
        self.schema.add_column(name, dtype);
        let mut col = Column::new(dtype, with_validity);
        col.set_size(self.num_rows);
        self.columns.push(col);
    }

    #[inline]
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    #[inline]
    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    #[inline]
    pub fn num_cols(&self) -> usize {
        self.columns.len()
    }

    /// Column by name; an unknown name is a programmer error.
    pub fn column(&self, name: &str) -> &Column {
        let idx = self
            .schema
            .index_of(name)
            .unwrap_or_else(|| panic!("unknown column `{name}`"));
        &self.columns[idx]
    }

    pub fn column_mut(&mut self, name: &str) -> &mut Column {
        let idx = self
            .schema
            .index_of(name)
            .unwrap_or_else(|| panic!("unknown column `{name}`"));
        &mut self.columns[idx]
    }

    pub fn column_opt(&self, name: &str) -> Option<&Column> {
        self.schema.index_of(name).map(|i| &self.columns[i])
    }

    #[inline]
    pub fn column_at(&self, index: usize) -> &Column {
        &self.columns[index]
    }

    #[inline]
    pub fn column_at_mut(&mut self, index: usize) -> &mut Column {
        &mut self.columns[index]
    }

    /// Mutable view of all columns, index-aligned with the schema.
    pub fn columns_mut(&mut self) -> &mut [Column] {
        &mut self.columns
    }

    /// Resize every column to `n` rows.
    pub fn set_num_rows(&mut self, n: usize) {
        for col in &mut self.columns {
            col.set_size(n);
        }
        self.num_rows = n;
    }

    /// Reserve capacity for `n` additional rows in every column.
    pub fn reserve(&mut self, n: usize) {
        for col in &mut self.columns {
            col.reserve(n);
        }
    }

    /// Zero the row count; columns and schema stay.
    pub fn clear(&mut self) {
        self.set_num_rows(0);
    }

    /// Read one cell as a tagged scalar.
    pub fn value_at(&self, name: &str, row: usize) -> Value {
        self.column(name).value_at(row)
    }

    /// Widen a column in place; narrowing or unknown targets are
    /// rejected.
    pub fn promote_column(&mut self, name: &str, new_dtype: DataType) -> Result<()> {
        let current = self
            .schema
            .dtype_of(name)
            .ok_or_else(|| FluxError::ColumnNotFound(name.to_string()))?;
        if !current.widens_to(new_dtype) {
            return Err(FluxError::InvalidPromotion {
                column: name.to_string(),
                from: current,
                to: new_dtype,
            });
        }
        self.column_mut(name).promote(new_dtype);
        self.schema.retype_column(name, new_dtype);
        Ok(())
    }

    /// New table containing only rows where `mask` is set.
    pub fn clone_masked(&self, mask: &BitVec) -> DataTable {
        let mut out = DataTable::new();
        for ((name, dtype), col) in self.schema.iter().zip(&self.columns) {
            out.add_column(name, dtype, true);
            if dtype == DataType::Str {
                out.column_mut(name).borrow_vocabulary(col);
            }
        }
        let kept = mask.count();
        out.set_num_rows(kept);
        let mut dst = 0;
        for src in 0..self.num_rows {
            if !mask.get(src) {
                continue;
            }
            for (ci, col) in self.columns.iter().enumerate() {
                out.columns[ci].copy_cell_from(dst, col, src);
            }
            dst += 1;
        }
        out
    }

    /// Append `src` rows to this table, aligning by column name.
    ///
    /// Extra `src` columns are ignored; columns missing from `src` fill
    /// invalid. A dtype conflict on a shared column is a schema error.
    pub fn append_rows(&mut self, src: &DataTable) -> Result<()> {
        for (name, dtype) in self.schema.iter() {
            if let Some(src_col) = src.column_opt(name) {
                if src_col.dtype() != dtype {
                    return Err(FluxError::SchemaMismatch(format!(
                        "column `{name}`: expected {dtype:?}, fragment has {:?}",
                        src_col.dtype()
                    )));
                }
            }
        }
        let base = self.num_rows;
        self.set_num_rows(base + src.num_rows());
        for (ci, (name, _)) in self.schema.iter().enumerate() {
            if let Some(src_col) = src.column_opt(name) {
                let dst_col = &mut self.columns[ci];
                for row in 0..src.num_rows() {
                    dst_col.copy_cell_from(base + row, src_col, row);
                }
            }
            // Missing columns stay at their invalid zero-extension
        }
        Ok(())
    }

    /// Collapse a primary-keyed batch to one net row per key, in order
    /// of first appearance.
    ///
    /// A trailing delete wins; otherwise the latest insert wins, with
    /// later valid cells overriding earlier ones cell-by-cell. A delete
    /// mid-run resets the accumulated cells, and the rebuilt row is
    /// marked in `reinserted`.
    pub fn flatten_batch(&self) -> FlattenedBatch {
        assert!(
            self.schema.has_column(PKEY_COLUMN) && self.schema.has_column(OP_COLUMN),
            "flatten requires a primary-keyed table"
        );
        let mut out = DataTable::new();
        for ((name, dtype), col) in self.schema.iter().zip(&self.columns) {
            out.add_column(name, dtype, name != OP_COLUMN);
            if dtype == DataType::Str {
                out.column_mut(name).borrow_vocabulary(col);
            }
        }

        let pkey_idx = self.schema.index_of(PKEY_COLUMN).unwrap();
        let op_idx = self.schema.index_of(OP_COLUMN).unwrap();
        let data_cols: Vec<usize> = (0..self.columns.len())
            .filter(|&i| i != pkey_idx && i != op_idx)
            .collect();

        let mut seen: AHashMap<Value, usize> = AHashMap::new();
        let mut reinserted: Vec<bool> = Vec::new();
        let mut out_rows = 0usize;

        for row in 0..self.num_rows {
            let pkey = self.columns[pkey_idx].value_at(row);
            let op = self.columns[op_idx].get_nth::<u8>(row);

            let out_row = match seen.get(&pkey) {
                Some(&r) => r,
                None => {
                    let r = out_rows;
                    out_rows += 1;
                    out.set_num_rows(out_rows);
                    out.columns[pkey_idx].copy_cell_from(r, &self.columns[pkey_idx], row);
                    out.columns[op_idx].set_nth::<u8>(r, op);
                    reinserted.push(false);
                    seen.insert(pkey, r);
                    // Fresh row: data cells start invalid
                    if op == OP_INSERT {
                        for &ci in &data_cols {
                            if self.columns[ci].is_valid(row) {
                                out.columns[ci].copy_cell_from(r, &self.columns[ci], row);
                            }
                        }
                    } else if op != OP_DELETE {
                        panic!("unknown op {op} in batch row {row}");
                    }
                    continue;
                }
            };

            match op {
                OP_INSERT => {
                    let was_delete = out.columns[op_idx].get_nth::<u8>(out_row) == OP_DELETE;
                    if was_delete {
                        // Delete followed by insert: rebuild from scratch
                        for &ci in &data_cols {
                            out.columns[ci].set_valid(out_row, false);
                        }
                        out.columns[op_idx].set_nth::<u8>(out_row, OP_INSERT);
                        reinserted[out_row] = true;
                    }
                    for &ci in &data_cols {
                        if self.columns[ci].is_valid(row) {
                            out.columns[ci].copy_cell_from(out_row, &self.columns[ci], row);
                        }
                    }
                }
                OP_DELETE => {
                    out.columns[op_idx].set_nth::<u8>(out_row, OP_DELETE);
                    for &ci in &data_cols {
                        out.columns[ci].set_valid(out_row, false);
                    }
                    // Trailing delete wins over any earlier reinsert
                    reinserted[out_row] = false;
                }
                other => panic!("unknown op {other} in batch row {row}"),
            }
        }

        FlattenedBatch {
            table: out,
            reinserted,
        }
    }

    /// Collapse to net rows, dropping the reinsert markers.
    pub fn flatten(&self) -> DataTable {
        self.flatten_batch().table
    }
}

impl Default for DataTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for DataTable {
    /// Cell-level equality: same schema, same row count, same values
    /// (strings compared by content, not index).
    fn eq(&self, other: &Self) -> bool {
        if self.num_rows != other.num_rows || self.schema.len() != other.schema.len() {
            return false;
        }
        for ((name, dtype), (oname, odtype)) in self.schema.iter().zip(other.schema.iter()) {
            if name != oname || dtype != odtype {
                return false;
            }
        }
        for (ci, col) in self.columns.iter().enumerate() {
            let other_col = &other.columns[ci];
            for row in 0..self.num_rows {
                match (col.is_valid(row), other_col.is_valid(row)) {
                    (false, false) => {}
                    (true, true) => {
                        if !col.cell_eq(row, other_col, row) {
                            return false;
                        }
                    }
                    _ => return false,
                }
            }
        }
        true
    }
}
