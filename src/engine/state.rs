//! Master state
//!
//! Owns the canonical master table and the `psp_pkey` -> row index
//! mapping. Row indices are stable between updates; deleted rows are
//! tombstoned and their indices reused by later inserts.

use crate::data::{DataTable, Schema, Value, OP_COLUMN, OP_DELETE, OP_INSERT, PKEY_COLUMN};
use ahash::AHashMap;

/// Result of a primary-key lookup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RowLookup {
    pub exists: bool,
    pub idx: usize,
}

/// Canonical master table plus pkey -> row index mapping
#[derive(Debug)]
pub struct MasterState {
    table: DataTable,
    mapping: AHashMap<Value, usize>,
    /// Tombstoned row indices available for reuse
    free: Vec<usize>,
}

impl MasterState {
    /// Build from the output schema (no op column).
    pub fn new(output_schema: &Schema) -> Self {
        Self {
            table: DataTable::from_schema(output_schema),
            mapping: AHashMap::new(),
            free: Vec::new(),
        }
    }

    #[inline]
    pub fn lookup(&self, pkey: &Value) -> RowLookup {
        match self.mapping.get(pkey) {
            Some(&idx) => RowLookup { exists: true, idx },
            None => RowLookup::default(),
        }
    }

    /// Number of live keys.
    #[inline]
    pub fn mapping_size(&self) -> usize {
        self.mapping.len()
    }

    /// Live view of the master table, no copy.
    #[inline]
    pub fn pkeyed_table(&self) -> &DataTable {
        &self.table
    }

    #[inline]
    pub fn table_mut(&mut self) -> &mut DataTable {
        &mut self.table
    }

    fn allocate_row(&mut self) -> usize {
        // Reuse tombstoned indices before growing
        if let Some(idx) = self.free.pop() {
            idx
        } else {
            let idx = self.table.num_rows();
            self.table.set_num_rows(idx + 1);
            idx
        }
    }

    /// Apply a flattened batch to the master table.
    ///
    /// Inserts of new keys take a tombstoned or fresh row and copy every
    /// cell; inserts of mapped keys overwrite only the cells valid in
    /// the batch; deletes unmap the key, invalidate the row's pkey cell
    /// and tombstone the index.
    pub fn update_master_table(&mut self, batch: &DataTable) {
        let op_col_present = batch.schema().has_column(OP_COLUMN);
        let shared: Vec<(usize, usize)> = self
            .table
            .schema()
            .iter()
            .enumerate()
            .filter_map(|(di, (name, _))| {
                batch.schema().index_of(name).map(|si| (di, si))
            })
            .collect();

        for row in 0..batch.num_rows() {
            let pkey = batch.value_at(PKEY_COLUMN, row);
            let op = if op_col_present {
                batch.column(OP_COLUMN).get_nth::<u8>(row)
            } else {
                OP_INSERT
            };

            match op {
                OP_INSERT => match self.mapping.get(&pkey) {
                    Some(&idx) => {
                        for &(di, si) in &shared {
                            let src = batch.column_at(si);
                            if src.is_valid(row) {
                                self.table.column_at_mut(di).copy_cell_from(idx, src, row);
                            }
                        }
                    }
                    None => {
                        let idx = self.allocate_row();
                        for &(di, si) in &shared {
                            self.table
                                .column_at_mut(di)
                                .copy_cell_from(idx, batch.column_at(si), row);
                        }
                        self.mapping.insert(pkey, idx);
                    }
                },
                OP_DELETE => {
                    if let Some(idx) = self.mapping.remove(&pkey) {
                        // Invalidate the dead row's pkey so a raw scan
                        // of the live view never sees a stale key
                        self.table.column_mut(PKEY_COLUMN).set_valid(idx, false);
                        self.free.push(idx);
                    }
                }
                other => panic!("unknown op {other} applied to master state"),
            }
        }
    }

    /// Drop all rows and mappings; schema and columns stay.
    pub fn reset(&mut self) {
        self.table.clear();
        self.mapping.clear();
        self.free.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DataType;

    fn output_schema() -> Schema {
        Schema::from_columns([(PKEY_COLUMN, DataType::Int64), ("v", DataType::Float64)])
    }

    fn batch(rows: &[(i64, Option<f64>, u8)]) -> DataTable {
        let mut t = DataTable::new();
        t.add_column(PKEY_COLUMN, DataType::Int64, true);
        t.add_column(OP_COLUMN, DataType::UInt8, false);
        t.add_column("v", DataType::Float64, true);
        t.set_num_rows(rows.len());
        for (i, (pkey, v, op)) in rows.iter().enumerate() {
            t.column_mut(PKEY_COLUMN).set_nth::<i64>(i, *pkey);
            t.column_mut(OP_COLUMN).set_nth::<u8>(i, *op);
            if let Some(v) = v {
                t.column_mut("v").set_nth::<f64>(i, *v);
            }
        }
        t
    }

    #[test]
    fn test_insert_and_lookup() {
        let mut state = MasterState::new(&output_schema());
        state.update_master_table(&batch(&[
            (1, Some(1.0), OP_INSERT),
            (2, Some(2.0), OP_INSERT),
        ]));

        assert_eq!(state.mapping_size(), 2);
        let lk = state.lookup(&Value::Int64(2));
        assert!(lk.exists);
        assert_eq!(state.pkeyed_table().value_at("v", lk.idx), Value::Float64(2.0));
        assert!(!state.lookup(&Value::Int64(3)).exists);
    }

    #[test]
    fn test_update_overwrites_only_valid_cells() {
        let mut state = MasterState::new(&output_schema());
        state.update_master_table(&batch(&[(1, Some(1.0), OP_INSERT)]));
        // Invalid v in the update leaves the master value alone
        state.update_master_table(&batch(&[(1, None, OP_INSERT)]));

        let lk = state.lookup(&Value::Int64(1));
        assert_eq!(state.pkeyed_table().value_at("v", lk.idx), Value::Float64(1.0));
    }

    #[test]
    fn test_row_indices_stable_across_updates() {
        let mut state = MasterState::new(&output_schema());
        state.update_master_table(&batch(&[
            (1, Some(1.0), OP_INSERT),
            (2, Some(2.0), OP_INSERT),
        ]));
        let before = state.lookup(&Value::Int64(1)).idx;
        state.update_master_table(&batch(&[(1, Some(9.0), OP_INSERT)]));
        assert_eq!(state.lookup(&Value::Int64(1)).idx, before);
    }

    #[test]
    fn test_delete_tombstones_and_reuses() {
        let mut state = MasterState::new(&output_schema());
        state.update_master_table(&batch(&[
            (1, Some(1.0), OP_INSERT),
            (2, Some(2.0), OP_INSERT),
        ]));
        let freed = state.lookup(&Value::Int64(1)).idx;

        state.update_master_table(&batch(&[(1, None, OP_DELETE)]));
        assert_eq!(state.mapping_size(), 1);
        assert!(!state.lookup(&Value::Int64(1)).exists);
        // Dead row's pkey cell is invalidated
        assert!(!state.pkeyed_table().column(PKEY_COLUMN).is_valid(freed));

        // Next insert reuses the tombstoned index
        state.update_master_table(&batch(&[(3, Some(3.0), OP_INSERT)]));
        assert_eq!(state.lookup(&Value::Int64(3)).idx, freed);
        assert_eq!(state.pkeyed_table().num_rows(), 2);
    }

    #[test]
    fn test_delete_of_unknown_key_is_noop() {
        let mut state = MasterState::new(&output_schema());
        state.update_master_table(&batch(&[(7, None, OP_DELETE)]));
        assert_eq!(state.mapping_size(), 0);
        assert_eq!(state.pkeyed_table().num_rows(), 0);
    }

    #[test]
    fn test_reset_keeps_schema() {
        let mut state = MasterState::new(&output_schema());
        state.update_master_table(&batch(&[(1, Some(1.0), OP_INSERT)]));
        state.reset();
        assert_eq!(state.mapping_size(), 0);
        assert_eq!(state.pkeyed_table().num_rows(), 0);
        assert!(state.pkeyed_table().schema().has_column("v"));
    }
}
