//! Ports
//!
//! A port wraps one data table as a buffered input (`Pkeyed`) or a
//! published output (`Raw`). Inputs accumulate fragments between
//! process calls; outputs hold the tables consumers read by index.

use crate::data::{DataTable, FlattenedBatch, Schema};
use crate::Result;

/// Port semantics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortMode {
    /// Primary-keyed input buffer (flattenable)
    Pkeyed,
    /// Raw output holder
    Raw,
}

/// A buffered input/output holder around one data table
#[derive(Debug)]
pub struct Port {
    mode: PortMode,
    schema: Schema,
    table: DataTable,
}

impl Port {
    pub fn new(mode: PortMode, schema: Schema) -> Self {
        let table = DataTable::from_schema(&schema);
        Self { mode, schema, table }
    }

    #[inline]
    pub fn mode(&self) -> PortMode {
        self.mode
    }

    #[inline]
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    #[inline]
    pub fn table(&self) -> &DataTable {
        &self.table
    }

    #[inline]
    pub fn table_mut(&mut self) -> &mut DataTable {
        &mut self.table
    }

    /// Append fragment rows to the buffer.
    pub fn send(&mut self, fragment: &DataTable) -> Result<()> {
        debug_assert_eq!(self.mode, PortMode::Pkeyed, "send on a raw output port");
        self.table.append_rows(fragment)
    }

    /// Collapse the buffered rows to one net row per key.
    pub fn flatten_batch(&self) -> FlattenedBatch {
        self.table.flatten_batch()
    }

    /// Deduplicated snapshot of the buffer, markers dropped.
    pub fn flatten(&self) -> DataTable {
        self.table.flatten()
    }

    /// Publish a table on an output port, replacing the held one.
    pub fn set_table(&mut self, table: DataTable) {
        self.table = table;
    }

    /// Truncate the buffered table.
    pub fn release(&mut self) {
        self.table.clear();
    }

    /// Truncate when no caller can still reference the previous
    /// snapshot. Snapshots here are owned copies, so this always
    /// releases; kept distinct for contract parity.
    pub fn release_or_clear(&mut self) {
        self.release();
    }

    /// Rebuild the held table from the (possibly retyped) schema.
    pub fn reinit(&mut self) {
        self.table = DataTable::from_schema(&self.schema);
    }

    /// Promotion bookkeeping: retype a schema column.
    pub fn retype_column(&mut self, name: &str, dtype: crate::data::DataType) {
        self.schema.retype_column(name, dtype);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{DataType, Value, OP_COLUMN, OP_INSERT, PKEY_COLUMN};

    fn input_schema() -> Schema {
        Schema::from_columns([
            (PKEY_COLUMN, DataType::Int64),
            (OP_COLUMN, DataType::UInt8),
            ("v", DataType::Float64),
        ])
    }

    fn fragment(rows: &[(i64, f64)]) -> DataTable {
        let mut t = DataTable::from_schema(&input_schema());
        t.set_num_rows(rows.len());
        for (i, (pkey, v)) in rows.iter().enumerate() {
            t.column_mut(PKEY_COLUMN).set_nth::<i64>(i, *pkey);
            t.column_mut(OP_COLUMN).set_nth::<u8>(i, OP_INSERT);
            t.column_mut("v").set_nth::<f64>(i, *v);
        }
        t
    }

    #[test]
    fn test_send_accumulates() {
        let mut port = Port::new(PortMode::Pkeyed, input_schema());
        port.send(&fragment(&[(1, 1.0)])).unwrap();
        port.send(&fragment(&[(2, 2.0), (1, 1.5)])).unwrap();
        assert_eq!(port.table().num_rows(), 3);

        let fb = port.flatten_batch();
        assert_eq!(fb.table.num_rows(), 2);
        assert_eq!(fb.table.value_at("v", 0), Value::Float64(1.5));
    }

    #[test]
    fn test_release_truncates() {
        let mut port = Port::new(PortMode::Pkeyed, input_schema());
        port.send(&fragment(&[(1, 1.0)])).unwrap();
        port.release();
        assert_eq!(port.table().num_rows(), 0);
        // Schema survives a release
        assert!(port.table().schema().has_column("v"));
    }
}
