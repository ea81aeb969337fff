//! Batch processing internals
//!
//! Serial scratch construction (row lookups, added offsets, existence
//! mask) followed by the typed per-column kernel that fills the
//! transitional tables. Each kernel invocation owns one column of each
//! output table and touches only its own slots, so the per-column loop
//! parallelizes without coordination.

use super::config::EngineConfig;
use super::state::RowLookup;
use super::transition::{calc_transition, Transition};
use crate::data::{
    BitVec, Column, DataTable, DataType, NativeType, EXISTED_COLUMN, OP_COLUMN, OP_DELETE,
    OP_INSERT, PKEY_COLUMN,
};

/// Row-scoped scratch shared by all column kernels, built serially
#[derive(Debug)]
pub(crate) struct ProcessScratch {
    pub lookup: Vec<RowLookup>,
    pub added_offset: Vec<usize>,
    pub prev_pkey_eq: Vec<bool>,
    pub ops: Vec<u8>,
    pub added_count: usize,
}

/// Walk the flattened batch in order, producing the keep-mask, the
/// `existed` output column, and the per-row scratch vectors.
///
/// Inserts are always kept; a delete is kept only when its key is live
/// in the master mapping. `prev_pkey_eq` folds in the flatten collapse
/// marker for delete-then-insert rows.
pub(crate) fn build_existence_mask(
    flattened: &DataTable,
    reinserted: &[bool],
    lookup: Vec<RowLookup>,
    existed_table: &mut DataTable,
) -> (BitVec, ProcessScratch) {
    let num_rows = flattened.num_rows();
    existed_table.set_num_rows(num_rows);

    let pkey_col = flattened.column(PKEY_COLUMN);
    let op_col = flattened.column(OP_COLUMN);
    let ops: Vec<u8> = (0..num_rows).map(|i| op_col.get_nth::<u8>(i)).collect();

    let mut added_offset = vec![0usize; num_rows];
    let mut prev_pkey_eq = vec![false; num_rows];
    let mut mask = BitVec::filled(num_rows, false);
    let mut added_count = 0usize;

    let existed_col = existed_table.column_mut(EXISTED_COLUMN);

    for i in 0..num_rows {
        prev_pkey_eq[i] = (i > 0 && pkey_col.cell_eq(i, pkey_col, i - 1)) || reinserted[i];
        added_offset[i] = added_count;
        let row_pre_existed = lookup[i].exists;

        match ops[i] {
            OP_INSERT => {
                let existed = row_pre_existed && !prev_pkey_eq[i];
                mask.set(i, true);
                existed_col.set_nth::<u8>(added_count, existed as u8);
                added_count += 1;
            }
            OP_DELETE => {
                if row_pre_existed {
                    mask.set(i, true);
                    existed_col.set_nth::<u8>(added_count, 1);
                    added_count += 1;
                } else {
                    mask.set(i, false);
                }
            }
            other => panic!("unknown op {other} at flattened row {i}"),
        }
    }

    assert_eq!(
        mask.count(),
        added_count,
        "existence mask population diverged from added count"
    );

    (
        mask,
        ProcessScratch {
            lookup,
            added_offset,
            prev_pkey_eq,
            ops,
            added_count,
        },
    )
}

/// Fill one column of the transitional outputs from the flattened batch
/// and the master table. Dispatches on the column dtype to a typed
/// inner routine.
pub(crate) fn process_column(
    config: &EngineConfig,
    scratch: &ProcessScratch,
    fcol: &Column,
    scol: &Column,
    dcol: &mut Column,
    pcol: &mut Column,
    ccol: &mut Column,
    tcol: &mut Column,
) {
    use DataType::*;
    match fcol.dtype() {
        Int8 => process_primitive::<i8>(config, scratch, fcol, scol, dcol, pcol, ccol, tcol),
        Int16 => process_primitive::<i16>(config, scratch, fcol, scol, dcol, pcol, ccol, tcol),
        Int32 | Date => process_primitive::<i32>(config, scratch, fcol, scol, dcol, pcol, ccol, tcol),
        Int64 | Timestamp => {
            process_primitive::<i64>(config, scratch, fcol, scol, dcol, pcol, ccol, tcol)
        }
        UInt8 | Bool => process_primitive::<u8>(config, scratch, fcol, scol, dcol, pcol, ccol, tcol),
        UInt16 => process_primitive::<u16>(config, scratch, fcol, scol, dcol, pcol, ccol, tcol),
        UInt32 => process_primitive::<u32>(config, scratch, fcol, scol, dcol, pcol, ccol, tcol),
        UInt64 | Object => {
            process_primitive::<u64>(config, scratch, fcol, scol, dcol, pcol, ccol, tcol)
        }
        Float32 => process_primitive::<f32>(config, scratch, fcol, scol, dcol, pcol, ccol, tcol),
        Float64 => process_primitive::<f64>(config, scratch, fcol, scol, dcol, pcol, ccol, tcol),
        Str => process_string(config, scratch, fcol, scol, dcol, pcol, ccol, tcol),
    }
}

/// Typed fast path for fixed-width columns.
///
/// Inserts write the transition at the *input* row index, deletes at
/// the *output* index; this asymmetry is part of the published
/// contract.
#[allow(clippy::too_many_arguments)]
fn process_primitive<T: NativeType>(
    config: &EngineConfig,
    scratch: &ProcessScratch,
    fcol: &Column,
    scol: &Column,
    _dcol: &mut Column,
    pcol: &mut Column,
    ccol: &mut Column,
    tcol: &mut Column,
) {
    for i in 0..fcol.size() {
        let j = scratch.added_offset[i];
        let rlookup = scratch.lookup[i];
        let prev_pkey_eq = scratch.prev_pkey_eq[i];

        match scratch.ops[i] {
            OP_INSERT => {
                let cur = fcol.get_nth::<T>(i);
                let cur_valid = fcol.is_valid(i);

                if prev_pkey_eq && rlookup.exists {
                    // Delete + insert collapsed in this batch: the key
                    // stays present, transitioning through the delete
                    let prev_valid = scol.is_valid(rlookup.idx);
                    if prev_valid {
                        pcol.set_nth(j, scol.get_nth::<T>(rlookup.idx));
                    }
                    pcol.set_valid(j, prev_valid);

                    if cur_valid {
                        ccol.set_nth(j, cur);
                    } else if prev_valid {
                        ccol.set_nth(j, scol.get_nth::<T>(rlookup.idx));
                    }
                    ccol.set_valid(j, cur_valid || prev_valid);

                    tcol.set_nth::<u8>(i, Transition::NeqTdt.as_u8());
                    continue;
                }

                let row_pre_existed = rlookup.exists && !prev_pkey_eq;
                let mut prev = cur;
                let mut prev_valid = false;
                if row_pre_existed {
                    prev = scol.get_nth::<T>(rlookup.idx);
                    prev_valid = scol.is_valid(rlookup.idx);
                }

                let prev_cur_eq = prev_valid && cur_valid && prev == cur;
                let exists = cur_valid || (row_pre_existed && prev_valid);
                let prev_existed = row_pre_existed && prev_valid;

                let trans = calc_transition(
                    config,
                    prev_existed,
                    row_pre_existed,
                    exists,
                    prev_valid,
                    cur_valid,
                    prev_cur_eq,
                    prev_pkey_eq,
                );

                if prev_valid {
                    pcol.set_nth(j, prev);
                }
                pcol.set_valid(j, prev_valid);

                if cur_valid {
                    ccol.set_nth(j, cur);
                } else if prev_valid {
                    ccol.set_nth(j, prev);
                }
                ccol.set_valid(j, cur_valid || prev_valid);

                tcol.set_nth::<u8>(i, trans.as_u8());
            }
            OP_DELETE => {
                if rlookup.exists {
                    let prev_valid = scol.is_valid(rlookup.idx);
                    if prev_valid {
                        let prev = scol.get_nth::<T>(rlookup.idx);
                        pcol.set_nth(j, prev);
                        ccol.set_nth(j, prev);
                    }
                    pcol.set_valid(j, prev_valid);
                    ccol.set_valid(j, prev_valid);

                    tcol.set_nth::<u8>(j, Transition::NeqTdf.as_u8());
                }
            }
            other => panic!("unknown op {other} at flattened row {i}"),
        }
    }
}

/// String specialization: prev and current borrow the master column's
/// vocabulary and write by intern index wherever possible.
#[allow(clippy::too_many_arguments)]
fn process_string(
    config: &EngineConfig,
    scratch: &ProcessScratch,
    fcol: &Column,
    scol: &Column,
    _dcol: &mut Column,
    pcol: &mut Column,
    ccol: &mut Column,
    tcol: &mut Column,
) {
    pcol.borrow_vocabulary(scol);
    ccol.borrow_vocabulary(scol);

    for i in 0..fcol.size() {
        let j = scratch.added_offset[i];
        let rlookup = scratch.lookup[i];
        let prev_pkey_eq = scratch.prev_pkey_eq[i];

        match scratch.ops[i] {
            OP_INSERT => {
                let cur_valid = fcol.is_valid(i);

                if prev_pkey_eq && rlookup.exists {
                    let prev_valid = scol.is_valid(rlookup.idx);
                    if prev_valid {
                        pcol.set_vocab_index(j, scol.vocab_index_at(rlookup.idx));
                    }
                    pcol.set_valid(j, prev_valid);

                    if cur_valid {
                        ccol.copy_cell_from(j, fcol, i);
                    } else if prev_valid {
                        ccol.set_vocab_index(j, scol.vocab_index_at(rlookup.idx));
                    }
                    ccol.set_valid(j, cur_valid || prev_valid);

                    tcol.set_nth::<u8>(i, Transition::NeqTdt.as_u8());
                    continue;
                }

                let row_pre_existed = rlookup.exists && !prev_pkey_eq;
                let prev_valid = row_pre_existed && scol.is_valid(rlookup.idx);
                let prev_cur_eq = prev_valid && cur_valid && fcol.cell_eq(i, scol, rlookup.idx);
                let exists = cur_valid || prev_valid;
                let prev_existed = prev_valid;

                let trans = calc_transition(
                    config,
                    prev_existed,
                    row_pre_existed,
                    exists,
                    prev_valid,
                    cur_valid,
                    prev_cur_eq,
                    prev_pkey_eq,
                );

                if prev_valid {
                    pcol.set_vocab_index(j, scol.vocab_index_at(rlookup.idx));
                }
                pcol.set_valid(j, prev_valid);

                if cur_valid {
                    ccol.copy_cell_from(j, fcol, i);
                } else if prev_valid {
                    ccol.set_vocab_index(j, scol.vocab_index_at(rlookup.idx));
                }
                ccol.set_valid(j, cur_valid || prev_valid);

                tcol.set_nth::<u8>(i, trans.as_u8());
            }
            OP_DELETE => {
                if rlookup.exists {
                    let prev_valid = scol.is_valid(rlookup.idx);
                    if prev_valid {
                        let idx = scol.vocab_index_at(rlookup.idx);
                        pcol.set_vocab_index(j, idx);
                        ccol.set_vocab_index(j, idx);
                    }
                    pcol.set_valid(j, prev_valid);
                    ccol.set_valid(j, prev_valid);

                    tcol.set_nth::<u8>(j, Transition::NeqTdf.as_u8());
                }
            }
            other => panic!("unknown op {other} at flattened row {i}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Schema;

    fn flattened(rows: &[(i64, u8)]) -> DataTable {
        let schema = Schema::from_columns([
            (PKEY_COLUMN, DataType::Int64),
            (OP_COLUMN, DataType::UInt8),
        ]);
        let mut t = DataTable::from_schema(&schema);
        t.set_num_rows(rows.len());
        for (i, (pkey, op)) in rows.iter().enumerate() {
            t.column_mut(PKEY_COLUMN).set_nth::<i64>(i, *pkey);
            t.column_mut(OP_COLUMN).set_nth::<u8>(i, *op);
        }
        t
    }

    fn existed_table() -> DataTable {
        let mut t = DataTable::new();
        t.add_column(EXISTED_COLUMN, DataType::Bool, false);
        t
    }

    #[test]
    fn test_mask_keeps_inserts_drops_unknown_deletes() {
        let f = flattened(&[(7, OP_DELETE), (1, OP_INSERT)]);
        let lookup = vec![RowLookup::default(), RowLookup::default()];
        let mut existed = existed_table();

        let (mask, scratch) = build_existence_mask(&f, &[false, false], lookup, &mut existed);
        assert!(!mask.get(0));
        assert!(mask.get(1));
        assert_eq!(scratch.added_count, 1);
        assert_eq!(scratch.added_offset, vec![0, 0]);
        assert_eq!(existed.column(EXISTED_COLUMN).get_nth::<u8>(0), 0);
    }

    #[test]
    fn test_mask_keeps_known_delete() {
        let f = flattened(&[(1, OP_DELETE)]);
        let lookup = vec![RowLookup { exists: true, idx: 0 }];
        let mut existed = existed_table();

        let (mask, scratch) = build_existence_mask(&f, &[false], lookup, &mut existed);
        assert!(mask.get(0));
        assert_eq!(scratch.added_count, 1);
        assert_eq!(existed.column(EXISTED_COLUMN).get_nth::<u8>(0), 1);
    }

    #[test]
    fn test_reinsert_marker_feeds_prev_pkey_eq() {
        let f = flattened(&[(1, OP_INSERT)]);
        let lookup = vec![RowLookup { exists: true, idx: 0 }];
        let mut existed = existed_table();

        let (_, scratch) = build_existence_mask(&f, &[true], lookup, &mut existed);
        assert!(scratch.prev_pkey_eq[0]);
        // A collapsed reinsert reports existed = false
        assert_eq!(existed.column(EXISTED_COLUMN).get_nth::<u8>(0), 0);
    }

    #[test]
    #[should_panic(expected = "unknown op")]
    fn test_unknown_op_is_fatal() {
        let f = flattened(&[(1, 9)]);
        let mut existed = existed_table();
        build_existence_mask(&f, &[false], vec![RowLookup::default()], &mut existed);
    }
}
