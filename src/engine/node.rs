//! Graph node
//!
//! The engine entry point. A `GraphNode` owns the master state, the
//! input port buffers, the six output ports, and the context and
//! expression registries. One `process` call consumes a port's buffered
//! fragments, updates the master table, fills the transitional outputs,
//! and notifies registered contexts.
//!
//! A node is owned by one control thread; `process` is not reentrant.
//! Within a call, the per-column transitional writes and the context
//! notifications fan out to the rayon pool, each task touching disjoint
//! output slots.

use super::config::EngineConfig;
use super::context::{Context, ContextHandle, ContextKind, ContextRegistry};
use super::expression::{Expression, ExpressionRegistry};
use super::port::{Port, PortMode};
use super::process::{build_existence_mask, process_column};
use super::state::{MasterState, RowLookup};
use super::{
    PORT_CURRENT, PORT_DELTA, PORT_EXISTED, PORT_FLATTENED, PORT_PREV, PORT_TRANSITIONS,
};
use crate::data::{
    BitVec, Column, DataTable, DataType, Schema, EXISTED_COLUMN, OP_COLUMN, OP_DELETE, OP_INSERT,
    PKEY_COLUMN,
};
use crate::{FluxError, Result};
use log::{debug, info, warn};
use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

/// Incremental update engine over one primary-keyed master table
pub struct GraphNode {
    id: usize,
    config: EngineConfig,
    input_schema: Schema,
    output_schema: Schema,
    init: bool,
    was_updated: bool,
    input_ports: HashMap<usize, Port>,
    last_input_port_id: usize,
    output_ports: Vec<Port>,
    state: MasterState,
    contexts: ContextRegistry,
    expressions: ExpressionRegistry,
}

impl GraphNode {
    /// Build a node from the input schema (with `psp_pkey`/`psp_op`)
    /// and the output schema, with the process-wide configuration.
    pub fn new(input_schema: Schema, output_schema: Schema) -> Self {
        Self::with_config(input_schema, output_schema, EngineConfig::from_env())
    }

    /// Build with an explicit configuration (tests, embedding).
    pub fn with_config(
        input_schema: Schema,
        output_schema: Schema,
        config: EngineConfig,
    ) -> Self {
        assert!(
            input_schema.has_column(PKEY_COLUMN) && input_schema.has_column(OP_COLUMN),
            "input schema must carry {PKEY_COLUMN} and {OP_COLUMN}"
        );
        let state = MasterState::new(&output_schema);
        Self {
            id: 0,
            config,
            input_schema,
            output_schema,
            init: false,
            was_updated: false,
            input_ports: HashMap::new(),
            last_input_port_id: 0,
            output_ports: Vec::new(),
            state,
            contexts: ContextRegistry::new(),
            expressions: ExpressionRegistry::new(),
        }
    }

    /// One-shot initialization: create the main input port (always id
    /// 0) and the six output ports. Every later operation requires it.
    pub fn init(&mut self) {
        assert!(!self.init, "engine already initialized");

        self.input_ports
            .insert(0, Port::new(PortMode::Pkeyed, self.input_schema.clone()));

        let existed_schema = Schema::from_columns([(EXISTED_COLUMN, DataType::Bool)]);
        let transitional_schemas = [
            self.input_schema.clone(),
            self.output_schema.clone(),
            self.output_schema.clone(),
            self.output_schema.clone(),
            self.output_schema.as_transitions(),
            existed_schema,
        ];
        for (idx, schema) in transitional_schemas.into_iter().enumerate() {
            let mode = if idx == PORT_FLATTENED {
                PortMode::Pkeyed
            } else {
                PortMode::Raw
            };
            self.output_ports.push(Port::new(mode, schema));
        }

        self.init = true;
        debug!("engine {} initialized", self.id);
    }

    fn assert_init(&self, what: &str) {
        assert!(self.init, "cannot `{what}` on an uninited engine");
    }

    // --- ports ---

    /// Create a side-channel input port, returning its id.
    pub fn make_input_port(&mut self) -> usize {
        self.assert_init("make_input_port");
        let port_id = self.last_input_port_id + 1;
        self.input_ports
            .insert(port_id, Port::new(PortMode::Pkeyed, self.input_schema.clone()));
        self.last_input_port_id = port_id;
        port_id
    }

    /// Drop a side-channel input port. Unknown ids are reported and
    /// ignored.
    pub fn remove_input_port(&mut self, port_id: usize) {
        self.assert_init("remove_input_port");
        if self.input_ports.remove(&port_id).is_none() {
            warn!("input port {port_id} cannot be removed: it does not exist");
        }
    }

    pub fn num_input_ports(&self) -> usize {
        self.input_ports.len()
    }

    pub fn num_output_ports(&self) -> usize {
        self.output_ports.len()
    }

    /// Buffered table of an input port; a bad id is a programmer error.
    pub fn input_table(&self, port_id: usize) -> &DataTable {
        self.assert_init("input_table");
        self.input_ports
            .get(&port_id)
            .unwrap_or_else(|| panic!("invalid input port {port_id}"))
            .table()
    }

    /// Published table of an output port; a bad index is a programmer
    /// error.
    pub fn output_table(&self, port_id: usize) -> &DataTable {
        self.assert_init("output_table");
        assert!(port_id < self.output_ports.len(), "invalid output port {port_id}");
        self.output_ports[port_id].table()
    }

    pub fn release_inputs(&mut self) {
        for port in self.input_ports.values_mut() {
            port.release();
        }
    }

    pub fn release_outputs(&mut self) {
        for port in &mut self.output_ports {
            port.release();
        }
    }

    pub fn clear_input_ports(&mut self) {
        for port in self.input_ports.values_mut() {
            port.table_mut().clear();
        }
    }

    pub fn clear_output_ports(&mut self) {
        for port in &mut self.output_ports {
            port.table_mut().clear();
        }
    }

    // --- data ingress ---

    /// Buffer a fragment on an input port.
    ///
    /// The fragment must carry the reserved columns with op codes 0/1;
    /// bad fragments are rejected and the engine stays usable. Extra
    /// columns are ignored and missing ones land invalid.
    pub fn send(&mut self, port_id: usize, fragment: &DataTable) -> Result<()> {
        self.assert_init("send");
        if !self.input_ports.contains_key(&port_id) {
            warn!("cannot send to input port {port_id}: it does not exist");
            return Err(FluxError::UnknownPort(port_id));
        }
        if !fragment.schema().has_column(PKEY_COLUMN) {
            return Err(FluxError::SchemaMismatch(format!(
                "fragment is missing `{PKEY_COLUMN}`"
            )));
        }
        let op_col = fragment
            .column_opt(OP_COLUMN)
            .ok_or_else(|| FluxError::SchemaMismatch(format!("fragment is missing `{OP_COLUMN}`")))?;
        for row in 0..fragment.num_rows() {
            let op = op_col.get_nth::<u8>(row);
            if op != OP_INSERT && op != OP_DELETE {
                warn!("rejecting fragment: op code {op} at row {row}");
                return Err(FluxError::InvalidOp(op));
            }
        }
        self.input_ports.get_mut(&port_id).unwrap().send(fragment)
    }

    // --- processing ---

    /// Consume a port's buffered rows: update the master table, fill
    /// the transitional outputs, notify contexts. Returns whether
    /// userspace should be notified.
    pub fn process(&mut self, port_id: usize) -> Result<bool> {
        self.assert_init("process");
        self.was_updated = false;

        let port = self
            .input_ports
            .get(&port_id)
            .ok_or(FluxError::UnknownPort(port_id))?;
        if port.table().num_rows() == 0 {
            return Ok(false);
        }
        self.was_updated = true;

        let batch = port.flatten_batch();
        let mut flattened = batch.table;
        let reinserted = batch.reinserted;
        let num_rows = flattened.num_rows();
        debug!(
            "engine {} processing port {port_id}: {} buffered rows, {num_rows} net",
            self.id,
            port.table().num_rows()
        );

        let pkey_col = flattened.column(PKEY_COLUMN);
        let lookup: Vec<RowLookup> = (0..num_rows)
            .map(|i| self.state.lookup(&pkey_col.value_at(i)))
            .collect();

        if self.state.mapping_size() == 0 {
            self.process_first_batch(port_id, flattened);
            return Ok(true);
        }

        self.input_ports.get_mut(&port_id).unwrap().release_or_clear();

        // Refresh expression values on both sides so the kernels read
        // consistent pre/post state
        if !self.expressions.is_empty() {
            self.expressions
                .recompute(self.state.table_mut(), &mut flattened, &lookup);
        }

        for idx in [PORT_DELTA, PORT_PREV, PORT_CURRENT, PORT_TRANSITIONS, PORT_EXISTED] {
            self.output_ports[idx].table_mut().clear();
        }
        if !self.expressions.is_empty() {
            // Materialize alias columns on the cleared tables so the
            // column sets line up before the reserve
            self.expressions
                .compute(&mut [self.output_ports[PORT_DELTA].table_mut()]);
            self.expressions
                .compute(&mut [self.output_ports[PORT_PREV].table_mut()]);
            self.expressions
                .compute(&mut [self.output_ports[PORT_CURRENT].table_mut()]);
        }
        let aliases: Vec<String> = self.expressions.aliases().map(String::from).collect();
        for alias in &aliases {
            self.output_ports[PORT_TRANSITIONS]
                .table_mut()
                .add_column(alias, DataType::UInt8, true);
        }
        for idx in [PORT_DELTA, PORT_PREV, PORT_CURRENT, PORT_TRANSITIONS, PORT_EXISTED] {
            self.output_ports[idx].table_mut().reserve(num_rows);
        }

        let (mask, scratch) = build_existence_mask(
            &flattened,
            &reinserted,
            lookup,
            self.output_ports[PORT_EXISTED].table_mut(),
        );
        self.output_ports[PORT_EXISTED]
            .table_mut()
            .set_num_rows(scratch.added_count);

        // Per-column transitional writes; independent across columns
        {
            let mut column_names: Vec<String> =
                self.output_schema.column_names().map(String::from).collect();
            column_names.extend(aliases.iter().cloned());

            let master = self.state.pkeyed_table();
            let fcols: Vec<&Column> =
                column_names.iter().map(|n| flattened.column(n)).collect();
            let scols: Vec<&Column> = column_names.iter().map(|n| master.column(n)).collect();

            let mut ports = self.output_ports.iter_mut();
            let _flattened_port = ports.next();
            let delta_table = ports.next().unwrap().table_mut();
            let prev_table = ports.next().unwrap().table_mut();
            let current_table = ports.next().unwrap().table_mut();
            let transitions_table = ports.next().unwrap().table_mut();

            delta_table.set_num_rows(scratch.added_count);
            prev_table.set_num_rows(scratch.added_count);
            current_table.set_num_rows(scratch.added_count);
            // Transitions are written at input indices for inserts and
            // output indices for deletes; hold the full batch length
            // during the write phase, truncate after
            transitions_table.set_num_rows(num_rows);

            let dcols = delta_table.columns_mut();
            let pcols = prev_table.columns_mut();
            let ccols = current_table.columns_mut();
            let tcols = transitions_table.columns_mut();
            assert_eq!(dcols.len(), column_names.len(), "delta column set out of step");
            assert_eq!(tcols.len(), column_names.len(), "transitions column set out of step");

            let config = self.config;
            dcols
                .par_iter_mut()
                .zip_eq(pcols.par_iter_mut())
                .zip_eq(ccols.par_iter_mut())
                .zip_eq(tcols.par_iter_mut())
                .enumerate()
                .for_each(|(ci, (((dcol, pcol), ccol), tcol))| {
                    process_column(&config, &scratch, fcols[ci], scols[ci], dcol, pcol, ccol, tcol);
                });

            transitions_table.set_num_rows(scratch.added_count);
        }

        if !self.expressions.is_empty() {
            self.expressions
                .compute(&mut [self.output_ports[PORT_DELTA].table_mut()]);
            self.expressions
                .compute(&mut [self.output_ports[PORT_PREV].table_mut()]);
            self.expressions
                .compute(&mut [self.output_ports[PORT_CURRENT].table_mut()]);
        }

        let published = if scratch.added_count == num_rows {
            flattened
        } else {
            flattened.clone_masked(&mask)
        };

        self.state.update_master_table(&published);
        self.output_ports[PORT_FLATTENED].set_table(published.clone());
        self.contexts.notify_all(&published);

        Ok(true)
    }

    /// Fast path for the first batch into an empty master: adopt the
    /// net inserts wholesale and rebuild contexts from state.
    fn process_first_batch(&mut self, port_id: usize, flattened: DataTable) {
        let num_rows = flattened.num_rows();
        let op_col = flattened.column(OP_COLUMN);
        let mut mask = BitVec::filled(num_rows, false);
        let mut kept = 0usize;
        for i in 0..num_rows {
            match op_col.get_nth::<u8>(i) {
                OP_INSERT => {
                    mask.set(i, true);
                    kept += 1;
                }
                // Delete of a key that cannot exist yet: drop the row
                OP_DELETE => {}
                other => panic!("unknown op {other} at flattened row {i}"),
            }
        }

        let mut published = if kept == num_rows {
            flattened
        } else {
            flattened.clone_masked(&mask)
        };

        if !self.expressions.is_empty() {
            self.expressions.compute(&mut [&mut published]);
        }

        self.state.update_master_table(&published);

        for idx in [PORT_DELTA, PORT_PREV, PORT_CURRENT, PORT_TRANSITIONS] {
            self.output_ports[idx].table_mut().clear();
        }
        let existed_table = self.output_ports[PORT_EXISTED].table_mut();
        existed_table.clear();
        existed_table.set_num_rows(published.num_rows());
        let existed_col = existed_table.column_mut(EXISTED_COLUMN);
        for row in 0..published.num_rows() {
            existed_col.set_nth::<u8>(row, 0);
        }

        self.output_ports[PORT_FLATTENED].set_table(published.clone());
        self.contexts.update_all_from_state(&published);
        self.input_ports.get_mut(&port_id).unwrap().release();
    }

    // --- contexts ---

    /// Register a downstream context under `name`.
    ///
    /// The context's expressions join the registry; if the master is
    /// non-empty the expressions are computed on the master snapshot
    /// and the context is rebuilt from it. The master table gains the
    /// new expression columns either way, so later batches have a
    /// place to land.
    pub fn register_context(
        &mut self,
        name: &str,
        kind: ContextKind,
        mut ctx: Box<dyn Context>,
    ) -> Result<()> {
        self.assert_init("register_context");
        if self.contexts.contains(name) {
            return Err(FluxError::ContextExists(name.to_string()));
        }

        // Unit contexts contribute no expressions
        let expressions = if kind == ContextKind::Unit {
            Vec::new()
        } else {
            ctx.expressions()
        };
        self.expressions.register(&expressions);
        ctx.reset();

        if self.state.mapping_size() > 0 {
            if !self.expressions.is_empty() {
                self.expressions.compute(&mut [self.state.table_mut()]);
            }
            ctx.update_from_state(self.state.pkeyed_table());
        }

        let vocab = self.expressions.vocab();
        let master = self.state.table_mut();
        for expr in &expressions {
            if !master.schema().has_column(expr.alias()) {
                master.add_column(expr.alias(), expr.dtype(), true);
                if expr.dtype() == DataType::Str {
                    master.column_mut(expr.alias()).adopt_vocabulary(Arc::clone(&vocab));
                }
            }
        }

        self.contexts.insert(name, ContextHandle { kind, ctx });
        Ok(())
    }

    /// Drop a context and the expressions it contributed. Unknown
    /// names are ignored.
    pub fn unregister_context(&mut self, name: &str) {
        self.assert_init("unregister_context");
        if let Some(handle) = self.contexts.remove(name) {
            if handle.kind != ContextKind::Unit {
                let aliases: Vec<String> = handle
                    .ctx
                    .expressions()
                    .iter()
                    .map(|e| e.alias().to_string())
                    .collect();
                self.expressions.unregister(&aliases);
                // Rebuild the transitional outputs so dropped alias
                // columns do not linger out of step with the registry
                for idx in [PORT_DELTA, PORT_PREV, PORT_CURRENT, PORT_TRANSITIONS] {
                    self.output_ports[idx].reinit();
                }
            }
        }
    }

    pub fn registered_context_names(&self) -> Vec<String> {
        self.contexts.names()
    }

    /// Names of contexts whose last update produced deltas.
    pub fn get_contexts_last_updated(&self) -> Vec<String> {
        let names = self.contexts.last_updated();
        if self.config.log_progress {
            info!("contexts last updated: {names:?}");
        }
        names
    }

    // --- schema maintenance ---

    /// Widen a column across the master table, the main output, every
    /// input port, and the affected schemas. Narrowing is rejected.
    pub fn promote_column(&mut self, name: &str, new_dtype: DataType) -> Result<()> {
        self.assert_init("promote_column");
        self.state.table_mut().promote_column(name, new_dtype)?;

        for idx in [PORT_FLATTENED, PORT_DELTA, PORT_PREV, PORT_CURRENT] {
            let port = &mut self.output_ports[idx];
            if port.table().schema().has_column(name) {
                port.table_mut().promote_column(name, new_dtype)?;
            }
            if port.schema().has_column(name) {
                port.retype_column(name, new_dtype);
            }
        }
        for port in self.input_ports.values_mut() {
            port.table_mut().promote_column(name, new_dtype)?;
            port.retype_column(name, new_dtype);
        }

        self.input_schema.retype_column(name, new_dtype);
        self.output_schema.retype_column(name, new_dtype);
        Ok(())
    }

    /// Reset the master state and every context; registrations stay.
    pub fn reset(&mut self) {
        self.assert_init("reset");
        self.contexts.reset_all();
        self.state.reset();
    }

    // --- getters ---

    /// Live master table.
    pub fn master_table(&self) -> &DataTable {
        self.assert_init("master_table");
        self.state.pkeyed_table()
    }

    /// Live primary-keyed master view for feeding contexts.
    pub fn pkeyed_table(&self) -> &DataTable {
        self.assert_init("pkeyed_table");
        self.state.pkeyed_table()
    }

    pub fn mapping_size(&self) -> usize {
        self.state.mapping_size()
    }

    pub fn output_schema(&self) -> &Schema {
        &self.output_schema
    }

    pub fn input_schema(&self) -> &Schema {
        &self.input_schema
    }

    pub fn was_updated(&self) -> bool {
        self.was_updated
    }

    pub fn clear_updated(&mut self) {
        self.was_updated = false;
    }

    pub fn set_id(&mut self, id: usize) {
        self.id = id;
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Register expressions directly (outside any context).
    pub fn register_expressions(&mut self, expressions: &[Expression]) {
        self.assert_init("register_expressions");
        self.expressions.register(expressions);
        let vocab = self.expressions.vocab();
        let master = self.state.table_mut();
        for expr in expressions {
            if !master.schema().has_column(expr.alias()) {
                master.add_column(expr.alias(), expr.dtype(), true);
                if expr.dtype() == DataType::Str {
                    master.column_mut(expr.alias()).adopt_vocabulary(Arc::clone(&vocab));
                }
            }
        }
    }
}
