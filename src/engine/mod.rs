/*!
Engine: public facade coordinating the symbol table, data store,
scheduler and clock toggler.

Overview
- `Engine::new` builds everything from an already-lowered circuit: the
  flattening walk, compilation into assigners, arena allocation, the
  one-time orphan run.
- The test driver then talks to the facade: `set_value`/`get_value` poke
  and peek by flattened name, `cycle` runs one clock period, `do_cycles`
  loops with logging, `evaluate_circuit` is the low-level single
  evaluation.
- Stop statements latch a result code; once latched, pokes, peeks and
  cycles short-circuit with `SimError::Stopped` until `clear_stop`.

A cycle is: stage pending combinational work, raise the clock, mark
inputs dirty, evaluate (advance rollback buffers, run triggered buckets
on their edges, replay the input-sensitive list, check the stop latch),
lower the clock. The low phase is not re-evaluated; values sampled after
the cycle reflect the post-edge state until the next propagation.
*/

use std::path::Path;

use log::{debug, info, warn};
use num_bigint::BigInt;
use num_traits::{ToPrimitive, Zero};

use crate::blackbox::BlackBoxRegistry;
use crate::clock::ClockToggler;
use crate::compiler::ExpressionCompiler;
use crate::data_store::{DataStore, WaveRecorder, fits_width};
use crate::error::SimError;
use crate::ir::Circuit;
use crate::scheduler::Scheduler;
use crate::symbol::{Kind, Symbol, SymbolId};
use crate::symbol_table::SymbolTable;
use crate::vcd_logger::VcdLogger;

#[cfg(test)]
mod tests;

/// Construction-time options for an [`Engine`].
pub struct EngineOptions {
    /// Per-assigner execution tracing through the `log` facade.
    pub set_verbose: bool,
    /// Consumed by the loader driving this engine: apply the lowering
    /// passes before handing the circuit over. The engine itself assumes
    /// lowered input either way.
    pub low_compile_at_load: bool,
    /// Log the circuit AST at load time.
    pub show_lir_at_load: bool,
    /// Rollback history depth; the store keeps this many past buffers in
    /// addition to the current one.
    pub rollback_buffers: usize,
    /// Break combinational cycles (with a warning) instead of failing.
    pub allow_cycles: bool,
    /// Invalid validity-gated reads yield random in-range values instead
    /// of zero.
    pub valid_if_is_random: bool,
    /// Implementations for extern modules, tried in order.
    pub black_box_registry: BlackBoxRegistry,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            set_verbose: false,
            low_compile_at_load: false,
            show_lir_at_load: false,
            rollback_buffers: 0,
            allow_cycles: false,
            valid_if_is_random: false,
            black_box_registry: BlackBoxRegistry::new(),
        }
    }
}

/// Executable model of one circuit plus the driving state machine.
pub struct Engine {
    name: String,
    table: SymbolTable,
    store: DataStore,
    scheduler: Scheduler,
    toggler: ClockToggler,
    stop_symbols: Vec<SymbolId>,
    inputs_dirty: bool,
    wall_time: u64,
}

impl Engine {
    // -------------- construction --------------

    /// Compile `circuit` into an executable model. Compile-time errors
    /// (duplicate or unresolved symbols, oversized literals, unresolved
    /// black boxes, disallowed combinational cycles) abort construction.
    pub fn new(circuit: &Circuit, options: EngineOptions) -> Result<Engine, SimError> {
        if options.show_lir_at_load {
            info!("loading circuit:\n{circuit:#?}");
        }
        let (mut table, instances) =
            SymbolTable::from_circuit(circuit, &options.black_box_registry)?;
        let mut scheduler = ExpressionCompiler::compile(
            circuit,
            &mut table,
            &instances,
            options.valid_if_is_random,
            options.allow_cycles,
        )?;
        scheduler.set_verbose(options.set_verbose);

        // Arena layout is final only after compilation, which may add
        // `/prev` shadows for derived clocks.
        let (ints, longs, bigs) = table.allocate_data();
        let mut store = DataStore::new(ints, longs, bigs, options.rollback_buffers + 1);

        let toggler = ClockToggler::for_table(&table);
        let mut stop_symbols: Vec<SymbolId> = table
            .iter()
            .filter(|s| s.kind == Kind::Stop)
            .map(|s| s.id)
            .collect();
        stop_symbols.sort();

        // Static assignments: constant-fed wires reach steady state before
        // the first cycle.
        scheduler.execute_orphans(&table, &mut store);

        debug!(
            "engine `{}` ready: {} symbols, clock {:?}",
            circuit.top,
            table.len(),
            toggler.clock().map(|id| &table[id].name)
        );
        Ok(Engine {
            name: circuit.top.clone(),
            table,
            store,
            scheduler,
            toggler,
            stop_symbols,
            inputs_dirty: true,
            wall_time: 0,
        })
    }

    // -------------- peek / poke --------------

    /// Read a value by flattened name, propagating pending input changes
    /// first.
    pub fn get_value(&mut self, name: &str) -> Result<BigInt, SimError> {
        self.get_value_at(name, 0)
    }

    /// Read a value from `offset` buffers back; offset 0 is current.
    /// Historical reads skip propagation (past buffers cannot change).
    pub fn get_value_at(&mut self, name: &str, offset: usize) -> Result<BigInt, SimError> {
        self.check_stopped()?;
        let id = self.lookup(name)?;
        if offset == 0 {
            self.propagate();
            return Ok(self.store.read_big(&self.table[id]));
        }
        if offset >= self.store.num_buffers() {
            return Err(SimError::OffsetOutOfRange {
                name: name.to_string(),
                offset,
                limit: self.store.num_buffers(),
            });
        }
        Ok(self.store.earlier_value(&self.table[id], offset))
    }

    /// Poke a primary input. Marks inputs dirty; the write propagates on
    /// the next peek, cycle, or explicit evaluation.
    pub fn set_value(&mut self, name: &str, value: impl Into<BigInt>) -> Result<BigInt, SimError> {
        self.set_value_with(name, value.into(), false, false, 0)
    }

    /// Full-control poke.
    ///
    /// - `force`: allow non-input targets; the forward transitive subgraph
    ///   rooted at the symbol is re-run immediately.
    /// - `register_poke`: allow writing a register's canonical slot.
    /// - `offset`: memory-slot index (targets of kind memory only).
    pub fn set_value_with(
        &mut self,
        name: &str,
        value: BigInt,
        force: bool,
        register_poke: bool,
        offset: usize,
    ) -> Result<BigInt, SimError> {
        self.check_stopped()?;
        let id = self.lookup(name)?;
        let sym = &self.table[id];
        if !fits_width(&value, sym.width, sym.signed) {
            warn!(
                "poke of {value} into `{}` exceeds {} bits; masking",
                sym.name, sym.width
            );
        }

        if offset > 0 {
            return self.poke_memory(name, offset, value);
        }

        match sym.kind {
            Kind::InputPort => {
                self.store.write_big(sym, &value);
                self.inputs_dirty = true;
            }
            Kind::Clock => {
                // Manual clock pokes go through the trigger check so the
                // edge fires the clock's bucket immediately.
                self.store.write_big(sym, &value);
                self.scheduler
                    .check_transition(id, &self.table, &mut self.store);
                self.inputs_dirty = true;
            }
            Kind::Register if register_poke => {
                self.store.write_big(sym, &value);
                self.inputs_dirty = true;
            }
            _ if force => {
                // Re-run the forward subgraph only; a full sweep would let
                // the symbol's own driver overwrite the forced value.
                self.store.write_big(sym, &value);
                let closure = self.table.reachable_from([id]);
                let assigners = self.scheduler.get_assigners(&closure);
                self.scheduler
                    .execute_subset(&assigners, &self.table, &mut self.store);
            }
            _ => {
                return Err(SimError::BadPokeTarget {
                    name: name.to_string(),
                });
            }
        }
        Ok(self.store.read_big(&self.table[id]))
    }

    /// Read one memory slot.
    pub fn peek_memory(&mut self, name: &str, index: usize) -> Result<BigInt, SimError> {
        self.check_stopped()?;
        let id = self.lookup(name)?;
        let sym = &self.table[id];
        if sym.kind != Kind::Memory || index >= sym.slots {
            return Err(SimError::OffsetOutOfRange {
                name: name.to_string(),
                offset: index,
                limit: if sym.kind == Kind::Memory { sym.slots } else { 0 },
            });
        }
        self.propagate();
        Ok(self.store.read_slot_big(&self.table[id], index))
    }

    /// Write one memory slot directly.
    pub fn poke_memory(
        &mut self,
        name: &str,
        index: usize,
        value: BigInt,
    ) -> Result<BigInt, SimError> {
        self.check_stopped()?;
        let id = self.lookup(name)?;
        let sym = &self.table[id];
        if sym.kind != Kind::Memory || index >= sym.slots {
            return Err(SimError::OffsetOutOfRange {
                name: name.to_string(),
                offset: index,
                limit: if sym.kind == Kind::Memory { sym.slots } else { 0 },
            });
        }
        self.store.write_slot_big(&self.table[id], index, &value);
        self.inputs_dirty = true;
        Ok(self.store.read_slot_big(&self.table[id], index))
    }

    // -------------- cycling --------------

    /// Run one full clock period.
    pub fn cycle(&mut self, show_state: bool) -> Result<(), SimError> {
        self.check_stopped()?;
        self.wall_time += 1;
        self.store.set_time(self.wall_time);

        // 1) Stage pending combinational work with the clock still low, so
        //    next-states reflect every poke since the last cycle.
        self.propagate();

        // 2) Raise the clock; the edge stays pending until evaluation so
        //    register commits land after the buffers advance.
        self.toggler.raise(&self.table, &mut self.store);
        self.inputs_dirty = true;

        // 3) Evaluate: buffers, triggered buckets, sweep, stop latch.
        let evaluated = self.evaluate_once();

        // 4) Lower the clock even if a stop latched, so the period always
        //    completes. No evaluation happens here; the falling edge is
        //    recorded and becomes visible on the next propagation.
        self.toggler
            .lower(&self.table, &mut self.store, &self.scheduler);
        self.inputs_dirty = true;

        if show_state {
            println!("{}", self.render_state());
        }
        evaluated
    }

    /// Cycle `n` times with per-cycle logging; returns early (without an
    /// error) when a stop condition latches.
    pub fn do_cycles(&mut self, n: usize) -> Result<(), SimError> {
        info!("do_cycles: {n} cycles from time {}", self.wall_time);
        for i in 1..=n {
            match self.cycle(false) {
                Ok(()) => debug!("cycle {i}/{n} done"),
                Err(e) if e.is_stop() => {
                    info!("stopped during cycle {i}/{n}: {e}");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Low-level single evaluation. With an empty `specific_deps` this is
    /// the full §4.5 sequence; with names given, only the forward closure
    /// of those symbols is re-run.
    pub fn evaluate_circuit(&mut self, specific_deps: &[&str]) -> Result<(), SimError> {
        if specific_deps.is_empty() {
            return self.evaluate_once();
        }
        let mut roots = Vec::with_capacity(specific_deps.len());
        for name in specific_deps {
            roots.push(self.lookup(name)?);
        }
        let mut closure = self.table.reachable_from(roots.iter().copied());
        closure.extend(roots);
        let assigners = self.scheduler.get_assigners(&closure);
        self.scheduler
            .execute_subset(&assigners, &self.table, &mut self.store);
        self.check_stopped()
    }

    fn evaluate_once(&mut self) -> Result<(), SimError> {
        self.store.advance_buffers();
        for clock in self.scheduler.trigger_keys() {
            self.scheduler
                .execute_triggered_assigns(clock, &self.table, &mut self.store);
        }
        if self.inputs_dirty {
            self.scheduler
                .execute_input_sensitivities(&self.table, &mut self.store);
            self.inputs_dirty = false;
        }
        self.check_stopped()
    }

    fn propagate(&mut self) {
        if self.inputs_dirty {
            self.scheduler
                .execute_input_sensitivities(&self.table, &mut self.store);
            self.inputs_dirty = false;
        }
    }

    // -------------- stop handling --------------

    /// The latched stop code, if any stop statement has fired.
    pub fn last_stop_result(&self) -> Option<i64> {
        for &id in &self.stop_symbols {
            let latch = self.store.read_big(&self.table[id]);
            if !latch.is_zero() {
                return latch.to_i64().map(|v| v - 1);
            }
        }
        None
    }

    /// Whether a stop condition is currently latched.
    pub fn stopped(&self) -> bool {
        self.last_stop_result().is_some()
    }

    /// Clear every stop latch so driving can resume.
    pub fn clear_stop(&mut self) {
        for &id in &self.stop_symbols {
            self.store.write_big(&self.table[id], &BigInt::zero());
        }
    }

    fn check_stopped(&self) -> Result<(), SimError> {
        match self.last_stop_result() {
            Some(code) => Err(SimError::Stopped { code }),
            None => Ok(()),
        }
    }

    // -------------- wave recording --------------

    /// Attach a VCD recorder writing to `path`. Scalar signals are
    /// registered (staging shadows excluded); `show_underscored` also
    /// includes compiler temporaries whose last name segment starts with
    /// an underscore. Current values are dumped immediately.
    pub fn make_vcd_logger(
        &mut self,
        path: &Path,
        show_underscored: bool,
    ) -> Result<(), SimError> {
        let recordable: Vec<&Symbol> = self
            .table
            .iter()
            .filter(|s| {
                s.slots == 1
                    && !matches!(s.kind, Kind::RegisterPrev | Kind::ClockPrev)
                    && (show_underscored || !last_segment_underscored(&s.name))
            })
            .collect();
        let mut logger = VcdLogger::new(path, &self.name, &recordable)?;
        for sym in &recordable {
            logger.record(sym, &self.store.read_big(sym), self.wall_time);
        }
        self.store.set_recorder(Box::new(logger));
        Ok(())
    }

    /// Detach the recorder, discarding unflushed output.
    pub fn disable_vcd(&mut self) {
        self.store.clear_recorder();
    }

    /// Flush recorded changes to disk.
    pub fn write_vcd(&mut self) -> Result<(), SimError> {
        self.store.flush_recorder()?;
        Ok(())
    }

    // -------------- tracing --------------

    /// Lean mode disables per-assigner tracing and wave recording for
    /// speed; fat mode re-enables both.
    pub fn set_lean_mode(&mut self, lean: bool) {
        self.scheduler.set_lean_mode(lean);
        self.store.set_recording(!lean);
    }

    /// Toggle per-assigner tracing.
    pub fn set_verbose(&mut self, verbose: bool) {
        self.scheduler.set_verbose(verbose);
    }

    // -------------- introspection --------------

    pub fn is_register(&self, name: &str) -> bool {
        self.kind_of(name) == Some(Kind::Register)
    }

    pub fn is_input_port(&self, name: &str) -> bool {
        matches!(self.kind_of(name), Some(Kind::InputPort | Kind::Clock))
    }

    pub fn is_output_port(&self, name: &str) -> bool {
        self.kind_of(name) == Some(Kind::OutputPort)
    }

    pub fn get_input_names(&self) -> Vec<String> {
        self.names_of(|s| matches!(s.kind, Kind::InputPort | Kind::Clock))
    }

    pub fn get_output_names(&self) -> Vec<String> {
        self.names_of(|s| s.kind == Kind::OutputPort)
    }

    /// Every pokeable or peekable name, sorted.
    pub fn valid_names(&self) -> Vec<String> {
        self.names_of(|_| true)
    }

    /// All symbols, in definition order.
    pub fn symbols(&self) -> impl Iterator<Item = &Symbol> {
        self.table.iter()
    }

    /// Logical time advanced by `cycle` (also the VCD timestamp).
    pub fn wall_time(&self) -> u64 {
        self.wall_time
    }

    /// Render the computation producing each named symbol, with current
    /// operand values, for debugging.
    pub fn render_computation(&mut self, names: &[&str]) -> Result<String, SimError> {
        self.propagate();
        let mut ids = Vec::with_capacity(names.len());
        for name in names {
            ids.push(self.lookup(name)?);
        }
        Ok(self
            .scheduler
            .render_computation(&ids, &self.table, &self.store))
    }

    // -------------- helpers --------------

    fn lookup(&self, name: &str) -> Result<SymbolId, SimError> {
        self.table
            .id_of(name)
            .ok_or_else(|| SimError::UnknownSymbol {
                name: name.to_string(),
            })
    }

    fn kind_of(&self, name: &str) -> Option<Kind> {
        self.table.get(name).map(|s| s.kind)
    }

    fn names_of(&self, pred: impl Fn(&Symbol) -> bool) -> Vec<String> {
        let mut names: Vec<String> = self
            .table
            .iter()
            .filter(|s| pred(s))
            .map(|s| s.name.clone())
            .collect();
        names.sort();
        names
    }

    fn render_state(&self) -> String {
        let mut parts = vec![format!("time {}:", self.wall_time)];
        for name in self.names_of(|s| {
            s.slots == 1 && !matches!(s.kind, Kind::RegisterPrev | Kind::ClockPrev)
        }) {
            let sym = self.table.get(&name).expect("name came from the table");
            parts.push(format!("{name}={}", self.store.read_big(sym)));
        }
        parts.join(" ")
    }
}

/// Does the last dot-separated segment of `name` start with `_`?
fn last_segment_underscored(name: &str) -> bool {
    name.rsplit('.').next().is_some_and(|seg| seg.starts_with('_'))
}
