/*!
Scheduler: partitions, sorts and executes the compiled assigners.

Four structures drive evaluation:
- the orphan list: combinational assigners fed only by constants, run once
  at engine construction so constant-fed wires reach steady state;
- the input-sensitive list: every other combinational assigner, i.e. the
  forward closure from anything mutable (input ports, clocks, registers,
  memories, black boxes), replayed whenever inputs are dirty;
- triggered buckets, one per clock-like symbol, holding register commits,
  memory writes, stops and prints. Within a bucket the sampling actions
  run before the commits so they observe pre-commit register values;
- per-bucket followup lists: the combinational closure of the bucket's
  committed symbols, replayed right after the bucket so downstream logic
  sees the new register values even mid-sweep.

Execution order inside each list is a Kahn topological sort over the
combinational subgraph with ties broken by symbol name, so runs are
deterministic. Writes to a clock-like symbol go through a trigger check:
a positive edge fires the symbol's bucket inline, which is how derived
(e.g. gated) clocks trigger their registers during a sweep.
*/

use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap};
use std::rc::Rc;

use log::{debug, warn};

use crate::assigner::{Action, Assigner};
use crate::blackbox::{BlackBox, Transition};
use crate::data_store::DataStore;
use crate::error::SimError;
use crate::symbol::{Kind, SymbolId};
use crate::symbol_table::SymbolTable;

/// Owner and executor of all compiled assigners.
#[derive(Default)]
pub struct Scheduler {
    assigners: Vec<Assigner>,
    /// Output symbol -> assigner index; one writer per symbol (memory
    /// write ports excepted, they share the memory symbol).
    by_output: HashMap<SymbolId, usize>,
    /// Indices of combinational assigners (orphan + sensitive pool).
    combinational: Vec<usize>,
    orphan: Vec<usize>,
    sensitive: Vec<usize>,
    buckets: BTreeMap<SymbolId, Vec<usize>>,
    followups: HashMap<SymbolId, Vec<usize>>,
    clock_listeners: HashMap<SymbolId, Vec<Rc<RefCell<dyn BlackBox>>>>,
    /// Topological position of each combinational output.
    order: HashMap<SymbolId, usize>,
    lean: bool,
    verbose: bool,
}

impl Scheduler {
    pub fn new() -> Scheduler {
        Scheduler::default()
    }

    // -------------- registration (compile time) --------------

    /// Add a combinational assigner; duplicate writers are fatal.
    pub fn add_combinational(&mut self, assigner: Assigner) -> Result<(), SimError> {
        let idx = self.push(assigner, false)?;
        self.combinational.push(idx);
        Ok(())
    }

    /// Add a triggered assigner to `clock`'s bucket.
    pub fn add_triggered(&mut self, clock: SymbolId, assigner: Assigner) -> Result<(), SimError> {
        let mem_write = matches!(assigner.action, Action::MemWrite { .. });
        let idx = self.push(assigner, mem_write)?;
        self.buckets.entry(clock).or_default().push(idx);
        Ok(())
    }

    fn push(&mut self, assigner: Assigner, allow_shared_output: bool) -> Result<usize, SimError> {
        let idx = self.assigners.len();
        if let Some(_existing) = self.by_output.get(&assigner.output) {
            if !allow_shared_output {
                return Err(SimError::DuplicateSymbol {
                    name: format!("assigner output {}", assigner.output.0),
                });
            }
        } else {
            self.by_output.insert(assigner.output, idx);
        }
        self.assigners.push(assigner);
        Ok(idx)
    }

    /// Register a black box to be notified of `clock` transitions.
    pub fn add_clock_listener(&mut self, clock: SymbolId, bbox: Rc<RefCell<dyn BlackBox>>) {
        self.clock_listeners.entry(clock).or_default().push(bbox);
    }

    /// Clock symbols that key a triggered bucket.
    pub fn bucket_keys(&self) -> Vec<SymbolId> {
        self.buckets.keys().copied().collect()
    }

    /// Every symbol whose transitions must be checked during evaluation:
    /// bucket keys plus clocks that only feed black-box listeners.
    pub fn trigger_keys(&self) -> Vec<SymbolId> {
        let mut keys: Vec<SymbolId> = self.buckets.keys().copied().collect();
        for &clock in self.clock_listeners.keys() {
            if !self.buckets.contains_key(&clock) {
                keys.push(clock);
            }
        }
        keys.sort();
        keys
    }

    /// The assigner producing `output`, if any.
    pub fn assigner_for(&self, output: SymbolId) -> Option<&Assigner> {
        self.by_output.get(&output).map(|&i| &self.assigners[i])
    }

    // -------------- sorting & partitioning --------------

    /// Finalize: topologically sort the combinational pool, split it into
    /// orphan and input-sensitive partitions, order the triggered buckets
    /// and precompute their followup closures.
    pub fn finish(&mut self, table: &SymbolTable, allow_cycles: bool) -> Result<(), SimError> {
        self.sort_combinational_assigns(table, allow_cycles)?;
        self.partition(table);
        self.sort_triggered_assigns(table);
        debug!(
            "scheduler ready: {} orphan, {} input-sensitive, {} triggered bucket(s)",
            self.orphan.len(),
            self.sensitive.len(),
            self.buckets.len()
        );
        Ok(())
    }

    /// Kahn's algorithm over the combinational subgraph (register commits
    /// and other triggered assigners excluded), ties broken by name.
    fn sort_combinational_assigns(
        &mut self,
        table: &SymbolTable,
        allow_cycles: bool,
    ) -> Result<(), SimError> {
        let comb_set: BTreeSet<usize> = self.combinational.iter().copied().collect();
        let comb_of = |sym: SymbolId| -> Option<usize> {
            self.by_output.get(&sym).copied().filter(|i| comb_set.contains(i))
        };

        let mut indegree: HashMap<usize, usize> = HashMap::new();
        for &idx in &comb_set {
            let n = self.assigners[idx]
                .reads()
                .into_iter()
                .filter(|&p| p != self.assigners[idx].output)
                .filter_map(comb_of)
                .collect::<BTreeSet<_>>()
                .len();
            indegree.insert(idx, n);
        }

        let name_of = |idx: usize| table[self.assigners[idx].output].name.clone();
        let mut ready: BinaryHeap<Reverse<(String, usize)>> = indegree
            .iter()
            .filter(|&(_, &d)| d == 0)
            .map(|(&i, _)| Reverse((name_of(i), i)))
            .collect();

        let mut sorted = Vec::with_capacity(comb_set.len());
        let mut placed: BTreeSet<usize> = BTreeSet::new();
        loop {
            while let Some(Reverse((_, idx))) = ready.pop() {
                if !placed.insert(idx) {
                    continue;
                }
                sorted.push(idx);
                let out = self.assigners[idx].output;
                for &child_sym in table.children_of(out) {
                    if let Some(child_idx) = comb_of(child_sym) {
                        if placed.contains(&child_idx) {
                            continue;
                        }
                        let d = indegree.get_mut(&child_idx).expect("indegree entry");
                        *d = d.saturating_sub(1);
                        if *d == 0 {
                            ready.push(Reverse((name_of(child_idx), child_idx)));
                        }
                    }
                }
            }
            if sorted.len() == comb_set.len() {
                break;
            }
            // Something is stuck on a cycle.
            let stuck: Vec<usize> = comb_set.iter().copied().filter(|i| !placed.contains(i)).collect();
            if !allow_cycles {
                return Err(SimError::CombinationalCycle {
                    members: self.trace_cycle(table, &stuck, &comb_set),
                });
            }
            // Break deterministically at the smallest-named stuck assigner.
            let victim = stuck
                .into_iter()
                .min_by_key(|&i| name_of(i))
                .expect("non-empty stuck set");
            warn!(
                "combinational cycle broken at `{}`",
                table[self.assigners[victim].output].name
            );
            ready.push(Reverse((name_of(victim), victim)));
        }

        self.order = sorted
            .iter()
            .enumerate()
            .map(|(pos, &idx)| (self.assigners[idx].output, pos))
            .collect();
        self.combinational = sorted;
        Ok(())
    }

    /// Follow unplaced parents from the smallest-named stuck node until a
    /// node repeats; the loop between the repeats is the reported cycle.
    fn trace_cycle(
        &self,
        table: &SymbolTable,
        stuck: &[usize],
        comb_set: &BTreeSet<usize>,
    ) -> Vec<String> {
        let stuck_set: BTreeSet<usize> = stuck.iter().copied().collect();
        let start = *stuck
            .iter()
            .min_by_key(|&&i| &table[self.assigners[i].output].name)
            .expect("non-empty stuck set");
        let mut path = vec![start];
        let mut seen: HashMap<usize, usize> = HashMap::from([(start, 0)]);
        let mut cur = start;
        loop {
            let next = self.assigners[cur]
                .reads()
                .into_iter()
                .filter_map(|p| self.by_output.get(&p).copied())
                .find(|i| comb_set.contains(i) && stuck_set.contains(i));
            let Some(next) = next else {
                break;
            };
            if let Some(&at) = seen.get(&next) {
                return path[at..]
                    .iter()
                    .map(|&i| table[self.assigners[i].output].name.clone())
                    .collect();
            }
            seen.insert(next, path.len());
            path.push(next);
            cur = next;
        }
        path.iter()
            .map(|&i| table[self.assigners[i].output].name.clone())
            .collect()
    }

    /// Split the sorted combinational pool: assigners unreachable from any
    /// mutable symbol are orphans (constant-fed) and run exactly once.
    fn partition(&mut self, table: &SymbolTable) {
        let roots: Vec<SymbolId> = table
            .iter()
            .filter(|s| {
                matches!(
                    s.kind,
                    Kind::InputPort
                        | Kind::Clock
                        | Kind::Register
                        | Kind::Memory
                        | Kind::BlackBoxOutput
                )
            })
            .map(|s| s.id)
            .collect();
        let mut mutable = table.reachable_from(roots.iter().copied());
        // A black box may change its outputs from internal state alone, so
        // its output assigners always stay in the sensitive partition.
        mutable.extend(roots.iter().filter(|id| table[**id].kind == Kind::BlackBoxOutput));

        let (sensitive, orphan): (Vec<usize>, Vec<usize>) = self
            .combinational
            .iter()
            .copied()
            .partition(|&idx| mutable.contains(&self.assigners[idx].output));
        self.sensitive = sensitive;
        self.orphan = orphan;
    }

    /// Order each bucket: sampling actions (stops, prints, memory writes)
    /// first, then register commits, each group by output name.
    fn sort_triggered_assigns(&mut self, table: &SymbolTable) {
        for bucket in self.buckets.values_mut() {
            bucket.sort_by_key(|&idx| {
                let a = &self.assigners[idx];
                (a.is_commit(), table[a.output].name.clone())
            });
        }
        // Followups: the combinational closure of each bucket's committed
        // symbols, in topological order.
        let mut followups = HashMap::new();
        for (&clock, bucket) in &self.buckets {
            let committed: Vec<SymbolId> =
                bucket.iter().map(|&idx| self.assigners[idx].output).collect();
            let closure = table.reachable_from(committed);
            followups.insert(clock, self.get_assigners(&closure));
        }
        self.followups = followups;
    }

    /// Map a symbol set to its combinational assigner indices, preserving
    /// topological order.
    pub fn get_assigners(&self, symbols: &BTreeSet<SymbolId>) -> Vec<usize> {
        let mut found: Vec<usize> = Vec::new();
        for sym in symbols {
            if let Some(&idx) = self.by_output.get(sym) {
                if self.order.contains_key(&self.assigners[idx].output) {
                    found.push(idx);
                }
            }
        }
        found.sort_by_key(|&idx| self.order[&self.assigners[idx].output]);
        found.dedup();
        found
    }

    /// All assigners whose output is transitively reachable from an input
    /// port, in execution order.
    pub fn input_children_assigners(&self, table: &SymbolTable) -> Vec<usize> {
        self.get_assigners(&table.reachable_from(table.input_ports()))
    }

    // -------------- execution --------------

    /// Tracing switches. Lean mode also suppresses wave recording; the
    /// engine toggles that on the data store.
    pub fn set_lean_mode(&mut self, lean: bool) {
        self.lean = lean;
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    #[inline]
    fn tracing(&self) -> bool {
        self.verbose && !self.lean
    }

    /// Run the orphan partition; called once from the engine constructor.
    pub fn execute_orphans(&self, table: &SymbolTable, store: &mut DataStore) {
        for &idx in &self.orphan {
            self.assigners[idx].execute(table, store, self.tracing());
        }
    }

    /// Run the input-sensitive partition in topological order. Idempotent
    /// when no input has changed.
    pub fn execute_input_sensitivities(&self, table: &SymbolTable, store: &mut DataStore) {
        for &idx in self.sensitive.iter() {
            self.run_checked(idx, table, store);
        }
    }

    /// Run an explicit assigner subset (force-poke closure, or the
    /// `specific_deps` path of `evaluate_circuit`).
    pub fn execute_subset(&self, indices: &[usize], table: &SymbolTable, store: &mut DataStore) {
        for &idx in indices {
            self.run_checked(idx, table, store);
        }
    }

    /// Execute one assigner; if its output keys a triggered bucket, detect
    /// the transition and fire the bucket on a positive edge.
    fn run_checked(&self, idx: usize, table: &SymbolTable, store: &mut DataStore) {
        let out = self.assigners[idx].output;
        self.assigners[idx].execute(table, store, self.tracing());
        if self.buckets.contains_key(&out) || self.clock_listeners.contains_key(&out) {
            self.check_transition(out, table, store);
        }
    }

    /// Compare a clock-like symbol against its `/prev` shadow; on a
    /// positive edge run its bucket and followups. Updates the shadow and
    /// notifies black-box listeners on every call.
    pub fn check_transition(&self, clock: SymbolId, table: &SymbolTable, store: &mut DataStore) {
        let cur = store.read_i128(&table[clock]);
        let prev_sym = table[clock].shadow.map(|p| &table[p]);
        let prev = prev_sym.map_or(0, |p| store.read_i128(p));
        let transition = match (prev, cur) {
            (0, v) if v != 0 => Transition::PositiveEdge,
            (v, 0) if v != 0 => Transition::NegativeEdge,
            _ => Transition::NoTransition,
        };
        if let Some(p) = prev_sym {
            store.write_i128(p, cur);
        }
        if transition == Transition::NoTransition {
            return;
        }
        self.notify_listeners(clock, transition, table);
        if transition == Transition::PositiveEdge {
            self.fire_bucket(clock, table, store);
        }
    }

    /// Run `clock`'s bucket followed by the combinational closure of its
    /// commits, so mid-sweep consumers observe the committed values.
    fn fire_bucket(&self, clock: SymbolId, table: &SymbolTable, store: &mut DataStore) {
        if let Some(bucket) = self.buckets.get(&clock) {
            for &idx in bucket {
                self.assigners[idx].execute(table, store, self.tracing());
            }
        }
        if let Some(followups) = self.followups.get(&clock) {
            for &idx in followups {
                self.run_checked(idx, table, store);
            }
        }
    }

    /// The §4.4 `execute_triggered_assigns` entry point: fire `clock`'s
    /// bucket if the symbol transitioned since the last check.
    pub fn execute_triggered_assigns(
        &self,
        clock: SymbolId,
        table: &SymbolTable,
        store: &mut DataStore,
    ) {
        self.check_transition(clock, table, store);
    }

    fn notify_listeners(&self, clock: SymbolId, transition: Transition, table: &SymbolTable) {
        if let Some(listeners) = self.clock_listeners.get(&clock) {
            let clock_name = &table[clock].name;
            for bbox in listeners {
                bbox.borrow_mut().clock_change(transition, clock_name);
            }
        }
    }

    /// Render the computation of each named output, for debugging.
    pub fn render_computation(
        &self,
        outputs: &[SymbolId],
        table: &SymbolTable,
        store: &DataStore,
    ) -> String {
        let mut lines = Vec::new();
        for &id in outputs {
            match self.assigner_for(id) {
                Some(a) => lines.push(a.render(table, store)),
                None => lines.push(format!("{} is not computed by an assigner", table[id].name)),
            }
        }
        lines.join("\n")
    }
}
