/*!
Clock toggler: drives the top-level clock through one cycle.

Purpose
- Centralize the order-of-operations for a single clock period:
  * stage pending combinational work (if inputs are dirty)
  * raise the clock
  * evaluate the circuit (buffer advance, triggered buckets, sweep)
  * lower the clock without a second evaluation

Two strategies cover the clock field of the symbol table: `Null` when no
top-level symbol named `clock` or `clk` exists (purely combinational
circuits are legal), and `Real` bound to that symbol plus its `/prev`
shadow. Raising writes 1 without an edge check — the following
`evaluate_circuit` detects the transition so register commits land after
the rollback buffers have advanced. Lowering goes through the transition
check, which records the falling edge in the shadow and notifies
black-box clock listeners, but fires no bucket.
*/

use crate::data_store::DataStore;
use crate::scheduler::Scheduler;
use crate::symbol::SymbolId;
use crate::symbol_table::SymbolTable;

/// Names searched, in order, for the driving clock of the top module.
const TOP_CLOCK_NAMES: [&str; 2] = ["clock", "clk"];

/// Strategy for driving the top-level clock.
#[derive(Copy, Clone, Debug)]
pub enum ClockToggler {
    /// No top-level clock; raise/lower are no-ops.
    Null,
    /// Bound to the top-level clock symbol.
    Real { clock: SymbolId },
}

impl ClockToggler {
    /// Search the table for `clock`, then `clk`; fall back to the null
    /// toggler when neither exists.
    pub fn for_table(table: &SymbolTable) -> ClockToggler {
        for name in TOP_CLOCK_NAMES {
            if let Some(sym) = table.get(name) {
                return ClockToggler::Real { clock: sym.id };
            }
        }
        ClockToggler::Null
    }

    /// The bound clock symbol, if any.
    pub fn clock(&self) -> Option<SymbolId> {
        match self {
            ClockToggler::Null => None,
            ClockToggler::Real { clock } => Some(*clock),
        }
    }

    /// Drive the clock high. The edge is deliberately not checked here;
    /// `evaluate_circuit` picks it up after advancing the buffers.
    pub fn raise(&self, table: &SymbolTable, store: &mut DataStore) {
        if let ClockToggler::Real { clock } = self {
            store.write_i128(&table[*clock], 1);
        }
    }

    /// Drive the clock low through the transition check: the `/prev`
    /// shadow records the fall and clock listeners observe the negative
    /// edge, but no triggered bucket fires.
    pub fn lower(&self, table: &SymbolTable, store: &mut DataStore, scheduler: &Scheduler) {
        if let ClockToggler::Real { clock } = self {
            store.write_i128(&table[*clock], 0);
            scheduler.check_transition(*clock, table, store);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Tpe;
    use crate::symbol::Kind;

    #[test]
    fn prefers_clock_over_clk() {
        let mut table = SymbolTable::new();
        let clk = table.add("clk", Kind::Clock, Tpe::Clock, 1).unwrap();
        let clock = table.add("clock", Kind::Clock, Tpe::Clock, 1).unwrap();
        let toggler = ClockToggler::for_table(&table);
        assert_eq!(toggler.clock(), Some(clock));
        assert_ne!(toggler.clock(), Some(clk));
    }

    #[test]
    fn falls_back_to_clk() {
        let mut table = SymbolTable::new();
        let clk = table.add("clk", Kind::Clock, Tpe::Clock, 1).unwrap();
        assert_eq!(ClockToggler::for_table(&table).clock(), Some(clk));
    }

    #[test]
    fn no_top_clock_is_legal() {
        let table = SymbolTable::new();
        let toggler = ClockToggler::for_table(&table);
        assert!(toggler.clock().is_none());
        // Raise/lower on the null toggler touch nothing.
        let mut store = DataStore::new(0, 0, 0, 1);
        toggler.raise(&table, &mut store);
        toggler.lower(&table, &mut store, &Scheduler::new());
    }

    #[test]
    fn raise_sets_the_slot_without_firing() {
        let mut table = SymbolTable::new();
        let clock = table.add("clock", Kind::Clock, Tpe::Clock, 1).unwrap();
        let prev = table.add("clock/prev", Kind::ClockPrev, Tpe::Clock, 1).unwrap();
        table.set_shadow(clock, prev);
        table.allocate_data();
        let mut store = DataStore::new(2, 0, 0, 1);

        let toggler = ClockToggler::for_table(&table);
        toggler.raise(&table, &mut store);
        assert_eq!(store.read_i128(table.get("clock").unwrap()), 1);
        // The shadow still holds 0: the edge is pending for the evaluator.
        assert_eq!(store.read_i128(table.get("clock/prev").unwrap()), 0);
    }
}
