/*!
Assigner: a compiled unit that computes and writes one symbol's value.

Every lowered statement becomes one of a small set of actions:
- `Eval`: the common case; evaluate an expression tree and write the
  output slot. Register next-states are plain `Eval`s targeting the
  `/prev` shadow.
- `BlackBoxInput`: an `Eval` that additionally notifies a black box that
  one of its input pins changed.
- `Commit`: copy a register's staged `/prev` value into the canonical
  slot; lives in a triggered bucket.
- `MemWrite`: enable-gated store into a memory arena; triggered.
- `Stop`: latch a result code when the enable is non-zero; triggered.
- `Print`: emit a formatted line when the enable is non-zero; triggered.

Assigners are immutable after compilation and are owned by the scheduler.
*/

use std::cell::RefCell;
use std::rc::Rc;

use log::trace;
use num_bigint::BigInt;
use num_traits::{ToPrimitive, Zero};

use crate::blackbox::BlackBox;
use crate::data_store::DataStore;
use crate::expr::{self, EvalMode, Expr};
use crate::symbol::SymbolId;
use crate::symbol_table::SymbolTable;

/// What an assigner does when executed.
pub enum Action {
    Eval {
        expr: Expr,
        mode: EvalMode,
    },
    BlackBoxInput {
        expr: Expr,
        mode: EvalMode,
        bbox: Rc<RefCell<dyn BlackBox>>,
        pin: String,
    },
    Commit {
        from: SymbolId,
    },
    MemWrite {
        addr: Expr,
        en: Expr,
        data: Expr,
        mode: EvalMode,
    },
    Stop {
        en: Expr,
        code: i64,
    },
    Print {
        en: Expr,
        format: String,
        args: Vec<Expr>,
    },
}

/// A compiled, immutable write of one output symbol.
pub struct Assigner {
    pub output: SymbolId,
    pub action: Action,
}

impl Assigner {
    /// Every symbol this assigner reads; used to register dependency edges.
    pub fn reads(&self) -> Vec<SymbolId> {
        let mut out = Vec::new();
        match &self.action {
            Action::Eval { expr, .. } | Action::BlackBoxInput { expr, .. } => {
                expr.references(&mut out)
            }
            Action::Commit { from } => out.push(*from),
            Action::MemWrite { addr, en, data, .. } => {
                addr.references(&mut out);
                en.references(&mut out);
                data.references(&mut out);
            }
            Action::Stop { en, .. } => en.references(&mut out),
            Action::Print { en, args, .. } => {
                en.references(&mut out);
                for a in args {
                    a.references(&mut out);
                }
            }
        }
        out
    }

    /// True for register-commit assigners; buckets run these after the
    /// sampling actions (stops, prints, memory writes) so those observe
    /// pre-commit register values.
    #[inline]
    pub fn is_commit(&self) -> bool {
        matches!(self.action, Action::Commit { .. })
    }

    /// Run this assigner against the store. `verbose` enables per-assigner
    /// tracing through the `log` facade.
    pub fn execute(&self, table: &SymbolTable, store: &mut DataStore, verbose: bool) {
        match &self.action {
            Action::Eval { expr, mode } => {
                let value = self.write_eval(expr, *mode, table, store);
                if verbose {
                    trace!("{} <= {}", table[self.output].name, value);
                }
            }
            Action::BlackBoxInput { expr, mode, bbox, pin } => {
                let value = self.write_eval(expr, *mode, table, store);
                bbox.borrow_mut().input_changed(pin, &value);
                if verbose {
                    trace!("{} <= {} (black box pin {})", table[self.output].name, value, pin);
                }
            }
            Action::Commit { from } => {
                let out = &table[self.output];
                let value = store.read_big(&table[*from]);
                store.write_big(out, &value);
                if verbose {
                    trace!("{} <= {} (commit)", out.name, value);
                }
            }
            Action::MemWrite { addr, en, data, mode } => {
                self.mem_write(addr, en, data, *mode, table, store, verbose);
            }
            Action::Stop { en, code } => {
                let latch = &table[self.output];
                let enabled = !expr::eval_big(en, table, store).is_zero();
                if enabled && store.read_big(latch).is_zero() {
                    store.write_big(latch, &BigInt::from(code + 1));
                    if verbose {
                        trace!("{} stop latched with code {}", latch.name, code);
                    }
                }
            }
            Action::Print { en, format, args } => {
                if !expr::eval_big(en, table, store).is_zero() {
                    let values: Vec<BigInt> =
                        args.iter().map(|a| expr::eval_big(a, table, store)).collect();
                    println!("{}", format_print(format, &values));
                }
            }
        }
    }

    fn write_eval(
        &self,
        expr: &Expr,
        mode: EvalMode,
        table: &SymbolTable,
        store: &mut DataStore,
    ) -> BigInt {
        let out = &table[self.output];
        match mode {
            EvalMode::Fixed => {
                let v = expr::eval_i128(expr, table, store);
                store.write_i128(out, v);
                // Re-read to report the width-normalized value.
                BigInt::from(store.read_i128(out))
            }
            EvalMode::Big => {
                let v = expr::eval_big(expr, table, store);
                store.write_big(out, &v);
                store.read_big(out)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn mem_write(
        &self,
        addr: &Expr,
        en: &Expr,
        data: &Expr,
        mode: EvalMode,
        table: &SymbolTable,
        store: &mut DataStore,
        verbose: bool,
    ) {
        let mem = &table[self.output];
        match mode {
            EvalMode::Fixed => {
                if expr::eval_i128(en, table, store) == 0 {
                    return;
                }
                let idx = expr::eval_i128(addr, table, store);
                if idx < 0 || idx as usize >= mem.slots {
                    return;
                }
                let value = expr::eval_i128(data, table, store);
                store.write_slot_i128(mem, idx as usize, value);
                if verbose {
                    trace!("{}[{}] <= {}", mem.name, idx, value);
                }
            }
            EvalMode::Big => {
                if expr::eval_big(en, table, store).is_zero() {
                    return;
                }
                let idx = expr::eval_big(addr, table, store);
                let Some(i) = idx.to_usize().filter(|i| *i < mem.slots) else {
                    return;
                };
                let value = expr::eval_big(data, table, store);
                store.write_slot_big(mem, i, &value);
                if verbose {
                    trace!("{}[{}] <= {}", mem.name, i, value);
                }
            }
        }
    }

    /// Human-readable form of the computation, with current operand values.
    pub fn render(&self, table: &SymbolTable, store: &DataStore) -> String {
        let name = &table[self.output].name;
        match &self.action {
            Action::Eval { expr, .. } | Action::BlackBoxInput { expr, .. } => {
                format!("{name} <= {}", expr::render(expr, table, store))
            }
            Action::Commit { from } => {
                format!("{name} <= {} (commit)", table[*from].name)
            }
            Action::MemWrite { addr, data, en, .. } => format!(
                "{name}[{}] <= {} when {}",
                expr::render(addr, table, store),
                expr::render(data, table, store),
                expr::render(en, table, store)
            ),
            Action::Stop { en, code } => {
                format!("stop({name}, code {code}) when {}", expr::render(en, table, store))
            }
            Action::Print { en, format, .. } => {
                format!("print({name}, {format:?}) when {}", expr::render(en, table, store))
            }
        }
    }
}

/// Render a print format string: `%d`, `%x`, `%b` consume `values` in
/// order, `%%` is a literal percent; unknown escapes pass through.
pub fn format_print(format: &str, values: &[BigInt]) -> String {
    let mut out = String::with_capacity(format.len());
    let mut next = 0usize;
    let mut chars = format.chars();
    while let Some(ch) = chars.next() {
        if ch != '%' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('d') => {
                out.push_str(&values.get(next).cloned().unwrap_or_default().to_string());
                next += 1;
            }
            Some('x') => {
                out.push_str(&format!("{:x}", values.get(next).cloned().unwrap_or_default()));
                next += 1;
            }
            Some('b') => {
                out.push_str(&format!("{:b}", values.get(next).cloned().unwrap_or_default()));
                next += 1;
            }
            Some('%') => out.push('%'),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}
