/*!
ExpressionCompiler: lowers each statement into assigners.

Second walk over the circuit (the first built the symbol table). For every
statement it emits one or more assigners, registers the dependency edges
they imply, and files them with the scheduler:

- `node` / `connect`: one combinational eval assigner. A connect whose
  destination is a register targets the register's `/prev` shadow instead,
  with the declared reset folded in as `mux(reset, init, next)`.
- `reg`: a commit assigner (`/prev` -> canonical) in the clock's bucket.
- `mem`: a combinational read assigner per read port and a triggered,
  enable-gated write assigner per write port.
- `stop` / `printf`: triggered latch/print actions in the clock's bucket.
- extern instances: one eval assigner per output pin that pulls from the
  black box, with edges from the pins named by `output_dependencies`;
  input-pin connects notify the box, clock pins subscribe it to clock
  transitions.

Clock expressions must be plain references in the lowered form; the
compiler makes sure every symbol used as a clock has a `/prev` shadow for
edge detection.
*/

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use log::debug;
use num_bigint::BigInt;
use num_traits::One;

use crate::assigner::{Action, Assigner};
use crate::blackbox::BlackBox;
use crate::error::SimError;
use crate::expr::Expr as CExpr;
use crate::ir::{Circuit, Direction, Expr, Module, PrimOp, Stmt};
use crate::scheduler::Scheduler;
use crate::symbol::{Kind, SymbolId, prefixed};
use crate::symbol_table::{BlackBoxInstance, SymbolTable};

/// Per-register metadata gathered at its declaration.
struct RegMeta {
    prev: SymbolId,
    /// Lowered `(reset condition, init value)`, if declared.
    reset: Option<(CExpr, CExpr)>,
}

/// A black-box input pin, looked up by flattened name when connects land
/// on it.
struct PinMeta {
    bbox: Rc<RefCell<dyn BlackBox>>,
    /// Port-local pin name handed to `input_changed`.
    local: String,
    is_clock: bool,
}

/// Compiles the circuit's statements into a populated scheduler.
pub struct ExpressionCompiler<'a> {
    circuit: &'a Circuit,
    table: &'a mut SymbolTable,
    random_invalid: bool,
    scheduler: Scheduler,
    regs: HashMap<SymbolId, RegMeta>,
    /// Registers that received a next-state connect.
    connected_regs: HashSet<SymbolId>,
    pins: HashMap<String, PinMeta>,
}

impl<'a> ExpressionCompiler<'a> {
    /// Run the compilation walk and hand back the finished scheduler.
    pub fn compile(
        circuit: &'a Circuit,
        table: &'a mut SymbolTable,
        instances: &[BlackBoxInstance],
        random_invalid: bool,
        allow_cycles: bool,
    ) -> Result<Scheduler, SimError> {
        let mut pins = HashMap::new();
        for inst in instances {
            for port in &inst.ports {
                if port.direction == Direction::Input {
                    pins.insert(
                        format!("{}.{}", inst.path, port.name),
                        PinMeta {
                            bbox: Rc::clone(&inst.bbox),
                            local: port.name.clone(),
                            is_clock: port.tpe.is_clock(),
                        },
                    );
                }
            }
        }

        let mut compiler = ExpressionCompiler {
            circuit,
            table,
            random_invalid,
            scheduler: Scheduler::new(),
            regs: HashMap::new(),
            connected_regs: HashSet::new(),
            pins,
        };

        let top = circuit
            .module(&circuit.top)
            .ok_or_else(|| SimError::UnresolvedReference {
                name: circuit.top.clone(),
            })?;
        compiler.compile_module(top, "")?;
        compiler.compile_blackbox_outputs(instances)?;
        compiler.default_unconnected_registers()?;

        let mut scheduler = compiler.scheduler;
        scheduler.finish(compiler.table, allow_cycles)?;
        debug!("compiled {} symbols", compiler.table.len());
        Ok(scheduler)
    }

    fn compile_module(&mut self, module: &Module, prefix: &str) -> Result<(), SimError> {
        // Declarations first: register/memory metadata must exist before
        // the connects that drive them are compiled.
        for stmt in &module.stmts {
            match stmt {
                Stmt::Reg {
                    name,
                    clock,
                    reset,
                    ..
                } => self.declare_reg(prefix, name, clock, reset.as_ref())?,
                Stmt::Mem {
                    name,
                    clock,
                    readers,
                    writers,
                    ..
                } => self.declare_mem(prefix, name, clock, readers, writers)?,
                _ => {}
            }
        }

        for stmt in &module.stmts {
            match stmt {
                Stmt::Node { name, value } => {
                    let out = self.resolve(prefix, name)?;
                    self.emit_eval(out, prefix, value)?;
                }
                Stmt::Connect { dest, src } => self.compile_connect(prefix, dest, src)?,
                Stmt::Stop {
                    name,
                    clock,
                    enable,
                    code,
                } => {
                    let out = self.resolve(prefix, name)?;
                    let clock_id = self.clock_symbol(prefix, clock, name)?;
                    let en = self.lower(prefix, enable)?;
                    self.add_edges(out, &en);
                    self.scheduler
                        .add_triggered(clock_id, Assigner {
                            output: out,
                            action: Action::Stop { en, code: *code },
                        })?;
                }
                Stmt::Print {
                    name,
                    clock,
                    enable,
                    format,
                    args,
                } => {
                    let out = self.resolve(prefix, name)?;
                    let clock_id = self.clock_symbol(prefix, clock, name)?;
                    let en = self.lower(prefix, enable)?;
                    let args = args
                        .iter()
                        .map(|a| self.lower(prefix, a))
                        .collect::<Result<Vec<_>, _>>()?;
                    self.add_edges(out, &en);
                    for a in &args {
                        self.add_edges(out, a);
                    }
                    self.scheduler.add_triggered(clock_id, Assigner {
                        output: out,
                        action: Action::Print {
                            en,
                            format: format.clone(),
                            args,
                        },
                    })?;
                }
                Stmt::Inst { name, module: child } => {
                    if let Some(m) = self.circuit.module(child) {
                        let child_prefix = format!("{}.", prefixed(prefix, name));
                        self.compile_module(m, &child_prefix)?;
                    }
                    // Extern instances are compiled from the instance list.
                }
                Stmt::Reg { .. } | Stmt::Mem { .. } => {}
            }
        }
        Ok(())
    }

    // -------------- declarations --------------

    fn declare_reg(
        &mut self,
        prefix: &str,
        name: &str,
        clock: &Expr,
        reset: Option<&(Expr, Expr)>,
    ) -> Result<(), SimError> {
        let reg = self.resolve(prefix, name)?;
        let prev = self.table[reg].shadow.expect("register has a /prev shadow");
        let clock_id = self.clock_symbol(prefix, clock, name)?;

        let reset = match reset {
            Some((cond, init)) => Some((self.lower(prefix, cond)?, self.lower(prefix, init)?)),
            None => None,
        };
        self.regs.insert(reg, RegMeta { prev, reset });

        // Commit: copy the staged next-state into the canonical slot on the
        // positive edge. This is the one edge excluded from the
        // combinational subgraph.
        self.table.add_dependency(reg, prev);
        self.scheduler.add_triggered(clock_id, Assigner {
            output: reg,
            action: Action::Commit { from: prev },
        })
    }

    fn declare_mem(
        &mut self,
        prefix: &str,
        name: &str,
        clock: &Expr,
        readers: &[String],
        writers: &[String],
    ) -> Result<(), SimError> {
        let mem = self.resolve(prefix, name)?;
        let clock_id = self.clock_symbol(prefix, clock, name)?;
        let full = self.table[mem].name.clone();

        for reader in readers {
            let addr = self.resolve_full(&format!("{full}.{reader}.addr"))?;
            let en = self.resolve_full(&format!("{full}.{reader}.en"))?;
            let data = self.resolve_full(&format!("{full}.{reader}.data"))?;
            let expr = CExpr::MemRead {
                mem,
                addr: Box::new(CExpr::Ref(addr)),
                enable: Box::new(CExpr::Ref(en)),
            };
            for parent in [mem, addr, en] {
                self.table.add_dependency(data, parent);
            }
            let mode = expr.eval_mode(self.table);
            self.scheduler.add_combinational(Assigner {
                output: data,
                action: Action::Eval { expr, mode },
            })?;
        }

        for writer in writers {
            let addr = self.resolve_full(&format!("{full}.{writer}.addr"))?;
            let en = self.resolve_full(&format!("{full}.{writer}.en"))?;
            let data = self.resolve_full(&format!("{full}.{writer}.data"))?;
            for parent in [addr, en, data] {
                self.table.add_dependency(mem, parent);
            }
            let mode = CExpr::Ref(data).eval_mode(self.table);
            self.scheduler.add_triggered(clock_id, Assigner {
                output: mem,
                action: Action::MemWrite {
                    addr: CExpr::Ref(addr),
                    en: CExpr::Ref(en),
                    data: CExpr::Ref(data),
                    mode,
                },
            })?;
        }
        Ok(())
    }

    // -------------- connects --------------

    fn compile_connect(&mut self, prefix: &str, dest: &str, src: &Expr) -> Result<(), SimError> {
        let full = prefixed(prefix, dest);
        let dest_id = self.resolve_full(&full)?;

        match self.table[dest_id].kind {
            Kind::Register => {
                // The next-state lands in the /prev shadow; reset wraps it.
                let meta = &self.regs[&dest_id];
                let prev = meta.prev;
                let next = self.lower(prefix, src)?;
                let expr = match &meta.reset {
                    Some((cond, init)) => CExpr::Mux {
                        sel: Box::new(cond.clone()),
                        tru: Box::new(init.clone()),
                        fal: Box::new(next),
                    },
                    None => next,
                };
                self.connected_regs.insert(dest_id);
                self.emit_lowered(prev, expr)
            }
            _ => {
                if let Some(pin) = self.pins.get(&full) {
                    let bbox = Rc::clone(&pin.bbox);
                    let local = pin.local.clone();
                    if pin.is_clock {
                        // Clock pins subscribe the box to source transitions.
                        if let Expr::Ref(src_name) = src {
                            let src_id = self.resolve(prefix, src_name)?;
                            self.table.ensure_clock_prev(src_id)?;
                            self.scheduler.add_clock_listener(src_id, Rc::clone(&bbox));
                        } else {
                            return Err(SimError::UnsupportedClock { name: full });
                        }
                    }
                    let expr = self.lower(prefix, src)?;
                    self.add_edges(dest_id, &expr);
                    let mode = crate::expr::EvalMode::Big;
                    return self.scheduler.add_combinational(Assigner {
                        output: dest_id,
                        action: Action::BlackBoxInput {
                            expr,
                            mode,
                            bbox,
                            pin: local,
                        },
                    });
                }
                let expr = self.lower(prefix, src)?;
                self.emit_lowered(dest_id, expr)
            }
        }
    }

    // -------------- black boxes --------------

    fn compile_blackbox_outputs(&mut self, instances: &[BlackBoxInstance]) -> Result<(), SimError> {
        for inst in instances {
            for port in &inst.ports {
                if port.direction != Direction::Output {
                    continue;
                }
                let out = self.resolve_full(&format!("{}.{}", inst.path, port.name))?;
                let dep_names = inst.bbox.borrow().output_dependencies(&port.name);
                let mut inputs = Vec::with_capacity(dep_names.len());
                for dep in &dep_names {
                    let pin = self.resolve_full(&format!("{}.{}", inst.path, dep))?;
                    self.table.add_dependency(out, pin);
                    inputs.push(pin);
                }
                let expr = CExpr::BlackBoxOutput {
                    bbox: Rc::clone(&inst.bbox),
                    output: port.name.clone(),
                    inputs,
                    tpe: port.tpe,
                };
                self.scheduler.add_combinational(Assigner {
                    output: out,
                    action: Action::Eval {
                        expr,
                        mode: crate::expr::EvalMode::Big,
                    },
                })?;
            }
        }
        Ok(())
    }

    // -------------- defaults --------------

    /// A register with no next-state connect holds its value: stage the
    /// canonical slot back into `/prev` (through the reset mux, if any).
    fn default_unconnected_registers(&mut self) -> Result<(), SimError> {
        let pending: Vec<SymbolId> = self
            .regs
            .keys()
            .copied()
            .filter(|id| !self.connected_regs.contains(id))
            .collect();
        for reg in pending {
            let meta = &self.regs[&reg];
            let prev = meta.prev;
            let hold = CExpr::Ref(reg);
            let expr = match &meta.reset {
                Some((cond, init)) => CExpr::Mux {
                    sel: Box::new(cond.clone()),
                    tru: Box::new(init.clone()),
                    fal: Box::new(hold),
                },
                None => hold,
            };
            self.emit_lowered(prev, expr)?;
        }
        Ok(())
    }

    // -------------- helpers --------------

    fn resolve(&self, prefix: &str, local: &str) -> Result<SymbolId, SimError> {
        self.resolve_full(&prefixed(prefix, local))
    }

    fn resolve_full(&self, name: &str) -> Result<SymbolId, SimError> {
        self.table
            .id_of(name)
            .ok_or_else(|| SimError::UnresolvedReference {
                name: name.to_string(),
            })
    }

    /// Resolve a clock expression; the lowered form only allows a plain
    /// reference here. Guarantees the symbol has a `/prev` shadow.
    fn clock_symbol(&mut self, prefix: &str, clock: &Expr, user: &str) -> Result<SymbolId, SimError> {
        let Expr::Ref(name) = clock else {
            return Err(SimError::UnsupportedClock {
                name: prefixed(prefix, user),
            });
        };
        let id = self.resolve(prefix, name)?;
        self.table.ensure_clock_prev(id)?;
        Ok(id)
    }

    fn emit_eval(&mut self, output: SymbolId, prefix: &str, value: &Expr) -> Result<(), SimError> {
        let expr = self.lower(prefix, value)?;
        self.emit_lowered(output, expr)
    }

    fn emit_lowered(&mut self, output: SymbolId, expr: CExpr) -> Result<(), SimError> {
        self.add_edges(output, &expr);
        let mode = expr.eval_mode(self.table);
        self.scheduler.add_combinational(Assigner {
            output,
            action: Action::Eval { expr, mode },
        })
    }

    fn add_edges(&mut self, output: SymbolId, expr: &CExpr) {
        let mut reads = Vec::new();
        expr.references(&mut reads);
        for parent in reads {
            self.table.add_dependency(output, parent);
        }
    }

    /// Lower an IR expression into the compiled form, resolving references
    /// against the flattened table and checking literal widths.
    fn lower(&self, prefix: &str, expr: &Expr) -> Result<CExpr, SimError> {
        match expr {
            Expr::Ref(name) => Ok(CExpr::Ref(self.resolve(prefix, name)?)),
            Expr::UIntLit { value, width } => {
                check_literal(value, *width, false)?;
                Ok(CExpr::Const {
                    value: value.clone(),
                    width: *width,
                    signed: false,
                })
            }
            Expr::SIntLit { value, width } => {
                check_literal(value, *width, true)?;
                Ok(CExpr::Const {
                    value: value.clone(),
                    width: *width,
                    signed: true,
                })
            }
            Expr::Mux { sel, tru, fal } => Ok(CExpr::Mux {
                sel: Box::new(self.lower(prefix, sel)?),
                tru: Box::new(self.lower(prefix, tru)?),
                fal: Box::new(self.lower(prefix, fal)?),
            }),
            Expr::ValidIf { cond, value } => Ok(CExpr::ValidIf {
                cond: Box::new(self.lower(prefix, cond)?),
                value: Box::new(self.lower(prefix, value)?),
                random: self.random_invalid,
            }),
            Expr::Prim { op, args, consts } => {
                let tpe = self.table.infer_in_scope(prefix, expr)?;
                let lowered = args
                    .iter()
                    .map(|a| self.lower(prefix, a))
                    .collect::<Result<Vec<_>, _>>()?;
                let mut consts = consts.clone();
                if *op == PrimOp::Cat {
                    // The evaluator needs the right operand's width to
                    // place the left bits.
                    let rhs_tpe = self.table.infer_in_scope(prefix, &args[1])?;
                    consts = vec![0, i64::from(rhs_tpe.width())];
                }
                Ok(CExpr::Prim {
                    op: *op,
                    args: lowered,
                    consts,
                    width: tpe.width(),
                    signed: tpe.is_signed(),
                })
            }
        }
    }
}

/// Width check for literals; a value that does not fit its declared width
/// is compile-time fatal.
fn check_literal(value: &BigInt, width: u32, signed: bool) -> Result<(), SimError> {
    let fits = if signed {
        let bound = BigInt::one() << (width.max(1) - 1);
        value < &bound && value >= &(-&bound)
    } else {
        value.sign() != num_bigint::Sign::Minus && value.bits() <= u64::from(width)
    };
    if fits {
        Ok(())
    } else {
        Err(SimError::LiteralTooWide {
            value: value.to_string(),
            width,
        })
    }
}
