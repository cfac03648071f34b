/*!
Lowered-circuit AST: the input surface of the interpreter core.

This is the already-lowered subset of the netlist language: modules contain
only ports, nodes, connects, registers, memories, instances, stops and
prints. Conditional blocks have been expanded into muxes and all aggregate
types have been split into ground types before a circuit reaches this
module, so every expression here is over 1-bit-or-wider integers and
clocks.

The types in this file are deliberately dumb data: name resolution,
flattening and width bookkeeping happen in the symbol table and compiler.
The one piece of behavior that lives here is type inference
(`Expr::infer_tpe`), because both passes need the same width rules.
*/

use num_bigint::BigInt;

use crate::error::SimError;

/// Ground type of a signal: unsigned or signed with an explicit bit width,
/// or a clock (1 bit, unsigned, drives triggered logic).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Tpe {
    UInt(u32),
    SInt(u32),
    Clock,
}

impl Tpe {
    /// Bit width of the carried value.
    #[inline]
    pub fn width(&self) -> u32 {
        match self {
            Tpe::UInt(w) | Tpe::SInt(w) => *w,
            Tpe::Clock => 1,
        }
    }

    /// Whether reads of this type sign-extend.
    #[inline]
    pub fn is_signed(&self) -> bool {
        matches!(self, Tpe::SInt(_))
    }

    #[inline]
    pub fn is_clock(&self) -> bool {
        matches!(self, Tpe::Clock)
    }
}

/// Port direction as seen from inside the module.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

/// A module port.
#[derive(Clone, Debug)]
pub struct Port {
    pub name: String,
    pub direction: Direction,
    pub tpe: Tpe,
}

/// Primitive operations of the lowered expression language.
///
/// Shifts by a constant use the `consts` slot of [`Expr::Prim`]; `Dshl` and
/// `Dshr` shift by a dynamic, width-bounded second operand. `Bits`, `Head`,
/// `Tail` and `Pad` also take their parameters through `consts`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PrimOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Lt,
    Leq,
    Gt,
    Geq,
    Eq,
    Neq,
    And,
    Or,
    Xor,
    Not,
    Andr,
    Orr,
    Xorr,
    Shl,
    Shr,
    Dshl,
    Dshr,
    Cat,
    Bits,
    Head,
    Tail,
    Pad,
    AsUInt,
    AsSInt,
    AsClock,
}

/// An expression over locally-named signals.
#[derive(Clone, Debug)]
pub enum Expr {
    /// Reference to a port, node, wire, register or memory port pin by its
    /// module-local (dotted) name.
    Ref(String),
    UIntLit { value: BigInt, width: u32 },
    SIntLit { value: BigInt, width: u32 },
    Mux { sel: Box<Expr>, tru: Box<Expr>, fal: Box<Expr> },
    /// Validity-gated read: yields `value` when `cond` is non-zero,
    /// otherwise zero (or a random in-range value, see engine options).
    ValidIf { cond: Box<Expr>, value: Box<Expr> },
    Prim { op: PrimOp, args: Vec<Expr>, consts: Vec<i64> },
}

impl Expr {
    /// Convenience constructor for a reference.
    pub fn reference(name: impl Into<String>) -> Expr {
        Expr::Ref(name.into())
    }

    /// Convenience constructor for an unsigned literal.
    pub fn uint(value: impl Into<BigInt>, width: u32) -> Expr {
        Expr::UIntLit {
            value: value.into(),
            width,
        }
    }

    /// Convenience constructor for a signed literal.
    pub fn sint(value: impl Into<BigInt>, width: u32) -> Expr {
        Expr::SIntLit {
            value: value.into(),
            width,
        }
    }

    /// Convenience constructor for a binary primitive.
    pub fn binop(op: PrimOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Prim {
            op,
            args: vec![lhs, rhs],
            consts: vec![],
        }
    }

    /// Convenience constructor for a unary primitive with const parameters.
    pub fn unop(op: PrimOp, arg: Expr, consts: Vec<i64>) -> Expr {
        Expr::Prim {
            op,
            args: vec![arg],
            consts,
        }
    }

    /// Infer the result type of this expression.
    ///
    /// `lookup` resolves a local reference name to its type; it is supplied
    /// by the caller because the same rules run during the symbol-table walk
    /// (against the partially-built table) and during compilation.
    pub fn infer_tpe(
        &self,
        lookup: &dyn Fn(&str) -> Option<Tpe>,
    ) -> Result<Tpe, SimError> {
        match self {
            Expr::Ref(name) => lookup(name).ok_or_else(|| SimError::UnresolvedReference {
                name: name.clone(),
            }),
            Expr::UIntLit { width, .. } => Ok(Tpe::UInt(*width)),
            Expr::SIntLit { width, .. } => Ok(Tpe::SInt(*width)),
            Expr::Mux { tru, fal, .. } => {
                let t = tru.infer_tpe(lookup)?;
                let f = fal.infer_tpe(lookup)?;
                let w = t.width().max(f.width());
                Ok(if t.is_signed() { Tpe::SInt(w) } else { Tpe::UInt(w) })
            }
            Expr::ValidIf { value, .. } => value.infer_tpe(lookup),
            Expr::Prim { op, args, consts } => {
                let arg_tpes = args
                    .iter()
                    .map(|a| a.infer_tpe(lookup))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(prim_result_tpe(*op, &arg_tpes, consts))
            }
        }
    }

    /// Collect every reference name in this expression, in evaluation order.
    pub fn collect_refs<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Ref(name) => out.push(name),
            Expr::UIntLit { .. } | Expr::SIntLit { .. } => {}
            Expr::Mux { sel, tru, fal } => {
                sel.collect_refs(out);
                tru.collect_refs(out);
                fal.collect_refs(out);
            }
            Expr::ValidIf { cond, value } => {
                cond.collect_refs(out);
                value.collect_refs(out);
            }
            Expr::Prim { args, .. } => {
                for a in args {
                    a.collect_refs(out);
                }
            }
        }
    }
}

/// Width/signedness rules for each primitive.
fn prim_result_tpe(op: PrimOp, args: &[Tpe], consts: &[i64]) -> Tpe {
    let w1 = args.first().map_or(0, Tpe::width);
    let w2 = args.get(1).map_or(0, Tpe::width);
    let signed = args.first().is_some_and(Tpe::is_signed);
    match op {
        PrimOp::Add | PrimOp::Sub => signed_or_not(signed, w1.max(w2) + 1),
        PrimOp::Mul => signed_or_not(signed, w1 + w2),
        PrimOp::Div => signed_or_not(signed, if signed { w1 + 1 } else { w1 }),
        PrimOp::Rem => signed_or_not(signed, w1.min(w2)),
        PrimOp::Lt
        | PrimOp::Leq
        | PrimOp::Gt
        | PrimOp::Geq
        | PrimOp::Eq
        | PrimOp::Neq => Tpe::UInt(1),
        // Bitwise ops always produce an unsigned result over the wider operand.
        PrimOp::And | PrimOp::Or | PrimOp::Xor => Tpe::UInt(w1.max(w2)),
        PrimOp::Not => Tpe::UInt(w1),
        PrimOp::Andr | PrimOp::Orr | PrimOp::Xorr => Tpe::UInt(1),
        PrimOp::Shl => signed_or_not(signed, w1 + consts.first().copied().unwrap_or(0) as u32),
        PrimOp::Shr => {
            let n = consts.first().copied().unwrap_or(0) as u32;
            signed_or_not(signed, w1.saturating_sub(n).max(1))
        }
        PrimOp::Dshl => signed_or_not(signed, w1 + (1u32 << w2.min(20)) - 1),
        PrimOp::Dshr => signed_or_not(signed, w1),
        PrimOp::Cat => Tpe::UInt(w1 + w2),
        PrimOp::Bits => {
            let hi = consts.first().copied().unwrap_or(0) as u32;
            let lo = consts.get(1).copied().unwrap_or(0) as u32;
            Tpe::UInt(hi - lo + 1)
        }
        PrimOp::Head => Tpe::UInt(consts.first().copied().unwrap_or(0) as u32),
        PrimOp::Tail => Tpe::UInt(w1.saturating_sub(consts.first().copied().unwrap_or(0) as u32)),
        PrimOp::Pad => signed_or_not(signed, w1.max(consts.first().copied().unwrap_or(0) as u32)),
        PrimOp::AsUInt => Tpe::UInt(w1),
        PrimOp::AsSInt => Tpe::SInt(w1),
        PrimOp::AsClock => Tpe::Clock,
    }
}

#[inline]
fn signed_or_not(signed: bool, width: u32) -> Tpe {
    if signed { Tpe::SInt(width) } else { Tpe::UInt(width) }
}

/// A single lowered statement.
#[derive(Clone, Debug)]
pub enum Stmt {
    /// `dest <= src`. `dest` is a module-local name (possibly dotted, for
    /// instance ports and memory port pins).
    Connect { dest: String, src: Expr },
    /// `node name = expr`.
    Node { name: String, value: Expr },
    /// Register declaration. The next-state connect arrives as a separate
    /// `Connect` targeting the register's name. `reset` pairs the reset
    /// condition with the initialization value.
    Reg {
        name: String,
        tpe: Tpe,
        clock: Expr,
        reset: Option<(Expr, Expr)>,
    },
    /// Memory declaration with named read and write ports. Port pins are
    /// addressed as `<mem>.<port>.addr`, `.en`, `.data` (and `.clk` for
    /// write ports, driven by `clock`).
    Mem {
        name: String,
        tpe: Tpe,
        depth: usize,
        clock: Expr,
        readers: Vec<String>,
        writers: Vec<String>,
    },
    /// Module instantiation.
    Inst { name: String, module: String },
    /// `stop(clock, enable, code)`: latch `code` when `enable` is non-zero
    /// on the positive clock edge.
    Stop {
        name: String,
        clock: Expr,
        enable: Expr,
        code: i64,
    },
    /// `printf(clock, enable, format, args...)`: emit a formatted line on
    /// the positive clock edge while `enable` is non-zero. Placeholders
    /// `%d`, `%x` and `%b` consume arguments in order; `%%` is a literal.
    Print {
        name: String,
        clock: Expr,
        enable: Expr,
        format: String,
        args: Vec<Expr>,
    },
}

/// A regular module body.
#[derive(Clone, Debug)]
pub struct Module {
    pub name: String,
    pub ports: Vec<Port>,
    pub stmts: Vec<Stmt>,
}

/// An externally-implemented module; its behavior comes from the black-box
/// registry, keyed by `defname`.
#[derive(Clone, Debug)]
pub struct ExtModule {
    pub name: String,
    pub ports: Vec<Port>,
    pub defname: String,
}

/// A complete lowered circuit. `top` names the main module.
#[derive(Clone, Debug)]
pub struct Circuit {
    pub top: String,
    pub modules: Vec<Module>,
    pub ext_modules: Vec<ExtModule>,
}

impl Circuit {
    /// Look up a regular module by name.
    pub fn module(&self, name: &str) -> Option<&Module> {
        self.modules.iter().find(|m| m.name == name)
    }

    /// Look up an extern module by name.
    pub fn ext_module(&self, name: &str) -> Option<&ExtModule> {
        self.ext_modules.iter().find(|m| m.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_refs(_: &str) -> Option<Tpe> {
        None
    }

    #[test]
    fn literal_types() {
        let e = Expr::uint(5, 8);
        assert_eq!(e.infer_tpe(&no_refs).unwrap(), Tpe::UInt(8));
        let e = Expr::sint(-5, 8);
        assert_eq!(e.infer_tpe(&no_refs).unwrap(), Tpe::SInt(8));
    }

    #[test]
    fn add_grows_by_one_bit() {
        let e = Expr::binop(PrimOp::Add, Expr::uint(3, 4), Expr::uint(3, 7));
        assert_eq!(e.infer_tpe(&no_refs).unwrap(), Tpe::UInt(8));
    }

    #[test]
    fn mul_sums_widths() {
        let e = Expr::binop(PrimOp::Mul, Expr::sint(-3, 4), Expr::sint(3, 7));
        assert_eq!(e.infer_tpe(&no_refs).unwrap(), Tpe::SInt(11));
    }

    #[test]
    fn bits_is_unsigned_slice() {
        let e = Expr::unop(PrimOp::Bits, Expr::sint(-1, 16), vec![11, 4]);
        assert_eq!(e.infer_tpe(&no_refs).unwrap(), Tpe::UInt(8));
    }

    #[test]
    fn cat_concatenates_widths() {
        let e = Expr::binop(PrimOp::Cat, Expr::uint(1, 3), Expr::uint(1, 5));
        assert_eq!(e.infer_tpe(&no_refs).unwrap(), Tpe::UInt(8));
    }

    #[test]
    fn unresolved_reference_is_fatal() {
        let e = Expr::reference("nope");
        assert!(matches!(
            e.infer_tpe(&no_refs),
            Err(SimError::UnresolvedReference { .. })
        ));
    }

    #[test]
    fn comparison_is_one_bit() {
        let e = Expr::binop(PrimOp::Lt, Expr::sint(-3, 9), Expr::sint(3, 4));
        assert_eq!(e.infer_tpe(&no_refs).unwrap(), Tpe::UInt(1));
    }
}
