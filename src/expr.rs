/*!
Compiled expression trees and their evaluators.

The compiler lowers every statement's IR expression into this form: operand
references become `SymbolId`s, every node carries its result width and
signedness, and black-box output reads hold the shared box instance
directly. Trees are immutable after compilation.

Two evaluators cover the same tree shape:
- `eval_i128`: fast path, usable when every node width fits 63 bits (then
  no intermediate exceeds an `i128`);
- `eval_big`: arbitrary precision, used otherwise and for black-box reads.

Both produce values in the canonical two's-complement range for the node's
width, so comparisons and arithmetic on mixed signedness work on the plain
machine representation.
*/

use std::cell::RefCell;
use std::rc::Rc;

use log::warn;
use num_bigint::BigInt;
use num_traits::{One, ToPrimitive, Zero};
use rand::RngCore;

use crate::blackbox::BlackBox;
use crate::data_store::{DataStore, mask_big, mask_i128, normalize_big, normalize_i128};
use crate::ir::{PrimOp, Tpe};
use crate::symbol::SymbolId;
use crate::symbol_table::SymbolTable;

/// Which evaluator an assigner uses, decided once at compile time.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EvalMode {
    /// All node widths fit 63 bits; evaluate in `i128`.
    Fixed,
    /// Some node is wider, or the tree reads a black box; evaluate in
    /// `BigInt`.
    Big,
}

/// A compiled expression over data-store slots.
#[derive(Clone)]
pub enum Expr {
    Const {
        value: BigInt,
        width: u32,
        signed: bool,
    },
    Ref(SymbolId),
    Prim {
        op: PrimOp,
        args: Vec<Expr>,
        consts: Vec<i64>,
        width: u32,
        signed: bool,
    },
    Mux {
        sel: Box<Expr>,
        tru: Box<Expr>,
        fal: Box<Expr>,
    },
    ValidIf {
        cond: Box<Expr>,
        value: Box<Expr>,
        /// When set, an invalid read yields a random in-range value instead
        /// of zero.
        random: bool,
    },
    /// Combinational memory read: `mem[addr]`, zero beyond the depth.
    MemRead {
        mem: SymbolId,
        addr: Box<Expr>,
        enable: Box<Expr>,
    },
    /// Black-box output pin read; `inputs` lists the pin symbols handed to
    /// the implementation, in its declared order.
    BlackBoxOutput {
        bbox: Rc<RefCell<dyn BlackBox>>,
        output: String,
        inputs: Vec<SymbolId>,
        tpe: Tpe,
    },
}

impl std::fmt::Debug for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Expr::Const { value, width, .. } => write!(f, "Const({value}, w{width})"),
            Expr::Ref(id) => write!(f, "Ref({})", id.0),
            Expr::Prim { op, args, consts, .. } => f
                .debug_struct("Prim")
                .field("op", op)
                .field("args", args)
                .field("consts", consts)
                .finish(),
            Expr::Mux { sel, tru, fal } => f
                .debug_struct("Mux")
                .field("sel", sel)
                .field("tru", tru)
                .field("fal", fal)
                .finish(),
            Expr::ValidIf { cond, value, random } => f
                .debug_struct("ValidIf")
                .field("cond", cond)
                .field("value", value)
                .field("random", random)
                .finish(),
            Expr::MemRead { mem, addr, .. } => f
                .debug_struct("MemRead")
                .field("mem", &mem.0)
                .field("addr", addr)
                .finish(),
            Expr::BlackBoxOutput { output, inputs, .. } => f
                .debug_struct("BlackBoxOutput")
                .field("output", output)
                .field("inputs", &inputs.iter().map(|i| i.0).collect::<Vec<_>>())
                .finish(),
        }
    }
}

impl Expr {
    /// Result width of this node.
    pub fn width(&self, table: &SymbolTable) -> u32 {
        match self {
            Expr::Const { width, .. } => *width,
            Expr::Ref(id) => table[*id].width,
            Expr::Prim { width, .. } => *width,
            Expr::Mux { tru, fal, .. } => tru.width(table).max(fal.width(table)),
            Expr::ValidIf { value, .. } => value.width(table),
            Expr::MemRead { mem, .. } => table[*mem].width,
            Expr::BlackBoxOutput { tpe, .. } => tpe.width(),
        }
    }

    /// Result signedness of this node.
    pub fn signed(&self, table: &SymbolTable) -> bool {
        match self {
            Expr::Const { signed, .. } => *signed,
            Expr::Ref(id) => table[*id].signed,
            Expr::Prim { signed, .. } => *signed,
            Expr::Mux { tru, .. } => tru.signed(table),
            Expr::ValidIf { value, .. } => value.signed(table),
            Expr::MemRead { mem, .. } => table[*mem].signed,
            Expr::BlackBoxOutput { tpe, .. } => tpe.is_signed(),
        }
    }

    /// Collect every symbol this expression reads: operand references,
    /// memory symbols and black-box input pins.
    pub fn references(&self, out: &mut Vec<SymbolId>) {
        match self {
            Expr::Const { .. } => {}
            Expr::Ref(id) => out.push(*id),
            Expr::Prim { args, .. } => {
                for a in args {
                    a.references(out);
                }
            }
            Expr::Mux { sel, tru, fal } => {
                sel.references(out);
                tru.references(out);
                fal.references(out);
            }
            Expr::ValidIf { cond, value, .. } => {
                cond.references(out);
                value.references(out);
            }
            Expr::MemRead { mem, addr, enable } => {
                out.push(*mem);
                addr.references(out);
                enable.references(out);
            }
            Expr::BlackBoxOutput { inputs, .. } => out.extend_from_slice(inputs),
        }
    }

    /// Pick the evaluator for a tree: fast unless some node is wider than
    /// 63 bits or the tree touches a black box.
    pub fn eval_mode(&self, table: &SymbolTable) -> EvalMode {
        fn narrow(e: &Expr, table: &SymbolTable) -> bool {
            if e.width(table) > 63 {
                return false;
            }
            match e {
                Expr::Const { .. } | Expr::Ref(_) => true,
                Expr::Prim { args, .. } => args.iter().all(|a| narrow(a, table)),
                Expr::Mux { sel, tru, fal } => {
                    narrow(sel, table) && narrow(tru, table) && narrow(fal, table)
                }
                Expr::ValidIf { cond, value, .. } => narrow(cond, table) && narrow(value, table),
                Expr::MemRead { mem, addr, enable } => {
                    table[*mem].width <= 63 && narrow(addr, table) && narrow(enable, table)
                }
                Expr::BlackBoxOutput { .. } => false,
            }
        }
        if narrow(self, table) {
            EvalMode::Fixed
        } else {
            EvalMode::Big
        }
    }
}

// -------------- fast-path evaluation --------------

/// Evaluate on the `i128` fast path. Caller guarantees
/// `eval_mode == Fixed`.
pub fn eval_i128(expr: &Expr, table: &SymbolTable, store: &DataStore) -> i128 {
    match expr {
        Expr::Const { value, .. } => value.to_i128().unwrap_or_default(),
        Expr::Ref(id) => store.read_i128(&table[*id]),
        Expr::Prim {
            op,
            args,
            consts,
            width,
            signed,
        } => {
            let a = eval_i128(&args[0], table, store);
            let b = args.get(1).map(|e| eval_i128(e, table, store));
            let aw = args[0].width(table);
            let raw = prim_i128(*op, a, b, aw, consts);
            normalize_i128(raw, *width, *signed)
        }
        Expr::Mux { sel, tru, fal } => {
            if eval_i128(sel, table, store) != 0 {
                eval_i128(tru, table, store)
            } else {
                eval_i128(fal, table, store)
            }
        }
        Expr::ValidIf { cond, value, random } => {
            if eval_i128(cond, table, store) != 0 {
                eval_i128(value, table, store)
            } else if *random {
                let w = value.width(table);
                let bits = rand::thread_rng().next_u64() as i128 & mask_i128(w);
                normalize_i128(bits, w, value.signed(table))
            } else {
                0
            }
        }
        Expr::MemRead { mem, addr, enable } => {
            if eval_i128(enable, table, store) == 0 {
                return 0;
            }
            let mem_sym = &table[*mem];
            let idx = eval_i128(addr, table, store);
            if idx < 0 || idx as usize >= mem_sym.slots {
                0
            } else {
                store.read_slot_i128(mem_sym, idx as usize)
            }
        }
        Expr::BlackBoxOutput { .. } => unreachable!("black-box reads use the big evaluator"),
    }
}

fn prim_i128(op: PrimOp, a: i128, b: Option<i128>, arg_width: u32, consts: &[i64]) -> i128 {
    let b = b.unwrap_or(0);
    let c0 = consts.first().copied().unwrap_or(0) as u32;
    let c1 = consts.get(1).copied().unwrap_or(0) as u32;
    let am = a & mask_i128(arg_width);
    match op {
        PrimOp::Add => a + b,
        PrimOp::Sub => a - b,
        PrimOp::Mul => a * b,
        PrimOp::Div => {
            if b == 0 {
                warn!("division by zero; result clamped to 0");
                0
            } else {
                a / b
            }
        }
        PrimOp::Rem => {
            if b == 0 {
                warn!("remainder by zero; result clamped to 0");
                0
            } else {
                a % b
            }
        }
        PrimOp::Lt => i128::from(a < b),
        PrimOp::Leq => i128::from(a <= b),
        PrimOp::Gt => i128::from(a > b),
        PrimOp::Geq => i128::from(a >= b),
        PrimOp::Eq => i128::from(a == b),
        PrimOp::Neq => i128::from(a != b),
        PrimOp::And => a & b,
        PrimOp::Or => a | b,
        PrimOp::Xor => a ^ b,
        PrimOp::Not => !a,
        PrimOp::Andr => i128::from(am == mask_i128(arg_width)),
        PrimOp::Orr => i128::from(am != 0),
        PrimOp::Xorr => i128::from(am.count_ones() & 1 == 1),
        PrimOp::Shl => a << c0.min(126),
        PrimOp::Shr => a >> c0.min(127),
        // Clamp dynamic amounts before narrowing so oversized shifts
        // drain the value instead of wrapping the shift count.
        PrimOp::Dshl => a << u32::try_from(b.clamp(0, 126)).unwrap_or(126),
        PrimOp::Dshr => a >> u32::try_from(b.clamp(0, 127)).unwrap_or(127),
        PrimOp::Cat => {
            // Second const slot carries the right operand's width.
            (am << c1) | (b & mask_i128(c1))
        }
        PrimOp::Bits => (a >> c1.min(127)) & mask_i128(c0 - c1 + 1),
        PrimOp::Head => (a >> (arg_width - c0)) & mask_i128(c0),
        PrimOp::Tail => am & mask_i128(arg_width - c0),
        // Width-only reinterprets; normalization at the call site applies
        // the new signedness to the same bits.
        PrimOp::Pad | PrimOp::AsUInt | PrimOp::AsSInt => a,
        PrimOp::AsClock => a & 1,
    }
}

// -------------- arbitrary-precision evaluation --------------

/// Evaluate with `BigInt` arithmetic; valid for any tree.
pub fn eval_big(expr: &Expr, table: &SymbolTable, store: &DataStore) -> BigInt {
    match expr {
        Expr::Const { value, .. } => value.clone(),
        Expr::Ref(id) => store.read_big(&table[*id]),
        Expr::Prim {
            op,
            args,
            consts,
            width,
            signed,
        } => {
            let a = eval_big(&args[0], table, store);
            let b = args.get(1).map(|e| eval_big(e, table, store));
            let aw = args[0].width(table);
            let raw = prim_big(*op, a, b, aw, consts);
            normalize_big(&raw, *width, *signed)
        }
        Expr::Mux { sel, tru, fal } => {
            if !eval_big(sel, table, store).is_zero() {
                eval_big(tru, table, store)
            } else {
                eval_big(fal, table, store)
            }
        }
        Expr::ValidIf { cond, value, random } => {
            if !eval_big(cond, table, store).is_zero() {
                eval_big(value, table, store)
            } else if *random {
                let w = value.width(table);
                normalize_big(&random_bits(w), w, value.signed(table))
            } else {
                BigInt::zero()
            }
        }
        Expr::MemRead { mem, addr, enable } => {
            if eval_big(enable, table, store).is_zero() {
                return BigInt::zero();
            }
            let mem_sym = &table[*mem];
            let idx = eval_big(addr, table, store);
            match idx.to_usize() {
                Some(i) if i < mem_sym.slots => store.read_slot_big(mem_sym, i),
                _ => BigInt::zero(),
            }
        }
        Expr::BlackBoxOutput {
            bbox,
            output,
            inputs,
            tpe,
        } => {
            let values: Vec<BigInt> = inputs.iter().map(|id| store.read_big(&table[*id])).collect();
            let raw = bbox.borrow_mut().get_output(&values, tpe, output);
            normalize_big(&raw, tpe.width(), tpe.is_signed())
        }
    }
}

fn prim_big(op: PrimOp, a: BigInt, b: Option<BigInt>, arg_width: u32, consts: &[i64]) -> BigInt {
    let b = b.unwrap_or_default();
    let c0 = consts.first().copied().unwrap_or(0) as u32;
    let c1 = consts.get(1).copied().unwrap_or(0) as u32;
    let am = &a & mask_big(arg_width);
    match op {
        PrimOp::Add => a + b,
        PrimOp::Sub => a - b,
        PrimOp::Mul => a * b,
        PrimOp::Div => {
            if b.is_zero() {
                warn!("division by zero; result clamped to 0");
                BigInt::zero()
            } else {
                a / b
            }
        }
        PrimOp::Rem => {
            if b.is_zero() {
                warn!("remainder by zero; result clamped to 0");
                BigInt::zero()
            } else {
                a % b
            }
        }
        PrimOp::Lt => BigInt::from(a < b),
        PrimOp::Leq => BigInt::from(a <= b),
        PrimOp::Gt => BigInt::from(a > b),
        PrimOp::Geq => BigInt::from(a >= b),
        PrimOp::Eq => BigInt::from(a == b),
        PrimOp::Neq => BigInt::from(a != b),
        PrimOp::And => a & b,
        PrimOp::Or => a | b,
        PrimOp::Xor => a ^ b,
        PrimOp::Not => !a,
        PrimOp::Andr => BigInt::from(am == mask_big(arg_width)),
        PrimOp::Orr => BigInt::from(!am.is_zero()),
        PrimOp::Xorr => {
            let ones = am.to_biguint().map_or(0, |u| u.count_ones());
            BigInt::from(ones & 1)
        }
        PrimOp::Shl => a << c0,
        PrimOp::Shr => a >> c0,
        PrimOp::Dshl => {
            let sh = b.to_u32().unwrap_or(u32::MAX).min(arg_width + (1 << 20));
            a << sh
        }
        PrimOp::Dshr => {
            let sh = b.to_u32().unwrap_or(u32::MAX).min(arg_width + 1);
            a >> sh
        }
        PrimOp::Cat => (am << c1) | (b & mask_big(c1)),
        PrimOp::Bits => (a >> c1) & mask_big(c0 - c1 + 1),
        PrimOp::Head => (a >> (arg_width - c0)) & mask_big(c0),
        PrimOp::Tail => am & mask_big(arg_width - c0),
        PrimOp::Pad | PrimOp::AsUInt | PrimOp::AsSInt => a,
        PrimOp::AsClock => a & BigInt::one(),
    }
}

/// Uniform random bit pattern of `width` bits.
fn random_bits(width: u32) -> BigInt {
    let mut rng = rand::thread_rng();
    let mut acc = BigInt::zero();
    let mut remaining = width;
    while remaining > 0 {
        let take = remaining.min(32);
        acc = (acc << take) | BigInt::from(rng.next_u32() >> (32 - take));
        remaining -= take;
    }
    acc
}

// -------------- rendering --------------

/// Render a compiled expression with the current operand values, for
/// `render_computation` debugging output.
pub fn render(expr: &Expr, table: &SymbolTable, store: &DataStore) -> String {
    match expr {
        Expr::Const { value, .. } => value.to_string(),
        Expr::Ref(id) => {
            let sym = &table[*id];
            format!("{}(={})", sym.name, store.read_big(sym))
        }
        Expr::Prim { op, args, consts, .. } => {
            let mut parts: Vec<String> =
                args.iter().map(|a| render(a, table, store)).collect();
            parts.extend(consts.iter().map(|c| c.to_string()));
            format!("{}({})", op_name(*op), parts.join(", "))
        }
        Expr::Mux { sel, tru, fal } => format!(
            "mux({}, {}, {})",
            render(sel, table, store),
            render(tru, table, store),
            render(fal, table, store)
        ),
        Expr::ValidIf { cond, value, .. } => format!(
            "valid_if({}, {})",
            render(cond, table, store),
            render(value, table, store)
        ),
        Expr::MemRead { mem, addr, enable } => format!(
            "{}[{}] when {}",
            table[*mem].name,
            render(addr, table, store),
            render(enable, table, store)
        ),
        Expr::BlackBoxOutput { bbox, output, .. } => {
            format!("blackbox {}.{}", bbox.borrow().name(), output)
        }
    }
}

fn op_name(op: PrimOp) -> &'static str {
    match op {
        PrimOp::Add => "add",
        PrimOp::Sub => "sub",
        PrimOp::Mul => "mul",
        PrimOp::Div => "div",
        PrimOp::Rem => "rem",
        PrimOp::Lt => "lt",
        PrimOp::Leq => "leq",
        PrimOp::Gt => "gt",
        PrimOp::Geq => "geq",
        PrimOp::Eq => "eq",
        PrimOp::Neq => "neq",
        PrimOp::And => "and",
        PrimOp::Or => "or",
        PrimOp::Xor => "xor",
        PrimOp::Not => "not",
        PrimOp::Andr => "andr",
        PrimOp::Orr => "orr",
        PrimOp::Xorr => "xorr",
        PrimOp::Shl => "shl",
        PrimOp::Shr => "shr",
        PrimOp::Dshl => "dshl",
        PrimOp::Dshr => "dshr",
        PrimOp::Cat => "cat",
        PrimOp::Bits => "bits",
        PrimOp::Head => "head",
        PrimOp::Tail => "tail",
        PrimOp::Pad => "pad",
        PrimOp::AsUInt => "as_uint",
        PrimOp::AsSInt => "as_sint",
        PrimOp::AsClock => "as_clock",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Tpe;
    use crate::symbol::Kind;

    fn fixture() -> (SymbolTable, DataStore) {
        let mut table = SymbolTable::new();
        table.add("a", Kind::Wire, Tpe::UInt(8), 1).unwrap();
        table.add("b", Kind::Wire, Tpe::SInt(8), 1).unwrap();
        table.add("wide", Kind::Wire, Tpe::UInt(80), 1).unwrap();
        let (ints, longs, bigs) = table.allocate_data();
        let store = DataStore::new(ints, longs, bigs, 1);
        (table, store)
    }

    fn uref(table: &SymbolTable, name: &str) -> Expr {
        Expr::Ref(table.id_of(name).unwrap())
    }

    fn prim(op: PrimOp, args: Vec<Expr>, consts: Vec<i64>, tpe: Tpe) -> Expr {
        Expr::Prim {
            op,
            args,
            consts,
            width: tpe.width(),
            signed: tpe.is_signed(),
        }
    }

    fn c(v: i64, w: u32) -> Expr {
        Expr::Const {
            value: BigInt::from(v),
            width: w,
            signed: false,
        }
    }

    #[test]
    fn add_and_normalize() {
        let (table, store) = fixture();
        let e = prim(PrimOp::Add, vec![c(200, 8), c(100, 8)], vec![], Tpe::UInt(9));
        assert_eq!(eval_i128(&e, &table, &store), 300);
        assert_eq!(eval_big(&e, &table, &store), BigInt::from(300));
    }

    #[test]
    fn signed_arithmetic_on_canonical_values() {
        let (table, mut store) = fixture();
        let b = table.get("b").unwrap().clone();
        store.write_i128(&b, -50);
        let e = prim(
            PrimOp::Mul,
            vec![Expr::Ref(b.id), c(3, 8)],
            vec![],
            Tpe::SInt(16),
        );
        assert_eq!(eval_i128(&e, &table, &store), -150);
    }

    #[test]
    fn division_by_zero_clamps_to_zero() {
        let (table, store) = fixture();
        let e = prim(PrimOp::Div, vec![c(42, 8), c(0, 8)], vec![], Tpe::UInt(8));
        assert_eq!(eval_i128(&e, &table, &store), 0);
        assert_eq!(eval_big(&e, &table, &store), BigInt::zero());
        let e = prim(PrimOp::Rem, vec![c(42, 8), c(0, 8)], vec![], Tpe::UInt(8));
        assert_eq!(eval_i128(&e, &table, &store), 0);
    }

    #[test]
    fn slicing_and_concatenation() {
        let (table, store) = fixture();
        // bits(0xAB, 7, 4) == 0xA
        let e = prim(PrimOp::Bits, vec![c(0xAB, 8)], vec![7, 4], Tpe::UInt(4));
        assert_eq!(eval_i128(&e, &table, &store), 0xA);
        // cat(0xA:4, 0xB:4) == 0xAB; consts[1] carries the rhs width
        let e = prim(
            PrimOp::Cat,
            vec![c(0xA, 4), c(0xB, 4)],
            vec![0, 4],
            Tpe::UInt(8),
        );
        assert_eq!(eval_i128(&e, &table, &store), 0xAB);
        assert_eq!(eval_big(&e, &table, &store), BigInt::from(0xAB));
        // head/tail of 0xAB over 8 bits
        let e = prim(PrimOp::Head, vec![c(0xAB, 8)], vec![4], Tpe::UInt(4));
        assert_eq!(eval_i128(&e, &table, &store), 0xA);
        let e = prim(PrimOp::Tail, vec![c(0xAB, 8)], vec![4], Tpe::UInt(4));
        assert_eq!(eval_i128(&e, &table, &store), 0xB);
    }

    #[test]
    fn negative_slice_matches_twos_complement() {
        let (table, store) = fixture();
        let minus_one = Expr::Const {
            value: BigInt::from(-1),
            width: 8,
            signed: true,
        };
        let e = prim(PrimOp::Bits, vec![minus_one], vec![3, 0], Tpe::UInt(4));
        assert_eq!(eval_i128(&e, &table, &store), 0xF);
    }

    #[test]
    fn reductions() {
        let (table, store) = fixture();
        let e = prim(PrimOp::Andr, vec![c(0xFF, 8)], vec![], Tpe::UInt(1));
        assert_eq!(eval_i128(&e, &table, &store), 1);
        let e = prim(PrimOp::Andr, vec![c(0xFE, 8)], vec![], Tpe::UInt(1));
        assert_eq!(eval_i128(&e, &table, &store), 0);
        let e = prim(PrimOp::Xorr, vec![c(0b1011, 4)], vec![], Tpe::UInt(1));
        assert_eq!(eval_i128(&e, &table, &store), 1);
        assert_eq!(eval_big(&e, &table, &store), BigInt::one());
    }

    #[test]
    fn dynamic_shifts_are_width_bounded() {
        let (table, store) = fixture();
        let e = prim(
            PrimOp::Dshr,
            vec![c(0x80, 8), c(200, 8)],
            vec![],
            Tpe::UInt(8),
        );
        assert_eq!(eval_i128(&e, &table, &store), 0);
        assert_eq!(eval_big(&e, &table, &store), BigInt::zero());
    }

    #[test]
    fn eval_mode_picks_big_for_wide_nodes() {
        let (table, _store) = fixture();
        let narrow = prim(PrimOp::Add, vec![c(1, 8), c(2, 8)], vec![], Tpe::UInt(9));
        assert_eq!(narrow.eval_mode(&table), EvalMode::Fixed);
        let wide = uref(&table, "wide");
        assert_eq!(wide.eval_mode(&table), EvalMode::Big);
    }

    #[test]
    fn valid_if_yields_zero_when_invalid() {
        let (table, store) = fixture();
        let e = Expr::ValidIf {
            cond: Box::new(c(0, 1)),
            value: Box::new(c(9, 8)),
            random: false,
        };
        assert_eq!(eval_i128(&e, &table, &store), 0);
    }

    #[test]
    fn mux_selects() {
        let (table, store) = fixture();
        let e = Expr::Mux {
            sel: Box::new(c(1, 1)),
            tru: Box::new(c(7, 8)),
            fal: Box::new(c(3, 8)),
        };
        assert_eq!(eval_i128(&e, &table, &store), 7);
        assert_eq!(eval_big(&e, &table, &store), BigInt::from(7));
    }
}
