//! Shared test fixtures: small lowered circuits and black-box helpers.
//!
//! These builders de-duplicate circuit construction across the engine,
//! compiler, and scheduler test suites. They return complete `Circuit`
//! values the way a lowering front end would hand them over: hierarchy
//! not yet flattened, conditional blocks already expanded into muxes,
//! one connect per destination.
//!
//! They intentionally support just what the test suite needs (single
//! clock domain, one memory port pair, one extern module shape).

#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use num_bigint::BigInt;

use crate::blackbox::{BlackBox, BlackBoxFactory, BlackBoxRegistry, Transition};
use crate::engine::{Engine, EngineOptions};
use crate::ir::{Circuit, Direction, Expr, ExtModule, Module, Port, PrimOp, Stmt, Tpe};

fn port(name: &str, direction: Direction, tpe: Tpe) -> Port {
    Port {
        name: name.to_string(),
        direction,
        tpe,
    }
}

fn input(name: &str, tpe: Tpe) -> Port {
    port(name, Direction::Input, tpe)
}

fn output(name: &str, tpe: Tpe) -> Port {
    port(name, Direction::Output, tpe)
}

fn connect(dest: &str, src: Expr) -> Stmt {
    Stmt::Connect {
        dest: dest.to_string(),
        src,
    }
}

/// `tail(name + 1, 1)`: the next-state of a free-running counter.
fn increment(name: &str, width: u32) -> Expr {
    Expr::unop(
        PrimOp::Tail,
        Expr::binop(PrimOp::Add, Expr::reference(name), Expr::uint(1, width)),
        vec![1],
    )
}

/// Engine over `circuit` with default options.
pub fn engine(circuit: &Circuit) -> Engine {
    Engine::new(circuit, EngineOptions::default()).expect("test circuit compiles")
}

/// A `width`-bit register counter with synchronous reset to 0 and the
/// count exported on `io_count`.
pub fn counter_circuit(width: u32) -> Circuit {
    let top = Module {
        name: "Counter".to_string(),
        ports: vec![
            input("clock", Tpe::Clock),
            input("reset", Tpe::UInt(1)),
            output("io_count", Tpe::UInt(width)),
        ],
        stmts: vec![
            Stmt::Reg {
                name: "counter".to_string(),
                tpe: Tpe::UInt(width),
                clock: Expr::reference("clock"),
                reset: Some((Expr::reference("reset"), Expr::uint(0, width))),
            },
            connect("counter", increment("counter", width)),
            connect("io_count", Expr::reference("counter")),
        ],
    };
    Circuit {
        top: "Counter".to_string(),
        modules: vec![top],
        ext_modules: vec![],
    }
}

/// An 8-bit counter clocked by `as_clock(clock & io_enable)`: with the
/// enable low the internal register never sees an edge.
pub fn gated_clock_circuit() -> Circuit {
    let top = Module {
        name: "Gated".to_string(),
        ports: vec![
            input("clock", Tpe::Clock),
            input("io_enable", Tpe::UInt(1)),
            output("io_count", Tpe::UInt(8)),
        ],
        stmts: vec![
            Stmt::Node {
                name: "gate".to_string(),
                value: Expr::binop(
                    PrimOp::And,
                    Expr::reference("clock"),
                    Expr::reference("io_enable"),
                ),
            },
            Stmt::Node {
                name: "gclk".to_string(),
                value: Expr::unop(PrimOp::AsClock, Expr::reference("gate"), vec![]),
            },
            Stmt::Reg {
                name: "counter".to_string(),
                tpe: Tpe::UInt(8),
                clock: Expr::reference("gclk"),
                reset: None,
            },
            connect("counter", increment("counter", 8)),
            connect("io_count", Expr::reference("counter")),
        ],
    };
    Circuit {
        top: "Gated".to_string(),
        modules: vec![top],
        ext_modules: vec![],
    }
}

/// Signed 8-bit adder feeding a signed register exported on a 10-bit
/// output.
pub fn adder_circuit() -> Circuit {
    let top = Module {
        name: "Adder".to_string(),
        ports: vec![
            input("clock", Tpe::Clock),
            input("io_a", Tpe::SInt(8)),
            input("io_b", Tpe::SInt(8)),
            output("io_c", Tpe::SInt(10)),
        ],
        stmts: vec![
            Stmt::Node {
                name: "sum".to_string(),
                value: Expr::binop(PrimOp::Add, Expr::reference("io_a"), Expr::reference("io_b")),
            },
            Stmt::Reg {
                name: "acc".to_string(),
                tpe: Tpe::SInt(10),
                clock: Expr::reference("clock"),
                reset: None,
            },
            connect("acc", Expr::reference("sum")),
            connect("io_c", Expr::reference("acc")),
        ],
    };
    Circuit {
        top: "Adder".to_string(),
        modules: vec![top],
        ext_modules: vec![],
    }
}

/// Four levels of nesting passing a 16-bit address through unchanged.
pub fn nested_hierarchy_circuit() -> Circuit {
    fn wrapper(name: &str, child: &str) -> Module {
        Module {
            name: name.to_string(),
            ports: vec![input("in", Tpe::UInt(16)), output("out", Tpe::UInt(16))],
            stmts: vec![
                Stmt::Inst {
                    name: "inner".to_string(),
                    module: child.to_string(),
                },
                connect("inner.in", Expr::reference("in")),
                connect("out", Expr::reference("inner.out")),
            ],
        }
    }
    let leaf = Module {
        name: "Leaf".to_string(),
        ports: vec![input("in", Tpe::UInt(16)), output("out", Tpe::UInt(16))],
        stmts: vec![connect("out", Expr::reference("in"))],
    };
    let top = Module {
        name: "Top".to_string(),
        ports: vec![input("addr", Tpe::UInt(16)), output("data", Tpe::UInt(16))],
        stmts: vec![
            Stmt::Inst {
                name: "l1".to_string(),
                module: "L1".to_string(),
            },
            connect("l1.in", Expr::reference("addr")),
            connect("data", Expr::reference("l1.out")),
        ],
    };
    Circuit {
        top: "Top".to_string(),
        modules: vec![
            top,
            wrapper("L1", "L2"),
            wrapper("L2", "L3"),
            wrapper("L3", "Leaf"),
            leaf,
        ],
        ext_modules: vec![],
    }
}

// -------------- black-box AND fixture --------------

/// Shared notification counters, observable from tests while the engine
/// owns the box instance.
#[derive(Clone, Default)]
pub struct BlackBoxCounters {
    pub input_changes: Rc<std::cell::Cell<usize>>,
    pub clock_changes: Rc<std::cell::Cell<usize>>,
}

/// Black box computing `result = a & b`, counting its notifications.
pub struct BlackBoxAnd {
    name: String,
    counters: BlackBoxCounters,
}

impl BlackBox for BlackBoxAnd {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_changed(&mut self, _pin: &str, _value: &BigInt) {
        self.counters
            .input_changes
            .set(self.counters.input_changes.get() + 1);
    }

    fn clock_change(&mut self, _transition: Transition, _clock: &str) {
        self.counters
            .clock_changes
            .set(self.counters.clock_changes.get() + 1);
    }

    fn get_output(&mut self, inputs: &[BigInt], _tpe: &Tpe, _output: &str) -> BigInt {
        inputs.iter().fold(BigInt::from(-1), |acc, v| acc & v)
    }

    fn output_dependencies(&self, _output: &str) -> Vec<String> {
        vec!["a".to_string(), "b".to_string()]
    }

    fn get_dependencies(&self) -> Vec<(String, Vec<String>)> {
        vec![("result".to_string(), self.output_dependencies("result"))]
    }
}

pub struct AndFactory {
    counters: BlackBoxCounters,
}

impl BlackBoxFactory for AndFactory {
    fn create(&self, defname: &str, instance_name: &str) -> Option<Rc<RefCell<dyn BlackBox>>> {
        (defname == "BBAnd").then(|| {
            Rc::new(RefCell::new(BlackBoxAnd {
                name: instance_name.to_string(),
                counters: self.counters.clone(),
            })) as Rc<RefCell<dyn BlackBox>>
        })
    }
}

/// Registry with the AND factory installed.
pub fn and_registry() -> BlackBoxRegistry {
    counting_registry().0
}

/// Registry plus the counters its instances report into.
pub fn counting_registry() -> (BlackBoxRegistry, BlackBoxCounters) {
    let counters = BlackBoxCounters::default();
    let mut registry = BlackBoxRegistry::new();
    registry.add_factory(Rc::new(AndFactory {
        counters: counters.clone(),
    }));
    (registry, counters)
}

/// Two 1-bit inputs through an extern `BBAnd` instance to `io_result`.
pub fn blackbox_and_circuit() -> Circuit {
    let top = Module {
        name: "BBTop".to_string(),
        ports: vec![
            input("io_a", Tpe::UInt(1)),
            input("io_b", Tpe::UInt(1)),
            output("io_result", Tpe::UInt(1)),
        ],
        stmts: vec![
            Stmt::Inst {
                name: "bb".to_string(),
                module: "BBAndShell".to_string(),
            },
            connect("bb.a", Expr::reference("io_a")),
            connect("bb.b", Expr::reference("io_b")),
            connect("io_result", Expr::reference("bb.result")),
        ],
    };
    Circuit {
        top: "BBTop".to_string(),
        modules: vec![top],
        ext_modules: vec![ExtModule {
            name: "BBAndShell".to_string(),
            ports: vec![
                input("a", Tpe::UInt(1)),
                input("b", Tpe::UInt(1)),
                output("result", Tpe::UInt(1)),
            ],
            defname: "BBAnd".to_string(),
        }],
    }
}

/// A counter that stops with code 42 once the count reaches 5.
pub fn stop_circuit() -> Circuit {
    let top = Module {
        name: "Stopper".to_string(),
        ports: vec![input("clock", Tpe::Clock), output("io_count", Tpe::UInt(8))],
        stmts: vec![
            Stmt::Reg {
                name: "counter".to_string(),
                tpe: Tpe::UInt(8),
                clock: Expr::reference("clock"),
                reset: None,
            },
            connect("counter", increment("counter", 8)),
            connect("io_count", Expr::reference("counter")),
            Stmt::Stop {
                name: "stop_at_5".to_string(),
                clock: Expr::reference("clock"),
                enable: Expr::binop(PrimOp::Eq, Expr::reference("counter"), Expr::uint(5, 8)),
                code: 42,
            },
        ],
    };
    Circuit {
        top: "Stopper".to_string(),
        modules: vec![top],
        ext_modules: vec![],
    }
}

/// A memory with one always-enabled read port and one write port driven
/// from the top-level ports.
pub fn memory_circuit(depth: usize) -> Circuit {
    let top = Module {
        name: "MemTop".to_string(),
        ports: vec![
            input("clock", Tpe::Clock),
            input("io_waddr", Tpe::UInt(4)),
            input("io_wdata", Tpe::UInt(8)),
            input("io_wen", Tpe::UInt(1)),
            input("io_raddr", Tpe::UInt(4)),
            output("io_rdata", Tpe::UInt(8)),
        ],
        stmts: vec![
            Stmt::Mem {
                name: "m".to_string(),
                tpe: Tpe::UInt(8),
                depth,
                clock: Expr::reference("clock"),
                readers: vec!["r0".to_string()],
                writers: vec!["w0".to_string()],
            },
            connect("m.r0.addr", Expr::reference("io_raddr")),
            connect("m.r0.en", Expr::uint(1, 1)),
            connect("m.w0.addr", Expr::reference("io_waddr")),
            connect("m.w0.data", Expr::reference("io_wdata")),
            connect("m.w0.en", Expr::reference("io_wen")),
            connect("io_rdata", Expr::reference("m.r0.data")),
        ],
    };
    Circuit {
        top: "MemTop".to_string(),
        modules: vec![top],
        ext_modules: vec![],
    }
}
