use num_bigint::BigInt;
use pretty_assertions::assert_eq;

use crate::engine::{Engine, EngineOptions};
use crate::error::SimError;
use crate::ir::{Circuit, Direction, Expr, Module, Port, PrimOp, Stmt, Tpe};
use crate::test_utils::{
    adder_circuit, and_registry, blackbox_and_circuit, counter_circuit, counting_registry, engine,
    gated_clock_circuit, memory_circuit, nested_hierarchy_circuit, stop_circuit,
};

fn big(v: i64) -> BigInt {
    BigInt::from(v)
}

// -------------- end-to-end scenarios --------------

#[test]
fn register_counter_counts_and_resets() {
    let circuit = counter_circuit(32);
    let mut e = engine(&circuit);

    e.set_value("reset", 0u8).unwrap();
    for expected in 1..=5 {
        e.cycle(false).unwrap();
        assert_eq!(e.get_value("counter").unwrap(), big(expected));
        assert_eq!(e.get_value("io_count").unwrap(), big(expected));
    }

    e.set_value("reset", 1u8).unwrap();
    e.cycle(false).unwrap();
    assert_eq!(e.get_value("counter").unwrap(), big(0));
}

#[test]
fn gated_clock_freezes_and_releases_the_counter() {
    let circuit = gated_clock_circuit();
    let mut e = engine(&circuit);

    e.set_value("io_enable", 0u8).unwrap();
    for _ in 0..10 {
        e.cycle(false).unwrap();
    }
    assert_eq!(e.get_value("io_count").unwrap(), big(0));

    e.set_value("io_enable", 1u8).unwrap();
    for _ in 0..10 {
        e.cycle(false).unwrap();
    }
    assert_eq!(e.get_value("io_count").unwrap(), big(10));
}

#[test]
fn signed_adder_with_vcd_recording() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("adder.vcd");
    let circuit = adder_circuit();
    let mut e = engine(&circuit);
    e.make_vcd_logger(&path, false).unwrap();

    e.set_value("io_a", 50).unwrap();
    e.set_value("io_b", 40).unwrap();
    e.cycle(false).unwrap();
    assert_eq!(e.get_value("io_c").unwrap(), big(90));

    e.set_value("io_a", -50).unwrap();
    e.set_value("io_b", -80).unwrap();
    e.cycle(false).unwrap();
    assert_eq!(e.get_value("io_c").unwrap(), big(-130));

    e.write_vcd().unwrap();
    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.contains("$var"));
    assert!(text.contains("io_c"));
    e.disable_vcd();
}

#[test]
fn nested_hierarchy_flattens_and_forwards() {
    let circuit = nested_hierarchy_circuit();
    let mut e = engine(&circuit);
    e.set_value("addr", 0xBEEF).unwrap();
    assert_eq!(e.get_value("data").unwrap(), big(0xBEEF));
    // The flattened leaf pin is addressable by its dotted path.
    assert_eq!(e.get_value("l1.inner.inner.inner.out").unwrap(), big(0xBEEF));
}

#[test]
fn black_box_and_gate() {
    let circuit = blackbox_and_circuit();
    let options = EngineOptions {
        black_box_registry: and_registry(),
        ..EngineOptions::default()
    };
    let mut e = Engine::new(&circuit, options).unwrap();

    e.set_value("io_a", 1u8).unwrap();
    e.set_value("io_b", 1u8).unwrap();
    assert_eq!(e.get_value("io_result").unwrap(), big(1));

    e.set_value("io_b", 0u8).unwrap();
    assert_eq!(e.get_value("io_result").unwrap(), big(0));
}

#[test]
fn stop_latches_blocks_and_clears() {
    let circuit = stop_circuit();
    let mut e = engine(&circuit);

    let mut stop_error = None;
    for _ in 0..20 {
        match e.cycle(false) {
            Ok(()) => {}
            Err(err) => {
                stop_error = Some(err);
                break;
            }
        }
    }
    match stop_error.expect("stop should surface within 20 cycles") {
        SimError::Stopped { code } => assert_eq!(code, 42),
        other => panic!("unexpected error {other:?}"),
    }
    assert!(e.stopped());
    assert_eq!(e.last_stop_result(), Some(42));

    // Latched: everything short-circuits.
    assert!(matches!(e.cycle(false), Err(SimError::Stopped { .. })));
    assert!(matches!(e.get_value("io_count"), Err(SimError::Stopped { .. })));

    // Cleared: cycling resumes and the counter moves again.
    e.clear_stop();
    assert!(!e.stopped());
    let before = e.get_value("counter").unwrap();
    e.cycle(false).unwrap();
    assert_eq!(e.get_value("counter").unwrap(), before + 1);
}

// -------------- invariants --------------

#[test]
fn commit_copies_the_staged_next_state() {
    let circuit = counter_circuit(16);
    let mut e = engine(&circuit);
    e.set_value("reset", 0u8).unwrap();
    e.cycle(false).unwrap();

    // Sample the staging shadow after propagation, then cycle: the
    // canonical register must take exactly that value.
    let staged = e.get_value("counter/prev").unwrap();
    e.cycle(false).unwrap();
    assert_eq!(e.get_value("counter").unwrap(), staged);
}

#[test]
fn repoking_the_same_value_changes_nothing() {
    let circuit = nested_hierarchy_circuit();
    let mut e = engine(&circuit);
    e.set_value("addr", 123).unwrap();
    let first = e.get_value("data").unwrap();
    e.set_value("addr", 123).unwrap();
    assert_eq!(e.get_value("data").unwrap(), first);
}

#[test]
fn poke_roundtrip_masks_to_width() {
    let circuit = adder_circuit();
    let mut e = engine(&circuit);
    // 300 does not fit SInt(8); the write masks to 8 bits: 300 & 0xFF = 44.
    let written = e.set_value("io_a", 300).unwrap();
    assert_eq!(written, big(44));
    assert_eq!(e.get_value("io_a").unwrap(), big(44));
    // 0xFF as a signed 8-bit value reads back as -1.
    e.set_value("io_b", 0xFF).unwrap();
    assert_eq!(e.get_value("io_b").unwrap(), big(-1));
}

#[test]
fn a_clock_that_never_transitions_freezes_registers() {
    let circuit = counter_circuit(8);
    let mut e = engine(&circuit);
    e.set_value("reset", 0u8).unwrap();
    for _ in 0..5 {
        e.evaluate_circuit(&[]).unwrap();
        assert_eq!(e.get_value("counter").unwrap(), big(0));
    }
}

#[test]
fn manual_clock_pokes_drive_the_triggered_partition() {
    let circuit = counter_circuit(8);
    let mut e = engine(&circuit);
    e.set_value("reset", 0u8).unwrap();
    let _ = e.get_value("counter").unwrap(); // stage the first next-state

    e.set_value("clock", 1u8).unwrap(); // rising edge commits
    assert_eq!(e.get_value("counter").unwrap(), big(1));
    e.set_value("clock", 0u8).unwrap(); // falling edge does not
    assert_eq!(e.get_value("counter").unwrap(), big(1));
}

// -------------- facade errors --------------

#[test]
fn unknown_names_and_bad_targets_error() {
    let circuit = counter_circuit(8);
    let mut e = engine(&circuit);

    assert!(matches!(
        e.get_value("nope"),
        Err(SimError::UnknownSymbol { .. })
    ));
    assert!(matches!(
        e.set_value("io_count", 1),
        Err(SimError::BadPokeTarget { .. })
    ));
    // The engine stays usable for introspection after a runtime error.
    assert!(e.is_output_port("io_count"));
}

#[test]
fn register_poke_overrides_the_canonical_slot() {
    let circuit = counter_circuit(8);
    let mut e = engine(&circuit);
    e.set_value("reset", 0u8).unwrap();

    assert!(e.set_value("counter", 9).is_err());
    e.set_value_with("counter", big(9), false, true, 0).unwrap();
    assert_eq!(e.get_value("io_count").unwrap(), big(9));
    e.cycle(false).unwrap();
    assert_eq!(e.get_value("io_count").unwrap(), big(10));
}

#[test]
fn force_poke_reruns_the_forward_subgraph() {
    let circuit = nested_hierarchy_circuit();
    let mut e = engine(&circuit);
    e.set_value("addr", 5).unwrap();
    assert_eq!(e.get_value("data").unwrap(), big(5));

    // Forcing an internal wire propagates to everything downstream of it
    // without touching the rest of the circuit.
    e.set_value_with("l1.inner.in", big(77), true, false, 0).unwrap();
    assert_eq!(
        e.get_value("l1.inner.inner.inner.out").unwrap(),
        big(77)
    );
}

#[test]
fn rollback_buffers_expose_earlier_cycles() {
    let circuit = counter_circuit(8);
    let options = EngineOptions {
        rollback_buffers: 3,
        ..EngineOptions::default()
    };
    let mut e = Engine::new(&circuit, options).unwrap();
    e.set_value("reset", 0u8).unwrap();
    for _ in 0..3 {
        e.cycle(false).unwrap();
    }
    assert_eq!(e.get_value("counter").unwrap(), big(3));
    // Each buffer snapshot was taken just before that cycle's commit.
    assert_eq!(e.get_value_at("counter", 1).unwrap(), big(2));
    assert_eq!(e.get_value_at("counter", 2).unwrap(), big(1));
    assert!(matches!(
        e.get_value_at("counter", 7),
        Err(SimError::OffsetOutOfRange { .. })
    ));
}

// -------------- memories --------------

#[test]
fn memory_write_port_commits_on_the_edge() {
    let circuit = memory_circuit(16);
    let mut e = engine(&circuit);

    e.set_value("io_waddr", 3).unwrap();
    e.set_value("io_wdata", 0xAB).unwrap();
    e.set_value("io_wen", 1u8).unwrap();
    e.set_value("io_raddr", 3).unwrap();
    // Before any edge the slot still holds its power-on zero.
    assert_eq!(e.get_value("io_rdata").unwrap(), big(0));

    e.cycle(false).unwrap();
    assert_eq!(e.get_value("io_rdata").unwrap(), big(0xAB));
    assert_eq!(e.peek_memory("m", 3).unwrap(), big(0xAB));

    // With the enable low nothing moves.
    e.set_value("io_wen", 0u8).unwrap();
    e.set_value("io_wdata", 0xCD).unwrap();
    e.cycle(false).unwrap();
    assert_eq!(e.peek_memory("m", 3).unwrap(), big(0xAB));
}

#[test]
fn memory_index_bounds() {
    let circuit = memory_circuit(16);
    let mut e = engine(&circuit);

    e.poke_memory("m", 15, big(7)).unwrap();
    assert_eq!(e.peek_memory("m", 15).unwrap(), big(7));
    assert!(matches!(
        e.peek_memory("m", 16),
        Err(SimError::OffsetOutOfRange { .. })
    ));
    assert!(matches!(
        e.poke_memory("m", 16, big(1)),
        Err(SimError::OffsetOutOfRange { .. })
    ));
}

// -------------- boundaries & misc --------------

#[test]
fn maximum_width_literals_load_without_overflow() {
    let wide: BigInt = (BigInt::from(1) << 127) - 1;
    let top = Module {
        name: "Wide".to_string(),
        ports: vec![Port {
            name: "io_k".to_string(),
            direction: Direction::Output,
            tpe: Tpe::UInt(128),
        }],
        stmts: vec![
            Stmt::Node {
                name: "k".to_string(),
                value: Expr::UIntLit {
                    value: wide.clone(),
                    width: 128,
                },
            },
            Stmt::Connect {
                dest: "io_k".to_string(),
                src: Expr::reference("k"),
            },
        ],
    };
    let circuit = Circuit {
        top: "Wide".to_string(),
        modules: vec![top],
        ext_modules: vec![],
    };
    let mut e = engine(&circuit);
    assert_eq!(e.get_value("io_k").unwrap(), wide);
}

#[test]
fn division_by_zero_yields_zero_and_continues() {
    let top = Module {
        name: "Div".to_string(),
        ports: vec![
            Port {
                name: "io_a".to_string(),
                direction: Direction::Input,
                tpe: Tpe::UInt(8),
            },
            Port {
                name: "io_b".to_string(),
                direction: Direction::Input,
                tpe: Tpe::UInt(8),
            },
            Port {
                name: "io_q".to_string(),
                direction: Direction::Output,
                tpe: Tpe::UInt(8),
            },
        ],
        stmts: vec![Stmt::Connect {
            dest: "io_q".to_string(),
            src: Expr::binop(PrimOp::Div, Expr::reference("io_a"), Expr::reference("io_b")),
        }],
    };
    let circuit = Circuit {
        top: "Div".to_string(),
        modules: vec![top],
        ext_modules: vec![],
    };
    let mut e = engine(&circuit);
    e.set_value("io_a", 42).unwrap();
    e.set_value("io_b", 0u8).unwrap();
    assert_eq!(e.get_value("io_q").unwrap(), big(0));
    e.set_value("io_b", 6u8).unwrap();
    assert_eq!(e.get_value("io_q").unwrap(), big(7));
}

#[test]
fn do_cycles_returns_early_on_stop() {
    let circuit = stop_circuit();
    let mut e = engine(&circuit);
    e.do_cycles(50).unwrap();
    assert!(e.stopped());
    assert_eq!(e.last_stop_result(), Some(42));
}

#[test]
fn introspection_classifies_symbols() {
    let circuit = counter_circuit(8);
    let e = engine(&circuit);

    assert!(e.is_register("counter"));
    assert!(!e.is_register("io_count"));
    assert!(e.is_input_port("reset"));
    assert!(e.is_input_port("clock"));
    assert!(e.is_output_port("io_count"));

    assert_eq!(
        e.get_input_names(),
        vec!["clock".to_string(), "reset".to_string()]
    );
    assert_eq!(e.get_output_names(), vec!["io_count".to_string()]);
    assert!(e.valid_names().contains(&"counter/prev".to_string()));
    assert!(e.symbols().any(|s| s.name == "counter"));
}

#[test]
fn render_computation_shows_the_expression_tree() {
    let circuit = counter_circuit(8);
    let mut e = engine(&circuit);
    e.set_value("reset", 0u8).unwrap();
    let rendered = e.render_computation(&["counter/prev", "io_count"]).unwrap();
    assert!(rendered.contains("mux("));
    assert!(rendered.contains("counter"));
    assert!(rendered.contains("io_count <= "));
}

#[test]
fn black_box_hears_input_and_clock_notifications() {
    use crate::ir::ExtModule;
    // A box wired to both data pins and the top clock.
    let top = Module {
        name: "BBClocked".to_string(),
        ports: vec![
            Port {
                name: "clock".to_string(),
                direction: Direction::Input,
                tpe: Tpe::Clock,
            },
            Port {
                name: "io_a".to_string(),
                direction: Direction::Input,
                tpe: Tpe::UInt(1),
            },
            Port {
                name: "io_b".to_string(),
                direction: Direction::Input,
                tpe: Tpe::UInt(1),
            },
            Port {
                name: "io_result".to_string(),
                direction: Direction::Output,
                tpe: Tpe::UInt(1),
            },
        ],
        stmts: vec![
            Stmt::Inst {
                name: "bb".to_string(),
                module: "BBAndShell".to_string(),
            },
            Stmt::Connect {
                dest: "bb.clk".to_string(),
                src: Expr::reference("clock"),
            },
            Stmt::Connect {
                dest: "bb.a".to_string(),
                src: Expr::reference("io_a"),
            },
            Stmt::Connect {
                dest: "bb.b".to_string(),
                src: Expr::reference("io_b"),
            },
            Stmt::Connect {
                dest: "io_result".to_string(),
                src: Expr::reference("bb.result"),
            },
        ],
    };
    let circuit = Circuit {
        top: "BBClocked".to_string(),
        modules: vec![top],
        ext_modules: vec![ExtModule {
            name: "BBAndShell".to_string(),
            ports: vec![
                Port {
                    name: "clk".to_string(),
                    direction: Direction::Input,
                    tpe: Tpe::Clock,
                },
                Port {
                    name: "a".to_string(),
                    direction: Direction::Input,
                    tpe: Tpe::UInt(1),
                },
                Port {
                    name: "b".to_string(),
                    direction: Direction::Input,
                    tpe: Tpe::UInt(1),
                },
                Port {
                    name: "result".to_string(),
                    direction: Direction::Output,
                    tpe: Tpe::UInt(1),
                },
            ],
            defname: "BBAnd".to_string(),
        }],
    };
    let (registry, counters) = counting_registry();
    let options = EngineOptions {
        black_box_registry: registry,
        ..EngineOptions::default()
    };
    let mut e = Engine::new(&circuit, options).unwrap();
    e.set_value("io_a", 1u8).unwrap();
    e.set_value("io_b", 1u8).unwrap();
    assert_eq!(e.get_value("io_result").unwrap(), big(1));
    let inputs_before = counters.input_changes.get();
    assert!(inputs_before > 0);

    // Two clock edges per cycle reach the listener.
    let clocks_before = counters.clock_changes.get();
    e.cycle(false).unwrap();
    assert_eq!(counters.clock_changes.get(), clocks_before + 2);
    assert_eq!(e.get_value("io_result").unwrap(), big(1));
}
