/*!
SymbolTable: owner of every symbol in the flattened circuit.

Purpose
- Walk the already-lowered circuit and allocate a symbol for every port,
  node, register (plus its `/prev` staging shadow), memory, memory-port
  pin, black-box pin, stop latch and print marker.
- Flatten the instance hierarchy by prefixing names with the dotted
  instance path; a nested module's signal `x` inside instance `a.b`
  becomes `a.b.x`.
- Maintain the forward (`children_of`) and reverse (`parents_of`)
  dependency maps between symbols, and answer transitive reachability
  queries for the scheduler and the force-poke path.

Black-box instances are created here (the registry is consulted during
construction, never during evaluation) and handed back to the compiler so
it can wire output assigners and notifications.
*/

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::blackbox::{BlackBox, BlackBoxRegistry};
use crate::error::SimError;
use crate::ir::{Circuit, Direction, Expr, Module, Port, Stmt, Tpe};
use crate::symbol::{Kind, Symbol, SymbolId, prefixed};

/// A black-box instance discovered during the flattening walk.
pub struct BlackBoxInstance {
    /// Flattened instance path, e.g. `outer.bb0`.
    pub path: String,
    pub defname: String,
    pub bbox: Rc<RefCell<dyn BlackBox>>,
    /// Port list from the extern module declaration.
    pub ports: Vec<Port>,
}

/// Owner of all symbols and of the dependency relation between them.
#[derive(Default)]
pub struct SymbolTable {
    symbols: Vec<Symbol>,
    by_name: HashMap<String, SymbolId>,
    /// `children[x]` = symbols whose assigner reads `x`.
    children: Vec<BTreeSet<SymbolId>>,
    /// `parents[x]` = symbols that `x`'s assigner reads.
    parents: Vec<BTreeSet<SymbolId>>,
}

impl std::ops::Index<SymbolId> for SymbolTable {
    type Output = Symbol;

    #[inline]
    fn index(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id.0]
    }
}

impl SymbolTable {
    pub fn new() -> SymbolTable {
        SymbolTable::default()
    }

    // -------------- construction --------------

    /// Add a symbol; duplicate names are fatal.
    pub fn add(
        &mut self,
        name: impl Into<String>,
        kind: Kind,
        tpe: Tpe,
        slots: usize,
    ) -> Result<SymbolId, SimError> {
        let name = name.into();
        if self.by_name.contains_key(&name) {
            return Err(SimError::DuplicateSymbol { name });
        }
        let id = SymbolId(self.symbols.len());
        self.by_name.insert(name.clone(), id);
        self.symbols.push(Symbol::new(id, name, kind, tpe, slots));
        self.children.push(BTreeSet::new());
        self.parents.push(BTreeSet::new());
        Ok(id)
    }

    /// Link a register or clock to its `/prev` shadow.
    pub fn set_shadow(&mut self, id: SymbolId, shadow: SymbolId) {
        self.symbols[id.0].shadow = Some(shadow);
    }

    /// Record that the assigner producing `output` reads `operand`.
    pub fn add_dependency(&mut self, output: SymbolId, operand: SymbolId) {
        self.children[operand.0].insert(output);
        self.parents[output.0].insert(operand);
    }

    /// Assign arena indices in id order, bumping one cursor per size class.
    /// Returns the total slot counts (int, long, big) for the data store.
    pub fn allocate_data(&mut self) -> (usize, usize, usize) {
        let (mut ints, mut longs, mut bigs) = (0usize, 0usize, 0usize);
        for sym in &mut self.symbols {
            let cursor = match sym.size {
                crate::symbol::DataSize::Int => &mut ints,
                crate::symbol::DataSize::Long => &mut longs,
                crate::symbol::DataSize::Big => &mut bigs,
            };
            sym.index = *cursor;
            *cursor += sym.slots;
        }
        (ints, longs, bigs)
    }

    // -------------- lookup --------------

    #[inline]
    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Symbol> {
        self.by_name.get(name).map(|id| &self.symbols[id.0])
    }

    pub fn id_of(&self, name: &str) -> Option<SymbolId> {
        self.by_name.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols.iter()
    }

    // -------------- dependency queries --------------

    pub fn children_of(&self, id: SymbolId) -> &BTreeSet<SymbolId> {
        &self.children[id.0]
    }

    pub fn parents_of(&self, id: SymbolId) -> &BTreeSet<SymbolId> {
        &self.parents[id.0]
    }

    /// Breadth-first forward closure: every symbol whose value can change
    /// when one of `roots` changes. The roots themselves are not included
    /// unless reachable through an edge.
    pub fn reachable_from(&self, roots: impl IntoIterator<Item = SymbolId>) -> BTreeSet<SymbolId> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<SymbolId> = roots.into_iter().collect();
        while let Some(id) = queue.pop_front() {
            for &child in &self.children[id.0] {
                if seen.insert(child) {
                    queue.push_back(child);
                }
            }
        }
        seen
    }

    /// Symbols with no parents in the dependency graph: driven by
    /// constants, primary inputs, or clock-triggered writes only.
    pub fn orphans(&self) -> Vec<SymbolId> {
        self.symbols
            .iter()
            .filter(|s| self.parents[s.id.0].is_empty())
            .map(|s| s.id)
            .collect()
    }

    /// All input-port symbol ids.
    pub fn input_ports(&self) -> Vec<SymbolId> {
        self.ids_of_kind(Kind::InputPort)
    }

    /// All output-port symbol ids.
    pub fn output_ports(&self) -> Vec<SymbolId> {
        self.ids_of_kind(Kind::OutputPort)
    }

    /// All register symbol ids (canonical side, not the `/prev` shadows).
    pub fn registers(&self) -> Vec<SymbolId> {
        self.ids_of_kind(Kind::Register)
    }

    fn ids_of_kind(&self, kind: Kind) -> Vec<SymbolId> {
        self.symbols
            .iter()
            .filter(|s| s.kind == kind)
            .map(|s| s.id)
            .collect()
    }

    // -------------- circuit walk --------------

    /// Build the table by flattening `circuit`, creating black-box
    /// instances through `registry` as extern modules are encountered.
    pub fn from_circuit(
        circuit: &Circuit,
        registry: &BlackBoxRegistry,
    ) -> Result<(SymbolTable, Vec<BlackBoxInstance>), SimError> {
        let top = circuit
            .module(&circuit.top)
            .ok_or_else(|| SimError::UnresolvedReference {
                name: circuit.top.clone(),
            })?;
        let mut table = SymbolTable::new();
        let mut instances = Vec::new();
        table.walk_module(circuit, registry, top, "", true, &mut instances)?;
        Ok((table, instances))
    }

    fn walk_module(
        &mut self,
        circuit: &Circuit,
        registry: &BlackBoxRegistry,
        module: &Module,
        prefix: &str,
        is_top: bool,
        instances: &mut Vec<BlackBoxInstance>,
    ) -> Result<(), SimError> {
        for port in &module.ports {
            let name = prefixed(prefix, &port.name);
            let kind = if !is_top {
                // Instance ports flatten to plain wires; connects in the
                // parent and child drive them.
                Kind::Wire
            } else {
                match (port.direction, port.tpe) {
                    (Direction::Input, Tpe::Clock) => Kind::Clock,
                    (Direction::Input, _) => Kind::InputPort,
                    (Direction::Output, _) => Kind::OutputPort,
                }
            };
            let id = self.add(name.clone(), kind, port.tpe, 1)?;
            if kind == Kind::Clock {
                let prev = self.add(format!("{name}/prev"), Kind::ClockPrev, Tpe::Clock, 1)?;
                self.set_shadow(id, prev);
            }
        }

        for stmt in &module.stmts {
            match stmt {
                Stmt::Node { name, value } => {
                    let tpe = self.infer_in_scope(prefix, value)?;
                    let kind = match value {
                        Expr::UIntLit { .. } | Expr::SIntLit { .. } => Kind::Literal,
                        _ => Kind::Wire,
                    };
                    self.add(prefixed(prefix, name), kind, tpe, 1)?;
                }
                Stmt::Reg { name, tpe, .. } => {
                    let full = prefixed(prefix, name);
                    let reg = self.add(full.clone(), Kind::Register, *tpe, 1)?;
                    let prev = self.add(format!("{full}/prev"), Kind::RegisterPrev, *tpe, 1)?;
                    self.set_shadow(reg, prev);
                }
                Stmt::Mem {
                    name,
                    tpe,
                    depth,
                    readers,
                    writers,
                    ..
                } => {
                    let full = prefixed(prefix, name);
                    self.add(full.clone(), Kind::Memory, *tpe, (*depth).max(1))?;
                    let aw = addr_width(*depth);
                    for port in readers.iter().chain(writers) {
                        self.add(format!("{full}.{port}.addr"), Kind::Wire, Tpe::UInt(aw), 1)?;
                        self.add(format!("{full}.{port}.en"), Kind::Wire, Tpe::UInt(1), 1)?;
                        self.add(format!("{full}.{port}.data"), Kind::Wire, *tpe, 1)?;
                    }
                }
                Stmt::Inst { name, module: child } => {
                    let child_prefix = format!("{}.", prefixed(prefix, name));
                    if let Some(m) = circuit.module(child) {
                        self.walk_module(circuit, registry, m, &child_prefix, false, instances)?;
                    } else if let Some(ext) = circuit.ext_module(child) {
                        let path = prefixed(prefix, name);
                        let bbox = registry.create(&ext.defname, &path)?;
                        for port in &ext.ports {
                            let kind = match port.direction {
                                Direction::Input => Kind::Wire,
                                Direction::Output => Kind::BlackBoxOutput,
                            };
                            self.add(format!("{path}.{}", port.name), kind, port.tpe, 1)?;
                        }
                        instances.push(BlackBoxInstance {
                            path,
                            defname: ext.defname.clone(),
                            bbox,
                            ports: ext.ports.clone(),
                        });
                    } else {
                        return Err(SimError::UnresolvedReference {
                            name: child.clone(),
                        });
                    }
                }
                Stmt::Stop { name, .. } => {
                    self.add(prefixed(prefix, name), Kind::Stop, Tpe::UInt(32), 1)?;
                }
                Stmt::Print { name, .. } => {
                    self.add(prefixed(prefix, name), Kind::Wire, Tpe::UInt(1), 1)?;
                }
                Stmt::Connect { .. } => {}
            }
        }
        Ok(())
    }

    /// Run type inference for an expression whose references are local to
    /// the instance at `prefix`.
    pub fn infer_in_scope(&self, prefix: &str, expr: &Expr) -> Result<Tpe, SimError> {
        let lookup = |local: &str| self.get(&prefixed(prefix, local)).map(Symbol::tpe);
        expr.infer_tpe(&lookup)
    }

    /// Make sure a clock-like symbol has a `/prev` shadow for edge
    /// detection, creating one on demand for derived clocks.
    pub fn ensure_clock_prev(&mut self, clock: SymbolId) -> Result<SymbolId, SimError> {
        if let Some(prev) = self.symbols[clock.0].shadow {
            return Ok(prev);
        }
        let name = format!("{}/prev", self.symbols[clock.0].name);
        let prev = self.add(name, Kind::ClockPrev, Tpe::Clock, 1)?;
        self.set_shadow(clock, prev);
        Ok(prev)
    }
}

/// Bits needed to address `depth` slots (at least 1).
pub fn addr_width(depth: usize) -> u32 {
    usize::BITS - (depth.max(2) - 1).leading_zeros()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::PrimOp;

    fn leaf(name: &str) -> Module {
        Module {
            name: name.to_string(),
            ports: vec![
                Port {
                    name: "in".to_string(),
                    direction: Direction::Input,
                    tpe: Tpe::UInt(16),
                },
                Port {
                    name: "out".to_string(),
                    direction: Direction::Output,
                    tpe: Tpe::UInt(16),
                },
            ],
            stmts: vec![Stmt::Connect {
                dest: "out".to_string(),
                src: Expr::reference("in"),
            }],
        }
    }

    #[test]
    fn duplicate_names_are_fatal() {
        let mut t = SymbolTable::new();
        t.add("x", Kind::Wire, Tpe::UInt(1), 1).unwrap();
        assert!(matches!(
            t.add("x", Kind::Wire, Tpe::UInt(1), 1),
            Err(SimError::DuplicateSymbol { .. })
        ));
    }

    #[test]
    fn registers_get_prev_shadows() {
        let top = Module {
            name: "top".to_string(),
            ports: vec![Port {
                name: "clock".to_string(),
                direction: Direction::Input,
                tpe: Tpe::Clock,
            }],
            stmts: vec![Stmt::Reg {
                name: "r".to_string(),
                tpe: Tpe::UInt(8),
                clock: Expr::reference("clock"),
                reset: None,
            }],
        };
        let circuit = Circuit {
            top: "top".to_string(),
            modules: vec![top],
            ext_modules: vec![],
        };
        let (table, _) = SymbolTable::from_circuit(&circuit, &BlackBoxRegistry::new()).unwrap();
        let r = table.get("r").unwrap();
        assert_eq!(r.kind, Kind::Register);
        let prev = table.get("r/prev").unwrap();
        assert_eq!(prev.kind, Kind::RegisterPrev);
        assert_eq!(r.shadow, Some(prev.id));
        assert_eq!(table.get("clock").unwrap().kind, Kind::Clock);
        assert!(table.contains("clock/prev"));
    }

    #[test]
    fn hierarchy_flattens_with_dotted_prefixes() {
        let inner = leaf("Leaf");
        let top = Module {
            name: "top".to_string(),
            ports: vec![],
            stmts: vec![Stmt::Inst {
                name: "a".to_string(),
                module: "Leaf".to_string(),
            }],
        };
        let circuit = Circuit {
            top: "top".to_string(),
            modules: vec![top, inner],
            ext_modules: vec![],
        };
        let (table, _) = SymbolTable::from_circuit(&circuit, &BlackBoxRegistry::new()).unwrap();
        assert!(table.contains("a.in"));
        assert!(table.contains("a.out"));
        // Instance ports are wires, not ports, after flattening.
        assert_eq!(table.get("a.in").unwrap().kind, Kind::Wire);
    }

    #[test]
    fn reachability_follows_forward_edges() {
        let mut t = SymbolTable::new();
        let a = t.add("a", Kind::InputPort, Tpe::UInt(1), 1).unwrap();
        let b = t.add("b", Kind::Wire, Tpe::UInt(1), 1).unwrap();
        let c = t.add("c", Kind::Wire, Tpe::UInt(1), 1).unwrap();
        let d = t.add("d", Kind::Wire, Tpe::UInt(1), 1).unwrap();
        t.add_dependency(b, a);
        t.add_dependency(c, b);
        let reached = t.reachable_from([a]);
        assert!(reached.contains(&b));
        assert!(reached.contains(&c));
        assert!(!reached.contains(&d));
    }

    #[test]
    fn orphans_have_no_parents() {
        let mut t = SymbolTable::new();
        let a = t.add("a", Kind::Wire, Tpe::UInt(1), 1).unwrap();
        let b = t.add("b", Kind::Wire, Tpe::UInt(1), 1).unwrap();
        t.add_dependency(b, a);
        let orphans = t.orphans();
        assert!(orphans.contains(&a));
        assert!(!orphans.contains(&b));
    }

    #[test]
    fn missing_module_is_unresolved() {
        let top = Module {
            name: "top".to_string(),
            ports: vec![],
            stmts: vec![Stmt::Inst {
                name: "a".to_string(),
                module: "Ghost".to_string(),
            }],
        };
        let circuit = Circuit {
            top: "top".to_string(),
            modules: vec![top],
            ext_modules: vec![],
        };
        assert!(matches!(
            SymbolTable::from_circuit(&circuit, &BlackBoxRegistry::new()),
            Err(SimError::UnresolvedReference { .. })
        ));
    }

    #[test]
    fn memory_ports_get_pin_symbols() {
        let top = Module {
            name: "top".to_string(),
            ports: vec![],
            stmts: vec![Stmt::Mem {
                name: "m".to_string(),
                tpe: Tpe::UInt(8),
                depth: 16,
                clock: Expr::reference("clock"),
                readers: vec!["r0".to_string()],
                writers: vec!["w0".to_string()],
            }],
        };
        let circuit = Circuit {
            top: "top".to_string(),
            modules: vec![top],
            ext_modules: vec![],
        };
        let (table, _) = SymbolTable::from_circuit(&circuit, &BlackBoxRegistry::new()).unwrap();
        assert_eq!(table.get("m").unwrap().slots, 16);
        assert_eq!(table.get("m.r0.addr").unwrap().width, 4);
        assert!(table.contains("m.w0.data"));
        assert!(table.contains("m.w0.en"));
    }

    #[test]
    fn node_types_are_inferred_in_scope() {
        let top = Module {
            name: "top".to_string(),
            ports: vec![Port {
                name: "x".to_string(),
                direction: Direction::Input,
                tpe: Tpe::UInt(4),
            }],
            stmts: vec![Stmt::Node {
                name: "y".to_string(),
                value: Expr::binop(PrimOp::Add, Expr::reference("x"), Expr::uint(1, 4)),
            }],
        };
        let circuit = Circuit {
            top: "top".to_string(),
            modules: vec![top],
            ext_modules: vec![],
        };
        let (table, _) = SymbolTable::from_circuit(&circuit, &BlackBoxRegistry::new()).unwrap();
        assert_eq!(table.get("y").unwrap().width, 5);
    }

    #[test]
    fn addr_width_covers_depth() {
        assert_eq!(addr_width(1), 1);
        assert_eq!(addr_width(2), 1);
        assert_eq!(addr_width(8), 3);
        assert_eq!(addr_width(9), 4);
        assert_eq!(addr_width(1024), 10);
    }
}
