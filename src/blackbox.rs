/*!
Black-box subsystem: trait definition and implementation registry.

Purpose:
- Decouple externally-implemented modules from the compiled circuit so a
  test harness can supply behavior for `extmodule` declarations.
- Provide a stable interface the compiler can query for dependency edges
  at compile time; the registry is never consulted during evaluation.

Integration:
- The symbol-table walk resolves each extern instance's `defname` against
  the registry and keeps the created instance alive for the engine's
  lifetime (instances are shared between the output assigners and the
  notification hooks through `Rc<RefCell<_>>`).
- Output values are pulled with `get_output`; input-pin writes push
  `input_changed`; clock pins observe `clock_change` transitions.
*/

use std::cell::RefCell;
use std::rc::Rc;

use num_bigint::BigInt;

use crate::error::SimError;
use crate::ir::Tpe;

/// Clock transition observed by a black box.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Transition {
    PositiveEdge,
    NegativeEdge,
    NoTransition,
}

/// Common interface all black-box implementations must provide.
///
/// Semantics:
/// - `get_output` is called during combinational evaluation with the
///   current values of the pins named by `output_dependencies`, in that
///   order. It must be side-effect free with respect to the circuit.
/// - `input_changed` fires after an input pin's assigner writes its slot.
/// - `clock_change` fires on every transition of a clock connected to one
///   of the box's clock-typed pins.
pub trait BlackBox {
    /// Instance name (the flattened instance path).
    fn name(&self) -> &str;

    /// An input pin changed to `value`.
    fn input_changed(&mut self, _pin: &str, _value: &BigInt) {}

    /// A connected clock transitioned.
    fn clock_change(&mut self, _transition: Transition, _clock_name: &str) {}

    /// Compute the current value of `output_name` from `inputs` (the pins
    /// named by `output_dependencies(output_name)`, in order).
    fn get_output(&mut self, inputs: &[BigInt], tpe: &Tpe, output_name: &str) -> BigInt;

    /// The input pins `output_name` combinationally depends on.
    fn output_dependencies(&self, output_name: &str) -> Vec<String>;

    /// Full `(output, inputs)` relation. The default derives nothing;
    /// the compiler queries `output_dependencies` per declared output
    /// port, so most implementations can ignore this.
    fn get_dependencies(&self) -> Vec<(String, Vec<String>)> {
        Vec::new()
    }
}

/// Creates black-box instances for the defnames it understands.
pub trait BlackBoxFactory {
    /// Build an instance for `defname`, or `None` if this factory does not
    /// implement it. `instance_name` is the flattened instance path.
    fn create(&self, defname: &str, instance_name: &str) -> Option<Rc<RefCell<dyn BlackBox>>>;
}

/// Ordered collection of factories; the first one claiming a defname wins.
#[derive(Default)]
pub struct BlackBoxRegistry {
    factories: Vec<Rc<dyn BlackBoxFactory>>,
}

impl std::fmt::Debug for BlackBoxRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlackBoxRegistry")
            .field("factories", &self.factories.len())
            .finish()
    }
}

impl BlackBoxRegistry {
    pub fn new() -> BlackBoxRegistry {
        BlackBoxRegistry::default()
    }

    /// Append a factory; later factories are consulted only when earlier
    /// ones decline a defname.
    pub fn add_factory(&mut self, factory: Rc<dyn BlackBoxFactory>) {
        self.factories.push(factory);
    }

    /// Resolve `defname` to a fresh instance; unresolved is a compile-time
    /// fatal error.
    pub fn create(
        &self,
        defname: &str,
        instance_name: &str,
    ) -> Result<Rc<RefCell<dyn BlackBox>>, SimError> {
        self.factories
            .iter()
            .find_map(|f| f.create(defname, instance_name))
            .ok_or_else(|| SimError::UnresolvedBlackBox {
                defname: defname.to_string(),
            })
    }
}
