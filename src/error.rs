/*!
Error kinds surfaced by the interpreter core.

Three families share one enum so the facade can return a single error type:
- compile-time fatal: raised while building the symbol table or compiling
  assigners; these abort engine construction.
- runtime fatal: raised by pokes/peeks against the finished engine; the
  engine stays usable for introspection but further cycling is undefined.
- stop-condition: an expected event latched by a `stop` statement in the
  circuit; recoverable through `Engine::clear_stop`.

Division by zero is deliberately absent: it clamps the result to zero and
is reported through the `log` facade rather than an error value.
*/

use thiserror::Error;

/// Unified error type for engine construction and driving.
#[derive(Debug, Error)]
pub enum SimError {
    // -------------- compile-time fatal --------------
    /// Two definitions produced the same flattened symbol name.
    #[error("duplicate symbol `{name}`")]
    DuplicateSymbol { name: String },

    /// A statement referenced a signal or module that was never defined.
    #[error("unresolved reference `{name}`")]
    UnresolvedReference { name: String },

    /// A literal does not fit the declared width of its type.
    #[error("literal {value} does not fit in {width} bits")]
    LiteralTooWide { value: String, width: u32 },

    /// An extern module's defname had no factory in the registry.
    #[error("no black box implementation registered for defname `{defname}`")]
    UnresolvedBlackBox { defname: String },

    /// The combinational subgraph contains a cycle and `allow_cycles` is off.
    #[error("combinational cycle through: {}", members.join(" -> "))]
    CombinationalCycle { members: Vec<String> },

    /// A register, memory, stop, or print statement used a clock expression
    /// that is not a plain signal reference.
    #[error("clock of `{name}` must be a signal reference")]
    UnsupportedClock { name: String },

    // -------------- runtime fatal --------------
    /// Poke or peek of a name that is not in the symbol table.
    #[error("unknown symbol `{name}`")]
    UnknownSymbol { name: String },

    /// Buffer or memory offset outside the valid range for the symbol.
    #[error("offset {offset} out of range for `{name}` (limit {limit})")]
    OffsetOutOfRange {
        name: String,
        offset: usize,
        limit: usize,
    },

    /// `set_value` on a symbol that is not a primary input, without `force`.
    #[error("`{name}` is not an input port; poke it with force or register_poke")]
    BadPokeTarget { name: String },

    // -------------- stop condition --------------
    /// The circuit executed a stop statement; the code is latched until
    /// `clear_stop` is called.
    #[error("circuit stopped with result {code}")]
    Stopped { code: i64 },

    /// Wave-recorder file error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SimError {
    /// True for the recoverable stop-condition kind.
    #[inline]
    pub fn is_stop(&self) -> bool {
        matches!(self, SimError::Stopped { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::SimError;

    #[test]
    fn stop_is_the_only_recoverable_kind() {
        assert!(SimError::Stopped { code: 0 }.is_stop());
        assert!(
            !SimError::UnknownSymbol {
                name: "x".to_string()
            }
            .is_stop()
        );
    }

    #[test]
    fn messages_name_the_offender() {
        let e = SimError::BadPokeTarget {
            name: "io_out".to_string(),
        };
        assert!(e.to_string().contains("io_out"));
    }
}
