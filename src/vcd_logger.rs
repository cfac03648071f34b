/*!
VCD wave recorder: plugs the `vcd` crate into the data store's write hook.

The logger registers a wire per recordable symbol up front (the header is
fixed once written), then translates every slot-write notification into a
value change at the current logical time. Repeated writes of an unchanged
value are dropped so traces stay small.

The engine decides which symbols are recordable: scalars only, shadows
excluded, underscore-prefixed temporaries optional.
*/

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::rc::Rc;

use num_bigint::BigInt;
use num_traits::Zero;
use vcd::{IdCode, TimescaleUnit, Value};

use crate::data_store::WaveRecorder;
use crate::symbol::{Symbol, SymbolId};

/// `io::Write` adapter that lets the logger keep a flush handle to the
/// sink the `vcd::Writer` owns.
struct SharedSink(Rc<RefCell<BufWriter<File>>>);

impl Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.borrow_mut().flush()
    }
}

/// Wave recorder writing value changes in VCD format.
pub struct VcdLogger {
    writer: vcd::Writer<SharedSink>,
    sink: Rc<RefCell<BufWriter<File>>>,
    codes: HashMap<SymbolId, (IdCode, u32)>,
    last_values: HashMap<SymbolId, BigInt>,
    last_time: Option<u64>,
}

impl VcdLogger {
    /// Create the file and write the VCD header with one wire per symbol.
    pub fn new(path: &Path, top: &str, symbols: &[&Symbol]) -> io::Result<VcdLogger> {
        let sink = Rc::new(RefCell::new(BufWriter::new(File::create(path)?)));
        let mut writer = vcd::Writer::new(SharedSink(Rc::clone(&sink)));

        writer.timescale(1, TimescaleUnit::NS)?;
        writer.add_module(top)?;
        let mut codes = HashMap::new();
        for sym in symbols {
            let code = writer.add_wire(sym.width, &sym.name)?;
            codes.insert(sym.id, (code, sym.width));
        }
        writer.upscope()?;
        writer.enddefinitions()?;

        Ok(VcdLogger {
            writer,
            sink,
            codes,
            last_values: HashMap::new(),
            last_time: None,
        })
    }

    fn bits(value: &BigInt, width: u32) -> Vec<Value> {
        (0..width)
            .rev()
            .map(|bit| {
                if ((value >> bit) & BigInt::from(1)).is_zero() {
                    Value::V0
                } else {
                    Value::V1
                }
            })
            .collect()
    }
}

impl WaveRecorder for VcdLogger {
    fn record(&mut self, symbol: &Symbol, value: &BigInt, time: u64) {
        let Some(&(code, width)) = self.codes.get(&symbol.id) else {
            return;
        };
        if self.last_values.get(&symbol.id) == Some(value) {
            return;
        }
        // Negative canonical values are dumped as their two's-complement
        // bit patterns.
        let pattern = if value.sign() == num_bigint::Sign::Minus {
            value + (BigInt::from(1) << width)
        } else {
            value.clone()
        };
        if self.last_time != Some(time) {
            let _ = self.writer.timestamp(time);
            self.last_time = Some(time);
        }
        let _ = self.writer.change_vector(code, Self::bits(&pattern, width));
        self.last_values.insert(symbol.id, value.clone());
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sink.borrow_mut().flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Tpe;
    use crate::symbol::Kind;

    #[test]
    fn bit_patterns_are_msb_first() {
        let bits = VcdLogger::bits(&BigInt::from(0b101), 4);
        assert_eq!(bits, vec![Value::V0, Value::V1, Value::V0, Value::V1]);
    }

    #[test]
    fn header_and_changes_reach_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wave.vcd");
        let sym = Symbol::new(SymbolId(0), "io_c", Kind::OutputPort, Tpe::UInt(8), 1);

        let mut logger = VcdLogger::new(&path, "adder", &[&sym]).unwrap();
        logger.record(&sym, &BigInt::from(0x5A), 1);
        logger.record(&sym, &BigInt::from(0x5A), 2); // unchanged, dropped
        logger.record(&sym, &BigInt::from(-1), 3);
        logger.flush().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("$timescale"));
        assert!(text.contains("io_c"));
        assert!(text.contains("#1"));
        assert!(!text.contains("#2"));
        assert!(text.contains("#3"));
        assert!(text.contains("01011010"));
        assert!(text.contains("11111111"));
    }
}
