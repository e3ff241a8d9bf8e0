use core::fmt::Write;

static PRINT_IMPL: spin::once::Once<&'static dyn DebugPrint> = spin::once::Once::new();
const LEVEL_FILTER: log::LevelFilter = log::LevelFilter::Debug;

macro_rules! println {
    ($($arg:tt)*) => { use core::fmt::Write; core::writeln!($crate::println::DebugWriter, $($arg)*).expect("Unable to write!"); }
}

/// Route `log` records to `console`. Only the first console installed is used.
pub fn init(console: &'static dyn DebugPrint) -> Result<(), log::SetLoggerError> {
    PRINT_IMPL.call_once(|| console);
    log::set_logger(&DebugWriter).map(|()| log::set_max_level(LEVEL_FILTER))
}

/// Byte sink of the kernel console
pub trait DebugPrint: Sync {
    fn print_byte(&self, byte: u8) -> core::fmt::Result;

    fn print_str(&self, string: &str) -> core::fmt::Result {
        for byte in string.bytes() {
            self.print_byte(byte)?;
        }
        Ok(())
    }
}

/// Console on the standard output of the host
#[cfg(any(test, feature = "std"))]
pub struct StdoutPrint;

#[cfg(any(test, feature = "std"))]
impl DebugPrint for StdoutPrint {
    fn print_byte(&self, byte: u8) -> core::fmt::Result {
        self.print_str(core::str::from_utf8(&[byte]).map_err(|_| core::fmt::Error)?)
    }

    fn print_str(&self, string: &str) -> core::fmt::Result {
        // print! goes through the test harness' output capture
        std::print!("{string}");
        Ok(())
    }
}

pub struct DebugWriter;

impl Write for DebugWriter {
    fn write_str(&mut self, string: &str) -> core::fmt::Result {
        match PRINT_IMPL.get() {
            Some(console) => console.print_str(string),
            None => Err(core::fmt::Error),
        }
    }
}

impl log::Log for DebugWriter {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) && PRINT_IMPL.get().is_some() {
            let file = record.file().unwrap_or("");
            let line = record.line().unwrap_or(0);

            println!(
                "[{}] ({}:{}:{}): {}",
                record.level(),
                record.target(),
                file,
                line,
                record.args()
            );
        }
    }

    fn flush(&self) {}
}
