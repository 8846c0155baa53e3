//! PL011 UART Console
//!
//! Polled, byte-at-a-time output for logging and diagnostics. The UART sits
//! behind a global [`SpinMutex`] so concurrent printers take turns instead of
//! interleaving mid-character. Until [`init`] runs, output is silently
//! dropped.

use core::fmt::{self, Write};

use pinion_mmio::MmioRegion;
use spin::mutex::SpinMutex;

/// PL011 UART registers (offsets from base)
mod pl011 {
    /// Data register offset
    pub const DR: usize = 0x00;
    /// Flag register offset
    pub const FR: usize = 0x18;
    /// Flag: transmit FIFO full
    pub const FR_TXFF: u32 = 1 << 5;
}

struct Console {
    region: Option<MmioRegion>,
}

impl Console {
    const fn new() -> Self {
        Self { region: None }
    }

    fn init(&mut self, region: MmioRegion) {
        self.region = Some(region);
    }

    fn putc(&self, c: u8) {
        let Some(region) = self.region else {
            return;
        };

        // Wait for the TX FIFO to free a slot
        while region.read32(pl011::FR) & pl011::FR_TXFF != 0 {
            core::hint::spin_loop();
        }

        region.write32(pl011::DR, u32::from(c));
    }

    fn puts(&self, s: &str) {
        for c in s.bytes() {
            if c == b'\n' {
                self.putc(b'\r');
            }
            self.putc(c);
        }
    }
}

impl Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.puts(s);
        Ok(())
    }
}

/// Global console instance
static CONSOLE: SpinMutex<Console> = SpinMutex::new(Console::new());

/// Point the console at a PL011 register window.
///
/// The region comes from devicetree discovery (or a known board address);
/// constructing it is where the caller vouches for the mapping.
pub fn init(region: MmioRegion) {
    let mut console = CONSOLE.lock();
    console.init(region);
}

/// Print a string to the console, translating LF to CRLF.
pub fn puts(s: &str) {
    let console = CONSOLE.lock();
    console.puts(s);
}

/// Print a single character to the console.
pub fn putc(c: u8) {
    let console = CONSOLE.lock();
    console.putc(c);
}

/// Console writer for fmt::Write
pub struct ConsoleWriter;

impl Write for ConsoleWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        CONSOLE.lock().write_str(s)
    }
}

/// Print formatted output to the console
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {{
        use core::fmt::Write;
        let _ = write!($crate::console::ConsoleWriter, $($arg)*);
    }};
}

/// Print formatted output with newline to the console
#[macro_export]
macro_rules! println {
    () => {
        $crate::console::puts("\n")
    };
    ($($arg:tt)*) => {{
        use core::fmt::Write;
        let _ = write!($crate::console::ConsoleWriter, $($arg)*);
        $crate::console::puts("\n");
    }};
}
