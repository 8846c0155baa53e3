//! Console Log Backend
//!
//! Backend for the `log` facade: each record is formatted into a fixed-size
//! stack buffer (no allocation, no locks beyond the console's own) and
//! written to the PL011 console as
//!
//! ```text
//! [      12.345]  INFO virtio-blk: capacity 20480 sectors
//! ```
//!
//! with a boot-relative millisecond timestamp and per-level ANSI colour.
//! Timestamps read the registered monotonic clock; until [`set_clock`] runs
//! they print as zero.

use core::fmt::{self, Write};

use log::{Level, LevelFilter, Log, Metadata, Record};
use pinion_common::time::MonotonicClock;
use spin::mutex::SpinMutex;

use crate::console;

/// Longest formatted log line; anything beyond this is truncated.
const LOG_LINE_MAX: usize = 256;

/// Stack buffer for formatting log messages without allocating
struct MessageBuffer {
    data: [u8; LOG_LINE_MAX],
    len: usize,
}

impl MessageBuffer {
    const fn new() -> Self {
        Self {
            data: [0u8; LOG_LINE_MAX],
            len: 0,
        }
    }

    fn as_str(&self) -> &str {
        core::str::from_utf8(&self.data[..self.len]).unwrap_or("<invalid>")
    }
}

impl Write for MessageBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let bytes = s.as_bytes();
        let remaining = LOG_LINE_MAX - self.len;
        let to_copy = bytes.len().min(remaining);
        self.data[self.len..self.len + to_copy].copy_from_slice(&bytes[..to_copy]);
        self.len += to_copy;
        Ok(())
    }
}

/// Clock used for boot-relative timestamps; logging works without one.
static CLOCK: SpinMutex<Option<&'static (dyn MonotonicClock + Sync)>> = SpinMutex::new(None);

fn now_ms() -> u64 {
    CLOCK.lock().map_or(0, |clock| clock.now_ns() / 1_000_000)
}

fn format_line(
    buf: &mut MessageBuffer,
    time_ms: u64,
    level: Level,
    target: &str,
    args: fmt::Arguments<'_>,
) {
    let level_str = match level {
        Level::Error => "\x1b[31mERROR\x1b[0m",
        Level::Warn => "\x1b[33m WARN\x1b[0m",
        Level::Info => "\x1b[32m INFO\x1b[0m",
        Level::Debug => "\x1b[34mDEBUG\x1b[0m",
        Level::Trace => "\x1b[35mTRACE\x1b[0m",
    };

    let _ = writeln!(
        buf,
        "[{:>8}.{:03}] {} {}: {}",
        time_ms / 1000,
        time_ms % 1000,
        level_str,
        target,
        args
    );
}

/// Console logger implementation
struct PalLogger;

impl Log for PalLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let mut line = MessageBuffer::new();
        format_line(
            &mut line,
            now_ms(),
            record.level(),
            record.target(),
            *record.args(),
        );
        console::puts(line.as_str());
    }

    fn flush(&self) {}
}

/// Global logger instance
static LOGGER: PalLogger = PalLogger;

/// Install the console logger and set the global level filter.
///
/// The `log` facade accepts one logger per process; a second call leaves
/// the first registration in place.
pub fn init(level: LevelFilter) {
    log::set_logger(&LOGGER)
        .map(|()| log::set_max_level(level))
        .ok();
}

/// Register the clock that timestamps log lines.
pub fn set_clock(clock: &'static (dyn MonotonicClock + Sync)) {
    *CLOCK.lock() = Some(clock);
}

#[cfg(test)]
mod tests {
    use pinion_common::time::TickClock;

    use super::*;

    #[test]
    fn test_message_buffer_truncates() {
        let mut buf = MessageBuffer::new();
        for _ in 0..30 {
            let _ = buf.write_str("0123456789");
        }
        assert_eq!(buf.len, LOG_LINE_MAX);
        assert_eq!(buf.as_str().len(), LOG_LINE_MAX);
        // Still valid UTF-8 after hitting the cap.
        assert!(buf.as_str().starts_with("0123456789"));
    }

    #[test]
    fn test_format_line_layout() {
        let mut buf = MessageBuffer::new();
        format_line(
            &mut buf,
            12_345,
            Level::Info,
            "virtio-blk",
            format_args!("capacity {} sectors", 20480),
        );
        assert_eq!(
            buf.as_str(),
            "[      12.345] \x1b[32m INFO\x1b[0m virtio-blk: capacity 20480 sectors\n"
        );
    }

    #[test]
    fn test_format_line_level_colours() {
        let cases = [
            (Level::Error, "\x1b[31mERROR\x1b[0m"),
            (Level::Warn, "\x1b[33m WARN\x1b[0m"),
            (Level::Info, "\x1b[32m INFO\x1b[0m"),
            (Level::Debug, "\x1b[34mDEBUG\x1b[0m"),
            (Level::Trace, "\x1b[35mTRACE\x1b[0m"),
        ];
        for (level, tag) in cases {
            let mut buf = MessageBuffer::new();
            format_line(&mut buf, 0, level, "t", format_args!("m"));
            assert!(buf.as_str().contains(tag), "missing tag for {level}");
        }
    }

    #[test]
    fn test_timestamps_follow_registered_clock() {
        // 1 kHz: one tick per millisecond.
        static CLOCK_SRC: TickClock = TickClock::new(1000);

        assert_eq!(now_ms(), 0);
        set_clock(&CLOCK_SRC);
        CLOCK_SRC.advance_ticks(2500);
        assert_eq!(now_ms(), 2500);
    }
}
