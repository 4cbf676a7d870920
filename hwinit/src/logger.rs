//! Serial Logging
//!
//! Provides the logging backend behind the `log` crate facade. All
//! diagnostics in the workspace go through `log::warn!` / `log::error!`
//! and friends; this module renders them to the serial console.
//!
//! Messages are formatted into a stack buffer first so a log call never
//! allocates and never takes a lock.

use core::fmt::Write;

use log::{Level, LevelFilter, Log, Metadata, Record};

use crate::serial;

/// Maximum rendered length of one log line; longer messages are truncated.
const MSG_BUF_SIZE: usize = 256;

/// Stack buffer for formatting log messages.
struct MessageBuffer {
    data: [u8; MSG_BUF_SIZE],
    len: usize,
}

impl MessageBuffer {
    const fn new() -> Self {
        Self {
            data: [0u8; MSG_BUF_SIZE],
            len: 0,
        }
    }

    fn as_str(&self) -> &str {
        core::str::from_utf8(&self.data[..self.len]).unwrap_or("<invalid>")
    }
}

impl Write for MessageBuffer {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let bytes = s.as_bytes();
        let remaining = MSG_BUF_SIZE - self.len;
        let to_copy = bytes.len().min(remaining);
        self.data[self.len..self.len + to_copy].copy_from_slice(&bytes[..to_copy]);
        self.len += to_copy;
        Ok(())
    }
}

/// Serial logger implementation.
struct SerialLogger;

impl Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let level_str = match record.level() {
            Level::Error => "ERROR",
            Level::Warn => " WARN",
            Level::Info => " INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        };

        let mut buf = MessageBuffer::new();
        let _ = writeln!(buf, "[{}] {}: {}", level_str, record.target(), record.args());
        serial::puts(buf.as_str());
    }

    fn flush(&self) {}
}

/// Global logger instance.
static LOGGER: SerialLogger = SerialLogger;

/// Install the serial logger at the default (`Info`) level.
///
/// Call once at boot, before any device probing, so the mandatory probe
/// diagnostics are observable. Subsequent calls are no-ops.
pub fn init() {
    init_with_level(LevelFilter::Info);
}

/// Install the serial logger with an explicit level filter.
pub fn init_with_level(filter: LevelFilter) {
    log::set_logger(&LOGGER)
        .map(|()| log::set_max_level(filter))
        .ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_buffer_truncates() {
        let mut buf = MessageBuffer::new();
        for _ in 0..MSG_BUF_SIZE {
            let _ = buf.write_str("xy");
        }
        assert_eq!(buf.len, MSG_BUF_SIZE);
        assert_eq!(buf.as_str().len(), MSG_BUF_SIZE);
    }

    #[test]
    fn test_message_buffer_formats() {
        let mut buf = MessageBuffer::new();
        let _ = write!(buf, "[{}] {}", " WARN", "virtio 0000:00:03.0");
        assert_eq!(buf.as_str(), "[ WARN] virtio 0000:00:03.0");
    }
}
