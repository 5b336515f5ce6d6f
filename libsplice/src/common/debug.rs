use std::fmt::{self, Write};

/// Leveled diagnostics for one update.
///
/// Messages at or below the update's verbosity are kept in a buffer exposed
/// through the status interface and forwarded to the `log` facade.
#[derive(Debug, Default, Clone)]
pub struct DebugLog {
    level: u8,
    buffer: String,
}

impl DebugLog {
    pub fn new(level: u8) -> Self {
        Self {
            level,
            buffer: String::new(),
        }
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn set_level(&mut self, level: u8) {
        self.level = level;
    }

    pub fn enabled(&self, level: u8) -> bool {
        level <= self.level
    }

    pub fn emit(&mut self, level: u8, args: fmt::Arguments<'_>) {
        if !self.enabled(level) {
            return;
        }

        log::debug!(target: "libsplice", "{}", args);
        let _ = self.buffer.write_fmt(args);
        self.buffer.push('\n');
    }

    pub fn contents(&self) -> &str {
        &self.buffer
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

/// `spdebug!(log, level, "fmt", args...)`
macro_rules! spdebug {
    ($log:expr, $level:expr, $($arg:tt)*) => {
        $log.emit($level, format_args!($($arg)*))
    };
}

pub(crate) use spdebug;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_filter_buffer() {
        let mut log = DebugLog::new(2);
        spdebug!(log, 1, "kept {}", 1);
        spdebug!(log, 3, "dropped");
        assert_eq!(log.contents(), "kept 1\n");

        log.set_level(0);
        spdebug!(log, 1, "dropped too");
        assert_eq!(log.contents(), "kept 1\n");
    }
}
