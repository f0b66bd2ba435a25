//! Message log sink for sent and received frames.
//!
//! The client reports every frame it sends or receives, and every error, to
//! a [`MessageLog`]. Nothing in the protocol depends on the sink, so it can
//! be swapped for a UI view, a file, or [`NullLog`].

use crate::utils::timestamp;

/// Receives one line of text per frame or error.
pub trait MessageLog: Send + Sync {
    /// Records `text`, prefixed with the local time when `with_timestamp`.
    fn log(&self, text: &str, with_timestamp: bool);
}

/// Forwards lines to the `log` facade at info level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogFacade;

impl MessageLog for LogFacade {
    fn log(&self, text: &str, with_timestamp: bool) {
        if with_timestamp {
            log::info!(target: "hart_ip::frames", "{}, {}", timestamp(), text);
        } else {
            log::info!(target: "hart_ip::frames", "{}", text);
        }
    }
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullLog;

impl MessageLog for NullLog {
    fn log(&self, _text: &str, _with_timestamp: bool) {}
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Collects lines for assertions.
    #[derive(Debug, Default)]
    pub(crate) struct MemoryLog {
        pub(crate) lines: Mutex<Vec<String>>,
    }

    impl MessageLog for MemoryLog {
        fn log(&self, text: &str, with_timestamp: bool) {
            let line = if with_timestamp {
                format!("{}, {}", timestamp(), text)
            } else {
                text.to_string()
            };
            self.lines.lock().push(line);
        }
    }

    #[test]
    fn test_memory_log_prefixes_timestamp() {
        let log = MemoryLog::default();
        log.log("plain", false);
        log.log("stamped", true);

        let lines = log.lines.lock();
        assert_eq!(lines[0], "plain");
        assert!(lines[1].ends_with(", stamped"));
        assert!(lines[1].len() > "stamped".len() + 20);
    }

    #[test]
    fn test_null_and_facade_accept_lines() {
        NullLog.log("ignored", true);
        LogFacade.log("to the facade", false);
    }
}
