//! Session inactivity monitoring.
//!
//! A HART-IP server closes a session that stays silent for its inactivity
//! close time. The monitor ticks periodically and, from the elapsed idle
//! time, decides whether to send a keep alive (80% of the close time) or to
//! drop the session before the server does (90%).

use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};

/// Default tick interval.
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(1);

/// What the monitor should do after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InactivityAction {
    /// Nothing to do.
    Idle,
    /// Send a keep alive.
    KeepAlive,
    /// Close the session.
    Disconnect,
}

/// Decides the action for `elapsed` idle time against `close_time`.
///
/// # Example
///
/// ```
/// use hart_ip::monitor::{evaluate, InactivityAction};
/// use std::time::Duration;
///
/// let close = Duration::from_secs(100);
/// assert_eq!(evaluate(Duration::from_secs(10), close, true), InactivityAction::Idle);
/// assert_eq!(evaluate(Duration::from_secs(85), close, true), InactivityAction::KeepAlive);
/// assert_eq!(evaluate(Duration::from_secs(85), close, false), InactivityAction::Idle);
/// assert_eq!(evaluate(Duration::from_secs(95), close, true), InactivityAction::Disconnect);
/// ```
pub fn evaluate(elapsed: Duration, close_time: Duration, keep_alive_enabled: bool) -> InactivityAction {
    if close_time.is_zero() {
        return InactivityAction::Idle;
    }
    let elapsed = elapsed.as_millis();
    let close = close_time.as_millis();
    if elapsed * 10 >= close * 9 {
        InactivityAction::Disconnect
    } else if keep_alive_enabled && elapsed * 10 >= close * 8 {
        InactivityAction::KeepAlive
    } else {
        InactivityAction::Idle
    }
}

/// Background thread calling `tick` every interval until stopped.
#[derive(Debug)]
pub struct InactivityMonitor {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl InactivityMonitor {
    /// Starts the monitor thread.
    ///
    /// `tick` returns `false` to end monitoring, for example once the session
    /// is gone.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the thread cannot be spawned.
    pub fn spawn<F>(interval: Duration, mut tick: F) -> std::io::Result<Self>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let handle = thread::Builder::new()
            .name("hart-ip-monitor".to_string())
            .spawn(move || {
                log::debug!("inactivity monitor started, interval {:?}", interval);
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            if !tick() {
                                break;
                            }
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                log::debug!("inactivity monitor stopped");
            })?;

        Ok(Self {
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Returns whether the monitor thread is still running.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stops the thread and waits for it.
    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.try_send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for InactivityMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_thresholds() {
        let close = Duration::from_millis(600_000);
        assert_eq!(evaluate(Duration::from_millis(479_999), close, true), InactivityAction::Idle);
        assert_eq!(evaluate(Duration::from_millis(480_000), close, true), InactivityAction::KeepAlive);
        assert_eq!(evaluate(Duration::from_millis(539_999), close, true), InactivityAction::KeepAlive);
        assert_eq!(evaluate(Duration::from_millis(540_000), close, true), InactivityAction::Disconnect);
        assert_eq!(evaluate(Duration::from_millis(540_000), close, false), InactivityAction::Disconnect);
        assert_eq!(evaluate(Duration::from_secs(5), Duration::ZERO, true), InactivityAction::Idle);
    }

    #[test]
    fn test_monitor_ticks_until_stopped() {
        let ticks = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&ticks);
        let mut monitor = InactivityMonitor::spawn(Duration::from_millis(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        })
        .unwrap();

        thread::sleep(Duration::from_millis(100));
        monitor.stop();
        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen >= 2, "only {} ticks", seen);
        assert!(!monitor.is_running());

        thread::sleep(Duration::from_millis(30));
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
    }

    #[test]
    fn test_monitor_ends_when_tick_declines() {
        let monitor = InactivityMonitor::spawn(Duration::from_millis(5), || false).unwrap();
        thread::sleep(Duration::from_millis(100));
        assert!(!monitor.is_running());
    }
}
