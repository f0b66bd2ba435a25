//! Delay-Retry handling.
//!
//! A device that cannot answer right away replies with busy, DR initiate,
//! DR running or DR conflict. The client then re-sends the same request
//! after a delay until the device produces a real answer, the retry budget
//! runs out, or the caller aborts. On exhaustion or abort a flush delayed
//! responses command is sent so a stale deferred reply does not end up
//! answering some later request.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::command::rc;
use crate::error::{HartError, Result};
use crate::message::HartIpRequest;
use crate::response::HartIpResponse;

/// Default number of retries.
pub const DEFAULT_DR_RETRIES: u32 = 10;

/// Default delay between retries.
pub const DEFAULT_DR_DELAY: Duration = Duration::from_millis(1000);

/// Shortest accepted retry delay.
pub const MIN_DR_DELAY: Duration = Duration::from_millis(500);

/// Longest accepted retry delay.
pub const MAX_DR_DELAY: Duration = Duration::from_millis(30_000);

/// Returns whether `code` asks the host to retry later.
///
/// # Example
///
/// ```
/// use hart_ip::retry::is_delayed_response;
///
/// assert!(is_delayed_response(32));
/// assert!(is_delayed_response(33));
/// assert!(!is_delayed_response(35));
/// assert!(!is_delayed_response(0));
/// ```
pub fn is_delayed_response(code: u8) -> bool {
    matches!(code, rc::BUSY | rc::DR_INITIATE | rc::DR_RUNNING | rc::DR_CONFLICT)
}

/// Delay before retry number `attempt` (1-based), given the delay used so far.
///
/// From the second attempt on the delay doubles, but never beyond `ceiling`.
/// With the ceiling equal to the base delay it therefore stays constant.
pub fn next_delay(current: Duration, attempt: u32, ceiling: Duration) -> Duration {
    if attempt > 1 && current < ceiling {
        current.saturating_mul(2).min(ceiling)
    } else {
        current
    }
}

/// Retry budget and base delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RetryPolicy {
    /// Number of re-sends allowed; zero flushes on the first busy reply.
    pub retries: u32,
    /// Base delay, also the ceiling of the backoff.
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Creates a policy, clamping `base_delay` into the accepted range.
    pub fn new(retries: u32, base_delay: Duration) -> Self {
        Self {
            retries,
            base_delay: base_delay.clamp(MIN_DR_DELAY, MAX_DR_DELAY),
        }
    }

    /// A policy that never retries.
    pub fn disabled() -> Self {
        Self::new(0, DEFAULT_DR_DELAY)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_DR_RETRIES, DEFAULT_DR_DELAY)
    }
}

/// Bookkeeping of one retried request.
#[derive(Debug, Clone)]
pub struct RequestTask {
    /// Request being retried.
    pub request: HartIpRequest,
    /// Latest response.
    pub response: Option<HartIpResponse>,
    /// Retries performed so far.
    pub retries_attempted: u32,
    /// Retry budget.
    pub retries_allowed: u32,
    /// Delay before the next retry.
    pub current_delay: Duration,
    /// Set once the task reached a terminal state.
    pub completed: bool,
}

impl RequestTask {
    /// Starts a task from the first response to `request`.
    pub fn new(request: HartIpRequest, first: HartIpResponse, policy: &RetryPolicy) -> Self {
        Self {
            request,
            response: Some(first),
            retries_attempted: 0,
            retries_allowed: policy.retries,
            current_delay: policy.base_delay,
            completed: false,
        }
    }

    /// Returns whether the latest response asks for another attempt.
    pub fn needs_retry(&self) -> bool {
        !self.completed
            && self
                .response
                .as_ref()
                .is_some_and(|r| is_delayed_response(r.response_code))
    }
}

/// Cancellation token for a retry sequence.
///
/// Clones share the same state. Aborting wakes a sleeping retry loop. A
/// token stays aborted once fired; every sequence gets a fresh one from
/// [`ActiveSequences::begin`].
#[derive(Debug, Clone)]
pub struct AbortHandle {
    aborted: Arc<AtomicBool>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
}

impl AbortHandle {
    /// Creates a token that is not aborted.
    pub fn new() -> Self {
        let (wake_tx, wake_rx) = bounded(1);
        Self {
            aborted: Arc::new(AtomicBool::new(false)),
            wake_tx,
            wake_rx,
        }
    }

    /// Requests an abort.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
        let _ = self.wake_tx.try_send(());
    }

    /// Returns whether an abort was requested.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Sleeps for `delay` unless aborted first. Returns `true` on abort.
    pub fn wait(&self, delay: Duration) -> bool {
        if self.is_aborted() {
            return true;
        }
        if self.wake_rx.recv_timeout(delay).is_ok() {
            // pass the wake-up on to any other waiter on a clone
            let _ = self.wake_tx.try_send(());
        }
        self.is_aborted()
    }
}

impl Default for AbortHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Abort tokens of the retry sequences running on one client.
///
/// A request registers its token before the first send, so an abort raised
/// while that send is in flight still reaches it.
#[derive(Debug, Default)]
pub struct ActiveSequences {
    inner: Mutex<SequenceList>,
}

#[derive(Debug, Default)]
struct SequenceList {
    next_id: u64,
    handles: Vec<(u64, AbortHandle)>,
}

impl ActiveSequences {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new sequence with a fresh token. The sequence is
    /// unregistered when the guard drops.
    pub fn begin(&self) -> SequenceGuard<'_> {
        let handle = AbortHandle::new();
        let mut list = self.inner.lock();
        list.next_id += 1;
        let id = list.next_id;
        list.handles.push((id, handle.clone()));
        SequenceGuard {
            owner: self,
            id,
            handle,
        }
    }

    /// Aborts every registered sequence. Returns how many there were.
    pub fn abort_all(&self) -> usize {
        let list = self.inner.lock();
        for (_, handle) in &list.handles {
            handle.abort();
        }
        list.handles.len()
    }

    /// Number of registered sequences.
    pub fn len(&self) -> usize {
        self.inner.lock().handles.len()
    }

    /// Returns whether no sequence is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Registration of one running sequence in [`ActiveSequences`].
#[derive(Debug)]
pub struct SequenceGuard<'a> {
    owner: &'a ActiveSequences,
    id: u64,
    handle: AbortHandle,
}

impl SequenceGuard<'_> {
    /// Token of this sequence.
    pub fn handle(&self) -> &AbortHandle {
        &self.handle
    }
}

impl Drop for SequenceGuard<'_> {
    fn drop(&mut self) {
        let id = self.id;
        self.owner.inner.lock().handles.retain(|(sub, _)| *sub != id);
    }
}

/// What the retry loop needs from the client.
pub trait RetrySender {
    /// Sends `request` again and waits for its response.
    fn resend(&self, request: &HartIpRequest) -> Result<HartIpResponse>;

    /// Sends the flush delayed responses command, best effort.
    fn flush_delayed_responses(&self);
}

/// Drives the Delay-Retry loop for one request.
#[derive(Debug, Clone)]
pub struct RetryEngine {
    policy: RetryPolicy,
    abort: AbortHandle,
}

impl RetryEngine {
    /// Creates an engine with `policy`, cancellable through `abort`.
    pub fn new(policy: RetryPolicy, abort: AbortHandle) -> Self {
        Self { policy, abort }
    }

    /// Retry policy in use.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Handles `first`, the response to `request`, retrying while the device
    /// asks for it.
    ///
    /// # Errors
    ///
    /// - `HartError::RetryExhausted` after the last allowed retry still got a
    ///   delayed response
    /// - `HartError::UserAbort` when the abort handle fired at any point of
    ///   the sequence, even if the reply to a re-send was final
    /// - any error from re-sending
    ///
    /// The flush command is sent before each of these is returned, and also
    /// when the policy allows no retries at all.
    pub fn run<S>(&self, sender: &S, request: &HartIpRequest, first: HartIpResponse) -> Result<HartIpResponse>
    where
        S: RetrySender + ?Sized,
    {
        let mut task = RequestTask::new(request.clone(), first, &self.policy);
        if !task.needs_retry() {
            task.completed = true;
            return task.response.take().ok_or(HartError::NoResponse);
        }
        if self.abort.is_aborted() {
            return self.abandon(sender);
        }
        if task.retries_allowed == 0 {
            log::debug!("device busy and retries disabled, flushing");
            sender.flush_delayed_responses();
            return task.response.take().ok_or(HartError::NoResponse);
        }

        let ceiling = self.policy.base_delay;
        while task.needs_retry() {
            task.retries_attempted += 1;
            if task.retries_attempted > task.retries_allowed {
                log::warn!(
                    "command still delayed after {} retries, flushing",
                    task.retries_allowed
                );
                sender.flush_delayed_responses();
                return Err(HartError::RetryExhausted {
                    attempts: task.retries_allowed,
                });
            }

            task.current_delay = next_delay(task.current_delay, task.retries_attempted, ceiling);
            log::debug!(
                "response code {} asks for a retry, attempt {} of {} in {:?}",
                task.response.as_ref().map_or(0, |r| r.response_code),
                task.retries_attempted,
                task.retries_allowed,
                task.current_delay
            );
            if self.abort.wait(task.current_delay) {
                return self.abandon(sender);
            }

            match sender.resend(&task.request) {
                Ok(response) => task.response = Some(response),
                Err(e) => {
                    sender.flush_delayed_responses();
                    return Err(e);
                }
            }
            if self.abort.is_aborted() {
                return self.abandon(sender);
            }
        }

        task.completed = true;
        task.response.take().ok_or(HartError::NoResponse)
    }

    fn abandon<S>(&self, sender: &S) -> Result<HartIpResponse>
    where
        S: RetrySender + ?Sized,
    {
        log::info!("retry sequence aborted by user");
        sender.flush_delayed_responses();
        Err(HartError::UserAbort)
    }
}
