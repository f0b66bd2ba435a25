//! Request/response correlation.
//!
//! A background reader thread pulls messages off the transport and hands
//! them to a dispatcher over a channel. The dispatcher completes the
//! [`ResponseSlot`] registered under the response's transaction id, or hands
//! publish messages to the [`Subscribers`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::error::HartError;
use crate::response::HartIpResponse;
use crate::transport::Transport;

/// Default transaction id modulus.
pub const DEFAULT_TRANSACTION_ID_MODULUS: u16 = 10_000;

/// One-shot response holder shared between a waiting caller and the
/// dispatcher.
///
/// The slot is set at most once, either with a response or empty when the
/// request was released without one.
#[derive(Clone)]
pub struct ResponseSlot {
    inner: Arc<SlotInner>,
}

struct SlotInner {
    value: OnceLock<Option<HartIpResponse>>,
    signal_tx: Sender<()>,
    signal_rx: Receiver<()>,
}

impl ResponseSlot {
    /// Creates an unset slot.
    pub fn new() -> Self {
        let (signal_tx, signal_rx) = bounded(1);
        Self {
            inner: Arc::new(SlotInner {
                value: OnceLock::new(),
                signal_tx,
                signal_rx,
            }),
        }
    }

    /// Stores the outcome; returns `false` if the slot was already set.
    pub fn set(&self, response: Option<HartIpResponse>) -> bool {
        if self.inner.value.set(response).is_err() {
            return false;
        }
        let _ = self.inner.signal_tx.try_send(());
        true
    }

    /// Returns whether an outcome was stored.
    pub fn is_set(&self) -> bool {
        self.inner.value.get().is_some()
    }

    /// Response if one arrived, without blocking.
    pub fn try_get(&self) -> Option<HartIpResponse> {
        self.inner.value.get().cloned().flatten()
    }

    /// Blocks until the slot is set or `timeout` passes.
    ///
    /// Returns `None` on timeout and when the request was released without a
    /// response.
    pub fn wait(&self, timeout: Duration) -> Option<HartIpResponse> {
        if !self.is_set() && self.inner.signal_rx.recv_timeout(timeout).is_ok() {
            // pass the wake-up on to any other waiter
            let _ = self.inner.signal_tx.try_send(());
        }
        self.try_get()
    }
}

impl Default for ResponseSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ResponseSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseSlot")
            .field("set", &self.is_set())
            .finish()
    }
}

/// In-flight requests keyed by transaction id.
#[derive(Debug, Default)]
pub struct PendingRequests {
    slots: HashMap<u16, ResponseSlot>,
}

impl PendingRequests {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a request and returns the slot its response will land in.
    /// A stale entry under the same id is released first.
    pub fn register(&mut self, transaction_id: u16) -> ResponseSlot {
        let slot = ResponseSlot::new();
        if let Some(stale) = self.slots.insert(transaction_id, slot.clone()) {
            stale.set(None);
        }
        slot
    }

    /// Completes the request matching the response's transaction id.
    ///
    /// Returns the response back if nothing was waiting for it.
    pub fn complete(&mut self, response: HartIpResponse) -> Option<HartIpResponse> {
        match self.slots.remove(&response.transaction_id()) {
            Some(slot) => {
                slot.set(Some(response));
                None
            }
            None => Some(response),
        }
    }

    /// Forgets a request, releasing its slot empty.
    pub fn cancel(&mut self, transaction_id: u16) -> bool {
        match self.slots.remove(&transaction_id) {
            Some(slot) => {
                slot.set(None);
                true
            }
            None => false,
        }
    }

    /// Releases every waiter without a response.
    pub fn release_all(&mut self) -> usize {
        let count = self.slots.len();
        for (_, slot) in self.slots.drain() {
            slot.set(None);
        }
        count
    }

    /// Returns whether a request is waiting under `transaction_id`.
    pub fn contains(&self, transaction_id: u16) -> bool {
        self.slots.contains_key(&transaction_id)
    }

    /// Number of in-flight requests.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns whether nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Transaction id generator cycling through `1..=modulus`.
///
/// # Example
///
/// ```
/// use hart_ip::correlator::TransactionIds;
///
/// let mut ids = TransactionIds::new(3);
/// let seq: Vec<u16> = (0..5).map(|_| ids.next_id()).collect();
/// assert_eq!(seq, vec![1, 2, 3, 1, 2]);
/// ```
#[derive(Debug, Clone)]
pub struct TransactionIds {
    last: u16,
    modulus: u16,
}

impl TransactionIds {
    /// Creates a generator; a zero modulus is treated as one.
    pub fn new(modulus: u16) -> Self {
        Self {
            last: 0,
            modulus: modulus.max(1),
        }
    }

    /// Next id, never 0.
    pub fn next_id(&mut self) -> u16 {
        self.last = if self.last >= self.modulus {
            1
        } else {
            self.last + 1
        };
        self.last
    }

    /// Last id handed out (0 before the first call).
    pub fn last(&self) -> u16 {
        self.last
    }
}

/// Callback invoked for every publish message.
pub type PublishCallback = Arc<dyn Fn(&HartIpResponse) + Send + Sync>;

/// Handle returned by [`Subscribers::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Registered publish subscribers.
#[derive(Clone, Default)]
pub struct Subscribers {
    inner: Arc<Mutex<SubscriberList>>,
}

#[derive(Default)]
struct SubscriberList {
    next_id: u64,
    callbacks: Vec<(SubscriptionId, PublishCallback)>,
}

impl Subscribers {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a subscriber.
    pub fn subscribe(&self, callback: PublishCallback) -> SubscriptionId {
        let mut list = self.inner.lock();
        list.next_id += 1;
        let id = SubscriptionId(list.next_id);
        list.callbacks.push((id, callback));
        id
    }

    /// Removes a subscriber; unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut list = self.inner.lock();
        let before = list.callbacks.len();
        list.callbacks.retain(|(sub, _)| *sub != id);
        list.callbacks.len() != before
    }

    /// Calls every subscriber with `response`, outside the registry lock.
    pub fn notify(&self, response: &HartIpResponse) -> usize {
        let callbacks: Vec<PublishCallback> = self
            .inner
            .lock()
            .callbacks
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for callback in &callbacks {
            callback(response);
        }
        callbacks.len()
    }

    /// Number of subscribers.
    pub fn len(&self) -> usize {
        self.inner.lock().callbacks.len()
    }

    /// Returns whether nobody is subscribed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for Subscribers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscribers").field("count", &self.len()).finish()
    }
}

/// Event sent from the reader thread to the dispatcher.
#[derive(Debug)]
pub enum ReaderEvent {
    /// A parsed message.
    Frame(HartIpResponse),
    /// A message that could not be parsed; the reader keeps going.
    Malformed(HartError),
    /// The reader exited.
    Stopped {
        /// The connection is unusable.
        fatal: bool,
        /// Why the reader stopped.
        reason: String,
    },
}

/// Starts the reader thread for `transport`.
///
/// On a connection-oriented transport a receive timeout calls `may_stop`;
/// the reader ends only if it returns `true`, so the owner can refuse while
/// requests are still waiting and mark the reader gone in the same critical
/// section. Datagram transports ignore timeouts. A closed transport or a
/// message with an unsupported version ends the reader for good.
///
/// # Errors
///
/// Returns an I/O error if the thread cannot be spawned.
pub fn spawn_reader<F>(
    transport: Arc<dyn Transport>,
    events: Sender<ReaderEvent>,
    may_stop: F,
) -> std::io::Result<JoinHandle<()>>
where
    F: Fn() -> bool + Send + 'static,
{
    thread::Builder::new()
        .name("hart-ip-reader".to_string())
        .spawn(move || {
            let kind = transport.kind();
            log::debug!("{} reader started for {}", kind, transport.peer_addr());
            let stop = loop {
                let bytes = match transport.receive() {
                    Ok(bytes) => bytes,
                    Err(HartError::Timeout) if !kind.is_connection_oriented() => continue,
                    Err(HartError::Timeout) if !may_stop() => continue,
                    Err(HartError::Timeout) => {
                        break ReaderEvent::Stopped {
                            fatal: false,
                            reason: "receive timed out".to_string(),
                        }
                    }
                    Err(e) => {
                        break ReaderEvent::Stopped {
                            fatal: true,
                            reason: e.to_string(),
                        }
                    }
                };

                let event = match HartIpResponse::from_bytes(&bytes) {
                    Ok(response) => ReaderEvent::Frame(response),
                    Err(e) if e.is_fatal() => {
                        break ReaderEvent::Stopped {
                            fatal: true,
                            reason: e.to_string(),
                        }
                    }
                    Err(e) => ReaderEvent::Malformed(e),
                };
                if events.send(event).is_err() {
                    log::debug!("dispatcher gone, reader exiting");
                    return;
                }
            };

            if let ReaderEvent::Stopped { fatal, reason } = &stop {
                log::debug!("{} reader stopped (fatal: {}): {}", kind, fatal, reason);
            }
            let _ = events.send(stop);
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{MessageId, MessageType};
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    use crate::transport::TransportKind;

    fn ack(tid: u16) -> HartIpResponse {
        let bytes = HartIpResponse::encode(MessageType::Response, MessageId::KeepAlive, 0, tid, &[]);
        HartIpResponse::from_bytes(&bytes).unwrap()
    }

    #[test]
    fn test_transaction_ids_wrap_to_one() {
        let mut ids = TransactionIds::new(DEFAULT_TRANSACTION_ID_MODULUS);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..DEFAULT_TRANSACTION_ID_MODULUS {
            let id = ids.next_id();
            assert_ne!(id, 0);
            assert!(seen.insert(id));
        }
        assert_eq!(ids.last(), DEFAULT_TRANSACTION_ID_MODULUS);
        assert_eq!(ids.next_id(), 1);
    }

    #[test]
    fn test_zero_modulus() {
        let mut ids = TransactionIds::new(0);
        assert_eq!(ids.next_id(), 1);
        assert_eq!(ids.next_id(), 1);
    }

    #[test]
    fn test_slot_set_once() {
        let slot = ResponseSlot::new();
        assert!(!slot.is_set());
        assert!(slot.set(Some(ack(1))));
        assert!(!slot.set(None));
        assert_eq!(slot.try_get().map(|r| r.transaction_id()), Some(1));
        assert_eq!(slot.wait(Duration::from_millis(1)).map(|r| r.transaction_id()), Some(1));
    }

    #[test]
    fn test_slot_wait_times_out() {
        let slot = ResponseSlot::new();
        let start = Instant::now();
        assert!(slot.wait(Duration::from_millis(30)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_slot_wakes_waiter_from_other_thread() {
        let slot = ResponseSlot::new();
        let setter = slot.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            setter.set(Some(ack(9)));
        });
        let response = slot.wait(Duration::from_secs(5));
        handle.join().unwrap();
        assert_eq!(response.map(|r| r.transaction_id()), Some(9));
    }

    #[test]
    fn test_pending_complete_and_unmatched() {
        let mut pending = PendingRequests::new();
        let slot = pending.register(4);
        assert!(pending.contains(4));

        assert!(pending.complete(ack(4)).is_none());
        assert!(pending.is_empty());
        assert!(slot.try_get().is_some());

        let unmatched = pending.complete(ack(5));
        assert_eq!(unmatched.map(|r| r.transaction_id()), Some(5));
    }

    #[test]
    fn test_pending_release_all() {
        let mut pending = PendingRequests::new();
        let a = pending.register(1);
        let b = pending.register(2);
        assert_eq!(pending.release_all(), 2);
        assert!(a.is_set() && b.is_set());
        assert!(a.try_get().is_none());
        assert!(b.wait(Duration::from_secs(5)).is_none());
    }

    #[test]
    fn test_cancel_rolls_back_registration() {
        let mut pending = PendingRequests::new();
        pending.register(7);
        assert!(pending.cancel(7));
        assert!(!pending.cancel(7));
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn test_subscribers() {
        let subscribers = Subscribers::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let id = subscribers.subscribe(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(subscribers.notify(&ack(1)), 1);
        assert!(subscribers.unsubscribe(id));
        assert!(!subscribers.unsubscribe(id));
        assert_eq!(subscribers.notify(&ack(2)), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_before_any_publish() {
        let subscribers = Subscribers::new();
        let id = subscribers.subscribe(Arc::new(|_| {}));
        assert!(subscribers.unsubscribe(id));
        assert!(subscribers.is_empty());
    }

    /// Transport replaying scripted receive results.
    #[derive(Debug)]
    struct Scripted {
        kind: TransportKind,
        script: Mutex<Vec<crate::error::Result<Vec<u8>>>>,
    }

    impl Transport for Scripted {
        fn kind(&self) -> TransportKind {
            self.kind
        }
        fn peer_addr(&self) -> SocketAddr {
            "127.0.0.1:5094".parse().unwrap()
        }
        fn send(&self, _data: &[u8]) -> crate::error::Result<()> {
            Ok(())
        }
        fn receive(&self) -> crate::error::Result<Vec<u8>> {
            let mut script = self.script.lock();
            if script.is_empty() {
                Err(HartError::ConnectionClosed)
            } else {
                script.remove(0)
            }
        }
        fn shutdown(&self) {}
        fn is_closed(&self) -> bool {
            false
        }
    }

    fn run_reader(kind: TransportKind, script: Vec<crate::error::Result<Vec<u8>>>) -> Vec<ReaderEvent> {
        run_reader_with(kind, script, || true)
    }

    fn run_reader_with<F>(
        kind: TransportKind,
        script: Vec<crate::error::Result<Vec<u8>>>,
        may_stop: F,
    ) -> Vec<ReaderEvent>
    where
        F: Fn() -> bool + Send + 'static,
    {
        let transport = Arc::new(Scripted {
            kind,
            script: Mutex::new(script),
        });
        let (tx, rx) = crossbeam_channel::unbounded();
        spawn_reader(transport, tx, may_stop).unwrap().join().unwrap();
        rx.try_iter().collect()
    }

    #[test]
    fn test_udp_reader_survives_timeouts() {
        let keep_alive = HartIpResponse::encode(MessageType::Response, MessageId::KeepAlive, 0, 3, &[]);
        let events = run_reader(
            TransportKind::Udp,
            vec![Err(HartError::Timeout), Ok(keep_alive), Ok(vec![1, 1])],
        );

        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], ReaderEvent::Frame(r) if r.transaction_id() == 3));
        assert!(matches!(events[1], ReaderEvent::Malformed(_)));
        assert!(matches!(events[2], ReaderEvent::Stopped { fatal: true, .. }));
    }

    #[test]
    fn test_tcp_reader_stops_on_timeout() {
        let events = run_reader(TransportKind::Tcp, vec![Err(HartError::Timeout)]);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ReaderEvent::Stopped { fatal: false, .. }));
    }

    #[test]
    fn test_tcp_reader_keeps_reading_while_refused() {
        let asked = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&asked);
        let reply = HartIpResponse::encode(MessageType::Response, MessageId::KeepAlive, 0, 8, &[]);
        let events = run_reader_with(
            TransportKind::Tcp,
            vec![Err(HartError::Timeout), Ok(reply), Err(HartError::Timeout)],
            move || counter.fetch_add(1, Ordering::SeqCst) > 0,
        );

        assert_eq!(asked.load(Ordering::SeqCst), 2);
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], ReaderEvent::Frame(r) if r.transaction_id() == 8));
        assert!(matches!(events[1], ReaderEvent::Stopped { fatal: false, .. }));
    }

    #[test]
    fn test_reader_stops_on_unsupported_version() {
        let events = run_reader(TransportKind::Udp, vec![Ok(vec![2, 1, 2, 0, 0, 1, 0, 8])]);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ReaderEvent::Stopped { fatal: true, .. }));
    }
}
