//! HART-IP session over a transport.
//!
//! A [`Connection`] owns one transport, the reader and dispatcher threads
//! serving it, and a single mutex-guarded state object holding the session
//! state, the in-flight requests, the transaction id generator, the last
//! activity time and the device list.
//!
//! ```text
//! Disconnected -> Connecting -> SessionInit -> Established -> Closing -> Disconnected
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::command::rc;
use crate::correlator::{spawn_reader, PendingRequests, ReaderEvent, ResponseSlot, Subscribers, TransactionIds};
use crate::device::DeviceList;
use crate::error::{HartError, Result};
use crate::logger::MessageLog;
use crate::message::{session_status_description, HartIpRequest};
use crate::response::HartIpResponse;
use crate::transport::{self, Transport, TransportKind};

/// Default inactivity close time requested at session initiate, in ms.
pub const DEFAULT_INACTIVITY_CLOSE_TIME: u32 = 600_000;

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No transport.
    Disconnected,
    /// Opening the transport.
    Connecting,
    /// Waiting for the session initiate reply.
    SessionInit,
    /// Session open.
    Established,
    /// Session close in progress.
    Closing,
}

/// Parameters of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// Socket timeout, also the default wait for a response.
    pub socket_timeout: Duration,
    /// Inactivity close time requested from the server, in ms.
    pub inactivity_close_time: u32,
    /// Transaction ids cycle through `1..=modulus`.
    pub transaction_id_modulus: u16,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            socket_timeout: transport::DEFAULT_SOCKET_TIMEOUT,
            inactivity_close_time: DEFAULT_INACTIVITY_CLOSE_TIME,
            transaction_id_modulus: crate::correlator::DEFAULT_TRANSACTION_ID_MODULUS,
        }
    }
}

struct ConnectionState {
    session: SessionState,
    pending: PendingRequests,
    transaction_ids: TransactionIds,
    last_activity: Instant,
    devices: DeviceList,
    close_time: u32,
    reader_running: bool,
}

/// Shared pieces the dispatcher and reader restarts need.
struct Shared {
    transport: Arc<dyn Transport>,
    state: Mutex<ConnectionState>,
    logger: Arc<dyn MessageLog>,
    last_error: Arc<Mutex<String>>,
}

impl Shared {
    fn record_error(&self, message: &str) {
        self.logger.log(message, true);
        *self.last_error.lock() = message.to_string();
    }
}

/// An open HART-IP connection.
pub struct Connection {
    shared: Arc<Shared>,
    events: Sender<ReaderEvent>,
    options: SessionOptions,
}

impl Connection {
    /// Connects the transport and initiates a session.
    ///
    /// Any failure after the transport is up tears it down again.
    ///
    /// # Errors
    ///
    /// - transport errors from connecting
    /// - `HartError::NoResponse` if the server does not answer the initiate
    /// - `HartError::SessionRejected` for a NAK or a status other than
    ///   success or set-to-nearest
    pub fn open(
        kind: TransportKind,
        addr: SocketAddr,
        options: SessionOptions,
        subscribers: Subscribers,
        logger: Arc<dyn MessageLog>,
        last_error: Arc<Mutex<String>>,
    ) -> Result<Self> {
        log::debug!("connecting {} to {}", kind, addr);
        let link = transport::connect(kind, addr, options.socket_timeout)?;
        Self::establish(link, options, subscribers, logger, last_error)
    }

    /// Initiates a session over an already connected transport.
    pub(crate) fn establish(
        link: Arc<dyn Transport>,
        options: SessionOptions,
        subscribers: Subscribers,
        logger: Arc<dyn MessageLog>,
        last_error: Arc<Mutex<String>>,
    ) -> Result<Self> {
        let shared = Arc::new(Shared {
            transport: link,
            state: Mutex::new(ConnectionState {
                session: SessionState::Connecting,
                pending: PendingRequests::new(),
                transaction_ids: TransactionIds::new(options.transaction_id_modulus),
                last_activity: Instant::now(),
                devices: DeviceList::new(),
                close_time: options.inactivity_close_time,
                reader_running: false,
            }),
            logger,
            last_error,
        });

        let (events_tx, events_rx) = unbounded();
        let connection = Self {
            shared: Arc::clone(&shared),
            events: events_tx,
            options,
        };

        if let Err(e) = connection.start_threads(events_rx, subscribers) {
            connection.close();
            return Err(e);
        }

        match connection.initiate_session() {
            Ok(()) => Ok(connection),
            Err(e) => {
                connection.close();
                Err(e)
            }
        }
    }

    fn start_threads(&self, events: Receiver<ReaderEvent>, subscribers: Subscribers) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        thread::Builder::new()
            .name("hart-ip-dispatch".to_string())
            .spawn(move || dispatch(&shared, &events, &subscribers))?;

        let mut state = self.shared.state.lock();
        spawn_reader(
            Arc::clone(&self.shared.transport),
            self.events.clone(),
            idle_stop(&self.shared),
        )?;
        state.reader_running = true;
        state.session = SessionState::SessionInit;
        Ok(())
    }

    fn initiate_session(&self) -> Result<()> {
        let tid = self.next_transaction_id();
        let request = HartIpRequest::initiate_session(tid, self.options.inactivity_close_time);
        let response = self.request(request)?;

        let status = response.response_code;
        if !response.is_valid_response()
            || (status != rc::SUCCESS && status != rc::SET_TO_NEAREST)
        {
            let err = HartError::SessionRejected {
                status,
                description: session_status_description(status),
            };
            self.shared.record_error(&err.to_string());
            return Err(err);
        }

        let mut state = self.shared.state.lock();
        if let Some(granted) = response.inactivity_close_time() {
            if granted != self.options.inactivity_close_time {
                log::info!("server set inactivity close time to {} ms", granted);
            }
            state.close_time = granted;
        }
        state.session = SessionState::Established;
        log::info!(
            "HART-IP session established with {} over {}",
            self.peer_addr(),
            self.transport_kind()
        );
        Ok(())
    }

    /// Allocates the next transaction id.
    pub fn next_transaction_id(&self) -> u16 {
        self.shared.state.lock().transaction_ids.next_id()
    }

    /// Sends `request` and returns the slot its response will arrive in.
    ///
    /// The request is registered before it is transmitted and unregistered
    /// again if transmission fails.
    ///
    /// # Errors
    ///
    /// Returns `HartError::NotConnected` once the connection is closed, or the
    /// transport's send error.
    pub fn send(&self, request: &mut HartIpRequest) -> Result<ResponseSlot> {
        let tid = request.transaction_id();
        let slot = {
            let mut state = self.shared.state.lock();
            if state.session == SessionState::Disconnected || self.shared.transport.is_closed() {
                return Err(HartError::NotConnected);
            }
            self.ensure_reader(&mut state);
            state.last_activity = Instant::now();
            state.pending.register(tid)
        };

        request.stamp();
        self.shared.logger.log(&request.to_string(), false);

        if let Err(e) = self.shared.transport.send(&request.to_bytes()) {
            self.shared.state.lock().pending.cancel(tid);
            self.shared
                .record_error(&format!("Failed to send request {}: {}", tid, e));
            return Err(e);
        }
        Ok(slot)
    }

    /// Sends `request` and waits for its response.
    ///
    /// The wait uses the request's own timeout, or the socket timeout.
    ///
    /// # Errors
    ///
    /// Returns `HartError::NoResponse` when nothing arrives in time or the
    /// connection goes down while waiting.
    pub fn request(&self, mut request: HartIpRequest) -> Result<HartIpResponse> {
        let timeout = request.timeout().unwrap_or(self.options.socket_timeout);
        let tid = request.transaction_id();
        let slot = self.send(&mut request)?;

        match slot.wait(timeout) {
            Some(response) => Ok(response),
            None => {
                self.shared.state.lock().pending.cancel(tid);
                self.shared.record_error(&format!(
                    "No response received for transaction {} within {:?}",
                    tid, timeout
                ));
                Err(HartError::NoResponse)
            }
        }
    }

    /// Restarts the reader after a non-fatal stop while the session is up.
    fn ensure_reader(&self, state: &mut ConnectionState) {
        if state.reader_running || state.session != SessionState::Established {
            return;
        }
        match spawn_reader(
            Arc::clone(&self.shared.transport),
            self.events.clone(),
            idle_stop(&self.shared),
        ) {
            Ok(_) => {
                log::debug!("reader restarted");
                state.reader_running = true;
            }
            Err(e) => log::warn!("cannot restart reader: {}", e),
        }
    }

    /// Sends a keep alive.
    ///
    /// # Errors
    ///
    /// Returns `HartError::NotConnected` unless the session is established.
    pub fn keep_alive(&self) -> Result<HartIpResponse> {
        if !self.is_established() {
            return Err(HartError::NotConnected);
        }
        let request = HartIpRequest::keep_alive(self.next_transaction_id());
        self.request(request)
    }

    /// Sends session close, then closes the transport whatever the reply.
    pub fn close_session(&self) {
        let tid = {
            let mut state = self.shared.state.lock();
            if state.session != SessionState::Established {
                None
            } else {
                state.session = SessionState::Closing;
                Some(state.transaction_ids.next_id())
            }
        };

        if let Some(tid) = tid {
            match self.request(HartIpRequest::close_session(tid)) {
                Ok(response) if response.is_valid_response() => {
                    log::debug!("session close acknowledged")
                }
                Ok(response) => log::warn!(
                    "session close answered with message type {}",
                    response.header.message_type.code()
                ),
                Err(e) => log::warn!("session close failed: {}", e),
            }
        }
        self.close();
    }

    /// Releases all waiters, clears the device list and shuts the transport.
    pub fn close(&self) {
        let released = {
            let mut state = self.shared.state.lock();
            state.session = SessionState::Disconnected;
            state.devices.clear();
            state.pending.release_all()
        };
        if released > 0 {
            log::debug!("released {} pending requests on close", released);
        }
        self.shared.transport.shutdown();
    }

    /// Session state.
    pub fn state(&self) -> SessionState {
        self.shared.state.lock().session
    }

    /// Returns whether the session is established.
    pub fn is_established(&self) -> bool {
        self.state() == SessionState::Established && !self.shared.transport.is_closed()
    }

    /// Time since the last request was sent or response matched.
    pub fn idle_time(&self) -> Duration {
        self.shared.state.lock().last_activity.elapsed()
    }

    /// Inactivity close time in effect, as granted by the server.
    pub fn inactivity_close_time(&self) -> Duration {
        Duration::from_millis(u64::from(self.shared.state.lock().close_time))
    }

    /// Number of requests waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    /// Runs `f` with the device list under the connection lock.
    pub fn with_devices<R>(&self, f: impl FnOnce(&mut DeviceList) -> R) -> R {
        f(&mut self.shared.state.lock().devices)
    }

    /// Transport kind.
    pub fn transport_kind(&self) -> TransportKind {
        self.shared.transport.kind()
    }

    /// Current destination address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.transport.peer_addr()
    }

    /// Socket timeout in effect.
    pub fn socket_timeout(&self) -> Duration {
        self.options.socket_timeout
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if !self.shared.transport.is_closed() {
            self.close();
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("transport", &self.shared.transport)
            .field("state", &self.state())
            .finish()
    }
}

/// Stop hook for the reader: it may end on an idle timeout only while no
/// request waits, and is marked stopped under the lock `send` registers under.
fn idle_stop(shared: &Arc<Shared>) -> impl Fn() -> bool + Send + 'static {
    let shared = Arc::downgrade(shared);
    move || {
        let Some(shared) = shared.upgrade() else {
            return true;
        };
        let mut state = shared.state.lock();
        if state.pending.is_empty() {
            state.reader_running = false;
            true
        } else {
            false
        }
    }
}

fn dispatch(shared: &Shared, events: &Receiver<ReaderEvent>, subscribers: &Subscribers) {
    for event in events.iter() {
        match event {
            ReaderEvent::Frame(response) => {
                shared.logger.log(&response.to_string(), false);
                if response.is_publish() {
                    subscribers.notify(&response);
                    continue;
                }

                let unmatched = {
                    let mut state = shared.state.lock();
                    state.last_activity = Instant::now();
                    state.pending.complete(response)
                };
                if let Some(response) = unmatched {
                    log::warn!(
                        "dropping response with unknown transaction id {}",
                        response.transaction_id()
                    );
                }
            }
            ReaderEvent::Malformed(err) => {
                shared.record_error(&format!("Received invalid HART-IP message: {}", err));
            }
            ReaderEvent::Stopped { fatal: false, .. } => {
                // the reader marked itself stopped; the next send restarts it
                if shared.transport.is_closed() {
                    break;
                }
            }
            ReaderEvent::Stopped { fatal: true, reason } => {
                let released = {
                    let mut state = shared.state.lock();
                    state.reader_running = false;
                    state.session = SessionState::Disconnected;
                    state.devices.clear();
                    state.pending.release_all()
                };
                if released > 0 {
                    log::debug!("released {} pending requests after reader stop", released);
                }
                if !shared.transport.is_closed() {
                    shared.record_error(&format!("HART-IP connection lost: {}", reason));
                    shared.transport.shutdown();
                }
                break;
            }
        }
    }
    log::debug!("dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{HartIpHeader, MessageId, MessageType};
    use crate::logger::tests::MemoryLog;
    use std::net::UdpSocket;

    /// UDP server answering every request with an ACK carrying `status`.
    fn udp_server(status: u8, close_time: u32) -> (SocketAddr, thread::JoinHandle<()>) {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let addr = socket.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let mut buf = [0u8; 600];
            while let Ok((n, from)) = socket.recv_from(&mut buf) {
                let Ok(header) = HartIpHeader::from_bytes(&buf[..n]) else {
                    continue;
                };
                let body = match header.message_id {
                    MessageId::SessionInitiate => {
                        let mut body = vec![1];
                        body.extend_from_slice(&close_time.to_be_bytes());
                        body
                    }
                    _ => Vec::new(),
                };
                let reply = HartIpResponse::encode(
                    MessageType::Response,
                    header.message_id,
                    status,
                    header.transaction_id,
                    &body,
                );
                let _ = socket.send_to(&reply, from);
                if header.message_id == MessageId::SessionClose {
                    break;
                }
            }
        });
        (addr, handle)
    }

    fn open(addr: SocketAddr) -> Result<Connection> {
        Connection::open(
            TransportKind::Udp,
            addr,
            SessionOptions::default(),
            Subscribers::new(),
            Arc::new(MemoryLog::default()),
            Arc::new(Mutex::new(String::new())),
        )
    }

    #[test]
    fn test_session_lifecycle() {
        let (addr, server) = udp_server(0, 300_000);
        let connection = open(addr).unwrap();

        assert!(connection.is_established());
        assert_eq!(connection.inactivity_close_time(), Duration::from_millis(300_000));
        assert_eq!(connection.keep_alive().unwrap().response_code, 0);
        assert_eq!(connection.pending_requests(), 0);

        connection.close_session();
        assert_eq!(connection.state(), SessionState::Disconnected);
        assert!(matches!(connection.keep_alive(), Err(HartError::NotConnected)));
        server.join().unwrap();
    }

    #[test]
    fn test_set_to_nearest_is_accepted() {
        let (addr, server) = udp_server(8, 600_000);
        let connection = open(addr).unwrap();
        assert!(connection.is_established());
        connection.close_session();
        server.join().unwrap();
    }

    #[test]
    fn test_rejected_session_tears_down() {
        let (addr, _server) = udp_server(15, 600_000);
        let err = open(addr).unwrap_err();
        match err {
            HartError::SessionRejected { status, description } => {
                assert_eq!(status, 15);
                assert_eq!(description, "All available sessions in use");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_no_response_to_initiate() {
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        let options = SessionOptions {
            socket_timeout: Duration::from_millis(100),
            ..SessionOptions::default()
        };
        let result = Connection::open(
            TransportKind::Udp,
            silent.local_addr().unwrap(),
            options,
            Subscribers::new(),
            Arc::new(MemoryLog::default()),
            Arc::new(Mutex::new(String::new())),
        );
        assert!(matches!(result, Err(HartError::NoResponse)));
    }

    /// Connection-oriented transport answering every request with an ACK.
    ///
    /// `receive` reports a timeout whenever one is queued in `timeouts`;
    /// with `stall_next_send` set, the next send first queues a timeout and
    /// holds its reply back until the reader has seen it.
    #[derive(Debug)]
    struct IdlingLink {
        replies_tx: crossbeam_channel::Sender<Vec<u8>>,
        replies_rx: Receiver<Vec<u8>>,
        timeouts: std::sync::atomic::AtomicUsize,
        stall_next_send: std::sync::atomic::AtomicBool,
        closed: std::sync::atomic::AtomicBool,
    }

    impl IdlingLink {
        fn new() -> Self {
            let (replies_tx, replies_rx) = unbounded();
            Self {
                replies_tx,
                replies_rx,
                timeouts: Default::default(),
                stall_next_send: Default::default(),
                closed: Default::default(),
            }
        }

        fn take_timeout(&self) -> bool {
            use std::sync::atomic::Ordering;
            self.timeouts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }
    }

    impl Transport for IdlingLink {
        fn kind(&self) -> TransportKind {
            TransportKind::Tcp
        }

        fn peer_addr(&self) -> SocketAddr {
            "127.0.0.1:5094".parse().unwrap()
        }

        fn send(&self, data: &[u8]) -> Result<()> {
            use std::sync::atomic::Ordering;
            let header = HartIpHeader::from_bytes(data)?;
            if self.stall_next_send.swap(false, Ordering::SeqCst) {
                self.timeouts.fetch_add(1, Ordering::SeqCst);
                while self.timeouts.load(Ordering::SeqCst) > 0 {
                    thread::sleep(Duration::from_millis(1));
                }
                thread::sleep(Duration::from_millis(20));
            }
            let reply = HartIpResponse::encode(
                MessageType::Response,
                header.message_id,
                0,
                header.transaction_id,
                &data[crate::header::HEADER_SIZE..],
            );
            let _ = self.replies_tx.send(reply);
            Ok(())
        }

        fn receive(&self) -> Result<Vec<u8>> {
            loop {
                if self.is_closed() {
                    return Err(HartError::ConnectionClosed);
                }
                if self.take_timeout() {
                    return Err(HartError::Timeout);
                }
                if let Ok(reply) = self.replies_rx.recv_timeout(Duration::from_millis(2)) {
                    return Ok(reply);
                }
            }
        }

        fn shutdown(&self) {
            self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
        }

        fn is_closed(&self) -> bool {
            self.closed.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    fn establish_over(link: Arc<IdlingLink>) -> Connection {
        Connection::establish(
            link,
            SessionOptions::default(),
            Subscribers::new(),
            Arc::new(MemoryLog::default()),
            Arc::new(Mutex::new(String::new())),
        )
        .unwrap()
    }

    fn reader_running(connection: &Connection) -> bool {
        connection.shared.state.lock().reader_running
    }

    #[test]
    fn test_idle_reader_restarts_on_next_send() {
        let link = Arc::new(IdlingLink::new());
        let connection = establish_over(Arc::clone(&link));
        assert!(connection.is_established());

        link.timeouts.store(1, std::sync::atomic::Ordering::SeqCst);
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while reader_running(&connection) && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        assert!(!reader_running(&connection));
        assert!(connection.is_established());

        assert_eq!(connection.keep_alive().unwrap().response_code, 0);
        assert!(reader_running(&connection));
        connection.close();
    }

    #[test]
    fn test_reader_timeout_keeps_request_in_flight() {
        let link = Arc::new(IdlingLink::new());
        let connection = establish_over(Arc::clone(&link));

        // the reader times out after the request is registered but before
        // its reply arrives
        link.stall_next_send
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let response = connection.keep_alive().unwrap();
        assert_eq!(response.header.message_id, MessageId::KeepAlive);
        assert!(reader_running(&connection));
        assert_eq!(connection.pending_requests(), 0);
        connection.close();
    }

    #[test]
    fn test_close_releases_waiters() {
        let (addr, _server) = udp_server(0, 600_000);
        let connection = open(addr).unwrap();

        // a request the server never sees, so its slot stays pending
        let mut request = HartIpRequest::keep_alive(4242);
        let slot = {
            let mut state = connection.shared.state.lock();
            state.pending.register(request.transaction_id())
        };
        request.stamp();
        assert_eq!(connection.pending_requests(), 1);

        connection.close();
        assert!(slot.is_set());
        assert!(slot.wait(Duration::from_secs(1)).is_none());
        assert_eq!(connection.pending_requests(), 0);
    }
}
