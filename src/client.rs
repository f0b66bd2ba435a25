//! High-level HART-IP client.
//!
//! [`HartClient`] ties the pieces together: it opens a [`Connection`],
//! builds command requests (tunneling them through a bridge when needed),
//! runs the Delay-Retry loop, discovers the device tree and keeps the
//! session alive.
//!
//! # Example
//!
//! ```no_run
//! use hart_ip::{ClientConfig, HartClient, TransportKind};
//! use std::time::Duration;
//!
//! let client = HartClient::new(ClientConfig::default());
//! client.connect("192.168.1.20", 5094, TransportKind::Udp, Duration::from_secs(30))?;
//!
//! client.discover_devices()?;
//! let root = client.root_device().expect("device list is filled");
//!
//! // command 48, read additional device status
//! let response = client.send_request(48, "", root.id.device_type, root.id.device_id)?;
//! println!("response code {}", response.response_code);
//!
//! client.disconnect();
//! # Ok::<(), hart_ip::HartError>(())
//! ```
//!
//! # Thread Safety
//!
//! `HartClient` is `Send + Sync`. Concurrent requests on one session are
//! matched to their responses by transaction id.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::command::{Address, CommandFrame, CMD_FLUSH_DELAYED_RESPONSES};
use crate::connection::{Connection, SessionOptions, DEFAULT_INACTIVITY_CLOSE_TIME};
use crate::correlator::{Subscribers, SubscriptionId, DEFAULT_TRANSACTION_ID_MODULUS};
use crate::decoder::ResponseDecoder;
use crate::device::{DeviceId, HartDevice};
use crate::discovery::{DiscoveryOptions, PduTransactor, TopologyDiscoverer};
use crate::error::{HartError, Result};
use crate::logger::{LogFacade, MessageLog};
use crate::message::HartIpRequest;
use crate::monitor::{evaluate, InactivityAction, InactivityMonitor, DEFAULT_MONITOR_INTERVAL};
use crate::response::HartIpResponse;
use crate::retry::{ActiveSequences, RetryEngine, RetryPolicy, RetrySender};
use crate::transport::{effective_socket_timeout, resolve_host, TransportKind, DEFAULT_SOCKET_TIMEOUT};
use crate::utils::parse_hex;

/// Configuration of a [`HartClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ClientConfig {
    /// Socket timeout, also the default wait for a response.
    pub socket_timeout: Duration,
    /// Inactivity close time requested at session initiate, in ms.
    pub inactivity_close_time: u32,
    /// Delay-Retry policy.
    pub retry: RetryPolicy,
    /// Discovery tuning.
    pub discovery: DiscoveryOptions,
    /// Transaction ids cycle through `1..=transaction_id_modulus`.
    pub transaction_id_modulus: u16,
    /// Send keep alives from the inactivity check.
    pub keep_alive: bool,
    /// Tick interval of the inactivity monitor.
    pub monitor_interval: Duration,
    /// Field layout file used to render responses in the message log.
    pub layout_path: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket_timeout: DEFAULT_SOCKET_TIMEOUT,
            inactivity_close_time: DEFAULT_INACTIVITY_CLOSE_TIME,
            retry: RetryPolicy::default(),
            discovery: DiscoveryOptions::default(),
            transaction_id_modulus: DEFAULT_TRANSACTION_ID_MODULUS,
            keep_alive: true,
            monitor_interval: DEFAULT_MONITOR_INTERVAL,
            layout_path: None,
        }
    }
}

impl ClientConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the socket timeout (default 60 seconds, never below 30).
    ///
    /// # Example
    ///
    /// ```
    /// use hart_ip::ClientConfig;
    /// use std::time::Duration;
    ///
    /// let config = ClientConfig::new().with_socket_timeout(Duration::from_secs(5));
    /// assert_eq!(config.socket_timeout, Duration::from_secs(30));
    /// ```
    pub fn with_socket_timeout(mut self, timeout: Duration) -> Self {
        self.socket_timeout = effective_socket_timeout(timeout);
        self
    }

    /// Sets the inactivity close time in ms (default 600 000).
    pub fn with_inactivity_close_time(mut self, millis: u32) -> Self {
        self.inactivity_close_time = millis;
        self
    }

    /// Sets the Delay-Retry policy.
    ///
    /// # Example
    ///
    /// ```
    /// use hart_ip::{ClientConfig, RetryPolicy};
    /// use std::time::Duration;
    ///
    /// let config = ClientConfig::new()
    ///     .with_retry_policy(RetryPolicy::new(3, Duration::from_millis(100)));
    /// assert_eq!(config.retry.retries, 3);
    /// assert_eq!(config.retry.base_delay, Duration::from_millis(500));
    /// ```
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Sets the wait per polling address during discovery (default 32 ms).
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.discovery.poll_timeout = timeout;
        self
    }

    /// Sets the last polling address tried during discovery (default 63).
    pub fn with_max_polling_address(mut self, address: u8) -> Self {
        self.discovery.max_polling_address = address;
        self
    }

    /// Sets the transaction id modulus (default 10 000).
    pub fn with_transaction_id_modulus(mut self, modulus: u16) -> Self {
        self.transaction_id_modulus = modulus;
        self
    }

    /// Enables or disables keep alives (default enabled).
    pub fn with_keep_alive(mut self, enabled: bool) -> Self {
        self.keep_alive = enabled;
        self
    }

    /// Sets the inactivity monitor interval (default 1 second).
    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }

    /// Sets the field layout file.
    pub fn with_layout_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.layout_path = Some(path.into());
        self
    }

    fn session_options(&self, socket_timeout: Duration) -> SessionOptions {
        SessionOptions {
            socket_timeout: effective_socket_timeout(socket_timeout),
            inactivity_close_time: self.inactivity_close_time,
            transaction_id_modulus: self.transaction_id_modulus,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Target {
    host: String,
    port: u16,
    kind: TransportKind,
    timeout: Duration,
}

/// HART-IP client.
pub struct HartClient {
    config: ClientConfig,
    logger: Arc<dyn MessageLog>,
    subscribers: Subscribers,
    connection: Mutex<Option<Arc<Connection>>>,
    target: Mutex<Option<Target>>,
    last_error: Arc<Mutex<String>>,
    sequences: ActiveSequences,
    decoder: Option<ResponseDecoder>,
    monitor: Mutex<Option<InactivityMonitor>>,
}

impl HartClient {
    /// Creates a client logging frames through the `log` facade.
    pub fn new(config: ClientConfig) -> Self {
        Self::with_logger(config, Arc::new(LogFacade))
    }

    /// Creates a client reporting frames and errors to `logger`.
    pub fn with_logger(config: ClientConfig, logger: Arc<dyn MessageLog>) -> Self {
        let decoder = config.layout_path.clone().map(ResponseDecoder::new);
        Self {
            config,
            logger,
            subscribers: Subscribers::new(),
            connection: Mutex::new(None),
            target: Mutex::new(None),
            last_error: Arc::new(Mutex::new(String::new())),
            sequences: ActiveSequences::new(),
            decoder,
            monitor: Mutex::new(None),
        }
    }

    /// Client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Connects to `host:port` and initiates a session.
    ///
    /// `timeout` is the socket timeout of this session, floored at 30 seconds.
    /// Returns `Ok(false)` if a session to the same target is already up.
    ///
    /// # Errors
    ///
    /// - `HartError::AlreadyConnected` if connected to another target
    /// - `HartError::Resolve` if the host cannot be resolved
    /// - transport and session errors from [`Connection::open`]
    pub fn connect(&self, host: &str, port: u16, kind: TransportKind, timeout: Duration) -> Result<bool> {
        let target = Target {
            host: host.to_string(),
            port,
            kind,
            timeout,
        };

        let stale = {
            let mut slot = self.connection.lock();
            match slot.take() {
                Some(connection) if connection.is_established() => {
                    let peer = connection.peer_addr();
                    *slot = Some(connection);
                    drop(slot);
                    return self.already_connected(&target, peer.to_string());
                }
                stale => stale,
            }
        };
        if let Some(stale) = stale {
            stale.close();
        }

        // resolving and the session initiate run without the slot lock
        self.last_error.lock().clear();
        let addr = resolve_host(host, port).map_err(|e| self.fail(e))?;
        let connection = Connection::open(
            kind,
            addr,
            self.config.session_options(timeout),
            self.subscribers.clone(),
            Arc::clone(&self.logger),
            Arc::clone(&self.last_error),
        )
        .map_err(|e| self.fail(e))?;

        {
            let mut slot = self.connection.lock();
            let winner = slot
                .as_ref()
                .filter(|c| c.is_established())
                .map(|c| c.peer_addr().to_string());
            if let Some(peer) = winner {
                drop(slot);
                log::debug!("another connect to {} won, closing this session", peer);
                connection.close_session();
                return self.already_connected(&target, peer);
            }
            *slot = Some(Arc::new(connection));
            *self.target.lock() = Some(target);
        }

        self.logger.log(
            &format!("Connected to HART-IP device {} ({}) over {}", host, addr, kind),
            true,
        );
        Ok(true)
    }

    fn already_connected(&self, target: &Target, peer: String) -> Result<bool> {
        if self.target.lock().as_ref() == Some(target) {
            return Ok(false);
        }
        Err(self.fail(HartError::AlreadyConnected(peer)))
    }

    /// Returns whether a session is established.
    pub fn is_connected(&self) -> bool {
        self.connection
            .lock()
            .as_ref()
            .is_some_and(|c| c.is_established())
    }

    /// Closes the session and the transport. Does nothing when unconnected.
    pub fn disconnect(&self) {
        let connection = self.connection.lock().take();
        if let Some(connection) = connection {
            connection.close_session();
            self.logger
                .log("Disconnected the HART-IP device network connection.", true);
        }
    }

    /// Disconnects and connects again to the last target.
    ///
    /// The device list starts empty; call [`discover_devices`](Self::discover_devices)
    /// again afterwards.
    ///
    /// # Errors
    ///
    /// Returns `HartError::NotConnected` if there was never a connection, or
    /// any error from [`connect`](Self::connect).
    pub fn reconnect(&self) -> Result<bool> {
        let target = self.target.lock().clone();
        let Some(target) = target else {
            return Err(self.fail(HartError::NotConnected));
        };
        self.logger.log("Info, Reconnecting the network...", true);
        self.disconnect();
        self.connect(&target.host, target.port, target.kind, target.timeout)
    }

    /// Sends a keep alive.
    ///
    /// # Errors
    ///
    /// Returns `HartError::NotConnected` without a session, or the request error.
    pub fn keep_alive(&self) -> Result<()> {
        let connection = self.connection()?;
        connection.keep_alive().map(|_| ()).map_err(|e| self.fail(e))
    }

    /// Registers `callback` for publish notifications.
    pub fn subscribe_publish<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&HartIpResponse) + Send + Sync + 'static,
    {
        self.subscribers.subscribe(Arc::new(callback))
    }

    /// Removes a publish subscription. Returns `false` for an unknown id.
    pub fn unsubscribe_publish(&self, id: SubscriptionId) -> bool {
        self.subscribers.unsubscribe(id)
    }

    /// Builds the request for `command` with hex `data` to the device
    /// `device_type:device_id`.
    ///
    /// A command to a device behind the bridge root is wrapped in a
    /// command 77 tunnel addressed to the root.
    ///
    /// # Errors
    ///
    /// - `HartError::NotConnected` without a session
    /// - `HartError::InvalidParameter` for malformed hex, a device missing
    ///   from the device list or a request over 255 bytes
    pub fn build_request(&self, command: u16, data: &str, device_type: u16, device_id: u32) -> Result<HartIpRequest> {
        let connection = self.connection()?;
        self.build_request_on(&connection, command, data, DeviceId::new(device_type, device_id))
            .map_err(|e| self.fail(e))
    }

    fn build_request_on(
        &self,
        connection: &Connection,
        command: u16,
        data: &str,
        target: DeviceId,
    ) -> Result<HartIpRequest> {
        let frame = CommandFrame::new(Address::Long(target), command, parse_hex(data)?);

        let frame = connection.with_devices(|devices| -> Result<CommandFrame> {
            let Some(root) = devices.root() else {
                return Ok(frame);
            };
            if !root.is_bridge() || root.id == target {
                return Ok(frame);
            }
            let device = devices.find_by_id(target).ok_or_else(|| {
                HartError::invalid_parameter("device", format!("{} is not in the device list", target))
            })?;
            CommandFrame::tunnel(root.id, device.io_card, device.channel, &frame)
        })?;

        HartIpRequest::hart_command(connection.next_transaction_id(), &frame)
    }

    /// Sends `command` with hex `data` to a device and returns its response,
    /// retrying delayed responses.
    ///
    /// A command 77 reply is unwrapped to the sub-device's response.
    ///
    /// # Errors
    ///
    /// See [`build_request`](Self::build_request) and
    /// [`send_hart_request`](Self::send_hart_request).
    pub fn send_request(&self, command: u16, data: &str, device_type: u16, device_id: u32) -> Result<HartIpResponse> {
        let request = self.build_request(command, data, device_type, device_id)?;
        let response = self.send_hart_request(&request)?;
        if !response.is_tunneled() {
            return Ok(response);
        }
        match response.unwrap_tunnel() {
            Ok(inner) => Ok(inner),
            Err(e) => {
                log::warn!("cannot unwrap command 77 reply: {}", e);
                Ok(response)
            }
        }
    }

    /// Sends a prepared request and handles delayed responses.
    ///
    /// # Errors
    ///
    /// - `HartError::NotConnected` without a session
    /// - `HartError::NoResponse` if nothing arrived in time
    /// - `HartError::RetryExhausted` or `HartError::UserAbort` from the retry loop
    pub fn send_hart_request(&self, request: &HartIpRequest) -> Result<HartIpResponse> {
        self.execute(request).map_err(|e| self.fail(e))
    }

    fn execute(&self, request: &HartIpRequest) -> Result<HartIpResponse> {
        let connection = self.connection()?;
        let sequence = self.sequences.begin();
        let first = connection.request(request.clone())?;
        let engine = RetryEngine::new(self.config.retry, sequence.handle().clone());
        let response = engine.run(self, request, first)?;
        self.log_decoded(&response);
        Ok(response)
    }

    /// Logs the rendered response, the sub-device reply for a command 77
    /// envelope.
    fn log_decoded(&self, response: &HartIpResponse) {
        let Some(decoder) = &self.decoder else {
            return;
        };
        let inner = if response.is_tunneled() {
            response.unwrap_tunnel().ok()
        } else {
            None
        };
        self.logger
            .log(&decoder.decode(inner.as_ref().unwrap_or(response)), false);
    }

    /// Aborts every retry sequence in progress, including requests whose
    /// first reply has not arrived yet.
    pub fn cancel_retries(&self) {
        let aborted = self.sequences.abort_all();
        log::debug!("abort requested for {} retry sequences", aborted);
    }

    /// Sends raw HART PDU bytes without retry handling.
    ///
    /// # Errors
    ///
    /// Returns `HartError::InvalidParameter` for a PDU over 255 bytes, or the
    /// request error.
    pub fn send_pdu(&self, pdu: Vec<u8>, timeout: Option<Duration>) -> Result<HartIpResponse> {
        let connection = self.connection()?;
        let mut request = HartIpRequest::hart_pdu(connection.next_transaction_id(), pdu)?;
        if let Some(timeout) = timeout {
            request = request.with_timeout(timeout);
        }
        connection.request(request).map_err(|e| self.fail(e))
    }

    /// Discovers the device behind the endpoint and its sub-devices.
    ///
    /// Returns the number of devices in the list. An already filled list is
    /// kept as it is.
    ///
    /// # Errors
    ///
    /// Returns `HartError::NotConnected` without a session, or
    /// `HartError::NoResponse` if no polling address answered.
    pub fn discover_devices(&self) -> Result<usize> {
        let connection = self.connection()?;
        let known = connection.with_devices(|devices| devices.len());
        if known > 0 {
            return Ok(known);
        }

        let topology = TopologyDiscoverer::new(self, self.config.discovery)
            .discover()
            .map_err(|e| self.fail(e))?;

        connection.with_devices(|devices| -> Result<usize> {
            for device in topology.devices {
                devices.push(device)?;
            }
            Ok(devices.len())
        })
    }

    /// Snapshot of the device list.
    pub fn devices(&self) -> Vec<HartDevice> {
        self.with_devices(|devices| devices.to_vec()).unwrap_or_default()
    }

    /// Device found by polling.
    pub fn root_device(&self) -> Option<HartDevice> {
        self.with_devices(|devices| devices.root().cloned()).flatten()
    }

    /// Finds a device by its 24-bit device id.
    pub fn find_device(&self, device_id: u32) -> Option<HartDevice> {
        self.with_devices(|devices| devices.iter().find(|d| d.id.device_id == device_id).cloned())
            .flatten()
    }

    /// Bridge device (gateway, I/O system or protocol bridge), if any.
    pub fn network_device(&self) -> Option<HartDevice> {
        self.with_devices(|devices| devices.network_device().cloned()).flatten()
    }

    /// Empties the device list.
    pub fn clear_devices(&self) {
        let _ = self.with_devices(|devices| devices.clear());
    }

    fn with_devices<R>(&self, f: impl FnOnce(&mut crate::device::DeviceList) -> R) -> Option<R> {
        let connection = self.connection.lock().clone()?;
        Some(connection.with_devices(f))
    }

    /// Runs one inactivity check: a keep alive at 80% of the close time,
    /// a disconnect at 90%.
    pub fn check_inactivity(&self) -> InactivityAction {
        let Some(connection) = self.connection.lock().clone() else {
            return InactivityAction::Idle;
        };
        if !connection.is_established() {
            return InactivityAction::Idle;
        }

        let action = evaluate(
            connection.idle_time(),
            connection.inactivity_close_time(),
            self.config.keep_alive,
        );
        match action {
            InactivityAction::Idle => {}
            InactivityAction::KeepAlive => {
                log::debug!("session idle for {:?}, sending keep alive", connection.idle_time());
                if let Err(e) = self.keep_alive() {
                    log::warn!("keep alive failed: {}", e);
                }
            }
            InactivityAction::Disconnect => {
                log::warn!(
                    "session idle for {:?}, closing before the server does",
                    connection.idle_time()
                );
                self.disconnect();
            }
        }
        action
    }

    /// Starts a background thread running [`check_inactivity`](Self::check_inactivity)
    /// every configured interval. The thread ends with the client.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the thread cannot be spawned.
    pub fn start_inactivity_monitor(self: &Arc<Self>) -> Result<()> {
        let client = Arc::downgrade(self);
        let monitor = InactivityMonitor::spawn(self.config.monitor_interval, move || {
            match client.upgrade() {
                Some(client) => {
                    client.check_inactivity();
                    true
                }
                None => false,
            }
        })?;
        if let Some(mut previous) = self.monitor.lock().replace(monitor) {
            previous.stop();
        }
        Ok(())
    }

    /// Stops the inactivity monitor.
    pub fn stop_inactivity_monitor(&self) {
        let monitor = self.monitor.lock().take();
        if let Some(mut monitor) = monitor {
            monitor.stop();
        }
    }

    /// Renders a response with the field layout table, if one is configured.
    pub fn decode(&self, response: &HartIpResponse) -> Option<String> {
        self.decoder.as_ref().map(|d| d.decode(response))
    }

    /// Message of the last failure, empty after a successful connect.
    pub fn last_error(&self) -> String {
        self.last_error.lock().clone()
    }

    fn connection(&self) -> Result<Arc<Connection>> {
        self.established().ok_or_else(|| self.fail(HartError::NotConnected))
    }

    /// Established connection, without recording a failure.
    fn established(&self) -> Option<Arc<Connection>> {
        self.connection
            .lock()
            .clone()
            .filter(|c| c.is_established())
    }

    fn fail(&self, err: HartError) -> HartError {
        let message = err.to_string();
        self.logger.log(&format!("Error, {}", message), true);
        *self.last_error.lock() = message;
        err
    }

    fn flush_target(&self) -> Option<DeviceId> {
        self.with_devices(|devices| {
            devices
                .network_device()
                .or_else(|| devices.root())
                .map(|d| d.id)
        })
        .flatten()
    }
}

impl RetrySender for HartClient {
    fn resend(&self, request: &HartIpRequest) -> Result<HartIpResponse> {
        let connection = self.established().ok_or(HartError::NotConnected)?;
        let retry = request.with_transaction_id(connection.next_transaction_id());
        connection.request(retry)
    }

    fn flush_delayed_responses(&self) {
        let Some(target) = self.flush_target() else {
            log::debug!("no device to flush delayed responses on");
            return;
        };
        let Some(connection) = self.established() else {
            return;
        };

        let frame = CommandFrame::new(Address::Long(target), CMD_FLUSH_DELAYED_RESPONSES, Vec::new());
        let result = HartIpRequest::hart_command(connection.next_transaction_id(), &frame)
            .and_then(|request| connection.request(request));
        match result {
            Ok(response) => log::debug!(
                "flush delayed responses on {} answered {}",
                target,
                response.response_code
            ),
            Err(e) => log::warn!("flush delayed responses on {} failed: {}", target, e),
        }
    }
}

impl PduTransactor for HartClient {
    fn transact(&self, frame: &CommandFrame, timeout: Option<Duration>) -> Result<HartIpResponse> {
        let connection = self.established().ok_or(HartError::NotConnected)?;
        let mut request = HartIpRequest::hart_command(connection.next_transaction_id(), frame)?;
        if let Some(timeout) = timeout {
            request = request.with_timeout(timeout);
        }
        let sequence = self.sequences.begin();
        let first = connection.request(request.clone())?;
        RetryEngine::new(self.config.retry, sequence.handle().clone()).run(self, &request, first)
    }
}

impl Drop for HartClient {
    fn drop(&mut self) {
        self.stop_inactivity_monitor();
        if let Some(connection) = self.connection.lock().take() {
            connection.close();
        }
    }
}

impl std::fmt::Debug for HartClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HartClient")
            .field("config", &self.config)
            .field("connection", &*self.connection.lock())
            .field("subscribers", &self.subscribers)
            .finish()
    }
}
