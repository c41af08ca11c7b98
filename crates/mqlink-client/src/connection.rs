//! Broker connection: handshake, receive loop, retransmission and keep-alive.
//!
//! A [`Connection`] is a cheap handle; clones share the same socket and
//! session. Two threads touch a live connection:
//! - the receive loop ([`Connection::run_loop`] or [`Connection::start_loop`])
//! - the periodic task, which resends due QoS 1/2 packets and sends PINGREQ
//!
//! Both write through one mutex-guarded write half.

use std::io::Write;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use mqlink_core::{
    decode_packet, encode_connect, encode_disconnect, encode_pingreq, ConnectOptions, HexBytes,
    Packet, PacketType, ProtocolError, QoS,
};
use parking_lot::{Mutex, RwLock};

use crate::callback::{Callbacks, MqttHandler};
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::events::ConnectionState;
use crate::session::{Outbound, Session};
use crate::timer::PeriodicTask;
use crate::transport::{Connector, FrameReader, TcpConnector, Transport};
use crate::will::Will;

/// Unanswered PINGREQs after which the broker is considered gone.
const MAX_PENDING_PINGS: u32 = 2;

/// Write side of one established socket.
struct Link {
    writer: Mutex<Box<dyn Transport>>,
    /// Handle used for shutdown, never read from or written to.
    control: Mutex<Box<dyn Transport>>,
    last_sent: Mutex<Instant>,
    keep_alive: Duration,
}

impl Link {
    fn new(stream: &dyn Transport, keep_alive: Duration) -> Result<Self> {
        Ok(Self {
            writer: Mutex::new(stream.try_clone()?),
            control: Mutex::new(stream.try_clone()?),
            last_sent: Mutex::new(Instant::now()),
            keep_alive,
        })
    }

    fn shutdown(&self) {
        if let Err(e) = self.control.lock().shutdown() {
            debug!("Socket shutdown: {}", e);
        }
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_sent.lock())
    }
}

impl Outbound for Link {
    fn send(&self, packet: &Packet) -> Result<()> {
        debug!("-> {} [{}]", packet, HexBytes(packet.raw()));
        let mut writer = self.writer.lock();
        writer.write_all(packet.raw())?;
        writer.flush()?;
        *self.last_sent.lock() = Instant::now();
        Ok(())
    }
}

/// Read side, owned by whichever thread runs the receive loop.
struct Reader {
    stream: Box<dyn Transport>,
    frames: FrameReader,
}

struct Inner {
    config: RwLock<ClientConfig>,
    connector: Box<dyn Connector>,
    state: Mutex<ConnectionState>,
    callbacks: Arc<Callbacks>,
    session: Session,
    link: RwLock<Option<Arc<Link>>>,
    reader: Mutex<Option<Reader>>,
    timer: Mutex<PeriodicTask>,
}

/// A single MQTT connection to a broker.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Create a TCP connection handle. Nothing is opened until [`connect`](Self::connect).
    pub fn new(config: ClientConfig) -> Self {
        Self::with_connector(config, Box::new(TcpConnector))
    }

    pub fn with_connector(config: ClientConfig, connector: Box<dyn Connector>) -> Self {
        let callbacks = Arc::new(Callbacks::default());
        let session = Session::new(config.retry, callbacks.clone());
        Self {
            inner: Arc::new(Inner {
                config: RwLock::new(config),
                connector,
                state: Mutex::new(ConnectionState::Disconnected),
                callbacks,
                session,
                link: RwLock::new(None),
                reader: Mutex::new(None),
                timer: Mutex::new(PeriodicTask::new("mqlink-timer")),
            }),
        }
    }

    /// Open the socket and perform the CONNECT/CONNACK handshake.
    ///
    /// `timeout` bounds both the socket connect and the wait for CONNACK.
    /// On failure the connection is left `Disconnected` and the cause is
    /// returned.
    pub fn connect(&self, timeout: Duration) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if *state != ConnectionState::Disconnected {
                return Err(ClientError::InvalidState(format!(
                    "cannot connect while {}",
                    *state
                )));
            }
            *state = ConnectionState::Connecting;
        }

        let address = self.inner.config.read().address.clone();
        match self.establish(timeout) {
            Ok(session_present) => {
                self.inner.set_state(ConnectionState::Connected);
                info!(
                    "Connected to {} (session present: {})",
                    address, session_present
                );
                if let Err(e) = self.start_timer() {
                    error!("Failed to start timer task: {}", e);
                    if let Some(link) = self.inner.link.read().clone() {
                        self.inner.connection_lost(&link, "timer task failed to start");
                    }
                    return Err(e);
                }
                self.inner.callbacks.connect(session_present);
                Ok(())
            }
            Err(e) => {
                if let Some(link) = self.inner.link.write().take() {
                    link.shutdown();
                }
                self.inner.reader.lock().take();
                self.inner.set_state(ConnectionState::Disconnected);
                match &e {
                    ClientError::ConnectionRefused(refusal) => {
                        warn!("Broker {} refused connection: {}", address, refusal)
                    }
                    other => warn!("Connect to {} failed: {}", address, other),
                }
                Err(e)
            }
        }
    }

    /// Socket, CONNECT, CONNACK. Returns the session-present flag.
    fn establish(&self, timeout: Duration) -> Result<bool> {
        let (address, options) = {
            let config = self.inner.config.read();
            (config.address.clone(), connect_options(&config))
        };
        let connect = encode_connect(&options)?;

        let mut stream = self.inner.connector.connect(&address, timeout)?;
        let link = Arc::new(Link::new(
            stream.as_ref(),
            Duration::from_secs(u64::from(options.keep_alive)),
        )?);
        *self.inner.link.write() = Some(link.clone());

        self.inner.set_state(ConnectionState::Handshaking);
        link.send(&connect)?;

        let mut frames = FrameReader::new();
        let deadline = Instant::now().checked_add(timeout).ok_or_else(|| {
            ClientError::InvalidState(format!("timeout {:?} out of range", timeout))
        })?;
        let connack = frames
            .read_frame_until(stream.as_mut(), deadline)?
            .ok_or(ClientError::ConnectionClosed)?;
        debug!("<- [{}]", HexBytes(&connack));

        let packet = decode_packet(&connack)?;
        if packet.packet_type() != PacketType::Connack {
            return Err(ProtocolError::InvalidHeader {
                expected: PacketType::Connack.base_byte(),
                actual: packet.command(),
            }
            .into());
        }

        if options.clean_session {
            self.inner.session.clear();
        }
        self.inner.session.reset_pings();
        *self.inner.reader.lock() = Some(Reader { stream, frames });
        Ok(packet.session_present())
    }

    fn start_timer(&self) -> Result<()> {
        let tick = self.inner.config.read().retry_tick;
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        self.inner.timer.lock().start(tick, move || {
            if let Some(inner) = weak.upgrade() {
                inner.on_tick(Instant::now());
            }
        })
    }

    /// Publish a message. Returns the packet identifier for QoS 1/2.
    pub fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<Option<u16>> {
        let link = self.inner.require_link("publish")?;
        self.inner
            .session
            .publish(link.as_ref(), topic, payload, qos, retain)
    }

    /// Subscribe to a single topic filter. Returns the SUBSCRIBE identifier.
    pub fn subscribe(&self, topic: &str, qos: QoS) -> Result<u16> {
        let link = self.inner.require_link("subscribe")?;
        self.inner.session.subscribe(link.as_ref(), topic, qos)
    }

    /// Set the Last Will sent with the next CONNECT.
    pub fn set_will(&self, will: Will) {
        self.inner.config.write().will = Some(will);
    }

    pub fn set_handler(&self, handler: Arc<dyn MqttHandler>) {
        self.inner.callbacks.set(handler);
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Protocol state of this connection, for inspection.
    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    /// Receive and dispatch packets on the calling thread until the
    /// connection ends.
    ///
    /// Returns `Ok(())` when the peer closes the stream or
    /// [`disconnect`](Self::disconnect) is called, and the I/O error
    /// otherwise. Malformed packets are logged and skipped.
    pub fn run_loop(&self) -> Result<()> {
        let Some(mut reader) = self.inner.reader.lock().take() else {
            return Err(ClientError::NotConnected);
        };
        let Some(link) = self.inner.link.read().clone() else {
            return Err(ClientError::NotConnected);
        };

        loop {
            if !self.inner.is_current(&link) {
                return Ok(());
            }

            let frame = match reader.frames.read_frame(&mut reader.stream) {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    self.inner.connection_lost(&link, "connection closed by peer");
                    return Ok(());
                }
                Err(ClientError::Protocol(e)) => {
                    warn!("Discarding {} buffered bytes: {}", reader.frames.buffered(), e);
                    reader.frames.clear();
                    continue;
                }
                Err(e) => {
                    if !self.inner.is_current(&link) {
                        // Socket shut down by disconnect()
                        return Ok(());
                    }
                    error!("Read failed: {}", e);
                    self.inner.connection_lost(&link, &e.to_string());
                    return Err(e);
                }
            };

            debug!("<- [{}]", HexBytes(&frame));
            let packet = match decode_packet(&frame) {
                Ok(packet) => packet,
                Err(e) => {
                    warn!("Dropping invalid packet: {}", e);
                    continue;
                }
            };

            if let Err(e) = self.inner.session.handle(link.as_ref(), packet) {
                error!("Write failed: {}", e);
                self.inner.connection_lost(&link, &e.to_string());
                return Err(e);
            }
        }
    }

    /// Run the receive loop on a new thread.
    pub fn start_loop(&self) -> Result<JoinHandle<()>> {
        let connection = self.clone();
        let handle = thread::Builder::new()
            .name("mqlink-recv".to_string())
            .spawn(move || {
                if let Err(e) = connection.run_loop() {
                    debug!("Receive loop ended: {}", e);
                }
            })?;
        Ok(handle)
    }

    /// Send DISCONNECT and close the socket. A no-op when not connected.
    ///
    /// A failed DISCONNECT write is logged and not reported; the socket is
    /// closed either way.
    pub fn disconnect(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if *state != ConnectionState::Connected {
                return Ok(());
            }
            *state = ConnectionState::Disconnected;
        }

        if let Some(link) = self.inner.link.write().take() {
            if let Err(e) = link.send(&encode_disconnect()) {
                debug!("DISCONNECT not sent: {}", e);
            }
            link.shutdown();
        }
        self.inner.timer.lock().stop();
        info!("Disconnected");
        self.inner.callbacks.disconnect(None);
        Ok(())
    }
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    fn is_connected(&self) -> bool {
        self.state.lock().is_connected()
    }

    fn require_link(&self, operation: &str) -> Result<Arc<Link>> {
        if !self.is_connected() {
            warn!("Cannot {}: not connected", operation);
            return Err(ClientError::NotConnected);
        }
        self.link.read().clone().ok_or(ClientError::NotConnected)
    }

    /// Whether `link` is the socket of the live connection.
    fn is_current(&self, link: &Arc<Link>) -> bool {
        self.is_connected()
            && self
                .link
                .read()
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, link))
    }

    /// Tear down after an unexpected end of `link`.
    ///
    /// Only the first caller does the work, so `on_disconnect` fires once. A
    /// stale link from an earlier connection is ignored.
    fn connection_lost(&self, link: &Arc<Link>, reason: &str) {
        {
            let mut state = self.state.lock();
            let mut current = self.link.write();
            let is_live = current
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, link));
            if *state != ConnectionState::Connected || !is_live {
                return;
            }
            *state = ConnectionState::Disconnected;
            current.take();
        }

        warn!("Connection lost: {}", reason);
        link.shutdown();
        self.timer.lock().stop();
        self.callbacks.disconnect(Some(reason));
    }

    fn on_tick(&self, now: Instant) {
        if !self.is_connected() {
            return;
        }
        let Some(link) = self.link.read().clone() else {
            return;
        };

        if let Err(e) = self.session.retry_due(link.as_ref(), now) {
            self.connection_lost(&link, &format!("retransmission failed: {}", e));
            return;
        }

        if link.keep_alive.is_zero() || link.idle_for(now) < link.keep_alive {
            return;
        }
        if self.session.pending_pings() >= MAX_PENDING_PINGS {
            self.connection_lost(&link, "keep-alive timeout");
            return;
        }
        match link.send(&encode_pingreq()) {
            Ok(()) => {
                self.session.ping_sent();
            }
            Err(e) => self.connection_lost(&link, &format!("PINGREQ failed: {}", e)),
        }
    }
}

fn connect_options(config: &ClientConfig) -> ConnectOptions {
    ConnectOptions {
        client_id: config.client_id.clone(),
        keep_alive: config.keep_alive,
        clean_session: config.clean_session,
        username: config.username.clone(),
        password: config.password.as_ref().map(|p| p.as_bytes().to_vec()),
        will: config.will.clone().map(Into::into),
    }
}
