use bytes::{BufMut, BytesMut};
use futures::{SinkExt, StreamExt};
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::events::EventDispatcher;
use crate::core::{Error, Metadata, Result, SubscriptionInfo, Ticks};
use crate::protocol::cipher::{CipherKeySet, CipherManager, KeyIv, SymmetricCipher};
use crate::protocol::codec::{
    decode_packet_body, BaseTimes, CommandCodec, CommandFrame, DecodeContext, ResponseCodec,
    ResponseFrame,
};
use crate::protocol::message::{
    data_packet_flags, CompressionMode, OperationalModes, ServerCommand, ServerResponse,
};
use crate::protocol::{SignalIndexCache, CIPHER_SALT_LENGTH};

/// Live status of a subscriber session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No connection
    Disconnected,
    /// Command channel being established
    Connecting,
    /// Operational mode word sent, awaiting confirmation
    NegotiatingModes,
    /// Mode negotiation done, credentials configured, not yet authenticated
    Authenticating,
    /// Connected and able to subscribe
    Idle,
    /// Subscribe command sent, awaiting first data
    Subscribing,
    /// Measurement frames flowing
    Streaming,
}

/// Connection parameters for a [`Subscriber`]
#[derive(Clone)]
pub struct SubscriberConfig {
    /// Publisher command channel endpoint, `host:port`
    pub endpoint: String,
    /// Optional dedicated data channel endpoint
    pub data_channel_endpoint: Option<String>,
    /// Operational modes to negotiate
    pub modes: OperationalModes,
    /// Pluggable cipher for authentication and encrypted data packets
    pub cipher: Option<Arc<dyn SymmetricCipher>>,
    /// Pre-shared key material for the authentication exchange
    pub shared_secret: Option<KeyIv>,
    /// Authentication identifier; when set the handshake expects an
    /// authenticate step before going idle
    pub auth_id: Option<String>,
    /// Terminate the session when no frame (keep-alives included) arrives
    /// within this window; `None` disables the monitor
    pub inactivity_timeout: Option<Duration>,
}

impl SubscriberConfig {
    /// Creates a configuration for the given command channel endpoint
    pub fn new(endpoint: impl Into<String>) -> Self {
        SubscriberConfig {
            endpoint: endpoint.into(),
            data_channel_endpoint: None,
            modes: OperationalModes::default(),
            cipher: None,
            shared_secret: None,
            auth_id: None,
            inactivity_timeout: None,
        }
    }
}

/// Shared session state mutated only under one lock
struct Session {
    state: SessionState,
    cache: SignalIndexCache,
    ciphers: CipherManager,
    base_times: BaseTimes,
    include_time: bool,
    use_millisecond_resolution: bool,
    pending_requests: Vec<ServerCommand>,
    subscribed: bool,
    authenticated: bool,
    last_activity: Instant,
}

impl Session {
    fn new() -> Self {
        Session {
            state: SessionState::Connecting,
            cache: SignalIndexCache::new(),
            ciphers: CipherManager::new(),
            base_times: BaseTimes::default(),
            include_time: true,
            use_millisecond_resolution: false,
            pending_requests: Vec::new(),
            subscribed: false,
            authenticated: false,
            last_activity: Instant::now(),
        }
    }

    /// Removes a solicited command from the pending list, returning whether
    /// it was requested
    fn take_request(&mut self, command: ServerCommand) -> bool {
        if let Some(position) = self.pending_requests.iter().position(|&c| c == command) {
            self.pending_requests.remove(position);
            true
        } else {
            false
        }
    }
}

struct Shared {
    config: SubscriberConfig,
    session: Mutex<Session>,
    dispatcher: EventDispatcher,
    command_tx: mpsc::Sender<CommandFrame>,
    state_tx: watch::Sender<SessionState>,
    shutdown: CancellationToken,
    caller_disconnect: AtomicBool,
    terminated: AtomicBool,
}

impl Shared {
    fn lock_session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().expect("session lock poisoned")
    }

    fn set_state(&self, session: &mut Session, state: SessionState) {
        session.state = state;
        self.state_tx.send_replace(state);
    }
}

/// Subscriber session: owns the command channel (and optional data
/// channel), drives the handshake and subscription sequence, and emits
/// decoded measurements and lifecycle events.
///
/// A subscriber never reconnects on its own; a channel-level failure ends
/// the session and recovery belongs to [`super::Connector`].
pub struct Subscriber {
    shared: Arc<Shared>,
    state_rx: watch::Receiver<SessionState>,
    tasks: Vec<JoinHandle<()>>,
}

impl Subscriber {
    /// Opens the command channel (and data channel if configured), sends
    /// the operational mode negotiation, and starts the read loops.
    pub async fn connect(config: SubscriberConfig, dispatcher: EventDispatcher) -> Result<Self> {
        // Reject unsupported mode combinations before any socket work
        let mode_word = config.modes.to_word()?;

        let command_stream = TcpStream::connect(&config.endpoint).await?;
        debug!(endpoint = %config.endpoint, "command channel connected");

        let data_stream = match &config.data_channel_endpoint {
            Some(endpoint) => {
                let stream = TcpStream::connect(endpoint).await?;
                debug!(endpoint = %endpoint, "data channel connected");
                Some(stream)
            }
            None => None,
        };

        let (read_half, write_half) = command_stream.into_split();
        let (command_tx, command_rx) = mpsc::channel(64);
        let (state_tx, state_rx) = watch::channel(SessionState::Connecting);
        let shutdown = CancellationToken::new();

        let shared = Arc::new(Shared {
            config,
            session: Mutex::new(Session::new()),
            dispatcher,
            command_tx,
            state_tx,
            shutdown,
            caller_disconnect: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
        });

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(run_writer(
            shared.clone(),
            write_half,
            command_rx,
        )));
        tasks.push(tokio::spawn(run_read_loop(
            shared.clone(),
            read_half,
            "command",
        )));

        if let Some(stream) = data_stream {
            let (data_read, _data_write) = stream.into_split();
            tasks.push(tokio::spawn(run_read_loop(shared.clone(), data_read, "data")));
        }

        if let Some(window) = shared.config.inactivity_timeout {
            tasks.push(tokio::spawn(run_activity_monitor(shared.clone(), window)));
        }

        let subscriber = Subscriber {
            shared,
            state_rx,
            tasks,
        };

        subscriber
            .send_command(
                ServerCommand::DefineOperationalModes,
                mode_word.to_be_bytes().to_vec(),
            )
            .await?;

        {
            let mut session = subscriber.shared.lock_session();
            subscriber
                .shared
                .set_state(&mut session, SessionState::NegotiatingModes);
        }

        subscriber.shared.dispatcher.status(&format!(
            "connected to publisher at {}",
            subscriber.shared.config.endpoint
        ));

        Ok(subscriber)
    }

    /// Returns the current session state
    pub fn state(&self) -> SessionState {
        self.shared.lock_session().state
    }

    /// Returns a receiver that observes session state transitions
    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    /// Waits until the session state satisfies the predicate
    pub async fn wait_for_state(
        &self,
        predicate: impl FnMut(&SessionState) -> bool,
    ) -> Result<SessionState> {
        let mut rx = self.state_rx.clone();
        let state = rx
            .wait_for(predicate)
            .await
            .map_err(|_| Error::channel_closed("session ended"))?;
        Ok(*state)
    }

    /// Token cancelled when the session terminates for any reason
    pub fn terminated(&self) -> CancellationToken {
        self.shared.shutdown.clone()
    }

    /// Sends the salted, encrypted authentication identifier.
    ///
    /// Requires a configured cipher and pre-shared secret. A `Failed`
    /// response surfaces as an error event; the connection stays open so the
    /// caller can retry or disconnect.
    pub async fn authenticate(&self, auth_id: &str) -> Result<()> {
        {
            let session = self.shared.lock_session();
            if !matches!(
                session.state,
                SessionState::Authenticating | SessionState::Idle
            ) {
                return Err(Error::invalid_state(format!(
                    "cannot authenticate while {:?}",
                    session.state
                )));
            }
        }

        let cipher = self
            .shared
            .config
            .cipher
            .as_ref()
            .ok_or_else(|| Error::config("authentication requires a cipher"))?;
        let secret = self
            .shared
            .config
            .shared_secret
            .as_ref()
            .ok_or_else(|| Error::config("authentication requires a shared secret"))?;

        let mut plaintext = Vec::with_capacity(CIPHER_SALT_LENGTH + auth_id.len());
        plaintext.extend_from_slice(&rand::random::<[u8; CIPHER_SALT_LENGTH]>());
        plaintext.extend_from_slice(&self.shared.config.modes.encoding.encode(auth_id));

        let ciphertext = cipher.encrypt(&secret.key, &secret.iv, &plaintext)?;

        let mut payload = BytesMut::with_capacity(4 + ciphertext.len());
        payload.put_u32(ciphertext.len() as u32);
        payload.put_slice(&ciphertext);

        self.send_command(ServerCommand::Authenticate, payload.to_vec())
            .await
    }

    /// Starts a subscription, or replaces the active filter when already
    /// streaming.
    pub async fn subscribe(&self, info: &SubscriptionInfo) -> Result<()> {
        if !info.compact_format {
            return Err(Error::config(
                "only the compact measurement format is supported",
            ));
        }

        {
            let mut session = self.shared.lock_session();

            if !matches!(session.state, SessionState::Idle | SessionState::Streaming) {
                return Err(Error::invalid_state(format!(
                    "cannot subscribe while {:?}",
                    session.state
                )));
            }

            session.include_time = info.include_time;
            session.use_millisecond_resolution = info.use_millisecond_resolution;
            self.shared.set_state(&mut session, SessionState::Subscribing);
        }

        let connection_string = self
            .shared
            .config
            .modes
            .encoding
            .encode(&info.to_connection_string());

        let mut payload = BytesMut::with_capacity(5 + connection_string.len());
        payload.put_u8(data_packet_flags::COMPACT);
        payload.put_u32(connection_string.len() as u32);
        payload.put_slice(&connection_string);

        self.send_command(ServerCommand::Subscribe, payload.to_vec())
            .await
    }

    /// Stops the active subscription without closing the connection
    pub async fn unsubscribe(&self) -> Result<()> {
        self.send_command(ServerCommand::Unsubscribe, Vec::new())
            .await?;

        let mut session = self.shared.lock_session();
        session.subscribed = false;
        self.shared.set_state(&mut session, SessionState::Idle);
        Ok(())
    }

    /// Requests a new cipher key generation from the publisher
    pub async fn rotate_cipher_keys(&self) -> Result<()> {
        self.shared.lock_session().ciphers.begin_rotation();
        self.send_command(ServerCommand::RotateCipherKeys, Vec::new())
            .await
    }

    /// Changes the temporal processing interval in milliseconds
    pub async fn update_processing_interval(&self, milliseconds: i32) -> Result<()> {
        self.send_command(
            ServerCommand::UpdateProcessingInterval,
            milliseconds.to_be_bytes().to_vec(),
        )
        .await
    }

    /// Requests the latest metadata document, optionally filtered
    pub async fn refresh_metadata(&self, filter: Option<&str>) -> Result<()> {
        let payload = match filter {
            Some(filter) => self.shared.config.modes.encoding.encode(filter),
            None => Vec::new(),
        };
        self.send_command(ServerCommand::MetadataRefresh, payload)
            .await
    }

    /// Closes both channels. No connection-terminated event is raised for a
    /// caller-initiated disconnect.
    pub async fn disconnect(mut self) {
        self.shared.caller_disconnect.store(true, Ordering::SeqCst);
        terminate(&self.shared, None);

        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }

    async fn send_command(&self, command: ServerCommand, payload: Vec<u8>) -> Result<()> {
        {
            let mut session = self.shared.lock_session();
            if !session.pending_requests.contains(&command) {
                session.pending_requests.push(command);
            }
        }

        self.shared
            .command_tx
            .send(CommandFrame::new(command, payload))
            .await
            .map_err(|_| Error::channel_closed("command writer stopped"))
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.shared.caller_disconnect.store(true, Ordering::SeqCst);
        terminate(&self.shared, None);
    }
}

/// Single writer serializing all outgoing commands onto the command channel
async fn run_writer(
    shared: Arc<Shared>,
    write_half: OwnedWriteHalf,
    mut command_rx: mpsc::Receiver<CommandFrame>,
) {
    let mut framed = FramedWrite::new(write_half, CommandCodec::new());

    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            frame = command_rx.recv() => match frame {
                Some(frame) => {
                    debug!(command = ?frame.command, "sending command");

                    if let Err(err) = framed.send(frame).await {
                        terminate(&shared, Some(err));
                        break;
                    }
                }
                None => break,
            }
        }
    }
}

/// Ends the session when the publisher goes quiet for longer than the
/// configured window. Every received frame, NoOP keep-alives included,
/// counts as activity.
async fn run_activity_monitor(shared: Arc<Shared>, window: Duration) {
    let mut interval = tokio::time::interval(window / 4);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => return,
            _ = interval.tick() => {
                let last_activity = shared.lock_session().last_activity;

                if last_activity.elapsed() > window {
                    terminate(&shared, Some(Error::channel_closed(format!(
                        "publisher idle for more than {:?}",
                        window
                    ))));
                    return;
                }
            }
        }
    }
}

/// Blocking read loop for one channel; both the command and data channels
/// run one of these
async fn run_read_loop(shared: Arc<Shared>, read_half: OwnedReadHalf, channel: &'static str) {
    let mut framed = FramedRead::new(read_half, ResponseCodec::new());

    let cause = loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break None,
            frame = framed.next() => match frame {
                Some(Ok(frame)) => {
                    if let Err(err) = handle_response(&shared, frame) {
                        break Some(err);
                    }
                }
                Some(Err(err)) => break Some(err),
                None => break Some(Error::channel_closed(format!(
                    "{} channel closed by publisher",
                    channel
                ))),
            }
        }
    };

    terminate(&shared, cause);
}

/// Ends the session exactly once: marks it disconnected, stops the tasks,
/// and raises connection-terminated unless the caller asked for the close.
fn terminate(shared: &Shared, cause: Option<Error>) {
    if shared.terminated.swap(true, Ordering::SeqCst) {
        return;
    }

    {
        let mut session = shared.lock_session();
        session.ciphers.clear();
        session.subscribed = false;
        shared.set_state(&mut session, SessionState::Disconnected);
    }

    shared.shutdown.cancel();

    if !shared.caller_disconnect.load(Ordering::SeqCst) {
        warn!(cause = ?cause, "session terminated");
        shared.dispatcher.connection_terminated(cause.as_ref());
    }
}

/// Applies one response frame to the session.
///
/// Recoverable problems (malformed frames, stale indices, rejected
/// handshakes) are dispatched as error events and return `Ok`; a returned
/// error is fatal to the channel.
fn handle_response(shared: &Shared, frame: ResponseFrame) -> Result<()> {
    let dispatcher = shared.dispatcher.clone();

    shared.lock_session().last_activity = Instant::now();

    let response = match frame.response() {
        Ok(response) => response,
        Err(err) => {
            dispatcher.error(&err);
            return Ok(());
        }
    };

    match response {
        ServerResponse::NoOp => Ok(()),
        ServerResponse::Succeeded => handle_succeeded(shared, &frame),
        ServerResponse::Failed => {
            handle_failed(shared, &frame);
            Ok(())
        }
        ServerResponse::DataPacket => handle_data_packet(shared, &frame),
        ServerResponse::UpdateSignalIndexCache => {
            match SignalIndexCache::decode(&frame.payload, shared.config.modes.encoding) {
                Ok(cache) => {
                    let signal_count = cache.len();
                    shared.lock_session().cache = cache;
                    dispatcher.status(&format!(
                        "received signal index cache with {} mappings",
                        signal_count
                    ));
                }
                Err(err) => dispatcher.error(&err),
            }
            Ok(())
        }
        ServerResponse::UpdateBaseTimes => {
            match BaseTimes::decode(&frame.payload) {
                Ok(base_times) => shared.lock_session().base_times = base_times,
                Err(err) => dispatcher.error(&err),
            }
            Ok(())
        }
        ServerResponse::UpdateCipherKeys => handle_cipher_keys(shared, &frame),
        ServerResponse::DataStartTime => {
            if frame.payload.len() < 8 {
                dispatcher.error(&Error::framing("truncated data start time"));
                return Ok(());
            }

            let start_time = Ticks(i64::from_be_bytes(
                frame.payload[..8].try_into().expect("length checked"),
            ));

            {
                let mut session = shared.lock_session();
                shared.set_state(&mut session, SessionState::Streaming);
            }

            dispatcher.data_start_time(start_time);
            Ok(())
        }
        ServerResponse::ProcessingComplete => {
            {
                let mut session = shared.lock_session();
                shared.set_state(&mut session, SessionState::Idle);
            }

            let message = decode_text(shared, &frame.payload);
            dispatcher.processing_complete(&message);
            Ok(())
        }
    }
}

fn handle_succeeded(shared: &Shared, frame: &ResponseFrame) -> Result<()> {
    let dispatcher = shared.dispatcher.clone();

    let command = match frame.command() {
        Ok(command) => command,
        Err(err) => {
            dispatcher.error(&err);
            return Ok(());
        }
    };

    let solicited = shared.lock_session().take_request(command);

    if !solicited {
        debug!(command = ?command, "unsolicited success response");
    }

    match command {
        ServerCommand::DefineOperationalModes => {
            let mut session = shared.lock_session();

            if session.state == SessionState::NegotiatingModes {
                let next = if shared.config.auth_id.is_some() {
                    SessionState::Authenticating
                } else {
                    SessionState::Idle
                };
                shared.set_state(&mut session, next);
            }

            drop(session);
            dispatcher.status("operational modes accepted");
        }
        ServerCommand::Authenticate => {
            {
                let mut session = shared.lock_session();
                session.authenticated = true;
                shared.set_state(&mut session, SessionState::Idle);
            }
            dispatcher.status("authentication succeeded");
        }
        ServerCommand::Subscribe => {
            shared.lock_session().subscribed = true;
            dispatcher.status(&decode_text(shared, &frame.payload));
        }
        ServerCommand::Unsubscribe => {
            shared.lock_session().subscribed = false;
            dispatcher.status(&decode_text(shared, &frame.payload));
        }
        ServerCommand::RotateCipherKeys | ServerCommand::UpdateProcessingInterval => {
            dispatcher.status(&decode_text(shared, &frame.payload));
        }
        ServerCommand::MetadataRefresh => {
            let metadata = inflate_metadata(shared, &frame.payload);
            dispatcher.metadata(&metadata);
        }
    }

    Ok(())
}

fn handle_failed(shared: &Shared, frame: &ResponseFrame) {
    let dispatcher = shared.dispatcher.clone();
    let message = decode_text(shared, &frame.payload);

    let err = match frame.command() {
        Ok(
            command @ (ServerCommand::DefineOperationalModes | ServerCommand::Authenticate),
        ) => {
            let mut session = shared.lock_session();
            session.take_request(command);

            // Mode negotiation settles on Succeeded and Failed alike; the
            // connection stays open and the caller decides what to do with
            // the rejection
            if command == ServerCommand::DefineOperationalModes
                && session.state == SessionState::NegotiatingModes
            {
                let next = if shared.config.auth_id.is_some() {
                    SessionState::Authenticating
                } else {
                    SessionState::Idle
                };
                shared.set_state(&mut session, next);
            }

            Error::handshake_rejected(message)
        }
        Ok(command) => {
            shared.lock_session().take_request(command);
            Error::framing(format!(
                "publisher rejected {:?} command: {}",
                command, message
            ))
        }
        Err(_) => Error::framing(format!("publisher failure: {}", message)),
    };

    dispatcher.error(&err);
}

fn handle_data_packet(shared: &Shared, frame: &ResponseFrame) -> Result<()> {
    let dispatcher = shared.dispatcher.clone();

    if frame.payload.is_empty() {
        dispatcher.error(&Error::framing("empty data packet"));
        return Ok(());
    }

    let flags = frame.payload[0];
    let encrypted_body = &frame.payload[1..];

    // The decode observes one consistent cache/cipher/base-time snapshot
    // for its whole duration
    let session = shared.lock_session();

    let body;
    if session.ciphers.has_keys() {
        let cipher = shared
            .config
            .cipher
            .as_ref()
            .ok_or_else(|| Error::crypto("encrypted packet received with no cipher configured"))?;
        let cipher_index = usize::from(flags & data_packet_flags::CIPHER_INDEX != 0);
        body = session
            .ciphers
            .decrypt(cipher.as_ref(), cipher_index, encrypted_body)?;
    } else {
        body = encrypted_body.to_vec();
    }

    let ctx = DecodeContext {
        cache: &session.cache,
        base_times: session.base_times,
        include_time: session.include_time,
        use_millisecond_resolution: session.use_millisecond_resolution,
    };

    let packet = match decode_packet_body(flags, &body, &ctx) {
        Ok(packet) => packet,
        Err(err) if !err.is_fatal() => {
            drop(session);
            dispatcher.error(&err);
            return Ok(());
        }
        Err(err) => return Err(err),
    };

    drop(session);

    for err in &packet.record_errors {
        dispatcher.error(err);
    }

    if !packet.measurements.is_empty() {
        dispatcher.measurements(&packet.measurements);
    }

    Ok(())
}

fn handle_cipher_keys(shared: &Shared, frame: &ResponseFrame) -> Result<()> {
    let dispatcher = shared.dispatcher.clone();

    if frame.payload.is_empty() {
        dispatcher.error(&Error::framing("empty cipher key payload"));
        return Ok(());
    }

    // The active index byte travels outside the encrypted block
    let mut payload = vec![frame.payload[0]];

    let authenticated = shared.lock_session().authenticated;
    match (&shared.config.cipher, &shared.config.shared_secret) {
        (Some(cipher), Some(secret)) if authenticated => {
            payload.extend(cipher.decrypt(&secret.key, &secret.iv, &frame.payload[1..])?);
        }
        _ => payload.extend_from_slice(&frame.payload[1..]),
    }

    match CipherKeySet::decode(&payload) {
        Ok(keys) => {
            shared.lock_session().ciphers.apply(keys);
            dispatcher.status("established new cipher keys for data packet transmissions");
        }
        Err(err) => dispatcher.error(&err),
    }

    Ok(())
}

fn decode_text(shared: &Shared, payload: &[u8]) -> String {
    shared
        .config
        .modes
        .encoding
        .decode(payload)
        .unwrap_or_else(|_| String::from_utf8_lossy(payload).into_owned())
}

fn inflate_metadata(shared: &Shared, payload: &[u8]) -> Metadata {
    let modes = shared.config.modes;

    if modes.compress_metadata && modes.compression == CompressionMode::Gzip {
        let mut decoder = flate2::read::GzDecoder::new(payload);
        let mut inflated = Vec::new();

        match decoder.read_to_end(&mut inflated) {
            Ok(_) => match String::from_utf8(inflated) {
                Ok(text) => Metadata::Xml(text),
                Err(_) => Metadata::Compressed(payload.to_vec()),
            },
            Err(_) => Metadata::Compressed(payload.to_vec()),
        }
    } else {
        match shared.config.modes.encoding.decode(payload) {
            Ok(text) => Metadata::Xml(text),
            Err(_) => Metadata::Compressed(payload.to_vec()),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use bytes::Bytes;
    use tokio::net::TcpListener;

    /// Routes `tracing` output through the test harness capture
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    /// One accepted publisher-side connection speaking the wire protocol
    pub struct MockPublisher {
        pub commands: FramedRead<OwnedReadHalf, CommandCodec>,
        pub responses: FramedWrite<OwnedWriteHalf, ResponseCodec>,
    }

    impl MockPublisher {
        pub async fn accept(listener: &TcpListener) -> Self {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, write_half) = stream.into_split();
            MockPublisher {
                commands: FramedRead::new(read_half, CommandCodec::new()),
                responses: FramedWrite::new(write_half, ResponseCodec::new()),
            }
        }

        /// Reads the next command frame
        pub async fn expect_command(&mut self, command: ServerCommand) -> Bytes {
            let frame = self.commands.next().await.unwrap().unwrap();
            assert_eq!(frame.command, command);
            frame.payload
        }

        /// Sends a response frame
        pub async fn respond(
            &mut self,
            response: ServerResponse,
            in_response_to: ServerCommand,
            payload: impl Into<Bytes>,
        ) {
            self.responses
                .send(ResponseFrame {
                    code: response as u8,
                    in_response_to: in_response_to as u8,
                    payload: payload.into(),
                })
                .await
                .unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::MockPublisher;
    use super::*;
    use crate::core::{Measurement, MeasurementKey};
    use crate::protocol::codec::{encode_data_packet, EncodeContext};
    use crate::protocol::message::{mode_bits, OperationalEncoding};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_test::assert_ok;
    use tokio::time::timeout;
    use uuid::Uuid;

    #[derive(Default)]
    struct Collector {
        measurements: Mutex<Vec<Measurement>>,
        errors: Mutex<Vec<String>>,
        terminations: Mutex<Vec<Option<String>>>,
        completions: Mutex<Vec<String>>,
        start_times: Mutex<Vec<Ticks>>,
    }

    impl super::super::events::SubscriberListener for Collector {
        fn on_measurements(&self, measurements: &[Measurement]) {
            self.measurements
                .lock()
                .unwrap()
                .extend_from_slice(measurements);
        }

        fn on_error(&self, error: &Error) {
            self.errors.lock().unwrap().push(error.to_string());
        }

        fn on_connection_terminated(&self, cause: Option<&Error>) {
            self.terminations
                .lock()
                .unwrap()
                .push(cause.map(|e| e.to_string()));
        }

        fn on_processing_complete(&self, message: &str) {
            self.completions.lock().unwrap().push(message.to_string());
        }

        fn on_data_start_time(&self, start_time: Ticks) {
            self.start_times.lock().unwrap().push(start_time);
        }
    }

    async fn connect_pair() -> (Subscriber, MockPublisher, Arc<Collector>) {
        super::test_support::init_tracing();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();

        let collector = Arc::new(Collector::default());
        let dispatcher = EventDispatcher::new();
        dispatcher.register(collector.clone());

        let connect = Subscriber::connect(SubscriberConfig::new(endpoint), dispatcher);
        let accept = MockPublisher::accept(&listener);

        let (subscriber, publisher) = tokio::join!(connect, accept);
        (subscriber.unwrap(), publisher, collector)
    }

    fn sample_cache() -> SignalIndexCache {
        let entries = (1u16..=2)
            .map(|i| {
                (
                    i,
                    MeasurementKey::new(Uuid::new_v4(), "PPA", i as u32).unwrap(),
                )
            })
            .collect::<Vec<_>>();
        SignalIndexCache::from_entries(Uuid::new_v4(), entries).unwrap()
    }

    #[tokio::test]
    async fn test_handshake_subscribe_and_stream() {
        let (subscriber, mut publisher, collector) = connect_pair().await;

        // Mode negotiation arrives first and always carries the common
        // serialization format bit
        let payload = publisher
            .expect_command(ServerCommand::DefineOperationalModes)
            .await;
        let word = u32::from_be_bytes(payload[..4].try_into().unwrap());
        assert_ne!(word & mode_bits::USE_COMMON_SERIALIZATION_FORMAT, 0);
        assert_eq!(subscriber.state(), SessionState::NegotiatingModes);

        publisher
            .respond(
                ServerResponse::Succeeded,
                ServerCommand::DefineOperationalModes,
                &b"modes accepted"[..],
            )
            .await;

        timeout(
            Duration::from_secs(1),
            subscriber.wait_for_state(|s| *s == SessionState::Idle),
        )
        .await
        .unwrap()
        .unwrap();

        // Subscribe with a frequency filter
        let info = SubscriptionInfo::new("FILTER ActiveMeasurements WHERE SignalType='FREQ'");
        subscriber.subscribe(&info).await.unwrap();
        assert_eq!(subscriber.state(), SessionState::Subscribing);

        let payload = publisher.expect_command(ServerCommand::Subscribe).await;
        assert_eq!(payload[0], data_packet_flags::COMPACT);
        let length = u32::from_be_bytes(payload[1..5].try_into().unwrap()) as usize;
        let connection_string = std::str::from_utf8(&payload[5..5 + length]).unwrap();
        assert!(connection_string.contains("SignalType='FREQ'"));

        // Cache and base times may arrive in either order before data
        let cache = sample_cache();
        let base = Ticks::from_unix_seconds(1_700_000_000);
        let base_times = BaseTimes {
            offsets: [base.0, 0],
            active_index: 0,
        };

        publisher
            .respond(
                ServerResponse::UpdateBaseTimes,
                ServerCommand::Subscribe,
                base_times.encode(),
            )
            .await;
        publisher
            .respond(
                ServerResponse::UpdateSignalIndexCache,
                ServerCommand::Subscribe,
                cache.encode(OperationalEncoding::Utf8),
            )
            .await;
        publisher
            .respond(
                ServerResponse::Succeeded,
                ServerCommand::Subscribe,
                &b"subscribed"[..],
            )
            .await;
        publisher
            .respond(
                ServerResponse::DataStartTime,
                ServerCommand::Subscribe,
                base.0.to_be_bytes().to_vec(),
            )
            .await;

        timeout(
            Duration::from_secs(1),
            subscriber.wait_for_state(|s| *s == SessionState::Streaming),
        )
        .await
        .unwrap()
        .unwrap();

        // Stream one packet
        let measurements: Vec<Measurement> = (1u16..=2)
            .map(|i| {
                Measurement::new(
                    cache.key_for(i).unwrap(),
                    59.9 + i as f64 / 10.0,
                    Ticks(base.0 + i as i64 * 100_000),
                    0,
                )
            })
            .collect();

        let packet = encode_data_packet(
            &measurements,
            &EncodeContext {
                cache: &cache,
                base_times,
                include_time: true,
                use_millisecond_resolution: false,
            },
        )
        .unwrap();

        publisher
            .respond(ServerResponse::DataPacket, ServerCommand::Subscribe, packet)
            .await;

        // Temporal replay completion returns the session to idle
        publisher
            .respond(
                ServerResponse::ProcessingComplete,
                ServerCommand::Subscribe,
                &b"replay complete"[..],
            )
            .await;

        timeout(
            Duration::from_secs(1),
            subscriber.wait_for_state(|s| *s == SessionState::Idle),
        )
        .await
        .unwrap()
        .unwrap();

        let received = collector.measurements.lock().unwrap().clone();
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].signal_id, measurements[0].signal_id);
        assert_eq!(received[1].timestamp, measurements[1].timestamp);

        assert_eq!(collector.start_times.lock().unwrap().as_slice(), &[base]);
        assert_eq!(
            collector.completions.lock().unwrap().as_slice(),
            &["replay complete".to_string()]
        );
        assert!(collector.errors.lock().unwrap().is_empty());

        subscriber.disconnect().await;
        assert!(collector.terminations.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mode_rejection_keeps_connection_open() {
        let (subscriber, mut publisher, collector) = connect_pair().await;

        publisher
            .expect_command(ServerCommand::DefineOperationalModes)
            .await;
        publisher
            .respond(
                ServerResponse::Failed,
                ServerCommand::DefineOperationalModes,
                &b"unsupported version"[..],
            )
            .await;

        // NoOP keep-alives produce no event
        publisher
            .respond(
                ServerResponse::NoOp,
                ServerCommand::DefineOperationalModes,
                &b""[..],
            )
            .await;

        // Negotiation settled despite the rejection: with no credentials
        // configured the session becomes idle and the caller decides
        timeout(
            Duration::from_secs(1),
            subscriber.wait_for_state(|s| *s == SessionState::Idle),
        )
        .await
        .unwrap()
        .unwrap();

        let errors = collector.errors.lock().unwrap().clone();
        assert!(errors[0].contains("Handshake rejected"));

        // The session is still alive: no termination was raised, and a
        // subscribe is accepted locally
        assert!(collector.terminations.lock().unwrap().is_empty());
        let info = SubscriptionInfo::new("FILTER ActiveMeasurements WHERE True");
        assert_ok!(subscriber.subscribe(&info).await);

        subscriber.disconnect().await;
    }

    #[tokio::test]
    async fn test_mode_rejection_with_credentials_awaits_authentication() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();

        let mut config = SubscriberConfig::new(endpoint);
        config.auth_id = Some("node-7".to_string());

        let connect = Subscriber::connect(config, EventDispatcher::new());
        let accept = MockPublisher::accept(&listener);
        let (subscriber, mut publisher) = tokio::join!(connect, accept);
        let subscriber = subscriber.unwrap();

        publisher
            .expect_command(ServerCommand::DefineOperationalModes)
            .await;
        publisher
            .respond(
                ServerResponse::Failed,
                ServerCommand::DefineOperationalModes,
                &b"version not offered"[..],
            )
            .await;

        timeout(
            Duration::from_secs(1),
            subscriber.wait_for_state(|s| *s == SessionState::Authenticating),
        )
        .await
        .unwrap()
        .unwrap();

        subscriber.disconnect().await;
    }

    #[tokio::test]
    async fn test_keepalives_defer_inactivity_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();

        let collector = Arc::new(Collector::default());
        let dispatcher = EventDispatcher::new();
        dispatcher.register(collector.clone());

        let mut config = SubscriberConfig::new(endpoint);
        config.inactivity_timeout = Some(Duration::from_millis(200));

        let connect = Subscriber::connect(config, dispatcher);
        let accept = MockPublisher::accept(&listener);
        let (subscriber, mut publisher) = tokio::join!(connect, accept);
        let subscriber = subscriber.unwrap();

        publisher
            .expect_command(ServerCommand::DefineOperationalModes)
            .await;
        publisher
            .respond(
                ServerResponse::Succeeded,
                ServerCommand::DefineOperationalModes,
                &b"ok"[..],
            )
            .await;

        // Keep-alives well past the window keep the session alive
        for _ in 0..6 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            publisher
                .respond(
                    ServerResponse::NoOp,
                    ServerCommand::DefineOperationalModes,
                    &b""[..],
                )
                .await;
        }
        assert!(!subscriber.terminated().is_cancelled());

        // Silence longer than the window ends the session
        timeout(Duration::from_secs(2), subscriber.terminated().cancelled())
            .await
            .unwrap();

        let terminations = collector.terminations.lock().unwrap().clone();
        assert_eq!(terminations.len(), 1);
        assert!(terminations[0].as_ref().unwrap().contains("idle"));
        drop(publisher);
    }

    #[tokio::test]
    async fn test_publisher_eof_raises_termination() {
        let (subscriber, mut publisher, collector) = connect_pair().await;

        publisher
            .expect_command(ServerCommand::DefineOperationalModes)
            .await;

        drop(publisher);

        timeout(Duration::from_secs(1), subscriber.terminated().cancelled())
            .await
            .unwrap();

        let terminations = collector.terminations.lock().unwrap().clone();
        assert_eq!(terminations.len(), 1);
        assert!(terminations[0].as_ref().unwrap().contains("closed"));
        assert_eq!(subscriber.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_subscribe_requires_idle_or_streaming() {
        let (subscriber, mut publisher, _collector) = connect_pair().await;

        publisher
            .expect_command(ServerCommand::DefineOperationalModes)
            .await;

        // Still negotiating: subscribe is rejected locally
        let info = SubscriptionInfo::new("FILTER ActiveMeasurements WHERE SignalType='FREQ'");
        let err = subscriber.subscribe(&info).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));

        subscriber.disconnect().await;
    }

    #[tokio::test]
    async fn test_cipher_key_rotation_applies_atomically() {
        use crate::protocol::cipher::test_support::{encode_key_set, sample_pair, XorCipher};

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();

        let collector = Arc::new(Collector::default());
        let dispatcher = EventDispatcher::new();
        dispatcher.register(collector.clone());

        let mut config = SubscriberConfig::new(endpoint);
        config.cipher = Some(Arc::new(XorCipher));

        let connect = Subscriber::connect(config, dispatcher);
        let accept = MockPublisher::accept(&listener);
        let (subscriber, mut publisher) = tokio::join!(connect, accept);
        let subscriber = subscriber.unwrap();

        publisher
            .expect_command(ServerCommand::DefineOperationalModes)
            .await;
        publisher
            .respond(
                ServerResponse::Succeeded,
                ServerCommand::DefineOperationalModes,
                &b"ok"[..],
            )
            .await;
        subscriber
            .wait_for_state(|s| *s == SessionState::Idle)
            .await
            .unwrap();

        subscriber.rotate_cipher_keys().await.unwrap();
        publisher
            .expect_command(ServerCommand::RotateCipherKeys)
            .await;

        let even = sample_pair(0x42);
        let odd = sample_pair(0x43);
        publisher
            .respond(
                ServerResponse::UpdateCipherKeys,
                ServerCommand::RotateCipherKeys,
                encode_key_set(0, &even, &odd),
            )
            .await;

        // After the keys apply, an encrypted data packet decodes cleanly
        let cache = sample_cache();
        subscriber
            .wait_for_state(|s| *s == SessionState::Idle)
            .await
            .unwrap();

        // Give the key update a moment to land, then push cache + packet
        timeout(Duration::from_secs(1), async {
            loop {
                let session = subscriber.shared.lock_session();
                if session.ciphers.has_keys() {
                    break;
                }
                drop(session);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        publisher
            .respond(
                ServerResponse::UpdateSignalIndexCache,
                ServerCommand::Subscribe,
                cache.encode(OperationalEncoding::Utf8),
            )
            .await;

        let measurement = Measurement::new(
            cache.key_for(1).unwrap(),
            1.25,
            Ticks::from_unix_seconds(1_700_000_000),
            0,
        );
        let plain_packet = encode_data_packet(
            std::slice::from_ref(&measurement),
            &EncodeContext {
                cache: &cache,
                base_times: BaseTimes::default(),
                include_time: true,
                use_millisecond_resolution: false,
            },
        )
        .unwrap();

        // Encrypt everything after the flags byte with the even pair
        let cipher = XorCipher;
        let mut encrypted = vec![plain_packet[0]];
        encrypted.extend(
            cipher
                .encrypt(&even.key, &even.iv, &plain_packet[1..])
                .unwrap(),
        );

        publisher
            .respond(
                ServerResponse::DataPacket,
                ServerCommand::Subscribe,
                encrypted,
            )
            .await;

        timeout(Duration::from_secs(1), async {
            loop {
                if !collector.measurements.lock().unwrap().is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let received = collector.measurements.lock().unwrap().clone();
        assert_eq!(received[0].signal_id, measurement.signal_id);
        assert!((received[0].value - 1.25).abs() < 1e-6);
        assert!(collector.errors.lock().unwrap().is_empty());

        subscriber.disconnect().await;
    }
}
