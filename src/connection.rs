use crate::channel::{Channel, ChannelInner, ChannelReply, ChannelStatus};
use crate::connection_options::ConnectionOptions;
use crate::continuation::ContinuationQueue;
use crate::errors::*;
use crate::frames::{IntoAmqpClass, OutputBuffer, TryFromAmqpClass};
use crate::handshake;
use crate::heartbeat::HeartbeatSender;
use crate::ids::IdAllocator;
use crate::notifications::{NotificationBroadcaster, NotificationListener};
use crate::reader;
use crate::stream::IoStream;
use crate::topology::{RecoverEverything, TopologyRecoveryFilter, TopologyRegistry};
use crate::transport::{FrameReader, Transport};
use crate::{FieldTable, Sasl};
use amq_protocol::protocol::channel::AMQPMethod as AmqpChannel;
use amq_protocol::protocol::channel::{Open as ChannelOpen, OpenOk as ChannelOpenOk};
use amq_protocol::protocol::connection::AMQPMethod as AmqpConnection;
use amq_protocol::protocol::connection::{Close as ConnectionClose, CloseOk as ConnectionCloseOk, TuneOk};
use amq_protocol::protocol::constants::REPLY_SUCCESS;
use indexmap::IndexMap;
use log::{debug, error, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Asynchronous notifications sent by the server when it temporarily blocks a
/// connection, typically due to a resource alarm.
///
/// Use [`Connection::listen_for_connection_blocked`] to receive these.
#[derive(Debug, Clone)]
pub enum ConnectionBlockedNotification {
    /// The connection has been blocked for the given reason.
    Blocked(String),

    /// The connection has been unblocked.
    Unblocked,
}

/// Lifecycle notifications for observers that care about connection health.
///
/// These replace cross-thread exception raising: failures detected on the
/// reader thread land here (and in any blocked operation's error result)
/// instead of being thrown into an unsuspecting thread.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The transport failed. Recovery follows if it is enabled.
    NetworkFailure { message: String },

    /// A recovery pass is starting.
    RecoveryStarted,

    /// The connection is open again and topology replay finished.
    RecoveryCompleted,

    /// One recovery attempt failed; more may follow.
    RecoveryAttemptFailed { message: String },

    /// The connection is finished. No further events follow.
    Closed { message: String },
}

/// Where the connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConnectionStatus {
    /// TCP established, handshake in progress.
    Connecting,

    /// Handshake done up to tuning.
    Connected,

    /// Fully usable.
    Open,

    /// Transport lost; recovery in progress.
    Disconnected,

    /// Client-initiated close in progress.
    Closing,

    /// Finished.
    Closed,
}

/// Tuning parameters for client-local behavior.
///
/// These are not part of the AMQP spec and are never communicated to the
/// server; for protocol-negotiated settings see [`ConnectionOptions`].
#[derive(Debug, Clone)]
pub struct ConnectionTuning {
    /// How long a synchronous operation waits for its reply before failing
    /// with [`Error::ClientTimeout`]. The default is 15 seconds.
    pub continuation_timeout: Duration,

    /// Worker threads per channel running consumer callbacks. The default of
    /// 1 preserves delivery order per channel.
    pub consumer_workers_per_channel: usize,

    /// Reconnect and replay topology after a network failure. Defaults to
    /// true (only effective for connections that know how to redial, i.e.
    /// URL-opened ones).
    pub automatic_recovery: bool,

    /// Pause between recovery attempts. The default is 5 seconds.
    pub network_recovery_interval: Duration,

    /// Give up after this many failed recovery attempts; `None` retries
    /// forever. The default is `None`.
    pub recovery_attempts: Option<u32>,

    /// Also treat a server-sent `connection.close` as recoverable. Defaults
    /// to false: servers usually mean it.
    pub recover_from_connection_close: bool,
}

impl Default for ConnectionTuning {
    fn default() -> Self {
        ConnectionTuning {
            continuation_timeout: Duration::from_secs(15),
            consumer_workers_per_channel: 1,
            automatic_recovery: true,
            network_recovery_interval: Duration::from_secs(5),
            recovery_attempts: None,
            recover_from_connection_close: false,
        }
    }
}

impl ConnectionTuning {
    pub fn continuation_timeout(self, continuation_timeout: Duration) -> Self {
        ConnectionTuning {
            continuation_timeout,
            ..self
        }
    }

    pub fn consumer_workers_per_channel(self, consumer_workers_per_channel: usize) -> Self {
        ConnectionTuning {
            consumer_workers_per_channel,
            ..self
        }
    }

    pub fn automatic_recovery(self, automatic_recovery: bool) -> Self {
        ConnectionTuning {
            automatic_recovery,
            ..self
        }
    }

    pub fn network_recovery_interval(self, network_recovery_interval: Duration) -> Self {
        ConnectionTuning {
            network_recovery_interval,
            ..self
        }
    }

    pub fn recovery_attempts(self, recovery_attempts: Option<u32>) -> Self {
        ConnectionTuning {
            recovery_attempts,
            ..self
        }
    }

    pub fn recover_from_connection_close(self, recover_from_connection_close: bool) -> Self {
        ConnectionTuning {
            recover_from_connection_close,
            ..self
        }
    }
}

/// Produces a fresh byte stream for (re)connection attempts.
pub(crate) type StreamFactory = Box<dyn Fn() -> Result<Box<dyn IoStream>> + Send + Sync>;

/// A dialed, handshaken connection not yet wired into the session.
pub(crate) struct FreshConnection {
    pub(crate) transport: Arc<Transport>,
    pub(crate) reader: FrameReader,
    pub(crate) tune: TuneOk,
    pub(crate) server_properties: FieldTable,
}

/// Dial-plus-handshake, type-erased over the SASL mechanism so the recovery
/// driver can redial without being generic.
pub(crate) type Connector = Box<dyn Fn() -> Result<FreshConnection> + Send + Sync>;

pub(crate) fn connect_once<Auth: Sasl>(
    stream: Box<dyn IoStream>,
    options: &ConnectionOptions<Auth>,
) -> Result<FreshConnection> {
    let (transport, mut frame_reader) = Transport::new(stream)?;
    let outcome = handshake::run(&transport, &mut frame_reader, options)?;
    Ok(FreshConnection {
        transport: Arc::new(transport),
        reader: frame_reader,
        tune: outcome.tune,
        server_properties: outcome.server_properties,
    })
}

pub(crate) fn make_connector<Auth: Sasl + Sync>(
    factory: StreamFactory,
    options: ConnectionOptions<Auth>,
) -> Connector {
    Box::new(move || connect_once(factory()?, &options))
}

/// Shared state of one AMQP connection: the transport, the channel map, the
/// recorded topology, and the machinery that routes frames between them.
pub(crate) struct ConnectionInner {
    pub(crate) tuning: ConnectionTuning,
    status: Mutex<ConnectionStatus>,
    transport: Mutex<Option<Arc<Transport>>>,
    heartbeat: Mutex<Option<HeartbeatSender>>,
    reader_join: Mutex<Option<JoinHandle<()>>>,
    channels: Mutex<IndexMap<u16, Arc<ChannelInner>>>,
    default_channel: Mutex<Option<Arc<ChannelInner>>>,
    allocator: IdAllocator,
    negotiated: Mutex<TuneOk>,
    server_properties: Mutex<FieldTable>,
    // connection-level replies (connection.close-ok)
    pub(crate) continuation: ContinuationQueue<ChannelReply>,
    topology: TopologyRegistry,
    recovery_filter: Mutex<Arc<dyn TopologyRecoveryFilter>>,
    recovery_epoch: AtomicU64,
    pub(crate) recovery_in_progress: AtomicBool,
    pub(crate) connector: Option<Connector>,
    pub(crate) blocked: NotificationBroadcaster<ConnectionBlockedNotification>,
    pub(crate) events: NotificationBroadcaster<ConnectionEvent>,
}

impl ConnectionInner {
    fn new(
        tuning: ConnectionTuning,
        connector: Option<Connector>,
        fresh: &FreshConnection,
    ) -> ConnectionInner {
        ConnectionInner {
            tuning,
            status: Mutex::new(ConnectionStatus::Open),
            transport: Mutex::new(Some(Arc::clone(&fresh.transport))),
            heartbeat: Mutex::new(None),
            reader_join: Mutex::new(None),
            channels: Mutex::new(IndexMap::new()),
            default_channel: Mutex::new(None),
            allocator: IdAllocator::new(fresh.tune.channel_max),
            negotiated: Mutex::new(fresh.tune.clone()),
            server_properties: Mutex::new(fresh.server_properties.clone()),
            continuation: ContinuationQueue::new(),
            topology: TopologyRegistry::new(),
            recovery_filter: Mutex::new(Arc::new(RecoverEverything)),
            recovery_epoch: AtomicU64::new(0),
            recovery_in_progress: AtomicBool::new(false),
            connector,
            blocked: NotificationBroadcaster::new(),
            events: NotificationBroadcaster::new(),
        }
    }

    pub(crate) fn status(&self) -> ConnectionStatus {
        *self.status.lock().unwrap()
    }

    pub(crate) fn set_status(&self, status: ConnectionStatus) {
        *self.status.lock().unwrap() = status;
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        match self.status() {
            ConnectionStatus::Open => Ok(()),
            ConnectionStatus::Disconnected => NetworkFailureSnafu {
                message: "connection is recovering",
            }
            .fail(),
            ConnectionStatus::Closing | ConnectionStatus::Closed => {
                ClientClosedConnectionSnafu.fail()
            }
            ConnectionStatus::Connecting | ConnectionStatus::Connected => {
                ConnectionDroppedSnafu {
                    message: "connection handshake has not completed",
                }
                .fail()
            }
        }
    }

    pub(crate) fn topology(&self) -> &TopologyRegistry {
        &self.topology
    }

    pub(crate) fn recovery_filter(&self) -> Arc<dyn TopologyRecoveryFilter> {
        Arc::clone(&self.recovery_filter.lock().unwrap())
    }

    pub(crate) fn recovery_epoch(&self) -> u64 {
        self.recovery_epoch.load(Ordering::SeqCst)
    }

    pub(crate) fn frame_max(&self) -> u32 {
        self.negotiated.lock().unwrap().frame_max
    }

    pub(crate) fn continuation_timeout(&self) -> Duration {
        self.tuning.continuation_timeout
    }

    /// Write a frameset. On failure the transport is closed so the reader
    /// thread observes the same death and owns the recovery decision.
    pub(crate) fn write(&self, buf: &OutputBuffer) -> Result<()> {
        let transport = self.transport.lock().unwrap().clone();
        match transport {
            Some(transport) => match transport.write(buf) {
                Ok(()) => Ok(()),
                Err(err) => {
                    transport.close();
                    Err(err)
                }
            },
            None => ConnectionDroppedSnafu {
                message: "connection is closed",
            }
            .fail(),
        }
    }

    /// Send a method on a channel and wait for its decoded reply.
    pub(crate) fn channel_rpc<M, T>(&self, chan: &ChannelInner, method: M) -> Result<T>
    where
        M: IntoAmqpClass,
        T: TryFromAmqpClass,
    {
        chan.continuation.drain();
        let mut buf = OutputBuffer::empty();
        buf.push_method(chan.id, method)?;
        self.write(&buf)?;
        match chan
            .continuation
            .wait(Some(self.tuning.continuation_timeout))?
        {
            ChannelReply::Method(class) => T::try_from(class),
            ChannelReply::Get(_) => FrameUnexpectedSnafu.fail(),
        }
    }

    pub(crate) fn channel_by_id(&self, id: u16) -> Option<Arc<ChannelInner>> {
        self.channels.lock().unwrap().get(&id).cloned()
    }

    pub(crate) fn default_channel_inner(&self) -> Option<Arc<ChannelInner>> {
        self.default_channel.lock().unwrap().clone()
    }

    /// Channels in creation order, for recovery replay.
    pub(crate) fn channels_snapshot(&self) -> Vec<Arc<ChannelInner>> {
        self.channels.lock().unwrap().values().cloned().collect()
    }

    pub(crate) fn forget_channel(&self, id: u16) {
        self.channels.lock().unwrap().shift_remove(&id);
        self.allocator.release(id);
    }

    pub(crate) fn open_channel_inner(
        self: &Arc<Self>,
        channel_id: Option<u16>,
    ) -> Result<Arc<ChannelInner>> {
        let id = match channel_id {
            Some(id) => {
                self.allocator.reserve(id)?;
                id
            }
            None => self.allocator.allocate()?,
        };
        let chan = Arc::new(ChannelInner::new(
            id,
            self.tuning.consumer_workers_per_channel,
        ));
        self.channels.lock().unwrap().insert(id, Arc::clone(&chan));
        debug!("opening channel {}", id);
        let result: Result<ChannelOpenOk> = self.channel_rpc(
            &chan,
            AmqpChannel::Open(ChannelOpen {
                out_of_band: String::new(),
            }),
        );
        match result {
            Ok(_) => {
                chan.set_status(ChannelStatus::Open);
                Ok(chan)
            }
            Err(err) => {
                self.forget_channel(id);
                Err(err)
            }
        }
    }

    /// Swap in a freshly dialed transport during recovery: new heartbeat
    /// thread, new reader thread, bumped recovery epoch (every delivery tag
    /// minted before this moment becomes stale).
    pub(crate) fn install_transport(self: &Arc<Self>, fresh: FreshConnection) {
        *self.negotiated.lock().unwrap() = fresh.tune.clone();
        *self.server_properties.lock().unwrap() = fresh.server_properties;
        *self.transport.lock().unwrap() = Some(Arc::clone(&fresh.transport));
        self.continuation.drain();
        self.recovery_epoch.fetch_add(1, Ordering::SeqCst);
        self.start_heartbeat(&fresh.transport, fresh.tune.heartbeat);
        let join = reader::spawn(Arc::clone(self), fresh.reader, fresh.transport);
        // the previous reader thread is the one driving this recovery; its
        // handle is replaced and it exits on its own
        *self.reader_join.lock().unwrap() = Some(join);
    }

    pub(crate) fn start_heartbeat(&self, transport: &Arc<Transport>, interval: u16) {
        let mut heartbeat = self.heartbeat.lock().unwrap();
        // dropping the old sender stops it
        *heartbeat = None;
        if interval >= 1 {
            *heartbeat = Some(HeartbeatSender::start(
                Arc::clone(transport),
                Duration::from_secs(u64::from(interval)),
            ));
        }
    }

    /// Terminal failure: fail every waiter on every channel, stop the
    /// heartbeat, close the transport. Runs on the reader thread.
    pub(crate) fn terminate(&self, err: &Error) {
        {
            let mut status = self.status.lock().unwrap();
            if *status == ConnectionStatus::Closed {
                return;
            }
            *status = ConnectionStatus::Closed;
        }
        error!("connection terminated: {}", err);
        self.continuation.push_error(err.fanout());
        for chan in self.channels.lock().unwrap().values() {
            chan.fail(err);
        }
        self.channels.lock().unwrap().clear();
        *self.default_channel.lock().unwrap() = None;
        self.allocator.reset();
        if let Some(transport) = self.transport.lock().unwrap().take() {
            transport.close();
        }
        *self.heartbeat.lock().unwrap() = None;
        self.events.broadcast(ConnectionEvent::Closed {
            message: format!("{}", err),
        });
    }
}

/// A connection (session) to an AMQP server.
///
/// Owns the socket, the reader thread, the heartbeat thread, and all channels
/// multiplexed over the connection. URL-opened connections transparently
/// reconnect and replay their declared topology after a network failure; see
/// [`ConnectionTuning`] for the recovery policy knobs.
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        let _ = self.close_impl();
    }
}

impl Connection {
    /// Open a connection from an `amqp://` or `amqps://` URL with default
    /// tuning.
    pub fn open(url: &str) -> Result<Connection> {
        Connection::open_tuned(url, ConnectionTuning::default())
    }

    /// Open a connection from a URL with explicit tuning.
    pub fn open_tuned(url: &str, tuning: ConnectionTuning) -> Result<Connection> {
        amqp_url::open(url, tuning)
    }

    /// Open a connection over a caller-provided stream. Automatic recovery is
    /// unavailable: the connection has no way to redial the stream.
    pub fn open_stream<Auth: Sasl, S: IoStream>(
        stream: S,
        options: ConnectionOptions<Auth>,
        tuning: ConnectionTuning,
    ) -> Result<Connection> {
        let fresh = connect_once(Box::new(stream), &options)?;
        Connection::start(None, fresh, tuning)
    }

    pub(crate) fn start(
        connector: Option<Connector>,
        fresh: FreshConnection,
        tuning: ConnectionTuning,
    ) -> Result<Connection> {
        let heartbeat = fresh.tune.heartbeat;
        let transport = Arc::clone(&fresh.transport);
        let inner = Arc::new(ConnectionInner::new(tuning, connector, &fresh));
        let join = reader::spawn(Arc::clone(&inner), fresh.reader, Arc::clone(&transport));
        *inner.reader_join.lock().unwrap() = Some(join);
        inner.start_heartbeat(&transport, heartbeat);

        let mut connection = Connection { inner };
        // one application channel is opened up front; wrapper layers that
        // only ever need a single channel never have to manage one
        match connection.inner.open_channel_inner(None) {
            Ok(chan) => {
                *connection.inner.default_channel.lock().unwrap() = Some(chan);
                Ok(connection)
            }
            Err(err) => {
                let _ = connection.close_impl();
                Err(err)
            }
        }
    }

    /// Properties the server reported during handshake.
    pub fn server_properties(&self) -> FieldTable {
        self.inner.server_properties.lock().unwrap().clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.status()
    }

    /// The channel opened automatically when the connection was established.
    pub fn default_channel(&self) -> Result<Channel> {
        match self.inner.default_channel.lock().unwrap().as_ref() {
            Some(chan) => Ok(Channel::new(Arc::clone(chan), Arc::clone(&self.inner))),
            None => ClientClosedConnectionSnafu.fail(),
        }
    }

    /// Open a channel. `None` picks the next free channel id; `Some(id)`
    /// claims a specific one.
    pub fn open_channel(&self, channel_id: Option<u16>) -> Result<Channel> {
        self.inner.check_open()?;
        let chan = self.inner.open_channel_inner(channel_id)?;
        Ok(Channel::new(chan, Arc::clone(&self.inner)))
    }

    /// Receive resource-alarm block/unblock notifications.
    pub fn listen_for_connection_blocked(
        &self,
    ) -> NotificationListener<ConnectionBlockedNotification> {
        self.inner.blocked.register_listener()
    }

    /// Receive lifecycle events (network failures, recovery progress, final
    /// close).
    pub fn listen_for_events(&self) -> NotificationListener<ConnectionEvent> {
        self.inner.events.register_listener()
    }

    /// Replace the topology recovery filter. The default replays everything.
    pub fn set_recovery_filter(&self, filter: Arc<dyn TopologyRecoveryFilter>) {
        *self.inner.recovery_filter.lock().unwrap() = filter;
    }

    /// Cleanly close the connection: close channels, exchange
    /// `connection.close`/`close-ok`, stop the reader and heartbeat threads.
    pub fn close(mut self) -> Result<()> {
        self.close_impl()
    }

    fn close_impl(&mut self) -> Result<()> {
        {
            let mut status = self.inner.status.lock().unwrap();
            match *status {
                ConnectionStatus::Closed | ConnectionStatus::Closing => return Ok(()),
                _ => *status = ConnectionStatus::Closing,
            }
        }
        debug!("closing connection");

        self.inner.continuation.drain();
        let mut buf = OutputBuffer::empty();
        buf.push_method(
            0,
            AmqpConnection::Close(ConnectionClose {
                reply_code: REPLY_SUCCESS as u16,
                reply_text: "goodbye".to_string(),
                class_id: 0,
                method_id: 0,
            }),
        )?;
        let rpc_result = self.inner.write(&buf).and_then(|()| {
            match self
                .inner
                .continuation
                .wait(Some(self.inner.tuning.continuation_timeout))?
            {
                ChannelReply::Method(class) => {
                    ConnectionCloseOk::try_from(class).map(|_| ())
                }
                ChannelReply::Get(_) => FrameUnexpectedSnafu.fail(),
            }
        });
        if let Err(err) = &rpc_result {
            warn!("clean connection close failed: {}", err);
        }

        self.inner.set_status(ConnectionStatus::Closed);
        if let Some(transport) = self.inner.transport.lock().unwrap().take() {
            transport.close();
        }
        *self.inner.heartbeat.lock().unwrap() = None;
        let join = self.inner.reader_join.lock().unwrap().take();
        if let Some(join) = join {
            join.join().map_err(|err| Error::ReaderThreadPanic {
                message: format!("{:?}", err),
            })?;
        }

        let channels: Vec<_> = self.inner.channels.lock().unwrap().values().cloned().collect();
        for chan in channels {
            chan.finalize();
        }
        self.inner.channels.lock().unwrap().clear();
        *self.inner.default_channel.lock().unwrap() = None;
        self.inner.allocator.reset();
        self.inner.events.broadcast(ConnectionEvent::Closed {
            message: "client closed connection".to_string(),
        });
        rpc_result
    }
}

mod amqp_url {
    use super::*;
    use crate::connection_options::Heartbeat;
    use crate::transport::connect_tcp;
    use crate::Auth;
    use percent_encoding::percent_decode_str;
    use std::borrow::Cow;
    use url::Url;

    pub(super) fn open(url: &str, tuning: ConnectionTuning) -> Result<Connection> {
        let mut url = Url::parse(url).map_err(|_| Error::InvalidUrl {
            url: url.to_string(),
        })?;
        let scheme = populate_host_and_port(&mut url)?;
        let options = decode(&url)?;
        let factory = make_stream_factory(&url, scheme, options.connection_timeout)?;
        let connector = make_connector(factory, options);
        let fresh = connector()?;
        Connection::start(Some(connector), fresh, tuning)
    }

    fn invalid(url: &Url) -> Error {
        Error::InvalidUrl {
            url: url.to_string(),
        }
    }

    #[derive(Debug, PartialEq, Clone, Copy)]
    pub(super) enum Scheme {
        Amqp,
        Amqps,
    }

    fn make_stream_factory(
        url: &Url,
        scheme: Scheme,
        timeout: Option<Duration>,
    ) -> Result<StreamFactory> {
        let host = url.host_str().unwrap_or("localhost").to_string();
        // populate_host_and_port guarantees a port
        let port = url.port().expect("port populated");
        match scheme {
            Scheme::Amqp => Ok(Box::new(move || {
                let stream = connect_tcp(&host, port, timeout)?;
                Ok(Box::new(stream) as Box<dyn IoStream>)
            })),
            Scheme::Amqps => make_tls_stream_factory(host, port, timeout),
        }
    }

    #[cfg(not(feature = "native-tls"))]
    fn make_tls_stream_factory(
        _host: String,
        _port: u16,
        _timeout: Option<Duration>,
    ) -> Result<StreamFactory> {
        ConnectionDroppedSnafu {
            message: "amqps requires the native-tls feature",
        }
        .fail()
    }

    #[cfg(feature = "native-tls")]
    fn make_tls_stream_factory(
        host: String,
        port: u16,
        timeout: Option<Duration>,
    ) -> Result<StreamFactory> {
        use crate::stream::TlsConnector;
        let connector = native_tls::TlsConnector::new().map_err(|err| Error::TlsHandshake {
            message: err.to_string(),
        })?;
        Ok(Box::new(move || {
            let tcp = connect_tcp(&host, port, timeout)?;
            let connector = TlsConnector::from(connector.clone());
            let tls = connector.connect(&host, tcp)?;
            Ok(Box::new(tls) as Box<dyn IoStream>)
        }))
    }

    pub(super) fn populate_host_and_port(url: &mut Url) -> Result<Scheme> {
        if !url.has_host() || url.host_str() == Some("") {
            url.set_host(Some("localhost")).map_err(|_| invalid(url))?;
        }
        match url.scheme() {
            "amqp" => {
                url.set_port(Some(url.port().unwrap_or(5672)))
                    .map_err(|_| invalid(url))?;
                Ok(Scheme::Amqp)
            }
            "amqps" => {
                url.set_port(Some(url.port().unwrap_or(5671)))
                    .map_err(|_| invalid(url))?;
                Ok(Scheme::Amqps)
            }
            _ => Err(invalid(url)),
        }
    }

    pub(super) fn decode(url: &Url) -> Result<ConnectionOptions<Auth>> {
        fn percent_decode(s: &str) -> Cow<str> {
            percent_decode_str(s).decode_utf8_lossy()
        }
        let invalid_url = || Error::InvalidUrl {
            url: url.to_string(),
        };

        let mut options = ConnectionOptions::default();
        if let Some(mut path_segments) = url.path_segments() {
            // first unwrap guaranteed to be safe by docs for url
            let vhost = path_segments.next().unwrap();

            // rabbit docs suggest "amqp://" should have a vhost of None
            // (therefore the default vhost of "/"), but "amqp://host/" should
            // have a vhost of Some(""). The url lib cannot tell these apart,
            // so we toss out the latter and lose the ability to specify an
            // empty-string vhost.
            if vhost != "" {
                options = options.virtual_host(percent_decode(vhost));
            }

            // make sure there are no other path segments
            if path_segments.next().is_some() {
                return Err(invalid_url());
            }
        }

        if url.username() != "" || url.password().is_some() {
            let username = match url.username() {
                "" => "guest",
                other => other,
            };
            let auth = Auth::Plain {
                username: percent_decode(username).to_string(),
                password: percent_decode(url.password().unwrap_or("guest")).to_string(),
            };
            options = options.auth(auth);
        }

        for (k, v) in url.query_pairs() {
            match k.as_ref() {
                "heartbeat" => {
                    let v = v.parse::<u16>().map_err(|_| invalid_url())?;
                    options = options.heartbeat(Heartbeat::Seconds(v));
                }
                "channel_max" => {
                    let v = v.parse::<u16>().map_err(|_| invalid_url())?;
                    options = options.channel_max(v);
                }
                "connection_timeout" => {
                    let v = v.parse::<u64>().map_err(|_| invalid_url())?;
                    options = options.connection_timeout(Some(Duration::from_millis(v)));
                }
                "auth_mechanism" => {
                    if v == "external" {
                        options = options.auth(Auth::External);
                    } else {
                        return Err(invalid_url());
                    }
                }
                _ => return Err(invalid_url()),
            }
        }

        Ok(options)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn decode_s(s: &str) -> Result<ConnectionOptions<Auth>> {
            decode(&Url::parse(s).unwrap())
        }

        #[test]
        fn empty_default() {
            let options = decode_s("amqp://").unwrap();
            assert_eq!(options, ConnectionOptions::default());
            let options = decode_s("amqps://").unwrap();
            assert_eq!(options, ConnectionOptions::default());
        }

        #[test]
        fn vhost() {
            let options = decode_s("amqp:///vhost").unwrap();
            assert_eq!(options, ConnectionOptions::default().virtual_host("vhost"));
            let options = decode_s("amqp:///v%2fhost").unwrap();
            assert_eq!(options, ConnectionOptions::default().virtual_host("v/host"));
            assert!(decode_s("amqp:///vhost/nonescapedslash").is_err());
        }

        #[test]
        fn user_pass() {
            let options = decode_s("amqp://user:pass@/").unwrap();
            assert_eq!(
                options,
                ConnectionOptions::default().auth(Auth::Plain {
                    username: "user".to_string(),
                    password: "pass".to_string()
                })
            );
            let options = decode_s("amqp://user%61:pass%62@/").unwrap();
            assert_eq!(
                options,
                ConnectionOptions::default().auth(Auth::Plain {
                    username: "usera".to_string(),
                    password: "passb".to_string()
                })
            );
        }

        #[test]
        fn heartbeat() {
            let options = decode_s("amqp://?heartbeat=13").unwrap();
            assert_eq!(
                options,
                ConnectionOptions::default().heartbeat(Heartbeat::Seconds(13))
            );
        }

        #[test]
        fn channel_max() {
            let options = decode_s("amqp://?channel_max=13").unwrap();
            assert_eq!(options, ConnectionOptions::default().channel_max(13));
        }

        #[test]
        fn connection_timeout() {
            let options = decode_s("amqp://?connection_timeout=13").unwrap();
            assert_eq!(
                options,
                ConnectionOptions::default()
                    .connection_timeout(Some(Duration::from_millis(13)))
            );
        }

        #[test]
        fn auth_mechanism() {
            let options = decode_s("amqp://?auth_mechanism=external").unwrap();
            assert_eq!(options, ConnectionOptions::default().auth(Auth::External));
        }

        #[test]
        fn unknown_query_param_is_rejected() {
            assert!(decode_s("amqp://?nope=1").is_err());
        }

        #[test]
        fn populate_host() {
            let mut url = Url::parse("amqp://").unwrap();
            populate_host_and_port(&mut url).unwrap();
            assert_eq!(url.host_str(), Some("localhost"));

            let mut url = Url::parse("amqp://:35").unwrap();
            populate_host_and_port(&mut url).unwrap();
            assert_eq!(url.host_str(), Some("localhost"));

            let mut url = Url::parse("amqp://foo.com").unwrap();
            populate_host_and_port(&mut url).unwrap();
            assert_eq!(url.host_str(), Some("foo.com"));
        }

        #[test]
        fn populate_port() {
            let mut url = Url::parse("amqp://").unwrap();
            populate_host_and_port(&mut url).unwrap();
            assert_eq!(url.port(), Some(5672));

            let mut url = Url::parse("amqps://").unwrap();
            populate_host_and_port(&mut url).unwrap();
            assert_eq!(url.port(), Some(5671));

            let mut url = Url::parse("amqp://:35").unwrap();
            populate_host_and_port(&mut url).unwrap();
            assert_eq!(url.port(), Some(35));

            let mut url = Url::parse("amqps://:35").unwrap();
            populate_host_and_port(&mut url).unwrap();
            assert_eq!(url.port(), Some(35));
        }
    }
}
