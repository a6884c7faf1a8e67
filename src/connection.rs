use crate::channel::{Channel, ChannelCore, Phase};
use crate::connection_options::ConnectionOptions;
use crate::endpoints::{Endpoint, EndpointResolver, ShuffledResolver};
use crate::errors::*;
use crate::io_loop::{Channel0Handle, ChannelHandle, ConnectionTuning, IoLoop, SessionHandles};
use crate::notification_listeners::{NotificationListener, NotificationListeners};
use crate::topology::{
    RecordedEntity, RecoveryAction, TopologyRecord, TopologyRecoveryExceptionHandler,
    TopologyRecoveryFilter,
};
use crate::uri::AmqpUri;
use crate::wire::constants::{ACCESS_REFUSED, NOT_ALLOWED};
use crate::wire::method::exchange as exchange_method;
use crate::wire::method::queue as queue_method;
use crate::wire::FieldTable;
use log::{debug, info, warn};
use mio::net::TcpStream;
use snafu::{ensure, IntoError, ResultExt};
use std::net::{TcpStream as StdTcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

/// Notification that the server has blocked (e.g. memory alarm) or
/// unblocked the connection. Publishing while blocked is not paused by the
/// library; the event is surfaced and the application decides.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionBlockedNotification {
    Blocked(String),
    Unblocked,
}

/// Pluggable topology-recovery hooks: a filter deciding which recorded
/// entities are replayed, and a per-entity error handler.
#[derive(Default)]
pub struct RecoveryHooks {
    pub filter: Option<TopologyRecoveryFilter>,
    pub exception_handler: Option<TopologyRecoveryExceptionHandler>,
}

pub(crate) enum ConnState {
    Open {
        channel0: Channel0Handle,
        server_properties: FieldTable,
    },
    Recovering,
    Closed(Option<Error>),
}

pub(crate) struct ConnectionInner {
    options: ConnectionOptions,
    tuning: ConnectionTuning,
    endpoints: Vec<Endpoint>,
    resolver: Box<dyn EndpointResolver>,
    hooks: RecoveryHooks,
    topology: Mutex<TopologyRecord>,
    blocked_listeners: NotificationListeners<ConnectionBlockedNotification>,
    state: Mutex<ConnState>,
    cond: Condvar,
    channels: Mutex<Vec<Weak<ChannelCore>>>,
    user_closing: AtomicBool,
}

impl ConnectionInner {
    pub(crate) fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    pub(crate) fn topology(&self) -> MutexGuard<'_, TopologyRecord> {
        self.topology.lock().unwrap()
    }

    /// Budget an operation will wait for a rebind before surfacing the
    /// transport error: the full recovery schedule plus handshake slack.
    fn rebind_wait(&self) -> Duration {
        let per_attempt = self.options.network_recovery_interval
            + self.options.handshake_timeout
            + self.options.connection_timeout.unwrap_or_default();
        per_attempt * (self.options.max_recovery_attempts + 1) + Duration::from_secs(10)
    }

    fn live_channels(&self) -> Vec<Arc<ChannelCore>> {
        let mut channels = self.channels.lock().unwrap();
        channels.retain(|weak| weak.strong_count() > 0);
        channels.iter().filter_map(Weak::upgrade).collect()
    }

    fn establish_session(&self) -> Result<SessionHandles> {
        let connection_timeout = self.options.connection_timeout;
        let stream = self.resolver.select_one(&self.endpoints, &mut |endpoint| {
            connect_tcp(endpoint, connection_timeout)
        })?;
        let io_loop = IoLoop::new(&self.options, self.tuning.clone())?;
        io_loop.start(stream, self.options.clone(), self.blocked_listeners.clone())
    }

    fn finish_closed(&self, err: Option<Error>) {
        let channel_err = err
            .clone()
            .unwrap_or_else(|| ClientClosedConnectionSnafu.build());
        for core in self.live_channels() {
            core.fail(channel_err.clone());
        }
        let mut state = self.state.lock().unwrap();
        *state = ConnState::Closed(err);
        self.cond.notify_all();
    }

    /// Re-establish the transport and replay state after an involuntary
    /// disconnect. Returns the new I/O thread's join handle on success.
    fn recover(&self) -> Result<JoinHandle<Result<()>>> {
        {
            let mut state = self.state.lock().unwrap();
            *state = ConnState::Recovering;
            self.cond.notify_all();
        }
        let channels = self.live_channels();
        for core in &channels {
            core.mark_recovering();
        }

        let mut last_err: Option<Error> = None;
        for attempt in 1..=self.options.max_recovery_attempts {
            if self.user_closing.load(Ordering::SeqCst) {
                return ClientClosedConnectionSnafu.fail();
            }
            std::thread::sleep(self.options.network_recovery_interval);
            info!(
                "connection recovery attempt {}/{}",
                attempt, self.options.max_recovery_attempts
            );

            let mut session = match self.establish_session() {
                Ok(session) => session,
                Err(err) => {
                    if is_auth_failure(&err) {
                        return Err(err);
                    }
                    warn!("recovery attempt {} failed to connect: {}", attempt, err);
                    last_err = Some(err);
                    continue;
                }
            };

            match self.replay_topology(&mut session) {
                Ok(renames) => match self.rebind_channels(&mut session, &renames, &channels) {
                    Ok(()) => {
                        let mut state = self.state.lock().unwrap();
                        *state = ConnState::Open {
                            channel0: session.channel0,
                            server_properties: session.server_properties,
                        };
                        self.cond.notify_all();
                        info!("connection recovery succeeded");
                        return Ok(session.join_handle);
                    }
                    Err(err) => {
                        warn!("recovery attempt {} failed to rebind channels: {}", attempt, err);
                        last_err = Some(err);
                    }
                },
                Err(err @ Error::RecoveryFailed { .. }) => return Err(err),
                Err(err) => {
                    warn!("recovery attempt {} failed topology replay: {}", attempt, err);
                    last_err = Some(err);
                }
            }
        }

        let last = last_err
            .map(|err| err.to_string())
            .unwrap_or_else(|| "no attempts were made".to_string());
        RecoveryFailedSnafu {
            message: format!(
                "giving up after {} attempts ({})",
                self.options.max_recovery_attempts, last
            ),
        }
        .fail()
    }

    /// Replay recorded topology on a scratch channel:
    /// exchanges -> queues -> exchange bindings -> queue bindings, in
    /// original declaration order within each category. Returns the
    /// old-name -> new-name map for server-named queues.
    fn replay_topology(
        &self,
        session: &mut SessionHandles,
    ) -> Result<Vec<(String, String)>> {
        let mut renames = Vec::new();
        if !self.options.topology_recovery || self.topology().is_empty() {
            return Ok(renames);
        }

        let mut scratch = session.channel0.open_channel(None)?;

        let exchanges = self.topology().exchanges().to_vec();
        for exchange in &exchanges {
            if !self.passes_filter(&RecordedEntity::Exchange(exchange)) {
                continue;
            }
            self.replay_entity(&RecordedEntity::Exchange(exchange), &mut |handle| {
                let _ok: exchange_method::DeclareOk = handle.exchange_declare(
                    exchange_method::Declare {
                        ticket: 0,
                        exchange: exchange.name.clone(),
                        type_: exchange.type_.clone(),
                        passive: false,
                        durable: exchange.durable,
                        auto_delete: exchange.auto_delete,
                        internal: exchange.internal,
                        nowait: false,
                        arguments: exchange.arguments.clone(),
                    },
                    None,
                )?;
                Ok(())
            }, &mut scratch)?;
        }

        let queues = self.topology().queues().to_vec();
        for queue in &queues {
            if !self.passes_filter(&RecordedEntity::Queue(queue)) {
                continue;
            }
            let name = if queue.server_named {
                String::new()
            } else {
                queue.name.clone()
            };
            let mut declared_name = None;
            self.replay_entity(&RecordedEntity::Queue(queue), &mut |handle| {
                let declare_ok = handle.queue_declare(
                    queue_method::Declare {
                        ticket: 0,
                        queue: name.clone(),
                        passive: false,
                        durable: queue.durable,
                        exclusive: queue.exclusive,
                        auto_delete: queue.auto_delete,
                        nowait: false,
                        arguments: queue.arguments.clone(),
                    },
                    None,
                )?;
                declared_name = Some(declare_ok.queue);
                Ok(())
            }, &mut scratch)?;
            if let Some(new_name) = declared_name {
                if new_name != queue.name {
                    debug!("recovered queue {} under new name {}", queue.name, new_name);
                    self.topology().rename_queue(&queue.name, &new_name);
                    renames.push((queue.name.clone(), new_name));
                }
            }
        }

        let exchange_bindings = self.topology().exchange_bindings().to_vec();
        for binding in &exchange_bindings {
            if !self.passes_filter(&RecordedEntity::ExchangeBinding(binding)) {
                continue;
            }
            self.replay_entity(&RecordedEntity::ExchangeBinding(binding), &mut |handle| {
                let _ok: exchange_method::BindOk = handle.call(
                    exchange_method::Method::Bind(exchange_method::Bind {
                        ticket: 0,
                        destination: binding.destination.clone(),
                        source: binding.source.clone(),
                        routing_key: binding.routing_key.clone(),
                        nowait: false,
                        arguments: binding.arguments.clone(),
                    }),
                    None,
                )?;
                Ok(())
            }, &mut scratch)?;
        }

        // queue bindings are snapshotted after renames so destinations are
        // already rewritten
        let queue_bindings = self.topology().queue_bindings().to_vec();
        for binding in &queue_bindings {
            if !self.passes_filter(&RecordedEntity::QueueBinding(binding)) {
                continue;
            }
            self.replay_entity(&RecordedEntity::QueueBinding(binding), &mut |handle| {
                let _ok: queue_method::BindOk = handle.call(
                    queue_method::Method::Bind(queue_method::Bind {
                        ticket: 0,
                        queue: binding.destination.clone(),
                        exchange: binding.source.clone(),
                        routing_key: binding.routing_key.clone(),
                        nowait: false,
                        arguments: binding.arguments.clone(),
                    }),
                    None,
                )?;
                Ok(())
            }, &mut scratch)?;
        }

        let _ = scratch.close();
        Ok(renames)
    }

    fn passes_filter(&self, entity: &RecordedEntity<'_>) -> bool {
        match &self.hooks.filter {
            Some(filter) => filter(entity),
            None => true,
        }
    }

    /// Run one replay step, consulting the exception handler on failure.
    /// Non-retryable reply codes abort regardless of the handler's wishes.
    fn replay_entity(
        &self,
        entity: &RecordedEntity<'_>,
        declare: &mut dyn FnMut(&mut ChannelHandle) -> Result<()>,
        handle: &mut ChannelHandle,
    ) -> Result<()> {
        let mut retried = false;
        loop {
            let err = match declare(handle) {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };
            if is_non_retryable_replay_error(&err) {
                return RecoveryFailedSnafu {
                    message: format!("replaying {} hit a non-retryable error: {}", entity, err),
                }
                .fail();
            }
            let action = match &self.hooks.exception_handler {
                Some(handler) => handler(entity, &err),
                None => RecoveryAction::Abort,
            };
            match action {
                RecoveryAction::Skip => {
                    warn!("skipping {} during topology recovery: {}", entity, err);
                    return Ok(());
                }
                RecoveryAction::Retry if !retried => {
                    warn!("retrying {} during topology recovery: {}", entity, err);
                    retried = true;
                }
                RecoveryAction::Retry | RecoveryAction::Abort => {
                    return RecoveryFailedSnafu {
                        message: format!("replaying {} failed: {}", entity, err),
                    }
                    .fail();
                }
            }
        }
    }

    /// Give every surviving channel object a fresh channel on the new
    /// transport: new id, re-applied QoS and confirm mode, re-registered
    /// listeners and consumers (original consumer tags preserved).
    fn rebind_channels(
        &self,
        session: &mut SessionHandles,
        renames: &[(String, String)],
        channels: &[Arc<ChannelCore>],
    ) -> Result<()> {
        for core in channels {
            if !core.is_recovering() {
                continue;
            }
            let mut handle = session.channel0.open_channel(None)?;

            let mut state = core.lock();
            if let Some(qos) = state.qos {
                handle.qos(qos)?;
            }
            if state.confirms_enabled {
                handle.confirm_select()?;
            }
            if let Some(tx) = state.return_handler.clone() {
                handle.set_return_handler(Some(tx))?;
            }
            if let Some(tx) = state.confirm_handler.clone() {
                handle.set_confirm_handler(Some(tx))?;
            }
            for (tag, consumer) in state.consumers.iter_mut() {
                if let Some((_, new_name)) =
                    renames.iter().find(|(old, _)| *old == consumer.queue)
                {
                    consumer.queue = new_name.clone();
                }
                let granted_tag = handle.consume(
                    crate::wire::method::basic::Consume {
                        ticket: 0,
                        queue: consumer.queue.clone(),
                        consumer_tag: tag.clone(),
                        no_local: consumer.no_local,
                        no_ack: consumer.no_ack,
                        exclusive: consumer.exclusive,
                        nowait: false,
                        arguments: consumer.arguments.clone(),
                    },
                    consumer.sink.clone(),
                )?;
                debug!("re-registered consumer {} (granted {})", tag, granted_tag);
            }
            drop(state);
            core.rebind(Ok(handle));
        }
        Ok(())
    }
}

fn is_auth_failure(err: &Error) -> bool {
    matches!(
        err,
        Error::InvalidCredentials | Error::UnsupportedAuthMechanism { .. }
    ) || matches!(
        err,
        Error::ServerClosedConnection { code, .. } if *code == ACCESS_REFUSED || *code == NOT_ALLOWED
    )
}

fn is_non_retryable_replay_error(err: &Error) -> bool {
    matches!(
        err,
        Error::ServerClosedChannel { code, .. } if *code == ACCESS_REFUSED
    ) || matches!(err, Error::ServerClosedConnection { .. })
}

fn connect_tcp(endpoint: &Endpoint, timeout: Option<Duration>) -> Result<TcpStream> {
    ensure!(!endpoint.tls, TlsNotSupportedSnafu);

    let addrs = endpoint
        .address()
        .to_socket_addrs()
        .context(FailedToConnectSnafu)?;
    let mut last_err = None;
    for addr in addrs {
        let result = match timeout {
            Some(timeout) => StdTcpStream::connect_timeout(&addr, timeout),
            None => StdTcpStream::connect(&addr),
        };
        match result {
            Ok(stream) => {
                stream.set_nonblocking(true).context(FailedToConnectSnafu)?;
                return TcpStream::from_stream(stream).context(FailedToConnectSnafu);
            }
            Err(err) => last_err = Some(err),
        }
    }

    let err = last_err.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "hostname resolved to no addresses")
    });
    if err.kind() == std::io::ErrorKind::TimedOut {
        ConnectionTimeoutSnafu.fail()
    } else {
        Err(FailedToConnectSnafu.into_error(err))
    }
}

fn supervise(inner: Arc<ConnectionInner>, mut join_handle: JoinHandle<Result<()>>) {
    loop {
        let result = match join_handle.join() {
            Ok(result) => result,
            Err(_) => IoThreadPanicSnafu.fail(),
        };
        match result {
            Ok(()) => {
                inner.finish_closed(None);
                return;
            }
            Err(err) => {
                let voluntary = inner.user_closing.load(Ordering::SeqCst);
                if voluntary || !inner.options().automatic_recovery || !err.is_recoverable() {
                    inner.finish_closed(Some(err));
                    return;
                }
                warn!("connection failed ({}); starting automatic recovery", err);
                match inner.recover() {
                    Ok(handle) => join_handle = handle,
                    Err(recovery_err) => {
                        inner.finish_closed(Some(recovery_err));
                        return;
                    }
                }
            }
        }
    }
}

/// A connection to an AMQP server, multiplexing any number of channels
/// over one socket owned by a dedicated I/O thread.
///
/// With automatic recovery enabled (the default), involuntary transport
/// failures are healed in the background: the transport is re-dialed
/// through the endpoint resolver, recorded topology is re-declared, and
/// every [`Channel`] object is transparently rebound. Voluntary
/// [`close`](Connection::close) is never recovered.
pub struct Connection {
    inner: Arc<ConnectionInner>,
    supervisor: Option<JoinHandle<()>>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.supervisor.is_some() {
            let _ = self.close_impl();
        }
    }
}

impl Connection {
    /// Open a connection from an `amqp://` URI. TLS (`amqps://`) endpoints
    /// are not dialed by this crate.
    pub fn insecure_open(url: &str) -> Result<Connection> {
        let uri = AmqpUri::parse(url)?;
        ensure!(!uri.tls, TlsNotSupportedSnafu);

        let mut options = ConnectionOptions::default().virtual_host(uri.vhost.clone());
        if let Some(user) = &uri.user {
            options = options.auth(crate::Auth::Plain {
                username: user.clone(),
                password: uri.password.clone().unwrap_or_default(),
            });
        }
        Connection::open_with_options(options, vec![Endpoint::from(&uri)])
    }

    /// Open a connection to the first reachable endpoint of a
    /// comma-separated `host[:port]` list.
    pub fn insecure_open_list(list: &str, options: ConnectionOptions) -> Result<Connection> {
        let endpoints = crate::endpoints::parse_endpoint_list(list, false)?;
        Connection::open_with_options(options, endpoints)
    }

    /// Open a connection with explicit options and endpoints, using the
    /// default shuffling resolver.
    pub fn open_with_options(
        options: ConnectionOptions,
        endpoints: Vec<Endpoint>,
    ) -> Result<Connection> {
        Connection::open_tuned(
            options,
            ConnectionTuning::default(),
            endpoints,
            Box::new(ShuffledResolver),
            RecoveryHooks::default(),
        )
    }

    /// Open a connection with a custom endpoint resolver.
    pub fn open_with_resolver(
        options: ConnectionOptions,
        endpoints: Vec<Endpoint>,
        resolver: Box<dyn EndpointResolver>,
    ) -> Result<Connection> {
        Connection::open_tuned(
            options,
            ConnectionTuning::default(),
            endpoints,
            resolver,
            RecoveryHooks::default(),
        )
    }

    /// Fully-parameterized open: options, I/O tuning, endpoints, resolver,
    /// and topology-recovery hooks.
    pub fn open_tuned(
        options: ConnectionOptions,
        tuning: ConnectionTuning,
        endpoints: Vec<Endpoint>,
        resolver: Box<dyn EndpointResolver>,
        hooks: RecoveryHooks,
    ) -> Result<Connection> {
        ensure!(
            !endpoints.is_empty(),
            InvalidEndpointListSnafu {
                list: "",
                reason: "no endpoints supplied",
            }
        );

        let inner = Arc::new(ConnectionInner {
            options,
            tuning,
            endpoints,
            resolver,
            hooks,
            topology: Mutex::new(TopologyRecord::new()),
            blocked_listeners: NotificationListeners::new(),
            state: Mutex::new(ConnState::Recovering),
            cond: Condvar::new(),
            channels: Mutex::new(Vec::new()),
            user_closing: AtomicBool::new(false),
        });

        let session = inner.establish_session()?;
        {
            let mut state = inner.state.lock().unwrap();
            *state = ConnState::Open {
                channel0: session.channel0,
                server_properties: session.server_properties,
            };
        }

        let supervisor = std::thread::Builder::new()
            .name("coney-supervisor".to_string())
            .spawn({
                let inner = Arc::clone(&inner);
                move || supervise(inner, session.join_handle)
            })
            .context(ForkFailedSnafu)?;

        Ok(Connection {
            inner,
            supervisor: Some(supervisor),
        })
    }

    /// Open a channel, with a specific channel id or the next available
    /// one. Blocks while the connection is mid-recovery.
    pub fn open_channel(&self, channel_id: Option<u16>) -> Result<Channel> {
        let handle = {
            let mut state = self.inner.state.lock().unwrap();
            loop {
                match &mut *state {
                    ConnState::Open { channel0, .. } => break channel0.open_channel(channel_id)?,
                    ConnState::Recovering => {
                        state = self.inner.cond.wait(state).unwrap();
                    }
                    ConnState::Closed(err) => {
                        return Err(err
                            .clone()
                            .unwrap_or_else(|| ClientClosedConnectionSnafu.build()))
                    }
                }
            }
        };
        let core = Arc::new(ChannelCore::new(handle, self.inner.rebind_wait()));
        self.inner
            .channels
            .lock()
            .unwrap()
            .push(Arc::downgrade(&core));
        Ok(Channel::new(core, Arc::clone(&self.inner)))
    }

    /// Properties the server reported in its connection.start.
    pub fn server_properties(&self) -> Result<FieldTable> {
        let state = self.inner.state.lock().unwrap();
        match &*state {
            ConnState::Open {
                server_properties, ..
            } => Ok(server_properties.clone()),
            ConnState::Recovering => OperationInterruptedSnafu.fail(),
            ConnState::Closed(err) => Err(err
                .clone()
                .unwrap_or_else(|| ClientClosedConnectionSnafu.build())),
        }
    }

    /// Register a listener for connection-blocked notifications. The
    /// registration survives recovery.
    pub fn register_blocked_listener(
        &self,
    ) -> NotificationListener<ConnectionBlockedNotification> {
        self.inner.blocked_listeners.register_listener()
    }

    /// Close the connection with an orderly close handshake. Every
    /// unresolved publish-confirm handle and in-flight RPC fails with
    /// `OperationInterrupted`; consumers see a clean end of stream.
    pub fn close(mut self) -> Result<()> {
        self.close_impl()
    }

    fn close_impl(&mut self) -> Result<()> {
        self.inner.user_closing.store(true, Ordering::SeqCst);
        debug!("closing connection");

        // Mark every channel closed first so their pending ops fail
        // deterministically instead of racing the socket teardown.
        for core in self.inner.live_channels() {
            if !matches!(core.lock().phase, Phase::Closed(_)) {
                core.fail(ClientClosedConnectionSnafu.build());
            }
        }

        let close_result = {
            let mut state = self.inner.state.lock().unwrap();
            match &mut *state {
                ConnState::Open { channel0, .. } => channel0.close_connection(),
                // mid-recovery: the supervisor observes user_closing and
                // abandons; nothing to say to the server
                ConnState::Recovering => Ok(()),
                ConnState::Closed(err) => match err.clone() {
                    Some(err) => Err(err),
                    None => Ok(()),
                },
            }
        };

        if let Some(supervisor) = self.supervisor.take() {
            let _ = supervisor.join();
        }
        close_result
    }
}
