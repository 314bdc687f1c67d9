//! The node coordinator (spec §4.4): registries, the two connection pools,
//! and the single poll loop that drives every connection's state machine.
//!
//! This is the one module allowed to see both a [`crate::header::Header`]
//! and the registries, because matching a handshake against a publisher,
//! subscriber, service provider, or service caller needs both. Per-role I/O
//! mechanics stay in [`crate::conn`]; this module only decodes headers,
//! looks entries up, and tells a `Conn` what to do next.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use mio::net::TcpListener as MioTcpListener;
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, warn};

use crate::conn::{self, service_client, service_server, topic_client, topic_server, RawSocket};
use crate::error::{ConnError, Error, HandshakeError};
use crate::{safe_assert, safe_panic};
use crate::header::{self, Key};
use crate::registry::{
    Index, Publisher, PublisherCallback, ServiceCaller, ServiceCallerCallback, ServiceProvider,
    ServiceProviderCallback, Slots, Subscriber, SubscriberCallback,
};
use crate::time::{Clock, Millis, Repeater};
use crate::wire;

/// Whether a publication header's `topic` field (when present) is checked
/// against the subscriber being matched. Resolves spec §9 Open Question 1:
/// the wire format doesn't require publishers to send `topic` back, so a
/// strict check would reject legitimate peers that omit it. `Compat` matches
/// the source's behavior (ignore `topic` entirely on this leg); `Strict`
/// additionally rejects a mismatched `topic` when the peer does send one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchStrictness {
    Compat,
    Strict,
}

#[derive(Debug, Clone, Copy)]
pub struct NodeConfig {
    pub tcpros_pool_capacity: usize,
    pub rpcros_pool_capacity: usize,
    pub inactivity_timeout: Duration,
    pub reconnect_interval: Duration,
    pub max_buffer_bytes: usize,
    pub socket_buf_bytes: Option<usize>,
    pub match_strictness: MatchStrictness,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            tcpros_pool_capacity: 256,
            rpcros_pool_capacity: 256,
            inactivity_timeout: Duration::from_secs(5),
            reconnect_interval: Duration::from_secs(2),
            max_buffer_bytes: 16 * 1024 * 1024,
            socket_buf_bytes: None,
            match_strictness: MatchStrictness::Compat,
        }
    }
}

impl NodeConfig {
    pub fn with_tcpros_pool_capacity(mut self, n: usize) -> Self {
        self.tcpros_pool_capacity = n;
        self
    }

    pub fn with_rpcros_pool_capacity(mut self, n: usize) -> Self {
        self.rpcros_pool_capacity = n;
        self
    }

    pub fn with_inactivity_timeout(mut self, d: Duration) -> Self {
        self.inactivity_timeout = d;
        self
    }

    pub fn with_reconnect_interval(mut self, d: Duration) -> Self {
        self.reconnect_interval = d;
        self
    }

    pub fn with_max_buffer_bytes(mut self, n: usize) -> Self {
        self.max_buffer_bytes = n;
        self
    }

    /// Sets kernel `SO_SNDBUF`/`SO_RCVBUF` on every socket this node opens or
    /// accepts (outbound and inbound alike).
    pub fn with_socket_buf_size(mut self, n: usize) -> Self {
        self.socket_buf_bytes = Some(n);
        self
    }

    pub fn with_match_strictness(mut self, s: MatchStrictness) -> Self {
        self.match_strictness = s;
        self
    }
}

enum TcprosConn {
    Server(topic_server::Conn),
    Client(topic_client::Conn),
}

enum RpcrosConn {
    Server(service_server::Conn),
    Client(service_client::Conn),
}

enum ReconnectKind {
    Subscriber(Index),
    ServiceCaller(Index),
}

struct PendingReconnect {
    kind: ReconnectKind,
    addr: SocketAddr,
    wake_ms: Millis,
}

/// Owns the `mio::Poll`, the four registries, and the two connection pools
/// (spec §4.4). Single-threaded, non-blocking, driven entirely by
/// [`Node::poll_once`] / [`Node::start`] — no internal threads or async
/// tasks, matching the source's cooperative event loop.
pub struct Node {
    poll: Poll,
    events: Events,
    clock: Clock,
    cfg: NodeConfig,
    callerid: String,

    publishers: Slots<Publisher>,
    subscribers: Slots<Subscriber>,
    service_providers: Slots<ServiceProvider>,
    service_callers: Slots<ServiceCaller>,

    tcpros_listener: Option<MioTcpListener>,
    rpcros_listener: Option<MioTcpListener>,
    tcpros_conns: Slots<TcprosConn>,
    rpcros_conns: Slots<RpcrosConn>,

    reconnects: Vec<PendingReconnect>,
    worst_error: Option<Error>,
}

impl Node {
    const TCPROS_LISTENER_TOKEN: Token = Token(usize::MAX - 1);
    const RPCROS_LISTENER_TOKEN: Token = Token(usize::MAX - 2);

    fn tcpros_token(idx: Index) -> Token {
        Token(idx * 2)
    }

    fn rpcros_token(idx: Index) -> Token {
        Token(idx * 2 + 1)
    }

    pub fn new(callerid: impl Into<String>, cfg: NodeConfig) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(256),
            clock: Clock::new(),
            cfg,
            callerid: callerid.into(),
            publishers: Slots::new(),
            subscribers: Slots::new(),
            service_providers: Slots::new(),
            service_callers: Slots::new(),
            tcpros_listener: None,
            rpcros_listener: None,
            tcpros_conns: Slots::new(),
            rpcros_conns: Slots::new(),
            reconnects: Vec::new(),
            worst_error: None,
        })
    }

    /// Binds the TCPROS listener (inbound subscribers). Returns the bound
    /// address so the caller can advertise it out-of-band (XML-RPC, static
    /// config, whatever the collaborator contract happens to be — spec §5
    /// External Interfaces leaves peer discovery to the caller).
    pub fn listen_tcpros(&mut self, addr: SocketAddr) -> io::Result<SocketAddr> {
        let mut listener = MioTcpListener::bind(addr)?;
        self.poll.registry().register(&mut listener, Self::TCPROS_LISTENER_TOKEN, Interest::READABLE)?;
        let bound = listener.local_addr()?;
        self.tcpros_listener = Some(listener);
        Ok(bound)
    }

    /// Binds the RPCROS listener (inbound service calls).
    pub fn listen_rpcros(&mut self, addr: SocketAddr) -> io::Result<SocketAddr> {
        let mut listener = MioTcpListener::bind(addr)?;
        self.poll.registry().register(&mut listener, Self::RPCROS_LISTENER_TOKEN, Interest::READABLE)?;
        let bound = listener.local_addr()?;
        self.rpcros_listener = Some(listener);
        Ok(bound)
    }

    // ---- registration ----------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn register_publisher(
        &mut self,
        topic: impl Into<String>,
        msg_type: impl Into<String>,
        md5sum: impl Into<String>,
        message_definition: impl Into<String>,
        tick_period: Duration,
        latching: bool,
        callback: PublisherCallback,
    ) -> Result<Index, Error> {
        let topic = topic.into();
        if self.publishers.iter().any(|(_, p)| p.topic == topic) {
            return Err(Error::AlreadyRegistered(topic));
        }
        Ok(self.publishers.insert(Publisher {
            topic,
            msg_type: msg_type.into(),
            md5sum: md5sum.into(),
            message_definition: message_definition.into(),
            latching,
            ticker: Repeater::every(tick_period),
            callback,
            queue: Default::default(),
            bound_connections: Vec::new(),
        }))
    }

    pub fn register_subscriber(
        &mut self,
        topic: impl Into<String>,
        msg_type: impl Into<String>,
        md5sum: impl Into<String>,
        delivery_queue_cap: usize,
        callback: SubscriberCallback,
    ) -> Index {
        self.subscribers.insert(Subscriber {
            topic: topic.into(),
            msg_type: msg_type.into(),
            md5sum: md5sum.into(),
            callback,
            delivery_queue_cap,
            delivery_queue_len: 0,
            msg_queue_overflow: false,
            bound_connections: Vec::new(),
            known_endpoints: Vec::new(),
        })
    }

    pub fn register_service_provider(
        &mut self,
        service: impl Into<String>,
        msg_type: impl Into<String>,
        request_type: impl Into<String>,
        response_type: impl Into<String>,
        md5sum: impl Into<String>,
        callback: ServiceProviderCallback,
    ) -> Result<Index, Error> {
        let service = service.into();
        if self.service_providers.iter().any(|(_, p)| p.service == service) {
            return Err(Error::AlreadyRegistered(service));
        }
        Ok(self.service_providers.insert(ServiceProvider {
            service,
            msg_type: msg_type.into(),
            request_type: request_type.into(),
            response_type: response_type.into(),
            md5sum: md5sum.into(),
            callback,
            bound_connections: Vec::new(),
        }))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn register_service_caller(
        &mut self,
        service: impl Into<String>,
        msg_type: impl Into<String>,
        request_type: impl Into<String>,
        response_type: impl Into<String>,
        md5sum: impl Into<String>,
        tick_period: Duration,
        persistent: bool,
        callback: ServiceCallerCallback,
    ) -> Index {
        self.service_callers.insert(ServiceCaller {
            service: service.into(),
            msg_type: msg_type.into(),
            request_type: request_type.into(),
            response_type: response_type.into(),
            md5sum: md5sum.into(),
            persistent,
            ticker: Repeater::every(tick_period),
            callback,
            bound_connection: None,
            known_endpoint: None,
        })
    }

    pub fn unregister_publisher(&mut self, idx: Index) -> Result<(), Error> {
        let publisher = self.publishers.remove(idx).ok_or(Error::UnknownRegistration)?;
        for conn_idx in publisher.bound_connections {
            self.close_topic_server(conn_idx, None);
        }
        Ok(())
    }

    pub fn unregister_subscriber(&mut self, idx: Index) -> Result<(), Error> {
        let subscriber = self.subscribers.remove(idx).ok_or(Error::UnknownRegistration)?;
        for conn_idx in subscriber.bound_connections {
            self.close_topic_client(conn_idx, None);
        }
        self.reconnects.retain(|r| !matches!(r.kind, ReconnectKind::Subscriber(i) if i == idx));
        Ok(())
    }

    pub fn unregister_service_provider(&mut self, idx: Index) -> Result<(), Error> {
        let provider = self.service_providers.remove(idx).ok_or(Error::UnknownRegistration)?;
        for conn_idx in provider.bound_connections {
            self.close_service_server(conn_idx, None);
        }
        Ok(())
    }

    pub fn unregister_service_caller(&mut self, idx: Index) -> Result<(), Error> {
        let caller = self.service_callers.remove(idx).ok_or(Error::UnknownRegistration)?;
        if let Some(conn_idx) = caller.bound_connection {
            self.close_service_client(conn_idx, None);
        }
        self.reconnects.retain(|r| !matches!(r.kind, ReconnectKind::ServiceCaller(i) if i == idx));
        Ok(())
    }

    /// Initiates an outbound TCPROS connection for an already-registered
    /// subscriber. Called directly once a publisher's `(host, port)` is
    /// known, or by [`Self::maybe_reconnect`] after a prior attempt failed.
    pub fn connect_subscriber(&mut self, sub_idx: Index, addr: SocketAddr) -> Result<(), Error> {
        if self.subscribers.get(sub_idx).is_none() {
            return Err(Error::UnknownRegistration);
        }
        if self.tcpros_conns.len() >= self.cfg.tcpros_pool_capacity {
            return Err(ConnError::PoolAtCapacity(self.cfg.tcpros_pool_capacity).into());
        }
        let stream = conn::connect_nonblocking(addr).map_err(ConnError::ConnectFailed)?;
        let sock = RawSocket::new(stream, Some(addr), self.cfg.max_buffer_bytes, self.cfg.socket_buf_bytes);
        let now_ms = self.clock.now_ms();
        let mut c = topic_client::Conn::new(sock, now_ms);
        c.bound = Some(sub_idx);
        let idx = self.tcpros_conns.insert(TcprosConn::Client(c));
        let token = Self::tcpros_token(idx);
        if let Some(TcprosConn::Client(conn)) = self.tcpros_conns.get_mut(idx) {
            conn.socket_mut().register_connecting(self.poll.registry(), token).map_err(ConnError::Io)?;
        }
        if let Some(subscriber) = self.subscribers.get_mut(sub_idx) {
            subscriber.bound_connections.push(idx);
            if !subscriber.known_endpoints.contains(&addr) {
                subscriber.known_endpoints.push(addr);
            }
        }
        Ok(())
    }

    /// Initiates an outbound RPCROS connection for an already-registered
    /// service caller.
    pub fn connect_service_caller(&mut self, caller_idx: Index, addr: SocketAddr) -> Result<(), Error> {
        if self.service_callers.get(caller_idx).is_none() {
            return Err(Error::UnknownRegistration);
        }
        if self.rpcros_conns.len() >= self.cfg.rpcros_pool_capacity {
            return Err(ConnError::PoolAtCapacity(self.cfg.rpcros_pool_capacity).into());
        }
        let stream = conn::connect_nonblocking(addr).map_err(ConnError::ConnectFailed)?;
        let sock = RawSocket::new(stream, Some(addr), self.cfg.max_buffer_bytes, self.cfg.socket_buf_bytes);
        let now_ms = self.clock.now_ms();
        let mut c = service_client::Conn::new(sock, now_ms);
        c.bound = Some(caller_idx);
        let idx = self.rpcros_conns.insert(RpcrosConn::Client(c));
        let token = Self::rpcros_token(idx);
        if let Some(RpcrosConn::Client(conn)) = self.rpcros_conns.get_mut(idx) {
            conn.socket_mut().register_connecting(self.poll.registry(), token).map_err(ConnError::Io)?;
        }
        if let Some(caller) = self.service_callers.get_mut(caller_idx) {
            caller.bound_connection = Some(idx);
            caller.known_endpoint = Some(addr);
        }
        Ok(())
    }

    // ---- the event loop ---------------------------------------------------

    /// Runs [`Self::poll_once`] until `exit_flag` is set or `timeout`
    /// elapses, then returns the worst [`Error`] observed across the run, if
    /// any (spec §7: individual connection failures don't stop the loop, but
    /// the caller should learn about them).
    pub fn start(&mut self, exit_flag: &AtomicBool, timeout: Duration) -> Result<(), Error> {
        let deadline_ms = self.clock.now_ms().saturating_add(timeout.as_millis() as Millis);
        while !exit_flag.load(Ordering::Relaxed) && self.clock.now_ms() < deadline_ms {
            self.poll_once();
        }
        match self.worst_error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Takes the worst [`Error`] observed since the last call to this method
    /// or to [`Self::start`], without running the poll loop. Lets a caller
    /// driving [`Self::poll_once`] directly (e.g. to interleave several
    /// nodes in one thread) observe the same aggregated error `start` would
    /// have returned.
    pub fn take_error(&mut self) -> Option<Error> {
        self.worst_error.take()
    }

    /// Number of messages still queued (including a partially-transmitted
    /// head) for a registered publisher. `None` if `idx` is not a live
    /// publisher.
    pub fn publisher_queue_len(&self, idx: Index) -> Option<usize> {
        self.publishers.get(idx).map(|p| p.queue.len())
    }

    /// One iteration of the loop: a single non-blocking `mio::Poll::poll`
    /// call (spec §4.4's "suspension occurs at exactly one point per cycle"),
    /// followed by dispatch, timeout sweep, and periodic ticks.
    pub fn poll_once(&mut self) {
        let now_ms = self.clock.now_ms();
        self.maybe_reconnect(now_ms);

        if let Err(e) = self.poll.poll(&mut self.events, Some(Duration::ZERO)) {
            safe_panic!("mio poll failed: {e}");
            return;
        }

        let tokens: Vec<Token> = self.events.iter().map(|e| e.token()).collect();
        for token in tokens {
            self.handle_event(token, now_ms);
        }

        self.check_timeouts(now_ms);
        self.tick_publishers(now_ms);
        self.tick_service_callers(now_ms);
    }

    /// Tears down every registration and closes both listeners. Leaves the
    /// `Node` empty but reusable for fresh registrations.
    pub fn destroy(&mut self) {
        let pub_idxs: Vec<Index> = self.publishers.iter().map(|(i, _)| i).collect();
        for idx in pub_idxs {
            let _ = self.unregister_publisher(idx);
        }
        let sub_idxs: Vec<Index> = self.subscribers.iter().map(|(i, _)| i).collect();
        for idx in sub_idxs {
            let _ = self.unregister_subscriber(idx);
        }
        let svc_idxs: Vec<Index> = self.service_providers.iter().map(|(i, _)| i).collect();
        for idx in svc_idxs {
            let _ = self.unregister_service_provider(idx);
        }
        let caller_idxs: Vec<Index> = self.service_callers.iter().map(|(i, _)| i).collect();
        for idx in caller_idxs {
            let _ = self.unregister_service_caller(idx);
        }
        if let Some(mut l) = self.tcpros_listener.take() {
            let _ = self.poll.registry().deregister(&mut l);
        }
        if let Some(mut l) = self.rpcros_listener.take() {
            let _ = self.poll.registry().deregister(&mut l);
        }
    }

    fn record_error(&mut self, err: Error) {
        let worse = match &self.worst_error {
            Some(existing) => err.severity() > existing.severity(),
            None => true,
        };
        if worse {
            self.worst_error = Some(err);
        }
    }

    fn handle_event(&mut self, token: Token, now_ms: Millis) {
        if token == Self::TCPROS_LISTENER_TOKEN {
            self.accept_tcpros(now_ms);
            return;
        }
        if token == Self::RPCROS_LISTENER_TOKEN {
            self.accept_rpcros(now_ms);
            return;
        }
        let idx = token.0 / 2;
        if token.0 % 2 == 0 {
            self.drive_topic(idx, now_ms);
        } else {
            self.drive_service(idx, now_ms);
        }
    }

    fn accept_tcpros(&mut self, now_ms: Millis) {
        loop {
            let accepted = match &self.tcpros_listener {
                Some(listener) => listener.accept(),
                None => return,
            };
            match accepted {
                Ok((stream, addr)) => {
                    if self.tcpros_conns.len() >= self.cfg.tcpros_pool_capacity {
                        warn!(%addr, "tcpros pool at capacity, rejecting connection");
                        continue;
                    }
                    let sock = RawSocket::new(stream, Some(addr), self.cfg.max_buffer_bytes, self.cfg.socket_buf_bytes);
                    let idx = self.tcpros_conns.insert(TcprosConn::Server(topic_server::Conn::new(sock, now_ms)));
                    let token = Self::tcpros_token(idx);
                    if let Some(TcprosConn::Server(conn)) = self.tcpros_conns.get_mut(idx) {
                        if let Err(e) = conn.socket_mut().register(self.poll.registry(), token) {
                            warn!(?e, "failed to register accepted tcpros connection");
                            self.tcpros_conns.remove(idx);
                        }
                    }
                    debug!(%addr, idx, "accepted tcpros connection");
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    warn!(?e, "tcpros accept error");
                    return;
                }
            }
        }
    }

    fn accept_rpcros(&mut self, now_ms: Millis) {
        loop {
            let accepted = match &self.rpcros_listener {
                Some(listener) => listener.accept(),
                None => return,
            };
            match accepted {
                Ok((stream, addr)) => {
                    if self.rpcros_conns.len() >= self.cfg.rpcros_pool_capacity {
                        warn!(%addr, "rpcros pool at capacity, rejecting connection");
                        continue;
                    }
                    let sock = RawSocket::new(stream, Some(addr), self.cfg.max_buffer_bytes, self.cfg.socket_buf_bytes);
                    let idx = self.rpcros_conns.insert(RpcrosConn::Server(service_server::Conn::new(sock, now_ms)));
                    let token = Self::rpcros_token(idx);
                    if let Some(RpcrosConn::Server(conn)) = self.rpcros_conns.get_mut(idx) {
                        if let Err(e) = conn.socket_mut().register(self.poll.registry(), token) {
                            warn!(?e, "failed to register accepted rpcros connection");
                            self.rpcros_conns.remove(idx);
                        }
                    }
                    debug!(%addr, idx, "accepted rpcros connection");
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    warn!(?e, "rpcros accept error");
                    return;
                }
            }
        }
    }

    // ---- TCPROS pool --------------------------------------------------

    fn drive_topic(&mut self, idx: Index, now_ms: Millis) {
        match self.tcpros_conns.get(idx) {
            Some(TcprosConn::Server(_)) => self.drive_topic_server(idx, now_ms),
            Some(TcprosConn::Client(_)) => self.drive_topic_client(idx, now_ms),
            None => {}
        }
    }

    fn drive_topic_server(&mut self, idx: Index, now_ms: Millis) {
        let token = Self::tcpros_token(idx);
        loop {
            let Some(TcprosConn::Server(conn)) = self.tcpros_conns.get_mut(idx) else { return };
            match conn.state() {
                topic_server::State::ReadingHeaderSize | topic_server::State::ReadingHeader => match conn.poll_header(now_ms) {
                    Ok(Some(body)) => match self.handle_subscription_header(idx, &body, now_ms) {
                        Ok(()) => continue,
                        Err(e) => {
                            self.close_topic_server(idx, Some(e));
                            return;
                        }
                    },
                    Ok(None) => return,
                    Err(e) => {
                        self.close_topic_server(idx, Some(Error::Conn(e)));
                        return;
                    }
                },
                topic_server::State::WritingHeader => match conn.poll_write(self.poll.registry(), token) {
                    Ok(true) => {
                        conn.finish_header_write(now_ms);
                        continue;
                    }
                    Ok(false) => return,
                    Err(e) => {
                        self.close_topic_server(idx, Some(Error::Conn(e)));
                        return;
                    }
                },
                topic_server::State::WaitForWriting => {
                    if !conn.send_now {
                        return;
                    }
                    let Some(frame) = self.pop_publisher_frame_for(idx) else { return };
                    if let Some(TcprosConn::Server(conn)) = self.tcpros_conns.get_mut(idx) {
                        conn.begin_writing_payload(self.poll.registry(), token, frame, now_ms);
                    }
                    continue;
                }
                topic_server::State::Writing => match conn.poll_write(self.poll.registry(), token) {
                    Ok(true) => {
                        conn.finish_payload_write(now_ms);
                        self.on_publisher_frame_transmitted(idx);
                        continue;
                    }
                    Ok(false) => return,
                    Err(e) => {
                        self.close_topic_server(idx, Some(Error::Conn(e)));
                        return;
                    }
                },
            }
        }
    }

    fn handle_subscription_header(&mut self, idx: Index, body: &[u8], now_ms: Millis) -> Result<(), Error> {
        let parsed = header::decode_header_body(body)?;
        header::validate_subscription_header(&parsed)?;
        let topic = parsed.get(Key::Topic).unwrap().to_string();
        let msg_type = parsed.get(Key::Type).unwrap().to_string();
        let md5 = parsed.get(Key::Md5sum).unwrap().to_string();

        let pub_idx = self
            .publishers
            .iter()
            .find(|(_, p)| p.topic == topic && p.msg_type == msg_type && p.md5sum == md5)
            .map(|(i, _)| i)
            .ok_or_else(|| HandshakeError::TopicMismatch(topic, msg_type, md5))?;

        let tcp_nodelay = parsed.is_flag_set(Key::TcpNodelay);
        let callerid = self.callerid.clone();
        let resp_bytes = {
            let publisher = self.publishers.get(pub_idx).expect("looked up above");
            let mut fields = vec![
                (Key::CallerId, callerid.as_str()),
                (Key::Topic, publisher.topic.as_str()),
                (Key::Type, publisher.msg_type.as_str()),
                (Key::Md5sum, publisher.md5sum.as_str()),
            ];
            if !publisher.message_definition.is_empty() {
                fields.push((Key::MessageDefinition, publisher.message_definition.as_str()));
            }
            if publisher.latching {
                fields.push((Key::Latching, "1"));
            }
            header::encode_header(&fields)
        };

        if let Some(TcprosConn::Server(conn)) = self.tcpros_conns.get_mut(idx) {
            conn.bound = Some(pub_idx);
            conn.tcp_nodelay = tcp_nodelay;
        }
        if let Some(publisher) = self.publishers.get_mut(pub_idx) {
            publisher.bound_connections.push(idx);
        }
        let send_now = self.publishers.get(pub_idx).is_some_and(|p| !p.queue.is_empty());
        let token = Self::tcpros_token(idx);
        if let Some(TcprosConn::Server(conn)) = self.tcpros_conns.get_mut(idx) {
            conn.begin_writing_header(self.poll.registry(), token, resp_bytes, now_ms);
            conn.send_now = send_now;
        }
        Ok(())
    }

    fn pop_publisher_frame_for(&mut self, conn_idx: Index) -> Option<Vec<u8>> {
        let pub_idx = match self.tcpros_conns.get(conn_idx) {
            Some(TcprosConn::Server(c)) => c.bound?,
            _ => return None,
        };
        self.publishers.get(pub_idx)?.queue.front().map(|m| m.bytes.clone())
    }

    /// Decrements the refcount on the publisher queue's head message;
    /// pops it once every bound connection has transmitted it, and re-arms
    /// `send_now` on all of them if another message is already queued
    /// (spec §9's explicit refcounted fanout barrier).
    fn on_publisher_frame_transmitted(&mut self, conn_idx: Index) {
        let pub_idx = match self.tcpros_conns.get(conn_idx) {
            Some(TcprosConn::Server(c)) => c.bound,
            _ => None,
        };
        let Some(pub_idx) = pub_idx else { return };
        let Some(publisher) = self.publishers.get_mut(pub_idx) else { return };
        let mut just_popped = false;
        if let Some(front) = publisher.queue.front_mut() {
            safe_assert!(front.pending > 0, "publisher queue head transmitted more times than it had bound connections");
            front.pending = front.pending.saturating_sub(1);
            if front.pending == 0 {
                publisher.queue.pop_front();
                just_popped = true;
            }
        }
        if just_popped && !publisher.queue.is_empty() {
            let bound = publisher.bound_connections.clone();
            for c in bound {
                if let Some(TcprosConn::Server(conn)) = self.tcpros_conns.get_mut(c) {
                    conn.send_now = true;
                }
            }
        }
    }

    fn close_topic_server(&mut self, idx: Index, err: Option<Error>) {
        if let Some(TcprosConn::Server(mut conn)) = self.tcpros_conns.remove(idx) {
            conn.socket_mut().deregister(self.poll.registry());
            if let Some(pub_idx) = conn.bound {
                if let Some(publisher) = self.publishers.get_mut(pub_idx) {
                    publisher.bound_connections.retain(|&c| c != idx);
                }
            }
        }
        match err {
            Some(e) => {
                warn!(idx, error = %e, "topic-server connection torn down");
                self.record_error(e);
            }
            None => debug!(idx, "topic-server connection closed"),
        }
    }

    fn drive_topic_client(&mut self, idx: Index, now_ms: Millis) {
        let token = Self::tcpros_token(idx);
        loop {
            let Some(TcprosConn::Client(conn)) = self.tcpros_conns.get_mut(idx) else { return };
            match conn.state() {
                topic_client::State::Connecting => match conn.poll_connect() {
                    Ok(()) => {
                        let _ = conn.socket_mut().reset_to_readable(self.poll.registry(), token);
                        let bytes = self.build_subscription_header(idx);
                        if let Some(TcprosConn::Client(conn)) = self.tcpros_conns.get_mut(idx) {
                            conn.begin_writing_header(self.poll.registry(), token, bytes, now_ms);
                        }
                        continue;
                    }
                    Err(e) => {
                        self.close_topic_client(idx, Some(Error::Conn(e)));
                        return;
                    }
                },
                topic_client::State::WritingHeader => match conn.poll_write(self.poll.registry(), token) {
                    Ok(true) => {
                        conn.finish_header_write(now_ms);
                        continue;
                    }
                    Ok(false) => return,
                    Err(e) => {
                        self.close_topic_client(idx, Some(Error::Conn(e)));
                        return;
                    }
                },
                topic_client::State::ReadingHeaderSize | topic_client::State::ReadingHeader => match conn.poll_header(now_ms) {
                    Ok(Some(body)) => match self.handle_publication_header(idx, &body, now_ms) {
                        Ok(()) => continue,
                        Err(e) => {
                            self.close_topic_client(idx, Some(e));
                            return;
                        }
                    },
                    Ok(None) => return,
                    Err(e) => {
                        self.close_topic_client(idx, Some(Error::Conn(e)));
                        return;
                    }
                },
                topic_client::State::ReadingSize | topic_client::State::Reading => match conn.poll_payload(now_ms) {
                    Ok(Some(payload)) => {
                        self.deliver_to_subscriber(idx, &payload);
                        continue;
                    }
                    Ok(None) => return,
                    Err(e) => {
                        self.close_topic_client(idx, Some(Error::Conn(e)));
                        return;
                    }
                },
            }
        }
    }

    fn build_subscription_header(&self, idx: Index) -> Vec<u8> {
        let sub_idx = match self.tcpros_conns.get(idx) {
            Some(TcprosConn::Client(c)) => c.bound,
            _ => None,
        };
        let Some(subscriber) = sub_idx.and_then(|i| self.subscribers.get(i)) else {
            return header::encode_header(&[]);
        };
        header::encode_header(&[
            (Key::CallerId, self.callerid.as_str()),
            (Key::Topic, subscriber.topic.as_str()),
            (Key::Md5sum, subscriber.md5sum.as_str()),
            (Key::Type, subscriber.msg_type.as_str()),
        ])
    }

    fn handle_publication_header(&mut self, idx: Index, body: &[u8], now_ms: Millis) -> Result<(), Error> {
        let parsed = header::decode_header_body(body)?;
        header::validate_publication_header(&parsed)?;
        let sub_idx = match self.tcpros_conns.get(idx) {
            Some(TcprosConn::Client(c)) => c.bound,
            _ => None,
        }
        .ok_or(Error::UnknownRegistration)?;
        let subscriber = self.subscribers.get(sub_idx).ok_or(Error::UnknownRegistration)?;

        let msg_type = parsed.get(Key::Type).unwrap();
        let md5 = parsed.get(Key::Md5sum).unwrap();
        if msg_type != subscriber.msg_type || md5 != subscriber.md5sum {
            return Err(HandshakeError::PublicationMismatch(msg_type.to_string(), md5.to_string()).into());
        }
        if self.cfg.match_strictness == MatchStrictness::Strict {
            if let Some(topic) = parsed.get(Key::Topic) {
                if topic != subscriber.topic {
                    return Err(HandshakeError::TopicMismatch(topic.to_string(), msg_type.to_string(), md5.to_string()).into());
                }
            }
        }
        let tcp_nodelay = parsed.is_flag_set(Key::TcpNodelay);

        if let Some(TcprosConn::Client(conn)) = self.tcpros_conns.get_mut(idx) {
            if tcp_nodelay {
                conn.socket_mut().apply_nodelay();
            }
            conn.begin_reading_payloads(now_ms);
        }
        Ok(())
    }

    fn deliver_to_subscriber(&mut self, idx: Index, payload: &[u8]) {
        let sub_idx = match self.tcpros_conns.get(idx) {
            Some(TcprosConn::Client(c)) => c.bound,
            _ => None,
        };
        let Some(sub_idx) = sub_idx else { return };
        let Some(subscriber) = self.subscribers.get_mut(sub_idx) else { return };
        subscriber.note_delivery();
        let result = (subscriber.callback)(payload);
        subscriber.note_drained();
        if let Err(e) = result {
            self.record_error(Error::Callback(e));
        }
    }

    /// Whether a subscriber's delivery queue has ever been full at the
    /// moment a payload arrived (spec §4.3 subscriber delivery overflow
    /// edge case). `None` if `idx` is not a live subscriber.
    pub fn subscriber_overflowed(&self, idx: Index) -> Option<bool> {
        self.subscribers.get(idx).map(|s| s.msg_queue_overflow)
    }

    fn close_topic_client(&mut self, idx: Index, err: Option<Error>) {
        let mut reconnect = None;
        if let Some(TcprosConn::Client(mut conn)) = self.tcpros_conns.remove(idx) {
            conn.socket_mut().deregister(self.poll.registry());
            if let Some(sub_idx) = conn.bound {
                if let Some(subscriber) = self.subscribers.get_mut(sub_idx) {
                    subscriber.bound_connections.retain(|&c| c != idx);
                    if err.is_some() {
                        if let Some(addr) = conn.socket().peer_addr() {
                            reconnect = Some((sub_idx, addr));
                        }
                    }
                }
            }
        }
        if let Some((sub_idx, addr)) = reconnect {
            self.reconnects.push(PendingReconnect {
                kind: ReconnectKind::Subscriber(sub_idx),
                addr,
                wake_ms: self.clock.now_ms() + self.cfg.reconnect_interval.as_millis() as Millis,
            });
        }
        match err {
            Some(e) => {
                warn!(idx, error = %e, "topic-client connection torn down");
                self.record_error(e);
            }
            None => debug!(idx, "topic-client connection closed"),
        }
    }

    fn tick_publishers(&mut self, _now_ms: Millis) {
        let ready: Vec<Index> = self.publishers.iter_mut().filter(|(_, p)| p.ticker.fired()).map(|(i, _)| i).collect();
        for idx in ready {
            let mut buf = Vec::new();
            let result = match self.publishers.get_mut(idx) {
                Some(publisher) => (publisher.callback)(&mut buf),
                None => continue,
            };
            match result {
                Ok(()) => {
                    let mut frame = Vec::with_capacity(4 + buf.len());
                    wire::write_payload(&mut frame, &buf);
                    let had_subscribers = self.publishers.get(idx).is_some_and(|p| !p.bound_connections.is_empty());
                    if let Some(publisher) = self.publishers.get_mut(idx) {
                        publisher.enqueue(frame);
                    }
                    if had_subscribers {
                        let conns = self.publishers.get(idx).map(|p| p.bound_connections.clone()).unwrap_or_default();
                        for c in conns {
                            if let Some(TcprosConn::Server(conn)) = self.tcpros_conns.get_mut(c) {
                                conn.send_now = true;
                            }
                        }
                    }
                }
                Err(e) => self.record_error(Error::Callback(e)),
            }
        }
    }

    // ---- RPCROS pool --------------------------------------------------

    fn drive_service(&mut self, idx: Index, now_ms: Millis) {
        match self.rpcros_conns.get(idx) {
            Some(RpcrosConn::Server(_)) => self.drive_service_server(idx, now_ms),
            Some(RpcrosConn::Client(_)) => self.drive_service_client(idx, now_ms),
            None => {}
        }
    }

    fn drive_service_server(&mut self, idx: Index, now_ms: Millis) {
        let token = Self::rpcros_token(idx);
        loop {
            let Some(RpcrosConn::Server(conn)) = self.rpcros_conns.get_mut(idx) else { return };
            match conn.state() {
                service_server::State::ReadingHeaderSize | service_server::State::ReadingHeader => match conn.poll_header(now_ms) {
                    Ok(Some(body)) => match self.handle_service_call_header(idx, &body, now_ms) {
                        Ok(()) => continue,
                        Err(e) => {
                            self.close_service_server(idx, Some(e));
                            return;
                        }
                    },
                    Ok(None) => return,
                    Err(e) => {
                        self.close_service_server(idx, Some(Error::Conn(e)));
                        return;
                    }
                },
                service_server::State::WritingHeader => match conn.poll_write(self.poll.registry(), token) {
                    Ok(true) => {
                        let outcome = conn.finish_header_write(now_ms);
                        match outcome {
                            service_server::HeaderWriteOutcome::ProbeComplete => {
                                self.close_service_server(idx, None);
                                return;
                            }
                            service_server::HeaderWriteOutcome::AwaitRequest => continue,
                        }
                    }
                    Ok(false) => return,
                    Err(e) => {
                        self.close_service_server(idx, Some(Error::Conn(e)));
                        return;
                    }
                },
                service_server::State::ReadingSize | service_server::State::Reading => match conn.poll_request(now_ms) {
                    Ok(Some(req)) => {
                        self.handle_service_request(idx, &req, now_ms);
                        continue;
                    }
                    Ok(None) => return,
                    Err(e) => {
                        self.close_service_server(idx, Some(Error::Conn(e)));
                        return;
                    }
                },
                service_server::State::Writing => match conn.poll_write(self.poll.registry(), token) {
                    Ok(true) => {
                        if conn.finish_response_write(now_ms) {
                            continue;
                        } else {
                            self.close_service_server(idx, None);
                            return;
                        }
                    }
                    Ok(false) => return,
                    Err(e) => {
                        self.close_service_server(idx, Some(Error::Conn(e)));
                        return;
                    }
                },
            }
        }
    }

    fn handle_service_call_header(&mut self, idx: Index, body: &[u8], now_ms: Millis) -> Result<(), Error> {
        let parsed = header::decode_header_body(body)?;
        header::validate_service_call_header(&parsed)?;
        let service = parsed.get(Key::Service).unwrap().to_string();

        let svc_idx = self
            .service_providers
            .iter()
            .find(|(_, p)| p.service == service)
            .map(|(i, _)| i)
            .ok_or_else(|| HandshakeError::ServiceUnknown(service.clone()))?;

        let probe = header::is_service_probe(&parsed);
        if !probe {
            let md5 = parsed.get(Key::Md5sum).unwrap();
            let provider = self.service_providers.get(svc_idx).expect("looked up above");
            if md5 != header::MD5_SENTINEL && md5 != provider.md5sum {
                return Err(HandshakeError::ServiceMd5Mismatch(service).into());
            }
        }

        let persistent = parsed.is_flag_set(Key::Persistent) && !probe;
        let tcp_nodelay = parsed.is_flag_set(Key::TcpNodelay);
        let callerid = self.callerid.clone();
        let resp_bytes = {
            let provider = self.service_providers.get(svc_idx).expect("looked up above");
            let fields = [
                (Key::CallerId, callerid.as_str()),
                (Key::Md5sum, provider.md5sum.as_str()),
                (Key::Type, provider.msg_type.as_str()),
                (Key::RequestType, provider.request_type.as_str()),
                (Key::ResponseType, provider.response_type.as_str()),
            ];
            header::encode_header(&fields)
        };

        if let Some(RpcrosConn::Server(conn)) = self.rpcros_conns.get_mut(idx) {
            conn.bound = Some(svc_idx);
            conn.probe = probe;
            conn.persistent = persistent;
            if tcp_nodelay {
                conn.socket_mut().apply_nodelay();
            }
        }
        if let Some(provider) = self.service_providers.get_mut(svc_idx) {
            provider.bound_connections.push(idx);
        }
        let token = Self::rpcros_token(idx);
        if let Some(RpcrosConn::Server(conn)) = self.rpcros_conns.get_mut(idx) {
            conn.begin_writing_header(self.poll.registry(), token, resp_bytes, now_ms);
        }
        Ok(())
    }

    fn handle_service_request(&mut self, idx: Index, req: &[u8], now_ms: Millis) {
        let svc_idx = match self.rpcros_conns.get(idx) {
            Some(RpcrosConn::Server(c)) => c.bound,
            _ => None,
        };
        let Some(svc_idx) = svc_idx else { return };
        let mut resp = Vec::new();
        let outcome = match self.service_providers.get_mut(svc_idx) {
            Some(provider) => (provider.callback)(req, &mut resp),
            None => return,
        };
        let (ok, payload) = match outcome {
            Ok(()) => (true, resp),
            Err(e) => {
                let message = e.to_string().into_bytes();
                self.record_error(Error::Callback(e));
                (false, message)
            }
        };
        let token = Self::rpcros_token(idx);
        if let Some(RpcrosConn::Server(conn)) = self.rpcros_conns.get_mut(idx) {
            conn.begin_writing_response(self.poll.registry(), token, ok, &payload, now_ms);
        }
    }

    fn close_service_server(&mut self, idx: Index, err: Option<Error>) {
        if let Some(RpcrosConn::Server(mut conn)) = self.rpcros_conns.remove(idx) {
            conn.socket_mut().deregister(self.poll.registry());
            if let Some(svc_idx) = conn.bound {
                if let Some(provider) = self.service_providers.get_mut(svc_idx) {
                    provider.bound_connections.retain(|&c| c != idx);
                }
            }
        }
        match err {
            Some(e) => {
                warn!(idx, error = %e, "service-server connection torn down");
                self.record_error(e);
            }
            None => debug!(idx, "service-server connection closed"),
        }
    }

    fn drive_service_client(&mut self, idx: Index, now_ms: Millis) {
        let token = Self::rpcros_token(idx);
        loop {
            let Some(RpcrosConn::Client(conn)) = self.rpcros_conns.get_mut(idx) else { return };
            match conn.state() {
                service_client::State::Connecting => match conn.poll_connect() {
                    Ok(()) => {
                        let _ = conn.socket_mut().reset_to_readable(self.poll.registry(), token);
                        let bytes = self.build_service_call_header(idx);
                        if let Some(RpcrosConn::Client(conn)) = self.rpcros_conns.get_mut(idx) {
                            conn.begin_writing_header(self.poll.registry(), token, bytes, now_ms);
                        }
                        continue;
                    }
                    Err(e) => {
                        self.close_service_client(idx, Some(Error::Conn(e)));
                        return;
                    }
                },
                service_client::State::WritingHeader => match conn.poll_write(self.poll.registry(), token) {
                    Ok(true) => {
                        conn.finish_header_write(now_ms);
                        continue;
                    }
                    Ok(false) => return,
                    Err(e) => {
                        self.close_service_client(idx, Some(Error::Conn(e)));
                        return;
                    }
                },
                service_client::State::ReadingHeaderSize | service_client::State::ReadingHeader => match conn.poll_header(now_ms) {
                    Ok(Some(body)) => match self.handle_service_provision_header(idx, &body, now_ms) {
                        Ok(()) => continue,
                        Err(e) => {
                            self.close_service_client(idx, Some(e));
                            return;
                        }
                    },
                    Ok(None) => return,
                    Err(e) => {
                        self.close_service_client(idx, Some(Error::Conn(e)));
                        return;
                    }
                },
                service_client::State::WaitForWriting => return,
                service_client::State::Writing => match conn.poll_write(self.poll.registry(), token) {
                    Ok(true) => {
                        conn.finish_request_write(now_ms);
                        continue;
                    }
                    Ok(false) => return,
                    Err(e) => {
                        self.close_service_client(idx, Some(Error::Conn(e)));
                        return;
                    }
                },
                service_client::State::ReadingSize | service_client::State::Reading => match conn.poll_response(now_ms) {
                    Ok(Some((ok, body))) => {
                        self.handle_service_response(idx, ok, &body, now_ms);
                        continue;
                    }
                    Ok(None) => return,
                    Err(e) => {
                        self.close_service_client(idx, Some(Error::Conn(e)));
                        return;
                    }
                },
            }
        }
    }

    fn build_service_call_header(&self, idx: Index) -> Vec<u8> {
        let caller_idx = match self.rpcros_conns.get(idx) {
            Some(RpcrosConn::Client(c)) => c.bound,
            _ => None,
        };
        let Some(caller) = caller_idx.and_then(|i| self.service_callers.get(i)) else {
            return header::encode_header(&[]);
        };
        let mut fields = vec![
            (Key::CallerId, self.callerid.as_str()),
            (Key::Service, caller.service.as_str()),
            (Key::Md5sum, caller.md5sum.as_str()),
            (Key::Type, caller.msg_type.as_str()),
        ];
        if caller.persistent {
            fields.push((Key::Persistent, "1"));
        }
        header::encode_header(&fields)
    }

    fn handle_service_provision_header(&mut self, idx: Index, body: &[u8], now_ms: Millis) -> Result<(), Error> {
        let parsed = header::decode_header_body(body)?;
        header::validate_service_provision_header(&parsed)?;
        let caller_idx = match self.rpcros_conns.get(idx) {
            Some(RpcrosConn::Client(c)) => c.bound,
            _ => None,
        }
        .ok_or(Error::UnknownRegistration)?;
        let caller = self.service_callers.get(caller_idx).ok_or(Error::UnknownRegistration)?;

        let md5 = parsed.get(Key::Md5sum).unwrap();
        let msg_type = parsed.get(Key::Type).unwrap();
        if md5 != caller.md5sum || msg_type != caller.msg_type {
            return Err(HandshakeError::ServiceProvisionMismatch(format!(
                "expected type {:?} md5 {:?}, got type {msg_type:?} md5 {md5:?}",
                caller.msg_type, caller.md5sum
            ))
            .into());
        }
        if !caller.request_type.is_empty() {
            if let Some(got) = parsed.get(Key::RequestType) {
                if got != caller.request_type {
                    return Err(HandshakeError::ServiceProvisionMismatch(format!(
                        "request_type mismatch: expected {:?}, got {got:?}",
                        caller.request_type
                    ))
                    .into());
                }
            }
        }
        if !caller.response_type.is_empty() {
            if let Some(got) = parsed.get(Key::ResponseType) {
                if got != caller.response_type {
                    return Err(HandshakeError::ServiceProvisionMismatch(format!(
                        "response_type mismatch: expected {:?}, got {got:?}",
                        caller.response_type
                    ))
                    .into());
                }
            }
        }

        let persistent = caller.persistent;
        let tcp_nodelay = parsed.is_flag_set(Key::TcpNodelay);
        if let Some(RpcrosConn::Client(conn)) = self.rpcros_conns.get_mut(idx) {
            conn.persistent = persistent;
            if tcp_nodelay {
                conn.socket_mut().apply_nodelay();
            }
            conn.mark_matched(now_ms);
        }
        Ok(())
    }

    fn handle_service_response(&mut self, idx: Index, ok: u8, body: &[u8], now_ms: Millis) {
        let caller_idx = match self.rpcros_conns.get(idx) {
            Some(RpcrosConn::Client(c)) => c.bound,
            _ => None,
        };
        if let Some(caller_idx) = caller_idx {
            if let Some(caller) = self.service_callers.get_mut(caller_idx) {
                if ok == 0 {
                    warn!(service = %caller.service, "service call returned ok=0");
                }
                let mut scratch = Vec::new();
                if let Err(e) = (caller.callback)(&mut scratch, body, true) {
                    self.record_error(Error::Callback(e));
                }
            }
        }
        let keep_going = match self.rpcros_conns.get_mut(idx) {
            Some(RpcrosConn::Client(conn)) => conn.finish_response_read(now_ms),
            _ => false,
        };
        if !keep_going {
            self.close_service_client(idx, None);
        }
    }

    fn close_service_client(&mut self, idx: Index, err: Option<Error>) {
        let mut reconnect = None;
        if let Some(RpcrosConn::Client(mut conn)) = self.rpcros_conns.remove(idx) {
            conn.socket_mut().deregister(self.poll.registry());
            if let Some(caller_idx) = conn.bound {
                if let Some(caller) = self.service_callers.get_mut(caller_idx) {
                    caller.bound_connection = None;
                    if err.is_some() {
                        if let Some(addr) = conn.socket().peer_addr() {
                            reconnect = Some((caller_idx, addr));
                        }
                    }
                }
            }
        }
        if let Some((caller_idx, addr)) = reconnect {
            self.reconnects.push(PendingReconnect {
                kind: ReconnectKind::ServiceCaller(caller_idx),
                addr,
                wake_ms: self.clock.now_ms() + self.cfg.reconnect_interval.as_millis() as Millis,
            });
        }
        match err {
            Some(e) => {
                warn!(idx, error = %e, "service-client connection torn down");
                self.record_error(e);
            }
            None => debug!(idx, "service-client connection closed"),
        }
    }

    fn tick_service_callers(&mut self, now_ms: Millis) {
        let candidates: Vec<Index> = self
            .rpcros_conns
            .iter()
            .filter_map(|(i, c)| match c {
                RpcrosConn::Client(conn) if conn.state() == service_client::State::WaitForWriting => Some(i),
                _ => None,
            })
            .collect();
        for idx in candidates {
            let caller_idx = match self.rpcros_conns.get(idx) {
                Some(RpcrosConn::Client(c)) => c.bound,
                _ => None,
            };
            let Some(caller_idx) = caller_idx else { continue };
            let fired = match self.service_callers.get_mut(caller_idx) {
                Some(caller) => caller.ticker.fired(),
                None => false,
            };
            if !fired {
                continue;
            }
            let mut req = Vec::new();
            let result = match self.service_callers.get_mut(caller_idx) {
                Some(caller) => (caller.callback)(&mut req, &[], false),
                None => continue,
            };
            match result {
                Ok(()) => {
                    let mut frame = Vec::new();
                    wire::write_payload(&mut frame, &req);
                    let token = Self::rpcros_token(idx);
                    if let Some(RpcrosConn::Client(conn)) = self.rpcros_conns.get_mut(idx) {
                        conn.begin_writing_request(self.poll.registry(), token, frame, now_ms);
                    }
                }
                Err(e) => self.record_error(Error::Callback(e)),
            }
        }
    }

    // ---- inactivity timeout sweep --------------------------------------

    fn check_timeouts(&mut self, now_ms: Millis) {
        let timeout = self.cfg.inactivity_timeout;

        let expired_tcpros: Vec<Index> = self
            .tcpros_conns
            .iter()
            .filter(|(_, c)| {
                let (exempt, last) = match c {
                    TcprosConn::Server(c) => (c.is_timeout_exempt(), c.last_change_ms()),
                    TcprosConn::Client(c) => (c.is_timeout_exempt(), c.last_change_ms()),
                };
                !exempt && conn::timed_out(now_ms, last, timeout)
            })
            .map(|(i, _)| i)
            .collect();
        for idx in expired_tcpros {
            match self.tcpros_conns.get(idx) {
                Some(TcprosConn::Server(_)) => self.close_topic_server(idx, Some(Error::Conn(ConnError::Timeout))),
                Some(TcprosConn::Client(_)) => self.close_topic_client(idx, Some(Error::Conn(ConnError::Timeout))),
                None => {}
            }
        }

        let expired_rpcros: Vec<Index> = self
            .rpcros_conns
            .iter()
            .filter(|(_, c)| {
                let (exempt, last) = match c {
                    RpcrosConn::Server(c) => (c.is_timeout_exempt(), c.last_change_ms()),
                    RpcrosConn::Client(c) => (c.is_timeout_exempt(), c.last_change_ms()),
                };
                !exempt && conn::timed_out(now_ms, last, timeout)
            })
            .map(|(i, _)| i)
            .collect();
        for idx in expired_rpcros {
            match self.rpcros_conns.get(idx) {
                Some(RpcrosConn::Server(_)) => self.close_service_server(idx, Some(Error::Conn(ConnError::Timeout))),
                Some(RpcrosConn::Client(_)) => self.close_service_client(idx, Some(Error::Conn(ConnError::Timeout))),
                None => {}
            }
        }
    }

    fn maybe_reconnect(&mut self, now_ms: Millis) {
        let ready: Vec<usize> = self.reconnects.iter().enumerate().filter(|(_, r)| now_ms >= r.wake_ms).map(|(i, _)| i).collect();
        for i in ready.into_iter().rev() {
            let pending = self.reconnects.remove(i);
            match pending.kind {
                ReconnectKind::Subscriber(sub_idx) => {
                    if self.subscribers.get(sub_idx).is_some() {
                        if let Err(e) = self.connect_subscriber(sub_idx, pending.addr) {
                            warn!(sub_idx, ?pending.addr, error = %e, "resubscribe attempt failed, will retry");
                            self.reconnects.push(PendingReconnect {
                                kind: ReconnectKind::Subscriber(sub_idx),
                                addr: pending.addr,
                                wake_ms: now_ms + self.cfg.reconnect_interval.as_millis() as Millis,
                            });
                        }
                    }
                }
                ReconnectKind::ServiceCaller(caller_idx) => {
                    if self.service_callers.get(caller_idx).is_some() {
                        if let Err(e) = self.connect_service_caller(caller_idx, pending.addr) {
                            warn!(caller_idx, ?pending.addr, error = %e, "service reconnect attempt failed, will retry");
                            self.reconnects.push(PendingReconnect {
                                kind: ReconnectKind::ServiceCaller(caller_idx),
                                addr: pending.addr,
                                wake_ms: now_ms + self.cfg.reconnect_interval.as_millis() as Millis,
                            });
                        }
                    }
                }
            }
        }
    }
}
