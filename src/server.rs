// Server-side dispatch filter.
//
// Accepts LDAP connections, decodes request PDUs, and routes them by
// operation to a `ServerConnection` session object produced by a factory at
// accept time. Each operation gets a result sink bound to its message id;
// the sink encodes exactly one terminal response (searches may stream
// entries and references first). Security layers (TLS, SASL-style wrappers)
// are installed in band and applied beneath the protocol framer.

use crate::ldap_protocol::{
    encode_error_response, encode_ldap_message, response_tag_for_request, result_code,
    try_parse_message, BindRequest, CompareRequest, ExtendedRequest, ExtendedResponse,
    IntermediateResponse, LdapMessage, LdapResult, ModifyDnRequest, ModifyRequest, ProtocolOp,
    SearchRequest, SearchResultEntry, TryParseResult, AddRequest, DelRequest,
    LDAP_TAG_ADD_RESPONSE, LDAP_TAG_BIND_RESPONSE, LDAP_TAG_COMPARE_RESPONSE,
    LDAP_TAG_DEL_RESPONSE, LDAP_TAG_MODIFY_DN_RESPONSE, LDAP_TAG_MODIFY_RESPONSE,
    LDAP_TAG_SEARCH_RESULT_DONE, NOTICE_OF_DISCONNECTION_OID,
};
use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use bytes::BytesMut;
use dashmap::DashSet;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// SSF credited for an installed TLS layer. Cipher-strength negotiation is
/// out of scope; any TLS counts as strong confidentiality.
const TLS_SSF: u32 = 128;

/// Accepted stream: plain TCP or TLS-wrapped, for ldap:// and ldaps://
/// listeners and StartTLS upgrades.
pub enum ServerStream {
    Tcp(TcpStream),
    Tls(TlsStream<TcpStream>),
}

impl AsyncRead for ServerStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ServerStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            ServerStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ServerStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match &mut *self {
            ServerStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            ServerStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }
    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ServerStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            ServerStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }
    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ServerStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            ServerStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// A confidentiality layer installed beneath the protocol framer: outgoing
/// frames pass through `wrap`, incoming bytes through `unwrap`. TLS is
/// handled separately at the transport; this trait covers SASL-style
/// wrappers.
pub trait SecurityLayerProvider: Send + Sync {
    fn name(&self) -> &str;
    fn ssf(&self) -> u32;
    fn wrap(&self, frame: &[u8]) -> Vec<u8>;
    fn unwrap(&self, data: &mut BytesMut) -> Result<()>;
}

/// Session object bound to one accepted connection. Every operation handler
/// receives a sink and must eventually invoke it exactly once with the
/// terminal result (search may stream entries and references first).
/// Exactly one of the three connection notifications is delivered over the
/// connection's lifetime.
pub trait ServerConnection: Send + Sync {
    fn handle_bind(&self, message_id: i32, request: BindRequest, result: ResultSink);
    fn handle_search(&self, message_id: i32, request: SearchRequest, result: SearchResultSink);
    fn handle_add(&self, message_id: i32, request: AddRequest, result: ResultSink);
    fn handle_delete(&self, message_id: i32, request: DelRequest, result: ResultSink);
    fn handle_modify(&self, message_id: i32, request: ModifyRequest, result: ResultSink);
    fn handle_modify_dn(&self, message_id: i32, request: ModifyDnRequest, result: ResultSink);
    fn handle_compare(&self, message_id: i32, request: CompareRequest, result: ResultSink);
    fn handle_extended(&self, message_id: i32, request: ExtendedRequest, result: ExtendedResultSink);

    /// The client abandoned `abandoned_id`. The operation is already out of
    /// the in-flight set; its sink, if invoked later, writes nothing.
    fn handle_abandon(&self, abandoned_id: i32) {
        let _ = abandoned_id;
    }

    /// Peer closed the connection cleanly (unbind or EOF).
    fn connection_closed(&self) {}

    /// The server disconnected the client (`ClientContext::disconnect`).
    fn connection_disconnected(&self, result_code: i32, message: &str) {
        let _ = (result_code, message);
    }

    /// The connection died from an I/O or protocol failure.
    fn connection_error(&self, error: &anyhow::Error) {
        let _ = error;
    }
}

/// Produces the session object for each accepted connection. A factory
/// error closes the socket immediately.
pub trait ServerConnectionFactory: Send + Sync {
    fn accept(&self, ctx: Arc<ClientContext>) -> Result<Arc<dyn ServerConnection>>;
}

enum WriteCommand {
    Frame(Vec<u8>),
    InstallTls(Arc<rustls::ServerConfig>),
    Disconnect(Option<(i32, String)>),
}

/// Per-connection capability surface handed to session handlers.
pub struct ClientContext {
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    commands: mpsc::UnboundedSender<WriteCommand>,
    closed: AtomicBool,
    in_flight: DashSet<i32>,
    tls_installed: AtomicBool,
    tls_ssf: AtomicU32,
    layers: ArcSwap<Vec<Arc<dyn SecurityLayerProvider>>>,
}

impl ClientContext {
    fn new(
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        commands: mpsc::UnboundedSender<WriteCommand>,
        tls_active: bool,
    ) -> Self {
        Self {
            local_addr,
            peer_addr,
            commands,
            closed: AtomicBool::new(false),
            in_flight: DashSet::new(),
            tls_installed: AtomicBool::new(tls_active),
            tls_ssf: AtomicU32::new(if tls_active { TLS_SSF } else { 0 }),
            layers: ArcSwap::from_pointee(Vec::new()),
        }
    }

    pub fn local_address(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_address(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Strongest confidentiality currently protecting the connection.
    pub fn security_strength_factor(&self) -> u32 {
        let layer_ssf = self
            .layers
            .load()
            .iter()
            .map(|l| l.ssf())
            .max()
            .unwrap_or(0);
        self.tls_ssf.load(Ordering::Acquire).max(layer_ssf)
    }

    /// Install TLS beneath the protocol framer. The handshake runs after
    /// all previously queued frames are written, so a StartTLS response
    /// sent just before still goes out in plaintext. At most one TLS layer
    /// per connection; a second install fails without touching the first.
    pub fn enable_tls(&self, config: Arc<rustls::ServerConfig>) -> Result<()> {
        if self
            .tls_installed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            anyhow::bail!("TLS layer already installed on connection from {}", self.peer_addr);
        }
        self.commands
            .send(WriteCommand::InstallTls(config))
            .map_err(|_| anyhow::anyhow!("Connection from {} is closed", self.peer_addr))
    }

    /// Install a SASL-style confidentiality layer beneath the framer and
    /// beneath any TLS layer. Readers always observe a complete stack: the
    /// new list is built aside and published atomically.
    pub fn enable_connection_security_layer(&self, layer: Arc<dyn SecurityLayerProvider>) {
        self.layers.rcu(|current| {
            let mut next = Vec::with_capacity(current.len() + 1);
            next.extend(current.iter().cloned());
            next.push(Arc::clone(&layer));
            next
        });
        info!(
            "Installed security layer {} (ssf {}) for {}",
            layer.name(),
            layer.ssf(),
            self.peer_addr
        );
    }

    /// Send an unsolicited notification (message id 0).
    pub fn send_unsolicited_notification(&self, notification: ExtendedResponse) -> Result<()> {
        let frame = encode_ldap_message(&LdapMessage {
            message_id: 0,
            protocol_op: ProtocolOp::ExtendedResponse(notification),
            controls: None,
        })?;
        self.send_frame(frame);
        Ok(())
    }

    /// Disconnect the client. With a result code and message, a
    /// notice-of-disconnection is sent first; either way the socket closes
    /// and the session gets one `connection_disconnected` notification.
    pub fn disconnect(&self, notice: Option<(i32, String)>) {
        if let Some((code, message)) = &notice {
            let response = ExtendedResponse {
                result: LdapResult {
                    result_code: *code,
                    matched_dn: String::new(),
                    diagnostic_message: message.clone(),
                },
                response_name: Some(NOTICE_OF_DISCONNECTION_OID.to_string()),
                response_value: None,
            };
            if let Err(e) = self.send_unsolicited_notification(response) {
                warn!("Failed to send disconnect notice to {}: {}", self.peer_addr, e);
            }
        }
        let _ = self.commands.send(WriteCommand::Disconnect(notice));
    }

    fn send_frame(&self, frame: Vec<u8>) {
        // A send error means the connection task is gone; the frame is
        // dropped, which is the contract after close.
        let _ = self.commands.send(WriteCommand::Frame(frame));
    }

    fn begin_operation(&self, message_id: i32) {
        self.in_flight.insert(message_id);
    }

    /// Claim the terminal completion of an operation. False when the
    /// operation was abandoned or already completed; the caller then drops
    /// its response.
    fn complete_operation(&self, message_id: i32) -> bool {
        self.in_flight.remove(&message_id).is_some()
    }

    fn abandon_operation(&self, message_id: i32) -> bool {
        self.in_flight.remove(&message_id).is_some()
    }

    fn is_in_flight(&self, message_id: i32) -> bool {
        self.in_flight.contains(&message_id)
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
        self.in_flight.clear();
    }

    fn set_tls_active(&self) {
        self.tls_ssf.store(TLS_SSF, Ordering::Release);
    }
}

fn terminal_response(response_tag: u8, result: LdapResult) -> ProtocolOp {
    match response_tag {
        LDAP_TAG_SEARCH_RESULT_DONE => ProtocolOp::SearchResultDone(result),
        LDAP_TAG_MODIFY_RESPONSE => ProtocolOp::ModifyResponse(result),
        LDAP_TAG_ADD_RESPONSE => ProtocolOp::AddResponse(result),
        LDAP_TAG_DEL_RESPONSE => ProtocolOp::DelResponse(result),
        LDAP_TAG_MODIFY_DN_RESPONSE => ProtocolOp::ModifyDnResponse(result),
        LDAP_TAG_COMPARE_RESPONSE => ProtocolOp::CompareResponse(result),
        _ => ProtocolOp::BindResponse(result),
    }
}

/// Writes the one terminal response of an operation. Consuming `complete`
/// enforces single use; a completion after abandon writes nothing.
pub struct ResultSink {
    ctx: Arc<ClientContext>,
    message_id: i32,
    response_tag: u8,
}

impl ResultSink {
    fn new(ctx: Arc<ClientContext>, message_id: i32, response_tag: u8) -> Self {
        ctx.begin_operation(message_id);
        Self {
            ctx,
            message_id,
            response_tag,
        }
    }

    pub fn message_id(&self) -> i32 {
        self.message_id
    }

    pub fn complete(self, result: LdapResult) {
        if !self.ctx.complete_operation(self.message_id) {
            debug!(
                "Dropping response for abandoned operation {} from {}",
                self.message_id,
                self.ctx.peer_address()
            );
            return;
        }
        let message = LdapMessage {
            message_id: self.message_id,
            protocol_op: terminal_response(self.response_tag, result),
            controls: None,
        };
        match encode_ldap_message(&message) {
            Ok(frame) => self.ctx.send_frame(frame),
            Err(e) => error!("Failed to encode response {}: {}", self.message_id, e),
        }
    }
}

/// Sink for search operations: zero or more entries and references, then
/// exactly one done.
pub struct SearchResultSink {
    inner: ResultSink,
}

impl SearchResultSink {
    pub fn message_id(&self) -> i32 {
        self.inner.message_id
    }

    pub fn entry(&self, entry: SearchResultEntry) {
        self.stream(ProtocolOp::SearchResultEntry(entry));
    }

    pub fn reference(&self, uris: Vec<String>) {
        self.stream(ProtocolOp::SearchResultReference(uris));
    }

    pub fn done(self, result: LdapResult) {
        self.inner.complete(result);
    }

    fn stream(&self, protocol_op: ProtocolOp) {
        if !self.inner.ctx.is_in_flight(self.inner.message_id) {
            return;
        }
        let message = LdapMessage {
            message_id: self.inner.message_id,
            protocol_op,
            controls: None,
        };
        match encode_ldap_message(&message) {
            Ok(frame) => self.inner.ctx.send_frame(frame),
            Err(e) => error!("Failed to encode search data {}: {}", self.inner.message_id, e),
        }
    }
}

/// Sink for extended operations: optional intermediate responses, then one
/// extended response.
pub struct ExtendedResultSink {
    ctx: Arc<ClientContext>,
    message_id: i32,
}

impl ExtendedResultSink {
    fn new(ctx: Arc<ClientContext>, message_id: i32) -> Self {
        ctx.begin_operation(message_id);
        Self { ctx, message_id }
    }

    pub fn message_id(&self) -> i32 {
        self.message_id
    }

    pub fn intermediate(&self, response: IntermediateResponse) {
        if !self.ctx.is_in_flight(self.message_id) {
            return;
        }
        let message = LdapMessage {
            message_id: self.message_id,
            protocol_op: ProtocolOp::IntermediateResponse(response),
            controls: None,
        };
        match encode_ldap_message(&message) {
            Ok(frame) => self.ctx.send_frame(frame),
            Err(e) => error!("Failed to encode intermediate {}: {}", self.message_id, e),
        }
    }

    pub fn complete(self, response: ExtendedResponse) {
        if !self.ctx.complete_operation(self.message_id) {
            debug!(
                "Dropping extended response for abandoned operation {} from {}",
                self.message_id,
                self.ctx.peer_address()
            );
            return;
        }
        let message = LdapMessage {
            message_id: self.message_id,
            protocol_op: ProtocolOp::ExtendedResponse(response),
            controls: None,
        };
        match encode_ldap_message(&message) {
            Ok(frame) => self.ctx.send_frame(frame),
            Err(e) => error!("Failed to encode extended response {}: {}", self.message_id, e),
        }
    }
}

/// Listening LDAP server front end.
pub struct LdapServer {
    listener: TcpListener,
    factory: Arc<dyn ServerConnectionFactory>,
    /// When Some, the listener speaks ldaps; loaded per accept so the
    /// acceptor can be swapped at runtime.
    tls_acceptor: Option<Arc<ArcSwap<TlsAcceptor>>>,
}

impl LdapServer {
    pub async fn bind(
        listen_url: &str,
        factory: Arc<dyn ServerConnectionFactory>,
        tls_acceptor: Option<Arc<ArcSwap<TlsAcceptor>>>,
    ) -> Result<Self> {
        let addr = parse_listen_url(listen_url)?;
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind to {}", addr))?;
        info!("LDAP server listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            factory,
            tls_acceptor,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(&self) -> Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    debug!("New connection from {}", peer_addr);
                    let factory = Arc::clone(&self.factory);
                    let acceptor = self.tls_acceptor.clone();
                    tokio::spawn(async move {
                        let server_stream = if let Some(ref swap) = acceptor {
                            let acceptor = swap.load();
                            match acceptor.accept(stream).await {
                                Ok(tls_stream) => ServerStream::Tls(tls_stream),
                                Err(e) => {
                                    error!("TLS handshake failed for {}: {}", peer_addr, e);
                                    return;
                                }
                            }
                        } else {
                            ServerStream::Tcp(stream)
                        };
                        if let Err(e) =
                            handle_client(server_stream, peer_addr, factory, acceptor.is_some())
                                .await
                        {
                            error!("Error handling client {}: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}

/// Parse ldap://host:port or ldaps://host:port into a socket address.
pub fn parse_listen_url(url: &str) -> Result<SocketAddr> {
    let url = url
        .strip_prefix("ldap://")
        .or_else(|| url.strip_prefix("ldaps://"))
        .ok_or_else(|| anyhow::anyhow!("Invalid URL scheme, expected ldap:// or ldaps://"))?;
    let url = url.trim_start_matches('/');
    if url.starts_with(':') {
        let port: u16 = url
            .trim_start_matches(':')
            .parse()
            .context("Invalid port number")?;
        Ok(SocketAddr::from(([0, 0, 0, 0], port)))
    } else {
        url.parse()
            .with_context(|| format!("Failed to parse address: {}", url))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Established,
    Closing,
    Closed,
}

enum CloseCause {
    PeerClosed,
    Disconnected(Option<(i32, String)>),
    Error(anyhow::Error),
}

async fn handle_client(
    mut stream: ServerStream,
    peer_addr: SocketAddr,
    factory: Arc<dyn ServerConnectionFactory>,
    tls_active: bool,
) -> Result<()> {
    let local_addr = match &stream {
        ServerStream::Tcp(s) => s.local_addr()?,
        ServerStream::Tls(s) => s.get_ref().0.local_addr()?,
    };
    let (command_tx, mut command_rx) = mpsc::unbounded_channel();
    let ctx = Arc::new(ClientContext::new(local_addr, peer_addr, command_tx, tls_active));

    // Accepted: ask the factory for a session; failure closes the socket.
    let conn: Arc<dyn ServerConnection> = match factory.accept(Arc::clone(&ctx)) {
        Ok(conn) => conn,
        Err(e) => {
            warn!("Rejected connection from {}: {}", peer_addr, e);
            ctx.mark_closed();
            let _ = stream.shutdown().await;
            return Ok(());
        }
    };

    let mut state = ConnState::Established;
    let mut buffer = BytesMut::with_capacity(4096);
    let mut read_buf = vec![0u8; 4096];
    // A failed TLS handshake consumes the TCP stream, so the loop below may
    // leave nothing to shut down; `None` records that.
    let mut stream = Some(stream);
    let cause;

    'conn: loop {
        tokio::select! {
            cmd = command_rx.recv() => {
                match cmd {
                    Some(WriteCommand::Frame(frame)) => {
                        if let Err(e) = write_frame(stream.as_mut().expect("stream present"), &ctx, frame).await {
                            cause = CloseCause::Error(
                                anyhow::anyhow!("Write to {} failed: {}", peer_addr, e),
                            );
                            break 'conn;
                        }
                    }
                    Some(WriteCommand::InstallTls(config)) => {
                        stream = match stream.take() {
                            Some(ServerStream::Tcp(tcp)) => {
                                let acceptor = TlsAcceptor::from(config);
                                match acceptor.accept(tcp).await {
                                    Ok(tls) => {
                                        debug!("TLS installed for {}", peer_addr);
                                        ctx.set_tls_active();
                                        Some(ServerStream::Tls(tls))
                                    }
                                    Err(e) => {
                                        cause = CloseCause::Error(anyhow::anyhow!(
                                            "TLS handshake with {} failed: {}",
                                            peer_addr,
                                            e
                                        ));
                                        break 'conn;
                                    }
                                }
                            }
                            // tls_installed was already set at accept time,
                            // so enable_tls cannot reach this arm.
                            other => other,
                        };
                    }
                    Some(WriteCommand::Disconnect(notice)) => {
                        cause = CloseCause::Disconnected(notice);
                        break 'conn;
                    }
                    None => {
                        cause = CloseCause::PeerClosed;
                        break 'conn;
                    }
                }
            }
            read = stream.as_mut().expect("stream present").read(&mut read_buf) => {
                match read {
                    Ok(0) => {
                        debug!("Client {} disconnected", peer_addr);
                        cause = CloseCause::PeerClosed;
                        break 'conn;
                    }
                    Ok(n) => {
                        if let Err(e) = unwrap_incoming(&ctx, &read_buf[..n], &mut buffer) {
                            cause = CloseCause::Error(e);
                            break 'conn;
                        }
                        loop {
                            let parsed = match try_parse_message(&mut buffer) {
                                Ok(r) => r,
                                Err(e) => {
                                    let err_frame = encode_error_response(
                                        0,
                                        LDAP_TAG_BIND_RESPONSE,
                                        result_code::PROTOCOL_ERROR,
                                        "",
                                        "Invalid message",
                                    )
                                    .unwrap_or_default();
                                    if !err_frame.is_empty() {
                                        let _ = write_frame(stream.as_mut().expect("stream present"), &ctx, err_frame).await;
                                    }
                                    cause = CloseCause::Error(
                                        e.context(format!("Invalid LDAP stream from {}", peer_addr)),
                                    );
                                    break 'conn;
                                }
                            };
                            match parsed {
                                TryParseResult::Incomplete => break,
                                TryParseResult::ParseError { message_id, response_tag, .. } => {
                                    let err_frame = encode_error_response(
                                        message_id,
                                        response_tag,
                                        result_code::PROTOCOL_ERROR,
                                        "",
                                        "Failed to parse LDAP message",
                                    )
                                    .unwrap_or_default();
                                    if !err_frame.is_empty() {
                                        let _ = write_frame(stream.as_mut().expect("stream present"), &ctx, err_frame).await;
                                    }
                                    cause = CloseCause::Error(anyhow::anyhow!(
                                        "Malformed PDU (message id {}) from {}",
                                        message_id,
                                        peer_addr
                                    ));
                                    break 'conn;
                                }
                                TryParseResult::Message { message, .. } => {
                                    if state == ConnState::Closing {
                                        // After unbind: drain until the peer
                                        // closes its end.
                                        continue;
                                    }
                                    match dispatch(&ctx, &conn, message) {
                                        Dispatch::Continue => {}
                                        Dispatch::Unbind => {
                                            state = ConnState::Closing;
                                            conn.connection_closed();
                                        }
                                        Dispatch::Protocol(e) => {
                                            cause = CloseCause::Error(e);
                                            break 'conn;
                                        }
                                    }
                                }
                            }
                        }
                    }
                    Err(e) => {
                        cause = CloseCause::Error(
                            anyhow::anyhow!("Read from {} failed: {}", peer_addr, e),
                        );
                        break 'conn;
                    }
                }
            }
        }
    }

    // Closing: exactly one notification, then the socket goes away. After
    // an unbind the session already heard connection_closed.
    ctx.mark_closed();
    let already_notified = state == ConnState::Closing;
    match cause {
        CloseCause::PeerClosed => {
            if !already_notified {
                conn.connection_closed();
            }
        }
        CloseCause::Disconnected(notice) => {
            if !already_notified {
                match &notice {
                    Some((code, message)) => conn.connection_disconnected(*code, message),
                    None => conn.connection_disconnected(result_code::OTHER, ""),
                }
            }
        }
        CloseCause::Error(e) => {
            warn!("Connection from {} failed: {:#}", peer_addr, e);
            if !already_notified {
                conn.connection_error(&e);
            }
        }
    }
    if let Some(mut stream) = stream {
        let _ = stream.shutdown().await;
    }
    state = ConnState::Closed;
    debug!("Connection from {} now {:?}", peer_addr, state);
    Ok(())
}

enum Dispatch {
    Continue,
    Unbind,
    Protocol(anyhow::Error),
}

fn dispatch(ctx: &Arc<ClientContext>, conn: &Arc<dyn ServerConnection>, message: LdapMessage) -> Dispatch {
    let message_id = message.message_id;
    debug!(
        "Dispatching {} (message id {}) from {}",
        message.protocol_op.name(),
        message_id,
        ctx.peer_address()
    );
    match message.protocol_op {
        ProtocolOp::UnbindRequest => return Dispatch::Unbind,
        ProtocolOp::AbandonRequest(abandoned_id) => {
            // No response, per the protocol. Removing the entry first means
            // a racing completion finds nothing to write.
            if ctx.abandon_operation(abandoned_id) {
                conn.handle_abandon(abandoned_id);
            } else {
                debug!("Abandon for unknown operation {}", abandoned_id);
            }
        }
        ProtocolOp::BindRequest(request) => {
            let sink = ResultSink::new(Arc::clone(ctx), message_id, LDAP_TAG_BIND_RESPONSE);
            conn.handle_bind(message_id, request, sink);
        }
        ProtocolOp::SearchRequest(request) => {
            let sink = SearchResultSink {
                inner: ResultSink::new(Arc::clone(ctx), message_id, LDAP_TAG_SEARCH_RESULT_DONE),
            };
            conn.handle_search(message_id, request, sink);
        }
        ProtocolOp::AddRequest(request) => {
            let sink = ResultSink::new(Arc::clone(ctx), message_id, LDAP_TAG_ADD_RESPONSE);
            conn.handle_add(message_id, request, sink);
        }
        ProtocolOp::DelRequest(request) => {
            let sink = ResultSink::new(Arc::clone(ctx), message_id, LDAP_TAG_DEL_RESPONSE);
            conn.handle_delete(message_id, request, sink);
        }
        ProtocolOp::ModifyRequest(request) => {
            let sink = ResultSink::new(Arc::clone(ctx), message_id, LDAP_TAG_MODIFY_RESPONSE);
            conn.handle_modify(message_id, request, sink);
        }
        ProtocolOp::ModifyDnRequest(request) => {
            let sink = ResultSink::new(Arc::clone(ctx), message_id, LDAP_TAG_MODIFY_DN_RESPONSE);
            conn.handle_modify_dn(message_id, request, sink);
        }
        ProtocolOp::CompareRequest(request) => {
            let sink = ResultSink::new(Arc::clone(ctx), message_id, LDAP_TAG_COMPARE_RESPONSE);
            conn.handle_compare(message_id, request, sink);
        }
        ProtocolOp::ExtendedRequest(request) => {
            let sink = ExtendedResultSink::new(Arc::clone(ctx), message_id);
            conn.handle_extended(message_id, request, sink);
        }
        other => {
            // Responses have no business arriving on a server connection.
            let err_frame = encode_error_response(
                message_id,
                response_tag_for_request(0),
                result_code::PROTOCOL_ERROR,
                "",
                "Unsupported operation",
            )
            .unwrap_or_default();
            if !err_frame.is_empty() {
                ctx.send_frame(err_frame);
            }
            return Dispatch::Protocol(anyhow::anyhow!(
                "Unsupported operation {} from {}",
                other.name(),
                ctx.peer_address()
            ));
        }
    }
    Dispatch::Continue
}

async fn write_frame(stream: &mut ServerStream, ctx: &ClientContext, frame: Vec<u8>) -> std::io::Result<()> {
    let layers = ctx.layers.load();
    let mut data = frame;
    for layer in layers.iter() {
        data = layer.wrap(&data);
    }
    stream.write_all(&data).await?;
    stream.flush().await
}

fn unwrap_incoming(ctx: &ClientContext, chunk: &[u8], buffer: &mut BytesMut) -> Result<()> {
    let layers = ctx.layers.load();
    if layers.is_empty() {
        buffer.extend_from_slice(chunk);
        return Ok(());
    }
    let mut data = BytesMut::from(chunk);
    for layer in layers.iter().rev() {
        layer.unwrap(&mut data)?;
    }
    buffer.extend_from_slice(&data);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ldap_protocol::{frame_length, parse_ldap_message, BindAuthentication};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    struct TestConnection {
        ctx: Arc<ClientContext>,
        entries: usize,
        held_sink: Mutex<Option<ResultSink>>,
        closed: AtomicUsize,
        disconnected: AtomicUsize,
        errored: AtomicUsize,
        abandoned: Mutex<Vec<i32>>,
    }

    impl ServerConnection for TestConnection {
        fn handle_bind(&self, _message_id: i32, request: BindRequest, result: ResultSink) {
            if request.name == "cn=slow" {
                *self.held_sink.lock().unwrap() = Some(result);
                return;
            }
            result.complete(LdapResult::success());
        }

        fn handle_search(&self, _message_id: i32, request: SearchRequest, result: SearchResultSink) {
            for i in 0..self.entries {
                result.entry(SearchResultEntry {
                    object_name: format!("cn=entry{},{}", i, request.base_object),
                    attributes: vec![],
                });
            }
            result.done(LdapResult::success());
        }

        fn handle_add(&self, _message_id: i32, _request: AddRequest, result: ResultSink) {
            result.complete(LdapResult::success());
        }

        fn handle_delete(&self, _message_id: i32, _request: DelRequest, result: ResultSink) {
            result.complete(LdapResult::success());
        }

        fn handle_modify(&self, _message_id: i32, _request: ModifyRequest, result: ResultSink) {
            result.complete(LdapResult::success());
        }

        fn handle_modify_dn(&self, _message_id: i32, _request: ModifyDnRequest, result: ResultSink) {
            result.complete(LdapResult::success());
        }

        fn handle_compare(&self, _message_id: i32, _request: CompareRequest, result: ResultSink) {
            result.complete(LdapResult::new(result_code::COMPARE_TRUE, ""));
        }

        fn handle_extended(&self, _message_id: i32, request: ExtendedRequest, result: ExtendedResultSink) {
            if request.request_name == "1.3.6.1.4.1.99999.1" {
                // Test hook: server-side disconnect with notice.
                self.ctx
                    .disconnect(Some((result_code::UNAVAILABLE, "shutting down".to_string())));
                return;
            }
            result.complete(ExtendedResponse {
                result: LdapResult::new(result_code::UNWILLING_TO_PERFORM, "unsupported"),
                response_name: None,
                response_value: None,
            });
        }

        fn handle_abandon(&self, abandoned_id: i32) {
            self.abandoned.lock().unwrap().push(abandoned_id);
        }

        fn connection_closed(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }

        fn connection_disconnected(&self, _result_code: i32, _message: &str) {
            self.disconnected.fetch_add(1, Ordering::SeqCst);
        }

        fn connection_error(&self, _error: &anyhow::Error) {
            self.errored.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct TestFactory {
        entries: usize,
        last: Mutex<Option<Arc<TestConnection>>>,
    }

    impl TestFactory {
        fn new(entries: usize) -> Self {
            Self {
                entries,
                last: Mutex::new(None),
            }
        }
    }

    impl ServerConnectionFactory for TestFactory {
        fn accept(&self, ctx: Arc<ClientContext>) -> Result<Arc<dyn ServerConnection>> {
            let conn = Arc::new(TestConnection {
                ctx,
                entries: self.entries,
                held_sink: Mutex::new(None),
                closed: AtomicUsize::new(0),
                disconnected: AtomicUsize::new(0),
                errored: AtomicUsize::new(0),
                abandoned: Mutex::new(Vec::new()),
            });
            *self.last.lock().unwrap() = Some(Arc::clone(&conn));
            Ok(conn)
        }
    }

    async fn start_server(factory: Arc<TestFactory>) -> (SocketAddr, tokio::task::JoinHandle<()>) {
        let server = LdapServer::bind("ldap://127.0.0.1:0", factory, None)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let _ = server.run().await;
        });
        (addr, handle)
    }

    async fn read_message(stream: &mut TcpStream, buffer: &mut BytesMut) -> LdapMessage {
        let mut read_buf = [0u8; 4096];
        loop {
            if let Some(total) = frame_length(buffer).unwrap() {
                if buffer.len() >= total {
                    let frame = buffer.split_to(total);
                    return parse_ldap_message(&frame).unwrap();
                }
            }
            let n = stream.read(&mut read_buf).await.unwrap();
            assert!(n > 0, "server closed unexpectedly");
            buffer.extend_from_slice(&read_buf[..n]);
        }
    }

    async fn send(stream: &mut TcpStream, message: &LdapMessage) {
        let frame = encode_ldap_message(message).unwrap();
        stream.write_all(&frame).await.unwrap();
        stream.flush().await.unwrap();
    }

    fn bind_message(message_id: i32, name: &str) -> LdapMessage {
        LdapMessage {
            message_id,
            protocol_op: ProtocolOp::BindRequest(BindRequest {
                version: 3,
                name: name.to_string(),
                authentication: BindAuthentication::Simple("secret".to_string()),
            }),
            controls: None,
        }
    }

    #[tokio::test]
    async fn test_search_streams_entries_then_done_on_same_message_id() {
        let factory = Arc::new(TestFactory::new(3));
        let (addr, _server) = start_server(Arc::clone(&factory)).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut buffer = BytesMut::new();

        send(
            &mut stream,
            &LdapMessage {
                message_id: 7,
                protocol_op: ProtocolOp::SearchRequest(SearchRequest::subtree("dc=example")),
                controls: None,
            },
        )
        .await;

        for _ in 0..3 {
            let message = read_message(&mut stream, &mut buffer).await;
            assert_eq!(message.message_id, 7);
            assert!(matches!(message.protocol_op, ProtocolOp::SearchResultEntry(_)));
        }
        let done = read_message(&mut stream, &mut buffer).await;
        assert_eq!(done.message_id, 7);
        match done.protocol_op {
            ProtocolOp::SearchResultDone(result) => assert!(result.is_success()),
            other => panic!("expected done, got {}", other.name()),
        }
    }

    #[tokio::test]
    async fn test_abandoned_operation_never_gets_a_response() {
        let factory = Arc::new(TestFactory::new(0));
        let (addr, _server) = start_server(Arc::clone(&factory)).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut buffer = BytesMut::new();

        // A bind the handler parks, then an abandon for it, then a bind
        // that answers immediately. Reading response 2 proves the abandon
        // was processed.
        send(&mut stream, &bind_message(1, "cn=slow")).await;
        send(
            &mut stream,
            &LdapMessage {
                message_id: 2,
                protocol_op: ProtocolOp::AbandonRequest(1),
                controls: None,
            },
        )
        .await;
        send(&mut stream, &bind_message(3, "cn=fast")).await;
        let response = read_message(&mut stream, &mut buffer).await;
        assert_eq!(response.message_id, 3);

        // Completing the parked sink now writes nothing.
        let conn = factory.last.lock().unwrap().clone().unwrap();
        assert_eq!(*conn.abandoned.lock().unwrap(), vec![1]);
        let held = conn.held_sink.lock().unwrap().take().unwrap();
        held.complete(LdapResult::success());

        send(&mut stream, &bind_message(4, "cn=fast")).await;
        let response = read_message(&mut stream, &mut buffer).await;
        assert_eq!(response.message_id, 4, "abandoned response leaked");
    }

    #[tokio::test]
    async fn test_unbind_notifies_closed_once_and_defers_socket_close() {
        let factory = Arc::new(TestFactory::new(0));
        let (addr, _server) = start_server(Arc::clone(&factory)).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        send(
            &mut stream,
            &LdapMessage {
                message_id: 1,
                protocol_op: ProtocolOp::UnbindRequest,
                controls: None,
            },
        )
        .await;
        // The server drains rather than closing; requests after unbind are
        // ignored, and the socket stays open until we close it.
        send(&mut stream, &bind_message(2, "cn=fast")).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let conn = factory.last.lock().unwrap().clone().unwrap();
        assert_eq!(conn.closed.load(Ordering::SeqCst), 1);
        assert!(!conn.ctx.is_closed(), "socket close must wait for the peer");

        drop(stream);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(conn.closed.load(Ordering::SeqCst), 1, "notified more than once");
        assert_eq!(conn.errored.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_disconnect_sends_notice_of_disconnection_then_closes() {
        let factory = Arc::new(TestFactory::new(0));
        let (addr, _server) = start_server(Arc::clone(&factory)).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut buffer = BytesMut::new();

        send(
            &mut stream,
            &LdapMessage {
                message_id: 5,
                protocol_op: ProtocolOp::ExtendedRequest(ExtendedRequest {
                    request_name: "1.3.6.1.4.1.99999.1".to_string(),
                    request_value: None,
                }),
                controls: None,
            },
        )
        .await;

        let notice = read_message(&mut stream, &mut buffer).await;
        assert_eq!(notice.message_id, 0);
        match notice.protocol_op {
            ProtocolOp::ExtendedResponse(response) => {
                assert_eq!(
                    response.response_name.as_deref(),
                    Some(NOTICE_OF_DISCONNECTION_OID)
                );
                assert_eq!(response.result.result_code, result_code::UNAVAILABLE);
            }
            other => panic!("expected notice, got {}", other.name()),
        }
        // Then EOF.
        let mut rest = [0u8; 16];
        let n = stream.read(&mut rest).await.unwrap();
        assert_eq!(n, 0);

        let conn = factory.last.lock().unwrap().clone().unwrap();
        assert_eq!(conn.disconnected.load(Ordering::SeqCst), 1);
        assert_eq!(conn.closed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_malformed_stream_gets_protocol_error_then_teardown() {
        let factory = Arc::new(TestFactory::new(0));
        let (addr, _server) = start_server(Arc::clone(&factory)).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut buffer = BytesMut::new();

        // Not a SEQUENCE: invalid LDAP stream.
        stream.write_all(&[0x04, 0x02, 0xAA, 0xBB]).await.unwrap();
        stream.flush().await.unwrap();

        let response = read_message(&mut stream, &mut buffer).await;
        match response.protocol_op {
            ProtocolOp::BindResponse(result) => {
                assert_eq!(result.result_code, result_code::PROTOCOL_ERROR)
            }
            other => panic!("expected error response, got {}", other.name()),
        }
        let mut rest = [0u8; 16];
        let n = stream.read(&mut rest).await.unwrap();
        assert_eq!(n, 0, "connection should be torn down");

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let conn = factory.last.lock().unwrap().clone().unwrap();
        assert_eq!(conn.errored.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_compare_true_is_a_successful_terminal_result() {
        let factory = Arc::new(TestFactory::new(0));
        let (addr, _server) = start_server(factory).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut buffer = BytesMut::new();

        send(
            &mut stream,
            &LdapMessage {
                message_id: 9,
                protocol_op: ProtocolOp::CompareRequest(CompareRequest {
                    entry: "cn=a".to_string(),
                    attr: "cn".to_string(),
                    assertion_value: b"a".to_vec(),
                }),
                controls: None,
            },
        )
        .await;
        let response = read_message(&mut stream, &mut buffer).await;
        assert_eq!(response.message_id, 9);
        match response.protocol_op {
            ProtocolOp::CompareResponse(result) => {
                assert_eq!(result.result_code, result_code::COMPARE_TRUE);
                assert!(result.is_success());
            }
            other => panic!("expected compare response, got {}", other.name()),
        }
    }

    fn test_context() -> Arc<ClientContext> {
        let (tx, rx) = mpsc::unbounded_channel();
        // Keep the command channel open so sends from the context succeed.
        std::mem::forget(rx);
        Arc::new(ClientContext::new(
            "127.0.0.1:1389".parse().unwrap(),
            "127.0.0.1:50000".parse().unwrap(),
            tx,
            false,
        ))
    }

    #[test]
    fn test_second_tls_install_fails_fast_and_keeps_first() {
        let config = Arc::new(
            rustls::ServerConfig::builder()
                .with_no_client_auth()
                .with_cert_resolver(Arc::new(rustls::server::ResolvesServerCertUsingSni::new())),
        );
        let ctx = test_context();
        assert_eq!(ctx.security_strength_factor(), 0);
        ctx.enable_tls(Arc::clone(&config)).unwrap();
        let err = ctx.enable_tls(config).unwrap_err();
        assert!(err.to_string().contains("already installed"));
    }

    struct NullLayer {
        name: String,
        ssf: u32,
    }

    impl SecurityLayerProvider for NullLayer {
        fn name(&self) -> &str {
            &self.name
        }
        fn ssf(&self) -> u32 {
            self.ssf
        }
        fn wrap(&self, frame: &[u8]) -> Vec<u8> {
            frame.to_vec()
        }
        fn unwrap(&self, _data: &mut BytesMut) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_security_layers_raise_ssf() {
        let ctx = test_context();
        assert_eq!(ctx.security_strength_factor(), 0);
        ctx.enable_connection_security_layer(Arc::new(NullLayer {
            name: "test-wrap".to_string(),
            ssf: 56,
        }));
        assert_eq!(ctx.security_strength_factor(), 56);
        ctx.enable_connection_security_layer(Arc::new(NullLayer {
            name: "test-wrap-2".to_string(),
            ssf: 40,
        }));
        assert_eq!(ctx.security_strength_factor(), 56);
        assert_eq!(ctx.layers.load().len(), 2);
    }

    #[test]
    fn test_parse_listen_url() {
        let addr = parse_listen_url("ldap://127.0.0.1:1389").unwrap();
        assert_eq!(addr.port(), 1389);
        let addr = parse_listen_url("ldaps://:636").unwrap();
        assert_eq!(addr.port(), 636);
        assert_eq!(addr.ip().to_string(), "0.0.0.0");
        assert!(parse_listen_url("http://127.0.0.1:1389").is_err());
    }
}
