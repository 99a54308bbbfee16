// Client-side connection factory and response demultiplexer.
//
// A connection owns one socket. Requests are written through a writer task;
// a reader task correlates every inbound message to its pending operation by
// message id and completes the matching future. Unsolicited notifications
// (message id 0) terminate the connection when they carry the
// notice-of-disconnection OID.

use crate::future::{future_pair, LdapFuture, OperationError};
use crate::ldap_protocol::{
    encode_ldap_message, try_parse_message, BindAuthentication, BindRequest, ExtendedRequest,
    LdapMessage, LdapResult, ProtocolOp, SearchRequest, TryParseResult,
    NOTICE_OF_DISCONNECTION_OID, START_TLS_OID,
};
use crate::pending::{PendingOp, PendingTable, SearchEvent};
use anyhow::{Context, Result};
use bytes::BytesMut;
use rustls::client::ClientConfig;
use rustls_pki_types::ServerName;
use std::fmt;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

/// How the connection is secured. StartTLS negotiates in-band after the
/// plain connect; implicit TLS wraps the socket before any LDAP traffic.
#[derive(Clone)]
pub enum ConnectionSecurity {
    None,
    StartTls(Arc<ClientConfig>),
    Tls(Arc<ClientConfig>),
}

/// Connect failures carry distinct kinds so callers can tell a transport
/// failure from a failed or refused TLS negotiation.
#[derive(Debug)]
pub enum ConnectError {
    /// TCP connect failed or timed out.
    Transport(String),
    /// TLS handshake failed after the transport was established. The
    /// partially established stream has been closed.
    TlsHandshake(String),
    /// The server answered the StartTLS request with a non-success result.
    StartTlsRefused(LdapResult),
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectError::Transport(msg) => write!(f, "connect failed: {}", msg),
            ConnectError::TlsHandshake(msg) => write!(f, "TLS handshake failed: {}", msg),
            ConnectError::StartTlsRefused(result) => write!(
                f,
                "StartTLS refused: code {} ({})",
                result.result_code, result.diagnostic_message
            ),
        }
    }
}

impl std::error::Error for ConnectError {}

/// Stream to the server: plain TCP or TLS-wrapped.
pub enum ClientStream {
    Tcp(TcpStream),
    Tls(TlsStream<TcpStream>),
}

impl AsyncRead for ClientStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ClientStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            ClientStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match &mut *self {
            ClientStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            ClientStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }
    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ClientStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            ClientStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }
    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ClientStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            ClientStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

impl Unpin for ClientStream {}

/// Immutable connect options; a factory can be shared and produces one
/// connection per `connect` call.
#[derive(Clone)]
pub struct ConnectionFactory {
    security: ConnectionSecurity,
    connect_timeout: Duration,
    tls_server_name: Option<String>,
}

impl ConnectionFactory {
    pub fn new(security: ConnectionSecurity) -> Self {
        Self {
            security,
            connect_timeout: Duration::from_secs(10),
            tls_server_name: None,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// SNI name for TLS; defaults to the target IP.
    pub fn with_tls_server_name(mut self, name: impl Into<String>) -> Self {
        self.tls_server_name = Some(name.into());
        self
    }

    /// Establish a connection. Dropping the returned future mid-connect
    /// drops the owned socket, so a cancelled connect never leaks a stream.
    pub async fn connect(&self, addr: SocketAddr) -> Result<LdapConnection, ConnectError> {
        let tcp = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ConnectError::Transport(format!("timeout connecting to {}", addr)))?
            .map_err(|e| ConnectError::Transport(format!("{}: {}", addr, e)))?;

        let stream = match &self.security {
            ConnectionSecurity::None => ClientStream::Tcp(tcp),
            ConnectionSecurity::Tls(config) => {
                ClientStream::Tls(self.tls_handshake(Arc::clone(config), addr, tcp).await?)
            }
            ConnectionSecurity::StartTls(config) => {
                let mut plain = ClientStream::Tcp(tcp);
                self.negotiate_starttls(&mut plain).await?;
                let tcp = match plain {
                    ClientStream::Tcp(t) => t,
                    ClientStream::Tls(_) => unreachable!("StartTLS runs on a plain stream"),
                };
                ClientStream::Tls(self.tls_handshake(Arc::clone(config), addr, tcp).await?)
            }
        };

        Ok(LdapConnection::spawn(stream, addr))
    }

    async fn tls_handshake(
        &self,
        config: Arc<ClientConfig>,
        addr: SocketAddr,
        tcp: TcpStream,
    ) -> Result<TlsStream<TcpStream>, ConnectError> {
        let server_name = match &self.tls_server_name {
            Some(name) => ServerName::try_from(name.clone())
                .map_err(|_| ConnectError::TlsHandshake(format!("invalid SNI name {}", name)))?,
            None => ServerName::from(addr.ip()),
        };
        let connector = TlsConnector::from(config);
        // The tcp stream is owned by the handshake future; a failure (or a
        // dropped future) closes it.
        connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| ConnectError::TlsHandshake(format!("{}: {}", addr, e)))
    }

    /// Send a StartTLS extended request on the still-plain stream and wait
    /// for the matching response before upgrading.
    async fn negotiate_starttls(&self, stream: &mut ClientStream) -> Result<(), ConnectError> {
        let request = LdapMessage {
            message_id: 1,
            protocol_op: ProtocolOp::ExtendedRequest(ExtendedRequest {
                request_name: START_TLS_OID.to_string(),
                request_value: None,
            }),
            controls: None,
        };
        let data = encode_ldap_message(&request)
            .map_err(|e| ConnectError::Transport(format!("encode StartTLS request: {}", e)))?;
        stream
            .write_all(&data)
            .await
            .map_err(|e| ConnectError::Transport(format!("send StartTLS request: {}", e)))?;
        stream
            .flush()
            .await
            .map_err(|e| ConnectError::Transport(format!("flush StartTLS request: {}", e)))?;

        let mut buffer = BytesMut::with_capacity(512);
        let response = read_one_message(stream, &mut buffer)
            .await
            .map_err(|e| ConnectError::Transport(format!("read StartTLS response: {}", e)))?;
        match response.protocol_op {
            ProtocolOp::ExtendedResponse(resp) if resp.result.is_success() => Ok(()),
            ProtocolOp::ExtendedResponse(resp) => Err(ConnectError::StartTlsRefused(resp.result)),
            other => Err(ConnectError::TlsHandshake(format!(
                "unexpected {} while negotiating StartTLS",
                other.name()
            ))),
        }
    }
}

async fn read_one_message(stream: &mut ClientStream, buffer: &mut BytesMut) -> Result<LdapMessage> {
    let mut read_buf = [0u8; 4096];
    loop {
        match try_parse_message(buffer)? {
            TryParseResult::Message { message, .. } => return Ok(message),
            TryParseResult::ParseError { .. } => {
                anyhow::bail!("malformed message from server")
            }
            TryParseResult::Incomplete => {}
        }
        let n = stream.read(&mut read_buf).await?;
        if n == 0 {
            anyhow::bail!("connection closed by server");
        }
        buffer.extend_from_slice(&read_buf[..n]);
    }
}

/// An established client connection. Cloneable handles share the same
/// socket, pending table, and writer.
#[derive(Clone)]
pub struct LdapConnection {
    pending: Arc<PendingTable>,
    writer: mpsc::UnboundedSender<Vec<u8>>,
    closed: Arc<AtomicBool>,
    peer_addr: SocketAddr,
}

impl std::fmt::Debug for LdapConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LdapConnection")
            .field("peer_addr", &self.peer_addr)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl LdapConnection {
    fn spawn(stream: ClientStream, peer_addr: SocketAddr) -> Self {
        let pending = Arc::new(PendingTable::new());
        let closed = Arc::new(AtomicBool::new(false));
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let (read_half, mut write_half) = tokio::io::split(stream);

        // Writer task: the single owner of the write half. Once a write
        // fails, further frames are discarded.
        let writer_closed = Arc::clone(&closed);
        let writer_pending = Arc::clone(&pending);
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = write_half.write_all(&frame).await {
                    debug!("Write to {} failed: {}", peer_addr, e);
                    writer_closed.store(true, Ordering::Release);
                    writer_pending
                        .fail_all(&OperationError::ConnectionClosed(e.to_string()));
                    break;
                }
                if let Err(e) = write_half.flush().await {
                    debug!("Flush to {} failed: {}", peer_addr, e);
                    writer_closed.store(true, Ordering::Release);
                    writer_pending
                        .fail_all(&OperationError::ConnectionClosed(e.to_string()));
                    break;
                }
            }
            let _ = write_half.shutdown().await;
        });

        // Reader task: demultiplex responses to their pending operations.
        let reader_pending = Arc::clone(&pending);
        let reader_closed = Arc::clone(&closed);
        tokio::spawn(async move {
            let reason = demux_loop(read_half, &reader_pending, peer_addr).await;
            reader_closed.store(true, Ordering::Release);
            reader_pending.fail_all(&OperationError::ConnectionClosed(reason));
        });

        Self {
            pending,
            writer: tx,
            closed,
            peer_addr,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn send_frame(&self, frame: Vec<u8>) -> Result<()> {
        if self.is_closed() {
            anyhow::bail!("connection to {} is closed", self.peer_addr);
        }
        self.writer
            .send(frame)
            .map_err(|_| anyhow::anyhow!("connection to {} is closed", self.peer_addr))
    }

    /// Send a request and return the future of its terminal response. The
    /// future's cancel path sends an abandon for the allocated message id.
    pub fn send_request(&self, op: ProtocolOp) -> Result<LdapFuture<ProtocolOp>> {
        self.send_request_inner(op, None)
    }

    /// Send a search request; entries and references stream into `sink`
    /// before the future resolves with the search done response.
    pub fn search(
        &self,
        request: SearchRequest,
        sink: impl Fn(SearchEvent) + Send + Sync + 'static,
    ) -> Result<LdapFuture<ProtocolOp>> {
        self.send_request_inner(ProtocolOp::SearchRequest(request), Some(Box::new(sink)))
    }

    fn send_request_inner(
        &self,
        op: ProtocolOp,
        sink: Option<Box<dyn Fn(SearchEvent) + Send + Sync>>,
    ) -> Result<LdapFuture<ProtocolOp>> {
        let message_id = self.pending.allocate_id();
        let message = LdapMessage {
            message_id,
            protocol_op: op,
            controls: None,
        };
        let frame = encode_ldap_message(&message).context("encode request")?;

        let (future, completion) = future_pair();
        let pending_op = match sink {
            Some(sink) => PendingOp::with_search_sink(completion, move |event| sink(event)),
            None => PendingOp::new(completion),
        };
        self.pending.insert(message_id, pending_op);

        // Cancel sends an abandon under a fresh message id and removes the
        // entry; the Cancelled outcome is delivered by the future itself.
        let abandon_writer = self.writer.clone();
        let abandon_pending = Arc::clone(&self.pending);
        future.on_cancel(move || {
            abandon_pending.remove(message_id);
            let abandon = LdapMessage {
                message_id: abandon_pending.allocate_id(),
                protocol_op: ProtocolOp::AbandonRequest(message_id),
                controls: None,
            };
            if let Ok(frame) = encode_ldap_message(&abandon) {
                let _ = abandon_writer.send(frame);
            }
        });

        if let Err(e) = self.send_frame(frame) {
            self.pending.remove(message_id);
            return Err(e);
        }
        Ok(future)
    }

    /// Simple bind convenience.
    pub fn bind_simple(&self, name: &str, password: &str) -> Result<LdapFuture<ProtocolOp>> {
        self.send_request(ProtocolOp::BindRequest(BindRequest {
            version: 3,
            name: name.to_string(),
            authentication: BindAuthentication::Simple(password.to_string()),
        }))
    }

    /// Send an unbind and stop accepting new requests; the peer closes the
    /// socket.
    pub fn unbind(&self) -> Result<()> {
        let frame = encode_ldap_message(&LdapMessage {
            message_id: self.pending.allocate_id(),
            protocol_op: ProtocolOp::UnbindRequest,
            controls: None,
        })?;
        self.send_frame(frame)?;
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

async fn demux_loop(
    mut read_half: tokio::io::ReadHalf<ClientStream>,
    pending: &PendingTable,
    peer_addr: SocketAddr,
) -> String {
    let mut buffer = BytesMut::with_capacity(4096);
    let mut read_buf = [0u8; 4096];
    loop {
        loop {
            let parsed = match try_parse_message(&mut buffer) {
                Ok(p) => p,
                Err(e) => {
                    warn!("Unreadable data from {}: {}", peer_addr, e);
                    return format!("protocol error: {}", e);
                }
            };
            match parsed {
                TryParseResult::Incomplete => break,
                TryParseResult::ParseError { message_id, .. } => {
                    // A single unparseable response fails only its own
                    // operation, not the whole connection.
                    if let Some(op) = pending.remove(message_id) {
                        op.completion().fail(OperationError::Protocol(
                            "unparseable response".to_string(),
                        ));
                    }
                }
                TryParseResult::Message { message, .. } => {
                    if let Some(reason) = route_response(pending, message, peer_addr) {
                        return reason;
                    }
                }
            }
        }
        match read_half.read(&mut read_buf).await {
            Ok(0) => return "closed by peer".to_string(),
            Ok(n) => buffer.extend_from_slice(&read_buf[..n]),
            Err(e) => return e.to_string(),
        }
    }
}

/// Route one inbound message. Returns Some(reason) when the connection must
/// terminate (notice of disconnection).
fn route_response(
    pending: &PendingTable,
    message: LdapMessage,
    peer_addr: SocketAddr,
) -> Option<String> {
    let message_id = message.message_id;

    // Message id 0 carries unsolicited notifications.
    if message_id == 0 {
        if let ProtocolOp::ExtendedResponse(resp) = &message.protocol_op {
            if resp.response_name.as_deref() == Some(NOTICE_OF_DISCONNECTION_OID) {
                warn!(
                    "Notice of disconnection from {}: code {} ({})",
                    peer_addr, resp.result.result_code, resp.result.diagnostic_message
                );
                return Some(format!(
                    "notice of disconnection: {}",
                    resp.result.diagnostic_message
                ));
            }
            warn!(
                "Unsolicited notification from {}: {:?}",
                peer_addr, resp.response_name
            );
            return None;
        }
        warn!("Unexpected message id 0 from {}", peer_addr);
        return None;
    }

    match message.protocol_op {
        ProtocolOp::SearchResultEntry(entry) => {
            let delivered = pending
                .with(message_id, |op| {
                    op.deliver_search_event(SearchEvent::Entry(entry))
                })
                .is_some();
            if !delivered {
                debug!("Entry for unknown msgid {} from {}", message_id, peer_addr);
            }
        }
        ProtocolOp::SearchResultReference(uris) => {
            pending.with(message_id, |op| {
                op.deliver_search_event(SearchEvent::Reference(uris))
            });
        }
        ProtocolOp::IntermediateResponse(resp) => {
            pending.with(message_id, |op| {
                op.touch();
                op.completion().intermediate(&resp)
            });
        }
        op if op.is_terminal_response() => match pending.remove(message_id) {
            Some(pending_op) => {
                pending_op.completion().complete(op);
            }
            None => {
                // Abandoned or unknown operation; drop the late response.
                debug!(
                    "Response {} for unknown msgid {} from {}",
                    op.name(),
                    message_id,
                    peer_addr
                );
            }
        },
        op => {
            warn!(
                "Unexpected {} from {} (msgid {})",
                op.name(),
                peer_addr,
                message_id
            );
        }
    }
    None
}

/// Extract the LDAP result from a terminal response op.
pub fn result_of(op: &ProtocolOp) -> Option<&LdapResult> {
    match op {
        ProtocolOp::BindResponse(r)
        | ProtocolOp::SearchResultDone(r)
        | ProtocolOp::ModifyResponse(r)
        | ProtocolOp::AddResponse(r)
        | ProtocolOp::DelResponse(r)
        | ProtocolOp::ModifyDnResponse(r)
        | ProtocolOp::CompareResponse(r) => Some(r),
        ProtocolOp::ExtendedResponse(resp) => Some(&resp.result),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ldap_protocol::{
        result_code, Attribute, ExtendedResponse, SearchResultEntry,
    };
    use std::sync::Mutex;
    use tokio::net::TcpListener;

    /// Scripted server: applies `respond` to each inbound message and writes
    /// back whatever frames it returns.
    async fn scripted_server(
        respond: impl Fn(&LdapMessage) -> Vec<LdapMessage> + Send + 'static,
    ) -> (SocketAddr, tokio::task::JoinHandle<Vec<LdapMessage>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buffer = BytesMut::with_capacity(4096);
            let mut read_buf = [0u8; 4096];
            let mut seen = Vec::new();
            loop {
                loop {
                    match try_parse_message(&mut buffer) {
                        Ok(TryParseResult::Message { message, .. }) => {
                            seen.push(message.clone());
                            if matches!(message.protocol_op, ProtocolOp::UnbindRequest) {
                                return seen;
                            }
                            for response in respond(&message) {
                                let data = encode_ldap_message(&response).unwrap();
                                stream.write_all(&data).await.unwrap();
                            }
                            stream.flush().await.unwrap();
                        }
                        Ok(TryParseResult::Incomplete) => break,
                        _ => return seen,
                    }
                }
                match stream.read(&mut read_buf).await {
                    Ok(0) | Err(_) => return seen,
                    Ok(n) => buffer.extend_from_slice(&read_buf[..n]),
                }
            }
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn test_bind_response_resolves_future() {
        let (addr, _server) = scripted_server(|request| {
            vec![LdapMessage {
                message_id: request.message_id,
                protocol_op: ProtocolOp::BindResponse(LdapResult::success()),
                controls: None,
            }]
        })
        .await;

        let factory = ConnectionFactory::new(ConnectionSecurity::None);
        let conn = factory.connect(addr).await.unwrap();
        let future = conn.bind_simple("cn=admin", "secret").unwrap();
        let op = tokio::task::spawn_blocking(move || future.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(result_of(&op).unwrap().is_success());
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_search_streams_entries_then_done() {
        let (addr, _server) = scripted_server(|request| {
            let entry = |dn: &str| {
                ProtocolOp::SearchResultEntry(SearchResultEntry {
                    object_name: dn.to_string(),
                    attributes: vec![Attribute::new("cn", vec![b"x".to_vec()])],
                })
            };
            vec![
                LdapMessage {
                    message_id: request.message_id,
                    protocol_op: entry("cn=a,dc=example,dc=com"),
                    controls: None,
                },
                LdapMessage {
                    message_id: request.message_id,
                    protocol_op: entry("cn=b,dc=example,dc=com"),
                    controls: None,
                },
                LdapMessage {
                    message_id: request.message_id,
                    protocol_op: entry("cn=c,dc=example,dc=com"),
                    controls: None,
                },
                LdapMessage {
                    message_id: request.message_id,
                    protocol_op: ProtocolOp::SearchResultDone(LdapResult::success()),
                    controls: None,
                },
            ]
        })
        .await;

        let factory = ConnectionFactory::new(ConnectionSecurity::None);
        let conn = factory.connect(addr).await.unwrap();
        let entries = Arc::new(Mutex::new(Vec::new()));
        let sink_target = Arc::clone(&entries);
        let future = conn
            .search(SearchRequest::subtree("dc=example,dc=com"), move |event| {
                if let SearchEvent::Entry(entry) = event {
                    sink_target.lock().unwrap().push(entry.object_name);
                }
            })
            .unwrap();

        let op = tokio::task::spawn_blocking(move || future.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(op, ProtocolOp::SearchResultDone(ref r) if r.is_success()));
        // All three entries arrived before the done response resolved.
        assert_eq!(
            *entries.lock().unwrap(),
            vec![
                "cn=a,dc=example,dc=com",
                "cn=b,dc=example,dc=com",
                "cn=c,dc=example,dc=com"
            ]
        );
    }

    #[tokio::test]
    async fn test_cancel_sends_abandon_and_drops_late_response() {
        // Server never answers binds; it only records what it receives.
        let (addr, server) = scripted_server(|_| Vec::new()).await;

        let factory = ConnectionFactory::new(ConnectionSecurity::None);
        let conn = factory.connect(addr).await.unwrap();
        let future = conn.bind_simple("cn=admin", "secret").unwrap();

        assert!(future.cancel());
        assert!(!future.cancel());
        assert_eq!(future.wait(), Err(OperationError::Cancelled));
        assert_eq!(conn.pending_count(), 0);

        conn.unbind().unwrap();
        let seen = server.await.unwrap();
        let abandons: Vec<_> = seen
            .iter()
            .filter_map(|m| match m.protocol_op {
                ProtocolOp::AbandonRequest(id) => Some(id),
                _ => None,
            })
            .collect();
        // Exactly one abandon, naming the bind's message id.
        assert_eq!(abandons, vec![1]);
    }

    #[tokio::test]
    async fn test_notice_of_disconnection_fails_pending_ops() {
        let (addr, _server) = scripted_server(|_| {
            vec![LdapMessage {
                message_id: 0,
                protocol_op: ProtocolOp::ExtendedResponse(ExtendedResponse {
                    result: LdapResult::new(result_code::UNAVAILABLE, "shutting down"),
                    response_name: Some(NOTICE_OF_DISCONNECTION_OID.to_string()),
                    response_value: None,
                }),
                controls: None,
            }]
        })
        .await;

        let factory = ConnectionFactory::new(ConnectionSecurity::None);
        let conn = factory.connect(addr).await.unwrap();
        let future = conn.bind_simple("cn=admin", "secret").unwrap();
        let outcome = tokio::task::spawn_blocking(move || future.wait())
            .await
            .unwrap();
        assert!(matches!(outcome, Err(OperationError::ConnectionClosed(_))));
        // The reader marked the connection closed.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_transport_failure_is_distinct_kind() {
        let factory = ConnectionFactory::new(ConnectionSecurity::None)
            .with_connect_timeout(Duration::from_millis(200));
        // Port 1 on localhost refuses connections.
        let err = factory
            .connect("127.0.0.1:1".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::Transport(_)));
    }

    #[tokio::test]
    async fn test_starttls_refused_closes_and_reports() {
        let (addr, _server) = scripted_server(|request| {
            vec![LdapMessage {
                message_id: request.message_id,
                protocol_op: ProtocolOp::ExtendedResponse(ExtendedResponse {
                    result: LdapResult::new(
                        result_code::UNWILLING_TO_PERFORM,
                        "TLS not configured",
                    ),
                    response_name: Some(START_TLS_OID.to_string()),
                    response_value: None,
                }),
                controls: None,
            }]
        })
        .await;

        let tls_config = Arc::new(
            ClientConfig::builder()
                .with_root_certificates(rustls::RootCertStore::empty())
                .with_no_client_auth(),
        );
        let factory = ConnectionFactory::new(ConnectionSecurity::StartTls(tls_config));
        let err = factory.connect(addr).await.unwrap_err();
        match err {
            ConnectError::StartTlsRefused(result) => {
                assert_eq!(result.result_code, result_code::UNWILLING_TO_PERFORM);
            }
            other => panic!("expected StartTlsRefused, got {}", other),
        }
    }
}
