//! The client-side protocol state machine.
//!
//! One session per client connection: handshake (with optional PROXY
//! header and TLS), the authentication sub-machine against the cached
//! user database, then the command loop that feeds the filter chain and
//! router. Teardown always goes through the same cleanup path so the
//! registry and pools stay consistent.

mod command;
mod history;
mod registry;
mod state;

pub use history::{HistoryEntry, SessionHistory};
pub use registry::{BackendRef, SessionHandle, SessionRegistry};
pub use state::{PreparedStatement, SessionState, StagedAuth, TransactionTracker};

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::BytesMut;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::auth::{
    select_backend_credentials, verify_client_token, AuthError, BackendCredentials, TokenCheck,
};
use crate::backend::BackendConnection;
use crate::config::{AuthConfig, Config, ListenerConfig, RouterConfig, ServiceConfig};
use crate::metrics::metrics;
use crate::parser::Classifier;
use crate::protocol::{
    capabilities, error_codes, proxy, ErrPacket, HandshakeResponse, InitialHandshake,
    LogicalPacket, OkPacket, Packet, PacketAssembler, PacketCodec, SequenceError, SslRequest,
    AssembleResult, SCRAMBLE_LEN,
};
use crate::router::{build_chain, FilterSession, RwSplitSession, ServiceGraph, ServiceId};
use crate::target::{Server, ServerVersion};
use crate::users::{ResolvedHostname, UserSearchOutcome, UserSearchSettings};
use crate::worker::Worker;

/// Session errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Client disconnected")]
    ClientDisconnected,

    #[error("Packets out of order: {0}")]
    Sequence(#[from] SequenceError),

    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("Backend error: {0}")]
    Backend(#[from] crate::backend::BackendError),

    #[error("Routing error: {0}")]
    Routing(String),

    #[error("Session killed")]
    Killed,
}

/// Everything a session needs that outlives any one session.
pub struct SessionContext {
    pub listener: ListenerConfig,
    pub service: ServiceConfig,
    pub router_config: RouterConfig,
    pub auth_config: AuthConfig,
    pub graph: Arc<ServiceGraph>,
    pub service_id: ServiceId,
    pub registry: Arc<SessionRegistry>,
    pub tls: Option<TlsAcceptor>,
    pub search_settings: UserSearchSettings,
    /// Failed-authentication counters per client host.
    pub host_block: DashMap<String, u32>,
}

impl SessionContext {
    pub fn new(
        config: &Config,
        graph: Arc<ServiceGraph>,
        registry: Arc<SessionRegistry>,
        tls: Option<TlsAcceptor>,
    ) -> Arc<Self> {
        let service = config.listener_service().clone();
        let service_id = graph
            .service_id(&service.name)
            .expect("listener service exists in the graph");
        Arc::new(Self {
            search_settings: UserSearchSettings::from(&config.listener),
            listener: config.listener.clone(),
            service,
            router_config: config.router.clone(),
            auth_config: config.auth.clone(),
            graph,
            service_id,
            registry,
            tls,
            host_block: DashMap::new(),
        })
    }

    fn host_blocked(&self, host: &str) -> bool {
        self.host_block
            .get(host)
            .map(|count| *count >= self.listener.max_auth_errors_until_block)
            .unwrap_or(false)
    }

    fn record_auth_failure(&self, host: &str) {
        *self.host_block.entry(host.to_string()).or_insert(0) += 1;
    }

    fn record_auth_success(&self, host: &str) {
        self.host_block.remove(host);
    }
}

/// A TCP stream that first yields bytes buffered before a transport
/// switch. The TLS ClientHello may already sit in the codec's read
/// buffer when the SSLRequest is processed; those bytes must reach the
/// TLS engine.
pub struct PrefixedIo {
    prefix: BytesMut,
    inner: TcpStream,
}

impl PrefixedIo {
    pub fn new(prefix: BytesMut, inner: TcpStream) -> Self {
        Self { prefix, inner }
    }
}

impl AsyncRead for PrefixedIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if !this.prefix.is_empty() {
            let take = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix.split_to(take));
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for PrefixedIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Client transport: plain TCP or TLS, decided during the handshake.
pub enum ClientStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<PrefixedIo>>),
}

impl ClientStream {
    pub fn is_tls(&self) -> bool {
        matches!(self, ClientStream::Tls(_))
    }
}

impl AsyncRead for ClientStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            ClientStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            ClientStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            ClientStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain(s) => Pin::new(s).poll_flush(cx),
            ClientStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            ClientStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

pub type ClientFramed = Framed<ClientStream, PacketCodec>;

/// Compute the capability set offered to clients: the intersection of
/// what every reachable backend advertised, with version-driven masking
/// and the router's protocol requirements applied.
pub fn negotiate_capabilities(servers: &[Arc<Server>], router: &RouterConfig) -> u64 {
    use capabilities::*;

    let mut caps = PROXY_CAPABILITIES;

    let mut any_known = false;
    for server in servers {
        let advertised = server.capabilities();
        if advertised == 0 {
            continue;
        }
        any_known = true;
        // SSL support towards the client is the listener's business, not
        // the backends'.
        caps &= advertised | CLIENT_SSL | CLIENT_LOCAL_FILES | CLIENT_IGNORE_SPACE;

        if let Some(version) = server.version() {
            caps &= !version_suppressions(&version);
        }
    }

    if !any_known {
        // Nothing reachable yet; offer the full set and let backend
        // connects refine the picture for later sessions.
        caps = PROXY_CAPABILITIES;
    }

    if router.old_protocol_only {
        caps &= !(CLIENT_DEPRECATE_EOF
            | MARIADB_CLIENT_EXTENDED_METADATA
            | MARIADB_CLIENT_CACHE_METADATA);
    }

    // The proxy never relays LOCAL INFILE or compression.
    caps &= !(CLIENT_LOCAL_FILES | CLIENT_COMPRESS);

    caps
}

/// Capability bits a backend of this version cannot be trusted with.
fn version_suppressions(version: &ServerVersion) -> u64 {
    use capabilities::*;
    let mut suppress = 0u64;

    let pre_57_mysql = !version.is_mariadb && !version.is_xpand && version.total() < 50_700;
    if version.is_xpand || pre_57_mysql {
        suppress |= CLIENT_SESSION_TRACK | CLIENT_DEPRECATE_EOF;
    }
    if version.is_mariadb {
        if version.total() < 100_200 {
            suppress |= MARIADB_CLIENT_PROGRESS
                | MARIADB_CLIENT_STMT_BULK_OPERATIONS
                | MARIADB_CLIENT_EXTENDED_METADATA
                | MARIADB_CLIENT_CACHE_METADATA;
        }
        if version.total() < 100_500 {
            suppress |= MARIADB_CLIENT_EXTENDED_METADATA;
        }
        if version.total() < 100_600 {
            suppress |= MARIADB_CLIENT_CACHE_METADATA;
        }
    } else {
        suppress |= MARIADB_CLIENT_PROGRESS
            | MARIADB_CLIENT_STMT_BULK_OPERATIONS
            | MARIADB_CLIENT_EXTENDED_METADATA
            | MARIADB_CLIENT_CACHE_METADATA;
    }

    suppress
}

/// Handle a single client session.
pub struct Session {
    pub id: u64,
    ctx: Arc<SessionContext>,
    worker: Arc<Worker>,
    handle: Arc<SessionHandle>,
    pub state: SessionState,
    history: SessionHistory,
    router: RwSplitSession,
    filters: Vec<Box<dyn FilterSession>>,
    classifier: Classifier,
    /// Scramble of the initial handshake; CHANGE_USER tokens verify
    /// against it.
    scramble: [u8; SCRAMBLE_LEN],
    /// Sequence number for the next client-bound packet in the current
    /// exchange.
    out_seq: u8,
    /// Replies routed but not yet forwarded to the client.
    expected_responses: usize,
    /// Endpoint the previous single-target command ran on.
    last_routed_endpoint: Option<usize>,
}

/// Backend connection prepared before authentication (passthrough mode).
struct PassthroughPending {
    server: Arc<Server>,
    framed: Framed<TcpStream, PacketCodec>,
    handshake: InitialHandshake,
}

impl Session {
    pub fn new(id: u64, ctx: Arc<SessionContext>, worker: Arc<Worker>) -> Self {
        let servers = ctx.graph.resolve_servers(ctx.service_id);
        let router = RwSplitSession::new(servers, ctx.router_config.clone());
        let filters = build_chain(&ctx.service.filters, id);
        let handle = ctx.registry.register(id, "");

        Self {
            id,
            ctx,
            worker,
            handle,
            state: SessionState::new(),
            history: SessionHistory::new(),
            router,
            filters,
            classifier: Classifier::new(),
            scramble: [0u8; SCRAMBLE_LEN],
            out_seq: 0,
            expected_responses: 0,
            last_routed_endpoint: None,
        }
    }

    /// Run the session to completion.
    pub async fn run(mut self, stream: TcpStream, peer: SocketAddr) -> Result<(), SessionError> {
        let result = self.run_inner(stream, peer).await;
        self.cleanup().await;
        result
    }

    async fn run_inner(
        &mut self,
        mut stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<(), SessionError> {
        self.state.client_addr = peer.ip().to_string();

        // PROXY header, if this network is allowed to send one.
        if !self.ctx.listener.proxy_protocol_networks.is_empty() {
            self.consume_proxy_header(&mut stream, peer).await?;
        }

        let auth_timeout = Duration::from_secs(self.ctx.listener.auth_timeout_secs);
        let mut framed = match tokio::time::timeout(
            auth_timeout,
            self.handshake_and_authenticate(stream),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                info!(session_id = self.id, "authentication timed out");
                return Err(SessionError::Protocol("authentication timeout".into()));
            }
        };

        info!(
            session_id = self.id,
            user = %self.state.username,
            db = self.state.current_db.as_deref().unwrap_or(""),
            "client authenticated"
        );

        self.command_loop(&mut framed).await
    }

    /// Peek for a PROXY signature; consume and apply the header when the
    /// peer is allowed, reject when it is not.
    async fn consume_proxy_header(
        &mut self,
        stream: &mut TcpStream,
        peer: SocketAddr,
    ) -> Result<(), SessionError> {
        let mut peek_buf = [0u8; 4];
        let n = stream.peek(&mut peek_buf).await?;

        match proxy::sniff(&peek_buf[..n]) {
            proxy::Sniff::NotProxy => return Ok(()),
            proxy::Sniff::NeedMore => {
                // A protocol packet always has 4 header bytes; fewer
                // peeked bytes means the client is still writing. Peek
                // again with the full window.
                let n = stream.peek(&mut peek_buf).await?;
                if proxy::sniff(&peek_buf[..n]) == proxy::Sniff::NotProxy {
                    return Ok(());
                }
            }
            _ => {}
        }

        if !proxy::peer_allowed(&self.ctx.listener.proxy_protocol_networks, peer.ip()) {
            warn!(
                session_id = self.id,
                peer = %peer,
                "PROXY header from disallowed network"
            );
            return Err(AuthError::host_blocked(&peer.ip().to_string()).into());
        }

        // Accumulate until a full header parses.
        let mut buf = BytesMut::with_capacity(256);
        loop {
            let mut window = vec![0u8; buf.len() + 256];
            let n = stream.peek(&mut window).await?;
            if n == 0 {
                return Err(SessionError::ClientDisconnected);
            }
            buf.clear();
            buf.extend_from_slice(&window[..n]);

            let parsed = match proxy::sniff(&buf[..4.min(buf.len())]) {
                proxy::Sniff::V1 => proxy::parse_v1(&buf),
                proxy::Sniff::V2 => proxy::parse_v2(&buf),
                _ => return Err(SessionError::Protocol("lost PROXY signature".into())),
            };

            match parsed {
                Ok(Some((header, consumed))) => {
                    // Actually consume the header bytes.
                    let mut discard = vec![0u8; consumed];
                    use tokio::io::AsyncReadExt;
                    stream.read_exact(&mut discard).await?;

                    if let Some(source) = header.source {
                        debug!(
                            session_id = self.id,
                            real_peer = %peer,
                            forwarded = %source,
                            "applied PROXY header"
                        );
                        self.state.client_addr = source.ip().to_string();
                    }
                    return Ok(());
                }
                Ok(None) => continue,
                Err(e) => {
                    return Err(SessionError::Protocol(format!("bad PROXY header: {e}")))
                }
            }
        }
    }

    /// Emit the handshake, run TLS if negotiated, parse the response and
    /// drive authentication to completion. Returns the framed transport
    /// in whatever TLS state was agreed.
    async fn handshake_and_authenticate(
        &mut self,
        stream: TcpStream,
    ) -> Result<ClientFramed, SessionError> {
        // Host-level blocking from repeated failures.
        let client_host = self.state.client_addr.clone();
        if self.ctx.host_blocked(&client_host) {
            metrics().record_auth("blocked");
            let mut framed = Framed::new(ClientStream::Plain(stream), PacketCodec);
            let err = AuthError::host_blocked(&client_host);
            // Sent in place of the handshake, so it opens the exchange.
            self.send_auth_error(&mut framed, &err, 0).await?;
            return Err(err.into());
        }

        let servers = self.ctx.graph.resolve_servers(self.ctx.service_id);
        let mut caps = negotiate_capabilities(&servers, &self.ctx.router_config);
        let tls_offered = self.ctx.tls.is_some();
        if !tls_offered {
            caps &= !capabilities::CLIENT_SSL;
        }

        // Passthrough mode takes the scramble from a live backend so the
        // client token can be relayed as-is.
        let mut passthrough = None;
        let handshake = if self.ctx.service.passthrough_auth {
            let pending = self.open_passthrough_backend(&servers).await?;
            let hs = InitialHandshake::with_scramble(
                &self.ctx.service.version_string,
                self.id as u32,
                caps & pending.handshake.capabilities
                    | (caps & capabilities::CLIENT_SSL),
                pending.handshake.scramble,
                &pending.handshake.auth_plugin_name,
            );
            passthrough = Some(pending);
            hs
        } else {
            InitialHandshake::new(&self.ctx.service.version_string, self.id as u32, caps)
        };
        self.scramble = handshake.scramble;
        let offered_caps = handshake.capabilities;

        let mut framed = Framed::new(ClientStream::Plain(stream), PacketCodec);
        framed.send(handshake.encode()).await?;
        self.out_seq = 1;

        // First client packet: SSLRequest or HandshakeResponse.
        let first = self.next_frame(&mut framed).await?;
        self.check_sequence(&mut framed, first.sequence_id, 1).await?;

        let response_packet = if SslRequest::looks_like(&first.payload) {
            let Some(request) = SslRequest::parse(&first.payload) else {
                return self.bad_handshake(&mut framed).await;
            };
            if request.capabilities & capabilities::CLIENT_SSL == 0 || !tls_offered {
                return self.bad_handshake(&mut framed).await;
            }

            // Run the TLS handshake and continue framing on top of it.
            // Bytes the codec already buffered belong to the TLS engine.
            let acceptor = self.ctx.tls.clone().expect("tls offered");
            let parts = framed.into_parts();
            let ClientStream::Plain(tcp) = parts.io else {
                return Err(SessionError::Protocol("double TLS negotiation".into()));
            };
            let tls_stream = acceptor
                .accept(PrefixedIo::new(parts.read_buf, tcp))
                .await
                .map_err(|e| SessionError::Protocol(format!("TLS accept failed: {e}")))?;
            framed = Framed::new(ClientStream::Tls(Box::new(tls_stream)), PacketCodec);

            let second = self.next_frame(&mut framed).await?;
            self.check_sequence(&mut framed, second.sequence_id, 2).await?;
            self.out_seq = 3;
            second
        } else {
            if self.ctx.listener.require_ssl {
                // A full HandshakeResponse where the SSLRequest belongs.
                metrics().record_auth("no_ssl");
                self.ctx.record_auth_failure(&client_host);
                let user = HandshakeResponse::parse(&first.payload)
                    .map(|r| r.username)
                    .unwrap_or_default();
                let err = AuthError::ssl_required(&user, &client_host);
                self.send_auth_error(&mut framed, &err, 2).await?;
                return Err(err.into());
            }
            self.out_seq = 2;
            first
        };

        let Some(response) = HandshakeResponse::parse(&response_packet.payload) else {
            return self.bad_handshake(&mut framed).await;
        };

        // Freeze the session's capabilities: offered ∩ client.
        self.state.capabilities = offered_caps & response.capabilities
            | (response.capabilities & capabilities::CLIENT_PROTOCOL_41);
        self.state.character_set = response.character_set;
        self.state.username = response.username.clone();
        *self.handle.username.lock() = response.username.clone();

        match passthrough {
            Some(pending) => self.authenticate_passthrough(&mut framed, response, pending).await?,
            None => self.authenticate(&mut framed, response).await?,
        }

        Ok(framed)
    }

    async fn open_passthrough_backend(
        &mut self,
        servers: &[Arc<Server>],
    ) -> Result<PassthroughPending, SessionError> {
        let master = servers
            .iter()
            .find(|s| s.is_master())
            .or_else(|| servers.first())
            .cloned()
            .ok_or_else(|| SessionError::Routing("no backend for passthrough".into()))?;
        let (framed, handshake) = BackendConnection::open(&master).await?;
        Ok(PassthroughPending {
            server: master,
            framed,
            handshake,
        })
    }

    /// The authentication sub-machine: find the entry (resolving the
    /// client hostname or refreshing the user database at most once
    /// each), drive the plugin exchange, verify the token and start the
    /// routing session.
    async fn authenticate(
        &mut self,
        framed: &mut ClientFramed,
        response: HandshakeResponse,
    ) -> Result<(), SessionError> {
        let client_host = self.state.client_addr.clone();
        let requested_db = response.database.clone().unwrap_or_default();
        let settings: UserSearchSettings = self.ctx.search_settings.clone();

        let mut hostname = ResolvedHostname::default();
        let mut refresh_tried = false;

        let result = loop {
            self.worker.user_cache.update_from_manager();
            let result = self.worker.user_cache.find_user(
                &response.username,
                &self.state.client_addr,
                &requested_db,
                &settings,
                &hostname,
            );

            match result.outcome {
                UserSearchOutcome::NeedNameinfo => {
                    // Park on the resolver, then retry with the answer.
                    let resolved = match self.state.client_addr.parse() {
                        Ok(ip) => crate::dns::reverse_lookup(ip).await,
                        Err(_) => None,
                    };
                    hostname = ResolvedHostname::resolved(resolved);
                    continue;
                }
                UserSearchOutcome::UserNotFound
                    if !refresh_tried && self.worker.user_cache.can_update_immediately() =>
                {
                    // The account may have appeared since the last load.
                    // Ask for a refresh and retry exactly once.
                    refresh_tried = true;
                    self.await_user_refresh().await;
                    continue;
                }
                _ => break result,
            }
        };

        // Run the token exchange even for failed lookups so that timing
        // does not reveal whether the account exists.
        let entry = result.entry.clone();
        let token = self
            .exchange_token(framed, &response, &entry.auth_plugin)
            .await?;

        let using_password = !token.is_empty();
        let auth_result: Result<Vec<u8>, AuthError> = (|| {
            if entry.ssl_required && !framed.get_ref().is_tls() {
                return Err(AuthError::ssl_required(&response.username, &client_host));
            }

            let check = verify_client_token(&entry, &self.scramble, &token)?;

            match result.outcome {
                UserSearchOutcome::Ok => {}
                UserSearchOutcome::BadDb => {
                    return Err(AuthError::unknown_database(&requested_db));
                }
                UserSearchOutcome::DbAccessDenied => {
                    return Err(AuthError::db_access_denied(
                        &response.username,
                        &client_host,
                        &requested_db,
                    ));
                }
                _ => {
                    return Err(AuthError::access_denied(
                        &response.username,
                        &client_host,
                        using_password,
                    ));
                }
            }

            match check {
                TokenCheck::Ok { sha1_password } => Ok(sha1_password),
                _ => Err(AuthError::access_denied(
                    &response.username,
                    &client_host,
                    using_password,
                )),
            }
        })();

        let sha1_password = match auth_result {
            Ok(sha1) => sha1,
            Err(err) => {
                // A wrong password with stale data also warrants a
                // refresh, but this attempt fails regardless: the bytes
                // already sent cannot be rewound.
                if self.worker.user_cache.can_update_immediately() {
                    self.worker.user_cache.request_refresh();
                }
                self.ctx.record_auth_failure(&client_host);
                metrics().record_auth(auth_outcome_label(&result.outcome, &err));
                self.send_auth_error(framed, &err, self.out_seq).await?;
                return Err(err.into());
            }
        };

        // START_SESSION: commit the entry and bring up routing.
        self.ctx.record_auth_success(&client_host);
        metrics().record_auth("ok");

        self.state.current_db = response.database.clone();
        self.state.role = if entry.default_role.is_empty() {
            None
        } else {
            Some(entry.default_role.clone())
        };
        let credentials = select_backend_credentials(
            &self.ctx.auth_config,
            &response.username,
            sha1_password,
        );
        self.state.backend_credentials = Some(credentials.clone());
        self.state.entry = Some(entry);

        self.router
            .start(
                &self.worker.pool,
                &credentials,
                self.state.current_db.as_deref(),
                &self.history.replay_list(),
            )
            .await?;
        self.register_backends();

        let ok = OkPacket::new();
        framed
            .send(ok.encode(self.out_seq, self.state.capabilities))
            .await?;
        Ok(())
    }

    /// Passthrough: forward the client's own response to the prepared
    /// backend and echo its verdict with the right sequence number.
    async fn authenticate_passthrough(
        &mut self,
        framed: &mut ClientFramed,
        response: HandshakeResponse,
        pending: PassthroughPending,
    ) -> Result<(), SessionError> {
        let client_host = self.state.client_addr.clone();
        let pool_key = format!("passthrough\u{1f}{}", response.username);

        let (verdict, conn) = BackendConnection::authenticate_passthrough(
            pending.server,
            pending.framed,
            pending.handshake,
            response.clone(),
            pool_key,
        )
        .await?;

        let mut echoed = verdict.clone();
        echoed.sequence_id = self.out_seq;
        framed.send(echoed).await?;

        match conn {
            Some(conn) => {
                metrics().record_auth("ok");
                self.ctx.record_auth_success(&client_host);
                self.state.current_db = response.database.clone();
                // Reads stay on the authenticated backend: other servers
                // cannot be authenticated without the client's secret.
                self.state.backend_credentials = Some(BackendCredentials::Derived {
                    username: response.username.clone(),
                    sha1_password: Vec::new(),
                });
                if let Some(master) = self.router.master_index() {
                    self.router.endpoint(master).adopt(conn);
                } else if let Some(first) = self
                    .router
                    .endpoints()
                    .iter()
                    .position(|ep| ep.server().is_running())
                {
                    self.router.endpoint(first).adopt(conn);
                }
                self.register_backends();
                Ok(())
            }
            None => {
                metrics().record_auth("access_denied");
                self.ctx.record_auth_failure(&client_host);
                Err(AuthError::access_denied(&response.username, &client_host, true).into())
            }
        }
    }

    /// START/CONTINUE_EXCHANGE: when the client answered with a different
    /// plugin than the entry requires, ask it to switch and collect the
    /// new token.
    async fn exchange_token(
        &mut self,
        framed: &mut ClientFramed,
        response: &HandshakeResponse,
        entry_plugin: &str,
    ) -> Result<Vec<u8>, SessionError> {
        if response.auth_plugin_name == entry_plugin {
            return Ok(response.auth_response.clone());
        }

        // Plugin data: the scramble plus terminator.
        let mut plugin_data = Vec::with_capacity(SCRAMBLE_LEN + 1);
        plugin_data.extend_from_slice(&self.scramble);
        plugin_data.push(0);

        let switch = crate::protocol::AuthSwitchRequest {
            plugin_name: entry_plugin.to_string(),
            plugin_data: plugin_data.into(),
        };
        framed.send(switch.encode(self.out_seq)).await?;
        let expected = self.out_seq.wrapping_add(1);
        self.out_seq = self.out_seq.wrapping_add(2);

        let token_packet = self.next_frame(framed).await?;
        self.check_sequence(framed, token_packet.sequence_id, expected)
            .await?;
        Ok(token_packet.payload.to_vec())
    }

    /// Request a user database refresh and park until a new version
    /// arrives (bounded).
    async fn await_user_refresh(&self) {
        let before = self.worker.user_cache.version();
        self.worker.user_cache.request_refresh();

        let mut rx = self.worker.user_cache.subscribe_version();
        let _ = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if *rx.borrow() > before {
                    break;
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;
        self.worker.user_cache.update_from_manager();
    }

    /// Record the session's live backend links in the registry so KILL
    /// can find them.
    fn register_backends(&self) {
        for ep in self.router.endpoints() {
            if let Some(thread_id) = ep.thread_id() {
                self.handle
                    .add_backend(ep.server().name(), &ep.server().address(), thread_id);
            }
        }
    }

    async fn next_frame(&mut self, framed: &mut ClientFramed) -> Result<Packet, SessionError> {
        match framed.next().await {
            Some(Ok(packet)) => Ok(packet),
            Some(Err(e)) => Err(e.into()),
            None => Err(SessionError::ClientDisconnected),
        }
    }

    /// Validate a sequence number, answering 1156 and failing the
    /// session on violation.
    async fn check_sequence(
        &mut self,
        framed: &mut ClientFramed,
        got: u8,
        expected: u8,
    ) -> Result<(), SessionError> {
        if got == expected {
            return Ok(());
        }
        metrics().protocol_errors_total.inc();
        let err = ErrPacket::packets_out_of_order(expected, got);
        let _ = framed
            .send(err.encode(expected, self.state.capabilities))
            .await;
        Err(SessionError::Sequence(SequenceError { expected, got }))
    }

    async fn bad_handshake(&mut self, framed: &mut ClientFramed) -> Result<ClientFramed, SessionError> {
        metrics().record_auth("bad_handshake");
        let err = ErrPacket::new(error_codes::ER_BAD_HANDSHAKE, "08S01", "Bad handshake");
        let _ = framed.send(err.encode(2, self.state.capabilities)).await;
        Err(SessionError::Protocol("malformed handshake response".into()))
    }

    async fn send_auth_error(
        &mut self,
        framed: &mut ClientFramed,
        err: &AuthError,
        seq: u8,
    ) -> Result<(), SessionError> {
        let packet = ErrPacket::new(err.code, err.sql_state, err.message.clone());
        framed
            .send(packet.encode(seq, self.state.capabilities))
            .await?;
        Ok(())
    }

    /// Read one complete logical command from the client, streaming
    /// continuation frames. Commands start at sequence zero.
    async fn read_command(
        &mut self,
        framed: &mut ClientFramed,
    ) -> Result<Option<LogicalPacket>, SessionError> {
        let mut assembler = PacketAssembler::new();
        let mut expected = 0u8;

        loop {
            let frame = tokio::select! {
                _ = self.handle.killed_signal() => return Err(SessionError::Killed),
                frame = framed.next() => match frame {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => return Err(e.into()),
                    None => {
                        return if assembler.in_progress() {
                            Err(SessionError::ClientDisconnected)
                        } else {
                            Ok(None)
                        }
                    }
                },
            };

            if frame.sequence_id != expected {
                metrics().protocol_errors_total.inc();
                let err = ErrPacket::packets_out_of_order(expected, frame.sequence_id);
                let _ = framed
                    .send(err.encode(expected, self.state.capabilities))
                    .await;
                return Err(SessionError::Sequence(SequenceError {
                    expected,
                    got: frame.sequence_id,
                }));
            }

            match assembler.push(frame, expected) {
                Ok(AssembleResult::Complete(packet)) => {
                    self.out_seq = packet.last_seq.wrapping_add(1);
                    return Ok(Some(packet));
                }
                Ok(AssembleResult::NeedMore) => {
                    expected = expected.wrapping_add(1);
                }
                Err(e) => return Err(SessionError::Sequence(e)),
            }
        }
    }

    /// Release resources: pool idle backends, close the rest, leave the
    /// registry.
    async fn cleanup(&mut self) {
        self.router.close(&self.worker.pool).await;
        self.ctx.registry.deregister(self.id);
    }
}

fn auth_outcome_label(outcome: &UserSearchOutcome, err: &AuthError) -> &'static str {
    match outcome {
        UserSearchOutcome::BadDb => "bad_db",
        UserSearchOutcome::DbAccessDenied => "db_access_denied",
        UserSearchOutcome::RootAccessDenied => "root_denied",
        UserSearchOutcome::AnonProxyAccessDenied => "anon_denied",
        _ => {
            if err.code == error_codes::ER_PLUGIN_IS_NOT_LOADED {
                "plugin_not_loaded"
            } else {
                "access_denied"
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ServerConfig, ServerRole};

    fn server_with_version(version: &str, caps: u64) -> Arc<Server> {
        let server = Server::from_config(&ServerConfig {
            name: "db".into(),
            host: "h".into(),
            port: 3306,
            rank: 1,
            max_connections: 0,
            role: ServerRole::Master,
        });
        server.update_handshake_info(version, caps);
        server
    }

    #[test]
    fn negotiation_intersects_backend_caps() {
        use capabilities::*;
        let caps = CLIENT_PROTOCOL_41 | CLIENT_SECURE_CONNECTION | CLIENT_PLUGIN_AUTH;
        let servers = vec![server_with_version("5.5.5-10.6.14-MariaDB", caps)];
        let negotiated = negotiate_capabilities(&servers, &RouterConfig::default());
        assert_eq!(negotiated & CLIENT_DEPRECATE_EOF, 0);
        assert!(negotiated & CLIENT_PROTOCOL_41 != 0);
    }

    #[test]
    fn pre_57_suppresses_session_track() {
        use capabilities::*;
        let caps = PROXY_CAPABILITIES;
        let servers = vec![server_with_version("5.6.40", caps)];
        let negotiated = negotiate_capabilities(&servers, &RouterConfig::default());
        assert_eq!(negotiated & CLIENT_SESSION_TRACK, 0);
        assert_eq!(negotiated & CLIENT_DEPRECATE_EOF, 0);
    }

    #[test]
    fn old_mariadb_loses_extended_bits() {
        use capabilities::*;
        let servers = vec![server_with_version("5.5.5-10.1.48-MariaDB", PROXY_CAPABILITIES)];
        let negotiated = negotiate_capabilities(&servers, &RouterConfig::default());
        assert_eq!(negotiated & MARIADB_CLIENT_EXTENDED_METADATA, 0);
        assert_eq!(negotiated & MARIADB_CLIENT_CACHE_METADATA, 0);
    }

    #[test]
    fn mariadb_105_keeps_extended_but_not_cache() {
        use capabilities::*;
        let servers = vec![server_with_version("5.5.5-10.5.20-MariaDB", PROXY_CAPABILITIES)];
        let negotiated = negotiate_capabilities(&servers, &RouterConfig::default());
        assert!(negotiated & MARIADB_CLIENT_EXTENDED_METADATA != 0);
        assert_eq!(negotiated & MARIADB_CLIENT_CACHE_METADATA, 0);
    }

    #[test]
    fn old_protocol_only_masks_modern_bits() {
        use capabilities::*;
        let servers = vec![server_with_version("5.5.5-10.6.14-MariaDB", PROXY_CAPABILITIES)];
        let router = RouterConfig {
            old_protocol_only: true,
            ..RouterConfig::default()
        };
        let negotiated = negotiate_capabilities(&servers, &router);
        assert_eq!(negotiated & CLIENT_DEPRECATE_EOF, 0);
        assert_eq!(negotiated & MARIADB_CLIENT_CACHE_METADATA, 0);
        assert_eq!(negotiated & MARIADB_CLIENT_EXTENDED_METADATA, 0);
    }

    #[test]
    fn unknown_backends_offer_full_set() {
        use capabilities::*;
        let server = Server::from_config(&ServerConfig {
            name: "db".into(),
            host: "h".into(),
            port: 3306,
            rank: 1,
            max_connections: 0,
            role: ServerRole::Master,
        });
        let negotiated = negotiate_capabilities(&[server], &RouterConfig::default());
        assert!(negotiated & CLIENT_DEPRECATE_EOF != 0);
        // LOCAL INFILE is never relayed.
        assert_eq!(negotiated & CLIENT_LOCAL_FILES, 0);
    }

    #[test]
    fn xpand_suppressions() {
        use capabilities::*;
        let servers = vec![server_with_version("5.0.45-Xpand-6.1.1", PROXY_CAPABILITIES)];
        let negotiated = negotiate_capabilities(&servers, &RouterConfig::default());
        assert_eq!(negotiated & CLIENT_SESSION_TRACK, 0);
        assert_eq!(negotiated & CLIENT_DEPRECATE_EOF, 0);
    }
}
