//! HTTP/WebSocket server strap and the WebSocket client strap.
//!
//! One listener serves both pattern tables: plain HTTP routes answer
//! requests directly; WebSocket routes perform the upgrade and hand
//! the raw stream to a channel like any other accepted connection.
//! An upgrade arriving while the strap is at its channel cap is
//! answered with a server error.

use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{self, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, warn};

use crate::channel::{addr_pair_id, Channel, WsTransport};
use crate::config::{ClientConf, ServerConf};
use crate::error::ChannelError;
use crate::handle::ChannelHandle;
use crate::runtime::Runtime;

use super::{
    log_strap_started, log_strap_stopped, removal_hook, with_stop_hook, ChannelSet, Strap,
    StrapCore, MAX_ACCEPT_FAILURES,
};

/// Plain-HTTP route handler: consumes the request, produces the full
/// response.
pub type HttpHandler =
    Arc<dyn Fn(Request<Incoming>) -> BoxFuture<'static, Response<Full<Bytes>>> + Send + Sync>;

/// Wrap an async fn as an [`HttpHandler`].
pub fn http_handler<F, Fut>(f: F) -> HttpHandler
where
    F: Fn(Request<Incoming>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response<Full<Bytes>>> + Send + 'static,
{
    Arc::new(move |req| f(req).boxed())
}

fn simple_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
}

fn is_upgrade_request(req: &Request<Incoming>) -> bool {
    let connection_upgrade = req
        .headers()
        .get(header::CONNECTION)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);
    let upgrade_websocket = req
        .headers()
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    req.method() == Method::GET && connection_upgrade && upgrade_websocket
}

/// HTTP server with WebSocket-upgrade routes. Upgraded connections
/// become channels owned by this strap; plain routes stay plain HTTP.
pub struct HttpWsServerStrap {
    core: StrapCore,
    conf: ServerConf,
    channels: Arc<ChannelSet>,
    http_routes: parking_lot::RwLock<HashMap<String, HttpHandler>>,
    ws_routes: parking_lot::RwLock<HashMap<String, Arc<ChannelHandle>>>,
    local: OnceLock<SocketAddr>,
}

impl HttpWsServerStrap {
    pub fn new(conf: ServerConf) -> Result<Arc<Self>, ChannelError> {
        Self::with_runtime(conf, Runtime::global())
    }

    pub fn with_runtime(conf: ServerConf, runtime: Arc<Runtime>) -> Result<Arc<Self>, ChannelError> {
        conf.validate()?;
        let channel_conf = conf
            .channel
            .clone()
            .unwrap_or_else(|| runtime.channel_conf().clone());
        Ok(Arc::new(HttpWsServerStrap {
            core: StrapCore::new(conf.addr.clone(), runtime, channel_conf),
            conf,
            channels: ChannelSet::new(),
            http_routes: parking_lot::RwLock::new(HashMap::new()),
            ws_routes: parking_lot::RwLock::new(HashMap::new()),
            local: OnceLock::new(),
        }))
    }

    /// Register a plain-HTTP handler for an exact request path.
    pub fn add_http_route(&self, pattern: impl Into<String>, handler: HttpHandler) {
        self.http_routes.write().insert(pattern.into(), handler);
    }

    /// Register a WebSocket-upgrade route: requests for this path
    /// upgrade and become channels bound to the given handle.
    pub fn add_ws_route(&self, pattern: impl Into<String>, handle: ChannelHandle) {
        self.ws_routes.write().insert(pattern.into(), Arc::new(handle));
    }

    /// Bind the listener and spawn the accept task.
    pub async fn start(self: &Arc<Self>) -> Result<(), ChannelError> {
        self.core.begin_start()?;
        let listener = TcpListener::bind(&self.conf.addr).await?;
        let _ = self.local.set(listener.local_addr()?);
        self.core.mark_open();
        log_strap_started("httpws-server", self.core.id());

        let strap = Arc::clone(self);
        tokio::spawn(async move { strap.accept_loop(listener).await });
        Ok(())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local.get().copied()
    }

    pub async fn channels(&self) -> Vec<Arc<Channel>> {
        self.channels.snapshot().await
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.len().await
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut failures: u32 = 0;
        loop {
            tokio::select! {
                biased;
                _ = self.core.exit().cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        failures = 0;
                        let local = match stream.local_addr() {
                            Ok(local) => local,
                            Err(err) => {
                                warn!(strap = %self.core.id(), error = %err, "dropped connection without local address");
                                continue;
                            }
                        };
                        let strap = Arc::clone(&self);
                        tokio::spawn(async move { strap.serve_connection(stream, local, peer).await });
                    }
                    Err(err) => {
                        failures += 1;
                        warn!(strap = %self.core.id(), error = %err, failures, "accept failed");
                        if failures >= MAX_ACCEPT_FAILURES {
                            error!(strap = %self.core.id(), "persistent accept failures, stopping strap");
                            self.stop().await;
                            break;
                        }
                    }
                }
            }
        }
        debug!(strap = %self.core.id(), "accept task exited");
    }

    async fn serve_connection(self: Arc<Self>, stream: TcpStream, local: SocketAddr, peer: SocketAddr) {
        let io = TokioIo::new(stream);
        let strap = Arc::clone(&self);
        let service = service_fn(move |req| {
            let strap = Arc::clone(&strap);
            async move { Ok::<_, Infallible>(strap.route(req, local, peer).await) }
        });
        let connection = http1::Builder::new()
            .serve_connection(io, service)
            .with_upgrades();
        tokio::select! {
            biased;
            _ = self.core.exit().cancelled() => {}
            served = connection => {
                if let Err(err) = served {
                    debug!(strap = %self.core.id(), peer = %peer, error = %err, "http connection ended");
                }
            }
        }
    }

    async fn route(
        self: Arc<Self>,
        req: Request<Incoming>,
        local: SocketAddr,
        peer: SocketAddr,
    ) -> Response<Full<Bytes>> {
        let path = req.uri().path().to_string();
        debug!(strap = %self.core.id(), path = %path, peer = %peer, "request");

        let ws_handle = { self.ws_routes.read().get(&path).cloned() };
        if let Some(handle) = ws_handle {
            if is_upgrade_request(&req) {
                return self.upgrade(req, handle, local, peer).await;
            }
            return simple_response(StatusCode::BAD_REQUEST, "websocket upgrade required");
        }

        let http_handler = { self.http_routes.read().get(&path).cloned() };
        match http_handler {
            Some(handler) => handler(req).await,
            None => simple_response(StatusCode::NOT_FOUND, "no such route"),
        }
    }

    async fn upgrade(
        self: Arc<Self>,
        mut req: Request<Incoming>,
        route_handle: Arc<ChannelHandle>,
        local: SocketAddr,
        peer: SocketAddr,
    ) -> Response<Full<Bytes>> {
        let current = self.channels.len().await;
        if current >= self.conf.max_channels {
            warn!(
                strap = %self.core.id(),
                peer = %peer,
                current,
                limit = self.conf.max_channels,
                "upgrade refused at capacity"
            );
            return simple_response(StatusCode::SERVICE_UNAVAILABLE, "server at capacity");
        }

        let accept_key = match req.headers().get(header::SEC_WEBSOCKET_KEY) {
            Some(key) => derive_accept_key(key.as_bytes()),
            None => return simple_response(StatusCode::BAD_REQUEST, "missing websocket key"),
        };
        let accept_value = match HeaderValue::from_str(&accept_key) {
            Ok(value) => value,
            Err(_) => {
                return simple_response(StatusCode::INTERNAL_SERVER_ERROR, "bad websocket key")
            }
        };
        let version = req.version();

        let strap = Arc::clone(&self);
        tokio::spawn(async move {
            match hyper::upgrade::on(&mut req).await {
                Ok(upgraded) => {
                    let io = TokioIo::new(upgraded);
                    let ws_stream = WebSocketStream::from_raw_socket(io, Role::Server, None).await;
                    if let Err(err) = strap.install_channel(ws_stream, route_handle, local, peer).await
                    {
                        warn!(strap = %strap.core.id(), peer = %peer, error = %err, "ws channel rejected");
                    }
                }
                Err(err) => {
                    warn!(strap = %strap.core.id(), peer = %peer, error = %err, "upgrade failed");
                }
            }
        });

        let mut response = Response::new(Full::default());
        *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
        *response.version_mut() = version;
        response
            .headers_mut()
            .insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        response
            .headers_mut()
            .insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        response
            .headers_mut()
            .insert(header::SEC_WEBSOCKET_ACCEPT, accept_value);
        response
    }

    async fn install_channel(
        self: &Arc<Self>,
        ws_stream: WebSocketStream<TokioIo<Upgraded>>,
        route_handle: Arc<ChannelHandle>,
        local: SocketAddr,
        peer: SocketAddr,
    ) -> Result<(), ChannelError> {
        if self.core.is_closed() {
            return Err(ChannelError::ChannelClosed(self.core.id().to_string()));
        }
        let transport = WsTransport::new(ws_stream, Some(local), Some(peer));
        let handle = with_stop_hook(&route_handle, removal_hook(&self.channels));
        let parent: Arc<dyn Strap> = Arc::clone(self) as Arc<dyn Strap>;
        let channel = Channel::new(
            addr_pair_id(Some(local), Some(peer)),
            self.core.channel_conf().clone(),
            Some(Arc::clone(self.core.runtime().read_pool())),
            handle,
            Box::new(transport),
            Some(Arc::downgrade(&parent)),
        );
        channel.start().await?;
        if let Err(err) = self
            .channels
            .try_insert(Arc::clone(&channel), self.conf.max_channels, self.core.id())
            .await
        {
            channel.stop().await;
            return Err(err);
        }
        debug!(strap = %self.core.id(), channel_id = %channel.id(), "ws channel accepted");
        Ok(())
    }
}

#[async_trait]
impl Strap for HttpWsServerStrap {
    fn id(&self) -> &str {
        self.core.id()
    }

    fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    async fn stop(&self) {
        if self.core.begin_close() {
            self.channels.stop_all().await;
            log_strap_stopped("httpws-server", self.core.id());
        }
    }
}

/// Dials a WebSocket endpoint and owns its channel.
pub struct WsClientStrap {
    core: StrapCore,
    conf: ClientConf,
    handle: Arc<ChannelHandle>,
    channel: tokio::sync::Mutex<Option<Arc<Channel>>>,
}

impl WsClientStrap {
    pub fn new(conf: ClientConf, handle: ChannelHandle) -> Result<Arc<Self>, ChannelError> {
        Self::with_runtime(conf, handle, Runtime::global())
    }

    pub fn with_runtime(
        conf: ClientConf,
        handle: ChannelHandle,
        runtime: Arc<Runtime>,
    ) -> Result<Arc<Self>, ChannelError> {
        conf.validate()?;
        let channel_conf = conf
            .channel
            .clone()
            .unwrap_or_else(|| runtime.channel_conf().clone());
        Ok(Arc::new(WsClientStrap {
            core: StrapCore::new(conf.addr.clone(), runtime, channel_conf),
            conf,
            handle: Arc::new(handle),
            channel: tokio::sync::Mutex::new(None),
        }))
    }

    /// Dial the TCP endpoint, run the client handshake on the
    /// configured path, and start the channel.
    pub async fn start(self: &Arc<Self>) -> Result<(), ChannelError> {
        self.core.begin_start()?;
        let remote: SocketAddr = self.conf.addr.parse()?;
        let stream = TcpStream::connect(remote).await?;
        let local = stream.local_addr()?;
        let url = format!("ws://{}{}", self.conf.addr, self.conf.path);
        let (ws_stream, _response) = tokio_tungstenite::client_async(url, stream).await?;

        let transport = WsTransport::new(ws_stream, Some(local), Some(remote));
        let parent: Arc<dyn Strap> = Arc::clone(self) as Arc<dyn Strap>;
        let channel = Channel::new(
            addr_pair_id(Some(local), Some(remote)),
            self.core.channel_conf().clone(),
            Some(Arc::clone(self.core.runtime().read_pool())),
            Arc::clone(&self.handle),
            Box::new(transport),
            Some(Arc::downgrade(&parent)),
        );
        channel.start().await?;
        *self.channel.lock().await = Some(channel);
        self.core.mark_open();
        log_strap_started("ws-client", self.core.id());
        Ok(())
    }

    pub async fn channel(&self) -> Option<Arc<Channel>> {
        self.channel.lock().await.clone()
    }
}

#[async_trait]
impl Strap for WsClientStrap {
    fn id(&self) -> &str {
        self.core.id()
    }

    fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    async fn stop(&self) {
        if self.core.begin_close() {
            if let Some(channel) = self.channel.lock().await.take() {
                channel.stop().await;
            }
            log_strap_stopped("ws-client", self.core.id());
        }
    }
}
