//! KCP and KWS00 server/client straps.
//!
//! KWS00 straps are KCP straps whose channels carry a frame codec:
//! every segment is decoded into a typed frame before dispatch.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_kcp::{KcpConfig, KcpListener, KcpStream};
use tracing::{debug, error, warn};

use crate::channel::kcp::{kcp_channel_id, next_session_id};
use crate::channel::{Channel, KcpTransport};
use crate::config::{ClientConf, ServerConf};
use crate::error::ChannelError;
use crate::frame::FrameCodec;
use crate::handle::ChannelHandle;
use crate::runtime::Runtime;

use super::{
    log_strap_started, log_strap_stopped, removal_hook, with_stop_hook, ChannelSet, Strap,
    StrapCore, MAX_ACCEPT_FAILURES,
};

/// Accepts KCP conversations and owns one channel per conversation.
pub struct KcpServerStrap {
    core: StrapCore,
    conf: ServerConf,
    handle: Arc<ChannelHandle>,
    channels: Arc<ChannelSet>,
    codec: Option<Arc<dyn FrameCodec>>,
}

impl KcpServerStrap {
    pub fn new(conf: ServerConf, handle: ChannelHandle) -> Result<Arc<Self>, ChannelError> {
        Self::with_runtime(conf, handle, Runtime::global())
    }

    pub fn with_runtime(
        conf: ServerConf,
        handle: ChannelHandle,
        runtime: Arc<Runtime>,
    ) -> Result<Arc<Self>, ChannelError> {
        Self::build(conf, handle, runtime, None)
    }

    fn build(
        conf: ServerConf,
        handle: ChannelHandle,
        runtime: Arc<Runtime>,
        codec: Option<Arc<dyn FrameCodec>>,
    ) -> Result<Arc<Self>, ChannelError> {
        conf.validate()?;
        let channel_conf = conf
            .channel
            .clone()
            .unwrap_or_else(|| runtime.channel_conf().clone());
        let channels = ChannelSet::new();
        let handle = with_stop_hook(&handle, removal_hook(&channels));
        Ok(Arc::new(KcpServerStrap {
            core: StrapCore::new(conf.addr.clone(), runtime, channel_conf),
            conf,
            handle,
            channels,
            codec,
        }))
    }

    /// Bind the KCP listener and spawn the accept task.
    pub async fn start(self: &Arc<Self>) -> Result<(), ChannelError> {
        self.core.begin_start()?;
        let local: SocketAddr = self.conf.addr.parse()?;
        let listener = KcpListener::bind(KcpConfig::default(), local)
            .await
            .map_err(|err| ChannelError::Kcp(err.to_string()))?;
        self.core.mark_open();
        log_strap_started("kcp-server", self.core.id());

        let strap = Arc::clone(self);
        tokio::spawn(async move { strap.accept_loop(listener, local).await });
        Ok(())
    }

    pub async fn channels(&self) -> Vec<Arc<Channel>> {
        self.channels.snapshot().await
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.len().await
    }

    async fn accept_loop(self: Arc<Self>, mut listener: KcpListener, local: SocketAddr) {
        let mut failures: u32 = 0;
        loop {
            tokio::select! {
                biased;
                _ = self.core.exit().cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        failures = 0;
                        if let Err(err) = self.adopt(stream, local, peer).await {
                            warn!(strap = %self.core.id(), peer = %peer, error = %err, "rejected kcp conversation");
                        }
                    }
                    Err(err) => {
                        failures += 1;
                        warn!(strap = %self.core.id(), error = %err, failures, "kcp accept failed");
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

    async fn adopt(
        self: &Arc<Self>,
        stream: KcpStream,
        local: SocketAddr,
        peer: SocketAddr,
    ) -> Result<(), ChannelError> {
        if self.core.is_closed() {
            return Err(ChannelError::ChannelClosed(self.core.id().to_string()));
        }
        let current = self.channels.len().await;
        if current >= self.conf.max_channels {
            return Err(ChannelError::AtCapacity {
                id: self.core.id().to_string(),
                current,
                limit: self.conf.max_channels,
            });
        }

        let session = next_session_id();
        let transport = match &self.codec {
            Some(codec) => {
                KcpTransport::kws00(stream, Some(local), peer, session, Arc::clone(codec))
            }
            None => KcpTransport::new(stream, Some(local), peer, session),
        };
        let id = kcp_channel_id(Some(local), peer, session);
        let parent: Arc<dyn Strap> = Arc::clone(self) as Arc<dyn Strap>;
        let channel = Channel::new(
            id,
            self.core.channel_conf().clone(),
            Some(Arc::clone(self.core.runtime().read_pool())),
            Arc::clone(&self.handle),
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
        debug!(strap = %self.core.id(), channel_id = %channel.id(), "kcp channel accepted");
        Ok(())
    }
}

#[async_trait]
impl Strap for KcpServerStrap {
    fn id(&self) -> &str {
        self.core.id()
    }

    fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    async fn stop(&self) {
        if self.core.begin_close() {
            self.channels.stop_all().await;
            log_strap_stopped("kcp-server", self.core.id());
        }
    }
}

/// KWS00 acceptor: KCP with a frame codec on every channel.
pub struct Kws00ServerStrap {
    inner: Arc<KcpServerStrap>,
}

impl Kws00ServerStrap {
    pub fn new(
        conf: ServerConf,
        handle: ChannelHandle,
        codec: Arc<dyn FrameCodec>,
    ) -> Result<Arc<Self>, ChannelError> {
        Self::with_runtime(conf, handle, codec, Runtime::global())
    }

    pub fn with_runtime(
        conf: ServerConf,
        handle: ChannelHandle,
        codec: Arc<dyn FrameCodec>,
        runtime: Arc<Runtime>,
    ) -> Result<Arc<Self>, ChannelError> {
        let inner = KcpServerStrap::build(conf, handle, runtime, Some(codec))?;
        Ok(Arc::new(Kws00ServerStrap { inner }))
    }

    pub async fn start(self: &Arc<Self>) -> Result<(), ChannelError> {
        self.inner.start().await
    }

    pub async fn channels(&self) -> Vec<Arc<Channel>> {
        self.inner.channels().await
    }

    pub async fn channel_count(&self) -> usize {
        self.inner.channel_count().await
    }
}

#[async_trait]
impl Strap for Kws00ServerStrap {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    async fn stop(&self) {
        self.inner.stop().await;
    }
}

/// Dials one KCP conversation and owns its channel.
pub struct KcpClientStrap {
    core: StrapCore,
    conf: ClientConf,
    handle: Arc<ChannelHandle>,
    codec: Option<Arc<dyn FrameCodec>>,
    channel: tokio::sync::Mutex<Option<Arc<Channel>>>,
}

impl KcpClientStrap {
    pub fn new(conf: ClientConf, handle: ChannelHandle) -> Result<Arc<Self>, ChannelError> {
        Self::with_runtime(conf, handle, Runtime::global())
    }

    pub fn with_runtime(
        conf: ClientConf,
        handle: ChannelHandle,
        runtime: Arc<Runtime>,
    ) -> Result<Arc<Self>, ChannelError> {
        Self::build(conf, handle, runtime, None)
    }

    fn build(
        conf: ClientConf,
        handle: ChannelHandle,
        runtime: Arc<Runtime>,
        codec: Option<Arc<dyn FrameCodec>>,
    ) -> Result<Arc<Self>, ChannelError> {
        conf.validate()?;
        let channel_conf = conf
            .channel
            .clone()
            .unwrap_or_else(|| runtime.channel_conf().clone());
        Ok(Arc::new(KcpClientStrap {
            core: StrapCore::new(conf.addr.clone(), runtime, channel_conf),
            conf,
            handle: Arc::new(handle),
            codec,
            channel: tokio::sync::Mutex::new(None),
        }))
    }

    pub async fn start(self: &Arc<Self>) -> Result<(), ChannelError> {
        self.core.begin_start()?;
        let remote: SocketAddr = self.conf.addr.parse()?;
        let stream = KcpStream::connect(&KcpConfig::default(), remote)
            .await
            .map_err(|err| ChannelError::Kcp(err.to_string()))?;

        let session = next_session_id();
        let transport = match &self.codec {
            Some(codec) => KcpTransport::kws00(stream, None, remote, session, Arc::clone(codec)),
            None => KcpTransport::new(stream, None, remote, session),
        };
        let id = kcp_channel_id(None, remote, session);
        let parent: Arc<dyn Strap> = Arc::clone(self) as Arc<dyn Strap>;
        let channel = Channel::new(
            id,
            self.core.channel_conf().clone(),
            Some(Arc::clone(self.core.runtime().read_pool())),
            Arc::clone(&self.handle),
            Box::new(transport),
            Some(Arc::downgrade(&parent)),
        );
        channel.start().await?;
        *self.channel.lock().await = Some(channel);
        self.core.mark_open();
        log_strap_started("kcp-client", self.core.id());
        Ok(())
    }

    pub async fn channel(&self) -> Option<Arc<Channel>> {
        self.channel.lock().await.clone()
    }
}

#[async_trait]
impl Strap for KcpClientStrap {
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
            log_strap_stopped("kcp-client", self.core.id());
        }
    }
}

/// Dials a KWS00 session: KCP client with a frame codec.
pub struct Kws00ClientStrap {
    inner: Arc<KcpClientStrap>,
}

impl Kws00ClientStrap {
    pub fn new(
        conf: ClientConf,
        handle: ChannelHandle,
        codec: Arc<dyn FrameCodec>,
    ) -> Result<Arc<Self>, ChannelError> {
        Self::with_runtime(conf, handle, codec, Runtime::global())
    }

    pub fn with_runtime(
        conf: ClientConf,
        handle: ChannelHandle,
        codec: Arc<dyn FrameCodec>,
        runtime: Arc<Runtime>,
    ) -> Result<Arc<Self>, ChannelError> {
        let inner = KcpClientStrap::build(conf, handle, runtime, Some(codec))?;
        Ok(Arc::new(Kws00ClientStrap { inner }))
    }

    pub async fn start(self: &Arc<Self>) -> Result<(), ChannelError> {
        self.inner.start().await
    }

    pub async fn channel(&self) -> Option<Arc<Channel>> {
        self.inner.channel().await
    }
}

#[async_trait]
impl Strap for Kws00ClientStrap {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    async fn stop(&self) {
        self.inner.stop().await;
    }
}
