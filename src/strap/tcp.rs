//! TCP server and client straps.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, warn};

use crate::channel::{addr_pair_id, Channel, TcpTransport, Transport};
use crate::config::{ClientConf, ServerConf};
use crate::error::ChannelError;
use crate::handle::ChannelHandle;
use crate::runtime::Runtime;

use super::{
    log_strap_started, log_strap_stopped, removal_hook, with_stop_hook, ChannelSet, Strap,
    StrapCore, MAX_ACCEPT_FAILURES,
};

/// Accepts TCP connections and owns one channel per connection.
pub struct TcpServerStrap {
    core: StrapCore,
    conf: ServerConf,
    handle: Arc<ChannelHandle>,
    channels: Arc<ChannelSet>,
    local: OnceLock<SocketAddr>,
}

impl TcpServerStrap {
    pub fn new(conf: ServerConf, handle: ChannelHandle) -> Result<Arc<Self>, ChannelError> {
        Self::with_runtime(conf, handle, Runtime::global())
    }

    pub fn with_runtime(
        conf: ServerConf,
        handle: ChannelHandle,
        runtime: Arc<Runtime>,
    ) -> Result<Arc<Self>, ChannelError> {
        conf.validate()?;
        let channel_conf = conf
            .channel
            .clone()
            .unwrap_or_else(|| runtime.channel_conf().clone());
        let channels = ChannelSet::new();
        let handle = with_stop_hook(&handle, removal_hook(&channels));
        Ok(Arc::new(TcpServerStrap {
            core: StrapCore::new(conf.addr.clone(), runtime, channel_conf),
            conf,
            handle,
            channels,
            local: OnceLock::new(),
        }))
    }

    /// Bind the listen endpoint and spawn the accept task.
    pub async fn start(self: &Arc<Self>) -> Result<(), ChannelError> {
        self.core.begin_start()?;
        let listener = TcpListener::bind(&self.conf.addr).await?;
        let _ = self.local.set(listener.local_addr()?);
        self.core.mark_open();
        log_strap_started("tcp-server", self.core.id());

        let strap = Arc::clone(self);
        tokio::spawn(async move { strap.accept_loop(listener).await });
        Ok(())
    }

    /// The actually-bound address, available after `start`.
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
                        if let Err(err) = self.adopt(stream, peer).await {
                            warn!(strap = %self.core.id(), peer = %peer, error = %err, "rejected tcp connection");
                        }
                    }
                    Err(err) => {
                        failures += 1;
                        warn!(strap = %self.core.id(), error = %err, failures, "tcp accept failed");
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

    async fn adopt(self: &Arc<Self>, stream: TcpStream, _peer: SocketAddr) -> Result<(), ChannelError> {
        if self.core.is_closed() {
            return Err(ChannelError::ChannelClosed(self.core.id().to_string()));
        }
        let current = self.channels.len().await;
        if current >= self.conf.max_channels {
            drop(stream);
            return Err(ChannelError::AtCapacity {
                id: self.core.id().to_string(),
                current,
                limit: self.conf.max_channels,
            });
        }

        let transport = TcpTransport::new(stream)?;
        let id = addr_pair_id(transport.local_addr(), transport.remote_addr());
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
        debug!(strap = %self.core.id(), channel_id = %channel.id(), "tcp channel accepted");
        Ok(())
    }
}

#[async_trait]
impl Strap for TcpServerStrap {
    fn id(&self) -> &str {
        self.core.id()
    }

    fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    async fn stop(&self) {
        if self.core.begin_close() {
            self.channels.stop_all().await;
            log_strap_stopped("tcp-server", self.core.id());
        }
    }
}

/// Dials one TCP connection and owns its channel.
pub struct TcpClientStrap {
    core: StrapCore,
    conf: ClientConf,
    handle: Arc<ChannelHandle>,
    channel: tokio::sync::Mutex<Option<Arc<Channel>>>,
}

impl TcpClientStrap {
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
        Ok(Arc::new(TcpClientStrap {
            core: StrapCore::new(conf.addr.clone(), runtime, channel_conf),
            conf,
            handle: Arc::new(handle),
            channel: tokio::sync::Mutex::new(None),
        }))
    }

    /// Dial the endpoint and start the single channel.
    pub async fn start(self: &Arc<Self>) -> Result<(), ChannelError> {
        self.core.begin_start()?;
        let stream = TcpStream::connect(&self.conf.addr).await?;
        let transport = TcpTransport::new(stream)?;
        let id = addr_pair_id(transport.local_addr(), transport.remote_addr());
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
        log_strap_started("tcp-client", self.core.id());
        Ok(())
    }

    pub async fn channel(&self) -> Option<Arc<Channel>> {
        self.channel.lock().await.clone()
    }
}

#[async_trait]
impl Strap for TcpClientStrap {
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
            log_strap_stopped("tcp-client", self.core.id());
        }
    }
}
