//! UDP server and client straps.
//!
//! UDP is connectionless, so the server strap demultiplexes datagrams
//! by source address into one channel per peer: a single task owns the
//! listening socket and feeds bounded per-peer queues; peer channels
//! write back through the shared socket. A peer beyond the channel cap
//! has its datagrams dropped.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, warn};

use crate::channel::{addr_pair_id, Channel, Transport, UdpPeerTransport, UdpTransport};
use crate::config::{ClientConf, ServerConf};
use crate::error::ChannelError;
use crate::handle::ChannelHandle;
use crate::runtime::Runtime;

use super::{
    log_strap_started, log_strap_stopped, removal_hook, with_stop_hook, ChannelSet, Strap,
    StrapCore, StopHook, MAX_ACCEPT_FAILURES,
};

use futures::FutureExt;

/// Datagrams buffered per peer before the demultiplexer drops.
const PEER_QUEUE_DEPTH: usize = 128;

type PeerMap = tokio::sync::Mutex<HashMap<SocketAddr, mpsc::Sender<Bytes>>>;

/// Listens on a UDP socket and owns one channel per remote peer.
pub struct UdpServerStrap {
    core: StrapCore,
    conf: ServerConf,
    handle: Arc<ChannelHandle>,
    channels: Arc<ChannelSet>,
    peers: Arc<PeerMap>,
    local: OnceLock<SocketAddr>,
}

impl UdpServerStrap {
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
        Ok(Arc::new(UdpServerStrap {
            core: StrapCore::new(conf.addr.clone(), runtime, channel_conf),
            conf,
            handle,
            channels,
            peers: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
            local: OnceLock::new(),
        }))
    }

    /// Bind the socket and spawn the demultiplexer task.
    pub async fn start(self: &Arc<Self>) -> Result<(), ChannelError> {
        self.core.begin_start()?;
        let socket = UdpSocket::bind(&self.conf.addr).await?;
        let local = socket.local_addr()?;
        let _ = self.local.set(local);
        self.core.mark_open();
        log_strap_started("udp-server", self.core.id());

        let strap = Arc::clone(self);
        let socket = Arc::new(socket);
        tokio::spawn(async move { strap.demux_loop(socket, local).await });
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

    async fn demux_loop(self: Arc<Self>, socket: Arc<UdpSocket>, local: SocketAddr) {
        let mut failures: u32 = 0;
        let mut buf = vec![0u8; self.core.channel_conf().read_buf_size];
        loop {
            tokio::select! {
                biased;
                _ = self.core.exit().cancelled() => break,
                received = socket.recv_from(&mut buf) => match received {
                    Ok((n, peer)) => {
                        failures = 0;
                        let datagram = Bytes::copy_from_slice(&buf[..n]);
                        if let Err(err) = self.route_datagram(&socket, local, peer, datagram).await {
                            warn!(strap = %self.core.id(), peer = %peer, error = %err, "dropped udp datagram");
                        }
                    }
                    Err(err) => {
                        failures += 1;
                        warn!(strap = %self.core.id(), error = %err, failures, "udp receive failed");
                        if failures >= MAX_ACCEPT_FAILURES {
                            error!(strap = %self.core.id(), "persistent receive failures, stopping strap");
                            self.stop().await;
                            break;
                        }
                    }
                }
            }
        }
        debug!(strap = %self.core.id(), "demux task exited");
    }

    async fn route_datagram(
        self: &Arc<Self>,
        socket: &Arc<UdpSocket>,
        local: SocketAddr,
        peer: SocketAddr,
        datagram: Bytes,
    ) -> Result<(), ChannelError> {
        let known = self.peers.lock().await.get(&peer).cloned();
        if let Some(sender) = known {
            match sender.try_send(datagram) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(_)) => {
                    // UDP is lossy by contract; a saturated peer loses
                    // the datagram rather than stalling every peer.
                    warn!(strap = %self.core.id(), peer = %peer, "peer queue full");
                    return Ok(());
                }
                Err(TrySendError::Closed(datagram)) => {
                    self.peers.lock().await.remove(&peer);
                    return self.adopt_peer(socket, local, peer, datagram).await;
                }
            }
        }
        self.adopt_peer(socket, local, peer, datagram).await
    }

    async fn adopt_peer(
        self: &Arc<Self>,
        socket: &Arc<UdpSocket>,
        local: SocketAddr,
        peer: SocketAddr,
        datagram: Bytes,
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

        let (sender, inbox) = mpsc::channel(PEER_QUEUE_DEPTH);
        let transport = UdpPeerTransport::new(Arc::clone(socket), inbox, local, peer);
        let handle = with_stop_hook(&self.handle, self.peer_eviction_hook(peer));
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
        self.peers.lock().await.insert(peer, sender.clone());
        debug!(strap = %self.core.id(), channel_id = %channel.id(), "udp peer channel created");

        if sender.try_send(datagram).is_err() {
            warn!(strap = %self.core.id(), peer = %peer, "peer queue rejected first datagram");
        }
        Ok(())
    }

    /// Stop hook dropping the peer's queue entry so a later datagram
    /// dials a fresh channel.
    fn peer_eviction_hook(&self, peer: SocketAddr) -> StopHook {
        let peers = Arc::downgrade(&self.peers);
        Arc::new(move |_channel| {
            let peers = peers.clone();
            async move {
                if let Some(peers) = peers.upgrade() {
                    peers.lock().await.remove(&peer);
                }
            }
            .boxed()
        })
    }
}

#[async_trait]
impl Strap for UdpServerStrap {
    fn id(&self) -> &str {
        self.core.id()
    }

    fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    async fn stop(&self) {
        if self.core.begin_close() {
            self.channels.stop_all().await;
            self.peers.lock().await.clear();
            log_strap_stopped("udp-server", self.core.id());
        }
    }
}

/// Dials (connects) a UDP socket and owns its channel.
pub struct UdpClientStrap {
    core: StrapCore,
    conf: ClientConf,
    handle: Arc<ChannelHandle>,
    channel: tokio::sync::Mutex<Option<Arc<Channel>>>,
}

impl UdpClientStrap {
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
        Ok(Arc::new(UdpClientStrap {
            core: StrapCore::new(conf.addr.clone(), runtime, channel_conf),
            conf,
            handle: Arc::new(handle),
            channel: tokio::sync::Mutex::new(None),
        }))
    }

    pub async fn start(self: &Arc<Self>) -> Result<(), ChannelError> {
        self.core.begin_start()?;
        let remote: SocketAddr = self.conf.addr.parse()?;
        let bind_addr = if remote.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(remote).await?;

        let transport = UdpTransport::new(socket, remote)?;
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
        log_strap_started("udp-client", self.core.id());
        Ok(())
    }

    pub async fn channel(&self) -> Option<Arc<Channel>> {
        self.channel.lock().await.clone()
    }
}

#[async_trait]
impl Strap for UdpClientStrap {
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
            log_strap_stopped("udp-client", self.core.id());
        }
    }
}
