//! Straps: acceptors and dialers that own channels.
//!
//! A server strap binds a listen endpoint, accepts transport
//! connections, and owns the resulting channels in an id-keyed map; a
//! client strap dials one connection and owns its single channel.
//! Strap identity is the bind/connect address string.

pub mod httpws;
pub mod kcp;
pub mod tcp;
pub mod udp;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::channel::Channel;
use crate::config::ChannelConfig;
use crate::error::ChannelError;
use crate::handle::ChannelHandle;
use crate::runtime::Runtime;

pub use httpws::{http_handler, HttpHandler, HttpWsServerStrap, WsClientStrap};
pub use kcp::{KcpClientStrap, KcpServerStrap, Kws00ClientStrap, Kws00ServerStrap};
pub use tcp::{TcpClientStrap, TcpServerStrap};
pub use udp::{UdpClientStrap, UdpServerStrap};

/// Consecutive accept failures tolerated before a server strap stops
/// itself.
pub(crate) const MAX_ACCEPT_FAILURES: u32 = 8;

/// Common face of every acceptor/dialer. Channels hold a weak
/// reference back to their strap through this trait.
#[async_trait]
pub trait Strap: Send + Sync {
    /// The bind/connect address string.
    fn id(&self) -> &str;

    fn is_closed(&self) -> bool;

    /// Stop the strap and every channel it owns. Safe to call
    /// concurrently with the accept task and more than once.
    async fn stop(&self);
}

/// State shared by every strap implementation.
pub(crate) struct StrapCore {
    id: String,
    closed: AtomicBool,
    started: AtomicBool,
    exit: CancellationToken,
    runtime: Arc<Runtime>,
    channel_conf: ChannelConfig,
}

impl StrapCore {
    pub(crate) fn new(id: String, runtime: Arc<Runtime>, channel_conf: ChannelConfig) -> Self {
        StrapCore {
            id,
            closed: AtomicBool::new(true),
            started: AtomicBool::new(false),
            exit: CancellationToken::new(),
            runtime,
            channel_conf,
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn exit(&self) -> &CancellationToken {
        &self.exit
    }

    pub(crate) fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    pub(crate) fn channel_conf(&self) -> &ChannelConfig {
        &self.channel_conf
    }

    /// Claim the one-shot start. Straps, like channels, are not
    /// restartable.
    pub(crate) fn begin_start(&self) -> Result<(), ChannelError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ChannelError::AlreadyStarted(self.id.clone()));
        }
        Ok(())
    }

    pub(crate) fn mark_open(&self) {
        self.closed.store(false, Ordering::Release);
    }

    /// First close wins; returns whether this call performed the
    /// transition.
    pub(crate) fn begin_close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            false
        } else {
            self.exit.cancel();
            true
        }
    }
}

/// Mutex-protected `channel_id → channel` map owned by server straps.
pub(crate) struct ChannelSet {
    inner: tokio::sync::Mutex<HashMap<String, Arc<Channel>>>,
}

impl ChannelSet {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(ChannelSet {
            inner: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    pub(crate) async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// Insert under the capacity cap; the map never exceeds `limit`.
    pub(crate) async fn try_insert(
        &self,
        channel: Arc<Channel>,
        limit: usize,
        strap_id: &str,
    ) -> Result<(), ChannelError> {
        let mut inner = self.inner.lock().await;
        if inner.len() >= limit {
            return Err(ChannelError::AtCapacity {
                id: strap_id.to_string(),
                current: inner.len(),
                limit,
            });
        }
        inner.insert(channel.id().to_string(), channel);
        Ok(())
    }

    pub(crate) async fn remove(&self, id: &str) -> Option<Arc<Channel>> {
        self.inner.lock().await.remove(id)
    }

    pub(crate) async fn snapshot(&self) -> Vec<Arc<Channel>> {
        self.inner.lock().await.values().cloned().collect()
    }

    /// Drain the map and stop every member. Channels also remove
    /// themselves through their stop hook; taking the map first keeps
    /// the two paths from fighting over it.
    pub(crate) async fn stop_all(&self) {
        let drained: Vec<Arc<Channel>> = {
            let mut inner = self.inner.lock().await;
            inner.drain().map(|(_, channel)| channel).collect()
        };
        for channel in drained {
            channel.stop().await;
        }
    }
}

/// Hook run at the front of a channel's on-stop.
pub(crate) type StopHook = Arc<dyn Fn(Arc<Channel>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Rewrap a handle so the hook runs before the user's on-stop. Server
/// straps use this to drop stopping channels from their map.
pub(crate) fn with_stop_hook(base: &ChannelHandle, hook: StopHook) -> Arc<ChannelHandle> {
    let mut handle = base.clone();
    let inner = handle.on_stop.clone();
    handle.on_stop = Some(Arc::new(move |channel: Arc<Channel>| {
        let hook = Arc::clone(&hook);
        let inner = inner.clone();
        async move {
            hook(Arc::clone(&channel)).await;
            match &inner {
                Some(on_stop) => on_stop(channel).await,
                None => Ok(()),
            }
        }
        .boxed()
    }));
    Arc::new(handle)
}

/// Stop hook removing the channel from a strap's map.
pub(crate) fn removal_hook(set: &Arc<ChannelSet>) -> StopHook {
    let set = Arc::downgrade(set);
    Arc::new(move |channel: Arc<Channel>| {
        let set = set.clone();
        async move {
            if let Some(set) = set.upgrade() {
                set.remove(channel.id()).await;
            }
        }
        .boxed()
    })
}

pub(crate) fn log_strap_started(kind: &str, id: &str) {
    info!(strap = kind, id = %id, "strap started");
}

pub(crate) fn log_strap_stopped(kind: &str, id: &str) {
    info!(strap = kind, id = %id, "strap stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::testing::script_channel;

    #[tokio::test]
    async fn channel_set_enforces_capacity() {
        let set = ChannelSet::new();
        let make = |_: usize| {
            script_channel(Vec::new(), None, ChannelHandle::new(|_, _| async { Ok(()) }))
        };

        let first = make(0);
        set.try_insert(Arc::clone(&first), 1, "test").await.unwrap();
        assert_eq!(set.len().await, 1);

        let second = make(1);
        assert!(matches!(
            set.try_insert(second, 1, "test").await,
            Err(ChannelError::AtCapacity { .. })
        ));
        assert_eq!(set.len().await, 1);

        set.remove(first.id()).await;
        assert_eq!(set.len().await, 0);
    }
}
