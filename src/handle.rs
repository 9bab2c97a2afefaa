//! Channel handles: the bundle of user callbacks bound to a channel.

use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};

use crate::channel::Channel;
use crate::error::{ChannelError, ErrorKind};
use crate::packet::Packet;

/// Invoked once per received prepared packet, on a read-pool worker
/// (or inline on the read loop when no pool is configured). May write.
pub type OnMessage =
    Arc<dyn Fn(Arc<Channel>, Packet) -> BoxFuture<'static, Result<(), ChannelError>> + Send + Sync>;

/// Lifecycle callback shape shared by on-start, on-stop, on-register
/// and on-unregister.
pub type OnLifecycle =
    Arc<dyn Fn(Arc<Channel>) -> BoxFuture<'static, Result<(), ChannelError>> + Send + Sync>;

/// Synchronous hook run around each transport write. Must not call
/// back into the channel.
pub type OnWriteHook = Arc<dyn Fn(&Packet) -> Result<(), ChannelError> + Send + Sync>;

/// Synchronous error callback. Deliberately not async and handed no
/// write/stop capability: the pipeline performs the stop itself after
/// the callback returns.
pub type OnError = Arc<dyn Fn(Arc<Channel>, ErrorKind, &ChannelError) + Send + Sync>;

fn message<F, Fut>(f: F) -> OnMessage
where
    F: Fn(Arc<Channel>, Packet) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ChannelError>> + Send + 'static,
{
    Arc::new(move |channel, packet| f(channel, packet).boxed())
}

fn lifecycle<F, Fut>(f: F) -> OnLifecycle
where
    F: Fn(Arc<Channel>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ChannelError>> + Send + 'static,
{
    Arc::new(move |channel| f(channel).boxed())
}

/// The callback set bound to a channel. on-message is mandatory,
/// everything else optional. Handles are immutable after construction
/// and freely shared across channels.
#[derive(Clone)]
pub struct ChannelHandle {
    pub(crate) on_message: OnMessage,
    pub(crate) on_start: Option<OnLifecycle>,
    pub(crate) on_stop: Option<OnLifecycle>,
    pub(crate) before_write: Option<OnWriteHook>,
    pub(crate) after_write: Option<OnWriteHook>,
    pub(crate) on_error: Option<OnError>,
    pub(crate) on_register: Option<OnLifecycle>,
    pub(crate) on_unregister: Option<OnLifecycle>,
}

impl ChannelHandle {
    pub fn new<F, Fut>(on_message: F) -> Self
    where
        F: Fn(Arc<Channel>, Packet) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ChannelError>> + Send + 'static,
    {
        ChannelHandle {
            on_message: message(on_message),
            on_start: None,
            on_stop: None,
            before_write: None,
            after_write: None,
            on_error: None,
            on_register: None,
            on_unregister: None,
        }
    }

    /// Handle for KWS00 sessions: message handler plus the
    /// register/unregister pair fired at session boundaries.
    pub fn kws00<M, MFut, R, RFut, U, UFut>(on_message: M, on_register: R, on_unregister: U) -> Self
    where
        M: Fn(Arc<Channel>, Packet) -> MFut + Send + Sync + 'static,
        MFut: Future<Output = Result<(), ChannelError>> + Send + 'static,
        R: Fn(Arc<Channel>) -> RFut + Send + Sync + 'static,
        RFut: Future<Output = Result<(), ChannelError>> + Send + 'static,
        U: Fn(Arc<Channel>) -> UFut + Send + Sync + 'static,
        UFut: Future<Output = Result<(), ChannelError>> + Send + 'static,
    {
        ChannelHandle::new(on_message)
            .with_on_register(on_register)
            .with_on_unregister(on_unregister)
    }

    pub fn with_on_start<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<Channel>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ChannelError>> + Send + 'static,
    {
        self.on_start = Some(lifecycle(f));
        self
    }

    pub fn with_on_stop<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<Channel>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ChannelError>> + Send + 'static,
    {
        self.on_stop = Some(lifecycle(f));
        self
    }

    pub fn with_before_write<F>(mut self, f: F) -> Self
    where
        F: Fn(&Packet) -> Result<(), ChannelError> + Send + Sync + 'static,
    {
        self.before_write = Some(Arc::new(f));
        self
    }

    pub fn with_after_write<F>(mut self, f: F) -> Self
    where
        F: Fn(&Packet) -> Result<(), ChannelError> + Send + Sync + 'static,
    {
        self.after_write = Some(Arc::new(f));
        self
    }

    pub fn with_on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(Arc<Channel>, ErrorKind, &ChannelError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub fn with_on_register<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<Channel>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ChannelError>> + Send + 'static,
    {
        self.on_register = Some(lifecycle(f));
        self
    }

    pub fn with_on_unregister<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<Channel>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ChannelError>> + Send + 'static,
    {
        self.on_unregister = Some(lifecycle(f));
        self
    }

    pub(crate) fn on_message(&self) -> &OnMessage {
        &self.on_message
    }
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("on_start", &self.on_start.is_some())
            .field("on_stop", &self.on_stop.is_some())
            .field("before_write", &self.before_write.is_some())
            .field("after_write", &self.after_write.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_register", &self.on_register.is_some())
            .field("on_unregister", &self.on_unregister.is_some())
            .finish()
    }
}
