//! The shared read pool: a bounded packet queue serviced by a fixed
//! set of worker tasks.
//!
//! Every channel read loop fans into this queue; workers fan out to
//! the owning channel's message handler. A full queue blocks the
//! producing read loop, which is the backpressure the upstream
//! transports (TCP, KCP) are built to absorb. Packets are never
//! dropped to make room.
//!
//! Dispatch order across workers is unspecified; configure a single
//! worker when strict per-channel handler ordering is required.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, trace};

use crate::config::ReadPoolConf;
use crate::error::{ChannelError, ErrorKind};
use crate::packet::Packet;

/// Bounded worker pool consuming queued packets. Usually one per
/// process, shared by every channel through the [`Runtime`].
///
/// Must be created on a Tokio runtime: workers are spawned eagerly.
///
/// [`Runtime`]: crate::runtime::Runtime
pub struct ReadPool {
    sender: parking_lot::Mutex<Option<flume::Sender<Packet>>>,
    workers: tokio::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
    max_workers: usize,
    max_queue: usize,
}

impl ReadPool {
    pub fn new(conf: &ReadPoolConf) -> Arc<Self> {
        let (tx, rx) = flume::bounded(conf.max_queue);
        let mut workers = Vec::with_capacity(conf.max_workers);
        for index in 0..conf.max_workers {
            let rx = rx.clone();
            workers.push(tokio::spawn(worker_loop(rx, index)));
        }
        debug!(
            max_workers = conf.max_workers,
            max_queue = conf.max_queue,
            "read pool started"
        );
        Arc::new(ReadPool {
            sender: parking_lot::Mutex::new(Some(tx)),
            workers: tokio::sync::Mutex::new(workers),
            max_workers: conf.max_workers,
            max_queue: conf.max_queue,
        })
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn max_queue(&self) -> usize {
        self.max_queue
    }

    pub fn is_closed(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Queue a packet for dispatch. Blocks while the queue is full;
    /// fails fast once the pool has been closed.
    ///
    /// The owning channel's pending-dispatch count covers the packet
    /// for exactly as long as it sits in the queue, so a channel stop
    /// can wait out its already-queued packets.
    pub async fn submit(&self, packet: Packet) -> Result<(), ChannelError> {
        let sender = self.sender.lock().clone();
        let Some(tx) = sender else {
            return Err(ChannelError::PoolClosed);
        };
        let guard = DispatchGuard::new(Arc::clone(packet.channel()));
        tx.send_async(packet)
            .await
            .map_err(|_| ChannelError::PoolClosed)?;
        guard.disarm();
        Ok(())
    }

    /// Close the pool: already-queued packets are still dispatched,
    /// then the workers exit. Returns once the queue is drained.
    pub async fn close(&self) {
        drop(self.sender.lock().take());
        let mut workers = self.workers.lock().await;
        for worker in workers.drain(..) {
            let _ = worker.await;
        }
        debug!("read pool closed");
    }
}

/// Balances a channel's pending-dispatch count across the submission
/// await: armed while the packet may still fail to reach the queue,
/// disarmed once the queue owns it (a worker settles the count when it
/// dequeues).
struct DispatchGuard {
    channel: Option<Arc<crate::channel::Channel>>,
}

impl DispatchGuard {
    fn new(channel: Arc<crate::channel::Channel>) -> Self {
        channel.begin_dispatch();
        DispatchGuard {
            channel: Some(channel),
        }
    }

    fn disarm(mut self) {
        self.channel = None;
    }
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.take() {
            channel.finish_dispatch();
        }
    }
}

async fn worker_loop(rx: flume::Receiver<Packet>, index: usize) {
    while let Ok(packet) = rx.recv_async().await {
        let channel = Arc::clone(packet.channel());
        channel.finish_dispatch();
        deliver(packet).await;
    }
    trace!(worker = index, "read pool worker exited");
}

/// Run the owning channel's message handler for one packet, isolating
/// handler errors and panics: both are routed to on-error as a
/// `MESSAGE` failure and neither stops the channel.
pub(crate) async fn deliver(packet: Packet) {
    let channel = Arc::clone(packet.channel());
    let fut = (channel.handle().on_message())(Arc::clone(&channel), packet);
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => channel.fire_error(ErrorKind::Message, &err),
        Err(payload) => {
            let err = ChannelError::Handler(panic_message(payload));
            channel.fire_error(ErrorKind::Message, &err);
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "opaque panic payload".to_string()
    }
}
