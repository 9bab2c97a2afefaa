//! Channels: one logical connection plus its lifecycle machinery.
//!
//! The per-protocol adapters implement [`Transport`]; the read-loop
//! and write-path algorithms live once, here, in [`Channel`].

pub mod kcp;
pub mod tcp;
pub mod udp;
pub mod ws;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ChannelConfig;
use crate::error::{ChannelError, ErrorKind};
use crate::handle::ChannelHandle;
use crate::packet::{Packet, PacketBody, Protocol};
use crate::readpool::{deliver, ReadPool};
use crate::runtime::Runtime;
use crate::statistics::ChannelStatistics;
use crate::strap::Strap;

pub use kcp::KcpTransport;
pub use tcp::TcpTransport;
pub use udp::{UdpPeerTransport, UdpTransport};
pub use ws::WsTransport;

/// Per-protocol connection adapter. One implementation per transport;
/// the channel driver owns the loop, the timeouts, the statistics and
/// the callback routing.
#[async_trait]
pub trait Transport: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// Read one protocol unit (byte batch, datagram, segment or
    /// message). `Ok(None)` is a no-op read: nothing arrived but
    /// nothing failed either.
    async fn read(&self, config: &ChannelConfig) -> Result<Option<PacketBody>, ChannelError>;

    /// Write one prepared payload to the connection, returning the
    /// number of bytes put on the wire.
    async fn write(&self, body: &PacketBody, config: &ChannelConfig) -> Result<usize, ChannelError>;

    /// Wrap egress bytes in this transport's payload tagging.
    fn make_body(&self, data: Bytes) -> Result<PacketBody, ChannelError>;

    /// Deadline for a single read.
    fn read_timeout(&self, config: &ChannelConfig) -> Duration {
        config.read_timeout
    }

    /// Whether the read loop keeps going after a failed read.
    fn read_continues(&self, consecutive_failures: u32, config: &ChannelConfig) -> bool {
        consecutive_failures < config.max_read_failures
    }

    fn local_addr(&self) -> Option<SocketAddr>;

    fn remote_addr(&self) -> Option<SocketAddr>;

    /// Best-effort close of the underlying connection. Must be safe to
    /// call more than once and alongside a blocked read or write.
    async fn close(&self);
}

/// A single logical connection: identifier, transport, statistics,
/// callbacks, and the read-loop task feeding the shared pool.
///
/// Lifecycle is strictly `CREATED → OPEN → CLOSED`; a closed channel
/// stays closed and a new one must be constructed to reconnect.
pub struct Channel {
    id: String,
    config: ChannelConfig,
    stats: ChannelStatistics,
    handle: Arc<ChannelHandle>,
    read_pool: Option<Arc<ReadPool>>,
    transport: Box<dyn Transport>,
    parent: Option<Weak<dyn Strap>>,
    closed: AtomicBool,
    started: AtomicBool,
    registered: AtomicBool,
    close_exit: CancellationToken,
    loop_exited: CancellationToken,
    lifecycle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    write_gate: tokio::sync::Mutex<()>,
    pending_dispatch: AtomicUsize,
    dispatch_done: tokio::sync::Notify,
}

impl Channel {
    pub fn new(
        id: impl Into<String>,
        config: ChannelConfig,
        read_pool: Option<Arc<ReadPool>>,
        handle: Arc<ChannelHandle>,
        transport: Box<dyn Transport>,
        parent: Option<Weak<dyn Strap>>,
    ) -> Arc<Self> {
        let id = id.into();
        debug!(channel_id = %id, protocol = %transport.protocol(), "channel created");
        Arc::new(Channel {
            id,
            config,
            stats: ChannelStatistics::new(),
            handle,
            read_pool,
            transport,
            parent,
            closed: AtomicBool::new(true),
            started: AtomicBool::new(false),
            registered: AtomicBool::new(false),
            close_exit: CancellationToken::new(),
            loop_exited: CancellationToken::new(),
            lifecycle: tokio::sync::Mutex::new(None),
            write_gate: tokio::sync::Mutex::new(()),
            pending_dispatch: AtomicUsize::new(0),
            dispatch_done: tokio::sync::Notify::new(),
        })
    }

    /// Construct with the runtime's shared pool and its default
    /// channel config.
    pub fn with_runtime(
        id: impl Into<String>,
        runtime: &Runtime,
        handle: Arc<ChannelHandle>,
        transport: Box<dyn Transport>,
        parent: Option<Weak<dyn Strap>>,
    ) -> Arc<Self> {
        Channel::new(
            id,
            runtime.channel_conf().clone(),
            Some(Arc::clone(runtime.read_pool())),
            handle,
            transport,
            parent,
        )
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn protocol(&self) -> Protocol {
        self.transport.protocol()
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn stats(&self) -> &ChannelStatistics {
        &self.stats
    }

    pub fn handle(&self) -> &ChannelHandle {
        &self.handle
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.local_addr()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.transport.remote_addr()
    }

    /// The strap that accepted or dialed this channel, if it is still
    /// alive.
    pub fn parent(&self) -> Option<Arc<dyn Strap>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    /// An empty packet tagged with this channel's protocol.
    pub fn new_packet(self: &Arc<Self>) -> Packet {
        Packet::unprepared(Arc::clone(self), self.transport.protocol())
    }

    pub(crate) fn make_body(&self, data: Bytes) -> Result<PacketBody, ChannelError> {
        self.transport.make_body(data)
    }

    /// Open the channel: spawn the read loop, then run on-start. An
    /// on-start failure stops the channel again and is surfaced both
    /// through on-error (`START`) and the returned error.
    pub async fn start(self: &Arc<Self>) -> Result<(), ChannelError> {
        {
            let mut lifecycle = self.lifecycle.lock().await;
            if self.started.swap(true, Ordering::AcqRel) {
                return Err(ChannelError::AlreadyStarted(self.id.clone()));
            }
            self.closed.store(false, Ordering::Release);
            *lifecycle = Some(tokio::spawn(Arc::clone(self).read_loop()));
        }

        if let Some(on_start) = &self.handle.on_start {
            if let Err(err) = on_start(Arc::clone(self)).await {
                self.fire_error(ErrorKind::Start, &err);
                self.stop().await;
                return Err(err);
            }
        }
        // A stop that lands while on-start is running wins.
        if self.is_closed() {
            return Err(ChannelError::ChannelClosed(self.id.clone()));
        }
        info!(channel_id = %self.id, protocol = %self.transport.protocol(), "channel started");
        Ok(())
    }

    /// Close the channel: fire the close-exit signal, close the
    /// transport, and wait for the read loop to finish its teardown
    /// (unregister, on-stop, parent removal). Idempotent; a second
    /// stop returns once the first has completed.
    pub async fn stop(self: &Arc<Self>) {
        let started = {
            let _lifecycle = self.lifecycle.lock().await;
            let started = self.started.load(Ordering::Acquire);
            if !self.closed.swap(true, Ordering::AcqRel) {
                self.close_exit.cancel();
            }
            started
        };
        if started {
            self.transport.close().await;
            self.loop_exited.cancelled().await;
            // Packets this channel already queued reach their handler
            // before stop completes.
            self.drain_dispatch().await;
        }
    }

    /// Run before-write, push the payload through the transport, then
    /// update statistics and run after-write. A transport failure is
    /// surfaced as `WRITE` and closes the channel.
    pub async fn write(self: &Arc<Self>, packet: &Packet) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::ChannelClosed(self.id.clone()));
        }
        let body = packet.body().ok_or(ChannelError::NotPrepared)?;

        let write_gate = self.write_gate.lock().await;
        if let Some(before_write) = &self.handle.before_write {
            before_write(packet)?;
        }

        let outcome = match tokio::time::timeout(
            self.config.write_timeout,
            self.transport.write(body, &self.config),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(ChannelError::Timeout {
                operation: "write",
                duration: self.config.write_timeout,
            }),
        };

        match outcome {
            Ok(bytes) => {
                self.stats.record_send(bytes as u64);
                if let Some(after_write) = &self.handle.after_write {
                    if let Err(err) = after_write(packet) {
                        warn!(channel_id = %self.id, error = %err, "after-write hook failed");
                    }
                }
                Ok(())
            }
            Err(err) => {
                self.stats.record_send_failure();
                self.fire_error(ErrorKind::Write, &err);
                drop(write_gate);
                self.initiate_close().await;
                Err(err)
            }
        }
    }

    /// Mark this channel registered, running on-register first when
    /// one is set. Failures are classified `REGISTER`.
    pub async fn register(self: &Arc<Self>) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::ChannelClosed(self.id.clone()));
        }
        if let Some(on_register) = &self.handle.on_register {
            if let Err(err) = on_register(Arc::clone(self)).await {
                self.fire_error(ErrorKind::Register, &err);
                return Err(err);
            }
        }
        self.registered.store(true, Ordering::Release);
        Ok(())
    }

    /// Clear the registered flag, running on-unregister first when one
    /// is set.
    pub async fn unregister(self: &Arc<Self>) -> Result<(), ChannelError> {
        if let Some(on_unregister) = &self.handle.on_unregister {
            if let Err(err) = on_unregister(Arc::clone(self)).await {
                self.fire_error(ErrorKind::Register, &err);
                return Err(err);
            }
        }
        self.registered.store(false, Ordering::Release);
        Ok(())
    }

    /// Surface a classified failure through on-error. The callback is
    /// synchronous and handed no write/stop capability; the pipeline
    /// performs any stop itself afterwards.
    pub(crate) fn fire_error(self: &Arc<Self>, kind: ErrorKind, err: &ChannelError) {
        warn!(channel_id = %self.id, %kind, error = %err, "channel error");
        if let Some(on_error) = &self.handle.on_error {
            on_error(Arc::clone(self), kind, err);
        }
    }

    /// Flip to closed and unblock the read loop, without waiting for
    /// teardown. Used from inside the pipeline where waiting would
    /// deadlock (the read loop performs the teardown itself).
    async fn initiate_close(&self) {
        self.closed.store(true, Ordering::Release);
        self.close_exit.cancel();
        self.transport.close().await;
    }

    async fn read_loop(self: Arc<Self>) {
        debug!(channel_id = %self.id, "read loop running");
        let mut consecutive_failures: u32 = 0;
        loop {
            tokio::select! {
                biased;
                _ = self.close_exit.cancelled() => break,
                outcome = self.read_once() => match outcome {
                    Ok(Some(body)) => {
                        consecutive_failures = 0;
                        self.stats.record_receive(body.len() as u64);
                        let packet = Packet::prepared(Arc::clone(&self), body);
                        if !self.dispatch(packet).await {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(err) => {
                        if self.close_exit.is_cancelled() {
                            break;
                        }
                        self.stats.record_receive_failure();
                        consecutive_failures += 1;
                        if self.transport.read_continues(consecutive_failures, &self.config) {
                            debug!(
                                channel_id = %self.id,
                                error = %err,
                                failures = consecutive_failures,
                                "read failed, continuing"
                            );
                        } else {
                            self.fire_error(ErrorKind::Read, &err);
                            self.closed.store(true, Ordering::Release);
                            self.close_exit.cancel();
                            break;
                        }
                    }
                }
            }
        }
        self.teardown().await;
        self.loop_exited.cancel();
        debug!(channel_id = %self.id, "read loop exited");
    }

    async fn read_once(&self) -> Result<Option<PacketBody>, ChannelError> {
        let deadline = self.transport.read_timeout(&self.config);
        match tokio::time::timeout(deadline, self.transport.read(&self.config)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ChannelError::Timeout {
                operation: "read",
                duration: deadline,
            }),
        }
    }

    /// Hand a received packet to the pool, or run the handler inline
    /// when no pool is configured. Returns false when the read loop
    /// should end.
    async fn dispatch(self: &Arc<Self>, packet: Packet) -> bool {
        match &self.read_pool {
            Some(pool) => {
                tokio::select! {
                    biased;
                    _ = self.close_exit.cancelled() => {
                        warn!(channel_id = %self.id, "dropping packet read during shutdown");
                        false
                    }
                    submitted = pool.submit(packet) => match submitted {
                        Ok(()) => true,
                        Err(err) => {
                            self.fire_error(ErrorKind::Message, &err);
                            self.closed.store(true, Ordering::Release);
                            self.close_exit.cancel();
                            false
                        }
                    }
                }
            }
            None => {
                deliver(packet).await;
                true
            }
        }
    }

    /// One of this channel's packets entered the pool queue.
    pub(crate) fn begin_dispatch(&self) {
        self.pending_dispatch.fetch_add(1, Ordering::AcqRel);
    }

    /// One of this channel's packets left the pool queue (for its
    /// handler, or dropped on a failed submission).
    pub(crate) fn finish_dispatch(&self) {
        if self.pending_dispatch.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.dispatch_done.notify_waiters();
        }
    }

    /// Wait until none of this channel's packets remain queued.
    async fn drain_dispatch(&self) {
        loop {
            let notified = self.dispatch_done.notified();
            if self.pending_dispatch.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Runs exactly once, on the read-loop task, after the loop ends:
    /// close the transport, clear registration, fire on-stop.
    async fn teardown(self: &Arc<Self>) {
        self.closed.store(true, Ordering::Release);
        self.transport.close().await;

        if self.registered.swap(false, Ordering::AcqRel) {
            if let Some(on_unregister) = &self.handle.on_unregister {
                if let Err(err) = on_unregister(Arc::clone(self)).await {
                    self.fire_error(ErrorKind::Register, &err);
                }
            }
        }

        if let Some(on_stop) = &self.handle.on_stop {
            if let Err(err) = on_stop(Arc::clone(self)).await {
                self.fire_error(ErrorKind::Stop, &err);
            }
        }
        info!(channel_id = %self.id, stats = %self.stats.receive_summary(), "channel stopped");
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("protocol", &self.transport.protocol())
            .field("closed", &self.is_closed())
            .field("registered", &self.is_registered())
            .finish()
    }
}

/// Channel id for address-pair transports.
pub(crate) fn addr_pair_id(local: Option<SocketAddr>, remote: Option<SocketAddr>) -> String {
    match (local, remote) {
        (Some(local), Some(remote)) => format!("{local}->{remote}"),
        (Some(local), None) => format!("{local}->?"),
        (None, Some(remote)) => format!("?->{remote}"),
        (None, None) => "?->?".to_string(),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::io;

    use super::*;

    /// What the next scripted read should produce.
    pub(crate) enum Step {
        Data(Vec<u8>),
        Empty,
        Fail,
    }

    /// Scripted transport for driver tests: plays back reads from a
    /// queue, then blocks forever; records every write.
    pub(crate) struct ScriptTransport {
        steps: parking_lot::Mutex<VecDeque<Step>>,
        pub(crate) written: Arc<parking_lot::Mutex<Vec<Bytes>>>,
        fail_writes: bool,
    }

    impl ScriptTransport {
        pub(crate) fn new(steps: Vec<Step>) -> Self {
            ScriptTransport {
                steps: parking_lot::Mutex::new(steps.into()),
                written: Arc::new(parking_lot::Mutex::new(Vec::new())),
                fail_writes: false,
            }
        }

        pub(crate) fn failing_writes() -> Self {
            let mut transport = ScriptTransport::new(Vec::new());
            transport.fail_writes = true;
            transport
        }
    }

    #[async_trait]
    impl Transport for ScriptTransport {
        fn protocol(&self) -> Protocol {
            Protocol::Tcp
        }

        async fn read(&self, _config: &ChannelConfig) -> Result<Option<PacketBody>, ChannelError> {
            let step = self.steps.lock().pop_front();
            match step {
                Some(Step::Data(data)) => Ok(Some(PacketBody::Tcp(Bytes::from(data)))),
                Some(Step::Empty) => Ok(None),
                Some(Step::Fail) => Err(ChannelError::Io(io::Error::new(
                    io::ErrorKind::Other,
                    "scripted read failure",
                ))),
                None => std::future::pending().await,
            }
        }

        async fn write(
            &self,
            body: &PacketBody,
            _config: &ChannelConfig,
        ) -> Result<usize, ChannelError> {
            if self.fail_writes {
                return Err(ChannelError::Io(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "scripted write failure",
                )));
            }
            let data = body.data().clone();
            let len = data.len();
            self.written.lock().push(data);
            Ok(len)
        }

        fn make_body(&self, data: Bytes) -> Result<PacketBody, ChannelError> {
            Ok(PacketBody::Tcp(data))
        }

        fn local_addr(&self) -> Option<SocketAddr> {
            None
        }

        fn remote_addr(&self) -> Option<SocketAddr> {
            None
        }

        async fn close(&self) {}
    }

    /// Channel over a scripted transport, no pool (inline dispatch)
    /// unless one is passed.
    pub(crate) fn script_channel(
        steps: Vec<Step>,
        pool: Option<Arc<ReadPool>>,
        handle: ChannelHandle,
    ) -> Arc<Channel> {
        let config = ChannelConfig {
            read_timeout: Duration::from_secs(60),
            ..ChannelConfig::default()
        };
        Channel::new(
            "script",
            config,
            pool,
            Arc::new(handle),
            Box::new(ScriptTransport::new(steps)),
            None,
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use super::testing::{script_channel, ScriptTransport, Step};
    use super::*;
    use crate::config::ReadPoolConf;

    fn error_recorder() -> (
        Arc<StdMutex<Vec<ErrorKind>>>,
        impl Fn(Arc<Channel>, ErrorKind, &ChannelError) + Send + Sync + 'static,
    ) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |_, kind, _: &ChannelError| {
            sink.lock().unwrap().push(kind);
        })
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn second_start_is_an_error() {
        let channel = script_channel(
            Vec::new(),
            None,
            ChannelHandle::new(|_, _| async { Ok(()) }),
        );
        channel.start().await.unwrap();
        assert!(!channel.is_closed());
        assert!(matches!(
            channel.start().await,
            Err(ChannelError::AlreadyStarted(_))
        ));
        channel.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_closed_is_terminal() {
        let stops = Arc::new(AtomicUsize::new(0));
        let stop_count = Arc::clone(&stops);
        let handle = ChannelHandle::new(|_, _| async { Ok(()) }).with_on_stop(move |_| {
            let stop_count = Arc::clone(&stop_count);
            async move {
                stop_count.fetch_add(1, AtomicOrdering::SeqCst);
                Ok(())
            }
        });
        let channel = script_channel(Vec::new(), None, handle);

        assert!(channel.is_closed());
        channel.start().await.unwrap();
        channel.stop().await;
        assert!(channel.is_closed());
        channel.stop().await;
        channel.stop().await;
        assert!(channel.is_closed());
        assert_eq!(stops.load(AtomicOrdering::SeqCst), 1);

        // Terminal: no restart.
        assert!(channel.start().await.is_err());
    }

    #[tokio::test]
    async fn read_failures_close_after_threshold() {
        let (errors, on_error) = error_recorder();
        let handle = ChannelHandle::new(|_, _| async { Ok(()) }).with_on_error(on_error);
        let channel = script_channel(vec![Step::Fail, Step::Fail, Step::Fail], None, handle);

        channel.start().await.unwrap();
        wait_until(|| channel.is_closed()).await;

        assert_eq!(channel.stats().receive_failures(), 3);
        let seen = errors.lock().unwrap().clone();
        assert_eq!(seen, vec![ErrorKind::Read]);
    }

    #[tokio::test]
    async fn empty_reads_are_not_failures() {
        let delivered = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&delivered);
        let handle = ChannelHandle::new(move |_, _| {
            let count = Arc::clone(&count);
            async move {
                count.fetch_add(1, AtomicOrdering::SeqCst);
                Ok(())
            }
        });
        let channel = script_channel(
            vec![Step::Empty, Step::Empty, Step::Data(b"ping".to_vec())],
            None,
            handle,
        );

        channel.start().await.unwrap();
        wait_until(|| delivered.load(AtomicOrdering::SeqCst) == 1).await;

        assert_eq!(channel.stats().receive_failures(), 0);
        assert_eq!(channel.stats().received_messages(), 1);
        assert!(!channel.is_closed());
        channel.stop().await;
    }

    #[tokio::test]
    async fn handler_panics_do_not_stop_the_channel() {
        let (errors, on_error) = error_recorder();
        let delivered = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&delivered);
        let handle = ChannelHandle::new(move |_, _| {
            let count = Arc::clone(&count);
            async move {
                let n = count.fetch_add(1, AtomicOrdering::SeqCst) + 1;
                if n == 5 {
                    panic!("scripted handler panic");
                }
                Ok(())
            }
        })
        .with_on_error(on_error);

        let steps = (0..6).map(|i| Step::Data(vec![i])).collect();
        let channel = script_channel(steps, None, handle);
        channel.start().await.unwrap();

        wait_until(|| delivered.load(AtomicOrdering::SeqCst) == 6).await;
        assert!(!channel.is_closed());
        let seen = errors.lock().unwrap().clone();
        assert_eq!(seen, vec![ErrorKind::Message]);
        channel.stop().await;
    }

    #[tokio::test]
    async fn before_write_aborts_the_write() {
        let handle = ChannelHandle::new(|_, _| async { Ok(()) })
            .with_before_write(|_| Err(ChannelError::Frame("rejected".into())));
        let transport = ScriptTransport::new(Vec::new());
        let written = Arc::clone(&transport.written);
        let config = ChannelConfig {
            read_timeout: Duration::from_secs(60),
            ..ChannelConfig::default()
        };
        let channel = Channel::new(
            "gated-writes",
            config,
            None,
            Arc::new(handle),
            Box::new(transport),
            None,
        );
        channel.start().await.unwrap();

        let mut packet = channel.new_packet();
        packet.set_data(&b"nope"[..]).unwrap();
        assert!(channel.write(&packet).await.is_err());
        assert!(!channel.is_closed());
        assert_eq!(channel.stats().sent_messages(), 0);
        assert!(written.lock().is_empty());
        channel.stop().await;
    }

    #[tokio::test]
    async fn write_failure_surfaces_and_closes() {
        let (errors, on_error) = error_recorder();
        let handle = ChannelHandle::new(|_, _| async { Ok(()) }).with_on_error(on_error);
        let config = ChannelConfig {
            read_timeout: Duration::from_secs(60),
            ..ChannelConfig::default()
        };
        let channel = Channel::new(
            "failing-writes",
            config,
            None,
            Arc::new(handle),
            Box::new(ScriptTransport::failing_writes()),
            None,
        );
        channel.start().await.unwrap();

        let mut packet = channel.new_packet();
        packet.set_data(&b"lost"[..]).unwrap();
        assert!(channel.write(&packet).await.is_err());

        wait_until(|| channel.is_closed()).await;
        assert_eq!(channel.stats().send_failures(), 1);
        let seen = errors.lock().unwrap().clone();
        assert_eq!(seen, vec![ErrorKind::Write]);
    }

    #[tokio::test]
    async fn unprepared_packets_are_rejected() {
        let channel = script_channel(
            Vec::new(),
            None,
            ChannelHandle::new(|_, _| async { Ok(()) }),
        );
        channel.start().await.unwrap();
        let packet = channel.new_packet();
        assert!(matches!(
            channel.write(&packet).await,
            Err(ChannelError::NotPrepared)
        ));
        channel.stop().await;
    }

    #[tokio::test]
    async fn register_flows_through_callbacks() {
        let registered = Arc::new(AtomicUsize::new(0));
        let unregistered = Arc::new(AtomicUsize::new(0));
        let reg = Arc::clone(&registered);
        let unreg = Arc::clone(&unregistered);
        let handle = ChannelHandle::kws00(
            |_, _| async { Ok(()) },
            move |_| {
                let reg = Arc::clone(&reg);
                async move {
                    reg.fetch_add(1, AtomicOrdering::SeqCst);
                    Ok(())
                }
            },
            move |_| {
                let unreg = Arc::clone(&unreg);
                async move {
                    unreg.fetch_add(1, AtomicOrdering::SeqCst);
                    Ok(())
                }
            },
        );
        let channel = script_channel(Vec::new(), None, handle);
        channel.start().await.unwrap();

        channel.register().await.unwrap();
        assert!(channel.is_registered());
        assert_eq!(registered.load(AtomicOrdering::SeqCst), 1);

        // Stop clears registration through on-unregister.
        channel.stop().await;
        assert!(!channel.is_registered());
        assert_eq!(unregistered.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pool_backpressure_blocks_producers() {
        let pool = ReadPool::new(&ReadPoolConf {
            max_workers: 1,
            max_queue: 1,
        });
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let delivered = Arc::new(AtomicUsize::new(0));
        let handler_gate = Arc::clone(&gate);
        let count = Arc::clone(&delivered);
        let handle = ChannelHandle::new(move |_, _| {
            let handler_gate = Arc::clone(&handler_gate);
            let count = Arc::clone(&count);
            async move {
                let permit = handler_gate.acquire().await;
                drop(permit);
                count.fetch_add(1, AtomicOrdering::SeqCst);
                Ok(())
            }
        });
        let channel = script_channel(Vec::new(), None, handle);

        let packet = |tag: u8| {
            Packet::prepared(Arc::clone(&channel), PacketBody::Tcp(Bytes::from(vec![tag])))
        };

        // One in flight on the worker, one queued.
        pool.submit(packet(1)).await.unwrap();
        pool.submit(packet(2)).await.unwrap();

        // Queue full: the third producer must block.
        let blocked =
            tokio::time::timeout(Duration::from_millis(100), pool.submit(packet(3))).await;
        assert!(blocked.is_err());

        gate.add_permits(16);
        pool.submit(packet(3)).await.unwrap();
        wait_until(|| delivered.load(AtomicOrdering::SeqCst) == 3).await;
        pool.close().await;
    }

    #[tokio::test]
    async fn queued_packets_reach_handlers_before_stop_completes() {
        let pool = ReadPool::new(&ReadPoolConf {
            max_workers: 1,
            max_queue: 8,
        });
        let delivered = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&delivered);
        let handle = ChannelHandle::new(move |_, _| {
            let count = Arc::clone(&count);
            async move {
                count.fetch_add(1, AtomicOrdering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(())
            }
        });
        let steps = (0..3).map(|i| Step::Data(vec![i])).collect();
        let channel = script_channel(steps, Some(Arc::clone(&pool)), handle);
        channel.start().await.unwrap();

        // All three packets read and queued.
        wait_until(|| channel.stats().received_messages() == 3).await;
        channel.stop().await;

        // Stop returned only after every queued packet reached its
        // handler.
        assert_eq!(delivered.load(AtomicOrdering::SeqCst), 3);
        pool.close().await;
    }

    #[tokio::test]
    async fn pool_drains_queue_on_close_then_fails_fast() {
        let pool = ReadPool::new(&ReadPoolConf {
            max_workers: 1,
            max_queue: 8,
        });
        let delivered = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&delivered);
        let handle = ChannelHandle::new(move |_, _| {
            let count = Arc::clone(&count);
            async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                count.fetch_add(1, AtomicOrdering::SeqCst);
                Ok(())
            }
        });
        let channel = script_channel(Vec::new(), None, handle);

        for tag in 0..3u8 {
            let packet =
                Packet::prepared(Arc::clone(&channel), PacketBody::Tcp(Bytes::from(vec![tag])));
            pool.submit(packet).await.unwrap();
        }
        pool.close().await;

        // Close returns only after the queue drained.
        assert_eq!(delivered.load(AtomicOrdering::SeqCst), 3);

        let late = Packet::prepared(Arc::clone(&channel), PacketBody::Tcp(Bytes::new()));
        assert!(matches!(
            pool.submit(late).await,
            Err(ChannelError::PoolClosed)
        ));
    }
}
