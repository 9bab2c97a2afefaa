//! Packets: the typed envelope moved between transports, the read pool
//! and user handlers.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::channel::Channel;
use crate::error::ChannelError;
use crate::frame::Kws00Frame;

/// Wire protocol a channel (and every packet it produces) speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
    Kcp,
    Ws,
    Kws00,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Kcp => "kcp",
            Protocol::Ws => "ws",
            Protocol::Kws00 => "kws00",
        };
        f.write_str(name)
    }
}

/// WebSocket message kind carried by WS packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsMsgKind {
    Text,
    Binary,
}

/// Protocol-tagged payload. Handlers that care about the protocol
/// pattern-match; everyone else uses [`PacketBody::data`].
#[derive(Debug, Clone)]
pub enum PacketBody {
    Tcp(Bytes),
    Udp(Bytes),
    Kcp(Bytes),
    Ws { kind: WsMsgKind, data: Bytes },
    Kws00 { raw: Bytes, frame: Kws00Frame },
}

impl PacketBody {
    pub fn protocol(&self) -> Protocol {
        match self {
            PacketBody::Tcp(_) => Protocol::Tcp,
            PacketBody::Udp(_) => Protocol::Udp,
            PacketBody::Kcp(_) => Protocol::Kcp,
            PacketBody::Ws { .. } => Protocol::Ws,
            PacketBody::Kws00 { .. } => Protocol::Kws00,
        }
    }

    /// The raw bytes of this payload. For KWS00 this is the undecoded
    /// segment the frame was built from (empty on egress packets
    /// prepared from a frame).
    pub fn data(&self) -> &Bytes {
        match self {
            PacketBody::Tcp(data) | PacketBody::Udp(data) | PacketBody::Kcp(data) => data,
            PacketBody::Ws { data, .. } => data,
            PacketBody::Kws00 { raw, .. } => raw,
        }
    }

    pub fn len(&self) -> usize {
        self.data().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data().is_empty()
    }
}

/// Envelope for a single message or byte batch. A packet is created by
/// its owning channel (so each variant is correctly tagged), becomes
/// "prepared" once a payload is attached, and is dropped after the
/// handler returns or the write completes.
///
/// The owner reference is a strong `Arc`: nothing in the
/// strap→channel→handle graph points back at packets, so there is no
/// cycle, and a packet queued in the read pool keeps its channel alive
/// until it has been dispatched.
#[derive(Clone)]
pub struct Packet {
    channel: Arc<Channel>,
    protocol: Protocol,
    body: Option<PacketBody>,
}

impl Packet {
    pub(crate) fn unprepared(channel: Arc<Channel>, protocol: Protocol) -> Self {
        Packet {
            channel,
            protocol,
            body: None,
        }
    }

    pub(crate) fn prepared(channel: Arc<Channel>, body: PacketBody) -> Self {
        Packet {
            channel,
            protocol: body.protocol(),
            body: Some(body),
        }
    }

    /// The channel this packet belongs to.
    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn is_prepared(&self) -> bool {
        self.body.is_some()
    }

    pub fn body(&self) -> Option<&PacketBody> {
        self.body.as_ref()
    }

    pub fn data(&self) -> Option<&Bytes> {
        self.body.as_ref().map(PacketBody::data)
    }

    /// Attach the payload, wrapped in the owning channel's protocol
    /// tagging. May be called at most once per packet; KWS00 channels
    /// decode the bytes into a frame here, which can fail.
    pub fn set_data(&mut self, data: impl Into<Bytes>) -> Result<(), ChannelError> {
        if self.body.is_some() {
            return Err(ChannelError::AlreadyPrepared);
        }
        self.body = Some(self.channel.make_body(data.into())?);
        Ok(())
    }

    /// Attach a KWS00 frame for egress. The frame is encoded by the
    /// channel's codec at write time; `data()` stays empty.
    pub fn set_frame(&mut self, frame: Kws00Frame) -> Result<(), ChannelError> {
        if self.body.is_some() {
            return Err(ChannelError::AlreadyPrepared);
        }
        if self.protocol != Protocol::Kws00 {
            return Err(ChannelError::ProtocolMismatch {
                channel: self.protocol,
                packet: Protocol::Kws00,
            });
        }
        self.body = Some(PacketBody::Kws00 {
            raw: Bytes::new(),
            frame,
        });
        Ok(())
    }

    pub fn frame(&self) -> Option<&Kws00Frame> {
        match &self.body {
            Some(PacketBody::Kws00 { frame, .. }) => Some(frame),
            _ => None,
        }
    }

    pub fn ws_kind(&self) -> Option<WsMsgKind> {
        match &self.body {
            Some(PacketBody::Ws { kind, .. }) => Some(*kind),
            _ => None,
        }
    }

    /// Switch the WebSocket message kind of a prepared WS packet.
    /// No-op for other protocols.
    pub fn set_ws_kind(&mut self, new_kind: WsMsgKind) {
        if let Some(PacketBody::Ws { kind, .. }) = &mut self.body {
            *kind = new_kind;
        }
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("channel", &self.channel.id())
            .field("protocol", &self.protocol)
            .field("prepared", &self.is_prepared())
            .field("len", &self.body.as_ref().map(PacketBody::len))
            .finish()
    }
}
