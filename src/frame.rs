//! KWS00 frame seam.
//!
//! KWS00 carries WebSocket-style frames over KCP. The byte layout is
//! owned by an external codec; the channel layer only moves decoded
//! frames through the pipeline and hands them back for encoding on the
//! write path.

use bytes::Bytes;

use crate::error::ChannelError;

/// A decoded KWS00 frame as carried by packets. The opcode follows the
/// session/data/close vocabulary of the wire protocol; the payload is
/// opaque to this layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Kws00Frame {
    pub opcode: u8,
    pub payload: Bytes,
}

impl Kws00Frame {
    pub fn new(opcode: u8, payload: impl Into<Bytes>) -> Self {
        Kws00Frame {
            opcode,
            payload: payload.into(),
        }
    }
}

/// Externalized KWS00 byte layout. Channels built for KWS00 decode
/// every KCP segment through this trait on ingress and encode frames
/// through it on egress.
pub trait FrameCodec: Send + Sync + 'static {
    fn decode(&self, raw: &[u8]) -> Result<Kws00Frame, ChannelError>;
    fn encode(&self, frame: &Kws00Frame) -> Bytes;
}
