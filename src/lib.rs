//! flywire - multi-protocol connection framework
//!
//! flywire unifies TCP, UDP, KCP, WebSocket and HTTP-upgrade
//! connections behind a single channel lifecycle and message-dispatch
//! abstraction. Applications supply a [`ChannelHandle`] (an on-message
//! callback plus optional lifecycle hooks); the framework accepts or
//! dials connections ([`strap`]), runs one read loop per connection
//! ([`channel`]), fans received packets through a shared bounded
//! worker pool ([`readpool`]), and tears everything down race-free on
//! error or stop.
//!
//! ```no_run
//! use flywire::{ChannelHandle, ServerConf, TcpServerStrap};
//!
//! #[tokio::main]
//! async fn main() -> flywire::Result<()> {
//!     // Echo every received packet back on its own channel.
//!     let handle = ChannelHandle::new(|channel, packet| async move {
//!         channel.write(&packet).await
//!     });
//!     let server = TcpServerStrap::new(ServerConf::new("127.0.0.1:9000"), handle)?;
//!     server.start().await?;
//!     // ... later: server.stop().await;
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod config;
pub mod error;
pub mod frame;
pub mod handle;
pub mod packet;
pub mod readpool;
pub mod runtime;
pub mod statistics;
pub mod strap;

pub use channel::{Channel, Transport};
pub use config::{ChannelConfig, ClientConf, ReadPoolConf, ServerConf};
pub use error::{ChannelError, ErrorKind};
pub use frame::{FrameCodec, Kws00Frame};
pub use handle::ChannelHandle;
pub use packet::{Packet, PacketBody, Protocol, WsMsgKind};
pub use readpool::ReadPool;
pub use runtime::Runtime;
pub use statistics::ChannelStatistics;
pub use strap::{
    http_handler, HttpHandler, HttpWsServerStrap, KcpClientStrap, KcpServerStrap, Kws00ClientStrap,
    Kws00ServerStrap, Strap, TcpClientStrap, TcpServerStrap, UdpClientStrap, UdpServerStrap,
    WsClientStrap,
};

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, ChannelError>;
