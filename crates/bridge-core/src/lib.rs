//! RTP-to-WebRTC media bridge.
//!
//! Ingests RTP media packets from a legacy/SIP-style source, repackages
//! them into frames for a WebRTC-style transport, and announces the
//! dynamically allocated (video, audio) port pair back to the caller.
//! Sessions are independent: each one owns its port pair, its handler
//! registrations and its own ingress task, so a slow consumer never
//! blocks unrelated sessions.
//!
//! Signaling (SDP offer/answer), codec handling, NAT traversal and the
//! actual ICE/DTLS/SRTP transport are external collaborators, reached
//! only through the [`PacketSource`] seam and the registered handlers.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use rtp2rtc_bridge::{BridgeConfig, ChannelPacketSource, RtpBridge};
//!
//! # async fn run() -> rtp2rtc_bridge::Result<()> {
//! let bridge = RtpBridge::new(BridgeConfig::default());
//!
//! let session = bridge.create_session().await;
//! bridge
//!     .register_ports_handler(&session, Arc::new(|video, audio| {
//!         println!("media ports: video={video} audio={audio}");
//!     }))
//!     .await?;
//! bridge
//!     .register_input_handler(&session, Arc::new(|packet: &[u8]| {
//!         // forward `packet` to the RTC transport
//!         let _ = packet;
//!     }))
//!     .await?;
//!
//! let (_producer, source) = ChannelPacketSource::new();
//! let ports = bridge.start_session(&session, Box::new(source)).await?;
//! println!("session started on {ports}");
//!
//! bridge.stop_session(&session).await?;
//! # Ok(())
//! # }
//! ```

pub mod allocator;
pub mod bridge;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod ingress;
pub mod packet;
pub mod relay;
pub mod session;
pub mod types;

pub use allocator::PortAllocator;
pub use bridge::RtpBridge;
pub use config::{AllocationStrategy, AllocatorConfig, BridgeConfig, PortRange, PumpConfig};
pub use dispatch::{InputHandler, PortsHandler};
pub use error::{Error, Result};
pub use ingress::{ChannelPacketSource, PacketSource, UdpPacketSource};
pub use packet::{RtcFrame, RtpHeader, RtpPacket, RTP_MIN_HEADER_SIZE, RTP_VERSION};
pub use relay::{DropReason, RelayCore, RelayOutcome, SequenceGap};
pub use session::events::BridgeEvent;
pub use session::{SessionInfo, SessionRegistry, SessionStats};
pub use types::{MediaKind, PortPair, SessionId, SessionState};
