//! Device-side WebRTC signaling over an authenticated point-to-point
//! transport.
//!
//! A [`Device`] accepts signaling streams, negotiates one peer connection per
//! stream (perfect negotiation, trickle or gathered ICE), reports track
//! metadata, and bridges the built-in `coap` and `stream-<port>` data
//! channels back into the transport.

pub mod channels;
pub mod config;
pub mod device;
pub mod ids;
pub mod media;
pub mod negotiation;
pub mod peer;
pub mod protocol;
pub mod scheduler;
pub mod signaling;
pub mod telemetry;
pub mod transport;

pub use config::{DeviceConfig, SignalingConfig};
pub use device::{Device, DeviceBuilder, DeviceHandle};
pub use media::{Datachannel, MediaTrack, TrackError};
pub use peer::MessageKind;
pub use protocol::ProtocolVersion;
pub use transport::ConnectionRef;
