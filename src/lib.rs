//! farview - remote camera viewing over iroh P2P.
//!
//! Two roles, no shared process:
//!
//! - **Listener**: captures frames from a local camera and answers "give me
//!   the current frame" requests from allow-listed identities.
//! - **Fetcher**: resolves a remote endpoint, performs exactly one fetch,
//!   and saves the result.
//!
//! Path discovery, session establishment, encryption and identity-based
//! authentication are owned by iroh; image encode/decode is owned by the
//! `image` crate. This crate wires together identity persistence, a camera
//! read loop, a latest-frame hand-off slot and the request/response
//! handshake.

pub mod fetcher;
pub mod frame;
pub mod listener;
pub mod net;
pub mod producer;
pub mod proto;
pub mod slot;

#[cfg(feature = "camera")]
pub mod camera;

pub use fetcher::{FetchError, FetchResult, FetchState, Fetcher};
pub use frame::Frame;
pub use listener::{Listener, ListenerConfig, StreamSettings};
pub use net::ALPN;
pub use producer::{FrameProducer, FrameSource};
pub use proto::FrameRequest;
pub use slot::FrameSlot;

#[cfg(feature = "camera")]
pub use camera::{list_cameras, Camera, CameraInfo};
