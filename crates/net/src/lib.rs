//! Network facade for VTN nodes
//!
//! The P2P overlay is consumed through the [`VideoNetwork`] contract: node
//! identity, per-stream [`Broadcaster`]/[`Subscriber`] handles, peer connect,
//! protocol bootstrap and the point-to-point transcode-result notification.
//!
//! Handles are acquired through [`BroadcasterGuard`] and [`SubscriptionGuard`],
//! which release the underlying resource on every exit path.
//!
//! # Example
//!
//! ```
//! use vtn_net::{MemoryHub, VideoNetwork};
//!
//! let hub = MemoryHub::new();
//! let node = hub.join("12D3KooWExample");
//! assert_eq!(node.node_id(), "12D3KooWExample");
//! ```

mod error;
mod guard;
mod identity;
mod memory;
mod network;

pub use error::{KeyError, NetError, NetResult};
pub use guard::{BroadcasterGuard, SubscriptionGuard};
pub use identity::{
    generate_keypair, load_keys, load_or_generate_keys, node_id, save_keys, KEY_FILE_NAME,
};
pub use memory::{
    MemoryHub, MemoryNetwork, TranscodeNotification, DEFAULT_FINISHED_LIMIT, DEFAULT_HISTORY_LIMIT,
};
pub use network::{Broadcaster, Segment, Subscriber, TranscodeResult, VideoNetwork};
