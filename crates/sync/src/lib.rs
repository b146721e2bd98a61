//! Local mirrors of PubSub nodes.
//!
//! [`NodeCache`] keeps an ordered, change-notifying set of a node's items in
//! step with the service: CRUD goes out through [`NodeStorage`], and publish
//! and retract notifications come back in through the client's event
//! dispatcher.

pub mod attributes;
pub mod cache;
pub mod codec;
pub mod error;
pub mod record;
pub mod storage;

pub use attributes::Attributes;
pub use cache::{CacheEvent, CacheOptions, NodeCache};
pub use codec::PayloadCodec;
pub use error::{CacheError, CodecError};
pub use record::Record;
pub use storage::NodeStorage;
