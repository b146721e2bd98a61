pub mod config;
pub mod error;
pub mod event;
pub mod telemetry;

pub use config::{Config, PayloadFormat};
pub use error::{EventBusError, Result, RoostError};
pub use event::{
    EventDispatcher, EventHandler, EventKind, EventSubscription, HandlerId, PubSubEvent,
};
