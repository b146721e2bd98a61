pub mod error;
pub mod forms;
pub mod pubsub;
pub mod router;
pub mod stanza;
pub mod transport;

pub use error::{FormError, ProtocolError, StanzaError, TransportError};
pub use forms::{DataForm, FieldType, FormField, FormOption, FormType};
pub use pubsub::{ItemQuery, NodeOptions, PubSubClient, Subscription, SubscriptionState};
pub use router::NotificationRouter;
pub use stanza::PubSubItem;
pub use transport::{
    HandlerTable, StanzaFilter, StanzaHandler, Transport, WireTransport, stanza_channel,
};
