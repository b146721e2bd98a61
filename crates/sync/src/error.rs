use roost_xmpp::error::ProtocolError;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("payload JSON is not an object")]
    NotAnObject,

    #[error("attribute name {0:?} is not a valid XML element name")]
    InvalidElementName(String),

    #[error("item {0} carries no payload")]
    MissingPayload(String),

    #[error("item has no id")]
    MissingItemId,
}

#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("no node bound")]
    NoNodeBound,

    #[error("record has no item id")]
    MissingItemId,

    #[error("item {0} not found on node")]
    ItemNotFound(String),

    #[error("malformed payload: {0}")]
    MalformedPayload(#[from] CodecError),

    #[error("pubsub request failed: {0}")]
    Protocol(#[from] ProtocolError),
}
