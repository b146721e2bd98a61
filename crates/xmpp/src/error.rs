use minidom::Element;
use thiserror::Error;

use crate::stanza::{NS_CLIENT, NS_STANZAS};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("send failed: {0}")]
    Send(String),

    #[error("stanza parse failed: {0}")]
    Parse(String),

    #[error("request {0} was dropped before a response arrived")]
    RequestDropped(String),
}

/// An IQ error returned by the service, passed through unmodified.
#[derive(Debug, Clone, PartialEq)]
pub struct StanzaError {
    /// The `type` attribute, e.g. `cancel` or `auth`.
    pub error_type: String,
    /// The defined condition element name, e.g. `item-not-found`.
    pub condition: String,
    pub text: Option<String>,
    /// The original `<error/>` element.
    pub element: Element,
}

impl StanzaError {
    pub fn from_element(error: &Element) -> Self {
        let error_type = error.attr("type").unwrap_or("cancel").to_string();
        let condition = error
            .children()
            .find(|child| child.ns() == NS_STANZAS && child.name() != "text")
            .map(|child| child.name().to_string())
            .unwrap_or_else(|| "undefined-condition".to_string());
        let text = error
            .get_child("text", NS_STANZAS)
            .map(|text| text.text())
            .filter(|text| !text.is_empty());

        Self {
            error_type,
            condition,
            text,
            element: error.clone(),
        }
    }

    /// Extract the error of an `<iq type='error'/>` response.
    pub fn from_iq(iq: &Element) -> Self {
        match iq.get_child("error", NS_CLIENT) {
            Some(error) => Self::from_element(error),
            None => Self::from_element(&Element::builder("error", NS_CLIENT).build()),
        }
    }
}

impl std::fmt::Display for StanzaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.condition, self.error_type)?;
        if let Some(text) = &self.text {
            write!(f, ": {text}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("service returned error: {0}")]
    Stanza(StanzaError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

impl ProtocolError {
    /// The server's defined condition, if this is a stanza error.
    pub fn condition(&self) -> Option<&str> {
        match self {
            ProtocolError::Stanza(error) => Some(&error.condition),
            _ => None,
        }
    }
}

impl From<StanzaError> for ProtocolError {
    fn from(error: StanzaError) -> Self {
        ProtocolError::Stanza(error)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FormError {
    #[error("expected <x xmlns='jabber:x:data'/>, found <{0}/>")]
    NotAForm(String),

    #[error("unknown field type: {0}")]
    UnknownFieldType(String),

    #[error("unknown form type: {0}")]
    UnknownFormType(String),
}
