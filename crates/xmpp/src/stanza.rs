//! Namespaces and stanza helpers shared by the PubSub client and router.

use minidom::Element;

use crate::error::TransportError;

pub const NS_CLIENT: &str = "jabber:client";

/// Main PubSub namespace (XEP-0060).
pub const NS_PUBSUB: &str = "http://jabber.org/protocol/pubsub";

/// PubSub event namespace for notifications.
pub const NS_PUBSUB_EVENT: &str = "http://jabber.org/protocol/pubsub#event";

/// PubSub owner namespace for node management.
pub const NS_PUBSUB_OWNER: &str = "http://jabber.org/protocol/pubsub#owner";

/// FORM_TYPE of node configuration forms.
pub const NS_PUBSUB_NODE_CONFIG: &str = "http://jabber.org/protocol/pubsub#node_config";

pub const NS_DISCO_ITEMS: &str = "http://jabber.org/protocol/disco#items";

pub const NS_DATA_FORMS: &str = "jabber:x:data";

/// XEP-0203 delayed delivery.
pub const NS_DELAY: &str = "urn:xmpp:delay";

pub const NS_ATOM: &str = "http://www.w3.org/2005/Atom";

pub const NS_STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";

/// IQ request type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IqType {
    Get,
    Set,
}

impl IqType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IqType::Get => "get",
            IqType::Set => "set",
        }
    }
}

/// Build a request IQ carrying a single payload child.
pub fn build_iq(iq_type: IqType, id: &str, to: &str, payload: Element) -> Element {
    Element::builder("iq", NS_CLIENT)
        .attr("type", iq_type.as_str())
        .attr("id", id)
        .attr("to", to)
        .append(payload)
        .build()
}

/// Parse one stanza from wire bytes. The root must carry its namespace.
pub fn parse_element(raw: &[u8]) -> Result<Element, TransportError> {
    let xml = std::str::from_utf8(raw)
        .map_err(|error| TransportError::Parse(format!("invalid UTF-8 stanza bytes: {error}")))?;
    let trimmed = xml.trim();
    if trimmed.is_empty() {
        return Err(TransportError::Parse("stanza payload is empty".to_string()));
    }

    trimmed
        .parse::<Element>()
        .map_err(|error| TransportError::Parse(format!("failed to parse stanza XML: {error}")))
}

pub fn serialize_element(element: &Element) -> Result<Vec<u8>, TransportError> {
    let mut payload = Vec::new();
    element.write_to(&mut payload).map_err(|error| {
        TransportError::Send(format!(
            "failed to serialize <{}/> stanza: {error}",
            element.name()
        ))
    })?;
    Ok(payload)
}

/// A PubSub item with optional ID and payload.
#[derive(Debug, Clone, PartialEq)]
pub struct PubSubItem {
    /// Optional item ID. If None, the service assigns one.
    pub id: Option<String>,
    pub payload: Option<Element>,
}

impl PubSubItem {
    pub fn new(id: Option<String>, payload: Option<Element>) -> Self {
        Self { id, payload }
    }

    /// Read an `<item/>`; the payload is its first child element.
    pub fn from_element(elem: &Element) -> Self {
        let id = elem.attr("id").map(String::from);
        let payload = elem.children().next().cloned();
        Self { id, payload }
    }

    pub fn to_element(&self, ns: &str) -> Element {
        let mut builder = Element::builder("item", ns);

        if let Some(ref id) = self.id {
            builder = builder.attr("id", id);
        }

        if let Some(ref payload) = self.payload {
            builder = builder.append(payload.clone());
        }

        builder.build()
    }
}
