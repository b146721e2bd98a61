//! Attribute mapping <-> item payload.
//!
//! Both encodings wrap the attributes in an Atom `<entry/>`:
//!
//! - [`PayloadFormat::Json`]: the entry's text is a JSON object.
//! - [`PayloadFormat::Atom`]: one child element per attribute, named by key,
//!   whose text is the value. Non-string values are written as JSON text and
//!   read back as strings.
//!
//! The `id` attribute is never part of a payload; the item's `id` attribute
//! carries it.

use minidom::Element;
use roost_core::config::PayloadFormat;
use roost_xmpp::stanza::NS_ATOM;
use serde_json::Value;

use crate::attributes::Attributes;
use crate::error::CodecError;
use crate::record::Record;

const ID_KEY: &str = "id";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PayloadCodec {
    format: PayloadFormat,
}

impl PayloadCodec {
    pub fn new(format: PayloadFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> PayloadFormat {
        self.format
    }

    pub fn encode(&self, attributes: &Attributes) -> Result<Element, CodecError> {
        let fields = attributes.iter().filter(|(key, _)| key.as_str() != ID_KEY);

        match self.format {
            PayloadFormat::Json => {
                let object: serde_json::Map<String, Value> =
                    fields.map(|(k, v)| (k.clone(), v.clone())).collect();
                let text = serde_json::to_string(&object)
                    .map_err(|e| CodecError::InvalidJson(e.to_string()))?;
                Ok(Element::builder("entry", NS_ATOM).append(text).build())
            }
            PayloadFormat::Atom => {
                let mut entry = Element::builder("entry", NS_ATOM);
                for (key, value) in fields {
                    if !is_xml_name(key) {
                        return Err(CodecError::InvalidElementName(key.clone()));
                    }
                    let text = match value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    entry = entry.append(Element::builder(key.as_str(), NS_ATOM).append(text).build());
                }
                Ok(entry.build())
            }
        }
    }

    pub fn decode(&self, payload: &Element) -> Result<Attributes, CodecError> {
        let mut attributes = match self.format {
            PayloadFormat::Json => {
                let text = payload.text();
                let value: Value = serde_json::from_str(text.trim())
                    .map_err(|e| CodecError::InvalidJson(e.to_string()))?;
                Attributes::from_value(value).ok_or(CodecError::NotAnObject)?
            }
            PayloadFormat::Atom => payload
                .children()
                .map(|child| (child.name().to_string(), Value::String(child.text())))
                .collect(),
        };

        attributes.remove(ID_KEY);
        Ok(attributes)
    }

    /// Decode a raw `<item/>` into a record.
    pub fn decode_item(&self, item: &Element) -> Result<Record, CodecError> {
        let id = item.attr("id").ok_or(CodecError::MissingItemId)?;
        let payload = item
            .children()
            .next()
            .ok_or_else(|| CodecError::MissingPayload(id.to_string()))?;

        Ok(Record::with_id(id, self.decode(payload)?))
    }
}

/// Element names we accept for tag-per-field keys: no namespace prefixes.
fn is_xml_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.'))
}
