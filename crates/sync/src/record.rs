use serde_json::Value;

use crate::attributes::Attributes;

/// A node item mirrored locally: the item id plus its decoded attributes.
///
/// The id is `None` until the service assigns one on create.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    pub id: Option<String>,
    pub attributes: Attributes,
}

impl Record {
    pub fn new(attributes: Attributes) -> Self {
        Self {
            id: None,
            attributes,
        }
    }

    pub fn with_id(id: impl Into<String>, attributes: Attributes) -> Self {
        Self {
            id: Some(id.into()),
            attributes,
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.attributes.insert(key, value)
    }
}
