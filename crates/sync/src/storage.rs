//! CRUD for the records of one node, over a [`PubSubClient`].

use minidom::Element;
use roost_core::config::PayloadFormat;
use roost_xmpp::{ItemQuery, PubSubClient};
use tracing::debug;

use crate::attributes::Attributes;
use crate::codec::PayloadCodec;
use crate::error::CacheError;
use crate::record::Record;

#[derive(Clone)]
pub struct NodeStorage {
    node: String,
    client: PubSubClient,
    codec: PayloadCodec,
    retract_notify: Option<bool>,
}

impl NodeStorage {
    pub fn new(node: impl Into<String>, client: PubSubClient, format: PayloadFormat) -> Self {
        Self {
            node: node.into(),
            client,
            codec: PayloadCodec::new(format),
            retract_notify: None,
        }
    }

    /// The `notify` flag sent with retracts. `None` leaves the client default.
    pub fn with_retract_notify(mut self, notify: Option<bool>) -> Self {
        self.retract_notify = notify;
        self
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn client(&self) -> &PubSubClient {
        &self.client
    }

    pub fn codec(&self) -> &PayloadCodec {
        &self.codec
    }

    /// Publish a new item and set the id the service assigned on `record`.
    pub async fn create(&self, record: &mut Record) -> Result<String, CacheError> {
        let payload = self.codec.encode(&record.attributes)?;
        let id = self.client.publish(&self.node, payload, None).await?;
        debug!(node = %self.node, item = %id, "created item");
        record.id = Some(id.clone());
        Ok(id)
    }

    /// Republish `record` under its existing id.
    pub async fn update(&self, record: &Record) -> Result<(), CacheError> {
        let id = record.id().ok_or(CacheError::MissingItemId)?;
        let payload = self.codec.encode(&record.attributes)?;
        self.client.publish(&self.node, payload, Some(id)).await?;
        debug!(node = %self.node, item = %id, "updated item");
        Ok(())
    }

    /// Fetch the stored item and return what differs from `record`.
    pub async fn get_item(&self, record: &Record) -> Result<Attributes, CacheError> {
        let id = record.id().ok_or(CacheError::MissingItemId)?;
        let fetched = self.fetch_record(id).await?;
        Ok(record.attributes.diff(&fetched.attributes))
    }

    pub async fn get_items(&self, query: &ItemQuery) -> Result<Vec<Record>, CacheError> {
        let items = self.client.fetch_items(&self.node, query).await?;
        let records = items
            .iter()
            .map(|item| self.codec.decode_item(item))
            .collect::<Result<Vec<_>, _>>()?;
        debug!(node = %self.node, count = records.len(), "fetched items");
        Ok(records)
    }

    /// Retract `record`'s item.
    pub async fn destroy(&self, record: &Record) -> Result<(), CacheError> {
        let id = record.id().ok_or(CacheError::MissingItemId)?;
        self.client.retract(&self.node, id, self.retract_notify).await?;
        debug!(node = %self.node, item = %id, "retracted item");
        Ok(())
    }

    /// Fetch a single item by id.
    pub async fn fetch_record(&self, id: &str) -> Result<Record, CacheError> {
        let items = self.client.fetch_items(&self.node, &ItemQuery::ids([id])).await?;
        let item = items
            .iter()
            .find(|item| item.attr("id") == Some(id))
            .ok_or_else(|| CacheError::ItemNotFound(id.to_string()))?;

        Ok(self.codec.decode_item(item)?)
    }

    pub fn decode_payload(&self, payload: &Element) -> Result<Attributes, CacheError> {
        Ok(self.codec.decode(payload)?)
    }
}

impl std::fmt::Debug for NodeStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeStorage")
            .field("node", &self.node)
            .field("service", &self.client.service())
            .field("format", &self.codec.format())
            .finish()
    }
}
