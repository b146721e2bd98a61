//! XEP-0060 PubSub client.
//!
//! Builds owner, publisher and subscriber requests against one pubsub
//! service and parses the service's responses into typed results. Push
//! notifications are classified separately by [`crate::router`].
//!
//! ## XML Namespaces
//!
//! - `http://jabber.org/protocol/pubsub` - Main PubSub namespace
//! - `http://jabber.org/protocol/pubsub#owner` - Node owner operations
//! - `http://jabber.org/protocol/disco#items` - Node discovery

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use jid::Jid;
use minidom::Element;
use roost_core::config::PubSubConfig;
use roost_core::event::EventDispatcher;
use tracing::debug;

use crate::error::{ProtocolError, StanzaError};
use crate::forms::{DataForm, FormField};
use crate::router::NotificationRouter;
use crate::stanza::{
    IqType, NS_DATA_FORMS, NS_DISCO_ITEMS, NS_PUBSUB, NS_PUBSUB_NODE_CONFIG, NS_PUBSUB_OWNER,
    PubSubItem, build_iq,
};
use crate::transport::Transport;

/// Node configuration options, kept in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeOptions {
    options: Vec<(String, String)>,
}

impl NodeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, option: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(option, value);
        self
    }

    /// Set an option. Re-setting an option keeps its original position.
    pub fn set(&mut self, option: impl Into<String>, value: impl Into<String>) {
        let option = option.into();
        let value = value.into();
        match self.options.iter_mut().find(|(name, _)| *name == option) {
            Some(existing) => existing.1 = value,
            None => self.options.push((option, value)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.options.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.options.len()
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    /// The `pubsub#node_config` submit form for these options.
    pub fn to_form(&self) -> DataForm {
        DataForm::submit(
            NS_PUBSUB_NODE_CONFIG,
            self.iter().map(|(option, value)| FormField::text_single(option, value)),
        )
    }
}

/// Selects which items [`PubSubClient::fetch_items`] asks for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemQuery {
    pub max_items: Option<u32>,
    pub item_ids: Vec<String>,
}

impl ItemQuery {
    pub fn latest(max_items: u32) -> Self {
        Self {
            max_items: Some(max_items),
            item_ids: Vec::new(),
        }
    }

    pub fn ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            max_items: None,
            item_ids: ids.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    None,
    Pending,
    Subscribed,
    Unconfigured,
}

impl SubscriptionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionState::None => "none",
            SubscriptionState::Pending => "pending",
            SubscriptionState::Subscribed => "subscribed",
            SubscriptionState::Unconfigured => "unconfigured",
        }
    }
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionState {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(SubscriptionState::None),
            "pending" => Ok(SubscriptionState::Pending),
            "subscribed" => Ok(SubscriptionState::Subscribed),
            "unconfigured" => Ok(SubscriptionState::Unconfigured),
            other => Err(ProtocolError::MalformedResponse(format!(
                "unknown subscription state: {other}"
            ))),
        }
    }
}

/// A subscription as reported by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub node: String,
    pub jid: String,
    pub subid: Option<String>,
    pub state: SubscriptionState,
}

impl Subscription {
    pub fn from_element(elem: &Element) -> Result<Self, ProtocolError> {
        let jid = elem
            .attr("jid")
            .ok_or_else(|| {
                ProtocolError::MalformedResponse("subscription without jid".to_string())
            })?
            .to_string();
        let state = match elem.attr("subscription") {
            Some(state) => state.parse()?,
            None => SubscriptionState::None,
        };

        Ok(Self {
            node: elem.attr("node").unwrap_or_default().to_string(),
            jid,
            subid: elem.attr("subid").map(String::from),
            state,
        })
    }
}

/// The service a connection talks to when none is configured.
pub fn default_service(jid: &Jid) -> String {
    format!("pubsub.{}", jid.domain())
}

/// Typed PubSub operations against one service.
///
/// Construction installs the [`NotificationRouter`] on the transport, once
/// per service and dispatcher: building a second client over the same pair
/// reuses that route. Clones share the transport and the event dispatcher.
#[derive(Clone)]
pub struct PubSubClient {
    transport: Arc<dyn Transport>,
    service: String,
    events: Arc<EventDispatcher>,
}

impl PubSubClient {
    /// A client for `pubsub.<domain of the connection JID>`.
    pub fn new(transport: Arc<dyn Transport>, events: Arc<EventDispatcher>) -> Self {
        let service = default_service(transport.jid());
        Self::with_service(transport, service, events)
    }

    pub fn with_service(
        transport: Arc<dyn Transport>,
        service: impl Into<String>,
        events: Arc<EventDispatcher>,
    ) -> Self {
        let service = service.into();
        NotificationRouter::install(transport.as_ref(), &service, events.clone());
        Self {
            transport,
            service,
            events,
        }
    }

    pub fn from_config(
        transport: Arc<dyn Transport>,
        config: &PubSubConfig,
        events: Arc<EventDispatcher>,
    ) -> Self {
        match &config.service {
            Some(service) => Self::with_service(transport, service.clone(), events),
            None => Self::new(transport, events),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn events(&self) -> &Arc<EventDispatcher> {
        &self.events
    }

    pub fn jid(&self) -> &Jid {
        self.transport.jid()
    }

    /// Create `node`, optionally configured in the same request.
    pub async fn create_node(
        &self,
        node: &str,
        config: Option<&NodeOptions>,
    ) -> Result<(), ProtocolError> {
        let mut pubsub = Element::builder("pubsub", NS_PUBSUB)
            .append(Element::builder("create", NS_PUBSUB).attr("node", node).build());

        if let Some(options) = config {
            pubsub = pubsub.append(
                Element::builder("configure", NS_PUBSUB)
                    .append(options.to_form().to_element())
                    .build(),
            );
        }

        self.request(IqType::Set, pubsub.build()).await?;
        Ok(())
    }

    pub async fn delete_node(&self, node: &str) -> Result<(), ProtocolError> {
        let pubsub = Element::builder("pubsub", NS_PUBSUB_OWNER)
            .append(Element::builder("delete", NS_PUBSUB_OWNER).attr("node", node).build())
            .build();

        self.request(IqType::Set, pubsub).await?;
        Ok(())
    }

    /// The node's configuration form fields, in the order the service sent them.
    pub async fn get_node_config(&self, node: &str) -> Result<Vec<FormField>, ProtocolError> {
        let pubsub = Element::builder("pubsub", NS_PUBSUB_OWNER)
            .append(
                Element::builder("configure", NS_PUBSUB_OWNER)
                    .attr("node", node)
                    .build(),
            )
            .build();

        let response = self.request(IqType::Get, pubsub).await?;
        let form = response
            .get_child("pubsub", NS_PUBSUB_OWNER)
            .and_then(|pubsub| pubsub.get_child("configure", NS_PUBSUB_OWNER))
            .and_then(|configure| configure.get_child("x", NS_DATA_FORMS));

        match form {
            Some(form) => DataForm::from_element(form)
                .map(|form| form.fields)
                .map_err(|e| ProtocolError::MalformedResponse(e.to_string())),
            None => Ok(Vec::new()),
        }
    }

    /// Child nodes of `node`, or of the service root. Server order is kept.
    pub async fn discover_nodes(&self, node: Option<&str>) -> Result<Vec<String>, ProtocolError> {
        let mut query = Element::builder("query", NS_DISCO_ITEMS);
        if let Some(node) = node {
            query = query.attr("node", node);
        }

        let response = self.request(IqType::Get, query.build()).await?;
        let nodes = response
            .get_child("query", NS_DISCO_ITEMS)
            .map(|query| {
                query
                    .children()
                    .filter(|child| child.is("item", NS_DISCO_ITEMS))
                    .filter_map(|item| item.attr("node").map(String::from))
                    .collect()
            })
            .unwrap_or_default();

        Ok(nodes)
    }

    /// Publish `payload` and return the item id the service assigned.
    pub async fn publish(
        &self,
        node: &str,
        payload: Element,
        item_id: Option<&str>,
    ) -> Result<String, ProtocolError> {
        let item = PubSubItem::new(item_id.map(String::from), Some(payload));
        let pubsub = Element::builder("pubsub", NS_PUBSUB)
            .append(
                Element::builder("publish", NS_PUBSUB)
                    .attr("node", node)
                    .append(item.to_element(NS_PUBSUB))
                    .build(),
            )
            .build();

        let response = self.request(IqType::Set, pubsub).await?;
        let assigned = response
            .get_child("pubsub", NS_PUBSUB)
            .and_then(|pubsub| pubsub.get_child("publish", NS_PUBSUB))
            .and_then(|publish| publish.get_child("item", NS_PUBSUB))
            .and_then(|item| item.attr("id"))
            .map(String::from);

        assigned.or_else(|| item_id.map(String::from)).ok_or_else(|| {
            ProtocolError::MalformedResponse(format!("publish to {node} returned no item id"))
        })
    }

    /// Retract one item. `notify` defaults to on; `Some(false)` omits it.
    pub async fn retract(
        &self,
        node: &str,
        item_id: &str,
        notify: Option<bool>,
    ) -> Result<(), ProtocolError> {
        let mut retract = Element::builder("retract", NS_PUBSUB).attr("node", node);
        if notify.unwrap_or(true) {
            retract = retract.attr("notify", "true");
        }
        let pubsub = Element::builder("pubsub", NS_PUBSUB)
            .append(
                retract
                    .append(Element::builder("item", NS_PUBSUB).attr("id", item_id).build())
                    .build(),
            )
            .build();

        self.request(IqType::Set, pubsub).await?;
        Ok(())
    }

    /// Fetch items as raw `<item/>` elements, in server order.
    pub async fn fetch_items(
        &self,
        node: &str,
        query: &ItemQuery,
    ) -> Result<Vec<Element>, ProtocolError> {
        let mut items = Element::builder("items", NS_PUBSUB).attr("node", node);
        if let Some(max_items) = query.max_items.filter(|&max| max > 0) {
            items = items.attr("max_items", max_items.to_string());
        }
        for id in &query.item_ids {
            items = items.append(Element::builder("item", NS_PUBSUB).attr("id", id.as_str()).build());
        }
        let pubsub = Element::builder("pubsub", NS_PUBSUB).append(items.build()).build();

        let response = self.request(IqType::Get, pubsub).await?;
        let items = response
            .get_child("pubsub", NS_PUBSUB)
            .and_then(|pubsub| pubsub.get_child("items", NS_PUBSUB))
            .map(|items| {
                items
                    .children()
                    .filter(|child| child.is("item", NS_PUBSUB))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        Ok(items)
    }

    /// Subscribe the connection's bare JID to `node`.
    pub async fn subscribe(&self, node: &str) -> Result<Option<Subscription>, ProtocolError> {
        let jid = self.transport.jid().to_bare().to_string();
        let pubsub = Element::builder("pubsub", NS_PUBSUB)
            .append(
                Element::builder("subscribe", NS_PUBSUB)
                    .attr("node", node)
                    .attr("jid", jid)
                    .build(),
            )
            .build();

        let response = self.request(IqType::Set, pubsub).await?;
        response
            .get_child("pubsub", NS_PUBSUB)
            .and_then(|pubsub| pubsub.get_child("subscription", NS_PUBSUB))
            .map(|elem| {
                Subscription::from_element(elem).map(|mut subscription| {
                    if subscription.node.is_empty() {
                        subscription.node = node.to_string();
                    }
                    subscription
                })
            })
            .transpose()
    }

    pub async fn unsubscribe(&self, node: &str, subid: Option<&str>) -> Result<(), ProtocolError> {
        let jid = self.transport.jid().to_bare().to_string();
        let mut unsubscribe = Element::builder("unsubscribe", NS_PUBSUB)
            .attr("node", node)
            .attr("jid", jid);
        if let Some(subid) = subid {
            unsubscribe = unsubscribe.attr("subid", subid);
        }
        let pubsub = Element::builder("pubsub", NS_PUBSUB)
            .append(unsubscribe.build())
            .build();

        self.request(IqType::Set, pubsub).await?;
        Ok(())
    }

    /// Every subscription the service reports for this account.
    pub async fn get_subscriptions(&self) -> Result<Vec<Subscription>, ProtocolError> {
        let pubsub = Element::builder("pubsub", NS_PUBSUB)
            .append(Element::builder("subscriptions", NS_PUBSUB).build())
            .build();

        let response = self.request(IqType::Get, pubsub).await?;
        let Some(pubsub) = response.get_child("pubsub", NS_PUBSUB) else {
            return Ok(Vec::new());
        };
        let container = pubsub.get_child("subscriptions", NS_PUBSUB).unwrap_or(pubsub);

        container
            .children()
            .filter(|child| child.is("subscription", NS_PUBSUB))
            .map(Subscription::from_element)
            .collect()
    }

    async fn request(&self, iq_type: IqType, payload: Element) -> Result<Element, ProtocolError> {
        let id = self.transport.unique_id("pubsub");
        let action = payload
            .children()
            .next()
            .map(|child| child.name().to_string())
            .unwrap_or_else(|| payload.name().to_string());
        debug!(
            id = %id,
            service = %self.service,
            iq_type = iq_type.as_str(),
            action = %action,
            "sending pubsub request"
        );

        let iq = build_iq(iq_type, &id, &self.service, payload);
        let response = self.transport.send_request(iq).await?;

        match response.attr("type") {
            Some("result") => Ok(response),
            Some("error") => {
                let error = StanzaError::from_iq(&response);
                debug!(id = %id, condition = %error.condition, "pubsub request failed");
                Err(ProtocolError::Stanza(error))
            }
            other => Err(ProtocolError::MalformedResponse(format!(
                "unexpected iq type {other:?} in response to {id}"
            ))),
        }
    }
}

impl fmt::Debug for PubSubClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PubSubClient")
            .field("service", &self.service)
            .field("jid", &self.transport.jid().to_string())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_options_keep_insertion_order() {
        let mut options = NodeOptions::new()
            .with("pubsub#title", "Notes")
            .with("pubsub#max_items", "10");
        options.set("pubsub#title", "Journal");

        let collected: Vec<_> = options.iter().collect();
        assert_eq!(
            collected,
            vec![("pubsub#title", "Journal"), ("pubsub#max_items", "10")]
        );

        let form = options.to_form();
        assert_eq!(form.fields.len(), 3);
        assert_eq!(form.fields[0].var, "FORM_TYPE");
        assert_eq!(form.fields[0].value(), Some(NS_PUBSUB_NODE_CONFIG));
        assert_eq!(form.fields[1].var, "pubsub#title");
        assert_eq!(form.fields[2].value(), Some("10"));
    }

    #[test]
    fn parses_subscription_element() {
        let elem: Element = "<subscription xmlns='http://jabber.org/protocol/pubsub' \
                             node='princely_musings' jid='francisco@denmark.lit' \
                             subid='ba49252aaa4f5d320c24d3766f0bdcade78c78d3' \
                             subscription='subscribed'/>"
            .parse()
            .expect("valid XML");

        let subscription = Subscription::from_element(&elem).unwrap();

        assert_eq!(subscription.node, "princely_musings");
        assert_eq!(subscription.jid, "francisco@denmark.lit");
        assert_eq!(
            subscription.subid.as_deref(),
            Some("ba49252aaa4f5d320c24d3766f0bdcade78c78d3")
        );
        assert_eq!(subscription.state, SubscriptionState::Subscribed);
    }

    #[test]
    fn rejects_unknown_subscription_state() {
        let elem: Element = "<subscription xmlns='http://jabber.org/protocol/pubsub' \
                             node='n' jid='a@b.c' subscription='maybe'/>"
            .parse()
            .expect("valid XML");

        assert!(matches!(
            Subscription::from_element(&elem),
            Err(ProtocolError::MalformedResponse(_))
        ));
    }

    #[test]
    fn default_service_uses_jid_domain() {
        let jid: Jid = "alice@example.com/roost".parse().unwrap();
        assert_eq!(default_service(&jid), "pubsub.example.com");
    }

    #[test]
    fn item_query_constructors() {
        assert_eq!(ItemQuery::latest(5).max_items, Some(5));
        assert_eq!(ItemQuery::ids(["a", "b"]).item_ids, vec!["a", "b"]);
        assert_eq!(ItemQuery::default(), ItemQuery::ids(Vec::<String>::new()));
    }
}
