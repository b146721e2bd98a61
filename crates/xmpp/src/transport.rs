use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use jid::Jid;
use minidom::Element;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::TransportError;
use crate::stanza::{parse_element, serialize_element};

pub type StanzaSender = mpsc::Sender<Vec<u8>>;

pub type StanzaReceiver = mpsc::Receiver<Vec<u8>>;

pub fn stanza_channel(buffer: usize) -> (StanzaSender, StanzaReceiver) {
    mpsc::channel(buffer)
}

pub type StanzaHandler = Arc<dyn Fn(&Element) + Send + Sync>;

/// Selects unsolicited stanzas by element name and sender.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StanzaFilter {
    pub name: Option<String>,
    /// Matches the bare or full `from` address.
    pub from: Option<String>,
}

impl StanzaFilter {
    pub fn messages_from(from: impl Into<String>) -> Self {
        Self {
            name: Some("message".to_string()),
            from: Some(from.into()),
        }
    }

    pub fn matches(&self, stanza: &Element) -> bool {
        if let Some(name) = &self.name {
            if stanza.name() != name {
                return false;
            }
        }

        match &self.from {
            None => true,
            Some(expected) => match stanza.attr("from") {
                Some(from) => from == expected || from.split('/').next() == Some(expected),
                None => false,
            },
        }
    }
}

/// Unsolicited-stanza handlers, each registered under a key.
///
/// Registering under a key that is already present replaces that handler in
/// place, so installing the same route twice delivers each stanza once.
#[derive(Clone, Default)]
pub struct HandlerTable {
    entries: Vec<(String, StanzaFilter, StanzaHandler)>,
}

impl HandlerTable {
    /// Returns `true` if an existing handler was replaced.
    pub fn insert(&mut self, key: &str, filter: StanzaFilter, handler: StanzaHandler) -> bool {
        if let Some(entry) = self.entries.iter_mut().find(|(k, _, _)| k == key) {
            entry.1 = filter;
            entry.2 = handler;
            return true;
        }
        self.entries.push((key.to_string(), filter, handler));
        false
    }

    /// The handlers whose filter matches `stanza`, in registration order.
    pub fn matching(&self, stanza: &Element) -> Vec<StanzaHandler> {
        self.entries
            .iter()
            .filter(|(_, filter, _)| filter.matches(stanza))
            .map(|(_, _, handler)| handler.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The stanza transport the PubSub layer runs on.
///
/// Connection lifecycle, authentication and stream encryption live behind this
/// trait. Implementations correlate IQ responses to requests by id and own the
/// single delivery loop for inbound stanzas.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// The connection's own address.
    fn jid(&self) -> &Jid;

    /// A connection-scoped unique stanza id.
    fn unique_id(&self, suffix: &str) -> String;

    /// Send an IQ request and wait for the matching `result` or `error` IQ.
    ///
    /// Both response types resolve `Ok`; interpreting an error IQ is up to the
    /// caller. There is no timeout.
    async fn send_request(&self, request: Element) -> Result<Element, TransportError>;

    /// Register a permanent handler under `key` for inbound stanzas matching
    /// `filter`. A later registration under the same key replaces it.
    fn on_unsolicited(&self, key: &str, filter: StanzaFilter, handler: StanzaHandler);
}

/// A [`Transport`] over a pair of byte channels.
///
/// Outbound stanzas are serialized onto `outbound`; inbound bytes are fed in
/// through [`WireTransport::run`] or [`WireTransport::handle_inbound`].
pub struct WireTransport {
    jid: Jid,
    outbound: StanzaSender,
    pending: Mutex<HashMap<String, oneshot::Sender<Element>>>,
    handlers: RwLock<HandlerTable>,
}

impl WireTransport {
    pub fn new(jid: Jid, outbound: StanzaSender) -> Self {
        Self {
            jid,
            outbound,
            pending: Mutex::new(HashMap::new()),
            handlers: RwLock::new(HandlerTable::default()),
        }
    }

    /// Drain `inbound` until it closes, delivering each stanza in order.
    ///
    /// Requests still pending when the channel closes fail with
    /// [`TransportError::RequestDropped`].
    pub async fn run(&self, mut inbound: StanzaReceiver) {
        while let Some(raw) = inbound.recv().await {
            if let Err(error) = self.handle_inbound(&raw) {
                warn!(error = %error, "dropping unparseable inbound stanza");
            }
        }

        debug!("inbound stanza channel closed, failing pending requests");
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn handle_inbound(&self, raw: &[u8]) -> Result<(), TransportError> {
        let stanza = parse_element(raw)?;
        self.deliver(stanza);
        Ok(())
    }

    /// Resolve a pending request or hand the stanza to matching handlers.
    pub fn deliver(&self, stanza: Element) {
        if let Some(waiter) = self.take_pending(&stanza) {
            if waiter.send(stanza).is_err() {
                trace!("response arrived after its requester went away");
            }
            return;
        }

        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .matching(&stanza);

        if handlers.is_empty() {
            trace!(name = stanza.name(), "no handler for unsolicited stanza");
        }

        for handler in handlers {
            handler(&stanza);
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn take_pending(&self, stanza: &Element) -> Option<oneshot::Sender<Element>> {
        if stanza.name() != "iq" || !matches!(stanza.attr("type"), Some("result" | "error")) {
            return None;
        }
        let id = stanza.attr("id")?;
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }
}

#[async_trait]
impl Transport for WireTransport {
    fn jid(&self) -> &Jid {
        &self.jid
    }

    fn unique_id(&self, suffix: &str) -> String {
        format!("{suffix}-{}", Uuid::new_v4().simple())
    }

    async fn send_request(&self, request: Element) -> Result<Element, TransportError> {
        let id = request
            .attr("id")
            .ok_or_else(|| TransportError::Send("request stanza has no id".to_string()))?
            .to_string();
        let payload = serialize_element(&request)?;

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), tx);

        if self.outbound.send(payload).await.is_err() {
            self.pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
            return Err(TransportError::Closed);
        }

        debug!(id = %id, "request sent");
        rx.await.map_err(|_| TransportError::RequestDropped(id))
    }

    fn on_unsolicited(&self, key: &str, filter: StanzaFilter, handler: StanzaHandler) {
        let replaced = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, filter, handler);
        if replaced {
            debug!(key, "replaced unsolicited stanza handler");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::stanza::{IqType, NS_PUBSUB, build_iq};

    fn transport() -> (Arc<WireTransport>, StanzaReceiver) {
        let (tx, rx) = stanza_channel(16);
        let jid: Jid = "alice@example.com/roost".parse().expect("valid jid");
        (Arc::new(WireTransport::new(jid, tx)), rx)
    }

    fn request(id: &str) -> Element {
        build_iq(
            IqType::Get,
            id,
            "pubsub.example.com",
            Element::builder("pubsub", NS_PUBSUB).build(),
        )
    }

    #[test]
    fn filter_matches_name_and_bare_sender() {
        let filter = StanzaFilter::messages_from("pubsub.example.com");
        let message: Element = "<message xmlns='jabber:client' from='pubsub.example.com'/>"
            .parse()
            .unwrap();
        let resource: Element = "<message xmlns='jabber:client' from='pubsub.example.com/x'/>"
            .parse()
            .unwrap();
        let other: Element = "<message xmlns='jabber:client' from='other.example.com'/>"
            .parse()
            .unwrap();
        let presence: Element = "<presence xmlns='jabber:client' from='pubsub.example.com'/>"
            .parse()
            .unwrap();

        assert!(filter.matches(&message));
        assert!(filter.matches(&resource));
        assert!(!filter.matches(&other));
        assert!(!filter.matches(&presence));
    }

    #[test]
    fn unique_ids_carry_suffix_and_differ() {
        let (transport, _rx) = transport();
        let a = transport.unique_id("pubsub");
        let b = transport.unique_id("pubsub");

        assert!(a.starts_with("pubsub-"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn response_resolves_matching_request() {
        let (transport, mut rx) = transport();
        let sender = transport.clone();
        let pending = tokio::spawn(async move { sender.send_request(request("pubsub-1")).await });

        let wire = rx.recv().await.expect("request on the wire");
        let sent = parse_element(&wire).unwrap();
        assert_eq!(sent.attr("id"), Some("pubsub-1"));

        transport
            .handle_inbound(b"<iq xmlns='jabber:client' type='result' id='pubsub-1'/>")
            .unwrap();

        let response = pending.await.unwrap().unwrap();
        assert_eq!(response.attr("type"), Some("result"));
        assert_eq!(transport.pending_count(), 0);
    }

    #[tokio::test]
    async fn error_iq_resolves_ok() {
        let (transport, mut rx) = transport();
        let sender = transport.clone();
        let pending = tokio::spawn(async move { sender.send_request(request("pubsub-2")).await });
        rx.recv().await.unwrap();

        transport
            .handle_inbound(b"<iq xmlns='jabber:client' type='error' id='pubsub-2'/>")
            .unwrap();

        let response = pending.await.unwrap().unwrap();
        assert_eq!(response.attr("type"), Some("error"));
    }

    #[tokio::test]
    async fn closed_outbound_channel_fails_request() {
        let (transport, rx) = transport();
        drop(rx);

        let result = transport.send_request(request("pubsub-3")).await;

        assert_eq!(result, Err(TransportError::Closed));
        assert_eq!(transport.pending_count(), 0);
    }

    #[tokio::test]
    async fn request_without_id_is_rejected() {
        let (transport, _rx) = transport();
        let iq = Element::builder("iq", "jabber:client").attr("type", "get").build();

        let result = transport.send_request(iq).await;

        assert!(matches!(result, Err(TransportError::Send(_))));
    }

    #[tokio::test]
    async fn closing_inbound_drops_pending_requests() {
        let (transport, mut out_rx) = transport();
        let (in_tx, in_rx) = stanza_channel(4);
        let sender = transport.clone();
        let pending = tokio::spawn(async move { sender.send_request(request("pubsub-4")).await });
        out_rx.recv().await.unwrap();

        drop(in_tx);
        transport.run(in_rx).await;

        let result = pending.await.unwrap();
        assert_eq!(
            result,
            Err(TransportError::RequestDropped("pubsub-4".to_string()))
        );
    }

    #[test]
    fn unsolicited_stanzas_reach_matching_handlers() {
        let (transport, _rx) = transport();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        transport.on_unsolicited(
            "counter",
            StanzaFilter::messages_from("pubsub.example.com"),
            Arc::new(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        );

        transport
            .handle_inbound(b"<message xmlns='jabber:client' from='pubsub.example.com'/>")
            .unwrap();
        transport
            .handle_inbound(b"<message xmlns='jabber:client' from='elsewhere.example.com'/>")
            .unwrap();
        // An unmatched result IQ is unsolicited too, but not a message.
        transport
            .handle_inbound(b"<iq xmlns='jabber:client' type='result' id='unknown'/>")
            .unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn same_key_replaces_handler() {
        let (transport, _rx) = transport();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let seen = count.clone();
            transport.on_unsolicited(
                "route",
                StanzaFilter::messages_from("pubsub.example.com"),
                Arc::new(move |_| {
                    seen.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }

        transport
            .handle_inbound(b"<message xmlns='jabber:client' from='pubsub.example.com'/>")
            .unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
