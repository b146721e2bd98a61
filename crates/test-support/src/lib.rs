use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use jid::Jid;
use minidom::Element;
use roost_xmpp::error::TransportError;
use roost_xmpp::transport::{HandlerTable, StanzaFilter, StanzaHandler, Transport};

pub type Responder = Box<dyn Fn(&Element) -> Option<Element> + Send + Sync>;

/// An in-memory [`Transport`] whose responses are scripted by the test.
///
/// Every request is recorded. A response is taken from the queue filled by
/// [`ScriptedTransport::push_response`], then from the responder closure,
/// and otherwise defaults to an empty `result` IQ. The response's `id` is
/// rewritten to match the request.
pub struct ScriptedTransport {
    jid: Jid,
    next_id: AtomicU64,
    requests: Mutex<Vec<Element>>,
    queued: Mutex<VecDeque<Result<Element, TransportError>>>,
    responder: Mutex<Option<Responder>>,
    handlers: Mutex<HandlerTable>,
}

impl ScriptedTransport {
    pub fn new(jid: &str) -> Arc<Self> {
        let jid: Jid = jid
            .parse()
            .unwrap_or_else(|error| panic!("invalid test jid {jid}: {error}"));
        Arc::new(Self {
            jid,
            next_id: AtomicU64::new(1),
            requests: Mutex::new(Vec::new()),
            queued: Mutex::new(VecDeque::new()),
            responder: Mutex::new(None),
            handlers: Mutex::new(HandlerTable::default()),
        })
    }

    pub fn push_response(&self, response: Element) {
        self.queued.lock().unwrap().push_back(Ok(response));
    }

    pub fn push_failure(&self, error: TransportError) {
        self.queued.lock().unwrap().push_back(Err(error));
    }

    pub fn respond_with<F>(&self, responder: F)
    where
        F: Fn(&Element) -> Option<Element> + Send + Sync + 'static,
    {
        *self.responder.lock().unwrap() = Some(Box::new(responder));
    }

    pub fn requests(&self) -> Vec<Element> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn last_request(&self) -> Option<Element> {
        self.requests.lock().unwrap().last().cloned()
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.lock().unwrap().len()
    }

    /// Hand `stanza` to every matching unsolicited handler, synchronously.
    pub fn deliver(&self, stanza: &Element) {
        let handlers = self.handlers.lock().unwrap().matching(stanza);

        for handler in handlers {
            handler(stanza);
        }
    }

    pub fn deliver_xml(&self, xml: &str) {
        self.deliver(&fixtures::parse(xml));
    }

    fn next_response(&self, request: &Element) -> Result<Element, TransportError> {
        if let Some(queued) = self.queued.lock().unwrap().pop_front() {
            return queued;
        }
        if let Some(responder) = self.responder.lock().unwrap().as_ref() {
            if let Some(response) = responder(request) {
                return Ok(response);
            }
        }
        Ok(fixtures::result_iq())
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn jid(&self) -> &Jid {
        &self.jid
    }

    fn unique_id(&self, suffix: &str) -> String {
        format!("{suffix}-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn send_request(&self, request: Element) -> Result<Element, TransportError> {
        self.requests.lock().unwrap().push(request.clone());
        let mut response = self.next_response(&request)?;
        if let Some(id) = request.attr("id") {
            response.set_attr("id", id);
        }
        Ok(response)
    }

    fn on_unsolicited(&self, key: &str, filter: StanzaFilter, handler: StanzaHandler) {
        self.handlers.lock().unwrap().insert(key, filter, handler);
    }
}

pub mod fixtures {
    use std::fs;
    use std::io;
    use std::path::{Path, PathBuf};

    use minidom::Element;

    const NS_CLIENT: &str = "jabber:client";
    const NS_PUBSUB: &str = "http://jabber.org/protocol/pubsub";
    const NS_PUBSUB_EVENT: &str = "http://jabber.org/protocol/pubsub#event";
    const NS_STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
    const NS_ATOM: &str = "http://www.w3.org/2005/Atom";

    pub fn root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("..")
            .join("..")
            .join("tests")
            .join("fixtures")
    }

    pub fn path(relative: impl AsRef<Path>) -> PathBuf {
        root().join(relative.as_ref())
    }

    pub fn read(relative: impl AsRef<Path>) -> io::Result<String> {
        fs::read_to_string(path(relative))
    }

    pub fn stanza(name: &str) -> String {
        read_or_panic(Path::new("stanzas").join(name))
    }

    /// A stanza fixture parsed into an element.
    pub fn stanza_element(name: &str) -> Element {
        parse(&stanza(name))
    }

    pub fn config(name: &str) -> String {
        read_or_panic(Path::new("config").join(name))
    }

    pub fn parse(xml: &str) -> Element {
        xml.trim()
            .parse()
            .unwrap_or_else(|error| panic!("invalid fixture XML: {error}\n{xml}"))
    }

    pub fn result_iq() -> Element {
        Element::builder("iq", NS_CLIENT)
            .attr("type", "result")
            .build()
    }

    pub fn error_iq(error_type: &str, condition: &str) -> Element {
        Element::builder("iq", NS_CLIENT)
            .attr("type", "error")
            .append(
                Element::builder("error", NS_CLIENT)
                    .attr("type", error_type)
                    .append(Element::builder(condition, NS_STANZAS).build())
                    .build(),
            )
            .build()
    }

    pub fn publish_result(node: &str, item_id: &str) -> Element {
        Element::builder("iq", NS_CLIENT)
            .attr("type", "result")
            .append(
                Element::builder("pubsub", NS_PUBSUB)
                    .append(
                        Element::builder("publish", NS_PUBSUB)
                            .attr("node", node)
                            .append(Element::builder("item", NS_PUBSUB).attr("id", item_id).build())
                            .build(),
                    )
                    .build(),
            )
            .build()
    }

    /// An items result carrying `(id, payload)` pairs in order.
    pub fn items_result(node: &str, items: Vec<(&str, Element)>) -> Element {
        let mut items_elem = Element::builder("items", NS_PUBSUB).attr("node", node);
        for (id, payload) in items {
            items_elem = items_elem.append(
                Element::builder("item", NS_PUBSUB)
                    .attr("id", id)
                    .append(payload)
                    .build(),
            );
        }

        Element::builder("iq", NS_CLIENT)
            .attr("type", "result")
            .append(
                Element::builder("pubsub", NS_PUBSUB)
                    .append(items_elem.build())
                    .build(),
            )
            .build()
    }

    /// `<entry xmlns='http://www.w3.org/2005/Atom'>{json}</entry>`.
    pub fn json_entry(json: &str) -> Element {
        Element::builder("entry", NS_ATOM).append(json).build()
    }

    /// A tag-per-field Atom entry.
    pub fn atom_entry(fields: &[(&str, &str)]) -> Element {
        let mut entry = Element::builder("entry", NS_ATOM);
        for (name, value) in fields {
            entry = entry.append(Element::builder(*name, NS_ATOM).append(*value).build());
        }
        entry.build()
    }

    pub fn item_published(from: &str, node: &str, id: &str, entry: Option<Element>) -> Element {
        let mut item = Element::builder("item", NS_PUBSUB_EVENT).attr("id", id);
        if let Some(entry) = entry {
            item = item.append(entry);
        }
        event_message(from, node, item.build(), None)
    }

    pub fn last_published_item(
        from: &str,
        node: &str,
        id: &str,
        entry: Option<Element>,
        stamp: &str,
    ) -> Element {
        let mut item = Element::builder("item", NS_PUBSUB_EVENT).attr("id", id);
        if let Some(entry) = entry {
            item = item.append(entry);
        }
        event_message(from, node, item.build(), Some(stamp))
    }

    pub fn item_retracted(from: &str, node: &str, id: &str) -> Element {
        let retract = Element::builder("retract", NS_PUBSUB_EVENT)
            .attr("id", id)
            .build();
        event_message(from, node, retract, None)
    }

    fn event_message(from: &str, node: &str, child: Element, stamp: Option<&str>) -> Element {
        let mut message = Element::builder("message", NS_CLIENT)
            .attr("from", from)
            .append(
                Element::builder("event", NS_PUBSUB_EVENT)
                    .append(
                        Element::builder("items", NS_PUBSUB_EVENT)
                            .attr("node", node)
                            .append(child)
                            .build(),
                    )
                    .build(),
            );
        if let Some(stamp) = stamp {
            message = message.append(
                Element::builder("delay", "urn:xmpp:delay")
                    .attr("stamp", stamp)
                    .build(),
            );
        }
        message.build()
    }

    fn read_or_panic(relative: impl AsRef<Path>) -> String {
        let relative = relative.as_ref();
        read(relative).unwrap_or_else(|error| {
            panic!(
                "failed to read fixture {}: {error}",
                relative.to_string_lossy()
            )
        })
    }
}
