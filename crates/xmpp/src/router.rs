//! Classification of PubSub push notifications.
//!
//! A push is a `<message/>` from the service carrying
//! `event/items/item` (published) or `event/items/retract` (deleted). A
//! `urn:xmpp:delay` stamp on the message marks the items as a replay of the
//! node's last published item.

use std::sync::Arc;

use minidom::Element;
use roost_core::event::{EventDispatcher, PubSubEvent};
use tracing::{debug, warn};

use crate::stanza::{NS_DELAY, NS_PUBSUB_EVENT};
use crate::transport::{StanzaFilter, Transport};

pub struct NotificationRouter;

impl NotificationRouter {
    /// Route pushes from `service` to `events` for the life of the transport.
    ///
    /// Installing again for the same service and dispatcher replaces the
    /// earlier route, so each push is emitted once.
    pub fn install(transport: &dyn Transport, service: &str, events: Arc<EventDispatcher>) {
        let key = format!("pubsub-router/{service}/{:p}", Arc::as_ptr(&events));
        debug!(service, key, "installing pubsub notification router");
        transport.on_unsolicited(
            &key,
            StanzaFilter::messages_from(service),
            Arc::new(move |stanza: &Element| Self::route(&events, stanza)),
        );
    }

    /// Classify `stanza` and emit each resulting event.
    pub fn route(events: &EventDispatcher, stanza: &Element) {
        for event in Self::classify(stanza) {
            debug!(
                kind = %event.kind(),
                node = event.node(),
                id = event.item_id(),
                "pubsub notification"
            );
            events.emit(&event);
        }
    }

    /// Published and replayed items come first, then retractions.
    pub fn classify(stanza: &Element) -> Vec<PubSubEvent> {
        let Some(event) = stanza.get_child("event", NS_PUBSUB_EVENT) else {
            return Vec::new();
        };
        let stamp = stanza
            .get_child("delay", NS_DELAY)
            .and_then(|delay| delay.attr("stamp"));

        let mut published = Vec::new();
        let mut deleted = Vec::new();

        for items in event.children().filter(|c| c.is("items", NS_PUBSUB_EVENT)) {
            let Some(node) = items.attr("node") else {
                warn!("dropping pubsub items without a node");
                continue;
            };

            for child in items.children() {
                let kind = child.name();
                if child.ns() != NS_PUBSUB_EVENT || !matches!(kind, "item" | "retract") {
                    continue;
                }
                let Some(id) = child.attr("id") else {
                    warn!(node, kind, "dropping pubsub element without an id");
                    continue;
                };

                if kind == "retract" {
                    deleted.push(PubSubEvent::ItemDeleted {
                        node: node.to_string(),
                        id: id.to_string(),
                    });
                    continue;
                }

                let entry = child.children().next().cloned();
                published.push(match stamp {
                    Some(timestamp) => PubSubEvent::LastPublishedItem {
                        node: node.to_string(),
                        id: id.to_string(),
                        entry,
                        timestamp: timestamp.to_string(),
                    },
                    None => PubSubEvent::ItemPublished {
                        node: node.to_string(),
                        id: id.to_string(),
                        entry,
                    },
                });
            }
        }

        published.extend(deleted);
        published
    }
}
