use std::sync::{Arc, Mutex};

use assert_matches::assert_matches;
use minidom::Element;
use roost_core::event::{EventDispatcher, EventKind, PubSubEvent};
use roost_test_support::{ScriptedTransport, fixtures};
use roost_xmpp::error::{ProtocolError, TransportError};
use roost_xmpp::forms::FieldType;
use roost_xmpp::pubsub::{ItemQuery, NodeOptions, PubSubClient, SubscriptionState};
use roost_xmpp::stanza::{
    NS_DATA_FORMS, NS_DISCO_ITEMS, NS_PUBSUB, NS_PUBSUB_NODE_CONFIG, NS_PUBSUB_OWNER,
};

const SERVICE: &str = "pubsub.example.com";

fn client() -> (Arc<ScriptedTransport>, PubSubClient) {
    let transport = ScriptedTransport::new("alice@example.com/roost");
    let client = PubSubClient::new(transport.clone(), Arc::new(EventDispatcher::default()));
    (transport, client)
}

fn pubsub_child<'a>(request: &'a Element, ns: &str) -> &'a Element {
    request
        .get_child("pubsub", ns)
        .expect("request carries a pubsub element")
}

#[tokio::test]
async fn requests_are_addressed_to_default_service() {
    let (transport, client) = client();
    assert_eq!(client.service(), SERVICE);

    client.delete_node("anode").await.unwrap();

    let request = transport.last_request().unwrap();
    assert_eq!(request.attr("to"), Some(SERVICE));
    assert_eq!(request.attr("type"), Some("set"));
    assert_eq!(request.attr("id"), Some("pubsub-1"));
}

#[tokio::test]
async fn configured_service_overrides_default() {
    let transport = ScriptedTransport::new("alice@example.com");
    let config = roost_core::config::PubSubConfig {
        service: Some("notes.example.org".to_string()),
        ..Default::default()
    };
    let client =
        PubSubClient::from_config(transport.clone(), &config, Arc::new(EventDispatcher::default()));

    client.delete_node("anode").await.unwrap();

    assert_eq!(client.service(), "notes.example.org");
    assert_eq!(transport.last_request().unwrap().attr("to"), Some("notes.example.org"));
}

#[tokio::test]
async fn create_node_without_config_sends_create_only() {
    let (transport, client) = client();

    client.create_node("anode", None).await.unwrap();

    let request = transport.last_request().unwrap();
    let pubsub = pubsub_child(&request, NS_PUBSUB);
    let create = pubsub.get_child("create", NS_PUBSUB).unwrap();
    assert_eq!(create.attr("node"), Some("anode"));
    assert!(pubsub.get_child("configure", NS_PUBSUB).is_none());
}

#[tokio::test]
async fn create_node_with_config_sends_submit_form() {
    let (transport, client) = client();
    let options = NodeOptions::new()
        .with("pubsub#title", "Notes")
        .with("pubsub#max_items", "20");

    client.create_node("anode", Some(&options)).await.unwrap();

    let request = transport.last_request().unwrap();
    let form = pubsub_child(&request, NS_PUBSUB)
        .get_child("configure", NS_PUBSUB)
        .and_then(|configure| configure.get_child("x", NS_DATA_FORMS))
        .expect("configure form");
    assert_eq!(form.attr("type"), Some("submit"));

    let fields: Vec<(Option<&str>, String)> = form
        .children()
        .map(|field| {
            (
                field.attr("var"),
                field
                    .get_child("value", NS_DATA_FORMS)
                    .map(|v| v.text())
                    .unwrap_or_default(),
            )
        })
        .collect();
    assert_eq!(
        fields,
        vec![
            (Some("FORM_TYPE"), NS_PUBSUB_NODE_CONFIG.to_string()),
            (Some("pubsub#title"), "Notes".to_string()),
            (Some("pubsub#max_items"), "20".to_string()),
        ]
    );
    let form_type = form.children().next().unwrap();
    assert_eq!(form_type.attr("type"), Some("hidden"));
}

#[tokio::test]
async fn delete_node_uses_owner_namespace() {
    let (transport, client) = client();

    client.delete_node("anode").await.unwrap();

    let request = transport.last_request().unwrap();
    let delete = pubsub_child(&request, NS_PUBSUB_OWNER)
        .get_child("delete", NS_PUBSUB_OWNER)
        .unwrap();
    assert_eq!(delete.attr("node"), Some("anode"));
}

#[tokio::test]
async fn get_node_config_parses_fields_in_order() {
    let (transport, client) = client();
    transport.push_response(fixtures::stanza_element("node-config-result.xml"));

    let fields = client.get_node_config("princely_musings").await.unwrap();

    let request = transport.last_request().unwrap();
    assert_eq!(request.attr("type"), Some("get"));
    let configure = pubsub_child(&request, NS_PUBSUB_OWNER)
        .get_child("configure", NS_PUBSUB_OWNER)
        .unwrap();
    assert_eq!(configure.attr("node"), Some("princely_musings"));

    let vars: Vec<&str> = fields.iter().map(|f| f.var.as_str()).collect();
    assert_eq!(
        vars,
        vec![
            "FORM_TYPE",
            "pubsub#title",
            "pubsub#deliver_notifications",
            "pubsub#access_model"
        ]
    );

    let title = &fields[1];
    assert_eq!(title.field_type, FieldType::TextSingle);
    assert_eq!(title.label.as_deref(), Some("A friendly name for the node"));
    assert!(title.desc.is_none());
    assert!(!title.required);
    assert_eq!(title.values, vec!["Princely Musings (Atom)"]);

    assert_eq!(fields[2].field_type, FieldType::Boolean);
    assert!(fields[2].required);

    let access = &fields[3];
    assert_eq!(access.field_type, FieldType::ListSingle);
    assert_eq!(access.desc.as_deref(), Some("Who may subscribe and retrieve items"));
    assert_eq!(access.options.len(), 2);
    assert_eq!(access.options[1].label.as_deref(), Some("Open"));
    assert_eq!(access.values, vec!["open"]);
}

#[tokio::test]
async fn discover_nodes_keeps_server_order_and_duplicates() {
    let (transport, client) = client();
    transport.push_response(fixtures::stanza_element("disco-items-result.xml"));

    let nodes = client.discover_nodes(None).await.unwrap();

    assert_eq!(nodes, vec!["blogs", "news", "blogs"]);
    let request = transport.last_request().unwrap();
    let query = request.get_child("query", NS_DISCO_ITEMS).unwrap();
    assert!(query.attr("node").is_none());
}

#[tokio::test]
async fn discover_nodes_of_collection_sets_node() {
    let (transport, client) = client();

    let nodes = client.discover_nodes(Some("blogs")).await.unwrap();

    assert!(nodes.is_empty());
    let request = transport.last_request().unwrap();
    let query = request.get_child("query", NS_DISCO_ITEMS).unwrap();
    assert_eq!(query.attr("node"), Some("blogs"));
}

#[tokio::test]
async fn publish_returns_assigned_id() {
    let (transport, client) = client();
    transport.push_response(fixtures::publish_result("anode", "server-assigned"));
    let payload = fixtures::json_entry(r#"{"title":"An entry"}"#);

    let id = client.publish("anode", payload.clone(), None).await.unwrap();

    assert_eq!(id, "server-assigned");
    let request = transport.last_request().unwrap();
    let publish = pubsub_child(&request, NS_PUBSUB)
        .get_child("publish", NS_PUBSUB)
        .unwrap();
    assert_eq!(publish.attr("node"), Some("anode"));
    let item = publish.get_child("item", NS_PUBSUB).unwrap();
    assert!(item.attr("id").is_none());
    assert_eq!(item.children().next(), Some(&payload));
}

#[tokio::test]
async fn publish_falls_back_to_supplied_id() {
    let (transport, client) = client();

    let id = client
        .publish("anode", fixtures::json_entry("{}"), Some("item_id"))
        .await
        .unwrap();

    assert_eq!(id, "item_id");
    let request = transport.last_request().unwrap();
    let item = pubsub_child(&request, NS_PUBSUB)
        .get_child("publish", NS_PUBSUB)
        .and_then(|publish| publish.get_child("item", NS_PUBSUB))
        .unwrap();
    assert_eq!(item.attr("id"), Some("item_id"));
}

#[tokio::test]
async fn publish_without_any_id_is_malformed() {
    let (_transport, client) = client();

    let result = client.publish("anode", fixtures::json_entry("{}"), None).await;

    assert_matches!(result, Err(ProtocolError::MalformedResponse(_)));
}

#[tokio::test]
async fn retract_notify_is_three_state() {
    let (transport, client) = client();

    client.retract("anode", "item_id", None).await.unwrap();
    client.retract("anode", "item_id", Some(true)).await.unwrap();
    client.retract("anode", "item_id", Some(false)).await.unwrap();

    let notify: Vec<Option<String>> = transport
        .requests()
        .iter()
        .map(|request| {
            let retract = pubsub_child(request, NS_PUBSUB)
                .get_child("retract", NS_PUBSUB)
                .unwrap();
            assert_eq!(retract.attr("node"), Some("anode"));
            assert_eq!(
                retract.get_child("item", NS_PUBSUB).and_then(|i| i.attr("id")),
                Some("item_id")
            );
            retract.attr("notify").map(String::from)
        })
        .collect();

    assert_eq!(
        notify,
        vec![Some("true".to_string()), Some("true".to_string()), None]
    );
}

#[tokio::test]
async fn fetch_items_by_id_and_max() {
    let (transport, client) = client();
    transport.push_response(fixtures::items_result(
        "anode",
        vec![
            ("b", fixtures::json_entry(r#"{"n":2}"#)),
            ("a", fixtures::json_entry(r#"{"n":1}"#)),
        ],
    ));

    let items = client
        .fetch_items(
            "anode",
            &ItemQuery {
                max_items: Some(5),
                item_ids: vec!["a".to_string(), "b".to_string()],
            },
        )
        .await
        .unwrap();

    let ids: Vec<_> = items.iter().map(|item| item.attr("id").unwrap()).collect();
    assert_eq!(ids, vec!["b", "a"]);

    let request = transport.last_request().unwrap();
    assert_eq!(request.attr("type"), Some("get"));
    let items_req = pubsub_child(&request, NS_PUBSUB)
        .get_child("items", NS_PUBSUB)
        .unwrap();
    assert_eq!(items_req.attr("node"), Some("anode"));
    assert_eq!(items_req.attr("max_items"), Some("5"));
    let requested: Vec<_> = items_req.children().map(|c| c.attr("id").unwrap()).collect();
    assert_eq!(requested, vec!["a", "b"]);
}

#[tokio::test]
async fn fetch_items_without_options_sends_bare_items() {
    let (transport, client) = client();

    let items = client.fetch_items("anode", &ItemQuery::default()).await.unwrap();

    assert!(items.is_empty());
    let request = transport.last_request().unwrap();
    let items_req = pubsub_child(&request, NS_PUBSUB)
        .get_child("items", NS_PUBSUB)
        .unwrap();
    assert!(items_req.attr("max_items").is_none());
    assert_eq!(items_req.children().count(), 0);
}

#[tokio::test]
async fn fetch_items_omits_zero_max_items() {
    let (transport, client) = client();

    client.fetch_items("anode", &ItemQuery::latest(0)).await.unwrap();

    let request = transport.last_request().unwrap();
    let items_req = pubsub_child(&request, NS_PUBSUB)
        .get_child("items", NS_PUBSUB)
        .unwrap();
    assert_eq!(items_req.attr("node"), Some("anode"));
    assert!(items_req.attr("max_items").is_none());
}

#[tokio::test]
async fn subscribe_uses_bare_jid() {
    let (transport, client) = client();
    transport.push_response(fixtures::parse(
        "<iq xmlns='jabber:client' type='result'>\
           <pubsub xmlns='http://jabber.org/protocol/pubsub'>\
             <subscription jid='alice@example.com' subid='sub-1' subscription='subscribed'/>\
           </pubsub>\
         </iq>",
    ));

    let subscription = client.subscribe("anode").await.unwrap().unwrap();

    assert_eq!(subscription.node, "anode");
    assert_eq!(subscription.subid.as_deref(), Some("sub-1"));
    assert_eq!(subscription.state, SubscriptionState::Subscribed);

    let request = transport.last_request().unwrap();
    let subscribe = pubsub_child(&request, NS_PUBSUB)
        .get_child("subscribe", NS_PUBSUB)
        .unwrap();
    assert_eq!(subscribe.attr("node"), Some("anode"));
    assert_eq!(subscribe.attr("jid"), Some("alice@example.com"));
}

#[tokio::test]
async fn subscribe_with_empty_result_has_no_subscription() {
    let (_transport, client) = client();
    assert_eq!(client.subscribe("anode").await.unwrap(), None);
}

#[tokio::test]
async fn unsubscribe_sends_subid_only_when_given() {
    let (transport, client) = client();

    client.unsubscribe("anode", None).await.unwrap();
    client.unsubscribe("anode", Some("sub-1")).await.unwrap();

    let subids: Vec<Option<String>> = transport
        .requests()
        .iter()
        .map(|request| {
            let unsubscribe = pubsub_child(request, NS_PUBSUB)
                .get_child("unsubscribe", NS_PUBSUB)
                .unwrap();
            assert_eq!(unsubscribe.attr("jid"), Some("alice@example.com"));
            unsubscribe.attr("subid").map(String::from)
        })
        .collect();

    assert_eq!(subids, vec![None, Some("sub-1".to_string())]);
}

#[tokio::test]
async fn get_subscriptions_lists_everything() {
    let (transport, client) = client();
    transport.push_response(fixtures::stanza_element("subscriptions-result.xml"));

    let subscriptions = client.get_subscriptions().await.unwrap();

    let summary: Vec<(&str, SubscriptionState, Option<&str>)> = subscriptions
        .iter()
        .map(|s| (s.node.as_str(), s.state, s.subid.as_deref()))
        .collect();
    assert_eq!(
        summary,
        vec![
            ("node1", SubscriptionState::Subscribed, None),
            ("node2", SubscriptionState::Subscribed, Some("123-abc")),
            ("node5", SubscriptionState::Unconfigured, None),
            ("node6", SubscriptionState::Pending, None),
        ]
    );
    let request = transport.last_request().unwrap();
    assert!(
        pubsub_child(&request, NS_PUBSUB)
            .get_child("subscriptions", NS_PUBSUB)
            .is_some()
    );
}

#[tokio::test]
async fn get_subscriptions_accepts_flat_reply() {
    let (transport, client) = client();
    transport.push_response(fixtures::parse(
        "<iq xmlns='jabber:client' type='result'>\
           <pubsub xmlns='http://jabber.org/protocol/pubsub'>\
             <subscription node='anode' jid='alice@example.com' subscription='none'/>\
           </pubsub>\
         </iq>",
    ));

    let subscriptions = client.get_subscriptions().await.unwrap();

    assert_eq!(subscriptions.len(), 1);
    assert_eq!(subscriptions[0].state, SubscriptionState::None);
}

#[tokio::test]
async fn stanza_errors_pass_through_unmodified() {
    let (transport, client) = client();
    transport.push_response(fixtures::error_iq("cancel", "item-not-found"));

    let error = client.delete_node("missing").await.unwrap_err();

    assert_eq!(error.condition(), Some("item-not-found"));
    match error {
        ProtocolError::Stanza(stanza) => {
            assert_eq!(stanza.error_type, "cancel");
            assert!(
                stanza
                    .element
                    .get_child("item-not-found", "urn:ietf:params:xml:ns:xmpp-stanzas")
                    .is_some()
            );
        }
        other => panic!("expected stanza error, got {other:?}"),
    }
}

#[tokio::test]
async fn transport_failures_surface_as_protocol_errors() {
    let (transport, client) = client();
    transport.push_failure(TransportError::Closed);

    let result = client.subscribe("anode").await;

    assert_matches!(result, Err(ProtocolError::Transport(TransportError::Closed)));
}

#[tokio::test]
async fn constructing_client_routes_pushes_from_service() {
    let transport = ScriptedTransport::new("alice@example.com");
    let events = Arc::new(EventDispatcher::default());
    let client = PubSubClient::new(transport.clone(), events.clone());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    client.events().on(EventKind::LastPublishedItem, move |event| {
        sink.lock().unwrap().push(event.clone());
    });

    transport.deliver(&fixtures::stanza_element("last-published-item.xml"));
    transport.deliver(&fixtures::item_published("elsewhere.example.com", "anode", "x", None));

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_matches!(
        &seen[0],
        PubSubEvent::LastPublishedItem { node, id, timestamp, entry: Some(_) }
            if node == "anode"
                && id == "ae890ac52d0df67ed7cfdf51b644e901"
                && timestamp == "2003-12-13T23:58:37Z"
    );
    assert_eq!(transport.handler_count(), 1);
}

#[tokio::test]
async fn clients_sharing_a_dispatcher_route_each_push_once() {
    let transport = ScriptedTransport::new("alice@example.com");
    let events = Arc::new(EventDispatcher::default());
    let first = PubSubClient::new(transport.clone(), events.clone());
    let _second = PubSubClient::new(transport.clone(), events.clone());
    let count = Arc::new(Mutex::new(0));
    let sink = count.clone();
    first.events().on(EventKind::ItemPublished, move |_| {
        *sink.lock().unwrap() += 1;
    });

    transport.deliver(&fixtures::item_published(SERVICE, "anode", "x", None));

    assert_eq!(*count.lock().unwrap(), 1);
    assert_eq!(transport.handler_count(), 1);
}

#[tokio::test]
async fn clients_with_separate_dispatchers_each_see_pushes() {
    let transport = ScriptedTransport::new("alice@example.com");
    let seen = Arc::new(Mutex::new(0));
    let clients: Vec<_> = (0..2)
        .map(|_| PubSubClient::new(transport.clone(), Arc::new(EventDispatcher::default())))
        .collect();
    for client in &clients {
        let sink = seen.clone();
        client.events().on(EventKind::ItemPublished, move |_| {
            *sink.lock().unwrap() += 1;
        });
    }

    transport.deliver(&fixtures::item_published(SERVICE, "anode", "x", None));

    assert_eq!(*seen.lock().unwrap(), 2);
    assert_eq!(transport.handler_count(), 2);
}
