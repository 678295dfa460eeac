//! Link handlers over in-memory links

mod common;

use std::{
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use common::*;
use edgehub_amqp::{
    connection::{ConnectionContext, DeviceCapability},
    constants::{LOCK_TOKEN, METHOD_NAME, METHOD_STATUS, TWIN_OPERATION},
    error::LinkError,
    link::{
        AttachedLink, DeliveryOutcome, LinkHandler, LinkHandlerProvider, LinkState, LinkType,
    },
    message::{AmqpMessage, DirectMethodRequest, FeedbackStatus, InternalMessage, SystemProperty},
};
use fe2o3_amqp_types::{
    definitions::{self, AmqpError, ErrorCondition},
    messaging::{
        annotations::OwnedKey, ApplicationProperties, Body, Data, Message, MessageAnnotations,
    },
    primitives::{Binary, SimpleValue, Symbol, Value},
};
use uuid::Uuid;

async fn open_receiving(
    context: &Arc<ConnectionContext>,
    name: &str,
    address: &str,
) -> (Arc<LinkHandler>, PeerSender) {
    let (link, peer) = receiving_link(name);
    let handler = LinkHandlerProvider::default()
        .create(AttachedLink::Receiving(link), address, context.clone())
        .await
        .unwrap();
    handler.open(TIMEOUT).await.unwrap();
    let runner = handler.clone();
    tokio::spawn(async move { runner.run().await });
    (handler, peer)
}

async fn open_sending(
    context: &Arc<ConnectionContext>,
    name: &str,
    address: &str,
    outcome: DeliveryOutcome,
) -> (Arc<LinkHandler>, PeerReceiver) {
    let (link, peer) = sending_link(name, outcome);
    let handler = LinkHandlerProvider::default()
        .create(AttachedLink::Sending(link), address, context.clone())
        .await
        .unwrap();
    handler.open(TIMEOUT).await.unwrap();
    let runner = handler.clone();
    tokio::spawn(async move { runner.run().await });
    (handler, peer)
}

fn rejected_condition(settlement: Settlement) -> ErrorCondition {
    match settlement {
        Settlement::Rejected(_, Some(error)) => error.condition,
        other => panic!("expected a rejection, got {:?}", other),
    }
}

fn twin_request(operation: &str, correlation_id: &str, body: &str) -> AmqpMessage {
    let message = Message {
        header: None,
        delivery_annotations: None,
        message_annotations: Some(
            MessageAnnotations::builder()
                .insert(
                    Symbol::from(TWIN_OPERATION),
                    Value::String(operation.to_string()),
                )
                .build(),
        ),
        properties: None,
        application_properties: None,
        body: Body::from(Data(Binary::from(body.as_bytes().to_vec()))),
        footer: None,
    };
    with_correlation_id(message, correlation_id)
}

#[tokio::test]
async fn unknown_address_is_detached_with_not_found() {
    let (provider, _events) = CountingProvider::new(Duration::ZERO);
    let context = sasl_context(provider, "d1@sas.hub");

    let (link, peer) = receiving_link("bogus");
    let result = LinkHandlerProvider::default()
        .create(
            AttachedLink::Receiving(link),
            "/devices/d1/messages/deviceBound",
            context,
        )
        .await;
    assert!(matches!(result, Err(LinkError::UnknownAddress(_))));

    let error: definitions::Error = peer.closed_with().flatten().unwrap();
    assert_eq!(error.condition, ErrorCondition::AmqpError(AmqpError::NotFound));
}

#[test]
fn custom_routes_resolve_in_order() {
    let provider = LinkHandlerProvider::empty()
        .with_route(
            edgehub_amqp::link::LinkDirection::Receiving,
            "/devices/{deviceId}/telemetry",
            LinkType::Events,
        )
        .with_route(
            edgehub_amqp::link::LinkDirection::Receiving,
            "/devices/{deviceId}/{params}",
            LinkType::TwinReceiving,
        );
    let resolved = provider
        .resolve(
            edgehub_amqp::link::LinkDirection::Receiving,
            "amqps://edge/devices/d7/telemetry",
        )
        .unwrap();
    assert_eq!(resolved.link_type, LinkType::Events);
    assert_eq!(resolved.bound_variables["deviceId"], "d7");

    let resolved = provider
        .resolve(
            edgehub_amqp::link::LinkDirection::Receiving,
            "/devices/d7/anything/else",
        )
        .unwrap();
    assert_eq!(resolved.link_type, LinkType::TwinReceiving);
}

#[tokio::test]
async fn module_events_carry_connection_ids() {
    let (provider, mut events) = CountingProvider::new(Duration::ZERO);
    let context = sasl_context(provider.clone(), "d1/modules/m1@sas.hub");
    let (handler, mut peer) = open_receiving(
        &context,
        "events",
        "/devices/d1/modules/m1/messages/events",
    )
    .await;
    assert_eq!(handler.link_type(), LinkType::Events);
    assert_eq!(handler.identity().map(|i| i.id()), Some("d1/m1".to_string()));

    assert_eq!(peer.send(text_message("hello")).await, Settlement::Accepted(0));
    match next_event(&mut events).await {
        ListenerEvent::Batch(messages) => {
            assert_eq!(
                messages[0].system_property(SystemProperty::ConnectionDeviceId),
                Some("d1")
            );
            assert_eq!(
                messages[0].system_property(SystemProperty::ConnectionModuleId),
                Some("m1")
            );
        }
        other => panic!("unexpected {:?}", other),
    }
    handler.close(None).await;
}

#[tokio::test]
async fn oversized_message_is_rejected() {
    let (provider, mut events) = CountingProvider::new(Duration::ZERO);
    let context = Arc::new(ConnectionContext::new(
        HUB,
        Some(edgehub_amqp::sasl::SaslPrincipal {
            identity: edgehub_amqp::sasl::SaslIdentity::parse("d1@sas.hub").unwrap(),
            password: "token".into(),
        }),
        64,
        provider,
        Arc::new(StaticAuthenticator(true)),
        Arc::new(edgehub_amqp::auth::IdentityCredentialsFactory),
    ));
    let (handler, mut peer) =
        open_receiving(&context, "events", "/devices/d1/messages/events").await;

    let settlement = peer.send_sized(text_message("too large"), 65).await;
    assert_eq!(
        rejected_condition(settlement),
        ErrorCondition::LinkError(definitions::LinkError::MessageSizeExceeded)
    );

    let settlement = peer.send_sized(text_message("fits"), 64).await;
    assert_eq!(settlement, Settlement::Accepted(1));
    match next_event(&mut events).await {
        ListenerEvent::Batch(messages) => assert_eq!(&messages[0].body[..], b"fits"),
        other => panic!("unexpected {:?}", other),
    }
    handler.close(None).await;
}

#[tokio::test]
async fn twin_operations_reach_the_listener() {
    let (provider, mut events) = CountingProvider::new(Duration::ZERO);
    let context = sasl_context(provider, "d1@sas.hub");
    let (handler, mut peer) = open_receiving(&context, "twin", "/devices/d1/twin").await;

    assert_eq!(
        peer.send(twin_request("GET", "c1", "")).await,
        Settlement::Accepted(0)
    );
    assert_eq!(
        next_event(&mut events).await,
        ListenerEvent::GetTwin("c1".into())
    );

    peer.send(twin_request("PATCH", "c2", "{\"fw\":\"1.0\"}")).await;
    match next_event(&mut events).await {
        ListenerEvent::ReportedProperties(message, correlation_id) => {
            assert_eq!(correlation_id, "c2");
            assert_eq!(&message.body[..], b"{\"fw\":\"1.0\"}");
        }
        other => panic!("unexpected {:?}", other),
    }

    peer.send(twin_request("PUT", "c3", "")).await;
    assert_eq!(
        next_event(&mut events).await,
        ListenerEvent::Subscribe("c3".into())
    );

    peer.send(twin_request("DELETE", "c4", "")).await;
    assert_eq!(
        next_event(&mut events).await,
        ListenerEvent::Unsubscribe("c4".into())
    );

    let settlement = peer.send(twin_request("POST", "c5", "")).await;
    assert_eq!(
        rejected_condition(settlement),
        ErrorCondition::AmqpError(AmqpError::InvalidField)
    );

    let settlement = peer.send(text_message("no operation")).await;
    assert!(matches!(settlement, Settlement::Rejected(_, _)));
    handler.close(None).await;
}

#[tokio::test]
async fn c2d_outcome_is_reported_as_feedback() {
    let (provider, mut events) = CountingProvider::new(Duration::ZERO);
    let context = sasl_context(provider.clone(), "d1@sas.hub");
    let (handler, mut peer) = open_sending(
        &context,
        "c2d",
        "/devices/d1/messages/deviceBound",
        DeliveryOutcome::Rejected,
    )
    .await;
    assert_eq!(handler.link_type(), LinkType::DeviceBound);

    let lock_token = Uuid::new_v4().to_string();
    let proxy = provider.listener().proxy();
    assert!(proxy.is_registered(DeviceCapability::C2DMessages));
    proxy
        .send_c2d_message(
            InternalMessage::new("reboot")
                .with_system_property(SystemProperty::LockToken, lock_token.clone()),
        )
        .await
        .unwrap();

    let transfer = peer.recv().await;
    assert!(!transfer.settled);
    assert_eq!(
        transfer.delivery_tag,
        Uuid::parse_str(&lock_token).unwrap().as_bytes().to_vec()
    );
    let annotations = transfer.message.message_annotations.unwrap();
    assert!(annotations.iter().any(|(key, value)| {
        matches!(key, OwnedKey::Symbol(s) if s.as_str() == LOCK_TOKEN)
            && *value == Value::String(lock_token.clone())
    }));

    assert_eq!(
        next_event(&mut events).await,
        ListenerEvent::Feedback(lock_token, FeedbackStatus::Reject)
    );

    handler.close(None).await;
    assert!(!proxy.is_registered(DeviceCapability::C2DMessages));
    assert_eq!(peer.closed_with(), Some(None));
}

#[tokio::test]
async fn module_messages_are_sent_to_input() {
    let (provider, _events) = CountingProvider::new(Duration::ZERO);
    let context = sasl_context(provider.clone(), "d1/modules/m1@sas.hub");
    let (handler, mut peer) = open_sending(
        &context,
        "m2m",
        "/devices/d1/modules/m1/messages/events",
        DeliveryOutcome::Accepted,
    )
    .await;
    assert_eq!(handler.link_type(), LinkType::ModuleMessages);

    provider
        .listener()
        .proxy()
        .send_message(InternalMessage::new("payload"), "input1")
        .await
        .unwrap();
    let transfer = peer.recv().await;
    let converted = edgehub_amqp::message::AmqpMessageConverter::new()
        .to_message(transfer.message)
        .unwrap();
    assert_eq!(converted.system_property(SystemProperty::InputName), Some("input1"));
    handler.close(None).await;
}

#[tokio::test]
async fn direct_method_round_trip() {
    let (provider, mut events) = CountingProvider::new(Duration::ZERO);
    let context = sasl_context(provider.clone(), "d1@sas.hub");
    let (invoker, mut requests) = open_sending(
        &context,
        "methods-sender",
        "/devices/d1/methods/deviceBound",
        DeliveryOutcome::Accepted,
    )
    .await;
    let (responder, mut responses) =
        open_receiving(&context, "methods-receiver", "/devices/d1/methods/deviceBound").await;
    assert_eq!(invoker.link_type(), LinkType::MethodInvoke);
    assert_eq!(responder.link_type(), LinkType::MethodResponse);

    let proxy = provider.listener().proxy();
    let call = tokio::spawn(async move {
        proxy
            .invoke_method(DirectMethodRequest::new("call-1", "reboot", "{}"))
            .await
    });

    let request = requests.recv().await;
    assert!(request.settled);
    let method_name = request
        .message
        .application_properties
        .as_ref()
        .and_then(|ap| {
            ap.iter()
                .find(|(key, _)| key.as_str() == METHOD_NAME)
                .map(|(_, value)| value.clone())
        });
    assert_eq!(method_name, Some(SimpleValue::String("reboot".into())));

    let response = Message {
        header: None,
        delivery_annotations: None,
        message_annotations: None,
        properties: None,
        application_properties: Some(
            ApplicationProperties::builder()
                .insert(METHOD_STATUS.to_string(), SimpleValue::Int(200))
                .build(),
        ),
        body: Body::from(Data(Binary::from(b"{\"ok\":true}".to_vec()))),
        footer: None,
    };
    assert_eq!(
        responses.send(with_correlation_id(response, "call-1")).await,
        Settlement::Accepted(0)
    );

    let response = call.await.unwrap().unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(&response.data[..], b"{\"ok\":true}");

    let late = Message {
        header: None,
        delivery_annotations: None,
        message_annotations: None,
        properties: None,
        application_properties: Some(
            ApplicationProperties::builder()
                .insert(METHOD_STATUS.to_string(), SimpleValue::Int(404))
                .build(),
        ),
        body: Body::Empty,
        footer: None,
    };
    responses.send(with_correlation_id(late, "call-unknown")).await;
    match next_event(&mut events).await {
        ListenerEvent::MethodResponse(response) => {
            assert_eq!(response.correlation_id, "call-unknown");
            assert_eq!(response.status, 404);
        }
        other => panic!("unexpected {:?}", other),
    }

    invoker.close(None).await;
    responder.close(None).await;
}

#[tokio::test]
async fn twin_sending_link_registers_two_capabilities() {
    let (provider, mut events) = CountingProvider::new(Duration::ZERO);
    let context = sasl_context(provider.clone(), "d1@sas.hub");
    let (handler, mut peer) = open_sending(
        &context,
        "twin-sender",
        "/devices/d1/twin",
        DeliveryOutcome::Accepted,
    )
    .await;

    let proxy = provider.listener().proxy();
    assert!(proxy.is_registered(DeviceCapability::DesiredPropertyUpdates));
    assert!(proxy.is_registered(DeviceCapability::TwinResponses));

    proxy
        .on_desired_property_updates(
            InternalMessage::new("{\"desired\":{}}")
                .with_system_property(SystemProperty::LockToken, "lock-1"),
        )
        .await
        .unwrap();
    proxy
        .send_twin_update(
            InternalMessage::new("{}").with_system_property(SystemProperty::CorrelationId, "c1"),
        )
        .await
        .unwrap();
    assert!(peer.recv().await.settled);
    let response = peer.recv().await;
    assert_eq!(
        response.message.properties.and_then(|p| p.correlation_id),
        Some("c1".to_string().into())
    );
    assert!(response.settled);
    // Pre-settled deliveries have no outcome to report
    assert!(events.try_recv().is_err());

    handler.close(None).await;
    assert!(!proxy.is_registered(DeviceCapability::DesiredPropertyUpdates));
    assert!(!proxy.is_registered(DeviceCapability::TwinResponses));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_links_resolve_one_listener() {
    let (provider, _events) = CountingProvider::new(Duration::from_millis(50));
    let context = sasl_context(provider.clone(), "d1@sas.hub");

    let opens: Vec<_> = (0..8)
        .map(|i| {
            let context = context.clone();
            tokio::spawn(async move {
                let (link, peer) = receiving_link(&format!("events-{}", i));
                let handler = LinkHandlerProvider::default()
                    .create(
                        AttachedLink::Receiving(link),
                        "/devices/d1/messages/events",
                        context,
                    )
                    .await
                    .unwrap();
                let opened = handler.open(TIMEOUT).await;
                opened.map(|_| (handler, peer))
            })
        })
        .collect();

    let mut handlers = Vec::new();
    for open in opens {
        let (handler, _peer) = open.await.unwrap().unwrap();
        assert_eq!(handler.state(), LinkState::Open);
        handlers.push(handler);
    }

    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    assert_eq!(provider.listeners().len(), 1);
    assert_eq!(provider.listener().binds.load(Ordering::SeqCst), 1);

    for handler in handlers {
        handler.close(None).await;
    }
}

#[tokio::test]
async fn device_link_without_credentials_is_refused() {
    let (provider, _events) = CountingProvider::new(Duration::ZERO);
    let context = cbs_context(provider, true, 256 * 1024);

    let (link, _peer) = sending_link("c2d", DeliveryOutcome::Accepted);
    let handler = LinkHandlerProvider::default()
        .create(
            AttachedLink::Sending(link),
            "/devices/d1/messages/deviceBound",
            context,
        )
        .await
        .unwrap();
    assert!(matches!(
        handler.open(TIMEOUT).await,
        Err(LinkError::Unauthorized(_))
    ));
    assert_eq!(handler.state(), LinkState::Attached);
}

#[tokio::test(start_paused = true)]
async fn slow_listener_times_out_link_open() {
    let (provider, _events) = CountingProvider::new(Duration::from_secs(120));
    let context = sasl_context(provider, "d1@sas.hub");

    let (link, _peer) = receiving_link("events");
    let handler = LinkHandlerProvider::default()
        .create(
            AttachedLink::Receiving(link),
            "/devices/d1/messages/events",
            context,
        )
        .await
        .unwrap();
    assert!(matches!(
        handler.open(Duration::from_secs(60)).await,
        Err(LinkError::Timeout)
    ));
    assert_eq!(handler.state(), LinkState::Attached);
}

#[tokio::test]
async fn close_is_idempotent_and_stops_run() {
    let (provider, _events) = CountingProvider::new(Duration::ZERO);
    let context = sasl_context(provider, "d1@sas.hub");

    let (link, mut peer) = receiving_link("events");
    let handler = LinkHandlerProvider::default()
        .create(
            AttachedLink::Receiving(link),
            "/devices/d1/messages/events",
            context.clone(),
        )
        .await
        .unwrap();
    handler.open(TIMEOUT).await.unwrap();
    let runner = handler.clone();
    let run = tokio::spawn(async move { runner.run().await });

    assert_eq!(peer.send(text_message("x")).await, Settlement::Accepted(0));
    assert_eq!(handler.state(), LinkState::Active);
    handler.close(None).await;
    handler.close(None).await;
    tokio::time::timeout(TIMEOUT, run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(handler.state(), LinkState::Closed);
    assert_eq!(peer.closed_with(), Some(None));
    assert!(matches!(
        handler.run().await,
        Err(LinkError::IllegalState(LinkState::Closed))
    ));
}

#[tokio::test]
async fn connection_close_stops_links() {
    let (provider, _events) = CountingProvider::new(Duration::ZERO);
    let context = sasl_context(provider.clone(), "d1@sas.hub");
    let (handler, _peer) = open_sending(
        &context,
        "c2d",
        "/devices/d1/messages/deviceBound",
        DeliveryOutcome::Accepted,
    )
    .await;
    let proxy = provider.listener().proxy();
    assert!(proxy.is_registered(DeviceCapability::C2DMessages));

    context.close();
    assert!(!proxy.is_registered(DeviceCapability::C2DMessages));
    handler.close(None).await;
    assert_eq!(handler.state(), LinkState::Closed);
}
