use std::time::Duration;

use assert_matches::assert_matches;
use bytes::BytesMut;

use super::*;
use crate::frame;

mod util;
use util::*;

#[test]
fn single_message_end_to_end() {
    let _guard = subscribe();
    let mut pair = Pair::connect();

    let (message, probe) = tracked("addr1", &[0xde, 0xad]);
    pair.client.write_message(message.with_property("id", "u1"));
    pair.drive();

    let received = match pair.server.poll() {
        Some(Event::Received(m)) => m,
        other => panic!("expected a delivery, got {other:?}"),
    };
    assert_eq!(&received.payload[..], &[0xde, 0xad]);
    assert_eq!(received.topic, "addr1");
    assert_eq!(received.remote_legal_name, CLIENT_NAME);
    assert_eq!(received.local_legal_name, SERVER_NAME);
    assert_eq!(
        received.property("id"),
        Some(&PropertyValue::String("u1".into()))
    );
    assert_eq!(
        received.property(VALIDATED_USER_KEY),
        Some(&PropertyValue::String(CLIENT_NAME.into()))
    );

    assert_eq!(status(&probe), None);
    pair.server.complete_received(received.delivery, true);
    pair.drive();

    assert_eq!(status(&probe), Some(MessageStatus::Acknowledged));
    assert!(pair.client.queues_empty());
}

#[test]
fn queued_before_session_ready() {
    let _guard = subscribe();
    let mut pair = Pair::new();

    // the server side's session stays uninitialized until the client opens
    let (message, probe) = tracked("addr-back", b"pong");
    pair.server.write_message(message);
    assert_eq!(pair.server.queue_depth("addr-back"), 1);
    assert_eq!(status(&probe), None);

    pair.drive();

    let received = match pair.client.poll() {
        Some(Event::Received(m)) => m,
        other => panic!("expected a delivery, got {other:?}"),
    };
    assert_eq!(&received.payload[..], b"pong");
    assert_eq!(received.remote_legal_name, SERVER_NAME);
    pair.client.complete_received(received.delivery, true);
    pair.drive();
    assert_eq!(status(&probe), Some(MessageStatus::Acknowledged));
}

#[test]
fn write_before_handshake_transmits_after_connect() {
    let _guard = subscribe();
    let mut pair = Pair::new();

    let (message, probe) = tracked("addr1", b"early");
    pair.client.write_message(message);
    pair.drive();

    let received = match pair.server.poll() {
        Some(Event::Received(m)) => m,
        other => panic!("expected a delivery, got {other:?}"),
    };
    pair.server.complete_received(received.delivery, true);
    pair.drive();
    assert_eq!(status(&probe), Some(MessageStatus::Acknowledged));
}

#[test]
fn credit_zero_then_flow() {
    let _guard = subscribe();
    let mut server = server_config();
    server.link_credit = 1;
    let mut pair = Pair::with_configs(client_config(), server);
    pair.drive();

    let (first, first_probe) = tracked("addr1", &[1]);
    let (second, second_probe) = tracked("addr1", &[2]);
    pair.client.write_message(first);
    pair.client.write_message(second);
    pair.drive();

    // one credit granted: the first message is in flight, the second queued
    assert_eq!(pair.client.unacked_len(), 1);
    assert_eq!(pair.client.queue_depth("addr1"), 1);
    assert_eq!(status(&first_probe), None);

    let received = match pair.server.poll() {
        Some(Event::Received(m)) => m,
        other => panic!("expected a delivery, got {other:?}"),
    };
    assert_eq!(&received.payload[..], &[1]);
    pair.server.complete_received(received.delivery, true);
    pair.drive();

    // settlement tops the window back up and the second message moves
    assert_eq!(status(&first_probe), Some(MessageStatus::Acknowledged));
    let received = match pair.server.poll() {
        Some(Event::Received(m)) => m,
        other => panic!("expected the second delivery, got {other:?}"),
    };
    assert_eq!(&received.payload[..], &[2]);
    pair.server.complete_received(received.delivery, true);
    pair.drive();
    assert_eq!(status(&second_probe), Some(MessageStatus::Acknowledged));
    assert!(pair.client.queues_empty());
}

#[test]
fn remote_rejection_completes_rejected() {
    let _guard = subscribe();
    let mut pair = Pair::connect();

    let (message, probe) = tracked("addr1", b"nope");
    pair.client.write_message(message);
    pair.drive();

    let received = match pair.server.poll() {
        Some(Event::Received(m)) => m,
        other => panic!("expected a delivery, got {other:?}"),
    };
    pair.server.complete_received(received.delivery, false);
    pair.drive();

    assert_eq!(status(&probe), Some(MessageStatus::Rejected));
    assert_eq!(pair.client.unacked_len(), 0);
}

#[test]
fn address_create_refusal_abandons_queue() {
    let _guard = subscribe();
    let mut server = server_config();
    // the server never grants credit, so both messages stay queued
    server.link_credit = 0;
    let mut pair = Pair::with_configs(client_config(), server);
    pair.drive();

    let (first, first_probe) = tracked("addr_bad", &[1]);
    let (second, second_probe) = tracked("addr_bad", &[2]);
    pair.client.write_message(first);
    pair.client.write_message(second);
    pair.drive();
    assert_eq!(pair.client.queue_depth("addr_bad"), 2);

    // the broker-side permission failure arrives as a remote detach
    let mut wire = BytesMut::new();
    frame::encode_frame(
        &mut wire,
        0,
        &frame::Performative::Detach(frame::Detach {
            handle: 0,
            closed: true,
            error: Some(frame::ErrorCondition::new(
                "amqp:unauthorized-access",
                "AMQ119032: user cannot create address addr_bad",
            )),
        }),
        &[],
    );
    pair.client.process_input(pair.time, &wire);

    // abandoned as success so they are never retried
    assert_eq!(status(&first_probe), Some(MessageStatus::Acknowledged));
    assert_eq!(status(&second_probe), Some(MessageStatus::Acknowledged));
    assert_eq!(pair.client.queue_depth("addr_bad"), 0);

    // the condition propagates to the transport and tears the link down
    assert!(pair.client.is_closed());
    assert!(pair.client.queues_empty());
    assert!(pair.client.registry_empty());
}

#[test]
fn abrupt_disconnect_fails_in_flight_messages() {
    let _guard = subscribe();
    let mut server = server_config();
    server.link_credit = 1;
    let mut pair = Pair::with_configs(client_config(), server);
    pair.drive();

    let (first, first_probe) = tracked("addr1", &[1]);
    let (second, second_probe) = tracked("addr1", &[2]);
    pair.client.write_message(first);
    pair.client.write_message(second);
    pair.drive();
    assert_eq!(pair.client.unacked_len(), 1);
    assert_eq!(pair.client.queue_depth("addr1"), 1);

    // garbage on the wire fails the transport input path
    pair.client
        .process_input(pair.time, b"garbage, definitely not amqp");

    assert!(pair.client.is_closed());
    assert_eq!(status(&first_probe), Some(MessageStatus::Rejected));
    assert_eq!(status(&second_probe), Some(MessageStatus::Rejected));
    assert!(pair.client.queues_empty());
    assert!(pair.client.registry_empty());

    let mut saw_closed = false;
    while let Some(event) = pair.client.poll() {
        if matches!(event, Event::Closed) {
            saw_closed = true;
        }
    }
    assert!(saw_closed);
}

#[test]
fn delivery_tags_increase_and_never_repeat() {
    let _guard = subscribe();
    let mut pair = Pair::connect();

    for payload in [&[1u8][..], &[2], &[3]] {
        let (message, _probe) = tracked("addr1", payload);
        pair.client.write_message(message);
    }
    pair.drive();

    // collect the wire image of a fresh batch and inspect its tags
    let (message, _probe) = tracked("addr1", &[4]);
    pair.client.write_message(message);
    let (message, _probe) = tracked("addr1", &[5]);
    pair.client.write_message(message);

    let mut wire = BytesMut::new();
    while let Some(chunk) = pair.client.poll_output() {
        wire.extend_from_slice(&chunk);
    }
    let mut parse = wire.clone();
    let mut tags = Vec::new();
    while let Some(raw) = frame::try_frame(&mut parse, DEFAULT_MAX_FRAME_SIZE).unwrap() {
        if raw.body.is_empty() {
            continue;
        }
        if let (frame::Performative::Transfer(t), _) =
            frame::parse_performative(raw.body).unwrap()
        {
            if let Some(tag) = t.delivery_tag {
                tags.push(u32::from_be_bytes(tag[..].try_into().unwrap()));
            }
        }
    }
    assert_eq!(tags, vec![3, 4]);

    pair.server.process_input(pair.time, &wire);
    pair.drive();
}

#[test]
fn per_address_fifo_preserved_on_the_wire() {
    let _guard = subscribe();
    let mut pair = Pair::connect();

    for marker in 1u8..=5 {
        let (message, _probe) = tracked("addr1", &[marker]);
        pair.client.write_message(message);
    }
    pair.drive();

    let mut markers = Vec::new();
    while let Some(event) = pair.server.poll() {
        if let Event::Received(m) = event {
            markers.push(m.payload[0]);
            pair.server.complete_received(m.delivery, true);
        }
    }
    assert_eq!(markers, vec![1, 2, 3, 4, 5]);
}

#[test]
fn large_message_is_chunked_and_reassembled() {
    let _guard = subscribe();
    let mut server = server_config();
    server.max_frame_size = 1024;
    let mut pair = Pair::with_configs(client_config(), server);
    pair.drive();

    let payload: Vec<u8> = (0..10_000u32).map(|i| i as u8).collect();
    let (message, probe) = tracked("bulk", &payload);
    pair.client.write_message(message);
    pair.drive();

    let received = match pair.server.poll() {
        Some(Event::Received(m)) => m,
        other => panic!("expected a delivery, got {other:?}"),
    };
    assert_eq!(&received.payload[..], &payload[..]);
    pair.server.complete_received(received.delivery, true);
    pair.drive();
    assert_eq!(status(&probe), Some(MessageStatus::Acknowledged));
}

#[test]
fn plain_credentials_handshake() {
    let _guard = subscribe();
    let client = client_config().credentials("fabric-user", "fabric-secret");
    let server = server_config().credentials("fabric-user", "fabric-secret");
    let mut pair = Pair::with_configs(client, server);
    pair.drive();
    assert!(pair.client.remote_container_id().is_some());
    assert!(pair
        .client
        .remote_container_id()
        .unwrap()
        .starts_with("CORDA:"));
    assert_eq!(
        pair.client.remote_idle_timeout(),
        Some(Duration::from_secs(10))
    );
}

#[test]
fn sasl_mechanism_mismatch_fails_connection() {
    let _guard = subscribe();
    let server = server_config().credentials("fabric-user", "fabric-secret");
    let mut pair = Pair::with_configs(client_config(), server);
    pair.drive();
    // the client cannot offer PLAIN and tears the transport down
    assert!(pair.client.is_closed());
}

#[test]
fn graceful_close_drains_both_sides() {
    let _guard = subscribe();
    let mut pair = Pair::connect();
    pair.client.close();
    pair.drive();
    assert!(pair.client.is_closed());
    assert!(pair.server.is_closed());
    assert_matches!(pair.client.poll(), Some(Event::Closed));
    assert_matches!(pair.server.poll(), Some(Event::Closed));
}

#[test]
fn heartbeats_keep_the_link_alive() {
    let _guard = subscribe();
    let mut pair = Pair::connect();
    for _ in 0..4 {
        pair.advance(Duration::from_secs(6));
    }
    assert!(!pair.client.is_closed());
    assert!(!pair.server.is_closed());
}

#[test]
fn idle_peer_is_torn_down() {
    let _guard = subscribe();
    let mut pair = Pair::connect();
    // no traffic pumped: the peer has gone silent past the idle window
    pair.time += Duration::from_secs(11);
    pair.client.handle_timeout(pair.time);
    assert!(pair.client.is_closed());
}

#[test]
fn write_after_close_is_rejected_immediately() {
    let _guard = subscribe();
    let mut pair = Pair::connect();
    pair.client.close();
    pair.drive();
    assert!(pair.client.is_closed());

    let (message, probe) = tracked("addr1", b"late");
    pair.client.write_message(message);
    assert_eq!(status(&probe), Some(MessageStatus::Rejected));
}

#[test]
fn drop_completes_queued_messages() {
    let _guard = subscribe();
    let mut pair = Pair::new();
    let (message, probe) = tracked("addr1", b"doomed");
    pair.client.write_message(message);
    drop(pair);
    assert_eq!(status(&probe), Some(MessageStatus::Rejected));
}
