// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Agent-level tests: client lifecycle through the public API and through
// wire messages, object CRUD and data paths, reply ordering and shutdown,
// and full roundtrips over a mock transport and over real UDP sockets.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::agent::Agent;
use crate::config::AgentConfig;
use crate::error::XrceError;
use crate::protocol::*;
use crate::proxy::{LoopbackBridge, NullBridge, ProxyBridge};
use crate::transport::{TransportAddr, UdpTransport, XrceTransport};

const K1: ClientKey = ClientKey([0x01, 0x01, 0x01, 0x01]);
const K2: ClientKey = ClientKey([0x02, 0x02, 0x02, 0x02]);
const SESSION: u8 = 0x81;

// -----------------------------------------------------------------------
// 1. Scenario: duplicate client key is refused, original kept
// -----------------------------------------------------------------------
#[test]
fn test_create_client_twice_reports_already_exists() {
    let (agent, _transport) = make_agent(Arc::new(NullBridge));
    let header = header_for(K1);

    assert!(agent.create_client(&header, &CreateClientPayload::new(1, K1, SESSION)).is_ok());
    let first = agent.get_client(K1).expect("client registered");

    let again = agent.create_client(&header, &CreateClientPayload::new(2, K1, 0x82));
    assert_eq!(again.status, StatusCode::ErrAlreadyExists);
    let still = agent.get_client(K1).unwrap();
    assert!(Arc::ptr_eq(&first, &still));
    assert_eq!(still.session_id(), SESSION);
}

// -----------------------------------------------------------------------
// 2. Scenario: delete, then delete again
// -----------------------------------------------------------------------
#[test]
fn test_delete_client_twice_reports_not_found() {
    let (agent, _transport) = make_agent(Arc::new(NullBridge));
    agent.create_client(&header_for(K1), &CreateClientPayload::new(1, K1, SESSION));

    assert!(agent.delete_client(K1).is_ok());
    assert!(agent.get_client(K1).is_none());
    assert_eq!(
        agent.delete_client(K1).status,
        StatusCode::ErrUnknownReference
    );
}

// -----------------------------------------------------------------------
// 3. Scenario: delete-resource request unbinds the object
// -----------------------------------------------------------------------
#[test]
fn test_delete_resource_unbinds_object() {
    let (agent, transport) = make_agent(Arc::new(LoopbackBridge::new()));
    let from = peer(6000);
    connect(&agent, &from, K1);
    agent.process_incoming(&from, &create_participant_msg(K1, 2, ObjectId(0x10)));
    assert_eq!(agent.registry().resolve_object(ObjectId(0x10)), Some(K1));

    agent.process_incoming(
        &from,
        &message(
            K1,
            DeletePayload {
                request_id: 3,
                object_id: ObjectId(0x10),
            },
        ),
    );

    let statuses = wait_statuses(&transport, 3);
    assert_eq!(statuses[2].request_id, 3);
    assert_eq!(statuses[2].object_id, ObjectId(0x10));
    assert!(statuses[2].result.is_ok());
    assert_eq!(agent.registry().resolve_object(ObjectId(0x10)), None);
    assert_eq!(agent.get_client(K1).unwrap().object_count(), 0);
}

// -----------------------------------------------------------------------
// 4. Scenario: replies queued behind a slow transport keep their order
// -----------------------------------------------------------------------
#[test]
fn test_replies_behind_slow_transport_keep_order() {
    let (agent, transport) = make_agent(Arc::new(NullBridge));
    let from = peer(6000);
    transport.close_gate();

    connect(&agent, &from, K1);
    assert!(wait_for(|| transport.attempts() == 1));
    agent.process_incoming(&from, &create_participant_msg(K1, 2, ObjectId(1)));
    agent.process_incoming(&from, &create_participant_msg(K1, 3, ObjectId(2)));
    assert_eq!(transport.sent_count(), 0);

    transport.open_gate();
    let ids: Vec<u16> = wait_statuses(&transport, 3)
        .iter()
        .map(|s| s.request_id)
        .collect();
    assert_eq!(ids, vec![1, 2, 3]);
}

// -----------------------------------------------------------------------
// 5. CREATE_CLIENT over the wire: STATUS back to the sender
// -----------------------------------------------------------------------
#[test]
fn test_create_client_message_replies_to_sender() {
    let (agent, transport) = make_agent(Arc::new(NullBridge));
    let from = peer(6001);
    agent.process_incoming(
        &from,
        &message(ClientKey::default(), create_client_submsg(7, K1)),
    );

    assert!(wait_for(|| transport.sent_count() == 1));
    let (to, reply) = transport.sent_messages().remove(0);
    assert_eq!(to, from);
    assert_eq!(reply.header.client_key, K1);
    assert_eq!(reply.header.session_id, SESSION);
    match &reply.submessages[0] {
        Submessage::Status(s) => {
            assert_eq!(s.request_id, 7);
            assert_eq!(s.object_id, ObjectId::CLIENT);
            assert_eq!(s.result, ResultStatus::OK);
        }
        other => panic!("expected Status, got {:?}", other),
    }
    assert_eq!(agent.get_client(K1).unwrap().peer(), Some(&from));
}

// -----------------------------------------------------------------------
// 6. CREATE_CLIENT validation
// -----------------------------------------------------------------------
#[test]
fn test_create_client_rejects_bad_cookie_and_version() {
    let (agent, transport) = make_agent(Arc::new(NullBridge));
    let from = peer(6002);

    let mut bad_cookie = CreateClientPayload::new(1, K1, SESSION);
    bad_cookie.xrce_cookie = *b"XXXX";
    let mut bad_version = CreateClientPayload::new(2, K2, SESSION);
    bad_version.xrce_version = [2, 0];

    agent.process_incoming(&from, &message(K1, Submessage::CreateClient(bad_cookie)));
    agent.process_incoming(&from, &message(K2, Submessage::CreateClient(bad_version)));

    let statuses = wait_statuses(&transport, 2);
    assert_eq!(statuses[0].result.status, StatusCode::ErrInvalidData);
    assert_eq!(statuses[1].result.status, StatusCode::ErrIncompatible);
    assert_eq!(agent.client_count(), 0);
}

// -----------------------------------------------------------------------
// 7. Client limit
// -----------------------------------------------------------------------
#[test]
fn test_client_limit_reports_resources() {
    let config = AgentConfig {
        max_clients: 1,
        ..AgentConfig::default()
    };
    let (agent, transport) = make_agent_with_config(config, Arc::new(NullBridge));
    connect(&agent, &peer(6003), K1);
    connect(&agent, &peer(6004), K2);

    let statuses = wait_statuses(&transport, 2);
    assert!(statuses[0].result.is_ok());
    assert_eq!(statuses[1].result.status, StatusCode::ErrResources);
}

// -----------------------------------------------------------------------
// 8. CREATE for an unknown client
// -----------------------------------------------------------------------
#[test]
fn test_create_for_unknown_client() {
    let (agent, transport) = make_agent(Arc::new(NullBridge));
    agent.process_incoming(&peer(6005), &create_participant_msg(K1, 4, ObjectId(1)));

    let statuses = wait_statuses(&transport, 1);
    assert_eq!(statuses[0].request_id, 4);
    assert_eq!(statuses[0].result.status, StatusCode::ErrUnknownReference);
    assert_eq!(agent.registry().resolve_object(ObjectId(1)), None);
}

// -----------------------------------------------------------------------
// 9. Object ids are global: a second owner is denied and rolled back
// -----------------------------------------------------------------------
#[test]
fn test_object_id_owned_by_other_client_is_denied() {
    let bridge = Arc::new(LoopbackBridge::new());
    let (agent, transport) = make_agent(bridge.clone());
    connect(&agent, &peer(6006), K1);
    connect(&agent, &peer(6007), K2);
    agent.process_incoming(&peer(6006), &create_participant_msg(K1, 2, ObjectId(0x20)));
    agent.process_incoming(&peer(6007), &create_participant_msg(K2, 3, ObjectId(0x20)));

    let statuses = wait_statuses(&transport, 4);
    assert!(statuses[2].result.is_ok());
    assert_eq!(statuses[3].result.status, StatusCode::ErrDenied);

    assert_eq!(agent.registry().resolve_object(ObjectId(0x20)), Some(K1));
    assert_eq!(agent.get_client(K2).unwrap().object_count(), 0);
    assert_eq!(bridge.entity_count(), 1);

    // K2 cannot delete or write through K1's object either.
    agent.process_incoming(
        &peer(6007),
        &message(
            K2,
            DeletePayload {
                request_id: 4,
                object_id: ObjectId(0x20),
            },
        ),
    );
    let statuses = wait_statuses(&transport, 5);
    assert_eq!(statuses[4].result.status, StatusCode::ErrDenied);
    assert_eq!(agent.registry().resolve_object(ObjectId(0x20)), Some(K1));
}

// -----------------------------------------------------------------------
// 10. WRITE_DATA acknowledgement follows the reply flag
// -----------------------------------------------------------------------
#[test]
fn test_write_data_acknowledged_only_on_request() {
    let bridge = Arc::new(RecordingBridge::default());
    let (agent, transport) = make_agent(bridge.clone());
    let from = peer(6008);
    connect(&agent, &from, K1);
    build_pubsub(&agent, &from, K1, 0x100);
    let base = transport.sent_count_after(7);

    agent.process_incoming(&from, &write_msg(K1, 20, ObjectId(0x105), false, b"quiet"));
    agent.process_incoming(&from, &write_msg(K1, 21, ObjectId(0x105), true, b"loud"));
    agent.process_incoming(&from, &write_msg(K1, 22, ObjectId(0x999), false, b"lost"));

    let statuses = wait_statuses(&transport, base + 2);
    let tail = &statuses[base..];
    assert_eq!(tail[0].request_id, 21);
    assert!(tail[0].result.is_ok());
    assert_eq!(tail[1].request_id, 22);
    assert_eq!(tail[1].result.status, StatusCode::ErrUnknownReference);

    assert_eq!(
        bridge.writes(),
        vec![b"quiet".to_vec(), b"loud".to_vec()]
    );
}

// -----------------------------------------------------------------------
// 11. READ_DATA: per-sample formats produce one DATA per sample
// -----------------------------------------------------------------------
#[test]
fn test_read_data_one_reply_per_sample() {
    let (agent, transport) = make_agent(Arc::new(LoopbackBridge::new()));
    let from = peer(6009);
    connect(&agent, &from, K1);
    build_pubsub(&agent, &from, K1, 0x200);
    for data in [b"s0", b"s1", b"s2"] {
        agent.process_incoming(&from, &write_msg(K1, 30, ObjectId(0x205), false, data));
    }
    agent.process_incoming(&from, &read_msg(K1, 31, ObjectId(0x206), 2, DataFormat::Data));
    agent.process_incoming(&from, &read_msg(K1, 32, ObjectId(0x206), 5, DataFormat::Sample));

    assert!(wait_for(|| transport.sent_count() == 7 + 3));
    let data: Vec<Submessage> = transport
        .sent_messages()
        .into_iter()
        .skip(7)
        .map(|(_, m)| m.submessages[0].clone())
        .collect();
    assert_eq!(
        data[0],
        Submessage::Data(DataPayload {
            request_id: 31,
            object_id: ObjectId(0x206),
            data: b"s0".to_vec(),
        })
    );
    assert!(matches!(&data[1], Submessage::Data(d) if d.data == b"s1"));
    match &data[2] {
        Submessage::Sample(s) => {
            assert_eq!(s.request_id, 32);
            assert_eq!(s.sample.data, b"s2");
            assert_eq!(s.sample.info.sequence_number, 2);
        }
        other => panic!("expected Sample, got {:?}", other),
    }
}

// -----------------------------------------------------------------------
// 12. READ_DATA: batched formats produce a single DATA
// -----------------------------------------------------------------------
#[test]
fn test_read_data_batched_formats() {
    let (agent, transport) = make_agent(Arc::new(LoopbackBridge::new()));
    let from = peer(6010);
    connect(&agent, &from, K1);
    build_pubsub(&agent, &from, K1, 0x300);

    let writer = ObjectId(0x305);
    let reader = ObjectId(0x306);
    for data in [b"a", b"b"] {
        agent.process_incoming(&from, &write_msg(K1, 40, writer, false, data));
    }
    agent.process_incoming(&from, &read_msg(K1, 41, reader, 10, DataFormat::DataSeq));
    for data in [b"c", b"d"] {
        agent.process_incoming(&from, &write_msg(K1, 42, writer, false, data));
    }
    agent.process_incoming(&from, &read_msg(K1, 43, reader, 10, DataFormat::SampleSeq));
    for data in [b"e", b"f", b"g"] {
        agent.process_incoming(&from, &write_msg(K1, 44, writer, false, data));
    }
    agent.process_incoming(&from, &read_msg(K1, 45, reader, 10, DataFormat::PackedSamples));

    assert!(wait_for(|| transport.sent_count() == 7 + 3));
    let replies: Vec<Submessage> = transport
        .sent_messages()
        .into_iter()
        .skip(7)
        .map(|(_, m)| m.submessages[0].clone())
        .collect();

    match &replies[0] {
        Submessage::DataSeq(p) => {
            assert_eq!(p.request_id, 41);
            assert_eq!(p.data, vec![b"a".to_vec(), b"b".to_vec()]);
        }
        other => panic!("expected DataSeq, got {:?}", other),
    }
    match &replies[1] {
        Submessage::SampleSeq(p) => {
            assert_eq!(p.request_id, 43);
            let seqs: Vec<u32> = p.samples.iter().map(|s| s.info.sequence_number).collect();
            assert_eq!(seqs, vec![2, 3]);
        }
        other => panic!("expected SampleSeq, got {:?}", other),
    }
    match &replies[2] {
        Submessage::PackedSamples(p) => {
            assert_eq!(p.request_id, 45);
            assert_eq!(p.info.sequence_number, 4);
            let deltas: Vec<u8> = p.samples.iter().map(|s| s.seq_delta).collect();
            assert_eq!(deltas, vec![0, 1, 2]);
            assert_eq!(p.samples[2].data, b"g");
        }
        other => panic!("expected PackedSamples, got {:?}", other),
    }
}

// -----------------------------------------------------------------------
// 13. READ_DATA with nothing available, and on a non-reader
// -----------------------------------------------------------------------
#[test]
fn test_read_data_empty_and_wrong_kind() {
    let (agent, transport) = make_agent(Arc::new(LoopbackBridge::new()));
    let from = peer(6011);
    connect(&agent, &from, K1);
    build_pubsub(&agent, &from, K1, 0x400);

    agent.process_incoming(&from, &read_msg(K1, 50, ObjectId(0x406), 4, DataFormat::DataSeq));
    agent.process_incoming(&from, &read_msg(K1, 51, ObjectId(0x405), 4, DataFormat::Data));

    let statuses = wait_statuses(&transport, 9);
    assert_eq!(statuses[7].request_id, 50);
    assert_eq!(statuses[7].result, ResultStatus::OK);
    assert_eq!(statuses[8].request_id, 51);
    assert_eq!(statuses[8].result.status, StatusCode::ErrMismatch);
}

// -----------------------------------------------------------------------
// 14. DELETE of a participant cascades and unbinds every child
// -----------------------------------------------------------------------
#[test]
fn test_delete_participant_cascades() {
    let bridge = Arc::new(LoopbackBridge::new());
    let (agent, transport) = make_agent(bridge.clone());
    let from = peer(6012);
    connect(&agent, &from, K1);
    build_pubsub(&agent, &from, K1, 0x500);
    assert_eq!(agent.registry().bound_objects(), 6);

    agent.process_incoming(
        &from,
        &message(
            K1,
            DeletePayload {
                request_id: 60,
                object_id: ObjectId(0x501),
            },
        ),
    );
    let statuses = wait_statuses(&transport, 8);
    assert!(statuses[7].result.is_ok());
    assert_eq!(agent.registry().bound_objects(), 0);
    assert_eq!(bridge.entity_count(), 0);
    assert_eq!(agent.get_client(K1).unwrap().object_count(), 0);
}

// -----------------------------------------------------------------------
// 15. DELETE of the client object removes the client and its objects
// -----------------------------------------------------------------------
#[test]
fn test_delete_client_object_over_the_wire() {
    let bridge = Arc::new(LoopbackBridge::new());
    let (agent, transport) = make_agent(bridge.clone());
    let from = peer(6013);
    connect(&agent, &from, K1);
    build_pubsub(&agent, &from, K1, 0x600);

    let delete = DeletePayload {
        request_id: 70,
        object_id: ObjectId::CLIENT,
    };
    agent.process_incoming(&from, &message(K1, delete));
    agent.process_incoming(&from, &message(K1, delete));

    let statuses = wait_statuses(&transport, 9);
    assert_eq!(statuses[7].object_id, ObjectId::CLIENT);
    assert!(statuses[7].result.is_ok());
    assert_eq!(statuses[8].result.status, StatusCode::ErrUnknownReference);
    assert!(agent.get_client(K1).is_none());
    assert_eq!(agent.registry().bound_objects(), 0);
    assert_eq!(bridge.entity_count(), 0);
}

// -----------------------------------------------------------------------
// 16. Agent-bound variants received from a client are dropped
// -----------------------------------------------------------------------
#[test]
fn test_outbound_variants_from_client_are_ignored() {
    let (agent, transport) = make_agent(Arc::new(NullBridge));
    let from = peer(6014);
    agent.process_incoming(
        &from,
        &message(
            K1,
            StatusPayload {
                request_id: 1,
                object_id: ObjectId(1),
                result: ResultStatus::OK,
            },
        ),
    );
    agent.process_incoming(
        &from,
        &message(
            K1,
            DataPayload {
                request_id: 2,
                object_id: ObjectId(1),
                data: vec![1],
            },
        ),
    );
    connect(&agent, &from, K1);

    let statuses = wait_statuses(&transport, 1);
    assert_eq!(statuses[0].object_id, ObjectId::CLIENT);
    thread::sleep(Duration::from_millis(20));
    assert_eq!(transport.sent_count(), 1);
}

// -----------------------------------------------------------------------
// 17. Malformed datagrams are dropped whole
// -----------------------------------------------------------------------
#[test]
fn test_malformed_datagram_is_dropped() {
    let (agent, transport) = make_agent(Arc::new(NullBridge));
    let from = peer(6015);
    let mut bytes = message(ClientKey::default(), create_client_submsg(1, K1));
    bytes.truncate(bytes.len() - 2);
    agent.process_incoming(&from, &bytes);
    agent.process_incoming(&from, &[0x81, 0x01]);

    thread::sleep(Duration::from_millis(20));
    assert_eq!(transport.sent_count(), 0);
    assert_eq!(agent.client_count(), 0);
}

// -----------------------------------------------------------------------
// 18. Several submessages in one message are handled in order
// -----------------------------------------------------------------------
#[test]
fn test_multi_submessage_message() {
    let (agent, transport) = make_agent(Arc::new(NullBridge));
    let from = peer(6016);
    let msg = XrceMessage {
        header: header_for(K1),
        submessages: vec![
            create_client_submsg(1, K1),
            create_submsg(2, ObjectId(1), ObjectId(0), ObjectRepresentation::Participant {
                domain_id: 0,
            }),
            Submessage::Delete(DeletePayload {
                request_id: 3,
                object_id: ObjectId(1),
            }),
        ],
    };
    agent.process_incoming(&from, &serialize_message(&msg));

    let statuses = wait_statuses(&transport, 3);
    let ids: Vec<u16> = statuses.iter().map(|s| s.request_id).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    assert!(statuses.iter().all(|s| s.result.is_ok()));
}

// -----------------------------------------------------------------------
// 19. Outbound sequence numbers are stamped per session
// -----------------------------------------------------------------------
#[test]
fn test_reply_sequence_numbers_increase() {
    let (agent, transport) = make_agent(Arc::new(NullBridge));
    let from = peer(6017);
    connect(&agent, &from, K1);
    agent.process_incoming(&from, &create_participant_msg(K1, 2, ObjectId(1)));
    agent.process_incoming(&from, &create_participant_msg(K1, 3, ObjectId(2)));

    assert!(wait_for(|| transport.sent_count() == 3));
    let seqs: Vec<u16> = transport
        .sent_messages()
        .iter()
        .map(|(_, m)| m.header.sequence_nr)
        .collect();
    assert_eq!(seqs, vec![0, 1, 2]);
}

// -----------------------------------------------------------------------
// 20. add_reply destination: client peer, else default locator
// -----------------------------------------------------------------------
#[test]
fn test_add_reply_routes_to_peer_or_default_locator() {
    let (agent, transport) = make_agent(Arc::new(NullBridge));
    let from = peer(6018);
    connect(&agent, &from, K1);
    agent.create_client(&header_for(K2), &CreateClientPayload::new(1, K2, SESSION));

    let data = DataPayload {
        request_id: 9,
        object_id: ObjectId(1),
        data: vec![0xAB],
    };
    assert!(agent.add_reply(&header_for(K1), data.clone()));
    assert!(agent.add_reply(&header_for(K2), data));

    assert!(wait_for(|| transport.sent_count() == 3));
    let sent = transport.sent_messages();
    assert_eq!(sent[1].0, from);
    assert_eq!(sent[2].0, default_locator());
    assert!(matches!(&sent[2].1.submessages[0], Submessage::Data(d) if d.data == vec![0xAB]));
}

// -----------------------------------------------------------------------
// 21. Init errors
// -----------------------------------------------------------------------
#[test]
fn test_init_twice_fails() {
    let (agent, transport) = make_agent(Arc::new(NullBridge));
    assert_eq!(
        agent.init_with_transport(transport, default_locator()),
        Err(XrceError::AlreadyInitialized)
    );
    assert!(agent.init_serial("/nonexistent/tty").is_err());
}

// -----------------------------------------------------------------------
// 22. Run loop over the mock transport, then a prompt stop
// -----------------------------------------------------------------------
#[test]
fn test_run_loop_dispatches_and_stops() {
    let (agent, transport) = make_agent(Arc::new(NullBridge));
    let runner = {
        let agent = Arc::clone(&agent);
        thread::spawn(move || agent.run())
    };

    transport.inject(peer(6019), message(ClientKey::default(), create_client_submsg(1, K1)));
    let statuses = wait_statuses(&transport, 1);
    assert!(statuses[0].result.is_ok());
    assert!(agent.get_client(K1).is_some());

    let start = Instant::now();
    agent.stop();
    assert_eq!(runner.join().unwrap(), Ok(()));
    assert!(start.elapsed() < Duration::from_secs(1));
    assert!(!agent.is_running());

    // Nothing leaves after stop.
    assert!(!agent.add_reply(
        &header_for(K1),
        StatusPayload {
            request_id: 2,
            object_id: ObjectId(1),
            result: ResultStatus::OK,
        },
    ));
    thread::sleep(Duration::from_millis(20));
    assert_eq!(transport.sent_count(), 1);
}

// -----------------------------------------------------------------------
// 23. Full roundtrip over real UDP sockets
// -----------------------------------------------------------------------
#[test]
fn test_udp_roundtrip() {
    let poll = Duration::from_millis(20);
    let loopback = "127.0.0.1:0".parse().unwrap();
    let agent_side = Arc::new(UdpTransport::bind_addr(loopback, poll).unwrap());
    let agent_addr = TransportAddr::Udp(agent_side.local_addr().unwrap());
    let client = UdpTransport::bind_addr(loopback, poll).unwrap();
    let client_addr = TransportAddr::Udp(client.local_addr().unwrap());

    let bridge = Arc::new(LoopbackBridge::new());
    let agent = Arc::new(Agent::new(AgentConfig::default(), bridge).unwrap());
    agent.init_with_transport(agent_side, client_addr.clone()).unwrap();
    let runner = {
        let agent = Arc::clone(&agent);
        thread::spawn(move || agent.run())
    };

    let exchange = |bytes: Vec<u8>| -> XrceMessage {
        client.send(&agent_addr, &bytes).unwrap();
        let mut buf = [0u8; 1024];
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if let Some((n, from)) = client.recv(&mut buf).unwrap() {
                assert_eq!(from, agent_addr);
                return parse_message(&buf[..n]).unwrap();
            }
            assert!(Instant::now() < deadline, "no reply from agent");
        }
    };

    let reply = exchange(message(ClientKey::default(), create_client_submsg(1, K1)));
    assert!(matches!(&reply.submessages[0], Submessage::Status(s) if s.result.is_ok()));

    for sub in pubsub_submessages(0x700) {
        let reply = exchange(message(K1, sub));
        assert!(matches!(&reply.submessages[0], Submessage::Status(s) if s.result.is_ok()));
    }

    let reply = exchange(write_msg(K1, 80, ObjectId(0x705), true, b"over udp"));
    assert!(matches!(&reply.submessages[0], Submessage::Status(s) if s.request_id == 80));

    let reply = exchange(read_msg(K1, 81, ObjectId(0x706), 1, DataFormat::Data));
    match &reply.submessages[0] {
        Submessage::Data(d) => {
            assert_eq!(d.request_id, 81);
            assert_eq!(d.data, b"over udp");
        }
        other => panic!("expected Data, got {:?}", other),
    }

    agent.stop();
    assert_eq!(runner.join().unwrap(), Ok(()));
    assert_eq!(agent.stats().sent, 9);
}

// -----------------------------------------------------------------------
// 24. Batched reads larger than the buffer are split, nothing is lost
// -----------------------------------------------------------------------
#[test]
fn test_batched_read_split_to_fit_buffer() {
    let config = AgentConfig {
        buffer_size: 256,
        ..AgentConfig::default()
    };
    let (agent, transport) = make_agent_with_config(config, Arc::new(LoopbackBridge::new()));
    let from = peer(6020);
    connect(&agent, &from, K1);
    build_pubsub(&agent, &from, K1, 0x800);

    let written: Vec<Vec<u8>> = (0..40u8).map(|i| vec![i; 40]).collect();
    for data in &written {
        agent.process_incoming(&from, &write_msg(K1, 90, ObjectId(0x805), false, data));
    }
    let base = transport.sent_count_after(7);
    agent.process_incoming(&from, &read_msg(K1, 91, ObjectId(0x806), 40, DataFormat::DataSeq));
    agent.process_incoming(&from, &read_msg(K1, 92, ObjectId(0x806), 40, DataFormat::DataSeq));

    // The follow-up read finds the reader drained.
    assert!(wait_for(|| {
        transport.sent_messages().iter().any(|(_, m)| {
            matches!(&m.submessages[0], Submessage::Status(s) if s.request_id == 92)
        })
    }));

    let raw = transport.sent.lock().clone();
    let mut delivered = Vec::new();
    for (_, bytes) in &raw[base..raw.len() - 1] {
        assert!(bytes.len() <= 256);
        match &parse_message(bytes).unwrap().submessages[0] {
            Submessage::DataSeq(p) => {
                assert_eq!(p.request_id, 91);
                delivered.extend(p.data.iter().cloned());
            }
            other => panic!("expected DataSeq, got {:?}", other),
        }
    }
    assert!(raw.len() - 1 - base > 1);
    assert_eq!(delivered, written);
    assert_eq!(agent.stats().oversize_drops, 0);
}

// -----------------------------------------------------------------------
// 25. A sample that cannot fit any reply is reported, not dropped silently
// -----------------------------------------------------------------------
#[test]
fn test_read_sample_larger_than_buffer_reports_resources() {
    let config = AgentConfig {
        buffer_size: 128,
        ..AgentConfig::default()
    };
    let (agent, transport) = make_agent_with_config(config, Arc::new(LoopbackBridge::new()));
    let from = peer(6021);
    connect(&agent, &from, K1);
    build_pubsub(&agent, &from, K1, 0x900);

    let writer = ObjectId(0x905);
    agent.process_incoming(&from, &write_msg(K1, 93, writer, false, b"small"));
    agent.process_incoming(&from, &write_msg(K1, 93, writer, false, &[7u8; 200]));
    agent.process_incoming(&from, &read_msg(K1, 94, ObjectId(0x906), 10, DataFormat::SampleSeq));

    assert!(wait_for(|| transport.sent_count() == 7 + 2));
    let replies: Vec<Submessage> = transport
        .sent_messages()
        .into_iter()
        .skip(7)
        .map(|(_, m)| m.submessages[0].clone())
        .collect();
    match &replies[0] {
        Submessage::SampleSeq(p) => {
            assert_eq!(p.samples.len(), 1);
            assert_eq!(p.samples[0].data, b"small");
        }
        other => panic!("expected SampleSeq, got {:?}", other),
    }
    match &replies[1] {
        Submessage::Status(s) => {
            assert_eq!(s.request_id, 94);
            assert_eq!(s.result.status, StatusCode::ErrResources);
        }
        other => panic!("expected Status, got {:?}", other),
    }
    assert_eq!(agent.stats().oversize_drops, 0);
}

// -----------------------------------------------------------------------
// 26. Reply sequence numbers belong to the registered client
// -----------------------------------------------------------------------
#[test]
fn test_sequence_restarts_for_recreated_client() {
    let (agent, transport) = make_agent(Arc::new(NullBridge));
    let from = peer(6022);
    connect(&agent, &from, K1);
    agent.process_incoming(&from, &create_participant_msg(K1, 2, ObjectId(1)));
    let delete = DeletePayload {
        request_id: 3,
        object_id: ObjectId::CLIENT,
    };
    agent.process_incoming(&from, &message(K1, delete));

    // Rejected keys are never registered and carry no sequence state.
    let mut bad_cookie = CreateClientPayload::new(4, K2, SESSION);
    bad_cookie.xrce_cookie = *b"NOPE";
    agent.process_incoming(&from, &message(K2, Submessage::CreateClient(bad_cookie)));

    connect(&agent, &from, K1);
    agent.process_incoming(&from, &create_participant_msg(K1, 5, ObjectId(2)));

    assert!(wait_for(|| transport.sent_count() == 6));
    let seqs: Vec<(ClientKey, u16)> = transport
        .sent_messages()
        .iter()
        .map(|(_, m)| (m.header.client_key, m.header.sequence_nr))
        .collect();
    assert_eq!(
        seqs,
        vec![(K1, 0), (K1, 1), (K1, 0), (K2, 0), (K1, 0), (K1, 1)]
    );
}

// -----------------------------------------------------------------------
// Helpers
// -----------------------------------------------------------------------

fn peer(port: u16) -> TransportAddr {
    TransportAddr::Udp(format!("127.0.0.1:{}", port).parse().unwrap())
}

fn default_locator() -> TransportAddr {
    peer(2020)
}

fn make_agent(bridge: Arc<dyn ProxyBridge>) -> (Arc<Agent>, Arc<MockTransport>) {
    make_agent_with_config(AgentConfig::default(), bridge)
}

fn make_agent_with_config(
    config: AgentConfig,
    bridge: Arc<dyn ProxyBridge>,
) -> (Arc<Agent>, Arc<MockTransport>) {
    let agent = Arc::new(Agent::new(config, bridge).unwrap());
    let transport = MockTransport::new();
    agent
        .init_with_transport(transport.clone(), default_locator())
        .unwrap();
    (agent, transport)
}

fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

/// Wait until `n` replies were sent and return them as STATUS payloads.
fn wait_statuses(transport: &MockTransport, n: usize) -> Vec<StatusPayload> {
    assert!(
        wait_for(|| transport.sent_count() >= n),
        "expected {} replies, got {}",
        n,
        transport.sent_count()
    );
    transport
        .sent_messages()
        .into_iter()
        .map(|(_, m)| match &m.submessages[0] {
            Submessage::Status(s) => *s,
            other => panic!("expected Status, got {:?}", other),
        })
        .collect()
}

fn header_for(key: ClientKey) -> MessageHeader {
    MessageHeader {
        session_id: SESSION,
        stream_id: 1,
        sequence_nr: 0,
        client_key: key,
    }
}

fn message(key: ClientKey, submessage: impl Into<Submessage>) -> Vec<u8> {
    serialize_message(&XrceMessage::single(header_for(key), submessage))
}

fn create_client_submsg(request_id: u16, key: ClientKey) -> Submessage {
    Submessage::CreateClient(CreateClientPayload::new(request_id, key, SESSION))
}

fn create_submsg(
    request_id: u16,
    object_id: ObjectId,
    parent_id: ObjectId,
    representation: ObjectRepresentation,
) -> Submessage {
    Submessage::Create(CreatePayload {
        request_id,
        object_id,
        parent_id,
        representation,
    })
}

fn create_participant_msg(key: ClientKey, request_id: u16, object_id: ObjectId) -> Vec<u8> {
    message(
        key,
        create_submsg(
            request_id,
            object_id,
            ObjectId(0),
            ObjectRepresentation::Participant { domain_id: 0 },
        ),
    )
}

fn write_msg(
    key: ClientKey,
    request_id: u16,
    object_id: ObjectId,
    reply_requested: bool,
    data: &[u8],
) -> Vec<u8> {
    message(
        key,
        Submessage::WriteData(WriteDataPayload {
            request_id,
            object_id,
            reply_requested,
            data: data.to_vec(),
        }),
    )
}

fn read_msg(
    key: ClientKey,
    request_id: u16,
    object_id: ObjectId,
    max_samples: u16,
    format: DataFormat,
) -> Vec<u8> {
    message(
        key,
        Submessage::ReadData(ReadDataPayload {
            request_id,
            object_id,
            max_samples,
            format,
        }),
    )
}

/// participant +1, topic +2, publisher +3, subscriber +4, writer +5, reader +6.
fn pubsub_submessages(base: u16) -> Vec<Submessage> {
    let id = |n: u16| ObjectId(base + n);
    vec![
        create_submsg(base + 1, id(1), ObjectId(0), ObjectRepresentation::Participant {
            domain_id: 0,
        }),
        create_submsg(base + 2, id(2), id(1), ObjectRepresentation::Topic {
            name: "rt/chatter".into(),
            type_name: "std_msgs::msg::String".into(),
        }),
        create_submsg(base + 3, id(3), id(1), ObjectRepresentation::Publisher),
        create_submsg(base + 4, id(4), id(1), ObjectRepresentation::Subscriber),
        create_submsg(base + 5, id(5), id(3), ObjectRepresentation::DataWriter { topic_id: id(2) }),
        create_submsg(base + 6, id(6), id(4), ObjectRepresentation::DataReader { topic_id: id(2) }),
    ]
}

/// Create the six-object tree for `key`; assumes the client exists.
fn build_pubsub(agent: &Agent, from: &TransportAddr, key: ClientKey, base: u16) {
    let msg = XrceMessage {
        header: header_for(key),
        submessages: pubsub_submessages(base),
    };
    agent.process_incoming(from, &serialize_message(&msg));
}

fn connect(agent: &Agent, from: &TransportAddr, key: ClientKey) {
    agent.process_incoming(from, &message(key, create_client_submsg(1, key)));
}

// -----------------------------------------------------------------------
// Test transport
// -----------------------------------------------------------------------

/// In-memory transport: `inject` feeds `recv`, `send` is recorded.
/// While the gate is closed, `send` blocks (a slow link).
struct MockTransport {
    inbound: Mutex<VecDeque<(TransportAddr, Vec<u8>)>>,
    inbound_ready: Condvar,
    gate_open: Mutex<bool>,
    gate: Condvar,
    attempts: AtomicUsize,
    sent: Mutex<Vec<(TransportAddr, Vec<u8>)>>,
}

impl MockTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inbound: Mutex::new(VecDeque::new()),
            inbound_ready: Condvar::new(),
            gate_open: Mutex::new(true),
            gate: Condvar::new(),
            attempts: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
        })
    }

    fn inject(&self, from: TransportAddr, bytes: Vec<u8>) {
        self.inbound.lock().push_back((from, bytes));
        self.inbound_ready.notify_all();
    }

    fn close_gate(&self) {
        *self.gate_open.lock() = false;
    }

    fn open_gate(&self) {
        *self.gate_open.lock() = true;
        self.gate.notify_all();
    }

    fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    /// Wait for `n` replies and return `n`.
    fn sent_count_after(&self, n: usize) -> usize {
        assert!(wait_for(|| self.sent_count() >= n));
        n
    }

    fn sent_messages(&self) -> Vec<(TransportAddr, XrceMessage)> {
        self.sent
            .lock()
            .iter()
            .map(|(to, bytes)| (to.clone(), parse_message(bytes).unwrap()))
            .collect()
    }
}

impl XrceTransport for MockTransport {
    fn recv(&self, buf: &mut [u8]) -> Result<Option<(usize, TransportAddr)>, XrceError> {
        let mut inbound = self.inbound.lock();
        if inbound.is_empty() {
            self.inbound_ready.wait_for(&mut inbound, Duration::from_millis(10));
        }
        match inbound.pop_front() {
            Some((from, bytes)) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                Ok(Some((n, from)))
            }
            None => Ok(None),
        }
    }

    fn send(&self, addr: &TransportAddr, data: &[u8]) -> Result<(), XrceError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let mut open = self.gate_open.lock();
        while !*open {
            self.gate.wait(&mut open);
        }
        drop(open);
        self.sent.lock().push((addr.clone(), data.to_vec()));
        Ok(())
    }
}

// -----------------------------------------------------------------------
// Test bridges
// -----------------------------------------------------------------------

/// A bridge that records writes and hands out increasing handles.
#[derive(Default)]
struct RecordingBridge {
    next_handle: Mutex<u32>,
    writes: Mutex<Vec<Vec<u8>>>,
}

impl RecordingBridge {
    fn handle(&self) -> Result<u32, XrceError> {
        let mut h = self.next_handle.lock();
        *h += 1;
        Ok(*h)
    }

    fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().clone()
    }
}

impl ProxyBridge for RecordingBridge {
    fn create_participant(&self, _domain_id: u16) -> Result<u32, XrceError> {
        self.handle()
    }
    fn create_topic(&self, _pid: u32, _name: &str, _tn: &str) -> Result<u32, XrceError> {
        self.handle()
    }
    fn create_publisher(&self, _pid: u32) -> Result<u32, XrceError> {
        self.handle()
    }
    fn create_subscriber(&self, _pid: u32) -> Result<u32, XrceError> {
        self.handle()
    }
    fn create_writer(&self, _pub: u32, _tid: u32) -> Result<u32, XrceError> {
        self.handle()
    }
    fn create_reader(&self, _sub: u32, _tid: u32) -> Result<u32, XrceError> {
        self.handle()
    }
    fn write_data(&self, _wid: u32, data: &[u8]) -> Result<(), XrceError> {
        self.writes.lock().push(data.to_vec());
        Ok(())
    }
    fn read_data(&self, _rid: u32, _max: u16) -> Result<Vec<Vec<u8>>, XrceError> {
        Ok(Vec::new())
    }
    fn delete_entity(&self, _eid: u32) -> Result<(), XrceError> {
        Ok(())
    }
}
