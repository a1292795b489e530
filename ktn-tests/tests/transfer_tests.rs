//! Reliable transfer and the end-to-end echo scenario

mod common;

use common::{echo_lines, spawn_echo, Fixture, SERVER_PORT};
use ktn::{ConnectionState, Delivery, ProtocolConfig, SeqNumber};
use ktn::io::FailureConfig;
use proptest::prelude::*;
use std::thread;

#[test]
fn test_echo_then_server_closes() {
    let established = Fixture::new().establish();
    let ports = established.stack.ports().clone();
    let (mut client, mut server) = (established.client, established.server);

    let serving = thread::spawn(move || {
        let mut received = Vec::new();
        for _ in 0..4 {
            let line = server.receive().unwrap().into_data().unwrap();
            server.send(&line).unwrap();
            received.push(line);
        }
        server.close().unwrap();
        (server, received)
    });

    let mut echoes = Vec::new();
    for line in echo_lines() {
        client.send(&line).unwrap();
        echoes.push(client.receive().unwrap().into_data().unwrap());
    }
    assert_eq!(client.receive().unwrap(), Delivery::EndOfStream);
    assert_eq!(client.state(), ConnectionState::Closed);

    let (server, received) = serving.join().unwrap();
    assert_eq!(received, echo_lines());
    assert_eq!(echoes, echo_lines());
    assert_eq!(server.state(), ConnectionState::Closed);

    drop(established.listener);
    assert_eq!(ports.claimed_count(), 0);
}

#[test]
fn test_echo_then_client_closes() {
    let established = Fixture::new().establish();
    let mut client = established.client;
    let serving = spawn_echo(established.server);

    for line in echo_lines() {
        client.send(&line).unwrap();
        assert_eq!(client.receive().unwrap(), Delivery::Data(line));
    }
    client.close().unwrap();
    assert_eq!(client.state(), ConnectionState::Closed);

    let (server, received) = serving.join().unwrap();
    assert_eq!(received, echo_lines());
    assert_eq!(server.state(), ConnectionState::Closed);

    let stats = client.stats();
    assert_eq!(stats.bytes_sent, stats.bytes_received);
    assert_eq!(stats.packets_invalid, 0);
}

#[test]
fn test_receive_after_end_of_stream_fails() {
    let established = Fixture::new().establish();
    let mut client = established.client;
    let serving = spawn_echo(established.server);

    client.close().unwrap();
    let (mut server, received) = serving.join().unwrap();
    assert!(received.is_empty());
    assert!(server.receive().is_err());
    assert!(server.send("late").is_err());
}

#[test]
fn test_utf8_and_empty_messages() {
    let established = Fixture::new().establish();
    let mut client = established.client;
    let serving = spawn_echo(established.server);

    for line in ["", "grüße, 世界", "tab\tseparated"] {
        client.send(line).unwrap();
        assert_eq!(client.receive().unwrap().into_data().as_deref(), Some(line));
    }
    client.close().unwrap();
    serving.join().unwrap();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    /// Lossless one-way transfer delivers everything in order, and the
    /// expected sequence number advances once per accepted packet
    #[test]
    fn prop_in_order_delivery(messages in prop::collection::vec("[a-zA-Z0-9 ]{0,40}", 1..6)) {
        let established = Fixture::with(ProtocolConfig::fast(), FailureConfig::reliable()).establish();
        let (mut client, mut server) = (established.client, established.server);
        let count = messages.len();

        let expected_before = server.next_expected_seq().unwrap();
        let receiving = thread::spawn(move || {
            let received: Vec<String> = (0..count)
                .map(|_| server.receive().unwrap().into_data().unwrap())
                .collect();
            (server, received)
        });

        for message in &messages {
            client.send(message).unwrap();
        }
        let (server, received) = receiving.join().unwrap();

        prop_assert_eq!(&received, &messages);
        prop_assert_eq!(
            server.next_expected_seq(),
            Some(SeqNumber::new(expected_before.as_raw() + count as u32))
        );
        prop_assert_eq!(server.stats().packets_received, count as u64);
        prop_assert_eq!(client.remote_endpoint(), Some(common::addr(SERVER_PORT)));
    }
}
