//! Shared fixtures for the integration tests

#![allow(dead_code)]

use ktn::io::{FailureConfig, MemoryNetwork};
use ktn::{Connection, Delivery, ProtocolConfig, Stack};
use std::net::SocketAddr;
use std::thread::{self, JoinHandle};

pub const CLIENT_PORT: u16 = 8001;
pub const SERVER_PORT: u16 = 8002;

pub fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

pub fn echo_lines() -> Vec<String> {
    ["Line one", "Line two", "Line three", "Line four"]
        .iter()
        .map(|line| line.to_string())
        .collect()
}

/// A memory network with a bound client and listener
pub struct Fixture {
    pub network: MemoryNetwork,
    pub stack: Stack,
    pub client: Connection,
    pub listener: Connection,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with(ProtocolConfig::fast(), FailureConfig::reliable())
    }

    pub fn with(config: ProtocolConfig, failures: FailureConfig) -> Self {
        let network = MemoryNetwork::new();
        let stack = Stack::new(config).with_failures(failures);
        let client = stack.bind_memory(&network, addr(CLIENT_PORT)).unwrap();
        let listener = stack.bind_memory(&network, addr(SERVER_PORT)).unwrap();
        Fixture {
            network,
            stack,
            client,
            listener,
        }
    }

    /// Run the handshake with `accept` on a background thread
    pub fn establish(self) -> Established {
        let Fixture {
            stack,
            mut client,
            mut listener,
            ..
        } = self;

        let accepting = thread::spawn(move || {
            let server = listener.accept().unwrap();
            (listener, server)
        });
        client.connect(addr(SERVER_PORT)).unwrap();
        let (listener, server) = accepting.join().unwrap();

        Established {
            stack,
            client,
            server,
            listener,
        }
    }
}

/// Both ends of an established connection
pub struct Established {
    pub stack: Stack,
    pub client: Connection,
    pub server: Connection,
    /// Back in CLOSED, still holding the shared port lease
    pub listener: Connection,
}

/// Receive and echo messages until the peer closes; returns what was received
pub fn spawn_echo(mut connection: Connection) -> JoinHandle<(Connection, Vec<String>)> {
    thread::spawn(move || {
        let mut received = Vec::new();
        loop {
            match connection.receive().unwrap() {
                Delivery::Data(line) => {
                    connection.send(&line).unwrap();
                    received.push(line);
                }
                Delivery::EndOfStream => break,
            }
        }
        (connection, received)
    })
}

/// Accept one connection and echo it until the peer closes
///
/// Returns the listener, the served connection and what was received.
pub fn spawn_accept_echo(
    mut listener: Connection,
) -> JoinHandle<(Connection, Connection, Vec<String>)> {
    thread::spawn(move || {
        let server = listener.accept().unwrap();
        let (server, received) = spawn_echo(server).join().unwrap();
        (listener, server, received)
    })
}
