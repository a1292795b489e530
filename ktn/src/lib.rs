//! KTN - a simplified TCP over unreliable datagrams
//!
//! High-level API: bind connections with a [`Stack`], then drive them with
//! `connect`/`accept`, `send`/`receive` and `close`.
//!
//! ```no_run
//! use ktn::{Delivery, ProtocolConfig, Stack};
//!
//! let stack = Stack::new(ProtocolConfig::default());
//! let mut client = stack.bind("127.0.0.1:8001".parse().unwrap()).unwrap();
//! client.connect("127.0.0.1:8002".parse().unwrap()).unwrap();
//! client.send("Line one").unwrap();
//! if let Delivery::Data(echo) = client.receive().unwrap() {
//!     println!("{}", echo);
//! }
//! client.close().unwrap();
//! ```

pub mod stack;

pub use ktn_io as io;
pub use ktn_protocol as protocol;

// Re-export commonly used types
pub use protocol::{
    Connection, ConnectionError, ConnectionState, ConnectionStats, Delivery, Packet,
    ProtocolConfig, SeqNumber,
};
pub use stack::{Stack, StackError};
