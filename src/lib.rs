//! An SSH transport that can negotiate the `"none"` cipher and MAC.
//!
//! Intended for protocol study. With `"none"` negotiated a direction's
//! traffic is neither encrypted nor authenticated, everything else in the
//! transport (packet framing, sequence numbers, key exchange and rekeying)
//! runs as usual. `"none"` is only offered when [`AlgoOptions`] opts in.
//!
//! [`Transport`] runs a connection on a tokio task, as a client with
//! [`Transport::start_as_client`] or a server with
//! [`Transport::start_as_server`].

#![forbid(unsafe_code)]
// avoids headscratching
#![deny(unused_must_use)]

pub mod sshwire;
pub mod packets;
pub mod sshnames;
pub mod config;
pub mod error;
pub mod random;
pub mod registry;
pub mod hostkey;
pub mod behaviour;

mod activation;
mod channel;
mod cliauth;
mod conn;
mod encrypt;
mod ident;
mod kex;
mod namelist;
mod runner;
mod servauth;
mod ssh_chapoly;
mod sshlog;
mod traffic;
mod transport;

// Application API
pub use behaviour::{AllowNone, AuthDecision, CliBehaviour, NoHostCheck, ServBehaviour};
pub use channel::{ChanNum, SessionRequest};
pub use config::{Config, RekeyLimits};
pub use conn::TransportState;
pub use error::{Error, ErrorKind, Result};
pub use hostkey::{Ed25519HostKey, HostKey};
pub use kex::NegotiatedAlgos;
pub use packets::{PubKey, Signature};
pub use registry::{AlgoCategory, AlgoInfo, AlgoOptions};
pub use sshwire::TextString;
pub use transport::{Channel, Transport};
