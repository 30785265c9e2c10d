//! Application hooks called while a connection runs.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use std::sync::Arc;

use snafu::prelude::*;

use crate::channel::ChanNum;
use crate::error;
use crate::hostkey::HostKey;
use crate::packets::{ChannelReqType, PubKey};
use crate::sshnames::*;
use crate::sshwire::TextString;

pub type BhResult<T> = core::result::Result<T, BhError>;

/// At present only a single failure type is implemented
#[derive(Debug, Snafu)]
pub enum BhError {
    Fail,
}

/// The server's answer to a userauth request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    Success,
    /// Rejected, no other methods are offered
    Failure,
    /// Rejected, the client may continue with one of these methods
    MethodsAvailable(Vec<String>),
}

/// Defines application behaviour as a client
pub trait CliBehaviour: Send {
    /// Whether to accept a hostkey for the server. The implementation
    /// should compare the key with the key expected for the hostname used.
    fn valid_hostkey(&mut self, key: &PubKey) -> BhResult<bool>;

    /// Show a banner sent from a server. Arguments are provided
    /// by the server so could be hazardous, `banner` should be escaped with
    /// [`str::escape_default()`](str::escape_default) or similar.
    #[allow(unused)]
    fn show_banner(&mut self, banner: TextString, language: TextString) {}

    /// Provides the disconnect message sent by a server
    ///
    /// Note that this may not be called in cases where the SSH TCP connection
    /// is simply closed.
    #[allow(unused)]
    fn disconnected(&mut self, desc: TextString) {}
}

/// Defines application behaviour as a server
///
/// The response from these methods changes how the connection is handled,
/// for example whether to allow authentication or opening a channel.
pub trait ServBehaviour: Send {
    /// Decides a userauth request. `method` is the name as sent by the client.
    ///
    /// Implementations may need to take care to avoid leaking user existence
    /// based on timing.
    fn decide(&mut self, username: &str, method: &str) -> AuthDecision;

    /// Returns whether a channel of type `kind` may be opened
    fn accept_channel(&mut self, kind: &str) -> bool {
        kind == SSH_CHANNEL_SESSION
    }

    /// Returns whether a channel request succeeds.
    ///
    /// The default accepts `shell`, `pty-req` and `exec`.
    #[allow(unused)]
    fn accept_request(&mut self, chan: ChanNum, req: &ChannelReqType) -> bool {
        matches!(
            req,
            ChannelReqType::Shell | ChannelReqType::Pty(_) | ChannelReqType::Exec(_)
        )
    }

    /// Provides the disconnect message sent by a client
    #[allow(unused)]
    fn disconnected(&mut self, desc: TextString) {}
}

/// Accepts any host key.
///
/// Only suitable for testing, the key is logged.
#[derive(Debug, Default)]
pub struct NoHostCheck;

impl CliBehaviour for NoHostCheck {
    fn valid_hostkey(&mut self, key: &PubKey) -> BhResult<bool> {
        info!("Accepting host key {key:?} without checking");
        Ok(true)
    }

    fn show_banner(&mut self, banner: TextString, _language: TextString) {
        match banner.as_str() {
            Ok(b) => info!("Banner: {}", b.escape_default()),
            Err(_) => warn!("Banner isn't UTF-8"),
        }
    }
}

/// Allows any user with the `"none"` method.
#[derive(Debug, Default)]
pub struct AllowNone;

impl ServBehaviour for AllowNone {
    fn decide(&mut self, username: &str, method: &str) -> AuthDecision {
        if method == SSH_AUTHMETHOD_NONE {
            info!("Allowing user {} without authentication", username.escape_default());
            AuthDecision::Success
        } else {
            AuthDecision::MethodsAvailable(vec![SSH_AUTHMETHOD_NONE.into()])
        }
    }
}

/// Provides either client or server application behaviour
pub(crate) enum Behaviour {
    Client(Box<dyn CliBehaviour>),
    Server { b: Box<dyn ServBehaviour>, hostkey: Arc<dyn HostKey> },
}

impl Behaviour {
    pub fn is_client(&self) -> bool {
        matches!(self, Self::Client(_))
    }

    pub fn client(&mut self) -> Result<&mut dyn CliBehaviour> {
        match self {
            Self::Client(b) => Ok(b.as_mut()),
            _ => error::PacketWrong.fail(),
        }
    }

    pub fn server(&mut self) -> Result<&mut dyn ServBehaviour> {
        match self {
            Self::Server { b, .. } => Ok(b.as_mut()),
            _ => error::PacketWrong.fail(),
        }
    }

    pub fn hostkey(&self) -> Result<&dyn HostKey> {
        match self {
            Self::Server { hostkey, .. } => Ok(hostkey.as_ref()),
            _ => error::PacketWrong.fail(),
        }
    }

    /// Calls either client or server
    pub fn disconnected(&mut self, desc: TextString) {
        match self {
            Self::Client(b) => b.disconnected(desc),
            Self::Server { b, .. } => b.disconnected(desc),
        }
    }
}

impl core::fmt::Debug for Behaviour {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let n = if self.is_client() { "Client" } else { "Server" };
        f.write_str(n)
    }
}
