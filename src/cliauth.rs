//! Client side of userauth, the `"none"` method only.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use crate::behaviour::CliBehaviour;
use crate::conn::Event;
use crate::error;
use crate::packets;
use crate::sshnames::*;
use crate::traffic::TrafSend;

#[derive(Debug, PartialEq)]
enum AuthState {
    Unstarted,
    /// A request is outstanding
    Request,
    Failed,
    Success,
}

#[derive(Debug)]
pub(crate) struct CliAuth {
    state: AuthState,
    username: String,
    /// Set once the server accepts the userauth service
    service_accepted: bool,
}

impl CliAuth {
    pub fn new() -> Self {
        CliAuth { state: AuthState::Unstarted, username: String::new(), service_accepted: false }
    }

    pub fn is_authed(&self) -> bool {
        self.state == AuthState::Success
    }

    /// Sends a `"none"` userauth request for `username`.
    ///
    /// The service request is only sent for the first attempt, the
    /// userauth request follows it without waiting.
    pub fn request_none(&mut self, username: &str, s: &mut TrafSend) -> Result<()> {
        match self.state {
            AuthState::Request => {
                return Err(Error::BadUsage { msg: "authentication already in progress" })
            }
            AuthState::Success => {
                return Err(Error::BadUsage { msg: "already authenticated" })
            }
            AuthState::Unstarted => {
                s.send(packets::ServiceRequest { name: SSH_SERVICE_USERAUTH })?;
            }
            AuthState::Failed => (),
        }

        self.username = username.into();
        s.send(packets::UserauthRequest {
            username: self.username.as_str().into(),
            service: SSH_SERVICE_CONNECTION,
            method: packets::AuthMethod::None,
        })?;
        self.state = AuthState::Request;
        Ok(())
    }

    pub fn service_accept(&mut self, p: &packets::ServiceAccept) -> Result<()> {
        if p.name != SSH_SERVICE_USERAUTH || self.state == AuthState::Unstarted {
            debug!("Unexpected service accept {}", p.name.escape_default());
            return error::SSHProto.fail();
        }
        trace!("Received service accept {}", p.name);
        self.service_accepted = true;
        Ok(())
    }

    pub fn failure(&mut self, p: &packets::UserauthFailure) -> Result<Event> {
        if self.state != AuthState::Request {
            debug!("Unrequested auth failure");
            return error::SSHProto.fail();
        }
        self.state = AuthState::Failed;
        let methods = p.methods.iter().collect::<Vec<_>>().join(",");
        info!("Authentication failed for {}, server allows \"{}\"", self.username, methods);
        Ok(Event::AuthFailure)
    }

    pub fn success(&mut self) -> Result<Event> {
        if self.state != AuthState::Request {
            debug!("Received UserauthSuccess unrequested");
            return error::SSHProto.fail();
        }
        self.state = AuthState::Success;
        info!("Authenticated as {}", self.username);
        Ok(Event::AuthSuccess)
    }

    pub fn banner(&self, p: &packets::UserauthBanner, b: &mut dyn CliBehaviour) -> Result<()> {
        if self.state == AuthState::Success {
            debug!("Ignoring banner after authentication");
            return Ok(());
        }
        b.show_banner(p.message, p.lang);
        Ok(())
    }

    pub fn handle_ext_info(&self, p: &packets::ExtInfo) {
        if let Some(ref algs) = p.server_sig_algs {
            let algs = algs.iter().collect::<Vec<_>>().join(",");
            debug!("Server signature algorithms {algs}");
        }
    }
}
