//! Server side of userauth. The decision is made by [`ServBehaviour::decide`].

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use crate::behaviour::{AuthDecision, ServBehaviour};
use crate::conn::Event;
use crate::error;
use crate::namelist::NameList;
use crate::packets;
use crate::sshnames::*;
use crate::traffic::TrafSend;

#[derive(Debug)]
pub(crate) struct ServAuth {
    pub authed: bool,
    service_accepted: bool,
}

impl ServAuth {
    pub fn new() -> Self {
        Self { authed: false, service_accepted: false }
    }

    /// Only the userauth service can be requested.
    pub fn service_request(
        &mut self,
        p: &packets::ServiceRequest,
        s: &mut TrafSend,
    ) -> Result<()> {
        if p.name == SSH_SERVICE_USERAUTH {
            self.service_accepted = true;
            s.send(packets::ServiceAccept { name: SSH_SERVICE_USERAUTH })
        } else {
            debug!("Client requested unknown service {}", p.name.escape_default());
            error::UnknownMethod { kind: "service" }.fail()
        }
    }

    /// Replies to a userauth request, returning an event on success
    pub fn request(
        &mut self,
        p: packets::UserauthRequest,
        s: &mut TrafSend,
        b: &mut dyn ServBehaviour,
    ) -> Result<Option<Event>> {
        if self.authed {
            // RFC4252 section 5.1, later requests are ignored
            debug!("Ignoring auth request after success");
            return Ok(None);
        }
        if !self.service_accepted {
            debug!("Auth request before service request");
            return error::SSHProto.fail();
        }

        let username = String::from_utf8_lossy(p.username.0);
        let method = p.method.name();

        let decision = if p.service != SSH_SERVICE_CONNECTION {
            debug!("Auth request for unknown service {}", p.service.escape_default());
            AuthDecision::Failure
        } else {
            b.decide(&username, method)
        };
        trace!("auth {} {method}: {decision:?}", username.escape_default());

        match decision {
            AuthDecision::Success => {
                self.authed = true;
                s.send(packets::UserauthSuccess {})?;
                s.auth_done();
                info!("User {} authenticated", username.escape_default());
                Ok(Some(Event::AuthSuccess))
            }
            AuthDecision::Failure => {
                s.send(packets::UserauthFailure { methods: NameList::empty(), partial: false })?;
                Ok(None)
            }
            AuthDecision::MethodsAvailable(m) => {
                let m = m.join(",");
                let methods = NameList::try_from(m.as_str()).map_err(|_| Error::BadName)?;
                s.send(packets::UserauthFailure { methods, partial: false })?;
                Ok(None)
            }
        }
    }
}
