//! Represents the state of a SSH connection.
//!
//! [`Conn`] has no I/O of its own. Input payloads are handed to
//! [`Conn::handle_payload`] and responses are written through a
//! [`TrafSend`], `Runner` owns the buffers and keys.

#[allow(unused_imports)]
use {
    crate::error::{Error, ErrorKind, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use std::collections::VecDeque;

use pretty_hex::PrettyHex;

use crate::behaviour::Behaviour;
use crate::channel::{ChanNum, Channels, OutItem, SessionRequest};
use crate::cliauth::CliAuth;
use crate::config::Config;
use crate::error;
use crate::ident::RemoteVersion;
use crate::kex::{Kex, NegotiatedAlgos, SessId};
use crate::packets::{self, Packet, ParseContext};
use crate::registry::AlgorithmSuite;
use crate::servauth::ServAuth;
use crate::sshnames::*;
use crate::sshwire;
use crate::traffic::TrafSend;

/// Transport progress, as seen by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Our version string has not been sent
    NotStarted,
    /// Version strings have been exchanged
    VersionExchanged,
    /// KEXINIT sent or received
    KexInProgress,
    /// Our NEWKEYS is sent, waiting for the peer's
    NewKeysPending,
    /// Both directions are using the latest keys
    Active,
    Closed,
}

/// Something that happened on the connection, for the caller to act on.
// must_use so an event can't be forgotten by accident
#[must_use]
#[derive(Debug)]
pub(crate) enum Event {
    /// A key exchange has completed, both directions use new keys
    KexDone,
    AuthSuccess,
    AuthFailure,
    /// A channel we requested was confirmed
    ChanOpened(ChanNum),
    ChanOpenFailed { num: ChanNum, reason: u32 },
    /// The peer opened a channel, already accepted
    ChanIncoming(ChanNum),
    ChanRequest { num: ChanNum, req: SessionRequest },
    ChanReqReply { num: ChanNum, success: bool },
    ChanData { num: ChanNum, data: Vec<u8> },
    ChanExitStatus { num: ChanNum, status: u32 },
    ChanEof(ChanNum),
    ChanClosed(ChanNum),
    Disconnected { reason: u32, desc: String },
}

/// The core state of a SSH instance.
pub(crate) struct Conn {
    state: TransportState,

    // State of any current Key Exchange
    kex: Kex,

    sess_id: Option<SessId>,

    /// Completed key exchanges
    kex_count: u32,

    /// Strict kex was agreed at the first exchange, applies to rekeys too
    strict_session: bool,

    negotiated: Option<NegotiatedAlgos>,

    suite: AlgorithmSuite,

    config: Config,

    parse_ctx: ParseContext,

    /// Remote version string. Kept for later kexinit rekeying
    pub(crate) remote_version: RemoteVersion,

    cliauth: CliAuth,
    servauth: ServAuth,

    channels: Channels,

    behaviour: Behaviour,

    events: VecDeque<Event>,
}

impl Conn {
    pub fn new(config: Config, behaviour: Behaviour) -> Result<Self> {
        let is_client = behaviour.is_client();
        let suite = AlgorithmSuite::new(is_client, &config.algos)?;
        if suite.offers_none() {
            warn!("\"none\" cipher or MAC is offered, traffic may be unprotected");
        }
        let channels = Channels::new(config.window, config.max_packet);

        Ok(Conn {
            state: TransportState::NotStarted,
            kex: Kex::new(),
            sess_id: None,
            kex_count: 0,
            strict_session: false,
            negotiated: None,
            suite,
            config,
            parse_ctx: ParseContext::new(),
            remote_version: RemoteVersion::new(),
            cliauth: CliAuth::new(),
            servauth: ServAuth::new(),
            channels,
            behaviour,
            events: VecDeque::new(),
        })
    }

    pub fn is_client(&self) -> bool {
        self.behaviour.is_client()
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == TransportState::Closed
    }

    pub fn is_authed(&self) -> bool {
        if self.is_client() {
            self.cliauth.is_authed()
        } else {
            self.servauth.authed
        }
    }

    pub fn sess_id(&self) -> Option<&SessId> {
        self.sess_id.as_ref()
    }

    pub fn kex_count(&self) -> u32 {
        self.kex_count
    }

    pub fn negotiated(&self) -> Option<&NegotiatedAlgos> {
        self.negotiated.as_ref()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn kex_is_idle(&self) -> bool {
        self.kex.is_idle()
    }

    pub fn next_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Sends our version string
    pub fn start(&mut self, s: &mut TrafSend) -> Result<()> {
        if self.state != TransportState::NotStarted {
            return Err(Error::BadUsage { msg: "already started" });
        }
        s.send_version()
    }

    /// Sends any packets required to progress the connection state.
    ///
    /// Called after each chunk of input.
    pub fn progress(&mut self, s: &mut TrafSend) -> Result<()> {
        if self.state == TransportState::NotStarted {
            if let Some(v) = self.remote_version.version() {
                debug!("Remote version {}", String::from_utf8_lossy(v).escape_default());
                self.state = TransportState::VersionExchanged;
                // The peer's KEXINIT may already have started an exchange
                if self.kex.is_idle() {
                    self.kex.send_kexinit(&self.suite, s)?;
                }
                self.state = TransportState::KexInProgress;
                trace!("-> {:?}", self.state);
            }
        }
        Ok(())
    }

    /// Starts a key exchange if none is running.
    ///
    /// Returns `false` if an exchange is already in progress.
    pub fn start_rekey(&mut self, s: &mut TrafSend) -> Result<bool> {
        if self.state != TransportState::Active {
            return Ok(false);
        }
        if !self.kex.is_idle() {
            return Ok(false);
        }
        debug!("Starting rekey");
        self.kex.send_kexinit(&self.suite, s)?;
        self.state = TransportState::KexInProgress;
        Ok(true)
    }

    pub(crate) fn packet<'p>(&self, payload: &'p [u8]) -> Result<Packet<'p>> {
        sshwire::packet_from_bytes(payload, &self.parse_ctx)
    }

    /// Consumes an input payload, `seq` is its sequence number.
    ///
    /// Response packets are sent through `s`, events are queued for
    /// [`next_event`](Self::next_event).
    pub fn handle_payload(&mut self, payload: &[u8], seq: u32, s: &mut TrafSend) -> Result<()> {
        if self.is_closed() {
            return error::TransportClosed.fail();
        }

        match self.packet(payload) {
            Ok(p) => {
                let num = p.message_num() as u8;
                let a = self.dispatch_packet(p, s);
                if let Err(Error::SSHProtoError | Error::PacketWrong) = a {
                    debug!("Error handling {num} packet")
                }
                a
            }
            Err(Error::UnknownPacket { number }) => {
                trace!("Unimplemented packet type {number}");
                if self.kex_count == 0 && self.kex.is_strict() {
                    debug!("Unknown packet during strict kex");
                    return error::SSHProto.fail();
                }
                s.send(packets::Unimplemented { seq })?;
                Ok(())
            }
            Err(e) => {
                debug!("Error decoding packet: {e}");
                trace!("Input:\n{:#?}", payload.hex_dump());
                Err(e)
            }
        }
    }

    /// Check that a packet is received in the correct state
    fn check_packet(&self, p: &Packet) -> Result<()> {
        let r = if self.kex_count == 0 && self.kex.is_strict() {
            // Strict Kex doesn't allow even packets like Ignore or Debug
            match p.category() {
                packets::Category::Kex => Ok(()),
                _ => {
                    debug!("Non-kex packet during strict kex");
                    error::SSHProto.fail()
                }
            }
        } else if !matches!(self.kex, Kex::Idle | Kex::KexInit { .. }) {
            // Normal KEX only allows certain packets
            match p.category() {
                packets::Category::All => Ok(()),
                packets::Category::Kex => Ok(()),
                _ => {
                    debug!("Invalid packet during kex");
                    error::SSHProto.fail()
                }
            }
        } else {
            // No KEX in progress, check for post-auth packets
            match p.category() {
                packets::Category::All => Ok(()),
                packets::Category::Kex => Ok(()),
                packets::Category::Auth => match self.kex_count {
                    0 => error::SSHProto.fail(),
                    _ => Ok(()),
                },
                packets::Category::Sess => match self.is_authed() {
                    true => Ok(()),
                    false => error::SSHProto.fail(),
                },
            }
        };

        if r.is_err() {
            debug!("Received unexpected packet {}", p.message_num() as u8);
            trace!("state is {:?}", self.state);
        }
        r
    }

    fn dispatch_packet(&mut self, packet: Packet, s: &mut TrafSend) -> Result<()> {
        trace!("Incoming {packet:#?}");
        self.check_packet(&packet)?;
        let first_kex = self.kex_count == 0;

        match packet {
            Packet::KexInit(k) => {
                self.kex.handle_kexinit(
                    k,
                    self.is_client(),
                    &self.suite,
                    &self.remote_version,
                    first_kex,
                    self.strict_session,
                    s,
                )?;
                self.state = TransportState::KexInProgress;
            }
            Packet::KexDHInit(p) => {
                if self.is_client() {
                    debug!("Client received KexDHInit");
                    return error::SSHProto.fail();
                }
                let hostkey = self.behaviour.hostkey()?;
                self.kex.handle_kexdhinit(&p, hostkey, &mut self.sess_id, first_kex, s)?;
                self.kex_progressed();
            }
            Packet::KexDHReply(p) => {
                let cli = self.behaviour.client()?;
                self.kex.handle_kexdhreply(&p, cli, &mut self.sess_id, first_kex, s)?;
                self.kex_progressed();
            }
            Packet::NewKeys(_) => {
                let algos = self.kex.handle_newkeys(s)?;
                if first_kex {
                    self.strict_session = algos.strict_kex;
                }
                self.kex_count += 1;
                let n = algos.negotiated();
                info!(
                    "{} key exchange {} complete, cipher {}/{} mac {}/{}",
                    if self.is_client() { "Client" } else { "Server" },
                    self.kex_count,
                    n.cipher_c2s,
                    n.cipher_s2c,
                    n.mac_c2s,
                    n.mac_s2c,
                );
                self.negotiated = Some(n);
                self.state = TransportState::Active;
                self.events.push_back(Event::KexDone);
            }
            Packet::ExtInfo(p) => {
                if self.is_client() {
                    self.cliauth.handle_ext_info(&p);
                } else {
                    trace!("Ignoring ext-info from client");
                }
            }
            Packet::ServiceRequest(p) => {
                if self.is_client() {
                    debug!("Server sent a service request");
                    return error::SSHProto.fail();
                }
                self.servauth.service_request(&p, s)?;
            }
            Packet::ServiceAccept(p) => {
                if !self.is_client() {
                    debug!("Client sent a service accept");
                    return error::SSHProto.fail();
                }
                self.cliauth.service_accept(&p)?;
            }
            Packet::Ignore(_) => {
                // nothing to do
            }
            Packet::Unimplemented(p) => {
                warn!("Received SSH unimplemented message for seq {}", p.seq);
            }
            Packet::DebugPacket(p) => {
                let level = match p.always_display {
                    true => log::Level::Info,
                    false => log::Level::Debug,
                };
                log!(level, "SSH debug message from remote host: {:?}", p.message);
            }
            Packet::Disconnect(p) => {
                // SSH2_DISCONNECT_BY_APPLICATION is normal, sent by openssh client.
                let desc = String::from_utf8_lossy(p.desc.0).into_owned();
                info!("Peer disconnected, reason {}: {}", p.reason, desc.escape_default());
                self.behaviour.disconnected(p.desc);
                self.close_channels();
                self.state = TransportState::Closed;
                self.events.push_back(Event::Disconnected { reason: p.reason, desc });
            }
            Packet::UserauthRequest(p) => {
                let serv = self.behaviour.server().map_err(|_| {
                    debug!("Server sent an auth request");
                    Error::SSHProtoError
                })?;
                if let Some(ev) = self.servauth.request(p, s, serv)? {
                    self.events.push_back(ev);
                }
            }
            Packet::UserauthFailure(p) => {
                if !self.is_client() {
                    debug!("Received UserauthFailure as a server");
                    return error::SSHProto.fail();
                }
                let ev = self.cliauth.failure(&p)?;
                self.events.push_back(ev);
            }
            Packet::UserauthSuccess(_) => {
                if !self.is_client() {
                    debug!("Received UserauthSuccess as a server");
                    return error::SSHProto.fail();
                }
                let ev = self.cliauth.success()?;
                s.auth_done();
                self.events.push_back(ev);
            }
            Packet::UserauthBanner(p) => {
                let cli = self.behaviour.client().map_err(|_| {
                    debug!("Received banner as a server");
                    Error::SSHProtoError
                })?;
                self.cliauth.banner(&p, cli)?;
            }
            Packet::ChannelOpen(_)
            | Packet::ChannelOpenConfirmation(_)
            | Packet::ChannelOpenFailure(_)
            | Packet::ChannelWindowAdjust(_)
            | Packet::ChannelData(_)
            | Packet::ChannelDataExt(_)
            | Packet::ChannelEof(_)
            | Packet::ChannelClose(_)
            | Packet::ChannelRequest(_)
            | Packet::ChannelSuccess(_)
            | Packet::ChannelFailure(_) => {
                if let Some(ev) = self.channels.dispatch(packet, s, &mut self.behaviour)? {
                    self.events.push_back(ev);
                }
            }
            Packet::GlobalRequest(p) => {
                trace!("Got global request {p:?}");
                if p.want_reply {
                    s.send(packets::RequestFailure {})?;
                }
            }
            Packet::RequestSuccess(_p) => {
                trace!("Got global request success")
            }
            Packet::RequestFailure(_) => {
                trace!("Got global request failure")
            }
        };
        Ok(())
    }

    fn kex_progressed(&mut self) {
        if self.kex.is_newkeys_pending() {
            self.state = TransportState::NewKeysPending;
            trace!("-> {:?}", self.state);
        }
    }

    /// Sends a `"none"` userauth request
    pub fn auth_none(&mut self, username: &str, s: &mut TrafSend) -> Result<()> {
        self.check_open()?;
        if !self.is_client() {
            return Err(Error::BadUsage { msg: "server can't authenticate" });
        }
        if self.kex_count == 0 {
            return Err(Error::BadUsage { msg: "key exchange not complete" });
        }
        self.cliauth.request_none(username, s)
    }

    /// Requests a new session channel. Completes with
    /// [`Event::ChanOpened`] or [`Event::ChanOpenFailed`].
    pub fn open_channel(&mut self, s: &mut TrafSend) -> Result<ChanNum> {
        self.check_open()?;
        if !self.is_authed() {
            return error::NotAuthenticated.fail();
        }
        let (num, p) = self.channels.open()?;
        s.send(p)?;
        Ok(num)
    }

    pub fn chan_queue(&mut self, num: ChanNum, item: OutItem, s: &mut TrafSend) -> Result<()> {
        self.check_open()?;
        self.channels.queue(num, item, s)
    }

    pub fn chan_request(
        &mut self,
        num: ChanNum,
        req: &SessionRequest,
        s: &mut TrafSend,
    ) -> Result<()> {
        self.check_open()?;
        self.channels.request(num, req, s)
    }

    /// The application has read `len` bytes of channel data
    pub fn chan_consumed(&mut self, num: ChanNum, len: usize, s: &mut TrafSend) -> Result<()> {
        self.check_open()?;
        self.channels.consumed(num, len, s)
    }

    /// Sends a disconnect message and closes
    pub fn disconnect(
        &mut self,
        reason: DisconnectReason,
        desc: &str,
        s: &mut TrafSend,
    ) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        let r = if self.state == TransportState::NotStarted {
            Ok(())
        } else {
            s.send(packets::Disconnect {
                reason: reason as u32,
                desc: desc.into(),
                lang: "".into(),
            })
        };
        self.close_channels();
        self.state = TransportState::Closed;
        r
    }

    /// Closes after a fatal error, telling the peer why where possible.
    pub fn fail(&mut self, e: &Error, s: &mut TrafSend) {
        if self.is_closed() {
            return;
        }
        error!("Closing connection: {e}");
        let reason = match (e, e.kind()) {
            (Error::UnknownMethod { kind: "service" }, _) => {
                Some(DisconnectReason::SSH_DISCONNECT_SERVICE_NOT_AVAILABLE)
            }
            (Error::AlgoNoMatch { .. }, _) => {
                Some(DisconnectReason::SSH_DISCONNECT_KEY_EXCHANGE_FAILED)
            }
            (_, ErrorKind::Integrity) => Some(DisconnectReason::SSH_DISCONNECT_MAC_ERROR),
            (_, ErrorKind::KeyExchange) => {
                Some(DisconnectReason::SSH_DISCONNECT_KEY_EXCHANGE_FAILED)
            }
            // The peer is gone, nothing to say
            (_, ErrorKind::Closed) => None,
            _ => Some(DisconnectReason::SSH_DISCONNECT_PROTOCOL_ERROR),
        };
        if let Some(reason) = reason {
            if let Err(e) = self.disconnect(reason, "", s) {
                debug!("Failed sending disconnect: {e}");
            }
        }
        self.close_channels();
        self.state = TransportState::Closed;
    }

    fn close_channels(&mut self) {
        for num in self.channels.clear() {
            trace!("dropping channel {num}");
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            error::TransportClosed.fail()
        } else {
            Ok(())
        }
    }
}

impl core::fmt::Debug for Conn {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Conn")
            .field("state", &self.state)
            .field("kex", &self.kex)
            .field("kex_count", &self.kex_count)
            .field("behaviour", &self.behaviour)
            .finish_non_exhaustive()
    }
}
