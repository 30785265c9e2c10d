//! Channel table for a connection.
//!
//! Tracks each channel's numbers and windows in both directions, and
//! sequences outgoing data, exit status, EOF and close in the order the
//! application queued them.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use std::collections::VecDeque;

use crate::behaviour::Behaviour;
use crate::config::MAX_CHANNELS;
use crate::conn::Event;
use crate::error;
use crate::packets::{self, ChannelOpen, ChannelOpenType, ChannelReqType, Packet};
use crate::sshnames::*;
use crate::sshwire::{self, BinString};
use crate::traffic::TrafSend;

/// A SSH protocol channel number
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub struct ChanNum(pub u32);

impl core::fmt::Display for ChanNum {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        self.0.fmt(f)
    }
}

/// A session request accepted by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionRequest {
    Shell,
    Exec(String),
}

/// Output queued by the application, sent in order.
#[derive(Debug)]
pub(crate) enum OutItem {
    Data(Vec<u8>),
    ExitStatus(u32),
    Eof,
    Close,
}

/// Per-direction channel variables
#[derive(Debug)]
struct ChanDir {
    /// `u32` rather than `ChanNum` because it can also be used
    /// for the sender-side number
    num: u32,
    max_packet: usize,
    window: usize,
}

#[derive(Debug, PartialEq)]
enum ChanState {
    /// We sent an open, waiting for confirmation
    Opening,
    Normal,
}

#[derive(Debug)]
struct Channel {
    state: ChanState,
    recv: ChanDir,
    /// populated in all states except `Opening`
    send: Option<ChanDir>,

    /// Consumed bytes for the next window adjustment
    pending_adjust: usize,
    full_window: usize,

    out: VecDeque<OutItem>,
    /// Requests sent with want_reply, awaiting success or failure
    pending_replies: usize,

    sent_eof: bool,
    sent_close: bool,
    recv_eof: bool,
    recv_close: bool,
}

impl Channel {
    fn new(num: ChanNum, window: u32, max_packet: u32) -> Self {
        Channel {
            state: ChanState::Opening,
            recv: ChanDir {
                num: num.0,
                max_packet: max_packet as usize,
                window: window as usize,
            },
            send: None,
            pending_adjust: 0,
            full_window: window as usize,
            out: VecDeque::new(),
            pending_replies: 0,
            sent_eof: false,
            sent_close: false,
            recv_eof: false,
            recv_close: false,
        }
    }

    fn num(&self) -> ChanNum {
        ChanNum(self.recv.num)
    }

    /// Remote channel number, fails if channel is in progress opening
    fn send_num(&self) -> Result<u32> {
        Ok(self.send.as_ref().trap()?.num)
    }

    /// Sends as much queued output as the peer's window allows
    fn flush(&mut self, s: &mut TrafSend) -> Result<()> {
        let send = match self.send.as_mut() {
            Some(send) => send,
            // not yet confirmed
            None => return Ok(()),
        };
        let num = send.num;

        while let Some(item) = self.out.front_mut() {
            match item {
                OutItem::Data(d) => {
                    let n = d.len().min(send.window).min(send.max_packet);
                    if n == 0 && !d.is_empty() {
                        trace!("channel {} waiting for window", self.recv.num);
                        break;
                    }
                    if n > 0 {
                        s.send(packets::ChannelData { num, data: BinString(&d[..n]) })?;
                        send.window -= n;
                        d.drain(..n);
                    }
                    if !d.is_empty() {
                        continue;
                    }
                }
                OutItem::ExitStatus(status) => {
                    let req =
                        ChannelReqType::ExitStatus(packets::ExitStatus { status: *status });
                    s.send(packets::ChannelRequest { num, want_reply: false, req })?;
                }
                OutItem::Eof => {
                    if !self.sent_eof {
                        s.send(packets::ChannelEof { num })?;
                        self.sent_eof = true;
                    }
                }
                OutItem::Close => {
                    if !self.sent_close {
                        s.send(packets::ChannelClose { num })?;
                        self.sent_close = true;
                    }
                }
            }
            self.out.pop_front();
        }
        Ok(())
    }

    fn send_close(&mut self, s: &mut TrafSend) -> Result<()> {
        if !self.sent_close {
            // anything not yet sent is discarded
            self.out.clear();
            s.send(packets::ChannelClose { num: self.send_num()? })?;
            self.sent_close = true;
        }
        Ok(())
    }

    /// Records data the application has read, returns a window adjustment
    /// once more than half the window is consumed.
    fn consumed(&mut self, len: usize) -> Result<Option<Packet<'static>>> {
        self.pending_adjust = self.pending_adjust.saturating_add(len);
        if self.pending_adjust > self.full_window / 2 {
            let adjust = self.pending_adjust;
            self.pending_adjust = 0;
            self.recv.window += adjust;
            let num = self.send_num()?;
            Ok(Some(packets::ChannelWindowAdjust { num, adjust: adjust as u32 }.into()))
        } else {
            Ok(None)
        }
    }

    fn is_done(&self) -> bool {
        self.sent_close && self.recv_close
    }
}

pub(crate) struct Channels {
    ch: Vec<Option<Channel>>,
    window: u32,
    max_packet: u32,
}

impl Channels {
    pub fn new(window: u32, max_packet: u32) -> Self {
        let ch = (0..MAX_CHANNELS).map(|_| None).collect();
        Channels { ch, window, max_packet }
    }

    /// Creates a new channel and returns the open packet to send.
    pub fn open(&mut self) -> Result<(ChanNum, Packet<'static>)> {
        let num = self.unused_chan()?;
        let chan = Channel::new(num, self.window, self.max_packet);
        let p = ChannelOpen {
            num: num.0,
            initial_window: chan.recv.window as u32,
            max_packet: chan.recv.max_packet as u32,
            ty: ChannelOpenType::Session,
        }
        .into();
        self.ch[num.0 as usize] = Some(chan);
        Ok((num, p))
    }

    /// Returns a `Channel` for a local number, any state including `Opening`.
    fn get_any_mut(&mut self, num: ChanNum) -> Result<&mut Channel> {
        self.ch
            .get_mut(num.0 as usize)
            // out of range
            .ok_or(error::BadChannel { num }.build())?
            .as_mut()
            // unused channel
            .ok_or(error::BadChannel { num }.build())
    }

    /// Returns an open `Channel`, excludes `Opening`
    fn get_mut(&mut self, num: ChanNum) -> Result<&mut Channel> {
        let ch = self.get_any_mut(num)?;
        match ch.state {
            ChanState::Opening => error::BadChannel { num }.fail(),
            ChanState::Normal => Ok(ch),
        }
    }

    /// Returns the first available channel
    fn unused_chan(&self) -> Result<ChanNum> {
        self.ch
            .iter()
            .position(|c| c.is_none())
            .map(|i| ChanNum(i as u32))
            .ok_or(Error::NoChannels)
    }

    fn remove_if_done(&mut self, num: ChanNum) {
        if let Some(slot) = self.ch.get_mut(num.0 as usize) {
            if slot.as_ref().is_some_and(|c| c.is_done()) {
                trace!("removing channel {num}");
                *slot = None;
            }
        }
    }

    pub fn is_open(&self, num: ChanNum) -> bool {
        matches!(self.ch.get(num.0 as usize), Some(Some(_)))
    }

    /// Queues application output, then sends what the window allows.
    pub fn queue(&mut self, num: ChanNum, item: OutItem, s: &mut TrafSend) -> Result<()> {
        let ch = self.get_mut(num)?;
        let closing = ch.sent_close || ch.out.iter().any(|o| matches!(o, OutItem::Close));
        let eof = ch.sent_eof || ch.out.iter().any(|o| matches!(o, OutItem::Eof));
        match item {
            OutItem::Data(_) | OutItem::Eof if eof || closing => {
                return Err(Error::ChannelEOF)
            }
            OutItem::ExitStatus(_) if closing => return Err(Error::ChannelEOF),
            // closing twice is harmless
            OutItem::Close if closing => return Ok(()),
            _ => (),
        }
        ch.out.push_back(item);
        ch.flush(s)?;
        self.remove_if_done(num);
        Ok(())
    }

    /// Sends a session request with want_reply set
    pub fn request(
        &mut self,
        num: ChanNum,
        req: &SessionRequest,
        s: &mut TrafSend,
    ) -> Result<()> {
        let ch = self.get_mut(num)?;
        if ch.sent_close || ch.recv_close {
            return Err(Error::ChannelEOF);
        }
        let req = match req {
            SessionRequest::Shell => ChannelReqType::Shell,
            SessionRequest::Exec(cmd) => {
                ChannelReqType::Exec(packets::Exec { command: cmd.as_str().into() })
            }
        };
        s.send(packets::ChannelRequest { num: ch.send_num()?, want_reply: true, req })?;
        ch.pending_replies += 1;
        Ok(())
    }

    /// Informs the channel layer that `len` bytes of received data have been read
    /// by the application, so a window adjustment can be sent.
    pub fn consumed(&mut self, num: ChanNum, len: usize, s: &mut TrafSend) -> Result<()> {
        let ch = match self.get_mut(num) {
            Ok(ch) => ch,
            // the channel may have closed in the meantime
            Err(_) => return Ok(()),
        };
        if ch.recv_eof || ch.recv_close {
            return Ok(());
        }
        if let Some(p) = ch.consumed(len)? {
            s.send(p)?;
        }
        Ok(())
    }

    /// Closes every channel, used when the transport is finishing
    pub fn clear(&mut self) -> Vec<ChanNum> {
        let nums = self.ch.iter().flatten().map(|c| c.num()).collect();
        self.ch.iter_mut().for_each(|c| *c = None);
        nums
    }

    /// Incoming packet handling
    ///
    /// Errors affecting a single channel are handled here by closing that
    /// channel, other errors are returned.
    pub fn dispatch(
        &mut self,
        packet: Packet,
        s: &mut TrafSend,
        b: &mut Behaviour,
    ) -> Result<Option<Event>> {
        match self.dispatch_inner(packet, s, b) {
            Err(Error::BadChannel { num }) => {
                warn!("Ignoring bad channel number {num}");
                Ok(None)
            }
            Err(e @ (Error::WindowExceeded { num } | Error::MaxPacketExceeded { num })) => {
                warn!("{e}, closing");
                self.get_mut(num)?.send_close(s)?;
                Ok(None)
            }
            r => r,
        }
    }

    fn dispatch_inner(
        &mut self,
        packet: Packet,
        s: &mut TrafSend,
        b: &mut Behaviour,
    ) -> Result<Option<Event>> {
        let mut ev = None;
        match packet {
            Packet::ChannelOpen(p) => {
                ev = self.dispatch_open(&p, s, b)?;
            }

            Packet::ChannelOpenConfirmation(p) => {
                let max = self.max_packet as usize;
                let ch = self.get_any_mut(ChanNum(p.num))?;
                if ch.state != ChanState::Opening {
                    trace!("Bad channel state");
                    return error::SSHProto.fail();
                }
                ch.send = Some(ChanDir {
                    num: p.sender_num,
                    // we never send more than our own limit
                    max_packet: (p.max_packet as usize).min(max),
                    window: p.initial_window as usize,
                });
                ch.state = ChanState::Normal;
                ch.flush(s)?;
                ev = Some(Event::ChanOpened(ch.num()));
            }

            Packet::ChannelOpenFailure(p) => {
                let num = ChanNum(p.num);
                let ch = self.get_any_mut(num)?;
                if ch.state != ChanState::Opening {
                    trace!("open failure late?");
                    return error::SSHProto.fail();
                }
                debug!("Channel {num} open failed, reason {} {:?}", p.reason, p.desc);
                self.ch[num.0 as usize] = None;
                ev = Some(Event::ChanOpenFailed { num, reason: p.reason });
            }

            Packet::ChannelWindowAdjust(p) => {
                let ch = self.get_mut(ChanNum(p.num))?;
                let send = ch.send.as_mut().trap()?;
                send.window = send.window.saturating_add(p.adjust as usize).min(u32::MAX as usize);
                ch.flush(s)?;
                self.remove_if_done(ChanNum(p.num));
            }

            Packet::ChannelData(p) => {
                let num = ChanNum(p.num);
                let ch = self.get_mut(num)?;
                let len = p.data.0.len();
                if len > ch.recv.max_packet {
                    return error::MaxPacketExceeded { num }.fail();
                }
                if len > ch.recv.window {
                    return error::WindowExceeded { num }.fail();
                }
                ch.recv.window -= len;
                if ch.recv_eof || ch.recv_close {
                    debug!("Ignoring data after EOF on channel {num}");
                } else {
                    ev = Some(Event::ChanData { num, data: p.data.0.to_vec() });
                }
            }

            Packet::ChannelDataExt(p) => {
                // stderr isn't passed to the application, count it as consumed
                let num = ChanNum(p.num);
                let ch = self.get_mut(num)?;
                let len = p.data.0.len();
                if len > ch.recv.max_packet {
                    return error::MaxPacketExceeded { num }.fail();
                }
                if len > ch.recv.window {
                    return error::WindowExceeded { num }.fail();
                }
                ch.recv.window -= len;
                debug!("Ignoring {len} bytes of extended data, code {}", p.code);
                self.consumed(num, len, s)?;
            }

            Packet::ChannelEof(p) => {
                let num = ChanNum(p.num);
                let ch = self.get_mut(num)?;
                if !ch.recv_eof {
                    ch.recv_eof = true;
                    ev = Some(Event::ChanEof(num));
                }
            }

            Packet::ChannelClose(p) => {
                let num = ChanNum(p.num);
                let ch = self.get_mut(num)?;
                ch.recv_close = true;
                ch.send_close(s)?;
                self.remove_if_done(num);
                ev = Some(Event::ChanClosed(num));
            }

            Packet::ChannelRequest(p) => {
                ev = self.dispatch_request(&p, s, b)?;
            }

            Packet::ChannelSuccess(p) => {
                ev = self.request_reply(ChanNum(p.num), true)?;
            }

            Packet::ChannelFailure(p) => {
                ev = self.request_reply(ChanNum(p.num), false)?;
            }

            _ => Error::bug_msg("unreachable")?,
        };
        Ok(ev)
    }

    fn dispatch_open(
        &mut self,
        p: &ChannelOpen<'_>,
        s: &mut TrafSend,
        b: &mut Behaviour,
    ) -> Result<Option<Event>> {
        match self.dispatch_open_inner(p, b) {
            Ok(num) => {
                let ch = self.get_mut(num)?;
                s.send(packets::ChannelOpenConfirmation {
                    num: ch.send_num()?,
                    sender_num: ch.recv.num,
                    initial_window: ch.recv.window as u32,
                    max_packet: ch.recv.max_packet as u32,
                })?;
                Ok(Some(Event::ChanIncoming(num)))
            }
            Err(f) => {
                s.send(packets::ChannelOpenFailure {
                    // ChannelOpen.num is the sender's number
                    num: p.num,
                    reason: f as u32,
                    desc: "".into(),
                    lang: "",
                })?;
                Ok(None)
            }
        }
    }

    fn dispatch_open_inner(
        &mut self,
        p: &ChannelOpen<'_>,
        b: &mut Behaviour,
    ) -> Result<ChanNum, ChanFail> {
        let kind = match &p.ty {
            ChannelOpenType::Session => SSH_CHANNEL_SESSION,
            ChannelOpenType::Unknown(u) => {
                let u = sshwire::try_as_ascii_str(u.0).unwrap_or("(bad)");
                debug!("Rejecting unknown channel type '{}'", u.escape_default());
                return Err(ChanFail::SSH_OPEN_UNKNOWN_CHANNEL_TYPE);
            }
        };

        // only servers accept session opens
        let bserv =
            b.server().map_err(|_| ChanFail::SSH_OPEN_ADMINISTRATIVELY_PROHIBITED)?;
        if !bserv.accept_channel(kind) {
            debug!("Application refused {kind} channel");
            return Err(ChanFail::SSH_OPEN_ADMINISTRATIVELY_PROHIBITED);
        }

        let num = self.unused_chan().map_err(|_| ChanFail::SSH_OPEN_RESOURCE_SHORTAGE)?;
        let mut chan = Channel::new(num, self.window, self.max_packet);
        chan.send = Some(ChanDir {
            num: p.num,
            max_packet: (p.max_packet as usize).min(self.max_packet as usize),
            window: p.initial_window as usize,
        });
        chan.state = ChanState::Normal;
        self.ch[num.0 as usize] = Some(chan);
        Ok(num)
    }

    fn dispatch_request(
        &mut self,
        p: &packets::ChannelRequest,
        s: &mut TrafSend,
        b: &mut Behaviour,
    ) -> Result<Option<Event>> {
        let num = ChanNum(p.num);
        let ch = self.get_mut(num)?;
        let mut ev = None;

        let success = match (&p.req, b.is_client()) {
            (ChannelReqType::ExitStatus(e), true) => {
                ev = Some(Event::ChanExitStatus { num, status: e.status });
                true
            }
            (req, false) => {
                let ok = b.server()?.accept_request(num, req);
                if ok {
                    ev = match req {
                        ChannelReqType::Shell => {
                            Some(Event::ChanRequest { num, req: SessionRequest::Shell })
                        }
                        ChannelReqType::Exec(e) => {
                            let cmd = e.command.as_str()?.to_string();
                            Some(Event::ChanRequest { num, req: SessionRequest::Exec(cmd) })
                        }
                        _ => None,
                    };
                } else {
                    debug!("Refused channel request \"{}\"", p.req.name().escape_default());
                }
                ok
            }
            (req, true) => {
                debug!("Ignoring channel request \"{}\"", req.name().escape_default());
                false
            }
        };

        if p.want_reply && !ch.sent_close {
            let num = ch.send_num()?;
            if success {
                s.send(packets::ChannelSuccess { num })?;
            } else {
                s.send(packets::ChannelFailure { num })?;
            }
        }
        Ok(ev)
    }

    fn request_reply(&mut self, num: ChanNum, success: bool) -> Result<Option<Event>> {
        let ch = self.get_mut(num)?;
        if ch.pending_replies == 0 {
            debug!("Unrequested channel reply on {num}");
            return error::SSHProto.fail();
        }
        ch.pending_replies -= 1;
        Ok(Some(Event::ChanReqReply { num, success }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::behaviour::{AllowNone, AuthDecision, NoHostCheck, ServBehaviour};
    use crate::channel::*;
    use crate::config::OUR_VERSION;
    use crate::encrypt::tests::test_keys;
    use crate::encrypt::{Cipher, Direction, Integ, KeyState};
    use crate::hostkey::Ed25519HostKey;
    use crate::ident::RemoteVersion;
    use crate::packets::ParseContext;
    use crate::sshlog::init_test_log;
    use crate::sshwire::packet_from_bytes;
    use crate::traffic::{TrafIn, TrafOut};

    struct RefuseAll;

    impl ServBehaviour for RefuseAll {
        fn decide(&mut self, _username: &str, _method: &str) -> AuthDecision {
            AuthDecision::Failure
        }
        fn accept_channel(&mut self, _kind: &str) -> bool {
            false
        }
    }

    /// One side of an established connection with only the channel layer
    struct End {
        chans: Channels,
        out: TrafOut,
        inp: TrafIn,
        keys: KeyState,
        rv: RemoteVersion,
        b: Behaviour,
    }

    impl End {
        fn new(b: Behaviour, window: u32, max_packet: u32) -> Self {
            let mut keys = KeyState::new_cleartext();
            keys.configure(Direction::Outbound, test_keys(&Cipher::None, &Integ::None, 1));
            keys.configure(Direction::Inbound, test_keys(&Cipher::None, &Integ::None, 1));
            let mut rv = RemoteVersion::new();
            let mut v = OUR_VERSION.to_vec();
            v.extend_from_slice(b"\r\n");
            rv.consume(&v).unwrap();
            Self {
                chans: Channels::new(window, max_packet),
                out: TrafOut::new(),
                inp: TrafIn::new(),
                keys,
                rv,
                b,
            }
        }

        fn client(window: u32) -> Self {
            Self::new(Behaviour::Client(Box::new(NoHostCheck)), window, 1000)
        }

        fn server(window: u32, max_packet: u32) -> Self {
            let hostkey = Arc::new(Ed25519HostKey::from_seed(&[1u8; 32]));
            Self::new(Behaviour::Server { b: Box::new(AllowNone), hostkey }, window, max_packet)
        }

        /// Delivers our output to `to`, returning the events raised there
        fn pump(&mut self, to: &mut End) -> Vec<Event> {
            let wire = self.out.take_output();
            let mut events = vec![];
            let mut pos = 0;
            while pos < wire.len() {
                pos += to.inp.input(&mut to.keys, &mut to.rv, &wire[pos..]).unwrap();
                if let Some((payload, _)) = to.inp.payload() {
                    let payload = payload.to_vec();
                    to.inp.done_payload();
                    let p = packet_from_bytes(&payload, &ParseContext::new()).unwrap();
                    let mut s = to.out.sender(&mut to.keys);
                    if let Some(e) = to.chans.dispatch(p, &mut s, &mut to.b).unwrap() {
                        events.push(e);
                    }
                }
            }
            events
        }

        fn queue(&mut self, num: ChanNum, item: OutItem) -> Result<()> {
            let mut s = self.out.sender(&mut self.keys);
            self.chans.queue(num, item, &mut s)
        }

        fn consumed(&mut self, num: ChanNum, len: usize) {
            let mut s = self.out.sender(&mut self.keys);
            self.chans.consumed(num, len, &mut s).unwrap();
        }
    }

    /// Returns (client, server, client channel, server channel)
    fn opened(window: u32, max_packet: u32) -> (End, End, ChanNum, ChanNum) {
        let mut cli = End::client(window);
        let mut serv = End::server(window, max_packet);
        let (num, p) = cli.chans.open().unwrap();
        cli.out.sender(&mut cli.keys).send(p).unwrap();
        let ev = cli.pump(&mut serv);
        let snum = match ev.as_slice() {
            [Event::ChanIncoming(n)] => *n,
            e => panic!("unexpected {e:?}"),
        };
        let ev = serv.pump(&mut cli);
        assert!(matches!(ev.as_slice(), [Event::ChanOpened(n)] if *n == num));
        (cli, serv, num, snum)
    }

    fn data_len(ev: &[Event]) -> usize {
        ev.iter()
            .map(|e| match e {
                Event::ChanData { data, .. } => data.len(),
                _ => 0,
            })
            .sum()
    }

    #[test]
    fn window_flow() {
        init_test_log();
        let (mut cli, mut serv, cnum, snum) = opened(100, 40);

        serv.queue(snum, OutItem::Data(vec![b'x'; 250])).unwrap();
        let ev = serv.pump(&mut cli);
        // limited by the client's window, in chunks of the max packet
        assert_eq!(ev.len(), 3);
        assert_eq!(data_len(&ev), 100);

        // half the window isn't enough for an adjustment
        cli.consumed(cnum, 50);
        assert!(cli.pump(&mut serv).is_empty());
        assert!(serv.pump(&mut cli).is_empty());

        cli.consumed(cnum, 50);
        cli.pump(&mut serv);
        let ev = serv.pump(&mut cli);
        assert_eq!(data_len(&ev), 100);

        cli.consumed(cnum, 100);
        cli.pump(&mut serv);
        let ev = serv.pump(&mut cli);
        assert_eq!(data_len(&ev), 50);
    }

    #[test]
    fn close_sequence() {
        init_test_log();
        let (mut cli, mut serv, cnum, snum) = opened(1000, 1000);

        serv.queue(snum, OutItem::Data(b"Hello".to_vec())).unwrap();
        serv.queue(snum, OutItem::ExitStatus(0)).unwrap();
        serv.queue(snum, OutItem::Eof).unwrap();
        serv.queue(snum, OutItem::Close).unwrap();
        assert!(matches!(serv.queue(snum, OutItem::Data(vec![1])), Err(Error::ChannelEOF)));

        let ev = serv.pump(&mut cli);
        match ev.as_slice() {
            [Event::ChanData { data, .. }, Event::ChanExitStatus { status: 0, .. }, Event::ChanEof(_), Event::ChanClosed(_)] => {
                assert_eq!(data, b"Hello")
            }
            e => panic!("unexpected {e:?}"),
        }
        // client replied with its close, both ends are done
        assert!(!cli.chans.is_open(cnum));
        let ev = cli.pump(&mut serv);
        assert!(matches!(ev.as_slice(), [Event::ChanClosed(n)] if *n == snum));
        assert!(!serv.chans.is_open(snum));
    }

    #[test]
    fn half_close() {
        init_test_log();
        let (mut cli, mut serv, cnum, snum) = opened(1000, 1000);
        cli.queue(cnum, OutItem::Eof).unwrap();
        let ev = cli.pump(&mut serv);
        assert!(matches!(ev.as_slice(), [Event::ChanEof(_)]));

        // the other direction still works
        serv.queue(snum, OutItem::Data(b"more".to_vec())).unwrap();
        let ev = serv.pump(&mut cli);
        assert_eq!(data_len(&ev), 4);
        assert!(matches!(cli.queue(cnum, OutItem::Data(vec![1])), Err(Error::ChannelEOF)));
    }

    #[test]
    fn requests() {
        init_test_log();
        let (mut cli, mut serv, cnum, snum) = opened(1000, 1000);
        let mut s = cli.out.sender(&mut cli.keys);
        cli.chans.request(cnum, &SessionRequest::Exec("uptime".into()), &mut s).unwrap();
        let ev = cli.pump(&mut serv);
        match ev.as_slice() {
            [Event::ChanRequest { num, req: SessionRequest::Exec(c) }] => {
                assert_eq!(*num, snum);
                assert_eq!(c, "uptime");
            }
            e => panic!("unexpected {e:?}"),
        }
        let ev = serv.pump(&mut cli);
        assert!(matches!(ev.as_slice(), [Event::ChanReqReply { success: true, .. }]));

        // a reply nobody asked for
        let mut s = serv.out.sender(&mut serv.keys);
        s.send(packets::ChannelSuccess { num: cnum.0 }).unwrap();
        let wire = serv.out.take_output();
        cli.inp.input(&mut cli.keys, &mut cli.rv, &wire).unwrap();
        let payload = cli.inp.payload().unwrap().0.to_vec();
        let p = packet_from_bytes(&payload, &ParseContext::new()).unwrap();
        let mut s = cli.out.sender(&mut cli.keys);
        assert!(matches!(
            cli.chans.dispatch(p, &mut s, &mut cli.b),
            Err(Error::SSHProtoError)
        ));
    }

    #[test]
    fn open_refused() {
        init_test_log();
        let mut cli = End::client(1000);
        let hostkey = Arc::new(Ed25519HostKey::from_seed(&[1u8; 32]));
        let mut serv =
            End::new(Behaviour::Server { b: Box::new(RefuseAll), hostkey }, 1000, 1000);
        let (num, p) = cli.chans.open().unwrap();
        cli.out.sender(&mut cli.keys).send(p).unwrap();
        assert!(cli.pump(&mut serv).is_empty());
        let ev = serv.pump(&mut cli);
        assert!(matches!(
            ev.as_slice(),
            [Event::ChanOpenFailed { num: n, reason: 1 }] if *n == num
        ));
        assert!(!cli.chans.is_open(num));
    }

    #[test]
    fn window_exceeded() {
        init_test_log();
        let (mut cli, mut serv, cnum, snum) = opened(10, 1000);
        // bypass the server's own window accounting
        let mut s = serv.out.sender(&mut serv.keys);
        s.send(packets::ChannelData { num: cnum.0, data: BinString(&[0u8; 11]) }).unwrap();
        assert!(serv.pump(&mut cli).is_empty());
        // client closes the channel in response
        let ev = cli.pump(&mut serv);
        assert!(matches!(ev.as_slice(), [Event::ChanClosed(n)] if *n == snum));
    }

    #[test]
    fn max_packet_exceeded() {
        init_test_log();
        // the client advertises a 1000 byte max packet
        let (mut cli, mut serv, cnum, snum) = opened(5000, 1000);
        let mut s = serv.out.sender(&mut serv.keys);
        s.send(packets::ChannelData { num: cnum.0, data: BinString(&[0u8; 1000]) }).unwrap();
        let ev = serv.pump(&mut cli);
        assert_eq!(data_len(&ev), 1000);

        let mut s = serv.out.sender(&mut serv.keys);
        s.send(packets::ChannelData { num: cnum.0, data: BinString(&[0u8; 1001]) }).unwrap();
        // within the window but dropped
        assert!(serv.pump(&mut cli).is_empty());
        let ev = cli.pump(&mut serv);
        assert!(matches!(ev.as_slice(), [Event::ChanClosed(n)] if *n == snum));
    }

    #[test]
    fn too_many_channels() {
        let mut cli = End::client(1000);
        for _ in 0..MAX_CHANNELS {
            cli.chans.open().unwrap();
        }
        assert!(matches!(cli.chans.open(), Err(Error::NoChannels)));
    }
}
