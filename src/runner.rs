#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use std::sync::Arc;
use std::time::Instant;

use crate::behaviour::{Behaviour, CliBehaviour, ServBehaviour};
use crate::channel::{ChanNum, OutItem, SessionRequest};
use crate::config::Config;
use crate::conn::{Conn, Event, TransportState};
use crate::encrypt::KeyState;
use crate::hostkey::HostKey;
use crate::kex::{NegotiatedAlgos, SessId};
use crate::sshnames::DisconnectReason;
use crate::traffic::{TrafIn, TrafOut, TrafSend};

/// Drives a [`Conn`] from socket bytes.
///
/// Owns the traffic buffers and the current keys. Input is fed with
/// [`input()`](Self::input), output is collected with
/// [`take_output()`](Self::take_output). Any fatal error closes the
/// connection, the caller should write out remaining output then drop the socket.
pub(crate) struct Runner {
    conn: Conn,

    /// Binary packet handling from the network buffer
    traf_in: TrafIn,
    /// Binary packet handling to the network buffer
    traf_out: TrafOut,

    /// Current encryption/integrity keys
    keys: KeyState,
}

impl core::fmt::Debug for Runner {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Runner")
            .field("conn", &self.conn)
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}

impl Runner {
    pub fn new_client(config: Config, b: Box<dyn CliBehaviour>) -> Result<Self> {
        Self::new(config, Behaviour::Client(b))
    }

    pub fn new_server(
        config: Config,
        b: Box<dyn ServBehaviour>,
        hostkey: Arc<dyn HostKey>,
    ) -> Result<Self> {
        Self::new(config, Behaviour::Server { b, hostkey })
    }

    fn new(config: Config, behaviour: Behaviour) -> Result<Self> {
        Ok(Runner {
            conn: Conn::new(config, behaviour)?,
            traf_in: TrafIn::new(),
            traf_out: TrafOut::new(),
            keys: KeyState::new_cleartext(),
        })
    }

    /// Queues our version string for output
    pub fn start(&mut self) -> Result<()> {
        let mut s = self.traf_out.sender(&mut self.keys);
        self.conn.start(&mut s)
    }

    /// Feeds bytes read from the socket, all of `buf` is consumed.
    ///
    /// Events raised are collected with [`next_event()`](Self::next_event).
    pub fn input(&mut self, buf: &[u8]) -> Result<()> {
        let r = self.input_inner(buf);
        self.check_fatal(r)
    }

    fn input_inner(&mut self, mut buf: &[u8]) -> Result<()> {
        if self.conn.is_closed() {
            return Err(Error::TransportClosed);
        }
        loop {
            let n = self.traf_in.input(&mut self.keys, &mut self.conn.remote_version, buf)?;
            buf = &buf[n..];

            let mut s = self.traf_out.sender(&mut self.keys);
            self.conn.progress(&mut s)?;

            let handled = if let Some((payload, seq)) = self.traf_in.payload() {
                let r = self.conn.handle_payload(payload, seq, &mut s);
                self.traf_in.done_payload();
                match r {
                    Err(e) if !e.is_fatal() => {
                        warn!("Error handling packet: {e}");
                    }
                    r => r?,
                }
                if self.conn.is_closed() {
                    // Disconnect received, the rest is discarded
                    return Ok(());
                }
                true
            } else {
                false
            };

            if buf.is_empty() && !handled {
                break;
            }
        }
        self.check_rekey()
    }

    /// Starts a key exchange once a rekey limit is passed.
    fn check_rekey(&mut self) -> Result<()> {
        if self.conn.state() != TransportState::Active || !self.conn.kex_is_idle() {
            return Ok(());
        }
        if self.keys.rekey_needed(&self.conn.config().rekey, Instant::now()) {
            info!("Rekey limit reached");
            let mut s = self.traf_out.sender(&mut self.keys);
            self.conn.start_rekey(&mut s)?;
        }
        Ok(())
    }

    /// Closes the connection on a fatal error
    fn check_fatal<T>(&mut self, r: Result<T>) -> Result<T> {
        if let Err(e) = &r {
            if e.is_fatal() {
                let mut s = self.traf_out.sender(&mut self.keys);
                self.conn.fail(e, &mut s);
            }
        }
        r
    }

    /// Runs a connection operation then checks rekey limits, our own
    /// output counts towards them.
    fn op<T>(&mut self, f: impl FnOnce(&mut Conn, &mut TrafSend) -> Result<T>) -> Result<T> {
        let mut s = self.traf_out.sender(&mut self.keys);
        let r = f(&mut self.conn, &mut s);
        let r = match r {
            Ok(t) => self.check_rekey().map(|_| t),
            e => e,
        };
        self.check_fatal(r)
    }

    pub fn output_pending(&self) -> bool {
        self.traf_out.output_pending()
    }

    /// Returns bytes to be written to the socket
    pub fn take_output(&mut self) -> Vec<u8> {
        self.traf_out.take_output()
    }

    pub fn next_event(&mut self) -> Option<Event> {
        self.conn.next_event()
    }

    /// Periodic check of the time based rekey limit
    pub fn tick(&mut self) -> Result<()> {
        let r = self.check_rekey();
        self.check_fatal(r)
    }

    pub fn auth_none(&mut self, username: &str) -> Result<()> {
        self.op(|c, s| c.auth_none(username, s))
    }

    pub fn open_channel(&mut self) -> Result<ChanNum> {
        self.op(|c, s| c.open_channel(s))
    }

    pub fn chan_send(&mut self, num: ChanNum, data: &[u8]) -> Result<()> {
        self.op(|c, s| c.chan_queue(num, OutItem::Data(data.to_vec()), s))
    }

    pub fn chan_eof(&mut self, num: ChanNum) -> Result<()> {
        self.op(|c, s| c.chan_queue(num, OutItem::Eof, s))
    }

    pub fn chan_exit_status(&mut self, num: ChanNum, status: u32) -> Result<()> {
        self.op(|c, s| c.chan_queue(num, OutItem::ExitStatus(status), s))
    }

    pub fn chan_close(&mut self, num: ChanNum) -> Result<()> {
        self.op(|c, s| c.chan_queue(num, OutItem::Close, s))
    }

    pub fn chan_request(&mut self, num: ChanNum, req: &SessionRequest) -> Result<()> {
        self.op(|c, s| c.chan_request(num, req, s))
    }

    pub fn chan_consumed(&mut self, num: ChanNum, len: usize) -> Result<()> {
        self.op(|c, s| c.chan_consumed(num, len, s))
    }

    /// Starts a key exchange now. Returns `false` if one is already running
    /// or the first exchange hasn't completed.
    pub fn rekey(&mut self) -> Result<bool> {
        self.op(|c, s| c.start_rekey(s))
    }

    pub fn disconnect(&mut self) -> Result<()> {
        let mut s = self.traf_out.sender(&mut self.keys);
        self.conn.disconnect(DisconnectReason::SSH_DISCONNECT_BY_APPLICATION, "", &mut s)
    }

    pub fn state(&self) -> TransportState {
        self.conn.state()
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }

    pub fn is_client(&self) -> bool {
        self.conn.is_client()
    }

    pub fn is_authed(&self) -> bool {
        self.conn.is_authed()
    }

    pub fn sess_id(&self) -> Option<&SessId> {
        self.conn.sess_id()
    }

    pub fn kex_count(&self) -> u32 {
        self.conn.kex_count()
    }

    pub fn negotiated(&self) -> Option<&NegotiatedAlgos> {
        self.conn.negotiated()
    }

    /// Rekey thresholds, for scheduling the time based check
    pub fn config(&self) -> &Config {
        self.conn.config()
    }
}
