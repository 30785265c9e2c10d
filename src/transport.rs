//! Runs a connection on a tokio task.
//!
//! A [`Transport`] spawns one task per connection which exclusively reads
//! and writes the socket and drives key exchange. Application calls are
//! passed to that task as requests, each with its own reply channel.
//! When the task finishes every waiting call fails with
//! [`Error::TransportClosed`].

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use snafu::ResultExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch, Mutex};

use crate::behaviour::{CliBehaviour, ServBehaviour};
use crate::channel::{ChanNum, SessionRequest};
use crate::config::Config;
use crate::conn::{Event, TransportState};
use crate::error;
use crate::hostkey::HostKey;
use crate::kex::{NegotiatedAlgos, SessId};
use crate::runner::Runner;

/// How often time based rekey limits are checked
const REKEY_CHECK_INTERVAL: Duration = Duration::from_secs(1);

const READ_SIZE: usize = 4096;

type Reply<T> = oneshot::Sender<Result<T>>;

#[derive(Debug)]
enum ChanOp {
    Data(Vec<u8>),
    Eof,
    ExitStatus(u32),
    Close,
    Consumed(usize),
}

#[derive(Debug)]
enum Request {
    Auth { username: String, reply: Reply<()> },
    Open { reply: Reply<Channel> },
    ChanRequest { num: ChanNum, req: SessionRequest, reply: Reply<()> },
    Chan { num: ChanNum, op: ChanOp, reply: Option<Reply<()>> },
    Rekey { reply: Reply<bool> },
    Disconnect,
}

/// Per channel events, in arrival order
#[derive(Debug)]
enum ChanEvent {
    Data(Vec<u8>),
    Request(SessionRequest),
    ExitStatus(u32),
    Eof,
    Closed,
    /// The connection ended with the channel still open
    TransportClosed,
}

/// A snapshot of connection state, updated by the connection task.
#[derive(Debug, Clone, PartialEq)]
struct Status {
    state: TransportState,
    negotiated: Option<NegotiatedAlgos>,
    sess_id: Option<SessId>,
    kex_count: u32,
    authed: bool,
}

impl Status {
    fn of(r: &Runner) -> Self {
        Status {
            state: r.state(),
            negotiated: r.negotiated().cloned(),
            sess_id: r.sess_id().cloned(),
            kex_count: r.kex_count(),
            authed: r.is_authed(),
        }
    }

    fn closed(&self) -> bool {
        self.state == TransportState::Closed
    }
}

fn reply<T>(r: Option<Reply<T>>, v: Result<T>) {
    if let Some(r) = r {
        // The caller may have timed out
        let _ = r.send(v);
    }
}

async fn wait<T>(rx: oneshot::Receiver<Result<T>>, timeout: Duration) -> Result<T> {
    match tokio::time::timeout(timeout, rx).await {
        Err(_) => error::Timeout.fail(),
        Ok(Err(_)) => error::TransportClosed.fail(),
        Ok(Ok(r)) => r,
    }
}

/// The connection task's state
struct Task {
    runner: Runner,
    /// For channel handles created here
    reqs: mpsc::UnboundedSender<Request>,
    status: watch::Sender<Status>,
    incoming: mpsc::UnboundedSender<Channel>,

    auth_wait: Option<Reply<()>>,
    open_wait: HashMap<ChanNum, Reply<Channel>>,
    req_wait: HashMap<ChanNum, VecDeque<Reply<()>>>,
    chans: HashMap<ChanNum, mpsc::UnboundedSender<ChanEvent>>,
}

impl Task {
    async fn run<S>(mut self, mut sock: S, mut reqs: mpsc::UnboundedReceiver<Request>)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match self.run_inner(&mut sock, &mut reqs).await {
            Ok(()) => debug!("Connection finished"),
            Err(e) => {
                if self.runner.is_closed() {
                    debug!("Connection ended: {e}");
                } else {
                    warn!("Connection failed: {e}");
                }
            }
        }

        // The runner may have a final disconnect message
        let out = self.runner.take_output();
        if !out.is_empty() {
            let _ = sock.write_all(&out).await;
        }
        let _ = sock.shutdown().await;
        self.shutdown();
    }

    async fn run_inner<S>(
        &mut self,
        sock: &mut S,
        reqs: &mut mpsc::UnboundedReceiver<Request>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.runner.start()?;
        let mut buf = vec![0u8; READ_SIZE];
        let mut tick = tokio::time::interval(REKEY_CHECK_INTERVAL);

        loop {
            let out = self.runner.take_output();
            if !out.is_empty() {
                sock.write_all(&out).await.context(error::Io)?;
            }
            self.publish();
            if self.runner.is_closed() {
                return Ok(());
            }

            tokio::select! {
                r = sock.read(&mut buf) => {
                    let n = r.context(error::Io)?;
                    if n == 0 {
                        debug!("net EOF");
                        return error::TransportClosed.fail();
                    }
                    let r = self.runner.input(&buf[..n]);
                    self.handle_events();
                    r?;
                }
                req = reqs.recv() => {
                    // The task holds a sender, this can't end
                    let req = req.trap()?;
                    self.handle_request(req);
                    self.handle_events();
                }
                _ = tick.tick() => {
                    self.runner.tick()?;
                }
            }
        }
    }

    fn publish(&self) {
        let new = Status::of(&self.runner);
        self.status.send_if_modified(|s| {
            if *s != new {
                *s = new;
                true
            } else {
                false
            }
        });
    }

    fn new_channel(&mut self, num: ChanNum) -> Channel {
        let (tx, rx) = mpsc::unbounded_channel();
        self.chans.insert(num, tx);
        Channel {
            num,
            reqs: self.reqs.clone(),
            events: rx,
            pending: VecDeque::new(),
            requests: VecDeque::new(),
            exit_status: None,
            eof: false,
            closed: false,
            lost: false,
        }
    }

    fn chan_event(&mut self, num: ChanNum, ev: ChanEvent) {
        if let Some(tx) = self.chans.get(&num) {
            if tx.send(ev).is_err() {
                trace!("channel {num} handle is gone");
            }
        }
    }

    fn handle_request(&mut self, req: Request) {
        trace!("request {req:?}");
        match req {
            Request::Auth { username, reply: r } => {
                if self.auth_wait.is_some() {
                    reply(Some(r), Err(Error::BadUsage { msg: "authentication in progress" }));
                    return;
                }
                match self.runner.auth_none(&username) {
                    Ok(()) => self.auth_wait = Some(r),
                    Err(e) => reply(Some(r), Err(e)),
                }
            }
            Request::Open { reply: r } => match self.runner.open_channel() {
                Ok(num) => {
                    self.open_wait.insert(num, r);
                }
                Err(e) => reply(Some(r), Err(e)),
            },
            Request::ChanRequest { num, req, reply: r } => {
                match self.runner.chan_request(num, &req) {
                    Ok(()) => self.req_wait.entry(num).or_default().push_back(r),
                    Err(e) => reply(Some(r), Err(e)),
                }
            }
            Request::Chan { num, op, reply: r } => {
                let res = match op {
                    ChanOp::Data(d) => self.runner.chan_send(num, &d),
                    ChanOp::Eof => self.runner.chan_eof(num),
                    ChanOp::ExitStatus(s) => self.runner.chan_exit_status(num, s),
                    ChanOp::Close => self.runner.chan_close(num),
                    ChanOp::Consumed(l) => self.runner.chan_consumed(num, l),
                };
                if let (Err(e), None) = (&res, &r) {
                    debug!("channel {num} operation failed: {e}");
                }
                reply(r, res);
            }
            Request::Rekey { reply: r } => reply(Some(r), self.runner.rekey()),
            Request::Disconnect => {
                if let Err(e) = self.runner.disconnect() {
                    debug!("disconnect failed: {e}");
                }
            }
        }
    }

    fn handle_events(&mut self) {
        while let Some(ev) = self.runner.next_event() {
            trace!("event {ev:?}");
            match ev {
                Event::KexDone | Event::AuthSuccess => {
                    // Callers may check status as soon as data arrives
                    self.publish();
                    if matches!(ev, Event::AuthSuccess) {
                        reply(self.auth_wait.take(), Ok(()));
                    }
                }
                Event::AuthFailure => {
                    reply(self.auth_wait.take(), error::AuthFailed.fail());
                }
                Event::ChanOpened(num) => {
                    let ch = self.new_channel(num);
                    match self.open_wait.remove(&num) {
                        Some(r) => {
                            // Dropping the unsent channel closes it
                            if r.send(Ok(ch)).is_err() {
                                debug!("open_channel caller is gone, closing {num}");
                            }
                        }
                        None => warn!("Unexpected open confirmation for {num}"),
                    }
                }
                Event::ChanOpenFailed { num, reason } => {
                    reply(self.open_wait.remove(&num), error::ChannelOpenFail { reason }.fail());
                }
                Event::ChanIncoming(num) => {
                    let ch = self.new_channel(num);
                    if self.incoming.send(ch).is_err() {
                        debug!("No acceptor for channel {num}");
                    }
                }
                Event::ChanRequest { num, req } => self.chan_event(num, ChanEvent::Request(req)),
                Event::ChanReqReply { num, success } => {
                    let r = self.req_wait.get_mut(&num).and_then(|q| q.pop_front());
                    let res = if success { Ok(()) } else { error::ChannelRequestFail.fail() };
                    reply(r, res);
                }
                Event::ChanData { num, data } => self.chan_event(num, ChanEvent::Data(data)),
                Event::ChanExitStatus { num, status } => {
                    self.chan_event(num, ChanEvent::ExitStatus(status))
                }
                Event::ChanEof(num) => self.chan_event(num, ChanEvent::Eof),
                Event::ChanClosed(num) => {
                    self.chan_event(num, ChanEvent::Closed);
                    self.chans.remove(&num);
                    for r in self.req_wait.remove(&num).unwrap_or_default() {
                        reply(Some(r), error::ChannelEOF.fail());
                    }
                }
                Event::Disconnected { reason, desc } => {
                    info!("Disconnected by peer, reason {reason} {}", desc.escape_default());
                }
            }
        }
    }

    /// Fails anything still waiting
    fn shutdown(&mut self) {
        reply(self.auth_wait.take(), error::TransportClosed.fail());
        for (_, r) in self.open_wait.drain() {
            reply(Some(r), error::TransportClosed.fail());
        }
        for (_, q) in self.req_wait.drain() {
            for r in q {
                reply(Some(r), error::TransportClosed.fail());
            }
        }
        for (num, tx) in self.chans.drain() {
            if tx.send(ChanEvent::TransportClosed).is_err() {
                trace!("channel {num} handle is gone");
            }
        }
        self.status.send_modify(|s| s.state = TransportState::Closed);
    }
}

/// A SSH connection, client or server.
///
/// Dropping the `Transport` disconnects, open [`Channel`]s stop
/// working once the connection closes.
#[derive(Debug)]
pub struct Transport {
    reqs: mpsc::UnboundedSender<Request>,
    status: watch::Receiver<Status>,
    incoming: Mutex<mpsc::UnboundedReceiver<Channel>>,
}

impl Transport {
    /// Connects as a client over `sock`, returning once the first
    /// key exchange has completed.
    pub async fn start_as_client<S>(
        sock: S,
        config: Config,
        behaviour: impl CliBehaviour + 'static,
        timeout: Duration,
    ) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let runner = Runner::new_client(config, Box::new(behaviour))?;
        Self::start(sock, runner, timeout).await
    }

    /// Runs the server side over `sock`, returning once the first
    /// key exchange has completed.
    ///
    /// `hostkey` may be shared between connections.
    pub async fn start_as_server<S>(
        sock: S,
        config: Config,
        hostkey: Arc<dyn HostKey>,
        behaviour: impl ServBehaviour + 'static,
        timeout: Duration,
    ) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let runner = Runner::new_server(config, Box::new(behaviour), hostkey)?;
        Self::start(sock, runner, timeout).await
    }

    async fn start<S>(sock: S, runner: Runner, timeout: Duration) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(Status::of(&runner));
        let (inc_tx, inc_rx) = mpsc::unbounded_channel();

        let task = Task {
            runner,
            reqs: req_tx.clone(),
            status: status_tx,
            incoming: inc_tx,
            auth_wait: None,
            open_wait: HashMap::new(),
            req_wait: HashMap::new(),
            chans: HashMap::new(),
        };
        tokio::spawn(task.run(sock, req_rx));

        let t = Transport { reqs: req_tx, status: status_rx, incoming: Mutex::new(inc_rx) };

        let mut st = t.status.clone();
        let r = tokio::time::timeout(timeout, st.wait_for(|s| s.kex_count > 0 || s.closed()))
            .await;
        match r {
            Err(_) => {
                debug!("Timed out waiting for key exchange");
                // Dropping t disconnects
                error::Timeout.fail()
            }
            Ok(Err(_)) => error::TransportClosed.fail(),
            Ok(Ok(s)) if s.closed() => error::TransportClosed.fail(),
            Ok(Ok(_)) => Ok(t),
        }
    }

    fn send(&self, req: Request) -> Result<()> {
        self.reqs.send(req).map_err(|_| Error::TransportClosed)
    }

    /// Authenticates with the `"none"` method. Client only.
    ///
    /// Fails with [`Error::AuthFailed`] if the server rejects it, another
    /// attempt may be made.
    pub async fn authenticate_none(&self, username: &str, timeout: Duration) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Request::Auth { username: username.into(), reply: tx })?;
        wait(rx, timeout).await
    }

    /// Opens a session channel. Requires authentication.
    pub async fn open_channel(&self, timeout: Duration) -> Result<Channel> {
        let (tx, rx) = oneshot::channel();
        self.send(Request::Open { reply: tx })?;
        wait(rx, timeout).await
    }

    /// Waits for the peer to open a channel.
    pub async fn accept_channel(&self, timeout: Duration) -> Result<Channel> {
        let mut inc = self.incoming.lock().await;
        match tokio::time::timeout(timeout, inc.recv()).await {
            Err(_) => error::Timeout.fail(),
            Ok(None) => error::TransportClosed.fail(),
            Ok(Some(ch)) => Ok(ch),
        }
    }

    /// Runs a new key exchange, returning once it has completed.
    pub async fn rekey(&self, timeout: Duration) -> Result<()> {
        let before = self.kex_count();
        let (tx, rx) = oneshot::channel();
        self.send(Request::Rekey { reply: tx })?;
        wait(rx, timeout).await?;
        let mut st = self.status.clone();
        let r = match tokio::time::timeout(
            timeout,
            st.wait_for(|s| s.kex_count > before || s.closed()),
        )
        .await
        {
            Err(_) => error::Timeout.fail(),
            Ok(Ok(s)) if !s.closed() => Ok(()),
            _ => error::TransportClosed.fail(),
        };
        r
    }

    /// Disconnects and waits for the connection task to finish.
    pub async fn close(&self, timeout: Duration) -> Result<()> {
        // Already finished if this fails
        let _ = self.send(Request::Disconnect);
        let mut st = self.status.clone();
        let r = match tokio::time::timeout(timeout, st.wait_for(|s| s.closed())).await {
            Err(_) => error::Timeout.fail(),
            // Sender dropped, the task has ended
            Ok(_) => Ok(()),
        };
        r
    }

    /// Whether keys are established and the connection is open
    pub fn is_active(&self) -> bool {
        let s = self.status.borrow();
        s.kex_count > 0 && !s.closed()
    }

    pub fn state(&self) -> TransportState {
        self.status.borrow().state
    }

    /// Algorithms agreed at the latest key exchange
    pub fn negotiated(&self) -> Option<NegotiatedAlgos> {
        self.status.borrow().negotiated.clone()
    }

    /// The exchange hash of the first key exchange
    pub fn session_id(&self) -> Option<Vec<u8>> {
        self.status.borrow().sess_id.as_ref().map(|s| s.to_vec())
    }

    /// Number of completed key exchanges
    pub fn kex_count(&self) -> u32 {
        self.status.borrow().kex_count
    }

    pub fn is_authenticated(&self) -> bool {
        self.status.borrow().authed
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        let _ = self.reqs.send(Request::Disconnect);
    }
}

/// A session channel.
///
/// Received data is read with [`recv()`](Self::recv), reading returns
/// window space to the peer. Dropping the channel closes it.
#[derive(Debug)]
pub struct Channel {
    num: ChanNum,
    reqs: mpsc::UnboundedSender<Request>,
    events: mpsc::UnboundedReceiver<ChanEvent>,
    /// Data received while waiting for something else
    pending: VecDeque<Vec<u8>>,
    requests: VecDeque<SessionRequest>,
    exit_status: Option<u32>,
    eof: bool,
    closed: bool,
    /// Closed by the connection ending rather than by the peer
    lost: bool,
}

impl Channel {
    pub fn num(&self) -> ChanNum {
        self.num
    }

    fn send_req(&self, req: Request) -> Result<()> {
        self.reqs.send(req).map_err(|_| Error::TransportClosed)
    }

    async fn op(&self, op: ChanOp, timeout: Duration) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send_req(Request::Chan { num: self.num, op, reply: Some(tx) })?;
        wait(rx, timeout).await
    }

    /// Returns the next event, or `None` once the peer has closed the channel.
    ///
    /// Fails with [`Error::TransportClosed`] if the connection ended first.
    async fn next(&mut self, timeout: Duration) -> Result<Option<ChanEvent>> {
        if self.lost {
            return error::TransportClosed.fail();
        }
        if self.closed {
            return Ok(None);
        }
        let ev = match tokio::time::timeout(timeout, self.events.recv()).await {
            Err(_) => return error::Timeout.fail(),
            Ok(ev) => ev,
        };
        match ev {
            Some(ChanEvent::Closed) => {
                self.closed = true;
                Ok(None)
            }
            None | Some(ChanEvent::TransportClosed) => {
                self.closed = true;
                self.lost = true;
                error::TransportClosed.fail()
            }
            Some(ChanEvent::ExitStatus(s)) => {
                self.exit_status = Some(s);
                Ok(Some(ChanEvent::ExitStatus(s)))
            }
            Some(ChanEvent::Eof) => {
                self.eof = true;
                Ok(Some(ChanEvent::Eof))
            }
            ev => Ok(ev),
        }
    }

    async fn request(&mut self, req: SessionRequest, timeout: Duration) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send_req(Request::ChanRequest { num: self.num, req, reply: tx })?;
        wait(rx, timeout).await
    }

    /// Requests a shell. Client only.
    pub async fn shell(&mut self, timeout: Duration) -> Result<()> {
        self.request(SessionRequest::Shell, timeout).await
    }

    /// Requests execution of `command`. Client only.
    pub async fn exec(&mut self, command: &str, timeout: Duration) -> Result<()> {
        self.request(SessionRequest::Exec(command.into()), timeout).await
    }

    /// Waits for the client's shell or exec request. Server only.
    pub async fn session_request(&mut self, timeout: Duration) -> Result<SessionRequest> {
        loop {
            if let Some(r) = self.requests.pop_front() {
                return Ok(r);
            }
            match self.next(timeout).await? {
                Some(ChanEvent::Request(r)) => return Ok(r),
                Some(ChanEvent::Data(d)) => self.pending.push_back(d),
                Some(_) => (),
                None => return error::ChannelEOF.fail(),
            }
        }
    }

    /// Receives data, or `None` after the peer sends EOF or closes.
    pub async fn recv(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        loop {
            if let Some(d) = self.pending.pop_front() {
                return Ok(Some(d));
            }
            match self.next(timeout).await? {
                Some(ChanEvent::Data(d)) => {
                    self.op(ChanOp::Consumed(d.len()), timeout).await?;
                    return Ok(Some(d));
                }
                Some(ChanEvent::Request(r)) => self.requests.push_back(r),
                Some(ChanEvent::Eof) | None => return Ok(None),
                Some(_) => (),
            }
        }
    }

    /// Waits for the channel to close, returning the exit status if
    /// the peer sent one. Unread data is kept for `recv()`.
    pub async fn exit_status(&mut self, timeout: Duration) -> Result<Option<u32>> {
        loop {
            match self.next(timeout).await? {
                Some(ChanEvent::Data(d)) => {
                    self.op(ChanOp::Consumed(d.len()), timeout).await?;
                    self.pending.push_back(d)
                }
                Some(ChanEvent::Request(r)) => self.requests.push_back(r),
                Some(_) => (),
                None => return Ok(self.exit_status),
            }
        }
    }

    /// Queues data to send. Data is sent as the peer's window allows.
    pub async fn send(&self, data: &[u8], timeout: Duration) -> Result<()> {
        self.op(ChanOp::Data(data.to_vec()), timeout).await
    }

    pub async fn send_eof(&self, timeout: Duration) -> Result<()> {
        self.op(ChanOp::Eof, timeout).await
    }

    /// Sends an exit status. Server only.
    pub async fn send_exit_status(&self, status: u32, timeout: Duration) -> Result<()> {
        self.op(ChanOp::ExitStatus(status), timeout).await
    }

    /// Closes once queued data is sent
    pub async fn close(mut self, timeout: Duration) -> Result<()> {
        let r = self.op(ChanOp::Close, timeout).await;
        self.closed = true;
        r
    }

    /// Whether the peer has sent EOF
    pub fn is_eof(&self) -> bool {
        self.eof
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.send_req(Request::Chan { num: self.num, op: ChanOp::Close, reply: None });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behaviour::{AllowNone, AuthDecision, NoHostCheck};
    use crate::error::ErrorKind;
    use crate::hostkey::Ed25519HostKey;
    use crate::registry::AlgoOptions;
    use crate::sshlog::init_test_log;
    use crate::sshnames::*;

    use tokio::io::{duplex, split, DuplexStream};

    const T: Duration = Duration::from_secs(10);

    fn hostkey() -> Arc<dyn HostKey> {
        Arc::new(Ed25519HostKey::from_seed(&[4u8; 32]))
    }

    fn null_list_conf() -> Config {
        Config {
            algos: AlgoOptions {
                allow_none_cipher: true,
                allow_none_mac: true,
                ciphers: Some(vec!["none".into(), "aes128-ctr".into()]),
                macs: Some(vec!["none".into(), "hmac-sha2-256".into()]),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    struct RejectBob;

    impl ServBehaviour for RejectBob {
        fn decide(&mut self, username: &str, method: &str) -> AuthDecision {
            match (username, method) {
                ("bob", _) => AuthDecision::Failure,
                (_, "none") => AuthDecision::Success,
                _ => AuthDecision::Failure,
            }
        }
    }

    type Wire = Arc<std::sync::Mutex<Vec<u8>>>;

    fn count(haystack: &[u8], needle: &[u8]) -> usize {
        haystack.windows(needle.len()).filter(|w| *w == needle).count()
    }

    #[tokio::test]
    async fn null_session_hello() {
        init_test_log();
        let (c, s) = duplex(1 << 16);

        let serv = tokio::spawn(async move {
            let t = Transport::start_as_server(s, null_list_conf(), hostkey(), AllowNone, T)
                .await?;
            let mut ch = t.accept_channel(T).await?;
            assert_eq!(ch.session_request(T).await?, SessionRequest::Shell);
            ch.send(b"Hello World...\n", T).await?;
            ch.send_exit_status(0, T).await?;
            ch.send_eof(T).await?;
            ch.close(T).await?;
            Ok::<_, Error>(t)
        });

        let t = Transport::start_as_client(c, null_list_conf(), NoHostCheck, T).await.unwrap();
        assert!(t.is_active());
        let n = t.negotiated().unwrap();
        assert_eq!(n.cipher_c2s, SSH_NAME_NONE);
        assert_eq!(n.cipher_s2c, SSH_NAME_NONE);
        assert_eq!(n.mac_c2s, SSH_NAME_NONE);
        assert_eq!(n.mac_s2c, SSH_NAME_NONE);

        t.authenticate_none("alice", T).await.unwrap();
        assert!(t.is_authenticated());
        let mut ch = t.open_channel(T).await.unwrap();
        ch.shell(T).await.unwrap();

        let mut got = vec![];
        while let Some(d) = ch.recv(T).await.unwrap() {
            got.extend(d);
        }
        assert!(ch.is_eof());
        assert_eq!(got, b"Hello World...\n");
        assert_eq!(ch.exit_status(T).await.unwrap(), Some(0));

        let st = serv.await.unwrap().unwrap();
        assert_eq!(st.session_id(), t.session_id());
        t.close(T).await.unwrap();
        assert_eq!(t.state(), TransportState::Closed);
        assert!(!t.is_active());
    }

    #[tokio::test]
    async fn compressed_session() {
        init_test_log();
        let (c, s) = duplex(1 << 16);
        let mut conf = null_list_conf();
        conf.algos.compression = true;
        let sconf = conf.clone();

        let serv = tokio::spawn(async move {
            let t = Transport::start_as_server(s, sconf, hostkey(), AllowNone, T).await?;
            let mut ch = t.accept_channel(T).await?;
            ch.session_request(T).await?;
            ch.send(&[b'x'; 5000], T).await?;
            ch.send_exit_status(3, T).await?;
            ch.close(T).await?;
            Ok::<_, Error>(t)
        });

        let t = Transport::start_as_client(c, conf, NoHostCheck, T).await.unwrap();
        let n = t.negotiated().unwrap();
        assert_eq!(n.comp_c2s, SSH_NAME_ZLIB_OPENSSH);
        assert_eq!(n.comp_s2c, SSH_NAME_ZLIB_OPENSSH);
        t.authenticate_none("alice", T).await.unwrap();
        let mut ch = t.open_channel(T).await.unwrap();
        ch.shell(T).await.unwrap();

        let mut got = vec![];
        while let Some(d) = ch.recv(T).await.unwrap() {
            got.extend(d);
        }
        assert_eq!(got, [b'x'; 5000]);
        assert_eq!(ch.exit_status(T).await.unwrap(), Some(3));
        let _st = serv.await.unwrap().unwrap();
        t.close(T).await.unwrap();
    }

    #[tokio::test]
    async fn auth_rejected() {
        init_test_log();
        let (c, s) = duplex(1 << 16);

        let serv = tokio::spawn(async move {
            let t = Transport::start_as_server(s, Config::default(), hostkey(), RejectBob, T)
                .await?;
            // ends when the client disconnects
            t.accept_channel(T).await.map(|_| ())
        });

        let t = Transport::start_as_client(c, Config::default(), NoHostCheck, T).await.unwrap();
        let e = t.authenticate_none("bob", T).await.unwrap_err();
        assert!(matches!(e, Error::AuthFailed));
        assert_eq!(e.kind(), ErrorKind::Authentication);
        assert!(!t.is_authenticated());

        let e = t.open_channel(T).await.unwrap_err();
        assert!(matches!(e, Error::NotAuthenticated));
        // the transport is still usable
        assert!(t.is_active());

        t.close(T).await.unwrap();
        let r = serv.await.unwrap();
        assert!(matches!(r, Err(Error::TransportClosed)));
    }

    #[tokio::test]
    async fn rekey_preserves_order() {
        init_test_log();
        let (c, cw) = duplex(1 << 16);
        let (s, sw) = duplex(1 << 16);
        let (cr_w, cw_w) = split(cw);
        let (sr_w, sw_w) = split(sw);
        let (c2s, s2c): (Wire, Wire) = Default::default();
        // reunite the halves through the tap
        tokio::spawn(tap_halves(cr_w, sw_w, c2s.clone()));
        tokio::spawn(tap_halves(sr_w, cw_w, s2c.clone()));

        let mut conf = null_list_conf();
        conf.rekey.bytes = 1024;
        let sconf = conf.clone();

        let serv = tokio::spawn(async move {
            let t = Transport::start_as_server(s, sconf, hostkey(), AllowNone, T).await?;
            let mut ch = t.accept_channel(T).await?;
            ch.session_request(T).await?;
            for i in 0..20u8 {
                ch.send(&[i; 100], T).await?;
            }
            ch.send_exit_status(0, T).await?;
            ch.send_eof(T).await?;
            ch.close(T).await?;
            Ok::<_, Error>(t)
        });

        let t = Transport::start_as_client(c, conf, NoHostCheck, T).await.unwrap();
        let sess_id = t.session_id();
        assert!(sess_id.is_some());
        assert_eq!(t.kex_count(), 1);
        t.authenticate_none("alice", T).await.unwrap();
        let mut ch = t.open_channel(T).await.unwrap();
        ch.exec("cat", T).await.unwrap();

        let mut got = vec![];
        while let Some(d) = ch.recv(T).await.unwrap() {
            got.extend(d);
        }
        let expect: Vec<u8> = (0..20u8).flat_map(|i| [i; 100]).collect();
        assert_eq!(got, expect);
        assert_eq!(ch.exit_status(T).await.unwrap(), Some(0));

        assert!(t.kex_count() > 1);
        assert_eq!(t.session_id(), sess_id);
        let st = serv.await.unwrap().unwrap();
        assert_eq!(st.session_id(), sess_id);
        t.close(T).await.unwrap();

        // with a null cipher each KEXINIT's name lists are readable on the wire
        let s2c = s2c.lock().unwrap();
        assert!(count(&s2c, SSH_NAME_STRICT_KEX_S.as_bytes()) >= 2);
    }

    /// Copies from one stream to another, recording what passes
    async fn tap_halves(
        mut r: tokio::io::ReadHalf<DuplexStream>,
        mut w: tokio::io::WriteHalf<DuplexStream>,
        wire: Wire,
    ) {
        let mut buf = [0u8; 1000];
        loop {
            let n = match r.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            wire.lock().unwrap().extend_from_slice(&buf[..n]);
            if w.write_all(&buf[..n]).await.is_err() {
                break;
            }
        }
        let _ = w.shutdown().await;
    }

    #[tokio::test]
    async fn explicit_rekey() {
        init_test_log();
        let (c, s) = duplex(1 << 16);
        let serv = tokio::spawn(async move {
            let t = Transport::start_as_server(s, Config::default(), hostkey(), AllowNone, T)
                .await?;
            t.rekey(T).await?;
            Ok::<_, Error>(t)
        });
        let t = Transport::start_as_client(c, Config::default(), NoHostCheck, T).await.unwrap();
        let st = serv.await.unwrap().unwrap();
        assert_eq!(st.kex_count(), 2);
        // the client may still be handling the server's NEWKEYS
        tokio::time::timeout(T, async {
            while t.kex_count() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        t.rekey(T).await.unwrap();
        assert_eq!(t.kex_count(), 3);
        assert_eq!(t.session_id(), st.session_id());
        assert_eq!(t.negotiated().unwrap().cipher_c2s, SSH_NAME_CHAPOLY);
    }

    #[tokio::test]
    async fn start_timeout() {
        init_test_log();
        // the peer never answers
        let (c, _s) = duplex(1 << 16);
        let r = Transport::start_as_client(c, Config::default(), NoHostCheck,
            Duration::from_millis(100)).await;
        assert!(matches!(r, Err(Error::Timeout)));
    }

    #[tokio::test]
    async fn peer_gone() {
        init_test_log();
        let (c, s) = duplex(1 << 16);
        let serv = tokio::spawn(async move {
            Transport::start_as_server(s, Config::default(), hostkey(), AllowNone, T).await
        });
        let t = Transport::start_as_client(c, Config::default(), NoHostCheck, T).await.unwrap();
        t.authenticate_none("alice", T).await.unwrap();
        let mut ch = t.open_channel(T).await.unwrap();

        // server transport dropped, disconnecting
        drop(serv.await.unwrap().unwrap());
        let r = ch.recv(T).await;
        assert!(matches!(r, Err(Error::TransportClosed)));
        // and stays that way
        let r = ch.exit_status(T).await;
        assert!(matches!(r, Err(Error::TransportClosed)));
        let r = t.open_channel(T).await;
        assert!(matches!(r, Err(Error::TransportClosed)));
    }

    #[tokio::test]
    async fn local_close_wakes_recv() {
        init_test_log();
        let (c, s) = duplex(1 << 16);
        let serv = tokio::spawn(async move {
            let t = Transport::start_as_server(s, Config::default(), hostkey(), AllowNone, T)
                .await?;
            let ch = t.accept_channel(T).await?;
            // hold the channel open until the client goes
            let r = t.accept_channel(T).await.map(|_| ());
            drop(ch);
            r
        });
        let t = Transport::start_as_client(c, Config::default(), NoHostCheck, T).await.unwrap();
        t.authenticate_none("alice", T).await.unwrap();
        let mut ch = t.open_channel(T).await.unwrap();

        let (r, closed) = tokio::join!(ch.recv(T), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            t.close(T).await
        });
        closed.unwrap();
        assert!(matches!(r, Err(Error::TransportClosed)));
        let r = ch.send(b"late", T).await;
        assert!(matches!(r, Err(Error::TransportClosed)));
        assert!(matches!(serv.await.unwrap(), Err(Error::TransportClosed)));
    }

    #[tokio::test]
    async fn channel_send_timeout() {
        init_test_log();
        let (c, s) = duplex(1 << 16);
        let serv = tokio::spawn(async move {
            Transport::start_as_server(s, Config::default(), hostkey(), AllowNone, T).await
        });
        let t = Transport::start_as_client(c, Config::default(), NoHostCheck, T).await.unwrap();
        let _st = serv.await.unwrap().unwrap();
        t.authenticate_none("alice", T).await.unwrap();
        let ch = t.open_channel(T).await.unwrap();
        // a zero deadline elapses before the task can reply
        let r = ch.send_eof(Duration::ZERO).await;
        assert!(matches!(r, Err(Error::Timeout)));
        t.close(T).await.unwrap();
    }
}
