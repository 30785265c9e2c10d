#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use std::collections::VecDeque;

use pretty_hex::PrettyHex;
use zeroize::Zeroize;

use crate::config::OUR_VERSION;
use crate::encrypt::{Direction, DirectionKeys, KeyState};
use crate::encrypt::{SSH_LENGTH_SIZE, SSH_MAX_PACKET_LEN, SSH_PAYLOAD_START};
use crate::ident::{RemoteVersion, CR, LF};
use crate::packets::{self, Category, Packet};
use crate::sshwire;

// Largest MAC or tag of any supported algorithm
const MAX_MAC_LEN: usize = 32;

pub(crate) struct TrafIn {
    /// Accumulated input, a single SSH packet at a time.
    /// Contains ciphertext or cleartext, decrypted in-place.
    buf: Vec<u8>,
    /// Payload after decompression
    inflated: Vec<u8>,
    state: RxState,
}

#[derive(Debug)]
enum RxState {
    /// Awaiting read, buffer is unused
    Idle,
    /// Reading initial encrypted block for packet length. idx > 0.
    ReadInitial { idx: usize },
    /// Reading remainder of encrypted packet
    Read { idx: usize, expect: usize },
    /// Whole encrypted packet has been read
    ReadComplete { len: usize },
    /// Decrypted complete input payload, in `inflated` if it was compressed
    InPayload { len: usize, seq: u32, inflated: bool },
}

impl TrafIn {
    pub fn new() -> Self {
        Self {
            buf: vec![0u8; SSH_LENGTH_SIZE + SSH_MAX_PACKET_LEN + MAX_MAC_LEN],
            inflated: Vec::new(),
            state: RxState::Idle,
        }
    }

    pub fn ready_input(&self) -> bool {
        match self.state {
            RxState::Idle | RxState::ReadInitial { .. } | RxState::Read { .. } => true,
            RxState::ReadComplete { .. } | RxState::InPayload { .. } => false,
        }
    }

    /// Returns the number of bytes consumed.
    ///
    /// At most one packet is decoded per call, the caller must
    /// handle it and call [`done_payload`](Self::done_payload) before more
    /// input is accepted.
    pub fn input(
        &mut self,
        keys: &mut KeyState,
        remote_version: &mut RemoteVersion,
        buf: &[u8],
    ) -> Result<usize, Error> {
        let mut inlen = 0;
        debug_assert!(self.ready_input());
        if remote_version.version().is_none() && matches!(self.state, RxState::Idle)
        {
            // Handle initial version string
            inlen += remote_version.consume(buf)?;
        }
        let buf = &buf[inlen..];

        if remote_version.version().is_some() {
            inlen += self.fill_input(keys, buf)?;
        }
        Ok(inlen)
    }

    /// Called when `payload()` is complete.
    pub fn done_payload(&mut self) {
        if let RxState::InPayload { len, inflated, .. } = self.state {
            if inflated {
                self.inflated.zeroize();
            } else {
                self.buf[SSH_PAYLOAD_START..SSH_PAYLOAD_START + len].zeroize();
            }
            self.state = RxState::Idle;
        }
    }

    /// Returns a reference to the decrypted payload buffer if ready,
    /// and the `seq` of that packet.
    pub fn payload(&self) -> Option<(&[u8], u32)> {
        match self.state {
            RxState::InPayload { len, seq, inflated: true } => {
                Some((&self.inflated[..len], seq))
            }
            RxState::InPayload { len, seq, inflated: false } => {
                let payload = &self.buf[SSH_PAYLOAD_START..SSH_PAYLOAD_START + len];
                Some((payload, seq))
            }
            _ => None,
        }
    }

    fn fill_input(&mut self, keys: &mut KeyState, buf: &[u8]) -> Result<usize, Error> {
        let size_block = keys.size_block_dec();
        // 'r' is the remaining input, a slice that moves along.
        // Used to calculate the size to return
        let mut r = buf;

        // Fill the initial block from either Idle with input,
        // partial initial block
        if let Some(idx) = match self.state {
            RxState::Idle if !r.is_empty() => Some(0),
            RxState::ReadInitial { idx } => Some(idx),
            _ => None,
        } {
            let need = (size_block - idx).clamp(0, r.len());
            let x;
            (x, r) = r.split_at(need);
            let w = &mut self.buf[idx..idx + need];
            w.copy_from_slice(x);
            self.state = RxState::ReadInitial { idx: idx + need }
        }

        // Have enough input now to decrypt the packet length
        if let RxState::ReadInitial { idx } = self.state {
            if idx >= size_block {
                let w = &mut self.buf[..size_block];
                let total_len = keys.decrypt_first_block(w)? as usize;
                if total_len > self.buf.len() {
                    return Err(Error::BigPacket { size: total_len });
                }
                if total_len < size_block {
                    debug!("Packet length {total_len} is below the block size");
                    return Err(Error::SSHProtoError);
                }
                self.state = RxState::Read { idx, expect: total_len }
            }
        }

        // Know expected length, read until the end of the packet.
        // We have already validated that expect_len <= buf_size
        if let RxState::Read { ref mut idx, expect } = self.state {
            let need = (expect - *idx).min(r.len());
            let x;
            (x, r) = r.split_at(need);
            let w = &mut self.buf[*idx..*idx + need];
            w.copy_from_slice(x);
            *idx += need;
            if *idx == expect {
                self.state = RxState::ReadComplete { len: expect }
            }
        }

        if let RxState::ReadComplete { len } = self.state {
            let w = &mut self.buf[..len];
            let seq = keys.recv_seq();
            let payload_len = keys.decrypt(w)?;
            let payload = &self.buf[SSH_PAYLOAD_START..SSH_PAYLOAD_START + payload_len];
            self.state = if keys.decompress(payload, &mut self.inflated)? {
                RxState::InPayload { len: self.inflated.len(), seq, inflated: true }
            } else {
                RxState::InPayload { len: payload_len, seq, inflated: false }
            }
        }

        Ok(buf.len() - r.len())
    }
}

pub(crate) struct TrafOut {
    /// Encrypted packets waiting to be written to the socket
    buf: Vec<u8>,
    /// Held back while a key exchange is running
    deferred: VecDeque<Deferred>,
    kex_lock: bool,
}

enum Deferred {
    Payload(Vec<u8>),
    /// Delayed compression starts after the preceding payloads
    AuthDone,
}

impl TrafOut {
    pub fn new() -> Self {
        Self { buf: Vec::new(), deferred: VecDeque::new(), kex_lock: false }
    }

    /// Serializes and and encrypts a packet to send
    pub(crate) fn send_packet(&mut self, p: Packet, keys: &mut KeyState) -> Result<()> {
        trace!("send_packet {:?}", p.message_num());

        let kexy = matches!(p.category(), Category::All | Category::Kex);
        if !kexy && keys.is_initial(Direction::Outbound) {
            return Error::bug_msg("send cleartext");
        }

        let payload = sshwire::write_ssh_vec(&p)?;
        if self.kex_lock && !kexy {
            trace!("deferring {:?} during kex", p.message_num());
            self.deferred.push_back(Deferred::Payload(payload));
            return Ok(());
        }
        trace!("Sending {p:?}");
        self.push_payload(&payload, keys)
    }

    fn push_payload(&mut self, payload: &[u8], keys: &mut KeyState) -> Result<()> {
        trace!("new {} {:?}", payload.len(), payload.hex_dump());
        let payload = keys.compress(payload)?;
        let payload = payload.as_ref();
        let start = self.buf.len();
        let total = keys.enc_packet_len(payload.len());
        self.buf.resize(start + total, 0);
        let wbuf = &mut self.buf[start..];
        wbuf[SSH_PAYLOAD_START..SSH_PAYLOAD_START + payload.len()].copy_from_slice(payload);

        // Encrypt in place
        let elen = keys.encrypt(payload.len(), wbuf)?;
        debug_assert_eq!(elen, total);
        Ok(())
    }

    /// Holds back non-kex packets until [`kex_unlock`](Self::kex_unlock)
    pub fn kex_lock(&mut self) {
        self.kex_lock = true;
    }

    /// Sends any packets deferred during the key exchange, in order.
    pub fn kex_unlock(&mut self, keys: &mut KeyState) -> Result<()> {
        self.kex_lock = false;
        while let Some(d) = self.deferred.pop_front() {
            match d {
                Deferred::Payload(p) => self.push_payload(&p, keys)?,
                Deferred::AuthDone => keys.auth_done(),
            }
        }
        Ok(())
    }

    /// Starts delayed compression, after any deferred payloads
    pub fn auth_done(&mut self, keys: &mut KeyState) {
        if self.kex_lock {
            self.deferred.push_back(Deferred::AuthDone);
        } else {
            keys.auth_done()
        }
    }

    pub fn is_kex_locked(&self) -> bool {
        self.kex_lock
    }

    pub fn output_pending(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Returns encrypted output to write, leaving the buffer empty
    pub fn take_output(&mut self) -> Vec<u8> {
        core::mem::take(&mut self.buf)
    }

    pub fn send_version(&mut self) -> Result<(), Error> {
        if !self.buf.is_empty() {
            return Err(Error::bug());
        }
        self.buf.extend_from_slice(OUR_VERSION);
        self.buf.extend_from_slice(&[CR, LF]);
        Ok(())
    }

    pub fn sender<'s>(&'s mut self, keys: &'s mut KeyState) -> TrafSend<'s> {
        TrafSend { out: self, keys }
    }
}

/// Convenience to pass TrafOut with keys
pub(crate) struct TrafSend<'s> {
    out: &'s mut TrafOut,
    keys: &'s mut KeyState,
}

impl TrafSend<'_> {
    pub fn send<'p, P: Into<packets::Packet<'p>>>(&mut self, p: P) -> Result<()> {
        self.out.send_packet(p.into(), self.keys)
    }

    pub fn send_version(&mut self) -> Result<(), Error> {
        self.out.send_version()
    }

    /// Takes new keys into use for a direction.
    pub fn configure(&mut self, dir: Direction, keys: DirectionKeys) {
        self.keys.configure(dir, keys)
    }

    pub fn reset_seq(&mut self, dir: Direction) {
        self.keys.reset_seq(dir)
    }

    /// Starts `zlib@openssh.com` compression once userauth succeeds
    pub fn auth_done(&mut self) {
        self.out.auth_done(self.keys)
    }

    pub fn recv_seq(&self) -> u32 {
        self.keys.recv_seq()
    }

    pub fn send_seq(&self) -> u32 {
        self.keys.send_seq()
    }

    pub fn kex_lock(&mut self) {
        self.out.kex_lock()
    }

    pub fn kex_unlock(&mut self) -> Result<()> {
        self.out.kex_unlock(self.keys)
    }

    pub fn is_kex_locked(&self) -> bool {
        self.out.is_kex_locked()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use crate::encrypt::tests::test_keys;
    use crate::encrypt::{Cipher, Compress, Integ};
    use crate::ident::RemoteVersion;
    use crate::packets::*;
    use crate::sshlog::*;
    use crate::sshwire::{packet_from_bytes, BinString};
    use crate::traffic::*;

    struct Link {
        out: TrafOut,
        inp: TrafIn,
        tx_keys: KeyState,
        rx_keys: KeyState,
        rv: RemoteVersion,
    }

    impl Link {
        fn new() -> Self {
            Self {
                out: TrafOut::new(),
                inp: TrafIn::new(),
                tx_keys: KeyState::new_cleartext(),
                rx_keys: KeyState::new_cleartext(),
                rv: RemoteVersion::new(),
            }
        }

        /// Feeds pending output to the input side `chunk` bytes at a time,
        /// returning the message numbers received.
        fn pump(&mut self, chunk: usize) -> Vec<u8> {
            let wire = self.out.take_output();
            let mut r = &wire[..];
            let mut got = vec![];
            while !r.is_empty() {
                let n = chunk.min(r.len());
                let l = self.inp.input(&mut self.rx_keys, &mut self.rv, &r[..n]).unwrap();
                r = &r[l..];
                if let Some((payload, _seq)) = self.inp.payload() {
                    let p = packet_from_bytes(payload, &Default::default()).unwrap();
                    got.push(p.message_num() as u8);
                    self.inp.done_payload();
                }
            }
            got
        }
    }

    #[test]
    fn version_then_packets() {
        init_test_log();
        for chunk in [1, 3, 7, 1000] {
            let mut l = Link::new();
            l.out.send_version().unwrap();
            let mut s = l.out.sender(&mut l.tx_keys);
            s.send(Ignore { data: BinString(b"hello") }).unwrap();
            s.send(NewKeys {}).unwrap();
            assert_eq!(l.pump(chunk), [2, 21]);
            assert_eq!(l.rv.version().unwrap(), crate::config::OUR_VERSION);
        }
    }

    #[test]
    #[should_panic(expected = "send cleartext")]
    fn cleartext_session_packet_refused() {
        let mut l = Link::new();
        let mut s = l.out.sender(&mut l.tx_keys);
        let _ = s.send(ChannelEof { num: 1 });
    }

    #[test]
    fn deferred_during_kex() {
        init_test_log();
        let mut l = Link::new();
        l.out.send_version().unwrap();
        // after a first kex, even with "none" keys
        l.tx_keys.configure(Direction::Outbound, test_keys(&Cipher::None, &Integ::None, 1));
        l.rx_keys.configure(Direction::Inbound, test_keys(&Cipher::None, &Integ::None, 1));

        let mut s = l.out.sender(&mut l.tx_keys);
        s.kex_lock();
        s.send(ChannelEof { num: 1 }).unwrap();
        s.send(KexDHInit { q_c: BinString(&[9u8; 32]) }).unwrap();
        s.send(ChannelClose { num: 1 }).unwrap();
        assert_eq!(l.pump(5), [30]);

        let mut s = l.out.sender(&mut l.tx_keys);
        s.send(NewKeys {}).unwrap();
        s.kex_unlock().unwrap();
        assert_eq!(l.pump(64), [21, 96, 97]);
    }

    #[test]
    fn compressed_link() {
        init_test_log();
        let mut l = Link::new();
        l.out.send_version().unwrap();
        let mut keys = test_keys(&Cipher::Aes128Ctr, &Integ::HmacSha256, 2);
        keys.comp = Compress::ZlibOpenSsh;
        l.tx_keys.configure(Direction::Outbound, keys);
        let mut keys = test_keys(&Cipher::Aes128Ctr, &Integ::HmacSha256, 2);
        keys.comp = Compress::ZlibOpenSsh;
        l.rx_keys.configure(Direction::Inbound, keys);

        // delayed until auth, this goes uncompressed
        let mut s = l.out.sender(&mut l.tx_keys);
        s.send(Ignore { data: BinString(&[b'a'; 500]) }).unwrap();
        assert!(l.out.buf.len() > 500);
        assert_eq!(l.pump(7), [2]);

        l.tx_keys.auth_done();
        l.rx_keys.auth_done();

        let data = [b'z'; 2000];
        let mut s = l.out.sender(&mut l.tx_keys);
        for _ in 0..3 {
            s.send(ChannelData { num: 0, data: BinString(&data) }).unwrap();
        }
        let wire = l.out.take_output();
        // repetitive data shrinks
        assert!(wire.len() < 1000);
        l.out.buf = wire;
        assert_eq!(l.pump(13), [94, 94, 94]);
    }

    #[test]
    fn zlib_starts_at_newkeys() {
        init_test_log();
        let mut l = Link::new();
        l.out.send_version().unwrap();
        let mut keys = test_keys(&Cipher::None, &Integ::None, 2);
        keys.comp = Compress::Zlib;
        l.tx_keys.configure(Direction::Outbound, keys);
        let mut keys = test_keys(&Cipher::None, &Integ::None, 2);
        keys.comp = Compress::Zlib;
        l.rx_keys.configure(Direction::Inbound, keys);

        let mut s = l.out.sender(&mut l.tx_keys);
        s.send(Ignore { data: BinString(&[b'q'; 400]) }).unwrap();
        // with a null cipher, the plain text would be visible
        assert!(l.out.buf.len() < 200);
        assert!(!l.out.buf.windows(50).any(|w| w.iter().all(|c| *c == b'q')));
        assert_eq!(l.pump(3), [2]);
    }

    #[test]
    fn oversized_length_rejected() {
        let mut l = Link::new();
        l.rv.consume(b"SSH-2.0-x\r\n").unwrap();
        let mut wire = [0u8; 8];
        wire[..4].copy_from_slice(&0x7fff_0000u32.to_be_bytes());
        let r = l.inp.input(&mut l.rx_keys, &mut l.rv, &wire);
        assert!(matches!(r, Err(Error::BigPacket { .. })));
    }
}
