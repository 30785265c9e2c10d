//! Handles encryption/decryption and framing a payload in a SSH packet.
//!
//! Each direction has its own [`DirectionState`]. A null cipher or MAC is
//! a normal state here, it still pads to the minimum block size and counts
//! sequence numbers.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use aes::cipher::{BlockSizeUser, KeyIvInit, KeySizeUser, StreamCipher};
use core::fmt;
use std::borrow::Cow;
use core::fmt::Debug;
use core::num::Wrapping;
use std::time::Instant;

use flate2::{FlushCompress, FlushDecompress, Status};
use hmac::Mac;
use sha2::Digest as Sha2DigestForTrait;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::config::RekeyLimits;
use crate::random;
use crate::ssh_chapoly::SSHChaPoly;
use crate::sshnames::*;

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;
type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;
type HmacSha256 = hmac::Hmac<sha2::Sha256>;

// RFC4253 Section 6. Including length u32 length field, excluding MAC
const SSH_MIN_PACKET_SIZE: usize = 16;
const SSH_MIN_PADLEN: usize = 4;
pub const SSH_MIN_BLOCK: usize = 8;
pub const SSH_LENGTH_SIZE: usize = 4;
pub const SSH_PAYLOAD_START: usize = SSH_LENGTH_SIZE + 1;

/// Largest packet accepted from a peer, excluding the length field and MAC.
///
/// RFC4253 requires at least 35000.
pub const SSH_MAX_PACKET_LEN: usize = 72 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Packets we receive
    Inbound,
    /// Packets we send
    Outbound,
}

/// Per-direction cryptographic state and counters.
#[derive(Debug)]
pub(crate) struct DirectionState {
    keys: DirectionKeys,
    // Packet sequence numbers don't reset with rekeying, except
    // for strict kex.
    seq: Wrapping<u32>,
    // Counted since the last `configure()`
    bytes: u64,
    packets: u64,
    since: Instant,
    // Set once keys from a key exchange are in use, even "none"
    activated: bool,
    // Restarts with each configure()
    zstream: Option<ZStream>,
}

impl DirectionState {
    fn new_cleartext() -> Self {
        Self {
            keys: DirectionKeys::cleartext(),
            seq: Wrapping(0),
            bytes: 0,
            packets: 0,
            since: Instant::now(),
            activated: false,
            zstream: None,
        }
    }

    fn account(&mut self, wire_len: usize) {
        self.seq += 1;
        self.packets += 1;
        self.bytes += wire_len as u64;
    }

    fn over_limit(&self, limits: &RekeyLimits, now: Instant) -> bool {
        self.bytes >= limits.bytes
            || self.packets >= limits.packets
            || now.saturating_duration_since(self.since) >= limits.time
    }
}

/// Stateful keys for both directions, a single instance
/// is kept for the entire session.
#[derive(Debug)]
pub(crate) struct KeyState {
    enc: DirectionState,
    dec: DirectionState,
    // Userauth has succeeded, for delayed compression
    authed: bool,
}

impl KeyState {
    /// A brand new `KeyState` with no encryption, zero sequence numbers
    pub fn new_cleartext() -> Self {
        KeyState {
            enc: DirectionState::new_cleartext(),
            dec: DirectionState::new_cleartext(),
            authed: false,
        }
    }

    fn dir_mut(&mut self, dir: Direction) -> &mut DirectionState {
        match dir {
            Direction::Inbound => &mut self.dec,
            Direction::Outbound => &mut self.enc,
        }
    }

    fn dir(&self, dir: Direction) -> &DirectionState {
        match dir {
            Direction::Inbound => &self.dec,
            Direction::Outbound => &self.enc,
        }
    }

    /// Replaces the keys for one direction.
    ///
    /// The caller only does this between whole packets. Sequence numbers
    /// carry over, rekey counters restart.
    pub fn configure(&mut self, dir: Direction, keys: DirectionKeys) {
        trace!("configure {dir:?} {:?} {:?}", keys.cipher, keys.integ);
        let d = self.dir_mut(dir);
        d.keys = keys;
        d.bytes = 0;
        d.packets = 0;
        d.since = Instant::now();
        d.activated = true;
        d.zstream = None;
        self.start_compression(dir);
    }

    fn start_compression(&mut self, dir: Direction) {
        let authed = self.authed;
        let d = self.dir_mut(dir);
        let start = match d.keys.comp {
            Compress::None => false,
            Compress::Zlib => true,
            Compress::ZlibOpenSsh => authed,
        };
        if start && d.zstream.is_none() {
            debug!("{dir:?} compression {} started", d.keys.comp.name());
            d.zstream = Some(ZStream::new(dir));
        }
    }

    /// Userauth has succeeded, starting any delayed compression.
    ///
    /// Called between packets. For a server, after sending the success reply.
    pub fn auth_done(&mut self) {
        self.authed = true;
        self.start_compression(Direction::Outbound);
        self.start_compression(Direction::Inbound);
    }

    /// Compresses an outbound payload, if compression is running.
    pub fn compress<'p>(&mut self, payload: &'p [u8]) -> Result<Cow<'p, [u8]>> {
        match &mut self.enc.zstream {
            Some(ZStream::Deflate(z)) => Ok(Cow::Owned(deflate(z, payload)?)),
            Some(ZStream::Inflate(_)) => Err(Error::bug()),
            None => Ok(Cow::Borrowed(payload)),
        }
    }

    /// Decompresses an inbound payload into `out`. Returns false
    /// if compression isn't running, leaving `out` untouched.
    pub fn decompress(&mut self, payload: &[u8], out: &mut Vec<u8>) -> Result<bool> {
        match &mut self.dec.zstream {
            Some(ZStream::Inflate(z)) => {
                inflate(z, payload, out)?;
                Ok(true)
            }
            Some(ZStream::Deflate(_)) => Err(Error::bug()),
            None => Ok(false),
        }
    }

    /// Strict kex resets the sequence number after each NEWKEYS.
    pub fn reset_seq(&mut self, dir: Direction) {
        self.dir_mut(dir).seq = Wrapping(0);
    }

    pub fn recv_seq(&self) -> u32 {
        self.dec.seq.0
    }

    pub fn send_seq(&self) -> u32 {
        self.enc.seq.0
    }

    /// Whether either direction has crossed a rekey threshold.
    pub fn rekey_needed(&self, limits: &RekeyLimits, now: Instant) -> bool {
        self.enc.over_limit(limits, now) || self.dec.over_limit(limits, now)
    }

    /// Returns true before the first key exchange has completed for a direction.
    pub fn is_initial(&self, dir: Direction) -> bool {
        !self.dir(dir).activated
    }

    /// Returns true when a direction has neither a cipher nor a MAC.
    pub fn is_null(&self, dir: Direction) -> bool {
        let k = &self.dir(dir).keys;
        k.cipher.is_null() && k.integ.is_null()
    }

    /// Decrypts the first block in the buffer, returning the length.
    pub fn decrypt_first_block(&mut self, buf: &mut [u8]) -> Result<u32, Error> {
        self.dec.keys.decrypt_first_block(buf, self.dec.seq.0)
    }

    /// Decrypt bytes 4 onwards of the buffer and validate AEAD Tag or MAC.
    /// Ensures that the packet meets minimum length.
    ///
    /// The sequence number increments even on failure, the session
    /// is finished in that case anyway.
    pub fn decrypt(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let e = self.dec.keys.decrypt(buf, self.dec.seq.0);
        self.dec.account(buf.len());
        e
    }

    /// `buf` is the entire output buffer to encrypt in place.
    /// payload_len is the length of the payload portion
    /// This is stateful, updating the sequence number.
    pub fn encrypt(
        &mut self,
        payload_len: usize,
        buf: &mut [u8],
    ) -> Result<usize, Error> {
        let l = self.enc.keys.encrypt(payload_len, buf, self.enc.seq.0)?;
        self.enc.account(l);
        Ok(l)
    }

    pub fn size_block_dec(&self) -> usize {
        self.dec.keys.cipher.size_block()
    }

    /// Returns the total wire size for a payload of `payload_len`
    pub fn enc_packet_len(&self, payload_len: usize) -> usize {
        let k = &self.enc.keys;
        SSH_PAYLOAD_START
            + payload_len
            + k.calc_encrypt_pad(payload_len)
            + k.integ.size_out()
    }

    /// Returns the maximum payload that can fit in an available buffer
    /// after header, encryption, padding, mac
    pub fn max_enc_payload(&self, total_avail: usize) -> usize {
        let keys = &self.enc.keys;
        // mac is independent of the rest
        let total_avail = total_avail.saturating_sub(keys.integ.size_out());

        let overhead = SSH_LENGTH_SIZE + 1 + SSH_MIN_PADLEN;
        let mut space = total_avail;

        // multiple of block length
        let enc_len = if keys.length_in_clear() {
            total_avail.saturating_sub(SSH_LENGTH_SIZE)
        } else {
            total_avail
        };

        // round down to block size
        let extra_block = enc_len % keys.cipher.size_block();
        if extra_block != 0 {
            space = space.saturating_sub(extra_block);
        }

        space = space.saturating_sub(overhead);

        if space + overhead < SSH_MIN_PACKET_SIZE {
            0
        } else {
            space
        }
    }
}

/// The keyed cipher, MAC and compression for one direction.
#[derive(Debug)]
pub(crate) struct DirectionKeys {
    pub cipher: CipherKey,
    pub integ: IntegKey,
    pub comp: Compress,
}

impl DirectionKeys {
    pub fn cleartext() -> Self {
        Self {
            cipher: CipherKey::NoCipher,
            integ: IntegKey::NoInteg,
            comp: Compress::None,
        }
    }

    /// AEAD and ETM modes leave the length outside the block alignment
    fn length_in_clear(&self) -> bool {
        self.cipher.is_aead() || self.integ.is_etm()
    }

    /// Decrypts the first block in the buffer, returning the length of the
    /// total SSH packet (including length+mac) which is calculated
    /// from the decrypted first 4 bytes.
    /// Whether bytes `buf[4..block_size]` are decrypted depends on the cipher, they may be
    /// handled later by [`decrypt`]. Bytes `buf[0..4]` may be left unmodified.
    fn decrypt_first_block(
        &mut self,
        buf: &mut [u8],
        seq: u32,
    ) -> Result<u32, Error> {
        if buf.len() < self.cipher.size_block() {
            return Err(Error::bug());
        }

        let etm = self.integ.is_etm();
        let len = match &mut self.cipher {
            CipherKey::ChaPoly(k) => k.packet_length(seq, buf)?,
            CipherKey::Aes256Ctr(a) if !etm => {
                a.apply_keystream(&mut buf[..16]);
                read_length(buf)
            }
            CipherKey::Aes128Ctr(a) if !etm => {
                a.apply_keystream(&mut buf[..16]);
                read_length(buf)
            }
            _ => read_length(buf),
        };

        if len as usize > SSH_MAX_PACKET_LEN {
            return Err(Error::BigPacket { size: len as usize });
        }

        let total_len = len
            .checked_add((SSH_LENGTH_SIZE + self.integ.size_out()) as u32)
            .ok_or(Error::BadDecrypt)?;

        Ok(total_len)
    }

    /// Decrypt the whole packet buffer and validate AEAD Tag or MAC.
    /// Returns the payload length.
    /// Ensures that the packet meets minimum length.
    /// The first block_size bytes may have been already decrypted by
    /// [`decrypt_first_block`] depending on the cipher.
    fn decrypt(&mut self, buf: &mut [u8], seq: u32) -> Result<usize, Error> {
        let size_block = self.cipher.size_block();
        let size_integ = self.integ.size_out();

        if buf.len() < size_block + size_integ {
            debug!("Bad packet, {} smaller than block size", buf.len());
            return Err(Error::SSHProtoError);
        }
        if buf.len() < SSH_MIN_PACKET_SIZE + size_integ {
            debug!("Bad packet, {} smaller than min packet size", buf.len());
            return Err(Error::SSHProtoError);
        }
        // "MUST be a multiple of the cipher block size".
        // encrypted length for aead and etm doesn't include the length prefix.
        let sublength =
            if self.length_in_clear() { SSH_LENGTH_SIZE } else { 0 };
        let len = buf.len() - size_integ - sublength;

        if len % size_block != 0 {
            debug!("Bad packet, not multiple of block size");
            return Err(Error::SSHProtoError);
        }

        let (data, mac) = buf.split_at_mut(buf.len() - size_integ);

        debug_assert!(data.len() >= size_block);

        // ETM is checked over the ciphertext before anything else
        if let IntegKey::HmacSha256Etm(k) = &self.integ {
            verify_hmac(k, seq, data, mac)?;
        }

        let etm = self.integ.is_etm();
        match &mut self.cipher {
            CipherKey::ChaPoly(k) => {
                k.decrypt(seq, data, mac).map_err(|_| {
                    info!("Packet integrity failed");
                    Error::BadDecrypt
                })?;
            }
            // safe index, checked data.len()
            CipherKey::Aes256Ctr(a) if etm => {
                a.apply_keystream(&mut data[SSH_LENGTH_SIZE..])
            }
            CipherKey::Aes256Ctr(a) => a.apply_keystream(&mut data[16..]),
            CipherKey::Aes128Ctr(a) if etm => {
                a.apply_keystream(&mut data[SSH_LENGTH_SIZE..])
            }
            CipherKey::Aes128Ctr(a) => a.apply_keystream(&mut data[16..]),
            CipherKey::NoCipher => {}
        }

        if let IntegKey::HmacSha256(k) = &self.integ {
            verify_hmac(k, seq, data, mac)?;
        }

        let padlen = data[SSH_LENGTH_SIZE] as usize;
        if padlen < SSH_MIN_PADLEN {
            debug!("Packet padding too short");
            return Err(Error::BadPadding);
        }

        let payload_len = buf
            .len()
            .checked_sub(SSH_LENGTH_SIZE + 1 + size_integ + padlen)
            .ok_or_else(|| {
                debug!("Bad padding length");
                Error::BadPadding
            })?;

        Ok(payload_len)
    }

    /// Padding is required to meet
    /// - minimum packet length
    /// - minimum padding size,
    /// - encrypted length being a multiple of block length
    fn calc_encrypt_pad(&self, payload_len: usize) -> usize {
        let size_block = self.cipher.size_block();
        // aead ciphers and etm don't include the initial length field in encrypted blocks
        let len = 1 + payload_len
            + if self.length_in_clear() { 0 } else { SSH_LENGTH_SIZE };

        // round padding length upwards so that len is a multiple of block size
        let mut padlen = size_block - len % size_block;

        // need at least 4 bytes padding
        if padlen < SSH_MIN_PADLEN {
            padlen += size_block
        }

        // The minimum size of a packet is 16 (plus mac)
        // We know we already have at least 8 bytes because of blocksize rounding.
        if SSH_LENGTH_SIZE + 1 + payload_len + padlen < SSH_MIN_PACKET_SIZE {
            padlen += size_block;
        }
        padlen
    }

    /// Encrypt a buffer in-place, adding packet size, padding, MAC etc.
    /// Returns the total length.
    /// Ensures that the packet meets minimum and other length requirements.
    fn encrypt(
        &mut self,
        payload_len: usize,
        buf: &mut [u8],
        seq: u32,
    ) -> Result<usize, Error> {
        let size_block = self.cipher.size_block();
        let size_integ = self.integ.size_out();
        let padlen = self.calc_encrypt_pad(payload_len);
        // len is everything except the MAC
        let len = SSH_LENGTH_SIZE + 1 + payload_len + padlen;

        if self.length_in_clear() {
            debug_assert_eq!((len - SSH_LENGTH_SIZE) % size_block, 0);
        } else {
            debug_assert_eq!(len % size_block, 0);
        };

        if len + size_integ > buf.len() {
            error!("Output buffer {} is too small for packet", buf.len());
            return Err(Error::NoRoom);
        }

        // write the length
        buf[..SSH_LENGTH_SIZE]
            .copy_from_slice(&((len - SSH_LENGTH_SIZE) as u32).to_be_bytes());
        // write random padding
        buf[SSH_LENGTH_SIZE] = padlen as u8;
        let pad_start = SSH_LENGTH_SIZE + 1 + payload_len;
        debug_assert_eq!(pad_start + padlen, len);
        random::fill_random(&mut buf[pad_start..pad_start + padlen])?;

        let (enc, rest) = buf.split_at_mut(len);
        let (mac, _) = rest.split_at_mut(size_integ);

        if let IntegKey::HmacSha256(k) = &self.integ {
            compute_hmac(k, seq, enc, mac)?;
        }

        let etm = self.integ.is_etm();
        match &mut self.cipher {
            CipherKey::ChaPoly(k) => k.encrypt(seq, enc, mac)?,
            CipherKey::Aes256Ctr(a) if etm => {
                a.apply_keystream(&mut enc[SSH_LENGTH_SIZE..])
            }
            CipherKey::Aes256Ctr(a) => a.apply_keystream(enc),
            CipherKey::Aes128Ctr(a) if etm => {
                a.apply_keystream(&mut enc[SSH_LENGTH_SIZE..])
            }
            CipherKey::Aes128Ctr(a) => a.apply_keystream(enc),
            CipherKey::NoCipher => {}
        }

        if let IntegKey::HmacSha256Etm(k) = &self.integ {
            compute_hmac(k, seq, enc, mac)?;
        }

        Ok(len + size_integ)
    }
}

fn read_length(buf: &[u8]) -> u32 {
    let mut l = [0u8; SSH_LENGTH_SIZE];
    l.copy_from_slice(&buf[..SSH_LENGTH_SIZE]);
    u32::from_be_bytes(l)
}

fn compute_hmac(k: &[u8; 32], seq: u32, data: &[u8], mac: &mut [u8]) -> Result<()> {
    let mut h = HmacSha256::new_from_slice(k).trap()?;
    h.update(&seq.to_be_bytes());
    h.update(data);
    mac.copy_from_slice(&h.finalize().into_bytes());
    Ok(())
}

fn verify_hmac(k: &[u8; 32], seq: u32, data: &[u8], mac: &[u8]) -> Result<()> {
    let mut h = HmacSha256::new_from_slice(k).trap()?;
    h.update(&seq.to_be_bytes());
    h.update(data);
    h.verify_slice(mac).map_err(|_| {
        info!("Packet integrity failed");
        Error::BadDecrypt
    })
}

/// Placeholder for a cipher type prior to creating a [`CipherKey`],
/// for use during key setup in [`kex`](crate::kex)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cipher {
    ChaPoly,
    Aes256Ctr,
    Aes128Ctr,
    /// The `"none"` cipher
    None,
}

impl fmt::Display for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl Cipher {
    /// Matches a cipher name.
    pub fn from_name(name: &str) -> Result<Self, Error> {
        match name {
            SSH_NAME_CHAPOLY => Ok(Cipher::ChaPoly),
            SSH_NAME_AES256_CTR => Ok(Cipher::Aes256Ctr),
            SSH_NAME_AES128_CTR => Ok(Cipher::Aes128Ctr),
            SSH_NAME_NONE => Ok(Cipher::None),
            _ => Err(Error::UnknownMethod { kind: "cipher" }),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ChaPoly => SSH_NAME_CHAPOLY,
            Self::Aes256Ctr => SSH_NAME_AES256_CTR,
            Self::Aes128Ctr => SSH_NAME_AES128_CTR,
            Self::None => SSH_NAME_NONE,
        }
    }

    /// Length in bytes
    pub fn key_len(&self) -> usize {
        match self {
            Cipher::ChaPoly => SSHChaPoly::KEY_LEN,
            Cipher::Aes256Ctr => aes::Aes256::key_size(),
            Cipher::Aes128Ctr => aes::Aes128::key_size(),
            Cipher::None => 0,
        }
    }

    /// Length in bytes
    pub fn iv_len(&self) -> usize {
        match self {
            Cipher::ChaPoly => 0,
            Cipher::Aes256Ctr => aes::Aes256::block_size(),
            Cipher::Aes128Ctr => aes::Aes128::block_size(),
            Cipher::None => 0,
        }
    }

    /// Block size in bytes, at least [`SSH_MIN_BLOCK`]
    pub fn block_size(&self) -> usize {
        match self {
            Cipher::Aes256Ctr => aes::Aes256::block_size(),
            Cipher::Aes128Ctr => aes::Aes128::block_size(),
            Cipher::ChaPoly | Cipher::None => SSH_MIN_BLOCK,
        }
    }

    pub fn is_aead(&self) -> bool {
        matches!(self, Cipher::ChaPoly)
    }

    /// Returns the [`Integ`] for this cipher, or None if not aead
    pub fn integ(&self) -> Option<Integ> {
        match self {
            Cipher::ChaPoly => Some(Integ::ChaPoly),
            _ => None,
        }
    }
}

pub(crate) enum CipherKey {
    ChaPoly(SSHChaPoly),
    Aes256Ctr(Aes256Ctr),
    Aes128Ctr(Aes128Ctr),
    NoCipher,
}

impl Debug for CipherKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = match self {
            Self::ChaPoly(_) => "ChaPoly",
            Self::Aes256Ctr(_) => "Aes256Ctr",
            Self::Aes128Ctr(_) => "Aes128Ctr",
            Self::NoCipher => "NoCipher",
        };
        f.write_fmt(format_args!("CipherKey::{n}"))
    }
}

impl CipherKey {
    /// Construct a key. The `"none"` cipher has no key and isn't accepted.
    pub fn from_cipher(cipher: &Cipher, key: &[u8], iv: &[u8]) -> Result<Self, Error> {
        let key = key.get(..cipher.key_len()).trap()?;
        let iv = iv.get(..cipher.iv_len()).trap()?;
        match cipher {
            Cipher::ChaPoly => {
                Ok(CipherKey::ChaPoly(SSHChaPoly::new_from_slice(key)?))
            }
            Cipher::Aes256Ctr => Ok(CipherKey::Aes256Ctr(
                Aes256Ctr::new_from_slices(key, iv).trap()?,
            )),
            Cipher::Aes128Ctr => Ok(CipherKey::Aes128Ctr(
                Aes128Ctr::new_from_slices(key, iv).trap()?,
            )),
            Cipher::None => Error::bug_msg("none cipher has no key"),
        }
    }

    pub fn is_aead(&self) -> bool {
        matches!(self, CipherKey::ChaPoly(_))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, CipherKey::NoCipher)
    }

    pub fn size_block(&self) -> usize {
        match self {
            CipherKey::ChaPoly(_) => SSH_MIN_BLOCK,
            CipherKey::Aes256Ctr(_) => aes::Aes256::block_size(),
            CipherKey::Aes128Ctr(_) => aes::Aes128::block_size(),
            CipherKey::NoCipher => SSH_MIN_BLOCK,
        }
    }
}

/// Placeholder for a [`IntegKey`] type prior to keying. For use during key setup in [`kex`](crate::kex)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Integ {
    ChaPoly,
    HmacSha256,
    HmacSha256Etm,
    /// The `"none"` MAC
    None,
}

impl Integ {
    /// Matches a MAC name. Should not be called for AEAD ciphers, instead use [`Cipher::integ`]
    pub fn from_name(name: &str) -> Result<Self, Error> {
        match name {
            SSH_NAME_HMAC_SHA256 => Ok(Integ::HmacSha256),
            SSH_NAME_HMAC_SHA256_ETM => Ok(Integ::HmacSha256Etm),
            SSH_NAME_NONE => Ok(Integ::None),
            _ => Err(Error::UnknownMethod { kind: "MAC" }),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ChaPoly => SSH_NAME_CHAPOLY,
            Self::HmacSha256 => SSH_NAME_HMAC_SHA256,
            Self::HmacSha256Etm => SSH_NAME_HMAC_SHA256_ETM,
            Self::None => SSH_NAME_NONE,
        }
    }

    /// length in bytes
    pub fn key_len(&self) -> usize {
        match self {
            Integ::ChaPoly | Integ::None => 0,
            Integ::HmacSha256 | Integ::HmacSha256Etm => 32,
        }
    }

    /// MAC or tag length in bytes
    pub fn size_out(&self) -> usize {
        match self {
            Integ::ChaPoly => SSHChaPoly::TAG_LEN,
            Integ::HmacSha256 | Integ::HmacSha256Etm => {
                sha2::Sha256::output_size()
            }
            Integ::None => 0,
        }
    }

    pub fn is_etm(&self) -> bool {
        matches!(self, Integ::HmacSha256Etm)
    }
}

impl fmt::Display for Integ {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Zeroize, ZeroizeOnDrop)]
pub(crate) enum IntegKey {
    ChaPoly,
    HmacSha256([u8; 32]),
    HmacSha256Etm([u8; 32]),
    NoInteg,
}

impl Debug for IntegKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = match self {
            Self::ChaPoly => "ChaPoly",
            Self::HmacSha256(_) => "HmacSha256",
            Self::HmacSha256Etm(_) => "HmacSha256Etm",
            Self::NoInteg => "NoInteg",
        };
        f.write_fmt(format_args!("IntegKey::{n}"))
    }
}

impl IntegKey {
    /// Construct a key. The `"none"` MAC has no key and isn't accepted.
    pub fn from_integ(integ: &Integ, key: &[u8]) -> Result<Self, Error> {
        let key = key.get(..integ.key_len()).trap()?;
        match integ {
            Integ::ChaPoly => Ok(IntegKey::ChaPoly),
            Integ::HmacSha256 => Ok(IntegKey::HmacSha256(key.try_into().trap()?)),
            Integ::HmacSha256Etm => {
                Ok(IntegKey::HmacSha256Etm(key.try_into().trap()?))
            }
            Integ::None => Error::bug_msg("none MAC has no key"),
        }
    }

    pub fn size_out(&self) -> usize {
        match self {
            IntegKey::ChaPoly => SSHChaPoly::TAG_LEN,
            IntegKey::HmacSha256(_) | IntegKey::HmacSha256Etm(_) => {
                sha2::Sha256::output_size()
            }
            IntegKey::NoInteg => 0,
        }
    }

    pub fn is_etm(&self) -> bool {
        matches!(self, IntegKey::HmacSha256Etm(_))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, IntegKey::NoInteg)
    }
}

/// Payload compression algorithm
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compress {
    None,
    /// Starts at NEWKEYS
    Zlib,
    /// Starts once userauth succeeds
    ZlibOpenSsh,
}

impl Compress {
    pub fn from_name(name: &str) -> Result<Self, Error> {
        match name {
            SSH_NAME_NONE => Ok(Compress::None),
            SSH_NAME_ZLIB => Ok(Compress::Zlib),
            SSH_NAME_ZLIB_OPENSSH => Ok(Compress::ZlibOpenSsh),
            _ => Err(Error::UnknownMethod { kind: "compression" }),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Compress::None => SSH_NAME_NONE,
            Compress::Zlib => SSH_NAME_ZLIB,
            Compress::ZlibOpenSsh => SSH_NAME_ZLIB_OPENSSH,
        }
    }
}

/// A zlib stream spanning all packets in one direction.
pub(crate) enum ZStream {
    Deflate(flate2::Compress),
    Inflate(flate2::Decompress),
}

impl ZStream {
    fn new(dir: Direction) -> Self {
        match dir {
            Direction::Outbound => {
                Self::Deflate(flate2::Compress::new(flate2::Compression::default(), true))
            }
            Direction::Inbound => Self::Inflate(flate2::Decompress::new(true)),
        }
    }
}

impl Debug for ZStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = match self {
            Self::Deflate(z) => ("Deflate", z.total_in()),
            Self::Inflate(z) => ("Inflate", z.total_out()),
        };
        write!(f, "ZStream::{} ({} bytes)", n.0, n.1)
    }
}

/// Each payload ends with a sync flush so the peer can decode it alone.
fn deflate(z: &mut flate2::Compress, input: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(input.len() + 64);
    let start = z.total_in();
    loop {
        let done = (z.total_in() - start) as usize;
        z.compress_vec(&input[done..], &mut out, FlushCompress::Sync).trap()?;
        let done = (z.total_in() - start) as usize;
        // A flush that left spare room has completed
        if done == input.len() && out.len() < out.capacity() {
            return Ok(out);
        }
        out.reserve(out.capacity().max(256));
    }
}

fn inflate(z: &mut flate2::Decompress, input: &[u8], out: &mut Vec<u8>) -> Result<()> {
    out.clear();
    out.reserve(input.len() * 4 + 256);
    let start = z.total_in();
    loop {
        let progress = (z.total_in(), z.total_out());
        let done = (z.total_in() - start) as usize;
        let st = z.decompress_vec(&input[done..], out, FlushDecompress::Sync).map_err(|e| {
            debug!("Bad compressed payload: {e}");
            Error::SSHProtoError
        })?;
        let done = (z.total_in() - start) as usize;
        if done == input.len() && out.len() < out.capacity() {
            return Ok(());
        }
        if out.len() > SSH_MAX_PACKET_LEN {
            return Err(Error::BigPacket { size: out.len() });
        }
        let stuck = progress == (z.total_in(), z.total_out()) && out.len() < out.capacity();
        if st == Status::StreamEnd || stuck {
            debug!("Compressed payload has trailing data");
            return Err(Error::SSHProtoError);
        }
        out.reserve(out.capacity().max(256));
    }
}
