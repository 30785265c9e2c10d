#[allow(unused_imports)]
use {
    crate::error::*,
    log::{debug, error, info, log, trace, warn},
};

use chacha20::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use chacha20::ChaCha20;
use digest::KeyInit;
use poly1305::Poly1305;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use pretty_hex::PrettyHex;

use crate::encrypt::SSH_LENGTH_SIZE;

/// Keystream position of the packet body. Block 0 provides the MAC key.
const BODY_OFFSET: u32 = 64;

/// `chacha20-poly1305@openssh.com`
///
/// The 64 byte key is two ChaCha20 keys. The second half encrypts only
/// the length field. The first half encrypts the rest of the packet and
/// provides a one-time Poly1305 key, which authenticates the whole
/// encrypted packet including length. Both use the sequence number as nonce.
#[derive(Clone, ZeroizeOnDrop)]
pub struct SSHChaPoly {
    body_key: [u8; 32],
    length_key: [u8; 32],
}

fn keystream(key: &[u8; 32], seq: u32) -> ChaCha20 {
    let mut nonce = [0u8; 12];
    nonce[8..].copy_from_slice(&seq.to_be_bytes());
    ChaCha20::new(key.into(), (&nonce).into())
}

impl SSHChaPoly {
    pub const TAG_LEN: usize = 16;
    pub const KEY_LEN: usize = 64;

    pub fn new_from_slice(key: &[u8]) -> Result<Self> {
        if key.len() != Self::KEY_LEN {
            return Err(Error::BadKey);
        }
        let (body, length) = key.split_at(32);
        let mut c = Self { body_key: [0u8; 32], length_key: [0u8; 32] };
        c.body_key.copy_from_slice(body);
        c.length_key.copy_from_slice(length);
        Ok(c)
    }

    /// Length encryption is symmetric
    fn crypt_length(&self, seq: u32, len: &mut [u8]) {
        keystream(&self.length_key, seq).apply_keystream(len)
    }

    /// Returns the body keystream, already past the MAC key block,
    /// and the packet's MAC.
    fn body(&self, seq: u32) -> (ChaCha20, Poly1305) {
        let mut ks = keystream(&self.body_key, seq);
        let mut mac_key = [0u8; 32];
        ks.apply_keystream(&mut mac_key);
        let mac = Poly1305::new((&mac_key).into());
        mac_key.zeroize();
        ks.seek(BODY_OFFSET);
        (ks, mac)
    }

    /// Decrypts the packet length from the first 4 bytes of `buf`.
    pub fn packet_length(&self, seq: u32, buf: &[u8]) -> Result<u32> {
        let mut len = [0u8; SSH_LENGTH_SIZE];
        len.copy_from_slice(buf.get(..SSH_LENGTH_SIZE).ok_or(Error::BadDecrypt)?);
        self.crypt_length(seq, &mut len);
        trace!("packet_length {:?}", len.hex_dump());
        Ok(u32::from_be_bytes(len))
    }

    /// Checks the tag then decrypts the body in place.
    ///
    /// `msg` starts with the still encrypted length field, it is left as-is.
    pub fn decrypt(&self, seq: u32, msg: &mut [u8], mac: &[u8]) -> Result<()> {
        if msg.len() < SSH_LENGTH_SIZE || mac.len() != Self::TAG_LEN {
            return Err(Error::BadDecrypt);
        }
        let (mut ks, poly) = self.body(seq);
        // compute_unpadded() pads the final partial block itself
        let expect = poly.compute_unpadded(msg);
        if !bool::from(expect.as_slice().ct_eq(mac)) {
            return Err(Error::BadDecrypt);
        }
        ks.apply_keystream(&mut msg[SSH_LENGTH_SIZE..]);
        Ok(())
    }

    /// Writes the length field, encrypts `msg` in place and fills `mac`.
    pub fn encrypt(&self, seq: u32, msg: &mut [u8], mac: &mut [u8]) -> Result<()> {
        if msg.len() < SSH_LENGTH_SIZE || mac.len() != Self::TAG_LEN {
            return Err(Error::bug());
        }
        let (len, rest) = msg.split_at_mut(SSH_LENGTH_SIZE);
        let l = u32::try_from(rest.len()).trap()?;
        len.copy_from_slice(&l.to_be_bytes());
        self.crypt_length(seq, len);

        let (mut ks, poly) = self.body(seq);
        ks.apply_keystream(rest);
        mac.copy_from_slice(poly.compute_unpadded(msg).as_slice());
        Ok(())
    }
}
