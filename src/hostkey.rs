//! Server host keys and signature verification.
//!
//! A server is handed its host key as a [`HostKey`], an opaque signing
//! capability. Generating or loading keys is up to the caller,
//! [`Ed25519HostKey`] is provided for convenience.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use ed25519_dalek::{SigningKey, VerifyingKey};
use signature::{Signer, Verifier};
use zeroize::Zeroize;

use crate::packets::{Ed25519PubKey, Ed25519Sig, PubKey, Signature};
use crate::random;
use crate::sshnames::*;
use crate::sshwire::BinString;

/// A host key signing capability.
///
/// Shared read-only between connections.
pub trait HostKey: Send + Sync {
    /// The SSH signature algorithm name, for example `"ssh-ed25519"`
    fn algorithm_name(&self) -> &'static str;

    /// The public key, sent to clients during key exchange
    fn pubkey(&self) -> PubKey<'_>;

    /// Returns the raw signature bytes over `data`
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Key strength in bits
    fn bits(&self) -> usize;
}

/// An Ed25519 host key held in memory.
pub struct Ed25519HostKey {
    key: SigningKey,
    public: [u8; 32],
}

impl Ed25519HostKey {
    /// Generates a new random key
    pub fn generate() -> Result<Self> {
        let mut seed = [0u8; 32];
        random::fill_random(&mut seed)?;
        let k = Self::from_seed(&seed);
        seed.zeroize();
        Ok(k)
    }

    /// Creates a key from a 32 byte private seed
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let key = SigningKey::from_bytes(seed);
        let public = key.verifying_key().to_bytes();
        Self { key, public }
    }
}

impl HostKey for Ed25519HostKey {
    fn algorithm_name(&self) -> &'static str {
        SSH_NAME_ED25519
    }

    fn pubkey(&self) -> PubKey<'_> {
        PubKey::Ed25519(Ed25519PubKey { key: BinString(&self.public) })
    }

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        let sig: ed25519_dalek::Signature = self.key.try_sign(data).map_err(|_| Error::BadSig)?;
        let sig = sig.to_bytes().to_vec();

        // Faults in signing can expose the private key. We verify the signature
        // just created to avoid this problem.
        let s = signature_packet(SSH_NAME_ED25519, &sig)?;
        verify(&self.pubkey(), data, &s)?;
        Ok(sig)
    }

    fn bits(&self) -> usize {
        256
    }
}

impl core::fmt::Debug for Ed25519HostKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Ed25519HostKey").field("public", &self.public).finish_non_exhaustive()
    }
}

/// Wraps raw signature bytes for sending.
pub(crate) fn signature_packet<'a>(algo: &str, sig: &'a [u8]) -> Result<Signature<'a>> {
    match algo {
        SSH_NAME_ED25519 => Ok(Signature::Ed25519(Ed25519Sig { sig: BinString(sig) })),
        _ => Err(Error::NotAvailable { what: "signature algorithm" }),
    }
}

/// Returns `Ok(())` if `sig` is a valid signature of `data` by `pubkey`
pub fn verify(pubkey: &PubKey, data: &[u8], sig: &Signature) -> Result<()> {
    match (pubkey, sig) {
        (PubKey::Ed25519(k), Signature::Ed25519(s)) => {
            let k: &[u8; 32] = k.key.0.try_into().map_err(|_| Error::BadKey)?;
            let k = VerifyingKey::from_bytes(k).map_err(|_| Error::BadKey)?;
            let s: &[u8; 64] = s.sig.0.try_into().map_err(|_| Error::BadSig)?;
            let s = ed25519_dalek::Signature::from_bytes(s);
            k.verify(data, &s).map_err(|_| Error::BadSig)
        }
        _ => {
            warn!(
                "Signature \"{:?}\" doesn't match key type \"{:?}\"",
                sig.algorithm_name(),
                pubkey.algorithm_name(),
            );
            Err(Error::BadSig)
        }
    }
}
