//! Key exchange.
//!
//! Runs `curve25519-sha256`, computes the exchange hash and derives the six
//! keys of RFC4253 section 7.2. Each direction is then taken into use by
//! [`activation`](crate::activation), which handles a `"none"` cipher or MAC.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use core::fmt;

use digest::Digest;
use pretty_hex::PrettyHex;
use rand_core::OsRng;
use sha2::Sha256;
use zeroize::{ZeroizeOnDrop, Zeroizing};

use crate::activation;
use crate::behaviour::CliBehaviour;
use crate::config::OUR_VERSION;
use crate::encrypt::{Cipher, Compress, Direction, Integ};
use crate::encrypt::DirectionKeys;
use crate::error;
use crate::hostkey::{self, HostKey};
use crate::ident::RemoteVersion;
use crate::namelist::{LocalNames, NameList};
use crate::packets::{self, Packet};
use crate::random;
use crate::registry::{AlgorithmSuite, MARKER_ONLY_KEXS};
use crate::sshnames::*;
use crate::sshwire::{hash_mpint, hash_ser_length, BinString, Blob};
use crate::traffic::TrafSend;

// at present we only have curve25519 with sha256
const MAX_SESSID: usize = 32;
pub type SessId = heapless::Vec<u8, MAX_SESSID>;

/// Length of each derived key slot, enough for chacha20-poly1305's 64 byte key.
pub(crate) const KEY_SLOT_LEN: usize = 64;

type KexCookie = [u8; 16];

/// The current state of the Kex
#[derive(Debug)]
pub(crate) enum Kex {
    /// No key exchange in progress
    Idle,

    /// Waiting for a KexInit packet, have sent one.
    KexInit {
        // Cookie sent in our KexInit packet. Kept so that we can reproduce the
        // KexInit packet when calculating the exchange hash.
        our_cookie: KexCookie,
    },
    /// Waiting for KexDHInit (server) or KexDHReply (client)
    KexDH { algos: Algos, kex_hash: KexHash },
    /// Our NEWKEYS has been sent and outbound keys are in use.
    /// `inbound` is taken into use when the peer's NEWKEYS arrives.
    NewKeys { algos: Algos, inbound: DirectionKeys },

    /// A transient state use internally to transition between other states.
    ///
    /// Returned from .take()
    /// Should only ever occur while inside a method call, a proper state
    /// will be set before returning. (Could remain set if an error occurs,
    /// but an error returned from Kex is not recoverable anyway).
    Taken,
}

#[derive(Debug)]
pub(crate) struct KexHash {
    // Could be made generic if we add other kex methods
    hash_ctx: Sha256,
}

// kexhash state. progessively include version idents, kexinit payloads, hostsig, e/f, secret
impl KexHash {
    fn new(
        is_client: bool,
        suite: &AlgorithmSuite,
        our_cookie: &KexCookie,
        remote_version: &RemoteVersion,
        remote_kexinit: &Packet,
    ) -> Result<Self> {
        // RFC4253 section 8:
        // The hash H is computed as the HASH hash of the concatenation of the
        // following:
        //    string    V_C, the client's identification string (CR and LF
        //              excluded)
        //    string    V_S, the server's identification string (CR and LF
        //              excluded)
        //    string    I_C, the payload of the client's SSH_MSG_KEXINIT
        //    string    I_S, the payload of the server's SSH_MSG_KEXINIT
        //    string    K_S, the host key
        //    mpint     e, exchange value sent by the client (aka q_c)
        //    mpint     f, exchange value sent by the server (aka q_s)
        //    mpint     K, the shared secret

        let mut kh = KexHash { hash_ctx: Sha256::new() };
        let remote_version = remote_version.version().trap()?;
        // Recreate our own kexinit packet to hash.
        let own_kexinit = Kex::make_kexinit(our_cookie, suite);
        if is_client {
            kh.hash_slice(OUR_VERSION);
            kh.hash_slice(remote_version);
            hash_ser_length(&mut kh.hash_ctx, &own_kexinit)?;
            hash_ser_length(&mut kh.hash_ctx, remote_kexinit)?;
        } else {
            kh.hash_slice(remote_version);
            kh.hash_slice(OUR_VERSION);
            hash_ser_length(&mut kh.hash_ctx, remote_kexinit)?;
            hash_ser_length(&mut kh.hash_ctx, &own_kexinit)?;
        }
        // The remainder of hash_ctx is updated after kexdhreply

        Ok(kh)
    }

    /// Fill everything except K.
    fn prefinish(&mut self, host_key: &packets::PubKey, q_c: &[u8], q_s: &[u8]) -> Result<()> {
        hash_ser_length(&mut self.hash_ctx, host_key)?;

        // curve25519 public values are hashed as strings (RFC8731),
        // other methods would need mpint here.
        if q_c.len() != 32 || q_s.len() != 32 {
            return Err(Error::BadKex);
        }

        self.hash_slice(q_c);
        self.hash_slice(q_s);
        Ok(())
    }

    /// Compute the remainder of the hash, consuming KexHash
    /// K should be provided as raw bytes, it will be padded as an mpint
    /// internally.
    fn finish(mut self, k: &[u8]) -> Result<SessId> {
        hash_mpint(&mut self.hash_ctx, k);
        SessId::from_slice(&self.hash_ctx.finalize()).trap()
    }

    // Hashes a slice, with added u32 length prefix.
    fn hash_slice(&mut self, v: &[u8]) {
        self.hash_ctx.update((v.len() as u32).to_be_bytes());
        self.hash_ctx.update(v);
    }
}

/// Records the chosen algorithms while key exchange proceeds
#[derive(Debug)]
pub(crate) struct Algos {
    pub kex: SharedSecret,
    pub hostsig: &'static str,
    pub cipher_enc: Cipher,
    pub cipher_dec: Cipher,
    pub integ_enc: Integ,
    pub integ_dec: Integ,
    pub comp_enc: Compress,
    pub comp_dec: Compress,

    // If first_kex_packet_follows was set in SSH_MSG_KEXINIT but the
    // guessed algorithms don't match, we discard the next message (RFC4253 Sec 7).
    // This flag is reset to `false` after the packet has been discarded.
    pub discard_next: bool,

    // avoid having to keep passing it separately, though this
    // is global state.
    pub is_client: bool,

    // whether the remote side supports ext-info
    pub send_ext_info: bool,

    // Whether this exchange runs in strict mode. Only the first KEX decides,
    // later exchanges inherit the session's setting.
    pub strict_kex: bool,
}

impl Algos {
    /// The cipher, MAC and compression for packets in direction `dir`
    pub fn for_direction(&self, dir: Direction) -> (&Cipher, &Integ, &Compress) {
        match dir {
            Direction::Outbound => (&self.cipher_enc, &self.integ_enc, &self.comp_enc),
            Direction::Inbound => (&self.cipher_dec, &self.integ_dec, &self.comp_dec),
        }
    }

    pub fn negotiated(&self) -> NegotiatedAlgos {
        let (c2s, s2c) = if self.is_client {
            (Direction::Outbound, Direction::Inbound)
        } else {
            (Direction::Inbound, Direction::Outbound)
        };
        let (cc, mc, zc) = self.for_direction(c2s);
        let (cs, ms, zs) = self.for_direction(s2c);
        NegotiatedAlgos {
            kex: self.kex.name(),
            hostkey: self.hostsig,
            cipher_c2s: cc.name(),
            cipher_s2c: cs.name(),
            mac_c2s: mc.name(),
            mac_s2c: ms.name(),
            comp_c2s: zc.name(),
            comp_s2c: zs.name(),
        }
    }
}

impl fmt::Display for Algos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = self.negotiated();
        write!(f, "Negotiated algorithms {{\nkex {}\nhostkey {}\ncipher c->s {}\ncipher s->c {}\nmac c->s {}\nmac s->c {}\ncompression {} {}\n}}",
            n.kex, n.hostkey, n.cipher_c2s, n.cipher_s2c, n.mac_c2s, n.mac_s2c,
            n.comp_c2s, n.comp_s2c)
    }
}

/// Algorithm names agreed by the most recent key exchange.
///
/// For an AEAD cipher the MAC name is the cipher's name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedAlgos {
    pub kex: &'static str,
    pub hostkey: &'static str,
    pub cipher_c2s: &'static str,
    pub cipher_s2c: &'static str,
    pub mac_c2s: &'static str,
    pub mac_s2c: &'static str,
    pub comp_c2s: &'static str,
    pub comp_s2c: &'static str,
}

impl NegotiatedAlgos {
    /// True when neither direction has a cipher or a MAC.
    pub fn is_null(&self) -> bool {
        [self.cipher_c2s, self.cipher_s2c, self.mac_c2s, self.mac_s2c]
            .iter()
            .all(|n| *n == SSH_NAME_NONE)
    }
}

impl Kex {
    pub fn new() -> Self {
        Kex::Idle
    }

    fn take(&mut self) -> Self {
        debug_assert!(!matches!(self, Kex::Taken));
        core::mem::replace(self, Kex::Taken)
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Kex::Idle)
    }

    /// Our NEWKEYS is sent, the peer's is still to come
    pub fn is_newkeys_pending(&self) -> bool {
        matches!(self, Kex::NewKeys { .. })
    }

    /// Whether the exchange in progress runs in strict mode
    pub fn is_strict(&self) -> bool {
        match self {
            Kex::KexDH { algos, .. } | Kex::NewKeys { algos, .. } => algos.strict_kex,
            _ => false,
        }
    }

    /// Sends a `KexInit` message. Must be called from `Idle` state
    ///
    /// Non-kex packets are held back until our NEWKEYS is sent.
    pub fn send_kexinit(&mut self, suite: &AlgorithmSuite, s: &mut TrafSend) -> Result<()> {
        if !matches!(self, Kex::Idle) {
            return Err(Error::bug());
        }
        let our_cookie = random::random_cookie()?;
        s.kex_lock();
        s.send(Kex::make_kexinit(&our_cookie, suite))?;
        *self = Kex::KexInit { our_cookie };
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn handle_kexinit(
        &mut self,
        remote_kexinit: packets::KexInit,
        is_client: bool,
        suite: &AlgorithmSuite,
        remote_version: &RemoteVersion,
        first_kex: bool,
        strict_session: bool,
        s: &mut TrafSend,
    ) -> Result<()> {
        // Reply if we haven't already sent one. This will bump the state to Kex::KexInit
        if let Kex::Idle = self {
            self.send_kexinit(suite, s)?;
        }

        let our_cookie = if let Kex::KexInit { ref our_cookie } = self {
            our_cookie
        } else {
            // already received a KexInit
            return error::PacketWrong.fail();
        };

        let mut algos = Self::algo_negotiation(is_client, &remote_kexinit, suite)?;
        debug!("{algos}");

        if first_kex {
            if algos.strict_kex && s.recv_seq() != 1 {
                debug!("kexinit has strict kex but wasn't first packet");
                return error::PacketWrong.fail();
            }
        } else {
            algos.strict_kex = strict_session;
        }

        if is_client {
            let p = algos.kex.make_kexdhinit();
            s.send(p)?;
        }
        let kex_hash =
            KexHash::new(is_client, suite, our_cookie, remote_version, &remote_kexinit.into())?;
        *self = Kex::KexDH { algos, kex_hash };
        Ok(())
    }

    fn make_kexinit<'a>(cookie: &KexCookie, suite: &'a AlgorithmSuite) -> Packet<'a> {
        packets::KexInit {
            cookie: *cookie,
            kex: (&suite.kex).into(),
            hostsig: (&suite.hostsig).into(),
            cipher_c2s: (&suite.cipher_c2s).into(),
            cipher_s2c: (&suite.cipher_s2c).into(),
            mac_c2s: (&suite.mac_c2s).into(),
            mac_s2c: (&suite.mac_s2c).into(),
            comp_c2s: (&suite.comp_c2s).into(),
            comp_s2c: (&suite.comp_s2c).into(),
            lang_c2s: NameList::empty(),
            lang_s2c: NameList::empty(),
            first_follows: false,
            reserved: 0,
        }
        .into()
    }

    /// Server only
    pub fn handle_kexdhinit(
        &mut self,
        p: &packets::KexDHInit,
        hostkey: &dyn HostKey,
        sess_id: &mut Option<SessId>,
        first_kex: bool,
        s: &mut TrafSend,
    ) -> Result<()> {
        if let Kex::KexDH { algos, .. } = self {
            if algos.is_client {
                return error::PacketWrong.fail();
            }

            if algos.discard_next {
                algos.discard_next = false;
                // Ignore this packet
                debug!("Discarding wrong kex guess");
                return Ok(());
            }
        }

        if let Kex::KexDH { mut algos, kex_hash } = self.take() {
            let output =
                SharedSecret::handle_kexdhinit(&mut algos, kex_hash, p, hostkey, s)?;
            self.finish_outbound(algos, output, sess_id, first_kex, s)
        } else {
            error::PacketWrong.fail()
        }
    }

    /// Client only
    pub fn handle_kexdhreply(
        &mut self,
        p: &packets::KexDHReply,
        b: &mut dyn CliBehaviour,
        sess_id: &mut Option<SessId>,
        first_kex: bool,
        s: &mut TrafSend,
    ) -> Result<()> {
        if let Kex::KexDH { algos, .. } = self {
            if !algos.is_client {
                return error::PacketWrong.fail();
            }

            if algos.discard_next {
                algos.discard_next = false;
                debug!("Discarding wrong kex guess");
                return Ok(());
            }
        }

        if let Kex::KexDH { mut algos, kex_hash } = self.take() {
            let output = SharedSecret::handle_kexdhreply(&mut algos, kex_hash, p, b)?;
            self.finish_outbound(algos, output, sess_id, first_kex, s)
        } else {
            error::PacketWrong.fail()
        }
    }

    /// Derives keys, sends NEWKEYS and activates the outbound direction.
    ///
    /// Keys for both directions are built here, so a failure leaves
    /// neither direction changed.
    fn finish_outbound(
        &mut self,
        algos: Algos,
        output: KexOutput,
        sess_id: &mut Option<SessId>,
        first_kex: bool,
        s: &mut TrafSend,
    ) -> Result<()> {
        // The first KEX's H becomes the persistent sess_id
        let sess_id = sess_id.get_or_insert_with(|| output.h.clone());
        let keys = DerivedKeys::new(output.k.as_slice(), &output.h, sess_id);
        let outbound = activation::activate(Direction::Outbound, &algos, &keys)?;
        let inbound = activation::activate(Direction::Inbound, &algos, &keys)?;

        s.send(packets::NewKeys {})?;
        s.configure(Direction::Outbound, outbound);
        if algos.strict_kex {
            s.reset_seq(Direction::Outbound);
        }

        if first_kex && algos.send_ext_info {
            Self::send_ext_info(s)?;
        }
        s.kex_unlock()?;

        *self = Kex::NewKeys { algos, inbound };
        Ok(())
    }

    fn send_ext_info(s: &mut TrafSend) -> Result<()> {
        let algs = LocalNames::try_from([SSH_NAME_ED25519].as_slice())?;
        let ext = packets::ExtInfo { server_sig_algs: Some(NameList::Local(&algs)) };
        trace!("Sending ext-info");
        s.send(ext)
    }

    /// Takes the inbound keys into use, the peer's NEWKEYS has arrived.
    ///
    /// Returns the algorithms of the completed exchange.
    pub fn handle_newkeys(&mut self, s: &mut TrafSend) -> Result<Algos> {
        match self.take() {
            Kex::NewKeys { algos, inbound } => {
                s.configure(Direction::Inbound, inbound);
                if algos.strict_kex {
                    s.reset_seq(Direction::Inbound);
                }
                *self = Kex::Idle;
                Ok(algos)
            }
            other => {
                *self = other;
                error::PacketWrong.fail()
            }
        }
    }

    /// Perform SSH algorithm negotiation
    fn algo_negotiation(
        is_client: bool,
        p: &packets::KexInit,
        suite: &AlgorithmSuite,
    ) -> Result<Algos> {
        let kexguess2 = p.kex.has_algo(SSH_NAME_KEXGUESS2)?;

        // For each algorithm we select the first name in the client's
        // list that is also present in the server's list.
        let kex_method = p
            .kex
            .first_match(is_client, &suite.kex)?
            .ok_or(Error::AlgoNoMatch { algo: "kex" })?;

        // Certain kex method names aren't actual algorithms, just markers.
        // If they are negotiated it means no valid method matched
        if MARKER_ONLY_KEXS.contains(&kex_method) {
            return Err(Error::AlgoNoMatch { algo: "kex" });
        }

        let kex = SharedSecret::from_name(kex_method)?;
        let goodguess_kex = if kexguess2 {
            p.kex.first() == kex_method
        } else {
            p.kex.first() == suite.kex.first()
        };

        // we only send MSG_EXT_INFO to a client, don't look
        // for SSH_NAME_EXT_INFO_S
        let send_ext_info = if is_client {
            false
        } else {
            p.kex.has_algo(SSH_NAME_EXT_INFO_C)?
        };

        // we always send strict-kex, so just check if the other had it
        let other_strict = if is_client {
            SSH_NAME_STRICT_KEX_S
        } else {
            SSH_NAME_STRICT_KEX_C
        };
        let strict_kex = p.kex.has_algo(other_strict)?;

        trace!("hostsig {:?}    vs   {:?}", p.hostsig, suite.hostsig);
        let hostsig = p
            .hostsig
            .first_match(is_client, &suite.hostsig)?
            .ok_or(Error::AlgoNoMatch { algo: "hostkey" })?;
        let goodguess_hostkey = if kexguess2 {
            p.hostsig.first() == hostsig
        } else {
            p.hostsig.first() == suite.hostsig.first()
        };

        // Switch between client/server tx/rx
        let c2s = (&p.cipher_c2s, &p.mac_c2s, &p.comp_c2s);
        let s2c = (&p.cipher_s2c, &p.mac_s2c, &p.comp_s2c);
        let ((cipher_tx, mac_tx, comp_tx), (cipher_rx, mac_rx, comp_rx)) =
            if is_client { (c2s, s2c) } else { (s2c, c2s) };
        let (our_tx, our_rx) = if is_client {
            ((&suite.cipher_c2s, &suite.mac_c2s, &suite.comp_c2s),
                (&suite.cipher_s2c, &suite.mac_s2c, &suite.comp_s2c))
        } else {
            ((&suite.cipher_s2c, &suite.mac_s2c, &suite.comp_s2c),
                (&suite.cipher_c2s, &suite.mac_c2s, &suite.comp_c2s))
        };

        let n = cipher_tx
            .first_match(is_client, our_tx.0)?
            .ok_or(Error::AlgoNoMatch { algo: "encryption" })?;
        let cipher_enc = Cipher::from_name(n)?;
        let n = cipher_rx
            .first_match(is_client, our_rx.0)?
            .ok_or(Error::AlgoNoMatch { algo: "encryption" })?;
        let cipher_dec = Cipher::from_name(n)?;

        // We ignore mac algorithms for AEAD ciphers
        let integ_enc = if let Some(integ) = cipher_enc.integ() {
            integ
        } else {
            let n = mac_tx
                .first_match(is_client, our_tx.1)?
                .ok_or(Error::AlgoNoMatch { algo: "mac" })?;
            Integ::from_name(n)?
        };
        let integ_dec = if let Some(integ) = cipher_dec.integ() {
            integ
        } else {
            let n = mac_rx
                .first_match(is_client, our_rx.1)?
                .ok_or(Error::AlgoNoMatch { algo: "mac" })?;
            Integ::from_name(n)?
        };

        let n = comp_tx
            .first_match(is_client, our_tx.2)?
            .ok_or(Error::AlgoNoMatch { algo: "compression" })?;
        let comp_enc = Compress::from_name(n)?;
        let n = comp_rx
            .first_match(is_client, our_rx.2)?
            .ok_or(Error::AlgoNoMatch { algo: "compression" })?;
        let comp_dec = Compress::from_name(n)?;

        // Ignore language fields at present.

        let discard_next = p.first_follows && !(goodguess_kex && goodguess_hostkey);

        Ok(Algos {
            kex,
            hostsig,
            cipher_enc,
            cipher_dec,
            integ_enc,
            integ_dec,
            comp_enc,
            comp_dec,
            discard_next,
            is_client,
            send_ext_info,
            strict_kex,
        })
    }
}

#[derive(Debug, ZeroizeOnDrop)]
pub(crate) enum SharedSecret {
    KexCurve25519(KexCurve25519),
}

impl fmt::Display for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl SharedSecret {
    pub fn from_name(name: &'static str) -> Result<Self> {
        match name {
            SSH_NAME_CURVE25519 | SSH_NAME_CURVE25519_LIBSSH => {
                Ok(SharedSecret::KexCurve25519(KexCurve25519::new(name)))
            }
            _ => Err(Error::UnknownMethod { kind: "kex" }),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SharedSecret::KexCurve25519(k) => k.name,
        }
    }

    fn make_kexdhinit(&self) -> Packet<'_> {
        let q_c = BinString(self.pubkey());
        packets::KexDHInit { q_c }.into()
    }

    // client only
    fn handle_kexdhreply(
        algos: &mut Algos,
        mut kex_hash: KexHash,
        p: &packets::KexDHReply,
        b: &mut dyn CliBehaviour,
    ) -> Result<KexOutput> {
        kex_hash.prefinish(&p.k_s.0, algos.kex.pubkey(), p.q_s.0)?;
        // consumes the sharedsecret private key in algos
        let kex_out = match algos.kex {
            SharedSecret::KexCurve25519(_) => KexCurve25519::secret(algos, p.q_s.0, kex_hash)?,
        };

        if p.sig.0.algorithm_name().ok() != Some(algos.hostsig) {
            debug!("Signature type doesn't match negotiated {}", algos.hostsig);
            return Err(Error::BadSig);
        }
        let h: &[u8] = kex_out.h.as_ref();
        trace!("verify  h {:?}", h.hex_dump());
        hostkey::verify(&p.k_s.0, h, &p.sig.0)?;
        debug!("Hostkey signature is valid");
        if matches!(b.valid_hostkey(&p.k_s.0), Ok(true)) {
            Ok(kex_out)
        } else {
            warn!("Host key rejected");
            Err(Error::BadKey)
        }
    }

    // server only. consumes algos and kex_hash
    fn handle_kexdhinit(
        algos: &mut Algos,
        mut kex_hash: KexHash,
        p: &packets::KexDHInit,
        hostkey: &dyn HostKey,
        s: &mut TrafSend,
    ) -> Result<KexOutput> {
        if hostkey.algorithm_name() != algos.hostsig {
            return Err(Error::NotAvailable { what: "host key" });
        }

        kex_hash.prefinish(&hostkey.pubkey(), p.q_c.0, algos.kex.pubkey())?;
        let kex_out = match algos.kex {
            SharedSecret::KexCurve25519(_) => KexCurve25519::secret(algos, p.q_c.0, kex_hash)?,
        };

        Self::send_kexdhreply(&kex_out, algos.kex.pubkey(), hostkey, s)?;
        Ok(kex_out)
    }

    // server only
    fn send_kexdhreply(
        ko: &KexOutput,
        kex_pub: &[u8],
        hostkey: &dyn HostKey,
        s: &mut TrafSend,
    ) -> Result<()> {
        let q_s = BinString(kex_pub);

        let k_s = Blob(hostkey.pubkey());
        trace!("sign kexreply h {:?}", ko.h.as_slice().hex_dump());
        let sig = hostkey.sign(ko.h.as_slice())?;
        let sig = Blob(hostkey::signature_packet(hostkey.algorithm_name(), &sig)?);
        s.send(packets::KexDHReply { k_s, q_s, sig })
    }

    fn pubkey(&self) -> &[u8] {
        match self {
            SharedSecret::KexCurve25519(k) => k.pubkey(),
        }
    }
}

/// Output of one exchange, consumed by [`DerivedKeys`]
pub(crate) struct KexOutput {
    /// `H` for this exchange, conn takes the first as sess_id
    h: SessId,
    /// Shared secret `K` as raw bytes, hashed as an mpint
    k: Zeroizing<[u8; 32]>,
}

impl fmt::Debug for KexOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KexOutput").finish_non_exhaustive()
    }
}

impl KexOutput {
    fn new(k: &[u8; 32], kex_hash: KexHash) -> Result<Self> {
        let h = kex_hash.finish(k)?;
        Ok(KexOutput { h, k: Zeroizing::new(*k) })
    }
}

/// The six keys of RFC4253 section 7.2, `A` to `F`.
///
/// Every slot is derived for every exchange whatever algorithms were
/// negotiated, a `"none"` cipher or MAC leaves its slots unused.
#[derive(ZeroizeOnDrop)]
pub(crate) struct DerivedKeys {
    slots: [[u8; KEY_SLOT_LEN]; 6],
}

impl fmt::Debug for DerivedKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedKeys").finish_non_exhaustive()
    }
}

impl DerivedKeys {
    /// `K1 = HASH(K || H || letter || session_id)`, `K2 = HASH(K || H || K1)` etc.
    ///
    /// `k` is raw bytes and is hashed as an mpint.
    pub fn new(k: &[u8], h: &[u8], sess_id: &[u8]) -> Self {
        let mut base = Sha256::new();
        hash_mpint(&mut base, k);
        base.update(h);

        let mut slots = [[0u8; KEY_SLOT_LEN]; 6];
        for (slot, letter) in slots.iter_mut().zip(b'A'..=b'F') {
            Self::compute(&base, letter, sess_id, slot);
        }
        Self { slots }
    }

    fn compute(base: &Sha256, letter: u8, sess_id: &[u8], out: &mut [u8; KEY_SLOT_LEN]) {
        let hsz = Sha256::output_size();

        let mut hash_ctx = base.clone();
        hash_ctx.update([letter]);
        hash_ctx.update(sess_id);
        out[..hsz].copy_from_slice(&hash_ctx.finalize());

        // extend with HASH(K || H || K1 || K2 ...) until full
        let mut filled = hsz;
        while filled < out.len() {
            let mut hash_ctx = base.clone();
            hash_ctx.update(&out[..filled]);
            let kn = hash_ctx.finalize();
            let l = hsz.min(out.len() - filled);
            out[filled..filled + l].copy_from_slice(&kn[..l]);
            filled += l;
        }
    }

    fn slot(&self, letter: u8) -> &[u8] {
        &self.slots[(letter - b'A') as usize]
    }

    // Client to server uses the first letter of each pair
    fn letter(dir: Direction, is_client: bool, c2s_letter: u8) -> u8 {
        if (dir == Direction::Outbound) == is_client {
            c2s_letter
        } else {
            c2s_letter + 1
        }
    }

    pub fn iv(&self, dir: Direction, is_client: bool) -> &[u8] {
        self.slot(Self::letter(dir, is_client, b'A'))
    }

    pub fn enc_key(&self, dir: Direction, is_client: bool) -> &[u8] {
        self.slot(Self::letter(dir, is_client, b'C'))
    }

    pub fn integ_key(&self, dir: Direction, is_client: bool) -> &[u8] {
        self.slot(Self::letter(dir, is_client, b'E'))
    }
}

#[derive(ZeroizeOnDrop)]
pub(crate) struct KexCurve25519 {
    // Initialised in `new()`, cleared after deriving the secret
    ours: Option<x25519_dalek::EphemeralSecret>,
    // pubkey is relatively expensive to compute from the secret key
    pubkey: [u8; 32],
    #[zeroize(skip)]
    name: &'static str,
}

impl core::fmt::Debug for KexCurve25519 {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("KexCurve25519")
            .field("ours", &if self.ours.is_some() { "Some" } else { "None" })
            .field("pubkey", &self.pubkey)
            .finish()
    }
}

impl KexCurve25519 {
    fn new(name: &'static str) -> Self {
        let ours = x25519_dalek::EphemeralSecret::random_from_rng(OsRng);
        let pubkey = x25519_dalek::PublicKey::from(&ours);
        let pubkey = pubkey.to_bytes();
        KexCurve25519 { ours: Some(ours), pubkey, name }
    }

    fn pubkey(&self) -> &[u8] {
        &self.pubkey
    }

    fn secret(algos: &mut Algos, theirs: &[u8], kex_hash: KexHash) -> Result<KexOutput> {
        #[allow(irrefutable_let_patterns)] // until we have other algos
        let kex = if let SharedSecret::KexCurve25519(k) = &mut algos.kex {
            k
        } else {
            return Err(Error::bug());
        };
        let theirs: [u8; 32] = theirs.try_into().map_err(|_| Error::BadKex)?;
        let theirs = theirs.into();
        let shsec = kex.ours.take().trap()?.diffie_hellman(&theirs);
        if !shsec.was_contributory() {
            debug!("Peer sent a low order curve25519 point");
            return Err(Error::BadKex);
        }
        KexOutput::new(shsec.as_bytes(), kex_hash)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;

    use crate::behaviour::{BhResult, CliBehaviour};
    use crate::encrypt::KeyState;
    use crate::hostkey::Ed25519HostKey;
    use crate::kex::*;
    use crate::packets::{ParseContext, PubKey};
    use crate::registry::AlgoOptions;
    use crate::sshlog::init_test_log;
    use crate::sshwire::packet_from_bytes;
    use crate::traffic::{TrafIn, TrafOut};

    struct TestCliBehaviour {
        allow_key: bool,
    }

    impl CliBehaviour for TestCliBehaviour {
        fn valid_hostkey(&mut self, _key: &PubKey) -> BhResult<bool> {
            Ok(self.allow_key)
        }
    }

    /// One end of a connection, without the Conn state machine
    struct Side {
        out: TrafOut,
        inp: TrafIn,
        keys: KeyState,
        rv: RemoteVersion,
        kex: Kex,
        suite: AlgorithmSuite,
        sess_id: Option<SessId>,
        is_client: bool,
        // bytes received from the peer, not yet consumed
        wire: VecDeque<u8>,
    }

    impl Side {
        fn new(is_client: bool, opts: &AlgoOptions) -> Self {
            // both ends send the same version string
            let mut rv = RemoteVersion::new();
            let mut v = OUR_VERSION.to_vec();
            v.extend_from_slice(b"\r\n");
            rv.consume(&v).unwrap();

            Self {
                out: TrafOut::new(),
                inp: TrafIn::new(),
                keys: KeyState::new_cleartext(),
                rv,
                kex: Kex::new(),
                suite: AlgorithmSuite::new(is_client, opts).unwrap(),
                sess_id: None,
                is_client,
                wire: VecDeque::new(),
            }
        }

        fn send_kexinit(&mut self) {
            self.kex.send_kexinit(&self.suite, &mut self.out.sender(&mut self.keys)).unwrap();
        }

        /// Moves our pending output to the peer
        fn flush_to(&mut self, peer: &mut Side) {
            peer.wire.extend(self.out.take_output());
        }

        /// Decodes the next packet payload received, if complete
        fn next(&mut self) -> Option<Vec<u8>> {
            let b = self.wire.make_contiguous().to_vec();
            let l = self.inp.input(&mut self.keys, &mut self.rv, &b).unwrap();
            self.wire.drain(..l);
            let p = self.inp.payload().map(|(p, _seq)| p.to_vec());
            self.inp.done_payload();
            p
        }

        /// Handles one received kex packet, returns the message number
        fn handle_next(&mut self, cb: &mut TestCliBehaviour, hk: &Ed25519HostKey) -> Result<u8> {
            let payload = self.next().trap()?;
            let p = packet_from_bytes(&payload, &ParseContext::new())?;
            let num = p.message_num() as u8;
            let first_kex = self.sess_id.is_none();
            let mut s = self.out.sender(&mut self.keys);
            match p {
                Packet::KexInit(k) => self.kex.handle_kexinit(
                    k,
                    self.is_client,
                    &self.suite,
                    &self.rv,
                    first_kex,
                    false,
                    &mut s,
                )?,
                Packet::KexDHInit(k) => {
                    self.kex.handle_kexdhinit(&k, hk, &mut self.sess_id, first_kex, &mut s)?
                }
                Packet::KexDHReply(k) => {
                    self.kex.handle_kexdhreply(&k, cb, &mut self.sess_id, first_kex, &mut s)?
                }
                Packet::NewKeys(_) => {
                    self.kex.handle_newkeys(&mut s)?;
                }
                Packet::ExtInfo(e) => {
                    let algs = e.server_sig_algs.trap()?;
                    assert!(algs.has_algo(SSH_NAME_ED25519)?);
                }
                _ => return Err(Error::PacketWrong),
            }
            Ok(num)
        }
    }

    /// Runs an exchange started by either side, returning the message
    /// numbers each side received
    fn run_kex(
        cli: &mut Side,
        serv: &mut Side,
        allow_key: bool,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        let hk = Ed25519HostKey::from_seed(&[9u8; 32]);
        let mut cb = TestCliBehaviour { allow_key };
        let mut cli_got = vec![];
        let mut serv_got = vec![];

        loop {
            cli.flush_to(serv);
            serv.flush_to(cli);
            if cli.wire.is_empty() && serv.wire.is_empty() {
                break;
            }
            while !serv.wire.is_empty() {
                serv_got.push(serv.handle_next(&mut cb, &hk)?);
            }
            while !cli.wire.is_empty() {
                cli_got.push(cli.handle_next(&mut cb, &hk)?);
            }
        }
        Ok((cli_got, serv_got))
    }

    fn exchange_ignore(from: &mut Side, to: &mut Side) {
        let mut s = from.out.sender(&mut from.keys);
        s.send(packets::Ignore { data: BinString(b"after kex") }).unwrap();
        from.flush_to(to);
        let payload = to.next().unwrap();
        let p = packet_from_bytes(&payload, &ParseContext::new()).unwrap();
        if let Packet::Ignore(i) = p {
            assert_eq!(i.data.0, b"after kex");
        } else {
            panic!("expected ignore, got {p:?}");
        }
    }

    #[test]
    fn agree_kex() {
        init_test_log();
        let mut cli = Side::new(true, &AlgoOptions::default());
        let mut serv = Side::new(false, &AlgoOptions::default());
        cli.send_kexinit();
        let (cli_got, serv_got) = run_kex(&mut cli, &mut serv, true).unwrap();

        // kexinit, kexdhreply, newkeys, ext-info
        assert_eq!(cli_got, [20, 31, 21, 7]);
        // kexinit, kexdhinit, newkeys
        assert_eq!(serv_got, [20, 30, 21]);
        assert!(cli.kex.is_idle() && serv.kex.is_idle());
        assert_eq!(cli.sess_id, serv.sess_id);
        assert!(!cli.keys.is_initial(Direction::Inbound));
        assert!(!serv.keys.is_initial(Direction::Outbound));

        // both ends strict, sequence numbers restarted after NEWKEYS
        assert_eq!(serv.keys.recv_seq(), 0);
        // ext-info was sent after the reset
        assert_eq!(serv.keys.send_seq(), 1);

        exchange_ignore(&mut cli, &mut serv);
        exchange_ignore(&mut serv, &mut cli);
    }

    #[test]
    fn agree_kex_none() {
        init_test_log();
        let mut cli = Side::new(true, &AlgoOptions::null());
        let mut serv = Side::new(false, &AlgoOptions::null());
        cli.send_kexinit();
        run_kex(&mut cli, &mut serv, true).unwrap();
        assert!(cli.keys.is_null(Direction::Outbound));
        assert!(cli.keys.is_null(Direction::Inbound));
        assert!(serv.keys.is_null(Direction::Outbound));
        assert!(!cli.keys.is_initial(Direction::Outbound));
        exchange_ignore(&mut cli, &mut serv);
        exchange_ignore(&mut serv, &mut cli);
    }

    #[test]
    fn rekey_keeps_sess_id() {
        init_test_log();
        let mut cli = Side::new(true, &AlgoOptions::default());
        let mut serv = Side::new(false, &AlgoOptions::null());
        cli.send_kexinit();
        run_kex(&mut cli, &mut serv, true).unwrap();
        let first = cli.sess_id.clone();
        exchange_ignore(&mut cli, &mut serv);

        // server initiates the second exchange
        serv.send_kexinit();
        let (cli_got, _) = run_kex(&mut cli, &mut serv, true).unwrap();
        // no ext-info on a rekey
        assert_eq!(cli_got, [20, 31, 21]);
        assert_eq!(cli.sess_id, first);
        assert_eq!(serv.sess_id, first);
        exchange_ignore(&mut serv, &mut cli);
        exchange_ignore(&mut cli, &mut serv);
    }

    #[test]
    fn agree_kex_disallow_key() {
        init_test_log();
        let mut cli = Side::new(true, &AlgoOptions::default());
        let mut serv = Side::new(false, &AlgoOptions::default());
        cli.send_kexinit();
        let r = run_kex(&mut cli, &mut serv, false);
        assert!(matches!(r, Err(Error::BadKey)));
    }

    #[test]
    fn repeated_kexinit() {
        init_test_log();
        let mut cli = Side::new(true, &AlgoOptions::default());
        let mut serv = Side::new(false, &AlgoOptions::default());
        cli.send_kexinit();
        let mut s = cli.out.sender(&mut cli.keys);
        s.send(Kex::make_kexinit(&[0u8; 16], &cli.suite)).unwrap();
        cli.flush_to(&mut serv);
        let hk = Ed25519HostKey::from_seed(&[9u8; 32]);
        let mut cb = TestCliBehaviour { allow_key: true };
        serv.handle_next(&mut cb, &hk).unwrap();
        assert!(matches!(serv.handle_next(&mut cb, &hk), Err(Error::PacketWrong)));
    }

    fn remote<'a>(
        kex: &'a str,
        cipher: &'a str,
        mac: &'a str,
        first_follows: bool,
    ) -> packets::KexInit<'a> {
        let n = |s: &'a str| NameList::try_from(s).unwrap();
        packets::KexInit {
            cookie: [1u8; 16],
            kex: n(kex),
            hostsig: n(SSH_NAME_ED25519),
            cipher_c2s: n(cipher),
            cipher_s2c: n(cipher),
            mac_c2s: n(mac),
            mac_s2c: n(mac),
            comp_c2s: n(SSH_NAME_NONE),
            comp_s2c: n(SSH_NAME_NONE),
            lang_c2s: NameList::empty(),
            lang_s2c: NameList::empty(),
            first_follows,
            reserved: 0,
        }
    }

    fn explicit(ciphers: &[&str], macs: &[&str]) -> AlgorithmSuite {
        let opts = AlgoOptions {
            allow_none_cipher: true,
            allow_none_mac: true,
            ciphers: Some(ciphers.iter().map(|s| s.to_string()).collect()),
            macs: Some(macs.iter().map(|s| s.to_string()).collect()),
            ..Default::default()
        };
        AlgorithmSuite::new(true, &opts).unwrap()
    }

    #[test]
    fn client_preference_wins() {
        init_test_log();
        let ours = explicit(&["aes128-ctr", "none"], &["hmac-sha2-256", "none"]);
        let p = remote("curve25519-sha256", "none,aes128-ctr", "none,hmac-sha2-256", false);

        // we are the client, our order decides
        let a = Kex::algo_negotiation(true, &p, &ours).unwrap();
        assert_eq!(a.cipher_enc, Cipher::Aes128Ctr);
        assert_eq!(a.cipher_dec, Cipher::Aes128Ctr);
        assert_eq!(a.integ_enc, Integ::HmacSha256);

        // we are the server, the remote client's order decides
        let a = Kex::algo_negotiation(false, &p, &ours).unwrap();
        assert_eq!(a.cipher_enc, Cipher::None);
        assert_eq!(a.integ_dec, Integ::None);
        let n = a.negotiated();
        assert!(n.is_null());
        assert_eq!(n.kex, SSH_NAME_CURVE25519);
    }

    #[test]
    fn aead_ignores_mac() {
        let ours = AlgorithmSuite::new(true, &AlgoOptions::default()).unwrap();
        let p = remote("curve25519-sha256", SSH_NAME_CHAPOLY, "hmac-md5", false);
        let a = Kex::algo_negotiation(true, &p, &ours).unwrap();
        assert_eq!(a.integ_enc, Integ::ChaPoly);
        assert_eq!(a.negotiated().mac_c2s, SSH_NAME_CHAPOLY);
    }

    #[test]
    fn no_match() {
        init_test_log();
        let ours = AlgorithmSuite::new(true, &AlgoOptions::default()).unwrap();
        let p = remote("curve25519-sha256", "3des-cbc", "hmac-sha2-256", false);
        assert!(matches!(
            Kex::algo_negotiation(true, &p, &ours),
            Err(Error::AlgoNoMatch { algo: "encryption" })
        ));

        // "none" offered by the peer only
        let p = remote("curve25519-sha256", "aes256-ctr", "none", false);
        assert!(matches!(
            Kex::algo_negotiation(true, &p, &ours),
            Err(Error::AlgoNoMatch { algo: "mac" })
        ));

        let p = remote("diffie-hellman-group1-sha1", "aes256-ctr", "hmac-sha2-256", false);
        assert!(matches!(
            Kex::algo_negotiation(true, &p, &ours),
            Err(Error::AlgoNoMatch { algo: "kex" })
        ));
    }

    #[test]
    fn marker_only_kex() {
        let ours = AlgorithmSuite::new(false, &AlgoOptions::default()).unwrap();
        let p = remote(
            "kexguess2@matt.ucc.asn.au,kex-strict-s-v00@openssh.com",
            "aes256-ctr",
            "hmac-sha2-256",
            false,
        );
        assert!(matches!(
            Kex::algo_negotiation(false, &p, &ours),
            Err(Error::AlgoNoMatch { algo: "kex" })
        ));
    }

    #[test]
    fn markers_detected() {
        let ours = AlgorithmSuite::new(false, &AlgoOptions::default()).unwrap();
        let p = remote(
            "curve25519-sha256,ext-info-c,kex-strict-c-v00@openssh.com",
            "aes256-ctr",
            "hmac-sha2-256",
            false,
        );
        let a = Kex::algo_negotiation(false, &p, &ours).unwrap();
        assert!(a.send_ext_info);
        assert!(a.strict_kex);
        assert!(!a.discard_next);

        let p = remote("curve25519-sha256", "aes256-ctr", "hmac-sha2-256", false);
        let a = Kex::algo_negotiation(false, &p, &ours).unwrap();
        assert!(!a.send_ext_info);
        assert!(!a.strict_kex);
    }

    #[test]
    fn wrong_guess() {
        let ours = AlgorithmSuite::new(false, &AlgoOptions::default()).unwrap();
        // client's first kex isn't our first
        let p = remote(
            "curve25519-sha256@libssh.org,curve25519-sha256",
            "aes256-ctr",
            "hmac-sha2-256",
            true,
        );
        let a = Kex::algo_negotiation(false, &p, &ours).unwrap();
        assert_eq!(a.kex.name(), SSH_NAME_CURVE25519_LIBSSH);
        assert!(a.discard_next);

        // kexguess2 only needs the negotiated method to match the guess
        let p = remote(
            "curve25519-sha256@libssh.org,kexguess2@matt.ucc.asn.au",
            "aes256-ctr",
            "hmac-sha2-256",
            true,
        );
        let a = Kex::algo_negotiation(false, &p, &ours).unwrap();
        assert!(!a.discard_next);

        let p = remote("curve25519-sha256", "aes256-ctr", "hmac-sha2-256", true);
        let a = Kex::algo_negotiation(false, &p, &ours).unwrap();
        assert!(!a.discard_next);
    }

    fn all_slots(d: &DerivedKeys) -> Vec<Vec<u8>> {
        d.slots.iter().map(|s| s.to_vec()).collect()
    }

    #[test]
    fn derivation_deterministic() {
        let k = [0x80u8; 32];
        let a = DerivedKeys::new(&k, b"exchange-hash", b"session");
        let b = DerivedKeys::new(&k, b"exchange-hash", b"session");
        assert_eq!(all_slots(&a), all_slots(&b));

        // every slot differs from the others
        let s = all_slots(&a);
        for i in 0..6 {
            for j in (i + 1)..6 {
                assert_ne!(s[i], s[j]);
            }
        }

        // changing any input changes all six keys
        let k2 = [0x81u8; 32];
        for other in [
            DerivedKeys::new(&k2, b"exchange-hash", b"session"),
            DerivedKeys::new(&k, b"exchange-hasH", b"session"),
            DerivedKeys::new(&k, b"exchange-hash", b"sessioN"),
        ] {
            let o = all_slots(&other);
            for i in 0..6 {
                assert_ne!(s[i], o[i]);
            }
        }
    }

    #[test]
    fn derivation_matches_rfc() {
        // high bit set, K is hashed with a leading zero byte
        let k = [0x80u8; 32];
        let h = [3u8; 32];
        let sess = [4u8; 32];
        let d = DerivedKeys::new(&k, &h, &sess);

        let mut mpint_k = vec![0, 0, 0, 33, 0];
        mpint_k.extend_from_slice(&k);

        let k1 = Sha256::new()
            .chain_update(&mpint_k)
            .chain_update(h)
            .chain_update(b"C")
            .chain_update(sess)
            .finalize();
        let k2 = Sha256::new()
            .chain_update(&mpint_k)
            .chain_update(h)
            .chain_update(k1)
            .finalize();
        let c = d.enc_key(Direction::Outbound, true);
        assert_eq!(&c[..32], k1.as_slice());
        assert_eq!(&c[32..], k2.as_slice());
    }

    #[test]
    fn direction_letters() {
        let d = DerivedKeys::new(&[1u8; 32], &[2u8; 32], &[3u8; 32]);
        // client outbound is server inbound
        assert_eq!(d.iv(Direction::Outbound, true), d.iv(Direction::Inbound, false));
        assert_eq!(d.iv(Direction::Outbound, true), d.slot(b'A'));
        assert_eq!(d.iv(Direction::Inbound, true), d.slot(b'B'));
        assert_eq!(d.enc_key(Direction::Outbound, false), d.slot(b'D'));
        assert_eq!(d.integ_key(Direction::Inbound, false), d.slot(b'E'));
        assert_eq!(d.integ_key(Direction::Inbound, true), d.slot(b'F'));
    }
}
