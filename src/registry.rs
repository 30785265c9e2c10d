//! Supported algorithms and per-session preference lists.
//!
//! The parameter tables here are process-wide and immutable. Each session
//! builds its own [`AlgorithmSuite`] from them plus its [`AlgoOptions`].

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use core::fmt;

use sha2::Digest;

use crate::encrypt::{Cipher, Integ};
use crate::namelist::LocalNames;
use crate::sshnames::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlgoCategory {
    Kex,
    HostKey,
    Cipher,
    Mac,
    Compression,
}

impl fmt::Display for AlgoCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = match self {
            Self::Kex => "kex",
            Self::HostKey => "hostkey",
            Self::Cipher => "cipher",
            Self::Mac => "mac",
            Self::Compression => "compression",
        };
        write!(f, "{n}")
    }
}

/// Parameters needed to instantiate an algorithm.
///
/// `digest_len` is the MAC or tag length for ciphers and MACs, and the
/// hash output length for key exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlgoInfo {
    pub block_size: usize,
    pub key_len: usize,
    pub iv_len: usize,
    pub aead: bool,
    pub digest_len: usize,
    pub etm: bool,
}

impl AlgoInfo {
    /// Parameters of `"none"`. Framing still uses the minimum block size.
    pub const NULL: AlgoInfo = AlgoInfo {
        block_size: crate::encrypt::SSH_MIN_BLOCK,
        key_len: 0,
        iv_len: 0,
        aead: false,
        digest_len: 0,
        etm: false,
    };

    fn of_cipher(c: &Cipher) -> Self {
        AlgoInfo {
            block_size: c.block_size(),
            key_len: c.key_len(),
            iv_len: c.iv_len(),
            aead: c.is_aead(),
            digest_len: c.integ().map(|i| i.size_out()).unwrap_or(0),
            etm: false,
        }
    }

    fn of_integ(i: &Integ) -> Self {
        AlgoInfo {
            key_len: i.key_len(),
            digest_len: i.size_out(),
            etm: i.is_etm(),
            ..Self::NULL
        }
    }
}

struct Entry {
    name: &'static str,
    // Offered unless a session asks otherwise
    default: bool,
}

const fn entry(name: &'static str, default: bool) -> Entry {
    Entry { name, default }
}

// Tables are in default preference order. Parameters come from
// the implementations in `encrypt`.

const KEXS: &[Entry] =
    &[entry(SSH_NAME_CURVE25519, true), entry(SSH_NAME_CURVE25519_LIBSSH, true)];

const HOSTKEYS: &[Entry] = &[entry(SSH_NAME_ED25519, true)];

const CIPHERS: &[Entry] = &[
    entry(SSH_NAME_CHAPOLY, true),
    entry(SSH_NAME_AES256_CTR, true),
    entry(SSH_NAME_AES128_CTR, true),
    entry(SSH_NAME_NONE, false),
];

const MACS: &[Entry] = &[
    entry(SSH_NAME_HMAC_SHA256_ETM, true),
    entry(SSH_NAME_HMAC_SHA256, true),
    entry(SSH_NAME_NONE, false),
];

const COMPS: &[Entry] = &[
    entry(SSH_NAME_NONE, true),
    entry(SSH_NAME_ZLIB_OPENSSH, false),
    entry(SSH_NAME_ZLIB, false),
];

/// Names that are only flags in the kex list, never negotiated as a
/// kex algorithm.
pub(crate) const MARKER_ONLY_KEXS: &[&str] = &[
    SSH_NAME_EXT_INFO_C,
    SSH_NAME_EXT_INFO_S,
    SSH_NAME_KEXGUESS2,
    SSH_NAME_STRICT_KEX_C,
    SSH_NAME_STRICT_KEX_S,
];

fn table(cat: AlgoCategory) -> &'static [Entry] {
    match cat {
        AlgoCategory::Kex => KEXS,
        AlgoCategory::HostKey => HOSTKEYS,
        AlgoCategory::Cipher => CIPHERS,
        AlgoCategory::Mac => MACS,
        AlgoCategory::Compression => COMPS,
    }
}

/// All names known for a category, in default preference order.
///
/// `"none"` is included where it exists, though it is only offered when
/// a session opts in.
pub fn supported(cat: AlgoCategory) -> Vec<&'static str> {
    table(cat).iter().map(|e| e.name).collect()
}

/// Parameters for a named algorithm.
pub fn info(cat: AlgoCategory, name: &str) -> Result<AlgoInfo> {
    let e = lookup(cat, name)?;
    let i = match cat {
        // curve25519-sha256 in either spelling
        AlgoCategory::Kex => {
            AlgoInfo { digest_len: sha2::Sha256::output_size(), ..AlgoInfo::NULL }
        }
        AlgoCategory::Cipher => AlgoInfo::of_cipher(&Cipher::from_name(e.name)?),
        AlgoCategory::Mac => AlgoInfo::of_integ(&Integ::from_name(e.name)?),
        AlgoCategory::HostKey | AlgoCategory::Compression => AlgoInfo::NULL,
    };
    Ok(i)
}

fn lookup(cat: AlgoCategory, name: &str) -> Result<&'static Entry> {
    table(cat)
        .iter()
        .find(|e| e.name == name)
        .ok_or(Error::BadUsage { msg: "unknown algorithm name" })
}

fn defaults(cat: AlgoCategory) -> impl Iterator<Item = &'static str> {
    table(cat).iter().filter(|e| e.default).map(|e| e.name)
}

/// Session choices for the cipher and MAC preference lists.
///
/// `"none"` is only accepted when its flag is set. With the flag set and
/// no explicit list, `"none"` is placed first ahead of the defaults.
/// An explicit list is used as given, after validation.
#[derive(Debug, Clone, Default)]
pub struct AlgoOptions {
    pub allow_none_cipher: bool,
    pub allow_none_mac: bool,
    pub ciphers: Option<Vec<String>>,
    pub macs: Option<Vec<String>>,
    /// Offers `zlib@openssh.com` and `zlib` ahead of `"none"`
    pub compression: bool,
}

impl AlgoOptions {
    /// Prefers `"none"` cipher and MAC, falling back to real algorithms.
    pub fn null() -> Self {
        Self { allow_none_cipher: true, allow_none_mac: true, ..Default::default() }
    }
}

/// Per-session algorithm preference lists, sent in our KEXINIT.
///
/// Constructed once per session and not modified afterwards.
#[derive(Debug, Clone)]
pub struct AlgorithmSuite {
    pub(crate) kex: LocalNames,
    pub(crate) hostsig: LocalNames,
    pub(crate) cipher_c2s: LocalNames,
    pub(crate) cipher_s2c: LocalNames,
    pub(crate) mac_c2s: LocalNames,
    pub(crate) mac_s2c: LocalNames,
    pub(crate) comp_c2s: LocalNames,
    pub(crate) comp_s2c: LocalNames,
}

impl AlgorithmSuite {
    pub fn new(is_client: bool, opts: &AlgoOptions) -> Result<Self> {
        let mut kex = LocalNames::new();
        for n in defaults(AlgoCategory::Kex) {
            kex.push(n)?;
        }
        // Only clients are interested in ext-info
        if is_client {
            kex.push(SSH_NAME_EXT_INFO_C)?;
            kex.push(SSH_NAME_STRICT_KEX_C)?;
        } else {
            kex.push(SSH_NAME_STRICT_KEX_S)?;
        }
        kex.push(SSH_NAME_KEXGUESS2)?;

        let hostsig = Self::build(AlgoCategory::HostKey, None, false)?;
        let ciphers = Self::build(
            AlgoCategory::Cipher,
            opts.ciphers.as_deref(),
            opts.allow_none_cipher,
        )?;
        let macs =
            Self::build(AlgoCategory::Mac, opts.macs.as_deref(), opts.allow_none_mac)?;
        let comps = if opts.compression {
            let mut l = LocalNames::new();
            for n in [SSH_NAME_ZLIB_OPENSSH, SSH_NAME_ZLIB, SSH_NAME_NONE] {
                l.push(n)?;
            }
            l
        } else {
            Self::build(AlgoCategory::Compression, None, false)?
        };

        Ok(Self {
            kex,
            hostsig,
            cipher_c2s: ciphers.clone(),
            cipher_s2c: ciphers,
            mac_c2s: macs.clone(),
            mac_s2c: macs,
            comp_c2s: comps.clone(),
            comp_s2c: comps,
        })
    }

    fn build(
        cat: AlgoCategory,
        explicit: Option<&[String]>,
        allow_none: bool,
    ) -> Result<LocalNames> {
        let mut l = LocalNames::new();
        match explicit {
            Some(names) => {
                if names.is_empty() {
                    return Err(Error::BadUsage { msg: "empty algorithm list" });
                }
                for n in names {
                    if n == SSH_NAME_NONE && !allow_none {
                        debug!("{cat} \"none\" given without opting in");
                        return Err(Error::BadUsage {
                            msg: "\"none\" algorithm not enabled",
                        });
                    }
                    let e = lookup(cat, n)?;
                    if l.contains(e.name) {
                        return Err(Error::BadUsage { msg: "duplicate algorithm name" });
                    }
                    l.push(e.name)
                        .map_err(|_| Error::BadUsage { msg: "too many algorithms" })?;
                }
            }
            None => {
                if allow_none {
                    l.push(SSH_NAME_NONE)?;
                }
                for n in defaults(cat) {
                    l.push(n)?;
                }
            }
        }
        Ok(l)
    }

    /// Returns whether `"none"` appears in any cipher or MAC list.
    pub fn offers_none(&self) -> bool {
        [&self.cipher_c2s, &self.cipher_s2c, &self.mac_c2s, &self.mac_s2c]
            .iter()
            .any(|l| l.contains(SSH_NAME_NONE))
    }
}

#[cfg(test)]
mod tests {
    use crate::encrypt::{Cipher, Compress, Integ};
    use crate::error::Error;
    use crate::registry::*;
    use crate::sshlog::init_test_log;

    /// Checks that every registered name has an implementation
    fn check_tables() -> Result<()> {
        for e in CIPHERS {
            Cipher::from_name(e.name)?;
        }
        for e in MACS {
            Integ::from_name(e.name)?;
        }
        for e in COMPS {
            Compress::from_name(e.name)?;
        }
        Ok(())
    }

    fn names(l: &LocalNames) -> Vec<&'static str> {
        l.0.iter().copied().collect()
    }

    #[test]
    fn tables_complete() {
        check_tables().unwrap();
        for n in supported(AlgoCategory::Compression) {
            assert_eq!(info(AlgoCategory::Compression, n).unwrap(), AlgoInfo::NULL);
        }
    }

    #[test]
    fn info_follows_implementation() {
        let i = info(AlgoCategory::Cipher, SSH_NAME_CHAPOLY).unwrap();
        assert_eq!((i.key_len, i.iv_len, i.block_size), (64, 0, 8));
        assert!(i.aead);
        assert_eq!(i.digest_len, 16);

        let i = info(AlgoCategory::Cipher, SSH_NAME_AES256_CTR).unwrap();
        assert_eq!((i.key_len, i.iv_len, i.block_size), (32, 16, 16));
        assert!(!i.aead);
        let i = info(AlgoCategory::Cipher, SSH_NAME_AES128_CTR).unwrap();
        assert_eq!(i.key_len, 16);

        let i = info(AlgoCategory::Mac, SSH_NAME_HMAC_SHA256_ETM).unwrap();
        assert_eq!((i.key_len, i.digest_len), (32, 32));
        assert!(i.etm);
        assert!(!info(AlgoCategory::Mac, SSH_NAME_HMAC_SHA256).unwrap().etm);

        assert_eq!(info(AlgoCategory::Kex, SSH_NAME_CURVE25519).unwrap().digest_len, 32);
    }

    #[test]
    fn none_info() {
        assert_eq!(info(AlgoCategory::Cipher, "none").unwrap(), AlgoInfo::NULL);
        assert_eq!(info(AlgoCategory::Mac, "none").unwrap(), AlgoInfo::NULL);
        assert_eq!(AlgoInfo::NULL.block_size, 8);
        assert!(info(AlgoCategory::Kex, "none").is_err());
        assert!(info(AlgoCategory::Cipher, "3des-cbc").is_err());
    }

    #[test]
    fn default_suite() {
        init_test_log();
        let s = AlgorithmSuite::new(true, &AlgoOptions::default()).unwrap();
        assert!(!s.offers_none());
        assert_eq!(
            names(&s.cipher_c2s),
            [SSH_NAME_CHAPOLY, SSH_NAME_AES256_CTR, SSH_NAME_AES128_CTR]
        );
        assert!(s.kex.contains(SSH_NAME_EXT_INFO_C));
        assert!(s.kex.contains(SSH_NAME_STRICT_KEX_C));
        assert!(s.kex.contains(SSH_NAME_KEXGUESS2));
        assert_eq!(s.kex.first(), SSH_NAME_CURVE25519);

        let s = AlgorithmSuite::new(false, &AlgoOptions::default()).unwrap();
        assert!(!s.kex.contains(SSH_NAME_EXT_INFO_C));
        assert!(s.kex.contains(SSH_NAME_STRICT_KEX_S));
    }

    #[test]
    fn none_prepended() {
        let s = AlgorithmSuite::new(false, &AlgoOptions::null()).unwrap();
        assert_eq!(s.cipher_s2c.first(), SSH_NAME_NONE);
        assert_eq!(s.mac_c2s.first(), SSH_NAME_NONE);
        assert_eq!(s.mac_c2s.0.len(), 3);

        let opts = AlgoOptions { allow_none_mac: true, ..Default::default() };
        let s = AlgorithmSuite::new(false, &opts).unwrap();
        assert_eq!(s.cipher_s2c.first(), SSH_NAME_CHAPOLY);
        assert_eq!(s.mac_s2c.first(), SSH_NAME_NONE);
    }

    #[test]
    fn explicit_lists() {
        let opts = AlgoOptions {
            allow_none_cipher: true,
            allow_none_mac: true,
            ciphers: Some(vec!["none".into(), "aes128-ctr".into()]),
            macs: Some(vec!["hmac-sha2-256".into(), "none".into()]),
            ..Default::default()
        };
        let s = AlgorithmSuite::new(true, &opts).unwrap();
        assert_eq!(names(&s.cipher_c2s), ["none", "aes128-ctr"]);
        assert_eq!(names(&s.mac_s2c), ["hmac-sha2-256", "none"]);
    }

    #[test]
    fn compression_offered() {
        let s = AlgorithmSuite::new(true, &AlgoOptions::default()).unwrap();
        assert_eq!(names(&s.comp_c2s), [SSH_NAME_NONE]);
        let opts = AlgoOptions { compression: true, ..Default::default() };
        let s = AlgorithmSuite::new(true, &opts).unwrap();
        assert_eq!(names(&s.comp_s2c), ["zlib@openssh.com", "zlib", "none"]);
    }

    #[test]
    fn rejected_lists() {
        let bad = |ciphers: Vec<&str>, allow: bool| {
            let opts = AlgoOptions {
                allow_none_cipher: allow,
                ciphers: Some(ciphers.into_iter().map(String::from).collect()),
                ..Default::default()
            };
            AlgorithmSuite::new(true, &opts)
        };
        // none without opting in
        assert!(matches!(bad(vec!["none"], false), Err(Error::BadUsage { .. })));
        assert!(matches!(bad(vec![], true), Err(Error::BadUsage { .. })));
        assert!(matches!(bad(vec!["aes999-ctr"], true), Err(Error::BadUsage { .. })));
        assert!(matches!(
            bad(vec!["aes128-ctr", "aes128-ctr"], true),
            Err(Error::BadUsage { .. })
        ));
        assert!(bad(vec!["none"], true).is_ok());

        // a "none" MAC needs its own flag
        let opts = AlgoOptions {
            allow_none_cipher: true,
            macs: Some(vec!["none".into()]),
            ..Default::default()
        };
        assert!(AlgorithmSuite::new(false, &opts).is_err());
    }
}
