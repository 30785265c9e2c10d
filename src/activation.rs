//! Takes derived key material into use for one direction.
//!
//! A direction whose cipher or MAC is `"none"` still reads its key slots,
//! those bytes are then left unused. Sequence numbers and padding rules
//! apply to a null direction the same as any other.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use crate::encrypt::{Cipher, CipherKey, Direction, DirectionKeys, Integ, IntegKey};
use crate::kex::{Algos, DerivedKeys};

/// How a direction's keys are built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ActivationStrategy {
    /// Real cipher and MAC. `"none"` is refused.
    Standard,
    /// Either the cipher or MAC is `"none"`, and passes data unchanged.
    NullAware,
}

impl ActivationStrategy {
    pub fn select(cipher: &Cipher, integ: &Integ) -> Self {
        if matches!(cipher, Cipher::None) || matches!(integ, Integ::None) {
            Self::NullAware
        } else {
            Self::Standard
        }
    }

    pub fn direction_keys(
        self,
        dir: Direction,
        algos: &Algos,
        keys: &DerivedKeys,
    ) -> Result<DirectionKeys> {
        let (cipher, integ, comp) = algos.for_direction(dir);
        let iv = keys.iv(dir, algos.is_client);
        let enc = keys.enc_key(dir, algos.is_client);
        let ik = keys.integ_key(dir, algos.is_client);

        let (cipher, integ) = match self {
            Self::Standard => {
                if matches!(cipher, Cipher::None) || matches!(integ, Integ::None) {
                    return Err(Error::NotAvailable { what: "null cipher activation" });
                }
                (CipherKey::from_cipher(cipher, enc, iv)?, IntegKey::from_integ(integ, ik)?)
            }
            Self::NullAware => {
                let c = match cipher {
                    Cipher::None => CipherKey::NoCipher,
                    c => CipherKey::from_cipher(c, enc, iv)?,
                };
                let i = match integ {
                    Integ::None => IntegKey::NoInteg,
                    i => IntegKey::from_integ(i, ik)?,
                };
                (c, i)
            }
        };
        Ok(DirectionKeys { cipher, integ, comp: comp.clone() })
    }
}

/// Builds the keys for `dir` from a completed exchange.
pub(crate) fn activate(
    dir: Direction,
    algos: &Algos,
    keys: &DerivedKeys,
) -> Result<DirectionKeys> {
    let (cipher, integ, _) = algos.for_direction(dir);
    let strategy = ActivationStrategy::select(cipher, integ);
    if strategy == ActivationStrategy::NullAware {
        info!("{dir:?} direction uses cipher {cipher} mac {integ}, traffic is not protected");
    } else {
        debug!("Activating {dir:?} with {cipher} {integ}");
    }
    strategy.direction_keys(dir, algos, keys)
}

#[cfg(test)]
mod tests {
    use crate::activation::*;
    use crate::encrypt::{Compress, KeyState};
    use crate::kex::SharedSecret;
    use crate::sshlog::init_test_log;
    use crate::sshnames::*;

    fn algos(enc: (Cipher, Integ), dec: (Cipher, Integ), is_client: bool) -> Algos {
        Algos {
            kex: SharedSecret::from_name(SSH_NAME_CURVE25519).unwrap(),
            hostsig: SSH_NAME_ED25519,
            cipher_enc: enc.0,
            cipher_dec: dec.0,
            integ_enc: enc.1,
            integ_dec: dec.1,
            comp_enc: Compress::None,
            comp_dec: Compress::None,
            discard_next: false,
            is_client,
            send_ext_info: false,
            strict_kex: false,
        }
    }

    fn derived() -> DerivedKeys {
        DerivedKeys::new(&[5u8; 32], &[6u8; 32], &[7u8; 32])
    }

    #[test]
    fn select() {
        use ActivationStrategy::*;
        assert_eq!(ActivationStrategy::select(&Cipher::None, &Integ::None), NullAware);
        assert_eq!(ActivationStrategy::select(&Cipher::Aes256Ctr, &Integ::None), NullAware);
        assert_eq!(ActivationStrategy::select(&Cipher::None, &Integ::HmacSha256), NullAware);
        assert_eq!(ActivationStrategy::select(&Cipher::ChaPoly, &Integ::ChaPoly), Standard);
    }

    #[test]
    fn standard_refuses_none() {
        let a = algos((Cipher::None, Integ::None), (Cipher::Aes128Ctr, Integ::HmacSha256), true);
        let r = ActivationStrategy::Standard.direction_keys(Direction::Outbound, &a, &derived());
        assert!(matches!(r, Err(Error::NotAvailable { .. })));
        // the other direction is fine
        ActivationStrategy::Standard.direction_keys(Direction::Inbound, &a, &derived()).unwrap();
    }

    #[test]
    fn null_aware_mixed() {
        init_test_log();
        let a = algos(
            (Cipher::None, Integ::HmacSha256Etm),
            (Cipher::Aes256Ctr, Integ::None),
            false,
        );
        let d = derived();
        let out = activate(Direction::Outbound, &a, &d).unwrap();
        assert!(out.cipher.is_null());
        assert!(out.integ.is_etm());
        let inb = activate(Direction::Inbound, &a, &d).unwrap();
        assert!(!inb.cipher.is_null());
        assert!(inb.integ.is_null());
    }

    #[test]
    fn strategies_agree() {
        init_test_log();
        // a client's outbound keys must decrypt as a server's inbound keys,
        // whichever strategy built them
        let cli = algos((Cipher::Aes128Ctr, Integ::HmacSha256), (Cipher::None, Integ::None), true);
        let serv =
            algos((Cipher::None, Integ::None), (Cipher::Aes128Ctr, Integ::HmacSha256), false);
        let d = derived();

        let out = ActivationStrategy::NullAware.direction_keys(Direction::Outbound, &cli, &d);
        let inb = ActivationStrategy::Standard.direction_keys(Direction::Inbound, &serv, &d);

        let mut ke = KeyState::new_cleartext();
        let mut kd = KeyState::new_cleartext();
        ke.configure(Direction::Outbound, out.unwrap());
        kd.configure(Direction::Inbound, inb.unwrap());

        let payload = b"\x02hello";
        let mut buf = vec![0u8; ke.enc_packet_len(payload.len())];
        buf[5..5 + payload.len()].copy_from_slice(payload);
        let l = ke.encrypt(payload.len(), &mut buf).unwrap();
        assert_ne!(&buf[5..5 + payload.len()], payload);

        assert_eq!(l, buf.len());
        kd.decrypt_first_block(&mut buf).unwrap();
        let plen = kd.decrypt(&mut buf).unwrap();
        assert_eq!(&buf[5..5 + plen], payload);
    }
}
