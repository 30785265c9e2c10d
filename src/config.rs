//! Limits and runtime configuration for a session.

use core::time::Duration;

use crate::registry::AlgoOptions;

/// Identification string sent to the peer, without CR LF.
pub const OUR_VERSION: &[u8] = "SSH-2.0-nullssh_0.1".as_bytes();

/// Default channel window, also the size of a channel's receive buffer.
pub const DEFAULT_WINDOW: u32 = 64 * 1024;
/// Largest channel data payload we ask the peer to send.
pub const DEFAULT_MAX_PACKET: u32 = 32 * 1024;

// This can be increased arbitrarily, though note that some code paths assume
// a linear scan of channels can happen quickly.
pub const MAX_CHANNELS: usize = 4;

/// RFC4253 section 9 recommends rekeying after a gigabyte.
pub const REKEY_BYTES: u64 = 1 << 30;
/// RFC4344 section 3.1, 2**31 packets for a 128 bit block cipher
pub const REKEY_PACKETS: u64 = 1 << 31;
/// RFC4253 section 9 recommends rekeying after an hour.
pub const REKEY_TIME: Duration = Duration::from_secs(60 * 60);

/// Thresholds that trigger a new key exchange.
///
/// Bytes and packets are counted per direction since the last KEX.
#[derive(Debug, Clone)]
pub struct RekeyLimits {
    pub bytes: u64,
    pub packets: u64,
    pub time: Duration,
}

impl Default for RekeyLimits {
    fn default() -> Self {
        Self { bytes: REKEY_BYTES, packets: REKEY_PACKETS, time: REKEY_TIME }
    }
}

/// Per-session configuration, fixed once a transport is started.
#[derive(Debug, Clone)]
pub struct Config {
    pub algos: AlgoOptions,
    pub rekey: RekeyLimits,
    /// Initial window advertised for channels we open or accept
    pub window: u32,
    pub max_packet: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            algos: AlgoOptions::default(),
            rekey: RekeyLimits::default(),
            window: DEFAULT_WINDOW,
            max_packet: DEFAULT_MAX_PACKET,
        }
    }
}
