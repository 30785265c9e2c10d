//! Named SSH algorithms, methods, and extensions.
//!
//! Packet numbers are listed in `packets.rs`.
//!
//! This module also serves as an index of SSH specifications.

/// Port the demo server listens on by default.
pub const DEMO_PORT: u16 = 2200;

/// [RFC8731](https://tools.ietf.org/html/rfc8731)
pub const SSH_NAME_CURVE25519: &str = "curve25519-sha256";
/// An older alias prior to standardisation.
pub const SSH_NAME_CURVE25519_LIBSSH: &str = "curve25519-sha256@libssh.org";
/// [RFC8308](https://tools.ietf.org/html/rfc8308) Extension Negotiation
pub const SSH_NAME_EXT_INFO_S: &str = "ext-info-s";
/// [RFC8308](https://tools.ietf.org/html/rfc8308) Extension Negotiation
pub const SSH_NAME_EXT_INFO_C: &str = "ext-info-c";
/// Implemented by Dropbear to improve first_kex_packet_follows, described
/// [https://mailarchive.ietf.org/arch/msg/secsh/3n6lNzDHmsGsIQSqhmHHwigIbuo/](https://mailarchive.ietf.org/arch/msg/secsh/3n6lNzDHmsGsIQSqhmHHwigIbuo/)
pub const SSH_NAME_KEXGUESS2: &str = "kexguess2@matt.ucc.asn.au";
/// OpenSSH strict key exchange, [PROTOCOL](https://cvsweb.openbsd.org/src/usr.bin/ssh/PROTOCOL?annotate=HEAD) 1.10
pub const SSH_NAME_STRICT_KEX_S: &str = "kex-strict-s-v00@openssh.com";
/// OpenSSH strict key exchange
pub const SSH_NAME_STRICT_KEX_C: &str = "kex-strict-c-v00@openssh.com";

/// [RFC8709](https://tools.ietf.org/html/rfc8709)
pub const SSH_NAME_ED25519: &str = "ssh-ed25519";

/// [RFC4344](https://tools.ietf.org/html/rfc4344)
pub const SSH_NAME_AES256_CTR: &str = "aes256-ctr";
/// [RFC4344](https://tools.ietf.org/html/rfc4344)
pub const SSH_NAME_AES128_CTR: &str = "aes128-ctr";
/// OpenSSH [PROTOCOL.chacha20poly1305.txt](https://cvsweb.openbsd.org/src/usr.bin/ssh/PROTOCOL.chacha20poly1305?annotate=HEAD)
pub const SSH_NAME_CHAPOLY: &str = "chacha20-poly1305@openssh.com";

/// [RFC6668](https://tools.ietf.org/html/rfc6668)
pub const SSH_NAME_HMAC_SHA256: &str = "hmac-sha2-256";
/// OpenSSH [PROTOCOL](https://cvsweb.openbsd.org/src/usr.bin/ssh/PROTOCOL?annotate=HEAD) 1.7
pub const SSH_NAME_HMAC_SHA256_ETM: &str = "hmac-sha2-256-etm@openssh.com";

/// [RFC4253](https://tools.ietf.org/html/rfc4253).
/// Used for cipher, MAC, compression and the userauth method.
pub const SSH_NAME_NONE: &str = "none";

/// [RFC4253](https://tools.ietf.org/html/rfc4253) compression
pub const SSH_NAME_ZLIB: &str = "zlib";
/// OpenSSH [PROTOCOL](https://cvsweb.openbsd.org/src/usr.bin/ssh/PROTOCOL?annotate=HEAD) 1.1,
/// zlib delayed until userauth succeeds
pub const SSH_NAME_ZLIB_OPENSSH: &str = "zlib@openssh.com";

/// [RFC4252](https://tools.ietf.org/html/rfc4252)
pub const SSH_SERVICE_USERAUTH: &str = "ssh-userauth";
/// [RFC4254](https://tools.ietf.org/html/rfc4254)
pub const SSH_SERVICE_CONNECTION: &str = "ssh-connection";

/// [RFC4252](https://tools.ietf.org/html/rfc4252)
pub const SSH_AUTHMETHOD_NONE: &str = "none";
/// [RFC4252](https://tools.ietf.org/html/rfc4252)
pub const SSH_AUTHMETHOD_PASSWORD: &str = "password";
/// [RFC4252](https://tools.ietf.org/html/rfc4252)
pub const SSH_AUTHMETHOD_PUBLICKEY: &str = "publickey";

/// [RFC4254](https://tools.ietf.org/html/rfc4254)
pub const SSH_CHANNEL_SESSION: &str = "session";

/// [RFC4254](https://tools.ietf.org/html/rfc4254) channel requests
pub const SSH_CHANREQ_SHELL: &str = "shell";
pub const SSH_CHANREQ_EXEC: &str = "exec";
pub const SSH_CHANREQ_PTY: &str = "pty-req";
pub const SSH_CHANREQ_EXIT_STATUS: &str = "exit-status";

/// [RFC8308](https://tools.ietf.org/html/rfc8308) Extension Negotiation
pub const SSH_EXT_SERVER_SIG_ALGS: &str = "server-sig-algs";

/// [RFC4254](https://tools.ietf.org/html/rfc4254)
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy)]
pub enum ChanFail {
    SSH_OPEN_ADMINISTRATIVELY_PROHIBITED = 1,
    SSH_OPEN_CONNECT_FAILED = 2,
    SSH_OPEN_UNKNOWN_CHANNEL_TYPE = 3,
    SSH_OPEN_RESOURCE_SHORTAGE = 4,
}

/// [RFC4253](https://tools.ietf.org/html/rfc4253) disconnect reasons
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy)]
pub enum DisconnectReason {
    SSH_DISCONNECT_PROTOCOL_ERROR = 2,
    SSH_DISCONNECT_KEY_EXCHANGE_FAILED = 3,
    SSH_DISCONNECT_MAC_ERROR = 5,
    SSH_DISCONNECT_SERVICE_NOT_AVAILABLE = 7,
    SSH_DISCONNECT_BY_APPLICATION = 11,
    SSH_DISCONNECT_NO_MORE_AUTH_METHODS_AVAILABLE = 14,
}
