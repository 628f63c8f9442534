//! SYN cookie generation and validation.
//!
//! Used by the echo server to answer SYNs statelessly; the inline pipeline
//! never calls this. The cookie packs an 8-bit timestamp in the top byte and
//! 24 bits of HMAC-SHA256 below it, so the timestamp wraps every 256 units
//! of whatever resolution the caller picks. That wrap is part of the
//! observable format.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::net::Ipv4Addr;

type HmacSha256 = Hmac<Sha256>;

/// Mask for the hash portion of a cookie.
const HASH_MASK: u32 = 0x00ff_ffff;

/// Generate a SYN cookie (sequence number) for one endpoint and timestamp.
///
/// Only the low 8 bits of `ts` participate, on both sides, so a cookie
/// always validates against the timestamp it carries.
pub fn make_syn_cookie(ip: Ipv4Addr, port: u16, ts: u32, secret: &[u8]) -> u32 {
    let ts = ts & 0xff;

    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC-SHA256 takes any key length");
    mac.update(&ip.octets());
    mac.update(&port.to_be_bytes());
    mac.update(&ts.to_be_bytes());
    let sum = mac.finalize().into_bytes();

    let hash = u32::from_be_bytes([sum[0], sum[1], sum[2], sum[3]]) & HASH_MASK;
    (ts << 24) | hash
}

/// Check a candidate cookie: recover the timestamp from the top 8 bits and
/// recompute.
pub fn validate_syn_cookie(cookie: u32, ip: Ipv4Addr, port: u16, secret: &[u8]) -> bool {
    let ts = cookie >> 24;
    make_syn_cookie(ip, port, ts, secret) == cookie
}
