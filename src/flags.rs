//! TCP flag-combination sanity checks.

use crate::packet::TcpFlags;

/// Report whether a flag combination is illegal on its face.
///
/// Catches the classic scan shapes before any state is consulted:
/// NULL (no flags), SYN+FIN, Xmas (FIN+PSH+URG), and a data offset that
/// cannot hold a TCP header.
pub fn invalid_tcp_flags(flags: &TcpFlags, data_offset: u8) -> bool {
    // NULL scan: no flags set
    if !flags.any() {
        return true;
    }
    // SYN+FIN is nonsensical
    if flags.syn && flags.fin {
        return true;
    }
    // Xmas scan: FIN+PSH+URG
    if flags.fin && flags.psh && flags.urg && !flags.syn && !flags.rst && !flags.ack {
        return true;
    }
    // Header len sanity
    if data_offset < 5 {
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags(syn: bool, ack: bool, fin: bool, rst: bool, psh: bool, urg: bool) -> TcpFlags {
        TcpFlags {
            syn,
            ack,
            fin,
            rst,
            psh,
            urg,
            ..Default::default()
        }
    }

    #[test]
    fn test_null_scan_is_invalid() {
        let null = TcpFlags::default();
        assert!(invalid_tcp_flags(&null, 5));
    }

    #[test]
    fn test_syn_fin_is_invalid() {
        assert!(invalid_tcp_flags(&flags(true, false, true, false, false, false), 5));
    }

    #[test]
    fn test_xmas_scan_is_invalid() {
        assert!(invalid_tcp_flags(&flags(false, false, true, false, true, true), 5));
    }

    #[test]
    fn test_xmas_with_ack_is_not_xmas() {
        assert!(!invalid_tcp_flags(&flags(false, true, true, false, true, true), 5));
    }

    #[test]
    fn test_low_data_offset_is_invalid() {
        assert!(invalid_tcp_flags(&flags(true, false, false, false, false, false), 4));
    }

    #[test]
    fn test_plain_syn_is_valid() {
        assert!(!invalid_tcp_flags(&flags(true, false, false, false, false, false), 5));
    }

    #[test]
    fn test_plain_ack_is_valid() {
        assert!(!invalid_tcp_flags(&flags(false, true, false, false, false, false), 5));
    }

    #[test]
    fn test_validator_is_idempotent() {
        let cases = [
            (TcpFlags::default(), 5u8),
            (flags(true, false, true, false, false, false), 5),
            (flags(false, true, false, false, false, false), 5),
            (flags(true, false, false, false, false, false), 4),
        ];
        for (f, off) in cases {
            assert_eq!(invalid_tcp_flags(&f, off), invalid_tcp_flags(&f, off));
        }
    }
}
