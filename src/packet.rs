//! Minimal IPv4/TCP header decoding for queued datagrams.
//!
//! The firewall only adjudicates well-formed IPv4/TCP. Anything else is
//! reported as `NotTcp` or `Malformed` and the pipeline passes it through
//! untouched.

/// The nine TCP flag bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
    pub psh: bool,
    pub urg: bool,
    pub ece: bool,
    pub cwr: bool,
    pub ns: bool,
}

impl TcpFlags {
    /// Decode the low 9 bits of the TCP offset/flags word.
    pub fn from_bits(bits: u16) -> Self {
        Self {
            fin: bits & 0x001 != 0,
            syn: bits & 0x002 != 0,
            rst: bits & 0x004 != 0,
            psh: bits & 0x008 != 0,
            ack: bits & 0x010 != 0,
            urg: bits & 0x020 != 0,
            ece: bits & 0x040 != 0,
            cwr: bits & 0x080 != 0,
            ns: bits & 0x100 != 0,
        }
    }

    /// True if at least one flag bit is set.
    pub fn any(&self) -> bool {
        self.syn
            || self.ack
            || self.fin
            || self.rst
            || self.psh
            || self.urg
            || self.ece
            || self.cwr
            || self.ns
    }
}

/// Decoded header fields of one IPv4/TCP datagram.
#[derive(Debug, Clone, Copy)]
pub struct PacketView {
    pub src_ip: [u8; 4],
    pub dst_ip: [u8; 4],
    pub src_port: u16,
    pub dst_port: u16,
    pub flags: TcpFlags,
    /// TCP data offset in 32-bit words, as seen on the wire.
    pub data_offset: u8,
    /// TCP payload bytes past the headers, clamped at 0.
    pub payload_len: usize,
}

/// Outcome of decoding a raw datagram.
#[derive(Debug, Clone, Copy)]
pub enum Decoded {
    Tcp(PacketView),
    /// Valid IPv4 but a protocol other than TCP.
    NotTcp,
    /// Structurally broken; the token names the first failed check.
    Malformed(&'static str),
}

/// Decode a raw IPv4 datagram into a `PacketView`.
///
/// A data offset below 5 is not treated as a structural failure here: the
/// packet still yields a view so the flag validator can reject it with a
/// policy drop instead of a pass-through.
pub fn decode(buf: &[u8]) -> Decoded {
    if buf.len() < 20 {
        return Decoded::Malformed("short-ipv4-header");
    }

    let version = buf[0] >> 4;
    if version != 4 {
        return Decoded::Malformed("not-ipv4");
    }

    let ihl = (buf[0] & 0x0f) as usize;
    if ihl < 5 {
        return Decoded::Malformed("bad-ihl");
    }

    let total_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    if total_len > buf.len() || total_len < ihl * 4 {
        return Decoded::Malformed("truncated-ipv4");
    }

    let proto = buf[9];
    if proto != 6 {
        return Decoded::NotTcp;
    }

    let mut src_ip = [0u8; 4];
    let mut dst_ip = [0u8; 4];
    src_ip.copy_from_slice(&buf[12..16]);
    dst_ip.copy_from_slice(&buf[16..20]);

    let tcp = &buf[ihl * 4..];
    if tcp.len() < 20 {
        return Decoded::Malformed("short-tcp-header");
    }

    let src_port = u16::from_be_bytes([tcp[0], tcp[1]]);
    let dst_port = u16::from_be_bytes([tcp[2], tcp[3]]);

    let offset_and_flags = u16::from_be_bytes([tcp[12], tcp[13]]);
    let data_offset = ((offset_and_flags >> 12) & 0x0f) as u8;
    let flags = TcpFlags::from_bits(offset_and_flags & 0x01ff);

    if data_offset >= 5 && ihl * 4 + data_offset as usize * 4 > total_len {
        return Decoded::Malformed("truncated-tcp-options");
    }

    let payload_len = total_len.saturating_sub(ihl * 4 + data_offset as usize * 4);

    Decoded::Tcp(PacketView {
        src_ip,
        dst_ip,
        src_port,
        dst_port,
        flags,
        data_offset,
        payload_len,
    })
}

/// Test-only raw packet builder shared by the decoder and pipeline tests.
#[cfg(test)]
pub(crate) mod testpkt {
    use super::TcpFlags;

    fn flag_bits(flags: TcpFlags) -> u16 {
        let mut bits = 0u16;
        if flags.fin {
            bits |= 0x001;
        }
        if flags.syn {
            bits |= 0x002;
        }
        if flags.rst {
            bits |= 0x004;
        }
        if flags.psh {
            bits |= 0x008;
        }
        if flags.ack {
            bits |= 0x010;
        }
        if flags.urg {
            bits |= 0x020;
        }
        if flags.ece {
            bits |= 0x040;
        }
        if flags.cwr {
            bits |= 0x080;
        }
        if flags.ns {
            bits |= 0x100;
        }
        bits
    }

    /// Build a minimal IPv4/TCP datagram (no options, zero checksums).
    pub(crate) fn tcp_packet(
        src_ip: [u8; 4],
        dst_ip: [u8; 4],
        src_port: u16,
        dst_port: u16,
        flags: TcpFlags,
        payload_len: usize,
    ) -> Vec<u8> {
        let total_len = 40 + payload_len;
        let mut buf = vec![0u8; total_len];

        buf[0] = 0x45; // version 4, IHL 5
        buf[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
        buf[8] = 64; // TTL
        buf[9] = 6; // TCP
        buf[12..16].copy_from_slice(&src_ip);
        buf[16..20].copy_from_slice(&dst_ip);

        let tcp = &mut buf[20..];
        tcp[0..2].copy_from_slice(&src_port.to_be_bytes());
        tcp[2..4].copy_from_slice(&dst_port.to_be_bytes());
        let offset_and_flags = (5u16 << 12) | flag_bits(flags);
        tcp[12..14].copy_from_slice(&offset_and_flags.to_be_bytes());
        tcp[14..16].copy_from_slice(&65535u16.to_be_bytes());

        buf
    }

    pub(crate) fn syn() -> TcpFlags {
        TcpFlags {
            syn: true,
            ..Default::default()
        }
    }

    pub(crate) fn syn_ack() -> TcpFlags {
        TcpFlags {
            syn: true,
            ack: true,
            ..Default::default()
        }
    }

    pub(crate) fn ack() -> TcpFlags {
        TcpFlags {
            ack: true,
            ..Default::default()
        }
    }

    pub(crate) fn fin_ack() -> TcpFlags {
        TcpFlags {
            fin: true,
            ack: true,
            ..Default::default()
        }
    }

    pub(crate) fn rst() -> TcpFlags {
        TcpFlags {
            rst: true,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testpkt::*;
    use super::*;

    const A: [u8; 4] = [10, 0, 0, 1];
    const B: [u8; 4] = [10, 0, 0, 2];

    #[test]
    fn test_decode_syn_packet() {
        let buf = tcp_packet(A, B, 40000, 80, syn(), 0);
        match decode(&buf) {
            Decoded::Tcp(view) => {
                assert_eq!(view.src_ip, A);
                assert_eq!(view.dst_ip, B);
                assert_eq!(view.src_port, 40000);
                assert_eq!(view.dst_port, 80);
                assert!(view.flags.syn);
                assert!(!view.flags.ack);
                assert_eq!(view.data_offset, 5);
                assert_eq!(view.payload_len, 0);
            }
            other => panic!("expected Tcp, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_payload_length() {
        let buf = tcp_packet(A, B, 40000, 80, ack(), 16);
        match decode(&buf) {
            Decoded::Tcp(view) => assert_eq!(view.payload_len, 16),
            other => panic!("expected Tcp, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_all_nine_flags() {
        let flags = TcpFlags {
            syn: true,
            ack: true,
            fin: true,
            rst: true,
            psh: true,
            urg: true,
            ece: true,
            cwr: true,
            ns: true,
        };
        let buf = tcp_packet(A, B, 1, 2, flags, 0);
        match decode(&buf) {
            Decoded::Tcp(view) => assert_eq!(view.flags, flags),
            other => panic!("expected Tcp, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_short_buffer() {
        assert!(matches!(
            decode(&[0u8; 10]),
            Decoded::Malformed("short-ipv4-header")
        ));
    }

    #[test]
    fn test_decode_rejects_non_ipv4() {
        let mut buf = tcp_packet(A, B, 1, 2, syn(), 0);
        buf[0] = 0x65; // version 6
        assert!(matches!(decode(&buf), Decoded::Malformed("not-ipv4")));
    }

    #[test]
    fn test_decode_rejects_bad_ihl() {
        let mut buf = tcp_packet(A, B, 1, 2, syn(), 0);
        buf[0] = 0x44; // IHL 4
        assert!(matches!(decode(&buf), Decoded::Malformed("bad-ihl")));
    }

    #[test]
    fn test_decode_rejects_total_length_past_buffer() {
        let mut buf = tcp_packet(A, B, 1, 2, syn(), 0);
        buf[2..4].copy_from_slice(&100u16.to_be_bytes());
        assert!(matches!(decode(&buf), Decoded::Malformed("truncated-ipv4")));
    }

    #[test]
    fn test_decode_non_tcp() {
        let mut buf = tcp_packet(A, B, 1, 2, syn(), 0);
        buf[9] = 17; // UDP
        assert!(matches!(decode(&buf), Decoded::NotTcp));
    }

    #[test]
    fn test_decode_rejects_short_tcp_header() {
        let mut buf = tcp_packet(A, B, 1, 2, syn(), 0);
        buf.truncate(30);
        buf[2..4].copy_from_slice(&30u16.to_be_bytes());
        assert!(matches!(
            decode(&buf),
            Decoded::Malformed("short-tcp-header")
        ));
    }

    #[test]
    fn test_decode_rejects_options_past_total_length() {
        let mut buf = tcp_packet(A, B, 1, 2, syn(), 0);
        // Claim a 15-word TCP header inside a 40-byte datagram.
        let offset_and_flags = (15u16 << 12) | 0x002;
        buf[32..34].copy_from_slice(&offset_and_flags.to_be_bytes());
        assert!(matches!(
            decode(&buf),
            Decoded::Malformed("truncated-tcp-options")
        ));
    }

    #[test]
    fn test_decode_keeps_low_data_offset_for_flag_validation() {
        let mut buf = tcp_packet(A, B, 1, 2, syn(), 0);
        let offset_and_flags = (2u16 << 12) | 0x002;
        buf[32..34].copy_from_slice(&offset_and_flags.to_be_bytes());
        match decode(&buf) {
            Decoded::Tcp(view) => assert_eq!(view.data_offset, 2),
            other => panic!("expected Tcp, got {:?}", other),
        }
    }

    #[test]
    fn test_flags_from_bits_round_trip() {
        let flags = TcpFlags::from_bits(0x01ff);
        assert!(flags.any());
        assert!(flags.fin && flags.syn && flags.rst && flags.psh && flags.ack);
        assert!(flags.urg && flags.ece && flags.cwr && flags.ns);

        let none = TcpFlags::from_bits(0);
        assert!(!none.any());
    }
}
