//! Link-layer frame decoding: Ethernet, IPv4/IPv6 and TCP headers down to
//! a [`TcpPacket`] for the monitored port.
//!
//! Simplified on purpose: no VLAN tags, no IPv6 extension-header chasing,
//! no IP fragment reassembly. Frames that do not parse, are not TCP, or
//! do not involve the monitored port decode to `None`.
//!
//! Reference: RFC 793 (TCP), RFC 791 (IPv4), RFC 8200 (IPv6).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::message::TcpPacket;

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86DD;
const IPPROTO_TCP: u8 = 6;
const TCP_FLAG_SYN: u8 = 0x02;

struct TcpHeader {
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: u8,
}

/// Decode a raw Ethernet frame into a [`TcpPacket`] when it carries TCP
/// traffic involving `monitored_port`. The peer address is the side that
/// is not the monitored service.
pub fn decode_frame(frame: &[u8], monitored_port: u16, timestamp_us: u64) -> Option<TcpPacket> {
    let (ethertype, ip_data) = parse_ethernet(frame)?;

    let (src_ip, dst_ip, proto, tcp_data) = match ethertype {
        ETHERTYPE_IPV4 => {
            let (src, dst, proto, rest) = parse_ipv4(ip_data)?;
            (IpAddr::V4(src), IpAddr::V4(dst), proto, rest)
        }
        ETHERTYPE_IPV6 => {
            let (src, dst, proto, rest) = parse_ipv6(ip_data)?;
            (IpAddr::V6(src), IpAddr::V6(dst), proto, rest)
        }
        _ => return None,
    };
    if proto != IPPROTO_TCP {
        return None;
    }

    let (header, payload) = parse_tcp(tcp_data)?;
    if header.src_port != monitored_port && header.dst_port != monitored_port {
        return None;
    }

    // SYN consumes one sequence number; payload starts at seq+1.
    let seq = if header.flags & TCP_FLAG_SYN != 0 {
        header.seq.wrapping_add(1)
    } else {
        header.seq
    };

    let peer = if header.dst_port == monitored_port {
        src_ip
    } else {
        dst_ip
    };

    Some(TcpPacket {
        addr: peer.to_string(),
        src_port: header.src_port,
        dst_port: header.dst_port,
        seq,
        ack: header.ack,
        data: payload.to_vec(),
        timestamp_us,
    })
}

fn parse_ethernet(data: &[u8]) -> Option<(u16, &[u8])> {
    if data.len() < 14 {
        return None;
    }
    let ethertype = u16::from_be_bytes([data[12], data[13]]);
    Some((ethertype, &data[14..]))
}

fn parse_ipv4(data: &[u8]) -> Option<(Ipv4Addr, Ipv4Addr, u8, &[u8])> {
    if data.len() < 20 {
        return None;
    }
    let ihl = (data[0] & 0x0F) as usize * 4;
    if data.len() < ihl {
        return None;
    }
    let protocol = data[9];
    let src = Ipv4Addr::new(data[12], data[13], data[14], data[15]);
    let dst = Ipv4Addr::new(data[16], data[17], data[18], data[19]);
    Some((src, dst, protocol, &data[ihl..]))
}

fn parse_ipv6(data: &[u8]) -> Option<(Ipv6Addr, Ipv6Addr, u8, &[u8])> {
    if data.len() < 40 {
        return None;
    }
    let next_header = data[6];
    let src = Ipv6Addr::from(<[u8; 16]>::try_from(&data[8..24]).ok()?);
    let dst = Ipv6Addr::from(<[u8; 16]>::try_from(&data[24..40]).ok()?);
    Some((src, dst, next_header, &data[40..]))
}

fn parse_tcp(data: &[u8]) -> Option<(TcpHeader, &[u8])> {
    if data.len() < 20 {
        return None;
    }
    let src_port = u16::from_be_bytes([data[0], data[1]]);
    let dst_port = u16::from_be_bytes([data[2], data[3]]);
    let seq = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    let ack = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
    let data_offset = ((data[12] >> 4) as usize) * 4;
    let flags = data[13];
    if data_offset < 20 || data.len() < data_offset {
        return None;
    }
    Some((
        TcpHeader {
            src_port,
            dst_port,
            seq,
            ack,
            flags,
        },
        &data[data_offset..],
    ))
}

/// Build a minimal Ethernet + IPv4 + TCP frame. Test and fixture helper.
pub fn build_frame(
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: u8,
    payload: &[u8],
) -> Vec<u8> {
    let mut frame = Vec::with_capacity(54 + payload.len());

    // Ethernet header: dst MAC, src MAC, ethertype IPv4
    frame.extend_from_slice(&[0u8; 6]);
    frame.extend_from_slice(&[0u8; 6]);
    frame.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());

    // IPv4 header, IHL=5
    let total_len = (20 + 20 + payload.len()) as u16;
    frame.push(0x45);
    frame.push(0);
    frame.extend_from_slice(&total_len.to_be_bytes());
    frame.extend_from_slice(&[0; 4]); // id, flags, frag
    frame.push(64); // TTL
    frame.push(IPPROTO_TCP);
    frame.extend_from_slice(&[0; 2]); // checksum
    frame.extend_from_slice(&src_ip.octets());
    frame.extend_from_slice(&dst_ip.octets());

    // TCP header, data offset = 5 words
    frame.extend_from_slice(&src_port.to_be_bytes());
    frame.extend_from_slice(&dst_port.to_be_bytes());
    frame.extend_from_slice(&seq.to_be_bytes());
    frame.extend_from_slice(&ack.to_be_bytes());
    frame.push(0x50);
    frame.push(flags);
    frame.extend_from_slice(&1024u16.to_be_bytes()); // window
    frame.extend_from_slice(&[0; 2]); // checksum
    frame.extend_from_slice(&[0; 2]); // urgent ptr

    frame.extend_from_slice(payload);
    frame
}
