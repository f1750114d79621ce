use std::fmt;
use std::net::IpAddr;

use anyhow::{anyhow, bail};
use pnet::packet::{
    ip::{IpNextHeaderProtocol, IpNextHeaderProtocols},
    ipv4::Ipv4Packet,
    ipv6::Ipv6Packet,
    tcp::TcpPacket,
    udp::UdpPacket,
    Packet,
};

pub(crate) type DPort = u16;

/// Addressing summary of a queued packet, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Flow {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub protocol: IpNextHeaderProtocol,
    pub dport: Option<DPort>,
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {} ({}", self.src, self.dst, self.protocol)?;
        if let Some(port) = self.dport {
            write!(f, " port {port}")?;
        }
        write!(f, ")")
    }
}

pub(crate) fn extract_flow(packet: &[u8]) -> anyhow::Result<Flow> {
    log::trace!("extract_flow(packet_bytes)");

    match packet.first().map(|b| b >> 4) {
        Some(4) => {
            let ipv4_packet =
                Ipv4Packet::new(packet).ok_or_else(|| anyhow!("truncated IPv4 header"))?;
            let protocol = ipv4_packet.get_next_level_protocol();
            Ok(Flow {
                src: ipv4_packet.get_source().into(),
                dst: ipv4_packet.get_destination().into(),
                protocol,
                dport: get_dest_port(protocol, ipv4_packet.payload()),
            })
        }
        Some(6) => {
            let ipv6_packet =
                Ipv6Packet::new(packet).ok_or_else(|| anyhow!("truncated IPv6 header"))?;
            let protocol = ipv6_packet.get_next_header();
            Ok(Flow {
                src: ipv6_packet.get_source().into(),
                dst: ipv6_packet.get_destination().into(),
                protocol,
                dport: get_dest_port(protocol, ipv6_packet.payload()),
            })
        }
        _ => bail!("packet does not belong to the IP layer"),
    }
}

fn get_dest_port(proto: IpNextHeaderProtocol, payload: &[u8]) -> Option<DPort> {
    match proto {
        IpNextHeaderProtocols::Tcp => TcpPacket::new(payload).map(|tcp| tcp.get_destination()),
        IpNextHeaderProtocols::Udp => UdpPacket::new(payload).map(|udp| udp.get_destination()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, Ipv6Addr};

    use super::*;

    fn ipv4(protocol: u8, transport: &[u8]) -> Vec<u8> {
        let total = (20 + transport.len()) as u16;
        let mut packet = vec![0x45, 0];
        packet.extend_from_slice(&total.to_be_bytes());
        packet.extend_from_slice(&[0, 0, 0, 0, 64, protocol, 0, 0]);
        packet.extend_from_slice(&[10, 0, 0, 1]);
        packet.extend_from_slice(&[10, 0, 0, 2]);
        packet.extend_from_slice(transport);
        packet
    }

    fn udp(dport: u16) -> Vec<u8> {
        let mut header = 5353u16.to_be_bytes().to_vec();
        header.extend_from_slice(&dport.to_be_bytes());
        header.extend_from_slice(&[0, 8, 0, 0]);
        header
    }

    #[test]
    fn ipv4_udp_flow() {
        let flow = extract_flow(&ipv4(17, &udp(53))).unwrap();

        assert_eq!(flow.src, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(flow.dst, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(flow.protocol, IpNextHeaderProtocols::Udp);
        assert_eq!(flow.dport, Some(53));
    }

    #[test]
    fn ipv4_tcp_flow() {
        let mut tcp = 40000u16.to_be_bytes().to_vec();
        tcp.extend_from_slice(&443u16.to_be_bytes());
        tcp.extend_from_slice(&[0; 8]);
        tcp.extend_from_slice(&[0x50, 0x02, 0xff, 0xff, 0, 0, 0, 0]);

        let flow = extract_flow(&ipv4(6, &tcp)).unwrap();

        assert_eq!(flow.dport, Some(443));
        let shown = flow.to_string();
        assert!(shown.starts_with("10.0.0.1 -> 10.0.0.2 ("));
        assert!(shown.ends_with(" port 443)"));
    }

    #[test]
    fn icmp_has_no_port() {
        let flow = extract_flow(&ipv4(1, &[8, 0, 0, 0, 0, 1, 0, 1])).unwrap();

        assert_eq!(flow.dport, None);
    }

    #[test]
    fn ipv6_udp_flow() {
        let transport = udp(123);
        let mut packet = vec![0x60, 0, 0, 0];
        packet.extend_from_slice(&(transport.len() as u16).to_be_bytes());
        packet.extend_from_slice(&[17, 64]);
        packet.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        packet.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        packet.extend_from_slice(&transport);

        let flow = extract_flow(&packet).unwrap();

        assert_eq!(flow.src, IpAddr::V6(Ipv6Addr::LOCALHOST));
        assert_eq!(flow.dport, Some(123));
    }

    #[test]
    fn non_ip_is_rejected() {
        assert!(extract_flow(&[]).is_err());
        assert!(extract_flow(&[0x15, 0, 0]).is_err());
        assert!(extract_flow(&[0x45, 0, 0]).is_err());
    }
}
