use std::time::Duration;

use crate::dispatch::FrameHandler;
use crate::netlink::{self, NfGenMsg, ParseError};

pub(crate) const QUEUE_PACKET: u16 =
    ((libc::NFNL_SUBSYS_QUEUE << 8) | libc::NFQNL_MSG_PACKET) as u16;

const NFQA_PACKET_HDR: u16 = libc::NFQA_PACKET_HDR as u16;
const NFQA_MARK: u16 = libc::NFQA_MARK as u16;
const NFQA_TIMESTAMP: u16 = libc::NFQA_TIMESTAMP as u16;
const NFQA_IFINDEX_INDEV: u16 = libc::NFQA_IFINDEX_INDEV as u16;
const NFQA_IFINDEX_OUTDEV: u16 = libc::NFQA_IFINDEX_OUTDEV as u16;
const NFQA_IFINDEX_PHYSINDEV: u16 = libc::NFQA_IFINDEX_PHYSINDEV as u16;
const NFQA_IFINDEX_PHYSOUTDEV: u16 = libc::NFQA_IFINDEX_PHYSOUTDEV as u16;
const NFQA_HWADDR: u16 = libc::NFQA_HWADDR as u16;
const NFQA_PAYLOAD: u16 = libc::NFQA_PAYLOAD as u16;

/// Queue context delivered with every packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueMeta {
    pub queue_num: u16,
    /// Protocol family from the nfgenmsg header (`AF_INET`, `AF_INET6`, ...).
    pub family: u8,
}

/// One queued packet, borrowed from the frame it was decoded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet<'a> {
    /// Packet id in host order, used to issue the verdict.
    pub id: u32,
    pub hw_protocol: u16,
    pub hook: u8,
    pub mark: Option<u32>,
    pub indev: Option<u32>,
    pub outdev: Option<u32>,
    pub physindev: Option<u32>,
    pub physoutdev: Option<u32>,
    pub hw_addr: Option<&'a [u8]>,
    /// Time since the Unix epoch.
    pub timestamp: Option<Duration>,
    /// Packet data starting at the IP header. Empty when not copied.
    pub payload: &'a [u8],
}

/// Receives decoded packets. Invoked once per packet, never concurrently.
pub trait PacketHandler {
    fn handle_packet(&mut self, queue: &QueueMeta, packet: &Packet<'_>);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeStats {
    pub frames: u64,
    pub packets: u64,
    /// Messages that could not be decoded and were skipped.
    pub malformed: u64,
    /// Non-zero `NLMSG_ERROR` replies from the kernel.
    pub kernel_errors: u64,
}

#[derive(Debug, thiserror::Error)]
enum DecodeError {
    #[error(transparent)]
    Netlink(#[from] ParseError),

    #[error("packet message without packet header")]
    MissingPacketHeader,

    #[error("attribute {0} is too short")]
    ShortAttribute(u16),

    #[error("timestamp {sec}s {usec}us is out of range")]
    BadTimestamp { sec: u64, usec: u64 },
}

/// Turns queue frames into [`Packet`]s for a [`PacketHandler`].
///
/// Decoding problems are logged and counted, never reported to the loop.
pub struct PacketDecoder<H> {
    handler: H,
    stats: DecodeStats,
}

impl<H: PacketHandler> PacketDecoder<H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            stats: DecodeStats::default(),
        }
    }

    pub fn stats(&self) -> DecodeStats {
        self.stats
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn into_handler(self) -> H {
        self.handler
    }
}

impl<H: PacketHandler> FrameHandler for PacketDecoder<H> {
    fn handle_frame(&mut self, frame: &[u8]) {
        self.stats.frames += 1;

        for message in netlink::messages(frame) {
            let message = match message {
                Ok(message) => message,
                Err(err) => {
                    log::debug!("Dropping rest of frame: {err}");
                    self.stats.malformed += 1;
                    break;
                }
            };

            match message.kind {
                QUEUE_PACKET => match parse_packet(message.payload) {
                    Ok((queue, packet)) => {
                        log::debug!(
                            "Got packet {} of {} bytes from queue {}",
                            packet.id,
                            packet.payload.len(),
                            queue.queue_num
                        );
                        self.stats.packets += 1;
                        self.handler.handle_packet(&queue, &packet);
                    }
                    Err(err) => {
                        log::debug!("Skipping queue message (seq {}): {err}", message.seq);
                        self.stats.malformed += 1;
                    }
                },
                kind if kind == libc::NLMSG_ERROR as u16 => {
                    let code = message
                        .payload
                        .get(..4)
                        .map(|_| netlink::read_u32_ne(message.payload, 0) as i32);
                    match code {
                        Some(0) => {}
                        Some(code) => {
                            self.stats.kernel_errors += 1;
                            let err = std::io::Error::from_raw_os_error(code.wrapping_neg());
                            log::warn!("Kernel reported error for seq {}: {err}", message.seq);
                        }
                        None => self.stats.malformed += 1,
                    }
                }
                kind => log::trace!("Ignoring netlink message of type {kind:#x}"),
            }
        }
    }
}

fn parse_packet(payload: &[u8]) -> Result<(QueueMeta, Packet<'_>), DecodeError> {
    let (nfgen, attrs) = NfGenMsg::parse(payload)?;
    let queue = QueueMeta {
        queue_num: nfgen.res_id,
        family: nfgen.family,
    };

    let mut header = None;
    let mut packet = Packet {
        id: 0,
        hw_protocol: 0,
        hook: 0,
        mark: None,
        indev: None,
        outdev: None,
        physindev: None,
        physoutdev: None,
        hw_addr: None,
        timestamp: None,
        payload: &[],
    };

    for attr in netlink::attributes(attrs) {
        let (kind, value) = attr?;
        let be32 = || netlink::read_u32_be(value).ok_or(DecodeError::ShortAttribute(kind));

        match kind {
            NFQA_PACKET_HDR => {
                // struct nfqnl_msg_packet_hdr { be32 packet_id; be16 hw_protocol; u8 hook; }
                if value.len() < 7 {
                    return Err(DecodeError::ShortAttribute(kind));
                }
                header = Some((
                    be32()?,
                    u16::from_be_bytes([value[4], value[5]]),
                    value[6],
                ));
            }
            NFQA_MARK => packet.mark = Some(be32()?),
            NFQA_IFINDEX_INDEV => packet.indev = Some(be32()?),
            NFQA_IFINDEX_OUTDEV => packet.outdev = Some(be32()?),
            NFQA_IFINDEX_PHYSINDEV => packet.physindev = Some(be32()?),
            NFQA_IFINDEX_PHYSOUTDEV => packet.physoutdev = Some(be32()?),
            NFQA_HWADDR => {
                // struct nfqnl_msg_packet_hw { be16 hw_addrlen; u16 pad; u8 hw_addr[8]; }
                if value.len() < 12 {
                    return Err(DecodeError::ShortAttribute(kind));
                }
                let len = usize::from(u16::from_be_bytes([value[0], value[1]])).min(8);
                packet.hw_addr = Some(&value[4..4 + len]);
            }
            NFQA_TIMESTAMP => {
                // struct nfqnl_msg_packet_timestamp { be64 sec; be64 usec; }
                let (Some(sec), Some(usec)) =
                    (netlink::read_u64_be(value, 0), netlink::read_u64_be(value, 8))
                else {
                    return Err(DecodeError::ShortAttribute(kind));
                };
                let timestamp = Duration::from_secs(sec)
                    .checked_add(Duration::from_micros(usec))
                    .ok_or(DecodeError::BadTimestamp { sec, usec })?;
                packet.timestamp = Some(timestamp);
            }
            NFQA_PAYLOAD => packet.payload = value,
            _ => {}
        }
    }

    let (id, hw_protocol, hook) = header.ok_or(DecodeError::MissingPacketHeader)?;
    packet.id = id;
    packet.hw_protocol = hw_protocol;
    packet.hook = hook;

    Ok((queue, packet))
}
