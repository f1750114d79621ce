//! Queue subscription over a `NETLINK_NETFILTER` socket.
//!
//! [`QueueSocket`] owns the descriptor the intake loop reads from. Every
//! configuration request asks the kernel for an acknowledgement and waits
//! for it before returning.

use std::io;
use std::mem;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

use crate::error::{IntakeError, Result};
use crate::netlink::{self, MessageBuilder, NfGenMsg};
use crate::reader::{FrameReader, RecvFlags, RecvOutcome, Socket};

const QUEUE_CONFIG: u16 = ((libc::NFNL_SUBSYS_QUEUE << 8) | libc::NFQNL_MSG_CONFIG) as u16;
const NFQA_CFG_CMD: u16 = libc::NFQA_CFG_CMD as u16;
const NFQA_CFG_PARAMS: u16 = libc::NFQA_CFG_PARAMS as u16;
const NFQA_CFG_QUEUE_MAXLEN: u16 = libc::NFQA_CFG_QUEUE_MAXLEN as u16;

/// How much of each packet the kernel copies into queue messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyMode {
    None,
    /// Metadata only, no payload.
    Meta,
    /// Metadata and up to `range` bytes of payload.
    Packet,
}

impl CopyMode {
    fn code(self) -> u8 {
        let code = match self {
            CopyMode::None => libc::NFQNL_COPY_NONE,
            CopyMode::Meta => libc::NFQNL_COPY_META,
            CopyMode::Packet => libc::NFQNL_COPY_PACKET,
        };
        code as u8
    }
}

/// A netfilter queue socket.
pub struct QueueSocket {
    fd: OwnedFd,
    seq: u32,
}

impl QueueSocket {
    pub fn open() -> Result<Self> {
        log::trace!("QueueSocket::open()");

        // SAFETY: plain socket creation, the result is checked below.
        let raw = unsafe {
            libc::socket(
                libc::PF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                libc::NETLINK_NETFILTER,
            )
        };
        if raw < 0 {
            return Err(IntakeError::Open(io::Error::last_os_error()));
        }
        // SAFETY: `raw` is a fresh descriptor nobody else owns.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        // SAFETY: sockaddr_nl is plain old data, all zeroes is a valid value.
        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        // SAFETY: `addr` lives across the call and its size is passed along.
        let rv = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                (&addr as *const libc::sockaddr_nl).cast(),
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rv < 0 {
            return Err(IntakeError::Open(io::Error::last_os_error()));
        }

        Ok(Self::from_fd(fd))
    }

    /// Wrap a descriptor that is already connected to the queue subsystem.
    pub fn from_fd(fd: OwnedFd) -> Self {
        Self { fd, seq: 0 }
    }

    /// Start receiving packets queued to `queue_num`.
    pub fn bind(&mut self, queue_num: u16) -> Result<()> {
        log::trace!("bind({queue_num})");
        self.request(queue_num, "bind", NFQA_CFG_CMD, &config_cmd(libc::NFQNL_CFG_CMD_BIND))
    }

    pub fn unbind(&mut self, queue_num: u16) -> Result<()> {
        log::trace!("unbind({queue_num})");
        self.request(queue_num, "unbind", NFQA_CFG_CMD, &config_cmd(libc::NFQNL_CFG_CMD_UNBIND))
    }

    /// Set the copy mode and the number of payload bytes copied per packet.
    pub fn set_mode(&mut self, queue_num: u16, mode: CopyMode, range: u32) -> Result<()> {
        log::trace!("set_mode({queue_num}, {mode:?}, {range})");
        // struct nfqnl_msg_config_params { be32 copy_range; u8 copy_mode; } packed
        let mut params = [0u8; 5];
        params[..4].copy_from_slice(&range.to_be_bytes());
        params[4] = mode.code();
        self.request(queue_num, "copy mode", NFQA_CFG_PARAMS, &params)
    }

    /// Cap the number of packets the kernel holds while waiting for verdicts.
    pub fn set_queue_maxlen(&mut self, queue_num: u16, len: u32) -> Result<()> {
        log::trace!("set_queue_maxlen({queue_num}, {len})");
        self.request(queue_num, "queue maxlen", NFQA_CFG_QUEUE_MAXLEN, &len.to_be_bytes())
    }

    fn request(
        &mut self,
        queue_num: u16,
        command: &'static str,
        attr: u16,
        value: &[u8],
    ) -> Result<()> {
        self.seq = self.seq.wrapping_add(1);
        let msg = config_message(self.seq, queue_num, attr, value);
        let fail = |source| IntakeError::Config {
            queue_num,
            command,
            source,
        };

        // SAFETY: `msg` is valid for reads of `msg.len()` bytes.
        let rv = unsafe { libc::send(self.fd.as_raw_fd(), msg.as_ptr().cast(), msg.len(), 0) };
        if rv < 0 {
            return Err(fail(io::Error::last_os_error()));
        }

        self.wait_ack(self.seq).map_err(fail)
    }

    fn wait_ack(&self, seq: u32) -> io::Result<()> {
        let mut reader = FrameReader::new(Socket::new(self.fd.as_fd()));
        loop {
            match reader.receive(RecvFlags::BLOCKING) {
                RecvOutcome::Data(len) => {
                    if let Some(result) = find_ack(reader.frame(len), seq) {
                        return result;
                    }
                }
                RecvOutcome::Closed => return Err(io::ErrorKind::UnexpectedEof.into()),
                RecvOutcome::WouldBlock => return Err(io::ErrorKind::WouldBlock.into()),
                RecvOutcome::Failed(err) => return Err(err),
            }
        }
    }
}

impl AsFd for QueueSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

// struct nfqnl_msg_config_cmd { u8 command; u8 pad; be16 pf; }
fn config_cmd(cmd: libc::c_int) -> [u8; 4] {
    [cmd as u8, 0, 0, 0]
}

fn config_message(seq: u32, queue_num: u16, attr: u16, value: &[u8]) -> Vec<u8> {
    let flags = (libc::NLM_F_REQUEST | libc::NLM_F_ACK) as u16;
    MessageBuilder::new(QUEUE_CONFIG, flags, seq)
        .nfgen(NfGenMsg {
            family: libc::AF_UNSPEC as u8,
            version: libc::NFNETLINK_V0 as u8,
            res_id: queue_num,
        })
        .attr(attr, value)
        .finish()
}

/// Look for the kernel's answer to request `seq` in `frame`.
fn find_ack(frame: &[u8], seq: u32) -> Option<io::Result<()>> {
    for message in netlink::messages(frame) {
        let message = match message {
            Ok(message) => message,
            Err(err) => return Some(Err(io::Error::new(io::ErrorKind::InvalidData, err))),
        };

        if message.kind != libc::NLMSG_ERROR as u16 || message.seq != seq {
            log::trace!("Skipping message {:#x} (seq {})", message.kind, message.seq);
            continue;
        }

        if message.payload.len() < 4 {
            return Some(Err(io::ErrorKind::InvalidData.into()));
        }
        let code = netlink::read_u32_ne(message.payload, 0) as i32;
        return Some(match code {
            0 => Ok(()),
            code => Err(io::Error::from_raw_os_error(code.wrapping_neg())),
        });
    }

    None
}
