use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};

use crate::error::{IntakeError, Result};
use crate::netlink::{MessageBuilder, NfGenMsg};

const QUEUE_VERDICT: u16 = ((libc::NFNL_SUBSYS_QUEUE << 8) | libc::NFQNL_MSG_VERDICT) as u16;
const NFQA_VERDICT_HDR: u16 = libc::NFQA_VERDICT_HDR as u16;
const NFQA_MARK: u16 = libc::NFQA_MARK as u16;
const NFQA_PAYLOAD: u16 = libc::NFQA_PAYLOAD as u16;

/// Decision for a queued packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Drop,
    /// Re-inject the packet at the start of the current hook.
    Repeat,
    /// Accept, skipping the remaining rules of the hook.
    Stop,
    /// Hand the packet over to another queue.
    Queue(u16),
}

impl Verdict {
    pub fn code(self) -> u32 {
        match self {
            Verdict::Accept => libc::NF_ACCEPT as u32,
            Verdict::Drop => libc::NF_DROP as u32,
            Verdict::Repeat => libc::NF_REPEAT as u32,
            Verdict::Stop => libc::NF_STOP as u32,
            // The target queue lives in the upper 16 bits.
            Verdict::Queue(num) => (u32::from(num) << 16) | libc::NF_QUEUE as u32,
        }
    }
}

/// Issues verdicts on a queue socket owned by someone else.
///
/// Every queued packet must get exactly one verdict, or the kernel keeps it
/// until the queue overflows.
pub struct VerdictSender<'fd> {
    fd: BorrowedFd<'fd>,
    seq: u32,
}

impl<'fd> VerdictSender<'fd> {
    pub fn new(fd: BorrowedFd<'fd>) -> Self {
        Self { fd, seq: 0 }
    }

    pub fn set_verdict(&mut self, queue_num: u16, id: u32, verdict: Verdict) -> Result<()> {
        self.send(queue_num, id, verdict, None, None)
    }

    pub fn set_verdict_mark(
        &mut self,
        queue_num: u16,
        id: u32,
        verdict: Verdict,
        mark: u32,
    ) -> Result<()> {
        self.send(queue_num, id, verdict, Some(mark), None)
    }

    /// Issue a verdict and replace the packet contents with `payload`.
    pub fn set_verdict_modified(
        &mut self,
        queue_num: u16,
        id: u32,
        verdict: Verdict,
        payload: &[u8],
    ) -> Result<()> {
        self.send(queue_num, id, verdict, None, Some(payload))
    }

    pub fn set_verdict_mark_modified(
        &mut self,
        queue_num: u16,
        id: u32,
        verdict: Verdict,
        mark: u32,
        payload: &[u8],
    ) -> Result<()> {
        self.send(queue_num, id, verdict, Some(mark), Some(payload))
    }

    fn send(
        &mut self,
        queue_num: u16,
        id: u32,
        verdict: Verdict,
        mark: Option<u32>,
        payload: Option<&[u8]>,
    ) -> Result<()> {
        log::trace!("send({queue_num}, {id}, {verdict:?}, {mark:?})");

        self.seq = self.seq.wrapping_add(1);
        let msg = encode(self.seq, queue_num, id, verdict, mark, payload);

        // SAFETY: `msg` is valid for reads of `msg.len()` bytes and the
        // descriptor outlives `self`.
        let rv = unsafe { libc::send(self.fd.as_raw_fd(), msg.as_ptr().cast(), msg.len(), 0) };
        if rv < 0 {
            return Err(IntakeError::Send {
                id,
                source: io::Error::last_os_error(),
            });
        }

        Ok(())
    }
}

fn encode(
    seq: u32,
    queue_num: u16,
    id: u32,
    verdict: Verdict,
    mark: Option<u32>,
    payload: Option<&[u8]>,
) -> Vec<u8> {
    // struct nfqnl_msg_verdict_hdr { be32 verdict; be32 id; }
    let mut hdr = [0u8; 8];
    hdr[..4].copy_from_slice(&verdict.code().to_be_bytes());
    hdr[4..].copy_from_slice(&id.to_be_bytes());

    let mut builder = MessageBuilder::new(QUEUE_VERDICT, libc::NLM_F_REQUEST as u16, seq)
        .nfgen(NfGenMsg {
            family: libc::AF_UNSPEC as u8,
            version: libc::NFNETLINK_V0 as u8,
            res_id: queue_num,
        })
        .attr(NFQA_VERDICT_HDR, &hdr);

    if let Some(mark) = mark {
        builder = builder.attr(NFQA_MARK, &mark.to_be_bytes());
    }
    if let Some(payload) = payload {
        builder = builder.attr(NFQA_PAYLOAD, payload);
    }

    builder.finish()
}
