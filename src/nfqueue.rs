use std::os::fd::{AsFd, BorrowedFd};
use std::time::Duration;

use nfq_intake::{
    socket, Budget, DispatchLoop, Packet, PacketDecoder, PacketHandler, QueueMeta, QueueSocket,
    RecvFlags, Socket, StopReason, Verdict, VerdictSender,
};

use crate::cli::Cli;
use crate::packets::extract_flow;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Logs every packet and answers it with the same verdict.
struct Responder<'fd> {
    sender: VerdictSender<'fd>,
    verdict: Verdict,
    mark: Option<u32>,
    failed_verdicts: u64,
}

impl PacketHandler for Responder<'_> {
    fn handle_packet(&mut self, queue: &QueueMeta, packet: &Packet<'_>) {
        match extract_flow(packet.payload) {
            Ok(flow) => log::info!("[{}] packet {}: {flow}", queue.queue_num, packet.id),
            Err(err) => log::debug!("[{}] packet {}: {err}", queue.queue_num, packet.id),
        }

        let (queue_num, id) = (queue.queue_num, packet.id);
        let sent = match self.mark {
            Some(mark) => self.sender.set_verdict_mark(queue_num, id, self.verdict, mark),
            None => self.sender.set_verdict(queue_num, id, self.verdict),
        };

        // The loop cannot see callback failures, so they end here.
        if let Err(err) = sent {
            self.failed_verdicts += 1;
            log::error!("{err}");
        }
    }
}

/// Apply the socket options chosen on the command line.
fn tune(cli: &Cli, fd: BorrowedFd<'_>) -> anyhow::Result<()> {
    socket::set_recv_enobufs(fd, !cli.no_enobufs)?;
    if let Some(size) = cli.rcvbuf {
        socket::set_recv_buffer_size(fd, size)?;
    }
    Ok(())
}

pub(crate) fn listen(cli: &Cli) -> anyhow::Result<()> {
    log::trace!("listen({})", cli.queue);

    let mut queue = QueueSocket::open()?;
    tune(cli, queue.as_fd())?;
    queue.bind(cli.queue)?;
    queue.set_mode(cli.queue, cli.copy_mode.into(), cli.copy_range)?;
    if let Some(len) = cli.queue_maxlen {
        queue.set_queue_maxlen(cli.queue, len)?;
    }

    let enobufs = socket::recv_enobufs(queue.as_fd())?;
    log::info!("Listening to queue {} (ENOBUFS reporting: {enobufs})", cli.queue);

    let result = intake(cli, queue.as_fd());

    if let Err(err) = queue.unbind(cli.queue) {
        log::warn!("{err}");
    }
    result
}

fn intake(cli: &Cli, fd: BorrowedFd<'_>) -> anyhow::Result<()> {
    let flags = if cli.nonblocking {
        RecvFlags::DONT_WAIT
    } else {
        RecvFlags::BLOCKING
    };
    let budget = Budget::new(cli.max_count.unwrap_or(0));
    let mut decoder = PacketDecoder::new(Responder {
        sender: VerdictSender::new(fd),
        verdict: cli.verdict(),
        mark: cli.mark,
        failed_verdicts: 0,
    });

    let (result, truncated) = {
        let mut dispatch = DispatchLoop::new(Socket::new(fd), &mut decoder, flags);
        let result = loop {
            let summary = match dispatch.drive(budget) {
                Ok(summary) => summary,
                Err(err) => break Err(err),
            };
            log::debug!("Dispatched {} frames ({:?})", summary.dispatched, summary.reason);

            match summary.reason {
                StopReason::Closed => break Ok(()),
                StopReason::BudgetReached => {}
                StopReason::WouldBlock => {
                    if let Err(err) = socket::wait_readable(fd, Some(POLL_INTERVAL)) {
                        break Err(err);
                    }
                }
            }
        };
        (result, dispatch.truncated_frames())
    };

    let stats = decoder.stats();
    log::info!(
        "Queue {} stopped: {} frames ({} truncated), {} packets, {} malformed, {} kernel errors, \
         {} failed verdicts",
        cli.queue,
        stats.frames,
        truncated,
        stats.packets,
        stats.malformed,
        stats.kernel_errors,
        decoder.handler().failed_verdicts
    );

    Ok(result?)
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn enobufs_flag_reaches_the_socket() {
        // Sandboxes without netlink support have nothing to check.
        let Ok(queue) = QueueSocket::open() else {
            return;
        };

        let cli = Cli::try_parse_from(["nfq-intake", "--no-enobufs"]).unwrap();
        tune(&cli, queue.as_fd()).unwrap();
        assert!(!socket::recv_enobufs(queue.as_fd()).unwrap());

        let cli = Cli::try_parse_from(["nfq-intake"]).unwrap();
        tune(&cli, queue.as_fd()).unwrap();
        assert!(socket::recv_enobufs(queue.as_fd()).unwrap());
    }
}
