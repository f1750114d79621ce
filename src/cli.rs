use clap::{Parser, ValueEnum};
use nfq_intake::{CopyMode, Verdict};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum VerdictArg {
    Accept,
    Drop,
}

impl From<VerdictArg> for Verdict {
    fn from(arg: VerdictArg) -> Self {
        match arg {
            VerdictArg::Accept => Verdict::Accept,
            VerdictArg::Drop => Verdict::Drop,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum CopyModeArg {
    None,
    Meta,
    Packet,
}

impl From<CopyModeArg> for CopyMode {
    fn from(arg: CopyModeArg) -> Self {
        match arg {
            CopyModeArg::None => CopyMode::None,
            CopyModeArg::Meta => CopyMode::Meta,
            CopyModeArg::Packet => CopyMode::Packet,
        }
    }
}

/// Receive packets from a netfilter queue and answer each with a fixed verdict.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub(crate) struct Cli {
    /// Queue number to bind to.
    #[arg(short, long, env = "NFQ_INTAKE_QUEUE", default_value_t = 0)]
    pub queue: u16,

    /// Frames to dispatch per loop invocation; stats are logged in between.
    #[arg(short = 'n', long)]
    pub max_count: Option<usize>,

    /// Receive with MSG_DONTWAIT and poll between invocations.
    #[arg(long)]
    pub nonblocking: bool,

    #[arg(long, value_enum, default_value_t = VerdictArg::Accept)]
    pub verdict: VerdictArg,

    /// Hand every packet over to this queue instead of accepting or dropping it.
    #[arg(long, conflicts_with = "verdict")]
    pub requeue: Option<u16>,

    /// Set this mark on every packet along with the verdict.
    #[arg(long)]
    pub mark: Option<u32>,

    /// How much of each packet the kernel copies to the agent.
    #[arg(long, value_enum, default_value_t = CopyModeArg::Packet)]
    pub copy_mode: CopyModeArg,

    /// Payload bytes copied per packet in `packet` mode.
    #[arg(long, default_value_t = 0xffff)]
    pub copy_range: u32,

    /// Maximum number of packets the kernel keeps waiting for a verdict.
    #[arg(long)]
    pub queue_maxlen: Option<u32>,

    /// Socket receive buffer size in bytes.
    #[arg(long)]
    pub rcvbuf: Option<u32>,

    /// Do not report queue overruns as receive errors.
    #[arg(long)]
    pub no_enobufs: bool,
}

impl Cli {
    pub fn verdict(&self) -> Verdict {
        match self.requeue {
            Some(queue_num) => Verdict::Queue(queue_num),
            None => self.verdict.into(),
        }
    }
}
