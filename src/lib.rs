//! Intake loop for a netfilter queue agent.
//!
//! [`queue::QueueSocket`] subscribes to a queue. [`dispatch`] pulls raw
//! frames off the subscribed socket through a [`reader::FrameReader`] and
//! hands each one to a [`FrameHandler`]. [`decode::PacketDecoder`] is the handler that turns
//! queue frames into packets for a user [`decode::PacketHandler`], which is
//! expected to answer through [`verdict::VerdictSender`].

pub mod decode;
pub mod dispatch;
pub mod error;
pub mod netlink;
pub mod queue;
pub mod reader;
pub mod socket;
pub mod verdict;

pub use decode::{DecodeStats, Packet, PacketDecoder, PacketHandler, QueueMeta};
pub use dispatch::{run, run_bounded, Budget, DispatchLoop, FrameHandler, StopReason, Summary};
pub use error::{IntakeError, Result};
pub use queue::{CopyMode, QueueSocket};
pub use reader::{FrameReader, FrameSource, RecvFlags, RecvOutcome, Socket, FRAME_BUFFER_SIZE};
pub use verdict::{Verdict, VerdictSender};
