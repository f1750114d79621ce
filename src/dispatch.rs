use std::num::NonZeroUsize;

use crate::error::{IntakeError, Result};
use crate::reader::{FrameReader, FrameSource, RecvFlags, RecvOutcome};

/// The decode/handle-packet primitive: consumes one received frame.
///
/// Called synchronously, once per frame. The frame borrows the loop's buffer
/// and is only valid for the duration of the call.
pub trait FrameHandler {
    fn handle_frame(&mut self, frame: &[u8]);
}

impl<F: FnMut(&[u8])> FrameHandler for F {
    fn handle_frame(&mut self, frame: &[u8]) {
        self(frame)
    }
}

/// Maximum number of frames one invocation dispatches. Zero means no limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Budget(Option<NonZeroUsize>);

impl Budget {
    pub const UNBOUNDED: Budget = Budget(None);

    pub fn new(max_count: usize) -> Self {
        Budget(NonZeroUsize::new(max_count))
    }

    fn is_reached(self, dispatched: usize) -> bool {
        self.0.is_some_and(|max| dispatched >= max.get())
    }
}

/// Why a loop invocation returned without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The source reported orderly closure (a zero-byte receive).
    Closed,
    BudgetReached,
    /// A non-blocking receive found nothing to read.
    WouldBlock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    /// Frames handed to the handler during this invocation.
    pub dispatched: usize,
    pub reason: StopReason,
}

/// Drives a [`FrameReader`] and hands every received frame to a
/// [`FrameHandler`], strictly one frame at a time.
pub struct DispatchLoop<'h, S, H: ?Sized> {
    reader: FrameReader<S>,
    handler: &'h mut H,
    flags: RecvFlags,
}

impl<'h, S: FrameSource, H: FrameHandler + ?Sized> DispatchLoop<'h, S, H> {
    pub fn new(source: S, handler: &'h mut H, flags: RecvFlags) -> Self {
        Self {
            reader: FrameReader::new(source),
            handler,
            flags,
        }
    }

    /// Dispatch until closure, would-block or a receive failure.
    pub fn run(&mut self) -> Result<Summary> {
        log::trace!("run({:?})", self.flags);
        self.drive(Budget::UNBOUNDED)
    }

    /// Dispatch at most `max_count` frames and return how many were
    /// dispatched. A `max_count` of zero runs without a limit.
    pub fn run_bounded(&mut self, max_count: usize) -> Result<usize> {
        log::trace!("run_bounded({:?}, {max_count})", self.flags);
        self.drive(Budget::new(max_count)).map(|summary| summary.dispatched)
    }

    /// The single loop behind [`run`](Self::run) and
    /// [`run_bounded`](Self::run_bounded).
    ///
    /// A failed receive ends the invocation with [`IntakeError::Recv`]; the
    /// count dispatched so far is not reported.
    pub fn drive(&mut self, budget: Budget) -> Result<Summary> {
        let mut dispatched = 0;

        loop {
            if budget.is_reached(dispatched) {
                log::debug!("Budget of {dispatched} frames reached");
                return Ok(Summary {
                    dispatched,
                    reason: StopReason::BudgetReached,
                });
            }

            match self.reader.receive(self.flags) {
                RecvOutcome::Data(len) => {
                    log::debug!("Got new frame of {len} bytes");
                    self.handler.handle_frame(self.reader.frame(len));
                    dispatched += 1;
                }
                RecvOutcome::Closed => {
                    log::debug!("Queue socket closed after {dispatched} frames");
                    return Ok(Summary {
                        dispatched,
                        reason: StopReason::Closed,
                    });
                }
                RecvOutcome::WouldBlock => {
                    return Ok(Summary {
                        dispatched,
                        reason: StopReason::WouldBlock,
                    });
                }
                RecvOutcome::Failed(err) => {
                    log::debug!("Receive failed after {dispatched} frames: {err}");
                    return Err(IntakeError::Recv(err));
                }
            }
        }
    }

    /// Frames cut to the buffer size since this loop was created.
    pub fn truncated_frames(&self) -> u64 {
        self.reader.truncated()
    }
}

/// Run an unbounded loop over `source` until closure or error.
pub fn run<S, H>(handler: &mut H, source: S, flags: RecvFlags) -> Result<Summary>
where
    S: FrameSource,
    H: FrameHandler + ?Sized,
{
    DispatchLoop::new(source, handler, flags).run()
}

/// Run a loop over `source` that stops after `max_count` frames.
pub fn run_bounded<S, H>(
    handler: &mut H,
    source: S,
    flags: RecvFlags,
    max_count: usize,
) -> Result<usize>
where
    S: FrameSource,
    H: FrameHandler + ?Sized,
{
    DispatchLoop::new(source, handler, flags).run_bounded(max_count)
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::io::{self, ErrorKind};

    use super::*;

    enum Step {
        Frame(Vec<u8>),
        Fail(i32),
        WouldBlock,
        Oversized(usize),
    }

    /// Plays back a fixed sequence of receive results, then reports closure.
    struct Script {
        steps: RefCell<VecDeque<Step>>,
        reads: Cell<usize>,
    }

    impl Script {
        fn new(steps: Vec<Step>) -> Self {
            Self {
                steps: RefCell::new(steps.into()),
                reads: Cell::new(0),
            }
        }

        fn frames(sizes: &[usize]) -> Self {
            Self::new(sizes.iter().map(|&n| Step::Frame(vec![0xAA; n])).collect())
        }

        fn remaining(&self) -> usize {
            self.steps.borrow().len()
        }
    }

    impl FrameSource for Script {
        fn recv(&self, buf: &mut [u8], _flags: RecvFlags) -> io::Result<usize> {
            self.reads.set(self.reads.get() + 1);
            match self.steps.borrow_mut().pop_front() {
                None => Ok(0),
                Some(Step::Frame(bytes)) => {
                    buf[..bytes.len()].copy_from_slice(&bytes);
                    Ok(bytes.len())
                }
                Some(Step::Fail(code)) => Err(io::Error::from_raw_os_error(code)),
                Some(Step::WouldBlock) => Err(io::Error::from(ErrorKind::WouldBlock)),
                Some(Step::Oversized(len)) => {
                    buf.fill(0xEE);
                    Ok(len)
                }
            }
        }
    }

    #[derive(Default)]
    struct Recorder {
        frames: Vec<Vec<u8>>,
    }

    impl FrameHandler for Recorder {
        fn handle_frame(&mut self, frame: &[u8]) {
            self.frames.push(frame.to_vec());
        }
    }

    #[test]
    fn run_dispatches_until_closure() {
        let script = Script::frames(&[120, 340]);
        let mut recorder = Recorder::default();

        let summary = run(&mut recorder, &script, RecvFlags::BLOCKING).unwrap();

        assert_eq!(
            summary,
            Summary {
                dispatched: 2,
                reason: StopReason::Closed
            }
        );
        let sizes: Vec<usize> = recorder.frames.iter().map(Vec::len).collect();
        assert_eq!(sizes, [120, 340]);
        assert_eq!(script.reads.get(), 3);
    }

    #[test]
    fn run_hands_over_exact_frame_bytes() {
        let script = Script::new(vec![Step::Frame(b"abc".to_vec()), Step::Frame(b"de".to_vec())]);
        let mut recorder = Recorder::default();

        run(&mut recorder, &script, RecvFlags::BLOCKING).unwrap();

        assert_eq!(recorder.frames, [b"abc".to_vec(), b"de".to_vec()]);
    }

    #[test]
    fn bounded_stops_at_budget_and_leaves_rest_unread() {
        let script = Script::frames(&[100, 100, 100, 100]);
        let mut recorder = Recorder::default();

        let count = run_bounded(&mut recorder, &script, RecvFlags::BLOCKING, 2).unwrap();

        assert_eq!(count, 2);
        assert_eq!(recorder.frames.len(), 2);
        assert_eq!(script.remaining(), 2);
        assert_eq!(script.reads.get(), 2);
    }

    #[test]
    fn bounded_returns_short_count_on_closure() {
        let script = Script::frames(&[10, 20]);
        let mut recorder = Recorder::default();

        let count = run_bounded(&mut recorder, &script, RecvFlags::BLOCKING, 5).unwrap();

        assert_eq!(count, 2);
        assert_eq!(script.reads.get(), 3);
    }

    #[test]
    fn bounded_zero_budget_runs_to_closure() {
        let script = Script::frames(&[1, 2, 3]);
        let mut recorder = Recorder::default();

        let count = run_bounded(&mut recorder, &script, RecvFlags::BLOCKING, 0).unwrap();

        assert_eq!(count, 3);
    }

    #[test]
    fn first_receive_failure_is_returned_by_both_modes() {
        for bounded in [false, true] {
            let script = Script::new(vec![Step::Fail(libc::ECONNRESET), Step::Frame(vec![1])]);
            let mut recorder = Recorder::default();

            let err = if bounded {
                run_bounded(&mut recorder, &script, RecvFlags::BLOCKING, 4).unwrap_err()
            } else {
                run(&mut recorder, &script, RecvFlags::BLOCKING).unwrap_err()
            };

            assert!(matches!(err, IntakeError::Recv(_)));
            assert_eq!(err.raw_os_error(), Some(libc::ECONNRESET));
            assert!(recorder.frames.is_empty());
            assert_eq!(script.remaining(), 1);
        }
    }

    #[test]
    fn failure_mid_stream_discards_count_and_stops_reading() {
        let script = Script::new(vec![
            Step::Frame(vec![1]),
            Step::Frame(vec![2]),
            Step::Fail(libc::EINTR),
            Step::Frame(vec![3]),
        ]);
        let mut recorder = Recorder::default();

        let err = run_bounded(&mut recorder, &script, RecvFlags::BLOCKING, 10).unwrap_err();

        assert_eq!(err.raw_os_error(), Some(libc::EINTR));
        assert_eq!(recorder.frames.len(), 2);
        assert_eq!(script.remaining(), 1);
    }

    #[test]
    fn would_block_returns_control_and_count_resets() {
        let script = Script::new(vec![
            Step::Frame(vec![1]),
            Step::WouldBlock,
            Step::Frame(vec![2]),
            Step::Frame(vec![3]),
        ]);
        let mut recorder = Recorder::default();
        let mut dispatch = DispatchLoop::new(&script, &mut recorder, RecvFlags::DONT_WAIT);

        let first = dispatch.run().unwrap();
        assert_eq!(
            first,
            Summary {
                dispatched: 1,
                reason: StopReason::WouldBlock
            }
        );

        let second = dispatch.run().unwrap();
        assert_eq!(
            second,
            Summary {
                dispatched: 2,
                reason: StopReason::Closed
            }
        );
    }

    #[test]
    fn repeated_bounded_invocations_walk_the_stream() {
        let script = Script::frames(&[5, 5, 5, 5, 5]);
        let mut seen = 0;
        let mut count_frames = |_: &[u8]| seen += 1;
        let mut dispatch = DispatchLoop::new(&script, &mut count_frames, RecvFlags::BLOCKING);

        assert_eq!(dispatch.run_bounded(2).unwrap(), 2);
        assert_eq!(dispatch.run_bounded(2).unwrap(), 2);
        assert_eq!(dispatch.run_bounded(2).unwrap(), 1);
        drop(dispatch);

        assert_eq!(seen, 5);
    }

    #[test]
    fn oversized_frame_is_dispatched_cut_to_buffer() {
        let script = Script::new(vec![Step::Oversized(70_000), Step::Frame(vec![1, 2])]);
        let mut recorder = Recorder::default();
        let mut dispatch = DispatchLoop::new(&script, &mut recorder, RecvFlags::BLOCKING);

        let summary = dispatch.run().unwrap();
        assert_eq!(summary.dispatched, 2);
        assert_eq!(dispatch.truncated_frames(), 1);
        drop(dispatch);

        assert_eq!(recorder.frames[0].len(), crate::reader::FRAME_BUFFER_SIZE);
        assert_eq!(recorder.frames[1], [1, 2]);
    }

    #[test]
    fn budget_limits() {
        assert_eq!(Budget::new(0), Budget::UNBOUNDED);
        assert_eq!(Budget::new(3), Budget(NonZeroUsize::new(3)));
        assert!(Budget::new(3).is_reached(3));
        assert!(!Budget::UNBOUNDED.is_reached(usize::MAX));
    }
}
