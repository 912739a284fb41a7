//! Cooperative step protocol shared by the coordinator and the merger.

#[cfg(feature = "tokio")]
pub(crate) mod tokio;

use futures_util::future::BoxFuture;

use crate::error::MergeError;

/// Outcome of one non-blocking [`Processor::step`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    /// Some open input has nothing ready; step again once data arrives.
    NeedsInput,
    /// The output cannot accept more data; step again once it drains.
    OutputBlocked,
    /// CPU-bound work is pending; call [`Processor::work`] and step again.
    ReadyToRun,
    /// Inputs exhausted, buffers flushed and output closed.
    Done,
}

/// A pipeline stage advanced by an external scheduler.
///
/// `step` never blocks and never performs heavy computation; it only moves
/// data between ports and decides what to do next. Heavy computation happens
/// in `work`, which is only called after `step` returned
/// [`Status::ReadyToRun`].
pub trait Processor: Send {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Advance the state machine without blocking.
    fn step(&mut self) -> Result<Status, MergeError>;

    /// Run the pending CPU-bound unit of work.
    fn work(&mut self) -> Result<(), MergeError>;

    /// Resolve once the port behind a [`Status::NeedsInput`] or
    /// [`Status::OutputBlocked`] returned by the last `step` became ready.
    ///
    /// Stepping again before this resolves is allowed, it just makes no
    /// progress.
    fn wait(&mut self, status: Status) -> BoxFuture<'_, ()>;
}

/// Step a processor on the current thread until it reports [`Status::Done`].
///
/// Returns the statuses observed along the way; when `max_idle` consecutive
/// steps make no progress (`NeedsInput` or `OutputBlocked`) the loop stops
/// early so callers driving ports by hand can feed more data.
pub fn run_until_idle(
    processor: &mut dyn Processor,
    max_idle: usize,
) -> Result<Vec<Status>, MergeError> {
    let mut trace = Vec::new();
    let mut idle = 0;
    loop {
        let status = processor.step()?;
        trace.push(status);
        match status {
            Status::ReadyToRun => {
                idle = 0;
                processor.work()?;
            }
            Status::Done => return Ok(trace),
            Status::NeedsInput | Status::OutputBlocked => {
                idle += 1;
                if idle >= max_idle {
                    return Ok(trace);
                }
            }
        }
    }
}
