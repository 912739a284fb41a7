use tokio::task::JoinSet;

use super::{Processor, Status};
use crate::{
    error::MergeError,
    logging::{merge_log, LogContext},
};

/// Drive a processor to completion on the tokio runtime.
///
/// Waiting states suspend the task until the processor's ports are ready,
/// so many processors can share a small worker pool.
pub(crate) async fn drive<P>(mut processor: P, ctx: LogContext) -> Result<(), MergeError>
where
    P: Processor,
{
    let mut steps = 0_u64;
    loop {
        steps += 1;
        match processor.step() {
            Ok(Status::ReadyToRun) => processor.work()?,
            Ok(status @ (Status::NeedsInput | Status::OutputBlocked)) => {
                processor.wait(status).await
            }
            Ok(Status::Done) => {
                merge_log!(
                    log::Level::Debug,
                    ctx: ctx,
                    "processor_done",
                    "processor={} steps={}",
                    processor.name(),
                    steps
                );
                return Ok(());
            }
            Err(err) => {
                merge_log!(
                    log::Level::Error,
                    ctx: ctx,
                    "processor_failed",
                    "processor={} error={}",
                    processor.name(),
                    err
                );
                return Err(err);
            }
        }
    }
}

/// Spawns processors onto a `JoinSet`; dropping it aborts every task.
#[derive(Debug, Default)]
pub(crate) struct TokioExecutor {
    tasks: JoinSet<Result<(), MergeError>>,
}

impl TokioExecutor {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Spawn `processor` on the current runtime.
    pub(crate) fn spawn<P>(&mut self, processor: P, ctx: LogContext)
    where
        P: Processor + 'static,
    {
        self.tasks.spawn(drive(processor, ctx));
    }

    /// Wait for every task. The first failure aborts the rest.
    pub(crate) async fn join(mut self) -> Result<(), MergeError> {
        while let Some(joined) = self.tasks.join_next().await {
            let result = joined.map_err(|err| MergeError::Join(err.to_string()))?;
            if let Err(err) = result {
                self.tasks.abort_all();
                return Err(err);
            }
        }
        Ok(())
    }
}
