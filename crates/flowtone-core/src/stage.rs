use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::buffer::Buffer;
use crate::error::PipeError;
use crate::uid::Uid;

/// One-shot token guarding a stage instance against reuse within a run.
///
/// Stages carrying per-run state (decoder position, encoder handle) call
/// [`SingleUse::acquire`] inside `setup`; the pipe controller resets every
/// guard its stages expose when a run terminates.
#[derive(Debug, Clone, Default)]
pub struct SingleUse {
    taken: Arc<AtomicBool>,
}

impl SingleUse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the token, failing if it is already claimed for this run.
    pub fn acquire(&self) -> Result<(), PipeError> {
        if self.taken.swap(true, Ordering::AcqRel) {
            return Err(PipeError::SingleUseViolation);
        }
        Ok(())
    }

    pub fn reset(&self) {
        self.taken.store(false, Ordering::Release);
    }
}

/// Base capability surface shared by every pipeline stage.
///
/// `setup` runs before any runner starts so failures surface fast;
/// for every successful setup the runtime calls `flush` exactly once when
/// the run stops, for any reason.
pub trait Stage: Send {
    fn uid(&self) -> Uid;

    /// The stage as `Any`, for parameter application.
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Guard handle for stages that must reject reuse within a run.
    fn single_use(&self) -> Option<SingleUse> {
        None
    }

    fn setup(&mut self, _pipe_name: &str) -> anyhow::Result<()> {
        Ok(())
    }

    fn flush(&mut self, _pipe_name: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A stage producing audio blocks from an external source.
pub trait Pump: Stage {
    /// Produces the next block. `Ok(None)` signals end of stream.
    fn produce(&mut self) -> anyhow::Result<Option<Buffer>>;
}

/// A stage transforming one audio block into another.
pub trait Processor: Stage {
    fn process(&mut self, input: &Buffer) -> anyhow::Result<Buffer>;
}

/// A stage consuming audio blocks into an external destination.
pub trait Sink: Stage {
    fn consume(&mut self, input: &Buffer) -> anyhow::Result<()>;
}

// Boxed stages delegate, so stages reclaimed from a dissolved pipe can be
// wired into a new one without unboxing.

impl<T: Stage + ?Sized> Stage for Box<T> {
    fn uid(&self) -> Uid {
        (**self).uid()
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        (**self).as_any_mut()
    }

    fn single_use(&self) -> Option<SingleUse> {
        (**self).single_use()
    }

    fn setup(&mut self, pipe_name: &str) -> anyhow::Result<()> {
        (**self).setup(pipe_name)
    }

    fn flush(&mut self, pipe_name: &str) -> anyhow::Result<()> {
        (**self).flush(pipe_name)
    }
}

impl<T: Pump + ?Sized> Pump for Box<T> {
    fn produce(&mut self) -> anyhow::Result<Option<Buffer>> {
        (**self).produce()
    }
}

impl<T: Processor + ?Sized> Processor for Box<T> {
    fn process(&mut self, input: &Buffer) -> anyhow::Result<Buffer> {
        (**self).process(input)
    }
}

impl<T: Sink + ?Sized> Sink for Box<T> {
    fn consume(&mut self, input: &Buffer) -> anyhow::Result<()> {
        (**self).consume(input)
    }
}

#[cfg(test)]
mod tests {
    use super::SingleUse;
    use crate::error::PipeError;

    #[test]
    fn second_acquire_before_reset_is_a_violation() {
        let guard = SingleUse::new();
        guard.acquire().expect("first acquire succeeds");
        let err = guard.acquire().expect_err("second acquire must fail");
        assert!(matches!(err, PipeError::SingleUseViolation));
    }

    #[test]
    fn reset_allows_reacquire() {
        let guard = SingleUse::new();
        guard.acquire().expect("first acquire succeeds");
        guard.reset();
        guard.acquire().expect("acquire after reset succeeds");
    }

    #[test]
    fn clones_share_the_token() {
        let guard = SingleUse::new();
        let clone = guard.clone();
        guard.acquire().expect("first acquire succeeds");
        assert!(clone.acquire().is_err());
        clone.reset();
        guard.acquire().expect("reset through clone is visible");
    }
}
