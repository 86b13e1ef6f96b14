use crossbeam_channel::{Receiver, Sender, bounded};

use flowtone_core::PipeError;

/// Completion handle for a state transition started with
/// [`Pipe::begin`](crate::Pipe::begin).
///
/// `run`'s handle resolves when the whole run terminates; pause, resume,
/// and close handles resolve when the transition takes effect. Dropping a
/// handle detaches from the result without affecting the transition.
pub struct Handle {
    rx: Receiver<Result<(), PipeError>>,
}

impl Handle {
    /// Blocks until the transition completes or fails.
    pub fn wait(self) -> Result<(), PipeError> {
        match self.rx.recv() {
            Ok(result) => result,
            Err(_) => Err(PipeError::ControllerExited),
        }
    }

    pub(crate) fn pending() -> (Sender<Result<(), PipeError>>, Self) {
        let (tx, rx) = bounded(1);
        (tx, Self { rx })
    }

    pub(crate) fn resolved(result: Result<(), PipeError>) -> Self {
        let (tx, rx) = bounded(1);
        let _ = tx.send(result);
        Self { rx }
    }
}
