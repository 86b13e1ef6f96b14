use crossbeam_channel::{Sender, unbounded};
use tracing::warn;

use flowtone_core::{BufferSize, Param, Params, PipeError, Processor, Pump, SampleRate, Sink, Uid};

use crate::config::PipeConfig;
use crate::controller::{Command, StageSet, spawn_controller};
use crate::handle::Handle;

/// State transition requested through [`Pipe::begin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Run,
    Pause,
    Resume,
    Close,
}

impl Action {
    pub(crate) fn name(self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Close => "close",
        }
    }
}

/// A declared audio graph with a lifecycle controller: one pump, an
/// ordered processor chain, and one or more fan-out sinks.
///
/// The graph is immutable after construction. The pipe can be run any
/// number of times; its stage instances are reset between runs through
/// their single-use guards.
pub struct Pipe {
    name: String,
    sample_rate: SampleRate,
    buffer_size: BufferSize,
    stage_uids: Vec<Uid>,
    cmd_tx: Sender<Command>,
}

impl Pipe {
    pub fn builder(sample_rate: SampleRate) -> PipeBuilder {
        PipeBuilder {
            config: PipeConfig::default(),
            sample_rate,
            pump: None,
            processors: Vec::new(),
            sinks: Vec::new(),
        }
    }

    /// Enqueues a state transition and returns its completion handle.
    pub fn begin(&self, action: Action) -> Handle {
        let (done, handle) = Handle::pending();
        if self.cmd_tx.send(Command::Begin { action, done }).is_err() {
            return Handle::resolved(Err(PipeError::ControllerExited));
        }
        handle
    }

    /// Starts a run. The handle resolves when the run terminates: end of
    /// stream, stage failure, or cancellation.
    pub fn run(&self) -> Handle {
        self.begin(Action::Run)
    }

    pub fn pause(&self) -> Handle {
        self.begin(Action::Pause)
    }

    pub fn resume(&self) -> Handle {
        self.begin(Action::Resume)
    }

    /// Closes the pipe. An active run is cancelled first (its handle
    /// resolves with `Cancelled`); afterwards every command fails.
    pub fn close(&self) -> Handle {
        self.begin(Action::Close)
    }

    pub fn run_and_wait(&self) -> Result<(), PipeError> {
        self.run().wait()
    }

    /// Queues parameter mutations. Accepted in any state; delivered
    /// in-band with the next block the pump produces.
    pub fn push<I>(&self, params: I)
    where
        I: IntoIterator<Item = Param>,
    {
        let params: Params = params.into_iter().collect();
        if self.cmd_tx.send(Command::Push { params }).is_err() {
            warn!("pipe '{}': parameters dropped, controller exited", self.name);
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sample_rate(&self) -> SampleRate {
        self.sample_rate
    }

    pub fn buffer_size(&self) -> BufferSize {
        self.buffer_size
    }

    /// Uids of the pump, processors, and sinks, in pipeline order.
    pub fn stage_uids(&self) -> &[Uid] {
        &self.stage_uids
    }

    /// Dissolves the pipe and hands its stage instances back, so they can
    /// be wired into a new pipe. Fails while a run is active.
    #[allow(clippy::type_complexity)]
    pub fn into_stages(
        self,
    ) -> Result<(Box<dyn Pump>, Vec<Box<dyn Processor>>, Vec<Box<dyn Sink>>), PipeError> {
        let (reply, rx) = crossbeam_channel::bounded(1);
        if self.cmd_tx.send(Command::TakeStages { reply }).is_err() {
            return Err(PipeError::ControllerExited);
        }
        match rx.recv() {
            Ok(Ok(set)) => Ok((set.pump, set.processors, set.sinks)),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(PipeError::ControllerExited),
        }
    }
}

/// Builder for [`Pipe`]. Validation happens in [`PipeBuilder::build`].
pub struct PipeBuilder {
    config: PipeConfig,
    sample_rate: SampleRate,
    pump: Option<Box<dyn Pump>>,
    processors: Vec<Box<dyn Processor>>,
    sinks: Vec<Box<dyn Sink>>,
}

impl PipeBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn buffer_size(mut self, buffer_size: BufferSize) -> Self {
        self.config.buffer_size = buffer_size;
        self
    }

    pub fn config(mut self, config: PipeConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the pipe's pump. Exactly one is required; a second call
    /// replaces the first.
    pub fn pump(mut self, pump: impl Pump + 'static) -> Self {
        self.pump = Some(Box::new(pump));
        self
    }

    /// Appends a processor to the chain; order of calls is pipeline order.
    pub fn processor(mut self, processor: impl Processor + 'static) -> Self {
        self.processors.push(Box::new(processor));
        self
    }

    /// Adds a fan-out sink. At least one is required.
    pub fn sink(mut self, sink: impl Sink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn build(self) -> Result<Pipe, PipeError> {
        let Some(pump) = self.pump else {
            return Err(PipeError::InvalidConfig {
                reason: "pipe requires a pump".to_string(),
            });
        };
        if self.sinks.is_empty() {
            return Err(PipeError::InvalidConfig {
                reason: "pipe requires at least one sink".to_string(),
            });
        }
        if self.config.buffer_size.0 == 0 {
            return Err(PipeError::InvalidConfig {
                reason: "buffer size must be positive".to_string(),
            });
        }
        if self.sample_rate.0 == 0 {
            return Err(PipeError::InvalidConfig {
                reason: "sample rate must be positive".to_string(),
            });
        }

        let mut stage_uids = Vec::with_capacity(1 + self.processors.len() + self.sinks.len());
        let mut guards = Vec::new();
        stage_uids.push(pump.uid());
        if let Some(guard) = pump.single_use() {
            guards.push(guard);
        }
        for processor in &self.processors {
            stage_uids.push(processor.uid());
            if let Some(guard) = processor.single_use() {
                guards.push(guard);
            }
        }
        for sink in &self.sinks {
            stage_uids.push(sink.uid());
            if let Some(guard) = sink.single_use() {
                guards.push(guard);
            }
        }

        let (cmd_tx, cmd_rx) = unbounded();
        spawn_controller(
            self.config.name.clone(),
            StageSet {
                pump,
                processors: self.processors,
                sinks: self.sinks,
            },
            guards,
            cmd_rx,
        );

        Ok(Pipe {
            name: self.config.name,
            sample_rate: self.sample_rate,
            buffer_size: self.config.buffer_size,
            stage_uids,
            cmd_tx,
        })
    }
}
