//! Deterministic test stages: a constant-value pump, a pass-through
//! processor, and a capturing sink, each with shared counters readable
//! after the stage instance has moved into a pipe.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use flowtone_core::{
    Buffer, BufferSize, NumChannels, Param, Processor, Pump, SingleUse, Sink, Stage, Uid,
};

/// Message/frame counters shared between a mock stage and its handle.
/// Reset at every setup, so they always describe the most recent run.
#[derive(Debug, Clone, Default)]
pub struct Counters {
    messages: Arc<AtomicU64>,
    frames: Arc<AtomicU64>,
}

impl Counters {
    pub fn messages(&self) -> u64 {
        self.messages.load(Ordering::Acquire)
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Acquire)
    }

    fn record(&self, frames: u64) {
        self.messages.fetch_add(1, Ordering::AcqRel);
        self.frames.fetch_add(frames, Ordering::AcqRel);
    }

    fn reset(&self) {
        self.messages.store(0, Ordering::Release);
        self.frames.store(0, Ordering::Release);
    }
}

/// Produces `limit` blocks of `buffer_size` frames, every sample equal to
/// `value`. Limit, value, and channel count are parameterizable at runtime
/// through the constructors on [`MockPumpHandle`].
pub struct MockPump {
    uid: Uid,
    guard: SingleUse,
    limit: usize,
    value: f32,
    num_channels: NumChannels,
    buffer_size: BufferSize,
    interval: Option<Duration>,
    counters: Counters,
}

impl MockPump {
    pub fn new(buffer_size: BufferSize, num_channels: NumChannels, limit: usize, value: f32) -> Self {
        Self {
            uid: Uid::next(),
            guard: SingleUse::new(),
            limit,
            value,
            num_channels,
            buffer_size,
            interval: None,
            counters: Counters::default(),
        }
    }

    /// Adds a sleep before each produced block, for pacing-sensitive tests.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    /// Handle for counters and parameter constructors; grab it before the
    /// pump moves into a pipe.
    pub fn handle(&self) -> MockPumpHandle {
        MockPumpHandle {
            uid: self.uid,
            counters: self.counters.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MockPumpHandle {
    uid: Uid,
    counters: Counters,
}

impl MockPumpHandle {
    pub fn uid(&self) -> Uid {
        self.uid
    }

    /// (messages, frames) produced by the most recent run.
    pub fn counts(&self) -> (u64, u64) {
        (self.counters.messages(), self.counters.frames())
    }

    pub fn limit_param(&self, limit: usize) -> Param {
        Param::new::<MockPump, _>(self.uid, move |pump| pump.limit = limit)
    }

    pub fn value_param(&self, value: f32) -> Param {
        Param::new::<MockPump, _>(self.uid, move |pump| pump.value = value)
    }

    pub fn num_channels_param(&self, num_channels: NumChannels) -> Param {
        Param::new::<MockPump, _>(self.uid, move |pump| pump.num_channels = num_channels)
    }
}

impl Stage for MockPump {
    fn uid(&self) -> Uid {
        self.uid
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn single_use(&self) -> Option<SingleUse> {
        Some(self.guard.clone())
    }

    fn setup(&mut self, _pipe_name: &str) -> anyhow::Result<()> {
        self.guard.acquire()?;
        self.counters.reset();
        Ok(())
    }
}

impl Pump for MockPump {
    fn produce(&mut self) -> anyhow::Result<Option<Buffer>> {
        // The cutoff reads the per-run counter, so a limit param applied
        // between blocks (including before the first) takes effect here.
        if self.counters.messages() >= self.limit as u64 {
            return Ok(None);
        }
        if let Some(interval) = self.interval {
            std::thread::sleep(interval);
        }
        let buffer = Buffer::constant(self.num_channels, self.buffer_size.0, self.value);
        self.counters.record(buffer.size() as u64);
        Ok(Some(buffer))
    }
}

/// Pass-through processor that counts what flows through it.
pub struct MockProcessor {
    uid: Uid,
    counters: Counters,
}

impl MockProcessor {
    pub fn new() -> Self {
        Self {
            uid: Uid::next(),
            counters: Counters::default(),
        }
    }

    pub fn handle(&self) -> MockStageHandle {
        MockStageHandle {
            uid: self.uid,
            counters: self.counters.clone(),
        }
    }
}

impl Default for MockProcessor {
    fn default() -> Self {
        Self::new()
    }
}

/// Counter handle for processors and sinks.
#[derive(Debug, Clone)]
pub struct MockStageHandle {
    uid: Uid,
    counters: Counters,
}

impl MockStageHandle {
    pub fn uid(&self) -> Uid {
        self.uid
    }

    pub fn counts(&self) -> (u64, u64) {
        (self.counters.messages(), self.counters.frames())
    }
}

impl Stage for MockProcessor {
    fn uid(&self) -> Uid {
        self.uid
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn setup(&mut self, _pipe_name: &str) -> anyhow::Result<()> {
        self.counters.reset();
        Ok(())
    }
}

impl Processor for MockProcessor {
    fn process(&mut self, input: &Buffer) -> anyhow::Result<Buffer> {
        self.counters.record(input.size() as u64);
        Ok(input.clone())
    }
}

/// Counting sink that also appends everything it consumes into a shared
/// capture buffer, readable through [`MockSinkHandle::captured`].
pub struct MockSink {
    uid: Uid,
    counters: Counters,
    captured: Arc<Mutex<Option<Buffer>>>,
}

impl MockSink {
    pub fn new() -> Self {
        Self {
            uid: Uid::next(),
            counters: Counters::default(),
            captured: Arc::new(Mutex::new(None)),
        }
    }

    pub fn handle(&self) -> MockSinkHandle {
        MockSinkHandle {
            uid: self.uid,
            counters: self.counters.clone(),
            captured: Arc::clone(&self.captured),
        }
    }
}

impl Default for MockSink {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct MockSinkHandle {
    uid: Uid,
    counters: Counters,
    captured: Arc<Mutex<Option<Buffer>>>,
}

impl MockSinkHandle {
    pub fn uid(&self) -> Uid {
        self.uid
    }

    pub fn counts(&self) -> (u64, u64) {
        (self.counters.messages(), self.counters.frames())
    }

    /// Everything the sink consumed during the most recent run.
    pub fn captured(&self) -> Option<Buffer> {
        self.captured.lock().expect("capture mutex poisoned").clone()
    }
}

impl Stage for MockSink {
    fn uid(&self) -> Uid {
        self.uid
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn setup(&mut self, _pipe_name: &str) -> anyhow::Result<()> {
        self.counters.reset();
        *self.captured.lock().expect("capture mutex poisoned") = None;
        Ok(())
    }
}

impl Sink for MockSink {
    fn consume(&mut self, input: &Buffer) -> anyhow::Result<()> {
        self.counters.record(input.size() as u64);
        let mut captured = self.captured.lock().expect("capture mutex poisoned");
        match captured.as_mut() {
            Some(buffer) => buffer.append(input)?,
            None => *captured = Some(input.clone()),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{MockPump, MockSink};
    use flowtone_core::{BufferSize, NumChannels, Pump, Sink, Stage};

    #[test]
    fn pump_produces_limit_blocks_then_ends() {
        let mut pump = MockPump::new(BufferSize(4), NumChannels(1), 3, 0.5);
        let handle = pump.handle();
        pump.setup("test").expect("setup");

        let mut blocks = 0;
        while let Some(buffer) = pump.produce().expect("produce") {
            assert_eq!(buffer.size(), 4);
            assert!(buffer.channel(0).iter().all(|&s| s == 0.5));
            blocks += 1;
        }
        assert_eq!(blocks, 3);
        assert_eq!(handle.counts(), (3, 12));
    }

    #[test]
    fn pump_counters_reset_between_runs() {
        let mut pump = MockPump::new(BufferSize(2), NumChannels(1), 2, 0.1);
        let handle = pump.handle();

        pump.setup("test").expect("first setup");
        while pump.produce().expect("produce").is_some() {}
        assert_eq!(handle.counts(), (2, 4));

        pump.single_use().expect("pump is guarded").reset();
        pump.setup("test").expect("second setup");
        assert_eq!(handle.counts(), (0, 0));
    }

    #[test]
    fn sink_captures_appended_stream() {
        let mut sink = MockSink::new();
        let handle = sink.handle();
        sink.setup("test").expect("setup");

        sink.consume(&flowtone_core::Buffer::constant(NumChannels(2), 3, 0.2))
            .expect("consume");
        sink.consume(&flowtone_core::Buffer::constant(NumChannels(2), 3, 0.4))
            .expect("consume");

        let captured = handle.captured().expect("captured stream");
        assert_eq!(captured.size(), 6);
        assert_eq!(captured.channel(0)[5], 0.4);
        assert_eq!(handle.counts(), (2, 6));
    }
}
