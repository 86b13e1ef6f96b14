//! N-input, one-output mixing node.
//!
//! A [`Mixer`] is the rendezvous point between pipes: it hands out
//! [`MixerInput`] handles that act as sinks in upstream pipes and one
//! [`MixerOutput`] that acts as the pump of a downstream pipe. The output
//! advances in lockstep: each produced block is the per-channel,
//! per-frame sum of one block from every input that has not yet ended,
//! clamped to [-1, 1], so the slowest input sets the pace.
//!
//! Inputs leave the mix when their upstream stream ends (explicit end
//! marker sent on flush) or disconnects (upstream failure or
//! cancellation). When no inputs remain the output signals end of stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use crossbeam_channel::{Receiver, Sender, bounded};
use tracing::debug;

use flowtone_core::{Buffer, BufferSize, NumChannels, PipeError, Pump, Sink, Stage, Uid};

/// Pending blocks held per input; small to absorb scheduling jitter while
/// keeping the join tight.
const INPUT_QUEUE_BLOCKS: usize = 2;

enum InputEvent {
    Block(Buffer),
    End,
}

struct InputSlot {
    uid: Uid,
    rx: Receiver<InputEvent>,
}

/// Shared mixing core. Create inputs with [`Mixer::input`] and claim the
/// single output with [`Mixer::output`]; wire both into their pipes before
/// running.
pub struct Mixer {
    channels: NumChannels,
    buffer_size: BufferSize,
    newcomers: Arc<Mutex<Vec<InputSlot>>>,
    output_taken: Arc<AtomicBool>,
}

impl Mixer {
    pub fn new(buffer_size: BufferSize, channels: NumChannels) -> Self {
        Self {
            channels,
            buffer_size,
            newcomers: Arc::new(Mutex::new(Vec::new())),
            output_taken: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn channels(&self) -> NumChannels {
        self.channels
    }

    pub fn buffer_size(&self) -> BufferSize {
        self.buffer_size
    }

    /// Registers a new input declared to carry `channels` channels and
    /// returns its sink handle. Registration fails when the declared count
    /// disagrees with the mixer's, so the mismatch surfaces at wiring time,
    /// before any pipe using the input is built or run.
    ///
    /// Inputs registered after the output pipe started are picked up at the
    /// output's next production tick.
    pub fn input(&self, channels: NumChannels) -> Result<MixerInput, PipeError> {
        if channels != self.channels {
            return Err(PipeError::ChannelMismatch {
                expected: self.channels.get(),
                actual: channels.get(),
            });
        }
        let uid = Uid::next();
        let (tx, rx) = bounded(INPUT_QUEUE_BLOCKS);
        self.newcomers
            .lock()
            .expect("mixer registry mutex poisoned")
            .push(InputSlot { uid, rx });
        debug!("mixer: input {uid} registered");
        Ok(MixerInput {
            uid,
            tx,
            channels: self.channels,
            buffer_size: self.buffer_size,
        })
    }

    /// Claims the mixer's single output pump handle. Fails on a second
    /// call; one output owns the join.
    pub fn output(&self) -> Result<MixerOutput, PipeError> {
        if self.output_taken.swap(true, Ordering::AcqRel) {
            return Err(PipeError::InvalidConfig {
                reason: "mixer output already taken".to_string(),
            });
        }
        Ok(MixerOutput {
            uid: Uid::next(),
            channels: self.channels,
            newcomers: Arc::clone(&self.newcomers),
            slots: Vec::new(),
        })
    }
}

/// Sink half of a mixer registration: lives inside one upstream pipe and
/// forwards that pipe's blocks into the join.
#[derive(Debug)]
pub struct MixerInput {
    uid: Uid,
    tx: Sender<InputEvent>,
    channels: NumChannels,
    buffer_size: BufferSize,
}

impl Stage for MixerInput {
    fn uid(&self) -> Uid {
        self.uid
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }

    fn flush(&mut self, _pipe_name: &str) -> anyhow::Result<()> {
        // The upstream run is over, whatever the reason; leave the mix.
        let _ = self.tx.send(InputEvent::End);
        debug!("mixer: input {} ended", self.uid);
        Ok(())
    }
}

impl Sink for MixerInput {
    fn consume(&mut self, input: &Buffer) -> anyhow::Result<()> {
        if input.num_channels() != self.channels {
            return Err(PipeError::ChannelMismatch {
                expected: self.channels.get(),
                actual: input.num_channels().get(),
            })
            .context("mixer input");
        }
        if input.size() > self.buffer_size.0 {
            anyhow::bail!(
                "mixer input block of {} frames exceeds mixer buffer size {}",
                input.size(),
                self.buffer_size
            );
        }
        self.tx
            .send(InputEvent::Block(input.clone()))
            .map_err(|_| anyhow::anyhow!("mixer output is gone"))
    }
}

/// Pump half of the mixer: lives inside the downstream pipe and produces
/// the block-aligned sum of all active inputs.
pub struct MixerOutput {
    uid: Uid,
    channels: NumChannels,
    newcomers: Arc<Mutex<Vec<InputSlot>>>,
    slots: Vec<InputSlot>,
}

impl MixerOutput {
    fn adopt_newcomers(&mut self) {
        let mut pending = self
            .newcomers
            .lock()
            .expect("mixer registry mutex poisoned");
        self.slots.append(&mut pending);
    }

    /// Collects one block from every input still in the join, dropping the
    /// inputs that ended. Blocks until every remaining input has delivered.
    fn gather(&mut self) -> Vec<Buffer> {
        let mut blocks = Vec::with_capacity(self.slots.len());
        self.slots.retain(|slot| match slot.rx.recv() {
            Ok(InputEvent::Block(buffer)) => {
                blocks.push(buffer);
                true
            },
            Ok(InputEvent::End) | Err(_) => {
                debug!("mixer: input {} left the join", slot.uid);
                false
            },
        });
        blocks
    }
}

impl Stage for MixerOutput {
    fn uid(&self) -> Uid {
        self.uid
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

impl Pump for MixerOutput {
    fn produce(&mut self) -> anyhow::Result<Option<Buffer>> {
        loop {
            self.adopt_newcomers();
            if self.slots.is_empty() {
                return Ok(None);
            }
            let blocks = self.gather();
            if !blocks.is_empty() {
                return Ok(Some(mix(self.channels, &blocks)));
            }
            // Every remaining input ended on this tick; loop to check for
            // late registrations before signalling end of stream.
        }
    }
}

/// Per-channel, per-frame sum of `blocks`, zero-extended to the longest
/// block and clamped to [-1, 1].
fn mix(channels: NumChannels, blocks: &[Buffer]) -> Buffer {
    let frames = blocks.iter().map(Buffer::size).max().unwrap_or(0);
    let mut out = Buffer::constant(channels, frames, 0.0);
    for block in blocks {
        for (index, samples) in block.channels().enumerate() {
            let dst = out.channel_mut(index);
            for (frame, sample) in samples.iter().enumerate() {
                dst[frame] += sample;
            }
        }
    }
    for index in 0..channels.get() {
        for sample in out.channel_mut(index) {
            *sample = sample.clamp(-1.0, 1.0);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::{Mixer, mix};
    use flowtone_core::{Buffer, BufferSize, NumChannels, Pump, Sink, Stage};

    #[test]
    fn single_input_behaves_like_pass_through() {
        let mixer = Mixer::new(BufferSize(4), NumChannels(1));
        let mut input = mixer.input(NumChannels(1)).expect("register input");
        let mut output = mixer.output().expect("first output claim");

        let block = Buffer::constant(NumChannels(1), 4, 0.25);
        input.consume(&block).expect("consume");
        input.flush("track").expect("flush");

        let produced = output.produce().expect("produce").expect("one block");
        assert_eq!(produced, block);
        assert!(output.produce().expect("produce").is_none());
    }

    #[test]
    fn sums_lockstep_blocks_across_inputs() {
        let mixer = Mixer::new(BufferSize(2), NumChannels(2));
        let mut a = mixer.input(NumChannels(2)).expect("register a");
        let mut b = mixer.input(NumChannels(2)).expect("register b");
        let mut output = mixer.output().expect("output");

        a.consume(&Buffer::constant(NumChannels(2), 2, 0.25)).expect("a");
        b.consume(&Buffer::constant(NumChannels(2), 2, 0.5)).expect("b");

        let block = output.produce().expect("produce").expect("block");
        assert_eq!(block.size(), 2);
        for channel in block.channels() {
            assert!(channel.iter().all(|&s| (s - 0.75).abs() < 1e-6));
        }
    }

    #[test]
    fn continues_with_remaining_inputs_after_one_ends() {
        let mixer = Mixer::new(BufferSize(2), NumChannels(1));
        let mut short = mixer.input(NumChannels(1)).expect("register short");
        let mut long = mixer.input(NumChannels(1)).expect("register long");
        let mut output = mixer.output().expect("output");

        short.consume(&Buffer::constant(NumChannels(1), 2, 0.1)).expect("short");
        long.consume(&Buffer::constant(NumChannels(1), 2, 0.2)).expect("long 1");
        short.flush("short-track").expect("short end");

        let first = output.produce().expect("produce").expect("block");
        assert!((first.channel(0)[0] - 0.3).abs() < 1e-6);

        long.consume(&Buffer::constant(NumChannels(1), 2, 0.2)).expect("long 2");
        long.flush("long-track").expect("long end");

        let second = output.produce().expect("produce").expect("block");
        assert!((second.channel(0)[0] - 0.2).abs() < 1e-6);
        assert!(output.produce().expect("produce").is_none());
    }

    #[test]
    fn output_clamps_hard_sums() {
        let blocks = vec![
            Buffer::constant(NumChannels(1), 2, 0.8),
            Buffer::constant(NumChannels(1), 2, 0.7),
        ];
        let mixed = mix(NumChannels(1), &blocks);
        assert!(mixed.channel(0).iter().all(|&s| s == 1.0));
    }

    #[test]
    fn rejects_mismatched_channel_count_at_registration() {
        let mixer = Mixer::new(BufferSize(4), NumChannels(2));
        let err = mixer
            .input(NumChannels(1))
            .expect_err("mismatched registration");
        assert!(matches!(
            err,
            flowtone_core::PipeError::ChannelMismatch {
                expected: 2,
                actual: 1
            }
        ));
    }

    #[test]
    fn rejects_blocks_that_break_the_declared_channel_count() {
        let mixer = Mixer::new(BufferSize(4), NumChannels(2));
        let mut input = mixer.input(NumChannels(2)).expect("register input");
        let err = input
            .consume(&Buffer::constant(NumChannels(1), 4, 0.0))
            .expect_err("mismatched block");
        assert!(err.to_string().contains("mixer input"));
    }

    #[test]
    fn second_output_claim_fails() {
        let mixer = Mixer::new(BufferSize(4), NumChannels(1));
        let _first = mixer.output().expect("first claim");
        assert!(mixer.output().is_err());
    }

    #[test]
    fn disconnected_input_is_treated_as_ended() {
        let mixer = Mixer::new(BufferSize(2), NumChannels(1));
        let mut a = mixer.input(NumChannels(1)).expect("register a");
        let b = mixer.input(NumChannels(1)).expect("register b");
        let mut output = mixer.output().expect("output");

        a.consume(&Buffer::constant(NumChannels(1), 2, 0.4)).expect("a");
        // Upstream failure: the input handle vanishes without an end marker.
        drop(b);
        let block = output.produce().expect("produce").expect("block");
        assert!((block.channel(0)[0] - 0.4).abs() < 1e-6);
    }

    #[test]
    fn empty_mixer_signals_end_of_stream() {
        let mixer = Mixer::new(BufferSize(2), NumChannels(1));
        let mut output = mixer.output().expect("output");
        assert!(output.produce().expect("produce").is_none());
    }
}
