use crate::error::PipeError;
use crate::types::NumChannels;

/// Planar block of normalized float samples in [-1, 1].
///
/// One sample vector per channel, all vectors of equal length. The channel
/// count is fixed at creation; the frame count grows through [`Buffer::append`].
#[derive(Debug, Clone, PartialEq)]
pub struct Buffer {
    channels: Vec<Vec<f32>>,
}

impl Buffer {
    /// Creates an empty buffer with `num_channels` channels.
    ///
    /// # Panics
    /// Panics if `num_channels` is zero; zero-channel buffers are illegal.
    pub fn new(num_channels: NumChannels) -> Self {
        assert!(num_channels.0 > 0, "buffer must have at least one channel");
        Self {
            channels: vec![Vec::new(); num_channels.get()],
        }
    }

    /// Creates a buffer of `frames` frames with every sample set to `value`.
    pub fn constant(num_channels: NumChannels, frames: usize, value: f32) -> Self {
        assert!(num_channels.0 > 0, "buffer must have at least one channel");
        Self {
            channels: vec![vec![value; frames]; num_channels.get()],
        }
    }

    /// Builds a buffer from planar channel data, validating that every
    /// channel vector has the same length.
    pub fn from_planar(channels: Vec<Vec<f32>>) -> Result<Self, PipeError> {
        if channels.is_empty() {
            return Err(PipeError::InvalidConfig {
                reason: "buffer must have at least one channel".to_string(),
            });
        }
        let frames = channels[0].len();
        if channels.iter().any(|ch| ch.len() != frames) {
            return Err(PipeError::InvalidConfig {
                reason: "buffer channels must have equal length".to_string(),
            });
        }
        Ok(Self { channels })
    }

    /// Shared per-channel frame count.
    pub fn size(&self) -> usize {
        self.channels[0].len()
    }

    pub fn num_channels(&self) -> NumChannels {
        NumChannels(self.channels.len() as u16)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn channel(&self, index: usize) -> &[f32] {
        &self.channels[index]
    }

    pub fn channel_mut(&mut self, index: usize) -> &mut Vec<f32> {
        &mut self.channels[index]
    }

    pub fn channels(&self) -> impl Iterator<Item = &[f32]> {
        self.channels.iter().map(Vec::as_slice)
    }

    /// Appends `other` channel-wise. Appending an empty buffer is a no-op;
    /// otherwise the channel counts must match.
    pub fn append(&mut self, other: &Buffer) -> Result<(), PipeError> {
        if other.is_empty() {
            return Ok(());
        }
        if other.num_channels() != self.num_channels() {
            return Err(PipeError::ChannelMismatch {
                expected: self.num_channels().get(),
                actual: other.num_channels().get(),
            });
        }
        for (dst, src) in self.channels.iter_mut().zip(&other.channels) {
            dst.extend_from_slice(src);
        }
        Ok(())
    }

    /// Returns a channel-aligned copy of up to `len` frames starting at
    /// `start`. The range is clamped to the buffer's frame count.
    pub fn slice(&self, start: usize, len: usize) -> Buffer {
        let end = start.saturating_add(len).min(self.size());
        let start = start.min(end);
        Buffer {
            channels: self.channels.iter().map(|ch| ch[start..end].to_vec()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Buffer;
    use crate::error::PipeError;
    use crate::types::NumChannels;

    #[test]
    fn append_concatenates_channel_wise() {
        let mut buf = Buffer::constant(NumChannels(2), 3, 0.1);
        let more = Buffer::constant(NumChannels(2), 2, 0.2);
        buf.append(&more).expect("matching channel counts");

        assert_eq!(buf.size(), 5);
        assert_eq!(buf.num_channels(), NumChannels(2));
        assert_eq!(buf.channel(0)[3], 0.2);
        assert_eq!(buf.channel(1)[0], 0.1);
    }

    #[test]
    fn append_rejects_channel_mismatch() {
        let mut buf = Buffer::constant(NumChannels(2), 3, 0.0);
        let other = Buffer::constant(NumChannels(1), 3, 0.0);
        let err = buf.append(&other).expect_err("mismatched channel counts");
        assert!(matches!(
            err,
            PipeError::ChannelMismatch {
                expected: 2,
                actual: 1
            }
        ));
    }

    #[test]
    fn append_empty_is_noop_regardless_of_channels() {
        let mut buf = Buffer::constant(NumChannels(2), 3, 0.0);
        let empty = Buffer::new(NumChannels(1));
        buf.append(&empty).expect("empty append is a no-op");
        assert_eq!(buf.size(), 3);
    }

    #[test]
    fn slice_preserves_channel_alignment() {
        let buf = Buffer::from_planar(vec![vec![0.0, 1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0, 7.0]])
            .expect("valid planar data");
        let part = buf.slice(1, 2);
        assert_eq!(part.channel(0), &[1.0, 2.0]);
        assert_eq!(part.channel(1), &[5.0, 6.0]);
    }

    #[test]
    fn slice_clamps_out_of_range() {
        let buf = Buffer::constant(NumChannels(1), 4, 0.5);
        assert_eq!(buf.slice(2, 10).size(), 2);
        assert_eq!(buf.slice(9, 3).size(), 0);
    }

    #[test]
    fn from_planar_rejects_ragged_channels() {
        let err = Buffer::from_planar(vec![vec![0.0, 1.0], vec![0.0]])
            .expect_err("ragged channels are illegal");
        assert!(matches!(err, PipeError::InvalidConfig { .. }));
    }

    #[test]
    #[should_panic(expected = "at least one channel")]
    fn zero_channel_buffer_is_illegal() {
        let _ = Buffer::new(NumChannels(0));
    }
}
