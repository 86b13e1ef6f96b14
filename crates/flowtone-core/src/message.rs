use std::sync::Arc;

use crate::buffer::Buffer;
use crate::param::Params;
use crate::uid::Uid;

/// The unit flowing between stages: one audio block plus the parameter
/// mutations riding in-band with it.
///
/// The buffer is reference-counted so a fan-out can hand the same block to
/// every sink without copying; sinks treat it as read-only.
pub struct Message {
    pub buffer: Arc<Buffer>,
    pub params: Params,
    pub source: Uid,
}

impl Message {
    pub fn new(buffer: Buffer, params: Params, source: Uid) -> Self {
        Self {
            buffer: Arc::new(buffer),
            params,
            source,
        }
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("frames", &self.buffer.size())
            .field("channels", &self.buffer.num_channels())
            .field("params", &self.params)
            .field("source", &self.source)
            .finish()
    }
}
