//! In-memory capture sink.

use std::any::Any;
use std::sync::{Arc, Mutex};

use flowtone_core::{Buffer, SingleUse, Sink, Stage, Uid};

/// Sink backed by a plain growing buffer. Useful as a recording target in
/// tests and wherever a run's output is needed as data afterwards; read it
/// through the handle taken before the asset moves into its pipe.
pub struct Asset {
    uid: Uid,
    guard: SingleUse,
    contents: Arc<Mutex<Option<Buffer>>>,
}

impl Asset {
    pub fn new() -> Self {
        Self {
            uid: Uid::next(),
            guard: SingleUse::new(),
            contents: Arc::new(Mutex::new(None)),
        }
    }

    pub fn handle(&self) -> AssetHandle {
        AssetHandle {
            uid: self.uid,
            contents: Arc::clone(&self.contents),
        }
    }
}

impl Default for Asset {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct AssetHandle {
    uid: Uid,
    contents: Arc<Mutex<Option<Buffer>>>,
}

impl AssetHandle {
    pub fn uid(&self) -> Uid {
        self.uid
    }

    /// Everything consumed so far, across runs.
    pub fn contents(&self) -> Option<Buffer> {
        self.contents.lock().expect("asset mutex poisoned").clone()
    }
}

impl Stage for Asset {
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
        Ok(())
    }
}

impl Sink for Asset {
    fn consume(&mut self, input: &Buffer) -> anyhow::Result<()> {
        let mut contents = self.contents.lock().expect("asset mutex poisoned");
        match contents.as_mut() {
            Some(buffer) => buffer.append(input)?,
            None => *contents = Some(input.clone()),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Asset;
    use flowtone_core::{Buffer, NumChannels, Sink, Stage};

    #[test]
    fn appends_consumed_buffers() {
        let mut asset = Asset::new();
        let handle = asset.handle();
        asset.setup("capture").expect("setup");

        asset
            .consume(&Buffer::constant(NumChannels(1), 2, 0.1))
            .expect("consume");
        asset
            .consume(&Buffer::constant(NumChannels(1), 3, 0.2))
            .expect("consume");

        let contents = handle.contents().expect("captured contents");
        assert_eq!(contents.size(), 5);
        assert_eq!(contents.channel(0)[4], 0.2);
    }

    #[test]
    fn rejects_reuse_within_a_run() {
        let mut asset = Asset::new();
        asset.setup("capture").expect("first setup");
        assert!(asset.setup("capture").is_err());

        asset.single_use().expect("asset is guarded").reset();
        asset.setup("capture").expect("setup after reset");
    }
}
