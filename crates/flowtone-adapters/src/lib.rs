pub mod asset;
pub mod mock;
pub mod wav;

pub use asset::{Asset, AssetHandle};
pub use mock::{MockProcessor, MockPump, MockPumpHandle, MockSink, MockSinkHandle, MockStageHandle};
pub use wav::{WavPump, WavSink};
