pub mod buffer;
pub mod error;
pub mod message;
pub mod param;
pub mod stage;
pub mod types;
pub mod uid;

pub use buffer::Buffer;
pub use error::PipeError;
pub use message::Message;
pub use param::{Param, ParamFn, Params};
pub use stage::{Processor, Pump, Sink, SingleUse, Stage};
pub use types::{BitDepth, BufferSize, NumChannels, SampleRate};
pub use uid::Uid;
