//! Fragmented MP4 capture and fan-out
//!
//! - **`mp4`**: incremental box demultiplexer
//! - **`producer`**: the encoder process and its argument list
//! - **`broadcast`**: producer lifecycle and subscriber fan-out

pub mod broadcast;
pub mod mp4;
pub mod producer;

pub use broadcast::{
    EngineError, EngineState, EngineStatus, MediaBroadcaster, StreamEnd, SubscriberId,
    Subscription,
};
pub use mp4::{BoxError, BoxParser, BoxType, MediaBox};
pub use producer::ProducerCommand;
