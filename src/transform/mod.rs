//! Stdio transform pipeline: composable stages with object-mode
//! propagation and both asynchronous and fully-synchronous drivers.

pub mod encoding;
pub mod lines;
pub mod pipeline;
pub mod stage;
pub mod validate;

pub use encoding::Encoding;
pub use pipeline::Pipeline;
pub use stage::{AsyncTransform, Chunk, Stage, Transform};
