#![forbid(unsafe_code)]

pub mod error;
pub mod media;
pub mod mux;
pub mod pipe;
pub mod story;

pub use error::{StoryError, StoryResult};
pub use media::{AudioFormat, BufferFlags, BufferInfo, MediaType, StreamFormat};
pub use mux::{ContainerFormat, MediaMuxer, MuxProgress};
pub use story::{CancelHandle, ProgressHandle, StoryMaker, StoryPage, StorySettings};
