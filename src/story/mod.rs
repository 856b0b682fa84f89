//! Story assembly: pages, the frame drawer and the production orchestrator.

mod drawer;
mod maker;
mod page;

pub use drawer::StoryFrameDrawer;
pub use maker::{CancelHandle, ProgressHandle, StoryMaker, StorySettings};
pub use page::{NormRect, PanZoom, StoryPage};
