pub mod detect;
pub mod distance;
pub mod pop;

pub use detect::{BatchOutput, BatchStats, BorderDetector, Detection, PathStats};
pub use pop::{KnownPop, PopList};
