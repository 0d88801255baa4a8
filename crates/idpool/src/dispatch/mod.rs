mod orchestrator;
mod phase;

pub use orchestrator::*;
pub use phase::*;
