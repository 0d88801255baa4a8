mod channel;
mod event;
mod interface;

pub use channel::*;
pub use event::*;
pub use interface::*;
