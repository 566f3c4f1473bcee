mod bus;
mod event;

pub use bus::{Bus, EventStream};
pub use event::{Event, EventKind};
