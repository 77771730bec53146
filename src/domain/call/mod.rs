//! Call bounded context - call state, direction and lifecycle events

pub mod event;
pub mod value_object;

pub use event::{CallEvent, EventType};
pub use value_object::{CallDirection, CallState};
