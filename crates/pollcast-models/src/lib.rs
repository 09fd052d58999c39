pub mod event;
pub mod gateway;
pub mod poll;

pub use event::{ClosedMarker, UpdateEvent, VoteTally};
pub use gateway::{ClientMessage, ServerMessage};
pub use poll::{Poll, PollResults, Vote};
