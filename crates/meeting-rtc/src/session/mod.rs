//! Meeting session: protocol handler, event stream and facade

pub mod events;
mod handler;
pub mod meeting;

pub use events::{EventSink, MeetingEvent, RemoteMediaState};
pub use meeting::MeetingSession;
