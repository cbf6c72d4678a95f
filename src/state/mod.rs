//! Application state

mod session;

pub use session::{JobId, JobKind, PlaybackSource, Phase, Refusal, Session};
