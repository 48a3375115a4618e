//! Session directory and idle eviction

mod reaper;
mod registry;

pub use reaper::Reaper;
pub use registry::{Session, SessionRegistry};
