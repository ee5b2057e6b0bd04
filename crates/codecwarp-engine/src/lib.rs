//! codecwarp-engine - Concurrent codec session engine
//!
//! A [`CodecSession`] accepts frames from an async owner context, runs the
//! codec on a dedicated worker thread fed by a [`TaskQueue`], and delivers
//! outputs back to the owner in production order.

mod backpressure;
mod bridge;
mod queue;
mod session;
mod worker;

pub use bridge::{ErrorHandler, OutputHandler, SessionEvent, SessionHandlers};
pub use queue::{InFlight, TaskQueue};
pub use session::{CodecSession, SessionState};
