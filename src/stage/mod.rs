pub mod runner;
pub mod throttle;

pub use runner::{PartialSink, StagePartial, StageRunner, StageTarget};
pub use throttle::{coalesce, StreamCoalescer, StreamSnapshot, DEFAULT_FLUSH_INTERVAL};
