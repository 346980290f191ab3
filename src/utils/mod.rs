pub mod clock;
pub mod config;
pub mod log_buffer;
pub mod logging;

pub use clock::{Clock, ManualClock, SystemClock};
pub use log_buffer::LogBuffer;
