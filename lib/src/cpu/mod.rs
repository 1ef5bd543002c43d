pub mod cache;
pub mod interrupts;

pub use interrupts::*;
pub use cache::{CacheControl, CacheOp, HardwareCache};
