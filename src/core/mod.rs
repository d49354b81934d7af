//! 核心并发原语：错误类型、双优先级锁、Inspect 并发限制、优雅关闭

pub mod error;
pub mod inspect_limiter;
pub mod priority_mutex;
pub mod shutdown;

pub use error::MachineError;
pub use inspect_limiter::InspectLimiter;
pub use priority_mutex::{PriorityGuard, PriorityMutex};
pub use shutdown::{ShutdownManager, ShutdownReason};
