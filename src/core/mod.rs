//! 核心层：错误分类、服务上下文装配、优雅关闭

pub mod context;
pub mod error;
pub mod shutdown;

pub use context::{ServiceContext, ServiceContextBuilder};
pub use error::{CrawlError, IndexError, OrchestrationError, SchedulingError, StartupError, StoreError};
pub use shutdown::{
    run_with_graceful_shutdown, CrawlDrain, ShutdownCleanup, ShutdownCoordinator, ShutdownManager,
    ShutdownReason, StoreCleanup,
};
