//! common - 通用类型与弹性组件
//!
//! 断路器、分类重试执行器以及可取消的周期任务。

pub mod circuit_breaker;
pub mod retry;
pub mod task;
pub mod types;

pub use circuit_breaker::*;
pub use retry::*;
pub use task::*;
pub use types::*;
