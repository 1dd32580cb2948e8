//! 核心编排层：错误与恢复、重试策略、任务调度、健康监控、优雅关闭、主控编排

pub mod builder;
pub mod error;
pub mod health;
pub mod orchestrator;
pub mod recovery;
pub mod retry;
pub mod shutdown;
pub mod task_scheduler;

pub use builder::{AgentRuntime, RuntimeBuilder};
pub use error::{AgentError, ErrorKind, RecoveryAction};
pub use health::{BackendStatus, HealthMonitor, HealthSnapshot, ToolTally};
pub use orchestrator::{
    ActionSummary, FailureInfo, Orchestrator, OrchestratorSettings, TurnRequest, TurnResponse,
};
pub use recovery::RecoveryEngine;
pub use retry::{RetryPolicy, Retryable};
pub use shutdown::{
    run_until_shutdown, DrainPool, ShutdownCoordinator, ShutdownManager, ShutdownReason,
    ShutdownStage, StageOutcome, StopScheduler,
};
pub use task_scheduler::{SchedulePolicy, TaskScheduler};
