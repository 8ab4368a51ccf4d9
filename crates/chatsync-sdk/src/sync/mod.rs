//! 同步引擎
//!
//! - `status`：同步状态跟踪（唯一写状态的地方）
//! - `retry_policy`：失败分类与退避
//! - `orchestrator`：乐观写入 → 远端调用 → 结果写回
//! - `query`：本地/远端查询合并与实时事件合并
//! - `sync_manager`：重连补偿、崩溃恢复
//! - `keyed_lock`：实体锁与按实体排队的后台任务

pub mod keyed_lock;
pub mod orchestrator;
pub mod query;
pub mod retry_policy;
pub mod status;
pub mod sync_manager;

pub use keyed_lock::{KeyedLock, KeyedQueue};
pub use orchestrator::{MutationOrchestrator, MutationResult};
pub use query::{QueryController, QueryResponse, RefreshHandle, RefreshOutcome};
pub use retry_policy::{ExponentialBackoffPolicy, NoRetryPolicy, RetryDecision, RetryPolicy};
pub use status::{MutationOutcome, Resolution, SyncStatusTracker};
pub use sync_manager::{ReplayReport, SyncManager};
