//! 版本锁：规则 ID → 版本号 / 内容哈希 / 分叉历史
mod entry;
mod store;
mod strategy;

pub use entry::{LockState, PreviousLockEntry, VersionLockEntry};
pub use store::{LockOutcome, LockRoute, LockUpdate, VersionLockStore, FORK_VERSION_BUFFER};
pub use strategy::VersionStrategy;
