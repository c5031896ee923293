use std::sync::Arc;

use super::store::VersionLockStore;
use crate::error::{CoreError, CoreResult};

/// 版本锁后端策略：显式注入编排层，取代全局状态 + 环境变量判断
#[derive(Debug, Clone)]
pub enum VersionStrategy {
    /// 使用真实锁存储
    Locked(Arc<VersionLockStore>),
    /// 管理员旁路：不读不写版本锁
    Bypass,
}

impl Default for VersionStrategy {
    fn default() -> Self {
        VersionStrategy::Locked(Arc::new(VersionLockStore::new()))
    }
}

impl VersionStrategy {
    pub fn locked(store: VersionLockStore) -> Self {
        VersionStrategy::Locked(Arc::new(store))
    }

    pub fn is_bypassed(&self) -> bool {
        matches!(self, VersionStrategy::Bypass)
    }

    /// 取锁存储；旁路模式下立即报错
    pub fn lock_store(&self) -> CoreResult<&Arc<VersionLockStore>> {
        match self {
            VersionStrategy::Locked(store) => Ok(store),
            VersionStrategy::Bypass => Err(CoreError::LockBypassed(
                "version lock store requested while version locking is bypassed".to_string(),
            )),
        }
    }

    /// 只读查询用：旁路模式返回 None
    pub fn store(&self) -> Option<&Arc<VersionLockStore>> {
        match self {
            VersionStrategy::Locked(store) => Some(store),
            VersionStrategy::Bypass => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bypass_rejects_store_access() {
        let strategy = VersionStrategy::Bypass;
        assert!(strategy.is_bypassed());
        assert!(strategy.store().is_none());
        assert!(matches!(strategy.lock_store(), Err(CoreError::LockBypassed(_))));
    }

    #[test]
    fn test_locked_shares_store() {
        let strategy = VersionStrategy::locked(VersionLockStore::new());
        let cloned = strategy.clone();
        let a = strategy.lock_store().unwrap();
        let b = cloned.lock_store().unwrap();
        assert!(Arc::ptr_eq(a, b));
    }
}
