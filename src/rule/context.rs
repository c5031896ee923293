//! 编译上下文：配置、版本锁策略、字段类型解析器、集成包清单
//! 显式注入编排层，不依赖全局状态

use std::sync::Arc;

use ruleforge_engine::{FieldTypeResolver, VersionLockStore, VersionStrategy};

use super::integrations::IntegrationManifest;
use crate::config::RulesConfig;
use crate::error::{RuleError, RuleResult};

#[derive(Clone)]
pub struct CompileContext {
    config: Arc<RulesConfig>,
    versions: VersionStrategy,
    fields: Option<FieldTypeResolver>,
    manifest: Option<Arc<dyn IntegrationManifest>>,
}

impl std::fmt::Debug for CompileContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompileContext")
            .field("config", &self.config)
            .field("versions", &self.versions)
            .field("fields", &self.fields)
            .field("manifest", &self.manifest.is_some())
            .finish()
    }
}

impl CompileContext {
    /// 按配置选择版本锁策略；未旁路时挂一个空锁存储
    pub fn new(config: RulesConfig) -> Self {
        let versions = if config.bypass_version_lock {
            VersionStrategy::Bypass
        } else {
            VersionStrategy::default()
        };
        Self {
            config: Arc::new(config),
            versions,
            fields: None,
            manifest: None,
        }
    }

    /// 挂载版本锁存储；配置为旁路时拒绝
    pub fn with_lock_store(mut self, store: Arc<VersionLockStore>) -> RuleResult<Self> {
        if self.config.bypass_version_lock {
            return Err(RuleError::Configuration(
                "cannot attach a version lock store while version locking is bypassed".to_string(),
            ));
        }
        self.versions = VersionStrategy::Locked(store);
        Ok(self)
    }

    pub fn with_field_resolver(mut self, resolver: FieldTypeResolver) -> Self {
        self.fields = Some(resolver);
        self
    }

    pub fn with_manifest(mut self, manifest: Arc<dyn IntegrationManifest>) -> Self {
        self.manifest = Some(manifest);
        self
    }

    pub fn config(&self) -> &RulesConfig {
        &self.config
    }

    pub fn versions(&self) -> &VersionStrategy {
        &self.versions
    }

    pub fn is_lock_bypassed(&self) -> bool {
        self.versions.is_bypassed()
    }

    /// 旁路模式下访问锁存储是配置错误
    pub fn lock_store(&self) -> RuleResult<&Arc<VersionLockStore>> {
        Ok(self.versions.lock_store()?)
    }

    pub fn field_resolver(&self) -> Option<&FieldTypeResolver> {
        self.fields.as_ref()
    }

    pub fn manifest(&self) -> Option<&dyn IntegrationManifest> {
        self.manifest.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bypass_rejects_lock_store() {
        let config = RulesConfig::builder().bypass_version_lock(true).build().unwrap();
        let ctx = CompileContext::new(config);
        assert!(ctx.is_lock_bypassed());
        assert!(matches!(ctx.lock_store(), Err(RuleError::Configuration(_))));

        let err = ctx.with_lock_store(Arc::new(VersionLockStore::new())).unwrap_err();
        assert!(err.is_fatal_for_batch());
    }

    #[test]
    fn test_locked_context_shares_store() {
        let store = Arc::new(VersionLockStore::new());
        let ctx = CompileContext::new(RulesConfig::default())
            .with_lock_store(store.clone())
            .unwrap();
        assert!(Arc::ptr_eq(ctx.lock_store().unwrap(), &store));
    }
}
