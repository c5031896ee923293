//! 规则编译全局配置

use rustc_hash::FxHashSet;
use serde::Deserialize;
use std::fs;
use std::path::Path;

use ruleforge_engine::StackVersion;

use crate::error::{RuleError, RuleResult};

/// 旁路 building block 时间窗口校验
pub const ENV_BYPASS_BBR_LOOKBACK: &str = "DR_BYPASS_BBR_LOOKBACK_VALIDATION";
/// 旁路 note 校验与解析
pub const ENV_BYPASS_NOTE_VALIDATION: &str = "DR_BYPASS_NOTE_VALIDATION_AND_PARSE";
/// 旁路版本锁
pub const ENV_BYPASS_VERSION_LOCK: &str = "DR_BYPASS_VERSION_LOCK";

/// 完整规则配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    /// 版本锁旁路：版本号取自规则自身
    pub bypass_version_lock: bool,
    /// 本次编译面向的平台发布版本
    pub current_package_version: StackVersion,
    /// 仍受支持的最低平台版本
    pub min_supported_stack_version: StackVersion,
    pub bypass_bbr_timing: bool,
    pub bypass_note_validation: bool,
    /// 跳过查询 / note / 时间窗口校验的规则 ID
    pub skip_validation_rule_ids: FxHashSet<String>,
    /// KQL 关键字大小写归一
    pub normalize_kql_keywords: bool,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            bypass_version_lock: false,
            current_package_version: StackVersion::new(8, 14, 0),
            min_supported_stack_version: StackVersion::new(8, 3, 0),
            bypass_bbr_timing: false,
            bypass_note_validation: false,
            skip_validation_rule_ids: FxHashSet::default(),
            normalize_kql_keywords: true,
        }
    }
}

impl RulesConfig {
    pub fn builder() -> CustomConfigBuilder {
        CustomConfigBuilder::new()
    }

    pub fn from_json(content: &str) -> RuleResult<Self> {
        let config: RulesConfig = serde_json::from_str(content)?;
        config.validate()
    }

    pub fn load(path: &Path) -> RuleResult<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| RuleError::Configuration(format!("cannot read {}: {}", path.display(), e)))?;
        let config = Self::from_json(&content)?;
        log::info!("Rules config loaded from {}", path.display());
        Ok(config)
    }

    /// 叠加环境变量开关（仅判断是否设置）
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var_os(key).is_some())
    }

    pub fn with_overrides(mut self, is_set: impl Fn(&str) -> bool) -> Self {
        if is_set(ENV_BYPASS_BBR_LOOKBACK) {
            self.bypass_bbr_timing = true;
        }
        if is_set(ENV_BYPASS_NOTE_VALIDATION) {
            self.bypass_note_validation = true;
        }
        if is_set(ENV_BYPASS_VERSION_LOCK) {
            self.bypass_version_lock = true;
        }
        self
    }

    pub fn should_skip_validation(&self, rule_id: &str) -> bool {
        self.skip_validation_rule_ids.contains(rule_id)
    }

    fn validate(self) -> RuleResult<Self> {
        if self.current_package_version < self.min_supported_stack_version {
            return Err(RuleError::Configuration(format!(
                "current package version {} is below min supported stack version {}",
                self.current_package_version, self.min_supported_stack_version
            )));
        }
        Ok(self)
    }
}

/// 自定义构建器（链式 API）
#[derive(Debug, Clone, Default)]
pub struct CustomConfigBuilder {
    config: RulesConfig,
}

impl CustomConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bypass_version_lock(mut self, bypass: bool) -> Self {
        self.config.bypass_version_lock = bypass;
        self
    }

    pub fn current_package_version(mut self, version: StackVersion) -> Self {
        self.config.current_package_version = version;
        self
    }

    pub fn min_supported_stack_version(mut self, version: StackVersion) -> Self {
        self.config.min_supported_stack_version = version;
        self
    }

    pub fn bypass_bbr_timing(mut self, bypass: bool) -> Self {
        self.config.bypass_bbr_timing = bypass;
        self
    }

    pub fn bypass_note_validation(mut self, bypass: bool) -> Self {
        self.config.bypass_note_validation = bypass;
        self
    }

    pub fn skip_validation_for(mut self, rule_id: impl Into<String>) -> Self {
        self.config.skip_validation_rule_ids.insert(rule_id.into());
        self
    }

    pub fn normalize_kql_keywords(mut self, normalize: bool) -> Self {
        self.config.normalize_kql_keywords = normalize;
        self
    }

    pub fn build(self) -> RuleResult<RulesConfig> {
        self.config.validate()
    }
}
