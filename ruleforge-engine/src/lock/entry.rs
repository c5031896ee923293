use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 分叉前保留的历史版本区间
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviousLockEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_name: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub rule_type: Option<String>,
    pub version: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sha256: String,
    /// 旧分支可用的最大版本号（新分支已占用其后的版本）
    pub max_allowable_version: u32,
}

/// 单条规则的版本锁记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionLockEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_name: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub rule_type: Option<String>,
    pub version: u32,
    pub sha256: String,
    /// 当前分支的最低平台版本（major.minor）
    pub min_stack_version: String,
    /// 历史最低版本 → 历史区间
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<BTreeMap<String, PreviousLockEntry>>,
}

impl VersionLockEntry {
    pub fn new(version: u32, sha256: impl Into<String>, min_stack_version: impl Into<String>) -> Self {
        Self {
            rule_name: None,
            rule_type: None,
            version,
            sha256: sha256.into(),
            min_stack_version: min_stack_version.into(),
            previous: None,
        }
    }

    pub fn has_forked(&self) -> bool {
        self.previous.as_ref().map_or(false, |previous| !previous.is_empty())
    }
}

/// 版本锁状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    Locked,
    Forked,
}

impl LockState {
    pub fn of(entry: Option<&VersionLockEntry>) -> Self {
        match entry {
            None => LockState::Unlocked,
            Some(e) if e.has_forked() => LockState::Forked,
            Some(_) => LockState::Locked,
        }
    }
}
