//! 版本锁存储
//! 规则 ID → 当前版本 / 内容哈希 / 最低平台版本 / 历史分叉区间
//! 同一规则 ID 的“读 → 判脏 → 升版本 → 写回”在 DashMap 分片锁内串行执行

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use super::entry::{LockState, PreviousLockEntry, VersionLockEntry};
use crate::core::StackVersion;
use crate::error::{CoreError, CoreResult};

/// 分叉时为旧分支预留的版本空间
pub const FORK_VERSION_BUFFER: u32 = 100;

/// 一次编译产出的锁更新请求
#[derive(Debug, Clone)]
pub struct LockUpdate {
    pub rule_name: Option<String>,
    pub rule_type: Option<String>,
    /// 当前规范哈希
    pub sha256: String,
    /// 兼容旧哈希约定的备选哈希，命中任一即视为未变更
    pub alternate_sha256: Option<String>,
    /// 规则生效的最低平台版本
    pub min_stack: StackVersion,
    /// 新规则首次加锁时采用的版本（不低于 1）
    pub proposed_version: Option<u32>,
}

impl LockUpdate {
    pub fn new(sha256: impl Into<String>, min_stack: StackVersion) -> Self {
        Self {
            rule_name: None,
            rule_type: None,
            sha256: sha256.into(),
            alternate_sha256: None,
            min_stack,
            proposed_version: None,
        }
    }

    pub fn with_alternate(mut self, sha256: impl Into<String>) -> Self {
        self.alternate_sha256 = Some(sha256.into());
        self
    }

    pub fn with_proposed_version(mut self, version: u32) -> Self {
        self.proposed_version = Some(version);
        self
    }

    pub fn with_identity(mut self, rule_name: impl Into<String>, rule_type: impl Into<String>) -> Self {
        self.rule_name = Some(rule_name.into());
        self.rule_type = Some(rule_type.into());
        self
    }

    fn matches(&self, locked: &str) -> bool {
        self.sha256 == locked || self.alternate_sha256.as_deref() == Some(locked)
    }
}

/// 锁更新走过的路径
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockRoute {
    /// 新规则，首次加锁
    Created,
    /// 内容未变更
    Unchanged,
    /// 内容变更，版本 +1
    Bumped,
    /// 最低平台版本上调，旧区间转入 previous
    Forked,
    /// 在旧分支上更新 previous 区间
    PreviousUpdated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOutcome {
    pub route: LockRoute,
    pub version: u32,
}

/// 版本锁存储
#[derive(Debug, Default)]
pub struct VersionLockStore {
    entries: DashMap<String, VersionLockEntry>,
}

impl VersionLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: BTreeMap<String, VersionLockEntry>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    pub fn from_json(content: &str) -> CoreResult<Self> {
        let entries: BTreeMap<String, VersionLockEntry> = serde_json::from_str(content)?;
        Ok(Self::from_entries(entries))
    }

    /// 按规则 ID 升序导出
    pub fn to_entries(&self) -> BTreeMap<String, VersionLockEntry> {
        self.entries
            .iter()
            .map(|item| (item.key().clone(), item.value().clone()))
            .collect()
    }

    pub fn to_json(&self) -> CoreResult<String> {
        Ok(serde_json::to_string_pretty(&self.to_entries())?)
    }

    /// 从锁文件加载
    pub fn load(path: &Path) -> CoreResult<Self> {
        let content = fs::read_to_string(path)?;
        let store = Self::from_json(&content)?;
        log::info!("Version lock loaded from {} | entries: {}", path.display(), store.len());
        Ok(store)
    }

    /// 写回锁文件（键升序，末尾换行）
    pub fn save(&self, path: &Path) -> CoreResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut content = self.to_json()?;
        content.push('\n');
        fs::write(path, content)?;
        log::info!("Version lock saved to {} | entries: {}", path.display(), self.len());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, rule_id: &str) -> Option<VersionLockEntry> {
        self.entries.get(rule_id).map(|entry| entry.value().clone())
    }

    pub fn state(&self, rule_id: &str) -> LockState {
        LockState::of(self.entries.get(rule_id).as_deref())
    }

    /// 查询锁定版本：优先命中 previous[min_stack]，否则取当前条目
    pub fn get_locked_version(&self, rule_id: &str, min_stack: &StackVersion) -> Option<u32> {
        let entry = self.entries.get(rule_id)?;
        match find_previous(&entry, min_stack) {
            Some(previous) => Some(previous.version),
            None => Some(entry.version),
        }
    }

    /// 查询锁定哈希：优先命中 previous[min_stack]；当前条目仅在最低版本一致时返回
    pub fn get_locked_hash(&self, rule_id: &str, min_stack: &StackVersion) -> Option<String> {
        let entry = self.entries.get(rule_id)?;
        if let Some(previous) = find_previous(&entry, min_stack) {
            return Some(previous.sha256.clone()).filter(|sha| !sha.is_empty());
        }
        let locked_min = StackVersion::parse(&entry.min_stack_version).ok()?;
        (locked_min.truncated() == min_stack.truncated()).then(|| entry.sha256.clone())
    }

    pub fn has_forked(&self, rule_id: &str) -> bool {
        self.entries.get(rule_id).map_or(false, |entry| entry.has_forked())
    }

    /// 规则处于尚未发布的分叉窗口：当前发布版本低于锁定的最低版本
    pub fn is_in_forked_version(&self, rule_id: &str, current_package: &StackVersion) -> bool {
        let Some(entry) = self.entries.get(rule_id) else {
            return false;
        };
        if !entry.has_forked() {
            return false;
        }
        StackVersion::parse(&entry.min_stack_version)
            .map_or(false, |locked_min| current_package < &locked_min)
    }

    /// 分叉窗口内剩余可用的版本数量；非分叉状态返回 None（无上限）
    pub fn version_space(
        &self,
        rule_id: &str,
        rule_min_stack: &StackVersion,
        current_package: &StackVersion,
    ) -> Option<i64> {
        if !self.is_in_forked_version(rule_id, current_package) {
            return None;
        }
        let entry = self.entries.get(rule_id)?;
        let previous = find_previous(&entry, rule_min_stack)?;
        Some(i64::from(previous.max_allowable_version) - i64::from(previous.version) - 1)
    }

    /// 记录一次编译结果，执行状态迁移
    pub fn record(&self, rule_id: &str, update: LockUpdate) -> CoreResult<LockOutcome> {
        match self.entries.entry(rule_id.to_string()) {
            Entry::Vacant(vacant) => {
                let version = update.proposed_version.unwrap_or(1).max(1);
                let mut entry = VersionLockEntry::new(version, update.sha256.clone(), update.min_stack.major_minor());
                entry.rule_name = update.rule_name;
                entry.rule_type = update.rule_type;
                vacant.insert(entry);
                log::debug!("Rule {} locked at version {}", rule_id, version);
                Ok(LockOutcome {
                    route: LockRoute::Created,
                    version,
                })
            }
            Entry::Occupied(mut occupied) => transition(rule_id, occupied.get_mut(), update),
        }
    }

    /// 直接写入条目（迁移 / 测试用）
    pub fn insert(&self, rule_id: impl Into<String>, entry: VersionLockEntry) {
        self.entries.insert(rule_id.into(), entry);
    }
}

fn find_previous<'a>(entry: &'a VersionLockEntry, min_stack: &StackVersion) -> Option<&'a PreviousLockEntry> {
    entry.previous.as_ref()?.iter().find_map(|(raw, previous)| {
        StackVersion::parse(raw)
            .ok()
            .filter(|version| version.truncated() == min_stack.truncated())
            .map(|_| previous)
    })
}

fn transition(rule_id: &str, entry: &mut VersionLockEntry, update: LockUpdate) -> CoreResult<LockOutcome> {
    let locked_min = StackVersion::parse(&entry.min_stack_version)?.truncated();
    let rule_min = update.min_stack.truncated();

    match rule_min.cmp(&locked_min) {
        Ordering::Equal => {
            if let Some(name) = &update.rule_name {
                entry.rule_name = Some(name.clone());
            }
            if let Some(rule_type) = &update.rule_type {
                entry.rule_type = Some(rule_type.clone());
            }
            if update.matches(&entry.sha256) {
                return Ok(LockOutcome {
                    route: LockRoute::Unchanged,
                    version: entry.version,
                });
            }
            entry.version += 1;
            entry.sha256 = update.sha256;
            log::debug!("Rule {} bumped to version {}", rule_id, entry.version);
            Ok(LockOutcome {
                route: LockRoute::Bumped,
                version: entry.version,
            })
        }
        Ordering::Greater => {
            let new_version = entry.version + FORK_VERSION_BUFFER;
            let preserved = PreviousLockEntry {
                rule_name: entry.rule_name.clone(),
                rule_type: entry.rule_type.clone(),
                version: entry.version,
                sha256: entry.sha256.clone(),
                max_allowable_version: new_version - 1,
            };
            entry
                .previous
                .get_or_insert_with(BTreeMap::new)
                .insert(locked_min.major_minor(), preserved);

            log::info!(
                "Rule {} forked: {} (v{}) -> {} (v{})",
                rule_id,
                locked_min.major_minor(),
                entry.version,
                rule_min.major_minor(),
                new_version
            );

            entry.version = new_version;
            entry.sha256 = update.sha256;
            entry.min_stack_version = rule_min.major_minor();
            if update.rule_name.is_some() {
                entry.rule_name = update.rule_name;
            }
            if update.rule_type.is_some() {
                entry.rule_type = update.rule_type;
            }
            Ok(LockOutcome {
                route: LockRoute::Forked,
                version: new_version,
            })
        }
        Ordering::Less => {
            let key = rule_min.major_minor();
            let previous = entry
                .previous
                .as_mut()
                .and_then(|previous| {
                    previous
                        .iter_mut()
                        .find(|(raw, _)| {
                            StackVersion::parse(raw).map_or(false, |v| v.truncated() == rule_min)
                        })
                        .map(|(_, item)| item)
                })
                .ok_or_else(|| CoreError::LockEntry {
                    rule_id: rule_id.to_string(),
                    message: format!(
                        "no previous lock for stack {} (locked at {})",
                        key, entry.min_stack_version
                    ),
                })?;

            if update.matches(&previous.sha256) {
                return Ok(LockOutcome {
                    route: LockRoute::Unchanged,
                    version: previous.version,
                });
            }

            let bumped = previous.version + 1;
            if bumped > previous.max_allowable_version {
                return Err(CoreError::VersionSpaceExhausted {
                    rule_id: rule_id.to_string(),
                    min_stack: key,
                    version: bumped,
                    max_allowable: previous.max_allowable_version,
                });
            }
            previous.version = bumped;
            previous.sha256 = update.sha256;
            log::debug!("Rule {} bumped to version {} on stack {}", rule_id, bumped, key);
            Ok(LockOutcome {
                route: LockRoute::PreviousUpdated,
                version: bumped,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn v(raw: &str) -> StackVersion {
        StackVersion::parse(raw).unwrap()
    }

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn test_new_rule_then_bumps_monotonically() {
        init_logging();
        let store = VersionLockStore::new();
        let first = store.record("r1", LockUpdate::new("h1", v("8.3"))).unwrap();
        assert_eq!(first, LockOutcome { route: LockRoute::Created, version: 1 });
        let seeded = store
            .record("r2", LockUpdate::new("h1", v("8.3")).with_proposed_version(0))
            .unwrap();
        assert_eq!(seeded.version, 1);

        for (idx, hash) in ["h2", "h3", "h4"].iter().enumerate() {
            let outcome = store.record("r1", LockUpdate::new(*hash, v("8.3"))).unwrap();
            assert_eq!(outcome.route, LockRoute::Bumped);
            assert_eq!(outcome.version, idx as u32 + 2);
        }
    }

    #[test]
    fn test_unchanged_hash_keeps_version() {
        let store = VersionLockStore::new();
        store.record("r1", LockUpdate::new("h1", v("8.3"))).unwrap();
        let again = store.record("r1", LockUpdate::new("h1", v("8.3.4"))).unwrap();
        assert_eq!(again, LockOutcome { route: LockRoute::Unchanged, version: 1 });

        // 备选哈希命中同样视为未变更
        let alt = store
            .record("r1", LockUpdate::new("h-new-convention", v("8.3")).with_alternate("h1"))
            .unwrap();
        assert_eq!(alt.route, LockRoute::Unchanged);
        assert_eq!(store.get("r1").unwrap().sha256, "h1");
    }

    #[test]
    fn test_fork_preserves_previous_range() {
        init_logging();
        let store = VersionLockStore::new();
        store.insert("r1", VersionLockEntry::new(3, "old", "8.3"));

        let outcome = store.record("r1", LockUpdate::new("new", v("8.12"))).unwrap();
        assert_eq!(outcome, LockOutcome { route: LockRoute::Forked, version: 103 });

        let entry = store.get("r1").unwrap();
        assert_eq!(entry.min_stack_version, "8.12");
        let previous = &entry.previous.as_ref().unwrap()["8.3"];
        assert_eq!(previous.version, 3);
        assert_eq!(previous.max_allowable_version, 102);
        assert_eq!(store.state("r1"), LockState::Forked);

        assert_eq!(store.get_locked_version("r1", &v("8.3")), Some(3));
        assert_eq!(store.get_locked_version("r1", &v("8.12")), Some(103));
        assert_eq!(store.get_locked_hash("r1", &v("8.3")).as_deref(), Some("old"));
        assert_eq!(store.get_locked_hash("r1", &v("8.12")).as_deref(), Some("new"));
        assert_eq!(store.get_locked_hash("r1", &v("8.9")), None);
    }

    #[test]
    fn test_previous_branch_bumps_within_space() {
        let store = VersionLockStore::new();
        let mut entry = VersionLockEntry::new(110, "cur", "8.12");
        entry.previous = Some(BTreeMap::from([(
            "8.3".to_string(),
            PreviousLockEntry {
                rule_name: None,
                rule_type: None,
                version: 108,
                sha256: "prev".into(),
                max_allowable_version: 109,
            },
        )]));
        store.insert("r1", entry);

        let outcome = store.record("r1", LockUpdate::new("prev-2", v("8.3"))).unwrap();
        assert_eq!(outcome, LockOutcome { route: LockRoute::PreviousUpdated, version: 109 });

        let err = store.record("r1", LockUpdate::new("prev-3", v("8.3"))).unwrap_err();
        assert!(matches!(err, CoreError::VersionSpaceExhausted { version: 110, max_allowable: 109, .. }));

        let missing = store.record("r1", LockUpdate::new("x", v("8.1"))).unwrap_err();
        assert!(matches!(missing, CoreError::LockEntry { .. }));
    }

    #[test]
    fn test_version_space_only_in_forked_window() {
        let store = VersionLockStore::new();
        store.insert("r1", VersionLockEntry::new(3, "old", "8.3"));
        assert_eq!(store.version_space("r1", &v("8.3"), &v("8.10")), None);

        store.record("r1", LockUpdate::new("new", v("8.12"))).unwrap();
        // 当前发布 8.10 < 锁定 8.12：处于分叉窗口
        assert!(store.is_in_forked_version("r1", &v("8.10")));
        assert_eq!(store.version_space("r1", &v("8.3"), &v("8.10")), Some(102 - 3 - 1));
        // 8.12 已发布：不再是分叉窗口
        assert_eq!(store.version_space("r1", &v("8.3"), &v("8.12")), None);
    }

    #[test]
    fn test_json_roundtrip_sorted() {
        let store = VersionLockStore::new();
        store.record("b", LockUpdate::new("h", v("8.3")).with_identity("B", "query")).unwrap();
        store.record("a", LockUpdate::new("h", v("8.3"))).unwrap();
        let json = store.to_json().unwrap();
        assert!(json.find("\"a\"").unwrap() < json.find("\"b\"").unwrap());

        let reloaded = VersionLockStore::from_json(&json).unwrap();
        assert_eq!(reloaded.to_entries(), store.to_entries());
        assert_eq!(reloaded.get("b").unwrap().rule_type.as_deref(), Some("query"));
    }

    #[test]
    fn test_concurrent_same_rule_serializes() {
        let store = Arc::new(VersionLockStore::new());
        store.insert("shared", VersionLockEntry::new(1, "h0", "8.3"));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    store
                        .record("shared", LockUpdate::new(format!("h{}", i + 1), v("8.3")))
                        .unwrap()
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.get("shared").unwrap().version, 9);
    }
}
