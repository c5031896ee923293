//! 受限字段表：字段名 → 平台版本区间
//! 用于编译期前向门控（派生字段是否输出）与降级投影（剔除目标版本不支持的字段）

use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use super::enums::RuleType;
use super::version::StackVersion;
use crate::error::{CoreError, CoreResult};

/// 字段允许出现的平台版本区间，max 缺省表示无上限
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRange {
    pub min: StackVersion,
    pub max: Option<StackVersion>,
}

impl VersionRange {
    /// 仅有下限的区间
    pub const fn from_min(min: StackVersion) -> Self {
        Self { min, max: None }
    }

    /// 有上下限的区间，要求 max >= min
    pub fn new(min: StackVersion, max: Option<StackVersion>) -> CoreResult<Self> {
        if let Some(max_version) = &max {
            if max_version < &min {
                return Err(CoreError::InvalidInput(format!(
                    "restricted field max version {} is lower than min version {}",
                    max_version, min
                )));
            }
        }
        Ok(Self { min, max })
    }

    pub fn contains(&self, target: &StackVersion) -> bool {
        &self.min <= target && self.max.as_ref().map_or(true, |max| target <= max)
    }
}

/// 与规则最低版本不兼容的字段
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncompatibleField {
    pub min_stack_version: StackVersion,
    pub min_allowed_version: StackVersion,
}

/// 受限字段表
#[derive(Debug, Clone, Default)]
pub struct RestrictedFieldTable {
    fields: FxHashMap<String, VersionRange>,
}

impl RestrictedFieldTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 链式登记字段
    pub fn with(mut self, name: &str, range: VersionRange) -> Self {
        self.fields.insert(name.to_string(), range);
        self
    }

    pub fn insert(&mut self, name: &str, range: VersionRange) {
        self.fields.insert(name.to_string(), range);
    }

    pub fn get(&self, name: &str) -> Option<&VersionRange> {
        self.fields.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// 字段名升序迭代
    pub fn iter(&self) -> impl Iterator<Item = (&str, &VersionRange)> {
        let mut entries: Vec<_> = self.fields.iter().map(|(k, v)| (k.as_str(), v)).collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries.into_iter()
    }

    /// 字段在目标版本是否允许出现；未登记字段始终允许
    pub fn is_field_allowed(&self, name: &str, target: &StackVersion) -> bool {
        self.fields.get(name).map_or(true, |range| range.contains(target))
    }

    /// 合并另一张表，同名字段以 other 为准
    pub fn merged(&self, other: &RestrictedFieldTable) -> RestrictedFieldTable {
        let mut fields = self.fields.clone();
        for (name, range) in &other.fields {
            fields.insert(name.clone(), range.clone());
        }
        RestrictedFieldTable { fields }
    }

    /// 降级投影：仅保留目标版本允许的顶层字段，保留字段的值原样不动
    pub fn project(&self, obj: &Map<String, Value>, target: &StackVersion) -> Map<String, Value> {
        obj.iter()
            .filter(|(name, _)| self.is_field_allowed(name, target))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }

    /// 检查规则已设置的受限字段是否高于规则声明的最低版本
    pub fn check_compatibility<'a, I>(&self, present: I, min_stack: &StackVersion) -> BTreeMap<String, IncompatibleField>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut invalid = BTreeMap::new();
        for name in present {
            if let Some(range) = self.fields.get(name) {
                if min_stack < &range.min {
                    invalid.insert(
                        name.to_string(),
                        IncompatibleField {
                            min_stack_version: min_stack.clone(),
                            min_allowed_version: range.min.clone(),
                        },
                    );
                }
            }
        }
        invalid
    }
}

// ===================== 内置字段表 =====================

const V8_0: StackVersion = StackVersion::new(8, 0, 0);
const V8_3: StackVersion = StackVersion::new(8, 3, 0);
const V8_8: StackVersion = StackVersion::new(8, 8, 0);
const V8_11: StackVersion = StackVersion::new(8, 11, 0);

/// 编译期派生字段的版本门槛
pub static BUILD_FIELD_VERSIONS: Lazy<RestrictedFieldTable> = Lazy::new(|| {
    RestrictedFieldTable::new()
        .with("related_integrations", VersionRange::from_min(V8_3))
        .with("required_fields", VersionRange::from_min(V8_3))
        .with("setup", VersionRange::from_min(V8_3))
});

static RULE_TYPE_FIELDS: Lazy<FxHashMap<RuleType, RestrictedFieldTable>> = Lazy::new(|| {
    let base = RestrictedFieldTable::new()
        .with("investigation_fields", VersionRange::from_min(V8_11))
        .with("related_integrations", VersionRange::from_min(V8_3))
        .with("required_fields", VersionRange::from_min(V8_3))
        .with("revision", VersionRange::from_min(V8_8))
        .with("setup", VersionRange::from_min(V8_3));

    let suppression = |minor: u64| VersionRange::from_min(StackVersion::new(8, minor, 0));

    let mut tables = FxHashMap::default();
    tables.insert(RuleType::Query, base.clone().with("alert_suppression", suppression(8)));
    tables.insert(RuleType::Threshold, base.clone().with("alert_suppression", suppression(12)));
    tables.insert(RuleType::ThreatMatch, base.clone().with("alert_suppression", suppression(13)));
    tables.insert(RuleType::NewTerms, base.clone().with("alert_suppression", suppression(14)));
    tables.insert(RuleType::Esql, base.clone().with("alert_suppression", suppression(15)));
    tables.insert(
        RuleType::MachineLearning,
        base.clone().with("alert_suppression", suppression(15)),
    );
    tables.insert(
        RuleType::Eql,
        base.with("alert_suppression", suppression(14))
            .with("timestamp_field", VersionRange::from_min(V8_0))
            .with("event_category_override", VersionRange::from_min(V8_0))
            .with("tiebreaker_field", VersionRange::from_min(V8_0)),
    );
    tables
});

static EMPTY_TABLE: Lazy<RestrictedFieldTable> = Lazy::new(RestrictedFieldTable::new);

/// 按规则类型获取字段表
pub fn restricted_fields_for(rule_type: RuleType) -> &'static RestrictedFieldTable {
    RULE_TYPE_FIELDS.get(&rule_type).unwrap_or(&EMPTY_TABLE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn v(raw: &str) -> StackVersion {
        StackVersion::parse(raw).unwrap()
    }

    #[test]
    fn test_gating_bounds() {
        let table = RestrictedFieldTable::new()
            .with("a", VersionRange::from_min(v("8.3")))
            .with("b", VersionRange::new(v("8.3"), Some(v("8.9"))).unwrap());

        assert!(!table.is_field_allowed("a", &v("8.2.9")));
        assert!(table.is_field_allowed("a", &v("8.3")));
        assert!(table.is_field_allowed("a", &v("9.0")));

        assert!(table.is_field_allowed("b", &v("8.9")));
        assert!(!table.is_field_allowed("b", &v("8.9.1")));
        assert!(!table.is_field_allowed("b", &v("8.2")));
    }

    #[test]
    fn test_unlisted_field_always_allowed() {
        let table = RestrictedFieldTable::new();
        assert!(table.is_field_allowed("query", &v("7.0")));
    }

    #[test]
    fn test_range_rejects_inverted_bounds() {
        assert!(VersionRange::new(v("8.5"), Some(v("8.4"))).is_err());
    }

    #[test]
    fn test_project_drops_only_newer_fields() {
        let table = restricted_fields_for(RuleType::Query);
        let obj = json!({
            "name": "x",
            "revision": 2,
            "setup": "s",
            "alert_suppression": {"group_by": ["host.name"]}
        });
        let projected = table.project(obj.as_object().unwrap(), &v("8.3"));
        assert_eq!(projected.get("name"), Some(&json!("x")));
        assert_eq!(projected.get("setup"), Some(&json!("s")));
        assert!(!projected.contains_key("revision"));
        assert!(!projected.contains_key("alert_suppression"));
    }

    #[test]
    fn test_check_compatibility() {
        let table = restricted_fields_for(RuleType::Eql);
        let invalid = table.check_compatibility(["alert_suppression", "query"], &v("8.10"));
        assert_eq!(invalid.len(), 1);
        assert_eq!(invalid["alert_suppression"].min_allowed_version, v("8.14"));
    }
}
