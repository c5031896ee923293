//! 规则内容规范化：排序、空白规整、空值剔除、已知 null 保留
mod hash;
mod normalize;

pub use hash::{dict_hash, to_lock_json, LockJsonFormatter};
pub use normalize::{get_nested, is_semantically_empty, nested_normalize, normalize_whitespace, set_nested};

use serde_json::Value;

/// 已知 null 条目：列表字段中每个对象元素的子路径必须显式输出为 null
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownNull {
    /// 列表字段路径（点分）
    pub list_path: &'static str,
    /// 列表元素内的子路径（点分）
    pub sub_key: &'static str,
}

/// 外部平台区分“缺失”与“显式 null”的字段
pub const KNOWN_NULL_ENTRIES: &[KnownNull] = &[KnownNull {
    list_path: "actions",
    sub_key: "frequency.throttle",
}];

/// 规范化器
/// 输出键升序（serde_json::Map 基于 BTreeMap）、字符串空白规整、空值剔除
#[derive(Debug, Clone)]
pub struct Canonicalizer {
    known_nulls: Vec<KnownNull>,
}

impl Default for Canonicalizer {
    fn default() -> Self {
        Self {
            known_nulls: KNOWN_NULL_ENTRIES.to_vec(),
        }
    }
}

impl Canonicalizer {
    pub fn new(known_nulls: Vec<KnownNull>) -> Self {
        Self { known_nulls }
    }

    /// 生成确定性的规范表示（纯函数）
    pub fn canonicalize(&self, value: &Value) -> Value {
        let mut normalized = nested_normalize(value);
        self.add_known_nulls(&mut normalized);
        normalized
    }

    fn add_known_nulls(&self, value: &mut Value) {
        for entry in &self.known_nulls {
            let Some(Value::Array(items)) = value.pointer_mut(&to_pointer(entry.list_path)) else {
                continue;
            };
            for item in items.iter_mut().filter(|item| item.is_object()) {
                if get_nested(item, entry.sub_key).map_or(true, Value::is_null) {
                    set_nested(item, entry.sub_key, Value::Null);
                }
            }
        }
    }
}

fn to_pointer(dotted: &str) -> String {
    dotted.split('.').fold(String::new(), |mut acc, segment| {
        acc.push('/');
        acc.push_str(segment);
        acc
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonicalize_keeps_known_null() {
        let raw = json!({
            "name": "  r  ",
            "actions": [
                {"id": "a", "frequency": {"throttle": null, "summary": true}},
                {"id": "b"}
            ],
            "references": []
        });
        let canonical = Canonicalizer::default().canonicalize(&raw);
        assert_eq!(
            canonical,
            json!({
                "name": "  r",
                "actions": [
                    {"id": "a", "frequency": {"summary": true, "throttle": null}},
                    {"id": "b", "frequency": {"throttle": null}}
                ]
            })
        );
    }

    #[test]
    fn test_canonicalize_is_order_independent() {
        let a: Value = serde_json::from_str(r#"{"b": 1, "a": {"d": [1], "c": "x"}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a": {"c": "x", "d": [1]}, "b": 1}"#).unwrap();
        let canon = Canonicalizer::default();
        assert_eq!(
            to_lock_json(&canon.canonicalize(&a)).unwrap(),
            to_lock_json(&canon.canonicalize(&b)).unwrap()
        );
    }
}
