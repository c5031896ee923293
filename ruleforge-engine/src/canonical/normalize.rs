use serde_json::{Map, Value};

/// 字符串空白规整：逐行去除行尾空白，去掉首尾空行
pub fn normalize_whitespace(raw: &str) -> String {
    let lines: Vec<&str> = raw.lines().map(str::trim_end).collect();

    let first = lines.iter().position(|line| !line.is_empty());
    let last = lines.iter().rposition(|line| !line.is_empty());

    match (first, last) {
        (Some(start), Some(end)) => lines[start..=end].join("\n"),
        _ => String::new(),
    }
}

/// 语义为空：null / 空串 / 空数组 / 空对象
pub fn is_semantically_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// 递归规整：字符串空白规整 + 剔除语义为空的字段
/// 数组中的空元素同样剔除，剔除后为空的容器继续向上剔除
pub fn nested_normalize(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(normalize_whitespace(s)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(nested_normalize)
                .filter(|item| !is_semantically_empty(item))
                .collect(),
        ),
        Value::Object(map) => Value::Object(normalize_map(map)),
        other => other.clone(),
    }
}

fn normalize_map(map: &Map<String, Value>) -> Map<String, Value> {
    map.iter()
        .filter_map(|(key, value)| {
            let normalized = nested_normalize(value);
            (!is_semantically_empty(&normalized)).then(|| (key.clone(), normalized))
        })
        .collect()
}

/// 读取点分路径上的值
pub fn get_nested<'a>(value: &'a Value, dotted: &str) -> Option<&'a Value> {
    dotted
        .split('.')
        .try_fold(value, |current, segment| current.as_object()?.get(segment))
}

/// 写入点分路径，中间对象不存在时创建；中间节点不是对象时放弃写入
pub fn set_nested(value: &mut Value, dotted: &str, new_value: Value) -> bool {
    let mut segments = dotted.split('.').peekable();
    let mut current = value;

    while let Some(segment) = segments.next() {
        let Some(map) = current.as_object_mut() else {
            return false;
        };
        if segments.peek().is_none() {
            map.insert(segment.to_string(), new_value);
            return true;
        }
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_whitespace() {
        assert_eq!(normalize_whitespace("\n\n  line one   \nline two\t\n\n"), "  line one\nline two");
        assert_eq!(normalize_whitespace("   \n  \n"), "");
        assert_eq!(normalize_whitespace("a\n\n\nb"), "a\n\n\nb");
    }

    #[test]
    fn test_nested_normalize_strips_empty() {
        let raw = json!({
            "name": "rule  ",
            "tags": [],
            "note": "",
            "meta": {"a": null},
            "enabled": false,
            "risk_score": 0,
            "threat": [{"technique": []}, {"tactic": {"id": "TA0001"}}]
        });
        let normalized = nested_normalize(&raw);
        assert_eq!(
            normalized,
            json!({
                "name": "rule",
                "enabled": false,
                "risk_score": 0,
                "threat": [{"tactic": {"id": "TA0001"}}]
            })
        );
    }

    #[test]
    fn test_nested_path_helpers() {
        let mut value = json!({"frequency": {"summary": true}});
        assert_eq!(get_nested(&value, "frequency.summary"), Some(&json!(true)));
        assert!(get_nested(&value, "frequency.throttle").is_none());

        assert!(set_nested(&mut value, "frequency.throttle", Value::Null));
        assert_eq!(value, json!({"frequency": {"summary": true, "throttle": null}}));

        let mut scalar = json!({"frequency": 5});
        assert!(!set_nested(&mut scalar, "frequency.throttle", Value::Null));
    }
}
