//! note 插件渲染：`$osquery_N` / `$investigate_N` 占位符替换为 `!{plugin{...}}` 片段

use rustc_hash::FxHashMap;
use serde::Serialize;
use serde_json::Value;

use ruleforge_engine::nested_normalize;

use super::model::RuleTransform;
use crate::error::RuleResult;

impl RuleTransform {
    pub fn is_empty(&self) -> bool {
        self.osquery.as_ref().map_or(true, Vec::is_empty) && self.investigate.as_ref().map_or(true, Vec::is_empty)
    }

    /// 占位符 → 渲染后的插件片段
    pub fn rendered_plugins(&self) -> RuleResult<FxHashMap<String, String>> {
        let mut rendered = FxHashMap::default();
        for (index, entry) in self.osquery.iter().flatten().enumerate() {
            rendered.insert(format!("osquery_{}", index), render_plugin("osquery", entry)?);
        }
        for (index, entry) in self.investigate.iter().flatten().enumerate() {
            rendered.insert(format!("investigate_{}", index), render_plugin("investigate", entry)?);
        }
        Ok(rendered)
    }

    /// 在 note 中替换占位符；未知占位符原样保留
    pub fn apply_to_note(&self, note: &str) -> RuleResult<String> {
        let plugins = self.rendered_plugins()?;
        Ok(substitute(note, &plugins))
    }
}

fn render_plugin<T: Serialize>(name: &str, entry: &T) -> RuleResult<String> {
    let value = nested_normalize(&serde_json::to_value(entry)?);
    // Value 的对象键本身有序，紧凑输出即为 `{"a":1,"b":2}`
    Ok(format!("!{{{}{}}}", name, serde_json::to_string(&value)?))
}

/// `$name` / `${name}` 替换，`$$` 转义为 `$`
fn substitute(template: &str, values: &FxHashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        if let Some(stripped) = after.strip_prefix('$') {
            out.push('$');
            rest = stripped;
            continue;
        }

        let (name, consumed) = match after.strip_prefix('{') {
            Some(braced) => match braced.find('}') {
                Some(end) => (&braced[..end], end + 2),
                None => ("", 0),
            },
            None => {
                let end = after
                    .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                    .unwrap_or(after.len());
                (&after[..end], end)
            }
        };

        match values.get(name) {
            Some(rendered) if !name.is_empty() => {
                out.push_str(rendered);
                rest = &after[consumed..];
            }
            _ => {
                out.push('$');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// 编译产物中的 note 渲染（无插件时原样返回）
pub(crate) fn render_note(data: &mut Value, transform: Option<&RuleTransform>) -> RuleResult<()> {
    let Some(transform) = transform.filter(|t| !t.is_empty()) else {
        return Ok(());
    };
    let Some(Value::String(note)) = data.get("note") else {
        return Ok(());
    };
    let rendered = transform.apply_to_note(note)?;
    data["note"] = Value::String(rendered);
    Ok(())
}
