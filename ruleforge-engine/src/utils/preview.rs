use std::collections::BTreeSet;
use std::fmt::{self, Write};

// ======================== 日志预览 ========================
/// 空白字符折叠 + 截断，用于在日志中预览查询语句
/// 连续空白折叠为单个空格，达到最大长度时追加省略号并停止
#[inline(always)]
pub fn preview_compact<'a>(s: &'a str, max_len: usize) -> impl fmt::Display + 'a {
    struct CompactView<'a> {
        source: &'a str,
        max_length: usize,
    }

    impl<'a> fmt::Display for CompactView<'a> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let mut char_count = 0;
            let mut last_was_whitespace = false;

            for ch in self.source.trim().chars() {
                if char_count >= self.max_length {
                    f.write_str("…")?;
                    break;
                }

                if ch.is_whitespace() {
                    if !last_was_whitespace {
                        f.write_char(' ')?;
                        char_count += 1;
                        last_was_whitespace = true;
                    }
                } else {
                    f.write_char(ch)?;
                    char_count += 1;
                    last_was_whitespace = false;
                }
            }
            Ok(())
        }
    }

    CompactView {
        source: s,
        max_length: max_len,
    }
}

/// 字段集合日志格式化：[a, b, ...] (total: N)
pub fn compress_field_set(fields: &BTreeSet<String>, max_count: usize) -> String {
    if fields.is_empty() {
        return "[empty]".to_string();
    }

    let mut result = String::from("[");
    for (idx, field) in fields.iter().take(max_count).enumerate() {
        if idx > 0 {
            result.push_str(", ");
        }
        let _ = write!(result, "{}", preview_compact(field, 40));
    }
    if fields.len() > max_count {
        let _ = write!(result, ", … (total: {})", fields.len());
    }
    result.push(']');
    result
}
