//! note（调查指南）的标题扫描：Setup 段落抽取与标题约束检查
//! 只识别 ATX 标题（`#` 开头），忽略围栏代码块中的内容

/// note 中的一个标题
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoteHeading {
    pub level: usize,
    pub text: String,
    /// 标题所在行（0 起始）
    pub line: usize,
}

/// 扫描 note 中的全部标题
pub fn headings(note: &str) -> Vec<NoteHeading> {
    let mut in_fence = false;
    let mut found = Vec::new();

    for (line_no, line) in note.lines().enumerate() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        if let Some(heading) = parse_heading(trimmed, line_no) {
            found.push(heading);
        }
    }
    found
}

fn parse_heading(line: &str, line_no: usize) -> Option<NoteHeading> {
    let level = line.bytes().take_while(|b| *b == b'#').count();
    if level == 0 || level > 6 {
        return None;
    }
    let rest = &line[level..];
    if !rest.is_empty() && !rest.starts_with([' ', '\t']) {
        return None;
    }
    Some(NoteHeading {
        level,
        text: rest.trim().trim_end_matches('#').trim().to_string(),
        line: line_no,
    })
}

/// note 是否包含 Setup 标题
pub fn setup_in_note(note: &str) -> bool {
    headings(note).iter().any(|h| h.text.eq_ignore_ascii_case("setup"))
}

/// 标题约束检查，返回全部违规描述
pub fn validate_note(note: &str, setup_field: Option<&str>) -> Vec<String> {
    let mut errors = Vec::new();
    let mut has_setup = false;

    for heading in headings(note) {
        if heading.text.eq_ignore_ascii_case("setup") {
            has_setup = true;
            if heading.level != 2 {
                errors.push(format!("Setup section with wrong header level: {}", heading.level));
            }
            if heading.text != "Setup" {
                errors.push(format!("Setup header has improper casing: {}", heading.text));
            }
        } else if heading.level == 2 && heading.text.to_lowercase().contains("config") {
            errors.push(format!("Setup header contains Config: {}", heading.text));
        }
    }

    let setup_field_set = setup_field.map_or(false, |setup| !setup.trim().is_empty() && setup != "None");
    if has_setup && setup_field_set {
        errors.push("Setup header found in both note and setup fields.".to_string());
    }
    errors
}

/// 从 note 中抽出 `## Setup` 段落，返回 (剩余 note, setup 内容)
/// 段落止于下一个二级及以下标题
pub fn extract_setup(note: &str) -> Option<(String, String)> {
    let all = headings(note);
    let start = all
        .iter()
        .position(|h| h.level == 2 && h.text.contains("Setup"))?;
    let heading_line = all[start].line;
    let end_line = all[start + 1..]
        .iter()
        .find(|h| h.level >= 2)
        .map(|h| h.line);

    let lines: Vec<&str> = note.lines().collect();
    let end = end_line.unwrap_or(lines.len());
    let setup = lines[heading_line + 1..end].join("\n").trim().to_string();
    if setup.is_empty() {
        return None;
    }

    let remaining: Vec<&str> = lines[..heading_line]
        .iter()
        .chain(lines[end..].iter())
        .copied()
        .collect();
    Some((remaining.join("\n").trim().to_string(), setup))
}
