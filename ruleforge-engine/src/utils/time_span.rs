//! 相对时间小语言：`5m` / `now-119m` / `now+1h` → 毫秒

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{CoreError, CoreResult};

static TIME_SPAN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)\s*(ms|s|m|h|d|w|M|y)$").expect("time span pattern is valid"));

const MS_PER_SECOND: i64 = 1_000;
const MS_PER_MINUTE: i64 = 60 * MS_PER_SECOND;
const MS_PER_HOUR: i64 = 60 * MS_PER_MINUTE;
const MS_PER_DAY: i64 = 24 * MS_PER_HOUR;
const MS_PER_WEEK: i64 = 7 * MS_PER_DAY;
// 月 / 年按固定天数折算
const MS_PER_MONTH: i64 = 30 * MS_PER_DAY;
const MS_PER_YEAR: i64 = 365 * MS_PER_DAY;

/// 时间跨度转毫秒，例如 `60m` → 3600000
pub fn convert_time_span(span: &str) -> CoreResult<i64> {
    let trimmed = span.trim();
    let caps = TIME_SPAN
        .captures(trimmed)
        .ok_or_else(|| CoreError::InvalidTimeSpan(span.to_string()))?;

    let amount: i64 = caps[1]
        .parse()
        .map_err(|_| CoreError::InvalidTimeSpan(span.to_string()))?;
    let unit = match &caps[2] {
        "ms" => 1,
        "s" => MS_PER_SECOND,
        "m" => MS_PER_MINUTE,
        "h" => MS_PER_HOUR,
        "d" => MS_PER_DAY,
        "w" => MS_PER_WEEK,
        "M" => MS_PER_MONTH,
        _ => MS_PER_YEAR,
    };

    amount
        .checked_mul(unit)
        .ok_or_else(|| CoreError::InvalidTimeSpan(span.to_string()))
}

/// `now-<N><unit>` 形式的回看窗口，返回正的毫秒数
pub fn parse_lookback(raw: &str) -> CoreResult<i64> {
    let span = raw
        .trim()
        .strip_prefix("now-")
        .ok_or_else(|| CoreError::InvalidTimeSpan(raw.to_string()))?;
    convert_time_span(span)
}

/// 带符号的相对时间：`now-5m` → -300000，`now+5m` → 300000，`now` → 0，裸跨度按正值处理
pub fn convert_relative_delta(raw: &str) -> CoreResult<i64> {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("now") else {
        return convert_time_span(trimmed);
    };
    if rest.is_empty() {
        return Ok(0);
    }

    let mut chars = rest.chars();
    let sign = chars.next();
    let amount = convert_time_span(chars.as_str())?;
    match sign {
        Some('-') => Ok(-amount),
        Some('+') => Ok(amount),
        _ => Err(CoreError::InvalidTimeSpan(raw.to_string())),
    }
}
