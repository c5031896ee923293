//! building block 规则的时间窗口校验：回看窗口 ≥ 119 分钟，执行间隔 ≥ 60 分钟

use ruleforge_engine::utils::{convert_time_span, parse_lookback};

use crate::config::ENV_BYPASS_BBR_LOOKBACK;
use crate::error::{RuleError, RuleResult};

pub const MIN_BBR_LOOKBACK_MS: i64 = 119 * 60 * 1000;
pub const MIN_BBR_INTERVAL_MS: i64 = 60 * 60 * 1000;

/// 校验 `from` / `interval`；格式错误同样是校验错误
pub fn validate_building_block(
    rule_id: &str,
    rule_name: &str,
    from: Option<&str>,
    interval: Option<&str>,
) -> RuleResult<()> {
    let (Some(from), Some(interval)) = (from, interval) else {
        return Err(RuleError::timing(
            rule_id,
            format!(
                "{} is invalid. BBR require `from` and `interval` to be defined. Please set or bypass. \
                 To bypass, use the environment variable `{}`",
                rule_name, ENV_BYPASS_BBR_LOOKBACK
            ),
        ));
    };

    // 缺少 `now-` 前缀视为窗口不足，而不是格式错误
    let lookback_ok = if from.trim().starts_with("now-") {
        parse_lookback(from).map_err(|e| RuleError::timing(rule_id, format!("Invalid time format: {}", e)))?
            >= MIN_BBR_LOOKBACK_MS
    } else {
        false
    };
    let interval_ok = convert_time_span(interval)
        .map_err(|e| RuleError::timing(rule_id, format!("Invalid time format: {}", e)))?
        >= MIN_BBR_INTERVAL_MS;

    if lookback_ok && interval_ok {
        return Ok(());
    }
    Err(RuleError::timing(
        rule_id,
        format!(
            "{} is invalid. Default BBR require `from` and `interval` to be at least now-119m and at least 60m \
             respectively (using the now-Xm and Xm format where x is in minutes). Please update values or bypass. \
             To bypass, use the environment variable `{}`",
            rule_name, ENV_BYPASS_BBR_LOOKBACK
        ),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(from: Option<&str>, interval: Option<&str>) -> RuleResult<()> {
        validate_building_block("bbr-1", "Building Block", from, interval)
    }

    #[test]
    fn test_floors() {
        assert!(matches!(
            check(Some("now-60m"), Some("30m")),
            Err(RuleError::TimingValidation { .. })
        ));
        assert!(check(Some("now-119m"), Some("60m")).is_ok());
        assert!(check(Some("now-2h"), Some("1h")).is_ok());
        assert!(check(Some("now-119m"), Some("59m")).is_err());
    }

    #[test]
    fn test_missing_and_malformed() {
        let err = check(None, Some("60m")).unwrap_err();
        assert!(err.to_string().contains("defined"));

        let err = check(Some("now-abc"), Some("60m")).unwrap_err();
        assert!(err.to_string().contains("Invalid time format"));

        // 非 now- 形式：窗口不足
        let err = check(Some("119m"), Some("60m")).unwrap_err();
        assert!(err.to_string().contains("at least now-119m"));
    }
}
