//! 全局错误类型定义
//! 单条规则的错误只影响该规则；配置错误意味着本次运行本身有误，立即终止整批编译
use thiserror::Error;

use ruleforge_engine::CoreError;
use serde_json::Error as SerdeJsonError;

/// 查询方言
pub type Dialect = ruleforge_engine::QueryLanguage;

#[derive(Error, Debug)]
pub enum RuleError {
    // 规则结构错误
    #[error("规则结构错误：rule {rule_id} field `{path}`: {message}")]
    Schema {
        rule_id: String,
        path: String,
        message: String,
    },

    // 查询语法错误
    #[error("查询语法错误：[{dialect}] {message}{position}")]
    Syntax {
        dialect: Dialect,
        message: String,
        position: SourcePosition,
    },

    // 方言约束或跨字段约束不满足
    #[error("规则校验失败：rule {rule_id}: {message}")]
    StructuralValidation { rule_id: String, message: String },

    // building block 时间窗口校验失败
    #[error("时间窗口校验失败：rule {rule_id}: {message}")]
    TimingValidation { rule_id: String, message: String },

    // 运行配置错误（版本锁旁路时访问版本锁等）
    #[error("配置错误：{0}")]
    Configuration(String),

    // 内核错误
    #[error("内核错误：{0}")]
    Core(CoreError),

    #[error("JSON解析失败：{0}")]
    Json(#[from] SerdeJsonError),
}

impl From<CoreError> for RuleError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::LockBypassed(message) => RuleError::Configuration(message),
            other => RuleError::Core(other),
        }
    }
}

impl RuleError {
    /// 是否需要终止整批编译
    pub fn is_fatal_for_batch(&self) -> bool {
        matches!(self, RuleError::Configuration(_))
    }

    pub fn schema(rule_id: impl Into<String>, path: impl Into<String>, message: impl Into<String>) -> Self {
        RuleError::Schema {
            rule_id: rule_id.into(),
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn structural(rule_id: impl Into<String>, message: impl Into<String>) -> Self {
        RuleError::StructuralValidation {
            rule_id: rule_id.into(),
            message: message.into(),
        }
    }

    pub fn timing(rule_id: impl Into<String>, message: impl Into<String>) -> Self {
        RuleError::TimingValidation {
            rule_id: rule_id.into(),
            message: message.into(),
        }
    }
}

/// 查询文本中的位置（1 起始），未知时不输出
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourcePosition {
    pub line: Option<usize>,
    pub column: Option<usize>,
}

impl SourcePosition {
    pub fn at(line: usize, column: usize) -> Self {
        Self {
            line: Some(line),
            column: Some(column),
        }
    }
}

impl std::fmt::Display for SourcePosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.line, self.column) {
            (Some(line), Some(column)) => write!(f, " (line {}, column {})", line, column),
            (Some(line), None) => write!(f, " (line {})", line),
            _ => Ok(()),
        }
    }
}

// 全局Result类型
pub type RuleResult<T> = Result<T, RuleError>;

/// 单条规则的全部校验错误
#[derive(Error, Debug)]
#[error("rule {rule_id} failed validation with {} error(s)", .errors.len())]
pub struct ValidationReport {
    pub rule_id: String,
    pub errors: Vec<RuleError>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_bypass_maps_to_configuration() {
        let err: RuleError = CoreError::LockBypassed("bypassed".into()).into();
        assert!(err.is_fatal_for_batch());

        let err: RuleError = CoreError::InvalidTimeSpan("x".into()).into();
        assert!(!err.is_fatal_for_batch());
    }

    #[test]
    fn test_syntax_message_carries_position() {
        let err = RuleError::Syntax {
            dialect: Dialect::Eql,
            message: "unexpected token".into(),
            position: SourcePosition::at(1, 7),
        };
        assert_eq!(err.to_string(), "查询语法错误：[eql] unexpected token (line 1, column 7)");
    }
}
