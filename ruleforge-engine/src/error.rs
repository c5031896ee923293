//! ruleforge-engine 内核错误定义
//! 封装内核层所有核心错误，与业务层错误解耦，基于thiserror实现类型安全处理
use thiserror::Error;

use semver::Error as SemverError;
use serde_json::Error as SerdeJsonError;
use std::io::Error as IoError;

/// 内核核心错误枚举
#[derive(Error, Debug)]
pub enum CoreError {
    // ===================== 版本相关错误 =====================
    /// 版本号无法解析（支持 major / major.minor / major.minor.patch）
    #[error("Invalid stack version `{0}`")]
    InvalidVersion(String),

    /// semver 底层解析错误
    #[error("Semver parse failed: {0}")]
    Semver(#[from] SemverError),

    // ===================== 版本锁相关错误 =====================
    /// 版本锁已被配置为旁路模式，不允许访问
    #[error("Version lock bypassed: {0}")]
    LockBypassed(String),

    /// 版本锁条目缺失或结构非法
    #[error("Version lock error for rule {rule_id}: {message}")]
    LockEntry { rule_id: String, message: String },

    /// 旧分支上的版本号已用完预留空间
    #[error(
        "Rule {rule_id} exhausted its version space on stack {min_stack}: \
         version {version} exceeds max allowable {max_allowable}"
    )]
    VersionSpaceExhausted {
        rule_id: String,
        min_stack: String,
        version: u32,
        max_allowable: u32,
    },

    // ===================== 时间/模式相关错误 =====================
    /// 相对时间字符串非法（now-5m / 60m 等）
    #[error("Invalid time span `{0}`")]
    InvalidTimeSpan(String),

    /// Schema 数据源缺失或结构非法
    #[error("Schema source error: {0}")]
    SchemaSource(String),

    // ===================== 内核基础错误 =====================
    /// JSON 序列化/反序列化失败
    #[error("JSON processing failed: {0}")]
    Json(#[from] SerdeJsonError),

    /// IO 操作失败（版本锁文件读写）
    #[error("IO operation failed: {0}")]
    Io(#[from] IoError),

    /// 无效输入参数
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// 内核层全局Result类型别名
pub type CoreResult<T> = Result<T, CoreError>;
