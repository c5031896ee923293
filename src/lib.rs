//! ruleforge - 检测规则内容兼容性与版本管理引擎

// 导出全局错误类型
pub use self::error::{Dialect, RuleError, RuleResult, SourcePosition, ValidationReport};

// 导出配置模块
pub use self::config::{CustomConfigBuilder, RulesConfig};

// 导出规则模块核心接口
pub use self::rule::{
    CompileContext, IntegrationManifest, LockInfo, RuleContents, RuleMeta, RulePayload, RuleTransform,
    StaticManifest,
};

// 导出查询校验接口
pub use self::query::{validator_for, QueryAst, QueryContext, QueryKind, QueryValidator};

// 导出校验流水线
pub use self::validation::{validate_rule, ValidationPipeline, ValidationStep};

// 导出批量编译接口
pub use self::batch::{
    compile_batch, compile_rule, compile_rule_with, BatchCompiler, BatchReport, CompiledRule, ErrorPolicy,
};

// 内核常用类型
pub use ruleforge_engine::{
    FieldTypeResolver, LockOutcome, LockRoute, QueryLanguage, RuleType, SchemaCatalog, StackSchemaMap, StackVersion,
    VersionLockStore, VersionStrategy,
};

// 声明所有子模块
pub mod config;
pub mod error;
pub mod rule;
pub mod query;
pub mod validation;
pub mod batch;
