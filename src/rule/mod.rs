//! 规则模块：数据模型、编译上下文、版本编排、编译产物与降级
pub mod model;
pub mod note;
pub mod integrations;
mod transform;
mod contents;
mod context;
mod compile;

// 导出核心接口
pub use self::contents::{LockInfo, RuleContents};
pub use self::context::CompileContext;
pub use self::integrations::{IntegrationManifest, PackageManifest, StaticManifest};
pub use self::model::{
    BaseRuleData, EqlRuleData, EsqlRuleData, MachineLearningRuleData, NewTermsRuleData, QueryFields, QueryRuleData,
    RuleMeta, RulePayload, RuleTransform, Severity, ThreatMapping, ThreatMatchRuleData, ThresholdRuleData,
};
