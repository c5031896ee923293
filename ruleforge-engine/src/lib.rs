// 核心公共结构体+枚举（平台版本 / 规则类型 / 受限字段表）
pub mod core;
// 规则内容规范化 + 哈希
pub mod canonical;
// 版本锁存储 + 分叉状态机
pub mod lock;
// schema 数据源 + 字段类型解析
pub mod schema;
// 内核错误
pub mod error;
// 时间跨度解析 + 日志预览
pub mod utils;

// 顶层导出常用类型
pub use canonical::{dict_hash, nested_normalize, to_lock_json, Canonicalizer};
pub use core::{
    restricted_fields_for, IncompatibleField, Maturity, QueryLanguage, RestrictedFieldTable, RuleType,
    StackVersion, VersionRange, BUILD_FIELD_VERSIONS,
};
pub use error::{CoreError, CoreResult};
pub use lock::{
    LockOutcome, LockRoute, LockState, LockUpdate, VersionLockEntry, VersionLockStore, VersionStrategy,
    FORK_VERSION_BUFFER,
};
pub use schema::{
    FieldMap, FieldTypeResolver, ResolvedField, SchemaCatalog, SchemaSource, SchemaSourceResolver, SourceHints,
    StackSchemaMap,
};
