//! 字段类型解析：多个独立版本化的 schema 数据源按优先级合并
mod catalog;
mod index;
mod resolver;
mod stack_map;

pub use catalog::{SchemaCatalog, SchemaSource, SchemaSourceResolver};
pub use index::{is_endgame_target, parse_beats_from_index, parse_datasets, PackageIntegration, BEATS_INDEX_PREFIXES};
pub use resolver::{FieldTypeResolver, ResolvedField, SourceHints, UNKNOWN_FIELD_TYPE};
pub use stack_map::{SchemaReleases, StackSchemaMap};

use std::collections::BTreeMap;

/// 扁平字段表：点分字段名 → 类型
pub type FieldMap = BTreeMap<String, String>;
