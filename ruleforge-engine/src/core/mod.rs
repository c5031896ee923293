mod enums;
mod restricted;
mod version;

// 导出常用项
pub use enums::{Maturity, QueryLanguage, RuleType};
pub use restricted::{
    restricted_fields_for, IncompatibleField, RestrictedFieldTable, VersionRange, BUILD_FIELD_VERSIONS,
};
pub use version::StackVersion;
