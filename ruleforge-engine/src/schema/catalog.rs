use rustc_hash::FxHashMap;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use super::FieldMap;
use crate::error::CoreResult;

/// schema 数据源标识
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SchemaSource {
    /// 通用字段规范（canonical）
    Ecs,
    /// 集成包字段表
    Integration { package: String, integration: String },
    /// 日志采集器某模块的字段表
    Beats { beat: String, module: String },
    /// endgame 扁平字段表
    Endgame,
}

/// schema 数据源解析接口：按 (数据源, 发布版本) 返回扁平字段表
/// 数据源在批处理期间只读，实现需可跨线程共享
pub trait SchemaSourceResolver: Send + Sync {
    fn field_map(&self, source: &SchemaSource, release: &str) -> Option<&FieldMap>;

    /// 集成包是否已登记
    fn has_package(&self, package: &str) -> bool;

    /// 集成包下的全部 integration 名称（升序）
    fn package_integrations(&self, package: &str) -> Vec<String>;

    /// 采集器在某发布版本下的全部模块（升序）
    fn beat_modules(&self, beat: &str, release: &str) -> Vec<String>;
}

/// 内存中的 schema 目录
/// JSON 布局：
/// `{"ecs": {release: {field: type}}, "beats": {release: {beat: {module: {field: type}}}},
///   "endgame": {release: {field: type}}, "integrations": {package: {integration: {field: type}}}}`
#[derive(Debug, Default, Clone, Deserialize)]
pub struct SchemaCatalog {
    #[serde(default)]
    ecs: FxHashMap<String, FieldMap>,
    #[serde(default)]
    beats: FxHashMap<String, BTreeMap<String, BTreeMap<String, FieldMap>>>,
    #[serde(default)]
    endgame: FxHashMap<String, FieldMap>,
    #[serde(default)]
    integrations: BTreeMap<String, BTreeMap<String, FieldMap>>,
}

impl SchemaCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(content: &str) -> CoreResult<Self> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn load(path: &Path) -> CoreResult<Self> {
        let catalog = Self::from_json(&fs::read_to_string(path)?)?;
        log::info!(
            "Schema catalog loaded from {} | ecs releases: {}, integration packages: {}",
            path.display(),
            catalog.ecs.len(),
            catalog.integrations.len()
        );
        Ok(catalog)
    }

    pub fn with_ecs(mut self, release: impl Into<String>, fields: FieldMap) -> Self {
        self.ecs.insert(release.into(), fields);
        self
    }

    pub fn with_beats(
        mut self,
        release: impl Into<String>,
        beat: impl Into<String>,
        module: impl Into<String>,
        fields: FieldMap,
    ) -> Self {
        self.beats
            .entry(release.into())
            .or_default()
            .entry(beat.into())
            .or_default()
            .insert(module.into(), fields);
        self
    }

    pub fn with_endgame(mut self, release: impl Into<String>, fields: FieldMap) -> Self {
        self.endgame.insert(release.into(), fields);
        self
    }

    pub fn with_integration(
        mut self,
        package: impl Into<String>,
        integration: impl Into<String>,
        fields: FieldMap,
    ) -> Self {
        self.integrations
            .entry(package.into())
            .or_default()
            .insert(integration.into(), fields);
        self
    }
}

impl SchemaSourceResolver for SchemaCatalog {
    fn field_map(&self, source: &SchemaSource, release: &str) -> Option<&FieldMap> {
        match source {
            SchemaSource::Ecs => self.ecs.get(release),
            SchemaSource::Endgame => self.endgame.get(release),
            SchemaSource::Beats { beat, module } => self.beats.get(release)?.get(beat)?.get(module),
            SchemaSource::Integration { package, integration } => {
                self.integrations.get(package)?.get(integration)
            }
        }
    }

    fn has_package(&self, package: &str) -> bool {
        self.integrations.contains_key(package)
    }

    fn package_integrations(&self, package: &str) -> Vec<String> {
        self.integrations
            .get(package)
            .map(|integrations| integrations.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn beat_modules(&self, beat: &str, release: &str) -> Vec<String> {
        self.beats
            .get(release)
            .and_then(|beats| beats.get(beat))
            .map(|modules| modules.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_from_json() {
        let raw = r#"{
            "ecs": {"8.11.0": {"event.category": "keyword"}},
            "beats": {"8.12.2": {"filebeat": {"aws": {"aws.cloudtrail.user_identity.arn": "keyword"}}}},
            "integrations": {"aws": {"cloudtrail": {"aws.cloudtrail.event_type": "keyword"}}}
        }"#;
        let catalog = SchemaCatalog::from_json(raw).unwrap();
        assert_eq!(
            catalog.field_map(&SchemaSource::Ecs, "8.11.0").unwrap()["event.category"],
            "keyword"
        );
        assert!(catalog.field_map(&SchemaSource::Endgame, "8.4.0").is_none());
        assert!(catalog.has_package("aws"));
        assert_eq!(catalog.package_integrations("aws"), vec!["cloudtrail".to_string()]);
        assert_eq!(catalog.beat_modules("filebeat", "8.12.2"), vec!["aws".to_string()]);
        assert!(catalog.beat_modules("filebeat", "8.0.0").is_empty());
    }
}
