//! 字段类型解析
//! 优先级：ecs（canonical）→ 集成包 → 采集器模块 → endgame，命中即止；全部未命中为 "unknown"

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

use super::catalog::{SchemaSource, SchemaSourceResolver};
use super::index::{is_endgame_target, parse_beats_from_index, parse_datasets};
use super::stack_map::StackSchemaMap;
use super::FieldMap;
use crate::core::StackVersion;
use crate::error::CoreResult;

/// 未登记字段的类型占位
pub const UNKNOWN_FIELD_TYPE: &str = "unknown";

/// 解析结果（编译输出中的 required_fields 元素）
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResolvedField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    /// 是否为 canonical 字段
    pub ecs: bool,
}

/// 查询侧提供的数据源线索
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceHints {
    /// 规则声明的索引模式
    pub indices: Vec<String>,
    /// 查询中 `event.dataset` 的取值
    pub datasets: Vec<String>,
    /// 查询中 `event.module` 的取值
    pub modules: Vec<String>,
}

impl SourceHints {
    pub fn from_indices(indices: Vec<String>) -> Self {
        Self {
            indices,
            ..Default::default()
        }
    }
}

/// 按优先级合并多个 schema 数据源
#[derive(Clone)]
pub struct FieldTypeResolver {
    sources: Arc<dyn SchemaSourceResolver>,
    stack_map: StackSchemaMap,
}

impl std::fmt::Debug for FieldTypeResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldTypeResolver")
            .field("stack_map", &self.stack_map)
            .finish_non_exhaustive()
    }
}

impl FieldTypeResolver {
    pub fn new(sources: Arc<dyn SchemaSourceResolver>, stack_map: StackSchemaMap) -> Self {
        Self { sources, stack_map }
    }

    pub fn sources(&self) -> &dyn SchemaSourceResolver {
        self.sources.as_ref()
    }

    /// 解析查询引用字段的类型，结果按字段名升序
    pub fn resolve_required_fields<'a, I>(
        &self,
        fields: I,
        hints: &SourceHints,
        release: &StackVersion,
    ) -> CoreResult<Vec<ResolvedField>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let releases = self.stack_map.releases_for(release)?;
        let ecs = self.sources.field_map(&SchemaSource::Ecs, &releases.ecs);
        let secondary = self.secondary_schema(hints, releases.beats.as_deref(), releases.endgame.as_deref());

        let names: BTreeSet<&str> = fields.into_iter().collect();
        let resolved = names
            .into_iter()
            .map(|name| {
                if let Some(field_type) = ecs.and_then(|schema| schema.get(name)) {
                    return ResolvedField {
                        name: name.to_string(),
                        field_type: field_type.clone(),
                        ecs: true,
                    };
                }
                let field_type = secondary
                    .as_ref()
                    .and_then(|schema| schema.get(name))
                    .cloned()
                    .unwrap_or_else(|| {
                        log::debug!("Field type unresolved: {}", name);
                        UNKNOWN_FIELD_TYPE.to_string()
                    });
                ResolvedField {
                    name: name.to_string(),
                    field_type,
                    ecs: false,
                }
            })
            .collect();

        Ok(resolved)
    }

    /// 非 canonical 数据源只取第一个适用的：集成包 > 采集器 > endgame
    fn secondary_schema(&self, hints: &SourceHints, beats: Option<&str>, endgame: Option<&str>) -> Option<FieldMap> {
        let integrations = self.integration_schema(hints);
        if !integrations.is_empty() {
            return Some(integrations);
        }

        if let Some(release) = beats {
            let beats_schema = self.beats_schema(hints, release);
            if !beats_schema.is_empty() {
                return Some(beats_schema);
            }
        }

        let release = endgame?;
        if !is_endgame_target(&hints.indices) {
            return None;
        }
        self.sources.field_map(&SchemaSource::Endgame, release).cloned()
    }

    fn integration_schema(&self, hints: &SourceHints) -> FieldMap {
        let mut merged = FieldMap::new();
        for located in parse_datasets(&hints.datasets, self.sources.as_ref()) {
            let integrations = match located.integration {
                Some(integration) => vec![integration],
                None => self.sources.package_integrations(&located.package),
            };
            for integration in integrations {
                let source = SchemaSource::Integration {
                    package: located.package.clone(),
                    integration,
                };
                // 集成包字段表不随平台版本变化
                if let Some(fields) = self.sources.field_map(&source, "") {
                    merged.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
            }
        }
        merged
    }

    fn beats_schema(&self, hints: &SourceHints, release: &str) -> FieldMap {
        let mut merged = FieldMap::new();
        for beat in parse_beats_from_index(&hints.indices) {
            let available = self.sources.beat_modules(&beat, release);
            let mut modules: BTreeSet<String> = hints
                .modules
                .iter()
                .cloned()
                .chain(
                    hints
                        .datasets
                        .iter()
                        .filter_map(|dataset| dataset.split('.').next().map(str::to_string)),
                )
                .filter(|module| available.contains(module))
                .collect();
            if modules.is_empty() {
                modules = available.into_iter().collect();
            }

            for module in modules {
                let source = SchemaSource::Beats {
                    beat: beat.clone(),
                    module,
                };
                if let Some(fields) = self.sources.field_map(&source, release) {
                    merged.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
            }
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{SchemaCatalog, SchemaReleases};

    fn fields(raw: &[(&str, &str)]) -> FieldMap {
        raw.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn resolver() -> FieldTypeResolver {
        let catalog = SchemaCatalog::new()
            .with_ecs("8.11.0", fields(&[("event.category", "keyword"), ("process.name", "keyword")]))
            .with_integration("aws", "cloudtrail", fields(&[("aws.cloudtrail.flattened.request_parameters", "flattened")]))
            .with_beats("8.12.2", "filebeat", "aws", fields(&[("aws.cloudtrail.console_login.additional_eventdata.mfa_used", "boolean")]))
            .with_beats("8.12.2", "filebeat", "okta", fields(&[("okta.event_type", "keyword")]))
            .with_endgame("8.4.0", fields(&[("endgame.pid", "long")]));
        let stack_map = StackSchemaMap::new().with_release(
            StackVersion::new(8, 14, 0),
            SchemaReleases {
                ecs: "8.11.0".into(),
                beats: Some("8.12.2".into()),
                endgame: Some("8.4.0".into()),
            },
        );
        FieldTypeResolver::new(Arc::new(catalog), stack_map)
    }

    #[test]
    fn test_resolve_canonical_integration_and_unknown() {
        let hints = SourceHints {
            indices: vec!["logs-aws.cloudtrail-*".into()],
            datasets: vec!["aws.cloudtrail".into()],
            modules: vec![],
        };
        let resolved = resolver()
            .resolve_required_fields(
                ["made.up.field", "event.category", "aws.cloudtrail.flattened.request_parameters"],
                &hints,
                &StackVersion::new(8, 14, 0),
            )
            .unwrap();

        assert_eq!(
            resolved,
            vec![
                ResolvedField {
                    name: "aws.cloudtrail.flattened.request_parameters".into(),
                    field_type: "flattened".into(),
                    ecs: false
                },
                ResolvedField { name: "event.category".into(), field_type: "keyword".into(), ecs: true },
                ResolvedField { name: "made.up.field".into(), field_type: "unknown".into(), ecs: false },
            ]
        );
    }

    #[test]
    fn test_beats_modules_from_hints() {
        let hints = SourceHints {
            indices: vec!["filebeat-*".into()],
            datasets: vec![],
            modules: vec!["okta".into()],
        };
        let resolved = resolver()
            .resolve_required_fields(
                ["okta.event_type", "aws.cloudtrail.console_login.additional_eventdata.mfa_used"],
                &hints,
                &StackVersion::new(8, 14, 0),
            )
            .unwrap();
        let types: Vec<&str> = resolved.iter().map(|f| f.field_type.as_str()).collect();
        // 仅合并 okta 模块
        assert_eq!(types, vec!["unknown", "keyword"]);

        let all_modules = resolver()
            .resolve_required_fields(
                ["aws.cloudtrail.console_login.additional_eventdata.mfa_used"],
                &SourceHints::from_indices(vec!["filebeat-*".into()]),
                &StackVersion::new(8, 14, 0),
            )
            .unwrap();
        assert_eq!(all_modules[0].field_type, "boolean");
    }

    #[test]
    fn test_endgame_only_when_targeted() {
        let resolver = resolver();
        let release = StackVersion::new(8, 14, 0);
        let targeted = resolver
            .resolve_required_fields(["endgame.pid"], &SourceHints::from_indices(vec!["endgame-*".into()]), &release)
            .unwrap();
        assert_eq!(targeted[0].field_type, "long");

        let no_index = resolver.resolve_required_fields(["endgame.pid"], &SourceHints::default(), &release).unwrap();
        assert_eq!(no_index[0].field_type, "long");

        let other = resolver
            .resolve_required_fields(["endgame.pid"], &SourceHints::from_indices(vec!["logs-*".into()]), &release)
            .unwrap();
        assert_eq!(other[0].field_type, UNKNOWN_FIELD_TYPE);
    }

    #[test]
    fn test_unmapped_release_is_error() {
        let err = resolver()
            .resolve_required_fields(["event.category"], &SourceHints::default(), &StackVersion::new(7, 10, 0))
            .unwrap_err();
        assert!(matches!(err, crate::error::CoreError::SchemaSource(_)));
    }
}
