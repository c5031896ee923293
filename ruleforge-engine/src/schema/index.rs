use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::catalog::SchemaSourceResolver;

/// 可识别的日志采集器索引前缀（`<beat>-*`）
pub const BEATS_INDEX_PREFIXES: &[&str] = &[
    "auditbeat",
    "filebeat",
    "functionbeat",
    "heartbeat",
    "metricbeat",
    "packetbeat",
    "winlogbeat",
];

const ENDGAME_INDEX: &str = "endgame-*";

/// 数据集解析出的集成包定位
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PackageIntegration {
    pub package: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integration: Option<String>,
}

/// 从索引模式中识别采集器类型（升序去重）
pub fn parse_beats_from_index(indices: &[String]) -> Vec<String> {
    indices
        .iter()
        .filter_map(|index| {
            let prefix = index.split(['-', '*']).next()?;
            BEATS_INDEX_PREFIXES.contains(&prefix).then(|| prefix.to_string())
        })
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// 未声明索引或显式包含 `endgame-*` 时才参考 endgame 字段表
pub fn is_endgame_target(indices: &[String]) -> bool {
    indices.is_empty() || indices.iter().any(|index| index == ENDGAME_INDEX)
}

/// `event.dataset` 取值（`package.integration` / `package`）→ 已登记的集成包
pub fn parse_datasets<R>(datasets: &[String], resolver: &R) -> Vec<PackageIntegration>
where
    R: SchemaSourceResolver + ?Sized,
{
    datasets
        .iter()
        .filter_map(|dataset| {
            let (package, integration) = match dataset.split_once('.') {
                Some((package, integration)) => (package, Some(integration.to_string())),
                None => (dataset.as_str(), None),
            };
            resolver.has_package(package).then(|| PackageIntegration {
                package: package.to_string(),
                integration,
            })
        })
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaCatalog;

    fn strings(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_beats_from_index() {
        let indices = strings(&["winlogbeat-*", "logs-windows.*", "filebeat-*", "winlogbeat-8*"]);
        assert_eq!(parse_beats_from_index(&indices), strings(&["filebeat", "winlogbeat"]));
        assert!(parse_beats_from_index(&strings(&["logs-*"])).is_empty());
    }

    #[test]
    fn test_endgame_target() {
        assert!(is_endgame_target(&[]));
        assert!(is_endgame_target(&strings(&["logs-endpoint.events.*", "endgame-*"])));
        assert!(!is_endgame_target(&strings(&["logs-endpoint.events.*"])));
    }

    #[test]
    fn test_parse_datasets_known_packages_only() {
        let catalog = SchemaCatalog::new().with_integration("aws", "cloudtrail", Default::default());
        let parsed = parse_datasets(&strings(&["aws.cloudtrail", "aws", "unknown.thing"]), &catalog);
        assert_eq!(
            parsed,
            vec![
                PackageIntegration { package: "aws".into(), integration: None },
                PackageIntegration { package: "aws".into(), integration: Some("cloudtrail".into()) },
            ]
        );
    }
}
