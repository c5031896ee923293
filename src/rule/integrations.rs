//! 集成包清单：为编译产物派生 related_integrations
//! 清单的下载与解压不在本 crate 内，调用方只需提供已解析的数据

use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use ruleforge_engine::schema::PackageIntegration;
use ruleforge_engine::StackVersion;

use crate::error::RuleResult;

/// 无 `event.dataset` 的集成包，直接按元数据中的包名关联
pub const NON_DATASET_PACKAGES: &[&str] = &[
    "apm",
    "auditd_manager",
    "cloud_defend",
    "endpoint",
    "jamf_protect",
    "network_traffic",
    "system",
    "windows",
    "sentinel_one_cloud_funnel",
    "ti_rapid7_threat_command",
    "m365_defender",
    "panw",
    "crowdstrike",
];

/// 机器学习类集成包
pub const MACHINE_LEARNING_PACKAGES: &[&str] = &["auditd_manager", "endpoint", "network_traffic", "problemchild", "dga", "lmd", "ded"];

/// 集成包清单查询接口
pub trait IntegrationManifest: Send + Sync {
    /// 是否登记了该集成包
    fn has_package(&self, package: &str) -> bool;

    /// 与目标平台版本兼容的最低包版本（`^x.y.z`）
    fn least_compatible_version(&self, package: &str, stack: &StackVersion) -> Option<String>;

    /// 指定包版本声明的 policy template；未知返回 None
    fn policy_templates(&self, package: &str, version: &str) -> Option<Vec<String>>;

    /// 不依赖数据集即可关联的包
    fn is_non_dataset_package(&self, package: &str) -> bool {
        NON_DATASET_PACKAGES.contains(&package) || MACHINE_LEARNING_PACKAGES.contains(&package)
    }
}

/// 单个包版本的清单摘要
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PackageManifest {
    /// kibana 版本约束，如 `^8.3.0 || ^7.17.0`
    pub kibana_version: String,
    #[serde(default)]
    pub policy_templates: Vec<String>,
}

/// 内存中的清单：包名 → 包版本 → 清单摘要
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct StaticManifest {
    packages: BTreeMap<String, BTreeMap<String, PackageManifest>>,
}

impl StaticManifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(content: &str) -> RuleResult<Self> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn load(path: &Path) -> RuleResult<Self> {
        let content = fs::read_to_string(path).map_err(ruleforge_engine::CoreError::from)?;
        Self::from_json(&content)
    }

    pub fn with_package(
        mut self,
        package: impl Into<String>,
        version: impl Into<String>,
        kibana_version: impl Into<String>,
        policy_templates: &[&str],
    ) -> Self {
        self.packages.entry(package.into()).or_default().insert(
            version.into(),
            PackageManifest {
                kibana_version: kibana_version.into(),
                policy_templates: policy_templates.iter().map(|s| s.to_string()).collect(),
            },
        );
        self
    }
}

impl IntegrationManifest for StaticManifest {
    fn has_package(&self, package: &str) -> bool {
        self.packages.contains_key(package)
    }

    fn least_compatible_version(&self, package: &str, stack: &StackVersion) -> Option<String> {
        let versions = self.packages.get(package)?;

        let mut parsed: Vec<(StackVersion, &PackageManifest)> = versions
            .iter()
            .filter_map(|(raw, manifest)| StackVersion::parse(raw).ok().map(|v| (v, manifest)))
            .collect();
        parsed.sort_by(|a, b| a.0.cmp(&b.0));

        let mut majors: Vec<u64> = parsed.iter().map(|(v, _)| v.major()).collect();
        majors.dedup();

        // 从最新的主版本开始，在主版本内按升序找第一个兼容的包版本
        for major in majors.into_iter().rev() {
            for (version, manifest) in parsed.iter().filter(|(v, _)| v.major() == major) {
                if kibana_condition_matches(&manifest.kibana_version, stack) {
                    return Some(format!("^{}", version));
                }
            }
        }
        log::warn!("No compatible version for integration package {} at stack {}", package, stack);
        None
    }

    fn policy_templates(&self, package: &str, version: &str) -> Option<Vec<String>> {
        let bare = version.trim_start_matches('^');
        self.packages
            .get(package)?
            .get(bare)
            .map(|manifest| manifest.policy_templates.clone())
    }
}

/// 约束中任一分支与目标主版本相同且不高于目标版本即视为兼容
fn kibana_condition_matches(condition: &str, stack: &StackVersion) -> bool {
    condition
        .split("||")
        .map(|branch| branch.trim().trim_start_matches(['>', '<', '=', '^', '~']))
        .filter_map(|raw| StackVersion::parse(raw).ok())
        .any(|kibana| kibana.major() == stack.major() && &kibana <= stack)
}

/// 元数据中的包 + 查询数据集 → 去重后的集成包定位
pub(crate) fn packaged_integrations(
    manifest: &dyn IntegrationManifest,
    metadata_integrations: &[String],
    datasets: &[String],
    is_machine_learning: bool,
) -> Vec<PackageIntegration> {
    let mut packages: Vec<PackageIntegration> = metadata_integrations
        .iter()
        .filter(|package| is_machine_learning || manifest.is_non_dataset_package(package))
        .map(|package| PackageIntegration {
            package: package.clone(),
            integration: None,
        })
        .collect();

    for dataset in datasets {
        let (package, integration) = match dataset.split_once('.') {
            Some((package, integration)) => (package, Some(integration.to_string())),
            None => (dataset.as_str(), None),
        };
        if manifest.has_package(package) {
            packages.push(PackageIntegration {
                package: package.to_string(),
                integration,
            });
        }
    }

    let mut seen = Vec::with_capacity(packages.len());
    for package in packages {
        if !seen.contains(&package) {
            seen.push(package);
        }
    }
    seen
}
