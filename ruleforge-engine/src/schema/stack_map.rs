use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::core::StackVersion;
use crate::error::{CoreError, CoreResult};

/// 某个平台发布版本对应的各 schema 发布版本
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaReleases {
    pub ecs: String,
    #[serde(default)]
    pub beats: Option<String>,
    #[serde(default)]
    pub endgame: Option<String>,
}

/// 平台发布版本 → schema 发布版本
#[derive(Debug, Clone, Default)]
pub struct StackSchemaMap {
    releases: BTreeMap<StackVersion, SchemaReleases>,
}

impl StackSchemaMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_release(mut self, stack: StackVersion, releases: SchemaReleases) -> Self {
        self.releases.insert(stack, releases);
        self
    }

    /// JSON 布局：`{"8.14.0": {"ecs": "8.11.0", "beats": "8.12.2", "endgame": "8.4.0"}}`
    pub fn from_json(content: &str) -> CoreResult<Self> {
        let raw: BTreeMap<String, SchemaReleases> = serde_json::from_str(content)?;
        let releases = raw
            .into_iter()
            .map(|(stack, releases)| Ok((StackVersion::parse(&stack)?, releases)))
            .collect::<CoreResult<_>>()?;
        Ok(Self { releases })
    }

    pub fn load(path: &Path) -> CoreResult<Self> {
        Self::from_json(&fs::read_to_string(path)?)
    }

    /// 取不高于目标版本的最近一条映射
    pub fn releases_for(&self, stack: &StackVersion) -> CoreResult<&SchemaReleases> {
        self.releases
            .range(..=stack.clone())
            .next_back()
            .map(|(_, releases)| releases)
            .ok_or_else(|| CoreError::SchemaSource(format!("no schema releases mapped for stack {}", stack)))
    }

    pub fn is_empty(&self) -> bool {
        self.releases.is_empty()
    }
}
