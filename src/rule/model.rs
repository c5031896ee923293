//! 规则数据模型定义
//! 仅描述规则数据的形状：元数据、按 `type` 区分的负载、note 插件
//! 规则类型固定在负载变体上，公共字段以值的形式内嵌在每个变体中

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;

use ruleforge_engine::{Maturity, QueryLanguage, ResolvedField, RuleType};

// ===================== 元数据 =====================

/// 单值或列表（`integration = "aws"` 与 `integration = ["aws", "azure"]` 等价）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            OneOrMany::One(value) => vec![value.clone()],
            OneOrMany::Many(values) => values.clone(),
        }
    }
}

/// 规则元数据（不进入编译产物，`include_metadata` 时放入 `meta`）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleMeta {
    pub creation_date: String,
    pub updated_date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deprecation_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maturity: Option<Maturity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integration: Option<OneOrMany>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_stack_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_stack_comments: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bypass_bbr_timing: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comments: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_type_list: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_schema_validation: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_endpoint_rules: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promotion: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extended: Option<Map<String, Value>>,
}

impl RuleMeta {
    pub fn new(creation_date: impl Into<String>, updated_date: impl Into<String>) -> Self {
        Self {
            creation_date: creation_date.into(),
            updated_date: updated_date.into(),
            deprecation_date: None,
            maturity: None,
            integration: None,
            min_stack_version: None,
            min_stack_comments: None,
            bypass_bbr_timing: None,
            comments: None,
            os_type_list: None,
            query_schema_validation: None,
            related_endpoint_rules: None,
            promotion: None,
            extended: None,
        }
    }

    pub fn integrations(&self) -> Vec<String> {
        self.integration.as_ref().map(OneOrMany::to_vec).unwrap_or_default()
    }
}

// ===================== 公共字段 =====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreatEntry {
    pub id: String,
    pub name: String,
    pub reference: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreatTechnique {
    pub id: String,
    pub name: String,
    pub reference: String,
    pub subtechnique: Option<Vec<ThreatEntry>>,
}

/// MITRE ATT&CK 映射
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreatMapping {
    pub framework: String,
    pub tactic: ThreatEntry,
    pub technique: Option<Vec<ThreatTechnique>>,
}

/// 展平后的威胁映射（各列表去重升序）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlatThreatMapping {
    pub tactic_names: Vec<String>,
    pub tactic_ids: Vec<String>,
    pub technique_names: Vec<String>,
    pub technique_ids: Vec<String>,
    pub sub_technique_names: Vec<String>,
    pub sub_technique_ids: Vec<String>,
}

impl ThreatMapping {
    pub fn flatten(mappings: &[ThreatMapping]) -> FlatThreatMapping {
        let mut tactic_names = BTreeSet::new();
        let mut tactic_ids = BTreeSet::new();
        let mut technique_names = BTreeSet::new();
        let mut technique_ids = BTreeSet::new();
        let mut sub_names = BTreeSet::new();
        let mut sub_ids = BTreeSet::new();

        for mapping in mappings {
            tactic_names.insert(mapping.tactic.name.clone());
            tactic_ids.insert(mapping.tactic.id.clone());
            for technique in mapping.technique.iter().flatten() {
                technique_names.insert(technique.name.clone());
                technique_ids.insert(technique.id.clone());
                for sub in technique.subtechnique.iter().flatten() {
                    sub_names.insert(sub.name.clone());
                    sub_ids.insert(sub.id.clone());
                }
            }
        }

        FlatThreatMapping {
            tactic_names: tactic_names.into_iter().collect(),
            tactic_ids: tactic_ids.into_iter().collect(),
            technique_names: technique_names.into_iter().collect(),
            technique_ids: technique_ids.into_iter().collect(),
            sub_technique_names: sub_names.into_iter().collect(),
            sub_technique_ids: sub_ids.into_iter().collect(),
        }
    }

    /// 带协议的引用链接统一以 `/` 结尾
    pub(crate) fn normalize_references(&mut self) {
        normalize_url(&mut self.tactic.reference);
        for technique in self.technique.iter_mut().flatten() {
            normalize_url(&mut technique.reference);
            for sub in technique.subtechnique.iter_mut().flatten() {
                normalize_url(&mut sub.reference);
            }
        }
    }
}

fn normalize_url(reference: &mut String) {
    if reference.contains("://") && !reference.ends_with('/') {
        reference.push('/');
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelatedIntegration {
    pub package: String,
    pub version: String,
    pub integration: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvestigationFields {
    pub field_names: Vec<String>,
}

/// 所有规则类型共享的字段
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseRuleData {
    pub actions: Option<Vec<Value>>,
    pub author: Vec<String>,
    pub building_block_type: Option<String>,
    pub description: String,
    pub enabled: Option<bool>,
    pub exceptions_list: Option<Vec<Value>>,
    pub false_positives: Option<Vec<String>>,
    pub filters: Option<Vec<Value>>,
    pub from: Option<String>,
    pub interval: Option<String>,
    pub investigation_fields: Option<InvestigationFields>,
    pub license: Option<String>,
    pub max_signals: Option<u32>,
    pub meta: Option<Map<String, Value>>,
    pub name: String,
    pub note: Option<String>,
    pub references: Option<Vec<String>>,
    pub related_integrations: Option<Vec<RelatedIntegration>>,
    pub required_fields: Option<Vec<ResolvedField>>,
    pub revision: Option<u32>,
    pub risk_score: u8,
    pub risk_score_mapping: Option<Vec<Value>>,
    pub rule_id: String,
    pub rule_name_override: Option<String>,
    pub setup: Option<String>,
    pub severity: Severity,
    pub severity_mapping: Option<Vec<Value>>,
    pub tags: Option<Vec<String>>,
    pub threat: Option<Vec<ThreatMapping>>,
    pub throttle: Option<String>,
    pub timeline_id: Option<String>,
    pub timeline_title: Option<String>,
    pub timestamp_override: Option<String>,
    pub to: Option<String>,
    pub version: Option<u32>,
}

/// 携带查询的规则共享的字段
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryFields {
    pub query: String,
    pub language: QueryLanguage,
    pub index: Option<Vec<String>>,
    pub data_view_id: Option<String>,
    pub alert_suppression: Option<Value>,
}

// ===================== 各类型负载 =====================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRuleData {
    #[serde(flatten)]
    pub base: BaseRuleData,
    #[serde(flatten)]
    pub query: QueryFields,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EqlRuleData {
    #[serde(flatten)]
    pub base: BaseRuleData,
    #[serde(flatten)]
    pub query: QueryFields,
    pub timestamp_field: Option<String>,
    pub event_category_override: Option<String>,
    pub tiebreaker_field: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EsqlRuleData {
    #[serde(flatten)]
    pub base: BaseRuleData,
    #[serde(flatten)]
    pub query: QueryFields,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdCardinality {
    pub field: String,
    pub value: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdMapping {
    pub field: Vec<String>,
    pub value: u64,
    pub cardinality: Option<Vec<ThresholdCardinality>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdRuleData {
    #[serde(flatten)]
    pub base: BaseRuleData,
    #[serde(flatten)]
    pub query: QueryFields,
    pub threshold: ThresholdMapping,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryWindowStart {
    pub field: String,
    pub value: String,
}

/// `new_terms` 在源文件中的折叠形式
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTermsMapping {
    pub field: String,
    pub value: Vec<String>,
    pub history_window_start: Vec<HistoryWindowStart>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTermsRuleData {
    #[serde(flatten)]
    pub base: BaseRuleData,
    #[serde(flatten)]
    pub query: QueryFields,
    pub new_terms: NewTermsMapping,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreatMapEntry {
    pub field: String,
    #[serde(rename = "type")]
    pub entry_type: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreatMapEntries {
    pub entries: Vec<ThreatMapEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreatMatchRuleData {
    #[serde(flatten)]
    pub base: BaseRuleData,
    #[serde(flatten)]
    pub query: QueryFields,
    pub threat_mapping: Vec<ThreatMapEntries>,
    pub threat_index: Vec<String>,
    pub threat_query: Option<String>,
    pub threat_language: Option<QueryLanguage>,
    pub threat_filters: Option<Vec<Value>>,
    pub threat_indicator_path: Option<String>,
    pub concurrent_searches: Option<u32>,
    pub items_per_search: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineLearningRuleData {
    #[serde(flatten)]
    pub base: BaseRuleData,
    pub anomaly_threshold: u32,
    pub machine_learning_job_id: OneOrMany,
    pub alert_suppression: Option<Value>,
}

/// 规则负载：按 `type` 区分的和类型
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RulePayload {
    Query(QueryRuleData),
    Eql(EqlRuleData),
    Esql(EsqlRuleData),
    Threshold(ThresholdRuleData),
    NewTerms(NewTermsRuleData),
    ThreatMatch(ThreatMatchRuleData),
    MachineLearning(MachineLearningRuleData),
}

impl RulePayload {
    pub fn rule_type(&self) -> RuleType {
        match self {
            RulePayload::Query(_) => RuleType::Query,
            RulePayload::Eql(_) => RuleType::Eql,
            RulePayload::Esql(_) => RuleType::Esql,
            RulePayload::Threshold(_) => RuleType::Threshold,
            RulePayload::NewTerms(_) => RuleType::NewTerms,
            RulePayload::ThreatMatch(_) => RuleType::ThreatMatch,
            RulePayload::MachineLearning(_) => RuleType::MachineLearning,
        }
    }

    pub fn base(&self) -> &BaseRuleData {
        match self {
            RulePayload::Query(data) => &data.base,
            RulePayload::Eql(data) => &data.base,
            RulePayload::Esql(data) => &data.base,
            RulePayload::Threshold(data) => &data.base,
            RulePayload::NewTerms(data) => &data.base,
            RulePayload::ThreatMatch(data) => &data.base,
            RulePayload::MachineLearning(data) => &data.base,
        }
    }

    pub fn base_mut(&mut self) -> &mut BaseRuleData {
        match self {
            RulePayload::Query(data) => &mut data.base,
            RulePayload::Eql(data) => &mut data.base,
            RulePayload::Esql(data) => &mut data.base,
            RulePayload::Threshold(data) => &mut data.base,
            RulePayload::NewTerms(data) => &mut data.base,
            RulePayload::ThreatMatch(data) => &mut data.base,
            RulePayload::MachineLearning(data) => &mut data.base,
        }
    }

    /// 查询相关字段；机器学习规则没有查询
    pub fn query_fields(&self) -> Option<&QueryFields> {
        match self {
            RulePayload::Query(data) => Some(&data.query),
            RulePayload::Eql(data) => Some(&data.query),
            RulePayload::Esql(data) => Some(&data.query),
            RulePayload::Threshold(data) => Some(&data.query),
            RulePayload::NewTerms(data) => Some(&data.query),
            RulePayload::ThreatMatch(data) => Some(&data.query),
            RulePayload::MachineLearning(_) => None,
        }
    }

    pub fn language(&self) -> Option<QueryLanguage> {
        self.query_fields().map(|q| q.language)
    }

    pub fn index(&self) -> &[String] {
        self.query_fields()
            .and_then(|q| q.index.as_deref())
            .unwrap_or_default()
    }

    /// 规则类型允许的查询语言
    pub(crate) fn allowed_languages(&self) -> &'static [QueryLanguage] {
        match self {
            RulePayload::Eql(_) => &[QueryLanguage::Eql],
            RulePayload::Esql(_) => &[QueryLanguage::Esql],
            RulePayload::MachineLearning(_) => &[],
            _ => &[QueryLanguage::Kuery, QueryLanguage::Lucene],
        }
    }

    pub(crate) fn normalize_references(&mut self) {
        for mapping in self.base_mut().threat.iter_mut().flatten() {
            mapping.normalize_references();
        }
    }
}

impl fmt::Display for RulePayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let base = self.base();
        write!(f, "{} - {} ({})", base.name, base.rule_id, self.rule_type())
    }
}

// ===================== note 插件 =====================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OsQueryPlugin {
    pub label: String,
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ecs_mapping: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvestigateProvider {
    pub excluded: bool,
    pub field: String,
    pub query_type: String,
    pub value: String,
    pub value_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvestigatePlugin {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub providers: Vec<Vec<InvestigateProvider>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relative_from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relative_to: Option<String>,
}

/// 编译时渲染进 note 的插件
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleTransform {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub osquery: Option<Vec<OsQueryPlugin>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub investigate: Option<Vec<InvestigatePlugin>>,
}
