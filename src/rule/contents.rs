//! 规则内容：元数据 + 负载 + note 插件，以及版本锁相关的编排操作

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

use ruleforge_engine::utils::compress_field_set;
use ruleforge_engine::{
    dict_hash, restricted_fields_for, IncompatibleField, LockOutcome, LockUpdate, QueryLanguage, RuleType,
    StackVersion,
};

use super::context::CompileContext;
use super::model::{EqlRuleData, RuleMeta, RulePayload, RuleTransform};
use crate::error::{RuleError, RuleResult};
use crate::query::{validator_for, QueryAst};

const UNKNOWN_RULE_ID: &str = "<unknown>";
const MAX_RISK_SCORE: u8 = 100;

/// 元数据日期格式 YYYY/MM/DD
static DATE_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{4}/\d{2}/\d{2}$").expect("date pattern is valid"));

/// 版本锁文件中单条规则的摘要
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub rule_name: String,
    pub sha256: String,
    pub version: u32,
    #[serde(rename = "type")]
    pub rule_type: RuleType,
}

/// 单条规则的完整内容（创建后不可变，修改通过 with_* 生成新值）
#[derive(Debug, Clone, PartialEq)]
pub struct RuleContents {
    metadata: RuleMeta,
    payload: RulePayload,
    transform: Option<RuleTransform>,
}

impl RuleContents {
    pub fn new(metadata: RuleMeta, mut payload: RulePayload, transform: Option<RuleTransform>) -> RuleResult<Self> {
        check_language(&payload)?;
        check_field_constraints(&metadata, &payload)?;
        if let Some(raw) = metadata.min_stack_version.as_deref() {
            StackVersion::parse(raw).map_err(|e| {
                RuleError::schema(&payload.base().rule_id, "metadata.min_stack_version", e.to_string())
            })?;
        }
        payload.normalize_references();
        Ok(Self {
            metadata,
            payload,
            transform,
        })
    }

    /// 从已解析的源文档 `{metadata, rule, transform?}` 构造
    pub fn from_document(document: &Value) -> RuleResult<Self> {
        let rule = document
            .get("rule")
            .and_then(Value::as_object)
            .ok_or_else(|| RuleError::schema(UNKNOWN_RULE_ID, "rule", "missing rule table"))?;
        let rule_id = rule
            .get("rule_id")
            .and_then(Value::as_str)
            .unwrap_or(UNKNOWN_RULE_ID)
            .to_string();

        let raw_metadata = document
            .get("metadata")
            .cloned()
            .ok_or_else(|| RuleError::schema(&rule_id, "metadata", "missing metadata table"))?;
        let metadata: RuleMeta =
            serde_json::from_value(raw_metadata).map_err(|e| serde_schema_error(&rule_id, "metadata", &e))?;

        let transform = match document.get("transform") {
            None | Some(Value::Null) => None,
            Some(raw) => Some(
                serde_json::from_value::<RuleTransform>(raw.clone())
                    .map_err(|e| serde_schema_error(&rule_id, "transform", &e))?,
            ),
        };

        let raw_rule = Value::Object(fold_new_terms(rule.clone()));
        let payload: RulePayload =
            serde_json::from_value(raw_rule.clone()).map_err(|e| serde_schema_error(&rule_id, "", &e))?;

        // flatten 无法拒绝未知字段，回写后比对键集合
        let reserialized = serde_json::to_value(&payload)?;
        let mut unknown = Vec::new();
        find_unknown_fields(&raw_rule, &reserialized, "", &mut unknown);
        if let Some(path) = unknown.into_iter().next() {
            return Err(RuleError::schema(rule_id, path, "unknown field"));
        }

        Self::new(metadata, payload, transform)
    }

    pub fn from_json(content: &str) -> RuleResult<Self> {
        let document: Value = serde_json::from_str(content)?;
        Self::from_document(&document)
    }

    pub fn id(&self) -> &str {
        &self.payload.base().rule_id
    }

    pub fn name(&self) -> &str {
        &self.payload.base().name
    }

    pub fn rule_type(&self) -> RuleType {
        self.payload.rule_type()
    }

    pub fn metadata(&self) -> &RuleMeta {
        &self.metadata
    }

    pub fn payload(&self) -> &RulePayload {
        &self.payload
    }

    pub fn transform(&self) -> Option<&RuleTransform> {
        self.transform.as_ref()
    }

    /// 替换负载；规则类型不可变
    pub fn with_payload(&self, payload: RulePayload) -> RuleResult<Self> {
        if payload.rule_type() != self.rule_type() {
            return Err(RuleError::schema(
                self.id(),
                "type",
                format!("rule type is fixed as {}, got {}", self.rule_type(), payload.rule_type()),
            ));
        }
        Self::new(self.metadata.clone(), payload, self.transform.clone())
    }

    pub fn with_metadata(&self, metadata: RuleMeta) -> RuleResult<Self> {
        Self::new(metadata, self.payload.clone(), self.transform.clone())
    }

    pub fn with_transform(&self, transform: Option<RuleTransform>) -> Self {
        Self {
            transform,
            ..self.clone()
        }
    }

    /// 元数据声明的最低平台版本
    pub fn min_stack_version(&self) -> RuleResult<Option<StackVersion>> {
        match self.metadata.min_stack_version.as_deref() {
            Some(raw) => Ok(Some(StackVersion::parse(raw)?)),
            None => Ok(None),
        }
    }

    // ===================== 版本 =====================

    /// 规则当前支持的最低平台版本（major.minor.0）：声明值与全局最低支持版本取大
    pub fn get_supported_version(&self, ctx: &CompileContext) -> RuleResult<StackVersion> {
        let global_min = &ctx.config().min_supported_stack_version;
        let supported = match self.min_stack_version()? {
            Some(declared) if &declared > global_min => declared,
            _ => global_min.clone(),
        };
        Ok(supported.truncated())
    }

    /// 已锁定的版本；旁路模式下取规则自身的 version
    pub fn saved_version(&self, ctx: &CompileContext) -> RuleResult<Option<u32>> {
        let Some(store) = ctx.versions().store() else {
            return Ok(self.payload.base().version);
        };
        if self.payload.base().version.is_some() {
            log::warn!(
                "Rule {} - {} has a version set in the rule. This `version` will be ignored and defaulted to the version lock.",
                self.name(),
                self.id()
            );
        }
        let supported = self.get_supported_version(ctx)?;
        Ok(store.get_locked_version(self.id(), &supported))
    }

    /// 考虑自动递增后的版本：未锁定为 1，内容变化时加 1
    pub fn autobumped_version(&self, ctx: &CompileContext) -> RuleResult<u32> {
        ctx.lock_store()?;
        match self.saved_version(ctx)? {
            None => Ok(1),
            Some(version) if self.is_dirty(ctx)? => Ok(version + 1),
            Some(version) => Ok(version),
        }
    }

    /// 编译产物中使用的版本
    pub fn get_synthetic_version(&self, ctx: &CompileContext, use_default: bool) -> RuleResult<Option<u32>> {
        if ctx.is_lock_bypassed() {
            let saved = self.saved_version(ctx)?;
            return Ok(saved.or(use_default.then_some(1)));
        }
        self.autobumped_version(ctx).map(Some)
    }

    /// 锁定哈希与两种哈希约定都不一致时为 dirty；未锁定的规则不算 dirty
    pub fn is_dirty(&self, ctx: &CompileContext) -> RuleResult<bool> {
        let store = ctx.lock_store()?;
        let supported = self.get_supported_version(ctx)?;
        let Some(locked_hash) = store.get_locked_hash(self.id(), &supported) else {
            return Ok(false);
        };
        if locked_hash == self.hash(ctx, false, false)? {
            return Ok(false);
        }
        Ok(locked_hash != self.hash(ctx, false, true)?)
    }

    pub fn has_forked(&self, ctx: &CompileContext) -> bool {
        ctx.versions().store().map_or(false, |store| store.has_forked(self.id()))
    }

    pub fn is_in_forked_version(&self, ctx: &CompileContext) -> bool {
        ctx.versions().store().map_or(false, |store| {
            store.is_in_forked_version(self.id(), &ctx.config().current_package_version)
        })
    }

    /// 分叉窗口内剩余的版本数；非分叉状态为 None
    pub fn version_space(&self, ctx: &CompileContext) -> RuleResult<Option<i64>> {
        let store = ctx.lock_store()?;
        let supported = self.get_supported_version(ctx)?;
        Ok(store.version_space(self.id(), &supported, &ctx.config().current_package_version))
    }

    pub fn lock_info(&self, ctx: &CompileContext, bump: bool) -> RuleResult<LockInfo> {
        let version = if bump {
            self.autobumped_version(ctx)?
        } else {
            self.saved_version(ctx)?.unwrap_or(1)
        };
        Ok(LockInfo {
            rule_name: self.name().to_string(),
            sha256: self.hash(ctx, false, false)?,
            version,
            rule_type: self.rule_type(),
        })
    }

    /// 将当前内容写入版本锁
    pub fn record_lock(&self, ctx: &CompileContext) -> RuleResult<LockOutcome> {
        let store = ctx.lock_store()?;
        let update = LockUpdate::new(self.hash(ctx, false, false)?, self.get_supported_version(ctx)?)
            .with_alternate(self.hash(ctx, false, true)?)
            .with_identity(self.name(), self.rule_type().as_str());
        let outcome = store.record(self.id(), update)?;
        log::debug!("{} lock outcome: {:?}", self.payload, outcome);
        Ok(outcome)
    }

    // ===================== 哈希 =====================

    /// 内容哈希；version 默认不参与，related_integrations 按需参与
    pub fn hash(&self, ctx: &CompileContext, include_version: bool, include_integrations: bool) -> RuleResult<String> {
        let mut content = self.to_api_format(ctx, include_version, false)?;
        if !include_version {
            content.remove("version");
        }
        if !include_integrations {
            content.remove("related_integrations");
        }
        Ok(dict_hash(&Value::Object(content))?)
    }

    // ===================== 查询 =====================

    /// 解析查询；Lucene 与机器学习规则返回 None
    pub fn query_ast(&self, ctx: &CompileContext) -> RuleResult<Option<QueryAst>> {
        let Some(fields) = self.payload.query_fields() else {
            return Ok(None);
        };
        let Some(validator) = validator_for(fields.language, ctx.config().normalize_kql_keywords) else {
            return Ok(None);
        };
        let supported = self.get_supported_version(ctx)?;
        validator.parse(&fields.query, &supported).map(Some)
    }

    /// 查询引用的字段（kuery / eql），升序
    pub fn unique_query_fields(&self, ctx: &CompileContext) -> RuleResult<Vec<String>> {
        if !matches!(self.payload.language(), Some(QueryLanguage::Kuery | QueryLanguage::Eql)) {
            return Ok(Vec::new());
        }
        let Some(fields) = self.payload.query_fields() else {
            return Ok(Vec::new());
        };
        let Some(validator) = validator_for(fields.language, ctx.config().normalize_kql_keywords) else {
            return Ok(Vec::new());
        };
        let ast = validator.parse(&fields.query, &self.get_supported_version(ctx)?)?;
        let referenced = validator.referenced_fields(&ast);
        log::debug!("{} references {}", self.payload, compress_field_set(&referenced, 8));
        Ok(referenced.into_iter().collect())
    }

    /// 已设置的受限字段中，最低版本高于规则声明版本的字段
    pub fn check_restricted_fields_compatibility(
        &self,
        ctx: &CompileContext,
    ) -> RuleResult<BTreeMap<String, IncompatibleField>> {
        let min_stack = self
            .min_stack_version()?
            .unwrap_or_else(|| ctx.config().min_supported_stack_version.clone());
        let serialized = serde_json::to_value(&self.payload)?;
        let present = serialized
            .as_object()
            .into_iter()
            .flatten()
            .filter(|(_, value)| !value.is_null())
            .map(|(name, _)| name.as_str());
        Ok(restricted_fields_for(self.rule_type()).check_compatibility(present, &min_stack))
    }
}

impl EqlRuleData {
    /// 回看窗口（毫秒）：`to - from`；两者都为 0 时无法确定
    pub fn look_back(&self) -> RuleResult<Option<i64>> {
        let to = match self.base.to.as_deref() {
            Some(to) => ruleforge_engine::utils::convert_relative_delta(to)?,
            None => 0,
        };
        let from = ruleforge_engine::utils::convert_relative_delta(self.base.from.as_deref().unwrap_or("now-6m"))?;
        if to == 0 && from == 0 {
            return Ok(None);
        }
        Ok(Some(to - from))
    }

    /// 执行间隔与序列 maxspan 的比值
    pub fn interval_ratio(&self, max_span: Option<i64>) -> RuleResult<Option<f64>> {
        let Some(max_span) = max_span.filter(|span| *span > 0) else {
            return Ok(None);
        };
        let interval = ruleforge_engine::utils::convert_time_span(self.base.interval.as_deref().unwrap_or("5m"))?;
        Ok(Some(interval as f64 / max_span as f64))
    }
}

// ===================== 构造辅助 =====================

fn check_language(payload: &RulePayload) -> RuleResult<()> {
    let Some(language) = payload.language() else {
        return Ok(());
    };
    if payload.allowed_languages().contains(&language) {
        return Ok(());
    }
    Err(RuleError::schema(
        &payload.base().rule_id,
        "language",
        format!("language `{}` is not valid for rule type {}", language, payload.rule_type()),
    ))
}

/// API 形态的 new_terms（`new_terms_fields` + `history_window_start`）折叠为 `new_terms`
fn fold_new_terms(mut rule: Map<String, Value>) -> Map<String, Value> {
    let is_new_terms = rule.get("type").and_then(Value::as_str) == Some(RuleType::NewTerms.as_str());
    if !is_new_terms || !rule.contains_key("new_terms_fields") || !rule.contains_key("history_window_start") {
        return rule;
    }
    let fields = rule.remove("new_terms_fields").unwrap_or(Value::Null);
    let window = rule.remove("history_window_start").unwrap_or(Value::Null);
    rule.insert(
        "new_terms".to_string(),
        serde_json::json!({
            "field": "new_terms_fields",
            "value": fields,
            "history_window_start": [{"field": "history_window_start", "value": window}],
        }),
    );
    rule
}

/// 输入中存在、回写结果中缺失的键即未知字段
fn find_unknown_fields(input: &Value, output: &Value, path: &str, unknown: &mut Vec<String>) {
    match (input, output) {
        (Value::Object(input), Value::Object(output)) => {
            for (key, value) in input {
                let child = join_path(path, key);
                match output.get(key) {
                    Some(out) => find_unknown_fields(value, out, &child, unknown),
                    None => unknown.push(child),
                }
            }
        }
        (Value::Array(input), Value::Array(output)) => {
            for (i, (value, out)) in input.iter().zip(output).enumerate() {
                find_unknown_fields(value, out, &format!("{}[{}]", path, i), unknown);
            }
        }
        _ => {}
    }
}

fn join_path(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", parent, key)
    }
}

/// serde 错误 → 结构错误（尽量还原字段路径）
/// 字段取值约束：日期格式、风险分 0-100、rule_id 为 UUID、max_signals ≥ 1
fn check_field_constraints(metadata: &RuleMeta, payload: &RulePayload) -> RuleResult<()> {
    let base = payload.base();
    let rule_id = base.rule_id.as_str();

    let dates = [
        ("metadata.creation_date", Some(metadata.creation_date.as_str())),
        ("metadata.updated_date", Some(metadata.updated_date.as_str())),
        ("metadata.deprecation_date", metadata.deprecation_date.as_deref()),
    ];
    for (path, value) in dates {
        if let Some(date) = value.filter(|date| !DATE_PATTERN.is_match(date)) {
            return Err(RuleError::schema(
                rule_id,
                path,
                format!("invalid date {:?}, expected YYYY/MM/DD", date),
            ));
        }
    }

    if rule_id.len() != 36 || Uuid::parse_str(rule_id).is_err() {
        return Err(RuleError::schema(rule_id, "rule_id", "rule_id must be a UUID string"));
    }
    if base.risk_score > MAX_RISK_SCORE {
        return Err(RuleError::schema(
            rule_id,
            "risk_score",
            format!("risk_score {} out of range 0-{}", base.risk_score, MAX_RISK_SCORE),
        ));
    }
    if base.max_signals == Some(0) {
        return Err(RuleError::schema(rule_id, "max_signals", "max_signals must be at least 1"));
    }
    Ok(())
}

fn serde_schema_error(rule_id: &str, section: &str, err: &serde_json::Error) -> RuleError {
    let message = err.to_string();
    let field = if message.contains("variant") {
        "type"
    } else {
        message.split('`').nth(1).unwrap_or("")
    };
    let path = match (section.is_empty(), field.is_empty()) {
        (true, true) => "rule".to_string(),
        (true, false) => field.to_string(),
        (false, true) => section.to_string(),
        (false, false) => format!("{}.{}", section, field),
    };
    RuleError::schema(rule_id, path, message)
}
