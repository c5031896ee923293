//! 规则校验流水线
//! 固定顺序执行全部步骤并收集所有错误，不在第一个错误处停止
pub mod timing;

use once_cell::sync::Lazy;
use serde_json::Value;

use ruleforge_engine::utils::convert_time_span;

use crate::error::{RuleError, ValidationReport};
use crate::query::{validator_for, QueryContext};
use crate::rule::model::RulePayload;
use crate::rule::note::validate_note;
use crate::rule::{CompileContext, RuleContents};

/// 单个校验步骤
pub trait ValidationStep: Send + Sync {
    fn name(&self) -> &'static str;

    /// 位于跳过名单中的规则是否跳过本步骤
    fn skippable(&self) -> bool {
        true
    }

    fn check(&self, contents: &RuleContents, ctx: &CompileContext) -> Vec<RuleError>;
}

/// 有序的校验步骤序列
pub struct ValidationPipeline {
    steps: Vec<Box<dyn ValidationStep>>,
}

impl Default for ValidationPipeline {
    fn default() -> Self {
        Self::new()
            .with_step(PayloadFieldRules)
            .with_step(RestrictedFieldCompatibility)
            .with_step(QueryDialect)
            .with_step(NoteHeadings)
            .with_step(BuildingBlockTiming)
    }
}

impl ValidationPipeline {
    /// 空流水线
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    pub fn with_step(mut self, step: impl ValidationStep + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|step| step.name()).collect()
    }

    pub fn run(&self, contents: &RuleContents, ctx: &CompileContext) -> Result<(), ValidationReport> {
        let skip = ctx.config().should_skip_validation(contents.id());
        let mut errors = Vec::new();

        for step in &self.steps {
            if skip && step.skippable() {
                log::debug!("Skipping {} for {}", step.name(), contents.id());
                continue;
            }
            errors.extend(step.check(contents, ctx));
        }

        if errors.is_empty() {
            return Ok(());
        }
        log::debug!("{} failed validation with {} error(s)", contents.id(), errors.len());
        Err(ValidationReport {
            rule_id: contents.id().to_string(),
            errors,
        })
    }
}

pub(crate) static DEFAULT_PIPELINE: Lazy<ValidationPipeline> = Lazy::new(ValidationPipeline::default);

/// 使用默认流水线校验单条规则
pub fn validate_rule(contents: &RuleContents, ctx: &CompileContext) -> Result<(), ValidationReport> {
    DEFAULT_PIPELINE.run(contents, ctx)
}

// ===================== 内置步骤 =====================

/// 负载字段约束：index 与 data_view_id 互斥；启用版本锁时规则不得自带 version / revision
pub struct PayloadFieldRules;

impl ValidationStep for PayloadFieldRules {
    fn name(&self) -> &'static str {
        "payload-fields"
    }

    fn skippable(&self) -> bool {
        false
    }

    fn check(&self, contents: &RuleContents, ctx: &CompileContext) -> Vec<RuleError> {
        let mut errors = Vec::new();
        let payload = contents.payload();

        if let Some(fields) = payload.query_fields() {
            if fields.index.is_some() && fields.data_view_id.is_some() {
                errors.push(RuleError::structural(
                    contents.id(),
                    "index and data_view_id cannot both be set",
                ));
            }
        }

        let base = payload.base();
        if !ctx.is_lock_bypassed() && (base.version.is_some() || base.revision.is_some()) {
            errors.push(RuleError::structural(
                contents.id(),
                format!(
                    "Rule {} - {} should not contain `version` or `revision` while the version lock is in use",
                    contents.name(),
                    contents.id()
                ),
            ));
        }
        errors
    }
}

/// 已设置的受限字段不得高于规则声明的最低版本
pub struct RestrictedFieldCompatibility;

impl ValidationStep for RestrictedFieldCompatibility {
    fn name(&self) -> &'static str {
        "restricted-fields"
    }

    fn skippable(&self) -> bool {
        false
    }

    fn check(&self, contents: &RuleContents, ctx: &CompileContext) -> Vec<RuleError> {
        match contents.check_restricted_fields_compatibility(ctx) {
            Ok(invalid) => invalid
                .into_iter()
                .map(|(field, detail)| {
                    RuleError::structural(
                        contents.id(),
                        format!(
                            "field `{}` requires stack {} but the rule declares min_stack_version {}",
                            field, detail.min_allowed_version, detail.min_stack_version
                        ),
                    )
                })
                .collect(),
            Err(err) => vec![err],
        }
    }
}

/// 方言查询校验（含 threat_query 交叉校验与告警抑制时长检查）
pub struct QueryDialect;

impl ValidationStep for QueryDialect {
    fn name(&self) -> &'static str {
        "query-dialect"
    }

    fn check(&self, contents: &RuleContents, ctx: &CompileContext) -> Vec<RuleError> {
        let mut errors = Vec::new();
        let payload = contents.payload();
        let Some(fields) = payload.query_fields() else {
            return errors;
        };
        let min_stack = match contents.get_supported_version(ctx) {
            Ok(version) => version,
            Err(err) => return vec![err],
        };
        let query_ctx = QueryContext {
            rule_id: contents.id(),
            rule_name: contents.name(),
            index: fields.index.as_deref(),
            min_stack: &min_stack,
        };
        let normalize = ctx.config().normalize_kql_keywords;

        let ast = validator_for(fields.language, normalize).and_then(|validator| {
            validator
                .validate(&fields.query, &query_ctx)
                .map_err(|err| errors.push(err))
                .ok()
        });

        if let (RulePayload::Eql(data), Some(ast)) = (payload, ast.as_ref()) {
            if let Some(err) = check_suppression_window(contents.id(), data.query.alert_suppression.as_ref(), ast.max_span()) {
                errors.push(err);
            }
        }

        if let RulePayload::ThreatMatch(data) = payload {
            if let Some(threat_query) = data.threat_query.as_deref() {
                match data.threat_language {
                    None => errors.push(RuleError::structural(
                        contents.id(),
                        "threat_language is required when threat_query is set",
                    )),
                    Some(language) => {
                        let threat_ctx = QueryContext { index: None, ..query_ctx };
                        if let Some(validator) = validator_for(language, normalize) {
                            if let Err(err) = validator.validate(threat_query, &threat_ctx) {
                                errors.push(err);
                            }
                        }
                    }
                }
            }
        }
        errors
    }
}

/// 告警抑制时长不能短于序列的 maxspan
fn check_suppression_window(rule_id: &str, suppression: Option<&Value>, max_span: Option<i64>) -> Option<RuleError> {
    let max_span = max_span?;
    let duration = suppression?.get("duration")?;
    let value = duration.get("value")?.as_u64()?;
    let unit = duration.get("unit")?.as_str()?;
    let span = format!("{}{}", value, unit);

    match convert_time_span(&span) {
        Ok(ms) if ms < max_span => Some(RuleError::structural(
            rule_id,
            format!(
                "alert suppression duration {} is shorter than the sequence maxspan ({} ms)",
                span, max_span
            ),
        )),
        Ok(_) => None,
        Err(err) => Some(RuleError::structural(
            rule_id,
            format!("invalid alert suppression duration: {}", err),
        )),
    }
}

/// note 标题约束
pub struct NoteHeadings;

impl ValidationStep for NoteHeadings {
    fn name(&self) -> &'static str {
        "note"
    }

    fn check(&self, contents: &RuleContents, ctx: &CompileContext) -> Vec<RuleError> {
        if ctx.config().bypass_note_validation {
            return Vec::new();
        }
        let base = contents.payload().base();
        let Some(note) = base.note.as_deref() else {
            return Vec::new();
        };
        validate_note(note, base.setup.as_deref())
            .into_iter()
            .map(|message| RuleError::structural(contents.id(), message))
            .collect()
    }
}

/// building block 时间窗口
pub struct BuildingBlockTiming;

impl ValidationStep for BuildingBlockTiming {
    fn name(&self) -> &'static str {
        "building-block-timing"
    }

    fn check(&self, contents: &RuleContents, ctx: &CompileContext) -> Vec<RuleError> {
        let bypass = ctx.config().bypass_bbr_timing || contents.metadata().bypass_bbr_timing == Some(true);
        let base = contents.payload().base();
        if bypass || base.building_block_type.is_none() || !contents.rule_type().is_query_bearing() {
            return Vec::new();
        }
        timing::validate_building_block(
            contents.id(),
            contents.name(),
            base.from.as_deref(),
            base.interval.as_deref(),
        )
        .err()
        .into_iter()
        .collect()
    }
}
