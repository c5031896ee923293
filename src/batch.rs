//! 批量编译：校验 → 写版本锁 → 生成编译产物
//! 规则之间互不依赖，按工作线程并行；同一 rule_id 的锁更新由锁存储串行化

use rustc_hash::FxHashSet;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;

use ruleforge_engine::LockOutcome;

use crate::error::{RuleError, RuleResult, ValidationReport};
use crate::rule::{CompileContext, RuleContents};
use crate::validation::{ValidationPipeline, DEFAULT_PIPELINE};

/// 单条规则失败时的批处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorPolicy {
    /// 收集错误，继续编译其余规则
    #[default]
    ContinueOnError,
    /// 第一个失败即停止派发
    AbortOnError,
}

/// 单条规则的编译结果
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledRule {
    pub rule_id: String,
    pub sha256: String,
    pub version: Option<u32>,
    pub lock: Option<LockOutcome>,
    pub payload: Map<String, Value>,
}

/// 批量编译汇总（按 rule_id 升序）
#[derive(Debug, Default)]
pub struct BatchReport {
    pub compiled: BTreeMap<String, CompiledRule>,
    pub failures: BTreeMap<String, ValidationReport>,
    /// AbortOnError 下是否提前停止
    pub aborted: bool,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && !self.aborted
    }
}

/// 编译单条规则（默认校验流水线）
pub fn compile_rule(contents: &RuleContents, ctx: &CompileContext) -> Result<CompiledRule, ValidationReport> {
    compile_rule_with(contents, ctx, &DEFAULT_PIPELINE)
}

/// 使用指定流水线编译单条规则
pub fn compile_rule_with(
    contents: &RuleContents,
    ctx: &CompileContext,
    pipeline: &ValidationPipeline,
) -> Result<CompiledRule, ValidationReport> {
    pipeline.run(contents, ctx)?;
    let as_report = |err: RuleError| ValidationReport {
        rule_id: contents.id().to_string(),
        errors: vec![err],
    };

    let lock = if ctx.is_lock_bypassed() {
        None
    } else {
        Some(contents.record_lock(ctx).map_err(as_report)?)
    };
    let payload = contents
        .to_api_format(ctx, !ctx.is_lock_bypassed(), false)
        .map_err(as_report)?;
    let sha256 = contents.hash(ctx, false, false).map_err(as_report)?;

    Ok(CompiledRule {
        rule_id: contents.id().to_string(),
        sha256,
        version: payload.get("version").and_then(Value::as_u64).map(|v| v as u32),
        lock,
        payload,
    })
}

/// 并行编译一批规则（默认流水线、按 CPU 数量派发）；配置错误总是终止整批并返回 Err
pub fn compile_batch(rules: &[RuleContents], ctx: &CompileContext, policy: ErrorPolicy) -> RuleResult<BatchReport> {
    BatchCompiler::new().policy(policy).compile(rules, ctx)
}

/// 批量编译器（链式配置）
pub struct BatchCompiler<'p> {
    pipeline: &'p ValidationPipeline,
    policy: ErrorPolicy,
    workers: Option<usize>,
}

impl Default for BatchCompiler<'static> {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchCompiler<'static> {
    pub fn new() -> Self {
        Self {
            pipeline: &DEFAULT_PIPELINE,
            policy: ErrorPolicy::default(),
            workers: None,
        }
    }
}

impl<'p> BatchCompiler<'p> {
    /// 替换校验流水线
    pub fn pipeline<'q>(self, pipeline: &'q ValidationPipeline) -> BatchCompiler<'q> {
        BatchCompiler {
            pipeline,
            policy: self.policy,
            workers: self.workers,
        }
    }

    pub fn policy(mut self, policy: ErrorPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// 工作线程数；未设置时取 available_parallelism
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers.max(1));
        self
    }

    pub fn compile(&self, rules: &[RuleContents], ctx: &CompileContext) -> RuleResult<BatchReport> {
        let mut report = BatchReport::default();
        let duplicates = duplicate_positions(rules);

        let next = AtomicUsize::new(0);
        let stop = AtomicBool::new(false);
        let fatal: Mutex<Option<RuleError>> = Mutex::new(None);
        let results: Mutex<Vec<Result<CompiledRule, ValidationReport>>> = Mutex::new(Vec::with_capacity(rules.len()));

        let workers = self
            .workers
            .unwrap_or_else(|| thread::available_parallelism().map(|n| n.get()).unwrap_or(1))
            .min(rules.len())
            .max(1);
        log::info!("Compiling {} rule(s) with {} worker(s)", rules.len(), workers);

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    if stop.load(Ordering::Acquire) {
                        break;
                    }
                    let index = next.fetch_add(1, Ordering::AcqRel);
                    let Some(contents) = rules.get(index) else {
                        break;
                    };

                    let mut result = if duplicates.contains(&index) {
                        Err(ValidationReport {
                            rule_id: contents.id().to_string(),
                            errors: vec![RuleError::schema(contents.id(), "rule_id", "duplicate rule_id in batch")],
                        })
                    } else {
                        compile_rule_with(contents, ctx, self.pipeline)
                    };

                    if let Err(failure) = &mut result {
                        if let Some(position) = failure.errors.iter().position(RuleError::is_fatal_for_batch) {
                            let config_error = failure.errors.remove(position);
                            if let Ok(mut slot) = fatal.lock() {
                                slot.get_or_insert(config_error);
                            }
                            stop.store(true, Ordering::Release);
                        } else if self.policy == ErrorPolicy::AbortOnError {
                            stop.store(true, Ordering::Release);
                        }
                    }
                    if let Ok(mut collected) = results.lock() {
                        collected.push(result);
                    }
                });
            }
        });

        if let Some(err) = fatal.into_inner().ok().flatten() {
            log::error!("Batch compilation aborted: {}", err);
            return Err(err);
        }

        for result in results.into_inner().unwrap_or_default() {
            match result {
                Ok(compiled) => {
                    report.compiled.insert(compiled.rule_id.clone(), compiled);
                }
                Err(failure) => {
                    log::warn!("{}", failure);
                    // 重复 rule_id 不覆盖首次出现的结果
                    report.failures.entry(failure.rule_id.clone()).or_insert(failure);
                }
            }
        }
        report.aborted = stop.into_inner();
        log::info!(
            "Compiled {} rule(s), {} failure(s)",
            report.compiled.len(),
            report.failures.len()
        );
        Ok(report)
    }
}

/// 第二次及之后出现的 rule_id 所在位置
fn duplicate_positions(rules: &[RuleContents]) -> FxHashSet<usize> {
    let mut seen = FxHashSet::default();
    rules
        .iter()
        .enumerate()
        .filter(|(_, rule)| !seen.insert(rule.id()))
        .map(|(index, _)| index)
        .collect()
}
