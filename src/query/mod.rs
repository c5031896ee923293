//! 查询校验：按方言解析查询文本，提取引用字段，执行方言约束
mod eql;
mod esql;
mod kql;
pub mod lexer;

pub use eql::{EqlFeature, EqlValidator};
pub use esql::EsqlValidator;
pub use kql::KqlValidator;

use std::collections::BTreeSet;

use ruleforge_engine::{QueryLanguage, StackVersion};

use crate::error::RuleResult;

/// 查询形态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    /// 单事件查询
    Single,
    Sample,
    /// 序列查询，max_span 为毫秒
    Sequence { max_span: Option<i64> },
    /// 聚合类（ESQL stats ... by）
    Aggregation,
}

/// `field <op> literal` 比较
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldComparison {
    pub field: String,
    pub value: String,
}

/// 解析结果（只保留编排层需要的部分）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryAst {
    pub dialect: QueryLanguage,
    pub kind: QueryKind,
    pub fields: BTreeSet<String>,
    pub comparisons: Vec<FieldComparison>,
}

impl QueryAst {
    pub fn new(dialect: QueryLanguage) -> Self {
        Self {
            dialect,
            kind: QueryKind::Single,
            fields: BTreeSet::new(),
            comparisons: Vec::new(),
        }
    }

    pub fn max_span(&self) -> Option<i64> {
        match self.kind {
            QueryKind::Sequence { max_span } => max_span,
            _ => None,
        }
    }

    /// 指定字段的全部比较取值（去重升序）
    pub fn values_of(&self, field: &str) -> Vec<String> {
        self.comparisons
            .iter()
            .filter(|c| c.field == field)
            .map(|c| c.value.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// `event.dataset` 与 `event.module` 的取值
    pub fn datasets_and_modules(&self) -> (Vec<String>, Vec<String>) {
        (self.values_of("event.dataset"), self.values_of("event.module"))
    }

    pub(crate) fn add_field(&mut self, field: &str) {
        self.fields.insert(field.trim_start_matches('?').to_string());
    }

    pub(crate) fn add_comparison(&mut self, field: &str, value: &str) {
        self.comparisons.push(FieldComparison {
            field: field.trim_start_matches('?').to_string(),
            value: value.to_string(),
        });
    }
}

/// 校验所需的规则上下文
#[derive(Debug, Clone, Copy)]
pub struct QueryContext<'a> {
    pub rule_id: &'a str,
    pub rule_name: &'a str,
    pub index: Option<&'a [String]>,
    /// 规则声明的最低平台版本（决定 EQL 可用特性）
    pub min_stack: &'a StackVersion,
}

/// 方言校验器
pub trait QueryValidator: Send + Sync {
    fn dialect(&self) -> QueryLanguage;

    /// 解析查询，失败为语法错误
    fn parse(&self, query: &str, min_stack: &StackVersion) -> RuleResult<QueryAst>;

    fn referenced_fields(&self, ast: &QueryAst) -> BTreeSet<String> {
        ast.fields.clone()
    }

    /// 解析并执行方言约束
    fn validate(&self, query: &str, ctx: &QueryContext<'_>) -> RuleResult<QueryAst> {
        self.parse(query, ctx.min_stack)
    }
}

/// 按查询语言选择校验器；lucene 不做校验
pub fn validator_for(language: QueryLanguage, normalize_kql_keywords: bool) -> Option<Box<dyn QueryValidator>> {
    match language {
        QueryLanguage::Kuery => Some(Box::new(KqlValidator::new(normalize_kql_keywords))),
        QueryLanguage::Eql => Some(Box::new(EqlValidator::new())),
        QueryLanguage::Esql => Some(Box::new(EsqlValidator::new())),
        QueryLanguage::Lucene => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datasets_and_modules() {
        let ast = KqlValidator::new(true)
            .parse(
                "event.dataset:(aws.cloudtrail or okta.system) and event.module:aws and event.dataset:aws.cloudtrail",
                &StackVersion::new(8, 14, 0),
            )
            .unwrap();
        let (datasets, modules) = ast.datasets_and_modules();
        assert_eq!(datasets, vec!["aws.cloudtrail".to_string(), "okta.system".to_string()]);
        assert_eq!(modules, vec!["aws".to_string()]);
    }

    #[test]
    fn test_lucene_has_no_validator() {
        assert!(validator_for(QueryLanguage::Lucene, true).is_none());
        assert_eq!(validator_for(QueryLanguage::Eql, true).unwrap().dialect(), QueryLanguage::Eql);
    }
}
