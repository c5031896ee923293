//! ES|QL：聚合 / 分析查询
//! 非聚合查询必须带 `metadata _id, _version, _index`；必须带 `| keep`；规则不得声明 index

use once_cell::sync::Lazy;
use regex::Regex;

use ruleforge_engine::utils::preview_compact;
use ruleforge_engine::{QueryLanguage, StackVersion};

use super::lexer::syntax_error;
use super::{QueryAst, QueryContext, QueryKind, QueryValidator};
use crate::error::{RuleError, RuleResult};

static METADATA_OR_AGGREGATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)(from\s+\S+\s+metadata\s+_id,\s*_version,\s*_index)|(\bstats\b.*?\bby\b)")
        .expect("esql structure pattern is valid")
});

static AGGREGATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\bstats\b.*?\bby\b").expect("esql stats pattern is valid"));

const SOURCE_COMMANDS: &[&str] = &["from", "row", "show", "metrics"];
const KEEP_CLAUSE: &str = "| keep";

#[derive(Debug, Clone, Copy, Default)]
pub struct EsqlValidator;

impl EsqlValidator {
    pub fn new() -> Self {
        Self
    }
}

impl QueryValidator for EsqlValidator {
    fn dialect(&self) -> QueryLanguage {
        QueryLanguage::Esql
    }

    /// 只校验管道结构：首个命令必须是数据源命令，管道段不能为空
    fn parse(&self, query: &str, _min_stack: &StackVersion) -> RuleResult<QueryAst> {
        let trimmed = query.trim();
        if trimmed.is_empty() {
            return Err(syntax_error(QueryLanguage::Esql, "empty query", 1, 1));
        }

        let mut offset = 0;
        for (idx, segment) in query.split('|').enumerate() {
            let command = segment.split_whitespace().next();
            let (line, column) = line_column(query, offset + segment.len() - segment.trim_start().len());
            match command {
                None => return Err(syntax_error(QueryLanguage::Esql, "empty pipe segment", line, column)),
                Some(cmd) if idx == 0 && !SOURCE_COMMANDS.iter().any(|s| cmd.eq_ignore_ascii_case(s)) => {
                    return Err(syntax_error(
                        QueryLanguage::Esql,
                        &format!("query must start with a source command, found `{}`", cmd),
                        line,
                        column,
                    ));
                }
                _ => {}
            }
            offset += segment.len() + 1;
        }

        let mut ast = QueryAst::new(QueryLanguage::Esql);
        if AGGREGATION.is_match(&query.to_lowercase()) {
            ast.kind = QueryKind::Aggregation;
        }
        Ok(ast)
    }

    fn validate(&self, query: &str, ctx: &QueryContext<'_>) -> RuleResult<QueryAst> {
        if ctx.index.map_or(false, |index| !index.is_empty()) {
            return Err(RuleError::structural(
                ctx.rule_id,
                "index is not a valid field for ES|QL rule type",
            ));
        }

        let ast = self.parse(query, ctx.min_stack)?;
        let lowered = query.to_lowercase();

        if !METADATA_OR_AGGREGATION.is_match(&lowered) {
            log::debug!("ES|QL query without metadata: {}", preview_compact(query, 120));
            return Err(RuleError::structural(
                ctx.rule_id,
                format!(
                    "Rule: {} contains a non-aggregate query without metadata fields '_id', '_version', and '_index' -> \
                     Add 'metadata _id, _version, _index' to the from command or add an aggregate function.",
                    ctx.rule_name
                ),
            ));
        }

        if !lowered.contains(KEEP_CLAUSE) {
            return Err(RuleError::structural(
                ctx.rule_id,
                format!(
                    "Rule: {} does not contain a 'keep' command -> Add a 'keep' command to the query.",
                    ctx.rule_name
                ),
            ));
        }

        Ok(ast)
    }
}

fn line_column(text: &str, byte_offset: usize) -> (usize, usize) {
    let before = &text[..byte_offset.min(text.len())];
    let line = before.matches('\n').count() + 1;
    let column = before.rsplit('\n').next().map_or(0, |l| l.chars().count()) + 1;
    (line, column)
}
