//! EQL：事件关联查询
//! 区分单事件 / sample / sequence；仅 sequence 提取 maxspan；部分语法特性受平台版本门控

use ruleforge_engine::utils::convert_time_span;
use ruleforge_engine::{QueryLanguage, StackVersion};

use super::lexer::{syntax_error, tokenize, Token, TokenKind};
use super::{QueryAst, QueryKind, QueryValidator};
use crate::error::{RuleError, RuleResult};

/// 受平台版本门控的 EQL 语法特性
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EqlFeature {
    /// `sample by ...`
    Sample,
    /// 子查询 `with runs=N`
    Runs,
    /// 可选字段 `?field`
    OptionalFields,
}

impl EqlFeature {
    pub fn min_stack(&self) -> StackVersion {
        match self {
            EqlFeature::Sample => StackVersion::new(8, 6, 0),
            EqlFeature::Runs => StackVersion::new(8, 7, 0),
            EqlFeature::OptionalFields => StackVersion::new(7, 16, 0),
        }
    }

    pub fn is_enabled(&self, stack: &StackVersion) -> bool {
        &self.min_stack() <= stack
    }

    fn describe(&self) -> &'static str {
        match self {
            EqlFeature::Sample => "sample queries",
            EqlFeature::Runs => "`runs` in sequence subqueries",
            EqlFeature::OptionalFields => "optional `?` fields",
        }
    }
}

const KEYWORDS: &[&str] = &[
    "and", "or", "not", "where", "by", "with", "until", "sequence", "sample", "in", "like", "regex", "true",
    "false", "null",
];

#[derive(Debug, Clone, Copy, Default)]
pub struct EqlValidator;

impl EqlValidator {
    pub fn new() -> Self {
        Self
    }
}

impl QueryValidator for EqlValidator {
    fn dialect(&self) -> QueryLanguage {
        QueryLanguage::Eql
    }

    fn parse(&self, query: &str, min_stack: &StackVersion) -> RuleResult<QueryAst> {
        let tokens = tokenize(query, QueryLanguage::Eql)?;
        if tokens.is_empty() {
            return Err(syntax_error(QueryLanguage::Eql, "empty query", 1, 1));
        }

        let mut parser = EqlParser {
            tokens: &tokens,
            pos: 0,
            stack: min_stack,
            ast: QueryAst::new(QueryLanguage::Eql),
        };
        parser.query()?;
        Ok(parser.ast)
    }
}

/// 比较运算的操作数
enum Operand {
    Field(String),
    Literal(String),
    Expression,
}

struct EqlParser<'t> {
    tokens: &'t [Token],
    pos: usize,
    stack: &'t StackVersion,
    ast: QueryAst,
}

impl<'t> EqlParser<'t> {
    fn peek(&self) -> Option<&'t Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<&'t Token> {
        let token = self.tokens.get(self.pos)?;
        self.pos += 1;
        Some(token)
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        self.peek().map_or(false, |t| t.is_keyword(keyword))
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.peek_keyword(keyword) {
            self.pos += 1;
            return true;
        }
        false
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.peek().map_or(false, |t| t.kind == kind) {
            self.pos += 1;
            return true;
        }
        false
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> RuleResult<&'t Token> {
        match self.next() {
            Some(token) if token.kind == kind => Ok(token),
            Some(token) => Err(self.error_at(token, &format!("expected {} but found `{}`", what, token.text))),
            None => Err(self.end_of_input(what)),
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> RuleResult<()> {
        match self.next() {
            Some(token) if token.is_keyword(keyword) => Ok(()),
            Some(token) => Err(self.error_at(token, &format!("expected `{}` but found `{}`", keyword, token.text))),
            None => Err(self.end_of_input(&format!("`{}`", keyword))),
        }
    }

    fn error_at(&self, token: &Token, message: &str) -> RuleError {
        syntax_error(QueryLanguage::Eql, message, token.line, token.column)
    }

    fn end_of_input(&self, what: &str) -> RuleError {
        let (line, column) = self
            .tokens
            .last()
            .map_or((1, 1), |t| (t.line, t.column + t.text.chars().count()));
        syntax_error(QueryLanguage::Eql, &format!("expected {} at end of query", what), line, column)
    }

    fn require(&self, feature: EqlFeature, token: &Token) -> RuleResult<()> {
        if feature.is_enabled(self.stack) {
            return Ok(());
        }
        Err(self.error_at(
            token,
            &format!(
                "{} require stack version {} or later (rule targets {})",
                feature.describe(),
                feature.min_stack().major_minor(),
                self.stack.major_minor()
            ),
        ))
    }

    // ===== 顶层结构 =====

    fn query(&mut self) -> RuleResult<()> {
        let Some(first) = self.peek() else {
            return Err(self.end_of_input("query"));
        };

        if first.is_keyword("sequence") {
            self.pos += 1;
            self.sequence()?;
        } else if first.is_keyword("sample") {
            self.require(EqlFeature::Sample, first)?;
            self.pos += 1;
            self.sample()?;
        } else {
            self.event_query()?;
        }

        self.pipes()?;
        match self.peek() {
            Some(token) => Err(self.error_at(token, &format!("unexpected `{}`", token.text))),
            None => Ok(()),
        }
    }

    fn sequence(&mut self) -> RuleResult<()> {
        let mut max_span = None;
        if self.eat_keyword("by") {
            self.by_fields()?;
        }
        if self.eat_keyword("with") {
            max_span = Some(self.max_span()?);
        }
        // `sequence with maxspan=... by ...` 同样合法
        if self.eat_keyword("by") {
            self.by_fields()?;
        }

        let mut subqueries = 0;
        while self.peek().map_or(false, |t| t.kind == TokenKind::LBracket) {
            self.subquery(true)?;
            subqueries += 1;
        }
        if subqueries < 2 && !(subqueries == 1 && self.has_runs_before()) {
            return Err(self.end_of_input_or_here("at least two sequence subqueries"));
        }
        if self.eat_keyword("until") {
            self.subquery(false)?;
        }

        self.ast.kind = QueryKind::Sequence { max_span };
        Ok(())
    }

    fn sample(&mut self) -> RuleResult<()> {
        if self.eat_keyword("by") {
            self.by_fields()?;
        }
        let mut subqueries = 0;
        while self.peek().map_or(false, |t| t.kind == TokenKind::LBracket) {
            self.subquery(false)?;
            subqueries += 1;
        }
        if subqueries == 0 {
            return Err(self.end_of_input_or_here("sample subquery"));
        }
        self.ast.kind = QueryKind::Sample;
        Ok(())
    }

    fn max_span(&mut self) -> RuleResult<i64> {
        self.expect_keyword("maxspan")?;
        let op = self.expect(TokenKind::Op, "`=`")?;
        if op.text != "=" {
            return Err(self.error_at(op, "expected `=` after maxspan"));
        }
        let span = self.expect(TokenKind::Number, "time span")?;
        convert_time_span(&span.text).map_err(|_| self.error_at(span, &format!("invalid maxspan `{}`", span.text)))
    }

    fn subquery(&mut self, allow_runs: bool) -> RuleResult<()> {
        self.expect(TokenKind::LBracket, "`[`")?;
        self.event_query()?;
        self.expect(TokenKind::RBracket, "`]`")?;

        if self.eat_keyword("by") {
            self.by_fields()?;
        }
        if allow_runs && self.peek_keyword("with") {
            let with = self.next();
            let runs = self.expect(TokenKind::Word, "`runs`")?;
            if !runs.is_keyword("runs") {
                return Err(self.error_at(runs, "expected `runs`"));
            }
            if let Some(token) = with {
                self.require(EqlFeature::Runs, token)?;
            }
            let op = self.expect(TokenKind::Op, "`=`")?;
            if op.text != "=" {
                return Err(self.error_at(op, "expected `=` after runs"));
            }
            let count = self.expect(TokenKind::Number, "run count")?;
            if count.text.parse::<u32>().map_or(true, |n| n == 0) {
                return Err(self.error_at(count, "runs must be a positive integer"));
            }
        }
        Ok(())
    }

    /// 最近一个子查询是否带 `runs`（单子查询 + runs 视为合法序列）
    fn has_runs_before(&self) -> bool {
        self.tokens[..self.pos].iter().rev().take(4).any(|t| t.is_keyword("runs"))
    }

    fn end_of_input_or_here(&self, what: &str) -> RuleError {
        match self.peek() {
            Some(token) => self.error_at(token, &format!("expected {}", what)),
            None => self.end_of_input(what),
        }
    }

    fn event_query(&mut self) -> RuleResult<()> {
        let category = self.next().ok_or_else(|| self.end_of_input("event category"))?;
        match category.kind {
            TokenKind::Word | TokenKind::Str if !KEYWORDS.iter().any(|kw| category.is_keyword(kw)) => {}
            _ => return Err(self.error_at(category, &format!("invalid event category `{}`", category.text))),
        }
        self.expect_keyword("where")?;
        self.expr()
    }

    fn by_fields(&mut self) -> RuleResult<()> {
        loop {
            match self.operand()? {
                Operand::Field(_) | Operand::Expression => {}
                Operand::Literal(value) => {
                    let token = &self.tokens[self.pos - 1];
                    return Err(self.error_at(token, &format!("expected join field but found `{}`", value)));
                }
            }
            if !self.eat(TokenKind::Comma) {
                return Ok(());
            }
        }
    }

    fn pipes(&mut self) -> RuleResult<()> {
        while self.eat(TokenKind::Pipe) {
            let name = self.expect(TokenKind::Word, "pipe name")?;
            match name.text.to_ascii_lowercase().as_str() {
                "head" | "tail" => {
                    self.expect(TokenKind::Number, "count")?;
                }
                "filter" | "where" => self.expr()?,
                "unique" | "unique_count" | "count" | "sort" => {
                    if self.peek().map_or(false, |t| t.kind != TokenKind::Pipe) {
                        self.by_fields()?;
                    }
                }
                other => return Err(self.error_at(name, &format!("unknown pipe `{}`", other))),
            }
        }
        Ok(())
    }

    // ===== 表达式 =====

    fn expr(&mut self) -> RuleResult<()> {
        self.and_expr()?;
        while self.eat_keyword("or") {
            self.and_expr()?;
        }
        Ok(())
    }

    fn and_expr(&mut self) -> RuleResult<()> {
        self.not_expr()?;
        while self.eat_keyword("and") {
            self.not_expr()?;
        }
        Ok(())
    }

    fn not_expr(&mut self) -> RuleResult<()> {
        if self.eat_keyword("not") {
            return self.not_expr();
        }
        self.comparison()
    }

    fn comparison(&mut self) -> RuleResult<()> {
        let left = self.operand()?;

        // `field not in (...)`
        let negated_set = self.peek_keyword("not")
            && self
                .tokens
                .get(self.pos + 1)
                .map_or(false, |t| t.is_keyword("in") || t.is_keyword("like") || t.is_keyword("regex"));
        if negated_set {
            self.pos += 1;
        }

        let Some(token) = self.peek() else {
            return Ok(());
        };

        if token.kind == TokenKind::Op {
            self.pos += 1;
            if token.text == "~" {
                return Err(self.error_at(token, "unexpected `~`"));
            }
            if token.text == ":" && self.peek().map_or(false, |t| t.kind == TokenKind::LParen) {
                return self.literal_set(&left);
            }
            let right = self.operand()?;
            self.record(&left, &right);
            return Ok(());
        }

        if token.is_keyword("in") || token.is_keyword("like") || token.is_keyword("regex") {
            self.pos += 1;
            // 大小写不敏感变体 `in~` / `like~` / `regex~`
            if self.peek().map_or(false, |t| t.is(TokenKind::Op, "~")) {
                self.pos += 1;
            }
            if self.peek().map_or(false, |t| t.kind == TokenKind::LParen) {
                return self.literal_set(&left);
            }
            let right = self.operand()?;
            self.record(&left, &right);
            return Ok(());
        }

        if negated_set {
            return Err(self.error_at(token, "expected `in`, `like` or `regex` after `not`"));
        }
        Ok(())
    }

    fn literal_set(&mut self, left: &Operand) -> RuleResult<()> {
        self.expect(TokenKind::LParen, "`(`")?;
        loop {
            let item = self.operand()?;
            self.record(left, &item);
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RParen, "`)`")?;
        Ok(())
    }

    fn record(&mut self, left: &Operand, right: &Operand) {
        match (left, right) {
            (Operand::Field(field), Operand::Literal(value)) | (Operand::Literal(value), Operand::Field(field)) => {
                self.ast.add_comparison(field, value);
            }
            _ => {}
        }
    }

    /// 操作数，允许算术运算链（`a + 1`、`length(x) * 2`）
    fn operand(&mut self) -> RuleResult<Operand> {
        let first = self.primary()?;
        let mut arithmetic = false;
        while self.eat(TokenKind::Arith) {
            self.primary()?;
            arithmetic = true;
        }
        Ok(if arithmetic { Operand::Expression } else { first })
    }

    fn primary(&mut self) -> RuleResult<Operand> {
        let token = self.next().ok_or_else(|| self.end_of_input("operand"))?;
        match token.kind {
            TokenKind::Str | TokenKind::Number => Ok(Operand::Literal(token.text.clone())),
            TokenKind::LParen => {
                self.expr()?;
                self.expect(TokenKind::RParen, "`)`")?;
                Ok(Operand::Expression)
            }
            TokenKind::Word => {
                if ["true", "false", "null"].iter().any(|kw| token.is_keyword(kw)) || token.text.parse::<f64>().is_ok() {
                    return Ok(Operand::Literal(token.text.clone()));
                }
                if KEYWORDS.iter().any(|kw| token.is_keyword(kw)) {
                    return Err(self.error_at(token, &format!("unexpected keyword `{}`", token.text)));
                }
                // 函数调用；`name~(...)` 为大小写不敏感变体
                let insensitive = self.peek().map_or(false, |t| t.is(TokenKind::Op, "~"))
                    && self.tokens.get(self.pos + 1).map_or(false, |t| t.kind == TokenKind::LParen);
                if insensitive {
                    self.pos += 1;
                }
                if self.eat(TokenKind::LParen) {
                    if !self.eat(TokenKind::RParen) {
                        loop {
                            self.expr()?;
                            if !self.eat(TokenKind::Comma) {
                                break;
                            }
                        }
                        self.expect(TokenKind::RParen, "`)`")?;
                    }
                    return Ok(Operand::Expression);
                }
                if token.text.starts_with('?') {
                    self.require(EqlFeature::OptionalFields, token)?;
                }
                self.ast.add_field(&token.text);
                Ok(Operand::Field(token.text.trim_start_matches('?').to_string()))
            }
            _ => Err(self.error_at(token, &format!("unexpected `{}`", token.text))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_at(query: &str, stack: (u64, u64)) -> RuleResult<QueryAst> {
        EqlValidator::new().parse(query, &StackVersion::new(stack.0, stack.1, 0))
    }

    fn parse(query: &str) -> RuleResult<QueryAst> {
        parse_at(query, (8, 14))
    }

    #[test]
    fn test_single_event() {
        let ast = parse(r#"process where host.os.type == "windows" and process.name : ("cmd.exe", "pwsh.exe") and not startsWith(process.args, "-e")"#).unwrap();
        assert_eq!(ast.kind, QueryKind::Single);
        assert!(ast.fields.contains("host.os.type"));
        assert!(ast.fields.contains("process.args"));
        assert_eq!(ast.values_of("process.name"), vec!["cmd.exe".to_string(), "pwsh.exe".to_string()]);
        assert_eq!(ast.max_span(), None);
    }

    #[test]
    fn test_sequence_max_span() {
        let ast = parse(
            r#"sequence by host.id with maxspan=30s
                 [process where event.type == "start"]
                 [network where destination.port in (443, 8443)]
               until [process where event.type == "end"]"#,
        )
        .unwrap();
        assert_eq!(ast.kind, QueryKind::Sequence { max_span: Some(30_000) });
        assert!(ast.fields.contains("host.id"));
        assert!(ast.fields.contains("destination.port"));
    }

    #[test]
    fn test_arithmetic_operands() {
        let ast = parse("process where length(process.command_line) > 100 * 2").unwrap();
        assert!(ast.fields.contains("process.command_line"));

        let ast = parse("network where destination.port - 1 == source.port % 2 and process.pid + 1 > 4").unwrap();
        assert!(ast.fields.contains("destination.port"));
        assert!(ast.fields.contains("source.port"));
        assert!(ast.fields.contains("process.pid"));

        assert!(parse("process where process.pid > 1 *").is_err());
    }

    #[test]
    fn test_case_insensitive_function_call() {
        let ast = parse(r#"process where startsWith~(process.name, "a") and endsWith~(process.executable, "b.exe")"#).unwrap();
        assert!(ast.fields.contains("process.name"));
        assert!(ast.fields.contains("process.executable"));

        // `~` 只能紧跟函数名或 in / like / regex
        assert!(parse(r#"process where process.name ~ "a""#).is_err());
    }

    #[test]
    fn test_sequence_without_max_span() {
        let ast = parse("sequence [process where true] [file where true] | head 5").unwrap();
        assert_eq!(ast.kind, QueryKind::Sequence { max_span: None });
    }

    #[test]
    fn test_sample_gated_by_stack() {
        let query = "sample by host.id [process where true] [network where true]";
        assert_eq!(parse_at(query, (8, 6)).unwrap().kind, QueryKind::Sample);
        let err = parse_at(query, (8, 5)).unwrap_err();
        assert!(err.to_string().contains("sample queries"));
    }

    #[test]
    fn test_runs_gated_by_stack() {
        let query = "sequence by user.name [authentication where event.outcome == \"failure\"] with runs=5 [authentication where event.outcome == \"success\"]";
        assert!(parse_at(query, (8, 7)).is_ok());
        assert!(matches!(parse_at(query, (8, 6)), Err(RuleError::Syntax { .. })));
    }

    #[test]
    fn test_optional_field_recorded_without_marker() {
        let ast = parse("process where ?process.parent.args == \"x\"").unwrap();
        assert!(ast.fields.contains("process.parent.args"));
    }

    #[test]
    fn test_syntax_errors() {
        for bad in [
            "process where",
            "process",
            "sequence [process where true]",
            "process where a == (1",
            "process where a == 1 | bogus",
            "sequence with maxspan=abc [a where true] [b where true]",
        ] {
            assert!(matches!(parse(bad), Err(RuleError::Syntax { .. })), "expected error for {bad:?}");
        }
    }
}
