//! KQL：字典式查询语言，除语法外无额外结构约束

use ruleforge_engine::{QueryLanguage, StackVersion};

use super::lexer::{syntax_error, tokenize, Token, TokenKind};
use super::{QueryAst, QueryValidator};
use crate::error::{RuleError, RuleResult};

#[derive(Debug, Clone, Copy)]
pub struct KqlValidator {
    /// 关键字大小写不敏感（`AND` / `Or` 视为关键字）
    normalize_keywords: bool,
}

impl KqlValidator {
    pub fn new(normalize_keywords: bool) -> Self {
        Self { normalize_keywords }
    }
}

impl Default for KqlValidator {
    fn default() -> Self {
        Self::new(true)
    }
}

impl QueryValidator for KqlValidator {
    fn dialect(&self) -> QueryLanguage {
        QueryLanguage::Kuery
    }

    fn parse(&self, query: &str, _min_stack: &StackVersion) -> RuleResult<QueryAst> {
        let tokens = tokenize(query, QueryLanguage::Kuery)?;
        if tokens.is_empty() {
            return Err(syntax_error(QueryLanguage::Kuery, "empty query", 1, 1));
        }

        let mut parser = KqlParser {
            tokens: &tokens,
            pos: 0,
            normalize_keywords: self.normalize_keywords,
            prefix: Vec::new(),
            ast: QueryAst::new(QueryLanguage::Kuery),
        };
        parser.or_expr()?;
        if let Some(token) = parser.peek() {
            return Err(unexpected(token));
        }
        Ok(parser.ast)
    }
}

struct KqlParser<'t> {
    tokens: &'t [Token],
    pos: usize,
    normalize_keywords: bool,
    /// 嵌套查询 `a:{ b:1 }` 的字段前缀
    prefix: Vec<String>,
    ast: QueryAst,
}

impl<'t> KqlParser<'t> {
    fn peek(&self) -> Option<&'t Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&'t Token> {
        self.tokens.get(self.pos + offset)
    }

    fn next(&mut self) -> Option<&'t Token> {
        let token = self.tokens.get(self.pos)?;
        self.pos += 1;
        Some(token)
    }

    fn is_keyword(&self, token: &Token, keyword: &str) -> bool {
        token.kind == TokenKind::Word
            && if self.normalize_keywords {
                token.text.eq_ignore_ascii_case(keyword)
            } else {
                token.text == keyword
            }
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        match self.peek() {
            Some(token) if self.is_keyword(token, keyword) => {
                self.pos += 1;
                true
            }
            _ => false,
        }
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> RuleResult<&'t Token> {
        match self.next() {
            Some(token) if token.kind == kind => Ok(token),
            Some(token) => Err(syntax_error(
                QueryLanguage::Kuery,
                &format!("expected {} but found `{}`", what, token.text),
                token.line,
                token.column,
            )),
            None => Err(end_of_input(self.tokens, what)),
        }
    }

    fn or_expr(&mut self) -> RuleResult<()> {
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
        self.primary()
    }

    fn primary(&mut self) -> RuleResult<()> {
        let Some(token) = self.next() else {
            return Err(end_of_input(self.tokens, "expression"));
        };

        match token.kind {
            TokenKind::LParen => {
                self.or_expr()?;
                self.expect(TokenKind::RParen, "`)`")?;
                Ok(())
            }
            TokenKind::Word if self.peek().map_or(false, |t| t.kind == TokenKind::Op) => {
                let field = self.qualified(&token.text);
                self.field_expr(&field)
            }
            TokenKind::Word | TokenKind::Str => {
                // 自由文本：连续的取值词
                while let Some(next) = self.peek() {
                    let is_free_text = matches!(next.kind, TokenKind::Word | TokenKind::Str)
                        && !["and", "or", "not"].iter().any(|kw| self.is_keyword(next, kw))
                        && !self.peek_at(1).map_or(false, |t| t.kind == TokenKind::Op);
                    if !is_free_text {
                        break;
                    }
                    self.pos += 1;
                }
                Ok(())
            }
            _ => Err(unexpected(token)),
        }
    }

    fn field_expr(&mut self, field: &str) -> RuleResult<()> {
        let op = self.expect(TokenKind::Op, "operator")?;
        self.ast.add_field(field);

        match op.text.as_str() {
            ":" => match self.peek().map(|t| t.kind) {
                Some(TokenKind::LBrace) => {
                    self.pos += 1;
                    self.prefix.push(field.to_string());
                    self.or_expr()?;
                    self.prefix.pop();
                    self.expect(TokenKind::RBrace, "`}`")?;
                    Ok(())
                }
                Some(TokenKind::LParen) => {
                    self.pos += 1;
                    self.value_or(field)?;
                    self.expect(TokenKind::RParen, "`)`")?;
                    Ok(())
                }
                _ => self.value(field),
            },
            "<" | "<=" | ">" | ">=" => self.value(field),
            _ => Err(unexpected(op)),
        }
    }

    fn value_or(&mut self, field: &str) -> RuleResult<()> {
        self.value_and(field)?;
        while self.eat_keyword("or") {
            self.value_and(field)?;
        }
        Ok(())
    }

    fn value_and(&mut self, field: &str) -> RuleResult<()> {
        self.value_not(field)?;
        while self.eat_keyword("and") {
            self.value_not(field)?;
        }
        Ok(())
    }

    fn value_not(&mut self, field: &str) -> RuleResult<()> {
        if self.eat_keyword("not") {
            return self.value_not(field);
        }
        if self.peek().map_or(false, |t| t.kind == TokenKind::LParen) {
            self.pos += 1;
            self.value_or(field)?;
            self.expect(TokenKind::RParen, "`)`")?;
            return Ok(());
        }
        self.value(field)
    }

    fn value(&mut self, field: &str) -> RuleResult<()> {
        match self.next() {
            Some(token) if matches!(token.kind, TokenKind::Word | TokenKind::Str) => {
                self.ast.add_comparison(field, &token.text);
                Ok(())
            }
            Some(token) => Err(syntax_error(
                QueryLanguage::Kuery,
                &format!("expected value for `{}` but found `{}`", field, token.text),
                token.line,
                token.column,
            )),
            None => Err(end_of_input(self.tokens, &format!("value for `{}`", field))),
        }
    }

    fn qualified(&self, field: &str) -> String {
        if self.prefix.is_empty() {
            return field.to_string();
        }
        format!("{}.{}", self.prefix.join("."), field)
    }
}

fn unexpected(token: &Token) -> RuleError {
    syntax_error(
        QueryLanguage::Kuery,
        &format!("unexpected `{}`", token.text),
        token.line,
        token.column,
    )
}

fn end_of_input(tokens: &[Token], what: &str) -> RuleError {
    let (line, column) = tokens
        .last()
        .map_or((1, 1), |t| (t.line, t.column + t.text.chars().count()));
    syntax_error(QueryLanguage::Kuery, &format!("expected {} at end of query", what), line, column)
}
