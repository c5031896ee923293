//! 查询文本分词（带行列位置），KQL / EQL 共用

use crate::error::{Dialect, RuleError, RuleResult, SourcePosition};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// 标识符 / 关键字 / KQL 未加引号的取值
    Word,
    /// 引号字符串（已去引号、已反转义）
    Str,
    /// 数字（EQL 下可带时间单位后缀，如 `30m`）
    Number,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Pipe,
    /// 比较运算符：`:` `==` `!=` `<` `<=` `>` `>=` `=` `~`
    Op,
    /// EQL 算术运算符：`+` `-` `*` `/` `%`
    Arith,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub line: usize,
    pub column: usize,
}

impl Token {
    pub fn position(&self) -> SourcePosition {
        SourcePosition::at(self.line, self.column)
    }

    pub fn is(&self, kind: TokenKind, text: &str) -> bool {
        self.kind == kind && self.text == text
    }

    /// 关键字匹配（大小写不敏感）
    pub fn is_keyword(&self, keyword: &str) -> bool {
        self.kind == TokenKind::Word && self.text.eq_ignore_ascii_case(keyword)
    }
}

struct Cursor<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
    column: usize,
}

impl<'a> Cursor<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            chars: source.chars().peekable(),
            line: 1,
            column: 1,
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn peek_second(&self) -> Option<char> {
        self.chars.clone().nth(1)
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.chars.next()?;
        if ch == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(ch)
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.bump();
            true
        } else {
            false
        }
    }
}

/// 分词
pub fn tokenize(source: &str, dialect: Dialect) -> RuleResult<Vec<Token>> {
    let mut cursor = Cursor::new(source);
    let mut tokens = Vec::new();

    while let Some(ch) = cursor.peek() {
        if ch.is_whitespace() {
            cursor.bump();
            continue;
        }

        let (line, column) = (cursor.line, cursor.column);
        let single = |kind: TokenKind| Token {
            kind,
            text: ch.to_string(),
            line,
            column,
        };

        let token = match ch {
            '(' | ')' | '[' | ']' | '{' | '}' | ',' | '|' => {
                cursor.bump();
                single(match ch {
                    '(' => TokenKind::LParen,
                    ')' => TokenKind::RParen,
                    '[' => TokenKind::LBracket,
                    ']' => TokenKind::RBracket,
                    '{' => TokenKind::LBrace,
                    '}' => TokenKind::RBrace,
                    ',' => TokenKind::Comma,
                    _ => TokenKind::Pipe,
                })
            }
            '"' | '\'' => {
                let text = read_string(&mut cursor, dialect)?;
                Token {
                    kind: TokenKind::Str,
                    text,
                    line,
                    column,
                }
            }
            ':' | '<' | '>' | '=' | '!' | '~' => {
                cursor.bump();
                let mut text = ch.to_string();
                if matches!(ch, '<' | '>' | '=' | '!') && cursor.eat('=') {
                    text.push('=');
                } else if ch == '!' {
                    return Err(syntax_error(dialect, "unexpected `!`", line, column));
                }
                Token {
                    kind: TokenKind::Op,
                    text,
                    line,
                    column,
                }
            }
            // 单独的 `-` 是减号，紧跟字符时仍按负数 / 标识符读取
            '+' | '*' | '/' | '%' if dialect == Dialect::Eql => {
                cursor.bump();
                single(TokenKind::Arith)
            }
            '-' if dialect == Dialect::Eql && cursor.peek_second().map_or(true, char::is_whitespace) => {
                cursor.bump();
                single(TokenKind::Arith)
            }
            '`' if dialect == Dialect::Eql => {
                cursor.bump();
                let mut text = String::new();
                loop {
                    match cursor.bump() {
                        Some('`') => break,
                        Some(c) => text.push(c),
                        None => return Err(syntax_error(dialect, "unterminated escaped field", line, column)),
                    }
                }
                Token {
                    kind: TokenKind::Word,
                    text,
                    line,
                    column,
                }
            }
            _ if dialect == Dialect::Eql && ch.is_ascii_digit() => Token {
                kind: TokenKind::Number,
                text: read_while(&mut cursor, |c| c.is_ascii_alphanumeric() || c == '.'),
                line,
                column,
            },
            _ if dialect == Dialect::Eql && (ch.is_alphabetic() || matches!(ch, '_' | '@' | '?' | '-')) => {
                let text = read_while(&mut cursor, |c| c.is_alphanumeric() || matches!(c, '_' | '.' | '@' | '?' | '-' | '*'));
                Token {
                    kind: TokenKind::Word,
                    text,
                    line,
                    column,
                }
            }
            _ if dialect == Dialect::Eql => {
                return Err(syntax_error(dialect, &format!("unexpected character `{}`", ch), line, column));
            }
            _ => Token {
                kind: TokenKind::Word,
                text: read_kql_term(&mut cursor),
                line,
                column,
            },
        };
        tokens.push(token);
    }

    Ok(tokens)
}

fn read_while(cursor: &mut Cursor<'_>, accept: impl Fn(char) -> bool) -> String {
    let mut text = String::new();
    while let Some(c) = cursor.peek() {
        if !accept(c) {
            break;
        }
        text.push(c);
        cursor.bump();
    }
    text
}

/// KQL 未加引号的取值：遇到空白或结构字符结束，`\` 转义下一个字符
fn read_kql_term(cursor: &mut Cursor<'_>) -> String {
    let mut text = String::new();
    while let Some(c) = cursor.peek() {
        if c.is_whitespace() || matches!(c, '(' | ')' | ':' | '"' | '{' | '}' | '<' | '>' | '=') {
            break;
        }
        cursor.bump();
        if c == '\\' {
            if let Some(escaped) = cursor.bump() {
                text.push(escaped);
            }
            continue;
        }
        text.push(c);
    }
    text
}

fn read_string(cursor: &mut Cursor<'_>, dialect: Dialect) -> RuleResult<String> {
    let (line, column) = (cursor.line, cursor.column);
    let quote = cursor.bump().unwrap_or('"');

    // EQL 三引号原始字符串
    if dialect == Dialect::Eql && quote == '"' && cursor.eat('"') {
        if !cursor.eat('"') {
            return Ok(String::new());
        }
        let mut text = String::new();
        loop {
            match cursor.bump() {
                Some('"') if text.ends_with("\"\"") => {
                    text.truncate(text.len() - 2);
                    return Ok(text);
                }
                Some(c) => text.push(c),
                None => return Err(syntax_error(dialect, "unterminated raw string", line, column)),
            }
        }
    }

    let mut text = String::new();
    loop {
        match cursor.bump() {
            Some(c) if c == quote => return Ok(text),
            Some('\\') => match cursor.bump() {
                Some('n') => text.push('\n'),
                Some('t') => text.push('\t'),
                Some('r') => text.push('\r'),
                Some(c) => text.push(c),
                None => break,
            },
            Some(c) => text.push(c),
            None => break,
        }
    }
    Err(syntax_error(dialect, "unterminated string literal", line, column))
}

pub(crate) fn syntax_error(dialect: Dialect, message: &str, line: usize, column: usize) -> RuleError {
    RuleError::Syntax {
        dialect,
        message: message.to_string(),
        position: SourcePosition::at(line, column),
    }
}
