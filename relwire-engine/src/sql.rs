//! The reference engine's statement language.
//!
//! A deliberately small dialect: enough to create tables, insert with
//! parameters, select (optionally filtered by one column), delete, post
//! events and simulate long-running work.
//!
//! ```text
//! CREATE TABLE name (col TYPE [NOT NULL] [PRIMARY KEY], ...)
//! DROP TABLE name
//! INSERT INTO name [(col, ...)] VALUES (expr, ...)
//! SELECT * FROM name [WHERE col = expr]
//! SELECT COUNT(*) FROM name [WHERE col = expr]
//! DELETE FROM name [WHERE col = expr]
//! POST_EVENT 'name'
//! DELAY millis
//! ```
//!
//! `expr` is `?`, `NULL`, a number or a quoted string. Identifiers are
//! case-insensitive and stored upper-cased.

use crate::error::EngineError;
use relwire_protocol::format::MAX_VARCHAR;
use relwire_protocol::{FieldType, Value};

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDef {
    pub name: String,
    pub field_type: FieldType,
    pub nullable: bool,
    pub primary_key: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Param,
    Literal(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub column: String,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    CreateTable {
        table: String,
        columns: Vec<ColumnDef>,
    },
    DropTable {
        table: String,
    },
    Insert {
        table: String,
        columns: Option<Vec<String>>,
        values: Vec<Expr>,
    },
    Select {
        table: String,
        filter: Option<Filter>,
    },
    SelectCount {
        table: String,
        filter: Option<Filter>,
    },
    Delete {
        table: String,
        filter: Option<Filter>,
    },
    PostEvent {
        name: String,
    },
    Delay {
        millis: u64,
    },
}

impl Command {
    /// Number of `?` placeholders.
    pub fn param_count(&self) -> usize {
        let filter_params = |f: &Option<Filter>| {
            usize::from(matches!(
                f,
                Some(Filter {
                    value: Expr::Param,
                    ..
                })
            ))
        };
        match self {
            Command::Insert { values, .. } => values.iter().filter(|e| **e == Expr::Param).count(),
            Command::Select { filter, .. }
            | Command::SelectCount { filter, .. }
            | Command::Delete { filter, .. } => filter_params(filter),
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Int(i64),
    Float(f64),
    Str(String),
    Sym(char),
}

fn tokenize(sql: &str) -> Result<Vec<Token>, EngineError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = sql.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            tokens.push(Token::Word(word.to_ascii_uppercase()));
        } else if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(char::is_ascii_digit)) {
            let start = i;
            i += 1;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            if text.contains('.') {
                let v = text
                    .parse::<f64>()
                    .map_err(|_| EngineError::syntax(format!("bad number {}", text)))?;
                tokens.push(Token::Float(v));
            } else {
                let v = text
                    .parse::<i64>()
                    .map_err(|_| EngineError::syntax(format!("bad number {}", text)))?;
                tokens.push(Token::Int(v));
            }
        } else if c == '\'' {
            let mut value = String::new();
            i += 1;
            loop {
                match chars.get(i) {
                    None => return Err(EngineError::syntax("unterminated string")),
                    Some('\'') if chars.get(i + 1) == Some(&'\'') => {
                        value.push('\'');
                        i += 2;
                    }
                    Some('\'') => {
                        i += 1;
                        break;
                    }
                    Some(ch) => {
                        value.push(*ch);
                        i += 1;
                    }
                }
            }
            tokens.push(Token::Str(value));
        } else if "(),=*?;".contains(c) {
            tokens.push(Token::Sym(c));
            i += 1;
        } else {
            return Err(EngineError::syntax(format!("unexpected character '{}'", c)));
        }
    }
    // A single trailing semicolon is allowed.
    if tokens.last() == Some(&Token::Sym(';')) {
        tokens.pop();
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Result<Token, EngineError> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| EngineError::syntax("unexpected end of statement"))?;
        self.pos += 1;
        Ok(token)
    }

    fn keyword(&mut self, kw: &str) -> Result<(), EngineError> {
        match self.next()? {
            Token::Word(w) if w == kw => Ok(()),
            other => Err(EngineError::syntax(format!(
                "expected {}, found {:?}",
                kw, other
            ))),
        }
    }

    fn accept_keyword(&mut self, kw: &str) -> bool {
        if matches!(self.peek(), Some(Token::Word(w)) if w == kw) {
            self.pos += 1;
            return true;
        }
        false
    }

    fn symbol(&mut self, sym: char) -> Result<(), EngineError> {
        match self.next()? {
            Token::Sym(c) if c == sym => Ok(()),
            other => Err(EngineError::syntax(format!(
                "expected '{}', found {:?}",
                sym, other
            ))),
        }
    }

    fn accept_symbol(&mut self, sym: char) -> bool {
        if self.peek() == Some(&Token::Sym(sym)) {
            self.pos += 1;
            return true;
        }
        false
    }

    fn ident(&mut self) -> Result<String, EngineError> {
        match self.next()? {
            Token::Word(w) => Ok(w),
            other => Err(EngineError::syntax(format!(
                "expected identifier, found {:?}",
                other
            ))),
        }
    }

    fn expr(&mut self) -> Result<Expr, EngineError> {
        Ok(match self.next()? {
            Token::Sym('?') => Expr::Param,
            Token::Word(w) if w == "NULL" => Expr::Literal(Value::Null),
            Token::Int(v) => match i32::try_from(v) {
                Ok(small) => Expr::Literal(Value::Integer(small)),
                Err(_) => Expr::Literal(Value::BigInt(v)),
            },
            Token::Float(v) => Expr::Literal(Value::Double(v)),
            Token::Str(s) => Expr::Literal(Value::Text(s)),
            other => {
                return Err(EngineError::syntax(format!(
                    "expected value, found {:?}",
                    other
                )))
            }
        })
    }

    fn filter(&mut self) -> Result<Option<Filter>, EngineError> {
        if !self.accept_keyword("WHERE") {
            return Ok(None);
        }
        let column = self.ident()?;
        self.symbol('=')?;
        let value = self.expr()?;
        Ok(Some(Filter { column, value }))
    }

    fn column_type(&mut self) -> Result<FieldType, EngineError> {
        let name = self.ident()?;
        Ok(match name.as_str() {
            "INTEGER" | "INT" => FieldType::Integer,
            "BIGINT" => FieldType::BigInt,
            "DOUBLE" => {
                self.accept_keyword("PRECISION");
                FieldType::Double
            }
            "BLOB" => FieldType::Blob,
            "VARCHAR" => {
                self.symbol('(')?;
                let len = match self.next()? {
                    Token::Int(n) if n > 0 && n <= i64::from(MAX_VARCHAR) => n as u32,
                    other => {
                        return Err(EngineError::syntax(format!(
                            "bad VARCHAR length {:?}",
                            other
                        )))
                    }
                };
                self.symbol(')')?;
                FieldType::Varchar(len)
            }
            other => return Err(EngineError::syntax(format!("unknown type {}", other))),
        })
    }

    fn create_table(&mut self) -> Result<Command, EngineError> {
        self.keyword("TABLE")?;
        let table = self.ident()?;
        self.symbol('(')?;
        let mut columns = Vec::new();
        loop {
            let name = self.ident()?;
            let field_type = self.column_type()?;
            let mut nullable = true;
            let mut primary_key = false;
            loop {
                if self.accept_keyword("NOT") {
                    self.keyword("NULL")?;
                    nullable = false;
                } else if self.accept_keyword("PRIMARY") {
                    self.keyword("KEY")?;
                    primary_key = true;
                    nullable = false;
                } else {
                    break;
                }
            }
            if columns.iter().any(|c: &ColumnDef| c.name == name) {
                return Err(EngineError::syntax(format!("duplicate column {}", name)));
            }
            columns.push(ColumnDef {
                name,
                field_type,
                nullable,
                primary_key,
            });
            if self.accept_symbol(',') {
                continue;
            }
            self.symbol(')')?;
            break;
        }
        if columns.iter().filter(|c| c.primary_key).count() > 1 {
            return Err(EngineError::syntax("only one PRIMARY KEY column is supported"));
        }
        Ok(Command::CreateTable { table, columns })
    }

    fn insert(&mut self) -> Result<Command, EngineError> {
        self.keyword("INTO")?;
        let table = self.ident()?;
        let columns = if self.accept_symbol('(') {
            let mut names = vec![self.ident()?];
            while self.accept_symbol(',') {
                names.push(self.ident()?);
            }
            self.symbol(')')?;
            Some(names)
        } else {
            None
        };
        self.keyword("VALUES")?;
        self.symbol('(')?;
        let mut values = vec![self.expr()?];
        while self.accept_symbol(',') {
            values.push(self.expr()?);
        }
        self.symbol(')')?;
        if let Some(cols) = &columns {
            if cols.len() != values.len() {
                return Err(EngineError::syntax(format!(
                    "{} columns but {} values",
                    cols.len(),
                    values.len()
                )));
            }
        }
        Ok(Command::Insert {
            table,
            columns,
            values,
        })
    }

    fn select(&mut self) -> Result<Command, EngineError> {
        let count = if self.accept_symbol('*') {
            false
        } else {
            self.keyword("COUNT")?;
            self.symbol('(')?;
            self.symbol('*')?;
            self.symbol(')')?;
            true
        };
        self.keyword("FROM")?;
        let table = self.ident()?;
        let filter = self.filter()?;
        Ok(if count {
            Command::SelectCount { table, filter }
        } else {
            Command::Select { table, filter }
        })
    }

    fn statement(&mut self) -> Result<Command, EngineError> {
        let command = match self.ident()?.as_str() {
            "CREATE" => self.create_table()?,
            "DROP" => {
                self.keyword("TABLE")?;
                Command::DropTable {
                    table: self.ident()?,
                }
            }
            "INSERT" => self.insert()?,
            "SELECT" => self.select()?,
            "DELETE" => {
                self.keyword("FROM")?;
                let table = self.ident()?;
                let filter = self.filter()?;
                Command::Delete { table, filter }
            }
            "POST_EVENT" => match self.next()? {
                Token::Str(name) if !name.is_empty() => Command::PostEvent { name },
                other => {
                    return Err(EngineError::syntax(format!(
                        "expected event name, found {:?}",
                        other
                    )))
                }
            },
            "DELAY" => match self.next()? {
                Token::Int(ms) if ms >= 0 => Command::Delay { millis: ms as u64 },
                other => {
                    return Err(EngineError::syntax(format!(
                        "expected milliseconds, found {:?}",
                        other
                    )))
                }
            },
            other => return Err(EngineError::syntax(format!("unknown statement {}", other))),
        };
        if let Some(extra) = self.peek() {
            return Err(EngineError::syntax(format!(
                "unexpected {:?} after statement",
                extra
            )));
        }
        Ok(command)
    }
}

/// Parses one statement.
pub fn parse(sql: &str) -> Result<Command, EngineError> {
    let tokens = tokenize(sql)?;
    if tokens.is_empty() {
        return Err(EngineError::syntax("empty statement"));
    }
    Parser { tokens, pos: 0 }.statement()
}
