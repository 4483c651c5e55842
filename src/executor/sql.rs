//! SQL subset understood by the in-memory backend
//!
//! Covers the statements the cluster itself generates (row copy, diff
//! updates, constraint and sequence DDL) plus simple CRUD, so that an
//! in-memory cluster behaves like a small real one.

use crate::error::{Error, Result};
use crate::executor::Value;
use crate::metadata::ReferentialAction;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Quoted(String),
    Number(String),
    Text(String),
    Param(Option<usize>),
    Symbol(char),
}

/// A value expression, evaluated at execution time
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Literal(Value),
    NextValue(String),
}

/// `column = expr` or `column IS NULL`
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Condition {
    pub column: String,
    pub value: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SelectItem {
    Column(String),
    Expr(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Projection {
    All,
    CountAll,
    Items(Vec<SelectItem>),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ColumnDef {
    pub name: String,
    pub type_name: String,
    pub nullable: bool,
    pub auto_increment: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ForeignKeyDef {
    pub name: String,
    pub table: String,
    pub columns: Vec<String>,
    pub foreign_table: String,
    pub foreign_columns: Vec<String>,
    pub on_delete: ReferentialAction,
    pub on_update: ReferentialAction,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Statement {
    Begin,
    Commit,
    Rollback,
    CreateTable {
        name: String,
        columns: Vec<ColumnDef>,
        primary_key: Vec<String>,
        unique: Vec<(String, Vec<String>)>,
    },
    DropTable {
        name: String,
    },
    Insert {
        table: String,
        columns: Option<Vec<String>>,
        rows: Vec<Vec<Expr>>,
    },
    Update {
        table: String,
        assignments: Vec<(String, Expr)>,
        filter: Vec<Condition>,
    },
    Delete {
        table: String,
        filter: Vec<Condition>,
    },
    Select {
        projection: Projection,
        table: Option<String>,
        filter: Vec<Condition>,
        order_by: Vec<String>,
    },
    Truncate {
        table: String,
    },
    AddForeignKey(ForeignKeyDef),
    AddUnique {
        table: String,
        name: String,
        columns: Vec<String>,
    },
    DropConstraint {
        table: String,
        name: String,
    },
    CreateSequence {
        name: String,
        start: i64,
        increment: i64,
    },
    DropSequence {
        name: String,
    },
    RestartSequence {
        name: String,
        value: i64,
    },
}

/// Parse one statement, binding positional parameters
pub(crate) fn parse(sql: &str, params: &[Value]) -> Result<Statement> {
    let tokens = tokenize(sql)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        params,
        next_param: 0,
    };
    let statement = parser.statement()?;
    parser.finish()?;
    Ok(statement)
}

fn syntax(message: impl Into<String>) -> Error {
    Error::QueryExecution(format!("syntax error: {}", message.into()))
}

fn tokenize(sql: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = sql.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len()
                && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '$')
            {
                i += 1;
            }
            tokens.push(Token::Word(chars[start..i].iter().collect()));
        } else if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            tokens.push(Token::Number(chars[start..i].iter().collect()));
        } else if c == '\'' || c == '"' || c == '`' {
            let mut text = String::new();
            i += 1;
            loop {
                match chars.get(i) {
                    None => return Err(syntax("unterminated quote")),
                    Some(&ch) if ch == c => {
                        if chars.get(i + 1) == Some(&c) {
                            text.push(c);
                            i += 2;
                        } else {
                            i += 1;
                            break;
                        }
                    }
                    Some(&ch) => {
                        text.push(ch);
                        i += 1;
                    }
                }
            }
            tokens.push(if c == '\'' {
                Token::Text(text)
            } else {
                Token::Quoted(text)
            });
        } else if c == '?' {
            tokens.push(Token::Param(None));
            i += 1;
        } else if c == '$' && chars.get(i + 1).map_or(false, |d| d.is_ascii_digit()) {
            let start = i + 1;
            i += 1;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            let index: String = chars[start..i].iter().collect();
            let index = index.parse().map_err(|_| syntax("bad parameter index"))?;
            tokens.push(Token::Param(Some(index)));
        } else if "(),.=*;-".contains(c) {
            tokens.push(Token::Symbol(c));
            i += 1;
        } else {
            return Err(syntax(format!("unexpected character '{}'", c)));
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    params: &'a [Value],
    next_param: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Word(w)) if w.eq_ignore_ascii_case(keyword))
    }

    fn accept_keyword(&mut self, keyword: &str) -> bool {
        if self.is_keyword(keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn keyword(&mut self, keyword: &str) -> Result<()> {
        if self.accept_keyword(keyword) {
            Ok(())
        } else {
            Err(syntax(format!("expected {}", keyword)))
        }
    }

    fn accept_symbol(&mut self, symbol: char) -> bool {
        if self.peek() == Some(&Token::Symbol(symbol)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn symbol(&mut self, symbol: char) -> Result<()> {
        if self.accept_symbol(symbol) {
            Ok(())
        } else {
            Err(syntax(format!("expected '{}'", symbol)))
        }
    }

    fn finish(&mut self) -> Result<()> {
        self.accept_symbol(';');
        match self.peek() {
            None => Ok(()),
            Some(token) => Err(syntax(format!("unexpected trailing {:?}", token))),
        }
    }

    /// Identifier, possibly qualified; the in-memory catalog has one schema,
    /// so only the last part is kept.
    fn identifier(&mut self) -> Result<String> {
        let mut name = match self.advance() {
            Some(Token::Word(w)) | Some(Token::Quoted(w)) => w,
            other => return Err(syntax(format!("expected identifier, found {:?}", other))),
        };
        while self.accept_symbol('.') {
            name = match self.advance() {
                Some(Token::Word(w)) | Some(Token::Quoted(w)) => w,
                other => {
                    return Err(syntax(format!("expected identifier, found {:?}", other)))
                }
            };
        }
        Ok(name)
    }

    fn identifier_list(&mut self) -> Result<Vec<String>> {
        self.symbol('(')?;
        let mut names = vec![self.identifier()?];
        while self.accept_symbol(',') {
            names.push(self.identifier()?);
        }
        self.symbol(')')?;
        Ok(names)
    }

    fn integer(&mut self) -> Result<i64> {
        let negative = self.accept_symbol('-');
        match self.advance() {
            Some(Token::Number(n)) => {
                let value: i64 = n.parse().map_err(|_| syntax("expected integer"))?;
                Ok(if negative { -value } else { value })
            }
            Some(Token::Param(index)) => {
                let value = self.bind(index)?;
                let value = value.as_i64().ok_or_else(|| syntax("expected integer"))?;
                Ok(if negative { -value } else { value })
            }
            other => Err(syntax(format!("expected integer, found {:?}", other))),
        }
    }

    fn bind(&mut self, index: Option<usize>) -> Result<Value> {
        let slot = match index {
            Some(n) if n >= 1 => n - 1,
            Some(_) => return Err(syntax("parameter indexes start at 1")),
            None => {
                self.next_param += 1;
                self.next_param - 1
            }
        };
        self.params
            .get(slot)
            .cloned()
            .ok_or_else(|| syntax(format!("missing value for parameter {}", slot + 1)))
    }

    fn starts_expression(&self) -> bool {
        match self.peek() {
            Some(Token::Number(_)) | Some(Token::Text(_)) | Some(Token::Param(_)) => true,
            Some(Token::Symbol('-')) => true,
            Some(Token::Word(w)) => ["NULL", "TRUE", "FALSE", "NEXT"]
                .iter()
                .any(|k| w.eq_ignore_ascii_case(k)),
            _ => false,
        }
    }

    fn expression(&mut self) -> Result<Expr> {
        if self.accept_keyword("NEXT") {
            self.keyword("VALUE")?;
            self.keyword("FOR")?;
            return Ok(Expr::NextValue(self.identifier()?));
        }
        if self.accept_keyword("NULL") {
            return Ok(Expr::Literal(Value::Null));
        }
        if self.accept_keyword("TRUE") {
            return Ok(Expr::Literal(Value::Bool(true)));
        }
        if self.accept_keyword("FALSE") {
            return Ok(Expr::Literal(Value::Bool(false)));
        }

        let negative = self.accept_symbol('-');
        let value = match self.advance() {
            Some(Token::Number(n)) => {
                if n.contains('.') {
                    Value::Float(n.parse().map_err(|_| syntax("bad number"))?)
                } else {
                    Value::Int(n.parse().map_err(|_| syntax("bad number"))?)
                }
            }
            Some(Token::Text(s)) if !negative => Value::String(s),
            Some(Token::Param(index)) => self.bind(index)?,
            other => return Err(syntax(format!("expected value, found {:?}", other))),
        };

        Ok(Expr::Literal(match (negative, value) {
            (false, v) => v,
            (true, Value::Int(i)) => Value::Int(-i),
            (true, Value::Float(f)) => Value::Float(-f),
            (true, _) => return Err(syntax("cannot negate value")),
        }))
    }

    fn filter(&mut self) -> Result<Vec<Condition>> {
        let mut conditions = Vec::new();
        if !self.accept_keyword("WHERE") {
            return Ok(conditions);
        }
        loop {
            let column = self.identifier()?;
            if self.accept_keyword("IS") {
                self.keyword("NULL")?;
                conditions.push(Condition {
                    column,
                    value: None,
                });
            } else {
                self.symbol('=')?;
                conditions.push(Condition {
                    column,
                    value: Some(self.expression()?),
                });
            }
            if !self.accept_keyword("AND") {
                break;
            }
        }
        Ok(conditions)
    }

    fn statement(&mut self) -> Result<Statement> {
        match self.advance() {
            Some(Token::Word(w)) => match w.to_ascii_uppercase().as_str() {
                "BEGIN" => Ok(Statement::Begin),
                "START" => {
                    self.keyword("TRANSACTION")?;
                    Ok(Statement::Begin)
                }
                "COMMIT" => Ok(Statement::Commit),
                "ROLLBACK" => Ok(Statement::Rollback),
                "CREATE" => self.create(),
                "DROP" => self.drop(),
                "INSERT" => self.insert(),
                "UPDATE" => self.update(),
                "DELETE" => self.delete(),
                "SELECT" => self.select(),
                "TRUNCATE" => {
                    self.accept_keyword("TABLE");
                    Ok(Statement::Truncate {
                        table: self.identifier()?,
                    })
                }
                "ALTER" => self.alter(),
                other => Err(syntax(format!("unsupported statement {}", other))),
            },
            other => Err(syntax(format!("unexpected {:?}", other))),
        }
    }

    fn create(&mut self) -> Result<Statement> {
        if self.accept_keyword("SEQUENCE") {
            let name = self.identifier()?;
            let mut start = 1;
            let mut increment = 1;
            loop {
                if self.accept_keyword("START") {
                    self.keyword("WITH")?;
                    start = self.integer()?;
                } else if self.accept_keyword("INCREMENT") {
                    self.keyword("BY")?;
                    increment = self.integer()?;
                } else {
                    break;
                }
            }
            return Ok(Statement::CreateSequence {
                name,
                start,
                increment,
            });
        }

        self.keyword("TABLE")?;
        let name = self.identifier()?;
        let mut columns = Vec::new();
        let mut primary_key = Vec::new();
        let mut unique = Vec::new();

        self.symbol('(')?;
        loop {
            if self.accept_keyword("PRIMARY") {
                self.keyword("KEY")?;
                primary_key = self.identifier_list()?;
            } else if self.accept_keyword("CONSTRAINT") {
                let constraint = self.identifier()?;
                self.keyword("UNIQUE")?;
                unique.push((constraint, self.identifier_list()?));
            } else {
                let column = self.identifier()?;
                let mut type_name = self.identifier()?;
                if self.accept_symbol('(') {
                    let size = self.integer()?;
                    self.symbol(')')?;
                    type_name = format!("{}({})", type_name, size);
                }
                let mut def = ColumnDef {
                    name: column.clone(),
                    type_name,
                    nullable: true,
                    auto_increment: false,
                };
                loop {
                    if self.accept_keyword("PRIMARY") {
                        self.keyword("KEY")?;
                        primary_key = vec![column.clone()];
                        def.nullable = false;
                    } else if self.accept_keyword("NOT") {
                        self.keyword("NULL")?;
                        def.nullable = false;
                    } else if self.accept_keyword("AUTO_INCREMENT")
                        || self.accept_keyword("AUTOINCREMENT")
                    {
                        def.auto_increment = true;
                    } else {
                        break;
                    }
                }
                columns.push(def);
            }
            if !self.accept_symbol(',') {
                break;
            }
        }
        self.symbol(')')?;

        Ok(Statement::CreateTable {
            name,
            columns,
            primary_key,
            unique,
        })
    }

    fn drop(&mut self) -> Result<Statement> {
        if self.accept_keyword("SEQUENCE") {
            return Ok(Statement::DropSequence {
                name: self.identifier()?,
            });
        }
        self.keyword("TABLE")?;
        Ok(Statement::DropTable {
            name: self.identifier()?,
        })
    }

    fn insert(&mut self) -> Result<Statement> {
        self.keyword("INTO")?;
        let table = self.identifier()?;
        let columns = if self.peek() == Some(&Token::Symbol('(')) {
            Some(self.identifier_list()?)
        } else {
            None
        };
        self.keyword("VALUES")?;

        let mut rows = Vec::new();
        loop {
            self.symbol('(')?;
            let mut row = vec![self.expression()?];
            while self.accept_symbol(',') {
                row.push(self.expression()?);
            }
            self.symbol(')')?;
            rows.push(row);
            if !self.accept_symbol(',') {
                break;
            }
        }

        Ok(Statement::Insert {
            table,
            columns,
            rows,
        })
    }

    fn update(&mut self) -> Result<Statement> {
        let table = self.identifier()?;
        self.keyword("SET")?;
        let mut assignments = Vec::new();
        loop {
            let column = self.identifier()?;
            self.symbol('=')?;
            assignments.push((column, self.expression()?));
            if !self.accept_symbol(',') {
                break;
            }
        }
        let filter = self.filter()?;
        Ok(Statement::Update {
            table,
            assignments,
            filter,
        })
    }

    fn delete(&mut self) -> Result<Statement> {
        self.keyword("FROM")?;
        let table = self.identifier()?;
        let filter = self.filter()?;
        Ok(Statement::Delete { table, filter })
    }

    fn select(&mut self) -> Result<Statement> {
        let projection = if self.accept_symbol('*') {
            Projection::All
        } else if self.is_keyword("COUNT") {
            self.pos += 1;
            self.symbol('(')?;
            self.symbol('*')?;
            self.symbol(')')?;
            Projection::CountAll
        } else {
            let mut items = Vec::new();
            loop {
                if self.starts_expression() {
                    items.push(SelectItem::Expr(self.expression()?));
                } else {
                    items.push(SelectItem::Column(self.identifier()?));
                }
                if !self.accept_symbol(',') {
                    break;
                }
            }
            Projection::Items(items)
        };

        let table = if self.accept_keyword("FROM") {
            Some(self.identifier()?)
        } else {
            None
        };
        let filter = self.filter()?;

        let mut order_by = Vec::new();
        if self.accept_keyword("ORDER") {
            self.keyword("BY")?;
            loop {
                order_by.push(self.identifier()?);
                self.accept_keyword("ASC");
                if !self.accept_symbol(',') {
                    break;
                }
            }
        }
        if self.accept_keyword("FOR") {
            self.keyword("UPDATE")?;
        }

        Ok(Statement::Select {
            projection,
            table,
            filter,
            order_by,
        })
    }

    fn alter(&mut self) -> Result<Statement> {
        if self.accept_keyword("SEQUENCE") {
            let name = self.identifier()?;
            self.keyword("RESTART")?;
            self.keyword("WITH")?;
            return Ok(Statement::RestartSequence {
                name,
                value: self.integer()?,
            });
        }

        self.keyword("TABLE")?;
        let table = self.identifier()?;

        if self.accept_keyword("DROP") {
            self.keyword("CONSTRAINT")?;
            return Ok(Statement::DropConstraint {
                table,
                name: self.identifier()?,
            });
        }

        self.keyword("ADD")?;
        self.keyword("CONSTRAINT")?;
        let name = self.identifier()?;

        if self.accept_keyword("UNIQUE") {
            return Ok(Statement::AddUnique {
                table,
                name,
                columns: self.identifier_list()?,
            });
        }

        self.keyword("FOREIGN")?;
        self.keyword("KEY")?;
        let columns = self.identifier_list()?;
        self.keyword("REFERENCES")?;
        let foreign_table = self.identifier()?;
        let foreign_columns = self.identifier_list()?;

        let mut on_delete = ReferentialAction::NoAction;
        let mut on_update = ReferentialAction::NoAction;
        while self.accept_keyword("ON") {
            let deleting = if self.accept_keyword("DELETE") {
                true
            } else {
                self.keyword("UPDATE")?;
                false
            };
            let action = self.referential_action()?;
            if deleting {
                on_delete = action;
            } else {
                on_update = action;
            }
        }
        // Deferrability clauses are accepted and ignored.
        while self.accept_keyword("DEFERRABLE")
            || self.accept_keyword("INITIALLY")
            || self.accept_keyword("DEFERRED")
            || self.accept_keyword("IMMEDIATE")
            || self.accept_keyword("NOT")
        {}

        Ok(Statement::AddForeignKey(ForeignKeyDef {
            name,
            table,
            columns,
            foreign_table,
            foreign_columns,
            on_delete,
            on_update,
        }))
    }

    fn referential_action(&mut self) -> Result<ReferentialAction> {
        if self.accept_keyword("CASCADE") {
            Ok(ReferentialAction::Cascade)
        } else if self.accept_keyword("RESTRICT") {
            Ok(ReferentialAction::Restrict)
        } else if self.accept_keyword("SET") {
            if self.accept_keyword("NULL") {
                Ok(ReferentialAction::SetNull)
            } else {
                self.keyword("DEFAULT")?;
                Ok(ReferentialAction::SetDefault)
            }
        } else {
            self.keyword("NO")?;
            self.keyword("ACTION")?;
            Ok(ReferentialAction::NoAction)
        }
    }
}
