//! 语法分析：Token -> 语句树
//!
//! 语法（按优先级从低到高）：`||`、`&&`、`== !=`、`< <= > >=`、`+ -`、`* / %`、一元 `- !`、
//! 后缀（调用、`.字段`、`[下标]`）。`tools.NAME(...)` / `agents.NAME(...)` 是唯一的外部调用入口。

use serde_json::Value;

use crate::sandbox::lexer::{Tok, Token, RESERVED};
use crate::sandbox::value::ArithOp;
use crate::sandbox::SandboxError;

/// 表达式/语句最大嵌套深度
const MAX_DEPTH: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Namespace {
    Tools,
    Agents,
}

impl Namespace {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Namespace::Tools => "tools",
            Namespace::Agents => "agents",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BinOp {
    Arith(ArithOp),
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum UnOp {
    Neg,
    Not,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum ExprKind {
    Literal(Value),
    Var(String),
    Array(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    Unary(UnOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Index(Box<Expr>, Box<Expr>),
    Field(Box<Expr>, String),
    /// 内置函数调用
    Call(String, Vec<Expr>),
    /// `tools.NAME(...)` / `agents.NAME(...)`
    External {
        ns: Namespace,
        name: String,
        args: Vec<Expr>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Expr {
    pub kind: ExprKind,
    pub line: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Stmt {
    Assign {
        name: String,
        value: Expr,
        line: usize,
    },
    If {
        cond: Expr,
        then: Vec<Stmt>,
        otherwise: Vec<Stmt>,
    },
    For {
        var: String,
        iter: Expr,
        body: Vec<Stmt>,
        line: usize,
    },
    Expr(Expr),
}

pub(crate) fn parse(tokens: Vec<Token>) -> Result<Vec<Stmt>, SandboxError> {
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let stmts = parser.statements(false)?;
    parser.expect(&Tok::Eof, "end of input")?;
    Ok(stmts)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &Tok {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].tok
    }

    fn peek_at(&self, offset: usize) -> &Tok {
        &self.tokens[(self.pos + offset).min(self.tokens.len() - 1)].tok
    }

    fn line(&self) -> usize {
        self.tokens[self.pos.min(self.tokens.len() - 1)].line
    }

    fn advance(&mut self) -> Tok {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.peek() == tok {
            self.advance();
            true
        } else {
            false
        }
    }

    fn error(&self, message: impl Into<String>) -> SandboxError {
        SandboxError::Syntax {
            line: self.line(),
            message: message.into(),
        }
    }

    fn expect(&mut self, tok: &Tok, what: &str) -> Result<(), SandboxError> {
        if self.eat(tok) {
            Ok(())
        } else {
            Err(self.error(format!("expected {what}, found {}", describe(self.peek()))))
        }
    }

    fn skip_newlines(&mut self) {
        while matches!(self.peek(), Tok::Newline | Tok::Semi) {
            self.advance();
        }
    }

    fn enter(&mut self) -> Result<(), SandboxError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(self.error("nesting too deep"));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    /// 语句序列；in_block 为 true 时遇到 `}` 结束
    fn statements(&mut self, in_block: bool) -> Result<Vec<Stmt>, SandboxError> {
        let mut stmts = Vec::new();
        loop {
            self.skip_newlines();
            match self.peek() {
                Tok::Eof => break,
                Tok::RBrace if in_block => break,
                _ => {}
            }
            stmts.push(self.statement()?);
            match self.peek() {
                Tok::Newline | Tok::Semi | Tok::Eof => {}
                Tok::RBrace if in_block => {}
                other => {
                    return Err(self.error(format!(
                        "expected end of statement, found {}",
                        describe(other)
                    )))
                }
            }
        }
        Ok(stmts)
    }

    fn block(&mut self) -> Result<Vec<Stmt>, SandboxError> {
        self.enter()?;
        self.expect(&Tok::LBrace, "'{'")?;
        let stmts = self.statements(true)?;
        self.expect(&Tok::RBrace, "'}'")?;
        self.leave();
        Ok(stmts)
    }

    fn statement(&mut self) -> Result<Stmt, SandboxError> {
        let line = self.line();
        match self.peek().clone() {
            Tok::If => self.if_statement(),
            Tok::For => {
                self.advance();
                let var = match self.advance() {
                    Tok::Ident(name) => name,
                    other => {
                        return Err(self.error(format!(
                            "expected loop variable, found {}",
                            describe(&other)
                        )))
                    }
                };
                self.expect(&Tok::In, "'in'")?;
                let iter = self.expr()?;
                let body = self.block()?;
                Ok(Stmt::For {
                    var,
                    iter,
                    body,
                    line,
                })
            }
            Tok::Ident(name) if *self.peek_at(1) == Tok::Assign => {
                self.advance();
                self.advance();
                let value = self.expr()?;
                Ok(Stmt::Assign { name, value, line })
            }
            tok if reserved_word(&tok).is_some() && *self.peek_at(1) == Tok::Assign => Err(
                self.error(format!(
                    "cannot assign to reserved name '{}'",
                    reserved_word(&tok).unwrap_or_default()
                )),
            ),
            _ => Ok(Stmt::Expr(self.expr()?)),
        }
    }

    fn if_statement(&mut self) -> Result<Stmt, SandboxError> {
        self.expect(&Tok::If, "'if'")?;
        let cond = self.expr()?;
        let then = self.block()?;
        // else 可以出现在下一行
        let save = self.pos;
        while *self.peek() == Tok::Newline {
            self.advance();
        }
        let otherwise = if self.eat(&Tok::Else) {
            if *self.peek() == Tok::If {
                self.enter()?;
                let nested = self.if_statement()?;
                self.leave();
                vec![nested]
            } else {
                self.block()?
            }
        } else {
            self.pos = save;
            Vec::new()
        };
        Ok(Stmt::If {
            cond,
            then,
            otherwise,
        })
    }

    fn expr(&mut self) -> Result<Expr, SandboxError> {
        self.enter()?;
        let expr = self.or();
        self.leave();
        expr
    }

    fn or(&mut self) -> Result<Expr, SandboxError> {
        let mut lhs = self.and()?;
        let mut folds = 0;
        while *self.peek() == Tok::OrOr {
            self.enter()?;
            folds += 1;
            let line = self.line();
            self.advance();
            let rhs = self.and()?;
            lhs = Expr {
                kind: ExprKind::Or(Box::new(lhs), Box::new(rhs)),
                line,
            };
        }
        self.depth -= folds;
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, SandboxError> {
        let mut lhs = self.equality()?;
        let mut folds = 0;
        while *self.peek() == Tok::AndAnd {
            self.enter()?;
            folds += 1;
            let line = self.line();
            self.advance();
            let rhs = self.equality()?;
            lhs = Expr {
                kind: ExprKind::And(Box::new(lhs), Box::new(rhs)),
                line,
            };
        }
        self.depth -= folds;
        Ok(lhs)
    }

    fn binary_level(
        &mut self,
        next: fn(&mut Self) -> Result<Expr, SandboxError>,
        op_of: fn(&Tok) -> Option<BinOp>,
    ) -> Result<Expr, SandboxError> {
        let mut lhs = next(self)?;
        // 左结合链每折叠一层，语法树就深一层
        let mut folds = 0;
        while let Some(op) = op_of(self.peek()) {
            self.enter()?;
            folds += 1;
            let line = self.line();
            self.advance();
            let rhs = next(self)?;
            lhs = Expr {
                kind: ExprKind::Binary(op, Box::new(lhs), Box::new(rhs)),
                line,
            };
        }
        self.depth -= folds;
        Ok(lhs)
    }

    fn equality(&mut self) -> Result<Expr, SandboxError> {
        self.binary_level(Self::comparison, |t| match t {
            Tok::EqEq => Some(BinOp::Eq),
            Tok::NotEq => Some(BinOp::NotEq),
            _ => None,
        })
    }

    fn comparison(&mut self) -> Result<Expr, SandboxError> {
        self.binary_level(Self::additive, |t| match t {
            Tok::Lt => Some(BinOp::Lt),
            Tok::Le => Some(BinOp::Le),
            Tok::Gt => Some(BinOp::Gt),
            Tok::Ge => Some(BinOp::Ge),
            _ => None,
        })
    }

    fn additive(&mut self) -> Result<Expr, SandboxError> {
        self.binary_level(Self::multiplicative, |t| match t {
            Tok::Plus => Some(BinOp::Arith(ArithOp::Add)),
            Tok::Minus => Some(BinOp::Arith(ArithOp::Sub)),
            _ => None,
        })
    }

    fn multiplicative(&mut self) -> Result<Expr, SandboxError> {
        self.binary_level(Self::unary, |t| match t {
            Tok::Star => Some(BinOp::Arith(ArithOp::Mul)),
            Tok::Slash => Some(BinOp::Arith(ArithOp::Div)),
            Tok::Percent => Some(BinOp::Arith(ArithOp::Rem)),
            _ => None,
        })
    }

    fn unary(&mut self) -> Result<Expr, SandboxError> {
        let line = self.line();
        let op = match self.peek() {
            Tok::Minus => UnOp::Neg,
            Tok::Bang => UnOp::Not,
            _ => return self.postfix(),
        };
        self.advance();
        self.enter()?;
        let operand = self.unary()?;
        self.leave();
        Ok(Expr {
            kind: ExprKind::Unary(op, Box::new(operand)),
            line,
        })
    }

    fn postfix(&mut self) -> Result<Expr, SandboxError> {
        let mut expr = self.primary()?;
        let mut folds = 0;
        loop {
            let line = self.line();
            if matches!(self.peek(), Tok::LBracket | Tok::Dot) {
                self.enter()?;
                folds += 1;
            }
            match self.peek() {
                Tok::LBracket => {
                    self.advance();
                    let index = self.expr()?;
                    self.expect(&Tok::RBracket, "']'")?;
                    expr = Expr {
                        kind: ExprKind::Index(Box::new(expr), Box::new(index)),
                        line,
                    };
                }
                Tok::Dot => {
                    self.advance();
                    let field = match self.advance() {
                        Tok::Ident(name) => name,
                        other => {
                            return Err(self.error(format!(
                                "expected field name, found {}",
                                describe(&other)
                            )))
                        }
                    };
                    expr = Expr {
                        kind: ExprKind::Field(Box::new(expr), field),
                        line,
                    };
                }
                _ => {
                    self.depth -= folds;
                    return Ok(expr);
                }
            }
        }
    }

    fn arguments(&mut self) -> Result<Vec<Expr>, SandboxError> {
        self.expect(&Tok::LParen, "'('")?;
        let mut args = Vec::new();
        if self.eat(&Tok::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.expr()?);
            if self.eat(&Tok::Comma) {
                if self.eat(&Tok::RParen) {
                    return Ok(args);
                }
                continue;
            }
            self.expect(&Tok::RParen, "')' or ','")?;
            return Ok(args);
        }
    }

    fn primary(&mut self) -> Result<Expr, SandboxError> {
        let line = self.line();
        let kind = match self.advance() {
            Tok::Int(n) => ExprKind::Literal(Value::from(n)),
            Tok::Float(f) => match serde_json::Number::from_f64(f) {
                Some(n) => ExprKind::Literal(Value::Number(n)),
                None => return Err(self.error(format!("invalid number literal: {f}"))),
            },
            Tok::Str(s) => ExprKind::Literal(Value::String(s)),
            Tok::True => ExprKind::Literal(Value::Bool(true)),
            Tok::False => ExprKind::Literal(Value::Bool(false)),
            Tok::Null => ExprKind::Literal(Value::Null),
            Tok::Ident(name) => {
                if *self.peek() == Tok::LParen {
                    ExprKind::Call(name, self.arguments()?)
                } else {
                    ExprKind::Var(name)
                }
            }
            tok @ (Tok::Tools | Tok::Agents) => {
                let ns = if tok == Tok::Tools {
                    Namespace::Tools
                } else {
                    Namespace::Agents
                };
                self.expect(&Tok::Dot, &format!("'.' after '{}'", ns.as_str()))?;
                let name = match self.advance() {
                    Tok::Ident(name) => name,
                    other => {
                        return Err(self.error(format!(
                            "expected {} name, found {}",
                            ns.as_str(),
                            describe(&other)
                        )))
                    }
                };
                if *self.peek() != Tok::LParen {
                    return Err(self.error(format!(
                        "{}.{name} must be called, e.g. {}.{name}(...)",
                        ns.as_str(),
                        ns.as_str()
                    )));
                }
                let args = self.arguments()?;
                ExprKind::External { ns, name, args }
            }
            Tok::LParen => {
                let inner = self.expr()?;
                self.expect(&Tok::RParen, "')'")?;
                return Ok(inner);
            }
            Tok::LBracket => {
                let mut items = Vec::new();
                while !self.eat(&Tok::RBracket) {
                    items.push(self.expr()?);
                    if !self.eat(&Tok::Comma) {
                        self.expect(&Tok::RBracket, "']' or ','")?;
                        break;
                    }
                }
                ExprKind::Array(items)
            }
            Tok::LBrace => ExprKind::Object(self.object_entries()?),
            other => {
                return Err(SandboxError::Syntax {
                    line,
                    message: format!("unexpected {}", describe(&other)),
                })
            }
        };
        Ok(Expr { kind, line })
    }

    /// `{` 之后的对象字面量条目；内部允许换行
    fn object_entries(&mut self) -> Result<Vec<(String, Expr)>, SandboxError> {
        let mut entries = Vec::new();
        loop {
            self.skip_newlines();
            if self.eat(&Tok::RBrace) {
                return Ok(entries);
            }
            let key = match self.advance() {
                Tok::Str(s) | Tok::Ident(s) => s,
                other => {
                    return Err(self.error(format!(
                        "expected object key, found {}",
                        describe(&other)
                    )))
                }
            };
            self.expect(&Tok::Colon, "':'")?;
            let value = self.expr()?;
            entries.push((key, value));
            self.skip_newlines();
            if !self.eat(&Tok::Comma) {
                self.skip_newlines();
                self.expect(&Tok::RBrace, "'}' or ','")?;
                return Ok(entries);
            }
        }
    }
}

fn reserved_word(tok: &Tok) -> Option<&'static str> {
    let word = match tok {
        Tok::If => "if",
        Tok::Else => "else",
        Tok::For => "for",
        Tok::In => "in",
        Tok::True => "true",
        Tok::False => "false",
        Tok::Null => "null",
        Tok::Tools => "tools",
        Tok::Agents => "agents",
        _ => return None,
    };
    debug_assert!(RESERVED.contains(&word));
    Some(word)
}

fn describe(tok: &Tok) -> String {
    match tok {
        Tok::Int(n) => format!("number {n}"),
        Tok::Float(f) => format!("number {f}"),
        Tok::Str(_) => "string".to_string(),
        Tok::Ident(name) => format!("'{name}'"),
        Tok::Newline => "end of line".to_string(),
        Tok::Eof => "end of input".to_string(),
        other => match reserved_word(other) {
            Some(word) => format!("'{word}'"),
            None => format!("{other:?}"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::lexer::tokenize;

    fn parse_src(src: &str) -> Result<Vec<Stmt>, SandboxError> {
        parse(tokenize(src)?)
    }

    #[test]
    fn test_precedence() {
        let stmts = parse_src("1 + 2 * 3").unwrap();
        let Stmt::Expr(Expr {
            kind: ExprKind::Binary(BinOp::Arith(ArithOp::Add), _, rhs),
            ..
        }) = &stmts[0]
        else {
            panic!("expected addition at top: {stmts:?}");
        };
        assert!(matches!(
            rhs.kind,
            ExprKind::Binary(BinOp::Arith(ArithOp::Mul), _, _)
        ));
    }

    #[test]
    fn test_external_call_requires_parens() {
        assert!(parse_src("tools.search").is_err());
        let stmts = parse_src("r = agents.calc(\"2+2\")").unwrap();
        assert!(matches!(
            &stmts[0],
            Stmt::Assign { value: Expr { kind: ExprKind::External { ns: Namespace::Agents, .. }, .. }, .. }
        ));
    }

    #[test]
    fn test_reserved_names_cannot_be_assigned() {
        let err = parse_src("tools = 1").unwrap_err();
        assert!(err.to_string().contains("reserved"));
        assert!(parse_src("agents = {}").is_err());
    }

    #[test]
    fn test_if_else_chain_across_lines() {
        let src = "if x > 1 {\n  y = 1\n}\nelse if x > 0 {\n  y = 2\n} else { y = 3 }";
        let stmts = parse_src(src).unwrap();
        assert_eq!(stmts.len(), 1);
        let Stmt::If { otherwise, .. } = &stmts[0] else {
            panic!("expected if");
        };
        assert!(matches!(otherwise[0], Stmt::If { .. }));
    }

    #[test]
    fn test_object_literal_multiline() {
        let stmts = parse_src("o = {\n \"a\": 1,\n b: [1, 2],\n}").unwrap();
        let Stmt::Assign { value, .. } = &stmts[0] else {
            panic!("expected assignment");
        };
        assert!(matches!(&value.kind, ExprKind::Object(entries) if entries.len() == 2));
    }

    #[test]
    fn test_nesting_limit() {
        let src = format!("{}1{}", "(".repeat(200), ")".repeat(200));
        let err = parse_src(&src).unwrap_err();
        assert!(err.to_string().contains("too deep"));
    }

    #[test]
    fn test_long_operator_chains_hit_nesting_limit() {
        let sum = format!("x = 1{}", " + 1".repeat(5000));
        assert!(matches!(parse_src(&sum), Err(SandboxError::Syntax { .. })));
        let conj = format!("x = true{}", " && true".repeat(5000));
        assert!(matches!(parse_src(&conj), Err(SandboxError::Syntax { .. })));
        let fields = format!("x = o{}", ".a".repeat(5000));
        assert!(matches!(parse_src(&fields), Err(SandboxError::Syntax { .. })));
        // 限制内的链不受影响，且深度在语句之间会复位
        let short = format!("x = 1{}\ny = 1{}", " + 1".repeat(40), " * 2".repeat(40));
        assert_eq!(parse_src(&short).unwrap().len(), 2);
    }

    #[test]
    fn test_two_statements_on_one_line_need_separator() {
        assert!(parse_src("x = 1 y = 2").is_err());
        assert_eq!(parse_src("x = 1; y = 2").unwrap().len(), 2);
    }
}
