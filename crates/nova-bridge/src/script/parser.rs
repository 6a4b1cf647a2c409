use crate::provider::CompileError;
use crate::value::HostValue;

use super::globals::HostGlobals;
use super::lexer::{tokenize, Punct, Token, TokenKind};

/// Nesting limit for expressions and blocks; keeps evaluation recursion bounded.
const MAX_DEPTH: usize = 128;

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Expr {
    Literal(HostValue),
    /// Parameter or local variable slot.
    Local(usize),
    /// Dotted path into the host globals (`console.log`, `Math.PI`).
    Global(String),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Logical(LogicalOp, Box<Expr>, Box<Expr>),
    Conditional(Box<Expr>, Box<Expr>, Box<Expr>),
    Member {
        object: Box<Expr>,
        property: String,
        optional: bool,
    },
    Index(Box<Expr>, Box<Expr>),
    Call(Box<Expr>, Vec<Expr>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum UnaryOp {
    Not,
    Neg,
    Plus,
    TypeOf,
    Void,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    NotEq,
    StrictEq,
    StrictNotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LogicalOp {
    And,
    Or,
    Nullish,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Stmt {
    Expr(Expr),
    Let(usize, Expr),
    Return(Option<Expr>),
    If(Expr, Vec<Stmt>, Vec<Stmt>),
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Body {
    Expr(Expr),
    Block(Vec<Stmt>),
}

/// A parsed callback: parameters occupy the first local slots.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Function {
    pub(crate) params: usize,
    pub(crate) locals: usize,
    pub(crate) body: Body,
}

pub(crate) fn parse_callback(source: &str, globals: &HostGlobals) -> Result<Function, CompileError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        globals,
        scopes: Vec::new(),
        slots: 0,
        depth: 0,
    };
    let function = parser.callable()?;
    parser.expect_eof()?;
    Ok(function)
}

struct Parser<'g> {
    tokens: Vec<Token>,
    pos: usize,
    globals: &'g HostGlobals,
    /// Block scopes, innermost last: `(name, slot)`.
    scopes: Vec<Vec<(String, usize)>>,
    slots: usize,
    depth: usize,
}

impl Parser<'_> {
    fn peek(&self) -> &TokenKind {
        &self.tokens[self.pos].kind
    }

    fn peek_at(&self, ahead: usize) -> &TokenKind {
        let idx = (self.pos + ahead).min(self.tokens.len() - 1);
        &self.tokens[idx].kind
    }

    fn offset(&self) -> usize {
        self.tokens[self.pos].offset
    }

    fn bump(&mut self) -> TokenKind {
        let kind = self.tokens[self.pos].kind.clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        kind
    }

    fn at_punct(&self, punct: Punct) -> bool {
        *self.peek() == TokenKind::Punct(punct)
    }

    fn at_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), TokenKind::Ident(name) if name == keyword)
    }

    fn eat_punct(&mut self, punct: Punct) -> bool {
        if self.at_punct(punct) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, punct: Punct) -> Result<(), CompileError> {
        if self.eat_punct(punct) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("`{}`", punct.as_str())))
        }
    }

    fn expect_ident(&mut self) -> Result<String, CompileError> {
        match self.peek() {
            TokenKind::Ident(name) if !is_reserved(name) => {
                let name = name.clone();
                self.bump();
                Ok(name)
            }
            _ => Err(self.unexpected("an identifier")),
        }
    }

    fn expect_eof(&self) -> Result<(), CompileError> {
        match self.peek() {
            TokenKind::Eof => Ok(()),
            _ => Err(self.unexpected("end of input")),
        }
    }

    fn unexpected(&self, expected: &str) -> CompileError {
        let found = match self.peek() {
            TokenKind::Number(n) => format!("number {n}"),
            TokenKind::BigInt(n) => format!("bigint {n}n"),
            TokenKind::Str(s) => format!("string {s:?}"),
            TokenKind::Ident(name) => format!("`{name}`"),
            TokenKind::Punct(p) => format!("`{}`", p.as_str()),
            TokenKind::Eof => "end of input".to_owned(),
        };
        CompileError::at(self.offset(), format!("expected {expected}, found {found}"))
    }

    fn enter(&mut self) -> Result<(), CompileError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(CompileError::at(self.offset(), "callback source is nested too deeply"));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    fn declare(&mut self, name: String) -> Result<usize, CompileError> {
        let offset = self.tokens[self.pos.saturating_sub(1)].offset;
        let slot = self.slots;
        let Some(scope) = self.scopes.last_mut() else {
            return Err(CompileError::at(offset, "declaration outside of a function body"));
        };
        if scope.iter().any(|(existing, _)| *existing == name) {
            return Err(CompileError::at(
                offset,
                format!("`{name}` has already been declared"),
            ));
        }
        scope.push((name, slot));
        self.slots += 1;
        Ok(slot)
    }

    fn lookup(&self, name: &str) -> Option<usize> {
        self.scopes
            .iter()
            .rev()
            .flat_map(|scope| scope.iter().rev())
            .find(|(existing, _)| existing == name)
            .map(|(_, slot)| *slot)
    }

    // === Callables ==================================================================

    /// `function (a, b) { ... }`, `(a, b) => ...`, `a => ...`, optionally parenthesized.
    fn callable(&mut self) -> Result<Function, CompileError> {
        if self.at_keyword("function") {
            self.bump();
            // Optional name; it is not bound inside the body.
            if matches!(self.peek(), TokenKind::Ident(_)) {
                self.expect_ident()?;
            }
            let params = self.param_list()?;
            self.scopes.push(Vec::new());
            for param in params.iter().cloned() {
                self.declare(param)?;
            }
            let body = Body::Block(self.block()?);
            return Ok(self.finish_function(params.len(), body));
        }

        if let TokenKind::Ident(name) = self.peek() {
            if *self.peek_at(1) == TokenKind::Punct(Punct::Arrow) && !is_reserved(name) {
                let param = self.expect_ident()?;
                self.bump();
                return self.arrow_body(vec![param]);
            }
        }

        if self.at_punct(Punct::LParen) {
            if self.looks_like_param_list() {
                let params = self.param_list()?;
                self.expect_punct(Punct::Arrow)?;
                return self.arrow_body(params);
            }
            self.bump();
            self.enter()?;
            let function = self.callable()?;
            self.leave();
            self.expect_punct(Punct::RParen)?;
            return Ok(function);
        }

        Err(self.unexpected("a function or arrow function"))
    }

    fn arrow_body(&mut self, params: Vec<String>) -> Result<Function, CompileError> {
        self.scopes.push(Vec::new());
        for param in params.iter().cloned() {
            self.declare(param)?;
        }
        let body = if self.at_punct(Punct::LBrace) {
            Body::Block(self.block()?)
        } else {
            Body::Expr(self.expr()?)
        };
        Ok(self.finish_function(params.len(), body))
    }

    fn finish_function(&mut self, params: usize, body: Body) -> Function {
        self.scopes.pop();
        Function {
            params,
            locals: self.slots,
            body,
        }
    }

    /// `( ident, ident ) =>` with balanced tokens; distinguishes an arrow parameter list from a
    /// parenthesized callable.
    fn looks_like_param_list(&self) -> bool {
        let mut ahead = 1;
        loop {
            match self.peek_at(ahead) {
                TokenKind::Punct(Punct::RParen) => {
                    return *self.peek_at(ahead + 1) == TokenKind::Punct(Punct::Arrow);
                }
                TokenKind::Ident(_) => {}
                TokenKind::Punct(Punct::Comma) => {}
                _ => return false,
            }
            ahead += 1;
        }
    }

    fn param_list(&mut self) -> Result<Vec<String>, CompileError> {
        self.expect_punct(Punct::LParen)?;
        let mut params = Vec::new();
        while !self.at_punct(Punct::RParen) {
            params.push(self.expect_ident()?);
            if !self.eat_punct(Punct::Comma) {
                break;
            }
        }
        self.expect_punct(Punct::RParen)?;
        Ok(params)
    }

    // === Statements =================================================================

    fn block(&mut self) -> Result<Vec<Stmt>, CompileError> {
        self.expect_punct(Punct::LBrace)?;
        self.enter()?;
        self.scopes.push(Vec::new());
        let mut stmts = Vec::new();
        while !self.at_punct(Punct::RBrace) {
            if matches!(self.peek(), TokenKind::Eof) {
                return Err(self.unexpected("`}`"));
            }
            if self.eat_punct(Punct::Semi) {
                continue;
            }
            stmts.push(self.statement()?);
        }
        self.bump();
        self.scopes.pop();
        self.leave();
        Ok(stmts)
    }

    fn statement(&mut self) -> Result<Stmt, CompileError> {
        if self.at_keyword("return") {
            self.bump();
            let value = if self.at_punct(Punct::Semi) || self.at_punct(Punct::RBrace) {
                None
            } else {
                Some(self.expr()?)
            };
            self.end_statement()?;
            return Ok(Stmt::Return(value));
        }

        if self.at_keyword("let") || self.at_keyword("const") || self.at_keyword("var") {
            self.bump();
            let name = self.expect_ident()?;
            let init = if self.eat_punct(Punct::Eq) {
                self.expr()?
            } else {
                Expr::Literal(HostValue::Undefined)
            };
            // Declared after the initializer so `let x = x` does not see itself.
            let slot = self.declare(name)?;
            self.end_statement()?;
            return Ok(Stmt::Let(slot, init));
        }

        if self.at_keyword("if") {
            self.bump();
            self.expect_punct(Punct::LParen)?;
            let cond = self.expr()?;
            self.expect_punct(Punct::RParen)?;
            let then = self.branch()?;
            let otherwise = if self.at_keyword("else") {
                self.bump();
                self.branch()?
            } else {
                Vec::new()
            };
            return Ok(Stmt::If(cond, then, otherwise));
        }

        let expr = self.expr()?;
        self.end_statement()?;
        Ok(Stmt::Expr(expr))
    }

    fn branch(&mut self) -> Result<Vec<Stmt>, CompileError> {
        if self.at_punct(Punct::LBrace) {
            return self.block();
        }
        self.enter()?;
        let stmt = self.statement()?;
        self.leave();
        Ok(vec![stmt])
    }

    fn end_statement(&mut self) -> Result<(), CompileError> {
        if self.eat_punct(Punct::Semi) || self.at_punct(Punct::RBrace) {
            return Ok(());
        }
        Err(self.unexpected("`;`"))
    }

    // === Expressions ================================================================

    fn expr(&mut self) -> Result<Expr, CompileError> {
        self.enter()?;
        let expr = self.conditional();
        self.leave();
        expr
    }

    fn conditional(&mut self) -> Result<Expr, CompileError> {
        let cond = self.nullish()?;
        if !self.eat_punct(Punct::Question) {
            return Ok(cond);
        }
        let then = self.expr()?;
        self.expect_punct(Punct::Colon)?;
        let otherwise = self.expr()?;
        Ok(Expr::Conditional(Box::new(cond), Box::new(then), Box::new(otherwise)))
    }

    fn nullish(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.or()?;
        while self.eat_punct(Punct::Nullish) {
            let rhs = self.or()?;
            lhs = Expr::Logical(LogicalOp::Nullish, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn or(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.and()?;
        while self.eat_punct(Punct::OrOr) {
            let rhs = self.and()?;
            lhs = Expr::Logical(LogicalOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.equality()?;
        while self.eat_punct(Punct::AndAnd) {
            let rhs = self.equality()?;
            lhs = Expr::Logical(LogicalOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn equality(&mut self) -> Result<Expr, CompileError> {
        self.binary_level(
            &[
                (Punct::EqEqEq, BinaryOp::StrictEq),
                (Punct::NotEqEq, BinaryOp::StrictNotEq),
                (Punct::EqEq, BinaryOp::Eq),
                (Punct::NotEq, BinaryOp::NotEq),
            ],
            Self::relational,
        )
    }

    fn relational(&mut self) -> Result<Expr, CompileError> {
        self.binary_level(
            &[
                (Punct::LtEq, BinaryOp::LtEq),
                (Punct::GtEq, BinaryOp::GtEq),
                (Punct::Lt, BinaryOp::Lt),
                (Punct::Gt, BinaryOp::Gt),
            ],
            Self::additive,
        )
    }

    fn additive(&mut self) -> Result<Expr, CompileError> {
        self.binary_level(
            &[(Punct::Plus, BinaryOp::Add), (Punct::Minus, BinaryOp::Sub)],
            Self::multiplicative,
        )
    }

    fn multiplicative(&mut self) -> Result<Expr, CompileError> {
        self.binary_level(
            &[
                (Punct::Star, BinaryOp::Mul),
                (Punct::Slash, BinaryOp::Div),
                (Punct::Percent, BinaryOp::Rem),
            ],
            Self::unary,
        )
    }

    fn binary_level(
        &mut self,
        ops: &[(Punct, BinaryOp)],
        next: fn(&mut Self) -> Result<Expr, CompileError>,
    ) -> Result<Expr, CompileError> {
        let mut lhs = next(self)?;
        'outer: loop {
            for (punct, op) in ops {
                if self.eat_punct(*punct) {
                    let rhs = next(self)?;
                    lhs = Expr::Binary(*op, Box::new(lhs), Box::new(rhs));
                    continue 'outer;
                }
            }
            return Ok(lhs);
        }
    }

    fn unary(&mut self) -> Result<Expr, CompileError> {
        let op = match self.peek() {
            TokenKind::Punct(Punct::Bang) => UnaryOp::Not,
            TokenKind::Punct(Punct::Minus) => UnaryOp::Neg,
            TokenKind::Punct(Punct::Plus) => UnaryOp::Plus,
            TokenKind::Ident(name) if name == "typeof" => UnaryOp::TypeOf,
            TokenKind::Ident(name) if name == "void" => UnaryOp::Void,
            _ => return self.postfix(),
        };
        self.bump();
        self.enter()?;
        let operand = self.unary();
        self.leave();
        Ok(Expr::Unary(op, Box::new(operand?)))
    }

    fn postfix(&mut self) -> Result<Expr, CompileError> {
        let mut expr = self.primary()?;
        loop {
            if self.at_punct(Punct::Dot) || self.at_punct(Punct::OptionalDot) {
                let optional = self.at_punct(Punct::OptionalDot);
                self.bump();
                let property = match self.peek() {
                    TokenKind::Ident(name) => name.clone(),
                    _ => return Err(self.unexpected("a property name")),
                };
                self.bump();
                expr = match expr {
                    Expr::Global(path) if !optional => {
                        let path = format!("{path}.{property}");
                        if !self.globals.is_known_path(&path) {
                            return Err(CompileError::at(
                                self.tokens[self.pos - 1].offset,
                                format!("`{path}` is not defined"),
                            ));
                        }
                        Expr::Global(path)
                    }
                    object => Expr::Member {
                        object: Box::new(object),
                        property,
                        optional,
                    },
                };
            } else if self.eat_punct(Punct::LBracket) {
                let index = self.expr()?;
                self.expect_punct(Punct::RBracket)?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else if self.eat_punct(Punct::LParen) {
                let mut args = Vec::new();
                while !self.at_punct(Punct::RParen) {
                    args.push(self.expr()?);
                    if !self.eat_punct(Punct::Comma) {
                        break;
                    }
                }
                self.expect_punct(Punct::RParen)?;
                expr = Expr::Call(Box::new(expr), args);
            } else {
                return Ok(expr);
            }
        }
    }

    fn primary(&mut self) -> Result<Expr, CompileError> {
        let offset = self.offset();
        if matches!(self.peek(), TokenKind::Punct(p) if *p != Punct::LParen) || *self.peek() == TokenKind::Eof {
            return Err(self.unexpected("an expression"));
        }
        match self.bump() {
            TokenKind::Number(n) => Ok(Expr::Literal(HostValue::Number(n))),
            TokenKind::BigInt(n) => Ok(Expr::Literal(HostValue::BigInt(n))),
            TokenKind::Str(s) => Ok(Expr::Literal(HostValue::String(s))),
            TokenKind::Punct(Punct::LParen) => {
                let expr = self.expr()?;
                self.expect_punct(Punct::RParen)?;
                Ok(expr)
            }
            TokenKind::Ident(name) => match name.as_str() {
                "true" => Ok(Expr::Literal(HostValue::Bool(true))),
                "false" => Ok(Expr::Literal(HostValue::Bool(false))),
                "null" => Ok(Expr::Literal(HostValue::Null)),
                "undefined" => Ok(Expr::Literal(HostValue::Undefined)),
                "NaN" => Ok(Expr::Literal(HostValue::Number(f64::NAN))),
                "Infinity" => Ok(Expr::Literal(HostValue::Number(f64::INFINITY))),
                "this" => Err(CompileError::at(offset, "`this` is not available in callbacks")),
                _ if is_reserved(&name) => Err(CompileError::at(
                    offset,
                    format!("unsupported keyword `{name}`"),
                )),
                _ => {
                    if let Some(slot) = self.lookup(&name) {
                        Ok(Expr::Local(slot))
                    } else if self.globals.is_known_path(&name) {
                        Ok(Expr::Global(name))
                    } else {
                        Err(CompileError::at(offset, format!("`{name}` is not defined")))
                    }
                }
            },
            _ => Err(CompileError::at(offset, "expected an expression")),
        }
    }
}

fn is_reserved(name: &str) -> bool {
    matches!(
        name,
        "function"
            | "return"
            | "let"
            | "const"
            | "var"
            | "if"
            | "else"
            | "this"
            | "new"
            | "class"
            | "for"
            | "while"
            | "do"
            | "switch"
            | "case"
            | "break"
            | "continue"
            | "throw"
            | "try"
            | "catch"
            | "finally"
            | "delete"
            | "in"
            | "instanceof"
            | "typeof"
            | "void"
            | "yield"
            | "await"
            | "async"
            | "import"
            | "export"
            | "with"
            | "true"
            | "false"
            | "null"
    )
}
