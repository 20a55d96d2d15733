//! Recursive-descent parser producing an `Expr`.
//!
//! ```text
//! expr       := or
//! or         := and ( "||" and )*
//! and        := equality ( "&&" equality )*
//! equality   := comparison ( ("==" | "!=") comparison )*
//! comparison := unary ( ("<" | "<=" | ">" | ">=") unary )*
//! unary      := ("!" | "-") unary | postfix
//! postfix    := primary ( "." IDENT | "[" expr "]" )*
//! primary    := NUMBER | STRING | true | false | null | "(" expr ")" | IDENT "(" args? ")"
//! ```

use serde_json::Value;

use super::ExpressionError;
use super::ast::{BinaryOp, Expr};
use super::eval::number_value;
use super::functions::Function;
use super::lexer::{Token, TokenKind, tokenize};

/// Nesting limit for parentheses, calls and unary chains.
const MAX_DEPTH: usize = 64;

/// Parse a complete expression.
pub fn parse_expression(input: &str) -> Result<Expr, ExpressionError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let expr = parser.parse_or()?;
    let trailing = parser.peek();
    if trailing.kind != TokenKind::Eof {
        return Err(ExpressionError::syntax(
            trailing.position,
            format!("unexpected {} after expression", trailing.kind),
        ));
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        // The lexer always ends the stream with Eof.
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if &self.peek().kind == kind {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind) -> Result<Token, ExpressionError> {
        let token = self.advance();
        if token.kind == kind {
            return Ok(token);
        }
        if token.kind == TokenKind::Eof {
            return Err(ExpressionError::UnexpectedEnd);
        }
        Err(ExpressionError::syntax(
            token.position,
            format!("expected '{kind}', found {}", token.kind),
        ))
    }

    fn enter(&mut self) -> Result<(), ExpressionError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ExpressionError::syntax(
                self.peek().position,
                "expression nested too deeply",
            ));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    // -----------------------------------------------------------------------
    // Precedence levels
    // -----------------------------------------------------------------------

    fn parse_or(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_and()?;
        while self.eat(&TokenKind::OrOr) {
            let right = self.parse_and()?;
            left = binary(BinaryOp::Or, left, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_equality()?;
        while self.eat(&TokenKind::AndAnd) {
            let right = self.parse_equality()?;
            left = binary(BinaryOp::And, left, right);
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_comparison()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::EqEq => BinaryOp::Eq,
                TokenKind::NotEq => BinaryOp::NotEq,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_comparison()?;
            left = binary(op, left, right);
        }
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Lt => BinaryOp::Lt,
                TokenKind::Le => BinaryOp::Le,
                TokenKind::Gt => BinaryOp::Gt,
                TokenKind::Ge => BinaryOp::Ge,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_unary()?;
            left = binary(op, left, right);
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, ExpressionError> {
        let wrap: fn(Box<Expr>) -> Expr = match self.peek().kind {
            TokenKind::Bang => Expr::Not,
            TokenKind::Minus => Expr::Negate,
            _ => return self.parse_postfix(),
        };
        self.advance();
        self.enter()?;
        let operand = self.parse_unary();
        self.leave();
        Ok(wrap(Box::new(operand?)))
    }

    fn parse_postfix(&mut self) -> Result<Expr, ExpressionError> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.eat(&TokenKind::Dot) {
                let token = self.advance();
                let field = match token.kind {
                    TokenKind::Ident(name) => name,
                    TokenKind::Eof => return Err(ExpressionError::UnexpectedEnd),
                    other => {
                        return Err(ExpressionError::syntax(
                            token.position,
                            format!("expected field name after '.', found {other}"),
                        ));
                    }
                };
                expr = Expr::Member {
                    target: Box::new(expr),
                    field,
                };
            } else if self.eat(&TokenKind::LBracket) {
                self.enter()?;
                let index = self.parse_or();
                self.leave();
                let index = index?;
                self.expect(TokenKind::RBracket)?;
                expr = Expr::Index {
                    target: Box::new(expr),
                    index: Box::new(index),
                };
            } else {
                return Ok(expr);
            }
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, ExpressionError> {
        let token = self.advance();
        match token.kind {
            TokenKind::Number(n) => Ok(Expr::Literal(number_value(n))),
            TokenKind::Str(s) => Ok(Expr::Literal(Value::String(s))),
            TokenKind::True => Ok(Expr::Literal(Value::Bool(true))),
            TokenKind::False => Ok(Expr::Literal(Value::Bool(false))),
            TokenKind::Null => Ok(Expr::Literal(Value::Null)),
            TokenKind::LParen => {
                self.enter()?;
                let inner = self.parse_or();
                self.leave();
                let inner = inner?;
                self.expect(TokenKind::RParen)?;
                Ok(inner)
            }
            TokenKind::Ident(name) => self.parse_call(name, token.position),
            TokenKind::Eof => Err(ExpressionError::UnexpectedEnd),
            other => Err(ExpressionError::syntax(
                token.position,
                format!("unexpected {other}"),
            )),
        }
    }

    fn parse_call(&mut self, name: String, position: usize) -> Result<Expr, ExpressionError> {
        if self.peek().kind != TokenKind::LParen {
            return Err(ExpressionError::syntax(
                position,
                format!("bare identifier '{name}' (use Variables('{name}') or a function call)"),
            ));
        }
        self.advance();

        self.enter()?;
        let args = self.parse_args();
        self.leave();
        let args = args?;

        match name.as_str() {
            "Variables" | "Results" => {
                let [Expr::Literal(Value::String(arg))] = args.as_slice() else {
                    return Err(ExpressionError::syntax(
                        position,
                        format!("{name}() takes exactly one string literal argument"),
                    ));
                };
                if name == "Variables" {
                    Ok(Expr::Variable(arg.clone()))
                } else {
                    Ok(Expr::Result(arg.clone()))
                }
            }
            _ => {
                let function = Function::from_name(&name)
                    .ok_or_else(|| ExpressionError::UnknownFunction(name.clone()))?;
                function.check_arity(args.len())?;
                Ok(Expr::Call { function, args })
            }
        }
    }

    fn parse_args(&mut self) -> Result<Vec<Expr>, ExpressionError> {
        let mut args = Vec::new();
        if self.eat(&TokenKind::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.parse_or()?);
            if self.eat(&TokenKind::Comma) {
                continue;
            }
            self.expect(TokenKind::RParen)?;
            return Ok(args);
        }
    }
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}
