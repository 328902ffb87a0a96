//! Parser for the kernel language
//!
//! Parses Python-shaped kernel sources like:
//!
//! ```text
//! def add(a: int32[M, N], b: int32[M, N]) -> int32[M, N]:
//!     for i in range(M):
//!         for j in range(N):
//!             k: int32 = a[i, j] + b[i, j]
//!     return a
//! ```
//!
//! The parser accepts a little more than the lowering engine supports
//! (`while`, `pass`, slices, keyword arguments, ...) so that unsupported
//! constructs are rejected with a precise message instead of a syntax error.

use crate::ast::{
    BinOp, BoolOp, CmpOp, Constant, Expr, FunctionDef, Keyword, Module, Param, Stmt, StmtKind,
    UnaryOp,
};
use crate::error::{CompileError, CompileResult};
use crate::lexer::{tokenize, Lexeme, Spanned, Token};

/// Strip the common leading whitespace of all non-blank lines
pub fn dedent(source: &str) -> String {
    let margin = source
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(indent_width)
        .min()
        .unwrap_or(0);

    // the margin only spans ASCII blanks, so slicing at it stays on a char boundary
    source
        .lines()
        .map(|line| {
            if indent_width(line) >= margin {
                &line[margin..]
            } else {
                line.trim_start_matches([' ', '\t'])
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Bytes of leading spaces and tabs
fn indent_width(line: &str) -> usize {
    line.len() - line.trim_start_matches([' ', '\t']).len()
}

/// Parser for kernel sources
pub struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
}

impl Parser {
    pub fn new(source: &str) -> CompileResult<Self> {
        Ok(Self {
            tokens: tokenize(source)?,
            pos: 0,
        })
    }

    fn current(&self) -> Option<&Lexeme> {
        self.tokens.get(self.pos).map(|s| &s.lexeme)
    }

    fn peek_at(&self, offset: usize) -> Option<&Lexeme> {
        self.tokens.get(self.pos + offset).map(|s| &s.lexeme)
    }

    /// Line of the current lexeme (or of the last one at end of input)
    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|s| s.line)
            .unwrap_or(1)
    }

    /// Advance to the next lexeme
    fn advance(&mut self) -> Option<Spanned> {
        let prev = self.tokens.get(self.pos).cloned();
        if prev.is_some() {
            self.pos += 1;
        }
        prev
    }

    /// Check if current token matches expected (payloads are ignored)
    fn check(&self, expected: &Token) -> bool {
        match self.current() {
            Some(Lexeme::Token(tok)) => std::mem::discriminant(tok) == std::mem::discriminant(expected),
            _ => false,
        }
    }

    fn check_lexeme(&self, expected: &Lexeme) -> bool {
        self.current() == Some(expected)
    }

    /// Consume token if it matches, returning whether it did
    fn eat(&mut self, expected: &Token) -> bool {
        if self.check(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn error(&self, message: impl Into<String>) -> CompileError {
        CompileError::parse_error(self.line(), message)
    }

    fn unexpected(&self, wanted: &str) -> CompileError {
        match self.current() {
            Some(lexeme) => self.error(format!("expected {}, got {}", wanted, lexeme)),
            None => self.error(format!("expected {}, got end of input", wanted)),
        }
    }

    /// Consume token if it matches, otherwise error
    fn expect(&mut self, expected: Token) -> CompileResult<()> {
        if self.eat(&expected) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("'{}'", expected)))
        }
    }

    fn expect_lexeme(&mut self, expected: Lexeme) -> CompileResult<()> {
        if self.check_lexeme(&expected) {
            self.advance();
            Ok(())
        } else {
            Err(self.unexpected(&expected.to_string()))
        }
    }

    fn expect_ident(&mut self) -> CompileResult<String> {
        if let Some(Lexeme::Token(Token::Ident(name))) = self.current() {
            let name = name.clone();
            self.advance();
            Ok(name)
        } else {
            Err(self.unexpected("identifier"))
        }
    }

    fn skip_newlines(&mut self) {
        while self.check_lexeme(&Lexeme::Newline) {
            self.advance();
        }
    }

    /// Parse a complete module (a sequence of function definitions)
    pub fn parse_module(&mut self) -> CompileResult<Module> {
        let mut functions = Vec::new();

        self.skip_newlines();
        while self.current().is_some() {
            match self.parse_statement()?.into_iter().next() {
                Some(Stmt {
                    kind: StmtKind::FunctionDef(def),
                    ..
                }) => functions.push(*def),
                Some(stmt) => {
                    return Err(CompileError::parse_error(
                        stmt.line,
                        format!(
                            "only function definitions are allowed at module level, found {}",
                            stmt.kind.name()
                        ),
                    ))
                }
                None => {}
            }
            self.skip_newlines();
        }

        Ok(Module { functions })
    }

    /// Parse one logical line (simple statements joined by ';') or one compound statement
    fn parse_statement(&mut self) -> CompileResult<Vec<Stmt>> {
        match self.current() {
            Some(Lexeme::Token(Token::At)) | Some(Lexeme::Token(Token::Def)) => {
                let line = self.line();
                let def = self.parse_function_def()?;
                Ok(vec![Stmt::new(StmtKind::FunctionDef(Box::new(def)), line)])
            }
            Some(Lexeme::Token(Token::If)) => Ok(vec![self.parse_if()?]),
            Some(Lexeme::Token(Token::For)) => Ok(vec![self.parse_for()?]),
            Some(Lexeme::Token(Token::While)) => Ok(vec![self.parse_while()?]),
            Some(Lexeme::Indent) => Err(self.error("unexpected indent")),
            _ => self.parse_simple_line(),
        }
    }

    fn parse_simple_line(&mut self) -> CompileResult<Vec<Stmt>> {
        let mut stmts = vec![self.parse_simple_statement()?];
        while self.eat(&Token::Semicolon) {
            if self.check_lexeme(&Lexeme::Newline) {
                break;
            }
            stmts.push(self.parse_simple_statement()?);
        }
        if self.current().is_some() {
            self.expect_lexeme(Lexeme::Newline)?;
        }
        Ok(stmts)
    }

    fn parse_function_def(&mut self) -> CompileResult<FunctionDef> {
        let mut decorators = Vec::new();
        while self.eat(&Token::At) {
            decorators.push(self.parse_expr()?);
            self.expect_lexeme(Lexeme::Newline)?;
        }

        let line = self.line();
        self.expect(Token::Def)?;
        let name = self.expect_ident()?;

        self.expect(Token::LParen)?;
        let mut params = Vec::new();
        while !self.check(&Token::RParen) {
            let param_name = self.expect_ident()?;
            let annotation = if self.eat(&Token::Colon) {
                Some(self.parse_expr()?)
            } else {
                None
            };
            if self.check(&Token::Equals) {
                return Err(self.error("default argument values are not supported"));
            }
            params.push(Param {
                name: param_name,
                annotation,
            });
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(Token::RParen)?;

        let returns = if self.eat(&Token::Arrow) {
            Some(self.parse_expr()?)
        } else {
            None
        };

        let body = self.parse_block()?;
        let end_line = self.tokens[..self.pos]
            .iter()
            .rev()
            .find(|s| matches!(s.lexeme, Lexeme::Token(_)))
            .map(|s| s.line)
            .unwrap_or(line);

        Ok(FunctionDef {
            name,
            decorators,
            params,
            returns,
            body,
            line,
            end_line,
        })
    }

    /// Parse `':' suite`
    fn parse_block(&mut self) -> CompileResult<Vec<Stmt>> {
        self.expect(Token::Colon)?;

        if !self.check_lexeme(&Lexeme::Newline) {
            return self.parse_simple_line();
        }

        self.expect_lexeme(Lexeme::Newline)?;
        self.expect_lexeme(Lexeme::Indent)?;

        let mut body = Vec::new();
        while !self.check_lexeme(&Lexeme::Dedent) && self.current().is_some() {
            body.extend(self.parse_statement()?);
        }
        if self.current().is_some() {
            self.expect_lexeme(Lexeme::Dedent)?;
        }
        Ok(body)
    }

    fn parse_if(&mut self) -> CompileResult<Stmt> {
        // `if` or `elif`
        let line = self.line();
        self.advance();
        let test = self.parse_expr()?;
        let body = self.parse_block()?;

        let orelse = if self.check(&Token::Elif) {
            vec![self.parse_if()?]
        } else if self.eat(&Token::Else) {
            self.parse_block()?
        } else {
            Vec::new()
        };

        Ok(Stmt::new(StmtKind::If { test, body, orelse }, line))
    }

    fn parse_for(&mut self) -> CompileResult<Stmt> {
        let line = self.line();
        self.expect(Token::For)?;
        let target = self.parse_target_list()?;
        self.expect(Token::In)?;
        let iter = self.parse_testlist()?;
        let body = self.parse_block()?;
        let orelse = if self.eat(&Token::Else) {
            self.parse_block()?
        } else {
            Vec::new()
        };

        Ok(Stmt::new(
            StmtKind::For {
                target,
                iter,
                body,
                orelse,
            },
            line,
        ))
    }

    fn parse_while(&mut self) -> CompileResult<Stmt> {
        let line = self.line();
        self.expect(Token::While)?;
        let test = self.parse_expr()?;
        let body = self.parse_block()?;
        let orelse = if self.eat(&Token::Else) {
            self.parse_block()?
        } else {
            Vec::new()
        };

        Ok(Stmt::new(StmtKind::While { test, body, orelse }, line))
    }

    fn parse_simple_statement(&mut self) -> CompileResult<Stmt> {
        let line = self.line();

        let kind = match self.current() {
            Some(Lexeme::Token(Token::Pass)) => {
                self.advance();
                StmtKind::Pass
            }
            Some(Lexeme::Token(Token::Break)) => {
                self.advance();
                StmtKind::Break
            }
            Some(Lexeme::Token(Token::Continue)) => {
                self.advance();
                StmtKind::Continue
            }
            Some(Lexeme::Token(Token::Return)) => {
                self.advance();
                let value = if self.at_statement_end() {
                    None
                } else {
                    Some(self.parse_testlist()?)
                };
                StmtKind::Return { value }
            }
            _ => self.parse_expr_statement()?,
        };

        Ok(Stmt::new(kind, line))
    }

    fn at_statement_end(&self) -> bool {
        matches!(
            self.current(),
            None | Some(Lexeme::Newline) | Some(Lexeme::Dedent) | Some(Lexeme::Token(Token::Semicolon))
        )
    }

    /// Assignment, annotated declaration, augmented assignment or bare expression
    fn parse_expr_statement(&mut self) -> CompileResult<StmtKind> {
        let first = self.parse_testlist()?;

        if self.eat(&Token::Colon) {
            let annotation = self.parse_expr()?;
            let value = if self.eat(&Token::Equals) {
                Some(self.parse_testlist()?)
            } else {
                None
            };
            return Ok(StmtKind::AnnAssign {
                target: first,
                annotation,
                value,
            });
        }

        if let Some(op) = self.augmented_op() {
            self.advance();
            let value = self.parse_testlist()?;
            return Ok(StmtKind::AugAssign {
                target: first,
                op,
                value,
            });
        }

        if self.check(&Token::Equals) {
            let mut targets = vec![first];
            let mut value = None;
            while self.eat(&Token::Equals) {
                let next = self.parse_testlist()?;
                if let Some(prev) = value.replace(next) {
                    targets.push(prev);
                }
            }
            let value = value.ok_or_else(|| self.unexpected("expression"))?;
            return Ok(StmtKind::Assign { targets, value });
        }

        Ok(StmtKind::Expr(first))
    }

    fn augmented_op(&self) -> Option<BinOp> {
        let op = match self.current()? {
            Lexeme::Token(Token::PlusEq) => BinOp::Add,
            Lexeme::Token(Token::MinusEq) => BinOp::Sub,
            Lexeme::Token(Token::StarEq) => BinOp::Mult,
            Lexeme::Token(Token::SlashEq) => BinOp::Div,
            Lexeme::Token(Token::DoubleSlashEq) => BinOp::FloorDiv,
            Lexeme::Token(Token::PercentEq) => BinOp::Mod,
            Lexeme::Token(Token::DoubleStarEq) => BinOp::Pow,
            Lexeme::Token(Token::AmpEq) => BinOp::BitAnd,
            Lexeme::Token(Token::PipeEq) => BinOp::BitOr,
            Lexeme::Token(Token::CaretEq) => BinOp::BitXor,
            Lexeme::Token(Token::LShiftEq) => BinOp::LShift,
            Lexeme::Token(Token::RShiftEq) => BinOp::RShift,
            Lexeme::Token(Token::AtEq) => BinOp::MatMult,
            _ => return None,
        };
        Some(op)
    }

    /// `expr (',' expr)* [',']`, a tuple when a comma is present
    fn parse_testlist(&mut self) -> CompileResult<Expr> {
        let first = self.parse_expr()?;
        if !self.check(&Token::Comma) {
            return Ok(first);
        }

        let mut elements = vec![first];
        while self.eat(&Token::Comma) {
            if self.at_statement_end() || self.check(&Token::Equals) || self.check(&Token::Colon) {
                break;
            }
            elements.push(self.parse_expr()?);
        }
        Ok(Expr::Tuple(elements))
    }

    /// Loop targets stop before `in`
    fn parse_target_list(&mut self) -> CompileResult<Expr> {
        let first = self.parse_bitor()?;
        if !self.check(&Token::Comma) {
            return Ok(first);
        }
        let mut elements = vec![first];
        while self.eat(&Token::Comma) {
            if self.check(&Token::In) {
                break;
            }
            elements.push(self.parse_bitor()?);
        }
        Ok(Expr::Tuple(elements))
    }

    /// Parse an expression (handles operator precedence)
    pub fn parse_expr(&mut self) -> CompileResult<Expr> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> CompileResult<Expr> {
        let first = self.parse_and()?;
        if !self.check(&Token::Or) {
            return Ok(first);
        }
        let mut values = vec![first];
        while self.eat(&Token::Or) {
            values.push(self.parse_and()?);
        }
        Ok(Expr::BoolOp {
            op: BoolOp::Or,
            values,
        })
    }

    fn parse_and(&mut self) -> CompileResult<Expr> {
        let first = self.parse_not()?;
        if !self.check(&Token::And) {
            return Ok(first);
        }
        let mut values = vec![first];
        while self.eat(&Token::And) {
            values.push(self.parse_not()?);
        }
        Ok(Expr::BoolOp {
            op: BoolOp::And,
            values,
        })
    }

    fn parse_not(&mut self) -> CompileResult<Expr> {
        if self.eat(&Token::Not) {
            let operand = self.parse_not()?;
            return Ok(Expr::UnaryOp {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });
        }
        self.parse_comparison()
    }

    fn comparison_op(&self) -> Option<CmpOp> {
        let op = match self.current()? {
            Lexeme::Token(Token::EqEq) => CmpOp::Eq,
            Lexeme::Token(Token::NotEq) => CmpOp::NotEq,
            Lexeme::Token(Token::Lt) => CmpOp::Lt,
            Lexeme::Token(Token::LtE) => CmpOp::LtE,
            Lexeme::Token(Token::Gt) => CmpOp::Gt,
            Lexeme::Token(Token::GtE) => CmpOp::GtE,
            _ => return None,
        };
        Some(op)
    }

    fn parse_comparison(&mut self) -> CompileResult<Expr> {
        let left = self.parse_bitor()?;

        let mut ops = Vec::new();
        let mut comparators = Vec::new();
        while let Some(op) = self.comparison_op() {
            self.advance();
            ops.push(op);
            comparators.push(self.parse_bitor()?);
        }

        if ops.is_empty() {
            Ok(left)
        } else {
            Ok(Expr::Compare {
                left: Box::new(left),
                ops,
                comparators,
            })
        }
    }

    /// Left-associative binary level: `next (op next)*`
    fn parse_binary_level(
        &mut self,
        ops: &[(Token, BinOp)],
        next: fn(&mut Self) -> CompileResult<Expr>,
    ) -> CompileResult<Expr> {
        let mut left = next(self)?;

        'outer: loop {
            for (token, op) in ops {
                if self.eat(token) {
                    let right = next(self)?;
                    left = Expr::binop(left, *op, right);
                    continue 'outer;
                }
            }
            break;
        }

        Ok(left)
    }

    fn parse_bitor(&mut self) -> CompileResult<Expr> {
        self.parse_binary_level(&[(Token::Pipe, BinOp::BitOr)], Self::parse_bitxor)
    }

    fn parse_bitxor(&mut self) -> CompileResult<Expr> {
        self.parse_binary_level(&[(Token::Caret, BinOp::BitXor)], Self::parse_bitand)
    }

    fn parse_bitand(&mut self) -> CompileResult<Expr> {
        self.parse_binary_level(&[(Token::Amp, BinOp::BitAnd)], Self::parse_shift)
    }

    fn parse_shift(&mut self) -> CompileResult<Expr> {
        self.parse_binary_level(
            &[(Token::LShift, BinOp::LShift), (Token::RShift, BinOp::RShift)],
            Self::parse_additive,
        )
    }

    /// Parse additive expressions: a + b, a - b
    fn parse_additive(&mut self) -> CompileResult<Expr> {
        self.parse_binary_level(
            &[(Token::Plus, BinOp::Add), (Token::Minus, BinOp::Sub)],
            Self::parse_multiplicative,
        )
    }

    /// Parse multiplicative expressions: a * b, a / b, a // b, a % b, a @ b
    fn parse_multiplicative(&mut self) -> CompileResult<Expr> {
        self.parse_binary_level(
            &[
                (Token::Star, BinOp::Mult),
                (Token::Slash, BinOp::Div),
                (Token::DoubleSlash, BinOp::FloorDiv),
                (Token::Percent, BinOp::Mod),
                (Token::At, BinOp::MatMult),
            ],
            Self::parse_unary,
        )
    }

    /// Parse unary expressions: -a, +a, ~a
    ///
    /// A sign applied directly to a numeric literal is folded into the literal.
    fn parse_unary(&mut self) -> CompileResult<Expr> {
        let op = if self.eat(&Token::Minus) {
            UnaryOp::USub
        } else if self.eat(&Token::Plus) {
            UnaryOp::UAdd
        } else if self.eat(&Token::Tilde) {
            UnaryOp::Invert
        } else {
            return self.parse_power();
        };

        let operand = self.parse_unary()?;
        match (op, operand) {
            (UnaryOp::USub, Expr::Constant(Constant::Int(n))) => Ok(Expr::Constant(Constant::Int(-n))),
            (UnaryOp::USub, Expr::Constant(Constant::Float(n))) => {
                Ok(Expr::Constant(Constant::Float(-n)))
            }
            (UnaryOp::UAdd, literal @ Expr::Constant(Constant::Int(_) | Constant::Float(_))) => {
                Ok(literal)
            }
            (op, operand) => Ok(Expr::UnaryOp {
                op,
                operand: Box::new(operand),
            }),
        }
    }

    /// `postfix ['**' unary]`, right-associative
    fn parse_power(&mut self) -> CompileResult<Expr> {
        let base = self.parse_postfix()?;
        if self.eat(&Token::DoubleStar) {
            let exponent = self.parse_unary()?;
            return Ok(Expr::binop(base, BinOp::Pow, exponent));
        }
        Ok(base)
    }

    /// Parse postfix expressions: calls, subscripts, attributes
    fn parse_postfix(&mut self) -> CompileResult<Expr> {
        let mut expr = self.parse_primary()?;

        loop {
            if self.eat(&Token::Dot) {
                let attr = self.expect_ident()?;
                expr = Expr::Attribute {
                    value: Box::new(expr),
                    attr,
                };
            } else if self.check(&Token::LParen) {
                let (args, keywords) = self.parse_args()?;
                expr = Expr::Call {
                    func: Box::new(expr),
                    args,
                    keywords,
                };
            } else if self.eat(&Token::LBracket) {
                let indices = self.parse_subscript_list()?;
                expr = Expr::Subscript {
                    value: Box::new(expr),
                    indices,
                };
            } else {
                break;
            }
        }

        Ok(expr)
    }

    /// Parse primary expressions: literals, names, parenthesized expressions and tuples
    fn parse_primary(&mut self) -> CompileResult<Expr> {
        let lexeme = match self.current() {
            Some(lexeme) => lexeme.clone(),
            None => return Err(self.error("unexpected end of input")),
        };

        match lexeme {
            Lexeme::Token(Token::Int(n)) => {
                self.advance();
                Ok(Expr::Constant(Constant::Int(n)))
            }
            Lexeme::Token(Token::Float(n)) => {
                self.advance();
                Ok(Expr::Constant(Constant::Float(n)))
            }
            Lexeme::Token(Token::Str(s)) => {
                self.advance();
                Ok(Expr::Constant(Constant::Str(s)))
            }
            Lexeme::Token(Token::None) => {
                self.advance();
                Ok(Expr::Constant(Constant::None))
            }
            Lexeme::Token(Token::True) => {
                self.advance();
                Ok(Expr::Constant(Constant::Bool(true)))
            }
            Lexeme::Token(Token::False) => {
                self.advance();
                Ok(Expr::Constant(Constant::Bool(false)))
            }
            Lexeme::Token(Token::Ident(name)) => {
                self.advance();
                Ok(Expr::Name(name))
            }
            Lexeme::Token(Token::LParen) => {
                self.advance();

                if self.eat(&Token::RParen) {
                    return Ok(Expr::Tuple(Vec::new()));
                }

                let first = self.parse_expr()?;
                if self.check(&Token::Comma) {
                    // It's a tuple
                    let mut elements = vec![first];
                    while self.eat(&Token::Comma) {
                        if self.check(&Token::RParen) {
                            break; // Trailing comma
                        }
                        elements.push(self.parse_expr()?);
                    }
                    self.expect(Token::RParen)?;
                    Ok(Expr::Tuple(elements))
                } else {
                    self.expect(Token::RParen)?;
                    Ok(first)
                }
            }
            Lexeme::Token(Token::LBracket) | Lexeme::Token(Token::LBrace) => {
                Err(self.error("list, set and dict literals are not supported"))
            }
            _ => Err(self.unexpected("expression")),
        }
    }

    /// Parse call arguments: (arg1, arg2, name=value, ...)
    fn parse_args(&mut self) -> CompileResult<(Vec<Expr>, Vec<Keyword>)> {
        self.expect(Token::LParen)?;

        let mut args = Vec::new();
        let mut keywords = Vec::new();

        while !self.check(&Token::RParen) {
            let is_keyword = matches!(self.current(), Some(Lexeme::Token(Token::Ident(_))))
                && matches!(self.peek_at(1), Some(Lexeme::Token(Token::Equals)));

            if is_keyword {
                let arg = self.expect_ident()?;
                self.expect(Token::Equals)?;
                keywords.push(Keyword {
                    arg,
                    value: self.parse_expr()?,
                });
            } else if !keywords.is_empty() {
                return Err(self.error("positional argument follows keyword argument"));
            } else {
                args.push(self.parse_expr()?);
            }

            if !self.eat(&Token::Comma) {
                break;
            }
        }

        self.expect(Token::RParen)?;
        Ok((args, keywords))
    }

    /// Parse the inside of `[...]` after the opening bracket
    fn parse_subscript_list(&mut self) -> CompileResult<Vec<Expr>> {
        let mut indices = Vec::new();

        while !self.check(&Token::RBracket) {
            indices.push(self.parse_subscript_item()?);
            if !self.eat(&Token::Comma) {
                break;
            }
        }

        self.expect(Token::RBracket)?;
        if indices.is_empty() {
            return Err(self.error("empty subscript"));
        }
        Ok(indices)
    }

    fn parse_subscript_item(&mut self) -> CompileResult<Expr> {
        let lower = if self.check(&Token::Colon) {
            None
        } else {
            let expr = self.parse_expr()?;
            if !self.check(&Token::Colon) {
                return Ok(expr);
            }
            Some(Box::new(expr))
        };

        self.expect(Token::Colon)?;
        let slice_end = |p: &Self| p.check(&Token::Colon) || p.check(&Token::Comma) || p.check(&Token::RBracket);

        let upper = if slice_end(self) {
            None
        } else {
            Some(Box::new(self.parse_expr()?))
        };
        let step = if self.eat(&Token::Colon) && !slice_end(self) {
            Some(Box::new(self.parse_expr()?))
        } else {
            None
        };

        Ok(Expr::Slice { lower, upper, step })
    }
}

/// Parse a kernel source into a module, dedenting it first
pub fn parse_module(source: &str) -> CompileResult<Module> {
    Parser::new(&dedent(source))?.parse_module()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse_body(source: &str) -> Vec<Stmt> {
        let module = parse_module(source).unwrap();
        module.functions[0].body.clone()
    }

    #[test]
    fn test_parse_function_signature() {
        let module = parse_module("def foo(a: int32[M, N], b: float32[2 * M]) -> int32[M, N]:\n    return a\n").unwrap();

        assert_eq!(module.functions.len(), 1);
        let def = &module.functions[0];
        assert_eq!(def.name, "foo");
        assert_eq!(def.params.len(), 2);
        assert_eq!(
            def.params[0].annotation,
            Some(Expr::Subscript {
                value: Box::new(Expr::name("int32")),
                indices: vec![Expr::name("M"), Expr::name("N")],
            })
        );
        assert_eq!(
            def.params[1].annotation,
            Some(Expr::Subscript {
                value: Box::new(Expr::name("float32")),
                indices: vec![Expr::binop(Expr::int(2), BinOp::Mult, Expr::name("M"))],
            })
        );
        assert!(def.returns.is_some());
    }

    #[test]
    fn test_parse_nested_loops() {
        let body = parse_body(
            "def foo(a: int32[M, N]) -> int32[M, N]:
                for i in range(M):
                    for j in range(N):
                        k: int32 = i + j
                return a",
        );

        assert_eq!(body.len(), 2);
        let StmtKind::For { target, body: outer, .. } = &body[0].kind else {
            panic!("Expected For");
        };
        assert_eq!(target, &Expr::name("i"));
        let StmtKind::For { body: inner, .. } = &outer[0].kind else {
            panic!("Expected nested For");
        };
        assert!(matches!(inner[0].kind, StmtKind::AnnAssign { .. }));
        assert_eq!(inner[0].line, 4);
        assert!(matches!(body[1].kind, StmtKind::Return { value: Some(_) }));
    }

    #[test]
    fn test_parse_precedence() {
        let body = parse_body("def f(a: int32[N]):\n    k = (a[i] + c[j]) / (b[i] * d[i]) - 1\n");
        let StmtKind::Assign { value, .. } = &body[0].kind else {
            panic!("Expected Assign");
        };
        let Expr::BinOp { op, left, .. } = value else {
            panic!("Expected BinOp");
        };
        assert_eq!(*op, BinOp::Sub);
        assert!(matches!(left.as_ref(), Expr::BinOp { op: BinOp::Div, .. }));
    }

    #[test]
    fn test_parse_if_elif_else() {
        let body = parse_body(
            "def f(a: int32[N]):
                if a[0] % 2 == 1:
                    k: int32 = 1
                elif a[0] > 3:
                    k: int32 = 2
                else:
                    k: int32 = 3",
        );
        let StmtKind::If { test, orelse, .. } = &body[0].kind else {
            panic!("Expected If");
        };
        assert!(matches!(test, Expr::Compare { .. }));
        assert!(matches!(orelse[0].kind, StmtKind::If { .. }));
    }

    #[test]
    fn test_parse_negative_literal_folding() {
        let body = parse_body("def f(a: int32[N]):\n    k = -1\n    m = -k\n");
        let StmtKind::Assign { value, .. } = &body[0].kind else {
            panic!("Expected Assign");
        };
        assert_eq!(value, &Expr::int(-1));
        let StmtKind::Assign { value, .. } = &body[1].kind else {
            panic!("Expected Assign");
        };
        assert!(matches!(value, Expr::UnaryOp { op: UnaryOp::USub, .. }));
    }

    #[test]
    fn test_parse_multi_target_and_tuple_return() {
        let body = parse_body("def f(a: int32[N]):\n    x = y = 1\n    return a, a\n");
        let StmtKind::Assign { targets, .. } = &body[0].kind else {
            panic!("Expected Assign");
        };
        assert_eq!(targets.len(), 2);
        assert!(matches!(
            body[1].kind,
            StmtKind::Return { value: Some(Expr::Tuple(_)) }
        ));
    }

    #[test]
    fn test_parse_aug_assign_and_slices() {
        let body = parse_body("def f(a: int32[N]):\n    a[1:N:2] += 3\n");
        let StmtKind::AugAssign { target, op, .. } = &body[0].kind else {
            panic!("Expected AugAssign");
        };
        assert_eq!(*op, BinOp::Add);
        let Expr::Subscript { indices, .. } = target else {
            panic!("Expected Subscript");
        };
        assert!(matches!(indices[0], Expr::Slice { .. }));
    }

    #[test]
    fn test_parse_decorated_and_inline_block() {
        let module = parse_module("@kernel\ndef f(a: int32[N]):\n    if a[0] > 0: return a\n").unwrap();
        let def = &module.functions[0];
        assert_eq!(def.decorators, vec![Expr::name("kernel")]);
        assert!(matches!(def.body[0].kind, StmtKind::If { .. }));
    }

    #[test]
    fn test_parse_dedents_embedded_source() {
        let source = "
            def f(a: int32[N]):
                return a
        ";
        let module = parse_module(source).unwrap();
        assert_eq!(module.functions[0].line, 2);
    }

    #[test]
    fn test_dedent_only_strips_ascii_blanks() {
        assert_eq!(dedent("  a\n    b\n\n  c"), "a\n  b\n\nc");
        assert_eq!(dedent("\tx\n\t\ty"), "x\n\ty");

        // a non-breaking space is not indentation; the margin stays zero
        let source = " def f():\n\u{a0}\u{a0}x\n";
        assert_eq!(dedent(source), " def f():\n\u{a0}\u{a0}x");
        assert!(matches!(parse_module(source), Err(CompileError::LexerError { .. })));

        // blank lines shorter than the margin are emptied
        assert_eq!(dedent("    a\n  \n    b"), "a\n\nb");
    }

    #[test]
    fn test_parse_rejects_module_level_statement() {
        let err = parse_module("x = 1\n").unwrap_err();
        assert!(matches!(err, CompileError::ParseError { line: 1, .. }));
    }

    #[test]
    fn test_parse_error_reports_line() {
        let err = parse_module("def f(a: int32[N]):\n    k = (1 +\n").unwrap_err();
        assert!(matches!(err, CompileError::ParseError { .. }));
    }
}
