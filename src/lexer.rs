//! Lexer for the kernel language using logos
//!
//! The token grammar is handled by logos. Block structure is layered on top:
//! the [`Lexer`] wrapper turns line breaks into `Newline`, `Indent` and
//! `Dedent` lexemes the way an offside-rule language needs, and drops line
//! breaks inside brackets.

use std::collections::VecDeque;

use logos::Logos;

use crate::error::{CompileError, CompileResult};

/// A run of one or more line breaks, with the indentation of the last line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineBreak {
    pub lines: usize,
    pub indent: usize,
}

fn line_break(lex: &mut logos::Lexer<Token>) -> LineBreak {
    let slice = lex.slice();
    let lines = slice.matches('\n').count();
    let indent = slice
        .rsplit('\n')
        .next()
        .map(|tail| tail.chars().map(|c| if c == '\t' { 8 } else { 1 }).sum())
        .unwrap_or(0);
    LineBreak { lines, indent }
}

fn strip_quotes(lex: &mut logos::Lexer<Token>) -> String {
    let slice = lex.slice();
    slice[1..slice.len() - 1].to_string()
}

/// Consume a triple-quoted string up to its closing quotes
fn triple_quoted(lex: &mut logos::Lexer<Token>) -> Option<String> {
    let quote = lex.slice().to_string();
    let end = lex.remainder().find(&quote)?;
    let body = lex.remainder()[..end].to_string();
    lex.bump(end + quote.len());
    Some(body)
}

/// Token types for the kernel language
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"([ \t\f]+|#[^\r\n]*|\\\r?\n)")]
pub enum Token {
    #[regex(r"(\r?\n[ \t]*)+", line_break)]
    LineBreak(LineBreak),

    // Literals
    #[regex(r"[0-9][0-9_]*", |lex| lex.slice().replace('_', "").parse::<i64>().ok())]
    Int(i64),

    #[regex(r"[0-9][0-9_]*\.[0-9_]*([eE][+-]?[0-9]+)?", |lex| lex.slice().replace('_', "").parse::<f64>().ok())]
    #[regex(r"\.[0-9][0-9_]*([eE][+-]?[0-9]+)?", |lex| lex.slice().replace('_', "").parse::<f64>().ok())]
    #[regex(r"[0-9][0-9_]*[eE][+-]?[0-9]+", |lex| lex.slice().replace('_', "").parse::<f64>().ok())]
    Float(f64),

    #[regex(r#""([^"\\\r\n]|\\.)*""#, strip_quotes)]
    #[regex(r#"'([^'\\\r\n]|\\.)*'"#, strip_quotes)]
    #[token("\"\"\"", triple_quoted)]
    #[token("'''", triple_quoted)]
    Str(String),

    // Keywords
    #[token("def")]
    Def,
    #[token("return")]
    Return,
    #[token("if")]
    If,
    #[token("elif")]
    Elif,
    #[token("else")]
    Else,
    #[token("for")]
    For,
    #[token("in")]
    In,
    #[token("while")]
    While,
    #[token("pass")]
    Pass,
    #[token("break")]
    Break,
    #[token("continue")]
    Continue,
    #[token("and")]
    And,
    #[token("or")]
    Or,
    #[token("not")]
    Not,
    #[token("None")]
    None,
    #[token("True")]
    True,
    #[token("False")]
    False,

    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),

    // Operators
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("**")]
    DoubleStar,
    #[token("/")]
    Slash,
    #[token("//")]
    DoubleSlash,
    #[token("%")]
    Percent,
    #[token("@")]
    At,
    #[token("&")]
    Amp,
    #[token("|")]
    Pipe,
    #[token("^")]
    Caret,
    #[token("~")]
    Tilde,
    #[token("<<")]
    LShift,
    #[token(">>")]
    RShift,

    // Comparisons
    #[token("<")]
    Lt,
    #[token(">")]
    Gt,
    #[token("<=")]
    LtE,
    #[token(">=")]
    GtE,
    #[token("==")]
    EqEq,
    #[token("!=")]
    NotEq,

    // Assignment
    #[token("=")]
    Equals,
    #[token("+=")]
    PlusEq,
    #[token("-=")]
    MinusEq,
    #[token("*=")]
    StarEq,
    #[token("/=")]
    SlashEq,
    #[token("//=")]
    DoubleSlashEq,
    #[token("%=")]
    PercentEq,
    #[token("**=")]
    DoubleStarEq,
    #[token("&=")]
    AmpEq,
    #[token("|=")]
    PipeEq,
    #[token("^=")]
    CaretEq,
    #[token("<<=")]
    LShiftEq,
    #[token(">>=")]
    RShiftEq,
    #[token("@=")]
    AtEq,

    // Punctuation
    #[token("->")]
    Arrow,
    #[token(".")]
    Dot,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token(",")]
    Comma,
    #[token(":")]
    Colon,
    #[token(";")]
    Semicolon,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Token::LineBreak(_) => "<newline>",
            Token::Int(n) => return write!(f, "{}", n),
            Token::Float(n) => return write!(f, "{}", n),
            Token::Str(s) => return write!(f, "{:?}", s),
            Token::Ident(s) => return write!(f, "{}", s),
            Token::Def => "def",
            Token::Return => "return",
            Token::If => "if",
            Token::Elif => "elif",
            Token::Else => "else",
            Token::For => "for",
            Token::In => "in",
            Token::While => "while",
            Token::Pass => "pass",
            Token::Break => "break",
            Token::Continue => "continue",
            Token::And => "and",
            Token::Or => "or",
            Token::Not => "not",
            Token::None => "None",
            Token::True => "True",
            Token::False => "False",
            Token::Plus => "+",
            Token::Minus => "-",
            Token::Star => "*",
            Token::DoubleStar => "**",
            Token::Slash => "/",
            Token::DoubleSlash => "//",
            Token::Percent => "%",
            Token::At => "@",
            Token::Amp => "&",
            Token::Pipe => "|",
            Token::Caret => "^",
            Token::Tilde => "~",
            Token::LShift => "<<",
            Token::RShift => ">>",
            Token::Lt => "<",
            Token::Gt => ">",
            Token::LtE => "<=",
            Token::GtE => ">=",
            Token::EqEq => "==",
            Token::NotEq => "!=",
            Token::Equals => "=",
            Token::PlusEq => "+=",
            Token::MinusEq => "-=",
            Token::StarEq => "*=",
            Token::SlashEq => "/=",
            Token::DoubleSlashEq => "//=",
            Token::PercentEq => "%=",
            Token::DoubleStarEq => "**=",
            Token::AmpEq => "&=",
            Token::PipeEq => "|=",
            Token::CaretEq => "^=",
            Token::LShiftEq => "<<=",
            Token::RShiftEq => ">>=",
            Token::AtEq => "@=",
            Token::Arrow => "->",
            Token::Dot => ".",
            Token::LParen => "(",
            Token::RParen => ")",
            Token::LBracket => "[",
            Token::RBracket => "]",
            Token::LBrace => "{",
            Token::RBrace => "}",
            Token::Comma => ",",
            Token::Colon => ":",
            Token::Semicolon => ";",
        };
        write!(f, "{}", text)
    }
}

/// What the parser consumes: real tokens plus block-structure markers
#[derive(Debug, Clone, PartialEq)]
pub enum Lexeme {
    Token(Token),
    Newline,
    Indent,
    Dedent,
}

impl std::fmt::Display for Lexeme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Lexeme::Token(tok) => write!(f, "'{}'", tok),
            Lexeme::Newline => write!(f, "end of line"),
            Lexeme::Indent => write!(f, "indent"),
            Lexeme::Dedent => write!(f, "dedent"),
        }
    }
}

/// A lexeme with the (1-based) source line it starts on
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub lexeme: Lexeme,
    pub line: usize,
}

/// Lexer wrapper that provides a stream of lexemes with block structure
pub struct Lexer<'source> {
    inner: logos::Lexer<'source, Token>,
    line: usize,
    indents: Vec<usize>,
    depth: usize,
    pending_indent: Option<usize>,
    queue: VecDeque<Spanned>,
    emitted_any: bool,
    last_was_newline: bool,
    finished: bool,
}

impl<'source> Lexer<'source> {
    pub fn new(source: &'source str) -> Self {
        Self {
            inner: Token::lexer(source),
            line: 1,
            indents: vec![0],
            depth: 0,
            pending_indent: None,
            queue: VecDeque::new(),
            emitted_any: false,
            last_was_newline: false,
            finished: false,
        }
    }

    /// Current line in the source
    pub fn line(&self) -> usize {
        self.line
    }

    fn push(&mut self, lexeme: Lexeme, line: usize) {
        self.last_was_newline = matches!(lexeme, Lexeme::Newline);
        self.emitted_any = true;
        self.queue.push_back(Spanned { lexeme, line });
    }

    /// Emit the newline and indentation changes owed before a token at `indent`
    fn open_line(&mut self, indent: usize) -> CompileResult<()> {
        if self.emitted_any && !self.last_was_newline {
            self.push(Lexeme::Newline, self.line);
        }

        let top = self.indents.last().copied().unwrap_or(0);
        if indent > top {
            self.indents.push(indent);
            self.push(Lexeme::Indent, self.line);
        } else if indent < top {
            while self.indents.last().is_some_and(|&level| level > indent) {
                self.indents.pop();
                self.push(Lexeme::Dedent, self.line);
            }
            if self.indents.last().copied().unwrap_or(0) != indent {
                return Err(CompileError::lexer(
                    self.line,
                    "unindent does not match any outer indentation level",
                ));
            }
        }
        Ok(())
    }

    fn finish(&mut self) {
        self.finished = true;
        if self.emitted_any && !self.last_was_newline {
            self.push(Lexeme::Newline, self.line);
        }
        while self.indents.len() > 1 {
            self.indents.pop();
            self.push(Lexeme::Dedent, self.line);
        }
    }
}

impl<'source> Iterator for Lexer<'source> {
    type Item = CompileResult<Spanned>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(spanned) = self.queue.pop_front() {
                return Some(Ok(spanned));
            }
            if self.finished {
                return None;
            }

            match self.inner.next() {
                None => self.finish(),
                Some(Err(())) => {
                    self.finished = true;
                    return Some(Err(CompileError::lexer(
                        self.line,
                        format!("unexpected character sequence '{}'", self.inner.slice()),
                    )));
                }
                Some(Ok(Token::LineBreak(lb))) => {
                    self.line += lb.lines;
                    if self.depth == 0 {
                        self.pending_indent = Some(lb.indent);
                    }
                }
                Some(Ok(tok)) => {
                    if let Some(indent) = self.pending_indent.take() {
                        if let Err(e) = self.open_line(indent) {
                            self.finished = true;
                            return Some(Err(e));
                        }
                    }
                    match tok {
                        Token::LParen | Token::LBracket | Token::LBrace => self.depth += 1,
                        Token::RParen | Token::RBracket | Token::RBrace => {
                            self.depth = self.depth.saturating_sub(1)
                        }
                        _ => {}
                    }
                    // multi-line strings start on this line but move the count on
                    let spanned_lines = match &tok {
                        Token::Str(text) => text.matches('\n').count(),
                        _ => 0,
                    };
                    self.push(Lexeme::Token(tok), self.line);
                    self.line += spanned_lines;
                }
            }
        }
    }
}

/// Lex a whole source into lexemes
pub fn tokenize(source: &str) -> CompileResult<Vec<Spanned>> {
    Lexer::new(source).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lexemes(source: &str) -> Vec<Lexeme> {
        tokenize(source).unwrap().into_iter().map(|s| s.lexeme).collect()
    }

    fn tok(t: Token) -> Lexeme {
        Lexeme::Token(t)
    }

    fn ident(s: &str) -> Lexeme {
        Lexeme::Token(Token::Ident(s.to_string()))
    }

    #[test]
    fn test_simple_tokens() {
        assert_eq!(
            lexemes("k = a[i, j] // 2"),
            vec![
                ident("k"),
                tok(Token::Equals),
                ident("a"),
                tok(Token::LBracket),
                ident("i"),
                tok(Token::Comma),
                ident("j"),
                tok(Token::RBracket),
                tok(Token::DoubleSlash),
                tok(Token::Int(2)),
                Lexeme::Newline,
            ]
        );
    }

    #[test]
    fn test_numbers() {
        assert_eq!(
            lexemes("1 2.5 1e3 .5 1_000"),
            vec![
                tok(Token::Int(1)),
                tok(Token::Float(2.5)),
                tok(Token::Float(1000.0)),
                tok(Token::Float(0.5)),
                tok(Token::Int(1000)),
                Lexeme::Newline,
            ]
        );
    }

    #[test]
    fn test_indentation() {
        let source = "def f(a: int32[M]):\n    for i in range(M):\n        k = i\n    return a\n";
        let lexemes = lexemes(source);

        let indents = lexemes.iter().filter(|l| **l == Lexeme::Indent).count();
        let dedents = lexemes.iter().filter(|l| **l == Lexeme::Dedent).count();
        assert_eq!(indents, 2);
        assert_eq!(dedents, 2);
        assert_eq!(lexemes.last(), Some(&Lexeme::Dedent));
    }

    #[test]
    fn test_comments_and_blank_lines() {
        let source = "x = 1\n\n    # indented comment\n\ny = 2";
        assert_eq!(
            lexemes(source),
            vec![
                ident("x"),
                tok(Token::Equals),
                tok(Token::Int(1)),
                Lexeme::Newline,
                ident("y"),
                tok(Token::Equals),
                tok(Token::Int(2)),
                Lexeme::Newline,
            ]
        );
    }

    #[test]
    fn test_brackets_join_lines() {
        let source = "k = f(a,\n      b)\n";
        let lexemes = lexemes(source);
        assert_eq!(lexemes.iter().filter(|l| **l == Lexeme::Newline).count(), 1);
        assert!(!lexemes.contains(&Lexeme::Indent));
    }

    #[test]
    fn test_line_numbers() {
        let spanned = tokenize("a = 1\nb = 2\n\nc = 3").unwrap();
        let c = spanned
            .iter()
            .find(|s| s.lexeme == ident("c"))
            .unwrap();
        assert_eq!(c.line, 4);
    }

    #[test]
    fn test_bad_dedent() {
        let source = "if x:\n        a = 1\n    b = 2\n";
        let err = tokenize(source).unwrap_err();
        assert!(matches!(err, CompileError::LexerError { line: 3, .. }));
    }

    #[test]
    fn test_unknown_character() {
        let err = tokenize("a = $").unwrap_err();
        assert!(matches!(err, CompileError::LexerError { line: 1, .. }));
    }

    #[test]
    fn test_triple_quoted_string_spans_lines() {
        let spanned = tokenize("\"\"\"doc\nmore\"\"\"\nx = 1").unwrap();
        assert_eq!(spanned[0].lexeme, tok(Token::Str("doc\nmore".to_string())));
        let x = spanned.iter().find(|s| s.lexeme == ident("x")).unwrap();
        assert_eq!(x.line, 3);
    }

    #[test]
    fn test_augmented_operators() {
        assert_eq!(
            lexemes("k //= 2"),
            vec![ident("k"), tok(Token::DoubleSlashEq), tok(Token::Int(2)), Lexeme::Newline]
        );
    }
}
