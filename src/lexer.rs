//! Lexer for the rac language
//!
//! The lexer converts source code into a stream of tokens, one token at a
//! time. It uses the `logos` crate for the actual character scanning and
//! adds the single-token peek the parser relies on.
//!
//! The lexer is deliberately permissive: a byte no rule matches, an
//! unterminated string, or an unterminated block comment all surface as an
//! end-of-file token. Rejection happens in the parser, which reports an
//! unexpected token at that point.

use crate::span::Span;
use crate::token::{Token, TokenKind};
use logos::Logos;

/// The lexer for rac source
pub struct Lexer<'src> {
    source: &'src str,
    inner: logos::Lexer<'src, TokenKind>,
    peeked: Option<Token>,
}

impl<'src> Lexer<'src> {
    /// Create a new lexer for the given source code
    pub fn new(source: &'src str) -> Self {
        Self {
            source,
            inner: TokenKind::lexer(source),
            peeked: None,
        }
    }

    /// Get the source code
    pub fn source(&self) -> &'src str {
        self.source
    }

    /// Peek at the next token without consuming it
    pub fn peek(&mut self) -> &Token {
        if self.peeked.is_none() {
            self.peeked = Some(self.produce());
        }
        self.peeked.as_ref().unwrap()
    }

    /// Get the next token
    pub fn next_token(&mut self) -> Token {
        if let Some(token) = self.peeked.take() {
            return token;
        }
        self.produce()
    }

    fn produce(&mut self) -> Token {
        match self.inner.next() {
            Some(Ok(kind)) => {
                let span = self.inner.span();
                Token::new(kind, Span::new(span.start, span.end))
            }
            Some(Err(())) => {
                // Unrecognized byte. Report end-of-file here; the stream
                // resumes with the next recognizable token.
                let span = self.inner.span();
                Token::new(TokenKind::Eof, Span::new(span.start, span.end))
            }
            None => {
                let pos = self.source.len();
                Token::new(TokenKind::Eof, Span::new(pos, pos))
            }
        }
    }

    /// Collect all tokens into a vector, ending with the first `Eof`
    pub fn tokenize(mut self) -> Vec<Token> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token();
            let done = token.kind == TokenKind::Eof;
            tokens.push(token);
            if done {
                break;
            }
        }
        tokens
    }
}

/// Helper function to lex source code
pub fn lex(source: &str) -> Vec<Token> {
    Lexer::new(source).tokenize()
}
