//! Pull tokenizer for JSON documents read from an async byte stream.
//!
//! Yields one structural or scalar token at a time in document order and
//! validates nesting as it goes. Nothing is buffered beyond the current
//! literal, so arbitrarily large documents can be scanned and abandoned
//! part way through.

use std::io;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("read failed: {0}")]
    Io(#[from] io::Error),
    #[error("{message} at byte {offset}")]
    Syntax { offset: u64, message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    BeginObject,
    EndObject,
    BeginArray,
    EndArray,
    /// Object member name.
    Name(String),
    String(String),
    /// Number literal as written in the document.
    Number(String),
    Bool(bool),
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Container {
    Object,
    Array,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Step {
    Value,
    FirstValueOrClose,
    FirstNameOrClose,
    Name,
    Colon,
    CommaOrClose,
    Done,
}

pub struct TokenReader<R> {
    reader: R,
    stack: Vec<Container>,
    step: Step,
    offset: u64,
}

impl<R: AsyncBufRead + Unpin> TokenReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            stack: Vec::new(),
            step: Step::Value,
            offset: 0,
        }
    }

    /// Number of bytes consumed so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Current nesting depth; 0 at the top level.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    /// Next token, or `None` once the top-level value is complete and the
    /// input is exhausted. An empty input also yields `None`.
    pub async fn next_token(&mut self) -> Result<Option<Token>, TokenError> {
        loop {
            let Some(byte) = self.peek_significant().await? else {
                return match self.step {
                    Step::Done => Ok(None),
                    Step::Value if self.stack.is_empty() => Ok(None),
                    _ => Err(self.syntax("unexpected end of input")),
                };
            };

            match self.step {
                Step::Done => return Err(self.syntax("trailing characters after document")),
                Step::Colon => {
                    if byte != b':' {
                        return Err(self.syntax("expected ':' after member name"));
                    }
                    self.bump(1);
                    self.step = Step::Value;
                }
                Step::CommaOrClose => match byte {
                    b',' => {
                        self.bump(1);
                        self.step = match self.stack.last() {
                            Some(Container::Object) => Step::Name,
                            _ => Step::Value,
                        };
                    }
                    b'}' | b']' => return self.close(byte).map(Some),
                    _ => return Err(self.syntax("expected ',' or closing bracket")),
                },
                Step::FirstNameOrClose | Step::Name => match byte {
                    b'}' if self.step == Step::FirstNameOrClose => {
                        return self.close(byte).map(Some)
                    }
                    b'"' => {
                        let name = self.read_string().await?;
                        self.step = Step::Colon;
                        return Ok(Some(Token::Name(name)));
                    }
                    _ => return Err(self.syntax("expected member name")),
                },
                Step::FirstValueOrClose if byte == b']' => return self.close(byte).map(Some),
                Step::FirstValueOrClose | Step::Value => return self.read_value(byte).await.map(Some),
            }
        }
    }

    async fn read_value(&mut self, byte: u8) -> Result<Token, TokenError> {
        let token = match byte {
            b'{' => {
                self.bump(1);
                self.stack.push(Container::Object);
                self.step = Step::FirstNameOrClose;
                return Ok(Token::BeginObject);
            }
            b'[' => {
                self.bump(1);
                self.stack.push(Container::Array);
                self.step = Step::FirstValueOrClose;
                return Ok(Token::BeginArray);
            }
            b'"' => Token::String(self.read_string().await?),
            b't' => {
                self.expect_literal(b"true").await?;
                Token::Bool(true)
            }
            b'f' => {
                self.expect_literal(b"false").await?;
                Token::Bool(false)
            }
            b'n' => {
                self.expect_literal(b"null").await?;
                Token::Null
            }
            b'-' | b'0'..=b'9' => Token::Number(self.read_number().await?),
            other => {
                return Err(self.syntax(format!(
                    "unexpected character {:?}",
                    char::from(other)
                )))
            }
        };
        self.value_done();
        Ok(token)
    }

    fn close(&mut self, byte: u8) -> Result<Token, TokenError> {
        let (expected, token) = match byte {
            b'}' => (Container::Object, Token::EndObject),
            _ => (Container::Array, Token::EndArray),
        };
        if self.stack.last() != Some(&expected) {
            return Err(self.syntax("mismatched closing bracket"));
        }
        self.bump(1);
        self.stack.pop();
        self.value_done();
        Ok(token)
    }

    fn value_done(&mut self) {
        self.step = if self.stack.is_empty() {
            Step::Done
        } else {
            Step::CommaOrClose
        };
    }

    async fn read_string(&mut self) -> Result<String, TokenError> {
        let mut raw = Vec::with_capacity(32);
        raw.push(b'"');
        self.bump(1);

        let mut escaped = false;
        loop {
            let buf = self.reader.fill_buf().await?;
            if buf.is_empty() {
                return Err(TokenError::Syntax {
                    offset: self.offset,
                    message: "unterminated string".into(),
                });
            }

            let mut end = None;
            for (i, &b) in buf.iter().enumerate() {
                if escaped {
                    escaped = false;
                } else if b == b'\\' {
                    escaped = true;
                } else if b == b'"' {
                    end = Some(i + 1);
                    break;
                }
            }

            let taken = end.unwrap_or(buf.len());
            raw.extend_from_slice(&buf[..taken]);
            self.bump(taken);
            if end.is_some() {
                break;
            }
        }

        serde_json::from_slice::<String>(&raw)
            .map_err(|e| self.syntax(format!("invalid string literal: {}", e)))
    }

    async fn read_number(&mut self) -> Result<String, TokenError> {
        let mut raw = Vec::with_capacity(16);
        loop {
            let buf = self.reader.fill_buf().await?;
            if buf.is_empty() {
                break;
            }
            let taken = buf
                .iter()
                .position(|b| !matches!(b, b'0'..=b'9' | b'-' | b'+' | b'.' | b'e' | b'E'))
                .unwrap_or(buf.len());
            raw.extend_from_slice(&buf[..taken]);
            let stopped = taken < buf.len();
            self.bump(taken);
            if stopped {
                break;
            }
        }

        serde_json::from_slice::<serde_json::Number>(&raw)
            .map_err(|_| self.syntax("invalid number literal"))?;
        // Only ASCII bytes were accepted above.
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    async fn expect_literal(&mut self, literal: &'static [u8]) -> Result<(), TokenError> {
        for &expected in literal {
            match self.peek().await? {
                Some(b) if b == expected => self.bump(1),
                _ => {
                    return Err(self.syntax(format!(
                        "invalid literal, expected {}",
                        String::from_utf8_lossy(literal)
                    )))
                }
            }
        }
        Ok(())
    }

    async fn peek(&mut self) -> io::Result<Option<u8>> {
        let buf = self.reader.fill_buf().await?;
        Ok(buf.first().copied())
    }

    async fn peek_significant(&mut self) -> io::Result<Option<u8>> {
        loop {
            match self.peek().await? {
                Some(b' ' | b'\t' | b'\n' | b'\r') => self.bump(1),
                other => return Ok(other),
            }
        }
    }

    fn bump(&mut self, amount: usize) {
        self.reader.consume(amount);
        self.offset += amount as u64;
    }

    fn syntax(&self, message: impl Into<String>) -> TokenError {
        TokenError::Syntax {
            offset: self.offset,
            message: message.into(),
        }
    }
}
