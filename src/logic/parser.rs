use super::{CompileError, Result};

/// Split one instruction line into whitespace-separated tokens.
///
/// A token beginning with `"` runs to the matching close quote and may
/// contain spaces; it is returned with its surrounding quotes intact so
/// value coercion can distinguish quoted text from bare literals. Escapes
/// `\" \\ \n \r \t` are processed inside quotes.
pub fn tokenize(line: &str) -> Result<Vec<String>> {
    let mut tokenizer = Tokenizer::new(line);
    let mut tokens = Vec::new();
    while let Some(token) = tokenizer.next_token()? {
        tokens.push(token);
    }
    Ok(tokens)
}

/// Wrap text in quotes, escaping as needed, so it survives `tokenize`.
pub fn quote_token(text: &str) -> String {
    let mut quoted = String::with_capacity(text.len() + 2);
    quoted.push('"');
    for ch in text.chars() {
        match ch {
            '"' => quoted.push_str("\\\""),
            '\\' => quoted.push_str("\\\\"),
            '\n' => quoted.push_str("\\n"),
            '\r' => quoted.push_str("\\r"),
            '\t' => quoted.push_str("\\t"),
            other => quoted.push(other),
        }
    }
    quoted.push('"');
    quoted
}

struct Tokenizer<'a> {
    bytes: &'a [u8],
    index: usize,
}

impl<'a> Tokenizer<'a> {
    fn new(line: &'a str) -> Self {
        Self {
            bytes: line.as_bytes(),
            index: 0,
        }
    }

    fn current(&self) -> Option<u8> {
        self.bytes.get(self.index).copied()
    }

    fn advance(&mut self) {
        if self.index < self.bytes.len() {
            self.index += 1;
        }
    }

    fn skip_ws(&mut self) {
        while let Some(ch) = self.current() {
            if ch.is_ascii_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn next_token(&mut self) -> Result<Option<String>> {
        self.skip_ws();
        match self.current() {
            None => Ok(None),
            Some(b'"') => self.quoted_token().map(Some),
            Some(_) => Ok(Some(self.bare_token())),
        }
    }

    fn bare_token(&mut self) -> String {
        let start = self.index;
        while let Some(ch) = self.current() {
            if ch.is_ascii_whitespace() {
                break;
            }
            self.advance();
        }
        String::from_utf8_lossy(&self.bytes[start..self.index]).into_owned()
    }

    fn quoted_token(&mut self) -> Result<String> {
        // consume opening quote
        self.advance();
        let mut buf = String::from("\"");
        while let Some(ch) = self.current() {
            self.advance();
            match ch {
                b'"' => {
                    buf.push('"');
                    return Ok(buf);
                }
                b'\\' => {
                    let escaped = self
                        .current()
                        .ok_or_else(|| self.error("incomplete escape"))?;
                    self.advance();
                    let value = match escaped {
                        b'"' => '"',
                        b'\\' => '\\',
                        b'n' => '\n',
                        b'r' => '\r',
                        b't' => '\t',
                        other => {
                            return Err(self.error(&format!("unknown escape: \\{}", other as char)));
                        }
                    };
                    buf.push(value);
                }
                _ => buf.push(ch as char),
            }
        }
        Err(self.error("unterminated quoted token"))
    }

    fn error(&self, message: &str) -> CompileError {
        CompileError::Syntax(format!("{} at byte {}", message, self.index))
    }
}
