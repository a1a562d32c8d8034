//! Migration script splitting.
//!
//! A script is cut into statements on `;`, except where the `;` sits inside
//! a dollar-quoted body (`$$ ... $$`, `$tag$ ... $tag$`), a string literal
//! (including `E'...'` strings with backslash escapes), a quoted identifier
//! or a comment. Function and trigger bodies therefore
//! reach the store as one statement.

/// Lexical context at the current position.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
enum Mode {
    #[default]
    Code,
    SingleQuote,
    /// `E'...'`: a backslash escapes the next character.
    EscapeQuote,
    DoubleQuote,
    LineComment,
    BlockComment(u32),
    Dollar(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    /// A `;` at top level.
    Terminator,
    /// Anything that belongs to a statement proper.
    Code,
    /// Whitespace and comment text.
    Trivia,
}

#[derive(Debug, Default)]
struct Lexer {
    mode: Mode,
    prev: Option<char>,
}

impl Lexer {
    fn at_top_level(&self) -> bool {
        self.mode == Mode::Code
    }

    /// Classify the token starting at byte `pos` and return its byte length.
    fn next_token(&mut self, text: &str, pos: usize) -> (usize, Token) {
        let rest = &text[pos..];
        let Some(ch) = rest.chars().next() else {
            return (0, Token::Trivia);
        };
        let (len, token) = match &mut self.mode {
            Mode::Code => {
                if rest.starts_with("--") {
                    self.mode = Mode::LineComment;
                    (2, Token::Trivia)
                } else if rest.starts_with("/*") {
                    self.mode = Mode::BlockComment(1);
                    (2, Token::Trivia)
                } else if (ch == 'E' || ch == 'e')
                    && rest[1..].starts_with('\'')
                    && !self.prev.is_some_and(is_ident_char)
                {
                    self.mode = Mode::EscapeQuote;
                    (2, Token::Code)
                } else if ch == '\'' {
                    self.mode = Mode::SingleQuote;
                    (1, Token::Code)
                } else if ch == '"' {
                    self.mode = Mode::DoubleQuote;
                    (1, Token::Code)
                } else if ch == '$' && !self.prev.is_some_and(is_ident_char) {
                    match dollar_tag(rest) {
                        Some(tag) => {
                            let len = tag.len();
                            self.mode = Mode::Dollar(tag.to_string());
                            (len, Token::Code)
                        }
                        None => (1, Token::Code),
                    }
                } else if ch == ';' {
                    (1, Token::Terminator)
                } else if ch.is_whitespace() {
                    (ch.len_utf8(), Token::Trivia)
                } else {
                    (ch.len_utf8(), Token::Code)
                }
            }
            Mode::SingleQuote => {
                if rest.starts_with("''") {
                    (2, Token::Code)
                } else {
                    if ch == '\'' {
                        self.mode = Mode::Code;
                    }
                    (ch.len_utf8(), Token::Code)
                }
            }
            Mode::EscapeQuote => {
                if ch == '\\' {
                    let escaped = rest[1..].chars().next().map_or(0, char::len_utf8);
                    (1 + escaped, Token::Code)
                } else if rest.starts_with("''") {
                    (2, Token::Code)
                } else {
                    if ch == '\'' {
                        self.mode = Mode::Code;
                    }
                    (ch.len_utf8(), Token::Code)
                }
            }
            Mode::DoubleQuote => {
                if rest.starts_with("\"\"") {
                    (2, Token::Code)
                } else {
                    if ch == '"' {
                        self.mode = Mode::Code;
                    }
                    (ch.len_utf8(), Token::Code)
                }
            }
            Mode::LineComment => {
                if ch == '\n' {
                    self.mode = Mode::Code;
                }
                (ch.len_utf8(), Token::Trivia)
            }
            Mode::BlockComment(depth) => {
                if rest.starts_with("*/") {
                    *depth -= 1;
                    if *depth == 0 {
                        self.mode = Mode::Code;
                    }
                    (2, Token::Trivia)
                } else if rest.starts_with("/*") {
                    *depth += 1;
                    (2, Token::Trivia)
                } else {
                    (ch.len_utf8(), Token::Trivia)
                }
            }
            Mode::Dollar(tag) => {
                if rest.starts_with(tag.as_str()) {
                    let len = tag.len();
                    self.mode = Mode::Code;
                    (len, Token::Code)
                } else {
                    (ch.len_utf8(), Token::Code)
                }
            }
        };
        self.prev = text[pos..pos + len].chars().last();
        (len, token)
    }

    fn consume(&mut self, text: &str) {
        let mut pos = 0;
        while pos < text.len() {
            let (len, _) = self.next_token(text, pos);
            pos += len;
        }
    }
}

fn is_ident_char(ch: char) -> bool {
    ch.is_alphanumeric() || ch == '_'
}

/// The opening `$...$` marker at the start of `rest`, if it is one.
///
/// A tag is empty or an identifier that does not start with a digit, so
/// positional parameters such as `$1` are left alone.
fn dollar_tag(rest: &str) -> Option<&str> {
    let body = rest.strip_prefix('$')?;
    for (idx, ch) in body.char_indices() {
        if ch == '$' {
            return Some(&rest[..idx + 2]);
        }
        let valid = if idx == 0 {
            ch.is_alphabetic() || ch == '_'
        } else {
            is_ident_char(ch)
        };
        if !valid {
            return None;
        }
    }
    None
}

/// Split a script into directly executable statements.
///
/// Each statement keeps its terminating `;` and is trimmed. Statements made
/// only of whitespace, comments or a bare `;` are dropped. A final statement
/// without a terminator is kept.
pub fn split_statements(script: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut lexer = Lexer::default();
    let mut start = 0;
    let mut pos = 0;
    let mut has_code = false;

    while pos < script.len() {
        let (len, token) = lexer.next_token(script, pos);
        pos += len;
        match token {
            Token::Terminator => {
                if has_code {
                    statements.push(script[start..pos].trim().to_string());
                }
                start = pos;
                has_code = false;
            }
            Token::Code => has_code = true,
            Token::Trivia => {}
        }
    }

    if has_code {
        statements.push(script[start..].trim().to_string());
    }

    statements
}

fn is_transaction_control(line: &str) -> bool {
    let trimmed = line.trim();
    let trimmed = trimmed.strip_suffix(';').unwrap_or(trimmed);
    let normalized = trimmed
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_uppercase();
    matches!(
        normalized.as_str(),
        "BEGIN" | "BEGIN TRANSACTION" | "COMMIT" | "COMMIT TRANSACTION"
    )
}

/// Remove standalone BEGIN/COMMIT lines; the runner supplies the transaction.
///
/// Lines inside dollar-quoted bodies, strings and block comments are never
/// touched, so a PL/pgSQL `BEGIN` survives. The result is trimmed.
pub fn strip_transaction_statements(script: &str) -> String {
    let mut lexer = Lexer::default();
    let mut kept = Vec::new();

    for (idx, line) in script.split('\n').enumerate() {
        if idx > 0 {
            lexer.consume("\n");
        }
        if lexer.at_top_level() && is_transaction_control(line) {
            continue;
        }
        lexer.consume(line);
        kept.push(line);
    }

    kept.join("\n").trim().to_string()
}
