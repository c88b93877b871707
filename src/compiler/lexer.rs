/// Token kinds for the turbine language.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    // Keywords
    Fn,
    Const,
    Any,
    End,
    Return,
    If,
    Else,
    Then,
    While,

    // Literals
    Number(f64),
    Ident(String),

    // Operators
    Plus,
    Minus,
    Star,
    Slash,
    Eq,
    EqEq,
    NotEq,
    Lt,
    Gt,

    // Delimiters
    LParen,
    RParen,
    Comma,
    Colon,
    Semi,

    // Special
    Eof,
}

/// Source location information.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Span {
    pub line: usize,
    pub column: usize,
}

impl Span {
    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }
}

/// A token with its kind and location.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

impl Token {
    pub fn new(kind: TokenKind, span: Span) -> Self {
        Self { kind, span }
    }
}

/// The lexer for turbine source code.
pub struct Lexer<'a> {
    filename: &'a str,
    source: &'a str,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    line: usize,
    column: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(filename: &'a str, source: &'a str) -> Self {
        Self {
            filename,
            source,
            chars: source.char_indices().peekable(),
            line: 1,
            column: 1,
        }
    }

    pub fn scan_tokens(&mut self) -> Result<Vec<Token>, String> {
        let mut tokens = Vec::new();

        loop {
            self.skip_whitespace_and_comments();

            let span = Span::new(self.line, self.column);

            let Some((_, ch)) = self.peek() else {
                tokens.push(Token::new(TokenKind::Eof, span));
                break;
            };

            let kind = match ch {
                '(' => { self.advance(); TokenKind::LParen }
                ')' => { self.advance(); TokenKind::RParen }
                ',' => { self.advance(); TokenKind::Comma }
                ':' => { self.advance(); TokenKind::Colon }
                ';' => { self.advance(); TokenKind::Semi }
                '+' => { self.advance(); TokenKind::Plus }
                '-' => { self.advance(); TokenKind::Minus }
                '*' => { self.advance(); TokenKind::Star }
                '/' => { self.advance(); TokenKind::Slash }
                '<' => { self.advance(); TokenKind::Lt }
                '>' => { self.advance(); TokenKind::Gt }
                '=' => {
                    self.advance();
                    if self.match_char('=') {
                        TokenKind::EqEq
                    } else {
                        TokenKind::Eq
                    }
                }
                '!' => {
                    self.advance();
                    if self.match_char('=') {
                        TokenKind::NotEq
                    } else {
                        return Err(self.error("expected '!='"));
                    }
                }
                '0'..='9' | '.' => self.scan_number()?,
                'a'..='z' | 'A'..='Z' | '_' => self.scan_identifier(),
                _ => return Err(self.error(&format!("unexpected character '{}'", ch))),
            };

            tokens.push(Token::new(kind, span));
        }

        Ok(tokens)
    }

    fn peek(&mut self) -> Option<(usize, char)> {
        self.chars.peek().copied()
    }

    fn advance(&mut self) -> Option<(usize, char)> {
        let result = self.chars.next();
        if let Some((_, ch)) = result {
            if ch == '\n' {
                self.line += 1;
                self.column = 1;
            } else {
                self.column += 1;
            }
        }
        result
    }

    fn match_char(&mut self, expected: char) -> bool {
        if self.peek().map(|(_, c)| c) == Some(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            match self.peek() {
                Some((_, ' ' | '\t' | '\r' | '\n')) => {
                    self.advance();
                }
                Some((_, '#')) => {
                    // Line comment
                    while let Some((_, ch)) = self.peek() {
                        if ch == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                _ => break,
            }
        }
    }

    fn scan_number(&mut self) -> Result<TokenKind, String> {
        let start = self.peek().map(|(i, _)| i).unwrap_or(0);

        while let Some((_, ch)) = self.peek() {
            if ch.is_ascii_digit() || ch == '.' {
                self.advance();
            } else {
                break;
            }
        }

        let end = self.peek().map(|(i, _)| i).unwrap_or(self.source.len());
        let num_str = &self.source[start..end];

        let value: f64 = num_str
            .parse()
            .map_err(|_| self.error(&format!("invalid number '{}'", num_str)))?;

        Ok(TokenKind::Number(value))
    }

    fn scan_identifier(&mut self) -> TokenKind {
        let start = self.peek().map(|(i, _)| i).unwrap_or(0);

        while let Some((_, ch)) = self.peek() {
            if ch.is_ascii_alphanumeric() || ch == '_' {
                self.advance();
            } else {
                break;
            }
        }

        let end = self.peek().map(|(i, _)| i).unwrap_or(self.source.len());
        let ident = &self.source[start..end];

        match ident {
            "Fn" => TokenKind::Fn,
            "Const" => TokenKind::Const,
            "Any" => TokenKind::Any,
            "End" => TokenKind::End,
            "Return" => TokenKind::Return,
            "If" => TokenKind::If,
            "Else" => TokenKind::Else,
            "Then" => TokenKind::Then,
            "While" => TokenKind::While,
            _ => TokenKind::Ident(ident.to_string()),
        }
    }

    fn error(&self, message: &str) -> String {
        format!(
            "error: {}\n  --> {}:{}:{}",
            message, self.filename, self.line, self.column
        )
    }
}
