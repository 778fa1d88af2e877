use std::rc::Rc;
use std::{iter::Peekable, str::CharIndices};

use crate::error::{Diagnostic, Error, ErrorCode, Result};
use crate::token::{self, Location, Token, TokenKind};

pub struct Lexer<'a> {
    input: &'a str,
    file: Rc<str>,
    chars: Peekable<CharIndices<'a>>,
    line: usize,
    column: usize,
    in_fstring: bool,
    // Brace depth inside an interpolated region; zero means literal text.
    embed_depth: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self::with_file(input, Rc::from("<source>"))
    }

    pub fn with_file(input: &'a str, file: Rc<str>) -> Self {
        Self {
            input,
            file,
            chars: input.char_indices().peekable(),
            line: 1,
            column: 1,
            in_fstring: false,
            embed_depth: 0,
        }
    }

    pub fn next_token(&mut self) -> Result<Token<'a>> {
        loop {
            let location = self.location();
            let Some(&(start, ch)) = self.chars.peek() else {
                if self.in_fstring {
                    return Err(self.error(location, "Unterminated interpolated string"));
                }
                return Ok(Token::new(TokenKind::EOF, location));
            };

            if ch == '`' {
                if self.embed_depth > 0 {
                    return Err(self.error(location, "Nested interpolated strings are not supported"));
                }
                self.in_fstring = !self.in_fstring;
                self.advance_char();
                return Ok(Token::new(TokenKind::Backtick, location));
            }

            if self.in_fstring {
                match ch {
                    '{' => {
                        self.embed_depth += 1;
                        self.advance_char();
                        return Ok(Token::new(TokenKind::LCurly, location));
                    }
                    '}' if self.embed_depth > 0 => {
                        self.embed_depth -= 1;
                        self.advance_char();
                        return Ok(Token::new(TokenKind::RCurly, location));
                    }
                    _ if self.embed_depth == 0 => return Ok(self.read_fstring_text(start, location)),
                    _ => {}
                }
            }

            if ch.is_whitespace() {
                self.advance_char();
                continue;
            }

            if ch == '#' {
                self.skip_comment();
                continue;
            }

            if ch.is_ascii_digit() {
                return self.read_number(start, location);
            }

            if ch == '\'' || ch == '"' {
                return self.read_string(start, ch, location);
            }

            if ch.is_alphabetic() {
                return Ok(self.read_identifier(start, location));
            }

            if let Some(kind) = token::punctuation(2).find(|kind| self.check(start, kind.spelling())) {
                self.advance_char();
                self.advance_char();
                return Ok(Token::new(kind, location));
            }

            if let Some(kind) = token::punctuation(1).find(|kind| self.check(start, kind.spelling())) {
                self.advance_char();
                return Ok(Token::new(kind, location));
            }

            return Err(self.error(location, format!("Unexpected character '{ch}'")));
        }
    }

    fn check(&self, start: usize, spelling: &str) -> bool {
        self.input
            .get(start..start + spelling.len())
            .is_some_and(|slice| slice.eq_ignore_ascii_case(spelling))
    }

    fn skip_comment(&mut self) {
        self.advance_char(); // Opening '#'
        while let Some((_, c)) = self.advance_char() {
            if c == '#' {
                break;
            }
        }
    }

    fn read_fstring_text(&mut self, start: usize, location: Location) -> Token<'a> {
        while let Some(&(_, c)) = self.chars.peek() {
            if c == '`' || c == '{' {
                break;
            }
            self.advance_char();
            if c == '\\' {
                self.advance_char();
            }
        }
        let end = self.current_index();
        Token::new(TokenKind::Str(&self.input[start..end]), location)
    }

    fn read_string(&mut self, start: usize, marker: char, location: Location) -> Result<Token<'a>> {
        self.advance_char(); // Opening quote
        while let Some((idx, c)) = self.advance_char() {
            if c == marker {
                let content = &self.input[start + marker.len_utf8()..idx];
                return Ok(Token::new(TokenKind::Str(content), location));
            }
            if c == '\\' {
                self.advance_char();
            }
        }
        Err(self.error(location, "Unterminated string literal"))
    }

    fn read_identifier(&mut self, start: usize, location: Location) -> Token<'a> {
        while self.chars.peek().is_some_and(|&(_, c)| c.is_alphabetic()) {
            self.advance_char();
        }
        let ident = &self.input[start..self.current_index()];
        let kind = token::keyword(ident).unwrap_or(TokenKind::Function(ident));
        Token::new(kind, location)
    }

    fn read_number(&mut self, start: usize, location: Location) -> Result<Token<'a>> {
        self.skip_digits();

        let dot = self.current_index();
        let fractional = self.input[dot..].starts_with('.')
            && self.input[dot + 1..]
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_digit());
        if fractional {
            self.advance_char(); // '.'
            self.skip_digits();
            let literal = &self.input[start..self.current_index()];
            let value = literal.parse::<f64>().map_err(|_| {
                self.error(location, format!("Invalid float literal '{literal}'"))
            })?;
            return Ok(Token::new(TokenKind::Float(value), location));
        }

        let literal = &self.input[start..dot];
        let value = literal
            .parse::<i64>()
            .map_err(|_| self.error(location, format!("Invalid integer literal '{literal}'")))?;
        Ok(Token::new(TokenKind::Int(value), location))
    }

    fn skip_digits(&mut self) {
        while self.chars.peek().is_some_and(|&(_, c)| c.is_ascii_digit()) {
            self.advance_char();
        }
    }

    fn error(&self, location: Location, detail: impl Into<String>) -> Error {
        Error::Lex(Diagnostic::new(
            ErrorCode::UnexpectedToken,
            self.file.as_ref(),
            location,
            detail,
        ))
    }

    fn advance_char(&mut self) -> Option<(usize, char)> {
        let next = self.chars.next();
        if let Some((_, c)) = next {
            if c == '\n' {
                self.line += 1;
                self.column = 1;
            } else {
                self.column += 1;
            }
        }
        next
    }

    fn current_index(&mut self) -> usize {
        self.chars
            .peek()
            .map(|(idx, _)| *idx)
            .unwrap_or(self.input.len())
    }

    fn location(&self) -> Location {
        Location {
            line: self.line,
            column: self.column,
        }
    }
}

pub fn tokenize(input: &str) -> Result<Vec<Token<'_>>> {
    let mut lexer = Lexer::new(input);
    let mut tokens = Vec::new();
    loop {
        let token = lexer.next_token()?;
        let is_eof = matches!(token.kind, TokenKind::EOF);
        tokens.push(token);
        if is_eof {
            break;
        }
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    fn kinds(input: &str) -> Vec<TokenKind<'_>> {
        tokenize(input)
            .expect("tokenize should succeed")
            .into_iter()
            .map(|token| token.kind)
            .collect()
    }

    #[test]
    fn test_simple_program() {
        let input = indoc! {"
            # declare a one-parameter function #
            1: R<M0 * 2>;,
            P<M0<21>>
        "};
        let expected = vec![
            TokenKind::Int(1),
            TokenKind::Colon,
            TokenKind::Return,
            TokenKind::LAngle,
            TokenKind::Memory,
            TokenKind::Int(0),
            TokenKind::Mul,
            TokenKind::Int(2),
            TokenKind::RAngle,
            TokenKind::Semi,
            TokenKind::Comma,
            TokenKind::Function("P"),
            TokenKind::LAngle,
            TokenKind::Memory,
            TokenKind::Int(0),
            TokenKind::LAngle,
            TokenKind::Int(21),
            TokenKind::RAngle,
            TokenKind::RAngle,
            TokenKind::EOF,
        ];
        assert_eq!(kinds(input), expected);
    }

    #[test]
    fn multi_character_operators_win_over_single() {
        assert_eq!(
            kinds("?? ?/ ? ** // / </ <= < || |"),
            vec![
                TokenKind::While,
                TokenKind::For,
                TokenKind::If,
                TokenKind::Expo,
                TokenKind::IntDiv,
                TokenKind::FloatDiv,
                TokenKind::Lt,
                TokenKind::Le,
                TokenKind::LAngle,
                TokenKind::ParamSep,
                TokenKind::Or,
                TokenKind::EOF,
            ]
        );
    }

    #[test]
    fn dot_is_only_consumed_before_a_digit() {
        assert_eq!(
            kinds("1.5 2.LEN<>"),
            vec![
                TokenKind::Float(1.5),
                TokenKind::Int(2),
                TokenKind::Period,
                TokenKind::Function("LEN"),
                TokenKind::LAngle,
                TokenKind::RAngle,
                TokenKind::EOF,
            ]
        );
    }

    #[test]
    fn booleans_are_whole_word_keywords() {
        assert_eq!(
            kinds("T f TYPE<F> FR"),
            vec![
                TokenKind::True,
                TokenKind::False,
                TokenKind::Function("TYPE"),
                TokenKind::LAngle,
                TokenKind::False,
                TokenKind::RAngle,
                TokenKind::FileRead,
                TokenKind::EOF,
            ]
        );
    }

    #[test]
    fn strings_keep_escapes_verbatim() {
        assert_eq!(
            kinds(r#"'a\'b' "c\nd""#),
            vec![
                TokenKind::Str(r"a\'b"),
                TokenKind::Str(r"c\nd"),
                TokenKind::EOF,
            ]
        );
    }

    #[test]
    fn interpolated_strings_alternate_text_and_tokens() {
        assert_eq!(
            kinds("`n = {M0 + {1: 2}[1]}!`"),
            vec![
                TokenKind::Backtick,
                TokenKind::Str("n = "),
                TokenKind::LCurly,
                TokenKind::Memory,
                TokenKind::Int(0),
                TokenKind::Plus,
                TokenKind::LCurly,
                TokenKind::Int(1),
                TokenKind::Colon,
                TokenKind::Int(2),
                TokenKind::RCurly,
                TokenKind::LBracket,
                TokenKind::Int(1),
                TokenKind::RBracket,
                TokenKind::RCurly,
                TokenKind::Str("!"),
                TokenKind::Backtick,
                TokenKind::EOF,
            ]
        );
    }

    #[test]
    fn tracks_lines_and_columns() {
        let tokens = tokenize("M0,\n  S0 => 1").expect("tokenize");
        assert_eq!(tokens[3].location, Location { line: 2, column: 3 });
    }

    #[test]
    fn lexing_is_deterministic() {
        let source = "D 1: ?/ RANGE<~0>: P<`{M0}`>;;, M0<3>";
        assert_eq!(tokenize(source).expect("first"), tokenize(source).expect("second"));
    }

    #[test]
    fn eof_repeats_once_exhausted() {
        let mut lexer = Lexer::new("1");
        lexer.next_token().expect("int");
        assert_eq!(lexer.next_token().expect("eof").kind, TokenKind::EOF);
        assert_eq!(lexer.next_token().expect("eof again").kind, TokenKind::EOF);
    }

    #[test]
    fn errors_on_invalid_character() {
        let err = tokenize("M0,\n\u{00a7}").expect_err("expected lexing failure");
        assert!(err.to_string().contains("Unexpected character"));
    }

    #[test]
    fn errors_on_integer_overflow() {
        let err = tokenize("99999999999999999999999999").expect_err("expected overflow");
        assert!(err.to_string().contains("Invalid integer literal"));
    }

    #[test]
    fn errors_on_unterminated_string() {
        let err = tokenize("'abc").expect_err("expected failure");
        assert!(matches!(err, Error::Lex(_)));
        assert!(err.to_string().contains("Unterminated string literal"));
    }
}
