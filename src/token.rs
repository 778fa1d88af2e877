use std::fmt;

/// 1-based source position of a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Location {
    pub line: usize,
    pub column: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TokenKind<'a> {
    // Keywords
    Memory,     // M
    Set,        // S
    Return,     // R
    Break,      // B
    Continue,   // C
    FileRead,   // FR
    FileWrite,  // FW
    FileAppend, // FA
    Null,       // X
    Else,       // E
    Macro,      // D
    True,       // T
    False,      // F

    // Markers
    If,         // ?
    While,      // ??
    For,        // ?/
    Host,       // ^
    Import,     // @
    Module,     // $
    MacroParam, // ~
    Backtick,   // `

    // Delimiters
    LCurly,   // {
    RCurly,   // }
    LBracket, // [
    RBracket, // ]
    LParen,   // (
    RParen,   // )
    LAngle,   // <
    RAngle,   // >

    // Operators
    ParamSep,   // ||
    SetTo,      // =>
    Lt,         // </
    Gt,         // >/
    Le,         // <=
    Ge,         // >=
    Eq,         // =
    Ne,         // !=
    Not,        // !
    And,        // &
    Or,         // |
    Colon,      // :
    Semi,       // ;
    Period,     // .
    Comma,      // ,
    Plus,       // +
    Minus,      // -
    Mul,        // *
    Expo,       // **
    IntDiv,     // //
    FloatDiv,   // /
    Mod,        // %
    PlusPlus,   // ++
    MinusMinus, // --

    // Literals
    Int(i64),
    Float(f64),
    Str(&'a str),
    Function(&'a str),

    EOF,
}

/// Every fixed-spelling token kind, in declaration order.
pub const FIXED: [TokenKind<'static>; 54] = [
    TokenKind::Memory,
    TokenKind::Set,
    TokenKind::Return,
    TokenKind::Break,
    TokenKind::Continue,
    TokenKind::FileRead,
    TokenKind::FileWrite,
    TokenKind::FileAppend,
    TokenKind::Null,
    TokenKind::Else,
    TokenKind::Macro,
    TokenKind::True,
    TokenKind::False,
    TokenKind::If,
    TokenKind::While,
    TokenKind::For,
    TokenKind::Host,
    TokenKind::Import,
    TokenKind::Module,
    TokenKind::MacroParam,
    TokenKind::Backtick,
    TokenKind::LCurly,
    TokenKind::RCurly,
    TokenKind::LBracket,
    TokenKind::RBracket,
    TokenKind::LParen,
    TokenKind::RParen,
    TokenKind::LAngle,
    TokenKind::RAngle,
    TokenKind::ParamSep,
    TokenKind::SetTo,
    TokenKind::Lt,
    TokenKind::Gt,
    TokenKind::Le,
    TokenKind::Ge,
    TokenKind::Eq,
    TokenKind::Ne,
    TokenKind::Not,
    TokenKind::And,
    TokenKind::Or,
    TokenKind::Colon,
    TokenKind::Semi,
    TokenKind::Period,
    TokenKind::Comma,
    TokenKind::Plus,
    TokenKind::Minus,
    TokenKind::Mul,
    TokenKind::Expo,
    TokenKind::IntDiv,
    TokenKind::FloatDiv,
    TokenKind::Mod,
    TokenKind::PlusPlus,
    TokenKind::MinusMinus,
    TokenKind::EOF,
];

/// Reserved keywords are the contiguous `Memory..=False` range of [`FIXED`].
const KEYWORDS_START: usize = 0;
const KEYWORDS_END: usize = 12;

pub fn keyword(ident: &str) -> Option<TokenKind<'static>> {
    FIXED[KEYWORDS_START..=KEYWORDS_END]
        .iter()
        .copied()
        .find(|kind| kind.spelling().eq_ignore_ascii_case(ident))
}

/// Punctuation kinds whose spelling is `len` characters long.
pub fn punctuation(len: usize) -> impl Iterator<Item = TokenKind<'static>> {
    FIXED[KEYWORDS_END + 1..]
        .iter()
        .copied()
        .filter(move |kind| !matches!(kind, TokenKind::EOF) && kind.spelling().len() == len)
}

impl TokenKind<'_> {
    pub fn spelling(&self) -> &'static str {
        match self {
            Self::Memory => "M",
            Self::Set => "S",
            Self::Return => "R",
            Self::Break => "B",
            Self::Continue => "C",
            Self::FileRead => "FR",
            Self::FileWrite => "FW",
            Self::FileAppend => "FA",
            Self::Null => "X",
            Self::Else => "E",
            Self::Macro => "D",
            Self::True => "T",
            Self::False => "F",
            Self::If => "?",
            Self::While => "??",
            Self::For => "?/",
            Self::Host => "^",
            Self::Import => "@",
            Self::Module => "$",
            Self::MacroParam => "~",
            Self::Backtick => "`",
            Self::LCurly => "{",
            Self::RCurly => "}",
            Self::LBracket => "[",
            Self::RBracket => "]",
            Self::LParen => "(",
            Self::RParen => ")",
            Self::LAngle => "<",
            Self::RAngle => ">",
            Self::ParamSep => "||",
            Self::SetTo => "=>",
            Self::Lt => "</",
            Self::Gt => ">/",
            Self::Le => "<=",
            Self::Ge => ">=",
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Not => "!",
            Self::And => "&",
            Self::Or => "|",
            Self::Colon => ":",
            Self::Semi => ";",
            Self::Period => ".",
            Self::Comma => ",",
            Self::Plus => "+",
            Self::Minus => "-",
            Self::Mul => "*",
            Self::Expo => "**",
            Self::IntDiv => "//",
            Self::FloatDiv => "/",
            Self::Mod => "%",
            Self::PlusPlus => "++",
            Self::MinusMinus => "--",
            Self::Int(_) => "INT_CONST",
            Self::Float(_) => "FLOAT_CONST",
            Self::Str(_) => "STR_CONST",
            Self::Function(_) => "FUNCTION",
            Self::EOF => "EOF",
        }
    }
}

impl fmt::Display for TokenKind<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(value) => write!(f, "INT_CONST({value})"),
            Self::Float(value) => write!(f, "FLOAT_CONST({value})"),
            Self::Str(value) => write!(f, "STR_CONST({value:?})"),
            Self::Function(name) => write!(f, "FUNCTION({name})"),
            other => write!(f, "'{}'", other.spelling()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token<'a> {
    pub kind: TokenKind<'a>,
    pub location: Location,
}

impl<'a> Token<'a> {
    pub fn new(kind: TokenKind<'a>, location: Location) -> Self {
        Self { kind, location }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keywords_match_case_insensitively() {
        assert_eq!(keyword("m"), Some(TokenKind::Memory));
        assert_eq!(keyword("fr"), Some(TokenKind::FileRead));
        assert_eq!(keyword("T"), Some(TokenKind::True));
        assert_eq!(keyword("TYPE"), None);
        assert_eq!(keyword("P"), None);
    }

    #[test]
    fn keyword_range_excludes_punctuation() {
        assert!(FIXED[KEYWORDS_START..=KEYWORDS_END]
            .iter()
            .all(|kind| kind.spelling().chars().all(char::is_alphabetic)));
        assert!(punctuation(2).all(|kind| kind.spelling().len() == 2));
        assert!(punctuation(1).any(|kind| kind == TokenKind::LAngle));
    }
}
