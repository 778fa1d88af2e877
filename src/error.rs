use std::fmt;

use thiserror::Error;

use crate::token::Location;

/// Error taxonomy shared by every stage of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    UnexpectedToken,
    IdNotFound,
    WrongParamsNum,
    ParamType,
    InvalidReturn,
    InvalidBreak,
    InvalidContinue,
    FileNotFound,
    ModuleNotFound,
    CircularImport,
    InvalidIndexer,
    IndexOutOfRange,
    KeyNotFound,
    ValueNotFound,
    VariableMissing,
    TypeError,
    InvalidFunctionCall,
}

impl ErrorCode {
    pub fn message(self) -> &'static str {
        match self {
            Self::UnexpectedToken => "Unexpected token",
            Self::IdNotFound => "Identifier not found",
            Self::WrongParamsNum => "Wrong number of parameters",
            Self::ParamType => "Parameter type error",
            Self::InvalidReturn => "Invalid return placement",
            Self::InvalidBreak => "Invalid break placement",
            Self::InvalidContinue => "Invalid continue placement",
            Self::FileNotFound => "File not found",
            Self::ModuleNotFound => "Module not found",
            Self::CircularImport => "Circular import",
            Self::InvalidIndexer => "Invalid indexer use",
            Self::IndexOutOfRange => "Index out of range",
            Self::KeyNotFound => "Key not found",
            Self::ValueNotFound => "Value not found",
            Self::VariableMissing => "Variable missing at runtime",
            Self::TypeError => "Type error",
            Self::InvalidFunctionCall => "Invalid function call",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// A single failure: what went wrong, where, and a human-readable detail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub code: ErrorCode,
    pub file: String,
    pub location: Location,
    pub detail: String,
}

impl Diagnostic {
    pub fn new(
        code: ErrorCode,
        file: impl Into<String>,
        location: Location,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            code,
            file: file.into(),
            location,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {} ({}:{}:{})",
            self.code, self.detail, self.file, self.location.line, self.location.column
        )
    }
}

/// Stage-tagged pipeline error. The first error of a stage aborts that stage.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Lexer error: {0}")]
    Lex(Diagnostic),
    #[error("Parser error: {0}")]
    Parse(Diagnostic),
    #[error("Semantic error: {0}")]
    Semantic(Diagnostic),
    #[error("Interpreter error: {0}")]
    Runtime(Diagnostic),
}

impl Error {
    pub fn diagnostic(&self) -> &Diagnostic {
        match self {
            Self::Lex(d) | Self::Parse(d) | Self::Semantic(d) | Self::Runtime(d) => d,
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.diagnostic().code
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A failure raised below the tree walker (value operations, built-ins, host calls)
/// that has not been attached to a source position yet.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{code} -> {detail}")]
pub struct Fault {
    pub code: ErrorCode,
    pub detail: String,
}

impl Fault {
    pub fn new(code: ErrorCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }

    pub fn type_error(detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::TypeError, detail)
    }

    pub fn at(self, file: &str, location: Location) -> Diagnostic {
        Diagnostic::new(self.code, file, location, self.detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_stage_code_and_position() {
        let error = Error::Semantic(Diagnostic::new(
            ErrorCode::WrongParamsNum,
            "main.ql",
            Location { line: 3, column: 7 },
            "1 was passed, but 2 were expected",
        ));
        assert_eq!(
            error.to_string(),
            "Semantic error: Wrong number of parameters -> 1 was passed, but 2 were expected (main.ql:3:7)"
        );
        assert_eq!(error.code(), ErrorCode::WrongParamsNum);
    }
}
