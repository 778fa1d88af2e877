use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use tracing::debug;

use crate::ast::{
    BinaryOperator, BlockKind, Declared, ElseBranch, FStringPart, FileMode, FunctionLiteral,
    GetAttr, Literal, MacroLiteral, ModuleGet, ModuleMember, Node, Program, SetMode,
    StatementList, UnaryOperator, VariableGet,
};
use crate::builtins;
use crate::error::{Diagnostic, Error, ErrorCode, Result};
use crate::lexer::Lexer;
use crate::registry::{ModuleRegistry, UnitStatus};
use crate::token::{Location, Token, TokenKind};

pub struct Parser<'a, 'r> {
    lexer: Lexer<'a>,
    file: Rc<str>,
    path: PathBuf,
    registry: &'r mut ModuleRegistry,
    current: Token<'a>,
    peeked: Option<Token<'a>>,
}

impl<'a, 'r> Parser<'a, 'r> {
    pub fn new(input: &'a str, path: &Path, registry: &'r mut ModuleRegistry) -> Result<Self> {
        let file: Rc<str> = Rc::from(path.display().to_string());
        let mut lexer = Lexer::with_file(input, Rc::clone(&file));
        let current = lexer.next_token()?;
        Ok(Self {
            lexer,
            file,
            path: path.to_path_buf(),
            registry,
            current,
            peeked: None,
        })
    }

    pub fn parse_program(mut self) -> Result<Program> {
        let statements = self.parse_statement_list(BlockKind::Program)?;
        if !matches!(self.current.kind, TokenKind::EOF) {
            return Err(self.error("',' or end of file"));
        }
        Ok(Program {
            path: self.path,
            statements,
        })
    }

    fn parse_statement_list(&mut self, kind: BlockKind) -> Result<StatementList> {
        let mut children = Vec::new();
        if !self.at_block_end() {
            children.push(self.parse_statement()?);
            while matches!(self.current.kind, TokenKind::Comma) {
                self.advance()?;
                if self.at_block_end() {
                    break;
                }
                children.push(self.parse_statement()?);
            }
        }
        Ok(StatementList { kind, children })
    }

    fn at_block_end(&self) -> bool {
        matches!(self.current.kind, TokenKind::Semi | TokenKind::EOF)
    }

    fn parse_statement(&mut self) -> Result<Node> {
        if matches!(self.current.kind, TokenKind::Macro) {
            return self.parse_macro_decl();
        }
        if matches!(self.current.kind, TokenKind::Colon | TokenKind::ParamSep)
            || matches!(self.peek()?.kind, TokenKind::Colon | TokenKind::ParamSep)
        {
            return self.parse_function_decl();
        }
        match self.current.kind {
            TokenKind::If => self.parse_if(),
            TokenKind::While => {
                self.advance()?;
                let condition = self.parse_conditional()?;
                let body = self.parse_block(BlockKind::Loop)?;
                Ok(Node::While {
                    condition: Box::new(condition),
                    body,
                })
            }
            TokenKind::For => {
                let location = self.advance()?;
                let iterable = self.parse_conditional()?;
                let body = self.parse_block(BlockKind::Loop)?;
                Ok(Node::For {
                    iterable: Box::new(iterable),
                    body,
                    location,
                })
            }
            TokenKind::Return => self.parse_return(),
            TokenKind::Break => Ok(Node::Break(self.advance()?)),
            TokenKind::Continue => Ok(Node::Continue(self.advance()?)),
            TokenKind::Set => self.parse_set(),
            TokenKind::Import => self.parse_import(),
            TokenKind::FileRead | TokenKind::FileWrite | TokenKind::FileAppend => {
                self.parse_open_file()
            }
            TokenKind::SetTo => {
                self.advance()?;
                let value = self.parse_conditional()?;
                Ok(Node::VariableDeclare(Declared::Value(Box::new(value))))
            }
            _ => {
                let expr = self.parse_conditional()?;
                Ok(self.declaration(expr))
            }
        }
    }

    /// A statement-level expression occupies a new slot unless it is a call whose
    /// signature says it produces nothing.
    fn declaration(&self, expr: Node) -> Node {
        let produces_value = match &expr {
            Node::BuiltInCall {
                name, host: false, ..
            } => builtins::signature(name).is_none_or(|signature| signature.produces_value),
            Node::BuiltInCall {
                name, host: true, ..
            } => self
                .registry
                .host()
                .root()
                .lookup_function(name)
                .is_none_or(|function| function.produces_value),
            _ => true,
        };
        if produces_value {
            Node::VariableDeclare(Declared::Value(Box::new(expr)))
        } else {
            expr
        }
    }

    fn parse_function_decl(&mut self) -> Result<Node> {
        let params_num = self.parse_optional_count()?;
        let mut defaults = Vec::new();
        if matches!(self.current.kind, TokenKind::ParamSep) {
            self.advance()?;
            defaults.push(self.parse_conditional()?);
            while matches!(self.current.kind, TokenKind::Comma) {
                self.advance()?;
                defaults.push(self.parse_conditional()?);
            }
        }
        let body = self.parse_block(BlockKind::Function)?;
        Ok(Node::VariableDeclare(Declared::Function(Rc::new(
            FunctionLiteral {
                params_num,
                defaults,
                body,
            },
        ))))
    }

    fn parse_macro_decl(&mut self) -> Result<Node> {
        self.expect(TokenKind::Macro, "'D'")?;
        let params_num = self.parse_optional_count()?;
        let body = self.parse_block(BlockKind::Macro)?;
        Ok(Node::MacroDeclare(Rc::new(MacroLiteral { params_num, body })))
    }

    fn parse_optional_count(&mut self) -> Result<usize> {
        if matches!(self.current.kind, TokenKind::Int(_)) {
            self.expect_int("parameter count")
        } else {
            Ok(0)
        }
    }

    /// `: statement_list ;`
    fn parse_block(&mut self, kind: BlockKind) -> Result<StatementList> {
        self.expect(TokenKind::Colon, "':'")?;
        let body = self.parse_statement_list(kind)?;
        self.expect(TokenKind::Semi, "';'")?;
        Ok(body)
    }

    fn parse_if(&mut self) -> Result<Node> {
        self.expect(TokenKind::If, "'?'")?;
        let condition = self.parse_conditional()?;
        let body = self.parse_block(BlockKind::Conditional)?;
        let else_branch = if matches!(self.current.kind, TokenKind::Else) {
            self.advance()?;
            if matches!(self.current.kind, TokenKind::If) {
                Some(ElseBranch::If(Box::new(self.parse_if()?)))
            } else {
                Some(ElseBranch::Block(self.parse_block(BlockKind::Conditional)?))
            }
        } else {
            None
        };
        Ok(Node::If {
            condition: Box::new(condition),
            body,
            else_branch,
        })
    }

    fn parse_return(&mut self) -> Result<Node> {
        let location = self.expect(TokenKind::Return, "'R'")?;
        self.expect(TokenKind::LAngle, "'<'")?;
        let value = if matches!(self.current.kind, TokenKind::RAngle) {
            None
        } else {
            Some(Box::new(self.parse_conditional()?))
        };
        self.expect(TokenKind::RAngle, "'>'")?;
        Ok(Node::Return { value, location })
    }

    fn parse_set(&mut self) -> Result<Node> {
        let location = self.expect(TokenKind::Set, "'S'")?;
        let depth = self.parse_depth()?;
        let index = self.expect_int("variable index")?;
        let indexes = self.parse_indexes()?;
        let mode = match self.current.kind {
            TokenKind::SetTo => SetMode::Assign,
            TokenKind::PlusPlus => SetMode::Add,
            TokenKind::MinusMinus => SetMode::Subtract,
            _ => return Err(self.error("'=>', '++' or '--'")),
        };
        self.advance()?;
        let value = self.parse_conditional()?;
        Ok(Node::VariableSet {
            depth,
            index,
            indexes,
            mode,
            value: Box::new(value),
            location,
        })
    }

    fn parse_import(&mut self) -> Result<Node> {
        let location = self.expect(TokenKind::Import, "'@'")?;
        let host = matches!(self.current.kind, TokenKind::Host);
        if host {
            self.advance()?;
        }
        let TokenKind::Str(name) = self.current.kind else {
            return Err(self.error("module name"));
        };
        self.advance()?;
        if host {
            return Ok(Node::Import {
                path: PathBuf::from(name),
                host,
                location,
            });
        }

        let path = self.registry.resolve(name);
        match self.registry.status(&path) {
            UnitStatus::Ready(_) => {
                debug!(path = %path.display(), "import already parsed");
            }
            UnitStatus::Pending => {
                return Err(self.error_at(
                    ErrorCode::CircularImport,
                    location,
                    format!("'{}' is already being imported", path.display()),
                ));
            }
            UnitStatus::Missing => {
                let source = fs::read_to_string(&path).map_err(|_| {
                    self.error_at(
                        ErrorCode::FileNotFound,
                        location,
                        format!("cannot read '{}'", path.display()),
                    )
                })?;
                parse_source(&source, &path, self.registry)?;
            }
        }
        Ok(Node::Import {
            path,
            host,
            location,
        })
    }

    fn parse_open_file(&mut self) -> Result<Node> {
        let mode = match self.current.kind {
            TokenKind::FileRead => FileMode::Read,
            TokenKind::FileWrite => FileMode::Write,
            _ => FileMode::Append,
        };
        let location = self.advance()?;
        let path = self.parse_conditional()?;
        let body = self.parse_block(BlockKind::OpenFile)?;
        Ok(Node::OpenFile {
            mode,
            path: Box::new(path),
            body,
            location,
        })
    }

    fn parse_conditional(&mut self) -> Result<Node> {
        let mut node = self.parse_and_condition()?;
        while matches!(self.current.kind, TokenKind::Or) {
            let location = self.advance()?;
            let right = self.parse_and_condition()?;
            node = binary(node, BinaryOperator::Or, right, location);
        }
        Ok(node)
    }

    fn parse_and_condition(&mut self) -> Result<Node> {
        let mut node = self.parse_condition()?;
        while matches!(self.current.kind, TokenKind::And) {
            let location = self.advance()?;
            let right = self.parse_condition()?;
            node = binary(node, BinaryOperator::And, right, location);
        }
        Ok(node)
    }

    fn parse_condition(&mut self) -> Result<Node> {
        if matches!(self.current.kind, TokenKind::Not) {
            self.advance()?;
            return Ok(Node::Not(Box::new(self.parse_condition()?)));
        }
        let left = self.parse_expr()?;
        let op = match self.current.kind {
            TokenKind::Eq => BinaryOperator::Eq,
            TokenKind::Ne => BinaryOperator::Ne,
            TokenKind::Lt => BinaryOperator::Lt,
            TokenKind::Gt => BinaryOperator::Gt,
            TokenKind::Le => BinaryOperator::Le,
            TokenKind::Ge => BinaryOperator::Ge,
            _ => return Ok(left),
        };
        let location = self.advance()?;
        let right = self.parse_expr()?;
        Ok(binary(left, op, right, location))
    }

    fn parse_expr(&mut self) -> Result<Node> {
        let mut node = self.parse_term()?;
        loop {
            let op = match self.current.kind {
                TokenKind::Plus => BinaryOperator::Add,
                TokenKind::Minus => BinaryOperator::Sub,
                _ => break,
            };
            let location = self.advance()?;
            let right = self.parse_term()?;
            node = binary(node, op, right, location);
        }
        Ok(node)
    }

    fn parse_term(&mut self) -> Result<Node> {
        let mut node = self.parse_method()?;
        loop {
            let op = match self.current.kind {
                TokenKind::Mul => BinaryOperator::Mul,
                TokenKind::IntDiv => BinaryOperator::IntDiv,
                TokenKind::FloatDiv => BinaryOperator::FloatDiv,
                TokenKind::Mod => BinaryOperator::Mod,
                _ => break,
            };
            let location = self.advance()?;
            let right = self.parse_method()?;
            node = binary(node, op, right, location);
        }
        Ok(node)
    }

    /// `receiver.NAME<args>` calls the built-in with the receiver prepended.
    fn parse_method(&mut self) -> Result<Node> {
        let mut node = self.parse_expo()?;
        while matches!(self.current.kind, TokenKind::Period) {
            self.advance()?;
            let location = self.current.location;
            let name = self.expect_name()?;
            let mut args = vec![node];
            args.extend(self.parse_args()?);
            node = self.builtin_call(name, args, location)?;
        }
        Ok(node)
    }

    fn parse_expo(&mut self) -> Result<Node> {
        let mut node = self.parse_factor()?;
        while matches!(self.current.kind, TokenKind::Expo) {
            let location = self.advance()?;
            let right = self.parse_factor()?;
            node = binary(node, BinaryOperator::Expo, right, location);
        }
        Ok(node)
    }

    fn parse_factor(&mut self) -> Result<Node> {
        let location = self.current.location;
        match self.current.kind {
            TokenKind::Plus | TokenKind::Minus => {
                let op = if matches!(self.current.kind, TokenKind::Plus) {
                    UnaryOperator::Plus
                } else {
                    UnaryOperator::Minus
                };
                self.advance()?;
                let expr = self.parse_factor()?;
                Ok(Node::UnaryOp {
                    op,
                    expr: Box::new(expr),
                    location,
                })
            }
            TokenKind::Int(value) => {
                self.advance()?;
                Ok(Node::Literal(Literal::Int(value)))
            }
            TokenKind::Float(value) => {
                self.advance()?;
                Ok(Node::Literal(Literal::Float(value)))
            }
            TokenKind::Str(text) => {
                self.advance()?;
                Ok(Node::Literal(Literal::Str(text.to_string())))
            }
            TokenKind::True | TokenKind::False => {
                let value = matches!(self.current.kind, TokenKind::True);
                self.advance()?;
                Ok(Node::Literal(Literal::Bool(value)))
            }
            TokenKind::Null => {
                self.advance()?;
                Ok(Node::Literal(Literal::Null))
            }
            TokenKind::LAngle => {
                self.advance()?;
                let expr = self.parse_conditional()?;
                self.expect(TokenKind::RAngle, "'>'")?;
                Ok(expr)
            }
            TokenKind::LBracket => {
                self.advance()?;
                Ok(Node::List(self.parse_items(TokenKind::RBracket, "']'")?))
            }
            TokenKind::LParen => {
                self.advance()?;
                Ok(Node::Tuple(self.parse_items(TokenKind::RParen, "')'")?))
            }
            TokenKind::LCurly => self.parse_dict(),
            TokenKind::Backtick => self.parse_fstring(),
            TokenKind::Memory => Ok(Node::VariableGet(self.parse_variable()?)),
            TokenKind::Module => Ok(Node::ModuleGet(self.parse_module()?)),
            TokenKind::MacroParam => {
                self.advance()?;
                let index = self.expect_int("macro parameter index")?;
                Ok(Node::MacroParamGet { index, location })
            }
            TokenKind::Function(_) => {
                let name = self.expect_name()?;
                let args = self.parse_args()?;
                self.builtin_call(name, args, location)
            }
            TokenKind::Host => self.parse_host_call(),
            _ => Err(self.error("expression")),
        }
    }

    fn builtin_call(&self, name: String, args: Vec<Node>, location: Location) -> Result<Node> {
        let signature = builtins::signature(&name).ok_or_else(|| {
            self.error_at(
                ErrorCode::IdNotFound,
                location,
                format!("unknown built-in '{name}'"),
            )
        })?;
        let by_reference = signature.mutates_receiver
            && matches!(args.first(), Some(Node::VariableGet(receiver)) if receiver.args.is_none());
        Ok(Node::BuiltInCall {
            name: signature.name.to_string(),
            args,
            host: false,
            by_reference,
            location,
        })
    }

    fn parse_host_call(&mut self) -> Result<Node> {
        self.expect(TokenKind::Host, "'^'")?;
        let location = self.current.location;
        let name = self.expect_name()?;
        if !matches!(self.current.kind, TokenKind::LAngle) {
            return Ok(Node::GetAttr(GetAttr {
                name,
                args: None,
                location,
            }));
        }
        let args = self.parse_args()?;
        if self.registry.host().root().lookup_function(&name).is_none() {
            return Err(self.error_at(
                ErrorCode::IdNotFound,
                location,
                format!("unknown host function '{name}'"),
            ));
        }
        Ok(Node::BuiltInCall {
            name,
            args,
            host: true,
            by_reference: false,
            location,
        })
    }

    fn parse_variable(&mut self) -> Result<VariableGet> {
        let location = self.expect(TokenKind::Memory, "'M'")?;
        let depth = self.parse_depth()?;
        let index = self.expect_int("variable index")?;
        let args = if matches!(self.current.kind, TokenKind::LAngle) {
            Some(self.parse_args()?)
        } else {
            None
        };
        let indexes = self.parse_indexes()?;
        Ok(VariableGet {
            depth,
            index,
            args,
            indexes,
            location,
        })
    }

    fn parse_module(&mut self) -> Result<ModuleGet> {
        let location = self.expect(TokenKind::Module, "'$'")?;
        let depth = self.parse_depth()?;
        let index = self.expect_int("module index")?;
        let member = match self.current.kind {
            TokenKind::Memory => ModuleMember::Variable(self.parse_variable()?),
            TokenKind::Module => ModuleMember::Module(Box::new(self.parse_module()?)),
            TokenKind::Host => {
                self.advance()?;
                let location = self.current.location;
                let name = self.expect_name()?;
                let args = if matches!(self.current.kind, TokenKind::LAngle) {
                    Some(self.parse_args()?)
                } else {
                    None
                };
                ModuleMember::Attr(GetAttr {
                    name,
                    args,
                    location,
                })
            }
            _ => return Err(self.error("module member")),
        };
        Ok(ModuleGet {
            depth,
            index,
            member,
            location,
        })
    }

    fn parse_dict(&mut self) -> Result<Node> {
        let location = self.expect(TokenKind::LCurly, "'{'")?;
        let mut pairs = Vec::new();
        while !matches!(self.current.kind, TokenKind::RCurly) {
            let key = self.parse_conditional()?;
            self.expect(TokenKind::Colon, "':'")?;
            let value = self.parse_conditional()?;
            pairs.push((key, value));
            if !matches!(self.current.kind, TokenKind::Comma) {
                break;
            }
            self.advance()?;
        }
        self.expect(TokenKind::RCurly, "'}'")?;
        Ok(Node::Dict { pairs, location })
    }

    fn parse_fstring(&mut self) -> Result<Node> {
        self.expect(TokenKind::Backtick, "'`'")?;
        let mut parts = Vec::new();
        loop {
            match self.current.kind {
                TokenKind::Str(text) => {
                    self.advance()?;
                    parts.push(FStringPart::Text(text.to_string()));
                }
                TokenKind::LCurly => {
                    self.advance()?;
                    parts.push(FStringPart::Expr(self.parse_conditional()?));
                    self.expect(TokenKind::RCurly, "'}'")?;
                }
                TokenKind::Backtick => {
                    self.advance()?;
                    break;
                }
                _ => return Err(self.error("interpolated text")),
            }
        }
        Ok(Node::FString(parts))
    }

    fn parse_args(&mut self) -> Result<Vec<Node>> {
        self.expect(TokenKind::LAngle, "'<'")?;
        self.parse_items(TokenKind::RAngle, "'>'")
    }

    fn parse_items(&mut self, close: TokenKind<'static>, expected: &str) -> Result<Vec<Node>> {
        let mut items = Vec::new();
        while self.current.kind != close {
            items.push(self.parse_conditional()?);
            if !matches!(self.current.kind, TokenKind::Comma) {
                break;
            }
            self.advance()?;
        }
        self.expect(close, expected)?;
        Ok(items)
    }

    fn parse_indexes(&mut self) -> Result<Vec<Node>> {
        let mut indexes = Vec::new();
        while matches!(self.current.kind, TokenKind::LBracket) {
            self.advance()?;
            indexes.push(self.parse_conditional()?);
            self.expect(TokenKind::RBracket, "']'")?;
        }
        Ok(indexes)
    }

    /// Each leading `.` walks one scope outwards.
    fn parse_depth(&mut self) -> Result<usize> {
        let mut depth = 0;
        while matches!(self.current.kind, TokenKind::Period) {
            self.advance()?;
            depth += 1;
        }
        Ok(depth)
    }

    fn expect_int(&mut self, expected: &str) -> Result<usize> {
        let TokenKind::Int(value) = self.current.kind else {
            return Err(self.error(expected));
        };
        let value = usize::try_from(value).map_err(|_| self.error(expected))?;
        self.advance()?;
        Ok(value)
    }

    /// Built-in and host names. Single-letter keywords double as host names (`^e`).
    fn expect_name(&mut self) -> Result<String> {
        let name = match self.current.kind {
            TokenKind::Function(name) => name.to_string(),
            TokenKind::EOF => return Err(self.error("name")),
            other if other.spelling().chars().all(char::is_alphabetic) => {
                other.spelling().to_ascii_lowercase()
            }
            _ => return Err(self.error("name")),
        };
        self.advance()?;
        Ok(name)
    }

    fn expect(&mut self, kind: TokenKind<'static>, expected: &str) -> Result<Location> {
        if self.current.kind == kind {
            self.advance()
        } else {
            Err(self.error(expected))
        }
    }

    /// Moves to the next token and returns the location of the one left behind.
    fn advance(&mut self) -> Result<Location> {
        let next = match self.peeked.take() {
            Some(token) => token,
            None => self.lexer.next_token()?,
        };
        Ok(std::mem::replace(&mut self.current, next).location)
    }

    fn peek(&mut self) -> Result<&Token<'a>> {
        let token = match self.peeked.take() {
            Some(token) => token,
            None => self.lexer.next_token()?,
        };
        Ok(self.peeked.insert(token))
    }

    fn error(&self, expected: &str) -> Error {
        self.error_at(
            ErrorCode::UnexpectedToken,
            self.current.location,
            format!("Expected {expected}, got {}", self.current.kind),
        )
    }

    fn error_at(&self, code: ErrorCode, location: Location, detail: impl Into<String>) -> Error {
        Error::Parse(Diagnostic::new(code, self.file.as_ref(), location, detail))
    }
}

fn binary(left: Node, op: BinaryOperator, right: Node, location: Location) -> Node {
    Node::BinaryOp {
        left: Box::new(left),
        op,
        right: Box::new(right),
        location,
    }
}

/// Parses `source` as the unit registered under `path`. The unit is pending while its
/// own imports are parsed.
pub fn parse_source(
    source: &str,
    path: &Path,
    registry: &mut ModuleRegistry,
) -> Result<Rc<Program>> {
    registry.begin(path);
    let program = Parser::new(source, path, registry)?.parse_program()?;
    Ok(registry.complete(program))
}

pub fn parse_file(path: &Path, registry: &mut ModuleRegistry) -> Result<Rc<Program>> {
    let source = fs::read_to_string(path).map_err(|error| {
        Error::Parse(Diagnostic::new(
            ErrorCode::FileNotFound,
            path.display().to_string(),
            Location::default(),
            format!("cannot read '{}': {error}", path.display()),
        ))
    })?;
    let path = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    parse_source(&source, &path, registry)
}

/// Parses a standalone source with no import root.
pub fn parse(input: &str) -> Result<Program> {
    let mut registry = ModuleRegistry::new("");
    Parser::new(input, Path::new("<source>"), &mut registry)?.parse_program()
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use std::env;

    fn at(line: usize, column: usize) -> Location {
        Location { line, column }
    }

    fn int(value: i64) -> Node {
        Node::Literal(Literal::Int(value))
    }

    fn var(depth: usize, index: usize, location: Location) -> VariableGet {
        VariableGet {
            depth,
            index,
            args: None,
            indexes: Vec::new(),
            location,
        }
    }

    fn children(input: &str) -> Vec<Node> {
        parse(input).expect("parse failed").statements.children
    }

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = env::temp_dir().join(format!("quill-parser-{name}-{}", std::process::id()));
        fs::create_dir_all(&dir).expect("create scratch dir");
        dir
    }

    #[test]
    fn parses_simple_program() {
        let input = indoc! {"
            1: R<M0 * 2>;,
            P<M0<21>>
        "};
        let program = parse(input).expect("parse failed");

        let expected = vec![
            Node::VariableDeclare(Declared::Function(Rc::new(FunctionLiteral {
                params_num: 1,
                defaults: Vec::new(),
                body: StatementList {
                    kind: BlockKind::Function,
                    children: vec![Node::Return {
                        value: Some(Box::new(binary(
                            Node::VariableGet(var(0, 0, at(1, 6))),
                            BinaryOperator::Mul,
                            int(2),
                            at(1, 9),
                        ))),
                        location: at(1, 4),
                    }],
                },
            }))),
            Node::BuiltInCall {
                name: "P".to_string(),
                args: vec![Node::VariableGet(VariableGet {
                    args: Some(vec![int(21)]),
                    ..var(0, 0, at(2, 3))
                })],
                host: false,
                by_reference: false,
                location: at(2, 1),
            },
        ];

        assert_eq!(program.statements.kind, BlockKind::Program);
        assert_eq!(program.statements.children, expected);
    }

    #[test]
    fn value_producing_calls_become_declarations() {
        let nodes = children("P<1>, LEN<'ab'>, ^abs<-1>, LEN<'a'> + 1, => P<2>");
        assert!(matches!(nodes[0], Node::BuiltInCall { .. }));
        assert!(matches!(nodes[1], Node::VariableDeclare(Declared::Value(_))));
        assert!(matches!(nodes[2], Node::VariableDeclare(Declared::Value(_))));
        assert!(matches!(nodes[3], Node::VariableDeclare(Declared::Value(_))));
        assert!(matches!(nodes[4], Node::VariableDeclare(Declared::Value(_))));
    }

    #[test]
    fn parses_defaults_and_zero_parameter_functions() {
        let nodes = children("2 || 10, M0: R<M0 + M1 + M2>;, : R<1>;");
        let Node::VariableDeclare(Declared::Function(with_defaults)) = &nodes[0] else {
            panic!("expected function declaration, got {:?}", nodes[0]);
        };
        assert_eq!(with_defaults.params_num, 2);
        assert_eq!(with_defaults.defaults.len(), 2);
        assert!(with_defaults.accepts(3) && !with_defaults.accepts(5));

        let Node::VariableDeclare(Declared::Function(plain)) = &nodes[1] else {
            panic!("expected function declaration, got {:?}", nodes[1]);
        };
        assert_eq!(plain.params_num, 0);
    }

    #[test]
    fn method_postfix_prepends_the_receiver() {
        let nodes = children("[1], M0.PUSH<2>, [3].PUSH<4>, M0.POP<>");
        let Node::BuiltInCall {
            name,
            args,
            by_reference,
            ..
        } = &nodes[1]
        else {
            panic!("expected bare PUSH call, got {:?}", nodes[1]);
        };
        assert_eq!(name, "PUSH");
        assert_eq!(args.len(), 2);
        assert!(by_reference);
        assert!(matches!(
            nodes[2],
            Node::BuiltInCall {
                by_reference: false,
                ..
            }
        ));
        let Node::VariableDeclare(Declared::Value(pop)) = &nodes[3] else {
            panic!("POP produces a value");
        };
        assert!(matches!(
            pop.as_ref(),
            Node::BuiltInCall {
                by_reference: true,
                ..
            }
        ));
    }

    #[test]
    fn parses_else_if_chains_and_loops() {
        let input = indoc! {"
            0,
            ? M0 = 0: P<'zero'>; E ? M0 >/ 0: P<'pos'>; E: P<'neg'>;,
            ?? M0 </ 3: S0 ++ 1, ? M0 = 2: B;;,
            ?/ RANGE<3>: ? M0 = 1: C;, P<M0>;
        "};
        let nodes = children(input);
        assert_eq!(nodes.len(), 4);
        let Node::If { else_branch, .. } = &nodes[1] else {
            panic!("expected if, got {:?}", nodes[1]);
        };
        let Some(ElseBranch::If(nested)) = else_branch else {
            panic!("expected else-if");
        };
        assert!(matches!(
            nested.as_ref(),
            Node::If {
                else_branch: Some(ElseBranch::Block(_)),
                ..
            }
        ));
        assert!(matches!(nodes[2], Node::While { .. }));
        assert!(matches!(nodes[3], Node::For { .. }));
    }

    #[test]
    fn parses_sets_modules_macros_and_interpolation() {
        let input = indoc! {"
            S.1[0]['k'] => 3,
            $0 $1 M.2<1, 2>[0],
            $0 ^sqrt<4>,
            D 1: R<~0 * 2>;,
            `sum {M0 + 1}!`
        "};
        let nodes = children(input);
        assert!(matches!(
            &nodes[0],
            Node::VariableSet {
                depth: 1,
                index: 1,
                mode: SetMode::Assign,
                indexes,
                ..
            } if indexes.len() == 2
        ));
        let Node::VariableDeclare(Declared::Value(module)) = &nodes[1] else {
            panic!("expected declaration");
        };
        let Node::ModuleGet(ModuleGet {
            member: ModuleMember::Module(inner),
            ..
        }) = module.as_ref()
        else {
            panic!("expected nested module reference");
        };
        assert!(matches!(
            &inner.member,
            ModuleMember::Variable(VariableGet { depth: 1, index: 2, .. })
        ));
        assert!(matches!(nodes[3], Node::MacroDeclare(_)));
        let Node::VariableDeclare(Declared::Value(fstring)) = &nodes[4] else {
            panic!("expected declaration");
        };
        let Node::FString(parts) = fstring.as_ref() else {
            panic!("expected interpolated string");
        };
        assert_eq!(parts.len(), 3);
    }

    #[test]
    fn reports_expected_and_found_tokens() {
        let err = parse("? M0 P<1>;").expect_err("missing colon");
        assert_eq!(err.code(), ErrorCode::UnexpectedToken);
        assert_eq!(
            err.to_string(),
            "Parser error: Unexpected token -> Expected ':', got FUNCTION(P) (<source>:1:6)"
        );
    }

    #[test]
    fn unknown_builtins_are_identifier_errors() {
        let err = parse("NOPE<1>").expect_err("unknown built-in");
        assert!(matches!(err, Error::Parse(_)));
        assert_eq!(err.code(), ErrorCode::IdNotFound);
    }

    #[test]
    fn imports_are_parsed_once() {
        let dir = scratch_dir("once");
        fs::write(dir.join("util.ql"), "1: R<M0 + 1>;").expect("write util");
        fs::write(dir.join("main.ql"), "@ 'util', @ 'util', P<$0 M0<1>>").expect("write main");

        let mut registry = ModuleRegistry::new(&dir);
        let program = parse_file(&dir.join("main.ql"), &mut registry).expect("parse main");
        assert_eq!(program.statements.children.len(), 3);
        assert!(registry.unit(&dir.join("util.ql")).is_some());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn circular_imports_are_rejected() {
        let dir = scratch_dir("cycle");
        fs::write(dir.join("a.ql"), "@ 'b'").expect("write a");
        fs::write(dir.join("b.ql"), "@ 'a'").expect("write b");
        fs::write(dir.join("self.ql"), "@ 'self'").expect("write self");

        let mut registry = ModuleRegistry::new(&dir);
        let err = parse_file(&dir.join("a.ql"), &mut registry).expect_err("cycle");
        assert_eq!(err.code(), ErrorCode::CircularImport);

        let mut registry = ModuleRegistry::new(&dir);
        let err = parse_file(&dir.join("self.ql"), &mut registry).expect_err("self import");
        assert_eq!(err.code(), ErrorCode::CircularImport);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_imports_are_file_errors() {
        let err = parse("@ 'definitely_missing_module'").expect_err("missing import");
        assert_eq!(err.code(), ErrorCode::FileNotFound);
    }
}
