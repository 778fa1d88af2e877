use std::path::PathBuf;
use std::rc::Rc;

use crate::token::Location;

/// Parsed file. `path` is the key the file is registered under in the module registry.
#[derive(Debug, PartialEq, Clone)]
pub struct Program {
    pub path: PathBuf,
    pub statements: StatementList,
}

/// Which construct a statement list is the body of.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum BlockKind {
    Program,
    Function,
    Conditional,
    Loop,
    OpenFile,
    Macro,
}

#[derive(Debug, PartialEq, Clone)]
pub struct StatementList {
    pub kind: BlockKind,
    pub children: Vec<Node>,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum BinaryOperator {
    Add,
    Sub,
    Mul,
    Expo,
    IntDiv,
    FloatDiv,
    Mod,
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

impl BinaryOperator {
    pub fn spelling(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Expo => "**",
            Self::IntDiv => "//",
            Self::FloatDiv => "/",
            Self::Mod => "%",
            Self::And => "&",
            Self::Or => "|",
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Lt => "</",
            Self::Gt => ">/",
            Self::Le => "<=",
            Self::Ge => ">=",
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum UnaryOperator {
    Plus,
    Minus,
}

#[derive(Debug, PartialEq, Clone)]
pub enum Literal {
    Int(i64),
    Float(f64),
    /// Raw text; escapes are decoded by the built-in that consumes the string.
    Str(String),
    Bool(bool),
    Null,
}

#[derive(Debug, PartialEq, Clone)]
pub enum FStringPart {
    Text(String),
    Expr(Node),
}

#[derive(Debug, PartialEq, Clone)]
pub struct FunctionLiteral {
    pub params_num: usize,
    /// Default values for the trailing optional parameters after the required ones.
    pub defaults: Vec<Node>,
    pub body: StatementList,
}

impl FunctionLiteral {
    pub fn accepts(&self, count: usize) -> bool {
        (self.params_num..=self.params_num + self.defaults.len()).contains(&count)
    }
}

#[derive(Debug, PartialEq, Clone)]
pub struct MacroLiteral {
    pub params_num: usize,
    pub body: StatementList,
}

/// What a `VariableDeclare` appends to the current scope.
#[derive(Debug, PartialEq, Clone)]
pub enum Declared {
    Function(Rc<FunctionLiteral>),
    Value(Box<Node>),
}

/// Positional variable reference `M<dots><index>`, optionally called and indexed.
#[derive(Debug, PartialEq, Clone)]
pub struct VariableGet {
    pub depth: usize,
    pub index: usize,
    pub args: Option<Vec<Node>>,
    pub indexes: Vec<Node>,
    pub location: Location,
}

impl VariableGet {
    pub fn arg_count(&self) -> usize {
        self.args.as_ref().map_or(0, Vec::len)
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SetMode {
    Assign,
    Add,
    Subtract,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum FileMode {
    Read,
    Write,
    Append,
}

/// Host-module member access `^name` or `^name<args>`.
#[derive(Debug, PartialEq, Clone)]
pub struct GetAttr {
    pub name: String,
    pub args: Option<Vec<Node>>,
    pub location: Location,
}

#[derive(Debug, PartialEq, Clone)]
pub enum ModuleMember {
    Variable(VariableGet),
    Module(Box<ModuleGet>),
    Attr(GetAttr),
}

/// Module reference `$<dots><index>` followed by the member looked up inside it.
#[derive(Debug, PartialEq, Clone)]
pub struct ModuleGet {
    pub depth: usize,
    pub index: usize,
    pub member: ModuleMember,
    pub location: Location,
}

#[derive(Debug, PartialEq, Clone)]
pub enum ElseBranch {
    If(Box<Node>),
    Block(StatementList),
}

#[derive(Debug, PartialEq, Clone)]
pub enum Node {
    BinaryOp {
        left: Box<Node>,
        op: BinaryOperator,
        right: Box<Node>,
        location: Location,
    },
    UnaryOp {
        op: UnaryOperator,
        expr: Box<Node>,
        location: Location,
    },
    Literal(Literal),
    List(Vec<Node>),
    Tuple(Vec<Node>),
    Dict {
        pairs: Vec<(Node, Node)>,
        location: Location,
    },
    FString(Vec<FStringPart>),
    VariableDeclare(Declared),
    VariableSet {
        depth: usize,
        index: usize,
        indexes: Vec<Node>,
        mode: SetMode,
        value: Box<Node>,
        location: Location,
    },
    VariableGet(VariableGet),
    Not(Box<Node>),
    If {
        condition: Box<Node>,
        body: StatementList,
        else_branch: Option<ElseBranch>,
    },
    While {
        condition: Box<Node>,
        body: StatementList,
    },
    For {
        iterable: Box<Node>,
        body: StatementList,
        location: Location,
    },
    Return {
        value: Option<Box<Node>>,
        location: Location,
    },
    Break(Location),
    Continue(Location),
    Import {
        /// Registry key for in-language imports, module name for host imports.
        path: PathBuf,
        host: bool,
        location: Location,
    },
    ModuleGet(ModuleGet),
    OpenFile {
        mode: FileMode,
        path: Box<Node>,
        body: StatementList,
        location: Location,
    },
    BuiltInCall {
        name: String,
        args: Vec<Node>,
        host: bool,
        by_reference: bool,
        location: Location,
    },
    GetAttr(GetAttr),
    MacroDeclare(Rc<MacroLiteral>),
    MacroParamGet {
        index: usize,
        location: Location,
    },
    NoOp,
}
