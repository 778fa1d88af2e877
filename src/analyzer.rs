//! Static checks over positional addresses.
//!
//! The analyzer replays the interpreter's scope discipline on a table of symbol
//! shapes, so every `(depth, index)` it accepts is one the interpreter will find.

use std::mem;
use std::path::PathBuf;
use std::rc::Rc;

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::ast::{
    Declared, ElseBranch, FStringPart, FileMode, FunctionLiteral, GetAttr, Literal, MacroLiteral,
    ModuleGet, ModuleMember, Node, Program, SetMode, StatementList, VariableGet,
};
use crate::builtins;
use crate::error::{Diagnostic, Error, ErrorCode, Result};
use crate::host::HostModule;
use crate::registry::ModuleRegistry;
use crate::token::Location;

mod symbol_table;

pub use symbol_table::{Shape, StaticModule, Symbol, SymbolTables, TableId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Unit,
    Function,
    Macro { params_num: usize },
}

/// One callable body being analyzed.
#[derive(Debug)]
struct Frame {
    kind: FrameKind,
    loop_depth: usize,
    // Set when a macro body uses B/C outside any loop of its own.
    loop_control: bool,
}

impl Frame {
    fn new(kind: FrameKind) -> Self {
        Self {
            kind,
            loop_depth: 0,
            loop_control: false,
        }
    }
}

pub struct SemanticAnalyzer<'r> {
    registry: &'r ModuleRegistry,
    tables: SymbolTables,
    current: TableId,
    file: Rc<str>,
    frames: Vec<Frame>,
    analyzed: FxHashMap<PathBuf, TableId>,
}

impl<'r> SemanticAnalyzer<'r> {
    pub fn new(registry: &'r ModuleRegistry) -> Self {
        let mut tables = SymbolTables::new();
        let current = tables.open("host", None);
        Self {
            registry,
            tables,
            current,
            file: Rc::from(""),
            frames: Vec::new(),
            analyzed: FxHashMap::default(),
        }
    }

    /// Analyzes `program` and everything it imports. Returns its root table.
    pub fn analyze(&mut self, program: &Program) -> Result<TableId> {
        self.analyze_unit(program)
    }

    pub fn tables(&self) -> &SymbolTables {
        &self.tables
    }

    fn analyze_unit(&mut self, program: &Program) -> Result<TableId> {
        if let Some(root) = self.analyzed.get(&program.path) {
            return Ok(*root);
        }
        debug!(path = %program.path.display(), "analyzing unit");
        let file = program.path.display().to_string();
        let root = self.tables.open(format!("global {file}"), None);

        let saved_current = mem::replace(&mut self.current, root);
        let saved_file = mem::replace(&mut self.file, Rc::from(file));
        let saved_frames = mem::replace(&mut self.frames, vec![Frame::new(FrameKind::Unit)]);
        let result = self.visit_block(&program.statements);
        self.current = saved_current;
        self.file = saved_file;
        self.frames = saved_frames;
        result?;

        self.analyzed.insert(program.path.clone(), root);
        Ok(root)
    }

    fn visit_block(&mut self, block: &StatementList) -> Result<()> {
        block.children.iter().try_for_each(|child| self.visit(child))
    }

    /// Runs `f` inside a fresh table nested in the current one.
    fn with_scope(
        &mut self,
        name: &str,
        f: impl FnOnce(&mut Self) -> Result<()>,
    ) -> Result<()> {
        let scope = self.tables.open(name, Some(self.current));
        let saved = mem::replace(&mut self.current, scope);
        let result = f(self);
        self.current = saved;
        result
    }

    fn visit_all(&mut self, nodes: &[Node]) -> Result<()> {
        nodes.iter().try_for_each(|node| self.visit(node))
    }

    fn visit(&mut self, node: &Node) -> Result<()> {
        match node {
            Node::BinaryOp { left, right, .. } => {
                self.visit(left)?;
                self.visit(right)
            }
            Node::UnaryOp { expr, .. } | Node::Not(expr) => self.visit(expr),
            Node::Literal(_) | Node::NoOp => Ok(()),
            Node::List(items) | Node::Tuple(items) => self.visit_all(items),
            Node::Dict { pairs, .. } => pairs.iter().try_for_each(|(key, value)| {
                self.visit(key)?;
                self.visit(value)
            }),
            Node::FString(parts) => parts.iter().try_for_each(|part| match part {
                FStringPart::Text(_) => Ok(()),
                FStringPart::Expr(expr) => self.visit(expr),
            }),
            Node::VariableDeclare(Declared::Value(value)) => {
                self.visit(value)?;
                let indexable = !matches!(
                    value.as_ref(),
                    Node::Literal(Literal::Int(_) | Literal::Float(_) | Literal::Bool(_) | Literal::Null)
                );
                self.tables.insert(self.current, Symbol::value(indexable));
                Ok(())
            }
            Node::VariableDeclare(Declared::Function(literal)) => self.visit_function(literal),
            Node::MacroDeclare(literal) => self.visit_macro(literal),
            Node::VariableSet {
                depth,
                index,
                indexes,
                mode,
                value,
                location,
            } => {
                let symbol = self.lookup(*depth, *index, *location)?;
                self.visit_all(indexes)?;
                self.visit(value)?;
                if indexes.is_empty() {
                    if *mode == SetMode::Assign {
                        self.tables
                            .set(self.current, *depth, *index, Symbol::value(true));
                    }
                    Ok(())
                } else if symbol.is_indexable() {
                    Ok(())
                } else {
                    Err(self.not_indexable(*depth, *index, *location))
                }
            }
            Node::VariableGet(variable) => {
                self.visit_arguments(variable)?;
                let symbol = self.lookup(variable.depth, variable.index, variable.location)?;
                self.check_reference(symbol, variable)
            }
            Node::If {
                condition,
                body,
                else_branch,
            } => {
                self.visit(condition)?;
                self.with_scope("if-block", |this| this.visit_block(body))?;
                match else_branch {
                    Some(ElseBranch::If(node)) => self.visit(node),
                    Some(ElseBranch::Block(block)) => {
                        self.with_scope("else-block", |this| this.visit_block(block))
                    }
                    None => Ok(()),
                }
            }
            Node::While { condition, body } => {
                self.visit(condition)?;
                self.visit_loop("while-block", body, false)
            }
            Node::For { iterable, body, .. } => {
                self.visit(iterable)?;
                self.visit_loop("for-block", body, true)
            }
            Node::Return { value, location } => {
                let inside_callable = self.frames.last().is_some_and(|frame| {
                    matches!(frame.kind, FrameKind::Function | FrameKind::Macro { .. })
                });
                if !inside_callable {
                    return Err(self.error(
                        ErrorCode::InvalidReturn,
                        *location,
                        "'R' outside of a function or macro",
                    ));
                }
                value.as_deref().map_or(Ok(()), |value| self.visit(value))
            }
            Node::Break(location) => self.loop_control(ErrorCode::InvalidBreak, *location, "'B'"),
            Node::Continue(location) => {
                self.loop_control(ErrorCode::InvalidContinue, *location, "'C'")
            }
            Node::Import {
                path,
                host,
                location,
            } => self.visit_import(path, *host, *location),
            Node::ModuleGet(module) => self.visit_module(module, self.current),
            Node::OpenFile {
                mode,
                path,
                body,
                location,
            } => {
                self.visit(path)?;
                if let (FileMode::Read, Node::Literal(Literal::Str(name))) = (mode, path.as_ref()) {
                    let resolved = self.registry.resolve_file(name);
                    if !resolved.is_file() {
                        return Err(self.error(
                            ErrorCode::FileNotFound,
                            *location,
                            format!("cannot open '{}'", resolved.display()),
                        ));
                    }
                }
                self.with_scope("file-block", |this| {
                    this.tables.insert(this.current, Symbol::file());
                    this.visit_block(body)
                })
            }
            Node::BuiltInCall {
                name,
                args,
                host,
                location,
                ..
            } => {
                self.visit_all(args)?;
                if *host {
                    let root = Rc::clone(self.registry.host().root());
                    self.check_host_call(&root, name, args.len(), *location)
                } else {
                    self.check_builtin(name, args.len(), *location)
                }
            }
            Node::GetAttr(attr) => {
                let root = Rc::clone(self.registry.host().root());
                self.check_attr(&root, attr)
            }
            Node::MacroParamGet { index, location } => match self.frames.last() {
                Some(Frame {
                    kind: FrameKind::Macro { params_num },
                    ..
                }) if index < params_num => Ok(()),
                _ => Err(self.error(
                    ErrorCode::IdNotFound,
                    *location,
                    format!("no macro parameter ~{index}"),
                )),
            },
        }
    }

    fn visit_function(&mut self, literal: &FunctionLiteral) -> Result<()> {
        // Inserted before the body so the body can call itself.
        self.tables.insert(
            self.current,
            Symbol::function(literal.params_num, literal.defaults.len()),
        );
        self.frames.push(Frame::new(FrameKind::Function));
        let result = self.with_scope("function", |this| {
            for _ in 0..literal.params_num {
                this.tables.insert(this.current, Symbol::value(true));
            }
            // Default i sees the required parameters and defaults 0..i.
            for default in &literal.defaults {
                this.visit(default)?;
                this.tables.insert(this.current, Symbol::value(true));
            }
            this.visit_block(&literal.body)
        });
        self.frames.pop();
        result
    }

    fn visit_macro(&mut self, literal: &MacroLiteral) -> Result<()> {
        let index = self
            .tables
            .insert(self.current, Symbol::macro_symbol(literal.params_num));
        self.frames.push(Frame::new(FrameKind::Macro {
            params_num: literal.params_num,
        }));
        let result = self.with_scope("macro", |this| this.visit_block(&literal.body));
        let frame = self.frames.pop();
        result?;
        if frame.is_some_and(|frame| frame.loop_control) {
            let symbol = Symbol {
                shape: Shape::Macro { loop_control: true },
                ..Symbol::macro_symbol(literal.params_num)
            };
            self.tables.set(self.current, 0, index, symbol);
        }
        Ok(())
    }

    fn visit_loop(&mut self, name: &str, body: &StatementList, binds_element: bool) -> Result<()> {
        self.adjust_loop_depth(true);
        let result = self.with_scope(name, |this| {
            if binds_element {
                this.tables.insert(this.current, Symbol::value(true));
            }
            this.visit_block(body)
        });
        self.adjust_loop_depth(false);
        result
    }

    fn adjust_loop_depth(&mut self, enter: bool) {
        if let Some(frame) = self.frames.last_mut() {
            if enter {
                frame.loop_depth += 1;
            } else {
                frame.loop_depth = frame.loop_depth.saturating_sub(1);
            }
        }
    }

    /// `B`/`C` need an enclosing loop in the current callable. Inside a macro they
    /// instead mark the macro as one that may only be called from a loop.
    fn loop_control(&mut self, code: ErrorCode, location: Location, spelling: &str) -> Result<()> {
        if let Some(frame) = self.frames.last_mut() {
            if frame.loop_depth > 0 {
                return Ok(());
            }
            if matches!(frame.kind, FrameKind::Macro { .. }) {
                frame.loop_control = true;
                return Ok(());
            }
        }
        Err(self.error(code, location, format!("{spelling} outside of a loop")))
    }

    fn visit_import(&mut self, path: &std::path::Path, host: bool, location: Location) -> Result<()> {
        let module = if host {
            let name = path.to_string_lossy();
            let module = self.registry.host().module(&name).ok_or_else(|| {
                self.error(
                    ErrorCode::ModuleNotFound,
                    location,
                    format!("no host module '{name}'"),
                )
            })?;
            StaticModule::Host(module)
        } else {
            let program = self.registry.unit(path).ok_or_else(|| {
                self.error(
                    ErrorCode::ModuleNotFound,
                    location,
                    format!("'{}' was never parsed", path.display()),
                )
            })?;
            StaticModule::Unit(self.analyze_unit(&program)?)
        };
        self.tables.add_module(self.current, module);
        Ok(())
    }

    /// Resolves a module member. Arguments are checked in the caller's scope, the
    /// member address in the module's root table.
    fn visit_module(&mut self, module: &ModuleGet, lookup: TableId) -> Result<()> {
        let target = self
            .tables
            .module(lookup, module.depth, module.index)
            .cloned()
            .ok_or_else(|| {
                self.error(
                    ErrorCode::ModuleNotFound,
                    module.location,
                    format!("no module at {}", address("$", module.depth, module.index)),
                )
            })?;
        match (&module.member, target) {
            (ModuleMember::Variable(variable), StaticModule::Unit(table)) => {
                self.visit_arguments(variable)?;
                let symbol = self
                    .tables
                    .lookup(table, variable.depth, variable.index)
                    .ok_or_else(|| self.missing(variable.depth, variable.index, variable.location))?;
                self.check_reference(symbol, variable)
            }
            (ModuleMember::Module(inner), StaticModule::Unit(table)) => {
                self.visit_module(inner, table)
            }
            (ModuleMember::Attr(attr), StaticModule::Host(host)) => self.check_attr(&host, attr),
            (ModuleMember::Attr(attr), StaticModule::Unit(_)) => Err(self.error(
                ErrorCode::IdNotFound,
                attr.location,
                format!("'^{}' needs a host module", attr.name),
            )),
            (_, StaticModule::Host(host)) => Err(self.error(
                ErrorCode::IdNotFound,
                module.location,
                format!("host module '{}' has no slots", host.name()),
            )),
        }
    }

    fn visit_arguments(&mut self, variable: &VariableGet) -> Result<()> {
        if let Some(args) = &variable.args {
            self.visit_all(args)?;
        }
        self.visit_all(&variable.indexes)
    }

    fn check_reference(&mut self, symbol: Symbol, variable: &VariableGet) -> Result<()> {
        let count = variable.arg_count();
        let location = variable.location;
        match symbol.shape {
            Shape::Function if !symbol.accepts(count) => {
                return Err(self.wrong_params(count, &symbol, location));
            }
            Shape::Macro { loop_control } => {
                if count != symbol.params_num {
                    return Err(self.wrong_params(count, &symbol, location));
                }
                if loop_control {
                    self.loop_control(
                        ErrorCode::InvalidBreak,
                        location,
                        "call of a macro using 'B' or 'C'",
                    )?;
                }
            }
            // Even `M0<>` is a call, and only functions and macros can be called.
            Shape::Value { .. } | Shape::File if variable.args.is_some() => {
                return Err(self.error(
                    ErrorCode::InvalidFunctionCall,
                    location,
                    format!(
                        "{} holds a value and cannot be called",
                        address("M", variable.depth, variable.index)
                    ),
                ));
            }
            _ => {}
        }
        if !variable.indexes.is_empty() && !symbol.is_indexable() {
            return Err(self.not_indexable(variable.depth, variable.index, location));
        }
        Ok(())
    }

    fn check_builtin(&self, name: &str, count: usize, location: Location) -> Result<()> {
        let signature = builtins::signature(name).ok_or_else(|| {
            self.error(
                ErrorCode::IdNotFound,
                location,
                format!("unknown built-in '{name}'"),
            )
        })?;
        if signature.accepts(count) {
            Ok(())
        } else {
            Err(self.error(
                ErrorCode::WrongParamsNum,
                location,
                format!(
                    "{count} was passed to {}, but {} were expected",
                    signature.name,
                    signature.describe_arity()
                ),
            ))
        }
    }

    fn check_host_call(
        &self,
        module: &HostModule,
        name: &str,
        count: usize,
        location: Location,
    ) -> Result<()> {
        let function = module.lookup_function(name).ok_or_else(|| {
            self.error(
                ErrorCode::IdNotFound,
                location,
                format!("unknown host function '{name}'"),
            )
        })?;
        if function.accepts(count) {
            Ok(())
        } else {
            Err(self.error(
                ErrorCode::WrongParamsNum,
                location,
                format!(
                    "{count} was passed to '{name}', but {} were expected",
                    function.params_num
                ),
            ))
        }
    }

    /// `^name` without arguments reads a constant, or calls a zero-argument function.
    fn check_attr(&mut self, module: &HostModule, attr: &GetAttr) -> Result<()> {
        match &attr.args {
            Some(args) => {
                self.visit_all(args)?;
                self.check_host_call(module, &attr.name, args.len(), attr.location)
            }
            None if module.lookup_constant(&attr.name).is_some() => Ok(()),
            None => self.check_host_call(module, &attr.name, 0, attr.location),
        }
    }

    fn lookup(&self, depth: usize, index: usize, location: Location) -> Result<Symbol> {
        self.tables
            .lookup(self.current, depth, index)
            .ok_or_else(|| self.missing(depth, index, location))
    }

    fn missing(&self, depth: usize, index: usize, location: Location) -> Error {
        self.error(
            ErrorCode::IdNotFound,
            location,
            format!("nothing declared at {}", address("M", depth, index)),
        )
    }

    fn not_indexable(&self, depth: usize, index: usize, location: Location) -> Error {
        self.error(
            ErrorCode::InvalidIndexer,
            location,
            format!("{} cannot be indexed", address("M", depth, index)),
        )
    }

    fn wrong_params(&self, count: usize, symbol: &Symbol, location: Location) -> Error {
        let expected = if symbol.default_count == 0 {
            symbol.params_num.to_string()
        } else {
            format!(
                "{} to {}",
                symbol.params_num,
                symbol.params_num + symbol.default_count
            )
        };
        self.error(
            ErrorCode::WrongParamsNum,
            location,
            format!("{count} was passed, but {expected} were expected"),
        )
    }

    fn error(&self, code: ErrorCode, location: Location, detail: impl Into<String>) -> Error {
        Error::Semantic(Diagnostic::new(code, self.file.as_ref(), location, detail))
    }
}

/// Source spelling of a positional address, e.g. `M..3`.
fn address(marker: &str, depth: usize, index: usize) -> String {
    format!("{marker}{}{index}", ".".repeat(depth))
}
