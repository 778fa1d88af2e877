use std::collections::BTreeMap;
use std::mem;
use std::rc::Rc;

use tracing::{debug, trace};

use crate::ast::{
    BinaryOperator, Declared, ElseBranch, FStringPart, FileMode, GetAttr, Literal, ModuleGet,
    ModuleMember, Node, Program, SetMode, StatementList, UnaryOperator, VariableGet,
};
use crate::builtins::BuiltinFunction;
use crate::error::{Diagnostic, Error, ErrorCode, Fault, Result};
use crate::host::HostModule;
use crate::token::Location;

use super::memory::{ModuleHandle, ScopeId, accumulate, missing};
use super::value::{Closure, FileHandle, Key, MacroClosure, Value};
use super::Interpreter;

#[derive(Debug)]
pub(super) enum CallKind {
    Function,
    Macro { args: Vec<Value> },
}

/// One active function or macro call. `R` writes `value` and raises `returned`.
#[derive(Debug)]
pub(super) struct CallFrame {
    kind: CallKind,
    // Loops below this index belong to an enclosing call.
    loop_base: usize,
    returned: bool,
    value: Value,
}

impl CallFrame {
    fn new(kind: CallKind, loop_base: usize) -> Self {
        Self {
            kind,
            loop_base,
            returned: false,
            value: Value::Null,
        }
    }
}

#[derive(Debug, Default)]
pub(super) struct LoopFrame {
    breaking: bool,
    continuing: bool,
}

impl Interpreter<'_> {
    pub(super) fn run_unit(&mut self, program: &Program) -> Result<ScopeId> {
        if let Some(root) = self.executed.get(&program.path) {
            return Ok(*root);
        }
        let file = program.path.display().to_string();
        debug!(path = %file, "executing unit");
        let root = self.memory.open(format!("global {file}"), None, None);
        self.memory.pin(root);

        let saved_current = mem::replace(&mut self.current, root);
        let saved_file = mem::replace(&mut self.file, Rc::from(file));
        let saved_calls = mem::take(&mut self.calls);
        let saved_loops = mem::take(&mut self.loops);
        let result = self.exec_block(&program.statements);
        self.current = saved_current;
        self.file = saved_file;
        self.calls = saved_calls;
        self.loops = saved_loops;
        result?;

        self.executed.insert(program.path.clone(), root);
        Ok(root)
    }

    /// Runs statements in order, stopping early once a return, break or continue is pending.
    fn exec_block(&mut self, block: &StatementList) -> Result<()> {
        for child in &block.children {
            self.exec(child)?;
            if self.should_unwind() {
                break;
            }
        }
        Ok(())
    }

    fn should_unwind(&self) -> bool {
        self.calls.last().is_some_and(|frame| frame.returned)
            || self
                .loops
                .last()
                .is_some_and(|frame| frame.breaking || frame.continuing)
    }

    /// Runs `f` in a fresh block scope nested in the current one.
    fn scoped(&mut self, name: &str, f: impl FnOnce(&mut Self) -> Result<()>) -> Result<()> {
        let scope = self.memory.open(name, Some(self.current), Some(self.current));
        let saved = mem::replace(&mut self.current, scope);
        let result = f(self);
        self.current = saved;
        self.memory.release(scope);
        result
    }

    fn exec(&mut self, node: &Node) -> Result<()> {
        match node {
            Node::VariableDeclare(Declared::Value(value)) => {
                let value = self.eval(value)?;
                self.memory.insert(self.current, value);
                Ok(())
            }
            Node::VariableDeclare(Declared::Function(literal)) => {
                let closure = Closure {
                    literal: Rc::clone(literal),
                    scope: self.current,
                    file: Rc::clone(&self.file),
                };
                // Referencing the slot calls the closure, so it never outlives `self.current`.
                self.memory
                    .insert(self.current, Value::Function(Rc::new(closure)));
                Ok(())
            }
            Node::MacroDeclare(literal) => {
                let closure = MacroClosure {
                    literal: Rc::clone(literal),
                    scope: self.current,
                    file: Rc::clone(&self.file),
                };
                self.memory
                    .insert(self.current, Value::Macro(Rc::new(closure)));
                Ok(())
            }
            Node::VariableSet {
                depth,
                index,
                indexes,
                mode,
                value,
                location,
            } => self.exec_set(*depth, *index, indexes, *mode, value, *location),
            Node::If {
                condition,
                body,
                else_branch,
            } => {
                if self.eval(condition)?.is_truthy() {
                    self.scoped("if-block", |this| this.exec_block(body))
                } else {
                    match else_branch {
                        Some(ElseBranch::If(node)) => self.exec(node),
                        Some(ElseBranch::Block(block)) => {
                            self.scoped("else-block", |this| this.exec_block(block))
                        }
                        None => Ok(()),
                    }
                }
            }
            Node::While { condition, body } => self.looping(|this| {
                while this.eval(condition)?.is_truthy() {
                    this.scoped("while-block", |this| this.exec_block(body))?;
                    if this.end_iteration() {
                        break;
                    }
                }
                Ok(())
            }),
            Node::For {
                iterable,
                body,
                location,
            } => {
                let items = self
                    .eval(iterable)?
                    .iter_items()
                    .map_err(|fault| self.fault(fault, *location))?;
                self.looping(|this| {
                    for item in items {
                        this.scoped("for-block", |this| {
                            this.memory.insert(this.current, item);
                            this.exec_block(body)
                        })?;
                        if this.end_iteration() {
                            break;
                        }
                    }
                    Ok(())
                })
            }
            Node::Return { value, location } => {
                let value = match value {
                    Some(value) => self.eval(value)?,
                    None => Value::Null,
                };
                if self.calls.is_empty() {
                    return Err(self.error(
                        ErrorCode::InvalidReturn,
                        *location,
                        "'R' outside of a function or macro",
                    ));
                }
                if let Some(frame) = self.calls.last_mut() {
                    frame.returned = true;
                    frame.value = value;
                }
                Ok(())
            }
            Node::Break(location) => self.signal_loop(true, *location),
            Node::Continue(location) => self.signal_loop(false, *location),
            Node::Import {
                path,
                host,
                location,
            } => {
                let module = if *host {
                    let name = path.to_string_lossy();
                    let module = self.registry.host().module(&name).ok_or_else(|| {
                        self.error(
                            ErrorCode::ModuleNotFound,
                            *location,
                            format!("no host module '{name}'"),
                        )
                    })?;
                    ModuleHandle::Host(module)
                } else {
                    let program = self.registry.unit(path).ok_or_else(|| {
                        self.error(
                            ErrorCode::ModuleNotFound,
                            *location,
                            format!("'{}' was never parsed", path.display()),
                        )
                    })?;
                    ModuleHandle::Unit(self.run_unit(&program)?)
                };
                self.memory.add_module(self.current, module);
                Ok(())
            }
            Node::OpenFile {
                mode,
                path,
                body,
                location,
            } => self.exec_open_file(*mode, path, body, *location),
            Node::NoOp => Ok(()),
            other => self.eval(other).map(|_| ()),
        }
    }

    fn exec_set(
        &mut self,
        depth: usize,
        index: usize,
        indexes: &[Node],
        mode: SetMode,
        value: &Node,
        location: Location,
    ) -> Result<()> {
        let value = self.eval(value)?;
        let keys = self.eval_all(indexes)?;
        let current = self.current;
        let file = Rc::clone(&self.file);
        let located = |fault: Fault| Error::Runtime(fault.at(&file, location));

        if keys.is_empty() {
            return self
                .memory
                .set(current, depth, index, value, mode)
                .map_err(located);
        }
        let slot = self
            .memory
            .get_mut(current, depth, index)
            .ok_or_else(|| located(missing(depth, index)))?;
        let target = keys
            .iter()
            .try_fold(slot, |target, key| target.element_mut(key))
            .map_err(located)?;
        *target = accumulate(target, value, mode).map_err(located)?;
        Ok(())
    }

    fn exec_open_file(
        &mut self,
        mode: FileMode,
        path: &Node,
        body: &StatementList,
        location: Location,
    ) -> Result<()> {
        let name = match self.eval(path)? {
            Value::Str(name) => name,
            other => {
                return Err(self.error(
                    ErrorCode::ParamType,
                    location,
                    format!("file path must be str, got '{}'", other.type_name()),
                ));
            }
        };
        let resolved = self.registry.resolve_file(&name);
        let handle = FileHandle::open(resolved.clone(), mode).map_err(|error| {
            self.error(
                ErrorCode::FileNotFound,
                location,
                format!("cannot open '{}': {error}", resolved.display()),
            )
        })?;
        debug!(path = %resolved.display(), ?mode, "open file");
        let handle = Rc::new(handle);
        let result = self.scoped("file-block", |this| {
            this.memory
                .insert(this.current, Value::File(Rc::clone(&handle)));
            this.exec_block(body)
        });
        handle.close();
        result
    }

    fn looping(&mut self, f: impl FnOnce(&mut Self) -> Result<()>) -> Result<()> {
        self.loops.push(LoopFrame::default());
        let result = f(self);
        self.loops.pop();
        result
    }

    /// Clears a pending `C`. Returns true when the loop has to stop.
    fn end_iteration(&mut self) -> bool {
        let returning = self.calls.last().is_some_and(|frame| frame.returned);
        match self.loops.last_mut() {
            Some(frame) => {
                frame.continuing = false;
                frame.breaking || returning
            }
            None => true,
        }
    }

    /// Flags the innermost loop of the current function. Macros see their caller's loops.
    fn signal_loop(&mut self, breaking: bool, location: Location) -> Result<()> {
        let base = self.calls.last().map_or(0, |frame| frame.loop_base);
        if self.loops.len() <= base {
            let (code, spelling) = if breaking {
                (ErrorCode::InvalidBreak, "'B'")
            } else {
                (ErrorCode::InvalidContinue, "'C'")
            };
            return Err(self.error(code, location, format!("{spelling} outside of a loop")));
        }
        if let Some(frame) = self.loops.last_mut() {
            if breaking {
                frame.breaking = true;
            } else {
                frame.continuing = true;
            }
        }
        Ok(())
    }

    fn eval_all(&mut self, nodes: &[Node]) -> Result<Vec<Value>> {
        nodes.iter().map(|node| self.eval(node)).collect()
    }

    fn eval(&mut self, node: &Node) -> Result<Value> {
        match node {
            Node::Literal(literal) => Ok(literal_value(literal)),
            Node::BinaryOp {
                left,
                op: BinaryOperator::And,
                right,
                ..
            } => {
                let result = self.eval(left)?.is_truthy() && self.eval(right)?.is_truthy();
                Ok(Value::Bool(result))
            }
            Node::BinaryOp {
                left,
                op: BinaryOperator::Or,
                right,
                ..
            } => {
                let result = self.eval(left)?.is_truthy() || self.eval(right)?.is_truthy();
                Ok(Value::Bool(result))
            }
            Node::BinaryOp {
                left,
                op,
                right,
                location,
            } => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                left.binary(*op, &right)
                    .map_err(|fault| self.fault(fault, *location))
            }
            Node::UnaryOp { op, expr, location } => {
                let value = self.eval(expr)?;
                match op {
                    UnaryOperator::Plus => value.positive(),
                    UnaryOperator::Minus => value.negate(),
                }
                .map_err(|fault| self.fault(fault, *location))
            }
            Node::Not(expr) => Ok(Value::Bool(!self.eval(expr)?.is_truthy())),
            Node::List(items) => Ok(Value::List(self.eval_all(items)?)),
            Node::Tuple(items) => Ok(Value::Tuple(self.eval_all(items)?)),
            Node::Dict { pairs, location } => {
                let mut entries = BTreeMap::new();
                for (key, value) in pairs {
                    let key = self.eval(key)?;
                    let key = Key::from_value(&key).map_err(|fault| self.fault(fault, *location))?;
                    let value = self.eval(value)?;
                    entries.insert(key, value);
                }
                Ok(Value::Dict(entries))
            }
            Node::FString(parts) => {
                let mut text = String::new();
                for part in parts {
                    match part {
                        FStringPart::Text(raw) => text.push_str(raw),
                        FStringPart::Expr(expr) => text.push_str(&self.eval(expr)?.to_string()),
                    }
                }
                Ok(Value::Str(text))
            }
            Node::VariableGet(variable) => self.eval_variable(variable, self.current),
            Node::ModuleGet(module) => self.eval_module(module, self.current),
            Node::MacroParamGet { index, location } => match self.calls.last() {
                Some(CallFrame {
                    kind: CallKind::Macro { args },
                    ..
                }) => args.get(*index).cloned().ok_or_else(|| {
                    self.error(
                        ErrorCode::IdNotFound,
                        *location,
                        format!("no macro parameter ~{index}"),
                    )
                }),
                _ => Err(self.error(
                    ErrorCode::IdNotFound,
                    *location,
                    "'~' outside of a macro",
                )),
            },
            Node::BuiltInCall {
                name,
                args,
                host: true,
                location,
                ..
            } => {
                let values = self.eval_all(args)?;
                let registry = self.registry;
                registry
                    .host()
                    .root()
                    .call(name, &values)
                    .map_err(|fault| self.fault(fault, *location))
            }
            Node::BuiltInCall {
                name,
                args,
                by_reference,
                location,
                ..
            } => self.eval_builtin(name, args, *by_reference, *location),
            Node::GetAttr(attr) => {
                let registry = self.registry;
                self.eval_attr(registry.host().root(), attr)
            }
            Node::NoOp => Ok(Value::Null),
            Node::VariableDeclare(_)
            | Node::MacroDeclare(_)
            | Node::VariableSet { .. }
            | Node::If { .. }
            | Node::While { .. }
            | Node::For { .. }
            | Node::Return { .. }
            | Node::Break(_)
            | Node::Continue(_)
            | Node::Import { .. }
            | Node::OpenFile { .. } => {
                self.exec(node)?;
                Ok(Value::Null)
            }
        }
    }

    /// Reads, calls and indexes a slot. Arguments and indexes are evaluated in the
    /// current scope, the slot is found from `lookup`.
    fn eval_variable(&mut self, variable: &VariableGet, lookup: ScopeId) -> Result<Value> {
        let args = match &variable.args {
            Some(args) => Some(self.eval_all(args)?),
            None => None,
        };
        let keys = self.eval_all(&variable.indexes)?;
        let location = variable.location;
        let slot = self
            .memory
            .get(lookup, variable.depth, variable.index)
            .ok_or_else(|| self.fault(missing(variable.depth, variable.index), location))?;

        let result = match slot {
            Value::Function(closure) => {
                let closure = Rc::clone(closure);
                self.call_function(&closure, args.unwrap_or_default(), location)?
            }
            Value::Macro(closure) => {
                let closure = Rc::clone(closure);
                self.call_macro(&closure, args.unwrap_or_default(), location)?
            }
            other if args.is_some() => {
                return Err(self.error(
                    ErrorCode::InvalidFunctionCall,
                    location,
                    format!("'{}' object is not callable", other.type_name()),
                ));
            }
            other => {
                return index_chain(other, &keys).map_err(|fault| self.fault(fault, location));
            }
        };
        index_chain(&result, &keys).map_err(|fault| self.fault(fault, location))
    }

    fn call_function(
        &mut self,
        closure: &Closure,
        args: Vec<Value>,
        location: Location,
    ) -> Result<Value> {
        let literal = &closure.literal;
        if !literal.accepts(args.len()) {
            return Err(self.error(
                ErrorCode::WrongParamsNum,
                location,
                format!(
                    "{} was passed, but {} to {} were expected",
                    args.len(),
                    literal.params_num,
                    literal.params_num + literal.defaults.len()
                ),
            ));
        }
        trace!(params = literal.params_num, args = args.len(), "call function");
        let supplied = args.len();
        let missing_defaults = &literal.defaults[supplied - literal.params_num..];
        let frame = CallFrame::new(CallKind::Function, self.loops.len());
        self.enter_call(closure.scope, &closure.file, frame, args, |this| {
            for default in missing_defaults {
                let value = this.eval(default)?;
                this.memory.insert(this.current, value);
            }
            this.exec_block(&literal.body)
        })
    }

    fn call_macro(
        &mut self,
        closure: &MacroClosure,
        args: Vec<Value>,
        location: Location,
    ) -> Result<Value> {
        let params_num = closure.literal.params_num;
        if args.len() != params_num {
            return Err(self.error(
                ErrorCode::WrongParamsNum,
                location,
                format!("{} was passed, but {params_num} were expected", args.len()),
            ));
        }
        trace!(params = params_num, "expand macro");
        // Macros stay transparent to the caller's loops.
        let loop_base = self.calls.last().map_or(0, |frame| frame.loop_base);
        let frame = CallFrame::new(CallKind::Macro { args }, loop_base);
        self.enter_call(closure.scope, &closure.file, frame, Vec::new(), |this| {
            this.exec_block(&closure.literal.body)
        })
    }

    /// Opens the callee scope under its definition scope, returning to the caller's
    /// scope afterwards. The call's value is whatever `R` stored in its frame.
    fn enter_call(
        &mut self,
        definition: ScopeId,
        file: &Rc<str>,
        frame: CallFrame,
        params: Vec<Value>,
        body: impl FnOnce(&mut Self) -> Result<()>,
    ) -> Result<Value> {
        let caller = self.current;
        let scope = self.memory.open("call", Some(definition), Some(caller));
        for value in params {
            self.memory.insert(scope, value);
        }
        self.current = scope;
        let saved_file = mem::replace(&mut self.file, Rc::clone(file));
        self.calls.push(frame);

        let result = body(self);

        let frame = self.calls.pop();
        self.file = saved_file;
        self.current = self.memory.return_to(scope).unwrap_or(caller);
        self.memory.release(scope);
        result?;
        Ok(frame.map_or(Value::Null, |frame| frame.value))
    }

    fn eval_builtin(
        &mut self,
        name: &str,
        args: &[Node],
        by_reference: bool,
        location: Location,
    ) -> Result<Value> {
        let builtin = BuiltinFunction::from_name(name).ok_or_else(|| {
            self.error(
                ErrorCode::IdNotFound,
                location,
                format!("unknown built-in '{name}'"),
            )
        })?;
        let receiver = match args.first() {
            Some(Node::VariableGet(receiver)) if by_reference && self.holds_data(receiver) => {
                Some(receiver)
            }
            _ => None,
        };
        let Some(receiver) = receiver else {
            let mut values = self.eval_all(args)?;
            return builtin
                .call(&mut self.output, &mut values)
                .map_err(|fault| self.fault(fault, location));
        };

        // The receiver's index chain is evaluated once and reused for the write-back.
        let keys = self.eval_all(&receiver.indexes)?;
        let slot = self
            .memory
            .get(self.current, receiver.depth, receiver.index)
            .ok_or_else(|| self.fault(missing(receiver.depth, receiver.index), location))?;
        let target = index_chain(slot, &keys).map_err(|fault| self.fault(fault, location))?;
        let mut values = vec![target];
        values.extend(self.eval_all(&args[1..])?);
        let result = builtin
            .call(&mut self.output, &mut values)
            .map_err(|fault| self.fault(fault, location))?;

        if let Some(updated) = values.into_iter().next() {
            let slot = self
                .memory
                .get_mut(self.current, receiver.depth, receiver.index)
                .ok_or_else(|| missing(receiver.depth, receiver.index));
            let written = slot.and_then(|slot| {
                let target = keys
                    .iter()
                    .try_fold(slot, |target, key| target.element_mut(key))?;
                *target = updated;
                Ok(())
            });
            written.map_err(|fault| self.fault(fault, location))?;
        }
        Ok(result)
    }

    /// Whether the receiver slot holds data rather than a function or macro to call.
    fn holds_data(&self, receiver: &VariableGet) -> bool {
        receiver.args.is_none()
            && self
                .memory
                .get(self.current, receiver.depth, receiver.index)
                .is_some_and(|slot| !matches!(slot, Value::Function(_) | Value::Macro(_)))
    }

    fn eval_module(&mut self, module: &ModuleGet, lookup: ScopeId) -> Result<Value> {
        let handle = self
            .memory
            .module(lookup, module.depth, module.index)
            .cloned()
            .ok_or_else(|| {
                self.error(
                    ErrorCode::ModuleNotFound,
                    module.location,
                    format!("no module at ${}", module.index),
                )
            })?;
        match (&module.member, handle) {
            (ModuleMember::Variable(variable), ModuleHandle::Unit(root)) => {
                self.eval_variable(variable, root)
            }
            (ModuleMember::Module(inner), ModuleHandle::Unit(root)) => {
                self.eval_module(inner, root)
            }
            (ModuleMember::Attr(attr), ModuleHandle::Host(host)) => self.eval_attr(&host, attr),
            (ModuleMember::Attr(attr), ModuleHandle::Unit(_)) => Err(self.error(
                ErrorCode::IdNotFound,
                attr.location,
                format!("'^{}' needs a host module", attr.name),
            )),
            (_, ModuleHandle::Host(host)) => Err(self.error(
                ErrorCode::IdNotFound,
                module.location,
                format!("host module '{}' has no slots", host.name()),
            )),
        }
    }

    /// `^name<args>` calls a member of `host`. Without arguments a constant is read, or a
    /// zero-argument function is called. Arguments are evaluated in the caller's context
    /// first, so `^` inside them still means the root namespace.
    fn eval_attr(&mut self, host: &HostModule, attr: &GetAttr) -> Result<Value> {
        let result = match &attr.args {
            Some(args) => {
                let values = self.eval_all(args)?;
                host.call(&attr.name, &values)
            }
            None => match host.lookup_constant(&attr.name) {
                Some(value) => Ok(value.clone()),
                None => host.call(&attr.name, &[]),
            },
        };
        result.map_err(|fault| self.fault(fault, attr.location))
    }

    fn fault(&self, fault: Fault, location: Location) -> Error {
        Error::Runtime(fault.at(&self.file, location))
    }

    fn error(&self, code: ErrorCode, location: Location, detail: impl Into<String>) -> Error {
        Error::Runtime(Diagnostic::new(code, self.file.as_ref(), location, detail))
    }
}

fn literal_value(literal: &Literal) -> Value {
    match literal {
        Literal::Int(value) => Value::Int(*value),
        Literal::Float(value) => Value::Float(*value),
        Literal::Str(text) => Value::Str(text.clone()),
        Literal::Bool(value) => Value::Bool(*value),
        Literal::Null => Value::Null,
    }
}

fn index_chain(value: &Value, keys: &[Value]) -> std::result::Result<Value, Fault> {
    let Some((first, rest)) = keys.split_first() else {
        return Ok(value.clone());
    };
    rest.iter()
        .try_fold(value.index(first)?, |value, key| value.index(key))
}
