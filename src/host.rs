//! Native functions reachable through `^`.
//!
//! The root module answers `^name<args>` everywhere. Named modules are brought into a scope
//! with `@^'name'` and addressed with `$<n> ^name`.

use std::env;
use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::error::{ErrorCode, Fault};
use crate::interpreter::Value;

pub type HostFn = fn(&[Value]) -> Result<Value, Fault>;

#[derive(Debug, Clone, Copy)]
pub struct HostFunction {
    pub name: &'static str,
    pub params_num: usize,
    pub default_count: usize,
    pub produces_value: bool,
    pub call: HostFn,
}

impl HostFunction {
    pub fn accepts(&self, count: usize) -> bool {
        (self.params_num..=self.params_num + self.default_count).contains(&count)
    }
}

#[derive(Debug, Default)]
pub struct HostModule {
    name: String,
    functions: FxHashMap<String, HostFunction>,
    constants: FxHashMap<String, Value>,
}

impl HostModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn function(mut self, function: HostFunction) -> Self {
        self.functions
            .insert(function.name.to_ascii_lowercase(), function);
        self
    }

    pub fn constant(mut self, name: &str, value: Value) -> Self {
        self.constants.insert(name.to_ascii_lowercase(), value);
        self
    }

    /// Names are matched case-insensitively.
    pub fn lookup_function(&self, name: &str) -> Option<&HostFunction> {
        self.functions.get(&name.to_ascii_lowercase())
    }

    pub fn lookup_constant(&self, name: &str) -> Option<&Value> {
        self.constants.get(&name.to_ascii_lowercase())
    }

    pub fn call(&self, name: &str, args: &[Value]) -> Result<Value, Fault> {
        let function = self.lookup_function(name).ok_or_else(|| {
            Fault::new(
                ErrorCode::IdNotFound,
                format!("host module '{}' has no function '{name}'", self.name),
            )
        })?;
        if !function.accepts(args.len()) {
            return Err(Fault::new(
                ErrorCode::WrongParamsNum,
                format!(
                    "'{name}' takes {} argument(s), {} were passed",
                    function.params_num,
                    args.len()
                ),
            ));
        }
        (function.call)(args)
    }
}

/// Root host module plus the named modules `@^` can import.
#[derive(Debug)]
pub struct HostNamespace {
    root: Rc<HostModule>,
    modules: FxHashMap<String, Rc<HostModule>>,
}

impl HostNamespace {
    pub fn new(root: HostModule) -> Self {
        Self {
            root: Rc::new(root),
            modules: FxHashMap::default(),
        }
    }

    pub fn standard() -> Self {
        let mut namespace = Self::new(root_module());
        namespace.register(math_module());
        namespace.register(text_module());
        namespace.register(env_module());
        namespace
    }

    pub fn register(&mut self, module: HostModule) {
        self.modules
            .insert(module.name().to_ascii_lowercase(), Rc::new(module));
    }

    pub fn root(&self) -> &Rc<HostModule> {
        &self.root
    }

    pub fn module(&self, name: &str) -> Option<Rc<HostModule>> {
        self.modules.get(&name.to_ascii_lowercase()).cloned()
    }
}

fn native(name: &'static str, params_num: usize, call: HostFn) -> HostFunction {
    HostFunction {
        name,
        params_num,
        default_count: 0,
        produces_value: true,
        call,
    }
}

fn number(value: &Value, function: &str) -> Result<f64, Fault> {
    match value {
        Value::Int(value) => Ok(*value as f64),
        Value::Float(value) => Ok(*value),
        other => Err(Fault::new(
            ErrorCode::ParamType,
            format!("'{function}' expects a number, got '{}'", other.type_name()),
        )),
    }
}

fn text<'v>(value: &'v Value, function: &str) -> Result<&'v str, Fault> {
    match value {
        Value::Str(text) => Ok(text),
        other => Err(Fault::new(
            ErrorCode::ParamType,
            format!("'{function}' expects a str, got '{}'", other.type_name()),
        )),
    }
}

/// Float results with no fractional part come back as ints.
fn integral(value: f64) -> Value {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        Value::Int(value as i64)
    } else {
        Value::Float(value)
    }
}

fn extreme(args: &[Value], name: &str, pick_left: fn(f64, f64) -> bool) -> Result<Value, Fault> {
    let (left, right) = (&args[0], &args[1]);
    let (a, b) = (number(left, name)?, number(right, name)?);
    Ok(if pick_left(a, b) { left } else { right }.clone())
}

fn root_module() -> HostModule {
    HostModule::new("")
        .function(native("abs", 1, |args| match &args[0] {
            Value::Int(value) => value
                .checked_abs()
                .map(Value::Int)
                .ok_or_else(|| Fault::type_error("integer overflow in 'abs'")),
            other => number(other, "abs").map(|value| Value::Float(value.abs())),
        }))
        .function(native("min", 2, |args| extreme(args, "min", |a, b| a <= b)))
        .function(native("max", 2, |args| extreme(args, "max", |a, b| a >= b)))
        .function(HostFunction {
            default_count: 1,
            ..native("round", 1, |args| {
                let value = number(&args[0], "round")?;
                match args.get(1) {
                    None => Ok(integral(value.round())),
                    Some(Value::Int(digits)) => {
                        let digits = i32::try_from(*digits).map_err(|_| {
                            Fault::new(ErrorCode::ParamType, "'round' digits out of range")
                        })?;
                        let scale = 10f64.powi(digits);
                        Ok(Value::Float((value * scale).round() / scale))
                    }
                    Some(other) => Err(Fault::new(
                        ErrorCode::ParamType,
                        format!("'round' digits must be int, got '{}'", other.type_name()),
                    )),
                }
            })
        })
}

fn math_module() -> HostModule {
    HostModule::new("math")
        .function(native("sqrt", 1, |args| {
            let value = number(&args[0], "sqrt")?;
            if value < 0.0 {
                return Err(Fault::new(ErrorCode::ParamType, "math domain error in 'sqrt'"));
            }
            Ok(Value::Float(value.sqrt()))
        }))
        .function(native("floor", 1, |args| {
            number(&args[0], "floor").map(|value| integral(value.floor()))
        }))
        .function(native("ceil", 1, |args| {
            number(&args[0], "ceil").map(|value| integral(value.ceil()))
        }))
        .function(native("pow", 2, |args| {
            Ok(Value::Float(
                number(&args[0], "pow")?.powf(number(&args[1], "pow")?),
            ))
        }))
        .constant("pi", Value::Float(std::f64::consts::PI))
        .constant("e", Value::Float(std::f64::consts::E))
}

fn text_module() -> HostModule {
    HostModule::new("text")
        .function(native("upper", 1, |args| {
            text(&args[0], "upper").map(|text| Value::Str(text.to_uppercase()))
        }))
        .function(native("lower", 1, |args| {
            text(&args[0], "lower").map(|text| Value::Str(text.to_lowercase()))
        }))
        .function(native("trim", 1, |args| {
            text(&args[0], "trim").map(|text| Value::Str(text.trim().to_string()))
        }))
        .function(native("split", 2, |args| {
            let source = text(&args[0], "split")?;
            let separator = text(&args[1], "split")?;
            if separator.is_empty() {
                return Err(Fault::new(ErrorCode::ParamType, "empty separator in 'split'"));
            }
            Ok(Value::List(
                source
                    .split(separator)
                    .map(|part| Value::Str(part.to_string()))
                    .collect(),
            ))
        }))
}

fn env_module() -> HostModule {
    HostModule::new("env").function(native("var", 1, |args| {
        let name = text(&args[0], "var")?;
        Ok(env::var(name).map_or(Value::Null, Value::Str))
    }))
}
