use std::collections::BTreeMap;
use std::io::{self, BufRead};

use rand::Rng;

use crate::error::{ErrorCode, Fault};
use crate::interpreter::{Key, Output, Value};

/// Static call contract of a built-in. The parser and analyzer only ever consult this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    pub name: &'static str,
    pub params_num: usize,
    pub default_count: usize,
    pub variadic: bool,
    pub produces_value: bool,
    pub mutates_receiver: bool,
}

impl Signature {
    const fn fixed(name: &'static str, params_num: usize) -> Self {
        Self {
            name,
            params_num,
            default_count: 0,
            variadic: false,
            produces_value: true,
            mutates_receiver: false,
        }
    }

    pub fn accepts(&self, count: usize) -> bool {
        if self.variadic {
            count >= self.params_num
        } else {
            (self.params_num..=self.params_num + self.default_count).contains(&count)
        }
    }

    pub fn describe_arity(&self) -> String {
        match (self.variadic, self.default_count) {
            (true, _) => format!("at least {}", self.params_num),
            (false, 0) => self.params_num.to_string(),
            (false, defaults) => format!("{} to {}", self.params_num, self.params_num + defaults),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinFunction {
    Print,
    Input,
    Random,
    Len,
    Str,
    Int,
    Float,
    Bool,
    Type,
    Range,
    Push,
    Pop,
    Keys,
    Read,
    Write,
}

impl BuiltinFunction {
    pub const ALL: [Self; 15] = [
        Self::Print,
        Self::Input,
        Self::Random,
        Self::Len,
        Self::Str,
        Self::Int,
        Self::Float,
        Self::Bool,
        Self::Type,
        Self::Range,
        Self::Push,
        Self::Pop,
        Self::Keys,
        Self::Read,
        Self::Write,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|builtin| builtin.signature().name.eq_ignore_ascii_case(name))
    }

    pub fn name(self) -> &'static str {
        self.signature().name
    }

    pub fn signature(self) -> Signature {
        match self {
            Self::Print => Signature {
                variadic: true,
                produces_value: false,
                ..Signature::fixed("P", 0)
            },
            Self::Input => Signature {
                default_count: 1,
                ..Signature::fixed("I", 0)
            },
            Self::Random => Signature::fixed("RND", 2),
            Self::Len => Signature::fixed("LEN", 1),
            Self::Str => Signature::fixed("STR", 1),
            Self::Int => Signature::fixed("INT", 1),
            Self::Float => Signature::fixed("FLT", 1),
            Self::Bool => Signature::fixed("BOOL", 1),
            Self::Type => Signature::fixed("TYPE", 1),
            Self::Range => Signature {
                default_count: 1,
                ..Signature::fixed("RANGE", 1)
            },
            Self::Push => Signature {
                produces_value: false,
                mutates_receiver: true,
                ..Signature::fixed("PUSH", 2)
            },
            Self::Pop => Signature {
                mutates_receiver: true,
                ..Signature::fixed("POP", 1)
            },
            Self::Keys => Signature::fixed("KEYS", 1),
            Self::Read => Signature::fixed("READ", 1),
            Self::Write => Signature {
                produces_value: false,
                ..Signature::fixed("WRITE", 2)
            },
        }
    }

    /// Runs the built-in on already evaluated arguments. Built-ins that mutate their
    /// receiver update `args[0]` in place.
    pub fn call(self, output: &mut Output, args: &mut [Value]) -> Result<Value, Fault> {
        let signature = self.signature();
        if !signature.accepts(args.len()) {
            return Err(Fault::new(
                ErrorCode::WrongParamsNum,
                format!(
                    "{} was passed, but {} were expected",
                    args.len(),
                    signature.describe_arity()
                ),
            ));
        }
        match self {
            Self::Print => {
                let line = args.iter().map(render).collect::<Vec<_>>().join(" ");
                output.write_line(line);
                Ok(Value::Null)
            }
            Self::Input => {
                if let Some(prompt) = args.first() {
                    output.prompt(&render(prompt));
                }
                let mut line = String::new();
                io::stdin()
                    .lock()
                    .read_line(&mut line)
                    .map_err(|error| Fault::new(ErrorCode::InvalidFunctionCall, error.to_string()))?;
                Ok(Value::Str(line.trim_end_matches(['\n', '\r']).to_string()))
            }
            Self::Random => {
                let low = int_param(&args[0], "RND")?;
                let high = int_param(&args[1], "RND")?;
                if low > high {
                    return Err(Fault::new(
                        ErrorCode::ParamType,
                        format!("RND range is empty: {low} > {high}"),
                    ));
                }
                Ok(Value::Int(rand::thread_rng().gen_range(low..=high)))
            }
            Self::Len => {
                let len = match &args[0] {
                    Value::Str(text) => decode_escapes(text).chars().count(),
                    Value::List(items) | Value::Tuple(items) => items.len(),
                    Value::Dict(entries) => entries.len(),
                    other => {
                        return Err(Fault::type_error(format!(
                            "object of type '{}' has no LEN",
                            other.type_name()
                        )));
                    }
                };
                i64::try_from(len)
                    .map(Value::Int)
                    .map_err(|_| Fault::type_error("length does not fit in an int"))
            }
            Self::Str => Ok(Value::Str(args[0].to_string())),
            Self::Int => to_int(&args[0]),
            Self::Float => to_float(&args[0]),
            Self::Bool => Ok(Value::Bool(args[0].is_truthy())),
            Self::Type => Ok(Value::Str(args[0].type_name().to_string())),
            Self::Range => {
                let (start, end) = match args {
                    [end] => (0, int_param(end, "RANGE")?),
                    [start, end] => (int_param(start, "RANGE")?, int_param(end, "RANGE")?),
                    _ => unreachable!("arity checked above"),
                };
                Ok(Value::List((start..end).map(Value::Int).collect()))
            }
            Self::Push => {
                let (receiver, rest) = args.split_at_mut(1);
                match &mut receiver[0] {
                    Value::List(items) => {
                        items.push(rest[0].clone());
                        Ok(Value::Null)
                    }
                    other => Err(receiver_type("PUSH", other)),
                }
            }
            Self::Pop => {
                match &mut args[0] {
                    Value::List(items) => items.pop().ok_or_else(|| {
                        Fault::new(ErrorCode::IndexOutOfRange, "POP from empty list")
                    }),
                    other => Err(receiver_type("POP", other)),
                }
            }
            Self::Keys => match &args[0] {
                Value::Dict(entries) => Ok(Value::List(keys(entries))),
                other => Err(receiver_type("KEYS", other)),
            },
            Self::Read => match &args[0] {
                Value::File(handle) => handle.read_all().map(Value::Str),
                other => Err(receiver_type("READ", other)),
            },
            Self::Write => match &args[0] {
                Value::File(handle) => {
                    handle.write_all(&render(&args[1]))?;
                    Ok(Value::Null)
                }
                other => Err(receiver_type("WRITE", other)),
            },
        }
    }
}

pub fn signature(name: &str) -> Option<Signature> {
    BuiltinFunction::from_name(name).map(BuiltinFunction::signature)
}

fn keys(entries: &BTreeMap<Key, Value>) -> Vec<Value> {
    entries.keys().map(Key::to_value).collect()
}

/// Text a value prints as. Strings have their escapes decoded here, not at lex time.
fn render(value: &Value) -> String {
    match value {
        Value::Str(text) => decode_escapes(text),
        other => other.to_string(),
    }
}

fn receiver_type(name: &str, value: &Value) -> Fault {
    Fault::new(
        ErrorCode::ParamType,
        format!("{name} cannot be applied to '{}'", value.type_name()),
    )
}

fn int_param(value: &Value, name: &str) -> Result<i64, Fault> {
    match value {
        Value::Int(value) => Ok(*value),
        other => Err(Fault::new(
            ErrorCode::ParamType,
            format!("{name} expects int arguments, got '{}'", other.type_name()),
        )),
    }
}

fn cast_error(target: &str, value: &Value) -> Fault {
    Fault::new(
        ErrorCode::ParamType,
        format!("cannot convert {} '{value}' to {target}", value.type_name()),
    )
}

fn to_int(value: &Value) -> Result<Value, Fault> {
    match value {
        Value::Int(_) => Ok(value.clone()),
        Value::Bool(flag) => Ok(Value::Int(i64::from(*flag))),
        Value::Float(float) if float.is_finite() && float.abs() < i64::MAX as f64 => {
            Ok(Value::Int(float.trunc() as i64))
        }
        Value::Str(text) => text
            .trim()
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|_| cast_error("INT", value)),
        other => Err(cast_error("INT", other)),
    }
}

fn to_float(value: &Value) -> Result<Value, Fault> {
    match value {
        Value::Float(_) => Ok(value.clone()),
        Value::Int(int) => Ok(Value::Float(*int as f64)),
        Value::Bool(flag) => Ok(Value::Float(if *flag { 1.0 } else { 0.0 })),
        Value::Str(text) => text
            .trim()
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| cast_error("FLT", value)),
        other => Err(cast_error("FLT", other)),
    }
}

/// Decodes backslash escapes. Unknown escapes are kept verbatim.
pub fn decode_escapes(raw: &str) -> String {
    let mut decoded = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            decoded.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => decoded.push('\n'),
            Some('t') => decoded.push('\t'),
            Some('r') => decoded.push('\r'),
            Some('0') => decoded.push('\0'),
            Some(c @ ('\\' | '\'' | '"' | '`' | '{' | '}')) => decoded.push(c),
            Some(other) => {
                decoded.push('\\');
                decoded.push(other);
            }
            None => decoded.push('\\'),
        }
    }
    decoded
}
