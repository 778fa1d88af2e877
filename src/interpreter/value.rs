use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::iter;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::ast::{BinaryOperator, FileMode, FunctionLiteral, MacroLiteral};
use crate::error::{ErrorCode, Fault};

use super::memory::ScopeId;

/// A function value: its literal plus the scope and file it was declared in.
#[derive(Debug)]
pub struct Closure {
    pub literal: Rc<FunctionLiteral>,
    pub scope: ScopeId,
    pub file: Rc<str>,
}

#[derive(Debug)]
pub struct MacroClosure {
    pub literal: Rc<MacroLiteral>,
    pub scope: ScopeId,
    pub file: Rc<str>,
}

/// Open file bound by an `FR`/`FW`/`FA` block. Closed when the block exits.
#[derive(Debug)]
pub struct FileHandle {
    path: PathBuf,
    mode: FileMode,
    file: RefCell<Option<File>>,
}

impl FileHandle {
    pub fn open(path: PathBuf, mode: FileMode) -> io::Result<Self> {
        let file = match mode {
            FileMode::Read => File::open(&path)?,
            FileMode::Write => File::create(&path)?,
            FileMode::Append => OpenOptions::new().append(true).create(true).open(&path)?,
        };
        Ok(Self {
            path,
            mode,
            file: RefCell::new(Some(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> FileMode {
        self.mode
    }

    pub fn is_open(&self) -> bool {
        self.file.borrow().is_some()
    }

    pub fn close(&self) {
        self.file.borrow_mut().take();
    }

    pub fn read_all(&self) -> Result<String, Fault> {
        if self.mode != FileMode::Read {
            return Err(Fault::new(
                ErrorCode::InvalidFunctionCall,
                format!("'{}' was not opened for reading", self.path.display()),
            ));
        }
        let mut file = self.file.borrow_mut();
        let file = file.as_mut().ok_or_else(|| self.closed())?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|error| self.io_fault(error))?;
        Ok(contents)
    }

    pub fn write_all(&self, text: &str) -> Result<(), Fault> {
        if self.mode == FileMode::Read {
            return Err(Fault::new(
                ErrorCode::InvalidFunctionCall,
                format!("'{}' was opened for reading", self.path.display()),
            ));
        }
        let mut file = self.file.borrow_mut();
        let file = file.as_mut().ok_or_else(|| self.closed())?;
        file.write_all(text.as_bytes())
            .map_err(|error| self.io_fault(error))
    }

    fn closed(&self) -> Fault {
        Fault::new(
            ErrorCode::InvalidFunctionCall,
            format!("'{}' is closed", self.path.display()),
        )
    }

    fn io_fault(&self, error: io::Error) -> Fault {
        Fault::new(
            ErrorCode::InvalidFunctionCall,
            format!("{}: {error}", self.path.display()),
        )
    }
}

/// Dictionary key. Only hashable values (no floats, lists or dicts) can be keys.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Key {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
    Tuple(Vec<Key>),
}

impl Key {
    pub fn from_value(value: &Value) -> Result<Self, Fault> {
        match value {
            Value::Null => Ok(Self::Null),
            Value::Bool(value) => Ok(Self::Bool(*value)),
            Value::Int(value) => Ok(Self::Int(*value)),
            Value::Str(value) => Ok(Self::Str(value.clone())),
            Value::Tuple(items) => items
                .iter()
                .map(Key::from_value)
                .collect::<Result<_, _>>()
                .map(Self::Tuple),
            other => Err(Fault::type_error(format!(
                "unhashable type: '{}'",
                other.type_name()
            ))),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(value) => Value::Bool(*value),
            Self::Int(value) => Value::Int(*value),
            Self::Str(value) => Value::Str(value.clone()),
            Self::Tuple(items) => Value::Tuple(items.iter().map(Key::to_value).collect()),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    Dict(BTreeMap<Key, Value>),
    Function(Rc<Closure>),
    Macro(Rc<MacroClosure>),
    File(Rc<FileHandle>),
}

#[derive(Clone, Copy)]
enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    fn as_f64(self) -> f64 {
        match self {
            Self::Int(value) => value as f64,
            Self::Float(value) => value,
        }
    }
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Bool(_) => "bool",
            Self::Str(_) => "str",
            Self::List(_) => "list",
            Self::Tuple(_) => "tuple",
            Self::Dict(_) => "dict",
            Self::Function(_) => "function",
            Self::Macro(_) => "macro",
            Self::File(_) => "file",
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Int(value) => *value != 0,
            Self::Float(value) => *value != 0.0,
            Self::Bool(value) => *value,
            Self::Str(value) => !value.is_empty(),
            Self::List(items) | Self::Tuple(items) => !items.is_empty(),
            Self::Dict(entries) => !entries.is_empty(),
            Self::Function(_) | Self::Macro(_) | Self::File(_) => true,
        }
    }

    fn number(&self) -> Option<Number> {
        match self {
            Self::Int(value) => Some(Number::Int(*value)),
            Self::Float(value) => Some(Number::Float(*value)),
            _ => None,
        }
    }

    pub fn binary(&self, op: BinaryOperator, other: &Value) -> Result<Value, Fault> {
        match op {
            BinaryOperator::Add => self.add(other),
            BinaryOperator::Sub => self.sub(other),
            BinaryOperator::Mul => self.mul(other),
            BinaryOperator::Expo => self.expo(other),
            BinaryOperator::IntDiv => self.int_div(other),
            BinaryOperator::FloatDiv => self.float_div(other),
            BinaryOperator::Mod => self.modulo(other),
            BinaryOperator::Eq => Ok(Value::Bool(self == other)),
            BinaryOperator::Ne => Ok(Value::Bool(self != other)),
            BinaryOperator::Lt => self.compare(op, other, Ordering::is_lt),
            BinaryOperator::Gt => self.compare(op, other, Ordering::is_gt),
            BinaryOperator::Le => self.compare(op, other, Ordering::is_le),
            BinaryOperator::Ge => self.compare(op, other, Ordering::is_ge),
            BinaryOperator::And => Ok(Value::Bool(self.is_truthy() && other.is_truthy())),
            BinaryOperator::Or => Ok(Value::Bool(self.is_truthy() || other.is_truthy())),
        }
    }

    pub fn add(&self, other: &Value) -> Result<Value, Fault> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a
                .checked_add(*b)
                .map(Value::Int)
                .ok_or_else(|| overflow(BinaryOperator::Add)),
            (Self::Str(a), Self::Str(b)) => Ok(Value::Str(format!("{a}{b}"))),
            (Self::List(a), Self::List(b)) => Ok(Value::List([a.as_slice(), b].concat())),
            (Self::Tuple(a), Self::Tuple(b)) => Ok(Value::Tuple([a.as_slice(), b].concat())),
            _ => self.float_op(BinaryOperator::Add, other, |a, b| a + b),
        }
    }

    pub fn sub(&self, other: &Value) -> Result<Value, Fault> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a
                .checked_sub(*b)
                .map(Value::Int)
                .ok_or_else(|| overflow(BinaryOperator::Sub)),
            _ => self.float_op(BinaryOperator::Sub, other, |a, b| a - b),
        }
    }

    fn mul(&self, other: &Value) -> Result<Value, Fault> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a
                .checked_mul(*b)
                .map(Value::Int)
                .ok_or_else(|| overflow(BinaryOperator::Mul)),
            (Self::Str(text), Self::Int(n)) | (Self::Int(n), Self::Str(text)) => {
                Ok(Value::Str(text.repeat(repeat_count(*n))))
            }
            (Self::List(items), Self::Int(n)) | (Self::Int(n), Self::List(items)) => {
                Ok(Value::List(
                    iter::repeat_n(items.iter().cloned(), repeat_count(*n))
                        .flatten()
                        .collect(),
                ))
            }
            _ => self.float_op(BinaryOperator::Mul, other, |a, b| a * b),
        }
    }

    fn expo(&self, other: &Value) -> Result<Value, Fault> {
        match (self, other) {
            (Self::Int(base), Self::Int(exp)) if *exp >= 0 => u32::try_from(*exp)
                .ok()
                .and_then(|exp| base.checked_pow(exp))
                .map(Value::Int)
                .ok_or_else(|| overflow(BinaryOperator::Expo)),
            _ => self.float_op(BinaryOperator::Expo, other, f64::powf),
        }
    }

    fn int_div(&self, other: &Value) -> Result<Value, Fault> {
        self.check_divisor(BinaryOperator::IntDiv, other)?;
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => floor_div(*a, *b)
                .map(Value::Int)
                .ok_or_else(|| overflow(BinaryOperator::IntDiv)),
            _ => self.float_op(BinaryOperator::IntDiv, other, |a, b| (a / b).floor()),
        }
    }

    fn float_div(&self, other: &Value) -> Result<Value, Fault> {
        self.check_divisor(BinaryOperator::FloatDiv, other)?;
        self.float_op(BinaryOperator::FloatDiv, other, |a, b| a / b)
    }

    fn modulo(&self, other: &Value) -> Result<Value, Fault> {
        self.check_divisor(BinaryOperator::Mod, other)?;
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => {
                let rem = a.checked_rem(*b).ok_or_else(|| overflow(BinaryOperator::Mod))?;
                // Result takes the divisor's sign.
                if rem != 0 && (rem < 0) != (*b < 0) {
                    Ok(Value::Int(rem + b))
                } else {
                    Ok(Value::Int(rem))
                }
            }
            _ => self.float_op(BinaryOperator::Mod, other, |a, b| a - b * (a / b).floor()),
        }
    }

    fn check_divisor(&self, op: BinaryOperator, other: &Value) -> Result<(), Fault> {
        match other.number() {
            Some(divisor) if divisor.as_f64() == 0.0 && self.number().is_some() => Err(
                Fault::type_error(format!("division by zero in '{}'", op.spelling())),
            ),
            _ => Ok(()),
        }
    }

    fn float_op(
        &self,
        op: BinaryOperator,
        other: &Value,
        apply: impl Fn(f64, f64) -> f64,
    ) -> Result<Value, Fault> {
        match (self.number(), other.number()) {
            (Some(a), Some(b)) => Ok(Value::Float(apply(a.as_f64(), b.as_f64()))),
            _ => Err(unsupported(op, self, other)),
        }
    }

    fn compare(
        &self,
        op: BinaryOperator,
        other: &Value,
        accept: fn(Ordering) -> bool,
    ) -> Result<Value, Fault> {
        let ordering = match (self, other) {
            (Self::Str(a), Self::Str(b)) => Some(a.cmp(b)),
            (Self::Int(a), Self::Int(b)) => Some(a.cmp(b)),
            _ => match (self.number(), other.number()) {
                (Some(a), Some(b)) => a.as_f64().partial_cmp(&b.as_f64()),
                _ => return Err(unsupported(op, self, other)),
            },
        };
        // NaN compares false under every ordering.
        Ok(Value::Bool(ordering.is_some_and(accept)))
    }

    pub fn negate(&self) -> Result<Value, Fault> {
        match self {
            Self::Int(value) => value
                .checked_neg()
                .map(Value::Int)
                .ok_or_else(|| Fault::type_error("integer overflow in unary '-'")),
            Self::Float(value) => Ok(Value::Float(-value)),
            other => Err(Fault::type_error(format!(
                "bad operand type for unary '-': '{}'",
                other.type_name()
            ))),
        }
    }

    pub fn positive(&self) -> Result<Value, Fault> {
        match self {
            Self::Int(_) | Self::Float(_) => Ok(self.clone()),
            other => Err(Fault::type_error(format!(
                "bad operand type for unary '+': '{}'",
                other.type_name()
            ))),
        }
    }

    pub fn index(&self, index: &Value) -> Result<Value, Fault> {
        match self {
            Self::List(items) | Self::Tuple(items) => {
                let position = position(self, index, items.len())?;
                Ok(items[position].clone())
            }
            Self::Str(text) => {
                let chars: Vec<char> = text.chars().collect();
                let position = position(self, index, chars.len())?;
                Ok(Value::Str(chars[position].to_string()))
            }
            Self::Dict(entries) => {
                let key = Key::from_value(index)?;
                entries.get(&key).cloned().ok_or_else(|| missing_key(index))
            }
            other => Err(Fault::new(
                ErrorCode::InvalidIndexer,
                format!("'{}' object is not subscriptable", other.type_name()),
            )),
        }
    }

    /// Mutable access to one element, used by indexed set-statements.
    /// Assigning to a missing dict key inserts it.
    pub fn element_mut(&mut self, index: &Value) -> Result<&mut Value, Fault> {
        let type_name = self.type_name();
        match self {
            Self::List(items) => {
                let position = position_of(type_name, index, items.len())?;
                Ok(&mut items[position])
            }
            Self::Dict(entries) => {
                let key = Key::from_value(index)?;
                Ok(entries.entry(key).or_insert(Value::Null))
            }
            _ => Err(Fault::new(
                ErrorCode::InvalidIndexer,
                format!("'{type_name}' object does not support item assignment"),
            )),
        }
    }

    /// Elements a for-loop walks: list and tuple items, string characters, dict keys.
    pub fn iter_items(&self) -> Result<Vec<Value>, Fault> {
        match self {
            Self::List(items) | Self::Tuple(items) => Ok(items.clone()),
            Self::Str(text) => Ok(text.chars().map(|c| Value::Str(c.to_string())).collect()),
            Self::Dict(entries) => Ok(entries.keys().map(Key::to_value).collect()),
            other => Err(Fault::type_error(format!(
                "'{}' object is not iterable",
                other.type_name()
            ))),
        }
    }

    fn repr(&self) -> String {
        match self {
            Self::Str(text) => format!("'{text}'"),
            other => other.to_string(),
        }
    }
}

fn repeat_count(n: i64) -> usize {
    usize::try_from(n).unwrap_or(0)
}

fn floor_div(a: i64, b: i64) -> Option<i64> {
    let quotient = a.checked_div(b)?;
    if a % b != 0 && ((a < 0) != (b < 0)) {
        quotient.checked_sub(1)
    } else {
        Some(quotient)
    }
}

fn position(value: &Value, index: &Value, len: usize) -> Result<usize, Fault> {
    position_of(value.type_name(), index, len)
}

fn position_of(type_name: &str, index: &Value, len: usize) -> Result<usize, Fault> {
    let Value::Int(raw) = index else {
        return Err(Fault::type_error(format!(
            "{type_name} indices must be integers, not '{}'",
            index.type_name()
        )));
    };
    let resolved = if *raw < 0 {
        i64::try_from(len).ok().and_then(|len| len.checked_add(*raw))
    } else {
        Some(*raw)
    };
    resolved
        .and_then(|position| usize::try_from(position).ok())
        .filter(|position| *position < len)
        .ok_or_else(|| {
            Fault::new(
                ErrorCode::IndexOutOfRange,
                format!("{type_name} index {raw} out of range for length {len}"),
            )
        })
}

fn missing_key(index: &Value) -> Fault {
    Fault::new(
        ErrorCode::IndexOutOfRange,
        format!("key {} not found", index.repr()),
    )
}

fn overflow(op: BinaryOperator) -> Fault {
    Fault::type_error(format!("integer overflow in '{}'", op.spelling()))
}

fn unsupported(op: BinaryOperator, left: &Value, right: &Value) -> Fault {
    Fault::type_error(format!(
        "unsupported operand types for '{}': '{}' and '{}'",
        op.spelling(),
        left.type_name(),
        right.type_name()
    ))
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::List(a), Self::List(b)) | (Self::Tuple(a), Self::Tuple(b)) => a == b,
            (Self::Dict(a), Self::Dict(b)) => a == b,
            (Self::Function(a), Self::Function(b)) => Rc::ptr_eq(a, b),
            (Self::Macro(a), Self::Macro(b)) => Rc::ptr_eq(a, b),
            (Self::File(a), Self::File(b)) => Rc::ptr_eq(a, b),
            _ => match (self.number(), other.number()) {
                (Some(a), Some(b)) => a.as_f64() == b.as_f64(),
                _ => false,
            },
        }
    }
}

fn join(items: impl Iterator<Item = String>) -> String {
    items.collect::<Vec<_>>().join(", ")
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("X"),
            Self::Int(value) => write!(f, "{value}"),
            Self::Float(value) if value.is_finite() && value.fract() == 0.0 => {
                write!(f, "{value:.1}")
            }
            Self::Float(value) => write!(f, "{value}"),
            Self::Bool(true) => f.write_str("T"),
            Self::Bool(false) => f.write_str("F"),
            Self::Str(text) => f.write_str(text),
            Self::List(items) => write!(f, "[{}]", join(items.iter().map(Value::repr))),
            Self::Tuple(items) if items.len() == 1 => write!(f, "({},)", items[0].repr()),
            Self::Tuple(items) => write!(f, "({})", join(items.iter().map(Value::repr))),
            Self::Dict(entries) => write!(
                f,
                "{{{}}}",
                join(
                    entries
                        .iter()
                        .map(|(key, value)| format!("{}: {}", key.to_value().repr(), value.repr()))
                )
            ),
            Self::Function(closure) => write!(f, "<function/{}>", closure.literal.params_num),
            Self::Macro(closure) => write!(f, "<macro/{}>", closure.literal.params_num),
            Self::File(handle) => write!(f, "<file '{}'>", handle.path().display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn list(values: &[i64]) -> Value {
        Value::List(values.iter().copied().map(Value::Int).collect())
    }

    #[test]
    fn integer_arithmetic_stays_integral_except_true_division() {
        let seven = Value::Int(7);
        let two = Value::Int(2);
        assert_eq!(seven.binary(BinaryOperator::Add, &two), Ok(Value::Int(9)));
        assert_eq!(seven.binary(BinaryOperator::IntDiv, &two), Ok(Value::Int(3)));
        assert_eq!(seven.binary(BinaryOperator::FloatDiv, &two), Ok(Value::Float(3.5)));
        assert_eq!(seven.binary(BinaryOperator::Expo, &two), Ok(Value::Int(49)));
        assert_eq!(
            Value::Int(-7).binary(BinaryOperator::IntDiv, &two),
            Ok(Value::Int(-4))
        );
        assert_eq!(Value::Int(-7).binary(BinaryOperator::Mod, &two), Ok(Value::Int(1)));
    }

    #[test]
    fn mixed_operands_promote_to_float() {
        assert_eq!(
            Value::Int(1).binary(BinaryOperator::Add, &Value::Float(0.5)),
            Ok(Value::Float(1.5))
        );
        assert_eq!(Value::Int(2), Value::Float(2.0));
    }

    #[test]
    fn sequences_concatenate_and_repeat() {
        assert_eq!(
            Value::Str("ab".into()).binary(BinaryOperator::Mul, &Value::Int(2)),
            Ok(Value::Str("abab".into()))
        );
        assert_eq!(
            list(&[1]).binary(BinaryOperator::Add, &list(&[2, 3])),
            Ok(list(&[1, 2, 3]))
        );
        assert_eq!(
            list(&[1, 2]).binary(BinaryOperator::Mul, &Value::Int(2)),
            Ok(list(&[1, 2, 1, 2]))
        );
        assert_eq!(
            Value::Int(2).binary(BinaryOperator::Mul, &list(&[1, 2])),
            Ok(list(&[1, 2, 1, 2]))
        );
        assert_eq!(
            list(&[1]).binary(BinaryOperator::Mul, &Value::Int(-1)),
            Ok(list(&[]))
        );
    }

    #[test]
    fn incompatible_operands_are_type_errors() {
        let fault = Value::Int(1)
            .add(&Value::Str("a".into()))
            .expect_err("expected type error");
        assert_eq!(fault.code, ErrorCode::TypeError);
        assert_eq!(
            fault.detail,
            "unsupported operand types for '+': 'int' and 'str'"
        );
    }

    #[test]
    fn division_by_zero_and_overflow_are_type_errors() {
        let zero = Value::Int(0);
        for op in [BinaryOperator::IntDiv, BinaryOperator::FloatDiv, BinaryOperator::Mod] {
            let fault = Value::Int(1).binary(op, &zero).expect_err("division by zero");
            assert_eq!(fault.code, ErrorCode::TypeError);
        }
        let fault = Value::Int(i64::MAX)
            .add(&Value::Int(1))
            .expect_err("overflow");
        assert_eq!(fault.code, ErrorCode::TypeError);
    }

    #[test]
    fn negative_indexes_count_from_the_end() {
        let items = list(&[10, 20, 30]);
        assert_eq!(items.index(&Value::Int(-1)), Ok(Value::Int(30)));
        let fault = items.index(&Value::Int(3)).expect_err("out of range");
        assert_eq!(fault.code, ErrorCode::IndexOutOfRange);
    }

    #[test]
    fn missing_dict_keys_share_the_out_of_range_code() {
        let dict = Value::Dict(BTreeMap::from([(Key::Int(1), Value::Int(2))]));
        assert_eq!(dict.index(&Value::Int(1)), Ok(Value::Int(2)));
        let fault = dict.index(&Value::Str("a".into())).expect_err("missing key");
        assert_eq!(fault.code, ErrorCode::IndexOutOfRange);
        assert_eq!(fault.detail, "key 'a' not found");
    }

    #[test]
    fn renders_values_for_output() {
        let dict = Value::Dict(BTreeMap::from([(Key::Str("k".into()), Value::Float(2.0))]));
        assert_eq!(dict.to_string(), "{'k': 2.0}");
        assert_eq!(Value::Tuple(vec![Value::Bool(true)]).to_string(), "(T,)");
        assert_eq!(Value::Null.to_string(), "X");
    }

    #[test]
    fn write_is_rejected_on_read_handles() {
        let path = std::env::temp_dir().join("quill-value-handle.txt");
        fs::write(&path, "data").expect("seed file");
        let handle = FileHandle::open(path.clone(), FileMode::Read).expect("open");
        assert_eq!(handle.read_all(), Ok("data".to_string()));
        let fault = handle.write_all("x").expect_err("write on read handle");
        assert_eq!(fault.code, ErrorCode::InvalidFunctionCall);
        handle.close();
        assert!(!handle.is_open());
        let _ = fs::remove_file(&path);
    }
}
