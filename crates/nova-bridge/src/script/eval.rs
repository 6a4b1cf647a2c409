use std::cmp::Ordering;

use crate::provider::CallbackError;
use crate::value::{format_number, HostValue};

use super::globals::{arg, number_arg, Global, HostGlobals};
use super::parser::{BinaryOp, Body, Expr, Function, LogicalOp, Stmt, UnaryOp};

/// Longest string a callback may build, in bytes; mirrors the engine limit of `2^29 - 24`.
pub(crate) const MAX_STRING_LEN: usize = (1 << 29) - 24;

enum Flow {
    Normal,
    Return(HostValue),
}

pub(crate) fn call_function(
    function: &Function,
    globals: &HostGlobals,
    args: &[HostValue],
) -> Result<HostValue, CallbackError> {
    let mut locals = vec![HostValue::Undefined; function.locals];
    for (slot, value) in locals.iter_mut().zip(args.iter().take(function.params)) {
        *slot = value.clone();
    }
    let mut frame = Frame { locals, globals };
    match &function.body {
        Body::Expr(expr) => frame.eval(expr),
        Body::Block(stmts) => match frame.exec(stmts)? {
            Flow::Return(value) => Ok(value),
            Flow::Normal => Ok(HostValue::Undefined),
        },
    }
}

struct Frame<'g> {
    locals: Vec<HostValue>,
    globals: &'g HostGlobals,
}

impl Frame<'_> {
    fn exec(&mut self, stmts: &[Stmt]) -> Result<Flow, CallbackError> {
        for stmt in stmts {
            match stmt {
                Stmt::Expr(expr) => {
                    self.eval(expr)?;
                }
                Stmt::Let(slot, init) => {
                    let value = self.eval(init)?;
                    if let Some(local) = self.locals.get_mut(*slot) {
                        *local = value;
                    }
                }
                Stmt::Return(value) => {
                    let value = match value {
                        Some(expr) => self.eval(expr)?,
                        None => HostValue::Undefined,
                    };
                    return Ok(Flow::Return(value));
                }
                Stmt::If(cond, then, otherwise) => {
                    let branch = if self.eval(cond)?.truthy() { then } else { otherwise };
                    if let Flow::Return(value) = self.exec(branch)? {
                        return Ok(Flow::Return(value));
                    }
                }
            }
        }
        Ok(Flow::Normal)
    }

    fn eval(&mut self, expr: &Expr) -> Result<HostValue, CallbackError> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Local(slot) => Ok(self.locals.get(*slot).cloned().unwrap_or(HostValue::Undefined)),
            Expr::Global(path) => match self.globals.get(path) {
                Some(Global::Value(value)) => Ok(value.clone()),
                Some(Global::Function(_)) => Err(CallbackError::type_error(format!(
                    "{path} is a host function and can only be called"
                ))),
                None => Err(CallbackError::type_error(format!("{path} is not a value"))),
            },
            Expr::Unary(op, operand) => {
                let value = self.eval(operand)?;
                unary(*op, value)
            }
            Expr::Binary(op, lhs, rhs) => {
                let lhs = self.eval(lhs)?;
                let rhs = self.eval(rhs)?;
                binary(*op, &lhs, &rhs)
            }
            Expr::Logical(op, lhs, rhs) => {
                let lhs = self.eval(lhs)?;
                let short_circuit = match op {
                    LogicalOp::And => !lhs.truthy(),
                    LogicalOp::Or => lhs.truthy(),
                    LogicalOp::Nullish => !lhs.is_nullish(),
                };
                if short_circuit {
                    Ok(lhs)
                } else {
                    self.eval(rhs)
                }
            }
            Expr::Conditional(cond, then, otherwise) => {
                if self.eval(cond)?.truthy() {
                    self.eval(then)
                } else {
                    self.eval(otherwise)
                }
            }
            Expr::Member {
                object,
                property,
                optional,
            } => {
                let object = self.eval(object)?;
                if *optional && object.is_nullish() {
                    return Ok(HostValue::Undefined);
                }
                get_property(&object, property)
            }
            Expr::Index(object, index) => {
                let object = self.eval(object)?;
                let index = self.eval(index)?;
                get_index(&object, &index)
            }
            Expr::Call(callee, args) => self.call(callee, args),
        }
    }

    fn call(&mut self, callee: &Expr, args: &[Expr]) -> Result<HostValue, CallbackError> {
        match callee {
            Expr::Global(path) => {
                let args = self.eval_args(args)?;
                match self.globals.get(path) {
                    Some(Global::Function(function)) => function(&args),
                    _ => Err(CallbackError::type_error(format!("{path} is not a function"))),
                }
            }
            Expr::Member {
                object,
                property,
                optional,
            } => {
                let receiver = self.eval(object)?;
                if *optional && receiver.is_nullish() {
                    return Ok(HostValue::Undefined);
                }
                let args = self.eval_args(args)?;
                call_method(&receiver, property, &args)
            }
            _ => Err(CallbackError::type_error("expression is not a function")),
        }
    }

    fn eval_args(&mut self, args: &[Expr]) -> Result<Vec<HostValue>, CallbackError> {
        args.iter().map(|arg| self.eval(arg)).collect()
    }
}

fn unary(op: UnaryOp, value: HostValue) -> Result<HostValue, CallbackError> {
    Ok(match op {
        UnaryOp::Not => HostValue::Bool(!value.truthy()),
        UnaryOp::TypeOf => HostValue::String(value.type_of().to_owned()),
        UnaryOp::Void => HostValue::Undefined,
        UnaryOp::Neg => match value {
            HostValue::BigInt(n) => HostValue::BigInt(n.checked_neg().ok_or_else(bigint_overflow)?),
            other => HostValue::Number(-other.to_number()),
        },
        UnaryOp::Plus => HostValue::Number(number_arg(std::slice::from_ref(&value), 0)?),
    })
}

fn binary(op: BinaryOp, lhs: &HostValue, rhs: &HostValue) -> Result<HostValue, CallbackError> {
    match op {
        BinaryOp::Add if is_stringy(lhs) || is_stringy(rhs) => {
            let (lhs, rhs) = (lhs.to_js_string(), rhs.to_js_string());
            string_len(lhs.len().checked_add(rhs.len()))?;
            Ok(HostValue::String(lhs + &rhs))
        }
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
            arithmetic(op, lhs, rhs)
        }
        BinaryOp::Eq => Ok(HostValue::Bool(loose_eq(lhs, rhs))),
        BinaryOp::NotEq => Ok(HostValue::Bool(!loose_eq(lhs, rhs))),
        BinaryOp::StrictEq => Ok(HostValue::Bool(strict_eq(lhs, rhs))),
        BinaryOp::StrictNotEq => Ok(HostValue::Bool(!strict_eq(lhs, rhs))),
        BinaryOp::Lt => Ok(HostValue::Bool(compare(lhs, rhs) == Some(Ordering::Less))),
        BinaryOp::Gt => Ok(HostValue::Bool(compare(lhs, rhs) == Some(Ordering::Greater))),
        BinaryOp::LtEq => Ok(HostValue::Bool(matches!(
            compare(lhs, rhs),
            Some(Ordering::Less | Ordering::Equal)
        ))),
        BinaryOp::GtEq => Ok(HostValue::Bool(matches!(
            compare(lhs, rhs),
            Some(Ordering::Greater | Ordering::Equal)
        ))),
    }
}

/// Operands that `+` turns into string concatenation.
fn is_stringy(value: &HostValue) -> bool {
    !matches!(
        value,
        HostValue::Undefined
            | HostValue::Null
            | HostValue::Bool(_)
            | HostValue::Number(_)
            | HostValue::BigInt(_)
    )
}

fn arithmetic(op: BinaryOp, lhs: &HostValue, rhs: &HostValue) -> Result<HostValue, CallbackError> {
    match (lhs, rhs) {
        (HostValue::BigInt(a), HostValue::BigInt(b)) => {
            let (a, b) = (*a, *b);
            let result = match op {
                BinaryOp::Add => a.checked_add(b),
                BinaryOp::Sub => a.checked_sub(b),
                BinaryOp::Mul => a.checked_mul(b),
                BinaryOp::Div | BinaryOp::Rem if b == 0 => {
                    return Err(CallbackError::new("RangeError: Division by zero"));
                }
                BinaryOp::Div => a.checked_div(b),
                BinaryOp::Rem => a.checked_rem(b),
                _ => None,
            };
            result.map(HostValue::BigInt).ok_or_else(bigint_overflow)
        }
        (HostValue::BigInt(_), _) | (_, HostValue::BigInt(_)) => Err(CallbackError::type_error(
            "Cannot mix BigInt and other types, use explicit conversions",
        )),
        _ => {
            let (a, b) = (lhs.to_number(), rhs.to_number());
            Ok(HostValue::Number(match op {
                BinaryOp::Add => a + b,
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                BinaryOp::Div => a / b,
                _ => a % b,
            }))
        }
    }
}

fn bigint_overflow() -> CallbackError {
    CallbackError::new("RangeError: BigInt result exceeds 64 bits")
}

fn strict_eq(lhs: &HostValue, rhs: &HostValue) -> bool {
    match (lhs, rhs) {
        (HostValue::Undefined, HostValue::Undefined) | (HostValue::Null, HostValue::Null) => true,
        (HostValue::Bool(a), HostValue::Bool(b)) => a == b,
        (HostValue::Number(a), HostValue::Number(b)) => a == b,
        (HostValue::BigInt(a), HostValue::BigInt(b)) => a == b,
        (HostValue::String(a), HostValue::String(b)) => a == b,
        (HostValue::Object(a), HostValue::Object(b)) => a.ptr_eq(b),
        // Arrays are copied across the boundary, so two of them never share identity.
        _ => false,
    }
}

fn loose_eq(lhs: &HostValue, rhs: &HostValue) -> bool {
    match (lhs, rhs) {
        (a, b) if a.is_nullish() || b.is_nullish() => a.is_nullish() && b.is_nullish(),
        (HostValue::Bool(b), other) | (other, HostValue::Bool(b)) => {
            loose_eq(&HostValue::Number(f64::from(u8::from(*b))), other)
        }
        (HostValue::Number(n), HostValue::String(s)) | (HostValue::String(s), HostValue::Number(n)) => {
            *n == HostValue::String(s.clone()).to_number()
        }
        (HostValue::BigInt(i), HostValue::Number(n)) | (HostValue::Number(n), HostValue::BigInt(i)) => {
            n.fract() == 0.0 && *i as f64 == *n
        }
        (HostValue::BigInt(i), HostValue::String(s)) | (HostValue::String(s), HostValue::BigInt(i)) => {
            s.trim().parse::<i64>() == Ok(*i)
        }
        (a, b) if is_object(a) != is_object(b) => loose_eq(&primitive(a), &primitive(b)),
        _ => strict_eq(lhs, rhs),
    }
}

fn is_object(value: &HostValue) -> bool {
    is_stringy(value) && !matches!(value, HostValue::String(_))
}

/// Objects and arrays compared against primitives go through their string form.
fn primitive(value: &HostValue) -> HostValue {
    if is_object(value) {
        HostValue::String(value.to_js_string())
    } else {
        value.clone()
    }
}

fn compare(lhs: &HostValue, rhs: &HostValue) -> Option<Ordering> {
    match (lhs, rhs) {
        (HostValue::String(a), HostValue::String(b)) => Some(a.encode_utf16().cmp(b.encode_utf16())),
        (HostValue::BigInt(a), HostValue::BigInt(b)) => Some(a.cmp(b)),
        (HostValue::BigInt(a), other) => (*a as f64).partial_cmp(&other.to_number()),
        (other, HostValue::BigInt(b)) => other.to_number().partial_cmp(&(*b as f64)),
        _ => lhs.to_number().partial_cmp(&rhs.to_number()),
    }
}

fn get_property(object: &HostValue, property: &str) -> Result<HostValue, CallbackError> {
    if object.is_nullish() {
        return Err(CallbackError::type_error(format!(
            "Cannot read properties of {} (reading '{property}')",
            object.to_js_string()
        )));
    }
    if property == "length" {
        if let Some(len) = object.length() {
            return Ok(HostValue::Number(len as f64));
        }
    }
    if let HostValue::Object(host) = object {
        if let Some(fields) = host.properties() {
            return Ok(fields.get(property).cloned().unwrap_or(HostValue::Undefined));
        }
    }
    Ok(HostValue::Undefined)
}

fn get_index(object: &HostValue, index: &HostValue) -> Result<HostValue, CallbackError> {
    if object.is_nullish() {
        return Err(CallbackError::type_error(format!(
            "Cannot read properties of {} (reading '{}')",
            object.to_js_string(),
            index.to_js_string()
        )));
    }
    let position = match index {
        HostValue::Number(n) if *n >= 0.0 && n.fract() == 0.0 => Some(*n as usize),
        HostValue::String(s) => s.parse::<usize>().ok(),
        _ => None,
    };
    if let Some(i) = position {
        let element = match object {
            HostValue::String(s) => s
                .encode_utf16()
                .nth(i)
                .map(|unit| HostValue::String(String::from_utf16_lossy(&[unit]))),
            HostValue::Float32Array(items) => items.get(i).map(|v| HostValue::Number(f64::from(*v))),
            HostValue::Float64Array(items) => items.get(i).map(|v| HostValue::Number(*v)),
            HostValue::Uint32Array(items) => items.get(i).map(|v| HostValue::Number(f64::from(*v))),
            HostValue::Bytes(bytes) => bytes.get(i).map(|v| HostValue::Number(f64::from(*v))),
            _ => None,
        };
        if let Some(element) = element {
            return Ok(element);
        }
    }
    get_property(object, &index.to_js_string())
}

fn call_method(receiver: &HostValue, method: &str, args: &[HostValue]) -> Result<HostValue, CallbackError> {
    match receiver {
        HostValue::String(s) => string_method(s, method, args),
        HostValue::Number(n) => match method {
            "toString" => {
                let radix = match arg(args, 0) {
                    HostValue::Undefined => 10,
                    other => other.to_number() as u32,
                };
                number_to_string(*n, radix).map(HostValue::String)
            }
            "toFixed" => {
                let digits = arg(args, 0).to_number();
                if !(0.0..=100.0).contains(&digits) {
                    return Err(CallbackError::new(
                        "RangeError: toFixed() digits argument must be between 0 and 100",
                    ));
                }
                if !n.is_finite() {
                    return Ok(HostValue::String(format_number(*n)));
                }
                Ok(HostValue::String(format!("{:.*}", digits as usize, n)))
            }
            _ => Err(not_a_function(receiver, method)),
        },
        HostValue::Float32Array(_) | HostValue::Float64Array(_) | HostValue::Uint32Array(_) => {
            match method {
                "toString" => Ok(HostValue::String(receiver.to_js_string())),
                "join" => {
                    let separator = match arg(args, 0) {
                        HostValue::Undefined => ",".to_owned(),
                        other => other.to_js_string(),
                    };
                    let joined = receiver.to_js_string().split(',').collect::<Vec<_>>().join(&separator);
                    Ok(HostValue::String(joined))
                }
                _ => Err(not_a_function(receiver, method)),
            }
        }
        HostValue::Bool(_) | HostValue::BigInt(_) if method == "toString" => {
            Ok(HostValue::String(receiver.to_js_string()))
        }
        _ if receiver.is_nullish() => Err(CallbackError::type_error(format!(
            "Cannot read properties of {} (reading '{method}')",
            receiver.to_js_string()
        ))),
        _ => Err(not_a_function(receiver, method)),
    }
}

/// Rejects string results over [`MAX_STRING_LEN`] before they are allocated.
fn string_len(len: Option<usize>) -> Result<usize, CallbackError> {
    len.filter(|len| *len <= MAX_STRING_LEN)
        .ok_or_else(|| CallbackError::new("RangeError: Invalid string length"))
}

fn not_a_function(receiver: &HostValue, method: &str) -> CallbackError {
    CallbackError::type_error(format!("{}.{method} is not a function", receiver.type_of()))
}

fn string_method(s: &str, method: &str, args: &[HostValue]) -> Result<HostValue, CallbackError> {
    let text_arg = |index: usize| arg(args, index).to_js_string();
    Ok(match method {
        "toString" | "valueOf" => HostValue::String(s.to_owned()),
        "toUpperCase" => HostValue::String(s.to_uppercase()),
        "toLowerCase" => HostValue::String(s.to_lowercase()),
        "trim" => HostValue::String(s.trim().to_owned()),
        "trimStart" => HostValue::String(s.trim_start().to_owned()),
        "trimEnd" => HostValue::String(s.trim_end().to_owned()),
        "includes" => HostValue::Bool(s.contains(text_arg(0).as_str())),
        "startsWith" => HostValue::Bool(s.starts_with(text_arg(0).as_str())),
        "endsWith" => HostValue::Bool(s.ends_with(text_arg(0).as_str())),
        "indexOf" => HostValue::Number(match s.find(text_arg(0).as_str()) {
            Some(byte_idx) => s[..byte_idx].encode_utf16().count() as f64,
            None => -1.0,
        }),
        "concat" => {
            let mut out = s.to_owned();
            for value in args {
                out.push_str(&value.to_js_string());
            }
            HostValue::String(out)
        }
        "charAt" => {
            let index = arg(args, 0).to_number();
            let index = if index.is_nan() { 0.0 } else { index.trunc() };
            let units: Vec<u16> = s.encode_utf16().collect();
            let picked = if index >= 0.0 { units.get(index as usize) } else { None };
            HostValue::String(picked.map(|unit| String::from_utf16_lossy(&[*unit])).unwrap_or_default())
        }
        "slice" | "substring" => {
            let units: Vec<u16> = s.encode_utf16().collect();
            let len = units.len();
            let (start, end) = if method == "slice" {
                (
                    relative_index(arg(args, 0), len, 0),
                    relative_index(arg(args, 1), len, len),
                )
            } else {
                let clamp = |value: &HostValue, default: usize| match value {
                    HostValue::Undefined => default,
                    other => {
                        let n = other.to_number();
                        if n.is_nan() || n <= 0.0 { 0 } else { (n as usize).min(len) }
                    }
                };
                let (a, b) = (clamp(arg(args, 0), 0), clamp(arg(args, 1), len));
                (a.min(b), a.max(b))
            };
            let slice = if start < end { &units[start..end] } else { &[][..] };
            HostValue::String(String::from_utf16_lossy(slice))
        }
        "repeat" => {
            let count = arg(args, 0).to_number();
            if !(0.0..=f64::from(u32::MAX)).contains(&count) {
                return Err(CallbackError::new(format!(
                    "RangeError: Invalid count value: {}",
                    format_number(count)
                )));
            }
            let count = count as usize;
            string_len(s.len().checked_mul(count))?;
            HostValue::String(s.repeat(count))
        }
        _ => return Err(not_a_function(&HostValue::String(s.to_owned()), method)),
    })
}

/// Resolves a possibly-negative `slice` index against `len`.
fn relative_index(value: &HostValue, len: usize, default: usize) -> usize {
    if let HostValue::Undefined = value {
        return default;
    }
    let n = value.to_number();
    if n.is_nan() {
        return 0;
    }
    let n = n.trunc();
    if n < 0.0 {
        (len as f64 + n).max(0.0) as usize
    } else {
        (n as usize).min(len)
    }
}

fn number_to_string(n: f64, radix: u32) -> Result<String, CallbackError> {
    if !(2..=36).contains(&radix) {
        return Err(CallbackError::new(
            "RangeError: toString() radix must be between 2 and 36",
        ));
    }
    if radix == 10 || !n.is_finite() || n.fract() != 0.0 {
        return Ok(format_number(n));
    }
    let mut magnitude = n.abs() as u128;
    if magnitude == 0 {
        return Ok("0".to_owned());
    }
    let mut digits = Vec::new();
    while magnitude > 0 {
        let digit = (magnitude % u128::from(radix)) as u32;
        digits.push(char::from_digit(digit, radix).unwrap_or('0'));
        magnitude /= u128::from(radix);
    }
    if n < 0.0 {
        digits.push('-');
    }
    Ok(digits.into_iter().rev().collect())
}
