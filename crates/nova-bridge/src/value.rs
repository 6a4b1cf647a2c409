use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A value as seen by host callbacks.
///
/// Wire values decoded from the guest convert into these; object handles resolve to whatever the
/// reference table holds for them.
#[derive(Clone, Debug, PartialEq)]
pub enum HostValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    BigInt(i64),
    String(String),
    Float32Array(Vec<f32>),
    Float64Array(Vec<f64>),
    Uint32Array(Vec<u32>),
    /// Raw byte buffer.
    Bytes(Vec<u8>),
    Object(HostObject),
}

/// Plain record object; callbacks can read its fields with `obj.name` / `obj[key]`.
pub type PropertyMap = BTreeMap<String, HostValue>;

/// Opaque host object of arbitrary Rust type.
///
/// Clones share the same underlying object; equality is identity.
#[derive(Clone)]
pub struct HostObject {
    inner: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl HostObject {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            inner: Arc::new(value),
            type_name: std::any::type_name::<T>(),
        }
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }

    pub fn is<T: Any>(&self) -> bool {
        self.inner.is::<T>()
    }

    pub fn ptr_eq(&self, other: &HostObject) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Fields of the object when it wraps a [`PropertyMap`].
    pub fn properties(&self) -> Option<&PropertyMap> {
        self.downcast_ref::<PropertyMap>()
    }
}

impl PartialEq for HostObject {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl fmt::Debug for HostObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HostObject").field(&self.type_name).finish()
    }
}

impl HostValue {
    /// `undefined` or `null`.
    pub fn is_nullish(&self) -> bool {
        matches!(self, HostValue::Undefined | HostValue::Null)
    }

    pub fn type_of(&self) -> &'static str {
        match self {
            HostValue::Undefined => "undefined",
            HostValue::Bool(_) => "boolean",
            HostValue::Number(_) => "number",
            HostValue::BigInt(_) => "bigint",
            HostValue::String(_) => "string",
            HostValue::Null
            | HostValue::Float32Array(_)
            | HostValue::Float64Array(_)
            | HostValue::Uint32Array(_)
            | HostValue::Bytes(_)
            | HostValue::Object(_) => "object",
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            HostValue::Undefined | HostValue::Null => false,
            HostValue::Bool(b) => *b,
            HostValue::Number(n) => *n != 0.0 && !n.is_nan(),
            HostValue::BigInt(n) => *n != 0,
            HostValue::String(s) => !s.is_empty(),
            _ => true,
        }
    }

    /// Numeric conversion following ECMAScript `ToNumber`, extended to accept `BigInt`.
    pub fn to_number(&self) -> f64 {
        match self {
            HostValue::Undefined => f64::NAN,
            HostValue::Null => 0.0,
            HostValue::Bool(b) => f64::from(u8::from(*b)),
            HostValue::Number(n) => *n,
            HostValue::BigInt(n) => *n as f64,
            HostValue::String(s) => string_to_number(s),
            _ => f64::NAN,
        }
    }

    /// String conversion following ECMAScript `ToString`.
    pub fn to_js_string(&self) -> String {
        match self {
            HostValue::Undefined => "undefined".to_owned(),
            HostValue::Null => "null".to_owned(),
            HostValue::Bool(b) => b.to_string(),
            HostValue::Number(n) => format_number(*n),
            HostValue::BigInt(n) => n.to_string(),
            HostValue::String(s) => s.clone(),
            HostValue::Float32Array(items) => join(items.iter().map(|v| format_number(f64::from(*v)))),
            HostValue::Float64Array(items) => join(items.iter().map(|v| format_number(*v))),
            HostValue::Uint32Array(items) => join(items.iter().map(u32::to_string)),
            HostValue::Bytes(_) => "[object ArrayBuffer]".to_owned(),
            HostValue::Object(_) => "[object Object]".to_owned(),
        }
    }

    /// Element count for strings (UTF-16 units, as the guest's host language counts them) and
    /// arrays.
    pub fn length(&self) -> Option<usize> {
        match self {
            HostValue::String(s) => Some(s.encode_utf16().count()),
            HostValue::Float32Array(v) => Some(v.len()),
            HostValue::Float64Array(v) => Some(v.len()),
            HostValue::Uint32Array(v) => Some(v.len()),
            HostValue::Bytes(v) => Some(v.len()),
            _ => None,
        }
    }
}

fn join(items: impl Iterator<Item = String>) -> String {
    items.collect::<Vec<_>>().join(",")
}

fn string_to_number(s: &str) -> f64 {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return 0.0;
    }
    match trimmed {
        "Infinity" | "+Infinity" => return f64::INFINITY,
        "-Infinity" => return f64::NEG_INFINITY,
        _ => {}
    }
    if let Some(hex) = trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        return u64::from_str_radix(hex, 16).map_or(f64::NAN, |v| v as f64);
    }
    // Rust accepts spellings like "inf" and "nan" that ECMAScript does not.
    if trimmed
        .chars()
        .any(|c| !(c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '+' | '-')))
    {
        return f64::NAN;
    }
    trimmed.parse::<f64>().unwrap_or(f64::NAN)
}

/// Formats a number the way ECMAScript `Number.prototype.toString()` does for the common cases.
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        return "NaN".to_owned();
    }
    if n.is_infinite() {
        return if n > 0.0 { "Infinity" } else { "-Infinity" }.to_owned();
    }
    if n == 0.0 {
        return "0".to_owned();
    }
    let abs = n.abs();
    if abs >= 1e21 || abs < 1e-6 {
        let formatted = format!("{n:e}");
        return match formatted.split_once('e') {
            Some((mantissa, exp)) if !exp.starts_with('-') => format!("{mantissa}e+{exp}"),
            _ => formatted,
        };
    }
    if n.fract() == 0.0 && abs < 9.007_199_254_740_992e15 {
        return format!("{}", n as i64);
    }
    format!("{n}")
}

/// ECMAScript `ToInt32`.
pub fn to_int32(n: f64) -> i32 {
    if !n.is_finite() {
        return 0;
    }
    let modulo = n.trunc().rem_euclid(4_294_967_296.0);
    if modulo >= 2_147_483_648.0 {
        (modulo - 4_294_967_296.0) as i32
    } else {
        modulo as i32
    }
}

/// ECMAScript `ToUint8` (modular, as used when filling a byte array).
pub fn to_uint8(n: f64) -> u8 {
    if !n.is_finite() {
        return 0;
    }
    n.trunc().rem_euclid(256.0) as u8
}

impl From<()> for HostValue {
    fn from(_: ()) -> Self {
        HostValue::Undefined
    }
}

impl From<bool> for HostValue {
    fn from(value: bool) -> Self {
        HostValue::Bool(value)
    }
}

impl From<f64> for HostValue {
    fn from(value: f64) -> Self {
        HostValue::Number(value)
    }
}

impl From<i32> for HostValue {
    fn from(value: i32) -> Self {
        HostValue::Number(f64::from(value))
    }
}

impl From<i64> for HostValue {
    fn from(value: i64) -> Self {
        HostValue::BigInt(value)
    }
}

impl From<&str> for HostValue {
    fn from(value: &str) -> Self {
        HostValue::String(value.to_owned())
    }
}

impl From<String> for HostValue {
    fn from(value: String) -> Self {
        HostValue::String(value)
    }
}

impl From<Vec<u8>> for HostValue {
    fn from(value: Vec<u8>) -> Self {
        HostValue::Bytes(value)
    }
}

impl From<HostObject> for HostValue {
    fn from(value: HostObject) -> Self {
        HostValue::Object(value)
    }
}

impl<T: Into<HostValue>> From<Option<T>> for HostValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(HostValue::Undefined, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_format_like_the_guest_host_language() {
        assert_eq!(format_number(5.0), "5");
        assert_eq!(format_number(-0.0), "0");
        assert_eq!(format_number(0.5), "0.5");
        assert_eq!(format_number(0.1 + 0.2), "0.30000000000000004");
        assert_eq!(format_number(1e21), "1e+21");
        assert_eq!(format_number(1.5e-7), "1.5e-7");
        assert_eq!(format_number(f64::NAN), "NaN");
        assert_eq!(format_number(f64::NEG_INFINITY), "-Infinity");
    }

    #[test]
    fn int32_conversion_wraps() {
        assert_eq!(to_int32(5.9), 5);
        assert_eq!(to_int32(-5.9), -5);
        assert_eq!(to_int32(2_147_483_648.0), -2_147_483_648);
        assert_eq!(to_int32(4_294_967_297.0), 1);
        assert_eq!(to_int32(f64::NAN), 0);
        assert_eq!(to_uint8(257.0), 1);
        assert_eq!(to_uint8(-1.0), 255);
    }

    #[test]
    fn string_to_number_rejects_rust_only_spellings() {
        assert_eq!(HostValue::from(" 42 ").to_number(), 42.0);
        assert_eq!(HostValue::from("").to_number(), 0.0);
        assert_eq!(HostValue::from("0x10").to_number(), 16.0);
        assert!(HostValue::from("inf").to_number().is_nan());
        assert!(HostValue::from("12px").to_number().is_nan());
    }

    #[test]
    fn host_objects_compare_by_identity() {
        let a = HostObject::new(String::from("node"));
        let b = HostObject::new(String::from("node"));
        assert_eq!(HostValue::Object(a.clone()), HostValue::Object(a.clone()));
        assert_ne!(HostValue::Object(a.clone()), HostValue::Object(b));
        assert_eq!(a.downcast_ref::<String>().map(String::as_str), Some("node"));
        assert!(a.type_name().ends_with("String"));
        assert!(a.properties().is_none());

        let record = HostObject::new(PropertyMap::from([("id".to_owned(), HostValue::Number(7.0))]));
        assert_eq!(record.properties().and_then(|p| p.get("id")), Some(&HostValue::Number(7.0)));
    }

    #[test]
    fn truthiness_and_typeof() {
        assert!(!HostValue::Number(f64::NAN).truthy());
        assert!(!HostValue::from("").truthy());
        assert!(HostValue::Bytes(Vec::new()).truthy());
        assert_eq!(HostValue::Null.type_of(), "object");
        assert_eq!(HostValue::BigInt(1).type_of(), "bigint");
        assert_eq!(HostValue::from("héllo").length(), Some(5));
    }
}
