use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::provider::CallbackError;
use crate::value::{format_number, HostValue};

/// Native function callable from scripts.
pub type NativeFn = Arc<dyn Fn(&[HostValue]) -> Result<HostValue, CallbackError> + Send + Sync>;

static UNDEFINED: HostValue = HostValue::Undefined;

/// Positional argument, `undefined` when missing.
pub(crate) fn arg(args: &[HostValue], index: usize) -> &HostValue {
    args.get(index).unwrap_or(&UNDEFINED)
}

#[derive(Clone)]
pub enum Global {
    Value(HostValue),
    Function(NativeFn),
}

impl fmt::Debug for Global {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Global::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Global::Function(_) => f.write_str("Function(..)"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsoleLevel {
    Debug,
    Log,
    Info,
    Warn,
    Error,
}

/// Destination for `console.*` output.
pub trait Console: Send + Sync {
    fn write(&self, level: ConsoleLevel, message: &str);
}

/// Forwards console output to `tracing` under the `nova_bridge::console` target.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingConsole;

impl Console for TracingConsole {
    fn write(&self, level: ConsoleLevel, message: &str) {
        match level {
            ConsoleLevel::Debug => tracing::debug!(target: "nova_bridge::console", "{message}"),
            ConsoleLevel::Log | ConsoleLevel::Info => {
                tracing::info!(target: "nova_bridge::console", "{message}")
            }
            ConsoleLevel::Warn => tracing::warn!(target: "nova_bridge::console", "{message}"),
            ConsoleLevel::Error => tracing::error!(target: "nova_bridge::console", "{message}"),
        }
    }
}

/// Names visible to callback scripts besides their own parameters and locals.
///
/// Entries are keyed by dotted path (`"Math.max"`); every prefix of a defined path becomes a
/// namespace that scripts may traverse but not use as a value.
#[derive(Clone, Debug, Default)]
pub struct HostGlobals {
    entries: BTreeMap<String, Global>,
    namespaces: BTreeSet<String>,
}

impl HostGlobals {
    /// No globals at all.
    pub fn empty() -> Self {
        Self::default()
    }

    /// `console` (to `tracing`), `Math`, and the primitive conversion functions.
    pub fn standard() -> Self {
        let mut globals = Self::empty();
        globals.install_console(Arc::new(TracingConsole));
        install_math(&mut globals);
        install_conversions(&mut globals);
        globals
    }

    /// Replaces the `console.*` functions with ones writing to `console`.
    pub fn with_console(mut self, console: Arc<dyn Console>) -> Self {
        self.install_console(console);
        self
    }

    pub fn define_value(&mut self, path: &str, value: impl Into<HostValue>) -> &mut Self {
        self.define(path, Global::Value(value.into()))
    }

    pub fn define_fn<F>(&mut self, path: &str, function: F) -> &mut Self
    where
        F: Fn(&[HostValue]) -> Result<HostValue, CallbackError> + Send + Sync + 'static,
    {
        self.define(path, Global::Function(Arc::new(function)))
    }

    pub fn get(&self, path: &str) -> Option<&Global> {
        self.entries.get(path)
    }

    pub fn is_known_path(&self, path: &str) -> bool {
        self.entries.contains_key(path) || self.namespaces.contains(path)
    }

    fn define(&mut self, path: &str, global: Global) -> &mut Self {
        let mut prefix_end = 0;
        while let Some(dot) = path[prefix_end..].find('.') {
            prefix_end += dot;
            self.namespaces.insert(path[..prefix_end].to_owned());
            prefix_end += 1;
        }
        self.entries.insert(path.to_owned(), global);
        self
    }

    fn install_console(&mut self, console: Arc<dyn Console>) {
        for (name, level) in [
            ("console.log", ConsoleLevel::Log),
            ("console.info", ConsoleLevel::Info),
            ("console.debug", ConsoleLevel::Debug),
            ("console.warn", ConsoleLevel::Warn),
            ("console.error", ConsoleLevel::Error),
        ] {
            let console = Arc::clone(&console);
            self.define_fn(name, move |args| {
                let message = args
                    .iter()
                    .map(HostValue::to_js_string)
                    .collect::<Vec<_>>()
                    .join(" ");
                console.write(level, &message);
                Ok(HostValue::Undefined)
            });
        }
    }
}

fn install_math(globals: &mut HostGlobals) {
    globals
        .define_value("Math.PI", std::f64::consts::PI)
        .define_value("Math.E", std::f64::consts::E)
        .define_value("Math.LN2", std::f64::consts::LN_2)
        .define_value("Math.LN10", std::f64::consts::LN_10)
        .define_value("Math.SQRT2", std::f64::consts::SQRT_2);

    let unary: [(&str, fn(f64) -> f64); 15] = [
        ("Math.abs", f64::abs),
        ("Math.floor", f64::floor),
        ("Math.ceil", f64::ceil),
        // Rounds half up, unlike `f64::round`.
        ("Math.round", |n| (n + 0.5).floor()),
        ("Math.trunc", f64::trunc),
        ("Math.sign", |n| if n == 0.0 || n.is_nan() { n } else { n.signum() }),
        ("Math.sqrt", f64::sqrt),
        ("Math.cbrt", f64::cbrt),
        ("Math.log", f64::ln),
        ("Math.log2", f64::log2),
        ("Math.log10", f64::log10),
        ("Math.exp", f64::exp),
        ("Math.sin", f64::sin),
        ("Math.cos", f64::cos),
        ("Math.tan", f64::tan),
    ];
    for (name, op) in unary {
        globals.define_fn(name, move |args| number_arg(args, 0).map(|n| HostValue::Number(op(n))));
    }

    globals
        .define_fn("Math.pow", |args| {
            Ok(HostValue::Number(number_arg(args, 0)?.powf(number_arg(args, 1)?)))
        })
        .define_fn("Math.atan2", |args| {
            Ok(HostValue::Number(number_arg(args, 0)?.atan2(number_arg(args, 1)?)))
        })
        .define_fn("Math.hypot", |args| {
            let mut sum = 0.0;
            for index in 0..args.len() {
                let n = number_arg(args, index)?;
                sum += n * n;
            }
            Ok(HostValue::Number(sum.sqrt()))
        })
        .define_fn("Math.max", |args| fold_numbers(args, f64::NEG_INFINITY, f64::max))
        .define_fn("Math.min", |args| fold_numbers(args, f64::INFINITY, f64::min));
}

fn install_conversions(globals: &mut HostGlobals) {
    globals
        .define_fn("String", |args| {
            Ok(HostValue::String(match args.first() {
                Some(value) => value.to_js_string(),
                None => String::new(),
            }))
        })
        .define_fn("Number", |args| {
            Ok(HostValue::Number(match args.first() {
                Some(value) => value.to_number(),
                None => 0.0,
            }))
        })
        .define_fn("Boolean", |args| Ok(HostValue::Bool(arg(args, 0).truthy())))
        .define_fn("BigInt", |args| to_bigint(arg(args, 0)).map(HostValue::BigInt))
        .define_fn("parseInt", |args| {
            let radix = match arg(args, 1) {
                HostValue::Undefined => 0,
                other => other.to_number() as u32,
            };
            Ok(HostValue::Number(parse_int(&arg(args, 0).to_js_string(), radix)))
        })
        .define_fn("parseFloat", |args| {
            Ok(HostValue::Number(parse_float(&arg(args, 0).to_js_string())))
        })
        .define_fn("isNaN", |args| Ok(HostValue::Bool(number_arg(args, 0)?.is_nan())))
        .define_fn("isFinite", |args| Ok(HostValue::Bool(number_arg(args, 0)?.is_finite())))
        .define_fn("Number.isInteger", |args| {
            Ok(HostValue::Bool(
                matches!(arg(args, 0), HostValue::Number(n) if n.is_finite() && n.fract() == 0.0),
            ))
        })
        .define_fn("Number.isFinite", |args| {
            Ok(HostValue::Bool(matches!(arg(args, 0), HostValue::Number(n) if n.is_finite())))
        })
        .define_fn("Number.isNaN", |args| {
            Ok(HostValue::Bool(matches!(arg(args, 0), HostValue::Number(n) if n.is_nan())))
        })
        .define_value("Number.MAX_SAFE_INTEGER", 9_007_199_254_740_991.0)
        .define_value("Number.MIN_SAFE_INTEGER", -9_007_199_254_740_991.0)
        .define_value("Number.EPSILON", f64::EPSILON);
}

/// Numeric argument; `BigInt` is rejected the way implicit number conversion rejects it.
pub(crate) fn number_arg(args: &[HostValue], index: usize) -> Result<f64, CallbackError> {
    match arg(args, index) {
        HostValue::BigInt(_) => Err(CallbackError::type_error(
            "Cannot convert a BigInt value to a number",
        )),
        value => Ok(value.to_number()),
    }
}

fn fold_numbers(args: &[HostValue], init: f64, pick: fn(f64, f64) -> f64) -> Result<HostValue, CallbackError> {
    let mut acc = init;
    for index in 0..args.len() {
        let n = number_arg(args, index)?;
        if n.is_nan() {
            return Ok(HostValue::Number(f64::NAN));
        }
        acc = pick(acc, n);
    }
    Ok(HostValue::Number(acc))
}

fn to_bigint(value: &HostValue) -> Result<i64, CallbackError> {
    match value {
        HostValue::BigInt(n) => Ok(*n),
        HostValue::Bool(b) => Ok(i64::from(*b)),
        HostValue::Number(n) => {
            if n.fract() != 0.0 || !n.is_finite() {
                return Err(CallbackError::new(format!(
                    "RangeError: The number {} cannot be converted to a BigInt because it is not an integer",
                    format_number(*n)
                )));
            }
            if n.abs() >= 9.223_372_036_854_775_808e18 {
                return Err(CallbackError::new("RangeError: BigInt out of 64-bit range"));
            }
            Ok(*n as i64)
        }
        HostValue::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return Ok(0);
            }
            trimmed.parse::<i64>().map_err(|_| {
                CallbackError::new(format!("SyntaxError: Cannot convert {trimmed} to a BigInt"))
            })
        }
        other => Err(CallbackError::type_error(format!(
            "Cannot convert {} to a BigInt",
            other.to_js_string()
        ))),
    }
}

fn parse_int(input: &str, radix: u32) -> f64 {
    let mut rest = input.trim_start();
    let negative = rest.starts_with('-');
    if let Some(stripped) = rest.strip_prefix(['-', '+']) {
        rest = stripped;
    }

    let mut radix = radix;
    if radix == 0 || radix == 16 {
        if let Some(stripped) = rest.strip_prefix("0x").or_else(|| rest.strip_prefix("0X")) {
            rest = stripped;
            radix = 16;
        }
    }
    if radix == 0 {
        radix = 10;
    }
    if !(2..=36).contains(&radix) {
        return f64::NAN;
    }

    let digits: Vec<u32> = rest.chars().map_while(|c| c.to_digit(radix)).collect();
    if digits.is_empty() {
        return f64::NAN;
    }
    let value = digits
        .into_iter()
        .fold(0.0, |acc, digit| acc * f64::from(radix) + f64::from(digit));
    if negative {
        -value
    } else {
        value
    }
}

fn parse_float(input: &str) -> f64 {
    let trimmed = input.trim_start();
    let unsigned = trimmed.trim_start_matches(['-', '+']);
    if unsigned.starts_with("Infinity") {
        return if trimmed.starts_with('-') {
            f64::NEG_INFINITY
        } else {
            f64::INFINITY
        };
    }

    // Longest prefix that parses as a float literal.
    let candidate_end = trimmed
        .char_indices()
        .find(|(_, c)| !(c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '+' | '-')))
        .map_or(trimmed.len(), |(idx, _)| idx);
    (1..=candidate_end)
        .rev()
        .find_map(|end| {
            let prefix = &trimmed[..end];
            if prefix.ends_with(['e', 'E', '+', '-']) {
                return None;
            }
            prefix.parse::<f64>().ok()
        })
        .unwrap_or(f64::NAN)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(globals: &HostGlobals, path: &str, args: &[HostValue]) -> Result<HostValue, CallbackError> {
        match globals.get(path) {
            Some(Global::Function(function)) => function(args),
            other => panic!("{path} is not a function: {other:?}"),
        }
    }

    #[test]
    fn paths_register_their_namespaces() {
        let globals = HostGlobals::standard();
        assert!(globals.is_known_path("Math"));
        assert!(globals.is_known_path("Math.max"));
        assert!(globals.is_known_path("console"));
        assert!(!globals.is_known_path("Math.nope"));
        assert!(!globals.is_known_path("window"));
    }

    #[test]
    fn math_helpers_follow_number_semantics() {
        let globals = HostGlobals::standard();
        let n = |v: f64| HostValue::Number(v);
        assert_eq!(call(&globals, "Math.max", &[n(1.0), n(7.0), n(3.0)]).unwrap(), n(7.0));
        assert_eq!(call(&globals, "Math.max", &[]).unwrap(), n(f64::NEG_INFINITY));
        assert_eq!(call(&globals, "Math.round", &[n(-2.5)]).unwrap(), n(-2.0));
        assert_eq!(call(&globals, "Math.round", &[n(2.5)]).unwrap(), n(3.0));
        assert_eq!(call(&globals, "Math.pow", &[n(2.0), n(10.0)]).unwrap(), n(1024.0));
        assert!(call(&globals, "Math.abs", &[HostValue::BigInt(1)]).is_err());
    }

    #[test]
    fn conversions() {
        let globals = HostGlobals::standard();
        assert_eq!(
            call(&globals, "String", &[HostValue::Number(5.0)]).unwrap(),
            HostValue::from("5")
        );
        assert_eq!(
            call(&globals, "BigInt", &[HostValue::from("42")]).unwrap(),
            HostValue::BigInt(42)
        );
        let err = call(&globals, "BigInt", &[HostValue::Number(1.5)]).unwrap_err();
        assert!(err.message.starts_with("RangeError"), "{err}");
    }

    #[test]
    fn parse_int_and_float_take_the_longest_prefix() {
        assert_eq!(parse_int("  42px", 0), 42.0);
        assert_eq!(parse_int("-0x1f", 0), -31.0);
        assert_eq!(parse_int("101", 2), 5.0);
        assert!(parse_int("px", 10).is_nan());
        assert_eq!(parse_float("3.25e2abc"), 325.0);
        assert_eq!(parse_float("1e"), 1.0);
        assert_eq!(parse_float("-Infinity"), f64::NEG_INFINITY);
        assert!(parse_float(".").is_nan());
    }

    #[test]
    fn console_output_is_redirectable() {
        use parking_lot::Mutex;

        #[derive(Default)]
        struct Capture(Mutex<Vec<(ConsoleLevel, String)>>);
        impl Console for Capture {
            fn write(&self, level: ConsoleLevel, message: &str) {
                self.0.lock().push((level, message.to_owned()));
            }
        }

        let capture = Arc::new(Capture::default());
        let globals = HostGlobals::standard().with_console(capture.clone());
        call(
            &globals,
            "console.warn",
            &[HostValue::from("low disk:"), HostValue::Number(3.0), HostValue::Null],
        )
        .unwrap();
        assert_eq!(
            *capture.0.lock(),
            vec![(ConsoleLevel::Warn, "low disk: 3 null".to_owned())]
        );
    }
}
