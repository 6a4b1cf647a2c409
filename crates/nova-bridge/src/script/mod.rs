//! Embedded evaluator for guest-supplied callback source.
//!
//! Guests send small arrow or `function` expressions such as `(a, b) => a + b` or
//! `function (message) { console.log(message); }`. Source is parsed once at registration and
//! evaluated per call against the caller's arguments and a table of [`HostGlobals`].
//!
//! Supported: parameters, `let`/`const`/`var`, `if`/`else`, `return`, the usual arithmetic,
//! comparison and logical operators (including `??` and `?.`), property and index reads, string
//! and number methods, and calls into host globals. Identifiers are resolved when the source is
//! compiled, so a callback cannot reach anything outside its parameters, its own locals and the
//! configured globals. `this`, loops, assignments and closures are rejected.

mod eval;
mod globals;
mod lexer;
mod parser;


use std::fmt;
use std::sync::Arc;

pub use globals::{Console, ConsoleLevel, Global, HostGlobals, NativeFn, TracingConsole};

use crate::provider::{CallbackError, CallbackProvider, CompileError, HostCallback};
use crate::value::HostValue;

use parser::{parse_callback, Function};

#[derive(Clone)]
pub struct ScriptProvider {
    globals: Arc<HostGlobals>,
}

impl ScriptProvider {
    pub fn new(globals: HostGlobals) -> Self {
        Self {
            globals: Arc::new(globals),
        }
    }

    pub fn globals(&self) -> &HostGlobals {
        &self.globals
    }
}

impl Default for ScriptProvider {
    fn default() -> Self {
        Self::new(HostGlobals::standard())
    }
}

impl fmt::Debug for ScriptProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptProvider").finish_non_exhaustive()
    }
}

impl CallbackProvider for ScriptProvider {
    fn compile(&self, source: &str) -> Result<Arc<dyn HostCallback>, CompileError> {
        let function = parse_callback(source, &self.globals)?;
        Ok(Arc::new(ScriptCallback {
            function,
            globals: Arc::clone(&self.globals),
        }))
    }
}

struct ScriptCallback {
    function: Function,
    globals: Arc<HostGlobals>,
}

impl HostCallback for ScriptCallback {
    fn call(&self, args: &[HostValue]) -> Result<HostValue, CallbackError> {
        eval::call_function(&self.function, &self.globals, args)
    }
}
