use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::value::HostValue;

/// A compiled host callback the guest can invoke.
pub trait HostCallback: Send + Sync {
    fn call(&self, args: &[HostValue]) -> Result<HostValue, CallbackError>;
}

impl<F> HostCallback for F
where
    F: Fn(&[HostValue]) -> Result<HostValue, CallbackError> + Send + Sync,
{
    fn call(&self, args: &[HostValue]) -> Result<HostValue, CallbackError> {
        self(args)
    }
}

/// Failure raised while a callback runs.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct CallbackError {
    pub message: String,
}

impl CallbackError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn type_error(message: impl fmt::Display) -> Self {
        Self::new(format!("TypeError: {message}"))
    }
}

/// Source text that could not be turned into a callback.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct CompileError {
    pub message: String,
    /// Byte offset into the source, when known.
    pub offset: Option<usize>,
}

impl CompileError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            offset: None,
        }
    }

    pub fn at(offset: usize, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            offset: Some(offset),
        }
    }
}

/// Turns guest-supplied callback source into an invocable [`HostCallback`].
///
/// The embedding decides what "source" means: the bundled [`ScriptProvider`](crate::script::ScriptProvider)
/// evaluates a small expression language, [`NativeProvider`] looks up pre-registered closures.
pub trait CallbackProvider: Send + Sync {
    fn compile(&self, source: &str) -> Result<Arc<dyn HostCallback>, CompileError>;
}

/// Callback table populated ahead of time by the embedding, keyed by exact source text.
///
/// Keys are compared after trimming surrounding whitespace. Unknown sources go to the fallback
/// provider if one is configured, and fail to compile otherwise.
#[derive(Default)]
pub struct NativeProvider {
    callbacks: HashMap<String, Arc<dyn HostCallback>>,
    fallback: Option<Arc<dyn CallbackProvider>>,
}

impl fmt::Debug for NativeProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.callbacks.keys().collect();
        keys.sort();
        f.debug_struct("NativeProvider")
            .field("callbacks", &keys)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

impl NativeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn CallbackProvider>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn insert(&mut self, source: &str, callback: Arc<dyn HostCallback>) -> &mut Self {
        self.callbacks.insert(source.trim().to_owned(), callback);
        self
    }

    pub fn insert_fn<F>(&mut self, source: &str, callback: F) -> &mut Self
    where
        F: Fn(&[HostValue]) -> Result<HostValue, CallbackError> + Send + Sync + 'static,
    {
        self.insert(source, Arc::new(callback))
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }
}

impl CallbackProvider for NativeProvider {
    fn compile(&self, source: &str) -> Result<Arc<dyn HostCallback>, CompileError> {
        if let Some(callback) = self.callbacks.get(source.trim()) {
            return Ok(Arc::clone(callback));
        }
        match &self.fallback {
            Some(fallback) => fallback.compile(source),
            None => Err(CompileError::new(format!(
                "no native callback registered for source `{}`",
                source.trim()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_provider_matches_trimmed_source() {
        let mut provider = NativeProvider::new();
        provider.insert_fn("(a, b) => a + b", |args| {
            let sum: f64 = args.iter().map(HostValue::to_number).sum();
            Ok(HostValue::Number(sum))
        });

        let callback = provider.compile("  (a, b) => a + b\n").unwrap();
        let out = callback
            .call(&[HostValue::Number(2.0), HostValue::Number(3.0)])
            .unwrap();
        assert_eq!(out, HostValue::Number(5.0));

        let err = provider.compile("(a) => a").err().unwrap();
        assert!(err.message.contains("no native callback"), "{err}");
    }

    #[test]
    fn native_provider_defers_to_fallback() {
        struct Always;
        impl CallbackProvider for Always {
            fn compile(&self, _source: &str) -> Result<Arc<dyn HostCallback>, CompileError> {
                Ok(Arc::new(|_: &[HostValue]| Ok::<_, CallbackError>(HostValue::Null)))
            }
        }

        let provider = NativeProvider::new().with_fallback(Arc::new(Always));
        let callback = provider.compile("anything").unwrap();
        assert_eq!(callback.call(&[]).unwrap(), HostValue::Null);
    }
}
