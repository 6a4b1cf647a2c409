use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::config::LimitsConfig;
use crate::provider::{CallbackProvider, CompileError, HostCallback};

/// Dense index of a registered callback, as returned to the guest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(u32);

impl CallbackId {
    pub fn from_raw(raw: u32) -> Self {
        CallbackId(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("unknown callback id {0}")]
    UnknownCallbackId(u32),
    #[error("callback source failed to compile: {0}")]
    CompileFailure(#[source] CompileError),
    #[error("callback source is {len} bytes, limit is {limit}")]
    SourceTooLarge { len: usize, limit: usize },
    #[error("callback registry is full ({limit} callbacks)")]
    RegistryFull { limit: usize },
}

/// Append-only table of callbacks compiled from guest source.
///
/// Ids are assigned densely from 0 in registration order and stay valid for the lifetime of the
/// registry.
pub struct CallbackRegistry {
    provider: Arc<dyn CallbackProvider>,
    callbacks: Vec<Arc<dyn HostCallback>>,
    max_callbacks: usize,
    max_source_bytes: usize,
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("callbacks", &self.callbacks.len())
            .field("max_callbacks", &self.max_callbacks)
            .field("max_source_bytes", &self.max_source_bytes)
            .finish_non_exhaustive()
    }
}

impl CallbackRegistry {
    pub fn new(provider: Arc<dyn CallbackProvider>, limits: &LimitsConfig) -> Self {
        Self {
            provider,
            callbacks: Vec::new(),
            max_callbacks: limits.max_callbacks.min(u32::MAX as usize),
            max_source_bytes: limits.max_source_bytes,
        }
    }

    pub fn register(&mut self, source: &str) -> Result<CallbackId, RegistryError> {
        if self.callbacks.len() >= self.max_callbacks {
            return Err(RegistryError::RegistryFull {
                limit: self.max_callbacks,
            });
        }
        let callback = self.compile_inline(source)?;

        let id = CallbackId(self.callbacks.len() as u32);
        self.callbacks.push(callback);
        tracing::debug!(
            target = "nova.bridge",
            callback = id.raw(),
            source_len = source.len(),
            "registered callback"
        );
        Ok(id)
    }

    pub fn get(&self, id: CallbackId) -> Result<Arc<dyn HostCallback>, RegistryError> {
        self.callbacks
            .get(id.0 as usize)
            .cloned()
            .ok_or(RegistryError::UnknownCallbackId(id.0))
    }

    /// Compiles `source` without registering it.
    pub fn compile_inline(&self, source: &str) -> Result<Arc<dyn HostCallback>, RegistryError> {
        if source.len() > self.max_source_bytes {
            return Err(RegistryError::SourceTooLarge {
                len: source.len(),
                limit: self.max_source_bytes,
            });
        }
        self.provider.compile(source).map_err(|err| {
            tracing::debug!(
                target = "nova.bridge",
                error = %err,
                "callback source rejected"
            );
            RegistryError::CompileFailure(err)
        })
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }
}
