use nova_bridge_abi::ReturnKind;
use thiserror::Error;

use crate::codec::DecodeError;
use crate::handles::HandleError;
use crate::registry::RegistryError;

/// Any failure of a bridge entry point. Each one aborts the current invocation.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Handle(#[from] HandleError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("callback returned {found} where a {expected} result is required")]
    InvalidReturnValue {
        expected: ReturnKind,
        found: &'static str,
    },
    #[error("callback failed: {0}")]
    CallbackFault(String),
    #[error("guest module does not export `{0}`")]
    MissingExport(String),
    #[error("call into guest export `{export}` failed: {message}")]
    GuestCall { export: &'static str, message: String },
    #[error(
        "allocation {id} at {ptr:#x} (+{len} bytes) lies outside guest memory of {memory_size} bytes"
    )]
    MemoryOutOfBounds {
        id: u32,
        ptr: u32,
        len: usize,
        memory_size: usize,
    },
    #[error("unknown return kind code {0}")]
    UnknownReturnKind(i32),
    #[error("inline callback source calls are disabled by configuration")]
    LegacyCallsDisabled,
    #[error("{what} is {len} bytes, limit is {limit}")]
    LimitExceeded {
        what: &'static str,
        len: usize,
        limit: usize,
    },
}

impl BridgeError {
    /// Stable snake_case name for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::Decode(err) => match err {
                DecodeError::UnrecognizedTag { .. } => "unrecognized_tag",
                DecodeError::TruncatedBuffer { .. } => "truncated_buffer",
                DecodeError::MemoryOutOfBounds { .. } => "memory_out_of_bounds",
                DecodeError::LengthOverflow { .. } => "length_overflow",
            },
            BridgeError::Handle(err) => match err {
                HandleError::InvalidHandle(_) => "invalid_handle",
                HandleError::DoubleFree(_) => "double_free",
                HandleError::TableFull { .. } => "handle_table_full",
            },
            BridgeError::Registry(err) => match err {
                RegistryError::UnknownCallbackId(_) => "unknown_callback_id",
                RegistryError::CompileFailure(_) => "compile_failure",
                RegistryError::SourceTooLarge { .. } => "source_too_large",
                RegistryError::RegistryFull { .. } => "registry_full",
            },
            BridgeError::InvalidReturnValue { .. } => "invalid_return_value",
            BridgeError::CallbackFault(_) => "callback_fault",
            BridgeError::MissingExport(_) => "missing_export",
            BridgeError::GuestCall { .. } => "guest_call",
            BridgeError::MemoryOutOfBounds { .. } => "memory_out_of_bounds",
            BridgeError::UnknownReturnKind(_) => "unknown_return_kind",
            BridgeError::LegacyCallsDisabled => "legacy_calls_disabled",
            BridgeError::LimitExceeded { .. } => "limit_exceeded",
        }
    }
}
