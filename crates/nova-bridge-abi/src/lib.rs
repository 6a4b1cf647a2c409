#![no_std]

extern crate alloc;

#[cfg(any(test, feature = "guest"))]
extern crate std;

use core::fmt;

mod encode;

#[cfg(feature = "guest")]
pub mod guest;

pub use encode::{serialize, ArgsEncoder, HostRef, InvokeParam};

/// Version of the call bridge wire protocol implemented by this crate.
///
/// Version 1 is the 11-tag argument encoding with a persistent callback registry.
pub const PROTOCOL_VERSION: u32 = 1;

/// Default import module the host registers its functions under.
pub const IMPORT_MODULE: &str = "env";

/// Tag bytes of the argument buffer.
///
/// Each encoded value starts with one of these bytes. Pointer-bearing tags are followed by two
/// little-endian `u32` fields (pointer, then byte length for strings or element count for typed
/// arrays). Scalars are followed by their 8-byte little-endian representation; handles by a
/// 4-byte little-endian `u32`.
pub mod tags {
    pub const UNDEFINED: u8 = 0;
    pub const NULL: u8 = 1;
    pub const FLOAT64: u8 = 2;
    pub const INT64: u8 = 3;
    pub const UTF8_STRING: u8 = 4;
    pub const OBJECT_HANDLE: u8 = 5;
    pub const FLOAT32_ARRAY: u8 = 6;
    pub const TRUE: u8 = 7;
    pub const FALSE: u8 = 8;
    pub const FLOAT64_ARRAY: u8 = 9;
    pub const UINT32_ARRAY: u8 = 10;

    /// Number of payload bytes following `tag`, or `None` if `tag` is not defined.
    #[inline]
    pub const fn payload_len(tag: u8) -> Option<usize> {
        match tag {
            UNDEFINED | NULL | TRUE | FALSE => Some(0),
            OBJECT_HANDLE => Some(4),
            FLOAT64 | INT64 => Some(8),
            UTF8_STRING | FLOAT32_ARRAY | FLOAT64_ARRAY | UINT32_ARRAY => Some(8),
            _ => None,
        }
    }
}

/// Names of the functions the host provides to the guest.
pub mod imports {
    pub const REGISTER_FUNCTION: &str = "__register_function";
    pub const INVOKE_FUNCTION: &str = "__invoke_function";
    pub const INVOKE_FUNCTION_AND_RETURN_OBJECT: &str = "__invoke_function_and_return_object";
    pub const INVOKE_FUNCTION_AND_RETURN_BOOL: &str = "__invoke_function_and_return_bool";
    pub const INVOKE_FUNCTION_AND_RETURN_BIGINT: &str = "__invoke_function_and_return_bigint";
    pub const INVOKE_FUNCTION_AND_RETURN_NUMBER: &str = "__invoke_function_and_return_number";
    pub const INVOKE_FUNCTION_AND_RETURN_STRING: &str = "__invoke_function_and_return_string";
    pub const INVOKE_FUNCTION_AND_RETURN_ARRAY_BUFFER: &str =
        "__invoke_function_and_return_array_buffer";
    pub const RELEASE_HANDLE: &str = "__release_handle";

    /// Single entry point taking the return kind as a parameter.
    pub const INVOKE: &str = "__invoke";

    // Legacy inline-source entry points: the callback source travels with every call.
    pub const INVOKE_AND_RETURN: &str = "__invoke_and_return";
    pub const INVOKE_AND_RETURN_NUMBER: &str = "__invoke_and_return_number";
    pub const INVOKE_AND_RETURN_REF: &str = "__invoke_and_return_ref";
    pub const INVOKE_AND_RETURN_BIGINT: &str = "__invoke_and_return_bigint";
    pub const INVOKE_AND_RETURN_STRING: &str = "__invoke_and_return_string";
    pub const INVOKE_AND_RETURN_ARRAY_BUFFER: &str = "__invoke_and_return_array_buffer";

    /// Registry-based imports plus the unified entry point, always provided by the host.
    pub const CANONICAL: &[&str] = &[
        REGISTER_FUNCTION,
        INVOKE_FUNCTION,
        INVOKE_FUNCTION_AND_RETURN_OBJECT,
        INVOKE_FUNCTION_AND_RETURN_BOOL,
        INVOKE_FUNCTION_AND_RETURN_BIGINT,
        INVOKE_FUNCTION_AND_RETURN_NUMBER,
        INVOKE_FUNCTION_AND_RETURN_STRING,
        INVOKE_FUNCTION_AND_RETURN_ARRAY_BUFFER,
        RELEASE_HANDLE,
        INVOKE,
    ];

    pub const LEGACY: &[&str] = &[
        INVOKE_AND_RETURN,
        INVOKE_AND_RETURN_NUMBER,
        INVOKE_AND_RETURN_REF,
        INVOKE_AND_RETURN_BIGINT,
        INVOKE_AND_RETURN_STRING,
        INVOKE_AND_RETURN_ARRAY_BUFFER,
    ];
}

/// Names of the functions the guest must export for the host.
pub mod exports {
    pub const MEMORY: &str = "memory";
    pub const CREATE_ALLOCATION: &str = "create_allocation";
    pub const ALLOCATION_POINTER: &str = "allocation_pointer";
    /// Older guests export the pointer accessor under this name.
    pub const ALLOCATION_POINTER_LEGACY: &str = "get_allocation";
    pub const MAIN: &str = "main";
}

/// How the host should hand a callback's result back to the guest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReturnKind {
    /// Discard the result; the guest receives `0`.
    None,
    /// Raw numeric/boolean result coerced to a 32-bit integer.
    Scalar,
    /// Truthiness of the result as `0`/`1`.
    Bool,
    /// 64-bit signed integer.
    Int64,
    /// 64-bit float (returned as its bit pattern through the unified entry point).
    Float64,
    /// Object handle into the host's reference table.
    Handle,
    /// UTF-8 text written into a guest allocation; the guest receives the allocation id.
    Text,
    /// Raw bytes written into a guest allocation; the guest receives the allocation id.
    Bytes,
}

impl ReturnKind {
    pub const ALL: [ReturnKind; 8] = [
        ReturnKind::None,
        ReturnKind::Scalar,
        ReturnKind::Bool,
        ReturnKind::Int64,
        ReturnKind::Float64,
        ReturnKind::Handle,
        ReturnKind::Text,
        ReturnKind::Bytes,
    ];

    /// Numeric code used by the unified `__invoke` import.
    #[inline]
    pub const fn code(self) -> i32 {
        match self {
            ReturnKind::None => 0,
            ReturnKind::Scalar => 1,
            ReturnKind::Bool => 2,
            ReturnKind::Int64 => 3,
            ReturnKind::Float64 => 4,
            ReturnKind::Handle => 5,
            ReturnKind::Text => 6,
            ReturnKind::Bytes => 7,
        }
    }

    #[inline]
    pub const fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => ReturnKind::None,
            1 => ReturnKind::Scalar,
            2 => ReturnKind::Bool,
            3 => ReturnKind::Int64,
            4 => ReturnKind::Float64,
            5 => ReturnKind::Handle,
            6 => ReturnKind::Text,
            7 => ReturnKind::Bytes,
            _ => return None,
        })
    }

    /// Whether an absent (`undefined`/`null`) result is rejected for this kind.
    #[inline]
    pub const fn requires_value(self) -> bool {
        !matches!(self, ReturnKind::None | ReturnKind::Scalar | ReturnKind::Bool)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            ReturnKind::None => "none",
            ReturnKind::Scalar => "scalar",
            ReturnKind::Bool => "bool",
            ReturnKind::Int64 => "int64",
            ReturnKind::Float64 => "float64",
            ReturnKind::Handle => "handle",
            ReturnKind::Text => "text",
            ReturnKind::Bytes => "bytes",
        }
    }
}

impl fmt::Display for ReturnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
