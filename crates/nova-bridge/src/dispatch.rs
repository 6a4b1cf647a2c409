//! The per-call state machine behind every invoke import.
//!
//! An invocation runs four phases in order and stops at the first failure:
//!
//! 1. decode the argument buffer, resolving object handles;
//! 2. run the callback;
//! 3. classify the result against the requested [`ReturnKind`];
//! 4. encode it as a single machine word, storing objects in the reference table and copying
//!    text or bytes into a guest allocation.
//!
//! Nothing here depends on wasmtime: the embedding supplies guest memory, the guest allocator
//! and the [`Bridge`] through [`GuestContext`].

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

use nova_bridge_abi::ReturnKind;

use crate::allocation::{write_to_guest_memory, GuestAllocator};
use crate::bridge::{read_source, Bridge};
use crate::error::BridgeError;
use crate::provider::HostCallback;
use crate::registry::CallbackId;
use crate::value::{to_int32, to_uint8, HostValue};

/// Access to one guest instance during an import call.
pub trait GuestContext: GuestAllocator {
    /// Guest linear memory and the bridge state, borrowed together.
    fn memory_and_bridge(&mut self) -> (&[u8], &mut Bridge);

    fn bridge(&mut self) -> &mut Bridge {
        self.memory_and_bridge().1
    }
}

/// Which callback an invocation runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvocationTarget {
    Registered(CallbackId),
    /// Source text in guest memory, compiled for this call only.
    Inline { code_ptr: u32, code_len: u32 },
}

impl InvocationTarget {
    /// Decodes the `(code_ptr_or_id, code_len)` pair of the unified import: a zero length means
    /// the first value is a registered id.
    pub fn from_unified(code_ptr_or_id: u32, code_len: u32) -> Self {
        if code_len == 0 {
            InvocationTarget::Registered(CallbackId::from_raw(code_ptr_or_id))
        } else {
            InvocationTarget::Inline {
                code_ptr: code_ptr_or_id,
                code_len,
            }
        }
    }
}

impl fmt::Display for InvocationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvocationTarget::Registered(id) => write!(f, "{id}"),
            InvocationTarget::Inline { code_len, .. } => write!(f, "inline({code_len} bytes)"),
        }
    }
}

/// The single value an import returns to the guest.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RawResult {
    I32(i32),
    I64(i64),
    F64(f64),
}

impl RawResult {
    /// 64-bit encoding used by the unified import: integers sign-extended, floats as bits.
    pub fn to_word(self) -> i64 {
        match self {
            RawResult::I32(v) => i64::from(v),
            RawResult::I64(v) => v,
            RawResult::F64(v) => v.to_bits() as i64,
        }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            RawResult::I32(v) => v,
            RawResult::I64(v) => v as i32,
            RawResult::F64(v) => to_int32(v),
        }
    }

    pub fn as_i64(self) -> i64 {
        match self {
            RawResult::I32(v) => i64::from(v),
            RawResult::I64(v) => v,
            RawResult::F64(v) => v as i64,
        }
    }

    pub fn as_f64(self) -> f64 {
        match self {
            RawResult::I32(v) => f64::from(v),
            RawResult::I64(v) => v as f64,
            RawResult::F64(v) => v,
        }
    }
}

/// A classified callback result, before it is encoded for the guest.
#[derive(Clone, Debug, PartialEq)]
pub enum Classified {
    Word(RawResult),
    /// Goes into the reference table.
    Object(HostValue),
    /// Goes into a guest allocation.
    Buffer(Vec<u8>),
}

/// Registers callback source found at `memory[src_ptr..src_ptr + src_len]`.
pub fn register<G>(
    guest: &mut G,
    import: &'static str,
    src_ptr: u32,
    src_len: u32,
) -> Result<CallbackId, BridgeError>
where
    G: GuestContext + ?Sized,
{
    instrumented(guest, import, |guest| {
        let (memory, bridge) = guest.memory_and_bridge();
        let source = read_source(memory, src_ptr, src_len)?;
        bridge.register(&source)
    })
}

/// Releases a guest-held object handle.
pub fn release<G>(guest: &mut G, import: &'static str, raw: u32) -> Result<(), BridgeError>
where
    G: GuestContext + ?Sized,
{
    instrumented(guest, import, |guest| guest.bridge().release_handle(raw).map(drop))
}

/// Runs one invocation through all four phases.
pub fn invoke<G>(
    guest: &mut G,
    import: &'static str,
    target: InvocationTarget,
    args_ptr: u32,
    args_len: u32,
    kind: ReturnKind,
) -> Result<RawResult, BridgeError>
where
    G: GuestContext + ?Sized,
{
    let span = tracing::debug_span!("bridge.invoke", import, target = %target, kind = %kind);
    let _guard = span.enter();

    instrumented(guest, import, |guest| {
        let (callback, args) = {
            let (memory, bridge) = guest.memory_and_bridge();
            let callback = bridge.resolve_target(memory, target)?;
            let args = bridge.decode_args(memory, args_ptr, args_len)?;
            (callback, args)
        };

        let value = run_callback(callback.as_ref(), &args)?;
        let classified = classify(value, kind)?;
        encode(guest, classified)
    })
}

fn instrumented<G, T>(
    guest: &mut G,
    import: &'static str,
    call: impl FnOnce(&mut G) -> Result<T, BridgeError>,
) -> Result<T, BridgeError>
where
    G: GuestContext + ?Sized,
{
    let started = Instant::now();
    let result = call(&mut *guest);

    let bridge = guest.bridge();
    bridge.metrics().record_invocation(import, started.elapsed());
    if let Err(err) = &result {
        tracing::warn!(
            target = "nova.bridge",
            import,
            kind = err.kind(),
            error = %err,
            "bridge call failed"
        );
        bridge.metrics().record_error(import, err.kind());
    }
    result
}

fn run_callback(callback: &dyn HostCallback, args: &[HostValue]) -> Result<HostValue, BridgeError> {
    match panic::catch_unwind(AssertUnwindSafe(|| callback.call(args))) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(BridgeError::CallbackFault(err.message)),
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_owned())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic payload".to_owned());
            Err(BridgeError::CallbackFault(format!("callback panicked: {message}")))
        }
    }
}

const I64_MIN_F: f64 = -9.223_372_036_854_775_808e18;
const I64_MAX_F: f64 = 9.223_372_036_854_775_808e18;

/// Applies the coercion rules of `kind` to a callback result.
pub fn classify(value: HostValue, kind: ReturnKind) -> Result<Classified, BridgeError> {
    let invalid = |value: &HostValue| BridgeError::InvalidReturnValue {
        expected: kind,
        found: match value {
            HostValue::Null => "null",
            other => other.type_of(),
        },
    };
    if kind.requires_value() && value.is_nullish() {
        return Err(invalid(&value));
    }

    let word = |raw| Ok(Classified::Word(raw));
    match kind {
        ReturnKind::None => word(RawResult::I32(0)),
        ReturnKind::Bool => word(RawResult::I32(i32::from(value.truthy()))),
        ReturnKind::Scalar => match value {
            HostValue::Undefined | HostValue::Null => word(RawResult::I32(0)),
            HostValue::Bool(b) => word(RawResult::I32(i32::from(b))),
            HostValue::Number(n) => word(RawResult::I32(to_int32(n))),
            HostValue::BigInt(n) => word(RawResult::I32(n as i32)),
            other => Err(invalid(&other)),
        },
        ReturnKind::Int64 => match value {
            HostValue::BigInt(n) => word(RawResult::I64(n)),
            HostValue::Number(n) if n.fract() == 0.0 && (I64_MIN_F..I64_MAX_F).contains(&n) => {
                word(RawResult::I64(n as i64))
            }
            other => Err(invalid(&other)),
        },
        ReturnKind::Float64 => match value {
            HostValue::Number(n) => word(RawResult::F64(n)),
            HostValue::Bool(b) => word(RawResult::F64(f64::from(u8::from(b)))),
            HostValue::BigInt(n) => word(RawResult::F64(n as f64)),
            other => Err(invalid(&other)),
        },
        ReturnKind::Handle => Ok(Classified::Object(value)),
        ReturnKind::Text => match value {
            HostValue::String(s) => Ok(Classified::Buffer(s.into_bytes())),
            HostValue::Number(_) | HostValue::Bool(_) | HostValue::BigInt(_) => {
                Ok(Classified::Buffer(value.to_js_string().into_bytes()))
            }
            other => Err(invalid(&other)),
        },
        ReturnKind::Bytes => match value {
            HostValue::Bytes(bytes) => Ok(Classified::Buffer(bytes)),
            HostValue::String(s) => Ok(Classified::Buffer(s.into_bytes())),
            HostValue::Float32Array(items) => Ok(Classified::Buffer(
                items.into_iter().map(|v| to_uint8(f64::from(v))).collect(),
            )),
            HostValue::Float64Array(items) => Ok(Classified::Buffer(
                items.into_iter().map(to_uint8).collect(),
            )),
            HostValue::Uint32Array(items) => Ok(Classified::Buffer(
                items.into_iter().map(|v| v as u8).collect(),
            )),
            other => Err(invalid(&other)),
        },
    }
}

fn encode<G>(guest: &mut G, classified: Classified) -> Result<RawResult, BridgeError>
where
    G: GuestContext + ?Sized,
{
    match classified {
        Classified::Word(raw) => Ok(raw),
        Classified::Object(value) => {
            let handle = guest.bridge().insert_object(value)?;
            Ok(RawResult::I64(i64::from(handle.raw())))
        }
        Classified::Buffer(bytes) => {
            let limit = guest.bridge().config().limits.max_result_bytes;
            if bytes.len() > limit {
                return Err(BridgeError::LimitExceeded {
                    what: "result",
                    len: bytes.len(),
                    limit,
                });
            }
            let id = write_to_guest_memory(guest, &bytes)?;
            Ok(RawResult::I32(id as i32))
        }
    }
}
