use std::fmt;
use std::sync::Arc;

use crate::codec::{self, Value};
use crate::config::BridgeConfig;
use crate::dispatch::InvocationTarget;
use crate::error::BridgeError;
use crate::handles::{Handle, HandleTable};
use crate::metrics::{BridgeMetricsSink, NoopMetricsSink};
use crate::provider::{CallbackProvider, HostCallback};
use crate::registry::{CallbackId, CallbackRegistry};
use crate::script::ScriptProvider;
use crate::value::HostValue;

/// Per-guest bridge state: the callback registry and the object reference table.
///
/// One `Bridge` serves one guest instance; in the wasmtime embedding it lives in the `Store`
/// data and every import reaches it through the caller.
pub struct Bridge {
    config: BridgeConfig,
    registry: CallbackRegistry,
    handles: HandleTable<HostValue>,
    metrics: Arc<dyn BridgeMetricsSink>,
}

impl fmt::Debug for Bridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bridge")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("handles", &self.handles)
            .finish_non_exhaustive()
    }
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new(BridgeConfig::default())
    }
}

impl Bridge {
    /// Bridge compiling callbacks with the default [`ScriptProvider`].
    pub fn new(config: BridgeConfig) -> Self {
        Self::with_provider(Arc::new(ScriptProvider::default()), config)
    }

    pub fn with_provider(provider: Arc<dyn CallbackProvider>, config: BridgeConfig) -> Self {
        let registry = CallbackRegistry::new(provider, &config.limits);
        let handles = HandleTable::with_limit(config.limits.max_handles);
        Self {
            config,
            registry,
            handles,
            metrics: Arc::new(NoopMetricsSink),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn BridgeMetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn registry(&self) -> &CallbackRegistry {
        &self.registry
    }

    pub fn handles(&self) -> &HandleTable<HostValue> {
        &self.handles
    }

    pub fn metrics(&self) -> &dyn BridgeMetricsSink {
        self.metrics.as_ref()
    }

    pub fn register(&mut self, source: &str) -> Result<CallbackId, BridgeError> {
        Ok(self.registry.register(source)?)
    }

    /// Stores `value` in the reference table, e.g. to hand a host object to the guest.
    pub fn insert_object(&mut self, value: HostValue) -> Result<Handle, BridgeError> {
        let handle = self.handles.allocate(value)?;
        tracing::trace!(target = "nova.bridge", handle = handle.raw(), "allocated handle");
        Ok(handle)
    }

    pub fn object(&self, handle: Handle) -> Result<&HostValue, BridgeError> {
        Ok(self.handles.resolve(handle)?)
    }

    /// Drops the table's reference for a guest-supplied handle.
    pub fn release_handle(&mut self, raw: u32) -> Result<HostValue, BridgeError> {
        let value = self.handles.deallocate_raw(raw)?;
        tracing::trace!(target = "nova.bridge", handle = raw, "released handle");
        Ok(value)
    }

    /// Decodes an argument buffer and resolves object handles against the reference table.
    pub fn decode_args(
        &self,
        memory: &[u8],
        args_ptr: u32,
        args_len: u32,
    ) -> Result<Vec<HostValue>, BridgeError> {
        let limit = self.config.limits.max_args_bytes;
        if args_len as usize > limit {
            return Err(BridgeError::LimitExceeded {
                what: "argument buffer",
                len: args_len as usize,
                limit,
            });
        }

        codec::decode(memory, args_ptr, args_len)?
            .into_iter()
            .map(|value| self.host_value(value))
            .collect()
    }

    /// Looks up a registered callback or compiles inline source read from guest memory.
    pub fn resolve_target(
        &self,
        memory: &[u8],
        target: InvocationTarget,
    ) -> Result<Arc<dyn HostCallback>, BridgeError> {
        match target {
            InvocationTarget::Registered(id) => Ok(self.registry.get(id)?),
            InvocationTarget::Inline { code_ptr, code_len } => {
                if !self.config.protocol.legacy_inline_calls {
                    return Err(BridgeError::LegacyCallsDisabled);
                }
                let source = read_source(memory, code_ptr, code_len)?;
                Ok(self.registry.compile_inline(&source)?)
            }
        }
    }

    fn host_value(&self, value: Value) -> Result<HostValue, BridgeError> {
        Ok(match value {
            Value::Undefined => HostValue::Undefined,
            Value::Null => HostValue::Null,
            Value::Bool(b) => HostValue::Bool(b),
            Value::Float64(n) => HostValue::Number(n),
            Value::Int64(n) => HostValue::BigInt(n),
            Value::Utf8String(s) => HostValue::String(s),
            Value::ObjectHandle(raw) => self.handles.resolve_raw(raw)?.clone(),
            Value::Float32Array(items) => HostValue::Float32Array(items),
            Value::Float64Array(items) => HostValue::Float64Array(items),
            Value::Uint32Array(items) => HostValue::Uint32Array(items),
        })
    }
}

/// Callback source text at `memory[ptr..ptr + len]`, decoded lossily.
pub(crate) fn read_source(memory: &[u8], ptr: u32, len: u32) -> Result<String, BridgeError> {
    let bytes = codec::guest_slice(memory, ptr, u64::from(len))?;
    Ok(String::from_utf8_lossy(bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimitsConfig;
    use crate::handles::HandleError;
    use nova_bridge_abi::ArgsEncoder;

    #[test]
    fn handles_in_arguments_resolve_to_stored_objects() {
        let mut bridge = Bridge::default();
        let handle = bridge.insert_object(HostValue::from("node")).unwrap();

        let mut enc = ArgsEncoder::new();
        enc.handle(handle.raw()).f64(1.5);
        let memory = enc.finish();

        let args = bridge.decode_args(&memory, 0, memory.len() as u32).unwrap();
        assert_eq!(args, vec![HostValue::from("node"), HostValue::Number(1.5)]);
    }

    #[test]
    fn zero_and_released_handles_fail_to_decode() {
        let mut bridge = Bridge::default();
        let handle = bridge.insert_object(HostValue::Null).unwrap();
        bridge.release_handle(handle.raw()).unwrap();

        for raw in [0, handle.raw()] {
            let mut enc = ArgsEncoder::new();
            enc.handle(raw);
            let memory = enc.finish();
            let err = bridge.decode_args(&memory, 0, memory.len() as u32).unwrap_err();
            assert!(
                matches!(err, BridgeError::Handle(HandleError::InvalidHandle(r)) if r == raw),
                "{err:?}"
            );
        }
    }

    #[test]
    fn handles_with_empty_slot_bits_are_invalid() {
        let mut bridge = Bridge::default();
        bridge.insert_object(HostValue::Null).unwrap();
        let raw = 0x0100_0000;

        let mut enc = ArgsEncoder::new();
        enc.handle(raw);
        let memory = enc.finish();
        let err = bridge.decode_args(&memory, 0, memory.len() as u32).unwrap_err();
        assert_eq!(err.kind(), "invalid_handle");

        let err = bridge.release_handle(raw).unwrap_err();
        assert_eq!(err.kind(), "invalid_handle");
        assert_eq!(bridge.handles().len(), 1);
    }

    #[test]
    fn release_twice_is_a_double_free() {
        let mut bridge = Bridge::default();
        let handle = bridge.insert_object(HostValue::Bool(true)).unwrap();
        assert_eq!(bridge.release_handle(handle.raw()).unwrap(), HostValue::Bool(true));
        assert_eq!(bridge.release_handle(handle.raw()).unwrap_err().kind(), "double_free");
    }

    #[test]
    fn oversized_argument_buffers_are_rejected() {
        let bridge = Bridge::new(BridgeConfig {
            limits: LimitsConfig {
                max_args_bytes: 4,
                ..LimitsConfig::default()
            },
            ..BridgeConfig::default()
        });
        let memory = [0u8; 16];
        let err = bridge.decode_args(&memory, 0, 8).unwrap_err();
        assert!(matches!(err, BridgeError::LimitExceeded { len: 8, limit: 4, .. }), "{err:?}");
    }

    #[test]
    fn inline_targets_respect_the_protocol_switch() {
        let source = b"() => 1";
        let target = InvocationTarget::Inline {
            code_ptr: 0,
            code_len: source.len() as u32,
        };

        let bridge = Bridge::default();
        assert!(bridge.resolve_target(source, target).is_ok());

        let mut config = BridgeConfig::default();
        config.protocol.legacy_inline_calls = false;
        let bridge = Bridge::new(config);
        assert!(matches!(
            bridge.resolve_target(source, target),
            Err(BridgeError::LegacyCallsDisabled)
        ));
    }
}
