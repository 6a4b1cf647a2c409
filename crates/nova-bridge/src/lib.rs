//! Host side of the Nova guest/host call bridge.
//!
//! A guest module without strings or references of its own calls host callbacks through a small
//! set of imports: it registers callback source once, encodes arguments into a tagged buffer in
//! its own memory, and gets back a single machine word (a scalar, an object handle, or the id of
//! a guest allocation holding text or bytes).
//!
//! The protocol core ([`codec`], [`HandleTable`], [`CallbackRegistry`], [`dispatch`] and
//! [`allocation`]) is independent of any wasm engine. With the default `wasmtime` feature,
//! [`linker::add_to_linker`] registers the imports on a `wasmtime::Linker` and [`runtime`]
//! instantiates and runs a guest module.

pub mod allocation;
mod bridge;
pub mod codec;
pub mod config;
pub mod dispatch;
mod error;
pub mod handles;
mod metrics;
mod provider;
mod registry;
pub mod script;
pub mod value;

#[cfg(feature = "wasmtime")]
pub mod linker;
#[cfg(feature = "wasmtime")]
pub mod runtime;

pub use allocation::{write_to_guest_memory, GuestAllocator};
pub use bridge::Bridge;
pub use codec::{DecodeError, Value};
pub use config::{BridgeConfig, ConfigError, LimitsConfig, LoggingConfig, ProtocolConfig};
pub use dispatch::{GuestContext, InvocationTarget, RawResult};
pub use error::BridgeError;
pub use handles::{Handle, HandleError, HandleTable};
pub use metrics::{BridgeMetricsSink, NoopMetricsSink, TestMetricsSink, TestMetricsSnapshot};
pub use provider::{CallbackError, CallbackProvider, CompileError, HostCallback, NativeProvider};
pub use registry::{CallbackId, CallbackRegistry, RegistryError};
pub use script::ScriptProvider;
pub use value::{HostObject, HostValue, PropertyMap};

pub use nova_bridge_abi::{ReturnKind, PROTOCOL_VERSION};

#[cfg(feature = "wasmtime")]
pub use runtime::{bridge_error, BridgeInstance, BridgeModule};
