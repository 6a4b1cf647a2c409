//! Thin wasmtime wrapper: compile a guest module, link the bridge imports, run its entrypoint.

use anyhow::Context as _;
use nova_bridge_abi::exports;
use wasmtime::{Engine, Instance, Linker, Module, Store, TypedFunc};

use crate::bridge::Bridge;
use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::linker;

fn bridge_of(bridge: &mut Bridge) -> &mut Bridge {
    bridge
}

/// Compiled guest module plus the engine it was compiled for.
pub struct BridgeModule {
    engine: Engine,
    module: Module,
}

impl BridgeModule {
    pub fn from_wasm_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        let engine = Engine::default();
        let module = Module::new(&engine, bytes).context("failed to compile wasm module")?;
        Ok(Self { engine, module })
    }

    pub fn from_wat(wat: &str) -> anyhow::Result<Self> {
        let bytes = wat::parse_str(wat).context("failed to parse wat module")?;
        Self::from_wasm_bytes(&bytes)
    }

    /// Names of the host functions the module imports.
    pub fn imports(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.module
            .imports()
            .map(|import| (import.module(), import.name()))
    }

    /// Instantiates the module against a fresh [`Bridge`] built from `config`.
    pub fn instantiate(&self, config: BridgeConfig) -> anyhow::Result<BridgeInstance> {
        self.instantiate_with(Bridge::new(config))
    }

    /// Instantiates the module against a caller-prepared bridge, e.g. one with a custom
    /// callback provider or metrics sink.
    pub fn instantiate_with(&self, bridge: Bridge) -> anyhow::Result<BridgeInstance> {
        let mut linker = Linker::new(&self.engine);
        linker::add_to_linker(&mut linker, &bridge.config().protocol, bridge_of)?;

        let mut store = Store::new(&self.engine, bridge);
        let instance = linker
            .instantiate(&mut store, &self.module)
            .context("failed to instantiate wasm module")?;
        Ok(BridgeInstance { store, instance })
    }
}

/// A running guest instance and its bridge state.
pub struct BridgeInstance {
    store: Store<Bridge>,
    instance: Instance,
}

impl BridgeInstance {
    /// Calls the guest's `main()` export.
    pub fn run_main(&mut self) -> anyhow::Result<()> {
        self.call(exports::MAIN)
    }

    /// Calls a `() -> ()` export by name.
    pub fn call(&mut self, export: &str) -> anyhow::Result<()> {
        let func: TypedFunc<(), ()> = self
            .instance
            .get_typed_func(&mut self.store, export)
            .map_err(|_| BridgeError::MissingExport(export.to_owned()))?;
        tracing::debug!(target = "nova.bridge", export, "calling guest export");
        func.call(&mut self.store, ())
            .with_context(|| format!("guest export `{export}` failed"))
    }

    /// Calls an `(i32) -> i32` export, for guests that expose helpers to the embedding.
    pub fn call_i32(&mut self, export: &str, arg: i32) -> anyhow::Result<i32> {
        let func: TypedFunc<i32, i32> = self
            .instance
            .get_typed_func(&mut self.store, export)
            .map_err(|_| BridgeError::MissingExport(export.to_owned()))?;
        func.call(&mut self.store, arg)
            .with_context(|| format!("guest export `{export}` failed"))
    }

    pub fn bridge(&self) -> &Bridge {
        self.store.data()
    }

    pub fn bridge_mut(&mut self) -> &mut Bridge {
        self.store.data_mut()
    }

    /// Guest linear memory, if the module exports one.
    pub fn memory(&mut self) -> Option<&[u8]> {
        let memory = self.instance.get_memory(&mut self.store, exports::MEMORY)?;
        Some(memory.data(&self.store))
    }
}

/// The bridge failure behind a trapped guest call, if the trap came from a bridge import.
pub fn bridge_error(err: &anyhow::Error) -> Option<&BridgeError> {
    err.downcast_ref::<BridgeError>()
        .or_else(|| err.chain().find_map(|cause| cause.downcast_ref::<BridgeError>()))
}
