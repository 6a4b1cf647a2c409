//! Registers the bridge imports on a [`wasmtime::Linker`].
//!
//! Every import reaches the guest's [`Bridge`] through the store data and talks to the guest's
//! memory and allocator through the calling instance's exports. A [`BridgeError`] becomes a trap;
//! embedders can recover it with `err.downcast_ref::<BridgeError>()`.

use nova_bridge_abi::{exports, imports, ReturnKind};
use wasmtime::{Caller, Extern, Linker, Memory, TypedFunc};

use crate::allocation::GuestAllocator;
use crate::bridge::Bridge;
use crate::config::ProtocolConfig;
use crate::dispatch::{self, GuestContext, InvocationTarget, RawResult};
use crate::error::BridgeError;
use crate::registry::CallbackId;

/// Guest view of one import call: the caller's memory, allocator exports and bridge state.
struct CallerGuest<'a, 'c, T, G> {
    caller: &'a mut Caller<'c, T>,
    memory: Memory,
    get: G,
}

impl<'a, 'c, T, G> CallerGuest<'a, 'c, T, G>
where
    G: Fn(&mut T) -> &mut Bridge,
{
    fn new(caller: &'a mut Caller<'c, T>, get: G) -> Result<Self, BridgeError> {
        let memory = caller
            .get_export(exports::MEMORY)
            .and_then(Extern::into_memory)
            .ok_or_else(|| BridgeError::MissingExport(exports::MEMORY.to_owned()))?;
        Ok(Self {
            caller,
            memory,
            get,
        })
    }

    /// First export among `names` that exists, typed as `(u32) -> u32`.
    fn allocator_export(
        &mut self,
        names: &[&'static str],
    ) -> Result<(&'static str, TypedFunc<u32, u32>), BridgeError> {
        for &name in names {
            let Some(func) = self.caller.get_export(name).and_then(Extern::into_func) else {
                continue;
            };
            let typed = func
                .typed::<u32, u32>(&*self.caller)
                .map_err(|err| BridgeError::GuestCall {
                    export: name,
                    message: err.to_string(),
                })?;
            return Ok((name, typed));
        }
        Err(BridgeError::MissingExport(names.join(" or ")))
    }

    fn call_allocator(&mut self, names: &[&'static str], arg: u32) -> Result<u32, BridgeError> {
        let (name, func) = self.allocator_export(names)?;
        func.call(&mut *self.caller, arg)
            .map_err(|err| BridgeError::GuestCall {
                export: name,
                message: format!("{err:#}"),
            })
    }
}

impl<T, G> GuestAllocator for CallerGuest<'_, '_, T, G>
where
    G: Fn(&mut T) -> &mut Bridge,
{
    fn create_allocation(&mut self, len: u32) -> Result<u32, BridgeError> {
        self.call_allocator(&[exports::CREATE_ALLOCATION], len)
    }

    fn allocation_pointer(&mut self, id: u32) -> Result<u32, BridgeError> {
        self.call_allocator(
            &[exports::ALLOCATION_POINTER, exports::ALLOCATION_POINTER_LEGACY],
            id,
        )
    }

    fn memory_mut(&mut self) -> &mut [u8] {
        self.memory.data_mut(&mut *self.caller)
    }
}

impl<T, G> GuestContext for CallerGuest<'_, '_, T, G>
where
    G: Fn(&mut T) -> &mut Bridge,
{
    fn memory_and_bridge(&mut self) -> (&[u8], &mut Bridge) {
        let (memory, data) = self.memory.data_and_store_mut(&mut *self.caller);
        (memory, (self.get)(data))
    }
}

fn invoke_with<T, G>(
    caller: &mut Caller<'_, T>,
    get: G,
    import: &'static str,
    target: InvocationTarget,
    args_ptr: u32,
    args_len: u32,
    kind: ReturnKind,
) -> Result<RawResult, BridgeError>
where
    G: Fn(&mut T) -> &mut Bridge,
{
    let mut guest = CallerGuest::new(caller, get)?;
    dispatch::invoke(&mut guest, import, target, args_ptr, args_len, kind)
}

/// Adds the bridge imports to `linker` under `protocol.import_module`.
///
/// `get` projects the store data onto the guest's [`Bridge`]. The legacy inline-source imports
/// are only linked when `protocol.legacy_inline_calls` is set.
pub fn add_to_linker<T, G>(
    linker: &mut Linker<T>,
    protocol: &ProtocolConfig,
    get: G,
) -> anyhow::Result<()>
where
    T: 'static,
    G: Fn(&mut T) -> &mut Bridge + Send + Sync + Copy + 'static,
{
    let module = protocol.import_module.as_str();

    linker.func_wrap(
        module,
        imports::REGISTER_FUNCTION,
        move |mut caller: Caller<'_, T>, src_ptr: u32, src_len: u32| -> anyhow::Result<u32> {
            let mut guest = CallerGuest::new(&mut caller, get)?;
            let id = dispatch::register(&mut guest, imports::REGISTER_FUNCTION, src_ptr, src_len)?;
            Ok(id.raw())
        },
    )?;

    linker.func_wrap(
        module,
        imports::RELEASE_HANDLE,
        move |mut caller: Caller<'_, T>, handle: u32| -> anyhow::Result<()> {
            let mut guest = CallerGuest::new(&mut caller, get)?;
            dispatch::release(&mut guest, imports::RELEASE_HANDLE, handle)?;
            Ok(())
        },
    )?;

    // `(id, args_ptr, args_len)` imports, one per return kind.
    macro_rules! registered {
        ($name:expr, $kind:expr, $ret:ty, $convert:ident) => {
            linker.func_wrap(
                module,
                $name,
                move |mut caller: Caller<'_, T>,
                      id: u32,
                      args_ptr: u32,
                      args_len: u32|
                      -> anyhow::Result<$ret> {
                    let target = InvocationTarget::Registered(CallbackId::from_raw(id));
                    let raw = invoke_with(&mut caller, get, $name, target, args_ptr, args_len, $kind)?;
                    Ok(raw.$convert())
                },
            )?;
        };
    }

    registered!(imports::INVOKE_FUNCTION, ReturnKind::Scalar, i32, as_i32);
    registered!(imports::INVOKE_FUNCTION_AND_RETURN_OBJECT, ReturnKind::Handle, i64, as_i64);
    registered!(imports::INVOKE_FUNCTION_AND_RETURN_BOOL, ReturnKind::Bool, i32, as_i32);
    registered!(imports::INVOKE_FUNCTION_AND_RETURN_BIGINT, ReturnKind::Int64, i64, as_i64);
    registered!(imports::INVOKE_FUNCTION_AND_RETURN_NUMBER, ReturnKind::Float64, f64, as_f64);
    registered!(imports::INVOKE_FUNCTION_AND_RETURN_STRING, ReturnKind::Text, i32, as_i32);
    registered!(imports::INVOKE_FUNCTION_AND_RETURN_ARRAY_BUFFER, ReturnKind::Bytes, i32, as_i32);

    linker.func_wrap(
        module,
        imports::INVOKE,
        move |mut caller: Caller<'_, T>,
              code_ptr_or_id: u32,
              code_len: u32,
              args_ptr: u32,
              args_len: u32,
              return_kind: i32|
              -> anyhow::Result<i64> {
            let kind =
                ReturnKind::from_code(return_kind).ok_or(BridgeError::UnknownReturnKind(return_kind))?;
            let target = InvocationTarget::from_unified(code_ptr_or_id, code_len);
            let raw = invoke_with(&mut caller, get, imports::INVOKE, target, args_ptr, args_len, kind)?;
            Ok(raw.to_word())
        },
    )?;

    if !protocol.legacy_inline_calls {
        return Ok(());
    }

    // `(code_ptr, code_len, args_ptr, args_len)` imports compiling the source on every call.
    macro_rules! inline {
        ($name:expr, $kind:expr, $ret:ty, $convert:ident) => {
            linker.func_wrap(
                module,
                $name,
                move |mut caller: Caller<'_, T>,
                      code_ptr: u32,
                      code_len: u32,
                      args_ptr: u32,
                      args_len: u32|
                      -> anyhow::Result<$ret> {
                    let target = InvocationTarget::Inline { code_ptr, code_len };
                    let raw = invoke_with(&mut caller, get, $name, target, args_ptr, args_len, $kind)?;
                    Ok(raw.$convert())
                },
            )?;
        };
    }

    inline!(imports::INVOKE_AND_RETURN, ReturnKind::Scalar, i32, as_i32);
    inline!(imports::INVOKE_AND_RETURN_NUMBER, ReturnKind::Float64, f64, as_f64);
    inline!(imports::INVOKE_AND_RETURN_REF, ReturnKind::Handle, i64, as_i64);
    inline!(imports::INVOKE_AND_RETURN_BIGINT, ReturnKind::Int64, i64, as_i64);
    inline!(imports::INVOKE_AND_RETURN_STRING, ReturnKind::Text, i32, as_i32);
    inline!(imports::INVOKE_AND_RETURN_ARRAY_BUFFER, ReturnKind::Bytes, i32, as_i32);

    Ok(())
}
