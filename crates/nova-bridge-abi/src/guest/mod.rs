//! Guest-side bindings for the call bridge.
//!
//! A guest registers host callbacks by source text once and invokes them by id. Arguments are
//! encoded into a buffer in the guest's own memory; variable-length results come back as
//! allocation ids created through [`allocations::create_allocation`].
//!
//! Guests must re-export the allocation primitives with [`export_allocator!`](crate::export_allocator)
//! so the host can find them.

pub mod allocations;

use alloc::string::String;
use alloc::vec::Vec;

use crate::encode::{serialize, HostRef, InvokeParam};

#[cfg(target_arch = "wasm32")]
mod sys {
    #[link(wasm_import_module = "env")]
    extern "C" {
        pub fn __register_function(ptr: *const u8, len: u32) -> u32;
        pub fn __invoke_function(function_id: u32, ptr: *const u8, len: u32) -> u32;
        pub fn __invoke_function_and_return_object(
            function_id: u32,
            ptr: *const u8,
            len: u32,
        ) -> u64;
        pub fn __invoke_function_and_return_bigint(
            function_id: u32,
            ptr: *const u8,
            len: u32,
        ) -> i64;
        pub fn __invoke_function_and_return_number(
            function_id: u32,
            ptr: *const u8,
            len: u32,
        ) -> f64;
        pub fn __invoke_function_and_return_string(
            function_id: u32,
            ptr: *const u8,
            len: u32,
        ) -> u32;
        pub fn __invoke_function_and_return_array_buffer(
            function_id: u32,
            ptr: *const u8,
            len: u32,
        ) -> u32;
        pub fn __invoke_function_and_return_bool(function_id: u32, ptr: *const u8, len: u32)
            -> u32;
        pub fn __release_handle(handle: u32);
    }
}

// Off-target stand-ins so guest code can be unit tested natively.
#[cfg(not(target_arch = "wasm32"))]
#[allow(clippy::missing_safety_doc)]
mod sys {
    pub unsafe fn __register_function(_ptr: *const u8, _len: u32) -> u32 {
        0
    }
    pub unsafe fn __invoke_function(_id: u32, _ptr: *const u8, _len: u32) -> u32 {
        0
    }
    pub unsafe fn __invoke_function_and_return_object(_id: u32, _ptr: *const u8, _len: u32) -> u64 {
        0
    }
    pub unsafe fn __invoke_function_and_return_bigint(_id: u32, _ptr: *const u8, _len: u32) -> i64 {
        0
    }
    pub unsafe fn __invoke_function_and_return_number(_id: u32, _ptr: *const u8, _len: u32) -> f64 {
        0.0
    }
    pub unsafe fn __invoke_function_and_return_string(_id: u32, _ptr: *const u8, _len: u32) -> u32 {
        0
    }
    pub unsafe fn __invoke_function_and_return_array_buffer(
        _id: u32,
        _ptr: *const u8,
        _len: u32,
    ) -> u32 {
        0
    }
    pub unsafe fn __invoke_function_and_return_bool(_id: u32, _ptr: *const u8, _len: u32) -> u32 {
        0
    }
    pub unsafe fn __release_handle(_handle: u32) {}
}

/// A host callback registered once and invoked by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostFunction {
    pub function_id: u32,
}

impl HostFunction {
    /// Compiles `code` on the host and returns the registered callback.
    ///
    /// The host traps if `code` does not compile.
    pub fn register(code: &str) -> Self {
        // Safety: the pointer/length pair describes `code`, which outlives the call.
        let function_id = unsafe { sys::__register_function(code.as_ptr(), code.len() as u32) };
        Self { function_id }
    }

    pub fn invoke(&self, params: &[InvokeParam<'_>]) -> u32 {
        let args = serialize(params);
        // Safety: `args` and everything it points to outlive the call.
        unsafe { sys::__invoke_function(self.function_id, args.as_ptr(), args.len() as u32) }
    }

    pub fn invoke_and_return_object(&self, params: &[InvokeParam<'_>]) -> HostRef {
        let args = serialize(params);
        let handle = unsafe {
            sys::__invoke_function_and_return_object(
                self.function_id,
                args.as_ptr(),
                args.len() as u32,
            )
        };
        HostRef {
            handle: handle as u32,
        }
    }

    pub fn invoke_and_return_bigint(&self, params: &[InvokeParam<'_>]) -> i64 {
        let args = serialize(params);
        unsafe {
            sys::__invoke_function_and_return_bigint(
                self.function_id,
                args.as_ptr(),
                args.len() as u32,
            )
        }
    }

    pub fn invoke_and_return_number(&self, params: &[InvokeParam<'_>]) -> f64 {
        let args = serialize(params);
        unsafe {
            sys::__invoke_function_and_return_number(
                self.function_id,
                args.as_ptr(),
                args.len() as u32,
            )
        }
    }

    pub fn invoke_and_return_string(&self, params: &[InvokeParam<'_>]) -> String {
        let args = serialize(params);
        let allocation_id = unsafe {
            sys::__invoke_function_and_return_string(
                self.function_id,
                args.as_ptr(),
                args.len() as u32,
            )
        };
        allocations::take_string(allocation_id)
    }

    pub fn invoke_and_return_array_buffer(&self, params: &[InvokeParam<'_>]) -> Vec<u8> {
        let args = serialize(params);
        let allocation_id = unsafe {
            sys::__invoke_function_and_return_array_buffer(
                self.function_id,
                args.as_ptr(),
                args.len() as u32,
            )
        };
        allocations::take_bytes(allocation_id)
    }

    pub fn invoke_and_return_bool(&self, params: &[InvokeParam<'_>]) -> bool {
        let args = serialize(params);
        let ret = unsafe {
            sys::__invoke_function_and_return_bool(
                self.function_id,
                args.as_ptr(),
                args.len() as u32,
            )
        };
        ret != 0
    }
}

/// Returns `object` to the host; the handle must not be used afterwards.
pub fn release(object: HostRef) {
    if object.is_none() {
        return;
    }
    // Safety: plain integer argument.
    unsafe { sys::__release_handle(object.handle) }
}
