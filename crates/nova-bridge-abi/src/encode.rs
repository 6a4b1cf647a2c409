use alloc::vec::Vec;

use crate::tags;

/// Opaque handle to a host-owned object, as returned by an object-returning call.
///
/// `0` never names a live object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostRef {
    pub handle: u32,
}

impl HostRef {
    pub const NONE: HostRef = HostRef { handle: 0 };

    #[inline]
    pub const fn is_none(self) -> bool {
        self.handle == 0
    }
}

/// Incremental writer for an argument buffer.
///
/// Pointer-bearing values are written as raw `(ptr, len)` pairs; the caller is responsible for
/// keeping the referenced memory alive until the host call returns.
#[derive(Debug, Default, Clone)]
pub struct ArgsEncoder {
    buf: Vec<u8>,
}

impl ArgsEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn undefined(&mut self) -> &mut Self {
        self.buf.push(tags::UNDEFINED);
        self
    }

    pub fn null(&mut self) -> &mut Self {
        self.buf.push(tags::NULL);
        self
    }

    pub fn f64(&mut self, value: f64) -> &mut Self {
        self.buf.push(tags::FLOAT64);
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn i64(&mut self, value: i64) -> &mut Self {
        self.buf.push(tags::INT64);
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn bool(&mut self, value: bool) -> &mut Self {
        self.buf.push(if value { tags::TRUE } else { tags::FALSE });
        self
    }

    pub fn handle(&mut self, handle: u32) -> &mut Self {
        self.buf.push(tags::OBJECT_HANDLE);
        self.buf.extend_from_slice(&handle.to_le_bytes());
        self
    }

    /// `len` is the UTF-8 byte length.
    pub fn string_at(&mut self, ptr: u32, len: u32) -> &mut Self {
        self.pointer(tags::UTF8_STRING, ptr, len)
    }

    /// `len` is the element count, not the byte length.
    pub fn f32_array_at(&mut self, ptr: u32, len: u32) -> &mut Self {
        self.pointer(tags::FLOAT32_ARRAY, ptr, len)
    }

    pub fn f64_array_at(&mut self, ptr: u32, len: u32) -> &mut Self {
        self.pointer(tags::FLOAT64_ARRAY, ptr, len)
    }

    pub fn u32_array_at(&mut self, ptr: u32, len: u32) -> &mut Self {
        self.pointer(tags::UINT32_ARRAY, ptr, len)
    }

    /// Appends an arbitrary byte, valid or not. Used to exercise host-side tag validation.
    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    fn pointer(&mut self, tag: u8, ptr: u32, len: u32) -> &mut Self {
        self.buf.push(tag);
        self.buf.extend_from_slice(&ptr.to_le_bytes());
        self.buf.extend_from_slice(&len.to_le_bytes());
        self
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// A single argument as seen from guest code.
///
/// Borrowed forms are encoded by address, so they are only meaningful when the encoder runs
/// inside the guest (32-bit linear memory).
#[derive(Debug, Clone, Copy)]
pub enum InvokeParam<'a> {
    Undefined,
    Null,
    Float64(f64),
    BigInt(i64),
    String(&'a str),
    HostRef(HostRef),
    Float32Array(&'a [f32]),
    Float64Array(&'a [f64]),
    Bool(bool),
    Uint32Array(&'a [u32]),
}

impl InvokeParam<'_> {
    pub fn encode_into(&self, out: &mut ArgsEncoder) {
        match *self {
            InvokeParam::Undefined => out.undefined(),
            InvokeParam::Null => out.null(),
            InvokeParam::Float64(v) => out.f64(v),
            InvokeParam::BigInt(v) => out.i64(v),
            InvokeParam::String(s) => out.string_at(addr(s.as_ptr()), len32(s.len())),
            InvokeParam::HostRef(r) => out.handle(r.handle),
            InvokeParam::Float32Array(a) => out.f32_array_at(addr(a.as_ptr()), len32(a.len())),
            InvokeParam::Float64Array(a) => out.f64_array_at(addr(a.as_ptr()), len32(a.len())),
            InvokeParam::Bool(v) => out.bool(v),
            InvokeParam::Uint32Array(a) => out.u32_array_at(addr(a.as_ptr()), len32(a.len())),
        };
    }
}

/// Serializes `params` into a fresh argument buffer.
pub fn serialize(params: &[InvokeParam<'_>]) -> Vec<u8> {
    let mut out = ArgsEncoder::new();
    for param in params {
        param.encode_into(&mut out);
    }
    out.finish()
}

#[inline]
fn addr<T>(ptr: *const T) -> u32 {
    // Linear memory addresses fit in 32 bits on wasm32.
    ptr as usize as u32
}

#[inline]
fn len32(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

impl<'a> From<&'a str> for InvokeParam<'a> {
    fn from(value: &'a str) -> Self {
        InvokeParam::String(value)
    }
}

impl<'a> From<&'a alloc::string::String> for InvokeParam<'a> {
    fn from(value: &'a alloc::string::String) -> Self {
        InvokeParam::String(value.as_str())
    }
}

impl From<f64> for InvokeParam<'_> {
    fn from(value: f64) -> Self {
        InvokeParam::Float64(value)
    }
}

impl From<i64> for InvokeParam<'_> {
    fn from(value: i64) -> Self {
        InvokeParam::BigInt(value)
    }
}

impl From<bool> for InvokeParam<'_> {
    fn from(value: bool) -> Self {
        InvokeParam::Bool(value)
    }
}

impl From<HostRef> for InvokeParam<'_> {
    fn from(value: HostRef) -> Self {
        InvokeParam::HostRef(value)
    }
}

impl From<&HostRef> for InvokeParam<'_> {
    fn from(value: &HostRef) -> Self {
        InvokeParam::HostRef(*value)
    }
}

impl<'a> From<&'a [f32]> for InvokeParam<'a> {
    fn from(value: &'a [f32]) -> Self {
        InvokeParam::Float32Array(value)
    }
}

impl<'a> From<&'a [f64]> for InvokeParam<'a> {
    fn from(value: &'a [f64]) -> Self {
        InvokeParam::Float64Array(value)
    }
}

impl<'a> From<&'a [u32]> for InvokeParam<'a> {
    fn from(value: &'a [u32]) -> Self {
        InvokeParam::Uint32Array(value)
    }
}
