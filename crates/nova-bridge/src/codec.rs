//! Decoder for the guest's argument buffer.
//!
//! The buffer is a back-to-back sequence of `[tag, payload...]` entries read strictly left to
//! right. Pointer-bearing entries reference other regions of guest memory; their contents are
//! copied out immediately so nothing borrowed from guest memory outlives the call.

use nova_bridge_abi::tags;
use thiserror::Error;

use crate::handles::Handle;

/// A decoded argument.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Undefined,
    Null,
    Float64(f64),
    Int64(i64),
    Utf8String(String),
    /// Raw handle as sent by the guest; resolved against the reference table by the dispatcher.
    ObjectHandle(u32),
    Float32Array(Vec<f32>),
    Float64Array(Vec<f64>),
    Uint32Array(Vec<u32>),
    Bool(bool),
}

impl Value {
    /// Wire tag this value was decoded from.
    pub fn tag(&self) -> u8 {
        match self {
            Value::Undefined => tags::UNDEFINED,
            Value::Null => tags::NULL,
            Value::Float64(_) => tags::FLOAT64,
            Value::Int64(_) => tags::INT64,
            Value::Utf8String(_) => tags::UTF8_STRING,
            Value::ObjectHandle(_) => tags::OBJECT_HANDLE,
            Value::Float32Array(_) => tags::FLOAT32_ARRAY,
            Value::Float64Array(_) => tags::FLOAT64_ARRAY,
            Value::Uint32Array(_) => tags::UINT32_ARRAY,
            Value::Bool(true) => tags::TRUE,
            Value::Bool(false) => tags::FALSE,
        }
    }

    pub fn handle(&self) -> Option<Handle> {
        match self {
            Value::ObjectHandle(raw) => Handle::from_raw(*raw),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unrecognized argument tag {tag} at offset {offset}")]
    UnrecognizedTag { tag: u8, offset: usize },
    #[error(
        "truncated argument buffer: tag {tag} at offset {offset} needs {needed} payload bytes, {remaining} remain"
    )]
    TruncatedBuffer {
        tag: u8,
        offset: usize,
        needed: usize,
        remaining: usize,
    },
    #[error("guest memory access out of bounds: ptr={ptr} len={len} memory_size={memory_size}")]
    MemoryOutOfBounds {
        ptr: u32,
        len: u64,
        memory_size: usize,
    },
    #[error("typed array of {count} elements at ptr={ptr} overflows the address space")]
    LengthOverflow { ptr: u32, count: u32 },
}

/// Returns `memory[ptr..ptr + len]`, rejecting regions that leave guest memory.
pub fn guest_slice(memory: &[u8], ptr: u32, len: u64) -> Result<&[u8], DecodeError> {
    let out_of_bounds = || DecodeError::MemoryOutOfBounds {
        ptr,
        len,
        memory_size: memory.len(),
    };
    let start = ptr as usize;
    let len = usize::try_from(len).map_err(|_| out_of_bounds())?;
    let end = start.checked_add(len).ok_or_else(out_of_bounds)?;
    memory.get(start..end).ok_or_else(out_of_bounds)
}

/// Decodes the argument buffer at `memory[args_ptr..args_ptr + args_len]`.
pub fn decode(memory: &[u8], args_ptr: u32, args_len: u32) -> Result<Vec<Value>, DecodeError> {
    let buf = guest_slice(memory, args_ptr, u64::from(args_len))?;
    decode_buffer(memory, buf)
}

/// Decodes an argument buffer that has already been located. Pointer payloads are resolved
/// against `memory`.
pub fn decode_buffer(memory: &[u8], buf: &[u8]) -> Result<Vec<Value>, DecodeError> {
    let mut reader = Reader { buf, pos: 0 };
    let mut values = Vec::new();

    while let Some((offset, tag)) = reader.next_tag() {
        let Some(needed) = tags::payload_len(tag) else {
            return Err(DecodeError::UnrecognizedTag { tag, offset });
        };
        let payload = reader.take(needed).ok_or(DecodeError::TruncatedBuffer {
            tag,
            offset,
            needed,
            remaining: reader.remaining(),
        })?;

        let value = match tag {
            tags::UNDEFINED => Value::Undefined,
            tags::NULL => Value::Null,
            tags::TRUE => Value::Bool(true),
            tags::FALSE => Value::Bool(false),
            tags::FLOAT64 => Value::Float64(f64::from_le_bytes(le8(payload))),
            tags::INT64 => Value::Int64(i64::from_le_bytes(le8(payload))),
            tags::OBJECT_HANDLE => Value::ObjectHandle(u32::from_le_bytes(le4(payload))),
            tags::UTF8_STRING => {
                let (ptr, len) = ptr_len(payload);
                let bytes = guest_slice(memory, ptr, u64::from(len))?;
                Value::Utf8String(String::from_utf8_lossy(bytes).into_owned())
            }
            tags::FLOAT32_ARRAY => {
                let bytes = typed_slice(memory, payload, 4)?;
                Value::Float32Array(
                    bytes
                        .chunks_exact(4)
                        .map(|c| f32::from_le_bytes(le4(c)))
                        .collect(),
                )
            }
            tags::FLOAT64_ARRAY => {
                let bytes = typed_slice(memory, payload, 8)?;
                Value::Float64Array(
                    bytes
                        .chunks_exact(8)
                        .map(|c| f64::from_le_bytes(le8(c)))
                        .collect(),
                )
            }
            tags::UINT32_ARRAY => {
                let bytes = typed_slice(memory, payload, 4)?;
                Value::Uint32Array(
                    bytes
                        .chunks_exact(4)
                        .map(|c| u32::from_le_bytes(le4(c)))
                        .collect(),
                )
            }
            _ => return Err(DecodeError::UnrecognizedTag { tag, offset }),
        };
        values.push(value);
    }

    Ok(values)
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn next_tag(&mut self) -> Option<(usize, u8)> {
        let offset = self.pos;
        let tag = *self.buf.get(offset)?;
        self.pos += 1;
        Some((offset, tag))
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let out = self.buf.get(self.pos..self.pos.checked_add(n)?)?;
        self.pos += n;
        Some(out)
    }

    fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }
}

fn typed_slice<'m>(memory: &'m [u8], payload: &[u8], elem_size: u32) -> Result<&'m [u8], DecodeError> {
    let (ptr, count) = ptr_len(payload);
    let byte_len = u64::from(count)
        .checked_mul(u64::from(elem_size))
        .ok_or(DecodeError::LengthOverflow { ptr, count })?;
    guest_slice(memory, ptr, byte_len)
}

fn ptr_len(payload: &[u8]) -> (u32, u32) {
    let ptr = u32::from_le_bytes(le4(&payload[..4]));
    let len = u32::from_le_bytes(le4(&payload[4..8]));
    (ptr, len)
}

fn le4(bytes: &[u8]) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(&bytes[..4]);
    out
}

fn le8(bytes: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&bytes[..8]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use nova_bridge_abi::ArgsEncoder;
    use pretty_assertions::assert_eq;

    /// Guest memory with the argument buffer placed at `ARGS_AT` and free space before it for
    /// pointer payloads.
    const ARGS_AT: u32 = 512;

    fn memory_with(args: &[u8], data: &[(u32, &[u8])]) -> Vec<u8> {
        let mut memory = vec![0u8; 1024];
        for (at, bytes) in data {
            let at = *at as usize;
            memory[at..at + bytes.len()].copy_from_slice(bytes);
        }
        memory[ARGS_AT as usize..ARGS_AT as usize + args.len()].copy_from_slice(args);
        memory
    }

    fn decode_args(args: &[u8], data: &[(u32, &[u8])]) -> Result<Vec<Value>, DecodeError> {
        let memory = memory_with(args, data);
        decode(&memory, ARGS_AT, args.len() as u32)
    }

    #[test]
    fn decodes_every_scalar_tag() {
        let mut enc = ArgsEncoder::new();
        enc.undefined()
            .null()
            .f64(42.42)
            .i64(42)
            .bool(true)
            .bool(false)
            .handle(7);

        let values = decode_args(enc.as_bytes(), &[]).unwrap();
        assert_eq!(
            values,
            vec![
                Value::Undefined,
                Value::Null,
                Value::Float64(42.42),
                Value::Int64(42),
                Value::Bool(true),
                Value::Bool(false),
                Value::ObjectHandle(7),
            ]
        );
    }

    #[test]
    fn empty_pointer_forms_decode_to_empty_values() {
        let mut enc = ArgsEncoder::new();
        enc.string_at(0, 0)
            .f32_array_at(0, 0)
            .f64_array_at(0, 0)
            .u32_array_at(0, 0);

        let values = decode_args(enc.as_bytes(), &[]).unwrap();
        assert_eq!(
            values,
            vec![
                Value::Utf8String(String::new()),
                Value::Float32Array(Vec::new()),
                Value::Float64Array(Vec::new()),
                Value::Uint32Array(Vec::new()),
            ]
        );
    }

    #[test]
    fn pointer_forms_copy_guest_memory() {
        let floats: Vec<u8> = [1.5f32, -2.0].iter().flat_map(|f| f.to_le_bytes()).collect();
        let doubles: Vec<u8> = [0.25f64].iter().flat_map(|f| f.to_le_bytes()).collect();
        let words: Vec<u8> = [1u32, 0xDEAD_BEEF].iter().flat_map(|w| w.to_le_bytes()).collect();

        let mut enc = ArgsEncoder::new();
        enc.string_at(16, 5)
            .f32_array_at(64, 2)
            .f64_array_at(96, 1)
            .u32_array_at(128, 2);

        let values = decode_args(
            enc.as_bytes(),
            &[(16, b"hello"), (64, &floats), (96, &doubles), (128, &words)],
        )
        .unwrap();
        assert_eq!(
            values,
            vec![
                Value::Utf8String("hello".into()),
                Value::Float32Array(vec![1.5, -2.0]),
                Value::Float64Array(vec![0.25]),
                Value::Uint32Array(vec![1, 0xDEAD_BEEF]),
            ]
        );
    }

    #[test]
    fn unaligned_typed_arrays_are_fine() {
        let words: Vec<u8> = [3u32, 4].iter().flat_map(|w| w.to_le_bytes()).collect();
        let mut enc = ArgsEncoder::new();
        enc.u32_array_at(33, 2);
        let values = decode_args(enc.as_bytes(), &[(33, &words)]).unwrap();
        assert_eq!(values, vec![Value::Uint32Array(vec![3, 4])]);
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let mut enc = ArgsEncoder::new();
        enc.string_at(8, 3);
        let values = decode_args(enc.as_bytes(), &[(8, &[b'a', 0xC3, b'b'])]).unwrap();
        assert_eq!(values, vec![Value::Utf8String("a\u{FFFD}b".into())]);
    }

    #[test]
    fn unknown_tag_aborts_decoding() {
        let mut enc = ArgsEncoder::new();
        enc.null().raw(&[11]).null();
        let err = decode_args(enc.as_bytes(), &[]).unwrap_err();
        assert_eq!(err, DecodeError::UnrecognizedTag { tag: 11, offset: 1 });
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let mut enc = ArgsEncoder::new();
        enc.raw(&[tags::FLOAT64, 0, 0, 0]);
        let err = decode_args(enc.as_bytes(), &[]).unwrap_err();
        assert_eq!(
            err,
            DecodeError::TruncatedBuffer {
                tag: tags::FLOAT64,
                offset: 0,
                needed: 8,
                remaining: 3,
            }
        );

        let mut enc = ArgsEncoder::new();
        enc.undefined().raw(&[tags::OBJECT_HANDLE, 1]);
        assert!(matches!(
            decode_args(enc.as_bytes(), &[]),
            Err(DecodeError::TruncatedBuffer { offset: 1, needed: 4, .. })
        ));
    }

    #[test]
    fn string_pointing_past_memory_is_rejected() {
        let mut enc = ArgsEncoder::new();
        enc.string_at(1020, 8);
        let err = decode_args(enc.as_bytes(), &[]).unwrap_err();
        assert_eq!(
            err,
            DecodeError::MemoryOutOfBounds {
                ptr: 1020,
                len: 8,
                memory_size: 1024,
            }
        );

        let mut enc = ArgsEncoder::new();
        enc.string_at(u32::MAX, u32::MAX);
        assert!(matches!(
            decode_args(enc.as_bytes(), &[]),
            Err(DecodeError::MemoryOutOfBounds { .. })
        ));
    }

    #[test]
    fn typed_array_length_is_in_elements() {
        // 200 f64 elements = 1600 bytes, past the 1024-byte memory.
        let mut enc = ArgsEncoder::new();
        enc.f64_array_at(0, 200);
        assert!(matches!(
            decode_args(enc.as_bytes(), &[]),
            Err(DecodeError::MemoryOutOfBounds { len: 1600, .. })
        ));
    }

    #[test]
    fn argument_region_itself_must_be_in_bounds() {
        let memory = vec![0u8; 16];
        assert!(matches!(
            decode(&memory, 10, 7),
            Err(DecodeError::MemoryOutOfBounds { ptr: 10, len: 7, .. })
        ));
        assert_eq!(decode(&memory, 16, 0).unwrap(), Vec::new());
    }

    #[test]
    fn value_tags_match_wire_tags() {
        assert_eq!(Value::Bool(true).tag(), tags::TRUE);
        assert_eq!(Value::Bool(false).tag(), tags::FALSE);
        assert_eq!(Value::Uint32Array(Vec::new()).tag(), tags::UINT32_ARRAY);
        assert_eq!(Value::ObjectHandle(0).handle(), None);
    }
}
