//! Conversion between [`DynamicValue`] and the guest's linear-memory encoding.
//!
//! A value is written as one tag byte followed by its payload, little-endian:
//!
//! | tag    | value      | payload                                |
//! |--------|------------|----------------------------------------|
//! | `0x00` | nil        | none                                   |
//! | `0x01` | false      | none                                   |
//! | `0x02` | true       | none                                   |
//! | `0x03` | integer    | `i64`                                  |
//! | `0x04` | float      | `f64` bits                             |
//! | `0x05` | string     | `u32` length, bytes                    |
//! | `0x06` | array      | `u32` count, elements                  |
//! | `0x07` | map        | `u32` count, key/value pairs           |
//! | `0x08` | callback   | `u32` instance id, `u32` slot          |
//!
//! The whole encoding of one value is addressed by a [`GuestPointer`]. The
//! decoder never reads outside the region the pointer names, never trusts a
//! length or count before checking it against the bytes that are actually
//! left, and stops at a fixed nesting depth.

use bytes::Bytes;

use crate::backend::{GuestMemory, check_bounds};
use crate::callback::CallbackRef;
use crate::error::{CodecError, CodecResult};
use crate::registry::InstanceId;
use crate::value::DynamicValue;

/// Default limit on container nesting, for both directions.
pub const DEFAULT_MAX_DEPTH: usize = 64;

mod tag {
    pub const NIL: u8 = 0x00;
    pub const FALSE: u8 = 0x01;
    pub const TRUE: u8 = 0x02;
    pub const INTEGER: u8 = 0x03;
    pub const FLOAT: u8 = 0x04;
    pub const STRING: u8 = 0x05;
    pub const ARRAY: u8 = 0x06;
    pub const MAP: u8 = 0x07;
    pub const CALLBACK: u8 = 0x08;
}

/// An `(offset, len)` region of guest memory holding one encoded value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GuestPointer {
    /// Start of the region.
    pub offset: u32,
    /// Length of the region in bytes.
    pub len: u32,
}

impl GuestPointer {
    /// Create a pointer.
    pub fn new(offset: u32, len: u32) -> Self {
        Self { offset, len }
    }

    /// Pack as `(offset << 32) | len`, the form passed through wasm `i64`s.
    pub fn pack(&self) -> u64 {
        (u64::from(self.offset) << 32) | u64::from(self.len)
    }

    /// Inverse of [`pack`](Self::pack).
    pub fn unpack(packed: u64) -> Self {
        Self {
            offset: (packed >> 32) as u32,
            len: packed as u32,
        }
    }
}

impl std::fmt::Display for GuestPointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}+{}", self.offset, self.len)
    }
}

/// Encode a value into guest memory, reserving space with the guest's
/// allocator.
///
/// The region is handed over to the guest: the host never frees it or reads
/// it back, so the guest has to release it once the call that received it is
/// done.
pub fn encode<M>(value: &DynamicValue, memory: &mut M, max_depth: usize) -> CodecResult<GuestPointer>
where
    M: GuestMemory + ?Sized,
{
    let bytes = encode_to_vec(value, max_depth)?;
    let len = u32::try_from(bytes.len()).map_err(|_| {
        CodecError::Malformed(format!("encoded value of {} bytes is too large", bytes.len()))
    })?;
    let offset = memory.alloc(len).map_err(CodecError::Alloc)?;
    memory.write_memory(offset as usize, &bytes)?;
    Ok(GuestPointer::new(offset, len))
}

/// Decode the value a guest pointer refers to.
pub fn decode<M>(pointer: GuestPointer, memory: &M, max_depth: usize) -> CodecResult<DynamicValue>
where
    M: GuestMemory + ?Sized,
{
    let (offset, len) = (pointer.offset as usize, pointer.len as usize);
    check_bounds(offset, len, memory.memory_size())?;
    let region = memory.read_memory(offset, len)?;
    decode_from_slice(region, max_depth)
}

/// Encode a value into a fresh buffer.
pub fn encode_to_vec(value: &DynamicValue, max_depth: usize) -> CodecResult<Vec<u8>> {
    let mut out = Vec::new();
    write_value(&mut out, value, 0, max_depth)?;
    Ok(out)
}

/// Decode one value that must span the whole slice.
pub fn decode_from_slice(bytes: &[u8], max_depth: usize) -> CodecResult<DynamicValue> {
    let mut reader = Reader {
        bytes,
        pos: 0,
        max_depth,
    };
    let value = reader.read_value(0)?;
    let trailing = bytes.len() - reader.pos;
    if trailing != 0 {
        return Err(CodecError::Malformed(format!(
            "{trailing} trailing bytes after value"
        )));
    }
    Ok(value)
}

fn write_len(out: &mut Vec<u8>, len: usize, what: &str) -> CodecResult<()> {
    let len = u32::try_from(len)
        .map_err(|_| CodecError::Malformed(format!("{what} of length {len} is too long")))?;
    out.extend_from_slice(&len.to_le_bytes());
    Ok(())
}

fn write_value(
    out: &mut Vec<u8>,
    value: &DynamicValue,
    depth: usize,
    max_depth: usize,
) -> CodecResult<()> {
    match value {
        DynamicValue::Nil => out.push(tag::NIL),
        DynamicValue::Bool(false) => out.push(tag::FALSE),
        DynamicValue::Bool(true) => out.push(tag::TRUE),
        DynamicValue::Integer(i) => {
            out.push(tag::INTEGER);
            out.extend_from_slice(&i.to_le_bytes());
        }
        DynamicValue::Float(f) => {
            out.push(tag::FLOAT);
            out.extend_from_slice(&f.to_bits().to_le_bytes());
        }
        DynamicValue::String(s) => {
            out.push(tag::STRING);
            write_len(out, s.len(), "string")?;
            out.extend_from_slice(s);
        }
        DynamicValue::Array(items) => {
            if depth >= max_depth {
                return Err(CodecError::DepthExceeded { limit: max_depth });
            }
            out.push(tag::ARRAY);
            write_len(out, items.len(), "array")?;
            for item in items {
                write_value(out, item, depth + 1, max_depth)?;
            }
        }
        DynamicValue::Map(entries) => {
            if depth >= max_depth {
                return Err(CodecError::DepthExceeded { limit: max_depth });
            }
            out.push(tag::MAP);
            write_len(out, entries.len(), "map")?;
            for (key, value) in entries {
                write_value(out, key, depth + 1, max_depth)?;
                write_value(out, value, depth + 1, max_depth)?;
            }
        }
        DynamicValue::Callback(r) => {
            out.push(tag::CALLBACK);
            out.extend_from_slice(&r.instance_id().get().to_le_bytes());
            out.extend_from_slice(&r.slot().to_le_bytes());
        }
    }
    Ok(())
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
    max_depth: usize,
}

impl<'a> Reader<'a> {
    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take(&mut self, n: usize) -> CodecResult<&'a [u8]> {
        if n > self.remaining() {
            return Err(CodecError::Malformed(format!(
                "unexpected end of data at byte {} (needed {n}, have {})",
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> CodecResult<[u8; N]> {
        let mut buf = [0u8; N];
        buf.copy_from_slice(self.take(N)?);
        Ok(buf)
    }

    fn read_u32(&mut self) -> CodecResult<u32> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    fn read_u64(&mut self) -> CodecResult<u64> {
        Ok(u64::from_le_bytes(self.take_array()?))
    }

    /// Read an element count, rejecting counts the remaining bytes could not
    /// possibly hold at `min_size` bytes per element.
    fn read_count(&mut self, min_size: usize, what: &str) -> CodecResult<usize> {
        let at = self.pos;
        let count = self.read_u32()? as usize;
        match count.checked_mul(min_size) {
            Some(needed) if needed <= self.remaining() => Ok(count),
            _ => Err(CodecError::Malformed(format!(
                "{what} at byte {at} declares {count} elements but only {} bytes remain",
                self.remaining()
            ))),
        }
    }

    fn enter(&self, depth: usize) -> CodecResult<()> {
        if depth >= self.max_depth {
            Err(CodecError::DepthExceeded {
                limit: self.max_depth,
            })
        } else {
            Ok(())
        }
    }

    fn read_value(&mut self, depth: usize) -> CodecResult<DynamicValue> {
        let at = self.pos;
        let [tag] = self.take_array::<1>()?;
        let value = match tag {
            tag::NIL => DynamicValue::Nil,
            tag::FALSE => DynamicValue::Bool(false),
            tag::TRUE => DynamicValue::Bool(true),
            tag::INTEGER => DynamicValue::Integer(self.read_u64()? as i64),
            tag::FLOAT => DynamicValue::Float(f64::from_bits(self.read_u64()?)),
            tag::STRING => {
                let len = self.read_u32()? as usize;
                DynamicValue::String(Bytes::copy_from_slice(self.take(len)?))
            }
            tag::ARRAY => {
                self.enter(depth)?;
                let count = self.read_count(1, "array")?;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(self.read_value(depth + 1)?);
                }
                DynamicValue::Array(items)
            }
            tag::MAP => {
                self.enter(depth)?;
                let count = self.read_count(2, "map")?;
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let key = self.read_value(depth + 1)?;
                    let value = self.read_value(depth + 1)?;
                    entries.push((key, value));
                }
                DynamicValue::Map(entries)
            }
            tag::CALLBACK => {
                let raw_id = self.read_u32()?;
                let slot = self.read_u32()?;
                let instance_id = InstanceId::from_raw(raw_id).ok_or_else(|| {
                    CodecError::Malformed(format!(
                        "callback at byte {at} names invalid instance id {raw_id}"
                    ))
                })?;
                DynamicValue::Callback(CallbackRef::new(instance_id, slot))
            }
            other => {
                return Err(CodecError::Malformed(format!(
                    "unknown tag {other:#04x} at byte {at}"
                )));
            }
        };
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::VecMemory;

    fn round_trip(value: &DynamicValue) -> DynamicValue {
        let bytes = encode_to_vec(value, DEFAULT_MAX_DEPTH).unwrap();
        decode_from_slice(&bytes, DEFAULT_MAX_DEPTH).unwrap()
    }

    fn nested_arrays(levels: usize) -> DynamicValue {
        let mut value = DynamicValue::Nil;
        for _ in 0..levels {
            value = DynamicValue::Array(vec![value]);
        }
        value
    }

    #[test]
    fn test_scalar_encoding_layout() {
        assert_eq!(encode_to_vec(&DynamicValue::Nil, 1).unwrap(), vec![0x00]);
        assert_eq!(encode_to_vec(&DynamicValue::Bool(true), 1).unwrap(), vec![0x02]);
        assert_eq!(
            encode_to_vec(&DynamicValue::Integer(-2), 1).unwrap(),
            vec![0x03, 0xfe, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff]
        );
        assert_eq!(
            encode_to_vec(&DynamicValue::from("hi"), 1).unwrap(),
            vec![0x05, 2, 0, 0, 0, b'h', b'i']
        );
    }

    #[test]
    fn test_nested_round_trip() {
        let value = DynamicValue::Map(vec![
            (
                DynamicValue::from("list"),
                DynamicValue::Array(vec![
                    DynamicValue::Integer(i64::MIN),
                    DynamicValue::Integer(i64::MAX),
                    DynamicValue::Float(f64::NAN),
                    DynamicValue::Float(-0.0),
                    DynamicValue::Nil,
                ]),
            ),
            (DynamicValue::Integer(7), DynamicValue::Bool(false)),
            (
                DynamicValue::from("empty"),
                DynamicValue::Map(Vec::new()),
            ),
        ]);

        assert_eq!(round_trip(&value), value);
    }

    #[test]
    fn test_callback_is_tagged_distinctly() {
        let r = CallbackRef::new(InstanceId::from_raw(3).unwrap(), 9);
        let bytes = encode_to_vec(&DynamicValue::Callback(r), 1).unwrap();

        assert_eq!(bytes, vec![0x08, 3, 0, 0, 0, 9, 0, 0, 0]);
        assert_eq!(round_trip(&DynamicValue::Callback(r)), DynamicValue::Callback(r));
    }

    #[test]
    fn test_non_utf8_string_decodes() {
        let bytes = [0x05, 2, 0, 0, 0, 0xc3, 0x28];
        let value = decode_from_slice(&bytes, 1).unwrap();
        assert_eq!(value.as_bytes(), Some(&[0xc3, 0x28][..]));
        assert_eq!(value.as_str(), None);
    }

    #[test]
    fn test_depth_limit() {
        assert!(encode_to_vec(&nested_arrays(4), 4).is_ok());
        assert!(matches!(
            encode_to_vec(&nested_arrays(5), 4),
            Err(CodecError::DepthExceeded { limit: 4 })
        ));

        let deep = encode_to_vec(&nested_arrays(5), 8).unwrap();
        assert!(matches!(
            decode_from_slice(&deep, 4),
            Err(CodecError::DepthExceeded { limit: 4 })
        ));
    }

    #[test]
    fn test_adversarial_depth_does_not_overflow_stack() {
        // A million nested array headers; only the first few are ever read.
        let mut bytes = Vec::new();
        for _ in 0..1_000_000 {
            bytes.extend_from_slice(&[0x06, 1, 0, 0, 0]);
        }
        assert!(matches!(
            decode_from_slice(&bytes, DEFAULT_MAX_DEPTH),
            Err(CodecError::DepthExceeded { .. })
        ));
    }

    #[test]
    fn test_encode_hands_exact_regions_to_guest() {
        let mut memory = VecMemory::new(256);
        let value = DynamicValue::from("hi");

        let first = encode(&value, &mut memory, DEFAULT_MAX_DEPTH).unwrap();
        let second = encode(&value, &mut memory, DEFAULT_MAX_DEPTH).unwrap();

        // Each value gets its own region of exactly its encoded size.
        assert_eq!(first.len, 7);
        assert_eq!(second.offset, first.offset + first.len);
        assert_eq!(decode(first, &memory, DEFAULT_MAX_DEPTH).unwrap(), value);
    }

    #[test]
    fn test_malformed_inputs() {
        let cases: &[&[u8]] = &[
            &[],
            &[0x09],
            &[0x03, 1, 2],
            &[0x05, 10, 0, 0, 0, b'a'],
            &[0x00, 0x00],
            &[0x08, 0xff, 0xff, 0xff, 0xff, 0, 0, 0, 0],
        ];
        for bytes in cases {
            assert!(
                matches!(decode_from_slice(bytes, 8), Err(CodecError::Malformed(_))),
                "expected malformed for {bytes:?}"
            );
        }
    }

    #[test]
    fn test_huge_count_rejected_before_allocation() {
        let bytes = [0x06, 0xff, 0xff, 0xff, 0xff, 0x00];
        let err = decode_from_slice(&bytes, 8).unwrap_err();
        assert!(matches!(err, CodecError::Malformed(msg) if msg.contains("4294967295")));

        let map = [0x07, 1, 0, 0, 0, 0x00];
        assert!(matches!(decode_from_slice(&map, 8), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn test_encode_decode_through_memory() {
        let mut memory = VecMemory::new(256);
        let value = DynamicValue::Array(vec![DynamicValue::from("a"), DynamicValue::Integer(1)]);

        let pointer = encode(&value, &mut memory, DEFAULT_MAX_DEPTH).unwrap();
        assert_eq!(pointer.len as usize, encode_to_vec(&value, 8).unwrap().len());
        assert_eq!(decode(pointer, &memory, DEFAULT_MAX_DEPTH).unwrap(), value);
    }

    #[test]
    fn test_decode_out_of_bounds() {
        let memory = VecMemory::new(64);

        let past_end = GuestPointer::new(60, 10);
        assert!(matches!(
            decode(past_end, &memory, DEFAULT_MAX_DEPTH),
            Err(CodecError::OutOfBounds { offset: 60, len: 10, memory_size: 64 })
        ));

        let wrapping = GuestPointer::unpack(u64::MAX);
        assert!(matches!(
            decode(wrapping, &memory, DEFAULT_MAX_DEPTH),
            Err(CodecError::OutOfBounds { .. })
        ));
        assert_eq!(memory.reads(), 0);
    }

    #[test]
    fn test_pointer_packing() {
        let pointer = GuestPointer::new(0x400, 9);
        assert_eq!(pointer.pack(), 0x0000_0400_0000_0009);
        assert_eq!(GuestPointer::unpack(pointer.pack()), pointer);
    }
}
