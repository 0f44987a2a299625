// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Little-endian byte layout of definition records in page memory.

use super::Handle;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use libmeasure_alloc::MovableMemory;

/// Appends fields to a record body.
pub struct Encoder<'a> {
    buf: &'a mut Vec<u8>,
}

// Writes into a Vec cannot fail, so the io::Results below are dropped.
impl<'a> Encoder<'a> {
    pub fn new(buf: &'a mut Vec<u8>) -> Self {
        Self { buf }
    }

    pub fn u8(&mut self, value: u8) {
        let _ = self.buf.write_u8(value);
    }

    pub fn bool(&mut self, value: bool) {
        self.u8(u8::from(value));
    }

    pub fn u32(&mut self, value: u32) {
        let _ = self.buf.write_u32::<LittleEndian>(value);
    }

    pub fn u64(&mut self, value: u64) {
        let _ = self.buf.write_u64::<LittleEndian>(value);
    }

    pub fn i64(&mut self, value: i64) {
        let _ = self.buf.write_i64::<LittleEndian>(value);
    }

    /// Length-prefixed bytes.
    pub fn bytes(&mut self, value: &[u8]) {
        self.u32(value.len() as u32);
        self.buf.extend_from_slice(value);
    }

    pub fn handle<T>(&mut self, handle: Handle<T>) {
        self.u32(handle.raw().into_raw());
    }

    pub fn u64_slice(&mut self, values: &[u64]) {
        self.u32(values.len() as u32);
        for value in values {
            self.u64(*value);
        }
    }
}

/// Reads fields back in the order they were encoded. Every read returns
/// `None` once the input is exhausted or malformed.
pub struct Decoder<'a> {
    input: &'a [u8],
}

impl<'a> Decoder<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self { input }
    }

    pub fn is_empty(&self) -> bool {
        self.input.is_empty()
    }

    pub fn u8(&mut self) -> Option<u8> {
        self.input.read_u8().ok()
    }

    pub fn bool(&mut self) -> Option<bool> {
        match self.u8()? {
            0 => Some(false),
            1 => Some(true),
            _ => None,
        }
    }

    pub fn u32(&mut self) -> Option<u32> {
        self.input.read_u32::<LittleEndian>().ok()
    }

    pub fn u64(&mut self) -> Option<u64> {
        self.input.read_u64::<LittleEndian>().ok()
    }

    pub fn i64(&mut self) -> Option<i64> {
        self.input.read_i64::<LittleEndian>().ok()
    }

    pub fn bytes(&mut self) -> Option<&'a [u8]> {
        let len = self.u32()? as usize;
        let (head, tail) = self.input.split_at_checked(len)?;
        self.input = tail;
        Some(head)
    }

    pub fn string(&mut self) -> Option<String> {
        String::from_utf8(self.bytes()?.to_vec()).ok()
    }

    pub fn handle<T>(&mut self) -> Option<Handle<T>> {
        Some(Handle::from_raw(MovableMemory::from_raw(self.u32()?)))
    }

    pub fn u64_vec(&mut self) -> Option<Vec<u64>> {
        let len = self.u32()? as usize;
        if len > self.input.len() / 8 {
            return None;
        }
        (0..len).map(|_| self.u64()).collect()
    }
}

/// Declares a fieldless enum stored as one byte in records.
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $value:literal, )+
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
        #[repr(u8)]
        pub enum $name {
            $( $(#[$vmeta])* $variant = $value, )+
        }

        impl $name {
            pub fn from_u8(value: u8) -> Option<Self> {
                match value {
                    $( $value => Some(Self::$variant), )+
                    _ => None,
                }
            }

            pub fn encode(self, out: &mut $crate::definitions::codec::Encoder<'_>) {
                out.u8(self as u8);
            }

            pub fn decode(input: &mut $crate::definitions::codec::Decoder<'_>) -> Option<Self> {
                Self::from_u8(input.u8()?)
            }
        }
    };
}

pub(crate) use wire_enum;

#[cfg(test)]
mod tests {
    use super::*;

    wire_enum! {
        pub enum Color {
            Red = 0,
            Blue = 7,
        }
    }

    #[test]
    fn fields_come_back_in_order() {
        let mut buf = Vec::new();
        let mut out = Encoder::new(&mut buf);
        out.u8(3);
        out.bool(true);
        out.u32(0xdead_beef);
        out.i64(-5);
        out.bytes(b"foo");
        out.u64_slice(&[1, u64::MAX]);
        Color::Blue.encode(&mut out);

        let mut input = Decoder::new(&buf);
        assert_eq!(input.u8(), Some(3));
        assert_eq!(input.bool(), Some(true));
        assert_eq!(input.u32(), Some(0xdead_beef));
        assert_eq!(input.i64(), Some(-5));
        assert_eq!(input.string().as_deref(), Some("foo"));
        assert_eq!(input.u64_vec(), Some(vec![1, u64::MAX]));
        assert_eq!(Color::decode(&mut input), Some(Color::Blue));
        assert!(input.is_empty());
        assert_eq!(input.u8(), None);
    }

    #[test]
    fn rejects_truncated_and_malformed_input() {
        let mut buf = Vec::new();
        Encoder::new(&mut buf).bytes(b"abcdef");
        assert_eq!(Decoder::new(&buf[..buf.len() - 1]).bytes(), None);

        let mut buf = Vec::new();
        Encoder::new(&mut buf).u32(u32::MAX);
        assert_eq!(Decoder::new(&buf).u64_vec(), None);

        assert_eq!(Decoder::new(&[2]).bool(), None);
        assert_eq!(Color::decode(&mut Decoder::new(&[1])), None);
        assert_eq!(Decoder::new(&[1, 0, 0, 0, 0xff]).string(), None);
    }
}
