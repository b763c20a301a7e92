//! Minimal protocol-buffers wire format.
//!
//! Only the two wire types the framing needs are supported: varint (0) and
//! length-delimited (2). Unknown fields of either type are skipped on decode.

use crate::{LnchatError, Result};

pub const WIRE_VARINT: u8 = 0;
pub const WIRE_LEN: u8 = 2;

/// Appends fields to a byte buffer.
#[derive(Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Varint field; zero values are omitted, as proto3 does.
    pub fn uint(&mut self, field: u32, value: u64) -> &mut Self {
        if value != 0 {
            self.key(field, WIRE_VARINT);
            put_varint(&mut self.buf, value);
        }
        self
    }

    /// Length-delimited field; empty values are omitted.
    pub fn bytes(&mut self, field: u32, value: &[u8]) -> &mut Self {
        if !value.is_empty() {
            self.key(field, WIRE_LEN);
            put_varint(&mut self.buf, value.len() as u64);
            self.buf.extend_from_slice(value);
        }
        self
    }

    /// Embedded message field, always written.
    pub fn message(&mut self, field: u32, value: &[u8]) -> &mut Self {
        self.key(field, WIRE_LEN);
        put_varint(&mut self.buf, value.len() as u64);
        self.buf.extend_from_slice(value);
        self
    }

    pub fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    fn key(&mut self, field: u32, wire_type: u8) {
        put_varint(&mut self.buf, ((field as u64) << 3) | wire_type as u64);
    }
}

/// One decoded field value.
#[derive(Debug, PartialEq, Eq)]
pub enum Value<'a> {
    Varint(u64),
    Bytes(&'a [u8]),
}

impl<'a> Value<'a> {
    pub fn as_u64(&self, field: u32) -> Result<u64> {
        match self {
            Value::Varint(v) => Ok(*v),
            Value::Bytes(_) => Err(wrong_type(field)),
        }
    }

    pub fn as_u32(&self, field: u32) -> Result<u32> {
        let v = self.as_u64(field)?;
        u32::try_from(v)
            .map_err(|_| LnchatError::marshal(format!("field {} overflows u32: {}", field, v)))
    }

    pub fn as_bytes(&self, field: u32) -> Result<&'a [u8]> {
        match self {
            Value::Bytes(b) => Ok(b),
            Value::Varint(_) => Err(wrong_type(field)),
        }
    }
}

fn wrong_type(field: u32) -> LnchatError {
    LnchatError::marshal(format!("field {} has unexpected wire type", field))
}

/// Iterates the fields of one encoded message.
pub struct Decoder<'a> {
    buf: &'a [u8],
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Next `(field, value)` pair, or `None` at the end of input.
    pub fn next_field(&mut self) -> Result<Option<(u32, Value<'a>)>> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        let key = self.varint()?;
        let field = u32::try_from(key >> 3)
            .map_err(|_| LnchatError::marshal(format!("field number too large: {}", key >> 3)))?;
        if field == 0 {
            return Err(LnchatError::marshal("field number 0"));
        }
        let value = match (key & 0x7) as u8 {
            WIRE_VARINT => Value::Varint(self.varint()?),
            WIRE_LEN => {
                let len = self.varint()?;
                let len = usize::try_from(len)
                    .ok()
                    .filter(|l| *l <= self.buf.len())
                    .ok_or_else(|| LnchatError::marshal("truncated length-delimited field"))?;
                let (head, rest) = self.buf.split_at(len);
                self.buf = rest;
                Value::Bytes(head)
            }
            other => {
                return Err(LnchatError::marshal(format!(
                    "unsupported wire type {} for field {}",
                    other, field
                )))
            }
        };
        Ok(Some((field, value)))
    }

    fn varint(&mut self) -> Result<u64> {
        let mut value = 0u64;
        for (i, byte) in self.buf.iter().enumerate().take(10) {
            value |= ((byte & 0x7f) as u64) << (7 * i);
            if byte & 0x80 == 0 {
                self.buf = &self.buf[i + 1..];
                return Ok(value);
            }
        }
        Err(LnchatError::marshal("malformed varint"))
    }
}

pub fn put_varint(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}
