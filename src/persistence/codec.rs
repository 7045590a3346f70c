//! Order-preserving key encoding
//!
//! Integers are big-endian with the sign bit flipped, so byte order equals
//! numeric order. Strings are length-prefixed inside composite keys. An id
//! encodes as its type followed by the 16 raw uuid bytes.

use super::column::{StorageError, StorageResult};
use crate::graph::{Id, Scope};
use bytes::{Buf, BufMut, BytesMut};
use uuid::Uuid;

const SIGN_BIT: u64 = 1 << 63;

pub fn encode_i64(value: i64) -> [u8; 8] {
    ((value as u64) ^ SIGN_BIT).to_be_bytes()
}

pub fn decode_i64(bytes: &[u8]) -> StorageResult<i64> {
    let raw: [u8; 8] = bytes
        .get(..8)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| StorageError::Corrupt(format!("expected 8 bytes, got {}", bytes.len())))?;
    Ok((u64::from_be_bytes(raw) ^ SIGN_BIT) as i64)
}

/// Builds composite row keys and column names
#[derive(Debug, Default)]
pub struct KeyBuilder {
    buf: BytesMut,
}

impl KeyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scope(self, scope: &Scope) -> Self {
        self.id(scope.application())
    }

    pub fn id(self, id: &Id) -> Self {
        let mut builder = self.string(id.id_type());
        builder.buf.put_slice(id.uuid().as_bytes());
        builder
    }

    pub fn string(mut self, value: &str) -> Self {
        self.buf.put_u32(value.len() as u32);
        self.buf.put_slice(value.as_bytes());
        self
    }

    pub fn i64(mut self, value: i64) -> Self {
        self.buf.put_slice(&encode_i64(value));
        self
    }

    pub fn u8(mut self, value: u8) -> Self {
        self.buf.put_u8(value);
        self
    }

    pub fn build(self) -> Vec<u8> {
        self.buf.to_vec()
    }
}

/// Reads back what a [`KeyBuilder`] wrote
pub struct KeyReader<'a> {
    buf: &'a [u8],
}

impl<'a> KeyReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        KeyReader { buf }
    }

    fn need(&self, len: usize, what: &str) -> StorageResult<()> {
        if self.buf.remaining() < len {
            return Err(StorageError::Corrupt(format!(
                "truncated {}: need {} bytes, have {}",
                what,
                len,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub fn i64(&mut self) -> StorageResult<i64> {
        self.need(8, "integer")?;
        let value = decode_i64(self.buf)?;
        self.buf.advance(8);
        Ok(value)
    }

    pub fn string(&mut self) -> StorageResult<String> {
        self.need(4, "string length")?;
        let len = self.buf.get_u32() as usize;
        self.need(len, "string")?;
        let value = String::from_utf8(self.buf[..len].to_vec())
            .map_err(|e| StorageError::Corrupt(format!("invalid utf-8: {}", e)))?;
        self.buf.advance(len);
        Ok(value)
    }

    pub fn id(&mut self) -> StorageResult<Id> {
        let id_type = self.string()?;
        self.need(16, "uuid")?;
        let uuid = Uuid::from_slice(&self.buf[..16])
            .map_err(|e| StorageError::Corrupt(format!("invalid uuid: {}", e)))?;
        self.buf.advance(16);
        Ok(Id::new(id_type, uuid))
    }

    pub fn is_empty(&self) -> bool {
        !self.buf.has_remaining()
    }
}
