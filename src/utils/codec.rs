//! Deterministic binary codec for consensus data
//!
//! Field order is fixed by each type's `encode`/`decode` pair; the wire never carries
//! field names. Integers are big-endian, buffers and strings are prefixed with a `u32`
//! byte length (a zero length carries no payload and decodes as `None`), dates are `u32`
//! Unix seconds and arrays are a `u32` count followed by the elements.

use crate::core::Asset;
use crate::error::{BlockchainError, Result};
use crate::utils::crypto::{PUBLIC_KEY_LEN, SIGNATURE_LEN};
use crate::wallet::{PublicKey, SigPair};

/// Upper bound for the canonical text form of an asset on the wire
pub const MAX_ASSET_STR_LEN: usize = 32;

/// Types with a fixed-schema binary form
pub trait Encode {
    fn encode(&self, enc: &mut Encoder);

    fn to_bytes(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        self.encode(&mut enc);
        enc.into_bytes()
    }
}

pub trait Decode: Sized {
    fn decode(dec: &mut Decoder<'_>) -> Result<Self>;

    /// Decodes a value that must span the whole buffer
    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(bytes);
        let value = Self::decode(&mut dec)?;
        dec.finish()?;
        Ok(value)
    }
}

#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Encoder {
        Encoder { buf: Vec::new() }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Raw bytes with no length prefix, for fixed-size fields
    pub fn write_fixed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_bytes(&mut self, bytes: Option<&[u8]>) {
        match bytes {
            Some(bytes) if !bytes.is_empty() => {
                self.write_u32(bytes.len() as u32);
                self.buf.extend_from_slice(bytes);
            }
            _ => self.write_u32(0),
        }
    }

    pub fn write_str(&mut self, value: Option<&str>) {
        self.write_bytes(value.map(str::as_bytes));
    }

    /// Unix seconds, saturating at `u32::MAX`; validation rejects anything later
    pub fn write_date(&mut self, secs: u64) {
        self.write_u32(u32::try_from(secs).unwrap_or(u32::MAX));
    }

    /// Canonical text form. Callers validate the length first, since
    /// `read_asset` rejects anything longer than `MAX_ASSET_STR_LEN`.
    pub fn write_asset(&mut self, asset: &Asset) {
        let text = asset.to_string();
        debug_assert!(
            text.len() <= MAX_ASSET_STR_LEN,
            "asset text exceeds {MAX_ASSET_STR_LEN} bytes: {text}"
        );
        self.write_str(Some(&text));
    }

    pub fn write_public_key(&mut self, key: &PublicKey) {
        self.write_fixed(key.as_bytes());
    }

    pub fn write_sig_pair(&mut self, pair: &SigPair) {
        self.write_public_key(&pair.public_key);
        self.write_fixed(&pair.signature);
    }

    pub fn write_array<T>(&mut self, items: &[T], mut each: impl FnMut(&mut Encoder, &T)) {
        self.write_u32(items.len() as u32);
        for item in items {
            each(self, item);
        }
    }
}

pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Decoder<'a> {
        Decoder { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn finish(&self) -> Result<()> {
        if self.remaining() != 0 {
            return Err(BlockchainError::Serialization(format!(
                "{} trailing bytes after decode",
                self.remaining()
            )));
        }
        Ok(())
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(BlockchainError::Serialization(format!(
                "unexpected end of input: need {len} bytes at offset {}, have {}",
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(u32::from_be_bytes(raw))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(raw))
    }

    pub fn read_fixed<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut raw = [0u8; N];
        raw.copy_from_slice(self.take(N)?);
        Ok(raw)
    }

    pub fn read_bytes(&mut self) -> Result<Option<Vec<u8>>> {
        let len = self.read_u32()? as usize;
        if len == 0 {
            return Ok(None);
        }
        Ok(Some(self.take(len)?.to_vec()))
    }

    pub fn read_str(&mut self) -> Result<Option<String>> {
        match self.read_bytes()? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|e| BlockchainError::Serialization(format!("Invalid UTF-8 string: {e}"))),
            None => Ok(None),
        }
    }

    pub fn read_date(&mut self) -> Result<u64> {
        Ok(self.read_u32()? as u64)
    }

    pub fn read_asset(&mut self) -> Result<Asset> {
        let text = self
            .read_str()?
            .ok_or_else(|| BlockchainError::Serialization("Missing asset field".to_string()))?;
        if text.len() > MAX_ASSET_STR_LEN {
            return Err(BlockchainError::Serialization(format!(
                "Asset string exceeds {MAX_ASSET_STR_LEN} bytes"
            )));
        }
        text.parse()
    }

    pub fn read_public_key(&mut self) -> Result<PublicKey> {
        Ok(PublicKey::from_bytes(self.read_fixed::<PUBLIC_KEY_LEN>()?))
    }

    pub fn read_sig_pair(&mut self) -> Result<SigPair> {
        let public_key = self.read_public_key()?;
        let signature = self.read_fixed::<SIGNATURE_LEN>()?;
        Ok(SigPair {
            public_key,
            signature,
        })
    }

    pub fn read_array<T>(
        &mut self,
        mut each: impl FnMut(&mut Decoder<'a>) -> Result<T>,
    ) -> Result<Vec<T>> {
        let count = self.read_u32()? as usize;
        // Each element takes at least one byte, so a larger count is garbage
        if count > self.remaining() {
            return Err(BlockchainError::Serialization(format!(
                "Array count {count} exceeds remaining input"
            )));
        }
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(each(self)?);
        }
        Ok(items)
    }
}
