//! Length-prefixed canonical encoding used for message hashing and transport.

use crate::types::Error;

/// Append-only builder for canonical encodings.
#[derive(Default)]
pub struct Writer {
    out: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.out.push(v);
        self
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.out.extend_from_slice(&v.to_be_bytes());
        self
    }

    // Lengths are encoded as 4-byte big-endian. Collections above u32::MAX
    // entries cannot be built in practice.
    pub fn len(&mut self, len: usize) -> &mut Self {
        self.u32(len.min(u32::MAX as usize) as u32)
    }

    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.out.extend_from_slice(bytes);
        self
    }

    /// [len||bytes]
    pub fn bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.len(bytes.len());
        self.raw(bytes)
    }

    /// Bitset as [bit count||packed bytes], least significant bit first.
    pub fn bits(&mut self, bits: &[bool]) -> &mut Self {
        self.len(bits.len());
        let mut packed = vec![0u8; bits.len().div_ceil(8)];
        for (i, bit) in bits.iter().enumerate() {
            if *bit {
                packed[i / 8] |= 1 << (i % 8);
            }
        }
        self.raw(&packed)
    }

    pub fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.out)
    }
}

/// Cursor over an encoded buffer; every read is bounds-checked.
pub struct Reader<'a> {
    input: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self { input }
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], Error> {
        if self.input.len() < n {
            return Err(Error::InvalidEncoding);
        }
        let (head, rest) = self.input.split_at(n);
        self.input = rest;
        Ok(head)
    }

    pub fn array<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, Error> {
        Ok(self.take(1)?[0])
    }

    pub fn u32(&mut self) -> Result<u32, Error> {
        Ok(u32::from_be_bytes(self.array::<4>()?))
    }

    /// Reads a collection length, rejecting counts the remaining input cannot hold.
    pub fn len(&mut self, min_item_size: usize) -> Result<usize, Error> {
        let len = self.u32()? as usize;
        if min_item_size > 0 && len.saturating_mul(min_item_size) > self.input.len() {
            return Err(Error::InvalidEncoding);
        }
        Ok(len)
    }

    pub fn bytes(&mut self) -> Result<Vec<u8>, Error> {
        let len = self.len(1)?;
        Ok(self.take(len)?.to_vec())
    }

    pub fn bits(&mut self) -> Result<Vec<bool>, Error> {
        let len = self.u32()? as usize;
        let packed = self.take(len.div_ceil(8))?;
        let bits: Vec<bool> = (0..len).map(|i| packed[i / 8] & (1 << (i % 8)) != 0).collect();
        // Padding bits must be zero so the encoding stays canonical.
        if len % 8 != 0 && packed[len / 8] >> (len % 8) != 0 {
            return Err(Error::InvalidEncoding);
        }
        Ok(bits)
    }

    pub fn finish(self) -> Result<(), Error> {
        if !self.input.is_empty() {
            return Err(Error::InvalidEncoding);
        }
        Ok(())
    }
}
