//! Little-endian read helpers shared by command payloads and the wire codec

use crate::{TandemError, TandemResult};

/// Cursor over a borrowed byte slice
pub struct Reader<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Reader { buf, offset: 0 }
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.offset
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_array<const N: usize>(&mut self) -> TandemResult<[u8; N]> {
        let bytes = self.read_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    pub fn read_i32(&mut self) -> TandemResult<i32> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> TandemResult<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_bytes(&mut self, len: usize) -> TandemResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(TandemError::BufferTooShort {
                expected: self.offset + len,
                actual: self.buf.len(),
            });
        }
        let bytes = &self.buf[self.offset..self.offset + len];
        self.offset += len;
        Ok(bytes)
    }

    /// `u32` length followed by that many bytes
    pub fn read_prefixed(&mut self) -> TandemResult<&'a [u8]> {
        let len = self.read_u32()? as usize;
        self.read_bytes(len)
    }

    /// Fails if any bytes are left over
    pub fn finish(&self) -> TandemResult<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(TandemError::InvalidPayload(format!(
                "{} trailing bytes",
                self.remaining()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_sequence() {
        let mut data = Vec::new();
        data.extend_from_slice(&(-7i32).to_le_bytes());
        data.extend_from_slice(&3u32.to_le_bytes());
        data.extend_from_slice(b"abc");

        let mut reader = Reader::new(&data);
        assert_eq!(reader.read_i32().unwrap(), -7);
        assert_eq!(reader.read_prefixed().unwrap(), b"abc");
        assert!(reader.finish().is_ok());
    }

    #[test]
    fn test_reader_short_buffer() {
        let data = [1u8, 2];
        let mut reader = Reader::new(&data);
        assert_eq!(
            reader.read_u32().unwrap_err(),
            TandemError::BufferTooShort {
                expected: 4,
                actual: 2
            }
        );
    }

    #[test]
    fn test_reader_trailing_bytes() {
        let data = [0u8; 5];
        let mut reader = Reader::new(&data);
        reader.read_u32().unwrap();
        assert!(matches!(
            reader.finish(),
            Err(TandemError::InvalidPayload(_))
        ));
    }
}
