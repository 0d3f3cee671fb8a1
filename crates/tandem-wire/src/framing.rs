//! Length-prefix framing
//!
//! Several packages share one transport write. Each is wrapped as
//! `[len: u32 LE][len bytes]` and frames are simply concatenated.

use bytes::{BufMut, BytesMut};

use tandem_core::{TandemError, TandemResult};

/// Size of the length prefix
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Largest frame accepted from a peer
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Append one framed payload
pub fn write_frame(buf: &mut BytesMut, payload: &[u8]) {
    buf.reserve(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(payload);
}

/// Reserve a length prefix to be filled in by [`end_frame`]. Lets callers
/// encode straight into the output buffer.
pub fn begin_frame(buf: &mut BytesMut) -> usize {
    let start = buf.len();
    buf.put_u32_le(0);
    start
}

/// Patch the length prefix reserved at `start`
pub fn end_frame(buf: &mut BytesMut, start: usize) {
    let len = (buf.len() - start - LENGTH_PREFIX_SIZE) as u32;
    buf[start..start + LENGTH_PREFIX_SIZE].copy_from_slice(&len.to_le_bytes());
}

/// Split a blob of concatenated frames, preserving order
pub fn split_frames(blob: &[u8]) -> TandemResult<Vec<&[u8]>> {
    let mut frames = Vec::new();
    let mut offset = 0;

    while offset < blob.len() {
        if blob.len() - offset < LENGTH_PREFIX_SIZE {
            return Err(TandemError::BufferTooShort {
                expected: offset + LENGTH_PREFIX_SIZE,
                actual: blob.len(),
            });
        }
        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        prefix.copy_from_slice(&blob[offset..offset + LENGTH_PREFIX_SIZE]);
        let len = u32::from_le_bytes(prefix) as usize;
        offset += LENGTH_PREFIX_SIZE;

        if len > MAX_FRAME_LEN {
            return Err(TandemError::InvalidWireFormat(format!(
                "Frame too large: {} > {}",
                len, MAX_FRAME_LEN
            )));
        }
        if blob.len() - offset < len {
            return Err(TandemError::BufferTooShort {
                expected: offset + len,
                actual: blob.len(),
            });
        }
        frames.push(&blob[offset..offset + len]);
        offset += len;
    }

    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_keep_order() {
        let mut buf = BytesMut::new();
        write_frame(&mut buf, b"first");
        write_frame(&mut buf, b"");
        write_frame(&mut buf, b"third");

        let frames = split_frames(&buf).unwrap();
        assert_eq!(frames, vec![&b"first"[..], &b""[..], &b"third"[..]]);
    }

    #[test]
    fn test_in_place_frame() {
        let mut buf = BytesMut::new();
        let start = begin_frame(&mut buf);
        buf.put_slice(&[1, 2, 3]);
        end_frame(&mut buf, start);
        assert_eq!(&buf[..], &[3, 0, 0, 0, 1, 2, 3]);
    }

    #[test]
    fn test_truncated_frame() {
        let mut buf = BytesMut::new();
        write_frame(&mut buf, b"payload");
        let cut = &buf[..buf.len() - 1];
        assert!(matches!(
            split_frames(cut),
            Err(TandemError::BufferTooShort { .. })
        ));
        assert!(matches!(
            split_frames(&[7, 0]),
            Err(TandemError::BufferTooShort { .. })
        ));
    }

    #[test]
    fn test_oversized_frame() {
        let blob = u32::MAX.to_le_bytes();
        assert!(matches!(
            split_frames(&blob),
            Err(TandemError::InvalidWireFormat(_))
        ));
    }

    #[test]
    fn test_empty_blob() {
        assert!(split_frames(&[]).unwrap().is_empty());
    }
}
