//! Incremental ISO-BMFF box demultiplexer
//!
//! Splits a continuous fragmented-MP4 byte stream into whole top-level
//! boxes. Input may arrive in chunks of any size; a box is only yielded once
//! all of its declared bytes are buffered.

use bytes::{Bytes, BytesMut};

/// Size (4) + type (4)
pub const HEADER_LEN: usize = 8;

/// Header followed by a 64-bit largesize
pub const EXTENDED_HEADER_LEN: usize = 16;

/// Box types that make up the initialization segment
pub const INIT_BOX_TYPES: [BoxType; 2] = [BoxType(*b"ftyp"), BoxType(*b"moov")];

/// Four-character box type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BoxType(pub [u8; 4]);

impl BoxType {
    pub fn is_init(&self) -> bool {
        INIT_BOX_TYPES.contains(self)
    }
}

impl std::fmt::Display for BoxType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for &b in &self.0 {
            let c = if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '?'
            };
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

/// One complete box, header included
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaBox {
    pub box_type: BoxType,
    pub data: Bytes,
}

impl MediaBox {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoxError {
    /// Size 0: the box runs to the end of the stream and cannot be framed
    Unbounded { box_type: BoxType },
    /// Declared size smaller than the header that declares it
    InvalidSize { box_type: BoxType, size: u64 },
    /// Declared size above the configured limit
    TooLarge { box_type: BoxType, size: u64, max: u64 },
}

impl std::fmt::Display for BoxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BoxError::Unbounded { box_type } => {
                write!(f, "box '{box_type}' extends to end of stream")
            }
            BoxError::InvalidSize { box_type, size } => {
                write!(f, "box '{box_type}' declares invalid size {size}")
            }
            BoxError::TooLarge {
                box_type,
                size,
                max,
            } => write!(f, "box '{box_type}' size {size} exceeds limit {max}"),
        }
    }
}

impl std::error::Error for BoxError {}

#[derive(Debug)]
pub struct BoxParser {
    buffer: BytesMut,
    max_box_size: u64,
}

impl BoxParser {
    pub fn new(max_box_size: u64) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_box_size,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Bytes received but not yet yielded as a box.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Next complete box, or `Ok(None)` if more input is needed.
    ///
    /// Errors are sticky: the offending header stays at the front of the
    /// buffer, so every later call reports the same error.
    pub fn next_box(&mut self) -> Result<Option<MediaBox>, BoxError> {
        let Some(size) = self.declared_size()? else {
            return Ok(None);
        };

        if (self.buffer.len() as u64) < size {
            return Ok(None);
        }

        let box_type = read_type(&self.buffer);
        // size <= buffer.len(), so the cast cannot truncate
        let data = self.buffer.split_to(size as usize).freeze();
        Ok(Some(MediaBox { box_type, data }))
    }

    /// Every complete box currently buffered.
    pub fn drain(&mut self) -> Result<Vec<MediaBox>, BoxError> {
        let mut boxes = Vec::new();
        while let Some(media_box) = self.next_box()? {
            boxes.push(media_box);
        }
        Ok(boxes)
    }

    fn declared_size(&self) -> Result<Option<u64>, BoxError> {
        let buf = &self.buffer;
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let box_type = read_type(buf);
        let size = match u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) {
            0 => return Err(BoxError::Unbounded { box_type }),
            1 => {
                if buf.len() < EXTENDED_HEADER_LEN {
                    return Ok(None);
                }
                let large = u64::from_be_bytes([
                    buf[8], buf[9], buf[10], buf[11], buf[12], buf[13], buf[14], buf[15],
                ]);
                if large < EXTENDED_HEADER_LEN as u64 {
                    return Err(BoxError::InvalidSize {
                        box_type,
                        size: large,
                    });
                }
                large
            }
            n if (n as usize) < HEADER_LEN => {
                return Err(BoxError::InvalidSize {
                    box_type,
                    size: n as u64,
                });
            }
            n => n as u64,
        };

        if size > self.max_box_size {
            return Err(BoxError::TooLarge {
                box_type,
                size,
                max: self.max_box_size,
            });
        }

        Ok(Some(size))
    }
}

fn read_type(buf: &[u8]) -> BoxType {
    BoxType([buf[4], buf[5], buf[6], buf[7]])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxed(kind: &[u8; 4], total: usize) -> Vec<u8> {
        let mut out = (total as u32).to_be_bytes().to_vec();
        out.extend_from_slice(kind);
        out.resize(total, 0xab);
        out
    }

    #[test]
    fn waits_for_complete_box() {
        let mut parser = BoxParser::new(1024);
        let data = boxed(b"moof", 40);

        parser.push(&data[..39]);
        assert_eq!(parser.next_box(), Ok(None));

        parser.push(&data[39..]);
        let media_box = parser.next_box().unwrap().unwrap();
        assert_eq!(media_box.box_type, BoxType(*b"moof"));
        assert_eq!(media_box.len(), 40);
        assert_eq!(parser.buffered(), 0);
    }

    #[test]
    fn extended_size_needs_sixteen_header_bytes() {
        let mut data = 1u32.to_be_bytes().to_vec();
        data.extend_from_slice(b"mdat");
        data.extend_from_slice(&24u64.to_be_bytes());
        data.extend_from_slice(&[7u8; 8]);

        let mut parser = BoxParser::new(1024);
        parser.push(&data[..12]);
        assert_eq!(parser.next_box(), Ok(None));

        parser.push(&data[12..]);
        let media_box = parser.next_box().unwrap().unwrap();
        assert_eq!(media_box.box_type, BoxType(*b"mdat"));
        assert_eq!(media_box.data.as_ref(), data.as_slice());
    }

    #[test]
    fn zero_size_is_unbounded() {
        let mut parser = BoxParser::new(1024);
        parser.push(&[0, 0, 0, 0, b'm', b'd', b'a', b't', 1, 2, 3]);
        assert_eq!(
            parser.next_box(),
            Err(BoxError::Unbounded {
                box_type: BoxType(*b"mdat")
            })
        );
    }

    #[test]
    fn undersized_and_oversized_boxes_are_rejected() {
        let mut parser = BoxParser::new(1024);
        parser.push(&[0, 0, 0, 4, b'f', b'r', b'e', b'e']);
        assert!(matches!(
            parser.next_box(),
            Err(BoxError::InvalidSize { size: 4, .. })
        ));

        let mut parser = BoxParser::new(1024);
        parser.push(&boxed(b"mdat", 16)[..8]);
        parser.buffer[0..4].copy_from_slice(&4096u32.to_be_bytes());
        assert!(matches!(
            parser.next_box(),
            Err(BoxError::TooLarge { size: 4096, .. })
        ));
    }

    #[test]
    fn type_display_masks_non_ascii() {
        assert_eq!(BoxType(*b"moov").to_string(), "moov");
        assert_eq!(BoxType([b'a', 0, b'c', 0xff]).to_string(), "a?c?");
    }
}
