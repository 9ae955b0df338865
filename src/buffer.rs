use bytes::{BufMut, BytesMut};

/// A logical byte sequence made of borrowed ranges.
///
/// Every layer prepends its own header in front of the chain it was handed,
/// so a payload travels down to the link layer without being copied.
/// Empty ranges are legal and contribute nothing.
#[derive(Clone, Copy, Debug)]
pub struct SegmentedBuffer<'a> {
    head: &'a [u8],
    tail: Option<&'a SegmentedBuffer<'a>>,
}

impl<'a> SegmentedBuffer<'a> {
    pub const fn new(bytes: &'a [u8]) -> Self {
        Self { head: bytes, tail: None }
    }
    pub const fn empty() -> Self {
        Self::new(&[])
    }
    /// Returns a new chain that yields `head` first and then every range of `self`.
    pub fn prepend<'b>(&'b self, head: &'b [u8]) -> SegmentedBuffer<'b> {
        SegmentedBuffer { head, tail: Some(self) }
    }
    pub fn segments(&self) -> Segments<'_> {
        Segments { next: Some(self) }
    }
    pub fn len(&self) -> usize {
        self.segments().map(|segment| segment.len()).sum()
    }
    pub fn is_empty(&self) -> bool {
        self.segments().all(|segment| segment.is_empty())
    }
    /// RFC 1071 Internet checksum of the whole logical sequence.
    ///
    /// Words are formed across range boundaries, so the result does not depend on
    /// how the sequence is split. An odd trailing byte is the high byte of a
    /// zero-padded word.
    pub fn checksum(&self) -> u16 {
        let mut sum: u64 = 0;
        let mut pending: Option<u8> = None;
        for segment in self.segments() {
            let mut bytes = segment;
            if let Some(high) = pending.take() {
                match bytes.split_first() {
                    Some((&low, rest)) => {
                        sum += u16::from_be_bytes([high, low]) as u64;
                        bytes = rest;
                    }
                    None => {
                        pending = Some(high);
                        continue;
                    }
                }
            }
            let mut words = bytes.chunks_exact(2);
            for word in &mut words {
                sum += u16::from_be_bytes([word[0], word[1]]) as u64;
            }
            if let [last] = words.remainder() {
                pending = Some(*last);
            }
        }
        if let Some(high) = pending {
            sum += (high as u64) << 8;
        }
        while sum >> 16 != 0 {
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
        !(sum as u16)
    }
    pub fn copy_to<B: BufMut>(&self, buf: &mut B) {
        for segment in self.segments() {
            buf.put_slice(segment);
        }
    }
    /// Flattens the chain into one contiguous buffer.
    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.len());
        self.copy_to(&mut buf);
        buf
    }
}

pub struct Segments<'a> {
    next: Option<&'a SegmentedBuffer<'a>>,
}

impl<'a> Iterator for Segments<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        let buffer = self.next?;
        self.next = buffer.tail;
        Some(buffer.head)
    }
}

/// Checksum of a single contiguous range.
pub fn checksum(bytes: &[u8]) -> u16 {
    SegmentedBuffer::new(bytes).checksum()
}
