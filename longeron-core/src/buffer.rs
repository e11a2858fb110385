//! Buffer and data containers backing the socket I/O queues.
//!
//! A [`Blob`] is a sequence of fixed-size segments with a logical length no
//! greater than its total capacity; it backs the read and write queues and
//! supports cheap consumption from the front. [`Data`] is the sum type of
//! everything a user can submit to a send operation.

use std::fs::File;
use std::io::{IoSlice, IoSliceMut};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use smallvec::SmallVec;

use crate::error::{Error, ErrorKind, Result};

/// A non-owning view of a readable memory region, used for gathered writes.
pub type ConstBuffer<'a> = IoSlice<'a>;

/// A non-owning view of a writable memory region, used for scattered reads.
pub type MutableBuffer<'a> = IoSliceMut<'a>;

/// The preferred number of inline gather/scatter regions per syscall.
pub const MAX_GATHER_BUFFERS: usize = 16;

/// A gather list assembled from the head of a write queue.
pub type GatherList<'a> = SmallVec<[ConstBuffer<'a>; MAX_GATHER_BUFFERS]>;

/// The raw regions referenced by queued data, before conversion into a
/// gather list.
pub type SliceList<'a> = SmallVec<[&'a [u8]; MAX_GATHER_BUFFERS]>;

const DEFAULT_SEGMENT_SIZE: usize = 8192;

/// A growable sequence of fixed-size byte segments.
///
/// The logical length is always the sum of the segment lengths; segments
/// other than the last are kept full, so the segment holding the logical
/// end is `length / segment_size`.
#[derive(Debug, Clone, Default)]
pub struct Blob {
    segments: std::collections::VecDeque<BytesMut>,
    segment_size: usize,
    length: usize,
}

impl Blob {
    /// Create an empty blob with the default segment size.
    #[must_use]
    pub fn new() -> Self {
        Self::with_segment_size(DEFAULT_SEGMENT_SIZE)
    }

    /// Create an empty blob whose segments hold `segment_size` bytes.
    #[must_use]
    pub fn with_segment_size(segment_size: usize) -> Self {
        Self {
            segments: std::collections::VecDeque::new(),
            segment_size: segment_size.max(1),
            length: 0,
        }
    }

    /// The logical number of bytes stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.length
    }

    /// True if no bytes are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// The total capacity of all segments.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.segments.iter().map(BytesMut::capacity).sum()
    }

    /// The configured segment size.
    #[must_use]
    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    /// Append `data`, growing segments as needed.
    pub fn write(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let need_segment = match self.segments.back() {
                Some(back) => back.len() == self.segment_size,
                None => true,
            };
            if need_segment {
                self.segments
                    .push_back(BytesMut::with_capacity(self.segment_size));
            }
            let back = self.segments.back_mut().unwrap();
            let room = self.segment_size - back.len();
            let take = room.min(data.len());
            back.extend_from_slice(&data[..take]);
            self.length += take;
            data = &data[take..];
        }
    }

    /// Move up to `max` bytes from the front of this blob into a new blob.
    pub fn extract(&mut self, max: usize) -> Blob {
        let mut result = Blob::with_segment_size(self.segment_size);
        let mut remaining = max.min(self.length);

        while remaining > 0 {
            let front = self.segments.front_mut().unwrap();
            if front.len() <= remaining {
                let segment = self.segments.pop_front().unwrap();
                remaining -= segment.len();
                self.length -= segment.len();
                result.length += segment.len();
                result.segments.push_back(segment);
            } else {
                let taken = front.split_to(remaining);
                self.length -= taken.len();
                result.length += taken.len();
                result.segments.push_back(taken);
                remaining = 0;
            }
        }

        result
    }

    /// Discard up to `count` bytes from the front.
    pub fn consume(&mut self, count: usize) {
        let _ = self.extract(count);
    }

    /// Copy the first `max` bytes into a contiguous buffer.
    #[must_use]
    pub fn copy_to_bytes(&self, max: usize) -> Bytes {
        let take = max.min(self.length);
        let mut out = BytesMut::with_capacity(take);
        let mut remaining = take;
        for segment in &self.segments {
            if remaining == 0 {
                break;
            }
            let n = segment.len().min(remaining);
            out.extend_from_slice(&segment[..n]);
            remaining -= n;
        }
        out.freeze()
    }

    /// Copy the entire contents into a contiguous buffer.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        self.copy_to_bytes(self.length)
    }

    /// Append views of the stored bytes, starting at `offset`, to `out`.
    pub fn gather<'a>(&'a self, mut offset: usize, out: &mut SliceList<'a>) {
        for segment in &self.segments {
            if out.len() == MAX_GATHER_BUFFERS {
                break;
            }
            if offset >= segment.len() {
                offset -= segment.len();
                continue;
            }
            out.push(&segment[offset..]);
            offset = 0;
        }
    }
}

/// A contiguous region of an open file.
#[derive(Debug, Clone)]
pub struct FileRegion {
    file: Arc<File>,
    offset: u64,
    length: u64,
}

impl FileRegion {
    /// Describe the `length` bytes of `file` starting at `offset`.
    #[must_use]
    pub fn new(file: Arc<File>, offset: u64, length: u64) -> Self {
        Self {
            file,
            offset,
            length,
        }
    }

    /// The number of bytes in the region.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.length
    }

    /// True if the region is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Read the region into a blob.
    ///
    /// Send pipelines stage file regions through memory when the entry is
    /// enqueued; the drain path only ever gathers from memory.
    pub fn read_into_blob(&self, segment_size: usize) -> Result<Blob> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;

            let mut blob = Blob::with_segment_size(segment_size);
            let mut scratch = vec![0u8; segment_size.max(1)];
            let mut offset = self.offset;
            let mut remaining = self.length;
            while remaining > 0 {
                let want = scratch.len().min(remaining as usize);
                let read = self
                    .file
                    .read_at(&mut scratch[..want], offset)
                    .map_err(Error::from)?;
                if read == 0 {
                    return Err(Error::new(ErrorKind::Eof));
                }
                blob.write(&scratch[..read]);
                offset += read as u64;
                remaining -= read as u64;
            }
            Ok(blob)
        }
        #[cfg(not(unix))]
        {
            let _ = segment_size;
            Err(Error::new(ErrorKind::NotImplemented))
        }
    }
}

/// The union of everything a user can submit to a send operation.
#[derive(Debug, Clone, Default)]
pub enum Data {
    /// No data.
    #[default]
    Empty,
    /// A shared immutable byte region.
    Bytes(Bytes),
    /// An owned string.
    Text(String),
    /// An owned blob.
    Blob(Blob),
    /// A blob shared between submissions.
    Shared(Arc<Blob>),
    /// An open file region, staged through memory at enqueue time.
    File(FileRegion),
}

impl Data {
    /// The total number of referenced bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Empty => 0,
            Self::Bytes(bytes) => bytes.len(),
            Self::Text(text) => text.len(),
            Self::Blob(blob) => blob.len(),
            Self::Shared(blob) => blob.len(),
            Self::File(region) => region.len() as usize,
        }
    }

    /// True if no bytes are referenced.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append views of the referenced bytes, starting at `offset`, to `out`.
    ///
    /// File regions contribute nothing; they are staged into blobs before
    /// entering a write queue.
    pub fn gather<'a>(&'a self, offset: usize, out: &mut SliceList<'a>) {
        match self {
            Self::Empty | Self::File(_) => {}
            Self::Bytes(bytes) => {
                if offset < bytes.len() && out.len() < MAX_GATHER_BUFFERS {
                    out.push(&bytes[offset..]);
                }
            }
            Self::Text(text) => {
                let bytes = text.as_bytes();
                if offset < bytes.len() && out.len() < MAX_GATHER_BUFFERS {
                    out.push(&bytes[offset..]);
                }
            }
            Self::Blob(blob) => blob.gather(offset, out),
            Self::Shared(blob) => blob.gather(offset, out),
        }
    }

    /// Convert up to `budget` referenced bytes, starting at `offset`, into
    /// a gather list for a vectored send.
    pub fn gather_capped<'a>(slices: &[&'a [u8]], budget: usize, out: &mut GatherList<'a>) {
        let mut remaining = budget;
        for slice in slices {
            if remaining == 0 || out.len() == MAX_GATHER_BUFFERS {
                break;
            }
            let take = slice.len().min(remaining);
            if take == 0 {
                continue;
            }
            out.push(IoSlice::new(&slice[..take]));
            remaining -= take;
        }
    }
}

impl From<Bytes> for Data {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<Vec<u8>> for Data {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(bytes))
    }
}

impl From<&'static [u8]> for Data {
    fn from(bytes: &'static [u8]) -> Self {
        Self::Bytes(Bytes::from_static(bytes))
    }
}

impl From<&'static str> for Data {
    fn from(text: &'static str) -> Self {
        Self::Bytes(Bytes::from_static(text.as_bytes()))
    }
}

impl From<String> for Data {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Blob> for Data {
    fn from(blob: Blob) -> Self {
        Self::Blob(blob)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_write_spans_segments() {
        let mut blob = Blob::with_segment_size(4);
        blob.write(b"abcdefghij");
        assert_eq!(blob.len(), 10);
        assert_eq!(blob.to_bytes().as_ref(), b"abcdefghij");
        assert!(blob.capacity() >= 10);
    }

    #[test]
    fn blob_extract_from_front() {
        let mut blob = Blob::with_segment_size(4);
        blob.write(b"abcdefghij");

        let front = blob.extract(6);
        assert_eq!(front.to_bytes().as_ref(), b"abcdef");
        assert_eq!(blob.to_bytes().as_ref(), b"ghij");
        assert_eq!(blob.len(), 4);
    }

    #[test]
    fn blob_extract_more_than_stored() {
        let mut blob = Blob::with_segment_size(4);
        blob.write(b"abc");
        let front = blob.extract(100);
        assert_eq!(front.to_bytes().as_ref(), b"abc");
        assert!(blob.is_empty());
    }

    #[test]
    fn blob_gather_respects_offset() {
        let mut blob = Blob::with_segment_size(4);
        blob.write(b"abcdefghij");

        let mut slices = SliceList::new();
        blob.gather(5, &mut slices);
        let collected: Vec<u8> = slices.iter().flat_map(|s| s.to_vec()).collect();
        assert_eq!(collected, b"fghij");
    }

    #[test]
    fn gather_capped_truncates_at_budget() {
        let mut blob = Blob::with_segment_size(4);
        blob.write(b"abcdefghij");

        let mut slices = SliceList::new();
        blob.gather(0, &mut slices);

        let mut gather = GatherList::new();
        Data::gather_capped(&slices, 6, &mut gather);
        let total: usize = gather.iter().map(|s| s.len()).sum();
        assert_eq!(total, 6);
        let collected: Vec<u8> = gather.iter().flat_map(|s| s.to_vec()).collect();
        assert_eq!(collected, b"abcdef");
    }

    #[test]
    fn data_size_sums_regions() {
        assert_eq!(Data::Empty.len(), 0);
        assert_eq!(Data::from(Bytes::from_static(b"hello")).len(), 5);
        assert_eq!(Data::Text("hello".to_string()).len(), 5);

        let mut blob = Blob::new();
        blob.write(b"abc");
        assert_eq!(Data::Shared(Arc::new(blob)).len(), 3);
    }
}
