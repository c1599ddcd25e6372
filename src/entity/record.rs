//! # Binary Entity Records
//!
//! Zero-copy access to the fixed-layout binary entity representation. Every
//! persisted entity is stored as one contiguous record:
//!
//! ```text
//! +----------------+----------------+----------------+------------------+
//! | length         | type_id        | object_id      | payload          |
//! | (u64 LE)       | (u64 LE)       | (u64 LE)       | [u8; length-24]  |
//! +----------------+----------------+----------------+------------------+
//! ```
//!
//! | Field | Description |
//! |-------|-------------|
//! | **length** | Total record size in bytes, header included |
//! | **type_id** | Foreign key into the type dictionary |
//! | **object_id** | Globally unique oid; low bits route to a channel |
//! | **payload** | Opaque bytes owned by the serialization layer |
//!
//! The storage core only needs O(1) access to the three header scalars and
//! the payload byte range. Field layout within the payload belongs to the
//! external type-handler collaborators.
//!
//! ## Chunk Walking
//!
//! Freshly written store chunks are sequences of consecutive records.
//! [`ChunkRecords`] walks such a chunk by jumping `length` bytes at a time,
//! which is how post-store entity registration finds every record.
//!
//! ## Thread Safety
//!
//! [`EntityRecord`] borrows immutably from a byte slice; concurrent readers
//! are fine. Chunks are produced by [`ChunkBuilder`] before being handed to
//! a channel, never mutated afterwards.

use eyre::{ensure, Result};
use zerocopy::little_endian::U64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{ENTITY_HEADER_SIZE, MIN_ENTITY_LENGTH};
use crate::zerocopy_getters;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct EntityHeader {
    length: U64,
    type_id: U64,
    object_id: U64,
}

const _: () = assert!(std::mem::size_of::<EntityHeader>() == ENTITY_HEADER_SIZE);

impl EntityHeader {
    pub fn new(length: u64, type_id: u64, object_id: u64) -> Self {
        Self {
            length: U64::new(length),
            type_id: U64::new(type_id),
            object_id: U64::new(object_id),
        }
    }

    zerocopy_getters! {
        length: u64,
        type_id: u64,
        object_id: u64,
    }
}

/// Zero-copy view over one entity record.
#[derive(Debug, Clone, Copy)]
pub struct EntityRecord<'a> {
    header: &'a EntityHeader,
    payload: &'a [u8],
}

impl<'a> EntityRecord<'a> {
    /// Parses the record starting at the beginning of `bytes`. The slice may
    /// extend past the record; only `length` bytes are claimed.
    pub fn from_bytes(bytes: &'a [u8]) -> Result<Self> {
        ensure!(
            bytes.len() >= ENTITY_HEADER_SIZE,
            "buffer too small for entity header: {} < {}",
            bytes.len(),
            ENTITY_HEADER_SIZE
        );

        let header = EntityHeader::ref_from_bytes(&bytes[..ENTITY_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse entity header: {:?}", e))?;

        let length = header.length();
        ensure!(
            length >= MIN_ENTITY_LENGTH,
            "entity record length {} below minimum {}",
            length,
            MIN_ENTITY_LENGTH
        );
        ensure!(
            length as usize <= bytes.len(),
            "entity record length {} exceeds buffer ({} bytes)",
            length,
            bytes.len()
        );

        Ok(Self {
            header,
            payload: &bytes[ENTITY_HEADER_SIZE..length as usize],
        })
    }

    pub fn length(&self) -> u64 {
        self.header.length()
    }

    pub fn type_id(&self) -> u64 {
        self.header.type_id()
    }

    pub fn object_id(&self) -> u64 {
        self.header.object_id()
    }

    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }
}

/// Iterator over the consecutive records of a stored chunk, yielding each
/// record together with its byte offset inside the chunk.
pub struct ChunkRecords<'a> {
    chunk: &'a [u8],
    offset: usize,
}

impl<'a> ChunkRecords<'a> {
    pub fn new(chunk: &'a [u8]) -> Self {
        Self { chunk, offset: 0 }
    }
}

impl<'a> Iterator for ChunkRecords<'a> {
    type Item = Result<(usize, EntityRecord<'a>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.chunk.len() {
            return None;
        }
        let at = self.offset;
        match EntityRecord::from_bytes(&self.chunk[at..]) {
            Ok(record) => {
                self.offset += record.length() as usize;
                Some(Ok((at, record)))
            }
            Err(e) => {
                // poison the iterator so a torn chunk yields exactly one error
                self.offset = self.chunk.len();
                Some(Err(e))
            }
        }
    }
}

/// Builds a chunk of consecutive entity records for storing.
#[derive(Debug, Default)]
pub struct ChunkBuilder {
    bytes: Vec<u8>,
}

impl ChunkBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one record and returns its byte offset inside the chunk.
    pub fn push(&mut self, object_id: u64, type_id: u64, payload: &[u8]) -> usize {
        let offset = self.bytes.len();
        let length = (ENTITY_HEADER_SIZE + payload.len()) as u64;
        let header = EntityHeader::new(length, type_id, object_id);
        self.bytes.extend_from_slice(header.as_bytes());
        self.bytes.extend_from_slice(payload);
        offset
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn finish(self) -> Vec<u8> {
        self.bytes
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}
