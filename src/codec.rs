use crate::schema::Schema;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use std::fmt;
use std::io::{Read, Write};

/// Trailing byte distinguishing the two persisted chunk forms.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkMarker {
    Sparse,
    Contiguous,
}

impl ChunkMarker {
    pub const SPARSE: u8 = b'S';
    pub const CONTIGUOUS: u8 = b'C';

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            Self::SPARSE => Some(Self::Sparse),
            Self::CONTIGUOUS => Some(Self::Contiguous),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Self::Sparse => Self::SPARSE,
            Self::Contiguous => Self::CONTIGUOUS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Bad marker, short trailer, or decompressed-length mismatch. Fatal to
    /// the chunk it names.
    CorruptChunk(String),
    /// The record buffer being compressed does not pack whole records.
    RecordAlignment { len: usize, point_size: usize },
    Io(String),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CorruptChunk(message) => write!(f, "corrupt chunk: {message}"),
            Self::RecordAlignment { len, point_size } => write!(
                f,
                "buffer of {len} bytes does not pack whole {point_size}-byte records"
            ),
            Self::Io(message) => write!(f, "chunk codec io error: {message}"),
        }
    }
}

impl std::error::Error for CodecError {}

/// Compress a packed record buffer laid out under `schema`.
pub fn compress(data: &[u8], schema: &Schema) -> Result<Vec<u8>, CodecError> {
    let point_size = schema.point_size();
    if point_size == 0 || data.len() % point_size != 0 {
        return Err(CodecError::RecordAlignment {
            len: data.len(),
            point_size,
        });
    }

    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .and_then(|_| encoder.finish())
        .map_err(|error| CodecError::Io(error.to_string()))
}

/// Decompress a chunk body and verify it holds exactly `expected_len` bytes
/// of records under `schema`.
pub fn decompress(data: &[u8], schema: &Schema, expected_len: usize) -> Result<Vec<u8>, CodecError> {
    let mut body = Vec::with_capacity(expected_len);
    DeflateDecoder::new(data)
        .read_to_end(&mut body)
        .map_err(|error| CodecError::CorruptChunk(format!("inflate failed: {error}")))?;

    if body.len() != expected_len {
        return Err(CodecError::CorruptChunk(format!(
            "decompressed to {} bytes, expected {expected_len}",
            body.len()
        )));
    }
    let point_size = schema.point_size();
    if point_size == 0 || expected_len % point_size != 0 {
        return Err(CodecError::RecordAlignment {
            len: expected_len,
            point_size,
        });
    }
    Ok(body)
}

/// Append the sparse trailer: the point count, then the marker.
pub fn seal_sparse(mut compressed: Vec<u8>, num_points: u64) -> Vec<u8> {
    compressed.extend_from_slice(&num_points.to_le_bytes());
    compressed.push(ChunkMarker::Sparse.as_byte());
    compressed
}

/// Append the contiguous trailer: just the marker.
pub fn seal_contiguous(mut compressed: Vec<u8>) -> Vec<u8> {
    compressed.push(ChunkMarker::Contiguous.as_byte());
    compressed
}

/// A persisted chunk with its trailer stripped.
#[derive(Debug)]
pub struct Unsealed {
    pub marker: ChunkMarker,
    /// Present for sparse bodies only.
    pub num_points: Option<u64>,
    /// Still compressed.
    pub body: Vec<u8>,
}

/// Pop the trailer off a persisted chunk: the marker byte, then for sparse
/// chunks the 8-byte little-endian point count.
pub fn unseal(mut bytes: Vec<u8>) -> Result<Unsealed, CodecError> {
    let Some(marker_byte) = bytes.pop() else {
        return Err(CodecError::CorruptChunk("empty chunk blob".to_string()));
    };
    let Some(marker) = ChunkMarker::from_byte(marker_byte) else {
        return Err(CodecError::CorruptChunk(format!(
            "invalid type marker {marker_byte:#04x}"
        )));
    };

    let num_points = match marker {
        ChunkMarker::Contiguous => None,
        ChunkMarker::Sparse => {
            if bytes.len() < 8 {
                return Err(CodecError::CorruptChunk(
                    "sparse trailer shorter than its point count".to_string(),
                ));
            }
            let at = bytes.len() - 8;
            let count = u64::from_le_bytes(bytes[at..].try_into().expect("8-byte trailer"));
            bytes.truncate(at);
            Some(count)
        }
    };

    Ok(Unsealed {
        marker,
        num_points,
        body: bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records(count: usize) -> Vec<u8> {
        let schema = Schema::xyz();
        let mut data = Vec::new();
        for i in 0..count {
            let mut record = vec![0u8; schema.point_size()];
            schema.write_point(
                &mut record,
                &crate::spatial::Point::new(i as f64, i as f64 * 2.0, 0.5),
            );
            data.extend_from_slice(&record);
        }
        data
    }

    #[test]
    fn compress_round_trips_bit_for_bit() {
        let schema = Schema::xyz();
        let data = records(16);
        let compressed = compress(&data, &schema).expect("compress should succeed");
        let restored =
            decompress(&compressed, &schema, data.len()).expect("decompress should succeed");
        assert_eq!(restored, data);
    }

    #[test]
    fn misaligned_buffers_are_rejected() {
        let schema = Schema::xyz();
        assert!(matches!(
            compress(&[0u8; 10], &schema),
            Err(CodecError::RecordAlignment { .. })
        ));
    }

    #[test]
    fn length_mismatch_is_a_corrupt_chunk() {
        let schema = Schema::xyz();
        let data = records(4);
        let compressed = compress(&data, &schema).expect("compress should succeed");
        assert!(matches!(
            decompress(&compressed, &schema, data.len() + schema.point_size()),
            Err(CodecError::CorruptChunk(_))
        ));
    }

    #[test]
    fn trailers_round_trip() {
        let sealed = seal_sparse(vec![1, 2, 3], 7);
        assert_eq!(*sealed.last().expect("marker"), ChunkMarker::SPARSE);
        let unsealed = unseal(sealed).expect("unseal should succeed");
        assert_eq!(unsealed.marker, ChunkMarker::Sparse);
        assert_eq!(unsealed.num_points, Some(7));
        assert_eq!(unsealed.body, vec![1, 2, 3]);

        let unsealed = unseal(seal_contiguous(vec![9])).expect("unseal should succeed");
        assert_eq!(unsealed.marker, ChunkMarker::Contiguous);
        assert_eq!(unsealed.num_points, None);
        assert_eq!(unsealed.body, vec![9]);
    }

    #[test]
    fn bad_trailers_are_corrupt_chunks() {
        assert!(matches!(
            unseal(Vec::new()),
            Err(CodecError::CorruptChunk(_))
        ));
        assert!(matches!(
            unseal(vec![0xff]),
            Err(CodecError::CorruptChunk(_))
        ));
        // Sparse marker with fewer than eight preceding bytes.
        assert!(matches!(
            unseal(vec![1, 2, ChunkMarker::SPARSE]),
            Err(CodecError::CorruptChunk(_))
        ));
    }
}
