//! IDX buffers.
//!
//! The IDX format stores a multi-dimensional array of a primitive type:
//!
//! ```text
//! 0x00 0x00 <type> <ndims> | <dim 0: u32 be> ... <dim n-1: u32 be> | payload
//! ```
//!
//! Only unsigned bytes (`type = 0x08`) are supported, which covers the MNIST family of
//! datasets.

use std::ops::Range;

use thiserror::Error;

const fn range(start: usize, length: usize) -> Range<usize> {
    start..(start + length)
}

const MAGIC_RANGE: Range<usize> = range(0, 2);
const TYPE_FIELD: usize = 2;
const NDIMS_FIELD: usize = 3;
const DIMS_START: usize = 4;
const DIM_LENGTH: usize = 4;

/// The IDX type code of unsigned bytes.
pub const TYPE_U8: u8 = 0x08;

#[derive(Debug, Error, PartialEq, Eq)]
/// Errors related to the decoding of IDX buffers.
pub enum IdxError {
    #[error("invalid magic number: expected two zero bytes")]
    InvalidMagic,
    #[error("unsupported data type 0x{0:02x}")]
    UnsupportedType(u8),
    #[error("invalid buffer length: {actual} < {expected}")]
    Truncated { actual: usize, expected: usize },
    #[error("payload of {actual} bytes doesn't match the {expected} bytes of the dimensions")]
    PayloadMismatch { actual: usize, expected: usize },
}

/// A wrapper around a buffer that contains an IDX array.
///
/// It provides getters to access the different fields of the header safely.
pub struct IdxBuffer<T> {
    inner: T,
}

impl<T: AsRef<[u8]>> IdxBuffer<T> {
    /// Performs bound checks for the various fields on `bytes` and returns a new [`IdxBuffer`].
    ///
    /// # Errors
    /// Fails if the header is malformed or if the payload doesn't match the dimensions.
    pub fn new(bytes: T) -> Result<Self, IdxError> {
        let buffer = Self { inner: bytes };
        buffer.check_buffer_length()?;
        Ok(buffer)
    }

    /// Performs bound checks to ensure the fields can be accessed without panicking.
    pub fn check_buffer_length(&self) -> Result<(), IdxError> {
        let bytes = self.inner.as_ref();
        if bytes.len() < DIMS_START {
            return Err(IdxError::Truncated {
                actual: bytes.len(),
                expected: DIMS_START,
            });
        }
        if bytes[MAGIC_RANGE] != [0, 0] {
            return Err(IdxError::InvalidMagic);
        }
        if bytes[TYPE_FIELD] != TYPE_U8 {
            return Err(IdxError::UnsupportedType(bytes[TYPE_FIELD]));
        }

        let header_length = self.header_length();
        if bytes.len() < header_length {
            return Err(IdxError::Truncated {
                actual: bytes.len(),
                expected: header_length,
            });
        }

        let expected: usize = self.dims().iter().product();
        let actual = bytes.len() - header_length;
        if actual != expected {
            return Err(IdxError::PayloadMismatch { actual, expected });
        }
        Ok(())
    }

    /// Gets the number of dimensions.
    pub fn ndims(&self) -> usize {
        self.inner.as_ref()[NDIMS_FIELD] as usize
    }

    /// Gets the length of the header including the dimensions.
    pub fn header_length(&self) -> usize {
        DIMS_START + self.ndims() * DIM_LENGTH
    }

    /// Gets the dimensions.
    pub fn dims(&self) -> Vec<usize> {
        let bytes = self.inner.as_ref();
        (0..self.ndims())
            .map(|i| {
                let field = range(DIMS_START + i * DIM_LENGTH, DIM_LENGTH);
                let mut be = [0_u8; DIM_LENGTH];
                be.copy_from_slice(&bytes[field]);
                u32::from_be_bytes(be) as usize
            })
            .collect()
    }

    /// Gets the payload.
    pub fn payload(&self) -> &[u8] {
        &self.inner.as_ref()[self.header_length()..]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A decoded IDX array of unsigned bytes.
pub struct IdxArray {
    /// The dimensions of the array. The first dimension counts the records.
    pub dims: Vec<usize>,
    /// The values in row-major order.
    pub data: Vec<u8>,
}

impl IdxArray {
    /// Decodes an IDX array from the given bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self, IdxError> {
        let buffer = IdxBuffer::new(bytes)?;
        Ok(Self {
            dims: buffer.dims(),
            data: buffer.payload().to_vec(),
        })
    }

    /// Encodes the array into an IDX buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0, 0, TYPE_U8, self.dims.len() as u8];
        for dim in &self.dims {
            bytes.extend_from_slice(&(*dim as u32).to_be_bytes());
        }
        bytes.extend_from_slice(&self.data);
        bytes
    }

    /// Gets the number of records.
    pub fn len(&self) -> usize {
        self.dims.first().copied().unwrap_or(0)
    }

    /// Checks whether the array has no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Gets the number of values per record.
    pub fn record_size(&self) -> usize {
        self.dims.iter().skip(1).product()
    }

    /// Gets the values of the records in the given range.
    pub fn records(&self, records: Range<usize>) -> &[u8] {
        let size = self.record_size();
        &self.data[records.start * size..records.end * size]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn images() -> Vec<u8> {
        let mut bytes = vec![
            0x00, 0x00, // magic
            0x08, // unsigned bytes
            0x03, // three dimensions
        ];
        bytes.extend_from_slice(&[0, 0, 0, 2]); // two records
        bytes.extend_from_slice(&[0, 0, 0, 2]); // two rows
        bytes.extend_from_slice(&[0, 0, 0, 3]); // three columns
        bytes.extend(0..12_u8);
        bytes
    }

    #[test]
    fn test_buffer_getters() {
        let bytes = images();
        let buffer = IdxBuffer::new(&bytes).unwrap();
        assert_eq!(buffer.ndims(), 3);
        assert_eq!(buffer.header_length(), 16);
        assert_eq!(buffer.dims(), vec![2, 2, 3]);
        assert_eq!(buffer.payload(), (0..12).collect::<Vec<u8>>().as_slice());
    }

    #[test]
    fn test_parse() {
        let array = IdxArray::parse(&images()).unwrap();
        assert_eq!(array.len(), 2);
        assert_eq!(array.record_size(), 6);
        assert_eq!(array.records(1..2), &[6, 7, 8, 9, 10, 11]);
        assert_eq!(array.to_bytes(), images());
    }

    #[test]
    fn test_invalid_magic() {
        let mut bytes = images();
        bytes[1] = 0x01;
        assert_eq!(IdxArray::parse(&bytes), Err(IdxError::InvalidMagic));
    }

    #[test]
    fn test_unsupported_type() {
        let mut bytes = images();
        bytes[2] = 0x0d; // float
        assert_eq!(IdxArray::parse(&bytes), Err(IdxError::UnsupportedType(0x0d)));
    }

    #[test]
    fn test_truncated() {
        let bytes = images();
        assert_eq!(
            IdxArray::parse(&bytes[..3]),
            Err(IdxError::Truncated {
                actual: 3,
                expected: 4
            })
        );
        assert_eq!(
            IdxArray::parse(&bytes[..10]),
            Err(IdxError::Truncated {
                actual: 10,
                expected: 16
            })
        );
        assert_eq!(
            IdxArray::parse(&bytes[..20]),
            Err(IdxError::PayloadMismatch {
                actual: 4,
                expected: 12
            })
        );
    }

    #[test]
    fn test_labels() {
        let array = IdxArray {
            dims: vec![3],
            data: vec![7, 2, 1],
        };
        let parsed = IdxArray::parse(&array.to_bytes()).unwrap();
        assert_eq!(parsed, array);
        assert_eq!(parsed.record_size(), 1);
    }
}
