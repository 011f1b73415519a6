//! MatrixBlob codec: stable byte encoding of numeric matrices.
//!
//! A matrix is stored as its element type tag, its dimensions and the raw
//! little-endian row-major element bytes. Compression is a separate step
//! (zlib/DEFLATE) applied by whoever persists the blob.

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use ndarray::Array2;
use std::io::{Read, Write};
use thiserror::Error;

/// Version of the blob layout. Bumped whenever the byte layout changes.
pub const BLOB_FORMAT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("malformed blob: {rows}x{cols} {element_type:?} needs {expected} bytes, got {actual}")]
    MalformedBlob {
        element_type: ElementType,
        rows: usize,
        cols: usize,
        expected: usize,
        actual: usize,
    },
    #[error("unknown element type tag {0}")]
    UnknownElementType(i32),
    #[error("decompression failed: {0}")]
    DecompressionFailed(#[source] std::io::Error),
    #[error("compression failed: {0}")]
    CompressionFailed(#[source] std::io::Error),
    #[error("expected {expected:?} matrix, got {actual:?}")]
    UnexpectedElementType {
        expected: ElementType,
        actual: ElementType,
    },
}

/// Primitive element type of a matrix.
///
/// Tags match the OpenCV depth codes so existing face databases keep reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    I32,
    F32,
    F64,
}

impl ElementType {
    pub fn tag(self) -> i32 {
        match self {
            ElementType::I32 => 4,
            ElementType::F32 => 5,
            ElementType::F64 => 6,
        }
    }

    pub fn from_tag(tag: i32) -> Result<Self, CodecError> {
        match tag {
            4 => Ok(ElementType::I32),
            5 => Ok(ElementType::F32),
            6 => Ok(ElementType::F64),
            other => Err(CodecError::UnknownElementType(other)),
        }
    }

    pub fn size(self) -> usize {
        match self {
            ElementType::I32 | ElementType::F32 => 4,
            ElementType::F64 => 8,
        }
    }
}

/// A typed 2-D matrix.
#[derive(Debug, Clone, PartialEq)]
pub enum Matrix {
    I32(Array2<i32>),
    F32(Array2<f32>),
    F64(Array2<f64>),
}

impl Matrix {
    pub fn element_type(&self) -> ElementType {
        match self {
            Matrix::I32(_) => ElementType::I32,
            Matrix::F32(_) => ElementType::F32,
            Matrix::F64(_) => ElementType::F64,
        }
    }

    pub fn dim(&self) -> (usize, usize) {
        match self {
            Matrix::I32(m) => m.dim(),
            Matrix::F32(m) => m.dim(),
            Matrix::F64(m) => m.dim(),
        }
    }

    pub fn into_f32(self) -> Result<Array2<f32>, CodecError> {
        match self {
            Matrix::F32(m) => Ok(m),
            other => Err(CodecError::UnexpectedElementType {
                expected: ElementType::F32,
                actual: other.element_type(),
            }),
        }
    }

    pub fn into_f64(self) -> Result<Array2<f64>, CodecError> {
        match self {
            Matrix::F64(m) => Ok(m),
            other => Err(CodecError::UnexpectedElementType {
                expected: ElementType::F64,
                actual: other.element_type(),
            }),
        }
    }

    pub fn into_i32(self) -> Result<Array2<i32>, CodecError> {
        match self {
            Matrix::I32(m) => Ok(m),
            other => Err(CodecError::UnexpectedElementType {
                expected: ElementType::I32,
                actual: other.element_type(),
            }),
        }
    }
}

/// Encoded matrix: type tag, dimensions and raw element bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatrixBlob {
    pub element_type: ElementType,
    pub rows: usize,
    pub cols: usize,
    pub bytes: Vec<u8>,
}

/// Copy a matrix's elements out in row-major order.
pub fn encode(matrix: &Matrix) -> MatrixBlob {
    match matrix {
        Matrix::I32(m) => encode_i32(m),
        Matrix::F32(m) => encode_f32(m),
        Matrix::F64(m) => encode_f64(m),
    }
}

macro_rules! encoder {
    ($name:ident, $ty:ty, $element:expr) => {
        pub fn $name(matrix: &Array2<$ty>) -> MatrixBlob {
            let (rows, cols) = matrix.dim();
            let mut bytes = Vec::with_capacity(rows * cols * std::mem::size_of::<$ty>());
            // `iter()` walks logical row-major order regardless of memory layout.
            for v in matrix.iter() {
                bytes.extend_from_slice(&v.to_le_bytes());
            }
            MatrixBlob {
                element_type: $element,
                rows,
                cols,
                bytes,
            }
        }
    };
}

encoder!(encode_i32, i32, ElementType::I32);
encoder!(encode_f32, f32, ElementType::F32);
encoder!(encode_f64, f64, ElementType::F64);

/// Rebuild a matrix from a blob. The result owns a copy of the bytes.
pub fn decode(blob: &MatrixBlob) -> Result<Matrix, CodecError> {
    let size = blob.element_type.size();
    let expected = blob
        .rows
        .checked_mul(blob.cols)
        .and_then(|n| n.checked_mul(size));

    if expected != Some(blob.bytes.len()) {
        return Err(CodecError::MalformedBlob {
            element_type: blob.element_type,
            rows: blob.rows,
            cols: blob.cols,
            expected: expected.unwrap_or(usize::MAX),
            actual: blob.bytes.len(),
        });
    }

    let shape = (blob.rows, blob.cols);
    let malformed = |_| CodecError::MalformedBlob {
        element_type: blob.element_type,
        rows: blob.rows,
        cols: blob.cols,
        expected: blob.bytes.len(),
        actual: blob.bytes.len(),
    };

    let matrix = match blob.element_type {
        ElementType::I32 => {
            let values = blob
                .bytes
                .chunks_exact(4)
                .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            Matrix::I32(Array2::from_shape_vec(shape, values).map_err(malformed)?)
        }
        ElementType::F32 => {
            let values = blob
                .bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            Matrix::F32(Array2::from_shape_vec(shape, values).map_err(malformed)?)
        }
        ElementType::F64 => {
            let values = blob
                .bytes
                .chunks_exact(8)
                .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect();
            Matrix::F64(Array2::from_shape_vec(shape, values).map_err(malformed)?)
        }
    };

    Ok(matrix)
}

/// zlib-compress a byte buffer.
pub fn compress(bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(bytes.len() / 2), Compression::default());
    encoder
        .write_all(bytes)
        .map_err(CodecError::CompressionFailed)?;
    encoder.finish().map_err(CodecError::CompressionFailed)
}

/// Inverse of [`compress`].
pub fn decompress(bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::with_capacity(bytes.len() * 2);
    ZlibDecoder::new(bytes)
        .read_to_end(&mut out)
        .map_err(CodecError::DecompressionFailed)?;
    Ok(out)
}
