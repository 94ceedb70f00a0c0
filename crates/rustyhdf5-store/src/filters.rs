//! Chunk filter pipeline: deflate, shuffle, fletcher32.
//!
//! Filters run forward on write and in reverse on read. Every chunk carries
//! a filter mask; bit `i` set means filter `i` was not applied to that
//! chunk, so the reverse pass skips it.

use std::fmt;

use tracing::{trace, warn};

use crate::error::{FormatError, Result};

/// Well-known filter IDs.
pub const FILTER_DEFLATE: u16 = 1;
pub const FILTER_SHUFFLE: u16 = 2;
pub const FILTER_FLETCHER32: u16 = 3;

/// Filter flag: a failure skips the filter instead of failing the write.
pub const FILTER_FLAG_OPTIONAL: u16 = 0x0001;

/// Maximum filters in a pipeline (one mask bit each).
pub const MAX_FILTERS: usize = 32;

/// Description of a single filter in a pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterDescription {
    /// Filter identification value.
    pub filter_id: u16,
    /// Filter flags (bit 0 = optional).
    pub flags: u16,
    /// Client data values passed to the filter.
    pub client_data: Vec<u32>,
}

impl FilterDescription {
    pub fn new(filter_id: u16) -> Self {
        Self {
            filter_id,
            flags: 0,
            client_data: Vec::new(),
        }
    }

    pub fn is_optional(&self) -> bool {
        self.flags & FILTER_FLAG_OPTIONAL != 0
    }
}

/// An ordered list of filters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterPipeline {
    pub filters: Vec<FilterDescription>,
}

impl fmt::Display for FilterPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.filters.is_empty() {
            return f.write_str("none");
        }
        for (i, filter) in self.filters.iter().enumerate() {
            if i > 0 {
                f.write_str(" -> ")?;
            }
            let name = match filter.filter_id {
                FILTER_DEFLATE => "deflate",
                FILTER_SHUFFLE => "shuffle",
                FILTER_FLETCHER32 => "fletcher32",
                _ => "unknown",
            };
            write!(f, "{name}")?;
            if filter.is_optional() {
                f.write_str("?")?;
            }
        }
        Ok(())
    }
}

impl FilterPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    /// Append an arbitrary filter. Unknown IDs are rejected when used.
    pub fn push(mut self, filter: FilterDescription) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn deflate(self, level: u32) -> Self {
        self.push(FilterDescription {
            filter_id: FILTER_DEFLATE,
            flags: 0,
            client_data: vec![level],
        })
    }

    pub fn shuffle(self) -> Self {
        self.push(FilterDescription::new(FILTER_SHUFFLE))
    }

    pub fn fletcher32(self) -> Self {
        self.push(FilterDescription::new(FILTER_FLETCHER32))
    }

    /// Mark the most recently added filter optional.
    pub fn optional(mut self) -> Self {
        if let Some(last) = self.filters.last_mut() {
            last.flags |= FILTER_FLAG_OPTIONAL;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.filters.len() > MAX_FILTERS {
            return Err(FormatError::InvalidArgument(format!(
                "pipeline has {} filters, at most {MAX_FILTERS} allowed",
                self.filters.len()
            )));
        }
        Ok(())
    }

    /// Run the filters in order. Returns the encoded bytes and the mask of
    /// optional filters that failed and were skipped.
    pub fn apply_forward(&self, data: &[u8], element_size: usize) -> Result<(Vec<u8>, u32)> {
        let mut mask = 0u32;
        let mut result = data.to_vec();
        for (i, filter) in self.filters.iter().enumerate() {
            match encode_one(filter, &result, element_size) {
                Ok(out) => result = out,
                Err(e) if filter.is_optional() => {
                    warn!(filter = filter.filter_id, error = %e, "optional filter skipped");
                    mask |= 1 << i;
                }
                Err(e) => return Err(e),
            }
        }
        trace!(raw = data.len(), encoded = result.len(), mask, "filters applied");
        Ok((result, mask))
    }

    /// Undo the filters in reverse order, skipping those set in `mask`.
    pub fn apply_reverse(&self, data: &[u8], mask: u32, element_size: usize) -> Result<Vec<u8>> {
        let mut result = data.to_vec();
        for (i, filter) in self.filters.iter().enumerate().rev() {
            if mask & (1 << i) != 0 {
                continue;
            }
            result = decode_one(filter, &result, element_size)?;
        }
        Ok(result)
    }
}

fn encode_one(filter: &FilterDescription, data: &[u8], element_size: usize) -> Result<Vec<u8>> {
    match filter.filter_id {
        FILTER_SHUFFLE => shuffle_compress(data, element_size),
        FILTER_DEFLATE => {
            let level = filter.client_data.first().copied().unwrap_or(6);
            deflate_compress(data, level)
        }
        FILTER_FLETCHER32 => Ok(fletcher32_append(data)),
        other => Err(FormatError::UnsupportedFilter(other)),
    }
}

fn decode_one(filter: &FilterDescription, data: &[u8], element_size: usize) -> Result<Vec<u8>> {
    match filter.filter_id {
        FILTER_SHUFFLE => shuffle_decompress(data, element_size),
        FILTER_DEFLATE => deflate_decompress(data),
        FILTER_FLETCHER32 => fletcher32_verify(data),
        other => Err(FormatError::UnsupportedFilter(other)),
    }
}

/// Decompress zlib-compressed data.
#[cfg(feature = "deflate")]
fn deflate_decompress(data: &[u8]) -> Result<Vec<u8>> {
    use std::io::Read;
    let mut decoder = flate2::read::ZlibDecoder::new(data);
    let mut result = Vec::new();
    decoder
        .read_to_end(&mut result)
        .map_err(|e| FormatError::DecompressionError(e.to_string()))?;
    Ok(result)
}

#[cfg(not(feature = "deflate"))]
fn deflate_decompress(_data: &[u8]) -> Result<Vec<u8>> {
    Err(FormatError::UnsupportedFilter(FILTER_DEFLATE))
}

/// Compress data with zlib.
#[cfg(feature = "deflate")]
fn deflate_compress(data: &[u8], level: u32) -> Result<Vec<u8>> {
    use std::io::Write;
    if level > 9 {
        return Err(FormatError::CompressionError(format!(
            "deflate level {level} out of range"
        )));
    }
    let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::new(level));
    encoder
        .write_all(data)
        .map_err(|e| FormatError::CompressionError(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| FormatError::CompressionError(e.to_string()))
}

#[cfg(not(feature = "deflate"))]
fn deflate_compress(_data: &[u8], _level: u32) -> Result<Vec<u8>> {
    Err(FormatError::UnsupportedFilter(FILTER_DEFLATE))
}

fn check_shuffle_len(data: &[u8], element_size: usize) -> Result<()> {
    if data.len() % element_size != 0 {
        return Err(FormatError::FilterError(
            "shuffle: data length not a multiple of element size".into(),
        ));
    }
    Ok(())
}

/// Unshuffle: all byte-0s of each element come first on disk, then all
/// byte-1s, and so on.
fn shuffle_decompress(data: &[u8], element_size: usize) -> Result<Vec<u8>> {
    if element_size <= 1 {
        return Ok(data.to_vec());
    }
    check_shuffle_len(data, element_size)?;
    let n = data.len() / element_size;
    let mut result = vec![0u8; data.len()];
    for i in 0..n {
        for j in 0..element_size {
            result[i * element_size + j] = data[j * n + i];
        }
    }
    Ok(result)
}

fn shuffle_compress(data: &[u8], element_size: usize) -> Result<Vec<u8>> {
    if element_size <= 1 {
        return Ok(data.to_vec());
    }
    check_shuffle_len(data, element_size)?;
    let n = data.len() / element_size;
    let mut result = vec![0u8; data.len()];
    for i in 0..n {
        for j in 0..element_size {
            result[j * n + i] = data[i * element_size + j];
        }
    }
    Ok(result)
}

/// HDF5's Fletcher32 over big-endian 16-bit words; an odd trailing byte
/// is the high half of a final word.
fn fletcher32_compute(data: &[u8]) -> u32 {
    // 360 words is the longest run whose sums cannot overflow a u32.
    const BLOCK_BYTES: usize = 720;
    let mut sum1: u32 = 0;
    let mut sum2: u32 = 0;

    let mut blocks = data.chunks(BLOCK_BYTES);
    for block in &mut blocks {
        for word in block.chunks(2) {
            let hi = word[0] as u32;
            let lo = word.get(1).copied().unwrap_or(0) as u32;
            sum1 += (hi << 8) | lo;
            sum2 += sum1;
        }
        sum1 %= 65535;
        sum2 %= 65535;
    }
    (sum2 << 16) | sum1
}

/// Verify and strip the trailing checksum.
fn fletcher32_verify(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < 4 {
        return Err(FormatError::FilterError(
            "fletcher32: data too short for checksum".into(),
        ));
    }
    let (payload, tail) = data.split_at(data.len() - 4);
    let expected = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
    let computed = fletcher32_compute(payload);
    if expected != computed {
        return Err(FormatError::ChecksumMismatch { expected, computed });
    }
    Ok(payload.to_vec())
}

fn fletcher32_append(data: &[u8]) -> Vec<u8> {
    let mut result = Vec::with_capacity(data.len() + 4);
    result.extend_from_slice(data);
    result.extend_from_slice(&fletcher32_compute(data).to_le_bytes());
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8).collect()
    }

    #[test]
    #[cfg(feature = "deflate")]
    fn deflate_python_zlib() {
        // zlib.compress(bytes(range(10)), 6)
        let compressed: Vec<u8> = vec![
            120, 156, 99, 96, 100, 98, 102, 97, 101, 99, 231, 224, 4, 0, 0, 175, 0, 46,
        ];
        let out = deflate_decompress(&compressed).unwrap();
        assert_eq!(out, (0u8..10).collect::<Vec<_>>());
    }

    #[test]
    fn shuffle_layout() {
        let data = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let shuffled = shuffle_compress(&data, 4).unwrap();
        assert_eq!(shuffled, [1, 5, 2, 6, 3, 7, 4, 8]);
        assert_eq!(shuffle_decompress(&shuffled, 4).unwrap(), data);
        assert!(shuffle_compress(&data[..7], 4).is_err());
        assert_eq!(shuffle_compress(&data[..7], 1).unwrap(), &data[..7]);
    }

    #[test]
    fn fletcher32_known_values() {
        assert_eq!(fletcher32_compute(&[]), 0);
        // One word 0x0102: sum1 = 0x0102, sum2 = 0x0102.
        assert_eq!(fletcher32_compute(&[1, 2]), 0x0102_0102);
        // Odd byte is the high half of the last word.
        assert_eq!(fletcher32_compute(&[1]), 0x0100_0100);
    }

    #[test]
    fn fletcher32_detects_corruption() {
        let mut encoded = fletcher32_append(&sample(1000));
        assert_eq!(fletcher32_verify(&encoded).unwrap(), sample(1000));
        encoded[10] ^= 0xff;
        assert!(matches!(
            fletcher32_verify(&encoded),
            Err(FormatError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    #[cfg(feature = "deflate")]
    fn full_pipeline() {
        let pipeline = FilterPipeline::new().shuffle().deflate(6).fletcher32();
        assert_eq!(pipeline.to_string(), "shuffle -> deflate -> fletcher32");
        let data = sample(4096);
        let (encoded, mask) = pipeline.apply_forward(&data, 4).unwrap();
        assert_eq!(mask, 0);
        assert!(encoded.len() < data.len());
        assert_eq!(pipeline.apply_reverse(&encoded, mask, 4).unwrap(), data);
    }

    #[test]
    fn optional_failure_sets_mask_bit() {
        // Shuffle fails on a ragged length; optional means skip it.
        let pipeline = FilterPipeline::new().shuffle().optional().fletcher32();
        let data = sample(7);
        let (encoded, mask) = pipeline.apply_forward(&data, 4).unwrap();
        assert_eq!(mask, 0b01);
        assert_eq!(encoded.len(), 11);
        assert_eq!(pipeline.apply_reverse(&encoded, mask, 4).unwrap(), data);

        let strict = FilterPipeline::new().shuffle();
        assert!(strict.apply_forward(&data, 4).is_err());
    }

    #[test]
    fn unknown_filter() {
        let pipeline = FilterPipeline::new().push(FilterDescription::new(307));
        assert!(matches!(
            pipeline.apply_forward(b"abc", 1),
            Err(FormatError::UnsupportedFilter(307))
        ));
        // Masked out, so reading never touches it.
        assert_eq!(pipeline.apply_reverse(b"abc", 1, 1).unwrap(), b"abc");
    }
}
