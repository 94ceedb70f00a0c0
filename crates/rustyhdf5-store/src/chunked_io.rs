//! Hyperslab I/O on chunked datasets.
//!
//! A request is a rectangular selection (`offset`, `size`, in elements) and
//! a packed row-major buffer of that shape. Every chunk the selection
//! touches is visited in row-major chunk order and the overlapping part is
//! copied row by row, either through the raw data chunk cache or straight
//! to the chunk's file storage.

use std::rc::Rc;

use tracing::{debug, trace};

use crate::chunk_cache::{ChunkStorage, RawChunkCache};
use crate::chunk_index::{self, ChunkInfo, ChunkLayout};
use crate::error::{FormatError, Result};
use crate::file::{FileContext, Hdf5File};
use crate::filters::FilterPipeline;

/// A single contiguous copy between a chunk buffer and a request buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowCopy {
    /// Byte offset within the chunk.
    pub chunk_offset: usize,
    /// Byte offset within the request buffer.
    pub buf_offset: usize,
    /// Number of bytes to copy.
    pub len: usize,
}

fn strides(dims: &[u64]) -> Vec<u64> {
    let mut s = vec![1u64; dims.len()];
    for i in (0..dims.len().saturating_sub(1)).rev() {
        s[i] = s[i + 1] * dims[i + 1];
    }
    s
}

/// Compute contiguous row copies between one chunk and a request.
///
/// The innermost dimension is contiguous in both buffers, so each run along
/// it becomes one `RowCopy`; the outer dimensions are walked odometer
/// style over the intersection.
pub fn row_copies(
    chunk_offset: &[u64],
    chunk_dims: &[u64],
    req_offset: &[u64],
    req_size: &[u64],
    elem_size: usize,
) -> Vec<RowCopy> {
    let rank = chunk_dims.len();
    if rank == 0 {
        return Vec::new();
    }
    let mut lo = Vec::with_capacity(rank);
    let mut hi = Vec::with_capacity(rank);
    for d in 0..rank {
        let l = chunk_offset[d].max(req_offset[d]);
        let h = chunk_offset[d]
            .saturating_add(chunk_dims[d])
            .min(req_offset[d].saturating_add(req_size[d]));
        if l >= h {
            return Vec::new();
        }
        lo.push(l);
        hi.push(h);
    }

    let chunk_strides = strides(chunk_dims);
    let req_strides = strides(req_size);
    let inner = rank - 1;
    let len = (hi[inner] - lo[inner]) as usize * elem_size;

    let nrows: u64 = (0..inner).map(|d| hi[d] - lo[d]).product();
    let mut copies = Vec::with_capacity(nrows as usize);
    let mut coord = lo.clone();
    loop {
        let mut c = 0u64;
        let mut b = 0u64;
        for d in 0..rank {
            c += (coord[d] - chunk_offset[d]) * chunk_strides[d];
            b += (coord[d] - req_offset[d]) * req_strides[d];
        }
        copies.push(RowCopy {
            chunk_offset: c as usize * elem_size,
            buf_offset: b as usize * elem_size,
            len,
        });

        // Advance the outer dimensions.
        let mut d = inner;
        loop {
            if d == 0 {
                return copies;
            }
            d -= 1;
            coord[d] += 1;
            if coord[d] < hi[d] {
                break;
            }
            coord[d] = lo[d];
        }
    }
}

/// A chunked dataset: chunk index, filters and fill value.
#[derive(Debug, Clone)]
pub struct ChunkedDataset {
    storage: Rc<ChunkStorage>,
    direct_io: bool,
}

impl ChunkedDataset {
    /// Create a dataset with an empty chunk index.
    ///
    /// `fill` is the value of one element; empty means zero.
    pub fn create(
        ctx: &mut FileContext,
        chunk_dims: &[u64],
        elem_size: usize,
        pipeline: FilterPipeline,
        fill: Vec<u8>,
    ) -> Result<Self> {
        if elem_size == 0 {
            return Err(FormatError::InvalidArgument("zero element size".into()));
        }
        let mut dims = chunk_dims.to_vec();
        dims.push(elem_size as u64);
        ChunkLayout::check_dims(&dims)?;
        pipeline.validate()?;
        let layout = chunk_index::create_index(ctx, dims)?;
        Self::open(layout, pipeline, fill)
    }

    /// Attach to an existing chunk index.
    pub fn open(layout: ChunkLayout, pipeline: FilterPipeline, fill: Vec<u8>) -> Result<Self> {
        let storage = ChunkStorage::new(layout, pipeline, fill)?;
        Ok(Self {
            storage: Rc::new(storage),
            direct_io: false,
        })
    }

    /// Bypass the chunk cache for unfiltered chunks, so independent writers
    /// of disjoint elements in one chunk never overwrite each other with
    /// stale cached copies. Filtered datasets always go through the cache.
    pub fn with_direct_io(mut self, on: bool) -> Self {
        self.direct_io = on;
        self
    }

    pub fn layout(&self) -> &ChunkLayout {
        &self.storage.layout
    }

    pub fn storage(&self) -> &Rc<ChunkStorage> {
        &self.storage
    }

    pub fn rank(&self) -> usize {
        self.storage.layout.rank()
    }

    pub fn elem_size(&self) -> usize {
        self.storage.layout.elem_size()
    }

    /// Chunk dimensions in elements.
    pub fn chunk_dims(&self) -> &[u64] {
        &self.storage.layout.dims[..self.rank()]
    }

    pub fn chunks(&self, ctx: &mut FileContext) -> Result<Vec<ChunkInfo>> {
        chunk_index::chunks(ctx, &self.storage.layout)
    }

    fn check_request(&self, offset: &[u64], size: &[u64], buf_len: usize) -> Result<()> {
        let rank = self.rank();
        if offset.len() != rank || size.len() != rank {
            return Err(FormatError::InvalidArgument(format!(
                "selection rank {}/{} does not match dataset rank {rank}",
                offset.len(),
                size.len()
            )));
        }
        let nelems = size
            .iter()
            .try_fold(1u64, |acc, &s| acc.checked_mul(s))
            .ok_or_else(|| FormatError::InvalidArgument("selection too large".into()))?;
        self.check_bounds(offset, size)?;
        let expected = usize::try_from(nelems)
            .ok()
            .and_then(|n| n.checked_mul(self.elem_size()))
            .ok_or_else(|| FormatError::InvalidArgument("selection too large".into()))?;
        if buf_len != expected {
            return Err(FormatError::InvalidArgument(format!(
                "buffer holds {buf_len} bytes, selection needs {expected}"
            )));
        }
        Ok(())
    }

    /// The end of the last chunk a selection touches must be addressable.
    fn check_bounds(&self, offset: &[u64], size: &[u64]) -> Result<()> {
        let overflows = offset
            .iter()
            .zip(size)
            .zip(self.chunk_dims())
            .filter(|((_, s), _)| **s > 0)
            .any(|((&o, &s), &d)| {
                o.checked_add(s - 1)
                    .and_then(|last| (last / d * d).checked_add(d))
                    .is_none()
            });
        if overflows {
            return Err(FormatError::InvalidArgument("selection overflows".into()));
        }
        Ok(())
    }

    /// Offsets of every chunk the selection touches, row-major.
    fn touched_chunks(&self, offset: &[u64], size: &[u64]) -> Vec<Vec<u64>> {
        let dims = self.chunk_dims();
        if size.contains(&0) {
            return Vec::new();
        }
        let idx_min: Vec<u64> = offset.iter().zip(dims).map(|(o, d)| o / d).collect();
        let idx_max: Vec<u64> = offset
            .iter()
            .zip(size)
            .zip(dims)
            .map(|((o, s), d)| (o + s - 1) / d + 1)
            .collect();

        let mut out = Vec::new();
        let mut cur = idx_min.clone();
        loop {
            out.push(cur.iter().zip(dims).map(|(i, d)| i * d).collect());
            let mut carry = true;
            for d in (0..cur.len()).rev() {
                cur[d] += 1;
                if cur[d] < idx_max[d] {
                    carry = false;
                    break;
                }
                cur[d] = idx_min[d];
            }
            if carry {
                return out;
            }
        }
    }

    /// Where an unfiltered chunk can be accessed in the file directly.
    fn direct_target(
        &self,
        ctx: &mut FileContext,
        rdcc: &RawChunkCache,
        chunk: &[u64],
    ) -> Result<Option<ChunkInfo>> {
        if !self.storage.pipeline.is_empty() {
            return Ok(None);
        }
        let too_big = self.storage.layout.chunk_bytes() > rdcc.max_bytes();
        if !self.direct_io && !too_big {
            return Ok(None);
        }
        chunk_index::lookup(ctx, &self.storage.layout, chunk)
    }

    /// Read the selection into `buf`.
    pub fn read(&self, file: &mut Hdf5File, offset: &[u64], size: &[u64], buf: &mut [u8]) -> Result<()> {
        self.check_request(offset, size, buf.len())?;
        let (ctx, rdcc) = file.parts_mut();
        let elem = self.elem_size();
        for chunk in self.touched_chunks(offset, size) {
            let copies = row_copies(&chunk, self.chunk_dims(), offset, size, elem);
            let naccessed: usize = copies.iter().map(|c| c.len).sum();

            if let Some(info) = self.direct_target(ctx, rdcc, &chunk)? {
                rdcc.preempt_chunk(ctx, &self.storage.layout, &chunk)?;
                for c in &copies {
                    ctx.read(info.address + c.chunk_offset as u64, &mut buf[c.buf_offset..c.buf_offset + c.len])?;
                }
                trace!(?chunk, naccessed, "direct chunk read");
                continue;
            }

            let handle = rdcc.lock(ctx, &self.storage, &chunk, false)?;
            let copied = rdcc.chunk(&handle).map(|data| {
                for c in &copies {
                    buf[c.buf_offset..c.buf_offset + c.len]
                        .copy_from_slice(&data[c.chunk_offset..c.chunk_offset + c.len]);
                }
            });
            rdcc.unlock(ctx, handle, false, naccessed)?;
            copied?;
        }
        Ok(())
    }

    /// Write `buf` to the selection.
    pub fn write(&self, file: &mut Hdf5File, offset: &[u64], size: &[u64], buf: &[u8]) -> Result<()> {
        self.check_request(offset, size, buf.len())?;
        let (ctx, rdcc) = file.parts_mut();
        let elem = self.elem_size();
        let chunk_bytes = self.storage.layout.chunk_bytes();
        for chunk in self.touched_chunks(offset, size) {
            let copies = row_copies(&chunk, self.chunk_dims(), offset, size, elem);
            let naccessed: usize = copies.iter().map(|c| c.len).sum();

            let direct = match self.direct_target(ctx, rdcc, &chunk)? {
                Some(info) => Some(info),
                None if self.direct_io && self.storage.pipeline.is_empty() => {
                    // Forced bypass of a chunk that is not stored yet.
                    let mut fill = vec![0u8; chunk_bytes];
                    self.storage.fill_chunk(&mut fill);
                    rdcc.preempt_chunk(ctx, &self.storage.layout, &chunk)?;
                    if let Some(info) = chunk_index::lookup(ctx, &self.storage.layout, &chunk)? {
                        Some(info)
                    } else {
                        Some(self.storage.write_chunk(ctx, &chunk, &fill)?)
                    }
                }
                None => None,
            };
            if let Some(info) = direct {
                rdcc.preempt_chunk(ctx, &self.storage.layout, &chunk)?;
                for c in &copies {
                    ctx.write(info.address + c.chunk_offset as u64, &buf[c.buf_offset..c.buf_offset + c.len])?;
                }
                trace!(?chunk, naccessed, "direct chunk write");
                continue;
            }

            // A selection covering the whole chunk does not need the old
            // contents.
            let relax = naccessed == chunk_bytes;
            let mut handle = rdcc.lock(ctx, &self.storage, &chunk, relax)?;
            let copied = rdcc.chunk_mut(&mut handle).map(|data| {
                for c in &copies {
                    data[c.chunk_offset..c.chunk_offset + c.len]
                        .copy_from_slice(&buf[c.buf_offset..c.buf_offset + c.len]);
                }
            });
            rdcc.unlock(ctx, handle, copied.is_ok(), naccessed)?;
            copied?;
        }
        Ok(())
    }

    /// Store every chunk covering `[0, extent)` that is not stored yet,
    /// filled with the fill value. Returns the number of chunks written.
    pub fn allocate(&self, file: &mut Hdf5File, extent: &[u64]) -> Result<usize> {
        if extent.len() != self.rank() {
            return Err(FormatError::InvalidArgument(format!(
                "extent rank {} does not match dataset rank {}",
                extent.len(),
                self.rank()
            )));
        }
        let origin = vec![0u64; self.rank()];
        self.check_bounds(&origin, extent)?;
        let (ctx, rdcc) = file.parts_mut();
        let mut fill = vec![0u8; self.storage.layout.chunk_bytes()];
        self.storage.fill_chunk(&mut fill);

        let mut written = 0;
        for chunk in self.touched_chunks(&origin, extent) {
            // A dirty cached chunk reaches the index on its next flush.
            if rdcc.is_dirty(&self.storage.layout, &chunk) {
                continue;
            }
            if chunk_index::lookup(ctx, &self.storage.layout, &chunk)?.is_none() {
                self.storage.write_chunk(ctx, &chunk, &fill)?;
                written += 1;
            }
        }
        debug!(?extent, written, "allocated chunks");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FileConfig, RdccConfig};

    fn file(rdcc: RdccConfig) -> Hdf5File {
        Hdf5File::create_memory(FileConfig::new().chunk_btree_k(4).rdcc(rdcc)).unwrap()
    }

    fn pattern(n: usize) -> Vec<u8> {
        (0..n).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn row_copies_2d() {
        // 4x4 chunk at (4, 4); request rows 5..7, cols 2..6.
        let copies = row_copies(&[4, 4], &[4, 4], &[5, 2], &[2, 4], 2);
        assert_eq!(
            copies,
            vec![
                RowCopy { chunk_offset: 8, buf_offset: 4, len: 4 },
                RowCopy { chunk_offset: 16, buf_offset: 12, len: 4 },
            ]
        );
        assert!(row_copies(&[0, 0], &[4, 4], &[4, 0], &[1, 1], 1).is_empty());
    }

    #[test]
    fn row_copies_1d() {
        let copies = row_copies(&[10], &[10], &[5], &[20], 4);
        assert_eq!(copies, vec![RowCopy { chunk_offset: 0, buf_offset: 20, len: 40 }]);
    }

    #[test]
    fn touched_chunk_order() {
        let mut f = file(RdccConfig::new());
        let ds = ChunkedDataset::create(f.context_mut(), &[2, 3], 1, FilterPipeline::new(), Vec::new()).unwrap();
        let touched = ds.touched_chunks(&[1, 2], &[2, 2]);
        assert_eq!(touched, vec![vec![0, 0], vec![0, 3], vec![2, 0], vec![2, 3]]);
        assert!(ds.touched_chunks(&[0, 0], &[0, 5]).is_empty());
    }

    #[test]
    fn write_read_2d() {
        let mut f = file(RdccConfig::new());
        let ds = ChunkedDataset::create(f.context_mut(), &[3, 4], 2, FilterPipeline::new(), Vec::new()).unwrap();
        let data = pattern(7 * 9 * 2);
        ds.write(&mut f, &[1, 2], &[7, 9], &data).unwrap();

        let mut back = vec![0u8; data.len()];
        ds.read(&mut f, &[1, 2], &[7, 9], &mut back).unwrap();
        assert_eq!(back, data);

        // A sub-selection sees the matching elements.
        let mut one = vec![0u8; 2];
        ds.read(&mut f, &[4, 5], &[1, 1], &mut one).unwrap();
        let i = ((4 - 1) * 9 + (5 - 2)) * 2;
        assert_eq!(one, data[i..i + 2]);
    }

    #[test]
    fn unwritten_elements_read_as_fill() {
        let mut f = file(RdccConfig::new());
        let ds = ChunkedDataset::create(f.context_mut(), &[4], 2, FilterPipeline::new(), vec![0xab, 0xcd]).unwrap();
        ds.write(&mut f, &[1], &[2], &[1, 2, 3, 4]).unwrap();
        let mut back = vec![0u8; 12];
        ds.read(&mut f, &[0], &[6], &mut back).unwrap();
        assert_eq!(back, [0xab, 0xcd, 1, 2, 3, 4, 0xab, 0xcd, 0xab, 0xcd, 0xab, 0xcd]);
    }

    #[test]
    fn bad_requests() {
        let mut f = file(RdccConfig::new());
        let ds = ChunkedDataset::create(f.context_mut(), &[4, 4], 1, FilterPipeline::new(), Vec::new()).unwrap();
        let mut buf = vec![0u8; 4];
        assert!(ds.read(&mut f, &[0], &[4], &mut buf).is_err());
        assert!(ds.read(&mut f, &[0, 0], &[2, 3], &mut buf).is_err());
        assert!(ChunkedDataset::create(f.context_mut(), &[4], 0, FilterPipeline::new(), Vec::new()).is_err());

        let wide = ChunkedDataset::create(f.context_mut(), &[4], 4, FilterPipeline::new(), Vec::new()).unwrap();
        assert!(matches!(
            wide.read(&mut f, &[0], &[1 << 62], &mut []),
            Err(FormatError::InvalidArgument(_))
        ));
        assert!(ChunkedDataset::create(f.context_mut(), &[4], 4, FilterPipeline::new(), vec![1]).is_err());
    }

    #[test]
    fn oversize_unfiltered_chunks_go_direct() {
        // Cache budget smaller than one chunk.
        let mut f = file(RdccConfig::new().bytes(16));
        let ds = ChunkedDataset::create(f.context_mut(), &[8, 8], 1, FilterPipeline::new(), Vec::new()).unwrap();
        let data = pattern(64);
        // First write stores the chunk through an uncached handle.
        ds.write(&mut f, &[0, 0], &[8, 8], &data).unwrap();
        // Later partial writes hit the stored chunk directly.
        ds.write(&mut f, &[2, 2], &[1, 2], &[200, 201]).unwrap();
        let mut back = vec![0u8; 64];
        ds.read(&mut f, &[0, 0], &[8, 8], &mut back).unwrap();
        let mut expected = data.clone();
        expected[2 * 8 + 2] = 200;
        expected[2 * 8 + 3] = 201;
        assert_eq!(back, expected);
        assert_eq!(f.rdcc().stats().nused, 0);
    }

    #[test]
    fn direct_io_keeps_cache_coherent() {
        let mut f = file(RdccConfig::new());
        let cached = ChunkedDataset::create(f.context_mut(), &[4], 1, FilterPipeline::new(), Vec::new()).unwrap();
        cached.write(&mut f, &[0], &[4], &[1, 2, 3, 4]).unwrap();
        assert!(f.rdcc().is_dirty(cached.layout(), &[0]));

        let direct = cached.clone().with_direct_io(true);
        direct.write(&mut f, &[1], &[1], &[9]).unwrap();
        assert!(!f.rdcc().contains(direct.layout(), &[0]));

        let mut back = [0u8; 4];
        cached.read(&mut f, &[0], &[4], &mut back).unwrap();
        assert_eq!(back, [1, 9, 3, 4]);

        // Forced bypass of a chunk nobody stored yet.
        direct.write(&mut f, &[6], &[1], &[7]).unwrap();
        let mut back = [0u8; 4];
        direct.read(&mut f, &[4], &[4], &mut back).unwrap();
        assert_eq!(back, [0, 0, 7, 0]);
    }

    #[test]
    fn allocate_fills_missing_chunks() {
        let mut f = file(RdccConfig::new());
        let ds = ChunkedDataset::create(f.context_mut(), &[2, 2], 1, FilterPipeline::new(), vec![5]).unwrap();
        ds.write(&mut f, &[0, 0], &[2, 2], &[1, 1, 1, 1]).unwrap();
        f.flush().unwrap();
        let written = ds.allocate(&mut f, &[3, 4]).unwrap();
        // 2x2 chunk grid minus the one already stored.
        assert_eq!(written, 3);
        assert_eq!(ds.chunks(f.context_mut()).unwrap().len(), 4);
        assert_eq!(ds.allocate(&mut f, &[3, 4]).unwrap(), 0);

        let mut back = vec![0u8; 4];
        ds.read(&mut f, &[2, 2], &[2, 2], &mut back).unwrap();
        assert_eq!(back, [5, 5, 5, 5]);
    }

    #[test]
    fn allocate_stores_chunks_that_were_only_read() {
        let mut f = file(RdccConfig::new());
        let ds = ChunkedDataset::create(f.context_mut(), &[2], 1, FilterPipeline::new(), vec![5]).unwrap();
        let mut back = [0u8; 2];
        ds.read(&mut f, &[0], &[2], &mut back).unwrap();
        assert_eq!(back, [5, 5]);
        assert!(f.rdcc().contains(ds.layout(), &[0]));

        assert_eq!(ds.allocate(&mut f, &[4]).unwrap(), 2);
        f.flush().unwrap();
        let stored = ds.chunks(f.context_mut()).unwrap();
        assert_eq!(stored.iter().map(|c| c.offsets[0]).collect::<Vec<_>>(), vec![0, 2]);
    }

    #[test]
    fn allocate_leaves_dirty_chunks_to_flush() {
        let mut f = file(RdccConfig::new());
        let ds = ChunkedDataset::create(f.context_mut(), &[2], 1, FilterPipeline::new(), vec![5]).unwrap();
        ds.write(&mut f, &[0], &[2], &[7, 8]).unwrap();
        assert_eq!(ds.allocate(&mut f, &[4]).unwrap(), 1);
        f.flush().unwrap();
        assert_eq!(ds.chunks(f.context_mut()).unwrap().len(), 2);
        let mut back = [0u8; 4];
        ds.read(&mut f, &[0], &[4], &mut back).unwrap();
        assert_eq!(back, [7, 8, 5, 5]);
    }

    #[test]
    fn selections_near_the_address_limit_are_rejected() {
        let mut f = file(RdccConfig::new());
        let ds = ChunkedDataset::create(f.context_mut(), &[4], 1, FilterPipeline::new(), Vec::new()).unwrap();
        // The chunk holding this element would end past u64::MAX.
        assert!(matches!(
            ds.write(&mut f, &[u64::MAX - 3], &[1], &[1]),
            Err(FormatError::InvalidArgument(_))
        ));
        let mut buf = [0u8; 1];
        assert!(ds.read(&mut f, &[u64::MAX - 3], &[1], &mut buf).is_err());
        assert!(ds.allocate(&mut f, &[u64::MAX]).is_err());
        assert_eq!(f.rdcc().stats().nused, 0);
    }

    #[test]
    #[cfg(feature = "deflate")]
    fn filtered_dataset_round_trip() {
        let pipeline = FilterPipeline::new().shuffle().deflate(6).fletcher32();
        let mut f = file(RdccConfig::new().bytes(4096));
        let ds = ChunkedDataset::create(f.context_mut(), &[16, 16], 4, pipeline, Vec::new()).unwrap();
        let data: Vec<u8> = (0..40 * 40u32).flat_map(|v| (v % 97).to_le_bytes()).collect();
        ds.write(&mut f, &[0, 0], &[40, 40], &data).unwrap();
        f.flush().unwrap();
        for c in ds.chunks(f.context_mut()).unwrap() {
            assert!((c.chunk_size as usize) < 16 * 16 * 4);
            assert_eq!(c.filter_mask, 0);
        }
        let mut back = vec![0u8; data.len()];
        ds.read(&mut f, &[0, 0], &[40, 40], &mut back).unwrap();
        assert_eq!(back, data);
    }
}
