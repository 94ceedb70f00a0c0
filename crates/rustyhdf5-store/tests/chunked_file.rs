//! Chunked datasets through the raw data chunk cache, in memory and on disk.

use std::collections::BTreeMap;

use rustyhdf5_store::chunk_index;
use rustyhdf5_store::{ChunkedDataset, FileConfig, FilterPipeline, Hdf5File, RdccConfig};

fn config(rdcc: RdccConfig) -> FileConfig {
    FileConfig::new().chunk_btree_k(2).cache_slots(127).rdcc(rdcc)
}

/// Row-major 2-D image of `u16` values.
fn image(rows: u64, cols: u64) -> Vec<u8> {
    (0..rows * cols)
        .flat_map(|i| ((i * 7 + 3) as u16).to_le_bytes())
        .collect()
}

// ---------------------------------------------------------------------------
// 1. Persistence
// ---------------------------------------------------------------------------

#[test]
fn dataset_survives_close_and_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chunked.h5");
    let data = image(30, 25);

    let layout = {
        let mut file = Hdf5File::create(&path, config(RdccConfig::new())).unwrap();
        let ds = ChunkedDataset::create(
            file.context_mut(),
            &[8, 6],
            2,
            FilterPipeline::new(),
            Vec::new(),
        )
        .unwrap();
        ds.write(&mut file, &[0, 0], &[30, 25], &data).unwrap();
        let layout = ds.layout().clone();
        file.close().unwrap();
        layout
    };

    let mut file = Hdf5File::open(&path, config(RdccConfig::new())).unwrap();
    let ds = ChunkedDataset::open(layout, FilterPipeline::new(), Vec::new()).unwrap();
    // 4 x 5 chunk grid.
    assert_eq!(ds.chunks(file.context_mut()).unwrap().len(), 20);

    let mut back = vec![0u8; data.len()];
    ds.read(&mut file, &[0, 0], &[30, 25], &mut back).unwrap();
    assert_eq!(back, data);

    // A window straddling four chunks.
    let mut window = vec![0u8; 3 * 4 * 2];
    ds.read(&mut file, &[7, 5], &[3, 4], &mut window).unwrap();
    for r in 0..3u64 {
        for c in 0..4u64 {
            let src = (((7 + r) * 25 + 5 + c) * 2) as usize;
            let dst = ((r * 4 + c) * 2) as usize;
            assert_eq!(window[dst..dst + 2], data[src..src + 2]);
        }
    }
}

#[test]
#[cfg(feature = "deflate")]
fn filtered_dataset_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("filtered.h5");
    let pipeline = FilterPipeline::new().shuffle().deflate(5).fletcher32();
    let data = image(64, 64);

    let layout = {
        let mut file = Hdf5File::create(&path, config(RdccConfig::new().bytes(8192))).unwrap();
        let ds = ChunkedDataset::create(file.context_mut(), &[32, 32], 2, pipeline.clone(), Vec::new())
            .unwrap();
        ds.write(&mut file, &[0, 0], &[64, 64], &data).unwrap();
        let layout = ds.layout().clone();
        file.close().unwrap();
        layout
    };

    let on_disk = std::fs::metadata(&path).unwrap().len();
    assert!(on_disk < data.len() as u64);

    let mut file = Hdf5File::open(&path, config(RdccConfig::new())).unwrap();
    let ds = ChunkedDataset::open(layout, pipeline, Vec::new()).unwrap();
    let mut back = vec![0u8; data.len()];
    ds.read(&mut file, &[0, 0], &[64, 64], &mut back).unwrap();
    assert_eq!(back, data);
}

// ---------------------------------------------------------------------------
// 2. Cache behaviour under pressure
// ---------------------------------------------------------------------------

#[test]
fn small_cache_matches_model() {
    // Room for three 16-byte chunks at a time.
    let mut file = Hdf5File::create_memory(config(RdccConfig::new().slots(13).bytes(48))).unwrap();
    let ds = ChunkedDataset::create(file.context_mut(), &[16], 1, FilterPipeline::new(), vec![0xee])
        .unwrap();

    let mut model: BTreeMap<u64, u8> = BTreeMap::new();
    let mut seed = 0x2545_f491u32;
    for step in 0..400u32 {
        seed ^= seed << 13;
        seed ^= seed >> 17;
        seed ^= seed << 5;
        let start = u64::from(seed % 300);
        let len = u64::from(seed >> 20) % 24 + 1;
        let byte = (step % 251) as u8;
        ds.write(&mut file, &[start], &[len], &vec![byte; len as usize]).unwrap();
        for i in start..start + len {
            model.insert(i, byte);
        }
        assert!(file.rdcc().stats().nbytes <= 48);
    }

    let mut back = vec![0u8; 330];
    ds.read(&mut file, &[0], &[330], &mut back).unwrap();
    for (i, b) in back.iter().enumerate() {
        assert_eq!(*b, model.get(&(i as u64)).copied().unwrap_or(0xee), "element {i}");
    }

    let stats = file.rdcc().stats();
    assert!(stats.flushes > 0);
    assert!(stats.hits + stats.misses + stats.inits > 0);
}

#[test]
fn flush_writes_back_without_evicting() {
    let mut file = Hdf5File::create_memory(config(RdccConfig::new())).unwrap();
    let ds = ChunkedDataset::create(file.context_mut(), &[4, 4], 4, FilterPipeline::new(), Vec::new())
        .unwrap();
    let data: Vec<u8> = (0..8 * 8 * 4).map(|i| i as u8).collect();
    ds.write(&mut file, &[0, 0], &[8, 8], &data).unwrap();

    // Nothing reaches the index before a flush.
    assert!(ds.chunks(file.context_mut()).unwrap().is_empty());
    file.flush().unwrap();
    assert_eq!(file.rdcc().stats().nused, 4);
    let stored = ds.chunks(file.context_mut()).unwrap();
    assert_eq!(stored.len(), 4);
    for c in &stored {
        assert_eq!(c.chunk_size, 64);
        assert!(!file.rdcc().is_dirty(ds.layout(), &c.offsets));
    }

    let dump = chunk_index::dump(file.context_mut(), ds.layout()).unwrap();
    assert!(dump.contains("4 chunks"));
}

#[test]
fn datasets_share_one_cache() {
    let mut file = Hdf5File::create_memory(config(RdccConfig::new().slots(7).bytes(64))).unwrap();
    let a = ChunkedDataset::create(file.context_mut(), &[8], 1, FilterPipeline::new(), Vec::new()).unwrap();
    let b = ChunkedDataset::create(file.context_mut(), &[8], 1, FilterPipeline::new(), Vec::new()).unwrap();
    for i in 0..10u8 {
        a.write(&mut file, &[u64::from(i) * 8], &[8], &[i; 8]).unwrap();
        b.write(&mut file, &[u64::from(i) * 8], &[8], &[100 + i; 8]).unwrap();
    }
    for i in 0..10u8 {
        let mut buf = [0u8; 8];
        a.read(&mut file, &[u64::from(i) * 8], &[8], &mut buf).unwrap();
        assert_eq!(buf, [i; 8]);
        b.read(&mut file, &[u64::from(i) * 8], &[8], &mut buf).unwrap();
        assert_eq!(buf, [100 + i; 8]);
    }
    file.close().unwrap();
}
