//! Property tests for the chunk index B-tree.

use proptest::prelude::*;
use rustyhdf5_store::chunk_index::{self, ChunkKey, ChunkLayout};
use rustyhdf5_store::{FileConfig, FileContext};

/// Chunks of four 2-byte elements; chunk `i` starts at element `4 * i`.
const CHUNK_DIMS: [u64; 2] = [4, 2];

fn context(k: usize) -> FileContext {
    FileContext::memory(FileConfig::new().chunk_btree_k(k).cache_slots(61)).unwrap()
}

fn size_of(i: u64) -> u32 {
    8 + (i % 5) as u32
}

fn populate(ctx: &mut FileContext, order: &[u64]) -> ChunkLayout {
    let layout = chunk_index::create_index(ctx, CHUNK_DIMS.to_vec()).unwrap();
    for &i in order {
        let key = ChunkKey::new(vec![4 * i], size_of(i), (i % 2) as u32);
        chunk_index::insert_chunk(ctx, &layout, &key).unwrap();
    }
    layout
}

fn shuffled_ids() -> impl Strategy<Value = Vec<u64>> {
    prop::collection::btree_set(0u64..300, 1..80)
        .prop_flat_map(|set| Just(set.into_iter().collect::<Vec<_>>()).prop_shuffle())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn inserts_in_any_order_are_found_and_listed(order in shuffled_ids(), k in 1usize..5) {
        let mut ctx = context(k);
        let layout = populate(&mut ctx, &order);

        let mut sorted = order.clone();
        sorted.sort_unstable();

        for &i in &order {
            let info = chunk_index::lookup(&mut ctx, &layout, &[4 * i]).unwrap();
            let info = info.expect("stored chunk");
            prop_assert_eq!(info.offsets, vec![4 * i, 0]);
            prop_assert_eq!(info.chunk_size, size_of(i));
            prop_assert_eq!(info.filter_mask, (i % 2) as u32);
        }
        // Gaps between stored chunks are misses.
        for i in 0..300u64 {
            if sorted.binary_search(&i).is_err() {
                prop_assert!(chunk_index::lookup(&mut ctx, &layout, &[4 * i]).unwrap().is_none());
            }
        }

        let listed: Vec<u64> = chunk_index::chunks(&mut ctx, &layout)
            .unwrap()
            .into_iter()
            .map(|c| c.offsets[0] / 4)
            .collect();
        prop_assert_eq!(listed, sorted);

        let shape = chunk_index::validate(&mut ctx, &layout).unwrap();
        prop_assert_eq!(shape.leaf_children, order.len());
        prop_assert!(shape.nodes_per_level.iter().all(|&n| n >= 1));
    }

    #[test]
    fn removals_leave_the_rest_reachable(
        order in shuffled_ids(),
        drop_mask in prop::collection::vec(any::<bool>(), 80),
    ) {
        let mut ctx = context(2);
        let layout = populate(&mut ctx, &order);

        let mut gone = Vec::new();
        let mut kept = Vec::new();
        for (n, &i) in order.iter().enumerate() {
            if drop_mask[n] {
                gone.push(i);
            } else {
                kept.push(i);
            }
        }

        for &i in &gone {
            let info = chunk_index::remove_chunk(&mut ctx, &layout, &[4 * i]).unwrap();
            prop_assert_eq!(info.chunk_size, size_of(i));
        }
        for &i in &gone {
            prop_assert!(chunk_index::lookup(&mut ctx, &layout, &[4 * i]).unwrap().is_none());
            prop_assert!(chunk_index::remove_chunk(&mut ctx, &layout, &[4 * i]).is_err());
        }
        for &i in &kept {
            prop_assert!(chunk_index::lookup(&mut ctx, &layout, &[4 * i]).unwrap().is_some());
        }

        let mut sorted = kept.clone();
        sorted.sort_unstable();
        let listed: Vec<u64> = chunk_index::chunks(&mut ctx, &layout)
            .unwrap()
            .into_iter()
            .map(|c| c.offsets[0] / 4)
            .collect();
        prop_assert_eq!(listed, sorted);
        chunk_index::validate(&mut ctx, &layout).unwrap();

        // The index keeps working after the churn.
        for &i in &gone {
            let key = ChunkKey::new(vec![4 * i], 16, 0);
            chunk_index::insert_chunk(&mut ctx, &layout, &key).unwrap();
        }
        prop_assert_eq!(chunk_index::chunks(&mut ctx, &layout).unwrap().len(), order.len());
        chunk_index::validate(&mut ctx, &layout).unwrap();
    }
}
