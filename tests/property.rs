//! Randomized mixed alloc/free load, checked two ways: the pool's own
//! byte-accounting stats against an independently tracked model, and a
//! direct page-chain walk against the free-list index. The accounting
//! check alone can't catch a tiling or coalescing bug — a wrong
//! `prev_size` write moves no bytes in `Stats::bytes_allocated` — so the
//! walk runs after every step too.
use std::collections::HashMap;
use std::sync::atomic::Ordering;

use proptest::prelude::*;
use xvmalloc::size_class::{class_of, size_of_class, XV_MAX_ALLOC_SIZE};
use xvmalloc::{Handle, Pool, XvError};

#[derive(Debug, Clone)]
enum Op {
    Alloc(usize),
    Free(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (1usize..=4088usize).prop_map(Op::Alloc),
        2 => any::<usize>().prop_map(Op::Free),
    ]
}

fn block_bytes(payload: usize) -> usize {
    let (row, col) = class_of(payload).expect("payload within range");
    size_of_class(row * 64 + col)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn mixed_load_preserves_accounting(ops in prop::collection::vec(op_strategy(), 1..2000)) {
        let mut pool = Pool::create_pool_with_capacity(256).unwrap();
        let mut live: HashMap<Handle, usize> = HashMap::new();
        let mut order: Vec<Handle> = Vec::new();

        for (step, op) in ops.into_iter().enumerate() {
            match op {
                Op::Alloc(size) => {
                    if size > XV_MAX_ALLOC_SIZE {
                        continue;
                    }
                    match pool.alloc(size) {
                        Ok(handle) => {
                            prop_assert!(!live.contains_key(&handle), "alloc returned a handle already live");
                            live.insert(handle, size);
                            order.push(handle);
                        }
                        Err(XvError::OutOfMemory) => {
                            // The arena is finite; running out is expected.
                        }
                        Err(XvError::InvalidSize) => {
                            prop_assert!(false, "size {} is within XV_MAX_ALLOC_SIZE but was rejected", size);
                        }
                    }
                }
                Op::Free(pick) => {
                    if order.is_empty() {
                        continue;
                    }
                    let idx = pick % order.len();
                    let handle = order.swap_remove(idx);
                    if let Some(size) = live.remove(&handle) {
                        pool.free(handle);
                        let _ = size;
                    }
                }
            }

            let expected_bytes: usize = live.values().map(|&s| block_bytes(s)).sum();
            prop_assert_eq!(pool.stats().bytes_allocated.current() as usize, expected_bytes);
            prop_assert_eq!(
                pool.stats().alloc_calls.load(Ordering::Relaxed) as usize
                    - pool.stats().free_calls.load(Ordering::Relaxed) as usize,
                live.len()
            );

            // Byte accounting alone can't see a tiling or coalescing bug,
            // so periodically walk every page's block chain directly and
            // cross-check it against the free-list index.
            if step % 16 == 0 {
                let report = pool.debug_walk();
                prop_assert!(
                    report.coverage_mismatches.is_empty(),
                    "pages {:?} don't tile exactly",
                    report.coverage_mismatches
                );
                prop_assert!(
                    report.adjacent_frees.is_empty(),
                    "found uncoalesced adjacent free blocks: {:?}",
                    report.adjacent_frees
                );
                prop_assert_eq!(
                    &report.free_blocks,
                    &report.indexed_blocks,
                    "free-list index disagrees with the blocks actually marked free on-page"
                );
            }
        }

        for handle in order {
            pool.free(handle);
        }

        prop_assert_eq!(pool.stats().pages_in_use.current(), 0);
        prop_assert_eq!(pool.stats().bytes_allocated.current(), 0);

        let report = pool.debug_walk();
        prop_assert!(report.is_consistent(), "final state is inconsistent: {:?}", report);
    }
}
