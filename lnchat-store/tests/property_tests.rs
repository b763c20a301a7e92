//! Property-based tests for lnchat-store

use lnchat_lib::test_utils::{address, payment};
use lnchat_store::{KvStore, PageOptions, Store};
use proptest::prelude::*;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread().build().unwrap()
}

proptest! {
    /// Walking forward page by page visits every payment exactly once, in order
    #[test]
    fn test_forward_pages_partition_the_table(
        indexes in prop::collection::btree_set(1u64..500, 0..60),
        page_size in 1u64..9
    ) {
        let (walked, all) = runtime().block_on(async {
            let store = KvStore::in_memory();
            let batch = indexes
                .iter()
                .map(|i| payment(address(1), address(2), *i))
                .collect();
            store.add_payments(batch).await.unwrap();

            let mut walked = Vec::new();
            let mut last = 0;
            loop {
                let page = store
                    .list_payments(PageOptions::forward(last, page_size))
                    .await
                    .unwrap();
                if page.is_empty() {
                    break;
                }
                assert!(page.len() as u64 <= page_size);
                last = page.last().unwrap().payment_index;
                walked.extend(page.into_iter().map(|p| p.payment_index));
            }
            (walked, indexes.iter().copied().collect::<Vec<_>>())
        });
        prop_assert_eq!(walked, all);
    }

    /// A reverse page is the mirror of the forward slice below its anchor
    #[test]
    fn test_reverse_page_mirrors_forward(
        indexes in prop::collection::btree_set(1u64..200, 1..40),
        anchor in 1u64..220,
        page_size in 0u64..10
    ) {
        let (reverse, expected) = runtime().block_on(async {
            let store = KvStore::in_memory();
            let batch = indexes
                .iter()
                .map(|i| payment(address(1), address(2), *i))
                .collect();
            store.add_payments(batch).await.unwrap();

            let reverse: Vec<u64> = store
                .list_payments(PageOptions::reverse(anchor, page_size))
                .await
                .unwrap()
                .into_iter()
                .map(|p| p.payment_index)
                .collect();
            let limit = if page_size == 0 { usize::MAX } else { page_size as usize };
            let expected: Vec<u64> = indexes
                .iter()
                .copied()
                .filter(|i| *i < anchor)
                .rev()
                .take(limit)
                .collect();
            (reverse, expected)
        });
        prop_assert_eq!(reverse, expected);
    }
}
