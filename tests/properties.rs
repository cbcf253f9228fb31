//! Property test: file-level invariants hold under arbitrary operation
//! sequences, and committed payloads always read back byte-exact.

mod common;

use std::collections::BTreeMap;

use proptest::prelude::*;
use tempfile::TempDir;

use blobfile::{BlobStorage, CancelToken, ChunkType};

const TEST: ChunkType = ChunkType(7777);

#[derive(Debug, Clone)]
enum Op {
    Add { size: usize, fill: u8 },
    /// Remove one of the currently live chunks, picked by index.
    Remove { pick: usize },
    CutBack,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0usize..2048, any::<u8>()).prop_map(|(size, fill)| Op::Add { size, fill }),
        3 => any::<usize>().prop_map(|pick| Op::Remove { pick }),
        1 => Just(Op::CutBack),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 16, ..ProptestConfig::default() })]

    #[test]
    fn invariants_hold_under_random_op_sequences(
        ops in proptest::collection::vec(op_strategy(), 1..24)
    ) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("props.blob");
        let cancel = CancelToken::new();
        let mut storage = BlobStorage::new(&path);
        prop_assert!(storage.initialize(&cancel).unwrap());

        let mut expected: BTreeMap<u32, Vec<u8>> = BTreeMap::new();
        for op in ops {
            match op {
                Op::Add { size, fill } => {
                    let data = vec![fill; size];
                    let chunk = storage
                        .add_chunk(TEST, u32::from(fill), &data, &cancel)
                        .unwrap();
                    expected.insert(chunk.id, data);
                }
                Op::Remove { pick } => {
                    let live: Vec<u32> = expected.keys().copied().collect();
                    if let Some(&id) = live.get(pick % live.len().max(1)) {
                        let removed = storage
                            .remove_chunk(|s| s.get(id).map(|c| c.id), &cancel)
                            .unwrap();
                        prop_assert_eq!(removed.map(|c| c.id), Some(id));
                        expected.remove(&id);
                    }
                }
                Op::CutBack => storage.cut_back_padding(&cancel).unwrap(),
            }
            common::assert_invariants(&path);
        }

        // Every committed chunk reads back byte-exact.
        for (id, data) in &expected {
            let read = storage.read_chunk(*id, &cancel).unwrap();
            prop_assert_eq!(read.as_ref(), Some(data));
        }

        // The scan view agrees with the snapshot view.
        let scanned = common::scan_chunks(&path);
        let live_scanned: Vec<u32> = scanned
            .iter()
            .filter(|c| !c.chunk_type.is_free())
            .map(|c| c.id)
            .collect();
        let snapshot = storage.snapshot(&cancel).unwrap();
        let mut live_indexed: Vec<u32> = snapshot.chunks().iter().map(|c| c.id).collect();
        live_indexed.sort_unstable();
        let mut live_scanned_sorted = live_scanned;
        live_scanned_sorted.sort_unstable();
        prop_assert_eq!(live_scanned_sorted, live_indexed);
    }
}
