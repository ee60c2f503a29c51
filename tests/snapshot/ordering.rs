//! Blocks reach the file in submission order for both strategies.

use crate::common::*;
use std::sync::Arc;
use std::thread;
use tablesnap::{SnapshotDataTarget, TableId};

#[test]
fn test_blocks_keep_submission_order() {
    for strategy in STRATEGIES {
        let snap = TestSnapshot::new(strategy);
        let target = snap.factory.create_target(metadata("ORDERED"), Vec::new()).unwrap();

        // Sizes straddle page boundaries for the direct strategy
        let expected: Vec<Vec<u8>> = (0..60)
            .map(|i| raw_block(i, i as u8, 100 + (i as usize * 613) % 9000))
            .collect();
        let handles: Vec<_> = expected
            .iter()
            .map(|raw| {
                let raw = raw.clone();
                target.write(
                    Box::new(move || {
                        tablesnap::BlockPayload::Pending(tablesnap::TableBlock::from_payload(raw))
                    }),
                    TableId(1),
                )
            })
            .collect();
        target.close().unwrap();
        for h in handles {
            h.wait().unwrap();
        }

        let file = SnapshotFile::read(target.path());
        assert!(file.header.completed, "{}", strategy);
        assert_eq!(file.raw_blocks(), expected, "{}", strategy);
        assert_eq!(file.bytes.len() as u64, target.bytes_written(), "{}", strategy);
    }
}

#[test]
fn test_targets_are_independent() {
    for strategy in STRATEGIES {
        let snap = TestSnapshot::new(strategy);
        let targets: Vec<_> = (0..4)
            .map(|t| snap.factory.create_target(metadata(&format!("T{}", t)), Vec::new()).unwrap())
            .collect();

        let writers: Vec<_> = targets
            .iter()
            .enumerate()
            .map(|(t, target)| {
                let target = Arc::clone(target);
                thread::spawn(move || {
                    (0..25)
                        .map(|i| target.write(supplier(i, t as u8, 2000 + i as usize), TableId(t as u32)))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        // Direct targets complete their tail only on close
        let handles: Vec<_> = writers.into_iter().flat_map(|w| w.join().unwrap()).collect();

        for (t, target) in targets.iter().enumerate() {
            target.close().unwrap();
            let file = SnapshotFile::read(target.path());
            assert_eq!(file.partitions(), (0..25).collect::<Vec<_>>(), "{}", strategy);
            assert!(file.raw_blocks().iter().all(|raw| raw[4..].iter().all(|b| *b == t as u8)));
        }
        for h in handles {
            h.wait().unwrap();
        }
    }
}
