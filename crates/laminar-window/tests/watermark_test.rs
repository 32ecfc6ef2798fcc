//! Order independence of the multi-origin watermark processor.

mod common;

use std::sync::Arc;
use std::thread;

use common::XorShift;
use laminar_window::time::{OriginId, SequenceData, WatermarkProcessor};

const ORIGINS: [OriginId; 3] = [OriginId(1), OriginId(2), OriginId(3)];

/// `(origin, sequence, ts)` for `buffers` sequences per origin, with
/// timestamps that grow with the sequence number.
fn updates(buffers: u64) -> Vec<(OriginId, SequenceData, i64)> {
    let mut updates = Vec::new();
    for (o, origin) in (0i64..).zip(ORIGINS) {
        for seq in 1..=buffers {
            // every third sequence arrives in two chunks
            let ts = seq as i64 * 10 + o;
            if seq % 3 == 0 {
                updates.push((origin, SequenceData::new(seq, 1, false), ts - 5));
                updates.push((origin, SequenceData::new(seq, 2, true), ts));
            } else {
                updates.push((origin, SequenceData::single(seq), ts));
            }
        }
    }
    updates
}

fn final_watermark(buffers: u64) -> i64 {
    // the slowest origin's newest timestamp
    buffers as i64 * 10
}

#[test]
fn test_any_delivery_order_reaches_same_watermark() {
    for seed in 1..=20u64 {
        let mut all = updates(30);
        XorShift::new(seed).shuffle(&mut all);

        let processor = WatermarkProcessor::new(&ORIGINS, 1024);
        let mut last = i64::MIN;
        for (origin, sequence, ts) in all {
            let wm = processor.update(origin, sequence, ts).unwrap().timestamp();
            assert!(wm >= last, "watermark regressed with seed {seed}");
            last = wm;
        }
        assert_eq!(processor.current().timestamp(), final_watermark(30), "seed {seed}");
        assert!(!processor.is_stalled());
    }
}

#[test]
fn test_concurrent_updates_reach_same_watermark() {
    let mut all = updates(200);
    XorShift::new(7).shuffle(&mut all);

    let processor = Arc::new(WatermarkProcessor::new(&ORIGINS, 1024));
    let threads: Vec<_> = all
        .chunks(all.len().div_ceil(4))
        .map(|part| {
            let part = part.to_vec();
            let processor = Arc::clone(&processor);
            thread::spawn(move || {
                for (origin, sequence, ts) in part {
                    processor.update(origin, sequence, ts).unwrap();
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }
    assert_eq!(processor.current().timestamp(), final_watermark(200));
}

#[test]
fn test_gap_holds_watermark_until_filled() {
    let processor = WatermarkProcessor::new(&ORIGINS[..1], 2);
    let origin = ORIGINS[0];
    for seq in 2..=4 {
        processor
            .update(origin, SequenceData::single(seq), seq as i64 * 10)
            .unwrap();
    }
    assert_eq!(processor.current().timestamp(), i64::MIN);
    assert!(processor.is_stalled());

    let wm = processor
        .update(origin, SequenceData::single(1), 10)
        .unwrap();
    assert_eq!(wm.timestamp(), 40);
    assert!(!processor.is_stalled());
}
