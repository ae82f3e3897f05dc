// Copyright 2025 Occlite Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Ordered index tests
//!
//! Range scan boundaries, phantom protection through node versions, leaf
//! splits under transactional load.

use std::sync::Arc;

use occlite::{AbortReason, Engine, Error, OrderedIndex, OrderedIndexConfig};

fn key(n: u64) -> [u8; 8] {
    n.to_be_bytes()
}

fn setup() -> (Arc<Engine>, Arc<OrderedIndex<u64>>) {
    let engine = Arc::new(Engine::new());
    let idx = OrderedIndex::new(&engine, OrderedIndexConfig::default());
    (engine, idx)
}

/// Range scan boundary: keys {10, 20, 30, 40}, scan [15, 35) visits
/// 20 then 30.
#[test]
fn test_range_scan_boundary() {
    let (engine, idx) = setup();
    for n in [10u64, 20, 30, 40] {
        idx.nontrans_put(&key(n), n);
    }

    let mut ctx = engine.register_thread();
    let visited = engine
        .run(&mut ctx, |ctx| {
            let mut visited = Vec::new();
            idx.range_scan(ctx, &key(15), &key(35), false, |k, v| {
                visited.push((k.to_vec(), *v));
                true
            })?;
            Ok(visited)
        })
        .expect("scan commits");

    assert_eq!(
        visited,
        vec![(key(20).to_vec(), 20), (key(30).to_vec(), 30)]
    );
}

/// Forward predicate is "visit while key < end": an end equal to an
/// existing key excludes it, and begin is inclusive.
#[test]
fn test_range_scan_end_exclusive_begin_inclusive() {
    let (engine, idx) = setup();
    for n in [10u64, 20, 30, 40] {
        idx.nontrans_put(&key(n), n);
    }
    let mut ctx = engine.register_thread();
    let visited = engine
        .run(&mut ctx, |ctx| {
            let mut v = Vec::new();
            idx.range_scan(ctx, &key(10), &key(40), false, |k, val| {
                v.push((k.to_vec(), *val));
                true
            })?;
            Ok(v)
        })
        .unwrap();
    assert_eq!(
        visited.iter().map(|(_, v)| *v).collect::<Vec<_>>(),
        vec![10, 20, 30]
    );
}

/// Reverse scan visits descending while key > end, starting at begin.
#[test]
fn test_range_scan_reverse() {
    let (engine, idx) = setup();
    for n in [10u64, 20, 30, 40] {
        idx.nontrans_put(&key(n), n);
    }
    let mut ctx = engine.register_thread();
    let visited = engine
        .run(&mut ctx, |ctx| {
            let mut v = Vec::new();
            idx.range_scan(ctx, &key(35), &key(15), true, |_, val| {
                v.push(*val);
                true
            })?;
            Ok(v)
        })
        .unwrap();
    assert_eq!(visited, vec![30, 20]);
}

/// The callback can stop the scan early; that is still a successful scan.
#[test]
fn test_range_scan_early_stop() {
    let (engine, idx) = setup();
    for n in 0..20u64 {
        idx.nontrans_put(&key(n), n);
    }
    let mut ctx = engine.register_thread();
    let visited = engine
        .run(&mut ctx, |ctx| {
            let mut v = Vec::new();
            idx.range_scan(ctx, &key(0), &key(100), false, |_, val| {
                v.push(*val);
                v.len() < 5
            })?;
            Ok(v)
        })
        .unwrap();
    assert_eq!(visited, vec![0, 1, 2, 3, 4]);
}

/// An absent point lookup is protected by the leaf version: a concurrent
/// insert of that key aborts the observer at commit.
#[test]
fn test_internode_phantom_detection() {
    let (engine, idx) = setup();
    idx.nontrans_put(&key(10), 10);
    idx.nontrans_put(&key(30), 30);

    let mut t1 = engine.register_thread();
    let mut t2 = engine.register_thread();

    engine.begin(&mut t1);
    assert_eq!(idx.select_row(&mut t1, &key(20), false).unwrap(), None);

    engine.begin(&mut t2);
    idx.insert_row(&mut t2, &key(20), 20, false).unwrap();
    engine.commit(&mut t2).expect("inserter commits");

    assert_eq!(
        engine.commit(&mut t1),
        Err(Error::TransactionAborted {
            reason: AbortReason::ReadValidation
        })
    );
}

/// A scan is invalidated by an insert into the scanned range.
#[test]
fn test_scan_phantom_detection() {
    let (engine, idx) = setup();
    for n in [10u64, 20, 30] {
        idx.nontrans_put(&key(n), n);
    }

    let mut t1 = engine.register_thread();
    let mut t2 = engine.register_thread();

    engine.begin(&mut t1);
    let mut count = 0;
    idx.range_scan(&mut t1, &key(0), &key(100), false, |_, _| {
        count += 1;
        true
    })
    .unwrap();
    assert_eq!(count, 3);

    engine.begin(&mut t2);
    idx.insert_row(&mut t2, &key(25), 25, false).unwrap();
    engine.commit(&mut t2).unwrap();

    assert!(engine.commit(&mut t1).is_err());
}

/// A transaction's own insert does not phantom its own earlier miss.
#[test]
fn test_own_insert_upgrades_observation() {
    let (engine, idx) = setup();
    idx.nontrans_put(&key(1), 1);
    let mut ctx = engine.register_thread();

    engine
        .run(&mut ctx, |ctx| {
            assert_eq!(idx.select_row(ctx, &key(2), false)?, None);
            assert!(!idx.insert_row(ctx, &key(2), 2, false)?);
            assert_eq!(idx.select_row(ctx, &key(2), false)?.map(|(_, v)| v), Some(2));
            Ok(())
        })
        .expect("insert after own miss commits");
    assert_eq!(idx.nontrans_get(&key(2)), Some(2));
}

/// Uncommitted records of other transactions are skipped by scans without
/// aborting them.
#[test]
fn test_scan_skips_invalid_records() {
    let (engine, idx) = setup();
    for n in [10u64, 30] {
        idx.nontrans_put(&key(n), n);
    }

    let mut t1 = engine.register_thread();
    let mut t2 = engine.register_thread();

    // T1 splices an uncommitted record for key 20.
    engine.begin(&mut t1);
    idx.insert_row(&mut t1, &key(20), 20, false).unwrap();

    // T2 scans through the range: sees 10 and 30 only, successfully.
    engine.begin(&mut t2);
    let mut seen = Vec::new();
    idx.range_scan(&mut t2, &key(0), &key(100), false, |_, v| {
        seen.push(*v);
        true
    })
    .unwrap();
    assert_eq!(seen, vec![10, 30]);

    // T1's later commit bumps the leaf, so T2 must not commit after it.
    engine.commit(&mut t1).unwrap();
    assert!(engine.commit(&mut t2).is_err());
}

/// Deletes leave scans consistent and physically remove the entry at
/// commit.
#[test]
fn test_delete_then_scan() {
    let (engine, idx) = setup();
    for n in [10u64, 20, 30] {
        idx.nontrans_put(&key(n), n);
    }
    let mut ctx = engine.register_thread();

    engine
        .run(&mut ctx, |ctx| {
            assert!(idx.delete_row(ctx, &key(20))?);
            // Read-my-writes: the pending delete hides the row from our
            // own scan.
            let mut seen = Vec::new();
            idx.range_scan(ctx, &key(0), &key(100), false, |_, v| {
                seen.push(*v);
                true
            })?;
            assert_eq!(seen, vec![10, 30]);
            Ok(())
        })
        .expect("delete commits");

    assert_eq!(idx.nontrans_get(&key(20)), None);
    let seen = engine
        .run(&mut ctx, |ctx| {
            let mut seen = Vec::new();
            idx.range_scan(ctx, &key(0), &key(100), false, |_, v| {
                seen.push(*v);
                true
            })?;
            Ok(seen)
        })
        .unwrap();
    assert_eq!(seen, vec![10, 30]);
}

/// Transactional inserts across leaf splits: everything stays reachable
/// and ordered.
#[test]
fn test_transactional_inserts_across_splits() {
    let engine = Arc::new(Engine::new());
    let idx = OrderedIndex::<u64>::new(
        &engine,
        OrderedIndexConfig {
            fanout: 4,
            ..Default::default()
        },
    );
    let mut ctx = engine.register_thread();

    // Insert 60 keys in a scattered order, a few per transaction.
    let keys: Vec<u64> = (0..60).map(|i| (i * 37) % 60).collect();
    for chunk in keys.chunks(5) {
        engine
            .run(&mut ctx, |ctx| {
                for &n in chunk {
                    assert!(!idx.insert_row(ctx, &key(n), n * 2, false)?);
                }
                Ok(())
            })
            .expect("chunk commits");
    }

    for n in 0..60 {
        assert_eq!(idx.nontrans_get(&key(n)), Some(n * 2), "key {n}");
    }

    let visited = engine
        .run(&mut ctx, |ctx| {
            let mut v = Vec::new();
            idx.range_scan(ctx, &key(0), &key(1000), false, |_, val| {
                v.push(*val);
                true
            })?;
            Ok(v)
        })
        .unwrap();
    assert_eq!(visited, (0..60).map(|n| n * 2).collect::<Vec<_>>());
}

/// Randomized mixed workload: inserts, deletes, and updates in shuffled
/// order stay consistent with a model map.
#[test]
fn test_randomized_ops_match_model() {
    use rand::seq::SliceRandom;
    use std::collections::BTreeMap;

    let engine = Arc::new(Engine::new());
    let idx = OrderedIndex::<u64>::new(
        &engine,
        OrderedIndexConfig {
            fanout: 4,
            ..Default::default()
        },
    );
    let mut ctx = engine.register_thread();
    let mut model: BTreeMap<u64, u64> = BTreeMap::new();
    let mut rng = rand::rng();

    let mut ops: Vec<(u8, u64)> = Vec::new();
    for n in 0..40u64 {
        ops.push((0, n)); // insert n
    }
    for n in 0..40u64 {
        if n % 3 == 0 {
            ops.push((1, n)); // delete n
        } else if n % 3 == 1 {
            ops.push((2, n)); // update n
        }
    }
    ops.shuffle(&mut rng);

    for (op, n) in ops {
        engine
            .run(&mut ctx, |ctx| match op {
                0 => {
                    idx.insert_row(ctx, &key(n), n, true)?;
                    Ok(())
                }
                1 => {
                    idx.delete_row(ctx, &key(n))?;
                    Ok(())
                }
                _ => {
                    if let Some((rid, v)) = idx.select_row(ctx, &key(n), true)? {
                        idx.update_row(ctx, rid, v + 1000)?;
                    }
                    Ok(())
                }
            })
            .expect("op commits");
        match op {
            0 => {
                model.insert(n, n);
            }
            1 => {
                model.remove(&n);
            }
            _ => {
                if let Some(v) = model.get_mut(&n) {
                    *v += 1000;
                }
            }
        }
    }

    let scanned = engine
        .run(&mut ctx, |ctx| {
            let mut v = Vec::new();
            idx.range_scan(ctx, &key(0), &key(10_000), false, |k, val| {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(k);
                v.push((u64::from_be_bytes(buf), *val));
                true
            })?;
            Ok(v)
        })
        .unwrap();
    let expected: Vec<(u64, u64)> = model.iter().map(|(&k, &v)| (k, v)).collect();
    assert_eq!(scanned, expected);
}

/// select_row_at re-reads a row located earlier in the same transaction.
#[test]
fn test_select_by_handle() {
    let (engine, idx) = setup();
    idx.nontrans_put(&key(4), 44);
    let mut ctx = engine.register_thread();
    engine
        .run(&mut ctx, |ctx| {
            let (rid, v) = idx.select_row(ctx, &key(4), false)?.unwrap();
            assert_eq!(v, 44);
            let again = idx.select_row_at(ctx, rid, false)?;
            assert_eq!(again.map(|(_, v)| v), Some(44));
            Ok(())
        })
        .unwrap();
}

/// update_row after select-for-update, ordered-index flavor.
#[test]
fn test_ordered_update_row() {
    let (engine, idx) = setup();
    idx.nontrans_put(&key(6), 60);
    let mut ctx = engine.register_thread();
    engine
        .run(&mut ctx, |ctx| {
            let (rid, v) = idx.select_row(ctx, &key(6), true)?.unwrap();
            idx.update_row(ctx, rid, v + 6)?;
            Ok(())
        })
        .unwrap();
    assert_eq!(idx.nontrans_get(&key(6)), Some(66));
}

/// Overwriting an own ordered-index insert commits the latest value.
#[test]
fn test_ordered_overwrite_own_insert() {
    let (engine, idx) = setup();
    let mut ctx = engine.register_thread();
    engine
        .run(&mut ctx, |ctx| {
            assert!(!idx.insert_row(ctx, &key(8), 1, false)?);
            assert!(idx.insert_row(ctx, &key(8), 2, true)?);
            Ok(())
        })
        .unwrap();
    assert_eq!(idx.nontrans_get(&key(8)), Some(2));
}
