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

//! STM protocol scenarios
//!
//! End-to-end transaction semantics on the unordered index: read-modify-
//! write, write skew, phantoms, insert/delete cycles, read-my-writes.

use std::sync::Arc;

use occlite::{AbortReason, Engine, Error, HashIndexConfig, UnorderedIndex};

fn setup() -> (Arc<Engine>, Arc<UnorderedIndex<u64, u64>>) {
    let engine = Arc::new(Engine::new());
    let idx = UnorderedIndex::new(&engine, HashIndexConfig::default());
    (engine, idx)
}

/// Read-modify-write on a single record.
#[test]
fn test_read_modify_write() {
    let (engine, warehouses) = setup();
    warehouses.nontrans_put(1, 1000); // w_ytd

    let mut ctx = engine.register_thread();
    engine
        .run(&mut ctx, |ctx| {
            let (rid, w_ytd) = warehouses
                .select_row(ctx, &1, true)?
                .expect("warehouse 1 loaded");
            warehouses.update_row(ctx, rid, w_ytd + 100)?;
            Ok(())
        })
        .expect("rmw commits");

    assert_eq!(warehouses.nontrans_get(&1), Some(1100));

    // A later transaction sees the committed value.
    let seen = engine
        .run(&mut ctx, |ctx| warehouses.select_row(ctx, &1, false))
        .unwrap();
    assert_eq!(seen.map(|(_, v)| v), Some(1100));
}

/// Write-skew prevention: two transactions each read the other's write
/// target; the later committer fails read validation.
#[test]
fn test_write_skew_prevention() {
    let (engine, idx) = setup();
    idx.nontrans_put(1, 10);
    idx.nontrans_put(2, 20);

    let mut t1 = engine.register_thread();
    let mut t2 = engine.register_thread();
    engine.begin(&mut t1);
    engine.begin(&mut t2);

    // T1 reads K1, writes K2.
    let k1 = idx.select_row(&mut t1, &1, false).unwrap().unwrap().1;
    let (rid2, _) = idx.select_row(&mut t1, &2, true).unwrap().unwrap();
    idx.update_row(&mut t1, rid2, k1 + 1).unwrap();

    // T2 reads K2, writes K1.
    let k2 = idx.select_row(&mut t2, &2, false).unwrap().unwrap().1;
    let (rid1, _) = idx.select_row(&mut t2, &1, true).unwrap().unwrap();
    idx.update_row(&mut t2, rid1, k2 + 1).unwrap();

    let r1 = engine.commit(&mut t1);
    let r2 = engine.commit(&mut t2);

    assert!(r1.is_ok(), "first committer wins");
    assert_eq!(
        r2,
        Err(Error::TransactionAborted {
            reason: AbortReason::ReadValidation
        })
    );
    // K1 is unchanged, K2 carries T1's write.
    assert_eq!(idx.nontrans_get(&1), Some(10));
    assert_eq!(idx.nontrans_get(&2), Some(11));
}

/// Phantom: an absent lookup is invalidated by a concurrent insert of the
/// same key.
#[test]
fn test_phantom_detection() {
    let (engine, idx) = setup();

    let mut t1 = engine.register_thread();
    let mut t2 = engine.register_thread();

    engine.begin(&mut t1);
    assert_eq!(idx.select_row(&mut t1, &42, false).unwrap(), None);

    // T2 inserts the key T1 observed as absent, and commits.
    engine.begin(&mut t2);
    idx.insert_row(&mut t2, 42, 420, false).unwrap();
    engine.commit(&mut t2).expect("t2 commits");

    // T1's bucket-version observation no longer validates.
    assert_eq!(
        engine.commit(&mut t1),
        Err(Error::TransactionAborted {
            reason: AbortReason::ReadValidation
        })
    );
}

/// A touched record that another transaction is still installing reads as
/// a phantom and aborts the toucher, not the installer.
#[test]
fn test_uncommitted_insert_is_phantom_to_others() {
    let (engine, idx) = setup();

    let mut t1 = engine.register_thread();
    let mut t2 = engine.register_thread();

    engine.begin(&mut t1);
    idx.insert_row(&mut t1, 7, 70, false).unwrap();

    // T2 stumbles on the speculative record.
    engine.begin(&mut t2);
    assert_eq!(
        idx.select_row(&mut t2, &7, false),
        Err(Error::TransactionAborted {
            reason: AbortReason::Phantom
        })
    );
    engine.abort(&mut t2);

    engine.commit(&mut t1).expect("inserter commits");

    // Committed now: visible to a fresh transaction.
    engine.begin(&mut t2);
    let got = idx.select_row(&mut t2, &7, false).unwrap();
    assert_eq!(got.map(|(_, v)| v), Some(70));
    engine.commit(&mut t2).unwrap();
}

/// Insert/delete cycle in one transaction: the record is physically gone
/// at commit and the key reads as absent, as if nothing happened.
#[test]
fn test_insert_delete_cycle() {
    let (engine, idx) = setup();
    let mut ctx = engine.register_thread();

    engine
        .run(&mut ctx, |ctx| {
            assert!(!idx.insert_row(ctx, 9, 90, false)?);
            assert!(idx.delete_row(ctx, &9)?);
            // Absent for the rest of the transaction.
            assert_eq!(idx.select_row(ctx, &9, false)?, None);
            Ok(())
        })
        .expect("cycle commits");

    assert_eq!(idx.nontrans_get(&9), None);
    // The speculative record's reclamation was deferred and has fired.
    assert_eq!(ctx.pending_reclaims(), 0);

    // The key stays insertable afterwards.
    engine
        .run(&mut ctx, |ctx| idx.insert_row(ctx, 9, 91, false))
        .unwrap();
    assert_eq!(idx.nontrans_get(&9), Some(91));
}

/// Read-my-writes round trips inside one transaction.
#[test]
fn test_read_my_writes() {
    let (engine, idx) = setup();
    idx.nontrans_put(5, 50);
    let mut ctx = engine.register_thread();

    engine
        .run(&mut ctx, |ctx| {
            // insert(k, v) then select(k) returns v.
            idx.insert_row(ctx, 1, 11, false)?;
            assert_eq!(idx.select_row(ctx, &1, false)?.map(|(_, v)| v), Some(11));

            // Pending update visible to the same transaction.
            let (rid, _) = idx.select_row(ctx, &5, true)?.unwrap();
            idx.update_row(ctx, rid, 55)?;
            assert_eq!(idx.select_row(ctx, &5, false)?.map(|(_, v)| v), Some(55));

            // Pending delete hides the row.
            idx.delete_row(ctx, &5)?;
            assert_eq!(idx.select_row(ctx, &5, false)?, None);

            // Insert over our own pending delete re-arms the write.
            assert!(!idx.insert_row(ctx, 5, 56, false)?);
            assert_eq!(idx.select_row(ctx, &5, false)?.map(|(_, v)| v), Some(56));
            Ok(())
        })
        .unwrap();

    assert_eq!(idx.nontrans_get(&1), Some(11));
    assert_eq!(idx.nontrans_get(&5), Some(56));
}

/// Overwriting an own insert commits the second value.
#[test]
fn test_overwrite_own_insert_commits_latest() {
    let (engine, idx) = setup();
    let mut ctx = engine.register_thread();

    engine
        .run(&mut ctx, |ctx| {
            assert!(!idx.insert_row(ctx, 3, 1, false)?);
            assert!(idx.insert_row(ctx, 3, 2, true)?);
            assert_eq!(idx.select_row(ctx, &3, false)?.map(|(_, v)| v), Some(2));
            Ok(())
        })
        .unwrap();
    assert_eq!(idx.nontrans_get(&3), Some(2));
}

/// A delete committed by one transaction physically removes the row and
/// invalidates a concurrent reader that observed it.
#[test]
fn test_committed_delete_removes_row() {
    let (engine, idx) = setup();
    idx.nontrans_put(8, 80);

    let mut t1 = engine.register_thread();
    let mut t2 = engine.register_thread();

    engine.begin(&mut t1);
    let seen = idx.select_row(&mut t1, &8, false).unwrap();
    assert_eq!(seen.map(|(_, v)| v), Some(80));

    engine.begin(&mut t2);
    assert!(idx.delete_row(&mut t2, &8).unwrap());
    engine.commit(&mut t2).expect("deleter commits");
    assert_eq!(idx.nontrans_get(&8), None);

    // T1 observed the record version before the delete install.
    assert_eq!(
        engine.commit(&mut t1),
        Err(Error::TransactionAborted {
            reason: AbortReason::ReadValidation
        })
    );
}
