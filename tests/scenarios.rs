//! End-to-end behaviour: stale reads, aborts, read-only runs, write-set
//! growth, clock roll-over and the contention policies.

mod common;

use common::{DESIGNS, engine, init_tracing};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use wordstm::{
    AbortReason, Attributes, Config, ContentionPolicy, Design, Parameter, Stm, StmError, TWord,
};

/// Words far enough apart to sit under different locks.
fn spread() -> Vec<TWord> {
    (0..64).map(|_| TWord::new(0)).collect()
}

#[test]
fn scenario_stale_read_is_never_returned() {
    for design in DESIGNS {
        let stm = engine(design);
        let x = TWord::new(5);
        let mut a = stm.register_thread().unwrap();
        let mut b = stm.register_thread().unwrap();

        a.start(Attributes::default());
        assert_eq!(a.read(&x), Ok(5));
        b.atomically(|b| b.write(&x, 6));

        // The snapshot cannot move past a word it already read.
        match a.read(&x) {
            Ok(v) => assert_eq!(v, 6, "{design}"),
            Err(e) => assert!(e.is_retryable(), "{design}: {e}"),
        }
    }
}

#[test]
fn scenario_snapshot_extends_over_unrelated_commit() {
    for design in DESIGNS {
        let stm = engine(design);
        let words = spread();
        let (x, y) = (&words[0], &words[32]);
        let mut a = stm.register_thread().unwrap();
        let mut b = stm.register_thread().unwrap();

        a.start(Attributes::default());
        assert_eq!(a.read(y), Ok(0));
        b.atomically(|b| b.write(x, 6));

        assert_eq!(a.read(x), Ok(6), "{design}");
        assert_eq!(a.get_statistics("nb_extensions"), Some(1));
        assert!(a.commit());
    }
}

#[test]
fn scenario_no_extend_aborts_instead() {
    let stm = engine(Design::WriteBackEtl);
    let words = spread();
    let (x, y) = (&words[0], &words[32]);
    let mut a = stm.register_thread().unwrap();
    let mut b = stm.register_thread().unwrap();

    a.start(Attributes::default().with_no_extend(true));
    assert_eq!(a.read(y), Ok(0));
    b.atomically(|b| b.write(x, 6));
    assert_eq!(
        a.read(x),
        Err(StmError::Aborted(AbortReason::ReadValidation))
    );
}

#[test]
fn scenario_abort_restores_memory() {
    for design in DESIGNS {
        let stm = engine(design);
        let x = TWord::new(10);
        let y = TWord::new(20);
        let mut tx = stm.register_thread().unwrap();

        tx.start(Attributes::default());
        tx.write(&x, 1).unwrap();
        tx.write(&y, 2).unwrap();
        assert_eq!(tx.abort(), StmError::Aborted(AbortReason::Explicit));

        assert_eq!(stm.unit_load(&x).0, 10, "{design}");
        assert_eq!(stm.unit_load(&y).0, 20, "{design}");
    }
}

#[test]
fn scenario_read_only_never_bumps_clock() {
    for design in DESIGNS {
        let stm = engine(design);
        let words = spread();
        stm.atomically(|tx| {
            for (i, w) in words.iter().enumerate() {
                tx.write(w, i)?;
            }
            Ok(())
        });
        let clock = stm.clock();

        let mut tx = stm.register_thread().unwrap();
        let ro = Attributes::default().with_read_only(true);
        for _ in 0..10 {
            let sum = tx
                .try_atomically(ro, |tx| {
                    words
                        .iter()
                        .try_fold(0, |acc, w| Ok::<_, StmError>(acc + tx.read(w)?))
                })
                .unwrap();
            assert_eq!(sum, (0..64).sum::<usize>());
        }
        assert_eq!(stm.clock(), clock, "{design}");
        assert_eq!(tx.get_statistics("nb_clock_increments"), Some(0));
        assert_eq!(tx.get_statistics("nb_commits"), Some(10));
    }
}

#[test]
fn scenario_write_set_growth_is_transparent() {
    for design in DESIGNS {
        init_tracing();
        let small = Stm::new(
            Config::default()
                .with_design(design)
                .with_lock_table_bits(12)
                .with_initial_rw_set_size(2),
        )
        .unwrap();
        let large = engine(design);
        let a: Vec<TWord> = (0..10).map(TWord::new).collect();
        let b: Vec<TWord> = (0..10).map(TWord::new).collect();

        let mut tx = small.register_thread().unwrap();
        tx.atomically(|tx| {
            for w in &a {
                let v = tx.read(w)?;
                tx.write(w, v * 3 + 1)?;
            }
            Ok(())
        });
        large.atomically(|tx| {
            for w in &b {
                let v = tx.read(w)?;
                tx.write(w, v * 3 + 1)?;
            }
            Ok(())
        });

        let left: Vec<usize> = a.iter().map(TWord::load_unsynchronized).collect();
        let right: Vec<usize> = b.iter().map(TWord::load_unsynchronized).collect();
        assert_eq!(left, right, "{design}");
        assert_eq!(tx.get_statistics("nb_commits"), Some(1));
        assert!(tx.get_statistics("write_set_size").unwrap() >= 10);
        if design == Design::WriteBackCtl {
            assert_eq!(tx.get_statistics("nb_aborts"), Some(0));
        } else {
            // 2 -> 4 -> 8 -> 16
            assert_eq!(tx.get_statistics("nb_aborts_write_set_growth"), Some(3));
            assert_eq!(tx.get_statistics("write_set_size"), Some(16));
        }
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn clock_rolls_over_under_load() {
    init_tracing();
    for design in DESIGNS {
        let stm = Stm::new(
            Config::default()
                .with_design(design)
                .with_lock_table_bits(10)
                .with_rollover(true, 64),
        )
        .unwrap();
        let counter = TWord::new(0);

        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    let mut tx = stm.register_thread().unwrap();
                    for _ in 0..500 {
                        tx.atomically(|tx| {
                            let v = tx.read(&counter)?;
                            tx.write(&counter, v + 1)
                        });
                    }
                });
            }
        });

        assert_eq!(stm.unit_load(&counter).0, 2000, "{design}");
        assert!(stm.rollovers() >= 1, "{design}");
        assert!(stm.clock() <= 64 + 4);
    }
}

#[test]
fn clock_limit_does_not_block_a_thread_inside_a_transaction() {
    init_tracing();
    let stm = Stm::new(
        Config::default()
            .with_lock_table_bits(10)
            .with_rollover(true, 4),
    )
    .unwrap();
    let words = spread();
    let (x, y, z) = (&words[0], &words[16], &words[32]);
    for i in 0..3 {
        stm.unit_store(x, i);
    }

    let mut a = stm.register_thread().unwrap();
    a.start(Attributes::default());
    assert_eq!(a.read(x), Ok(2));
    // The clock passes the limit while `a` keeps the reset from running.
    stm.unit_store(y, 1);
    stm.unit_store(y, 2);
    assert!(stm.clock() >= 4);
    stm.atomically(|b| b.write(z, 7));
    let mut c = stm.register_thread().unwrap();
    c.atomically(|c| c.write(z, 8));
    drop(c);
    assert_eq!(stm.rollovers(), 0);
    assert!(a.commit());

    // Outside any transaction the next start resets the clock.
    a.start(Attributes::default());
    assert_eq!(stm.rollovers(), 1);
    assert_eq!(a.read(y), Ok(2));
    assert_eq!(a.read(z), Ok(8));
    assert!(a.commit());
}

#[test]
fn unit_store_conflicts_with_transaction_snapshot() {
    let stm = engine(Design::WriteBackEtl);
    let x = TWord::new(1);
    let mut tx = stm.register_thread().unwrap();
    tx.start(Attributes::default());
    assert_eq!(tx.read(&x), Ok(1));
    let ts = stm.unit_store(&x, 2);
    assert_eq!(stm.unit_load(&x), (2, ts));
    tx.write(&x, 3).unwrap_err();
    assert_eq!(tx.last_abort(), Some(AbortReason::WriteValidation));
}

#[test]
fn priority_visible_reads_block_other_readers() {
    init_tracing();
    let stm = Stm::new(
        Config::default()
            .with_contention_manager(ContentionPolicy::Priority)
            .with_vr_threshold(0)
            .with_lock_table_bits(10),
    )
    .unwrap();
    let x = TWord::new(4);
    let mut a = stm.register_thread().unwrap();
    let mut b = stm.register_thread().unwrap();
    assert!(a.tid() < b.tid());

    a.start(Attributes::default());
    assert_eq!(a.read(&x), Ok(4));
    // Same priority, higher id: b loses. Its own read is visible too, so
    // the conflict is met on the write path.
    let r = b.try_atomically(Attributes::default().with_no_retry(true), |b| b.read(&x));
    assert_eq!(r, Err(StmError::Aborted(AbortReason::WriteLocked)));
    let before = stm.clock();
    assert!(a.commit());
    // Only visible reads: released unchanged.
    assert_eq!(stm.clock(), before);
    assert_eq!(b.try_atomically(Attributes::default(), |b| b.read(&x)), Ok(4));
}

#[test]
fn visible_reads_threshold_parameter() {
    let stm = Stm::new(
        Config::default()
            .with_contention_manager(ContentionPolicy::Priority)
            .with_lock_table_bits(10),
    )
    .unwrap();
    let x = TWord::new(0);
    let mut a = stm.register_thread().unwrap();
    let mut b = stm.register_thread().unwrap();

    // Disabled: reads stay invisible, b can read under a's read.
    stm.set_parameter("vr_threshold", Parameter::Int(-1)).unwrap();
    a.start(Attributes::default());
    a.read(&x).unwrap();
    b.start(Attributes::default());
    assert_eq!(b.read(&x), Ok(0));
    assert!(b.commit());
    assert!(a.commit());

    // Forced per transaction.
    a.start(Attributes::default().with_visible_reads(true));
    a.read(&x).unwrap();
    let r = b.try_atomically(Attributes::default().with_no_retry(true), |b| b.read(&x));
    assert_eq!(r, Err(StmError::Aborted(AbortReason::ReadLocked)));
    assert!(a.commit());
}

#[test]
fn priority_winner_kills_owner() {
    init_tracing();
    let stm = Stm::new(
        Config::default()
            .with_contention_manager(ContentionPolicy::Priority)
            .with_lock_table_bits(10),
    )
    .unwrap();
    let words = spread();
    let (x, y) = (&words[0], &words[32]);
    let mut a = stm.register_thread().unwrap();
    let wrote = AtomicBool::new(false);

    thread::scope(|s| {
        let owner = s.spawn(|| {
            let mut b = stm.register_thread().unwrap();
            assert_eq!(b.tid(), 1);
            b.start(Attributes::default());
            b.write(x, 99).unwrap();
            wrote.store(true, Ordering::SeqCst);
            loop {
                match b.read(y) {
                    Ok(_) => thread::yield_now(),
                    Err(e) => break e,
                }
            }
        });

        while !wrote.load(Ordering::SeqCst) {
            thread::yield_now();
        }
        a.start(Attributes::default());
        // Waits for the killed owner to roll back, then reads the old value.
        assert_eq!(a.read(x), Ok(0));
        assert!(a.commit());
        assert_eq!(
            owner.join().unwrap(),
            StmError::Aborted(AbortReason::Killed)
        );
    });
    assert_eq!(x.load_unsynchronized(), 0);
}

#[test]
#[cfg_attr(miri, ignore)]
fn every_policy_keeps_counter_exact() {
    init_tracing();
    let policies = [
        ContentionPolicy::Suicide,
        ContentionPolicy::Delay,
        ContentionPolicy::Backoff,
        ContentionPolicy::Priority,
    ];
    for design in DESIGNS {
        for policy in policies {
            let stm = Stm::new(
                Config::default()
                    .with_design(design)
                    .with_contention_manager(policy)
                    .with_backoff(4, 1024)
                    .with_lock_table_bits(10),
            )
            .unwrap();
            let words = spread();
            let (x, y) = (&words[0], &words[32]);

            thread::scope(|s| {
                for t in 0..4 {
                    let stm = &stm;
                    s.spawn(move || {
                        let mut tx = stm.register_thread().unwrap();
                        let attr = Attributes::default().with_visible_reads(t % 2 == 0);
                        for _ in 0..500 {
                            tx.try_atomically(attr, |tx| {
                                let a = tx.read(x)?;
                                let b = tx.read(y)?;
                                tx.write(x, a + 1)?;
                                tx.write(y, b + 2)
                            })
                            .unwrap();
                        }
                    });
                }
            });

            assert_eq!(stm.unit_load(x).0, 2000, "{design} {policy}");
            assert_eq!(stm.unit_load(y).0, 4000, "{design} {policy}");
        }
    }
}
