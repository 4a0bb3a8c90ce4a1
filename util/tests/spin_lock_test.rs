//! Test coverage of the spin lock.

use util::sync::KSpinLock;

#[test]
fn test_basic_locking() {
    let lock = KSpinLock::new(3_u32);
    {
        let mut guard = lock.lock();
        assert_eq!(*guard, 3, "Guard didn't read the stored value");
        *guard = 4;
        assert!(
            lock.try_lock().is_none(),
            "Lock shouldn't be acquirable while held"
        );
    }
    assert!(
        lock.try_lock().is_some(),
        "Lock should be acquirable after the guard dropped"
    );
    assert_eq!(*lock.lock(), 4, "Write through the guard was lost");
    assert_eq!(lock.into_inner(), 4);
}

#[test]
fn test_get_mut() {
    let mut lock = KSpinLock::new(0_u32);
    *lock.get_mut() = 7;
    assert_eq!(*lock.lock(), 7);
}

#[test]
fn test_mutual_exclusion() {
    const THREADS: usize = 8;
    const INCREMENTS: usize = 1_000;

    let counter = KSpinLock::new(0_usize);
    std::thread::scope(|scope| {
        for _ in 0..THREADS {
            scope.spawn(|| {
                for _ in 0..INCREMENTS {
                    *counter.lock() += 1;
                }
            });
        }
    });
    assert_eq!(
        *counter.lock(),
        THREADS * INCREMENTS,
        "Increments were lost under contention"
    );
}
