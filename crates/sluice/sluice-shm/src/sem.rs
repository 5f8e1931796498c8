use crate::futex;
use crate::{Key, Segment, ShmError, ShmNamespace};
use std::mem::size_of;
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

/// "SLUICESM"
const SEM_MAGIC: u64 = 0x534C_5549_4345_534D;

/// Upper bound on a single futex sleep before the waiter re-checks.
const WAIT_SLICE: Duration = Duration::from_millis(50);

#[repr(C)]
struct SemHeader {
    magic: AtomicU64,
    nsems: u32,
    removed: AtomicU32,
}

#[repr(C)]
struct SemCell {
    value: AtomicU32,
    waiters: AtomicU32,
}

/// A set of counting semaphores stored in one keyed segment.
///
/// Values never go negative: `wait(i, n)` blocks until the value is at least
/// `n` and then subtracts `n` atomically.
pub struct SemaphoreSet {
    seg: Segment,
    nsems: usize,
}

impl SemaphoreSet {
    /// Creates a set of `nsems` semaphores, all zero.
    pub fn create(ns: &ShmNamespace, key: Key, nsems: usize) -> Result<Self, ShmError> {
        let mut seg = Segment::create(ns, key, bytes_for_set(nsems))?;

        // SAFETY: freshly created, correctly sized and exclusively ours.
        unsafe {
            ptr::write(
                seg.as_mut_ptr() as *mut SemHeader,
                SemHeader {
                    magic: AtomicU64::new(0),
                    nsems: nsems as u32,
                    removed: AtomicU32::new(0),
                },
            );
        }

        let set = Self { seg, nsems };
        set.header().magic.store(SEM_MAGIC, Ordering::Release);
        Ok(set)
    }

    /// Attaches to an existing set, checking it holds exactly `nsems`.
    pub fn attach(ns: &ShmNamespace, key: Key, nsems: usize) -> Result<Self, ShmError> {
        let seg = Segment::attach(ns, key)?;
        if seg.len() < bytes_for_set(nsems) {
            return Err(ShmError::Invalid {
                key,
                reason: "semaphore segment too small",
            });
        }

        let set = Self { seg, nsems };
        let h = set.header();
        if h.magic.load(Ordering::Acquire) != SEM_MAGIC {
            return Err(ShmError::Invalid {
                key,
                reason: "bad semaphore magic",
            });
        }
        if h.nsems as usize != nsems {
            return Err(ShmError::Invalid {
                key,
                reason: "semaphore count mismatch",
            });
        }
        Ok(set)
    }

    #[inline]
    fn header(&self) -> &SemHeader {
        // SAFETY: the segment is at least `bytes_for_set(nsems)` long.
        unsafe { &*(self.seg.as_ptr() as *const SemHeader) }
    }

    #[inline]
    fn cells(&self) -> &[SemCell] {
        // SAFETY: cells follow the header and are covered by the mapping.
        unsafe {
            slice::from_raw_parts(
                self.seg.as_ptr().add(size_of::<SemHeader>()) as *const SemCell,
                self.nsems,
            )
        }
    }

    #[inline]
    fn check_live(&self) -> Result<(), ShmError> {
        if self.header().removed.load(Ordering::Acquire) != 0 {
            return Err(ShmError::Removed { key: self.key() });
        }
        Ok(())
    }

    /// Adds `n` to semaphore `i`, waking anyone blocked on it.
    pub fn post(&self, i: usize, n: u32) -> Result<(), ShmError> {
        self.check_live()?;
        let cell = &self.cells()[i];
        cell.value.fetch_add(n, Ordering::SeqCst);
        if cell.waiters.load(Ordering::SeqCst) > 0 {
            futex::wake_all(&cell.value);
        }
        Ok(())
    }

    /// Subtracts `n` from semaphore `i` if it holds at least `n`.
    ///
    /// Returns `Ok(false)` instead of blocking when the value is too small.
    pub fn try_wait(&self, i: usize, n: u32) -> Result<bool, ShmError> {
        self.check_live()?;
        let cell = &self.cells()[i];
        let mut cur = cell.value.load(Ordering::Acquire);
        while cur >= n {
            match cell
                .value
                .compare_exchange_weak(cur, cur - n, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(true),
                Err(actual) => cur = actual,
            }
        }
        Ok(false)
    }

    /// Blocks until semaphore `i` holds at least `n`, then subtracts `n`.
    ///
    /// # Errors
    /// [`ShmError::Removed`] if the set is destroyed while waiting.
    pub fn wait(&self, i: usize, n: u32) -> Result<(), ShmError> {
        let cell = &self.cells()[i];
        loop {
            if self.try_wait(i, n)? {
                return Ok(());
            }
            cell.waiters.fetch_add(1, Ordering::SeqCst);
            let seen = cell.value.load(Ordering::SeqCst);
            if seen < n {
                futex::wait(&cell.value, seen, WAIT_SLICE);
            }
            cell.waiters.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[inline]
    pub fn value(&self, i: usize) -> u32 {
        self.cells()[i].value.load(Ordering::Acquire)
    }

    /// Overwrites semaphore `i`. Only meant for resets and recovery.
    pub fn set_value(&self, i: usize, v: u32) -> Result<(), ShmError> {
        self.check_live()?;
        let cell = &self.cells()[i];
        cell.value.store(v, Ordering::SeqCst);
        if cell.waiters.load(Ordering::SeqCst) > 0 {
            futex::wake_all(&cell.value);
        }
        Ok(())
    }

    /// Flags the set as gone and unlinks it. Blocked waiters in any process
    /// return [`ShmError::Removed`] on their next re-check.
    pub fn remove(&self) -> Result<(), ShmError> {
        self.header().removed.store(1, Ordering::Release);
        for cell in self.cells() {
            futex::wake_all(&cell.value);
        }
        self.seg.remove()
    }

    #[inline]
    pub fn key(&self) -> Key {
        self.seg.key()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.nsems
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nsems == 0
    }

    pub fn segment(&self) -> &Segment {
        &self.seg
    }
}

fn bytes_for_set(nsems: usize) -> usize {
    size_of::<SemHeader>() + nsems * size_of::<SemCell>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;

    fn namespace() -> (tempfile::TempDir, ShmNamespace) {
        let dir = tempfile::tempdir().unwrap();
        let ns = ShmNamespace::new(dir.path());
        (dir, ns)
    }

    #[test]
    fn post_then_wait() {
        let (_dir, ns) = namespace();
        let set = SemaphoreSet::create(&ns, Key(0x20), 3).unwrap();
        set.post(1, 5).unwrap();
        assert_eq!(set.value(1), 5);
        set.wait(1, 3).unwrap();
        assert_eq!(set.value(1), 2);
        assert!(!set.try_wait(1, 3).unwrap());
        assert!(set.try_wait(1, 2).unwrap());
        assert_eq!(set.value(1), 0);
        assert_eq!(set.value(0), 0);
    }

    #[test]
    fn attach_checks_shape() {
        let (_dir, ns) = namespace();
        let set = SemaphoreSet::create(&ns, Key(0x21), 2).unwrap();
        set.post(0, 1).unwrap();
        let other = SemaphoreSet::attach(&ns, Key(0x21), 2).unwrap();
        assert_eq!(other.value(0), 1);
        assert!(matches!(
            SemaphoreSet::attach(&ns, Key(0x21), 5),
            Err(ShmError::Invalid { .. })
        ));
    }

    #[test]
    fn wait_blocks_until_posted_from_another_handle() {
        let (_dir, ns) = namespace();
        let set = SemaphoreSet::create(&ns, Key(0x22), 1).unwrap();
        let waiter = SemaphoreSet::attach(&ns, Key(0x22), 1).unwrap();

        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            waiter.wait(0, 2).unwrap();
            tx.send(()).unwrap();
        });

        set.post(0, 1).unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        set.post(0, 1).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        handle.join().unwrap();
        assert_eq!(set.value(0), 0);
    }

    #[test]
    fn remove_releases_waiters() {
        let (_dir, ns) = namespace();
        let set = SemaphoreSet::create(&ns, Key(0x23), 1).unwrap();
        let waiter = SemaphoreSet::attach(&ns, Key(0x23), 1).unwrap();

        let handle = thread::spawn(move || waiter.wait(0, 1));
        thread::sleep(Duration::from_millis(20));
        set.remove().unwrap();

        let res = handle.join().unwrap();
        assert!(matches!(res, Err(ShmError::Removed { .. })));
        assert!(matches!(set.post(0, 1), Err(ShmError::Removed { .. })));
    }
}
