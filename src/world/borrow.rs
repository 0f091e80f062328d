use std::sync::atomic::{AtomicU32, Ordering};

use crate::common::fatal;

const WRITE_BIT: u32 = 1 << 31;

/// Read/write borrow word for one component container. Systems running in a
/// parallel stage only touch containers through guards that go through this,
/// so a conflicting acquisition means the scheduler's access declarations
/// were wrong; that is a logic error and fatal.
pub struct AtomicBorrow(AtomicU32);

impl AtomicBorrow {
    pub fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    pub fn acquire_read(&self) {
        let prev = self.0.fetch_add(1, Ordering::Acquire);
        if prev & WRITE_BIT != 0 {
            self.0.fetch_sub(1, Ordering::Release);
            fatal("Component container is already borrowed mutably.");
        }
    }

    pub fn release_read(&self) {
        let prev = self.0.fetch_sub(1, Ordering::Release);
        debug_assert!(prev & !WRITE_BIT > 0);
    }

    pub fn acquire_write(&self) {
        if self
            .0
            .compare_exchange(0, WRITE_BIT, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            fatal("Component container is already borrowed.");
        }
    }

    pub fn release_write(&self) {
        let prev = self.0.swap(0, Ordering::Release);
        debug_assert_eq!(prev, WRITE_BIT);
    }
}

/// RAII release for a read borrow.
pub struct ReadBorrowGuard<'a> {
    borrow: &'a AtomicBorrow,
}

impl<'a> ReadBorrowGuard<'a> {
    pub fn acquire(borrow: &'a AtomicBorrow) -> Self {
        borrow.acquire_read();
        Self { borrow }
    }
}

impl Drop for ReadBorrowGuard<'_> {
    fn drop(&mut self) {
        self.borrow.release_read();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_reads_stack() {
        let borrow = AtomicBorrow::new();
        borrow.acquire_read();
        borrow.acquire_read();
        borrow.release_read();
        borrow.release_read();
        borrow.acquire_write();
        borrow.release_write();
    }

    #[test]
    #[should_panic]
    fn write_conflicts_with_read() {
        let borrow = AtomicBorrow::new();
        borrow.acquire_read();
        borrow.acquire_write();
    }
}
