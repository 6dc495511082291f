//! Thread-coordination substrate shared by the aggregator and the parallel
//! reader: scoped worker pools, an ordered critical-section serializer, and
//! first-error capture with cooperative early stop.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Resolve a requested worker count: 0 means the machine's available
/// parallelism.
pub fn num_threads(requested: u32) -> usize {
    if requested > 0 {
        requested as usize
    } else {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

// ============================================================================
// Error Capture
// ============================================================================

/// Records the first failure raised inside a parallel region and signals all
/// workers to stop. Workers poll [`stop_requested`](Self::stop_requested)
/// once per iteration and drop their remaining work when it fires.
pub struct ErrorCapture<E> {
    stop: AtomicBool,
    first: Mutex<Option<E>>,
}

impl<E> Default for ErrorCapture<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> ErrorCapture<E> {
    pub fn new() -> Self {
        ErrorCapture {
            stop: AtomicBool::new(false),
            first: Mutex::new(None),
        }
    }

    #[inline]
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Request early termination without recording an error (used when the
    /// row cap is reached and the remaining chunks are no longer needed).
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Record `err` if it is the first one, and request a stop either way.
    pub fn capture(&self, err: E) {
        let mut first = self.first.lock();
        if first.is_none() {
            *first = Some(err);
        }
        drop(first);
        self.stop.store(true, Ordering::Release);
    }

    /// Whether an error (as opposed to a bare stop request) was recorded.
    pub fn error_caught(&self) -> bool {
        self.first.lock().is_some()
    }

    /// Extract the recorded error, if any. Call after the workers have
    /// joined; the first captured error is returned exactly once.
    pub fn take_error(&self) -> Option<E> {
        self.first.lock().take()
    }
}

/// Run `body(worker, nworkers)` on `nthreads` scoped threads. A body that
/// returns `Err` has its error captured (first wins) and flips the stop flag
/// for everyone else.
pub fn run_workers<E, F>(nthreads: usize, capture: &ErrorCapture<E>, body: F)
where
    E: Send,
    F: Fn(usize, usize) -> Result<(), E> + Sync,
{
    std::thread::scope(|s| {
        for worker in 0..nthreads {
            let body = &body;
            s.spawn(move || {
                if let Err(e) = body(worker, nthreads) {
                    capture.capture(e);
                }
            });
        }
    });
}

// ============================================================================
// Ordered Serializer
// ============================================================================

/// Admission interval for cancellation rechecks while parked.
const WAIT_SLICE: Duration = Duration::from_millis(10);

/// Admits workers to a critical section strictly in iteration order: a
/// worker holding item `i` parks until item `i - 1` has completed. This is
/// the single-slot serializer the reader uses to reconstruct an in-order row
/// stream from dynamically scheduled chunk parses.
pub struct OrderedSerializer {
    next: Mutex<usize>,
    cv: Condvar,
}

impl Default for OrderedSerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderedSerializer {
    pub fn new() -> Self {
        OrderedSerializer {
            next: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    /// Block until it is item `i`'s turn. Returns `false` if `cancelled`
    /// fired first, in which case the critical section must be skipped.
    pub fn wait_turn(&self, i: usize, cancelled: impl Fn() -> bool) -> bool {
        let mut next = self.next.lock();
        loop {
            if *next == i {
                return true;
            }
            if cancelled() {
                return false;
            }
            self.cv.wait_for(&mut next, WAIT_SLICE);
        }
    }

    /// Mark the current item complete and admit the next one.
    pub fn advance(&self) {
        let mut next = self.next.lock();
        *next += 1;
        drop(next);
        self.cv.notify_all();
    }
}

// ============================================================================
// Shared Slice
// ============================================================================

/// A writable view of a slice that can be shared across worker threads.
///
/// Workers write disjoint indices (each row is owned by exactly one worker),
/// which is what makes the aliasing sound; the type exists to express that
/// contract over a `&mut [T]` without handing every worker the whole
/// mutable borrow.
pub struct SharedSlice<'a, T> {
    ptr: *mut T,
    len: usize,
    _marker: PhantomData<&'a mut [T]>,
}

// SAFETY: the wrapper only permits writes through `set`, whose contract
// restricts each index to a single writer; `T: Send` makes handing cells to
// other threads sound.
unsafe impl<T: Send> Send for SharedSlice<'_, T> {}
unsafe impl<T: Send> Sync for SharedSlice<'_, T> {}

impl<'a, T> SharedSlice<'a, T> {
    pub fn new(slice: &'a mut [T]) -> Self {
        SharedSlice {
            ptr: slice.as_mut_ptr(),
            len: slice.len(),
            _marker: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Write `value` at index `i`.
    ///
    /// # Safety
    /// No other thread may read or write index `i` concurrently; callers
    /// partition indices so that each is written by exactly one worker.
    #[inline]
    pub unsafe fn set(&self, i: usize, value: T) {
        assert!(i < self.len);
        // SAFETY: bounds checked above; exclusivity per the function contract.
        unsafe { self.ptr.add(i).write(value) }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_error_capture_keeps_first() {
        let capture: ErrorCapture<String> = ErrorCapture::new();
        assert!(!capture.stop_requested());
        capture.capture("first".to_string());
        capture.capture("second".to_string());
        assert!(capture.stop_requested());
        assert_eq!(capture.take_error(), Some("first".to_string()));
        assert_eq!(capture.take_error(), None);
    }

    #[test]
    fn test_request_stop_records_no_error() {
        let capture: ErrorCapture<String> = ErrorCapture::new();
        capture.request_stop();
        assert!(capture.stop_requested());
        assert!(!capture.error_caught());
    }

    #[test]
    fn test_run_workers_stops_after_failure() {
        let capture: ErrorCapture<&'static str> = ErrorCapture::new();
        let iterations = AtomicUsize::new(0);
        run_workers(4, &capture, |worker, _n| {
            for _ in 0..1000 {
                if capture.stop_requested() {
                    return Ok(());
                }
                iterations.fetch_add(1, Ordering::Relaxed);
                if worker == 2 {
                    return Err("boom");
                }
            }
            Ok(())
        });
        assert_eq!(capture.take_error(), Some("boom"));
        assert!(iterations.load(Ordering::Relaxed) < 4000);
    }

    #[test]
    fn test_ordered_serializer_orders_commits() {
        let serializer = OrderedSerializer::new();
        let order = Mutex::new(Vec::new());
        let capture: ErrorCapture<()> = ErrorCapture::new();
        let nitems = 32;
        let next_item = AtomicUsize::new(0);
        run_workers(4, &capture, |_w, _n| {
            loop {
                let i = next_item.fetch_add(1, Ordering::Relaxed);
                if i >= nitems {
                    return Ok(());
                }
                // Simulate uneven parse times before the ordered section.
                std::thread::sleep(Duration::from_micros((i % 7) as u64 * 50));
                assert!(serializer.wait_turn(i, || capture.stop_requested()));
                order.lock().push(i);
                serializer.advance();
            }
        });
        let order = order.into_inner();
        assert_eq!(order, (0..nitems).collect::<Vec<_>>());
    }

    #[test]
    fn test_ordered_serializer_cancellation_unblocks() {
        let serializer = OrderedSerializer::new();
        let capture: ErrorCapture<()> = ErrorCapture::new();
        // Turn 0 never completes, so a waiter for turn 1 must bail out once
        // the stop flag fires.
        std::thread::scope(|s| {
            let h = s.spawn(|| serializer.wait_turn(1, || capture.stop_requested()));
            std::thread::sleep(Duration::from_millis(30));
            capture.request_stop();
            assert!(!h.join().unwrap());
        });
    }

    #[test]
    fn test_shared_slice_disjoint_writes() {
        let mut data = vec![0usize; 1024];
        let shared = SharedSlice::new(&mut data);
        let capture: ErrorCapture<()> = ErrorCapture::new();
        run_workers(4, &capture, |worker, nworkers| {
            let mut i = worker;
            while i < shared.len() {
                // SAFETY: workers stride disjointly, one writer per index.
                unsafe { shared.set(i, i * 2) };
                i += nworkers;
            }
            Ok(())
        });
        assert!(data.iter().enumerate().all(|(i, &v)| v == i * 2));
    }

    #[test]
    fn test_num_threads_default_is_positive() {
        assert!(num_threads(0) >= 1);
        assert_eq!(num_threads(3), 3);
    }
}
