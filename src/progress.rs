//! Progress reporting and cooperative cancellation.

/// Lifecycle status attached to a progress report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Status {
    Running = 0,
    Done = 1,
    Error = 2,
    Interrupted = 3,
}

/// Host-facing progress callback. `fraction` is in `[0, 1]`. Returning
/// `false` requests cancellation: the caller reports one final
/// `(fraction, Interrupted)` and unwinds with an interrupt error.
///
/// Reports come from a single (master) worker thread at a bounded rate, so
/// implementations may call back into arbitrary host code.
pub trait ProgressSink: Send + Sync {
    fn report(&self, fraction: f32, status: Status) -> bool;
}

/// Number of progress steps a full pass is divided into.
pub(crate) const PROGRESS_STEPS: usize = 100;

/// Sink that swallows all reports.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _fraction: f32, _status: Status) -> bool {
        true
    }
}

/// Sink that forwards reports to a closure.
pub struct FnProgress<F>(pub F);

impl<F> ProgressSink for FnProgress<F>
where
    F: Fn(f32, Status) -> bool + Send + Sync,
{
    fn report(&self, fraction: f32, status: Status) -> bool {
        (self.0)(fraction, status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fn_progress_forwards() {
        let seen = parking_lot::Mutex::new(Vec::new());
        let sink = FnProgress(|f: f32, s: Status| {
            seen.lock().push((f, s));
            f < 0.5
        });
        assert!(sink.report(0.0, Status::Running));
        assert!(!sink.report(1.0, Status::Done));
        assert_eq!(seen.lock().len(), 2);
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(Status::Running as i32, 0);
        assert_eq!(Status::Done as i32, 1);
        assert_eq!(Status::Error as i32, 2);
        assert_eq!(Status::Interrupted as i32, 3);
    }
}
