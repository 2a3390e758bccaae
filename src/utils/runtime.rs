use std::panic;
use std::thread;
use tokio::runtime::Handle;

/// Runs blocking work so that it never blocks inside a tokio runtime.
///
/// Outside of a runtime `work` runs on the calling thread. Inside one (any
/// flavor, `block_in_place` is not available on current-thread runtimes) it
/// runs on a scoped thread that carries no runtime context, and the caller
/// waits for it. Panics are passed on to the caller.
pub fn outside_runtime<T, F>(work: F) -> T
where
    F: FnOnce() -> T + Send,
    T: Send,
{
    if Handle::try_current().is_err() {
        return work();
    }

    thread::scope(|scope| match scope.spawn(work).join() {
        Ok(value) => value,
        Err(payload) => panic::resume_unwind(payload),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::{assert_eq, assert_ne};

    #[test]
    fn test_runs_inline_without_runtime() {
        let caller = thread::current().id();
        assert_eq!(outside_runtime(|| thread::current().id()), caller);
    }

    #[tokio::test]
    async fn test_leaves_runtime_context() {
        let caller = thread::current().id();
        let (worker, in_runtime) =
            outside_runtime(|| (thread::current().id(), Handle::try_current().is_ok()));

        assert_ne!(worker, caller);
        assert!(!in_runtime);
    }

    #[tokio::test]
    async fn test_borrows_from_caller() {
        let words = vec!["a", "b"];
        assert_eq!(outside_runtime(|| words.join("+")), "a+b");
    }

    #[test]
    #[should_panic(expected = "worker gave up")]
    fn test_panics_reach_caller() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        runtime.block_on(async { outside_runtime(|| panic!("worker gave up")) });
    }
}
