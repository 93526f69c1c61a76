/// A type-erased, zero-argument unit of deferred work.
///
/// A `Task` captures an arbitrary closure and its bound state at submission
/// time. The pool observes no result: a task communicates only through side
/// effects or channels it owns. Once enqueued, the task is owned by whichever
/// queue holds it; the worker that removes it consumes it exactly once.
pub struct Task {
    f: Box<dyn FnOnce() + Send + 'static>,
}

impl Task {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Task { f: Box::new(f) }
    }

    /// Invoke the captured closure, consuming the task.
    pub fn run(self) {
        (self.f)()
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Task").finish()
    }
}
