//! Cooperative per-thread event loops
//!
//! A [`MainContext`] is a task queue that some thread iterates. Other threads
//! post closures into it with [`MainContext::invoke`] and they run the next
//! time the owning thread calls [`MainContext::iteration`]. Connections use
//! this to run method handlers and asynchronous call callbacks on the thread
//! that registered them.
//!
//! Each thread has a stack of thread-default contexts. When the stack is
//! empty the thread falls back to its own lazily created default context.
//! Wakeups are sticky: a [`MainContext::wakeup`] that arrives before the
//! owner starts waiting still makes the next blocking iteration return.

use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

type Task = Box<dyn FnOnce() + Send + 'static>;

struct State {
    tasks: VecDeque<Task>,
    woken: bool,
}

struct Inner {
    state: Mutex<State>,
    ready: Condvar,
}

/// A task queue iterated by one thread at a time
#[derive(Clone)]
pub struct MainContext {
    inner: Arc<Inner>,
}

thread_local! {
    static THREAD_DEFAULT_STACK: RefCell<Vec<MainContext>> = const { RefCell::new(Vec::new()) };
    static THREAD_FALLBACK: MainContext = MainContext::new();
}

impl MainContext {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    tasks: VecDeque::new(),
                    woken: false,
                }),
                ready: Condvar::new(),
            }),
        }
    }

    /// Returns the calling thread's current default context
    ///
    /// This is the top of the thread-default stack, or the thread's own
    /// fallback context when nothing has been pushed.
    pub fn ref_thread_default() -> MainContext {
        THREAD_DEFAULT_STACK
            .with(|stack| stack.borrow().last().cloned())
            .unwrap_or_else(|| THREAD_FALLBACK.with(MainContext::clone))
    }

    /// Makes this context the calling thread's default until the guard drops
    pub fn push_thread_default(&self) -> ThreadDefaultGuard {
        THREAD_DEFAULT_STACK.with(|stack| stack.borrow_mut().push(self.clone()));
        ThreadDefaultGuard {
            context: self.clone(),
            _not_send: PhantomData,
        }
    }

    /// Posts `task` to run during a later iteration of this context
    pub fn invoke<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        state.tasks.push_back(Box::new(task));
        self.inner.ready.notify_all();
    }

    /// Makes the current or next blocking iteration return
    pub fn wakeup(&self) {
        let mut state = self.inner.state.lock();
        state.woken = true;
        self.inner.ready.notify_all();
    }

    /// Whether any task is waiting to run
    pub fn pending(&self) -> bool {
        !self.inner.state.lock().tasks.is_empty()
    }

    /// Runs every queued task, optionally blocking until there is work
    ///
    /// With `may_block` set this waits until a task is posted or
    /// [`wakeup`](Self::wakeup) is called. Returns whether any task ran.
    /// Tasks posted while the batch runs are left for the next iteration.
    pub fn iteration(&self, may_block: bool) -> bool {
        self.iterate(may_block, None)
    }

    /// Like [`iteration`](Self::iteration) with blocking, but gives up after `timeout`
    pub fn iteration_timeout(&self, timeout: Duration) -> bool {
        self.iterate(true, Some(timeout))
    }

    fn iterate(&self, may_block: bool, timeout: Option<Duration>) -> bool {
        let batch: Vec<Task> = {
            let mut state = self.inner.state.lock();
            if may_block {
                while state.tasks.is_empty() && !state.woken {
                    match timeout {
                        Some(timeout) => {
                            if self.inner.ready.wait_for(&mut state, timeout).timed_out() {
                                break;
                            }
                        }
                        None => self.inner.ready.wait(&mut state),
                    }
                }
            }
            state.woken = false;
            state.tasks.drain(..).collect()
        };

        let dispatched = !batch.is_empty();
        if dispatched {
            trace!(tasks = batch.len(), "Dispatching main context tasks");
        }
        for task in batch {
            task();
        }
        dispatched
    }

    /// Whether both handles refer to the same context
    pub fn is_same(&self, other: &MainContext) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for MainContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MainContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MainContext")
            .field("ptr", &Arc::as_ptr(&self.inner))
            .finish()
    }
}

/// Pops a thread-default context when dropped
///
/// Guards must be dropped in reverse push order on the thread that created them.
#[must_use = "the context stops being thread-default as soon as the guard is dropped"]
pub struct ThreadDefaultGuard {
    context: MainContext,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ThreadDefaultGuard {
    fn drop(&mut self) {
        THREAD_DEFAULT_STACK.with(|stack| {
            let popped = stack.borrow_mut().pop();
            debug_assert!(
                popped.is_some_and(|ctx| ctx.is_same(&self.context)),
                "thread-default main contexts popped out of order"
            );
        });
    }
}
