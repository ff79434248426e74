use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, error, warn};

use shardrpc_common::protocol::ShardRpcError;
use shardrpc_metrics::{RequestOutcome, RequestStatistics};

use crate::config::ServerConfig;
use crate::context::RequestContext;
use crate::filter::{self, Filter, FilterChain};
use crate::registry::{HandlerEntry, HandlerRegistry};

/// Outcome of one submitted request, delivered to the completion callback
/// exactly once.
#[derive(Debug)]
pub enum ExecutorResult {
    /// The handler produced a response payload
    Response(Bytes),
    /// Queue or service deadline exceeded
    Timeout,
    /// The handler raised or panicked
    HandlerError(String),
    /// The pool was saturated, or the executor is shut down
    Rejected,
    /// No handler is registered for the message name
    NoHandler(String),
}

/// Completion callback handed to [`MessageExecutor::submit`].
pub type CompletionFn = Box<dyn FnOnce(ExecutorResult) + Send>;

/// One-shot gate around the completion callback.
///
/// The worker, the service-deadline timer, and shutdown rejection all race
/// to complete a request; whoever takes the callback wins and the rest are
/// no-ops, which is what makes the exactly-once guarantee hold without
/// interrupting the handler.
struct Completion {
    slot: Mutex<CompletionSlot>,
}

struct CompletionSlot {
    callback: Option<CompletionFn>,
    timer: Option<tokio::task::JoinHandle<()>>,
}

impl Completion {
    fn new(callback: CompletionFn) -> Arc<Self> {
        Arc::new(Completion {
            slot: Mutex::new(CompletionSlot {
                callback: Some(callback),
                timer: None,
            }),
        })
    }

    /// Completes the request if nothing else has.
    ///
    /// `before` runs only for the winning caller, before the callback, so
    /// statistics are recorded ahead of the response write.
    fn complete(&self, result: ExecutorResult, before: impl FnOnce()) -> bool {
        let (callback, timer) = {
            let mut slot = self.slot.lock().unwrap();
            (slot.callback.take(), slot.timer.take())
        };
        match callback {
            Some(callback) => {
                if let Some(timer) = timer {
                    timer.abort();
                }
                before();
                callback(result);
                true
            }
            None => false,
        }
    }

    fn set_timer(&self, timer: tokio::task::JoinHandle<()>) {
        let mut slot = self.slot.lock().unwrap();
        if slot.callback.is_some() {
            slot.timer = Some(timer);
        } else {
            timer.abort();
        }
    }
}

struct Task {
    ctx: RequestContext,
    entry: HandlerEntry,
    completion: Arc<Completion>,
}

struct PoolState {
    queue: VecDeque<Task>,
    workers: usize,
    shutdown: bool,
}

struct ExecutorInner {
    core_pool_size: usize,
    max_pool_size: usize,
    keep_alive: Duration,
    queue_capacity: usize,
    request_timeout_ms: AtomicU64,
    response_generation_timeout_ms: AtomicI64,
    registry: Arc<HandlerRegistry>,
    filters: FilterChain,
    stats: Arc<RequestStatistics>,
    runtime: tokio::runtime::Handle,
    state: Mutex<PoolState>,
    work_available: Condvar,
    worker_seq: AtomicUsize,
    joiners: Mutex<Vec<thread::JoinHandle<()>>>,
}

/// Bounded worker pool that runs registered handlers with per-request
/// deadlines.
///
/// # Admission
///
/// A submitted request is admitted in four steps: start a core worker if
/// fewer than `request_thread_core_pool_size` exist, else queue if the
/// admission queue has room, else start an extra worker up to
/// `request_thread_max_pool_size`, else reject. Rejection completes the
/// callback with [`ExecutorResult::Rejected`] without blocking the caller,
/// which is the I/O dispatch task.
///
/// # Deadlines
///
/// Two independent deadlines are stamped at submission:
///
/// - the **queue deadline** (`request_timeout_ms`) is checked when a worker
///   dequeues the request; an expired request is shed without running the
///   handler
/// - the **service deadline** (`response_generation_timeout_ms`, disabled
///   when `<= 0`) is enforced by a timer; if the handler has not produced a
///   result by then the request completes with a timeout and the handler's
///   eventual result is discarded
///
/// Handlers are never interrupted; cancellation is cooperative and the
/// executor only guarantees the completion callback fires exactly once,
/// with statistics recorded first.
#[derive(Clone)]
pub struct MessageExecutor {
    inner: Arc<ExecutorInner>,
}

impl MessageExecutor {
    /// Creates an executor from the pool and timeout parameters of
    /// `config`.
    ///
    /// Must be called within a tokio runtime: service-deadline timers run
    /// on it.
    pub fn new(
        config: &ServerConfig,
        registry: Arc<HandlerRegistry>,
        stats: Arc<RequestStatistics>,
    ) -> shardrpc_common::Result<Self> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            ShardRpcError::Connection("message executor requires a tokio runtime".to_string())
        })?;

        let core_pool_size = config.request_thread_core_pool_size.max(1);
        let max_pool_size = config.request_thread_max_pool_size.max(core_pool_size);

        Ok(MessageExecutor {
            inner: Arc::new(ExecutorInner {
                core_pool_size,
                max_pool_size,
                keep_alive: Duration::from_secs(config.request_thread_keep_alive_secs.max(1)),
                queue_capacity: config.thread_pool_queue_size,
                request_timeout_ms: AtomicU64::new(config.request_timeout_ms),
                response_generation_timeout_ms: AtomicI64::new(
                    config.response_generation_timeout_ms,
                ),
                registry,
                filters: FilterChain::new(),
                stats,
                runtime,
                state: Mutex::new(PoolState {
                    queue: VecDeque::new(),
                    workers: 0,
                    shutdown: false,
                }),
                work_available: Condvar::new(),
                worker_seq: AtomicUsize::new(0),
                joiners: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Accepts a request and guarantees `on_complete` is invoked exactly
    /// once with its outcome. Never blocks the caller.
    pub fn submit(&self, mut ctx: RequestContext, on_complete: CompletionFn) {
        let completion = Completion::new(on_complete);

        let message_name = ctx.envelope.message_name.clone();
        let entry = match self.inner.registry.lookup(&message_name) {
            Some(entry) => entry,
            None => {
                debug!(message = %message_name, "no handler registered");
                completion.complete(ExecutorResult::NoHandler(message_name), || {});
                return;
            }
        };

        let request_timeout =
            Duration::from_millis(self.inner.request_timeout_ms.load(Ordering::Relaxed));
        let response_timeout = match self
            .inner
            .response_generation_timeout_ms
            .load(Ordering::Relaxed)
        {
            ms if ms > 0 => Some(Duration::from_millis(ms as u64)),
            _ => None,
        };
        ctx.arm_deadlines(request_timeout, response_timeout);

        let task = Task {
            ctx,
            entry,
            completion: completion.clone(),
        };

        let spawn_core = {
            let mut state = self.inner.state.lock().unwrap();
            if state.shutdown {
                drop(state);
                completion.complete(ExecutorResult::Rejected, || {});
                return;
            }
            if state.workers < self.inner.core_pool_size {
                state.workers += 1;
                state.queue.push_back(task);
                Some(true)
            } else if state.queue.len() < self.inner.queue_capacity {
                state.queue.push_back(task);
                None
            } else if state.workers < self.inner.max_pool_size {
                state.workers += 1;
                state.queue.push_back(task);
                Some(false)
            } else {
                drop(state);
                warn!(message = %message_name, "executor saturated, rejecting request");
                completion.complete(ExecutorResult::Rejected, || {});
                return;
            }
        };

        match spawn_core {
            Some(core) => self.spawn_worker(core),
            None => self.inner.work_available.notify_one(),
        }
    }

    /// Changes the queue-deadline horizon for subsequently submitted
    /// requests.
    pub fn set_request_timeout(&self, millis: u64) {
        self.inner.request_timeout_ms.store(millis, Ordering::Relaxed);
    }

    /// Appends filters to the chain around handler invocations.
    pub fn add_filters(&self, filters: Vec<Arc<dyn Filter>>) {
        self.inner.filters.add_filters(filters);
    }

    pub fn statistics(&self) -> Arc<RequestStatistics> {
        self.inner.stats.clone()
    }

    /// Drains the executor.
    ///
    /// Queued-but-unstarted requests complete with
    /// [`ExecutorResult::Rejected`]; in-flight handlers are allowed to
    /// finish and are joined before this returns. Subsequent `submit`s are
    /// rejected. Idempotent.
    pub fn shutdown(&self) {
        let drained: Vec<Task> = {
            let mut state = self.inner.state.lock().unwrap();
            if state.shutdown {
                Vec::new()
            } else {
                state.shutdown = true;
                state.queue.drain(..).collect()
            }
        };
        self.inner.work_available.notify_all();

        for task in drained {
            task.completion.complete(ExecutorResult::Rejected, || {});
        }

        let joiners = std::mem::take(&mut *self.inner.joiners.lock().unwrap());
        for handle in joiners {
            let _ = handle.join();
        }
    }

    /// Live worker count, for tests and introspection.
    pub fn worker_count(&self) -> usize {
        self.inner.state.lock().unwrap().workers
    }

    /// Current admission queue depth.
    pub fn queued(&self) -> usize {
        self.inner.state.lock().unwrap().queue.len()
    }

    fn spawn_worker(&self, core: bool) {
        let inner = self.inner.clone();
        let id = self.inner.worker_seq.fetch_add(1, Ordering::Relaxed);
        let spawned = thread::Builder::new()
            .name(format!("shardrpc-request-{id}"))
            .spawn(move || worker_loop(inner, core));
        match spawned {
            Ok(handle) => self.inner.joiners.lock().unwrap().push(handle),
            Err(e) => {
                error!(error = %e, "failed to spawn request worker");
                // The submission that grew the pool is still at the queue
                // tail; without this worker nothing is guaranteed to serve
                // it, so it completes as rejected instead of sitting
                // unserved.
                let orphaned = {
                    let mut state = self.inner.state.lock().unwrap();
                    state.workers -= 1;
                    state.queue.pop_back()
                };
                if let Some(task) = orphaned {
                    task.completion.complete(ExecutorResult::Rejected, || {});
                }
            }
        }
    }
}

fn worker_loop(inner: Arc<ExecutorInner>, core: bool) {
    loop {
        // The worker count is decremented inside the same critical section
        // as the decision to exit, so `submit` never counts a worker that
        // has already chosen to retire.
        let task = {
            let mut state = inner.state.lock().unwrap();
            loop {
                if let Some(task) = state.queue.pop_front() {
                    break Some(task);
                }
                if state.shutdown {
                    state.workers -= 1;
                    break None;
                }
                if core {
                    state = inner.work_available.wait(state).unwrap();
                } else {
                    let (next, timeout) = inner
                        .work_available
                        .wait_timeout(state, inner.keep_alive)
                        .unwrap();
                    state = next;
                    if timeout.timed_out() && state.queue.is_empty() && !state.shutdown {
                        state.workers -= 1;
                        break None;
                    }
                }
            }
        };

        match task {
            Some(task) => run_task(&inner, task),
            None => return,
        }
    }
}

fn run_task(inner: &Arc<ExecutorInner>, task: Task) {
    let Task {
        mut ctx,
        entry,
        completion,
    } = task;

    let dequeued_at = Instant::now();
    let queue_wait = dequeued_at.duration_since(ctx.received_at);
    let message_name = ctx.envelope.message_name.clone();

    // Shed expired work before burning handler time on it.
    if dequeued_at >= ctx.queue_deadline {
        let stats = inner.stats.clone();
        let name = message_name.clone();
        completion.complete(ExecutorResult::Timeout, move || {
            stats.record(&name, queue_wait, Duration::ZERO, RequestOutcome::Timeout);
        });
        return;
    }

    if let Some(deadline) = ctx.service_deadline {
        let stats = inner.stats.clone();
        let timer_completion = completion.clone();
        let name = message_name.clone();
        let timer = inner.runtime.spawn(async move {
            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
            timer_completion.complete(ExecutorResult::Timeout, move || {
                stats.record(&name, queue_wait, dequeued_at.elapsed(), RequestOutcome::Timeout);
            });
        });
        completion.set_timer(timer);
    }

    let chain = inner.filters.snapshot();
    let invoked = catch_unwind(AssertUnwindSafe(|| {
        filter::run_chain(&chain, &mut ctx, |ctx| {
            entry
                .invoke(&ctx.envelope.payload)
                .map_err(|e| ShardRpcError::HandlerError(e.to_string()))
        })
    }));
    let result = match invoked {
        Ok(result) => result,
        Err(_) => Err(ShardRpcError::HandlerError("handler panicked".to_string())),
    };

    let service_time = dequeued_at.elapsed();
    let stats = inner.stats.clone();
    match result {
        Ok(response) => {
            completion.complete(ExecutorResult::Response(response), move || {
                stats.record(&message_name, queue_wait, service_time, RequestOutcome::Ok);
            });
        }
        Err(error) => {
            let message = error.to_string();
            completion.complete(ExecutorResult::HandlerError(message), move || {
                stats.record(
                    &message_name,
                    queue_wait,
                    service_time,
                    RequestOutcome::HandlerError,
                );
            });
        }
    }
}
