//! Recurring-task scheduler
//!
//! Loopers run a unit of work on a period. Each tick's work runs in its own
//! spawned task under [`supervise`], and its result is consumed before the
//! next wait begins. A tick whose status is in `[100, 200)` keeps the loop
//! going; any other status, a panic or a cancellation ends it with exactly one
//! final report.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use neuron_core::{NeuronError, Result, StatusCode};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout, Duration, Instant};
use tracing::{debug, error, warn};

// ----------------------------------------------------------------------------
// Supervision
// ----------------------------------------------------------------------------

/// A supervised unit of work panicked or was aborted
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{context}: {reason}")]
pub struct TaskFault {
    pub status: StatusCode,
    pub context: String,
    pub reason: String,
}

impl TaskFault {
    pub fn new(context: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SYSTEM_ERROR,
            context: context.into(),
            reason: reason.into(),
        }
    }

    fn from_panic(context: String, payload: Box<dyn Any + Send>) -> Self {
        let reason = if let Some(message) = payload.downcast_ref::<&str>() {
            (*message).to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "panic with non-string payload".to_string()
        };
        Self::new(context, reason)
    }
}

impl From<TaskFault> for NeuronError {
    fn from(fault: TaskFault) -> Self {
        NeuronError::task_fault(fault.to_string())
    }
}

/// Run a future, turning a panic inside it into a [`TaskFault`]
pub async fn supervise<F>(context: String, fut: F) -> std::result::Result<F::Output, TaskFault>
where
    F: Future,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(output) => Ok(output),
        Err(payload) => {
            let fault = TaskFault::from_panic(context, payload);
            error!("Supervised task faulted: {}", fault);
            Err(fault)
        }
    }
}

// ----------------------------------------------------------------------------
// Ticks and Signals
// ----------------------------------------------------------------------------

/// Result of one unit of recurring work
#[derive(Debug, Clone, PartialEq)]
pub struct Tick<T> {
    pub status: StatusCode,
    pub data: T,
    /// Outstanding work items, used by adaptive retiming
    pub slices: u32,
}

impl<T> Tick<T> {
    /// Successful tick, the loop continues
    pub fn proceed(data: T) -> Self {
        Self {
            status: StatusCode::SUCCESS,
            data,
            slices: 0,
        }
    }

    /// Tick with an explicit status; anything outside `[100, 200)` stops the loop
    pub fn with_status(status: StatusCode, data: T) -> Self {
        Self {
            status,
            data,
            slices: 0,
        }
    }

    pub fn with_slices(mut self, slices: u32) -> Self {
        self.slices = slices;
        self
    }
}

/// Report delivered to a looper's observer
#[derive(Debug, Clone, PartialEq)]
pub enum Signal<T> {
    /// A tick succeeded and the loop continues
    Continue(Tick<T>),
    /// A tick returned a failure status; final report
    Stopped(Tick<T>),
    /// The work panicked or was aborted; final report
    Faulted(TaskFault),
    /// Cancellation was observed between ticks; final report
    Cancelled,
    /// The run budget was exhausted; final report
    TimedOut,
}

impl<T> Signal<T> {
    pub fn status(&self) -> StatusCode {
        match self {
            Signal::Continue(tick) | Signal::Stopped(tick) => tick.status,
            Signal::Faulted(fault) => fault.status,
            Signal::Cancelled => StatusCode::PROCESS_SHUTDOWN,
            Signal::TimedOut => StatusCode::PROCESS_TIMEOUT,
        }
    }

    /// True for every report after which the loop has ended
    pub fn is_final(&self) -> bool {
        !matches!(self, Signal::Continue(_))
    }
}

impl<T> fmt::Display for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self.status();
        match self {
            Signal::Faulted(fault) => write!(f, "{} ({})", status, fault),
            _ => write!(f, "{}", status),
        }
    }
}

// ----------------------------------------------------------------------------
// Cancellation
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct CancelState {
    requested: watch::Sender<bool>,
    acknowledged: watch::Sender<bool>,
}

/// Cancellation request with an acknowledgement from the loop that honored it
#[derive(Debug, Clone)]
pub struct CancelSignal {
    state: Arc<CancelState>,
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelSignal {
    pub fn new() -> Self {
        let (requested, _) = watch::channel(false);
        let (acknowledged, _) = watch::channel(false);
        Self {
            state: Arc::new(CancelState {
                requested,
                acknowledged,
            }),
        }
    }

    /// Ask the loop to stop
    pub fn cancel(&self) {
        self.state.requested.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.state.requested.borrow()
    }

    /// Resolve once cancellation has been requested
    pub async fn cancelled(&self) {
        let mut rx = self.state.requested.subscribe();
        // The sender lives in `self`, so the channel cannot close here
        let _ = rx.wait_for(|requested| *requested).await;
    }

    /// Mark the loop as finished
    pub fn acknowledge(&self) {
        self.state.acknowledged.send_replace(true);
    }

    pub fn is_acknowledged(&self) -> bool {
        *self.state.acknowledged.borrow()
    }

    /// Resolve once the loop has finished
    pub async fn acknowledged(&self) {
        let mut rx = self.state.acknowledged.subscribe();
        let _ = rx.wait_for(|acknowledged| *acknowledged).await;
    }
}

// ----------------------------------------------------------------------------
// Interval Loops
// ----------------------------------------------------------------------------

/// How the wait before the next tick is computed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retiming {
    /// Always wait the base interval
    Fixed,
    /// Wait `interval / slices`, a tick reporting zero slices counts as one
    Adaptive,
}

/// Wait before the next tick
pub fn retime(interval: Duration, slices: u32, retiming: Retiming) -> Duration {
    match retiming {
        Retiming::Fixed => interval,
        Retiming::Adaptive => interval / slices.max(1),
    }
}

/// Run `work` every `interval` until it fails, panics or is cancelled
///
/// Every outcome is reported through `on_signal`; the final report is
/// followed by an acknowledgement on `cancel`.
pub async fn run_interval<T, W, Fut, S>(
    name: &str,
    mut work: W,
    mut on_signal: S,
    interval: Duration,
    cancel: CancelSignal,
    retiming: Retiming,
) where
    W: FnMut() -> Fut,
    Fut: Future<Output = Tick<T>> + Send + 'static,
    T: Send + 'static,
    S: FnMut(Signal<T>),
{
    debug!("Looper {} started", name);
    loop {
        if cancel.is_cancelled() {
            on_signal(Signal::Cancelled);
            break;
        }

        let started = Instant::now();
        let tick = match tokio::spawn(supervise(name.to_string(), work())).await {
            Ok(Ok(tick)) => tick,
            Ok(Err(fault)) => {
                on_signal(Signal::Faulted(fault));
                break;
            }
            Err(join_error) => {
                on_signal(Signal::Faulted(TaskFault::new(name, join_error.to_string())));
                break;
            }
        };

        if !tick.status.is_success() {
            on_signal(Signal::Stopped(tick));
            break;
        }

        let wait = retime(interval, tick.slices, retiming);
        on_signal(Signal::Continue(tick));

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                on_signal(Signal::Cancelled);
                break;
            }
            _ = sleep_until(started + wait) => {}
        }
    }
    cancel.acknowledge();
    debug!("Looper {} finished", name);
}

/// Request termination and wait up to `interval` for the loop to confirm
pub async fn cancel_interval(cancel: &CancelSignal, interval: Duration) -> bool {
    cancel.cancel();
    let confirmed = timeout(interval, cancel.acknowledged()).await.is_ok();
    if !confirmed {
        warn!("Looper did not acknowledge cancellation within {:?}", interval);
    }
    confirmed
}

/// Like [`run_interval`] with a run budget
///
/// Once `budget / interval` ticks have completed the loop ends with a
/// [`Signal::TimedOut`] report. A budget shorter than one interval is
/// rejected without running anything.
pub async fn run_with_timeout<T, W, Fut, S>(
    name: &str,
    work: W,
    mut on_signal: S,
    interval: Duration,
    budget: Duration,
) -> Result<()>
where
    W: FnMut() -> Fut,
    Fut: Future<Output = Tick<T>> + Send + 'static,
    T: Send + 'static,
    S: FnMut(Signal<T>),
{
    let times = if interval.is_zero() {
        0
    } else {
        budget.as_nanos() / interval.as_nanos()
    };
    if times < 1 {
        error!("Looper {} budget {:?} is shorter than its interval {:?}", name, budget, interval);
        return Err(NeuronError::config_error(format!(
            "budget {:?} shorter than interval {:?}",
            budget, interval
        )));
    }

    let cancel = CancelSignal::new();
    let trigger = cancel.clone();
    let mut completed: u128 = 0;
    let mut exhausted = false;

    run_interval(
        name,
        work,
        |signal| match signal {
            Signal::Continue(tick) => {
                completed += 1;
                on_signal(Signal::Continue(tick));
                if completed >= times {
                    exhausted = true;
                    trigger.cancel();
                }
            }
            Signal::Cancelled if exhausted => on_signal(Signal::TimedOut),
            other => on_signal(other),
        },
        interval,
        cancel,
        Retiming::Fixed,
    )
    .await;
    Ok(())
}

// ----------------------------------------------------------------------------
// One-shot Helpers
// ----------------------------------------------------------------------------

/// Outcome of [`retry`]
#[derive(Debug)]
pub struct Retried<T> {
    pub result: Result<T>,
    pub attempts: u32,
}

impl<T> Retried<T> {
    /// 100 on success, 200 otherwise
    pub fn status(&self) -> StatusCode {
        if self.result.is_ok() {
            StatusCode::SUCCESS
        } else {
            StatusCode::FAILED
        }
    }
}

/// Run `work` up to `times` times, pausing between failed attempts
///
/// `work` receives the 1-based attempt number.
pub async fn retry<T, W, Fut>(times: u32, pause: Duration, mut work: W) -> Retried<T>
where
    W: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let times = times.max(1);
    let mut attempt = 1;
    loop {
        match work(attempt).await {
            Ok(value) => {
                return Retried {
                    result: Ok(value),
                    attempts: attempt,
                }
            }
            Err(err) if attempt >= times => {
                return Retried {
                    result: Err(err),
                    attempts: attempt,
                }
            }
            Err(err) => {
                debug!("Attempt {}/{} failed: {}", attempt, times, err);
                attempt += 1;
                sleep(pause).await;
            }
        }
    }
}

/// Run `work` once after `delay`, supervised
pub fn after<F>(
    name: &str,
    delay: Duration,
    work: F,
) -> JoinHandle<std::result::Result<F::Output, TaskFault>>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let context = name.to_string();
    tokio::spawn(async move {
        sleep(delay).await;
        supervise(context, work).await
    })
}

/// Round-robin index after `last` over `len` items
pub fn select_next(len: usize, last: Option<usize>) -> Option<usize> {
    if len == 0 {
        return None;
    }
    match last {
        Some(last) if last + 1 < len => Some(last + 1),
        _ => Some(0),
    }
}
