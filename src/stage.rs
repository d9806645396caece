//! A single pipeline stage: one worker thread pulling inputs and (optionally)
//! output buffers, running a user function, and forwarding the result
//! (spec §4.2).

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::UserError;
use crate::queue::{BoundedQueue, WaitOutcome};

/// Poll interval for cancellable suspension points (spec §5: "bounded-wait
/// condition-variable waits"). Bounds worst-case `stop()` latency when a
/// stage is parked on an empty, unjoined queue.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Tri-state result of a stage's user function, replacing the original's
/// `bool finish` + `valid` pair with an explicit sum type (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    /// Output buffer is complete: deposit it downstream, fetch a new one.
    Produced,
    /// Input consumed but output not yet ready: keep the buffer, pull the
    /// next input without depositing anything.
    Consumed,
    /// The user function recognized this input as invalid but returned
    /// normally: the buffer is still deposited downstream, marked invalid by
    /// the caller's own bookkeeping (typically via `ProcessStatus::valid`).
    /// Distinct from an `Err` return, which is stage-fatal and cascades into
    /// pipeline shutdown rather than forwarding a slot.
    Failed,
}

type StageFn<In, Out, Ctx> =
    Box<dyn Fn(&In, &mut Out, &Ctx) -> anyhow::Result<StageOutcome> + Send + Sync>;

/// One worker thread's wiring: input queue, optional input-resource queue
/// (return buffers upstream), optional output-resource queue (obtain a
/// buffer), output queue, the user function, and the shared `done` flag.
pub struct Stage<In, Out, Ctx> {
    name: String,
    func: Arc<StageFn<In, Out, Ctx>>,
    input_work: Arc<BoundedQueue<In>>,
    input_resource: Option<Arc<BoundedQueue<In>>>,
    output_resource: Option<Arc<BoundedQueue<Out>>>,
    output_work: Arc<BoundedQueue<Out>>,
    context: Arc<Ctx>,
    done: Arc<AtomicBool>,
}

impl<In, Out, Ctx> Stage<In, Out, Ctx>
where
    In: Send + 'static,
    Out: Send + Default + 'static,
    Ctx: Send + Sync + 'static,
{
    pub fn new(
        name: impl Into<String>,
        func: StageFn<In, Out, Ctx>,
        input_work: Arc<BoundedQueue<In>>,
        input_resource: Option<Arc<BoundedQueue<In>>>,
        output_resource: Option<Arc<BoundedQueue<Out>>>,
        output_work: Arc<BoundedQueue<Out>>,
        context: Arc<Ctx>,
        done: Arc<AtomicBool>,
    ) -> Self {
        Self {
            name: name.into(),
            func: Arc::new(func),
            input_work,
            input_resource,
            output_resource,
            output_work,
            context,
            done,
        }
    }

    /// Spawns the worker thread and returns its handle. The thread runs the
    /// loop described in spec §4.2 until `done` is observed or the input
    /// queue drains after `join()`.
    pub fn spawn(self) -> JoinHandle<()> {
        let Stage {
            name,
            func,
            input_work,
            input_resource,
            output_resource,
            output_work,
            context,
            done,
        } = self;

        std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                tracing::debug!(stage = %name, "worker started");
                'outer: loop {
                    if done.load(Ordering::Acquire) {
                        break;
                    }

                    let mut out_buf = match &output_resource {
                        Some(q) => match Self::acquire_resource(q, &done) {
                            Some(buf) => buf,
                            None => break,
                        },
                        None => Out::default(),
                    };

                    loop {
                        if done.load(Ordering::Acquire) {
                            break 'outer;
                        }

                        let in_item = loop {
                            if done.load(Ordering::Acquire) {
                                break 'outer;
                            }
                            match input_work.wait_and_pop_timeout(POLL_INTERVAL) {
                                WaitOutcome::Item(item) => break item,
                                WaitOutcome::Drained => {
                                    // Drained and joined: propagate the
                                    // signal downstream and exit.
                                    output_work.join();
                                    break 'outer;
                                }
                                WaitOutcome::TimedOut => continue,
                            }
                        };

                        let result = catch_unwind(AssertUnwindSafe(|| {
                            func(&in_item, &mut out_buf, &context)
                        }));

                        if let Some(resource_queue) = &input_resource {
                            resource_queue.push(in_item);
                        }

                        let outcome = match result {
                            Ok(Ok(outcome)) => outcome,
                            Ok(Err(user_err)) => {
                                let err = UserError::CallbackFailed {
                                    stage: name.clone(),
                                };
                                tracing::error!(stage = %name, error = %err, cause = %user_err, "stage callback returned Err; cascading shutdown");
                                done.store(true, Ordering::Release);
                                break 'outer;
                            }
                            Err(panic) => {
                                let err = UserError::CallbackPanicked {
                                    stage: name.clone(),
                                    message: panic_message(panic),
                                };
                                tracing::error!(stage = %name, error = %err, "stage panicked; cascading shutdown");
                                done.store(true, Ordering::Release);
                                break 'outer;
                            }
                        };

                        if outcome == StageOutcome::Consumed {
                            continue;
                        }
                        break;
                    }

                    if !done.load(Ordering::Acquire) {
                        output_work.push(out_buf);
                    }
                }
                tracing::debug!(stage = %name, "worker exiting");
            })
            .expect("failed to spawn stage worker thread")
    }

    fn acquire_resource(q: &Arc<BoundedQueue<Out>>, done: &Arc<AtomicBool>) -> Option<Out> {
        // Suspension point (a) of spec §5: wait for a buffer, observing
        // `done` on wake rather than looping on try_pop/yield as the
        // original's spin-wait did.
        loop {
            if done.load(Ordering::Acquire) {
                return None;
            }
            match q.wait_and_pop_timeout(POLL_INTERVAL) {
                WaitOutcome::Item(buf) => return Some(buf),
                WaitOutcome::Drained => return None,
                WaitOutcome::TimedOut => continue,
            }
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
