//! Worker pools and the dispatch loop.
//!
//! Each pool owns a fixed set of workers and a bounded free channel.  At
//! any instant the workers executing a call plus the handles on the free
//! channel account for the whole pool.  A worker re-enqueues itself at the
//! end of `eval`; callers that find the free channel empty wait, which is
//! the runtime's only backpressure.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use tether_wire::{Stream, Value};

use crate::clock;
use crate::context::{Context, REPLY_START, ReplySlot};
use crate::error::{RpcError, capture_stack};
use crate::fncache::read_kind;
use crate::processor::{EchoNode, ProcessorShared};
use crate::service::{ValueKind, value_type_name};

const THREAD_STOP_TIMEOUT: Duration = Duration::from_secs(6);
const POOL_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// The sending side of one worker's inbound channel.
#[derive(Clone)]
pub(crate) struct WorkerHandle {
    job_tx: mpsc::Sender<Stream>,
}

impl WorkerHandle {
    /// Queue a stream on the worker; its driver runs `eval` synchronously.
    pub(crate) async fn put(&self, stream: Stream) -> bool {
        self.job_tx.send(stream).await.is_ok()
    }
}

struct WorkerControl {
    shutdown_tx: Option<oneshot::Sender<()>>,
    closed_rx: Option<oneshot::Receiver<()>>,
}

pub(crate) struct ThreadPool {
    controls: Mutex<Vec<WorkerControl>>,
    free_rx: tokio::sync::Mutex<mpsc::Receiver<WorkerHandle>>,
}

impl ThreadPool {
    /// Spawn `size` workers, each parked on the free channel.
    pub(crate) fn new(shared: Arc<ProcessorShared>, size: usize) -> Arc<Self> {
        let (free_tx, free_rx) = mpsc::channel(size);
        let mut controls = Vec::with_capacity(size);
        for _ in 0..size {
            let (job_tx, job_rx) = mpsc::channel(1);
            let (shutdown_tx, shutdown_rx) = oneshot::channel();
            let (closed_tx, closed_rx) = oneshot::channel();
            let handle = WorkerHandle { job_tx };
            let worker = Worker {
                shared: Arc::clone(&shared),
                free_tx: free_tx.clone(),
                handle: handle.clone(),
                out_stream: Some(Stream::take()),
                args: Vec::with_capacity(16),
            };
            tokio::spawn(worker.run(job_rx, shutdown_rx, closed_tx));
            if free_tx.try_send(handle).is_err() {
                tracing::error!("rpc-thread-pool: internal error");
            }
            controls.push(WorkerControl {
                shutdown_tx: Some(shutdown_tx),
                closed_rx: Some(closed_rx),
            });
        }
        Arc::new(ThreadPool {
            controls: Mutex::new(controls),
            free_rx: tokio::sync::Mutex::new(free_rx),
        })
    }

    /// Take a worker off the free channel, waiting for one to come back
    /// when the pool is saturated.
    pub(crate) async fn alloc(&self) -> Option<WorkerHandle> {
        self.free_rx.lock().await.recv().await
    }

    /// Stop every worker concurrently, then drain the free channel.  Each
    /// phase is bounded per worker.
    pub(crate) async fn stop(&self) {
        let controls: Vec<WorkerControl> = {
            let mut guard = self.controls.lock().expect("worker controls poisoned");
            guard.drain(..).collect()
        };
        let mut stops = Vec::with_capacity(controls.len());
        for control in controls {
            stops.push(tokio::spawn(stop_worker(control)));
        }
        for stop in stops {
            if timeout(POOL_STOP_TIMEOUT, stop).await.is_err() {
                tracing::error!("rpc-thread-pool: internal error");
            }
            // The lock acquisition sits inside the timeout: a caller
            // blocked in `alloc` holds the lock while it waits.
            let drained = timeout(POOL_STOP_TIMEOUT, async {
                self.free_rx.lock().await.recv().await
            })
            .await;
            if drained.is_err() {
                tracing::error!("rpc-thread-pool: internal error");
            }
        }
    }
}

async fn stop_worker(mut control: WorkerControl) {
    if let Some(tx) = control.shutdown_tx.take() {
        let _ = tx.send(());
    }
    if let Some(rx) = control.closed_rx.take() {
        if timeout(THREAD_STOP_TIMEOUT, rx).await.is_err() {
            tracing::error!("rpc-thread: stop: timeout");
        }
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

struct Worker {
    shared: Arc<ProcessorShared>,
    free_tx: mpsc::Sender<WorkerHandle>,
    handle: WorkerHandle,
    /// Long-lived outbound stream, swapped with the inbound one at the end
    /// of each call so neither side re-allocates.
    out_stream: Option<Stream>,
    args: Vec<Value>,
}

impl Worker {
    async fn run(
        mut self,
        mut job_rx: mpsc::Receiver<Stream>,
        mut shutdown_rx: oneshot::Receiver<()>,
        closed_tx: oneshot::Sender<()>,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                job = job_rx.recv() => match job {
                    Some(stream) => self.eval(stream).await,
                    None => break,
                },
            }
        }
        let _ = closed_tx.send(());
    }

    /// Run one call: decode the envelope, execute the handler, hand the
    /// reply to the completion callback, and return to the free list.
    async fn eval(&mut self, mut in_stream: Stream) {
        let start_ns = clock::now_ns();
        let mut out = self.out_stream.take().expect("worker outbound stream");
        out.copy_header_from(&in_stream);
        out.set_write_pos(REPLY_START);
        let slot = ReplySlot::new(out);
        let ctx = Context::from_slot(Arc::clone(&slot));

        let echo = self.dispatch(&ctx, &mut in_stream);

        let (ret_stream, success) = slot.detach();
        if let Some(node) = &echo {
            let elapsed = (clock::now_ns() - start_ns).max(0) as u64;
            node.indicator.record(elapsed, success);
        }
        in_stream.reset();
        self.out_stream = Some(in_stream);
        self.args.clear();
        if let Some(callback) = &self.shared.callback {
            callback(ret_stream, success);
        } else {
            ret_stream.recycle();
        }
        let _ = self.free_tx.send(self.handle.clone()).await;
    }

    fn dispatch(&mut self, ctx: &Context, in_stream: &mut Stream) -> Option<Arc<EchoNode>> {
        // Target path.
        let node = {
            let Some(path) = in_stream.read_str_fast() else {
                ctx.write_reply_error("rpc data format error", "", true);
                return None;
            };
            match self.shared.echo_node(&path) {
                Some(node) => node,
                None => {
                    ctx.write_reply_error(
                        &format!("rpc-server: echo path {path} is not mounted"),
                        "",
                        true,
                    );
                    return None;
                }
            }
        };
        ctx.set_echo_debug(&node.debug_string);

        // Call depth.
        let Some(depth) = in_stream.read_uint64() else {
            ctx.write_reply_error("rpc data format error", "", true);
            return Some(node);
        };
        if depth > self.shared.max_call_depth {
            ctx.error(RpcError::with_debug(
                format!(
                    "rpc current call depth({depth}) is overflow. limited({})",
                    self.shared.max_call_depth
                ),
                capture_stack(),
            ));
            return Some(node);
        }

        // Caller identity.
        let Some(from) = in_stream.read_string() else {
            ctx.write_reply_error("rpc data format error", "", true);
            return Some(node);
        };
        tracing::trace!(path = %node.path, from = %from, depth, "dispatch");

        // Arguments: cached fast path, or the generic kind walk.
        let arg_start = in_stream.read_pos();
        let mut decoded_ok = true;
        if let Some(cache_fn) = &node.cache_fn {
            let call = std::panic::catch_unwind(AssertUnwindSafe(|| {
                cache_fn(ctx.clone(), in_stream, &node.handler)
            }));
            match call {
                Ok(drained) => decoded_ok = drained,
                Err(payload) => {
                    write_panic_error(ctx, &node, payload.as_ref());
                    return Some(node);
                }
            }
        } else {
            self.args.clear();
            for kind in &node.kinds {
                match read_kind(in_stream, *kind) {
                    Some(value) => self.args.push(value),
                    None => {
                        decoded_ok = false;
                        break;
                    }
                }
            }
            if decoded_ok && !in_stream.can_read() {
                let handler = Arc::clone(&node.handler);
                let call = std::panic::catch_unwind(AssertUnwindSafe(|| {
                    handler(ctx.clone(), &self.args);
                }));
                if let Err(payload) = call {
                    write_panic_error(ctx, &node, payload.as_ref());
                    return Some(node);
                }
            }
        }

        // Anything left over (or a failed read) means the sent arguments
        // do not match the registered signature: re-decode generically and
        // report both sides.
        if !decoded_ok || in_stream.can_read() {
            report_arg_mismatch(ctx, &node, in_stream, arg_start);
        }
        Some(node)
    }
}

fn write_panic_error(ctx: &Context, node: &EchoNode, payload: &(dyn std::any::Any + Send)) {
    let message = panic_message(payload);
    ctx.write_reply_error(
        &format!(
            "rpc-server: {}: runtime error: {}",
            node.call_string, message
        ),
        &capture_stack(),
        true,
    );
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}

fn report_arg_mismatch(ctx: &Context, node: &EchoNode, in_stream: &mut Stream, arg_start: usize) {
    if !in_stream.set_read_pos(arg_start) {
        ctx.write_reply_error("rpc data format error", "", true);
        return;
    }
    let mut remote_types = vec!["rpc.Context"];
    while in_stream.can_read() {
        match in_stream.read_value() {
            None => {
                ctx.write_reply_error("rpc data format error", "", true);
                return;
            }
            Some(Value::Nil) => {
                // A wire nil is printed as the expected container type when
                // one is registered at this position.
                let arg_idx = remote_types.len() - 1;
                let expected = node.kinds.get(arg_idx).copied();
                remote_types.push(match expected {
                    Some(k @ (ValueKind::Bytes | ValueKind::Array | ValueKind::Map)) => {
                        k.type_name()
                    }
                    _ => "<nil>",
                });
            }
            Some(value) => remote_types.push(value_type_name(&value)),
        }
    }
    ctx.write_reply_error(
        &format!(
            "rpc echo arguments not match\nCalled: {}({}) rpc.Return\nRequired: {}",
            node.path,
            remote_types.join(", "),
            node.call_string
        ),
        &node.debug_string,
        true,
    );
}
