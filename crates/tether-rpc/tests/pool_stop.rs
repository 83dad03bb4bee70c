//! Shutdown-timeout behavior with a wedged handler.
//!
//! One call parks a worker in a handler that never returns.  Stopping the
//! processor must give up in bounded time and emit both the pool-level and
//! the thread-level timeout events.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tether_rpc::{Processor, ProcessorCallback, Service, ValueKind};
use tether_wire::{Stream, Value};
use tracing_subscriber::fmt::MakeWriter;

#[derive(Clone, Default)]
struct Capture(Arc<Mutex<Vec<u8>>>);

impl Capture {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().expect("capture poisoned")).into_owned()
    }
}

impl io::Write for Capture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().expect("capture poisoned").extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for Capture {
    type Writer = Capture;

    fn make_writer(&'a self) -> Capture {
        self.clone()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn stop_with_wedged_handler_logs_both_timeouts() {
    let capture = Capture::default();
    tracing::subscriber::set_global_default(
        tracing_subscriber::fmt()
            .with_writer(capture.clone())
            .with_ansi(false)
            .finish(),
    )
    .expect("install capture subscriber");

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let callback: ProcessorCallback = Arc::new(move |stream, success| {
        let _ = tx.send(success);
        stream.recycle();
    });
    let processor = Arc::new(Processor::new(16, 16, Some(callback), None));
    // The handler wedges until released, so the runtime can still tear
    // down promptly once the assertions are done.
    let release = Arc::new(AtomicBool::new(false));
    let handler_release = Arc::clone(&release);
    let service = Service::new().echo("wedge", true, &[ValueKind::Bool], move |ctx, _| {
        while !handler_release.load(Ordering::Acquire) {
            std::thread::sleep(Duration::from_millis(50));
        }
        ctx.ok(true)
    });
    processor.add_service("user", service).expect("mount");
    assert!(processor.start());

    let mut stream = Stream::take();
    stream.write_str("$.user:wedge");
    stream.write_uint64(0);
    stream.write_str("#");
    assert!(stream.write_value(&Value::Bool(true)).is_ok());
    assert!(processor.put_stream(stream).await);

    // Give the worker a moment to enter the handler.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = Instant::now();
    processor.stop().await;
    let elapsed = started.elapsed();

    let logs = capture.text();
    assert!(
        logs.contains("rpc-thread-pool: internal error"),
        "missing pool timeout event in:\n{logs}"
    );
    assert!(
        logs.contains("rpc-thread: stop: timeout"),
        "missing thread timeout event in:\n{logs}"
    );
    // One 5 s join timeout plus one 5 s drain timeout for the wedged
    // worker; everything else stops immediately.
    assert!(elapsed >= Duration::from_secs(10), "stopped too fast: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(20), "stopped too slow: {elapsed:?}");
    // The wedged handler never produced a completion callback while the
    // pool was being stopped.
    assert!(rx.try_recv().is_err());

    release.store(true, Ordering::Release);
    tokio::time::sleep(Duration::from_millis(200)).await;
}
