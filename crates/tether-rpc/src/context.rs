//! The handler context and the reply slot behind it.
//!
//! A context is the sole legitimate way to produce a reply: [`Context::ok`]
//! and the error operations write into the executing worker's outbound
//! stream.  The worker detaches the slot when the call completes; a context
//! kept alive past that point short-circuits every operation.

use std::sync::{Arc, Mutex, MutexGuard};

use tether_wire::{Stream, Value};

use crate::error::{RpcError, capture_stack};

/// Reply bodies start right after the reserved header.
pub(crate) const REPLY_START: usize = 17;

/// The sentinel all handlers return.  Only constructible through a
/// context operation.
pub struct Return(pub(crate) ());

/// Shared state between a worker and the contexts it hands out.
pub(crate) struct ReplySlot {
    state: Mutex<SlotState>,
}

struct SlotState {
    /// The outbound stream; `None` once the worker detached.
    stream: Option<Stream>,
    replied: bool,
    success: bool,
    echo_debug: String,
}

impl ReplySlot {
    pub(crate) fn new(stream: Stream) -> Arc<Self> {
        Arc::new(ReplySlot {
            state: Mutex::new(SlotState {
                stream: Some(stream),
                replied: false,
                success: false,
                echo_debug: String::new(),
            }),
        })
    }

    /// Record the echo's registration-site string for error folding.
    pub(crate) fn set_echo_debug(&self, debug: &str) {
        self.lock().echo_debug = debug.to_owned();
    }

    /// Take the stream back and close the slot.  Later context operations
    /// become no-ops.
    pub(crate) fn detach(&self) -> (Stream, bool) {
        let mut st = self.lock();
        let stream = st.stream.take().expect("reply stream already detached");
        (stream, st.success)
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().expect("reply slot poisoned")
    }
}

/// The first argument to every handler.
#[derive(Clone)]
pub struct Context {
    slot: Arc<ReplySlot>,
}

impl Context {
    pub(crate) fn from_slot(slot: Arc<ReplySlot>) -> Self {
        Context { slot }
    }

    /// Reply with a success envelope carrying `value`.  A value the codec
    /// cannot serialize degrades to an in-band `"return type is error"`.
    pub fn ok(&self, value: impl Into<Value>) -> Return {
        let value = value.into();
        {
            let mut st = self.slot.lock();
            if st.replied {
                return Return(());
            }
            let Some(stream) = st.stream.as_mut() else {
                return Return(());
            };
            stream.set_write_pos(REPLY_START);
            stream.write_bool(true);
            if stream.write_value(&value).is_ok() {
                st.replied = true;
                st.success = true;
                return Return(());
            }
        }
        self.write_reply_error("return type is error", &capture_stack(), true)
    }

    /// Reply with an error envelope.  The echo's registration site is
    /// appended to the error's debug text.
    pub fn error(&self, err: RpcError) -> Return {
        let mut err = err;
        {
            let st = self.slot.lock();
            if !st.echo_debug.is_empty() {
                err.add_debug(&st.echo_debug);
            }
        }
        self.write_reply_error(err.message(), err.debug(), false)
    }

    /// Reply with an error built from a message, capturing the call stack
    /// as its debug text.
    pub fn errorf(&self, message: impl Into<String>) -> Return {
        self.error(RpcError::with_debug(message, capture_stack()))
    }

    /// Write an error envelope.  `forced` bypasses the write-once guard;
    /// the dispatcher uses it so a panic report can supersede whatever a
    /// handler wrote before dying.
    pub(crate) fn write_reply_error(&self, message: &str, debug: &str, forced: bool) -> Return {
        let mut st = self.slot.lock();
        if !forced && st.replied {
            return Return(());
        }
        if let Some(stream) = st.stream.as_mut() {
            let debug_text = debug;
            tracing::error!("{}", RpcError::with_debug(message, debug_text));
            stream.set_write_pos(REPLY_START);
            stream.write_bool(false);
            stream.write_str(message);
            stream.write_str(debug);
            st.replied = true;
            st.success = false;
        }
        Return(())
    }

    pub(crate) fn set_echo_debug(&self, debug: &str) {
        self.slot.set_echo_debug(debug);
    }
}
