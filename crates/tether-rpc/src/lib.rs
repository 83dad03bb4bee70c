// tether-rpc: the dispatch runtime — service tree, worker pools, handler
// context, and the precompiled decoder cache.
//
// A `Processor` owns the mounted service tree and a set of worker pools.
// `put_stream` routes one inbound envelope to a pseudo-randomly chosen
// pool, blocks until that pool has a free worker, and the worker decodes
// the target path, call depth, caller identity and arguments before
// invoking the registered handler.  The reply travels back through the
// processor's completion callback.

pub mod clock;
mod context;
mod error;
mod fncache;
mod indicator;
mod processor;
mod service;
mod thread;

pub use context::{Context, Return};
pub use error::RpcError;
pub use fncache::{CacheFn, FuncCache, build_bundle_source, read_kind, write_bundle};
pub use indicator::Indicator;
pub use processor::{EchoNode, Processor, ProcessorCallback};
pub use service::{Handler, Service, ValueKind, value_type_name};
