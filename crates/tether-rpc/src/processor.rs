//! The dispatch processor: the mounted service tree plus the worker pools
//! that drive handler execution.
//!
//! The tree is populated before [`Processor::start`] and treated as
//! read-only afterwards; dispatch lookups take the cheap read path.

use std::collections::HashMap;
use std::io;
use std::panic::Location;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tether_wire::Stream;

use crate::error::{RpcError, indent_lines};
use crate::fncache::{CacheFn, FuncCache, write_bundle};
use crate::indicator::Indicator;
use crate::service::{
    ChildDef, EchoDef, Handler, Service, ValueKind, is_valid_echo_name, is_valid_service_name,
};
use crate::thread::ThreadPool;

const ROOT_NAME: &str = "$";
const THREADS_PER_POOL: usize = 16;
const MIN_POOLS: usize = 2;
const MAX_POOLS: usize = 64;

/// Invoked with the finished reply stream and the call's success flag.
pub type ProcessorCallback = Arc<dyn Fn(Stream, bool) + Send + Sync>;

/// A mounted echo: everything dispatch needs for one registered handler.
pub struct EchoNode {
    pub(crate) path: String,
    pub(crate) kinds: Vec<ValueKind>,
    pub(crate) handler: Handler,
    pub(crate) cache_fn: Option<CacheFn>,
    pub(crate) call_string: String,
    pub(crate) debug_string: String,
    pub(crate) signature: String,
    pub(crate) indicator: Indicator,
}

impl EchoNode {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn call_string(&self) -> &str {
        &self.call_string
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn indicator(&self) -> &Indicator {
        &self.indicator
    }
}

struct ServiceNode {
    depth: u64,
    site: String,
}

pub(crate) struct ProcessorShared {
    pub(crate) max_call_depth: u64,
    max_node_depth: u64,
    pub(crate) callback: Option<ProcessorCallback>,
    fn_cache: Option<Arc<dyn FuncCache>>,
    nodes: RwLock<HashMap<String, ServiceNode>>,
    echos: RwLock<HashMap<String, Arc<EchoNode>>>,
}

impl ProcessorShared {
    pub(crate) fn echo_node(&self, path: &str) -> Option<Arc<EchoNode>> {
        self.echos
            .read()
            .expect("echo map poisoned")
            .get(path)
            .cloned()
    }
}

/// The RPC dispatch processor.
pub struct Processor {
    shared: Arc<ProcessorShared>,
    pools: Mutex<Vec<Arc<ThreadPool>>>,
    running: AtomicBool,
}

impl Processor {
    pub fn new(
        max_node_depth: u64,
        max_call_depth: u64,
        callback: Option<ProcessorCallback>,
        fn_cache: Option<Arc<dyn FuncCache>>,
    ) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            ROOT_NAME.to_owned(),
            ServiceNode {
                depth: 0,
                site: String::new(),
            },
        );
        Processor {
            shared: Arc::new(ProcessorShared {
                max_call_depth,
                max_node_depth,
                callback,
                fn_cache,
                nodes: RwLock::new(nodes),
                echos: RwLock::new(HashMap::new()),
            }),
            pools: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Spin up the worker pools.  Must run inside a tokio runtime.
    /// Returns false when already running.
    pub fn start(&self) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            return false;
        }
        let pool_count = pool_count();
        let mut pools = self.pools.lock().expect("pool list poisoned");
        for _ in 0..pool_count {
            pools.push(ThreadPool::new(
                Arc::clone(&self.shared),
                THREADS_PER_POOL,
            ));
        }
        true
    }

    /// Stop every pool, bounded per thread.  Returns false when not
    /// running.
    pub async fn stop(&self) -> bool {
        if !self.running.swap(false, Ordering::SeqCst) {
            return false;
        }
        let pools: Vec<Arc<ThreadPool>> = {
            let mut guard = self.pools.lock().expect("pool list poisoned");
            guard.drain(..).collect()
        };
        for pool in pools {
            pool.stop().await;
        }
        true
    }

    /// Hand an inbound stream to a pseudo-randomly chosen pool.  Blocks
    /// while that pool has no free worker; this is the sole backpressure
    /// mechanism.
    pub async fn put_stream(&self, stream: Stream) -> bool {
        let pool = {
            let pools = self.pools.lock().expect("pool list poisoned");
            if pools.is_empty() {
                return false;
            }
            let idx = rand::random::<u32>() as usize % pools.len();
            Arc::clone(&pools[idx])
        };
        match pool.alloc().await {
            Some(worker) => worker.put(stream).await,
            None => false,
        }
    }

    /// Mount a service tree under the root.  On failure nothing of the
    /// subtree stays mounted.
    #[track_caller]
    pub fn add_service(&self, name: &str, service: Service) -> Result<(), RpcError> {
        let site = Location::caller();
        self.mount_service(
            ROOT_NAME,
            ChildDef {
                name: name.to_owned(),
                service,
                site,
            },
        )
    }

    pub fn echo_node(&self, path: &str) -> Option<Arc<EchoNode>> {
        self.shared.echo_node(path)
    }

    /// All mounted kind signatures, deduplicated and sorted.
    pub fn signatures(&self) -> Vec<String> {
        let echos = self.shared.echos.read().expect("echo map poisoned");
        let mut sigs: Vec<String> = echos.values().map(|e| e.signature.clone()).collect();
        sigs.sort();
        sigs.dedup();
        sigs
    }

    /// Emit a precompiled decoder bundle for every mounted signature.
    pub fn build_cache(&self, path: &Path) -> io::Result<()> {
        write_bundle(path, &self.signatures())
    }

    // -----------------------------------------------------------------------
    // Mounting
    // -----------------------------------------------------------------------

    fn mount_service(&self, parent_path: &str, def: ChildDef) -> Result<(), RpcError> {
        let site = format_site(def.site);
        if !is_valid_service_name(&def.name) {
            return Err(RpcError::with_debug(
                format!("Service name \"{}\" is illegal", def.name),
                site,
            ));
        }

        let service_path = format!("{parent_path}.{}", def.name);
        let parent_depth = {
            let nodes = self.shared.nodes.read().expect("node map poisoned");
            match nodes.get(parent_path) {
                Some(parent) => parent.depth,
                None => {
                    return Err(RpcError::with_debug(
                        "rpc: mount: parent node is missing",
                        site,
                    ));
                }
            }
        };
        if parent_depth + 1 > self.shared.max_node_depth {
            return Err(RpcError::with_debug(
                format!(
                    "Service path depth {service_path} is too long, it must be less or equal than {}",
                    self.shared.max_node_depth
                ),
                site,
            ));
        }

        {
            let mut nodes = self.shared.nodes.write().expect("node map poisoned");
            if let Some(existing) = nodes.get(&service_path) {
                return Err(RpcError::with_debug(
                    format!("Service name \"{}\" is duplicated", def.name),
                    format!(
                        "Current:\n{}\nConflict:\n{}",
                        indent_lines(&site),
                        indent_lines(&existing.site)
                    ),
                ));
            }
            nodes.insert(
                service_path.clone(),
                ServiceNode {
                    depth: parent_depth + 1,
                    site,
                },
            );
        }

        let Service { children, echos } = def.service;
        for echo in echos {
            if let Err(err) = self.mount_echo(&service_path, echo) {
                self.unmount_subtree(&service_path);
                return Err(err);
            }
        }
        for child in children {
            if let Err(err) = self.mount_service(&service_path, child) {
                self.unmount_subtree(&service_path);
                return Err(err);
            }
        }
        Ok(())
    }

    fn mount_echo(&self, service_path: &str, def: EchoDef) -> Result<(), RpcError> {
        let site = format_site(def.site);
        if !is_valid_echo_name(&def.name) {
            return Err(RpcError::with_debug(
                format!("Echo name {} is illegal", def.name),
                site,
            ));
        }

        let echo_path = format!("{service_path}:{}", def.name);
        {
            let echos = self.shared.echos.read().expect("echo map poisoned");
            if let Some(existing) = echos.get(&echo_path) {
                return Err(RpcError::with_debug(
                    format!("Echo name {} is duplicated", def.name),
                    format!(
                        "Current:\n{}\nConflict:\n{}",
                        indent_lines(&site),
                        indent_lines(&existing.site())
                    ),
                ));
            }
        }

        let signature: String = def.kinds.iter().map(|k| k.signature_char()).collect();
        let cache_fn = self
            .shared
            .fn_cache
            .as_ref()
            .and_then(|cache| cache.get(&signature));

        let mut arg_names = vec!["rpc.Context"];
        arg_names.extend(def.kinds.iter().map(|k| k.type_name()));
        let call_string = format!("{echo_path}({}) rpc.Return", arg_names.join(", "));
        let debug_string = format!("{echo_path} {site}");

        tracing::info!(export = def.export, "rpc: mounted {} {}", call_string, site);
        self.shared.echos.write().expect("echo map poisoned").insert(
            echo_path.clone(),
            Arc::new(EchoNode {
                path: echo_path,
                kinds: def.kinds,
                handler: def.handler,
                cache_fn,
                call_string,
                debug_string,
                signature,
                indicator: Indicator::new(),
            }),
        );
        Ok(())
    }

    /// Remove a service node and everything registered beneath it.
    fn unmount_subtree(&self, service_path: &str) {
        let dot_prefix = format!("{service_path}.");
        let colon_prefix = format!("{service_path}:");
        self.shared
            .nodes
            .write()
            .expect("node map poisoned")
            .retain(|path, _| path != service_path && !path.starts_with(&dot_prefix));
        self.shared
            .echos
            .write()
            .expect("echo map poisoned")
            .retain(|path, _| !path.starts_with(&dot_prefix) && !path.starts_with(&colon_prefix));
    }
}

impl EchoNode {
    /// The registration site embedded in the debug string.
    fn site(&self) -> String {
        self.debug_string
            .rsplit(' ')
            .next()
            .unwrap_or_default()
            .to_owned()
    }
}

fn format_site(site: &'static Location<'static>) -> String {
    format!("{}:{}", site.file(), site.line())
}

fn pool_count() -> usize {
    let cpus = std::thread::available_parallelism().map_or(1, |n| n.get());
    (cpus * 2).clamp(MIN_POOLS, MAX_POOLS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_wire::Value;

    fn noop_service() -> Service {
        Service::new().echo("probe", true, &[], |ctx, _| ctx.ok(Value::Nil))
    }

    #[test]
    fn mounts_services_and_echos() {
        let processor = Processor::new(16, 16, None, None);
        let svc = Service::new()
            .echo("sayHello", true, &[ValueKind::String], |ctx, args| {
                let _ = args;
                ctx.ok("hi")
            })
            .add_service("inner", noop_service());
        processor.add_service("user", svc).expect("mount");

        let node = processor.echo_node("$.user:sayHello").expect("echo node");
        assert_eq!(
            node.call_string(),
            "$.user:sayHello(rpc.Context, rpc.String) rpc.Return"
        );
        assert_eq!(node.signature(), "S");
        assert!(processor.echo_node("$.user.inner:probe").is_some());
    }

    #[test]
    fn rejects_illegal_names() {
        let processor = Processor::new(16, 16, None, None);
        let err = processor
            .add_service("user.name", Service::new())
            .expect_err("illegal service name");
        assert_eq!(err.message(), "Service name \"user.name\" is illegal");
        assert!(err.debug().contains("processor.rs"));

        let err = processor
            .add_service(
                "user",
                Service::new().echo("0bad", true, &[], |ctx, _| ctx.ok(true)),
            )
            .expect_err("illegal echo name");
        assert_eq!(err.message(), "Echo name 0bad is illegal");
        // The failed mount must not leave the service behind.
        assert!(
            processor
                .add_service("user", noop_service())
                .is_ok()
        );
    }

    #[test]
    fn duplicate_registrations_quote_both_sites() {
        let processor = Processor::new(16, 16, None, None);
        processor.add_service("user", noop_service()).expect("first");
        let err = processor
            .add_service("user", noop_service())
            .expect_err("duplicate");
        assert_eq!(err.message(), "Service name \"user\" is duplicated");
        assert!(err.debug().starts_with("Current:\n\t"));
        assert!(err.debug().contains("Conflict:\n\t"));

        let dup_echo = Service::new()
            .echo("x", true, &[], |ctx, _| ctx.ok(true))
            .echo("x", true, &[], |ctx, _| ctx.ok(true));
        let err = processor
            .add_service("twice", dup_echo)
            .expect_err("duplicate echo");
        assert_eq!(err.message(), "Echo name x is duplicated");
        assert!(processor.echo_node("$.twice:x").is_none());
    }

    #[test]
    fn enforces_max_node_depth() {
        let processor = Processor::new(2, 16, None, None);
        let deep = Service::new().add_service("b", Service::new().add_service("c", Service::new()));
        let err = processor.add_service("a", deep).expect_err("too deep");
        assert!(
            err.message().starts_with("Service path depth $.a.b.c is too long"),
            "{}",
            err.message()
        );
        // Roll back removed the whole branch.
        assert!(processor.add_service("a", Service::new()).is_ok());
    }

    #[test]
    fn collects_sorted_unique_signatures() {
        let processor = Processor::new(16, 16, None, None);
        let svc = Service::new()
            .echo("a", true, &[ValueKind::String], |ctx, _| ctx.ok(true))
            .echo("b", true, &[ValueKind::String], |ctx, _| ctx.ok(true))
            .echo("c", true, &[ValueKind::Bool, ValueKind::Int64], |ctx, _| ctx.ok(true));
        processor.add_service("user", svc).expect("mount");
        assert_eq!(processor.signatures(), vec!["BI".to_owned(), "S".to_owned()]);
    }
}
