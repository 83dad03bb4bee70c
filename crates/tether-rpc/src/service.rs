//! Service definitions: the builder users assemble before mounting, and
//! the argument-kind vocabulary handlers are declared with.

use std::panic::Location;
use std::sync::Arc;

use tether_wire::Value;

use crate::context::{Context, Return};

/// The eight permitted argument kinds, one wire char each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Bool,
    Int64,
    Uint64,
    Float64,
    String,
    Bytes,
    Array,
    Map,
}

impl ValueKind {
    /// The one-character signature code used to index the func cache.
    pub fn signature_char(self) -> char {
        match self {
            ValueKind::Bool => 'B',
            ValueKind::Int64 => 'I',
            ValueKind::Uint64 => 'U',
            ValueKind::Float64 => 'F',
            ValueKind::String => 'S',
            ValueKind::Bytes => 'X',
            ValueKind::Array => 'A',
            ValueKind::Map => 'M',
        }
    }

    pub fn from_signature_char(c: char) -> Option<Self> {
        Some(match c {
            'B' => ValueKind::Bool,
            'I' => ValueKind::Int64,
            'U' => ValueKind::Uint64,
            'F' => ValueKind::Float64,
            'S' => ValueKind::String,
            'X' => ValueKind::Bytes,
            'A' => ValueKind::Array,
            'M' => ValueKind::Map,
            _ => return None,
        })
    }

    /// The printable type name used in call signatures and mismatch
    /// reports.
    pub fn type_name(self) -> &'static str {
        match self {
            ValueKind::Bool => "rpc.Bool",
            ValueKind::Int64 => "rpc.Int64",
            ValueKind::Uint64 => "rpc.Uint64",
            ValueKind::Float64 => "rpc.Float64",
            ValueKind::String => "rpc.String",
            ValueKind::Bytes => "rpc.Bytes",
            ValueKind::Array => "rpc.Array",
            ValueKind::Map => "rpc.Map",
        }
    }
}

/// The printable type name of a decoded value ("<nil>" for wire nil).
pub fn value_type_name(v: &Value) -> &'static str {
    match v {
        Value::Nil => "<nil>",
        Value::Bool(_) => "rpc.Bool",
        Value::Int64(_) => "rpc.Int64",
        Value::Uint64(_) => "rpc.Uint64",
        Value::Float64(_) => "rpc.Float64",
        Value::String(_) => "rpc.String",
        Value::Bytes(_) => "rpc.Bytes",
        Value::Array(_) => "rpc.Array",
        Value::Map(_) => "rpc.Map",
    }
}

/// An echo handler.  The context is the sole path to produce a reply; the
/// argument slice holds exactly the declared kinds, already decoded.
pub type Handler = Arc<dyn Fn(Context, &[Value]) -> Return + Send + Sync>;

pub(crate) struct EchoDef {
    pub name: String,
    pub export: bool,
    pub kinds: Vec<ValueKind>,
    pub handler: Handler,
    pub site: &'static Location<'static>,
}

pub(crate) struct ChildDef {
    pub name: String,
    pub service: Service,
    pub site: &'static Location<'static>,
}

/// A buildable namespace of echoes and child services.  Nothing is
/// validated here; validation happens when the tree is mounted on a
/// processor.
#[derive(Default)]
pub struct Service {
    pub(crate) children: Vec<ChildDef>,
    pub(crate) echos: Vec<EchoDef>,
}

impl Service {
    pub fn new() -> Self {
        Service::default()
    }

    /// Attach a child service under `name`.
    #[track_caller]
    pub fn add_service(mut self, name: &str, service: Service) -> Self {
        self.children.push(ChildDef {
            name: name.to_owned(),
            service,
            site: Location::caller(),
        });
        self
    }

    /// Register an echo.  `kinds` lists the wire arguments after the
    /// implicit context parameter.
    #[track_caller]
    pub fn echo<F>(mut self, name: &str, export: bool, kinds: &[ValueKind], handler: F) -> Self
    where
        F: Fn(Context, &[Value]) -> Return + Send + Sync + 'static,
    {
        self.echos.push(EchoDef {
            name: name.to_owned(),
            export,
            kinds: kinds.to_vec(),
            handler: Arc::new(handler),
            site: Location::caller(),
        });
        self
    }
}

/// Service names: `^[_0-9a-zA-Z]+$`.
pub(crate) fn is_valid_service_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c == '_' || c.is_ascii_alphanumeric())
}

/// Echo names: `^[_a-zA-Z][_0-9a-zA-Z]*$`.
pub(crate) fn is_valid_echo_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}
