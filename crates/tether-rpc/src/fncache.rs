//! The precompiled decoder cache.
//!
//! Dispatch normally decodes arguments by walking the echo's declared
//! kind list.  A [`FuncCache`] lets a build step supply one decoder per
//! kind-signature string (`"BIS"`, `"S"`, ...) that reads exactly those
//! arguments, verifies the stream drains, and invokes the handler
//! directly.  [`build_bundle_source`] emits such a bundle for every
//! signature mounted on a processor.

use std::io;
use std::path::Path;
use std::sync::Arc;

use tether_wire::{Stream, Value};

use crate::context::Context;
use crate::service::{Handler, ValueKind};

/// A precompiled decoder: reads the signature's arguments from the
/// stream, checks exact drain, and calls the handler.  Returns false when
/// the stream does not match, leaving the mismatch report to the caller.
pub type CacheFn = Arc<dyn Fn(Context, &mut Stream, &Handler) -> bool + Send + Sync>;

/// A pluggable source of precompiled decoders, indexed by signature
/// string.
pub trait FuncCache: Send + Sync {
    fn get(&self, signature: &str) -> Option<CacheFn>;
}

/// Read one argument of the given kind.  Bytes, array and map accept wire
/// nil and yield `Value::Nil`.
pub fn read_kind(stream: &mut Stream, kind: ValueKind) -> Option<Value> {
    match kind {
        ValueKind::Bool => stream.read_bool().map(Value::Bool),
        ValueKind::Int64 => stream.read_int64().map(Value::Int64),
        ValueKind::Uint64 => stream.read_uint64().map(Value::Uint64),
        ValueKind::Float64 => stream.read_float64().map(Value::Float64),
        ValueKind::String => stream.read_string().map(Value::String),
        ValueKind::Bytes => stream.read_bytes(),
        ValueKind::Array => stream.read_array(),
        ValueKind::Map => stream.read_map(),
    }
}

// ---------------------------------------------------------------------------
// Bundle generation
// ---------------------------------------------------------------------------

fn decoder_name(signature: &str) -> String {
    if signature.is_empty() {
        "fc_void".to_owned()
    } else {
        format!("fc_{}", signature.to_lowercase())
    }
}

fn push_decoder(out: &mut String, signature: &str) {
    let name = decoder_name(signature);
    out.push_str(&format!(
        "\nfn {name}(ctx: Context, stream: &mut Stream, handler: &Handler) -> bool {{\n"
    ));
    let mut call_args: Vec<String> = Vec::new();
    for (idx, c) in signature.chars().enumerate() {
        let var = format!("v{idx}");
        let (reader, wrapped) = match c {
            'B' => ("read_bool", format!("Value::Bool({var})")),
            'I' => ("read_int64", format!("Value::Int64({var})")),
            'U' => ("read_uint64", format!("Value::Uint64({var})")),
            'F' => ("read_float64", format!("Value::Float64({var})")),
            'S' => ("read_string", format!("Value::String({var})")),
            'X' => ("read_bytes", var.clone()),
            'A' => ("read_array", var.clone()),
            'M' => ("read_map", var.clone()),
            _ => continue,
        };
        out.push_str(&format!(
            "    let Some({var}) = stream.{reader}() else {{\n        return false;\n    }};\n"
        ));
        call_args.push(wrapped);
    }
    out.push_str("    if stream.can_read() {\n        return false;\n    }\n");
    out.push_str(&format!("    handler(ctx, &[{}]);\n", call_args.join(", ")));
    out.push_str("    true\n}\n");
}

/// Emit the Rust source of a decoder bundle covering `signatures`.
pub fn build_bundle_source(signatures: &[String]) -> String {
    let mut out = String::new();
    out.push_str("//! Precompiled argument decoders. Generated; do not edit.\n\n");
    out.push_str("use std::sync::Arc;\n\n");
    out.push_str("use tether_rpc::{CacheFn, Context, FuncCache, Handler};\n");
    out.push_str("use tether_wire::{Stream, Value};\n\n");
    out.push_str("pub struct GeneratedCache;\n\n");
    out.push_str("impl FuncCache for GeneratedCache {\n");
    out.push_str("    fn get(&self, signature: &str) -> Option<CacheFn> {\n");
    out.push_str("        match signature {\n");
    for sig in signatures {
        out.push_str(&format!(
            "            {:?} => Some(Arc::new({})),\n",
            sig,
            decoder_name(sig)
        ));
    }
    out.push_str("            _ => None,\n        }\n    }\n}\n");
    for sig in signatures {
        push_decoder(&mut out, sig);
    }
    out
}

/// Write the bundle to `path`, creating parent directories.
pub fn write_bundle(path: &Path, signatures: &[String]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, build_bundle_source(signatures))
}
