// tether-wire: the segmented binary stream format all tether endpoints
// speak.
//
// A `Stream` is an ordered sequence of 512-byte frames with independent
// read and write cursors.  Every value on the wire starts with a single
// tag byte; composites additionally carry a total-byte-length so a reader
// can skip them structurally without decoding.  All multi-byte integers
// are little-endian.
//
// Streams are pooled process-wide (`Stream::take` / `Stream::recycle`);
// `reset` truncates back to a single frame and hands the surplus frames
// to a separate frame pool.

mod stream;
mod value;

pub use stream::{FRAME_LEN, HEADER_LEN, Stream, WriteResult};
pub use value::Value;
