//! Segmented stream buffer and the tag-byte codec.
//!
//! # Layout
//! A stream owns an ordered sequence of 512-byte frames.  Byte 0 of frame 0
//! is the stream-valid marker (always 1); bytes 1..17 are the 16-byte
//! header, exposed through typed accessors.  Both cursors start at
//! offset 17 and are encoded as `seg * 512 + idx`.
//!
//! # Tag bytes
//! Every value begins with one tag byte.  Composites (array, map, long
//! string, long bytes) carry a u32 total-byte-length that includes the tag
//! and the length prefix itself, so a reader can skip a value structurally
//! with [`Stream::peek_skip`] and never decode it.
//!
//! # Failure discipline
//! Reads return `None` on malformed data and restore the read cursor to
//! where the value began.  Composite writes that fail part-way rewind the
//! write cursor to before the composite tag.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::value::Value;

/// Fixed frame length in bytes.
pub const FRAME_LEN: usize = 512;
/// Length of the accessible header (bytes 1..17 of frame 0).
pub const HEADER_LEN: usize = 16;

/// First body offset: marker byte plus the 16-byte header.
const BODY_START: usize = 17;
const SEG_SHIFT: usize = 9;
const SEG_MASK: usize = 0x1FF;

const SKIP_INVALID: i16 = -64;

/// Outcome of a generic value write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteResult {
    Ok,
    UnsupportedType,
}

impl WriteResult {
    pub fn is_ok(self) -> bool {
        self == WriteResult::Ok
    }
}

// ---------------------------------------------------------------------------
// Skip table
// ---------------------------------------------------------------------------

/// Bytes to advance past a value, indexed by its tag byte.
///
/// `SKIP_INVALID` marks tags that never start a value.  `-6` / `-5` mark
/// long string / long bytes, whose skip is the embedded u32 length minus
/// the sentinel.  `0` marks arrays and maps, whose skip is the embedded
/// total length itself.
static READ_SKIP_TABLE: [i16; 256] = build_read_skip_table();

const fn build_read_skip_table() -> [i16; 256] {
    let mut table = [0i16; 256];
    let mut op = 0usize;
    while op < 256 {
        table[op] = match op {
            0 | 12 | 13 => SKIP_INVALID,
            1..=4 => 1,
            5 | 8 | 11 => 9,
            6 | 9 => 3,
            7 | 10 => 5,
            64 | 96 | 128 | 192 => 1,
            191 => -6,
            255 => -5,
            _ => match op >> 6 {
                0 => 1,
                1 => 0,
                2 => op as i16 - 126,
                _ => op as i16 - 191,
            },
        };
        op += 1;
    }
    table
}

// ---------------------------------------------------------------------------
// Frame and stream pools
// ---------------------------------------------------------------------------

type Frame = Box<[u8; FRAME_LEN]>;

const FRAME_POOL_CAP: usize = 4096;
const STREAM_POOL_CAP: usize = 256;

static FRAME_POOL: Mutex<Vec<Frame>> = Mutex::new(Vec::new());
static STREAM_POOL: Mutex<Vec<Stream>> = Mutex::new(Vec::new());

fn take_frame() -> Frame {
    FRAME_POOL
        .lock()
        .expect("frame pool poisoned")
        .pop()
        .unwrap_or_else(|| Box::new([0u8; FRAME_LEN]))
}

fn recycle_frame(frame: Frame) {
    let mut pool = FRAME_POOL.lock().expect("frame pool poisoned");
    if pool.len() < FRAME_POOL_CAP {
        pool.push(frame);
    }
}

// ---------------------------------------------------------------------------
// Little-endian helpers
// ---------------------------------------------------------------------------

fn u16_le(b: &[u8]) -> u16 {
    u16::from(b[0]) | u16::from(b[1]) << 8
}

fn u32_le(b: &[u8]) -> u32 {
    u32::from(b[0]) | u32::from(b[1]) << 8 | u32::from(b[2]) << 16 | u32::from(b[3]) << 24
}

fn u64_le(b: &[u8]) -> u64 {
    u64::from(u32_le(&b[0..4])) | u64::from(u32_le(&b[4..8])) << 32
}

// ---------------------------------------------------------------------------
// Stream
// ---------------------------------------------------------------------------

/// A pooled, segmented byte stream carrying one RPC envelope.
pub struct Stream {
    frames: Vec<Frame>,
    read_seg: usize,
    read_idx: usize,
    write_seg: usize,
    write_idx: usize,
}

impl Stream {
    fn new() -> Self {
        let mut frame = take_frame();
        frame[..BODY_START].fill(0);
        frame[0] = 1;
        Stream {
            frames: vec![frame],
            read_seg: 0,
            read_idx: BODY_START,
            write_seg: 0,
            write_idx: BODY_START,
        }
    }

    /// Acquire a reset stream from the process-wide pool.
    pub fn take() -> Stream {
        STREAM_POOL
            .lock()
            .expect("stream pool poisoned")
            .pop()
            .unwrap_or_else(Stream::new)
    }

    /// Acquire a stream pre-loaded with raw wire bytes (marker and header
    /// included).  The read cursor stays at the first body byte.
    pub fn from_wire(data: &[u8]) -> Stream {
        let mut stream = Stream::take();
        stream.set_write_pos(0);
        stream.append_raw(data);
        stream
    }

    /// Reset and return the stream to the pool.
    pub fn recycle(mut self) {
        self.reset();
        let mut pool = STREAM_POOL.lock().expect("stream pool poisoned");
        if pool.len() < STREAM_POOL_CAP {
            pool.push(self);
        }
    }

    /// Truncate back to a single frame, zero the header, and move both
    /// cursors to the first body byte.  Frames 1..N go back to the frame
    /// pool; frame 0 never does.
    pub fn reset(&mut self) {
        for frame in self.frames.drain(1..) {
            recycle_frame(frame);
        }
        if self.frames.capacity() > 8 {
            self.frames.shrink_to(8);
        }
        let frame = &mut self.frames[0];
        frame[..BODY_START].fill(0);
        frame[0] = 1;
        self.read_seg = 0;
        self.read_idx = BODY_START;
        self.write_seg = 0;
        self.write_idx = BODY_START;
    }

    // -----------------------------------------------------------------------
    // Header accessors
    //
    // Bytes 4..8 of the header are read as the client conn id on replies and
    // as the client sequence on calls; the on-wire layout is identical.
    // -----------------------------------------------------------------------

    pub fn server_callback_id(&self) -> u64 {
        u64_le(&self.frames[0][1..9])
    }

    pub fn set_server_callback_id(&mut self, v: u64) {
        self.frames[0][1..9].copy_from_slice(&v.to_le_bytes());
    }

    pub fn client_callback_id(&self) -> u32 {
        u32_le(&self.frames[0][1..5])
    }

    pub fn set_client_callback_id(&mut self, v: u32) {
        self.frames[0][1..5].copy_from_slice(&v.to_le_bytes());
    }

    pub fn client_conn_id(&self) -> u32 {
        u32_le(&self.frames[0][5..9])
    }

    pub fn set_client_conn_id(&mut self, v: u32) {
        self.frames[0][5..9].copy_from_slice(&v.to_le_bytes());
    }

    pub fn client_sequence(&self) -> u32 {
        u32_le(&self.frames[0][5..9])
    }

    pub fn set_client_sequence(&mut self, v: u32) {
        self.frames[0][5..9].copy_from_slice(&v.to_le_bytes());
    }

    pub fn machine_id(&self) -> u32 {
        u32_le(&self.frames[0][9..13])
    }

    pub fn set_machine_id(&mut self, v: u32) {
        self.frames[0][9..13].copy_from_slice(&v.to_le_bytes());
    }

    pub fn router_id(&self) -> u32 {
        u32_le(&self.frames[0][13..17])
    }

    pub fn set_router_id(&mut self, v: u32) {
        self.frames[0][13..17].copy_from_slice(&v.to_le_bytes());
    }

    /// Copy the 16 header bytes from another stream.
    pub fn copy_header_from(&mut self, other: &Stream) {
        let (dst, src) = (&mut self.frames[0], &other.frames[0]);
        dst[1..BODY_START].copy_from_slice(&src[1..BODY_START]);
    }

    // -----------------------------------------------------------------------
    // Cursors
    // -----------------------------------------------------------------------

    pub fn read_pos(&self) -> usize {
        (self.read_seg << SEG_SHIFT) | self.read_idx
    }

    pub fn write_pos(&self) -> usize {
        (self.write_seg << SEG_SHIFT) | self.write_idx
    }

    /// Move the read cursor.  Fails (and leaves the cursor alone) when the
    /// target lies past the write cursor.
    pub fn set_read_pos(&mut self, pos: usize) -> bool {
        let seg = pos >> SEG_SHIFT;
        let idx = pos & SEG_MASK;
        if seg < self.write_seg || (seg == self.write_seg && idx <= self.write_idx) {
            self.read_seg = seg;
            self.read_idx = idx;
            true
        } else {
            false
        }
    }

    fn set_read_pos_unchecked(&mut self, pos: usize) {
        self.read_seg = pos >> SEG_SHIFT;
        self.read_idx = pos & SEG_MASK;
    }

    /// Move the write cursor, allocating frames from the pool as needed.
    /// Moving backwards does not release frames.
    pub fn set_write_pos(&mut self, pos: usize) {
        let need = (pos >> SEG_SHIFT) + 1;
        while self.frames.len() < need {
            self.frames.push(take_frame());
        }
        self.write_seg = pos >> SEG_SHIFT;
        self.write_idx = pos & SEG_MASK;
    }

    /// True while the read cursor is strictly behind the write cursor.
    pub fn can_read(&self) -> bool {
        self.read_idx < self.write_idx || self.read_seg < self.write_seg
    }

    fn has_n_bytes(&self, n: usize) -> bool {
        self.read_pos() + n <= self.write_pos()
    }

    fn remaining(&self) -> usize {
        self.write_pos() - self.read_pos()
    }

    /// The whole encoded value of `n` bytes sits inside the current read
    /// frame, before the write cursor.
    fn in_frame(&self, n: usize) -> bool {
        let end = self.read_idx + n;
        end < FRAME_LEN && (end <= self.write_idx || self.read_seg < self.write_seg)
    }

    fn peek_byte(&self) -> u8 {
        self.frames[self.read_seg][self.read_idx]
    }

    fn advance_read_byte(&mut self) {
        self.read_idx += 1;
        if self.read_idx == FRAME_LEN {
            self.read_seg += 1;
            self.read_idx = 0;
        }
    }

    fn next_write_frame(&mut self) {
        self.write_seg += 1;
        self.write_idx = 0;
        if self.write_seg == self.frames.len() {
            self.frames.push(take_frame());
        }
    }

    fn put_byte(&mut self, v: u8) {
        self.frames[self.write_seg][self.write_idx] = v;
        self.write_idx += 1;
        if self.write_idx == FRAME_LEN {
            self.next_write_frame();
        }
    }

    /// Append raw bytes at the write cursor, crossing frames as needed.
    pub fn append_raw(&mut self, mut v: &[u8]) {
        if self.write_idx + v.len() < FRAME_LEN {
            self.frames[self.write_seg][self.write_idx..self.write_idx + v.len()]
                .copy_from_slice(v);
            self.write_idx += v.len();
            return;
        }
        while !v.is_empty() {
            let room = FRAME_LEN - self.write_idx;
            let n = room.min(v.len());
            self.frames[self.write_seg][self.write_idx..self.write_idx + n]
                .copy_from_slice(&v[..n]);
            self.write_idx += n;
            v = &v[n..];
            if self.write_idx == FRAME_LEN {
                self.next_write_frame();
            }
        }
    }

    /// Advancing fixed-size read with an in-frame fast path.  Returns
    /// `None` (cursor untouched) when fewer than `N` bytes remain.
    fn read_chunk<const N: usize>(&mut self) -> Option<[u8; N]> {
        let mut out = [0u8; N];
        if self.in_frame(N) {
            out.copy_from_slice(&self.frames[self.read_seg][self.read_idx..self.read_idx + N]);
            self.read_idx += N;
            return Some(out);
        }
        if !self.has_n_bytes(N) {
            return None;
        }
        let mut got = 0;
        while got < N {
            let avail = FRAME_LEN - self.read_idx;
            let n = avail.min(N - got);
            out[got..got + n]
                .copy_from_slice(&self.frames[self.read_seg][self.read_idx..self.read_idx + n]);
            got += n;
            self.read_idx += n;
            if self.read_idx == FRAME_LEN {
                self.read_seg += 1;
                self.read_idx = 0;
            }
        }
        Some(out)
    }

    /// Non-advancing 5-byte peek (tag plus embedded u32 length).
    fn peek_chunk5(&self) -> Option<[u8; 5]> {
        let mut out = [0u8; 5];
        if self.in_frame(5) {
            out.copy_from_slice(&self.frames[self.read_seg][self.read_idx..self.read_idx + 5]);
            return Some(out);
        }
        if !self.has_n_bytes(5) {
            return None;
        }
        let mut seg = self.read_seg;
        let mut idx = self.read_idx;
        let mut got = 0;
        while got < 5 {
            let avail = FRAME_LEN - idx;
            let n = avail.min(5 - got);
            out[got..got + n].copy_from_slice(&self.frames[seg][idx..idx + n]);
            got += n;
            idx += n;
            if idx == FRAME_LEN {
                seg += 1;
                idx = 0;
            }
        }
        Some(out)
    }

    /// Advancing variable-size read.  The caller must have checked
    /// availability.
    fn read_exact_vec(&mut self, n: usize) -> Vec<u8> {
        let mut out = vec![0u8; n];
        if self.in_frame(n) {
            out.copy_from_slice(&self.frames[self.read_seg][self.read_idx..self.read_idx + n]);
            self.read_idx += n;
            return out;
        }
        let mut got = 0;
        while got < n {
            let avail = FRAME_LEN - self.read_idx;
            let take = avail.min(n - got);
            out[got..got + take]
                .copy_from_slice(&self.frames[self.read_seg][self.read_idx..self.read_idx + take]);
            got += take;
            self.read_idx += take;
            if self.read_idx == FRAME_LEN {
                self.read_seg += 1;
                self.read_idx = 0;
            }
        }
        out
    }

    // -----------------------------------------------------------------------
    // Structural skip
    // -----------------------------------------------------------------------

    /// Byte count of the value at the read cursor, or 0 when the tag is
    /// invalid or the stream is exhausted.  The cursor does not move.
    pub fn peek_skip(&self) -> usize {
        if !self.can_read() {
            return 0;
        }
        let skip = READ_SKIP_TABLE[usize::from(self.peek_byte())];
        if skip > 0 {
            return skip as usize;
        }
        if skip == SKIP_INVALID {
            return 0;
        }
        match self.peek_chunk5() {
            Some(b) => (i64::from(u32_le(&b[1..5])) - i64::from(skip)) as usize,
            None => 0,
        }
    }

    // -----------------------------------------------------------------------
    // Writers
    // -----------------------------------------------------------------------

    pub fn write_nil(&mut self) {
        self.put_byte(1);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.put_byte(if v { 2 } else { 3 });
    }

    pub fn write_float64(&mut self, v: f64) {
        if v == 0.0 {
            self.put_byte(4);
        } else {
            let mut b = [0u8; 9];
            b[0] = 5;
            b[1..9].copy_from_slice(&v.to_bits().to_le_bytes());
            self.append_raw(&b);
        }
    }

    pub fn write_int64(&mut self, v: i64) {
        if v > -8 && v < 33 {
            self.put_byte((v + 21) as u8);
        } else if (-32768..32768).contains(&v) {
            let mut b = [0u8; 3];
            b[0] = 6;
            b[1..3].copy_from_slice(&((v + 32768) as u16).to_le_bytes());
            self.append_raw(&b);
        } else if (-2_147_483_648..2_147_483_648).contains(&v) {
            let mut b = [0u8; 5];
            b[0] = 7;
            b[1..5].copy_from_slice(&((v + 2_147_483_648) as u32).to_le_bytes());
            self.append_raw(&b);
        } else {
            let mut b = [0u8; 9];
            b[0] = 8;
            b[1..9].copy_from_slice(&(v as u64).wrapping_add(1 << 63).to_le_bytes());
            self.append_raw(&b);
        }
    }

    pub fn write_uint64(&mut self, v: u64) {
        if v < 10 {
            self.put_byte((v + 54) as u8);
        } else if v < 65536 {
            let mut b = [0u8; 3];
            b[0] = 9;
            b[1..3].copy_from_slice(&(v as u16).to_le_bytes());
            self.append_raw(&b);
        } else if v < 4_294_967_296 {
            let mut b = [0u8; 5];
            b[0] = 10;
            b[1..5].copy_from_slice(&(v as u32).to_le_bytes());
            self.append_raw(&b);
        } else {
            let mut b = [0u8; 9];
            b[0] = 11;
            b[1..9].copy_from_slice(&v.to_le_bytes());
            self.append_raw(&b);
        }
    }

    /// Write a string: tag, body, trailing NUL.  Strings of 63 bytes or
    /// more use the length-prefixed long form.
    pub fn write_str(&mut self, v: &str) {
        let len = v.len();
        if len == 0 {
            self.put_byte(128);
        } else if len < 63 {
            self.put_byte(128 + len as u8);
            self.append_raw(v.as_bytes());
            self.put_byte(0);
        } else {
            let mut head = [0u8; 5];
            head[0] = 191;
            head[1..5].copy_from_slice(&(len as u32).to_le_bytes());
            self.append_raw(&head);
            self.append_raw(v.as_bytes());
            self.put_byte(0);
        }
    }

    pub fn write_bytes(&mut self, v: &[u8]) {
        let len = v.len();
        if len == 0 {
            self.put_byte(192);
        } else if len < 63 {
            self.put_byte(192 + len as u8);
            self.append_raw(v);
        } else {
            let mut head = [0u8; 5];
            head[0] = 255;
            head[1..5].copy_from_slice(&(len as u32).to_le_bytes());
            self.append_raw(&head);
            self.append_raw(v);
        }
    }

    /// Patch a composite head (tag plus u32 total length) written after the
    /// body, then restore the write cursor.
    fn patch_head(&mut self, pos: usize, tag: u8, total: u32) {
        let end = self.write_pos();
        self.set_write_pos(pos);
        self.put_byte(tag);
        self.append_raw(&total.to_le_bytes());
        self.set_write_pos(end);
    }

    pub fn write_array(&mut self, items: &[Value]) -> WriteResult {
        if items.is_empty() {
            self.put_byte(64);
            return WriteResult::Ok;
        }
        let start_pos = self.write_pos();
        self.set_write_pos(start_pos + 5);
        if items.len() > 30 {
            self.append_raw(&(items.len() as u32).to_le_bytes());
        }
        for item in items {
            if !self.write_value(item).is_ok() {
                self.set_write_pos(start_pos);
                return WriteResult::UnsupportedType;
            }
        }
        let total = (self.write_pos() - start_pos) as u32;
        let tag = if items.len() < 31 { 64 + items.len() as u8 } else { 95 };
        self.patch_head(start_pos, tag, total);
        WriteResult::Ok
    }

    pub fn write_map(&mut self, entries: &HashMap<String, Value>) -> WriteResult {
        if entries.is_empty() {
            self.put_byte(96);
            return WriteResult::Ok;
        }
        let start_pos = self.write_pos();
        self.set_write_pos(start_pos + 5);
        if entries.len() > 30 {
            self.append_raw(&(entries.len() as u32).to_le_bytes());
        }
        for (key, value) in entries {
            self.write_str(key);
            if !self.write_value(value).is_ok() {
                self.set_write_pos(start_pos);
                return WriteResult::UnsupportedType;
            }
        }
        let total = (self.write_pos() - start_pos) as u32;
        let tag = if entries.len() < 31 { 96 + entries.len() as u8 } else { 127 };
        self.patch_head(start_pos, tag, total);
        WriteResult::Ok
    }

    /// Generic write dispatching on the value kind.
    pub fn write_value(&mut self, v: &Value) -> WriteResult {
        match v {
            Value::Nil => self.write_nil(),
            Value::Bool(b) => self.write_bool(*b),
            Value::Int64(i) => self.write_int64(*i),
            Value::Uint64(u) => self.write_uint64(*u),
            Value::Float64(f) => self.write_float64(*f),
            Value::String(s) => self.write_str(s),
            Value::Bytes(b) => self.write_bytes(b),
            Value::Array(items) => return self.write_array(items),
            Value::Map(entries) => return self.write_map(entries),
        }
        WriteResult::Ok
    }

    // -----------------------------------------------------------------------
    // Readers
    // -----------------------------------------------------------------------

    pub fn read_nil(&mut self) -> bool {
        if self.can_read() && self.peek_byte() == 1 {
            self.advance_read_byte();
            return true;
        }
        false
    }

    pub fn read_bool(&mut self) -> Option<bool> {
        if !self.can_read() {
            return None;
        }
        match self.peek_byte() {
            2 => {
                self.advance_read_byte();
                Some(true)
            }
            3 => {
                self.advance_read_byte();
                Some(false)
            }
            _ => None,
        }
    }

    pub fn read_float64(&mut self) -> Option<f64> {
        if !self.can_read() {
            return None;
        }
        match self.peek_byte() {
            4 => {
                self.advance_read_byte();
                Some(0.0)
            }
            5 => self
                .read_chunk::<9>()
                .map(|b| f64::from_bits(u64_le(&b[1..9]))),
            _ => None,
        }
    }

    pub fn read_int64(&mut self) -> Option<i64> {
        if !self.can_read() {
            return None;
        }
        let tag = self.peek_byte();
        match tag {
            14..=53 => {
                self.advance_read_byte();
                Some(i64::from(tag) - 21)
            }
            6 => self
                .read_chunk::<3>()
                .map(|b| i64::from(u16_le(&b[1..3])) - 32768),
            7 => self
                .read_chunk::<5>()
                .map(|b| i64::from(u32_le(&b[1..5])) - 2_147_483_648),
            8 => self
                .read_chunk::<9>()
                .map(|b| u64_le(&b[1..9]).wrapping_sub(1 << 63) as i64),
            _ => None,
        }
    }

    pub fn read_uint64(&mut self) -> Option<u64> {
        if !self.can_read() {
            return None;
        }
        let tag = self.peek_byte();
        match tag {
            54..=63 => {
                self.advance_read_byte();
                Some(u64::from(tag) - 54)
            }
            9 => self.read_chunk::<3>().map(|b| u64::from(u16_le(&b[1..3]))),
            10 => self.read_chunk::<5>().map(|b| u64::from(u32_le(&b[1..5]))),
            11 => self.read_chunk::<9>().map(|b| u64_le(&b[1..9])),
            _ => None,
        }
    }

    /// Zero-copy string read: borrows the frame when the whole value sits
    /// inside the current frame, otherwise copies.  The view lives until
    /// the next use of the stream.
    pub fn read_str_fast(&mut self) -> Option<Cow<'_, str>> {
        if !self.can_read() {
            return None;
        }
        let tag = self.peek_byte();
        if tag == 128 {
            self.advance_read_byte();
            return Some(Cow::Borrowed(""));
        }
        if (129..=190).contains(&tag) {
            let len = usize::from(tag - 128);
            if self.in_frame(len + 2) {
                let seg = self.read_seg;
                let start = self.read_idx + 1;
                if self.frames[seg][start + len] != 0
                    || std::str::from_utf8(&self.frames[seg][start..start + len]).is_err()
                {
                    return None;
                }
                self.read_idx += len + 2;
                return std::str::from_utf8(&self.frames[seg][start..start + len])
                    .ok()
                    .map(Cow::Borrowed);
            }
            if self.has_n_bytes(len + 2) {
                let start_pos = self.read_pos();
                self.advance_read_byte();
                let body = self.read_exact_vec(len);
                if self.peek_byte() == 0 {
                    if let Ok(s) = String::from_utf8(body) {
                        self.advance_read_byte();
                        return Some(Cow::Owned(s));
                    }
                }
                self.set_read_pos_unchecked(start_pos);
            }
            return None;
        }
        if tag == 191 {
            let start_pos = self.read_pos();
            let head = self.read_chunk::<5>()?;
            let len = u32_le(&head[1..5]) as usize;
            if len > 62 {
                if self.in_frame(len + 1) {
                    let seg = self.read_seg;
                    let start = self.read_idx;
                    if self.frames[seg][start + len] == 0
                        && std::str::from_utf8(&self.frames[seg][start..start + len]).is_ok()
                    {
                        self.read_idx += len + 1;
                        return std::str::from_utf8(&self.frames[seg][start..start + len])
                            .ok()
                            .map(Cow::Borrowed);
                    }
                } else if self.has_n_bytes(len + 1) {
                    let body = self.read_exact_vec(len);
                    if self.peek_byte() == 0 {
                        if let Ok(s) = String::from_utf8(body) {
                            self.advance_read_byte();
                            return Some(Cow::Owned(s));
                        }
                    }
                }
            }
            self.set_read_pos_unchecked(start_pos);
        }
        None
    }

    pub fn read_string(&mut self) -> Option<String> {
        self.read_str_fast().map(Cow::into_owned)
    }

    /// Zero-copy bytes read over the real bytes tags (192..=255).  Wire nil
    /// is not accepted here; use [`Stream::read_bytes`] for nullable reads.
    pub fn read_bytes_fast(&mut self) -> Option<Cow<'_, [u8]>> {
        if !self.can_read() {
            return None;
        }
        let tag = self.peek_byte();
        if tag == 192 {
            self.advance_read_byte();
            return Some(Cow::Borrowed(&[]));
        }
        if (193..=254).contains(&tag) {
            let len = usize::from(tag - 192);
            if self.in_frame(len + 1) {
                let seg = self.read_seg;
                let start = self.read_idx + 1;
                self.read_idx += len + 1;
                return Some(Cow::Borrowed(&self.frames[seg][start..start + len]));
            }
            if self.has_n_bytes(len + 1) {
                self.advance_read_byte();
                return Some(Cow::Owned(self.read_exact_vec(len)));
            }
            return None;
        }
        if tag == 255 {
            let start_pos = self.read_pos();
            let head = self.read_chunk::<5>()?;
            let len = u32_le(&head[1..5]) as usize;
            if len > 62 {
                if self.in_frame(len) {
                    let seg = self.read_seg;
                    let start = self.read_idx;
                    self.read_idx += len;
                    return Some(Cow::Borrowed(&self.frames[seg][start..start + len]));
                }
                if self.has_n_bytes(len) {
                    return Some(Cow::Owned(self.read_exact_vec(len)));
                }
            }
            self.set_read_pos_unchecked(start_pos);
        }
        None
    }

    /// Read a bytes value.  Yields `Value::Nil` for wire nil, which is
    /// distinct from `Value::Bytes(vec![])`.
    pub fn read_bytes(&mut self) -> Option<Value> {
        if !self.can_read() {
            return None;
        }
        if self.peek_byte() == 1 {
            self.advance_read_byte();
            return Some(Value::Nil);
        }
        self.read_bytes_fast()
            .map(|b| Value::Bytes(b.into_owned()))
    }

    /// Read an array value.  Yields `Value::Nil` for wire nil.
    pub fn read_array(&mut self) -> Option<Value> {
        if !self.can_read() {
            return None;
        }
        let tag = self.peek_byte();
        if tag == 1 {
            self.advance_read_byte();
            return Some(Value::Nil);
        }
        if !(64..=95).contains(&tag) {
            return None;
        }
        if tag == 64 {
            self.advance_read_byte();
            return Some(Value::Array(Vec::new()));
        }
        let start_pos = self.read_pos();
        let (total_len, count) = if tag < 95 {
            let b = self.read_chunk::<5>()?;
            (u32_le(&b[1..5]) as usize, usize::from(tag - 64))
        } else {
            let b = self.read_chunk::<9>()?;
            (u32_le(&b[1..5]) as usize, u32_le(&b[5..9]) as usize)
        };
        if count == 0 || total_len <= 4 {
            self.set_read_pos_unchecked(start_pos);
            return None;
        }
        let mut items = Vec::with_capacity(count.min(self.remaining()));
        for _ in 0..count {
            match self.read_value() {
                Some(v) => items.push(v),
                None => {
                    self.set_read_pos_unchecked(start_pos);
                    return None;
                }
            }
        }
        if self.read_pos() == start_pos + total_len {
            Some(Value::Array(items))
        } else {
            self.set_read_pos_unchecked(start_pos);
            None
        }
    }

    /// Read a map value.  Yields `Value::Nil` for wire nil.
    pub fn read_map(&mut self) -> Option<Value> {
        if !self.can_read() {
            return None;
        }
        let tag = self.peek_byte();
        if tag == 1 {
            self.advance_read_byte();
            return Some(Value::Nil);
        }
        if !(96..=127).contains(&tag) {
            return None;
        }
        if tag == 96 {
            self.advance_read_byte();
            return Some(Value::Map(HashMap::new()));
        }
        let start_pos = self.read_pos();
        let (total_len, count) = if tag < 127 {
            let b = self.read_chunk::<5>()?;
            (u32_le(&b[1..5]) as usize, usize::from(tag - 96))
        } else {
            let b = self.read_chunk::<9>()?;
            (u32_le(&b[1..5]) as usize, u32_le(&b[5..9]) as usize)
        };
        if count == 0 || total_len <= 4 {
            self.set_read_pos_unchecked(start_pos);
            return None;
        }
        let mut entries = HashMap::with_capacity(count.min(self.remaining()));
        for _ in 0..count {
            let Some(key) = self.read_string() else {
                self.set_read_pos_unchecked(start_pos);
                return None;
            };
            match self.read_value() {
                Some(v) => {
                    entries.insert(key, v);
                }
                None => {
                    self.set_read_pos_unchecked(start_pos);
                    return None;
                }
            }
        }
        if self.read_pos() == start_pos + total_len {
            Some(Value::Map(entries))
        } else {
            self.set_read_pos_unchecked(start_pos);
            None
        }
    }

    /// Generic read dispatching on the tag byte.
    pub fn read_value(&mut self) -> Option<Value> {
        if !self.can_read() {
            return None;
        }
        match self.peek_byte() {
            1 => {
                self.advance_read_byte();
                Some(Value::Nil)
            }
            2 | 3 => self.read_bool().map(Value::Bool),
            4 | 5 => self.read_float64().map(Value::Float64),
            6..=8 | 14..=53 => self.read_int64().map(Value::Int64),
            9..=11 | 54..=63 => self.read_uint64().map(Value::Uint64),
            0 | 12 | 13 => None,
            64..=95 => self.read_array(),
            96..=127 => self.read_map(),
            128..=191 => self.read_string().map(Value::String),
            192..=255 => self.read_bytes(),
        }
    }

    // -----------------------------------------------------------------------
    // Export
    // -----------------------------------------------------------------------

    /// The raw wire bytes, borrowing the single frame when possible.
    pub fn wire_bytes(&self) -> Cow<'_, [u8]> {
        if self.write_seg == 0 {
            return Cow::Borrowed(&self.frames[0][..self.write_idx]);
        }
        let len = self.write_pos();
        let mut out = vec![0u8; len];
        for (i, frame) in self.frames.iter().take(self.write_seg + 1).enumerate() {
            let start = i << SEG_SHIFT;
            let n = (len - start).min(FRAME_LEN);
            out[start..start + n].copy_from_slice(&frame[..n]);
        }
        Cow::Owned(out)
    }

    #[cfg(test)]
    pub(crate) fn frame_count(&self) -> usize {
        self.frames.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_stream_cursors_start_after_header() {
        let s = Stream::take();
        assert_eq!(s.read_pos(), 17);
        assert_eq!(s.write_pos(), 17);
        assert!(!s.can_read());
    }

    #[test]
    fn reset_retains_exactly_one_frame() {
        let mut s = Stream::take();
        s.write_bytes(&vec![7u8; 4000]);
        assert!(s.frame_count() > 1);
        s.reset();
        assert_eq!(s.frame_count(), 1);
        assert_eq!(s.read_pos(), 17);
        assert_eq!(s.write_pos(), 17);
    }

    #[test]
    fn header_fields_are_little_endian_unions() {
        let mut s = Stream::take();
        s.set_server_callback_id(0x1122_3344_5566_7788);
        assert_eq!(s.client_callback_id(), 0x5566_7788);
        assert_eq!(s.client_conn_id(), 0x1122_3344);
        assert_eq!(s.client_sequence(), 0x1122_3344);
        s.set_client_sequence(9);
        assert_eq!(s.client_conn_id(), 9);
        s.set_machine_id(77);
        s.set_router_id(88);
        assert_eq!(s.machine_id(), 77);
        assert_eq!(s.router_id(), 88);
    }

    #[test]
    fn write_read_cursor_agreement() {
        let mut s = Stream::take();
        s.write_str("hello");
        s.write_int64(-12345);
        s.write_uint64(u64::MAX);
        assert_eq!(s.read_string().as_deref(), Some("hello"));
        assert_eq!(s.read_int64(), Some(-12345));
        assert_eq!(s.read_uint64(), Some(u64::MAX));
        assert_eq!(s.read_pos(), s.write_pos());
        assert!(!s.can_read());
    }

    #[test]
    fn failed_read_restores_cursor() {
        let mut s = Stream::take();
        s.write_str("x");
        let pos = s.read_pos();
        assert_eq!(s.read_int64(), None);
        assert_eq!(s.read_pos(), pos);
        assert_eq!(s.read_string().as_deref(), Some("x"));
    }

    #[test]
    fn nil_container_is_distinct_from_empty() {
        let mut s = Stream::take();
        s.write_nil();
        s.write_bytes(&[]);
        assert_eq!(s.read_bytes(), Some(Value::Nil));
        assert_eq!(s.read_bytes(), Some(Value::Bytes(Vec::new())));
    }

    #[test]
    fn nil_is_not_an_empty_string() {
        let mut s = Stream::take();
        s.write_nil();
        assert_eq!(s.read_string(), None);
        assert!(s.read_nil());
    }

    #[test]
    fn set_read_pos_rejects_past_write_cursor() {
        let mut s = Stream::take();
        s.write_uint64(1);
        assert!(s.set_read_pos(s.write_pos()));
        assert!(!s.set_read_pos(s.write_pos() + 1));
    }

    #[test]
    fn values_straddling_frames_round_trip() {
        let mut s = Stream::take();
        // Push the cursor close to the frame boundary, then write values
        // that cross it.
        s.write_bytes(&vec![1u8; 480]);
        let long = "abcdefgh".repeat(20);
        s.write_str(&long);
        s.write_int64(i64::MIN);
        s.write_float64(1.5);
        assert!(s.read_bytes().is_some());
        assert_eq!(s.read_string(), Some(long));
        assert_eq!(s.read_int64(), Some(i64::MIN));
        assert_eq!(s.read_float64(), Some(1.5));
    }

    #[test]
    fn zero_copy_string_borrows_within_frame() {
        let mut s = Stream::take();
        s.write_str("inline");
        match s.read_str_fast() {
            Some(Cow::Borrowed(v)) => assert_eq!(v, "inline"),
            other => panic!("expected borrowed view, got {other:?}"),
        }
    }

    #[test]
    fn peek_skip_matches_encoded_width() {
        let samples: Vec<Value> = vec![
            Value::Nil,
            Value::Bool(true),
            Value::Int64(0),
            Value::Int64(40000),
            Value::Uint64(9),
            Value::Uint64(u64::MAX),
            Value::Float64(2.5),
            Value::String("ok".to_owned()),
            Value::String("y".repeat(100)),
            Value::Bytes(vec![1, 2, 3]),
            Value::Array(vec![Value::Int64(1), Value::String("a".to_owned())]),
        ];
        for v in samples {
            let mut s = Stream::take();
            assert!(s.write_value(&v).is_ok());
            let start = s.read_pos();
            let skip = s.peek_skip();
            assert!(skip > 0, "no skip for {v:?}");
            assert_eq!(start + skip, s.write_pos(), "skip mismatch for {v:?}");
            s.recycle();
        }
    }

    #[test]
    fn wire_bytes_round_trip_through_from_wire() {
        let mut s = Stream::take();
        s.set_client_callback_id(42);
        s.set_client_sequence(7);
        s.write_str("$.a:b");
        s.write_uint64(0);
        let bytes = s.wire_bytes().into_owned();
        let mut loaded = Stream::from_wire(&bytes);
        assert_eq!(loaded.client_callback_id(), 42);
        assert_eq!(loaded.client_sequence(), 7);
        assert_eq!(loaded.read_string().as_deref(), Some("$.a:b"));
        assert_eq!(loaded.read_uint64(), Some(0));
    }
}
