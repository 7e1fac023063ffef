// ai
//! 🌊 BatchStreamDecoder: pulls a part's bytes through a ring buffer and hands back one
//! batch per top-level JSON array.
//!
//! 🎬 *[a part arrives. it is 3 GiB of `][`. nobody told the part that was rude.]*
//!
//! The framer only cares about four bytes: `[`, `]`, `"` and `\`. Everything else is
//! skipped in bulk with `memchr`. Between arrays only whitespace is tolerated. Anything
//! else where an array should start is a [`BridgeError::MalformedBatch`].
//!
//! 🧠 Knowledge graph:
//! - Read side: `reader.read()` lands bytes directly in the ring's free span, then
//!   `ring.write(n)` publishes them. One contiguous span per fill; the wrap is handled by
//!   the next fill.
//! - Frame side: when a frame closes, its bytes are copied out (two segments if it wraps),
//!   `ring.read(len)` releases them, and [`RecordBatchCodec::decode`] takes it from there.
//! - An array that cannot fit in the ring is a [`BridgeError::BufferOverflow`]. Fatal.

use memchr::{memchr2, memchr3};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

use super::RecordBatchCodec;
use crate::common::BatchRow;
use crate::error::{BridgeError, BridgeResult};
use crate::ring_buffer::RingBuffer;

/// 🌊 Incremental decoder over zero or more concatenated JSON arrays.
pub struct BatchStreamDecoder<R> {
    part_name: String,
    reader: R,
    ring: RingBuffer,
    codec: RecordBatchCodec,
    framer: ArrayFramer,
    eof: bool,
    bytes_consumed: u64,
}

impl<R> std::fmt::Debug for BatchStreamDecoder<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchStreamDecoder")
            .field("part_name", &self.part_name)
            .field("ring", &self.ring)
            .field("eof", &self.eof)
            .finish()
    }
}

impl<R: AsyncRead + Unpin> BatchStreamDecoder<R> {
    /// 🏗️ `max_batch_bytes` is the largest single array this decoder will ever hold.
    pub fn new(
        part_name: impl Into<String>,
        reader: R,
        codec: RecordBatchCodec,
        max_batch_bytes: usize,
    ) -> Self {
        Self {
            part_name: part_name.into(),
            reader,
            // -- 🪑 +1 for the seat the ring never lets anyone sit in
            ring: RingBuffer::new(max_batch_bytes.saturating_add(1)),
            codec,
            framer: ArrayFramer::default(),
            eof: false,
            bytes_consumed: 0,
        }
    }

    /// 📏 Bytes of framed batches handed out so far (whitespace between arrays excluded).
    pub fn bytes_consumed(&self) -> u64 {
        self.bytes_consumed
    }

    /// 📦 The next batch, `Ok(None)` at a clean end of stream.
    pub async fn next_batch(&mut self) -> BridgeResult<Option<Vec<BatchRow>>> {
        loop {
            if let Some(frame_len) = self.framer.scan(&mut self.ring)? {
                let frame = self.take_frame(frame_len)?;
                trace!(
                    "🧩 framed a {} byte batch out of part '{}'",
                    frame.len(),
                    self.part_name
                );
                return self.codec.decode(&frame).map(Some);
            }

            if self.eof {
                if self.framer.in_frame() {
                    return Err(BridgeError::malformed(format!(
                        "part '{}' ended in the middle of an array",
                        self.part_name
                    )));
                }
                return Ok(None);
            }

            self.fill().await?;
        }
    }

    /// 📥 Read whatever fits into the contiguous free span at the write cursor.
    async fn fill(&mut self) -> BridgeResult<()> {
        let writable = self.ring.available_write();
        if writable == 0 {
            // -- 💀 the ring is full and still no closing bracket: this array is too big
            return Err(BridgeError::BufferOverflow {
                requested: self.ring.available_read() + 1,
                max: self.ring.capacity() - 1,
            });
        }

        let start = self.ring.write_offset();
        let contiguous = writable.min(self.ring.capacity() - start);
        let read = self
            .reader
            .read(&mut self.ring.storage_mut()[start..start + contiguous])
            .await
            .map_err(|e| BridgeError::PartRead {
                part: self.part_name.clone(),
                message: e.to_string(),
            })?;

        if read == 0 {
            self.eof = true;
            return Ok(());
        }
        self.ring.write(read)
    }

    /// ✂️ Copy `len` framed bytes out of the ring, two segments when the frame wraps.
    fn take_frame(&mut self, len: usize) -> BridgeResult<Vec<u8>> {
        let capacity = self.ring.capacity();
        let start = self.ring.read_offset();
        let first = len.min(capacity - start);

        let mut frame = Vec::with_capacity(len);
        frame.extend_from_slice(&self.ring.storage()[start..start + first]);
        frame.extend_from_slice(&self.ring.storage()[..len - first]);

        self.ring.read(len)?;
        self.framer = ArrayFramer::default();
        self.bytes_consumed += len as u64;
        Ok(frame)
    }
}

/// 🔍 Tracks just enough JSON structure to know where a top-level array ends.
#[derive(Debug, Default)]
struct ArrayFramer {
    started: bool,
    depth: usize,
    in_string: bool,
    escaped: bool,
    /// Bytes of the current frame, counted from the read cursor, that were already examined.
    scanned: usize,
}

impl ArrayFramer {
    fn in_frame(&self) -> bool {
        self.started
    }

    /// 🔎 Resume scanning. Returns the frame length once its closing `]` shows up.
    fn scan(&mut self, ring: &mut RingBuffer) -> BridgeResult<Option<usize>> {
        if !self.started && !self.seek_frame_start(ring)? {
            return Ok(None);
        }

        let capacity = ring.capacity();
        let read_offset = ring.read_offset();
        let available = ring.available_read();
        let storage = ring.storage();

        while self.scanned < available {
            let physical = (read_offset + self.scanned) % capacity;
            let window_len = (capacity - physical).min(available - self.scanned);
            let window = &storage[physical..physical + window_len];
            let (consumed, closed) = self.step(window);
            self.scanned += consumed;
            if closed {
                return Ok(Some(self.scanned));
            }
        }
        Ok(None)
    }

    /// 🧹 Drop inter-array whitespace. True once a `[` sits at the read cursor.
    fn seek_frame_start(&mut self, ring: &mut RingBuffer) -> BridgeResult<bool> {
        while ring.available_read() > 0 {
            let byte = ring.storage()[ring.read_offset()];
            match byte {
                b' ' | b'\t' | b'\n' | b'\r' => ring.read(1)?,
                b'[' => {
                    self.started = true;
                    self.depth = 1;
                    self.scanned = 1;
                    return Ok(true);
                }
                other => {
                    return Err(BridgeError::malformed(format!(
                        "expected '[' to open a batch, found {:?}",
                        other as char
                    )));
                }
            }
        }
        Ok(false)
    }

    /// 👣 Examine one contiguous window. Returns bytes consumed and whether the frame closed.
    fn step(&mut self, window: &[u8]) -> (usize, bool) {
        if self.escaped {
            self.escaped = false;
            return (1, false);
        }

        if self.in_string {
            return match memchr2(b'"', b'\\', window) {
                None => (window.len(), false),
                Some(i) => {
                    if window[i] == b'\\' {
                        self.escaped = true;
                    } else {
                        self.in_string = false;
                    }
                    (i + 1, false)
                }
            };
        }

        match memchr3(b'"', b'[', b']', window) {
            None => (window.len(), false),
            Some(i) => {
                match window[i] {
                    b'"' => self.in_string = true,
                    b'[' => self.depth += 1,
                    _ => self.depth -= 1,
                }
                (i + 1, self.depth == 0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::common::{FieldSchema, FieldType, ScalarValue, TableSchema};

    fn codec() -> RecordBatchCodec {
        RecordBatchCodec::new(Arc::new(TableSchema::new(vec![
            FieldSchema::new("name", FieldType::String),
            FieldSchema::new("n", FieldType::Integer),
        ])))
    }

    async fn drain(input: &[u8], max_batch_bytes: usize) -> BridgeResult<Vec<Vec<BatchRow>>> {
        let mut decoder = codec().stream_decoder("test-part", input, max_batch_bytes);
        let mut batches = Vec::new();
        while let Some(batch) = decoder.next_batch().await? {
            batches.push(batch);
        }
        Ok(batches)
    }

    #[tokio::test]
    async fn the_one_where_concatenated_arrays_become_separate_batches() {
        let input = br#"[{"name":"a","n":1}][{"name":"b","n":2},{"name":"c","n":3}]
            [ ]"#;
        let batches = drain(input, 1024).await.unwrap();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), 1);
        assert_eq!(batches[1].len(), 2);
        assert!(batches[2].is_empty());
        assert_eq!(batches[1][1].get("n"), Some(&ScalarValue::Integer(3)));
    }

    #[tokio::test]
    async fn the_one_where_an_empty_stream_is_just_empty() {
        assert!(drain(b"", 64).await.unwrap().is_empty());
        assert!(drain(b"  \n\t ", 64).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn the_one_where_brackets_inside_strings_do_not_count() {
        let input = br#"[{"name":"][ \"]\\","n":7}]"#;
        let batches = drain(input, 1024).await.unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(
            batches[0][0].get("name"),
            Some(&ScalarValue::String(r#"][ "]\"#.to_string()))
        );
    }

    #[tokio::test]
    async fn the_one_where_a_tiny_ring_wraps_many_times() {
        // -- 🔄 each array is 22 bytes, ring holds 24, so frames straddle the end constantly
        let one = br#"[{"name":"xy","n":12}]"#;
        let mut input = Vec::new();
        for _ in 0..50 {
            input.extend_from_slice(one);
            input.push(b'\n');
        }
        let batches = drain(&input, one.len() + 2).await.unwrap();
        assert_eq!(batches.len(), 50);
        assert!(batches.iter().all(|b| b[0].get("n") == Some(&ScalarValue::Integer(12))));
    }

    #[tokio::test]
    async fn the_one_where_a_batch_too_big_for_the_ring_overflows() {
        let input = br#"[{"name":"this is far too long for a sixteen byte ring","n":1}]"#;
        let err = drain(input, 16).await.unwrap_err();
        assert_eq!(
            err,
            BridgeError::BufferOverflow {
                requested: 17,
                max: 16
            }
        );
    }

    #[tokio::test]
    async fn the_one_where_a_stray_object_is_not_a_batch() {
        let err = drain(br#"[] {"name":"rogue"}"#, 64).await.unwrap_err();
        assert!(matches!(err, BridgeError::MalformedBatch(ref m) if m.contains("expected '['")), "{err:?}");
    }

    #[tokio::test]
    async fn the_one_where_the_stream_ends_mid_array() {
        let err = drain(br#"[{"name":"cut","n":1}"#, 64).await.unwrap_err();
        assert!(matches!(err, BridgeError::MalformedBatch(ref m) if m.contains("middle")), "{err:?}");
    }

    #[tokio::test]
    async fn the_one_where_nested_arrays_stay_inside_their_frame() {
        let loose = RecordBatchCodec::new(Arc::new(TableSchema::new(vec![FieldSchema::new(
            "name",
            FieldType::String,
        )])));
        let mut decoder = loose.stream_decoder("nested", &br#"[[1,[2]],[3]]"#[..], 64);
        // -- 🧩 framing succeeds on the whole thing; it's the codec that rejects non-objects
        let err = decoder.next_batch().await.unwrap_err();
        assert!(matches!(err, BridgeError::MalformedBatch(ref m) if m.contains("element 0")));
        assert_eq!(decoder.bytes_consumed(), 13);
    }
}
