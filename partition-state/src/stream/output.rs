use byteorder::{BigEndian, ByteOrder};
use elastore_errors::{invariant, ElastoreResult};

/// Frame overhead preceding the rows: partition id + row count.
pub const FRAME_HEADER_BYTES: usize = 8;
/// Frame overhead following the rows: the zero terminator.
pub const FRAME_TERMINATOR_BYTES: usize = 4;
/// Per-row overhead: the length prefix.
pub const ROW_PREFIX_BYTES: usize = 4;

/// One fixed-capacity output buffer carrying the serialization frame
///
/// ```text
/// [ i32 partition_id ][ i32 row_count ]
///   repeat row_count times: [ i32 tuple_length_bytes ][ tuple bytes ]
/// [ i32 terminator = 0 ]
/// ```
///
/// All integers big-endian; `tuple_length_bytes` excludes its own prefix.
/// Writers must probe [`has_room`](Self::has_room) before
/// [`write_row`](Self::write_row): a row is either written whole or not at
/// all, and the probe always reserves space for the terminator. The row
/// count is patched into the header on [`finish`](Self::finish).
#[derive(Debug)]
pub struct TupleOutputStream {
    buf: Vec<u8>,
    capacity: usize,
    partition_id: i32,
    row_count: u32,
    finished: bool,
}

impl TupleOutputStream {
    /// Create a buffer of `capacity` bytes for `partition_id`.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` cannot hold even an empty frame.
    pub fn new(capacity: usize, partition_id: i32) -> Self {
        assert!(
            capacity >= FRAME_HEADER_BYTES + FRAME_TERMINATOR_BYTES,
            "output buffer of {capacity} bytes cannot hold a frame"
        );
        let mut stream = Self {
            buf: Vec::with_capacity(capacity),
            capacity,
            partition_id,
            row_count: 0,
            finished: false,
        };
        stream.write_header();
        stream
    }

    fn write_header(&mut self) {
        self.buf
            .extend_from_slice(&self.partition_id.to_be_bytes());
        // row count, patched on finish
        self.buf.extend_from_slice(&0i32.to_be_bytes());
    }

    /// Whether a serialized row of `row_len` bytes fits, terminator
    /// included.
    pub fn has_room(&self, row_len: usize) -> bool {
        !self.finished
            && self.buf.len() + ROW_PREFIX_BYTES + row_len + FRAME_TERMINATOR_BYTES
                <= self.capacity
    }

    /// Append one serialized row. Callers must have probed
    /// [`has_room`](Self::has_room) first.
    pub fn write_row(&mut self, row: &[u8]) -> ElastoreResult<()> {
        invariant!(
            self.has_room(row.len()),
            "row of {} bytes written without room (position {})",
            row.len(),
            self.buf.len()
        );
        self.buf
            .extend_from_slice(&(row.len() as i32).to_be_bytes());
        self.buf.extend_from_slice(row);
        self.row_count += 1;
        Ok(())
    }

    /// Current write position in bytes.
    pub fn position(&self) -> usize {
        self.buf.len()
    }

    /// Rows written so far.
    pub fn row_count(&self) -> u32 {
        self.row_count
    }

    /// Patch the row count, append the terminator and return the finished
    /// frame. Idempotent.
    pub fn finish(&mut self) -> &[u8] {
        if !self.finished {
            BigEndian::write_i32(&mut self.buf[4..8], self.row_count as i32);
            self.buf.extend_from_slice(&0i32.to_be_bytes());
            self.finished = true;
        }
        &self.buf
    }

    /// Drop the accumulated frame and start a fresh one, reusing the
    /// allocation. Used by callers that drain buffers between
    /// `stream_more` calls.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.row_count = 0;
        self.finished = false;
        self.write_header();
    }
}
