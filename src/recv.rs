//! Growable receive queue with a read cursor.
//!
//! Incoming chunks are appended behind the unconsumed region of a single
//! contiguous allocation, so a decoder can read fields that straddle chunk
//! boundaries. Bytes before the cursor stay in place until the next
//! grow-or-compact pass, which is what makes [`ReceiveBuffer::need_more`]
//! backtracking possible.

use tracing::{debug, trace, warn};

use crate::{
    constants::{DEFAULT_RECEIVE_CAPACITY, FIT_MULTIPLIER, GROW_DIVISOR, MAX_RECEIVE_CAPACITY},
    error::{Result, RfbError},
};

#[derive(Debug)]
pub struct ReceiveBuffer {
    // always fully initialised; its length is the capacity
    storage: Vec<u8>,
    write_len: usize,
    read_pos: usize,
    initial_capacity: usize,
    max_capacity: usize,
}

impl Default for ReceiveBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ReceiveBuffer {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_RECEIVE_CAPACITY, MAX_RECEIVE_CAPACITY)
    }

    /// Allocates `initial` bytes up front. Growth stops at `max`.
    pub fn with_limits(initial: usize, max: usize) -> Self {
        let initial = initial.min(max);
        Self {
            storage: vec![0; initial],
            write_len: 0,
            read_pos: 0,
            initial_capacity: initial,
            max_capacity: max,
        }
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    pub fn read_pos(&self) -> usize {
        self.read_pos
    }

    pub fn write_len(&self) -> usize {
        self.write_len
    }

    /// Write position past which a compaction pass is worthwhile.
    pub fn grow_threshold(&self) -> usize {
        self.capacity() / GROW_DIVISOR
    }

    /// Number of unconsumed bytes.
    pub fn available(&self) -> usize {
        self.write_len - self.read_pos
    }

    pub fn is_empty(&self) -> bool {
        self.available() == 0
    }

    /// Copies `chunk` behind the unconsumed data, growing or compacting first
    /// when it does not fit in the free tail.
    ///
    /// On [`RfbError::BufferOverflow`] the buffer is left untouched.
    pub fn append(&mut self, chunk: &[u8]) -> Result<()> {
        if chunk.len() > self.capacity() - self.write_len {
            self.grow_or_compact(Some(chunk.len()))?;
        }

        let end = self.write_len + chunk.len();
        self.storage[self.write_len..end].copy_from_slice(chunk);
        self.write_len = end;
        Ok(())
    }

    /// Compacts once the write position has crossed [`Self::grow_threshold`].
    pub fn compact_if_needed(&mut self) -> Result<()> {
        if self.write_len > self.grow_threshold() {
            self.grow_or_compact(None)?;
        }
        Ok(())
    }

    /// Forgets all data, keeping the current allocation.
    pub fn reset(&mut self) {
        self.write_len = 0;
        self.read_pos = 0;
    }

    /// Drops the backing storage. Any read afterwards fails its length check.
    pub fn release(&mut self) {
        self.storage = Vec::new();
        self.reset();
    }

    fn grow_or_compact(&mut self, min_fit: Option<usize>) -> Result<()> {
        let pending = self.available();
        let capacity = self.capacity();
        let mut new_capacity = capacity;

        if min_fit.is_some() || pending > capacity / 2 {
            new_capacity = match min_fit {
                Some(fit) => (pending + fit).saturating_mul(FIT_MULTIPLIER),
                None => capacity.saturating_mul(2),
            };
            new_capacity = new_capacity
                .max(self.initial_capacity)
                .min(self.max_capacity);

            let required = pending + min_fit.unwrap_or(0);
            if required > new_capacity {
                warn!(
                    required,
                    max = self.max_capacity,
                    "receive buffer ceiling exceeded"
                );
                return Err(RfbError::BufferOverflow {
                    required,
                    max: self.max_capacity,
                });
            }
        }

        if new_capacity != capacity {
            let mut storage = vec![0; new_capacity];
            storage[..pending].copy_from_slice(&self.storage[self.read_pos..self.write_len]);
            self.storage = storage;
            debug!(
                from = capacity,
                to = new_capacity,
                pending,
                "resized receive buffer"
            );
        } else {
            self.storage.copy_within(self.read_pos..self.write_len, 0);
            trace!(pending, reclaimed = self.read_pos, "compacted receive buffer");
        }

        self.write_len = pending;
        self.read_pos = 0;
        Ok(())
    }

    fn require(&self, n: usize) {
        assert!(
            self.available() >= n,
            "receive buffer underrun: {n} bytes requested, {} available",
            self.available()
        );
    }

    fn resolve_len(&self, len: Option<usize>) -> usize {
        let n = len.unwrap_or_else(|| self.available());
        self.require(n);
        n
    }

    /// Returns `true` when fewer than `required` bytes are available.
    ///
    /// With `backtrack`, a short read also rewinds the cursor by that many
    /// bytes, undoing a partial consumption by the caller.
    pub fn need_more(&mut self, required: usize, backtrack: Option<usize>) -> Result<bool> {
        let available = self.available();
        if available >= required {
            return Ok(false);
        }

        if let Some(backtrack) = backtrack {
            if backtrack > self.read_pos {
                return Err(RfbError::InvalidBacktrack {
                    backtrack,
                    read_pos: self.read_pos,
                });
            }
            self.read_pos -= backtrack;
        }

        trace!(required, available, "more data needed");
        Ok(true)
    }

    pub fn peek_u8(&self) -> u8 {
        self.require(1);
        self.storage[self.read_pos]
    }

    pub fn peek_u16_be(&self) -> u16 {
        self.require(2);
        let p = self.read_pos;
        u16::from_be_bytes([self.storage[p], self.storage[p + 1]])
    }

    pub fn take_u8(&mut self) -> u8 {
        let value = self.peek_u8();
        self.read_pos += 1;
        value
    }

    pub fn take_u16_be(&mut self) -> u16 {
        let value = self.peek_u16_be();
        self.read_pos += 2;
        value
    }

    pub fn take_u32_be(&mut self) -> u32 {
        self.require(4);
        let p = self.read_pos;
        let s = &self.storage;
        let value = u32::from_be_bytes([s[p], s[p + 1], s[p + 2], s[p + 3]]);
        self.read_pos += 4;
        value
    }

    pub fn skip(&mut self, n: usize) {
        self.require(n);
        self.read_pos += n;
    }

    /// Consumes `len` bytes (or everything) mapping each byte to the char
    /// with that code point. No UTF-8 decoding takes place.
    pub fn take_string(&mut self, len: Option<usize>) -> String {
        let n = self.resolve_len(len);
        let start = self.read_pos;
        let text = self.storage[start..start + n]
            .iter()
            .map(|&b| char::from(b))
            .collect();
        self.read_pos += n;
        text
    }

    /// Consumes `len` bytes (or everything) and returns them as a view into
    /// the storage. The view lives until the next mutation of the buffer.
    pub fn take_bytes(&mut self, len: Option<usize>) -> &[u8] {
        let n = self.resolve_len(len);
        let start = self.read_pos;
        self.read_pos += n;
        &self.storage[start..start + n]
    }

    pub fn peek_bytes(&self, len: Option<usize>) -> &[u8] {
        let n = self.resolve_len(len);
        &self.storage[self.read_pos..self.read_pos + n]
    }

    /// Copies `len` bytes (or everything) to the front of `target` and
    /// advances past them. Panics if `target` is too short.
    pub fn copy_into(&mut self, target: &mut [u8], len: Option<usize>) {
        let n = self.resolve_len(len);
        let start = self.read_pos;
        target[..n].copy_from_slice(&self.storage[start..start + n]);
        self.read_pos += n;
    }

    /// Every byte written since the last reset, consumed or not.
    pub fn view_all(&self) -> &[u8] {
        &self.storage[..self.write_len]
    }

    /// Cursor-relative view `[start, end)`, `end` defaulting to the write
    /// position.
    pub fn slice(&self, start: usize, end: Option<usize>) -> &[u8] {
        let from = self.read_pos + start;
        let to = end.map_or(self.write_len, |end| self.read_pos + end);
        assert!(
            from <= to && to <= self.write_len,
            "slice [{start}, {to}) out of range, {} available",
            self.available()
        );
        &self.storage[from..to]
    }
}
