use bytes::{BufMut, BytesMut};

use crate::{
    constants::DEFAULT_SEND_CAPACITY,
    error::{Result, RfbError},
};

/// Fixed-size outbound accumulator. It never grows; outbound protocol
/// messages are expected to be small.
#[derive(Debug)]
pub struct SendBuffer {
    storage: BytesMut,
    capacity: usize,
}

impl Default for SendBuffer {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_SEND_CAPACITY)
    }
}

impl SendBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            storage: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    pub fn enqueue(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.remaining() {
            return Err(RfbError::SendBufferFull {
                pending: self.len(),
                requested: bytes.len(),
                capacity: self.capacity,
            });
        }
        self.storage.put_slice(bytes);
        Ok(())
    }

    /// Pending bytes, to be handed to the transport before [`Self::clear`].
    pub fn take_for_flush(&self) -> &[u8] {
        &self.storage
    }

    pub fn clear(&mut self) {
        self.storage.clear();
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.storage.len()
    }
}
