use crate::{
    constants::{
        DEFAULT_FLUSH_THRESHOLD, DEFAULT_RECEIVE_CAPACITY, DEFAULT_SEND_CAPACITY,
        MAX_RECEIVE_CAPACITY,
    },
    error::{Result, RfbError},
};

/// Per-session buffer sizing.
///
/// Checked once by [`SessionConfig::validate`] when the session is built and
/// never changed afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Initial receive storage size in bytes.
    pub receive_capacity: usize,
    /// Absolute ceiling the receive storage may grow to.
    pub max_receive_capacity: usize,
    /// Fixed send storage size in bytes.
    pub send_capacity: usize,
    /// Highest tolerated transport backlog before sends are deferred.
    pub flush_threshold: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            receive_capacity: DEFAULT_RECEIVE_CAPACITY,
            max_receive_capacity: MAX_RECEIVE_CAPACITY,
            send_capacity: DEFAULT_SEND_CAPACITY,
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.receive_capacity == 0 {
            return Err(RfbError::InvalidConfig("receive_capacity must be non-zero"));
        }
        if self.send_capacity == 0 {
            return Err(RfbError::InvalidConfig("send_capacity must be non-zero"));
        }
        if self.flush_threshold == 0 {
            return Err(RfbError::InvalidConfig("flush_threshold must be non-zero"));
        }
        if self.receive_capacity > self.max_receive_capacity {
            return Err(RfbError::InvalidConfig(
                "receive_capacity exceeds max_receive_capacity",
            ));
        }
        Ok(())
    }
}
