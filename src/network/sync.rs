//! Per-session catch-up decisions. No I/O: callers feed in what they saw
//! and send whatever request comes back.

use crate::blockchain::LedgerError;

use super::message::Message;

#[derive(Debug, Clone)]
pub struct SyncState {
    batch: u32,
    /// Highest chain length the remote has advertised or implied.
    remote_height: u64,
    /// Exclusive end of the range currently requested.
    requested_until: u64,
    /// Local height at which the remote served a block we rejected.
    rejected_at: Option<u64>,
}

impl SyncState {
    pub fn new(batch: u32) -> Self {
        Self {
            batch: batch.max(1),
            remote_height: 0,
            requested_until: 0,
            rejected_at: None,
        }
    }

    pub fn remote_height(&self) -> u64 {
        self.remote_height
    }

    fn request_from(&mut self, local_height: u64) -> Option<Message> {
        if self.requested_until > local_height {
            return None; // already in flight
        }
        self.requested_until = local_height + self.batch as u64;
        Some(Message::GetBlocks {
            from_height: local_height,
            max: self.batch,
        })
    }

    /// A CHAIN_SUMMARY also closes any previous batch: peers send one after
    /// serving GET_BLOCKS.
    pub fn on_chain_summary(&mut self, remote_height: u64, local_height: u64) -> Option<Message> {
        self.remote_height = remote_height;
        self.requested_until = 0;
        if remote_height <= local_height || self.rejected_at == Some(local_height) {
            return None;
        }
        self.request_from(local_height)
    }

    /// `unknown` is how many announced hashes the local chain lacks.
    pub fn on_inv(&mut self, unknown: usize, local_height: u64) -> Option<Message> {
        if unknown == 0 {
            return None;
        }
        self.remote_height = self.remote_height.max(local_height + unknown as u64);
        self.rejected_at = None;
        self.request_from(local_height)
    }

    /// React to the outcome of `add_block` for a block the remote sent.
    pub fn on_block_result(
        &mut self,
        block_index: u64,
        result: &Result<(), LedgerError>,
        local_height: u64,
    ) -> Option<Message> {
        self.remote_height = self.remote_height.max(block_index + 1);
        match result {
            Ok(()) => {
                self.rejected_at = None;
                None
            }
            // out of order: fill the hole first
            Err(LedgerError::IndexGap { .. }) => self.request_from(local_height),
            Err(LedgerError::StaleBlock { .. }) => None,
            Err(_) => {
                self.rejected_at = Some(local_height);
                None
            }
        }
    }
}
