//! Target side of passive synchronization: who holds the window lock, and the requests waiting for it.
use std::collections::VecDeque;

use crate::error::{RmaError, RmaResult};
use crate::packet::Packet;
use crate::target::LockType;

/// Locks currently granted on a window.
#[derive(Debug, Default)]
pub(crate) struct WinLockState {
    exclusive: Option<usize>,
    shared: Vec<usize>,
}

impl WinLockState {
    pub(crate) fn current(&self) -> LockType {
        if self.exclusive.is_some() {
            LockType::Exclusive
        } else if !self.shared.is_empty() {
            LockType::Shared
        } else {
            LockType::None
        }
    }

    pub(crate) fn holders(&self) -> usize {
        self.shared.len() + self.exclusive.iter().count()
    }

    /// Grants the lock to `origin` if it is compatible with what is already granted.
    pub(crate) fn try_acquire(&mut self, origin: usize, lock_type: LockType) -> bool {
        if !lock_type.compatible_with(self.current()) {
            return false;
        }
        match lock_type {
            LockType::Exclusive => self.exclusive = Some(origin),
            LockType::Shared => self.shared.push(origin),
            LockType::None => {}
        }
        true
    }

    pub(crate) fn release(&mut self, origin: usize) -> RmaResult<LockType> {
        if self.exclusive == Some(origin) {
            self.exclusive = None;
            return Ok(LockType::Exclusive);
        }
        match self.shared.iter().position(|o| *o == origin) {
            Some(i) => {
                self.shared.swap_remove(i);
                Ok(LockType::Shared)
            }
            None => Err(RmaError::invalid_state(
                origin,
                "unlock from an origin that holds no lock",
            )),
        }
    }
}

/// A lock request (bare or piggybacked on an operation) deferred because the lock was taken.
#[derive(Debug)]
pub(crate) struct LockEntry {
    pub(crate) id: u64,
    /// connection (rank) the request came in on
    pub(crate) source: usize,
    pub(crate) pkt: Packet,
    pub(crate) data: Vec<u8>,
    pub(crate) buf_size: usize,
    pub(crate) all_data_received: bool,
}

impl LockEntry {
    pub(crate) fn lock_type(&self) -> LockType {
        match &self.pkt {
            Packet::Lock { lock_type, .. } => *lock_type,
            pkt => pkt.flags().lock_type().unwrap_or(LockType::Exclusive),
        }
    }

    /// Adds a follow-on payload chunk, more bytes than declared is a fatal mismatch.
    pub(crate) fn append(&mut self, chunk: &[u8]) -> RmaResult<()> {
        let received = self.data.len() + chunk.len();
        if received > self.buf_size {
            return Err(RmaError::PayloadMismatch {
                expected: self.buf_size,
                received,
            });
        }
        self.data.extend_from_slice(chunk);
        self.all_data_received = self.data.len() == self.buf_size;
        Ok(())
    }
}

/// FIFO of deferred lock requests for one window.
#[derive(Debug, Default)]
pub(crate) struct LockQueue {
    entries: VecDeque<LockEntry>,
    next_id: u64,
}

impl LockQueue {
    /// Queues a request with whatever payload arrived inline, returns its id.
    pub(crate) fn push(
        &mut self,
        source: usize,
        pkt: Packet,
        data: Vec<u8>,
        buf_size: usize,
    ) -> RmaResult<u64> {
        if data.len() > buf_size {
            return Err(RmaError::PayloadMismatch {
                expected: buf_size,
                received: data.len(),
            });
        }
        let id = self.next_id;
        self.next_id += 1;
        let all_data_received = data.len() == buf_size;
        self.entries.push_back(LockEntry {
            id,
            source,
            pkt,
            data,
            buf_size,
            all_data_received,
        });
        Ok(id)
    }

    pub(crate) fn get_mut(&mut self, id: u64) -> Option<&mut LockEntry> {
        self.entries.iter_mut().find(|e| e.id == id)
    }

    /// Pops the front entry if its payload is complete and its lock can be granted now.
    pub(crate) fn pop_grantable(&mut self, lock: &mut WinLockState) -> Option<LockEntry> {
        let front = self.entries.front()?;
        if !front.all_data_received || !lock.try_acquire(front.source, front.lock_type()) {
            return None;
        }
        self.entries.pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
