//! Exposed memory windows and the registry that owns them.
use indexmap::IndexMap;
use tracing::debug;

use crate::datatype::{accumulate_elem, AccOp};
use crate::directory::Directory;
use crate::error::{RmaError, RmaResult};
use crate::lock_queue::{LockQueue, WinLockState};
use crate::op::OpRecord;
use crate::packet::OpHeader;
use crate::pool::{Arena, PoolKind};
use crate::target::Target;

/// Identifies a window, windows get the same id on every rank when created in the same order.
pub type WinId = u32;

pub(crate) struct Window {
    pub(crate) id: WinId,
    memory: Vec<u8>,
    pub(crate) ops: Arena<OpRecord>,
    pub(crate) targets: Arena<Target>,
    pub(crate) directory: Directory,
    /// locks this rank granted on its own memory
    pub(crate) lock: WinLockState,
    pub(crate) lock_queue: LockQueue,
    /// target ranks of an open collective epoch
    pub(crate) epoch: Option<Vec<usize>>,
    /// `Complete` notifications received and not yet consumed by a wait
    pub(crate) epoch_completions: usize,
    /// origins that had an operation rejected, their later traffic on this window is dropped
    pub(crate) rejected: Vec<usize>,
}

/// Sizes a window is created with.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WindowLayout {
    pub(crate) size: usize,
    pub(crate) num_ranks: usize,
    pub(crate) op_pool_size: usize,
    pub(crate) target_pool_size: usize,
    pub(crate) slots_size: usize,
}

impl Window {
    pub(crate) fn new(layout: WindowLayout) -> Window {
        Window {
            id: 0,
            memory: vec![0; layout.size],
            ops: Arena::new("window op pool", PoolKind::Window, layout.op_pool_size),
            targets: Arena::new(
                "window target pool",
                PoolKind::Window,
                layout.target_pool_size,
            ),
            directory: Directory::new(layout.slots_size, layout.num_ranks),
            lock: WinLockState::default(),
            lock_queue: LockQueue::default(),
            epoch: None,
            epoch_completions: 0,
            rejected: vec![],
        }
    }

    pub(crate) fn size(&self) -> usize {
        self.memory.len()
    }

    /// byte offsets of the elements a packet addresses, bounds checked
    fn elem_offsets(&self, hdr: &OpHeader) -> RmaResult<Vec<usize>> {
        let dt = &hdr.datatype;
        let size = dt.elem().size();
        let offsets: Vec<usize> = (hdr.stream_offset..hdr.stream_offset + hdr.count)
            .map(|i| hdr.disp + dt.elem_offset(i))
            .collect();
        match offsets.last() {
            Some(last) if last + size > self.memory.len() => Err(RmaError::InvalidArgument(
                format!(
                    "access to bytes {}..{} of a {} byte window",
                    hdr.disp,
                    last + size,
                    self.memory.len()
                ),
            )),
            _ => Ok(offsets),
        }
    }

    /// Checks that every element the packet addresses lies inside the window.
    pub(crate) fn check_access(&self, hdr: &OpHeader) -> RmaResult<()> {
        self.elem_offsets(hdr).map(|_| ())
    }

    fn check_payload(hdr: &OpHeader, data: &[u8]) -> RmaResult<()> {
        let expected = hdr.count * hdr.datatype.elem().size();
        if data.len() != expected {
            return Err(RmaError::PayloadMismatch {
                expected,
                received: data.len(),
            });
        }
        Ok(())
    }

    pub(crate) fn put(&mut self, hdr: &OpHeader, data: &[u8]) -> RmaResult<()> {
        Self::check_payload(hdr, data)?;
        let size = hdr.datatype.elem().size();
        for (off, src) in self.elem_offsets(hdr)?.into_iter().zip(data.chunks_exact(size)) {
            self.memory[off..off + size].copy_from_slice(src);
        }
        Ok(())
    }

    /// Packed copy of the addressed elements.
    pub(crate) fn read(&self, hdr: &OpHeader) -> RmaResult<Vec<u8>> {
        let size = hdr.datatype.elem().size();
        let mut out = Vec::with_capacity(hdr.count * size);
        for off in self.elem_offsets(hdr)? {
            out.extend_from_slice(&self.memory[off..off + size]);
        }
        Ok(out)
    }

    /// Combines `data` into the window element-wise, returns the previous contents packed.
    pub(crate) fn accumulate(&mut self, hdr: &OpHeader, op: AccOp, data: &[u8]) -> RmaResult<Vec<u8>> {
        Self::check_payload(hdr, data)?;
        let elem = hdr.datatype.elem();
        let size = elem.size();
        let mut prev = Vec::with_capacity(data.len());
        for (off, src) in self.elem_offsets(hdr)?.into_iter().zip(data.chunks_exact(size)) {
            let dst = &mut self.memory[off..off + size];
            prev.extend_from_slice(dst);
            accumulate_elem(elem, op, dst, src);
        }
        Ok(prev)
    }

    /// Replaces the element with `origin` if it currently equals `compare`, returns the old value.
    pub(crate) fn compare_and_swap(
        &mut self,
        hdr: &OpHeader,
        origin: &[u8],
        compare: &[u8],
    ) -> RmaResult<Vec<u8>> {
        Self::check_payload(hdr, origin)?;
        Self::check_payload(hdr, compare)?;
        let size = hdr.datatype.elem().size();
        let off = match self.elem_offsets(hdr)?.first() {
            Some(off) => *off,
            None => return Ok(vec![]),
        };
        let dst = &mut self.memory[off..off + size];
        let old = dst.to_vec();
        if old == compare {
            dst.copy_from_slice(origin);
        }
        Ok(old)
    }

    pub(crate) fn read_bytes(&self, offset: usize, len: usize) -> RmaResult<Vec<u8>> {
        self.memory
            .get(offset..offset + len)
            .map(|b| b.to_vec())
            .ok_or_else(|| {
                RmaError::InvalidArgument(format!(
                    "bytes {}..{} outside of a {} byte window",
                    offset,
                    offset + len,
                    self.memory.len()
                ))
            })
    }

    pub(crate) fn write_bytes(&mut self, offset: usize, data: &[u8]) -> RmaResult<()> {
        let len = self.memory.len();
        match self.memory.get_mut(offset..offset + data.len()) {
            Some(dst) => {
                dst.copy_from_slice(data);
                Ok(())
            }
            None => Err(RmaError::InvalidArgument(format!(
                "bytes {}..{} outside of a {} byte window",
                offset,
                offset + data.len(),
                len
            ))),
        }
    }
}

/// Record pools shared by every window of a registry.
pub(crate) struct GlobalPools {
    pub(crate) ops: Arena<OpRecord>,
    pub(crate) targets: Arena<Target>,
}

/// The windows of one engine plus the global pools backing them.
///
/// The global pools exist only while at least one window is registered: they are created with
/// the first window and torn down with the last one.
#[derive(Default)]
pub struct WindowRegistry {
    windows: IndexMap<WinId, Window>,
    global: Option<GlobalPools>,
    next_id: WinId,
}

impl WindowRegistry {
    pub fn new() -> WindowRegistry {
        WindowRegistry::default()
    }

    pub(crate) fn register(
        &mut self,
        mut window: Window,
        op_global_pool_size: usize,
        target_global_pool_size: usize,
    ) -> WinId {
        if self.global.is_none() {
            debug!(
                "initializing global pools ({} ops, {} targets)",
                op_global_pool_size, target_global_pool_size
            );
            self.global = Some(GlobalPools {
                ops: Arena::new("global op pool", PoolKind::Global, op_global_pool_size),
                targets: Arena::new(
                    "global target pool",
                    PoolKind::Global,
                    target_global_pool_size,
                ),
            });
        }
        let id = self.next_id;
        self.next_id += 1;
        window.id = id;
        self.windows.insert(id, window);
        id
    }

    pub(crate) fn deregister(&mut self, id: WinId) -> Option<Window> {
        let window = self.windows.shift_remove(&id)?;
        if self.windows.is_empty() {
            debug!("last window freed, tearing down global pools");
            self.global = None;
        }
        Some(window)
    }

    pub fn window_ids(&self) -> Vec<WinId> {
        self.windows.keys().copied().collect()
    }

    pub(crate) fn window(&self, id: WinId) -> RmaResult<&Window> {
        self.windows.get(&id).ok_or(RmaError::UnknownWindow(id))
    }

    pub(crate) fn window_mut(&mut self, id: WinId) -> RmaResult<&mut Window> {
        self.windows.get_mut(&id).ok_or(RmaError::UnknownWindow(id))
    }

    /// A window and the global pools, borrowed together.
    pub(crate) fn split_mut(&mut self, id: WinId) -> RmaResult<(&mut Window, &mut GlobalPools)> {
        let window = self.windows.get_mut(&id).ok_or(RmaError::UnknownWindow(id))?;
        let global = self
            .global
            .as_mut()
            .ok_or(RmaError::internal("global pools missing with a live window"))?;
        Ok((window, global))
    }

    pub(crate) fn global(&self) -> Option<&GlobalPools> {
        self.global.as_ref()
    }

    pub fn has_global_pools(&self) -> bool {
        self.global.is_some()
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatype::{from_bytes, to_bytes, Datatype};
    use crate::packet::PktFlags;

    fn window(size: usize) -> Window {
        Window::new(WindowLayout {
            size,
            num_ranks: 4,
            op_pool_size: 4,
            target_pool_size: 4,
            slots_size: 4,
        })
    }

    fn hdr(disp: usize, count: usize, stream_offset: usize, datatype: Datatype) -> OpHeader {
        OpHeader {
            win: 0,
            source: 1,
            disp,
            count,
            stream_offset,
            datatype,
            flags: PktFlags::NONE,
            data_len: 0,
        }
    }

    #[test]
    fn strided_put_and_read() {
        let mut win = window(64);
        let dt = Datatype::vector::<i32>(1, 2);
        win.put(&hdr(0, 3, 0, dt), &to_bytes(&[7i32, 8, 9])).unwrap();
        let all: Vec<i32> = from_bytes(&win.read_bytes(0, 24).unwrap());
        assert_eq!(all, vec![7, 0, 8, 0, 9, 0]);
        let back: Vec<i32> = from_bytes(&win.read(&hdr(0, 3, 0, dt)).unwrap());
        assert_eq!(back, vec![7, 8, 9]);
    }

    #[test]
    fn streamed_unit_lands_at_its_offset() {
        let mut win = window(32);
        let dt = Datatype::contiguous::<u64>();
        win.write_bytes(0, &to_bytes(&[1u64, 1, 1, 1])).unwrap();
        let prev = win
            .accumulate(&hdr(0, 2, 2, dt), AccOp::Sum, &to_bytes(&[5u64, 6]))
            .unwrap();
        assert_eq!(from_bytes::<u64>(&prev), vec![1, 1]);
        let all: Vec<u64> = from_bytes(&win.read_bytes(0, 32).unwrap());
        assert_eq!(all, vec![1, 1, 6, 7]);
    }

    #[test]
    fn compare_and_swap_only_on_match() {
        let mut win = window(8);
        let h = hdr(4, 1, 0, Datatype::contiguous::<u32>());
        let old = win
            .compare_and_swap(&h, &to_bytes(&[9u32]), &to_bytes(&[1u32]))
            .unwrap();
        assert_eq!(from_bytes::<u32>(&old), vec![0]);
        assert_eq!(from_bytes::<u32>(&win.read(&h).unwrap()), vec![0]);
        win.compare_and_swap(&h, &to_bytes(&[9u32]), &to_bytes(&[0u32]))
            .unwrap();
        assert_eq!(from_bytes::<u32>(&win.read(&h).unwrap()), vec![9]);
    }

    #[test]
    fn out_of_bounds_and_short_payloads() {
        let mut win = window(16);
        let dt = Datatype::contiguous::<u64>();
        assert!(matches!(
            win.put(&hdr(8, 2, 0, dt), &to_bytes(&[1u64, 2])),
            Err(RmaError::InvalidArgument(_))
        ));
        assert_eq!(
            win.put(&hdr(0, 2, 0, dt), &to_bytes(&[1u64])),
            Err(RmaError::PayloadMismatch {
                expected: 16,
                received: 8
            })
        );
        assert!(win.read_bytes(12, 8).is_err());
    }

    #[test]
    fn global_pools_follow_window_lifetime() {
        let mut reg = WindowRegistry::new();
        assert!(!reg.has_global_pools());
        let a = reg.register(window(8), 4, 4);
        let b = reg.register(window(8), 4, 4);
        assert_ne!(a, b);
        assert!(reg.has_global_pools());
        assert!(reg.split_mut(a).is_ok());

        assert!(reg.deregister(a).is_some());
        assert!(reg.has_global_pools());
        assert_eq!(reg.window_ids(), vec![b]);
        assert!(reg.deregister(b).is_some());
        assert!(!reg.has_global_pools());
        assert!(reg.is_empty());
        assert!(matches!(reg.window(a), Err(RmaError::UnknownWindow(_))));
    }
}
