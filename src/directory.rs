use tracing::trace;

use crate::error::{RmaError, RmaResult};
use crate::pool::PoolPair;
use crate::target::{AccessState, Target, TargetHandle};

#[derive(Debug, Default)]
struct Slot {
    targets: Vec<(usize, TargetHandle)>,
}

/// Rank hashed buckets of the targets a window currently tracks.
#[derive(Debug)]
pub(crate) struct Directory {
    slots: Vec<Slot>,
    len: usize,
}

impl Directory {
    /// `min(slots_size, num_ranks)` buckets, at least one
    pub(crate) fn new(slots_size: usize, num_ranks: usize) -> Directory {
        let num_slots = slots_size.min(num_ranks).max(1);
        Directory {
            slots: (0..num_slots).map(|_| Slot::default()).collect(),
            len: 0,
        }
    }

    fn slot(&self, rank: usize) -> &Slot {
        &self.slots[rank % self.slots.len()]
    }

    fn slot_mut(&mut self, rank: usize) -> &mut Slot {
        let n = self.slots.len();
        &mut self.slots[rank % n]
    }

    pub(crate) fn lookup(&self, rank: usize) -> Option<TargetHandle> {
        self.slot(rank)
            .targets
            .iter()
            .find(|(r, _)| *r == rank)
            .map(|(_, h)| *h)
    }

    pub(crate) fn insert(&mut self, rank: usize, target: TargetHandle) {
        self.slot_mut(rank).targets.push((rank, target));
        self.len += 1;
    }

    /// Existing target for `rank`, or a fresh idle one drawn from the window pool then the global pool.
    pub(crate) fn find_or_create(
        &mut self,
        rank: usize,
        pools: &mut PoolPair<Target>,
    ) -> RmaResult<TargetHandle> {
        if let Some(h) = self.lookup(rank) {
            return Ok(h);
        }
        let h = pools
            .alloc(Target::new(rank))
            .map_err(|_| RmaError::OutOfResources("target"))?;
        trace!("created target state for {} in {:?} pool", rank, h.pool());
        self.insert(rank, h);
        Ok(h)
    }

    /// Removes and frees the target for `rank` if it is idle and holds nothing.
    pub(crate) fn remove_if_reclaimable(
        &mut self,
        rank: usize,
        pools: &mut PoolPair<Target>,
    ) -> bool {
        let Some(h) = self.lookup(rank) else {
            return false;
        };
        let reclaimable = match pools.get(h) {
            Some(t) => t.access_state == AccessState::Idle && t.is_reclaimable(),
            None => true,
        };
        if reclaimable {
            self.slot_mut(rank).targets.retain(|(r, _)| *r != rank);
            self.len -= 1;
            pools.free(h);
            trace!("reclaimed target state for {}", rank);
        }
        reclaimable
    }

    pub(crate) fn entries(&self) -> Vec<(usize, TargetHandle)> {
        self.slots
            .iter()
            .flat_map(|s| s.targets.iter().copied())
            .collect()
    }

    /// Empties the directory, handing back every handle.
    pub(crate) fn drain(&mut self) -> Vec<(usize, TargetHandle)> {
        self.len = 0;
        self.slots
            .iter_mut()
            .flat_map(|s| s.targets.drain(..))
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[cfg(test)]
    pub(crate) fn num_slots(&self) -> usize {
        self.slots.len()
    }
}
