use std::cell::RefCell;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::queue::SegQueue;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{Transport, TransportEvent};
use crate::error::{RmaError, RmaResult};
use crate::packet::{Packet, PacketKind, PktFlags};
use crate::request::ReqToken;

#[derive(Debug, Clone, Copy)]
pub struct LoopbackOptions {
    /// largest payload chunk delivered with a packet, the rest follows as `Data` events
    pub eager_limit: usize,
    /// hold send completions back and release them in a seeded random order
    pub reorder_seed: Option<u64>,
}

impl Default for LoopbackOptions {
    fn default() -> Self {
        LoopbackOptions {
            eager_limit: 65536,
            reorder_seed: None,
        }
    }
}

/// One packet as it went over the loopback fabric.
#[derive(Debug, Clone, PartialEq)]
pub struct PacketRecord {
    pub src: usize,
    pub dest: usize,
    pub kind: PacketKind,
    pub(crate) flags: PktFlags,
}

impl PacketRecord {
    /// a lock request, explicit or piggybacked
    pub fn requests_lock(&self) -> bool {
        self.kind == PacketKind::Lock
            || (self.kind != PacketKind::Ack && self.flags.lock_type().is_some())
    }

    pub fn requests_flush(&self) -> bool {
        self.kind == PacketKind::Flush
            || (self.kind != PacketKind::Ack && self.flags.contains(PktFlags::FLUSH))
    }

    pub fn requests_unlock(&self) -> bool {
        self.kind == PacketKind::Unlock
            || (self.kind != PacketKind::Ack && self.flags.contains(PktFlags::UNLOCK))
    }

    pub fn grants_lock(&self) -> bool {
        self.kind == PacketKind::Ack && self.flags.contains(PktFlags::LOCK_GRANTED)
    }

    pub fn rejects_op(&self) -> bool {
        self.kind == PacketKind::Ack && self.flags.contains(PktFlags::OP_REJECTED)
    }
}

struct FabricInner {
    inboxes: Vec<SegQueue<TransportEvent>>,
    options: LoopbackOptions,
    failed_links: Mutex<HashSet<(usize, usize)>>,
    log: Mutex<Vec<PacketRecord>>,
    bytes_sent: AtomicUsize,
}

/// In-process fabric connecting `num_ranks` endpoints.
///
/// Delivery is FIFO per (source, destination) pair. Each endpoint is driven by whoever owns it,
/// endpoints may live on different threads.
#[derive(Clone)]
pub struct LoopbackFabric {
    inner: Arc<FabricInner>,
}

impl LoopbackFabric {
    pub fn new(num_ranks: usize) -> LoopbackFabric {
        LoopbackFabric::with_options(num_ranks, LoopbackOptions::default())
    }

    pub fn with_options(num_ranks: usize, options: LoopbackOptions) -> LoopbackFabric {
        LoopbackFabric {
            inner: Arc::new(FabricInner {
                inboxes: (0..num_ranks).map(|_| SegQueue::new()).collect(),
                options,
                failed_links: Mutex::new(HashSet::new()),
                log: Mutex::new(Vec::new()),
                bytes_sent: AtomicUsize::new(0),
            }),
        }
    }

    pub fn num_ranks(&self) -> usize {
        self.inner.inboxes.len()
    }

    pub fn endpoint(&self, rank: usize) -> LoopbackEndpoint {
        assert!(
            rank < self.num_ranks(),
            "rank {} outside of a {} rank fabric",
            rank,
            self.num_ranks()
        );
        LoopbackEndpoint {
            rank,
            fabric: self.inner.clone(),
            held: RefCell::new(Vec::new()),
            rng: RefCell::new(self.inner.options.reorder_seed.map(StdRng::seed_from_u64)),
        }
    }

    /// Every later send from `src` to `dest` fails.
    pub fn fail_link(&self, src: usize, dest: usize) {
        self.inner.failed_links.lock().insert((src, dest));
    }

    /// Pushes a raw event into the inbox of `dest`.
    pub fn inject(&self, dest: usize, event: TransportEvent) {
        self.inner.inboxes[dest].push(event);
    }

    pub fn packet_log(&self) -> Vec<PacketRecord> {
        self.inner.log.lock().clone()
    }

    pub fn clear_log(&self) {
        self.inner.log.lock().clear();
    }

    pub fn bytes_sent(&self) -> usize {
        self.inner.bytes_sent.load(Ordering::Relaxed)
    }
}

pub struct LoopbackEndpoint {
    rank: usize,
    fabric: Arc<FabricInner>,
    /// send completions not yet released (reordering only)
    held: RefCell<Vec<ReqToken>>,
    rng: RefCell<Option<StdRng>>,
}

impl LoopbackEndpoint {
    fn complete(&self, token: ReqToken) {
        if self.rng.borrow().is_some() {
            self.held.borrow_mut().push(token);
        } else {
            self.fabric.inboxes[self.rank].push(TransportEvent::SendComplete { token });
        }
    }

    fn release_held(&self) -> Option<TransportEvent> {
        let mut held = self.held.borrow_mut();
        if held.is_empty() {
            return None;
        }
        let mut guard = self.rng.borrow_mut();
        let rng = guard.as_mut()?;
        let inbox_empty = self.fabric.inboxes[self.rank].is_empty();
        if !inbox_empty && rng.gen_bool(0.5) {
            return None;
        }
        let i = rng.gen_range(0..held.len());
        Some(TransportEvent::SendComplete {
            token: held.swap_remove(i),
        })
    }
}

impl Transport for LoopbackEndpoint {
    fn rank(&self) -> usize {
        self.rank
    }

    fn num_ranks(&self) -> usize {
        self.fabric.inboxes.len()
    }

    fn submit(
        &self,
        dest: usize,
        packet: &[u8],
        payload: Option<&[u8]>,
        token: Option<ReqToken>,
    ) -> RmaResult<()> {
        let Some(inbox) = self.fabric.inboxes.get(dest) else {
            return Err(RmaError::TargetFailed {
                rank: dest,
                reason: format!("no rank {} on a {} rank fabric", dest, self.num_ranks()),
            });
        };
        if self.fabric.failed_links.lock().contains(&(self.rank, dest)) {
            self.fabric.inboxes[self.rank].push(TransportEvent::SendFailed {
                dest,
                token,
                reason: format!("link {} -> {} is down", self.rank, dest),
            });
            return Ok(());
        }
        if let Ok(pkt) = Packet::decode(packet) {
            self.fabric.log.lock().push(PacketRecord {
                src: self.rank,
                dest,
                kind: pkt.kind(),
                flags: pkt.flags(),
            });
        }
        let payload = payload.unwrap_or(&[]);
        self.fabric
            .bytes_sent
            .fetch_add(packet.len() + payload.len(), Ordering::Relaxed);

        let mut chunks = payload.chunks(self.fabric.options.eager_limit.max(1));
        inbox.push(TransportEvent::Packet {
            src: self.rank,
            packet: packet.to_vec(),
            data: chunks.next().map(|c| c.to_vec()).unwrap_or_default(),
        });
        for chunk in chunks {
            inbox.push(TransportEvent::Data {
                src: self.rank,
                data: chunk.to_vec(),
            });
        }
        if let Some(token) = token {
            self.complete(token);
        }
        Ok(())
    }

    fn poll(&self) -> Option<TransportEvent> {
        if let Some(event) = self.release_held() {
            return Some(event);
        }
        self.fabric.inboxes[self.rank]
            .pop()
            .or_else(|| self.release_held())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flush_pkt(source: usize) -> Vec<u8> {
        Packet::Flush { win: 0, source }.encode().unwrap()
    }

    #[test]
    fn payload_is_chunked_in_order() {
        let fabric = LoopbackFabric::with_options(
            2,
            LoopbackOptions {
                eager_limit: 4,
                reorder_seed: None,
            },
        );
        let a = fabric.endpoint(0);
        let b = fabric.endpoint(1);
        let payload: Vec<u8> = (0..10).collect();
        a.submit(1, &flush_pkt(0), Some(&payload), Some(7)).unwrap();

        match b.poll() {
            Some(TransportEvent::Packet { src: 0, data, .. }) => assert_eq!(data, vec![0, 1, 2, 3]),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            b.poll(),
            Some(TransportEvent::Data {
                src: 0,
                data: vec![4, 5, 6, 7]
            })
        );
        assert_eq!(b.poll(), Some(TransportEvent::Data { src: 0, data: vec![8, 9] }));
        assert_eq!(b.poll(), None);
        assert_eq!(a.poll(), Some(TransportEvent::SendComplete { token: 7 }));
        assert_eq!(fabric.packet_log().len(), 1);
        assert!(fabric.packet_log()[0].requests_flush());
    }

    #[test]
    fn failed_link_reports_to_sender() {
        let fabric = LoopbackFabric::new(2);
        fabric.fail_link(0, 1);
        let a = fabric.endpoint(0);
        a.submit(1, &flush_pkt(0), None, Some(3)).unwrap();
        assert!(matches!(
            a.poll(),
            Some(TransportEvent::SendFailed {
                dest: 1,
                token: Some(3),
                ..
            })
        ));
        assert_eq!(fabric.endpoint(1).poll(), None);
        assert!(a.submit(5, &flush_pkt(0), None, None).is_err());
    }

    #[test]
    fn reordered_completions_all_arrive() {
        let fabric = LoopbackFabric::with_options(
            1,
            LoopbackOptions {
                eager_limit: 64,
                reorder_seed: Some(11),
            },
        );
        let a = fabric.endpoint(0);
        for token in 0..8 {
            a.submit(0, &flush_pkt(0), None, Some(token)).unwrap();
        }
        let mut tokens = vec![];
        let mut packets = 0;
        while let Some(event) = a.poll() {
            match event {
                TransportEvent::SendComplete { token } => tokens.push(token),
                TransportEvent::Packet { .. } => packets += 1,
                other => panic!("unexpected {:?}", other),
            }
        }
        tokens.sort_unstable();
        assert_eq!(tokens, (0..8).collect::<Vec<_>>());
        assert_eq!(packets, 8);
    }
}
