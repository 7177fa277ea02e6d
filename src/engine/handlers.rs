//! Target side of the protocol: applying incoming operations to window memory, granting and
//! queueing locks, and feeding acknowledgements back into the origin's target states.
use tracing::{debug, trace, warn};

use super::{EngineInner, RecvSink};
use crate::error::{RmaError, RmaResult};
use crate::packet::{Packet, PktFlags};
use crate::target::AccessState;
use crate::transport::{send_packet, TransportEvent};
use crate::window::WinId;

impl EngineInner {
    pub(crate) fn handle_event(&mut self, event: TransportEvent) -> RmaResult<()> {
        match event {
            TransportEvent::SendComplete { token } => {
                self.requests.send_complete(token);
                Ok(())
            }
            TransportEvent::SendFailed {
                dest,
                token,
                reason,
            } => {
                warn!("send to {} failed: {}", dest, reason);
                if let Some(token) = token {
                    self.requests.send_failed(token);
                }
                for win in self.registry.window_ids() {
                    let err = RmaError::TargetFailed {
                        rank: dest,
                        reason: reason.clone(),
                    };
                    self.with_target(win, dest, false, |target, ctx| {
                        target.fail(ctx, err);
                        Ok(())
                    })?;
                }
                Ok(())
            }
            TransportEvent::Packet { src, packet, data } => {
                let pkt = Packet::decode(&packet)?;
                self.handle_packet(src, pkt, data)
            }
            TransportEvent::Data { src, data } => self.handle_data(src, data),
        }
    }

    #[tracing::instrument(skip_all, level = "trace", fields(src = src))]
    fn handle_packet(&mut self, src: usize, pkt: Packet, data: Vec<u8>) -> RmaResult<()> {
        if self.recvs.contains_key(&src) {
            // the previous packet from src still expects payload
            return Err(RmaError::PayloadMismatch {
                expected: 0,
                received: data.len(),
            });
        }
        let declared = pkt.data_len();
        if data.len() > declared {
            return Err(RmaError::PayloadMismatch {
                expected: declared,
                received: data.len(),
            });
        }
        trace!("{:?} from {} with {} of {} bytes", pkt.kind(), src, data.len(), declared);
        let win = pkt.win();
        match pkt {
            Packet::Put(_)
            | Packet::Get { .. }
            | Packet::Accumulate { .. }
            | Packet::GetAccumulate { .. }
            | Packet::CompareAndSwap { .. } => self.handle_op_packet(src, pkt, data),
            Packet::GetResp { .. } if data.len() < declared => {
                self.recvs.insert(
                    src,
                    RecvSink::Assemble {
                        pkt,
                        buf: data,
                        lock_granted: false,
                    },
                );
                Ok(())
            }
            Packet::GetResp { token, .. } => self.requests.response(token, &data),
            Packet::Lock { .. } | Packet::Unlock { .. } | Packet::Flush { .. }
                if self.registry.window(win)?.rejected.contains(&src) =>
            {
                trace!("{:?} from rejected origin {} on window {} dropped", pkt.kind(), src, win);
                Ok(())
            }
            Packet::Lock { lock_type, .. } => {
                let window = self.window_mut(win)?;
                if window.lock_queue.is_empty() && window.lock.try_acquire(src, lock_type) {
                    self.grant_lock(win, src)
                } else {
                    debug!("{:?} lock from {} on window {} queued", lock_type, src, win);
                    window.lock_queue.push(src, pkt, data, 0)?;
                    Ok(())
                }
            }
            Packet::Unlock { ack, .. } => {
                self.window_mut(win)?.lock.release(src)?;
                if ack {
                    self.ack(win, src, PktFlags::UNLOCK_ACK)?;
                }
                self.replay_lock_queue(win)
            }
            Packet::Flush { .. } => self.ack(win, src, PktFlags::FLUSH_ACK),
            Packet::Complete { .. } => {
                self.window_mut(win)?.epoch_completions += 1;
                Ok(())
            }
            Packet::Ack { flags, .. } => {
                self.stats.acks_received += 1;
                self.with_target(win, src, false, |target, ctx| {
                    if target.access_state == AccessState::Failed {
                        trace!("{:?} from failed target {} dropped", flags, src);
                        return Ok(());
                    }
                    if flags.contains(PktFlags::OP_REJECTED) {
                        target.fail(
                            ctx,
                            RmaError::TargetFailed {
                                rank: src,
                                reason: "the target window rejected an operation".to_owned(),
                            },
                        );
                        return Ok(());
                    }
                    target.handle_ack(flags)?;
                    target.make_progress(ctx)
                })?
                .ok_or(RmaError::invalid_state(
                    src,
                    "acknowledgement for a target without synchronization state",
                ))
            }
        }
    }

    /// Operation packets: grant or queue a piggybacked lock, then apply once the payload is in.
    fn handle_op_packet(&mut self, src: usize, pkt: Packet, data: Vec<u8>) -> RmaResult<()> {
        let win = pkt.win();
        let declared = pkt.data_len();
        let complete = data.len() == declared;
        let mut lock_granted = false;
        if let Some(lock_type) = pkt.flags().lock_type() {
            let window = self.window_mut(win)?;
            let applicable = !window.rejected.contains(&src)
                && pkt
                    .op_header()
                    .map_or(false, |hdr| window.check_access(hdr).is_ok());
            if !applicable {
                // never granted, applying it rejects the operation
                debug!("{:?} from {} on window {} cannot be applied", pkt.kind(), src, win);
            } else if window.lock_queue.is_empty() && window.lock.try_acquire(src, lock_type) {
                lock_granted = true;
            } else {
                debug!(
                    "{:?} with {:?} lock from {} on window {} queued",
                    pkt.kind(),
                    lock_type,
                    src,
                    win
                );
                let id = window.lock_queue.push(src, pkt, data, declared)?;
                if !complete {
                    self.recvs.insert(src, RecvSink::Queued { win, id });
                }
                return Ok(());
            }
        }
        if !complete {
            self.recvs.insert(
                src,
                RecvSink::Assemble {
                    pkt,
                    buf: data,
                    lock_granted,
                },
            );
            return Ok(());
        }
        self.dispatch_op(src, pkt, &data, lock_granted)
    }

    fn handle_data(&mut self, src: usize, chunk: Vec<u8>) -> RmaResult<()> {
        let Some(sink) = self.recvs.get_mut(&src) else {
            return Err(RmaError::PayloadMismatch {
                expected: 0,
                received: chunk.len(),
            });
        };
        match sink {
            RecvSink::Assemble { pkt, buf, .. } => {
                let declared = pkt.data_len();
                if buf.len() + chunk.len() > declared {
                    return Err(RmaError::PayloadMismatch {
                        expected: declared,
                        received: buf.len() + chunk.len(),
                    });
                }
                buf.extend_from_slice(&chunk);
                if buf.len() < declared {
                    return Ok(());
                }
                let Some(RecvSink::Assemble {
                    pkt,
                    buf,
                    lock_granted,
                }) = self.recvs.remove(&src)
                else {
                    return Err(RmaError::internal("payload sink changed while assembling"));
                };
                match pkt {
                    Packet::GetResp { token, .. } => self.requests.response(token, &buf),
                    pkt => self.dispatch_op(src, pkt, &buf, lock_granted),
                }
            }
            RecvSink::Queued { win, id } => {
                let (win, id) = (*win, *id);
                let done = {
                    let entry = self
                        .window_mut(win)?
                        .lock_queue
                        .get_mut(id)
                        .ok_or(RmaError::internal("lock queue entry vanished while receiving"))?;
                    entry.append(&chunk)?;
                    entry.all_data_received
                };
                if done {
                    self.recvs.remove(&src);
                    self.replay_lock_queue(win)?;
                }
                Ok(())
            }
        }
    }

    fn dispatch_op(
        &mut self,
        src: usize,
        pkt: Packet,
        data: &[u8],
        lock_granted: bool,
    ) -> RmaResult<()> {
        let win = pkt.win();
        if self.process_op(src, &pkt, data, lock_granted)? {
            self.replay_lock_queue(win)?;
        }
        Ok(())
    }

    /// Applies one operation to the window and answers it. Returns true if it released a lock.
    fn process_op(
        &mut self,
        src: usize,
        pkt: &Packet,
        data: &[u8],
        lock_granted: bool,
    ) -> RmaResult<bool> {
        let win = pkt.win();
        let window = self.window_mut(win)?;
        if window.rejected.contains(&src) {
            trace!("{:?} from rejected origin {} on window {} dropped", pkt.kind(), src, win);
            return Ok(window.lock.release(src).is_ok());
        }
        let applied = match pkt {
            Packet::Put(hdr) => window.put(hdr, data).map(|_| (hdr.flags, None)),
            Packet::Get { hdr, token } => window
                .read(hdr)
                .map(|bytes| (hdr.flags, Some((*token, bytes)))),
            Packet::Accumulate { hdr, op } => window
                .accumulate(hdr, *op, data)
                .map(|_| (hdr.flags, None)),
            Packet::GetAccumulate { hdr, op, token } => window
                .accumulate(hdr, *op, data)
                .map(|prev| (hdr.flags, Some((*token, prev)))),
            Packet::CompareAndSwap {
                hdr,
                token,
                origin,
                compare,
            } => window
                .compare_and_swap(hdr, origin, compare)
                .map(|old| (hdr.flags, Some((*token, old)))),
            _ => return Err(RmaError::internal("not an operation packet")),
        };
        let (flags, response) = match applied {
            Ok(applied) => applied,
            Err(RmaError::InvalidArgument(reason)) => return self.reject_op(src, win, &reason),
            Err(err) => return Err(err),
        };

        let mut ack = PktFlags::NONE;
        if lock_granted {
            ack.insert(PktFlags::LOCK_GRANTED);
        }
        if flags.contains(PktFlags::FLUSH) {
            ack.insert(PktFlags::FLUSH_ACK);
        }
        let mut released = false;
        if flags.contains(PktFlags::UNLOCK) {
            window.lock.release(src)?;
            ack.insert(PktFlags::UNLOCK_ACK);
            released = true;
        }

        if let Some((token, bytes)) = response {
            let resp = Packet::GetResp {
                win,
                token,
                data_len: bytes.len(),
            };
            self.reply(src, &resp, Some(&bytes))?;
        }
        if !ack.is_empty() {
            self.ack(win, src, ack)?;
        }
        Ok(released)
    }

    /// Grants queued requests in arrival order for as long as the lock allows.
    fn replay_lock_queue(&mut self, win: WinId) -> RmaResult<()> {
        loop {
            let window = self.window_mut(win)?;
            let Some(entry) = window.lock_queue.pop_grantable(&mut window.lock) else {
                return Ok(());
            };
            debug!(
                "replaying {:?} from {} on window {}",
                entry.pkt.kind(),
                entry.source,
                win
            );
            match entry.pkt {
                Packet::Lock { .. } => self.grant_lock(win, entry.source)?,
                pkt => {
                    // a replayed unlock frees the lock again, the loop picks that up
                    self.process_op(entry.source, &pkt, &entry.data, true)?;
                }
            }
        }
    }

    /// An operation the window cannot apply: `src` loses whatever lock it holds here and is told so.
    /// Returns true if a lock was released.
    fn reject_op(&mut self, src: usize, win: WinId, reason: &str) -> RmaResult<bool> {
        warn!("operation from {} on window {} rejected: {}", src, win, reason);
        let window = self.window_mut(win)?;
        let released = window.lock.release(src).is_ok();
        window.rejected.push(src);
        self.ack(win, src, PktFlags::OP_REJECTED)?;
        Ok(released)
    }

    fn grant_lock(&mut self, win: WinId, origin: usize) -> RmaResult<()> {
        self.ack(win, origin, PktFlags::LOCK_GRANTED)
    }

    fn ack(&mut self, win: WinId, dest: usize, flags: PktFlags) -> RmaResult<()> {
        let pkt = Packet::Ack {
            win,
            source: self.rank,
            flags,
        };
        self.reply(dest, &pkt, None)
    }

    /// Target side replies; a dead origin is logged, the failure event itself fails its state.
    fn reply(&mut self, dest: usize, pkt: &Packet, payload: Option<&[u8]>) -> RmaResult<()> {
        match send_packet(&self.transport, dest, pkt, payload, None) {
            Err(RmaError::TargetFailed { rank, reason }) => {
                warn!("{:?} reply to {} dropped: {}", pkt.kind(), rank, reason);
                Ok(())
            }
            res => res,
        }
    }
}
