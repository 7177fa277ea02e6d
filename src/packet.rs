use serde::{Deserialize, Serialize};

use crate::datatype::{AccOp, Datatype};
use crate::error::RmaResult;
use crate::request::ReqToken;
use crate::target::LockType;
use crate::window::WinId;

/// Bit flags carried by operation and acknowledgement packets.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct PktFlags(u8);

impl PktFlags {
    pub(crate) const NONE: PktFlags = PktFlags(0);
    pub(crate) const LOCK_SHARED: PktFlags = PktFlags(1 << 0);
    pub(crate) const LOCK_EXCLUSIVE: PktFlags = PktFlags(1 << 1);
    pub(crate) const FLUSH: PktFlags = PktFlags(1 << 2);
    pub(crate) const UNLOCK: PktFlags = PktFlags(1 << 3);
    pub(crate) const LOCK_GRANTED: PktFlags = PktFlags(1 << 4);
    pub(crate) const FLUSH_ACK: PktFlags = PktFlags(1 << 5);
    pub(crate) const UNLOCK_ACK: PktFlags = PktFlags(1 << 6);
    /// the target could not apply an operation, its lock (if any) was dropped
    pub(crate) const OP_REJECTED: PktFlags = PktFlags(1 << 7);

    pub(crate) fn contains(self, other: PktFlags) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub(crate) fn insert(&mut self, other: PktFlags) {
        self.0 |= other.0;
    }

    pub(crate) fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub(crate) fn with_lock(lock_type: LockType) -> PktFlags {
        match lock_type {
            LockType::None => PktFlags::NONE,
            LockType::Shared => PktFlags::LOCK_SHARED,
            LockType::Exclusive => PktFlags::LOCK_EXCLUSIVE,
        }
    }

    /// the lock requested by a piggybacked lock flag, if any
    pub(crate) fn lock_type(self) -> Option<LockType> {
        if self.contains(PktFlags::LOCK_EXCLUSIVE) {
            Some(LockType::Exclusive)
        } else if self.contains(PktFlags::LOCK_SHARED) {
            Some(LockType::Shared)
        } else {
            None
        }
    }
}

impl std::ops::BitOr for PktFlags {
    type Output = PktFlags;
    fn bitor(self, rhs: PktFlags) -> PktFlags {
        PktFlags(self.0 | rhs.0)
    }
}

/// Common header of every data moving packet.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub(crate) struct OpHeader {
    pub(crate) win: WinId,
    pub(crate) source: usize,
    pub(crate) disp: usize,
    pub(crate) count: usize,
    /// index of the first element carried, non zero only for streamed units
    pub(crate) stream_offset: usize,
    pub(crate) datatype: Datatype,
    pub(crate) flags: PktFlags,
    /// payload bytes that follow the header
    pub(crate) data_len: usize,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub(crate) enum Packet {
    Put(OpHeader),
    Get {
        hdr: OpHeader,
        token: ReqToken,
    },
    Accumulate {
        hdr: OpHeader,
        op: AccOp,
    },
    GetAccumulate {
        hdr: OpHeader,
        op: AccOp,
        token: ReqToken,
    },
    CompareAndSwap {
        hdr: OpHeader,
        token: ReqToken,
        #[serde(with = "serde_bytes")]
        origin: Vec<u8>,
        #[serde(with = "serde_bytes")]
        compare: Vec<u8>,
    },
    GetResp {
        win: WinId,
        token: ReqToken,
        data_len: usize,
    },
    Lock {
        win: WinId,
        source: usize,
        lock_type: LockType,
    },
    Unlock {
        win: WinId,
        source: usize,
        ack: bool,
    },
    Flush {
        win: WinId,
        source: usize,
    },
    Complete {
        win: WinId,
        source: usize,
    },
    Ack {
        win: WinId,
        source: usize,
        flags: PktFlags,
    },
}

/// Coarse packet kind, used for logging and by the loopback packet log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    Put,
    Get,
    Accumulate,
    GetAccumulate,
    CompareAndSwap,
    GetResp,
    Lock,
    Unlock,
    Flush,
    Complete,
    Ack,
}

impl Packet {
    pub(crate) fn kind(&self) -> PacketKind {
        match self {
            Packet::Put(_) => PacketKind::Put,
            Packet::Get { .. } => PacketKind::Get,
            Packet::Accumulate { .. } => PacketKind::Accumulate,
            Packet::GetAccumulate { .. } => PacketKind::GetAccumulate,
            Packet::CompareAndSwap { .. } => PacketKind::CompareAndSwap,
            Packet::GetResp { .. } => PacketKind::GetResp,
            Packet::Lock { .. } => PacketKind::Lock,
            Packet::Unlock { .. } => PacketKind::Unlock,
            Packet::Flush { .. } => PacketKind::Flush,
            Packet::Complete { .. } => PacketKind::Complete,
            Packet::Ack { .. } => PacketKind::Ack,
        }
    }

    pub(crate) fn win(&self) -> WinId {
        match self {
            Packet::Put(hdr)
            | Packet::Get { hdr, .. }
            | Packet::Accumulate { hdr, .. }
            | Packet::GetAccumulate { hdr, .. }
            | Packet::CompareAndSwap { hdr, .. } => hdr.win,
            Packet::GetResp { win, .. }
            | Packet::Lock { win, .. }
            | Packet::Unlock { win, .. }
            | Packet::Flush { win, .. }
            | Packet::Complete { win, .. }
            | Packet::Ack { win, .. } => *win,
        }
    }

    pub(crate) fn op_header(&self) -> Option<&OpHeader> {
        match self {
            Packet::Put(hdr)
            | Packet::Get { hdr, .. }
            | Packet::Accumulate { hdr, .. }
            | Packet::GetAccumulate { hdr, .. }
            | Packet::CompareAndSwap { hdr, .. } => Some(hdr),
            _ => None,
        }
    }

    pub(crate) fn op_header_mut(&mut self) -> Option<&mut OpHeader> {
        match self {
            Packet::Put(hdr)
            | Packet::Get { hdr, .. }
            | Packet::Accumulate { hdr, .. }
            | Packet::GetAccumulate { hdr, .. }
            | Packet::CompareAndSwap { hdr, .. } => Some(hdr),
            _ => None,
        }
    }

    /// flags carried by the packet, acks report their ack flags
    pub(crate) fn flags(&self) -> PktFlags {
        match self {
            Packet::Ack { flags, .. } => *flags,
            Packet::Lock { lock_type, .. } => PktFlags::with_lock(*lock_type),
            _ => self.op_header().map(|h| h.flags).unwrap_or_default(),
        }
    }

    /// number of payload bytes the sender declared for this packet
    pub(crate) fn data_len(&self) -> usize {
        match self {
            Packet::GetResp { data_len, .. } => *data_len,
            _ => self.op_header().map(|h| h.data_len).unwrap_or(0),
        }
    }

    pub(crate) fn encode(&self) -> RmaResult<Vec<u8>> {
        Ok(crate::serialize(self)?)
    }

    pub(crate) fn decode(bytes: &[u8]) -> RmaResult<Packet> {
        Ok(crate::deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(flags: PktFlags) -> OpHeader {
        OpHeader {
            win: 3,
            source: 1,
            disp: 16,
            count: 2,
            stream_offset: 0,
            datatype: Datatype::contiguous::<i64>(),
            flags,
            data_len: 16,
        }
    }

    #[test]
    fn flags_combine() {
        let flags = PktFlags::with_lock(LockType::Shared) | PktFlags::UNLOCK;
        assert_eq!(flags.lock_type(), Some(LockType::Shared));
        assert!(flags.contains(PktFlags::UNLOCK));
        assert!(!flags.contains(PktFlags::FLUSH));
        assert!(!flags.contains(PktFlags::NONE));
        assert_eq!(PktFlags::FLUSH.lock_type(), None);
    }

    #[test]
    fn cas_operands_survive_the_wire() {
        let pkt = Packet::CompareAndSwap {
            hdr: header(PktFlags::LOCK_EXCLUSIVE),
            token: 42,
            origin: vec![1, 2, 3, 4],
            compare: vec![5, 6, 7, 8],
        };
        let decoded = Packet::decode(&pkt.encode().unwrap()).unwrap();
        assert_eq!(decoded, pkt);
        assert_eq!(decoded.kind(), PacketKind::CompareAndSwap);
        assert_eq!(decoded.flags().lock_type(), Some(LockType::Exclusive));
    }

    #[test]
    fn truncated_packet_is_a_codec_error() {
        let bytes = Packet::Put(header(PktFlags::NONE)).encode().unwrap();
        let err = Packet::decode(&bytes[..bytes.len() / 2]).unwrap_err();
        assert!(matches!(err, crate::RmaError::Codec(_)));
    }
}
