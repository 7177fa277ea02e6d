//! Operation records and the ordered lists that hold them.
use std::collections::VecDeque;

use crate::datatype::{to_bytes, AccOp, Datatype, DatatypeClass, Element};
use crate::error::{RmaError, RmaResult};
use crate::packet::{OpHeader, Packet, PktFlags};
use crate::pool::Handle;
use crate::request::{ReqToken, RequestStatus, RequestTable, ResultBuf, RmaRequest};
use crate::target::LockType;
use crate::window::WinId;

pub(crate) type OpHandle = Handle<OpRecord>;

/// Packed origin data of a put, accumulate, get-accumulate or compare-and-swap.
#[derive(Debug, Clone)]
pub struct OriginSpec {
    pub data: Vec<u8>,
    pub count: usize,
    pub datatype: Datatype,
}

impl OriginSpec {
    pub fn from_slice<T: Element>(vals: &[T]) -> OriginSpec {
        OriginSpec {
            data: to_bytes(vals),
            count: vals.len(),
            datatype: Datatype::contiguous::<T>(),
        }
    }
}

/// Where in the target window an operation lands, `disp` is in bytes.
#[derive(Debug, Clone, Copy)]
pub struct TargetSpec {
    pub disp: usize,
    pub count: usize,
    pub datatype: Datatype,
}

impl TargetSpec {
    pub fn new<T: Element>(disp: usize, count: usize) -> TargetSpec {
        TargetSpec {
            disp,
            count,
            datatype: Datatype::contiguous::<T>(),
        }
    }

    pub fn with_datatype(disp: usize, count: usize, datatype: Datatype) -> TargetSpec {
        TargetSpec {
            disp,
            count,
            datatype,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompareSpec {
    pub data: Vec<u8>,
    pub datatype: Datatype,
}

impl CompareSpec {
    pub fn from_value<T: Element>(val: T) -> CompareSpec {
        CompareSpec {
            data: to_bytes(&[val]),
            datatype: Datatype::contiguous::<T>(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResultSpec {
    pub buf: ResultBuf,
    pub count: usize,
    pub datatype: Datatype,
}

impl ResultSpec {
    /// a zeroed result buffer for `count` elements of `T`
    pub fn new<T: Element>(count: usize) -> ResultSpec {
        ResultSpec {
            buf: ResultBuf::zeroed(count * T::ELEM.size()),
            count,
            datatype: Datatype::contiguous::<T>(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Put,
    Get,
    Accumulate(AccOp),
    GetAccumulate(AccOp),
    CompareAndSwap,
}

impl OpKind {
    /// operations with remote side effects, everything except a get
    pub(crate) fn is_write_class(&self) -> bool {
        !matches!(self, OpKind::Get)
    }

    pub(crate) fn fetches(&self) -> bool {
        matches!(
            self,
            OpKind::Get | OpKind::GetAccumulate(_) | OpKind::CompareAndSwap
        )
    }

    fn name(&self) -> &'static str {
        match self {
            OpKind::Put => "put",
            OpKind::Get => "get",
            OpKind::Accumulate(_) => "accumulate",
            OpKind::GetAccumulate(_) => "get_accumulate",
            OpKind::CompareAndSwap => "compare_and_swap",
        }
    }
}

/// Which issued list an operation moves to once it leaves the pending list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpClass {
    Read,
    Write,
    Derived,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Completion {
    None,
    Single(ReqToken),
    Multi(Vec<ReqToken>),
}

/// Streaming progress: how many units went out, or `All`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IssuedStream {
    Units(usize),
    All,
}

/// Everything a caller hands over when enqueueing an operation.
pub(crate) struct OpArgs {
    pub(crate) kind: OpKind,
    pub(crate) origin: Option<OriginSpec>,
    pub(crate) compare: Option<CompareSpec>,
    pub(crate) result: Option<ResultSpec>,
    pub(crate) target: TargetSpec,
}

fn invalid(msg: String) -> RmaError {
    RmaError::InvalidArgument(msg)
}

impl OpArgs {
    /// Reject malformed buffers before anything is queued.
    pub(crate) fn validate(&self, win_size: usize) -> RmaResult<()> {
        let target = &self.target;
        target.datatype.validate()?;
        let elem = target.datatype.elem();
        let name = self.kind.name();
        if let Some(origin) = &self.origin {
            if origin.datatype.class() == DatatypeClass::Derived {
                return Err(invalid(format!("{name}: origin data must be packed")));
            }
            if origin.datatype.elem() != elem {
                return Err(invalid(format!(
                    "{name}: origin element {:?} does not match target element {:?}",
                    origin.datatype.elem(),
                    elem
                )));
            }
            if origin.data.len() != origin.count * elem.size() {
                return Err(invalid(format!(
                    "{name}: origin holds {} bytes for {} elements",
                    origin.data.len(),
                    origin.count
                )));
            }
            if origin.count != target.count {
                return Err(invalid(format!(
                    "{name}: origin count {} != target count {}",
                    origin.count, target.count
                )));
            }
        } else if self.kind != OpKind::Get {
            return Err(invalid(format!("{name}: missing origin buffer")));
        }
        if self.kind.fetches() {
            let result = self
                .result
                .as_ref()
                .ok_or_else(|| invalid(format!("{name}: missing result buffer")))?;
            if result.datatype.elem() != elem || result.count != target.count {
                return Err(invalid(format!("{name}: result does not match target")));
            }
            if result.buf.len() < result.count * elem.size() {
                return Err(invalid(format!("{name}: result buffer too small")));
            }
        }
        match self.kind {
            OpKind::Accumulate(op) | OpKind::GetAccumulate(op) if !op.valid_for(elem) => {
                return Err(invalid(format!("{name}: {:?} is not defined for {:?}", op, elem)));
            }
            OpKind::CompareAndSwap => {
                let compare = self
                    .compare
                    .as_ref()
                    .ok_or_else(|| invalid(format!("{name}: missing compare buffer")))?;
                if target.count != 1 || target.datatype.class() == DatatypeClass::Derived {
                    return Err(invalid(format!("{name}: exactly one basic element")));
                }
                if compare.datatype.elem() != elem || compare.data.len() != elem.size() {
                    return Err(invalid(format!("{name}: compare does not match target")));
                }
            }
            _ => {}
        }
        let end = target.disp + target.datatype.extent(target.count);
        if end > win_size {
            return Err(invalid(format!(
                "{name}: bytes {}..{} outside of a {} byte window",
                target.disp, end, win_size
            )));
        }
        Ok(())
    }
}

/// Limits that shape a record when it is created.
#[derive(Debug, Clone, Copy)]
pub(crate) struct OpLimits {
    pub(crate) stream_unit_size: usize,
    pub(crate) piggyback_lock_data_size: usize,
}

pub(crate) struct OpRecord {
    pub(crate) kind: OpKind,
    pub(crate) dt_class: DatatypeClass,
    pub(crate) origin: Option<OriginSpec>,
    pub(crate) result: Option<ResultSpec>,
    pub(crate) target: TargetSpec,
    /// header template, flags and tokens are filled in at issue time
    pub(crate) pkt: Packet,
    /// lock held for the target when the operation was enqueued
    pub(crate) required_lock: LockType,
    pub(crate) piggyback_lock_candidate: bool,
    pub(crate) completion: Completion,
    pub(crate) reqs_size: usize,
    pub(crate) unit_elems: usize,
    pub(crate) issued_stream: IssuedStream,
    pub(crate) ureq: Option<RmaRequest>,
}

impl OpRecord {
    pub(crate) fn new(
        args: OpArgs,
        win: WinId,
        source: usize,
        required_lock: LockType,
        limits: OpLimits,
        ureq: Option<RmaRequest>,
    ) -> OpRecord {
        let OpArgs {
            kind,
            origin,
            compare,
            result,
            target,
        } = args;
        let elem_size = target.datatype.elem().size();
        let data_len = match kind {
            OpKind::Put | OpKind::Accumulate(_) | OpKind::GetAccumulate(_) => {
                origin.as_ref().map(|o| o.data.len()).unwrap_or(0)
            }
            OpKind::Get | OpKind::CompareAndSwap => 0,
        };
        let hdr = OpHeader {
            win,
            source,
            disp: target.disp,
            count: target.count,
            stream_offset: 0,
            datatype: target.datatype,
            flags: PktFlags::NONE,
            data_len,
        };
        let pkt = match kind {
            OpKind::Put => Packet::Put(hdr),
            OpKind::Get => Packet::Get { hdr, token: 0 },
            OpKind::Accumulate(op) => Packet::Accumulate { hdr, op },
            OpKind::GetAccumulate(op) => Packet::GetAccumulate { hdr, op, token: 0 },
            OpKind::CompareAndSwap => Packet::CompareAndSwap {
                hdr,
                token: 0,
                origin: origin.as_ref().map(|o| o.data.clone()).unwrap_or_default(),
                compare: compare.map(|c| c.data).unwrap_or_default(),
            },
        };

        let unit_elems = (limits.stream_unit_size / elem_size).max(1);
        let reqs_size = match kind {
            OpKind::Accumulate(_) | OpKind::GetAccumulate(_) => {
                ((target.count + unit_elems - 1) / unit_elems).max(1)
            }
            _ => 1,
        };
        let wire_bytes = data_len.max(target.count * elem_size);
        let dt_class = target.datatype.class();
        let piggyback_lock_candidate = limits.piggyback_lock_data_size > 0
            && reqs_size == 1
            && dt_class == DatatypeClass::Basic
            && wire_bytes <= limits.piggyback_lock_data_size;

        OpRecord {
            kind,
            dt_class,
            origin,
            result,
            target,
            pkt,
            required_lock,
            piggyback_lock_candidate,
            completion: Completion::None,
            reqs_size,
            unit_elems,
            issued_stream: IssuedStream::Units(0),
            ureq,
        }
    }

    pub(crate) fn class(&self) -> OpClass {
        if self.dt_class == DatatypeClass::Derived {
            OpClass::Derived
        } else if self.kind == OpKind::Get {
            OpClass::Read
        } else {
            OpClass::Write
        }
    }

    pub(crate) fn is_streamed(&self) -> bool {
        self.reqs_size > 1
    }

    /// `(first element, element count)` of every unit the operation is sent as
    pub(crate) fn units(&self) -> Vec<(usize, usize)> {
        let count = self.target.count;
        if !self.is_streamed() {
            return vec![(0, count)];
        }
        (0..self.reqs_size)
            .map(|i| {
                let start = i * self.unit_elems;
                (start, self.unit_elems.min(count - start))
            })
            .collect()
    }

    pub(crate) fn record_issue(&mut self, token: ReqToken) {
        self.completion = match std::mem::replace(&mut self.completion, Completion::None) {
            Completion::None if self.reqs_size <= 1 => Completion::Single(token),
            Completion::None => Completion::Multi(vec![token]),
            Completion::Single(first) => Completion::Multi(vec![first, token]),
            Completion::Multi(mut tokens) => {
                tokens.push(token);
                Completion::Multi(tokens)
            }
        };
        self.issued_stream = match self.issued_stream {
            IssuedStream::Units(n) if n + 1 < self.reqs_size => IssuedStream::Units(n + 1),
            _ => IssuedStream::All,
        };
    }

    pub(crate) fn tokens(&self) -> &[ReqToken] {
        match &self.completion {
            Completion::None => &[],
            Completion::Single(token) => std::slice::from_ref(token),
            Completion::Multi(tokens) => tokens,
        }
    }

    /// Complete only once every unit went out and every unit's request completed.
    pub(crate) fn local_status(&self, requests: &RequestTable) -> RequestStatus {
        let mut status = match self.issued_stream {
            IssuedStream::All => RequestStatus::Complete,
            IssuedStream::Units(_) => RequestStatus::Pending,
        };
        for token in self.tokens() {
            match requests.status(*token) {
                Some(RequestStatus::Failed) => return RequestStatus::Failed,
                Some(RequestStatus::Pending) => status = RequestStatus::Pending,
                Some(RequestStatus::Complete) | None => {}
            }
        }
        status
    }

    /// Hand the record's requests back and settle the user request, if any.
    pub(crate) fn retire(self, requests: &mut RequestTable, status: RequestStatus) {
        for token in self.tokens() {
            requests.free(*token);
        }
        if let Some(ureq) = &self.ureq {
            ureq.set(status);
        }
    }
}

/// Ordered list of operation handles.
#[derive(Debug, Default)]
pub(crate) struct OpList {
    ops: VecDeque<OpHandle>,
}

impl OpList {
    pub(crate) fn push_back(&mut self, op: OpHandle) {
        self.ops.push_back(op);
    }

    pub(crate) fn pop_front(&mut self) -> Option<OpHandle> {
        self.ops.pop_front()
    }

    pub(crate) fn front(&self) -> Option<OpHandle> {
        self.ops.front().copied()
    }

    /// moves every handle of `other` to the back of this list
    pub(crate) fn splice(&mut self, other: &mut OpList) {
        self.ops.append(&mut other.ops);
    }

    pub(crate) fn retain(&mut self, f: impl FnMut(&OpHandle) -> bool) {
        self.ops.retain(f);
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &OpHandle> {
        self.ops.iter()
    }

    pub(crate) fn len(&self) -> usize {
        self.ops.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}
