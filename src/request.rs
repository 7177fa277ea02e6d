use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::datatype::{from_bytes, Element};
use crate::error::{RmaError, RmaResult};
use crate::pool::{Arena, Handle, PoolKind};

/// Identifies one transport level request (a send, or a send awaiting a response).
pub type ReqToken = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    Complete,
    Failed,
}

/// Destination of fetched data (get, get-accumulate, compare-and-swap results).
#[derive(Debug, Clone, Default)]
pub struct ResultBuf {
    data: Rc<RefCell<Vec<u8>>>,
}

impl ResultBuf {
    pub fn zeroed(len: usize) -> ResultBuf {
        ResultBuf {
            data: Rc::new(RefCell::new(vec![0; len])),
        }
    }

    pub fn len(&self) -> usize {
        self.data.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.data.borrow().clone()
    }

    pub fn to_vec<T: Element>(&self) -> Vec<T> {
        from_bytes(&self.data.borrow())
    }

    pub(crate) fn write_at(&self, offset: usize, bytes: &[u8]) -> RmaResult<()> {
        let mut data = self.data.borrow_mut();
        if offset + bytes.len() > data.len() {
            return Err(RmaError::PayloadMismatch {
                expected: data.len().saturating_sub(offset),
                received: bytes.len(),
            });
        }
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}

/// Handle returned by the request based operations (`rput`, `rget`, ...).
///
/// Becomes `Complete` once the operation completed locally: the origin buffer may be reused and,
/// for fetching operations, the result buffer holds the fetched data.
#[derive(Debug, Clone)]
pub struct RmaRequest {
    status: Rc<Cell<RequestStatus>>,
    rank: usize,
}

impl RmaRequest {
    pub(crate) fn new(rank: usize) -> RmaRequest {
        RmaRequest {
            status: Rc::new(Cell::new(RequestStatus::Pending)),
            rank,
        }
    }

    /// target rank of the operation
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn status(&self) -> RequestStatus {
        self.status.get()
    }

    /// true once the operation has completed locally
    pub fn test(&self) -> bool {
        self.status.get() == RequestStatus::Complete
    }

    pub(crate) fn set(&self, status: RequestStatus) {
        self.status.set(status);
    }
}

pub(crate) struct Request {
    status: RequestStatus,
    awaits_response: bool,
    result: Option<(ResultBuf, usize)>,
}

/// Transport requests in flight, indexed by the token handed to `submit`.
pub(crate) struct RequestTable {
    reqs: Arena<Request>,
}

impl RequestTable {
    pub(crate) fn new() -> RequestTable {
        RequestTable {
            reqs: Arena::new("requests", PoolKind::Global, u32::MAX as usize),
        }
    }

    fn handle(token: ReqToken) -> Handle<Request> {
        Handle::from_bits(token, PoolKind::Global)
    }

    /// `result` is where response data lands, with its byte offset
    pub(crate) fn register(
        &mut self,
        awaits_response: bool,
        result: Option<(ResultBuf, usize)>,
    ) -> RmaResult<ReqToken> {
        let req = Request {
            status: RequestStatus::Pending,
            awaits_response,
            result,
        };
        match self.reqs.try_alloc(req) {
            Ok(h) => Ok(h.to_bits()),
            Err(_) => Err(RmaError::OutOfResources("request")),
        }
    }

    pub(crate) fn status(&self, token: ReqToken) -> Option<RequestStatus> {
        self.reqs.get(Self::handle(token)).map(|r| r.status)
    }

    pub(crate) fn send_complete(&mut self, token: ReqToken) {
        match self.reqs.get_mut(Self::handle(token)) {
            Some(req) if !req.awaits_response && req.status == RequestStatus::Pending => {
                req.status = RequestStatus::Complete;
            }
            Some(_) => {}
            None => tracing::trace!("send completion for retired request {token:x}"),
        }
    }

    pub(crate) fn send_failed(&mut self, token: ReqToken) {
        if let Some(req) = self.reqs.get_mut(Self::handle(token)) {
            req.status = RequestStatus::Failed;
        }
    }

    pub(crate) fn response(&mut self, token: ReqToken, data: &[u8]) -> RmaResult<()> {
        match self.reqs.get_mut(Self::handle(token)) {
            Some(req) => {
                if let Some((buf, offset)) = &req.result {
                    buf.write_at(*offset, data)?;
                }
                req.status = RequestStatus::Complete;
                Ok(())
            }
            None => {
                tracing::debug!("response for retired request {token:x} dropped");
                Ok(())
            }
        }
    }

    pub(crate) fn free(&mut self, token: ReqToken) {
        self.reqs.free(Self::handle(token));
    }

    #[cfg(test)]
    pub(crate) fn outstanding(&self) -> usize {
        self.reqs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_and_response_completion() {
        let mut table = RequestTable::new();
        let send = table.register(false, None).unwrap();
        let buf = ResultBuf::zeroed(8);
        let fetch = table.register(true, Some((buf.clone(), 4))).unwrap();

        table.send_complete(send);
        table.send_complete(fetch);
        assert_eq!(table.status(send), Some(RequestStatus::Complete));
        assert_eq!(table.status(fetch), Some(RequestStatus::Pending));

        table.response(fetch, &[1, 2, 3, 4]).unwrap();
        assert_eq!(table.status(fetch), Some(RequestStatus::Complete));
        assert_eq!(buf.to_bytes(), vec![0, 0, 0, 0, 1, 2, 3, 4]);

        table.free(send);
        table.free(fetch);
        assert_eq!(table.outstanding(), 0);
        assert_eq!(table.status(send), None);
    }

    #[test]
    fn oversized_response_rejected() {
        let mut table = RequestTable::new();
        let buf = ResultBuf::zeroed(4);
        let token = table.register(true, Some((buf, 0))).unwrap();
        let err = table.response(token, &[0; 8]).unwrap_err();
        assert_eq!(
            err,
            RmaError::PayloadMismatch {
                expected: 4,
                received: 8
            }
        );
    }
}
