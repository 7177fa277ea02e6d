//! The seam between the engine and the network.
//!
//! The engine only ever hands encoded packets to a [Transport] and pulls [TransportEvent]s back out
//! of it, everything it knows about delivery comes through those events.
use enum_dispatch::enum_dispatch;
use tracing::trace;

use crate::error::RmaResult;
use crate::packet::Packet;
use crate::request::ReqToken;

pub(crate) mod loopback;
pub use loopback::{LoopbackEndpoint, LoopbackFabric, LoopbackOptions, PacketRecord};

/// Something the transport reports back to the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// an inbound packet with the first chunk of its payload
    Packet {
        src: usize,
        packet: Vec<u8>,
        data: Vec<u8>,
    },
    /// a follow-on payload chunk of the last packet from `src`
    Data { src: usize, data: Vec<u8> },
    SendComplete { token: ReqToken },
    /// a send (or the connection it used) failed, `token` is set for tracked sends
    SendFailed {
        dest: usize,
        token: Option<ReqToken>,
        reason: String,
    },
}

#[enum_dispatch]
pub trait Transport {
    fn rank(&self) -> usize;
    fn num_ranks(&self) -> usize;
    /// Queues `packet` (and its payload) for delivery to `dest`.
    ///
    /// Completion is reported later as `SendComplete` for tracked sends. An error returned here
    /// means the send never left.
    fn submit(
        &self,
        dest: usize,
        packet: &[u8],
        payload: Option<&[u8]>,
        token: Option<ReqToken>,
    ) -> RmaResult<()>;
    fn poll(&self) -> Option<TransportEvent>;
}

/// A user supplied transport.
pub struct CustomTransport(pub Box<dyn Transport>);

impl Transport for CustomTransport {
    fn rank(&self) -> usize {
        self.0.rank()
    }
    fn num_ranks(&self) -> usize {
        self.0.num_ranks()
    }
    fn submit(
        &self,
        dest: usize,
        packet: &[u8],
        payload: Option<&[u8]>,
        token: Option<ReqToken>,
    ) -> RmaResult<()> {
        self.0.submit(dest, packet, payload, token)
    }
    fn poll(&self) -> Option<TransportEvent> {
        self.0.poll()
    }
}

/// The transports an engine can be built on.
#[enum_dispatch(Transport)]
pub enum Fabric {
    Loopback(LoopbackEndpoint),
    Custom(CustomTransport),
}

pub(crate) fn send_packet(
    transport: &Fabric,
    dest: usize,
    pkt: &Packet,
    payload: Option<&[u8]>,
    token: Option<ReqToken>,
) -> RmaResult<()> {
    let bytes = pkt.encode()?;
    trace!(
        "submit {:?} to {} ({} + {} bytes)",
        pkt.kind(),
        dest,
        bytes.len(),
        payload.map(|p| p.len()).unwrap_or(0)
    );
    transport.submit(dest, &bytes, payload, token)
}
