//! rma-core is the one-sided communication core of a message passing runtime: put, get,
//! accumulate, get-accumulate and compare-and-swap operations against remotely exposed memory
//! windows, together with the synchronization that orders and completes them.
//!
//! Every rank runs an [Engine] on top of a [Transport]. Operation calls only queue work: each
//! (window, target rank) pair has its own target state machine that decides when queued
//! operations may go out, given the access epoch it is in (a passive shared or exclusive lock,
//! or a collective epoch). Lock requests are sent lazily, piggybacked on the first operation
//! when it is small enough, and synchronization directives (flush, flush-local, unlock) ride on
//! the last operation whenever possible.
//!
//! On the target side incoming lock requests that conflict with the currently granted lock are
//! kept, payload included, in a per window FIFO and replayed when the lock is released.
//!
//! Synchronization calls return a [SyncHandle]: awaiting it (or calling [SyncHandle::block] or
//! [SyncHandle::spawn]) drives the engine's progress until the call is satisfied.
//!
//! EXAMPLES
//! --------
//!
//! # Two ranks on an in-process fabric
//! ```
//! use rma_core::{Engine, LockType, LoopbackFabric, ModeFlags, OriginSpec, ProgressExecutor, TargetSpec};
//!
//! let fabric = LoopbackFabric::new(2);
//! let executor = ProgressExecutor::new();
//! let origin = Engine::builder(fabric.endpoint(0)).executor(executor.clone()).build();
//! let target = Engine::builder(fabric.endpoint(1)).executor(executor.clone()).build();
//! let win = origin.create_window(64).unwrap();
//! target.create_window(64).unwrap();
//!
//! // rank 1 only exposes memory, it just keeps its engine progressing
//! let server = executor.spawn(target.clone().serve());
//!
//! origin.begin_access(win, 1, LockType::Exclusive, ModeFlags::NONE).unwrap();
//! origin
//!     .enqueue_put(win, 1, OriginSpec::from_slice(&[1u64, 2, 3]), TargetSpec::new::<u64>(8, 3))
//!     .unwrap();
//! origin.unlock(win, 1).block().unwrap();
//!
//! target.shutdown();
//! executor.block_on(server).unwrap();
//! assert_eq!(target.read_window::<u64>(win, 8, 3).unwrap(), vec![1, 2, 3]);
//! ```
//!
//! # Environment variables
//! The defaults of every engine built with [Engine::builder] come from `RMA_`-prefixed
//! environment variables, see [Config].

mod datatype;
mod directory;
mod engine;
mod env_var;
mod error;
mod lock_queue;
mod op;
mod packet;
mod pool;
mod request;
mod scheduler;
mod target;
mod transport;
mod warnings;
mod window;

pub use crate::datatype::{AccOp, Datatype, DatatypeClass, ElemType, Element};
pub use crate::engine::{Engine, EngineBuilder, EngineStats, SyncHandle};
pub use crate::env_var::{config, Config};
pub use crate::error::{RmaError, RmaResult};
pub use crate::op::{CompareSpec, OpKind, OriginSpec, ResultSpec, TargetSpec};
pub use crate::packet::PacketKind;
pub use crate::request::{ReqToken, RequestStatus, ResultBuf, RmaRequest};
pub use crate::scheduler::ProgressExecutor;
pub use crate::target::{AccessState, LockType, ModeFlags, SyncFlag, TargetStatus};
pub use crate::transport::{
    CustomTransport, Fabric, LoopbackEndpoint, LoopbackFabric, LoopbackOptions, PacketRecord,
    Transport, TransportEvent,
};
pub use crate::window::{WinId, WindowRegistry};

#[doc(hidden)]
pub use async_std;

/// Re-enables the runtime warnings (dropped handles, potential deadlocks) after [disable_runtime_warnings].
pub fn enable_runtime_warnings() {
    warnings::RuntimeWarning::enable_warnings();
}

/// Silences every runtime warning for the rest of the process.
pub fn disable_runtime_warnings() {
    warnings::RuntimeWarning::disable_warnings();
}

pub(crate) fn serialize<T: ?Sized>(obj: &T) -> Result<Vec<u8>, anyhow::Error>
where
    T: serde::Serialize,
{
    Ok(bincode::serialize(obj)?)
}

pub(crate) fn deserialize<'a, T>(bytes: &'a [u8]) -> Result<T, anyhow::Error>
where
    T: serde::Deserialize<'a>,
{
    Ok(bincode::deserialize(bytes)?)
}
