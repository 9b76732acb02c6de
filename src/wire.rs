//! Request and reply values exchanged with the executor process.
//!
//! Everything in this module crosses the call channel as a compact binary
//! payload. The executor-side implementation decodes these exact shapes, so
//! they are public: an executor, a mock, or a test harness shares one codec
//! with the managers by going through [`encode`] and [`decode`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::addr::ExecutorAddr;
use crate::{TetherError, TetherResult};

/// Reply convention for every remote operation: the executor encodes the
/// operation's result, with failures travelling as the `Err` message.
pub type WireResult<T> = std::result::Result<T, String>;

/// Page protections applied to a finalized segment.
///
/// Exactly three canonical classes exist; no finer-grained combination is
/// ever sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protection {
    ReadExec,
    Read,
    ReadWrite,
}

/// One protection class of a finalize request: where the bytes go, how the
/// pages are protected, and the aggregated section contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub addr: ExecutorAddr,
    pub prot: Protection,
    pub content: Vec<u8>,
}

/// A deferred call the executor runs on our behalf: `fn_addr(addr, size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionCall {
    pub fn_addr: ExecutorAddr,
    pub addr: ExecutorAddr,
    pub size: u64,
}

/// Paired lifetime actions attached to a finalize request. The executor
/// runs `register` while finalizing and schedules `deregister` to run when
/// the finalized memory is eventually released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionPair {
    pub register: ActionCall,
    pub deregister: ActionCall,
}

/// Commit request for one allocation group: all three segments in fixed
/// {code, read-only, read-write} order plus any unwind-frame actions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeRequest {
    pub segments: Vec<Segment>,
    pub actions: Vec<ActionPair>,
}

/// Flattened element of a remote symbol lookup. The executor fails the
/// whole lookup if a required name is unresolved and returns a null address
/// for an unresolved non-required name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSymbolLookup {
    pub name: String,
    pub required: bool,
}

/// Opaque handle to a shared library opened inside the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DylibHandle(pub u64);

/// Encodes a wire value into its binary payload.
pub fn encode<T: Serialize>(value: &T) -> TetherResult<Vec<u8>> {
    bincode::serialize(value).map_err(|err| TetherError::Wire(err.to_string()))
}

/// Decodes a binary payload produced by [`encode`].
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> TetherResult<T> {
    bincode::deserialize(bytes).map_err(|err| TetherError::Wire(err.to_string()))
}
