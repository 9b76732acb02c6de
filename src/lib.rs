//! Tether – remote memory management for a tethered JIT runtime.
//!
//! Compiled code produced by the local runtime ultimately runs inside a
//! separate *executor* process, possibly on another machine or in another
//! privilege domain. Section bytes are staged and relocated locally against
//! addresses that only become real once the bytes are copied into the
//! executor and given their final page protections. The crate exposes the
//! pieces that implement this two-phase (local-build / remote-commit)
//! protocol:
//!
//! * [`memory`] – the remote memory manager: per-section staging buffers,
//!   address-space reservation, section-to-address mapping, unwind-frame
//!   bookkeeping, and the finalize call that commits bytes and protections.
//! * [`dylib`] – the remote dynamic-library manager: opens shared libraries
//!   inside the executor and resolves symbol addresses within them.
//! * [`channel`] – the [`ExecutorChannel`] seam every remote operation goes
//!   through; implementations supply transport and bootstrap-symbol
//!   resolution.
//! * [`wire`] – the serialized request/reply values shared with the
//!   executor-side implementation.
//! * [`addr`] – executor address and address-range bookkeeping.
//!
//! The crate never touches executor memory directly; it only builds typed
//! requests and hands them to the channel. All remote calls are synchronous
//! and blocking from the caller's point of view.

pub mod addr;
pub mod channel;
pub mod dylib;
pub mod memory;
pub mod wire;

use thiserror::Error;

pub use addr::{AddrRange, ExecutorAddr};
pub use channel::ExecutorChannel;
pub use dylib::{RemoteDylibManager, SymbolLookupFlags, SymbolLookupSet};
pub use memory::{RemoteMemoryManager, SectionKind, SectionMapper};
pub use wire::DylibHandle;

/// Result type used across the crate.
pub type TetherResult<T> = std::result::Result<T, TetherError>;

/// Errors produced while coordinating memory with the executor process.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TetherError {
    /// A well-known executor entry point could not be resolved at
    /// construction time.
    #[error("missing bootstrap symbol: {0}")]
    MissingBootstrapSymbol(String),
    /// A reservation was requested with an alignment that is not a power of
    /// two or exceeds the executor page size.
    #[error("invalid {class} alignment {align} in reserve_allocation_space (page size {page_size})")]
    InvalidAlignment {
        class: &'static str,
        align: u64,
        page_size: u64,
    },
    /// The call channel failed to deliver a request or response.
    #[error("executor channel error: {0}")]
    Channel(String),
    /// A wire payload could not be encoded or decoded.
    #[error("wire format error: {0}")]
    Wire(String),
    /// The executor processed the call and reported a failure.
    #[error("executor reported: {0}")]
    Executor(String),
    /// Local bookkeeping and loader-reported state disagree.
    #[error("{0}")]
    Consistency(String),
}
