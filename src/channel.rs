//! The call-channel seam between the local runtime and the executor.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::addr::ExecutorAddr;
use crate::wire::{self, WireResult};
use crate::{TetherError, TetherResult};

/// Well-known names resolved once, at manager construction, to executor
/// addresses. The executor-side runtime exports these; [`resolve`] is
/// expected to fail if any of them is missing.
///
/// [`resolve`]: ExecutorChannel::resolve
pub mod bootstrap {
    pub const MEMORY_INSTANCE: &str = "__tether_executor_memmgr_instance";
    pub const MEMORY_RESERVE: &str = "__tether_executor_memmgr_reserve";
    pub const MEMORY_FINALIZE: &str = "__tether_executor_memmgr_finalize";
    pub const MEMORY_DEALLOCATE: &str = "__tether_executor_memmgr_deallocate";
    pub const REGISTER_UNWIND_SECTION: &str = "__tether_register_unwind_section";
    pub const DEREGISTER_UNWIND_SECTION: &str = "__tether_deregister_unwind_section";
    pub const DYLIB_INSTANCE: &str = "__tether_executor_dylibmgr_instance";
    pub const DYLIB_OPEN: &str = "__tether_executor_dylibmgr_open";
    pub const DYLIB_LOOKUP: &str = "__tether_executor_dylibmgr_lookup";
}

/// Request/response transport to the executor process.
///
/// Implementations own connection setup, framing, and delivery. Calls are
/// synchronous: the calling thread blocks until the reply payload arrives
/// or the transport reports failure. Implementations must tolerate
/// concurrent calls from multiple threads; the managers perform no
/// serialization of their own around channel use.
pub trait ExecutorChannel: Send + Sync {
    /// Page size of the executor process, authoritative for all alignment
    /// validation and rounding. Fixed for the lifetime of the connection.
    fn page_size(&self) -> u64;

    /// Resolves bootstrap symbols by name, one address per requested name
    /// in input order. Fails with
    /// [`TetherError::MissingBootstrapSymbol`] if any name is unknown.
    fn resolve(&self, names: &[&str]) -> TetherResult<Vec<ExecutorAddr>>;

    /// Invokes the function at `fn_addr` in the executor with an opaque
    /// argument payload and returns the opaque reply payload.
    fn call(&self, fn_addr: ExecutorAddr, payload: &[u8]) -> TetherResult<Vec<u8>>;
}

/// Issues one typed remote call: encodes `args`, calls `fn_addr`, decodes
/// the executor's [`WireResult`] reply, and surfaces the `Err` arm as
/// [`TetherError::Executor`].
pub(crate) fn call_wrapper<A, R>(
    channel: &dyn ExecutorChannel,
    fn_addr: ExecutorAddr,
    args: &A,
) -> TetherResult<R>
where
    A: Serialize,
    R: DeserializeOwned,
{
    let payload = wire::encode(args)?;
    let reply = channel.call(fn_addr, &payload)?;
    let result: WireResult<R> = wire::decode(&reply)?;
    result.map_err(TetherError::Executor)
}

/// Resolves a fixed-arity bootstrap symbol table in one round trip.
pub(crate) fn resolve_array<const N: usize>(
    channel: &dyn ExecutorChannel,
    names: [&str; N],
) -> TetherResult<[ExecutorAddr; N]> {
    let addrs = channel.resolve(&names)?;
    let got = addrs.len();
    <[ExecutorAddr; N]>::try_from(addrs).map_err(|_| {
        TetherError::Channel(format!(
            "bootstrap resolution returned {got} addresses for {} names",
            N
        ))
    })
}
