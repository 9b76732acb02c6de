//! Remote dynamic-library management.
//!
//! Opens shared libraries inside the executor process and resolves symbol
//! addresses within them. The manager holds no mutable state beyond the
//! symbol table resolved at construction, so every call is independent and
//! may be issued concurrently.

use std::sync::Arc;

use tracing::debug;

use crate::addr::ExecutorAddr;
use crate::channel::{bootstrap, call_wrapper, resolve_array, ExecutorChannel};
use crate::wire::{DylibHandle, RemoteSymbolLookup};
use crate::TetherResult;

/// Resolved executor entry points used by [`RemoteDylibManager`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SymbolAddrs {
    pub instance: ExecutorAddr,
    pub open: ExecutorAddr,
    pub lookup: ExecutorAddr,
}

/// How strictly a looked-up name must resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolLookupFlags {
    /// The executor fails the whole lookup if the name is unresolved.
    Required,
    /// An unresolved name comes back as a null address.
    WeaklyReferenced,
}

/// An ordered set of names to resolve within one library.
#[derive(Debug, Clone, Default)]
pub struct SymbolLookupSet {
    entries: Vec<(String, SymbolLookupFlags)>,
}

impl SymbolLookupSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: impl Into<String>, flags: SymbolLookupFlags) -> &mut Self {
        self.entries.push((name.into(), flags));
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn to_wire(&self) -> Vec<RemoteSymbolLookup> {
        self.entries
            .iter()
            .map(|(name, flags)| RemoteSymbolLookup {
                name: name.clone(),
                required: *flags == SymbolLookupFlags::Required,
            })
            .collect()
    }
}

/// Opens and queries shared libraries in the executor process.
pub struct RemoteDylibManager {
    channel: Arc<dyn ExecutorChannel>,
    sas: SymbolAddrs,
}

impl std::fmt::Debug for RemoteDylibManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteDylibManager")
            .field("sas", &self.sas)
            .finish_non_exhaustive()
    }
}

impl RemoteDylibManager {
    /// Creates a manager from an explicit symbol-address table.
    pub fn new(channel: Arc<dyn ExecutorChannel>, sas: SymbolAddrs) -> Self {
        Self { channel, sas }
    }

    /// Resolves the default bootstrap symbols and creates the manager.
    /// Fails if the executor does not export the dylib entry points.
    pub fn create_with_default_bootstrap_symbols(
        channel: Arc<dyn ExecutorChannel>,
    ) -> TetherResult<Self> {
        let [instance, open, lookup] = resolve_array(
            channel.as_ref(),
            [
                bootstrap::DYLIB_INSTANCE,
                bootstrap::DYLIB_OPEN,
                bootstrap::DYLIB_LOOKUP,
            ],
        )?;
        Ok(Self::new(
            channel,
            SymbolAddrs {
                instance,
                open,
                lookup,
            },
        ))
    }

    /// Opens a shared library inside the executor and returns its handle.
    /// `mode` is passed through to the executor's loader untouched.
    pub fn open(&self, path: &str, mode: u64) -> TetherResult<DylibHandle> {
        debug!(path, mode, "opening remote dylib");
        call_wrapper(
            self.channel.as_ref(),
            self.sas.open,
            &(self.sas.instance, path, mode),
        )
    }

    /// Resolves a set of names within an open library. Result ordering
    /// matches the input ordering; weakly-referenced unresolved names come
    /// back as null addresses.
    pub fn lookup(
        &self,
        handle: DylibHandle,
        symbols: &SymbolLookupSet,
    ) -> TetherResult<Vec<ExecutorAddr>> {
        self.lookup_raw(handle, &symbols.to_wire())
    }

    /// Same as [`lookup`](Self::lookup) with the lookup set already in its
    /// wire representation.
    pub fn lookup_raw(
        &self,
        handle: DylibHandle,
        symbols: &[RemoteSymbolLookup],
    ) -> TetherResult<Vec<ExecutorAddr>> {
        debug!(handle = handle.0, count = symbols.len(), "remote symbol lookup");
        call_wrapper(
            self.channel.as_ref(),
            self.sas.lookup,
            &(self.sas.instance, handle, symbols),
        )
    }
}
