//! Remote memory management for JIT-compiled code.
//!
//! The manager mediates between a relocation-aware object loader running
//! locally and the executor process that will eventually run the code. One
//! loaded object moves through three phases:
//!
//! 1. **Staging** – [`allocate_section`] hands the loader a local scratch
//!    buffer per section; relocated bytes are written there.
//! 2. **Reservation and mapping** – [`reserve_allocation_space`] obtains a
//!    remote address range sized to fit the whole object, partitioned into
//!    contiguous {code, read-only, read-write} sub-ranges, and
//!    [`notify_object_loaded`] tells the loader which remote address each
//!    section will land on, so relocations target addresses that are not
//!    yet backed by the staged bytes.
//! 3. **Finalize** – [`finalize_memory`] copies each group's staged bytes
//!    into the executor, applies page protections, and registers pending
//!    unwind frames, all in a single remote call per group.
//!
//! Channel and executor failures are recorded in a manager-wide sticky
//! error slot and drained by the next [`finalize_memory`] call, so a
//! mid-pipeline failure surfaces exactly once instead of being lost or
//! repeated. Callers decide whether to retry; nothing here retries
//! automatically.
//!
//! [`allocate_section`]: RemoteMemoryManager::allocate_section
//! [`reserve_allocation_space`]: RemoteMemoryManager::reserve_allocation_space
//! [`notify_object_loaded`]: RemoteMemoryManager::notify_object_loaded
//! [`finalize_memory`]: RemoteMemoryManager::finalize_memory

mod group;

use std::collections::VecDeque;
use std::mem;
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::addr::{align_up, AddrRange, ExecutorAddr};
use crate::channel::{bootstrap, call_wrapper, resolve_array, ExecutorChannel};
use crate::wire::{ActionCall, ActionPair, FinalizeRequest, Protection, Segment};
use crate::{TetherError, TetherResult};

use group::{aggregate, section_offsets, Alloc, AllocGroup, UnwindFrame};

/// Protection class a staged section belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SectionKind {
    Code,
    ReadOnlyData,
    ReadWriteData,
}

/// Loader-side callback through which the manager reports the future
/// remote address of each staged section, so subsequent relocations target
/// the executor's address space while the bytes still live locally.
pub trait SectionMapper {
    fn map_section_address(&mut self, local: NonNull<u8>, remote: ExecutorAddr);
}

/// Resolved executor entry points used by [`RemoteMemoryManager`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SymbolAddrs {
    pub instance: ExecutorAddr,
    pub reserve: ExecutorAddr,
    pub finalize: ExecutorAddr,
    pub deallocate: ExecutorAddr,
    pub register_unwind: ExecutorAddr,
    pub deregister_unwind: ExecutorAddr,
}

#[derive(Default)]
struct ManagerState {
    /// Groups still staging or just reserved; the last unreserved group is
    /// the current staging target.
    unmapped: Vec<AllocGroup>,
    /// Reserved groups whose sections have been mapped and which await
    /// finalization.
    unfinalized: Vec<AllocGroup>,
    /// Reservation bases of every successfully finalized group, released
    /// in the executor at teardown.
    finalized: Vec<ExecutorAddr>,
    sticky: Option<TetherError>,
}

/// Stages section memory locally and commits it to the executor process.
///
/// All mutable state sits behind one mutex; remote calls are issued with
/// the lock released so staging for new objects can proceed while older
/// groups are being reserved or finalized.
///
/// Callers loading several objects concurrently must serialize each
/// object's staging window (allocate → reserve → notify) externally: the
/// manager always targets the most recently started group, exactly like
/// the loader protocol assumes.
pub struct RemoteMemoryManager {
    channel: Arc<dyn ExecutorChannel>,
    sas: SymbolAddrs,
    page_size: u64,
    state: Mutex<ManagerState>,
}

impl RemoteMemoryManager {
    /// Creates a manager from an explicit symbol-address table. The
    /// executor page size is read once here and treated as fixed.
    pub fn new(channel: Arc<dyn ExecutorChannel>, sas: SymbolAddrs) -> Self {
        let page_size = channel.page_size();
        debug!(page_size, "created remote memory manager");
        Self {
            channel,
            sas,
            page_size,
            state: Mutex::new(ManagerState::default()),
        }
    }

    /// Resolves the default bootstrap symbols and creates the manager.
    /// Fails if the executor does not export the memory entry points.
    pub fn create_with_default_bootstrap_symbols(
        channel: Arc<dyn ExecutorChannel>,
    ) -> TetherResult<Self> {
        let [instance, reserve, finalize, deallocate, register_unwind, deregister_unwind] =
            resolve_array(
                channel.as_ref(),
                [
                    bootstrap::MEMORY_INSTANCE,
                    bootstrap::MEMORY_RESERVE,
                    bootstrap::MEMORY_FINALIZE,
                    bootstrap::MEMORY_DEALLOCATE,
                    bootstrap::REGISTER_UNWIND_SECTION,
                    bootstrap::DEREGISTER_UNWIND_SECTION,
                ],
            )?;
        Ok(Self::new(
            channel,
            SymbolAddrs {
                instance,
                reserve,
                finalize,
                deallocate,
                register_unwind,
                deregister_unwind,
            },
        ))
    }

    /// The executor page size used for all rounding and validation.
    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// The loader must pre-compute per-class totals and reserve before
    /// mapping; this manager cannot allocate remote memory on the fly.
    pub fn requires_reservation(&self) -> bool {
        true
    }

    /// Stages a scratch buffer for one section and returns the aligned
    /// pointer the loader writes relocated bytes through. Purely local; no
    /// remote interaction.
    ///
    /// The pointer stays valid until the owning group is finalized by
    /// [`finalize_memory`](Self::finalize_memory) or the manager is
    /// dropped; the loader must not write through it after that.
    pub fn allocate_section(&self, kind: SectionKind, size: u64, align: u64) -> NonNull<u8> {
        let mut state = self.state.lock();
        trace!(?kind, size, align, "staging section buffer");
        let mut alloc = Alloc::new(size, align);
        let ptr = alloc.contents_ptr();
        let group = Self::staging_group(&mut state);
        match kind {
            SectionKind::Code => group.code.push(alloc),
            SectionKind::ReadOnlyData => group.ro_data.push(alloc),
            SectionKind::ReadWriteData => group.rw_data.push(alloc),
        }
        ptr
    }

    /// Reserves one remote address range sized to fit the current group's
    /// three protection classes, page-rounded, and partitions it into
    /// contiguous {code, read-only, read-write} sub-ranges in that fixed
    /// order.
    ///
    /// Alignments must be powers of two no larger than the executor page
    /// size. Any failure is returned *and* recorded in the sticky slot;
    /// once the slot is occupied, further reservations short-circuit
    /// without issuing a remote call.
    pub fn reserve_allocation_space(
        &self,
        code_size: u64,
        code_align: u64,
        ro_size: u64,
        ro_align: u64,
        rw_size: u64,
        rw_align: u64,
    ) -> TetherResult<()> {
        {
            let mut state = self.state.lock();
            if let Some(err) = &state.sticky {
                return Err(err.clone());
            }
            for (class, align) in [
                ("code", code_align),
                ("ro-data", ro_align),
                ("rw-data", rw_align),
            ] {
                if !align.is_power_of_two() || align > self.page_size {
                    let err = TetherError::InvalidAlignment {
                        class,
                        align,
                        page_size: self.page_size,
                    };
                    state.sticky = Some(err.clone());
                    return Err(err);
                }
            }
        }

        let code_len = align_up(code_size, self.page_size);
        let ro_len = align_up(ro_size, self.page_size);
        let rw_len = align_up(rw_size, self.page_size);
        let total = code_len + ro_len + rw_len;
        debug!(total, code_len, ro_len, rw_len, "reserving executor memory");

        // The reserve call blocks; issue it with the lock released so
        // staging for other objects can proceed meanwhile.
        let base: ExecutorAddr = match call_wrapper(
            self.channel.as_ref(),
            self.sas.reserve,
            &(self.sas.instance, total),
        ) {
            Ok(base) => base,
            Err(err) => {
                self.state.lock().sticky = Some(err.clone());
                return Err(err);
            }
        };

        let mut state = self.state.lock();
        let group = Self::staging_group(&mut state);
        group.remote_code = AddrRange::new(base, code_len);
        group.remote_ro_data = AddrRange::new(group.remote_code.end(), ro_len);
        group.remote_rw_data = AddrRange::new(group.remote_ro_data.end(), rw_len);
        group.reserved = true;
        trace!(base = %base, "partitioned reservation");
        Ok(())
    }

    /// Assigns every reserved group's sections their remote addresses and
    /// reports each mapping to the loader. Sections are laid out in
    /// staging order, each aligned within its class's sub-range; the same
    /// layout routine later drives finalization, so the two phases agree
    /// byte for byte. Mapped groups move to the pending-finalize queue;
    /// groups still staging stay put.
    pub fn notify_object_loaded(&self, loader: &mut dyn SectionMapper) {
        let mut state = self.state.lock();
        debug!("applying section address mappings");
        let groups = mem::take(&mut state.unmapped);
        let mut staging = Vec::new();
        for mut group in groups {
            if !group.reserved {
                staging.push(group);
                continue;
            }
            Self::map_sections(loader, &mut group.code, group.remote_code.start);
            Self::map_sections(loader, &mut group.ro_data, group.remote_ro_data.start);
            Self::map_sections(loader, &mut group.rw_data, group.remote_rw_data.start);
            state.unfinalized.push(group);
        }
        state.unmapped = staging;
    }

    /// Records unwind metadata the loader reported against a reserved (not
    /// yet finalized) address. Registration is deferred: the frame is
    /// attached to the containing group and shipped with that group's
    /// finalize request. An address outside every pending group is a
    /// consistency error, recorded sticky and surfaced at finalize time.
    pub fn register_unwind_frames(&self, local: NonNull<u8>, load_addr: ExecutorAddr, size: u64) {
        let mut state = self.state.lock();
        if state.sticky.is_some() {
            return;
        }
        trace!(local = ?local, addr = %load_addr, size, "registering unwind frames");
        for group in state.unfinalized.iter_mut().rev() {
            if group.contains(load_addr) {
                group
                    .pending_frames
                    .push(UnwindFrame { addr: load_addr, size });
                return;
            }
        }
        state.sticky = Some(TetherError::Consistency(
            "unwind frame does not lie inside any unfinalized allocation".into(),
        ));
    }

    /// Explicit unregistration is a no-op: teardown happens through the
    /// paired deregister action the executor runs when the finalized
    /// memory is eventually released.
    pub fn deregister_unwind_frames(&self) {}

    /// Commits every pending group to the executor: one finalize call per
    /// group carrying all three segments (aggregated bytes, target
    /// address, protection flags) plus the group's unwind-frame actions.
    ///
    /// If a sticky error is pending this call drains it: the error is
    /// returned, the slot is cleared, and the queue is left untouched for
    /// a later call. A failure while processing abandons the failing group
    /// (its executor resources are recovered at teardown), re-queues the
    /// not-yet-processed groups, and both returns the error and parks it
    /// in the sticky slot, so whichever caller arrives next sees the
    /// failure before processing resumes. A caller racing another caller's
    /// drain either processes the remaining queue or trivially succeeds.
    pub fn finalize_memory(&self) -> TetherResult<()> {
        let taken = {
            let mut state = self.state.lock();
            if let Some(err) = state.sticky.take() {
                return Err(err);
            }
            mem::take(&mut state.unfinalized)
        };
        if taken.is_empty() {
            return Ok(());
        }
        debug!(groups = taken.len(), "finalizing staged memory");

        let mut pending = VecDeque::from(taken);
        while let Some(group) = pending.pop_front() {
            if let Err(err) = self.finalize_group(&group) {
                let mut state = self.state.lock();
                state.sticky = Some(err.clone());
                // The failed group is abandoned; everything not yet
                // processed goes back to the front of the queue so a later
                // call retries exactly the remaining work.
                let newer = mem::take(&mut state.unfinalized);
                state.unfinalized = pending.into_iter().chain(newer).collect();
                return Err(err);
            }
            self.state.lock().finalized.push(group.remote_code.start);
        }
        Ok(())
    }

    fn staging_group(state: &mut ManagerState) -> &mut AllocGroup {
        let needs_new = state.unmapped.last().map_or(true, |group| group.reserved);
        if needs_new {
            state.unmapped.push(AllocGroup::default());
        }
        let index = state.unmapped.len() - 1;
        &mut state.unmapped[index]
    }

    fn map_sections(loader: &mut dyn SectionMapper, allocs: &mut [Alloc], base: ExecutorAddr) {
        // A null base marks a class that was never reserved; its sections
        // are left unmapped.
        if base.is_null() {
            return;
        }
        let offsets = section_offsets(allocs);
        for (offset, alloc) in offsets.into_iter().zip(allocs.iter_mut()) {
            let remote = base + offset;
            trace!(local = ?alloc.contents_ptr(), remote = %remote, "mapped section");
            loader.map_section_address(alloc.contents_ptr(), remote);
            alloc.remote_addr = remote;
        }
    }

    fn finalize_group(&self, group: &AllocGroup) -> TetherResult<()> {
        let classes: [(&[Alloc], AddrRange, Protection); 3] = [
            (&group.code, group.remote_code, Protection::ReadExec),
            (&group.ro_data, group.remote_ro_data, Protection::Read),
            (&group.rw_data, group.remote_rw_data, Protection::ReadWrite),
        ];

        let mut request = FinalizeRequest {
            segments: Vec::with_capacity(classes.len()),
            actions: Vec::with_capacity(group.pending_frames.len()),
        };
        for (sections, range, prot) in classes {
            for alloc in sections {
                trace!(
                    remote = %alloc.remote_addr,
                    size = alloc.size(),
                    align = alloc.align(),
                    "aggregating section"
                );
            }
            request.segments.push(Segment {
                addr: range.start,
                prot,
                content: aggregate(sections),
            });
        }
        for frame in &group.pending_frames {
            request.actions.push(ActionPair {
                register: ActionCall {
                    fn_addr: self.sas.register_unwind,
                    addr: frame.addr,
                    size: frame.size,
                },
                deregister: ActionCall {
                    fn_addr: self.sas.deregister_unwind,
                    addr: frame.addr,
                    size: frame.size,
                },
            });
        }
        debug!(
            base = %group.remote_code.start,
            actions = request.actions.len(),
            "issuing finalize call"
        );
        call_wrapper(
            self.channel.as_ref(),
            self.sas.finalize,
            &(self.sas.instance, &request),
        )
    }
}

impl Drop for RemoteMemoryManager {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        let staged_remaining = !state.unmapped.is_empty() || !state.unfinalized.is_empty();
        if staged_remaining {
            if let Some(err) = &state.sticky {
                error!(error = %err, "destroying remote memory manager with unfinalized allocations");
            }
        }
        if state.finalized.is_empty() {
            return;
        }
        let bases = mem::take(&mut state.finalized);
        debug!(count = bases.len(), "releasing finalized executor allocations");
        if let Err(err) = call_wrapper::<_, ()>(
            self.channel.as_ref(),
            self.sas.deallocate,
            &(self.sas.instance, &bases),
        ) {
            // Destruction must not fail; the executor reclaims on exit.
            warn!(error = %err, "failed to deallocate finalized executor memory");
        }
    }
}
