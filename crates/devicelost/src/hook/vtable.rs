//! Dispatch-table interception for foreign objects.
//!
//! Installation swaps one slot of the object's dispatch table in place. Every
//! call through that table reaches the replacement, including calls on other
//! objects of the same class and the foreign library's own internal calls.
//!
//! Originals are recorded per (table, slot, replacement). A replacement finds
//! the entry it displaced with [`Interceptor::original`], which keeps chains of
//! independent replacements on one slot intact. Installing the same
//! replacement again through another object of the same class returns the
//! recorded original instead of pointing the slot at itself.

use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::memory::exchange_word;

/// Layout contract of a foreign interface's dispatch table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchContract {
    /// Interface name, used in logs and errors
    pub name: &'static str,
    /// Number of slots in the table for the contract version in use
    pub slot_count: usize,
}

impl DispatchContract {
    pub const fn new(name: &'static str, slot_count: usize) -> Self {
        Self { name, slot_count }
    }

    fn check(&self, slot: usize) -> Result<()> {
        if slot < self.slot_count {
            Ok(())
        } else {
            Err(Error::SlotOutOfBounds {
                contract: self.name,
                slot,
                slot_count: self.slot_count,
            })
        }
    }
}

/// One replacement to install at a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub slot: usize,
    /// Address of the replacement function
    pub replacement: usize,
}

impl Binding {
    pub fn new(slot: usize, replacement: usize) -> Self {
        Self { slot, replacement }
    }
}

/// (slot, replacement) -> entry the replacement displaced
type Links = HashMap<(usize, usize), usize>;

/// A slot write planned by `install_many`
#[derive(Debug, Clone, Copy)]
struct SlotWrite {
    slot: usize,
    previous: usize,
    replacement: usize,
}

/// Registry of patched dispatch tables and the originals their replacements delegate to
#[derive(Default)]
pub struct Interceptor {
    tables: Mutex<HashMap<usize, Links>>,
}

impl Interceptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `replacement` at `slot` of `object`, returning the entry it displaced.
    ///
    /// # Safety
    ///
    /// `object` must be null or a live object whose first word points to a
    /// dispatch table of at least `contract.slot_count` entries, and
    /// `replacement` must have the slot's calling convention and signature.
    pub unsafe fn install(
        &self,
        object: *mut c_void,
        contract: &DispatchContract,
        slot: usize,
        replacement: usize,
    ) -> Result<usize> {
        let originals =
            unsafe { self.install_many(object, contract, &[Binding::new(slot, replacement)]) }?;
        Ok(originals[0])
    }

    /// Install a batch of bindings on one object.
    ///
    /// Bindings are applied in order, so two bindings on the same slot chain
    /// onto each other. Returns the displaced entry for each binding.
    ///
    /// The whole batch is validated before the first write, and a failed write
    /// rolls back the ones before it. Slots are written one at a time, so the
    /// object must not yet be reachable by callers on other threads.
    ///
    /// # Safety
    ///
    /// Same requirements as [`Interceptor::install`].
    pub unsafe fn install_many(
        &self,
        object: *mut c_void,
        contract: &DispatchContract,
        bindings: &[Binding],
    ) -> Result<Vec<usize>> {
        if object.is_null() {
            return Err(Error::InvalidHandle("null object"));
        }
        for binding in bindings {
            contract.check(binding.slot)?;
            if binding.replacement == 0 {
                return Err(Error::InvalidHandle("null replacement"));
            }
        }

        let mut tables = self.lock();

        // SAFETY: the object is live and pointer-aligned; its first word is the
        // table pointer.
        let table = unsafe { table_of(object) };
        if table == 0 {
            return Err(Error::InvalidHandle("null dispatch table"));
        }

        let known = tables.get(&table);
        let mut pending = Links::new();
        let mut entries: HashMap<usize, usize> = HashMap::new();
        let mut writes = Vec::new();
        let mut originals = Vec::with_capacity(bindings.len());

        for binding in bindings {
            let link = (binding.slot, binding.replacement);
            // SAFETY: the slot was checked against the contract above.
            let current = *entries
                .entry(binding.slot)
                .or_insert_with(|| unsafe { read_entry(table as *const usize, binding.slot) });

            if let Some(&original) = pending.get(&link) {
                originals.push(original);
                continue;
            }
            if let Some(&original) = known.and_then(|links| links.get(&link)) {
                if current != original {
                    trace!(
                        "{}[{}] of table {:#x} already bound to {:#x}",
                        contract.name, binding.slot, table, binding.replacement
                    );
                    originals.push(original);
                    continue;
                }
                // The slot holds the displaced entry again: the table was
                // rebuilt or unhooked behind our back.
                debug!(
                    "Discarding stale {}[{}] record for table {:#x}",
                    contract.name, binding.slot, table
                );
            }
            if current == binding.replacement {
                return Err(Error::AlreadyBound {
                    contract: contract.name,
                    slot: binding.slot,
                });
            }

            pending.insert(link, current);
            entries.insert(binding.slot, binding.replacement);
            writes.push(SlotWrite {
                slot: binding.slot,
                previous: current,
                replacement: binding.replacement,
            });
            originals.push(current);
        }

        if writes.is_empty() {
            return Ok(originals);
        }

        for (applied, write) in writes.iter().enumerate() {
            // SAFETY: `write.slot` is within the table.
            let address = unsafe { (table as *mut usize).add(write.slot) };
            let outcome = unsafe { exchange_word(address, write.previous, write.replacement) }
                .and_then(|swapped| {
                    if swapped {
                        Ok(())
                    } else {
                        Err(Error::TableChanged {
                            object: object as usize,
                        })
                    }
                });
            if let Err(e) = outcome {
                unsafe { roll_back(table, &writes[..applied]) };
                return Err(e);
            }
        }

        tables.entry(table).or_default().extend(pending);

        debug!(
            "Installed {} binding(s) on {} {:#x} (table {:#x})",
            writes.len(),
            contract.name,
            object as usize,
            table
        );
        Ok(originals)
    }

    /// Entry displaced by `replacement` at `slot` of `object`'s table.
    ///
    /// # Safety
    ///
    /// `object` must be null or a live object.
    pub unsafe fn original(
        &self,
        object: *const c_void,
        slot: usize,
        replacement: usize,
    ) -> Option<usize> {
        if object.is_null() {
            return None;
        }
        let tables = self.lock();
        // SAFETY: see the function contract.
        let table = unsafe { table_of(object) };
        tables
            .get(&table)
            .and_then(|links| links.get(&(slot, replacement)).copied())
    }

    /// Check whether this interceptor has patched the table `object` dispatches through.
    ///
    /// # Safety
    ///
    /// `object` must be null or a live object.
    pub unsafe fn is_intercepted(&self, object: *const c_void) -> bool {
        if object.is_null() {
            return false;
        }
        let tables = self.lock();
        // SAFETY: see the function contract.
        let table = unsafe { table_of(object) };
        tables.get(&table).is_some_and(|links| !links.is_empty())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<usize, Links>> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Undo `applied` slot writes, newest first.
unsafe fn roll_back(table: usize, applied: &[SlotWrite]) {
    for write in applied.iter().rev() {
        // SAFETY: these slots were just written successfully.
        let address = unsafe { (table as *mut usize).add(write.slot) };
        if !matches!(
            unsafe { exchange_word(address, write.replacement, write.previous) },
            Ok(true)
        ) {
            warn!(
                "Could not restore slot {} of table {:#x}",
                write.slot, table
            );
        }
    }
}

/// Read the entry currently dispatched at `slot` of `object`.
///
/// # Safety
///
/// `object` must be null or a live object whose table has at least
/// `contract.slot_count` entries.
pub unsafe fn dispatch_entry(
    object: *const c_void,
    contract: &DispatchContract,
    slot: usize,
) -> Result<usize> {
    contract.check(slot)?;
    if object.is_null() {
        return Err(Error::InvalidHandle("null object"));
    }
    // SAFETY: see the function contract.
    let table = unsafe { table_of(object) };
    if table == 0 {
        return Err(Error::InvalidHandle("null dispatch table"));
    }
    Ok(unsafe { read_entry(table as *const usize, slot) })
}

unsafe fn table_of(object: *const c_void) -> usize {
    // SAFETY: the caller guarantees `object` is live; its first word is the
    // table pointer.
    unsafe { AtomicUsize::from_ptr(object as *mut usize) }.load(Ordering::Acquire)
}

unsafe fn read_entry(table: *const usize, slot: usize) -> usize {
    // SAFETY: the caller guarantees `slot` is within the table.
    unsafe { AtomicUsize::from_ptr(table.add(slot).cast_mut()) }.load(Ordering::Acquire)
}
