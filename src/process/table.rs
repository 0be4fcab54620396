//! Global process registry (spec.md §9: "the process registry" is one of
//! the process-wide singletons, explicit and `init()`-ed once rather than
//! built from a hidden static constructor).

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use crate::error::{ErrorKind, KernelResult};
use crate::process::pcb::{Process, ProcessId};
use crate::sync::Spinlock;

pub struct ProcessTable {
    processes: Spinlock<BTreeMap<u64, Arc<Process>>>,
}

impl ProcessTable {
    pub const fn new() -> Self {
        Self { processes: Spinlock::new(BTreeMap::new()) }
    }

    pub fn insert(&self, process: Arc<Process>) {
        self.processes.lock().insert(process.id.0, process);
    }

    pub fn lookup(&self, id: ProcessId) -> KernelResult<Arc<Process>> {
        self.processes.lock().get(&id.0).cloned().ok_or(ErrorKind::NoSuchResource)
    }

    pub fn remove(&self, id: ProcessId) -> KernelResult<Arc<Process>> {
        self.processes.lock().remove(&id.0).ok_or(ErrorKind::NoSuchResource)
    }

    pub fn count(&self) -> usize {
        self.processes.lock().len()
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

static TABLE: ProcessTable = ProcessTable::new();

/// The process-wide process registry singleton.
pub fn global() -> &'static ProcessTable {
    &TABLE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_lookup_round_trips() {
        let table = ProcessTable::new();
        let process = Process::new(None, 0x4000_0000, 16, 1).unwrap();
        let id = process.id;
        table.insert(process);
        assert_eq!(table.lookup(id).unwrap().id, id);
        assert_eq!(table.count(), 1);
    }

    #[test]
    fn lookup_missing_pid_is_no_such_resource() {
        let table = ProcessTable::new();
        assert_eq!(table.lookup(ProcessId(999)), Err(ErrorKind::NoSuchResource));
    }
}
