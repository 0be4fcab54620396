//! Processes, descriptor tables, and per-process storage (spec.md §4.6).

pub mod creation;
pub mod descriptor;
pub mod kv_store;
pub mod pcb;
pub mod table;

pub use creation::{create_child, CreationRequest, RegionCopy, ThreadContextRecord};
pub use descriptor::{Did, DescriptorObject, DescriptorTable, NO_DID};
pub use kv_store::{KvStore, StorageKey};
pub use pcb::{Process, ProcessId};
pub use table::{global, ProcessTable};
