//! Synchronization primitives and wait queues (spec.md §4.4).
//!
//! Every blocking primitive here is built on [`wait_queue::WaitQueue`] and
//! delegates the actual suspend/resume decision to [`crate::sched`]; none of
//! them know how a thread is represented, only that the scheduler can
//! suspend one and wake it back up later.

pub mod mutex;
pub mod rwlock;
pub mod semaphore;
pub mod spinlock;
pub mod wait_queue;

pub use mutex::Mutex;
pub use rwlock::RwLock;
pub use semaphore::Semaphore;
pub use spinlock::{IrqSpinlock, Spinlock};
pub use wait_queue::WaitQueue;
