//! Channel pair: two ring-buffered endpoints (spec.md §3, §4.5).
//!
//! Each [`Side`] is the *inbox* for one endpoint: [`Endpoint::send`] pushes
//! into the peer's ring, and [`Endpoint::receive`] pops from this side's
//! own ring. Capacity and occupancy are tracked by a pair of semaphores
//! per side (`insertion_semaphore` gates space, `removal_semaphore` gates
//! content); five wait queues per side carry the finer-grained
//! notifications (arrival, empty, full, removal, close) a semaphore's own
//! internal waiter list doesn't distinguish.

extern crate alloc;

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::error::{ErrorKind, KernelResult};
use crate::ipc::message::Message;
use crate::sync::{Mutex, Semaphore, WaitQueue};

/// Ring capacity in messages. spec.md §4.5 leaves this implementation
/// defined; 64 matches the depth the scheduler's own run queues use
/// elsewhere in this crate.
const RING_CAPACITY: u64 = 64;

/// Blocking-mutex-guarded ring. Plain [`crate::sync::Spinlock`] is wrong
/// here: the send/receive protocol below wakes observer wait queues with
/// this lock still held, which a spinlock cannot do without risking a
/// deadlock against the scheduler. [`Mutex`]'s support for recursive
/// acquisition by the same thread is what makes the two-phase
/// `lock_send`/`send_locked`/`unlock_send` ticket API safe to build on
/// top of the same lock the plain `send` path uses.
struct Ring {
    lock: Mutex,
    queue: UnsafeCell<VecDeque<Message>>,
}

// SAFETY: all access to `queue` happens with `lock` held.
unsafe impl Sync for Ring {}

impl Ring {
    fn new() -> Self {
        Self {
            lock: Mutex::new(),
            queue: UnsafeCell::new(VecDeque::new()),
        }
    }

    /// # Safety
    /// `lock` must be held by the calling thread.
    unsafe fn queue_mut(&self) -> &mut VecDeque<Message> {
        // SAFETY: forwarded from the caller's contract.
        unsafe { &mut *self.queue.get() }
    }
}

struct Side {
    ring: Ring,
    /// Set by the *peer's* `close` once the peer will never send again
    /// (spec.md §4.5): nothing more can ever arrive in this side's ring.
    closed_for_receive: AtomicBool,
    /// Gates space in this side's ring; down'd by senders, up'd by the
    /// owning endpoint's `receive`.
    insertion_semaphore: Semaphore,
    /// Gates content in this side's ring; down'd by the owning endpoint's
    /// `receive`, up'd by senders.
    removal_semaphore: Semaphore,
    message_arrival: WaitQueue,
    queue_empty: WaitQueue,
    queue_removal: WaitQueue,
    queue_full: WaitQueue,
    close: WaitQueue,
    /// Guards against double-`close` on the same local handle.
    close_issued: AtomicBool,
}

impl Side {
    fn new() -> Self {
        Self {
            ring: Ring::new(),
            closed_for_receive: AtomicBool::new(false),
            insertion_semaphore: Semaphore::new(RING_CAPACITY),
            removal_semaphore: Semaphore::new(0),
            message_arrival: WaitQueue::new(),
            queue_empty: WaitQueue::new(),
            queue_removal: WaitQueue::new(),
            queue_full: WaitQueue::new(),
            close: WaitQueue::new(),
            close_issued: AtomicBool::new(false),
        }
    }
}

struct PairInner {
    sides: [Side; 2],
    /// Monotonic, non-zero (spec.md §4.5: `0` is the reserved "none"
    /// sentinel, so the first minted id is `1`). Spec.md centers these on
    /// endpoint B; folded here onto the shared pair since both endpoints
    /// already hold an `Arc` to it.
    next_conversation_id: AtomicU64,
    next_message_id: AtomicU64,
    /// Counts down from 2; the pair's backing rings are drained once both
    /// endpoints have closed.
    destruction_refcount: AtomicU64,
}

impl PairInner {
    fn mint_conversation_id(&self) -> u64 {
        self.next_conversation_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn mint_message_id(&self) -> u64 {
        self.next_message_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// One side of a channel pair. Cheap to clone via [`Endpoint::retain`];
/// the pair's storage lives until both sides have been closed.
pub struct Endpoint {
    pair: Arc<PairInner>,
    local: usize,
    /// Count of descriptor-table slots referencing this endpoint,
    /// distinct from Rust's own `Arc<Endpoint>` strong count (which also
    /// counts transient clones such as an in-flight `Attachment::Channel`
    /// payload). Closes the endpoint once this drops to zero, mirroring
    /// [`crate::mm::mapping::Mapping`]'s own install-refcount discipline.
    handle_count: AtomicU64,
}

/// Construct a fresh pair, returning its two endpoints.
pub fn new_pair() -> (Arc<Endpoint>, Arc<Endpoint>) {
    let pair = Arc::new(PairInner {
        sides: [Side::new(), Side::new()],
        next_conversation_id: AtomicU64::new(0),
        next_message_id: AtomicU64::new(0),
        destruction_refcount: AtomicU64::new(2),
    });
    (
        Arc::new(Endpoint { pair: pair.clone(), local: 0, handle_count: AtomicU64::new(1) }),
        Arc::new(Endpoint { pair, local: 1, handle_count: AtomicU64::new(1) }),
    )
}

impl Endpoint {
    fn peer_index(&self) -> usize {
        1 - self.local
    }

    fn own_side(&self) -> &Side {
        &self.pair.sides[self.local]
    }

    fn peer_side(&self) -> &Side {
        &self.pair.sides[self.peer_index()]
    }

    /// Returns a handle sharing the same pair, for capability transfer
    /// through an [`crate::ipc::message::Attachment::Channel`].
    pub fn retain(self: &Arc<Self>) -> Arc<Self> {
        self.clone()
    }

    pub fn peer(self: &Arc<Self>) -> usize {
        self.peer_index()
    }

    pub fn next_conversation_id(&self) -> u64 {
        self.pair.mint_conversation_id()
    }

    pub fn next_message_id(&self) -> u64 {
        self.pair.mint_message_id()
    }

    /// Send `message` into the peer's inbox, following the six-step
    /// protocol of spec.md §4.5 exactly (decrement, double-checked close,
    /// enqueue under lock, stamp ids, signal, wake, release).
    pub fn send(&self, message: Message) -> KernelResult<()> {
        let peer = self.peer_side();

        // 1. Decrement B's insertion semaphore.
        if peer.closed_for_receive.load(Ordering::Acquire) {
            return Err(ErrorKind::PermanentOutage);
        }
        peer.insertion_semaphore.down();

        // 2. Re-check B's close flag now that a slot is reserved.
        if peer.closed_for_receive.load(Ordering::Acquire) {
            peer.insertion_semaphore.up();
            return Err(ErrorKind::PermanentOutage);
        }

        // 3. Acquire B's mutex; double-checked re-check of the close flag.
        peer.ring.lock.lock();
        if peer.closed_for_receive.load(Ordering::Acquire) {
            peer.ring.lock.unlock().expect("just locked by this thread");
            peer.insertion_semaphore.up();
            return Err(ErrorKind::PermanentOutage);
        }

        // 4. Enqueue, stamping ids.
        let mut message = message;
        if message.conversation_id == 0 {
            message.conversation_id = self.pair.mint_conversation_id();
        }
        message.message_id = self.pair.mint_message_id();
        // SAFETY: `peer.ring.lock` is held by this thread.
        let queue = unsafe { peer.ring.queue_mut() };
        queue.push_back(message);
        let filled = queue.len() as u64 == RING_CAPACITY;

        // 5. Increment B's removal semaphore (before waking observers).
        peer.removal_semaphore.up();

        // 6. Wake B's message-arrival queue with the mutex still held.
        peer.message_arrival.wake_all();
        if filled {
            peer.queue_full.wake_all();
        }

        // 7. Release the mutex.
        peer.ring.lock.unlock().expect("this thread holds the lock from step 3");
        Ok(())
    }

    /// Non-blocking send: fails with `no_wait` instead of waiting for
    /// space in the peer's ring (spec.md §8 S1: a full ring's 65th
    /// non-blocking send is `no_wait`, not the generic `temporary_outage`
    /// a plain semaphore's own `try_down` would report).
    pub fn try_send(&self, message: Message) -> KernelResult<()> {
        let peer = self.peer_side();
        if peer.closed_for_receive.load(Ordering::Acquire) {
            return Err(ErrorKind::PermanentOutage);
        }
        peer.insertion_semaphore.try_down().map_err(|_| ErrorKind::NoWait)?;
        if peer.closed_for_receive.load(Ordering::Acquire) {
            peer.insertion_semaphore.up();
            return Err(ErrorKind::PermanentOutage);
        }
        peer.ring.lock.lock();
        let mut message = message;
        if message.conversation_id == 0 {
            message.conversation_id = self.pair.mint_conversation_id();
        }
        message.message_id = self.pair.mint_message_id();
        // SAFETY: `peer.ring.lock` is held by this thread.
        let queue = unsafe { peer.ring.queue_mut() };
        queue.push_back(message);
        let filled = queue.len() as u64 == RING_CAPACITY;
        peer.removal_semaphore.up();
        peer.message_arrival.wake_all();
        if filled {
            peer.queue_full.wake_all();
        }
        peer.ring.lock.unlock().expect("just locked by this thread");
        Ok(())
    }

    /// Receive the next message from this endpoint's own inbox, blocking
    /// until one arrives or the peer has closed with nothing left queued.
    /// Symmetric with `send`, removal and insertion semaphores swapped.
    pub fn receive(&self) -> KernelResult<Message> {
        let own = self.own_side();
        loop {
            own.removal_semaphore.down();
            own.ring.lock.lock();
            let queue = unsafe { own.ring.queue_mut() };
            match queue.pop_front() {
                Some(msg) => {
                    let emptied = queue.is_empty();
                    own.insertion_semaphore.up();
                    own.queue_removal.wake_all();
                    if emptied {
                        own.queue_empty.wake_all();
                    }
                    own.ring.lock.unlock().expect("just locked by this thread");
                    return Ok(msg);
                }
                None => {
                    own.ring.lock.unlock().expect("just locked by this thread");
                    // Woken by `close` incrementing removal_semaphore with
                    // an empty ring: nothing will ever arrive again.
                    if own.closed_for_receive.load(Ordering::Acquire) {
                        return Err(ErrorKind::PermanentOutage);
                    }
                }
            }
        }
    }

    /// Non-blocking receive: fails with `no_wait` if the inbox is
    /// currently empty, or `permanent_outage` if the peer has closed and
    /// the inbox has been fully drained (spec.md §8 S2).
    pub fn try_receive(&self) -> KernelResult<Message> {
        let own = self.own_side();
        own.removal_semaphore.try_down().map_err(|_| {
            if own.closed_for_receive.load(Ordering::Acquire) {
                ErrorKind::PermanentOutage
            } else {
                ErrorKind::NoWait
            }
        })?;
        own.ring.lock.lock();
        let queue = unsafe { own.ring.queue_mut() };
        let msg = queue.pop_front().expect("removal_semaphore accounted for this entry");
        let emptied = queue.is_empty();
        own.insertion_semaphore.up();
        own.queue_removal.wake_all();
        if emptied {
            own.queue_empty.wake_all();
        }
        own.ring.lock.unlock().expect("just locked by this thread");
        Ok(msg)
    }

    /// Phase 1 of the two-step send ticket: reserve a slot in the peer's
    /// ring and acquire its lock, without yet committing a message, so a
    /// caller can assemble the message body under the reservation.
    pub fn lock_send(&self) -> KernelResult<()> {
        let peer = self.peer_side();
        if peer.closed_for_receive.load(Ordering::Acquire) {
            return Err(ErrorKind::PermanentOutage);
        }
        peer.insertion_semaphore.down();
        if peer.closed_for_receive.load(Ordering::Acquire) {
            peer.insertion_semaphore.up();
            return Err(ErrorKind::PermanentOutage);
        }
        peer.ring.lock.lock();
        if peer.closed_for_receive.load(Ordering::Acquire) {
            peer.ring.lock.unlock().expect("just locked by this thread");
            peer.insertion_semaphore.up();
            return Err(ErrorKind::PermanentOutage);
        }
        Ok(())
    }

    /// Phase 2: commit `message` under a reservation from `lock_send`.
    pub fn send_locked(&self, message: Message) {
        let peer = self.peer_side();
        let mut message = message;
        if message.conversation_id == 0 {
            message.conversation_id = self.pair.mint_conversation_id();
        }
        message.message_id = self.pair.mint_message_id();
        // SAFETY: the caller holds the reservation from `lock_send`.
        unsafe { peer.ring.queue_mut() }.push_back(message);
    }

    /// Phase 3: signal, wake observers, and release the reservation
    /// started by `lock_send` (whether or not `send_locked` was called).
    pub fn unlock_send(&self) {
        let peer = self.peer_side();
        // SAFETY: the caller holds the reservation from `lock_send`.
        let filled = unsafe { peer.ring.queue_mut() }.len() as u64 == RING_CAPACITY;
        peer.removal_semaphore.up();
        peer.message_arrival.wake_all();
        if filled {
            peer.queue_full.wake_all();
        }
        peer.ring.lock.unlock().expect("this thread holds the reservation");
    }

    /// Returns `true` if a message is currently queued, without consuming
    /// it.
    pub fn peek(&self) -> bool {
        let own = self.own_side();
        own.ring.lock.lock();
        // SAFETY: `own.ring.lock` is held by this thread.
        let has_message = unsafe { own.ring.queue_mut() }.front().is_some();
        own.ring.lock.unlock().expect("just locked by this thread");
        has_message
    }

    /// Close this endpoint. Idempotent: a second call returns
    /// `already_in_progress`.
    ///
    /// Sets the *peer's* closed-for-receive flag and wakes the peer's
    /// semaphores and close queue (spec.md §4.5) — since this side's
    /// inbox is the peer's send target, the peer's inbox is the one that
    /// will never receive anything more once this side stops sending.
    pub fn close(&self) -> KernelResult<()> {
        let own = self.own_side();
        // Latched before the idempotency swap below: whether the peer had
        // already closed before this call is what determines the return
        // value, not whether it closes moments later.
        let peer_already_closed = own.closed_for_receive.load(Ordering::Acquire);
        if own.close_issued.swap(true, Ordering::AcqRel) {
            return Err(ErrorKind::AlreadyInProgress);
        }
        let peer = self.peer_side();
        peer.closed_for_receive.store(true, Ordering::Release);
        peer.insertion_semaphore.up();
        peer.removal_semaphore.up();
        peer.close.wake_all();
        if self.pair.destruction_refcount.fetch_sub(1, Ordering::AcqRel) == 1 {
            // Both sides closed: drop any messages still queued in either
            // ring rather than leaking their attachments.
            for side in &self.pair.sides {
                side.ring.lock.lock();
                // SAFETY: just locked above.
                unsafe { side.ring.queue_mut() }.clear();
                side.ring.lock.unlock().expect("just locked by this thread");
            }
        }
        // This side's own bookkeeping above always runs exactly once (first
        // and only successful call past the `close_issued` guard), so the
        // shared destruction refcount is never left stuck even when the
        // peer got there first; only the *reported* outcome changes for
        // that case (spec.md §4.5: "closing an already-peer-closed side
        // returns permanent_outage").
        if peer_already_closed {
            return Err(ErrorKind::PermanentOutage);
        }
        Ok(())
    }

    pub fn is_closed_for_receive(&self) -> bool {
        self.own_side().closed_for_receive.load(Ordering::Acquire)
    }

    /// Take out one handle-level reference (a descriptor-table slot, or a
    /// [`crate::ipc::message::Attachment::Channel`] in flight).
    pub(crate) fn handle_retain(&self) {
        self.handle_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop one descriptor-table handle; closes the endpoint once none
    /// remain.
    pub(crate) fn handle_release(&self) -> KernelResult<()> {
        if self.handle_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            match self.close() {
                Ok(()) | Err(ErrorKind::AlreadyInProgress) | Err(ErrorKind::PermanentOutage) => {
                    Ok(())
                }
                Err(err) => Err(err),
            }
        } else {
            Ok(())
        }
    }
}

/// Adapter letting an [`Endpoint`] sit in a process's descriptor table
/// (spec.md §4.6).
pub struct EndpointDescriptor(pub Arc<Endpoint>);

impl crate::process::descriptor::DescriptorObject for EndpointDescriptor {
    fn retain(&self) {
        self.0.handle_retain();
    }

    fn release(&self) -> KernelResult<()> {
        self.0.handle_release()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn send_then_receive_round_trips_a_message() {
        let (a, b) = new_pair();
        a.send(Message::new(vec![1, 2, 3])).unwrap();
        let msg = b.receive().unwrap();
        assert_eq!(msg.body, vec![1, 2, 3]);
        assert_ne!(msg.message_id, 0);
    }

    #[test]
    fn conversation_id_zero_is_minted_nonzero_values_pass_through() {
        let (a, b) = new_pair();
        a.send(Message::new(vec![])).unwrap();
        let first = b.receive().unwrap();
        assert_ne!(first.conversation_id, 0);

        a.send(Message::new(vec![]).with_conversation(42)).unwrap();
        let second = b.receive().unwrap();
        assert_eq!(second.conversation_id, 42);
    }

    #[test]
    fn try_receive_on_empty_inbox_is_no_wait() {
        let (_a, b) = new_pair();
        assert_eq!(b.try_receive().err(), Some(ErrorKind::NoWait));
    }

    #[test]
    fn try_send_past_ring_capacity_is_no_wait() {
        let (a, _b) = new_pair();
        for _ in 0..RING_CAPACITY {
            a.try_send(Message::new(vec![])).unwrap();
        }
        assert_eq!(a.try_send(Message::new(vec![])).unwrap_err(), ErrorKind::NoWait);
    }

    #[test]
    fn closing_one_side_fails_further_sends_into_it() {
        let (a, b) = new_pair();
        b.close().unwrap();
        assert_eq!(a.send(Message::new(vec![])).unwrap_err(), ErrorKind::PermanentOutage);
    }

    #[test]
    fn closing_a_side_lets_the_peers_drained_receive_report_eof() {
        let (a, b) = new_pair();
        a.send(Message::new(vec![9])).unwrap();
        a.close().unwrap();
        // Queued message still drains normally first.
        assert_eq!(b.receive().unwrap().body, vec![9]);
        // Then the peer observes there is nothing more to come.
        assert_eq!(b.receive().err(), Some(ErrorKind::PermanentOutage));
    }

    #[test]
    fn double_close_is_already_in_progress() {
        let (a, _b) = new_pair();
        a.close().unwrap();
        assert_eq!(a.close().unwrap_err(), ErrorKind::AlreadyInProgress);
    }

    #[test]
    fn closing_a_side_whose_peer_already_closed_reports_permanent_outage() {
        let (a, b) = new_pair();
        b.close().unwrap();
        // This is `a`'s own first close, not a repeat -- it still has to
        // run its side of the teardown, just under a different reported
        // outcome than an uncontested close.
        assert_eq!(a.close().err(), Some(ErrorKind::PermanentOutage));
        assert!(a.own_side().close_issued.load(Ordering::Relaxed));
    }

    #[test]
    fn lock_send_reserves_a_slot_that_unlock_send_always_releases() {
        let (a, b) = new_pair();
        a.lock_send().unwrap();
        a.send_locked(Message::new(vec![7]));
        a.unlock_send();
        assert_eq!(b.receive().unwrap().body, vec![7]);
    }

    #[test]
    fn peek_reports_presence_without_consuming() {
        let (a, b) = new_pair();
        assert!(!b.peek());
        a.send(Message::new(vec![])).unwrap();
        assert!(b.peek());
        assert!(b.peek());
        b.receive().unwrap();
        assert!(!b.peek());
    }

    #[test]
    fn descriptor_handle_transfer_leaves_the_channel_open_until_the_last_handle_drops() {
        use crate::process::descriptor::DescriptorObject;

        let (a, _b) = new_pair();
        let descriptor = EndpointDescriptor(a.clone());
        // Simulate a descriptor-transfer-style move: a second table retains
        // the handle before the first table releases its own.
        descriptor.retain();
        assert!(descriptor.release().is_ok());
        assert!(!a.own_side().close_issued.load(Ordering::Relaxed));
        assert!(descriptor.release().is_ok());
        assert!(a.own_side().close_issued.load(Ordering::Relaxed));
    }
}
