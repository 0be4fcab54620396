//! Cross-module integration tests: each test drives a complete,
//! multi-subsystem scenario (channel capacity exhaustion, peer-close
//! wakeups, address-space collision, descriptor handoff on process
//! creation, cross-thread semaphore blocking) rather than exercising one
//! function in isolation. These run on the host, against the same
//! `generic` architecture backend unit tests use (see `arch::generic`):
//! real hardware page tables and interrupt control are out of scope for a
//! hosted process, so nothing here maps a page through the real MMU or
//! copies bytes through a raw physical pointer. Process creation's region
//! -copy path (`process::creation::transfer_regions`) is exercised only
//! with an empty region list for the same reason; the descriptor-handoff
//! half it shares with a real memory transfer is still covered in full.
//!
//! Several assertions below use `Result::err()` rather than
//! `unwrap_err()`: the `Ok` side of a channel/descriptor-table result
//! carries a type with no `Debug` impl, which `unwrap_err` requires even
//! though it never prints it.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anillo_kernel::arch::PageFlags;
use anillo_kernel::error::ErrorKind;
use anillo_kernel::ipc::{new_pair, EndpointDescriptor, Message};
use anillo_kernel::mm::address_space::AddressSpace;
use anillo_kernel::mm::frame_allocator::{self, PAGE_SIZE};
use anillo_kernel::mm::mapping::{Mapping, MappingDescriptor, MappingFlags};
use anillo_kernel::process::{create_child, CreationRequest, Process, ThreadContextRecord};
use anillo_kernel::sync::Semaphore;

#[test]
fn a_full_ring_reports_no_wait_on_the_65th_non_blocking_send() {
    let (a, _b) = new_pair();
    for i in 0..64 {
        a.try_send(Message::new(vec![i as u8]))
            .unwrap_or_else(|_| panic!("send {i} should have fit in the ring"));
    }
    assert_eq!(a.try_send(Message::new(vec![])).unwrap_err(), ErrorKind::NoWait);
}

#[test]
fn an_empty_inbox_reports_no_wait_then_delivers_once_something_arrives() {
    let (a, b) = new_pair();
    assert_eq!(b.try_receive().err(), Some(ErrorKind::NoWait));

    a.send(Message::new(b"hi".to_vec())).unwrap();
    let msg = b.try_receive().unwrap();
    assert_eq!(msg.body, b"hi");
}

#[test]
fn a_blocking_receive_wakes_with_permanent_outage_once_its_peer_closes() {
    let (a, b) = new_pair();
    let b_in_thread = b.clone();
    let receiver = thread::spawn(move || b_in_thread.receive());

    // Give the spawned thread a chance to actually park on the empty
    // ring before the close races it.
    thread::sleep(Duration::from_millis(20));
    a.close().unwrap();

    assert_eq!(receiver.join().unwrap().err(), Some(ErrorKind::PermanentOutage));
    assert_eq!(a.send(Message::new(vec![])).unwrap_err(), ErrorKind::PermanentOutage);
}

#[test]
fn a_virtual_address_hint_that_collides_with_an_installed_mapping_is_already_in_progress() {
    frame_allocator::global().register_region(400_000 * PAGE_SIZE, 16);
    let space = AddressSpace::new(0x4000_0000, 256).unwrap();

    let first = Mapping::new(4, MappingFlags::empty()).unwrap();
    first.insert_allocated_portion(0, 4, 0).unwrap();
    let hint = 0x4000_0000;
    let chosen = space
        .insert_mapping(first, 0, 4, Some(hint), PageFlags::PRESENT | PageFlags::WRITABLE)
        .unwrap();
    assert_eq!(chosen, hint);

    let second = Mapping::new(4, MappingFlags::empty()).unwrap();
    second.insert_allocated_portion(0, 4, 0).unwrap();
    assert_eq!(
        space.insert_mapping(second, 0, 4, Some(hint), PageFlags::PRESENT),
        Err(ErrorKind::AlreadyInProgress)
    );
}

#[test]
fn process_creation_hands_a_mapping_and_a_channel_to_the_child_without_disturbing_either() {
    frame_allocator::global().register_region(500_000 * PAGE_SIZE, 16);
    let parent = Process::new(None, 0x5000_0000, 256, 1).unwrap();

    let mapping = Mapping::new(4, MappingFlags::empty()).unwrap();
    mapping.insert_allocated_portion(0, 4, 0).unwrap();

    let (channel_a, channel_b) = new_pair();

    // Installed in the order the child's descriptor table must mirror:
    // the channel lands at DID 0, the mapping at DID 1.
    let channel_did = parent.descriptors.install(Arc::new(EndpointDescriptor(channel_a.clone())));
    let mapping_did = parent.descriptors.install(Arc::new(MappingDescriptor(mapping.clone())));
    assert_eq!(mapping.refcount(), 2);

    let request = CreationRequest {
        parent: parent.clone(),
        thread_context: ThreadContextRecord {
            registers: [0; 32],
            flags: 0,
            stack_pointer: 0,
        },
        regions: Vec::new(),
        transfer_dids: vec![mapping_did, channel_did],
        redirect_stack_to_default: false,
        default_user_stack: 0,
        child_virt_base: 0x6000_0000,
        child_virt_page_count: 256,
        initial_thread: 2,
    };
    let child = create_child(request).unwrap();

    // The parent no longer has either descriptor...
    assert_eq!(parent.descriptors.lookup(mapping_did, false).err(), Some(ErrorKind::NoSuchResource));
    assert_eq!(parent.descriptors.lookup(channel_did, false).err(), Some(ErrorKind::NoSuchResource));
    // ...but the child does, at the same DIDs.
    assert!(child.descriptors.lookup(mapping_did, false).is_ok());
    assert!(child.descriptors.lookup(channel_did, false).is_ok());

    // Transfer is a wash on the objects' own refcounts: one table's
    // install balances the other's uninstall.
    assert_eq!(mapping.refcount(), 2);
    assert!(!channel_a.is_closed_for_receive());

    // The channel itself still works after changing hands.
    channel_b.send(Message::new(vec![5])).unwrap();
    assert_eq!(channel_a.receive().unwrap().body, vec![5]);
}

#[test]
fn a_semaphore_down_on_one_thread_blocks_until_another_thread_ups_it() {
    let sem = Arc::new(Semaphore::new(0));
    let waiter = sem.clone();
    let handle = thread::spawn(move || {
        waiter.down();
        "woken"
    });

    thread::sleep(Duration::from_millis(20));
    assert_eq!(sem.count(), 0);
    sem.up();

    assert_eq!(handle.join().unwrap(), "woken");
}
