//! End-to-end exercises of the copy-on-write fork protocol, driven
//! through the modeled privileged layer.

use teos::{
    FaultCode, FaultFrame, Kernel, KernelError, SystemConfiguration,
    addressing::{EXCEPTION_STACK_TOP, PAGE_SIZE, USER_TOP, Va},
    env::{EnvId, EnvStatus},
    mm::page_table::PteFlags,
};
use teos_fork::{ForkReturn, fork, handle_cow_fault, init_self_slot, self_id, set_fault_handler};
use teos_fork::fork::SELF_SLOT;

/// A private data page, alone in its directory span.
const DATA: usize = 0x0080_0000;
/// A shared page, in a different directory span.
const SHARED_PAGE: usize = 0x00a0_0000;
/// A read-only page, alone in its directory span so no writable sibling
/// bleeds permissions into its directory entry.
const RO: usize = 0x0100_0000;

fn va(addr: usize) -> Va {
    Va::new(addr).unwrap()
}

fn rw_user() -> PteFlags {
    PteFlags::P | PteFlags::RW | PteFlags::US
}

fn xstack_page() -> Va {
    EXCEPTION_STACK_TOP - PAGE_SIZE
}

fn boot() -> (Kernel, EnvId) {
    boot_with_frames(1024)
}

fn boot_with_frames(frames: usize) -> (Kernel, EnvId) {
    let mut kern = Kernel::new(SystemConfiguration::default().with_frames(frames));
    let root = kern.spawn_initial().unwrap();
    init_self_slot(&mut kern).unwrap();
    (kern, root)
}

fn write_u64(kern: &mut Kernel, at: Va, val: u64) {
    kern.user_write(at, &val.to_le_bytes()).unwrap();
}

fn read_u64(kern: &mut Kernel, at: Va) -> u64 {
    let mut raw = [0u8; 8];
    kern.user_read(at, &mut raw).unwrap();
    u64::from_le_bytes(raw)
}

/// Forks in the current environment, expecting the parent continuation.
fn fork_child(kern: &mut Kernel) -> EnvId {
    match fork(kern).unwrap() {
        ForkReturn::Parent(child) => child,
        ForkReturn::Child => panic!("parent continuation expected"),
    }
}

/// Schedules `child` and plays its first resumption, which re-enters
/// `fork` and must observe the child continuation.
fn enter_child(kern: &mut Kernel, child: EnvId) {
    kern.run(child).unwrap();
    assert_eq!(fork(kern).unwrap(), ForkReturn::Child);
}

fn syscall_bits(flags: PteFlags) -> PteFlags {
    flags & PteFlags::SYSCALL
}

#[test]
fn private_page_is_cow_on_both_sides() {
    let (mut kern, root) = boot();
    kern.sys_page_alloc(root, va(DATA), rw_user()).unwrap();
    write_u64(&mut kern, va(DATA), 5);

    let child = fork_child(&mut kern);

    for env in [root, child] {
        let (_, flags) = kern.probe(env, va(DATA)).unwrap();
        assert_eq!(
            syscall_bits(flags),
            PteFlags::P | PteFlags::US | PteFlags::COW,
            "{:?} must hold the page copy-on-write, not writable",
            env
        );
    }
    let (parent_pa, _) = kern.probe(root, va(DATA)).unwrap();
    let (child_pa, _) = kern.probe(child, va(DATA)).unwrap();
    assert_eq!(parent_pa, child_pa, "one frame shared until first write");
    assert_eq!(kern.frame_refs(parent_pa), 2);
}

#[test]
fn parent_write_leaves_child_view_intact() {
    // Parent holds 5 at DATA, forks, writes 9; the child still reads 5.
    let (mut kern, root) = boot();
    kern.sys_page_alloc(root, va(DATA), rw_user()).unwrap();
    write_u64(&mut kern, va(DATA), 5);
    let child = fork_child(&mut kern);

    let shared_pa = kern.probe(root, va(DATA)).unwrap().0;
    write_u64(&mut kern, va(DATA), 9);
    assert_eq!(read_u64(&mut kern, va(DATA)), 9);

    // The write traded the shared frame for a private copy.
    let (parent_pa, parent_flags) = kern.probe(root, va(DATA)).unwrap();
    assert_ne!(parent_pa, shared_pa);
    assert_eq!(syscall_bits(parent_flags), rw_user());
    assert_eq!(kern.frame_refs(shared_pa), 1, "only the child holds it now");
    assert_eq!(kern.frame_refs(parent_pa), 1);

    enter_child(&mut kern, child);
    assert_eq!(read_u64(&mut kern, va(DATA)), 5);
}

#[test]
fn each_side_faults_into_its_own_copy() {
    let (mut kern, root) = boot();
    kern.sys_page_alloc(root, va(DATA), rw_user()).unwrap();
    write_u64(&mut kern, va(DATA), 5);
    let child = fork_child(&mut kern);

    write_u64(&mut kern, va(DATA), 9);

    enter_child(&mut kern, child);
    // The child's first fault copies the original content, not the
    // parent's mutation.
    assert_eq!(read_u64(&mut kern, va(DATA)), 5);
    write_u64(&mut kern, va(DATA), 7);
    assert_eq!(read_u64(&mut kern, va(DATA)), 7);

    kern.run(root).unwrap();
    assert_eq!(read_u64(&mut kern, va(DATA)), 9);
}

#[test]
fn shared_page_is_visible_both_ways_without_faults() {
    let (mut kern, root) = boot();
    kern.sys_page_alloc(root, va(SHARED_PAGE), rw_user() | PteFlags::SHARED)
        .unwrap();
    let child = fork_child(&mut kern);
    enter_child(&mut kern, child);

    // From here on, any fault resolution would invoke mapping primitives.
    let ops = kern.mapping_ops();
    write_u64(&mut kern, va(SHARED_PAGE), 1);
    kern.run(root).unwrap();
    assert_eq!(read_u64(&mut kern, va(SHARED_PAGE)), 1);
    write_u64(&mut kern, va(SHARED_PAGE), 2);
    kern.run(child).unwrap();
    assert_eq!(read_u64(&mut kern, va(SHARED_PAGE)), 2);
    assert_eq!(kern.mapping_ops(), ops, "no fault may be taken");

    // Same frame, flags limited to what may cross the boundary.
    let (parent_pa, parent_flags) = kern.probe(root, va(SHARED_PAGE)).unwrap();
    let (child_pa, child_flags) = kern.probe(child, va(SHARED_PAGE)).unwrap();
    assert_eq!(parent_pa, child_pa);
    assert_eq!(syscall_bits(child_flags), rw_user() | PteFlags::SHARED);
    assert!(syscall_bits(parent_flags).contains(PteFlags::SHARED));
}

#[test]
fn read_only_page_keeps_its_permissions() {
    let (mut kern, root) = boot();
    kern.sys_page_alloc(root, va(RO), PteFlags::P | PteFlags::US)
        .unwrap();
    let child = fork_child(&mut kern);

    let (parent_pa, parent_flags) = kern.probe(root, va(RO)).unwrap();
    let (child_pa, child_flags) = kern.probe(child, va(RO)).unwrap();
    assert_eq!(parent_pa, child_pa);
    assert_eq!(syscall_bits(parent_flags), PteFlags::P | PteFlags::US);
    assert_eq!(syscall_bits(child_flags), syscall_bits(parent_flags));
    assert!(!child_flags.contains(PteFlags::COW));

    // Reading on either side stays fault-free.
    let ops = kern.mapping_ops();
    let _ = read_u64(&mut kern, va(RO));
    enter_child(&mut kern, child);
    let _ = read_u64(&mut kern, va(RO));
    // The child entry resolves one fault for its self slot; reads of the
    // read-only page itself must not add mapping traffic beyond that.
    let resolution_ops = 3; // allocate, re-map, unmap of one staging pass
    assert!(kern.mapping_ops() - ops <= resolution_ops);
}

#[test]
fn writable_bit_at_directory_level_still_means_mutable() {
    // A page whose leaf entry was downgraded to read-only keeps counting
    // as mutable while its directory entry remembers the writable
    // install. The downgrade must survive the fork as copy-on-write.
    let (mut kern, root) = boot();
    kern.sys_page_alloc(root, va(DATA), rw_user()).unwrap();
    kern.sys_page_map(root, va(DATA), root, va(DATA), PteFlags::P | PteFlags::US)
        .unwrap();
    let (_, flags) = kern.probe(root, va(DATA)).unwrap();
    assert!(!flags.contains(PteFlags::RW));

    let child = fork_child(&mut kern);
    let (_, child_flags) = kern.probe(child, va(DATA)).unwrap();
    assert!(child_flags.contains(PteFlags::COW));
    let (_, parent_flags) = kern.probe(root, va(DATA)).unwrap();
    assert!(parent_flags.contains(PteFlags::COW));
}

#[test]
fn exception_stacks_are_distinct_frames() {
    let (mut kern, root) = boot();
    let child = fork_child(&mut kern);
    let (parent_pa, parent_flags) = kern.probe(root, xstack_page()).unwrap();
    let (child_pa, child_flags) = kern.probe(child, xstack_page()).unwrap();
    assert_ne!(parent_pa, child_pa);
    assert_eq!(syscall_bits(parent_flags), rw_user());
    assert_eq!(syscall_bits(child_flags), rw_user());
    assert_eq!(kern.frame_refs(parent_pa), 1);
    assert_eq!(kern.frame_refs(child_pa), 1);
}

#[test]
fn child_rederives_its_identity() {
    let (mut kern, root) = boot();
    assert_eq!(self_id(&mut kern).unwrap(), root);
    let child = fork_child(&mut kern);

    // Before the child continuation runs, its self slot is a verbatim
    // copy and still names the parent.
    kern.run(child).unwrap();
    assert_eq!(self_id(&mut kern).unwrap(), root);

    assert_eq!(fork(&mut kern).unwrap(), ForkReturn::Child);
    assert_eq!(self_id(&mut kern).unwrap(), child);

    // The parent's slot never changed.
    kern.run(root).unwrap();
    assert_eq!(self_id(&mut kern).unwrap(), root);
}

#[test]
fn rewriting_the_self_slot_is_the_childs_first_fault() {
    let (mut kern, root) = boot();
    let child = fork_child(&mut kern);
    let shared_pa = kern.probe(root, SELF_SLOT).unwrap().0;
    assert_eq!(kern.probe(child, SELF_SLOT).unwrap().0, shared_pa);

    enter_child(&mut kern, child);
    let (child_pa, child_flags) = kern.probe(child, SELF_SLOT).unwrap();
    assert_ne!(child_pa, shared_pa, "the rewrite must have copied the page");
    assert_eq!(syscall_bits(child_flags), rw_user());
}

#[test]
fn grandchild_forks_cleanly() {
    let (mut kern, _root) = boot();
    let child = fork_child(&mut kern);
    enter_child(&mut kern, child);

    let grandchild = fork_child(&mut kern);
    assert_ne!(grandchild, child);
    enter_child(&mut kern, grandchild);
    assert_eq!(self_id(&mut kern).unwrap(), grandchild);
}

#[test]
fn fork_failure_leaves_child_unstarted() {
    // Measure the frames one fork consumes, then replay with the pool one
    // frame short so the final step, the child's exception stack, fails.
    let (mut kern, root) = boot_with_frames(1024);
    kern.sys_page_alloc(root, va(DATA), rw_user()).unwrap();
    write_u64(&mut kern, va(DATA), 5);
    let used_at_setup = 1024 - kern.free_frames();
    let free_before = kern.free_frames();
    let _ = fork_child(&mut kern);
    let consumed = free_before - kern.free_frames();
    assert!(consumed > 0);

    let (mut kern, root) = boot_with_frames(used_at_setup + consumed - 1);
    kern.sys_page_alloc(root, va(DATA), rw_user()).unwrap();
    write_u64(&mut kern, va(DATA), 5);
    assert_eq!(fork(&mut kern).unwrap_err(), KernelError::NoMemory);

    // The parent survives; the abandoned child exists, is uninitialized,
    // has no exception stack, and can never be given the processor.
    assert_eq!(kern.current(), Some(root));
    let child = EnvId::from_usize(root.into_usize() + 1).unwrap();
    assert_eq!(kern.status_of(child), Some(EnvStatus::Uninit));
    assert_eq!(kern.probe(child, xstack_page()), None);
    assert_eq!(kern.run(child), Err(KernelError::OperationNotPermitted));
}

#[test]
fn no_rollback_but_never_runnable() {
    // Whatever step of the lifecycle exhaustion hits, the outcome is the
    // same contract: an error in the parent, and a child that never
    // becomes runnable. Pages already duplicated stay mapped.
    let (mut kern, root) = boot_with_frames(1024);
    kern.sys_page_alloc(root, va(DATA), rw_user()).unwrap();
    let used_at_setup = 1024 - kern.free_frames();
    let free_before = kern.free_frames();
    let _ = fork_child(&mut kern);
    let consumed = free_before - kern.free_frames();

    for deficit in 1..=consumed {
        let (mut kern, root) = boot_with_frames(used_at_setup + consumed - deficit);
        kern.sys_page_alloc(root, va(DATA), rw_user()).unwrap();
        assert_eq!(
            fork(&mut kern).unwrap_err(),
            KernelError::NoMemory,
            "deficit {}",
            deficit
        );
        assert_eq!(kern.current(), Some(root), "deficit {}", deficit);
        let child = EnvId::from_usize(root.into_usize() + 1).unwrap();
        match kern.status_of(child) {
            // Created before the failing step, abandoned uninitialized.
            Some(EnvStatus::Uninit) | None => {}
            other => panic!("deficit {}: child must not run, got {:?}", deficit, other),
        }
    }
}

#[test]
fn unmapped_write_aborts_without_mapping_calls() {
    let (mut kern, root) = boot();
    set_fault_handler(&mut kern).unwrap();
    let ops = kern.mapping_ops();
    let err = kern.user_write(va(0x0120_0000), &[1]).unwrap_err();
    assert_eq!(err, KernelError::BadAddress);
    assert_eq!(kern.status_of(root), None, "the environment is gone");
    assert_eq!(kern.current(), None);
    assert_eq!(kern.mapping_ops(), ops, "no mapping primitive may run");
}

#[test]
fn write_hole_next_to_a_mapping_aborts() {
    // Directory entry present, leaf absent: still fatal, still without
    // touching any mapping primitive.
    let (mut kern, root) = boot();
    set_fault_handler(&mut kern).unwrap();
    kern.sys_page_alloc(root, va(DATA), rw_user()).unwrap();
    let ops = kern.mapping_ops();
    let err = kern
        .user_write(va(DATA + PAGE_SIZE), &[1])
        .unwrap_err();
    assert_eq!(err, KernelError::BadAddress);
    assert_eq!(kern.status_of(root), None);
    assert_eq!(kern.mapping_ops(), ops);
}

#[test]
fn read_fault_is_fatal() {
    let (mut kern, root) = boot();
    set_fault_handler(&mut kern).unwrap();
    let mut raw = [0u8; 1];
    let err = kern.user_read(va(0x0120_0000), &mut raw).unwrap_err();
    assert_eq!(err, KernelError::InvalidAccess);
    assert_eq!(kern.status_of(root), None);
}

#[test]
fn second_delivery_for_a_resolved_page_is_fatal() {
    let (mut kern, root) = boot();
    kern.sys_page_alloc(root, va(DATA), rw_user()).unwrap();
    write_u64(&mut kern, va(DATA), 5);
    let child = fork_child(&mut kern);
    write_u64(&mut kern, va(DATA), 9); // resolves the parent's fault

    // A re-delivery for the now-private page must classify as fatal.
    let frame = FaultFrame {
        fault_va: va(DATA + 4),
        code: FaultCode::PRESENT | FaultCode::WRITE | FaultCode::USER,
        ip: 0,
    };
    assert_eq!(
        handle_cow_fault(&mut kern, &frame),
        Err(KernelError::InvalidAccess)
    );
    let _ = child;
}

#[test]
fn stale_child_id_is_rejected_after_teardown() {
    let (mut kern, root) = boot();
    kern.sys_page_alloc(root, va(DATA), rw_user()).unwrap();
    let child = fork_child(&mut kern);
    let frames_before = kern.free_frames();
    kern.destroy(child).unwrap();
    assert!(kern.free_frames() > frames_before, "teardown reclaims frames");
    assert_eq!(kern.status_of(child), None);
    assert_eq!(
        kern.sys_page_unmap(child, va(DATA)),
        Err(KernelError::NoSuchEntry)
    );
    // The slot's next occupant is distinguishable from the stale id.
    let next = fork_child(&mut kern);
    assert_eq!(next.slot(), child.slot());
    assert_ne!(next, child);
}

#[test]
fn handler_registration_is_idempotent() {
    let (mut kern, root) = boot();
    set_fault_handler(&mut kern).unwrap();
    let (pa, _) = kern.probe(root, xstack_page()).unwrap();
    set_fault_handler(&mut kern).unwrap();
    // Re-registration does not reprovision the exception stack.
    assert_eq!(kern.probe(root, xstack_page()).unwrap().0, pa);
}

#[test]
fn sweep_reproduces_exactly_the_callers_mappings() {
    // Nothing the caller does not map appears in the child, and every
    // page below the boundary that it does map (bar the exception stack)
    // does.
    let (mut kern, root) = boot();
    kern.sys_page_alloc(root, va(DATA), rw_user()).unwrap();
    let high = USER_TOP - 16 * PAGE_SIZE;
    kern.sys_page_alloc(root, high, rw_user()).unwrap();
    let child = fork_child(&mut kern);

    assert!(kern.probe(child, SELF_SLOT).is_some());
    assert!(kern.probe(child, va(DATA)).is_some());
    assert!(kern.probe(child, high).is_some());
    assert!(kern.probe(child, va(DATA + PAGE_SIZE)).is_none());
    assert!(kern.probe(child, va(SHARED_PAGE)).is_none());
    // The child's exception stack exists but is provisioned, not swept.
    let (child_xstack, _) = kern.probe(child, xstack_page()).unwrap();
    assert_ne!(child_xstack, kern.probe(root, xstack_page()).unwrap().0);
}
