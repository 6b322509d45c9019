use std::collections::BTreeMap;

use dos_memory::pages::PAGE_SIZE;
use dos_memory::xms::kb_to_pages;
use dos_memory::{AddressSpace, MemoryConfig, MemoryManager, MoveDescriptor, PageAllocator, RealPtr, XmsError};

use rand::{Rng, RngCore, SeedableRng};
use test_env_log::test;

// Fill the first `kb` kilobytes of a handle with `tag`
fn stamp(mm: &mut MemoryManager, handle: u16, kb: u32, tag: u8) {
    let base = mm.xms_mut().unwrap().lock(handle).unwrap();
    mm.ram_mut().fill(base, kb * 1024, tag);
    mm.xms_mut().unwrap().unlock(handle).unwrap();
}

fn check_stamp(mm: &mut MemoryManager, handle: u16, kb: u32, tag: u8) {
    let base = mm.xms_mut().unwrap().lock(handle).unwrap();
    let mut buf = vec![0; (kb * 1024) as usize];
    mm.ram().read_bytes(base, &mut buf);
    assert!(buf.iter().all(|&b| b == tag), "handle {} lost its contents", handle);
    mm.xms_mut().unwrap().unlock(handle).unwrap();
}

fn validate(mm: &MemoryManager, live: &BTreeMap<u16, (u32, u8)>) {
    let xms = mm.xms().unwrap();
    let pages = xms.pages();
    let used: u32 = live.values().map(|&(kb, _)| kb_to_pages(kb)).sum();
    log::debug!("{:?}, {} pages used", pages, used);
    assert_eq!(used + pages.free_total(), pages.capacity());
    assert_eq!(xms.allocated().count(), live.len());
    for (handle, kb) in xms.allocated() {
        assert_eq!(live[&handle].0, kb);
    }
}

#[test]
fn test_xms_stress() {
    // 4 MB leaves room for only a few hundred kilobytes per handle
    let mut mm = MemoryManager::new(MemoryConfig {
        ram_bytes: 4 << 20,
        ..MemoryConfig::default()
    })
    .unwrap();
    let mut live: BTreeMap<u16, (u32, u8)> = BTreeMap::new();

    let seed: u64 = rand::thread_rng().next_u64();
    log::info!("Using seed {}", seed);
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);

    for _ in 0..1024 {
        let action = rng.gen_range(0, 3);
        let handle = live.keys().nth(rng.gen_range(0, live.len().max(1))).copied();
        match (action, handle) {
            (0, _) | (_, None) => {
                let kb = rng.gen_range(0, 256);
                let tag: u8 = rng.gen();
                match mm.xms_allocate(kb) {
                    Ok(handle) => {
                        log::debug!("Allocated {}K as handle {}", kb, handle);
                        stamp(&mut mm, handle, kb, tag);
                        live.insert(handle, (kb, tag));
                    }
                    Err(XmsError::OutOfHandles) => assert_eq!(live.len(), 49),
                    Err(XmsError::OutOfSpace) => {
                        let largest = mm.xms().unwrap().pages().free_largest();
                        assert!(largest < kb_to_pages(kb));
                    }
                    Err(e) => panic!("Unexpected allocation failure: {}", e),
                }
            }
            (1, Some(handle)) => {
                let (old_kb, tag) = live[&handle];
                let kb = rng.gen_range(0, 512);
                match mm.xms_resize(handle, kb) {
                    Ok(()) => {
                        log::debug!("Resized handle {} from {}K to {}K", handle, old_kb, kb);
                        check_stamp(&mut mm, handle, old_kb.min(kb), tag);
                        stamp(&mut mm, handle, kb, tag);
                        live.insert(handle, (kb, tag));
                    }
                    Err(XmsError::OutOfSpace) => check_stamp(&mut mm, handle, old_kb, tag),
                    Err(e) => panic!("Unexpected resize failure: {}", e),
                }
            }
            (_, Some(handle)) => {
                let (kb, tag) = live[&handle];
                check_stamp(&mut mm, handle, kb, tag);
                mm.xms_mut().unwrap().free(handle).unwrap();
                live.remove(&handle);
            }
        }

        validate(&mm, &live);
    }

    mm.xms_mut().unwrap().reset();
    let pages = mm.xms().unwrap().pages();
    assert_eq!(pages.free_total(), pages.capacity());
    assert_eq!(pages.free_largest(), pages.capacity());
}

#[test]
fn test_move_through_guest_memory() {
    let mut mm = MemoryManager::new(MemoryConfig::default()).unwrap();
    let first = mm.xms_allocate(8).unwrap();
    let second = mm.xms_allocate(8).unwrap();

    // A program buffer in conventional memory, and its move structures
    let buffer = mm.allocate(0x2000, 0x40).unwrap();
    let ptr = RealPtr::new(buffer, 0);
    let message = b"extended memory!";
    mm.ram_mut().write_bytes(ptr.linear(), message);
    let desc_addr = ptr.linear() + 0x100;

    let steps = [
        // Buffer to the first handle
        MoveDescriptor {
            length: message.len() as u32,
            src_handle: 0,
            src_offset: ptr.packed(),
            dest_handle: first,
            dest_offset: 0x1000,
        },
        // First handle to the second
        MoveDescriptor {
            length: message.len() as u32,
            src_handle: first,
            src_offset: 0x1000,
            dest_handle: second,
            dest_offset: 6,
        },
        // Back to the buffer, past the original
        MoveDescriptor {
            length: message.len() as u32,
            src_handle: second,
            src_offset: 6,
            dest_handle: 0,
            dest_offset: RealPtr::new(buffer, 0x20).packed(),
        },
    ];

    for &enabled in &[false, true] {
        mm.a20_mut().set_line(enabled);
        for desc in &steps {
            desc.write(mm.ram_mut(), desc_addr);
            mm.xms_move(desc_addr).unwrap();
            assert_eq!(mm.a20().is_enabled(), enabled);
            assert_eq!(mm.a20().local_count(), 0);
        }
        let mut copy = [0; 16];
        mm.ram().read_bytes(ptr.linear() + 0x20, &mut copy);
        assert_eq!(&copy, message);
        mm.ram_mut().fill(ptr.linear() + 0x20, 16, 0);
    }

    // Running off the end of a handle moves nothing
    let overrun = MoveDescriptor {
        length: 0x20,
        src_handle: first,
        src_offset: 8 * 1024 - 0x10,
        dest_handle: 0,
        dest_offset: ptr.packed(),
    };
    overrun.write(mm.ram_mut(), desc_addr);
    assert_eq!(mm.xms_move(desc_addr), Err(XmsError::InvalidLength));
    let mut untouched = [0; 16];
    mm.ram().read_bytes(ptr.linear(), &mut untouched);
    assert_eq!(&untouched, message);
}

#[test]
fn test_locked_resize_then_move() {
    let mut mm = MemoryManager::new(MemoryConfig::default()).unwrap();
    let a = mm.xms_allocate(4).unwrap();
    let b = mm.xms_allocate(4).unwrap();
    stamp(&mut mm, a, 4, 0x5a);

    let base = mm.xms_mut().unwrap().lock(a).unwrap();
    assert_eq!(mm.xms_resize(a, 64), Err(XmsError::BlockLocked));
    mm.xms_mut().unwrap().unlock(a).unwrap();

    // b sits right behind a, so a has to move to grow
    mm.xms_resize(a, 64).unwrap();
    let moved = mm.xms_mut().unwrap().lock(a).unwrap();
    mm.xms_mut().unwrap().unlock(a).unwrap();
    assert_ne!(moved, base);
    assert!(moved >= base + PAGE_SIZE);
    check_stamp(&mut mm, a, 4, 0x5a);
    assert_eq!(mm.xms().unwrap().handle_info(b).unwrap().size_kb, 4);
}
