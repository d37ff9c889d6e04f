//! End-to-end paging scenarios
//!
//! Small machines (one or two frames) make every eviction path easy to
//! provoke: clean discards, swap-out and swap-in, blocking on pinned
//! frames, storage failures and process exit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use demand_pager::kern::SpinParker;
use demand_pager::vm::MemorySwapStore;
use demand_pager::vm::SwapStore;
use demand_pager::*;

const PAGE: usize = 64;

fn context(frames: usize) -> Arc<KernelMemoryContext> {
    Arc::new(
        KernelMemoryContext::new(
            VmConfig::new()
                .with_page_size(PAGE)
                .with_phys_pages(frames)
                .with_stack_pages(1),
        )
        .unwrap(),
    )
}

/// One read-only text page followed by the stack and argument pages
fn text_image() -> Arc<MemoryImage> {
    let text: Vec<u8> = (0..PAGE as u8).map(|b| b.wrapping_mul(7)).collect();
    Arc::new(MemoryImage::new(PAGE).with_section(".text", true, &text))
}

fn loaded(ctx: &Arc<KernelMemoryContext>, image: Arc<MemoryImage>) -> PagedProcess {
    let mut process = PagedProcess::new(Arc::clone(ctx), image).unwrap();
    process.load_sections().unwrap();
    process
}

fn entry(process: &PagedProcess, vpn: u32) -> vm::TranslationEntry {
    process
        .context()
        .frames()
        .translation(process.address_space().id(), Vpn(vpn))
        .unwrap()
}

fn evictions(ctx: &KernelMemoryContext) -> u64 {
    let stats = ctx.pageout_stats();
    stats.discarded.load(Ordering::Relaxed) + stats.swapped_out.load(Ordering::Relaxed)
}

// ════════════════════════════════════════════════════════════
// Scenarios
// ════════════════════════════════════════════════════════════

#[test]
fn test_two_frames_no_eviction() {
    let ctx = context(2);
    let process = loaded(&ctx, text_image());

    assert_eq!(process.handle_fault(Vpn(0)).unwrap(), FaultOutcome::SectionLoaded);
    assert_eq!(process.handle_fault(Vpn(1)).unwrap(), FaultOutcome::ZeroFilled);

    assert!(entry(&process, 0).valid);
    assert!(entry(&process, 1).valid);
    assert_eq!(evictions(&ctx), 0);
    assert_eq!(ctx.frames().free_count(), 0);
    ctx.audit().unwrap();
}

#[test]
fn test_one_frame_discards_read_only_page() {
    let ctx = context(1);
    let image = text_image();
    let process = loaded(&ctx, Arc::clone(&image));

    process.handle_fault(Vpn(0)).unwrap();
    process.handle_fault(Vpn(1)).unwrap();

    // Text was dropped, not written out
    assert_eq!(entry(&process, 0).state(), PageState::Unmapped);
    assert_eq!(ctx.pageout_stats().discarded.load(Ordering::Relaxed), 1);
    assert_eq!(ctx.swap().stats().writes.load(Ordering::Relaxed), 0);
    assert_eq!(ctx.swap().slots_minted(), 0);

    assert_eq!(process.handle_fault(Vpn(0)).unwrap(), FaultOutcome::SectionLoaded);
    assert_eq!(image.load_count(), 2);

    let mut page = vec![0u8; PAGE];
    assert_eq!(process.accessor().read(0, &mut page), PAGE);
    assert_eq!(page, image.page_bytes(0, 0));
    ctx.audit().unwrap();
}

#[test]
fn test_anonymous_page_survives_swap() {
    let ctx = context(1);
    let process = loaded(&ctx, text_image());
    let stack = process.address_space().vaddr_of(Vpn(1));
    let top = stack + PAGE - 4;

    assert_eq!(process.accessor().write(top, &[0xDE, 0xAD, 0xBE, 0xEF]), 4);

    // Touching the text page pushes the stack out to swap
    process.handle_fault(Vpn(0)).unwrap();
    assert_eq!(entry(&process, 1).state(), PageState::Evicted);
    assert_eq!(ctx.swap().slots_in_use(), 1);

    assert_eq!(process.handle_fault(Vpn(1)).unwrap(), FaultOutcome::SwappedIn);
    assert_eq!(ctx.swap().slots_in_use(), 0);

    let mut page = vec![0xFFu8; PAGE];
    assert_eq!(process.accessor().read(stack, &mut page), PAGE);
    assert!(page[..PAGE - 4].iter().all(|&b| b == 0));
    assert_eq!(&page[PAGE - 4..], &[0xDE, 0xAD, 0xBE, 0xEF]);
    ctx.audit().unwrap();
}

#[test]
fn test_allocate_blocks_until_unpin() {
    let ctx = context(2);
    let process = loaded(&ctx, text_image());
    process.handle_fault(Vpn(0)).unwrap();
    process.handle_fault(Vpn(1)).unwrap();
    let text_frame = entry(&process, 0).ppn;
    let stack_frame = entry(&process, 1).ppn;

    thread::scope(|s| {
        s.spawn(|| ctx.pin(text_frame));
        s.spawn(|| ctx.pin(stack_frame));
    });
    assert_eq!(ctx.frames().pinned_count(), 2);
    assert_eq!(ctx.frames().free_count(), 0);

    let done = AtomicBool::new(false);
    let allocated = thread::scope(|s| {
        let allocator = s.spawn(|| {
            let ppn = ctx.allocate().unwrap();
            done.store(true, Ordering::SeqCst);
            ppn
        });

        while ctx.frames().unpinned_queue().waiters() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        thread::sleep(Duration::from_millis(20));
        assert!(!done.load(Ordering::SeqCst));

        ctx.unpin(text_frame);
        allocator.join().unwrap()
    });

    assert!(done.load(Ordering::SeqCst));
    assert_eq!(allocated, text_frame);
    assert!(ctx.pageout_stats().blocked.load(Ordering::Relaxed) >= 1);
    assert_eq!(entry(&process, 0).state(), PageState::Unmapped);
    // The pinned stack page was never touched
    assert!(entry(&process, 1).valid);

    ctx.release_frame(allocated);
    ctx.unpin(stack_frame);
    ctx.audit().unwrap();
}

// ════════════════════════════════════════════════════════════
// Properties on fixed sequences
// ════════════════════════════════════════════════════════════

#[test]
fn test_read_only_pages_never_swap() {
    let ctx = context(1);
    let image = Arc::new(
        MemoryImage::new(PAGE)
            .with_filled_section(".text", true, 2, 0x90)
            .with_filled_section(".rodata", true, 1, 0x55),
    );
    let process = loaded(&ctx, Arc::clone(&image));
    let stack = process.address_space().vaddr_of(Vpn(3));

    for round in 0..5u8 {
        for vpn in 0..3 {
            process.handle_fault(Vpn(vpn)).unwrap();
            assert_eq!(entry(&process, vpn).swap_slot, None);
        }
        assert_eq!(process.accessor().write(stack, &[round]), 1);
    }

    for (vpn, section, page) in [(0, 0, 0), (1, 0, 1), (2, 1, 0)] {
        let mut buf = vec![0u8; PAGE];
        let vaddr = process.address_space().vaddr_of(Vpn(vpn));
        assert_eq!(process.accessor().read(vaddr, &mut buf), PAGE);
        assert_eq!(buf, image.page_bytes(section, page));
        assert_eq!(entry(&process, vpn).swap_slot, None);
        assert!(!entry(&process, vpn).dirty);
    }

    let mut last = [0u8];
    process.accessor().read(stack, &mut last);
    assert_eq!(last, [4]);
    ctx.audit().unwrap();
}

#[test]
fn test_processes_share_memory_pressure() {
    let ctx = context(2);
    let a = loaded(&ctx, text_image());
    let b = loaded(&ctx, text_image());
    let stack = a.address_space().vaddr_of(Vpn(1));
    let argv = a.address_space().vaddr_of(Vpn(2));

    for round in 0..4u8 {
        assert_eq!(a.accessor().write(stack, &[round, 0xA]), 2);
        assert_eq!(b.accessor().write(stack, &[round, 0xB]), 2);
        assert_eq!(a.accessor().write(argv, b"a-args"), 6);
        assert_eq!(b.accessor().write(argv, b"b-args"), 6);
        ctx.audit().unwrap();
    }

    let mut buf = [0u8; 2];
    a.accessor().read(stack, &mut buf);
    assert_eq!(buf, [3, 0xA]);
    b.accessor().read(stack, &mut buf);
    assert_eq!(buf, [3, 0xB]);

    let mut args = [0u8; 6];
    b.accessor().read(argv, &mut args);
    assert_eq!(&args, b"b-args");

    drop(a);
    let census = ctx.audit().unwrap();
    assert_eq!(census.total(), 2);
}

#[test]
fn test_concurrent_copies_keep_their_data() {
    let ctx = context(3);
    let image = Arc::new(MemoryImage::new(PAGE).with_filled_section(".data", false, 2, 0));
    let processes: Vec<PagedProcess> = (0..2)
        .map(|_| {
            let mut process = PagedProcess::new(Arc::clone(&ctx), image.clone()).unwrap();
            process.load_sections().unwrap();
            process
        })
        .collect();

    thread::scope(|s| {
        for (p, process) in processes.iter().enumerate() {
            for vpn in 0..process.address_space().num_pages() {
                s.spawn(move || {
                    let vaddr = process.address_space().vaddr_of(Vpn(vpn as u32));
                    let tag = (p * 16 + vpn) as u8;
                    for i in 0..50u8 {
                        let pattern = vec![tag ^ i; PAGE];
                        assert_eq!(process.accessor().write(vaddr, &pattern), PAGE);
                        let mut back = vec![0u8; PAGE];
                        assert_eq!(process.accessor().read(vaddr, &mut back), PAGE);
                        assert_eq!(back, pattern);
                    }
                });
            }
        }
    });

    assert_eq!(ctx.frames().pinned_count(), 0);
    let census = ctx.audit().unwrap();
    assert_eq!(census.total(), 3);
}

// ════════════════════════════════════════════════════════════
// Process lifecycle
// ════════════════════════════════════════════════════════════

#[test]
fn test_unload_frees_frames_and_slots() {
    let ctx = context(1);
    let mut process = loaded(&ctx, text_image());
    let stack = process.address_space().vaddr_of(Vpn(1));
    let argv = process.address_space().vaddr_of(Vpn(2));

    process.accessor().write(stack, b"s");
    process.accessor().write(argv, b"a");
    assert_eq!(ctx.swap().slots_in_use(), 1);

    process.unload_sections();
    assert_eq!(ctx.swap().slots_in_use(), 0);
    assert_eq!(ctx.frames().free_count(), 1);

    // Drop after an explicit unload releases nothing twice
    drop(process);
    assert_eq!(ctx.audit().unwrap().free, 1);
}

#[test]
fn test_unload_while_pinned_keeps_frame_out_of_reach() {
    let ctx = context(2);
    let mut first = loaded(&ctx, text_image());
    let stack = first.address_space().vaddr_of(Vpn(1));
    assert_eq!(first.accessor().write(stack, b"copy"), 4);

    // A copy into the stack page is still running when the process exits
    let pinned = entry(&first, 1).ppn;
    ctx.pin(pinned);
    first.unload_sections();
    assert_eq!(ctx.frames().free_count(), 1);

    let second = loaded(&ctx, text_image());
    second.handle_fault(Vpn(0)).unwrap();
    second.handle_fault(Vpn(1)).unwrap();
    assert_ne!(entry(&second, 1).ppn, pinned);
    assert_eq!(entry(&second, 0).state(), PageState::Unmapped);

    let mut buf = [0u8; 4];
    ctx.memory().read(pinned, 0, &mut buf);
    assert_eq!(&buf, b"copy");
    let census = ctx.audit().unwrap();
    assert_eq!((census.free, census.owned, census.reserved), (0, 1, 1));

    ctx.unpin(pinned);
    let census = ctx.audit().unwrap();
    assert_eq!((census.free, census.owned, census.reserved), (1, 1, 0));
}

#[test]
fn test_eager_process_exhaustion_leaves_no_state() {
    let ctx = context(2);
    let image = Arc::new(MemoryImage::new(PAGE).with_filled_section(".text", true, 1, 1));
    let mut process = EagerProcess::new(Arc::clone(&ctx), image).unwrap();

    assert_eq!(
        process.load_sections(),
        Err(VmError::ResourceExhausted {
            needed: 3,
            available: 2
        })
    );
    let census = ctx.audit().unwrap();
    assert_eq!((census.free, census.owned, census.reserved), (2, 0, 0));
}

#[test]
fn test_fragmented_image_is_rejected() {
    struct Gapped;

    impl ExecutableImage for Gapped {
        fn section_count(&self) -> usize {
            2
        }

        fn section(&self, index: usize) -> Option<SectionInfo> {
            Some(SectionInfo {
                name: format!(".s{index}"),
                first_vpn: Vpn(index as u32 * 2),
                length: 1,
                read_only: false,
            })
        }

        fn load_page(&self, _section: usize, _page: usize, frame: &mut [u8]) {
            frame.fill(0);
        }
    }

    let ctx = context(2);
    assert!(matches!(
        PagedProcess::new(ctx, Arc::new(Gapped)),
        Err(VmError::InvalidImage(ImageError::Fragmented { section: 1, .. }))
    ));
}

// ════════════════════════════════════════════════════════════
// Backing stores
// ════════════════════════════════════════════════════════════

/// Store that fails every write once `broken` is set
struct FlakyStore {
    inner: MemorySwapStore,
    broken: Arc<AtomicBool>,
}

impl SwapStore for FlakyStore {
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), StoreError> {
        self.inner.read(offset, buf)
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<(), StoreError> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::ErrorKind::Other));
        }
        self.inner.write(offset, buf)
    }

    fn len(&self) -> u64 {
        self.inner.len()
    }

    fn destroy(&mut self) -> Result<(), StoreError> {
        self.inner.destroy()
    }
}

#[test]
fn test_storage_fault_fails_only_the_faulting_access() {
    let broken = Arc::new(AtomicBool::new(false));
    let store = FlakyStore {
        inner: MemorySwapStore::new(),
        broken: Arc::clone(&broken),
    };
    let ctx = Arc::new(
        KernelMemoryContext::with_store(
            VmConfig::new()
                .with_page_size(PAGE)
                .with_phys_pages(1)
                .with_stack_pages(1),
            Box::new(store),
            Arc::new(SpinParker),
        )
        .unwrap(),
    );
    let process = loaded(&ctx, text_image());
    let stack = process.address_space().vaddr_of(Vpn(1));
    let argv = process.address_space().vaddr_of(Vpn(2));
    assert_eq!(process.accessor().write(stack, b"keep"), 4);

    broken.store(true, Ordering::SeqCst);
    assert!(matches!(
        process.handle_fault(Vpn(2)),
        Err(VmError::StorageFault {
            op: SwapOp::Write,
            ..
        })
    ));
    assert_eq!(process.accessor().write(argv, b"lost"), 0);

    // The victim stayed mapped with its contents
    let stack_entry = entry(&process, 1);
    assert!(stack_entry.valid && !stack_entry.in_transit);
    let mut buf = [0u8; 4];
    assert_eq!(process.accessor().read(stack, &mut buf), 4);
    assert_eq!(&buf, b"keep");
    assert_eq!(ctx.swap().slots_in_use(), 0);
    ctx.audit().unwrap();

    broken.store(false, Ordering::SeqCst);
    assert_eq!(process.accessor().write(argv, b"ok"), 2);
    assert_eq!(entry(&process, 1).state(), PageState::Evicted);
}

#[test]
fn test_file_backed_swap() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pager.swap");
    let ctx = Arc::new(
        KernelMemoryContext::new(
            VmConfig::new()
                .with_page_size(PAGE)
                .with_phys_pages(1)
                .with_stack_pages(2)
                .with_swap_file(path.to_str().unwrap()),
        )
        .unwrap(),
    );
    assert!(path.exists());

    let process = loaded(&ctx, text_image());
    let pages = [(1u32, b"first"), (2, b"secnd"), (3, b"third")];
    for (vpn, data) in pages {
        let vaddr = process.address_space().vaddr_of(Vpn(vpn));
        assert_eq!(process.accessor().write(vaddr, data), 5);
    }
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 2 * PAGE as u64);

    for (vpn, data) in pages {
        let vaddr = process.address_space().vaddr_of(Vpn(vpn));
        let mut buf = [0u8; 5];
        assert_eq!(process.accessor().read(vaddr, &mut buf), 5);
        assert_eq!(&buf, data);
    }

    drop(process);
    ctx.shutdown().unwrap();
    assert!(!path.exists());
}

#[test]
fn test_config_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("vm.conf");
    let swap_path = dir.path().join("vm.swap");
    std::fs::write(
        &config_path,
        format!(
            "[vm]\npage_size = 128\nphys_pages = 2\nswap = {{ file = {:?} }}\n",
            swap_path.display().to_string()
        ),
    )
    .unwrap();

    let config = VmConfig::from_file(&config_path).unwrap();
    assert_eq!(config.swap, SwapBacking::File(swap_path.display().to_string()));

    let ctx = KernelMemoryContext::new(config).unwrap();
    assert_eq!(ctx.page_size(), 128);
    assert!(swap_path.exists());
    ctx.shutdown().unwrap();
    assert!(!swap_path.exists());
}
