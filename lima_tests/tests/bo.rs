// Copyright 2024 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::os::fd::{BorrowedFd, OwnedFd};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Result};
use lima::kernel::{GemObject, GpuInfo, KernelResult, SubmitRequest, SubmitResponse, VaOp};
use lima::sim::{SimKernel, SimOp};
use lima::{
    Bo, BoAccess, ClearFlags, Errno, Error, ExternalHandle, HandleKind, Kernel, Pipe, Screen,
    ScreenOptions, PAGE_SIZE,
};
use lima_tests::{TestDevice, TestParams};

#[test]
fn sizes_round_to_pages_and_updates_are_idempotent() -> Result<()> {
    let dev = TestDevice::new(&TestParams::default())?;
    let bo = dev.screen.bo_create(100, 0)?;
    assert_eq!(u64::from(bo.size()), PAGE_SIZE);
    assert!(!bo.is_mapped());
    assert_eq!(bo.va(), None);

    bo.update(true, false)?;
    assert!(bo.is_mapped());
    assert_eq!(bo.va(), None);
    let mmaps = dev.sim.mmap_count();
    bo.update(true, false)?;
    assert_eq!(dev.sim.mmap_count(), mmaps);

    bo.update(true, true)?;
    let va = bo.va().expect("update assigns an address");
    assert_eq!(dev.sim.va_of(bo.handle()), Some(va));
    bo.update(false, true)?;
    assert_eq!(bo.va(), Some(va));
    Ok(())
}

#[test]
fn imports_of_the_same_buffer_share_one_object() -> Result<()> {
    let dev = TestDevice::new(&TestParams::default())?;
    let original = dev.screen.bo_create(8192, 0)?;
    original.update(true, true)?;
    original.write(0, b"lima")?;

    for kind in [HandleKind::SharedName, HandleKind::KmsHandle, HandleKind::DmaBuf] {
        let imported = dev.screen.bo_import(original.export(kind)?)?;
        assert!(Bo::ptr_eq(&imported, &original), "{kind:?}");
        assert_eq!(original.refcount(), 2, "{kind:?}");
        assert_eq!(imported.read(0, 4)?, b"lima");
    }
    assert_eq!(dev.screen.bo_count(), 1);
    Ok(())
}

#[test]
fn the_last_reference_releases_kernel_resources_once() -> Result<()> {
    let dev = TestDevice::new(&TestParams::default())?;
    let free_va = dev.screen.va_free_bytes();
    let bo = dev.screen.bo_create(4096, 0)?;
    bo.update(true, true)?;
    let name = match bo.export(HandleKind::SharedName)? {
        ExternalHandle::SharedName(name) => name,
        other => panic!("unexpected handle {other:?}"),
    };
    let second = dev.screen.bo_import(ExternalHandle::SharedName(name))?;
    let handles = dev.sim.live_handles();

    drop(bo);
    assert!(second.is_mapped());
    assert_eq!(second.read(0, 4)?, [0; 4]);
    assert_eq!(dev.sim.closed_handles(), 0);

    drop(second);
    assert_eq!(dev.sim.closed_handles(), 1);
    assert_eq!(dev.sim.live_handles(), handles - 1);
    assert_eq!(dev.sim.live_mappings(), 0);
    assert_eq!(dev.screen.va_free_bytes(), free_va);
    assert_eq!(dev.screen.bo_count(), 0);
    Ok(())
}

#[test]
fn dma_buf_imports_take_the_size_from_the_file() -> Result<()> {
    let dev = TestDevice::new(&TestParams::default())?;
    let bo = dev.screen.bo_create(3 * 4096, 0)?;
    let ExternalHandle::DmaBuf(fd) = bo.export(HandleKind::DmaBuf)? else {
        panic!("expected a dma-buf");
    };
    let fd2 = fd.try_clone()?;
    // Forget the original so the import registers a new object.
    drop(bo);
    let imported = dev.screen.bo_import(ExternalHandle::DmaBuf(fd))?;
    assert_eq!(imported.size(), 3 * 4096);
    assert!(matches!(
        dev.screen
            .bo_import_with_size(ExternalHandle::DmaBuf(fd2), 4 * 4096),
        Err(Error::ProtocolMismatch {
            expected: 16384,
            actual: 12288
        })
    ));
    assert_eq!(imported.refcount(), 1);
    Ok(())
}

#[test]
fn unknown_kms_handles_are_rejected() -> Result<()> {
    let dev = TestDevice::new(&TestParams::default())?;
    assert!(matches!(
        dev.screen.bo_import(ExternalHandle::KmsHandle(77)),
        Err(Error::InvalidHandle(77))
    ));
    Ok(())
}

#[test]
fn failed_gpu_mapping_returns_the_address_range() -> Result<()> {
    let dev = TestDevice::new(&TestParams::default())?;
    let free_va = dev.screen.va_free_bytes();
    let bo = dev.screen.bo_create(4096, 0)?;
    dev.sim.inject_fault(SimOp::GemVa, Errno::ENOMEM);
    assert!(matches!(
        bo.update(true, true),
        Err(Error::KernelRejected(Errno::ENOMEM))
    ));
    assert!(bo.is_mapped());
    assert_eq!(bo.va(), None);
    assert_eq!(dev.screen.va_free_bytes(), free_va);

    bo.update(true, true)?;
    assert!(bo.va().is_some());
    Ok(())
}

#[test]
fn failed_creation_leaks_nothing() -> Result<()> {
    let dev = TestDevice::new(&TestParams::default())?;
    dev.sim.inject_fault(SimOp::GemCreate, Errno::ENOMEM);
    assert!(matches!(
        dev.screen.bo_create(4096, 0),
        Err(Error::AllocationFailed(Errno::ENOMEM))
    ));
    assert_eq!(dev.sim.live_handles(), 0);
    assert_eq!(dev.screen.bo_count(), 0);
    Ok(())
}

#[test]
fn busy_buffers_time_out() -> Result<()> {
    let dev = TestDevice::new(&TestParams::default())?;
    let (mut ctx, surface) = dev.context_with_surface(32, 32)?;
    dev.sim.hold(Pipe::Pp, true);
    ctx.clear(ClearFlags::COLOR, [1.0; 4], 1.0, 0)?;
    ctx.flush()?;
    let color = &surface.color().bo;
    assert!(color
        .wait(BoAccess::READ, 1_000_000, true)
        .is_err_and(|err| err.is_timeout()));
    dev.sim.hold(Pipe::Pp, false);
    color.wait(BoAccess::READ, 1_000_000, true)?;
    Ok(())
}

/// A kernel that runs other threads against the screen while one chosen
/// handle is being closed.
#[derive(Debug)]
struct ClosingKernel {
    sim: Arc<SimKernel>,
    screen: OnceLock<Screen>,
    watch: AtomicU32,
    /// Set if another thread could use the buffer table during the close.
    table_usable: AtomicBool,
    /// The dma-buf to import while the watched handle closes.
    import_fd: Mutex<Option<OwnedFd>>,
    importer: Mutex<Option<JoinHandle<lima::Result<Bo>>>>,
    imported_handle: Mutex<Option<Sender<u32>>>,
}

impl ClosingKernel {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            sim: Arc::new(SimKernel::mali400(1)),
            screen: OnceLock::new(),
            watch: AtomicU32::new(0),
            table_usable: AtomicBool::new(false),
            import_fd: Mutex::new(None),
            importer: Mutex::new(None),
            imported_handle: Mutex::new(None),
        })
    }

    fn screen(self: &Arc<Self>) -> Result<Screen> {
        let screen = Screen::new(self.clone(), ScreenOptions::default())?;
        self.screen
            .set(screen.clone())
            .map_err(|_| anyhow!("screen already set"))?;
        Ok(screen)
    }

    fn closing(&self, screen: &Screen) {
        let probe = screen.clone();
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || tx.send(probe.bo_count()));
        let usable = rx.recv_timeout(Duration::from_secs(5)).is_ok();
        self.table_usable.store(usable, Ordering::SeqCst);

        let fd = self.import_fd.lock().unwrap().take();
        if let Some(fd) = fd {
            let (tx, rx): (Sender<u32>, Receiver<u32>) = mpsc::channel();
            *self.imported_handle.lock().unwrap() = Some(tx);
            let screen = screen.clone();
            let importer =
                std::thread::spawn(move || screen.bo_import(ExternalHandle::DmaBuf(fd)));
            // Let the import see the handle that is being closed.
            let handle = rx.recv_timeout(Duration::from_secs(5)).ok();
            assert_eq!(handle, Some(self.watch.load(Ordering::SeqCst)));
            *self.importer.lock().unwrap() = Some(importer);
        }
    }
}

impl Kernel for ClosingKernel {
    fn query_info(&self) -> KernelResult<GpuInfo> {
        self.sim.query_info()
    }

    fn gem_create(&self, size: u32, flags: u32) -> KernelResult<GemObject> {
        self.sim.gem_create(size, flags)
    }

    fn gem_info(&self, handle: u32) -> KernelResult<u64> {
        self.sim.gem_info(handle)
    }

    fn gem_close(&self, handle: u32) -> KernelResult<()> {
        if handle == self.watch.load(Ordering::SeqCst) {
            if let Some(screen) = self.screen.get() {
                self.closing(screen);
            }
        }
        self.sim.gem_close(handle)
    }

    fn gem_flink(&self, handle: u32) -> KernelResult<u32> {
        self.sim.gem_flink(handle)
    }

    fn gem_open(&self, name: u32) -> KernelResult<GemObject> {
        self.sim.gem_open(name)
    }

    fn prime_fd_to_handle(&self, fd: BorrowedFd<'_>) -> KernelResult<u32> {
        let handle = self.sim.prime_fd_to_handle(fd)?;
        let tx = self
            .imported_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = tx {
            let _ = tx.send(handle);
        }
        Ok(handle)
    }

    fn prime_handle_to_fd(&self, handle: u32) -> KernelResult<OwnedFd> {
        self.sim.prime_handle_to_fd(handle)
    }

    unsafe fn mmap(&self, offset: u64, size: usize) -> KernelResult<NonNull<u8>> {
        // SAFETY: forwarded with the caller's guarantees.
        unsafe { self.sim.mmap(offset, size) }
    }

    unsafe fn munmap(&self, ptr: NonNull<u8>, size: usize) -> KernelResult<()> {
        // SAFETY: forwarded with the caller's guarantees.
        unsafe { self.sim.munmap(ptr, size) }
    }

    fn gem_va(&self, handle: u32, op: VaOp, va: u32) -> KernelResult<()> {
        self.sim.gem_va(handle, op, va)
    }

    fn gem_submit(&self, request: &SubmitRequest<'_>) -> KernelResult<SubmitResponse> {
        self.sim.gem_submit(request)
    }

    fn wait_fence(&self, ctx: u32, pipe: Pipe, seq: u32, deadline: u64) -> KernelResult<()> {
        self.sim.wait_fence(ctx, pipe, seq, deadline)
    }

    fn gem_wait(&self, handle: u32, access: BoAccess, deadline: u64) -> KernelResult<()> {
        self.sim.gem_wait(handle, access, deadline)
    }

    fn fence_export(&self, ctx: u32, pipe: Pipe, seq: u32) -> KernelResult<OwnedFd> {
        self.sim.fence_export(ctx, pipe, seq)
    }

    fn ctx_create(&self) -> KernelResult<u32> {
        self.sim.ctx_create()
    }

    fn ctx_free(&self, ctx: u32) -> KernelResult<()> {
        self.sim.ctx_free(ctx)
    }
}

#[test]
fn the_table_stays_usable_while_a_handle_closes() -> Result<()> {
    let kernel = ClosingKernel::new();
    let screen = kernel.screen()?;
    let bo = screen.bo_create(4096, 0)?;
    bo.update(true, true)?;
    let clone = bo.clone();
    kernel.watch.store(bo.handle(), Ordering::SeqCst);

    drop(clone);
    assert!(!kernel.table_usable.load(Ordering::SeqCst));
    drop(bo);
    assert!(kernel.table_usable.load(Ordering::SeqCst));
    assert_eq!(screen.bo_count(), 0);
    Ok(())
}

#[test]
fn imports_racing_a_close_get_a_fresh_handle() -> Result<()> {
    let kernel = ClosingKernel::new();
    let screen = kernel.screen()?;
    let bo = screen.bo_create(2 * 4096, 0)?;
    let closing = bo.handle();
    let ExternalHandle::DmaBuf(fd) = bo.export(HandleKind::DmaBuf)? else {
        panic!("expected a dma-buf");
    };
    *kernel.import_fd.lock().unwrap() = Some(fd);
    kernel.watch.store(closing, Ordering::SeqCst);

    drop(bo);
    let importer = kernel.importer.lock().unwrap().take();
    let imported = importer
        .ok_or_else(|| anyhow!("no import was started"))?
        .join()
        .map_err(|_| anyhow!("import panicked"))??;
    assert_ne!(imported.handle(), closing);
    assert_eq!(imported.size(), 2 * 4096);
    assert_eq!(imported.refcount(), 1);
    assert_eq!(screen.bo_count(), 1);
    assert_eq!(kernel.sim.live_handles(), 1);
    Ok(())
}
