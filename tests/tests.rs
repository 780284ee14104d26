use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use kvfs::block::storage::{FileStorage, MemStorage, StorageDevice};
use kvfs::block::{DevId, Geometry};
use kvfs::fs::SimpleFs;
use kvfs::vfs::{FsFlags, IoContext, OpenFlags, StatMask};
use kvfs::Kernel;
use libc::{EBUSY, EINVAL, ENODEV, ENOENT, ENOTDIR};
use tempfile::TempDir;

const DISK: DevId = DevId::new(8, 0);
const DISK_SIZE: u64 = 4 * 1024 * 1024;

/// A kernel with a file-backed disk mounted on `/`.
struct MountedContext {
    ioctx: IoContext,
    kernel: Kernel,
    _storage_dir: TempDir,
    storage_path: PathBuf,
}

impl MountedContext {
    fn new(flags: FsFlags) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();

        let storage_dir = tempfile::tempdir().expect("failed to create storage dir");
        let storage_path = storage_dir.path().join("disk.img");
        let storage = FileStorage::create(&storage_path, DISK_SIZE).expect("failed to create disk");

        let kernel = Kernel::new();
        kernel
            .devices()
            .register(
                DISK,
                Geometry::new(512, 4096, DISK_SIZE),
                Arc::new(StorageDevice::new(storage)),
            )
            .expect("failed to register disk");
        kernel
            .fs_table()
            .register("simplefs", Arc::new(SimpleFs), flags)
            .expect("failed to register simplefs");
        kernel
            .fs_table()
            .register("ramfs", Arc::new(SimpleFs), FsFlags::PSEUDO)
            .expect("failed to register ramfs");
        kernel
            .mount(None, "/", DISK, "simplefs", "")
            .expect("failed to mount root");
        let ioctx = kernel.create_ioctx(None).expect("failed to create ioctx");

        Self {
            ioctx,
            kernel,
            _storage_dir: storage_dir,
            storage_path,
        }
    }

    fn write(&self, path: &str, data: &[u8]) {
        let fd = self
            .ioctx
            .open(path, OpenFlags::WRONLY | OpenFlags::CREAT, 0o644)
            .expect("failed to open for writing");
        assert_eq!(self.ioctx.write(fd, data).unwrap(), data.len());
        self.ioctx.close(fd).unwrap();
    }

    fn read(&self, path: &str) -> Vec<u8> {
        let fd = self
            .ioctx
            .open(path, OpenFlags::RDONLY, 0)
            .expect("failed to open for reading");
        let size = self.ioctx.fstat(fd, StatMask::SIZE).unwrap().size as usize;
        let mut buf = vec![0u8; size + 16];
        let n = self.ioctx.read(fd, &mut buf).unwrap();
        self.ioctx.close(fd).unwrap();
        buf.truncate(n);
        buf
    }
}

#[test]
fn test_file() {
    let ctx = MountedContext::new(FsFlags::empty());
    let ioctx = &ctx.ioctx;

    let data: Vec<u8> = (0..600u32).map(|i| i as u8).collect();
    ctx.write("/foo", &data);
    assert_eq!(ioctx.getattr("/foo", StatMask::SIZE).unwrap().size, 600);
    assert_eq!(ctx.read("/foo"), data);

    assert_eq!(ioctx.rmdir("/foo"), Err(ENOTDIR));
    ioctx.unlink("/foo").unwrap();
    assert_eq!(ioctx.open("/foo", OpenFlags::RDONLY, 0), Err(ENOENT));
}

#[test]
fn test_in_memory_device() {
    let _ = env_logger::builder().is_test(true).try_init();
    let kernel = Kernel::new();
    let dev = DevId::new(1, 0);
    kernel
        .devices()
        .register(
            dev,
            Geometry::new(512, 4096, 1 << 20),
            Arc::new(StorageDevice::new(MemStorage::new(1 << 20))),
        )
        .unwrap();
    kernel
        .fs_table()
        .register("simplefs", Arc::new(SimpleFs), FsFlags::empty())
        .unwrap();
    kernel.mount(None, "/", dev, "simplefs", "").unwrap();
    let ioctx = kernel.create_ioctx(None).unwrap();

    let fd = ioctx
        .open("foo", OpenFlags::RDWR | OpenFlags::CREAT, 0o644)
        .unwrap();
    assert_eq!(ioctx.write(fd, &[0xA5; 600]).unwrap(), 600);
    ioctx.lseek(fd, 0, libc::SEEK_SET).unwrap();
    let mut buf = [0u8; 1024];
    assert_eq!(ioctx.read(fd, &mut buf).unwrap(), 600);
    assert!(buf[..600].iter().all(|&b| b == 0xA5));
    assert_eq!(ioctx.fstat(fd, StatMask::SIZE).unwrap().size, 600);
    ioctx.close(fd).unwrap();

    assert_eq!(ioctx.rmdir("foo"), Err(ENOTDIR));
    ioctx.unlink("foo").unwrap();
    assert_eq!(ioctx.open("foo", OpenFlags::RDONLY, 0), Err(ENOENT));

    drop(ioctx);
    kernel.unmount_root().unwrap();
    assert!(kernel.mounts().is_empty());
}

#[test]
fn test_dir() {
    let ctx = MountedContext::new(FsFlags::empty());
    let ioctx = &ctx.ioctx;

    ioctx.mkdir("/foo", 0o755).unwrap();
    ctx.write("/foo/hello.txt", b"Hello from kvfs!");
    assert_eq!(ctx.read("/foo/hello.txt"), b"Hello from kvfs!");
    assert!(
        ioctx
            .getattr("/foo", StatMask::MODE_FMT)
            .unwrap()
            .mode
            .is_dir()
    );

    ioctx.unlink("/foo/hello.txt").unwrap();
    ioctx.rmdir("/foo").unwrap();
    assert_eq!(ioctx.getattr("/foo", StatMask::SIZE), Err(ENOENT));
}

#[test]
fn test_fsync_reaches_storage() {
    let ctx = MountedContext::new(FsFlags::empty());
    let data = [0x5Au8; 4096];
    let fd = ctx
        .ioctx
        .open("/f", OpenFlags::WRONLY | OpenFlags::CREAT, 0o644)
        .unwrap();
    ctx.ioctx.write(fd, &data).unwrap();
    ctx.ioctx.fsync(fd).unwrap();
    ctx.ioctx.close(fd).unwrap();

    // The first file block is the first device block.
    let disk = fs::read(&ctx.storage_path).expect("failed to read disk image");
    assert_eq!(&disk[..4096], &data[..]);
}

#[test]
fn test_page_cache() {
    let ctx = MountedContext::new(FsFlags::PAGE_CACHE);
    let data: Vec<u8> = (0..20_000u32).map(|i| (i % 253) as u8).collect();
    ctx.write("/big", &data);
    assert_eq!(ctx.read("/big"), data);

    let fd = ctx.ioctx.open("/big", OpenFlags::RDWR, 0).unwrap();
    ctx.ioctx.fsync(fd).unwrap();
    ctx.ioctx.close(fd).unwrap();
    ctx.kernel.sync().unwrap();

    let disk = fs::read(&ctx.storage_path).expect("failed to read disk image");
    assert!(disk.chunks(4096).any(|block| block == &data[..4096]));
}

#[test]
fn test_mounts() {
    let ctx = MountedContext::new(FsFlags::empty());
    let ioctx = &ctx.ioctx;
    let kernel = &ctx.kernel;

    ioctx.mkdir("/mnt", 0o755).unwrap();
    assert_eq!(
        kernel.mount(Some(ioctx), "/mnt", DISK, "simplefs", ""),
        Err(EBUSY)
    );
    assert_eq!(
        kernel.mount(Some(ioctx), "/mnt", DevId::new(9, 9), "simplefs", ""),
        Err(ENODEV)
    );
    assert_eq!(
        kernel.mount(Some(ioctx), "/mnt", DevId::INVALID, "nofs", ""),
        Err(ENOENT)
    );

    kernel
        .mount(Some(ioctx), "/mnt", DevId::INVALID, "ramfs", "size=65536")
        .unwrap();
    assert_eq!(kernel.mounts().len(), 2);
    assert_eq!(
        kernel.mount(Some(ioctx), "/mnt", DevId::INVALID, "ramfs", ""),
        Err(EBUSY)
    );

    ctx.write("/mnt/f", b"on ramfs");
    assert_eq!(ctx.read("/mnt/f"), b"on ramfs");

    let root = ioctx.getattr("/", StatMask::VNID | StatMask::DEV).unwrap();
    let up = ioctx.getattr("/mnt/..", StatMask::VNID | StatMask::DEV).unwrap();
    assert_eq!(up, root);
    assert_ne!(ioctx.getattr("/mnt", StatMask::DEV).unwrap().dev, root.dev);

    ioctx.chdir("/mnt").unwrap();
    assert_eq!(ctx.read("f"), b"on ramfs");
    assert_eq!(
        ioctx.getattr("..", StatMask::VNID | StatMask::DEV).unwrap(),
        root
    );
    assert_eq!(kernel.unmount(Some(ioctx), "/mnt"), Err(EBUSY));
    assert_eq!(kernel.unmount(Some(ioctx), "/"), Err(EBUSY));

    ioctx.chdir("/").unwrap();
    assert_eq!(kernel.unmount(Some(ioctx), "/mnt/f"), Err(EINVAL));
    kernel.unmount(Some(ioctx), "/mnt").unwrap();
    assert_eq!(kernel.mounts().len(), 1);
    assert_eq!(ioctx.getattr("/mnt/f", StatMask::SIZE), Err(ENOENT));
}

#[test]
fn test_opposing_renames() {
    let ctx = MountedContext::new(FsFlags::empty());
    let ioctx = &ctx.ioctx;
    ioctx.mkdir("/a", 0o755).unwrap();
    ioctx.mkdir("/b", 0o755).unwrap();
    ctx.write("/a/x", b"x");
    ctx.write("/b/y", b"y");

    thread::scope(|s| {
        s.spawn(|| {
            for _ in 0..200 {
                ioctx.rename("/a/x", "/b/x").unwrap();
                ioctx.rename("/b/x", "/a/x").unwrap();
            }
        });
        s.spawn(|| {
            for _ in 0..200 {
                ioctx.rename("/b/y", "/a/y").unwrap();
                ioctx.rename("/a/y", "/b/y").unwrap();
            }
        });
    });

    assert_eq!(ctx.read("/a/x"), b"x");
    assert_eq!(ctx.read("/b/y"), b"y");
}

#[test]
fn test_busy_vnode_blocks() {
    let ctx = MountedContext::new(FsFlags::empty());
    let ioctx = &ctx.ioctx;
    let root = ioctx.root().unwrap();
    let done = AtomicBool::new(false);

    thread::scope(|s| {
        let guard = root.lock();
        assert!(root.try_lock().is_none());
        let waiter = s.spawn(|| {
            ioctx.mkdir("/d", 0o755).unwrap();
            done.store(true, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(100));
        assert!(!done.load(Ordering::SeqCst));
        drop(guard);
        waiter.join().unwrap();
    });

    assert!(done.load(Ordering::SeqCst));
    assert!(!root.is_locked());
    assert!(ioctx.getattr("/d", StatMask::MODE_FMT).is_ok());
}

#[test]
fn test_path_through_busy_vnode_blocks() {
    let ctx = MountedContext::new(FsFlags::empty());
    let ioctx = &ctx.ioctx;
    ioctx.mkdir("/d", 0o755).unwrap();
    ctx.write("/d/x", b"x");
    let dir = ioctx.path_to_vnode("/d").unwrap();
    let done = AtomicBool::new(false);

    thread::scope(|s| {
        let guard = dir.lock();
        let waiter = s.spawn(|| {
            let size = ioctx.getattr("/d/x", StatMask::SIZE).unwrap().size;
            done.store(true, Ordering::SeqCst);
            size
        });

        thread::sleep(Duration::from_millis(100));
        assert!(!done.load(Ordering::SeqCst));
        drop(guard);
        assert_eq!(waiter.join().unwrap(), 1);
    });

    assert!(!dir.is_locked());
}
