//! Integration tests exercising the full engine through `testkit::MemorySystem`,
//! covering the concrete scenarios and round-trip properties of §8.

use eonixfs::testkit::MemorySystem;
use eonixfs::{AttachConfig, Errno, InitConfig, ReadFlags};

const PAGE: usize = 4096;

/// A buffer sized to hold exactly `pages_per_half` filesystem pages in each half of a
/// double-buffered arrangement, plus the fixed volatile header page ahead of both.
fn sized_buffer(pages_per_half: usize, backup: bool) -> Vec<u8> {
    let half = pages_per_half * PAGE;
    let len = PAGE + if backup { 2 * half } else { half };
    vec![0u8; len]
}

fn init_and_attach(
    buf: &mut [u8],
    backup: bool,
) -> eonixfs::CozyFs<'_, MemorySystem> {
    eonixfs::init(buf, InitConfig { backup }).expect("init");
    eonixfs::attach(buf, backup, AttachConfig::default(), MemorySystem::new()).expect("attach")
}

#[test]
fn scenario_mkdir_chain_and_backup_mirror() {
    // "Init a 1 MiB buffer with backup=1. mkdir "/a", mkdir "/a/b", mkdir "/a/b/c"."
    let mut buf = sized_buffer(64, true);
    let mut fs = init_and_attach(&mut buf, true);

    fs.mkdir(b"/a", 0).unwrap();
    fs.mkdir(b"/a/b", 0).unwrap();
    fs.mkdir(b"/a/b/c", 0).unwrap();

    // Resolving the three-hop chain from root succeeds and the leaf is an empty dir:
    // a subsequent rmdir on it (rather than EPERM for non-empty) proves as much.
    fs.rmdir(b"/a/b/c").unwrap();
    // Put it back so the rest of the assertions see the full chain.
    fs.mkdir(b"/a/b/c", 0).unwrap();

    // Force a backup cycle (idle's off-transaction path runs perform_backup when due).
    fs.idle().unwrap();

    // Halves mirror each other outside the 12-byte volatile prefix.
    let half_len = eonixfs::backup::half_len(buf.len(), true);
    let (first, second) = buf[eonixfs::backup::VOLATILE_PAGE_LEN..].split_at(half_len);
    assert_eq!(first, second, "active and backup halves must match after a backup cycle");
}

#[test]
fn scenario_crash_recovery_discards_uncommitted_mkdir() {
    // "A transaction_begin, A mkdir "/p", A crashes... restore_backup overwrites
    // active half. /p does not exist."
    let mut buf = sized_buffer(16, true);

    {
        let mut fs_a = init_and_attach(&mut buf, true);
        fs_a.transaction_begin().unwrap();
        fs_a.mkdir(b"/p", 0).unwrap();
        // `fs_a` is dropped here without commit or rollback: the lock word is left
        // holding a live deadline and the patch table (process-local) simply
        // vanishes with it, exactly like a killed process never flushing its patches
        // into the shared buffer.
    }

    // Age the lock word's deadline into the past so the next attach sees a crash
    // instead of contending for a live lock.
    let lock_word = u64::from_ne_bytes(buf[0..8].try_into().unwrap());
    assert_ne!(lock_word, 0, "the crashed holder's deadline must still be armed");
    buf[0..8].copy_from_slice(&1u64.to_ne_bytes()); // 1 ms since epoch: always in the past

    let mut fs_c = eonixfs::attach(&mut buf, true, AttachConfig::default(), MemorySystem::new())
        .expect("attach recovers from the crashed holder");

    assert_eq!(fs_c.open(b"/p", false, 0).unwrap_err(), Errno::Enoent);
}

#[test]
fn restore_backup_overwrites_corruption_with_the_last_good_mirror() {
    let mut buf = sized_buffer(16, true);
    let mut fs = init_and_attach(&mut buf, true);
    fs.mkdir(b"/good", 0).unwrap();
    drop(fs);

    let half_len = eonixfs::backup::half_len(buf.len(), true);
    let mut sysif = MemorySystem::new();
    eonixfs::backup::perform_backup(&mut buf, half_len, &mut sysif).unwrap();

    // Corrupt the now-active half directly, as a crashed holder's half-written patch
    // might leave it.
    let base = eonixfs::backup::active_base(half_len, eonixfs::backup::active_marker(&buf));
    buf[base..base + half_len].fill(0xAA);

    let restored = eonixfs::backup::restore_backup(&mut buf, half_len);
    assert!(restored);
    let base_after = eonixfs::backup::active_base(half_len, eonixfs::backup::active_marker(&buf));
    assert!(buf[base_after..base_after + half_len].iter().any(|&b| b != 0xAA));

    let mut fs2 = eonixfs::attach(&mut buf, true, AttachConfig::default(), MemorySystem::new())
        .expect("restored half is well-formed");
    fs2.open(b"/good", false, 0).unwrap();
}

#[test]
fn scenario_crash_without_backup_is_ecorrupt() {
    let mut buf = sized_buffer(16, false);
    {
        let mut fs_a = eonixfs::attach(&mut buf, false, AttachConfig::default(), MemorySystem::new())
            .expect("first attach formats and locks/unlocks cleanly");
        fs_a.transaction_begin().unwrap();
        fs_a.mkdir(b"/p", 0).unwrap();
    }
    buf[0..8].copy_from_slice(&1u64.to_ne_bytes());

    let err = eonixfs::attach(&mut buf, false, AttachConfig::default(), MemorySystem::new())
        .expect_err("no backup half exists to restore from");
    assert_eq!(err, Errno::Ecorrupt);
}

#[test]
fn scenario_fd_generation_invalidated_on_close() {
    let mut buf = sized_buffer(16, true);
    let mut fs = init_and_attach(&mut buf, true);

    let fd1 = fs.open(b"/f", true, 0).unwrap();
    fs.close(fd1).unwrap();
    let fd2 = fs.open(b"/f", true, 0).unwrap();
    assert_ne!(fd1, fd2, "reused slot must carry a different generation");

    let mut scratch = [0u8; 4];
    assert_eq!(fs.read(fd1, &mut scratch, ReadFlags::empty()).unwrap_err(), Errno::Ebadf);
    assert_eq!(fs.write(fd1, b"x").unwrap_err(), Errno::Ebadf);
    assert_eq!(fs.close(fd1).unwrap_err(), Errno::Ebadf);

    // fd2 is unaffected.
    fs.close(fd2).unwrap();
}

#[test]
fn scenario_chunked_read_drains_then_returns_zero() {
    let mut buf = sized_buffer(16, true);
    let mut fs = init_and_attach(&mut buf, true);

    let fd = fs.open(b"/f", true, 0).unwrap();
    let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    assert_eq!(fs.write(fd, &payload).unwrap(), payload.len());

    let mut out = [0u8; 4096];
    let n1 = fs.read(fd, &mut out, ReadFlags::empty()).unwrap();
    assert_eq!(n1, 4096);
    assert_eq!(&out[..], &payload[..4096]);

    let mut out2 = vec![0u8; payload.len() - 4096];
    let n2 = fs.read(fd, &mut out2, ReadFlags::empty()).unwrap();
    assert_eq!(n2, payload.len() - 4096);
    assert_eq!(out2, &payload[4096..]);

    let mut out3 = [0u8; 16];
    let n3 = fs.read(fd, &mut out3, ReadFlags::empty()).unwrap();
    assert_eq!(n3, 0);
}

#[test]
fn scenario_rmdir_nonempty_is_eperm_and_state_unchanged() {
    let mut buf = sized_buffer(16, true);
    let mut fs = init_and_attach(&mut buf, true);

    fs.mkdir(b"/a", 0).unwrap();
    fs.mkdir(b"/a/b", 0).unwrap();

    assert_eq!(fs.rmdir(b"/a").unwrap_err(), Errno::Eperm);
    // Both still resolve: nothing was torn down by the failed attempt.
    fs.rmdir(b"/a/b").unwrap();
    fs.rmdir(b"/a").unwrap();
}

#[test]
fn mkdir_then_rmdir_round_trips() {
    let mut buf = sized_buffer(16, true);
    let mut fs = init_and_attach(&mut buf, true);

    fs.mkdir(b"/tmp", 0).unwrap();
    assert_eq!(fs.mkdir(b"/tmp", 0).unwrap_err(), Errno::Eexist);
    fs.rmdir(b"/tmp").unwrap();
    // The name is free again.
    fs.mkdir(b"/tmp", 0).unwrap();
}

#[test]
fn write_close_open_read_round_trips_content() {
    let mut buf = sized_buffer(16, true);
    let mut fs = init_and_attach(&mut buf, true);

    let fd = fs.open(b"/greeting", true, 0).unwrap();
    fs.write(fd, b"hello, cozy world").unwrap();
    fs.close(fd).unwrap();

    let fd2 = fs.open(b"/greeting", false, 0).unwrap();
    let mut out = [0u8; 64];
    let n = fs.read(fd2, &mut out, ReadFlags::empty()).unwrap();
    assert_eq!(&out[..n], b"hello, cozy world");
    fs.close(fd2).unwrap();
}

#[test]
fn link_and_unlink_preserve_refs() {
    let mut buf = sized_buffer(16, true);
    let mut fs = init_and_attach(&mut buf, true);

    let fd = fs.open(b"/a", true, 0).unwrap();
    fs.write(fd, b"data").unwrap();
    fs.close(fd).unwrap();

    fs.link(b"/a", b"/b").unwrap();
    fs.unlink(b"/b").unwrap();

    // "/a" is still readable and still the sole name for its entity.
    let fd2 = fs.open(b"/a", false, 0).unwrap();
    let mut out = [0u8; 8];
    assert_eq!(fs.read(fd2, &mut out, ReadFlags::empty()).unwrap(), 4);
    fs.close(fd2).unwrap();
    assert_eq!(fs.open(b"/b", false, 0).unwrap_err(), Errno::Enoent);
}

#[test]
fn transaction_rollback_leaves_buffer_unobserved() {
    let mut buf = sized_buffer(16, true);
    let mut fs = init_and_attach(&mut buf, true);
    fs.mkdir(b"/keep", 0).unwrap();

    let half_len = eonixfs::backup::half_len(buf.len(), true);
    let vh = eonixfs::backup::active_marker(&buf);
    let base = eonixfs::backup::active_base(half_len, vh);
    let before = buf[base..base + half_len].to_vec();

    let mut fs2 = eonixfs::attach(&mut buf, true, AttachConfig::default(), MemorySystem::new())
        .expect("reattach");
    fs2.transaction_begin().unwrap();
    fs2.mkdir(b"/discarded", 0).unwrap();
    fs2.transaction_rollback().unwrap();

    assert_eq!(
        &buf[base..base + half_len],
        &before[..],
        "rollback must leave the active half byte-identical to before begin"
    );

    let mut fs3 = eonixfs::attach(&mut buf, true, AttachConfig::default(), MemorySystem::new())
        .expect("reattach");
    assert_eq!(fs3.open(b"/discarded", false, 0).unwrap_err(), Errno::Enoent);
    fs3.rmdir(b"/keep").unwrap();
}

#[test]
fn transaction_commit_applies_every_operation() {
    let mut buf = sized_buffer(16, true);
    let mut fs = init_and_attach(&mut buf, true);

    fs.transaction_begin().unwrap();
    fs.mkdir(b"/x", 0).unwrap();
    fs.mkdir(b"/y", 0).unwrap();
    let fd = fs.open(b"/y/f", true, 0).unwrap();
    fs.write(fd, b"payload").unwrap();
    fs.close(fd).unwrap();
    fs.transaction_commit().unwrap();

    let fd2 = fs.open(b"/y/f", false, 0).unwrap();
    let mut out = [0u8; 16];
    let n = fs.read(fd2, &mut out, ReadFlags::empty()).unwrap();
    assert_eq!(&out[..n], b"payload");
}

#[test]
fn path_boundary_cases() {
    let mut buf = sized_buffer(16, true);
    let mut fs = init_and_attach(&mut buf, true);

    // A name at exactly MAX_NAME bytes is accepted, and doubles as the parent for
    // the next check.
    let parent_name = vec![b'a'; eonixfs::layout::MAX_NAME];
    let parent_path = alloc_path(&parent_name);
    fs.mkdir(&parent_path, 0).unwrap();

    // A child name one byte over MAX_NAME fails in create_entity's own length check.
    let mut child_path = parent_path.clone();
    child_path.push(b'/');
    child_path.extend(core::iter::repeat(b'b').take(eonixfs::layout::MAX_NAME + 1));
    assert_eq!(fs.mkdir(&child_path, 0).unwrap_err(), Errno::Einval);
}

fn alloc_path(name: &[u8]) -> Vec<u8> {
    let mut p = vec![b'/'];
    p.extend_from_slice(name);
    p
}

mod concurrency {
    use super::*;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    /// Raw-pointer handle to a leaked buffer, used only so two threads in this test
    /// can each attach their own `CozyFs` over the *same* bytes — simulating two
    /// processes mapped to the same shared memory, which the engine's single `&mut
    /// [u8]`-per-attachment API cannot otherwise express within one address space.
    /// Safety here rests entirely on the lock: both threads only touch the buffer
    /// while holding it (through `CozyFs`'s own critical sections), exactly like two
    /// real processes would.
    struct SharedBuf {
        ptr: *mut u8,
        len: usize,
    }
    unsafe impl Send for SharedBuf {}
    unsafe impl Sync for SharedBuf {}
    impl SharedBuf {
        unsafe fn as_mut<'a>(&self) -> &'a mut [u8] {
            core::slice::from_raw_parts_mut(self.ptr, self.len)
        }
    }

    #[test]
    fn concurrent_attachments_serialize_through_the_lock() {
        let pages_per_half = 16usize;
        let half = pages_per_half * PAGE;
        let len = PAGE + 2 * half;
        let leaked: &'static mut [u8] = vec![0u8; len].leak();
        let shared = SharedBuf { ptr: leaked.as_mut_ptr(), len: leaked.len() };

        eonixfs::init(unsafe { shared.as_mut() }, InitConfig { backup: true }).unwrap();

        let barrier = std::sync::Arc::new(Barrier::new(2));
        let barrier_a = barrier.clone();

        let shared_a = SharedBuf { ptr: shared.ptr, len: shared.len };
        let handle = thread::spawn(move || {
            let mut fs_a = eonixfs::attach(
                unsafe { shared_a.as_mut() },
                true,
                AttachConfig::default(),
                MemorySystem::new(),
            )
            .unwrap();
            fs_a.transaction_begin().unwrap();
            barrier_a.wait();
            thread::sleep(Duration::from_millis(80));
            fs_a.mkdir(b"/x", 0).unwrap();
            fs_a.transaction_commit().unwrap();
        });

        barrier.wait();
        // B contends for the lock A is holding; a short acquire timeout means this
        // observes contention rather than genuinely waiting out A's whole critical
        // section.
        let mut short_timeout = AttachConfig::default();
        short_timeout.acquire_timeout_secs = 0;
        let contended = eonixfs::attach(
            unsafe { shared.as_mut() },
            true,
            short_timeout,
            MemorySystem::new(),
        );
        assert!(contended.is_err(), "B must observe A's held lock as contention");

        handle.join().unwrap();

        let mut fs_b = eonixfs::attach(
            unsafe { shared.as_mut() },
            true,
            AttachConfig::default(),
            MemorySystem::new(),
        )
        .unwrap();
        fs_b.mkdir(b"/y", 0).unwrap();
        assert_eq!(fs_b.open(b"/x", false, 0).unwrap_err(), Errno::Eisdir);
        assert_eq!(fs_b.open(b"/y", false, 0).unwrap_err(), Errno::Eisdir);
    }
}
