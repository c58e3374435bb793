//! File-backed persistence demo: builds a well-known list of things through a
//! fixed-region allocator whose committer flushes every mutation straight to
//! a backing file via `msync`, so the data survives a process restart without
//! a separate shared-memory segment.
//!
//! Run as `file-things -i` to create, `file-things -r` to reopen and verify,
//! `file-things -c` to remove the backing file. Edit `MEM_FILE` below before
//! running; it must name a path on a filesystem you are allowed to write 10
//! MiB to.

#[path = "things.rs"]
mod things;

use std::env;
use std::fs::OpenOptions;
use std::os::unix::io::AsRawFd;
use std::process::ExitCode;

use fmem::{Arena, CommitRange, Committer, FmemError};

const MAP_SIZE: u64 = 1024 * 1024 * 10;
const MEM_FILE: &str = "/tmp/fmem-things-demo.mem";

fn map_address() -> usize {
    // SAFETY: sysconf with _SC_PAGESIZE never fails on a POSIX system.
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    page_size * 2_000_000
}

/// Flushes each committed range to the backing file with `msync`, rounding
/// every range down to a page boundary first since `msync` requires a
/// page-aligned address.
struct FileCommitter {
    base: *mut u8,
}

// SAFETY: `base` is a `MAP_FIXED` mapping valid for the life of the process;
// `msync` itself is reentrant and requires no additional synchronization.
unsafe impl Send for FileCommitter {}
unsafe impl Sync for FileCommitter {}

impl Committer for FileCommitter {
    fn commit(&self, ranges: &[CommitRange]) -> Result<(), FmemError> {
        // SAFETY: sysconf with _SC_PAGESIZE never fails on a POSIX system.
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as u64;

        for r in ranges {
            let aligned_start = r.start - (r.start % page_size);
            let aligned_len = (r.start - aligned_start) + r.len;
            // SAFETY: `base + aligned_start` stays within the mapping set up
            // in `open_mapped_file`, which is `MAP_SIZE` bytes long.
            let addr = unsafe { self.base.add(aligned_start as usize) as *mut libc::c_void };
            let res = unsafe { libc::msync(addr, aligned_len as usize, libc::MS_SYNC) };
            if res != 0 {
                return Err(FmemError::CommitFailed);
            }
        }
        Ok(())
    }
}

/// Opens (creating if needed) and maps `MEM_FILE` at a fixed address, so
/// `mode_init` and `mode_read` always see the same base pointer and the raw
/// host pointers embedded in `demos/things.rs`'s list stay valid across runs.
fn open_mapped_file(truncate_to: u64) -> std::io::Result<*mut u8> {
    let file = OpenOptions::new().read(true).write(true).create(true).open(MEM_FILE)?;
    file.set_len(truncate_to)?;

    let map_to = map_address() as *mut libc::c_void;
    // SAFETY: `file`'s descriptor is valid and open for read/write for the
    // length just set above.
    let mapped = unsafe {
        libc::mmap(
            map_to,
            truncate_to as usize,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_FIXED,
            file.as_raw_fd(),
            0,
        )
    };
    if mapped == libc::MAP_FAILED {
        return Err(std::io::Error::last_os_error());
    }
    Ok(mapped as *mut u8)
}

fn mode_init() -> ExitCode {
    let base = match open_mapped_file(MAP_SIZE) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("failed to map backing file: {e}");
            return ExitCode::FAILURE;
        }
    };
    let committer: Box<dyn Committer> = Box::new(FileCommitter { base });

    // SAFETY: `base` is valid for `MAP_SIZE` bytes for the process lifetime.
    let arena = match unsafe { Arena::create_new(base, MAP_SIZE, 0, Some(committer)) } {
        Ok(a) => a,
        Err(e) => {
            eprintln!("failed to create fixed mem arena: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut commit_each = |mem: *mut u8, len: u64| {
        if arena.commit_mem(mem, len).is_err() {
            eprintln!("warning: fmem failed to commit memory");
        }
    };
    let header = match things::make_wellknown_things(&arena, Some(&mut commit_each)) {
        Ok(h) => h,
        Err(e) => {
            eprintln!("failed to make things on memory owned by the arena: {e}");
            return ExitCode::FAILURE;
        }
    };

    let header_offset = unsafe { (header as *mut u8).offset_from(base) as u64 };
    arena.set_user_slot(0, header_offset);
    if arena.commit_user_data().is_err() {
        eprintln!("failed to commit user data");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

fn mode_read() -> ExitCode {
    println!("running READ mode");
    let base = match open_mapped_file(MAP_SIZE) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("failed to map backing file: {e}");
            return ExitCode::FAILURE;
        }
    };

    // SAFETY: `base` was previously written by a `create_new` run of this
    // same demo, or this check fails and we bail out.
    let arena = match unsafe { Arena::from_existing(base, None) } {
        Ok(a) => a,
        Err(e) => {
            eprintln!("failed to attach to fixed mem arena: {e}");
            return ExitCode::FAILURE;
        }
    };

    let header_offset = arena.user_slot(0);
    let header = unsafe { base.add(header_offset as usize) as *const things::ThingsHeader };

    if things::verify_things(header) {
        println!("data is the same after a remap");
        ExitCode::SUCCESS
    } else {
        eprintln!("memory is not the same");
        ExitCode::FAILURE
    }
}

fn mode_cleanup() -> ExitCode {
    println!("running CLEANUP mode");
    if let Err(e) = std::fs::remove_file(MEM_FILE) {
        eprintln!("warning: failed to remove backing file: {e}");
    }
    ExitCode::SUCCESS
}

fn main() -> ExitCode {
    env_logger::init();
    let mut args = env::args();
    let _bin = args.next();
    match args.next().as_deref() {
        Some("-i") => mode_init(),
        Some("-r") => mode_read(),
        Some("-c") => mode_cleanup(),
        _ => {
            eprintln!("Usage: file-things [-i|-r|-c] (select one)");
            ExitCode::FAILURE
        }
    }
}
