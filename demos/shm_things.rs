//! Shared-memory stash demo: builds a well-known list of things through a
//! fixed-region allocator backed by a POSIX shared-memory segment, with no
//! committer, so that only the segment's own lifetime (not durability) is
//! being exercised.
//!
//! Run as `shm-things -i` to create, `shm-things -r` from a second process to
//! remap and verify, `shm-things -c` to remove the segment.

#[path = "things.rs"]
mod things;

use std::env;
use std::ffi::CString;
use std::process::ExitCode;

use fmem::Arena;

const MAP_SIZE: usize = 1024 * 100;
const SHM_PATH: &str = "/things-mem";

fn map_address() -> usize {
    // SAFETY: sysconf with _SC_PAGESIZE never fails on a POSIX system.
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    page_size * 1_000_000
}

fn mode_init() -> ExitCode {
    let path = CString::new(SHM_PATH).expect("no interior NUL");
    unsafe {
        let fd = libc::shm_open(path.as_ptr(), libc::O_CREAT | libc::O_RDWR, 0o600);
        if fd == -1 {
            eprintln!("shm_open failed");
            return ExitCode::FAILURE;
        }
        if libc::ftruncate(fd, MAP_SIZE as libc::off_t) != 0 {
            eprintln!("ftruncate failed");
            return ExitCode::FAILURE;
        }

        let map_to = map_address() as *mut libc::c_void;
        let mapped = libc::mmap(
            map_to,
            MAP_SIZE,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_FIXED,
            fd,
            0,
        );
        if mapped == libc::MAP_FAILED {
            eprintln!("mmap failed");
            return ExitCode::FAILURE;
        }

        let arena = match Arena::create_new(mapped as *mut u8, MAP_SIZE as u64, 0, None) {
            Ok(a) => a,
            Err(e) => {
                eprintln!("failed to create fixed mem arena: {e}");
                return ExitCode::FAILURE;
            }
        };

        let header = match things::make_wellknown_things(&arena, None) {
            Ok(h) => h,
            Err(e) => {
                eprintln!("failed to make things on memory owned by the arena: {e}");
                return ExitCode::FAILURE;
            }
        };

        let header_offset = (header as *mut u8).offset_from(mapped as *mut u8) as u64;
        arena.set_user_slot(0, header_offset);
    }
    ExitCode::SUCCESS
}

fn mode_read() -> ExitCode {
    println!("running READ mode");
    let path = CString::new(SHM_PATH).expect("no interior NUL");
    unsafe {
        let fd = libc::shm_open(path.as_ptr(), libc::O_RDWR, 0o600);
        if fd == -1 {
            eprintln!("shm_open failed");
            return ExitCode::FAILURE;
        }

        let map_to = map_address() as *mut libc::c_void;
        let mapped = libc::mmap(
            map_to,
            MAP_SIZE,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_FIXED,
            fd,
            0,
        );
        if mapped == libc::MAP_FAILED {
            eprintln!("mmap failed");
            return ExitCode::FAILURE;
        }

        let arena = match Arena::from_existing(mapped as *mut u8, None) {
            Ok(a) => a,
            Err(e) => {
                eprintln!("failed to attach to fixed mem arena: {e}");
                return ExitCode::FAILURE;
            }
        };

        let header_offset = arena.user_slot(0);
        let header = (mapped as *mut u8).add(header_offset as usize) as *const things::ThingsHeader;

        if things::verify_things(header) {
            println!("data is the same after a remap");
            ExitCode::SUCCESS
        } else {
            eprintln!("memory is not the same");
            ExitCode::FAILURE
        }
    }
}

fn mode_cleanup() -> ExitCode {
    println!("running CLEANUP mode");
    let path = CString::new(SHM_PATH).expect("no interior NUL");
    // SAFETY: shm_unlink takes a NUL-terminated path; failure is non-fatal.
    let res = unsafe { libc::shm_unlink(path.as_ptr()) };
    if res != 0 {
        eprintln!("warning: shm_unlink failed");
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
            eprintln!("Usage: shm-things [-i|-r|-c] (select one)");
            ExitCode::FAILURE
        }
    }
}
