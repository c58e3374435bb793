//! Property tests for the structural invariants in the allocator's design
//! (pages tiling the arena, no two adjacent free pages, round-trip identity
//! of allocate+free). Run through the public API only.

use proptest::prelude::*;

use fmem::{Arena, FmemError};

const ARENA_LEN: u64 = 64 * 1024;

fn fresh_arena(bytes: &mut [u8]) -> Arena {
    unsafe { Arena::create_new(bytes.as_mut_ptr(), ARENA_LEN, 0, None).unwrap() }
}

proptest! {
    /// P1/P2: after an arbitrary sequence of allocate/free calls, every page
    /// still tiles the arena exactly (contiguous, strictly increasing
    /// offsets, total size equal to the arena length) and no two
    /// address-adjacent pages are both free (merge always coalesces them).
    #[test]
    fn p1_p2_pages_tile_and_no_adjacent_free_pages(
        ops in prop::collection::vec((any::<bool>(), 1u64..512), 1..60)
    ) {
        let mut bytes = vec![0u8; ARENA_LEN as usize];
        let arena = fresh_arena(&mut bytes);
        let mut live: Vec<*mut u8> = Vec::new();

        for (do_free, size) in ops {
            if do_free && !live.is_empty() {
                let idx = (size as usize) % live.len();
                let ptr = live.remove(idx);
                arena.free(ptr).unwrap();
            } else if let Ok(p) = arena.allocate(size) {
                live.push(p);
            }
        }

        let base = bytes.as_mut_ptr();
        let header_size = (fmem::HEADER_SIZE + fmem::ROOT_RECORD_SIZE) as u64;

        let mut offsets = vec![0u64];
        offsets.extend(unsafe { fmem::list::Iter::new(base, 0) });

        let mut cursor = 0u64;
        for &offset in &offsets {
            prop_assert_eq!(offset, cursor);
            let size = if offset == 0 {
                header_size
            } else {
                unsafe { fmem::page::size_of_page(base, offset) as u64 }
            };
            cursor += size;
        }
        prop_assert_eq!(cursor, ARENA_LEN);

        for pair in offsets.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            let a_free = a != 0 && unsafe { fmem::page::is_free(base, a) };
            let b_free = unsafe { fmem::page::is_free(base, b) };
            prop_assert!(!(a_free && b_free), "pages at {a} and {b} are both free and unmerged");
        }
    }

    /// P3: a successful allocation always returns a page whose usable size is
    /// at least `max(requested, min_alloc)`.
    #[test]
    fn p3_allocation_is_large_enough(size in 1u64..2048) {
        let mut bytes = vec![0u8; ARENA_LEN as usize];
        let arena = fresh_arena(&mut bytes);

        if let Ok(p) = arena.allocate(size) {
            let payload_offset = unsafe { p.offset_from(bytes.as_mut_ptr()) } as u64;
            let page_offset = payload_offset - fmem::HEADER_SIZE as u64;
            let usable = unsafe { fmem::page::usable_size(bytes.as_mut_ptr(), page_offset) as u64 };
            prop_assert!(usable >= size.max(fmem::DEFAULT_MIN_ALLOC));
        }
    }

    /// P5: allocating then immediately freeing the same size returns the
    /// arena to a state where the same request succeeds again, repeatedly.
    #[test]
    fn p5_allocate_free_round_trip_is_repeatable(size in 8u64..4096, iterations in 1usize..20) {
        let mut bytes = vec![0u8; ARENA_LEN as usize];
        let arena = fresh_arena(&mut bytes);

        for _ in 0..iterations {
            match arena.allocate(size) {
                Ok(p) => {
                    let freed = arena.free(p).unwrap();
                    prop_assert!(freed > 0);
                }
                Err(FmemError::NoMem) => break,
                Err(e) => prop_assert!(false, "unexpected error: {e:?}"),
            }
        }
    }

    /// P4: a request for the entire arena length always fails, since the
    /// header page and root record overhead are never available for payload.
    #[test]
    fn p4_whole_arena_request_never_succeeds(extra in 0u64..1024) {
        let mut bytes = vec![0u8; ARENA_LEN as usize];
        let arena = fresh_arena(&mut bytes);
        prop_assert_eq!(arena.allocate(ARENA_LEN + extra).unwrap_err(), FmemError::NoMem);
    }

    /// P6: `create_new` followed immediately by `from_existing` preserves
    /// every root-record field that isn't process-local (lock, committer).
    #[test]
    fn p6_attach_preserves_root_fields(min_alloc in 0u64..512) {
        let mut bytes = vec![0u8; ARENA_LEN as usize];
        let base = bytes.as_mut_ptr();

        let created = unsafe { Arena::create_new(base, ARENA_LEN, min_alloc, None) };
        let created = match created {
            Ok(a) => a,
            Err(_) => return Ok(()), // out-of-range min_alloc for this arena size
        };
        let len_before = created.len();
        drop(created);

        let attached = unsafe { Arena::from_existing(base, None) }.unwrap();
        prop_assert_eq!(attached.len(), len_before);
    }
}
