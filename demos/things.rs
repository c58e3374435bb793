//! Shared demo data structure: a small intrusive list of single-byte values
//! ('Z' down to 'A'), built entirely through an [`fmem::Arena`]. Exists only
//! to give the two demo binaries something concrete to allocate, persist,
//! and verify.

use std::ptr;

use fmem::{Arena, FmemError};

#[repr(C)]
struct ListHead {
    prev: *mut ListHead,
    next: *mut ListHead,
}

#[repr(C)]
pub struct ThingsHeader {
    list: ListHead,
    pub count: u8,
}

#[repr(C)]
pub struct Thing {
    list: ListHead,
    pub value: u8,
}

unsafe fn list_init(head: *mut ListHead) {
    (*head).prev = head;
    (*head).next = head;
}

unsafe fn list_add_after(after: *mut ListHead, node: *mut ListHead) {
    let next = (*after).next;
    (*node).prev = after;
    (*node).next = next;
    (*after).next = node;
    (*next).prev = node;
}

/// Builds a [`ThingsHeader`] followed by 26 [`Thing`]s through `arena`,
/// calling `oneach` (if supplied) after every allocation so a
/// committer-backed caller can persist each mutation as it happens.
pub fn make_wellknown_things(
    arena: &Arena,
    mut oneach: Option<&mut dyn FnMut(*mut u8, u64)>,
) -> Result<*mut ThingsHeader, FmemError> {
    let header_size = std::mem::size_of::<ThingsHeader>() as u64;
    let header_mem = arena.allocate(header_size)?;
    let header = header_mem as *mut ThingsHeader;
    unsafe {
        ptr::write(
            header,
            ThingsHeader { list: ListHead { prev: ptr::null_mut(), next: ptr::null_mut() }, count: 0 },
        );
        list_init(ptr::addr_of_mut!((*header).list));
    }
    if let Some(cb) = oneach.as_deref_mut() {
        cb(header_mem, header_size);
    }

    let thing_size = std::mem::size_of::<Thing>() as u64;
    for value in (b'A'..=b'Z').rev() {
        let thing_mem = arena.allocate(thing_size)?;
        let thing = thing_mem as *mut Thing;
        unsafe {
            ptr::write(
                thing,
                Thing { list: ListHead { prev: ptr::null_mut(), next: ptr::null_mut() }, value },
            );
            list_add_after(ptr::addr_of_mut!((*header).list), ptr::addr_of_mut!((*thing).list));
            (*header).count += 1;
        }
        if let Some(cb) = oneach.as_deref_mut() {
            cb(header_mem, header_size);
            cb(thing_mem, thing_size);
        }
    }

    Ok(header)
}

/// Rebuilds a fresh copy of the well-known list on the ordinary heap and
/// compares it, node by node, against `what`.
pub fn verify_things(what: *const ThingsHeader) -> bool {
    if what.is_null() {
        return false;
    }

    let mut expected_header =
        Box::new(ThingsHeader { list: ListHead { prev: ptr::null_mut(), next: ptr::null_mut() }, count: 0 });
    unsafe {
        list_init(ptr::addr_of_mut!(expected_header.list));
    }

    let mut expected_nodes: Vec<Box<Thing>> = Vec::with_capacity(26);
    for value in (b'A'..=b'Z').rev() {
        let mut node = Box::new(Thing { list: ListHead { prev: ptr::null_mut(), next: ptr::null_mut() }, value });
        unsafe {
            list_add_after(ptr::addr_of_mut!(expected_header.list), ptr::addr_of_mut!(node.list));
        }
        expected_header.count += 1;
        expected_nodes.push(node);
    }

    unsafe {
        if (*what).count != expected_header.count {
            return false;
        }

        let head = &(*what).list as *const ListHead as *mut ListHead;
        let mut current = (*head).next;
        let expected_head = ptr::addr_of_mut!(expected_header.list);
        let mut expected = (*expected_head).next;

        while current != head {
            let current_thing = current as *const Thing;
            let expected_thing = expected as *const Thing;
            if (*current_thing).value != (*expected_thing).value {
                return false;
            }
            current = (*current).next;
            expected = (*expected).next;
        }
    }

    true
}
