//! Guest-owned buffers the host writes variable-length results into.
//!
//! The host calls `create_allocation(len)` to reserve a zeroed buffer, then
//! `allocation_pointer(id)` to learn where to copy the bytes. The guest reads the buffer back
//! with [`take_bytes`] / [`take_string`], which also frees the slot.

use alloc::string::String;
use alloc::vec::Vec;
use core::cell::RefCell;

std::thread_local! {
    static ALLOCATIONS: RefCell<Vec<Option<Vec<u8>>>> = const { RefCell::new(Vec::new()) };
}

/// Reserves a zeroed buffer of `len` bytes and returns its allocation id.
pub fn create_allocation(len: u32) -> u32 {
    let buf = alloc::vec![0u8; len as usize];
    ALLOCATIONS.with_borrow_mut(|slots| {
        let id = match slots.iter().position(Option::is_none) {
            Some(free) => {
                slots[free] = Some(buf);
                free
            }
            None => {
                slots.push(Some(buf));
                slots.len() - 1
            }
        };
        id as u32
    })
}

/// Linear-memory address of the buffer behind `allocation_id`, or `0` if it does not exist.
pub fn allocation_pointer(allocation_id: u32) -> u32 {
    ALLOCATIONS.with_borrow(|slots| match slots.get(allocation_id as usize) {
        Some(Some(buf)) => buf.as_ptr() as usize as u32,
        _ => 0,
    })
}

pub fn allocation_len(allocation_id: u32) -> u32 {
    ALLOCATIONS.with_borrow(|slots| match slots.get(allocation_id as usize) {
        Some(Some(buf)) => buf.len() as u32,
        _ => 0,
    })
}

/// Removes the buffer from the table and hands it to the caller.
pub fn take_bytes(allocation_id: u32) -> Vec<u8> {
    ALLOCATIONS.with_borrow_mut(|slots| {
        slots
            .get_mut(allocation_id as usize)
            .and_then(Option::take)
            .unwrap_or_default()
    })
}

pub fn take_string(allocation_id: u32) -> String {
    match String::from_utf8(take_bytes(allocation_id)) {
        Ok(text) => text,
        Err(err) => String::from_utf8_lossy(err.as_bytes()).into_owned(),
    }
}

pub fn clear_allocation(allocation_id: u32) {
    drop(take_bytes(allocation_id));
}

#[cfg(test)]
pub(crate) fn reset_with(slots: Vec<Option<Vec<u8>>>) {
    ALLOCATIONS.with_borrow_mut(|s| *s = slots);
}

/// Defines the allocation exports the host requires (`create_allocation` and
/// `allocation_pointer`) in the calling crate.
#[macro_export]
macro_rules! export_allocator {
    () => {
        #[no_mangle]
        pub extern "C" fn create_allocation(len: u32) -> u32 {
            $crate::guest::allocations::create_allocation(len)
        }

        #[no_mangle]
        pub extern "C" fn allocation_pointer(allocation_id: u32) -> u32 {
            $crate::guest::allocations::allocation_pointer(allocation_id)
        }
    };
}
