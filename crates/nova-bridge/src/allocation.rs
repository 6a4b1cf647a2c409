//! Copies variable-length results into memory the guest owns.
//!
//! The host never allocates in guest memory itself: it asks the guest's allocator for a region
//! of the right size (`create_allocation`), looks up where that region lives
//! (`allocation_pointer`), and copies the bytes there. The guest receives the allocation id and
//! is responsible for freeing it.

use crate::error::BridgeError;

/// The guest-exported allocation primitives plus write access to guest memory.
pub trait GuestAllocator {
    /// Calls the guest's `create_allocation(len) -> id`.
    fn create_allocation(&mut self, len: u32) -> Result<u32, BridgeError>;

    /// Calls the guest's `allocation_pointer(id) -> ptr`.
    fn allocation_pointer(&mut self, id: u32) -> Result<u32, BridgeError>;

    /// Current guest linear memory. Must be re-fetched after any guest call, which may grow it.
    fn memory_mut(&mut self) -> &mut [u8];
}

/// Writes `bytes` into a fresh guest allocation and returns its id.
pub fn write_to_guest_memory<G>(guest: &mut G, bytes: &[u8]) -> Result<u32, BridgeError>
where
    G: GuestAllocator + ?Sized,
{
    let len = u32::try_from(bytes.len()).map_err(|_| BridgeError::LimitExceeded {
        what: "guest allocation",
        len: bytes.len(),
        limit: u32::MAX as usize,
    })?;

    let id = guest.create_allocation(len)?;
    let ptr = guest.allocation_pointer(id)?;

    let memory = guest.memory_mut();
    let memory_size = memory.len();
    let start = ptr as usize;
    let Some(dest) = start
        .checked_add(bytes.len())
        .and_then(|end| memory.get_mut(start..end))
    else {
        return Err(BridgeError::MemoryOutOfBounds {
            id,
            ptr,
            len: bytes.len(),
            memory_size,
        });
    };
    dest.copy_from_slice(bytes);

    tracing::trace!(
        target = "nova.bridge",
        allocation = id,
        ptr,
        len,
        "wrote result into guest allocation"
    );
    Ok(id)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Bump allocator over a plain byte vector, standing in for a guest module.
    pub(crate) struct VecGuest {
        pub(crate) memory: Vec<u8>,
        pub(crate) allocations: Vec<(u32, u32)>,
        pub(crate) next: u32,
        pub(crate) pointer_override: Option<u32>,
    }

    impl VecGuest {
        pub(crate) fn new(size: usize, heap_start: u32) -> Self {
            Self {
                memory: vec![0; size],
                allocations: Vec::new(),
                next: heap_start,
                pointer_override: None,
            }
        }

        pub(crate) fn allocation(&self, id: u32) -> &[u8] {
            let (ptr, len) = self.allocations[id as usize];
            &self.memory[ptr as usize..(ptr + len) as usize]
        }
    }

    impl GuestAllocator for VecGuest {
        fn create_allocation(&mut self, len: u32) -> Result<u32, BridgeError> {
            let id = self.allocations.len() as u32;
            self.allocations.push((self.next, len));
            self.next += len;
            Ok(id)
        }

        fn allocation_pointer(&mut self, id: u32) -> Result<u32, BridgeError> {
            if let Some(ptr) = self.pointer_override {
                return Ok(ptr);
            }
            self.allocations
                .get(id as usize)
                .map(|(ptr, _)| *ptr)
                .ok_or_else(|| BridgeError::GuestCall {
                    export: "allocation_pointer",
                    message: format!("no allocation {id}"),
                })
        }

        fn memory_mut(&mut self) -> &mut [u8] {
            &mut self.memory
        }
    }

    #[test]
    fn bytes_land_at_the_guest_pointer() {
        let mut guest = VecGuest::new(256, 64);
        let first = write_to_guest_memory(&mut guest, b"hi").unwrap();
        let second = write_to_guest_memory(&mut guest, "héllo".as_bytes()).unwrap();

        assert_eq!((first, second), (0, 1));
        assert_eq!(guest.allocation(first), b"hi");
        assert_eq!(guest.allocation(second), "héllo".as_bytes());
        assert_eq!(&guest.memory[64..66], b"hi");
    }

    #[test]
    fn empty_results_still_get_an_allocation() {
        let mut guest = VecGuest::new(64, 8);
        let id = write_to_guest_memory(&mut guest, b"").unwrap();
        assert_eq!(guest.allocations[id as usize], (8, 0));
    }

    #[test]
    fn pointer_past_memory_is_rejected() {
        let mut guest = VecGuest::new(64, 8);
        guest.pointer_override = Some(62);
        let err = write_to_guest_memory(&mut guest, b"abcd").unwrap_err();
        assert!(
            matches!(
                err,
                BridgeError::MemoryOutOfBounds {
                    id: 0,
                    ptr: 62,
                    len: 4,
                    memory_size: 64
                }
            ),
            "{err:?}"
        );
    }
}
