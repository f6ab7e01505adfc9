//! Single-consumer helper for draining a perf event ring shared with the
//! kernel.

use std::sync::atomic::{fence, Ordering};

/// The ring's control page. Only the head and tail indices matter here;
/// the first kilobyte holds versioning and clock fields this helper never
/// touches. The index offsets are kernel ABI.
#[repr(C)]
pub struct RingPage {
    _control: [u64; 128],
    pub data_head: u64,
    pub data_tail: u64,
    pub data_offset: u64,
    pub data_size: u64,
}

/// Header every ring record starts with; `size` covers the whole record
/// including the header.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct EventHeader {
    pub kind: u32,
    pub misc: u16,
    pub size: u16,
}

/// What the consumer callback wants next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadAction {
    Continue,
    /// Stop draining; the record that answered this is redelivered on the
    /// next call.
    Stop,
}

/// Walk every record currently published in the ring and hand each to
/// `consume`, including its [`EventHeader`]. Records wrapping the ring
/// edge are stitched together through `scratch`. The new tail index is
/// published once, after the walk.
///
/// Non-blocking and single-consumer: concurrent callers would race on the
/// tail index.
///
/// # Safety
///
/// `header` must point to a live perf ring mapping of one control page of
/// `page_size` bytes followed by a data area of `size` bytes, with `size`
/// a power of two.
pub unsafe fn read_event_ring(
    header: *mut RingPage,
    size: u64,
    page_size: u64,
    scratch: &mut Vec<u8>,
    mut consume: impl FnMut(&[u8]) -> ReadAction,
) -> ReadAction {
    let mut tail = std::ptr::addr_of!((*header).data_tail).read_volatile();
    let head = std::ptr::addr_of!((*header).data_head).read_volatile();

    // Pair with the kernel's store-release of data_head: everything it
    // published before head must be visible before the records are read.
    fence(Ordering::Acquire);

    let base = (header as *const u8).add(page_size as usize);
    let mut action = ReadAction::Continue;

    while tail != head {
        let begin = base.add((tail % size) as usize);
        let record_size = usize::from((*(begin as *const EventHeader)).size);

        let record: &[u8] = if (tail % size) as usize + record_size > size as usize {
            let split = size as usize - (tail % size) as usize;
            scratch.clear();
            scratch.extend_from_slice(std::slice::from_raw_parts(begin, split));
            scratch.extend_from_slice(std::slice::from_raw_parts(base, record_size - split));
            scratch
        } else {
            std::slice::from_raw_parts(begin, record_size)
        };

        action = consume(record);
        if action != ReadAction::Continue {
            break;
        }
        tail += record_size as u64;
    }

    // The kernel may reuse the space as soon as it observes the new tail;
    // every read above must land first.
    fence(Ordering::SeqCst);
    std::ptr::addr_of_mut!((*header).data_tail).write_volatile(tail);

    action
}
