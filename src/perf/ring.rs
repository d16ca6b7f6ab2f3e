//! Consumer side of the perf mmap ring buffer.
//!
//! The kernel appends records behind `data_head`; we parse everything up to
//! the head observed at the start of a drain and then publish `data_tail`.

use std::io;
use std::mem;
use std::os::fd::AsRawFd;
use std::ptr;
use std::sync::atomic::{fence, Ordering};

use plain::Plain;

/// Control page shared with the kernel. Only the ring positions are used.
#[repr(C)]
struct PerfEventMmapPage {
    _header: [u8; 1024],
    data_head: u64,
    data_tail: u64,
    data_offset: u64,
    data_size: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct PerfEventHeader {
    pub type_: u32,
    pub misc: u16,
    pub size: u16,
}

unsafe impl Plain for PerfEventHeader {}

pub fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
}

pub struct RingBuffer {
    base: *mut u8,
    mmap_size: usize,
    data_offset: usize,
    data_size: u64,
    position: u64,
    scratch: Vec<u8>,
}

// The mapping is only touched by the owning monitor thread; the kernel side
// is synchronized through data_head/data_tail and the fences below.
unsafe impl Send for RingBuffer {}

impl RingBuffer {
    /// Maps one control page plus `data_pages` pages for the event behind `fd`.
    pub fn map(fd: &impl AsRawFd, data_pages: usize) -> io::Result<Self> {
        if !data_pages.is_power_of_two() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("ring buffer pages must be a power of two, got {data_pages}"),
            ));
        }
        let page = page_size();
        let mmap_size = (data_pages + 1) * page;
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mmap_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let base = base as *mut u8;

        // Older kernels leave data_offset/data_size zero.
        let (data_offset, data_size) = unsafe {
            let control = &*(base as *const PerfEventMmapPage);
            let offset = ptr::read_volatile(&control.data_offset) as usize;
            let size = ptr::read_volatile(&control.data_size);
            if size == 0 {
                (page, (data_pages * page) as u64)
            } else {
                (offset, size)
            }
        };

        Ok(RingBuffer {
            base,
            mmap_size,
            data_offset,
            data_size,
            position: 0,
            scratch: Vec::new(),
        })
    }

    pub fn has_data(&self) -> bool {
        self.read_head() != self.position
    }

    /// Hands every complete record to `f` as (header, body). A record that
    /// wraps around the end of the ring is reassembled first. Returns the
    /// number of records consumed.
    pub fn drain<F>(&mut self, mut f: F) -> usize
    where
        F: FnMut(&PerfEventHeader, &[u8]),
    {
        let head = self.read_head();
        let header_size = mem::size_of::<PerfEventHeader>();
        let mut count = 0;

        while self.position < head {
            let mut header_bytes = [0u8; mem::size_of::<PerfEventHeader>()];
            self.copy_out(self.position, &mut header_bytes);
            let mut header = PerfEventHeader::default();
            if plain::copy_from_bytes(&mut header, &header_bytes).is_err() {
                break;
            }
            let size = header.size as usize;
            if size < header_size {
                tracing::warn!("corrupt perf record of size {size}, dropping ring contents");
                self.position = head;
                break;
            }

            let mut body = mem::take(&mut self.scratch);
            body.resize(size - header_size, 0);
            self.copy_out(self.position + header_size as u64, &mut body);
            f(&header, &body);
            self.scratch = body;

            self.position += size as u64;
            count += 1;
        }

        self.write_tail(self.position);
        count
    }

    fn copy_out(&self, position: u64, dst: &mut [u8]) {
        let data = self.data_slice();
        let start = (position % self.data_size) as usize;
        let first = dst.len().min(data.len() - start);
        dst[..first].copy_from_slice(&data[start..start + first]);
        if first < dst.len() {
            let rest = dst.len() - first;
            dst[first..].copy_from_slice(&data[..rest]);
        }
    }

    fn read_head(&self) -> u64 {
        unsafe {
            let control = &*(self.base as *const PerfEventMmapPage);
            let head = ptr::read_volatile(&control.data_head);
            fence(Ordering::Acquire);
            head
        }
    }

    fn write_tail(&self, value: u64) {
        unsafe {
            let control = &mut *(self.base as *mut PerfEventMmapPage);
            fence(Ordering::Release);
            ptr::write_volatile(&mut control.data_tail, value);
        }
    }

    fn data_slice(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(self.base.add(self.data_offset), self.data_size as usize)
        }
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.mmap_size);
        }
    }
}

#[cfg(test)]
impl RingBuffer {
    /// Anonymous mapping laid out like a perf ring so consumers can be
    /// exercised without the kernel.
    pub(crate) fn anonymous(data_pages: usize) -> Self {
        let page = page_size();
        let mmap_size = (data_pages + 1) * page;
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mmap_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert_ne!(base, libc::MAP_FAILED);
        RingBuffer {
            base: base as *mut u8,
            mmap_size,
            data_offset: page,
            data_size: (data_pages * page) as u64,
            position: 0,
            scratch: Vec::new(),
        }
    }

    /// Writes one record at `head` the way the kernel would and publishes it.
    pub(crate) fn produce(&mut self, head: &mut u64, type_: u32, payload: &[u8]) {
        let size = (mem::size_of::<PerfEventHeader>() + payload.len()) as u16;
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&type_.to_ne_bytes());
        bytes.extend_from_slice(&0u16.to_ne_bytes());
        bytes.extend_from_slice(&size.to_ne_bytes());
        bytes.extend_from_slice(payload);
        let data_size = self.data_size;
        let data = unsafe {
            std::slice::from_raw_parts_mut(self.base.add(self.data_offset), data_size as usize)
        };
        for (i, b) in bytes.iter().enumerate() {
            data[((*head + i as u64) % data_size) as usize] = *b;
        }
        *head += bytes.len() as u64;
        unsafe {
            let control = &mut *(self.base as *mut PerfEventMmapPage);
            control.data_head = *head;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_in_order() {
        let mut ring = RingBuffer::anonymous(1);
        let mut head = 0;
        ring.produce(&mut head, 9, &1u64.to_ne_bytes());
        ring.produce(&mut head, 2, &2u64.to_ne_bytes());

        let mut seen = Vec::new();
        let count = ring.drain(|header, body| {
            seen.push((header.type_, u64::from_ne_bytes(body.try_into().unwrap())));
        });
        assert_eq!(count, 2);
        assert_eq!(seen, vec![(9, 1), (2, 2)]);
        assert!(!ring.has_data());
    }

    #[test]
    fn test_drain_reassembles_wrapped_record() {
        let mut ring = RingBuffer::anonymous(1);
        let data_size = ring.data_size;
        // Move the producer close to the end so the next record wraps.
        let mut head = data_size - 12;
        ring.position = head;

        let payload: Vec<u8> = (0u8..24).collect();
        ring.produce(&mut head, 9, &payload);

        let mut bodies = Vec::new();
        ring.drain(|_, body| bodies.push(body.to_vec()));
        assert_eq!(bodies, vec![payload]);
        assert_eq!(ring.position, head);
    }
}
