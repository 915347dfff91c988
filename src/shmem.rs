//! Shared request/response region between host and worker
//!
//! A single fixed-layout mapping carries the request body in, and the debug
//! output and response back out. The worker overwrites the body slot in
//! place with its response; only the trailing word records the response
//! length.
//!
//! ```text
//! [0..4)                  LE u32  request body length   (host-written)
//! [4..8)                  LE u32  debug buffer length   (worker-written)
//! [8..6_291_564)          request body / response
//! [6_291_564..6_394_532)  debug buffer
//! [6_394_532..6_394_536)  LE u32  response length       (worker-written)
//! ```

use memmap::{MmapMut, MmapOptions};
use std::ffi::CString;
use std::fs::File;
use std::io::{self, ErrorKind};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

pub const REGION_SIZE: usize = 6_394_536;

const BODY_MAX: usize = 6_291_556;
const BODY_BEGIN: usize = 8;
const BODY_END: usize = BODY_BEGIN + BODY_MAX;

const DEBUG_MAX: usize = 102_968;
const DEBUG_BEGIN: usize = BODY_END;
const DEBUG_END: usize = DEBUG_BEGIN + DEBUG_MAX;

pub struct SharedRegion {
    file: File,
    map: MmapMut,
    off: usize,
}

impl SharedRegion {
    /// Open a named shared memory object, size it, map it, and immediately
    /// unlink the name so no artifact survives the process. The returned
    /// region is zero-filled.
    pub fn create(name: &str) -> io::Result<SharedRegion> {
        let cname = CString::new(name)
            .map_err(|err| io::Error::new(ErrorKind::InvalidInput, err))?;
        let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDWR | libc::O_CREAT, 0o777) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let file = unsafe { File::from_raw_fd(fd) };
        file.set_len(REGION_SIZE as u64)?;
        let mut map = unsafe { MmapOptions::new().len(REGION_SIZE).map_mut(&file)? };
        if unsafe { libc::shm_unlink(cname.as_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }

        // zero by doubling: one byte, then copy each prefix over the
        // following equal-length run
        map[0] = 0;
        let mut bp = 1;
        while bp < REGION_SIZE {
            let n = bp.min(REGION_SIZE - bp);
            map.copy_within(0..n, bp);
            bp *= 2;
        }

        Ok(SharedRegion { file, map, off: 0 })
    }

    /// Append into the request body slot, clipping at the slot boundary, and
    /// update the request length header. Returns how many bytes landed.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let start = BODY_BEGIN + self.off;
        let n = data.len().min(BODY_END - start);
        self.map[start..start + n].copy_from_slice(&data[..n]);
        self.off += n;
        self.map[0..4].copy_from_slice(&(self.off as u32).to_le_bytes());
        n
    }

    /// Zero the two leading length headers and the write cursor. Idempotent.
    pub fn reset(&mut self) {
        self.off = 0;
        self.map[0..8].copy_from_slice(&[0u8; 8]);
    }

    /// Debug output the worker recorded during the last invocation
    pub fn debug(&self) -> &[u8] {
        let len = read_u32(&self.map[4..8]) as usize;
        let end = (DEBUG_BEGIN + len).min(DEBUG_END);
        &self.map[DEBUG_BEGIN..end]
    }

    /// Response the worker wrote over the body slot, sized by the trailing
    /// length word
    pub fn response(&self) -> &[u8] {
        let len = read_u32(&self.map[DEBUG_END..DEBUG_END + 4]) as usize;
        let end = (BODY_BEGIN + len).min(BODY_END);
        &self.map[BODY_BEGIN..end]
    }

    /// Backing file descriptor, for handoff into the sandbox
    pub fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_constants() {
        assert_eq!(BODY_END, 6_291_564);
        assert_eq!(DEBUG_END, 6_394_532);
        assert_eq!(DEBUG_END + 4, REGION_SIZE);
    }

    #[test]
    fn create_zero_fills() {
        let shm = SharedRegion::create("slicertest-zero").unwrap();
        assert_eq!(&shm.map[0..8], &[0u8; 8]);
        assert!(shm.map[REGION_SIZE - 4096..].iter().all(|b| *b == 0));
        assert!(shm.debug().is_empty());
        assert!(shm.response().is_empty());
    }

    #[test]
    fn write_appends_and_updates_header() {
        let mut shm = SharedRegion::create("slicertest-write").unwrap();
        assert_eq!(shm.write(b"{\"x\""), 4);
        assert_eq!(shm.write(b":1}"), 3);
        assert_eq!(read_u32(&shm.map[0..4]), 7);
        assert_eq!(&shm.map[BODY_BEGIN..BODY_BEGIN + 7], b"{\"x\":1}");
    }

    #[test]
    fn write_clips_at_body_slot() {
        let mut shm = SharedRegion::create("slicertest-clip").unwrap();
        let big = vec![0xaau8; BODY_MAX + 4096];
        assert_eq!(shm.write(&big), BODY_MAX);
        // nothing crossed into the debug slot
        assert!(shm.map[DEBUG_BEGIN..DEBUG_BEGIN + 16].iter().all(|b| *b == 0));
        assert_eq!(shm.write(b"more"), 0);
        assert_eq!(read_u32(&shm.map[0..4]) as usize, BODY_MAX);
    }

    #[test]
    fn reset_is_idempotent() {
        let mut shm = SharedRegion::create("slicertest-reset").unwrap();
        shm.write(b"payload");
        shm.map[4..8].copy_from_slice(&7u32.to_le_bytes());
        shm.reset();
        assert_eq!(&shm.map[0..8], &[0u8; 8]);
        assert_eq!(shm.off, 0);
        shm.reset();
        assert_eq!(&shm.map[0..8], &[0u8; 8]);
        assert_eq!(shm.write(b"x"), 1);
        assert_eq!(read_u32(&shm.map[0..4]), 1);
    }

    #[test]
    fn response_caps_at_slot_size() {
        let mut shm = SharedRegion::create("slicertest-resp").unwrap();
        shm.map[BODY_BEGIN..BODY_BEGIN + 4].copy_from_slice(b"done");
        shm.map[DEBUG_END..DEBUG_END + 4].copy_from_slice(&4u32.to_le_bytes());
        assert_eq!(shm.response(), b"done");
        shm.map[DEBUG_END..DEBUG_END + 4].copy_from_slice(&u32::MAX.to_le_bytes());
        assert_eq!(shm.response().len(), BODY_MAX);
    }

    #[test]
    fn debug_caps_at_slot_size() {
        let mut shm = SharedRegion::create("slicertest-debug").unwrap();
        shm.map[DEBUG_BEGIN..DEBUG_BEGIN + 5].copy_from_slice(b"hello");
        shm.map[4..8].copy_from_slice(&5u32.to_le_bytes());
        assert_eq!(shm.debug(), b"hello");
        shm.map[4..8].copy_from_slice(&(DEBUG_MAX as u32 + 99).to_le_bytes());
        assert_eq!(shm.debug().len(), DEBUG_MAX);
    }
}
