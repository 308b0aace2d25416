use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::slice;
use tracing::trace;

/// Read-only memory mapping of a response body, unmapped on drop.
///
/// The mapping lives exactly as long as the connection's pending response,
/// including every error path out of the send loop. Zero-length files are
/// never mapped (`mmap` rejects them); callers special-case them.
pub struct MappedFile {
    ptr: *mut u8,
    len: usize,
}

impl MappedFile {
    pub fn map(file: &File, len: usize) -> io::Result<MappedFile> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        trace!("mapped {len} bytes");
        Ok(MappedFile {
            ptr: ptr as *mut u8,
            len,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}

// The mapping is immutable shared memory; connections migrate between the
// dispatcher and worker threads with their response body attached.
unsafe impl Send for MappedFile {}
unsafe impl Sync for MappedFile {}
