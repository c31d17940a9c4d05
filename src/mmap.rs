pub const PAGE_SIZE: usize = 4096;

#[cfg(windows)]
pub mod _win {
    use super::PAGE_SIZE;
    use crate::utils::is_aligned;
    use core::ptr::null_mut;
    use winapi::um::{
        memoryapi::{VirtualAlloc, VirtualFree},
        winnt::{MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE},
    };

    pub struct Mmap {
        start: *mut u8,
        end: *mut u8,
        size: usize,
    }

    impl Mmap {
        /// Reserve `size` bytes of page-aligned address space. Returns `None`
        /// when the platform has no backing memory left.
        pub fn new(size: usize) -> Option<Self> {
            debug_assert!(is_aligned(size, PAGE_SIZE));
            unsafe {
                let mem = VirtualAlloc(null_mut(), size, MEM_RESERVE, PAGE_READWRITE);
                if mem.is_null() {
                    return None;
                }
                let mem = mem as *mut u8;
                Some(Self {
                    start: mem,
                    end: mem.add(size),
                    size,
                })
            }
        }

        pub fn start(&self) -> *mut u8 {
            self.start
        }

        pub fn end(&self) -> *mut u8 {
            self.end
        }

        pub const fn size(&self) -> usize {
            self.size
        }

        pub fn commit(&self, page: *mut u8, size: usize) {
            unsafe {
                VirtualAlloc(page.cast(), size, MEM_COMMIT, PAGE_READWRITE);
            }
        }

        pub fn decommit(&self, page: *mut u8, size: usize) {
            unsafe {
                VirtualFree(page.cast(), size, MEM_DECOMMIT);
            }
        }
    }

    impl Drop for Mmap {
        fn drop(&mut self) {
            unsafe {
                VirtualFree(self.start.cast(), 0, MEM_RELEASE);
            }
        }
    }
}

#[cfg(unix)]
pub mod _unix {
    use super::PAGE_SIZE;
    use crate::utils::is_aligned;

    pub struct Mmap {
        start: *mut u8,
        end: *mut u8,
        size: usize,
    }

    impl Mmap {
        /// Reserve `size` bytes of page-aligned address space. Returns `None`
        /// when the platform has no backing memory left.
        pub fn new(size: usize) -> Option<Self> {
            debug_assert!(is_aligned(size, PAGE_SIZE));
            unsafe {
                let map = libc::mmap(
                    core::ptr::null_mut(),
                    size as _,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                );
                if map == libc::MAP_FAILED {
                    return None;
                }
                Some(Self {
                    start: map as *mut u8,
                    end: (map as usize + size) as *mut u8,
                    size,
                })
            }
        }

        pub fn start(&self) -> *mut u8 {
            self.start
        }

        pub fn end(&self) -> *mut u8 {
            self.end
        }

        pub const fn size(&self) -> usize {
            self.size
        }

        pub fn commit(&self, page: *mut u8, size: usize) {
            unsafe {
                libc::madvise(
                    page as *mut _,
                    size as _,
                    libc::MADV_WILLNEED | libc::MADV_SEQUENTIAL,
                );
            }
        }

        pub fn decommit(&self, page: *mut u8, size: usize) {
            unsafe {
                libc::madvise(page as *mut _, size as _, libc::MADV_DONTNEED);
            }
        }
    }

    impl Drop for Mmap {
        fn drop(&mut self) {
            unsafe {
                libc::munmap(self.start as *mut _, self.size as _);
            }
        }
    }
}

#[cfg(unix)]
pub use _unix::*;
#[cfg(windows)]
pub use _win::*;
