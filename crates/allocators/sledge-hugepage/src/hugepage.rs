use lazy_static::lazy_static;
use libc::{MAP_POPULATE, MAP_SHARED, O_CREAT, O_RDWR};
use log::info;
use sledge_core::allocator::RegionAllocator;
use sledge_core::memory::Memory;
use sledge_core::util::Size::{self, MB};
use std::ffi::{CString, c_void};
use std::fs::File;
use std::io::Read;

// https://www.kernel.org/doc/Documentation/vm/hugetlbpage.txt
//
// The output of "cat /proc/meminfo" will include lines like:
// ...
// HugePages_Total: uuu
// HugePages_Free:  vvv
// Hugepagesize:    yyy kB

const MEMINFO_PATH: &str = "/proc/meminfo";
const TOKEN: &str = "Hugepagesize:";

/// Fixed mapping address for the hammering region. Aligned to the 1 GiB
/// region size so that the low 30 address bits equal the region offset.
const REGION_ADDR: usize = 0x2000000000;

lazy_static! {
    static ref HUGEPAGE_SIZE: isize = {
        let buf = File::open(MEMINFO_PATH).map_or("".to_owned(), |mut f| {
            let mut s = String::new();
            let _ = f.read_to_string(&mut s);
            s
        });
        parse_hugepage_size(&buf)
    };
}

fn parse_hugepage_size(s: &str) -> isize {
    for line in s.lines() {
        if line.starts_with(TOKEN) {
            let mut parts = match line.strip_prefix(TOKEN) {
                Some(line) => line.split_whitespace(),
                None => panic!("Invalid line: {}", line),
            };

            let p = parts.next().unwrap_or("0");
            let mut hugepage_size = p.parse::<isize>().unwrap_or(-1);

            hugepage_size *= parts.next().map_or(1, |x| match x {
                "kB" => 1024,
                _ => 1,
            });

            return hugepage_size;
        }
    }

    -1
}

/// Hugepage-backed allocator for the hammering region.
///
/// Maps a 1 GB hugepage from `/dev/hugepages` at a fixed, region-aligned
/// address. The hugepage size is detected from `/proc/meminfo`.
///
/// # Platform Requirements
///
/// - 1GB hugepages must be configured via kernel boot parameters
/// - Hugepagefs must be mounted at `/dev/hugepages`
/// - Currently only supports x86_64 architecture
#[cfg(target_arch = "x86_64")]
#[derive(Debug, Default, Copy, Clone)]
pub struct HugepageAllocator {}

/// Supported hugepage sizes.
pub enum HugepageSize {
    /// 1 Gigabyte hugepage
    OneGb,
}

impl RegionAllocator for HugepageAllocator {
    type Error = std::io::Error;

    fn block_size(&self) -> Size {
        Size::B(*HUGEPAGE_SIZE as usize)
    }

    fn alloc_region(&mut self, size: Size) -> Result<Memory, Self::Error> {
        assert!(
            size.bytes() <= self.block_size().bytes(),
            "Only support allocations up to 0x{:x} bytes",
            self.block_size().bytes()
        );
        assert_eq!(self.block_size().bytes(), MB(1024).bytes());
        let block = Memory::hugepage(HugepageSize::OneGb)?;
        unsafe { libc::memset(block.ptr as *mut c_void, 0x00, self.block_size().bytes()) };
        info!(
            "mapped 1 GB hugepage hammering region at {:p}",
            block.ptr
        );
        Ok(block)
    }
}

trait Hugepage {
    fn hugepage(size: HugepageSize) -> Result<Self, std::io::Error>
    where
        Self: Sized;
}

impl Hugepage for Memory {
    fn hugepage(size: HugepageSize) -> Result<Self, std::io::Error> {
        let hp_size = match size {
            HugepageSize::OneGb => MB(1024).bytes(),
        };
        let fd = unsafe {
            libc::open(
                CString::new("/dev/hugepages/sledge_huge")
                    .expect("CString")
                    .as_ptr(),
                O_RDWR | O_CREAT,
                666,
            )
        };
        if fd == -1 {
            return Err(std::io::Error::last_os_error());
        }
        let p = unsafe {
            libc::mmap(
                REGION_ADDR as *mut libc::c_void,
                hp_size,
                libc::PROT_READ | libc::PROT_WRITE,
                MAP_SHARED | MAP_POPULATE,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };
        if p == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error());
        }
        Ok(Memory::new(p as *mut u8, hp_size))
    }
}

#[cfg(target_arch = "x86_64")]
#[cfg(test)]
mod tests {
    use super::*;
    use sledge_core::memory::BytePointer;

    #[test]
    fn test_parse_hugepage_size() {
        // correct.
        assert_eq!(parse_hugepage_size("Hugepagesize:1024"), 1024);
        assert_eq!(parse_hugepage_size("Hugepagesize: 2 kB"), 2048);

        // wrong.
        assert_eq!(parse_hugepage_size("Hugepagesize:1kB"), -1);
        assert_eq!(parse_hugepage_size("Hugepagesize: 2kB"), -1);
    }

    #[test]
    #[ignore]
    fn test_allocator() {
        let mut hugepage_alloc = HugepageAllocator {};
        let mem = hugepage_alloc
            .alloc_region(Size::GB(1))
            .expect("allocation failed");
        let p = mem.ptr();
        assert!(!p.is_null(), "allocation failed");
        assert_eq!(p as usize % (1 << 30), 0, "region must be 1 GiB aligned");
        unsafe {
            *p = 20;
            assert_eq!(*p, 20);
        }
        mem.dealloc();
    }
}
