/// Page shift value (12 bits) for 4KB pages
pub const PAGE_SHIFT: usize = 12;
/// Standard page size (4096 bytes)
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
/// Mask for extracting page offset
pub const PAGE_MASK: usize = PAGE_SIZE - 1;

/// Row shift value (13 bits) for 8KB rows
pub const ROW_SHIFT: usize = 13;
/// Standard DRAM row size (8192 bytes)
pub const ROW_SIZE: usize = 1 << ROW_SHIFT;
/// Mask for extracting row offset
pub const ROW_MASK: usize = ROW_SIZE - 1;

/// Cache line size (64 bytes) for x86_64
pub const CL_SIZE: usize = 64;

/// Shift of the hammering region base: address translation covers the low
/// 30 bits, everything above belongs to the region base MSB.
pub const REGION_SHIFT: usize = 30;

/// Length of one DDR4 refresh interval (tREFI) in microseconds
pub const REF_INTERVAL_LEN_US: f32 = 7.8;
