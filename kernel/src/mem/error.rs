// kernel/src/mem/error.rs

/// Error taxonomy for the physical-memory core. No heap allocation, no
/// `std::error::Error` impl — this is a `no_std` leaf crate and every other
/// error type in the codebase is a plain enum too.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemError {
    /// `alloc` could not satisfy a request at any order.
    OutOfMemory,
    /// A virtual address was not aligned to the required page/huge-page size.
    Misaligned,
    /// A walker callback returned an error and aborted the traversal.
    WalkAborted,
    /// Attempted to free a physical address that is not frame-aligned or is
    /// not the primary of its current chunk.
    InvalidFree,
    /// Attempted to free a frame that is already marked free.
    DoubleFree,
    /// The kernel image passed to `map_kernel_image` is not a well-formed
    /// ELF64 binary.
    InvalidElf,
}
