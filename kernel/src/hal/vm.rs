//! Address-space collaborator.
//!
//! Page tables are opaque to the lifecycle manager. It only decides *who*
//! owns a space and *how large* it may become; mapping and copying pages is
//! the job of the implementation behind [`AddressSpaces`].

use bitflags::bitflags;

use crate::process::context::KernelStack;

bitflags! {
    /// Permissions for pages mapped into a user image.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        /// Page is writable.
        const WRITABLE = 1 << 1;
        /// Page is reachable from user mode.
        const USER = 1 << 2;
    }
}

impl PageFlags {
    /// Flags for ordinary heap and stack pages of a user image.
    pub const USER_DATA: PageFlags = PageFlags::WRITABLE.union(PageFlags::USER);
}

/// Page-table operations on user address spaces.
///
/// Sizes are byte offsets of the contiguous user image (`0..size`).
pub trait AddressSpaces: Sync {
    /// Handle to one page table. Dropping it must not free anything;
    /// release goes through [`AddressSpaces::destroy_space`].
    type Space: Send;

    /// Fresh space holding only the kernel mappings.
    fn create_space(&self) -> Option<Self::Space>;

    /// Copy of the first `size` bytes of `src` into a new space.
    fn copy_space(&self, src: &Self::Space, size: usize) -> Option<Self::Space>;

    /// Map pages for `old_size..new_size`; returns the new size.
    fn grow_space(
        &self,
        space: &mut Self::Space,
        old_size: usize,
        new_size: usize,
        flags: PageFlags,
    ) -> Option<usize>;

    /// Unmap pages for `new_size..old_size`; returns the new size.
    fn shrink_space(&self, space: &mut Self::Space, old_size: usize, new_size: usize)
        -> Option<usize>;

    /// Free every user page and the page table itself.
    fn destroy_space(&self, space: Self::Space);

    /// Copy `bytes` to user address `va`.
    fn copy_out(&self, space: &mut Self::Space, va: usize, bytes: &[u8]) -> Option<()>;

    /// Make the page at `va` inaccessible from user mode (stack guard).
    fn protect_inaccessible(&self, space: &mut Self::Space, va: usize);

    /// Load `space` (and the kernel stack used for traps) on this CPU.
    fn activate_space(&self, space: &Self::Space, kstack: &KernelStack);

    /// Load the kernel-only page table on this CPU.
    fn activate_kernel_space(&self);
}
