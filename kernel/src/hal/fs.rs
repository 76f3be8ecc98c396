//! File-system collaborator.

/// Open-file and directory-reference handling.
///
/// Closing a file or dropping the last directory reference may sleep, so
/// the lifecycle manager never calls [`FileSystem::close_file`] or
/// [`FileSystem::release_dir`] while it holds the process table lock.
pub trait FileSystem: Sync {
    /// Reference-counted open file.
    type File: Send;
    /// Reference-counted directory inode.
    type Dir: Send;

    /// New reference to the same open file.
    fn dup_file(&self, file: &Self::File) -> Self::File;

    /// Drop one reference to an open file.
    fn close_file(&self, file: Self::File);

    /// New reference to the same directory.
    fn dup_dir(&self, dir: &Self::Dir) -> Self::Dir;

    /// Drop one directory reference. Must be bracketed by
    /// [`FileSystem::begin_op`] / [`FileSystem::end_op`].
    fn release_dir(&self, dir: Self::Dir);

    /// Open a file-system transaction.
    fn begin_op(&self);

    /// Close the transaction opened by [`FileSystem::begin_op`].
    fn end_op(&self);

    /// Reference to the root directory (initial working directory).
    fn root_dir(&self) -> Self::Dir;
}
