//! POSIX shared memory regions with typestate-based cleanup.
//!
//! Frag rings, payload stores, flow-control words and command-and-control
//! objects all live in named POSIX shared memory so that producers in other
//! processes can attach to them. Their sizes depend on runtime parameters
//! (ring depth, payload MTU), so the mapping here is a byte region of
//! runtime length rather than a single `T`.
//!
//! # Overview
//!
//! - [`ShmPath`] - A validated POSIX shared memory name
//! - [`ShmRegion<Mode>`] - Mapped region with typestate-based cleanup
//! - [`Creator`] - Creates a new object, unlinks its name on drop
//! - [`Opener`] - Opens an existing object, leaves the name on drop
//! - [`SharedMemorySafe`] - Marker for types that may be viewed in a region
//!
//! ```no_run
//! use fragmux::ipc::shmem::{Creator, Opener, ShmPath, ShmRegion};
//!
//! let path = ShmPath::new("/fragmux-doc")?;
//!
//! // Process A creates and sizes the object (zero filled).
//! let created = ShmRegion::<Creator>::create(path.clone(), 4096)?;
//!
//! // Process B maps the same bytes.
//! let opened = ShmRegion::<Opener>::open(path)?;
//! assert_eq!(opened.len(), created.len());
//! # Ok::<(), fragmux::ipc::shmem::ShmError>(())
//! ```
//!
//! # Cleanup and Crash Handling
//!
//! - **[`Creator`]**: unmaps AND unlinks the name on drop
//! - **[`Opener`]**: only unmaps (name persists for other processes)
//!
//! A crashed creator leaks its name. Tools that own a name should unlink any
//! leftover before creating it again (see [`unlink`]).

use rustix::fs::{Mode, fstat, ftruncate};
use rustix::mm::{MapFlags, ProtFlags, mmap, munmap};
use rustix::{io, shm};
use std::fmt;
use std::marker::PhantomData;
use std::ptr::{NonNull, null_mut};
use std::sync::atomic::*;

use super::region::Region;

/// Result alias for shared memory operations.
pub type Result<T> = std::result::Result<T, ShmError>;

/// Contextual errors produced by [`ShmRegion`] and [`ShmPath`].
#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    /// The provided POSIX shared memory name is invalid.
    #[error("invalid shared memory path `{path}`: {reason}")]
    InvalidPath { path: String, reason: &'static str },
    /// `shm_open`, `ftruncate`, `fstat` or `mmap` failed with an errno.
    #[error("{op} failed for `{path}`: {source}")]
    Posix {
        op: &'static str,
        path: String,
        source: io::Errno,
    },
    /// The object is empty or its size does not fit the address space.
    #[error("shared memory `{path}` has unusable size {size}")]
    BadSize { path: String, size: i64 },
}

impl ShmError {
    fn posix(op: &'static str, path: &ShmPath, err: io::Errno) -> Self {
        Self::Posix {
            op,
            path: path.as_str().to_owned(),
            source: err,
        }
    }

    /// Returns `true` if the error is a permission failure.
    ///
    /// Sandboxed environments commonly deny `shm_open`; tests use this to
    /// skip rather than fail.
    #[must_use]
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::Posix { source, .. } if *source == io::Errno::ACCESS || *source == io::Errno::PERM)
    }
}

const POSIX_NAME_MAX: usize = 255;

/// A validated POSIX shared memory object name.
///
/// POSIX requires the name to start with `/`, contain no further `/`, and
/// not exceed `NAME_MAX` (255) bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShmPath(String);

impl ShmPath {
    /// Validates and wraps a shared memory name.
    ///
    /// # Errors
    ///
    /// Returns [`ShmError::InvalidPath`] if the name breaks any POSIX rule.
    pub fn new(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        let reason = if !path.starts_with('/') {
            Some("path must start with '/'")
        } else if path[1..].contains('/') {
            Some("path must not contain additional '/' characters")
        } else if path.len() > POSIX_NAME_MAX {
            Some("path length must be <= 255 bytes")
        } else if path.len() == 1 {
            Some("path must name an object after the leading '/'")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(ShmError::InvalidPath { path, reason }),
            None => Ok(Self(path)),
        }
    }

    /// Returns the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShmPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for ShmPath {
    type Err = ShmError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl From<ShmPath> for String {
    fn from(path: ShmPath) -> Self {
        path.0
    }
}

/// Removes a shared memory name, ignoring "does not exist".
///
/// # Errors
///
/// Any errno other than `ENOENT`.
pub fn unlink(path: &ShmPath) -> Result<()> {
    match shm::unlink(path.as_str()) {
        Ok(()) => Ok(()),
        Err(err) if err == io::Errno::NOENT => Ok(()),
        Err(err) => Err(ShmError::posix("shm_unlink", path, err)),
    }
}

/// Trait defining cleanup behavior for shared memory modes.
///
/// ```text
/// Creator          Opener
///    ↓                ↓
///   Drop            Drop
///    ↓                ↓
/// munmap()        munmap()
/// unlink()        (no unlink)
/// ```
pub trait ShmMode {
    /// Whether to unlink the shared memory name on drop.
    const SHOULD_UNLINK: bool;
}

/// Typestate marker for the process that creates (and owns) the object.
pub struct Creator;
impl ShmMode for Creator {
    const SHOULD_UNLINK: bool = true;
}

/// Typestate marker for processes that attach to an existing object.
pub struct Opener;
impl ShmMode for Opener {
    const SHOULD_UNLINK: bool = false;
}

/// Types that may be viewed in place inside a shared region.
///
/// # Safety
///
/// Implementers must guarantee:
///
/// | Property | Requirement |
/// |----------|-------------|
/// | **Layout** | `#[repr(C)]` or `#[repr(transparent)]` |
/// | **Zero init** | The all-zero bit pattern is a valid value |
/// | **Pointers** | No heap/stack pointers or references |
/// | **Mutation** | Shared mutation only through atomics |
/// | **Concurrency** | `Send + Sync` |
///
/// Regions are zero filled on creation and other processes mutate them
/// concurrently, so every field a peer may write must be an atomic.
pub unsafe trait SharedMemorySafe: Send + Sync {}

macro_rules! impl_shared_memory_safe {
    ($($t:ty),* $(,)?) => {
        $(
            unsafe impl SharedMemorySafe for $t {}
        )*
    };
}

impl_shared_memory_safe! {
    u8, u16, u32, u64,
    AtomicBool,
    AtomicI8, AtomicI16, AtomicI32, AtomicI64,
    AtomicU8, AtomicU16, AtomicU32, AtomicU64,
}

unsafe impl<T: SharedMemorySafe, const N: usize> SharedMemorySafe for [T; N] {}

/// A mapped POSIX shared memory object of runtime length.
///
/// # Safety Invariants
///
/// - **Mapped**: `ptr` points to `len` bytes mapped `MAP_SHARED` read-write
/// - **Aligned**: `ptr` is page aligned
/// - **Lifetime**: the mapping stays valid until drop
pub struct ShmRegion<Mode: ShmMode> {
    ptr: NonNull<u8>,
    len: usize,
    path: ShmPath,
    _mode: PhantomData<Mode>,
}

// SAFETY: the region is plain shared memory. Nothing in it is thread-local,
// and all access goes through `SharedMemorySafe` views.
unsafe impl<Mode: ShmMode> Send for ShmRegion<Mode> {}
unsafe impl<Mode: ShmMode> Sync for ShmRegion<Mode> {}

/// Maps `len` bytes of `fd` read-write and shared.
fn map_shared(fd: &rustix::fd::OwnedFd, len: usize, path: &ShmPath) -> Result<NonNull<u8>> {
    // SAFETY: a fresh mapping from the kernel aliases no Rust object. The
    // object has been sized to at least `len` bytes by the caller.
    let ptr = unsafe {
        mmap(
            null_mut(),
            len,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            fd,
            0,
        )
    }
    .map_err(|err| ShmError::posix("mmap", path, err))?;

    NonNull::new(ptr.cast::<u8>()).ok_or(ShmError::BadSize {
        path: path.as_str().to_owned(),
        size: len as i64,
    })
}

impl ShmRegion<Creator> {
    /// Creates a new object of `len` bytes and maps it.
    ///
    /// The contents start zero filled. The name is unlinked on drop.
    ///
    /// # Errors
    ///
    /// - `EEXIST` if the name is already taken
    /// - `EACCES` on permission failure
    /// - [`ShmError::BadSize`] if `len` is zero
    pub fn create(path: ShmPath, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(ShmError::BadSize {
                path: path.into(),
                size: 0,
            });
        }

        let fd = shm::open(
            path.as_str(),
            shm::OFlags::CREATE | shm::OFlags::EXCL | shm::OFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        )
        .map_err(|err| ShmError::posix("shm_open", &path, err))?;

        if let Err(err) = ftruncate(&fd, len as u64) {
            drop(fd);
            let _ = shm::unlink(path.as_str());
            return Err(ShmError::posix("ftruncate", &path, err));
        }

        let ptr = match map_shared(&fd, len, &path) {
            Ok(ptr) => ptr,
            Err(err) => {
                drop(fd);
                let _ = shm::unlink(path.as_str());
                return Err(err);
            }
        };

        Ok(Self {
            ptr,
            len,
            path,
            _mode: PhantomData,
        })
    }

    /// Gives up ownership of the name: the object outlives this process
    /// and must be removed with [`unlink`].
    #[must_use]
    pub fn persist(self) -> ShmRegion<Opener> {
        let this = std::mem::ManuallyDrop::new(self);
        // SAFETY: `this` is never dropped, so `path` is moved out once.
        let path = unsafe { std::ptr::read(&this.path) };
        ShmRegion {
            ptr: this.ptr,
            len: this.len,
            path,
            _mode: PhantomData,
        }
    }
}

impl ShmRegion<Opener> {
    /// Opens an existing object and maps all of it.
    ///
    /// # Errors
    ///
    /// - `ENOENT` if the object does not exist
    /// - `EACCES` on permission failure
    /// - [`ShmError::BadSize`] if the object is empty
    pub fn open(path: ShmPath) -> Result<Self> {
        let fd = shm::open(path.as_str(), shm::OFlags::RDWR, Mode::empty())
            .map_err(|err| ShmError::posix("shm_open", &path, err))?;

        let stat = fstat(&fd).map_err(|err| ShmError::posix("fstat", &path, err))?;
        let len = match usize::try_from(stat.st_size) {
            Ok(len) if len > 0 => len,
            _ => {
                return Err(ShmError::BadSize {
                    path: path.into(),
                    size: stat.st_size as i64,
                });
            }
        };

        let ptr = map_shared(&fd, len, &path)?;

        Ok(Self {
            ptr,
            len,
            path,
            _mode: PhantomData,
        })
    }
}

impl<Mode: ShmMode> ShmRegion<Mode> {
    /// Returns the name this region was created or opened with.
    #[must_use]
    pub fn path(&self) -> &ShmPath {
        &self.path
    }

    /// Returns the mapped length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the region is empty (never, once constructed).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

// SAFETY: `ptr` is a live read-write mapping of `len` bytes until drop.
unsafe impl<Mode: ShmMode + 'static> Region for ShmRegion<Mode> {
    fn base(&self) -> NonNull<u8> {
        self.ptr
    }

    fn len(&self) -> usize {
        self.len
    }
}

impl<Mode: ShmMode> Drop for ShmRegion<Mode> {
    fn drop(&mut self) {
        // SAFETY: ptr/len describe the mapping created in the constructor,
        // and no view can outlive `self`.
        unsafe {
            let _ = munmap(self.ptr.as_ptr().cast(), self.len);
        }

        if Mode::SHOULD_UNLINK {
            let _ = shm::unlink(self.path.as_str());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shm_path_valid() {
        assert!(ShmPath::new("/valid").is_ok());
        assert!(ShmPath::new("/fragmux-in0-mcache").is_ok());
        assert!(ShmPath::new("/valid_name_123").is_ok());
    }

    #[test]
    fn test_shm_path_no_leading_slash() {
        let result = ShmPath::new("no-slash");
        assert!(matches!(
            result,
            Err(ShmError::InvalidPath { reason, .. }) if reason == "path must start with '/'"
        ));
    }

    #[test]
    fn test_shm_path_extra_slashes() {
        let result = ShmPath::new("/foo/bar");
        assert!(matches!(
            result,
            Err(ShmError::InvalidPath { reason, .. })
                if reason == "path must not contain additional '/' characters"
        ));
    }

    #[test]
    fn test_shm_path_bare_slash() {
        assert!(ShmPath::new("/").is_err());
    }

    #[test]
    fn test_shm_path_too_long() {
        let long_path = format!("/{}", "a".repeat(255));
        assert!(matches!(
            ShmPath::new(long_path),
            Err(ShmError::InvalidPath { reason, .. })
                if reason == "path length must be <= 255 bytes"
        ));

        // 255 chars total including the leading slash
        let max_path = format!("/{}", "a".repeat(254));
        assert!(ShmPath::new(max_path).is_ok());
    }

    #[test]
    fn test_region_create_and_open() -> Result<()> {
        let path = ShmPath::new("/fragmux-test-region")?;
        unlink(&path)?;

        let created = match ShmRegion::<Creator>::create(path.clone(), 8192) {
            Ok(region) => region,
            Err(err) if err.is_permission_denied() => {
                eprintln!("Skipping test_region_create_and_open: {err}");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        // SAFETY: the mapping is 8192 bytes and nothing else touches it.
        unsafe { created.base().as_ptr().add(100).write(0xab) };

        {
            let opened = ShmRegion::<Opener>::open(path.clone())?;
            assert_eq!(opened.len(), 8192);
            // SAFETY: same mapping, read after the write above.
            assert_eq!(unsafe { opened.base().as_ptr().add(100).read() }, 0xab);
        } // Opener drops (unmap only)

        drop(created); // Creator drops (unmap + unlink)
        assert!(ShmRegion::<Opener>::open(path).is_err());
        Ok(())
    }

    #[test]
    fn test_region_persist_keeps_name() -> Result<()> {
        let path = ShmPath::new("/fragmux-test-persist")?;
        unlink(&path)?;

        let persisted = match ShmRegion::<Creator>::create(path.clone(), 4096) {
            Ok(region) => region.persist(),
            Err(err) if err.is_permission_denied() => {
                eprintln!("Skipping test_region_persist_keeps_name: {err}");
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        drop(persisted);

        assert_eq!(ShmRegion::<Opener>::open(path.clone())?.len(), 4096);
        unlink(&path)?;
        assert!(ShmRegion::<Opener>::open(path).is_err());
        Ok(())
    }

    #[test]
    fn test_region_create_zero_len() -> Result<()> {
        let path = ShmPath::new("/fragmux-test-zero")?;
        assert!(matches!(
            ShmRegion::<Creator>::create(path, 0),
            Err(ShmError::BadSize { size: 0, .. })
        ));
        Ok(())
    }
}
