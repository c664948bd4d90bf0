//! Typed POSIX shared memory.
//!
//! [`Shm<T, Mode>`] maps one `T` into the address space. The `Mode` marker
//! decides cleanup: a [`Creator`] unlinks the name when dropped, an
//! [`Opener`] only unmaps. [`Segment`] hides which of the two (or a plain
//! heap allocation) backs a value, so the rings and signal blocks can be used
//! the same way in the bridge, in a client process and in tests.
//!
//! ```no_run
//! use cerelink::ipc::shmem::{Creator, Opener, Shm, ShmPath};
//! use std::sync::atomic::{AtomicU32, Ordering};
//!
//! let path = ShmPath::new("/cerelink-doc-counter")?;
//! let owner = Shm::<AtomicU32, Creator>::create(&path)?;
//! owner.store(42, Ordering::Release);
//!
//! let peer = Shm::<AtomicU32, Opener>::open(&path)?;
//! assert_eq!(peer.load(Ordering::Acquire), 42);
//! # Ok::<(), cerelink::ipc::shmem::ShmError>(())
//! ```
//!
//! # Crash leftovers
//!
//! A killed creator never unlinks. [`Shm::create`] fails with `EEXIST` in that
//! case; callers that own a name unconditionally should [`unlink`] it first.

use std::fmt;
use std::marker::PhantomData;
use std::mem::size_of;
use std::ops::Deref;
use std::ptr::{NonNull, null_mut};
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU8, AtomicU16, AtomicU32, AtomicU64};

use rustix::fs::{Mode, fstat, ftruncate};
use rustix::mm::{MapFlags, ProtFlags, mmap, munmap};
use rustix::{io, shm};
use thiserror::Error;

/// Result alias for shared memory operations.
pub type Result<T> = std::result::Result<T, ShmError>;

/// Errors produced by [`Shm`] and [`ShmPath`].
#[derive(Debug, Error)]
pub enum ShmError {
    /// The name is not a portable POSIX shared memory name.
    #[error("invalid shared memory path `{path}`: {reason}")]
    InvalidPath { path: String, reason: &'static str },
    /// A POSIX call failed.
    #[error("{op} failed for `{path}`: {source}")]
    Posix {
        op: &'static str,
        path: String,
        #[source]
        source: io::Errno,
    },
    /// The existing object is not the size of `T`.
    #[error("shared memory `{path}` size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        path: String,
        expected: usize,
        actual: i64,
    },
    /// The creator never finished initializing the segment.
    #[error("shared memory `{path}` was not initialized in time")]
    InitTimeout { path: String },
}

impl ShmError {
    fn posix(op: &'static str, path: &ShmPath, source: io::Errno) -> Self {
        Self::Posix {
            op,
            path: path.to_string(),
            source,
        }
    }

    /// True when the object does not exist (`ENOENT`).
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Posix { source, .. } if *source == io::Errno::NOENT)
    }

    /// True when the object already exists (`EEXIST`).
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::Posix { source, .. } if *source == io::Errno::EXIST)
    }

    /// True when the sandbox refuses shared memory (`EACCES`).
    pub fn is_access_denied(&self) -> bool {
        matches!(self, Self::Posix { source, .. } if *source == io::Errno::ACCESS)
    }
}

const POSIX_NAME_MAX: usize = 255;

/// A validated shared memory object name.
///
/// Must start with `/`, contain no other `/` and be at most 255 bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShmPath(String);

impl ShmPath {
    /// Validates `path`.
    ///
    /// # Errors
    ///
    /// [`ShmError::InvalidPath`] describing the first rule broken.
    pub fn new(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        let reason = if !path.starts_with('/') {
            Some("path must start with '/'")
        } else if path[1..].contains('/') {
            Some("path must not contain additional '/' characters")
        } else if path.len() > POSIX_NAME_MAX {
            Some("path length must be <= 255 bytes")
        } else {
            None
        };
        match reason {
            Some(reason) => Err(ShmError::InvalidPath { path, reason }),
            None => Ok(Self(path)),
        }
    }

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

/// Removes a shared memory name, ignoring a missing one.
///
/// # Errors
///
/// Any failure other than `ENOENT`.
pub fn unlink(path: &ShmPath) -> Result<()> {
    match shm::unlink(path.as_str()) {
        Ok(()) => Ok(()),
        Err(err) if err == io::Errno::NOENT => Ok(()),
        Err(err) => Err(ShmError::posix("shm_unlink", path, err)),
    }
}

/// Cleanup behavior of a mapping.
pub trait ShmMode {
    /// Whether dropping the mapping removes the name.
    const SHOULD_UNLINK: bool;
}

/// Marker for the process that created a segment; drop unmaps and unlinks.
pub struct Creator;
impl ShmMode for Creator {
    const SHOULD_UNLINK: bool = true;
}

/// Marker for processes attaching to an existing segment; drop only unmaps.
pub struct Opener;
impl ShmMode for Opener {
    const SHOULD_UNLINK: bool = false;
}

/// Types that may live in memory shared between processes.
///
/// # Safety
///
/// Implementers guarantee that:
/// - the layout is `#[repr(C)]` or `#[repr(transparent)]`;
/// - the type holds no pointers or references;
/// - **the all-zero bit pattern is a valid value**, since freshly created
///   segments are zero-filled by the kernel and never run a constructor;
/// - every field that more than one process writes is an atomic;
/// - skipping `Drop` is harmless (a crashed peer never runs it).
pub unsafe trait SharedMemorySafe: Send + Sync {}

macro_rules! impl_shared_memory_safe {
    ($($t:ty),* $(,)?) => {
        $(
            unsafe impl SharedMemorySafe for $t {}
        )*
    };
}

impl_shared_memory_safe! {
    u8, u16, u32, u64, i32, i64,
    AtomicU8, AtomicU16, AtomicU32, AtomicU64, AtomicI32, AtomicI64,
}

unsafe impl<T: SharedMemorySafe, const N: usize> SharedMemorySafe for [T; N] {}

/// A `T` mapped from a named POSIX shared memory object.
///
/// Access is through [`Deref`]; all mutation goes through the atomics inside
/// `T`.
pub struct Shm<T: SharedMemorySafe, Mode: ShmMode> {
    ptr: NonNull<T>,
    path: ShmPath,
    _mode: PhantomData<Mode>,
}

// SAFETY: the mapping is process-wide memory, not thread-local, and
// T: SharedMemorySafe implies Send + Sync.
unsafe impl<T: SharedMemorySafe, Mode: ShmMode> Send for Shm<T, Mode> {}

// SAFETY: shared references only expose T, which is Sync.
unsafe impl<T: SharedMemorySafe, Mode: ShmMode> Sync for Shm<T, Mode> {}

impl<T: SharedMemorySafe> Shm<T, Creator> {
    /// Creates a new object sized for `T` and maps it zero-filled.
    ///
    /// # Errors
    ///
    /// `EEXIST` if the name is taken, or any `shm_open`/`ftruncate`/`mmap`
    /// failure. Partially created objects are unlinked before returning.
    pub fn create(path: &ShmPath) -> Result<Self> {
        let fd = shm::open(
            path.as_str(),
            shm::OFlags::CREATE | shm::OFlags::EXCL | shm::OFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        )
        .map_err(|err| ShmError::posix("shm_open", path, err))?;

        if let Err(err) = ftruncate(&fd, size_of::<T>() as u64) {
            drop(fd);
            let _ = shm::unlink(path.as_str());
            return Err(ShmError::posix("ftruncate", path, err));
        }

        // SAFETY: a fresh shared mapping of exactly size_of::<T>() bytes of a
        // descriptor we just sized. mmap returns page-aligned memory, which
        // satisfies T's alignment, and the kernel zero-fills it, which is a
        // valid T per the SharedMemorySafe contract.
        let mapped = unsafe {
            mmap(
                null_mut(),
                size_of::<T>(),
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
        };
        let ptr = match mapped {
            Ok(ptr) => ptr,
            Err(err) => {
                drop(fd);
                let _ = shm::unlink(path.as_str());
                return Err(ShmError::posix("mmap", path, err));
            }
        };

        Ok(Self {
            // SAFETY: mmap does not return null on success.
            ptr: unsafe { NonNull::new_unchecked(ptr.cast::<T>()) },
            path: path.clone(),
            _mode: PhantomData,
        })
    }
}

impl<T: SharedMemorySafe> Shm<T, Opener> {
    /// Maps an object created by another process.
    ///
    /// # Errors
    ///
    /// `ENOENT` if nothing is there, [`ShmError::SizeMismatch`] when the
    /// object was created for a different type, or any POSIX failure.
    pub fn open(path: &ShmPath) -> Result<Self> {
        let fd = shm::open(path.as_str(), shm::OFlags::RDWR, Mode::empty())
            .map_err(|err| ShmError::posix("shm_open", path, err))?;

        let stat = fstat(&fd).map_err(|err| ShmError::posix("fstat", path, err))?;
        if stat.st_size != size_of::<T>() as i64 {
            return Err(ShmError::SizeMismatch {
                path: path.to_string(),
                expected: size_of::<T>(),
                actual: stat.st_size,
            });
        }

        // SAFETY: the object exists and fstat confirmed it holds exactly one
        // T. The creator's zero fill makes it a valid T even before the
        // creator writes anything.
        let ptr = unsafe {
            mmap(
                null_mut(),
                size_of::<T>(),
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
        }
        .map_err(|err| ShmError::posix("mmap", path, err))?;

        Ok(Self {
            // SAFETY: mmap does not return null on success.
            ptr: unsafe { NonNull::new_unchecked(ptr.cast::<T>()) },
            path: path.clone(),
            _mode: PhantomData,
        })
    }
}

impl<T: SharedMemorySafe, Mode: ShmMode> Shm<T, Mode> {
    /// Name of the underlying object.
    pub fn path(&self) -> &ShmPath {
        &self.path
    }
}

impl<T: SharedMemorySafe, Mode: ShmMode> Drop for Shm<T, Mode> {
    fn drop(&mut self) {
        // SAFETY: ptr/size describe the mapping made in the constructor and
        // no reference derived from it outlives self.
        unsafe {
            let _ = munmap(self.ptr.as_ptr().cast(), size_of::<T>());
        }

        if Mode::SHOULD_UNLINK {
            let _ = shm::unlink(self.path.as_str());
        }
    }
}

impl<T: SharedMemorySafe, Mode: ShmMode> Deref for Shm<T, Mode> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the mapping lives as long as self and holds a valid T.
        unsafe { self.ptr.as_ref() }
    }
}

/// Storage for a shared value: owned segment, attached segment, or plain
/// process memory.
pub enum Segment<T: SharedMemorySafe> {
    /// This process created the named object.
    Created(Shm<T, Creator>),
    /// This process attached to another process's object.
    Opened(Shm<T, Opener>),
    /// Heap memory, for a bridge embedded in one process and for tests.
    Private(Box<T>),
}

impl<T: SharedMemorySafe> Segment<T> {
    /// Creates the named object.
    ///
    /// # Errors
    ///
    /// See [`Shm::create`].
    pub fn create(path: &ShmPath) -> Result<Self> {
        Shm::create(path).map(Self::Created)
    }

    /// Attaches to the named object.
    ///
    /// # Errors
    ///
    /// See [`Shm::open`].
    pub fn open(path: &ShmPath) -> Result<Self> {
        Shm::open(path).map(Self::Opened)
    }

    /// Zero-initialized heap storage.
    pub fn private() -> Self {
        let zeroed = Box::<T>::new_zeroed();
        // SAFETY: all-zero is a valid T per the SharedMemorySafe contract.
        Self::Private(unsafe { zeroed.assume_init() })
    }

    /// True when this handle owns the name.
    pub fn is_owner(&self) -> bool {
        !matches!(self, Self::Opened(_))
    }
}

impl<T: SharedMemorySafe> Deref for Segment<T> {
    type Target = T;

    fn deref(&self) -> &T {
        match self {
            Self::Created(shm) => shm,
            Self::Opened(shm) => shm,
            Self::Private(boxed) => boxed,
        }
    }
}
