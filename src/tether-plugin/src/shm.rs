//! Named POSIX shared memory segments and the host-side segment bookkeeping.
//!
//! A [`SharedMemoryRegion`] is either the creator of a segment (which owns
//! the OS name and unlinks it on destroy) or an attacher (which only maps and
//! unmaps). [`SegmentTable`] tracks the regions a host created and refuses to
//! destroy any of them before the child has acknowledged removal.

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::libc::{c_void, off_t};
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;
use std::collections::BTreeMap;
use std::fs::File;
use std::num::NonZeroUsize;
use std::os::fd::OwnedFd;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{debug, warn};

static NEXT_REGION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Error)]
pub enum ShmError {
    #[error("shared memory size must be non-zero")]
    ZeroSize,
    #[error("failed to create shared memory {name}: {source}")]
    Create { name: String, source: Errno },
    #[error("failed to open shared memory {name}: {source}")]
    Open { name: String, source: Errno },
    #[error("failed to map shared memory {name}: {source}")]
    Map { name: String, source: Errno },
    #[error("failed to inspect shared memory {name}: {source}")]
    Inspect {
        name: String,
        source: std::io::Error,
    },
    #[error("shared memory {name} holds {actual} bytes, {expected} requested")]
    TooSmall {
        name: String,
        actual: u64,
        expected: usize,
    },
    #[error("failed to release shared memory {name}: {source}")]
    Release { name: String, source: Errno },
    #[error("unknown shared memory segment {name}")]
    Unknown { name: String },
    #[error("shared memory segment {name} is already being removed")]
    AlreadyRemoving { name: String },
    #[error("no plugin connection to share memory with")]
    NotConnected,
    #[error("shared memory {name} is not mapped")]
    NotMapped { name: String },
    #[error("{len} bytes at offset {offset} do not fit in {name} ({size} bytes)")]
    OutOfBounds {
        name: String,
        offset: usize,
        len: usize,
        size: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionRole {
    /// Created the segment and owns its OS name.
    Creator,
    /// Mapped a segment created by the peer.
    Attacher,
}

/// Picks a name no other region of this process has used.
pub fn next_region_name() -> String {
    let id = NEXT_REGION_ID.fetch_add(1, Ordering::Relaxed);
    format!("/tether.{}.{}", std::process::id(), id)
}

#[derive(Debug)]
pub struct SharedMemoryRegion {
    name: String,
    size: usize,
    role: RegionRole,
    mapping: Option<NonNull<c_void>>,
    linked: bool,
}

// The mapping is plain shared bytes; access goes through bounds-checked copies.
unsafe impl Send for SharedMemoryRegion {}

impl SharedMemoryRegion {
    /// Creates and maps a fresh segment under a process-unique name.
    pub fn create(size: usize) -> Result<Self, ShmError> {
        Self::create_named(&next_region_name(), size)
    }

    pub fn create_named(name: &str, size: usize) -> Result<Self, ShmError> {
        if size == 0 {
            return Err(ShmError::ZeroSize);
        }
        let fd = shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|source| ShmError::Create {
            name: name.to_string(),
            source,
        })?;

        let mapped = off_t::try_from(size)
            .map_err(|_| Errno::EOVERFLOW)
            .and_then(|len| ftruncate(&fd, len))
            .and_then(|()| map(&fd, size));
        match mapped {
            Ok(mapping) => {
                debug!(name, size, "created shared memory");
                Ok(Self {
                    name: name.to_string(),
                    size,
                    role: RegionRole::Creator,
                    mapping: Some(mapping),
                    linked: true,
                })
            }
            Err(source) => {
                let _ = shm_unlink(name);
                Err(ShmError::Create {
                    name: name.to_string(),
                    source,
                })
            }
        }
    }

    /// Maps an existing segment created by the peer.
    pub fn attach(name: &str, size: usize) -> Result<Self, ShmError> {
        if size == 0 {
            return Err(ShmError::ZeroSize);
        }
        let fd = shm_open(name, OFlag::O_RDWR, Mode::empty()).map_err(|source| {
            ShmError::Open {
                name: name.to_string(),
                source,
            }
        })?;
        let file = File::from(fd);
        let actual = file
            .metadata()
            .map_err(|source| ShmError::Inspect {
                name: name.to_string(),
                source,
            })?
            .len();
        if actual < size as u64 {
            return Err(ShmError::TooSmall {
                name: name.to_string(),
                actual,
                expected: size,
            });
        }
        let mapping = map(&OwnedFd::from(file), size).map_err(|source| ShmError::Map {
            name: name.to_string(),
            source,
        })?;
        debug!(name, size, "attached shared memory");
        Ok(Self {
            name: name.to_string(),
            size,
            role: RegionRole::Attacher,
            mapping: Some(mapping),
            linked: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn role(&self) -> RegionRole {
        self.role
    }

    pub fn is_mapped(&self) -> bool {
        self.mapping.is_some()
    }

    /// Base address in this process, or 0 once unmapped.
    pub fn address(&self) -> usize {
        self.mapping.map_or(0, |ptr| ptr.as_ptr() as usize)
    }

    pub fn write_at(&mut self, offset: usize, bytes: &[u8]) -> Result<(), ShmError> {
        let base = self.checked_base(offset, bytes.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), base.add(offset), bytes.len());
        }
        Ok(())
    }

    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<(), ShmError> {
        let base = self.checked_base(offset, buf.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(base.add(offset), buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    fn checked_base(&self, offset: usize, len: usize) -> Result<*mut u8, ShmError> {
        let mapping = self.mapping.ok_or_else(|| ShmError::NotMapped {
            name: self.name.clone(),
        })?;
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(mapping.as_ptr().cast::<u8>()),
            _ => Err(ShmError::OutOfBounds {
                name: self.name.clone(),
                offset,
                len,
                size: self.size,
            }),
        }
    }

    /// Unmaps the segment from this process. Idempotent.
    pub fn detach(&mut self) -> Result<(), ShmError> {
        if let Some(mapping) = self.mapping.take() {
            unsafe { munmap(mapping, self.size) }.map_err(|source| ShmError::Release {
                name: self.name.clone(),
                source,
            })?;
            debug!(name = %self.name, "unmapped shared memory");
        }
        Ok(())
    }

    /// Unmaps and, for the creator, removes the OS name. Idempotent.
    pub fn destroy(&mut self) -> Result<(), ShmError> {
        self.detach()?;
        if self.linked {
            self.linked = false;
            shm_unlink(self.name.as_str()).map_err(|source| ShmError::Release {
                name: self.name.clone(),
                source,
            })?;
            debug!(name = %self.name, "destroyed shared memory");
        }
        Ok(())
    }
}

impl Drop for SharedMemoryRegion {
    fn drop(&mut self) {
        let result = match self.role {
            RegionRole::Creator => self.destroy(),
            RegionRole::Attacher => self.detach(),
        };
        if let Err(err) = result {
            warn!(error = %err, "releasing shared memory on drop failed");
        }
    }
}

fn map(fd: &OwnedFd, size: usize) -> Result<NonNull<c_void>, Errno> {
    let length = NonZeroUsize::new(size).ok_or(Errno::EINVAL)?;
    unsafe {
        mmap(
            None,
            length,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            fd,
            0,
        )
    }
}

/// Where a host-created segment is in the add/remove negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentPhase {
    /// `shm_add` sent, no acknowledgment yet.
    Adding,
    Attached,
    /// `shm_remove` sent; destruction waits for the child's acknowledgment.
    Removing,
}

#[derive(Debug)]
struct Segment {
    region: SharedMemoryRegion,
    phase: SegmentPhase,
}

/// Segments a host created for one connection.
#[derive(Debug, Default)]
pub struct SegmentTable {
    segments: BTreeMap<String, Segment>,
}

impl SegmentTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes ownership of a freshly created region; returns its name.
    pub fn insert(&mut self, region: SharedMemoryRegion) -> String {
        let name = region.name().to_string();
        self.segments.insert(
            name.clone(),
            Segment {
                region,
                phase: SegmentPhase::Adding,
            },
        );
        name
    }

    pub fn add_acknowledged(&mut self, name: &str) -> bool {
        match self.segments.get_mut(name) {
            Some(segment) if segment.phase == SegmentPhase::Adding => {
                segment.phase = SegmentPhase::Attached;
                true
            }
            Some(_) => true,
            None => false,
        }
    }

    /// The child could not attach; nothing maps the segment but us.
    pub fn add_failed(&mut self, name: &str) -> bool {
        match self.segments.remove(name) {
            Some(mut segment) => {
                release(&mut segment.region);
                true
            }
            None => false,
        }
    }

    /// Moves a segment into `Removing`. Returns an error for unknown names or
    /// repeated requests.
    pub fn begin_remove(&mut self, name: &str) -> Result<(), ShmError> {
        let segment = self.segments.get_mut(name).ok_or_else(|| ShmError::Unknown {
            name: name.to_string(),
        })?;
        if segment.phase == SegmentPhase::Removing {
            return Err(ShmError::AlreadyRemoving {
                name: name.to_string(),
            });
        }
        segment.phase = SegmentPhase::Removing;
        Ok(())
    }

    /// Destroys a segment whose removal the child acknowledged.
    ///
    /// Acknowledgments for segments not in `Removing` are ignored and leave
    /// the segment alive.
    pub fn complete_remove(&mut self, name: &str) -> bool {
        match self.segments.get(name).map(|segment| segment.phase) {
            Some(SegmentPhase::Removing) => {
                if let Some(mut segment) = self.segments.remove(name) {
                    release(&mut segment.region);
                }
                true
            }
            Some(phase) => {
                warn!(name, ?phase, "removal acknowledged for segment not being removed");
                false
            }
            None => {
                warn!(name, "removal acknowledged for unknown segment");
                false
            }
        }
    }

    pub fn phase(&self, name: &str) -> Option<SegmentPhase> {
        self.segments.get(name).map(|segment| segment.phase)
    }

    pub fn size(&self, name: &str) -> Option<usize> {
        self.segments.get(name).map(|segment| segment.region.size())
    }

    pub fn address(&self, name: &str) -> Option<usize> {
        self.segments.get(name).map(|segment| segment.region.address())
    }

    pub fn region_mut(&mut self, name: &str) -> Option<&mut SharedMemoryRegion> {
        self.segments.get_mut(name).map(|segment| &mut segment.region)
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Releases every segment. Only valid once the peer can no longer touch them.
    pub fn destroy_all(&mut self) {
        for (_, mut segment) in std::mem::take(&mut self.segments) {
            release(&mut segment.region);
        }
    }
}

fn release(region: &mut SharedMemoryRegion) {
    if let Err(err) = region.destroy() {
        warn!(error = %err, "failed to destroy shared memory");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_names_are_unique() {
        let a = next_region_name();
        let b = next_region_name();
        assert_ne!(a, b);
        assert!(a.starts_with(&format!("/tether.{}.", std::process::id())));
    }

    #[test]
    fn zero_sized_region_is_rejected() {
        assert!(matches!(
            SharedMemoryRegion::create(0),
            Err(ShmError::ZeroSize)
        ));
    }

    #[test]
    fn creator_and_attacher_share_bytes_until_removed() {
        let name = format!("/seg1.{}", std::process::id());
        let mut creator = SharedMemoryRegion::create_named(&name, 4096).unwrap();
        let mut attacher = SharedMemoryRegion::attach(&name, 4096).unwrap();
        assert_eq!(creator.role(), RegionRole::Creator);
        assert_eq!(attacher.role(), RegionRole::Attacher);

        creator.write_at(100, b"frame").unwrap();
        let mut buf = [0u8; 5];
        attacher.read_at(100, &mut buf).unwrap();
        assert_eq!(&buf, b"frame");

        attacher.detach().unwrap();
        assert!(!attacher.is_mapped());
        assert_eq!(attacher.address(), 0);
        creator.destroy().unwrap();
        assert!(!creator.is_mapped());

        assert!(matches!(
            SharedMemoryRegion::attach(&name, 4096),
            Err(ShmError::Open { .. })
        ));
    }

    #[test]
    fn attach_rejects_oversized_request() {
        let creator = SharedMemoryRegion::create(1024).unwrap();
        assert!(matches!(
            SharedMemoryRegion::attach(creator.name(), 8192),
            Err(ShmError::TooSmall { actual: 1024, .. })
        ));
    }

    #[test]
    fn out_of_bounds_copy_is_rejected() {
        let mut region = SharedMemoryRegion::create(16).unwrap();
        assert!(matches!(
            region.write_at(10, &[0u8; 7]),
            Err(ShmError::OutOfBounds { .. })
        ));
        assert!(region.write_at(10, &[0u8; 6]).is_ok());
    }

    #[test]
    fn destruction_waits_for_removal_acknowledgment() {
        let mut table = SegmentTable::new();
        let name = table.insert(SharedMemoryRegion::create(4096).unwrap());
        assert_eq!(table.phase(&name), Some(SegmentPhase::Adding));

        // A removal ack that overtakes the remove request must not destroy.
        assert!(!table.complete_remove(&name));
        assert_eq!(table.phase(&name), Some(SegmentPhase::Adding));

        assert!(table.add_acknowledged(&name));
        assert!(!table.complete_remove(&name));
        assert_eq!(table.phase(&name), Some(SegmentPhase::Attached));
        assert!(table.address(&name).is_some_and(|address| address != 0));

        table.begin_remove(&name).unwrap();
        assert!(matches!(
            table.begin_remove(&name),
            Err(ShmError::AlreadyRemoving { .. })
        ));
        // Still mapped while the child has not answered.
        assert!(table.address(&name).is_some_and(|address| address != 0));

        assert!(table.complete_remove(&name));
        assert!(table.is_empty());
        assert!(!table.complete_remove(&name));
    }

    #[test]
    fn reordered_acknowledgments_only_release_removed_segments() {
        let mut table = SegmentTable::new();
        let names: Vec<String> = (0..4)
            .map(|_| table.insert(SharedMemoryRegion::create(512).unwrap()))
            .collect();
        for name in &names {
            table.add_acknowledged(name);
        }
        table.begin_remove(&names[1]).unwrap();
        table.begin_remove(&names[3]).unwrap();

        // Acks arrive in an arbitrary order, including for segments never removed.
        for name in [&names[3], &names[0], &names[2], &names[1]] {
            table.complete_remove(name);
        }
        assert_eq!(table.len(), 2);
        assert_eq!(table.phase(&names[0]), Some(SegmentPhase::Attached));
        assert_eq!(table.phase(&names[2]), Some(SegmentPhase::Attached));
        assert_eq!(table.phase(&names[1]), None);
        assert_eq!(table.phase(&names[3]), None);

        table.destroy_all();
        assert!(table.is_empty());
    }

    #[test]
    fn failed_add_releases_the_segment() {
        let mut table = SegmentTable::new();
        let name = table.insert(SharedMemoryRegion::create(64).unwrap());
        assert!(table.add_failed(&name));
        assert!(table.is_empty());
        assert!(SharedMemoryRegion::attach(&name, 64).is_err());
    }

    #[test]
    fn unknown_segment_cannot_be_removed() {
        let mut table = SegmentTable::new();
        assert!(matches!(
            table.begin_remove("/nope"),
            Err(ShmError::Unknown { .. })
        ));
    }
}
