// SPDX-License-Identifier: GPL-3.0-only

//! System V shared-memory segment and semaphore handles
//!
//! Thin wrappers over `shmget`/`shmat`/`shmdt`/`shmctl` and `semget`/`semop`/`semctl`.
//! Nothing here knows about the ring layout.

use crate::constants::ring::{KEY_BASE, KEY_SEARCH_WINDOW, SEGMENT_MODE};
use crate::errors::{ServiceError, ServiceResult};
use std::io;
use std::ptr::{self, NonNull};
use tracing::{debug, warn};

/// An attached System V shared-memory segment.
#[derive(Debug)]
pub(crate) struct ShmSegment {
    key: i32,
    id: i32,
    addr: NonNull<u8>,
    size: usize,
    attached: bool,
}

// SAFETY: the mapping is process-wide; the handle only carries its address.
unsafe impl Send for ShmSegment {}

impl ShmSegment {
    /// Create a fresh segment of `size` bytes under the first free key.
    ///
    /// Keys are tried in order from `KEY_BASE` with `IPC_EXCL`, so two producers never
    /// share a key.
    pub(crate) fn create_exclusive(size: usize) -> ServiceResult<Self> {
        for key in KEY_BASE..KEY_BASE + KEY_SEARCH_WINDOW {
            // SAFETY: plain syscall; no pointers passed.
            let id = unsafe {
                libc::shmget(key, size, libc::IPC_CREAT | libc::IPC_EXCL | SEGMENT_MODE)
            };
            if id >= 0 {
                debug!(key = format_args!("{key:#x}"), id, size, "Created shared-memory segment");
                return match Self::attach_id(key, id) {
                    Ok(segment) => Ok(segment),
                    Err(e) => {
                        remove_id(id);
                        Err(e)
                    }
                };
            }

            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EEXIST) {
                continue;
            }
            return Err(ServiceError::ResourceExhausted(format!(
                "shmget({} bytes): {}",
                size, err
            )));
        }

        Err(ServiceError::ResourceExhausted(format!(
            "no free channel key in {:#x}..{:#x}",
            KEY_BASE,
            KEY_BASE + KEY_SEARCH_WINDOW
        )))
    }

    /// Attach to an existing segment by key.
    pub(crate) fn attach(key: i32) -> ServiceResult<Self> {
        // SAFETY: plain syscall.
        let id = unsafe { libc::shmget(key, 0, 0) };
        if id < 0 {
            let err = io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::ENOENT) => {
                    ServiceError::InvalidParameter(format!("no ring channel with key {key:#x}"))
                }
                _ => ServiceError::IoFailure(format!("shmget({key:#x}): {err}")),
            });
        }
        Self::attach_id(key, id)
    }

    fn attach_id(key: i32, id: i32) -> ServiceResult<Self> {
        // SAFETY: a null address lets the kernel choose the mapping.
        let raw = unsafe { libc::shmat(id, ptr::null(), 0) };
        if raw as isize == -1 {
            return Err(ServiceError::last_os_error("shmat"));
        }
        let Some(addr) = NonNull::new(raw as *mut u8) else {
            return Err(ServiceError::IoFailure("shmat returned null".to_string()));
        };

        let mut segment = Self {
            key,
            id,
            addr,
            size: 0,
            attached: true,
        };
        segment.size = segment.stat()?.shm_segsz;
        Ok(segment)
    }

    pub(crate) fn key(&self) -> i32 {
        self.key
    }

    pub(crate) fn addr(&self) -> NonNull<u8> {
        self.addr
    }

    /// Size of the segment as recorded by the kernel.
    pub(crate) fn size(&self) -> usize {
        self.size
    }

    fn stat(&self) -> ServiceResult<libc::shmid_ds> {
        // SAFETY: shmid_ds is plain data; IPC_STAT fills it.
        let mut ds: libc::shmid_ds = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::shmctl(self.id, libc::IPC_STAT, &mut ds) };
        if rc < 0 {
            return Err(ServiceError::last_os_error("shmctl(IPC_STAT)"));
        }
        Ok(ds)
    }

    /// Number of processes currently attached.
    pub(crate) fn attach_count(&self) -> ServiceResult<u64> {
        Ok(self.stat()?.shm_nattch as u64)
    }

    /// Detach this process's mapping. The id stays valid for `stat`/`remove`.
    pub(crate) fn detach(&mut self) -> ServiceResult<()> {
        if !self.attached {
            return Ok(());
        }
        // SAFETY: `addr` came from shmat and no view outlives this call.
        let rc = unsafe { libc::shmdt(self.addr.as_ptr() as *const libc::c_void) };
        if rc < 0 {
            return Err(ServiceError::last_os_error("shmdt"));
        }
        self.attached = false;
        Ok(())
    }

    /// Mark the segment for removal.
    pub(crate) fn remove(&self) {
        remove_id(self.id);
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        if let Err(e) = self.detach() {
            warn!(key = self.key, error = %e, "Failed to detach segment");
        }
    }
}

fn remove_id(id: i32) {
    // SAFETY: IPC_RMID ignores the buffer argument.
    let rc = unsafe { libc::shmctl(id, libc::IPC_RMID, ptr::null_mut()) };
    if rc < 0 {
        warn!(id, error = %io::Error::last_os_error(), "shmctl(IPC_RMID) failed");
    }
}

/// Optional System V semaphore stored alongside a channel under the same key.
///
/// The ring protocol never takes it; it exists for producers and readers
/// that want exclusive access for bulk operations.
#[derive(Debug)]
pub(crate) struct RingSemaphore {
    id: i32,
}

impl RingSemaphore {
    /// Create (or reuse a stale) semaphore for `key`, initialised to 1.
    pub(crate) fn create(key: i32) -> ServiceResult<Self> {
        // SAFETY: plain syscalls.
        let id = unsafe { libc::semget(key, 1, libc::IPC_CREAT | SEGMENT_MODE) };
        if id < 0 {
            return Err(ServiceError::last_os_error("semget"));
        }
        let rc = unsafe { libc::semctl(id, 0, libc::SETVAL, 1 as libc::c_int) };
        if rc < 0 {
            return Err(ServiceError::last_os_error("semctl(SETVAL)"));
        }
        Ok(Self { id })
    }

    /// Open the semaphore for `key` if the producer created one.
    pub(crate) fn open(key: i32) -> Option<Self> {
        // SAFETY: plain syscall.
        let id = unsafe { libc::semget(key, 1, 0) };
        (id >= 0).then_some(Self { id })
    }

    fn op(&self, delta: i16) -> ServiceResult<()> {
        let mut op = libc::sembuf {
            sem_num: 0,
            sem_op: delta,
            sem_flg: libc::SEM_UNDO as libc::c_short,
        };
        loop {
            // SAFETY: one valid sembuf.
            let rc = unsafe { libc::semop(self.id, &mut op, 1) };
            if rc == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(ServiceError::IoFailure(format!("semop: {err}")));
            }
        }
    }

    pub(crate) fn lock(&self) -> ServiceResult<()> {
        self.op(-1)
    }

    pub(crate) fn unlock(&self) -> ServiceResult<()> {
        self.op(1)
    }

    pub(crate) fn remove(&self) {
        // SAFETY: IPC_RMID takes no extra argument.
        let rc = unsafe { libc::semctl(self.id, 0, libc::IPC_RMID) };
        if rc < 0 {
            warn!(id = self.id, error = %io::Error::last_os_error(), "semctl(IPC_RMID) failed");
        }
    }
}
