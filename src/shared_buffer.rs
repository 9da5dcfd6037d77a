//! `SharedBuffer` — the fixed-size ring of per-node float32 arrays backed by
//! named POSIX shared memory (spec.md §3, §4.4).
//!
//! All `unsafe` is confined to this module: callers interact only with the
//! safe `claim_slot`/`write_results`/`take_slot`/`teardown` surface. The
//! slot-claim protocol itself (scan flags under `lock`, set first free slot,
//! release, caller writes, backoff on exhaustion) matches spec.md §4.4
//! exactly, using a CAS spinlock embedded in the mapped region in place of a
//! named OS mutex — this is the same technique the pack's
//! `filecoin-project-rust-proofs` porep code uses for its lock-free
//! producer/consumer ring (`create_label/multi.rs`, `AtomicU64` cursors
//! polled with backoff), adapted here to a real shared-memory segment since
//! spec.md's `SharedBuffer` is explicitly named shared memory rather than
//! in-process state.

use std::collections::HashMap;
use std::ffi::CString;
use std::sync::atomic::{AtomicI32, Ordering};

use crate::dataset::Dataset;
use crate::error::{ExecutionError, Result};

const LOCK_BYTES: usize = 4;

#[derive(Clone, Debug)]
struct NodeLayout {
    node_id: usize,
    elems: usize,
    shape: Vec<usize>,
    byte_offset: usize,
}

/// A named shared-memory ring of per-node `f32` frames plus an `in_use`
/// flag per slot (spec.md §3, "SharedBuffer").
pub struct SharedBuffer {
    name: CString,
    ptr: *mut u8,
    len: usize,
    capacity: usize,
    layout: Vec<NodeLayout>,
    owns: bool,
}

// SAFETY: `ptr` points at a shared-memory mapping; all access to it goes
// through the flag-guarded slot protocol below, which is sound to share
// across threads (and, were workers separate processes, across processes).
unsafe impl Send for SharedBuffer {}
unsafe impl Sync for SharedBuffer {}

impl SharedBuffer {
    /// Creates (and owns) a new named shared-memory segment sized for
    /// `capacity` slots of `node_shapes`' trailing shapes. Only the
    /// orchestrator ever calls this; it is also the only party that may
    /// later call `teardown` (spec.md §4.4, "only orchestrator unlinks").
    pub fn create(name: &str, capacity: usize, node_shapes: &HashMap<usize, Vec<usize>>) -> Result<Self> {
        let mut sorted_ids: Vec<usize> = node_shapes.keys().copied().collect();
        sorted_ids.sort_unstable();

        let mut layout = Vec::with_capacity(sorted_ids.len());
        let mut offset = LOCK_BYTES + capacity * 4;
        for node_id in sorted_ids {
            let shape = node_shapes[&node_id].clone();
            let elems: usize = shape.iter().product::<usize>().max(1);
            layout.push(NodeLayout {
                node_id,
                elems,
                shape,
                byte_offset: offset,
            });
            offset += capacity * elems * 4;
        }
        let total_len = offset;

        let name_c = CString::new(name)
            .map_err(|e| ExecutionError::internal(format!("invalid shared buffer name: {e}")))?;

        // SAFETY: standard POSIX shared-memory creation sequence; every
        // return value is checked before use.
        let ptr = unsafe {
            let fd = libc::shm_open(name_c.as_ptr(), libc::O_CREAT | libc::O_RDWR | libc::O_EXCL, 0o600);
            if fd < 0 {
                return Err(ExecutionError::internal(format!(
                    "shm_open({name}) failed: {}",
                    std::io::Error::last_os_error()
                )));
            }
            if libc::ftruncate(fd, total_len as libc::off_t) != 0 {
                let err = std::io::Error::last_os_error();
                libc::close(fd);
                libc::shm_unlink(name_c.as_ptr());
                return Err(ExecutionError::internal(format!("ftruncate({name}) failed: {err}")));
            }
            let mapped = libc::mmap(
                std::ptr::null_mut(),
                total_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            );
            libc::close(fd);
            if mapped == libc::MAP_FAILED {
                let err = std::io::Error::last_os_error();
                libc::shm_unlink(name_c.as_ptr());
                return Err(ExecutionError::internal(format!("mmap({name}) failed: {err}")));
            }
            std::ptr::write_bytes(mapped as *mut u8, 0, total_len);
            mapped as *mut u8
        };

        Ok(SharedBuffer {
            name: name_c,
            ptr,
            len: total_len,
            capacity,
            layout,
            owns: true,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn node_shape(&self, node_id: usize) -> Option<&[usize]> {
        self.layout.iter().find(|l| l.node_id == node_id).map(|l| l.shape.as_slice())
    }

    fn lock(&self) -> &AtomicI32 {
        // SAFETY: offset 0 is reserved for the lock word for the lifetime
        // of the mapping.
        unsafe { &*(self.ptr as *const AtomicI32) }
    }

    fn flag(&self, slot: usize) -> &AtomicI32 {
        debug_assert!(slot < self.capacity);
        // SAFETY: bytes `[LOCK_BYTES, LOCK_BYTES + capacity*4)` are reserved
        // for the `in_use_flags` array.
        unsafe { &*(self.ptr.add(LOCK_BYTES + slot * 4) as *const AtomicI32) }
    }

    fn node_slice(&self, node_id: usize, slot: usize) -> Result<&mut [f32]> {
        let entry = self
            .layout
            .iter()
            .find(|l| l.node_id == node_id)
            .ok_or_else(|| ExecutionError::internal(format!("shared buffer has no slot layout for node {node_id}")))?;
        let start = entry.byte_offset + slot * entry.elems * 4;
        // SAFETY: `start..start + elems*4` lies within the mapped region by
        // construction of `layout` in `create`, and is exclusively owned by
        // whichever party currently holds `in_use_flags[slot] == 1`.
        unsafe {
            let base = self.ptr.add(start) as *mut f32;
            Ok(std::slice::from_raw_parts_mut(base, entry.elems))
        }
    }

    fn with_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        while self
            .lock()
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        let result = f();
        self.lock().store(0, Ordering::Release);
        result
    }

    /// Scans `in_use_flags` for the first free slot under `lock`, claims it,
    /// and returns its index; `None` if the ring is full (caller should
    /// back off ~5ms and retry, spec.md §4.4).
    pub fn try_claim_slot(&self) -> Option<usize> {
        self.with_lock(|| {
            for slot in 0..self.capacity {
                if self.flag(slot).load(Ordering::Relaxed) == 0 {
                    self.flag(slot).store(1, Ordering::Relaxed);
                    return Some(slot);
                }
            }
            None
        })
    }

    /// Writes each tracked node's frame into `slot`. Caller must hold the
    /// claim from `try_claim_slot`.
    pub fn write_results(&self, slot: usize, results: &HashMap<usize, Dataset>) -> Result<()> {
        for entry in &self.layout {
            let Some(dataset) = results.get(&entry.node_id) else {
                continue;
            };
            if dataset.len() != entry.elems {
                return Err(ExecutionError::ShapeInconsistency {
                    node_id: entry.node_id,
                    message: format!(
                        "frame has {} elements but shared buffer slot reserves {}",
                        dataset.len(),
                        entry.elems
                    ),
                });
            }
            let dst = self.node_slice(entry.node_id, slot)?;
            dst.copy_from_slice(dataset.data());
        }
        Ok(())
    }

    /// Copies every tracked node's frame out of `slot` into fresh
    /// `Dataset`s, then releases the slot under `lock` (spec.md §4.4,
    /// "orchestrator slot release").
    pub fn take_slot(&self, slot: usize) -> Result<HashMap<usize, Dataset>> {
        let mut out = HashMap::with_capacity(self.layout.len());
        for entry in &self.layout {
            let src = self.node_slice(entry.node_id, slot)?;
            let dataset = Dataset::from_data(&entry.shape, src.to_vec()).map_err(ExecutionError::internal)?;
            out.insert(entry.node_id, dataset);
        }
        self.with_lock(|| {
            self.flag(slot).store(0, Ordering::Relaxed);
        });
        Ok(out)
    }

    /// Unmaps and unlinks the shared-memory segment. Only the orchestrator
    /// (the owning side) may call this; idempotent.
    pub fn teardown(&mut self) {
        if self.ptr.is_null() {
            return;
        }
        // SAFETY: `ptr`/`len` describe the mapping created in `create`.
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
        self.ptr = std::ptr::null_mut();
        if self.owns {
            // SAFETY: `name` is the same name passed to `shm_open` in `create`.
            unsafe {
                libc::shm_unlink(self.name.as_ptr());
            }
        }
    }
}

impl Drop for SharedBuffer {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        format!("/scanflow-test-{tag}-{}-{}", std::process::id(), rand::random::<u32>())
    }

    fn shapes() -> HashMap<usize, Vec<usize>> {
        let mut m = HashMap::new();
        m.insert(0, vec![2, 2]);
        m.insert(1, vec![3]);
        m
    }

    #[test]
    fn claim_and_release_respects_capacity() {
        let buf = SharedBuffer::create(&unique_name("claim"), 2, &shapes()).unwrap();
        let a = buf.try_claim_slot().unwrap();
        let b = buf.try_claim_slot().unwrap();
        assert_ne!(a, b);
        assert!(buf.try_claim_slot().is_none(), "ring should be exhausted at capacity 2");

        buf.take_slot(a).unwrap();
        assert!(buf.try_claim_slot().is_some(), "slot becomes claimable again after release");
    }

    #[test]
    fn write_then_take_round_trips_frame_data() {
        let buf = SharedBuffer::create(&unique_name("roundtrip"), 1, &shapes()).unwrap();
        let slot = buf.try_claim_slot().unwrap();

        let mut results = HashMap::new();
        results.insert(0, Dataset::filled(&[2, 2], 1.5));
        results.insert(1, Dataset::filled(&[3], 2.5));
        buf.write_results(slot, &results).unwrap();

        let taken = buf.take_slot(slot).unwrap();
        assert!(taken[&0].data().iter().all(|&v| v == 1.5));
        assert!(taken[&1].data().iter().all(|&v| v == 2.5));
    }

    #[test]
    fn write_results_rejects_wrong_element_count() {
        let buf = SharedBuffer::create(&unique_name("shape-mismatch"), 1, &shapes()).unwrap();
        let slot = buf.try_claim_slot().unwrap();
        let mut results = HashMap::new();
        results.insert(0, Dataset::filled(&[3, 3], 0.0));
        let err = buf.write_results(slot, &results).unwrap_err();
        assert!(matches!(err, ExecutionError::ShapeInconsistency { .. }));
    }
}
