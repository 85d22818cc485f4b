use std::fmt;
use std::sync::{
    Arc, Mutex, MutexGuard,
    atomic::{AtomicU64, Ordering},
};

use anyhow::Result;
use log::trace;
use w2x_utils::gpu::GpuContext;

/// Idle bytes kept per pool before the largest idle buffers are released.
pub const DEFAULT_IDLE_BUDGET: u64 = 512 * 1024 * 1024;

/// What a pooled buffer is used for. Buffers are only reused within a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    /// Plane stacks bound as shader storage.
    Activation,
    /// Host-mappable staging for plane downloads.
    Readback,
}

impl BufferKind {
    pub fn usage(self) -> wgpu::BufferUsages {
        match self {
            Self::Activation => {
                wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_SRC
                    | wgpu::BufferUsages::COPY_DST
            }
            Self::Readback => wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
        }
    }
}

struct IdleBuffer {
    buffer: wgpu::Buffer,
    size: u64,
    kind: BufferKind,
}

#[derive(Default)]
struct IdleSet {
    buffers: Vec<IdleBuffer>,
    bytes: u64,
}

/// Recycles activation and readback buffers across tiles.
///
/// Same-sized tiles hit the pool after the first one; the smallest idle buffer
/// that is large enough is handed out. Requests larger than the device's
/// storage binding limit are rejected before reaching the driver.
pub struct GpuBufferPool {
    context: Arc<GpuContext>,
    idle: Mutex<IdleSet>,
    idle_budget: u64,
    created_bytes: AtomicU64,
}

impl GpuBufferPool {
    pub fn new(context: Arc<GpuContext>) -> Self {
        Self::with_idle_budget(context, DEFAULT_IDLE_BUDGET)
    }

    pub fn with_idle_budget(context: Arc<GpuContext>, idle_budget: u64) -> Self {
        Self {
            context,
            idle: Mutex::new(IdleSet::default()),
            idle_budget,
            created_bytes: AtomicU64::new(0),
        }
    }

    /// Largest buffer that can still be bound as one storage binding.
    pub fn max_binding_size(&self) -> u64 {
        let limits = self.context.limits();
        u64::from(limits.max_storage_buffer_binding_size).min(limits.max_buffer_size)
    }

    pub fn acquire(&self, size: u64, kind: BufferKind, label: Option<&str>) -> Result<wgpu::Buffer> {
        let limit = self.max_binding_size();
        anyhow::ensure!(
            size <= limit,
            "{kind:?} buffer of {size} bytes exceeds the device limit of {limit} bytes; \
             use a smaller block size"
        );

        {
            let mut idle = self.lock_idle();
            let best = idle
                .buffers
                .iter()
                .enumerate()
                .filter(|(_, entry)| entry.kind == kind && entry.size >= size)
                .min_by_key(|(_, entry)| entry.size)
                .map(|(index, _)| index);
            if let Some(index) = best {
                let entry = idle.buffers.swap_remove(index);
                idle.bytes -= entry.size;
                return Ok(entry.buffer);
            }
        }

        trace!(target: "w2x::gpu", "allocating {size} byte {kind:?} buffer {label:?}");
        self.created_bytes.fetch_add(size, Ordering::Relaxed);
        Ok(self
            .context
            .device()
            .create_buffer(&wgpu::BufferDescriptor {
                label,
                size,
                usage: kind.usage(),
                mapped_at_creation: false,
            }))
    }

    /// Return a buffer for reuse. Past the idle budget the largest idle
    /// buffers are dropped first.
    pub fn recycle(&self, buffer: wgpu::Buffer, size: u64, kind: BufferKind) {
        let mut idle = self.lock_idle();
        idle.bytes += size;
        idle.buffers.push(IdleBuffer { buffer, size, kind });
        while idle.bytes > self.idle_budget {
            let Some(largest) = idle
                .buffers
                .iter()
                .enumerate()
                .max_by_key(|(_, entry)| entry.size)
                .map(|(index, _)| index)
            else {
                break;
            };
            let evicted = idle.buffers.swap_remove(largest);
            idle.bytes -= evicted.size;
            trace!(
                target: "w2x::gpu",
                "releasing idle {:?} buffer of {} bytes",
                evicted.kind,
                evicted.size
            );
        }
    }

    /// Idle buffers waiting for reuse.
    pub fn available(&self) -> usize {
        self.lock_idle().buffers.len()
    }

    /// Bytes currently held by idle buffers.
    pub fn idle_bytes(&self) -> u64 {
        self.lock_idle().bytes
    }

    /// Total bytes ever requested from the device through this pool.
    pub fn created_bytes(&self) -> u64 {
        self.created_bytes.load(Ordering::Relaxed)
    }

    fn lock_idle(&self) -> MutexGuard<'_, IdleSet> {
        self.idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for GpuBufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuBufferPool")
            .field("idle_buffers", &self.available())
            .field("idle_bytes", &self.idle_bytes())
            .field("created_bytes", &self.created_bytes())
            .finish()
    }
}
