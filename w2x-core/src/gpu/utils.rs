use std::sync::mpsc;

use anyhow::{Context, Result, anyhow};
use bytemuck::cast_slice;
use wgpu::util::DeviceExt;

/// Buffer initialized from `contents` with the given usage.
pub(super) fn init_buffer(
    device: &wgpu::Device,
    label: &str,
    contents: &[u8],
    usage: wgpu::BufferUsages,
) -> wgpu::Buffer {
    device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some(label),
        contents,
        usage,
    })
}

/// Compute-stage layout: one storage binding per entry of `storage`
/// (`true` = read-only) followed by a single uniform binding.
pub(super) fn compute_layout_entries(storage: &[bool]) -> Vec<wgpu::BindGroupLayoutEntry> {
    let uniform = std::iter::once(wgpu::BufferBindingType::Uniform);
    storage
        .iter()
        .map(|&read_only| wgpu::BufferBindingType::Storage { read_only })
        .chain(uniform)
        .enumerate()
        .map(|(binding, ty)| wgpu::BindGroupLayoutEntry {
            binding: binding as u32,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        })
        .collect()
}

/// Bind whole buffers to consecutive bindings starting at zero.
pub(super) fn bind_buffers(
    device: &wgpu::Device,
    layout: &wgpu::BindGroupLayout,
    label: &str,
    buffers: &[&wgpu::Buffer],
) -> wgpu::BindGroup {
    let entries: Vec<wgpu::BindGroupEntry<'_>> = buffers
        .iter()
        .enumerate()
        .map(|(binding, buffer)| wgpu::BindGroupEntry {
            binding: binding as u32,
            resource: buffer.as_entire_binding(),
        })
        .collect();
    device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some(label),
        layout,
        entries: &entries,
    })
}

/// Number of workgroups covering `value` invocations, never zero.
pub(super) fn workgroups(value: u32, size: u32) -> u32 {
    value.div_ceil(size).max(1)
}

/// Map a staging buffer already filled by a submitted copy and read back
/// `elements` floats.
pub(super) fn read_buffer(
    device: &wgpu::Device,
    buffer: &wgpu::Buffer,
    elements: usize,
    label: &str,
) -> Result<Vec<f32>> {
    let size_bytes = (elements * std::mem::size_of::<f32>()) as u64;
    let slice = buffer.slice(0..size_bytes);
    let (sender, receiver) = mpsc::sync_channel(1);
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = sender.send(result);
    });
    device
        .poll(wgpu::PollType::Wait {
            submission_index: None,
            timeout: None,
        })
        .map_err(|e| anyhow!("device poll failed during {label}: {e}"))?;
    receiver
        .recv()
        .with_context(|| format!("{label}: map callback never ran"))?
        .map_err(|e| anyhow!("{label}: buffer map failed: {e}"))?;

    let floats = {
        let mapped = slice.get_mapped_range();
        cast_slice::<u8, f32>(&mapped).to_vec()
    };
    buffer.unmap();
    anyhow::ensure!(
        floats.len() == elements,
        "{label} returned {} floats, expected {elements}",
        floats.len()
    );
    Ok(floats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workgroups_round_up_and_never_vanish() {
        assert_eq!(workgroups(0, 8), 1);
        assert_eq!(workgroups(8, 8), 1);
        assert_eq!(workgroups(9, 8), 2);
        assert_eq!(workgroups(510, 8), 64);
    }

    #[test]
    fn layout_appends_uniform_after_storage() {
        let entries = compute_layout_entries(&[true, true, true, false]);
        assert_eq!(entries.len(), 5);
        let bindings: Vec<u32> = entries.iter().map(|entry| entry.binding).collect();
        assert_eq!(bindings, vec![0, 1, 2, 3, 4]);
        assert!(matches!(
            entries[3].ty,
            wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only: false },
                ..
            }
        ));
        assert!(matches!(
            entries[4].ty,
            wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                ..
            }
        ));
    }
}
