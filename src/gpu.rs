// src/gpu.rs
// Global GPU context helpers and utilities
// Exists to share wgpu device creation across the pass suite and tests
// RELEVANT FILES: src/passes/gpu.rs, src/builder.rs

use once_cell::sync::OnceCell;
use std::sync::Arc;

pub struct GpuContext {
    pub instance: Arc<wgpu::Instance>,
    pub adapter: Arc<wgpu::Adapter>,
    pub device: Arc<wgpu::Device>,
    pub queue: Arc<wgpu::Queue>,
}

static CTX: OnceCell<GpuContext> = OnceCell::new();

fn backends_from_env() -> wgpu::Backends {
    use std::env;
    if let Ok(s) = env::var("WGPU_BACKENDS").or_else(|_| env::var("WGPU_BACKEND")) {
        let s_l = s.to_lowercase();
        if s_l.contains("metal") {
            return wgpu::Backends::METAL;
        }
        if s_l.contains("vulkan") {
            return wgpu::Backends::VULKAN;
        }
        if s_l.contains("dx12") {
            return wgpu::Backends::DX12;
        }
        if s_l.contains("gl") {
            return wgpu::Backends::GL;
        }
    }
    wgpu::Backends::all()
}

/// Shared device/queue singleton. The instance-load pass dereferences
/// addresses through a bindless heap, so the buffer binding-array features
/// are requested when the adapter has them.
pub fn ctx() -> &'static GpuContext {
    CTX.get_or_init(|| {
        let instance = Arc::new(wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: backends_from_env(),
            ..Default::default()
        }));
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .expect("No suitable GPU adapter");

        let wanted = wgpu::Features::BUFFER_BINDING_ARRAY
            | wgpu::Features::STORAGE_RESOURCE_BINDING_ARRAY;
        let features = adapter.features() & wanted;

        // The bindless heap counts one storage buffer per slot.
        let mut limits = wgpu::Limits::downlevel_defaults();
        limits.max_storage_buffers_per_shader_stage = limits
            .max_storage_buffers_per_shader_stage
            .max(crate::passes::gpu::MAX_HEAP_BUFFERS + 8)
            .min(adapter.limits().max_storage_buffers_per_shader_stage);

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                required_features: features,
                required_limits: limits,
                label: Some("gpu-bvh2-device"),
            },
            None,
        ))
        .expect("request_device failed");

        GpuContext {
            instance,
            adapter: Arc::new(adapter),
            device: Arc::new(device),
            queue: Arc::new(queue),
        }
    })
}
