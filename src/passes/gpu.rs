// src/passes/gpu.rs
// wgpu implementation of the pass contracts: one compute pipeline per kernel entry,
// all work recorded onto the caller's command encoder, addresses resolved through a
// registered buffer table (the bindless heap of the instance-load pass).
// This file exists to realize the pass contracts on a generic compute-capable GPU.
// RELEVANT FILES:src/passes/mod.rs,src/shaders/,src/gpu.rs,src/builder.rs

use std::mem::size_of;
use std::num::NonZeroU32;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use wgpu::util::DeviceExt;

use crate::desc::{CopyMode, DescsLayout, GpuVa, IndexFormat, SceneKind, VertexFormat};
use crate::desc::BuildFlags;
use crate::error::{BuildError, BuildResult};
use crate::layout::{
    compacted_result_size, element_stride, metadata_stride, num_internal_nodes,
    offset_from_leaf_nodes_to_metadata, offset_from_primitives_to_metadata,
    offset_to_leaf_node_aabbs, offset_to_primitives, result_size, total_num_nodes,
};
use crate::passes::{
    ConstructAabbArgs, ConstructHierarchyArgs, CopyArgs, LoadInstancesArgs, LoadPrimitivesArgs,
    MortonArgs, PassSuite, PostBuildInfoArgs, RearrangeArgs, SceneAabbArgs, SortArgs,
    TreeletReorderArgs, SCENE_AABB_GROUP_SIZE,
};

/// Size of the bindless heap bound to the instance-load pass. Registered
/// buffers beyond this cannot be dereferenced by address on the GPU.
pub const MAX_HEAP_BUFFERS: u32 = 64;

const WORKGROUP_SIZE: u32 = 64;
const COPY_WORKGROUPS: u32 = 256;

/// Maps GPU virtual addresses onto registered wgpu buffers, standing in for
/// raw device addresses (which the portable compute API does not expose).
#[derive(Default)]
pub struct BufferTable {
    entries: Vec<TableEntry>,
}

struct TableEntry {
    start: GpuVa,
    size: u64,
    buffer: Arc<wgpu::Buffer>,
}

impl BufferTable {
    /// Register `buffer` as backing the address range starting at `start`.
    pub fn register(&mut self, start: GpuVa, buffer: Arc<wgpu::Buffer>) -> BuildResult<()> {
        if start == 0 {
            return Err(BuildError::invalid("cannot register a buffer at address 0"));
        }
        if self.entries.len() as u32 >= MAX_HEAP_BUFFERS {
            return Err(BuildError::invalid(format!(
                "buffer table is full ({MAX_HEAP_BUFFERS} entries)"
            )));
        }
        let size = buffer.size();
        let end = start
            .checked_add(size)
            .ok_or_else(|| BuildError::internal("buffer range end overflowed"))?;
        for e in &self.entries {
            if start < e.start + e.size && e.start < end {
                return Err(BuildError::invalid(format!(
                    "buffer range {start:#x}+{size} overlaps a registered range"
                )));
            }
        }
        self.entries.push(TableEntry {
            start,
            size,
            buffer,
        });
        Ok(())
    }

    fn find(&self, va: GpuVa) -> BuildResult<(&Arc<wgpu::Buffer>, u64)> {
        for e in &self.entries {
            if va >= e.start && va < e.start + e.size {
                return Ok((&e.buffer, va - e.start));
            }
        }
        Err(BuildError::invalid(format!(
            "address {va:#x} does not fall in any registered buffer"
        )))
    }

    /// Serialize the table for GPU-side address resolution: 8 words per
    /// entry (va lo/hi, size lo/hi, heap slot, padding).
    fn gpu_words(&self) -> Vec<u32> {
        let mut words = Vec::with_capacity(self.entries.len() * 8);
        for (slot, e) in self.entries.iter().enumerate() {
            words.extend_from_slice(&[
                e.start as u32,
                (e.start >> 32) as u32,
                e.size as u32,
                (e.size >> 32) as u32,
                slot as u32,
                0,
                0,
                0,
            ]);
        }
        words
    }
}

/// Word offset plus bound-slot index of one region, as the shaders consume
/// them from their uniform blocks.
#[derive(Debug, Clone, Copy)]
struct RegionLoc {
    loc: u32,
    buf: u32,
}

const NULL_LOC: RegionLoc = RegionLoc { loc: 0, buf: 0 };

/// Collects the (at most two) distinct read-write buffers a pass touches
/// and assigns each region a slot + word offset.
struct SlotMap {
    buffers: Vec<Arc<wgpu::Buffer>>,
}

impl SlotMap {
    fn new() -> Self {
        Self {
            buffers: Vec::with_capacity(2),
        }
    }

    fn locate(&mut self, table: &BufferTable, va: GpuVa) -> BuildResult<RegionLoc> {
        if va == 0 {
            return Ok(NULL_LOC);
        }
        if va % 4 != 0 {
            return Err(BuildError::invalid(format!(
                "address {va:#x} is not 4-byte aligned"
            )));
        }
        let (buffer, rel) = table.find(va)?;
        let slot = match self.buffers.iter().position(|b| Arc::ptr_eq(b, buffer)) {
            Some(slot) => slot,
            None => {
                if self.buffers.len() == 2 {
                    return Err(BuildError::internal(
                        "pass touches more than two distinct read-write buffers",
                    ));
                }
                self.buffers.push(buffer.clone());
                self.buffers.len() - 1
            }
        };
        Ok(RegionLoc {
            loc: (rel / 4) as u32,
            buf: slot as u32,
        })
    }

    fn into_slots(mut self, placeholder: &Arc<wgpu::Buffer>) -> [Arc<wgpu::Buffer>; 2] {
        while self.buffers.len() < 2 {
            self.buffers.push(placeholder.clone());
        }
        let second = self.buffers.pop().unwrap();
        let first = self.buffers.pop().unwrap();
        [first, second]
    }
}

struct Pipelines {
    load_seed_indices: wgpu::ComputePipeline,
    load_geometry: wgpu::ComputePipeline,
    load_instances: wgpu::ComputePipeline,
    scene_aabb_reduce: wgpu::ComputePipeline,
    scene_aabb_finalize: wgpu::ComputePipeline,
    morton: wgpu::ComputePipeline,
    sort_step: wgpu::ComputePipeline,
    rearrange: wgpu::ComputePipeline,
    hierarchy: wgpu::ComputePipeline,
    treelet_clear: wgpu::ComputePipeline,
    treelet_aabbs: wgpu::ComputePipeline,
    treelet_rotate: wgpu::ComputePipeline,
    construct_init: wgpu::ComputePipeline,
    construct_refit: wgpu::ComputePipeline,
    copy_words: wgpu::ComputePipeline,
    copy_patch: wgpu::ComputePipeline,
    post_build: wgpu::ComputePipeline,
}

/// The wgpu pass suite: owns every compute pipeline once and records pass
/// work onto the caller-supplied encoder. Destination and scratch ranges
/// must be backed by distinct registered buffers.
pub struct GpuPassSuite {
    device: Arc<wgpu::Device>,
    table: BufferTable,
    placeholder: Arc<wgpu::Buffer>,
    pipelines: Pipelines,
}

fn compute_pipeline(
    device: &wgpu::Device,
    label: &str,
    module: &wgpu::ShaderModule,
    layout: Option<&wgpu::PipelineLayout>,
    entry_point: &str,
) -> wgpu::ComputePipeline {
    device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(label),
        layout,
        module,
        entry_point,
    })
}

impl GpuPassSuite {
    /// Create the suite, compiling every pass kernel up front.
    ///
    /// The instance-load pass needs `BUFFER_BINDING_ARRAY` and
    /// `STORAGE_RESOURCE_BINDING_ARRAY` on the device for its bindless
    /// heap.
    pub fn new(device: Arc<wgpu::Device>) -> Self {
        let shader = |label: &str, src: &'static str| {
            device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Wgsl(src.into()),
            })
        };

        let load_primitives = shader("bvh-load-primitives", include_str!("../shaders/load_primitives.wgsl"));
        let load_instances = shader("bvh-load-instances", include_str!("../shaders/load_instances.wgsl"));
        let scene_aabb = shader("bvh-scene-aabb", include_str!("../shaders/scene_aabb.wgsl"));
        let morton = shader("bvh-morton", include_str!("../shaders/morton.wgsl"));
        let sort = shader("bvh-sort", include_str!("../shaders/sort.wgsl"));
        let rearrange = shader("bvh-rearrange", include_str!("../shaders/rearrange.wgsl"));
        let hierarchy = shader("bvh-hierarchy", include_str!("../shaders/hierarchy.wgsl"));
        let treelet = shader("bvh-treelet-reorder", include_str!("../shaders/treelet_reorder.wgsl"));
        let construct = shader("bvh-construct-aabb", include_str!("../shaders/construct_aabb.wgsl"));
        let copy = shader("bvh-copy", include_str!("../shaders/copy.wgsl"));
        let post_build = shader("bvh-post-build-info", include_str!("../shaders/post_build_info.wgsl"));

        // The instance-load pipeline carries a binding array, whose entry
        // count cannot be inferred from the shader; its layout is explicit.
        let storage_entry = |binding: u32, read_only: bool| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        let uniform_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("bvh-load-instances-uniforms"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            }],
        });
        let slots_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("bvh-load-instances-slots"),
            entries: &[storage_entry(0, false), storage_entry(1, false)],
        });
        let table_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("bvh-load-instances-table"),
            entries: &[storage_entry(0, true)],
        });
        let heap_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("bvh-load-instances-heap"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Storage { read_only: true },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: NonZeroU32::new(MAX_HEAP_BUFFERS),
            }],
        });
        let load_instances_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("bvh-load-instances-layout"),
            bind_group_layouts: &[&uniform_layout, &slots_layout, &table_layout, &heap_layout],
            push_constant_ranges: &[],
        });

        let pipelines = Pipelines {
            load_seed_indices: compute_pipeline(&device, "bvh-seed-indices", &load_primitives, None, "seed_indices"),
            load_geometry: compute_pipeline(&device, "bvh-load-geometry", &load_primitives, None, "load_geometry"),
            load_instances: compute_pipeline(
                &device,
                "bvh-load-instances",
                &load_instances,
                Some(&load_instances_layout),
                "main",
            ),
            scene_aabb_reduce: compute_pipeline(&device, "bvh-scene-aabb-reduce", &scene_aabb, None, "reduce"),
            scene_aabb_finalize: compute_pipeline(&device, "bvh-scene-aabb-finalize", &scene_aabb, None, "finalize"),
            morton: compute_pipeline(&device, "bvh-morton", &morton, None, "main"),
            sort_step: compute_pipeline(&device, "bvh-sort-step", &sort, None, "step"),
            rearrange: compute_pipeline(&device, "bvh-rearrange", &rearrange, None, "main"),
            hierarchy: compute_pipeline(&device, "bvh-hierarchy", &hierarchy, None, "main"),
            treelet_clear: compute_pipeline(&device, "bvh-treelet-clear", &treelet, None, "clear_counters"),
            treelet_aabbs: compute_pipeline(&device, "bvh-treelet-aabbs", &treelet, None, "compute_aabbs"),
            treelet_rotate: compute_pipeline(&device, "bvh-treelet-rotate", &treelet, None, "rotate"),
            construct_init: compute_pipeline(&device, "bvh-construct-init", &construct, None, "init"),
            construct_refit: compute_pipeline(&device, "bvh-construct-refit", &construct, None, "refit"),
            copy_words: compute_pipeline(&device, "bvh-copy-words", &copy, None, "copy_words"),
            copy_patch: compute_pipeline(&device, "bvh-copy-patch", &copy, None, "patch_header"),
            post_build: compute_pipeline(&device, "bvh-post-build-info", &post_build, None, "main"),
        };

        let placeholder = Arc::new(device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("bvh-placeholder"),
            size: 64,
            usage: wgpu::BufferUsages::STORAGE,
            mapped_at_creation: false,
        }));

        Self {
            device,
            table: BufferTable::default(),
            placeholder,
            pipelines,
        }
    }

    /// Register a buffer as backing an address range. Every range a build
    /// descriptor mentions (dest, scratch, vertex/index/instance data,
    /// referenced bottom-level structures) must be registered first.
    pub fn register_buffer(&mut self, start: GpuVa, buffer: Arc<wgpu::Buffer>) -> BuildResult<()> {
        self.table.register(start, buffer)
    }

    fn uniforms<T: Pod>(&self, label: &str, value: T) -> wgpu::Buffer {
        self.device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents: bytemuck::bytes_of(&value),
                usage: wgpu::BufferUsages::UNIFORM,
            })
    }

    fn uniform_group(
        &self,
        pipeline: &wgpu::ComputePipeline,
        uniforms: &wgpu::Buffer,
    ) -> wgpu::BindGroup {
        self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("bvh-pass-uniforms"),
            layout: &pipeline.get_bind_group_layout(0),
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: uniforms.as_entire_binding(),
            }],
        })
    }

    /// The two read-write slots every kernel addresses through its uniform
    /// block; kernels that use atomics see the same buffers again through
    /// the atomic bindings.
    fn slots_group(
        &self,
        pipeline: &wgpu::ComputePipeline,
        slots: &[Arc<wgpu::Buffer>; 2],
        with_atomics: bool,
    ) -> wgpu::BindGroup {
        let mut entries = vec![
            wgpu::BindGroupEntry {
                binding: 0,
                resource: slots[0].as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 1,
                resource: slots[1].as_entire_binding(),
            },
        ];
        if with_atomics {
            entries.push(wgpu::BindGroupEntry {
                binding: 2,
                resource: slots[0].as_entire_binding(),
            });
            entries.push(wgpu::BindGroupEntry {
                binding: 3,
                resource: slots[1].as_entire_binding(),
            });
        }
        self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("bvh-pass-slots"),
            layout: &pipeline.get_bind_group_layout(1),
            entries: &entries,
        })
    }

    fn dispatch(
        &self,
        rec: &mut wgpu::CommandEncoder,
        label: &str,
        pipeline: &wgpu::ComputePipeline,
        groups: u32,
        bind_groups: &[&wgpu::BindGroup],
    ) {
        let mut pass = rec.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(label),
            timestamp_writes: None,
        });
        pass.set_pipeline(pipeline);
        for (i, bg) in bind_groups.iter().enumerate() {
            pass.set_bind_group(i as u32, bg, &[]);
        }
        pass.dispatch_workgroups(groups.max(1), 1, 1);
    }
}

fn groups_for(n: u32) -> u32 {
    n.div_ceil(WORKGROUP_SIZE).max(1)
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct SceneAabbParams {
    num_elements: u32,
    scene_kind: u32,
    elements_loc: u32,
    elements_buf: u32,
    scratch_loc: u32,
    scratch_buf: u32,
    aabb_loc: u32,
    aabb_buf: u32,
    num_groups: u32,
    _pad: [u32; 3],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct MortonParams {
    num_elements: u32,
    scene_kind: u32,
    elements_loc: u32,
    elements_buf: u32,
    aabb_loc: u32,
    aabb_buf: u32,
    codes_loc: u32,
    codes_buf: u32,
    indices_loc: u32,
    indices_buf: u32,
    _pad: [u32; 2],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct SortParams {
    num_elements: u32,
    p: u32,
    k: u32,
    codes_loc: u32,
    codes_buf: u32,
    indices_loc: u32,
    indices_buf: u32,
    _pad: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct RearrangeParams {
    num_elements: u32,
    element_stride: u32,
    metadata_stride: u32,
    src_elements_loc: u32,
    src_elements_buf: u32,
    src_metadata_loc: u32,
    src_metadata_buf: u32,
    indices_loc: u32,
    indices_buf: u32,
    dst_elements_loc: u32,
    dst_elements_buf: u32,
    dst_metadata_loc: u32,
    dst_metadata_buf: u32,
    sorted_cache_loc: u32,
    sorted_cache_buf: u32,
    has_sorted_cache: u32,
    _pad: [u32; 4],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct HierarchyParams {
    num_elements: u32,
    codes_loc: u32,
    codes_buf: u32,
    hierarchy_loc: u32,
    hierarchy_buf: u32,
    parents_loc: u32,
    parents_buf: u32,
    has_parents: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct TreeletParams {
    num_elements: u32,
    hierarchy_loc: u32,
    hierarchy_buf: u32,
    parents_loc: u32,
    parents_buf: u32,
    has_parents: u32,
    counter_loc: u32,
    counter_buf: u32,
    aabb_loc: u32,
    aabb_buf: u32,
    elements_loc: u32,
    elements_buf: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct ConstructAabbParams {
    num_elements: u32,
    scene_kind: u32,
    perform_update: u32,
    header_loc: u32,
    header_buf: u32,
    nodes_loc: u32,
    nodes_buf: u32,
    prims_loc: u32,
    prims_buf: u32,
    hierarchy_loc: u32,
    hierarchy_buf: u32,
    counter_loc: u32,
    counter_buf: u32,
    parents_loc: u32,
    parents_buf: u32,
    header_leaf_nodes: u32,
    header_metadata: u32,
    header_compacted: u32,
    header_total: u32,
    _pad: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct LoadPrimitivesParams {
    tri_count: u32,
    base_element: u32,
    vertex_stride: u32,
    vertex_format: u32,
    index_format: u32,
    has_transform: u32,
    geometry_index: u32,
    geometry_flags: u32,
    vb_loc: u32,
    ib_loc: u32,
    transform_loc: u32,
    elements_loc: u32,
    elements_buf: u32,
    metadata_loc: u32,
    metadata_buf: u32,
    indices_loc: u32,
    indices_buf: u32,
    num_elements: u32,
    _pad: [u32; 2],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct LoadInstancesParams {
    count: u32,
    descs_layout: u32,
    descs_lo: u32,
    descs_hi: u32,
    elements_loc: u32,
    elements_buf: u32,
    indices_loc: u32,
    indices_buf: u32,
    has_index_seed: u32,
    table_len: u32,
    _pad: [u32; 2],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct CopyParams {
    mode: u32,
    src_loc: u32,
    src_buf: u32,
    dst_loc: u32,
    dst_buf: u32,
    _pad: [u32; 3],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct PostBuildParams {
    src_loc: u32,
    src_buf: u32,
    dest_loc: u32,
    dest_buf: u32,
}

fn scene_kind_word(kind: SceneKind) -> u32 {
    match kind {
        SceneKind::Triangles => 0,
        SceneKind::BottomLevelBvhs => 1,
    }
}

impl PassSuite for GpuPassSuite {
    type Recorder = wgpu::CommandEncoder;

    fn load_primitives(
        &self,
        rec: &mut wgpu::CommandEncoder,
        args: &LoadPrimitivesArgs<'_>,
    ) -> BuildResult<()> {
        let mut slots = SlotMap::new();
        let elements = slots.locate(&self.table, args.element_buffer)?;
        let metadata = slots.locate(&self.table, args.metadata_buffer)?;
        let indices = slots.locate(&self.table, args.index_buffer)?;
        let slot_buffers = slots.into_slots(&self.placeholder);

        if args.index_buffer != 0 {
            let params = LoadPrimitivesParams {
                num_elements: args.num_elements,
                indices_loc: indices.loc,
                indices_buf: indices.buf,
                ..Zeroable::zeroed()
            };
            let uniforms = self.uniforms("bvh-seed-indices-uniforms", params);
            let bg0 = self.uniform_group(&self.pipelines.load_seed_indices, &uniforms);
            let bg1 = self.slots_group(&self.pipelines.load_seed_indices, &slot_buffers, false);
            self.dispatch(
                rec,
                "bvh-seed-indices",
                &self.pipelines.load_seed_indices,
                groups_for(args.num_elements),
                &[&bg0, &bg1],
            );
        }

        let mut base_element = 0u32;
        for (gi, g) in args.geometries.iter().enumerate() {
            let tri_count = g.triangle_count();
            if tri_count == 0 {
                continue;
            }
            if g.vertex_stride % 4 != 0 {
                return Err(BuildError::invalid(
                    "vertex stride must be a multiple of 4 bytes",
                ));
            }

            let (vb, vb_off) = self.table.find(g.vertex_buffer)?;
            let ib = if g.index_buffer != 0 {
                Some(self.table.find(g.index_buffer)?)
            } else {
                None
            };
            let transform = if g.transform != 0 {
                Some(self.table.find(g.transform)?)
            } else {
                None
            };

            let params = LoadPrimitivesParams {
                tri_count,
                base_element,
                vertex_stride: (g.vertex_stride / 4) as u32,
                vertex_format: match g.vertex_format {
                    VertexFormat::Float32x3 => 0,
                    VertexFormat::Float32x2 => 1,
                },
                index_format: match (g.index_buffer, g.index_format) {
                    (0, _) | (_, IndexFormat::None) => 0,
                    (_, IndexFormat::Uint16) => 1,
                    (_, IndexFormat::Uint32) => 2,
                },
                has_transform: transform.is_some() as u32,
                geometry_index: gi as u32,
                geometry_flags: g.flags.bits(),
                vb_loc: (vb_off / 4) as u32,
                ib_loc: ib.as_ref().map_or(0, |(_, off)| (off / 4) as u32),
                transform_loc: transform.as_ref().map_or(0, |(_, off)| (off / 4) as u32),
                elements_loc: elements.loc,
                elements_buf: elements.buf,
                metadata_loc: metadata.loc,
                metadata_buf: metadata.buf,
                indices_loc: 0,
                indices_buf: 0,
                num_elements: args.num_elements,
                _pad: [0; 2],
            };
            let uniforms = self.uniforms("bvh-load-geometry-uniforms", params);
            let bg0 = self.uniform_group(&self.pipelines.load_geometry, &uniforms);
            let bg1 = self.slots_group(&self.pipelines.load_geometry, &slot_buffers, false);
            let bg2 = self.sources_group(
                &self.pipelines.load_geometry,
                [
                    Some(vb.clone()),
                    ib.map(|(b, _)| b.clone()),
                    transform.map(|(b, _)| b.clone()),
                ],
            )?;
            self.dispatch(
                rec,
                "bvh-load-geometry",
                &self.pipelines.load_geometry,
                groups_for(tri_count),
                &[&bg0, &bg1, &bg2],
            );

            base_element += tri_count;
        }
        Ok(())
    }

    fn load_instances(
        &self,
        rec: &mut wgpu::CommandEncoder,
        args: &LoadInstancesArgs,
    ) -> BuildResult<()> {
        let mut slots = SlotMap::new();
        let elements = slots.locate(&self.table, args.element_buffer)?;
        let indices = slots.locate(&self.table, args.index_buffer)?;
        let slot_buffers = slots.into_slots(&self.placeholder);

        let params = LoadInstancesParams {
            count: args.num_elements,
            descs_layout: match args.layout {
                DescsLayout::Array => 0,
                DescsLayout::ArrayOfPointers => 1,
            },
            descs_lo: args.instance_descs as u32,
            descs_hi: (args.instance_descs >> 32) as u32,
            elements_loc: elements.loc,
            elements_buf: elements.buf,
            indices_loc: indices.loc,
            indices_buf: indices.buf,
            has_index_seed: (args.index_buffer != 0) as u32,
            table_len: self.table.entries.len() as u32,
            _pad: [0; 2],
        };
        let uniforms = self.uniforms("bvh-load-instances-uniforms", params);

        let table_words = self.table.gpu_words();
        let table_buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("bvh-address-table"),
                contents: bytemuck::cast_slice(&table_words),
                usage: wgpu::BufferUsages::STORAGE,
            });

        let heap_bindings: Vec<wgpu::BufferBinding> = (0..MAX_HEAP_BUFFERS as usize)
            .map(|slot| {
                let buffer = self
                    .table
                    .entries
                    .get(slot)
                    .map(|e| e.buffer.as_ref())
                    .unwrap_or(self.placeholder.as_ref());
                wgpu::BufferBinding {
                    buffer,
                    offset: 0,
                    size: None,
                }
            })
            .collect();

        let pipeline = &self.pipelines.load_instances;
        let bg0 = self.uniform_group(pipeline, &uniforms);
        let bg1 = self.slots_group(pipeline, &slot_buffers, false);
        let bg2 = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("bvh-load-instances-table"),
            layout: &pipeline.get_bind_group_layout(2),
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: table_buffer.as_entire_binding(),
            }],
        });
        let bg3 = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("bvh-load-instances-heap"),
            layout: &pipeline.get_bind_group_layout(3),
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::BufferArray(&heap_bindings),
            }],
        });

        self.dispatch(
            rec,
            "bvh-load-instances",
            pipeline,
            groups_for(args.num_elements),
            &[&bg0, &bg1, &bg2, &bg3],
        );
        Ok(())
    }

    fn calculate_scene_aabb(
        &self,
        rec: &mut wgpu::CommandEncoder,
        args: &SceneAabbArgs,
    ) -> BuildResult<()> {
        let mut slots = SlotMap::new();
        let elements = slots.locate(&self.table, args.element_buffer)?;
        let scratch = slots.locate(&self.table, args.scratch)?;
        let aabb = slots.locate(&self.table, args.scene_aabb)?;
        let slot_buffers = slots.into_slots(&self.placeholder);

        let num_groups = args.num_elements.div_ceil(SCENE_AABB_GROUP_SIZE).max(1);
        let params = SceneAabbParams {
            num_elements: args.num_elements,
            scene_kind: scene_kind_word(args.scene_kind),
            elements_loc: elements.loc,
            elements_buf: elements.buf,
            scratch_loc: scratch.loc,
            scratch_buf: scratch.buf,
            aabb_loc: aabb.loc,
            aabb_buf: aabb.buf,
            num_groups,
            _pad: [0; 3],
        };
        let uniforms = self.uniforms("bvh-scene-aabb-uniforms", params);

        let bg0 = self.uniform_group(&self.pipelines.scene_aabb_reduce, &uniforms);
        let bg1 = self.slots_group(&self.pipelines.scene_aabb_reduce, &slot_buffers, false);
        self.dispatch(
            rec,
            "bvh-scene-aabb-reduce",
            &self.pipelines.scene_aabb_reduce,
            num_groups,
            &[&bg0, &bg1],
        );

        let bg0 = self.uniform_group(&self.pipelines.scene_aabb_finalize, &uniforms);
        let bg1 = self.slots_group(&self.pipelines.scene_aabb_finalize, &slot_buffers, false);
        self.dispatch(
            rec,
            "bvh-scene-aabb-finalize",
            &self.pipelines.scene_aabb_finalize,
            1,
            &[&bg0, &bg1],
        );
        Ok(())
    }

    fn calculate_morton_codes(
        &self,
        rec: &mut wgpu::CommandEncoder,
        args: &MortonArgs,
    ) -> BuildResult<()> {
        let mut slots = SlotMap::new();
        let elements = slots.locate(&self.table, args.element_buffer)?;
        let aabb = slots.locate(&self.table, args.scene_aabb)?;
        let codes = slots.locate(&self.table, args.morton_codes)?;
        let indices = slots.locate(&self.table, args.index_buffer)?;
        let slot_buffers = slots.into_slots(&self.placeholder);

        let params = MortonParams {
            num_elements: args.num_elements,
            scene_kind: scene_kind_word(args.scene_kind),
            elements_loc: elements.loc,
            elements_buf: elements.buf,
            aabb_loc: aabb.loc,
            aabb_buf: aabb.buf,
            codes_loc: codes.loc,
            codes_buf: codes.buf,
            indices_loc: indices.loc,
            indices_buf: indices.buf,
            _pad: [0; 2],
        };
        let uniforms = self.uniforms("bvh-morton-uniforms", params);
        let bg0 = self.uniform_group(&self.pipelines.morton, &uniforms);
        let bg1 = self.slots_group(&self.pipelines.morton, &slot_buffers, false);
        self.dispatch(
            rec,
            "bvh-morton",
            &self.pipelines.morton,
            groups_for(args.num_elements),
            &[&bg0, &bg1],
        );
        Ok(())
    }

    fn sort(&self, rec: &mut wgpu::CommandEncoder, args: &SortArgs) -> BuildResult<()> {
        let n = args.num_elements;
        if n < 2 {
            return Ok(());
        }
        let mut slots = SlotMap::new();
        let codes = slots.locate(&self.table, args.morton_codes)?;
        let indices = slots.locate(&self.table, args.index_buffer)?;
        let slot_buffers = slots.into_slots(&self.placeholder);

        // Batcher odd-even merge step sequence, valid for any n because all
        // of its comparators order ascending; one compute pass per step
        // keeps each step's writes visible to the next.
        let mut p = 1u32;
        while p < n {
            let mut k = p;
            while k > 0 {
                let params = SortParams {
                    num_elements: n,
                    p,
                    k,
                    codes_loc: codes.loc,
                    codes_buf: codes.buf,
                    indices_loc: indices.loc,
                    indices_buf: indices.buf,
                    _pad: 0,
                };
                let uniforms = self.uniforms("bvh-sort-uniforms", params);
                let bg0 = self.uniform_group(&self.pipelines.sort_step, &uniforms);
                let bg1 = self.slots_group(&self.pipelines.sort_step, &slot_buffers, false);
                self.dispatch(
                    rec,
                    "bvh-sort-step",
                    &self.pipelines.sort_step,
                    groups_for(n),
                    &[&bg0, &bg1],
                );
                k /= 2;
            }
            p *= 2;
        }
        Ok(())
    }

    fn rearrange(&self, rec: &mut wgpu::CommandEncoder, args: &RearrangeArgs) -> BuildResult<()> {
        let mut slots = SlotMap::new();
        let src_elements = slots.locate(&self.table, args.scratch_elements)?;
        let src_metadata = slots.locate(&self.table, args.scratch_metadata)?;
        let indices = slots.locate(&self.table, args.index_buffer)?;
        let dst_elements = slots.locate(&self.table, args.output_elements)?;
        let dst_metadata = slots.locate(&self.table, args.output_metadata)?;
        let sorted_cache = slots.locate(&self.table, args.output_sorted_indices)?;
        let slot_buffers = slots.into_slots(&self.placeholder);

        let params = RearrangeParams {
            num_elements: args.num_elements,
            element_stride: (element_stride(args.scene_kind) / 4) as u32,
            metadata_stride: (metadata_stride(args.scene_kind) / 4) as u32,
            src_elements_loc: src_elements.loc,
            src_elements_buf: src_elements.buf,
            src_metadata_loc: src_metadata.loc,
            src_metadata_buf: src_metadata.buf,
            indices_loc: indices.loc,
            indices_buf: indices.buf,
            dst_elements_loc: dst_elements.loc,
            dst_elements_buf: dst_elements.buf,
            dst_metadata_loc: dst_metadata.loc,
            dst_metadata_buf: dst_metadata.buf,
            sorted_cache_loc: sorted_cache.loc,
            sorted_cache_buf: sorted_cache.buf,
            has_sorted_cache: (args.output_sorted_indices != 0) as u32,
            _pad: [0; 4],
        };
        let uniforms = self.uniforms("bvh-rearrange-uniforms", params);
        let bg0 = self.uniform_group(&self.pipelines.rearrange, &uniforms);
        let bg1 = self.slots_group(&self.pipelines.rearrange, &slot_buffers, false);
        self.dispatch(
            rec,
            "bvh-rearrange",
            &self.pipelines.rearrange,
            groups_for(args.num_elements),
            &[&bg0, &bg1],
        );
        Ok(())
    }

    fn construct_hierarchy(
        &self,
        rec: &mut wgpu::CommandEncoder,
        args: &ConstructHierarchyArgs,
    ) -> BuildResult<()> {
        let mut slots = SlotMap::new();
        let codes = slots.locate(&self.table, args.morton_codes)?;
        let hierarchy = slots.locate(&self.table, args.hierarchy)?;
        let parents = slots.locate(&self.table, args.parent_indices)?;
        let slot_buffers = slots.into_slots(&self.placeholder);

        let params = HierarchyParams {
            num_elements: args.num_elements,
            codes_loc: codes.loc,
            codes_buf: codes.buf,
            hierarchy_loc: hierarchy.loc,
            hierarchy_buf: hierarchy.buf,
            parents_loc: parents.loc,
            parents_buf: parents.buf,
            has_parents: (args.parent_indices != 0) as u32,
        };
        let uniforms = self.uniforms("bvh-hierarchy-uniforms", params);
        let bg0 = self.uniform_group(&self.pipelines.hierarchy, &uniforms);
        let bg1 = self.slots_group(&self.pipelines.hierarchy, &slot_buffers, false);
        self.dispatch(
            rec,
            "bvh-hierarchy",
            &self.pipelines.hierarchy,
            groups_for(args.num_elements),
            &[&bg0, &bg1],
        );
        Ok(())
    }

    fn treelet_reorder(
        &self,
        rec: &mut wgpu::CommandEncoder,
        args: &TreeletReorderArgs,
    ) -> BuildResult<()> {
        if args.build_flags.contains(BuildFlags::PREFER_FAST_BUILD) || args.num_elements < 2 {
            return Ok(());
        }

        let mut slots = SlotMap::new();
        let hierarchy = slots.locate(&self.table, args.hierarchy)?;
        let parents = slots.locate(&self.table, args.parent_indices)?;
        let counter = slots.locate(&self.table, args.node_counter)?;
        let aabbs = slots.locate(&self.table, args.aabb_scratch)?;
        let elements = slots.locate(&self.table, args.element_buffer)?;
        let slot_buffers = slots.into_slots(&self.placeholder);

        let params = TreeletParams {
            num_elements: args.num_elements,
            hierarchy_loc: hierarchy.loc,
            hierarchy_buf: hierarchy.buf,
            parents_loc: parents.loc,
            parents_buf: parents.buf,
            has_parents: (args.parent_indices != 0) as u32,
            counter_loc: counter.loc,
            counter_buf: counter.buf,
            aabb_loc: aabbs.loc,
            aabb_buf: aabbs.buf,
            elements_loc: elements.loc,
            elements_buf: elements.buf,
        };
        let uniforms = self.uniforms("bvh-treelet-uniforms", params);

        // Only the AABB climb touches the atomic counters; the other two
        // entries see just the plain word views.
        for (label, pipeline, groups, atomics) in [
            (
                "bvh-treelet-clear",
                &self.pipelines.treelet_clear,
                groups_for(num_internal_nodes(args.num_elements)),
                false,
            ),
            (
                "bvh-treelet-aabbs",
                &self.pipelines.treelet_aabbs,
                groups_for(args.num_elements),
                true,
            ),
            ("bvh-treelet-rotate", &self.pipelines.treelet_rotate, 1, false),
        ] {
            let bg0 = self.uniform_group(pipeline, &uniforms);
            let bg1 = self.slots_group(pipeline, &slot_buffers, atomics);
            self.dispatch(rec, label, pipeline, groups, &[&bg0, &bg1]);
        }
        Ok(())
    }

    fn construct_aabb(
        &self,
        rec: &mut wgpu::CommandEncoder,
        args: &ConstructAabbArgs,
    ) -> BuildResult<()> {
        let n = args.num_elements;
        let kind = match args.scene_kind {
            SceneKind::Triangles => crate::desc::AccelKind::BottomLevel,
            SceneKind::BottomLevelBvhs => crate::desc::AccelKind::TopLevel,
        };

        let mut slots = SlotMap::new();
        let header = slots.locate(&self.table, args.dest)?;
        let nodes = slots.locate(&self.table, args.dest + crate::layout::RESULT_HEADER_SIZE)?;
        let prims = match args.scene_kind {
            SceneKind::Triangles if n > 0 => {
                slots.locate(&self.table, args.dest + offset_to_primitives(n))?
            }
            _ => NULL_LOC,
        };
        let hierarchy = slots.locate(&self.table, args.hierarchy)?;
        let counter = slots.locate(&self.table, args.node_counter)?;
        let parents = slots.locate(&self.table, args.parent_indices)?;
        let slot_buffers = slots.into_slots(&self.placeholder);

        let metadata_offset = match kind {
            crate::desc::AccelKind::BottomLevel => {
                offset_to_primitives(n) + offset_from_primitives_to_metadata(n)
            }
            crate::desc::AccelKind::TopLevel => {
                offset_to_leaf_node_aabbs(n) + offset_from_leaf_nodes_to_metadata(n)
            }
        };
        let params = ConstructAabbParams {
            num_elements: n,
            scene_kind: scene_kind_word(args.scene_kind),
            perform_update: args.perform_update as u32,
            header_loc: header.loc,
            header_buf: header.buf,
            nodes_loc: nodes.loc,
            nodes_buf: nodes.buf,
            prims_loc: prims.loc,
            prims_buf: prims.buf,
            hierarchy_loc: hierarchy.loc,
            hierarchy_buf: hierarchy.buf,
            counter_loc: counter.loc,
            counter_buf: counter.buf,
            parents_loc: parents.loc,
            parents_buf: parents.buf,
            header_leaf_nodes: offset_to_leaf_node_aabbs(n) as u32,
            header_metadata: metadata_offset as u32,
            header_compacted: compacted_result_size(kind, n) as u32,
            header_total: result_size(kind, n, args.update_arrays) as u32,
            _pad: 0,
        };
        let uniforms = self.uniforms("bvh-construct-aabb-uniforms", params);

        let bg0 = self.uniform_group(&self.pipelines.construct_init, &uniforms);
        let bg1 = self.slots_group(&self.pipelines.construct_init, &slot_buffers, false);
        self.dispatch(
            rec,
            "bvh-construct-init",
            &self.pipelines.construct_init,
            groups_for(total_num_nodes(n)),
            &[&bg0, &bg1],
        );

        if n > 0 {
            let bg0 = self.uniform_group(&self.pipelines.construct_refit, &uniforms);
            let bg1 = self.slots_group(&self.pipelines.construct_refit, &slot_buffers, true);
            self.dispatch(
                rec,
                "bvh-construct-refit",
                &self.pipelines.construct_refit,
                groups_for(n),
                &[&bg0, &bg1],
            );
        }
        Ok(())
    }

    fn copy_acceleration_structure(
        &self,
        rec: &mut wgpu::CommandEncoder,
        args: &CopyArgs,
    ) -> BuildResult<()> {
        let mut slots = SlotMap::new();
        let src = slots.locate(&self.table, args.source)?;
        let dst = slots.locate(&self.table, args.dest.start)?;
        let slot_buffers = slots.into_slots(&self.placeholder);

        let params = CopyParams {
            mode: (args.mode == CopyMode::Compact) as u32,
            src_loc: src.loc,
            src_buf: src.buf,
            dst_loc: dst.loc,
            dst_buf: dst.buf,
            _pad: [0; 3],
        };
        let uniforms = self.uniforms("bvh-copy-uniforms", params);

        let bg0 = self.uniform_group(&self.pipelines.copy_words, &uniforms);
        let bg1 = self.slots_group(&self.pipelines.copy_words, &slot_buffers, false);
        self.dispatch(
            rec,
            "bvh-copy-words",
            &self.pipelines.copy_words,
            COPY_WORKGROUPS,
            &[&bg0, &bg1],
        );

        if args.mode == CopyMode::Compact {
            let bg0 = self.uniform_group(&self.pipelines.copy_patch, &uniforms);
            let bg1 = self.slots_group(&self.pipelines.copy_patch, &slot_buffers, false);
            self.dispatch(rec, "bvh-copy-patch", &self.pipelines.copy_patch, 1, &[&bg0, &bg1]);
        }
        Ok(())
    }

    fn emit_post_build_info(
        &self,
        rec: &mut wgpu::CommandEncoder,
        args: &PostBuildInfoArgs<'_>,
    ) -> BuildResult<()> {
        if args.dest.size < args.sources.len() as u64 * 8 {
            return Err(BuildError::invalid(
                "post-build info destination is too small for all sources",
            ));
        }
        for (i, &source) in args.sources.iter().enumerate() {
            let mut slots = SlotMap::new();
            let src = slots.locate(&self.table, source)?;
            let dest = slots.locate(&self.table, args.dest.start + i as u64 * 8)?;
            let slot_buffers = slots.into_slots(&self.placeholder);

            let params = PostBuildParams {
                src_loc: src.loc,
                src_buf: src.buf,
                dest_loc: dest.loc,
                dest_buf: dest.buf,
            };
            let uniforms = self.uniforms("bvh-post-build-uniforms", params);
            let bg0 = self.uniform_group(&self.pipelines.post_build, &uniforms);
            let bg1 = self.slots_group(&self.pipelines.post_build, &slot_buffers, false);
            self.dispatch(rec, "bvh-post-build-info", &self.pipelines.post_build, 1, &[&bg0, &bg1]);
        }
        Ok(())
    }
}

impl GpuPassSuite {
    /// Read-only source bindings of the geometry-load kernels; absent
    /// sources fall back to the placeholder buffer.
    fn sources_group(
        &self,
        pipeline: &wgpu::ComputePipeline,
        sources: [Option<Arc<wgpu::Buffer>>; 3],
    ) -> BuildResult<wgpu::BindGroup> {
        let entries: Vec<wgpu::BindGroupEntry> = sources
            .iter()
            .enumerate()
            .map(|(i, source)| wgpu::BindGroupEntry {
                binding: i as u32,
                resource: source
                    .as_ref()
                    .unwrap_or(&self.placeholder)
                    .as_entire_binding(),
            })
            .collect();
        Ok(self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("bvh-pass-sources"),
            layout: &pipeline.get_bind_group_layout(2),
            entries: &entries,
        }))
    }
}

// Keep the uniform block sizes in sync with the WGSL declarations.
const _: () = {
    assert!(size_of::<SceneAabbParams>() == 48);
    assert!(size_of::<MortonParams>() == 48);
    assert!(size_of::<SortParams>() == 32);
    assert!(size_of::<RearrangeParams>() == 80);
    assert!(size_of::<HierarchyParams>() == 32);
    assert!(size_of::<TreeletParams>() == 48);
    assert!(size_of::<ConstructAabbParams>() == 80);
    assert!(size_of::<LoadPrimitivesParams>() == 80);
    assert!(size_of::<LoadInstancesParams>() == 48);
    assert!(size_of::<CopyParams>() == 32);
    assert!(size_of::<PostBuildParams>() == 16);
};
