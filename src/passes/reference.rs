// src/passes/reference.rs
// Host-memory reference implementation of every pass contract.
// This file exists so builds can be executed and observed end-to-end without a GPU adapter,
// the same role the CPU SAH builder plays next to the GPU LBVH builder.
// RELEVANT FILES:src/passes/mod.rs,src/passes/gpu.rs,src/builder.rs,src/layout.rs

use bytemuck::Pod;
use glam::Vec3;

use crate::desc::{AccelKind, CopyMode, DescsLayout, GpuVa, IndexFormat, SceneKind, VertexFormat};
use crate::desc::BuildFlags;
use crate::error::{BuildError, BuildResult};
use crate::layout::{
    compacted_result_size, num_internal_nodes, offset_from_leaf_nodes_to_metadata,
    offset_from_primitives_to_metadata, offset_to_leaf_node_aabbs, offset_to_primitives,
    result_size, total_num_nodes, RESULT_HEADER_SIZE,
};
use crate::passes::{
    ConstructAabbArgs, ConstructHierarchyArgs, CopyArgs, LoadInstancesArgs, LoadPrimitivesArgs,
    MortonArgs, PassSuite, PostBuildInfoArgs, RearrangeArgs, SceneAabbArgs, SortArgs,
    TreeletReorderArgs, SCENE_AABB_GROUP_SIZE,
};
use crate::types::{
    transform_point, Aabb, AabbNode, BvhMetadata, BvhOffsets, HierarchyNode, InstanceDesc,
    Primitive, PrimitiveMetaData, INVALID_NODE,
};

/// Flat host-side stand-in for GPU memory: a set of non-overlapping
/// address-tagged byte regions.
#[derive(Debug, Default)]
pub struct HostMemory {
    regions: Vec<HostRegion>,
}

#[derive(Debug)]
struct HostRegion {
    start: GpuVa,
    bytes: Vec<u8>,
}

impl HostMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a zero-filled region at `start`.
    pub fn add_region(&mut self, start: GpuVa, size: u64) -> BuildResult<()> {
        if start == 0 {
            return Err(BuildError::invalid("cannot place a region at address 0"));
        }
        let end = start
            .checked_add(size)
            .ok_or_else(|| BuildError::internal("region end overflowed"))?;
        for r in &self.regions {
            if start < r.start + r.bytes.len() as u64 && r.start < end {
                return Err(BuildError::invalid(format!(
                    "region {start:#x}+{size} overlaps an existing region"
                )));
            }
        }
        self.regions.push(HostRegion {
            start,
            bytes: vec![0; size as usize],
        });
        Ok(())
    }

    /// Register a region pre-filled with `data`.
    pub fn add_region_with(&mut self, start: GpuVa, data: &[u8]) -> BuildResult<()> {
        self.add_region(start, data.len() as u64)?;
        self.write_bytes(start, data)
    }

    fn slice(&self, va: GpuVa, len: u64) -> BuildResult<&[u8]> {
        for r in &self.regions {
            if va >= r.start && va + len <= r.start + r.bytes.len() as u64 {
                let off = (va - r.start) as usize;
                return Ok(&r.bytes[off..off + len as usize]);
            }
        }
        Err(BuildError::invalid(format!(
            "read of {len} bytes at {va:#x} hits no registered region"
        )))
    }

    fn slice_mut(&mut self, va: GpuVa, len: u64) -> BuildResult<&mut [u8]> {
        for r in &mut self.regions {
            if va >= r.start && va + len <= r.start + r.bytes.len() as u64 {
                let off = (va - r.start) as usize;
                return Ok(&mut r.bytes[off..off + len as usize]);
            }
        }
        Err(BuildError::invalid(format!(
            "write of {len} bytes at {va:#x} hits no registered region"
        )))
    }

    pub fn read_bytes(&self, va: GpuVa, len: u64) -> BuildResult<Vec<u8>> {
        Ok(self.slice(va, len)?.to_vec())
    }

    pub fn write_bytes(&mut self, va: GpuVa, data: &[u8]) -> BuildResult<()> {
        self.slice_mut(va, data.len() as u64)?.copy_from_slice(data);
        Ok(())
    }

    pub fn read_pod<T: Pod>(&self, va: GpuVa) -> BuildResult<T> {
        Ok(bytemuck::pod_read_unaligned(
            self.slice(va, std::mem::size_of::<T>() as u64)?,
        ))
    }

    pub fn write_pod<T: Pod>(&mut self, va: GpuVa, value: &T) -> BuildResult<()> {
        self.write_bytes(va, bytemuck::bytes_of(value))
    }

    pub fn read_pod_slice<T: Pod>(&self, va: GpuVa, count: u64) -> BuildResult<Vec<T>> {
        let bytes = self.slice(va, std::mem::size_of::<T>() as u64 * count)?;
        Ok(bytemuck::pod_collect_to_vec(bytes))
    }

    pub fn write_pod_slice<T: Pod>(&mut self, va: GpuVa, values: &[T]) -> BuildResult<()> {
        self.write_bytes(va, bytemuck::cast_slice(values))
    }

    pub fn read_u32(&self, va: GpuVa) -> BuildResult<u32> {
        self.read_pod(va)
    }

    pub fn write_u32(&mut self, va: GpuVa, value: u32) -> BuildResult<()> {
        self.write_pod(va, &value)
    }
}

/// Pass suite that executes every contract eagerly on a `HostMemory` image.
#[derive(Debug, Default)]
pub struct ReferencePasses;

impl ReferencePasses {
    pub fn new() -> Self {
        Self
    }
}

fn element_aabb(mem: &HostMemory, scene: SceneKind, elements: GpuVa, i: u64) -> BuildResult<Aabb> {
    match scene {
        SceneKind::Triangles => {
            let prim: Primitive = mem.read_pod(elements + i * 40)?;
            Ok(prim.aabb())
        }
        SceneKind::BottomLevelBvhs => {
            let node: AabbNode = mem.read_pod(elements + i * 32)?;
            Ok(node.aabb())
        }
    }
}

fn accel_kind(scene: SceneKind) -> AccelKind {
    match scene {
        SceneKind::Triangles => AccelKind::BottomLevel,
        SceneKind::BottomLevelBvhs => AccelKind::TopLevel,
    }
}

fn union(a: Aabb, b: Aabb) -> Aabb {
    let mut out = a;
    out.expand_aabb(&b);
    out
}

impl PassSuite for ReferencePasses {
    type Recorder = HostMemory;

    fn load_primitives(
        &self,
        mem: &mut HostMemory,
        args: &LoadPrimitivesArgs<'_>,
    ) -> BuildResult<()> {
        let mut written = 0u64;
        for (gi, g) in args.geometries.iter().enumerate() {
            let transform: Option<[f32; 12]> = if g.transform != 0 {
                Some(mem.read_pod(g.transform)?)
            } else {
                None
            };

            for t in 0..g.triangle_count() {
                let mut verts = [[0.0f32; 3]; 3];
                for (k, v) in verts.iter_mut().enumerate() {
                    let vi = match g.index_format {
                        _ if g.index_buffer == 0 => 3 * t + k as u32,
                        IndexFormat::Uint16 => {
                            let raw: u16 =
                                mem.read_pod(g.index_buffer + (3 * t + k as u32) as u64 * 2)?;
                            raw as u32
                        }
                        IndexFormat::Uint32 => {
                            mem.read_pod(g.index_buffer + (3 * t + k as u32) as u64 * 4)?
                        }
                        IndexFormat::None => 3 * t + k as u32,
                    };
                    let base = g.vertex_buffer + vi as u64 * g.vertex_stride;
                    *v = match g.vertex_format {
                        VertexFormat::Float32x3 => mem.read_pod(base)?,
                        VertexFormat::Float32x2 => {
                            let xy: [f32; 2] = mem.read_pod(base)?;
                            [xy[0], xy[1], 0.0]
                        }
                    };
                    if let Some(m) = &transform {
                        *v = transform_point(m, *v);
                    }
                }

                mem.write_pod(
                    args.element_buffer + written * 40,
                    &Primitive::triangle(verts[0], verts[1], verts[2]),
                )?;
                mem.write_pod(
                    args.metadata_buffer + written * 12,
                    &PrimitiveMetaData {
                        geometry_contribution: gi as u32,
                        primitive_index: t,
                        geometry_flags: g.flags.bits(),
                    },
                )?;
                written += 1;
            }
        }

        if args.index_buffer != 0 {
            for i in 0..args.num_elements {
                mem.write_u32(args.index_buffer + i as u64 * 4, i)?;
            }
        }
        Ok(())
    }

    fn load_instances(&self, mem: &mut HostMemory, args: &LoadInstancesArgs) -> BuildResult<()> {
        let n = args.num_elements as u64;
        let metadata_buffer = args.element_buffer + offset_from_leaf_nodes_to_metadata(args.num_elements);

        for i in 0..n {
            let desc_va = match args.layout {
                DescsLayout::Array => args.instance_descs + i * 64,
                DescsLayout::ArrayOfPointers => mem.read_pod::<u64>(args.instance_descs + i * 8)?,
            };
            let desc: InstanceDesc = mem.read_pod(desc_va)?;

            let mut aabb = Aabb::empty();
            if desc.acceleration_structure != 0 {
                let root: AabbNode =
                    mem.read_pod(desc.acceleration_structure + RESULT_HEADER_SIZE)?;
                let b = root.aabb();
                for corner in 0..8u32 {
                    let p = [
                        if corner & 1 != 0 { b.max[0] } else { b.min[0] },
                        if corner & 2 != 0 { b.max[1] } else { b.min[1] },
                        if corner & 4 != 0 { b.max[2] } else { b.min[2] },
                    ];
                    aabb.expand_point(transform_point(&desc.transform, p));
                }
            }

            mem.write_pod(args.element_buffer + i * 32, &AabbNode::leaf(aabb, i as u32))?;
            mem.write_pod(
                metadata_buffer + i * 64,
                &BvhMetadata {
                    object_to_world: desc.transform,
                    instance_id_and_mask: desc.instance_id_and_mask,
                    contribution_and_flags: desc.contribution_and_flags,
                    blas_address: desc.acceleration_structure,
                },
            )?;
        }

        if args.index_buffer != 0 {
            for i in 0..args.num_elements {
                mem.write_u32(args.index_buffer + i as u64 * 4, i)?;
            }
        }
        Ok(())
    }

    fn calculate_scene_aabb(&self, mem: &mut HostMemory, args: &SceneAabbArgs) -> BuildResult<()> {
        let n = args.num_elements as u64;
        let group = SCENE_AABB_GROUP_SIZE as u64;

        // First round: one partial box per workgroup, staged in scratch.
        let groups = n.div_ceil(group).max(1);
        for g in 0..groups {
            let mut partial = Aabb::empty();
            for i in (g * group)..((g + 1) * group).min(n) {
                partial = union(partial, element_aabb(mem, args.scene_kind, args.element_buffer, i)?);
            }
            mem.write_pod(args.scratch + g * 24, &partial)?;
        }

        let mut scene = Aabb::empty();
        for g in 0..groups {
            let partial: Aabb = mem.read_pod(args.scratch + g * 24)?;
            scene = union(scene, partial);
        }
        mem.write_pod(args.scene_aabb, &scene)
    }

    fn calculate_morton_codes(&self, mem: &mut HostMemory, args: &MortonArgs) -> BuildResult<()> {
        let scene: Aabb = mem.read_pod(args.scene_aabb)?;
        let min = Vec3::from_array(scene.min);
        let extent = (Vec3::from_array(scene.max) - min).max(Vec3::splat(1e-6));

        for i in 0..args.num_elements as u64 {
            let aabb = element_aabb(mem, args.scene_kind, args.element_buffer, i)?;
            let centroid = Vec3::from_array(aabb.center());
            let unit = ((centroid - min) / extent).clamp(Vec3::ZERO, Vec3::ONE);
            mem.write_u32(args.morton_codes + i * 4, morton_code(unit))?;
            mem.write_u32(args.index_buffer + i * 4, i as u32)?;
        }
        Ok(())
    }

    fn sort(&self, mem: &mut HostMemory, args: &SortArgs) -> BuildResult<()> {
        let n = args.num_elements as u64;
        let codes: Vec<u32> = mem.read_pod_slice(args.morton_codes, n)?;
        let indices: Vec<u32> = mem.read_pod_slice(args.index_buffer, n)?;

        let mut pairs: Vec<(u32, u32)> = codes.into_iter().zip(indices).collect();
        pairs.sort_by_key(|&(code, _)| code);

        let (codes, indices): (Vec<u32>, Vec<u32>) = pairs.into_iter().unzip();
        mem.write_pod_slice(args.morton_codes, &codes)?;
        mem.write_pod_slice(args.index_buffer, &indices)
    }

    fn rearrange(&self, mem: &mut HostMemory, args: &RearrangeArgs) -> BuildResult<()> {
        let n = args.num_elements as u64;
        let es = crate::layout::element_stride(args.scene_kind);
        let ms = crate::layout::metadata_stride(args.scene_kind);

        for j in 0..n {
            let src = mem.read_u32(args.index_buffer + j * 4)? as u64;
            let element = mem.read_bytes(args.scratch_elements + src * es, es)?;
            mem.write_bytes(args.output_elements + j * es, &element)?;
            let metadata = mem.read_bytes(args.scratch_metadata + src * ms, ms)?;
            mem.write_bytes(args.output_metadata + j * ms, &metadata)?;
            if args.output_sorted_indices != 0 {
                mem.write_u32(args.output_sorted_indices + j * 4, src as u32)?;
            }
        }
        Ok(())
    }

    fn construct_hierarchy(
        &self,
        mem: &mut HostMemory,
        args: &ConstructHierarchyArgs,
    ) -> BuildResult<()> {
        let n = args.num_elements as usize;
        let total = total_num_nodes(args.num_elements) as usize;
        let num_internal = num_internal_nodes(args.num_elements);

        let codes: Vec<u32> = mem.read_pod_slice(args.morton_codes, n as u64)?;
        // Duplicate codes are tie-broken by position so every key is unique.
        let keys: Vec<u64> = codes
            .iter()
            .enumerate()
            .map(|(i, &c)| ((c as u64) << 32) | i as u64)
            .collect();

        let mut nodes = vec![
            HierarchyNode {
                parent: INVALID_NODE,
                left: INVALID_NODE,
                right: INVALID_NODE,
            };
            total
        ];

        let leaf_index = |j: usize| num_internal + j as u32;

        for i in 0..num_internal as usize {
            let (first, last) = radix_tree_range(&keys, i);
            let split = radix_tree_split(&keys, first, last);

            let left = if split == first {
                leaf_index(split)
            } else {
                split as u32
            };
            let right = if split + 1 == last {
                leaf_index(split + 1)
            } else {
                (split + 1) as u32
            };

            nodes[i].left = left;
            nodes[i].right = right;
            nodes[left as usize].parent = i as u32;
            nodes[right as usize].parent = i as u32;
        }

        mem.write_pod_slice(args.hierarchy, &nodes)?;

        if args.parent_indices != 0 {
            let parents: Vec<u32> = nodes.iter().map(|h| h.parent).collect();
            mem.write_pod_slice(args.parent_indices, &parents)?;
        }
        Ok(())
    }

    fn treelet_reorder(&self, mem: &mut HostMemory, args: &TreeletReorderArgs) -> BuildResult<()> {
        // Fast-build hierarchies skip the reorder entirely.
        if args.build_flags.contains(BuildFlags::PREFER_FAST_BUILD) {
            return Ok(());
        }

        let n = args.num_elements as u64;
        let total = total_num_nodes(args.num_elements) as u64;
        let num_internal = total.saturating_sub(n);
        if num_internal == 0 {
            return Ok(());
        }

        let mut nodes: Vec<HierarchyNode> = mem.read_pod_slice(args.hierarchy, total)?;

        // Stage per-node AABBs into the aliased scratch, bottom-up from the
        // leaf primitives.
        let mut boxes = vec![Aabb::empty(); total as usize];
        fill_subtree_boxes(mem, &nodes, &mut boxes, args.element_buffer, num_internal as u32, 0)?;
        for (k, b) in boxes.iter().enumerate() {
            mem.write_pod(args.aabb_scratch + k as u64 * 24, b)?;
        }

        // One SAH-guided rotation sweep: for each internal node, consider
        // swapping one child with a grandchild on the other side.
        let mut rotated = false;
        for v in 0..num_internal as usize {
            let (l, r) = (nodes[v].left as usize, nodes[v].right as usize);
            for (child, other) in [(l, r), (r, l)] {
                if nodes[other].is_leaf() {
                    continue;
                }
                let (gl, gr) = (nodes[other].left as usize, nodes[other].right as usize);
                let current = boxes[other].surface_area();
                let swap_gl = union(boxes[child], boxes[gr]).surface_area();
                let swap_gr = union(boxes[gl], boxes[child]).surface_area();

                let (grand, kept) = if swap_gl < current && swap_gl <= swap_gr {
                    (gl, gr)
                } else if swap_gr < current {
                    (gr, gl)
                } else {
                    continue;
                };

                // child trades places with `grand` under `other`.
                if nodes[v].left as usize == child {
                    nodes[v].left = grand as u32;
                } else {
                    nodes[v].right = grand as u32;
                }
                if nodes[other].left as usize == grand {
                    nodes[other].left = child as u32;
                } else {
                    nodes[other].right = child as u32;
                }
                nodes[grand].parent = v as u32;
                nodes[child].parent = other as u32;
                boxes[other] = union(boxes[child], boxes[kept]);
                mem.write_pod(args.aabb_scratch + other as u64 * 24, &boxes[other])?;
                rotated = true;
                break;
            }
        }

        if rotated {
            mem.write_pod_slice(args.hierarchy, &nodes)?;
            if args.parent_indices != 0 {
                let parents: Vec<u32> = nodes.iter().map(|h| h.parent).collect();
                mem.write_pod_slice(args.parent_indices, &parents)?;
            }
        }
        Ok(())
    }

    fn construct_aabb(&self, mem: &mut HostMemory, args: &ConstructAabbArgs) -> BuildResult<()> {
        let n = args.num_elements;
        let kind = accel_kind(args.scene_kind);
        let total = total_num_nodes(n) as usize;
        let num_internal = num_internal_nodes(n);

        let metadata_offset = match kind {
            AccelKind::BottomLevel => offset_to_primitives(n) + offset_from_primitives_to_metadata(n),
            AccelKind::TopLevel => offset_to_leaf_node_aabbs(n) + offset_from_leaf_nodes_to_metadata(n),
        };
        mem.write_pod(
            args.dest,
            &BvhOffsets {
                offset_to_leaf_nodes: offset_to_leaf_node_aabbs(n) as u32,
                offset_to_metadata: metadata_offset as u32,
                compacted_size: compacted_result_size(kind, n) as u32,
                total_size: result_size(kind, n, args.update_arrays) as u32,
            },
        )?;

        if n == 0 {
            return Ok(());
        }

        let nodes_va = args.dest + RESULT_HEADER_SIZE;
        let mut nodes: Vec<AabbNode> = if args.perform_update {
            // Topology already lives in the destination from the prior build.
            mem.read_pod_slice(nodes_va, total as u64)?
        } else {
            let hier: Vec<HierarchyNode> = mem.read_pod_slice(args.hierarchy, total as u64)?;
            (0..total)
                .map(|k| {
                    if k < num_internal as usize {
                        AabbNode::internal(Aabb::empty(), hier[k].left, hier[k].right)
                    } else {
                        AabbNode::leaf(Aabb::empty(), k as u32 - num_internal)
                    }
                })
                .collect()
        };

        // Leaf boxes come from the (already rearranged) output elements.
        let elements = match kind {
            AccelKind::BottomLevel => args.dest + offset_to_primitives(n),
            AccelKind::TopLevel => args.dest + offset_to_leaf_node_aabbs(n),
        };
        for j in 0..n as u64 {
            let leaf = num_internal as usize + j as usize;
            let aabb = element_aabb(mem, args.scene_kind, elements, j)?;
            nodes[leaf] = AabbNode::leaf(aabb, j as u32);
        }

        // Bottom-up interior fill over the child links, deepest first.
        let mut order: Vec<usize> = Vec::with_capacity(total);
        let mut stack = vec![0usize];
        while let Some(k) = stack.pop() {
            order.push(k);
            if let Some((l, r)) = nodes[k].children() {
                stack.push(l as usize);
                stack.push(r as usize);
            }
        }
        for &k in order.iter().rev() {
            if let Some((l, r)) = nodes[k].children() {
                let aabb = union(nodes[l as usize].aabb(), nodes[r as usize].aabb());
                nodes[k] = AabbNode::internal(aabb, l, r);
            }
        }

        mem.write_pod_slice(nodes_va, &nodes)
    }

    fn copy_acceleration_structure(&self, mem: &mut HostMemory, args: &CopyArgs) -> BuildResult<()> {
        let header: BvhOffsets = mem.read_pod(args.source)?;
        let size = match args.mode {
            CopyMode::Compact => header.compacted_size,
            _ => header.total_size,
        } as u64;
        if args.dest.size < size {
            return Err(BuildError::invalid(format!(
                "copy destination size {} is below the source structure size {size}",
                args.dest.size
            )));
        }

        let bytes = mem.read_bytes(args.source, size)?;
        mem.write_bytes(args.dest.start, &bytes)?;

        if args.mode == CopyMode::Compact {
            // A compacted structure no longer carries the update arrays.
            let mut patched = header;
            patched.total_size = header.compacted_size;
            mem.write_pod(args.dest.start, &patched)?;
        }
        Ok(())
    }

    fn emit_post_build_info(
        &self,
        mem: &mut HostMemory,
        args: &PostBuildInfoArgs<'_>,
    ) -> BuildResult<()> {
        if args.dest.size < args.sources.len() as u64 * 8 {
            return Err(BuildError::invalid(
                "post-build info destination is too small for all sources",
            ));
        }
        for (i, &src) in args.sources.iter().enumerate() {
            let header: BvhOffsets = mem.read_pod(src)?;
            mem.write_pod(args.dest.start + i as u64 * 8, &(header.compacted_size as u64))?;
        }
        Ok(())
    }
}

/// 30-bit Morton code of a point in the unit cube.
fn morton_code(unit: Vec3) -> u32 {
    let q = |f: f32| (f * 1023.0) as u32;
    (expand_bits(q(unit.x)) << 2) | (expand_bits(q(unit.y)) << 1) | expand_bits(q(unit.z))
}

fn expand_bits(mut v: u32) -> u32 {
    v = (v.wrapping_mul(0x0001_0001)) & 0xFF00_00FF;
    v = (v.wrapping_mul(0x0000_0101)) & 0x0F00_F00F;
    v = (v.wrapping_mul(0x0000_0011)) & 0xC30C_30C3;
    v = (v.wrapping_mul(0x0000_0005)) & 0x4924_9249;
    v
}

fn key_delta(keys: &[u64], i: i64, j: i64) -> i64 {
    if j < 0 || j >= keys.len() as i64 {
        return -1;
    }
    (keys[i as usize] ^ keys[j as usize]).leading_zeros() as i64
}

/// Range of sorted keys covered by internal radix-tree node `i`.
fn radix_tree_range(keys: &[u64], i: usize) -> (usize, usize) {
    let i = i as i64;
    let d = (key_delta(keys, i, i + 1) - key_delta(keys, i, i - 1)).signum();
    let delta_min = key_delta(keys, i, i - d);

    let mut l_max: i64 = 2;
    while key_delta(keys, i, i + l_max * d) > delta_min {
        l_max *= 2;
    }

    let mut l: i64 = 0;
    let mut t = l_max / 2;
    while t >= 1 {
        if key_delta(keys, i, i + (l + t) * d) > delta_min {
            l += t;
        }
        t /= 2;
    }

    let j = i + l * d;
    (i.min(j) as usize, i.max(j) as usize)
}

/// Highest-differing-bit split position inside `[first, last]`.
fn radix_tree_split(keys: &[u64], first: usize, last: usize) -> usize {
    let common = (keys[first] ^ keys[last]).leading_zeros();
    let mut split = first;
    let mut step = last - first;
    loop {
        step = (step + 1) / 2;
        let candidate = split + step;
        if candidate < last && (keys[first] ^ keys[candidate]).leading_zeros() > common {
            split = candidate;
        }
        if step <= 1 {
            break;
        }
    }
    split
}

/// Compute subtree AABBs for every hierarchy node under `root` from the
/// rearranged triangle buffer.
fn fill_subtree_boxes(
    mem: &HostMemory,
    nodes: &[HierarchyNode],
    boxes: &mut [Aabb],
    elements: GpuVa,
    num_internal: u32,
    root: usize,
) -> BuildResult<()> {
    let mut order = Vec::with_capacity(nodes.len());
    let mut stack = vec![root];
    while let Some(k) = stack.pop() {
        order.push(k);
        if !nodes[k].is_leaf() {
            stack.push(nodes[k].left as usize);
            stack.push(nodes[k].right as usize);
        }
    }
    for &k in order.iter().rev() {
        boxes[k] = if nodes[k].is_leaf() {
            let prim: Primitive = mem.read_pod(elements + (k as u32 - num_internal) as u64 * 40)?;
            prim.aabb()
        } else {
            union(boxes[nodes[k].left as usize], boxes[nodes[k].right as usize])
        };
    }
    Ok(())
}
