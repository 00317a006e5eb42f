// tests/test_reference_build.rs
// End-to-end builds executed on the host reference pass suite.
// This file exists to observe real build output: headers, node boxes, update round trips, copies.
// RELEVANT FILES:src/passes/reference.rs,src/builder.rs,src/layout.rs

use anyhow::Result;
use gpu_bvh2::desc::{
    AccelKind, BuildDesc, BuildFlags, BuildInput, CopyMode, DescsLayout, GeometryDesc,
    GeometryFlags, GpuVaRange, IndexFormat, VertexFormat,
};
use gpu_bvh2::layout;
use gpu_bvh2::types::{
    identity_transform, AabbNode, BvhMetadata, BvhOffsets, InstanceDesc, Primitive,
    PrimitiveMetaData, INVALID_NODE,
};
use gpu_bvh2::{Bvh2Builder, HostMemory, ReferencePasses};

const VB: u64 = 0x1000;
const DEST: u64 = 0x10_0000;
const SCRATCH: u64 = 0x80_0000;

type Triangle = [[f32; 3]; 3];

fn vertex_bytes(triangles: &[Triangle]) -> Vec<u8> {
    let floats: Vec<f32> = triangles.iter().flatten().flatten().copied().collect();
    bytemuck::cast_slice(&floats).to_vec()
}

fn blas_input(vertex_buffer: u64, triangles: u32) -> BuildInput {
    BuildInput::Triangles {
        geometries: vec![GeometryDesc {
            vertex_buffer,
            vertex_count: triangles * 3,
            vertex_stride: 12,
            vertex_format: VertexFormat::Float32x3,
            index_buffer: 0,
            index_count: 0,
            index_format: IndexFormat::None,
            transform: 0,
            flags: GeometryFlags::OPAQUE,
        }],
    }
}

/// Register ranges, run prebuild + build, and return the descriptor used.
fn build_blas(
    mem: &mut HostMemory,
    builder: &mut Bvh2Builder<ReferencePasses>,
    triangles: &[Triangle],
    flags: BuildFlags,
    dest: u64,
    scratch: u64,
) -> Result<BuildDesc> {
    mem.add_region_with(VB, &vertex_bytes(triangles))?;
    let input = blas_input(VB, triangles.len() as u32);
    let info = builder.prebuild_info(flags, &input);
    mem.add_region(dest, info.result_data_max_size)?;
    mem.add_region(scratch, info.scratch_data_size)?;

    let desc = BuildDesc {
        flags,
        input,
        dest: GpuVaRange::new(dest, info.result_data_max_size),
        scratch: GpuVaRange::new(scratch, info.scratch_data_size),
    };
    builder.build(mem, &desc)?;
    Ok(desc)
}

fn unit_cube() -> Vec<Triangle> {
    vec![
        [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [1.0, 1.0, 0.0]],
        [[0.0, 0.0, 0.0], [1.0, 1.0, 0.0], [0.0, 1.0, 0.0]],
        [[0.0, 0.0, 1.0], [1.0, 1.0, 1.0], [1.0, 0.0, 1.0]],
        [[0.0, 0.0, 1.0], [0.0, 1.0, 1.0], [1.0, 1.0, 1.0]],
        [[0.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 1.0, 1.0]],
        [[0.0, 0.0, 0.0], [0.0, 1.0, 1.0], [0.0, 0.0, 1.0]],
        [[1.0, 0.0, 0.0], [1.0, 1.0, 1.0], [1.0, 1.0, 0.0]],
        [[1.0, 0.0, 0.0], [1.0, 0.0, 1.0], [1.0, 1.0, 1.0]],
        [[0.0, 1.0, 0.0], [1.0, 1.0, 0.0], [1.0, 1.0, 1.0]],
        [[0.0, 1.0, 0.0], [1.0, 1.0, 1.0], [0.0, 1.0, 1.0]],
        [[0.0, 0.0, 0.0], [1.0, 0.0, 1.0], [1.0, 0.0, 0.0]],
        [[0.0, 0.0, 0.0], [0.0, 0.0, 1.0], [1.0, 0.0, 1.0]],
    ]
}

fn read_node(mem: &HostMemory, dest: u64, index: u32) -> AabbNode {
    mem.read_pod(dest + 16 + index as u64 * 32).unwrap()
}

#[test]
fn empty_blas_still_emits_a_valid_header() -> Result<()> {
    let mut mem = HostMemory::new();
    let mut builder = Bvh2Builder::new(ReferencePasses::new());
    build_blas(&mut mem, &mut builder, &[], BuildFlags::empty(), DEST, SCRATCH)?;

    let header: BvhOffsets = mem.read_pod(DEST)?;
    assert_eq!(header.offset_to_leaf_nodes, 16);
    assert_eq!(header.compacted_size, 16);
    assert_eq!(header.total_size, 16);
    Ok(())
}

#[test]
fn single_triangle_leaf_encloses_its_vertices() -> Result<()> {
    let mut mem = HostMemory::new();
    let mut builder = Bvh2Builder::new(ReferencePasses::new());
    let triangle: Triangle = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]];
    build_blas(&mut mem, &mut builder, &[triangle], BuildFlags::empty(), DEST, SCRATCH)?;

    let header: BvhOffsets = mem.read_pod(DEST)?;
    // One leaf, zero internal nodes: the root is the leaf.
    assert_eq!(header.offset_to_leaf_nodes, 16);
    assert_eq!(header.compacted_size as u64, 16 + 32 + 40 + 12);

    let root = read_node(&mem, DEST, 0);
    assert!(root.is_leaf());
    assert_eq!(root.left_or_first, 0);
    assert_eq!(root.min, [0.0, 0.0, 0.0]);
    assert_eq!(root.max, [1.0, 1.0, 0.0]);

    let prim: Primitive = mem.read_pod(DEST + layout::offset_to_primitives(1))?;
    assert_eq!(prim.v0, triangle[0]);

    let meta: PrimitiveMetaData = mem.read_pod(
        DEST + layout::offset_to_primitives(1) + layout::offset_from_primitives_to_metadata(1),
    )?;
    assert_eq!(meta.primitive_index, 0);
    assert_eq!(meta.geometry_flags, GeometryFlags::OPAQUE.bits());
    Ok(())
}

#[test]
fn cube_build_produces_a_well_formed_tree() -> Result<()> {
    let mut mem = HostMemory::new();
    let mut builder = Bvh2Builder::new(ReferencePasses::new());
    let triangles = unit_cube();
    build_blas(&mut mem, &mut builder, &triangles, BuildFlags::empty(), DEST, SCRATCH)?;

    let n = triangles.len() as u32;
    let root = read_node(&mem, DEST, 0);
    assert_eq!(root.min, [0.0, 0.0, 0.0]);
    assert_eq!(root.max, [1.0, 1.0, 1.0]);

    // Walk the tree: every node must be visited exactly once, parents must
    // enclose children, and the leaves must cover every primitive.
    let total = layout::total_num_nodes(n);
    let mut visited = vec![false; total as usize];
    let mut primitive_seen = vec![false; n as usize];
    let mut stack = vec![0u32];
    while let Some(k) = stack.pop() {
        assert!(!visited[k as usize], "node {k} reached twice");
        visited[k as usize] = true;
        let node = read_node(&mem, DEST, k);
        assert!(node.aabb().is_valid());
        if let Some((l, r)) = node.children() {
            for child in [l, r] {
                let c = read_node(&mem, DEST, child);
                for axis in 0..3 {
                    assert!(node.min[axis] <= c.min[axis]);
                    assert!(node.max[axis] >= c.max[axis]);
                }
                stack.push(child);
            }
        } else {
            let element = node.left_or_first;
            let meta: PrimitiveMetaData = mem.read_pod(
                DEST + layout::offset_to_primitives(n)
                    + layout::offset_from_primitives_to_metadata(n)
                    + element as u64 * 12,
            )?;
            assert!(!primitive_seen[meta.primitive_index as usize]);
            primitive_seen[meta.primitive_index as usize] = true;
        }
    }
    assert!(visited.iter().all(|&v| v), "unreachable nodes in the tree");
    assert!(primitive_seen.iter().all(|&v| v), "missing primitives");

    println!("Cube build: {} nodes over {} triangles", total, n);
    Ok(())
}

#[test]
fn update_arrays_persist_and_refit_follows_moved_vertices() -> Result<()> {
    let mut mem = HostMemory::new();
    let mut builder = Bvh2Builder::new(ReferencePasses::new());
    let triangles: Vec<Triangle> = vec![
        [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
        [[3.0, 0.0, 0.0], [4.0, 0.0, 0.0], [3.0, 1.0, 0.0]],
    ];
    let flags = BuildFlags::ALLOW_UPDATE;
    let desc = build_blas(&mut mem, &mut builder, &triangles, flags, DEST, SCRATCH)?;

    // Persisted update arrays at their documented offsets.
    let n = 2u32;
    let sorted_at = DEST + layout::offset_to_sorted_indices(AccelKind::BottomLevel, n);
    let mut sorted: Vec<u32> = mem.read_pod_slice(sorted_at, n as u64)?;
    sorted.sort_unstable();
    assert_eq!(sorted, vec![0, 1]);

    let parents_at = sorted_at + layout::offset_from_sorted_indices_to_parents(n);
    let parents: Vec<u32> = mem.read_pod_slice(parents_at, 3)?;
    assert_eq!(parents[0], INVALID_NODE);
    assert_eq!(&parents[1..], &[0, 0]);

    let links_before: Vec<u32> = (0..3)
        .flat_map(|k| {
            let node = read_node(&mem, DEST, k);
            [node.left_or_first, node.flags_and_right]
        })
        .collect();

    // Move everything up by one unit and update in place.
    let moved: Vec<Triangle> = triangles
        .iter()
        .map(|t| t.map(|v| [v[0], v[1] + 1.0, v[2]]))
        .collect();
    mem.write_bytes(VB, &vertex_bytes(&moved))?;

    let update = BuildDesc {
        flags: BuildFlags::ALLOW_UPDATE | BuildFlags::PERFORM_UPDATE,
        ..desc.clone()
    };
    builder.build(&mut mem, &update)?;

    let root = read_node(&mem, DEST, 0);
    assert_eq!(root.min, [0.0, 1.0, 0.0]);
    assert_eq!(root.max, [4.0, 2.0, 0.0]);

    // Topology is untouched by a refit.
    let links_after: Vec<u32> = (0..3)
        .flat_map(|k| {
            let node = read_node(&mem, DEST, k);
            [node.left_or_first, node.flags_and_right]
        })
        .collect();
    assert_eq!(links_before, links_after);

    // Each leaf box matches its element exactly.
    for leaf in 1..3 {
        let node = read_node(&mem, DEST, leaf);
        let prim: Primitive = mem.read_pod(
            DEST + layout::offset_to_primitives(n) + node.left_or_first as u64 * 40,
        )?;
        assert_eq!(node.aabb(), prim.aabb());
    }
    Ok(())
}

#[test]
fn refit_is_idempotent() -> Result<()> {
    let mut mem = HostMemory::new();
    let mut builder = Bvh2Builder::new(ReferencePasses::new());
    let triangles = unit_cube();
    let desc = build_blas(
        &mut mem,
        &mut builder,
        &triangles,
        BuildFlags::ALLOW_UPDATE,
        DEST,
        SCRATCH,
    )?;

    let update = BuildDesc {
        flags: BuildFlags::ALLOW_UPDATE | BuildFlags::PERFORM_UPDATE,
        ..desc
    };
    builder.build(&mut mem, &update)?;
    let nodes = 2 * triangles.len() as u64 - 1;
    let first = mem.read_bytes(DEST + 16, nodes * 32)?;

    builder.build(&mut mem, &update)?;
    let second = mem.read_bytes(DEST + 16, nodes * 32)?;
    assert_eq!(first, second, "repeated refit changed node bytes");
    Ok(())
}

#[test]
fn top_level_build_over_two_bottom_levels() -> Result<()> {
    const BLAS_A_DEST: u64 = 0x20_0000;
    const BLAS_B_DEST: u64 = 0x30_0000;
    const BLAS_SCRATCH: u64 = 0x90_0000;
    const INSTANCES: u64 = 0x4000;

    let mut mem = HostMemory::new();
    let mut builder = Bvh2Builder::new(ReferencePasses::new());

    // Two single-triangle bottom levels sharing one vertex buffer.
    let triangle: Triangle = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]];
    mem.add_region_with(VB, &vertex_bytes(&[triangle]))?;
    let input = blas_input(VB, 1);
    let info = builder.prebuild_info(BuildFlags::empty(), &input);
    mem.add_region(BLAS_SCRATCH, info.scratch_data_size)?;
    for dest in [BLAS_A_DEST, BLAS_B_DEST] {
        mem.add_region(dest, info.result_data_max_size)?;
        builder.build(
            &mut mem,
            &BuildDesc {
                flags: BuildFlags::empty(),
                input: input.clone(),
                dest: GpuVaRange::new(dest, info.result_data_max_size),
                scratch: GpuVaRange::new(BLAS_SCRATCH, info.scratch_data_size),
            },
        )?;
    }

    // Instance A at the origin, instance B translated along x.
    let mut shifted = identity_transform();
    shifted[3] = 5.0;
    let instances = [
        InstanceDesc {
            transform: identity_transform(),
            instance_id_and_mask: 1 | (0xFF << 24),
            contribution_and_flags: 0,
            acceleration_structure: BLAS_A_DEST,
        },
        InstanceDesc {
            transform: shifted,
            instance_id_and_mask: 2 | (0xFF << 24),
            contribution_and_flags: 0,
            acceleration_structure: BLAS_B_DEST,
        },
    ];
    mem.add_region_with(INSTANCES, bytemuck::cast_slice(&instances))?;

    let tlas_input = BuildInput::Instances {
        descs: INSTANCES,
        layout: DescsLayout::Array,
        count: 2,
    };
    let info = builder.prebuild_info(BuildFlags::empty(), &tlas_input);
    assert_eq!(info.result_data_max_size, 16 + 3 * 32 + 2 * 64);

    mem.add_region(DEST, info.result_data_max_size)?;
    mem.add_region(SCRATCH, info.scratch_data_size)?;
    builder.build(
        &mut mem,
        &BuildDesc {
            flags: BuildFlags::empty(),
            input: tlas_input,
            dest: GpuVaRange::new(DEST, info.result_data_max_size),
            scratch: GpuVaRange::new(SCRATCH, info.scratch_data_size),
        },
    )?;

    let root = read_node(&mem, DEST, 0);
    assert_eq!(root.min, [0.0, 0.0, 0.0]);
    assert_eq!(root.max, [6.0, 1.0, 0.0]);

    // The two leaves carry the transformed bottom-level boxes.
    let leaf_boxes: Vec<[f32; 3]> = (1..3).map(|k| read_node(&mem, DEST, k).min).collect();
    assert!(leaf_boxes.contains(&[0.0, 0.0, 0.0]));
    assert!(leaf_boxes.contains(&[5.0, 0.0, 0.0]));

    // Metadata lands after the node array and references both structures.
    let metadata_at = DEST + layout::offset_to_leaf_node_aabbs(2)
        + layout::offset_from_leaf_nodes_to_metadata(2);
    let metadata: Vec<BvhMetadata> = mem.read_pod_slice(metadata_at, 2)?;
    let mut blas: Vec<u64> = metadata.iter().map(|m| m.blas_address).collect();
    blas.sort_unstable();
    assert_eq!(blas, vec![BLAS_A_DEST, BLAS_B_DEST]);
    Ok(())
}

#[test]
fn clone_and_compact_copies() -> Result<()> {
    const CLONE_DEST: u64 = 0x40_0000;
    const COMPACT_DEST: u64 = 0x50_0000;
    const INFO_DEST: u64 = 0x60_0000;

    let mut mem = HostMemory::new();
    let mut builder = Bvh2Builder::new(ReferencePasses::new());
    build_blas(
        &mut mem,
        &mut builder,
        &unit_cube(),
        BuildFlags::ALLOW_UPDATE | BuildFlags::ALLOW_COMPACTION,
        DEST,
        SCRATCH,
    )?;

    let header: BvhOffsets = mem.read_pod(DEST)?;
    assert!(header.total_size > header.compacted_size);

    mem.add_region(CLONE_DEST, header.total_size as u64)?;
    builder.copy(
        &mut mem,
        GpuVaRange::new(CLONE_DEST, header.total_size as u64),
        DEST,
        CopyMode::Clone,
    )?;
    assert_eq!(
        mem.read_bytes(DEST, header.total_size as u64)?,
        mem.read_bytes(CLONE_DEST, header.total_size as u64)?
    );

    mem.add_region(COMPACT_DEST, header.compacted_size as u64)?;
    builder.copy(
        &mut mem,
        GpuVaRange::new(COMPACT_DEST, header.compacted_size as u64),
        DEST,
        CopyMode::Compact,
    )?;
    let compacted: BvhOffsets = mem.read_pod(COMPACT_DEST)?;
    assert_eq!(compacted.total_size, header.compacted_size);
    // Node payload survives compaction byte for byte.
    assert_eq!(
        mem.read_bytes(DEST + 16, 23 * 32)?,
        mem.read_bytes(COMPACT_DEST + 16, 23 * 32)?
    );

    mem.add_region(INFO_DEST, 16)?;
    builder.emit_post_build_info(
        &mut mem,
        GpuVaRange::new(INFO_DEST, 16),
        &[DEST, COMPACT_DEST],
    )?;
    let sizes: Vec<u64> = mem.read_pod_slice(INFO_DEST, 2)?;
    assert_eq!(sizes[0], header.compacted_size as u64);
    assert_eq!(sizes[1], header.compacted_size as u64);
    Ok(())
}
