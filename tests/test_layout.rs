// tests/test_layout.rs
// Tests for the scratch partition and result-buffer offset formulas.
// This file exists to validate sizing monotonicity, node accounting, and the documented result ABI.
// RELEVANT FILES:src/layout.rs,src/desc.rs,src/builder.rs

use anyhow::Result;
use gpu_bvh2::desc::{
    AccelKind, BuildFlags, BuildInput, GeometryDesc, GeometryFlags, IndexFormat, Level,
    VertexFormat,
};
use gpu_bvh2::layout;
use gpu_bvh2::passes::reference::ReferencePasses;
use gpu_bvh2::Bvh2Builder;

fn triangle_geometry(triangles: u32) -> GeometryDesc {
    GeometryDesc {
        vertex_buffer: 0x1000,
        vertex_count: triangles * 3,
        vertex_stride: 12,
        vertex_format: VertexFormat::Float32x3,
        index_buffer: 0,
        index_count: 0,
        index_format: IndexFormat::None,
        transform: 0,
        flags: GeometryFlags::empty(),
    }
}

fn blas_input(triangles: u32) -> BuildInput {
    BuildInput::Triangles {
        geometries: vec![triangle_geometry(triangles)],
    }
}

#[test]
fn scratch_size_is_monotonic() {
    for level in [Level::Bottom, Level::Top] {
        let mut previous = 0u64;
        for n in 0..300u32 {
            let size = layout::scratch_layout(level, n).total_size;
            assert!(
                size >= previous,
                "scratch size shrank from {previous} to {size} at n={n}"
            );
            previous = size;
        }
    }
}

#[test]
fn result_size_grows_by_two_nodes_and_one_leaf() {
    // Adding one leaf adds one internal node, one leaf node, and one leaf
    // record.
    for n in 1..200u32 {
        let blas = layout::result_size(AccelKind::BottomLevel, n + 1, false)
            - layout::result_size(AccelKind::BottomLevel, n, false);
        assert_eq!(blas, 2 * 32 + 40 + 12);

        let tlas = layout::result_size(AccelKind::TopLevel, n + 1, false)
            - layout::result_size(AccelKind::TopLevel, n, false);
        assert_eq!(tlas, 2 * 32 + 64);
    }
}

#[test]
fn empty_blas_prebuild_is_header_only() {
    let mut builder = Bvh2Builder::new(ReferencePasses::new());
    let info = builder.prebuild_info(BuildFlags::empty(), &blas_input(0));

    assert_eq!(info.result_data_max_size, 16);
    assert!(info.scratch_data_size >= 24);
    assert_eq!(info.update_scratch_data_size, 0);
}

#[test]
fn tlas_prebuild_sizes_for_two_instances() {
    let mut builder = Bvh2Builder::new(ReferencePasses::new());
    let input = BuildInput::Instances {
        descs: 0x4000,
        layout: gpu_bvh2::desc::DescsLayout::Array,
        count: 2,
    };

    let info = builder.prebuild_info(BuildFlags::empty(), &input);
    assert_eq!(info.result_data_max_size, 16 + 3 * 32 + 2 * 64);
    assert_eq!(info.update_scratch_data_size, 0);

    // Updatable top-level structures mirror the bottom-level accounting:
    // a saved index per leaf plus a parent index per node.
    let info = builder.prebuild_info(BuildFlags::ALLOW_UPDATE, &input);
    assert_eq!(
        info.result_data_max_size,
        16 + 3 * 32 + 2 * 64 + 2 * 4 + 3 * 4
    );
}

#[test]
fn update_arrays_sit_at_documented_offsets() {
    // Two-triangle bottom level with updates allowed: 2 sorted indices and
    // 3 parent indices trail the compact structure.
    let n = 2u32;
    let compact = layout::compacted_result_size(AccelKind::BottomLevel, n);
    assert_eq!(compact, 16 + 3 * 32 + 2 * 40 + 2 * 12);
    assert_eq!(layout::offset_to_sorted_indices(AccelKind::BottomLevel, n), compact);
    assert_eq!(layout::offset_from_sorted_indices_to_parents(n), 8);
    assert_eq!(
        layout::result_size(AccelKind::BottomLevel, n, true),
        compact + 2 * 4 + 3 * 4
    );
}

#[test]
fn prebuild_latches_update_allowed() -> Result<()> {
    let mut builder = Bvh2Builder::new(ReferencePasses::new());
    assert!(!builder.update_allowed());

    builder.prebuild_info(BuildFlags::ALLOW_UPDATE, &blas_input(4));
    assert!(builder.update_allowed());

    // Only the most recent prebuild counts.
    builder.prebuild_info(BuildFlags::empty(), &blas_input(4));
    assert!(!builder.update_allowed());
    Ok(())
}

#[test]
fn prebuild_sums_triangles_across_geometries() {
    let mut builder = Bvh2Builder::new(ReferencePasses::new());
    let input = BuildInput::Triangles {
        geometries: vec![triangle_geometry(3), triangle_geometry(5)],
    };
    let info = builder.prebuild_info(BuildFlags::empty(), &input);
    assert_eq!(
        info.result_data_max_size,
        layout::result_size(AccelKind::BottomLevel, 8, false)
    );
}

#[test]
fn scratch_aliases_are_structured_as_documented() {
    for n in [2u32, 5, 64, 100] {
        let l = layout::scratch_layout(Level::Bottom, n);
        // The reduction scratch aliases the Morton/index pair.
        assert_eq!(l.offset_to_scene_aabb_scratch, l.offset_to_morton_codes);
        // The refit overlay starts at the base of scratch.
        assert_eq!(l.offset_to_calc_aabb_dispatch_args, 0);
        // The hierarchy is the last region and never aliases.
        assert!(l.offset_to_hierarchy >= l.offset_to_index_buffer + 4 * n as u64);
        assert_eq!(
            l.total_size,
            l.offset_to_hierarchy + layout::align4(12 * (2 * n as u64 - 1))
        );
    }
}
