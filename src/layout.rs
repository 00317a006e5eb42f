// src/layout.rs
// Scratch-memory partitioning and result-buffer offset formulas for the two-level BVH.
// This file exists to keep every byte-offset decision (including which scratch regions may alias) in one place.
// RELEVANT FILES:src/types.rs,src/desc.rs,src/builder.rs,src/passes/mod.rs

use std::mem::size_of;

use crate::desc::{AccelKind, Level, SceneKind};
use crate::passes::{scene_aabb_scratch_size, treelet_aabb_buffer_size};
use crate::types::{Aabb, AabbNode, BvhMetadata, BvhOffsets, HierarchyNode, Primitive, PrimitiveMetaData};

/// Size of the fixed result-buffer header.
pub const RESULT_HEADER_SIZE: u64 = size_of::<BvhOffsets>() as u64;

/// Round up to the 4-byte GPU offset alignment.
pub fn align4(n: u64) -> u64 {
    (n + 3) & !3
}

/// A full binary tree with N leaves has N - 1 internal nodes.
pub fn num_internal_nodes(num_leaves: u32) -> u32 {
    num_leaves.saturating_sub(1)
}

pub fn total_num_nodes(num_leaves: u32) -> u32 {
    num_leaves + num_internal_nodes(num_leaves)
}

/// Byte stride of one leaf element record.
pub fn element_stride(scene: SceneKind) -> u64 {
    match scene {
        SceneKind::Triangles => size_of::<Primitive>() as u64,
        SceneKind::BottomLevelBvhs => size_of::<AabbNode>() as u64,
    }
}

/// Byte stride of one leaf metadata record.
pub fn metadata_stride(scene: SceneKind) -> u64 {
    match scene {
        SceneKind::Triangles => size_of::<PrimitiveMetaData>() as u64,
        SceneKind::BottomLevelBvhs => size_of::<BvhMetadata>() as u64,
    }
}

fn scene_kind_of(level: Level) -> SceneKind {
    match level {
        Level::Bottom => SceneKind::Triangles,
        Level::Top => SceneKind::BottomLevelBvhs,
    }
}

/// Byte offsets of every scratch region used by one build, plus the total
/// scratch size. All offsets are relative to the start of the scratch range
/// and 4-byte aligned.
///
/// Aliasing is deliberate and time-disjoint:
/// - `scene_aabb_scratch` shares bytes with `morton_codes`/`index_buffer`
///   (the scene-AABB reduction finishes before Morton codes are written) and
///   with the treelet-reorder AABB buffer (which runs after sorting is done
///   with both).
/// - `calc_aabb_dispatch_args`/`per_node_counter` overlay the start of
///   scratch (`scene_aabb` and the element staging area), which the final
///   refit phase no longer reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScratchLayout {
    pub offset_to_scene_aabb: u64,
    pub offset_to_elements: u64,
    pub offset_to_morton_codes: u64,
    pub offset_to_index_buffer: u64,
    pub offset_to_scene_aabb_scratch: u64,
    pub offset_to_calc_aabb_dispatch_args: u64,
    pub offset_to_per_node_counter: u64,
    pub offset_to_hierarchy: u64,
    pub total_size: u64,
}

/// Compute the scratch partition for `num_elements` leaves at `level`.
pub fn scratch_layout(level: Level, num_elements: u32) -> ScratchLayout {
    let n = num_elements as u64;
    let num_internal = num_internal_nodes(num_elements) as u64;
    let total_nodes = total_num_nodes(num_elements) as u64;
    let scene = scene_kind_of(level);

    let mut total_size = 0u64;

    let offset_to_scene_aabb = total_size;
    total_size += align4(size_of::<Aabb>() as u64);

    let per_element = element_stride(scene) + metadata_stride(scene);
    let offset_to_elements = total_size;
    total_size += align4(per_element * n);

    let morton_code_size = align4(4 * n);
    let index_buffer_size = align4(4 * n);
    let offset_to_morton_codes = total_size;
    let offset_to_index_buffer = offset_to_morton_codes + morton_code_size;

    // The scene-AABB reduction scratch aliases over the Morton/index pair
    // because it is consumed before either is written. The treelet-reorder
    // AABB buffer runs after both are dead, so it aliases here too. One
    // append sized for the largest of the three covers all of them.
    let offset_to_scene_aabb_scratch = offset_to_morton_codes;
    let extra = scene_aabb_scratch_size(num_elements)
        .max(treelet_aabb_buffer_size(num_elements))
        .max(morton_code_size + index_buffer_size);
    total_size += extra;

    // The refit phase overlays the front of scratch, which it never reads:
    // indirect-dispatch arguments at offset 0, then one counter per
    // internal node.
    let mut overlay = 0u64;
    let offset_to_calc_aabb_dispatch_args = overlay;
    overlay += align4(4 * n);
    let offset_to_per_node_counter = overlay;
    overlay += align4(4 * num_internal);
    total_size = total_size.max(overlay);

    let offset_to_hierarchy = total_size;
    total_size += align4(size_of::<HierarchyNode>() as u64 * total_nodes);

    ScratchLayout {
        offset_to_scene_aabb,
        offset_to_elements,
        offset_to_morton_codes,
        offset_to_index_buffer,
        offset_to_scene_aabb_scratch,
        offset_to_calc_aabb_dispatch_args,
        offset_to_per_node_counter,
        offset_to_hierarchy,
        total_size,
    }
}

// ---------- Result-buffer ABI ----------
//
// Bottom level:  header | (2N-1) AabbNode | N Primitive | N PrimitiveMetaData
//                | [N sorted u32] [2N-1 parent u32]   (update arrays)
// Top level:     header | (2N-1) AabbNode | N BvhMetadata
//                | [N sorted u32] [2N-1 parent u32]
//
// Leaf nodes are the trailing N entries of the node array; top-level leaf
// elements live directly in that segment.

/// Offset of the node array (right after the header).
pub fn offset_to_aabb_nodes() -> u64 {
    RESULT_HEADER_SIZE
}

/// Offset of the leaf segment inside the node array.
pub fn offset_to_leaf_node_aabbs(num_elements: u32) -> u64 {
    RESULT_HEADER_SIZE + size_of::<AabbNode>() as u64 * num_internal_nodes(num_elements) as u64
}

/// Offset of the primitive array of a bottom-level result.
pub fn offset_to_primitives(num_elements: u32) -> u64 {
    RESULT_HEADER_SIZE + size_of::<AabbNode>() as u64 * total_num_nodes(num_elements) as u64
}

pub fn offset_from_primitives_to_metadata(num_elements: u32) -> u64 {
    size_of::<Primitive>() as u64 * num_elements as u64
}

/// From the leaf segment to the instance metadata of a top-level result
/// (the leaf segment ends where the node array ends).
pub fn offset_from_leaf_nodes_to_metadata(num_elements: u32) -> u64 {
    size_of::<AabbNode>() as u64 * num_elements as u64
}

/// Result size without the persisted update arrays.
pub fn compacted_result_size(kind: AccelKind, num_elements: u32) -> u64 {
    let n = num_elements as u64;
    let nodes = size_of::<AabbNode>() as u64 * total_num_nodes(num_elements) as u64;
    let leaves = match kind {
        AccelKind::BottomLevel => {
            (size_of::<Primitive>() + size_of::<PrimitiveMetaData>()) as u64 * n
        }
        AccelKind::TopLevel => size_of::<BvhMetadata>() as u64 * n,
    };
    RESULT_HEADER_SIZE + nodes + leaves
}

/// Offset of the saved sorted-index array (present iff updates were allowed
/// at prebuild time).
pub fn offset_to_sorted_indices(kind: AccelKind, num_elements: u32) -> u64 {
    compacted_result_size(kind, num_elements)
}

pub fn offset_from_sorted_indices_to_parents(num_elements: u32) -> u64 {
    4 * num_elements as u64
}

/// Worst-case result size for a build of `num_elements` leaves.
pub fn result_size(kind: AccelKind, num_elements: u32, allow_update: bool) -> u64 {
    let mut size = compacted_result_size(kind, num_elements);
    if allow_update {
        // Saved sorted-index buffer plus one parent index per node.
        size += 4 * num_elements as u64;
        size += 4 * total_num_nodes(num_elements) as u64;
    }
    size
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_counts() {
        assert_eq!(num_internal_nodes(0), 0);
        assert_eq!(num_internal_nodes(1), 0);
        assert_eq!(num_internal_nodes(5), 4);
        assert_eq!(total_num_nodes(0), 0);
        assert_eq!(total_num_nodes(1), 1);
        assert_eq!(total_num_nodes(5), 9);
    }

    #[test]
    fn empty_scratch_is_header_sized() {
        let layout = scratch_layout(Level::Bottom, 0);
        assert_eq!(layout.offset_to_scene_aabb, 0);
        assert_eq!(layout.total_size, align4(size_of::<Aabb>() as u64));
    }

    #[test]
    fn scratch_regions_are_aligned() {
        for n in [1u32, 2, 3, 7, 64, 65, 1000] {
            for level in [Level::Bottom, Level::Top] {
                let l = scratch_layout(level, n);
                for off in [
                    l.offset_to_scene_aabb,
                    l.offset_to_elements,
                    l.offset_to_morton_codes,
                    l.offset_to_index_buffer,
                    l.offset_to_scene_aabb_scratch,
                    l.offset_to_calc_aabb_dispatch_args,
                    l.offset_to_per_node_counter,
                    l.offset_to_hierarchy,
                    l.total_size,
                ] {
                    assert_eq!(off % 4, 0, "misaligned offset for n={n}");
                }
            }
        }
    }

    #[test]
    fn overlay_never_reaches_morton_codes() {
        // The refit overlay (dispatch args + counters) must stay clear of
        // the Morton-code region, which the hierarchy pass still reads.
        for n in [1u32, 2, 3, 100, 4096] {
            let l = scratch_layout(Level::Bottom, n);
            let overlay_end =
                l.offset_to_per_node_counter + align4(4 * num_internal_nodes(n) as u64);
            assert!(overlay_end <= l.offset_to_morton_codes);
        }
    }
}
