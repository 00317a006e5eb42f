// src/passes/mod.rs
// Pass-collaborator contracts: one trait method per compute pass, typed argument structs, region annotations.
// This file exists so the orchestrator can drive interchangeable pass suites (wgpu, host reference, test traces).
// RELEVANT FILES:src/passes/gpu.rs,src/passes/reference.rs,src/builder.rs,src/layout.rs

pub mod gpu;
pub mod reference;

use crate::desc::{BuildFlags, CopyMode, DescsLayout, GeometryDesc, GpuVa, GpuVaRange, SceneKind};
use crate::error::BuildResult;
use crate::layout::{align4, element_stride, metadata_stride, total_num_nodes};

/// Workgroup width of the scene-AABB reduction; fixes how many partial
/// boxes the reduction scratch has to hold.
pub const SCENE_AABB_GROUP_SIZE: u32 = 64;

/// Scratch bytes the scene-AABB reduction needs for `n` elements: one
/// partial AABB per workgroup of the first reduction round.
pub fn scene_aabb_scratch_size(n: u32) -> u64 {
    let groups = (n as u64).div_ceil(SCENE_AABB_GROUP_SIZE as u64);
    align4(24 * groups)
}

/// Scratch bytes the treelet reorder needs to stage per-node AABBs.
pub fn treelet_aabb_buffer_size(n: u32) -> u64 {
    align4(24 * total_num_nodes(n) as u64)
}

/// How a pass touches a region, in cross-pass terms: `Read` consumes bytes
/// an earlier pass produced, `Write` produces bytes (including regions the
/// pass initializes itself, like counters), `ReadWrite` does both. Used to
/// mechanically check that aliased scratch regions are only ever used in
/// disjoint time intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    ReadWrite,
}

/// One region a pass consumes or produces.
#[derive(Debug, Clone, Copy)]
pub struct RegionUse {
    pub name: &'static str,
    pub va: GpuVa,
    pub size: u64,
    pub access: Access,
}

impl RegionUse {
    fn new(name: &'static str, va: GpuVa, size: u64, access: Access) -> Self {
        Self {
            name,
            va,
            size,
            access,
        }
    }

    pub fn overlaps(&self, other: &RegionUse) -> bool {
        self.va < other.va + other.size && other.va < self.va + self.size
    }
}

/// Materialize triangle leaf records from the geometry descriptors.
///
/// Writes `num_elements` primitives and metadata records; when
/// `index_buffer` is non-null it is seeded with the identity permutation
/// (the update path uses this to reset the saved sorted-index array).
#[derive(Debug, Clone)]
pub struct LoadPrimitivesArgs<'a> {
    pub geometries: &'a [GeometryDesc],
    pub num_elements: u32,
    pub element_buffer: GpuVa,
    pub metadata_buffer: GpuVa,
    pub index_buffer: GpuVa,
}

impl LoadPrimitivesArgs<'_> {
    pub fn regions(&self) -> Vec<RegionUse> {
        let n = self.num_elements as u64;
        let mut r = vec![
            RegionUse::new("elements", self.element_buffer, 40 * n, Access::Write),
            RegionUse::new("metadata", self.metadata_buffer, 12 * n, Access::Write),
        ];
        if self.index_buffer != 0 {
            r.push(RegionUse::new("indices", self.index_buffer, 4 * n, Access::Write));
        }
        r
    }
}

/// Materialize instance leaf records (AABB nodes plus instance metadata)
/// from the GPU instance-descriptor table.
///
/// The metadata target is not a separate address: instance metadata always
/// lands right after the `num_elements` leaf nodes, so the pass derives it.
#[derive(Debug, Clone)]
pub struct LoadInstancesArgs {
    pub instance_descs: GpuVa,
    pub layout: DescsLayout,
    pub num_elements: u32,
    pub element_buffer: GpuVa,
    pub index_buffer: GpuVa,
}

impl LoadInstancesArgs {
    pub fn regions(&self) -> Vec<RegionUse> {
        let n = self.num_elements as u64;
        let mut r = vec![
            RegionUse::new("instance descs", self.instance_descs, 64 * n, Access::Read),
            RegionUse::new("elements", self.element_buffer, (32 + 64) * n, Access::Write),
        ];
        if self.index_buffer != 0 {
            r.push(RegionUse::new("indices", self.index_buffer, 4 * n, Access::Write));
        }
        r
    }
}

/// Reduce the element buffer to one scene AABB.
#[derive(Debug, Clone)]
pub struct SceneAabbArgs {
    pub scene_kind: SceneKind,
    pub element_buffer: GpuVa,
    pub num_elements: u32,
    pub scratch: GpuVa,
    pub scene_aabb: GpuVa,
}

impl SceneAabbArgs {
    pub fn regions(&self) -> Vec<RegionUse> {
        let n = self.num_elements as u64;
        vec![
            RegionUse::new(
                "elements",
                self.element_buffer,
                element_stride(self.scene_kind) * n,
                Access::Read,
            ),
            RegionUse::new(
                "reduction scratch",
                self.scratch,
                scene_aabb_scratch_size(self.num_elements),
                Access::ReadWrite,
            ),
            RegionUse::new("scene aabb", self.scene_aabb, 24, Access::Write),
        ]
    }
}

/// Compute one Morton code per element and seed the identity permutation.
#[derive(Debug, Clone)]
pub struct MortonArgs {
    pub scene_kind: SceneKind,
    pub element_buffer: GpuVa,
    pub num_elements: u32,
    pub scene_aabb: GpuVa,
    pub index_buffer: GpuVa,
    pub morton_codes: GpuVa,
}

impl MortonArgs {
    pub fn regions(&self) -> Vec<RegionUse> {
        let n = self.num_elements as u64;
        vec![
            RegionUse::new(
                "elements",
                self.element_buffer,
                element_stride(self.scene_kind) * n,
                Access::Read,
            ),
            RegionUse::new("scene aabb", self.scene_aabb, 24, Access::Read),
            RegionUse::new("indices", self.index_buffer, 4 * n, Access::Write),
            RegionUse::new("morton codes", self.morton_codes, 4 * n, Access::Write),
        ]
    }
}

/// Key-sort the Morton codes, permuting the index buffer along.
/// Stability is unspecified; nothing downstream depends on more than the
/// key order.
#[derive(Debug, Clone)]
pub struct SortArgs {
    pub morton_codes: GpuVa,
    pub index_buffer: GpuVa,
    pub num_elements: u32,
}

impl SortArgs {
    pub fn regions(&self) -> Vec<RegionUse> {
        let n = self.num_elements as u64;
        vec![
            RegionUse::new("morton codes", self.morton_codes, 4 * n, Access::ReadWrite),
            RegionUse::new("indices", self.index_buffer, 4 * n, Access::ReadWrite),
        ]
    }
}

/// Gather elements and metadata into sorted order, staging to the output
/// buffers; optionally persists the permutation for later updates.
#[derive(Debug, Clone)]
pub struct RearrangeArgs {
    pub scene_kind: SceneKind,
    pub num_elements: u32,
    pub scratch_elements: GpuVa,
    pub scratch_metadata: GpuVa,
    pub index_buffer: GpuVa,
    pub output_elements: GpuVa,
    pub output_metadata: GpuVa,
    /// 0 when the permutation is not persisted.
    pub output_sorted_indices: GpuVa,
}

impl RearrangeArgs {
    pub fn regions(&self) -> Vec<RegionUse> {
        let n = self.num_elements as u64;
        let es = element_stride(self.scene_kind);
        let ms = metadata_stride(self.scene_kind);
        let mut r = vec![
            RegionUse::new("scratch elements", self.scratch_elements, es * n, Access::Read),
            RegionUse::new("scratch metadata", self.scratch_metadata, ms * n, Access::Read),
            RegionUse::new("indices", self.index_buffer, 4 * n, Access::Read),
            RegionUse::new("output elements", self.output_elements, es * n, Access::Write),
            RegionUse::new("output metadata", self.output_metadata, ms * n, Access::Write),
        ];
        if self.output_sorted_indices != 0 {
            r.push(RegionUse::new(
                "sorted indices",
                self.output_sorted_indices,
                4 * n,
                Access::Write,
            ));
        }
        r
    }
}

/// Build the binary radix tree over the sorted Morton codes.
#[derive(Debug, Clone)]
pub struct ConstructHierarchyArgs {
    pub scene_kind: SceneKind,
    pub morton_codes: GpuVa,
    pub hierarchy: GpuVa,
    /// 0 when parent indices are not persisted for updates.
    pub parent_indices: GpuVa,
    pub num_elements: u32,
}

impl ConstructHierarchyArgs {
    pub fn regions(&self) -> Vec<RegionUse> {
        let n = self.num_elements as u64;
        let nodes = total_num_nodes(self.num_elements) as u64;
        let mut r = vec![
            RegionUse::new("morton codes", self.morton_codes, 4 * n, Access::Read),
            RegionUse::new("hierarchy", self.hierarchy, 12 * nodes, Access::Write),
        ];
        if self.parent_indices != 0 {
            r.push(RegionUse::new("parents", self.parent_indices, 4 * nodes, Access::Write));
        }
        r
    }
}

/// Locally re-optimize small subtrees of a triangle hierarchy, keeping the
/// parent-index array consistent. Reads and writes the output element
/// buffer in place.
#[derive(Debug, Clone)]
pub struct TreeletReorderArgs {
    pub num_elements: u32,
    pub hierarchy: GpuVa,
    /// 0 when parent indices are not persisted.
    pub parent_indices: GpuVa,
    pub node_counter: GpuVa,
    pub aabb_scratch: GpuVa,
    pub element_buffer: GpuVa,
    pub build_flags: BuildFlags,
}

impl TreeletReorderArgs {
    pub fn regions(&self) -> Vec<RegionUse> {
        let n = self.num_elements as u64;
        let nodes = total_num_nodes(self.num_elements) as u64;
        let internal = nodes.saturating_sub(n);
        // The counter and AABB staging area are initialized by the pass
        // itself; only the hierarchy and elements carry earlier output in.
        let mut r = vec![
            RegionUse::new("hierarchy", self.hierarchy, 12 * nodes, Access::ReadWrite),
            RegionUse::new("node counter", self.node_counter, 4 * internal, Access::Write),
            RegionUse::new(
                "treelet aabbs",
                self.aabb_scratch,
                treelet_aabb_buffer_size(self.num_elements),
                Access::Write,
            ),
            RegionUse::new("output elements", self.element_buffer, 40 * n, Access::ReadWrite),
        ];
        if self.parent_indices != 0 {
            r.push(RegionUse::new("parents", self.parent_indices, 4 * nodes, Access::ReadWrite));
        }
        r
    }
}

/// Fit AABBs around every node, bottom-up, and emit the result header.
/// For an update the topology is read back from the destination itself
/// (child links in the node array, parents from the persisted array).
#[derive(Debug, Clone)]
pub struct ConstructAabbArgs {
    pub scene_kind: SceneKind,
    pub dest: GpuVa,
    pub dispatch_args_scratch: GpuVa,
    pub node_counter: GpuVa,
    pub hierarchy: GpuVa,
    /// Persisted parent array; 0 on a rebuild (parents come from the
    /// hierarchy buffer instead).
    pub parent_indices: GpuVa,
    pub num_elements: u32,
    pub perform_update: bool,
    /// Whether the result carries the persisted update arrays (sizes the
    /// header fields).
    pub update_arrays: bool,
}

impl ConstructAabbArgs {
    pub fn regions(&self) -> Vec<RegionUse> {
        let n = self.num_elements as u64;
        let nodes = total_num_nodes(self.num_elements) as u64;
        let internal = nodes.saturating_sub(n);
        // A rebuild produces the node array from scratch; an update consumes
        // the topology already sitting in the destination. The dispatch and
        // counter regions are initialized by the pass itself.
        let result_access = if self.perform_update {
            Access::ReadWrite
        } else {
            Access::Write
        };
        let mut r = vec![
            RegionUse::new("result", self.dest, 16 + 32 * nodes, result_access),
            RegionUse::new("dispatch args", self.dispatch_args_scratch, 4 * n, Access::Write),
            RegionUse::new("node counter", self.node_counter, 4 * internal, Access::Write),
        ];
        if !self.perform_update {
            r.push(RegionUse::new("hierarchy", self.hierarchy, 12 * nodes, Access::Read));
        }
        if self.parent_indices != 0 {
            r.push(RegionUse::new("parents", self.parent_indices, 4 * nodes, Access::Read));
        }
        r
    }
}

/// Clone or compact one built structure into another range.
#[derive(Debug, Clone)]
pub struct CopyArgs {
    pub dest: GpuVaRange,
    pub source: GpuVa,
    pub mode: CopyMode,
}

/// Write the compacted size (one u64 per source structure) to the
/// destination range.
#[derive(Debug, Clone)]
pub struct PostBuildInfoArgs<'a> {
    pub dest: GpuVaRange,
    pub sources: &'a [GpuVa],
}

/// The full set of compute passes one build orchestrates.
///
/// `Recorder` is whatever the suite records work onto: a
/// `wgpu::CommandEncoder` for the GPU suite, a host memory image for the
/// reference suite, an event log for test doubles. The orchestrator is
/// generic over it and never inspects it.
///
/// Between two pass calls on the same recorder, writes of the earlier pass
/// are visible to the later one (the GPU suite relies on compute-pass
/// boundaries for this; host suites are trivially ordered).
pub trait PassSuite {
    type Recorder;

    fn load_primitives(
        &self,
        rec: &mut Self::Recorder,
        args: &LoadPrimitivesArgs<'_>,
    ) -> BuildResult<()>;

    fn load_instances(&self, rec: &mut Self::Recorder, args: &LoadInstancesArgs)
        -> BuildResult<()>;

    fn calculate_scene_aabb(
        &self,
        rec: &mut Self::Recorder,
        args: &SceneAabbArgs,
    ) -> BuildResult<()>;

    fn calculate_morton_codes(
        &self,
        rec: &mut Self::Recorder,
        args: &MortonArgs,
    ) -> BuildResult<()>;

    fn sort(&self, rec: &mut Self::Recorder, args: &SortArgs) -> BuildResult<()>;

    fn rearrange(&self, rec: &mut Self::Recorder, args: &RearrangeArgs) -> BuildResult<()>;

    fn construct_hierarchy(
        &self,
        rec: &mut Self::Recorder,
        args: &ConstructHierarchyArgs,
    ) -> BuildResult<()>;

    fn treelet_reorder(
        &self,
        rec: &mut Self::Recorder,
        args: &TreeletReorderArgs,
    ) -> BuildResult<()>;

    fn construct_aabb(&self, rec: &mut Self::Recorder, args: &ConstructAabbArgs)
        -> BuildResult<()>;

    fn copy_acceleration_structure(
        &self,
        rec: &mut Self::Recorder,
        args: &CopyArgs,
    ) -> BuildResult<()>;

    fn emit_post_build_info(
        &self,
        rec: &mut Self::Recorder,
        args: &PostBuildInfoArgs<'_>,
    ) -> BuildResult<()>;
}
