// src/builder.rs
// The build orchestrator: resolves the per-build address street, sequences the compute passes,
// and exposes the prebuild/build/copy/post-build entry points.
// This file exists to turn one immutable build descriptor into one linear recorded pass sequence.
// RELEVANT FILES:src/layout.rs,src/passes/mod.rs,src/desc.rs

use crate::desc::{
    BuildDesc, BuildFlags, BuildInput, CopyMode, GpuVa, GpuVaRange, PrebuildInfo, SceneKind,
};
use crate::error::{BuildError, BuildResult};
use crate::layout::{
    self, offset_from_leaf_nodes_to_metadata, offset_from_primitives_to_metadata,
    offset_from_sorted_indices_to_parents, offset_to_leaf_node_aabbs, offset_to_primitives,
    offset_to_sorted_indices, scratch_layout,
};
use crate::passes::{
    ConstructAabbArgs, ConstructHierarchyArgs, CopyArgs, LoadInstancesArgs, LoadPrimitivesArgs,
    MortonArgs, PassSuite, PostBuildInfoArgs, RearrangeArgs, SceneAabbArgs, SortArgs,
    TreeletReorderArgs,
};

/// Absolute GPU addresses of every buffer one build touches, resolved once
/// from the scratch partition and the result-offset formulas.
#[derive(Debug, Clone, Copy)]
struct BvhStreet {
    scratch_elements: GpuVa,
    scratch_metadata: GpuVa,
    morton_codes: GpuVa,
    index_buffer: GpuVa,
    scene_aabb: GpuVa,
    scene_aabb_scratch: GpuVa,
    hierarchy: GpuVa,
    dispatch_args: GpuVa,
    node_counter: GpuVa,
    output_elements: GpuVa,
    output_metadata: GpuVa,
    output_sorted_indices: GpuVa,
    output_parents: GpuVa,
}

/// GPU-driven two-level BVH builder.
///
/// Holds one pass suite and a single latched flag: whether the most recent
/// `prebuild_info` allowed updates. Nothing else persists between builds.
pub struct Bvh2Builder<P: PassSuite> {
    passes: P,
    update_allowed: bool,
}

impl<P: PassSuite> Bvh2Builder<P> {
    pub fn new(passes: P) -> Self {
        Self {
            passes,
            update_allowed: false,
        }
    }

    pub fn passes(&self) -> &P {
        &self.passes
    }

    pub fn passes_mut(&mut self) -> &mut P {
        &mut self.passes
    }

    /// Whether the most recent prebuild allowed updates.
    pub fn update_allowed(&self) -> bool {
        self.update_allowed
    }

    /// Report the sizes a build of `input` needs, and latch whether that
    /// build may later be updated in place.
    ///
    /// Updates reuse the build scratch, so the update scratch size is
    /// always reported as zero.
    pub fn prebuild_info(&mut self, flags: BuildFlags, input: &BuildInput) -> PrebuildInfo {
        let n = input.num_elements();
        self.update_allowed = flags.contains(BuildFlags::ALLOW_UPDATE);
        PrebuildInfo {
            result_data_max_size: layout::result_size(input.kind(), n, self.update_allowed),
            scratch_data_size: scratch_layout(input.level(), n).total_size,
            update_scratch_data_size: 0,
        }
    }

    /// Record one full build (or in-place update) onto `rec`.
    ///
    /// Validation happens before the first pass call; a failed build records
    /// nothing.
    pub fn build(&self, rec: &mut P::Recorder, desc: &BuildDesc) -> BuildResult<()> {
        if desc.dest.is_null() {
            return Err(BuildError::invalid(
                "destination acceleration-structure address must be non-zero",
            ));
        }

        let n = desc.input.num_elements();

        if cfg!(debug_assertions) {
            let needed = layout::result_size(
                desc.input.kind(),
                n,
                desc.flags.contains(BuildFlags::ALLOW_UPDATE),
            );
            if desc.dest.size < needed {
                return Err(BuildError::invalid(format!(
                    "destination size {} is below the prebuild requirement {}",
                    desc.dest.size, needed
                )));
            }
            let scratch_needed = scratch_layout(desc.input.level(), n).total_size;
            if desc.scratch.size < scratch_needed {
                return Err(BuildError::invalid(format!(
                    "scratch size {} is below the prebuild requirement {}",
                    desc.scratch.size, scratch_needed
                )));
            }
        }

        let scene = desc.input.scene_kind();
        let street = self.resolve_street(desc, n)?;
        log::debug!(
            "building {:?} over {n} elements (scratch {} bytes, result {} bytes)",
            desc.input.kind(),
            desc.scratch.size,
            desc.dest.size
        );

        let perform_update = self.update_allowed && desc.flags.contains(BuildFlags::PERFORM_UPDATE);
        if desc.flags.contains(BuildFlags::PERFORM_UPDATE) && !self.update_allowed {
            log::warn!("update requested without a prior allow-update prebuild; rebuilding");
        }

        if n == 0 {
            // Nothing to load or sort; the destination still gets a valid
            // empty header.
            return self.record_refit(rec, desc, scene, &street, 0, false);
        }

        self.load_elements(rec, desc, scene, n, &street, perform_update)?;

        if !perform_update {
            self.build_hierarchy(rec, desc, scene, n, &street)?;
        }

        self.record_refit(rec, desc, scene, &street, n, perform_update)
    }

    /// Clone or compact a built structure. Any other mode is rejected.
    pub fn copy(
        &self,
        rec: &mut P::Recorder,
        dest: GpuVaRange,
        source: GpuVa,
        mode: CopyMode,
    ) -> BuildResult<()> {
        match mode {
            CopyMode::Clone | CopyMode::Compact => self.passes.copy_acceleration_structure(
                rec,
                &CopyArgs { dest, source, mode },
            ),
            other => Err(BuildError::invalid(format!(
                "unsupported copy mode {other:?}; only Clone and Compact are supported"
            ))),
        }
    }

    /// Write the compacted size of each source structure into `dest`.
    pub fn emit_post_build_info(
        &self,
        rec: &mut P::Recorder,
        dest: GpuVaRange,
        sources: &[GpuVa],
    ) -> BuildResult<()> {
        self.passes
            .emit_post_build_info(rec, &PostBuildInfoArgs { dest, sources })
    }

    fn resolve_street(&self, desc: &BuildDesc, n: u32) -> BuildResult<BvhStreet> {
        let part = scratch_layout(desc.input.level(), n);
        let s = desc.scratch.start;
        let d = desc.dest.start;

        let add = |base: u64, off: u64| -> BuildResult<GpuVa> {
            base.checked_add(off)
                .ok_or_else(|| BuildError::internal("GPU address arithmetic overflowed"))
        };

        let scratch_elements = add(s, part.offset_to_elements)?;
        let (scratch_metadata, output_elements) = match desc.input.scene_kind() {
            SceneKind::BottomLevelBvhs => (
                add(scratch_elements, offset_from_leaf_nodes_to_metadata(n))?,
                add(d, offset_to_leaf_node_aabbs(n))?,
            ),
            SceneKind::Triangles => (
                add(scratch_elements, offset_from_primitives_to_metadata(n))?,
                add(d, offset_to_primitives(n))?,
            ),
        };
        let output_metadata = match desc.input.scene_kind() {
            SceneKind::BottomLevelBvhs => add(output_elements, offset_from_leaf_nodes_to_metadata(n))?,
            SceneKind::Triangles => add(output_elements, offset_from_primitives_to_metadata(n))?,
        };
        let output_sorted_indices = add(d, offset_to_sorted_indices(desc.input.kind(), n))?;
        let output_parents = add(output_sorted_indices, offset_from_sorted_indices_to_parents(n))?;

        Ok(BvhStreet {
            scratch_elements,
            scratch_metadata,
            morton_codes: add(s, part.offset_to_morton_codes)?,
            index_buffer: add(s, part.offset_to_index_buffer)?,
            scene_aabb: add(s, part.offset_to_scene_aabb)?,
            scene_aabb_scratch: add(s, part.offset_to_scene_aabb_scratch)?,
            hierarchy: add(s, part.offset_to_hierarchy)?,
            dispatch_args: add(s, part.offset_to_calc_aabb_dispatch_args)?,
            node_counter: add(s, part.offset_to_per_node_counter)?,
            output_elements,
            output_metadata,
            output_sorted_indices,
            output_parents,
        })
    }

    /// Materialize the leaf elements and reduce their scene AABB.
    ///
    /// An update writes straight to the destination buffers and reseeds the
    /// persisted sorted-index array with the identity permutation; a rebuild
    /// stages into scratch.
    fn load_elements(
        &self,
        rec: &mut P::Recorder,
        desc: &BuildDesc,
        scene: SceneKind,
        n: u32,
        street: &BvhStreet,
        perform_update: bool,
    ) -> BuildResult<()> {
        let element_buffer = if perform_update {
            street.output_elements
        } else {
            street.scratch_elements
        };
        let metadata_buffer = if perform_update {
            street.output_metadata
        } else {
            street.scratch_metadata
        };
        let index_buffer = if perform_update {
            street.output_sorted_indices
        } else {
            0
        };

        match &desc.input {
            BuildInput::Triangles { geometries } => self.passes.load_primitives(
                rec,
                &LoadPrimitivesArgs {
                    geometries,
                    num_elements: n,
                    element_buffer,
                    metadata_buffer,
                    index_buffer,
                },
            )?,
            // The instance-load pass writes metadata on its own: instance
            // metadata always sits right after the leaf nodes, so it takes
            // no separate metadata address.
            BuildInput::Instances { descs, layout, .. } => self.passes.load_instances(
                rec,
                &LoadInstancesArgs {
                    instance_descs: *descs,
                    layout: *layout,
                    num_elements: n,
                    element_buffer,
                    index_buffer,
                },
            )?,
        }

        self.passes.calculate_scene_aabb(
            rec,
            &SceneAabbArgs {
                scene_kind: scene,
                element_buffer,
                num_elements: n,
                scratch: street.scene_aabb_scratch,
                scene_aabb: street.scene_aabb,
            },
        )
    }

    /// Full hierarchy rebuild: Morton codes, sort, rearrange, radix-tree
    /// link, and (for triangle scenes) treelet reorder.
    fn build_hierarchy(
        &self,
        rec: &mut P::Recorder,
        desc: &BuildDesc,
        scene: SceneKind,
        n: u32,
        street: &BvhStreet,
    ) -> BuildResult<()> {
        self.passes.calculate_morton_codes(
            rec,
            &MortonArgs {
                scene_kind: scene,
                element_buffer: street.scratch_elements,
                num_elements: n,
                scene_aabb: street.scene_aabb,
                index_buffer: street.index_buffer,
                morton_codes: street.morton_codes,
            },
        )?;

        self.passes.sort(
            rec,
            &SortArgs {
                morton_codes: street.morton_codes,
                index_buffer: street.index_buffer,
                num_elements: n,
            },
        )?;

        self.passes.rearrange(
            rec,
            &RearrangeArgs {
                scene_kind: scene,
                num_elements: n,
                scratch_elements: street.scratch_elements,
                scratch_metadata: street.scratch_metadata,
                index_buffer: street.index_buffer,
                output_elements: street.output_elements,
                output_metadata: street.output_metadata,
                output_sorted_indices: if self.update_allowed {
                    street.output_sorted_indices
                } else {
                    0
                },
            },
        )?;

        // Parent indices live in the hierarchy pass output because result
        // nodes store only child links.
        self.passes.construct_hierarchy(
            rec,
            &ConstructHierarchyArgs {
                scene_kind: scene,
                morton_codes: street.morton_codes,
                hierarchy: street.hierarchy,
                parent_indices: if self.update_allowed {
                    street.output_parents
                } else {
                    0
                },
                num_elements: n,
            },
        )?;

        if scene == SceneKind::Triangles {
            self.passes.treelet_reorder(
                rec,
                &TreeletReorderArgs {
                    num_elements: n,
                    hierarchy: street.hierarchy,
                    parent_indices: if self.update_allowed {
                        street.output_parents
                    } else {
                        0
                    },
                    node_counter: street.node_counter,
                    aabb_scratch: street.scene_aabb_scratch,
                    element_buffer: street.output_elements,
                    build_flags: desc.flags,
                },
            )?;
        }

        Ok(())
    }

    fn record_refit(
        &self,
        rec: &mut P::Recorder,
        desc: &BuildDesc,
        scene: SceneKind,
        street: &BvhStreet,
        n: u32,
        perform_update: bool,
    ) -> BuildResult<()> {
        self.passes.construct_aabb(
            rec,
            &ConstructAabbArgs {
                scene_kind: scene,
                dest: desc.dest.start,
                dispatch_args_scratch: street.dispatch_args,
                node_counter: street.node_counter,
                hierarchy: street.hierarchy,
                parent_indices: if perform_update {
                    street.output_parents
                } else {
                    0
                },
                num_elements: n,
                perform_update,
                update_arrays: self.update_allowed,
            },
        )
    }
}
