// tests/test_build_orchestration.rs
// Tests for the recorded pass sequence: ordering, rebuild vs update, error paths, alias disjointness.
// This file exists to validate the orchestrator against a trace pass suite, without any GPU.
// RELEVANT FILES:src/builder.rs,src/passes/mod.rs,src/layout.rs

use anyhow::Result;
use gpu_bvh2::desc::{
    BuildDesc, BuildFlags, BuildInput, CopyMode, DescsLayout, GeometryDesc, GeometryFlags,
    GpuVaRange, IndexFormat, VertexFormat,
};
use gpu_bvh2::error::{BuildError, BuildResult};
use gpu_bvh2::passes::{
    Access, ConstructAabbArgs, ConstructHierarchyArgs, CopyArgs, LoadInstancesArgs,
    LoadPrimitivesArgs, MortonArgs, PassSuite, PostBuildInfoArgs, RearrangeArgs, RegionUse,
    SceneAabbArgs, SortArgs, TreeletReorderArgs,
};
use gpu_bvh2::Bvh2Builder;

/// One recorded pass invocation with its region annotations.
#[derive(Debug, Clone)]
struct Event {
    pass: &'static str,
    regions: Vec<RegionUse>,
}

/// Pass suite that records invocations instead of GPU work.
struct TracePasses;

impl PassSuite for TracePasses {
    type Recorder = Vec<Event>;

    fn load_primitives(
        &self,
        rec: &mut Vec<Event>,
        args: &LoadPrimitivesArgs<'_>,
    ) -> BuildResult<()> {
        rec.push(Event {
            pass: "load_primitives",
            regions: args.regions(),
        });
        Ok(())
    }

    fn load_instances(&self, rec: &mut Vec<Event>, args: &LoadInstancesArgs) -> BuildResult<()> {
        rec.push(Event {
            pass: "load_instances",
            regions: args.regions(),
        });
        Ok(())
    }

    fn calculate_scene_aabb(&self, rec: &mut Vec<Event>, args: &SceneAabbArgs) -> BuildResult<()> {
        rec.push(Event {
            pass: "calculate_scene_aabb",
            regions: args.regions(),
        });
        Ok(())
    }

    fn calculate_morton_codes(&self, rec: &mut Vec<Event>, args: &MortonArgs) -> BuildResult<()> {
        rec.push(Event {
            pass: "calculate_morton_codes",
            regions: args.regions(),
        });
        Ok(())
    }

    fn sort(&self, rec: &mut Vec<Event>, args: &SortArgs) -> BuildResult<()> {
        rec.push(Event {
            pass: "sort",
            regions: args.regions(),
        });
        Ok(())
    }

    fn rearrange(&self, rec: &mut Vec<Event>, args: &RearrangeArgs) -> BuildResult<()> {
        rec.push(Event {
            pass: "rearrange",
            regions: args.regions(),
        });
        Ok(())
    }

    fn construct_hierarchy(
        &self,
        rec: &mut Vec<Event>,
        args: &ConstructHierarchyArgs,
    ) -> BuildResult<()> {
        rec.push(Event {
            pass: "construct_hierarchy",
            regions: args.regions(),
        });
        Ok(())
    }

    fn treelet_reorder(&self, rec: &mut Vec<Event>, args: &TreeletReorderArgs) -> BuildResult<()> {
        rec.push(Event {
            pass: "treelet_reorder",
            regions: args.regions(),
        });
        Ok(())
    }

    fn construct_aabb(&self, rec: &mut Vec<Event>, args: &ConstructAabbArgs) -> BuildResult<()> {
        rec.push(Event {
            pass: "construct_aabb",
            regions: args.regions(),
        });
        Ok(())
    }

    fn copy_acceleration_structure(&self, rec: &mut Vec<Event>, _args: &CopyArgs) -> BuildResult<()> {
        rec.push(Event {
            pass: "copy",
            regions: Vec::new(),
        });
        Ok(())
    }

    fn emit_post_build_info(
        &self,
        rec: &mut Vec<Event>,
        _args: &PostBuildInfoArgs<'_>,
    ) -> BuildResult<()> {
        rec.push(Event {
            pass: "post_build_info",
            regions: Vec::new(),
        });
        Ok(())
    }
}

const DEST: u64 = 0x10_0000;
const SCRATCH: u64 = 0x80_0000;

fn blas_input(triangles: u32) -> BuildInput {
    BuildInput::Triangles {
        geometries: vec![GeometryDesc {
            vertex_buffer: 0x1000,
            vertex_count: triangles * 3,
            vertex_stride: 12,
            vertex_format: VertexFormat::Float32x3,
            index_buffer: 0,
            index_count: 0,
            index_format: IndexFormat::None,
            transform: 0,
            flags: GeometryFlags::empty(),
        }],
    }
}

fn tlas_input(count: u32) -> BuildInput {
    BuildInput::Instances {
        descs: 0x4000,
        layout: DescsLayout::Array,
        count,
    }
}

fn sized_desc(builder: &mut Bvh2Builder<TracePasses>, flags: BuildFlags, input: BuildInput) -> BuildDesc {
    let info = builder.prebuild_info(flags, &input);
    BuildDesc {
        flags,
        input,
        dest: GpuVaRange::new(DEST, info.result_data_max_size),
        scratch: GpuVaRange::new(SCRATCH, info.scratch_data_size),
    }
}

fn pass_names(events: &[Event]) -> Vec<&'static str> {
    events.iter().map(|e| e.pass).collect()
}

#[test]
fn bottom_level_rebuild_records_full_sequence() -> Result<()> {
    let mut builder = Bvh2Builder::new(TracePasses);
    let desc = sized_desc(&mut builder, BuildFlags::empty(), blas_input(8));

    let mut rec = Vec::new();
    builder.build(&mut rec, &desc)?;

    assert_eq!(
        pass_names(&rec),
        vec![
            "load_primitives",
            "calculate_scene_aabb",
            "calculate_morton_codes",
            "sort",
            "rearrange",
            "construct_hierarchy",
            "treelet_reorder",
            "construct_aabb",
        ]
    );
    Ok(())
}

#[test]
fn top_level_rebuild_skips_treelet_reorder() -> Result<()> {
    let mut builder = Bvh2Builder::new(TracePasses);
    let desc = sized_desc(&mut builder, BuildFlags::empty(), tlas_input(4));

    let mut rec = Vec::new();
    builder.build(&mut rec, &desc)?;

    assert_eq!(
        pass_names(&rec),
        vec![
            "load_instances",
            "calculate_scene_aabb",
            "calculate_morton_codes",
            "sort",
            "rearrange",
            "construct_hierarchy",
            "construct_aabb",
        ]
    );
    Ok(())
}

#[test]
fn update_skips_the_hierarchy_phase() -> Result<()> {
    let mut builder = Bvh2Builder::new(TracePasses);
    let flags = BuildFlags::ALLOW_UPDATE | BuildFlags::PERFORM_UPDATE;
    let desc = sized_desc(&mut builder, flags, blas_input(8));

    let mut rec = Vec::new();
    builder.build(&mut rec, &desc)?;

    assert_eq!(
        pass_names(&rec),
        vec!["load_primitives", "calculate_scene_aabb", "construct_aabb"]
    );

    // The update load reseeds the persisted sorted-index array.
    assert!(rec[0].regions.iter().any(|r| r.name == "indices"));
    Ok(())
}

#[test]
fn update_without_latch_degrades_to_rebuild() -> Result<()> {
    let mut builder = Bvh2Builder::new(TracePasses);
    // Prebuild without ALLOW_UPDATE, then ask for an update anyway.
    let desc = sized_desc(&mut builder, BuildFlags::PERFORM_UPDATE, blas_input(8));

    let mut rec = Vec::new();
    builder.build(&mut rec, &desc)?;

    assert_eq!(rec.len(), 8, "expected a full rebuild sequence");
    // Nothing may touch the (nonexistent) saved sorted-index buffer.
    let rearrange = rec.iter().find(|e| e.pass == "rearrange").unwrap();
    assert!(!rearrange.regions.iter().any(|r| r.name == "sorted indices"));
    Ok(())
}

#[test]
fn empty_build_emits_only_the_header_pass() -> Result<()> {
    let mut builder = Bvh2Builder::new(TracePasses);
    let desc = sized_desc(&mut builder, BuildFlags::empty(), blas_input(0));

    let mut rec = Vec::new();
    builder.build(&mut rec, &desc)?;
    assert_eq!(pass_names(&rec), vec!["construct_aabb"]);
    Ok(())
}

#[test]
fn null_destination_records_nothing() {
    let mut builder = Bvh2Builder::new(TracePasses);
    let mut desc = sized_desc(&mut builder, BuildFlags::empty(), blas_input(4));
    desc.dest = GpuVaRange::new(0, desc.dest.size);

    let mut rec = Vec::new();
    let err = builder.build(&mut rec, &desc).unwrap_err();
    assert!(matches!(err, BuildError::InvalidArgument(_)));
    assert!(rec.is_empty(), "a failed build must not record passes");
}

#[test]
fn undersized_ranges_record_nothing_in_debug() {
    if !cfg!(debug_assertions) {
        return;
    }
    let mut builder = Bvh2Builder::new(TracePasses);

    let mut desc = sized_desc(&mut builder, BuildFlags::empty(), blas_input(4));
    desc.dest.size -= 1;
    let mut rec = Vec::new();
    assert!(matches!(
        builder.build(&mut rec, &desc),
        Err(BuildError::InvalidArgument(_))
    ));
    assert!(rec.is_empty());

    let mut desc = sized_desc(&mut builder, BuildFlags::empty(), blas_input(4));
    desc.scratch.size -= 1;
    let mut rec = Vec::new();
    assert!(matches!(
        builder.build(&mut rec, &desc),
        Err(BuildError::InvalidArgument(_))
    ));
    assert!(rec.is_empty());
}

#[test]
fn only_clone_and_compact_copies_are_accepted() {
    let builder = Bvh2Builder::new(TracePasses);
    let dest = GpuVaRange::new(DEST, 4096);

    for mode in [CopyMode::Clone, CopyMode::Compact] {
        let mut rec = Vec::new();
        builder.copy(&mut rec, dest, SCRATCH, mode).unwrap();
        assert_eq!(pass_names(&rec), vec!["copy"]);
    }

    for mode in [
        CopyMode::VisualizationDecodeForTools,
        CopyMode::Serialize,
        CopyMode::Deserialize,
    ] {
        let mut rec = Vec::new();
        let err = builder.copy(&mut rec, dest, SCRATCH, mode).unwrap_err();
        assert!(matches!(err, BuildError::InvalidArgument(_)));
        assert!(rec.is_empty());
    }
}

/// The alias-disjointness proof from the recorded sequence: whenever a pass
/// reads a region, the most recent prior write overlapping those bytes must
/// have produced that same logical region, not an alias of it.
#[test]
fn aliased_scratch_uses_are_time_disjoint() -> Result<()> {
    let mut builder = Bvh2Builder::new(TracePasses);
    let flags = BuildFlags::ALLOW_UPDATE;
    let desc = sized_desc(&mut builder, flags, blas_input(64));

    let mut rec = Vec::new();
    builder.build(&mut rec, &desc)?;

    // No pass may touch two distinct overlapping regions at once.
    for event in &rec {
        for (i, a) in event.regions.iter().enumerate() {
            for b in event.regions.iter().skip(i + 1) {
                assert!(
                    !a.overlaps(b),
                    "{}: regions '{}' and '{}' overlap within one pass",
                    event.pass,
                    a.name,
                    b.name
                );
            }
        }
    }

    // Every read must observe its own producer's bytes.
    for (j, event) in rec.iter().enumerate() {
        for read in event
            .regions
            .iter()
            .filter(|r| matches!(r.access, Access::Read | Access::ReadWrite))
        {
            let last_writer = rec[..j]
                .iter()
                .rev()
                .find_map(|prior| {
                    prior
                        .regions
                        .iter()
                        .find(|w| {
                            matches!(w.access, Access::Write | Access::ReadWrite)
                                && w.overlaps(read)
                        })
                        .map(|w| (prior.pass, w.name))
                });
            if let Some((pass, name)) = last_writer {
                assert_eq!(
                    name, read.name,
                    "{} reads '{}' but the bytes were last written as '{}' by {}",
                    event.pass, read.name, name, pass
                );
            }
        }
    }
    Ok(())
}
