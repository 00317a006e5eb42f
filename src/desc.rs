// src/desc.rs
// Caller-facing build descriptors: flags, geometry/instance inputs, GPU address ranges.
// This file exists to describe one build request completely and immutably before any recording happens.
// RELEVANT FILES:src/builder.rs,src/layout.rs,src/passes/mod.rs

use bitflags::bitflags;

/// GPU virtual address. Pass suites resolve addresses to their own resources;
/// the orchestrator only does arithmetic on them. Address 0 is "null".
pub type GpuVa = u64;

/// A contiguous GPU address range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuVaRange {
    pub start: GpuVa,
    pub size: u64,
}

impl GpuVaRange {
    pub fn new(start: GpuVa, size: u64) -> Self {
        Self { start, size }
    }

    pub fn is_null(&self) -> bool {
        self.start == 0
    }
}

bitflags! {
    /// Build flags, one bit per request knob.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BuildFlags: u32 {
        const ALLOW_UPDATE      = 1 << 0;
        const ALLOW_COMPACTION  = 1 << 1;
        const PREFER_FAST_TRACE = 1 << 2;
        const PREFER_FAST_BUILD = 1 << 3;
        const MINIMIZE_MEMORY   = 1 << 4;
        const PERFORM_UPDATE    = 1 << 5;
    }
}

bitflags! {
    /// Per-geometry flags carried into the primitive metadata.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GeometryFlags: u32 {
        const OPAQUE                          = 1 << 0;
        const NO_DUPLICATE_ANYHIT_INVOCATION  = 1 << 1;
    }
}

/// Which level of the two-level structure a build produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccelKind {
    BottomLevel,
    TopLevel,
}

/// Level tag used by the sizing formulas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Top,
    Bottom,
}

/// What the leaf elements of a build are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SceneKind {
    Triangles,
    BottomLevelBvhs,
}

/// How the instance-descriptor table is addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescsLayout {
    /// Contiguous array of `InstanceDesc` records.
    Array,
    /// Array of 8-byte GPU addresses, each pointing at one record.
    ArrayOfPointers,
}

/// Vertex position format of a triangle geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexFormat {
    Float32x3,
    /// Two-component positions, z implied 0.
    Float32x2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexFormat {
    None,
    Uint16,
    Uint32,
}

/// One triangle geometry of a bottom-level build: a VB/IB pair plus an
/// optional 3x4 transform.
#[derive(Debug, Clone)]
pub struct GeometryDesc {
    pub vertex_buffer: GpuVa,
    pub vertex_count: u32,
    pub vertex_stride: u64,
    pub vertex_format: VertexFormat,
    /// 0 when the geometry is non-indexed.
    pub index_buffer: GpuVa,
    pub index_count: u32,
    pub index_format: IndexFormat,
    /// Address of a row-major 3x4 float transform, 0 for none.
    pub transform: GpuVa,
    pub flags: GeometryFlags,
}

impl GeometryDesc {
    /// Triangle count contributed by this geometry.
    pub fn triangle_count(&self) -> u32 {
        if self.index_buffer != 0 {
            self.index_count / 3
        } else {
            self.vertex_count / 3
        }
    }
}

/// The leaf-element source of a build.
#[derive(Debug, Clone)]
pub enum BuildInput {
    /// Bottom-level: triangle geometries.
    Triangles { geometries: Vec<GeometryDesc> },
    /// Top-level: a GPU table of instance descriptors.
    Instances {
        descs: GpuVa,
        layout: DescsLayout,
        count: u32,
    },
}

impl BuildInput {
    pub fn kind(&self) -> AccelKind {
        match self {
            BuildInput::Triangles { .. } => AccelKind::BottomLevel,
            BuildInput::Instances { .. } => AccelKind::TopLevel,
        }
    }

    pub fn level(&self) -> Level {
        match self {
            BuildInput::Triangles { .. } => Level::Bottom,
            BuildInput::Instances { .. } => Level::Top,
        }
    }

    pub fn scene_kind(&self) -> SceneKind {
        match self {
            BuildInput::Triangles { .. } => SceneKind::Triangles,
            BuildInput::Instances { .. } => SceneKind::BottomLevelBvhs,
        }
    }

    /// Leaf-element count: summed triangles for a bottom-level input,
    /// instance count for a top-level one.
    pub fn num_elements(&self) -> u32 {
        match self {
            BuildInput::Triangles { geometries } => {
                geometries.iter().map(|g| g.triangle_count()).sum()
            }
            BuildInput::Instances { count, .. } => *count,
        }
    }
}

/// A complete build request.
#[derive(Debug, Clone)]
pub struct BuildDesc {
    pub flags: BuildFlags,
    pub input: BuildInput,
    pub dest: GpuVaRange,
    pub scratch: GpuVaRange,
}

/// Sizing answer returned by `prebuild_info`.
///
/// `update_scratch_data_size` is always 0: updates reuse the build scratch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrebuildInfo {
    pub result_data_max_size: u64,
    pub scratch_data_size: u64,
    pub update_scratch_data_size: u64,
}

/// Copy modes accepted by the copy entry point. Only `Clone` and `Compact`
/// are supported; the rest exist so unsupported requests can be rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyMode {
    Clone,
    Compact,
    VisualizationDecodeForTools,
    Serialize,
    Deserialize,
}
