//! GPU-driven builder for a two-level ray-tracing BVH.
//!
//! The builder emulates a driver-level acceleration-structure build on a
//! generic compute-capable GPU by chaining compute passes: leaf load, scene
//! AABB reduction, Morton codes, sort, rearrange, radix-tree link, treelet
//! reorder, and a bottom-up AABB refit. One scratch plan covers both full
//! rebuilds and in-place updates; transient regions alias wherever their
//! lifetimes cannot overlap.
//!
//! The orchestrator ([`Bvh2Builder`]) is generic over a [`passes::PassSuite`],
//! so the wgpu suite, the host reference suite, or a test double can sit
//! behind the same build sequence.

pub mod builder;
pub mod desc;
pub mod error;
pub mod gpu;
pub mod layout;
pub mod passes;
pub mod types;

pub use builder::Bvh2Builder;
pub use desc::{
    AccelKind, BuildDesc, BuildFlags, BuildInput, CopyMode, DescsLayout, GeometryDesc,
    GeometryFlags, GpuVa, GpuVaRange, IndexFormat, Level, PrebuildInfo, SceneKind, VertexFormat,
};
pub use error::{BuildError, BuildResult};
pub use passes::gpu::GpuPassSuite;
pub use passes::reference::{HostMemory, ReferencePasses};
pub use passes::PassSuite;
