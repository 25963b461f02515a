//! Shared ID type aliases. Arena-style indices per spec.md §9's "recast as
//! arena indices" note — these are non-owning back-references, looked up
//! through whichever arena owns the referent (the app list, an SM's warp
//! array, a model's kernel map).

pub type AppId = i32;
pub type ModelId = u64;
pub type KernelId = u64;
pub type SmId = u32;
pub type BlockId = u64;
pub type WarpId = u32;
pub type RequestId = u64;
pub type LayerId = i32;

/// Wildcard app id used to key a single shared cgroup when memory
/// isolation is disabled (`MEM_ALLOCATION::None`). Grounded in
/// `original_source/src/GMMU.cpp::freeCGroup`/`getCGroup`'s `-1` lookup.
pub const SHARED_CGROUP_ID: AppId = -1;
