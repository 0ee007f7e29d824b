//! ef-propagate: The EchoForge sound propagation core
//!
//! Given a scene of triangulated objects with acoustic materials,
//! sources and listeners, each propagation frame produces a multi-band,
//! spatial impulse response per (listener, source) pair covering direct,
//! specular, diffuse, edge-diffracted and transmitted sound. Stochastic
//! output is stabilised across frames by persistent path, diffuse,
//! visibility and IR caches.

mod cache;
mod ir;
mod path;
mod propagator;
mod request;
mod source_ir;
mod utd;

pub use cache::{
    DiffusePathCache, DiffuseRecord, IrCache, PathCache, PathCacheEntry, VisibilityCache,
    next_pow2_prime,
};
pub use ir::SampledIR;
pub use path::{PathHash, PathId, PathKind, PathPoint, PointKind, SoundPath};
pub use propagator::Propagator;
pub use request::{PropagationFlags, PropagationRequest, Statistics};
pub use source_ir::{ListenerIR, SceneIR, SourceIR};
pub use utd::utd_attenuation;
