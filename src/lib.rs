//! Spatial neighbor finding and local-structure identification for
//! particle systems from atomistic simulations.
//!
//! The crate provides two neighbor finders over triclinic simulation cells
//! with per-axis periodic boundary conditions: a binned cutoff finder
//! ([`CutoffNeighborFinder`]) and a BSP-tree k-nearest-neighbor finder
//! ([`NearestNeighborFinder`]). On top of them sit the classic structure
//! classifiers of the atomistic analysis toolchain: Ackland-Jones bond-angle
//! analysis, common neighbor analysis, diamond-structure identification,
//! centrosymmetry, and coordination numbers with a sampled radial
//! distribution function. A Delaunay tessellation engine with exact
//! predicates and periodic ghost handling ([`DelaunayTessellation`])
//! supports downstream mesh construction.
//!
//! All per-particle passes run on the rayon thread pool and poll a
//! [`ComputeContext`] so long analyses can be canceled and report progress.
//!
//! ```
//! use nalgebra::Vector3;
//! use structid_rs::{CutoffNeighborFinder, SimulationCell};
//!
//! let cell = SimulationCell::orthorhombic(
//!     Vector3::new(10.0, 10.0, 10.0),
//!     Vector3::new(true, true, true),
//! )
//! .unwrap();
//! let positions = vec![
//!     Vector3::new(1.0, 1.0, 1.0),
//!     Vector3::new(2.5, 1.0, 1.0),
//!     Vector3::new(9.5, 1.0, 1.0),
//! ];
//! let finder = CutoffNeighborFinder::prepare(2.0, &positions, &cell).unwrap();
//! // Both the direct neighbor and the one through the periodic boundary.
//! assert_eq!(finder.neighbors_of(0).count(), 2);
//! ```

pub mod bond_angle;
pub mod cell;
pub mod centrosymmetry;
pub mod cna;
pub mod config;
pub mod coordination;
pub mod cutoff;
pub mod delaunay;
pub mod diamond;
pub mod nearest;
pub mod structures;
pub mod task;

pub use bond_angle::BondAngleStructureType;
pub use cell::{CellError, SimulationCell};
pub use centrosymmetry::{CentroSymmetryError, DEFAULT_CSP_NEIGHBORS, MAX_CSP_NEIGHBORS};
pub use cna::{CnaMode, CnaStructureType};
pub use coordination::{CoordinationAnalysis, CoordinationResults, DEFAULT_RDF_BIN_COUNT};
pub use cutoff::{CutoffError, CutoffNeighbor, CutoffNeighborFinder};
pub use delaunay::{
    CellHandle, DelaunayTessellation, Facet, TessellationError, VertexHandle, VertexPoint,
};
pub use diamond::DiamondStructureType;
pub use nearest::{NearestNeighborFinder, Neighbor, NeighborQuery};
pub use structures::{StructureAnalysis, StructureAnalysisError, StructureResults};
pub use task::{ComputeContext, Outcome};

use tracing_subscriber::EnvFilter;

/// Installs a tracing subscriber for applications that do not bring their
/// own. `level` overrides the `RUST_LOG` environment filter. Calling this
/// more than once is harmless.
pub fn init_logging(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE)
        .with_thread_ids(true)
        .try_init();
}
