//! Unified entry point for the per-particle structure classifiers.
//!
//! Each classifier family keeps its own structure-type enum because the
//! categories differ, but callers that only route results to coloring or
//! selection can go through [`StructureAnalysis`] and the numeric type ids.

use nalgebra::Vector3;
use thiserror::Error;

use crate::bond_angle::{self, BondAngleStructureType};
use crate::cell::SimulationCell;
use crate::cna::{self, CnaMode, CnaStructureType};
use crate::cutoff::CutoffError;
use crate::diamond::{self, DiamondStructureType};
use crate::task::{ComputeContext, Outcome};

#[derive(Debug, Error)]
pub enum StructureAnalysisError {
    #[error(transparent)]
    Cutoff(#[from] CutoffError),
}

/// Selects a classifier family and its parameters.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum StructureAnalysis {
    /// Ackland-Jones bond-angle distribution analysis.
    BondAngle,
    /// Common neighbor analysis in the given mode.
    Cna { mode: CnaMode },
    /// Cubic/hexagonal diamond identification.
    Diamond,
}

/// Classification output, one entry per input particle.
#[derive(Clone, Debug, PartialEq)]
pub enum StructureResults {
    BondAngle(Vec<BondAngleStructureType>),
    Cna(Vec<CnaStructureType>),
    Diamond(Vec<DiamondStructureType>),
}

impl StructureResults {
    pub fn len(&self) -> usize {
        match self {
            StructureResults::BondAngle(v) => v.len(),
            StructureResults::Cna(v) => v.len(),
            StructureResults::Diamond(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Numeric structure type of particle `index`, in each family's output
    /// order. Zero always means unclassified.
    pub fn type_id(&self, index: usize) -> u8 {
        match self {
            StructureResults::BondAngle(v) => v[index] as u8,
            StructureResults::Cna(v) => v[index] as u8,
            StructureResults::Diamond(v) => v[index] as u8,
        }
    }
}

impl StructureAnalysis {
    /// Runs the selected classifier over all particles.
    pub fn evaluate(
        &self,
        positions: &[Vector3<f64>],
        cell: &SimulationCell,
        ctx: &ComputeContext,
    ) -> Result<Outcome<StructureResults>, StructureAnalysisError> {
        match *self {
            StructureAnalysis::BondAngle => Ok(bond_angle::analyze(positions, cell, ctx)
                .map(StructureResults::BondAngle)),
            StructureAnalysis::Cna { mode } => Ok(cna::analyze(mode, positions, cell, ctx)?
                .map(StructureResults::Cna)),
            StructureAnalysis::Diamond => {
                Ok(diamond::identify(positions, cell, ctx).map(StructureResults::Diamond))
            }
        }
    }
}
