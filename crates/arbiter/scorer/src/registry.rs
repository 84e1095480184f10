//! Versioned dimension registry.
//!
//! The schema of scored dimensions is append-only: new dimensions are added
//! as a new version after a worker vote, never by live mutation, and
//! existing dimensions are never removed or reweighted.

use arbiter_types::phi::DIMENSIONS_PER_AXIOM;
use arbiter_types::{Axiom, Dimension, DimensionId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// The residual meta-dimension. Accounting only: it carries no template
/// weight and raw signals are not required to score it.
pub const RESIDUAL_DIMENSION: &str = "meta.residual";

/// Seed facet names per axiom, in template-position order.
const SEED_FACETS: [(Axiom, [&str; DIMENSIONS_PER_AXIOM]); 5] = [
    (
        Axiom::Accuracy,
        [
            "factuality",
            "precision",
            "consistency",
            "validity",
            "coverage",
            "reproducibility",
            "calibration",
        ],
    ),
    (
        Axiom::Coherence,
        [
            "structure",
            "clarity",
            "logical-flow",
            "unity",
            "parsimony",
            "transitions",
            "terminology",
        ],
    ),
    (
        Axiom::Evidence,
        [
            "provenance",
            "citation",
            "verifiability",
            "integrity",
            "recency",
            "independence",
            "transparency",
        ],
    ),
    (
        Axiom::Relevance,
        [
            "goal-fit",
            "constraint-fit",
            "audience-fit",
            "scope",
            "timeliness",
            "priority",
            "context-use",
        ],
    ),
    (
        Axiom::Economy,
        [
            "cost",
            "latency",
            "brevity",
            "resource-use",
            "maintainability",
            "reuse",
            "waste",
        ],
    ),
];

/// Append-only, versioned registry of scored dimensions.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DimensionRegistry {
    dimensions: Vec<Dimension>,
    version: u64,
}

impl DimensionRegistry {
    /// Seed registry: 5 axioms × 7 dimensions, version 1.
    pub fn seed() -> Self {
        let mut dimensions = Vec::with_capacity(5 * DIMENSIONS_PER_AXIOM);
        for (axiom, facets) in SEED_FACETS {
            for (i, facet) in facets.iter().enumerate() {
                dimensions.push(Dimension {
                    id: DimensionId::new(format!("{}.{}", axiom, facet)),
                    axiom,
                    position: (i + 1) as u8,
                    description: String::new(),
                });
            }
        }
        Self {
            dimensions,
            version: 1,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// All scored dimensions, in registration order.
    pub fn dimensions(&self) -> &[Dimension] {
        &self.dimensions
    }

    /// Scored dimensions under one axiom, in position order.
    pub fn dimensions_for(&self, axiom: Axiom) -> Vec<&Dimension> {
        self.dimensions
            .iter()
            .filter(|d| d.axiom == axiom)
            .collect()
    }

    pub fn contains(&self, id: &DimensionId) -> bool {
        self.dimensions.iter().any(|d| &d.id == id)
    }

    /// Total slot count including the residual meta-dimension.
    pub fn total_slots(&self) -> usize {
        self.dimensions.len() + 1
    }

    /// Append an adopted dimension and bump the registry version.
    ///
    /// Emergent dimensions enter at template position 5 (the φ⁻² slot) so a
    /// freshly adopted facet starts with the lowest structural influence.
    pub fn append(
        &mut self,
        id: DimensionId,
        axiom: Axiom,
        description: impl Into<String>,
    ) -> Result<u64, RegistryError> {
        if self.contains(&id) {
            return Err(RegistryError::DuplicateDimension(id.0));
        }
        self.dimensions.push(Dimension {
            id: id.clone(),
            axiom,
            position: 5,
            description: description.into(),
        });
        self.version += 1;
        info!(dimension = %id, axiom = %axiom, version = self.version, "Dimension adopted");
        Ok(self.version)
    }
}

impl Default for DimensionRegistry {
    fn default() -> Self {
        Self::seed()
    }
}

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Dimension already registered: {0}")]
    DuplicateDimension(String),
}
