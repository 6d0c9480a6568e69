//! Query planner.
//!
//! Decides which adapters can serve a query. An adapter is included when its
//! known-variable catalog intersects the requested (ECV-expanded) variables;
//! every other adapter is recorded as skipped. Planning never calls a
//! remote service.

use std::collections::BTreeSet;

use crate::adapters::AdapterRegistry;
use crate::error::{FederationError, Result};
use crate::model::{Query, Ri, SkipReason};
use crate::vocabulary::Vocabulary;

/// One adapter call the facade will make.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanStep {
    pub ri: Ri,
    /// The query narrowed to the variables this adapter can serve
    pub query: Query,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    /// The query after ECV expansion; what the result fingerprint is taken over
    pub query: Query,
    /// In registry order
    pub steps: Vec<PlanStep>,
    pub skipped: Vec<(Ri, SkipReason)>,
}

impl Plan {
    pub fn ris(&self) -> Vec<Ri> {
        self.steps.iter().map(|s| s.ri).collect()
    }
}

pub struct QueryPlanner<'a> {
    vocabulary: &'a Vocabulary,
}

impl<'a> QueryPlanner<'a> {
    pub fn new(vocabulary: &'a Vocabulary) -> Self {
        Self { vocabulary }
    }

    pub fn plan(&self, query: &Query, registry: &AdapterRegistry) -> Result<Plan> {
        self.plan_with_catalogs(query, &registry.catalogs())
    }

    /// Plan against explicit `(ri, known variables)` catalogs, given in
    /// registry order.
    pub fn plan_with_catalogs(
        &self,
        query: &Query,
        catalogs: &[(Ri, BTreeSet<String>)],
    ) -> Result<Plan> {
        query.validate()?;

        let mut expanded = query.clone();
        expanded.variables = self.vocabulary.expand(&query.variables);

        let mut steps = Vec::new();
        let mut skipped = Vec::new();
        for (ri, known) in catalogs {
            if expanded.is_wildcard() {
                steps.push(PlanStep {
                    ri: *ri,
                    query: expanded.clone(),
                });
                continue;
            }

            let served: BTreeSet<String> =
                expanded.variables.intersection(known).cloned().collect();
            if served.is_empty() {
                skipped.push((*ri, SkipReason::NoMatchingVariable));
            } else {
                let mut sub = expanded.clone();
                sub.variables = served;
                steps.push(PlanStep { ri: *ri, query: sub });
            }
        }

        if steps.is_empty() {
            return Err(FederationError::NoApplicableSource {
                requested: query.variables.iter().cloned().collect(),
            });
        }

        Ok(Plan {
            query: expanded,
            steps,
            skipped,
        })
    }
}
