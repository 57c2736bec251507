/*
 * Fairing - In-cluster image builds and model serving for Kubernetes
 * Copyright (C) 2025 Fairing Contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::doc_markdown)]

//! Fairing core library
//!
//! Pod specs are shaped by an ordered [`PodSpecPipeline`] of mutators and then
//! submitted either as a serving Deployment plus Service ([`ServingDeployer`])
//! or as a kaniko builder pod ([`ClusterBuilder`]). All cluster traffic goes
//! through the [`ClusterApi`] handle passed to those workflows.

pub mod builder;
pub mod cluster;
pub mod error;
pub mod mutators;
pub mod pipeline;
pub mod serving;

pub use builder::{BuildContext, ClusterBuilder, ContextSource, PvcContextSource};
pub use cluster::{ClusterApi, KubeClusterApi};
pub use error::{Error, Result};
pub use mutators::{AddEnv, EnvValue, EnvVars, MountPvc, MutatorContext, PodSpecMutator, ResourceLimits};
pub use pipeline::PodSpecPipeline;
pub use serving::{SeldonServing, ServingDeployer, TeardownOutcome};
