// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod pricing;
mod mock;
mod run;
mod types;

pub use mock::{NodeScript, ScriptedModel, StreamScript};
pub use run::{DeltaStream, ModelProvider, ModelRun, Node, NodeResult, StreamDelta};
pub use types::*;
