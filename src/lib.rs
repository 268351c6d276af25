//! Influence diagrams compiled into mixed-integer linear programs, and analysis of the
//! decision strategies a solver returns.

pub mod analysis;
pub mod config;
pub mod diagram;
pub mod error;
pub mod formulation;
pub mod model;
pub mod paths;
pub mod strategy;
pub mod tensor;

pub use analysis::{RiskMeasures, StateProbabilities, Statistics, UtilityDistribution};
pub use config::{ConfigError, DiagramConfig, InfluenceDiagram, Labels};
pub use diagram::{Diagram, Node, NodeKind, State};
pub use error::{Error, ErrorKind, Result};
pub use formulation::{
    conditional_value_at_risk, expected_value, formulate, CompatibilityOptions, DecisionVariables,
    Formulation, Objective, PathCompatibilityVariables,
};
pub use model::{LinearExpr, LinearModel, Model, Relation, Sense, Solution, Variable, VariableKind};
pub use paths::{path_probability, CompatiblePaths, ForbiddenPath, ForbiddenPaths, PathSpace};
pub use strategy::{DecisionRule, DecisionStrategy};
pub use tensor::{Consequences, PathUtility, Probabilities, ShiftedUtility, Tensor};

/// Initializes terminal logging for the binaries: `Debug` when verbose, `Info` otherwise.
pub fn init_logger(verbose: bool) {
    let level = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    let config = simplelog::ConfigBuilder::new()
        .set_location_level(log::LevelFilter::Off)
        .set_target_level(log::LevelFilter::Off)
        .set_thread_level(log::LevelFilter::Off)
        .build();
    // a logger may already be installed, in which case it keeps running
    let _ = simplelog::TermLogger::init(
        level,
        config,
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );
}
