pub mod chart;
pub mod config;
pub mod domain;
pub mod errors;
pub mod pipeline;
pub mod schema;

pub use chart::{ChartError, ChartSpec};
pub use domain::answer::Answer;
pub use domain::query::{extract_sql, GeneratedQuery, QueryValidation};
pub use domain::question::Question;
pub use domain::result_set::{Column, ResultSet};
pub use domain::session::{Exchange, Session, SessionId, SessionKey};
pub use errors::{
    ApplicationError, ConnectivityTarget, DomainError, ExecutionFailure, ExecutionFailureKind,
    InterfaceError, PipelineError,
};
pub use pipeline::{PipelineEngine, PipelineEvent, PipelineState};
pub use schema::{ExtraDescriptions, SchemaCatalog};
