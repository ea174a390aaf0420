//! CLI command handlers.

mod build;
mod checkpoints;
mod collect;
mod schema;

pub use build::{run_build_command, run_validate_command};
pub use checkpoints::{run_checkpoints_delete_command, run_checkpoints_list_command};
pub use collect::{run_collect_command, run_pipeline_command};
pub use schema::run_schema_command;
