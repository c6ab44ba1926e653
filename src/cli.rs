//! CLI domain: parse, route, output, and presentation only.
//! No orchestration here; the route table dispatches to the generator API.

mod output;
mod parse;
mod presentation;
mod route;

pub use output::map_error;
pub use parse::{parse_queue_entry, Cli, Commands, QueueCommands, ValidateCommands};
pub use presentation::{
    format_generation_result, format_queue_entries, format_question_audit,
    format_regeneration_outcome, format_repair_result, format_reset_summary,
    format_resume_report, format_status_report,
};
pub use route::RunContext;
