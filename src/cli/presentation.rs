//! CLI presentation: text and JSON formatters for command results.

use crate::api::ResumeReport;
use crate::control::{SessionSummary, StatusReport};
use crate::controller::GenerationResult;
use crate::error::{ApiError, StorageError};
use crate::regeneration::RegenerationOutcome;
use crate::store::{QueueStatus, RegenerationQueueEntry, ResetSummary, SessionStatus};
use crate::validate::{IdRange, QuestionAudit};
use comfy_table::presets::UTF8_BORDERS_ONLY;
use comfy_table::Table;
use owo_colors::OwoColorize;
use serde::Serialize;

pub fn format_section_heading(title: &str) -> String {
    format!("{}", title.bold().underline())
}

pub fn to_json<T: Serialize>(value: &T) -> Result<String, ApiError> {
    serde_json::to_string_pretty(value)
        .map_err(|e| ApiError::StorageError(StorageError::DataError(e.to_string())))
}

fn colored_session_status(status: SessionStatus) -> String {
    match status {
        SessionStatus::Running => status.as_str().green().to_string(),
        SessionStatus::Paused => status.as_str().yellow().to_string(),
        SessionStatus::Completed => status.as_str().cyan().to_string(),
        SessionStatus::Failed => status.as_str().red().to_string(),
        SessionStatus::Pending => status.as_str().dimmed().to_string(),
    }
}

fn colored_queue_status(status: QueueStatus) -> String {
    match status {
        QueueStatus::Pending => status.as_str().yellow().to_string(),
        QueueStatus::Processing => status.as_str().green().to_string(),
        QueueStatus::Completed => status.as_str().cyan().to_string(),
        QueueStatus::Failed => status.as_str().red().to_string(),
    }
}

fn format_timestamp(ms: u64) -> String {
    chrono::DateTime::from_timestamp_millis(ms as i64)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| ms.to_string())
}

pub fn format_generation_result(result: &GenerationResult, format: &str) -> Result<String, ApiError> {
    if format == "json" {
        return to_json(result);
    }
    let mut out = String::new();
    out.push_str(&format!("{}\n", format_section_heading("Generation")));
    out.push_str(&format!("  Session: {}\n", result.session_id));
    out.push_str(&format!("  Status: {}\n", colored_session_status(result.status)));
    out.push_str(&format!(
        "  Words: {} from id {} (limit {})\n",
        result.processed, result.start_word_id, result.limit
    ));
    out.push_str(&format!("  Questions per word: {}\n", result.pattern_count));
    if result.resumed {
        out.push_str("  Continued from the previous session\n");
    }
    Ok(out.trim_end().to_string())
}

fn format_summary_text(summary: &SessionSummary) -> String {
    let mut out = String::new();
    out.push_str(&format!("{}\n", format_section_heading("Latest session")));
    out.push_str(&format!("  Session: {}\n", summary.session_id));
    out.push_str(&format!("  Status: {}\n", colored_session_status(summary.status)));
    let total = summary
        .total_words
        .map(|t| t.to_string())
        .unwrap_or_else(|| "?".to_string());
    out.push_str(&format!("  Progress: {}/{}\n", summary.progress, total));
    if summary.failures > 0 {
        out.push_str(&format!("  Failures: {}\n", summary.failures.to_string().red()));
    } else {
        out.push_str("  Failures: 0\n");
    }
    out.push_str(&format!("  Current: {}\n", summary.note));
    if let Some(start) = summary.start_word_id {
        out.push_str(&format!("  Start word id: {}\n", start));
    }
    if let Some(parallel) = summary.parallel {
        out.push_str(&format!("  Parallel: {}\n", parallel));
    }
    if let Some(patterns) = summary.pattern_count {
        out.push_str(&format!("  Questions per word: {}\n", patterns));
    }
    out.push_str(&format!("  Updated: {}", format_timestamp(summary.updated_at_ms)));
    out
}

pub fn format_status_report(report: &StatusReport, format: &str) -> Result<String, ApiError> {
    if format == "json" {
        return to_json(report);
    }
    Ok(match report {
        StatusReport::Idle => "No generation session recorded.".to_string(),
        StatusReport::Session(summary) => format_summary_text(summary),
    })
}

pub fn format_resume_report(report: &ResumeReport, format: &str) -> Result<String, ApiError> {
    if format == "json" {
        return to_json(report);
    }
    let session = report.session_id.as_deref().unwrap_or("-");
    Ok(match (report.resumed, report.new_session_started) {
        (true, false) => format!("Session {} resumed", session),
        (true, true) => format!(
            "Session {} resumed as {} ({} words dispatched)",
            report.previous_session_id.as_deref().unwrap_or("-"),
            session,
            report.processed
        ),
        _ => format!(
            "Nothing to resume: {}",
            report.message.as_deref().unwrap_or("no remaining work")
        ),
    })
}

pub fn format_queue_entries(
    entries: &[RegenerationQueueEntry],
    format: &str,
) -> Result<String, ApiError> {
    if format == "json" {
        return to_json(&entries);
    }
    if entries.is_empty() {
        return Ok("Regeneration queue is empty.".to_string());
    }
    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Id", "Word", "Status", "Reason", "Session", "Error"]);
    for entry in entries {
        table.add_row(vec![
            entry.id.clone(),
            format!("{} ({})", entry.word, entry.word_id),
            colored_queue_status(entry.status),
            entry.reason.clone(),
            entry.session_id.clone().unwrap_or_else(|| "-".to_string()),
            entry.last_error.clone().unwrap_or_else(|| "-".to_string()),
        ]);
    }
    Ok(format!(
        "{}\n\n{}",
        format_section_heading("Regeneration queue"),
        table
    ))
}

pub fn format_queue_added(requested: usize, inserted: &[RegenerationQueueEntry]) -> String {
    let skipped = requested.saturating_sub(inserted.len());
    let mut out = format!("Queued {} word(s)", inserted.len());
    if skipped > 0 {
        out.push_str(&format!(", skipped {} already queued or invalid", skipped));
    }
    for entry in inserted {
        out.push_str(&format!("\n  {}  {} ({})", entry.id, entry.word, entry.word_id));
    }
    out
}

pub fn format_regeneration_outcome(
    outcome: &RegenerationOutcome,
    format: &str,
) -> Result<String, ApiError> {
    if format == "json" {
        return to_json(outcome);
    }
    Ok(match (&outcome.session_id, outcome.processed) {
        (_, 0) => "No pending regeneration entries.".to_string(),
        (Some(session), n) => format!("Processed {} queue entries in session {}", n, session),
        (None, n) => format!("Processed {} queue entries (no known words to regenerate)", n),
    })
}

pub fn format_reset_summary(summary: &ResetSummary) -> String {
    format!(
        "Generator data reset:\n  Questions deleted: {}\n  Logs deleted: {}\n  Sessions deleted: {}",
        summary.questions_deleted, summary.logs_deleted, summary.sessions_deleted
    )
}

fn format_range<T: std::fmt::Display>(range: &IdRange<T>) -> String {
    match (&range.min, &range.max) {
        (Some(min), Some(max)) => format!("{} .. {}", min, max),
        _ => "-".to_string(),
    }
}

pub fn format_question_audit(audit: &QuestionAudit, format: &str) -> Result<String, ApiError> {
    if format == "json" {
        return to_json(audit);
    }
    let summary = &audit.summary;
    let mut out = String::new();
    out.push_str(&format!("{}\n", format_section_heading("Question audit")));
    out.push_str(&format!("  Questions: {}\n", summary.total_questions));
    out.push_str(&format!("  Words: {}\n", summary.unique_words));
    out.push_str(&format!("  Word ids: {}\n", format_range(&summary.word_id_range)));
    out.push_str(&format!(
        "  Question ids: {}\n",
        format_range(&summary.question_id_range)
    ));
    if audit.is_clean() {
        out.push_str(&format!("\n{}", "No issues found.".green()));
        return Ok(out);
    }

    if !audit.under_count.is_empty() {
        let mut table = Table::new();
        table.load_preset(UTF8_BORDERS_ONLY);
        table.set_header(vec!["Word id", "Word", "Questions"]);
        for entry in &audit.under_count {
            table.add_row(vec![
                entry.word_id.to_string(),
                entry.word.clone(),
                format!("{}/{}", entry.count, audit.expected_per_word),
            ]);
        }
        out.push_str(&format!(
            "\n{}\n{}\n",
            format_section_heading("Too few questions"),
            table
        ));
    }

    if !audit.tag_issues.is_empty() {
        let mut table = Table::new();
        table.load_preset(UTF8_BORDERS_ONLY);
        table.set_header(vec!["Question id", "Word", "Problem", "Sentence"]);
        for issue in &audit.tag_issues {
            table.add_row(vec![
                issue.id.clone(),
                format!("{} ({})", issue.word, issue.word_id),
                issue.issue.to_string().yellow().to_string(),
                issue.sentence.clone(),
            ]);
        }
        out.push_str(&format!(
            "\n{}\n{}\n",
            format_section_heading("Underline problems"),
            table
        ));
    }

    if !audit.missing_words.is_empty() {
        out.push_str(&format!("\n{}\n", format_section_heading("Words with no questions")));
        for missing in &audit.missing_words {
            out.push_str(&format!("  {}  {}\n", missing.word_id, missing.word.red()));
        }
    }
    Ok(out.trim_end().to_string())
}

#[derive(Serialize)]
struct RepairResult<'a> {
    repair: &'a str,
    updated: usize,
}

pub fn format_repair_result(repair: &str, updated: usize, format: &str) -> Result<String, ApiError> {
    if format == "json" {
        return to_json(&RepairResult { repair, updated });
    }
    Ok(format!(
        "Repaired {} question{} ({})",
        updated,
        if updated == 1 { "" } else { "s" },
        repair
    ))
}
