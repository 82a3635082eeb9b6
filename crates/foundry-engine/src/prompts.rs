use crate::retry::RetryStrategy;
use crate::types::{AgentRole, Build, Task, TaskType};
use foundry_core::EngineConfig;

/// Sampling temperature per role. Reasoning roles explore; code-producing
/// roles stay deterministic.
pub fn temperature_for_role(role: AgentRole) -> f32 {
    match role {
        AgentRole::Planner | AgentRole::Architect => 0.7,
        AgentRole::Lead => 0.6,
        AgentRole::Reviewer => 0.4,
        AgentRole::Testing => 0.3,
        AgentRole::Frontend | AgentRole::Backend | AgentRole::Database => 0.2,
        AgentRole::Solver => 0.1,
    }
}

/// Token budget for one attempt: the build's guardrail ceiling, which the
/// executor reduces after a `reduce_context` classification.
pub fn max_tokens_for_role(role: AgentRole, build: &Build) -> u32 {
    let base = build.limits.max_tokens;
    match role {
        // Review output is prose; cap it below the generation budget.
        AgentRole::Reviewer => base.min(2_000).max(base / 2),
        _ => base,
    }
}

/// Task type produced when a role is scheduled through the phased pipeline.
pub fn task_type_for_role(role: AgentRole) -> TaskType {
    match role {
        AgentRole::Planner => TaskType::Plan,
        AgentRole::Architect => TaskType::Architecture,
        AgentRole::Frontend => TaskType::GenerateUi,
        AgentRole::Backend => TaskType::GenerateApi,
        AgentRole::Database => TaskType::GenerateSchema,
        AgentRole::Testing => TaskType::Test,
        AgentRole::Reviewer => TaskType::Review,
        AgentRole::Solver => TaskType::Fix,
        AgentRole::Lead => TaskType::GenerateFile,
    }
}

/// Human-readable description for a role's phase task.
pub fn task_description_for_role(role: AgentRole, app_description: &str) -> String {
    match role {
        AgentRole::Architect => format!("Design the architecture for: {app_description}"),
        AgentRole::Frontend => format!("Build the frontend UI for: {app_description}"),
        AgentRole::Backend => format!("Create the backend API for: {app_description}"),
        AgentRole::Database => format!("Design the database schema for: {app_description}"),
        AgentRole::Testing => format!("Write tests for: {app_description}"),
        AgentRole::Reviewer => format!("Review code quality for: {app_description}"),
        AgentRole::Solver => format!("Investigate and fix build failures for: {app_description}"),
        _ => app_description.to_string(),
    }
}

/// Scheduling priority for a role's phase task. Recovery work preempts
/// everything except planning.
pub fn priority_for_role(role: AgentRole) -> u8 {
    match role {
        AgentRole::Planner => 100,
        AgentRole::Solver => 95,
        AgentRole::Architect => 90,
        AgentRole::Database => 80,
        AgentRole::Backend => 70,
        AgentRole::Frontend => 60,
        AgentRole::Testing => 50,
        AgentRole::Reviewer => 40,
        AgentRole::Lead => 50,
    }
}

/// System prompt per role.
pub fn system_prompt_for_role(role: AgentRole) -> &'static str {
    match role {
        AgentRole::Lead => LEAD_PROMPT,
        AgentRole::Planner => PLANNER_PROMPT,
        AgentRole::Architect => ARCHITECT_PROMPT,
        AgentRole::Frontend => FRONTEND_PROMPT,
        AgentRole::Backend => BACKEND_PROMPT,
        AgentRole::Database => DATABASE_PROMPT,
        AgentRole::Testing => TESTING_PROMPT,
        AgentRole::Reviewer => REVIEWER_PROMPT,
        AgentRole::Solver => SOLVER_PROMPT,
    }
}

/// Assemble the prompt for one task attempt.
///
/// Injects upstream context (architecture notes, schema, generated code for
/// reviewer/solver roles), the task's pruned error history, and corrective
/// guidance after a `fix_and_retry` classification. Code-producing tasks get
/// the file-marker output convention appended.
pub fn build_task_prompt(build: &Build, task: &Task, role: AgentRole, config: &EngineConfig) -> String {
    let mut prompt = String::new();
    prompt.push_str(&format!("Application request: {}\n\n", build.description));
    prompt.push_str(&format!("Your task: {}\n", task.description));

    if let Some(notes) = upstream_messages(build, TaskType::Architecture) {
        prompt.push_str("\nArchitecture notes:\n");
        prompt.push_str(&truncate_head(&notes, config.code_context_chars));
        prompt.push('\n');
    }
    if role != AgentRole::Architect && role != AgentRole::Database {
        if let Some(schema) = upstream_files(build, TaskType::GenerateSchema, config) {
            prompt.push_str("\nDatabase schema:\n");
            prompt.push_str(&schema);
            prompt.push('\n');
        }
    }
    if matches!(role, AgentRole::Reviewer | AgentRole::Solver | AgentRole::Testing) {
        if let Some(code) = generated_code_context(build, config) {
            prompt.push_str("\nGenerated code so far:\n");
            prompt.push_str(&code);
            prompt.push('\n');
        }
    }

    if !task.error_history.is_empty() {
        prompt.push_str("\nPrevious attempts failed:\n");
        prompt.push_str(&error_context(task, config));
        prompt.push('\n');
    }
    if task.retry_strategy == Some(RetryStrategy::FixAndRetry) {
        prompt.push_str(
            "\nYour previous output failed verification. Fix the reported issues \
             and return the corrected files in full.\n",
        );
    }
    if let Some(context) = task.input.get("failure_context").and_then(|v| v.as_str()) {
        prompt.push_str("\nFailure being recovered:\n");
        prompt.push_str(&truncate_tail(context, config.error_context_chars));
        prompt.push('\n');
    }

    if task.task_type.produces_code() {
        prompt.push_str(FILE_OUTPUT_CONVENTION);
    }
    prompt
}

/// Format a task's error history, keeping only the newest
/// `error_context_chars` characters.
pub fn error_context(task: &Task, config: &EngineConfig) -> String {
    let mut history = String::new();
    for entry in &task.error_history {
        history.push_str(&format!(
            "attempt {} ({}): {}\n",
            entry.attempt, entry.context, entry.error
        ));
    }
    truncate_tail(&history, config.error_context_chars)
}

fn upstream_messages(build: &Build, task_type: TaskType) -> Option<String> {
    let messages: Vec<&str> = build
        .completed_tasks()
        .filter(|t| t.task_type == task_type)
        .filter_map(|t| t.output.as_ref())
        .flat_map(|o| o.messages.iter().map(String::as_str))
        .collect();
    if messages.is_empty() {
        None
    } else {
        Some(messages.join("\n"))
    }
}

fn upstream_files(build: &Build, task_type: TaskType, config: &EngineConfig) -> Option<String> {
    let mut out = String::new();
    for task in build.completed_tasks().filter(|t| t.task_type == task_type) {
        if let Some(output) = &task.output {
            for file in &output.files {
                out.push_str(&format!("// File: {}\n{}\n", file.path, file.content));
            }
        }
    }
    if out.is_empty() {
        None
    } else {
        Some(truncate_head(&out, config.code_context_chars))
    }
}

fn generated_code_context(build: &Build, config: &EngineConfig) -> Option<String> {
    let files = crate::artifacts::collect_generated_files(build);
    if files.is_empty() {
        return None;
    }
    let mut out = String::new();
    for file in &files {
        out.push_str(&format!("// File: {}\n{}\n\n", file.path, file.content));
        if out.len() >= config.code_context_chars {
            break;
        }
    }
    Some(truncate_head(&out, config.code_context_chars))
}

fn truncate_head(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

fn truncate_tail(s: &str, max_chars: usize) -> String {
    let count = s.chars().count();
    if count <= max_chars {
        s.to_string()
    } else {
        s.chars().skip(count - max_chars).collect()
    }
}

const FILE_OUTPUT_CONVENTION: &str = "\n\
Output every file prefixed by a marker line of the form:\n\
// File: relative/path/to/file.ext\n\
followed by the complete file content. Do not abbreviate files.\n";

const LEAD_PROMPT: &str = "\
You are the lead agent coordinating an application build. You answer user \
messages about the build, absorb responsibilities of workers that could not \
be spawned, and keep the build converging on a deliverable result.";

const PLANNER_PROMPT: &str = "\
You are the planning agent. Turn the application request into a concise, \
ordered list of build steps. Respond with the plan as plain text.";

const ARCHITECT_PROMPT: &str = "\
You are the architecture agent. Design the system architecture for the \
requested application: components, data flow, and technology choices. \
Respond as plain text; downstream agents consume your notes verbatim.";

const FRONTEND_PROMPT: &str = "\
You are the frontend agent. Generate complete, working UI code for the \
requested application, following the architecture notes and schema.";

const BACKEND_PROMPT: &str = "\
You are the backend agent. Generate complete, working API code for the \
requested application, following the architecture notes and schema.";

const DATABASE_PROMPT: &str = "\
You are the database agent. Design the schema and emit migration files for \
the requested application.";

const TESTING_PROMPT: &str = "\
You are the testing agent. Write tests covering the generated code's happy \
paths, edge cases, and error conditions.";

const REVIEWER_PROMPT: &str = "\
You are the review agent. Review the generated code for correctness, \
security, and completeness. Report concrete issues as plain text.";

const SOLVER_PROMPT: &str = "\
You are the solver agent. A build task failed; diagnose the failure from the \
provided context and emit corrected files that fix it. Change only what the \
fix requires.";

// ─── Tests ───────────────────────────────────────────────────────────────────
