use crate::types::{Build, TaskOutput, TaskType};
use foundry_core::GeneratedFile;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

fn file_marker_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::expect_used)]
    RE.get_or_init(|| {
        Regex::new(r"(?m)^[ \t]*(?://|#|/\*|<!--)[ \t]*File:[ \t]*(.+?)[ \t]*(?:\*/|-->)?[ \t]*$")
            .expect("file marker regex is valid")
    })
}

fn fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::expect_used)]
    RE.get_or_init(|| {
        Regex::new(r"(?ms)^```([a-zA-Z0-9_+-]*)[ \t]*\n(.*?)^```[ \t]*$")
            .expect("code fence regex is valid")
    })
}

/// Parse a provider response into structured task output.
///
/// Primary path: explicit `// File: path` marker lines (also `#`, `/* */`
/// and `<!-- -->` comment forms), each followed by that file's content.
/// Fallback for code tasks without markers: fenced code blocks become
/// `generated_N.ext` files. Anything before the first marker and the whole
/// response for prose tasks land in `messages`.
pub fn parse_task_output(task_type: TaskType, response: &str) -> TaskOutput {
    let mut output = TaskOutput::default();

    if !task_type.produces_code() {
        let trimmed = response.trim();
        if !trimmed.is_empty() {
            output.messages.push(trimmed.to_string());
        }
        return output;
    }

    let markers: Vec<(usize, usize, String)> = file_marker_re()
        .captures_iter(response)
        .filter_map(|cap| {
            let whole = cap.get(0)?;
            let path = cap.get(1)?.as_str();
            Some((whole.start(), whole.end(), path.to_string()))
        })
        .collect();

    if !markers.is_empty() {
        let preamble = response[..markers[0].0].trim();
        if !preamble.is_empty() {
            output.messages.push(preamble.to_string());
        }
        for (i, (_, content_start, raw_path)) in markers.iter().enumerate() {
            let content_end = markers
                .get(i + 1)
                .map_or(response.len(), |next| next.0);
            let Some(path) = sanitize_file_path(raw_path) else {
                continue;
            };
            let content = strip_surrounding_fence(response[*content_start..content_end].trim());
            if content.is_empty() {
                continue;
            }
            let language = detect_language(&path, content);
            output.files.push(GeneratedFile::new(path, content, language));
        }
        return output;
    }

    // No markers: fall back to fenced blocks with synthetic names.
    let mut index = 0;
    for cap in fence_re().captures_iter(response) {
        let lang = cap.get(1).map_or("", |m| m.as_str());
        let body = cap.get(2).map_or("", |m| m.as_str()).trim();
        if body.is_empty() || !looks_like_code(body) {
            continue;
        }
        index += 1;
        let ext = language_to_extension(lang);
        let path = format!("generated_{index}.{ext}");
        let language = if lang.is_empty() {
            detect_language(&path, body).to_string()
        } else {
            lang.to_lowercase()
        };
        output.files.push(GeneratedFile::new(path, body, language));
    }

    if output.files.is_empty() {
        let trimmed = response.trim();
        if !trimmed.is_empty() {
            output.messages.push(trimmed.to_string());
        }
    }
    output
}

/// Sanitize a file path from a marker line. Returns `None` for paths that
/// must not be written: absolute paths, drive letters, and `..` traversal.
/// Trailing parenthesized annotations (`main.ts (updated)`) are stripped.
pub fn sanitize_file_path(raw: &str) -> Option<String> {
    let mut path = raw.trim().trim_matches('`').trim();
    if let Some(idx) = path.find(" (") {
        path = path[..idx].trim_end();
    }
    let path = path.replace('\\', "/");
    if path.is_empty() || path.len() > 512 {
        return None;
    }
    if path.starts_with('/') || path.starts_with('~') {
        return None;
    }
    let bytes = path.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        return None;
    }
    if path.split('/').any(|seg| seg == ".." || seg.is_empty()) {
        return None;
    }
    Some(path.trim_start_matches("./").to_string())
}

/// Language tag for a file, from its extension first, content second.
pub fn detect_language(path: &str, content: &str) -> &'static str {
    let ext = path.rsplit('.').next().unwrap_or("");
    match ext {
        "rs" => "rust",
        "ts" => "typescript",
        "tsx" => "typescript",
        "js" | "mjs" => "javascript",
        "jsx" => "javascript",
        "py" => "python",
        "go" => "go",
        "sql" => "sql",
        "html" => "html",
        "css" => "css",
        "json" => "json",
        "yaml" | "yml" => "yaml",
        "toml" => "toml",
        "md" => "markdown",
        "sh" => "shell",
        _ => {
            if content.contains("SELECT") && content.contains("FROM") {
                "sql"
            } else if content.contains("function") || content.contains("=>") {
                "javascript"
            } else {
                "text"
            }
        }
    }
}

fn language_to_extension(lang: &str) -> &'static str {
    match lang.to_lowercase().as_str() {
        "rust" => "rs",
        "typescript" | "ts" => "ts",
        "javascript" | "js" => "js",
        "python" | "py" => "py",
        "go" => "go",
        "sql" => "sql",
        "html" => "html",
        "css" => "css",
        "json" => "json",
        "yaml" | "yml" => "yaml",
        "shell" | "bash" | "sh" => "sh",
        _ => "txt",
    }
}

/// Heuristic filter keeping prose out of the fenced-block fallback.
fn looks_like_code(body: &str) -> bool {
    let markers = [
        "{", "}", ";", "=>", "def ", "fn ", "func ", "import ", "SELECT", "CREATE", "<",
    ];
    markers.iter().any(|m| body.contains(m))
}

fn strip_surrounding_fence(content: &str) -> &str {
    let trimmed = content.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        if let Some(nl) = rest.find('\n') {
            let inner = &rest[nl + 1..];
            return inner.strip_suffix("```").unwrap_or(inner).trim();
        }
    }
    trimmed
}

/// Collect the deduplicated artifact set across all completed tasks.
///
/// Duplicate paths keep whichever content is longer after trimming. The
/// synthetic `generated_N.*` fallback names are dropped once any task has
/// produced a real path.
pub fn collect_generated_files(build: &Build) -> Vec<GeneratedFile> {
    let mut by_path: BTreeMap<String, GeneratedFile> = BTreeMap::new();
    for task in build.completed_tasks() {
        let Some(output) = &task.output else { continue };
        for file in &output.files {
            match by_path.get(&file.path) {
                Some(existing)
                    if existing.content.trim().len() >= file.content.trim().len() => {}
                _ => {
                    by_path.insert(file.path.clone(), file.clone());
                }
            }
        }
    }
    let has_real_paths = by_path.keys().any(|p| !p.starts_with("generated_"));
    by_path
        .into_values()
        .filter(|f| !has_real_paths || !f.path.starts_with("generated_"))
        .collect()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
