//! Input bounds applied before any write, plus sanitization of search queries that
//! callers hand to an external documentation-search subprocess.

use crate::error::{CoordinationError, HiveResult};

pub const MAX_TITLE_LEN: usize = 200;
pub const MAX_DESCRIPTION_LEN: usize = 10_000;
pub const MAX_SEARCH_QUERY_LEN: usize = 200;
pub const MAX_ARTIFACT_NAME_LEN: usize = 128;
pub const MAX_AGENT_ID_LEN: usize = 64;
pub const MAX_TASK_ID_LEN: usize = 128;

const SHELL_METACHARACTERS: &[char] = &[
    ';', '&', '|', '$', '`', '<', '>', '(', ')', '{', '}', '\\', '"', '\'', '\n', '\r',
];

fn is_identifier(value: &str, max_len: usize) -> bool {
    (1..=max_len).contains(&value.len())
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

pub fn validate_agent_id(agent_id: &str) -> HiveResult<&str> {
    if is_identifier(agent_id, MAX_AGENT_ID_LEN) {
        Ok(agent_id)
    } else {
        Err(CoordinationError::invalid(
            "agent_id",
            format!("'{agent_id}' must match [A-Za-z0-9_-]{{1,64}}"),
        ))
    }
}

/// Task ids become store keys and bus payloads. Generated UUIDs always pass.
pub fn validate_task_id(task_id: &str) -> HiveResult<&str> {
    if is_identifier(task_id, MAX_TASK_ID_LEN) {
        Ok(task_id)
    } else {
        Err(CoordinationError::invalid(
            "task_id",
            format!(
                "'{}' must match [A-Za-z0-9_-]{{1,{MAX_TASK_ID_LEN}}}",
                task_id.escape_debug()
            ),
        ))
    }
}

pub fn validate_title(title: &str) -> HiveResult<&str> {
    let trimmed = title.trim();
    if trimmed.is_empty() {
        return Err(CoordinationError::invalid("title", "must not be empty"));
    }
    if title.chars().count() > MAX_TITLE_LEN {
        return Err(CoordinationError::invalid(
            "title",
            format!("longer than {MAX_TITLE_LEN} characters"),
        ));
    }
    if title.chars().any(char::is_control) {
        return Err(CoordinationError::invalid("title", "contains control characters"));
    }
    Ok(trimmed)
}

pub fn validate_description(description: &str) -> HiveResult<&str> {
    if description.chars().count() > MAX_DESCRIPTION_LEN {
        return Err(CoordinationError::invalid(
            "description",
            format!("longer than {MAX_DESCRIPTION_LEN} characters"),
        ));
    }
    if description.contains('\0') {
        return Err(CoordinationError::invalid("description", "contains NUL"));
    }
    Ok(description)
}

/// Artifact names follow the single-segment lock path rules.
pub fn validate_artifact_name(name: &str) -> HiveResult<&str> {
    if name.len() > MAX_ARTIFACT_NAME_LEN {
        return Err(CoordinationError::invalid(
            "name",
            format!("longer than {MAX_ARTIFACT_NAME_LEN} characters"),
        ));
    }
    if name == "." || name == ".." {
        return Err(CoordinationError::PathTraversalRejected(name.to_string()));
    }
    let well_formed = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if !well_formed {
        return Err(CoordinationError::InvalidPathCharacters(name.to_string()));
    }
    Ok(name)
}

/// Make a free-text query safe to pass as a subprocess argument.
///
/// Shell metacharacters and newlines are rejected rather than escaped. Surrounding
/// whitespace is trimmed.
pub fn sanitize_search_query(query: &str) -> HiveResult<String> {
    let trimmed = query.trim();
    if trimmed.is_empty() {
        return Err(CoordinationError::invalid("query", "must not be empty"));
    }
    if trimmed.chars().count() > MAX_SEARCH_QUERY_LEN {
        return Err(CoordinationError::invalid(
            "query",
            format!("longer than {MAX_SEARCH_QUERY_LEN} characters"),
        ));
    }
    if let Some(bad) = trimmed.chars().find(|c| SHELL_METACHARACTERS.contains(c)) {
        return Err(CoordinationError::invalid(
            "query",
            format!("contains forbidden character {bad:?}"),
        ));
    }
    if trimmed.starts_with('-') {
        return Err(CoordinationError::invalid(
            "query",
            "must not start with '-'",
        ));
    }
    Ok(trimmed.to_string())
}
