//! Shared utility functions for the cowork crate.

/// Lower-case `title`, collapse every run of non-alphanumerics into a single
/// dash and cut the result to at most `max_len` bytes without a trailing dash.
pub fn slugify(title: &str, max_len: usize) -> String {
    let slug: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.len() > max_len {
        slug[..slug.floor_char_boundary(max_len)]
            .trim_end_matches('-')
            .to_string()
    } else {
        slug
    }
}

/// Branch name used for the work on an issue.
pub fn issue_branch_name(issue_number: i64, title: &str) -> String {
    let slug = slugify(title, 40);
    if slug.is_empty() {
        format!("cowork/issue-{}", issue_number)
    } else {
        format!("cowork/issue-{}-{}", issue_number, slug)
    }
}

/// Truncate `text` to `max_chars` characters, appending an ellipsis if cut.
pub fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    format!("{}…", cut)
}
