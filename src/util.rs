//! Small shared helpers.

/// Convert a title to a branch-safe slug: lowercase, non-alphanumerics
/// collapse to single `-`, leading/trailing runs trimmed. An input with no
/// alphanumeric characters slugs to `"unnamed"`.
pub fn slugify(title: &str) -> String {
    let slug: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.is_empty() {
        "unnamed".to_string()
    } else {
        slug
    }
}

/// Last `max_chars` characters of `text`, respecting char boundaries.
/// Used to bound the hook/agent output fed back into prompts.
pub fn tail(text: &str, max_chars: usize) -> &str {
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    let skip = count - max_chars;
    match text.char_indices().nth(skip) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

/// Derive a human title from a file stem: `deploy-server_v2` → `Deploy Server V2`.
pub fn title_from_stem(stem: &str) -> String {
    stem.split(['-', '_'])
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
