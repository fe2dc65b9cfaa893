//! Wiki string arrays: whitespace separated items, `[[...]]` for items that
//! contain spaces. Used for the `tags` and `list` fields.

/// Parse a string array, dropping duplicates and empty items while keeping
/// first-seen order.
pub fn parse_list(value: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut rest = value.trim_start();
    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix("[[") {
            if let Some(end) = after.find("]]") {
                push_unique(&mut out, &after[..end]);
                rest = after[end + 2..].trim_start();
                continue;
            }
        }
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        push_unique(&mut out, &rest[..end]);
        rest = rest[end..].trim_start();
    }
    out
}

/// Inverse of [`parse_list`].
pub fn stringify_list<I, S>(items: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    items
        .into_iter()
        .filter(|item| !item.as_ref().is_empty())
        .map(|item| {
            let item = item.as_ref();
            if item.contains(char::is_whitespace) {
                format!("[[{item}]]")
            } else {
                item.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn push_unique(out: &mut Vec<String>, item: &str) {
    if !item.is_empty() && !out.iter().any(|existing| existing == item) {
        out.push(item.to_string());
    }
}
