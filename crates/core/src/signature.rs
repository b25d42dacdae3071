//! Goal signatures - the normalized key used to cluster runs of "the same"
//! task and to look up procedural workflows.

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "in", "into", "is", "it",
    "me", "my", "of", "on", "or", "please", "the", "then", "this", "to", "with", "you", "your",
];

/// Normalize a goal into its signature.
///
/// Lowercases, removes quoted substrings (the variable part of most goals),
/// splits on non-alphanumerics, and drops numbers and stop-words. Remaining
/// tokens keep their original order.
pub fn goal_signature(goal: &str) -> String {
    let lowered = goal.to_lowercase();
    let unquoted = strip_quoted(&lowered);
    unquoted
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .filter(|t| !t.chars().all(|c| c.is_ascii_digit()))
        .filter(|t| !STOP_WORDS.contains(t))
        .collect::<Vec<_>>()
        .join(" ")
}

fn strip_quoted(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut open: Option<char> = None;
    for c in text.chars() {
        match open {
            Some(q) if c == q => {
                open = None;
                out.push(' ');
            }
            Some(_) => {}
            None if c == '"' || c == '\'' || c == '`' => open = Some(c),
            None => out.push(c),
        }
    }
    out
}
