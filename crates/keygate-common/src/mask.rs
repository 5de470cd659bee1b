const SNIPPET_CAP: usize = 2048;

/// Masks a credential for read surfaces: `sk-proj…WXYZ` style.
pub fn mask_key(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 8 {
        return "***".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}***{tail}")
}

/// Truncates a request body to the snippet cap and blanks secret-looking
/// tokens before the snippet is stored.
pub fn redact_snippet(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let truncated = truncate_chars(&text, SNIPPET_CAP);
    redact_tokens(&truncated)
}

fn truncate_chars(text: &str, cap: usize) -> String {
    let mut end = text.len().min(cap);
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

fn redact_tokens(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = find_secret_start(rest) {
        let (before, tail) = rest.split_at(pos);
        out.push_str(before);
        let token_len = tail
            .char_indices()
            .find(|(_, c)| !is_token_char(*c))
            .map(|(i, _)| i)
            .unwrap_or(tail.len());
        let token = &tail[..token_len];
        out.push_str(&mask_key(token));
        rest = &tail[token_len..];
    }
    out.push_str(rest);
    out
}

fn find_secret_start(text: &str) -> Option<usize> {
    const PREFIXES: [&str; 4] = ["sk-", "AIza", "sk_live_", "Bearer "];
    PREFIXES
        .iter()
        .filter_map(|prefix| match text.find(prefix) {
            // "Bearer " itself is not the secret; skip past it.
            Some(idx) if *prefix == "Bearer " => Some(idx + prefix.len()),
            other => other,
        })
        .min()
}

fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.'
}
