pub type Headers = Vec<(String, String)>;

pub fn header_set(headers: &mut Headers, name: impl Into<String>, value: impl Into<String>) {
    let name = name.into();
    let value = value.into();
    let key = name.to_ascii_lowercase();
    if let Some((_, v)) = headers
        .iter_mut()
        .find(|(k, _)| k.to_ascii_lowercase() == key)
    {
        *v = value;
        return;
    }
    headers.push((name, value));
}

pub fn header_get<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    let key = name.to_ascii_lowercase();
    headers
        .iter()
        .find(|(k, _)| k.to_ascii_lowercase() == key)
        .map(|(_, v)| v.as_str())
}

pub fn header_remove(headers: &mut Headers, name: &str) -> Option<String> {
    let key = name.to_ascii_lowercase();
    let idx = headers
        .iter()
        .position(|(k, _)| k.to_ascii_lowercase() == key)?;
    Some(headers.remove(idx).1)
}

/// RFC 7230 hop-by-hop headers, plus the fields the dispatcher recomputes.
const HOP_BY_HOP: [&str; 10] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

/// Downstream auth material; never forwarded upstream.
const CLIENT_AUTH: [&str; 3] = ["authorization", "x-api-key", "x-goog-api-key"];

pub fn strip_hop_by_hop(headers: &mut Headers) {
    headers.retain(|(k, _)| {
        let key = k.to_ascii_lowercase();
        !HOP_BY_HOP.contains(&key.as_str())
    });
}

pub fn strip_client_auth(headers: &mut Headers) {
    headers.retain(|(k, _)| {
        let key = k.to_ascii_lowercase();
        !CLIENT_AUTH.contains(&key.as_str())
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_replaces_case_insensitively() {
        let mut headers = vec![("Content-Type".to_string(), "text/plain".to_string())];
        header_set(&mut headers, "content-type", "application/json");
        assert_eq!(headers.len(), 1);
        assert_eq!(header_get(&headers, "CONTENT-TYPE"), Some("application/json"));
    }

    #[test]
    fn hop_by_hop_stripped_content_type_kept() {
        let mut headers = vec![
            ("Connection".to_string(), "keep-alive".to_string()),
            ("Transfer-Encoding".to_string(), "chunked".to_string()),
            ("Host".to_string(), "proxy.local".to_string()),
            ("Content-Type".to_string(), "application/json".to_string()),
        ];
        strip_hop_by_hop(&mut headers);
        assert_eq!(headers.len(), 1);
        assert_eq!(headers[0].0, "Content-Type");
    }
}
