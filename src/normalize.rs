use std::collections::HashSet;

use bytes::Bytes;
use serde_json::Value;

/// Transport-level headers that never participate in matching: their values
/// vary with connection framing, not request semantics.
const TRANSPORT_HEADERS: [&str; 10] = [
    "connection",
    "content-length",
    "host",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Effective matching policy for one request: the global always-ignored
/// header set merged with the route's ignore lists.
#[derive(Debug, Clone, Default)]
pub struct MatchPolicy {
    pub ignore_headers: HashSet<String>,
    pub ignore_query_params: HashSet<String>,
    pub ignore_body_fields: Vec<String>,
}

impl MatchPolicy {
    pub fn new(
        global_ignore_headers: &[String],
        route_ignore_headers: &[String],
        route_ignore_query_params: &[String],
        route_ignore_body_fields: &[String],
    ) -> Self {
        let ignore_headers = global_ignore_headers
            .iter()
            .chain(route_ignore_headers.iter())
            .map(|name| name.to_ascii_lowercase())
            .collect();
        let ignore_query_params = route_ignore_query_params.iter().cloned().collect();
        Self {
            ignore_headers,
            ignore_query_params,
            ignore_body_fields: route_ignore_body_fields.to_vec(),
        }
    }
}

/// Canonical form of a request. Two requests that are equivalent under the
/// matching policy produce identical values, byte for byte.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalRequest {
    pub method: String,
    pub path: String,
    /// Decoded `(name, value)` pairs, ignore-filtered, sorted by name then value.
    pub query: Vec<(String, String)>,
    /// Lowercased names sorted lexicographically; values keep transmission order.
    pub headers: Vec<(String, Vec<String>)>,
    pub body: CanonicalBody,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CanonicalBody {
    /// Compact JSON with recursively sorted object keys.
    Json(String),
    /// Re-encoded form pairs, sorted like query pairs.
    Form(String),
    /// Anything else: the raw byte sequence.
    Raw(Bytes),
}

impl CanonicalBody {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Json(text) | Self::Form(text) => text.as_bytes(),
            Self::Raw(bytes) => bytes,
        }
    }
}

pub fn normalize(
    method: &hyper::Method,
    raw_path: &str,
    raw_query: Option<&str>,
    headers: &hyper::HeaderMap,
    body: &[u8],
    policy: &MatchPolicy,
) -> CanonicalRequest {
    let content_type = headers
        .get(hyper::header::CONTENT_TYPE)
        .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned());

    CanonicalRequest {
        method: method.as_str().to_ascii_uppercase(),
        path: normalize_path(raw_path),
        query: normalize_query(raw_query, &policy.ignore_query_params),
        headers: normalize_headers(headers, &policy.ignore_headers),
        body: normalize_body(body, content_type.as_deref(), &policy.ignore_body_fields),
    }
}

/// Percent-decodes once (leaving `%2F` sequences intact so an encoded slash
/// never becomes a separator), lowercases, collapses duplicate `/`, and
/// strips the trailing `/` unless the whole path is `/`.
pub fn normalize_path(raw: &str) -> String {
    let decoded = percent_decode_path(raw);
    let lowered = decoded.to_lowercase();

    let mut out = String::with_capacity(lowered.len() + 1);
    if !lowered.starts_with('/') {
        out.push('/');
    }
    let mut prev_slash = out.ends_with('/');
    for ch in lowered.chars() {
        if ch == '/' {
            if prev_slash {
                continue;
            }
            prev_slash = true;
        } else {
            prev_slash = false;
        }
        out.push(ch);
    }

    while out.len() > 1 && out.ends_with('/') {
        out.pop();
    }
    out
}

fn percent_decode_path(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    while idx < bytes.len() {
        if bytes[idx] == b'%' && idx + 2 < bytes.len() {
            let hi = (bytes[idx + 1] as char).to_digit(16);
            let lo = (bytes[idx + 2] as char).to_digit(16);
            if let (Some(hi), Some(lo)) = (hi, lo) {
                let decoded = (hi * 16 + lo) as u8;
                if decoded == b'/' {
                    // Encoded slash stays literal.
                    out.extend_from_slice(&bytes[idx..idx + 3]);
                } else {
                    out.push(decoded);
                }
                idx += 3;
                continue;
            }
        }
        out.push(bytes[idx]);
        idx += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn normalize_query(raw: Option<&str>, ignore: &HashSet<String>) -> Vec<(String, String)> {
    let mut pairs: Vec<(String, String)> = parse_query_pairs(raw)
        .into_iter()
        .filter(|(name, _)| !ignore.contains(name))
        .collect();
    pairs.sort_unstable();
    pairs
}

/// Splits a raw query/form string into decoded `(name, value)` pairs,
/// keeping blank values and transmission order.
pub fn parse_query_pairs(raw: Option<&str>) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let Some(raw) = raw else { return out };

    for segment in raw.split('&') {
        if segment.is_empty() {
            continue;
        }
        let mut parts = segment.splitn(2, '=');
        let name = parts.next().unwrap_or_default();
        let value = parts.next().unwrap_or_default();
        out.push((url_decode_component(name), url_decode_component(value)));
    }
    out
}

fn url_decode_component(raw: &str) -> String {
    let plus_replaced = raw.replace('+', " ");
    let decoded = urlencoding::decode_binary(plus_replaced.as_bytes());
    String::from_utf8_lossy(&decoded).into_owned()
}

fn normalize_headers(
    headers: &hyper::HeaderMap,
    ignore: &HashSet<String>,
) -> Vec<(String, Vec<String>)> {
    let mut grouped: std::collections::BTreeMap<String, Vec<String>> =
        std::collections::BTreeMap::new();
    for (name, value) in headers.iter() {
        let name_lc = name.as_str().to_ascii_lowercase();
        if ignore.contains(&name_lc) || TRANSPORT_HEADERS.contains(&name_lc.as_str()) {
            continue;
        }
        grouped
            .entry(name_lc)
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    grouped.into_iter().collect()
}

fn normalize_body(body: &[u8], content_type: Option<&str>, ignore_fields: &[String]) -> CanonicalBody {
    if body.is_empty() {
        return CanonicalBody::Raw(Bytes::new());
    }

    let content_type_lc = content_type.map(|value| value.to_ascii_lowercase());
    let mime = content_type_lc
        .as_deref()
        .map(|value| value.split(';').next().unwrap_or(value).trim().to_owned());

    if mime.as_deref().is_some_and(is_json_mime) {
        match serde_json::from_slice::<Value>(body) {
            Ok(mut parsed) => {
                for expression in ignore_fields {
                    if let Some(steps) = parse_json_path_lite(expression) {
                        remove_json_path(&mut parsed, &steps);
                    }
                }
                // serde_json's Map is sorted by key, so serialization is canonical.
                return CanonicalBody::Json(parsed.to_string());
            }
            Err(err) => {
                tracing::debug!("request body declared as JSON failed to parse: {err}");
                return CanonicalBody::Raw(Bytes::copy_from_slice(body));
            }
        }
    }

    if mime.as_deref() == Some("application/x-www-form-urlencoded") {
        let text = String::from_utf8_lossy(body);
        let ignored: HashSet<&str> = ignore_fields.iter().map(String::as_str).collect();
        let mut pairs: Vec<(String, String)> = parse_query_pairs(Some(&text))
            .into_iter()
            .filter(|(name, _)| !ignored.contains(name.as_str()))
            .collect();
        pairs.sort_unstable();
        return CanonicalBody::Form(encode_pairs(&pairs));
    }

    CanonicalBody::Raw(Bytes::copy_from_slice(body))
}

fn is_json_mime(mime: &str) -> bool {
    mime == "application/json" || mime.ends_with("+json")
}

/// Re-encodes decoded pairs so a value containing `&` or `=` cannot alias a
/// pair boundary in the canonical stream.
pub fn encode_pairs(pairs: &[(String, String)]) -> String {
    let mut out = String::new();
    for (idx, (name, value)) in pairs.iter().enumerate() {
        if idx > 0 {
            out.push('&');
        }
        out.push_str(&urlencoding::encode(name));
        out.push('=');
        out.push_str(&urlencoding::encode(value));
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PathStep {
    Key(String),
    Index(usize),
}

/// Parses the restricted JSONPath grammar: `$` followed by `.name` or
/// `[index]` steps. Anything else yields `None` and the expression is
/// silently ignored by the caller.
fn parse_json_path_lite(expression: &str) -> Option<Vec<PathStep>> {
    let rest = expression.strip_prefix('$')?;
    let bytes = rest.as_bytes();
    let mut steps = Vec::new();
    let mut idx = 0;

    while idx < bytes.len() {
        match bytes[idx] {
            b'.' => {
                idx += 1;
                let start = idx;
                if idx >= bytes.len() || !(bytes[idx].is_ascii_alphabetic() || bytes[idx] == b'_') {
                    return None;
                }
                while idx < bytes.len() && (bytes[idx].is_ascii_alphanumeric() || bytes[idx] == b'_')
                {
                    idx += 1;
                }
                steps.push(PathStep::Key(rest[start..idx].to_owned()));
            }
            b'[' => {
                idx += 1;
                let start = idx;
                while idx < bytes.len() && bytes[idx].is_ascii_digit() {
                    idx += 1;
                }
                if start == idx || idx >= bytes.len() || bytes[idx] != b']' {
                    return None;
                }
                let index = rest[start..idx].parse().ok()?;
                steps.push(PathStep::Index(index));
                idx += 1;
            }
            _ => return None,
        }
    }

    if steps.is_empty() {
        return None;
    }
    Some(steps)
}

/// Deletes the subtree selected by `steps` from its parent. Array removal
/// shifts subsequent indices. Non-matching paths are a no-op.
fn remove_json_path(value: &mut Value, steps: &[PathStep]) {
    let (last, parents) = match steps.split_last() {
        Some(split) => split,
        None => return,
    };

    let mut cursor = value;
    for step in parents {
        cursor = match (step, cursor) {
            (PathStep::Key(key), Value::Object(map)) => match map.get_mut(key) {
                Some(child) => child,
                None => return,
            },
            (PathStep::Index(index), Value::Array(items)) => match items.get_mut(*index) {
                Some(child) => child,
                None => return,
            },
            _ => return,
        };
    }

    match (last, cursor) {
        (PathStep::Key(key), Value::Object(map)) => {
            map.remove(key);
        }
        (PathStep::Index(index), Value::Array(items)) => {
            if *index < items.len() {
                items.remove(*index);
            }
        }
        _ => {}
    }
}
