use sha2::{Digest as _, Sha256};

use crate::normalize::{CanonicalRequest, encode_pairs};

/// Serializes a canonical request into the stable byte stream that defines
/// cassette identity:
///
/// ```text
/// METHOD \n
/// PATH \n
/// QUERY (sorted "name=value" pairs joined by &) \n
/// HEADERS (one "name: v1,v2" line each, sorted) followed by a blank line
/// BODY BYTES
/// ```
///
/// This layout is part of the on-disk contract; changing it requires a
/// version bump in cassette metadata.
pub fn canonical_bytes(request: &CanonicalRequest) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(request.method.as_bytes());
    out.push(b'\n');
    out.extend_from_slice(request.path.as_bytes());
    out.push(b'\n');
    out.extend_from_slice(encode_pairs(&request.query).as_bytes());
    out.push(b'\n');
    for (name, values) in &request.headers {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(values.join(",").as_bytes());
        out.push(b'\n');
    }
    out.push(b'\n');
    out.extend_from_slice(request.body.as_bytes());
    out
}

/// SHA-256 of the canonical byte stream, 64 hex chars, lowercase.
pub fn fingerprint(request: &CanonicalRequest) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_bytes(request));
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = vec![0u8; bytes.len() * 2];
    for (idx, byte) in bytes.iter().copied().enumerate() {
        out[idx * 2] = HEX[(byte >> 4) as usize];
        out[idx * 2 + 1] = HEX[(byte & 0x0f) as usize];
    }
    // Safety: HEX digits are valid UTF-8.
    unsafe { String::from_utf8_unchecked(out) }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::{canonical_bytes, fingerprint};
    use crate::normalize::{CanonicalBody, CanonicalRequest, MatchPolicy, normalize};

    fn request() -> CanonicalRequest {
        CanonicalRequest {
            method: "POST".to_owned(),
            path: "/api/v1/users".to_owned(),
            query: vec![
                ("a".to_owned(), "1".to_owned()),
                ("b".to_owned(), "2".to_owned()),
            ],
            headers: vec![
                ("accept".to_owned(), vec!["application/json".to_owned()]),
                ("x-a".to_owned(), vec!["1".to_owned(), "2".to_owned()]),
            ],
            body: CanonicalBody::Json(r#"{"name":"Alice"}"#.to_owned()),
        }
    }

    #[test]
    fn canonical_byte_layout_is_stable() {
        let expected = b"POST\n/api/v1/users\na=1&b=2\naccept: application/json\nx-a: 1,2\n\n{\"name\":\"Alice\"}";
        assert_eq!(canonical_bytes(&request()), expected.to_vec());
    }

    #[test]
    fn fingerprint_is_lowercase_hex_sha256() {
        let fp = fingerprint(&request());
        assert_eq!(fp.len(), 64);
        assert!(
            fp.bytes()
                .all(|byte| matches!(byte, b'0'..=b'9' | b'a'..=b'f')),
            "fingerprint should be lowercase hex, got: {fp}"
        );
    }

    #[test]
    fn fingerprint_is_deterministic_across_recomputation() {
        assert_eq!(fingerprint(&request()), fingerprint(&request()));
    }

    #[test]
    fn fingerprint_changes_with_any_body_bit() {
        let mut variant = request();
        variant.body = CanonicalBody::Json(r#"{"name":"Alicf"}"#.to_owned());
        assert_ne!(fingerprint(&request()), fingerprint(&variant));
    }

    #[test]
    fn fingerprint_changes_with_method_path_query_and_headers() {
        let base = fingerprint(&request());

        let mut variant = request();
        variant.method = "PUT".to_owned();
        assert_ne!(base, fingerprint(&variant));

        let mut variant = request();
        variant.path = "/api/v1/user".to_owned();
        assert_ne!(base, fingerprint(&variant));

        let mut variant = request();
        variant.query.push(("c".to_owned(), "3".to_owned()));
        assert_ne!(base, fingerprint(&variant));

        let mut variant = request();
        variant.headers[1].1.pop();
        assert_ne!(base, fingerprint(&variant));
    }

    #[test]
    fn empty_body_and_missing_sections_are_unambiguous() {
        let empty = CanonicalRequest {
            method: "GET".to_owned(),
            path: "/".to_owned(),
            query: Vec::new(),
            headers: Vec::new(),
            body: CanonicalBody::Raw(Bytes::new()),
        };
        assert_eq!(canonical_bytes(&empty), b"GET\n/\n\n\n".to_vec());
        assert_eq!(fingerprint(&empty).len(), 64);
    }

    #[test]
    fn query_value_containing_separators_cannot_alias_pair_boundaries() {
        let mut tricky = request();
        tricky.query = vec![("a".to_owned(), "1&b=2".to_owned())];
        let mut split = request();
        split.query = vec![
            ("a".to_owned(), "1".to_owned()),
            ("b".to_owned(), "2".to_owned()),
        ];
        assert_ne!(fingerprint(&tricky), fingerprint(&split));
    }

    #[test]
    fn normalized_requests_with_cosmetic_differences_share_a_fingerprint() {
        let policy = MatchPolicy::new(&["date".to_owned()], &[], &[], &[]);

        let mut headers_a = hyper::HeaderMap::new();
        headers_a.insert("X-One", hyper::header::HeaderValue::from_static("1"));
        headers_a.insert(
            "content-type",
            hyper::header::HeaderValue::from_static("application/json"),
        );
        headers_a.insert(
            "date",
            hyper::header::HeaderValue::from_static("Mon, 01 Jan 2024 00:00:00 GMT"),
        );

        let mut headers_b = hyper::HeaderMap::new();
        headers_b.insert(
            "content-type",
            hyper::header::HeaderValue::from_static("application/json"),
        );
        headers_b.insert("x-one", hyper::header::HeaderValue::from_static("1"));

        let a = normalize(
            &hyper::Method::POST,
            "/API/v1/Users/",
            Some("b=2&a=1"),
            &headers_a,
            br#"{"y":2,"x":1}"#,
            &policy,
        );
        let b = normalize(
            &hyper::Method::POST,
            "/api/v1/users",
            Some("a=1&b=2"),
            &headers_b,
            br#"{"x":1,"y":2}"#,
            &policy,
        );

        assert_eq!(fingerprint(&a), fingerprint(&b));
    }
}
