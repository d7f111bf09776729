//! `Forwarded` header parsing and plugin-id normalization.
//!
//! Tolerates malformed or empty segments (ones with no `=`) by skipping them rather than
//! panicking. Segment order (`by` before `for` or after) never matters: both fields accumulate
//! independently across every header value and every comma-separated segment.

use http::HeaderMap;

/// The parsed `Forwarded` header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardedIdentifier {
    pub by: Option<String>,
    pub for_value: Option<String>,
}

impl ForwardedIdentifier {
    /// Split the `for` value (`endpoint;system-id`) into its two parts.
    pub fn endpoint_and_system(&self) -> Option<(String, String)> {
        let raw = self.for_value.as_ref()?;
        let mut parts = raw.splitn(2, ';');
        let endpoint = parts.next()?.to_string();
        let system_id = parts.next()?.to_string();
        Some((endpoint, system_id))
    }
}

/// Parse every `Forwarded` header value present on the request, in any segment order, whether
/// encoded as one comma-joined header or as multiple header values.
pub fn parse(headers: &HeaderMap) -> ForwardedIdentifier {
    let mut result = ForwardedIdentifier::default();

    for value in headers.get_all(http::header::FORWARDED) {
        let Ok(value) = value.to_str() else {
            continue;
        };

        for segment in value.split(',') {
            let segment = segment.trim();
            let Some((key, val)) = segment.split_once('=') else {
                // Malformed/empty segment: skip rather than panic.
                continue;
            };
            let key = key.trim();
            let val = val.trim().trim_matches('"');

            match key {
                "by" => result.by = Some(val.to_string()),
                "for" => result.for_value = Some(val.to_string()),
                _ => {}
            }
        }
    }

    result
}

/// Normalize a driver-supplied plugin id to its canonical backend family name.
///
/// Families are a closed set; unrecognized ids pass through unchanged so the caller
/// can produce the "plugin id not found" error with the original value in the message.
pub fn normalize_plugin_id(by: &str) -> String {
    match by {
        "csi-vxflexos" | "vxflexos" | "csi-powerflex" | "powerflex" => "powerflex".to_string(),
        "csi-powermax" | "powermax" => "powermax".to_string(),
        "csi-isilon" | "csi-powerscale" | "isilon" | "powerscale" => "powerscale".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_single(value: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(http::header::FORWARDED, value.parse().unwrap());
        h
    }

    #[test]
    fn parses_comma_joined_header() {
        let h = headers_single("by=csi-vxflexos,for=10.0.0.1;542a2d5f5122210f");
        let parsed = parse(&h);
        assert_eq!(parsed.by.as_deref(), Some("csi-vxflexos"));
        assert_eq!(
            parsed.endpoint_and_system(),
            Some(("10.0.0.1".to_string(), "542a2d5f5122210f".to_string()))
        );
    }

    #[test]
    fn parses_multi_valued_header_in_any_order() {
        let mut h = HeaderMap::new();
        h.append(
            http::header::FORWARDED,
            "for=10.0.0.1;sys0".parse().unwrap(),
        );
        h.append(http::header::FORWARDED, "by=csi-powermax".parse().unwrap());
        let parsed = parse(&h);
        assert_eq!(parsed.by.as_deref(), Some("csi-powermax"));
        assert_eq!(
            parsed.endpoint_and_system(),
            Some(("10.0.0.1".to_string(), "sys0".to_string()))
        );
    }

    #[test]
    fn tolerates_segments_without_equals() {
        let h = headers_single("garbage,by=csi-vxflexos,,for=e;s");
        let parsed = parse(&h);
        assert_eq!(parsed.by.as_deref(), Some("csi-vxflexos"));
        assert!(parsed.endpoint_and_system().is_some());
    }

    #[test]
    fn missing_header_yields_empty_identifier() {
        let h = HeaderMap::new();
        assert_eq!(parse(&h), ForwardedIdentifier::default());
    }

    #[test]
    fn normalizes_known_synonyms() {
        assert_eq!(normalize_plugin_id("csi-vxflexos"), "powerflex");
        assert_eq!(normalize_plugin_id("vxflexos"), "powerflex");
        assert_eq!(normalize_plugin_id("csi-powermax"), "powermax");
        assert_eq!(normalize_plugin_id("csi-isilon"), "powerscale");
    }

    #[test]
    fn passes_through_unknown_plugin_id() {
        assert_eq!(normalize_plugin_id("csi-unknownthing"), "csi-unknownthing");
    }
}
