//! Shared plumbing for the Enforcement Pipeline: body buffering, the PV-identifier
//! headers every family reads `volume_name` from, and the small bits of control flow duplicated
//! deliberately across `handlers::{powerflex,powermax,powerscale}`.

use bytes::Bytes;
use hyper::body::HttpBody;

use crate::error::ProxyError;

/// Read up to `limit` bytes of an inbound request body. `None` reads the whole body
/// (PowerFlex/PowerScale); `Some(n)` caps it (PowerMax, 1024 bytes).
pub async fn read_bounded_body(mut body: hyper::Body, limit: Option<usize>) -> Result<Bytes, ProxyError> {
    let mut buf = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(|e| ProxyError::Body(e.to_string()))?;
        buf.extend_from_slice(&chunk);
        if let Some(limit) = limit {
            if buf.len() >= limit {
                buf.truncate(limit);
                break;
            }
        }
    }
    Ok(Bytes::from(buf))
}

/// The PV-identifier headers a CSI driver attaches; `volume_name` prefers the PV name,
/// falling back to the claim name and then the namespace, in that order, since any one of them
/// may be blank depending on the driver's provisioning mode.
pub fn volume_name_from_headers(headers: &http::HeaderMap) -> String {
    for key in ["x-csi-pv-name", "x-csi-pv-claimname", "x-csi-pv-namespace"] {
        if let Some(value) = headers.get(key).and_then(|v| v.to_str().ok()) {
            if !value.is_empty() {
                return value.to_string();
            }
        }
    }
    String::new()
}

/// Join a provisioning decision's `deny` reasons into one message.
pub fn join_deny_reasons(deny: &[String]) -> String {
    deny.join(", ")
}

/// Strip the tenant's inbound `Authorization` header before a session manager attaches the
/// operator-supplied service credentials. Session managers append their own `Authorization`
/// (HTTP Basic, a bearer token) rather than replace one that's already present, so leaving the
/// client's header in place would both leak tenant credentials to the array and send two
/// `Authorization` headers upstream.
pub fn strip_inbound_authorization(headers: &mut http::HeaderMap) {
    headers.remove(http::header::AUTHORIZATION);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_full_body_without_limit() {
        let body = hyper::Body::from("hello world");
        let bytes = read_bounded_body(body, None).await.unwrap();
        assert_eq!(&bytes[..], b"hello world");
    }

    #[tokio::test]
    async fn truncates_to_limit() {
        let body = hyper::Body::from("0123456789");
        let bytes = read_bounded_body(body, Some(4)).await.unwrap();
        assert_eq!(&bytes[..], b"0123");
    }

    #[test]
    fn volume_name_prefers_pv_name() {
        let mut headers = http::HeaderMap::new();
        headers.insert("x-csi-pv-name", "pv-1".parse().unwrap());
        headers.insert("x-csi-pv-claimname", "claim-1".parse().unwrap());
        assert_eq!(volume_name_from_headers(&headers), "pv-1");
    }

    #[test]
    fn volume_name_falls_back_to_claimname() {
        let mut headers = http::HeaderMap::new();
        headers.insert("x-csi-pv-claimname", "claim-1".parse().unwrap());
        assert_eq!(volume_name_from_headers(&headers), "claim-1");
    }

    #[test]
    fn join_deny_reasons_comma_separates() {
        assert_eq!(
            join_deny_reasons(&["a".to_string(), "b".to_string()]),
            "a, b"
        );
    }

    #[test]
    fn strips_inbound_authorization_header() {
        let mut headers = http::HeaderMap::new();
        headers.insert(http::header::AUTHORIZATION, "Bearer tenant-token".parse().unwrap());
        strip_inbound_authorization(&mut headers);
        assert!(headers.get(http::header::AUTHORIZATION).is_none());
    }
}
