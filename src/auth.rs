use crate::model::AuthMaterial;
use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

/// mTLS client identity material, kept alongside the regular header map
/// because it configures the transport's `reqwest::Client` rather than a
/// request header.
pub struct MtlsIdentity {
    pub client_cert: String,
    pub client_key: String,
    pub ca_bundle: Option<String>,
}

/// What `connect` needs to authenticate against an upstream: a header map
/// for the common cases, or mTLS material to build a dedicated client.
pub enum ConnectAuth {
    Headers(HeaderMap),
    Mtls(MtlsIdentity),
}

/// Builds the auth material the upstream connector's transport needs,
/// following the teacher's header-construction approach in
/// `mcp/connection.rs::connect_http` but dispatching on the tagged
/// `AuthMaterial` variant instead of a raw header map.
pub fn build_connect_auth(auth: &AuthMaterial) -> Result<ConnectAuth> {
    match auth {
        AuthMaterial::None => Ok(ConnectAuth::Headers(HeaderMap::new())),
        AuthMaterial::Bearer { token } => {
            let mut headers = HeaderMap::new();
            headers.insert(
                "Authorization",
                HeaderValue::from_str(&format!("Bearer {token}"))
                    .context("bearer token contains invalid header characters")?,
            );
            Ok(ConnectAuth::Headers(headers))
        }
        AuthMaterial::Basic { user, pass } => {
            let mut headers = HeaderMap::new();
            let encoded = base64_basic(user, pass);
            headers.insert(
                "Authorization",
                HeaderValue::from_str(&format!("Basic {encoded}"))
                    .context("basic credentials contain invalid header characters")?,
            );
            Ok(ConnectAuth::Headers(headers))
        }
        AuthMaterial::ApiKey { header_name, value } => {
            let mut headers = HeaderMap::new();
            let name = HeaderName::from_bytes(header_name.as_bytes())
                .context("api key header name is not a valid header name")?;
            headers.insert(name, HeaderValue::from_str(value).context("api key value is not a valid header value")?);
            Ok(ConnectAuth::Headers(headers))
        }
        AuthMaterial::OAuth2 { access_token, .. } => {
            let mut headers = HeaderMap::new();
            headers.insert(
                "Authorization",
                HeaderValue::from_str(&format!("Bearer {access_token}"))
                    .context("oauth2 access token contains invalid header characters")?,
            );
            Ok(ConnectAuth::Headers(headers))
        }
        AuthMaterial::Mtls {
            client_cert,
            client_key,
            ca_bundle,
        } => Ok(ConnectAuth::Mtls(MtlsIdentity {
            client_cert: client_cert.clone(),
            client_key: client_key.clone(),
            ca_bundle: ca_bundle.clone(),
        })),
    }
}

fn base64_basic(user: &str, pass: &str) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"))
}

/// Extracts and validates a bearer token from a downstream `Authorization`
/// header, as the gateway requires per the external-interface spec.
pub fn parse_bearer_token(header_value: &str) -> Option<&str> {
    let value = header_value.trim();
    let rest = value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer "))?;
    let token = rest.trim();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bearer_header() {
        assert_eq!(parse_bearer_token("Bearer mcpb_abc123"), Some("mcpb_abc123"));
        assert_eq!(parse_bearer_token("Basic xyz"), None);
        assert_eq!(parse_bearer_token("Bearer "), None);
    }

    #[test]
    fn builds_bearer_header() {
        let auth = AuthMaterial::Bearer {
            token: "mcpb_abc".into(),
        };
        match build_connect_auth(&auth).unwrap() {
            ConnectAuth::Headers(h) => {
                assert_eq!(h.get("Authorization").unwrap(), "Bearer mcpb_abc");
            }
            ConnectAuth::Mtls(_) => panic!("expected headers"),
        }
    }
}
