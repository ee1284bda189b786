//! Admission authentication.
//!
//! Given an access request and the matched path configuration, succeed or
//! fail. Checks run in order: optional external-auth HTTP POST, IP ACL,
//! then username/password. Credentials may be stored plain or as
//! `sha256:<base64>`; RTSP clients may answer a SHA-256 digest challenge.
//! All failures collapse into one typed error so every front-end can map it
//! to its own 401.

use crate::conf::PathConf;
use base64::Engine as _;
use serde::Serialize;
use sha2::{Digest as _, Sha256};
use std::net::IpAddr;
use tracing::warn;

pub const DIGEST_REALM: &str = "livegate";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthAction {
    Publish,
    Read,
}

impl AuthAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthAction::Publish => "publish",
            AuthAction::Read => "read",
        }
    }
}

/// Credentials as presented by the client.
#[derive(Debug, Clone)]
pub enum ProvidedCredentials {
    None,
    Plain {
        user: String,
        pass: String,
    },
    /// RTSP digest answer (SHA-256, RFC 7616 subset).
    Digest {
        user: String,
        response: String,
        nonce: String,
        method: String,
        uri: String,
    },
}

/// One admission attempt. Built by a front-end, consumed by the path
/// manager, never stored.
#[derive(Debug, Clone)]
pub struct AccessRequest {
    pub name: String,
    pub query: String,
    pub action: AuthAction,
    pub protocol: &'static str,
    pub ip: IpAddr,
    pub credentials: ProvidedCredentials,
    /// Set when the front-end should trigger an on-demand source.
    pub skip_auth: bool,
}

impl AccessRequest {
    pub fn internal(name: &str, action: AuthAction) -> Self {
        AccessRequest {
            name: name.to_owned(),
            query: String::new(),
            action,
            protocol: "internal",
            ip: IpAddr::from([127, 0, 0, 1]),
            credentials: ProvidedCredentials::None,
            skip_auth: true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("authentication failed: {reason}")]
pub struct AuthError {
    pub reason: String,
}

impl AuthError {
    fn new(reason: impl Into<String>) -> Self {
        AuthError {
            reason: reason.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// IP ACL
// ---------------------------------------------------------------------------

/// A single ACL entry: a plain address or an IPv4 CIDR range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    net: IpAddr,
    prefix: u8,
}

pub fn parse_cidr(s: &str) -> Result<Cidr, String> {
    let (addr_str, prefix_str) = match s.split_once('/') {
        Some((a, p)) => (a, Some(p)),
        None => (s, None),
    };
    let net: IpAddr = addr_str
        .parse()
        .map_err(|_| format!("invalid address '{addr_str}'"))?;
    let max = if net.is_ipv4() { 32 } else { 128 };
    let prefix = match prefix_str {
        None => max,
        Some(p) => {
            let p: u8 = p.parse().map_err(|_| format!("invalid prefix '{p}'"))?;
            if p > max {
                return Err(format!("prefix /{p} out of range"));
            }
            if net.is_ipv6() && p != 128 {
                return Err("IPv6 ranges are not supported, use full addresses".to_owned());
            }
            p
        }
    };
    Ok(Cidr { net, prefix })
}

impl Cidr {
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.net, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u32::MAX << (32 - u32::from(self.prefix))
                };
                (u32::from(net) & mask) == (u32::from(ip) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => net == ip,
            _ => false,
        }
    }
}

fn ip_allowed(acl: &[String], ip: IpAddr) -> bool {
    if acl.is_empty() {
        return true;
    }
    acl.iter()
        .filter_map(|s| parse_cidr(s).ok())
        .any(|c| c.contains(ip))
}

// ---------------------------------------------------------------------------
// Credential comparison
// ---------------------------------------------------------------------------

fn eq_ct(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Compare a presented password against the stored one, which may be plain
/// or `sha256:<base64>`.
fn password_matches(stored: &str, presented: &str) -> bool {
    if let Some(encoded) = stored.strip_prefix("sha256:") {
        let Ok(expected) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
            return false;
        };
        let digest = Sha256::digest(presented.as_bytes());
        return eq_ct(&expected, digest.as_slice());
    }
    eq_ct(stored.as_bytes(), presented.as_bytes())
}

/// Compute the SHA-256 digest answer for (user, realm, pass, method, uri,
/// nonce). Shared with the RTSP client side.
pub fn digest_response(
    user: &str,
    pass: &str,
    method: &str,
    uri: &str,
    nonce: &str,
) -> String {
    let ha1 = hex::encode(Sha256::digest(format!("{user}:{DIGEST_REALM}:{pass}")));
    let ha2 = hex::encode(Sha256::digest(format!("{method}:{uri}")));
    hex::encode(Sha256::digest(format!("{ha1}:{nonce}:{ha2}")))
}

pub fn generate_nonce() -> String {
    use rand::Rng as _;
    let bytes: [u8; 16] = rand::thread_rng().r#gen();
    hex::encode(bytes)
}

fn check_credentials(
    expected_user: &str,
    expected_pass: &str,
    provided: &ProvidedCredentials,
    server_nonce: Option<&str>,
) -> Result<(), AuthError> {
    match provided {
        ProvidedCredentials::None => Err(AuthError::new("credentials required")),
        ProvidedCredentials::Plain { user, pass } => {
            if !eq_ct(expected_user.as_bytes(), user.as_bytes())
                || !password_matches(expected_pass, pass)
            {
                return Err(AuthError::new("invalid credentials"));
            }
            Ok(())
        }
        ProvidedCredentials::Digest {
            user,
            response,
            nonce,
            method,
            uri,
        } => {
            if expected_pass.starts_with("sha256:") {
                return Err(AuthError::new(
                    "digest authentication requires plaintext stored credentials",
                ));
            }
            match server_nonce {
                Some(n) if n == nonce => {}
                _ => return Err(AuthError::new("stale digest nonce")),
            }
            if !eq_ct(expected_user.as_bytes(), user.as_bytes()) {
                return Err(AuthError::new("invalid credentials"));
            }
            let expected = digest_response(expected_user, expected_pass, method, uri, nonce);
            if !eq_ct(expected.as_bytes(), response.as_bytes()) {
                return Err(AuthError::new("invalid credentials"));
            }
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// External authentication
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ExternalAuthBody<'a> {
    ip: String,
    user: &'a str,
    password: &'a str,
    path: &'a str,
    protocol: &'a str,
    action: &'a str,
    query: &'a str,
}

async fn external_auth(
    client: &reqwest::Client,
    url: &str,
    req: &AccessRequest,
) -> Result<(), AuthError> {
    let (user, password) = match &req.credentials {
        ProvidedCredentials::Plain { user, pass } => (user.as_str(), pass.as_str()),
        ProvidedCredentials::Digest { user, .. } => (user.as_str(), ""),
        ProvidedCredentials::None => ("", ""),
    };
    let body = ExternalAuthBody {
        ip: req.ip.to_string(),
        user,
        password,
        path: &req.name,
        protocol: req.protocol,
        action: req.action.as_str(),
        query: &req.query,
    };
    let res = client.post(url).json(&body).send().await.map_err(|e| {
        warn!(error = %e, "external authentication request failed");
        AuthError::new("external authentication unreachable")
    })?;
    if !res.status().is_success() {
        return Err(AuthError::new(format!(
            "external authentication rejected the request ({})",
            res.status()
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Run the full admission check for one access request.
///
/// `server_nonce` is the digest nonce previously issued to this client, when
/// the front-end speaks RTSP.
pub async fn authenticate(
    client: &reqwest::Client,
    external_url: &str,
    path_conf: &PathConf,
    req: &AccessRequest,
    server_nonce: Option<&str>,
) -> Result<(), AuthError> {
    if req.skip_auth {
        return Ok(());
    }

    if !external_url.is_empty() {
        external_auth(client, external_url, req).await?;
    }

    let (acl, user, pass) = match req.action {
        AuthAction::Publish => (
            &path_conf.publish_ips,
            &path_conf.publish_user,
            &path_conf.publish_pass,
        ),
        AuthAction::Read => (&path_conf.read_ips, &path_conf.read_user, &path_conf.read_pass),
    };

    if !ip_allowed(acl, req.ip) {
        return Err(AuthError::new(format!("IP {} not allowed", req.ip)));
    }

    if !user.is_empty() {
        check_credentials(user, pass, &req.credentials, server_nonce)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conf_with_creds(user: &str, pass: &str) -> PathConf {
        PathConf {
            read_user: user.to_owned(),
            read_pass: pass.to_owned(),
            ..PathConf::default()
        }
    }

    fn read_request(creds: ProvidedCredentials) -> AccessRequest {
        AccessRequest {
            name: "mypath".to_owned(),
            query: String::new(),
            action: AuthAction::Read,
            protocol: "rtsp",
            ip: "10.0.0.1".parse().unwrap(),
            credentials: creds,
            skip_auth: false,
        }
    }

    #[tokio::test]
    async fn plain_credentials_accept_and_reject() {
        let client = reqwest::Client::new();
        let conf = conf_with_creds("admin", "secret");

        let ok = read_request(ProvidedCredentials::Plain {
            user: "admin".to_owned(),
            pass: "secret".to_owned(),
        });
        assert!(authenticate(&client, "", &conf, &ok, None).await.is_ok());

        let bad = read_request(ProvidedCredentials::Plain {
            user: "admin".to_owned(),
            pass: "wrong".to_owned(),
        });
        assert!(authenticate(&client, "", &conf, &bad, None).await.is_err());

        let missing = read_request(ProvidedCredentials::None);
        assert!(authenticate(&client, "", &conf, &missing, None).await.is_err());
    }

    #[tokio::test]
    async fn sha256_stored_credentials() {
        let client = reqwest::Client::new();
        let hashed = format!(
            "sha256:{}",
            base64::engine::general_purpose::STANDARD.encode(Sha256::digest(b"secret"))
        );
        let conf = conf_with_creds("admin", &hashed);

        let ok = read_request(ProvidedCredentials::Plain {
            user: "admin".to_owned(),
            pass: "secret".to_owned(),
        });
        assert!(authenticate(&client, "", &conf, &ok, None).await.is_ok());

        let bad = read_request(ProvidedCredentials::Plain {
            user: "admin".to_owned(),
            pass: "other".to_owned(),
        });
        assert!(authenticate(&client, "", &conf, &bad, None).await.is_err());
    }

    #[tokio::test]
    async fn digest_roundtrip() {
        let client = reqwest::Client::new();
        let conf = conf_with_creds("admin", "secret");
        let nonce = generate_nonce();

        let response = digest_response("admin", "secret", "DESCRIBE", "rtsp://h/mypath", &nonce);
        let ok = read_request(ProvidedCredentials::Digest {
            user: "admin".to_owned(),
            response,
            nonce: nonce.clone(),
            method: "DESCRIBE".to_owned(),
            uri: "rtsp://h/mypath".to_owned(),
        });
        assert!(authenticate(&client, "", &conf, &ok, Some(&nonce)).await.is_ok());

        // a stale nonce is refused even with a correct response
        let other_nonce = generate_nonce();
        let response = digest_response(
            "admin",
            "secret",
            "DESCRIBE",
            "rtsp://h/mypath",
            &other_nonce,
        );
        let stale = read_request(ProvidedCredentials::Digest {
            user: "admin".to_owned(),
            response,
            nonce: other_nonce,
            method: "DESCRIBE".to_owned(),
            uri: "rtsp://h/mypath".to_owned(),
        });
        assert!(
            authenticate(&client, "", &conf, &stale, Some(&nonce))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn ip_acl_membership() {
        let client = reqwest::Client::new();
        let conf = PathConf {
            read_ips: vec!["10.0.0.0/24".to_owned()],
            ..PathConf::default()
        };

        let ok = read_request(ProvidedCredentials::None);
        assert!(authenticate(&client, "", &conf, &ok, None).await.is_ok());

        let mut denied = read_request(ProvidedCredentials::None);
        denied.ip = "192.168.1.5".parse().unwrap();
        assert!(authenticate(&client, "", &conf, &denied, None).await.is_err());
    }

    #[test]
    fn cidr_parsing_and_membership() {
        let c = parse_cidr("10.0.0.0/24").unwrap();
        assert!(c.contains("10.0.0.200".parse().unwrap()));
        assert!(!c.contains("10.0.1.1".parse().unwrap()));

        let single = parse_cidr("192.168.1.1").unwrap();
        assert!(single.contains("192.168.1.1".parse().unwrap()));
        assert!(!single.contains("192.168.1.2".parse().unwrap()));

        assert!(parse_cidr("10.0.0.0/33").is_err());
        assert!(parse_cidr("nonsense").is_err());
        assert!(parse_cidr("::1").is_ok());
        assert!(parse_cidr("::1/64").is_err());
    }
}
