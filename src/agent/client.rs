//! HTTP client for the host API.
//!
//! | Call | Endpoint |
//! |------|----------|
//! | [`HostClient::write`] | `POST /v1/<path>` |
//! | [`HostClient::lookup_self`] | `GET /v1/auth/token/lookup-self` |
//! | [`HostClient::renew_self`] | `POST /v1/auth/token/renew-self` |
//!
//! Non-success answers become [`Error::Api`] carrying
//! `"<url> - <status>, <first error>"`.

use std::time::Duration;

use reqwest::{Certificate, Client, ClientBuilder, Identity, Response, StatusCode};
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use super::method::{ClientTls, LoginRequest};
use super::renewer::{LifetimeWatcher, RenewerHandle, TokenRenewer};
use crate::api::{ErrorBody, Secret, SecretAuth};
use crate::{Error, Result};

static APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Header carrying the client token.
pub const TOKEN_HEADER: &str = "X-Vault-Token";

/// Login path that means "validate this token" rather than "log in".
pub const LOOKUP_SELF_PATH: &str = "auth/token/lookup-self";

/// What the supervisor needs from the host.
#[async_trait::async_trait]
pub trait Host: Send + Sync {
    /// Exchange login data for a lease. `Ok(None)` means the host answered
    /// without a body.
    async fn login(&self, request: &LoginRequest) -> Result<Option<Secret>>;

    /// Start renewing the token in `secret` until `cancel` fires.
    fn start_renewer(&self, secret: &Secret, cancel: CancellationToken) -> RenewerHandle;
}

/// reqwest-based host client.
#[derive(Debug, Clone)]
pub struct HostClient {
    http: Client,
    address: Url,
}

impl HostClient {
    /// Create a client for the host at `address` (e.g. `http://127.0.0.1:8200`).
    pub fn new(address: &str) -> Result<Self> {
        let address = Url::parse(address)
            .map_err(|e| Error::Config(format!("invalid host address {address:?}: {e}")))?;
        if address.host().is_none() {
            return Err(Error::Config(format!("host address {address} has no host")));
        }
        let http = Self::builder().build()?;
        Ok(Self { http, address })
    }

    fn builder() -> ClientBuilder {
        Client::builder()
            .user_agent(APP_USER_AGENT)
            .timeout(Duration::from_secs(60))
    }

    /// A client for the same host that presents `tls` as its identity and
    /// also trusts its CA.
    pub fn with_tls(&self, tls: &ClientTls) -> Result<Self> {
        let identity = Identity::from_pem(&tls.identity_pem)
            .map_err(|e| Error::Method(format!("invalid client certificate: {e}")))?;
        let mut builder = Self::builder().identity(identity);
        if let Some(ca_pem) = &tls.ca_pem {
            let ca = Certificate::from_pem(ca_pem)
                .map_err(|e| Error::Method(format!("invalid CA certificate: {e}")))?;
            builder = builder.add_root_certificate(ca);
        }
        let http = builder
            .build()
            .map_err(|e| Error::Method(format!("cannot build TLS client: {e}")))?;
        Ok(Self {
            http,
            address: self.address.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.address
            .join(&format!("v1/{}", path.trim_start_matches('/')))
            .map_err(|e| Error::Config(format!("invalid path {path:?}: {e}")))
    }

    async fn decode(url: &Url, response: Response) -> Result<Option<Secret>> {
        let status = response.status();
        if status == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        if !status.is_success() {
            let body: ErrorBody = response.json().await.unwrap_or_default();
            return Err(Error::Api(format!(
                "{url} - {status}, {}",
                body.errors.first().map_or("", String::as_str)
            )));
        }
        Ok(Some(response.json().await?))
    }

    /// `POST /v1/<path>` with `data` as the JSON body.
    pub async fn write(&self, path: &str, data: &Map<String, Value>) -> Result<Option<Secret>> {
        let url = self.endpoint(path)?;
        debug!(url = %url, "Writing to host");
        let response = self.http.post(url.clone()).json(data).send().await?;
        Self::decode(&url, response).await
    }

    /// Look up the calling token.
    pub async fn lookup_self(&self, token: &str) -> Result<Secret> {
        let url = self.endpoint(LOOKUP_SELF_PATH)?;
        let response = self
            .http
            .get(url.clone())
            .header(TOKEN_HEADER, token)
            .send()
            .await?;
        Self::decode(&url, response)
            .await?
            .ok_or_else(|| Error::Api(format!("{url} - empty lookup response")))
    }

    /// Renew the calling token, optionally asking for `increment` seconds.
    pub async fn renew_self(&self, token: &str, increment: Option<u64>) -> Result<Secret> {
        let url = self.endpoint("auth/token/renew-self")?;
        let response = self
            .http
            .post(url.clone())
            .header(TOKEN_HEADER, token)
            .json(&json!({ "increment": increment.unwrap_or(0) }))
            .send()
            .await?;
        Self::decode(&url, response)
            .await?
            .ok_or_else(|| Error::Api(format!("{url} - empty renew response")))
    }
}

/// Turn a lookup-self answer into the auth block a login would have returned.
fn lookup_to_auth(token: &str, lookup: &Secret) -> Secret {
    let data = lookup.data.clone().unwrap_or_default();
    let policies = data
        .get("policies")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_str).map(ToString::to_string).collect())
        .unwrap_or_default();
    Secret {
        auth: Some(SecretAuth {
            client_token: token.to_string(),
            accessor: data
                .get("accessor")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            policies,
            metadata: std::collections::BTreeMap::new(),
            lease_duration: data.get("ttl").and_then(Value::as_u64).unwrap_or(0),
            renewable: data.get("renewable").and_then(Value::as_bool).unwrap_or(false),
        }),
        ..Secret::default()
    }
}

#[async_trait::async_trait]
impl Host for HostClient {
    async fn login(&self, request: &LoginRequest) -> Result<Option<Secret>> {
        if request.path.trim_matches('/') == LOOKUP_SELF_PATH {
            let token = request
                .data
                .get("token")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::Method("lookup-self login without a token".to_string()))?;
            let lookup = self.lookup_self(token).await?;
            return Ok(Some(lookup_to_auth(token, &lookup)));
        }
        match &request.tls {
            Some(tls) => self.with_tls(tls)?.write(&request.path, &request.data).await,
            None => self.write(&request.path, &request.data).await,
        }
    }

    fn start_renewer(&self, secret: &Secret, cancel: CancellationToken) -> RenewerHandle {
        LifetimeWatcher::start(std::sync::Arc::new(self.clone()), secret, cancel)
    }
}

#[async_trait::async_trait]
impl TokenRenewer for HostClient {
    async fn renew(&self, token: &str, increment: Option<u64>) -> Result<Secret> {
        self.renew_self(token, increment).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_are_joined_under_v1() {
        let client = HostClient::new("http://127.0.0.1:8200").unwrap();
        assert_eq!(
            client.endpoint("auth/proxy/login").unwrap().as_str(),
            "http://127.0.0.1:8200/v1/auth/proxy/login"
        );
        assert_eq!(
            client.endpoint("/auth/token/renew-self").unwrap().as_str(),
            "http://127.0.0.1:8200/v1/auth/token/renew-self"
        );
    }

    #[test]
    fn bad_addresses_are_config_errors() {
        assert!(matches!(HostClient::new("not a url"), Err(Error::Config(_))));
    }

    fn fixture(name: &str) -> Vec<u8> {
        std::fs::read(format!("{}/tests/fixtures/{name}", env!("CARGO_MANIFEST_DIR"))).unwrap()
    }

    #[test]
    fn tls_client_accepts_a_pem_identity_and_ca() {
        let client = HostClient::new("https://127.0.0.1:8200").unwrap();
        let mut identity_pem = fixture("client-a.crt");
        identity_pem.extend(fixture("client-a.key"));

        let tls_client = client
            .with_tls(&ClientTls {
                identity_pem,
                ca_pem: Some(fixture("ca.crt")),
            })
            .unwrap();

        assert_eq!(tls_client.address, client.address);
    }

    #[test]
    fn tls_client_rejects_material_without_a_key() {
        let client = HostClient::new("https://127.0.0.1:8200").unwrap();

        let err = client
            .with_tls(&ClientTls {
                identity_pem: fixture("client-a.crt"),
                ca_pem: None,
            })
            .unwrap_err();

        assert!(matches!(err, Error::Method(_)), "{err}");
    }

    #[test]
    fn lookup_answer_becomes_an_auth_block() {
        let lookup = Secret {
            data: Some(
                json!({"accessor": "acc", "ttl": 300, "renewable": true, "policies": ["dev"]})
                    .as_object()
                    .cloned()
                    .unwrap(),
            ),
            ..Secret::default()
        };

        let secret = lookup_to_auth("pxa_t", &lookup);

        assert_eq!(secret.token(), Some("pxa_t"));
        assert_eq!(secret.token_ttl(), 300);
        assert!(secret.token_renewable());
        assert_eq!(secret.auth.unwrap().policies, vec!["dev"]);
    }
}
