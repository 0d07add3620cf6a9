//! `users/lookup` over the v1.1 REST API.
//!
//! Requests are signed with the user's access token when one is configured,
//! and otherwise carry an app-only bearer token.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::config::Credentials;
use crate::lookup::{LookupApi, LookupError, RateLimitStatus, Record};
use crate::oauth::OAuth1Signer;

pub const API_BASE: &str = "https://api.twitter.com/";

const LOOKUP_RESOURCE: &str = "/users/lookup";
const CREATED_AT_FORMAT: &str = "%a %b %d %H:%M:%S %z %Y";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token_type: String,
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct RateLimitResponse {
    resources: RateLimitResources,
}

#[derive(Debug, Deserialize)]
struct RateLimitResources {
    #[serde(default)]
    users: std::collections::HashMap<String, RateLimitEntry>,
}

#[derive(Debug, Deserialize)]
struct RateLimitEntry {
    remaining: usize,
    reset: i64,
}

#[derive(Debug, Deserialize)]
struct User {
    id: i64,
    created_at: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Clone)]
enum Auth {
    User(OAuth1Signer),
    App(String),
}

#[derive(Debug, Clone)]
pub struct TwitterClient {
    http: reqwest::Client,
    base: String,
    auth: Auth,
}

impl TwitterClient {
    /// Build a client. With an access token pair every request is signed in
    /// user context; otherwise the consumer key pair is exchanged for an
    /// app-only bearer token, unless one is already configured.
    pub async fn connect(credentials: &Credentials) -> Result<Self, LookupError> {
        Self::connect_to(API_BASE, credentials).await
    }

    pub async fn connect_to(base: &str, credentials: &Credentials) -> Result<Self, LookupError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(transport_error)?;
        let base = base.trim_end_matches('/').to_string();

        if let Some(access) = &credentials.access {
            debug!("Signing requests with the configured access token");
            let signer = OAuth1Signer::new(
                &credentials.consumer_key,
                &credentials.consumer_secret,
                &access.token,
                &access.secret,
            );
            return Ok(Self {
                http,
                base,
                auth: Auth::User(signer),
            });
        }

        let token = match &credentials.bearer_token {
            Some(token) => token.clone(),
            None => {
                let response = http
                    .post(format!("{base}/oauth2/token"))
                    .basic_auth(&credentials.consumer_key, Some(&credentials.consumer_secret))
                    .header(CONTENT_TYPE, "application/x-www-form-urlencoded;charset=UTF-8")
                    .body("grant_type=client_credentials")
                    .send()
                    .await
                    .map_err(transport_error)?;
                let token: TokenResponse = read_json(response).await?;
                if !token.token_type.eq_ignore_ascii_case("bearer") {
                    return Err(LookupError::Decode(format!(
                        "unexpected token type {}",
                        token.token_type
                    )));
                }
                debug!("Obtained app-only bearer token");
                token.access_token
            }
        };

        Ok(Self {
            http,
            base,
            auth: Auth::App(token),
        })
    }

    /// Authenticated GET of `path` with `params` as the query string.
    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, &str)],
    ) -> Result<T, LookupError> {
        let url = format!("{}{}", self.base, path);
        let request = match &self.auth {
            Auth::User(signer) => self
                .http
                .get(&url)
                .header(AUTHORIZATION, signer.authorization("GET", &url, params)?),
            Auth::App(token) => self.http.get(&url).bearer_auth(token),
        };
        let response = request
            .query(params)
            .send()
            .await
            .map_err(transport_error)?;
        read_json(response).await
    }
}

#[async_trait]
impl LookupApi for TwitterClient {
    async fn check_rate_limit(&self) -> Result<RateLimitStatus, LookupError> {
        let body: RateLimitResponse = self
            .get(
                "/1.1/application/rate_limit_status.json",
                &[("resources", "users")],
            )
            .await?;
        parse_rate_limit(body)
    }

    async fn lookup_batch(&self, ids: &[i64]) -> Result<Vec<Record>, LookupError> {
        let user_id = ids
            .iter()
            .map(i64::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let users: Vec<User> = self
            .get(
                "/1.1/users/lookup.json",
                &[("user_id", user_id.as_str()), ("include_entities", "false")],
            )
            .await?;
        users
            .into_iter()
            .map(|u| Ok(Record::new(u.id, parse_created_at(&u.created_at)?)))
            .collect()
    }
}

/// Timeouts and failures to reach the server are worth retrying; anything
/// else reqwest reports is not.
fn transport_error(e: reqwest::Error) -> LookupError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        LookupError::Timeout(e.to_string())
    } else {
        LookupError::Transport(e.to_string())
    }
}

async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, LookupError> {
    let status = response.status();
    let body = response.bytes().await.map_err(transport_error)?;
    decode_body(status, &body)
}

fn decode_body<T: DeserializeOwned>(status: StatusCode, body: &[u8]) -> Result<T, LookupError> {
    if status.is_success() {
        return serde_json::from_slice(body).map_err(|e| LookupError::Decode(e.to_string()));
    }
    match serde_json::from_slice::<ErrorBody>(body) {
        Ok(ErrorBody { errors }) if !errors.is_empty() => {
            let first = &errors[0];
            Err(LookupError::Api {
                code: first.code,
                message: first.message.clone(),
            })
        }
        _ => {
            let detail = serde_json::from_slice::<Value>(body)
                .map(|v| v.to_string())
                .unwrap_or_else(|_| String::from_utf8_lossy(body).into_owned());
            Err(LookupError::Transport(format!("HTTP {status}: {detail}")))
        }
    }
}

fn parse_rate_limit(body: RateLimitResponse) -> Result<RateLimitStatus, LookupError> {
    let entry = body
        .resources
        .users
        .get(LOOKUP_RESOURCE)
        .ok_or_else(|| LookupError::Decode(format!("no rate limit entry for {LOOKUP_RESOURCE}")))?;
    let reset_at = DateTime::from_timestamp(entry.reset, 0)
        .ok_or_else(|| LookupError::Decode(format!("invalid reset time {}", entry.reset)))?;
    Ok(RateLimitStatus {
        remaining: entry.remaining,
        reset_at,
    })
}

fn parse_created_at(raw: &str) -> Result<DateTime<Utc>, LookupError> {
    DateTime::parse_from_str(raw, CREATED_AT_FORMAT)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| LookupError::Decode(format!("created_at {raw:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AccessToken;
    use crate::lookup::Disposition;
    use chrono::{Datelike, TimeZone};

    fn credentials(access: Option<AccessToken>) -> Credentials {
        Credentials {
            consumer_key: "key".into(),
            consumer_secret: "secret".into(),
            access,
            bearer_token: Some("bearer".into()),
        }
    }

    #[test]
    fn parses_ruby_dates() {
        let at = parse_created_at("Tue Mar 21 20:50:14 +0000 2006").unwrap();
        assert_eq!(at, Utc.with_ymd_and_hms(2006, 3, 21, 20, 50, 14).unwrap());

        let shifted = parse_created_at("Thu Jan 01 01:30:00 +0200 2015").unwrap();
        assert_eq!(shifted.year(), 2014);
    }

    #[test]
    fn decodes_users() {
        let body = br#"[{"id": 12, "id_str": "12", "created_at": "Tue Mar 21 20:50:14 +0000 2006"}]"#;
        let users: Vec<User> = decode_body(StatusCode::OK, body).unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].id, 12);
    }

    #[test]
    fn maps_error_bodies_to_api_errors() {
        let body = br#"{"errors":[{"code":17,"message":"No user matches for specified terms."}]}"#;
        let err = decode_body::<Vec<User>>(StatusCode::NOT_FOUND, body).unwrap_err();
        assert!(matches!(err, LookupError::Api { code: 17, .. }));

        let body = br#"{"errors":[{"code":88,"message":"Rate limit exceeded"}]}"#;
        let err = decode_body::<Vec<User>>(StatusCode::TOO_MANY_REQUESTS, body).unwrap_err();
        assert!(matches!(err, LookupError::Api { code: 88, .. }));

        let err = decode_body::<Vec<User>>(StatusCode::BAD_GATEWAY, b"<html>").unwrap_err();
        assert!(matches!(err, LookupError::Transport(_)));
    }

    #[test]
    fn reads_lookup_rate_limit() {
        let body: RateLimitResponse = serde_json::from_str(
            r#"{"resources":{"users":{"/users/lookup":{"limit":900,"remaining":899,"reset":1403602426}}}}"#,
        )
        .unwrap();
        let status = parse_rate_limit(body).unwrap();
        assert_eq!(status.remaining, 899);
        assert_eq!(status.reset_at.timestamp(), 1_403_602_426);
    }

    #[tokio::test]
    async fn refused_connection_is_retried() {
        let client = TwitterClient::connect_to("http://127.0.0.1:1", &credentials(None))
            .await
            .unwrap();
        let err = client.lookup_batch(&[1, 2, 3]).await.unwrap_err();
        assert_eq!(err.disposition(), Disposition::Retry, "{err}");
    }

    #[tokio::test]
    async fn access_token_selects_user_context() {
        let access = AccessToken {
            token: "token".into(),
            secret: "token-secret".into(),
        };
        let client = TwitterClient::connect_to("http://127.0.0.1:1/", &credentials(Some(access)))
            .await
            .unwrap();
        assert!(matches!(client.auth, Auth::User(_)));
        assert_eq!(client.base, "http://127.0.0.1:1");

        let client = TwitterClient::connect_to("http://127.0.0.1:1", &credentials(None))
            .await
            .unwrap();
        assert!(matches!(client.auth, Auth::App(ref token) if token == "bearer"));
    }
}
