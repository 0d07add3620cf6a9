//! OAuth 1.0a `HMAC-SHA1` request signing for user-context calls.

use base64::Engine;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use urlencoding::encode;

use crate::lookup::LookupError;

/// Signs requests with a consumer key pair and a user access token pair.
#[derive(Clone)]
pub struct OAuth1Signer {
    consumer_key: String,
    consumer_secret: String,
    token: String,
    token_secret: String,
}

impl OAuth1Signer {
    pub fn new(
        consumer_key: impl Into<String>,
        consumer_secret: impl Into<String>,
        token: impl Into<String>,
        token_secret: impl Into<String>,
    ) -> Self {
        Self {
            consumer_key: consumer_key.into(),
            consumer_secret: consumer_secret.into(),
            token: token.into(),
            token_secret: token_secret.into(),
        }
    }

    /// `Authorization` header value for one request.
    ///
    /// `url` must not carry a query string; pass the query (or form)
    /// parameters in `params` so they are covered by the signature.
    pub fn authorization(
        &self,
        method: &str,
        url: &str,
        params: &[(&str, &str)],
    ) -> Result<String, LookupError> {
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        let timestamp = chrono::Utc::now().timestamp().to_string();
        self.authorization_at(method, url, params, &nonce, &timestamp)
    }

    fn authorization_at(
        &self,
        method: &str,
        url: &str,
        params: &[(&str, &str)],
        nonce: &str,
        timestamp: &str,
    ) -> Result<String, LookupError> {
        let oauth = [
            ("oauth_consumer_key", self.consumer_key.as_str()),
            ("oauth_nonce", nonce),
            ("oauth_signature_method", "HMAC-SHA1"),
            ("oauth_timestamp", timestamp),
            ("oauth_token", self.token.as_str()),
            ("oauth_version", "1.0"),
        ];
        let signature = self.signature(method, url, params, &oauth)?;

        let fields: Vec<String> = oauth
            .iter()
            .copied()
            .chain(std::iter::once(("oauth_signature", signature.as_str())))
            .map(|(k, v)| format!("{}=\"{}\"", encode(k), encode(v)))
            .collect();
        Ok(format!("OAuth {}", fields.join(", ")))
    }

    fn signature(
        &self,
        method: &str,
        url: &str,
        params: &[(&str, &str)],
        oauth: &[(&str, &str)],
    ) -> Result<String, LookupError> {
        let mut pairs: Vec<(String, String)> = params
            .iter()
            .chain(oauth)
            .map(|(k, v)| (encode(k).into_owned(), encode(v).into_owned()))
            .collect();
        pairs.sort();
        let normalized = pairs
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");

        let base = format!(
            "{}&{}&{}",
            method.to_ascii_uppercase(),
            encode(url),
            encode(&normalized)
        );
        let key = format!(
            "{}&{}",
            encode(&self.consumer_secret),
            encode(&self.token_secret)
        );

        let mut mac = Hmac::<Sha1>::new_from_slice(key.as_bytes())
            .map_err(|e| LookupError::Transport(format!("signing key: {e}")))?;
        mac.update(base.as_bytes());
        Ok(base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
    }
}

impl std::fmt::Debug for OAuth1Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuth1Signer")
            .field("consumer_key", &self.consumer_key)
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}
