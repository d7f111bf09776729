//! Basic-auth substitution (PowerMax dialect): every forwarded request gets its
//! `Authorization` header replaced by HTTP Basic built from the SystemEntry's credentials.
//! Stateless, so there is nothing to refresh and nothing to tear down.

use async_trait::async_trait;

use super::SessionManager;
use crate::error::ProxyError;

pub struct BasicAuthSession {
    user: String,
    password: String,
}

impl BasicAuthSession {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        BasicAuthSession {
            user: user.into(),
            password: password.into(),
        }
    }
}

#[async_trait]
impl SessionManager for BasicAuthSession {
    async fn prepare(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::RequestBuilder, ProxyError> {
        Ok(builder.basic_auth(&self.user, Some(&self.password)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn attaches_basic_auth_header() {
        let session = BasicAuthSession::new("admin", "secret");
        let client = reqwest::Client::new();
        let builder = client.get("https://example.invalid/");
        let req = session.prepare(builder).await.unwrap().build().unwrap();
        let header = req.headers().get(http::header::AUTHORIZATION).unwrap();
        assert!(header.to_str().unwrap().starts_with("Basic "));
    }
}
