//! Client for the remote profile API.

use async_trait::async_trait;
use log::debug;
use reqwest::{Client, Response, StatusCode, Url};
use serde::de::DeserializeOwned;

use crate::storage::{ConnectionProfile, ProfileRepository, StoreError};

/// `GET /profiles`, `GET|PUT|DELETE /profiles/{id}` under `base_url`.
#[derive(Clone)]
pub struct HttpProfileApi {
    http: Client,
    base_url: Url,
    token: Option<String>,
}

impl HttpProfileApi {
    /// Fails if `base_url` is not an absolute http(s)-style URL.
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, StoreError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| StoreError::Remote(format!("invalid API URL '{base_url}': {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(StoreError::Remote(format!(
                "API URL '{base_url}' cannot take a path"
            )));
        }
        Ok(Self {
            http: Client::new(),
            base_url,
            token,
        })
    }

    /// Ids are percent-encoded as a single path segment.
    fn url(&self, id: Option<&str>) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push("profiles");
            if let Some(id) = id {
                segments.push(id);
            }
        }
        url
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<Response, StoreError> {
        self.authorized(req).send().await.map_err(http_error)
    }
}

fn http_error(e: reqwest::Error) -> StoreError {
    StoreError::Remote(e.to_string())
}

async fn unexpected(res: Response) -> StoreError {
    let status = res.status();
    let body = res.text().await.unwrap_or_default();
    StoreError::Remote(format!("unexpected status: {status} body={body}"))
}

async fn json<T: DeserializeOwned>(res: Response) -> Result<T, StoreError> {
    res.json::<T>()
        .await
        .map_err(|e| StoreError::Corrupt(e.to_string()))
}

#[async_trait]
impl ProfileRepository for HttpProfileApi {
    async fn list(&self) -> Result<Vec<ConnectionProfile>, StoreError> {
        let res = self.send(self.http.get(self.url(None))).await?;
        if !res.status().is_success() {
            return Err(unexpected(res).await);
        }
        let profiles: Vec<ConnectionProfile> = json(res).await?;
        debug!("Remote returned {} profiles", profiles.len());
        Ok(profiles)
    }

    async fn get(&self, id: &str) -> Result<Option<ConnectionProfile>, StoreError> {
        let res = self.send(self.http.get(self.url(Some(id)))).await?;
        match res.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => json(res).await.map(Some),
            _ => Err(unexpected(res).await),
        }
    }

    async fn upsert(&self, profile: &ConnectionProfile) -> Result<(), StoreError> {
        let res = self
            .send(self.http.put(self.url(Some(&profile.id))).json(profile))
            .await?;
        if res.status().is_success() {
            Ok(())
        } else {
            Err(unexpected(res).await)
        }
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let res = self.send(self.http.delete(self.url(Some(id)))).await?;
        match res.status() {
            StatusCode::NOT_FOUND => Ok(false),
            s if s.is_success() => Ok(true),
            _ => Err(unexpected(res).await),
        }
    }
}
