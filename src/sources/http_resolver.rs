use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use super::{ResolveError, Resolver, SongMatch};

/// Upstream response body. Older resolvers omit `source`.
#[derive(Debug, Deserialize)]
struct MatchResponse {
    url: Option<String>,
    source: Option<String>,
    #[serde(default)]
    br: Option<u32>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    md5: Option<String>,
}

/// [`Resolver`] backed by an HTTP match service.
///
/// Calls `GET {base}/match?id={track}&sources={a,b,...}` and expects a JSON
/// body with at least a `url`.
#[derive(Debug, Clone)]
pub struct HttpResolver {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpResolver {
    pub fn new(mut base_url: Url, timeout: Duration) -> Result<Self, ResolveError> {
        // join() replaces the last segment unless the path ends in '/'
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("open-unblock/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ResolveError::Upstream(format!("cliente HTTP: {}", e)))?;

        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url, ResolveError> {
        self.base_url
            .join(path)
            .map_err(|e| ResolveError::Upstream(format!("URL inválida: {}", e)))
    }

    fn match_url(&self, track_id: &str, sources: &[String]) -> Result<Url, ResolveError> {
        let mut url = self.endpoint("match")?;
        url.query_pairs_mut()
            .append_pair("id", track_id)
            .append_pair("sources", &sources.join(","));
        Ok(url)
    }

    /// Whether the upstream answers at all. Any HTTP response counts.
    pub async fn health_check(&self) -> Result<(), ResolveError> {
        let url = self.endpoint("")?;
        self.client
            .get(url)
            .send()
            .await
            .map_err(|e| ResolveError::Upstream(e.to_string()))?;
        Ok(())
    }
}

fn into_song(body: MatchResponse, track_id: &str, sources: &[String]) -> Result<SongMatch, ResolveError> {
    let url = body
        .url
        .filter(|u| !u.is_empty())
        .ok_or_else(|| ResolveError::NotFound(track_id.to_string()))?;

    let source = body
        .source
        .or_else(|| sources.first().cloned())
        .unwrap_or_default();

    Ok(SongMatch {
        url,
        source,
        br: body.br,
        size: body.size,
        md5: body.md5,
    })
}

#[async_trait]
impl Resolver for HttpResolver {
    async fn resolve(&self, track_id: &str, sources: &[String]) -> Result<SongMatch, ResolveError> {
        let url = self.match_url(track_id, sources)?;
        debug!("🌐 Resolviendo {} vía {}", track_id, url);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ResolveError::Upstream(e.to_string()))?;

        match response.status() {
            status if status.is_success() => {
                let body: MatchResponse = response
                    .json()
                    .await
                    .map_err(|e| ResolveError::Upstream(format!("respuesta inválida: {}", e)))?;
                into_song(body, track_id, sources)
            }
            StatusCode::NOT_FOUND => Err(ResolveError::NotFound(track_id.to_string())),
            status => {
                warn!("⚠️ Resolver respondió {} para {}", status, track_id);
                Err(ResolveError::Upstream(format!("HTTP {}", status)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> HttpResolver {
        let base = Url::parse("http://127.0.0.1:8080/api/").unwrap();
        HttpResolver::new(base, Duration::from_secs(1)).unwrap()
    }

    fn sources() -> Vec<String> {
        vec!["kugou".to_string(), "qq".to_string()]
    }

    #[test]
    fn test_match_url() {
        let url = resolver().match_url("1962165898", &sources()).unwrap();
        assert_eq!(
            url.as_str(),
            "http://127.0.0.1:8080/api/match?id=1962165898&sources=kugou%2Cqq"
        );
    }

    #[test]
    fn test_base_path_is_kept() {
        let base = Url::parse("http://resolver.local/api").unwrap();
        let resolver = HttpResolver::new(base, Duration::from_secs(1)).unwrap();
        let url = resolver.match_url("7", &[]).unwrap();
        assert_eq!(url.path(), "/api/match");
    }

    #[test]
    fn test_response_with_source() {
        let body: MatchResponse = serde_json::from_str(
            r#"{"url":"https://cdn/1.mp3","source":"qq","br":320000,"size":1024}"#,
        )
        .unwrap();

        let song = into_song(body, "1", &sources()).unwrap();
        assert_eq!(song.source, "qq");
        assert_eq!(song.br, Some(320000));
        assert_eq!(song.size, Some(1024));
    }

    #[test]
    fn test_response_without_source_credits_first_candidate() {
        let body: MatchResponse = serde_json::from_str(r#"{"url":"https://cdn/1.mp3"}"#).unwrap();
        assert_eq!(into_song(body, "1", &sources()).unwrap().source, "kugou");
    }

    #[test]
    fn test_empty_url_is_not_found() {
        let body: MatchResponse = serde_json::from_str(r#"{"url":""}"#).unwrap();
        assert!(matches!(
            into_song(body, "1", &sources()),
            Err(ResolveError::NotFound(id)) if id == "1"
        ));
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_upstream_error() {
        // port 9 (discard) is closed on test machines
        let base = Url::parse("http://127.0.0.1:9/").unwrap();
        let resolver = HttpResolver::new(base, Duration::from_millis(500)).unwrap();

        let result = resolver.resolve("1", &sources()).await;
        assert!(matches!(result, Err(ResolveError::Upstream(_))));
        assert!(resolver.health_check().await.is_err());
    }
}
