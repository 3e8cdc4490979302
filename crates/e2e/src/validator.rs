//! Response validation against a deployed storefront

use reqwest::header::{ETAG, IF_NONE_MATCH};
use reqwest::{Client, StatusCode, Url};
use tracing::{info, warn};

use crate::config::ValidationConfig;
use crate::error::{HarnessError, HarnessResult};

/// Checks the landing page and static assets through a client bound to
/// the deployment's base URI
pub struct Validator {
    client: Client,
    base_url: Url,
    config: ValidationConfig,
}

impl Validator {
    pub fn new(client: Client, application_base_uri: &str, config: ValidationConfig) -> HarnessResult<Self> {
        let base_url = Url::parse(application_base_uri).map_err(|e| {
            HarnessError::ValidationFailed(format!("invalid base URI '{}': {}", application_base_uri, e))
        })?;
        Ok(Self {
            client,
            base_url,
            config,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn resolve(&self, path: &str) -> HarnessResult<Url> {
        self.base_url
            .join(path)
            .map_err(|e| HarnessError::ValidationFailed(format!("invalid asset path '{}': {}", path, e)))
    }

    /// Check the landing page response carries every configured marker
    pub async fn verify_home_page(&self, response: reqwest::Response) -> HarnessResult<()> {
        info!("Home page content : {}", response.url());
        let status = response.status();
        let body = response.text().await?;
        check_home_page(status, &body, &self.config.home_page_markers)?;
        info!("Application initialization successful.");
        Ok(())
    }

    /// Fetch every configured static asset and require a non-empty success
    /// response. The first asset is also revalidated with its ETag.
    pub async fn verify_static_content_served(&self) -> HarnessResult<()> {
        info!("Validating if static contents are served..");

        for (idx, asset) in self.config.static_assets.iter().enumerate() {
            let url = self.resolve(asset)?;
            info!("Fetching {}..", asset);
            let response = self.client.get(url.clone()).send().await?;
            let status = response.status();
            let etag = response.headers().get(ETAG).cloned();
            let body = response.bytes().await?;

            if !status.is_success() {
                return Err(HarnessError::ValidationFailed(format!(
                    "static asset '{}' returned {}",
                    asset, status
                )));
            }
            if body.is_empty() {
                return Err(HarnessError::ValidationFailed(format!(
                    "static asset '{}' was served with an empty body",
                    asset
                )));
            }

            if idx == 0 && self.config.verify_etag {
                match etag {
                    Some(etag) => {
                        info!("Sending an IfNoneMatch header with e-tag {:?}", etag);
                        let revalidated = self
                            .client
                            .get(url)
                            .header(IF_NONE_MATCH, etag)
                            .send()
                            .await?;
                        if revalidated.status() != StatusCode::NOT_MODIFIED {
                            return Err(HarnessError::ValidationFailed(format!(
                                "static asset '{}' with matching ETag returned {}, expected 304",
                                asset,
                                revalidated.status()
                            )));
                        }
                        info!("Successfully received a NotModified status");
                    }
                    None => warn!("Static asset '{}' has no ETag, skipping revalidation", asset),
                }
            }
        }

        info!("Verified static contents are served successfully");
        Ok(())
    }
}

/// Landing page check on an already-read response
pub fn check_home_page(status: StatusCode, body: &str, markers: &[String]) -> HarnessResult<()> {
    if !status.is_success() {
        return Err(HarnessError::ValidationFailed(format!(
            "home page returned {}",
            status
        )));
    }
    match markers.iter().find(|m| !body.contains(m.as_str())) {
        Some(missing) => Err(HarnessError::ValidationFailed(format!(
            "home page is missing marker '{}'",
            missing
        ))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn markers() -> Vec<String> {
        vec!["<title>Home</title>".to_string(), "Login".to_string()]
    }

    #[test]
    fn test_home_page_all_markers_present() {
        let body = "<html><title>Home</title><a>Login</a></html>";
        check_home_page(StatusCode::OK, body, &markers()).unwrap();
    }

    #[test]
    fn test_home_page_names_missing_marker() {
        let body = "<html><title>Home</title></html>";
        match check_home_page(StatusCode::OK, body, &markers()) {
            Err(HarnessError::ValidationFailed(msg)) => assert!(msg.contains("'Login'")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_home_page_rejects_error_status() {
        let body = "<html><title>Home</title><a>Login</a></html>";
        assert!(matches!(
            check_home_page(StatusCode::INTERNAL_SERVER_ERROR, body, &markers()),
            Err(HarnessError::ValidationFailed(_))
        ));
    }

    #[test]
    fn test_asset_paths_resolve_against_base() {
        let validator = Validator::new(
            Client::new(),
            "http://localhost:5025/store/",
            ValidationConfig::default(),
        )
        .unwrap();
        assert_eq!(
            validator.resolve("Content/site.css").unwrap().as_str(),
            "http://localhost:5025/store/Content/site.css"
        );
    }

    #[test]
    fn test_invalid_base_uri() {
        assert!(Validator::new(Client::new(), "not a url", ValidationConfig::default()).is_err());
    }
}
