//! Upload configuration.
//!
//! `UploadConfig` is the serializable form of an upload strategy plus the server
//! settings needed to build an [`HttpDataSource`](crate::sync::HttpDataSource). It is
//! loaded from JSON and validated once, at the boundary.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::sync::{CreateMethod, FetchMode, PatchMode, RequestMode, UpdateMethod, UploadStrategy};
use crate::util::{is_http_url, normalize_text_option};

pub const DEFAULT_MAX_ENTRIES: usize = 500;
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// How upload requests are packaged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestModeKind {
    #[default]
    Bundle,
    Individual,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct UploadConfig {
    #[serde(default)]
    pub server_base_url: Option<String>,
    #[serde(default)]
    pub fetch_mode: FetchMode,
    #[serde(default)]
    pub patch_mode: PatchMode,
    #[serde(default)]
    pub request_mode: RequestModeKind,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default)]
    pub create_method: CreateMethod,
    #[serde(default)]
    pub update_method: UpdateMethod,
    #[serde(default = "default_use_etag")]
    pub use_etag_for_upload: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            server_base_url: None,
            fetch_mode: FetchMode::default(),
            patch_mode: PatchMode::default(),
            request_mode: RequestModeKind::default(),
            max_entries: DEFAULT_MAX_ENTRIES,
            create_method: CreateMethod::default(),
            update_method: UpdateMethod::default(),
            use_etag_for_upload: true,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl UploadConfig {
    /// Build the validated strategy this config describes
    pub fn strategy(&self) -> Result<UploadStrategy> {
        let request_mode = match self.request_mode {
            RequestModeKind::Bundle => RequestMode::Bundle {
                max_entries: self.max_entries,
                create: self.create_method,
                update: self.update_method,
                use_etag_for_upload: self.use_etag_for_upload,
            },
            RequestModeKind::Individual => RequestMode::Individual {
                create: self.create_method,
                update: self.update_method,
                use_etag_for_upload: self.use_etag_for_upload,
            },
        };
        UploadStrategy::new(self.fetch_mode, self.patch_mode, request_mode)
    }

    /// Normalized server base URL, if one is configured.
    ///
    /// Rejects values without an `http://` or `https://` scheme.
    pub fn server_base_url(&self) -> Result<Option<String>> {
        let Some(url) = normalize_text_option(self.server_base_url.clone()) else {
            return Ok(None);
        };
        if !is_http_url(&url) {
            return Err(Error::Configuration(
                "server_base_url must include http:// or https://".to_string(),
            ));
        }
        Ok(Some(url.trim_end_matches('/').to_string()))
    }

    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.timeout_secs == 0 {
            return Err(Error::Configuration(
                "timeout_secs must be greater than zero".to_string(),
            ));
        }
        self.server_base_url()?;
        self.strategy()?;
        Ok(())
    }
}

/// Parse and validate an upload config from a raw JSON payload
pub fn parse_upload_config(payload: &str) -> Result<UploadConfig> {
    let config: UploadConfig = serde_json::from_str(payload)
        .map_err(|error| Error::Configuration(format!("invalid upload config JSON: {error}")))?;
    config.validate()?;
    Ok(config)
}

const fn default_max_entries() -> usize {
    DEFAULT_MAX_ENTRIES
}

const fn default_use_etag() -> bool {
    true
}

const fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_object_uses_defaults() {
        let config = parse_upload_config("{}").unwrap();
        assert_eq!(config, UploadConfig::default());

        let strategy = config.strategy().unwrap();
        assert_eq!(strategy.fetch_mode(), FetchMode::All);
        assert_eq!(strategy.patch_mode(), PatchMode::PerResourceSquash);
        assert_eq!(
            strategy.request_mode(),
            RequestMode::Bundle {
                max_entries: 500,
                create: CreateMethod::Put,
                update: UpdateMethod::Patch,
                use_etag_for_upload: true,
            }
        );
    }

    #[test]
    fn parses_individual_post_config() {
        let payload = r#"
        {
          "server_base_url": "https://fhir.example.org/r4/",
          "fetch_mode": "per_resource_earliest",
          "request_mode": "individual",
          "create_method": "post",
          "use_etag_for_upload": false,
          "timeout_secs": 10
        }
        "#;
        let config = parse_upload_config(payload).unwrap();
        assert_eq!(
            config.server_base_url().unwrap().as_deref(),
            Some("https://fhir.example.org/r4")
        );
        assert_eq!(config.timeout(), Duration::from_secs(10));
        assert_eq!(
            config.strategy().unwrap().request_mode(),
            RequestMode::Individual {
                create: CreateMethod::Post,
                update: UpdateMethod::Patch,
                use_etag_for_upload: false,
            }
        );
    }

    #[test]
    fn rejects_unknown_fields() {
        let error = parse_upload_config(r#"{"retries": 3}"#).unwrap_err();
        assert!(matches!(error, Error::Configuration(_)));
        assert!(error.to_string().contains("unknown field"));
    }

    #[test]
    fn rejects_unsupported_combinations() {
        // POST creation needs per-resource fetching
        let error = parse_upload_config(r#"{"create_method": "post"}"#).unwrap_err();
        assert!(matches!(error, Error::Configuration(_)));

        let error = parse_upload_config(r#"{"update_method": "put"}"#).unwrap_err();
        assert!(matches!(error, Error::Configuration(_)));

        let error = parse_upload_config(r#"{"max_entries": 0}"#).unwrap_err();
        assert!(matches!(error, Error::Configuration(_)));
    }

    #[test]
    fn rejects_invalid_server_settings() {
        assert!(parse_upload_config(r#"{"server_base_url": "fhir.example.org"}"#).is_err());
        assert!(parse_upload_config(r#"{"timeout_secs": 0}"#).is_err());

        let blank = parse_upload_config(r#"{"server_base_url": "  "}"#).unwrap();
        assert_eq!(blank.server_base_url().unwrap(), None);
    }
}
