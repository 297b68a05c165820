use crate::commands::VmDefaults;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

const DEFAULT_ENDPOINT: &str = "https://management.azure.com";
const DEFAULT_PORTAL: &str = "https://portal.azure.com";
const DEFAULT_ISSUE_URL: &str = "https://github.com/strato-tui/strato/issues/new";
const DEFAULT_PAGE_SIZE: usize = 100;

/// Resolved runtime configuration, built once at startup from the config
/// file (if any) plus CLI overrides, then injected wherever needed.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub source: Option<String>,
    pub endpoint: String,
    pub portal_base: String,
    pub issue_url: String,
    pub token: Option<String>,
    pub page_size: usize,
    /// Forces every unexpected-error notification to drop its per-error
    /// "report issue" affordance in favor of the dedicated command.
    pub suppress_report_issue: bool,
    pub account_label: String,
    pub vm_defaults: VmDefaults,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct StratoConfigFile {
    #[serde(default)]
    endpoint: Option<String>,
    #[serde(default)]
    portal: Option<String>,
    #[serde(default)]
    issue_url: Option<String>,
    /// Name of the environment variable holding the bearer token.
    #[serde(default)]
    token_env: Option<String>,
    #[serde(default)]
    page_size: Option<usize>,
    #[serde(default)]
    suppress_report_issue: Option<bool>,
    #[serde(default)]
    account: Option<String>,
    #[serde(default)]
    defaults: DefaultsSpec,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct DefaultsSpec {
    #[serde(default)]
    location: Option<String>,
    #[serde(default, alias = "size")]
    vm_size: Option<String>,
    #[serde(default)]
    image: Option<String>,
    #[serde(default, alias = "username")]
    admin_username: Option<String>,
}

impl RuntimeConfig {
    pub fn load(explicit: Option<PathBuf>) -> Result<Self> {
        let Some(path) = explicit.or_else(discover_config_path) else {
            return Ok(Self::from_parsed(StratoConfigFile::default(), None));
        };

        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let parsed: StratoConfigFile = serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        Ok(Self::from_parsed(parsed, Some(path.display().to_string())))
    }

    fn from_parsed(parsed: StratoConfigFile, source: Option<String>) -> Self {
        let token = parsed
            .token_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .filter(|token| !token.trim().is_empty());
        let base_defaults = VmDefaults::default();
        Self {
            source,
            endpoint: parsed
                .endpoint
                .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            portal_base: parsed.portal.unwrap_or_else(|| DEFAULT_PORTAL.to_string()),
            issue_url: parsed
                .issue_url
                .unwrap_or_else(|| DEFAULT_ISSUE_URL.to_string()),
            token,
            page_size: parsed.page_size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, 1000),
            suppress_report_issue: parsed.suppress_report_issue.unwrap_or(true),
            account_label: parsed.account.unwrap_or_else(|| "Account".to_string()),
            vm_defaults: VmDefaults {
                location: parsed.defaults.location.unwrap_or(base_defaults.location),
                vm_size: parsed.defaults.vm_size.unwrap_or(base_defaults.vm_size),
                image: parsed.defaults.image.unwrap_or(base_defaults.image),
                admin_username: parsed
                    .defaults
                    .admin_username
                    .unwrap_or(base_defaults.admin_username),
            },
        }
    }
}

fn discover_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("STRATO_CONFIG")
        && !path.trim().is_empty()
    {
        return Some(PathBuf::from(path));
    }

    let cwd_candidates = [
        PathBuf::from("strato.yaml"),
        PathBuf::from("strato.yml"),
        PathBuf::from(".strato.yaml"),
    ];
    for candidate in cwd_candidates {
        if candidate.exists() {
            return Some(candidate);
        }
    }

    if let Ok(home) = std::env::var("HOME") {
        let user_candidates = [
            PathBuf::from(&home).join(".config/strato/config.yaml"),
            PathBuf::from(&home).join(".config/strato/config.yml"),
        ];
        for candidate in user_candidates {
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::{RuntimeConfig, StratoConfigFile};

    #[test]
    fn empty_config_falls_back_to_defaults() {
        let config = RuntimeConfig::from_parsed(StratoConfigFile::default(), None);
        assert_eq!(config.endpoint, "https://management.azure.com");
        assert_eq!(config.page_size, 100);
        assert!(config.suppress_report_issue);
        assert!(config.token.is_none());
        assert_eq!(config.vm_defaults.vm_size, "Standard_B2s");
    }

    #[test]
    fn file_values_override_defaults() {
        let parsed: StratoConfigFile = serde_yaml::from_str(
            r#"
endpoint: https://management.example.test
page_size: 50
suppress_report_issue: false
account: Contoso
defaults:
  location: eastus2
  size: Standard_D4s_v5
  username: ops
"#,
        )
        .unwrap();
        let config = RuntimeConfig::from_parsed(parsed, Some("strato.yaml".to_string()));
        assert_eq!(config.endpoint, "https://management.example.test");
        assert_eq!(config.page_size, 50);
        assert!(!config.suppress_report_issue);
        assert_eq!(config.account_label, "Contoso");
        assert_eq!(config.vm_defaults.location, "eastus2");
        assert_eq!(config.vm_defaults.vm_size, "Standard_D4s_v5");
        assert_eq!(config.vm_defaults.admin_username, "ops");
        // Unset fields keep their defaults.
        assert_eq!(config.vm_defaults.image, "ubuntu-24.04-lts");
    }

    #[test]
    fn page_size_is_clamped() {
        let parsed: StratoConfigFile = serde_yaml::from_str("page_size: 0").unwrap();
        assert_eq!(RuntimeConfig::from_parsed(parsed, None).page_size, 1);
        let parsed: StratoConfigFile = serde_yaml::from_str("page_size: 10000").unwrap();
        assert_eq!(RuntimeConfig::from_parsed(parsed, None).page_size, 1000);
    }
}
