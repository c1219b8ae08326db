use camino::{Utf8Path, Utf8PathBuf};
use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

static APP_NAME: &str = "infra-test";
static DEFAULT_CONFIG: Lazy<HarnessConfig> = Lazy::new(HarnessConfig::default);

pub const ENV_PREFIX: &str = "INFRA_TEST_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load infra-test configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("config file {0} does not exist")]
    MissingFile(Utf8PathBuf),
    #[error("{field} must match [a-z0-9-]+, got {value:?}")]
    InvalidName { field: &'static str, value: String },
    #[error("probe.retries must be at least 1")]
    NoProbeAttempts,
    #[error("probe.paths must list at least one path")]
    NoProbePaths,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessConfig {
    #[serde(default = "default_repo_root")]
    pub repo_root: Utf8PathBuf,
    #[serde(default = "default_app_name")]
    pub app_name: String,
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default = "default_workspace_prefix")]
    pub workspace_prefix: String,
    #[serde(default = "default_service_dir")]
    pub service_dir: Utf8PathBuf,
    #[serde(default = "default_build_repository_dir")]
    pub build_repository_dir: Utf8PathBuf,
    #[serde(default = "default_shared_backend")]
    pub shared_backend_config: String,
    #[serde(default)]
    pub aws_region: Option<String>,
    #[serde(default)]
    pub make: MakeConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub terraform: TerraformConfig,
    #[serde(default)]
    pub destroy: DestroyConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            repo_root: default_repo_root(),
            app_name: default_app_name(),
            environment: default_environment(),
            workspace_prefix: default_workspace_prefix(),
            service_dir: default_service_dir(),
            build_repository_dir: default_build_repository_dir(),
            shared_backend_config: default_shared_backend(),
            aws_region: None,
            make: MakeConfig::default(),
            probe: ProbeConfig::default(),
            terraform: TerraformConfig::default(),
            destroy: DestroyConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MakeConfig {
    #[serde(default = "default_build_target")]
    pub build_target: String,
    #[serde(default = "default_publish_target")]
    pub publish_target: String,
}

impl Default for MakeConfig {
    fn default() -> Self {
        Self {
            build_target: default_build_target(),
            publish_target: default_publish_target(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    #[serde(default = "default_probe_paths")]
    pub paths: Vec<String>,
    #[serde(default = "default_probe_retries")]
    pub retries: u32,
    #[serde(default = "default_probe_sleep_ms")]
    pub sleep_ms: u64,
    #[serde(default = "default_expect_status")]
    pub expect_status: u16,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            paths: default_probe_paths(),
            retries: default_probe_retries(),
            sleep_ms: default_probe_sleep_ms(),
            expect_status: default_expect_status(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerraformConfig {
    #[serde(default = "default_tf_retries")]
    pub max_retries: u32,
    #[serde(default = "default_tf_sleep_ms")]
    pub sleep_ms: u64,
}

impl Default for TerraformConfig {
    fn default() -> Self {
        Self {
            max_retries: default_tf_retries(),
            sleep_ms: default_tf_sleep_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestroyConfig {
    /// Repo-relative Terraform sources whose deletion guards are lifted before destroy.
    #[serde(default = "default_patch_files")]
    pub patch_files: Vec<Utf8PathBuf>,
    #[serde(default = "default_destroy_targets")]
    pub targets: Vec<String>,
}

impl Default for DestroyConfig {
    fn default() -> Self {
        Self {
            patch_files: default_patch_files(),
            targets: default_destroy_targets(),
        }
    }
}

impl HarnessConfig {
    /// Layer defaults, a TOML file and `INFRA_TEST_*` environment overrides.
    pub fn load(explicit_path: Option<&Utf8Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(DEFAULT_CONFIG.clone()));

        if let Some(path) = explicit_path {
            if !path.is_file() {
                return Err(ConfigError::MissingFile(path.to_path_buf()));
            }
            debug!(%path, "using config file");
            figment = figment.merge(Toml::file_exact(path));
        } else if let Some(path) = resolve_default_config_path() {
            debug!(%path, "using config file");
            figment = figment.merge(Toml::file(path));
        } else {
            warn!("no config file found; relying on defaults + env overrides");
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: Self = figment.extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_name("app_name", &self.app_name)?;
        check_name("environment", &self.environment)?;
        check_name("workspace_prefix", &self.workspace_prefix)?;
        if self.probe.retries == 0 {
            return Err(ConfigError::NoProbeAttempts);
        }
        if self.probe.paths.is_empty() {
            return Err(ConfigError::NoProbePaths);
        }
        Ok(())
    }

    /// Backend file used when initialising the service module, e.g. `dev.s3.tfbackend`.
    pub fn service_backend_config(&self) -> String {
        format!("{}.s3.tfbackend", self.environment)
    }

    pub fn service_dir(&self) -> Utf8PathBuf {
        self.repo_root.join(&self.service_dir)
    }

    pub fn build_repository_dir(&self) -> Utf8PathBuf {
        self.repo_root.join(&self.build_repository_dir)
    }
}

fn check_name(field: &'static str, value: &str) -> Result<(), ConfigError> {
    let valid = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidName {
            field,
            value: value.to_string(),
        })
    }
}

/// Root of the cargo workspace this crate is built from.
pub fn workspace_root() -> &'static Utf8Path {
    static ROOT: Lazy<Utf8PathBuf> = Lazy::new(|| {
        let manifest_dir = Utf8PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        manifest_dir
            .parent()
            .and_then(|p| p.parent())
            .map(Utf8PathBuf::from)
            .unwrap_or(manifest_dir)
    });
    ROOT.as_path()
}

fn resolve_default_config_path() -> Option<Utf8PathBuf> {
    let repo_relative = workspace_root().join("infra-test.toml");
    if repo_relative.exists() {
        return Some(repo_relative);
    }

    if let Some(dirs) = ProjectDirs::from("org", "infra-test", APP_NAME)
        && let Ok(path) = Utf8PathBuf::from_path_buf(dirs.config_dir().join("config.toml"))
        && path.exists()
    {
        return Some(path);
    }

    None
}

fn default_repo_root() -> Utf8PathBuf {
    workspace_root().to_path_buf()
}

fn default_app_name() -> String {
    "app".into()
}

fn default_environment() -> String {
    "dev".into()
}

fn default_workspace_prefix() -> String {
    "t-".into()
}

fn default_service_dir() -> Utf8PathBuf {
    Utf8PathBuf::from("infra/app/service")
}

fn default_build_repository_dir() -> Utf8PathBuf {
    Utf8PathBuf::from("infra/app/build-repository")
}

fn default_shared_backend() -> String {
    "shared.s3.tfbackend".into()
}

fn default_build_target() -> String {
    "release-build".into()
}

fn default_publish_target() -> String {
    "release-publish".into()
}

fn default_probe_paths() -> Vec<String> {
    vec!["/".into(), "/feature-flags".into()]
}

fn default_probe_retries() -> u32 {
    5
}

fn default_probe_sleep_ms() -> u64 {
    1_000
}

fn default_expect_status() -> u16 {
    200
}

fn default_tf_retries() -> u32 {
    3
}

fn default_tf_sleep_ms() -> u64 {
    5_000
}

fn default_patch_files() -> Vec<Utf8PathBuf> {
    vec![Utf8PathBuf::from("infra/modules/service/access_logs.tf")]
}

fn default_destroy_targets() -> Vec<String> {
    vec!["module.service.aws_s3_bucket.access_logs".into()]
}
