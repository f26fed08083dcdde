//! Environment-driven global configuration
//!
//! The global run configuration comes entirely from environment variables
//! (`SHEET_*`, `RUNTIME_*`, `NETWORK_*`, `DEDUPE_*`, `STATE_*`,
//! `BEHAVIOR_*`), with filesystem defaults selected by `APP_RUN_ENV`
//! (`local` or `docker`).

use crate::config::types::{
    BehaviorConfig, BehaviorMouseConfig, BehaviorNavigationConfig, BehaviorScrollConfig,
    BrowserOptions, DedupeConfig, DelayRange, EngineKind, GlobalConfig, GlobalStopConfig,
    NetworkConfig, RetryPolicy, RuntimeConfig, SheetConfig, StateConfig,
};
use crate::ConfigError;
use std::env;
use std::path::{Path, PathBuf};

const LOCAL_ENV: &str = "local";
const DOCKER_ENV: &str = "docker";

/// Returns the effective run environment (`local` or `docker`).
///
/// `APP_RUN_ENV` wins when set; otherwise docker is detected from the
/// container marker file.
pub fn run_env() -> &'static str {
    match env::var("APP_RUN_ENV").ok().as_deref().map(str::trim) {
        Some(value) if value.eq_ignore_ascii_case(DOCKER_ENV) => DOCKER_ENV,
        Some(value) if value.eq_ignore_ascii_case(LOCAL_ENV) => LOCAL_ENV,
        _ => {
            if Path::new("/.dockerenv").exists() || env::var_os("DOCKER_CONTAINER").is_some() {
                DOCKER_ENV
            } else {
                LOCAL_ENV
            }
        }
    }
}

/// Resolves a path from an env var, falling back to the per-environment default
pub fn resolve_path(name: &str, local_default: &str, docker_default: &str) -> PathBuf {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => PathBuf::from(value.trim()),
        _ => PathBuf::from(if run_env() == DOCKER_ENV {
            docker_default
        } else {
            local_default
        }),
    }
}

/// Default directory with per-site YAML/JSON configs
pub fn default_sites_dir() -> PathBuf {
    resolve_path("SITE_CONFIG_DIR", "config/sites", "/app/config/sites")
}

/// Directory where product images are saved
pub fn image_dir() -> PathBuf {
    resolve_path("PRODUCT_IMAGE_DIR", "assets/images", "/app/assets/images")
}

/// Loads the global configuration.
///
/// A YAML/JSON file at `GLOBAL_CONFIG_PATH` takes precedence; otherwise
/// the configuration is assembled from individual environment variables.
pub fn load_global_config() -> Result<GlobalConfig, ConfigError> {
    match env::var("GLOBAL_CONFIG_PATH") {
        Ok(path) if !path.trim().is_empty() => {
            let content = std::fs::read_to_string(path.trim())?;
            let config = serde_yaml::from_str(&content)?;
            tracing::info!(path = path.trim(), "Loaded global config file");
            Ok(config)
        }
        _ => load_global_config_from_env(),
    }
}

/// Builds the global configuration from the environment.
///
/// # Returns
///
/// * `Ok(GlobalConfig)` - Every block parsed and defaulted
/// * `Err(ConfigError)` - A required variable is missing or malformed
pub fn load_global_config_from_env() -> Result<GlobalConfig, ConfigError> {
    let sheet = SheetConfig {
        spreadsheet_id: require("SHEET_SPREADSHEET_ID")?,
        write_batch_size: int("SHEET_WRITE_BATCH_SIZE")?.unwrap_or(200) as usize,
        state_tab: env::var("SHEET_STATE_TAB").unwrap_or_else(|_| "_state".to_string()),
        runs_tab: env::var("SHEET_RUNS_TAB").unwrap_or_else(|_| "_runs".to_string()),
        flush_product_interval: int("WRITE_FLUSH_PRODUCT_INTERVAL")?.unwrap_or(1).max(1)
            as usize,
    };

    let runtime = RuntimeConfig {
        max_concurrency_per_site: int("RUNTIME_MAX_CONCURRENCY_PER_SITE")?.unwrap_or(1).max(1)
            as usize,
        global_stop: GlobalStopConfig {
            stop_after_products: int("RUNTIME_STOP_AFTER_PRODUCTS")?.map(|v| v as u64),
            stop_after_minutes: int("RUNTIME_STOP_AFTER_MINUTES")?.map(|v| v as u64),
        },
        page_delay: delay_range("RUNTIME_PAGE_DELAY", 5.0, 8.0)?,
        product_delay: delay_range("RUNTIME_PRODUCT_DELAY", 8.0, 12.0)?,
        behavior: behavior_from_env()?,
        product_fetch_engine: product_fetch_engine()?,
    };

    let network = NetworkConfig {
        user_agents: list_required("NETWORK_USER_AGENTS")?,
        proxy_pool: list("NETWORK_PROXY_POOL"),
        proxy_allow_direct: boolean("NETWORK_PROXY_ALLOW_DIRECT").unwrap_or(false),
        request_timeout_sec: float("NETWORK_REQUEST_TIMEOUT_SEC")?.unwrap_or(30.0),
        retry: RetryPolicy {
            max_attempts: int("NETWORK_RETRY_MAX_ATTEMPTS")?.unwrap_or(3).max(1) as u32,
            backoff_sec: float_list("NETWORK_RETRY_BACKOFF_SEC")?
                .unwrap_or_else(|| vec![2.0, 5.0, 10.0]),
        },
        accept_language: env::var("NETWORK_ACCEPT_LANGUAGE").ok().filter(|v| !v.is_empty()),
        browser: BrowserOptions {
            headless: boolean("NETWORK_BROWSER_HEADLESS").unwrap_or(true),
            slow_mo_ms: int("NETWORK_BROWSER_SLOW_MO_MS")?.unwrap_or(0).max(0) as u64,
            preview_before_behavior_sec: float("NETWORK_BROWSER_PREVIEW_BEFORE_BEHAVIOR_SEC")?
                .unwrap_or(0.0),
            preview_delay_sec: float("NETWORK_BROWSER_PREVIEW_DELAY_SEC")?.unwrap_or(0.0),
            extra_page_preview_sec: float("NETWORK_BROWSER_EXTRA_PAGE_PREVIEW_SEC")?
                .unwrap_or(0.0),
            storage_state_path: optional_existing_path(
                "NETWORK_BROWSER_STORAGE_STATE_PATH",
                "secrets/auth.json",
                "/secrets/auth.json",
            ),
        },
        bad_proxy_log_path: resolve_path(
            "NETWORK_BAD_PROXY_LOG_PATH",
            "logs/bad_proxies.log",
            "/var/log/parser/bad_proxies.log",
        ),
    };

    let dedupe = DedupeConfig {
        strip_params_blacklist: list("DEDUPE_STRIP_PARAMS_BLACKLIST"),
    };

    let state = StateConfig {
        database: resolve_path(
            "STATE_DATABASE_PATH",
            "state/runtime.db",
            "/var/app/state/runtime.db",
        ),
    };

    Ok(GlobalConfig {
        sheet,
        runtime,
        network,
        dedupe,
        state,
    })
}

fn behavior_from_env() -> Result<BehaviorConfig, ConfigError> {
    let defaults = BehaviorConfig::default();
    Ok(BehaviorConfig {
        enabled: boolean("BEHAVIOR_ENABLED").unwrap_or(false),
        debug: boolean("BEHAVIOR_DEBUG").unwrap_or(false),
        action_delay: delay_range("BEHAVIOR_ACTION_DELAY", 0.3, 0.9)?,
        scroll: BehaviorScrollConfig {
            probability: float("BEHAVIOR_SCROLL_PROBABILITY")?
                .unwrap_or(defaults.scroll.probability),
            skip_probability: float("BEHAVIOR_SCROLL_SKIP_PROBABILITY")?
                .unwrap_or(defaults.scroll.skip_probability),
            min_depth_percent: int("BEHAVIOR_SCROLL_MIN_DEPTH")?
                .unwrap_or(defaults.scroll.min_depth_percent as i64)
                as u32,
            max_depth_percent: int("BEHAVIOR_SCROLL_MAX_DEPTH")?
                .unwrap_or(defaults.scroll.max_depth_percent as i64)
                as u32,
            min_steps: int("BEHAVIOR_SCROLL_MIN_STEPS")?
                .unwrap_or(defaults.scroll.min_steps as i64) as u32,
            max_steps: int("BEHAVIOR_SCROLL_MAX_STEPS")?
                .unwrap_or(defaults.scroll.max_steps as i64) as u32,
            step_delay: delay_range("BEHAVIOR_SCROLL_STEP_DELAY", 0.2, 0.8)?,
        },
        mouse: BehaviorMouseConfig {
            move_count_min: int("BEHAVIOR_MOUSE_MOVE_MIN")?
                .unwrap_or(defaults.mouse.move_count_min as i64) as u32,
            move_count_max: int("BEHAVIOR_MOUSE_MOVE_MAX")?
                .unwrap_or(defaults.mouse.move_count_max as i64) as u32,
            hover_probability: float("BEHAVIOR_MOUSE_HOVER_PROBABILITY")?
                .unwrap_or(defaults.mouse.hover_probability),
        },
        navigation: BehaviorNavigationConfig {
            back_probability: float("BEHAVIOR_NAV_BACK_PROBABILITY")?
                .unwrap_or(defaults.navigation.back_probability),
            extra_products_probability: float("BEHAVIOR_NAV_EXTRA_PRODUCTS_PROBABILITY")?
                .unwrap_or(defaults.navigation.extra_products_probability),
            extra_products_limit: int("BEHAVIOR_NAV_EXTRA_PRODUCTS_LIMIT")?
                .unwrap_or(defaults.navigation.extra_products_limit as i64)
                as u32,
            visit_root_probability: float("BEHAVIOR_NAV_VISIT_ROOT_PROBABILITY")?
                .unwrap_or(defaults.navigation.visit_root_probability),
            max_additional_chain: int("BEHAVIOR_NAV_MAX_CHAIN")?
                .unwrap_or(defaults.navigation.max_additional_chain as i64)
                as u32,
        },
    })
}

fn product_fetch_engine() -> Result<EngineKind, ConfigError> {
    match env::var("PRODUCT_FETCH_ENGINE")
        .unwrap_or_else(|_| "http".to_string())
        .trim()
        .to_lowercase()
        .as_str()
    {
        "http" => Ok(EngineKind::Http),
        "browser" => Ok(EngineKind::Browser),
        other => Err(ConfigError::InvalidValue {
            name: "PRODUCT_FETCH_ENGINE".to_string(),
            message: format!("expected 'http' or 'browser', got '{}'", other),
        }),
    }
}

fn delay_range(prefix: &str, default_min: f64, default_max: f64) -> Result<DelayRange, ConfigError> {
    Ok(DelayRange::new(
        float(&format!("{}_MIN_SEC", prefix))?.unwrap_or(default_min),
        float(&format!("{}_MAX_SEC", prefix))?.unwrap_or(default_max),
    ))
}

fn require(name: &str) -> Result<String, ConfigError> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::MissingEnv(name.to_string())),
    }
}

fn int(name: &str) -> Result<Option<i64>, ConfigError> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => {
            value.trim().parse().map(Some).map_err(|_| ConfigError::InvalidValue {
                name: name.to_string(),
                message: format!("expected an integer, got '{}'", value),
            })
        }
        _ => Ok(None),
    }
}

fn float(name: &str) -> Result<Option<f64>, ConfigError> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => {
            value.trim().parse().map(Some).map_err(|_| ConfigError::InvalidValue {
                name: name.to_string(),
                message: format!("expected a number, got '{}'", value),
            })
        }
        _ => Ok(None),
    }
}

fn boolean(name: &str) -> Option<bool> {
    let value = env::var(name).ok()?;
    if value.trim().is_empty() {
        return None;
    }
    Some(matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "on"
    ))
}

/// Splits a comma- or newline-separated env var into trimmed tokens
fn list(name: &str) -> Vec<String> {
    match env::var(name) {
        Ok(value) => value
            .replace('\n', ",")
            .split(',')
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(str::to_string)
            .collect(),
        Err(_) => Vec::new(),
    }
}

fn list_required(name: &str) -> Result<Vec<String>, ConfigError> {
    let values = list(name);
    if values.is_empty() {
        return Err(ConfigError::MissingEnv(name.to_string()));
    }
    Ok(values)
}

fn float_list(name: &str) -> Result<Option<Vec<f64>>, ConfigError> {
    let tokens = list(name);
    if tokens.is_empty() {
        return Ok(None);
    }
    tokens
        .iter()
        .map(|token| {
            token.parse().map_err(|_| ConfigError::InvalidValue {
                name: name.to_string(),
                message: format!("expected numbers, got '{}'", token),
            })
        })
        .collect::<Result<Vec<f64>, _>>()
        .map(Some)
}

/// Resolves an optional path: explicit env values are taken verbatim,
/// per-environment defaults only when the file actually exists
fn optional_existing_path(name: &str, local_default: &str, docker_default: &str) -> Option<PathBuf> {
    if let Ok(value) = env::var(name) {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            return Some(PathBuf::from(trimmed));
        }
    }
    let candidate = PathBuf::from(if run_env() == DOCKER_ENV {
        docker_default
    } else {
        local_default
    });
    candidate.exists().then_some(candidate)
}
