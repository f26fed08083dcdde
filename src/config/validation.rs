//! Configuration validation
//!
//! Cross-field checks that serde cannot express: range bounds, mode/selector
//! coherence, and probability ranges. Invalid config aborts startup.

use crate::config::types::{
    BehaviorConfig, DelayRange, EngineKind, GlobalConfig, PaginationMode, SiteConfig,
};
use crate::ConfigError;
use url::Url;

/// Validates the environment-assembled global configuration
pub fn validate_global(config: &GlobalConfig) -> Result<(), ConfigError> {
    if config.network.user_agents.is_empty() {
        return Err(ConfigError::Validation(
            "at least one User-Agent is required".to_string(),
        ));
    }

    if config.network.request_timeout_sec <= 0.0 {
        return Err(ConfigError::Validation(
            "request_timeout_sec must be positive".to_string(),
        ));
    }

    if config.network.retry.backoff_sec.is_empty() {
        return Err(ConfigError::Validation(
            "retry backoff schedule cannot be empty".to_string(),
        ));
    }

    if !config.network.proxy_allow_direct && config.network.proxy_pool.is_empty() {
        return Err(ConfigError::Validation(
            "proxy pool is empty and direct egress is not allowed".to_string(),
        ));
    }

    validate_delay(&config.runtime.page_delay, "page_delay")?;
    validate_delay(&config.runtime.product_delay, "product_delay")?;
    validate_behavior(&config.runtime.behavior)?;

    Ok(())
}

/// Validates a single site configuration
pub fn validate_site(site: &SiteConfig) -> Result<(), ConfigError> {
    if site.site.name.is_empty() || site.site.domain.is_empty() {
        return Err(ConfigError::Validation(
            "site name and domain are required".to_string(),
        ));
    }

    if site.category_urls.is_empty() {
        return Err(ConfigError::Validation(format!(
            "site '{}' needs at least one category_url",
            site.name()
        )));
    }

    for category_url in &site.category_urls {
        Url::parse(category_url)
            .map_err(|err| ConfigError::InvalidUrl(format!("{}: {}", category_url, err)))?;
    }

    if let Some(base) = site.base_url() {
        Url::parse(base).map_err(|err| ConfigError::InvalidUrl(format!("{}: {}", base, err)))?;
    }

    if site.selectors.product_link_selector.is_empty() {
        return Err(ConfigError::Validation(format!(
            "site '{}' needs a product_link_selector",
            site.name()
        )));
    }

    match site.pagination.mode {
        PaginationMode::NextButton => {
            if site.pagination.next_button_selector.is_none() {
                return Err(ConfigError::Validation(format!(
                    "site '{}' uses next_button pagination without next_button_selector",
                    site.name()
                )));
            }
        }
        PaginationMode::InfiniteScroll => {
            if site.engine() != EngineKind::Browser {
                return Err(ConfigError::Validation(format!(
                    "site '{}' uses infinite_scroll, which requires engine: browser",
                    site.name()
                )));
            }
        }
        PaginationMode::NumberedPages => {}
    }

    if let (Some(start), Some(end)) = (site.pagination.start_page, site.pagination.end_page) {
        if end < start {
            return Err(ConfigError::Validation(format!(
                "site '{}': end_page {} is before start_page {}",
                site.name(),
                end,
                start
            )));
        }
    }

    if let (Some(min), Some(max)) = (
        site.pagination.scroll_min_percent,
        site.pagination.scroll_max_percent,
    ) {
        if max < min {
            return Err(ConfigError::Validation(format!(
                "site '{}': scroll_max_percent must be >= scroll_min_percent",
                site.name()
            )));
        }
    }

    Ok(())
}

fn validate_delay(delay: &DelayRange, name: &str) -> Result<(), ConfigError> {
    if delay.min_sec < 0.0 || delay.max_sec < delay.min_sec {
        return Err(ConfigError::Validation(format!(
            "{}: max_sec must be >= min_sec >= 0",
            name
        )));
    }
    Ok(())
}

fn validate_behavior(behavior: &BehaviorConfig) -> Result<(), ConfigError> {
    let probabilities = [
        ("scroll.probability", behavior.scroll.probability),
        ("scroll.skip_probability", behavior.scroll.skip_probability),
        ("mouse.hover_probability", behavior.mouse.hover_probability),
        ("navigation.back_probability", behavior.navigation.back_probability),
        (
            "navigation.extra_products_probability",
            behavior.navigation.extra_products_probability,
        ),
        (
            "navigation.visit_root_probability",
            behavior.navigation.visit_root_probability,
        ),
    ];
    for (name, value) in probabilities {
        if !(0.0..=1.0).contains(&value) {
            return Err(ConfigError::Validation(format!(
                "behavior {} must be within [0, 1], got {}",
                name, value
            )));
        }
    }

    if behavior.scroll.max_depth_percent < behavior.scroll.min_depth_percent
        || behavior.scroll.max_steps < behavior.scroll.min_steps
        || behavior.mouse.move_count_max < behavior.mouse.move_count_min
    {
        return Err(ConfigError::Validation(
            "behavior min/max bounds are inverted".to_string(),
        ));
    }

    validate_delay(&behavior.action_delay, "behavior.action_delay")?;
    validate_delay(&behavior.scroll.step_delay, "behavior.scroll.step_delay")?;

    Ok(())
}
