//! Configuration loading and validation
//!
//! Global run settings come from environment variables (see `env`), while
//! per-site crawl definitions are YAML/JSON files in a sites directory
//! (see `sites`). Both are immutable after load.

mod env;
mod sites;
mod types;
mod validation;

pub use env::{
    default_sites_dir, image_dir, load_global_config, load_global_config_from_env, resolve_path,
    run_env,
};
pub use sites::load_site_configs;
pub use types::{
    BehaviorConfig, BehaviorMouseConfig, BehaviorNavigationConfig, BehaviorScrollConfig,
    BrowserOptions, DedupeConfig, DelayRange, EngineKind, GlobalConfig, GlobalStopConfig,
    NetworkConfig, PaginationConfig, PaginationMode, RetryPolicy, RuntimeConfig, SelectorConfig,
    SelectorList, SheetConfig, SiteConfig, SiteIdentity, SiteLimits, StateConfig, StopCondition,
    WaitCondition,
};
pub use validation::{validate_global, validate_site};
