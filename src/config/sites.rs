//! Per-site configuration loading
//!
//! Each site lives in its own YAML or JSON file inside the sites directory.
//! Files are loaded in name order so runs are deterministic.

use crate::config::types::SiteConfig;
use crate::config::validation::validate_site;
use crate::ConfigError;
use std::path::Path;

/// Loads and validates every site config in a directory.
///
/// Only `.yml`, `.yaml`, and `.json` files are considered (JSON parses as a
/// YAML subset). A file that fails to parse or validate aborts loading.
///
/// # Arguments
///
/// * `dir` - The sites directory
///
/// # Returns
///
/// * `Ok(Vec<SiteConfig>)` - All site configs, sorted by file name
/// * `Err(ConfigError)` - The directory is unreadable or a config is invalid
pub fn load_site_configs(dir: &Path) -> Result<Vec<SiteConfig>, ConfigError> {
    let mut paths: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            matches!(
                path.extension().and_then(|ext| ext.to_str()),
                Some("yml") | Some("yaml") | Some("json")
            )
        })
        .collect();
    paths.sort();

    let mut sites = Vec::with_capacity(paths.len());
    for path in paths {
        let content = std::fs::read_to_string(&path)?;
        let site: SiteConfig = serde_yaml::from_str(&content).map_err(|err| {
            ConfigError::Validation(format!("{}: {}", path.display(), err))
        })?;
        validate_site(&site).map_err(|err| {
            ConfigError::Validation(format!("{}: {}", path.display(), err))
        })?;
        tracing::debug!("Loaded site config {} from {}", site.name(), path.display());
        sites.push(site);
    }

    if sites.is_empty() {
        return Err(ConfigError::Validation(format!(
            "no site configs found in {}",
            dir.display()
        )));
    }

    Ok(sites)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{EngineKind, PaginationMode};
    use std::io::Write;

    const SITE_YAML: &str = r#"
site:
  name: shop
  domain: shop.ru
  base_url: "https://shop.ru"
  engine: http
selectors:
  product_link_selector: ".catalog a.product"
  price_with_discount_selector:
    - ".price-new"
    - ".price"
pagination:
  mode: numbered_pages
  param_name: page
  max_pages: 20
category_urls:
  - "https://shop.ru/items/tea"
"#;

    #[test]
    fn test_loads_yaml_site_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("shop.yml")).unwrap();
        file.write_all(SITE_YAML.as_bytes()).unwrap();

        let sites = load_site_configs(dir.path()).unwrap();
        assert_eq!(sites.len(), 1);
        let site = &sites[0];
        assert_eq!(site.name(), "shop");
        assert_eq!(site.engine(), EngineKind::Http);
        assert_eq!(site.pagination.mode, PaginationMode::NumberedPages);
        // Single-or-list selectors normalize to lists at load time
        assert_eq!(
            site.selectors.price_with_discount_selector.0,
            vec![".price-new", ".price"]
        );
    }

    #[test]
    fn test_empty_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_site_configs(dir.path()).is_err());
    }

    #[test]
    fn test_ignores_unrelated_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a config").unwrap();
        std::fs::write(dir.path().join("shop.yaml"), SITE_YAML).unwrap();
        let sites = load_site_configs(dir.path()).unwrap();
        assert_eq!(sites.len(), 1);
    }
}
