//! Human-behavior layer for the browser engine
//!
//! Before the HTML of a page is captured, the controller performs a random
//! mix of scrolls, mouse movement, hovers, back/forward navigation, a visit
//! to the site root, and short detours into extra product cards — each with
//! configured probabilities and bounded counts. All decisions are made up
//! front in a `BehaviorPlan` so the bounds are testable without a browser;
//! execution happens through page JS evaluation and extra tabs.

use crate::config::BehaviorConfig;
use crate::net::FetchError;
use crate::runtime::jitter_sleep;
use chromiumoxide::{Browser, Page};
use rand::seq::SliceRandom;
use rand::Rng;
use std::time::{Duration, Instant};
use url::Url;

/// Page context handed down from the site crawler
#[derive(Debug, Clone, Default)]
pub struct BehaviorContext {
    /// Selector of product cards, used for extra-tab detours
    pub product_link_selector: Option<String>,
    pub category_url: String,
    pub base_url: Option<String>,
    /// Site root for the occasional root visit
    pub root_url: String,
    /// Hover targets for this page kind (category vs product page)
    pub hover_targets: Vec<String>,
}

/// Ordered record of the actions performed on one page
#[derive(Debug, Clone, Default)]
pub struct BehaviorTrace {
    pub actions: Vec<String>,
    pub duration: Duration,
}

impl BehaviorTrace {
    /// Compact one-line form for regular log levels
    pub fn summary(&self) -> String {
        format!(
            "{} actions in {:.2}s",
            self.actions.len(),
            self.duration.as_secs_f64()
        )
    }
}

/// Everything the controller decided to do on a page, decided before any
/// browser call so the bounds can be unit-tested
#[derive(Debug, Clone, Default)]
pub(crate) struct BehaviorPlan {
    pub scroll_fractions: Vec<f64>,
    pub back_to_top: bool,
    pub mouse_moves: Vec<(u32, u32)>,
    pub hover: bool,
    pub back_forward: bool,
    pub visit_root: bool,
    pub extra_products: u32,
}

pub struct HumanBehaviorController {
    config: BehaviorConfig,
    extra_page_preview: Duration,
}

impl HumanBehaviorController {
    pub fn new(config: BehaviorConfig, extra_page_preview_sec: f64) -> Self {
        Self {
            config,
            extra_page_preview: Duration::from_secs_f64(extra_page_preview_sec.max(0.0)),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn debug(&self) -> bool {
        self.config.debug
    }

    /// Rolls every probability and bound into a concrete plan.
    ///
    /// `depth_clamp` narrows the configured scroll depth for pages that
    /// declare their own `scroll_min_percent`/`scroll_max_percent`.
    pub(crate) fn plan(&self, depth_clamp: Option<(u32, u32)>) -> BehaviorPlan {
        let mut rng = rand::thread_rng();
        let mut plan = BehaviorPlan::default();
        let scroll = &self.config.scroll;

        if rng.gen::<f64>() <= scroll.probability && rng.gen::<f64>() >= scroll.skip_probability {
            let (mut min_depth, mut max_depth) =
                (scroll.min_depth_percent, scroll.max_depth_percent);
            if let Some((clamp_min, clamp_max)) = depth_clamp {
                min_depth = min_depth.max(clamp_min);
                max_depth = max_depth.min(clamp_max).max(min_depth);
            }
            let steps = rng.gen_range(scroll.min_steps..=scroll.max_steps.max(scroll.min_steps));
            let depth = rng.gen_range(min_depth..=max_depth) as f64;
            let mut current = 0.0_f64;
            for _ in 0..steps {
                current += depth / steps as f64 + rng.gen_range(-5.0..5.0);
                plan.scroll_fractions
                    .push((current / 100.0).clamp(0.0, 1.0));
            }
            plan.back_to_top = rng.gen::<f64>() < 0.15;
        }

        let mouse = &self.config.mouse;
        let moves = rng.gen_range(mouse.move_count_min..=mouse.move_count_max.max(mouse.move_count_min));
        for _ in 0..moves {
            let x = rng.gen_range(192..=1728);
            let y = rng.gen_range(108..=972);
            plan.mouse_moves.push((x, y));
        }
        plan.hover = rng.gen::<f64>() < mouse.hover_probability;

        // Navigation detours share a bounded chain budget.
        let nav = &self.config.navigation;
        let mut remaining = nav.max_additional_chain;
        if remaining >= 2 && rng.gen::<f64>() < nav.back_probability {
            plan.back_forward = true;
            remaining -= 2;
        }
        if remaining >= 1 && rng.gen::<f64>() < nav.visit_root_probability {
            plan.visit_root = true;
            remaining -= 1;
        }
        if remaining >= 1 && rng.gen::<f64>() < nav.extra_products_probability {
            plan.extra_products = nav.extra_products_limit.min(remaining);
        }

        plan
    }

    /// Executes a fresh plan against a live page.
    ///
    /// Individual action failures are logged and skipped; the behavior layer
    /// never fails a fetch on its own.
    pub async fn apply(
        &self,
        browser: &Browser,
        page: &Page,
        context: &BehaviorContext,
        depth_clamp: Option<(u32, u32)>,
    ) -> Result<BehaviorTrace, FetchError> {
        let started = Instant::now();
        let mut trace = BehaviorTrace::default();
        if !self.config.enabled {
            return Ok(trace);
        }

        let plan = self.plan(depth_clamp);

        for fraction in &plan.scroll_fractions {
            let js = format!(
                "window.scrollTo(0, document.body.scrollHeight * {:.4});",
                fraction
            );
            if page.evaluate(js).await.is_err() {
                break;
            }
            trace.actions.push(format!("scroll:{}", (fraction * 100.0) as u32));
            jitter_sleep(&self.config.scroll.step_delay).await;
        }
        if plan.back_to_top && !plan.scroll_fractions.is_empty() {
            if page.evaluate("window.scrollTo(0, 0);").await.is_ok() {
                trace.actions.push("scroll:back-to-top".to_string());
            }
        }

        for (x, y) in &plan.mouse_moves {
            let js = format!(
                "document.dispatchEvent(new MouseEvent('mousemove', {{clientX: {}, clientY: {}, bubbles: true}}));",
                x, y
            );
            if page.evaluate(js).await.is_err() {
                break;
            }
            trace.actions.push(format!("mouse_move:{}x{}", x, y));
            jitter_sleep(&self.config.action_delay).await;
        }

        if plan.hover {
            if let Some(selector) = self.pick_hover_target(context) {
                let js = format!(
                    r#"(() => {{
                        const nodes = document.querySelectorAll({sel});
                        if (!nodes.length) return false;
                        const node = nodes[Math.floor(Math.random() * nodes.length)];
                        node.scrollIntoView({{block: 'center', behavior: 'smooth'}});
                        node.dispatchEvent(new MouseEvent('mouseover', {{bubbles: true}}));
                        return true;
                    }})()"#,
                    sel = js_string(&selector)
                );
                let hovered = match page.evaluate(js).await {
                    Ok(result) => result.into_value::<bool>().unwrap_or(false),
                    Err(_) => false,
                };
                if hovered {
                    trace.actions.push(format!("hover:{}", selector));
                    jitter_sleep(&self.config.action_delay).await;
                }
            }
        }

        if plan.back_forward {
            if page.evaluate("history.back();").await.is_ok() {
                trace.actions.push("back".to_string());
                jitter_sleep(&self.config.action_delay).await;
                if page.evaluate("history.forward();").await.is_ok() {
                    trace.actions.push("forward".to_string());
                    jitter_sleep(&self.config.action_delay).await;
                }
            }
        }

        if plan.visit_root && !context.root_url.is_empty() {
            if self.open_in_new_tab(browser, &context.root_url).await {
                trace.actions.push(format!("visit_root:{}", context.root_url));
            }
            jitter_sleep(&self.config.action_delay).await;
        }

        if plan.extra_products > 0 {
            for link in self
                .collect_extra_product_links(page, context, plan.extra_products as usize)
                .await
            {
                if self.open_in_new_tab(browser, &link).await {
                    trace.actions.push(format!("extra_product:{}", link));
                }
                jitter_sleep(&self.config.action_delay).await;
            }
        }

        trace.duration = started.elapsed();
        Ok(trace)
    }

    fn pick_hover_target(&self, context: &BehaviorContext) -> Option<String> {
        context
            .hover_targets
            .choose(&mut rand::thread_rng())
            .cloned()
    }

    /// Picks up to `limit` random product hrefs from the page, absolute
    async fn collect_extra_product_links(
        &self,
        page: &Page,
        context: &BehaviorContext,
        limit: usize,
    ) -> Vec<String> {
        let Some(selector) = &context.product_link_selector else {
            return Vec::new();
        };
        let js = format!(
            "Array.from(document.querySelectorAll({sel})).map(a => a.getAttribute('href')).filter(Boolean)",
            sel = js_string(selector)
        );
        let hrefs: Vec<String> = match page.evaluate(js).await {
            Ok(result) => result.into_value().unwrap_or_default(),
            Err(err) => {
                tracing::debug!(error = %err, "Extra-product link collection failed");
                return Vec::new();
            }
        };
        let base = context
            .base_url
            .clone()
            .unwrap_or_else(|| context.category_url.clone());
        let mut absolute: Vec<String> = hrefs
            .iter()
            .filter_map(|href| {
                Url::parse(&base)
                    .and_then(|b| b.join(href))
                    .map(|u| u.to_string())
                    .ok()
            })
            .collect();
        absolute.shuffle(&mut rand::thread_rng());
        absolute.truncate(limit);
        absolute
    }

    /// Opens a URL in a short-lived extra tab, previewing when configured
    async fn open_in_new_tab(&self, browser: &Browser, url: &str) -> bool {
        let page = match browser.new_page(url).await {
            Ok(page) => page,
            Err(err) => {
                tracing::debug!(url, error = %err, "Extra tab failed to open");
                return false;
            }
        };
        let _ = page.wait_for_navigation().await;
        if !self.extra_page_preview.is_zero() {
            tokio::time::sleep(self.extra_page_preview).await;
        }
        if let Err(err) = page.close().await {
            tracing::debug!(url, error = %err, "Extra tab close failed");
        }
        true
    }
}

/// Embeds a selector into generated JS as a quoted string literal
fn js_string(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_string())
}
