//! Builtin HTML filters.
//!
//! The chain runs in this order: element counting, stylesheet combining,
//! then per-tag resource rewriting.

mod combine_css;
mod count_elements;
mod resource_tag;

pub use combine_css::CombineCssFilter;
pub use count_elements::{CountElementsFilter, NUM_ELEMENTS_PROPERTY};
pub use resource_tag::ResourceTagFilter;

use crate::filter::HtmlFilter;
use swiftpage_core::options::{FILTER_COMBINE_CSS, FILTER_COUNT_ELEMENTS};
use swiftpage_core::RewriteOptions;

/// Builds the filter chain enabled by `options`.
pub fn build_chain(options: &RewriteOptions) -> Vec<Box<dyn HtmlFilter>> {
    let mut chain: Vec<Box<dyn HtmlFilter>> = Vec::new();
    if options.is_filter_enabled(FILTER_COUNT_ELEMENTS) {
        chain.push(Box::new(CountElementsFilter::new()));
    }
    if options.is_filter_enabled(FILTER_COMBINE_CSS) {
        chain.push(Box::new(CombineCssFilter::new()));
    }
    if ResourceTagFilter::is_enabled(options) {
        chain.push(Box::new(ResourceTagFilter::new()));
    }
    chain
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_follows_enabled_filters() {
        let names = |options: &RewriteOptions| -> Vec<&'static str> {
            build_chain(options).iter().map(|f| f.name()).collect()
        };
        let mut options = RewriteOptions {
            enabled_filters: Vec::new(),
            ..RewriteOptions::default()
        };
        assert!(names(&options).is_empty());

        options.enabled_filters = vec![
            "extend_cache".to_string(),
            "combine_css".to_string(),
            "count_elements".to_string(),
        ];
        assert_eq!(
            names(&options),
            vec!["count_elements", "combine_css", "resource_tag"]
        );
    }
}
