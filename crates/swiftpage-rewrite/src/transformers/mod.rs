//! Builtin transformers.

mod cache_extender;
mod css_combiner;
mod css_minifier;
mod js_minifier;

pub use cache_extender::CacheExtender;
pub use css_combiner::CssCombiner;
pub use css_minifier::{minify_css, CssMinifier};
pub use js_minifier::{minify_js, JsMinifier};
