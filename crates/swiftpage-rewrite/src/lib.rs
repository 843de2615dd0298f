//! # SwiftPage Rewrite
//!
//! The rewrite pipeline: a streamed HTML document goes in, rewritten HTML
//! comes out, and the resources it references are optimized and served
//! under content-addressed URLs.
//!
//! ## Request flow
//!
//! - [`ProxyInterface`] routes each client request
//! - [`ProxyFetch`] streams an origin response, feeding HTML to a
//!   [`RewriteDriver`]
//! - the driver tokenizes with the [`html`] lexer and runs the
//!   [`filters`], which start rewrites through the [`ServerContext`]
//! - [`ResourceServer`] answers requests for rewritten URLs
//!
//! ## Rewrites
//!
//! A rewrite names a [`Transformer`] and its input URLs. Identical
//! rewrites share one running context through the intern map; results are
//! remembered in the [`MetadataCache`] and outputs stored in the HTTP
//! cache. Transformer work runs on bounded [`WorkerPool`]s.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod background;
pub mod collector;
pub mod context;
pub mod driver;
pub mod error;
pub mod filter;
pub mod filters;
pub mod html;
pub mod in_place;
pub mod loader;
pub mod metadata;
pub mod proxy;
pub mod proxy_fetch;
pub mod resource;
pub mod resource_server;
pub mod server_context;
pub mod transformer;
pub mod transformers;
pub mod worker;

pub use background::BackgroundTasks;
pub use collector::{PropertyCallback, PropertyCallbackCollector};
pub use context::{
    ContextState, InternStats, RewriteHandle, RewriteOutcome, RewriteSpec,
};
pub use driver::{RewriteDriver, DOM_COHORT};
pub use error::{Result, RewriteError};
pub use filter::HtmlFilter;
pub use in_place::InPlaceRewriter;
pub use loader::ResourceLoader;
pub use metadata::{MetadataCache, MetadataCacheStats, MetadataEntry};
pub use proxy::ProxyInterface;
pub use proxy_fetch::{CollectedResponse, CollectingWriter, ProxyFetch, ResponseWriter};
pub use resource::{LoadedResource, Resource};
pub use resource_server::ResourceServer;
pub use server_context::{ServerContext, ServerContextBuilder, ServerStats};
pub use transformer::{
    TransformInput, TransformOutput, TransformResult, Transformer, TransformerKind,
    TransformerRegistry,
};
pub use worker::{WorkerPool, WorkerPoolStats};
