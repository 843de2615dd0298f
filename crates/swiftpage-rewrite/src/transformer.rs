//! Transformers and their registry.
//!
//! A transformer turns one or more input resources into one output. It is
//! pure: the same inputs and options always give the same result, so its
//! output can be addressed by content hash and remembered.
//!
//! Transformers come in two kinds:
//!
//! - **On the fly** transformers are cheap. Their outputs are not kept in
//!   the metadata cache and are recomputed whenever the rewritten URL is
//!   requested and the output is not cached.
//! - **Cached** transformers are expensive. Their results are remembered
//!   in the metadata cache and recomputing an output means refetching the
//!   inputs.
//!
//! The registry is built once at startup and never changes afterwards.

use crate::error::{Result, RewriteError};
use crate::transformers::{CacheExtender, CssCombiner, CssMinifier, JsMinifier};
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use swiftpage_core::namer::is_valid_id;
use swiftpage_core::{ContentType, RewriteOptions};

/// How a transformer's results are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformerKind {
    /// Recomputed on demand.
    OnTheFly,
    /// Remembered in the metadata cache.
    Cached,
}

/// One input handed to a transformer.
#[derive(Debug, Clone)]
pub struct TransformInput {
    /// Absolute URL of the input.
    pub url: String,
    /// Content type of the input.
    pub content_type: ContentType,
    /// Input bytes.
    pub body: Bytes,
}

/// What a transformer produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformOutput {
    /// Output bytes.
    pub body: Bytes,
    /// Output content type; its extension names the output.
    pub content_type: ContentType,
}

/// Result of running a transformer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformResult {
    /// An optimized output.
    Ok(TransformOutput),
    /// Nothing to gain; the original reference should stay.
    Unoptimizable,
    /// The inputs could not be processed.
    Error(String),
}

/// A named resource optimization.
pub trait Transformer: Send + Sync {
    /// Two or three ASCII alphanumerics, embedded in rewritten URLs.
    fn id(&self) -> &'static str;

    /// Whether results are recomputed on demand or remembered.
    fn kind(&self) -> TransformerKind;

    /// Whether an input of `content_type` can be transformed.
    fn accepts(&self, content_type: &ContentType) -> bool;

    /// Most inputs a single run takes.
    fn max_inputs(&self) -> usize {
        1
    }

    /// Content type of the output for inputs of `input_type`.
    fn output_type(&self, input_type: &ContentType) -> ContentType {
        input_type.clone()
    }

    /// Transforms `inputs`.
    fn run(&self, inputs: &[TransformInput], options: &RewriteOptions) -> TransformResult;
}

impl<T: Transformer + ?Sized> Transformer for Arc<T> {
    fn id(&self) -> &'static str {
        (**self).id()
    }

    fn kind(&self) -> TransformerKind {
        (**self).kind()
    }

    fn accepts(&self, content_type: &ContentType) -> bool {
        (**self).accepts(content_type)
    }

    fn max_inputs(&self) -> usize {
        (**self).max_inputs()
    }

    fn output_type(&self, input_type: &ContentType) -> ContentType {
        (**self).output_type(input_type)
    }

    fn run(&self, inputs: &[TransformInput], options: &RewriteOptions) -> TransformResult {
        (**self).run(inputs, options)
    }
}

/// Transformers by id.
#[derive(Clone, Default)]
pub struct TransformerRegistry {
    by_id: HashMap<&'static str, Arc<dyn Transformer>>,
}

impl fmt::Debug for TransformerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformerRegistry")
            .field("ids", &self.ids())
            .finish()
    }
}

impl TransformerRegistry {
    /// Starts building a registry.
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// A registry holding the builtin transformers.
    pub fn with_builtins() -> Self {
        Self::builtin_builder().build()
    }

    /// A builder preloaded with the builtin transformers.
    pub fn builtin_builder() -> RegistryBuilder {
        let mut builder = RegistryBuilder::default();
        let builtins: [Arc<dyn Transformer>; 4] = [
            Arc::new(CacheExtender),
            Arc::new(CssMinifier),
            Arc::new(JsMinifier),
            Arc::new(CssCombiner),
        ];
        for transformer in builtins {
            builder.by_id.insert(transformer.id(), transformer);
        }
        builder
    }

    /// Looks up a transformer.
    pub fn lookup(&self, id: &str) -> Option<Arc<dyn Transformer>> {
        self.by_id.get(id).cloned()
    }

    /// Whether `id` is registered.
    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<&'static str> {
        let mut ids: Vec<&'static str> = self.by_id.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

/// Collects transformers before the registry is frozen.
#[derive(Default)]
pub struct RegistryBuilder {
    by_id: HashMap<&'static str, Arc<dyn Transformer>>,
}

impl RegistryBuilder {
    /// Adds a transformer. Ids must be valid and unique.
    pub fn register(mut self, transformer: Arc<dyn Transformer>) -> Result<Self> {
        let id = transformer.id();
        if !is_valid_id(id) {
            return Err(RewriteError::InvalidTransformerId(id.to_string()));
        }
        if self.by_id.contains_key(id) {
            return Err(RewriteError::DuplicateTransformer(id.to_string()));
        }
        self.by_id.insert(id, transformer);
        Ok(self)
    }

    /// Freezes the registry.
    pub fn build(self) -> TransformerRegistry {
        TransformerRegistry { by_id: self.by_id }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Upper(&'static str);

    impl Transformer for Upper {
        fn id(&self) -> &'static str {
            self.0
        }

        fn kind(&self) -> TransformerKind {
            TransformerKind::OnTheFly
        }

        fn accepts(&self, _: &ContentType) -> bool {
            true
        }

        fn run(&self, inputs: &[TransformInput], _: &RewriteOptions) -> TransformResult {
            let body = inputs[0].body.to_ascii_uppercase();
            TransformResult::Ok(TransformOutput {
                body: Bytes::from(body),
                content_type: inputs[0].content_type.clone(),
            })
        }
    }

    #[test]
    fn builtins_are_registered() {
        let registry = TransformerRegistry::with_builtins();
        assert_eq!(registry.ids(), vec!["cc", "ce", "cf", "jm"]);
        let cf = registry.lookup("cf").unwrap();
        assert_eq!(cf.kind(), TransformerKind::Cached);
        assert!(cf.accepts(&ContentType::css()));
        assert!(!cf.accepts(&ContentType::javascript()));
        assert_eq!(
            registry.lookup("ce").unwrap().kind(),
            TransformerKind::OnTheFly
        );
        assert!(registry.lookup("zz").is_none());
    }

    #[test]
    fn register_rejects_bad_and_duplicate_ids() {
        let err = TransformerRegistry::builder()
            .register(Arc::new(Upper("toolong")))
            .err()
            .unwrap();
        assert!(matches!(err, RewriteError::InvalidTransformerId(_)));

        let err = TransformerRegistry::builtin_builder()
            .register(Arc::new(Upper("cf")))
            .err()
            .unwrap();
        assert!(matches!(err, RewriteError::DuplicateTransformer(_)));

        let registry = TransformerRegistry::builtin_builder()
            .register(Arc::new(Upper("up")))
            .unwrap()
            .build();
        assert!(registry.contains("up"));
        let input = TransformInput {
            url: "http://test.com/a.txt".to_string(),
            content_type: ContentType::css(),
            body: Bytes::from("abc"),
        };
        assert_eq!(
            registry
                .lookup("up")
                .unwrap()
                .run(&[input], &RewriteOptions::default()),
            TransformResult::Ok(TransformOutput {
                body: Bytes::from("ABC"),
                content_type: ContentType::css(),
            })
        );
    }
}
