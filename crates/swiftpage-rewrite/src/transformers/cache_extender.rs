//! Cache extension: the same bytes under a content-addressed URL that can
//! be cached for a year.

use crate::transformer::{TransformInput, TransformOutput, TransformResult, Transformer, TransformerKind};
use swiftpage_core::{ContentKind, ContentType, RewriteOptions};

/// Serves an input unchanged under a hashed name.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheExtender;

impl Transformer for CacheExtender {
    fn id(&self) -> &'static str {
        "ce"
    }

    fn kind(&self) -> TransformerKind {
        TransformerKind::OnTheFly
    }

    fn accepts(&self, content_type: &ContentType) -> bool {
        matches!(
            content_type.kind(),
            ContentKind::Css | ContentKind::JavaScript | ContentKind::Image
        )
    }

    fn run(&self, inputs: &[TransformInput], _options: &RewriteOptions) -> TransformResult {
        let [input] = inputs else {
            return TransformResult::Error(format!("expected one input, got {}", inputs.len()));
        };
        TransformResult::Ok(TransformOutput {
            body: input.body.clone(),
            content_type: input.content_type.clone(),
        })
    }
}
