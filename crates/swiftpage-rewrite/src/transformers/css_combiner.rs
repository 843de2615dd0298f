//! Combines several stylesheets into one.

use crate::transformer::{TransformInput, TransformOutput, TransformResult, Transformer, TransformerKind};
use bytes::{BufMut, BytesMut};
use swiftpage_core::{ContentKind, ContentType, RewriteOptions};

/// Concatenates stylesheets in document order.
///
/// Declines when a stylesheet after the first uses `@import` or
/// `@charset`, which are only honored at the start of a stylesheet.
#[derive(Debug, Clone, Copy, Default)]
pub struct CssCombiner;

impl Transformer for CssCombiner {
    fn id(&self) -> &'static str {
        "cc"
    }

    fn kind(&self) -> TransformerKind {
        TransformerKind::Cached
    }

    fn accepts(&self, content_type: &ContentType) -> bool {
        content_type.kind() == ContentKind::Css
    }

    fn max_inputs(&self) -> usize {
        usize::MAX
    }

    fn run(&self, inputs: &[TransformInput], _options: &RewriteOptions) -> TransformResult {
        if inputs.len() < 2 {
            return TransformResult::Unoptimizable;
        }
        let position_sensitive = inputs[1..].iter().any(|input| {
            let body = String::from_utf8_lossy(&input.body);
            body.contains("@import") || body.contains("@charset")
        });
        if position_sensitive {
            return TransformResult::Unoptimizable;
        }

        let total: usize = inputs.iter().map(|i| i.body.len() + 1).sum();
        let mut combined = BytesMut::with_capacity(total);
        for (n, input) in inputs.iter().enumerate() {
            if n > 0 {
                combined.put_u8(b'\n');
            }
            combined.put_slice(&input.body);
        }
        TransformResult::Ok(TransformOutput {
            body: combined.freeze(),
            content_type: ContentType::css(),
        })
    }
}
