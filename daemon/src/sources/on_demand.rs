use super::{ProduceFuture, ProduceRequest, Source};
use crate::content::Content;
use crate::error::PipelineError;
use crate::loader::Loader;
use common::{MediaKind, Size};
use std::sync::Arc;

/// Host that renders a fresh image per request at the requested size.
///
/// The URL template may contain `{width}`, `{height}` and `{seed}`; the seed
/// is random per production so caching hosts still return new images.
pub struct OnDemandSource {
    template: String,
    loader: Arc<dyn Loader>,
}

impl OnDemandSource {
    pub fn new(template: String, loader: Arc<dyn Loader>) -> Self {
        Self { template, loader }
    }
}

pub fn expand_template(template: &str, size: Size, seed: u32) -> String {
    template
        .replace("{width}", &size.width.to_string())
        .replace("{height}", &size.height.to_string())
        .replace("{seed}", &seed.to_string())
}

impl Source for OnDemandSource {
    fn kind(&self) -> &'static str {
        "on-demand"
    }

    fn produce(&self, request: ProduceRequest) -> ProduceFuture {
        let url = expand_template(&self.template, request.size, rand::random());

        Box::pin(async move {
            if !request.filter.accepts(&url) {
                return Err(PipelineError::NoMatch(request.filter.to_string()));
            }
            Ok(Content::new(request.producer, MediaKind::Image, url))
        })
    }

    fn loader(&self) -> Arc<dyn Loader> {
        Arc::clone(&self.loader)
    }
}
