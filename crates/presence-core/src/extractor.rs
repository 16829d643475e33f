//! Face-descriptor extraction capability.
//!
//! The model has its own lifecycle: a [`ModelLoader`] is invoked once and
//! yields a [`DescriptorExtractor`] that is then queried for every image.

use crate::types::{Descriptor, Frame};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("model load failed: {0}")]
    LoadFailed(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
}

/// A loaded model that turns an image into a face descriptor.
#[async_trait]
pub trait DescriptorExtractor: Send + Sync {
    /// Extract the descriptor of the most prominent face.
    ///
    /// Returns `Ok(None)` when no face is found in the image.
    async fn extract(&self, frame: &Frame) -> Result<Option<Descriptor>, ExtractError>;
}

/// Loads the extraction model.
#[async_trait]
pub trait ModelLoader: Send + Sync {
    async fn load(&self) -> Result<Arc<dyn DescriptorExtractor>, ExtractError>;
}
