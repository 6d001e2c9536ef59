//! # CopiumMeter client
//!
//! Offline-first affect classifier: labels short text as copium, sarcastic,
//! sincere or neutral, and keeps working when the network, the hosted model
//! or the on-device model is unavailable.
//!
//! ## Features
//!
//! - 💀 **Fallback chain**: on-device model, then remote API, then a
//!   pattern heuristic that never fails
//! - 📦 **Offline cache**: versioned cache stores with cache-first routing
//!   and a dedicated model-weights store
//! - 📥 **Background model load**: cancellable download progress stream
//! - 🔄 **Async/Await**: built on Tokio
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use copium_client::{CopiumClient, CopiumConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = CopiumClient::new(CopiumConfig::default()).await?;
//!     client.refresh_connectivity().await;
//!
//!     let result = client.analyze("It's fine. I didn't want it anyway.").await?;
//!     println!("{} {} ({:.1}%)", result.label.emoji(), result.label, result.confidence);
//!
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod fetch;
pub mod normalize;
pub mod orchestrator;
pub mod progress;
pub mod types;

pub use backend::{Backend, ModelState, RawOutput, Reachability};
pub use client::{ClientStatus, CopiumClient, CopiumClientBuilder, StatusLevel};
pub use config::CopiumConfig;
pub use error::{BackendError, CacheError, ClassifyError, CopiumError, Result};
pub use orchestrator::FallbackChain;
pub use progress::{DownloadHandle, DownloadProgress, ProgressStream};
pub use types::{BackendTier, ClassificationResult, Distribution, Label};
