//! Run configuration: the [`CrawlerConfig`] struct, its presets, and a
//! validating builder.

pub mod builder;
pub mod types;

pub use builder::CrawlerConfigBuilder;
pub use types::CrawlerConfig;
