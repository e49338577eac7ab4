//! Shard configuration.

use std::time::Duration;

/// Feature switches for stored items.
#[derive(Debug, Clone, Copy)]
pub struct Items {
    /// When disabled, `set_edge_property` fails with `PropertiesDisabled`
    /// and edges carry no property map payload.
    pub properties_on_edges: bool,
}

impl Default for Items {
    fn default() -> Self {
        Self {
            properties_on_edges: true,
        }
    }
}

/// Background garbage-collection settings.
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Whether a background GC thread is spawned.
    pub enabled: bool,
    /// Interval between periodic GC cycles.
    pub interval: Duration,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: Duration::from_secs(60),
        }
    }
}

/// Configuration for a shard.
#[derive(Debug, Clone)]
pub struct Config {
    /// Item feature switches.
    pub items: Items,
    /// Background GC settings.
    pub gc: GcConfig,
    /// Vertex count above which `Shard::should_split` suggests a split.
    pub split_vertex_threshold: u64,
}

impl Config {
    /// Default split suggestion threshold.
    pub const DEFAULT_SPLIT_THRESHOLD: u64 = 100_000;
}

impl Default for Config {
    fn default() -> Self {
        Self {
            items: Items::default(),
            gc: GcConfig::default(),
            split_vertex_threshold: Self::DEFAULT_SPLIT_THRESHOLD,
        }
    }
}
