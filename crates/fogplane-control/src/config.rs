//! Runtime configuration handed to the orchestration services.

use std::ops::RangeInclusive;

/// Default range public ports are allocated from.
pub const DEFAULT_PUBLIC_PORT_RANGE: RangeInclusive<i32> = 6000..=7000;

/// Registry used when a microservice names neither a registry nor a catalog item.
pub const DEFAULT_REGISTRY_ID: i64 = 1;

/// Control plane configuration.
#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub public_port_range: RangeInclusive<i32>,
    pub default_registry_id: i64,
}

impl ControlConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the range public ports are allocated from.
    pub fn with_public_port_range(mut self, start: i32, end: i32) -> Self {
        self.public_port_range = start..=end;
        self
    }

    pub fn with_default_registry(mut self, id: i64) -> Self {
        self.default_registry_id = id;
        self
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            public_port_range: DEFAULT_PUBLIC_PORT_RANGE,
            default_registry_id: DEFAULT_REGISTRY_ID,
        }
    }
}
