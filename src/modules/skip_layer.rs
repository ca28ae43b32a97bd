//! Skip-layer guidance
//!
//! Suppresses a set of transformer blocks on the negative branch while the
//! schedule is inside an activation window, which sharpens structure the
//! way a weaker unconditional prediction does.

use std::fmt;

use crate::error::ConfigError;

/// Parsed set of block indices to skip
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SkipLayers {
    layers: Vec<usize>,
}

impl SkipLayers {
    /// Parse `"disabled"`, `"9"` or `"9, 10"`
    ///
    /// Empty and `"disabled"` specifiers yield an empty set. Duplicates are
    /// collapsed and indices kept in ascending order.
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        let trimmed = spec.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("disabled") {
            return Ok(Self::default());
        }

        let mut layers = Vec::new();
        for token in trimmed.split(',') {
            let token = token.trim();
            if token.is_empty() {
                return Err(ConfigError::MalformedSkipLayers {
                    spec: spec.to_string(),
                    reason: "empty entry".into(),
                });
            }
            let index = token.parse::<usize>().map_err(|_| ConfigError::MalformedSkipLayers {
                spec: spec.to_string(),
                reason: format!("{:?} is not a layer index", token),
            })?;
            layers.push(index);
        }
        layers.sort_unstable();
        layers.dedup();
        Ok(Self { layers })
    }

    pub fn from_indices(indices: impl IntoIterator<Item = usize>) -> Self {
        let mut layers: Vec<usize> = indices.into_iter().collect();
        layers.sort_unstable();
        layers.dedup();
        Self { layers }
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn indices(&self) -> &[usize] {
        &self.layers
    }
}

impl fmt::Display for SkipLayers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.layers.is_empty() {
            return f.write_str("disabled");
        }
        let joined: Vec<String> = self.layers.iter().map(|l| l.to_string()).collect();
        f.write_str(&joined.join(","))
    }
}

/// Skip-layer patch parameters
#[derive(Debug, Clone, PartialEq)]
pub struct SkipLayerGuidance {
    pub layers: SkipLayers,
    pub start_percent: f32,
    pub end_percent: f32,
}

impl SkipLayerGuidance {
    pub fn new(layers: SkipLayers, start_percent: f32, end_percent: f32) -> Self {
        Self {
            layers,
            start_percent,
            end_percent,
        }
    }

    /// Whether the window `[start, end]` contains `progress`
    pub fn is_active(&self, progress: f32) -> bool {
        !self.layers.is_empty() && progress >= self.start_percent && progress <= self.end_percent
    }

    /// Layers to suppress at `progress`; empty outside the window
    pub fn layers_at(&self, progress: f32) -> Vec<usize> {
        if self.is_active(progress) {
            self.layers.indices().to_vec()
        } else {
            Vec::new()
        }
    }
}
