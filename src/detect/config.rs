use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::ControlError;

pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.3;
pub const DEFAULT_IMAGE_SIZE: u32 = 1024;
const MAX_IMAGE_SIZE: u32 = 4096;

/// Box colors used when a class has no explicit color, indexed by class id.
pub const DEFAULT_PALETTE: [[u8; 3]; 8] = [
    [255, 56, 56],
    [255, 157, 151],
    [255, 112, 31],
    [255, 178, 29],
    [207, 210, 49],
    [72, 249, 10],
    [26, 147, 52],
    [0, 212, 187],
];

/// Detection parameters. Immutable once published; replace it whole.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DetectionConfig {
    pub confidence_threshold: f32,
    /// Labels to keep. `None` or an empty set keeps every class.
    pub classes: Option<BTreeSet<String>>,
    /// Per-label box colors (RGB).
    pub colors: BTreeMap<String, [u8; 3]>,
    /// Square model input size hint.
    pub image_size: u32,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            classes: None,
            colors: BTreeMap::new(),
            image_size: DEFAULT_IMAGE_SIZE,
        }
    }
}

impl DetectionConfig {
    pub fn validate(&self) -> Result<(), ControlError> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(ControlError::InvalidConfig(format!(
                "confidence_threshold {} must be within 0.0..=1.0",
                self.confidence_threshold
            )));
        }
        if self.image_size == 0 || self.image_size > MAX_IMAGE_SIZE {
            return Err(ControlError::InvalidConfig(format!(
                "image_size {} must be within 1..={}",
                self.image_size, MAX_IMAGE_SIZE
            )));
        }
        if let Some(classes) = &self.classes {
            if classes.iter().any(|c| c.trim().is_empty()) {
                return Err(ControlError::InvalidConfig(
                    "classes must not contain empty labels".into(),
                ));
            }
        }
        Ok(())
    }

    /// True when `label` passes the allow-list.
    pub fn accepts(&self, label: &str) -> bool {
        match &self.classes {
            Some(classes) if !classes.is_empty() => classes.contains(label),
            _ => true,
        }
    }

    pub fn color_for(&self, label: &str, class_id: u32) -> [u8; 3] {
        self.colors
            .get(label)
            .copied()
            .unwrap_or(DEFAULT_PALETTE[class_id as usize % DEFAULT_PALETTE.len()])
    }

    /// Copy with `update`'s fields applied on top.
    pub fn merged(&self, update: DetectionConfigUpdate) -> DetectionConfig {
        let mut next = self.clone();
        if let Some(threshold) = update.confidence_threshold {
            next.confidence_threshold = threshold;
        }
        if let Some(classes) = update.classes {
            next.classes = (!classes.is_empty()).then_some(classes);
        }
        if let Some(colors) = update.colors {
            next.colors.extend(colors);
        }
        if let Some(image_size) = update.image_size {
            next.image_size = image_size;
        }
        next
    }
}

/// Partial change to a `DetectionConfig`. Absent fields keep their value; an
/// empty `classes` list clears the allow-list.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DetectionConfigUpdate {
    pub confidence_threshold: Option<f32>,
    pub classes: Option<BTreeSet<String>>,
    pub colors: Option<BTreeMap<String, [u8; 3]>>,
    pub image_size: Option<u32>,
}

/// The live detection config, swapped whole so readers never see a mix of
/// old and new fields.
#[derive(Debug)]
pub struct SharedDetectionConfig {
    current: RwLock<Arc<DetectionConfig>>,
}

impl SharedDetectionConfig {
    pub fn new(config: DetectionConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(config)),
        }
    }

    pub fn load(&self) -> Arc<DetectionConfig> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Validate and publish `config`.
    pub fn store(&self, config: DetectionConfig) -> Result<Arc<DetectionConfig>, ControlError> {
        config.validate()?;
        let config = Arc::new(config);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = config.clone();
        Ok(config)
    }

    /// Apply a partial update atomically with respect to other writers.
    pub fn update(
        &self,
        update: DetectionConfigUpdate,
    ) -> Result<Arc<DetectionConfig>, ControlError> {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let next = current.merged(update);
        next.validate()?;
        *current = Arc::new(next);
        Ok(current.clone())
    }
}

impl Default for SharedDetectionConfig {
    fn default() -> Self {
        Self::new(DetectionConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_allow_list_accepts_everything() {
        let mut config = DetectionConfig::default();
        assert!(config.accepts("car"));
        config.classes = Some(BTreeSet::new());
        assert!(config.accepts("car"));
        config.classes = Some(["person".to_string()].into());
        assert!(config.accepts("person"));
        assert!(!config.accepts("car"));
    }

    #[test]
    fn explicit_colors_override_palette() {
        let mut config = DetectionConfig::default();
        assert_eq!(config.color_for("person", 0), DEFAULT_PALETTE[0]);
        assert_eq!(config.color_for("x", 9), DEFAULT_PALETTE[1]);
        config.colors.insert("person".into(), [1, 2, 3]);
        assert_eq!(config.color_for("person", 0), [1, 2, 3]);
    }

    #[test]
    fn store_rejects_invalid_threshold_and_keeps_previous() {
        let shared = SharedDetectionConfig::default();
        let bad = DetectionConfig {
            confidence_threshold: 1.5,
            ..DetectionConfig::default()
        };
        assert!(matches!(shared.store(bad), Err(ControlError::InvalidConfig(_))));
        assert_eq!(shared.load().confidence_threshold, DEFAULT_CONFIDENCE_THRESHOLD);
    }

    #[test]
    fn partial_update_merges_fields() {
        let shared = SharedDetectionConfig::default();
        let update: DetectionConfigUpdate =
            serde_json::from_str(r#"{"confidence_threshold": 0.6, "classes": ["person"]}"#)
                .unwrap();
        let next = shared.update(update).unwrap();
        assert_eq!(next.confidence_threshold, 0.6);
        assert!(next.accepts("person"));
        assert!(!next.accepts("car"));
        assert_eq!(next.image_size, DEFAULT_IMAGE_SIZE);

        let cleared: DetectionConfigUpdate = serde_json::from_str(r#"{"classes": []}"#).unwrap();
        assert!(shared.update(cleared).unwrap().accepts("car"));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(serde_json::from_str::<DetectionConfigUpdate>(r#"{"conf": 0.5}"#).is_err());
    }
}
