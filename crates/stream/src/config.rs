use glam::Mat4;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Errors from loading or validating streaming options.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid option `{option}`: {reason}")]
    Invalid {
        option: &'static str,
        reason: String,
    },
}

/// Options unique to a single tileset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TilesetOptions {
    pub name: String,
    /// Hidden tilesets are not traversed; their tiles age out of the cache.
    pub show: bool,
    /// Allowed on-screen error in pixels before a tile is refined.
    pub maximum_screen_space_error: f64,
    /// Tiles whose error exceeds `maximum_screen_space_error` times this are
    /// too coarse to be worth loading; traversal skips past them.
    pub skip_screen_space_error_multiplier: f64,
    /// Also load (but never render) the siblings of rendered tiles.
    pub load_siblings: bool,
    /// Deepest level to refine to; 0 disables the limit.
    pub max_depth: u32,
    /// Hand newly loaded tiles to the host for collider creation.
    pub create_colliders: bool,
    pub frustum_culling: bool,
    /// Root transform applied to the whole hierarchy.
    pub transform: Mat4,
    /// Failed tiles become loadable again after this many frames.
    /// `None` leaves retries to the caller.
    pub retry_failed_after_frames: Option<u64>,
}

impl Default for TilesetOptions {
    fn default() -> Self {
        Self {
            name: String::new(),
            show: true,
            maximum_screen_space_error: 16.0,
            skip_screen_space_error_multiplier: 16.0,
            load_siblings: true,
            max_depth: 0,
            create_colliders: true,
            frustum_culling: true,
            transform: Mat4::IDENTITY,
            retry_failed_after_frames: None,
        }
    }
}

impl TilesetOptions {
    /// Screen-space error above which a tile's own load is skipped.
    pub fn skip_threshold(&self) -> f64 {
        self.maximum_screen_space_error * self.skip_screen_space_error_multiplier
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.maximum_screen_space_error.is_finite() && self.maximum_screen_space_error > 0.0) {
            return Err(invalid(
                "maximum_screen_space_error",
                format!("must be positive, got {}", self.maximum_screen_space_error),
            ));
        }
        let multiplier = self.skip_screen_space_error_multiplier;
        if multiplier.is_nan() || multiplier < 1.0 {
            return Err(invalid(
                "skip_screen_space_error_multiplier",
                format!("must be >= 1, got {multiplier}"),
            ));
        }
        if !self.transform.is_finite() {
            return Err(invalid("transform", "must be finite".into()));
        }
        Ok(())
    }
}

/// Options shared by every tileset in a scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneOptions {
    /// How many newly loaded tiles are handed over for collider creation per frame.
    pub maximum_tiles_to_process_per_frame: usize,
    /// Cache size the eviction pass shrinks towards.
    pub lru_cache_target_size: usize,
    /// Hard cache limit; inserts beyond it are rejected.
    pub lru_cache_max_size: usize,
    /// Per-frame eviction cap as a fraction of `lru_cache_max_size`.
    pub lru_max_frame_unload_ratio: f32,
    pub max_concurrent_requests: usize,
    /// Pending requests not renewed for this many frames are cancelled.
    pub cancel_unused_requests_after_frames: u64,
}

impl Default for SceneOptions {
    fn default() -> Self {
        Self {
            maximum_tiles_to_process_per_frame: 1,
            lru_cache_target_size: 600,
            lru_cache_max_size: 700,
            lru_max_frame_unload_ratio: 0.2,
            max_concurrent_requests: 6,
            cancel_unused_requests_after_frames: 3,
        }
    }
}

impl SceneOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lru_cache_max_size == 0 {
            return Err(invalid("lru_cache_max_size", "must be at least 1".into()));
        }
        if self.lru_cache_target_size > self.lru_cache_max_size {
            return Err(invalid(
                "lru_cache_target_size",
                format!(
                    "{} exceeds lru_cache_max_size {}",
                    self.lru_cache_target_size, self.lru_cache_max_size
                ),
            ));
        }
        if !(0.0..=1.0).contains(&self.lru_max_frame_unload_ratio) {
            return Err(invalid(
                "lru_max_frame_unload_ratio",
                format!("must be within [0, 1], got {}", self.lru_max_frame_unload_ratio),
            ));
        }
        if self.max_concurrent_requests == 0 {
            return Err(invalid("max_concurrent_requests", "must be at least 1".into()));
        }
        Ok(())
    }
}

/// Scene options plus per-tileset options, as read from a JSON file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub scene: SceneOptions,
    pub tilesets: Vec<TilesetOptions>,
}

impl StreamConfig {
    /// Load and validate a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let file = std::fs::File::open(path)?;
        let config: Self = serde_json::from_reader(file)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scene.validate()?;
        self.tilesets.iter().try_for_each(TilesetOptions::validate)
    }
}

fn invalid(option: &'static str, reason: String) -> ConfigError {
    ConfigError::Invalid { option, reason }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_reference_values() {
        let t = TilesetOptions::default();
        assert_eq!(t.maximum_screen_space_error, 16.0);
        assert_eq!(t.skip_screen_space_error_multiplier, 16.0);
        assert_eq!(t.skip_threshold(), 256.0);
        assert!(t.load_siblings);
        assert_eq!(t.max_depth, 0);

        let s = SceneOptions::default();
        assert_eq!(s.maximum_tiles_to_process_per_frame, 1);
        assert_eq!(s.lru_cache_target_size, 600);
        assert_eq!(s.lru_cache_max_size, 700);
        assert_eq!(s.lru_max_frame_unload_ratio, 0.2);
        assert_eq!(s.max_concurrent_requests, 6);
        assert!(StreamConfig::default().validate().is_ok());
    }

    #[test]
    fn target_above_max_is_invalid() {
        let s = SceneOptions {
            lru_cache_target_size: 800,
            ..SceneOptions::default()
        };
        assert!(matches!(
            s.validate(),
            Err(ConfigError::Invalid {
                option: "lru_cache_target_size",
                ..
            })
        ));
    }

    #[test]
    fn unload_ratio_out_of_range_is_invalid() {
        let s = SceneOptions {
            lru_max_frame_unload_ratio: 1.5,
            ..SceneOptions::default()
        };
        assert!(s.validate().is_err());
    }

    #[test]
    fn nan_threshold_is_invalid() {
        let t = TilesetOptions {
            maximum_screen_space_error: f64::NAN,
            ..TilesetOptions::default()
        };
        assert!(t.validate().is_err());
        let t = TilesetOptions {
            skip_screen_space_error_multiplier: 0.5,
            ..TilesetOptions::default()
        };
        assert!(t.validate().is_err());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        write!(
            tmp,
            r#"{{"scene": {{"max_concurrent_requests": 2}},
                "tilesets": [{{"name": "terrain", "max_depth": 4}}]}}"#
        )
        .unwrap();
        let config = StreamConfig::load(tmp.path()).unwrap();
        assert_eq!(config.scene.max_concurrent_requests, 2);
        assert_eq!(config.scene.lru_cache_max_size, 700);
        assert_eq!(config.tilesets[0].name, "terrain");
        assert_eq!(config.tilesets[0].max_depth, 4);
        assert_eq!(config.tilesets[0].maximum_screen_space_error, 16.0);
    }

    #[test]
    fn invalid_file_is_rejected_on_load() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        write!(tmp, r#"{{"scene": {{"max_concurrent_requests": 0}}}}"#).unwrap();
        assert!(matches!(
            StreamConfig::load(tmp.path()),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn save_and_load() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let config = StreamConfig {
            scene: SceneOptions::default(),
            tilesets: vec![TilesetOptions {
                name: "city".into(),
                retry_failed_after_frames: Some(30),
                ..TilesetOptions::default()
            }],
        };
        config.save(tmp.path()).unwrap();
        assert_eq!(StreamConfig::load(tmp.path()).unwrap(), config);
    }
}
