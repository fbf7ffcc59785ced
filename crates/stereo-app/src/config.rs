// SPDX-License-Identifier: CEPL-1.0
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;
use stereo_core::{report, ErrorKind};
use stereo_render::FrameLoopConfig;
use stereo_render_vk::ReferenceSpace;
use tracing::warn;

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SpaceCfg {
    #[default]
    Local,
    Stage,
    View,
}

impl From<SpaceCfg> for ReferenceSpace {
    fn from(s: SpaceCfg) -> Self {
        match s {
            SpaceCfg::Local => ReferenceSpace::Local,
            SpaceCfg::Stage => ReferenceSpace::Stage,
            SpaceCfg::View => ReferenceSpace::View,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct XrCfg {
    #[serde(default = "default_app_name")]
    pub application_name: String,
    #[serde(default = "default_near")]
    pub near_clip: f32,
    #[serde(default = "default_far")]
    pub far_clip: f32,
    #[serde(default = "default_frames_in_flight")]
    pub frames_in_flight: usize,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    #[serde(default)]
    pub reference_space: SpaceCfg,
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct RenderCfg {
    #[serde(default = "default_clear")]
    pub clear_color: [f32; 4],
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct AppCfg {
    #[serde(default)]
    pub xr: XrCfg,
    #[serde(default)]
    pub render: RenderCfg,
}

impl Default for XrCfg {
    fn default() -> Self {
        XrCfg {
            application_name: default_app_name(),
            near_clip: default_near(),
            far_clip: default_far(),
            frames_in_flight: default_frames_in_flight(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            reference_space: SpaceCfg::default(),
        }
    }
}

impl Default for RenderCfg {
    fn default() -> Self {
        RenderCfg {
            clear_color: default_clear(),
        }
    }
}

fn default_app_name() -> String {
    "stereo".to_owned()
}
fn default_near() -> f32 {
    0.01
}
fn default_far() -> f32 {
    100.0
}
fn default_frames_in_flight() -> usize {
    2
}
fn default_acquire_timeout_ms() -> u64 {
    1000
}
fn default_clear() -> [f32; 4] {
    [0.01, 0.01, 0.01, 1.0]
}

impl AppCfg {
    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn validate(&self) -> Result<()> {
        let xr = &self.xr;
        if !(xr.near_clip > 0.0 && xr.far_clip > xr.near_clip) {
            return Err(report(
                ErrorKind::Config,
                Some(&format!(
                    "clip planes need 0 < near < far (near={}, far={})",
                    xr.near_clip, xr.far_clip
                )),
            ));
        }
        if xr.frames_in_flight == 0 {
            return Err(report(ErrorKind::Config, Some("frames_in_flight must be >= 1")));
        }
        Ok(())
    }

    pub fn frame_loop(&self) -> FrameLoopConfig {
        FrameLoopConfig {
            near_clip: self.xr.near_clip,
            far_clip: self.xr.far_clip,
            acquire_timeout: Duration::from_millis(self.xr.acquire_timeout_ms),
        }
    }
}

/// Missing or unparsable files fall back to defaults.
pub fn load_cfg(path: &Path) -> AppCfg {
    match fs::read_to_string(path) {
        Ok(s) => AppCfg::parse(&s).unwrap_or_else(|e| {
            warn!("config: {} unparsable, using defaults: {e}", path.display());
            AppCfg::default()
        }),
        Err(_) => AppCfg::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stereo_core::kind_of;

    #[test]
    fn empty_file_gives_defaults() {
        let cfg = AppCfg::parse("").unwrap();
        assert_eq!(cfg.xr.application_name, "stereo");
        assert_eq!(cfg.xr.frames_in_flight, 2);
        assert_eq!(cfg.xr.reference_space, SpaceCfg::Local);
        assert_eq!(cfg.render.clear_color, [0.01, 0.01, 0.01, 1.0]);
        let fl = cfg.frame_loop();
        assert_eq!(fl.near_clip, 0.01);
        assert_eq!(fl.far_clip, 100.0);
        assert_eq!(fl.acquire_timeout, Duration::from_secs(1));
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let cfg = AppCfg::parse(
            r#"
            [xr]
            far_clip = 500.0
            reference_space = "stage"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.xr.far_clip, 500.0);
        assert_eq!(cfg.xr.near_clip, 0.01);
        assert_eq!(ReferenceSpace::from(cfg.xr.reference_space), ReferenceSpace::Stage);
    }

    #[test]
    fn unknown_space_is_a_parse_error() {
        assert!(AppCfg::parse("[xr]\nreference_space = \"orbit\"").is_err());
    }

    #[test]
    fn inverted_clip_planes_rejected() {
        let mut cfg = AppCfg::default();
        cfg.xr.near_clip = 10.0;
        cfg.xr.far_clip = 1.0;
        let err = cfg.validate().unwrap_err();
        assert_eq!(kind_of(&err), Some(ErrorKind::Config));
    }

    #[test]
    fn missing_file_falls_back() {
        let cfg = load_cfg(Path::new("/nonexistent/stereo.toml"));
        assert!(cfg.validate().is_ok());
    }
}
