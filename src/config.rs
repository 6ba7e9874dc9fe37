use anyhow::{Context, Result};
use opencv::calib3d;
use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::detector_params::DetectorParamsConfig;

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub board: BoardConfig,
    #[serde(default)]
    pub calibration: CalibrationConfig,
    #[serde(default)]
    pub detector: DetectorParamsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CameraConfig {
    /// カメラデバイス番号
    #[serde(default = "default_camera_index")]
    pub index: i32,
    /// 要求解像度（未指定ならデバイス既定値）
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    /// カメラパラメータファイル（camera_matrix / distortion_coefficients）
    #[serde(default = "default_camera_params_path")]
    pub params_path: String,
}

fn default_camera_index() -> i32 { 1 }
fn default_camera_params_path() -> String { "cameraParams.yml".to_string() }

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            index: default_camera_index(),
            width: None,
            height: None,
            params_path: default_camera_params_path(),
        }
    }
}

/// 姿勢推定に使うボードの種類
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PoseTarget {
    #[default]
    Grid,
    Charuco,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BoardConfig {
    /// ArUco辞書タイプ (e.g. "DICT_4X4_50")
    #[serde(default = "default_dictionary")]
    pub dictionary: String,
    /// グリッドボードの横マーカー数
    #[serde(default = "default_markers_x")]
    pub markers_x: i32,
    /// グリッドボードの縦マーカー数
    #[serde(default = "default_markers_y")]
    pub markers_y: i32,
    /// マーカー辺長（メートル）
    #[serde(default = "default_marker_length")]
    pub marker_length: f32,
    /// マーカー間隔（メートル）
    #[serde(default = "default_marker_separation")]
    pub marker_separation: f32,
    #[serde(default)]
    pub pose_target: PoseTarget,
    #[serde(default)]
    pub charuco: CharucoConfig,
}

fn default_dictionary() -> String { "DICT_4X4_50".to_string() }
fn default_markers_x() -> i32 { 10 }
fn default_markers_y() -> i32 { 5 }
fn default_marker_length() -> f32 { 0.02 }
fn default_marker_separation() -> f32 { 0.005 }

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            dictionary: default_dictionary(),
            markers_x: default_markers_x(),
            markers_y: default_markers_y(),
            marker_length: default_marker_length(),
            marker_separation: default_marker_separation(),
            pose_target: PoseTarget::default(),
            charuco: CharucoConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CharucoConfig {
    #[serde(default = "default_charuco_squares")]
    pub squares_x: i32,
    #[serde(default = "default_charuco_squares")]
    pub squares_y: i32,
    /// マス辺長（メートル）
    #[serde(default = "default_square_length")]
    pub square_length: f32,
    /// マーカー辺長（メートル）
    #[serde(default = "default_charuco_marker_length")]
    pub marker_length: f32,
}

fn default_charuco_squares() -> i32 { 5 }
fn default_square_length() -> f32 { 0.02 }
fn default_charuco_marker_length() -> f32 { 0.015 }

impl Default for CharucoConfig {
    fn default() -> Self {
        Self {
            squares_x: default_charuco_squares(),
            squares_y: default_charuco_squares(),
            square_length: default_square_length(),
            marker_length: default_charuco_marker_length(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CalibrationConfig {
    /// 保存先パス（拡張子で形式を判定: .yml/.yaml/.xml/.json）
    #[serde(default = "default_calibration_output")]
    pub output_path: String,
    /// FIX_ASPECT_RATIO 時の fx/fy 初期値
    #[serde(default = "default_aspect_ratio")]
    pub aspect_ratio: f32,
    /// キャリブレーションに必要な最小キャプチャ数
    #[serde(default = "default_min_captures")]
    pub min_captures: usize,
    #[serde(default)]
    pub use_intrinsic_guess: bool,
    #[serde(default)]
    pub fix_aspect_ratio: bool,
    #[serde(default)]
    pub fix_principal_point: bool,
    #[serde(default)]
    pub zero_tangent_dist: bool,
}

fn default_calibration_output() -> String { "cameraParams.yml".to_string() }
fn default_aspect_ratio() -> f32 { 1.777777 }
fn default_min_captures() -> usize { 1 }

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            output_path: default_calibration_output(),
            aspect_ratio: default_aspect_ratio(),
            min_captures: default_min_captures(),
            use_intrinsic_guess: false,
            fix_aspect_ratio: false,
            fix_principal_point: false,
            zero_tangent_dist: false,
        }
    }
}

impl CalibrationConfig {
    /// calib3d の CALIB_* ビットマスクを組み立てる
    pub fn flags(&self) -> i32 {
        let mut flags = 0;
        if self.use_intrinsic_guess {
            flags |= calib3d::CALIB_USE_INTRINSIC_GUESS;
        }
        if self.fix_aspect_ratio {
            flags |= calib3d::CALIB_FIX_ASPECT_RATIO;
        }
        if self.fix_principal_point {
            flags |= calib3d::CALIB_FIX_PRINCIPAL_POINT;
        }
        if self.zero_tangent_dist {
            flags |= calib3d::CALIB_ZERO_TANGENT_DIST;
        }
        flags
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_toml(&content)
    }

    /// ファイルが無ければデフォルト設定を使う（パースエラーは失敗扱い）
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            log::warn!("{} not found, using default configuration", path.display());
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse config")?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_file() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.camera.index, 1);
        assert_eq!(config.camera.params_path, "cameraParams.yml");
        assert_eq!(config.board.dictionary, "DICT_4X4_50");
        assert_eq!((config.board.markers_x, config.board.markers_y), (10, 5));
        assert_eq!(config.board.pose_target, PoseTarget::Grid);
        assert_eq!(config.board.charuco.squares_x, 5);
        assert_eq!(config.calibration.min_captures, 1);
        assert_eq!(config.calibration.flags(), 0);
    }

    #[test]
    fn test_partial_sections() {
        let config = Config::from_toml(
            r#"
            [camera]
            index = 0
            width = 1280

            [board]
            markers_x = 4
            pose_target = "charuco"

            [board.charuco]
            square_length = 0.04
            "#,
        )
        .unwrap();
        assert_eq!(config.camera.index, 0);
        assert_eq!(config.camera.width, Some(1280));
        assert_eq!(config.camera.height, None);
        assert_eq!(config.board.markers_x, 4);
        assert_eq!(config.board.markers_y, 5);
        assert_eq!(config.board.pose_target, PoseTarget::Charuco);
        assert!((config.board.charuco.square_length - 0.04).abs() < 1e-6);
        assert!((config.board.charuco.marker_length - 0.015).abs() < 1e-6);
    }

    #[test]
    fn test_calibration_flags_bitmask() {
        let config = Config::from_toml(
            r#"
            [calibration]
            fix_aspect_ratio = true
            zero_tangent_dist = true
            "#,
        )
        .unwrap();
        assert_eq!(
            config.calibration.flags(),
            calib3d::CALIB_FIX_ASPECT_RATIO | calib3d::CALIB_ZERO_TANGENT_DIST
        );
    }

    #[test]
    fn test_unknown_pose_target_is_rejected() {
        let result = Config::from_toml("[board]\npose_target = \"diamond\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_default(dir.path().join("missing.toml")).unwrap();
        assert_eq!(config.board.markers_x, 10);
    }
}
