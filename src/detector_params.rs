//! ArUco検出パラメータ
//!
//! 指定されたフィールドだけを `DetectorParameters` に上書きし、
//! 未指定のフィールドはOpenCVのデフォルト値のまま残す。

use anyhow::{bail, Context, Result};
use opencv::{
    core::{FileNode, FileStorage, FileStorage_Mode},
    objdetect::{DetectorParameters, DetectorParametersTrait},
    prelude::*,
};
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// 検出パラメータ（キー名はOpenCVのフィールド名に合わせる）
#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectorParamsConfig {
    /// 別ファイルから読み込む場合のパス（TOML または OpenCV YAML/XML）
    #[serde(default, rename = "params_path")]
    pub params_path: Option<String>,

    pub adaptive_thresh_win_size_min: Option<i32>,
    pub adaptive_thresh_win_size_max: Option<i32>,
    pub adaptive_thresh_win_size_step: Option<i32>,
    pub adaptive_thresh_constant: Option<f64>,
    pub min_marker_perimeter_rate: Option<f64>,
    pub max_marker_perimeter_rate: Option<f64>,
    pub polygonal_approx_accuracy_rate: Option<f64>,
    pub min_corner_distance_rate: Option<f64>,
    pub min_distance_to_border: Option<i32>,
    pub min_marker_distance_rate: Option<f64>,
    pub corner_refinement_method: Option<i32>,
    pub corner_refinement_win_size: Option<i32>,
    pub corner_refinement_max_iterations: Option<i32>,
    pub corner_refinement_min_accuracy: Option<f64>,
    pub marker_border_bits: Option<i32>,
    pub perspective_remove_pixel_per_cell: Option<i32>,
    pub perspective_remove_ignored_margin_per_cell: Option<f64>,
    pub max_erroneous_bits_in_border_rate: Option<f64>,
    pub min_otsu_std_dev: Option<f64>,
    pub error_correction_rate: Option<f64>,
}

impl DetectorParamsConfig {
    /// 拡張子で形式を判定して読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        match path.extension().and_then(|e| e.to_str()) {
            Some("yml") | Some("yaml") | Some("xml") => Self::load_file_storage(path),
            _ => {
                let content = fs::read_to_string(path).with_context(|| {
                    format!("Failed to read detector parameters {}", path.display())
                })?;
                toml::from_str(&content).context("Failed to parse detector parameters")
            }
        }
    }

    /// cv::FileStorage 形式の検出パラメータファイルを読み込む
    pub fn load_file_storage(path: &Path) -> Result<Self> {
        let name = path.to_string_lossy();
        let fs = FileStorage::new(&name, FileStorage_Mode::READ as i32, "")
            .with_context(|| format!("Failed to open detector parameters {}", name))?;
        if !fs.is_opened()? {
            bail!("Invalid detector parameters file: {}", name);
        }

        let int = |key: &str| -> Result<Option<i32>> {
            let node = fs.get(key)?;
            if is_missing(&node)? { Ok(None) } else { Ok(Some(node.to_i32()?)) }
        };
        let real = |key: &str| -> Result<Option<f64>> {
            let node = fs.get(key)?;
            if is_missing(&node)? { Ok(None) } else { Ok(Some(node.to_f64()?)) }
        };

        Ok(Self {
            params_path: None,
            adaptive_thresh_win_size_min: int("adaptiveThreshWinSizeMin")?,
            adaptive_thresh_win_size_max: int("adaptiveThreshWinSizeMax")?,
            adaptive_thresh_win_size_step: int("adaptiveThreshWinSizeStep")?,
            adaptive_thresh_constant: real("adaptiveThreshConstant")?,
            min_marker_perimeter_rate: real("minMarkerPerimeterRate")?,
            max_marker_perimeter_rate: real("maxMarkerPerimeterRate")?,
            polygonal_approx_accuracy_rate: real("polygonalApproxAccuracyRate")?,
            min_corner_distance_rate: real("minCornerDistanceRate")?,
            min_distance_to_border: int("minDistanceToBorder")?,
            min_marker_distance_rate: real("minMarkerDistanceRate")?,
            corner_refinement_method: int("cornerRefinementMethod")?,
            corner_refinement_win_size: int("cornerRefinementWinSize")?,
            corner_refinement_max_iterations: int("cornerRefinementMaxIterations")?,
            corner_refinement_min_accuracy: real("cornerRefinementMinAccuracy")?,
            marker_border_bits: int("markerBorderBits")?,
            perspective_remove_pixel_per_cell: int("perspectiveRemovePixelPerCell")?,
            perspective_remove_ignored_margin_per_cell: real(
                "perspectiveRemoveIgnoredMarginPerCell",
            )?,
            max_erroneous_bits_in_border_rate: real("maxErroneousBitsInBorderRate")?,
            min_otsu_std_dev: real("minOtsuStdDev")?,
            error_correction_rate: real("errorCorrectionRate")?,
        })
    }

    /// `params_path` があればそのファイルを読み、インライン指定を上に重ねる
    pub fn resolve(&self) -> Result<Self> {
        let Some(path) = &self.params_path else {
            return Ok(self.clone());
        };
        let base = Self::load(path)?;
        log::info!("Detector parameters loaded from {}", path);
        Ok(base.overlay(self))
    }

    /// `other` に値がある項目で上書きした設定を返す
    pub fn overlay(mut self, other: &Self) -> Self {
        macro_rules! take {
            ($($field:ident),* $(,)?) => {
                $(if other.$field.is_some() { self.$field = other.$field.clone(); })*
            };
        }
        take!(
            adaptive_thresh_win_size_min,
            adaptive_thresh_win_size_max,
            adaptive_thresh_win_size_step,
            adaptive_thresh_constant,
            min_marker_perimeter_rate,
            max_marker_perimeter_rate,
            polygonal_approx_accuracy_rate,
            min_corner_distance_rate,
            min_distance_to_border,
            min_marker_distance_rate,
            corner_refinement_method,
            corner_refinement_win_size,
            corner_refinement_max_iterations,
            corner_refinement_min_accuracy,
            marker_border_bits,
            perspective_remove_pixel_per_cell,
            perspective_remove_ignored_margin_per_cell,
            max_erroneous_bits_in_border_rate,
            min_otsu_std_dev,
            error_correction_rate,
        );
        self.params_path = None;
        self
    }

    /// OpenCVのパラメータへ反映する
    pub fn apply(&self, params: &mut DetectorParameters) {
        if let Some(v) = self.adaptive_thresh_win_size_min { params.set_adaptive_thresh_win_size_min(v); }
        if let Some(v) = self.adaptive_thresh_win_size_max { params.set_adaptive_thresh_win_size_max(v); }
        if let Some(v) = self.adaptive_thresh_win_size_step { params.set_adaptive_thresh_win_size_step(v); }
        if let Some(v) = self.adaptive_thresh_constant { params.set_adaptive_thresh_constant(v); }
        if let Some(v) = self.min_marker_perimeter_rate { params.set_min_marker_perimeter_rate(v); }
        if let Some(v) = self.max_marker_perimeter_rate { params.set_max_marker_perimeter_rate(v); }
        if let Some(v) = self.polygonal_approx_accuracy_rate { params.set_polygonal_approx_accuracy_rate(v); }
        if let Some(v) = self.min_corner_distance_rate { params.set_min_corner_distance_rate(v); }
        if let Some(v) = self.min_distance_to_border { params.set_min_distance_to_border(v); }
        if let Some(v) = self.min_marker_distance_rate { params.set_min_marker_distance_rate(v); }
        if let Some(v) = self.corner_refinement_method { params.set_corner_refinement_method(v); }
        if let Some(v) = self.corner_refinement_win_size { params.set_corner_refinement_win_size(v); }
        if let Some(v) = self.corner_refinement_max_iterations { params.set_corner_refinement_max_iterations(v); }
        if let Some(v) = self.corner_refinement_min_accuracy { params.set_corner_refinement_min_accuracy(v); }
        if let Some(v) = self.marker_border_bits { params.set_marker_border_bits(v); }
        if let Some(v) = self.perspective_remove_pixel_per_cell { params.set_perspective_remove_pixel_per_cell(v); }
        if let Some(v) = self.perspective_remove_ignored_margin_per_cell {
            params.set_perspective_remove_ignored_margin_per_cell(v);
        }
        if let Some(v) = self.max_erroneous_bits_in_border_rate { params.set_max_erroneous_bits_in_border_rate(v); }
        if let Some(v) = self.min_otsu_std_dev { params.set_min_otsu_std_dev(v); }
        if let Some(v) = self.error_correction_rate { params.set_error_correction_rate(v); }
    }

    /// デフォルト値にこの設定を重ねた `DetectorParameters` を作成
    pub fn build(&self) -> Result<DetectorParameters> {
        let mut params = DetectorParameters::default()?;
        self.apply(&mut params);
        Ok(params)
    }
}

fn is_missing(node: &FileNode) -> Result<bool> {
    Ok(node.is_none()? || node.empty()?)
}
