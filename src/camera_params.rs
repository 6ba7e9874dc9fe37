//! カメラパラメータ（内部パラメータ行列・歪み係数）の保存と読み込み
//!
//! `.yml` / `.yaml` / `.xml` は cv::FileStorage 形式でOpenCVのツールとそのまま互換。
//! `.json` は serde で読み書きする。

use anyhow::{bail, Context, Result};
use opencv::{
    calib3d,
    core::{FileNode, FileStorage, FileStorage_Mode, Mat, Scalar, CV_64F},
    prelude::*,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// OpenCVが受け付ける歪み係数の個数
const VALID_DISTORTION_LENGTHS: [usize; 5] = [4, 5, 8, 12, 14];

/// キャリブレーション結果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calibration_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_width: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_height: Option<i32>,
    /// FIX_ASPECT_RATIO 指定時のみ保存
    #[serde(default, rename = "aspectRatio", skip_serializing_if = "Option::is_none")]
    pub aspect_ratio: Option<f32>,
    #[serde(default)]
    pub flags: i32,
    /// 内部パラメータ行列 K (row-major 3x3)
    pub camera_matrix: [f64; 9],
    pub distortion_coefficients: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_reprojection_error: Option<f64>,
}

/// JSON保存時のみ付与する人間向けのフラグ表記
#[derive(Serialize)]
struct JsonRecord<'a> {
    #[serde(flatten)]
    params: &'a CameraParameters,
    #[serde(skip_serializing_if = "Option::is_none")]
    flags_description: Option<String>,
}

impl CameraParameters {
    /// 内部パラメータと歪み係数のみから作成
    pub fn new(camera_matrix: [f64; 9], distortion_coefficients: Vec<f64>) -> Self {
        Self {
            calibration_time: None,
            image_width: None,
            image_height: None,
            aspect_ratio: None,
            flags: 0,
            camera_matrix,
            distortion_coefficients,
            avg_reprojection_error: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let n = self.distortion_coefficients.len();
        if !VALID_DISTORTION_LENGTHS.contains(&n) {
            bail!(
                "Distortion coefficients must have one of {:?} elements, got {}",
                VALID_DISTORTION_LENGTHS,
                n
            );
        }
        if self.camera_matrix[8] == 0.0 {
            bail!("Camera matrix is degenerate (K[2][2] == 0)");
        }
        Ok(())
    }

    /// 3x3 CV_64F の内部パラメータ行列
    pub fn camera_matrix_mat(&self) -> Result<Mat> {
        array_to_mat3x3(&self.camera_matrix)
    }

    /// Nx1 CV_64F の歪み係数
    pub fn distortion_mat(&self) -> Result<Mat> {
        vec_to_mat(&self.distortion_coefficients)
    }

    /// カメラパラメータファイルを読み込む（camera_matrix / distortion_coefficients は必須）
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let params = if is_json(path) {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Invalid camera file: {}", path.display()))?;
            serde_json::from_str::<Self>(&content)
                .with_context(|| format!("Invalid camera file: {}", path.display()))?
        } else {
            Self::load_file_storage(path)?
        };
        params.validate()?;
        Ok(params)
    }

    fn load_file_storage(path: &Path) -> Result<Self> {
        let name = path.to_string_lossy();
        let fs = FileStorage::new(&name, FileStorage_Mode::READ as i32, "")
            .with_context(|| format!("Invalid camera file: {}", name))?;
        if !fs.is_opened()? {
            bail!("Invalid camera file: {}", name);
        }

        let camera_node = fs.get("camera_matrix")?;
        let dist_node = fs.get("distortion_coefficients")?;
        if is_missing(&camera_node)? || is_missing(&dist_node)? {
            bail!("Invalid camera file: {} (camera_matrix / distortion_coefficients missing)", name);
        }
        let camera_matrix = mat3x3_to_array(&camera_node.mat()?)?;
        let distortion_coefficients = mat_to_vec(&dist_node.mat()?)?;

        let mut params = Self::new(camera_matrix, distortion_coefficients);

        let node = fs.get("calibration_time")?;
        if !is_missing(&node)? {
            params.calibration_time = Some(node.string()?);
        }
        let node = fs.get("image_width")?;
        if !is_missing(&node)? {
            params.image_width = Some(node.to_i32()?);
        }
        let node = fs.get("image_height")?;
        if !is_missing(&node)? {
            params.image_height = Some(node.to_i32()?);
        }
        let node = fs.get("aspectRatio")?;
        if !is_missing(&node)? {
            params.aspect_ratio = Some(node.real()? as f32);
        }
        let node = fs.get("flags")?;
        if !is_missing(&node)? {
            params.flags = node.to_i32()?;
        }
        let node = fs.get("avg_reprojection_error")?;
        if !is_missing(&node)? {
            params.avg_reprojection_error = Some(node.real()?);
        }
        Ok(params)
    }

    /// キャリブレーション結果を保存
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if is_json(path) {
            let record = JsonRecord {
                params: self,
                flags_description: describe_flags(self.flags),
            };
            let json = serde_json::to_string_pretty(&record)?;
            fs::write(path, json)
                .with_context(|| format!("Cannot save output file: {}", path.display()))?;
            return Ok(());
        }
        self.save_file_storage(path)
    }

    fn save_file_storage(&self, path: &Path) -> Result<()> {
        let name = path.to_string_lossy();
        let mut fs = FileStorage::new(&name, FileStorage_Mode::WRITE as i32, "")
            .with_context(|| format!("Cannot save output file: {}", name))?;
        if !fs.is_opened()? {
            bail!("Cannot save output file: {}", name);
        }

        if let Some(time) = &self.calibration_time {
            fs.write_str("calibration_time", time)?;
        }
        if let Some(w) = self.image_width {
            fs.write_i32("image_width", w)?;
        }
        if let Some(h) = self.image_height {
            fs.write_i32("image_height", h)?;
        }
        if self.flags & calib3d::CALIB_FIX_ASPECT_RATIO != 0 {
            if let Some(ratio) = self.aspect_ratio {
                fs.write_f64("aspectRatio", ratio as f64)?;
            }
        }
        if let Some(desc) = describe_flags(self.flags) {
            fs.write_comment(&desc, false)?;
        }
        fs.write_i32("flags", self.flags)?;
        fs.write_mat("camera_matrix", &self.camera_matrix_mat()?)?;
        fs.write_mat("distortion_coefficients", &self.distortion_mat()?)?;
        if let Some(err) = self.avg_reprojection_error {
            fs.write_f64("avg_reprojection_error", err)?;
        }
        fs.release()?;
        Ok(())
    }
}

/// フラグの人間向け表記（例: "flags: +fix_aspectRatio+zero_tangent_dist"）
///
/// フラグが 0 の場合は None
pub fn describe_flags(flags: i32) -> Option<String> {
    if flags == 0 {
        return None;
    }
    let names = [
        (calib3d::CALIB_USE_INTRINSIC_GUESS, "+use_intrinsic_guess"),
        (calib3d::CALIB_FIX_ASPECT_RATIO, "+fix_aspectRatio"),
        (calib3d::CALIB_FIX_PRINCIPAL_POINT, "+fix_principal_point"),
        (calib3d::CALIB_ZERO_TANGENT_DIST, "+zero_tangent_dist"),
    ];
    let mut desc = String::from("flags: ");
    for (bit, name) in names {
        if flags & bit != 0 {
            desc.push_str(name);
        }
    }
    Some(desc)
}

fn is_json(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("json")
}

fn is_missing(node: &FileNode) -> Result<bool> {
    Ok(node.is_none()? || node.empty()?)
}

// --- Mat ↔ 配列変換ヘルパー ---

fn to_f64_mat(mat: &Mat) -> Result<Mat> {
    let mut out = Mat::default();
    mat.convert_to(&mut out, CV_64F, 1.0, 0.0)?;
    Ok(out)
}

/// 3x3 Mat → [f64; 9] row-major（f32の行列も受け付ける）
pub fn mat3x3_to_array(mat: &Mat) -> Result<[f64; 9]> {
    if mat.rows() != 3 || mat.cols() != 3 {
        bail!("Expected 3x3 matrix, got {}x{}", mat.rows(), mat.cols());
    }
    let mat = to_f64_mat(mat)?;
    let mut arr = [0.0f64; 9];
    for r in 0..3 {
        for c in 0..3 {
            arr[r * 3 + c] = *mat.at_2d::<f64>(r as i32, c as i32)?;
        }
    }
    Ok(arr)
}

/// Vec<f64> from Mat (Nx1 or 1xN)
pub fn mat_to_vec(mat: &Mat) -> Result<Vec<f64>> {
    if mat.empty() {
        return Ok(Vec::new());
    }
    let mat = to_f64_mat(mat)?;
    let n = mat.rows().max(mat.cols()) as usize;
    let is_row = mat.rows() == 1;
    let mut v = Vec::with_capacity(n);
    for i in 0..n {
        let val = if is_row {
            *mat.at_2d::<f64>(0, i as i32)?
        } else {
            *mat.at_2d::<f64>(i as i32, 0)?
        };
        v.push(val);
    }
    Ok(v)
}

pub fn array_to_mat3x3(arr: &[f64; 9]) -> Result<Mat> {
    let mut mat = Mat::new_rows_cols_with_default(3, 3, CV_64F, Scalar::all(0.0))?;
    for r in 0..3 {
        for c in 0..3 {
            *mat.at_2d_mut::<f64>(r as i32, c as i32)? = arr[r * 3 + c];
        }
    }
    Ok(mat)
}

pub fn vec_to_mat(values: &[f64]) -> Result<Mat> {
    let mut mat = Mat::new_rows_cols_with_default(values.len() as i32, 1, CV_64F, Scalar::all(0.0))?;
    for (i, v) in values.iter().enumerate() {
        *mat.at_2d_mut::<f64>(i as i32, 0)? = *v;
    }
    Ok(mat)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample() -> CameraParameters {
        CameraParameters {
            calibration_time: Some("Thu Oct 15 21:04:11 2026".to_string()),
            image_width: Some(1280),
            image_height: Some(720),
            aspect_ratio: Some(1.777777),
            flags: calib3d::CALIB_FIX_ASPECT_RATIO | calib3d::CALIB_ZERO_TANGENT_DIST,
            camera_matrix: [910.5, 0.0, 640.2, 0.0, 912.1, 360.7, 0.0, 0.0, 1.0],
            distortion_coefficients: vec![0.11, -0.23, 0.001, -0.002, 0.05],
            avg_reprojection_error: Some(0.42),
        }
    }

    #[test]
    fn test_describe_flags() {
        assert_eq!(describe_flags(0), None);
        assert_eq!(
            describe_flags(calib3d::CALIB_USE_INTRINSIC_GUESS).as_deref(),
            Some("flags: +use_intrinsic_guess")
        );
        let all = calib3d::CALIB_USE_INTRINSIC_GUESS
            | calib3d::CALIB_FIX_ASPECT_RATIO
            | calib3d::CALIB_FIX_PRINCIPAL_POINT
            | calib3d::CALIB_ZERO_TANGENT_DIST;
        assert_eq!(
            describe_flags(all).as_deref(),
            Some("flags: +use_intrinsic_guess+fix_aspectRatio+fix_principal_point+zero_tangent_dist")
        );
    }

    #[test]
    fn test_validate_distortion_length() {
        let mut params = sample();
        assert!(params.validate().is_ok());
        params.distortion_coefficients = vec![0.1, 0.2, 0.3];
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_yaml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cameraParams.yml");
        let params = sample();
        params.save(&path).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("aspectRatio"));
        assert!(text.contains("flags: +fix_aspectRatio+zero_tangent_dist"));

        let loaded = CameraParameters::load(&path).unwrap();
        assert_eq!(loaded.image_width, Some(1280));
        assert_eq!(loaded.flags, params.flags);
        assert_eq!(loaded.calibration_time, params.calibration_time);
        for (a, b) in loaded.camera_matrix.iter().zip(params.camera_matrix.iter()) {
            assert_relative_eq!(*a, *b, epsilon = 1e-9);
        }
        assert_eq!(loaded.distortion_coefficients.len(), 5);
        assert_relative_eq!(loaded.avg_reprojection_error.unwrap(), 0.42, epsilon = 1e-9);
    }

    #[test]
    fn test_aspect_ratio_omitted_without_flag() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cameraParams.yml");
        let mut params = sample();
        params.flags = 0;
        params.save(&path).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(!text.contains("aspectRatio"));
        assert!(CameraParameters::load(&path).unwrap().aspect_ratio.is_none());
    }

    #[test]
    fn test_json_includes_flags_description() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("camera.json");
        let params = sample();
        params.save(&path).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(
            value["flags_description"],
            "flags: +fix_aspectRatio+zero_tangent_dist"
        );
        assert_eq!(CameraParameters::load(&path).unwrap(), params);
    }

    #[test]
    fn test_save_into_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let params = sample();

        for name in ["out.yml", "out.json"] {
            let path = dir.path().join("missing").join(name);
            let err = params.save(&path).unwrap_err();
            assert!(format!("{:#}", err).contains("Cannot save output file"), "{}", name);
            assert!(!path.exists());
        }
    }

    #[test]
    fn test_load_missing_file() {
        let err = CameraParameters::load("/nonexistent/cameraParams.yml").unwrap_err();
        let message = format!("{:#}", err);
        assert!(message.contains("Invalid camera file: /nonexistent/cameraParams.yml"));
        assert_eq!(message.matches("Invalid camera file").count(), 1);
    }

    #[test]
    fn test_load_float_matrix_written_by_opencv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("float.yml");
        fs::write(
            &path,
            "%YAML:1.0\n---\ncamera_matrix: !!opencv-matrix\n   rows: 3\n   cols: 3\n   dt: f\n   data: [ 500., 0., 320., 0., 500., 240., 0., 0., 1. ]\ndistortion_coefficients: !!opencv-matrix\n   rows: 1\n   cols: 5\n   dt: d\n   data: [ 0., 0., 0., 0., 0. ]\n",
        )
        .unwrap();

        let loaded = CameraParameters::load(&path).unwrap();
        assert_relative_eq!(loaded.camera_matrix[0], 500.0);
        assert_relative_eq!(loaded.camera_matrix[5], 240.0);
        assert_eq!(loaded.distortion_coefficients, vec![0.0; 5]);
        assert_eq!(loaded.calibration_time, None);
    }
}
