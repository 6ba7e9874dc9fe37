use anyhow::{bail, Context, Result};
use opencv::{
    calib3d,
    core::{Mat, Point2f, Size, TermCriteria, TermCriteria_Type, Vector, CV_64F},
    objdetect::BoardTraitConst,
    prelude::*,
};

use crate::camera_params::{array_to_mat3x3, mat3x3_to_array, mat_to_vec, CameraParameters};
use crate::config::CalibrationConfig;
use crate::detection::MarkerDetection;

// --- キャプチャの蓄積 ---

/// キャリブレーション用に蓄積したフレームごとの検出結果
#[derive(Debug, Default)]
pub struct CaptureSet {
    frames: Vec<MarkerDetection>,
    image_size: Option<Size>,
}

impl CaptureSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// 1フレーム分の検出結果を追加
    ///
    /// マーカーの無いフレームや画像サイズの異なるフレームは受け付けない
    pub fn push(&mut self, detection: MarkerDetection, image_size: Size) -> Result<()> {
        if detection.is_empty() {
            bail!("No markers in frame");
        }
        if detection.ids.len() != detection.corners.len() {
            bail!(
                "Id count {} does not match corner count {}",
                detection.ids.len(),
                detection.corners.len()
            );
        }
        match self.image_size {
            Some(size) if size != image_size => bail!(
                "Image size changed from {}x{} to {}x{}",
                size.width,
                size.height,
                image_size.width,
                image_size.height
            ),
            _ => self.image_size = Some(image_size),
        }
        self.frames.push(detection);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn image_size(&self) -> Option<Size> {
        self.image_size
    }

    pub fn frames(&self) -> &[MarkerDetection] {
        &self.frames
    }

    pub fn flatten(&self) -> FlattenedCaptures {
        flatten_captures(&self.frames)
    }
}

// --- 連結 ---

/// 全フレームのマーカーを1本の配列に連結したもの
///
/// `marker_counter_per_frame[i]` がフレーム i のマーカー数
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlattenedCaptures {
    pub corners: Vec<[Point2f; 4]>,
    pub ids: Vec<i32>,
    pub marker_counter_per_frame: Vec<i32>,
}

impl FlattenedCaptures {
    /// カウンタに従ってフレームごとの (corners, ids) に分割し直す
    pub fn frames(&self) -> impl Iterator<Item = (&[[Point2f; 4]], &[i32])> + '_ {
        let mut start = 0usize;
        self.marker_counter_per_frame.iter().map(move |&count| {
            let end = start + count as usize;
            let frame = (&self.corners[start..end], &self.ids[start..end]);
            start = end;
            frame
        })
    }

    pub fn total_markers(&self) -> usize {
        self.ids.len()
    }

    /// カウンタと配列長の整合性を確認する（`frames()` の前提条件）
    pub fn validate(&self) -> Result<()> {
        if self.ids.len() != self.corners.len() {
            bail!(
                "Id count {} does not match corner count {}",
                self.ids.len(),
                self.corners.len()
            );
        }
        let mut total = 0usize;
        for (i, &count) in self.marker_counter_per_frame.iter().enumerate() {
            if count < 0 {
                bail!("Negative marker count {} in frame {}", count, i);
            }
            total += count as usize;
        }
        if total != self.ids.len() {
            bail!(
                "Marker counter sum {} does not match marker count {}",
                total,
                self.ids.len()
            );
        }
        Ok(())
    }
}

/// フレーム順・マーカー順を保ったまま連結する
pub fn flatten_captures(frames: &[MarkerDetection]) -> FlattenedCaptures {
    let total: usize = frames.iter().map(|f| f.len()).sum();
    let mut flat = FlattenedCaptures {
        corners: Vec::with_capacity(total),
        ids: Vec::with_capacity(total),
        marker_counter_per_frame: Vec::with_capacity(frames.len()),
    };
    for frame in frames {
        flat.marker_counter_per_frame.push(frame.corners.len() as i32);
        flat.corners.extend_from_slice(&frame.corners);
        flat.ids.extend_from_slice(&frame.ids);
    }
    flat
}

// --- キャリブレーション ---

#[derive(Debug, Clone, Copy)]
pub struct CalibrationSettings {
    /// calib3d::CALIB_* の組み合わせ
    pub flags: i32,
    /// FIX_ASPECT_RATIO 時の fx/fy
    pub aspect_ratio: f32,
}

impl CalibrationSettings {
    pub fn from_config(config: &CalibrationConfig) -> Self {
        Self {
            flags: config.flags(),
            aspect_ratio: config.aspect_ratio,
        }
    }

    fn fixes_aspect_ratio(&self) -> bool {
        self.flags & calib3d::CALIB_FIX_ASPECT_RATIO != 0
    }

    fn uses_intrinsic_guess(&self) -> bool {
        self.flags & calib3d::CALIB_USE_INTRINSIC_GUESS != 0
    }

    /// 内部パラメータ行列の初期値
    ///
    /// - USE_INTRINSIC_GUESS: f = max(幅, 高さ)、主点は画像中心
    /// - FIX_ASPECT_RATIO のみ: 単位行列の (0,0) に fx/fy を入れる
    /// - どちらも無し: 空（OpenCVが初期化する）
    pub fn initial_camera_matrix(&self, image_size: Size) -> Result<Mat> {
        let aspect = if self.fixes_aspect_ratio() {
            self.aspect_ratio as f64
        } else {
            1.0
        };
        if self.uses_intrinsic_guess() {
            let f = image_size.width.max(image_size.height) as f64;
            let k = [
                f * aspect,
                0.0,
                image_size.width as f64 / 2.0,
                0.0,
                f,
                image_size.height as f64 / 2.0,
                0.0,
                0.0,
                1.0,
            ];
            return array_to_mat3x3(&k);
        }
        if !self.fixes_aspect_ratio() {
            return Ok(Mat::default());
        }
        let mut k = Mat::eye(3, 3, CV_64F)?.to_mat()?;
        *k.at_2d_mut::<f64>(0, 0)? = aspect;
        Ok(k)
    }
}

/// キャリブレーションの生の出力
pub struct CalibrationOutput {
    pub camera_matrix: Mat,
    pub dist_coeffs: Mat,
    pub reprojection_error: f64,
}

/// 連結済みのマーカー観測からボード基準で内部パラメータを推定
pub fn calibrate_aruco(
    captures: &FlattenedCaptures,
    board: &impl BoardTraitConst,
    image_size: Size,
    settings: &CalibrationSettings,
) -> Result<CalibrationOutput> {
    captures.validate()?;

    let mut all_obj_points = Vector::<Mat>::new();
    let mut all_img_points = Vector::<Mat>::new();

    for (i, (corners, ids)) in captures.frames().enumerate() {
        let corners: Vector<Vector<Point2f>> =
            corners.iter().map(|quad| Vector::<Point2f>::from_slice(quad)).collect();
        let ids = Vector::from_slice(ids);

        let mut obj_pts = Mat::default();
        let mut img_pts = Mat::default();
        board
            .match_image_points(&corners, &ids, &mut obj_pts, &mut img_pts)
            .context("match_image_points failed")?;

        if obj_pts.rows() < 4 {
            log::debug!("frame {}: no board markers, skipped", i);
            continue;
        }
        all_obj_points.push(obj_pts);
        all_img_points.push(img_pts);
    }

    if all_obj_points.is_empty() {
        bail!("No captured frame contains markers of the board");
    }

    let mut camera_matrix = settings.initial_camera_matrix(image_size)?;
    let mut dist_coeffs = Mat::default();
    let mut rvecs = Vector::<Mat>::new();
    let mut tvecs = Vector::<Mat>::new();

    let criteria = TermCriteria::new(
        TermCriteria_Type::COUNT as i32 + TermCriteria_Type::EPS as i32,
        30,
        f64::EPSILON,
    )?;

    let error = calib3d::calibrate_camera(
        &all_obj_points,
        &all_img_points,
        image_size,
        &mut camera_matrix,
        &mut dist_coeffs,
        &mut rvecs,
        &mut tvecs,
        settings.flags,
        criteria,
    )
    .context("calibrate_camera failed")?;

    Ok(CalibrationOutput {
        camera_matrix,
        dist_coeffs,
        reprojection_error: error,
    })
}

/// 蓄積したキャプチャからキャリブレーションし、保存用の結果を作る
pub fn run_calibration(
    captures: &CaptureSet,
    board: &impl BoardTraitConst,
    settings: &CalibrationSettings,
    min_captures: usize,
) -> Result<CameraParameters> {
    let image_size = match captures.image_size() {
        Some(size) if captures.len() >= min_captures.max(1) => size,
        _ => bail!(
            "Not enough captures for calibration ({} captured, need {})",
            captures.len(),
            min_captures.max(1)
        ),
    };

    let flat = captures.flatten();
    log::info!(
        "Calibrating from {} frames / {} markers",
        flat.marker_counter_per_frame.len(),
        flat.total_markers()
    );

    let output = calibrate_aruco(&flat, board, image_size, settings)?;

    Ok(CameraParameters {
        calibration_time: Some(chrono::Local::now().format("%c").to_string()),
        image_width: Some(image_size.width),
        image_height: Some(image_size.height),
        aspect_ratio: settings.fixes_aspect_ratio().then_some(settings.aspect_ratio),
        flags: settings.flags,
        camera_matrix: mat3x3_to_array(&output.camera_matrix)?,
        distortion_coefficients: mat_to_vec(&output.dist_coeffs)?,
        avg_reprojection_error: Some(output.reprojection_error),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::create_grid_board;
    use crate::camera_params::vec_to_mat;
    use crate::config::BoardConfig;
    use crate::detection::test_support::{project_board, test_camera};
    use approx::assert_relative_eq;
    use opencv::objdetect::GridBoard;

    /// id を1つずつずらした識別しやすいフレームを作る
    fn frame(first_id: i32, count: usize) -> MarkerDetection {
        let mut detection = MarkerDetection::default();
        for k in 0..count {
            let id = first_id + k as i32;
            let base = id as f32 * 10.0;
            detection.ids.push(id);
            detection.corners.push([
                Point2f::new(base, base),
                Point2f::new(base + 1.0, base),
                Point2f::new(base + 1.0, base + 1.0),
                Point2f::new(base, base + 1.0),
            ]);
        }
        detection
    }

    #[test]
    fn test_flatten_lengths_and_counter() {
        let frames = vec![frame(0, 3), frame(10, 1), frame(20, 4)];
        let flat = flatten_captures(&frames);

        assert_eq!(flat.marker_counter_per_frame, vec![3, 1, 4]);
        assert_eq!(flat.ids.len(), 8);
        assert_eq!(flat.corners.len(), 8);
    }

    #[test]
    fn test_flatten_preserves_order() {
        let frames = vec![frame(5, 2), frame(1, 3)];
        let flat = flatten_captures(&frames);

        assert_eq!(flat.ids, vec![5, 6, 1, 2, 3]);
        let expected: Vec<[Point2f; 4]> = frames
            .iter()
            .flat_map(|f| f.corners.iter().copied())
            .collect();
        assert_eq!(flat.corners, expected);
    }

    #[test]
    fn test_flatten_empty() {
        let flat = flatten_captures(&[]);
        assert!(flat.ids.is_empty());
        assert!(flat.corners.is_empty());
        assert!(flat.marker_counter_per_frame.is_empty());
        assert_eq!(flat.frames().count(), 0);
    }

    #[test]
    fn test_frames_inverts_flatten() {
        let frames = vec![frame(0, 2), frame(7, 5), frame(30, 1)];
        let flat = flatten_captures(&frames);

        let split: Vec<_> = flat.frames().collect();
        assert_eq!(split.len(), frames.len());
        for ((corners, ids), original) in split.iter().zip(frames.iter()) {
            assert_eq!(*ids, original.ids.as_slice());
            assert_eq!(*corners, original.corners.as_slice());
        }
    }

    #[test]
    fn test_capture_set_rejects_empty_and_resized_frames() {
        let mut captures = CaptureSet::new();
        let size = Size::new(640, 480);

        assert!(captures.push(MarkerDetection::default(), size).is_err());
        captures.push(frame(0, 2), size).unwrap();
        assert!(captures.push(frame(3, 1), Size::new(1280, 720)).is_err());
        captures.push(frame(3, 1), size).unwrap();

        assert_eq!(captures.len(), 2);
        assert_eq!(captures.image_size(), Some(size));
        assert_eq!(captures.flatten().marker_counter_per_frame, vec![2, 1]);
    }

    #[test]
    fn test_initial_camera_matrix() {
        let size = Size::new(1280, 720);
        let free = CalibrationSettings { flags: 0, aspect_ratio: 1.5 };
        assert!(free.initial_camera_matrix(size).unwrap().empty());

        let fixed = CalibrationSettings {
            flags: calib3d::CALIB_FIX_ASPECT_RATIO,
            aspect_ratio: 1.5,
        };
        let k = mat3x3_to_array(&fixed.initial_camera_matrix(size).unwrap()).unwrap();
        assert_eq!(k, [1.5, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_initial_camera_matrix_with_intrinsic_guess() {
        let size = Size::new(1280, 720);
        let guess = CalibrationSettings {
            flags: calib3d::CALIB_USE_INTRINSIC_GUESS,
            aspect_ratio: 1.5,
        };
        let k = mat3x3_to_array(&guess.initial_camera_matrix(size).unwrap()).unwrap();
        assert_eq!(k, [1280.0, 0.0, 640.0, 0.0, 1280.0, 360.0, 0.0, 0.0, 1.0]);

        let fixed = CalibrationSettings {
            flags: calib3d::CALIB_USE_INTRINSIC_GUESS | calib3d::CALIB_FIX_ASPECT_RATIO,
            aspect_ratio: 1.5,
        };
        let k = mat3x3_to_array(&fixed.initial_camera_matrix(size).unwrap()).unwrap();
        assert_eq!(k, [1920.0, 0.0, 640.0, 0.0, 1280.0, 360.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_validate_rejects_inconsistent_counters() {
        let flat = flatten_captures(&[frame(0, 2), frame(10, 3)]);
        assert!(flat.validate().is_ok());

        let mut too_many = flat.clone();
        too_many.marker_counter_per_frame = vec![2, 4];
        assert!(too_many.validate().is_err());

        let mut negative = flat.clone();
        negative.marker_counter_per_frame = vec![-1, 6];
        assert!(negative.validate().is_err());

        let mut short_corners = flat.clone();
        short_corners.corners.pop();
        assert!(short_corners.validate().is_err());
    }

    #[test]
    fn test_calibrate_aruco_rejects_mismatched_counter() {
        let board = create_grid_board(&BoardConfig::default()).unwrap();
        let settings = CalibrationSettings { flags: 0, aspect_ratio: 1.0 };
        let mut flat = flatten_captures(&[frame(0, 4)]);
        flat.marker_counter_per_frame = vec![9];

        let err = calibrate_aruco(&flat, &board, Size::new(640, 480), &settings)
            .err()
            .unwrap();
        assert!(err.to_string().contains("Marker counter sum"));
    }

    #[test]
    fn test_run_calibration_requires_captures() {
        let board = create_grid_board(&BoardConfig::default()).unwrap();
        let settings = CalibrationSettings { flags: 0, aspect_ratio: 1.0 };
        let err = run_calibration(&CaptureSet::new(), &board, &settings, 1).unwrap_err();
        assert!(err.to_string().contains("Not enough captures for calibration"));

        let mut captures = CaptureSet::new();
        captures.push(frame(0, 4), Size::new(640, 480)).unwrap();
        let err = run_calibration(&captures, &board, &settings, 3).unwrap_err();
        assert!(err.to_string().contains("Not enough captures for calibration"));
    }

    /// 5視点から投影した合成キャプチャ
    fn synthetic_captures(board: &GridBoard, size: Size) -> CaptureSet {
        let camera = test_camera();
        let views = [
            ([0.3, 0.0, 0.0], [-0.12, -0.06, 0.45]),
            ([0.0, 0.35, 0.0], [-0.12, -0.06, 0.50]),
            ([-0.25, 0.2, 0.1], [-0.10, -0.05, 0.55]),
            ([0.15, -0.3, -0.1], [-0.14, -0.07, 0.48]),
            ([-0.1, -0.2, 0.2], [-0.12, -0.04, 0.60]),
        ];

        let mut captures = CaptureSet::new();
        for (r, t) in views {
            let rvec = vec_to_mat(&r).unwrap();
            let tvec = vec_to_mat(&t).unwrap();
            captures.push(project_board(board, &camera, &rvec, &tvec), size).unwrap();
        }
        captures
    }

    #[test]
    fn test_calibrate_with_intrinsic_guess() {
        let board = create_grid_board(&BoardConfig::default()).unwrap();
        let captures = synthetic_captures(&board, Size::new(1280, 720));

        let settings = CalibrationSettings {
            flags: calib3d::CALIB_USE_INTRINSIC_GUESS,
            aspect_ratio: 1.0,
        };
        let params = run_calibration(&captures, &board, &settings, 1).unwrap();

        assert_eq!(params.flags, calib3d::CALIB_USE_INTRINSIC_GUESS);
        assert!(params.avg_reprojection_error.unwrap() < 0.01);
        assert_relative_eq!(params.camera_matrix[0], 800.0, max_relative = 0.01);
        assert_relative_eq!(params.camera_matrix[4], 800.0, max_relative = 0.01);
    }

    #[test]
    fn test_calibrate_synthetic_views() {
        let board = create_grid_board(&BoardConfig::default()).unwrap();
        let size = Size::new(1280, 720);
        let captures = synthetic_captures(&board, size);

        let settings = CalibrationSettings { flags: 0, aspect_ratio: 1.0 };
        let params = run_calibration(&captures, &board, &settings, 1).unwrap();

        assert_eq!(params.image_width, Some(1280));
        assert_eq!(params.aspect_ratio, None);
        assert!(params.calibration_time.is_some());
        assert!(params.avg_reprojection_error.unwrap() < 0.01);
        assert_relative_eq!(params.camera_matrix[0], 800.0, max_relative = 0.01);
        assert_relative_eq!(params.camera_matrix[4], 800.0, max_relative = 0.01);
        assert_relative_eq!(params.camera_matrix[2], 640.0, epsilon = 5.0);
        assert_relative_eq!(params.camera_matrix[5], 360.0, epsilon = 5.0);
    }
}
