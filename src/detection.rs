use anyhow::{bail, Context, Result};
use opencv::{
    calib3d,
    core::{Mat, Point2f, Vector},
    objdetect::{
        self, ArucoDetector, BoardTraitConst, CharucoBoard, CharucoDetector, CharucoParameters,
        Dictionary, RefineParameters,
    },
    prelude::*,
};

use crate::camera_params::CameraParameters;
use crate::detector_params::DetectorParamsConfig;
use crate::render::overlay::{scalar, Bgr};

/// 検出したマーカーの輪郭色
const MARKER_COLOR: Bgr = (0.0, 255.0, 0.0);
/// ChArUcoコーナーの色
const CHARUCO_CORNER_COLOR: Bgr = (255.0, 0.0, 0.0);

/// 1フレーム分のマーカー検出結果
///
/// `ids[i]` と `corners[i]` が対応する（検出器の出力順）
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MarkerDetection {
    pub ids: Vec<i32>,
    pub corners: Vec<[Point2f; 4]>,
}

impl MarkerDetection {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// OpenCVの出力配列から変換
    pub fn from_vectors(corners: &Vector<Vector<Point2f>>, ids: &Vector<i32>) -> Result<Self> {
        if corners.len() != ids.len() {
            bail!("Corner count {} does not match id count {}", corners.len(), ids.len());
        }
        let mut quads = Vec::with_capacity(corners.len());
        for quad in corners.iter() {
            if quad.len() != 4 {
                bail!("Marker has {} corners, expected 4", quad.len());
            }
            quads.push([quad.get(0)?, quad.get(1)?, quad.get(2)?, quad.get(3)?]);
        }
        Ok(Self {
            ids: ids.to_vec(),
            corners: quads,
        })
    }

    /// OpenCVの入力配列へ変換
    pub fn to_vectors(&self) -> (Vector<Vector<Point2f>>, Vector<i32>) {
        let corners = self
            .corners
            .iter()
            .map(|quad| Vector::<Point2f>::from_slice(quad))
            .collect();
        (corners, Vector::from_slice(&self.ids))
    }
}

/// ArUcoマーカー検出器
pub struct MarkerDetector {
    detector: ArucoDetector,
}

impl MarkerDetector {
    pub fn new(dictionary: &Dictionary, params: &DetectorParamsConfig) -> Result<Self> {
        let det_params = params.build()?;
        let refine_params = RefineParameters::new(10.0, 3.0, true)?;
        let detector = ArucoDetector::new(dictionary, &det_params, refine_params)
            .context("Failed to create ArucoDetector")?;
        Ok(Self { detector })
    }

    pub fn detect(&self, image: &Mat) -> Result<MarkerDetection> {
        let mut corners = Vector::<Vector<Point2f>>::new();
        let mut ids = Vector::<i32>::new();
        let mut rejected = Vector::<Vector<Point2f>>::new();
        self.detector
            .detect_markers(image, &mut corners, &mut ids, &mut rejected)
            .context("detectMarkers failed")?;
        MarkerDetection::from_vectors(&corners, &ids)
    }
}

/// 内部パラメータ行列と歪み係数（OpenCV形式）
pub struct CameraModel {
    pub camera_matrix: Mat,
    pub dist_coeffs: Mat,
}

impl CameraModel {
    pub fn from_params(params: &CameraParameters) -> Result<Self> {
        Ok(Self {
            camera_matrix: params.camera_matrix_mat()?,
            dist_coeffs: params.distortion_mat()?,
        })
    }
}

/// ボード座標系 → カメラ座標系の姿勢
#[derive(Debug)]
pub struct BoardPose {
    /// 回転ベクトル (Rodrigues)
    pub rvec: Mat,
    pub tvec: Mat,
    /// 姿勢推定に使った2D-3D対応点の数
    pub points_used: i32,
}

impl BoardPose {
    /// グリッドボードで使われたマーカー数（1マーカー = 4点）
    pub fn markers_used(&self) -> i32 {
        self.points_used / 4
    }
}

fn solve_board_pnp(obj_pts: &Mat, img_pts: &Mat, camera: &CameraModel) -> Result<Option<BoardPose>> {
    let mut rvec = Mat::default();
    let mut tvec = Mat::default();
    let ok = calib3d::solve_pnp(
        obj_pts,
        img_pts,
        &camera.camera_matrix,
        &camera.dist_coeffs,
        &mut rvec,
        &mut tvec,
        false,
        calib3d::SOLVEPNP_ITERATIVE,
    )
    .context("solvePnP failed")?;

    if !ok {
        return Ok(None);
    }
    Ok(Some(BoardPose {
        rvec,
        tvec,
        points_used: obj_pts.rows(),
    }))
}

/// 検出マーカーからボード姿勢を推定
///
/// ボードに属するマーカーが1つも無ければ None
pub fn estimate_board_pose(
    detection: &MarkerDetection,
    board: &impl BoardTraitConst,
    camera: &CameraModel,
) -> Result<Option<BoardPose>> {
    if detection.is_empty() {
        return Ok(None);
    }
    let (corners, ids) = detection.to_vectors();
    let mut obj_pts = Mat::default();
    let mut img_pts = Mat::default();
    board
        .match_image_points(&corners, &ids, &mut obj_pts, &mut img_pts)
        .context("match_image_points failed")?;

    if obj_pts.rows() < 4 {
        return Ok(None);
    }
    solve_board_pnp(&obj_pts, &img_pts, camera)
}

/// マーカーの輪郭とIDを描画
pub fn draw_markers(image: &mut Mat, detection: &MarkerDetection) -> Result<()> {
    if detection.is_empty() {
        return Ok(());
    }
    let (corners, ids) = detection.to_vectors();
    objdetect::draw_detected_markers(image, &corners, &ids, scalar(MARKER_COLOR))
        .context("drawDetectedMarkers failed")?;
    Ok(())
}

/// ボード座標軸を描画
pub fn draw_axes(image: &mut Mat, camera: &CameraModel, pose: &BoardPose, axis_length: f32) -> Result<()> {
    calib3d::draw_frame_axes(
        image,
        &camera.camera_matrix,
        &camera.dist_coeffs,
        &pose.rvec,
        &pose.tvec,
        axis_length,
        3,
    )
    .context("drawFrameAxes failed")?;
    Ok(())
}

// --- ChArUco ---

/// 補間されたChArUcoコーナー
#[derive(Debug, Default)]
pub struct CharucoCorners {
    pub corners: Vector<Point2f>,
    pub ids: Vector<i32>,
}

impl CharucoCorners {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// ChArUcoボードのコーナー検出器
pub struct CharucoCornerDetector {
    detector: CharucoDetector,
}

impl CharucoCornerDetector {
    pub fn new(board: &CharucoBoard, params: &DetectorParamsConfig) -> Result<Self> {
        let det_params = params.build()?;
        let charuco_params = CharucoParameters::default()?;
        let refine_params = RefineParameters::new(10.0, 3.0, true)?;
        let detector = CharucoDetector::new(board, &charuco_params, &det_params, refine_params)
            .context("Failed to create CharucoDetector")?;
        Ok(Self { detector })
    }

    pub fn detect(&self, image: &Mat) -> Result<CharucoCorners> {
        let mut found = CharucoCorners::default();
        self.detector
            .detect_board_def(image, &mut found.corners, &mut found.ids)
            .context("detect_board failed")?;
        Ok(found)
    }
}

/// ChArUcoコーナーからボード姿勢を推定（4コーナー未満は None）
pub fn estimate_charuco_pose(
    corners: &CharucoCorners,
    board: &CharucoBoard,
    camera: &CameraModel,
) -> Result<Option<BoardPose>> {
    if corners.len() < 4 {
        return Ok(None);
    }
    let mut obj_pts = Mat::default();
    let mut img_pts = Mat::default();
    board
        .match_image_points(&corners.corners, &corners.ids, &mut obj_pts, &mut img_pts)
        .context("match_image_points failed")?;

    if obj_pts.rows() < 4 {
        return Ok(None);
    }
    solve_board_pnp(&obj_pts, &img_pts, camera)
}

pub fn draw_charuco_corners(image: &mut Mat, corners: &CharucoCorners) -> Result<()> {
    if corners.is_empty() {
        return Ok(());
    }
    objdetect::draw_detected_corners_charuco(
        image,
        &corners.corners,
        &corners.ids,
        scalar(CHARUCO_CORNER_COLOR),
    )
    .context("drawDetectedCornersCharuco failed")?;
    Ok(())
}
