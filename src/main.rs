use anyhow::Result;
use opencv::core::Mat;
use opencv::prelude::*;

use aruco_board::board::{axis_length, create_charuco_board, create_grid_board, grid_axis_length, parse_dictionary};
use aruco_board::camera::{OpenCvCamera, ReadFailures};
use aruco_board::camera_params::CameraParameters;
use aruco_board::config::{Config, PoseTarget};
use aruco_board::detection::{
    draw_axes, draw_charuco_corners, draw_markers, estimate_board_pose, estimate_charuco_pose,
    BoardPose, CameraModel, CharucoCornerDetector, MarkerDetector,
};
use aruco_board::render::overlay::{self, draw_status};
use aruco_board::render::MinifbRenderer;

const CONFIG_PATH: &str = "config.toml";

fn main() -> Result<()> {
    aruco_board::init_logging();

    let config_path = std::env::args().nth(1).unwrap_or_else(|| CONFIG_PATH.to_string());
    let config = Config::load_or_default(&config_path)?;
    let board_config = &config.board;

    println!("=== ArUco ボード姿勢推定 ({}) ===", env!("GIT_VERSION"));
    println!("  辞書: {}", board_config.dictionary);
    println!(
        "  グリッド: {}x{} (マーカー {}m, 間隔 {}m)",
        board_config.markers_x, board_config.markers_y, board_config.marker_length, board_config.marker_separation
    );
    println!("  姿勢推定: {:?}", board_config.pose_target);
    println!("  [Esc] 終了");
    println!();

    let camera_params = CameraParameters::load(&config.camera.params_path)?;
    let camera_model = CameraModel::from_params(&camera_params)?;

    let detector_params = config.detector.resolve()?;
    let dictionary = parse_dictionary(&board_config.dictionary)?;
    let detector = MarkerDetector::new(&dictionary, &detector_params)?;
    let grid_board = create_grid_board(board_config)?;

    let charuco = match board_config.pose_target {
        PoseTarget::Grid => None,
        PoseTarget::Charuco => {
            let board = create_charuco_board(board_config)?;
            let corner_detector = CharucoCornerDetector::new(&board, &detector_params)?;
            Some((board, corner_detector))
        }
    };
    let axis = match board_config.pose_target {
        PoseTarget::Grid => grid_axis_length(board_config),
        PoseTarget::Charuco => {
            let c = &board_config.charuco;
            axis_length(c.squares_x, c.squares_y, c.square_length, 0.0)
        }
    };

    let mut camera = OpenCvCamera::open_with_resolution(
        config.camera.index,
        config.camera.width,
        config.camera.height,
    )?;
    let (w, h) = camera.resolution();
    let mut renderer = MinifbRenderer::new("Image", w as usize, h as usize)?;

    let mut failures = ReadFailures::default();
    while renderer.is_open() {
        let Some(frame) = failures.check(camera.read_frame())? else {
            continue;
        };

        let detection = detector.detect(&frame)?;
        let mut display = Mat::default();
        frame.copy_to(&mut display)?;

        let mut pose: Option<BoardPose> = None;
        if !detection.is_empty() {
            draw_markers(&mut display, &detection)?;
            pose = match &charuco {
                None => estimate_board_pose(&detection, &grid_board, &camera_model)?,
                Some((board, corner_detector)) => {
                    let corners = corner_detector.detect(&frame)?;
                    draw_charuco_corners(&mut display, &corners)?;
                    estimate_charuco_pose(&corners, board, &camera_model)?
                }
            };
            if let Some(pose) = &pose {
                draw_axes(&mut display, &camera_model, pose, axis)?;
            }
        }

        let status = match &pose {
            Some(p) => format!("Markers: {} | Board points: {}", detection.len(), p.points_used),
            None => format!("Markers: {} | No board pose", detection.len()),
        };
        let color = match (&pose, detection.len()) {
            (Some(_), _) => overlay::OK_COLOR,
            (None, 0) => overlay::NONE_COLOR,
            (None, _) => overlay::WARN_COLOR,
        };
        draw_status(&mut display, 0, &status, color)?;

        renderer.draw_frame(&display)?;
        renderer.update()?;
    }

    Ok(())
}
