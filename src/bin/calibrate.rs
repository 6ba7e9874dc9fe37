use anyhow::{bail, Result};
use opencv::core::Mat;
use opencv::prelude::*;

use aruco_board::board::{create_grid_board, parse_dictionary};
use aruco_board::calibration::{run_calibration, CalibrationSettings, CaptureSet};
use aruco_board::camera::{OpenCvCamera, ReadFailures};
use aruco_board::camera_params::describe_flags;
use aruco_board::config::Config;
use aruco_board::detection::{draw_markers, MarkerDetector};
use aruco_board::render::overlay::{self, draw_status, marker_count_color};
use aruco_board::render::{Key, MinifbRenderer};

const CONFIG_PATH: &str = "config.toml";

fn main() -> Result<()> {
    aruco_board::init_logging();

    let config_path = std::env::args().nth(1).unwrap_or_else(|| CONFIG_PATH.to_string());
    let config = Config::load_or_default(&config_path)?;
    let board_config = &config.board;
    let cal_config = &config.calibration;
    let settings = CalibrationSettings::from_config(cal_config);

    println!("=== ArUco グリッドボード キャリブレーション ===");
    println!();
    println!("ボード設定:");
    println!("  辞書: {}", board_config.dictionary);
    println!("  マーカー数: {}x{}", board_config.markers_x, board_config.markers_y);
    println!("  マーカー辺長: {}m", board_config.marker_length);
    println!("  マーカー間隔: {}m", board_config.marker_separation);
    println!("  出力先: {}", cal_config.output_path);
    if let Some(desc) = describe_flags(settings.flags) {
        println!("  {}", desc);
    }
    println!();
    println!("  ボードを様々な角度から見せてください");
    println!("  [C] キャプチャ  [Enter] キャリブレーションして保存  [Esc] 中止");
    println!();

    let detector_params = config.detector.resolve()?;
    let dictionary = parse_dictionary(&board_config.dictionary)?;
    let detector = MarkerDetector::new(&dictionary, &detector_params)?;
    let board = create_grid_board(board_config)?;

    let mut camera = OpenCvCamera::open_with_resolution(
        config.camera.index,
        config.camera.width,
        config.camera.height,
    )?;
    let (w, h) = camera.resolution();
    let mut renderer = MinifbRenderer::new("Calibrate", w as usize, h as usize)?;

    let mut captures = CaptureSet::new();
    let mut confirmed = false;
    let mut failures = ReadFailures::default();

    while renderer.is_open() {
        let Some(frame) = failures.check(camera.read_frame())? else {
            continue;
        };

        let detection = detector.detect(&frame)?;
        let mut display = Mat::default();
        frame.copy_to(&mut display)?;
        draw_markers(&mut display, &detection)?;

        let status = format!(
            "Markers: {} | Captures: {}",
            detection.len(),
            captures.len()
        );
        draw_status(&mut display, 0, &status, marker_count_color(detection.len(), 1))?;
        draw_status(&mut display, 1, "C: capture  Enter: calibrate  Esc: quit", overlay::INFO_COLOR)?;

        renderer.draw_frame(&display)?;
        renderer.update()?;

        if renderer.is_key_pressed(Key::C) {
            if detection.is_empty() {
                println!("  マーカーが検出されていません");
            } else {
                let markers = detection.len();
                match captures.push(detection, frame.size()?) {
                    Ok(()) => {
                        println!("Frame captured ({} markers, {} total)", markers, captures.len());
                    }
                    Err(e) => log::warn!("Capture rejected: {:#}", e),
                }
            }
        }

        if renderer.is_key_pressed(Key::Enter) {
            if captures.len() >= cal_config.min_captures.max(1) {
                confirmed = true;
                break;
            }
            println!(
                "  キャプチャ不足（{}枚、最低{}枚必要）",
                captures.len(),
                cal_config.min_captures.max(1)
            );
        }
    }

    if !confirmed {
        bail!("ユーザーにより中止されました");
    }

    println!("キャリブレーション中...");
    let params = run_calibration(&captures, &board, &settings, cal_config.min_captures)?;
    params.save(&cal_config.output_path)?;

    if let Some(err) = params.avg_reprojection_error {
        println!("Rep Error: {}", err);
    }
    println!("Calibration saved to {}", cal_config.output_path);
    Ok(())
}
