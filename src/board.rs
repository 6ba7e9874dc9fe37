use anyhow::{bail, Context, Result};
use opencv::{
    core::Size,
    objdetect::{self, CharucoBoard, Dictionary, GridBoard, PredefinedDictionaryType},
};

use crate::config::BoardConfig;

// --- 辞書ヘルパー ---

pub fn parse_dictionary(name: &str) -> Result<Dictionary> {
    let dict_type = match name {
        "DICT_4X4_50" => PredefinedDictionaryType::DICT_4X4_50,
        "DICT_4X4_100" => PredefinedDictionaryType::DICT_4X4_100,
        "DICT_4X4_250" => PredefinedDictionaryType::DICT_4X4_250,
        "DICT_4X4_1000" => PredefinedDictionaryType::DICT_4X4_1000,
        "DICT_5X5_50" => PredefinedDictionaryType::DICT_5X5_50,
        "DICT_5X5_100" => PredefinedDictionaryType::DICT_5X5_100,
        "DICT_5X5_250" => PredefinedDictionaryType::DICT_5X5_250,
        "DICT_5X5_1000" => PredefinedDictionaryType::DICT_5X5_1000,
        "DICT_6X6_50" => PredefinedDictionaryType::DICT_6X6_50,
        "DICT_6X6_100" => PredefinedDictionaryType::DICT_6X6_100,
        "DICT_6X6_250" => PredefinedDictionaryType::DICT_6X6_250,
        "DICT_6X6_1000" => PredefinedDictionaryType::DICT_6X6_1000,
        "DICT_7X7_50" => PredefinedDictionaryType::DICT_7X7_50,
        "DICT_7X7_100" => PredefinedDictionaryType::DICT_7X7_100,
        "DICT_7X7_250" => PredefinedDictionaryType::DICT_7X7_250,
        "DICT_7X7_1000" => PredefinedDictionaryType::DICT_7X7_1000,
        "DICT_ARUCO_ORIGINAL" => PredefinedDictionaryType::DICT_ARUCO_ORIGINAL,
        "DICT_APRILTAG_16h5" => PredefinedDictionaryType::DICT_APRILTAG_16h5,
        "DICT_APRILTAG_25h9" => PredefinedDictionaryType::DICT_APRILTAG_25h9,
        "DICT_APRILTAG_36h10" => PredefinedDictionaryType::DICT_APRILTAG_36h10,
        "DICT_APRILTAG_36h11" => PredefinedDictionaryType::DICT_APRILTAG_36h11,
        _ => bail!("Unknown dictionary: {}", name),
    };
    objdetect::get_predefined_dictionary(dict_type).context("Failed to get predefined dictionary")
}

// --- ボード作成 ---

/// ArUcoグリッドボードを作成（姿勢推定・キャリブレーション用）
pub fn create_grid_board(config: &BoardConfig) -> Result<GridBoard> {
    let dict = parse_dictionary(&config.dictionary)?;
    let size = Size::new(config.markers_x, config.markers_y);
    GridBoard::new_def(size, config.marker_length, config.marker_separation, &dict)
        .context("Failed to create GridBoard")
}

/// ChArUcoボードを作成
pub fn create_charuco_board(config: &BoardConfig) -> Result<CharucoBoard> {
    let dict = parse_dictionary(&config.dictionary)?;
    let charuco = &config.charuco;
    let size = Size::new(charuco.squares_x, charuco.squares_y);
    CharucoBoard::new_def(size, charuco.square_length, charuco.marker_length, &dict)
        .context("Failed to create CharucoBoard")
}

/// 座標軸の描画長（メートル）
///
/// ボード短辺の半分 + 端の間隔1つ分
pub fn axis_length(markers_x: i32, markers_y: i32, marker_length: f32, marker_separation: f32) -> f32 {
    0.5 * (markers_x.min(markers_y) as f32 * (marker_length + marker_separation) + marker_separation)
}

/// 設定からグリッドボードの座標軸長を求める
pub fn grid_axis_length(config: &BoardConfig) -> f32 {
    axis_length(
        config.markers_x,
        config.markers_y,
        config.marker_length,
        config.marker_separation,
    )
}
