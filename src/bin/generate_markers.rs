use anyhow::{Context, Result};
use opencv::core::{Mat, Size, Vector};
use opencv::objdetect::{self, BoardTraitConst, DictionaryTraitConst};
use opencv::prelude::*;
use opencv::imgcodecs;
use std::fs;
use std::path::{Path, PathBuf};

use aruco_board::board::{create_charuco_board, create_grid_board, parse_dictionary};
use aruco_board::config::Config;

const CONFIG_PATH: &str = "config.toml";
/// マーカー画像1枚の辺長（ピクセル）
const MARKER_PIXELS: i32 = 500;
/// ChArUcoボード1マスのピクセルサイズ
const PX_PER_SQUARE: i32 = 200;

/// Usage: generate_markers [out_dir] [count]
fn parse_args() -> (PathBuf, Option<i32>) {
    let args: Vec<String> = std::env::args().collect();
    let out_dir = args.get(1).map(PathBuf::from).unwrap_or_else(|| PathBuf::from("markers"));
    let count = args.get(2).and_then(|s| s.parse().ok());
    (out_dir, count)
}

fn write_image(path: &Path, image: &Mat) -> Result<()> {
    let name = path.to_string_lossy();
    let ok = imgcodecs::imwrite(&name, image, &Vector::new())
        .with_context(|| format!("Failed to write {}", name))?;
    if !ok {
        anyhow::bail!("Failed to write {}", name);
    }
    log::debug!("wrote {}", name);
    Ok(())
}

fn main() -> Result<()> {
    aruco_board::init_logging();

    let (out_dir, count) = parse_args();
    let config = Config::load_or_default(CONFIG_PATH)?;
    let board_config = &config.board;

    fs::create_dir_all(&out_dir)
        .with_context(|| format!("Failed to create {}", out_dir.display()))?;

    // 個別マーカー
    let dictionary = parse_dictionary(&board_config.dictionary)?;
    let dict_size = dictionary.bytes_list().rows();
    let count = count.unwrap_or(dict_size).clamp(0, dict_size);
    for id in 0..count {
        let mut marker = Mat::default();
        objdetect::generate_image_marker(&dictionary, id, MARKER_PIXELS, &mut marker, 1)?;
        write_image(&out_dir.join(format!("marker{}.bmp", id)), &marker)?;
    }
    println!("マーカー画像: {}枚 ({})", count, board_config.dictionary);

    // グリッドボード（縦横比はマーカー配置に合わせる）
    let grid = create_grid_board(board_config)?;
    let grid_w = 2000;
    let grid_h = (grid_w as f32 * board_config.markers_y as f32 / board_config.markers_x as f32) as i32;
    let mut grid_img = Mat::default();
    grid.generate_image(Size::new(grid_w, grid_h), &mut grid_img, 0, 1)?;
    let grid_path = out_dir.join("marker_grid.bmp");
    write_image(&grid_path, &grid_img)?;
    println!("グリッドボード: {}", grid_path.display());

    // ChArUcoボード
    let charuco = create_charuco_board(board_config)?;
    let c = &board_config.charuco;
    let mut charuco_img = Mat::default();
    charuco.generate_image(
        Size::new(c.squares_x * PX_PER_SQUARE, c.squares_y * PX_PER_SQUARE),
        &mut charuco_img,
        0,
        1,
    )?;
    let charuco_path = out_dir.join(format!(
        "charuco_{}x{}_{}.png",
        c.squares_x, c.squares_y, board_config.dictionary
    ));
    write_image(&charuco_path, &charuco_img)?;
    println!("ChArUcoボード: {}", charuco_path.display());

    Ok(())
}
