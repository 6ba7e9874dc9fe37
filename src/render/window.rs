use anyhow::{bail, Result};
use minifb::{Key, KeyRepeat, Window, WindowOptions};
use opencv::core::{Mat, Vec3b};
use opencv::prelude::*;

/// BGR → 0RGB (minifbのバッファ形式)
#[inline]
pub fn pack_bgr(pixel: &Vec3b) -> u32 {
    let r = pixel[2] as u32;
    let g = pixel[1] as u32;
    let b = pixel[0] as u32;
    (r << 16) | (g << 8) | b
}

/// minifbを使用したレンダラー
pub struct MinifbRenderer {
    window: Window,
    buffer: Vec<u32>,
    width: usize,
    height: usize,
}

impl MinifbRenderer {
    /// ウィンドウを作成
    pub fn new(title: &str, width: usize, height: usize) -> Result<Self> {
        let window = Window::new(
            title,
            width,
            height,
            WindowOptions {
                resize: false,
                ..WindowOptions::default()
            },
        )?;

        Ok(Self {
            window,
            buffer: vec![0u32; width * height],
            width,
            height,
        })
    }

    /// ウィンドウが開いているか（Escで閉じる）
    pub fn is_open(&self) -> bool {
        self.window.is_open() && !self.window.is_key_down(Key::Escape)
    }

    /// キーが押された瞬間だけ true（リピート無し）
    pub fn is_key_pressed(&self, key: Key) -> bool {
        self.window.is_key_pressed(key, KeyRepeat::No)
    }

    /// BGR Mat をバッファにコピー
    ///
    /// ウィンドウより大きいフレームはクロップ、小さい場合は残りを前回の内容のまま残す
    pub fn draw_frame(&mut self, frame: &Mat) -> Result<()> {
        if frame.channels() != 3 {
            bail!("Expected a 3-channel BGR frame, got {} channels", frame.channels());
        }
        let frame_width = frame.cols() as usize;
        let frame_height = frame.rows() as usize;

        for y in 0..self.height.min(frame_height) {
            for x in 0..self.width.min(frame_width) {
                let pixel = frame.at_2d::<Vec3b>(y as i32, x as i32)?;
                self.buffer[y * self.width + x] = pack_bgr(pixel);
            }
        }

        Ok(())
    }

    /// バッファをウィンドウに表示
    pub fn update(&mut self) -> Result<()> {
        self.window
            .update_with_buffer(&self.buffer, self.width, self.height)?;
        Ok(())
    }
}
