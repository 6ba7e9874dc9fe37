use anyhow::Result;
use opencv::{
    core::{Mat, Point, Scalar},
    imgproc,
};

/// (B, G, R)
pub type Bgr = (f64, f64, f64);

/// 十分に検出できている
pub const OK_COLOR: Bgr = (0.0, 255.0, 0.0);
/// 検出はあるが不足
pub const WARN_COLOR: Bgr = (0.0, 255.0, 255.0);
/// 何も検出できない
pub const NONE_COLOR: Bgr = (0.0, 0.0, 255.0);
pub const INFO_COLOR: Bgr = (255.0, 255.0, 255.0);

pub fn scalar((b, g, r): Bgr) -> Scalar {
    Scalar::new(b, g, r, 0.0)
}

/// 画面左上にステータス行を描画（line は 0 始まり）
pub fn draw_status(image: &mut Mat, line: i32, text: &str, color: Bgr) -> Result<()> {
    let origin = Point::new(10, 30 + line * 28);
    // 背景（黒）で視認性確保
    imgproc::put_text(
        image,
        text,
        origin,
        imgproc::FONT_HERSHEY_SIMPLEX,
        0.7,
        Scalar::all(0.0),
        4,
        imgproc::LINE_8,
        false,
    )?;
    imgproc::put_text(
        image,
        text,
        origin,
        imgproc::FONT_HERSHEY_SIMPLEX,
        0.7,
        scalar(color),
        2,
        imgproc::LINE_8,
        false,
    )?;
    Ok(())
}

/// 検出マーカー数に応じた色
pub fn marker_count_color(markers: usize, enough: usize) -> Bgr {
    match markers {
        0 => NONE_COLOR,
        n if n < enough => WARN_COLOR,
        _ => OK_COLOR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_count_color() {
        assert_eq!(marker_count_color(0, 1), NONE_COLOR);
        assert_eq!(marker_count_color(2, 4), WARN_COLOR);
        assert_eq!(marker_count_color(4, 4), OK_COLOR);
    }
}
