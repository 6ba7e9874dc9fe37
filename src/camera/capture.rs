use anyhow::{bail, Context, Result};
use opencv::{
    core::Mat,
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureAPIs},
};

/// OpenCVのVideoCaptureによるカメラ入力（単一スレッド・ブロッキング読み込み）
pub struct OpenCvCamera {
    capture: VideoCapture,
    index: i32,
    width: u32,
    height: u32,
}

impl OpenCvCamera {
    /// 解像度を指定してカメラを開く（None はデバイス既定、実際の解像度はデバイス次第）
    pub fn open_with_resolution(index: i32, width: Option<u32>, height: Option<u32>) -> Result<Self> {
        let mut capture = VideoCapture::new(index, VideoCaptureAPIs::CAP_ANY as i32)
            .with_context(|| format!("Failed to open camera {}", index))?;

        if !capture.is_opened()? {
            bail!("Camera {} is not available", index);
        }

        if let Some(w) = width {
            capture.set(videoio::CAP_PROP_FRAME_WIDTH, w as f64)?;
        }
        if let Some(h) = height {
            capture.set(videoio::CAP_PROP_FRAME_HEIGHT, h as f64)?;
        }

        let actual_width = capture.get(videoio::CAP_PROP_FRAME_WIDTH)? as u32;
        let actual_height = capture.get(videoio::CAP_PROP_FRAME_HEIGHT)? as u32;
        log::info!(
            "Camera {} opened: {}x{} ({})",
            index,
            actual_width,
            actual_height,
            capture.get_backend_name().unwrap_or_default()
        );

        Ok(Self {
            capture,
            index,
            width: actual_width,
            height: actual_height,
        })
    }

    /// 解像度を取得
    pub fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// フレームを読み込む（BGR形式）
    pub fn read_frame(&mut self) -> Result<Mat> {
        let mut frame = Mat::default();
        self.capture
            .read(&mut frame)
            .context("Failed to read frame")?;

        if frame.empty() {
            bail!("Empty frame received from camera {}", self.index);
        }

        Ok(frame)
    }
}

/// 連続でフレーム取得に失敗したら諦める回数
pub const MAX_READ_FAILURES: u32 = 30;

/// フレーム取得の連続失敗回数
#[derive(Debug)]
pub struct ReadFailures {
    count: u32,
    limit: u32,
}

impl Default for ReadFailures {
    fn default() -> Self {
        Self::with_limit(MAX_READ_FAILURES)
    }
}

impl ReadFailures {
    pub fn with_limit(limit: u32) -> Self {
        Self { count: 0, limit }
    }

    /// 読み込み結果を記録する
    ///
    /// 失敗は警告して None を返し、`limit` 回続いたらエラーにする
    pub fn check(&mut self, result: Result<Mat>) -> Result<Option<Mat>> {
        match result {
            Ok(frame) => {
                self.count = 0;
                Ok(Some(frame))
            }
            Err(e) => {
                self.count += 1;
                log::warn!("{:#}", e);
                if self.count >= self.limit {
                    return Err(e.context(format!(
                        "カメラからフレームを取得できません（{}回連続で失敗）",
                        self.count
                    )));
                }
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_read_failures_gives_up_after_limit() {
        let mut failures = ReadFailures::with_limit(3);
        assert!(failures.check(Err(anyhow!("no frame"))).unwrap().is_none());
        assert!(failures.check(Err(anyhow!("no frame"))).unwrap().is_none());

        let err = failures.check(Err(anyhow!("no frame"))).unwrap_err();
        let message = format!("{:#}", err);
        assert!(message.contains("3回連続"));
        assert!(message.contains("no frame"));
    }

    #[test]
    fn test_read_failures_reset_on_success() {
        let mut failures = ReadFailures::with_limit(2);
        assert!(failures.check(Err(anyhow!("no frame"))).unwrap().is_none());
        assert!(failures.check(Ok(Mat::default())).unwrap().is_some());
        assert!(failures.check(Err(anyhow!("no frame"))).unwrap().is_none());
    }

    #[test]
    fn test_default_limit() {
        let mut failures = ReadFailures::default();
        for _ in 1..MAX_READ_FAILURES {
            assert!(failures.check(Err(anyhow!("no frame"))).unwrap().is_none());
        }
        assert!(failures.check(Err(anyhow!("no frame"))).is_err());
    }
}
