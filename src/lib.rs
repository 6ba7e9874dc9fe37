pub mod board;
pub mod calibration;
pub mod camera;
pub mod camera_params;
pub mod config;
pub mod detection;
pub mod detector_params;
pub mod render;

/// RUST_LOG 未指定時は info レベルで出力
pub fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}
