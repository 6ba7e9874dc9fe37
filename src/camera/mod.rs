pub mod capture;

pub use capture::{OpenCvCamera, ReadFailures, MAX_READ_FAILURES};
