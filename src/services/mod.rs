pub mod attempts;
pub mod grading;
