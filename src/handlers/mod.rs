pub mod admin;
pub mod assessments;
pub mod attempts;
pub mod auth;
pub mod grading;
