// src/exam/mod.rs

pub mod autosave;
pub mod scoring;
pub mod session;
pub mod violation;
