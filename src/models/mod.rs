// src/models/mod.rs

pub mod assessment;
pub mod assignment;
pub mod grade;
pub mod question;
pub mod user;
