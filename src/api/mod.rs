//! HTTP surface for dashboard consumers.

pub mod rest;

pub use rest::{ApiResponse, RestApi};
