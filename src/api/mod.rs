//! HTTP surface: bearer authentication and the reporting endpoints.

pub mod auth;
pub mod rest;
