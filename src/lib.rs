//! Meal Zone Guard
//!
//! Resilience layer between a meal-logging application and a hosted vision and
//! text inference service. Photos are validated and compressed before any paid
//! call, calls are admitted per caller and traffic class, every call feeds a
//! health score, and ingredients left unzoned by a failed classification are
//! retried in the background with exponential backoff.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
