//! Pipeline de ingesta y normalización de telemetría GPS
//!
//! Cliente del API de rastreo vehicular (GPSBuddy), persistencia de último
//! estado + historial append-only y señales derivadas (contadores diarios,
//! alertas de velocidad, segmentación de manejo/parada). La capa web y el
//! scheduler que dispara los ciclos son colaboradores externos.

pub mod clients;
pub mod config;
pub mod models;
pub mod repositories;
pub mod services;
pub mod utils;
