//! Repositorios de persistencia
//!
//! Este módulo contiene el acceso a PostgreSQL del pipeline: último estado
//! conocido, historial append-only y sus consultas.

pub mod telemetry_repository;

pub use telemetry_repository::*;
