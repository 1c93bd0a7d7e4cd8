//! Modelos del sistema
//!
//! Este módulo contiene los modelos de datos del pipeline: el registro
//! canónico de telemetría y las filas que mapean al schema PostgreSQL.

pub mod telemetry;

pub use telemetry::*;
