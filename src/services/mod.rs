//! Services module
//!
//! Este módulo contiene la lógica de negocio del pipeline: señales derivadas
//! (contadores diarios, excesos de velocidad), segmentación de manejo/parada,
//! el orquestador de refresh y el seam del sink de notificaciones.

pub mod notification_service;
pub mod refresh_service;
pub mod segment_service;
pub mod signal_service;

pub use notification_service::*;
pub use refresh_service::*;
pub use segment_service::*;
pub use signal_service::*;
