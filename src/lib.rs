//! Race lifecycle service: scheduling, live progress, ranks and push fan-out for step races.

pub mod config;
pub mod dao;
pub mod dto;
pub mod error;
pub mod routes;
pub mod services;
pub mod state;
