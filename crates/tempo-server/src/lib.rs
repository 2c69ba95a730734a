//! HTTP API for the scraping gateway: routes, DTOs, error mapping and the OpenAPI document.

pub mod dto;
pub mod error;
pub mod openapi;
pub mod routes;
pub mod state;
