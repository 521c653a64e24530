/// Participant bookkeeping, ranks and derived counters.
pub mod aggregator;
/// Post-commit notification delivery with dedup keys.
pub mod dispatcher;
/// OpenAPI documentation generation.
pub mod documentation;
/// Health check service.
pub mod health_service;
/// Side effects of race transitions and the notifications they produce.
pub mod lifecycle;
/// Externally triggered notification fan-out.
pub mod notification_service;
/// Push transports.
pub mod push;
/// User-facing race operations.
pub mod race_service;
/// Periodic time-driven transitions.
pub mod scheduler;
/// Server-Sent Events message generation.
pub mod sse_events;
/// Server-Sent Events streaming helpers.
pub mod sse_service;
/// Storage connection supervisor toggling degraded mode.
pub mod storage_supervisor;

#[cfg(test)]
pub(crate) mod testing;
