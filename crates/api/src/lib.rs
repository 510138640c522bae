//! HTTP API and process wiring for the document analysis service.

pub mod app;
