pub mod cache;
pub mod controller;
pub mod crd;
pub mod domain;
pub mod enforcement_loop;
pub mod error;
pub mod extender;
pub mod registry;
pub mod telemetry;
