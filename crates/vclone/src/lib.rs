//! # vclone – vSphere clone orchestration
//!
//! Provisions VMs on vCenter by cloning a template or source VM (full,
//! linked or instant), reconfiguring its network adapters and hardware,
//! customizing the guest OS and waiting until the guest reports a usable
//! IPv4 address.
//!
//! ## Modules
//!
//! - **types** — VIM data objects (MoRefs, devices, specs, guest info)
//! - **error** — Crate error type and kinds
//! - **vsphere** — VI/JSON HTTP client with session-based auth
//! - **platform** — `Platform` trait and its vCenter implementation
//! - **sim** — In-memory platform used by the tests
//! - **context** — Per-run deadline / cancellation and bounded polling
//! - **request** — Declarative clone request
//! - **network** — Network change planner
//! - **customization** — Linux / Windows guest customization specs
//! - **reconfig** — Annotation, CPU, memory, disks and guestinfo changes
//! - **guest_ops** — Scripts inside the guest through VMware Tools
//! - **discovery** — Active and standard IP discovery
//! - **benchmark** — Per-run timing checkpoints appended to CSV
//! - **clone** — Clone orchestrator state machine
//! - **service** — Create / destroy facade

pub mod types;
pub mod error;
pub mod vsphere;
pub mod platform;
pub mod sim;
pub mod context;
pub mod request;
pub mod network;
pub mod customization;
pub mod reconfig;
pub mod guest_ops;
pub mod discovery;
pub mod benchmark;
pub mod clone;
pub mod service;

pub use clone::{CloneOutcome, CloneRun, CloneState};
pub use error::{CloneError, CloneErrorKind, CloneResult};
pub use request::{CloneRequest, CloneStrategy};
pub use service::CloneService;
