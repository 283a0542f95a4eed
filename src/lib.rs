//! # Gate Core - WebAssembly Instance Orchestration Server
//!
//! Server core for running untrusted WebAssembly programs as persistent,
//! suspendable, snapshottable sandboxed instances:
//! - Program/instance model with explicit reference counting
//! - Per-principal accounts with pinned programs and owned instances
//! - Instance state machine (create → run → suspend/resume → snapshot → terminate)
//! - Per-instance driver tasks executing sandboxed processes to completion
//! - Module source resolution with an advisory URI→hash cache
//! - Event monitor covering every mutating operation
//!
//! ## Architecture
//!
//! The server follows a single-lock model where the `Server` owns all
//! identity-level state:
//! ```text
//!                   ┌────────────────────────────────────┐
//!   API requests →  │            Server                  │
//!                   │  ┌──────────┐ ┌──────────┐         │
//!                   │  │ Programs │ │ Accounts │         │
//!                   │  │ (refcnt) │ │ (pins)   │         │
//!                   │  └──────────┘ └──────────┘         │
//!                   │  ┌──────────┐ ┌──────────┐         │
//!                   │  │Instances │ │ Driver   │ → tasks │
//!                   │  │ (own mu) │ │ loops    │         │
//!                   │  └──────────┘ └──────────┘         │
//!                   └────────────────────────────────────┘
//! ```
//!
//! Compilation, sandbox execution, image persistence, and module sources are
//! external collaborators behind traits; in-memory defaults are provided.

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

// Re-export public API
pub mod api;
pub mod builder;
pub mod image;
pub mod runtime;
pub mod server;
pub mod trap;
pub mod types;

// Internal utilities
pub mod observability;

pub use server::Server;
pub use types::{Config, Error, Result};
