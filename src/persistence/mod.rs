//! # Persistence Module
//!
//! ## Why This Module Exists
//! The dashboard keeps its users, devices and measurements in an external
//! document store. This module defines the few lookups the rest of the
//! crate performs against it and the local session file that remembers who
//! is signed in.
//!
//! ## Key Abstractions
//! - **DocumentStore**: async collaborator trait; the reconciler writes device
//!   status through it and measurements are numbered and saved through it
//! - **MemoryStore**: in-process implementation for the console binary and tests
//! - **SessionFile**: TOML file holding the signed-in [`session::AppUser`]
//!
//! ## Error Handling Strategy
//! Store operations return [`store::StoreError`]. Session file I/O uses
//! `color_eyre` like the config file; a missing or corrupt session simply
//! reads as signed out.

pub mod session;
pub mod store;

pub use session::{sign_in, AppUser, SessionError, SessionFile};
pub use store::{DeviceRecord, DocumentStore, MemoryStore, StoreError, UserRecord};
