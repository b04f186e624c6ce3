//! # Services
//!
//! Typed operations for connection configuration, dynamic roles and static
//! roles. A dispatch layer (HTTP, CLI, plugin RPC) calls these with parsed
//! arguments; no transport concerns live here.

pub mod connections;
pub mod roles;

pub use connections::{ConnectionService, ConnectionWriteRequest};
pub use roles::{
    DynamicRoleRequest, Lease, RoleService, StaticCredentials, StaticRoleRequest, StaticRoleStatus,
};
