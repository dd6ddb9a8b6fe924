//! Fixed ports used by the farm topology.
//!
//! Host ports published for agent and web-server containers are allocated at
//! config time (see [`crate::config::derive::PortAllocator`]); the values here
//! are the fixed endpoints inside containers and the scan starting points.

// ============================================================================
// Container-side ports
// ============================================================================

/// sshd inside every container and on every host.
pub const PORT_SSH: u16 = 22;

/// HTTP server inside web-server containers.
pub const PORT_HTTP: u16 = 80;

/// Jenkins web interface inside the master container.
pub const PORT_JENKINS_WEB: u16 = 8080;

// ============================================================================
// Host-side allocation
// ============================================================================

/// First candidate for published ssh ports. The host's own sshd owns it, so
/// the first container ssh port is the next free one.
pub const BASE_SSH_PORT: u16 = PORT_SSH;

/// First candidate for published web ports.
pub const BASE_WEB_PORT: u16 = PORT_HTTP;

/// Host port the master publishes its web interface on.
pub const MASTER_WEB_PORT: u16 = PORT_JENKINS_WEB;
