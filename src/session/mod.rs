//! Shell session engine
//!
//! Persistent shells driven through a prompt marker, the registry that holds
//! them, and the manager that sweeps idle or dead ones away.

mod driver;
mod manager;
mod registry;
mod result;
mod shell;

pub use manager::{ManagerError, SessionManager};
pub use registry::RegistryError;
pub use result::{CommandResult, SecurityInfo};
pub use shell::{SessionError, ShellSession};

#[cfg(test)]
pub use driver::ShellSpec;
#[cfg(test)]
pub use manager::ManagerSettings;
#[cfg(test)]
pub use result::CommandStatus;
