// The Core daemon: owns the process registry and both listener sockets,
// dispatches Tray and GUI commands against the registry, and talks to the
// process-manager collaborator that actually spawns and signals processes.

pub mod catalog;
pub mod config;
pub mod dispatcher;
pub mod process;
pub mod registry;
pub mod server;
