pub mod command;
pub mod docker;
pub mod files;
pub mod servers;
pub mod systemd;

pub use command::{RunLocalCommand, RunRemoteCommand};
pub use docker::{DockerLogs, DockerPs};
pub use files::ReadFile;
pub use servers::ListServers;
pub use systemd::{ServiceJournal, ServiceStatus};

use super::Capability;

/// Every built-in capability, in registration order.
pub fn all() -> Vec<Box<dyn Capability>> {
    vec![
        Box::new(RunLocalCommand),
        Box::new(RunRemoteCommand),
        Box::new(ReadFile),
        Box::new(DockerPs),
        Box::new(DockerLogs),
        Box::new(ServiceStatus),
        Box::new(ServiceJournal),
        Box::new(ListServers),
    ]
}
