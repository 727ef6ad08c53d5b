pub mod severity;
pub mod alarm_state;
pub mod tree_path;
pub mod wire;
pub mod state_history;
pub mod scheduler;
pub mod delayed_transition;
pub mod alarm_logic;
pub mod value_source;
pub mod filter;
pub mod automated_actions;
pub mod alarm_tree;
pub mod alarm_node;
pub mod alarm_point;
pub mod server_model;
pub mod commands;
pub mod state_initializer;
pub mod client_model;
pub mod topic;
pub mod settings;

pub mod util {
    pub mod error;
}

#[cfg(feature = "systemd")]
mod systemd;

#[cfg(not(feature = "systemd"))]
mod no_systemd;

pub mod logging {
    #[cfg(feature = "systemd")]
    pub use crate::systemd::init_logging as init;
    #[cfg(not(feature = "systemd"))]
    pub use crate::no_systemd::init_logging as init;
}

pub mod daemon {
    #[cfg(feature = "systemd")]
    pub use crate::systemd::{add_args, exiting, ready, start, starting};
    #[cfg(not(feature = "systemd"))]
    pub use crate::no_systemd::{add_args, exiting, ready, start, starting};
}
