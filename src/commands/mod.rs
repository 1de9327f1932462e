pub mod check_config;
pub mod run;

pub use check_config::handle_check_config;
pub use run::handle_run;
