//! Work queues, one per subcommand, built on [`work`].

pub mod detect;
pub mod process;
pub mod search;
pub mod summarize;
pub mod work;
