//! CLI command implementations.

pub mod compose;
pub mod create;
pub mod exec;
pub mod flags;
pub mod image;
pub mod inspect;
pub mod internal;
pub mod kill;
pub mod logs;
pub mod network;
pub mod pause;
pub mod port;
pub mod ps;
pub mod rm;
pub mod run;
pub mod start;
pub mod stop;
pub mod volume;
pub mod wait;
