//! Weave CLI library: the command implementations behind the `weave` binary,
//! exposed so they can be exercised without spawning a process.

pub mod commands;
