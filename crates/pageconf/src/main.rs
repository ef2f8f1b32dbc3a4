//! Pageconf.
//!
//! Pageconf loads page configurations from an upstream backend and keeps them in a local cache.
//! Cached configurations are revalidated with ETags, and served stale when the backend cannot be
//! reached. The binary exposes the loader over a small HTTP server and on the command line.

#![warn(missing_debug_implementations, clippy::all)]

mod cli;
mod endpoints;
mod logging;
mod server;


fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
