//! Pagekeeper.
//!
//! Pagekeeper fetches documents from remote origins and maintains the caches that back their
//! rendering. This binary exposes the maintenance side: cleaning up cache directories and
//! fetching single documents through the resilient downloader.

#![warn(missing_debug_implementations, clippy::all)]

mod cli;
mod logging;

fn main() {
    match cli::execute() {
        Ok(code) => std::process::exit(code),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
