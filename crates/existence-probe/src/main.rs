//! Checks whether icons exist at an origin, going through the existence cache.

use existence_cache::logging;

mod cli;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
