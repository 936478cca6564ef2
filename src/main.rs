#[macro_use] extern crate clap;
#[macro_use] extern crate log;

use std::env::current_dir;
use std::process::exit;
use clap::App;
use srx_server::{operation, Config, ExitError};

// Since `main` with a result insists on printing a message, but in our
// case all diagnostics have been logged by the time an error arrives, we
// use our own, more quiet version.
fn _main() -> Result<(), ExitError> {
    if srx_server::config::init_logging().is_err() {
        return Err(ExitError::Runtime);
    }
    let cur_dir = match current_dir() {
        Ok(dir) => dir,
        Err(err) => {
            eprintln!(
                "Fatal: cannot get current directory ({}). Aborting.",
                err
            );
            return Err(ExitError::Runtime);
        }
    };
    let matches = Config::config_args(
        App::new("srx-server")
            .version(crate_version!())
            .author(crate_authors!())
            .about("validates BGP updates for attached routers")
    ).get_matches();
    let config = match Config::from_arg_matches(&matches, &cur_dir) {
        Ok(config) => config,
        Err(_) => {
            error!("Fatal: broken configuration. Aborting.");
            return Err(ExitError::Config);
        }
    };
    operation::run(config)
}

fn main() {
    match _main() {
        Ok(()) => exit(0),
        Err(err) => exit(err.exit_code()),
    }
}
