extern crate p11bridge;

use p11bridge::cli::Options;
use p11bridge::constants::P11_PROBE_APP;

fn main() {
    let options = Options::from_args();

    let config = match options.config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            ::std::process::exit(1);
        }
    };

    if let Err(e) = config.init_logging() {
        eprintln!("{}", e);
        ::std::process::exit(1);
    }

    match options.run(&config) {
        Ok(report) => print!("{}", report),
        Err(e) => {
            eprintln!("{}: {}", P11_PROBE_APP, e);
            ::std::process::exit(1);
        }
    }
}
