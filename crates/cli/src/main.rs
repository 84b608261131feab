//! stowage CLI application

use stowage_cli::cli::{self, EXIT_OK, exit_code_for, render_error};
use stowage_cli::commands::{self, Environment};
use stowage_cli::config::StowageConfig;
use stowage_cli::tracing::{TracingConfig, init_tracing};

fn main() {
    // Tracing may be unusable while panicking, write straight to stderr
    #[allow(clippy::print_stderr)]
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("Application panicked: {panic_info}");
        eprintln!("Internal error occurred. Run with RUST_LOG=debug for more information.");
    }));

    let cli = cli::parse();
    let json = cli.json;

    if let Err(error) = init_tracing(TracingConfig {
        format: cli.log_format,
        level: cli.level.into(),
        filter: None,
    }) {
        #[allow(clippy::print_stderr)]
        {
            eprintln!("{error:?}");
        }
    }

    let result = StowageConfig::load(cli.config.as_deref())
        .and_then(|config| {
            Environment::resolve(config, cli.cache_dir.as_deref(), cli.remote_dir.as_deref())
        })
        .and_then(|env| commands::execute(cli.command, &env))
        .and_then(|report| report.print(json));

    let code = match result {
        Ok(()) => EXIT_OK,
        Err(error) => {
            let code = exit_code_for(&error);
            render_error(error, json);
            code
        }
    };
    std::process::exit(code);
}
