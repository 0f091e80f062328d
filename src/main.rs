#![allow(warnings)]

mod app;
mod assets;
mod common;
mod consts;
mod graphics;
mod selftest;
mod settings;
mod world;

use std::path::PathBuf;
use std::process::ExitCode;

use structopt::StructOpt;

use crate::app::{App, AppOptions};

#[derive(StructOpt, Debug)]
#[structopt(name = "yave", about = "yave editor host")]
struct Options {
    /// Disable API validation regardless of build profile.
    #[structopt(long = "no-debug")]
    no_debug: bool,

    /// Run without a presentation surface.
    #[structopt(long)]
    headless: bool,

    /// Run the built-in self tests and exit.
    #[structopt(long = "run-tests")]
    run_tests: bool,

    /// Scene to load on startup.
    #[structopt(parse(from_os_str))]
    scene: Option<PathBuf>,
}

fn init_logger() {
    let default_level = log::LevelFilter::Info;
    env_logger::builder()
        .filter_level(
            std::env::var(env_logger::DEFAULT_FILTER_ENV)
                .ok()
                .and_then(|filter| filter.parse().ok())
                .unwrap_or(default_level),
        )
        .init();
}

fn install_panic_hook() {
    std::panic::set_hook(Box::new(|panic_info| {
        let location = panic_info
            .location()
            .map(|location| location.to_string())
            .unwrap_or_else(|| "unknown location".to_string());

        let message = if let Some(s) = panic_info.payload().downcast_ref::<&'static str>() {
            s.to_string()
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };

        log::error!("Panic at {}: {}", location, message);
        if std::env::var("RUST_BACKTRACE").map_or(false, |env| env == "1") {
            for line in std::backtrace::Backtrace::capture().to_string().lines() {
                log::error!("{}", line);
            }
        } else {
            log::error!("Backtrace is disabled, enable it with RUST_BACKTRACE=1");
        }
        std::process::exit(1);
    }));
}

fn main() -> ExitCode {
    init_logger();
    install_panic_hook();

    let options = Options::from_args();

    let mut app = match App::new(&AppOptions {
        no_debug: options.no_debug,
        headless: options.headless,
    }) {
        Ok(app) => app,
        Err(e) => {
            log::error!("Device initialization failed: {}", e);
            return ExitCode::from(2);
        }
    };

    if let Some(scene) = &options.scene {
        if let Err(e) = app.load_scene(scene) {
            log::error!("Failed to load scene {}: {}", scene.display(), e);
            return ExitCode::from(3);
        }
    }

    if options.run_tests {
        if let Err(e) = selftest::run_self_tests() {
            log::error!("Self tests failed: {:#}", e);
            return ExitCode::from(4);
        }
        app.shutdown();
        return ExitCode::SUCCESS;
    }

    if let Err(e) = app.run() {
        log::error!("Runtime error: {:#}", e);
    }
    app.shutdown();
    ExitCode::SUCCESS
}
