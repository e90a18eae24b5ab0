use anyhow::{Context, Result};
use infinisvc::{platform, Heartbeat, ServiceConfig, ServiceController, ServiceManager};
use log::{debug, error, info};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_SERVICE_NAME: &str = "infinisvc";
const DEFAULT_HEARTBEAT_SECS: u64 = 30;
/// Option key for the sample workload's interval
const HEARTBEAT_OPTION: &str = "HeartbeatSeconds";

const COMMANDS: &[&str] = &["install", "uninstall", "start", "stop", "restart", "status", "run"];

#[derive(Debug, Default)]
struct Args {
    command: Option<String>,
    config_path: Option<PathBuf>,
    name: Option<String>,
    display_name: Option<String>,
    restart_on_failure: bool,
    debug: bool,
    help: bool,
    version: bool,
}

impl Args {
    fn parse(args: &[String]) -> Result<Self> {
        let mut parsed = Args::default();
        let mut iter = args.iter().skip(1);
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--help" | "-h" => parsed.help = true,
                "--version" | "-v" => parsed.version = true,
                "--debug" => parsed.debug = true,
                "--restart-on-failure" => parsed.restart_on_failure = true,
                "--config" => {
                    let value = iter.next().context("--config requires a path")?;
                    parsed.config_path = Some(PathBuf::from(value));
                }
                "--name" => {
                    parsed.name = Some(iter.next().context("--name requires a value")?.clone());
                }
                "--display-name" => {
                    parsed.display_name =
                        Some(iter.next().context("--display-name requires a value")?.clone());
                }
                command if COMMANDS.contains(&command) && parsed.command.is_none() => {
                    parsed.command = Some(command.to_string());
                }
                other => anyhow::bail!("Unknown argument: {}. Use --help for usage.", other),
            }
        }

        if parsed.config_path.is_none() {
            parsed.config_path = env::var("INFINISVC_CONFIG").ok().map(PathBuf::from);
        }
        if parsed.name.is_none() {
            parsed.name = env::var("INFINISVC_NAME").ok();
        }
        Ok(parsed)
    }

    /// Build the service configuration from the config file and flags
    fn service_config(&self) -> Result<ServiceConfig> {
        let mut config = match &self.config_path {
            Some(path) => ServiceConfig::load(path)?,
            None => ServiceConfig::new(self.name.as_deref().unwrap_or(DEFAULT_SERVICE_NAME)),
        };
        if let (Some(name), Some(_)) = (&self.name, &self.config_path) {
            config.name = name.clone();
        }
        if let Some(display_name) = &self.display_name {
            config = config.with_display_name(display_name.clone());
        }
        if self.restart_on_failure {
            config = config.with_restart_on_failure(true);
        }
        if config.arguments.is_empty() {
            config.arguments = self.launch_arguments(&config.name);
        }
        Ok(config)
    }

    /// Arguments the service manager passes when it launches the binary
    fn launch_arguments(&self, name: &str) -> Vec<String> {
        let mut arguments = vec!["run".to_string(), "--name".to_string(), name.to_string()];
        if let Some(path) = &self.config_path {
            arguments.push("--config".to_string());
            arguments.push(path.display().to_string());
        }
        if self.debug {
            arguments.push("--debug".to_string());
        }
        arguments
    }
}

fn print_help(program: &str) {
    println!("infinisvc - service lifecycle controller");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("\nUsage: {} <COMMAND> [OPTIONS]\n", program);
    println!("Commands:");
    println!("  install      Register the service with the service manager");
    println!("  uninstall    Stop and remove the service");
    println!("  start        Start the installed service");
    println!("  stop         Stop the service, terminating it if it hangs");
    println!("  restart      Stop then start the service");
    println!("  status       Print the service state");
    println!("  run          Run the service (default)");
    println!("\nOptions:");
    println!("  --config <path>          Load the service configuration from a JSON file");
    println!("  --name <name>            Service name (default: {})", DEFAULT_SERVICE_NAME);
    println!("  --display-name <name>    Display name shown by the service manager");
    println!("  --restart-on-failure     Restart the service automatically when it fails");
    println!("  --debug                  Enable debug logging");
    println!("  --help, -h               Show this help message");
    println!("  --version, -v            Show version information");
    println!("\nEnvironment Variables:");
    println!("  INFINISVC_CONFIG=<path>  Configuration file");
    println!("  INFINISVC_NAME=<name>    Service name");
    println!("  RUST_LOG=<level>         Set log level (error|warn|info|debug)");
}

fn init_logging(debug_mode: bool) {
    if debug_mode {
        env::set_var("RUST_LOG", "debug");
    } else if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "info");
    }
    // The service entry point runs in this process, so this covers it too
    env_logger::init();
}

#[cfg(target_os = "windows")]
fn service_manager() -> Arc<dyn ServiceManager> {
    Arc::new(infinisvc::WindowsServiceManager::new())
}

#[cfg(not(target_os = "windows"))]
fn service_manager() -> Arc<dyn ServiceManager> {
    Arc::new(infinisvc::InMemoryManager::new())
}

#[tokio::main]
async fn main() -> Result<()> {
    let raw_args: Vec<String> = env::args().collect();
    let args = Args::parse(&raw_args)?;

    if args.version {
        println!("infinisvc {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }
    if args.help {
        print_help(raw_args.first().map(String::as_str).unwrap_or("infinisvc"));
        return Ok(());
    }

    init_logging(args.debug);
    debug!("Command line args: {:?}", raw_args);

    let config = args.service_config()?;
    let interactive = platform::detect_interactive()?;
    let interval = config
        .options
        .get(HEARTBEAT_OPTION)
        .and_then(|v| v.as_u64())
        .unwrap_or(DEFAULT_HEARTBEAT_SECS);
    let workload = Arc::new(Heartbeat::new(Duration::from_secs(interval)));
    let controller = ServiceController::new(service_manager(), workload, config, interactive);
    debug!("Platform: {}, interactive: {}", controller.platform(), interactive);

    let command = args.command.as_deref().unwrap_or("run");
    if command != "run" && cfg!(not(target_os = "windows")) {
        anyhow::bail!(
            "'{}' needs a native service manager, only 'run' is available on {}",
            command,
            env::consts::OS
        );
    }

    let result = match command {
        "install" => controller.install(),
        "uninstall" => controller.uninstall().await,
        "start" => controller.start(),
        "stop" => controller.stop().await,
        "restart" => controller.restart().await,
        "status" => {
            println!("{}: {}", controller, controller.status());
            Ok(())
        }
        _ => {
            info!("Starting {}", controller);
            controller.run().await
        }
    };

    if let Err(e) = result {
        error!("{} {} failed: {}", command, controller, e);
        return Err(e.into());
    }
    if command != "status" && command != "run" {
        println!("{} {}: done", command, controller);
    }
    Ok(())
}
