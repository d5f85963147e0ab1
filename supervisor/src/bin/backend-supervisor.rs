use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use backend_supervisor::config::DeploymentConfig;
use backend_supervisor::health::Health;
use backend_supervisor::orchestrator::{
    self, Context, ManagerError, StartOptions, StatusReport,
};

/// Backend fleet manager: launches server instances behind a generated
/// reverse-proxy gateway and tracks them across invocations via PID files.
#[derive(Parser, Debug)]
#[command(name = "backend-supervisor", about = "Backend fleet manager", long_about = None)]
struct Cli {
    /// Print per-step details to stdout.
    #[arg(long, global = true)]
    verbose: bool,

    /// Directory holding pids/, logs/ and the rendered gateway config.
    #[arg(long, global = true, default_value = ".")]
    work_root: PathBuf,

    /// Server executable launched for every instance.
    #[arg(long, global = true, default_value = "backend-server")]
    server_bin: PathBuf,

    /// Reverse-proxy gateway executable.
    #[arg(long, global = true, default_value = "nginx")]
    gateway_bin: PathBuf,

    /// Seconds to wait for each instance to become healthy.
    #[arg(long, global = true, default_value_t = 15)]
    health_timeout: u64,

    /// Seconds to wait for ports to be released during stop.
    #[arg(long, global = true, default_value_t = 2)]
    port_wait: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Launch the fleet and the gateway.
    Start {
        #[arg(default_value = "dev-config.yaml")]
        config_path: PathBuf,

        /// Re-render the gateway config even if one exists.
        #[arg(long)]
        generate_gateway: bool,

        /// Run the gateway's config check before launching anything.
        #[arg(long)]
        validate: bool,

        /// Stay attached and stop the fleet on SIGINT/SIGTERM.
        #[arg(long)]
        foreground: bool,

        /// Fail instead of evicting processes holding configured ports.
        #[arg(long)]
        no_evict: bool,
    },
    /// Stop everything tracked by PID files.
    Stop {
        #[arg(default_value = "dev-config.yaml")]
        config_path: PathBuf,

        /// Grace period in seconds before force-killing.
        #[arg(long, default_value_t = 3)]
        timeout: u64,
    },
    /// Report liveness and health of the fleet.
    Status {
        #[arg(default_value = "dev-config.yaml")]
        config_path: PathBuf,
    },
    /// Stop then start, reusing the loaded config.
    Restart {
        #[arg(default_value = "dev-config.yaml")]
        config_path: PathBuf,

        /// Re-render the gateway config even if one exists.
        #[arg(long)]
        generate_gateway: bool,

        /// Run the gateway's config check before launching anything.
        #[arg(long)]
        validate: bool,

        /// Stay attached and stop the fleet on SIGINT/SIGTERM.
        #[arg(long)]
        foreground: bool,

        /// Fail instead of evicting processes holding configured ports.
        #[arg(long)]
        no_evict: bool,

        /// Grace period in seconds before force-killing.
        #[arg(long, default_value_t = 3)]
        timeout: u64,
    },
    /// Render the gateway config and exit without touching any process.
    GenGatewayConfig {
        #[arg(default_value = "dev-config.yaml")]
        config_path: PathBuf,

        /// Output path for the rendered config.
        #[arg(short, long, default_value = "gateway.conf")]
        output: PathBuf,

        /// Run the gateway's config check on the rendered file.
        #[arg(long)]
        validate: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(if cli.verbose {
        "debug"
    } else {
        "info"
    }))
    .init();

    let verbose = cli.verbose;
    let code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err}");
            if verbose {
                println!("{err:?}");
            }
            err.exit_code()
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32, ManagerError> {
    let mut ctx = Context::new(cli.work_root);
    ctx.server_bin = cli.server_bin;
    ctx.gateway_bin = cli.gateway_bin;
    // Probes run on a fixed 500 ms cadence; two attempts per second.
    ctx.health_attempts = (cli.health_timeout.max(1) as usize) * 2;
    ctx.port_free_timeout = Duration::from_secs(cli.port_wait.max(1));

    match cli.command {
        Commands::Start {
            config_path,
            generate_gateway,
            validate,
            foreground,
            no_evict,
        } => {
            ctx.evict = !no_evict;
            let config = DeploymentConfig::load(&config_path)?;
            let opts = StartOptions {
                generate_gateway,
                validate,
            };
            start_fleet(&ctx, &config, &opts, foreground).await?;
            Ok(0)
        }
        Commands::Stop {
            config_path,
            timeout,
        } => {
            let config = DeploymentConfig::load(&config_path)?;
            orchestrator::stop(&ctx, &config, stop_timeout(timeout)).await?;
            Ok(0)
        }
        Commands::Status { config_path } => {
            let config = DeploymentConfig::load(&config_path)?;
            let report = orchestrator::status(&ctx, &config).await?;
            print_status(&report);
            Ok(report.exit_code())
        }
        Commands::Restart {
            config_path,
            generate_gateway,
            validate,
            foreground,
            no_evict,
            timeout,
        } => {
            ctx.evict = !no_evict;
            let config = DeploymentConfig::load(&config_path)?;
            let opts = StartOptions {
                generate_gateway,
                validate,
            };
            orchestrator::stop(&ctx, &config, stop_timeout(timeout)).await?;
            start_fleet(&ctx, &config, &opts, foreground).await?;
            Ok(0)
        }
        Commands::GenGatewayConfig {
            config_path,
            output,
            validate,
        } => {
            let config = DeploymentConfig::load(&config_path)?;
            orchestrator::gen_gateway_config(&ctx, &config, &output, validate).await?;
            Ok(0)
        }
    }
}

fn stop_timeout(seconds: u64) -> Duration {
    Duration::from_secs(seconds.max(1))
}

/// Runs the start machine; in foreground mode a signal during startup
/// abandons the launch and tears down whatever was already spawned, and a
/// completed startup waits for the shutdown signal.
async fn start_fleet(
    ctx: &Context,
    config: &DeploymentConfig,
    opts: &StartOptions,
    foreground: bool,
) -> Result<(), ManagerError> {
    if !foreground {
        return orchestrator::start(ctx, config, opts).await;
    }

    tokio::select! {
        result = orchestrator::start(ctx, config, opts) => result?,
        _ = tokio::signal::ctrl_c() => {
            log::warn!("interrupted during startup, tearing down");
            return orchestrator::stop(ctx, config, ctx.terminate_timeout).await;
        }
    }
    orchestrator::run_foreground(ctx, config, ctx.terminate_timeout).await
}

fn print_status(report: &StatusReport) {
    let width = report
        .entries
        .iter()
        .map(|entry| entry.name.len())
        .max()
        .unwrap_or(0);
    for entry in &report.entries {
        let pid = entry
            .pid
            .map_or_else(|| "-".to_string(), |pid| pid.to_string());
        let state = if entry.alive { "running" } else { "down" };
        let health = match entry.health {
            Some(Health::Healthy) => "healthy",
            Some(Health::Unhealthy) => "unhealthy",
            Some(Health::Unreachable) => "unreachable",
            None => "-",
        };
        println!("{:width$}  pid {:>8}  {:7}  {}", entry.name, pid, state, health);
    }
}
