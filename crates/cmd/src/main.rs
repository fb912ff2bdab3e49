// Copyright 2025 cloudpool contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{path::PathBuf, sync::Arc};

use clap::{Args, Parser, Subcommand};
use cloudpool_cloud::DriverRegistry;
use cloudpool_common_telemetry::{LoggingOptions, TracingOptions, init_global_logging, set_panic_hook};
use cloudpool_pool::{Pool, PoolConfig, SystemClock};
use cloudpool_server::{ManagementServerConfig, start_management_server};
use serde::Deserialize;
use snafu::{ResultExt, Whatever};
use tracing::info;

mod build_info;

#[derive(Debug, Parser)]
#[clap(name = "cloudpool", about = "cloudpool-cmd", author = build_info::AUTHOR, version = build_info::VERSION)]
struct Cli {
    #[command(subcommand)]
    commands: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Hello(HelloArgs),
    Server(ServerArgs),
}

#[derive(Debug, Clone, Args)]
#[command(long_about = "Print a greeting and exit. Useful for smoke-testing the binary.")]
struct HelloArgs {}

impl HelloArgs {
    fn run(&self) -> Result<(), Whatever> {
        println!("cloudpool {}", build_info::VERSION);
        Ok(())
    }
}

#[derive(Debug, Clone, Args)]
#[command(long_about = "Starts the dispatcher: the worker pool's background loops plus its management HTTP server.")]
struct ServerArgs {
    /// Path to a TOML configuration file (see `AppConfig` for the shape).
    #[arg(long, short)]
    config: PathBuf,
}

/// The binary's on-disk configuration: the pool's own configuration plus the
/// ambient concerns the pool crate itself has no opinion on.
#[derive(Debug, Clone, Deserialize)]
struct AppConfig {
    pool: PoolConfig,
    #[serde(default)]
    management: ManagementServerConfig,
    #[serde(default)]
    logging: LoggingOptions,
    #[serde(default)]
    tracing: TracingOptions,
}

impl ServerArgs {
    async fn run(&self) -> Result<(), Whatever> {
        let contents = tokio::fs::read_to_string(&self.config)
            .await
            .with_whatever_context(|_| format!("failed to read config file {:?}", self.config))?;
        let config: AppConfig = toml::from_str(&contents).with_whatever_context(|_| "failed to parse config file".to_string())?;

        let _guards = init_global_logging("cloudpool", &config.logging, &config.tracing, None);
        set_panic_hook();
        info!(driver = %config.pool.driver, "cloudpool starting");

        let registry = DriverRegistry::new();
        register_drivers(&registry)?;
        registry.seal();

        let instance_set = registry
            .build(&config.pool.driver, &config.pool.driver_parameters)
            .with_whatever_context(|_| format!("failed to build driver {:?}", config.pool.driver))?;
        let executor_factory = build_executor_factory()?;

        let pool = Pool::new(config.pool, instance_set, executor_factory, Arc::new(SystemClock));
        pool.start_background_loops();

        let mut server_handle = start_management_server(config.management, pool.clone()).await.whatever_context("failed to start management server")?;
        server_handle.wait_for_start().await;
        info!("cloudpool started");

        shutdown_signal().await;
        info!("cloudpool shutting down");

        pool.stop();
        server_handle.shutdown();
        server_handle.wait_for_stop().await;
        info!("cloudpool stopped");
        Ok(())
    }
}

/// Registers every cloud driver this binary ships with. Real cloud drivers
/// (EC2, GCE, Azure, ...) are outside this workspace's scope; the only driver
/// available here is the in-memory fake, gated behind the `demo` feature so a
/// release build doesn't silently accept a driver name that does nothing.
#[cfg(feature = "demo")]
fn register_drivers(registry: &DriverRegistry) -> Result<(), Whatever> {
    use cloudpool_cloud::fake::FakeInstanceSet;

    registry
        .register("fake", std::sync::Arc::new(|_params: &std::collections::BTreeMap<String, String>| Ok(std::sync::Arc::new(FakeInstanceSet::new()) as _)))
        .whatever_context("failed to register fake driver")
}

#[cfg(not(feature = "demo"))]
fn register_drivers(_registry: &DriverRegistry) -> Result<(), Whatever> { Ok(()) }

#[cfg(feature = "demo")]
fn build_executor_factory() -> Result<Arc<dyn cloudpool_cloud::ExecutorFactory>, Whatever> {
    Ok(Arc::new(cloudpool_cloud::fake::FakeExecutorFactory::new()))
}

#[cfg(not(feature = "demo"))]
fn build_executor_factory() -> Result<Arc<dyn cloudpool_cloud::ExecutorFactory>, Whatever> {
    snafu::whatever!("no executor factory available: rebuild with --features demo, or embed cloudpool-pool directly and supply a real one")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).expect("failed to install signal handler").recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("received SIGINT"); },
        () = terminate => { info!("received SIGTERM"); },
    }
}

#[tokio::main]
async fn main() -> Result<(), Whatever> {
    let cli = Cli::parse();
    match cli.commands {
        Commands::Hello(ha) => ha.run(),
        Commands::Server(sa) => sa.run().await,
    }
}
