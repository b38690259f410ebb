// Copyright takubokudori.
// This source code is licensed under the MIT or Apache-2.0 license.
//! Process entry point: environment config, logger, composition root.
use anyhow::Context;
use std::{process::ExitCode, sync::Arc, time::Duration};
use vboxmcp::config::{BackendKind, Config};
use vboxmcp::exec::{CommandExecutor, Program};
use vboxmcp::manager::VmManager;
use vboxmcp::ops::Coordinator;
use vboxmcp::registry::ToolContext;
use vboxmcp::server::McpServer;
use vboxmcp::types::Hypervisor;
use vboxmcp::{hyperv::HyperVCmd, tools, virtualbox::VBoxManage};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> ExitCode {
    // Config problems are fatal before we ever touch stdio.
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("vboxmcp: invalid configuration: {}", e);
            return ExitCode::from(1);
        }
    };
    // stderr only; stdout belongs to the protocol.
    env_logger::Builder::new()
        .filter_level(config.log_level)
        .init();

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("fatal: {:#}", e);
            ExitCode::from(2)
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    if config.degraded() {
        log::warn!(
            "hypervisor CLI not found; running degraded (read tools only)"
        );
    } else {
        log::info!(
            "using {:?} backend at {:?}",
            config.backend,
            config.hypervisor_path
        );
    }

    let mut executor = CommandExecutor::new();
    if let Some(path) = &config.hypervisor_path {
        let program = match config.backend {
            BackendKind::VirtualBox => Program::VBoxManage,
            BackendKind::HyperV => Program::PowerShell,
        };
        executor = executor.program_path(program, path.clone());
    }
    let executor = Arc::new(executor);

    let backend: Arc<dyn Hypervisor> = match config.backend {
        BackendKind::VirtualBox => Arc::new(
            VBoxManage::new(executor).timeout(config.default_timeout),
        ),
        BackendKind::HyperV => Arc::new(
            HyperVCmd::new(executor).timeout(config.default_timeout),
        ),
    };

    let manager = Arc::new(VmManager::new(backend, config.default_timeout));
    let coordinator = Arc::new(Coordinator::new(
        manager.clone(),
        config.worker_pool_size,
        config.metric_interval,
    ));
    let registry = tools::build_registry(config.degraded());
    let ctx = Arc::new(ToolContext {
        manager,
        coordinator: coordinator.clone(),
        config: Arc::new(config),
    });
    let server = McpServer::new(registry, ctx);

    server
        .serve(tokio::io::stdin(), tokio::io::stdout())
        .await
        .context("rpc loop failed")?;

    // EOF: drain what is still in flight, then leave cleanly.
    coordinator.shutdown(SHUTDOWN_GRACE).await;
    Ok(())
}
