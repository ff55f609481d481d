//! The `cpu`, `memory` and `allocs` commands

use anyhow::Result;
use kprof_lib::{
    ClusterContext, ClusterOptions, KubePodDialer, KubePortResolver, Orchestrator, PortSource,
    ProfileKind, ProfileRequest, Target,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CliConfig;
use crate::output::{print_info, print_success, print_warning};
use crate::{Cli, ProfileArgs};

/// Capture a profile of the given kind and open it in the viewer
pub async fn run(cli: &Cli, kind: ProfileKind, args: &ProfileArgs, config: &CliConfig) -> Result<()> {
    let requested_namespace = config.namespace(cli.namespace.as_deref());
    let mut target = Target::new(
        requested_namespace.clone().unwrap_or_default(),
        args.pod.clone().unwrap_or_default(),
    )?;

    let launcher = config.launcher()?;
    let settings = config.tunnel_settings();

    let cluster = ClusterContext::connect(&ClusterOptions {
        kubeconfig: cli.kubeconfig.clone(),
        context: cli.context.clone(),
    })
    .await?;
    target.namespace = cluster.namespace_or_default(requested_namespace.as_deref());

    println!("{} profile on: {} {}", kind.segment(), target.namespace, target.pod);

    let request = ProfileRequest {
        target: target.clone(),
        kind,
        port: Some(cli.port).filter(|p| *p != 0),
        container: cli.container.clone(),
    };

    let orchestrator = Orchestrator::new(
        KubePortResolver::new(cluster.client()),
        KubePodDialer::new(cluster.client(), target),
        launcher,
        settings,
    );

    let selection = orchestrator.select_port(&request).await?;
    if let Some(warning) = selection.warning() {
        print_warning(&warning);
    }
    match &selection.source {
        PortSource::Explicit => debug!(port = selection.port, "Using explicit port"),
        PortSource::Detected { container, .. } => print_info(&format!(
            "Using port {} of container {}",
            selection.port, container
        )),
    }

    let interrupt = CancellationToken::new();
    cancel_on_signal(interrupt.clone());

    let summary = orchestrator
        .run_with_selection(&request, &selection, interrupt.clone())
        .await?;

    if interrupt.is_cancelled() {
        print_info("Interrupted, tunnel closed");
    } else {
        print_success(&format!(
            "Finished {} profile session for {}",
            summary.kind, summary.target
        ));
    }
    Ok(())
}

/// Cancel `token` on Ctrl-C or SIGTERM
fn cancel_on_signal(token: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received");
        token.cancel();
    });
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
